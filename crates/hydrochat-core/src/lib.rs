//! Shared foundation for the HydroChat workspace: configuration, the NRIC
//! policy, the LLM-input sanitizer, phrase sets, the log taxonomy, and the
//! wire/domain types every other crate exchanges.

pub mod config;
pub mod error;
pub mod logfmt;
pub mod nric;
pub mod phrases;
pub mod sanitize;
pub mod types;

pub use error::{CoreError, Result};
