//! Typed access to the patient-records REST backend: the retrying request
//! envelope and the six tool operations the conversation graph may invoke.

pub mod api;
pub mod envelope;
pub mod error;

pub use api::{HttpPatientApi, PatientApi, ToolReply};
pub use envelope::{CallTrace, EnvelopeResponse, RestClient};
pub use error::ToolError;
