//! The conversational orchestration engine: hybrid intent classification,
//! field extraction, name resolution, and the deterministic node graph that
//! turns a user message into exactly one assistant reply plus a CRUD hint.

pub mod anthropic;
pub mod classify;
pub mod error;
pub mod extract;
pub mod graph;
pub mod llm;
pub mod reply;
pub mod resolve;

pub use error::AgentError;
pub use graph::engine::{TurnEngine, TurnOutput};
pub use llm::{GenerateReply, GenerateRequest, LlmError, LlmProvider};
