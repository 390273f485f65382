use thiserror::Error;

/// Failures that abort a turn. Almost everything user-facing is handled
/// inside the graph (degraded replies, re-asks); what remains here are
/// developer errors that must fail loudly.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid graph transition: {node:?} emitted {token:?}")]
    InvalidTransition {
        node: crate::graph::token::NodeId,
        token: crate::graph::token::NodeToken,
    },

    #[error("internal error: {0}")]
    Internal(String),
}
