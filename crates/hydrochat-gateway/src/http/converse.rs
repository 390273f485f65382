//! Single conversational endpoint — POST /converse
//!
//! One request, one assistant reply. The conversation id keys the state
//! store; a null id starts a new conversation. `message_id` is accepted for
//! forward compatibility with idempotent retries but ignored by the core —
//! it must be omitted, null, or a non-empty string.
//!
//! Request:  `{"conversation_id": "..."|null, "message": "...", "message_id"?: "..."}`
//! Response: `{"conversation_id", "messages": [{role, content}],
//!             "agent_state": {intent, awaiting_confirmation, missing_fields},
//!             "agent_op": "CREATE"|"UPDATE"|"DELETE"|"NONE"}`

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use hydrochat_sessions::state::{AgentOp, Intent};

use crate::app::AppState;

#[derive(Deserialize)]
pub struct ConverseRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Serialize)]
pub struct ConverseResponse {
    pub conversation_id: String,
    pub messages: Vec<AssistantMessage>,
    pub agent_state: AgentState,
    pub agent_op: AgentOp,
}

#[derive(Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize)]
pub struct AgentState {
    pub intent: Intent,
    pub awaiting_confirmation: bool,
    pub missing_fields: Vec<String>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub async fn converse_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConverseRequest>,
) -> Result<Json<ConverseResponse>, (StatusCode, Json<ErrorBody>)> {
    if req.message.trim().is_empty() {
        return Err(validation("message cannot be empty"));
    }
    if let Some(message_id) = &req.message_id {
        if message_id.is_empty() {
            return Err(validation("message_id must be omitted, null, or non-empty"));
        }
    }

    let (conversation_id, entry) = state.store.get_or_create(req.conversation_id.as_deref());

    // Serializes turns for this conversation: a concurrent request for the
    // same id queues here until the first turn releases the lock.
    let output = {
        let mut conversation = entry.state.lock().await;
        match state.engine.run_turn(&mut conversation, &req.message).await {
            Ok(output) => {
                let agent_state = AgentState {
                    intent: conversation.intent,
                    awaiting_confirmation: conversation.confirmation_required,
                    missing_fields: conversation.pending_fields.iter().cloned().collect(),
                };
                (output, agent_state)
            }
            Err(e) => {
                error!(error = %e, %conversation_id, "turn failed");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "server",
                        detail: None,
                    }),
                ));
            }
        }
    };
    entry.touch();

    let (turn, agent_state) = output;
    state.timing.record(turn.elapsed_ms, turn.compute_ms);

    Ok(Json(ConverseResponse {
        conversation_id,
        messages: vec![AssistantMessage {
            role: "assistant",
            content: turn.reply,
        }],
        agent_state,
        agent_op: turn.agent_op,
    }))
}

fn validation(detail: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: "validation",
            detail: Some(detail.to_string()),
        }),
    )
}
