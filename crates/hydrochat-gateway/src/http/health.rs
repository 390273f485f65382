use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe with store and timing counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.store.get_stats();
    let timing = state.timing.stats();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_conversations": store.active_conversations,
        "max_conversations": store.max_conversations,
        "conversation_ttl_seconds": store.ttl_seconds,
        "turns_recorded": timing.turns_recorded,
        "avg_turn_ms": timing.avg_turn_ms,
        "slow_turns": timing.slow_turns,
    }))
}
