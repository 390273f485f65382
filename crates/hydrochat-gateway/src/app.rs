use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use hydrochat_agent::anthropic::AnthropicProvider;
use hydrochat_agent::{LlmProvider, TurnEngine};
use hydrochat_backend::{HttpPatientApi, RestClient};
use hydrochat_core::config::HydroConfig;
use hydrochat_sessions::ConversationStore;

use crate::timing::TurnTimings;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: HydroConfig,
    pub store: ConversationStore,
    pub engine: TurnEngine,
    pub timing: TurnTimings,
}

impl AppState {
    pub fn new(config: HydroConfig) -> Self {
        let rest = RestClient::new(
            &config.base_url,
            config.auth_token.as_deref(),
            config.timeout_seconds,
        );
        let api = Arc::new(HttpPatientApi::new(rest));

        // Without an API key the classifier runs regex-only.
        let llm: Option<Arc<dyn LlmProvider>> = config.llm.api_key.as_ref().map(|key| {
            Arc::new(AnthropicProvider::new(
                key.clone(),
                config.llm.base_url.clone(),
                config.llm.model.clone(),
            )) as Arc<dyn LlmProvider>
        });

        let store = ConversationStore::new(&config.store, config.snapshot());
        let engine = TurnEngine::new(api, llm, config.llm.clone());
        let timing = TurnTimings::new(&config.timing);

        Self {
            config,
            store,
            engine,
            timing,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/converse", post(crate::http::converse::converse_handler))
        .route("/health", get(crate::http::health::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
