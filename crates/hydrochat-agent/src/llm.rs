//! LLM provider seam.
//!
//! The provider is a single capability: text in, one JSON object out, plus
//! accurate token usage from the provider's own response metadata. Token
//! counts are never estimated client-side; when a provider omits them they
//! stay zero.

use async_trait::async_trait;

/// Request to the provider. `prompt` has already been through the sanitizer.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: u32,
}

/// Provider reply with usage as reported by the provider.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateReply, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Turn cost in USD from actual token counts and configured per-million
/// rates.
pub fn llm_cost_usd(
    prompt_tokens: u64,
    completion_tokens: u64,
    input_rate_per_mtok: f64,
    output_rate_per_mtok: f64,
) -> f64 {
    (prompt_tokens as f64 / 1_000_000.0) * input_rate_per_mtok
        + (completion_tokens as f64 / 1_000_000.0) * output_rate_per_mtok
}

/// Extract the first JSON object from provider text, tolerating code fences
/// and prose around it.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
