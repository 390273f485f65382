use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Required fields default to the `HYDRO_`-prefixed environment variables,
/// with the bare `BASE_URL` / `AUTH_TOKEN` names accepted as fallbacks for
/// deployments that predate the prefix.
pub const ENV_PREFIX: &str = "HYDRO_";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8780;
pub const DEFAULT_LLM_MAX_INPUT_CHARS: usize = 1000;
pub const DEFAULT_STORE_TTL_SECONDS: u64 = 2 * 60 * 60;
pub const DEFAULT_STORE_MAX_CONVERSATIONS: usize = 1000;
pub const DEFAULT_TIMING_MAX_SAMPLES: usize = 1000;
pub const DEFAULT_TIMING_RETENTION_SECONDS: u64 = 24 * 60 * 60;

/// Top-level config (hydrochat.toml + HYDRO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydroConfig {
    /// Absolute HTTP/HTTPS base URL of the patient-records backend.
    pub base_url: String,
    /// Opaque bearer token for the backend. Never logged.
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Listen address of the HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// LLM provider settings. The provider is optional: without an API key the
/// classifier runs regex-only and unmatched messages collapse to UNKNOWN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// USD per million prompt tokens.
    #[serde(default)]
    pub input_rate_per_mtok: f64,
    /// USD per million completion tokens.
    #[serde(default)]
    pub output_rate_per_mtok: f64,
    /// Maximum characters of user text forwarded to the provider.
    #[serde(default = "default_llm_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            input_rate_per_mtok: 0.0,
            output_rate_per_mtok: 0.0,
            max_input_chars: default_llm_max_input_chars(),
        }
    }
}

/// Conversation store limits: per-entry idle TTL and an LRU cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_store_max_conversations")]
    pub max_conversations: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_store_ttl_seconds(),
            max_conversations: default_store_max_conversations(),
        }
    }
}

/// Retention limits for the turn-duration sample buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_timing_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_timing_retention_seconds")]
    pub retention_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_samples: default_timing_max_samples(),
            retention_seconds: default_timing_retention_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_llm_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_llm_max_input_chars() -> usize {
    DEFAULT_LLM_MAX_INPUT_CHARS
}
fn default_store_ttl_seconds() -> u64 {
    DEFAULT_STORE_TTL_SECONDS
}
fn default_store_max_conversations() -> usize {
    DEFAULT_STORE_MAX_CONVERSATIONS
}
fn default_timing_max_samples() -> usize {
    DEFAULT_TIMING_MAX_SAMPLES
}
fn default_timing_retention_seconds() -> u64 {
    DEFAULT_TIMING_RETENTION_SECONDS
}

/// Figment extraction target — `base_url` optional here so the bare-env
/// fallback can fill it before validation.
#[derive(Debug, Deserialize)]
struct RawConfig {
    base_url: Option<String>,
    auth_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    llm: LlmConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    timing: TimingConfig,
}

impl HydroConfig {
    /// Load config from a TOML file with HYDRO_* env var overrides.
    ///
    /// Nested sections use a double-underscore separator, e.g.
    /// `HYDRO_LLM__API_KEY` sets `llm.api_key`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        let raw: RawConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let base_url = raw
            .base_url
            .or_else(|| std::env::var("BASE_URL").ok())
            .ok_or_else(|| {
                CoreError::Config("base_url is required (HYDRO_BASE_URL or BASE_URL)".to_string())
            })?;
        let auth_token = raw.auth_token.or_else(|| std::env::var("AUTH_TOKEN").ok());

        let mut llm = raw.llm;
        if llm.max_input_chars == 0 {
            llm.max_input_chars = DEFAULT_LLM_MAX_INPUT_CHARS;
        }

        let config = Self {
            base_url,
            auth_token,
            timeout_seconds: raw.timeout_seconds,
            gateway: raw.gateway,
            llm,
            store: raw.store,
            timing: raw.timing,
        };
        config.validate()?;
        Ok(config)
    }

    /// Runtime field override — debug builds only, for test harnesses that
    /// point the agent at a local fixture backend.
    #[cfg(debug_assertions)]
    pub fn override_base_url(&mut self, base_url: impl Into<String>) -> Result<()> {
        self.base_url = base_url.into();
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(CoreError::Config(format!(
                "base_url must be an absolute http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(CoreError::Config("timeout_seconds must be > 0".to_string()));
        }
        Ok(())
    }

    /// Redacted copy safe to expose in state and logs.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.as_deref().map(redact_token),
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Redacted view of the runtime config. The token keeps its first four
/// characters so operators can tell credentials apart without disclosure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_seconds: u64,
}

pub fn redact_token(token: &str) -> String {
    let head: String = token.chars().take(4).collect();
    format!("{head}***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_first_four_chars() {
        assert_eq!(redact_token("sk-abcdef123"), "sk-a***");
    }

    #[test]
    fn redact_short_token_does_not_panic() {
        assert_eq!(redact_token("ab"), "ab***");
    }

    #[test]
    fn snapshot_redacts_token() {
        let config = HydroConfig {
            base_url: "https://backend.local".to_string(),
            auth_token: Some("secret-token-value".to_string()),
            timeout_seconds: 10,
            gateway: GatewayConfig::default(),
            llm: LlmConfig::default(),
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
        };
        let snap = config.snapshot();
        assert_eq!(snap.auth_token.as_deref(), Some("secr***"));
        assert!(!format!("{snap:?}").contains("secret-token-value"));
    }

    #[test]
    fn validate_rejects_relative_base_url() {
        let config = HydroConfig {
            base_url: "backend.local/api".to_string(),
            auth_token: None,
            timeout_seconds: 10,
            gateway: GatewayConfig::default(),
            llm: LlmConfig::default(),
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_contract() {
        let llm = LlmConfig::default();
        assert_eq!(llm.max_input_chars, 1000);
        let store = StoreConfig::default();
        assert_eq!(store.ttl_seconds, 7200);
        assert_eq!(store.max_conversations, 1000);
        let timing = TimingConfig::default();
        assert_eq!(timing.max_samples, 1000);
        assert_eq!(timing.retention_seconds, 86400);
    }
}
