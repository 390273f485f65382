//! REST request envelope: one typed operation with a fixed retry schedule
//! and a masked call trace for every outcome.
//!
//! Retry policy:
//!   - at most two retries per logical call
//!   - eligible events: transport errors and HTTP 502/503/504
//!   - backoff 0.5 s after the first failure, 1.0 s after the second
//!   - POST is retried only while no response has ever been received;
//!     once any status arrives the write may have landed, so it is final
//!   - no retry on any other 4xx/5xx

use std::time::{Duration, Instant};

use reqwest::Method;
use tracing::debug;

use hydrochat_core::logfmt::{log_line, Category};
use hydrochat_core::nric::{mask_json, mask_text};
use hydrochat_core::types::{
    truncate_snapshot_body, ToolErrorSnapshot, ToolRequestSnapshot, ToolResponseSnapshot,
};

use crate::error::ToolError;

pub const MAX_RETRIES: u32 = 2;
const BACKOFF_SCHEDULE: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1000)];

/// Successful envelope outcome: status, raw body text, wall time.
#[derive(Debug, Clone)]
pub struct EnvelopeResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: u64,
}

/// Masked record of one logical call, success or failure. Stored verbatim in
/// conversation state by the tool-execution node.
#[derive(Debug, Clone)]
pub struct CallTrace {
    pub request: ToolRequestSnapshot,
    pub response: Option<ToolResponseSnapshot>,
    pub error: Option<ToolErrorSnapshot>,
    pub retries: u32,
    pub elapsed_ms: u64,
}

pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl RestClient {
    pub fn new(base_url: &str, auth_token: Option<&str>, timeout_seconds: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.map(str::to_owned),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    /// Execute one logical call. The returned trace is always populated;
    /// the result mirrors either `trace.response` or `trace.error`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        query: &[(&str, String)],
    ) -> (CallTrace, Result<EnvelopeResponse, ToolError>) {
        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let mut retries: u32 = 0;
        let mut response_seen = false;

        let (outcome, response_snapshot) = loop {
            attempt += 1;
            debug!(method = %method, %url, attempt, "dispatching backend request");

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .timeout(self.timeout);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(token) = &self.auth_token {
                builder = builder.bearer_auth(token);
            }
            if let Some(json) = body {
                builder = builder.json(json);
            }

            let failure = match builder.send().await {
                Ok(resp) => {
                    response_seen = true;
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if (200..300).contains(&status) {
                        let (stored, truncated) = truncate_snapshot_body(&mask_text(&text));
                        break (
                            Ok(EnvelopeResponse {
                                status,
                                body: text,
                                elapsed_ms,
                            }),
                            Some(ToolResponseSnapshot {
                                status,
                                body: stored,
                                truncated,
                                elapsed_ms,
                            }),
                        );
                    }
                    ToolError::Http { status, body: text }
                }
                Err(e) if e.is_timeout() => ToolError::Timeout,
                Err(e) => ToolError::Network(e.to_string()),
            };

            let may_retry = attempt <= MAX_RETRIES
                && failure.retryable()
                && (method != Method::POST || !response_seen);
            if !may_retry {
                break (Err(failure), None);
            }

            retries += 1;
            log_line(
                Category::Retry,
                &format!("{method} {path} failed ({failure}), retry {retries}/{MAX_RETRIES}"),
            );
            tokio::time::sleep(BACKOFF_SCHEDULE[(retries - 1) as usize]).await;
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let request_snapshot = ToolRequestSnapshot {
            method: method.to_string(),
            url: url.clone(),
            body: body.map(mask_json),
            attempt,
        };
        let error_snapshot = outcome.as_ref().err().map(|e| {
            let (status, raw_body) = match e {
                ToolError::Http { status, body } => (Some(*status), body.clone()),
                other => (None, other.to_string()),
            };
            let (stored, _) = truncate_snapshot_body(&mask_text(&raw_body));
            ToolErrorSnapshot {
                status,
                body: stored,
                retryable: e.retryable(),
            }
        });

        match &outcome {
            Ok(resp) => log_line(
                Category::Tool,
                &format!("{method} {path} -> {} in {}ms", resp.status, resp.elapsed_ms),
            ),
            Err(e) => log_line(Category::Error, &format!("{method} {path} failed: {e}")),
        }

        (
            CallTrace {
                request: request_snapshot,
                response: response_snapshot,
                error: error_snapshot,
                retries,
                elapsed_ms,
            },
            outcome,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_fixed_not_exponential() {
        assert_eq!(BACKOFF_SCHEDULE[0], Duration::from_millis(500));
        assert_eq!(BACKOFF_SCHEDULE[1], Duration::from_millis(1000));
        assert_eq!(MAX_RETRIES as usize, BACKOFF_SCHEDULE.len());
    }

    #[test]
    fn base_url_trailing_slash_normalized() {
        let client = RestClient::new("http://backend.local/", None, 10);
        assert_eq!(client.base_url, "http://backend.local");
    }
}
