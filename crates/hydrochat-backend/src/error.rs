use std::collections::BTreeMap;

use thiserror::Error;

/// Failure modes of a tool call, after the envelope's retry budget.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Patient not found")]
    NotFound,

    #[error("Validation failed: {}", field_error_summary(field_errors))]
    Validation {
        field_errors: BTreeMap<String, Vec<String>>,
    },

    #[error("Response decode error: {0}")]
    Decode(String),
}

impl ToolError {
    /// Whether the envelope may retry on this failure. Only transport faults
    /// and gateway statuses qualify; every other 4xx/5xx is final.
    pub fn retryable(&self) -> bool {
        match self {
            ToolError::Network(_) | ToolError::Timeout => true,
            ToolError::Http { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }
}

fn field_error_summary(field_errors: &BTreeMap<String, Vec<String>>) -> String {
    field_errors
        .iter()
        .map(|(field, msgs)| format!("{field}: {}", msgs.join("; ")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a DRF-style 400 body (`{"field": ["message", ...], ...}`) into a
/// field-error map. Returns `None` when the body has any other shape.
pub fn parse_field_errors(body: &str) -> Option<BTreeMap<String, Vec<String>>> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    let mut errors = BTreeMap::new();
    for (field, messages) in object {
        let list = messages.as_array()?;
        let msgs: Vec<String> = list
            .iter()
            .map(|m| m.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()?;
        errors.insert(field.clone(), msgs);
    }
    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_are_retryable() {
        for status in [502u16, 503, 504] {
            let err = ToolError::Http {
                status,
                body: String::new(),
            };
            assert!(err.retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400u16, 401, 404, 409, 500] {
            let err = ToolError::Http {
                status,
                body: String::new(),
            };
            assert!(!err.retryable(), "{status} should not be retryable");
        }
        assert!(!ToolError::NotFound.retryable());
    }

    #[test]
    fn transport_faults_are_retryable() {
        assert!(ToolError::Network("reset".into()).retryable());
        assert!(ToolError::Timeout.retryable());
    }

    #[test]
    fn parses_drf_field_errors() {
        let errors = parse_field_errors(r#"{"nric": ["already exists"]}"#).unwrap();
        assert_eq!(errors["nric"], vec!["already exists"]);
    }

    #[test]
    fn rejects_non_field_error_bodies() {
        assert!(parse_field_errors(r#"{"detail": "not found"}"#).is_none());
        assert!(parse_field_errors("plain text").is_none());
        assert!(parse_field_errors("{}").is_none());
    }
}
