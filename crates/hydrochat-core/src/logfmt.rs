//! Bracketed log taxonomy with boundary masking.
//!
//! Every taxonomy line is emitted as `[HydroChat][CATEGORY] message` through
//! `tracing`. NRIC masking and bearer-token redaction happen here, at the
//! formatter boundary, so no call site can leak an identifier by forgetting
//! to mask.

use once_cell::sync::OnceCell;

use crate::nric::mask_text;

/// Closed category set — one per observable event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Intent,
    Missing,
    Ambiguous,
    Confirm,
    Tool,
    Retry,
    Error,
    Success,
    Pagination,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Intent => "INTENT",
            Category::Missing => "MISSING",
            Category::Ambiguous => "AMBIGUOUS",
            Category::Confirm => "CONFIRM",
            Category::Tool => "TOOL",
            Category::Retry => "RETRY",
            Category::Error => "ERROR",
            Category::Success => "SUCCESS",
            Category::Pagination => "PAGINATION",
        }
    }
}

static BEARER_TOKEN: OnceCell<String> = OnceCell::new();

/// Register the backend bearer token for redaction. Called once at startup;
/// later calls are no-ops.
pub fn register_bearer_token(token: &str) {
    if !token.is_empty() {
        let _ = BEARER_TOKEN.set(token.to_string());
    }
}

/// Apply the full masking policy to an arbitrary string.
pub fn mask_for_log(message: &str) -> String {
    let masked = mask_text(message);
    match BEARER_TOKEN.get() {
        Some(token) => masked.replace(token.as_str(), "[REDACTED]"),
        None => masked,
    }
}

/// Emit one taxonomy line. ERROR and RETRY go out at warn level, everything
/// else at info.
pub fn log_line(category: Category, message: &str) {
    let masked = mask_for_log(message);
    match category {
        Category::Error | Category::Retry => {
            tracing::warn!(target: "hydrochat", "[HydroChat][{}] {}", category.as_str(), masked);
        }
        _ => {
            tracing::info!(target: "hydrochat", "[HydroChat][{}] {}", category.as_str(), masked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_for_log_masks_nric() {
        let masked = mask_for_log("created patient with NRIC S1234567A");
        assert!(!masked.contains("S1234567A"));
        assert!(masked.contains("S******7A"));
    }

    #[test]
    fn categories_render_uppercase() {
        assert_eq!(Category::Pagination.as_str(), "PAGINATION");
        assert_eq!(Category::Intent.as_str(), "INTENT");
    }

    #[test]
    fn bearer_token_redacted_once_registered() {
        register_bearer_token("tok-super-secret");
        let masked = mask_for_log("Authorization: Bearer tok-super-secret sent");
        assert!(!masked.contains("tok-super-secret"));
        assert!(masked.contains("[REDACTED]"));
    }
}
