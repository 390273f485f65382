//! Sanitizer applied to user text before any outbound LLM call.
//!
//! Three passes, in order: collapse literal escape sequences to spaces,
//! replace injection markers with `[FILTERED]` (detection and replacement
//! both case-insensitive), truncate to the configured maximum. The whole
//! pipeline is idempotent: sanitize(sanitize(x)) == sanitize(x).

use once_cell::sync::Lazy;
use regex::Regex;

pub const FILTERED: &str = "[FILTERED]";

/// Literal escape sequences (a backslash followed by n/r/t/0) plus raw
/// control characters. Either form can smuggle role framing into a prompt.
static ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[nrt0]|[\x00-\x1F\x7F]").unwrap());

/// Injection markers: role prefixes and the classic override phrase, plus a
/// small set of assistant-role tags seen in chat-template formats.
static INJECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)system:|ignore previous instructions|assistant:|<\|assistant\|>|\[assistant\]",
    )
    .unwrap()
});

/// Sanitize `text` for LLM consumption, bounding it to `max_chars`.
pub fn sanitize_for_llm(text: &str, max_chars: usize) -> String {
    let collapsed = ESCAPE_RE.replace_all(text, " ");
    let filtered = INJECTION_RE.replace_all(&collapsed, FILTERED);
    truncate_chars(&filtered, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    text.chars().take(max_chars).collect()
}
