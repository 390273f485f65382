//! NRIC validation and masking.
//!
//! The agent-side policy is stricter than the backend (which accepts any
//! value up to 9 characters): a well-formed NRIC is one uppercase prefix
//! letter from {S, T, F, G}, seven digits, and one uppercase checksum letter.
//! Masking replaces the middle six characters with asterisks and is applied
//! at every external boundary — logs, tool snapshots, and replies.

use once_cell::sync::Lazy;
use regex::Regex;

/// Full-string validation pattern.
pub static NRIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[STFG]\d{7}[A-Z]$").unwrap());

/// Scan pattern for NRIC-shaped tokens embedded in free text.
static NRIC_SCAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[STFG]\d{7}[A-Z]\b").unwrap());

pub fn is_valid_nric(value: &str) -> bool {
    NRIC_RE.is_match(value)
}

/// Mask a single NRIC: first char + six asterisks + last two.
///
/// `S1234567A` → `S******7A`. Values that are not 9 characters long (the
/// backend tolerates them) keep only their first character.
pub fn mask_nric(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() == 9 {
        let tail: String = chars[7..].iter().collect();
        format!("{}******{}", chars[0], tail)
    } else if chars.is_empty() {
        String::new()
    } else {
        format!("{}{}", chars[0], "*".repeat(chars.len().saturating_sub(1)))
    }
}

/// Mask every NRIC-shaped token in `text`. Safe to apply repeatedly.
pub fn mask_text(text: &str) -> String {
    NRIC_SCAN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| mask_nric(&caps[0]))
        .into_owned()
}

/// Recursively mask NRIC-shaped strings inside a JSON value.
///
/// Used on request/response bodies before they are stored in tool snapshots,
/// so raw identifiers never persist in state regardless of which key the
/// backend put them under.
pub fn mask_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(mask_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(mask_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_nric_accepted() {
        assert!(is_valid_nric("S1234567A"));
        assert!(is_valid_nric("T0000001Z"));
        assert!(is_valid_nric("F7654321B"));
        assert!(is_valid_nric("G1111111C"));
    }

    #[test]
    fn invalid_nric_rejected() {
        assert!(!is_valid_nric("A1234567A")); // bad prefix
        assert!(!is_valid_nric("S123456A")); // six digits
        assert!(!is_valid_nric("S12345678")); // digit checksum
        assert!(!is_valid_nric("s1234567a")); // lowercase
        assert!(!is_valid_nric(" S1234567A")); // leading space
        assert!(!is_valid_nric(""));
    }

    #[test]
    fn mask_standard_nric() {
        assert_eq!(mask_nric("S1234567A"), "S******7A");
    }

    #[test]
    fn mask_nonstandard_length_keeps_first_char_only() {
        assert_eq!(mask_nric("S12345"), "S*****");
        assert_eq!(mask_nric(""), "");
    }

    #[test]
    fn mask_text_replaces_embedded_nrics() {
        let masked = mask_text("patient S1234567A and T7654321Z registered");
        assert_eq!(masked, "patient S******7A and T******1Z registered");
    }

    #[test]
    fn mask_text_is_idempotent() {
        let once = mask_text("S1234567A");
        assert_eq!(mask_text(&once), once);
    }

    #[test]
    fn mask_json_masks_nested_strings() {
        let body = serde_json::json!({
            "nric": "S1234567A",
            "nested": {"note": "ref S7654321B"},
            "list": ["T0000001Z"],
            "count": 3,
        });
        let masked = mask_json(&body);
        assert_eq!(masked["nric"], "S******7A");
        assert_eq!(masked["nested"]["note"], "ref S******1B");
        assert_eq!(masked["list"][0], "T******1Z");
        assert_eq!(masked["count"], 3);
    }
}
