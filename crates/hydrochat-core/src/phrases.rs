//! Fixed utterance sets for cancellation and confirmation handling.
//!
//! Matching is deliberately exact (trimmed, lowercased, trailing punctuation
//! stripped) — a confirmation gate must never be satisfied by a sentence
//! that merely contains "yes" somewhere.

pub const CANCEL_WORDS: &[&str] = &["cancel", "abort", "stop"];
pub const AFFIRMATIVE_WORDS: &[&str] = &["yes", "y", "confirm", "proceed"];
pub const NEGATIVE_WORDS: &[&str] = &["no", "n", "cancel", "abort"];

fn normalize(utterance: &str) -> String {
    utterance
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase()
}

pub fn is_cancellation(utterance: &str) -> bool {
    let norm = normalize(utterance);
    CANCEL_WORDS.contains(&norm.as_str())
}

pub fn is_affirmative(utterance: &str) -> bool {
    let norm = normalize(utterance);
    AFFIRMATIVE_WORDS.contains(&norm.as_str())
}

pub fn is_negative(utterance: &str) -> bool {
    let norm = normalize(utterance);
    NEGATIVE_WORDS.contains(&norm.as_str())
}
