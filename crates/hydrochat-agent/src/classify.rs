//! Hybrid intent classification: deterministic regex rules first, LLM
//! fallback second. The regex layer is the source of truth — the LLM is
//! consulted only when no rule fires, and anything outside the intent enum
//! collapses to UNKNOWN.

use once_cell::sync::Lazy;
use regex::Regex;

use hydrochat_sessions::state::Intent;

static CREATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(create|add|new)\s+patient\b").unwrap());
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(update|change|modify|edit)\s+(patient|contact|nric|name|details)\b")
        .unwrap()
});
static DELETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(delete|remove|del)\s+patient\b").unwrap());
static LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(list|show|all)\s+patients\b").unwrap());
static SCAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(show|list|get)\b.*\b(scan|result)s?\b").unwrap());
static DETAILS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(show|get)\b.*\bpatient\b").unwrap());
static SCAN_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bscans?\b").unwrap());

/// Apply the deterministic rule table. `None` means no rule fired and the
/// LLM fallback decides.
pub fn classify_by_rules(message: &str) -> Option<Intent> {
    if LIST_RE.is_match(message) {
        return Some(Intent::ListPatients);
    }
    if CREATE_RE.is_match(message) {
        return Some(Intent::CreatePatient);
    }
    if UPDATE_RE.is_match(message) {
        return Some(Intent::UpdatePatient);
    }
    if DELETE_RE.is_match(message) {
        return Some(Intent::DeletePatient);
    }
    if SCAN_RE.is_match(message) {
        return Some(Intent::GetScanResults);
    }
    // GET_PATIENT_DETAILS only fires when no scan keyword is present.
    if DETAILS_RE.is_match(message) && !SCAN_KEYWORD_RE.is_match(message) {
        return Some(Intent::GetPatientDetails);
    }
    None
}

/// Whether any rule fires — used to let a fresh command interrupt a pending
/// disambiguation.
pub fn matches_any_rule(message: &str) -> bool {
    classify_by_rules(message).is_some()
}

pub const INTENT_NAMES: &[&str] = &[
    "CREATE_PATIENT",
    "UPDATE_PATIENT",
    "DELETE_PATIENT",
    "LIST_PATIENTS",
    "GET_PATIENT_DETAILS",
    "GET_SCAN_RESULTS",
    "UNKNOWN",
];

/// Prompt for the classification fallback. `message` must already be
/// sanitized; context and summary come from state.
pub fn build_classify_prompt(message: &str, recent_context: &str, history_summary: &str) -> String {
    let mut prompt = format!(
        "You classify one clinician message for a patient-records assistant.\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"intent\": <one of {}>, \"reason\": <short string>}}\n",
        INTENT_NAMES.join(", ")
    );
    if !history_summary.is_empty() {
        prompt.push_str("\nConversation summary:\n");
        prompt.push_str(history_summary);
        prompt.push('\n');
    }
    if !recent_context.is_empty() {
        prompt.push_str("\nRecent messages:\n");
        prompt.push_str(recent_context);
        prompt.push('\n');
    }
    prompt.push_str("\nMessage:\n");
    prompt.push_str(message);
    prompt
}

/// Parse the fallback reply. Any shape or value outside the enum collapses
/// to UNKNOWN.
pub fn parse_intent_reply(text: &str) -> Intent {
    let Some(value) = crate::llm::extract_json_object(text) else {
        return Intent::Unknown;
    };
    match value.get("intent").and_then(|v| v.as_str()) {
        Some("CREATE_PATIENT") => Intent::CreatePatient,
        Some("UPDATE_PATIENT") => Intent::UpdatePatient,
        Some("DELETE_PATIENT") => Intent::DeletePatient,
        Some("LIST_PATIENTS") => Intent::ListPatients,
        Some("GET_PATIENT_DETAILS") => Intent::GetPatientDetails,
        Some("GET_SCAN_RESULTS") => Intent::GetScanResults,
        _ => Intent::Unknown,
    }
}
