//! Deterministic field extraction, step by step: NRIC, patient reference,
//! two-token capitalized name after a verb, contact number, date of birth,
//! free-text details. Each step is independent; the LLM fallback fills only
//! fields the rules could not.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use hydrochat_core::nric::is_valid_nric;
use hydrochat_sessions::state::Intent;

static NRIC_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[STFG]\d{7}[A-Z]\b").unwrap());
/// NRIC-shaped attempts that fail the strict policy (wrong prefix, lowercase,
/// digit checksum) — they trigger a format-hint re-ask instead of silence.
static NRIC_ATTEMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z]\d{7}[A-Za-z0-9]\b").unwrap());
static PATIENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bpatient\s+#?(\d+)\b").unwrap());
static BARE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*#?(\d+)\s*$").unwrap());
static NAME_AFTER_VERB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?i:patient|create|add|new|update|edit|modify|change|delete|remove|del|for|of))\s+([A-Z][a-z]+(?:-[A-Z][a-z]+)?)\s+([A-Z][a-z]+(?:-[A-Z][a-z]+)?)",
    )
    .unwrap()
});
static BARE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Z][a-z]+(?:-[A-Z][a-z]+)?)\s+([A-Z][a-z]+(?:-[A-Z][a-z]+)?)\s*$").unwrap()
});
static SINGLE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(?i:patient))\s+([A-Z][a-z]+(?:-[A-Z][a-z]+)?)\b").unwrap()
});
static DOB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap());
static DOB_KEYWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(dob|date of birth|born)\b").unwrap());
static CONTACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\+\d{1,3}[\s-]?)?\d[\d\s-]{5,14}\d").unwrap());
static DETAILS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdetails?\s*[:\-]?\s+(.+)$").unwrap());

/// Tokens that look like capitalized names but are command vocabulary.
const RESERVED_NAME_TOKENS: &[&str] = &[
    "patient", "patients", "new", "scan", "scans", "result", "results", "details", "contact",
    "nric", "name", "show", "list", "get", "create", "add", "update", "edit", "delete", "remove",
];

/// How the user referred to a patient this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum PatientRef {
    Id(i64),
    Name(String),
}

/// Result of the deterministic pass over one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Raw field name → raw string value, exactly as parsed.
    pub fields: BTreeMap<String, String>,
    pub patient_ref: Option<PatientRef>,
    /// An NRIC-shaped token was present but failed the policy.
    pub invalid_nric: bool,
    /// A date-of-birth attempt was present but not a valid `YYYY-MM-DD`.
    pub invalid_dob: bool,
}

pub fn extract_from_message(message: &str, intent: Intent) -> Extraction {
    let mut out = Extraction::default();

    // Step 1: NRIC.
    if let Some(m) = NRIC_TOKEN_RE.find(message) {
        out.fields.insert("nric".to_string(), m.as_str().to_string());
    } else if NRIC_ATTEMPT_RE
        .find_iter(message)
        .any(|m| !is_valid_nric(m.as_str()))
    {
        out.invalid_nric = true;
    }

    // Step 2: numeric patient reference ("patient 5", or a bare "12" reply).
    if let Some(caps) = PATIENT_ID_RE.captures(message) {
        if let Ok(id) = caps[1].parse::<i64>() {
            out.patient_ref = Some(PatientRef::Id(id));
        }
    } else if let Some(caps) = BARE_ID_RE.captures(message) {
        if let Ok(id) = caps[1].parse::<i64>() {
            out.patient_ref = Some(PatientRef::Id(id));
        }
    }

    // Step 3: two-token capitalized name after a verb (or alone).
    if let Some((first, last)) = find_name(message) {
        if intent == Intent::CreatePatient {
            out.fields.insert("first_name".to_string(), first);
            out.fields.insert("last_name".to_string(), last);
        } else if out.patient_ref.is_none() {
            out.patient_ref = Some(PatientRef::Name(format!("{first} {last}")));
        }
    } else if intent == Intent::CreatePatient {
        // "Add patient Alice" gives a first name; the last name is asked for.
        if let Some(caps) = SINGLE_NAME_RE.captures(message) {
            let first = caps[1].to_string();
            if !is_reserved(&first) {
                out.fields.insert("first_name".to_string(), first);
            }
        }
    }

    // Step 4: date of birth. The working copy has NRIC tokens, patient
    // references, and dates blanked so none of them reads as a phone number.
    let mut working = NRIC_TOKEN_RE.replace_all(message, " ").into_owned();
    working = PATIENT_ID_RE.replace_all(&working, " ").into_owned();
    match DOB_RE.captures(message) {
        Some(caps) => {
            let raw = caps[1].to_string();
            if NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_ok() {
                working = working.replace(&raw, " ");
                out.fields.insert("date_of_birth".to_string(), raw);
            } else {
                working = working.replace(&raw, " ");
                out.invalid_dob = true;
            }
        }
        None => {
            if DOB_KEYWORD_RE.is_match(message) {
                out.invalid_dob = true;
            }
        }
    }

    // Step 5: contact number — at least seven digits once separators drop.
    for m in CONTACT_RE.find_iter(&working) {
        let normalized = normalize_contact(m.as_str());
        let digits = normalized.trim_start_matches('+').len();
        if digits >= 7 {
            out.fields.insert("contact_no".to_string(), normalized);
            break;
        }
    }

    // Step 6: trailing free text after a "details" keyword.
    if let Some(caps) = DETAILS_RE.captures(message) {
        let text = caps[1].trim();
        if !text.is_empty() {
            out.fields.insert("details".to_string(), text.to_string());
        }
    }

    out
}

fn find_name(message: &str) -> Option<(String, String)> {
    for caps in NAME_AFTER_VERB_RE.captures_iter(message) {
        let first = caps[1].to_string();
        let last = caps[2].to_string();
        if !is_reserved(&first) && !is_reserved(&last) {
            return Some((first, last));
        }
    }
    let caps = BARE_NAME_RE.captures(message)?;
    let first = caps[1].to_string();
    let last = caps[2].to_string();
    if is_reserved(&first) || is_reserved(&last) {
        return None;
    }
    Some((first, last))
}

fn is_reserved(token: &str) -> bool {
    RESERVED_NAME_TOKENS.contains(&token.to_lowercase().as_str())
}

/// Strip separators, keeping a leading `+country`.
fn normalize_contact(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut normalized = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        if c.is_ascii_digit() || (c == '+' && i == 0) {
            normalized.push(c);
        }
    }
    normalized
}

/// Interpret a short follow-up reply as the value of the single field we
/// asked for. Returns `None` when the reply doesn't plausibly answer the
/// question (so it falls through to normal classification).
pub fn assign_bare_value(field: &str, message: &str) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }
    match field {
        "nric" => is_valid_nric(trimmed).then(|| trimmed.to_string()),
        "date_of_birth" => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .map(|_| trimmed.to_string()),
        "contact_no" => {
            let normalized = normalize_contact(trimmed);
            (normalized.trim_start_matches('+').len() >= 7
                && normalized.trim_start_matches('+').chars().all(|c| c.is_ascii_digit()))
            .then_some(normalized)
        }
        "first_name" | "last_name" => {
            let word_count = trimmed.split_whitespace().count();
            (word_count == 1 && trimmed.chars().all(|c| c.is_alphabetic() || c == '-'))
                .then(|| trimmed.to_string())
        }
        "details" => Some(trimmed.to_string()),
        _ => None,
    }
}

/// Prompt for the extraction fallback, scoped to the fields still missing.
pub fn build_extract_prompt(message: &str, missing: &[String]) -> String {
    format!(
        "Extract patient fields from one clinician message.\n\
         Reply with a single JSON object and nothing else, using only these \
         keys when present in the message: {}.\n\
         NRIC format: one of S/T/F/G, seven digits, one uppercase letter. \
         date_of_birth format: YYYY-MM-DD. Omit keys you cannot find.\n\
         \nMessage:\n{}",
        missing.join(", "),
        message
    )
}

/// Merge the fallback reply: only requested string-valued keys are taken.
pub fn parse_extract_reply(text: &str, missing: &[String]) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let Some(value) = crate::llm::extract_json_object(text) else {
        return fields;
    };
    let Some(object) = value.as_object() else {
        return fields;
    };
    for key in missing {
        if let Some(v) = object.get(key).and_then(|v| v.as_str()) {
            if !v.trim().is_empty() {
                fields.insert(key.clone(), v.trim().to_string());
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_extracts_name_and_nric() {
        let out = extract_from_message("Create patient Jane Tan S1234567A", Intent::CreatePatient);
        assert_eq!(out.fields.get("first_name").map(String::as_str), Some("Jane"));
        assert_eq!(out.fields.get("last_name").map(String::as_str), Some("Tan"));
        assert_eq!(out.fields.get("nric").map(String::as_str), Some("S1234567A"));
    }

    #[test]
    fn add_new_patient_skips_command_words() {
        let out = extract_from_message("Add new patient John Doe", Intent::CreatePatient);
        assert_eq!(out.fields.get("first_name").map(String::as_str), Some("John"));
        assert_eq!(out.fields.get("last_name").map(String::as_str), Some("Doe"));
    }

    #[test]
    fn delete_name_becomes_patient_ref() {
        let out = extract_from_message("Delete patient John Lee", Intent::DeletePatient);
        assert_eq!(out.patient_ref, Some(PatientRef::Name("John Lee".into())));
        assert!(out.fields.is_empty());
    }

    #[test]
    fn numeric_reference_wins_over_name() {
        let out = extract_from_message("Show scans for patient 5", Intent::GetScanResults);
        assert_eq!(out.patient_ref, Some(PatientRef::Id(5)));
    }

    #[test]
    fn bare_id_reply_is_a_reference() {
        let out = extract_from_message("12", Intent::DeletePatient);
        assert_eq!(out.patient_ref, Some(PatientRef::Id(12)));
    }

    #[test]
    fn invalid_nric_shape_is_flagged_not_stored() {
        let out = extract_from_message("nric is A1234567A", Intent::CreatePatient);
        assert!(out.fields.get("nric").is_none());
        assert!(out.invalid_nric);
    }

    #[test]
    fn valid_dob_extracted() {
        let out = extract_from_message("dob 1984-02-29", Intent::CreatePatient);
        assert_eq!(out.fields.get("date_of_birth").map(String::as_str), Some("1984-02-29"));
        assert!(!out.invalid_dob);
    }

    #[test]
    fn impossible_date_flags_reask() {
        let out = extract_from_message("dob 2026-13-40", Intent::CreatePatient);
        assert!(out.fields.get("date_of_birth").is_none());
        assert!(out.invalid_dob);
    }

    #[test]
    fn dob_keyword_without_value_flags_reask() {
        let out = extract_from_message("date of birth is 14/07/1984", Intent::CreatePatient);
        assert!(out.invalid_dob);
    }

    #[test]
    fn contact_normalized_to_digits() {
        let out = extract_from_message("contact 9123-4567", Intent::CreatePatient);
        assert_eq!(out.fields.get("contact_no").map(String::as_str), Some("91234567"));
    }

    #[test]
    fn contact_keeps_country_prefix() {
        let out = extract_from_message("call +65 9123 4567", Intent::CreatePatient);
        assert_eq!(out.fields.get("contact_no").map(String::as_str), Some("+6591234567"));
    }

    #[test]
    fn date_is_not_mistaken_for_contact() {
        let out = extract_from_message("dob 1984-02-29", Intent::CreatePatient);
        assert!(out.fields.get("contact_no").is_none());
    }

    #[test]
    fn nric_digits_are_not_mistaken_for_contact() {
        let out = extract_from_message("Create patient Jane Tan S1234567A", Intent::CreatePatient);
        assert!(out.fields.get("contact_no").is_none());
    }

    #[test]
    fn details_keyword_captures_trailing_text() {
        let out = extract_from_message(
            "create patient Jane Tan S1234567A details allergic to penicillin",
            Intent::CreatePatient,
        );
        assert_eq!(
            out.fields.get("details").map(String::as_str),
            Some("allergic to penicillin")
        );
    }

    #[test]
    fn single_name_after_patient_keyword_is_first_name() {
        let out = extract_from_message("Add patient Alice", Intent::CreatePatient);
        assert_eq!(out.fields.get("first_name").map(String::as_str), Some("Alice"));
        assert!(out.fields.get("last_name").is_none());
    }

    #[test]
    fn patient_id_is_not_mistaken_for_contact() {
        let out = extract_from_message("Show scans for patient 1234567", Intent::GetScanResults);
        assert_eq!(out.patient_ref, Some(PatientRef::Id(1234567)));
        assert!(out.fields.get("contact_no").is_none());
    }

    #[test]
    fn bare_nric_reply_assigns_pending_field() {
        assert_eq!(assign_bare_value("nric", " S1234567A "), Some("S1234567A".into()));
        assert_eq!(assign_bare_value("nric", "invalid"), None);
    }

    #[test]
    fn bare_name_reply_assigns_single_token_fields() {
        assert_eq!(assign_bare_value("last_name", "Smith"), Some("Smith".into()));
        assert_eq!(assign_bare_value("last_name", "Smith Jones Extra"), None);
    }

    #[test]
    fn extract_fallback_takes_only_requested_keys() {
        let missing = vec!["nric".to_string()];
        let fields = parse_extract_reply(
            r#"{"nric": "S1234567A", "first_name": "Sneaky"}"#,
            &missing,
        );
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("nric").map(String::as_str), Some("S1234567A"));
    }
}
