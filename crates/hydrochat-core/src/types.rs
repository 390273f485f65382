//! Wire and domain types shared across the workspace.

use serde::{Deserialize, Serialize};

use crate::nric::mask_nric;

/// Response bodies longer than this many bytes are truncated before being
/// stored in a snapshot.
pub const SNAPSHOT_BODY_LIMIT_BYTES: usize = 3 * 1024;
/// Characters kept when a snapshot body is truncated.
pub const SNAPSHOT_BODY_KEEP_CHARS: usize = 512;

/// A patient record as returned by the backend.
///
/// `nric` is raw here — it must never reach a log line or snapshot without
/// passing through the masking helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub nric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Read-only backend owner key; stripped before any PUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<i64>,
}

impl Patient {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn masked_nric(&self) -> String {
        mask_nric(&self.nric)
    }
}

/// Payload for POST /api/patients/ and, post-merge, PUT /api/patients/{id}/.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientPayload {
    pub first_name: String,
    pub last_name: String,
    pub nric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// One wound-scan record. The backend orders listings by descending
/// creation time; the agent preserves that order in its buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: i64,
    pub patient: i64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stl_file: Option<String>,
}

impl ScanResult {
    /// Date portion of the creation timestamp (`YYYY-MM-DD`).
    pub fn created_date(&self) -> &str {
        self.created_at.get(..10).unwrap_or(&self.created_at)
    }
}

/// One candidate shown during name disambiguation. Carries only the masked
/// NRIC so the option list can be rendered verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationOption {
    pub id: i64,
    pub display_name: String,
    pub masked_nric: String,
}

/// Masked record of an outbound REST request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestSnapshot {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// 1-based attempt number of the request that produced the outcome.
    pub attempt: u32,
}

/// Masked, truncated record of a REST response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponseSnapshot {
    pub status: u16,
    pub body: String,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

/// Masked record of a failed REST interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub body: String,
    pub retryable: bool,
}

/// Truncate a snapshot body: bodies over 3 KB keep their first 512 chars.
/// Returns the stored body and whether truncation occurred.
pub fn truncate_snapshot_body(body: &str) -> (String, bool) {
    if body.len() <= SNAPSHOT_BODY_LIMIT_BYTES {
        return (body.to_owned(), false);
    }
    let kept: String = body.chars().take(SNAPSHOT_BODY_KEEP_CHARS).collect();
    (kept, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_joins_first_and_last() {
        let p = Patient {
            id: 7,
            first_name: "John".into(),
            last_name: "Doe".into(),
            nric: "S1234567A".into(),
            date_of_birth: None,
            contact_no: None,
            details: None,
            user: None,
        };
        assert_eq!(p.display_name(), "John Doe");
        assert_eq!(p.masked_nric(), "S******7A");
    }

    #[test]
    fn scan_created_date_is_date_prefix() {
        let scan = ScanResult {
            id: 1,
            patient: 5,
            created_at: "2026-07-14T09:30:00Z".into(),
            volume_estimate: None,
            preview_image: None,
            stl_file: None,
        };
        assert_eq!(scan.created_date(), "2026-07-14");
    }

    #[test]
    fn small_body_not_truncated() {
        let (body, truncated) = truncate_snapshot_body("short body");
        assert_eq!(body, "short body");
        assert!(!truncated);
    }

    #[test]
    fn body_over_3kb_truncated_to_512_chars() {
        let big = "a".repeat(SNAPSHOT_BODY_LIMIT_BYTES + 1);
        let (body, truncated) = truncate_snapshot_body(&big);
        assert_eq!(body.chars().count(), SNAPSHOT_BODY_KEEP_CHARS);
        assert!(truncated);
    }

    #[test]
    fn body_exactly_3kb_kept_whole() {
        let edge = "b".repeat(SNAPSHOT_BODY_LIMIT_BYTES);
        let (body, truncated) = truncate_snapshot_body(&edge);
        assert_eq!(body.len(), SNAPSHOT_BODY_LIMIT_BYTES);
        assert!(!truncated);
    }

    #[test]
    fn patient_payload_skips_absent_optionals() {
        let payload = PatientPayload {
            first_name: "Jane".into(),
            last_name: "Tan".into(),
            nric: "S1234567A".into(),
            date_of_birth: None,
            contact_no: None,
            details: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("date_of_birth").is_none());
        assert_eq!(json["first_name"], "Jane");
    }
}
