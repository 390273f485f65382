//! The per-conversation state record and its enumerations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hydrochat_core::config::ConfigSnapshot;
use hydrochat_core::types::{
    DisambiguationOption, Patient, ScanResult, ToolErrorSnapshot, ToolRequestSnapshot,
    ToolResponseSnapshot,
};

/// Bounded window of verbatim turns kept in state; older turns are folded
/// into `history_summary`.
pub const RECENT_MESSAGE_LIMIT: usize = 5;
/// Scan previews rendered per page.
pub const SCAN_DISPLAY_LIMIT: usize = 10;
/// Upper bound on cached patient records.
pub const PATIENT_CACHE_LIMIT: usize = 1000;
/// Patient cache staleness threshold.
pub const CACHE_STALE_AFTER_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Classification of the current user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    CreatePatient,
    UpdatePatient,
    DeletePatient,
    ListPatients,
    GetPatientDetails,
    GetScanResults,
    Unknown,
}

/// A multi-turn operation still in flight across user turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingAction {
    None,
    CreatePatient,
    UpdatePatient,
    DeletePatient,
    GetScanResults,
}

impl PendingAction {
    pub fn from_intent(intent: Intent) -> Self {
        match intent {
            Intent::CreatePatient => PendingAction::CreatePatient,
            Intent::UpdatePatient => PendingAction::UpdatePatient,
            Intent::DeletePatient => PendingAction::DeletePatient,
            Intent::GetScanResults => PendingAction::GetScanResults,
            _ => PendingAction::None,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            PendingAction::CreatePatient => Intent::CreatePatient,
            PendingAction::UpdatePatient => Intent::UpdatePatient,
            PendingAction::DeletePatient => Intent::DeletePatient,
            PendingAction::GetScanResults => Intent::GetScanResults,
            PendingAction::None => Intent::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationType {
    None,
    Delete,
    DownloadStl,
}

/// Scan-disclosure stage. STL URLs may only be rendered after the stage has
/// passed through `AwaitingStlConfirm` on an affirmative utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStage {
    None,
    PreviewShown,
    AwaitingStlConfirm,
    StlLinksSent,
}

/// Outward hint telling the client whether to refresh its patient list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentOp {
    Create,
    Update,
    Delete,
    None,
}

/// One message in the bounded recent-turn window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed values ready for a tool payload. NRIC is only admitted through
/// `set_nric`, which enforces the agent-side format policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatedFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nric: Option<String>,
    pub date_of_birth: Option<String>,
    pub contact_no: Option<String>,
    pub details: Option<String>,
}

impl ValidatedFields {
    /// Admit an NRIC only when it matches the agent policy.
    pub fn set_nric(&mut self, value: &str) -> bool {
        if hydrochat_core::nric::is_valid_nric(value) {
            self.nric = Some(value.to_string());
            true
        } else {
            false
        }
    }

    /// Whether any updatable field carries a value.
    pub fn has_any(&self) -> bool {
        self.first_name.is_some()
            || self.last_name.is_some()
            || self.nric.is_some()
            || self.date_of_birth.is_some()
            || self.contact_no.is_some()
            || self.details.is_some()
    }

    /// Names of fields carrying values, for the update-success reply.
    pub fn changed_field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.first_name.is_some() {
            names.push("first_name");
        }
        if self.last_name.is_some() {
            names.push("last_name");
        }
        if self.nric.is_some() {
            names.push("nric");
        }
        if self.date_of_birth.is_some() {
            names.push("date_of_birth");
        }
        if self.contact_no.is_some() {
            names.push("contact_no");
        }
        if self.details.is_some() {
            names.push("details");
        }
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub total_api_calls: u64,
    pub retries: u64,
    pub successful_ops: u64,
    pub aborted_ops: u64,
    /// Actual token counts from provider metadata; never estimated. Stay 0
    /// when the provider reports nothing.
    pub llm_prompt_tokens: u64,
    pub llm_completion_tokens: u64,
}

/// All per-turn and across-turn conversation data. Constructed complete;
/// nodes mutate documented subsets of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub recent_messages: VecDeque<ChatTurn>,
    pub history_summary: String,
    pub intent: Intent,
    pub pending_action: PendingAction,
    pub extracted_fields: BTreeMap<String, String>,
    pub validated_fields: ValidatedFields,
    pub pending_fields: BTreeSet<String>,
    pub patient_cache: Vec<Patient>,
    pub patient_cache_at: Option<DateTime<Utc>>,
    pub disambiguation_options: Vec<DisambiguationOption>,
    pub selected_patient_id: Option<i64>,
    pub clarification_loop_count: u8,
    pub confirmation_required: bool,
    pub awaiting_confirmation_type: ConfirmationType,
    pub last_patient_snapshot: Option<Patient>,
    pub last_tool_request: Option<ToolRequestSnapshot>,
    pub last_tool_response: Option<ToolResponseSnapshot>,
    pub last_tool_error: Option<ToolErrorSnapshot>,
    pub scan_results_buffer: Vec<ScanResult>,
    pub scan_pagination_offset: usize,
    pub scan_display_limit: usize,
    pub download_stage: DownloadStage,
    pub metrics: ConversationMetrics,
    pub config_snapshot: ConfigSnapshot,
    /// Raw NRICs the user typed in this conversation; gates full-NRIC
    /// disclosure. Never logged.
    pub user_supplied_nrics: BTreeSet<String>,
    pub total_turns: u64,
}

impl ConversationState {
    pub fn new(config_snapshot: ConfigSnapshot) -> Self {
        Self {
            recent_messages: VecDeque::with_capacity(RECENT_MESSAGE_LIMIT),
            history_summary: String::new(),
            intent: Intent::Unknown,
            pending_action: PendingAction::None,
            extracted_fields: BTreeMap::new(),
            validated_fields: ValidatedFields::default(),
            pending_fields: BTreeSet::new(),
            patient_cache: Vec::new(),
            patient_cache_at: None,
            disambiguation_options: Vec::new(),
            selected_patient_id: None,
            clarification_loop_count: 0,
            confirmation_required: false,
            awaiting_confirmation_type: ConfirmationType::None,
            last_patient_snapshot: None,
            last_tool_request: None,
            last_tool_response: None,
            last_tool_error: None,
            scan_results_buffer: Vec::new(),
            scan_pagination_offset: 0,
            scan_display_limit: SCAN_DISPLAY_LIMIT,
            download_stage: DownloadStage::None,
            metrics: ConversationMetrics::default(),
            config_snapshot,
            user_supplied_nrics: BTreeSet::new(),
            total_turns: 0,
        }
    }

    /// Append a turn, discarding the oldest once the window is full.
    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        if self.recent_messages.len() == RECENT_MESSAGE_LIMIT {
            self.recent_messages.pop_front();
        }
        self.recent_messages.push_back(ChatTurn {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Clear every pending-flow flag. Invoked by the cancellation handler;
    /// idempotent by construction.
    pub fn reset_pending(&mut self) {
        self.pending_action = PendingAction::None;
        self.pending_fields.clear();
        self.disambiguation_options.clear();
        self.confirmation_required = false;
        self.awaiting_confirmation_type = ConfirmationType::None;
        self.download_stage = DownloadStage::None;
        self.clarification_loop_count = 0;
    }

    /// Whether the patient cache needs a refresh before name resolution.
    pub fn cache_is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.patient_cache_at {
            None => true,
            Some(at) => (now - at).num_seconds() >= CACHE_STALE_AFTER_SECS,
        }
    }

    pub fn invalidate_patient_cache(&mut self) {
        self.patient_cache.clear();
        self.patient_cache_at = None;
    }

    /// Replace the cache contents, enforcing the size cap.
    pub fn load_patient_cache(&mut self, mut patients: Vec<Patient>, now: DateTime<Utc>) {
        patients.truncate(PATIENT_CACHE_LIMIT);
        self.patient_cache = patients;
        self.patient_cache_at = Some(now);
    }

    pub fn cache_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.patient_cache_at.map(|at| (now - at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            base_url: "http://backend.local".into(),
            auth_token: Some("secr***".into()),
            timeout_seconds: 10,
        }
    }

    #[test]
    fn message_window_bounded_to_five() {
        let mut state = ConversationState::new(snapshot());
        for i in 0..8 {
            state.push_message(Role::User, format!("msg {i}"));
        }
        assert_eq!(state.recent_messages.len(), RECENT_MESSAGE_LIMIT);
        assert_eq!(state.recent_messages.front().unwrap().content, "msg 3");
        assert_eq!(state.recent_messages.back().unwrap().content, "msg 7");
    }

    #[test]
    fn reset_pending_clears_flow_flags() {
        let mut state = ConversationState::new(snapshot());
        state.pending_action = PendingAction::DeletePatient;
        state.pending_fields.insert("nric".into());
        state.confirmation_required = true;
        state.awaiting_confirmation_type = ConfirmationType::Delete;
        state.download_stage = DownloadStage::PreviewShown;
        state.clarification_loop_count = 1;
        state.disambiguation_options.push(
            hydrochat_core::types::DisambiguationOption {
                id: 1,
                display_name: "John Lee".into(),
                masked_nric: "S******7A".into(),
            },
        );

        state.reset_pending();

        assert_eq!(state.pending_action, PendingAction::None);
        assert!(state.pending_fields.is_empty());
        assert!(state.disambiguation_options.is_empty());
        assert!(!state.confirmation_required);
        assert_eq!(state.awaiting_confirmation_type, ConfirmationType::None);
        assert_eq!(state.download_stage, DownloadStage::None);
        assert_eq!(state.clarification_loop_count, 0);
    }

    #[test]
    fn reset_pending_twice_equals_once() {
        let mut state = ConversationState::new(snapshot());
        state.pending_action = PendingAction::CreatePatient;
        state.reset_pending();
        let after_once = state.clone();
        state.reset_pending();
        assert_eq!(state, after_once);
    }

    #[test]
    fn serde_round_trip_preserves_every_field() {
        let mut state = ConversationState::new(snapshot());
        state.push_message(Role::User, "add patient John Doe");
        state.push_message(Role::Assistant, "Need nric. Please provide.");
        state.intent = Intent::CreatePatient;
        state.pending_action = PendingAction::CreatePatient;
        state.extracted_fields.insert("first_name".into(), "John".into());
        state.validated_fields.first_name = Some("John".into());
        state.pending_fields.insert("nric".into());
        state.clarification_loop_count = 1;
        state.download_stage = DownloadStage::PreviewShown;
        state.metrics.total_api_calls = 3;
        state.total_turns = 2;

        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn enums_serialize_symbolically() {
        let json = serde_json::to_string(&Intent::GetScanResults).unwrap();
        assert_eq!(json, "\"GET_SCAN_RESULTS\"");
        let json = serde_json::to_string(&ConfirmationType::DownloadStl).unwrap();
        assert_eq!(json, "\"DOWNLOAD_STL\"");
        let json = serde_json::to_string(&Role::Tool).unwrap();
        assert_eq!(json, "\"tool\"");
    }

    #[test]
    fn nric_admitted_only_when_valid() {
        let mut fields = ValidatedFields::default();
        assert!(!fields.set_nric("nope"));
        assert_eq!(fields.nric, None);
        assert!(fields.set_nric("S1234567A"));
        assert_eq!(fields.nric.as_deref(), Some("S1234567A"));
    }

    #[test]
    fn cache_staleness_threshold_is_five_minutes() {
        let mut state = ConversationState::new(snapshot());
        let now = Utc::now();
        assert!(state.cache_is_stale(now));
        state.load_patient_cache(Vec::new(), now);
        assert!(!state.cache_is_stale(now + chrono::Duration::seconds(299)));
        assert!(state.cache_is_stale(now + chrono::Duration::seconds(300)));
    }

    #[test]
    fn cache_truncated_to_limit() {
        let mut state = ConversationState::new(snapshot());
        let patients: Vec<_> = (0..1100)
            .map(|i| hydrochat_core::types::Patient {
                id: i,
                first_name: "P".into(),
                last_name: format!("{i}"),
                nric: "S1234567A".into(),
                date_of_birth: None,
                contact_no: None,
                details: None,
                user: None,
            })
            .collect();
        state.load_patient_cache(patients, Utc::now());
        assert_eq!(state.patient_cache.len(), PATIENT_CACHE_LIMIT);
    }
}
