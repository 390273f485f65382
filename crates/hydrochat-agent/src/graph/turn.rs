//! Per-turn working context threaded through the node functions.
//!
//! Nodes communicate across turns only through `ConversationState`; the
//! scratch fields here live for a single turn and carry what a reply needs
//! before `finalize_response` composes it.

use std::collections::BTreeSet;

use hydrochat_backend::{CallTrace, PatientApi, ToolError};
use hydrochat_core::config::LlmConfig;
use hydrochat_core::types::{Patient, PatientPayload};
use hydrochat_sessions::state::{AgentOp, ConversationState};

use crate::extract::PatientRef;
use crate::llm::LlmProvider;

/// Typed result of the tool execution node, consumed by
/// `update_state_post_tool`.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Created(Patient),
    Updated(Patient),
    Deleted { id: i64 },
    Listed(Vec<Patient>),
    Fetched(Patient),
}

pub struct TurnCtx<'a> {
    pub state: &'a mut ConversationState,
    pub api: &'a dyn PatientApi,
    pub llm: Option<&'a dyn LlmProvider>,
    pub llm_config: &'a LlmConfig,

    /// Trimmed user text for this turn.
    pub message: String,
    /// Reply sections, joined with newlines at finalize.
    pub reply: Vec<String>,
    pub agent_op: AgentOp,
    /// Wall time spent waiting on REST and LLM calls; excluded from the
    /// slow-turn threshold.
    pub network_ms: u64,
    /// Set only by the explicit full-NRIC disclosure path; suppresses the
    /// blanket output masking in finalize.
    pub allow_raw_nric: bool,

    /// "show more scans" resume: consumed by the preview formatter as a
    /// PAGINATION_CONTINUE hop.
    pub wants_more_pending: bool,
    /// Pending fields at turn entry; zero progress against them selects the
    /// explicit-format-instructions prompt.
    pub pending_at_entry: BTreeSet<String>,
    /// Format-hint flags raised by extraction this turn.
    pub nric_hint: bool,
    pub dob_hint: bool,

    pub patient_ref: Option<PatientRef>,
    pub payload: Option<PatientPayload>,
    pub outcome: Option<ToolOutcome>,
    pub tool_error: Option<ToolError>,
    /// The extraction fallback runs at most once per turn.
    pub llm_fallback_used: bool,
    /// Scan window computed by the pagination node.
    pub page: Option<(usize, usize)>,
}

impl<'a> TurnCtx<'a> {
    pub fn new(
        state: &'a mut ConversationState,
        api: &'a dyn PatientApi,
        llm: Option<&'a dyn LlmProvider>,
        llm_config: &'a LlmConfig,
        message: String,
    ) -> Self {
        Self {
            state,
            api,
            llm,
            llm_config,
            message,
            reply: Vec::new(),
            agent_op: AgentOp::None,
            network_ms: 0,
            allow_raw_nric: false,
            wants_more_pending: false,
            pending_at_entry: BTreeSet::new(),
            nric_hint: false,
            dob_hint: false,
            patient_ref: None,
            payload: None,
            outcome: None,
            tool_error: None,
            llm_fallback_used: false,
            page: None,
        }
    }

    pub fn say(&mut self, text: impl Into<String>) {
        self.reply.push(text.into());
    }

    /// Record a finished REST call: masked snapshots into state, metric
    /// bumps, network-time accounting.
    pub fn record_trace(&mut self, trace: &CallTrace) {
        self.state.last_tool_request = Some(trace.request.clone());
        self.state.last_tool_response = trace.response.clone();
        self.state.last_tool_error = trace.error.clone();
        self.state.metrics.total_api_calls += 1;
        self.state.metrics.retries += trace.retries as u64;
        self.network_ms += trace.elapsed_ms;
    }

    /// Display name for a patient id, when the cache still holds it.
    pub fn cached_name(&self, id: i64) -> Option<String> {
        self.state
            .patient_cache
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.display_name())
    }
}
