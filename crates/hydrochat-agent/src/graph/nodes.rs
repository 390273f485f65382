//! Node functions. Each is a function of the turn context that returns a
//! control token; routing is the table in `token.rs`. Nodes never talk to
//! each other directly — everything crosses through `ConversationState` or
//! the per-turn scratch.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use hydrochat_backend::ToolError;
use hydrochat_core::logfmt::{log_line, Category};
use hydrochat_core::nric::mask_text;
use hydrochat_core::phrases;
use hydrochat_core::sanitize::sanitize_for_llm;
use hydrochat_core::types::PatientPayload;
use hydrochat_sessions::state::{
    AgentOp, ConfirmationType, ConversationState, DownloadStage, Intent, PendingAction, Role,
};

use crate::classify;
use crate::extract::{self, PatientRef};
use crate::graph::token::NodeToken;
use crate::graph::turn::{ToolOutcome, TurnCtx};
use crate::llm::GenerateRequest;
use crate::reply;
use crate::resolve::{self, Resolution};

/// Longest user message accepted for processing.
pub const MAX_USER_MESSAGE_CHARS: usize = 2000;

// ---------------------------------------------------------------------------
// 1. ingest_user_message
// ---------------------------------------------------------------------------

pub fn ingest_user_message(ctx: &mut TurnCtx<'_>) -> NodeToken {
    ctx.state.total_turns += 1;
    ctx.state.clarification_loop_count = 0;
    // `extracted_fields` holds only what this turn parsed.
    ctx.state.extracted_fields.clear();
    let recorded = ctx.message.clone();
    ctx.state.push_message(Role::User, recorded);
    NodeToken::Next
}

// ---------------------------------------------------------------------------
// 2. classify_intent
// ---------------------------------------------------------------------------

pub async fn classify_intent(ctx: &mut TurnCtx<'_>) -> NodeToken {
    // A fresh classification starts a fresh flow; stale pending state from
    // an earlier action must not leak into it.
    ctx.state.reset_pending();
    ctx.state.validated_fields = Default::default();
    ctx.state.selected_patient_id = None;

    let intent = match classify::classify_by_rules(&ctx.message) {
        Some(intent) => intent,
        None => classify_with_llm(ctx).await,
    };
    ctx.state.intent = intent;
    log_line(Category::Intent, &format!("classified as {intent:?}"));

    if intent == Intent::Unknown {
        ctx.say(reply::unknown_intent());
    }
    NodeToken::Next
}

async fn classify_with_llm(ctx: &mut TurnCtx<'_>) -> Intent {
    let Some(llm) = ctx.llm else {
        return Intent::Unknown;
    };

    let sanitized = sanitize_for_llm(&ctx.message, ctx.llm_config.max_input_chars);
    let recent_context = recent_context(ctx.state);
    let prompt =
        classify::build_classify_prompt(&sanitized, &recent_context, &ctx.state.history_summary);

    let started = Instant::now();
    let result = llm
        .generate(&GenerateRequest {
            prompt,
            max_tokens: 256,
        })
        .await;
    ctx.network_ms += started.elapsed().as_millis() as u64;

    match result {
        Ok(generated) => {
            ctx.state.metrics.llm_prompt_tokens += generated.prompt_tokens;
            ctx.state.metrics.llm_completion_tokens += generated.completion_tokens;
            classify::parse_intent_reply(&generated.text)
        }
        Err(e) => {
            log_line(Category::Error, &format!("LLM classification failed: {e}"));
            Intent::Unknown
        }
    }
}

/// Prior turns (excluding the one being processed), oldest first.
fn recent_context(state: &ConversationState) -> String {
    let turns: Vec<String> = state
        .recent_messages
        .iter()
        .rev()
        .skip(1)
        .take(4)
        .map(|t| {
            let role = match t.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            format!("{role}: {}", t.content)
        })
        .collect();
    turns.into_iter().rev().collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------------
// 3. extract_entities_and_fields
// ---------------------------------------------------------------------------

pub async fn extract_entities_and_fields(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let extraction = extract::extract_from_message(&ctx.message, ctx.state.intent);

    for (key, value) in &extraction.fields {
        ctx.state
            .extracted_fields
            .insert(key.clone(), value.clone());
    }
    if extraction.patient_ref.is_some() {
        ctx.patient_ref = extraction.patient_ref.clone();
    }
    ctx.nric_hint = extraction.invalid_nric;
    ctx.dob_hint = extraction.invalid_dob;

    // A one-field follow-up ("S1234567A", "Smith") answers the single
    // question we asked last turn.
    if ctx.pending_at_entry.len() == 1 {
        let field = ctx.pending_at_entry.iter().next().cloned().unwrap_or_default();
        if !ctx.state.extracted_fields.contains_key(&field) {
            if let Some(value) = extract::assign_bare_value(&field, &ctx.message) {
                ctx.state.extracted_fields.insert(field, value);
            }
        }
    }

    validate_extracted(ctx);

    // LLM fallback, once per turn, only for the concrete fields still
    // missing.
    let missing = missing_payload_fields(ctx);
    if !missing.is_empty() && ctx.llm.is_some() && !ctx.llm_fallback_used {
        ctx.llm_fallback_used = true;
        extract_with_llm(ctx, &missing).await;
        validate_extracted(ctx);
    }

    ctx.state.pending_fields = compute_pending(ctx);
    NodeToken::Next
}

/// Move raw extracted values into the typed record, enforcing per-field
/// policies.
fn validate_extracted(ctx: &mut TurnCtx<'_>) {
    let extracted = ctx.state.extracted_fields.clone();
    for (key, value) in extracted {
        match key.as_str() {
            "nric" => {
                if ctx.state.validated_fields.set_nric(&value) {
                    ctx.state.user_supplied_nrics.insert(value);
                } else {
                    ctx.nric_hint = true;
                }
            }
            "first_name" => ctx.state.validated_fields.first_name = Some(value),
            "last_name" => ctx.state.validated_fields.last_name = Some(value),
            "date_of_birth" => {
                if chrono::NaiveDate::parse_from_str(&value, "%Y-%m-%d").is_ok() {
                    ctx.state.validated_fields.date_of_birth = Some(value);
                } else {
                    ctx.dob_hint = true;
                }
            }
            "contact_no" => ctx.state.validated_fields.contact_no = Some(value),
            "details" => ctx.state.validated_fields.details = Some(value),
            _ => {}
        }
    }
}

async fn extract_with_llm(ctx: &mut TurnCtx<'_>, missing: &[String]) {
    let Some(llm) = ctx.llm else { return };

    let sanitized = sanitize_for_llm(&ctx.message, ctx.llm_config.max_input_chars);
    let prompt = extract::build_extract_prompt(&sanitized, missing);

    let started = Instant::now();
    let result = llm
        .generate(&GenerateRequest {
            prompt,
            max_tokens: 256,
        })
        .await;
    ctx.network_ms += started.elapsed().as_millis() as u64;

    match result {
        Ok(generated) => {
            ctx.state.metrics.llm_prompt_tokens += generated.prompt_tokens;
            ctx.state.metrics.llm_completion_tokens += generated.completion_tokens;
            let fields = extract::parse_extract_reply(&generated.text, missing);
            for (key, value) in fields {
                ctx.state.extracted_fields.entry(key).or_insert(value);
            }
        }
        Err(e) => log_line(Category::Error, &format!("LLM extraction failed: {e}")),
    }
}

/// Concrete payload fields the current intent still needs (excludes the
/// patient-reference pseudo-field).
fn missing_payload_fields(ctx: &TurnCtx<'_>) -> Vec<String> {
    let v = &ctx.state.validated_fields;
    match ctx.state.intent {
        Intent::CreatePatient => {
            let mut missing = Vec::new();
            if v.first_name.is_none() {
                missing.push("first_name".to_string());
            }
            if v.last_name.is_none() {
                missing.push("last_name".to_string());
            }
            if v.nric.is_none() {
                missing.push("nric".to_string());
            }
            missing
        }
        _ => Vec::new(),
    }
}

/// The full pending set for the intent, including pseudo-fields.
fn compute_pending(ctx: &TurnCtx<'_>) -> BTreeSet<String> {
    let mut pending = BTreeSet::new();
    let v = &ctx.state.validated_fields;
    let has_ref = ctx.state.selected_patient_id.is_some() || ctx.patient_ref.is_some();

    match ctx.state.intent {
        Intent::CreatePatient => {
            for field in missing_payload_fields(ctx) {
                pending.insert(field);
            }
            if ctx.dob_hint && v.date_of_birth.is_none() {
                pending.insert("date_of_birth".to_string());
            }
        }
        Intent::UpdatePatient => {
            if !has_ref {
                pending.insert("patient".to_string());
            }
            if !v.has_any() {
                pending.insert("update_fields".to_string());
            }
            if ctx.dob_hint && v.date_of_birth.is_none() {
                pending.insert("date_of_birth".to_string());
            }
        }
        Intent::DeletePatient | Intent::GetPatientDetails | Intent::GetScanResults => {
            if !has_ref {
                pending.insert("patient".to_string());
            }
        }
        Intent::ListPatients | Intent::Unknown => {}
    }
    pending
}

// ---------------------------------------------------------------------------
// 4. resolve_patient_reference
// ---------------------------------------------------------------------------

pub async fn resolve_patient_reference(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let needs_ref = matches!(
        ctx.state.intent,
        Intent::UpdatePatient | Intent::DeletePatient | Intent::GetPatientDetails
            | Intent::GetScanResults
    );
    if !needs_ref || ctx.state.selected_patient_id.is_some() {
        return NodeToken::Next;
    }
    let Some(reference) = ctx.patient_ref.clone() else {
        // Nothing to resolve; collect_missing_fields asks for the patient.
        return NodeToken::Next;
    };

    let (resolution, traces) = resolve::resolve(ctx.state, ctx.api, &reference).await;
    for trace in &traces {
        ctx.record_trace(trace);
    }

    match resolution {
        Resolution::Matched(id) => {
            ctx.state.selected_patient_id = Some(id);
            NodeToken::Next
        }
        Resolution::Candidates(options) => {
            ctx.state.disambiguation_options = options;
            NodeToken::Next
        }
        Resolution::NoneFound(query) => {
            log_line(Category::Missing, &format!("no patient match for '{query}'"));
            ctx.say(format!(
                "No patient named '{query}' found. Say 'list patients' to see all \
                 patients, or give a patient id."
            ));
            NodeToken::NoMatch
        }
        Resolution::FetchFailed => {
            ctx.state.metrics.aborted_ops += 1;
            ctx.say(
                "I couldn't load the patient list from the backend. Please try \
                 again in a moment.",
            );
            NodeToken::RetryLater
        }
    }
}

// ---------------------------------------------------------------------------
// 5. handle_ambiguity
// ---------------------------------------------------------------------------

pub fn handle_ambiguity(ctx: &mut TurnCtx<'_>) -> NodeToken {
    if ctx.state.disambiguation_options.is_empty() {
        return NodeToken::Resolved;
    }

    let query = match &ctx.patient_ref {
        Some(PatientRef::Name(name)) => name.clone(),
        _ => "that name".to_string(),
    };
    log_line(
        Category::Ambiguous,
        &format!(
            "{} candidates for '{query}'",
            ctx.state.disambiguation_options.len()
        ),
    );
    ctx.say(reply::disambiguation_list(
        &query,
        &ctx.state.disambiguation_options,
    ));
    // The flow resumes next turn once the clinician picks a candidate.
    ctx.state.pending_action = PendingAction::from_intent(ctx.state.intent);
    NodeToken::AmbiguousPresent
}

// ---------------------------------------------------------------------------
// 6. collect_missing_fields
// ---------------------------------------------------------------------------

pub fn collect_missing_fields(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let mut pending = ctx.state.pending_fields.clone();
    if ctx.state.selected_patient_id.is_some() || ctx.patient_ref.is_some() {
        pending.remove("patient");
    }
    ctx.state.pending_fields = pending.clone();

    if pending.is_empty() {
        return NodeToken::FieldsComplete;
    }

    ctx.state.pending_action = PendingAction::from_intent(ctx.state.intent);

    let no_progress = !ctx.pending_at_entry.is_empty() && pending == ctx.pending_at_entry;
    if ctx.state.clarification_loop_count >= 1 || no_progress {
        // One clarification per user turn; after that, explicit format
        // instructions plus the cancel option.
        let list = pending.iter().cloned().collect::<Vec<_>>().join(", ");
        ctx.say(format!(
            "Still need {list}. NRIC looks like S1234567A; dates are YYYY-MM-DD. \
             Say 'cancel' to abandon this action."
        ));
        log_line(Category::Missing, &format!("clarification exhausted: {list}"));
        return NodeToken::NeedMoreFields;
    }

    ctx.state.clarification_loop_count += 1;
    let question = if pending.len() == 1 && pending.contains("patient") {
        "Which patient? Give the full name or patient id.".to_string()
    } else if pending.len() == 1 && pending.contains("update_fields") {
        "Which fields should I update, and to what values?".to_string()
    } else {
        let mut question = reply::need_fields(&pending);
        if pending.contains("nric") && ctx.nric_hint {
            question.push_str(" NRIC format: S1234567A.");
        }
        if pending.contains("date_of_birth") && ctx.dob_hint {
            question.push_str(" Date format: YYYY-MM-DD.");
        }
        question
    };
    log_line(
        Category::Missing,
        &format!("asking for {}", pending.iter().cloned().collect::<Vec<_>>().join(", ")),
    );
    ctx.say(question);
    NodeToken::NeedMoreFields
}

// ---------------------------------------------------------------------------
// 7. confirmation_gate
// ---------------------------------------------------------------------------

pub fn confirmation_gate(ctx: &mut TurnCtx<'_>) -> NodeToken {
    match ctx.state.awaiting_confirmation_type {
        ConfirmationType::None => {
            if ctx.state.intent == Intent::DeletePatient {
                let Some(id) = ctx.state.selected_patient_id else {
                    // The pending "patient" field should have caught this.
                    ctx.state.pending_fields.insert("patient".to_string());
                    return NodeToken::ValidationError;
                };
                let name = ctx.cached_name(id);
                ctx.state.confirmation_required = true;
                ctx.state.awaiting_confirmation_type = ConfirmationType::Delete;
                ctx.state.pending_action = PendingAction::DeletePatient;
                log_line(Category::Confirm, &format!("delete of patient {id} needs confirmation"));
                ctx.say(reply::confirm_delete(id, name.as_deref()));
                NodeToken::AwaitingConfirmation
            } else {
                NodeToken::Confirmed
            }
        }
        awaiting @ (ConfirmationType::Delete | ConfirmationType::DownloadStl) => {
            if phrases::is_affirmative(&ctx.message) {
                ctx.state.confirmation_required = false;
                ctx.state.awaiting_confirmation_type = ConfirmationType::None;
                if awaiting == ConfirmationType::DownloadStl {
                    ctx.state.download_stage = DownloadStage::AwaitingStlConfirm;
                }
                log_line(Category::Confirm, "confirmed");
                NodeToken::Confirmed
            } else if phrases::is_negative(&ctx.message) {
                ctx.state.confirmation_required = false;
                ctx.state.awaiting_confirmation_type = ConfirmationType::None;
                ctx.state.pending_action = PendingAction::None;
                ctx.state.metrics.aborted_ops += 1;
                log_line(Category::Confirm, "rejected");
                match awaiting {
                    ConfirmationType::Delete => {
                        ctx.say("Okay, I won't delete anything.");
                    }
                    _ => {
                        ctx.state.download_stage = DownloadStage::None;
                        ctx.say("Okay, skipping the STL links.");
                    }
                }
                NodeToken::Rejected
            } else {
                // Neither word set matched; the question stands.
                ctx.say("Please reply yes or no.");
                NodeToken::AwaitingConfirmation
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 8. prepare_tool_payload
// ---------------------------------------------------------------------------

pub async fn prepare_tool_payload(ctx: &mut TurnCtx<'_>) -> NodeToken {
    match ctx.state.intent {
        Intent::CreatePatient => {
            let v = &ctx.state.validated_fields;
            let (Some(first), Some(last), Some(nric)) =
                (v.first_name.clone(), v.last_name.clone(), v.nric.clone())
            else {
                ctx.state.pending_fields = compute_pending(ctx);
                return NodeToken::ValidationError;
            };
            ctx.payload = Some(PatientPayload {
                first_name: first,
                last_name: last,
                nric,
                date_of_birth: v.date_of_birth.clone(),
                contact_no: v.contact_no.clone(),
                details: v.details.clone(),
            });
            NodeToken::Next
        }
        Intent::UpdatePatient => prepare_update_payload(ctx).await,
        // DELETE, LIST, and GET carry no body.
        _ => NodeToken::Next,
    }
}

/// The PUT merge: fetch current, overlay validated fields, verify the
/// required trio, strip read-only keys (the payload type has none).
async fn prepare_update_payload(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let Some(id) = ctx.state.selected_patient_id else {
        ctx.state.pending_fields.insert("patient".to_string());
        return NodeToken::ValidationError;
    };

    let fetched = ctx.api.get_patient(id).await;
    ctx.record_trace(&fetched.trace);
    let current = match fetched.outcome {
        Ok(patient) => patient,
        Err(ToolError::NotFound) => {
            ctx.state.selected_patient_id = None;
            ctx.state.metrics.aborted_ops += 1;
            ctx.say(format!(
                "Patient #{id} no longer exists. Say 'list patients' to see \
                 everyone, or pick another patient."
            ));
            return NodeToken::RetryLater;
        }
        Err(e) => {
            ctx.state.metrics.aborted_ops += 1;
            log_line(Category::Error, &format!("update pre-fetch failed: {e}"));
            ctx.say("Sorry, the backend rejected the lookup. Please try again shortly.");
            return NodeToken::RetryLater;
        }
    };

    ctx.state.last_patient_snapshot = Some(current.clone());

    let v = &ctx.state.validated_fields;
    let merged = PatientPayload {
        first_name: v.first_name.clone().unwrap_or(current.first_name),
        last_name: v.last_name.clone().unwrap_or(current.last_name),
        nric: v.nric.clone().unwrap_or(current.nric),
        date_of_birth: v.date_of_birth.clone().or(current.date_of_birth),
        contact_no: v.contact_no.clone().or(current.contact_no),
        details: v.details.clone().or(current.details),
    };

    if merged.first_name.is_empty() || merged.last_name.is_empty() || merged.nric.is_empty() {
        for (field, value) in [
            ("first_name", &merged.first_name),
            ("last_name", &merged.last_name),
            ("nric", &merged.nric),
        ] {
            if value.is_empty() {
                ctx.state.pending_fields.insert(field.to_string());
            }
        }
        return NodeToken::ValidationError;
    }

    ctx.payload = Some(merged);
    NodeToken::Next
}

// ---------------------------------------------------------------------------
// 9. execute_tool
// ---------------------------------------------------------------------------

pub async fn execute_tool(ctx: &mut TurnCtx<'_>) -> NodeToken {
    match ctx.state.intent {
        Intent::CreatePatient => {
            let Some(payload) = ctx.payload.clone() else {
                ctx.tool_error = Some(ToolError::Decode("missing create payload".into()));
                return NodeToken::Next;
            };
            let reply = ctx.api.create_patient(&payload).await;
            ctx.record_trace(&reply.trace);
            match reply.outcome {
                Ok(patient) => ctx.outcome = Some(ToolOutcome::Created(patient)),
                Err(e) => ctx.tool_error = Some(e),
            }
        }
        Intent::UpdatePatient => {
            let (Some(id), Some(payload)) = (ctx.state.selected_patient_id, ctx.payload.clone())
            else {
                ctx.tool_error = Some(ToolError::Decode("missing update target".into()));
                return NodeToken::Next;
            };
            let reply = ctx.api.update_patient(id, &payload).await;
            ctx.record_trace(&reply.trace);
            match reply.outcome {
                Ok(patient) => ctx.outcome = Some(ToolOutcome::Updated(patient)),
                Err(e) => ctx.tool_error = Some(e),
            }
        }
        Intent::DeletePatient => {
            let Some(id) = ctx.state.selected_patient_id else {
                ctx.tool_error = Some(ToolError::Decode("missing delete target".into()));
                return NodeToken::Next;
            };
            let reply = ctx.api.delete_patient(id).await;
            ctx.record_trace(&reply.trace);
            match reply.outcome {
                Ok(()) => ctx.outcome = Some(ToolOutcome::Deleted { id }),
                Err(e) => ctx.tool_error = Some(e),
            }
        }
        Intent::ListPatients => {
            let reply = ctx.api.list_patients().await;
            ctx.record_trace(&reply.trace);
            match reply.outcome {
                Ok(patients) => ctx.outcome = Some(ToolOutcome::Listed(patients)),
                Err(e) => ctx.tool_error = Some(e),
            }
        }
        Intent::GetPatientDetails => {
            let Some(id) = ctx.state.selected_patient_id else {
                ctx.tool_error = Some(ToolError::Decode("missing patient target".into()));
                return NodeToken::Next;
            };
            let reply = ctx.api.get_patient(id).await;
            ctx.record_trace(&reply.trace);
            match reply.outcome {
                Ok(patient) => ctx.outcome = Some(ToolOutcome::Fetched(patient)),
                Err(e) => ctx.tool_error = Some(e),
            }
        }
        Intent::GetScanResults | Intent::Unknown => {
            debug!("execute_tool reached with non-tool intent");
        }
    }
    NodeToken::Next
}

// ---------------------------------------------------------------------------
// 10. handle_tool_error
// ---------------------------------------------------------------------------

pub fn handle_tool_error(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let Some(error) = ctx.tool_error.take() else {
        return NodeToken::Proceed;
    };

    match error {
        ToolError::Validation { field_errors } => {
            log_line(
                Category::Error,
                &format!("backend validation errors: {field_errors:?}"),
            );
            for field in field_errors.keys() {
                ctx.state.pending_fields.insert(field.clone());
                clear_field(ctx.state, field);
            }
            NodeToken::ValidationError
        }
        ToolError::NotFound => {
            ctx.state.selected_patient_id = None;
            ctx.state.metrics.aborted_ops += 1;
            log_line(Category::Error, "patient not found");
            ctx.say(
                "That patient no longer exists. Say 'list patients' to see \
                 everyone, or pick another patient.",
            );
            NodeToken::RetryLater
        }
        e @ (ToolError::Network(_) | ToolError::Timeout) => {
            ctx.state.metrics.aborted_ops += 1;
            log_line(Category::Error, &format!("backend unreachable: {e}"));
            ctx.say("Sorry, I couldn't reach the backend. Please try again shortly.");
            NodeToken::RetryLater
        }
        ToolError::Http { status, body } => {
            ctx.state.metrics.aborted_ops += 1;
            log_line(
                Category::Error,
                &format!("backend error {status}: {}", mask_text(&body)),
            );
            ctx.say(format!(
                "Sorry, the backend request failed (HTTP {status}). Please try again shortly."
            ));
            NodeToken::RetryLater
        }
        ToolError::Decode(reason) => {
            ctx.state.metrics.aborted_ops += 1;
            log_line(Category::Error, &format!("decode failure: {reason}"));
            ctx.say("Sorry, I couldn't read the backend's response. Please try again shortly.");
            NodeToken::RetryLater
        }
    }
}

fn clear_field(state: &mut ConversationState, field: &str) {
    state.extracted_fields.remove(field);
    match field {
        "first_name" => state.validated_fields.first_name = None,
        "last_name" => state.validated_fields.last_name = None,
        "nric" => state.validated_fields.nric = None,
        "date_of_birth" => state.validated_fields.date_of_birth = None,
        "contact_no" => state.validated_fields.contact_no = None,
        "details" => state.validated_fields.details = None,
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// 11. update_state_post_tool
// ---------------------------------------------------------------------------

pub fn update_state_post_tool(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let Some(outcome) = ctx.outcome.take() else {
        return NodeToken::Next;
    };

    match outcome {
        ToolOutcome::Created(patient) => {
            ctx.state.invalidate_patient_cache();
            ctx.say(reply::create_success(&patient));
            ctx.agent_op = AgentOp::Create;
            log_line(Category::Success, &format!("created patient {}", patient.id));
        }
        ToolOutcome::Updated(patient) => {
            let changed = ctx.state.validated_fields.changed_field_names();
            ctx.say(reply::update_success(patient.id, &changed));
            ctx.agent_op = AgentOp::Update;
            log_line(Category::Success, &format!("updated patient {}", patient.id));
        }
        ToolOutcome::Deleted { id } => {
            let name = ctx.cached_name(id);
            ctx.state.invalidate_patient_cache();
            ctx.say(reply::delete_success(id, name.as_deref()));
            ctx.agent_op = AgentOp::Delete;
            log_line(Category::Success, &format!("deleted patient {id}"));
        }
        ToolOutcome::Listed(patients) => {
            ctx.say(reply::patient_list(&patients));
            ctx.state.load_patient_cache(patients, chrono::Utc::now());
            log_line(Category::Success, "listed patients");
        }
        ToolOutcome::Fetched(patient) => {
            ctx.say(reply::patient_details(&patient));
            log_line(Category::Success, &format!("fetched patient {}", patient.id));
        }
    }

    ctx.state.metrics.successful_ops += 1;
    ctx.state.pending_action = PendingAction::None;
    ctx.state.pending_fields.clear();
    ctx.state.validated_fields = Default::default();
    ctx.state.extracted_fields.clear();
    ctx.state.selected_patient_id = None;
    NodeToken::Next
}

// ---------------------------------------------------------------------------
// 12. fetch_scan_results
// ---------------------------------------------------------------------------

pub async fn fetch_scan_results(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let Some(id) = ctx.state.selected_patient_id else {
        ctx.state.pending_fields.insert("patient".to_string());
        ctx.say("Which patient? Give the full name or patient id.");
        return NodeToken::NoResults;
    };

    let reply_env = ctx.api.list_scan_results(id).await;
    ctx.record_trace(&reply_env.trace);
    match reply_env.outcome {
        Ok(scans) if scans.is_empty() => {
            ctx.state.scan_results_buffer.clear();
            ctx.state.scan_pagination_offset = 0;
            ctx.state.pending_action = PendingAction::None;
            ctx.say(reply::no_scans(id));
            NodeToken::NoResults
        }
        Ok(scans) => {
            // Backend orders by descending creation time; the buffer keeps
            // that order.
            ctx.state.scan_results_buffer = scans;
            ctx.state.scan_pagination_offset = 0;
            ctx.state.metrics.successful_ops += 1;
            NodeToken::ResultsFound
        }
        Err(e) => {
            ctx.state.metrics.aborted_ops += 1;
            log_line(Category::Error, &format!("scan listing failed: {e}"));
            ctx.say("Sorry, I couldn't fetch the scan results. Please try again shortly.");
            NodeToken::RetryLater
        }
    }
}

// ---------------------------------------------------------------------------
// 13. paginate_scan_results
// ---------------------------------------------------------------------------

pub fn paginate_scan_results(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let total = ctx.state.scan_results_buffer.len();
    let start = ctx.state.scan_pagination_offset.min(total);
    let end = (start + ctx.state.scan_display_limit).min(total);
    ctx.page = Some((start, end));
    NodeToken::PageReady
}

// ---------------------------------------------------------------------------
// 14. format_scan_previews (Stage 1)
// ---------------------------------------------------------------------------

pub fn format_scan_previews(ctx: &mut TurnCtx<'_>) -> NodeToken {
    // A "show more scans" turn enters here first and hops back through the
    // paginator to compute the next window.
    if ctx.wants_more_pending {
        ctx.wants_more_pending = false;
        log_line(Category::Pagination, "advancing to next scan page");
        return NodeToken::PaginationContinue;
    }

    let Some((start, end)) = ctx.page else {
        return NodeToken::SkipStl;
    };
    let patient_id = ctx.state.selected_patient_id.unwrap_or_default();
    let total = ctx.state.scan_results_buffer.len();

    let mut lines = vec![reply::scan_header(patient_id)];
    if start == end {
        lines.push("No more scans to show.".to_string());
    }
    for scan in &ctx.state.scan_results_buffer[start..end] {
        lines.push(reply::scan_preview_line(scan));
    }

    ctx.state.scan_pagination_offset = end;
    if end < total {
        lines.push(reply::scan_showing_line(end, total));
    }
    log_line(
        Category::Pagination,
        &format!("previewed scans {start}..{end} of {total}"),
    );

    let any_stl = ctx.state.scan_results_buffer[..end]
        .iter()
        .any(|s| s.stl_file.is_some());
    if !any_stl {
        // Nothing to disclose, so there is no STL question to gate.
        lines.push("None of these scans have STL files.".to_string());
        ctx.say(lines.join("\n"));
        ctx.state.download_stage = DownloadStage::PreviewShown;
        ctx.state.confirmation_required = false;
        ctx.state.awaiting_confirmation_type = ConfirmationType::None;
        ctx.state.pending_action = PendingAction::None;
        return NodeToken::SkipStl;
    }

    lines.push(reply::stl_question());
    ctx.say(lines.join("\n"));
    ctx.state.download_stage = DownloadStage::PreviewShown;
    ctx.state.confirmation_required = true;
    ctx.state.awaiting_confirmation_type = ConfirmationType::DownloadStl;
    ctx.state.pending_action = PendingAction::GetScanResults;
    NodeToken::AwaitingStlConfirm
}

// ---------------------------------------------------------------------------
// 15. provide_stl_links (Stage 2)
// ---------------------------------------------------------------------------

pub fn provide_stl_links(ctx: &mut TurnCtx<'_>) -> NodeToken {
    // Disclosure covers exactly the items previewed so far.
    let end = ctx
        .state
        .scan_pagination_offset
        .min(ctx.state.scan_results_buffer.len());
    ctx.state.download_stage = DownloadStage::StlLinksSent;
    ctx.state.confirmation_required = false;
    ctx.state.awaiting_confirmation_type = ConfirmationType::None;
    ctx.state.pending_action = PendingAction::None;

    let lines: Vec<String> = ctx.state.scan_results_buffer[..end]
        .iter()
        .map(reply::stl_line)
        .collect();
    ctx.say(lines.join("\n"));
    log_line(Category::Success, &format!("sent STL links for {end} scans"));
    NodeToken::StlLinksSent
}

// ---------------------------------------------------------------------------
// 16. summarize_history
// ---------------------------------------------------------------------------

pub fn summarize_history(ctx: &mut TurnCtx<'_>) -> NodeToken {
    let mut parts: Vec<String> = Vec::new();

    if let Some(id) = ctx.state.selected_patient_id {
        match ctx.cached_name(id) {
            Some(name) => parts.push(format!("current patient: #{id} ({name})")),
            None => parts.push(format!("current patient: #{id}")),
        }
    }
    if !ctx.state.patient_cache.is_empty() {
        parts.push(format!("{} patients cached", ctx.state.patient_cache.len()));
    }
    if ctx.state.pending_action != PendingAction::None {
        parts.push(format!("pending action: {:?}", ctx.state.pending_action));
    }
    if !ctx.state.pending_fields.is_empty() {
        let fields = ctx
            .state
            .pending_fields
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("waiting on: {fields}"));
    }
    if let (Some(req), Some(resp)) = (&ctx.state.last_tool_request, &ctx.state.last_tool_response)
    {
        parts.push(format!(
            "last backend call: {} {} -> {}",
            req.method, req.url, resp.status
        ));
    }
    if !ctx.state.scan_results_buffer.is_empty() {
        parts.push(format!(
            "{} scan results buffered",
            ctx.state.scan_results_buffer.len()
        ));
    }

    ctx.state.history_summary = if parts.is_empty() {
        "no open context".to_string()
    } else {
        parts.join("; ")
    };
    NodeToken::Next
}

// ---------------------------------------------------------------------------
// 17. finalize_response
// ---------------------------------------------------------------------------

pub fn finalize_response(ctx: &mut TurnCtx<'_>) -> String {
    let text = if ctx.reply.is_empty() {
        reply::unknown_intent()
    } else {
        ctx.reply.join("\n")
    };
    // Masking at the boundary; the explicit-disclosure path is the single
    // exception and sets the flag itself.
    let masked = if ctx.allow_raw_nric {
        text
    } else {
        mask_text(&text)
    };
    ctx.state.push_message(Role::Assistant, masked.clone());
    masked
}
