//! The turn loop: one user message in, exactly one assistant reply out.
//!
//! A turn ingests the message, handles developer commands and cancellation,
//! picks its entry node from the pending-flow state (confirmation waiting,
//! disambiguation waiting, field collection, scan pagination), then drives
//! the node graph through the routing table until the chain stops. The
//! summarizer and `finalize_response` always run last.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use hydrochat_backend::PatientApi;
use hydrochat_core::config::LlmConfig;
use hydrochat_core::logfmt::{log_line, Category};
use hydrochat_core::phrases;
use hydrochat_sessions::state::{
    AgentOp, ConfirmationType, ConversationState, DownloadStage, Intent, PendingAction,
};

use crate::classify;
use crate::error::AgentError;
use crate::graph::nodes::{self, MAX_USER_MESSAGE_CHARS};
use crate::graph::token::{route, Flow, NodeId, NodeToken};
use crate::graph::turn::TurnCtx;
use crate::llm::{llm_cost_usd, LlmProvider};
use crate::reply;
use crate::resolve;

/// Turns whose CPU-side work exceeds this are logged as slow; network waits
/// are excluded.
const SLOW_TURN_WARN_MS: u64 = 2000;
/// Upper bound on node hops per turn; exceeding it means a routing cycle.
const MAX_NODE_HOPS: u32 = 32;

pub struct TurnEngine {
    api: Arc<dyn PatientApi>,
    llm: Option<Arc<dyn LlmProvider>>,
    llm_config: LlmConfig,
}

/// What the facade returns to the client, plus timing for the sample buffer.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub reply: String,
    pub agent_op: AgentOp,
    pub elapsed_ms: u64,
    /// Elapsed minus REST/LLM wait time.
    pub compute_ms: u64,
}

impl TurnEngine {
    pub fn new(
        api: Arc<dyn PatientApi>,
        llm: Option<Arc<dyn LlmProvider>>,
        llm_config: LlmConfig,
    ) -> Self {
        Self {
            api,
            llm,
            llm_config,
        }
    }

    /// Run one conversation turn. The caller holds the conversation mutex.
    pub async fn run_turn(
        &self,
        state: &mut ConversationState,
        message: &str,
    ) -> Result<TurnOutput, AgentError> {
        let started = Instant::now();
        let trimmed = message.trim().to_string();
        let mut ctx = TurnCtx::new(
            state,
            self.api.as_ref(),
            self.llm.as_deref(),
            &self.llm_config,
            trimmed,
        );

        nodes::ingest_user_message(&mut ctx);

        if ctx.message.chars().count() > MAX_USER_MESSAGE_CHARS {
            ctx.say(format!(
                "That message is too long (over {MAX_USER_MESSAGE_CHARS} characters). \
                 Please shorten it."
            ));
            return Ok(finish(ctx, started));
        }

        if self.intercept_command(&mut ctx) {
            return Ok(finish(ctx, started));
        }

        if phrases::is_cancellation(&ctx.message) {
            let had_pending = ctx.state.pending_action != PendingAction::None
                || ctx.state.confirmation_required
                || !ctx.state.disambiguation_options.is_empty()
                || !ctx.state.pending_fields.is_empty()
                || ctx.state.download_stage != DownloadStage::None;
            if had_pending {
                ctx.state.metrics.aborted_ops += 1;
            }
            ctx.state.reset_pending();
            log_line(Category::Confirm, "cancellation honored");
            ctx.say(reply::cancelled());
            return Ok(finish(ctx, started));
        }

        let Some(mut node) = self.resume_point(&mut ctx) else {
            return Ok(finish(ctx, started));
        };

        let mut hops: u32 = 0;
        loop {
            hops += 1;
            if hops > MAX_NODE_HOPS {
                return Err(AgentError::Internal(format!(
                    "node budget exceeded at {node:?}"
                )));
            }
            let token = self.run_node(node, &mut ctx).await?;
            match route(node, token, ctx.state)? {
                Flow::Goto(next) => node = next,
                Flow::Stop => break,
            }
        }

        Ok(finish(ctx, started))
    }

    async fn run_node(
        &self,
        node: NodeId,
        ctx: &mut TurnCtx<'_>,
    ) -> Result<NodeToken, AgentError> {
        let token = match node {
            NodeId::IngestUserMessage => nodes::ingest_user_message(ctx),
            NodeId::ClassifyIntent => nodes::classify_intent(ctx).await,
            NodeId::ExtractEntitiesAndFields => nodes::extract_entities_and_fields(ctx).await,
            NodeId::ResolvePatientReference => nodes::resolve_patient_reference(ctx).await,
            NodeId::HandleAmbiguity => nodes::handle_ambiguity(ctx),
            NodeId::CollectMissingFields => nodes::collect_missing_fields(ctx),
            NodeId::ConfirmationGate => nodes::confirmation_gate(ctx),
            NodeId::PrepareToolPayload => nodes::prepare_tool_payload(ctx).await,
            NodeId::ExecuteTool => nodes::execute_tool(ctx).await,
            NodeId::HandleToolError => nodes::handle_tool_error(ctx),
            NodeId::UpdateStatePostTool => nodes::update_state_post_tool(ctx),
            NodeId::FetchScanResults => nodes::fetch_scan_results(ctx).await,
            NodeId::PaginateScanResults => nodes::paginate_scan_results(ctx),
            NodeId::FormatScanPreviews => nodes::format_scan_previews(ctx),
            NodeId::ProvideStlLinks => nodes::provide_stl_links(ctx),
            NodeId::SummarizeHistory => nodes::summarize_history(ctx),
            // finalize runs after the loop, never from the routing table
            NodeId::FinalizeResponse => {
                return Err(AgentError::Internal(
                    "finalize_response dispatched mid-chain".to_string(),
                ))
            }
        };
        Ok(token)
    }

    /// Developer commands, intercepted before classification.
    fn intercept_command(&self, ctx: &mut TurnCtx<'_>) -> bool {
        let lower = ctx.message.to_lowercase();
        if lower == "show agent stats" {
            self.stats_reply(ctx);
            return true;
        }
        if lower == "refresh patients" {
            ctx.state.invalidate_patient_cache();
            ctx.say("Patient cache refreshed. I'll reload it on the next lookup.");
            return true;
        }
        if lower.starts_with("show full nric") {
            let rest = ctx.message["show full nric".len()..].trim().to_string();
            full_nric_reply(ctx, &rest);
            return true;
        }
        false
    }

    fn stats_reply(&self, ctx: &mut TurnCtx<'_>) {
        let m = ctx.state.metrics.clone();
        let cache_age = ctx
            .state
            .cache_age_seconds(chrono::Utc::now())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let cost = llm_cost_usd(
            m.llm_prompt_tokens,
            m.llm_completion_tokens,
            self.llm_config.input_rate_per_mtok,
            self.llm_config.output_rate_per_mtok,
        );
        ctx.say(format!(
            "Agent stats:\n\
             - total_api_calls: {}\n\
             - retries: {}\n\
             - successful_ops: {}\n\
             - aborted_ops: {}\n\
             - cached_patients: {}\n\
             - cache_age_seconds: {}\n\
             - llm_prompt_tokens: {}\n\
             - llm_completion_tokens: {}\n\
             - llm_cost_usd: {:.6}",
            m.total_api_calls,
            m.retries,
            m.successful_ops,
            m.aborted_ops,
            ctx.state.patient_cache.len(),
            cache_age,
            m.llm_prompt_tokens,
            m.llm_completion_tokens,
            cost,
        ));
    }

    /// Pick the entry node from the pending-flow state. `None` means the
    /// turn was answered inline (e.g. a disambiguation list restated).
    fn resume_point(&self, ctx: &mut TurnCtx<'_>) -> Option<NodeId> {
        let lower = ctx.message.to_lowercase();

        // "show more scans" works while the STL question is outstanding.
        if ctx.state.download_stage == DownloadStage::PreviewShown && lower.contains("more scan") {
            ctx.wants_more_pending = true;
            ctx.state.intent = Intent::GetScanResults;
            return Some(NodeId::FormatScanPreviews);
        }

        if ctx.state.awaiting_confirmation_type != ConfirmationType::None {
            ctx.state.intent = if ctx.state.awaiting_confirmation_type == ConfirmationType::Delete
            {
                Intent::DeletePatient
            } else {
                Intent::GetScanResults
            };
            return Some(NodeId::ConfirmationGate);
        }

        if !ctx.state.disambiguation_options.is_empty() {
            // A fresh command abandons the pending selection.
            if classify::matches_any_rule(&ctx.message) {
                ctx.state.disambiguation_options.clear();
                ctx.state.pending_action = PendingAction::None;
                return Some(NodeId::ClassifyIntent);
            }
            if let Some(id) =
                resolve::selection_from_reply(&ctx.state.disambiguation_options, &ctx.message)
            {
                ctx.state.selected_patient_id = Some(id);
                ctx.state.disambiguation_options.clear();
                ctx.state.intent = ctx.state.pending_action.intent();
                return Some(NodeId::CollectMissingFields);
            }
            let options = ctx.state.disambiguation_options.clone();
            let query = options
                .first()
                .map(|o| o.display_name.clone())
                .unwrap_or_default();
            ctx.say(reply::disambiguation_list(&query, &options));
            return None;
        }

        if ctx.state.pending_action != PendingAction::None && !ctx.state.pending_fields.is_empty()
        {
            ctx.state.intent = ctx.state.pending_action.intent();
            ctx.pending_at_entry = ctx.state.pending_fields.clone();
            return Some(NodeId::ExtractEntitiesAndFields);
        }

        Some(NodeId::ClassifyIntent)
    }
}

/// Full-NRIC disclosure: only values this user typed in this conversation
/// are ever shown raw.
fn full_nric_reply(ctx: &mut TurnCtx<'_>, target: &str) {
    let target = target
        .strip_prefix("for ")
        .or_else(|| target.strip_prefix("of "))
        .unwrap_or(target)
        .trim();
    let candidates: Vec<String> = if !target.is_empty() {
        ctx.state
            .patient_cache
            .iter()
            .filter(|p| p.display_name().eq_ignore_ascii_case(target))
            .map(|p| p.nric.clone())
            .collect()
    } else if let Some(id) = ctx.state.selected_patient_id {
        ctx.state
            .patient_cache
            .iter()
            .filter(|p| p.id == id)
            .map(|p| p.nric.clone())
            .collect()
    } else {
        ctx.state.user_supplied_nrics.iter().cloned().collect()
    };

    let disclosable: Vec<String> = candidates
        .into_iter()
        .filter(|nric| ctx.state.user_supplied_nrics.contains(nric))
        .collect();

    if disclosable.is_empty() {
        ctx.say(
            "I can only show an NRIC in full when you provided it yourself in \
             this conversation. Stored identifiers stay masked.",
        );
    } else {
        ctx.allow_raw_nric = true;
        ctx.say(format!("Full NRIC: {}", disclosable.join(", ")));
    }
}

fn finish(mut ctx: TurnCtx<'_>, started: Instant) -> TurnOutput {
    if ctx.state.total_turns > 5 {
        nodes::summarize_history(&mut ctx);
    }
    let text = nodes::finalize_response(&mut ctx);
    let agent_op = ctx.agent_op;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let compute_ms = elapsed_ms.saturating_sub(ctx.network_ms);
    if compute_ms > SLOW_TURN_WARN_MS {
        warn!(
            target: "hydrochat",
            elapsed_ms,
            compute_ms,
            "turn exceeded the slow-turn threshold"
        );
    }

    TurnOutput {
        reply: text,
        agent_op,
        elapsed_ms,
        compute_ms,
    }
}
