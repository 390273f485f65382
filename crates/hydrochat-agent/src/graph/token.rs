//! Node identifiers, control tokens, and the routing table.
//!
//! Both enums are closed: a node returning a token with no routing entry is
//! a developer error and aborts the turn with a diagnostic instead of
//! falling through to the user.

use hydrochat_sessions::state::{ConversationState, DownloadStage, Intent};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    IngestUserMessage,
    ClassifyIntent,
    ExtractEntitiesAndFields,
    ResolvePatientReference,
    HandleAmbiguity,
    CollectMissingFields,
    ConfirmationGate,
    PrepareToolPayload,
    ExecuteTool,
    HandleToolError,
    UpdateStatePostTool,
    FetchScanResults,
    PaginateScanResults,
    FormatScanPreviews,
    ProvideStlLinks,
    SummarizeHistory,
    FinalizeResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeToken {
    /// Linear fall-through for nodes with a single outgoing edge.
    Next,
    AmbiguousPresent,
    Resolved,
    NoMatch,
    NeedMoreFields,
    FieldsComplete,
    AwaitingConfirmation,
    Confirmed,
    Rejected,
    ValidationError,
    RetryLater,
    Proceed,
    NoResults,
    ResultsFound,
    PageReady,
    AwaitingStlConfirm,
    PaginationContinue,
    SkipStl,
    StlLinksSent,
}

/// Where the turn loop goes next. `Stop` ends the action chain; the engine
/// then runs the summarizer (when due) and `finalize_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Goto(NodeId),
    Stop,
}

/// Table lookup from `(node, token)` to the next node. A handful of edges
/// branch on state (the intent, the scan stage) exactly where the node
/// inventory prescribes it; everything else is fixed. Unknown pairs fail
/// closed.
pub fn route(node: NodeId, token: NodeToken, state: &ConversationState) -> Result<Flow, AgentError> {
    use Flow::{Goto, Stop};
    use NodeId::*;
    use NodeToken::*;

    let flow = match (node, token) {
        (IngestUserMessage, Next) => Goto(ClassifyIntent),

        // UNKNOWN has nothing to extract or execute; the clarifying prompt
        // was already queued by the classifier.
        (ClassifyIntent, Next) if state.intent == Intent::Unknown => Stop,
        (ClassifyIntent, Next) => Goto(ExtractEntitiesAndFields),

        (ExtractEntitiesAndFields, Next) => Goto(ResolvePatientReference),

        (ResolvePatientReference, Next) => Goto(HandleAmbiguity),
        (ResolvePatientReference, NoMatch) => Stop,
        (ResolvePatientReference, RetryLater) => Stop,

        (HandleAmbiguity, AmbiguousPresent) => Stop,
        (HandleAmbiguity, Resolved) => Goto(CollectMissingFields),

        (CollectMissingFields, NeedMoreFields) => Stop,
        (CollectMissingFields, FieldsComplete) => Goto(ConfirmationGate),

        (ConfirmationGate, AwaitingConfirmation) => Stop,
        (ConfirmationGate, Confirmed) => {
            if state.download_stage == DownloadStage::AwaitingStlConfirm {
                Goto(ProvideStlLinks)
            } else if state.intent == Intent::GetScanResults {
                Goto(FetchScanResults)
            } else {
                Goto(PrepareToolPayload)
            }
        }
        (ConfirmationGate, Rejected) => Stop,
        (ConfirmationGate, ValidationError) => Goto(CollectMissingFields),

        (PrepareToolPayload, Next) => Goto(ExecuteTool),
        (PrepareToolPayload, ValidationError) => Goto(CollectMissingFields),
        (PrepareToolPayload, RetryLater) => Stop,

        (ExecuteTool, Next) => Goto(HandleToolError),

        (HandleToolError, ValidationError) => Goto(CollectMissingFields),
        (HandleToolError, RetryLater) => Stop,
        (HandleToolError, Proceed) => Goto(UpdateStatePostTool),

        (UpdateStatePostTool, Next) => Stop,

        (FetchScanResults, NoResults) => Stop,
        (FetchScanResults, RetryLater) => Stop,
        (FetchScanResults, ResultsFound) => Goto(PaginateScanResults),

        (PaginateScanResults, PageReady) => Goto(FormatScanPreviews),

        (FormatScanPreviews, AwaitingStlConfirm) => Stop,
        (FormatScanPreviews, PaginationContinue) => Goto(PaginateScanResults),
        (FormatScanPreviews, SkipStl) => Stop,

        (ProvideStlLinks, StlLinksSent) => Stop,

        (SummarizeHistory, Next) => Goto(FinalizeResponse),
        (FinalizeResponse, Next) => Stop,

        (node, token) => return Err(AgentError::InvalidTransition { node, token }),
    };
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrochat_core::config::ConfigSnapshot;

    fn state() -> ConversationState {
        ConversationState::new(ConfigSnapshot {
            base_url: "http://backend.local".into(),
            auth_token: None,
            timeout_seconds: 10,
        })
    }

    #[test]
    fn linear_chain_routes_in_order() {
        let mut st = state();
        st.intent = Intent::CreatePatient;
        assert_eq!(
            route(NodeId::IngestUserMessage, NodeToken::Next, &st).unwrap(),
            Flow::Goto(NodeId::ClassifyIntent)
        );
        assert_eq!(
            route(NodeId::ClassifyIntent, NodeToken::Next, &st).unwrap(),
            Flow::Goto(NodeId::ExtractEntitiesAndFields)
        );
    }

    #[test]
    fn unknown_intent_stops_after_classification() {
        let st = state();
        assert_eq!(
            route(NodeId::ClassifyIntent, NodeToken::Next, &st).unwrap(),
            Flow::Stop
        );
    }

    #[test]
    fn confirmed_routes_by_flow_kind() {
        let mut st = state();
        st.intent = Intent::DeletePatient;
        assert_eq!(
            route(NodeId::ConfirmationGate, NodeToken::Confirmed, &st).unwrap(),
            Flow::Goto(NodeId::PrepareToolPayload)
        );

        st.intent = Intent::GetScanResults;
        assert_eq!(
            route(NodeId::ConfirmationGate, NodeToken::Confirmed, &st).unwrap(),
            Flow::Goto(NodeId::FetchScanResults)
        );

        st.download_stage = DownloadStage::AwaitingStlConfirm;
        assert_eq!(
            route(NodeId::ConfirmationGate, NodeToken::Confirmed, &st).unwrap(),
            Flow::Goto(NodeId::ProvideStlLinks)
        );
    }

    #[test]
    fn validation_error_reenters_clarification() {
        let st = state();
        assert_eq!(
            route(NodeId::HandleToolError, NodeToken::ValidationError, &st).unwrap(),
            Flow::Goto(NodeId::CollectMissingFields)
        );
    }

    #[test]
    fn pagination_continue_loops_back() {
        let st = state();
        assert_eq!(
            route(NodeId::FormatScanPreviews, NodeToken::PaginationContinue, &st).unwrap(),
            Flow::Goto(NodeId::PaginateScanResults)
        );
    }

    #[test]
    fn unknown_pair_fails_closed() {
        let st = state();
        let err = route(NodeId::ProvideStlLinks, NodeToken::PageReady, &st);
        assert!(matches!(err, Err(AgentError::InvalidTransition { .. })));
        let err = route(NodeId::ExecuteTool, NodeToken::Confirmed, &st);
        assert!(matches!(err, Err(AgentError::InvalidTransition { .. })));
    }
}
