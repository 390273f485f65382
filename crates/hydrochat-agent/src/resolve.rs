//! Patient reference resolution against the per-conversation cache.
//!
//! Numeric ids pass through verbatim. Names are matched case-insensitively
//! against `first_name + " " + last_name` — exact matches only, no fuzzy or
//! phonetic fallback. Zero matches is an answer, not a guess.

use hydrochat_backend::{CallTrace, PatientApi};
use hydrochat_core::types::DisambiguationOption;
use hydrochat_sessions::state::ConversationState;

use crate::extract::PatientRef;

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched(i64),
    Candidates(Vec<DisambiguationOption>),
    NoneFound(String),
    /// The cache refresh failed even after one extra attempt; resolution is
    /// abandoned with a user-visible explanation.
    FetchFailed,
}

/// Resolve `reference`, refreshing the cache when empty or older than five
/// minutes. Returns the traces of any list calls made so the caller can
/// record them in state.
pub async fn resolve(
    state: &mut ConversationState,
    api: &dyn PatientApi,
    reference: &PatientRef,
) -> (Resolution, Vec<CallTrace>) {
    let mut traces = Vec::new();

    let query = match reference {
        PatientRef::Id(id) => return (Resolution::Matched(*id), traces),
        PatientRef::Name(name) => normalize_query(name),
    };

    if state.cache_is_stale(chrono::Utc::now()) {
        // One resolution-level retry on top of the envelope's own budget.
        let mut loaded = false;
        for _ in 0..2 {
            let reply = api.list_patients().await;
            let ok = reply.outcome.is_ok();
            if let Ok(patients) = reply.outcome {
                state.load_patient_cache(patients, chrono::Utc::now());
                loaded = true;
            }
            traces.push(reply.trace);
            if ok {
                break;
            }
        }
        if !loaded {
            return (Resolution::FetchFailed, traces);
        }
    }

    let candidates: Vec<DisambiguationOption> = state
        .patient_cache
        .iter()
        .filter(|p| normalize_query(&p.display_name()) == query)
        .map(|p| DisambiguationOption {
            id: p.id,
            display_name: p.display_name(),
            masked_nric: p.masked_nric(),
        })
        .collect();

    let resolution = match candidates.len() {
        0 => Resolution::NoneFound(query),
        1 => Resolution::Matched(candidates[0].id),
        _ => Resolution::Candidates(candidates),
    };
    (resolution, traces)
}

fn normalize_query(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Interpret a reply to a disambiguation list: an exact candidate id first,
/// then a 1-based index into the displayed list.
pub fn selection_from_reply(options: &[DisambiguationOption], message: &str) -> Option<i64> {
    let trimmed = message.trim().trim_start_matches('#');
    let number: i64 = trimmed.parse().ok()?;
    if options.iter().any(|o| o.id == number) {
        return Some(number);
    }
    let index = usize::try_from(number).ok()?;
    if (1..=options.len()).contains(&index) {
        return Some(options[index - 1].id);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use hydrochat_backend::{ToolError, ToolReply};
    use hydrochat_core::config::ConfigSnapshot;
    use hydrochat_core::types::{
        Patient, PatientPayload, ScanResult, ToolRequestSnapshot,
    };

    fn patient(id: i64, first: &str, last: &str) -> Patient {
        Patient {
            id,
            first_name: first.into(),
            last_name: last.into(),
            nric: "S1234567A".into(),
            date_of_birth: None,
            contact_no: None,
            details: None,
            user: None,
        }
    }

    fn trace() -> CallTrace {
        CallTrace {
            request: ToolRequestSnapshot {
                method: "GET".into(),
                url: "/api/patients/".into(),
                body: None,
                attempt: 1,
            },
            response: None,
            error: None,
            retries: 0,
            elapsed_ms: 1,
        }
    }

    /// List-only fake: scripted patients, optional leading failures.
    struct ListFake {
        patients: Vec<Patient>,
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PatientApi for ListFake {
        async fn create_patient(&self, _p: &PatientPayload) -> ToolReply<Patient> {
            unimplemented!("not used in resolve tests")
        }
        async fn list_patients(&self) -> ToolReply<Vec<Patient>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if call < self.failures_before_success {
                Err(ToolError::Http {
                    status: 503,
                    body: String::new(),
                })
            } else {
                Ok(self.patients.clone())
            };
            ToolReply {
                trace: trace(),
                outcome,
            }
        }
        async fn get_patient(&self, _id: i64) -> ToolReply<Patient> {
            unimplemented!("not used in resolve tests")
        }
        async fn update_patient(&self, _id: i64, _p: &PatientPayload) -> ToolReply<Patient> {
            unimplemented!("not used in resolve tests")
        }
        async fn delete_patient(&self, _id: i64) -> ToolReply<()> {
            unimplemented!("not used in resolve tests")
        }
        async fn list_scan_results(&self, _patient_id: i64) -> ToolReply<Vec<ScanResult>> {
            unimplemented!("not used in resolve tests")
        }
    }

    fn state() -> ConversationState {
        ConversationState::new(ConfigSnapshot {
            base_url: "http://backend.local".into(),
            auth_token: None,
            timeout_seconds: 10,
        })
    }

    #[tokio::test]
    async fn numeric_id_passes_through_without_cache() {
        let fake = ListFake {
            patients: vec![],
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, traces) = resolve(&mut st, &fake, &PatientRef::Id(42)).await;
        assert_eq!(res, Resolution::Matched(42));
        assert!(traces.is_empty());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exact_single_match_resolves() {
        let fake = ListFake {
            patients: vec![patient(7, "John", "Doe"), patient(8, "Jane", "Tan")],
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, _) = resolve(&mut st, &fake, &PatientRef::Name("john DOE".into())).await;
        assert_eq!(res, Resolution::Matched(7));
        assert_eq!(st.patient_cache.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_return_candidates() {
        let fake = ListFake {
            patients: vec![patient(12, "John", "Lee"), patient(34, "John", "Lee")],
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, _) = resolve(&mut st, &fake, &PatientRef::Name("John Lee".into())).await;
        match res {
            Resolution::Candidates(options) => {
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].id, 12);
                assert_eq!(options[0].masked_nric, "S******7A");
            }
            other => panic!("expected candidates, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_matches_do_not_guess() {
        let fake = ListFake {
            patients: vec![patient(7, "John", "Doe")],
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, _) = resolve(&mut st, &fake, &PatientRef::Name("Johnny Doe".into())).await;
        assert_eq!(res, Resolution::NoneFound("johnny doe".into()));
    }

    #[tokio::test]
    async fn fresh_cache_skips_refresh() {
        let fake = ListFake {
            patients: vec![],
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        st.load_patient_cache(vec![patient(7, "John", "Doe")], chrono::Utc::now());
        let (res, _) = resolve(&mut st, &fake, &PatientRef::Name("John Doe".into())).await;
        assert_eq!(res, Resolution::Matched(7));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_failure_then_success_retries() {
        let fake = ListFake {
            patients: vec![patient(7, "John", "Doe")],
            failures_before_success: 1,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, traces) = resolve(&mut st, &fake, &PatientRef::Name("John Doe".into())).await;
        assert_eq!(res, Resolution::Matched(7));
        assert_eq!(traces.len(), 2);
    }

    #[tokio::test]
    async fn two_failures_abandon_resolution() {
        let fake = ListFake {
            patients: vec![],
            failures_before_success: 99,
            calls: AtomicU32::new(0),
        };
        let mut st = state();
        let (res, _) = resolve(&mut st, &fake, &PatientRef::Name("John Doe".into())).await;
        assert_eq!(res, Resolution::FetchFailed);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn selection_prefers_candidate_id() {
        let options = vec![
            DisambiguationOption {
                id: 12,
                display_name: "John Lee".into(),
                masked_nric: "S******7A".into(),
            },
            DisambiguationOption {
                id: 34,
                display_name: "John Lee".into(),
                masked_nric: "T******1Z".into(),
            },
        ];
        assert_eq!(selection_from_reply(&options, "12"), Some(12));
        assert_eq!(selection_from_reply(&options, " #34 "), Some(34));
        // falls back to 1-based index
        assert_eq!(selection_from_reply(&options, "1"), Some(12));
        assert_eq!(selection_from_reply(&options, "2"), Some(34));
        assert_eq!(selection_from_reply(&options, "3"), None);
        assert_eq!(selection_from_reply(&options, "John"), None);
    }
}
