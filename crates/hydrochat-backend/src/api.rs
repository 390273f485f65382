//! The six tool operations, typed end to end.
//!
//! `PatientApi` is the seam between the conversation graph and the wire:
//! production uses `HttpPatientApi` over the envelope; tests substitute an
//! in-memory fake. Every reply carries the masked call trace so the graph
//! can record it in state without touching raw bodies.

use async_trait::async_trait;
use reqwest::Method;

use hydrochat_core::types::{Patient, PatientPayload, ScanResult, ToolRequestSnapshot};

use crate::envelope::{CallTrace, RestClient};
use crate::error::{parse_field_errors, ToolError};

/// Outcome of one tool invocation: the masked trace plus the typed result.
#[derive(Debug, Clone)]
pub struct ToolReply<T> {
    pub trace: CallTrace,
    pub outcome: Result<T, ToolError>,
}

#[async_trait]
pub trait PatientApi: Send + Sync {
    async fn create_patient(&self, payload: &PatientPayload) -> ToolReply<Patient>;
    async fn list_patients(&self) -> ToolReply<Vec<Patient>>;
    async fn get_patient(&self, id: i64) -> ToolReply<Patient>;
    async fn update_patient(&self, id: i64, payload: &PatientPayload) -> ToolReply<Patient>;
    async fn delete_patient(&self, id: i64) -> ToolReply<()>;
    async fn list_scan_results(&self, patient_id: i64) -> ToolReply<Vec<ScanResult>>;
}

pub struct HttpPatientApi {
    rest: RestClient,
}

impl HttpPatientApi {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl PatientApi for HttpPatientApi {
    async fn create_patient(&self, payload: &PatientPayload) -> ToolReply<Patient> {
        let body = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => return encode_failure("POST", "/api/patients/", e),
        };
        let (trace, result) = self
            .rest
            .request(Method::POST, "/api/patients/", Some(&body), &[])
            .await;
        let outcome = result
            .map_err(map_validation)
            .and_then(|resp| decode(&resp.body));
        ToolReply { trace, outcome }
    }

    async fn list_patients(&self) -> ToolReply<Vec<Patient>> {
        let (trace, result) = self
            .rest
            .request(Method::GET, "/api/patients/", None, &[])
            .await;
        let outcome = result.and_then(|resp| decode(&resp.body));
        ToolReply { trace, outcome }
    }

    async fn get_patient(&self, id: i64) -> ToolReply<Patient> {
        let path = format!("/api/patients/{id}/");
        let (trace, result) = self.rest.request(Method::GET, &path, None, &[]).await;
        let outcome = result
            .map_err(map_not_found)
            .and_then(|resp| decode(&resp.body));
        ToolReply { trace, outcome }
    }

    async fn update_patient(&self, id: i64, payload: &PatientPayload) -> ToolReply<Patient> {
        let path = format!("/api/patients/{id}/");
        let body = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => return encode_failure("PUT", &path, e),
        };
        let (trace, result) = self.rest.request(Method::PUT, &path, Some(&body), &[]).await;
        let outcome = result
            .map_err(map_not_found)
            .map_err(map_validation)
            .and_then(|resp| decode(&resp.body));
        ToolReply { trace, outcome }
    }

    async fn delete_patient(&self, id: i64) -> ToolReply<()> {
        let path = format!("/api/patients/{id}/");
        let (trace, result) = self.rest.request(Method::DELETE, &path, None, &[]).await;
        let outcome = result.map_err(map_not_found).map(|_| ());
        ToolReply { trace, outcome }
    }

    async fn list_scan_results(&self, patient_id: i64) -> ToolReply<Vec<ScanResult>> {
        let (trace, result) = self
            .rest
            .request(
                Method::GET,
                "/api/scan-results/",
                None,
                &[("patient", patient_id.to_string())],
            )
            .await;
        let outcome = result.and_then(|resp| decode(&resp.body));
        ToolReply { trace, outcome }
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ToolError> {
    serde_json::from_str(body).map_err(|e| ToolError::Decode(e.to_string()))
}

/// 400 bodies shaped like a DRF field-error map become `Validation`; every
/// other 400 stays an `Http` error.
fn map_validation(err: ToolError) -> ToolError {
    if let ToolError::Http { status: 400, body } = &err {
        if let Some(field_errors) = parse_field_errors(body) {
            return ToolError::Validation { field_errors };
        }
    }
    err
}

fn map_not_found(err: ToolError) -> ToolError {
    match err {
        ToolError::Http { status: 404, .. } => ToolError::NotFound,
        other => other,
    }
}

/// Serialization of a payload we built ourselves failing is a programming
/// error, but it must not panic mid-turn; surface it as a decode failure
/// with an empty trace.
fn encode_failure<T>(method: &str, path: &str, e: serde_json::Error) -> ToolReply<T> {
    ToolReply {
        trace: CallTrace {
            request: ToolRequestSnapshot {
                method: method.to_string(),
                url: path.to_string(),
                body: None,
                attempt: 0,
            },
            response: None,
            error: None,
            retries: 0,
            elapsed_ms: 0,
        },
        outcome: Err(ToolError::Decode(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_mapping_requires_field_map_shape() {
        let mapped = map_validation(ToolError::Http {
            status: 400,
            body: r#"{"nric": ["already exists"]}"#.into(),
        });
        assert!(matches!(mapped, ToolError::Validation { .. }));

        let unmapped = map_validation(ToolError::Http {
            status: 400,
            body: "bad request".into(),
        });
        assert!(matches!(unmapped, ToolError::Http { status: 400, .. }));
    }

    #[test]
    fn not_found_mapping_only_touches_404() {
        assert_eq!(
            map_not_found(ToolError::Http {
                status: 404,
                body: String::new()
            }),
            ToolError::NotFound
        );
        assert!(matches!(
            map_not_found(ToolError::Http {
                status: 500,
                body: String::new()
            }),
            ToolError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn decode_surfaces_parse_errors() {
        let result: Result<Patient, _> = decode("not json");
        assert!(matches!(result, Err(ToolError::Decode(_))));
    }
}
