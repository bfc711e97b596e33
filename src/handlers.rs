use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use json_patch::diff;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{error, warn};

use crate::engine::{Decision, PolicyEngine};
use crate::metrics::Metrics;

pub struct AppState {
    pub engine: PolicyEngine,
    pub metrics: Metrics,
}

pub type SharedState = Arc<AppState>;

pub async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(resp) => return review_to_json(resp.into_review()),
    };
    review_to_json(mutate_response(&state, &req).await.into_review())
}

pub async fn handle_validate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(resp) => return review_to_json(resp.into_review()),
    };
    review_to_json(validate_response(&state, &req).await.into_review())
}

fn parse_request(body: serde_json::Value) -> Result<AdmissionRequest<Pod>, AdmissionResponse> {
    let review: AdmissionReview<Pod> = serde_json::from_value(body).map_err(|e| {
        warn!("failed to deserialize AdmissionReview: {e}");
        AdmissionResponse::invalid(format!("failed to deserialize request: {e}"))
    })?;
    review.try_into().map_err(|e| {
        warn!("AdmissionReview missing request field: {e}");
        AdmissionResponse::invalid("missing request field in AdmissionReview")
    })
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(review).expect("AdmissionReview serialization is infallible"))
}

async fn mutate_response(state: &AppState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    if matches!(req.operation, Operation::Delete) {
        return AdmissionResponse::from(req);
    }
    state.metrics.mutation_total.inc();

    let Some(pod) = &req.object else {
        warn!(uid = %req.uid, "mutation request without a pod object");
        return AdmissionResponse::invalid("expected a Pod object in the admission request");
    };

    let mutation = state.engine.mutate(pod).await;
    state.metrics.mutation_exempted.inc_by(mutation.exempted);

    let resp = AdmissionResponse::from(req);
    let before = serde_json::to_value(pod).expect("Pod serialization is infallible");
    let after =
        serde_json::to_value(&mutation.pod).expect("Pod serialization is infallible");
    let patch = diff(&before, &after);
    if patch.0.is_empty() {
        return resp;
    }
    match resp.with_patch(patch) {
        Ok(patched) => patched,
        Err(e) => {
            // The validating webhook still rejects anything left unpinned.
            error!(uid = %req.uid, "failed to serialize patch, admitting unpatched: {e}");
            let mut fallback = AdmissionResponse::from(req);
            fallback.warnings = Some(vec![
                "imagetrust: failed to serialize mutation patch".to_string(),
            ]);
            fallback
        }
    }
}

async fn validate_response(state: &AppState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    if matches!(req.operation, Operation::Delete) {
        return AdmissionResponse::from(req);
    }
    state.metrics.validation_total.inc();

    let Some(pod) = &req.object else {
        warn!(uid = %req.uid, "validation request without a pod object");
        return AdmissionResponse::invalid("expected a Pod object in the admission request");
    };

    let verdict = state.engine.validate(pod).await;
    state.metrics.validation_exempted.inc_by(verdict.exempted);

    match verdict.decision {
        Decision::Deny { field, reason } => {
            state.metrics.denied.inc();
            AdmissionResponse::from(req).deny(format!("{field}: {reason}"))
        }
        Decision::Error(msg) => {
            error!(uid = %req.uid, "validation failed: {msg}");
            AdmissionResponse::invalid(msg)
        }
        Decision::Allow => {
            let mut resp = AdmissionResponse::from(req);
            if verdict.warnings.is_empty() {
                state.metrics.allowed.inc();
            } else {
                state.metrics.warnings.inc();
                resp.warnings = Some(verdict.warnings);
            }
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::config::{Settings, TrustStore};

    const D1: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

    fn state(settings: Settings) -> SharedState {
        let mapping: HashMap<String, String> =
            [("busybox".to_string(), D1.to_string())].into_iter().collect();
        let trust = Arc::new(TrustStore::for_tests(settings, mapping));
        Arc::new(AppState {
            engine: PolicyEngine::new(trust),
            metrics: Metrics::unregistered(),
        })
    }

    fn request(operation: &str, image: &str) -> AdmissionRequest<Pod> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "test-pod",
                "namespace": "default",
                "operation": operation,
                "userInfo": {},
                "oldObject": null,
                "dryRun": false,
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "test-pod"},
                    "spec": {"containers": [{"name": "app", "image": image}]}
                }
            }
        });
        parse_request(review).expect("well-formed review parses")
    }

    #[tokio::test]
    async fn test_mutate_emits_image_patch() {
        let state = state(Settings::default());
        let req = request("CREATE", "busybox:stable");

        let resp = mutate_response(&state, &req).await;
        assert!(resp.allowed);
        let rendered = String::from_utf8(resp.patch.expect("patch present")).unwrap();
        assert!(rendered.contains("/spec/containers/0/image"));
        assert!(rendered.contains(&format!("busybox:stable@{D1}")));
        assert_eq!(state.metrics.mutation_total.get(), 1);
    }

    #[tokio::test]
    async fn test_mutate_without_changes_has_no_patch() {
        let state = state(Settings::default());
        let req = request("CREATE", &format!("busybox@{D1}"));

        let resp = mutate_response(&state, &req).await;
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }

    #[tokio::test]
    async fn test_validate_denies_untrusted_pod() {
        let state = state(Settings::default());
        let req = request("CREATE", "curlimages/curl:7");

        let resp = validate_response(&state, &req).await;
        assert!(!resp.allowed);
        assert_eq!(state.metrics.denied.get(), 1);
        assert_eq!(state.metrics.allowed.get(), 0);
    }

    #[tokio::test]
    async fn test_validate_warn_mode_allows_with_warnings() {
        let state = state(Settings {
            validation_mode: "warn".to_string(),
            ..Settings::default()
        });
        let req = request("UPDATE", "curlimages/curl:7");

        let resp = validate_response(&state, &req).await;
        assert!(resp.allowed);
        let warnings = resp.warnings.expect("warnings present");
        assert!(warnings[0].starts_with("forbidden:"));
        assert_eq!(state.metrics.warnings.get(), 1);
        assert_eq!(state.metrics.denied.get(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_always_allowed() {
        let state = state(Settings::default());
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "test-pod",
                "namespace": "default",
                "operation": "DELETE",
                "userInfo": {},
                "object": null,
                "oldObject": null,
                "dryRun": false
            }
        });
        let req = parse_request(review).unwrap();

        let resp = validate_response(&state, &req).await;
        assert!(resp.allowed);
        assert_eq!(state.metrics.validation_total.get(), 0);

        let resp = mutate_response(&state, &req).await;
        assert!(resp.allowed);
        assert_eq!(state.metrics.mutation_total.get(), 0);
    }

    #[tokio::test]
    async fn test_malformed_review_is_rejected() {
        let resp = parse_request(json!({"not": "a review"})).unwrap_err();
        assert!(!resp.allowed);
    }

    #[tokio::test]
    async fn test_validate_allows_trusted_pod() {
        let state = state(Settings::default());
        let req = request("CREATE", &format!("busybox@{D1}"));

        let resp = validate_response(&state, &req).await;
        assert!(resp.allowed);
        assert!(resp.warnings.is_none());
        assert_eq!(state.metrics.allowed.get(), 1);
    }
}
