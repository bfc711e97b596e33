use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TrustStore;
use crate::metrics::Metrics;
use crate::server::Shutdown;

const FIELD_MANAGER: &str = "imagetrust-sweep";

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to list pods: {0}")]
    List(#[source] kube::Error),
    #[error("{count} pod(s) still failing after {passes} passes: {names}")]
    Exhausted {
        count: usize,
        passes: u64,
        names: String,
    },
}

/// Replays every pre-existing pod through the admission path. Each pod is
/// resubmitted as an update under our field manager, so the webhook mutates
/// or rejects it exactly as it would a new pod; rejected pods are deleted
/// when the policy allows. Failing pods are retried in later passes and
/// anything still failing after the last pass is reported as one error.
pub async fn run(
    client: Client,
    trust: Arc<TrustStore>,
    metrics: Metrics,
    mut shutdown: Shutdown,
) -> Result<(), SweepError> {
    let cfg = &trust.settings.existing_pods;

    // Give the API server time to register the webhook before we generate
    // admission traffic against it.
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cfg.start_timeout)) => {}
        _ = shutdown.triggered() => return Ok(()),
    }

    info!("starting existing pods sweep");
    let all_pods: Api<Pod> = Api::all(client.clone());
    let mut pending = all_pods
        .list(&ListParams::default())
        .await
        .map_err(SweepError::List)?
        .items;

    let passes = cfg.retries + 1;
    for pass in 0..passes {
        if pass > 0 {
            info!(pass, remaining = pending.len(), "retrying failed pods");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cfg.retry_timeout)) => {}
                _ = shutdown.triggered() => return Ok(()),
            }
        }

        let mut failed = Vec::new();
        for pod in pending {
            if shutdown.is_triggered() {
                info!("stopping existing pods sweep before it completed");
                return Ok(());
            }
            if let Err(pod) = process_pod(&client, &trust, &metrics, pod).await {
                failed.push(pod);
            }
        }
        pending = failed;
        if pending.is_empty() {
            break;
        }
    }

    if pending.is_empty() {
        info!("existing pods sweep completed");
        Ok(())
    } else {
        let names: Vec<String> = pending
            .iter()
            .map(|p| {
                format!(
                    "{}/{}",
                    p.metadata.namespace.as_deref().unwrap_or_default(),
                    p.metadata.name.as_deref().unwrap_or_default(),
                )
            })
            .collect();
        Err(SweepError::Exhausted {
            count: pending.len(),
            passes,
            names: names.join(", "),
        })
    }
}

/// One attempt for one pod. `Err` hands the pod back for the next pass.
async fn process_pod(
    client: &Client,
    trust: &TrustStore,
    metrics: &Metrics,
    pod: Pod,
) -> Result<(), Pod> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let mut params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    if !trust.settings.existing_pods.update_enabled {
        params.dry_run = true;
    }

    match pods.replace(&name, &params, &pod).await {
        Ok(_) => {
            info!(namespace = %namespace, pod = %name, dry_run = params.dry_run,
                "pod passed back through admission");
            Ok(())
        }
        // The webhook itself denied the update.
        Err(e) if is_api_code(&e, 403) => {
            if !trust.settings.existing_pods.delete_enabled {
                warn!(namespace = %namespace, pod = %name,
                    "webhook rejected pod but deletion is disabled");
                return Err(pod);
            }
            match pods.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    metrics.deleted.inc();
                    info!(namespace = %namespace, pod = %name, "deleted rejected pod");
                    Ok(())
                }
                Err(e) if is_api_code(&e, 404) => Ok(()),
                Err(e) => {
                    warn!(namespace = %namespace, pod = %name, "failed to delete pod: {e}");
                    Err(pod)
                }
            }
        }
        // Pod vanished between the listing and the update.
        Err(e) if is_api_code(&e, 404) => Ok(()),
        Err(e) => {
            warn!(namespace = %namespace, pod = %name, "failed to update pod: {e}");
            Err(pod)
        }
    }
}

fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(Box::new(ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: format!("{reason} by admission webhook"),
            reason: reason.to_string(),
            code,
            metadata: None,
            details: None,
        }))
    }

    #[test]
    fn test_forbidden_is_a_webhook_rejection() {
        assert!(is_api_code(&api_error(403, "Forbidden"), 403));
    }

    #[test]
    fn test_invalid_and_server_errors_are_not_rejections() {
        // Invalid (422) is transient here: only Forbidden means the webhook
        // denied the pod.
        assert!(!is_api_code(&api_error(422, "Invalid"), 403));
        assert!(!is_api_code(&api_error(500, "InternalError"), 403));
        assert!(!is_api_code(&api_error(404, "NotFound"), 403));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_api_code(&api_error(404, "NotFound"), 404));
        assert!(!is_api_code(&api_error(403, "Forbidden"), 404));
    }
}
