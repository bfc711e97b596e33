use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{PullSecretCredential, TrustStore};
use crate::server::Shutdown;

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

struct Ctx {
    client: Client,
    trust: Arc<TrustStore>,
}

/// Projects the configured registry pull secrets into every namespace that
/// matches the selector. Sweeps all existing namespaces once, then watches;
/// the controller serializes events per namespace.
pub async fn run(
    client: Client,
    trust: Arc<TrustStore>,
    mut shutdown: Shutdown,
) -> Result<(), ReconcileError> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ctx = Arc::new(Ctx { client, trust });

    for ns in namespaces.list(&ListParams::default()).await?.items {
        reconcile(Arc::new(ns), ctx.clone()).await?;
    }
    info!("initial namespace sweep completed");

    Controller::new(namespaces, watcher::Config::default())
        .graceful_shutdown_on(async move { shutdown.triggered().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((ns, _)) => debug!(namespace = %ns.name, "reconciled namespace"),
                Err(e) => warn!("namespace reconcile error: {e}"),
            }
        })
        .await;
    Ok(())
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let name = ns.name_any();
    let settings = &ctx.trust.settings;

    if settings
        .pull_secrets_exempted_namespaces
        .iter()
        .any(|excluded| excluded == &name)
    {
        debug!(namespace = %name, "namespace is exempted from pull secrets");
        return Ok(Action::await_change());
    }
    if !selector_matches(
        &settings.pull_secrets_namespace_selector_labels,
        ns.metadata.labels.as_ref(),
    ) {
        debug!(namespace = %name, "namespace does not match the pull secrets selector");
        return Ok(Action::await_change());
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &name);
    for cred in &ctx.trust.pull_secret_credentials {
        ensure_secret(&secrets, &name, cred).await?;
    }
    Ok(Action::await_change())
}

fn error_policy(_ns: Arc<Namespace>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    warn!("namespace reconcile failed, requeueing: {err}");
    Action::requeue(Duration::from_secs(30))
}

async fn ensure_secret(
    secrets: &Api<Secret>,
    namespace: &str,
    cred: &PullSecretCredential,
) -> Result<(), kube::Error> {
    match secrets.get(&cred.name).await {
        Ok(existing) => {
            if secret_is_current(&existing, &cred.docker_cfg) {
                return Ok(());
            }
            let mut updated = existing;
            updated.data = Some(docker_config_data(&cred.docker_cfg));
            updated.string_data = None;
            secrets
                .replace(&cred.name, &PostParams::default(), &updated)
                .await?;
            info!(namespace = %namespace, secret = %cred.name, "updated registry pull secret");
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            secrets
                .create(&PostParams::default(), &desired_secret(namespace, cred))
                .await?;
            info!(namespace = %namespace, secret = %cred.name, "created registry pull secret");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn desired_secret(namespace: &str, cred: &PullSecretCredential) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(cred.name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_SECRET_TYPE.to_string()),
        data: Some(docker_config_data(&cred.docker_cfg)),
        ..Default::default()
    }
}

fn docker_config_data(docker_cfg: &[u8]) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(
        DOCKER_CONFIG_KEY.to_string(),
        ByteString(docker_cfg.to_vec()),
    )])
}

fn secret_is_current(secret: &Secret, docker_cfg: &[u8]) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_KEY))
        .is_some_and(|value| value.0 == docker_cfg)
}

fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.is_some_and(|l| l.get(key) == Some(value)))
}
