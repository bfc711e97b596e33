use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Pod};
use tracing::{info, warn};

use crate::config::{TrustStore, VALIDATION_MODE_FAIL, VALIDATION_MODE_WARN};
use crate::digest::{self, DigestResolver};
use crate::exemptions::Exemptions;
use crate::image;

pub const REASON_NO_DIGEST: &str = "image is not using a digest";
pub const REASON_NO_TRUSTED_DIGEST: &str = "image does not have a trusted digest";
pub const REASON_UNTRUSTED_DIGEST: &str = "image uses an untrusted digest";

/// Outcome of validating one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { field: String, reason: String },
    Error(String),
}

pub struct Verdict {
    pub decision: Decision,
    pub warnings: Vec<String>,
    pub exempted: u64,
}

pub struct Mutation {
    pub pod: Pod,
    pub exempted: u64,
}

/// The admission decision engine. Holds the startup-published trust store,
/// the compiled exemption list and the digest resolver; everything here is
/// read-only after construction, so one instance serves all handlers.
pub struct PolicyEngine {
    trust: Arc<TrustStore>,
    exemptions: Exemptions,
    resolver: DigestResolver,
}

impl PolicyEngine {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        let exemptions = Exemptions::compile(&trust.settings.exemptions);
        let resolver = DigestResolver::new(trust.clone());
        Self {
            trust,
            exemptions,
            resolver,
        }
    }

    /// Rewrites a pod per the mutation policy: registry rewrite, digest
    /// pinning, pull policy, pull-secret injection. The input pod is never
    /// touched; in dry-run mode the returned pod equals the input and every
    /// change is only logged.
    pub async fn mutate(&self, pod: &Pod) -> Mutation {
        let pod_name = display_name(pod);
        let mut mutated = pod.clone();
        let mut exempted = 0;

        if let Some(spec) = mutated.spec.as_mut() {
            if let Some(init) = spec.init_containers.as_mut() {
                exempted += self.mutate_containers(init, &pod_name).await;
            }
            exempted += self.mutate_containers(&mut spec.containers, &pod_name).await;
            let had_secrets = spec.image_pull_secrets.is_some();
            self.inject_pull_secrets(
                spec.image_pull_secrets.get_or_insert_with(Vec::new),
                &pod_name,
            );
            if !had_secrets && spec.image_pull_secrets.as_ref().is_some_and(Vec::is_empty) {
                spec.image_pull_secrets = None;
            }
        }

        Mutation {
            pod: mutated,
            exempted,
        }
    }

    async fn mutate_containers(&self, containers: &mut [Container], pod_name: &str) -> u64 {
        let settings = &self.trust.settings;
        let dry_run = settings.mutation_dry_run;
        let mut exempted = 0;

        for container in containers.iter_mut() {
            let Some(current) = container.image.clone() else {
                continue;
            };
            if self.exemptions.is_exempt(&current) {
                info!(pod = %pod_name, container = %container.name, image = %current,
                    "image is exempt, leaving container untouched");
                exempted += 1;
                continue;
            }

            let mut proposed = current.clone();
            if let Some(rewritten) = digest::apply_registry_rewrite(settings, &proposed) {
                info!(pod = %pod_name, container = %container.name,
                    from = %proposed, to = %rewritten, dry_run, "rewriting image registry");
                proposed = rewritten;
            }

            // Any digest already on the image is replaced, never trusted.
            let bare = image::without_digest(&proposed).to_string();
            match self.resolver.trusted_digest(&bare).await {
                Ok(Some(trusted)) => {
                    proposed = format!("{bare}@{trusted}");
                    info!(pod = %pod_name, container = %container.name,
                        image = %proposed, digest = %trusted, dry_run,
                        "pinning image to trusted digest");
                }
                Ok(None) => {
                    info!(pod = %pod_name, container = %container.name, image = %bare,
                        "no trusted digest for image");
                }
                Err(e) => {
                    warn!(pod = %pod_name, container = %container.name, image = %bare,
                        "failed to resolve trusted digest, leaving image as is: {e}");
                }
            }

            if !dry_run && proposed != current {
                container.image = Some(proposed);
            }

            if !settings.mutation_pull_policy.is_empty()
                && container.image_pull_policy.as_deref()
                    != Some(settings.mutation_pull_policy.as_str())
            {
                info!(pod = %pod_name, container = %container.name,
                    policy = %settings.mutation_pull_policy, dry_run, "setting image pull policy");
                if !dry_run {
                    container.image_pull_policy = Some(settings.mutation_pull_policy.clone());
                }
            }
        }
        exempted
    }

    /// Appends the configured pull secrets the pod does not already
    /// reference, keeping the pod's own entries (and their order) first.
    fn inject_pull_secrets(&self, secrets: &mut Vec<LocalObjectReference>, pod_name: &str) {
        let settings = &self.trust.settings;
        for wanted in &settings.mutation_image_pull_secrets {
            let present = secrets
                .iter()
                .any(|s| s.name == wanted.name);
            if !present {
                info!(pod = %pod_name, secret = %wanted.name,
                    dry_run = settings.mutation_dry_run, "adding image pull secret");
                if !settings.mutation_dry_run {
                    secrets.push(LocalObjectReference {
                        name: wanted.name.clone(),
                    });
                }
            }
        }
    }

    /// Checks every container of the pod, init containers first. In fail
    /// mode the first failing container denies the pod; in warn mode each
    /// failing container contributes one warning and the pod is allowed.
    pub async fn validate(&self, pod: &Pod) -> Verdict {
        let pod_name = display_name(pod);
        let mut warnings = Vec::new();
        let mut exempted = 0;

        let empty = Vec::new();
        let spec = pod.spec.as_ref();
        let init = spec
            .and_then(|s| s.init_containers.as_ref())
            .unwrap_or(&empty);
        let main = spec.map(|s| &s.containers).unwrap_or(&empty);

        for (field_prefix, containers) in [("spec.initContainers", init), ("spec.containers", main)]
        {
            for (i, container) in containers.iter().enumerate() {
                let image = container.image.as_deref().unwrap_or_default();
                if self.exemptions.is_exempt(image) {
                    info!(pod = %pod_name, container = %container.name, image = %image,
                        "image is exempt, skipping validation");
                    exempted += 1;
                    continue;
                }

                let Some(reason) = self.check_image(image, &pod_name).await else {
                    continue;
                };
                let field = format!("{field_prefix}[{i}].image");
                match self.trust.settings.validation_mode.as_str() {
                    VALIDATION_MODE_FAIL => {
                        info!(pod = %pod_name, field = %field, reason = %reason, "denying pod");
                        return Verdict {
                            decision: Decision::Deny {
                                field,
                                reason: reason.to_string(),
                            },
                            warnings,
                            exempted,
                        };
                    }
                    VALIDATION_MODE_WARN => {
                        warnings.push(format!("forbidden: {field}: {reason}"));
                    }
                    other => {
                        return Verdict {
                            decision: Decision::Error(format!(
                                "unknown validation mode '{other}'"
                            )),
                            warnings,
                            exempted,
                        };
                    }
                }
            }
        }

        info!(pod = %pod_name, warnings = warnings.len(), "pod passed digest validation");
        Verdict {
            decision: Decision::Allow,
            warnings,
            exempted,
        }
    }

    /// The first failure that applies to this image, if any.
    async fn check_image(&self, image: &str, pod_name: &str) -> Option<&'static str> {
        let digest = image::extract_digest(image);
        if digest.is_empty() {
            return Some(REASON_NO_DIGEST);
        }
        let bare = image::without_digest(image);
        let trusted = match self.resolver.trusted_digest(bare).await {
            Ok(trusted) => trusted,
            Err(e) => {
                warn!(pod = %pod_name, image = %bare,
                    "failed to resolve trusted digest during validation: {e}");
                None
            }
        };
        match trusted {
            None => Some(REASON_NO_TRUSTED_DIGEST),
            Some(trusted) if !trusted.eq_ignore_ascii_case(digest) => {
                Some(REASON_UNTRUSTED_DIGEST)
            }
            Some(_) => None,
        }
    }
}

fn display_name(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_else(|| "<unnamed>".to_string())
}
