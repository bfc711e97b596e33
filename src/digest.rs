use std::collections::HashMap;
use std::sync::Arc;

use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig};
use oci_distribution::secrets::RegistryAuth;
use thiserror::Error;
use tracing::debug;

use crate::config::{Settings, TrustStore};
use crate::image;

/// Credentials file entry used when no host-keyed entry matches.
const DEFAULT_CREDENTIALS_KEY: &str = "default";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid image reference '{image}': {source}")]
    Reference {
        image: String,
        source: oci_distribution::ParseError,
    },
    #[error("failed to fetch descriptor for '{image}': {source}")]
    Fetch {
        image: String,
        source: oci_distribution::errors::OciDistributionError,
    },
    #[error("image '{image}' has no signature verifiable by a trusted signer")]
    Unsigned { image: String },
}

/// Applies the mutation registry rewrite to a reference: strip the registry
/// and, when a target registry is configured, prepend it. Returns `None`
/// when rewriting is disabled or the result is identical.
pub fn apply_registry_rewrite(settings: &Settings, current: &str) -> Option<String> {
    if !settings.mutation_registry_enabled {
        return None;
    }
    let stripped = image::strip_registry(current);
    let rewritten = if settings.mutation_registry.is_empty() {
        stripped.to_string()
    } else {
        format!("{}/{stripped}", settings.mutation_registry)
    };
    (rewritten != current).then_some(rewritten)
}

/// Resolves the digest the policy trusts for an image reference, either from
/// the startup-loaded mapping or live from the registry.
pub struct DigestResolver {
    trust: Arc<TrustStore>,
}

impl DigestResolver {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    /// The trusted digest for `image` (a reference without a digest), or
    /// `None` when the policy knows of none.
    pub async fn trusted_digest(&self, image: &str) -> Result<Option<String>, ResolveError> {
        if !self.trust.settings.fetch_digests.enabled {
            return Ok(self.mapping_digest(image));
        }
        self.fetch_digest(image).await.map(Some)
    }

    /// Mapping lookup with fallbacks: exact key, then (when
    /// `imageDefaultDigest` is on and the reference is tagged) the
    /// tag-stripped form, then the registry-stripped form, then the Docker
    /// Hub official-image alias without its `library/` namespace. Each
    /// fallback restarts the whole chain on the shortened reference.
    pub fn mapping_digest(&self, image: &str) -> Option<String> {
        lookup(
            &self.trust.mapping,
            image,
            self.trust.settings.image_default_digest,
        )
    }

    async fn fetch_digest(&self, image: &str) -> Result<String, ResolveError> {
        let settings = &self.trust.settings;
        // Fetch from where the mutated pod will actually pull.
        let fetch_image =
            apply_registry_rewrite(settings, image).unwrap_or_else(|| image.to_string());

        let reference =
            Reference::try_from(fetch_image.as_str()).map_err(|e| ResolveError::Reference {
                image: fetch_image.clone(),
                source: e,
            })?;
        let auth = self.registry_auth(&fetch_image);

        let client = Client::new(ClientConfig::default());
        let digest = client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .map_err(|e| ResolveError::Fetch {
                image: fetch_image.clone(),
                source: e,
            })?;
        debug!(image = %fetch_image, %digest, "fetched manifest digest");

        if settings.fetch_digests.only_signed {
            // TODO: verify a cosign signature over the fetched digest against
            // trust.signer_certs; until that lands, refuse rather than trust
            // unverified registry content.
            return Err(ResolveError::Unsigned {
                image: fetch_image,
            });
        }
        Ok(digest)
    }

    fn registry_auth(&self, image: &str) -> RegistryAuth {
        let host = image::registry_host(image);
        match self
            .trust
            .registry_credentials
            .get(host)
            .or_else(|| self.trust.registry_credentials.get(DEFAULT_CREDENTIALS_KEY))
        {
            Some(cred) => RegistryAuth::Basic(cred.username.clone(), cred.password.clone()),
            None => {
                if image::has_explicit_registry(image) {
                    debug!(registry = %host, "no credentials for registry, fetching anonymously");
                }
                RegistryAuth::Anonymous
            }
        }
    }
}

fn lookup(mapping: &HashMap<String, String>, image: &str, default_digest: bool) -> Option<String> {
    if let Some(digest) = mapping.get(image) {
        return Some(digest.clone());
    }
    if default_digest {
        let (base, tag) = image::split_tag(image);
        if tag.is_some() {
            if let Some(digest) = lookup(mapping, base, default_digest) {
                return Some(digest);
            }
        }
    }
    let stripped = image::strip_registry(image);
    if stripped != image {
        return lookup(mapping, stripped, default_digest);
    }
    if let Some(rest) = image.strip_prefix(image::LIBRARY_NAMESPACE) {
        return lookup(mapping, rest, default_digest);
    }
    None
}
