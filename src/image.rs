use std::sync::LazyLock;

use regex::Regex;

pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Official Docker Hub images live under this namespace; `busybox`,
/// `library/busybox` and `docker.io/library/busybox` all name the same
/// repository.
pub const LIBRARY_NAMESPACE: &str = "library/";

static DIGEST_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(sha256:[a-fA-F0-9]{64})$").expect("digest pattern compiles"));

/// Returns the trailing `sha256:<hex64>` digest of an image reference, or an
/// empty string when the reference carries no (well-formed) digest. The hex
/// run must be exactly 64 characters and anchored at the end of the string,
/// so a tag before the `@` is fine but a truncated digest is not.
pub fn extract_digest(image: &str) -> &str {
    DIGEST_SUFFIX
        .captures(image)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("")
}

/// Drops a well-formed trailing digest, returning the bare reference.
pub fn without_digest(image: &str) -> &str {
    match DIGEST_SUFFIX.find(image) {
        Some(m) => &image[..m.start()],
        None => image,
    }
}

/// Removes the registry hostname from an image reference. The first
/// `/`-segment is a registry iff it contains a dot (the rule container
/// tooling uses to tell `library/foo` from `registry.example.com/foo`);
/// anything else is returned unchanged.
pub fn strip_registry(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, rest)) if first.contains('.') => rest,
        _ => image,
    }
}

/// True iff the reference names a registry other than the public default.
pub fn has_explicit_registry(image: &str) -> bool {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') => first != DEFAULT_REGISTRY,
        _ => false,
    }
}

/// The registry host of a reference, defaulting to the public registry.
pub fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') => first,
        _ => DEFAULT_REGISTRY,
    }
}

/// Splits a tag off a digest-free reference. The tag is everything after the
/// last `:` that follows the last `/`, so a registry port is not mistaken for
/// a tag.
pub fn split_tag(image: &str) -> (&str, Option<&str>) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].find(':') {
        Some(offset) => {
            let colon = name_start + offset;
            (&image[..colon], Some(&image[colon + 1..]))
        }
        None => (image, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e246aa22ad2cbdfbd19e2a6ca2b275e26245a21920e2b2d0666324cee3f15549";

    #[test]
    fn test_extract_digest() {
        assert_eq!(
            extract_digest(&format!("docker.io/library/busybox@{DIGEST}")),
            DIGEST
        );
        assert_eq!(
            extract_digest(&format!("docker.io/library/busybox:stable@{DIGEST}")),
            DIGEST
        );
        assert_eq!(extract_digest("docker.io/library/busybox"), "");
        assert_eq!(extract_digest("docker.io/library/busybox:latest"), "");
        // truncated hex
        assert_eq!(
            extract_digest("busybox@sh56:e246aa22ad2cbdfbd19e2a6ca2b275e26245a21920e"),
            ""
        );
        assert_eq!(
            extract_digest("busybox@sha256:e246aa22ad2cbdfbd19e2a6ca2b275e26245a21920e"),
            ""
        );
        // digest not at end of string
        assert_eq!(extract_digest(&format!("busybox@{DIGEST}/extra")), "");
        // uppercase hex is still hex
        let upper = "sha256:E246AA22AD2CBDFBD19E2A6CA2B275E26245A21920E2B2D0666324CEE3F15549";
        assert_eq!(extract_digest(&format!("busybox@{upper}")), upper);
    }

    #[test]
    fn test_without_digest() {
        assert_eq!(
            without_digest(&format!("library/busybox:stable@{DIGEST}")),
            "library/busybox:stable"
        );
        assert_eq!(without_digest("library/busybox"), "library/busybox");
    }

    #[test]
    fn test_strip_registry() {
        assert_eq!(strip_registry("docker.io/library/busybox"), "library/busybox");
        assert_eq!(strip_registry("library/busybox"), "library/busybox");
        assert_eq!(strip_registry("busybox"), "busybox");
        assert_eq!(
            strip_registry("registry.example.com:5000/team/app:v1"),
            "team/app:v1"
        );
    }

    #[test]
    fn test_has_explicit_registry() {
        assert!(has_explicit_registry("gcr.io/project/image"));
        assert!(has_explicit_registry("registry.example.com:5000/app"));
        assert!(!has_explicit_registry("docker.io/library/busybox"));
        assert!(!has_explicit_registry("library/busybox"));
        assert!(!has_explicit_registry("busybox"));
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("gcr.io/project/image"), "gcr.io");
        assert_eq!(registry_host("library/busybox"), "docker.io");
        assert_eq!(registry_host("busybox:latest"), "docker.io");
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("busybox:stable"), ("busybox", Some("stable")));
        assert_eq!(split_tag("busybox"), ("busybox", None));
        assert_eq!(
            split_tag("localhost.localdomain:5000/app"),
            ("localhost.localdomain:5000/app", None)
        );
        assert_eq!(
            split_tag("registry.example.com:5000/team/app:v2"),
            ("registry.example.com:5000/team/app", Some("v2"))
        );
    }
}
