use crate::error::{Error, Result};
use std::fmt;

/// Canonical domain of the public registry, used when an image has no domain.
pub static DEFAULT_DOMAIN: &str = "registry.hub.docker.com";
static LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
static OFFICIAL_IMAGES_NAMESPACE: &str = "library";
static DEFAULT_TAG: &str = "latest";
static DIGEST_MARKER: &str = "@sha256:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: String,
    pub repository: String,
    /// Tag, or `sha256:<hex>` when the image was referenced by digest.
    pub tag: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.tag.starts_with("sha256:") { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.domain, self.repository, separator, self.tag)
    }
}

impl ImageReference {
    /// Splits an image string into domain, repository and tag.
    ///
    /// The part before the first `/` is only a domain if it looks like a host
    /// (contains `.` or `:`, or is `localhost`). Public registry images without
    /// a namespace are moved under `library/`. Never fails: any input yields a
    /// best-effort reference.
    pub fn parse(image: &str) -> Self {
        let (domain, remainder) = split_domain(image);

        let (repository, tag) = match remainder.split_once('@') {
            Some((repository, digest)) => (repository, digest),
            None => remainder.split_once(':').unwrap_or((remainder.as_str(), DEFAULT_TAG)),
        };

        Self {
            domain,
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, remainder) = match name.split_once('/') {
        Some((head, rest)) if head.contains(['.', ':']) || head == "localhost" => (head, rest),
        _ => (DEFAULT_DOMAIN, name),
    };

    let domain = normalize_domain(domain);
    let remainder = if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        format!("{}/{}", OFFICIAL_IMAGES_NAMESPACE, remainder)
    } else {
        remainder.to_string()
    };
    (domain, remainder)
}

/// Maps a registry host (or a docker config key such as
/// `https://index.docker.io/v1/`) to the host used in manifest URLs.
pub fn normalize_domain(host: &str) -> String {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    if host == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        host.to_string()
    }
}

/// Whether the image is already pinned to a content digest.
pub fn is_digest_pinned(image: &str) -> bool {
    image.contains(DIGEST_MARKER)
}

/// The image without its tag and digest: `myhost:5000/app:v1` → `myhost:5000/app`.
pub fn strip_tag(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    let last_slash = image.rfind('/').unwrap_or(0);
    match image.rfind(':') {
        Some(pos) if pos > last_slash => &image[..pos],
        _ => image,
    }
}

/// The `sha256:<hex>` part of a pinned image.
pub fn digest_of(image: &str) -> Option<&str> {
    image.split_once('@').map(|(_, digest)| digest)
}

/// Extracts `repo@sha256:<hex>` from a container status imageID such as
/// `docker-pullable://nginx@sha256:...`.
pub fn parse_image_id(image_id: &str) -> Result<String> {
    let image = image_id
        .split_once("://")
        .map_or(image_id, |(_, rest)| rest);
    if !is_digest_pinned(image) {
        return Err(Error::Parse(image_id.to_string()));
    }
    Ok(image.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_official_image() {
        let reference = ImageReference::parse("nginx");
        assert_eq!(
            reference,
            ImageReference {
                domain: DEFAULT_DOMAIN.to_string(),
                repository: "library/nginx".to_string(),
                tag: "latest".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_registry_with_port() {
        let reference = ImageReference::parse("myhost:5000/app:v1");
        assert_eq!(reference.domain, "myhost:5000");
        assert_eq!(reference.repository, "app");
        assert_eq!(reference.tag, "v1");
    }

    #[test]
    fn test_parse_namespaced_hub_image() {
        let reference = ImageReference::parse("philpep/imago:1.0");
        assert_eq!(reference.domain, DEFAULT_DOMAIN);
        assert_eq!(reference.repository, "philpep/imago");
        assert_eq!(reference.tag, "1.0");
    }

    #[test]
    fn test_parse_legacy_domain_is_rewritten() {
        let reference = ImageReference::parse("index.docker.io/redis");
        assert_eq!(reference.domain, DEFAULT_DOMAIN);
        assert_eq!(reference.repository, "library/redis");
    }

    #[test]
    fn test_parse_localhost_and_nested_paths() {
        let reference = ImageReference::parse("localhost/app");
        assert_eq!(reference.domain, "localhost");
        assert_eq!(reference.repository, "app");
        assert_eq!(reference.tag, "latest");

        let reference = ImageReference::parse("gcr.io/project/tools/builder:2024.1");
        assert_eq!(reference.domain, "gcr.io");
        assert_eq!(reference.repository, "project/tools/builder");
        assert_eq!(reference.tag, "2024.1");
        assert_eq!(reference.to_string(), "gcr.io/project/tools/builder:2024.1");
    }

    #[test]
    fn test_parse_digest_reference() {
        let reference = ImageReference::parse("quay.io/app@sha256:abc");
        assert_eq!(reference.repository, "app");
        assert_eq!(reference.tag, "sha256:abc");
        assert_eq!(reference.to_string(), "quay.io/app@sha256:abc");
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(strip_tag("nginx"), "nginx");
        assert_eq!(strip_tag("nginx:1.25"), "nginx");
        assert_eq!(strip_tag("myhost:5000/app:v1"), "myhost:5000/app");
        assert_eq!(strip_tag("myhost:5000/app"), "myhost:5000/app");
        assert_eq!(strip_tag("repo@sha256:aaa"), "repo");
    }

    #[test]
    fn test_is_digest_pinned() {
        assert!(is_digest_pinned("repo@sha256:aaa"));
        assert!(!is_digest_pinned("repo:v2"));
        assert_eq!(digest_of("repo@sha256:aaa"), Some("sha256:aaa"));
        assert_eq!(digest_of("repo:v2"), None);
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("https://index.docker.io/v1/"), DEFAULT_DOMAIN);
        assert_eq!(normalize_domain("quay.io"), "quay.io");
        assert_eq!(normalize_domain("http://myhost:5000"), "myhost:5000");
    }

    #[test]
    fn test_parse_image_id() {
        assert_eq!(
            parse_image_id("docker-pullable://nginx@sha256:abc").unwrap(),
            "nginx@sha256:abc"
        );
        assert_eq!(
            parse_image_id("docker.io/library/nginx@sha256:abc").unwrap(),
            "docker.io/library/nginx@sha256:abc"
        );
        assert!(matches!(
            parse_image_id("sha256:abc"),
            Err(Error::Parse(_))
        ));
    }
}
