//! Image reference parsing
//!
//! References without a registry resolve to Docker Hub (`index.docker.io`),
//! single-segment Hub repositories gain the `library/` namespace, and a
//! reference with neither tag nor digest is tagged `latest`.

use crate::error::{PackError, PackResult};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Map Docker Hub aliases onto one canonical host
pub fn canonical_registry(host: &str) -> String {
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

impl ImageRef {
    pub fn parse(reference: &str) -> PackResult<Self> {
        let invalid = |reason: &str| {
            PackError::ConfigInvalid(format!(
                "invalid image reference '{}': {}",
                reference, reason
            ))
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }

        let (rest, digest) = match trimmed.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must be <algorithm>:<hex>"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // A colon after the last slash separates the tag
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder)) if looks_like_registry(first) => {
                (canonical_registry(first), remainder.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path segment"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag, defaulting to `latest` when the reference has no digest
    pub fn tag_or_default(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag),
            (None, None) => Some(DEFAULT_TAG),
            (None, Some(_)) => None,
        }
    }

    /// Fully qualified form, always naming registry and tag or digest
    pub fn normalized(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = self.tag_or_default() {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }
}

impl FromStr for ImageRef {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// Registry host of `reference`
pub fn registry_of(reference: &str) -> PackResult<String> {
    Ok(ImageRef::parse(reference)?.registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_shorthand() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.registry, "index.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.normalized(), "index.docker.io/library/alpine:latest");
    }

    #[test]
    fn hub_namespace_and_alias() {
        let r = ImageRef::parse("docker.io/cnbs/sample-builder:bionic").unwrap();
        assert_eq!(r.registry, "index.docker.io");
        assert_eq!(r.repository, "cnbs/sample-builder");
        assert_eq!(r.tag.as_deref(), Some("bionic"));
    }

    #[test]
    fn registry_with_port() {
        let r = ImageRef::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.to_string(), "localhost:5000/app:latest");
    }

    #[test]
    fn digest_reference_has_no_default_tag() {
        let r = ImageRef::parse("gcr.io/proj/run@sha256:abcd").unwrap();
        assert_eq!(r.registry, "gcr.io");
        assert_eq!(r.tag_or_default(), None);
        assert_eq!(r.normalized(), "gcr.io/proj/run@sha256:abcd");
    }

    #[test]
    fn rejects_bad_references() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("Upper/Case").is_err());
        assert!(ImageRef::parse("repo:").is_err());
        assert!(ImageRef::parse("gcr.io//x").is_err());
    }

    #[test]
    fn registry_of_reference() {
        assert_eq!(registry_of("registry.example.com/a/b:1").unwrap(), "registry.example.com");
        assert_eq!(registry_of("some/app").unwrap(), "index.docker.io");
    }
}
