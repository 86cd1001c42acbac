//! Container image reference parsing
//!
//! Splits raw image strings into registry host, repository path, and tag
//! or digest, with the usual Docker Hub defaulting rules. Every place
//! that consumes a container's image field goes through this parser so
//! the split is consistent across the process.

use std::fmt;

use thiserror::Error;

/// Registry assumed for references without a host component
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference {0:?}")]
    Invalid(String),
}

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self, ImageRefError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImageRefError::Empty);
        }

        let (remainder, digest) = match raw.split_once('@') {
            Some((_, d)) if d.is_empty() => return Err(ImageRefError::Invalid(raw.to_string())),
            Some((r, d)) => (r, Some(d.to_string())),
            None => (raw, None),
        };

        // A ':' after the last '/' separates the tag; any earlier ':' is a
        // registry port.
        let last_slash = remainder.rfind('/');
        let (name, tag) = match remainder.rfind(':') {
            Some(idx) if idx > last_slash.unwrap_or(0) => {
                let tag = &remainder[idx + 1..];
                if tag.is_empty() {
                    return Err(ImageRefError::Invalid(raw.to_string()));
                }
                (&remainder[..idx], Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        if name.is_empty() {
            return Err(ImageRefError::Invalid(raw.to_string()));
        }

        // The first path segment is a registry host when it looks like one.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => {
                (first.to_string(), rest.to_string())
            }
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        if repository.split('/').any(|part| part.is_empty())
            || !repository
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
        {
            return Err(ImageRefError::Invalid(raw.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Tag or digest identifying the reference, defaulting to `latest`.
    pub fn identifier(&self) -> &str {
        if let Some(tag) = &self.tag {
            tag
        } else if let Some(digest) = &self.digest {
            digest
        } else {
            DEFAULT_TAG
        }
    }

    /// Host to query for registry API calls. The Docker Hub aliases all
    /// serve the API from a dedicated endpoint.
    pub fn api_host(&self) -> &str {
        match self.registry.as_str() {
            "docker.io" | "index.docker.io" | "registry.docker.io" => "registry-1.docker.io",
            host => host,
        }
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_official_image() {
        let reference = ImageReference::parse("nginx").unwrap();
        assert_eq!(reference.registry(), "index.docker.io");
        assert_eq!(reference.repository(), "library/nginx");
        assert_eq!(reference.identifier(), "latest");
    }

    #[test]
    fn test_image_with_tag() {
        let reference = ImageReference::parse("nginx:1.25.3").unwrap();
        assert_eq!(reference.repository(), "library/nginx");
        assert_eq!(reference.tag(), Some("1.25.3"));
        assert_eq!(reference.identifier(), "1.25.3");
    }

    #[test]
    fn test_namespaced_image_without_host() {
        let reference = ImageReference::parse("grafana/grafana:10.0.0").unwrap();
        assert_eq!(reference.registry(), "index.docker.io");
        assert_eq!(reference.repository(), "grafana/grafana");
    }

    #[test]
    fn test_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "team/app");
        assert_eq!(reference.tag(), Some("v2"));
        assert_eq!(reference.api_host(), "localhost:5000");
    }

    #[test]
    fn test_custom_registry() {
        let reference = ImageReference::parse("quay.io/prometheus/node-exporter:v1.7.0").unwrap();
        assert_eq!(reference.registry(), "quay.io");
        assert_eq!(reference.repository(), "prometheus/node-exporter");
        assert_eq!(reference.api_host(), "quay.io");
    }

    #[test]
    fn test_digest_reference() {
        let reference =
            ImageReference::parse("ghcr.io/org/app@sha256:0123456789abcdef").unwrap();
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest(), Some("sha256:0123456789abcdef"));
        assert_eq!(reference.identifier(), "sha256:0123456789abcdef");
    }

    #[test]
    fn test_docker_hub_api_host() {
        let reference = ImageReference::parse("docker.io/library/redis:7").unwrap();
        assert_eq!(reference.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn test_invalid_references() {
        assert_eq!(ImageReference::parse(""), Err(ImageRefError::Empty));
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("quay.io//app").is_err());
        assert!(ImageReference::parse("app@").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let reference = ImageReference::parse("quay.io/team/app:v1.2.3").unwrap();
        assert_eq!(reference.to_string(), "quay.io/team/app:v1.2.3");
    }
}
