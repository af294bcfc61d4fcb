//! Image reference parsing and normalization.
//!
//! Kubelet and the backend disagree on canonical forms: kubelet may ask
//! for `alpine`, the backend stores `docker.io/library/alpine:latest`.
//! Normalizing both sides to one canonical string makes status lookups
//! and removal by name work regardless of which form the caller used.

use kina_core::error::{Result, ShimError};

use crate::adapter::ImageInfo;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag, when the reference carries one. Defaults to `latest` unless a
    /// digest is present.
    pub tag: Option<String>,
    /// Content digest, when referenced by digest (`@sha256:...`).
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference, filling in registry/namespace/tag defaults.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ShimError::InvalidArgument(
                "empty image reference".to_string(),
            ));
        }

        // Split off a digest first; it may contain ':' itself.
        let (name_and_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") {
                    return Err(ShimError::InvalidArgument(format!(
                        "unsupported digest algorithm in {}",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_and_tag);

        // The first path segment is a registry only if it looks like a
        // hostname (contains '.' or ':', or is "localhost").
        let (registry, mut repository) = match name.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() {
            return Err(ShimError::InvalidArgument(format!(
                "image reference has no repository: {}",
                reference
            )));
        }

        // Bare docker.io names get the library/ namespace.
        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{}/{}", DEFAULT_NAMESPACE, repository);
        }

        let tag = match (&tag, &digest) {
            (Some(t), _) => Some(t.clone()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical string form, e.g. `docker.io/library/alpine:latest`.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Whether a backend image entry refers to this reference, matching
    /// either by canonical name or by digest.
    pub fn matches(&self, image: &ImageInfo) -> bool {
        if let Some(digest) = &self.digest {
            if image.digest == *digest {
                return true;
            }
        }
        match ImageReference::parse(&image.reference) {
            Ok(other) => {
                other.registry == self.registry
                    && other.repository == self.repository
                    && (self.digest.is_some() || other.tag == self.tag)
            }
            Err(_) => false,
        }
    }
}

/// Split `name:tag`, treating a ':' inside the registry host (a port) as
/// part of the name.
fn split_tag(name: &str) -> (&str, Option<String>) {
    match name.rsplit_once(':') {
        Some((head, tail)) if !tail.contains('/') => (head, Some(tail.to_string())),
        _ => (name, None),
    }
}
