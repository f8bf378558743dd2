//! Image reference parsing.
//!
//! Parses references like `ghcr.io/lateen/app:v1.2` into structured
//! components, with Docker Hub defaulting (`nginx` → `docker.io/library/nginx:latest`).

use lateen_core::error::{BuildError, Result};

use crate::digest::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// The reserved empty base image.
const SCRATCH: &str = "scratch";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port (e.g. "ghcr.io", "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "library/nginx", "lateen/app").
    pub repository: String,
    /// Tag, if any.
    pub tag: Option<String>,
    /// Digest, if pinned.
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// The reserved `scratch` reference: an empty base image that is never
    /// pulled from any registry.
    pub fn scratch() -> Self {
        Self {
            registry: String::new(),
            repository: SCRATCH.to_string(),
            tag: None,
            digest: None,
        }
    }

    /// Whether this is the reserved `scratch` reference.
    pub fn is_scratch(&self) -> bool {
        self.registry.is_empty() && self.repository == SCRATCH
    }

    /// Parse an image reference string.
    ///
    /// Supported forms:
    /// - `scratch`
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25`
    /// - `myuser/myimage`
    /// - `ghcr.io/org/image:tag`
    /// - `ghcr.io/org/image@sha256:<hex>`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BuildError::Other("empty image reference".to_string()));
        }
        if reference == SCRATCH {
            return Ok(Self::scratch());
        }

        // Digest comes after '@', if present.
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest_str)) => (rest, Some(Digest::parse(digest_str)?)),
            None => (reference, None),
        };

        // The tag separator is a ':' after the last '/'; a ':' before that is
        // a registry port. A slash-free reference cannot name a registry, so
        // any colon in it separates the tag (`python:3`, not `host:port`).
        let last_slash = rest.rfind('/');
        let tag_colon = match last_slash {
            Some(slash) => rest[slash..].find(':').map(|i| slash + i),
            None => rest.rfind(':'),
        };
        let (name, tag) = match tag_colon {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
            None => (rest, None),
        };

        let (registry, repository) = split_registry(name)?;

        // Tags default only when no digest pins the reference.
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or digest used on manifest routes; falls back to `latest`.
    pub fn reference_part(&self) -> String {
        if let Some(digest) = &self.digest {
            digest.to_string()
        } else if let Some(tag) = &self.tag {
            tag.clone()
        } else {
            DEFAULT_TAG.to_string()
        }
    }

    /// Full reference string.
    pub fn full_reference(&self) -> String {
        if self.is_scratch() {
            return SCRATCH.to_string();
        }
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }

    /// Filesystem-safe directory name for per-image cache metadata.
    pub fn cache_directory_name(&self) -> String {
        self.full_reference()
            .chars()
            .map(|c| match c {
                '/' | ':' | '@' => '_',
                other => other,
            })
            .collect()
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split a name into registry and repository, applying Docker Hub defaults.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        // The first component is a registry only if it looks like a hostname.
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::Other(format!(
                    "empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
