//! In-memory image representation and JSON translation.
//!
//! An [`Image`] is built once through [`ImageBuilder`] and immutable after.
//! Translators project it to manifest + container-configuration JSON
//! ([`translate`]) and reconstruct it from pulled JSON ([`reconstitute`]).

pub mod json;
pub mod reconstitute;
pub mod translate;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::blob::Blob;
use crate::cache::CachedLayer;
use crate::digest::{BlobDescriptor, Digest};

pub use json::{HealthcheckTemplate as Healthcheck, HistoryTemplate as HistoryEntry};

/// One image layer, polymorphic over how much is known about it.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Only the compressed digest is known (V2.1 manifests).
    DigestOnly { digest: Digest },
    /// Compressed descriptor and diff ID known, content not present locally.
    Reference {
        descriptor: BlobDescriptor,
        diff_id: Digest,
    },
    /// Layer present in the local cache with its blob.
    Cached(CachedLayer),
}

impl Layer {
    /// Digest of the compressed blob.
    pub fn digest(&self) -> &Digest {
        match self {
            Layer::DigestOnly { digest } => digest,
            Layer::Reference { descriptor, .. } => &descriptor.digest,
            Layer::Cached(cached) => cached.digest(),
        }
    }

    /// Size of the compressed blob, when known.
    pub fn size(&self) -> Option<u64> {
        match self {
            Layer::DigestOnly { .. } => None,
            Layer::Reference { descriptor, .. } => Some(descriptor.size),
            Layer::Cached(cached) => Some(cached.size()),
        }
    }

    /// Digest of the uncompressed content, when known.
    pub fn diff_id(&self) -> Option<&Digest> {
        match self {
            Layer::DigestOnly { .. } => None,
            Layer::Reference { diff_id, .. } => Some(diff_id),
            Layer::Cached(cached) => Some(&cached.diff_id),
        }
    }

    /// The compressed bytes, when locally available.
    pub fn blob(&self) -> Option<&Blob> {
        match self {
            Layer::Cached(cached) => Some(&cached.blob),
            _ => None,
        }
    }
}

/// Immutable in-memory image.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub created: Option<DateTime<Utc>>,
    pub architecture: String,
    pub os: String,
    /// Layers in application order (base first).
    pub layers: Vec<Layer>,
    /// History entries in chronological order.
    pub history: Vec<HistoryEntry>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub program_arguments: Option<Vec<String>>,
    /// Keys in `port/protocol` form (e.g. "8080/tcp").
    pub exposed_ports: BTreeSet<String>,
    /// Absolute volume mount points.
    pub volumes: BTreeSet<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub healthcheck: Option<Healthcheck>,
}

impl Image {
    pub fn builder() -> ImageBuilder {
        ImageBuilder::default()
    }
}

/// Accumulates image state, then produces an immutable [`Image`].
#[derive(Debug, Default)]
pub struct ImageBuilder {
    image: Image,
}

impl ImageBuilder {
    pub fn set_created(mut self, created: DateTime<Utc>) -> Self {
        self.image.created = Some(created);
        self
    }

    pub fn set_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.image.architecture = architecture.into();
        self
    }

    pub fn set_os(mut self, os: impl Into<String>) -> Self {
        self.image.os = os.into();
        self
    }

    /// Append a layer; ordering is preserved.
    pub fn add_layer(mut self, layer: Layer) -> Self {
        self.image.layers.push(layer);
        self
    }

    pub fn add_history(mut self, entry: HistoryEntry) -> Self {
        self.image.history.push(entry);
        self
    }

    pub fn add_environment_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.image.environment.insert(name.into(), value.into());
        self
    }

    pub fn add_environment(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.image.environment.extend(env);
        self
    }

    pub fn add_labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.image.labels.extend(labels);
        self
    }

    pub fn set_entrypoint(mut self, entrypoint: Option<Vec<String>>) -> Self {
        self.image.entrypoint = entrypoint;
        self
    }

    pub fn set_program_arguments(mut self, arguments: Option<Vec<String>>) -> Self {
        self.image.program_arguments = arguments;
        self
    }

    pub fn add_exposed_ports(mut self, ports: impl IntoIterator<Item = String>) -> Self {
        self.image.exposed_ports.extend(ports);
        self
    }

    pub fn add_volumes(mut self, volumes: impl IntoIterator<Item = String>) -> Self {
        self.image.volumes.extend(volumes);
        self
    }

    pub fn set_working_directory(mut self, dir: Option<String>) -> Self {
        self.image.working_directory = dir;
        self
    }

    pub fn set_user(mut self, user: Option<String>) -> Self {
        self.image.user = user;
        self
    }

    pub fn set_healthcheck(mut self, healthcheck: Option<Healthcheck>) -> Self {
        self.image.healthcheck = healthcheck;
        self
    }

    pub fn build(self) -> Image {
        self.image
    }
}
