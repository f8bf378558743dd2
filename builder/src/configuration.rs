//! Build configuration: what to build, from what, and where to put it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lateen_core::config::BehaviorFlags;

use crate::image::json::ManifestFormat;
use crate::image::Healthcheck;
use crate::layer::LayerConfiguration;
use crate::reference::ImageReference;
use crate::registry::Credential;

/// Container runtime settings applied on top of the base image.
#[derive(Debug, Clone, Default)]
pub struct ContainerSettings {
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub program_arguments: Option<Vec<String>>,
    /// Keys in `port/protocol` form.
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub healthcheck: Option<Healthcheck>,
    /// Image creation timestamp; epoch when unset, for reproducible builds.
    pub created: Option<DateTime<Utc>>,
}

/// Everything one build needs, assembled by the embedding application.
#[derive(Clone)]
pub struct BuildConfiguration {
    pub base_image: ImageReference,
    pub target_image: ImageReference,
    /// Tags pushed in addition to the target image's own tag.
    pub additional_tags: Vec<String>,
    pub layer_configurations: Vec<LayerConfiguration>,
    pub container: ContainerSettings,
    pub manifest_format: ManifestFormat,
    /// Platform used when building from scratch; otherwise the base image's.
    pub architecture: String,
    pub os: String,
    pub base_credential: Option<Credential>,
    pub target_credential: Option<Credential>,
    pub flags: BehaviorFlags,
    pub cache_directory: PathBuf,
}

impl BuildConfiguration {
    pub fn new(
        base_image: ImageReference,
        target_image: ImageReference,
        cache_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_image,
            target_image,
            additional_tags: Vec::new(),
            layer_configurations: Vec::new(),
            container: ContainerSettings::default(),
            manifest_format: ManifestFormat::DockerV22,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            base_credential: None,
            target_credential: None,
            flags: BehaviorFlags::default(),
            cache_directory: cache_directory.into(),
        }
    }

    /// All tags the target image is pushed under.
    pub fn target_tags(&self) -> Vec<String> {
        let mut tags = vec![self.target_image.reference_part()];
        for tag in &self.additional_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }
}
