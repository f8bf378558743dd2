//! Manifest and container-configuration JSON templates.
//!
//! Three manifest wire formats are understood: Docker V2.1 (schemaVersion 1),
//! Docker V2.2 and OCI (schemaVersion 2, distinguished by media type). V2.2
//! and OCI share one buildable shape; V2.1 carries layer digests oldest-first
//! and may embed a config in its history.

use std::collections::BTreeMap;

use lateen_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

// Docker V2.2 media types
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

// OCI media types
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

// Docker V2.1 media types
pub const MEDIA_TYPE_V21_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_V21_SIGNED_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Target manifest format for images Lateen produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    DockerV22,
    Oci,
}

impl ManifestFormat {
    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            Self::DockerV22 => MEDIA_TYPE_DOCKER_MANIFEST,
            Self::Oci => MEDIA_TYPE_OCI_MANIFEST,
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            Self::DockerV22 => MEDIA_TYPE_DOCKER_CONFIG,
            Self::Oci => MEDIA_TYPE_OCI_CONFIG,
        }
    }

    pub fn layer_media_type(&self) -> &'static str {
        match self {
            Self::DockerV22 => MEDIA_TYPE_DOCKER_LAYER,
            Self::Oci => MEDIA_TYPE_OCI_LAYER,
        }
    }
}

/// `{mediaType, size, digest}` blob reference inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorTemplate {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

/// Shared shape of Docker V2.2 and OCI image manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildableManifestTemplate {
    pub schema_version: i32,
    // The OCI image spec leaves the manifest's own mediaType optional, so an
    // absent field reads as OCI.
    #[serde(default = "default_manifest_media_type")]
    pub media_type: String,
    pub config: DescriptorTemplate,
    pub layers: Vec<DescriptorTemplate>,
}

fn default_manifest_media_type() -> String {
    MEDIA_TYPE_OCI_MANIFEST.to_string()
}

/// Docker V2.1 manifest: layer digests in reverse (oldest-first) order, with
/// per-layer v1 compatibility strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21ManifestTemplate {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fs_layers: Vec<V21FsLayer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<V21HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21FsLayer {
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21HistoryEntry {
    pub v1_compatibility: String,
}

/// A parsed manifest of any supported format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestTemplate {
    V21(V21ManifestTemplate),
    V22(BuildableManifestTemplate),
    Oci(BuildableManifestTemplate),
}

impl ManifestTemplate {
    /// Media type this manifest is served/pushed under.
    pub fn media_type(&self) -> &str {
        match self {
            Self::V21(_) => MEDIA_TYPE_V21_MANIFEST,
            Self::V22(m) | Self::Oci(m) => &m.media_type,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::V21(m) => serde_json::to_vec(m)?,
            Self::V22(m) | Self::Oci(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }
}

/// Dispatch raw manifest JSON on `schemaVersion` and `mediaType`.
pub fn parse_manifest(bytes: &[u8]) -> Result<ManifestTemplate> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| BuildError::UnknownManifestFormat(format!("not valid JSON: {}", e)))?;

    let schema_version = value
        .get("schemaVersion")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            BuildError::UnknownManifestFormat("missing or non-numeric schemaVersion".to_string())
        })?;

    match schema_version {
        1 => {
            let manifest: V21ManifestTemplate = serde_json::from_value(value)?;
            Ok(ManifestTemplate::V21(manifest))
        }
        2 => {
            let media_type = value
                .get("mediaType")
                .and_then(|v| v.as_str())
                .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
                .to_string();
            let manifest: BuildableManifestTemplate = serde_json::from_value(value)?;
            match media_type.as_str() {
                MEDIA_TYPE_DOCKER_MANIFEST => Ok(ManifestTemplate::V22(manifest)),
                MEDIA_TYPE_OCI_MANIFEST => Ok(ManifestTemplate::Oci(manifest)),
                other => Err(BuildError::UnknownManifestFormat(format!(
                    "unknown mediaType '{}' for schemaVersion 2",
                    other
                ))),
            }
        }
        other => Err(BuildError::UnknownManifestFormat(format!(
            "unknown schemaVersion {}",
            other
        ))),
    }
}

/// Serializes to `{}`; used as the value type for port and volume maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// `Healthcheck` block of the container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckTemplate {
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(rename = "Timeout", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(rename = "StartPeriod", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    #[serde(rename = "Retries", skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Inner `config` object of the container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfigTemplate {
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Healthcheck", skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckTemplate>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyObject>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `rootfs` block of the container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFsTemplate {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFsTemplate {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// `history[]` entry of the container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// The container configuration JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfigurationTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ExecutionConfigTemplate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryTemplate>,
    #[serde(default)]
    pub rootfs: RootFsTemplate,
}
