//! Image → JSON translation.

use std::collections::BTreeMap;

use lateen_core::error::{BuildError, Result};

use super::json::{
    BuildableManifestTemplate, ContainerConfigurationTemplate, DescriptorTemplate, EmptyObject,
    ExecutionConfigTemplate, ManifestFormat, RootFsTemplate,
};
use super::Image;
use crate::digest::Digest;

/// Project an image to its container-configuration JSON template.
pub fn container_configuration(
    image: &Image,
    format: ManifestFormat,
) -> Result<ContainerConfigurationTemplate> {
    let diff_ids = image
        .layers
        .iter()
        .map(|layer| {
            layer.diff_id().cloned().ok_or_else(|| {
                BuildError::Other(format!(
                    "layer {} has no known diff ID; cannot build a container configuration",
                    layer.digest()
                ))
            })
        })
        .collect::<Result<Vec<Digest>>>()?;

    let env = if image.environment.is_empty() {
        None
    } else {
        // BTreeMap iteration gives the sorted NAME=VALUE list.
        Some(
            image
                .environment
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect(),
        )
    };

    // Healthcheck is a Docker extension; OCI configs omit it.
    let healthcheck = match format {
        ManifestFormat::DockerV22 => image.healthcheck.clone(),
        ManifestFormat::Oci => None,
    };

    Ok(ContainerConfigurationTemplate {
        created: image.created.map(|t| t.to_rfc3339()),
        architecture: image.architecture.clone(),
        os: image.os.clone(),
        config: ExecutionConfigTemplate {
            env,
            entrypoint: image.entrypoint.clone(),
            cmd: image.program_arguments.clone(),
            healthcheck,
            exposed_ports: key_map(&image.exposed_ports),
            labels: if image.labels.is_empty() {
                None
            } else {
                Some(image.labels.clone())
            },
            volumes: key_map(&image.volumes),
            working_dir: image.working_directory.clone(),
            user: image.user.clone(),
        },
        history: image.history.clone(),
        rootfs: RootFsTemplate {
            fs_type: "layers".to_string(),
            diff_ids,
        },
    })
}

/// Build the image manifest referencing the serialized container config.
pub fn manifest(
    image: &Image,
    config_bytes: &[u8],
    format: ManifestFormat,
) -> Result<BuildableManifestTemplate> {
    let layers = image
        .layers
        .iter()
        .map(|layer| {
            let size = layer.size().ok_or_else(|| {
                BuildError::Other(format!(
                    "layer {} has no known size; cannot build a manifest",
                    layer.digest()
                ))
            })?;
            Ok(DescriptorTemplate {
                media_type: format.layer_media_type().to_string(),
                size,
                digest: layer.digest().clone(),
            })
        })
        .collect::<Result<Vec<DescriptorTemplate>>>()?;

    Ok(BuildableManifestTemplate {
        schema_version: 2,
        media_type: format.manifest_media_type().to_string(),
        config: DescriptorTemplate {
            media_type: format.config_media_type().to_string(),
            size: config_bytes.len() as u64,
            digest: Digest::of_bytes(config_bytes),
        },
        layers,
    })
}

fn key_map(keys: &std::collections::BTreeSet<String>) -> Option<BTreeMap<String, EmptyObject>> {
    if keys.is_empty() {
        None
    } else {
        Some(
            keys.iter()
                .map(|k| (k.clone(), EmptyObject {}))
                .collect(),
        )
    }
}
