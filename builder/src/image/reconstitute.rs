//! JSON → image translation for pulled manifests.

use chrono::{DateTime, Utc};
use lateen_core::error::{BuildError, Result};
use serde::Deserialize;

use super::json::{
    BuildableManifestTemplate, ContainerConfigurationTemplate, ExecutionConfigTemplate,
    ManifestTemplate, V21ManifestTemplate,
};
use super::{Image, ImageBuilder, Layer};

/// Rebuild an [`Image`] from a parsed manifest and its container config.
///
/// V2.2 and OCI manifests require a container configuration; V2.1 carries
/// everything it knows inline.
pub fn image_from_manifest(
    manifest: &ManifestTemplate,
    config: Option<&ContainerConfigurationTemplate>,
) -> Result<Image> {
    match manifest {
        ManifestTemplate::V21(m) => image_from_v21(m),
        ManifestTemplate::V22(m) | ManifestTemplate::Oci(m) => {
            let config = config.ok_or_else(|| {
                BuildError::BadContainerConfigurationFormat(
                    "manifest requires a container configuration but none was provided"
                        .to_string(),
                )
            })?;
            image_from_buildable(m, config)
        }
    }
}

/// V2.1: fsLayers are newest-first on the wire, so reverse into application
/// order. The most recent history entry may embed an execution config.
pub fn image_from_v21(manifest: &V21ManifestTemplate) -> Result<Image> {
    let mut builder = Image::builder();
    for fs_layer in manifest.fs_layers.iter().rev() {
        builder = builder.add_layer(Layer::DigestOnly {
            digest: fs_layer.blob_sum.clone(),
        });
    }

    if let Some(entry) = manifest.history.first() {
        // v1Compatibility is free-form; ignore it when it does not carry a
        // config block.
        if let Ok(compat) = serde_json::from_str::<V1Compatibility>(&entry.v1_compatibility) {
            if let Some(config) = compat.config {
                builder = apply_execution_config(builder, &config)?;
            }
        }
    }

    Ok(builder.build())
}

/// V2.2/OCI: pair manifest layer descriptors with the config's diff IDs.
pub fn image_from_buildable(
    manifest: &BuildableManifestTemplate,
    config: &ContainerConfigurationTemplate,
) -> Result<Image> {
    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(BuildError::LayerCountMismatch {
            manifest_layers: manifest.layers.len(),
            config_layers: config.rootfs.diff_ids.len(),
        });
    }

    let mut builder = Image::builder()
        .set_architecture(&config.architecture)
        .set_os(&config.os);

    if let Some(created) = &config.created {
        builder = builder.set_created(parse_timestamp(created)?);
    }

    for (descriptor, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
        builder = builder.add_layer(Layer::Reference {
            descriptor: crate::digest::BlobDescriptor::new(
                descriptor.size,
                descriptor.digest.clone(),
            ),
            diff_id: diff_id.clone(),
        });
    }

    for entry in &config.history {
        builder = builder.add_history(entry.clone());
    }

    builder = apply_execution_config(builder, &config.config)?;
    Ok(builder.build())
}

fn apply_execution_config(
    mut builder: ImageBuilder,
    config: &ExecutionConfigTemplate,
) -> Result<ImageBuilder> {
    if let Some(env) = &config.env {
        for variable in env {
            let (name, value) = variable.split_once('=').ok_or_else(|| {
                BuildError::BadContainerConfigurationFormat(format!(
                    "environment variable '{}' is not in NAME=VALUE form",
                    variable
                ))
            })?;
            builder = builder.add_environment_variable(name, value);
        }
    }

    if let Some(ports) = &config.exposed_ports {
        for port in ports.keys() {
            validate_port_key(port)?;
        }
        builder = builder.add_exposed_ports(ports.keys().cloned());
    }

    if let Some(volumes) = &config.volumes {
        for volume in volumes.keys() {
            if !volume.starts_with('/') {
                return Err(BuildError::BadContainerConfigurationFormat(format!(
                    "volume path '{}' is not absolute",
                    volume
                )));
            }
        }
        builder = builder.add_volumes(volumes.keys().cloned());
    }

    if let Some(labels) = &config.labels {
        builder = builder.add_labels(labels.clone());
    }

    Ok(builder
        .set_entrypoint(config.entrypoint.clone())
        .set_program_arguments(config.cmd.clone())
        .set_working_directory(config.working_dir.clone())
        .set_user(config.user.clone())
        .set_healthcheck(config.healthcheck.clone()))
}

/// Port keys are `<number>` or `<number>/tcp|udp`.
fn validate_port_key(key: &str) -> Result<()> {
    let (number, protocol) = match key.split_once('/') {
        Some((number, protocol)) => (number, Some(protocol)),
        None => (key, None),
    };
    let numeric = !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit());
    let protocol_ok = matches!(protocol, None | Some("tcp") | Some("udp"));
    if !numeric || !protocol_ok {
        return Err(BuildError::BadContainerConfigurationFormat(format!(
            "exposed port '{}' is not of the form <port> or <port>/<tcp|udp>",
            key
        )));
    }
    Ok(())
}

fn parse_timestamp(created: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(created)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            BuildError::BadContainerConfigurationFormat(format!(
                "created timestamp '{}' is not RFC 3339: {}",
                created, e
            ))
        })
}

/// Subset of a V2.1 `v1Compatibility` blob that matters here.
#[derive(Debug, Deserialize)]
struct V1Compatibility {
    config: Option<ExecutionConfigTemplate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::image::json::{
        DescriptorTemplate, RootFsTemplate, V21FsLayer, V21HistoryEntry,
        MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER, MEDIA_TYPE_OCI_MANIFEST,
    };
    use std::collections::BTreeMap;

    fn layer_descriptor(content: &[u8]) -> DescriptorTemplate {
        DescriptorTemplate {
            media_type: MEDIA_TYPE_OCI_LAYER.to_string(),
            size: content.len() as u64,
            digest: Digest::of_bytes(content),
        }
    }

    fn buildable_manifest(layers: Vec<DescriptorTemplate>) -> BuildableManifestTemplate {
        BuildableManifestTemplate {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: DescriptorTemplate {
                media_type: MEDIA_TYPE_OCI_CONFIG.to_string(),
                size: 2,
                digest: Digest::of_bytes(b"{}"),
            },
            layers,
        }
    }

    fn config_with(
        diff_ids: Vec<Digest>,
        exec: ExecutionConfigTemplate,
    ) -> ContainerConfigurationTemplate {
        ContainerConfigurationTemplate {
            created: Some("2001-02-03T04:05:06Z".to_string()),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: exec,
            history: vec![],
            rootfs: RootFsTemplate {
                fs_type: "layers".to_string(),
                diff_ids,
            },
        }
    }

    #[test]
    fn test_buildable_pairs_layers_with_diff_ids() {
        let manifest = buildable_manifest(vec![layer_descriptor(b"a"), layer_descriptor(b"b")]);
        let config = config_with(
            vec![Digest::of_bytes(b"ua"), Digest::of_bytes(b"ub")],
            ExecutionConfigTemplate::default(),
        );

        let image = image_from_buildable(&manifest, &config).unwrap();
        assert_eq!(image.architecture, "amd64");
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0].digest(), &Digest::of_bytes(b"a"));
        assert_eq!(image.layers[0].diff_id(), Some(&Digest::of_bytes(b"ua")));
        assert_eq!(
            image.created.unwrap().to_rfc3339(),
            "2001-02-03T04:05:06+00:00"
        );
    }

    #[test]
    fn test_layer_count_mismatch() {
        let manifest = buildable_manifest(vec![layer_descriptor(b"a")]);
        let config = config_with(vec![], ExecutionConfigTemplate::default());
        let err = image_from_buildable(&manifest, &config).unwrap_err();
        assert!(matches!(
            err,
            BuildError::LayerCountMismatch {
                manifest_layers: 1,
                config_layers: 0
            }
        ));
    }

    #[test]
    fn test_malformed_environment_variable() {
        let manifest = buildable_manifest(vec![]);
        let config = config_with(
            vec![],
            ExecutionConfigTemplate {
                env: Some(vec!["NO_EQUALS_SIGN".to_string()]),
                ..Default::default()
            },
        );
        let err = image_from_buildable(&manifest, &config).unwrap_err();
        assert!(matches!(
            err,
            BuildError::BadContainerConfigurationFormat(_)
        ));
        assert!(err.to_string().contains("NO_EQUALS_SIGN"));
    }

    #[test]
    fn test_environment_value_may_contain_equals() {
        let manifest = buildable_manifest(vec![]);
        let config = config_with(
            vec![],
            ExecutionConfigTemplate {
                env: Some(vec!["JAVA_OPTS=-Da=b".to_string()]),
                ..Default::default()
            },
        );
        let image = image_from_buildable(&manifest, &config).unwrap();
        assert_eq!(image.environment["JAVA_OPTS"], "-Da=b");
    }

    #[test]
    fn test_malformed_port_key() {
        for bad in ["tcp/8080", "8080/sctp", "", "80 80"] {
            let manifest = buildable_manifest(vec![]);
            let mut ports = BTreeMap::new();
            ports.insert(bad.to_string(), super::super::json::EmptyObject {});
            let config = config_with(
                vec![],
                ExecutionConfigTemplate {
                    exposed_ports: Some(ports),
                    ..Default::default()
                },
            );
            let err = image_from_buildable(&manifest, &config).unwrap_err();
            assert!(
                matches!(err, BuildError::BadContainerConfigurationFormat(_)),
                "port key {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_port_without_protocol_is_accepted() {
        let manifest = buildable_manifest(vec![]);
        let mut ports = BTreeMap::new();
        ports.insert("9000".to_string(), super::super::json::EmptyObject {});
        let config = config_with(
            vec![],
            ExecutionConfigTemplate {
                exposed_ports: Some(ports),
                ..Default::default()
            },
        );
        let image = image_from_buildable(&manifest, &config).unwrap();
        assert!(image.exposed_ports.contains("9000"));
    }

    #[test]
    fn test_relative_volume_is_rejected() {
        let manifest = buildable_manifest(vec![]);
        let mut volumes = BTreeMap::new();
        volumes.insert("data".to_string(), super::super::json::EmptyObject {});
        let config = config_with(
            vec![],
            ExecutionConfigTemplate {
                volumes: Some(volumes),
                ..Default::default()
            },
        );
        let err = image_from_buildable(&manifest, &config).unwrap_err();
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn test_bad_created_timestamp() {
        let manifest = buildable_manifest(vec![]);
        let mut config = config_with(vec![], ExecutionConfigTemplate::default());
        config.created = Some("yesterday".to_string());
        let err = image_from_buildable(&manifest, &config).unwrap_err();
        assert!(matches!(
            err,
            BuildError::BadContainerConfigurationFormat(_)
        ));
    }

    #[test]
    fn test_v21_reverses_layer_order() {
        let manifest = V21ManifestTemplate {
            schema_version: 1,
            fs_layers: vec![
                V21FsLayer {
                    blob_sum: Digest::of_bytes(b"newest"),
                },
                V21FsLayer {
                    blob_sum: Digest::of_bytes(b"oldest"),
                },
            ],
            history: vec![],
        };
        let image = image_from_v21(&manifest).unwrap();
        assert_eq!(image.layers[0].digest(), &Digest::of_bytes(b"oldest"));
        assert_eq!(image.layers[1].digest(), &Digest::of_bytes(b"newest"));
        assert!(image.layers[0].diff_id().is_none());
    }

    #[test]
    fn test_v21_extracts_embedded_config() {
        let manifest = V21ManifestTemplate {
            schema_version: 1,
            fs_layers: vec![],
            history: vec![V21HistoryEntry {
                v1_compatibility:
                    r#"{"config":{"Entrypoint":["/bin/sh"],"Env":["A=1"]}}"#.to_string(),
            }],
        };
        let image = image_from_v21(&manifest).unwrap();
        assert_eq!(image.entrypoint, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(image.environment["A"], "1");
    }

    #[test]
    fn test_v21_tolerates_opaque_compatibility_string() {
        let manifest = V21ManifestTemplate {
            schema_version: 1,
            fs_layers: vec![],
            history: vec![V21HistoryEntry {
                v1_compatibility: "not json at all".to_string(),
            }],
        };
        let image = image_from_v21(&manifest).unwrap();
        assert!(image.entrypoint.is_none());
    }

    #[test]
    fn test_dispatch_requires_config_for_buildable() {
        let manifest = ManifestTemplate::Oci(buildable_manifest(vec![]));
        let err = image_from_manifest(&manifest, None).unwrap_err();
        assert!(matches!(
            err,
            BuildError::BadContainerConfigurationFormat(_)
        ));
    }
}
