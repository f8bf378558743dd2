//! Final image assembly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lateen_core::error::Result;

use super::{ApplicationLayer, StepContext};
use crate::cache::CachedLayer;
use crate::image::{HistoryEntry, Image, Layer};

/// Assemble the final image from the base image, its cached layers and the
/// built application layers.
pub(super) fn build_image(
    ctx: &StepContext,
    base: &Image,
    base_layers: &[CachedLayer],
    application_layers: &[Arc<ApplicationLayer>],
) -> Result<Image> {
    let settings = &ctx.config.container;
    let created = settings.created.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let architecture = if base.architecture.is_empty() {
        ctx.config.architecture.clone()
    } else {
        base.architecture.clone()
    };
    let os = if base.os.is_empty() {
        ctx.config.os.clone()
    } else {
        base.os.clone()
    };

    let mut builder = Image::builder()
        .set_created(created)
        .set_architecture(architecture)
        .set_os(os);

    for layer in base_layers {
        builder = builder.add_layer(Layer::Cached(layer.clone()));
    }
    for application in application_layers {
        builder = builder.add_layer(Layer::Cached(application.layer.clone()));
    }

    // Base history verbatim, then fillers so every base layer has an entry.
    for entry in &base.history {
        builder = builder.add_history(entry.clone());
    }
    let covered = base
        .history
        .iter()
        .filter(|entry| entry.empty_layer != Some(true))
        .count();
    for _ in covered..base_layers.len() {
        builder = builder.add_history(HistoryEntry {
            created: Some(created.to_rfc3339()),
            created_by: Some(format!("auto-generated by {}", lateen_core::TOOL_NAME)),
            ..Default::default()
        });
    }
    for application in application_layers {
        builder = builder.add_history(HistoryEntry {
            created: Some(created.to_rfc3339()),
            author: Some(lateen_core::TOOL_NAME.to_string()),
            created_by: Some(format!(
                "{}:{}",
                lateen_core::TOOL_NAME,
                lateen_core::VERSION
            )),
            comment: Some(application.name.clone()),
            ..Default::default()
        });
    }

    // Base values first so configured ones override.
    builder = builder
        .add_environment(base.environment.clone())
        .add_environment(settings.environment.clone())
        .add_labels(base.labels.clone())
        .add_labels(settings.labels.clone())
        .add_exposed_ports(base.exposed_ports.iter().cloned())
        .add_exposed_ports(settings.exposed_ports.iter().cloned())
        .add_volumes(base.volumes.iter().cloned())
        .add_volumes(settings.volumes.iter().cloned())
        .set_working_directory(
            settings
                .working_directory
                .clone()
                .or_else(|| base.working_directory.clone()),
        )
        .set_user(settings.user.clone().or_else(|| base.user.clone()))
        .set_healthcheck(settings.healthcheck.clone().or_else(|| base.healthcheck.clone()));

    // Entrypoint is inherited only when none is configured; cmd only when the
    // entrypoint is also inherited and no explicit cmd was set.
    let entrypoint = match (&settings.entrypoint, &base.entrypoint) {
        (Some(configured), _) => Some(configured.clone()),
        (None, Some(inherited)) => {
            ctx.emitter.lifecycle(format!(
                "Container entrypoint set to {:?} (inherited from base image)",
                inherited
            ));
            Some(inherited.clone())
        }
        (None, None) => None,
    };
    let inheriting_entrypoint = settings.entrypoint.is_none();
    let program_arguments = match (&settings.program_arguments, inheriting_entrypoint) {
        (Some(configured), _) => Some(configured.clone()),
        (None, true) => {
            if let Some(inherited) = &base.program_arguments {
                ctx.emitter.lifecycle(format!(
                    "Container program arguments set to {:?} (inherited from base image)",
                    inherited
                ));
            }
            base.program_arguments.clone()
        }
        (None, false) => None,
    };

    Ok(builder
        .set_entrypoint(entrypoint)
        .set_program_arguments(program_arguments)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;
    use crate::cache::ContentStore;
    use crate::configuration::BuildConfiguration;
    use crate::digest::{BlobDescriptor, Digest};
    use crate::reference::ImageReference;
    use crate::steps::ProgressTracker;
    use lateen_core::event::EventEmitter;
    use tempfile::TempDir;

    fn context(tmp: &TempDir) -> StepContext {
        let cache = tmp.path().join("cache");
        StepContext {
            config: Arc::new(BuildConfiguration::new(
                ImageReference::scratch(),
                ImageReference::parse("ghcr.io/lateen/app:v1").unwrap(),
                &cache,
            )),
            store: Arc::new(ContentStore::new(&cache).unwrap()),
            emitter: EventEmitter::new(64),
            progress: Arc::new(ProgressTracker::new(1)),
        }
    }

    fn cached_layer(content: &[u8]) -> CachedLayer {
        CachedLayer {
            descriptor: BlobDescriptor::new(content.len() as u64, Digest::of_bytes(content)),
            diff_id: Digest::of_bytes(content),
            blob: Blob::from_bytes(content.to_vec()),
        }
    }

    fn with_settings(
        ctx: &StepContext,
        update: impl FnOnce(&mut crate::configuration::ContainerSettings),
    ) -> StepContext {
        let mut ctx = ctx.clone();
        let mut config = (*ctx.config).clone();
        update(&mut config.container);
        ctx.config = Arc::new(config);
        ctx
    }

    #[test]
    fn test_layers_ordered_base_then_application() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let base_layer = cached_layer(b"base");
        let app_layer = Arc::new(ApplicationLayer {
            layer: cached_layer(b"app"),
            name: "application".to_string(),
        });

        let image = build_image(
            &ctx,
            &Image::default(),
            std::slice::from_ref(&base_layer),
            &[app_layer],
        )
        .unwrap();

        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0].digest(), base_layer.digest());
        assert_eq!(image.layers[1].digest(), &Digest::of_bytes(b"app"));
        // One filler entry for the base layer, one for the application layer.
        assert_eq!(image.history.len(), 2);
        assert!(image.history[0]
            .created_by
            .as_ref()
            .unwrap()
            .contains("auto-generated"));
        assert_eq!(image.history[1].comment.as_deref(), Some("application"));
    }

    #[test]
    fn test_entrypoint_inherited_when_not_configured() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let base = Image::builder()
            .set_entrypoint(Some(vec!["a".to_string()]))
            .set_program_arguments(Some(vec!["arg".to_string()]))
            .build();

        let image = build_image(&ctx, &base, &[], &[]).unwrap();
        assert_eq!(image.entrypoint, Some(vec!["a".to_string()]));
        assert_eq!(image.program_arguments, Some(vec!["arg".to_string()]));
    }

    #[test]
    fn test_configured_entrypoint_blocks_cmd_inheritance() {
        let tmp = TempDir::new().unwrap();
        let ctx = with_settings(&context(&tmp), |settings| {
            settings.entrypoint = Some(vec!["b".to_string()]);
        });
        let base = Image::builder()
            .set_entrypoint(Some(vec!["a".to_string()]))
            .set_program_arguments(Some(vec!["base-arg".to_string()]))
            .build();

        let image = build_image(&ctx, &base, &[], &[]).unwrap();
        assert_eq!(image.entrypoint, Some(vec!["b".to_string()]));
        assert_eq!(image.program_arguments, None);
    }

    #[test]
    fn test_configured_values_override_base() {
        let tmp = TempDir::new().unwrap();
        let ctx = with_settings(&context(&tmp), |settings| {
            settings.environment.insert("SHARED".into(), "mine".into());
            settings.user = Some("app".to_string());
        });
        let base = Image::builder()
            .add_environment_variable("SHARED", "base")
            .add_environment_variable("BASE_ONLY", "1")
            .set_user(Some("root".to_string()))
            .set_working_directory(Some("/srv".to_string()))
            .build();

        let image = build_image(&ctx, &base, &[], &[]).unwrap();
        assert_eq!(image.environment["SHARED"], "mine");
        assert_eq!(image.environment["BASE_ONLY"], "1");
        assert_eq!(image.user.as_deref(), Some("app"));
        assert_eq!(image.working_directory.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_created_defaults_to_epoch() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let image = build_image(&ctx, &Image::default(), &[], &[]).unwrap();
        assert_eq!(image.created, Some(DateTime::<Utc>::UNIX_EPOCH));
    }
}
