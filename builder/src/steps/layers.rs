//! Layer steps: pull-and-cache base layers, build-and-cache application
//! layers. Both check the cache before doing any real work.

use futures::future::try_join_all;
use lateen_core::error::{BuildError, Result};

use super::pull_base::BaseImage;
use super::StepContext;
use crate::blob::Blob;
use crate::cache::CachedLayer;
use crate::layer::{build_layer_tar, generate_selector, LayerConfiguration};
use crate::progress::ThrottledProgress;

/// A built application layer plus the label recorded in image history.
#[derive(Clone)]
pub struct ApplicationLayer {
    pub layer: CachedLayer,
    pub name: String,
}

/// Fan out one pull per base layer and join, preserving manifest order.
pub(super) async fn pull_and_cache_base_layers(
    ctx: StepContext,
    base: &BaseImage,
) -> Result<Vec<CachedLayer>> {
    let pulls = base.image.layers.iter().map(|layer| {
        let ctx = ctx.clone();
        let client = base.client.clone();
        let digest = layer.digest().clone();
        let size = layer.size();
        async move {
            if let Some(cached) = ctx.store.retrieve(&digest)? {
                tracing::debug!(digest = %digest, "Base image layer found in cache");
                return Ok(cached);
            }
            if ctx.config.flags.offline {
                return Err(BuildError::Other(format!(
                    "cannot build in offline mode: base image layer {} is not cached",
                    digest
                )));
            }
            let client = client.ok_or_else(|| {
                BuildError::Other(format!(
                    "no registry connection available to pull base image layer {}",
                    digest
                ))
            })?;

            let mut progress = ThrottledProgress::new(
                ctx.emitter.clone(),
                format!("pulling base image layer {}", digest),
                size,
            );
            let mut bytes = Vec::new();
            client
                .pull_blob(&digest, &mut bytes, |delta| progress.advance(delta))
                .await?;
            progress.finish();

            ctx.store.write_compressed_layer(&Blob::from_bytes(bytes))
        }
    });

    try_join_all(pulls).await
}

/// Build one application layer, or reuse the cached one its selector names.
pub(super) async fn build_and_cache_application_layer(
    ctx: StepContext,
    configuration: LayerConfiguration,
) -> Result<ApplicationLayer> {
    if let Some(cached) = ctx.store.retrieve_by_layer_entries(&configuration.entries)? {
        ctx.emitter
            .lifecycle(format!("Using cached {} layer", configuration.name));
        return Ok(ApplicationLayer {
            layer: cached,
            name: configuration.name,
        });
    }

    ctx.emitter
        .lifecycle(format!("Building {} layer...", configuration.name));
    let selector = generate_selector(&configuration.entries)?;
    let tar = build_layer_tar(&configuration.entries)?;
    let layer = ctx.store.write_uncompressed_layer(&tar, Some(&selector))?;

    Ok(ApplicationLayer {
        layer,
        name: configuration.name,
    })
}
