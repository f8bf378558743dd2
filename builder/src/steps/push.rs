//! Push steps: authentication, layer blobs, manifests.

use futures::future::try_join_all;
use lateen_core::error::{BuildError, Result};

use super::StepContext;
use crate::cache::CachedLayer;
use crate::digest::Digest;
use crate::image::json::ManifestTemplate;
use crate::registry::{AccessScope, RegistryClient};

pub(super) async fn authenticate_push(ctx: StepContext) -> Result<RegistryClient> {
    let target = &ctx.config.target_image;
    ctx.emitter
        .lifecycle(format!("Authenticating with {}...", target.registry));
    let mut client =
        RegistryClient::new(&target.registry, &target.repository, &ctx.config.flags)?;
    client
        .authenticate(ctx.config.target_credential.as_ref(), AccessScope::PullPush)
        .await?;
    Ok(client)
}

/// Push all layers concurrently; existing blobs are skipped with a log line.
pub(super) async fn push_layers(
    ctx: &StepContext,
    client: &RegistryClient,
    layers: &[CachedLayer],
    mount_from: Option<&str>,
) -> Result<()> {
    let pushes = layers.iter().map(|layer| async move {
        let skipped = client
            .push_blob(&layer.blob, layer.digest(), mount_from)
            .await?;
        if skipped {
            ctx.emitter.lifecycle(format!(
                "Layer {} already exists on {}; skipping push",
                layer.digest(),
                client.registry()
            ));
        }
        Ok::<(), BuildError>(())
    });
    try_join_all(pushes).await?;
    Ok(())
}

/// Push the manifest once per target tag, concurrently; all pushes must
/// acknowledge the same digest.
pub(super) async fn push_manifests(
    client: &RegistryClient,
    manifest: &ManifestTemplate,
    tags: &[String],
) -> Result<Digest> {
    let pushes = tags.iter().map(|tag| client.push_manifest(manifest, tag));
    let digests = try_join_all(pushes).await?;
    digests
        .into_iter()
        .next()
        .ok_or_else(|| BuildError::Other("no target tags to push".to_string()))
}
