//! Terminal steps that deliver the image locally: Docker daemon load and
//! tar file export.

use std::path::Path;
use std::sync::Arc;

use fs4::FileExt;
use lateen_core::error::Result;

use super::StepContext;
use crate::docker::DockerClient;
use crate::image::Image;
use crate::tarball::write_tarball;

pub(super) async fn load_into_docker(
    ctx: &StepContext,
    docker: Arc<dyn DockerClient>,
    image: &Image,
    config_bytes: &[u8],
) -> Result<()> {
    let main_reference = ctx.config.target_image.full_reference();
    ctx.emitter.lifecycle(format!(
        "Loading {} into the Docker daemon...",
        main_reference
    ));

    let mut tarball = Vec::new();
    write_tarball(image, config_bytes, &[main_reference.clone()], &mut tarball)?;
    let output = docker.load(tarball).await?;
    tracing::debug!(output = %output, "docker load finished");

    // The load applied the main tag; additional tags are applied directly.
    for tag in &ctx.config.additional_tags {
        let target = format!(
            "{}/{}:{}",
            ctx.config.target_image.registry, ctx.config.target_image.repository, tag
        );
        docker.tag(&main_reference, &target).await?;
        ctx.emitter.lifecycle(format!("Tagged image as {}", target));
    }
    Ok(())
}

pub(super) async fn write_tar_file(
    ctx: &StepContext,
    path: &Path,
    image: &Image,
    config_bytes: &[u8],
) -> Result<()> {
    ctx.emitter
        .lifecycle(format!("Writing image tarball to {}...", path.display()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.lock_exclusive()?;

    let result = write_tarball(
        image,
        config_bytes,
        &[ctx.config.target_image.full_reference()],
        &file,
    );
    let _ = file.unlock();
    result
}
