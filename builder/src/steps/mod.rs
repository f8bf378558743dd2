//! The build-step pipeline.
//!
//! Each step starts as soon as it is constructed and exposes a shared handle
//! dependent steps await. Failures propagate through the handles: a failed
//! predecessor fails every dependent await, and the terminal step surfaces
//! the root cause once.

mod build_image;
mod export;
mod layers;
mod pull_base;
mod push;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lateen_core::error::{BuildError, Result};
use lateen_core::event::{BuildEvent, EventEmitter};

use crate::blob::Blob;
use crate::cache::{CachedLayer, ContentStore};
use crate::configuration::BuildConfiguration;
use crate::digest::Digest;
use crate::docker::DockerClient;
use crate::image::json::{ManifestFormat, ManifestTemplate};
use crate::image::translate;

pub use layers::ApplicationLayer;

/// Final identity of a built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Digest of the image manifest.
    pub image_digest: Digest,
    /// Digest of the container configuration (the image ID).
    pub image_id: Digest,
}

/// Where the terminal step delivers the image.
pub enum BuildTarget {
    /// Push to the configured target registry.
    Registry,
    /// Load into a Docker daemon.
    Docker(Arc<dyn DockerClient>),
    /// Write a docker-save tarball to this path.
    Tarball(PathBuf),
}

/// Shared handle to a running step's result.
type StepHandle<T> = Shared<BoxFuture<'static, std::result::Result<Arc<T>, Arc<BuildError>>>>;

/// Overall step-count progress, shared by every step wrapper.
struct ProgressTracker {
    completed: AtomicU64,
    total: u64,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self {
            completed: AtomicU64::new(0),
            total,
        }
    }

    fn complete(&self, description: &str, emitter: &EventEmitter) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        emitter.emit(BuildEvent::StepProgress {
            description: description.to_string(),
            completed,
            total: self.total,
        });
    }
}

/// Everything a step body needs.
#[derive(Clone)]
struct StepContext {
    config: Arc<BuildConfiguration>,
    store: Arc<ContentStore>,
    emitter: EventEmitter,
    progress: Arc<ProgressTracker>,
}

/// Spawn a step body immediately and wrap its join handle as a shared,
/// awaitable handle. Success emits timing and step-progress events.
fn start_step<T, F>(ctx: &StepContext, description: String, body: F) -> StepHandle<T>
where
    T: Send + Sync + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let emitter = ctx.emitter.clone();
    let progress = ctx.progress.clone();
    let timed_description = description.clone();
    let join = tokio::spawn(async move {
        let started = Instant::now();
        let result = body.await;
        if result.is_ok() {
            emitter.emit(BuildEvent::Timing {
                description: timed_description.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            progress.complete(&timed_description, &emitter);
        }
        result
    });

    async move {
        match join.await {
            Ok(Ok(value)) => Ok(Arc::new(value)),
            Ok(Err(err)) => Err(Arc::new(err)),
            Err(join_err) => Err(Arc::new(BuildError::Other(format!(
                "build step '{}' panicked: {}",
                description, join_err
            )))),
        }
    }
    .boxed()
    .shared()
}

/// Await a predecessor step, wrapping its failure as an upstream error.
async fn await_step<T>(handle: &StepHandle<T>) -> Result<Arc<T>> {
    handle.clone().await.map_err(BuildError::upstream)
}

/// Wires and runs the whole pipeline for one build.
pub struct StepsRunner {
    config: Arc<BuildConfiguration>,
    emitter: EventEmitter,
}

impl StepsRunner {
    pub fn new(config: BuildConfiguration, emitter: EventEmitter) -> Self {
        Self {
            config: Arc::new(config),
            emitter,
        }
    }

    /// Run the pipeline to completion against `target`.
    ///
    /// Dropping the returned future cancels the build; spawned steps may
    /// briefly run on but nothing awaits them.
    pub async fn run(&self, target: BuildTarget) -> Result<BuildResult> {
        let store = Arc::new(ContentStore::new(&self.config.cache_directory)?);
        let app_layer_count = self
            .config
            .layer_configurations
            .iter()
            .filter(|c| !c.is_empty())
            .count() as u64;
        let total_steps = match target {
            BuildTarget::Registry => app_layer_count + 8,
            BuildTarget::Docker(_) | BuildTarget::Tarball(_) => app_layer_count + 4,
        };

        let ctx = StepContext {
            config: self.config.clone(),
            store,
            emitter: self.emitter.clone(),
            progress: Arc::new(ProgressTracker::new(total_steps)),
        };

        ctx.emitter.lifecycle(format!(
            "Building {} from base image {}...",
            self.config.target_image.full_reference(),
            self.config.base_image.full_reference()
        ));

        // Independent roots start first.
        let base_image = start_step(
            &ctx,
            "pulling base image manifest".to_string(),
            pull_base::pull_base_image(ctx.clone()),
        );

        let base_layers = {
            let ctx2 = ctx.clone();
            let base_image = base_image.clone();
            start_step(&ctx, "pulling base image layers".to_string(), async move {
                let base = await_step(&base_image).await?;
                layers::pull_and_cache_base_layers(ctx2, &base).await
            })
        };

        let app_layers: Vec<StepHandle<ApplicationLayer>> = self
            .config
            .layer_configurations
            .iter()
            .filter(|c| !c.is_empty())
            .cloned()
            .map(|configuration| {
                let description = format!("building {} layer", configuration.name);
                start_step(
                    &ctx,
                    description,
                    layers::build_and_cache_application_layer(ctx.clone(), configuration),
                )
            })
            .collect();

        let built_image = {
            let ctx2 = ctx.clone();
            let base_image = base_image.clone();
            let base_layers = base_layers.clone();
            let app_layers = app_layers.clone();
            start_step(&ctx, "building image".to_string(), async move {
                let base = await_step(&base_image).await?;
                let base_layers = await_step(&base_layers).await?;
                let mut applications = Vec::with_capacity(app_layers.len());
                for handle in &app_layers {
                    applications.push(await_step(handle).await?);
                }
                build_image::build_image(&ctx2, &base.image, &base_layers, &applications)
            })
        };

        match target {
            BuildTarget::Registry => {
                self.run_push(&ctx, base_layers, app_layers, built_image)
                    .await
            }
            BuildTarget::Docker(docker) => {
                let ctx2 = ctx.clone();
                let result =
                    start_step(&ctx, "loading into Docker daemon".to_string(), async move {
                        let image = await_step(&built_image).await?;
                        let (config_digest, config_bytes, manifest) =
                            serialize_image(&image, ctx2.config.manifest_format)?;
                        export::load_into_docker(&ctx2, docker, &image, &config_bytes).await?;
                        Ok(BuildResult {
                            image_digest: Digest::of_bytes(&manifest.to_bytes()?),
                            image_id: config_digest,
                        })
                    });
                Ok((*await_step(&result).await?).clone())
            }
            BuildTarget::Tarball(path) => {
                let ctx2 = ctx.clone();
                let result = start_step(&ctx, "writing tar file".to_string(), async move {
                    let image = await_step(&built_image).await?;
                    let (config_digest, config_bytes, manifest) =
                        serialize_image(&image, ctx2.config.manifest_format)?;
                    export::write_tar_file(&ctx2, &path, &image, &config_bytes).await?;
                    Ok(BuildResult {
                        image_digest: Digest::of_bytes(&manifest.to_bytes()?),
                        image_id: config_digest,
                    })
                });
                Ok((*await_step(&result).await?).clone())
            }
        }
    }

    async fn run_push(
        &self,
        ctx: &StepContext,
        base_layers: StepHandle<Vec<CachedLayer>>,
        app_layers: Vec<StepHandle<ApplicationLayer>>,
        built_image: StepHandle<crate::image::Image>,
    ) -> Result<BuildResult> {
        let authenticated = start_step(
            ctx,
            "authenticating with target registry".to_string(),
            push::authenticate_push(ctx.clone()),
        );

        // Cross-mount base layers when both images live on one registry.
        let mount_from = if !self.config.base_image.is_scratch()
            && self.config.base_image.registry == self.config.target_image.registry
        {
            Some(self.config.base_image.repository.clone())
        } else {
            None
        };

        let push_base_layers = {
            let ctx2 = ctx.clone();
            let authenticated = authenticated.clone();
            start_step(ctx, "pushing base image layers".to_string(), async move {
                let client = await_step(&authenticated).await?;
                let layers = await_step(&base_layers).await?;
                push::push_layers(&ctx2, &client, &layers, mount_from.as_deref()).await
            })
        };

        let push_app_layers = {
            let ctx2 = ctx.clone();
            let authenticated = authenticated.clone();
            start_step(ctx, "pushing application layers".to_string(), async move {
                let client = await_step(&authenticated).await?;
                let mut layers = Vec::with_capacity(app_layers.len());
                for handle in &app_layers {
                    layers.push(await_step(handle).await?.layer.clone());
                }
                push::push_layers(&ctx2, &client, &layers, None).await
            })
        };

        let push_configuration = {
            let ctx2 = ctx.clone();
            let authenticated = authenticated.clone();
            let built_image = built_image.clone();
            start_step(
                ctx,
                "pushing container configuration".to_string(),
                async move {
                    let client = await_step(&authenticated).await?;
                    let image = await_step(&built_image).await?;
                    let (digest, bytes, _) =
                        serialize_image(&image, ctx2.config.manifest_format)?;
                    ctx2.emitter.lifecycle("Pushing container configuration...");
                    client
                        .push_blob(&Blob::from_bytes(bytes.clone()), &digest, None)
                        .await?;
                    Ok((digest, bytes))
                },
            )
        };

        let terminal = {
            let ctx2 = ctx.clone();
            start_step(ctx, "pushing image manifest".to_string(), async move {
                await_step(&push_base_layers).await?;
                await_step(&push_app_layers).await?;
                let client = await_step(&authenticated).await?;
                let image = await_step(&built_image).await?;
                let pushed_config = await_step(&push_configuration).await?;
                let (config_digest, config_bytes) = &*pushed_config;

                let buildable =
                    translate::manifest(&image, config_bytes, ctx2.config.manifest_format)?;
                let manifest = wrap_manifest(ctx2.config.manifest_format, buildable);
                let tags = ctx2.config.target_tags();
                ctx2.emitter.lifecycle(format!(
                    "Pushing manifest for {}...",
                    ctx2.config.target_image.full_reference()
                ));
                let image_digest = push::push_manifests(&client, &manifest, &tags).await?;
                Ok(BuildResult {
                    image_digest,
                    image_id: config_digest.clone(),
                })
            })
        };

        let result = await_step(&terminal).await?;
        ctx.emitter.lifecycle(format!(
            "Built and pushed image as {}",
            self.config.target_image.full_reference()
        ));
        Ok((*result).clone())
    }
}

/// Serialize an image's container configuration and manifest for one format.
fn serialize_image(
    image: &crate::image::Image,
    format: ManifestFormat,
) -> Result<(Digest, Vec<u8>, ManifestTemplate)> {
    let template = translate::container_configuration(image, format)?;
    let (digest, bytes) = Digest::of_json(&template)?;
    let buildable = translate::manifest(image, &bytes, format)?;
    Ok((digest, bytes, wrap_manifest(format, buildable)))
}

fn wrap_manifest(
    format: ManifestFormat,
    buildable: crate::image::json::BuildableManifestTemplate,
) -> ManifestTemplate {
    match format {
        ManifestFormat::DockerV22 => ManifestTemplate::V22(buildable),
        ManifestFormat::Oci => ManifestTemplate::Oci(buildable),
    }
}
