//! Lateen Builder - Container image build pipeline.
//!
//! Builds OCI/Docker images from filesystem layers and delivers them to a
//! registry, the Docker daemon, or a tarball, backed by a digest-keyed
//! on-disk cache. No external container-build tool is invoked.

pub mod blob;
pub mod cache;
pub mod configuration;
pub mod digest;
pub mod docker;
pub mod image;
pub mod layer;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod steps;
pub mod tarball;

// Re-export common types
pub use blob::Blob;
pub use cache::{CachedLayer, ContentStore, ImageMetadata};
pub use configuration::{BuildConfiguration, ContainerSettings};
pub use digest::{BlobDescriptor, Digest};
pub use docker::{CommandDockerClient, DockerClient};
pub use image::json::ManifestFormat;
pub use image::{Image, ImageBuilder, Layer};
pub use layer::{LayerConfiguration, LayerEntry};
pub use reference::ImageReference;
pub use registry::{AccessScope, Credential, RegistryClient, TOKEN_USERNAME};
pub use steps::{BuildResult, BuildTarget, StepsRunner};
