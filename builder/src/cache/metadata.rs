//! Per-image manifest/config metadata with lock-file-guarded writes.

use std::io::Write;
use std::path::PathBuf;

use fs4::FileExt;
use lateen_core::error::{BuildError, Result};
use tempfile::NamedTempFile;

use super::ContentStore;
use crate::image::json::{
    parse_manifest, ContainerConfigurationTemplate, ManifestTemplate,
};
use crate::reference::ImageReference;

const MANIFEST_FILE: &str = "manifest.json";
const CONFIG_FILE: &str = "config.json";
const LOCK_FILE: &str = "lock";

/// Cached manifest and (for V2.2/OCI) container configuration for one image.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub manifest: ManifestTemplate,
    pub config: Option<ContainerConfigurationTemplate>,
}

impl ContentStore {
    fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.images_dir().join(reference.cache_directory_name())
    }

    /// Persist an image's manifest (and config, when present) into the cache.
    ///
    /// Writes are serialized across processes by an exclusive lock on the
    /// image directory's lock file; each file lands via temp-then-rename.
    pub fn write_metadata(
        &self,
        reference: &ImageReference,
        manifest: &ManifestTemplate,
        config: Option<&ContainerConfigurationTemplate>,
    ) -> Result<()> {
        let dir = self.image_dir(reference);
        std::fs::create_dir_all(&dir)?;

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;

        let result = (|| {
            self.write_file(&dir.join(MANIFEST_FILE), &manifest.to_bytes()?)?;
            if let Some(config) = config {
                self.write_file(&dir.join(CONFIG_FILE), &serde_json::to_vec(config)?)?;
            }
            Ok(())
        })();

        let _ = lock.unlock();
        tracing::debug!(reference = %reference, "Cached image metadata");
        result
    }

    /// Load an image's cached manifest and config.
    ///
    /// Returns `None` when nothing is cached. A manifest that requires a
    /// container configuration (V2.2/OCI) without a readable `config.json`
    /// is a corruption error.
    pub fn retrieve_metadata(
        &self,
        reference: &ImageReference,
    ) -> Result<Option<ImageMetadata>> {
        let dir = self.image_dir(reference);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(None);
        }

        let manifest_bytes = std::fs::read(&manifest_path)?;
        let manifest = parse_manifest(&manifest_bytes).map_err(|e| {
            BuildError::CacheCorrupted {
                path: dir.display().to_string(),
                message: format!("unreadable cached manifest: {}", e.root()),
            }
        })?;

        // V2.1 embeds its config in manifest history; the others require a
        // config.json alongside.
        let config = match &manifest {
            ManifestTemplate::V21(_) => None,
            ManifestTemplate::V22(_) | ManifestTemplate::Oci(_) => {
                let config_path = dir.join(CONFIG_FILE);
                if !config_path.is_file() {
                    return Err(BuildError::CacheCorrupted {
                        path: dir.display().to_string(),
                        message: "manifest requires a container configuration but config.json is missing"
                            .to_string(),
                    });
                }
                let config_bytes = std::fs::read(&config_path)?;
                let config: ContainerConfigurationTemplate =
                    serde_json::from_slice(&config_bytes).map_err(|e| {
                        BuildError::CacheCorrupted {
                            path: dir.display().to_string(),
                            message: format!("unreadable cached container configuration: {}", e),
                        }
                    })?;
                Some(config)
            }
        };

        Ok(Some(ImageMetadata { manifest, config }))
    }

    fn write_file(&self, target: &PathBuf, bytes: &[u8]) -> Result<()> {
        let mut temp = NamedTempFile::new_in(self.tmp_dir())?;
        temp.write_all(bytes)?;
        temp.persist(target).map_err(|e| {
            BuildError::Other(format!("failed to write {}: {}", target.display(), e))
        })?;
        Ok(())
    }
}
