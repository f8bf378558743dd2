//! Content-addressed layer storage and the selector index.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use lateen_core::error::{BuildError, Result};
use tempfile::NamedTempFile;

use super::CachedLayer;
use crate::blob::Blob;
use crate::digest::{Digest, DigestWriter};
use crate::layer::{generate_selector, LayerEntry};

/// The on-disk content store.
///
/// All paths are pure functions of `(root, digest)`, so concurrent use from
/// multiple instances over the same root is safe: layer writes go through a
/// temp file in `tmp/` followed by a rename, and selector writes are
/// last-write-wins hints.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a content store at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.layers_dir(),
            store.selectors_dir(),
            store.images_dir(),
            store.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Other(format!(
                    "failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    fn selectors_dir(&self) -> PathBuf {
        self.root.join("selectors")
    }

    pub(super) fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub(super) fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn layer_dir(&self, digest: &Digest) -> PathBuf {
        self.layers_dir().join(digest.hash())
    }

    fn selector_path(&self, selector: &Digest) -> PathBuf {
        self.selectors_dir().join(selector.hash())
    }

    /// Write an already-compressed layer blob into the cache.
    ///
    /// The blob is streamed to a temp file while its compressed digest is
    /// computed; the same bytes are fed through a gzip decoder to capture the
    /// diff ID without retaining the decompressed content.
    pub fn write_compressed_layer(&self, compressed: &Blob) -> Result<CachedLayer> {
        let temp = NamedTempFile::new_in(self.tmp_dir())?;

        let file_writer = DigestWriter::new(temp.reopen()?);
        let diff_writer = GzDecoder::new(DigestWriter::new(std::io::sink()));
        let mut tee = TeeWriter::new(file_writer, diff_writer);
        compressed.write_to(&mut tee)?;
        tee.flush()?;
        let (file_writer, diff_writer) = tee.into_inner();

        let (_, descriptor) = file_writer.finish();
        let decoded = diff_writer.finish().map_err(|e| {
            BuildError::Other(format!("failed to decompress layer while caching: {}", e))
        })?;
        let (_, diff_descriptor) = decoded.finish();
        let diff_id = diff_descriptor.digest;

        let path = self.commit_layer_file(temp, &descriptor.digest, &diff_id)?;
        Ok(CachedLayer {
            descriptor,
            diff_id,
            blob: Blob::from_file(path),
        })
    }

    /// Compress and write an uncompressed layer blob into the cache.
    ///
    /// The diff ID is captured from the pre-compression stream and the layer
    /// digest from the post-compression stream in a single pass. When a
    /// selector is supplied, a selector file pointing at the resulting layer
    /// digest is also written.
    pub fn write_uncompressed_layer(
        &self,
        uncompressed: &Blob,
        selector: Option<&Digest>,
    ) -> Result<CachedLayer> {
        let temp = NamedTempFile::new_in(self.tmp_dir())?;

        let file_writer = DigestWriter::new(temp.reopen()?);
        let mut encoder = GzEncoder::new(file_writer, Compression::default());
        let diff_descriptor = uncompressed.write_to(&mut encoder)?;
        let file_writer = encoder
            .finish()
            .map_err(|e| BuildError::Other(format!("failed to compress layer: {}", e)))?;
        let (_, descriptor) = file_writer.finish();
        let diff_id = diff_descriptor.digest;

        let path = self.commit_layer_file(temp, &descriptor.digest, &diff_id)?;

        if let Some(selector) = selector {
            self.write_selector(selector, &descriptor.digest)?;
        }

        Ok(CachedLayer {
            descriptor,
            diff_id,
            blob: Blob::from_file(path),
        })
    }

    /// Retrieve a cached layer by its compressed digest.
    ///
    /// Exactly one layer file is expected in the digest's directory: none
    /// means not cached; more than one means the cache is corrupted.
    pub fn retrieve(&self, digest: &Digest) -> Result<Option<CachedLayer>> {
        let layer_dir = self.layer_dir(digest);
        if !layer_dir.is_dir() {
            return Ok(None);
        }

        let mut layer_files: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&layer_dir)? {
            let path = entry?.path();
            let is_layer_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| Digest::from_hash(n).is_ok())
                .unwrap_or(false);
            if is_layer_file {
                layer_files.push(path);
            }
        }

        match layer_files.len() {
            0 => Ok(None),
            1 => {
                let path = layer_files.remove(0);
                // File name validity was checked while listing.
                let diff_id = Digest::from_hash(
                    path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
                )?;
                let size = std::fs::metadata(&path)?.len();
                Ok(Some(CachedLayer {
                    descriptor: crate::digest::BlobDescriptor::new(size, digest.clone()),
                    diff_id,
                    blob: Blob::from_file(path),
                }))
            }
            n => Err(BuildError::CacheCorrupted {
                path: layer_dir.display().to_string(),
                message: format!("expected one layer file but found {}", n),
            }),
        }
    }

    /// Resolve a selector to the layer digest it points at.
    pub fn select(&self, selector: &Digest) -> Result<Option<Digest>> {
        let path = self.selector_path(selector);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        match Digest::from_hash(content.trim()) {
            Ok(digest) => Ok(Some(digest)),
            Err(_) => Err(BuildError::CacheCorrupted {
                path: path.display().to_string(),
                message: format!("selector file content '{}' is not a valid digest", content),
            }),
        }
    }

    /// Look up a previously built layer by its source entries.
    pub fn retrieve_by_layer_entries(
        &self,
        entries: &[LayerEntry],
    ) -> Result<Option<CachedLayer>> {
        let selector = generate_selector(entries)?;
        match self.select(&selector)? {
            Some(digest) => self.retrieve(&digest),
            None => Ok(None),
        }
    }

    /// Move a finished temp layer file into `layers/<digest>/<diffid>`.
    fn commit_layer_file(
        &self,
        temp: NamedTempFile,
        digest: &Digest,
        diff_id: &Digest,
    ) -> Result<PathBuf> {
        let layer_dir = self.layer_dir(digest);
        std::fs::create_dir_all(&layer_dir)?;
        let target = layer_dir.join(diff_id.hash());
        temp.persist(&target).map_err(|e| {
            BuildError::Other(format!(
                "failed to move layer into cache at {}: {}",
                target.display(),
                e
            ))
        })?;
        Ok(target)
    }

    /// Atomically write a selector file (last write wins; selectors are hints).
    fn write_selector(&self, selector: &Digest, target: &Digest) -> Result<()> {
        let mut temp = NamedTempFile::new_in(self.tmp_dir())?;
        temp.write_all(target.hash().as_bytes())?;
        let path = self.selector_path(selector);
        temp.persist(&path).map_err(|e| {
            BuildError::Other(format!(
                "failed to write selector {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(selector = %selector, target = %target, "Wrote layer selector");
        Ok(())
    }
}

/// Duplicates writes to two inner writers.
struct TeeWriter<A: Write, B: Write> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    fn new(a: A, b: B) -> Self {
        Self { a, b }
    }

    fn into_inner(self) -> (A, B) {
        (self.a, self.b)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.a.write_all(buf)?;
        self.b.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}
