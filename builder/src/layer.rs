//! Application layer configuration and reproducible layer construction.
//!
//! A [`LayerConfiguration`] names an ordered set of [`LayerEntry`]s: files
//! from the build context placed at absolute paths inside the image. Layers
//! built from the same entries are bit-identical across machines and runs:
//! tar entries are sorted, ownership is normalized, and timestamps come from
//! the entry metadata rather than the filesystem.

use std::path::{Path, PathBuf};

use lateen_core::error::{BuildError, Result};
use serde::Serialize;
use tar::{EntryType, Header};

use crate::blob::Blob;
use crate::digest::Digest;

/// One filesystem object placed into a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Path of the source file on the build machine.
    pub source_path: PathBuf,
    /// Absolute unix path inside the image.
    pub extraction_path: String,
    /// Unix permission bits.
    pub permissions: u32,
    /// Modification time recorded in the layer (seconds since epoch).
    pub modification_time: i64,
}

impl LayerEntry {
    pub fn new(
        source_path: impl Into<PathBuf>,
        extraction_path: impl Into<String>,
        permissions: u32,
        modification_time: i64,
    ) -> Result<Self> {
        let extraction_path = extraction_path.into();
        if !extraction_path.starts_with('/') {
            return Err(BuildError::Other(format!(
                "extraction path '{}' is not an absolute unix path",
                extraction_path
            )));
        }
        Ok(Self {
            source_path: source_path.into(),
            extraction_path,
            permissions,
            modification_time,
        })
    }
}

/// An ordered, named set of layer entries.
#[derive(Debug, Clone, Default)]
pub struct LayerConfiguration {
    /// Label recorded in the image history (e.g. "dependencies", "classes").
    pub name: String,
    /// Entries in configured order.
    pub entries: Vec<LayerEntry>,
}

impl LayerConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: LayerEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Projection of a layer entry serialized into the selector JSON.
#[derive(Serialize)]
struct SelectorEntry {
    source_path: String,
    extraction_path: String,
    modification_time: i64,
    permissions: String,
}

/// Compute the selector digest for a set of layer entries.
///
/// The selector is a secondary cache key: it identifies a previously built
/// layer by what went into it, before the layer's content digest is known.
/// Entries are sorted by (source path, extraction path, modification time,
/// permissions), so any permutation of the same set selects the same digest.
pub fn generate_selector(entries: &[LayerEntry]) -> Result<Digest> {
    let mut sorted: Vec<&LayerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        (
            &a.source_path,
            &a.extraction_path,
            a.modification_time,
            a.permissions,
        )
            .cmp(&(
                &b.source_path,
                &b.extraction_path,
                b.modification_time,
                b.permissions,
            ))
    });

    let projection: Vec<SelectorEntry> = sorted
        .iter()
        .map(|e| SelectorEntry {
            source_path: e.source_path.to_string_lossy().into_owned(),
            extraction_path: e.extraction_path.clone(),
            modification_time: e.modification_time,
            permissions: format!("{:o}", e.permissions),
        })
        .collect();

    let (digest, _) = Digest::of_json(&projection)?;
    Ok(digest)
}

/// Build an uncompressed, reproducible tar archive from layer entries.
///
/// Entries are emitted sorted by extraction path, with parent directories
/// synthesized ahead of their children. Ownership is normalized to root.
pub fn build_layer_tar(entries: &[LayerEntry]) -> Result<Blob> {
    let mut sorted: Vec<&LayerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));

    let mut builder = tar::Builder::new(Vec::new());
    let mut seen_dirs: Vec<String> = Vec::new();

    for entry in sorted {
        append_parent_dirs(&mut builder, &entry.extraction_path, &mut seen_dirs)?;

        if entry.source_path.is_dir() {
            let mut header = directory_header(entry.modification_time, entry.permissions);
            builder.append_data(
                &mut header,
                format!("{}/", tar_path(&entry.extraction_path)),
                std::io::empty(),
            )?;
            seen_dirs.push(entry.extraction_path.clone());
        } else {
            let contents = std::fs::read(&entry.source_path).map_err(|e| {
                BuildError::Other(format!(
                    "failed to read layer source {}: {}",
                    entry.source_path.display(),
                    e
                ))
            })?;
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(contents.len() as u64);
            header.set_mode(entry.permissions);
            header.set_mtime(entry.modification_time.max(0) as u64);
            header.set_uid(0);
            header.set_gid(0);
            builder.append_data(&mut header, tar_path(&entry.extraction_path), &contents[..])?;
        }
    }

    let bytes = builder.into_inner()?;
    Ok(Blob::from_bytes(bytes))
}

/// Synthesize directory entries for every ancestor of `extraction_path` not
/// yet present in the archive.
fn append_parent_dirs(
    builder: &mut tar::Builder<Vec<u8>>,
    extraction_path: &str,
    seen_dirs: &mut Vec<String>,
) -> Result<()> {
    let mut ancestors = Vec::new();
    let mut current = Path::new(extraction_path);
    while let Some(parent) = current.parent() {
        if parent == Path::new("/") {
            break;
        }
        ancestors.push(parent.to_string_lossy().to_string());
        current = parent;
    }

    for dir in ancestors.into_iter().rev() {
        if seen_dirs.contains(&dir) {
            continue;
        }
        // Synthesized directories get a fixed epoch timestamp so the layer
        // stays reproducible.
        let mut header = directory_header(0, 0o755);
        builder.append_data(&mut header, format!("{}/", tar_path(&dir)), std::io::empty())?;
        seen_dirs.push(dir);
    }
    Ok(())
}

fn directory_header(mtime: i64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    header.set_mtime(mtime.max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Tar member names are relative ("usr/app/x"), not absolute.
fn tar_path(extraction_path: &str) -> &str {
    extraction_path.trim_start_matches('/').trim_end_matches('/')
}
