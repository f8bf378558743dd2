//! Lazy blob sources.
//!
//! A [`Blob`] is an opaque byte stream with a computable descriptor. Layer
//! contents stay on disk inside the cache; only small blobs (manifests,
//! container configurations) are held in memory.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use lateen_core::error::Result;

use crate::digest::{BlobDescriptor, Digest, DigestWriter};

/// A lazily-produced byte stream.
#[derive(Debug, Clone)]
pub enum Blob {
    /// Bytes held in memory (shared, never copied on clone).
    Bytes(Arc<Vec<u8>>),
    /// Bytes read from a file on demand.
    File(PathBuf),
}

impl Blob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Bytes(Arc::new(bytes))
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Stream the blob into `writer`, returning the descriptor of what was
    /// written.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<BlobDescriptor> {
        let mut digest_writer = DigestWriter::new(writer);
        match self {
            Blob::Bytes(bytes) => {
                digest_writer.write_all(bytes)?;
            }
            Blob::File(path) => {
                let mut file = std::fs::File::open(path)?;
                std::io::copy(&mut file, &mut digest_writer)?;
            }
        }
        digest_writer.flush()?;
        let (_, descriptor) = digest_writer.finish();
        Ok(descriptor)
    }

    /// Read the whole blob into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            Blob::Bytes(bytes) => Ok(bytes.as_ref().clone()),
            Blob::File(path) => {
                let mut buf = Vec::new();
                std::fs::File::open(path)?.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Compute the blob's descriptor without retaining the content.
    pub fn descriptor(&self) -> Result<BlobDescriptor> {
        match self {
            Blob::Bytes(bytes) => Ok(BlobDescriptor::new(
                bytes.len() as u64,
                Digest::of_bytes(bytes),
            )),
            Blob::File(_) => self.write_to(std::io::sink()),
        }
    }
}
