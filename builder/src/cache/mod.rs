//! Digest-keyed, atomically-written on-disk cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <cache>/
//! ├── layers/<digest-hex>/<diffid-hex>   (compressed layer blob)
//! ├── selectors/<selector-hex>           (content: target digest hex)
//! ├── images/<sanitized-ref>/            (manifest.json, config.json, lock)
//! └── tmp/                               (scratch for temp-then-rename writes)
//! ```
//!
//! Layer writes are content-addressed, so concurrent writers of identical
//! content may race freely. Metadata writes are serialized per image by a
//! lock file.

mod metadata;
mod store;

pub use metadata::ImageMetadata;
pub use store::ContentStore;

use crate::blob::Blob;
use crate::digest::{BlobDescriptor, Digest};

/// A layer present in the cache: compressed blob on disk, digests known.
///
/// Immutable once built; owned by whichever step retrieved or created it.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    /// Descriptor of the compressed on-wire blob.
    pub descriptor: BlobDescriptor,
    /// Digest of the uncompressed content.
    pub diff_id: Digest,
    /// Lazy source for the compressed bytes.
    pub blob: Blob,
}

impl CachedLayer {
    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }
}
