//! Canonical content addressing.
//!
//! Everything content-addressed in Lateen (layers, manifests, container
//! configurations, selectors) is keyed by a SHA-256 [`Digest`] in the
//! textual form `sha256:<64 lowercase hex chars>`.

use std::fmt;
use std::io::{self, Write};

use lateen_core::error::{BuildError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Algorithm prefix for all digests.
const PREFIX: &str = "sha256:";

/// Length of the hex-encoded hash.
const HASH_LEN: usize = 64;

/// A SHA-256 content digest (`sha256:<64 hex chars>`).
///
/// Immutable and cheap to clone; compares and hashes by value, so it is
/// usable as a map key wherever content is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: String,
}

impl Digest {
    /// Parse a full digest string (`sha256:<hex>`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix(PREFIX) {
            Some(hash) => Self::from_hash(hash),
            None => Err(BuildError::DigestFormat(format!(
                "'{}' is missing the '{}' prefix",
                s, PREFIX
            ))),
        }
    }

    /// Build a digest from the bare 64-character hex hash.
    pub fn from_hash(hash: &str) -> Result<Self> {
        if hash.len() != HASH_LEN
            || !hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(BuildError::DigestFormat(format!(
                "'{}' is not a {}-character lowercase hex string",
                hash, HASH_LEN
            )));
        }
        Ok(Self {
            hash: hash.to_string(),
        })
    }

    /// Digest of a byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(bytes));
        Self { hash }
    }

    /// Digest of a value's canonical JSON bytes, together with those bytes.
    pub fn of_json<T: Serialize>(value: &T) -> Result<(Self, Vec<u8>)> {
        let bytes = serde_json::to_vec(value)?;
        Ok((Self::of_bytes(&bytes), bytes))
    }

    /// The bare hex hash without the algorithm prefix.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.hash)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Describes a blob without containing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub size: u64,
    pub digest: Digest,
}

impl BlobDescriptor {
    pub fn new(size: u64, digest: Digest) -> Self {
        Self { size, digest }
    }
}

/// An `io::Write` adapter that forwards to an inner writer while keeping a
/// running SHA-256 and byte count of everything written through it.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Finish, returning the inner writer and the descriptor of the bytes seen.
    pub fn finish(self) -> (W, BlobDescriptor) {
        let hash = hex::encode(self.hasher.finalize());
        (
            self.inner,
            BlobDescriptor {
                size: self.count,
                digest: Digest { hash },
            },
        )
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256 of the empty string
    const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_of_bytes_empty() {
        let digest = Digest::of_bytes(b"");
        assert_eq!(digest.hash(), EMPTY_HASH);
        assert_eq!(digest.to_string(), format!("sha256:{}", EMPTY_HASH));
    }

    #[test]
    fn test_of_bytes_deterministic() {
        assert_eq!(Digest::of_bytes(b"lateen"), Digest::of_bytes(b"lateen"));
        assert_ne!(Digest::of_bytes(b"lateen"), Digest::of_bytes(b"other"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let digest = Digest::of_bytes(b"some content");
        let parsed = Digest::parse(&digest.to_string()).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_parse_rejects_missing_prefix() {
        assert!(Digest::parse(EMPTY_HASH).is_err());
    }

    #[test]
    fn test_from_hash_rejects_bad_input() {
        // Too short
        assert!(Digest::from_hash("abc123").is_err());
        // Uppercase hex
        assert!(Digest::from_hash(&EMPTY_HASH.to_uppercase()).is_err());
        // Non-hex characters
        assert!(Digest::from_hash(&"z".repeat(64)).is_err());
        // Valid
        assert!(Digest::from_hash(EMPTY_HASH).is_ok());
    }

    #[test]
    fn test_serde_roundtrip() {
        let digest = Digest::of_bytes(b"serde");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_serde_rejects_malformed() {
        let result: std::result::Result<Digest, _> = serde_json::from_str("\"sha256:nope\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_digest_writer_matches_of_bytes() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (inner, descriptor) = writer.finish();

        assert_eq!(inner, b"hello world");
        assert_eq!(descriptor.size, 11);
        assert_eq!(descriptor.digest, Digest::of_bytes(b"hello world"));
    }

    #[test]
    fn test_of_json_matches_serialized_bytes() {
        let value = serde_json::json!({"a": 1, "b": [2, 3]});
        let (digest, bytes) = Digest::of_json(&value).unwrap();
        assert_eq!(digest, Digest::of_bytes(&bytes));
    }
}
