//! Hashing primitives for the Safe Browsing v2 protocol
//!
//! The v2 protocol works with SHA-256 digests of canonicalized URL
//! expressions. Three forms appear on the wire and in storage: the full
//! 32-byte hash, a short prefix of it (4 bytes unless the server says
//! otherwise), and the "host key": the first 4 bytes of
//! `SHA-256("<host>/")` read as a little-endian u32, used as the primary
//! storage index.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a full SHA-256 hash in bytes.
pub const FULL_HASH_LEN: usize = 32;

/// Length of the standard hash prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Error type for hash operations.
#[derive(Debug, Error)]
pub enum HashError {
    /// A byte slice had the wrong length for the hash form it claims to be.
    #[error("invalid hash length: {0}, expected {1}")]
    InvalidLength(usize, usize),
}

/// Result type for hash operations.
pub type Result<T> = std::result::Result<T, HashError>;

/// A full 32-byte SHA-256 hash of a canonical URL expression.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullHash([u8; FULL_HASH_LEN]);

impl FullHash {
    /// Hash a canonical URL expression such as `"evil.example.net/path"`.
    pub fn from_pattern(pattern: &str) -> Self {
        let digest = Sha256::digest(pattern.as_bytes());
        let mut bytes = [0u8; FULL_HASH_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Wrap raw bytes received from the `gethash` endpoint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FULL_HASH_LEN {
            return Err(HashError::InvalidLength(bytes.len(), FULL_HASH_LEN));
        }
        let mut hash = [0u8; FULL_HASH_LEN];
        hash.copy_from_slice(bytes);
        Ok(Self(hash))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The standard 4-byte prefix of this hash.
    pub fn prefix(&self) -> Prefix {
        Prefix::from_bytes(&self.0[..PREFIX_LEN])
    }

    /// Hexadecimal rendering, used in logs and state-file keys.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullHash({})", self.to_hex())
    }
}

impl AsRef<[u8]> for FullHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A hash prefix as carried in `a:`/`s:` chunk payloads.
///
/// May be empty: an empty prefix means "any path under this host", so the
/// host key alone decides the match. Non-empty prefixes are 1–32 leading
/// bytes of a full hash (4 in practice).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Prefix {
    bytes: Bytes,
}

impl Prefix {
    /// The empty prefix.
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }

    /// Prefix from raw chunk-payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(&bytes[..bytes.len().min(FULL_HASH_LEN)]),
        }
    }

    /// The standard 4-byte prefix of a canonical URL expression.
    pub fn from_pattern(pattern: &str) -> Self {
        let digest = Sha256::digest(pattern.as_bytes());
        Self {
            bytes: Bytes::copy_from_slice(&digest[..PREFIX_LEN]),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True if this prefix is a leading slice of `full`.
    ///
    /// The empty prefix matches every hash.
    pub fn matches(&self, full: &FullHash) -> bool {
        full.as_bytes().starts_with(&self.bytes)
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({})", self.to_hex())
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Full SHA-256 hash of a pattern; convenience alias for call sites that
/// read better as a function.
pub fn full_hash(pattern: &str) -> FullHash {
    FullHash::from_pattern(pattern)
}

/// Standard 4-byte prefix of a pattern.
pub fn prefix(pattern: &str) -> Prefix {
    Prefix::from_pattern(pattern)
}

/// Host key for a canonical host: the first 4 bytes of
/// `SHA-256("<host>/")` interpreted as a little-endian u32.
pub fn host_key(host: &str) -> u32 {
    let digest = Sha256::digest(format!("{host}/").as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
