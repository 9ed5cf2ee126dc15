//! Storage contract for the Safe Browsing v2 chunk index
//!
//! The engine is written against the `Store` trait alone; any key-range
//! capable backend can implement it. The in-memory implementation in
//! [`memory`] backs tests and small deployments.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use shavar_hash::{FullHash, Prefix};

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed; the update engine treats this as an update
    /// failure and backs off.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// I/O error from a durable backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One stored add-chunk entry. The whole tuple is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddChunk {
    pub list: String,
    pub chunknum: u32,
    pub host: u32,
    pub prefix: Prefix,
}

/// One stored sub-chunk entry. The whole tuple is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubChunk {
    pub list: String,
    pub chunknum: u32,
    pub add_chunknum: u32,
    pub host: u32,
    pub prefix: Prefix,
}

/// A cached full hash tied to the add chunk that produced its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachedHash {
    pub list: String,
    pub chunknum: u32,
    pub hash: FullHash,
}

/// The storage operations the update and lookup engines require.
///
/// All operations are treated as atomic by the engine; implementations
/// may serve them concurrently. Bulk inserts must be idempotent so a
/// retried update converges.
#[async_trait]
pub trait Store: Send + Sync {
    /// Chunk-range strings (add, sub) for one list, as reported to the
    /// server in the next update request.
    async fn get_regions(&self, list: &str) -> Result<(String, String)>;

    /// Delete the named add-chunks. Callers also delete the companion
    /// full hashes (`delete_full_hashes`).
    async fn delete_add_chunks(&self, list: &str, chunknums: &[u32]) -> Result<()>;

    /// Delete the named sub-chunks.
    async fn delete_sub_chunks(&self, list: &str, chunknums: &[u32]) -> Result<()>;

    /// Delete cached full hashes belonging to the named add-chunks.
    async fn delete_full_hashes(&self, list: &str, chunknums: &[u32]) -> Result<()>;

    /// All add-chunk entries for a host key on the given lists.
    async fn get_add_chunks(&self, host: u32, lists: &[String]) -> Result<Vec<AddChunk>>;

    /// All sub-chunk entries for a host key on the given lists.
    async fn get_sub_chunks(&self, host: u32, lists: &[String]) -> Result<Vec<SubChunk>>;

    /// Cached full hashes for one add chunk, no older than
    /// `min_timestamp`. Older rows are evicted as a side effect.
    async fn get_full_hashes(
        &self,
        list: &str,
        chunknum: u32,
        min_timestamp: u64,
    ) -> Result<Vec<CachedHash>>;

    /// Bulk idempotent insert of add-chunk entries.
    async fn add_chunks_a(&self, entries: &[AddChunk]) -> Result<()>;

    /// Bulk idempotent insert of sub-chunk entries.
    async fn add_chunks_s(&self, entries: &[SubChunk]) -> Result<()>;

    /// Insert full hashes fetched at `timestamp`.
    async fn add_full_hashes(&self, entries: &[CachedHash], timestamp: u64) -> Result<()>;

    /// Wipe every add, sub, and full-hash row for one list.
    async fn reset(&self, list: &str) -> Result<()>;
}
