//! In-memory store
//!
//! Keeps the whole chunk index in process memory behind an `RwLock`.
//! Suitable for tests and for deployments that re-sync on start; durable
//! backends implement [`Store`] against their own indexes.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use shavar_proto::format_ranges;

use crate::{AddChunk, CachedHash, Result, Store, SubChunk};

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    adds: HashSet<AddChunk>,
    subs: HashSet<SubChunk>,
    /// Cached hash rows with the fetch timestamp as the value.
    full_hashes: HashMap<CachedHash, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_regions(&self, list: &str) -> Result<(String, String)> {
        let inner = self.inner.read().await;

        let add_nums: Vec<u32> = inner
            .adds
            .iter()
            .filter(|a| a.list == list)
            .map(|a| a.chunknum)
            .collect();
        let sub_nums: Vec<u32> = inner
            .subs
            .iter()
            .filter(|s| s.list == list)
            .map(|s| s.chunknum)
            .collect();

        Ok((format_ranges(&add_nums), format_ranges(&sub_nums)))
    }

    async fn delete_add_chunks(&self, list: &str, chunknums: &[u32]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .adds
            .retain(|a| a.list != list || !chunknums.contains(&a.chunknum));
        Ok(())
    }

    async fn delete_sub_chunks(&self, list: &str, chunknums: &[u32]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .subs
            .retain(|s| s.list != list || !chunknums.contains(&s.chunknum));
        Ok(())
    }

    async fn delete_full_hashes(&self, list: &str, chunknums: &[u32]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .full_hashes
            .retain(|h, _| h.list != list || !chunknums.contains(&h.chunknum));
        Ok(())
    }

    async fn get_add_chunks(&self, host: u32, lists: &[String]) -> Result<Vec<AddChunk>> {
        let inner = self.inner.read().await;
        Ok(inner
            .adds
            .iter()
            .filter(|a| a.host == host && lists.contains(&a.list))
            .cloned()
            .collect())
    }

    async fn get_sub_chunks(&self, host: u32, lists: &[String]) -> Result<Vec<SubChunk>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subs
            .iter()
            .filter(|s| s.host == host && lists.contains(&s.list))
            .cloned()
            .collect())
    }

    async fn get_full_hashes(
        &self,
        list: &str,
        chunknum: u32,
        min_timestamp: u64,
    ) -> Result<Vec<CachedHash>> {
        let mut inner = self.inner.write().await;

        let before = inner.full_hashes.len();
        inner.full_hashes.retain(|_, ts| *ts >= min_timestamp);
        let evicted = before - inner.full_hashes.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale full hashes");
        }

        Ok(inner
            .full_hashes
            .keys()
            .filter(|h| h.list == list && h.chunknum == chunknum)
            .cloned()
            .collect())
    }

    async fn add_chunks_a(&self, entries: &[AddChunk]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.adds.extend(entries.iter().cloned());
        Ok(())
    }

    async fn add_chunks_s(&self, entries: &[SubChunk]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.subs.extend(entries.iter().cloned());
        Ok(())
    }

    async fn add_full_hashes(&self, entries: &[CachedHash], timestamp: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.full_hashes.insert(entry.clone(), timestamp);
        }
        Ok(())
    }

    async fn reset(&self, list: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.adds.retain(|a| a.list != list);
        inner.subs.retain(|s| s.list != list);
        inner.full_hashes.retain(|h, _| h.list != list);
        Ok(())
    }
}
