//! The lookup engine
//!
//! A lookup is local-first: canonicalize the URL, hash its host/path
//! expressions, and intersect the prefixes with the chunk index under
//! each host-suffix key. Only when an add-chunk candidate survives
//! sub-chunk subtraction does the engine consult full hashes: cached
//! ones when fresh, otherwise a `gethash` round trip guarded by
//! per-prefix failure backoff.

use tracing::{debug, error, warn};

use shavar_db::{AddChunk, CachedHash};
use shavar_hash::{host_key, FullHash};
use shavar_proto::parse_gethash_response;
use shavar_url::{canonicalize, host_suffixes, url_permutations};

use crate::error::Result;
use crate::state::PrefixFailure;
use crate::{now_secs, Shavar};

/// Prefix size sent to `gethash`.
const GETHASH_PREFIX_LEN: usize = 4;

/// Failures after the first only escalate when spaced beyond this window.
const PROMOTION_WINDOW_SECS: u64 = 5 * 60;

impl Shavar {
    /// Test a URL against the given lists. Returns the names of the lists
    /// claiming it, or an empty vector.
    ///
    /// URLs that cannot be canonicalized and `gethash` trouble both
    /// resolve to "no match"; only storage failures surface as errors.
    pub async fn lookup(&self, lists: &[&str], url: &str) -> Result<Vec<String>> {
        let canonical = match canonicalize(url) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!(url, error = %e, "lookup URL failed canonicalization");
                return Ok(Vec::new());
            }
        };

        let lists: Vec<String> = lists.iter().map(|l| l.to_string()).collect();
        let hashes: Vec<FullHash> = url_permutations(&canonical)
            .iter()
            .map(|expression| FullHash::from_pattern(expression))
            .collect();

        let mut matches: Vec<String> = Vec::new();
        for suffix in host_suffixes(&canonical.host) {
            let key = host_key(&suffix);
            let candidates = self.local_candidates(key, &lists, &hashes).await?;
            if candidates.is_empty() {
                continue;
            }
            debug!(%suffix, candidates = candidates.len(), "local prefix hit");

            let min_timestamp = now_secs().saturating_sub(self.config.cache_time.as_secs());
            let mut uncached: Vec<&AddChunk> = Vec::new();
            for candidate in &candidates {
                let cached = self
                    .store
                    .get_full_hashes(&candidate.list, candidate.chunknum, min_timestamp)
                    .await?;
                if cached.is_empty() {
                    uncached.push(candidate);
                } else if cached.iter().any(|c| hashes.contains(&c.hash)) {
                    push_unique(&mut matches, candidate.list.clone());
                }
            }

            if !uncached.is_empty() {
                for entry in self.fetch_full_hashes(&uncached).await? {
                    let confirms_candidate = uncached
                        .iter()
                        .any(|c| c.list == entry.list && c.chunknum == entry.chunknum);
                    if confirms_candidate && hashes.contains(&entry.hash) {
                        push_unique(&mut matches, entry.list);
                    }
                }
            }
        }

        Ok(matches)
    }

    /// Add-chunk candidates for one host key: prefix-filtered against the
    /// URL's hashes, then reduced by matching sub-chunk entries.
    async fn local_candidates(
        &self,
        host: u32,
        lists: &[String],
        hashes: &[FullHash],
    ) -> Result<Vec<AddChunk>> {
        let mut adds = self.store.get_add_chunks(host, lists).await?;
        adds.retain(|a| a.prefix.is_empty() || hashes.iter().any(|h| a.prefix.matches(h)));
        if adds.is_empty() {
            return Ok(adds);
        }

        let subs = self.store.get_sub_chunks(host, lists).await?;
        adds.retain(|a| {
            !subs
                .iter()
                .any(|s| s.list == a.list && s.add_chunknum == a.chunknum && s.prefix == a.prefix)
        });
        Ok(adds)
    }

    /// Fetch full hashes for the candidates' prefixes, store them, and
    /// return them. Failures are charged to each prefix's backoff counter
    /// and yield an empty result instead of an error.
    async fn fetch_full_hashes(&self, candidates: &[&AddChunk]) -> Result<Vec<CachedHash>> {
        let now = now_secs();

        let mut prefixes: Vec<[u8; GETHASH_PREFIX_LEN]> = Vec::new();
        for candidate in candidates {
            // The wire form is the stored prefix, or the big-endian host
            // key for host-wide entries.
            let bytes: [u8; GETHASH_PREFIX_LEN] = if candidate.prefix.is_empty() {
                candidate.host.to_be_bytes()
            } else {
                match candidate.prefix.as_bytes().get(..GETHASH_PREFIX_LEN) {
                    Some(slice) => match slice.try_into() {
                        Ok(bytes) => bytes,
                        Err(_) => continue,
                    },
                    None => continue,
                }
            };

            if prefixes.contains(&bytes) {
                continue;
            }
            if self.prefix_suppressed(&hex::encode(bytes), now).await {
                debug!(prefix = %hex::encode(bytes), "prefix in gethash backoff");
                continue;
            }
            prefixes.push(bytes);
        }

        if prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = format!(
            "{GETHASH_PREFIX_LEN}:{}\n",
            prefixes.len() * GETHASH_PREFIX_LEN
        )
        .into_bytes();
        for prefix in &prefixes {
            body.extend_from_slice(prefix);
        }

        let response = match self.api.gethash(body).await {
            Ok(response) if response.is_ok() && !response.body.is_empty() => response,
            Ok(response) => {
                debug!(status = response.status, "gethash returned no usable data");
                self.note_prefix_failures(&prefixes, now).await;
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!(error = %e, "gethash request failed");
                self.note_prefix_failures(&prefixes, now).await;
                return Ok(Vec::new());
            }
        };

        let blocks = match parse_gethash_response(&response.body) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(error = %e, "malformed gethash response");
                self.note_prefix_failures(&prefixes, now).await;
                return Ok(Vec::new());
            }
        };

        let entries: Vec<CachedHash> = blocks
            .into_iter()
            .flat_map(|block| {
                let list = block.list;
                let chunknum = block.chunknum;
                block.hashes.into_iter().map(move |hash| CachedHash {
                    list: list.clone(),
                    chunknum,
                    hash,
                })
            })
            .collect();
        self.store.add_full_hashes(&entries, now).await?;

        for prefix in &prefixes {
            if let Err(e) = self.state.clear_prefix_failure(&hex::encode(prefix)).await {
                error!(error = %e, "failed to clear prefix failure state");
            }
        }
        debug!(count = entries.len(), "cached fresh full hashes");
        Ok(entries)
    }

    /// Whether a prefix is inside its failure backoff window: three
    /// errors hold it for 30 minutes, four for an hour, five or more for
    /// two hours.
    async fn prefix_suppressed(&self, prefix_hex: &str, now: u64) -> bool {
        let Some(failure) = self.state.prefix_failure(prefix_hex).await else {
            return false;
        };
        let hold = match failure.errors {
            0..=2 => return false,
            3 => 30 * 60,
            4 => 60 * 60,
            _ => 120 * 60,
        };
        now < failure.timestamp + hold
    }

    /// Charge a failed fetch to every requested prefix. The first error
    /// is free; later ones only escalate when the previous error is more
    /// than five minutes old.
    async fn note_prefix_failures(&self, prefixes: &[[u8; GETHASH_PREFIX_LEN]], now: u64) {
        for prefix in prefixes {
            let prefix_hex = hex::encode(prefix);
            let prev = self
                .state
                .prefix_failure(&prefix_hex)
                .await
                .unwrap_or_default();

            let next = if prev.errors <= 1
                || now.saturating_sub(prev.timestamp) > PROMOTION_WINDOW_SECS
            {
                PrefixFailure {
                    errors: prev.errors + 1,
                    timestamp: now,
                }
            } else {
                prev
            };

            if let Err(e) = self.state.set_prefix_failure(&prefix_hex, &next).await {
                error!(error = %e, "failed to persist prefix failure state");
            }
        }
    }
}

fn push_unique(matches: &mut Vec<String>, list: String) {
    if !matches.contains(&list) {
        matches.push(list);
    }
}
