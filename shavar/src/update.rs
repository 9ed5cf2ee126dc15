//! The update engine
//!
//! One `update` call drives every requested list through a full protocol
//! round: report the locally held chunk ranges, parse the server's
//! directives in arrival order, fetch each redirect payload, and apply
//! the resulting chunks through storage. Each list persists exactly one
//! sync-state record per round: the success schedule, or a backoff.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, error, info, warn};

use shavar_api::mac::verify_mac;
use shavar_api::MacKeys;
use shavar_db::{AddChunk, SubChunk};
use shavar_proto::{parse_chunk_stream, parse_update_response, split_mac, Chunk, ChunkData, Directive};

use crate::error::Result;
use crate::state::ListState;
use crate::{now_secs, Shavar};

/// Wait after `e:pleaserekey` and `r:pleasereset`.
const SERVER_DIRECTIVE_WAIT: Duration = Duration::from_secs(10);

/// Base backoff once failures start doubling.
const BACKOFF_BASE_SECS: u64 = 30 * 60;

/// Backoff ceiling.
const BACKOFF_CAP_SECS: u64 = 480 * 60;

impl Shavar {
    pub(crate) async fn run_update(&self, lists: &[&str], forced: bool) -> Duration {
        // At most one update in flight across all lists.
        if self.in_update.fetch_add(1, Ordering::SeqCst) > 0 {
            self.in_update.fetch_sub(1, Ordering::SeqCst);
            debug!("update already in flight");
            return self.config.default_retry;
        }

        let waits = join_all(lists.iter().map(|list| self.update_list(list, forced))).await;
        self.in_update.fetch_sub(1, Ordering::SeqCst);

        waits.into_iter().min().unwrap_or(self.config.default_retry)
    }

    async fn update_list(&self, list: &str, forced: bool) -> Duration {
        let now = now_secs();
        let prev = self.state.list_state(list).await.unwrap_or_default();

        if !forced && prev.time + prev.wait > now {
            let remaining = prev.time + prev.wait - now;
            debug!(list, remaining, "list not due yet");
            return Duration::from_secs(remaining);
        }

        let keys = if self.config.mac {
            match self.ensure_mac_keys().await {
                Ok(keys) => Some(keys),
                Err(e) => {
                    warn!(list, error = %e, "could not obtain MAC keys");
                    return self.config.default_retry;
                }
            }
        } else {
            None
        };

        match self.sync_list(list, keys.as_ref(), &prev, now).await {
            Ok(wait) => wait,
            Err(e) => {
                warn!(list, error = %e, "update failed");
                self.fail_list(list, &prev, now).await
            }
        }
    }

    /// One protocol round for one list. Any error here means the round
    /// failed and the list backs off.
    async fn sync_list(
        &self,
        list: &str,
        keys: Option<&MacKeys>,
        prev: &ListState,
        now: u64,
    ) -> Result<Duration> {
        let (a_range, s_range) = self.store.get_regions(list).await?;
        let body = request_body(list, &a_range, &s_range, self.config.mac);
        debug!(list, body = body.trim_end(), "requesting deltas");

        let response = self
            .api
            .downloads(body, keys.map(|k| k.wrapped_key.as_str()))
            .await?;
        if !response.is_ok() {
            warn!(list, status = response.status, "downloads returned an error");
            return Ok(self.fail_list(list, prev, now).await);
        }

        let text = String::from_utf8_lossy(&response.body).into_owned();
        if text.trim().is_empty() {
            debug!(list, "empty update response");
            self.persist(list, now, self.config.default_retry.as_secs(), prev.errors)
                .await;
            return Ok(self.config.default_retry);
        }

        let directives = parse_update_response(&text)?;

        // Rekeying replaces the keys the MAC would be checked with, so it
        // is honored ahead of validation.
        if directives.contains(&Directive::Rekey) {
            info!(list, "server requested rekey");
            self.state.clear_mac_keys().await?;
            self.persist(list, now, SERVER_DIRECTIVE_WAIT.as_secs(), prev.errors)
                .await;
            return Ok(SERVER_DIRECTIVE_WAIT);
        }

        if let Some(keys) = keys {
            let (digest, payload) = split_mac(&text);
            let valid = digest
                .map(|d| verify_mac(&keys.client_key, payload.as_bytes(), &d))
                .unwrap_or(false);
            if !valid {
                warn!(list, "update response failed MAC validation");
                return Ok(self.fail_list(list, prev, now).await);
            }
        }

        let mut current_list = list.to_string();
        let mut next_wait = self.config.default_retry;
        let mut redirects: Vec<(String, Option<String>, String)> = Vec::new();

        for directive in directives {
            match directive {
                Directive::ListContext(name) => current_list = name,
                Directive::Next(seconds) => next_wait = Duration::from_secs(seconds),
                Directive::Redirect { url, mac } => {
                    redirects.push((url, mac, current_list.clone()));
                }
                Directive::DeleteAdd(chunknums) => {
                    self.store.delete_add_chunks(&current_list, &chunknums).await?;
                    self.store.delete_full_hashes(&current_list, &chunknums).await?;
                    debug!(list = %current_list, count = chunknums.len(), "deleted add chunks");
                }
                Directive::DeleteSub(chunknums) => {
                    self.store.delete_sub_chunks(&current_list, &chunknums).await?;
                    debug!(list = %current_list, count = chunknums.len(), "deleted sub chunks");
                }
                Directive::Reset => {
                    info!(list = %current_list, "server requested reset");
                    self.store.reset(&current_list).await?;
                    self.persist(list, now, SERVER_DIRECTIVE_WAIT.as_secs(), prev.errors)
                        .await;
                    return Ok(SERVER_DIRECTIVE_WAIT);
                }
                Directive::Mac(_) | Directive::Rekey => {}
            }
        }

        let mut added = 0usize;
        let mut subbed = 0usize;
        for (url, mac, context) in redirects {
            let response = self.api.fetch_redirect(&url).await?;
            if !response.is_ok() {
                warn!(list, %url, status = response.status, "redirect fetch failed");
                return Ok(self.fail_list(list, prev, now).await);
            }

            if let Some(keys) = keys {
                let valid = mac
                    .map(|d| verify_mac(&keys.client_key, &response.body, &d))
                    .unwrap_or(false);
                if !valid {
                    warn!(list, %url, "redirect payload failed MAC validation");
                    return Ok(self.fail_list(list, prev, now).await);
                }
            }

            let (adds, subs) = collect_entries(&context, parse_chunk_stream(&response.body)?);
            added += adds.len();
            subbed += subs.len();
            if !adds.is_empty() {
                self.store.add_chunks_a(&adds).await?;
            }
            if !subs.is_empty() {
                self.store.add_chunks_s(&subs).await?;
            }
        }

        info!(
            list,
            added,
            subbed,
            wait = next_wait.as_secs(),
            "update complete"
        );
        self.persist(list, now, next_wait.as_secs(), 0).await;
        Ok(next_wait)
    }

    async fn ensure_mac_keys(&self) -> Result<MacKeys> {
        if let Some(keys) = self.state.mac_keys().await {
            return Ok(keys);
        }
        let keys = self.api.newkey().await?;
        self.state.set_mac_keys(&keys).await?;
        info!("fetched new MAC keys");
        Ok(keys)
    }

    /// Record a failed round: bump the error counter and back off.
    async fn fail_list(&self, list: &str, prev: &ListState, now: u64) -> Duration {
        let errors = prev.errors + 1;
        let wait = backoff_secs(errors);
        warn!(list, errors, wait, "backing off after failed update");
        self.persist(list, now, wait, errors).await;
        Duration::from_secs(wait)
    }

    async fn persist(&self, list: &str, time: u64, wait: u64, errors: u32) {
        let state = ListState { time, wait, errors };
        if let Err(e) = self.state.set_list_state(list, &state).await {
            error!(list, error = %e, "failed to persist list state");
        }
    }
}

/// The request body for one list: `<list>;a:<a>:s:<s>[:mac]`, with empty
/// parts and their separators omitted.
fn request_body(list: &str, a_range: &str, s_range: &str, mac: bool) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if !a_range.is_empty() {
        parts.push(format!("a:{a_range}"));
    }
    if !s_range.is_empty() {
        parts.push(format!("s:{s_range}"));
    }
    if mac {
        parts.push("mac".to_string());
    }
    format!("{list};{}\n", parts.join(":"))
}

/// Flatten parsed chunks into storage rows for the list in context.
fn collect_entries(list: &str, chunks: Vec<Chunk>) -> (Vec<AddChunk>, Vec<SubChunk>) {
    let mut adds = Vec::new();
    let mut subs = Vec::new();

    for chunk in chunks {
        let Chunk { chunknum, data } = chunk;
        match data {
            ChunkData::Add(entries) => adds.extend(entries.into_iter().map(|e| AddChunk {
                list: list.to_string(),
                chunknum,
                host: e.host,
                prefix: e.prefix,
            })),
            ChunkData::Sub(entries) => subs.extend(entries.into_iter().map(|e| SubChunk {
                list: list.to_string(),
                chunknum,
                add_chunknum: e.add_chunknum,
                host: e.host,
                prefix: e.prefix,
            })),
        }
    }

    (adds, subs)
}

/// Backoff schedule: the first failure retries in a minute; from the
/// second on the wait doubles from 30 minutes with up to 100% jitter,
/// capped at 480 minutes.
fn backoff_secs(errors: u32) -> u64 {
    match errors {
        0 | 1 => 60,
        2..=5 => {
            let base = BACKOFF_BASE_SECS << (errors - 2);
            let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
            (((base as f64) * (1.0 + jitter)) as u64).min(BACKOFF_CAP_SECS)
        }
        _ => BACKOFF_CAP_SECS,
    }
}
