//! Persisted small-config state
//!
//! A hierarchical key-value document holding everything the engine must
//! remember between process runs: per-list poll schedules and error
//! counters under `updated/<list>`, the MAC key pair under `mac_keys`,
//! and per-prefix `gethash` failure counters under
//! `full_hash_errors/<hex_prefix>`.
//!
//! The document is JSON on disk and is rewritten on every mutation. A
//! missing or corrupt file is replaced by the empty skeleton rather than
//! reported as an error.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use shavar_api::MacKeys;

use crate::error::Result;

/// Per-list synchronization state, stored under `updated/<list>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListState {
    /// Unix time of the last update attempt.
    pub time: u64,

    /// Seconds to wait after `time` before polling again.
    pub wait: u64,

    /// Consecutive failures since the last successful update.
    pub errors: u32,
}

/// Per-prefix `gethash` failure state, stored under
/// `full_hash_errors/<hex_prefix>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixFailure {
    /// Consecutive failed fetches for this prefix.
    pub errors: u32,

    /// Unix time of the most recent counted failure.
    pub timestamp: u64,
}

/// The small-config store: a JSON document with `/`-separated paths,
/// persisted on every mutation.
pub struct StateStore {
    path: Option<PathBuf>,
    doc: Mutex<Value>,
}

impl StateStore {
    /// Open the store, reading `path` when given. Corrupt or missing
    /// content is replaced with the empty skeleton.
    pub fn open(path: Option<PathBuf>) -> Self {
        let doc = match &path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(doc) if doc.is_object() => doc,
                    _ => {
                        warn!(path = %p.display(), "state file corrupt, starting fresh");
                        default_doc()
                    }
                },
                Err(_) => default_doc(),
            },
            None => default_doc(),
        };

        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    /// Read the value at a `/`-separated path.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let doc = self.doc.lock().await;
        let mut node = &*doc;
        for segment in path.split('/') {
            node = node.get(segment)?;
        }
        Some(node.clone())
    }

    /// Write a value at a `/`-separated path, creating intermediate
    /// objects, and persist the document.
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut doc = self.doc.lock().await;

        let mut segments: Vec<&str> = path.split('/').collect();
        let leaf = segments.pop().unwrap_or(path);
        let mut node = &mut *doc;
        for segment in segments {
            node = descend(node, segment);
        }
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(leaf.to_string(), value);
        }

        self.persist(&doc).await
    }

    /// Remove the value at a `/`-separated path and persist. Removing a
    /// missing path is a no-op.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let mut doc = self.doc.lock().await;

        let mut segments: Vec<&str> = path.split('/').collect();
        let leaf = segments.pop().unwrap_or(path);
        let mut node = &mut *doc;
        for segment in segments {
            match node.get_mut(segment) {
                Some(child) => node = child,
                None => return Ok(()),
            }
        }
        if let Value::Object(map) = node {
            map.remove(leaf);
        }

        self.persist(&doc).await
    }

    async fn persist(&self, doc: &Value) -> Result<()> {
        if let Some(path) = &self.path {
            let text = serde_json::to_string_pretty(doc)?;
            tokio::fs::write(path, text).await?;
        }
        Ok(())
    }

    /// Sync state for one list.
    pub async fn list_state(&self, list: &str) -> Option<ListState> {
        let value = self.get(&format!("updated/{list}")).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn set_list_state(&self, list: &str, state: &ListState) -> Result<()> {
        self.set(&format!("updated/{list}"), serde_json::to_value(state)?)
            .await
    }

    /// The stored MAC key pair, decoded, or `None` when absent or empty.
    ///
    /// The file keeps the client key in its transport (base64) form so
    /// the document stays plain text; consumers always see the decoded
    /// bytes.
    pub async fn mac_keys(&self) -> Option<MacKeys> {
        let value = self.get("mac_keys").await?;
        let client_key = value.get("client_key")?.as_str()?;
        let wrapped_key = value.get("wrapped_key")?.as_str()?;
        if client_key.is_empty() || wrapped_key.is_empty() {
            return None;
        }
        let client_key = BASE64_STANDARD.decode(client_key).ok()?;
        Some(MacKeys {
            client_key,
            wrapped_key: wrapped_key.to_string(),
        })
    }

    pub async fn set_mac_keys(&self, keys: &MacKeys) -> Result<()> {
        self.set(
            "mac_keys",
            json!({
                "client_key": BASE64_STANDARD.encode(&keys.client_key),
                "wrapped_key": keys.wrapped_key,
            }),
        )
        .await
    }

    /// Drop the MAC keys, as the `e:pleaserekey` directive requires.
    pub async fn clear_mac_keys(&self) -> Result<()> {
        self.set("mac_keys", json!({"client_key": "", "wrapped_key": ""}))
            .await
    }

    /// Failure state for one `gethash` prefix.
    pub async fn prefix_failure(&self, prefix_hex: &str) -> Option<PrefixFailure> {
        let value = self.get(&format!("full_hash_errors/{prefix_hex}")).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn set_prefix_failure(
        &self,
        prefix_hex: &str,
        failure: &PrefixFailure,
    ) -> Result<()> {
        self.set(
            &format!("full_hash_errors/{prefix_hex}"),
            serde_json::to_value(failure)?,
        )
        .await
    }

    pub async fn clear_prefix_failure(&self, prefix_hex: &str) -> Result<()> {
        self.delete(&format!("full_hash_errors/{prefix_hex}")).await
    }
}

fn default_doc() -> Value {
    json!({
        "updated": {},
        "mac_keys": {"client_key": "", "wrapped_key": ""},
        "full_hash_errors": {},
    })
}

/// Step into `segment`, creating an object node when needed.
fn descend<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    match node {
        Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
        _ => unreachable!("node was just coerced to an object"),
    }
}
