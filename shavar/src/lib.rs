//! # Safe Browsing v2 client engine
//!
//! This crate maintains a local replica of Safe Browsing v2 threat lists
//! ("shavar" lists such as `goog-malware-shavar`) by polling the update
//! protocol for binary chunk deltas, and answers URL queries against the
//! local index with optional full-hash confirmation against the service.
//!
//! ## Features
//!
//! - Asynchronous engine on tokio; a caller-side scheduler drives polls
//! - Pluggable storage through the [`shavar_db::Store`] trait
//! - Full canonicalization and host/path enumeration per the protocol
//! - Optional HMAC-SHA1 response authentication (MAC)
//! - Exponential backoff on update failures, per-prefix backoff on
//!   `gethash` failures
//!
//! ## Example
//!
//! ```rust,no_run
//! use shavar::{Config, Shavar};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         api_key: "your-api-key".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let sb = Shavar::new(config)?;
//!     let lists = ["goog-malware-shavar", "goog-phish-shavar"];
//!
//!     // Pull chunk deltas; the result says when to poll next.
//!     let wait = sb.update(&lists).await;
//!     println!("next update due in {wait:?}");
//!
//!     let matches = sb.lookup(&lists, "http://example.com/suspicious").await?;
//!     if matches.is_empty() {
//!         println!("URL is not on any list");
//!     } else {
//!         println!("URL flagged by: {}", matches.join(", "));
//!     }
//!     Ok(())
//! }
//! ```

// Re-export crates from the workspace
pub use shavar_api;
pub use shavar_db;
pub use shavar_hash;
pub use shavar_proto;
pub use shavar_url;

pub mod error;
pub mod state;

mod lookup;
mod update;

use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use crate::error::{Error, Result};
pub use crate::state::{ListState, PrefixFailure, StateStore};
pub use shavar_api::{ApiClient, HttpTransport, MacKeys, ReqwestTransport};
pub use shavar_db::{MemoryStore, Store};

/// Default update server base URL.
pub const DEFAULT_SERVER_URL: &str = "https://safebrowsing.clients.google.com/safebrowsing/";

/// Default MAC key server base URL.
pub const DEFAULT_MAC_SERVER_URL: &str = "https://sb-ssl.google.com/safebrowsing/";

/// Protocol version spoken by this engine.
pub const DEFAULT_PROTO_VERSION: &str = "2.2";

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default freshness window for cached full hashes.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(2700);

/// Default wait after failures that carry no better schedule.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(30);

/// Configuration for the client engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Update server base URL (`downloads`, `gethash`).
    pub server: String,

    /// MAC key server base URL (`newkey`).
    pub mac_server: String,

    /// API key identifying this client to the service.
    pub api_key: String,

    /// Application version reported as `appver`.
    pub app_version: String,

    /// Protocol version reported as `pver`.
    pub proto_version: String,

    /// Enable HMAC validation of server responses.
    pub mac: bool,

    /// HTTP request timeout.
    pub http_timeout: Duration,

    /// `User-Agent` header for all requests.
    pub user_agent: String,

    /// Freshness window for cached full hashes.
    pub cache_time: Duration,

    /// Fallback wait on failures with no protocol-mandated schedule.
    pub default_retry: Duration,

    /// Path of the persisted state file. `None` keeps state in memory
    /// only.
    pub data_filepath: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER_URL.to_string(),
            mac_server: DEFAULT_MAC_SERVER_URL.to_string(),
            api_key: String::new(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            proto_version: DEFAULT_PROTO_VERSION.to_string(),
            mac: false,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            cache_time: DEFAULT_CACHE_TIME,
            default_retry: DEFAULT_RETRY,
            data_filepath: None,
        }
    }
}

/// The Safe Browsing v2 client.
///
/// Holds the storage handle, the persisted small-config state, and the
/// API client. [`Shavar::update`] synchronizes the local replica;
/// [`Shavar::lookup`] queries it.
pub struct Shavar {
    config: Config,
    api: ApiClient,
    store: Arc<dyn Store>,
    state: StateStore,
    in_update: AtomicU32,
}

impl Shavar {
    /// Create a client over the in-memory store and the reqwest
    /// transport.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a client over a custom storage backend.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.http_timeout,
            &config.user_agent,
        )?);
        Self::with_transport(config, store, transport)
    }

    /// Create a client over custom storage and transport. Tests script
    /// the transport to play the server.
    pub fn with_transport(
        mut config: Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Configuration("API key is required".to_string()));
        }
        if config.server.is_empty() {
            return Err(Error::Configuration("server URL is required".to_string()));
        }
        for base in [&mut config.server, &mut config.mac_server] {
            if !base.ends_with('/') {
                base.push('/');
            }
        }

        let api = ApiClient::new(
            transport,
            config.server.clone(),
            config.mac_server.clone(),
            config.api_key.clone(),
            config.app_version.clone(),
            config.proto_version.clone(),
        );
        let state = StateStore::open(config.data_filepath.clone());

        Ok(Self {
            config,
            api,
            store,
            state,
            in_update: AtomicU32::new(0),
        })
    }

    /// Synchronize the given lists if they are due. Returns the minimum
    /// wait before the caller should invoke `update` again.
    ///
    /// Failures never surface as errors; they become backoff waits in the
    /// returned schedule.
    pub async fn update(&self, lists: &[&str]) -> Duration {
        self.run_update(lists, false).await
    }

    /// Synchronize the given lists regardless of their schedules.
    pub async fn update_forced(&self, lists: &[&str]) -> Duration {
        self.run_update(lists, true).await
    }

    /// The storage handle, shared with the engine.
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// The persisted small-config state.
    pub fn state(&self) -> &StateStore {
        &self.state
    }
}

impl std::fmt::Debug for Shavar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shavar")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Seconds since the Unix epoch, saturating at zero on clock trouble.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
