#![allow(dead_code)]

//! Shared test fixtures: a scripted HTTP transport standing in for the
//! Safe Browsing servers, and helpers for building chunk payloads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use shavar::shavar_api::{ApiError, HttpResponse, HttpTransport};
use shavar::{Config, MemoryStore, Shavar};

/// Transport that answers from a fixed script. Routes match on a URL
/// substring; unmatched URLs fail the request, which doubles as a "no
/// network call expected" assertion.
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, u16, Vec<u8>)>>,
    requests: Mutex<Vec<(String, Vec<u8>)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        })
    }

    pub fn route(&self, fragment: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap()
            .push((fragment.to_string(), status, body.into()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every request seen, in order: URL plus POST body (empty for GET).
    pub fn requests(&self) -> Vec<(String, Vec<u8>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_matching(&self, fragment: &str) -> Vec<(String, Vec<u8>)> {
        self.requests()
            .into_iter()
            .filter(|(url, _)| url.contains(fragment))
            .collect()
    }

    fn serve(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, ApiError> {
        self.requests.lock().unwrap().push((url.to_string(), body));
        let routes = self.routes.lock().unwrap();
        for (fragment, status, body) in routes.iter() {
            if url.contains(fragment.as_str()) {
                return Ok(HttpResponse {
                    status: *status,
                    body: Bytes::copy_from_slice(body),
                });
            }
        }
        Err(ApiError::Transport(format!("no scripted response for {url}")))
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, ApiError> {
        self.maybe_delay().await;
        self.serve(url, Vec::new())
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, ApiError> {
        self.maybe_delay().await;
        self.serve(url, body)
    }
}

pub fn test_config() -> Config {
    Config {
        api_key: "testkey".to_string(),
        server: "https://sb.test/".to_string(),
        mac_server: "https://mac.test/".to_string(),
        ..Default::default()
    }
}

pub fn client(transport: Arc<ScriptedTransport>) -> Shavar {
    client_with(transport, test_config())
}

pub fn client_with(transport: Arc<ScriptedTransport>, config: Config) -> Shavar {
    Shavar::with_transport(config, Arc::new(MemoryStore::new()), transport).unwrap()
}

/// A binary `a:` block with one prefixed entry per `(host, prefix)` pair.
pub fn add_chunk_block(chunknum: u32, entries: &[(u32, [u8; 4])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (host, prefix) in entries {
        body.extend_from_slice(&host.to_le_bytes());
        body.push(1);
        body.extend_from_slice(prefix);
    }
    frame_block('a', chunknum, &body)
}

/// A binary `s:` block with one prefixed retraction per entry.
pub fn sub_chunk_block(chunknum: u32, entries: &[(u32, u32, [u8; 4])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (host, add_chunknum, prefix) in entries {
        body.extend_from_slice(&host.to_le_bytes());
        body.push(1);
        body.extend_from_slice(&add_chunknum.to_be_bytes());
        body.extend_from_slice(prefix);
    }
    frame_block('s', chunknum, &body)
}

fn frame_block(kind: char, chunknum: u32, body: &[u8]) -> Vec<u8> {
    let mut block = format!("{kind}:{chunknum}:4:{}\n", body.len()).into_bytes();
    block.extend_from_slice(body);
    block
}

pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn four_bytes(bytes: &[u8]) -> [u8; 4] {
    bytes[..4].try_into().unwrap()
}
