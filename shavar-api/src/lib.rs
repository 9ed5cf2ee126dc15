//! HTTP client for the Safe Browsing v2 protocol servers
//!
//! The engine talks to three endpoints: `downloads` for chunk deltas,
//! `gethash` for full-hash confirmation, and `newkey` on the MAC server
//! for per-client keys. Redirect URLs delivered inside update responses
//! are fetched over HTTPS.
//!
//! Transport is a trait so the engine can be driven by a scripted server
//! in tests; [`ReqwestTransport`] is the production implementation.

pub mod mac;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// Error type for API operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP client failure: connect, timeout, TLS.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure reported by a non-reqwest transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The `newkey` response did not follow its grammar.
    #[error("malformed key response: {0}")]
    KeyFormat(String),

    /// Client construction failed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// A transport-level HTTP response. Status classification is left to the
/// engine; only transport failures are errors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Scoped GET/POST with timeout, TLS verification, and a fixed
/// `User-Agent`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse>;
}

/// Production transport backed by `reqwest`. Certificate verification is
/// on by default and stays on.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true)
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(url, status, len = body.len(), "GET");
        Ok(HttpResponse { status, body })
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse> {
        let response = self.client.post(url).body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(url, status, len = body.len(), "POST");
        Ok(HttpResponse { status, body })
    }
}

/// MAC keys issued by the `newkey` endpoint.
///
/// The client key arrives base64-encoded and is used decoded; the wrapped
/// key is opaque and echoed back verbatim as `wrkey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacKeys {
    pub client_key: Vec<u8>,
    pub wrapped_key: String,
}

/// Client for the v2 endpoints, generic over the transport.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    server: String,
    mac_server: String,
    api_key: String,
    app_version: String,
    proto_version: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        server: String,
        mac_server: String,
        api_key: String,
        app_version: String,
        proto_version: String,
    ) -> Self {
        Self {
            transport,
            server,
            mac_server,
            api_key,
            app_version,
            proto_version,
        }
    }

    fn endpoint(&self, base: &str, name: &str) -> String {
        format!(
            "{base}{name}?client=api&apikey={}&appver={}&pver={}",
            self.api_key, self.app_version, self.proto_version
        )
    }

    /// POST the per-list chunk-range request to `downloads`.
    pub async fn downloads(&self, body: String, wrapped_key: Option<&str>) -> Result<HttpResponse> {
        let mut url = self.endpoint(&self.server, "downloads");
        if let Some(key) = wrapped_key {
            url.push_str("&wrkey=");
            url.push_str(key);
        }
        self.transport.post(&url, body.into_bytes()).await
    }

    /// POST a prefix batch to `gethash`.
    pub async fn gethash(&self, body: Vec<u8>) -> Result<HttpResponse> {
        let url = self.endpoint(&self.server, "gethash");
        self.transport.post(&url, body).await
    }

    /// Fetch fresh MAC keys from the MAC server.
    pub async fn newkey(&self) -> Result<MacKeys> {
        let url = self.endpoint(&self.mac_server, "newkey");
        let response = self.transport.get(&url).await?;
        if !response.is_ok() {
            return Err(ApiError::KeyFormat(format!(
                "newkey returned status {}",
                response.status
            )));
        }
        let body = std::str::from_utf8(&response.body)
            .map_err(|_| ApiError::KeyFormat("newkey body is not UTF-8".to_string()))?;
        parse_newkey(body)
    }

    /// Fetch a redirect URL from an update response. Redirect URLs arrive
    /// schemeless and are always fetched over HTTPS.
    pub async fn fetch_redirect(&self, url: &str) -> Result<HttpResponse> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };
        self.transport.get(&url).await
    }
}

/// Parse a `newkey` response body:
/// `clientkey:<n>:<base64>\nwrappedkey:<m>:<opaque>\n`.
pub fn parse_newkey(body: &str) -> Result<MacKeys> {
    let mut client_key = None;
    let mut wrapped_key = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ':');
        let name = fields.next().unwrap_or_default();
        let length: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| ApiError::KeyFormat(format!("bad length in {line:?}")))?;
        let value = fields
            .next()
            .ok_or_else(|| ApiError::KeyFormat(format!("missing value in {line:?}")))?;
        if value.len() != length {
            return Err(ApiError::KeyFormat(format!(
                "length mismatch in {name}: declared {length}, got {}",
                value.len()
            )));
        }

        match name {
            "clientkey" => {
                let decoded = BASE64_STANDARD
                    .decode(value)
                    .map_err(|e| ApiError::KeyFormat(format!("bad client key base64: {e}")))?;
                client_key = Some(decoded);
            }
            "wrappedkey" => wrapped_key = Some(value.to_string()),
            other => {
                return Err(ApiError::KeyFormat(format!("unknown key line {other:?}")));
            }
        }
    }

    match (client_key, wrapped_key) {
        (Some(client_key), Some(wrapped_key)) => Ok(MacKeys {
            client_key,
            wrapped_key,
        }),
        _ => Err(ApiError::KeyFormat(
            "response missing clientkey or wrappedkey".to_string(),
        )),
    }
}
