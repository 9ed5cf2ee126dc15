//! Error types for the client engine

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client engine.
///
/// Update failures never reach callers as errors; the update engine
/// converts them into backoff waits. Lookups fail closed on bad URLs and
/// network trouble, so only configuration and storage problems surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP or endpoint failure.
    #[error("API error: {0}")]
    Api(#[from] shavar_api::ApiError),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Store(#[from] shavar_db::StoreError),

    /// Wire-format parse failure.
    #[error("protocol error: {0}")]
    Proto(#[from] shavar_proto::ProtoError),

    /// URL canonicalization failure.
    #[error("URL error: {0}")]
    Url(#[from] shavar_url::UrlError),

    /// State-file serialization failure.
    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// State-file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
