//! Wire formats for the Safe Browsing v2 protocol
//!
//! Three formats live here: the line-oriented text framing of update
//! responses, the binary `a:`/`s:` chunk payloads delivered through
//! redirect URLs, and the `gethash` full-hash response. Chunk-range
//! strings (`1-3,5,7-11`) are shared between the update request builder
//! and the storage layer.

pub mod chunk;
pub mod fullhash;
pub mod ranges;
pub mod update;

pub use chunk::{parse_chunk_stream, AddEntry, Chunk, ChunkData, SubEntry};
pub use fullhash::{parse_gethash_response, FullHashBlock};
pub use ranges::{format_ranges, parse_ranges};
pub use update::{parse_update_response, split_mac, Directive};

use thiserror::Error;

/// Error type for wire-format parsing.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A chunk or gethash block header did not follow its grammar.
    #[error("malformed header: {0}")]
    Header(String),

    /// A payload ended before the bytes its header promised.
    #[error("truncated payload: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },

    /// A chunk-range string did not follow its grammar.
    #[error("malformed chunk range: {0}")]
    Range(String),

    /// An update-response directive did not follow its grammar.
    #[error("malformed directive: {0}")]
    Directive(String),
}

/// Result type for wire-format parsing.
pub type Result<T> = std::result::Result<T, ProtoError>;
