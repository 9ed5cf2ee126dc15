//! `gethash` response framing
//!
//! The response repeats blocks of `"<list>:<chunknum>:<length>\n"`
//! followed by `length` bytes of concatenated 32-byte hashes. The chunk
//! number ties each hash back to the add chunk whose prefix triggered the
//! request.

use bytes::Buf;

use shavar_hash::{FullHash, FULL_HASH_LEN};

use crate::{ProtoError, Result};

/// Longest accepted block header line.
const MAX_HEADER_LEN: usize = 256;

/// One block of full hashes for a `(list, chunknum)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHashBlock {
    pub list: String,
    pub chunknum: u32,
    pub hashes: Vec<FullHash>,
}

/// Parse a `gethash` response body.
pub fn parse_gethash_response(payload: &[u8]) -> Result<Vec<FullHashBlock>> {
    let mut cursor = payload;
    let mut blocks = Vec::new();

    while !cursor.is_empty() {
        let line_end = cursor
            .iter()
            .take(MAX_HEADER_LEN)
            .position(|b| *b == b'\n')
            .ok_or_else(|| ProtoError::Header("unterminated gethash header".to_string()))?;
        let line = std::str::from_utf8(&cursor[..line_end])
            .map_err(|_| ProtoError::Header("non-ASCII gethash header".to_string()))?;

        let mut fields = line.splitn(3, ':');
        let list = fields
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProtoError::Header("missing list name".to_string()))?
            .to_string();
        let chunknum = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(|| ProtoError::Header(format!("bad chunk number in {line:?}")))?;
        let length = fields
            .next()
            .and_then(|f| f.parse::<usize>().ok())
            .ok_or_else(|| ProtoError::Header(format!("bad length in {line:?}")))?;
        cursor.advance(line_end + 1);

        if length % FULL_HASH_LEN != 0 {
            return Err(ProtoError::Header(format!(
                "gethash block length {length} is not a multiple of {FULL_HASH_LEN}"
            )));
        }
        if cursor.remaining() < length {
            return Err(ProtoError::Truncated {
                needed: length,
                remaining: cursor.remaining(),
            });
        }

        let mut hashes = Vec::with_capacity(length / FULL_HASH_LEN);
        for offset in (0..length).step_by(FULL_HASH_LEN) {
            let bytes = &cursor[offset..offset + FULL_HASH_LEN];
            hashes.push(FullHash::from_bytes(bytes).map_err(|e| {
                ProtoError::Header(format!("bad hash bytes: {e}"))
            })?);
        }
        cursor.advance(length);

        blocks.push(FullHashBlock {
            list,
            chunknum,
            hashes,
        });
    }

    Ok(blocks)
}
