//! Binary chunk payloads
//!
//! A redirect URL returns concatenated blocks, each framed by a text
//! header `a:<chunknum>:<hash_length>:<chunk_length>\n` (or `s:` for sub
//! chunks) followed by `chunk_length` bytes of entries.
//!
//! Add bodies repeat `host(4, LE) | count(1) | count × prefix`; a count of
//! zero stands for one entry whose empty prefix covers every path under
//! the host. Sub bodies carry the add-chunk number being retracted: after
//! `host | count`, a zero count is followed by one `add_chunknum(4, BE)`,
//! otherwise `count` pairs of `add_chunknum | prefix` follow.

use bytes::Buf;

use shavar_hash::Prefix;

use crate::{ProtoError, Result};

/// Longest accepted header line; anything beyond this is garbage.
const MAX_HEADER_LEN: usize = 64;

/// One `{host, prefix}` assertion from an add chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddEntry {
    pub host: u32,
    pub prefix: Prefix,
}

/// One retraction from a sub chunk, naming the add chunk it cancels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubEntry {
    pub host: u32,
    pub add_chunknum: u32,
    pub prefix: Prefix,
}

/// Entries of a single chunk, by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkData {
    Add(Vec<AddEntry>),
    Sub(Vec<SubEntry>),
}

/// A parsed chunk: its number and its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunknum: u32,
    pub data: ChunkData,
}

/// Parse a full redirect payload into its chunks.
pub fn parse_chunk_stream(payload: &[u8]) -> Result<Vec<Chunk>> {
    let mut cursor = payload;
    let mut chunks = Vec::new();

    while !cursor.is_empty() {
        let (kind, chunknum, hash_len, body_len) = parse_header(&mut cursor)?;
        if cursor.remaining() < body_len {
            return Err(ProtoError::Truncated {
                needed: body_len,
                remaining: cursor.remaining(),
            });
        }

        let body = &cursor[..body_len];
        let data = match kind {
            b'a' => ChunkData::Add(parse_add_body(body, hash_len)?),
            b's' => ChunkData::Sub(parse_sub_body(body, hash_len)?),
            _ => unreachable!("parse_header only admits a/s"),
        };
        cursor.advance(body_len);

        chunks.push(Chunk { chunknum, data });
    }

    Ok(chunks)
}

/// Read `a:<chunknum>:<hash_length>:<chunk_length>\n` off the front of the
/// cursor.
fn parse_header(cursor: &mut &[u8]) -> Result<(u8, u32, usize, usize)> {
    let line_end = cursor
        .iter()
        .take(MAX_HEADER_LEN)
        .position(|b| *b == b'\n')
        .ok_or_else(|| ProtoError::Header("unterminated chunk header".to_string()))?;

    let line = std::str::from_utf8(&cursor[..line_end])
        .map_err(|_| ProtoError::Header("non-ASCII chunk header".to_string()))?;

    let mut fields = line.split(':');
    let kind = match fields.next() {
        Some("a") => b'a',
        Some("s") => b's',
        other => {
            return Err(ProtoError::Header(format!("unknown chunk kind {other:?}")));
        }
    };

    let chunknum = header_field::<u32>(fields.next(), "chunk number")?;
    let hash_len = header_field::<usize>(fields.next(), "hash length")?;
    let body_len = header_field::<usize>(fields.next(), "chunk length")?;
    if fields.next().is_some() {
        return Err(ProtoError::Header(format!("trailing header fields in {line:?}")));
    }
    if hash_len == 0 || hash_len > 32 {
        return Err(ProtoError::Header(format!("hash length {hash_len} out of range")));
    }

    cursor.advance(line_end + 1);
    Ok((kind, chunknum, hash_len, body_len))
}

fn header_field<T: std::str::FromStr>(field: Option<&str>, what: &str) -> Result<T> {
    field
        .and_then(|f| f.parse::<T>().ok())
        .ok_or_else(|| ProtoError::Header(format!("bad {what} in chunk header")))
}

fn parse_add_body(body: &[u8], hash_len: usize) -> Result<Vec<AddEntry>> {
    // A chunk with no entry data still marks its number as present.
    if body.is_empty() {
        return Ok(vec![AddEntry {
            host: 0,
            prefix: Prefix::empty(),
        }]);
    }

    let mut cursor = body;
    let mut entries = Vec::new();

    // A tail shorter than host+count cannot start another entry; skip it.
    while cursor.remaining() >= 5 {
        let host = cursor.get_u32_le();
        let count = cursor.get_u8() as usize;

        if count == 0 {
            entries.push(AddEntry {
                host,
                prefix: Prefix::empty(),
            });
            continue;
        }

        if cursor.remaining() < count * hash_len {
            return Err(ProtoError::Truncated {
                needed: count * hash_len,
                remaining: cursor.remaining(),
            });
        }
        for _ in 0..count {
            entries.push(AddEntry {
                host,
                prefix: Prefix::from_bytes(&cursor[..hash_len]),
            });
            cursor.advance(hash_len);
        }
    }

    Ok(entries)
}

fn parse_sub_body(body: &[u8], hash_len: usize) -> Result<Vec<SubEntry>> {
    if body.is_empty() {
        return Ok(vec![SubEntry {
            host: 0,
            add_chunknum: 0,
            prefix: Prefix::empty(),
        }]);
    }

    let mut cursor = body;
    let mut entries = Vec::new();

    while cursor.remaining() >= 5 {
        let host = cursor.get_u32_le();
        let count = cursor.get_u8() as usize;

        if count == 0 {
            if cursor.remaining() < 4 {
                return Err(ProtoError::Truncated {
                    needed: 4,
                    remaining: cursor.remaining(),
                });
            }
            entries.push(SubEntry {
                host,
                add_chunknum: cursor.get_u32(),
                prefix: Prefix::empty(),
            });
            continue;
        }

        let needed = count * (4 + hash_len);
        if cursor.remaining() < needed {
            return Err(ProtoError::Truncated {
                needed,
                remaining: cursor.remaining(),
            });
        }
        for _ in 0..count {
            let add_chunknum = cursor.get_u32();
            entries.push(SubEntry {
                host,
                add_chunknum,
                prefix: Prefix::from_bytes(&cursor[..hash_len]),
            });
            cursor.advance(hash_len);
        }
    }

    Ok(entries)
}
