//! Update-response text framing
//!
//! An update response is a sequence of whitespace-separated directives of
//! the form `<keyword>:<value>`. Directive order matters: `i:` switches
//! the list context for everything that follows, and deletes and
//! redirects must be consumed in arrival order, so parsing yields a flat
//! directive list rather than a digest struct.

use tracing::debug;

use crate::{parse_ranges, ProtoError, Result};

/// One directive from an update response, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `n:<seconds>`: delay before the next poll.
    Next(u64),

    /// `i:<list>`: subsequent directives apply to this list.
    ListContext(String),

    /// `u:<url>[,<hmac>]`: redirect URL holding chunk data, with the
    /// per-payload HMAC when MACs are in use.
    Redirect { url: String, mac: Option<String> },

    /// `ad:<range>`: delete these add-chunks (and their full hashes).
    DeleteAdd(Vec<u32>),

    /// `sd:<range>`: delete these sub-chunks.
    DeleteSub(Vec<u32>),

    /// `m:<digest>`: HMAC over the rest of the response.
    Mac(String),

    /// `e:pleaserekey`: discard MAC keys and retry shortly.
    Rekey,

    /// `r:pleasereset`: wipe the current list and retry shortly.
    Reset,
}

/// Parse an update response body into its directives.
///
/// Unknown keywords are skipped for forward compatibility; known keywords
/// with malformed values are errors.
pub fn parse_update_response(body: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();

    for token in body.split_whitespace() {
        let (keyword, value) = token
            .split_once(':')
            .ok_or_else(|| ProtoError::Directive(format!("missing separator in {token:?}")))?;

        match keyword {
            "n" => {
                let seconds = value.parse::<u64>().map_err(|_| {
                    ProtoError::Directive(format!("bad next-poll delay {value:?}"))
                })?;
                directives.push(Directive::Next(seconds));
            }
            "i" => {
                if value.is_empty() {
                    return Err(ProtoError::Directive("empty list name".to_string()));
                }
                directives.push(Directive::ListContext(value.to_string()));
            }
            "u" => {
                let (url, mac) = match value.split_once(',') {
                    Some((url, mac)) => (url, Some(mac.to_string())),
                    None => (value, None),
                };
                if url.is_empty() {
                    return Err(ProtoError::Directive("empty redirect URL".to_string()));
                }
                directives.push(Directive::Redirect {
                    url: url.to_string(),
                    mac,
                });
            }
            "ad" => directives.push(Directive::DeleteAdd(parse_ranges(value)?)),
            "sd" => directives.push(Directive::DeleteSub(parse_ranges(value)?)),
            "m" => directives.push(Directive::Mac(value.to_string())),
            "e" if value == "pleaserekey" => directives.push(Directive::Rekey),
            "r" if value == "pleasereset" => directives.push(Directive::Reset),
            other => {
                debug!(keyword = other, "skipping unknown update directive");
            }
        }
    }

    Ok(directives)
}

/// Separate the `m:` line from the rest of the response.
///
/// Returns the digest (when present) and the body with that whole line
/// removed, which is exactly what the digest was computed over.
pub fn split_mac(body: &str) -> (Option<String>, String) {
    let line_start = if body.starts_with("m:") {
        Some(0)
    } else {
        body.find("\nm:").map(|pos| pos + 1)
    };

    let Some(start) = line_start else {
        return (None, body.to_string());
    };

    let line_end = body[start..]
        .find('\n')
        .map(|pos| start + pos + 1)
        .unwrap_or(body.len());
    let digest = body[start + 2..line_end].trim_end().to_string();

    let mut rest = String::with_capacity(body.len() - (line_end - start));
    rest.push_str(&body[..start]);
    rest.push_str(&body[line_end..]);
    (Some(digest), rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_response() {
        let body = "n:1800\ni:goog-malware-shavar\nu:cache.google.com/first,HMAC1\nu:cache.google.com/second\nad:1-5,9\nsd:3\n";
        let directives = parse_update_response(body).unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::Next(1800),
                Directive::ListContext("goog-malware-shavar".to_string()),
                Directive::Redirect {
                    url: "cache.google.com/first".to_string(),
                    mac: Some("HMAC1".to_string()),
                },
                Directive::Redirect {
                    url: "cache.google.com/second".to_string(),
                    mac: None,
                },
                Directive::DeleteAdd(vec![1, 2, 3, 4, 5, 9]),
                Directive::DeleteSub(vec![3]),
            ]
        );
    }

    #[test]
    fn parses_rekey_and_reset() {
        let directives = parse_update_response("e:pleaserekey\n").unwrap();
        assert_eq!(directives, vec![Directive::Rekey]);

        let directives = parse_update_response("i:goog-phish-shavar\nr:pleasereset\n").unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::ListContext("goog-phish-shavar".to_string()),
                Directive::Reset,
            ]
        );
    }

    #[test]
    fn skips_unknown_directives() {
        let directives = parse_update_response("x:whatever\nn:300\n").unwrap();
        assert_eq!(directives, vec![Directive::Next(300)]);
    }

    #[test]
    fn rejects_malformed_known_directives() {
        assert!(parse_update_response("n:soon\n").is_err());
        assert!(parse_update_response("ad:5-3\n").is_err());
        assert!(parse_update_response("plain-token\n").is_err());
    }

    #[test]
    fn split_mac_removes_the_leading_line() {
        let (digest, rest) = split_mac("m:abc123=\nn:1800\ni:list\n");
        assert_eq!(digest.as_deref(), Some("abc123="));
        assert_eq!(rest, "n:1800\ni:list\n");
    }

    #[test]
    fn split_mac_removes_an_interior_line() {
        let (digest, rest) = split_mac("n:1800\nm:abc123=\ni:list\n");
        assert_eq!(digest.as_deref(), Some("abc123="));
        assert_eq!(rest, "n:1800\ni:list\n");
    }

    #[test]
    fn split_mac_without_mac_is_identity() {
        let (digest, rest) = split_mac("n:1800\n");
        assert!(digest.is_none());
        assert_eq!(rest, "n:1800\n");
    }
}
