//! URL canonicalization for the Safe Browsing v2 protocol
//!
//! Hosts and paths are reduced to the canonical forms the protocol hashes,
//! and expanded into the host-suffix and host/path lookup expressions the
//! lookup engine tests against the local chunk index.
//!
//! Canonicalization here is deliberately byte-oriented: percent-unescaping
//! can surface arbitrary bytes, which must survive untouched until the
//! final re-escape pass.

use std::net::Ipv4Addr;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Maximum number of domain forms enumerated per URL.
const MAX_DOMAIN_FORMS: usize = 5;

/// Maximum number of path forms enumerated per URL.
const MAX_PATH_FORMS: usize = 6;

/// Maximum rounds of percent-unescaping before giving up on the input.
const MAX_UNESCAPE_DEPTH: usize = 1024;

/// Error type for canonicalization.
///
/// The lookup engine treats every variant as "no match"; nothing here is
/// surfaced to callers as a failure.
#[derive(Debug, Error)]
pub enum UrlError {
    /// The input was empty after trimming.
    #[error("empty URL")]
    Empty,

    /// Only http and https URLs participate in lookups.
    #[error("unsupported scheme: {0}")]
    Scheme(String),

    /// No hostname between the scheme and the path.
    #[error("missing hostname")]
    NoHost,

    /// IDNA encoding of a non-ASCII host failed.
    #[error("IDNA encoding failed: {0}")]
    Idna(String),

    /// Unescaping never reached a fixed point.
    #[error("too many unescape levels")]
    EscapeDepth,
}

/// Result type for URL operations.
pub type Result<T> = std::result::Result<T, UrlError>;

/// A canonicalized URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    /// The full canonical URI.
    pub url: String,

    /// The canonical hostname.
    pub host: String,

    /// The canonical path, including the query string when present.
    pub path: String,
}

/// Canonicalize a URL according to the Safe Browsing rules.
///
/// The pipeline: trim surrounding whitespace, strip tab/CR/LF ahead of the
/// query, drop the fragment, percent-unescape to a fixed point, default
/// the scheme to `http`, canonicalize host and path separately, then
/// re-escape with upper-case hex.
pub fn canonicalize(input: &str) -> Result<CanonicalUrl> {
    let trimmed = input.trim_matches(|c: char| c.is_ascii_whitespace());
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let cleaned = strip_embedded_control(trimmed);
    let cleaned = match cleaned.find('#') {
        Some(pos) => &cleaned[..pos],
        None => cleaned.as_str(),
    };

    let unescaped = unescape_to_fixed_point(cleaned.as_bytes())?;

    let (scheme, rest) = extract_scheme(&unescaped);
    let scheme = if scheme.is_empty() {
        "http".to_string()
    } else {
        scheme
    };
    if scheme != "http" && scheme != "https" {
        return Err(UrlError::Scheme(scheme));
    }

    let (raw_host, raw_path, raw_query) = split_authority(rest);
    if raw_host.is_empty() {
        return Err(UrlError::NoHost);
    }

    let host = canonical_host(raw_host)?;
    let path = escape(&normalize_path(raw_path));
    let path = match raw_query {
        Some(query) => format!("{path}?{}", escape(query)),
        None => path,
    };

    let url = format!("{scheme}://{host}{path}");
    Ok(CanonicalUrl { url, host, path })
}

/// Host suffixes used as storage keys: the full host plus its last-three-
/// and last-two-label suffixes. IPv4 literals yield only themselves.
pub fn host_suffixes(host: &str) -> Vec<String> {
    if is_ip_literal(host) {
        return vec![host.to_string()];
    }

    let labels: Vec<&str> = host.split('.').collect();
    let mut suffixes = vec![host.to_string()];
    for take in [3usize, 2] {
        if labels.len() > take {
            suffixes.push(labels[labels.len() - take..].join("."));
        }
    }
    suffixes
}

/// All host/path expressions hashed for a lookup: up to five domain forms
/// crossed with up to six path forms.
pub fn url_permutations(url: &CanonicalUrl) -> Vec<String> {
    let domains = domain_forms(&url.host);
    let paths = path_forms(&url.path);

    let mut expressions = Vec::with_capacity(domains.len() * paths.len());
    for domain in &domains {
        for path in &paths {
            let expression = format!("{domain}{path}");
            if !expressions.contains(&expression) {
                expressions.push(expression);
            }
        }
    }

    debug!(
        count = expressions.len(),
        url = %url.url,
        "enumerated lookup expressions"
    );
    expressions
}

/// Remove tab/CR/LF that appear ahead of the query string.
fn strip_embedded_control(url: &str) -> String {
    let is_control = |c: &char| *c == '\t' || *c == '\r' || *c == '\n';
    match url.find('?') {
        Some(pos) => {
            let head: String = url[..pos].chars().filter(|c| !is_control(c)).collect();
            format!("{head}{}", &url[pos..])
        }
        None => url.chars().filter(|c| !is_control(c)).collect(),
    }
}

/// Percent-unescape until the bytes stop changing.
fn unescape_to_fixed_point(input: &[u8]) -> Result<Vec<u8>> {
    let mut current = input.to_vec();
    for _ in 0..MAX_UNESCAPE_DEPTH {
        let unescaped = unescape(&current);
        if unescaped == current {
            return Ok(current);
        }
        current = unescaped;
    }
    Err(UrlError::EscapeDepth)
}

/// Single percent-unescape pass. A `%` not followed by two hex digits is
/// kept literally.
fn unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            if let Some([h1, h2]) = input.get(i + 1..i + 3) {
                if let (Some(d1), Some(d2)) = (hex_digit(*h1), hex_digit(*h2)) {
                    out.push(d1 * 16 + d2);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-escape bytes outside the printable ASCII range, plus `#` and
/// `%`, with upper-case hex.
fn escape(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        if byte <= 0x20 || byte >= 0x7f || byte == b'#' || byte == b'%' {
            out.push_str(&format!("%{byte:02X}"));
        } else {
            out.push(byte as char);
        }
    }
    out
}

/// Split off a leading `scheme:` token. Returns the lower-cased scheme
/// (possibly empty) and the remainder with any leading slashes consumed.
fn extract_scheme(url: &[u8]) -> (String, &[u8]) {
    let mut end = None;
    for (i, &b) in url.iter().enumerate() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' => continue,
            b'0'..=b'9' | b'+' | b'-' | b'.' if i > 0 => continue,
            b':' if i > 0 => {
                end = Some(i);
                break;
            }
            _ => break,
        }
    }

    match end {
        Some(i) => {
            let scheme: String = url[..i]
                .iter()
                .map(|b| (*b as char).to_ascii_lowercase())
                .collect();
            (scheme, skip_slashes(&url[i + 1..]))
        }
        None => (String::new(), skip_slashes(url)),
    }
}

fn skip_slashes(rest: &[u8]) -> &[u8] {
    let start = rest.iter().take_while(|b| **b == b'/').count();
    &rest[start..]
}

/// Split `host[/path][?query]` into its three parts. The host ends at the
/// first slash or question mark, whichever comes first.
fn split_authority(rest: &[u8]) -> (&[u8], &[u8], Option<&[u8]>) {
    let host_end = rest
        .iter()
        .position(|b| *b == b'/' || *b == b'?')
        .unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);

    match tail.iter().position(|b| *b == b'?') {
        Some(q) => (host, &tail[..q], Some(&tail[q + 1..])),
        None => (host, tail, None),
    }
}

/// Canonicalize the host: drop userinfo and port, collapse and trim dots,
/// lower-case, IDNA-encode non-ASCII names, rewrite numeric hosts as
/// dotted quads, and escape anything still out of range.
fn canonical_host(raw: &[u8]) -> Result<String> {
    let host = String::from_utf8_lossy(raw).into_owned();
    let host = remove_userinfo(&host);
    let host = remove_port(&host);

    let dots = Regex::new(r"\.+").unwrap();
    let host = dots.replace_all(&host, ".");
    let host = host.trim_matches('.').to_lowercase();
    if host.is_empty() {
        return Err(UrlError::NoHost);
    }

    let host = if host.is_ascii() {
        host
    } else {
        idna::domain_to_ascii(&host).map_err(|e| UrlError::Idna(format!("{e:?}")))?
    };

    if let Some(ip) = parse_numeric_ipv4(&host) {
        return Ok(ip.to_string());
    }

    Ok(escape(host.as_bytes()))
}

fn remove_userinfo(host: &str) -> &str {
    match host.rfind('@') {
        Some(pos) => &host[pos + 1..],
        None => host,
    }
}

fn remove_port(host: &str) -> &str {
    if let Some(pos) = host.rfind(':') {
        if !host[pos + 1..].is_empty() && host[pos + 1..].bytes().all(|b| b.is_ascii_digit()) {
            return &host[..pos];
        }
    }
    host
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

/// Parse numeric IPv4 spellings: plain dotted quads, a single 32-bit
/// integer, and the hex/octal and short dotted forms resolvers accept.
fn parse_numeric_ipv4(host: &str) -> Option<Ipv4Addr> {
    if !host
        .bytes()
        .all(|b| b.is_ascii_hexdigit() || b == b'.' || b == b'x' || b == b'X')
    {
        return None;
    }

    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let mut octets = Vec::with_capacity(4);
    for (i, part) in parts.iter().enumerate() {
        let spread = 4 - parts.len() + 1;
        if i == parts.len() - 1 {
            // The last part covers the remaining octets.
            let value = parse_numeric_part(part, spread)?;
            for j in 0..spread {
                octets.push(((value >> (8 * (spread - 1 - j))) & 0xff) as u8);
            }
        } else {
            let value = parse_numeric_part(part, 1)?;
            octets.push(value as u8);
        }
    }

    if octets.len() == 4 {
        Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        None
    }
}

/// Parse one numeric host part as decimal, octal, or hex, bounded by the
/// number of octets it must fill.
fn parse_numeric_part(part: &str, octets: usize) -> Option<u64> {
    let value = if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if part.starts_with('0') && part.len() > 1 {
        u64::from_str_radix(part, 8).ok()?
    } else if part.bytes().all(|b| b.is_ascii_digit()) {
        part.parse::<u64>().ok()?
    } else {
        return None;
    };

    let max = (1u64 << (8 * octets as u64)) - 1;
    (value <= max).then_some(value)
}

/// Resolve `.`/`..` segments and collapse repeated slashes, preserving a
/// trailing slash.
fn normalize_path(raw: &[u8]) -> Vec<u8> {
    let mut segments: Vec<&[u8]> = Vec::new();
    for segment in raw.split(|b| *b == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut path = vec![b'/'];
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            path.push(b'/');
        }
        path.extend_from_slice(segment);
    }

    if raw.ends_with(b"/") && path.len() > 1 {
        path.push(b'/');
    }
    path
}

/// Domain forms for lookup expressions: the exact host plus proper
/// suffixes from five labels down to two.
fn domain_forms(host: &str) -> Vec<String> {
    if is_ip_literal(host) {
        return vec![host.to_string()];
    }

    let labels: Vec<&str> = host.split('.').collect();
    let mut forms = vec![host.to_string()];

    let longest = (labels.len() - 1).min(MAX_DOMAIN_FORMS);
    for take in (2..=longest).rev() {
        forms.push(labels[labels.len() - take..].join("."));
    }
    forms.truncate(MAX_DOMAIN_FORMS);
    forms
}

/// Path forms for lookup expressions: path with query, path alone, the
/// root, and growing directory prefixes.
fn path_forms(path: &str) -> Vec<String> {
    let (path_only, query) = match path.find('?') {
        Some(pos) => (&path[..pos], Some(&path[pos..])),
        None => (path, None),
    };

    let mut forms = Vec::new();
    if let Some(query) = query {
        if query.len() > 1 {
            forms.push(format!("{path_only}{query}"));
        }
    }
    forms.push(path_only.to_string());
    forms.push("/".to_string());

    let components: Vec<&str> = path_only.split('/').filter(|s| !s.is_empty()).collect();
    for take in 1..components.len().min(4) {
        forms.push(format!("/{}/", components[..take].join("/")));
    }

    let mut deduped = Vec::with_capacity(forms.len());
    for form in forms {
        if !deduped.contains(&form) {
            deduped.push(form);
        }
    }
    deduped.truncate(MAX_PATH_FORMS);
    deduped
}
