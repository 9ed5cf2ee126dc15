//! Chunk-range strings
//!
//! The update request reports locally present chunk numbers as a compact,
//! comma-separated list of integers and inclusive ranges, e.g.
//! `1-3,5,7-11`. The server's `ad:`/`sd:` delete directives use the same
//! syntax.

use crate::{ProtoError, Result};

/// Expand a range string into the chunk numbers it covers.
///
/// Accepts `N` and `N-M` tokens (with `N <= M`) separated by commas;
/// surrounding whitespace is tolerated. The result is sorted and
/// deduplicated.
pub fn parse_ranges(input: &str) -> Result<Vec<u32>> {
    let mut numbers = Vec::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        match token.split_once('-') {
            Some((low, high)) => {
                let low = parse_chunknum(low.trim())?;
                let high = parse_chunknum(high.trim())?;
                if low > high {
                    return Err(ProtoError::Range(format!("descending range {token}")));
                }
                numbers.extend(low..=high);
            }
            None => numbers.push(parse_chunknum(token)?),
        }
    }

    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}

/// Render chunk numbers as a minimal range string.
///
/// Adjacent numbers collapse into `N-M` tokens; the output is empty for an
/// empty input.
pub fn format_ranges(chunknums: &[u32]) -> String {
    let mut sorted = chunknums.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut tokens: Vec<String> = Vec::new();
    let mut run_start = None;
    let mut prev = 0u32;

    for &n in &sorted {
        match run_start {
            None => run_start = Some(n),
            Some(start) => {
                if n != prev + 1 {
                    tokens.push(render_run(start, prev));
                    run_start = Some(n);
                }
            }
        }
        prev = n;
    }
    if let Some(start) = run_start {
        tokens.push(render_run(start, prev));
    }

    tokens.join(",")
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

fn parse_chunknum(token: &str) -> Result<u32> {
    token
        .parse::<u32>()
        .map_err(|_| ProtoError::Range(format!("bad chunk number {token:?}")))
}
