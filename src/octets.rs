use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Parse a list of host octets (the last byte of a /24 address).
///
/// Accepts comma or newline separated items:
/// - single octet: `10`
/// - inclusive range: `1-254`
/// - comments: everything after `#` is ignored
///
/// Duplicates are dropped, first appearance wins. Valid octets are `1..=254`.
pub fn parse_octets_str(s: &str) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let (start, end) = parse_bounds(a, b)
                    .with_context(|| format!("line {line_no}: invalid range: {item}"))?;
                for o in start..=end {
                    if seen.insert(o) {
                        out.push(o);
                    }
                }
                continue;
            }
            let o = parse_octet(item)
                .with_context(|| format!("line {line_no}: invalid octet: {item}"))?;
            if seen.insert(o) {
                out.push(o);
            }
        }
    }

    Ok(out)
}

/// Parse a single `start-end` range into its bounds.
pub fn parse_range_str(s: &str) -> Result<(u8, u8)> {
    let Some((a, b)) = s.trim().split_once('-') else {
        bail!("expected <start>-<end>, got: {s}");
    };
    parse_bounds(a, b)
}

fn parse_bounds(a: &str, b: &str) -> Result<(u8, u8)> {
    let start = parse_octet(a.trim())?;
    let end = parse_octet(b.trim())?;
    if start > end {
        bail!("start {start} is after end {end}");
    }
    Ok((start, end))
}

fn parse_octet(s: &str) -> Result<u8> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 254 {
        bail!("host octet out of range: {val}");
    }
    Ok(val as u8)
}
