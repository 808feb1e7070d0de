use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Expand a range spec into an ordered host list.
///
/// Supported forms:
/// - `a.b.c.d/24`: the 255 hosts `a.b.c.1` through `a.b.c.255`
/// - `a.b.c.S-E`: hosts `S..=E` of `a.b.c.0/24`, empty when `S > E`
///
/// Anything else expands to an empty list; callers skip such ranges.
pub fn expand(spec: &str) -> Vec<String> {
    let spec = spec.trim();
    if spec.contains('/') {
        return expand_cidr24(spec);
    }
    if let Some((start, end)) = spec.split_once('-') {
        return expand_octet_range(start, end);
    }
    Vec::new()
}

fn expand_cidr24(spec: &str) -> Vec<String> {
    let Ok(net) = spec.parse::<Ipv4Net>() else {
        return Vec::new();
    };
    if net.prefix_len() != 24 {
        return Vec::new();
    }
    let base = u32::from(net.network());
    (1..=255u32)
        .map(|i| Ipv4Addr::from(base + i).to_string())
        .collect()
}

fn expand_octet_range(start: &str, end: &str) -> Vec<String> {
    let (Ok(first), Ok(last)) = (start.parse::<Ipv4Addr>(), end.parse::<u8>()) else {
        return Vec::new();
    };
    let [a, b, c, s] = first.octets();
    if s > last {
        return Vec::new();
    }
    (s..=last)
        .map(|d| Ipv4Addr::new(a, b, c, d).to_string())
        .collect()
}
