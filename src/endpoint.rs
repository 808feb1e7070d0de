use std::sync::LazyLock;

use regex::Regex;

use crate::types::Endpoint;

/// Port used whenever the raw input carries none or an unusable one.
pub const DEFAULT_PORT: u16 = 443;

static TUNNEL_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.tp(\d+)\.").expect("static regex"));

/// Parse a raw address string into an [`Endpoint`]. Never fails.
///
/// Rules, first match wins:
/// - tunnel hostname `host.tp8080.example`: host is everything before `.tp`,
///   port is the digit run between `.tp` and the next `.`
/// - bracketed IPv6 `[::1]:9000`: host keeps its brackets
/// - dotted host with a single colon `1.2.3.4:8443`
/// - anything else is taken verbatim with port 443
pub fn parse(raw: &str) -> Endpoint {
    let (host, port) = split_host_port(raw);
    Endpoint {
        host: host.to_string(),
        port,
        raw_input: raw.to_string(),
    }
}

fn split_host_port(raw: &str) -> (&str, u16) {
    if let Some(idx) = raw.find(".tp") {
        let port = TUNNEL_PORT
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| port_or_default(m.as_str()))
            .unwrap_or(DEFAULT_PORT);
        return (&raw[..idx], port);
    }

    if raw.contains('[') {
        if let Some((head, tail)) = raw.split_once("]:") {
            // Keep the closing bracket on the host.
            let host = &raw[..head.len() + 1];
            return (host, port_or_default(tail));
        }
    }

    if raw.contains(':') && !raw.starts_with('[') {
        let mut parts = raw.split(':');
        if let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) {
            if host.contains('.') {
                return (host, port_or_default(port));
            }
        }
    }

    (raw, DEFAULT_PORT)
}

/// Parse the leading decimal run of `s` as a port in `1..=65535`, else 443.
fn port_or_default(s: &str) -> u16 {
    let digits_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    match s[..digits_end].parse::<u32>() {
        Ok(val) if (1..=65535).contains(&val) => val as u16,
        _ => DEFAULT_PORT,
    }
}

/// True when `host` already carries a port in any syntax [`parse`] understands.
pub fn has_explicit_port(host: &str) -> bool {
    if host.contains(".tp") {
        return TUNNEL_PORT.is_match(host);
    }
    if host.contains('[') {
        return host.contains("]:");
    }
    host.matches(':').count() == 1
}

/// Host string suitable for a socket connect: IPv6 brackets removed.
pub fn connect_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
