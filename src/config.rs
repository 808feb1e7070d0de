//! Runtime configuration for the checker, the HTTP surface and the CLI.
//!
//! Every knob has a default matching the reference deployment; the CLI only
//! overrides what the user passes explicitly.
use std::time::Duration;

/// Top-level configuration tree.
#[derive(Debug, Clone, Default)]
pub struct CheckerConfig {
    pub probe: ProbeConfig,
    pub auth: AuthConfig,
    pub dns: DnsConfig,
    pub scan: ScanConfig,
    pub geo: GeoConfig,
}

/// Probe protocol and classification policy.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Read deadline armed once when the response read loop starts.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Value of the `Host` header; names the edge diagnostic host, never the target.
    pub trace_host: String,
    pub trace_path: String,
    pub user_agent: String,
    pub fingerprint: String,
    pub fingerprint_case_sensitive: bool,
    /// Any one of these must appear for the response to count as an edge rejection.
    pub rejection_phrases: Vec<String>,
    /// The response must be strictly longer than this many bytes.
    pub min_response_bytes: usize,
    /// Reading stops once this many bytes are buffered.
    pub max_response_bytes: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            connect_timeout: Duration::from_millis(5_000),
            trace_host: "speed.cloudflare.com".into(),
            trace_path: "/cdn-cgi/trace".into(),
            user_agent: "CheckProxyIP/Rust".into(),
            fingerprint: "cloudflare".into(),
            fingerprint_case_sensitive: false,
            rejection_phrases: vec!["plain HTTP request".into(), "400 Bad Request".into()],
            min_response_bytes: 50,
            max_response_bytes: 16 * 1024,
        }
    }
}

/// Rotating token settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Server-side rotation window; authoritative for token validity.
    pub window_minutes: u64,
    /// Published to clients as a "reload before using a stale token" hint only.
    pub refresh_hint_minutes: u64,
    /// Permanent secret. When set, `/check` requires a token.
    pub secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            window_minutes: 31,
            refresh_hint_minutes: 13,
            secret: None,
        }
    }
}

/// DNS-over-HTTPS resolver settings.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub doh_endpoint: String,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            doh_endpoint: "https://1.1.1.1/dns-query".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Batch scheduling for range scans.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub default_port: u16,
    /// Pause in `PausedAwaitingConfirm` after each range until resumed.
    pub confirm_between_ranges: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            inter_batch_delay: Duration::from_millis(200),
            default_port: 443,
            confirm_between_ranges: false,
        }
    }
}

/// Geo enrichment of successful scan hits.
#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://ip-api.com/json".into(),
            timeout: Duration::from_secs(10),
        }
    }
}
