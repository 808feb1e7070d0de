use serde::{Deserialize, Serialize};

/// A parsed `(host, port)` target together with the raw string it came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub raw_input: String,
}

/// Outcome of one probe attempt. Built once, never mutated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub success: bool,
    #[serde(rename = "proxyIP")]
    pub host: String,
    #[serde(rename = "portRemote")]
    pub port: u16,
    pub status_code: Option<u16>,
    #[serde(rename = "responseSize")]
    pub response_byte_length: u64,
    pub timestamp: String,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
}

/// A rotating credential and the time bucket it was derived for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub window_start: u64,
}

/// One scanned endpoint: its probe result plus an optional geo annotation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    #[serde(flatten)]
    pub result: ProbeResult,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub country_code: Option<String>,
}

/// Aggregate counters and ordered results of a range scan queue.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub range_index: usize,
    pub checked_count: u64,
    pub success_count: u64,
    pub results: Vec<ScanEntry>,
}

impl ScanProgress {
    pub fn successful(&self) -> impl Iterator<Item = &ScanEntry> {
        self.results.iter().filter(|e| e.result.success)
    }
}

/// Lifecycle of a scan queue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    PausedAwaitingConfirm,
    Done,
    Cancelled,
}

/// Progress notifications emitted by the scanner between batches and ranges.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    RangeStarted {
        range_index: usize,
        spec: String,
        hosts: usize,
    },
    RangeSkipped {
        range_index: usize,
        spec: String,
    },
    BatchCompleted {
        range_index: usize,
        checked_count: u64,
        success_count: u64,
    },
    RangeFinished {
        range_index: usize,
    },
    AwaitingConfirm {
        next_range_index: usize,
    },
    Finished {
        checked_count: u64,
        success_count: u64,
    },
    Cancelled {
        checked_count: u64,
        success_count: u64,
    },
}

/// Result of checking every address a domain resolves to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DomainCheck {
    pub domain: String,
    pub port: u16,
    pub ips: Vec<String>,
    pub results: Vec<ProbeResult>,
}

impl DomainCheck {
    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Current UTC time as RFC 3339, used for every user-visible timestamp.
pub fn now_rfc3339() -> String {
    let now = ::time::OffsetDateTime::now_utc();
    now.format(&::time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
