//! TCP probe against a candidate proxy endpoint.
//!
//! The probe connects to the endpoint, sends a bare HTTP/1.1 request for the
//! edge's trace path with the edge diagnostic host in the `Host` header, and
//! reads the answer until the headers are complete or the read deadline
//! fires. A genuine forwarding proxy in front of the edge answers with the
//! edge's own "plain HTTP request was sent to HTTPS port" rejection page.
//!
//! ```text
//! CONNECTING -> WRITING -> READING { AWAIT_CHUNK <-> APPEND }
//!            -> COMPLETE | CAPPED | TIMED_OUT | FAILED -> CLOSED
//! ```
use std::fmt;
use std::io;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::endpoint::connect_host;
use crate::types::{now_rfc3339, Endpoint, ProbeResult};

static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^HTTP/\d\.\d\s+(\d+)").expect("static regex"));

/// Anything that can turn an endpoint into a [`ProbeResult`].
///
/// Implementations must never fail: faults are reported inside the result.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult;
}

/// Protocol state the probe was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Connecting,
    Writing,
    Reading,
    Complete,
    Capped,
    TimedOut,
    Failed,
    Closed,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbePhase::Connecting => "connect",
            ProbePhase::Writing => "write",
            ProbePhase::Reading => "read",
            ProbePhase::Complete => "complete",
            ProbePhase::Capped => "size limit",
            ProbePhase::TimedOut => "timed out",
            ProbePhase::Failed => "failed",
            ProbePhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport fault raised inside the probe; converted into a failed result.
#[derive(Error, Debug)]
#[error("{phase} failed: {source}")]
struct ProbeFault {
    phase: ProbePhase,
    #[source]
    source: io::Error,
}

impl ProbeFault {
    fn at(phase: ProbePhase) -> impl FnOnce(io::Error) -> Self {
        move |source| Self { phase, source }
    }

    /// Refusals, resets and timeouts are what most scanned addresses produce.
    fn is_routine(&self) -> bool {
        matches!(
            self.source.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::TimedOut
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
        )
    }
}

/// Bytes read from the endpoint and how the read loop ended.
#[derive(Debug)]
struct Exchange {
    response: Vec<u8>,
    ended: ProbePhase,
}

/// Result of classifying a raw response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status_code: Option<u16>,
    pub success: bool,
}

/// The real TCP prober.
#[derive(Debug, Clone, Default)]
pub struct ProbeEngine {
    config: ProbeConfig,
}

impl ProbeEngine {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `host:port`. `host` may be a bracketed IPv6 literal.
    pub async fn probe_host(&self, host: &str, port: u16) -> ProbeResult {
        match self.exchange(host, port).await {
            Ok(ex) => {
                let class = classify(&ex.response, &self.config);
                debug!(
                    host,
                    port,
                    ended = %ex.ended,
                    bytes = ex.response.len(),
                    status = ?class.status_code,
                    success = class.success,
                    "probe finished"
                );
                ProbeResult {
                    success: class.success,
                    host: host.to_string(),
                    port,
                    status_code: class.status_code,
                    response_byte_length: ex.response.len() as u64,
                    timestamp: now_rfc3339(),
                    error_message: None,
                }
            }
            Err(fault) => {
                let (phase, error) = (fault.phase, &fault.source);
                if fault.is_routine() {
                    debug!(host, port, ended = %ProbePhase::Failed, %phase, %error, "probe failed");
                } else {
                    warn!(host, port, ended = %ProbePhase::Failed, %phase, %error, "probe failed");
                }
                failed_result(host, port, fault.to_string())
            }
        }
    }

    async fn exchange(&self, host: &str, port: u16) -> Result<Exchange, ProbeFault> {
        let connect = TcpStream::connect((connect_host(host), port));
        let mut stream = time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
            .and_then(|res| res)
            .map_err(ProbeFault::at(ProbePhase::Connecting))?;

        let outcome = self.converse(&mut stream).await;
        // Closed on every path; the drop below releases the socket even if shutdown fails.
        let _ = stream.shutdown().await;
        drop(stream);
        debug!(host, port, phase = %ProbePhase::Closed, "socket released");
        outcome
    }

    async fn converse(&self, stream: &mut TcpStream) -> Result<Exchange, ProbeFault> {
        stream
            .write_all(self.request().as_bytes())
            .await
            .map_err(ProbeFault::at(ProbePhase::Writing))?;

        let cap = self.config.max_response_bytes;
        let mut response = Vec::with_capacity(cap.min(4096));
        let mut chunk = [0u8; 4096];
        let mut headers_end = None;
        // Armed once for the whole read loop; dropping it on return disarms it.
        let deadline = time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let ended = loop {
            if response.len() >= cap {
                break ProbePhase::Capped;
            }
            let room = (cap - response.len()).min(chunk.len());
            tokio::select! {
                read = stream.read(&mut chunk[..room]) => {
                    let n = read.map_err(ProbeFault::at(ProbePhase::Reading))?;
                    if n == 0 {
                        break ProbePhase::Complete;
                    }
                    let scanned = response.len().saturating_sub(3);
                    response.extend_from_slice(&chunk[..n]);
                    if headers_end.is_none() {
                        headers_end = find_headers_end(&response, scanned);
                        if headers_end.is_some_and(|end| headers_signal_end(&response[..end])) {
                            break ProbePhase::Complete;
                        }
                    }
                }
                _ = &mut deadline => break ProbePhase::TimedOut,
            }
        };

        Ok(Exchange { response, ended })
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
            self.config.trace_path, self.config.trace_host, self.config.user_agent
        )
    }
}

#[async_trait]
impl Prober for ProbeEngine {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        self.probe_host(&endpoint.host, endpoint.port).await
    }
}

/// A failed result for a probe that never produced a response.
pub fn failed_result(host: &str, port: u16, message: impl Into<String>) -> ProbeResult {
    ProbeResult {
        success: false,
        host: host.to_string(),
        port,
        status_code: None,
        response_byte_length: 0,
        timestamp: now_rfc3339(),
        error_message: Some(message.into()),
    }
}

/// Offset just past the blank line ending the header block, searching from `from`.
fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| from + i + 4)
}

/// The header block carries `Connection: close` or a `Content-Length`.
fn headers_signal_end(headers: &[u8]) -> bool {
    headers.split(|&b| b == b'\n').any(|line| {
        let line = line.trim_ascii();
        match header_value(line, b"connection:") {
            Some(v) => v.eq_ignore_ascii_case(b"close"),
            None => header_value(line, b"content-length:").is_some(),
        }
    })
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let head = line.get(..name.len())?;
    head.eq_ignore_ascii_case(name)
        .then(|| line[name.len()..].trim_ascii())
}

pub fn parse_status_code(text: &str) -> Option<u16> {
    STATUS_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Decide whether `response` is the edge rejecting a bare HTTP request.
pub fn classify(response: &[u8], policy: &ProbeConfig) -> Classification {
    let text = String::from_utf8_lossy(response);
    let status_code = parse_status_code(&text);

    let fingerprint = if policy.fingerprint_case_sensitive {
        text.contains(policy.fingerprint.as_str())
    } else {
        text.to_lowercase()
            .contains(&policy.fingerprint.to_lowercase())
    };
    let rejected = policy
        .rejection_phrases
        .iter()
        .any(|p| text.contains(p.as_str()));
    let sized = response.len() > policy.min_response_bytes;

    Classification {
        status_code,
        success: status_code.is_some() && fingerprint && rejected && sized,
    }
}
