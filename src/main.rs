use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use proxyip_check_rs::auth::TokenAuthority;
use proxyip_check_rs::checker::{CheckOutcome, Checker};
use proxyip_check_rs::config::CheckerConfig;
use proxyip_check_rs::scanner::ScanControl;
use proxyip_check_rs::server;
use proxyip_check_rs::types::{ProbeResult, ScanEvent};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Command-line front end: single checks, range scans and the HTTP API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "proxyip-check-rs",
    version,
    about = "Check whether an IP, domain or tunnel hostname is a working proxy in front of the Cloudflare edge.",
    long_about = None
)]
struct Cli {
    /// Single endpoint to check: IP[:port], [IPv6]:port, domain[:port] or host.tpPORT.domain.
    #[arg(long)]
    check: Option<String>,

    /// Ranges to scan (a.b.c.0/24 or a.b.c.S-E), comma separated, or a path to a file with one per line.
    #[arg(long, value_delimiter = ',')]
    ranges: Vec<String>,

    /// Ask for confirmation on stdin before each range after the first.
    #[arg(long = "confirm-ranges", default_value_t = false)]
    confirm_ranges: bool,

    /// Read deadline for each probe in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 5000)]
    timeout_ms: u64,

    /// A response must be longer than this many bytes to count as a hit.
    #[arg(long = "min-bytes", default_value_t = 50)]
    min_bytes: usize,

    /// Match the edge fingerprint case-sensitively.
    #[arg(long = "strict-fingerprint", default_value_t = false)]
    strict_fingerprint: bool,

    /// Probes run concurrently per batch.
    #[arg(long = "batch-size", default_value_t = 10)]
    batch_size: usize,

    /// Pause between batches in milliseconds.
    #[arg(long = "batch-delay-ms", default_value_t = 200)]
    batch_delay_ms: u64,

    /// DNS-over-HTTPS JSON endpoint.
    #[arg(long = "doh", default_value = "https://1.1.1.1/dns-query")]
    doh: String,

    /// Skip geo annotation of hits.
    #[arg(long = "no-geo", default_value_t = false)]
    no_geo: bool,

    /// Permanent API token. Without it only the rotating token is accepted.
    #[arg(long, env = "PROXYIP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Token rotation window in minutes.
    #[arg(long = "window-minutes", default_value_t = 31)]
    window_minutes: u64,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start the HTTP API.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Address the HTTP API binds to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> CheckerConfig {
        let mut cfg = CheckerConfig::default();
        cfg.probe.timeout = Duration::from_millis(self.timeout_ms);
        cfg.probe.connect_timeout = Duration::from_millis(self.timeout_ms);
        cfg.probe.min_response_bytes = self.min_bytes;
        cfg.probe.fingerprint_case_sensitive = self.strict_fingerprint;
        cfg.auth.secret = self.token.clone().filter(|t| !t.is_empty());
        cfg.auth.window_minutes = self.window_minutes;
        cfg.dns.doh_endpoint = self.doh.clone();
        cfg.scan.batch_size = self.batch_size;
        cfg.scan.inter_batch_delay = Duration::from_millis(self.batch_delay_ms);
        cfg.scan.confirm_between_ranges = self.confirm_ranges;
        cfg.geo.enabled = !self.no_geo;
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let config = cli.config();
    let checker = Checker::from_config(config.clone())?;

    if cli.serve {
        let bind = cli.bind.clone();
        let api_checker = checker.clone();
        let authority = TokenAuthority::new(config.auth.clone());
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, api_checker, authority).await {
                tracing::error!(error = %e, "HTTP API server error");
            }
        });
        println!("API starting at http://{} (Ctrl+C to stop)", cli.bind);
    }

    if let Some(raw) = cli.check.as_deref() {
        let outcome = checker.check_auto(raw).await?;
        let results = match &outcome {
            CheckOutcome::Single(r) => std::slice::from_ref(r),
            CheckOutcome::Domain(d) => {
                println!(
                    "\nDomain {} resolved to {} address(es); testing port {}",
                    d.domain,
                    d.ips.len(),
                    d.port
                );
                d.results.as_slice()
            }
        };
        print_results_table(results);
        if let Some(path) = cli.output.as_deref() {
            match &outcome {
                CheckOutcome::Single(r) => write_json(path, r)?,
                CheckOutcome::Domain(d) => write_json(path, d)?,
            }
        }
    }

    let ranges = load_ranges(&cli.ranges)?;
    if !ranges.is_empty() {
        let (tx, rx) = mpsc::unbounded_channel();
        // Only `control` holds the event sender, so the reporter ends once it is dropped.
        let base = ScanControl::new();
        let reporter = tokio::spawn(report_events(rx, base.clone()));
        let ctrl_c = base.clone();
        let control = base.with_events(tx);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            ctrl_c.cancel();
        });

        let progress = checker.scanner().scan_queue(&ranges, &control).await;
        drop(control);
        let _ = reporter.await;

        let hits: Vec<ProbeResult> = progress.successful().map(|e| e.result.clone()).collect();
        println!(
            "\nAll ranges processed. Total tested: {} | Total successful: {}",
            progress.checked_count, progress.success_count
        );
        print_results_table(&hits);
        if let Some(path) = cli.output.as_deref() {
            write_json(path, &progress)?;
        }
    }

    // If the API is running, keep the process alive until Ctrl+C.
    if cli.serve {
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
    }

    Ok(())
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("PROXYIP_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

/// Each argument is either a range spec or a file holding one spec per line.
fn load_ranges(args: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in args.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        let path = Path::new(arg);
        if path.is_file() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read ranges file: {}", path.display()))?;
            out.extend(
                content
                    .lines()
                    .filter_map(|l| l.split_whitespace().next())
                    .map(str::to_string),
            );
        } else {
            out.push(arg.to_string());
        }
    }
    Ok(out)
}

/// Print scanner events and answer the confirm gate from stdin.
async fn report_events(mut rx: mpsc::UnboundedReceiver<ScanEvent>, control: ScanControl) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::RangeStarted { spec, hosts, .. } => {
                println!("Processing range: {spec} ({hosts} hosts)...");
            }
            ScanEvent::RangeSkipped { spec, .. } => {
                println!("No valid IPs found or invalid format for range: \"{spec}\". Skipping.");
            }
            ScanEvent::BatchCompleted {
                checked_count,
                success_count,
                ..
            } => {
                println!("  Total tested: {checked_count} | Total successful: {success_count}");
            }
            ScanEvent::AwaitingConfirm { next_range_index } => {
                println!("Continue with range #{}? [Y/n]", next_range_index + 1);
                let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
                if answer.trim().eq_ignore_ascii_case("n") {
                    control.cancel();
                } else {
                    control.resume();
                }
            }
            ScanEvent::Cancelled { checked_count, .. } => {
                println!("Scan cancelled after {checked_count} probes.");
            }
            ScanEvent::RangeFinished { .. } | ScanEvent::Finished { .. } => {}
        }
    }
}

fn print_results_table(results: &[ProbeResult]) {
    let mut host_w = "host".len();
    let mut err_w = "error".len();
    for r in results {
        host_w = host_w.max(r.host.len());
        if let Some(e) = &r.error_message {
            err_w = err_w.max(e.len().min(60));
        }
    }
    let port_w = 5usize;
    let status_w = "status".len();
    let size_w = "bytes".len().max(6);
    let ok_w = "ok".len().max(3);

    println!(
        "\n{:<host_w$}  {:>port_w$}  {:>status_w$}  {:>size_w$}  {:<ok_w$}  {:<err_w$}",
        "host", "port", "status", "bytes", "ok", "error",
    );
    println!(
        "{:-<host_w$}  {:-<port_w$}  {:-<status_w$}  {:-<size_w$}  {:-<ok_w$}  {:-<err_w$}",
        "", "", "", "", "", "",
    );
    for r in results {
        let err: String = r
            .error_message
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(60)
            .collect();
        let status = r.status_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        let ok = if r.success { "yes" } else { "no" };
        println!(
            "{:<host_w$}  {:>port_w$}  {:>status_w$}  {:>size_w$}  {:<ok_w$}  {:<err_w$}",
            r.host, r.port, status, r.response_byte_length, ok, err,
        );
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create output file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    println!("Wrote JSON results to {}", path.display());
    Ok(())
}
