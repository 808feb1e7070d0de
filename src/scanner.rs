use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::endpoint::{self, has_explicit_port};
use crate::geo::{strip_brackets, GeoLookup};
use crate::probe::{failed_result, Prober};
use crate::ranges;
use crate::types::{Endpoint, ScanEntry, ScanEvent, ScanProgress, ScanState};

/// Control surface for a running scan queue.
///
/// The scanner is the only writer of the published state and progress;
/// everyone else reads snapshots or requests `resume` / `cancel`, which take
/// effect at the next batch or range boundary.
#[derive(Clone, Debug)]
pub struct ScanControl {
    cancel: CancellationToken,
    resume: Arc<Notify>,
    state: Arc<watch::Sender<ScanState>>,
    progress: Arc<watch::Sender<ScanProgress>>,
    events: Option<mpsc::UnboundedSender<ScanEvent>>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
            state: Arc::new(watch::Sender::new(ScanState::Idle)),
            progress: Arc::new(watch::Sender::new(ScanProgress::default())),
            events: None,
        }
    }

    /// Also stream [`ScanEvent`]s to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ScanEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> ScanProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    /// Continue past a `PausedAwaitingConfirm` gate. No effect in any other state.
    ///
    /// The state flips to `Running` here, so only the first of several racing
    /// calls releases the gate.
    pub fn resume(&self) -> bool {
        let released = self.state.send_if_modified(|s| {
            if *s == ScanState::PausedAwaitingConfirm {
                *s = ScanState::Running;
                true
            } else {
                false
            }
        });
        if released {
            self.resume.notify_one();
        }
        released
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    /// Wait at the confirm gate. Returns `false` if cancelled instead.
    async fn await_confirm(&self) -> bool {
        tokio::select! {
            _ = self.resume.notified() => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Sleep between batches. Returns `false` if cancelled meanwhile.
    async fn pause(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = time::sleep(delay) => !self.cancel.is_cancelled(),
            _ = self.cancel.cancelled() => false,
        }
    }
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives probes over a queue of range specs in fixed-size batches.
#[derive(Clone)]
pub struct RangeScanner {
    prober: Arc<dyn Prober>,
    geo: Option<Arc<dyn GeoLookup>>,
    config: ScanConfig,
}

impl RangeScanner {
    pub fn new(prober: Arc<dyn Prober>, config: ScanConfig) -> Self {
        Self {
            prober,
            geo: None,
            config,
        }
    }

    /// Annotate successful hits with a country code.
    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan every range in order and return the final aggregate.
    ///
    /// - Ranges run strictly one after another; an unsupported spec is skipped.
    /// - Within a range, `batch_size` probes run concurrently and the whole
    ///   batch is awaited before the next one, after `inter_batch_delay`.
    /// - Results keep dispatch order inside each batch.
    /// - `cancel` is honored only between batches or ranges.
    pub async fn scan_queue(&self, specs: &[String], control: &ScanControl) -> ScanProgress {
        control.progress.send_replace(ScanProgress::default());
        control.set_state(ScanState::Running);
        info!(ranges = specs.len(), "range scan started");

        for (range_index, spec) in specs.iter().enumerate() {
            if control.is_cancelled() {
                return self.finish_cancelled(control);
            }

            if range_index > 0 && self.config.confirm_between_ranges {
                control.set_state(ScanState::PausedAwaitingConfirm);
                control.emit(ScanEvent::AwaitingConfirm {
                    next_range_index: range_index,
                });
                info!(next_range_index = range_index, "awaiting confirmation");
                if !control.await_confirm().await {
                    return self.finish_cancelled(control);
                }
                control.set_state(ScanState::Running);
            }

            control.progress.send_modify(|p| p.range_index = range_index);

            let hosts = ranges::expand(spec);
            if hosts.is_empty() {
                warn!(range = %spec, "no hosts in range, skipping");
                control.emit(ScanEvent::RangeSkipped {
                    range_index,
                    spec: spec.clone(),
                });
                continue;
            }
            info!(range = %spec, hosts = hosts.len(), "range started");
            control.emit(ScanEvent::RangeStarted {
                range_index,
                spec: spec.clone(),
                hosts: hosts.len(),
            });

            let targets: Vec<Endpoint> = hosts
                .iter()
                .map(|h| endpoint::parse(&self.with_default_port(h)))
                .collect();

            for (batch_no, batch) in targets.chunks(self.config.batch_size.max(1)).enumerate() {
                if batch_no > 0 && !control.pause(self.config.inter_batch_delay).await {
                    return self.finish_cancelled(control);
                }

                let entries = self.run_batch(batch).await;
                control.progress.send_modify(|p| {
                    for entry in entries {
                        p.checked_count += 1;
                        if entry.result.success {
                            p.success_count += 1;
                        }
                        p.results.push(entry);
                    }
                });

                let (checked_count, success_count) = counters(control);
                debug!(range_index, batch_no, checked_count, success_count, "batch done");
                control.emit(ScanEvent::BatchCompleted {
                    range_index,
                    checked_count,
                    success_count,
                });
            }

            control.emit(ScanEvent::RangeFinished { range_index });
        }

        let (checked_count, success_count) = counters(control);
        info!(checked_count, success_count, "range scan finished");
        control.set_state(ScanState::Done);
        control.emit(ScanEvent::Finished {
            checked_count,
            success_count,
        });
        control.progress()
    }

    fn with_default_port(&self, host: &str) -> String {
        if has_explicit_port(host) {
            host.to_string()
        } else {
            format!("{host}:{}", self.config.default_port)
        }
    }

    /// Probe one batch concurrently; entries come back in dispatch order.
    async fn run_batch(&self, batch: &[Endpoint]) -> Vec<ScanEntry> {
        let handles: Vec<_> = batch
            .iter()
            .cloned()
            .map(|ep| {
                let prober = self.prober.clone();
                let geo = self.geo.clone();
                tokio::spawn(async move {
                    let result = prober.probe(&ep).await;
                    let country_code = match (&geo, result.success) {
                        (Some(geo), true) => geo.country_code(strip_brackets(&result.host)).await,
                        _ => None,
                    };
                    ScanEntry {
                        result,
                        country_code,
                    }
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(batch)
            .map(|(joined, ep)| {
                joined.unwrap_or_else(|e| {
                    warn!(host = %ep.host, port = ep.port, error = %e, "probe task aborted");
                    ScanEntry {
                        result: failed_result(&ep.host, ep.port, format!("probe task failed: {e}")),
                        country_code: None,
                    }
                })
            })
            .collect()
    }

    fn finish_cancelled(&self, control: &ScanControl) -> ScanProgress {
        let (checked_count, success_count) = counters(control);
        info!(checked_count, success_count, "range scan cancelled");
        control.set_state(ScanState::Cancelled);
        control.emit(ScanEvent::Cancelled {
            checked_count,
            success_count,
        });
        control.progress()
    }
}

fn counters(control: &ScanControl) -> (u64, u64) {
    let p = control.progress.borrow();
    (p.checked_count, p.success_count)
}

/// Scan `specs` with a fresh control and no event stream.
pub async fn scan_ranges(
    prober: Arc<dyn Prober>,
    specs: &[String],
    config: ScanConfig,
) -> ScanProgress {
    RangeScanner::new(prober, config)
        .scan_queue(specs, &ScanControl::new())
        .await
}
