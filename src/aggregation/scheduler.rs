//! Flush scheduling
//!
//! One task owns the [`FlushScheduler`] and runs every flush pass, so passes
//! never overlap. The task wakes on its own interval timer and on commands
//! sent through a [`FlushHandle`]. A drain is terminal: the aggregator is
//! closed, every remaining key is emitted and the task exits.

use chrono::{DateTime, Utc};
use metrics::{gauge, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Aggregator, FlushMode, RecordEmitter};
use crate::error::{Error, Result};
use crate::telemetry::{
    PerformanceTimer, FLUSH_DURATION_SECONDS, KEYS_PENDING, SLOW_FLUSH_THRESHOLD_MS,
};

/// Outcome of one flush pass
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub mode: FlushMode,
    /// Keys selected for the pass
    pub selected: usize,
    /// Records accepted by the sink
    pub emitted: usize,
    /// Records the sink rejected; their counts are lost
    pub failed: usize,
    /// Keys left in the stores afterwards
    pub remaining: usize,
    pub duration: Duration,
}

enum FlushCommand {
    Tick {
        now: DateTime<Utc>,
        reply: oneshot::Sender<FlushReport>,
    },
    Drain {
        reply: oneshot::Sender<FlushReport>,
    },
}

/// Requests flush passes from the scheduler task
#[derive(Clone)]
pub struct FlushHandle {
    commands: mpsc::Sender<FlushCommand>,
}

impl FlushHandle {
    /// Run a periodic pass as if the timer fired at `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<FlushReport> {
        let (reply, response) = oneshot::channel();
        self.request(FlushCommand::Tick { now, reply }, response).await
    }

    /// Close the aggregator, flush every key and stop the scheduler
    pub async fn drain(&self) -> Result<FlushReport> {
        let (reply, response) = oneshot::channel();
        self.request(FlushCommand::Drain { reply }, response).await
    }

    async fn request(
        &self,
        command: FlushCommand,
        response: oneshot::Receiver<FlushReport>,
    ) -> Result<FlushReport> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::AggregatorClosed)?;
        response.await.map_err(|_| Error::AggregatorClosed)
    }
}

pub struct FlushScheduler {
    aggregator: Arc<Aggregator>,
    emitter: RecordEmitter,
    commands: mpsc::Receiver<FlushCommand>,
}

impl FlushScheduler {
    pub fn new(aggregator: Arc<Aggregator>, emitter: RecordEmitter) -> (Self, FlushHandle) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                aggregator,
                emitter,
                commands: rx,
            },
            FlushHandle { commands: tx },
        )
    }

    /// Run one pass: select, take, emit
    ///
    /// A key's counts are removed from the stores before its record is
    /// built, so an increment racing the pass either lands in this record or
    /// starts a fresh entry.
    pub fn flush(&mut self, mode: FlushMode) -> FlushReport {
        let timer = PerformanceTimer::new("flush pass");
        let keys = self.aggregator.select_keys(mode);
        let selected = keys.len();
        let mut emitted = 0;
        let mut failed = 0;

        for key in keys {
            let counts = self.aggregator.take(&key);
            if counts.is_empty() {
                debug!("Key {:?} already flushed", key);
                continue;
            }
            match self.emitter.emit(&key, &counts) {
                Ok(_) => emitted += 1,
                Err(e) => {
                    failed += 1;
                    error!(
                        "Failed to emit record for campaign {} creative {} window {}: {}",
                        key.campaign_id, key.creative_id, key.window_label, e
                    );
                }
            }
        }

        let remaining = self.aggregator.pending_keys();
        let duration = timer.elapsed();
        timer.log_if_slow(SLOW_FLUSH_THRESHOLD_MS);
        histogram!(FLUSH_DURATION_SECONDS, "mode" => mode.as_str()).record(duration.as_secs_f64());
        gauge!(KEYS_PENDING).set(remaining as f64);

        FlushReport {
            mode,
            selected,
            emitted,
            failed,
            remaining,
            duration,
        }
    }

    /// Scheduler loop; returns after the drain pass
    pub async fn run(mut self) -> FlushReport {
        let interval = self.aggregator.interval();
        let period = interval.as_duration();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("⏰ Flush scheduler started (every {}s)", interval.secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.flush(FlushMode::periodic(Utc::now(), interval));
                    log_report(&report);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(FlushCommand::Tick { now, reply }) => {
                            let report = self.flush(FlushMode::periodic(now, interval));
                            log_report(&report);
                            let _ = reply.send(report);
                        }
                        Some(FlushCommand::Drain { reply }) => {
                            let report = self.drain();
                            let _ = reply.send(report.clone());
                            return report;
                        }
                        None => {
                            warn!("⚠️ All flush handles dropped, draining");
                            return self.drain();
                        }
                    }
                }
            }
        }
    }

    fn drain(&mut self) -> FlushReport {
        self.aggregator.close();
        let report = self.flush(FlushMode::Drain);
        log_report(&report);
        info!("Flush scheduler stopped");
        report
    }
}

fn log_report(report: &FlushReport) {
    match report.mode {
        FlushMode::Periodic { boundary_ms } => info!(
            "📤 Flushed {} of {} keys up to {} ({} pending, {} failed) in {}ms",
            report.emitted,
            report.selected,
            DateTime::from_timestamp_millis(boundary_ms)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| boundary_ms.to_string()),
            report.remaining,
            report.failed,
            report.duration.as_millis()
        ),
        FlushMode::Drain => info!(
            "📤 Drained {} of {} keys ({} failed) in {}ms",
            report.emitted,
            report.selected,
            report.failed,
            report.duration.as_millis()
        ),
    }
}
