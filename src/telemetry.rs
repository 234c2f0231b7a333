//! Logging and metrics
//!
//! Tracing goes to stdout through `tracing-subscriber`; `RUST_LOG` overrides
//! the default filter. Counters and histograms are recorded through the
//! `metrics` facade and only leave the process when an exporter is installed
//! (the `prometheus` feature).

use std::time::Instant;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::Result;

// ============================================================================
// Metric names
// ============================================================================

/// Messages received, labelled by `category` and `outcome`
pub const MESSAGES_TOTAL: &str = "rtbagg_messages_total";
/// Counter increments applied, labelled by `category`
pub const EVENTS_COUNTED_TOTAL: &str = "rtbagg_events_counted_total";
/// Aggregated records handed to the sink
pub const RECORDS_EMITTED_TOTAL: &str = "rtbagg_records_emitted_total";
/// Records the sink failed to deliver
pub const RECORDS_FAILED_TOTAL: &str = "rtbagg_records_failed_total";
/// Keys still held in the stores after a flush pass
pub const KEYS_PENDING: &str = "rtbagg_keys_pending";
/// Flush pass duration in seconds, labelled by `mode`
pub const FLUSH_DURATION_SECONDS: &str = "rtbagg_flush_duration_seconds";

/// Flush passes slower than this are logged at warn level
pub const SLOW_FLUSH_THRESHOLD_MS: u64 = 1_000;

/// Initialize structured logging with tracing
pub fn init_tracing(config: &LoggingConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "rtb_aggregator={},rdkafka=warn,sqlx=warn,info",
            default_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init(),
    }
}

/// Install the Prometheus exporter when an address is configured
#[cfg(feature = "prometheus")]
pub fn install_metrics_exporter(config: &LoggingConfig) -> Result<()> {
    use crate::error::Error;
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(addr) = &config.metrics_addr else {
        return Ok(());
    };
    let addr: std::net::SocketAddr = addr.parse().map_err(|_| Error::InvalidConfig {
        key: "RTBAGG_METRICS_ADDR",
        message: format!("'{}' is not a socket address", addr).into(),
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::config(format!("failed to install Prometheus exporter: {}", e)))?;

    tracing::info!("📈 Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn install_metrics_exporter(config: &LoggingConfig) -> Result<()> {
    if config.metrics_addr.is_some() {
        tracing::warn!("RTBAGG_METRICS_ADDR is set but the prometheus feature is not enabled");
    }
    Ok(())
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: &'static str,
}

impl PerformanceTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "⚠️ Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        tracing::debug!("⏱️ {} completed in {}ms", self.label, self.elapsed_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_timer_measures() {
        let timer = PerformanceTimer::new("test");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);
        timer.log_if_slow(u64::MAX);
    }
}
