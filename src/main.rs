//! RTB Aggregator
//!
//! Consumes bid, win, pixel and click events from Kafka, counts them per
//! campaign creative in fixed windows and writes one enriched record per
//! window to the log or to an output topic.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM or SIGINT:
//! - Partition consumers are cancelled and joined
//! - The aggregator stops accepting events
//! - Every remaining window is flushed, complete or not
//! - The output producer is flushed

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use rtb_aggregator::aggregation::EnrichmentResolver;
use rtb_aggregator::config::{self, LoggingConfig};
use rtb_aggregator::kafka::KafkaIngest;
use rtb_aggregator::{database, sink, telemetry};
use rtb_aggregator::{Aggregator, Config, FlushScheduler, RecordEmitter, Result};

/// Upper bound for delivering buffered output records on exit
const SINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Logging first, so configuration problems are reported properly
    let env_source = config::load_env_sources();
    let logging = LoggingConfig::from_env()?;
    telemetry::init_tracing(&logging);

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 RTB Aggregator v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    env_source.log();

    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    telemetry::install_metrics_exporter(&config.logging)?;

    // Reference data is required; without it the service does not start
    let snapshot = database::load_reference_snapshot(&config.database).await?;
    let resolver = Arc::new(EnrichmentResolver::new(&snapshot));
    drop(snapshot);
    info!("✅ Enrichment index holds {} creatives", resolver.len());

    let sink = sink::from_config(&config.kafka)?;
    info!("✅ Aggregated records go to the {} sink", sink.name());

    let aggregator = Arc::new(Aggregator::new(
        config.aggregation.interval,
        config.kafka.topics.clone(),
    ));

    let (scheduler, flush) = FlushScheduler::new(
        Arc::clone(&aggregator),
        RecordEmitter::new(resolver, Arc::clone(&sink)),
    );
    let mut scheduler_task = tokio::spawn(scheduler.run());

    let ingest = KafkaIngest::start(&config.kafka, Arc::clone(&aggregator)).await?;

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ Aggregating {} partitions", ingest.partitions());
    info!("  ⏱️ Window: {}s", config.aggregation.interval.secs());
    info!("═══════════════════════════════════════════════════════════════");

    let mut scheduler_finished = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = ingest.stopped() => {
            warn!("⚠️ Kafka consumers stopped, initiating shutdown");
        }
        result = &mut scheduler_task => {
            scheduler_finished = true;
            error!("Flush scheduler exited unexpectedly: {:?}", result);
        }
    }

    info!("🛑 Initiating graceful shutdown...");

    ingest
        .shutdown(config.aggregation.shutdown_timeout)
        .await;

    aggregator.close();

    match flush.drain().await {
        Ok(report) => info!(
            "✅ Final flush: {} records emitted, {} failed",
            report.emitted, report.failed
        ),
        Err(e) => error!("Final flush did not run: {}", e),
    }
    if !scheduler_finished {
        if let Err(e) = scheduler_task.await {
            error!("Flush scheduler task failed: {}", e);
        }
    }

    if let Err(e) = sink.flush(SINK_FLUSH_TIMEOUT) {
        warn!("⚠️ Output sink flush incomplete: {}", e);
    }

    info!("👋 RTB Aggregator stopped gracefully");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
