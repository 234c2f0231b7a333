//! Destinations for aggregated records
//!
//! - [`LogSink`]: one `info!` line per record (the default)
//! - [`KafkaRecordSink`]: JSON to an output topic, keyed by campaign
//! - [`MemorySink`]: collects records in memory, for tests and tooling

use metrics::counter;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::aggregation::AggregatedRecord;
use crate::config::KafkaConfig;
use crate::error::{Error, Result};
use crate::telemetry::{RECORDS_EMITTED_TOTAL, RECORDS_FAILED_TOTAL};

/// Receives every aggregated record produced by a flush pass
///
/// `emit` is called from the flush scheduler and must not block on I/O.
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: &AggregatedRecord) -> Result<()>;

    /// Wait up to `timeout` for buffered records to be delivered
    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

// ============================================================================
// Log sink
// ============================================================================

#[derive(Debug, Default)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn emit(&self, record: &AggregatedRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        info!(target: "rtb_aggregator::records", "Agg record {}", json);
        counter!(RECORDS_EMITTED_TOTAL, "sink" => "log").increment(1);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// ============================================================================
// Kafka sink
// ============================================================================

/// Kafka producer for the output topic
#[derive(Clone)]
pub struct KafkaRecordSink {
    producer: FutureProducer,
    topic: String,
    stats: Arc<ProducerStats>,
}

/// Delivery counters, updated from the delivery tasks
#[derive(Debug, Default)]
struct ProducerStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl KafkaRecordSink {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self> {
        info!("Creating Kafka producer for output topic '{}'...", topic);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", "rtb-aggregator")
            // Reliability
            .set("acks", &config.producer.acks)
            .set("retry.backoff.ms", "100")
            // Batching
            .set("linger.ms", config.producer.linger.as_millis().to_string())
            // Compression
            .set("compression.type", &config.producer.compression)
            // Timeouts
            .set(
                "message.timeout.ms",
                config.producer.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| Error::Kafka {
                message: format!("Failed to create producer: {}", e).into(),
                source: Some(e),
            })?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            stats: Arc::new(ProducerStats::default()),
        })
    }

}

impl RecordSink for KafkaRecordSink {
    fn emit(&self, record: &AggregatedRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let key = record.campaign_id.to_string();

        let delivery = self
            .producer
            .send_result(FutureRecord::to(&self.topic).key(&key).payload(&payload))
            .map_err(|(err, _)| {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!(RECORDS_FAILED_TOTAL, "sink" => "kafka").increment(1);
                Error::Kafka {
                    message: format!("Failed to enqueue record: {}", err).into(),
                    source: Some(err),
                }
            })?;

        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => {
                    debug!(
                        "Record delivered to partition {} at offset {}",
                        partition, offset
                    );
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    counter!(RECORDS_EMITTED_TOTAL, "sink" => "kafka").increment(1);
                }
                Ok(Err((err, _))) => {
                    error!("Failed to deliver record: {:?}", err);
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!(RECORDS_FAILED_TOTAL, "sink" => "kafka").increment(1);
                }
                Err(_) => {
                    warn!("Record delivery cancelled, producer dropped");
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!(RECORDS_FAILED_TOTAL, "sink" => "kafka").increment(1);
                }
            }
        });

        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        info!("Flushing Kafka producer...");
        self.producer.flush(Timeout::After(timeout))?;
        info!(
            "Kafka producer flushed ({} delivered, {} failed)",
            self.stats.delivered.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}

// ============================================================================
// Memory sink
// ============================================================================

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AggregatedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far
    pub fn records(&self) -> Vec<AggregatedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything emitted so far
    pub fn take(&self) -> Vec<AggregatedRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &AggregatedRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Pick the sink for this configuration
pub fn from_config(config: &KafkaConfig) -> Result<Arc<dyn RecordSink>> {
    match &config.output_topic {
        Some(topic) => Ok(Arc::new(KafkaRecordSink::new(config, topic)?)),
        None => Ok(Arc::new(LogSink)),
    }
}
