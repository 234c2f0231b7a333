//! Kafka consumer for the four event topics
//!
//! Every partition of every input topic gets its own queue and task, so
//! messages within a partition are processed in order while partitions run
//! concurrently. Offsets are stored by hand once a message has been counted
//! (or discarded as bad) and committed by librdkafka's auto-commit, which
//! gives at-least-once delivery into the counters.

use crate::aggregation::Aggregator;
use crate::config::KafkaConfig;
use crate::error::{Error, Result};
use crate::events::EventCategory;
use crate::telemetry::MESSAGES_TOTAL;
use metrics::counter;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{
    Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long to wait for topic metadata at startup
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a consumer error before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

type AggregatorConsumer = StreamConsumer<AggregatorConsumerContext>;

/// Logs rebalances and commit failures
pub struct AggregatorConsumerContext;

impl ClientContext for AggregatorConsumerContext {}

impl ConsumerContext for AggregatorConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => info!("Partition revocation: {} partitions", tpl.count()),
            Rebalance::Assign(tpl) => info!("Partition assignment: {} partitions", tpl.count()),
            Rebalance::Error(err) => error!("Rebalance error: {}", err),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned: Vec<String> = tpl
                .elements()
                .iter()
                .map(|elem| format!("{}/{}", elem.topic(), elem.partition()))
                .collect();
            info!("Assigned partitions: {:?}", assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            warn!("Offset commit failed: {}", err);
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Broker-independent view of a delivered message
#[derive(Debug, Clone, Copy)]
pub struct BrokerMessage<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<&'a [u8]>,
    pub payload: Option<&'a [u8]>,
}

impl<'a> BrokerMessage<'a> {
    pub fn from_borrowed(message: &'a BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key(),
            payload: message.payload(),
        }
    }
}

/// Whether a message's offset may be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Counted, or bad and discarded
    Store,
    /// Not counted; redeliver after restart
    Withhold,
}

/// Feed one message to the aggregator and decide its acknowledgement
pub fn dispatch(aggregator: &Aggregator, message: &BrokerMessage<'_>) -> Acknowledgement {
    let Some(payload) = message.payload else {
        let category = aggregator.topics().category_for(message.topic);
        let label = category.as_ref().map_or("unknown", EventCategory::as_str);
        counter!(MESSAGES_TOTAL, "category" => label, "outcome" => "EMPTY_PAYLOAD")
            .increment(1);
        warn!(
            "Discarding empty message at {}/{}@{}",
            message.topic, message.partition, message.offset
        );
        return Acknowledgement::Store;
    };

    match aggregator.ingest(message.topic, payload) {
        Ok(count) => {
            debug!(
                "Counted {}/{}@{} (count {})",
                message.topic, message.partition, message.offset, count
            );
            Acknowledgement::Store
        }
        Err(e) if e.should_acknowledge() => {
            warn!(
                "Discarding message at {}/{}@{}: {}",
                message.topic, message.partition, message.offset, e
            );
            debug!("Discarded payload: {}", String::from_utf8_lossy(payload));
            Acknowledgement::Store
        }
        Err(e) => {
            debug!(
                "Leaving {}/{}@{} unacknowledged: {}",
                message.topic, message.partition, message.offset, e
            );
            Acknowledgement::Withhold
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// librdkafka settings for the aggregator's consumer group
pub fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("client.id", "rtb-aggregator")
        .set("enable.partition.eof", "false")
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        )
        // Offsets are stored after the increment, committed in the background
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", config.offset_reset.as_rdkafka())
        .set_log_level(RDKafkaLogLevel::Warning);
    client_config
}

/// Running consumer: one task per partition plus the main queue driver
pub struct KafkaIngest {
    tracker: TaskTracker,
    cancel: CancellationToken,
    partitions: usize,
}

impl KafkaIngest {
    /// Connect, check every topic exists, subscribe and start consuming
    pub async fn start(config: &KafkaConfig, aggregator: Arc<Aggregator>) -> Result<Self> {
        info!("Creating Kafka consumer (group {})...", config.group_id);
        let consumer: AggregatorConsumer = consumer_config(config)
            .create_with_context(AggregatorConsumerContext)
            .map_err(|e| Error::Kafka {
                message: format!("Failed to create consumer: {}", e).into(),
                source: Some(e),
            })?;
        let consumer = Arc::new(consumer);

        let topics = config.topics.all();
        let mut assignments = Vec::new();
        for topic in topics {
            let partitions = partition_ids(&consumer, topic)?;
            info!("Topic '{}': {} partitions", topic, partitions.len());
            assignments.extend(partitions.into_iter().map(|p| (topic.to_string(), p)));
        }

        consumer.subscribe(&topics).map_err(|e| Error::Kafka {
            message: format!("Failed to subscribe to {:?}: {}", topics, e).into(),
            source: Some(e),
        })?;

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let mut partitions = 0;

        for (topic, partition) in assignments {
            let Some(queue) = consumer.split_partition_queue(&topic, partition) else {
                warn!("Could not split queue for {}/{}", topic, partition);
                continue;
            };
            tracker.spawn(consume_partition(
                Arc::clone(&consumer),
                queue,
                Arc::clone(&aggregator),
                cancel.clone(),
                topic,
                partition,
            ));
            partitions += 1;
        }

        // The main queue must be polled for rebalances and callbacks; it also
        // delivers messages from partitions that were not split above.
        tracker.spawn(drive_main_queue(
            Arc::clone(&consumer),
            Arc::clone(&aggregator),
            cancel.clone(),
        ));
        tracker.close();

        info!("✅ Consuming {} partitions", partitions);

        Ok(Self {
            tracker,
            cancel,
            partitions,
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Resolves when consumption stops, normally only after `shutdown`
    pub async fn stopped(&self) {
        self.tracker.wait().await
    }

    /// Cancel every consumer task and wait for them, up to `timeout`
    ///
    /// Returns false if the tasks did not finish in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        info!("Stopping {} partition consumers...", self.partitions);
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("✅ Kafka consumers stopped");
                true
            }
            Err(_) => {
                warn!("⚠️ Kafka consumers did not stop within {:?}", timeout);
                false
            }
        }
    }
}

/// Partition ids of `topic`; a missing or empty topic is an error
fn partition_ids(consumer: &AggregatorConsumer, topic: &str) -> Result<Vec<i32>> {
    let metadata = consumer
        .fetch_metadata(Some(topic), Timeout::After(METADATA_TIMEOUT))
        .map_err(|e| Error::Kafka {
            message: format!("Failed to fetch metadata for topic '{}': {}", topic, e).into(),
            source: Some(e),
        })?;

    let Some(entry) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Err(Error::TopicNotFound {
            topic: topic.to_string(),
        });
    };
    if let Some(err) = entry.error() {
        warn!("Metadata error for topic '{}': {:?}", topic, err);
        return Err(Error::TopicNotFound {
            topic: topic.to_string(),
        });
    }
    if entry.partitions().is_empty() {
        return Err(Error::TopicNotFound {
            topic: topic.to_string(),
        });
    }

    Ok(entry.partitions().iter().map(|p| p.id()).collect())
}

async fn consume_partition(
    consumer: Arc<AggregatorConsumer>,
    queue: StreamPartitionQueue<AggregatorConsumerContext>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
    topic: String,
    partition: i32,
) {
    debug!("Partition consumer {}/{} started", topic, partition);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = queue.recv() => match result {
                Ok(message) => handle_message(&consumer, &aggregator, &message),
                Err(e) => {
                    error!("Kafka error on {}/{}: {}", topic, partition, e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            },
        }
    }
    debug!("Partition consumer {}/{} stopped", topic, partition);
}

async fn drive_main_queue(
    consumer: Arc<AggregatorConsumer>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = consumer.recv() => match result {
                Ok(message) => handle_message(&consumer, &aggregator, &message),
                Err(e) => {
                    error!("Kafka error: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            },
        }
    }
}

fn handle_message(
    consumer: &AggregatorConsumer,
    aggregator: &Aggregator,
    message: &BorrowedMessage<'_>,
) {
    let view = BrokerMessage::from_borrowed(message);
    if dispatch(aggregator, &view) == Acknowledgement::Store {
        if let Err(e) = consumer.store_offset_from_message(message) {
            warn!(
                "Failed to store offset {}/{}@{}: {}",
                view.topic, view.partition, view.offset, e
            );
        }
    }
}
