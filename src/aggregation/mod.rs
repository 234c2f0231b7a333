//! Windowed event aggregation
//!
//! The [`Aggregator`] owns one [`CounterStore`] per event category. Broker
//! tasks call [`Aggregator::ingest`] concurrently; the single
//! [`FlushScheduler`] selects elapsed keys, takes their counts out of every
//! store and hands an [`AggregatedRecord`] per key to the sink.
//!
//! ```text
//! payload -> decode -> bucket -> CounterStore::increment_and_get
//!                                      |
//!            FlushScheduler (timer | drain) -> select_keys -> take -> emit
//! ```

pub mod counter_store;
pub mod emitter;
pub mod enrichment;
pub mod scheduler;

pub use counter_store::{AggregationKey, CounterEntry, CounterStore};
pub use emitter::{AggregatedRecord, RecordEmitter};
pub use enrichment::{CreativeRecord, EnrichmentRecord, EnrichmentResolver, ReferenceSnapshot};
pub use scheduler::{FlushHandle, FlushReport, FlushScheduler};

use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::config::KafkaTopics;
use crate::error::{Error, Result};
use crate::events::{self, AdEvent, EventCategory};
use crate::telemetry::{EVENTS_COUNTED_TOTAL, MESSAGES_TOTAL};
use crate::window::{self, WindowInterval};

/// Which keys a flush pass selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Keys whose window starts at or before `boundary_ms`
    Periodic { boundary_ms: i64 },
    /// Every key
    Drain,
}

impl FlushMode {
    /// Periodic pass for the wall-clock instant `now`
    ///
    /// Selects every window up to and including the one just before the
    /// in-progress window; only the in-progress window is kept.
    pub fn periodic(now: DateTime<Utc>, interval: WindowInterval) -> Self {
        FlushMode::Periodic {
            boundary_ms: window::previous_window_start(now, interval),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Periodic { .. } => "periodic",
            FlushMode::Drain => "drain",
        }
    }

    fn selects(&self, key: &AggregationKey) -> bool {
        match self {
            FlushMode::Periodic { boundary_ms } => key.window_start_epoch_ms <= *boundary_ms,
            FlushMode::Drain => true,
        }
    }
}

/// Entries removed from every store for one key, indexed by category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakenCounts {
    entries: [Option<CounterEntry>; 4],
}

impl TakenCounts {
    pub fn count(&self, category: EventCategory) -> u64 {
        self.entries[category as usize].map_or(0, |entry| entry.count)
    }

    /// Window start from the first category with a non-zero count, in
    /// bid, win, pixel, click order
    pub fn window_start_time(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| entry.count > 0)
            .map(|entry| entry.window_start_time)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

/// The aggregation service instance, shared by `Arc`
#[derive(Debug)]
pub struct Aggregator {
    stores: [CounterStore; 4],
    interval: WindowInterval,
    topics: KafkaTopics,
    /// `true` while accepting. Increments hold the read lock so `close`
    /// returns only once none is in progress.
    accepting: RwLock<bool>,
}

impl Aggregator {
    pub fn new(interval: WindowInterval, topics: KafkaTopics) -> Self {
        Self {
            stores: Default::default(),
            interval,
            topics,
            accepting: RwLock::new(true),
        }
    }

    pub fn interval(&self) -> WindowInterval {
        self.interval
    }

    pub fn topics(&self) -> &KafkaTopics {
        &self.topics
    }

    pub fn store(&self, category: EventCategory) -> &CounterStore {
        &self.stores[category as usize]
    }

    /// Count one raw message from `topic`, returning the key's new count
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<u64> {
        let category = self.topics.category_for(topic);
        let result = match category {
            Some(category) => {
                events::decode(category, payload).and_then(|event| self.record(&event))
            }
            None => Err(Error::UnknownTopic {
                topic: topic.to_string(),
            }),
        };

        let label = category.as_ref().map_or("unknown", EventCategory::as_str);
        let outcome = match &result {
            Ok(_) => "COUNTED",
            Err(e) => e.error_code(),
        };
        counter!(MESSAGES_TOTAL, "category" => label, "outcome" => outcome).increment(1);
        result
    }

    /// Count an already decoded event
    pub fn record(&self, event: &AdEvent) -> Result<u64> {
        let category = event.category;
        let window = window::bucket(event.event_epoch_ms, self.interval).ok_or_else(|| {
            Error::decode(
                category.as_str(),
                format!("no window for timestamp {}", event.event_epoch_ms),
            )
        })?;
        let start_time = window.start_time;
        let key = AggregationKey::new(event.campaign_id, event.creative_id, &window);

        let accepting = self.accepting.read().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(Error::AggregatorClosed);
        }
        let count = self.store(category).increment_and_get(key, start_time);
        drop(accepting);

        counter!(EVENTS_COUNTED_TOTAL, "category" => category.as_str()).increment(1);
        Ok(count)
    }

    /// Union of the keys selected by `mode` across all four stores
    pub fn select_keys(&self, mode: FlushMode) -> HashSet<AggregationKey> {
        let mut keys = HashSet::new();
        for store in &self.stores {
            keys.extend(store.snapshot_keys(|key, _| mode.selects(key)));
        }
        keys
    }

    /// Remove `key` from every store and return what was counted
    pub fn take(&self, key: &AggregationKey) -> TakenCounts {
        TakenCounts {
            entries: EventCategory::ALL.map(|category| self.store(category).remove(key)),
        }
    }

    /// Stop accepting events; waits for in-progress increments
    pub fn close(&self) {
        let mut accepting = self.accepting.write().unwrap_or_else(PoisonError::into_inner);
        *accepting = false;
    }

    pub fn is_closed(&self) -> bool {
        !*self.accepting.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Distinct keys currently held in any store
    pub fn pending_keys(&self) -> usize {
        self.select_keys(FlushMode::Drain).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> Aggregator {
        Aggregator::new(WindowInterval::FIVE_MINUTES, KafkaTopics::default())
    }

    #[test]
    fn test_ingest_routes_by_topic() {
        let agg = aggregator();
        let bid = br#"{"adid":"10","crid":"20","timestamp":1000000000000}"#;
        let win = br#"{"adId":"10","cridId":"20","timestamp":1000000002000}"#;

        assert_eq!(agg.ingest("bids", bid).unwrap(), 1);
        assert_eq!(agg.ingest("bids", bid).unwrap(), 2);
        assert_eq!(agg.ingest("wins", win).unwrap(), 1);

        assert_eq!(agg.store(EventCategory::Bid).len(), 1);
        assert_eq!(agg.store(EventCategory::Win).len(), 1);
        assert!(agg.store(EventCategory::Pixel).is_empty());
        assert_eq!(agg.pending_keys(), 1);
    }

    #[test]
    fn test_unknown_topic_and_bad_payload() {
        let agg = aggregator();
        let err = agg.ingest("impressions", b"{}").unwrap_err();
        assert!(matches!(err, Error::UnknownTopic { .. }));
        assert_eq!(err.error_code(), "UNKNOWN_TOPIC");

        let err = agg.ingest("clicks", b"{\"ad_id\":").unwrap_err();
        assert!(matches!(err, Error::EventDecode { topic: "clicks", .. }));
        assert_eq!(err.error_code(), "DECODE_ERROR");
        assert_eq!(agg.pending_keys(), 0);
    }

    #[test]
    fn test_custom_topic_names() {
        let topics = KafkaTopics {
            bids: "rtb.bids".to_string(),
            ..KafkaTopics::default()
        };
        let agg = Aggregator::new(WindowInterval::FIVE_MINUTES, topics);
        let bid = br#"{"adid":1,"crid":2,"timestamp":0}"#;
        assert!(agg.ingest("rtb.bids", bid).is_ok());
        assert!(agg.ingest("bids", bid).is_err());
    }

    #[test]
    fn test_select_keys_by_mode() {
        let agg = aggregator();
        let old = br#"{"adid":1,"crid":1,"timestamp":1000000000000}"#;
        let new = br#"{"ad_id":1,"creative_id":1,"timestamp":1000000900000}"#;
        agg.ingest("bids", old).unwrap();
        agg.ingest("pixels", new).unwrap();

        let periodic = agg.select_keys(FlushMode::Periodic {
            boundary_ms: 1_000_000_200_000,
        });
        assert_eq!(periodic.len(), 1);
        assert!(periodic.iter().all(|k| k.window_start_epoch_ms <= 1_000_000_200_000));

        assert_eq!(agg.select_keys(FlushMode::Drain).len(), 2);
    }

    #[test]
    fn test_take_removes_from_every_store() {
        let agg = aggregator();
        agg.ingest("bids", br#"{"adid":1,"crid":2,"timestamp":1000000000000}"#)
            .unwrap();
        agg.ingest("clicks", br#"{"ad_id":1,"creative_id":2,"timestamp":1000000001000}"#)
            .unwrap();

        let keys = agg.select_keys(FlushMode::Drain);
        assert_eq!(keys.len(), 1);
        let key = keys.into_iter().next().unwrap();

        let taken = agg.take(&key);
        assert_eq!(taken.count(EventCategory::Bid), 1);
        assert_eq!(taken.count(EventCategory::Win), 0);
        assert_eq!(taken.count(EventCategory::Click), 1);
        assert!(!taken.is_empty());
        assert_eq!(agg.pending_keys(), 0);

        assert!(agg.take(&key).is_empty());
    }

    #[test]
    fn test_window_start_priority() {
        let agg = aggregator();
        agg.ingest("pixels", br#"{"ad_id":5,"creative_id":6,"timestamp":1000000000000}"#)
            .unwrap();
        let key = agg.select_keys(FlushMode::Drain).into_iter().next().unwrap();
        let taken = agg.take(&key);
        assert_eq!(
            taken.window_start_time().map(|t| t.timestamp_millis()),
            Some(key.window_start_epoch_ms)
        );
        assert_eq!(TakenCounts::default().window_start_time(), None);
    }

    #[test]
    fn test_closed_aggregator_rejects() {
        let agg = aggregator();
        assert!(!agg.is_closed());
        agg.close();
        assert!(agg.is_closed());

        let err = agg
            .ingest("bids", br#"{"adid":1,"crid":2,"timestamp":0}"#)
            .unwrap_err();
        assert!(matches!(err, Error::AggregatorClosed));
        assert!(!err.should_acknowledge());
        assert_eq!(agg.pending_keys(), 0);
    }

    #[test]
    fn test_periodic_mode_boundary() {
        let now = DateTime::from_timestamp(1_577_837_250, 0).unwrap();
        assert_eq!(
            FlushMode::periodic(now, WindowInterval::FIVE_MINUTES),
            FlushMode::Periodic {
                boundary_ms: 1_577_836_800_000
            }
        );
        assert_eq!(FlushMode::Drain.as_str(), "drain");
    }
}
