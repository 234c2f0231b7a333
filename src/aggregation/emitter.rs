//! Aggregated record assembly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{AggregationKey, EnrichmentResolver, TakenCounts};
use crate::error::Result;
use crate::events::EventCategory;
use crate::sink::RecordSink;

/// One output row per flushed key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedRecord {
    pub campaign_id: i64,
    pub creative_id: i64,
    /// Window label
    pub interval: String,
    /// Empty when the creative is unknown
    pub region: String,
    /// Window start
    pub timestamp: DateTime<Utc>,
    /// Emission time
    pub db_timestamp: DateTime<Utc>,
    pub bids: u64,
    pub wins: u64,
    pub pixels: u64,
    pub clicks: u64,
}

impl AggregatedRecord {
    pub fn count(&self, category: EventCategory) -> u64 {
        match category {
            EventCategory::Bid => self.bids,
            EventCategory::Win => self.wins,
            EventCategory::Pixel => self.pixels,
            EventCategory::Click => self.clicks,
        }
    }
}

/// Builds records from taken counts and hands them to the sink
pub struct RecordEmitter {
    resolver: Arc<EnrichmentResolver>,
    sink: Arc<dyn RecordSink>,
}

impl RecordEmitter {
    pub fn new(resolver: Arc<EnrichmentResolver>, sink: Arc<dyn RecordSink>) -> Self {
        Self { resolver, sink }
    }

    pub fn build(
        &self,
        key: &AggregationKey,
        counts: &TakenCounts,
        now: DateTime<Utc>,
    ) -> AggregatedRecord {
        let enrichment = self.resolver.resolve(key.campaign_id, key.creative_id);

        AggregatedRecord {
            campaign_id: key.campaign_id,
            creative_id: key.creative_id,
            interval: key.window_label.clone(),
            region: enrichment.region.unwrap_or_default(),
            timestamp: counts.window_start_time().unwrap_or(now),
            db_timestamp: now,
            bids: counts.count(EventCategory::Bid),
            wins: counts.count(EventCategory::Win),
            pixels: counts.count(EventCategory::Pixel),
            clicks: counts.count(EventCategory::Click),
        }
    }

    /// Build and emit the record for `key`, stamped with the current time
    pub fn emit(&self, key: &AggregationKey, counts: &TakenCounts) -> Result<AggregatedRecord> {
        let record = self.build(key, counts, Utc::now());
        tracing::debug!("Writing entry key {:?}", key);
        self.sink.emit(&record)?;
        Ok(record)
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }
}
