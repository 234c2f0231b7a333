//! Campaign attribute lookup
//!
//! The reference snapshot is loaded once at startup and never changes, so
//! lookups are plain `HashMap` reads with no locking.

use std::collections::HashMap;

/// One row of the campaign × creative join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreativeRecord {
    pub campaign_id: i64,
    pub creative_id: i64,
    pub region: Option<String>,
}

/// All runnable campaign creatives, banners and videos kept apart
#[derive(Debug, Clone, Default)]
pub struct ReferenceSnapshot {
    pub banners: Vec<CreativeRecord>,
    pub videos: Vec<CreativeRecord>,
}

impl ReferenceSnapshot {
    pub fn len(&self) -> usize {
        self.banners.len() + self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banners.is_empty() && self.videos.is_empty()
    }
}

/// Descriptive attributes attached to an aggregated record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentRecord {
    pub region: Option<String>,
}

#[derive(Debug, Default)]
pub struct EnrichmentResolver {
    by_creative: HashMap<i64, EnrichmentRecord>,
    by_pair: HashMap<(i64, i64), EnrichmentRecord>,
}

impl EnrichmentResolver {
    pub fn new(snapshot: &ReferenceSnapshot) -> Self {
        let mut by_creative = HashMap::with_capacity(snapshot.len());
        let mut by_pair = HashMap::with_capacity(snapshot.len());

        // Banners take precedence over videos, and the first row wins within
        // each list.
        for record in snapshot.banners.iter().chain(snapshot.videos.iter()) {
            let attributes = EnrichmentRecord {
                region: record.region.clone(),
            };
            by_creative
                .entry(record.creative_id)
                .or_insert_with(|| attributes.clone());
            by_pair
                .entry((record.campaign_id, record.creative_id))
                .or_insert(attributes);
        }

        Self {
            by_creative,
            by_pair,
        }
    }

    /// Attributes for a campaign creative; an empty record when unknown
    pub fn resolve(&self, campaign_id: i64, creative_id: i64) -> EnrichmentRecord {
        self.by_creative
            .get(&creative_id)
            .or_else(|| self.by_pair.get(&(campaign_id, creative_id)))
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_creative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_creative.is_empty()
    }
}
