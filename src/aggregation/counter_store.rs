//! Per-category counter store
//!
//! A sharded concurrent map from [`AggregationKey`] to [`CounterEntry`]. The
//! create-if-absent and increment happen under one shard lock, so concurrent
//! first-time increments of the same key can never lose a count.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

use crate::window::Window;

/// Grouping key shared by all four stores
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub campaign_id: i64,
    pub creative_id: i64,
    pub window_label: String,
    pub window_start_epoch_ms: i64,
}

impl AggregationKey {
    pub fn new(campaign_id: i64, creative_id: i64, window: &Window) -> Self {
        Self {
            campaign_id,
            creative_id,
            window_label: window.label.clone(),
            window_start_epoch_ms: window.start_epoch_ms,
        }
    }
}

/// Running count for one key in one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub window_start_epoch_ms: i64,
    pub window_start_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CounterStore {
    entries: DashMap<AggregationKey, CounterEntry>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry at zero if absent, add one, and return the new count
    pub fn increment_and_get(&self, key: AggregationKey, start_time: DateTime<Utc>) -> u64 {
        let window_start_epoch_ms = key.window_start_epoch_ms;
        let mut entry = self.entries.entry(key).or_insert_with(|| CounterEntry {
            count: 0,
            window_start_epoch_ms,
            window_start_time: start_time,
        });
        entry.count += 1;
        entry.count
    }

    /// Keys whose entry satisfies `predicate`, without removing anything
    ///
    /// Keys inserted while the scan runs may or may not be included.
    pub fn snapshot_keys<F>(&self, predicate: F) -> HashSet<AggregationKey>
    where
        F: Fn(&AggregationKey, &CounterEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|item| predicate(item.key(), item.value()))
            .map(|item| item.key().clone())
            .collect()
    }

    /// Remove and return the entry; removing an absent key is a no-op
    pub fn remove(&self, key: &AggregationKey) -> Option<CounterEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn get(&self, key: &AggregationKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{bucket, WindowInterval};
    use std::sync::Arc;

    fn key(campaign: i64, creative: i64, ms: i64) -> (AggregationKey, DateTime<Utc>) {
        let window = bucket(ms, WindowInterval::FIVE_MINUTES).unwrap();
        (AggregationKey::new(campaign, creative, &window), window.start_time)
    }

    #[test]
    fn test_increment_creates_and_counts() {
        let store = CounterStore::new();
        let (k, start) = key(10, 20, 1_000_000_000_000);

        assert_eq!(store.increment_and_get(k.clone(), start), 1);
        assert_eq!(store.increment_and_get(k.clone(), start), 2);
        assert_eq!(store.increment_and_get(k.clone(), start), 3);

        let entry = store.get(&k).unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.window_start_epoch_ms, k.window_start_epoch_ms);
        assert_eq!(entry.window_start_time, start);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_same_window_shares_key() {
        let store = CounterStore::new();
        let (a, start) = key(1, 2, 1_577_837_250_000);
        let (b, _) = key(1, 2, 1_577_837_399_999);
        assert_eq!(a, b);

        store.increment_and_get(a, start);
        assert_eq!(store.increment_and_get(b, start), 2);
    }

    #[test]
    fn test_remove_is_idempotent_and_resets() {
        let store = CounterStore::new();
        let (k, start) = key(1, 1, 0);
        store.increment_and_get(k.clone(), start);
        store.increment_and_get(k.clone(), start);

        assert_eq!(store.remove(&k).map(|e| e.count), Some(2));
        assert_eq!(store.remove(&k), None);
        assert!(store.is_empty());

        assert_eq!(store.increment_and_get(k, start), 1);
    }

    #[test]
    fn test_snapshot_keys_does_not_remove() {
        let store = CounterStore::new();
        let (old, old_start) = key(1, 1, 1_000_000_000_000);
        let (new, new_start) = key(1, 1, 1_000_000_600_000);
        store.increment_and_get(old.clone(), old_start);
        store.increment_and_get(new.clone(), new_start);

        let boundary = old.window_start_epoch_ms;
        let selected = store.snapshot_keys(|_, entry| entry.window_start_epoch_ms <= boundary);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains(&old));
        assert_eq!(store.len(), 2);

        assert_eq!(store.snapshot_keys(|_, _| true).len(), 2);
    }

    #[test]
    fn test_concurrent_first_increments() {
        let store = Arc::new(CounterStore::new());
        let (k, start) = key(7, 8, 1_577_837_250_000);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let k = k.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.increment_and_get(k.clone(), start);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(store.get(&k).unwrap().count, 8000);
    }
}
