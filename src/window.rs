//! Fixed-length time windows
//!
//! Events are grouped into tumbling windows aligned to the Unix epoch. A
//! window is identified by its start; the label is the start rendered as a
//! fixed-width UTC timestamp (`2020-01-01T00:05:00Z`).

use chrono::{DateTime, SecondsFormat, Utc};

/// 0000-01-01T00:00:00Z, the earliest instant with a four-digit year
pub const MIN_EVENT_EPOCH_MS: i64 = -62_167_219_200_000;
/// 9999-12-31T23:59:59.999Z, the latest instant with a four-digit year
pub const MAX_EVENT_EPOCH_MS: i64 = 253_402_300_799_999;

/// Whether a timestamp falls in the range that renders as a fixed-width label
pub fn in_label_range(epoch_ms: i64) -> bool {
    (MIN_EVENT_EPOCH_MS..=MAX_EVENT_EPOCH_MS).contains(&epoch_ms)
}

/// Length of an aggregation window, always at least one second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowInterval(u32);

impl WindowInterval {
    /// The five minute window used in production
    pub const FIVE_MINUTES: WindowInterval = WindowInterval(300);

    /// Returns `None` for a zero-length interval
    pub fn from_secs(secs: u32) -> Option<Self> {
        (secs > 0).then_some(Self(secs))
    }

    pub fn secs(&self) -> i64 {
        i64::from(self.0)
    }

    pub fn millis(&self) -> i64 {
        self.secs() * 1000
    }

    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.0))
    }
}

impl Default for WindowInterval {
    fn default() -> Self {
        Self::FIVE_MINUTES
    }
}

/// The window an event falls into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub label: String,
    pub start_epoch_ms: i64,
    pub start_time: DateTime<Utc>,
}

/// Map an event timestamp to its window
///
/// `floor(event_secs / interval) * interval`, with sub-second precision
/// discarded first. Returns `None` when the event or its window start lies
/// outside years 0000 to 9999.
pub fn bucket(event_epoch_ms: i64, interval: WindowInterval) -> Option<Window> {
    if !in_label_range(event_epoch_ms) {
        return None;
    }
    let event_secs = event_epoch_ms.div_euclid(1000);
    let start_secs = event_secs.div_euclid(interval.secs()) * interval.secs();
    if !in_label_range(start_secs * 1000) {
        return None;
    }
    let start_time = DateTime::from_timestamp(start_secs, 0)?;

    Some(Window {
        label: start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        start_epoch_ms: start_secs * 1000,
        start_time,
    })
}

/// Start (epoch ms) of the window that precedes the one containing `now`
///
/// Every window starting at or before this boundary has fully elapsed.
pub fn previous_window_start(now: DateTime<Utc>, interval: WindowInterval) -> i64 {
    let current = now
        .timestamp()
        .div_euclid(interval.secs())
        * interval.secs()
        * 1000;
    current - interval.millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_mid_window() {
        // 2020-01-01T00:07:30Z
        let window = bucket(1_577_837_250_000, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(window.start_epoch_ms, 1_577_837_100_000);
        assert_eq!(window.label, "2020-01-01T00:05:00Z");
        assert_eq!(window.start_time.timestamp(), 1_577_837_100);
    }

    #[test]
    fn test_bucket_previous_day() {
        // 2019-12-31T23:47:30Z
        let window = bucket(1_577_836_050_000, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(window.start_epoch_ms, 1_577_835_900_000);
        assert_eq!(window.label, "2019-12-31T23:45:00Z");
    }

    #[test]
    fn test_bucket_boundaries() {
        let interval = WindowInterval::FIVE_MINUTES;
        let start = bucket(1_000_000_200_000, interval).unwrap();
        assert_eq!(start.start_epoch_ms, 1_000_000_200_000);

        let last_ms = bucket(1_000_000_499_999, interval).unwrap();
        assert_eq!(last_ms.start_epoch_ms, 1_000_000_200_000);

        let next = bucket(1_000_000_500_000, interval).unwrap();
        assert_eq!(next.start_epoch_ms, 1_000_000_500_000);
    }

    #[test]
    fn test_bucket_is_idempotent() {
        for ms in [0, 999, 1_000_000_000_000, 1_577_837_250_123, 1_700_000_123_456] {
            for secs in [1, 60, 300, 3600] {
                let interval = WindowInterval::from_secs(secs).unwrap();
                let first = bucket(ms, interval).unwrap();
                let second = bucket(first.start_epoch_ms, interval).unwrap();
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_bucket_before_epoch_floors() {
        let window = bucket(-1, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(window.start_epoch_ms, -300_000);
        assert_eq!(window.label, "1969-12-31T23:55:00Z");
    }

    #[test]
    fn test_bucket_out_of_range() {
        assert!(bucket(i64::MAX, WindowInterval::FIVE_MINUTES).is_none());
    }

    #[test]
    fn test_label_is_fixed_width() {
        let window = bucket(0, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(window.label, "1970-01-01T00:00:00Z");
        assert_eq!(window.label.len(), 20);

        let last = bucket(MAX_EVENT_EPOCH_MS, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(last.label, "9999-12-31T23:55:00Z");
        let first = bucket(MIN_EVENT_EPOCH_MS, WindowInterval::FIVE_MINUTES).unwrap();
        assert_eq!(first.label, "0000-01-01T00:00:00Z");
    }

    #[test]
    fn test_five_digit_years_have_no_window() {
        // Microseconds sent where milliseconds are expected
        assert!(bucket(1_700_000_000_000_000, WindowInterval::FIVE_MINUTES).is_none());
        assert!(bucket(MAX_EVENT_EPOCH_MS + 1, WindowInterval::FIVE_MINUTES).is_none());
        assert!(bucket(MIN_EVENT_EPOCH_MS - 1, WindowInterval::FIVE_MINUTES).is_none());
        // A window that would start before year 0000
        let week = WindowInterval::from_secs(7 * 24 * 3600).unwrap();
        assert!(bucket(MIN_EVENT_EPOCH_MS, week).is_none());
    }

    #[test]
    fn test_previous_window_start() {
        let now = DateTime::from_timestamp(1_577_837_250, 0).unwrap();
        assert_eq!(
            previous_window_start(now, WindowInterval::FIVE_MINUTES),
            1_577_836_800_000
        );

        let on_boundary = DateTime::from_timestamp(1_577_837_100, 0).unwrap();
        assert_eq!(
            previous_window_start(on_boundary, WindowInterval::FIVE_MINUTES),
            1_577_836_800_000
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(WindowInterval::from_secs(0).is_none());
        assert_eq!(WindowInterval::from_secs(60).unwrap().millis(), 60_000);
    }
}
