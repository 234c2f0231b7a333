//! Event Schemas and Decoding
//!
//! Each input topic carries one advertising lifecycle event per message, JSON
//! encoded. The producers are not consistent about field names or about
//! whether identifiers are JSON numbers or strings, so every topic has its own
//! wire struct and identifiers are coerced to integers on the way in.
//!
//! | topic  | campaign | creative    | extra                              |
//! |--------|----------|-------------|------------------------------------|
//! | bids   | adid     | crid        | adtype, domain, exchange, cost     |
//! | wins   | adId     | cridId      | adtype, pubId, cost, price, domain |
//! | pixels | ad_id    | creative_id | exchange, domain                   |
//! | clicks | ad_id    | creative_id | exchange, domain                   |
//!
//! All four carry `timestamp` in epoch milliseconds.

use crate::error::{Error, Result};
use crate::window;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

// ============================================================================
// Categories
// ============================================================================

/// The four event streams that are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Bid,
    Win,
    Pixel,
    Click,
}

impl EventCategory {
    /// Every category, in record priority order
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Bid,
        EventCategory::Win,
        EventCategory::Pixel,
        EventCategory::Click,
    ];

    /// Plural name, matching the default topic and the output record field
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Bid => "bids",
            EventCategory::Win => "wins",
            EventCategory::Pixel => "pixels",
            EventCategory::Click => "clicks",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Wire formats
// ============================================================================

/// Message format of the bids topic
#[derive(Debug, Clone, Deserialize)]
pub struct BidFields {
    #[serde(rename = "adid", deserialize_with = "lenient_i64")]
    pub campaign_id: i64,
    #[serde(rename = "crid", deserialize_with = "lenient_i64")]
    pub creative_id: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub timestamp: i64,
    #[serde(default)]
    pub adtype: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64_opt")]
    pub cost: Option<f64>,
}

/// Message format of the wins topic
#[derive(Debug, Clone, Deserialize)]
pub struct WinFields {
    #[serde(rename = "adId", deserialize_with = "lenient_i64")]
    pub campaign_id: i64,
    #[serde(rename = "cridId", deserialize_with = "lenient_i64")]
    pub creative_id: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub timestamp: i64,
    #[serde(default)]
    pub adtype: Option<String>,
    /// The exchange that reported the win
    #[serde(rename = "pubId", default)]
    pub exchange: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64_opt")]
    pub cost: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64_opt")]
    pub price: Option<f64>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Message format shared by the pixels and clicks topics
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingFields {
    #[serde(rename = "ad_id", deserialize_with = "lenient_i64")]
    pub campaign_id: i64,
    #[serde(rename = "creative_id", deserialize_with = "lenient_i64")]
    pub creative_id: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub timestamp: i64,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A fully parsed message, extra fields included
#[derive(Debug, Clone)]
pub enum WireEvent {
    Bid(BidFields),
    Win(WinFields),
    Pixel(TrackingFields),
    Click(TrackingFields),
}

impl WireEvent {
    /// Parse a payload using the schema of `category`
    pub fn parse(category: EventCategory, payload: &[u8]) -> Result<Self> {
        match category {
            EventCategory::Bid => parse_json(category, payload).map(WireEvent::Bid),
            EventCategory::Win => parse_json(category, payload).map(WireEvent::Win),
            EventCategory::Pixel => parse_json(category, payload).map(WireEvent::Pixel),
            EventCategory::Click => parse_json(category, payload).map(WireEvent::Click),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            WireEvent::Bid(_) => EventCategory::Bid,
            WireEvent::Win(_) => EventCategory::Win,
            WireEvent::Pixel(_) => EventCategory::Pixel,
            WireEvent::Click(_) => EventCategory::Click,
        }
    }

    /// `(campaign, creative, timestamp_ms)`
    fn identity(&self) -> (i64, i64, i64) {
        match self {
            WireEvent::Bid(f) => (f.campaign_id, f.creative_id, f.timestamp),
            WireEvent::Win(f) => (f.campaign_id, f.creative_id, f.timestamp),
            WireEvent::Pixel(f) | WireEvent::Click(f) => {
                (f.campaign_id, f.creative_id, f.timestamp)
            }
        }
    }
}

// ============================================================================
// Canonical event
// ============================================================================

/// What the aggregator needs from any message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdEvent {
    pub category: EventCategory,
    pub campaign_id: i64,
    pub creative_id: i64,
    pub event_epoch_ms: i64,
}

impl TryFrom<&WireEvent> for AdEvent {
    type Error = Error;

    fn try_from(event: &WireEvent) -> Result<Self> {
        let category = event.category();
        let (campaign_id, creative_id, event_epoch_ms) = event.identity();

        if !window::in_label_range(event_epoch_ms) {
            return Err(Error::decode(
                category.as_str(),
                format!("timestamp {} is out of range", event_epoch_ms),
            ));
        }

        Ok(Self {
            category,
            campaign_id,
            creative_id,
            event_epoch_ms,
        })
    }
}

/// Decode a payload into the canonical event for `category`
pub fn decode(category: EventCategory, payload: &[u8]) -> Result<AdEvent> {
    AdEvent::try_from(&WireEvent::parse(category, payload)?)
}

fn parse_json<T: DeserializeOwned>(category: EventCategory, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::decode(category.as_str(), format!("JSON unmarshaling failed: {}", e)))
}

// ============================================================================
// Lenient number parsing
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Float(f64),
    Str(String),
}

fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Int(v) => Ok(v),
        NumberOrString::Float(v) => Err(de::Error::custom(format!(
            "expected an integer, found {}",
            v
        ))),
        NumberOrString::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid integer string {:?}", s))),
    }
}

fn lenient_f64_opt<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Int(v)) => Ok(Some(v as f64)),
        Some(NumberOrString::Float(v)) => Ok(Some(v)),
        Some(NumberOrString::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid number string {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bid_with_string_ids() {
        let payload = br#"{"adid":"10","crid":"20","adtype":"banner","domain":"example.com","exchange":"nexage","cost":0.5,"timestamp":1000000000000}"#;
        let event = decode(EventCategory::Bid, payload).unwrap();
        assert_eq!(
            event,
            AdEvent {
                category: EventCategory::Bid,
                campaign_id: 10,
                creative_id: 20,
                event_epoch_ms: 1_000_000_000_000,
            }
        );
    }

    #[test]
    fn test_decode_bid_with_numeric_ids() {
        let payload = br#"{"adid":10,"crid":20,"timestamp":1000000000000}"#;
        let event = decode(EventCategory::Bid, payload).unwrap();
        assert_eq!(event.campaign_id, 10);
        assert_eq!(event.creative_id, 20);
    }

    #[test]
    fn test_decode_win_field_names() {
        let payload = br#"{"adId":"7","cridId":"8","adtype":"video","pubId":"smaato","cost":"0.012","price":"1.25","domain":"news.example","timestamp":1577837250000}"#;
        let wire = WireEvent::parse(EventCategory::Win, payload).unwrap();
        match &wire {
            WireEvent::Win(fields) => {
                assert_eq!(fields.exchange.as_deref(), Some("smaato"));
                assert_eq!(fields.cost, Some(0.012));
                assert_eq!(fields.price, Some(1.25));
            }
            other => panic!("unexpected variant {:?}", other),
        }

        let event = AdEvent::try_from(&wire).unwrap();
        assert_eq!((event.campaign_id, event.creative_id), (7, 8));
        assert_eq!(event.category, EventCategory::Win);
    }

    #[test]
    fn test_decode_pixel_and_click_share_schema() {
        let payload = br#"{"ad_id":"3","creative_id":"4","exchange":"x","domain":"d","timestamp":1577837250000}"#;
        let pixel = decode(EventCategory::Pixel, payload).unwrap();
        let click = decode(EventCategory::Click, payload).unwrap();
        assert_eq!(pixel.category, EventCategory::Pixel);
        assert_eq!(click.category, EventCategory::Click);
        assert_eq!(pixel.creative_id, click.creative_id);
    }

    #[test]
    fn test_wrong_schema_is_a_decode_error() {
        // A pixel payload has none of the bid field names
        let payload = br#"{"ad_id":"3","creative_id":"4","timestamp":1577837250000}"#;
        let err = decode(EventCategory::Bid, payload).unwrap_err();
        assert!(matches!(err, Error::EventDecode { topic: "bids", .. }));
        assert!(err.to_string().contains("adid"));
    }

    #[test]
    fn test_missing_timestamp_is_a_decode_error() {
        let payload = br#"{"adid":"10","crid":"20"}"#;
        assert!(decode(EventCategory::Bid, payload).is_err());
    }

    #[test]
    fn test_malformed_payloads() {
        for payload in [
            &b"not json"[..],
            &b""[..],
            &br#"{"adid":"ten","crid":"20","timestamp":1}"#[..],
            &br#"{"adid":"10","crid":20.5,"timestamp":1}"#[..],
            &br#"{"adid":"10","crid":"20","timestamp":1,"cost":"cheap"}"#[..],
        ] {
            let err = decode(EventCategory::Bid, payload).unwrap_err();
            assert!(!err.is_fatal());
            assert!(err.should_acknowledge());
        }
    }

    #[test]
    fn test_out_of_range_timestamp() {
        let payload = format!(r#"{{"adid":1,"crid":2,"timestamp":{}}}"#, i64::MAX);
        let err = decode(EventCategory::Bid, payload.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        // Microseconds would land in year 55840
        let payload = br#"{"adid":1,"crid":2,"timestamp":1700000000000000}"#;
        let err = decode(EventCategory::Bid, payload).unwrap_err();
        assert!(matches!(err, Error::EventDecode { topic: "bids", .. }));

        let payload = br#"{"ad_id":1,"creative_id":2,"timestamp":253402300799999}"#;
        assert!(decode(EventCategory::Pixel, payload).is_ok());
    }

    #[test]
    fn test_empty_cost_is_absent() {
        let payload = br#"{"adid":1,"crid":2,"timestamp":5,"cost":""}"#;
        match WireEvent::parse(EventCategory::Bid, payload).unwrap() {
            WireEvent::Bid(fields) => assert_eq!(fields.cost, None),
            other => panic!("unexpected variant {:?}", other),
        }
    }
}
