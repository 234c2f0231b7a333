//! RTB aggregator library crate
//!
//! Counts bid, win, pixel and click events per campaign creative in fixed
//! time windows and emits one enriched record per window. Re-exports the
//! core types for the binary and the integration tests.

pub mod aggregation;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod kafka;
pub mod sink;
pub mod telemetry;
pub mod window;

// Re-export commonly used types
pub use aggregation::{
    AggregatedRecord, AggregationKey, Aggregator, FlushHandle, FlushMode, FlushReport,
    FlushScheduler, RecordEmitter,
};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{AdEvent, EventCategory};
pub use sink::RecordSink;
pub use window::WindowInterval;
