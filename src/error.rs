//! Error types for the RTB aggregator
//!
//! One `thiserror` hierarchy for the whole service:
//! - Startup failures (configuration, broker, reference data) are fatal and
//!   propagate out of `main`
//! - Per-message failures (bad payload, unknown topic) are logged and the
//!   message is discarded
//! - Classification helpers drive the offset acknowledgement policy

use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for aggregator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the RTB aggregator
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config { message: Cow<'static, str> },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Reference Data Errors
    // ========================================================================
    #[error("Database error: {message}")]
    Database {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },

    // ========================================================================
    // Kafka Errors
    // ========================================================================
    #[error("Kafka error: {message}")]
    Kafka {
        message: Cow<'static, str>,
        #[source]
        source: Option<rdkafka::error::KafkaError>,
    },

    #[error("Topic '{topic}' not found on the broker")]
    TopicNotFound { topic: String },

    // ========================================================================
    // Ingestion Errors
    // ========================================================================
    #[error("Event decoding failed for topic {topic}: {message}")]
    EventDecode {
        topic: &'static str,
        message: Cow<'static, str>,
    },

    #[error("Unexpected topic {topic}")]
    UnknownTopic { topic: String },

    #[error("Aggregator is closed and no longer accepts events")]
    AggregatorClosed,

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: &'static str },
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a database error with source
    pub fn database_with_source(
        message: impl Into<Cow<'static, str>>,
        source: sqlx::Error,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a decode error for the given topic schema
    pub fn decode(topic: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::EventDecode {
            topic,
            message: message.into(),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error must stop the process
    ///
    /// Per-message errors never are; everything that can only happen while
    /// wiring up the service is.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::EventDecode { .. }
                | Error::UnknownTopic { .. }
                | Error::AggregatorClosed
                | Error::Json(_)
        )
    }

    /// Returns true if the message that produced this error should still have
    /// its offset stored
    ///
    /// Bad messages are acknowledged so they are not redelivered forever. A
    /// message rejected by a closed aggregator was never counted and must be
    /// redelivered after restart.
    pub fn should_acknowledge(&self) -> bool {
        matches!(
            self,
            Error::EventDecode { .. } | Error::UnknownTopic { .. } | Error::Json(_)
        )
    }

    /// Get a short stable code, used as the `outcome` label of rejected messages
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::InvalidConfig { .. } => "CONFIG_ERROR",
            Error::Database { .. } => "REFERENCE_DATA_ERROR",
            Error::Kafka { .. } | Error::TopicNotFound { .. } => "KAFKA_ERROR",
            Error::EventDecode { .. } | Error::Json(_) => "DECODE_ERROR",
            Error::UnknownTopic { .. } => "UNKNOWN_TOPIC",
            Error::AggregatorClosed => "AGGREGATOR_CLOSED",
            Error::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Error::ServiceUnavailable { service: "mysql" },
            _ => Error::Database {
                message: err.to_string().into(),
                source: Some(err),
            },
        }
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::Kafka {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}
