//! Configuration management for the RTB aggregator
//!
//! Strongly-typed configuration read from `RTBAGG_*` environment variables,
//! with validation and defaults that match a docker-compose deployment.
//!
//! Sources, in order of precedence:
//! 1. The process environment
//! 2. Files in the directory named by `FFOLDER` (file name = variable name)
//! 3. A `.env` file in the working directory (only when `FFOLDER` is unset)
//!
//! # Example
//! ```no_run
//! use rtb_aggregator::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Brokers: {}", config.kafka.brokers);
//! ```

use crate::error::{Error, Result};
use crate::events::EventCategory;
use crate::window::WindowInterval;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Prefix shared by every variable this service reads
pub const ENV_PREFIX: &str = "RTBAGG_";

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Campaign manager database (enrichment reference data)
    pub database: DatabaseConfig,
    /// Aggregation window and shutdown behaviour
    pub aggregation: AggregationConfig,
    /// Logging and metrics
    pub logging: LoggingConfig,
}

/// Kafka configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Where to start when the group has no committed offset
    pub offset_reset: OffsetReset,
    /// Input topic names
    pub topics: KafkaTopics,
    /// Consumer session timeout
    pub session_timeout: Duration,
    /// Output topic for aggregated records; log only when unset
    pub output_topic: Option<String>,
    /// Producer configuration for the output topic
    pub producer: KafkaProducerConfig,
}

/// Kafka topic names, one per event category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaTopics {
    pub bids: String,
    pub wins: String,
    pub pixels: String,
    pub clicks: String,
}

/// Kafka producer configuration (output topic only)
#[derive(Debug, Clone)]
pub struct KafkaProducerConfig {
    /// Message timeout
    pub message_timeout: Duration,
    /// Linger time before sending batch
    pub linger: Duration,
    /// Compression type (none, gzip, snappy, lz4, zstd)
    pub compression: String,
    /// Acknowledgment level (0, 1, all)
    pub acks: String,
}

/// Starting offset for partitions without a committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// `-1`, only new messages
    Latest,
    /// `-2`, from the start of the retained log
    Earliest,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// MySQL host, optionally `host:port`
    pub host: String,
    /// Database name
    pub dbname: String,
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// How long to wait for a connection
    pub connect_timeout: Duration,
}

/// Aggregation configuration
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Window length; also the flush period
    pub interval: WindowInterval,
    /// Upper bound for joining consumer tasks on shutdown
    pub shutdown_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Emit debug messages
    pub debug: bool,
    /// Output format
    pub format: LogFormat,
    /// Prometheus listener address (only used with the `prometheus` feature)
    pub metrics_addr: Option<String>,
}

/// Console log format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        load_env_sources();

        let config = Self {
            kafka: KafkaConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            aggregation: AggregationConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.kafka.broker_list().is_empty() {
            return Err(Error::InvalidConfig {
                key: "RTBAGG_BROKERLIST",
                message: "at least one broker is required".into(),
            });
        }

        self.kafka.topics.validate()?;

        if self.database.host.is_empty() {
            return Err(Error::InvalidConfig {
                key: "RTBAGG_MYSQLHOST",
                message: "MySQL host cannot be empty".into(),
            });
        }

        if let Some(topic) = &self.kafka.output_topic {
            if self.kafka.topics.category_for(topic).is_some() {
                return Err(Error::InvalidConfig {
                    key: "RTBAGG_OUTPUT_TOPIC",
                    message: format!("output topic '{}' is also an input topic", topic).into(),
                });
            }
        }

        Ok(())
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Kafka:");
        info!("    Brokers: {}", self.kafka.brokers);
        info!("    Group: {}", self.kafka.group_id);
        info!("    Offset reset: {:?}", self.kafka.offset_reset);
        info!(
            "    Topics: {}, {}, {}, {}",
            self.kafka.topics.bids,
            self.kafka.topics.wins,
            self.kafka.topics.pixels,
            self.kafka.topics.clicks
        );
        match &self.kafka.output_topic {
            Some(topic) => info!("    Output topic: {}", topic),
            None => info!("    Output: log"),
        }
        info!("  Database:");
        info!(
            "    {}",
            mask_dsn(&self.database.user, &self.database.password, &self.database.host, &self.database.dbname)
        );
        info!("  Aggregation:");
        info!("    Interval: {}s", self.aggregation.interval.secs());
        info!("    Shutdown timeout: {:?}", self.aggregation.shutdown_timeout);
    }
}

impl KafkaConfig {
    fn from_env() -> Result<Self> {
        let output_topic = get_env_or("OUTPUT_TOPIC", "");

        Ok(Self {
            brokers: get_env_or("BROKERLIST", "kafka:9092"),
            group_id: get_env_or("GROUP_ID", "rtb-consumer-group-1"),
            offset_reset: OffsetReset::parse(&get_env_or("OFFSETTYPE", "-1"))?,
            topics: KafkaTopics {
                bids: get_env_or("TOPIC_BIDS", "bids"),
                wins: get_env_or("TOPIC_WINS", "wins"),
                pixels: get_env_or("TOPIC_PIXELS", "pixels"),
                clicks: get_env_or("TOPIC_CLICKS", "clicks"),
            },
            session_timeout: Duration::from_millis(
                get_env_parsed_or("SESSION_TIMEOUT_MS", "6000")?,
            ),
            output_topic: if output_topic.is_empty() {
                None
            } else {
                Some(output_topic)
            },
            producer: KafkaProducerConfig {
                message_timeout: Duration::from_millis(
                    get_env_parsed_or("PRODUCER_MESSAGE_TIMEOUT_MS", "30000")?,
                ),
                linger: Duration::from_millis(
                    get_env_parsed_or("PRODUCER_LINGER_MS", "5")?,
                ),
                compression: get_env_or("PRODUCER_COMPRESSION", "lz4"),
                acks: get_env_or("PRODUCER_ACKS", "all"),
            },
        })
    }

    /// Individual broker addresses
    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl KafkaTopics {
    /// Map a topic name to the event category it carries
    pub fn category_for(&self, topic: &str) -> Option<EventCategory> {
        EventCategory::ALL
            .into_iter()
            .find(|category| self.topic(*category) == topic)
    }

    /// Topic name for a category
    pub fn topic(&self, category: EventCategory) -> &str {
        match category {
            EventCategory::Bid => &self.bids,
            EventCategory::Win => &self.wins,
            EventCategory::Pixel => &self.pixels,
            EventCategory::Click => &self.clicks,
        }
    }

    /// All input topic names, in category order
    pub fn all(&self) -> [&str; 4] {
        EventCategory::ALL.map(|category| self.topic(category))
    }

    fn validate(&self) -> Result<()> {
        let names = self.all();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(Error::InvalidConfig {
                    key: "RTBAGG_TOPIC_*",
                    message: "topic names cannot be empty".into(),
                });
            }
            if names[..i].contains(name) {
                return Err(Error::InvalidConfig {
                    key: "RTBAGG_TOPIC_*",
                    message: format!("topic '{}' is configured for two categories", name).into(),
                });
            }
        }
        Ok(())
    }
}

impl Default for KafkaTopics {
    fn default() -> Self {
        Self {
            bids: "bids".to_string(),
            wins: "wins".to_string(),
            pixels: "pixels".to_string(),
            clicks: "clicks".to_string(),
        }
    }
}

impl OffsetReset {
    /// Parse the numeric offset type used by existing deployment files
    /// (`-1` newest, `-2` oldest); the librdkafka names are accepted too.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "-1" | "latest" | "newest" => Ok(Self::Latest),
            "-2" | "earliest" | "oldest" => Ok(Self::Earliest),
            other => Err(Error::InvalidConfig {
                key: "RTBAGG_OFFSETTYPE",
                message: format!("unknown offset type '{}', expected -1 or -2", other).into(),
            }),
        }
    }

    /// Value for librdkafka's `auto.offset.reset`
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Earliest => "earliest",
        }
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: get_env_or("MYSQLHOST", "web_db"),
            dbname: get_env_or("MYSQLDBNAME", "rtb4free"),
            user: get_env_or("MYSQLUSER", "ben"),
            password: get_env_or("MYSQLPASSWORD", "test"),
            connect_timeout: Duration::from_secs(
                get_env_parsed_or("MYSQL_CONNECT_TIMEOUT_SECS", "30")?,
            ),
        })
    }

    /// Split `host[:port]`, defaulting to the MySQL port
    pub fn host_and_port(&self) -> Result<(&str, u16)> {
        match self.host.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| Error::InvalidConfig {
                    key: "RTBAGG_MYSQLHOST",
                    message: format!("invalid port in '{}'", self.host).into(),
                })?;
                Ok((host, port))
            }
            None => Ok((self.host.as_str(), 3306)),
        }
    }
}

impl AggregationConfig {
    fn from_env() -> Result<Self> {
        let secs: u32 = get_env_parsed_or("INTERVAL_SECS", "300")?;
        Ok(Self {
            interval: WindowInterval::from_secs(secs).ok_or(Error::InvalidConfig {
                key: "RTBAGG_INTERVAL_SECS",
                message: "interval must be greater than zero".into(),
            })?,
            shutdown_timeout: Duration::from_secs(
                get_env_parsed_or("SHUTDOWN_TIMEOUT_SECS", "30")?,
            ),
        })
    }
}

impl LoggingConfig {
    /// Read logging settings on their own, so tracing can be initialised
    /// before the rest of the configuration is loaded and logged
    pub fn from_env() -> Result<Self> {
        let format = match get_env_or("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(Error::InvalidConfig {
                    key: "RTBAGG_LOG_FORMAT",
                    message: format!("unknown log format '{}'", other).into(),
                })
            }
        };
        let metrics_addr = get_env_or("METRICS_ADDR", "");

        Ok(Self {
            debug: parse_flag(&get_env_or("DEBUG", "false")),
            format,
            metrics_addr: if metrics_addr.is_empty() {
                None
            } else {
                Some(metrics_addr)
            },
        })
    }
}

// ============================================================================
// Environment sources
// ============================================================================

static ENV_SOURCES: OnceLock<EnvSource> = OnceLock::new();

/// Where variables beyond the process environment came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    /// Files read from the `FFOLDER` secret folder
    SecretFolder {
        folder: String,
        loaded: usize,
        skipped: Vec<String>,
    },
    /// `FFOLDER` was set but could not be read
    SecretFolderUnreadable { folder: String, error: String },
    /// `.env` file, if one was found
    DotEnv { path: Option<PathBuf> },
}

impl EnvSource {
    /// Problem worth a warning, if any
    pub fn warning(&self) -> Option<String> {
        match self {
            EnvSource::SecretFolderUnreadable { folder, error } => Some(format!(
                "Failed to read FFOLDER {}: {}; falling back to defaults",
                folder, error
            )),
            EnvSource::SecretFolder { folder, skipped, .. } if !skipped.is_empty() => Some(
                format!("Skipped unreadable secret files in {}: {}", folder, skipped.join(", ")),
            ),
            _ => None,
        }
    }

    /// Report the source; call once tracing is initialized
    pub fn log(&self) {
        if let Some(warning) = self.warning() {
            warn!("⚠️ {}", warning);
        }
        match self {
            EnvSource::SecretFolder { folder, loaded, .. } => {
                info!("Loaded {} variables from FFOLDER={}", loaded, folder)
            }
            EnvSource::DotEnv { path: Some(path) } => {
                info!("Loaded variables from {}", path.display())
            }
            _ => {}
        }
    }
}

/// Populate the environment from `FFOLDER` or `.env`, once per process
///
/// Variables already present in the environment always win. Nothing is
/// logged here; the returned source is reported with [`EnvSource::log`].
pub fn load_env_sources() -> &'static EnvSource {
    ENV_SOURCES.get_or_init(|| match std::env::var("FFOLDER") {
        // Platforms that mount secrets as files set FFOLDER; each file name is
        // the variable name and its contents the value.
        Ok(folder) => load_secret_folder(folder),
        Err(_) => EnvSource::DotEnv {
            path: dotenvy::dotenv().ok(),
        },
    })
}

fn load_secret_folder(folder: String) -> EnvSource {
    match read_secret_folder(Path::new(&folder)) {
        Ok((entries, skipped)) => {
            let loaded = entries.len();
            for (name, value) in entries {
                if std::env::var(&name).is_err() {
                    std::env::set_var(&name, value);
                }
            }
            EnvSource::SecretFolder {
                folder,
                loaded,
                skipped,
            }
        }
        Err(err) => EnvSource::SecretFolderUnreadable {
            folder,
            error: err.to_string(),
        },
    }
}

type SecretFiles = (Vec<(String, String)>, Vec<String>);

/// Read every regular file in `dir` as a `(name, trimmed contents)` pair,
/// along with the names of files that could not be read
fn read_secret_folder(dir: &Path) -> std::io::Result<SecretFiles> {
    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => entries.push((name, contents.trim().to_string())),
            Err(_) => skipped.push(name),
        }
    }
    entries.sort();
    skipped.sort();
    Ok((entries, skipped))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Get prefixed environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(format!("{}{}", ENV_PREFIX, key)).unwrap_or_else(|_| default.to_string())
}

/// Get and parse prefixed environment variable, failing on garbage
fn get_env_parsed_or<T: std::str::FromStr>(key: &'static str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let value = get_env_or(key, default);
    value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
        key,
        message: format!("Invalid value '{}': {}", value, e).into(),
    })
}

/// Boolean flags accept `true`/`TRUE`/`1`/`yes`
fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Render connection details with the password masked
fn mask_dsn(user: &str, password: &str, host: &str, dbname: &str) -> String {
    let masked = if password.is_empty() { "" } else { "****" };
    format!("{}:{}@tcp({})/{}", user, masked, host, dbname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_reset_parsing() {
        assert_eq!(OffsetReset::parse("-1").unwrap(), OffsetReset::Latest);
        assert_eq!(OffsetReset::parse("-2").unwrap(), OffsetReset::Earliest);
        assert_eq!(OffsetReset::parse("oldest").unwrap(), OffsetReset::Earliest);
        assert_eq!(OffsetReset::Latest.as_rdkafka(), "latest");
        assert!(OffsetReset::parse("0").is_err());
    }

    #[test]
    fn test_topic_categories() {
        let topics = KafkaTopics::default();
        assert_eq!(topics.category_for("bids"), Some(EventCategory::Bid));
        assert_eq!(topics.category_for("clicks"), Some(EventCategory::Click));
        assert_eq!(topics.category_for("impressions"), None);
        assert_eq!(topics.all(), ["bids", "wins", "pixels", "clicks"]);
    }

    #[test]
    fn test_duplicate_topics_rejected() {
        let topics = KafkaTopics {
            pixels: "wins".to_string(),
            ..KafkaTopics::default()
        };
        assert!(topics.validate().is_err());
        assert!(KafkaTopics::default().validate().is_ok());
    }

    #[test]
    fn test_mysql_host_and_port() {
        let mut db = DatabaseConfig {
            host: "web_db".to_string(),
            dbname: "rtb4free".to_string(),
            user: "ben".to_string(),
            password: "test".to_string(),
            connect_timeout: Duration::from_secs(5),
        };
        assert_eq!(db.host_and_port().unwrap(), ("web_db", 3306));

        db.host = "10.0.0.5:3307".to_string();
        assert_eq!(db.host_and_port().unwrap(), ("10.0.0.5", 3307));

        db.host = "web_db:abc".to_string();
        assert!(db.host_and_port().is_err());
    }

    #[test]
    fn test_flags_and_masking() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
        assert_eq!(
            mask_dsn("ben", "test", "web_db", "rtb4free"),
            "ben:****@tcp(web_db)/rtb4free"
        );
    }

    #[test]
    fn test_read_secret_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RTBAGG_MYSQLPASSWORD"), "s3cret\n").unwrap();
        std::fs::write(dir.path().join("RTBAGG_DEBUG"), "true").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let (entries, skipped) = read_secret_folder(dir.path()).unwrap();
        assert_eq!(
            entries,
            vec![
                ("RTBAGG_DEBUG".to_string(), "true".to_string()),
                ("RTBAGG_MYSQLPASSWORD".to_string(), "s3cret".to_string()),
            ]
        );
        assert!(skipped.is_empty());
    }

    #[test]
    fn test_secret_folder_loads_missing_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RTBAGG_SECRET_FOLDER_CHECK"), "from-file").unwrap();
        let folder = dir.path().display().to_string();

        let source = load_secret_folder(folder.clone());
        assert_eq!(
            source,
            EnvSource::SecretFolder {
                folder,
                loaded: 1,
                skipped: Vec::new(),
            }
        );
        assert_eq!(source.warning(), None);
        assert_eq!(
            std::env::var("RTBAGG_SECRET_FOLDER_CHECK").as_deref(),
            Ok("from-file")
        );
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        std::env::set_var("RTBAGG_SHUTDOWN_TIMEOUT_SECS", "30s");
        let err = AggregationConfig::from_env().unwrap_err();
        std::env::remove_var("RTBAGG_SHUTDOWN_TIMEOUT_SECS");
        assert!(matches!(
            err,
            Error::InvalidConfig {
                key: "SHUTDOWN_TIMEOUT_SECS",
                ..
            }
        ));

        let config = AggregationConfig::from_env().unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unreadable_secret_folder_is_reported() {
        let source = load_secret_folder("/nonexistent/secret/dir".to_string());
        assert!(matches!(
            source,
            EnvSource::SecretFolderUnreadable { ref folder, .. } if folder == "/nonexistent/secret/dir"
        ));
        let warning = source.warning().unwrap();
        assert!(warning.contains("/nonexistent/secret/dir"));
        assert!(warning.contains("defaults"));
    }

    #[test]
    fn test_broker_list() {
        let config = KafkaConfig {
            brokers: "kafka:9092, kafka2:9092,".to_string(),
            group_id: "g".to_string(),
            offset_reset: OffsetReset::Latest,
            topics: KafkaTopics::default(),
            session_timeout: Duration::from_secs(6),
            output_topic: None,
            producer: KafkaProducerConfig {
                message_timeout: Duration::from_secs(30),
                linger: Duration::from_millis(5),
                compression: "lz4".to_string(),
                acks: "all".to_string(),
            },
        };
        assert_eq!(config.broker_list(), vec!["kafka:9092", "kafka2:9092"]);
    }
}
