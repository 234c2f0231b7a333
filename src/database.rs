//! Campaign manager reference data
//!
//! The aggregated records carry the campaign's target regions, looked up from
//! the campaign manager's MySQL database. Only runnable campaigns are read,
//! once, at startup; a failure here stops the service.

use crate::aggregation::{CreativeRecord, ReferenceSnapshot};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::ConnectOptions;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Runnable campaigns joined with their banners
const CAMPAIGN_BANNERS_SQL: &str = "SELECT CAST(campaigns.id AS SIGNED), \
     CAST(banners.id AS SIGNED) AS banner_id, \
     CAST(campaigns.regions AS CHAR) \
     FROM banners, campaigns \
     WHERE banners.campaign_id = campaigns.id AND campaigns.status = 'runnable'";

/// Runnable campaigns joined with their video creatives
const CAMPAIGN_VIDEOS_SQL: &str = "SELECT CAST(campaigns.id AS SIGNED), \
     CAST(videos.id AS SIGNED) AS video_id, \
     CAST(campaigns.regions AS CHAR) \
     FROM banner_videos AS videos, campaigns \
     WHERE videos.campaign_id = campaigns.id AND campaigns.status = 'runnable'";

type CreativeRow = (i64, i64, Option<String>);

/// Connection to the campaign manager database
#[derive(Clone)]
pub struct ReferenceDatabase {
    pool: MySqlPool,
}

impl ReferenceDatabase {
    /// Open a small pool and verify the connection
    #[instrument(skip(config), fields(host = %config.host, db = %config.dbname))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let (host, port) = config.host_and_port()?;
        debug!("Connecting to MySQL at {}:{}", host, port);

        let connect_options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.dbname)
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                Error::database_with_source(format!("Failed to connect to {}: {}", config.host, e), e)
            })?;

        Ok(Self { pool })
    }

    /// Read both creative tables
    pub async fn load_snapshot(&self) -> Result<ReferenceSnapshot> {
        let banners = self.fetch_creatives(CAMPAIGN_BANNERS_SQL, "Campaign-Banner").await?;
        let videos = self.fetch_creatives(CAMPAIGN_VIDEOS_SQL, "Campaign-Video").await?;

        let snapshot = ReferenceSnapshot { banners, videos };
        if snapshot.is_empty() {
            warn!("⚠️ No runnable campaign creatives found; records will have no region");
        }
        Ok(snapshot)
    }

    async fn fetch_creatives(&self, sql: &'static str, kind: &str) -> Result<Vec<CreativeRecord>> {
        let rows = sqlx::query_as::<_, CreativeRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::database_with_source(format!("{} query failed: {}", kind, e), e))?;

        info!("{} {} records read.", rows.len(), kind);
        Ok(rows.into_iter().map(into_record).collect())
    }

    /// Close all connections gracefully
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("MySQL connection pool closed");
    }
}

fn into_record((campaign_id, creative_id, region): CreativeRow) -> CreativeRecord {
    CreativeRecord {
        campaign_id,
        creative_id,
        region,
    }
}

/// Connect, read the snapshot and disconnect
pub async fn load_reference_snapshot(config: &DatabaseConfig) -> Result<ReferenceSnapshot> {
    info!("🔗 Loading reference data from MySQL...");
    let db = ReferenceDatabase::connect(config).await?;
    let snapshot = db.load_snapshot().await;
    db.close().await;

    let snapshot = snapshot?;
    info!(
        "✅ Reference data loaded ({} banners, {} videos)",
        snapshot.banners.len(),
        snapshot.videos.len()
    );
    Ok(snapshot)
}
