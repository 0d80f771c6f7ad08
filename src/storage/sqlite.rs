//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Samples live in a single `samples` table keyed by `(series_id, timestamp)`.
//! The full label set is stored as JSON next to the metric name so selectors
//! can narrow by name in SQL and by label in Rust.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, SampleSink, Selector, StorageBackend, StorageStats};
use super::error::{StorageError, StorageResult};
use crate::{LabelSet, Sample};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    ///
    /// ```no_run
    /// # use metrics_hub::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./metrics.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn row_to_sample(row: &SqliteRow) -> StorageResult<Sample> {
        let labels: String = row.try_get("labels")?;

        Ok(Sample {
            metric: serde_json::from_str(&labels)?,
            value: row.try_get("value")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
        })
    }

    /// Decode rows and keep the ones whose labels satisfy the selector
    fn matching(rows: Vec<SqliteRow>, selector: &Selector) -> StorageResult<Vec<Sample>> {
        let mut samples = Vec::with_capacity(rows.len());
        for row in &rows {
            let sample = Self::row_to_sample(row)?;
            if selector.matches(&sample.metric) {
                samples.push(sample);
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl SampleSink for SqliteBackend {
    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn append(&self, samples: &[Sample]) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let labels = serde_json::to_string(&sample.metric)?;

            sqlx::query(
                r#"
                INSERT INTO samples (series_id, name, labels, timestamp, value)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (series_id, timestamp) DO UPDATE SET
                    value = excluded.value
                "#,
            )
            .bind(sample.series_id())
            .bind(sample.name())
            .bind(labels)
            .bind(Self::timestamp_to_millis(&sample.timestamp))
            .bind(sample.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self), fields(metric = %selector.metric))]
    async fn query_latest(&self, selector: &Selector) -> StorageResult<Vec<Sample>> {
        let rows = sqlx::query(
            r#"
            SELECT s.labels, s.timestamp, s.value
            FROM samples s
            WHERE s.name = ?
              AND s.timestamp = (
                  SELECT MAX(timestamp) FROM samples latest
                  WHERE latest.series_id = s.series_id
              )
            ORDER BY s.series_id ASC
            "#,
        )
        .bind(&selector.metric)
        .fetch_all(&self.pool)
        .await?;

        Self::matching(rows, selector)
    }

    #[instrument(skip(self), fields(metric = %selector.metric))]
    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>> {
        let rows = sqlx::query(
            r#"
            SELECT labels, timestamp, value
            FROM samples
            WHERE name = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC, series_id ASC
            "#,
        )
        .bind(&selector.metric)
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        let samples = Self::matching(rows, selector)?;
        debug!("range query returned {} samples", samples.len());
        Ok(samples)
    }

    async fn series(&self) -> StorageResult<Vec<LabelSet>> {
        let rows = sqlx::query("SELECT DISTINCT labels FROM samples ORDER BY series_id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let labels: String = row.try_get("labels")?;
                Ok(serde_json::from_str(&labels)?)
            })
            .collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn delete_before(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM samples WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!("deleted {} samples older than {}", deleted, before);
        Ok(deleted)
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let (total_samples, total_series, oldest, newest): (i64, i64, Option<i64>, Option<i64>) =
            sqlx::query_as(
                "SELECT COUNT(*), COUNT(DISTINCT series_id), MIN(timestamp), MAX(timestamp) FROM samples",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(StorageStats {
            backend: "sqlite",
            total_samples: total_samples as u64,
            total_series: total_series as u64,
            oldest_sample: oldest.map(Self::millis_to_timestamp),
            newest_sample: newest.map(Self::millis_to_timestamp),
        })
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn SampleSink> {
        self
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }
}
