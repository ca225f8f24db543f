//! SQLite-backed limiter store.
//!
//! Records live in the `rate_limit_windows` table keyed by
//! `(identifier, endpoint_category)`. Timestamps are stored as unix
//! milliseconds so expiry checks are plain integer comparisons.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::{LimiterStore, LiveWindows, StoreError, StoreResult};
use crate::ratelimit::record::WindowRecord;

const IN_MEMORY_URL: &str = "sqlite::memory:";

/// Window records persisted in SQLite.
pub struct SqliteLimiterStore {
    pool: SqlitePool,
}

impl SqliteLimiterStore {
    /// Open (creating if needed) the database at `database_url` and run
    /// migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if database_url == IN_MEMORY_URL {
            // Every connection to ":memory:" opens a separate database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        info!(database_url = %database_url, "Connected to limiter database");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// A private in-memory database, mainly for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect(IN_MEMORY_URL, 1).await
    }

    /// Wrap an existing pool. Migrations are not run.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_windows (
                identifier TEXT NOT NULL,
                endpoint_category TEXT NOT NULL,
                request_count INTEGER NOT NULL,
                window_start_ms INTEGER NOT NULL,
                window_end_ms INTEGER NOT NULL,
                blocked_until_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (identifier, endpoint_category)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rate_limit_windows_window_end \
             ON rate_limit_windows (window_end_ms)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> StoreResult<WindowRecord> {
        let request_count: i64 = row.try_get("request_count")?;
        Ok(WindowRecord {
            identifier: row.try_get("identifier")?,
            endpoint_category: row.try_get("endpoint_category")?,
            request_count: u32::try_from(request_count)
                .map_err(|_| StoreError::Corrupt(format!("request_count {request_count}")))?,
            window_start: from_millis(row.try_get("window_start_ms")?)?,
            window_end: from_millis(row.try_get("window_end_ms")?)?,
            blocked_until: row
                .try_get::<Option<i64>, _>("blocked_until_ms")?
                .map(from_millis)
                .transpose()?,
            created_at: from_millis(row.try_get("created_at_ms")?)?,
            updated_at: from_millis(row.try_get("updated_at_ms")?)?,
        })
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

#[async_trait]
impl LimiterStore for SqliteLimiterStore {
    async fn get(&self, identifier: &str, category: &str) -> StoreResult<Option<WindowRecord>> {
        let row = sqlx::query(
            "SELECT identifier, endpoint_category, request_count, window_start_ms, \
             window_end_ms, blocked_until_ms, created_at_ms, updated_at_ms \
             FROM rate_limit_windows WHERE identifier = ? AND endpoint_category = ?",
        )
        .bind(identifier)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn create(&self, record: &WindowRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO rate_limit_windows (identifier, endpoint_category, request_count, \
             window_start_ms, window_end_ms, blocked_until_ms, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.identifier)
        .bind(&record.endpoint_category)
        .bind(i64::from(record.request_count))
        .bind(record.window_start.timestamp_millis())
        .bind(record.window_end.timestamp_millis())
        .bind(record.blocked_until.map(|t| t.timestamp_millis()))
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::AlreadyExists {
                    identifier: record.identifier.clone(),
                    category: record.endpoint_category.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, record: &WindowRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE rate_limit_windows SET request_count = ?, window_start_ms = ?, \
             window_end_ms = ?, blocked_until_ms = ?, created_at_ms = ?, updated_at_ms = ? \
             WHERE identifier = ? AND endpoint_category = ?",
        )
        .bind(i64::from(record.request_count))
        .bind(record.window_start.timestamp_millis())
        .bind(record.window_end.timestamp_millis())
        .bind(record.blocked_until.map(|t| t.timestamp_millis()))
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .bind(&record.identifier)
        .bind(&record.endpoint_category)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                identifier: record.identifier.clone(),
                category: record.endpoint_category.clone(),
            });
        }
        Ok(())
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        live_windows: &LiveWindows,
    ) -> StoreResult<u64> {
        let now_ms = now.timestamp_millis();
        let mut query = QueryBuilder::<Sqlite>::new(
            "DELETE FROM rate_limit_windows WHERE window_end_ms < ",
        );
        query
            .push_bind(now_ms)
            .push(" AND (blocked_until_ms IS NULL OR blocked_until_ms <= ")
            .push_bind(now_ms)
            .push(")");

        // Keep rows whose window is still open under the category's live size
        for (category, window) in live_windows {
            query
                .push(" AND NOT (endpoint_category = ")
                .push_bind(category.clone())
                .push(" AND window_start_ms + ")
                .push_bind(window.num_milliseconds())
                .push(" >= ")
                .push_bind(now_ms)
                .push(")");
        }

        let result = query.build().execute(&self.pool).await?;

        let deleted = result.rows_affected();
        debug!(deleted, "Purged expired window records");
        Ok(deleted)
    }

    async fn delete(&self, identifier: &str, category: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM rate_limit_windows WHERE identifier = ? AND endpoint_category = ?",
        )
        .bind(identifier)
        .bind(category)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_windows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
