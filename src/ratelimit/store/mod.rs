//! Durable storage for window records.
//!
//! The evaluator serializes work per key, so stores only need to keep each
//! individual operation atomic and reject duplicate creates.

mod memory;
mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use super::record::WindowRecord;

pub use memory::InMemoryLimiterStore;
pub use sqlite::SqliteLimiterStore;

/// Errors raised by a limiter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A create raced with another create for the same key
    #[error("window record already exists for {category}:{identifier}")]
    AlreadyExists { identifier: String, category: String },

    /// An update targeted a key with no stored record
    #[error("no window record for {category}:{identifier}")]
    NotFound { identifier: String, category: String },

    /// A stored row could not be decoded into a record
    #[error("corrupt window record: {0}")]
    Corrupt(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Current window size of every configured category, used to keep records
/// whose window is still open under the live policy.
pub type LiveWindows = HashMap<String, TimeDelta>;

/// Storage operations the limiter relies on.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Fetch the record for a key.
    async fn get(&self, identifier: &str, category: &str) -> StoreResult<Option<WindowRecord>>;

    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if the
    /// key is taken.
    async fn create(&self, record: &WindowRecord) -> StoreResult<()>;

    /// Replace the stored record with the same key.
    async fn update(&self, record: &WindowRecord) -> StoreResult<()>;

    /// Remove every record whose stored window has ended, whose window under
    /// `live_windows` (when its category is listed) has ended, and whose
    /// block, if any, has passed. Returns the number of records removed.
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        live_windows: &LiveWindows,
    ) -> StoreResult<u64>;

    /// Remove the record for a key. Returns whether a record existed.
    async fn delete(&self, identifier: &str, category: &str) -> StoreResult<bool>;

    /// Number of stored records.
    async fn count(&self) -> StoreResult<u64>;
}
