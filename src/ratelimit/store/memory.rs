//! In-memory limiter store for tests and single-instance deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{LimiterStore, LiveWindows, StoreError, StoreResult};
use crate::ratelimit::record::{WindowKey, WindowRecord};

/// Window records held in a process-local map.
pub struct InMemoryLimiterStore {
    records: RwLock<HashMap<WindowKey, WindowRecord>>,
}

impl InMemoryLimiterStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLimiterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimiterStore for InMemoryLimiterStore {
    async fn get(&self, identifier: &str, category: &str) -> StoreResult<Option<WindowRecord>> {
        let key = WindowKey::new(identifier, category);
        Ok(self.records.read().get(&key).cloned())
    }

    async fn create(&self, record: &WindowRecord) -> StoreResult<()> {
        let mut records = self.records.write();
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                identifier: key.identifier,
                category: key.category,
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn update(&self, record: &WindowRecord) -> StoreResult<()> {
        let mut records = self.records.write();
        match records.get_mut(&record.key()) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                identifier: record.identifier.clone(),
                category: record.endpoint_category.clone(),
            }),
        }
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        live_windows: &LiveWindows,
    ) -> StoreResult<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|key, record| {
            !record.is_expired(now, live_windows.get(&key.category).copied())
        });
        let deleted = (before - records.len()) as u64;
        debug!(deleted, "Purged expired in-memory window records");
        Ok(deleted)
    }

    async fn delete(&self, identifier: &str, category: &str) -> StoreResult<bool> {
        let key = WindowKey::new(identifier, category);
        Ok(self.records.write().remove(&key).is_some())
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.records.read().len() as u64)
    }
}
