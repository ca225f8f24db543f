//! Core rate limit evaluation.
//!
//! Each `(identifier, category)` pair is counted in fixed windows. Exceeding
//! the window limit blocks the key for the policy's block duration; a block
//! outlives window resets.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::policy::RateLimitPolicy;
use super::record::{WindowKey, WindowRecord};
use super::registry::ConfigRegistry;
use super::store::{LimiterStore, StoreError, StoreResult};

/// `remaining` value reported when no policy applies.
pub const UNLIMITED: i64 = -1;

/// The outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Requests left in the current window, or [`UNLIMITED`]
    pub remaining: i64,
    /// When the caller may expect the limit to reset
    pub reset_time: Option<DateTime<Utc>>,
    /// Set when the key is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

impl Verdict {
    /// Verdict for a category with no configured policy.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: UNLIMITED,
            reset_time: None,
            blocked_until: None,
        }
    }

    fn allowed(remaining: i64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time: Some(reset_time),
            blocked_until: None,
        }
    }

    fn blocked(until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time: Some(until),
            blocked_until: Some(until),
        }
    }

    /// Whether a finite policy produced this verdict.
    pub fn is_limited(&self) -> bool {
        self.remaining != UNLIMITED
    }
}

/// Evaluates requests against the registry and persists window state.
///
/// Evaluations of the same key are serialized through a per-key async lock
/// held across the whole read-modify-write; different keys never contend.
pub struct RateLimitEvaluator {
    registry: Arc<ConfigRegistry>,
    store: Arc<dyn LimiterStore>,
    locks: DashMap<WindowKey, Arc<Mutex<()>>>,
}

impl RateLimitEvaluator {
    pub fn new(registry: Arc<ConfigRegistry>, store: Arc<dyn LimiterStore>) -> Self {
        Self {
            registry,
            store,
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LimiterStore> {
        &self.store
    }

    /// Evaluate a request at the current time.
    pub async fn evaluate_now(&self, identifier: &str, category: &str) -> StoreResult<Verdict> {
        self.evaluate(identifier, category, Utc::now()).await
    }

    /// Decide whether a request from `identifier` against `category` is
    /// admitted at `now`, updating the stored window.
    ///
    /// Store errors are returned unchanged; the caller decides whether to
    /// fail open or closed.
    pub async fn evaluate(
        &self,
        identifier: &str,
        category: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Verdict> {
        let Some(policy) = self.registry.policy_for(category) else {
            trace!(category = %category, "No policy configured, allowing");
            return Ok(Verdict::unlimited());
        };

        let key = WindowKey::new(identifier, category);
        self.with_key_lock(&key, || self.evaluate_locked(&key, &policy, now))
            .await
    }

    /// Forget the stored window for a key, lifting any block.
    ///
    /// Returns whether a record existed.
    pub async fn reset(&self, identifier: &str, category: &str) -> StoreResult<bool> {
        let key = WindowKey::new(identifier, category);
        let removed = self
            .with_key_lock(&key, || self.store.delete(identifier, category))
            .await?;
        if removed {
            info!(key = %key, "Window record removed, key unblocked");
        }
        Ok(removed)
    }

    async fn with_key_lock<T, F, Fut>(&self, key: &WindowKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Declared first so it drops last, after the guard and the lock handle
        let _release = LockRelease {
            locks: &self.locks,
            key,
        };
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;
        f().await
    }

    /// Write back a record read under the key lock.
    ///
    /// The cleanup job takes no key locks and may have purged the record
    /// since it was read; the record is then recreated as written.
    async fn persist(&self, record: &WindowRecord) -> StoreResult<()> {
        match self.store.update(record).await {
            Err(StoreError::NotFound { .. }) => {
                debug!(key = %record.key(), "Window record purged during evaluation, recreating");
                self.store.create(record).await
            }
            result => result,
        }
    }

    async fn evaluate_locked(
        &self,
        key: &WindowKey,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Verdict> {
        let existing = self.store.get(&key.identifier, &key.category).await?;

        trace!(
            key = %key,
            found = existing.is_some(),
            "Loaded window record"
        );

        let mut record = match existing {
            Some(record) if record.is_blocked(now) => {
                let until = record.blocked_until.unwrap_or(now);
                debug!(key = %key, blocked_until = %until, "Request denied, key is blocked");
                return Ok(Verdict::blocked(until));
            }
            None => {
                let record = WindowRecord::open(key, now, policy.window_size);
                self.store.create(&record).await?;
                return Ok(Self::opened(key, policy, now));
            }
            Some(record) => record,
        };

        if record.window_elapsed(now, policy.window_size) {
            record.reopen(now, policy.window_size);
            self.persist(&record).await?;
            return Ok(Self::opened(key, policy, now));
        }

        if record.request_count >= policy.max_requests {
            let until = now + policy.block_duration;
            record.blocked_until = Some(until);
            record.updated_at = now;
            self.persist(&record).await?;

            warn!(
                key = %key,
                count = record.request_count,
                limit = policy.max_requests,
                blocked_until = %until,
                "Rate limit exceeded, key blocked"
            );
            return Ok(Verdict::blocked(until));
        }

        record.request_count += 1;
        record.updated_at = now;
        self.persist(&record).await?;

        let remaining = i64::from(policy.max_requests) - i64::from(record.request_count);
        debug!(key = %key, remaining, "Request allowed");
        Ok(Verdict::allowed(
            remaining,
            record.window_start + policy.window_size,
        ))
    }

    fn opened(key: &WindowKey, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Verdict {
        let remaining = i64::from(policy.max_requests) - 1;
        debug!(key = %key, remaining, "Opened new window");
        Verdict::allowed(remaining, now + policy.window_size)
    }

    /// Number of keys with an evaluation in flight.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

/// Drops a key's lock entry once no task holds or waits on it, including
/// when the evaluation future is cancelled.
struct LockRelease<'a> {
    locks: &'a DashMap<WindowKey, Arc<Mutex<()>>>,
    key: &'a WindowKey,
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        // Only the map holds the lock once no task is using or waiting on it
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
