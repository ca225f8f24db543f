//! Periodic eviction of expired window records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::ConfigRegistry;
use super::store::{LimiterStore, StoreResult};

/// Default time between purges.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Background task that purges records no evaluation will consult again.
///
/// The job talks to the store directly and takes no evaluator locks. Each
/// purge reads the registry's current window sizes, so records stay until
/// their window has elapsed under the live policy as well.
#[derive(Clone)]
pub struct CleanupJob {
    store: Arc<dyn LimiterStore>,
    registry: Arc<ConfigRegistry>,
    interval: Duration,
}

impl CleanupJob {
    pub fn new(
        store: Arc<dyn LimiterStore>,
        registry: Arc<ConfigRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Purge once.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let live_windows = self.registry.live_windows();
        let deleted = self.store.delete_expired(now, &live_windows).await?;
        if deleted > 0 {
            info!(deleted, "Removed expired rate limit records");
        } else {
            debug!("No expired rate limit records to remove");
        }
        Ok(deleted)
    }

    /// Purge on every tick until `shutdown` is cancelled.
    ///
    /// The first purge happens one full interval after start. A failed purge
    /// is logged and retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "Rate limit cleanup job started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        warn!(error = %e, "Rate limit cleanup failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Rate limit cleanup job shutting down");
                    return;
                }
            }
        }
    }

    /// Run the job on the tokio runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::record::{WindowKey, WindowRecord};
    use crate::ratelimit::store::InMemoryLimiterStore;
    use crate::ratelimit::policy::{RateLimitPolicy, API_GENERAL};
    use chrono::TimeDelta;

    fn registry() -> Arc<ConfigRegistry> {
        Arc::new(ConfigRegistry::with_defaults())
    }

    fn expired_record(identifier: &str) -> WindowRecord {
        let start = Utc::now() - TimeDelta::hours(2);
        WindowRecord::open(
            &WindowKey::new(identifier, "api_general"),
            start,
            TimeDelta::hours(1),
        )
    }

    #[tokio::test]
    async fn test_run_once_purges_expired() {
        let store = Arc::new(InMemoryLimiterStore::new());
        store.create(&expired_record("ip:1")).await.unwrap();
        store
            .create(&WindowRecord::open(
                &WindowKey::new("ip:2", "api_general"),
                Utc::now(),
                TimeDelta::hours(1),
            ))
            .await
            .unwrap();

        let job = CleanupJob::new(store.clone(), registry(), DEFAULT_CLEANUP_INTERVAL);
        assert_eq!(job.run_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);

        // Idempotent
        assert_eq!(job.run_once(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_purges_on_tick() {
        let store = Arc::new(InMemoryLimiterStore::new());
        store.create(&expired_record("ip:1")).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = CleanupJob::new(store.clone(), registry(), Duration::from_secs(60))
            .spawn(shutdown.clone());

        // Nothing is purged before the first full interval
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.count().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.count().await.unwrap(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_job_stops_on_cancel() {
        let store = Arc::new(InMemoryLimiterStore::new());
        let shutdown = CancellationToken::new();
        let handle =
            CleanupJob::new(store, registry(), Duration::from_secs(3600)).spawn(shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cleanup job did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_uses_registered_window() {
        let store = Arc::new(InMemoryLimiterStore::new());
        let start = Utc::now() - TimeDelta::minutes(90);
        store
            .create(&WindowRecord::open(
                &WindowKey::new("ip:1", API_GENERAL),
                start,
                TimeDelta::hours(1),
            ))
            .await
            .unwrap();

        let registry = registry();
        registry
            .register(RateLimitPolicy::new(
                API_GENERAL,
                1000,
                TimeDelta::hours(2),
                TimeDelta::hours(1),
                "",
            ))
            .unwrap();

        let job = CleanupJob::new(store.clone(), registry, DEFAULT_CLEANUP_INTERVAL);
        assert_eq!(job.run_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(job.run_once(start + TimeDelta::hours(3)).await.unwrap(), 1);
    }
}
