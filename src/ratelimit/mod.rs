//! Rate limiting logic and state management.

mod cleanup;
mod limiter;
mod policy;
mod record;
mod registry;
mod store;

pub use cleanup::{CleanupJob, DEFAULT_CLEANUP_INTERVAL};
pub use limiter::{RateLimitEvaluator, Verdict, UNLIMITED};
pub use policy::{
    PolicyRule, RateLimitPolicy, API_GENERAL, API_STRICT, GUEST_SESSION, HEARTS_FROM_AD,
    LESSON_COMPLETE,
};
pub use record::{WindowKey, WindowRecord};
pub use registry::ConfigRegistry;
pub use store::{
    InMemoryLimiterStore, LimiterStore, LiveWindows, SqliteLimiterStore, StoreError, StoreResult,
};
