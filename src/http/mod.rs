//! HTTP boundary: guard middleware, admin routes and the server.

mod admin;
mod guard;
mod server;

pub use admin::{
    admin_router, health_router, service_router, CleanupResponse, HealthResponse, PolicyView,
};
pub use guard::{
    ad_reward_guard, apply_rate_limit_headers, client_ip, general_guard, lesson_guard,
    session_guard, strict_guard, too_many_requests, FailurePolicy, GuardState,
    RateLimitErrorBody, SESSION_ID_PARAM, X_DEVICE_ID, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;
