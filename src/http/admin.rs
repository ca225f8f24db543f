//! Administrative routes: policy listing, on-demand cleanup and manual
//! unblocking, plus the unguarded health check.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::guard::{strict_guard, GuardState};
use crate::config::GuardConfig;
use crate::ratelimit::{CleanupJob, RateLimitEvaluator, RateLimitPolicy, StoreError};

/// A policy as reported by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyView {
    pub endpoint_category: String,
    pub max_requests: u32,
    pub window_seconds: i64,
    pub block_seconds: i64,
    pub description: String,
}

impl From<&RateLimitPolicy> for PolicyView {
    fn from(policy: &RateLimitPolicy) -> Self {
        Self {
            endpoint_category: policy.endpoint_category.clone(),
            max_requests: policy.max_requests,
            window_seconds: policy.window_size.num_seconds(),
            block_seconds: policy.block_duration.num_seconds(),
            description: policy.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub records: u64,
}

#[derive(Clone)]
struct AdminState {
    evaluator: Arc<RateLimitEvaluator>,
    cleanup: CleanupJob,
}

/// The full HTTP surface of the service: `/health` open to all, and the
/// admin routes behind [`strict_guard`].
pub fn service_router(
    evaluator: Arc<RateLimitEvaluator>,
    cleanup: CleanupJob,
    guards: GuardConfig,
) -> Router {
    let guard = GuardState::new(Arc::clone(&evaluator), guards);
    health_router(Arc::clone(&evaluator)).merge(
        admin_router(evaluator, cleanup).route_layer(from_fn_with_state(guard, strict_guard)),
    )
}

/// Admin routes over a shared evaluator, without any guard.
pub fn admin_router(evaluator: Arc<RateLimitEvaluator>, cleanup: CleanupJob) -> Router {
    Router::new()
        .route("/admin/rate-limits/policies", get(list_policies))
        .route("/admin/rate-limits/cleanup", post(run_cleanup))
        .route(
            "/admin/rate-limits/{category}/{identifier}",
            delete(unblock),
        )
        .with_state(AdminState { evaluator, cleanup })
}

pub fn health_router(evaluator: Arc<RateLimitEvaluator>) -> Router {
    Router::new().route("/health", get(health)).with_state(evaluator)
}

async fn health(State(evaluator): State<Arc<RateLimitEvaluator>>) -> Response {
    match evaluator.store().count().await {
        Ok(records) => Json(HealthResponse {
            status: "ok".to_string(),
            records,
        })
        .into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn list_policies(State(state): State<AdminState>) -> Json<Vec<PolicyView>> {
    let policies = state.evaluator.registry().policies();
    Json(policies.iter().map(PolicyView::from).collect())
}

async fn run_cleanup(State(state): State<AdminState>) -> Response {
    match state.cleanup.run_once(Utc::now()).await {
        Ok(deleted) => Json(CleanupResponse { deleted }).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn unblock(
    State(state): State<AdminState>,
    Path((category, identifier)): Path<(String, String)>,
) -> Response {
    match state.evaluator.reset(&identifier, &category).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not_found",
                "message": format!("No rate limit record for {category}:{identifier}"),
            })),
        )
            .into_response(),
        Err(e) => store_error_response(e),
    }
}

fn store_error_response(err: StoreError) -> Response {
    error!(error = %err, "Limiter store error in admin request");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "storage_error",
            "message": "Rate limit storage is unavailable",
        })),
    )
        .into_response()
}
