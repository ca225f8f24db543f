//! Per-category guard middleware.
//!
//! Each guard derives an identifier from the request, evaluates it against
//! its endpoint category and either forwards the request or answers with a
//! `429`. Guards differ in where the identifier comes from and in what
//! happens when the limiter store is unavailable:
//!
//! | Guard | Identifier | Store failure |
//! |---|---|---|
//! | [`general_guard`] | client IP | allow |
//! | [`strict_guard`] | client IP | `503` |
//! | [`session_guard`] | body `device_id`, `X-Device-ID`, client IP | allow |
//! | [`lesson_guard`], [`ad_reward_guard`] | `session_id` path parameter, client IP | allow |
//!
//! Attach them with `axum::middleware::from_fn_with_state` (use
//! `route_layer` for the session action guards so path parameters are
//! available).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::RawPathParamsRejection, ConnectInfo, RawPathParams, Request, State},
    http::{header, Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::GuardConfig;
use crate::ratelimit::{RateLimitEvaluator, Verdict};

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_DEVICE_ID: &str = "x-device-id";

/// Path parameter holding the session id for session action routes.
pub const SESSION_ID_PARAM: &str = "session_id";

const UNKNOWN_CLIENT: &str = "unknown";

/// What a guard does when the limiter cannot reach its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through unlimited
    Open,
    /// Reject the request with `503 Service Unavailable`
    Closed,
}

/// Shared state for the guard middleware.
#[derive(Clone)]
pub struct GuardState {
    pub evaluator: Arc<RateLimitEvaluator>,
    pub config: Arc<GuardConfig>,
}

impl GuardState {
    pub fn new(evaluator: Arc<RateLimitEvaluator>, config: GuardConfig) -> Self {
        Self {
            evaluator,
            config: Arc::new(config),
        }
    }
}

impl std::fmt::Debug for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardState")
            .field("config", &self.config)
            .finish()
    }
}

/// JSON body returned when a request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitErrorBody {
    pub error: String,
    pub message: String,
    /// Unix seconds at which the block lifts, or empty
    pub retry_after: String,
}

/// General API traffic, keyed by client IP. Fails open.
pub async fn general_guard(
    State(state): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = ip_identifier(request.headers(), request.extensions());
    let category = state.config.general_category.clone();
    enforce(&state, &identifier, &category, FailurePolicy::Open, request, next).await
}

/// Sensitive and admin traffic, keyed by client IP. Fails closed.
pub async fn strict_guard(
    State(state): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = ip_identifier(request.headers(), request.extensions());
    let category = state.config.strict_category.clone();
    enforce(&state, &identifier, &category, FailurePolicy::Closed, request, next).await
}

/// Session creation, keyed by device id. Fails open.
///
/// The body is buffered to look for a `device_id` field and handed back to
/// the inner handler unchanged.
pub async fn session_guard(
    State(state): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.config.body_limit_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to buffer session request body");
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request body could not be read",
            );
        }
    };

    let identifier = device_id_from_body(&bytes)
        .or_else(|| device_id_from_headers(&parts.headers))
        .map(|device| format!("device:{device}"))
        .unwrap_or_else(|| ip_identifier(&parts.headers, &parts.extensions));

    let request = Request::from_parts(parts, Body::from(bytes));
    let category = state.config.session_category.clone();
    enforce(&state, &identifier, &category, FailurePolicy::Open, request, next).await
}

/// Lesson completion, keyed by session id. Fails open.
pub async fn lesson_guard(
    State(state): State<GuardState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request,
    next: Next,
) -> Response {
    let category = state.config.lesson_category.clone();
    session_action(&state, &category, params.ok(), request, next).await
}

/// Heart rewards from ads, keyed by session id. Fails open.
pub async fn ad_reward_guard(
    State(state): State<GuardState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request,
    next: Next,
) -> Response {
    let category = state.config.ad_reward_category.clone();
    session_action(&state, &category, params.ok(), request, next).await
}

async fn session_action(
    state: &GuardState,
    category: &str,
    params: Option<RawPathParams>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = params
        .as_ref()
        .and_then(|params| {
            params
                .iter()
                .find(|(name, value)| *name == SESSION_ID_PARAM && !value.is_empty())
                .map(|(_, value)| format!("session:{value}"))
        })
        .unwrap_or_else(|| ip_identifier(request.headers(), request.extensions()));

    enforce(state, &identifier, category, FailurePolicy::Open, request, next).await
}

async fn enforce(
    state: &GuardState,
    identifier: &str,
    category: &str,
    failure: FailurePolicy,
    request: Request,
    next: Next,
) -> Response {
    match state.evaluator.evaluate_now(identifier, category).await {
        Ok(verdict) if verdict.allowed => {
            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &verdict);
            response
        }
        Ok(verdict) => {
            warn!(
                identifier = %identifier,
                category = %category,
                blocked_until = ?verdict.blocked_until,
                "Rate limit exceeded"
            );
            too_many_requests(&verdict)
        }
        Err(e) => match failure {
            FailurePolicy::Open => {
                warn!(
                    identifier = %identifier,
                    category = %category,
                    error = %e,
                    "Rate limiter unavailable, allowing request"
                );
                next.run(request).await
            }
            FailurePolicy::Closed => {
                error!(
                    identifier = %identifier,
                    category = %category,
                    error = %e,
                    "Rate limiter unavailable, rejecting request"
                );
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "rate_limiter_unavailable",
                    "Rate limiting is temporarily unavailable. Please try again later.",
                )
            }
        },
    }
}

/// Set `X-RateLimit-Remaining` and `X-RateLimit-Reset` when a finite policy
/// produced the verdict.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    if !verdict.is_limited() {
        return;
    }

    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining.max(0)));
    if let Some(reset) = verdict.reset_time {
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset.timestamp()));
    }
}

/// Render a denied verdict as a `429`.
pub fn too_many_requests(verdict: &Verdict) -> Response {
    let retry_after = verdict
        .blocked_until
        .map(|until| until.timestamp().to_string())
        .unwrap_or_default();

    let message = match verdict.blocked_until {
        Some(until) => format!(
            "Too many requests. Try again after {}.",
            until.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => "Too many requests. Try again later.".to_string(),
    };

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitErrorBody {
            error: "rate_limit_exceeded".to_string(),
            message,
            retry_after: retry_after.clone(),
        }),
    )
        .into_response();

    apply_rate_limit_headers(response.headers_mut(), verdict);
    if !retry_after.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&retry_after) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }

    response
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(RateLimitErrorBody {
            error: error.to_string(),
            message: message.to_string(),
            retry_after: String::new(),
        }),
    )
        .into_response()
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// connection peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

fn ip_identifier(headers: &HeaderMap, extensions: &Extensions) -> String {
    let ip = client_ip(headers, extensions).unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    format!("ip:{ip}")
}

fn device_id_from_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("device_id")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn device_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_DEVICE_ID)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
