//! End-to-end tests for the guard middleware mounted on an axum router.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header, Request, StatusCode},
    middleware::from_fn_with_state,
    response::Response,
    routing::post,
    Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use tower::ServiceExt;

use tollgate::config::GuardConfig;
use tollgate::http::{
    ad_reward_guard, general_guard, lesson_guard, session_guard, strict_guard, GuardState,
    RateLimitErrorBody, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
use tollgate::ratelimit::{
    ConfigRegistry, InMemoryLimiterStore, LimiterStore, LiveWindows, RateLimitEvaluator,
    RateLimitPolicy, StoreError, StoreResult, WindowRecord, API_GENERAL, API_STRICT,
    GUEST_SESSION, HEARTS_FROM_AD, LESSON_COMPLETE,
};

struct UnavailableStore;

#[async_trait]
impl LimiterStore for UnavailableStore {
    async fn get(&self, _: &str, _: &str) -> StoreResult<Option<WindowRecord>> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }

    async fn create(&self, _: &WindowRecord) -> StoreResult<()> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }

    async fn update(&self, _: &WindowRecord) -> StoreResult<()> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }

    async fn delete_expired(&self, _: DateTime<Utc>, _: &LiveWindows) -> StoreResult<u64> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }

    async fn delete(&self, _: &str, _: &str) -> StoreResult<bool> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }

    async fn count(&self) -> StoreResult<u64> {
        Err(StoreError::Corrupt("store offline".to_string()))
    }
}

fn policies(max_requests: u32) -> Vec<RateLimitPolicy> {
    [API_GENERAL, API_STRICT, GUEST_SESSION, LESSON_COMPLETE, HEARTS_FROM_AD]
        .into_iter()
        .map(|category| {
            RateLimitPolicy::new(
                category,
                max_requests,
                TimeDelta::minutes(15),
                TimeDelta::minutes(30),
                "test policy",
            )
        })
        .collect()
}

fn guard_state(store: Arc<dyn LimiterStore>, max_requests: u32) -> GuardState {
    let registry = Arc::new(ConfigRegistry::from_policies(policies(max_requests)));
    GuardState::new(
        Arc::new(RateLimitEvaluator::new(registry, store)),
        GuardConfig::default(),
    )
}

/// Echo the request body so tests can check it reached the handler intact.
async fn echo(body: Bytes) -> Bytes {
    body
}

fn app(state: GuardState) -> Router {
    Router::new()
        .route(
            "/api/items",
            post(echo).layer(from_fn_with_state(state.clone(), general_guard)),
        )
        .route(
            "/admin/keys",
            post(echo).layer(from_fn_with_state(state.clone(), strict_guard)),
        )
        .route(
            "/sessions",
            post(echo).layer(from_fn_with_state(state.clone(), session_guard)),
        )
        .route(
            "/sessions/{session_id}/lessons/complete",
            post(echo).route_layer(from_fn_with_state(state.clone(), lesson_guard)),
        )
        .route(
            "/sessions/{session_id}/ads/reward",
            post(echo).route_layer(from_fn_with_state(state, ad_reward_guard)),
        )
}

fn request(uri: &str, ip: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_bytes(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

#[tokio::test]
async fn test_allowed_requests_carry_rate_limit_headers() {
    let router = app(guard_state(Arc::new(InMemoryLimiterStore::new()), 3));

    for expected_remaining in ["2", "1", "0"] {
        let response = router
            .clone()
            .oneshot(request("/api/items", "203.0.113.1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], expected_remaining);
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
    }
}

#[tokio::test]
async fn test_denied_request_returns_429() {
    let router = app(guard_state(Arc::new(InMemoryLimiterStore::new()), 1));

    let first = router
        .clone()
        .oneshot(request("/api/items", "203.0.113.2", Body::empty()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let denied = router
        .clone()
        .oneshot(request("/api/items", "203.0.113.2", Body::empty()))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after = denied.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(denied.headers()[X_RATELIMIT_REMAINING], "0");
    assert_eq!(denied.headers()[X_RATELIMIT_RESET], retry_after.as_str());

    let body: RateLimitErrorBody = serde_json::from_slice(&body_bytes(denied).await).unwrap();
    assert_eq!(body.error, "rate_limit_exceeded");
    assert_eq!(body.retry_after, retry_after);

    let blocked_until: i64 = retry_after.parse().unwrap();
    let expected = Utc::now() + TimeDelta::minutes(30);
    assert!((blocked_until - expected.timestamp()).abs() <= 5);

    // Other clients are unaffected.
    let other = router
        .oneshot(request("/api/items", "203.0.113.3", Body::empty()))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_general_guard_fails_open() {
    let router = app(guard_state(Arc::new(UnavailableStore), 1));

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(request("/api/items", "203.0.113.4", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(X_RATELIMIT_REMAINING));
    }
}

#[tokio::test]
async fn test_strict_guard_fails_closed() {
    let router = app(guard_state(Arc::new(UnavailableStore), 1));

    let response = router
        .oneshot(request("/admin/keys", "203.0.113.5", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: RateLimitErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body.error, "rate_limiter_unavailable");
}

#[tokio::test]
async fn test_session_guard_keys_on_device_and_preserves_body() {
    let store = Arc::new(InMemoryLimiterStore::new());
    let router = app(guard_state(store.clone(), 2));
    let payload = r#"{"device_id":"device-42","locale":"en"}"#;

    let response = router
        .clone()
        .oneshot(request("/sessions", "203.0.113.6", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, payload.as_bytes());

    let record = store
        .get("device:device-42", GUEST_SESSION)
        .await
        .unwrap()
        .expect("device record");
    assert_eq!(record.request_count, 1);

    // Same device from a different address shares the limit.
    let response = router
        .clone()
        .oneshot(request("/sessions", "198.51.100.9", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(request("/sessions", "198.51.100.10", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_session_guard_falls_back_to_header_then_ip() {
    let store = Arc::new(InMemoryLimiterStore::new());
    let router = app(guard_state(store.clone(), 5));

    let mut with_header = request("/sessions", "203.0.113.7", Body::empty());
    with_header
        .headers_mut()
        .insert("x-device-id", "hdr-device".parse().unwrap());
    let response = router.clone().oneshot(with_header).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(request("/sessions", "203.0.113.7", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(store
        .get("device:hdr-device", GUEST_SESSION)
        .await
        .unwrap()
        .is_some());
    assert!(store
        .get("ip:203.0.113.7", GUEST_SESSION)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_session_guard_rejects_oversized_body() {
    let store: Arc<dyn LimiterStore> = Arc::new(InMemoryLimiterStore::new());
    let registry = Arc::new(ConfigRegistry::from_policies(policies(5)));
    let state = GuardState::new(
        Arc::new(RateLimitEvaluator::new(registry, store)),
        GuardConfig {
            body_limit_bytes: 16,
            ..GuardConfig::default()
        },
    );

    let response = app(state)
        .oneshot(request("/sessions", "203.0.113.8", vec![b'x'; 64]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_lesson_guard_keys_on_session_path() {
    let store = Arc::new(InMemoryLimiterStore::new());
    let router = app(guard_state(store.clone(), 1));

    let response = router
        .clone()
        .oneshot(request(
            "/sessions/s-1/lessons/complete",
            "203.0.113.9",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(request(
            "/sessions/s-1/lessons/complete",
            "203.0.113.9",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different session from the same address has its own budget.
    let response = router
        .oneshot(request(
            "/sessions/s-2/lessons/complete",
            "203.0.113.9",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio_test::assert_ok!(store.get("session:s-1", LESSON_COMPLETE).await);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_ad_reward_guard_keys_on_session_path() {
    let store = Arc::new(InMemoryLimiterStore::new());
    let router = app(guard_state(store.clone(), 2));

    for expected in [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
        let response = router
            .clone()
            .oneshot(request("/sessions/s-9/ads/reward", "203.0.113.10", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), expected);
    }

    // Lesson completions for the same session draw on a separate budget.
    let response = router
        .oneshot(request(
            "/sessions/s-9/lessons/complete",
            "203.0.113.10",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let reward = store
        .get("session:s-9", HEARTS_FROM_AD)
        .await
        .unwrap()
        .expect("ad reward record");
    assert_eq!(reward.request_count, 2);
    assert!(reward.blocked_until.is_some());

    let lesson = store
        .get("session:s-9", LESSON_COMPLETE)
        .await
        .unwrap()
        .expect("lesson record");
    assert_eq!(lesson.request_count, 1);
    assert!(lesson.blocked_until.is_none());
}
