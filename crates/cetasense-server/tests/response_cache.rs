//! Response cache middleware behaviour against a counting handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
};
use cetasense_core::{JobId, JobStatusRecord, MessageStream, StatusStore, StoreError};
use cetasense_server::{
    AppConfig, InvalidationScope, LocalStatusStore, Metrics, ResponseCache, cache::response_cache,
};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn list_devices(State(counter): State<Counter>) -> impl IntoResponse {
    let n = counter.0.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "devices": ["ap-1", "ap-2"], "render": n }))
}

async fn create_device(State(counter): State<Counter>) -> impl IntoResponse {
    counter.0.fetch_add(1, Ordering::SeqCst);
    (StatusCode::CREATED, Json(json!({ "id": "ap-3" })))
}

async fn missing(State(counter): State<Counter>) -> impl IntoResponse {
    counter.0.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

fn app(store: Arc<dyn StatusStore>, config: &AppConfig) -> (Router, Counter) {
    let counter = Counter::default();
    let cache = ResponseCache::new(store, config, Metrics::noop());
    let router = Router::new()
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/readings", get(list_devices).delete(create_device))
        .route("/api/missing", get(missing))
        .route("/api/localize/stream/{job_id}", get(list_devices))
        .layer(middleware::from_fn_with_state(cache, response_cache))
        .with_state(counter.clone());
    (router, counter)
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let marker = resp
        .headers()
        .get("x-cache")
        .map(|v| v.to_str().unwrap().to_string());
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, marker, body)
}

#[tokio::test]
async fn repeated_gets_are_served_from_cache() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());

    let (status, marker, first) = call(&app, "GET", "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(marker.as_deref(), Some("MISS"));

    for _ in 0..3 {
        let (status, marker, body) = call(&app, "GET", "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(marker.as_deref(), Some("HIT"));
        assert_eq!(body, first);
    }
    assert_eq!(counter.calls(), 1);
}

#[tokio::test]
async fn hit_keeps_content_type() {
    let (app, _) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());
    call(&app, "GET", "/api/devices").await;

    let req = Request::builder()
        .uri("/api/devices")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.headers()["x-cache"], "HIT");
    assert_eq!(resp.headers()["content-type"], "application/json");
}

#[tokio::test]
async fn query_order_does_not_split_entries() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());

    call(&app, "GET", "/api/devices?b=2&a=1").await;
    let (_, marker, _) = call(&app, "GET", "/api/devices?a=1&b=2").await;
    assert_eq!(marker.as_deref(), Some("HIT"));

    let (_, marker, _) = call(&app, "GET", "/api/devices?a=1").await;
    assert_eq!(marker.as_deref(), Some("MISS"));
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn write_invalidates_cached_reads() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());

    let (_, _, before) = call(&app, "GET", "/api/devices").await;
    call(&app, "GET", "/api/readings").await;

    let (status, _, _) = call(&app, "POST", "/api/devices").await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, marker, after) = call(&app, "GET", "/api/devices").await;
    assert_eq!(marker.as_deref(), Some("MISS"));
    assert_ne!(after, before);

    // api-wide scope drops sibling collections too
    let (_, marker, _) = call(&app, "GET", "/api/readings").await;
    assert_eq!(marker.as_deref(), Some("MISS"));
    assert_eq!(counter.calls(), 5);
}

#[tokio::test]
async fn head_and_preflight_keep_cached_reads() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());
    call(&app, "GET", "/api/devices").await;

    call(&app, "HEAD", "/api/devices").await;
    call(&app, "OPTIONS", "/api/devices").await;

    let (_, marker, _) = call(&app, "GET", "/api/devices").await;
    assert_eq!(marker.as_deref(), Some("HIT"));
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn resource_scope_keeps_other_collections() {
    let mut config = AppConfig::default();
    config.cache.invalidation = InvalidationScope::Resource;
    let (app, _) = app(Arc::new(LocalStatusStore::new()), &config);

    call(&app, "GET", "/api/devices").await;
    call(&app, "GET", "/api/readings").await;
    call(&app, "DELETE", "/api/readings").await;

    let (_, marker, _) = call(&app, "GET", "/api/readings").await;
    assert_eq!(marker.as_deref(), Some("MISS"));
    let (_, marker, _) = call(&app, "GET", "/api/devices").await;
    assert_eq!(marker.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn error_responses_are_not_cached() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());

    for _ in 0..2 {
        let (status, marker, _) = call(&app, "GET", "/api/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(marker.as_deref(), Some("MISS"));
    }
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn oversized_responses_pass_through_uncached() {
    let mut config = AppConfig::default();
    config.cache.max_body_bytes = 8;
    let store = Arc::new(LocalStatusStore::new());
    let (app, counter) = app(store.clone(), &config);

    call(&app, "GET", "/api/devices").await;
    let (status, marker, _) = call(&app, "GET", "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(marker.as_deref(), Some("MISS"));
    assert_eq!(counter.calls(), 2);
    assert_eq!(store.blob_count(), 0);
}

#[tokio::test]
async fn event_streams_bypass_the_cache() {
    let (app, counter) = app(Arc::new(LocalStatusStore::new()), &AppConfig::default());

    for _ in 0..2 {
        let req = Request::builder()
            .uri("/api/devices")
            .header("accept", "text/event-stream")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert!(resp.headers().get("x-cache").is_none());
    }

    let (_, marker, _) = call(&app, "GET", "/api/localize/stream/abc").await;
    assert!(marker.is_none());
    assert_eq!(counter.calls(), 3);
}

/// Store whose every operation fails, as if the server were unreachable.
struct DownStore;

fn down() -> StoreError {
    StoreError::Connection("connection refused".into())
}

#[async_trait]
impl StatusStore for DownStore {
    fn mode(&self) -> &'static str {
        "down"
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }
    async fn get_blob(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(down())
    }
    async fn put_blob(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        Err(down())
    }
    async fn delete_matching(&self, _pattern: &str) -> Result<usize, StoreError> {
        Err(down())
    }
    async fn job_status(&self, _job_id: &JobId) -> Result<Option<JobStatusRecord>, StoreError> {
        Err(down())
    }
    async fn subscribe(&self, _channel: &str) -> Result<MessageStream, StoreError> {
        Err(down())
    }
    async fn publish_status(
        &self,
        _job_id: &JobId,
        _record: &JobStatusRecord,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Err(down())
    }
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    let (app, counter) = app(Arc::new(DownStore), &AppConfig::default());

    for _ in 0..2 {
        let (status, marker, body) = call(&app, "GET", "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(marker.as_deref(), Some("MISS"));
        assert!(!body.is_empty());
    }

    let (status, _, _) = call(&app, "POST", "/api/devices").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(counter.calls(), 3);
}
