use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::server::AppState;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");
const TIMING_ALLOW_ORIGIN: HeaderName = HeaderName::from_static("timing-allow-origin");
const EXPOSED_HEADERS: &str = "Server-Timing, X-Request-Id, X-Cache";
const MAX_REQUEST_ID_LEN: usize = 128;
const UNMATCHED_ROUTE: &str = "unmatched";

/// Request id carried in request extensions; also the `req_id` of dispatched jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when the client asked for a `text/event-stream` response.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

/// Route template of the request (`/api/localize/stream/{job_id}`), so
/// metric labels stay bounded whatever paths clients send.
pub fn route_label<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

// Middleware that ensures each request has an X-Request-Id and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    // Preserve a sane incoming id, otherwise generate one
    let id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        res.headers_mut().insert(X_REQUEST_ID, value);
    }
    res
}

/// Adds `Server-Timing: app;dur=<ms>` and records request metrics.
///
/// Status streams are skipped: their headers go out before the handler has
/// finished, and their duration is the life of the connection.
pub async fn server_timing(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let is_stream = accepts_event_stream(req.headers())
        || req
            .uri()
            .path()
            .starts_with(&state.config.jobs.stream_path_prefix);
    if is_stream {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let route = route_label(&req);
    let started = Instant::now();

    let mut res = next.run(req).await;

    let elapsed = started.elapsed();
    let dur_ms = elapsed.as_secs_f64() * 1000.0;
    let headers = res.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("app;dur={dur_ms:.2}")) {
        headers.insert(SERVER_TIMING, value);
    }
    headers.insert(TIMING_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.append(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );

    state
        .metrics
        .http_request(method.as_str(), &route, res.status().as_u16(), elapsed);
    tracing::debug!(method = %method, route = %route, status = res.status().as_u16(), dur_ms, "request timed");
    res
}
