use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{CachedResponse, ResponseCache};
use crate::error::ApiError;
use crate::middleware::accepts_event_stream;

pub const X_CACHE: &str = "x-cache";

/// Response cache middleware for the `/api` router.
///
/// - event streams pass straight through
/// - `GET` is served from the store on a hit (`X-Cache: HIT`), otherwise the
///   handler runs and a 2xx response is written back (`X-Cache: MISS`)
/// - writes (`POST`, `PUT`, `PATCH`, `DELETE`) run the handler, then
///   invalidate cached reads
/// - anything else (`HEAD`, `OPTIONS`) passes through untouched
pub async fn response_cache(
    State(cache): State<ResponseCache>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if accepts_event_stream(req.headers()) || cache.is_stream_path(req.uri().path()) {
        return next.run(req).await;
    }

    if is_write(req.method()) {
        let path = req.uri().path().to_string();
        let res = next.run(req).await;
        invalidate(&cache, &path).await;
        return res;
    }
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let key = ResponseCache::key_for(req.uri().path(), req.uri().query());

    if let Some(hit) = lookup(&cache, &key).await {
        tracing::debug!(key = %key, bytes = hit.body.len(), "cache hit");
        cache.metrics().cache_hit();
        return hit_response(hit);
    }

    tracing::debug!(key = %key, "cache miss");
    cache.metrics().cache_miss();
    let res = next.run(req).await;
    store_miss(&cache, &key, res).await
}

fn is_write(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn lookup(cache: &ResponseCache, key: &str) -> Option<CachedResponse> {
    let data = match cache.store().get_blob(key).await {
        Ok(data) => data?,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "cache read failed, serving live");
            cache.metrics().cache_error("get");
            return None;
        }
    };
    match CachedResponse::decode(&data) {
        Ok(cached) => Some(cached),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to deserialize cached response");
            cache.metrics().cache_error("decode");
            None
        }
    }
}

fn hit_response(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut res = (status, cached.body).into_response();
    let headers = res.headers_mut();
    headers.remove(header::CONTENT_TYPE);
    if let Some(value) = cached
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    res
}

/// Buffer a live response, write it back if cacheable, and return it.
async fn store_miss(cache: &ResponseCache, key: &str, res: Response) -> Response {
    let declared_len = res
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let cacheable = res.status().is_success()
        && declared_len.is_none_or(|len| len <= cache.max_body_bytes());

    let (mut parts, body) = res.into_parts();
    parts
        .headers
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    if !cacheable {
        return Response::from_parts(parts, body);
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "failed to read response body");
            return ApiError::Internal("failed to read response body".into()).into_response();
        }
    };

    if bytes.len() <= cache.max_body_bytes() {
        let cached = CachedResponse {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: bytes.to_vec(),
        };
        write_back(cache, key, &cached).await;
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn write_back(cache: &ResponseCache, key: &str, cached: &CachedResponse) {
    let data = match cached.encode() {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to serialize response for cache");
            cache.metrics().cache_error("encode");
            return;
        }
    };
    match cache.store().put_blob(key, data, cache.ttl()).await {
        Ok(()) => tracing::debug!(key = %key, status = cached.status, bytes = cached.body.len(), "cached response"),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "cache write failed");
            cache.metrics().cache_error("set");
        }
    }
}

async fn invalidate(cache: &ResponseCache, path: &str) {
    let pattern = cache.invalidation_pattern(path);
    match cache.store().delete_matching(&pattern).await {
        Ok(removed) => {
            if removed > 0 {
                tracing::debug!(pattern = %pattern, removed, "invalidated cached reads");
            }
            cache.metrics().cache_invalidated(removed);
        }
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "cache invalidation failed");
            cache.metrics().cache_error("invalidate");
        }
    }
}
