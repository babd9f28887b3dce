//! HTTP response cache in front of the `/api` read endpoints.
//!
//! ## Cache Key Format
//!
//! `cache:GET:{path}?{sorted query}`, e.g. `cache:GET:/api/devices?page=2`
//!
//! ## Invalidation
//!
//! Every non-`GET` request drops cached reads after its handler ran. The
//! scope is deliberately broad: a dropped entry costs one recomputation, a
//! stale one is a wrong answer.
//!
//! The cache is advisory. Store failures are logged and the request is served
//! live.

pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use cetasense_core::keys::{CACHE_KEY_PREFIX, escape_glob};
use cetasense_core::{StatusStore, cache_key, canonical_uri};

use crate::config::{AppConfig, InvalidationScope};
use crate::metrics::Metrics;

pub use middleware::response_cache;

/// Cached response envelope, serialized as MessagePack.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}

struct Settings {
    ttl: Duration,
    max_body_bytes: usize,
    api_prefix: String,
    invalidation: InvalidationScope,
    stream_prefix: String,
}

/// Shared state of the cache middleware.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn StatusStore>,
    metrics: Metrics,
    settings: Arc<Settings>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn StatusStore>, config: &AppConfig, metrics: Metrics) -> Self {
        Self {
            store,
            metrics,
            settings: Arc::new(Settings {
                ttl: config.cache.ttl(),
                max_body_bytes: config.cache.max_body_bytes,
                api_prefix: config.cache.api_prefix.clone(),
                invalidation: config.cache.invalidation,
                stream_prefix: config.jobs.stream_path_prefix.clone(),
            }),
        }
    }

    /// Key of a `GET` for `path` and `query`.
    #[inline]
    pub fn key_for(path: &str, query: Option<&str>) -> String {
        cache_key("GET", &canonical_uri(path, query))
    }

    /// Store key pattern of the cached reads a write to `path` invalidates.
    pub fn invalidation_pattern(&self, path: &str) -> String {
        let prefix = match self.settings.invalidation {
            InvalidationScope::ApiWide => self.settings.api_prefix.as_str(),
            InvalidationScope::Resource => resource_prefix(path)
                .filter(|p| p.len() > self.settings.api_prefix.len())
                .unwrap_or(self.settings.api_prefix.as_str()),
        };
        format!("{CACHE_KEY_PREFIX}GET:{}*", escape_glob(prefix))
    }

    pub fn is_stream_path(&self, path: &str) -> bool {
        path.starts_with(&self.settings.stream_prefix)
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    pub fn max_body_bytes(&self) -> usize {
        self.settings.max_body_bytes
    }

    pub(crate) fn store(&self) -> &dyn StatusStore {
        self.store.as_ref()
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// First two path segments: `/api/devices/7/readings` → `/api/devices`.
fn resource_prefix(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    let mut ends = rest.match_indices('/').map(|(i, _)| i + 1);
    match (ends.next(), ends.next()) {
        (Some(_), Some(second)) => Some(&path[..second]),
        (Some(_), None) => Some(path.trim_end_matches('/')),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local::LocalStatusStore;

    fn cache(scope: InvalidationScope) -> ResponseCache {
        let mut config = AppConfig::default();
        config.cache.invalidation = scope;
        ResponseCache::new(Arc::new(LocalStatusStore::new()), &config, Metrics::noop())
    }

    #[test]
    fn keys_sort_query_pairs() {
        assert_eq!(
            ResponseCache::key_for("/api/devices", Some("b=2&a=1")),
            "cache:GET:/api/devices?a=1&b=2"
        );
        assert_eq!(
            ResponseCache::key_for("/api/devices", None),
            "cache:GET:/api/devices"
        );
    }

    #[test]
    fn api_wide_pattern() {
        let c = cache(InvalidationScope::ApiWide);
        assert_eq!(c.invalidation_pattern("/api/devices/7"), "cache:GET:/api*");
    }

    #[test]
    fn resource_pattern_uses_collection_path() {
        let c = cache(InvalidationScope::Resource);
        assert_eq!(
            c.invalidation_pattern("/api/devices/7/readings"),
            "cache:GET:/api/devices*"
        );
        assert_eq!(c.invalidation_pattern("/api/devices"), "cache:GET:/api/devices*");
        assert_eq!(c.invalidation_pattern("/api"), "cache:GET:/api*");
    }

    #[test]
    fn resource_prefix_segments() {
        assert_eq!(resource_prefix("/api/a/b"), Some("/api/a"));
        assert_eq!(resource_prefix("/api/a/"), Some("/api/a"));
        assert_eq!(resource_prefix("/api/a"), Some("/api/a"));
        assert_eq!(resource_prefix("/api"), None);
        assert_eq!(resource_prefix("api"), None);
    }

    #[test]
    fn envelope_survives_messagepack() {
        let cached = CachedResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: br#"{"ok":true}"#.to_vec(),
        };
        let bytes = cached.encode().unwrap();
        assert_eq!(CachedResponse::decode(&bytes).unwrap(), cached);
    }
}
