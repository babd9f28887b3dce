//! Status store backends.
//!
//! - **Local**: single instance, in-process maps and broadcast channels
//! - **Redis**: shared with the worker pool and every server instance

pub mod local;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use cetasense_core::StatusStore;

use crate::config::RedisConfig;

pub use self::local::LocalStatusStore;
pub use self::redis::RedisStatusStore;

/// Build the status store from configuration.
///
/// If Redis is enabled but unreachable, falls back to the local store so the
/// server still starts; `/readyz` reports the mode in use.
pub async fn create_status_store(config: &RedisConfig) -> Arc<dyn StatusStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local status store");
        return Arc::new(LocalStatusStore::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local status store."
            );
            return Arc::new(LocalStatusStore::new());
        }
    };

    let store = RedisStatusStore::new(pool, config.url.clone(), timeout);
    match store.ping().await {
        Ok(()) => {
            tracing::info!("Connected to Redis");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local status store."
            );
            Arc::new(LocalStatusStore::new())
        }
    }
}
