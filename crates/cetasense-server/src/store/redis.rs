//! Redis-backed status store.
//!
//! Commands go through a `deadpool_redis` pool. Each subscription opens a
//! dedicated pub/sub connection, because a connection in subscribe mode cannot
//! be returned to the pool.
//!
//! Status writes are optimistic: the record is `WATCH`ed, checked, and
//! replaced in a `MULTI`, so two writers racing on the same job cannot both
//! land a terminal status.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cetasense_core::{
    JobId, JobStatus, JobStatusRecord, MessageStream, StatusStore, StoreError, notify_channel,
    status_key,
};
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;

const SCAN_BATCH: usize = 500;
const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct RedisStatusStore {
    pool: Pool,
    redis_url: String,
    timeout: Duration,
}

impl RedisStatusStore {
    /// `timeout` bounds opening a pub/sub connection and its subscribe ack.
    pub fn new(pool: Pool, redis_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            timeout,
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Collect keys matching `pattern` with incremental `SCAN`.
    async fn scan_keys(
        &self,
        conn: &mut deadpool_redis::Connection,
        pattern: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(command_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    fn mode(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(command_error)
    }

    async fn put_blob(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(command_error)?;
        tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "blob stored");
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let keys = self.scan_keys(&mut conn, pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(&keys).await.map_err(command_error)?;
        tracing::debug!(pattern = %pattern, removed, "deleted matching keys");
        Ok(removed)
    }

    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatusRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(status_key(job_id))
            .await
            .map_err(command_error)?;
        Ok(JobStatusRecord::from_fields(&fields)?)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| StoreError::Connection(format!("failed to create Redis client: {e}")))?;

        let mut pubsub = tokio::time::timeout(self.timeout, client.get_async_pubsub())
            .await
            .map_err(|_| {
                StoreError::Connection(format!(
                    "pub/sub connection timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| StoreError::Connection(format!("failed to get pub/sub connection: {e}")))?;

        // Returns once Redis has confirmed the subscription.
        tokio::time::timeout(self.timeout, pubsub.subscribe(channel))
            .await
            .map_err(|_| StoreError::Subscribe(format!("no ack within {:?}", self.timeout)))?
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;

        tracing::debug!(channel = %channel, "subscribed");

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "dropping non-text payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn publish_status(
        &self,
        job_id: &JobId,
        record: &JobStatusRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = status_key(job_id);
        let payload = record.to_event(job_id).to_json()?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        let mut conn = self.conn().await?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let _: () = redis::cmd("WATCH")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;

            let current: Option<String> = conn.hget(&key, "status").await.map_err(command_error)?;
            if let Some(current) = current {
                let current: JobStatus = current.parse()?;
                if !current.can_transition_to(record.status) {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut conn)
                        .await
                        .map_err(command_error)?;
                    return Err(StoreError::InvalidTransition {
                        from: current.to_string(),
                        to: record.status.to_string(),
                    });
                }
            }

            // Hash first, then notify, so a subscriber that sees the event can
            // always read the matching record. EXEC returns nil if another
            // writer touched the key since WATCH.
            let committed: Option<()> = redis::pipe()
                .atomic()
                .del(&key)
                .ignore()
                .hset_multiple(&key, &record.to_fields())
                .ignore()
                .expire(&key, ttl_secs)
                .ignore()
                .publish(notify_channel(job_id), &payload)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;

            if committed.is_some() {
                tracing::debug!(job_id = %job_id, status = %record.status, "status published");
                return Ok(());
            }
            tracing::debug!(job_id = %job_id, attempt, "status write raced, retrying");
        }

        Err(StoreError::Command(format!(
            "status write for {job_id} kept conflicting after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn subscribe_gives_up_on_silent_server() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = format!("redis://{addr}");
        let pool = deadpool_redis::Config::from_url(&url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let store = RedisStatusStore::new(pool, url, Duration::from_millis(200));

        let started = Instant::now();
        let result = store.subscribe("notify:silent").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        match result {
            Err(StoreError::Connection(_) | StoreError::Subscribe(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("subscribe succeeded against a silent server"),
        }
    }
}
