//! Integration tests for the Redis status store.
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::time::Duration;

use cetasense_core::{JobId, JobStatus, JobStatusRecord, StatusStore, StoreError, notify_channel};
use cetasense_server::{RedisConfig, create_status_store};
use futures_util::StreamExt;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

const TTL: Duration = Duration::from_secs(60);

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_store() -> std::sync::Arc<dyn StatusStore> {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 5,
        timeout_ms: 5000,
    };
    let store = create_status_store(&config).await;
    assert_eq!(store.mode(), "redis");
    store
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn blobs_round_trip_and_invalidate() {
    let store = redis_store().await;

    store
        .put_blob("cache:GET:/api/devices", b"[1]".to_vec(), TTL)
        .await
        .unwrap();
    store
        .put_blob("cache:GET:/api/readings?a=1", b"[2]".to_vec(), TTL)
        .await
        .unwrap();
    assert_eq!(
        store.get_blob("cache:GET:/api/devices").await.unwrap(),
        Some(b"[1]".to_vec())
    );

    let removed = store.delete_matching("cache:GET:/api*").await.unwrap();
    assert!(removed >= 2);
    assert!(store.get_blob("cache:GET:/api/devices").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn status_hash_uses_worker_field_names() {
    let store = redis_store().await;
    let job = JobId::generate();

    store
        .publish_status(&job, &JobStatusRecord::done(1.5, 2.25), TTL)
        .await
        .unwrap();

    let client = redis::Client::open(get_redis_url().await).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
        .arg(format!("status:{job}"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(fields["status"], "done");
    assert_eq!(fields["result_x"], "1.5");
    assert_eq!(fields["result_y"], "2.25");
    assert!(fields.contains_key("updated_at"));

    let record = store.job_status(&job).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn subscription_sees_publishes_after_ack() {
    let store = redis_store().await;
    let job = JobId::generate();

    let mut sub = store.subscribe(&notify_channel(&job)).await.unwrap();
    store
        .publish_status(&job, &JobStatusRecord::running(), TTL)
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("no message")
        .expect("subscription closed");
    let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(event["status"], "running");
    assert_eq!(event["job_id"], job.as_str());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn terminal_status_cannot_regress() {
    let store = redis_store().await;
    let job = JobId::generate();

    store
        .publish_status(&job, &JobStatusRecord::failed("no fix"), TTL)
        .await
        .unwrap();
    let err = store
        .publish_status(&job, &JobStatusRecord::running(), TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn racing_terminal_writers_land_exactly_once() {
    let store = redis_store().await;
    let job = JobId::generate();
    store
        .publish_status(&job, &JobStatusRecord::running(), TTL)
        .await
        .unwrap();
    let mut sub = store.subscribe(&notify_channel(&job)).await.unwrap();

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let job = job.clone();
            tokio::spawn(async move {
                let record = if i % 2 == 0 {
                    JobStatusRecord::done(f64::from(i), 0.0)
                } else {
                    JobStatusRecord::failed(format!("worker {i}"))
                };
                store.publish_status(&job, &record, TTL).await
            })
        })
        .collect();

    let mut landed = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(()) => landed += 1,
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(landed, 1);

    let first = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("no terminal event")
        .expect("subscription closed");
    let first: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), sub.next())
            .await
            .is_err(),
        "a second terminal event was published"
    );

    let stored = store.job_status(&job).await.unwrap().unwrap();
    assert_eq!(stored.status.as_str(), first["status"].as_str().unwrap());
}
