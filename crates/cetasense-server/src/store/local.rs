//! In-process status store for single-instance deployments and tests.
//!
//! Blobs and status records live in `DashMap`s with an expiry instant; each
//! pub/sub channel is a `tokio::sync::broadcast` sender created on first
//! subscribe and removed when its last subscription is dropped. Subscribing
//! never waits on I/O, so the acknowledgement is immediate.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cetasense_core::keys::glob_match;
use cetasense_core::{
    JobId, JobStatusRecord, MessageStream, StatusStore, StoreError, notify_channel, status_key,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{Stream, StreamExt};
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type Channels = Arc<DashMap<String, broadcast::Sender<String>>>;

/// A channel subscription that drops the channel's sender once nobody else
/// is listening.
struct Subscription {
    inner: Option<BoxStream<'static, String>>,
    channels: Channels,
    channel: String,
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        match self.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver has to go first or the count never reaches zero.
        drop(self.inner.take());
        self.channels
            .remove_if(&self.channel, |_, tx| tx.receiver_count() == 0);
    }
}

#[derive(Clone, Default)]
pub struct LocalStatusStore {
    blobs: Arc<DashMap<String, Expiring<Vec<u8>>>>,
    statuses: Arc<DashMap<String, Expiring<JobStatusRecord>>>,
    channels: Channels,
}

impl LocalStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a raw payload on a channel. Returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels with a sender, live or not.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of unexpired cached blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.iter().filter(|e| !e.is_expired()).count()
    }
}

#[async_trait]
impl StatusStore for LocalStatusStore {
    fn mode(&self) -> &'static str {
        "local"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.blobs.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.blobs.remove(key);
        }
        Ok(None)
    }

    async fn put_blob(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.blobs.insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let before = self.blobs.len() + self.statuses.len();
        self.blobs.retain(|key, _| !glob_match(pattern, key));
        self.statuses.retain(|key, _| !glob_match(pattern, key));
        Ok(before.saturating_sub(self.blobs.len() + self.statuses.len()))
    }

    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatusRecord>, StoreError> {
        let key = status_key(job_id);
        if let Some(entry) = self.statuses.get(&key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.statuses.remove(&key);
        }
        Ok(None)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let name = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let channel = name.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "local subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(Subscription {
            inner: Some(stream.boxed()),
            channels: Arc::clone(&self.channels),
            channel: channel.to_string(),
        }))
    }

    async fn publish_status(
        &self,
        job_id: &JobId,
        record: &JobStatusRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        match self.statuses.entry(status_key(job_id)) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().value.status;
                if !slot.get().is_expired() && !current.can_transition_to(record.status) {
                    return Err(StoreError::InvalidTransition {
                        from: current.to_string(),
                        to: record.status.to_string(),
                    });
                }
                slot.insert(Expiring::new(record.clone(), ttl));
            }
            Entry::Vacant(slot) => {
                slot.insert(Expiring::new(record.clone(), ttl));
            }
        }

        let payload = record.to_event(job_id).to_json()?;
        self.publish(&notify_channel(job_id), payload);
        Ok(())
    }
}
