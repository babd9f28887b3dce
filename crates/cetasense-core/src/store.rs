//! Status store contract.
//!
//! One physical store backs three roles:
//!
//! - TTL'd blobs for the HTTP response cache
//! - per-job status hashes (`status:<job_id>`) holding the last-known status
//! - per-job pub/sub channels (`notify:<job_id>`) carrying status events
//!
//! The HTTP-facing side only reads status and subscribes; `publish_status` is
//! the worker-side write path.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::job::{JobId, JobStatusRecord};

/// Messages delivered on a subscribed channel, in publish order.
///
/// The stream ends when the underlying connection is lost. Dropping it
/// releases the subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Errors that can occur talking to the status store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store pool error: {0}")]
    Pool(String),

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command error: {0}")]
    Command(String),

    #[error("Store subscribe error: {0}")]
    Subscribe(String),

    #[error("Invalid status record: {0}")]
    InvalidRecord(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<crate::error::CoreError> for StoreError {
    fn from(err: crate::error::CoreError) -> Self {
        use crate::error::CoreError;
        match err {
            CoreError::JsonError(e) => StoreError::Serialization(e.to_string()),
            other => StoreError::InvalidRecord(other.to_string()),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Short label for logs and health output ("redis", "local").
    fn mode(&self) -> &'static str;

    /// Round-trip to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put_blob(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Delete every key matching a glob pattern. Returns the number of keys removed.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError>;

    /// Read the `status:<job_id>` hash.
    async fn job_status(&self, job_id: &JobId) -> Result<Option<JobStatusRecord>, StoreError>;

    /// Subscribe to a channel. Resolves only after the store has acknowledged
    /// the subscription, so anything published afterwards is delivered.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;

    /// Worker-side write: store the status hash with `ttl`, then publish the
    /// event on `notify:<job_id>`. Non-monotonic transitions are rejected.
    async fn publish_status(
        &self,
        job_id: &JobId,
        record: &JobStatusRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}
