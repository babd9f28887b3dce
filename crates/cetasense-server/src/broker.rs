//! Job broker.
//!
//! The dispatcher only needs "put this payload on that durable queue". The
//! AMQP implementation keeps one connection and channel open and declares
//! queues lazily; a failed publish drops the channel so the next call
//! reconnects. Publishes are never retried here.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::BrokerConfig;

/// Persistent delivery mode for AMQP messages.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue '{queue}' declaration failed: {message}")]
    Declare { queue: String, message: String },

    #[error("publish to '{queue}' failed: {message}")]
    Publish { queue: String, message: String },
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue `payload` on the durable queue `queue`. Succeeds once the
    /// broker has accepted the message.
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

struct AmqpSession {
    // Kept alive for the channel's lifetime.
    _connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

pub struct AmqpBroker {
    url: String,
    connect_timeout: Duration,
    session: Mutex<Option<AmqpSession>>,
}

impl AmqpBroker {
    /// Create a broker handle. No connection is made until the first publish
    /// (or [`AmqpBroker::connect`]).
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.connection_url(),
            connect_timeout: config.connect_timeout(),
            session: Mutex::new(None),
        }
    }

    /// Open the connection eagerly and declare `queue`.
    pub async fn connect(&self, queue: &str) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        let session = self.session_mut(&mut *guard).await?;
        declare(session, queue).await
    }

    async fn session_mut<'a>(
        &self,
        slot: &'a mut Option<AmqpSession>,
    ) -> Result<&'a mut AmqpSession, BrokerError> {
        let usable = slot
            .as_ref()
            .is_some_and(|s| s.channel.status().connected());
        if !usable {
            *slot = None;
            let session = self.open().await?;
            *slot = Some(session);
        }
        slot.as_mut()
            .ok_or_else(|| BrokerError::Connect("no session".into()))
    }

    async fn open(&self) -> Result<AmqpSession, BrokerError> {
        let connect = Connection::connect(&self.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| BrokerError::Timeout(self.connect_timeout))?
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        tracing::info!("connected to job broker");
        Ok(AmqpSession {
            _connection: connection,
            channel,
            declared: HashSet::new(),
        })
    }
}

async fn declare(session: &mut AmqpSession, queue: &str) -> Result<(), BrokerError> {
    if session.declared.contains(queue) {
        return Ok(());
    }
    session
        .channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Declare {
            queue: queue.to_string(),
            message: e.to_string(),
        })?;
    session.declared.insert(queue.to_string());
    tracing::debug!(queue = %queue, "queue declared");
    Ok(())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;

        let result = async {
            let session = self.session_mut(&mut *guard).await?;
            declare(session, queue).await?;

            let publish_err = |e: lapin::Error| BrokerError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            };
            session
                .channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
                )
                .await
                .map_err(publish_err)?
                .await
                .map_err(publish_err)?;
            Ok::<(), BrokerError>(())
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }
}
