//! Status relay: streams one job's status events to a client over SSE.
//!
//! Per connection:
//!
//! ```text
//! SUBSCRIBING ──ack──► CONNECTED ──► REPLAYED ──► LIVE ──► CLOSED
//!      │                                │           │
//!      └── error: 503, no stream        └─terminal──┴──terminal / client gone / store closed / shutdown
//! ```
//!
//! The subscription is acknowledged before the status hash is read, so a
//! status written before the subscribe is seen by the replay and one published
//! after it is seen live. Both may deliver the same non-terminal status twice;
//! a terminal status always closes the stream after exactly one event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use cetasense_core::{JobEvent, JobId, MessageStream, StatusStore, notify_channel, published_status};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::server::AppState;

const EVENT_BUFFER: usize = 16;

/// Why a relay connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The replayed record was already terminal.
    Replayed,
    /// A terminal event arrived on the channel.
    Terminal,
    /// The client went away.
    ClientGone,
    /// The store closed the subscription.
    StoreClosed,
    /// The server is shutting down.
    Shutdown,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Replayed => "replayed",
            RelayOutcome::Terminal => "terminal",
            RelayOutcome::ClientGone => "client_gone",
            RelayOutcome::StoreClosed => "store_closed",
            RelayOutcome::Shutdown => "shutdown",
        }
    }
}

type EventSender = mpsc::Sender<String>;

/// Event payloads of one relay connection, in emission order.
pub type RelayEvents = ReceiverStream<String>;

#[derive(Clone)]
pub struct StatusRelay {
    store: Arc<dyn StatusStore>,
    metrics: Metrics,
    keep_alive: Duration,
    shutdown: CancellationToken,
}

impl StatusRelay {
    pub fn new(store: Arc<dyn StatusStore>, metrics: Metrics, keep_alive: Duration) -> Self {
        Self {
            store,
            metrics,
            keep_alive,
            shutdown: CancellationToken::new(),
        }
    }

    /// End every open stream, and any opened afterwards once it reaches the
    /// live phase. Lets graceful shutdown finish while jobs are still running.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Subscribe to the job's channel and start relaying. Fails before any
    /// byte is streamed if the subscription cannot be established.
    pub async fn open(&self, job_id: JobId) -> Result<RelayEvents, ApiError> {
        let channel = notify_channel(&job_id);
        let sub = {
            let _step = self.metrics.step("relay.subscribe");
            self.store.subscribe(&channel).await.map_err(|e| {
                tracing::error!(job_id = %job_id, channel = %channel, error = %e, "subscribe failed");
                ApiError::unavailable("failed to subscribe to job status")
            })?
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        metrics.stream_opened();
        tokio::spawn(async move {
            let outcome = relay(store.as_ref(), &job_id, sub, &tx, &shutdown, &metrics).await;
            tracing::debug!(job_id = %job_id, outcome = outcome.as_str(), "status stream closed");
            metrics.stream_closed(outcome.as_str());
        });

        Ok(ReceiverStream::new(rx))
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }
}

/// Drive one connection from CONNECTED to CLOSED.
///
/// The status hash is read before `connected` is emitted, so once a client
/// has seen `connected`, anything further reaches it through the channel.
async fn relay(
    store: &dyn StatusStore,
    job_id: &JobId,
    mut sub: MessageStream,
    tx: &EventSender,
    shutdown: &CancellationToken,
    metrics: &Metrics,
) -> RelayOutcome {
    let replayed = {
        let _step = metrics.step("relay.replay");
        match store.job_status(job_id).await {
            Ok(record) => record.map(|r| r.to_event(job_id)),
            // Live events still arrive; the replay is best effort.
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "status replay failed");
                None
            }
        }
    };

    match JobEvent::connected(job_id).to_json() {
        Ok(data) => {
            if tx.send(data).await.is_err() {
                return RelayOutcome::ClientGone;
            }
        }
        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "failed to encode connected event"),
    }

    if let Some(event) = replayed {
        match event.to_json() {
            Ok(data) => {
                if tx.send(data).await.is_err() {
                    return RelayOutcome::ClientGone;
                }
                if event.status.is_terminal() {
                    return RelayOutcome::Replayed;
                }
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "failed to encode replayed status"),
        }
    }

    loop {
        tokio::select! {
            msg = sub.next() => match msg {
                Some(payload) => {
                    let terminal = published_status(&payload).is_some_and(|s| s.is_terminal());
                    if tx.send(payload).await.is_err() {
                        return RelayOutcome::ClientGone;
                    }
                    if terminal {
                        return RelayOutcome::Terminal;
                    }
                }
                None => return RelayOutcome::StoreClosed,
            },
            _ = tx.closed() => return RelayOutcome::ClientGone,
            _ = shutdown.cancelled() => return RelayOutcome::Shutdown,
        }
    }
}

/// `GET /api/localize/stream/{job_id}`
pub async fn stream_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = JobId::parse(&job_id)?;
    let events = state.relay.open(job_id).await?;

    let events = events.map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.relay.keep_alive())
            .text(""),
    );
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}
