//! Job dispatcher: mints a job id, hands the job to the broker and returns
//! without waiting for any worker.
//!
//! Nothing is written to the status store here. A failed enqueue leaves no
//! trace, so no stream will ever find that job id.

use std::sync::Arc;

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use cetasense_core::{JobId, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::broker::{Broker, BrokerError};
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::middleware::RequestId;
use crate::server::AppState;

pub const JOB_STARTED_MESSAGE: &str = "Localization job started successfully";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to encode job message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message placed on the job queue for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub req_id: String,
    pub job_id: JobId,
    pub input_refs: Map<String, Value>,
}

/// Returned to the caller as soon as the job is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTicket {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

pub struct JobDispatcher {
    broker: Arc<dyn Broker>,
    queue: String,
    metrics: Metrics,
}

impl JobDispatcher {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, metrics: Metrics) -> Self {
        Self {
            broker,
            queue: queue.into(),
            metrics,
        }
    }

    /// Start a job for `input_refs`, which must be a non-empty JSON object.
    pub async fn start_job(
        &self,
        req_id: &str,
        input_refs: Value,
    ) -> Result<JobTicket, DispatchError> {
        let input_refs = match input_refs {
            Value::Object(map) if !map.is_empty() => map,
            Value::Object(_) => {
                return Err(DispatchError::InvalidInput(
                    "input references must not be empty".into(),
                ));
            }
            _ => {
                return Err(DispatchError::InvalidInput(
                    "input references must be a JSON object".into(),
                ));
            }
        };

        let job_id = JobId::generate();
        let message = JobMessage {
            req_id: req_id.to_string(),
            job_id: job_id.clone(),
            input_refs,
        };
        let payload = serde_json::to_vec(&message)?;

        let step = self.metrics.step("dispatch.publish");
        if let Err(e) = self.broker.enqueue(&self.queue, &payload).await {
            self.metrics.job_dispatch_failed();
            tracing::error!(req_id = %req_id, job_id = %job_id, error = %e, "job enqueue failed");
            return Err(e.into());
        }
        tracing::info!(
            req_id = %req_id,
            job_id = %job_id,
            queue = %self.queue,
            elapsed_ms = step.elapsed().as_millis() as u64,
            "job enqueued"
        );
        drop(step);
        self.metrics.job_dispatched();

        Ok(JobTicket {
            job_id,
            status: JobStatus::Queued,
            message: JOB_STARTED_MESSAGE.to_string(),
        })
    }
}

/// `POST /api/localize`
pub async fn start_localization(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let input_refs: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;
    let ticket = state.dispatcher.start_job(req_id.as_str(), input_refs).await?;
    Ok((StatusCode::OK, Json(ticket)))
}
