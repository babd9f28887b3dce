//! Localization job model.
//!
//! A job is created by the dispatcher (`queued`), mutated only by the external
//! worker, and observed by the status relay. Status is monotonic:
//!
//! ```text
//! queued ──► running ──► done
//!    │          │
//!    └──────────┴──────► failed
//! ```
//!
//! Once a job is terminal (`done` or `failed`) its status never changes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::time::now_rfc3339;

const MAX_JOB_ID_LEN: usize = 128;

/// Opaque job identifier.
///
/// Generated ids are 128-bit random tokens rendered as 32 lowercase hex chars.
/// Ids received from clients are restricted to `[A-Za-z0-9_-]` because they are
/// interpolated into store keys and channel names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::invalid_job_id("job_id is required"));
        }
        if raw.len() > MAX_JOB_ID_LEN {
            return Err(CoreError::invalid_job_id(format!(
                "job_id longer than {MAX_JOB_ID_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::invalid_job_id(format!(
                "job_id '{raw}' contains unsupported characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job status as written by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Done | JobStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Re-publishing the same non-terminal status is allowed (progress updates);
    /// nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::invalid_status(other)),
        }
    }
}

/// Localization result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

/// Last-known status of a job, as stored in the `status:<job_id>` hash.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusRecord {
    pub status: JobStatus,
    pub updated_at: String,
    pub result: Option<Coordinates>,
    pub error: Option<String>,
}

impl JobStatusRecord {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            updated_at: now_rfc3339(),
            result: None,
            error: None,
        }
    }

    pub fn running() -> Self {
        Self::new(JobStatus::Running)
    }

    pub fn done(x: f64, y: f64) -> Self {
        Self {
            result: Some(Coordinates { x, y }),
            ..Self::new(JobStatus::Done)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(JobStatus::Failed)
        }
    }

    /// Hash fields in store order: `status, updated_at, result_x, result_y, error`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("status", self.status.to_string()),
            ("updated_at", self.updated_at.clone()),
        ];
        if let Some(result) = self.result {
            fields.push(("result_x", result.x.to_string()));
            fields.push(("result_y", result.y.to_string()));
        }
        if let Some(ref error) = self.error {
            fields.push(("error", error.clone()));
        }
        fields
    }

    /// Rebuild a record from hash fields. An empty hash means "no record".
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let status = fields
            .get("status")
            .ok_or_else(|| CoreError::invalid_record("missing 'status' field"))?
            .parse::<JobStatus>()?;

        let coord = |name: &str| -> Result<Option<f64>> {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.trim()
                        .parse::<f64>()
                        .map_err(|e| CoreError::invalid_record(format!("{name}: {e}")))
                })
                .transpose()
        };

        let result = match (coord("result_x")?, coord("result_y")?) {
            (Some(x), Some(y)) => Some(Coordinates { x, y }),
            _ => None,
        };

        Ok(Some(Self {
            status,
            updated_at: fields.get("updated_at").cloned().unwrap_or_default(),
            result,
            error: fields.get("error").filter(|e| !e.is_empty()).cloned(),
        }))
    }

    pub fn to_event(&self, job_id: &JobId) -> JobEvent {
        JobEvent {
            job_id: job_id.to_string(),
            status: self.status.into(),
            timestamp: self.updated_at.clone(),
            result: self.result,
            error: self.error.clone(),
        }
    }
}

/// Status carried by a stream event. `connected` is synthetic and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Connected,
    Queued,
    Running,
    Done,
    Failed,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Done | StreamStatus::Failed)
    }
}

impl From<JobStatus> for StreamStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => StreamStatus::Queued,
            JobStatus::Running => StreamStatus::Running,
            JobStatus::Done => StreamStatus::Done,
            JobStatus::Failed => StreamStatus::Failed,
        }
    }
}

/// One event on the job stream; also the payload published on `notify:<job_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: StreamStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn connected(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: StreamStatus::Connected,
            timestamp: now_rfc3339(),
            result: None,
            error: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Deserialize)]
struct PublishedStatus {
    status: String,
}

/// Extract the status of a published payload without requiring the full event
/// shape. Returns `None` for payloads that are not JSON objects with a
/// recognised `status`.
pub fn published_status(payload: &str) -> Option<StreamStatus> {
    let published: PublishedStatus = serde_json::from_str(payload).ok()?;
    match published.status.as_str() {
        "connected" => Some(StreamStatus::Connected),
        other => other.parse::<JobStatus>().ok().map(StreamStatus::from),
    }
}
