use thiserror::Error;

/// Core error types for job and status handling
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid status record: {0}")]
    InvalidRecord(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidJobId error
    pub fn invalid_job_id(id: impl Into<String>) -> Self {
        Self::InvalidJobId(id.into())
    }

    /// Create a new InvalidStatus error
    pub fn invalid_status(status: impl Into<String>) -> Self {
        Self::InvalidStatus(status.into())
    }

    /// Create a new InvalidRecord error
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Check if this error is a client error (4xx category)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidJobId(_) | Self::InvalidStatus(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
