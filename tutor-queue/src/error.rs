use thiserror::Error;

use crate::types::{JobId, JobStatus};

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue, registry and dispatch operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Malformed submission: unknown kind, bad payload shape, bad options
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Backing store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lease token does not match the current holder, or the lease expired
    #[error("Invalid or expired lock for job {0}")]
    InvalidLock(JobId),

    #[error("Job id already exists: {0}")]
    DuplicateId(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Two actors disagree on job state
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job kind not registered: {0}")]
    KindNotRegistered(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn is_invalid_lock(&self) -> bool {
        matches!(self, Self::InvalidLock(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Internal(format!("redis: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_classification() {
        let transient = JobError::retryable("model timed out");
        let permanent = JobError::permanent("payload missing answers");

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(transient.message(), "model timed out");
        assert_eq!(permanent.to_string(), "Permanent error: payload missing answers");
    }

    #[test]
    fn queue_error_predicates() {
        assert!(QueueError::StoreUnavailable("down".into()).is_store_unavailable());
        assert!(QueueError::InvalidLock(JobId::from("a")).is_invalid_lock());
        assert!(!QueueError::NotFound(JobId::from("a")).is_invalid_lock());
    }
}
