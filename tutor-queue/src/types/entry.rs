use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, JobPriority, JobRecord, LeaseToken, WorkerId};

/// Queue entry - the immutable submission data a store persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub kind: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: JobId, kind: impl Into<String>, payload: Value, priority: JobPriority) -> Self {
        Self {
            job_id,
            kind: kind.into(),
            payload,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

impl From<&JobRecord> for QueueEntry {
    fn from(record: &JobRecord) -> Self {
        Self::new(record.id.clone(), record.kind.clone(), record.payload.clone(), record.priority)
    }
}

/// A job that has been claimed for processing
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub entry: QueueEntry,

    /// Token required by acknowledge / release / dead-letter
    pub lease_token: LeaseToken,

    pub lock_expires_at: DateTime<Utc>,

    pub worker_id: WorkerId,
}

impl ClaimedJob {
    pub fn job_id(&self) -> &JobId {
        &self.entry.job_id
    }

    pub fn kind(&self) -> &str {
        &self.entry.kind
    }

    /// Check if the lease is still valid
    pub fn lease_valid(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at > now
    }
}

/// An entry parked in the dead-letter holding area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry: QueueEntry,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Claimable now
    pub ready: usize,
    /// Released with a backoff that has not elapsed yet
    pub delayed: usize,
    /// Held under a live lease
    pub leased: usize,
    pub dead: usize,
}
