use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{JobId, JobPriority};
use crate::error::{QueueError, QueueResult};

/// Job status lifecycle
///
/// ```text
/// queued --claim--> processing --ok--> succeeded
///                   processing --transient, attempts left--> queued
///                   processing --transient, exhausted--> dead-letter
///                   processing --permanent--> failed
/// queued --enqueue failed--> failed
/// ```
///
/// A lease that expires without ack/release leaves the registry at
/// `processing`; the next claim moves it `processing -> processing` with a
/// higher attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobStatus {
    /// Terminal states accept no further transition
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::DeadLetter)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Queued)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, DeadLetter)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry record - the durable, client-queryable state of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    /// Handler kind, e.g. "grade-problem-set"
    pub kind: String,

    pub payload: Value,

    /// Submission context used for polling lists; opaque to the core
    pub requester: Option<String>,

    pub priority: JobPriority,

    pub status: JobStatus,

    /// Execution attempts so far (starts at 0)
    pub attempt: u32,

    pub max_attempts: u32,

    /// Present only when status is `succeeded`
    pub result: Option<Value>,

    /// Last failure description
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh `queued` record with a new id
    pub fn new(
        kind: impl Into<String>,
        payload: Value,
        requester: Option<String>,
        priority: JobPriority,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: kind.into(),
            payload,
            requester,
            priority,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempts left before the job is dead-lettered
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Apply a transition in place, enforcing the state machine and
    /// `attempt <= max_attempts`. On error the record is unchanged.
    pub fn apply(&mut self, patch: &JobPatch) -> QueueResult<()> {
        let invalid = || QueueError::InvalidTransition {
            job_id: self.id.clone(),
            from: self.status,
            to: patch.status,
        };

        if !self.status.can_transition_to(patch.status) {
            return Err(invalid());
        }

        // a claim may only start the attempt after the one on record, so two
        // holders that read the same record cannot both advance it
        if patch.status == JobStatus::Processing && patch.attempt != Some(self.attempt + 1) {
            return Err(invalid());
        }

        let attempt = patch.attempt.unwrap_or(self.attempt);
        if attempt > self.max_attempts {
            return Err(QueueError::Internal(format!(
                "job {}: attempt {} exceeds max_attempts {}",
                self.id, attempt, self.max_attempts
            )));
        }

        self.status = patch.status;
        self.attempt = attempt;
        self.result = match patch.status {
            JobStatus::Succeeded => patch.result.clone(),
            _ => None,
        };
        if patch.status == JobStatus::Succeeded {
            self.error = None;
        } else if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// A requested status/field transition for [`JobRecord::apply`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub status: JobStatus,
    pub attempt: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobPatch {
    /// Claimed by a worker, about to run attempt number `attempt`.
    /// Applies only while the record sits at `attempt - 1`.
    pub fn processing(attempt: u32) -> Self {
        Self {
            status: JobStatus::Processing,
            attempt: Some(attempt),
            result: None,
            error: None,
        }
    }

    /// Released for a retry after a transient failure
    pub fn requeued(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Queued,
            attempt: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(result: Value) -> Self {
        Self {
            status: JobStatus::Succeeded,
            attempt: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            attempt: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn dead_letter(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::DeadLetter,
            attempt: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Client-facing projection of a job, as served by the status surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub kind: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            status: record.status,
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            result: record.result.clone(),
            error: record.error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(max_attempts: u32) -> JobRecord {
        JobRecord::new("grade", json!({"set": 1}), Some("course-7".into()), JobPriority::Normal, max_attempts)
    }

    #[test]
    fn new_record_is_queued_with_zero_attempts() {
        let record = record(3);
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.attempts_remaining(), 3);
        assert!(record.result.is_none());
    }

    #[test]
    fn cannot_skip_processing() {
        let mut record = record(3);
        let err = record.apply(&JobPatch::succeeded(json!(1))).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition { from: JobStatus::Queued, to: JobStatus::Succeeded, .. }
        ));
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut record = record(3);
        record.apply(&JobPatch::processing(1)).unwrap();
        record.apply(&JobPatch::succeeded(json!({"score": 9}))).unwrap();
        let snapshot = record.clone();

        assert!(record.apply(&JobPatch::requeued("late")).is_err());
        assert!(record.apply(&JobPatch::dead_letter("late")).is_err());
        assert_eq!(record, snapshot);
    }

    #[test]
    fn reclaim_requires_next_attempt() {
        let mut record = record(3);
        assert!(record.apply(&JobPatch::processing(2)).is_err());
        record.apply(&JobPatch::processing(1)).unwrap();
        assert!(record.apply(&JobPatch::processing(1)).is_err());
        assert!(record.apply(&JobPatch::processing(3)).is_err());
        record.apply(&JobPatch::processing(2)).unwrap();
        assert_eq!(record.attempt, 2);
    }

    #[test]
    fn attempt_never_exceeds_max() {
        let mut record = record(1);
        record.apply(&JobPatch::processing(1)).unwrap();
        assert!(record.apply(&JobPatch::processing(2)).is_err());
        assert_eq!(record.attempt, 1);
    }

    #[test]
    fn success_clears_error_and_sets_result() {
        let mut record = record(3);
        record.apply(&JobPatch::processing(1)).unwrap();
        record.apply(&JobPatch::requeued("model busy")).unwrap();
        assert_eq!(record.error.as_deref(), Some("model busy"));

        record.apply(&JobPatch::processing(2)).unwrap();
        record.apply(&JobPatch::succeeded(json!("ok"))).unwrap();
        assert_eq!(record.error, None);
        assert_eq!(record.result, Some(json!("ok")));
    }

    #[test]
    fn view_serializes_camel_case_and_kebab_status() {
        let mut record = record(2);
        record.apply(&JobPatch::processing(1)).unwrap();
        record.apply(&JobPatch::dead_letter("gave up")).unwrap();

        let json = serde_json::to_value(record.view()).unwrap();
        assert_eq!(json["status"], "dead-letter");
        assert_eq!(json["maxAttempts"], 2);
        assert_eq!(json["error"], "gave up");
        assert!(json.get("result").is_none());
    }
}
