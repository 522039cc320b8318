use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::{
    QueueConfig, QueueError, QueueResult,
    handler::HandlerRegistry,
    observability::LiveMetrics,
    registry::JobRegistry,
    store::QueueStore,
    types::{JobId, JobPatch, JobPriority, JobRecord, JobStatus, QueueEntry},
};

/// Options recognized by [`Dispatcher::submit`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOptions {
    /// Overrides the per-kind or configured retry ceiling
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub priority: JobPriority,
    /// Opaque submission context used by `list_by_requester`
    pub requester: Option<String>,
}

impl SubmitOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
}

/// Synchronous acceptance returned to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub id: JobId,
    pub status: JobStatus,
}

/// Producer side: validates submissions, writes the registry, enqueues
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    registry: Arc<dyn JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<LiveMetrics>,
    config: QueueConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<dyn JobRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            handlers,
            metrics: Arc::new(LiveMetrics::new()),
            config,
        }
    }

    /// Share a metrics sink with the worker pool
    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    /// Accept a job for background execution.
    ///
    /// Returns as soon as the job is recorded and enqueued; never waits for
    /// the handler. A `Validation` error means nothing was created.
    #[instrument(skip(self, kind, payload, options), fields(kind = %kind, job_id = tracing::field::Empty))]
    pub async fn submit(&self, kind: &str, payload: Value, options: SubmitOptions) -> QueueResult<SubmitReceipt> {
        let record = self.build_record(kind, payload, options)?;
        let job_id = record.id.clone();
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));

        // registry first so an immediate poll always finds the job
        self.registry.create(record.clone()).await?;

        if let Err(e) = self.store.enqueue(QueueEntry::from(&record)).await {
            error!(job_id = %job_id, error = %e, "Enqueue failed, marking job failed");
            if let Err(mark_err) = self
                .registry
                .update(&job_id, JobPatch::failed(format!("enqueue failed: {}", e)))
                .await
            {
                warn!(job_id = %job_id, error = %mark_err, "Could not mark unenqueued job failed");
            }
            return Err(e);
        }

        self.metrics.increment_jobs_submitted(kind);
        info!(job_id = %job_id, priority = %record.priority, max_attempts = record.max_attempts, "Job submitted");

        Ok(SubmitReceipt {
            id: job_id,
            status: JobStatus::Queued,
        })
    }

    fn build_record(&self, kind: &str, payload: Value, options: SubmitOptions) -> QueueResult<JobRecord> {
        let registration = self
            .handlers
            .get(kind)
            .ok_or_else(|| QueueError::Validation(format!("unknown job kind '{}'", kind)))?;

        let max_attempts = options
            .max_attempts
            .or(registration.max_attempts())
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation("maxAttempts must be at least 1".to_string()));
        }

        if let Some(requester) = &options.requester {
            if requester.trim().is_empty() {
                return Err(QueueError::Validation("requester must not be blank".to_string()));
            }
        }

        let size = serde_json::to_vec(&payload)?.len();
        if size > self.config.max_payload_bytes {
            return Err(QueueError::Validation(format!(
                "payload is {} bytes, limit is {}",
                size, self.config.max_payload_bytes
            )));
        }

        registration
            .validate(&payload)
            .map_err(|reason| QueueError::Validation(format!("invalid payload for '{}': {}", kind, reason)))?;

        Ok(JobRecord::new(kind, payload, options.requester, options.priority, max_attempts))
    }
}
