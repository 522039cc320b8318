//! Worker process for AI coursework jobs.
//!
//! Connects to the queue store and job registry, registers the model-backed
//! job kinds and runs a [`WorkerPool`] until a shutdown signal arrives.

pub mod config;
pub mod jobs;
pub mod model;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tutor_queue::{
    HandlerRegistry, JobRegistry, MemoryJobRegistry, MemoryQueueStore, QueueStore, RedisJobRegistry,
    RedisQueueStore, ShutdownOutcome, WorkerPool,
};

pub use config::{Backend, WorkerSettings};
pub use model::{HttpModelClient, ModelClient};

/// Queue store and job registry the pool runs against
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn QueueStore>,
    pub registry: Arc<dyn JobRegistry>,
}

impl Backends {
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryQueueStore::new()),
            registry: Arc::new(MemoryJobRegistry::new()),
        }
    }

    /// Open and probe the configured backends. An unreachable store is an
    /// error here so the process exits instead of polling a dead connection.
    pub async fn connect(settings: &WorkerSettings) -> Result<Self> {
        match settings.backend {
            Backend::Memory => Ok(Self::memory()),
            Backend::Redis => {
                let store = RedisQueueStore::connect(&settings.redis_url, &settings.key_prefix)
                    .await
                    .with_context(|| format!("connecting queue store at {}", settings.redis_url))?;
                store.ping().await.context("queue store did not answer PING")?;

                let registry = RedisJobRegistry::connect(&settings.redis_url, &settings.key_prefix)
                    .await
                    .with_context(|| format!("connecting job registry at {}", settings.redis_url))?;

                Ok(Self {
                    store: Arc::new(store),
                    registry: Arc::new(registry),
                })
            }
        }
    }
}

/// Handler registry with every job kind this worker serves
pub fn handlers(model: Arc<dyn ModelClient>) -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    jobs::register_all(&mut handlers, model).context("registering job handlers")?;
    Ok(handlers)
}

/// Run the worker pool until `shutdown` resolves, then drain it
pub async fn run<F>(
    settings: &WorkerSettings,
    backends: Backends,
    model: Arc<dyn ModelClient>,
    shutdown: F,
) -> Result<ShutdownOutcome>
where
    F: Future<Output = ()>,
{
    let handlers = Arc::new(handlers(model)?);
    info!(
        backend = %settings.backend,
        kinds = ?handlers.kinds(),
        concurrency = settings.queue.concurrency,
        "Worker ready"
    );

    let outcome = WorkerPool::new(backends.store, backends.registry, handlers, settings.queue.clone())
        .run_until(shutdown)
        .await
        .context("worker pool failed to start")?;

    match outcome {
        ShutdownOutcome::Drained => info!("Worker drained, exiting"),
        ShutdownOutcome::GraceElapsed { in_flight } => info!(
            in_flight,
            "Shutdown grace elapsed; abandoned jobs will be re-claimed after their leases expire"
        ),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::ScriptedModel;
    use serde_json::json;
    use std::time::Duration;
    use tutor_queue::{Dispatcher, JobError, JobStatus, JobStatusService, SubmitOptions};

    fn settings() -> WorkerSettings {
        let mut settings = WorkerSettings {
            backend: Backend::Memory,
            ..WorkerSettings::default()
        };
        settings.queue.concurrency = 1;
        settings.queue.poll_interval_min = Duration::from_millis(2);
        settings.queue.poll_interval_max = Duration::from_millis(10);
        settings.queue.base_retry_backoff = Duration::from_millis(2);
        settings.queue.max_retry_backoff = Duration::from_millis(10);
        settings
    }

    #[test_log::test(tokio::test)]
    async fn test_runs_grade_job_to_completion() {
        let settings = settings();
        let backends = Backends::connect(&settings).await.unwrap();
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::replying(vec![
            Err(JobError::retryable("model endpoint returned 503 Service Unavailable")),
            Ok(json!({
                "submissionId": "sub-4",
                "score": 7.0,
                "maxScore": 10.0,
                "feedback": []
            })),
        ]));

        let dispatcher = Dispatcher::new(
            backends.store.clone(),
            backends.registry.clone(),
            Arc::new(handlers(model.clone()).unwrap()),
            settings.queue.clone(),
        );
        let receipt = dispatcher
            .submit(
                "grade-problem-set",
                json!({
                    "submissionId": "sub-4",
                    "problemSetId": "algebra-1",
                    "answers": [{"questionId": "q1", "response": "x = 3"}]
                }),
                SubmitOptions::default().with_requester("course-11"),
            )
            .await
            .unwrap();

        let status = JobStatusService::new(backends.registry.clone());
        let job_id = receipt.id.clone();
        let watcher = status.clone();
        let done = async move {
            loop {
                let view = watcher.get(&job_id).await.unwrap();
                if view.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        let outcome = tokio::time::timeout(Duration::from_secs(5), run(&settings, backends, model, done))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ShutdownOutcome::Drained);

        let view = status.get(&receipt.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.attempt, 2);
        assert_eq!(view.result.unwrap()["score"], json!(7.0));
    }

    #[tokio::test]
    async fn test_rejects_payload_of_wrong_shape() {
        let backends = Backends::memory();
        let dispatcher = Dispatcher::new(
            backends.store.clone(),
            backends.registry.clone(),
            Arc::new(handlers(Arc::new(ScriptedModel::default())).unwrap()),
            settings().queue,
        );

        let result = dispatcher
            .submit("generate-explanation", json!({"topic": "limits"}), SubmitOptions::default())
            .await;
        assert!(matches!(result, Err(tutor_queue::QueueError::Validation(_))));
    }
}
