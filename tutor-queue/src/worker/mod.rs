pub mod backoff;

pub use backoff::{IdleBackoff, RetryPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    JobError, QueueConfig, QueueError, QueueResult,
    handler::{HandlerCtx, HandlerRegistry},
    observability::LiveMetrics,
    registry::JobRegistry,
    store::QueueStore,
    types::{ClaimedJob, JobPatch, WorkerId},
};

/// Share of the lease held back so a timed-out handler can still settle
const SETTLE_MARGIN_DIVISOR: u32 = 10;
const MAX_SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// How a pool shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every claim loop stopped and every handler finished
    Drained,
    /// Grace period ran out; these handlers were still running and their
    /// leases will expire on their own
    GraceElapsed { in_flight: usize },
}

/// Consumer side: a set of concurrent claim-execute loops
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    registry: Arc<dyn JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<LiveMetrics>,
    config: QueueConfig,
    host_label: String,
}

impl WorkerPool {
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
            host_label: "worker".to_string(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Prefix for generated worker ids, typically the host name
    pub fn with_host_label(mut self, label: impl Into<String>) -> Self {
        self.host_label = label.into();
        self
    }

    /// Spawn `concurrency` claim loops and return a handle to stop them
    pub fn start(self) -> QueueResult<PoolHandle> {
        self.config.validate()?;

        let token = CancellationToken::new();
        let loops = TaskTracker::new();
        let in_flight = TaskTracker::new();

        let worker = Arc::new(Worker {
            store: self.store,
            registry: self.registry,
            handlers: self.handlers,
            metrics: Arc::clone(&self.metrics),
            retry: RetryPolicy::from_config(&self.config),
            config: self.config.clone(),
            in_flight: in_flight.clone(),
        });

        let mut worker_ids = Vec::with_capacity(self.config.concurrency);
        for index in 0..self.config.concurrency {
            let worker_id = WorkerId::for_slot(&self.host_label, index);
            worker_ids.push(worker_id.clone());
            loops.spawn(Arc::clone(&worker).claim_loop(worker_id, token.clone()));
        }

        info!(
            concurrency = self.config.concurrency,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            kinds = ?worker.handlers.kinds(),
            "Worker pool started"
        );

        Ok(PoolHandle {
            token,
            loops,
            in_flight,
            grace: self.config.shutdown_grace,
            worker_ids,
            metrics: self.metrics,
        })
    }

    /// Run until `shutdown` resolves, then drain gracefully
    pub async fn run_until<F>(self, shutdown: F) -> QueueResult<ShutdownOutcome>
    where
        F: Future<Output = ()>,
    {
        let handle = self.start()?;
        shutdown.await;
        info!("Shutdown requested, draining worker pool");
        Ok(handle.shutdown().await)
    }
}

/// Handle for managing pool lifecycle
pub struct PoolHandle {
    token: CancellationToken,
    loops: TaskTracker,
    in_flight: TaskTracker,
    grace: Duration,
    worker_ids: Vec<WorkerId>,
    metrics: Arc<LiveMetrics>,
}

impl PoolHandle {
    /// Token observed by every claim loop; cancelling it stops new claims
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Handler invocations currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    /// Stop claiming, wait up to the grace period for in-flight jobs
    pub async fn shutdown(self) -> ShutdownOutcome {
        self.token.cancel();
        self.loops.close();
        self.in_flight.close();

        let drained = tokio::time::timeout(self.grace, async {
            self.loops.wait().await;
            self.in_flight.wait().await;
        })
        .await;

        match drained {
            Ok(()) => {
                info!("Worker pool drained");
                ShutdownOutcome::Drained
            }
            Err(_) => {
                let in_flight = self.in_flight.len();
                warn!(in_flight, grace_ms = self.grace.as_millis() as u64, "Shutdown grace elapsed, leaving leases to expire");
                ShutdownOutcome::GraceElapsed { in_flight }
            }
        }
    }
}

/// Store transition that settles a claimed job
#[derive(Debug, Clone, Copy)]
enum Settle {
    Acknowledge,
    Release(Duration),
    DeadLetter,
}

/// State shared by every claim loop of one pool
pub(crate) struct Worker {
    store: Arc<dyn QueueStore>,
    registry: Arc<dyn JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<LiveMetrics>,
    retry: RetryPolicy,
    config: QueueConfig,
    in_flight: TaskTracker,
}

impl Worker {
    async fn claim_loop(self: Arc<Self>, worker_id: WorkerId, token: CancellationToken) {
        let mut idle = IdleBackoff::new(self.config.poll_interval_min, self.config.poll_interval_max);
        debug!(worker_id = %worker_id, "Claim loop started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let pause = match self.store.claim(&worker_id, self.config.lease_duration).await {
                Ok(Some(claimed)) => {
                    idle.reset();
                    match self.process(claimed).await {
                        Ok(()) => None,
                        Err(e) if e.is_store_unavailable() => {
                            warn!(worker_id = %worker_id, error = %e, "Store unavailable while settling job");
                            Some(self.config.store_retry_backoff)
                        }
                        Err(e) => {
                            error!(worker_id = %worker_id, error = %e, "Job processing aborted");
                            None
                        }
                    }
                }
                Ok(None) => Some(idle.next_delay()),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Claim failed, pausing");
                    Some(self.config.store_retry_backoff)
                }
            };

            if let Some(delay) = pause {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        debug!(worker_id = %worker_id, "Claim loop stopped");
    }

    /// Run one claimed job to a settled state.
    ///
    /// Lease races are absorbed here; other errors are returned to the loop.
    #[instrument(skip(self, claimed), fields(job_id = %claimed.job_id(), kind = %claimed.kind(), worker_id = %claimed.worker_id))]
    pub(crate) async fn process(&self, claimed: ClaimedJob) -> QueueResult<()> {
        let kind = claimed.kind().to_string();
        self.metrics.increment_jobs_claimed(&kind);

        let record = match self.registry.get(claimed.job_id()).await {
            Ok(record) => record,
            Err(QueueError::NotFound(_)) => {
                warn!("Claimed job has no registry record, dead-lettering");
                self.settle_store(&claimed, Settle::DeadLetter).await?;
                self.metrics.increment_jobs_dead_lettered(&kind);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if record.status.is_terminal() {
            debug!(status = %record.status, "Job already resolved, acknowledging stale entry");
            self.settle_store(&claimed, Settle::Acknowledge).await?;
            return Ok(());
        }

        if record.attempt >= record.max_attempts {
            warn!(attempt = record.attempt, "Lease expired after final attempt, dead-lettering");
            if self
                .settle(&claimed, Settle::DeadLetter, JobPatch::dead_letter("lease expired after final attempt"))
                .await?
            {
                self.metrics.increment_jobs_dead_lettered(&kind);
            }
            return Ok(());
        }

        if !claimed.lease_valid(Utc::now()) {
            self.metrics.increment_leases_lost();
            warn!("Lease expired before the attempt started, abandoning job");
            return Ok(());
        }

        let attempt = record.attempt + 1;
        match self.registry.update(claimed.job_id(), JobPatch::processing(attempt)).await {
            Ok(_) => {}
            Err(QueueError::InvalidTransition { .. }) => {
                // another holder advanced the record since it was read
                self.metrics.increment_leases_lost();
                warn!(attempt, "Attempt already started elsewhere, abandoning job");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let Some(registration) = self.handlers.get(&kind) else {
            let reason = QueueError::KindNotRegistered(kind.clone()).to_string();
            error!("No handler for claimed job");
            if self.settle(&claimed, Settle::DeadLetter, JobPatch::failed(reason)).await? {
                self.metrics.increment_jobs_failed(&kind);
            }
            return Ok(());
        };

        let ctx = HandlerCtx {
            job_id: claimed.job_id().clone(),
            kind: kind.clone(),
            attempt,
            max_attempts: record.max_attempts,
            requester: record.requester.clone(),
        };

        debug!(attempt, max_attempts = record.max_attempts, "Invoking handler");
        let started = Instant::now();
        let budget = self.handler_budget(&claimed);
        let outcome = self.invoke(registration.handler(), ctx, claimed.entry.payload.clone(), budget).await;
        self.metrics.record_execution_time(&kind, started.elapsed());

        match outcome {
            Ok(result) => {
                if self.settle(&claimed, Settle::Acknowledge, JobPatch::succeeded(result)).await? {
                    self.metrics.increment_jobs_succeeded(&kind);
                    info!(attempt, "Job succeeded");
                }
            }
            Err(JobError::Permanent(reason)) => {
                if self.settle(&claimed, Settle::DeadLetter, JobPatch::failed(reason.clone())).await? {
                    self.metrics.increment_jobs_failed(&kind);
                    error!(attempt, error = %reason, "Job failed permanently");
                }
            }
            Err(JobError::Retryable(reason)) if attempt < record.max_attempts => {
                let delay = self.retry.backoff(attempt);
                if self.settle(&claimed, Settle::Release(delay), JobPatch::requeued(reason.clone())).await? {
                    self.metrics.increment_jobs_retried(&kind);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %reason, "Job failed, will retry");
                }
            }
            Err(JobError::Retryable(reason)) => {
                if self.settle(&claimed, Settle::DeadLetter, JobPatch::dead_letter(reason.clone())).await? {
                    self.metrics.increment_jobs_dead_lettered(&kind);
                    error!(attempt, error = %reason, "Job exhausted its attempts, dead-lettered");
                }
            }
        }

        Ok(())
    }

    /// Time left on the lease minus a margin for settling it
    fn handler_budget(&self, claimed: &ClaimedJob) -> Duration {
        let margin = (self.config.lease_duration / SETTLE_MARGIN_DIVISOR).min(MAX_SETTLE_MARGIN);
        (claimed.lock_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(margin)
    }

    /// Run a handler in its own task, bounded by `budget`.
    /// Panics and timeouts come back as retryable errors.
    async fn invoke(
        &self,
        handler: Arc<dyn crate::handler::JobHandler>,
        ctx: HandlerCtx,
        payload: Value,
        budget: Duration,
    ) -> Result<Value, JobError> {
        let mut task = self.in_flight.spawn(async move { handler.run(ctx, payload).await });

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                self.metrics.increment_handler_panics();
                error!("Handler panicked");
                Err(JobError::retryable("handler panicked"))
            }
            Ok(Err(join_err)) => Err(JobError::retryable(format!("handler task aborted: {}", join_err))),
            Err(_) => {
                task.abort();
                Err(JobError::retryable(format!(
                    "handler exceeded lease of {}ms",
                    self.config.lease_duration.as_millis()
                )))
            }
        }
    }

    /// Store transition first, then the registry. Returns `false` when the
    /// lease was lost and the job belongs to someone else now.
    ///
    /// Once the store has settled, the entry no longer guards the record, so
    /// the registry write is retried until it lands or is refused.
    async fn settle(&self, claimed: &ClaimedJob, action: Settle, patch: JobPatch) -> QueueResult<bool> {
        if !self.settle_store(claimed, action).await? {
            return Ok(false);
        }

        let mut failures = 0u32;
        loop {
            match self.registry.update(claimed.job_id(), patch.clone()).await {
                Ok(_) => return Ok(true),
                Err(e @ QueueError::InvalidTransition { .. }) => {
                    error!(error = %e, "Registry rejected job transition");
                    return Err(e);
                }
                Err(e @ QueueError::NotFound(_)) => return Err(e),
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        failures,
                        status = %patch.status,
                        "Registry update failed after settling, retrying"
                    );
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
            }
        }
    }

    async fn settle_store(&self, claimed: &ClaimedJob, action: Settle) -> QueueResult<bool> {
        let job_id = claimed.job_id();
        let token = &claimed.lease_token;

        let result = match action {
            Settle::Acknowledge => self.store.acknowledge(job_id, token).await,
            Settle::Release(delay) => self.store.release(job_id, token, delay).await,
            Settle::DeadLetter => self.store.move_to_dead_letter(job_id, token).await,
        };

        match result {
            Ok(()) => Ok(true),
            Err(QueueError::InvalidLock(_)) => {
                self.metrics.increment_leases_lost();
                warn!(action = ?action, "Lease lost before settling, abandoning job");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
