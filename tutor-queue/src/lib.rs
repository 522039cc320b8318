//! # tutor-queue: background job processing for AI coursework tasks
//!
//! Long-running grading and explanation jobs are accepted by a
//! [`Dispatcher`], parked durably in a [`QueueStore`], executed by a
//! [`WorkerPool`] and tracked in a [`JobRegistry`] that clients poll through
//! [`JobStatusService`].
//!
//! ## Guarantees
//!
//! - **Exclusive leases**: a claim hands out a lease token valid until
//!   `now + lease`; stale tokens are rejected with `InvalidLock`, and expired
//!   leases make the job claimable again, which bounds worker crashes
//! - **At-least-once execution**: handlers may run more than once per job and
//!   should key side effects on [`HandlerCtx::idempotency_key`]
//! - **Bounded retries**: transient failures back off exponentially until
//!   `max_attempts`, then the job is dead-lettered; permanent failures fail
//!   immediately
//! - **Registry-first submission**: a job is readable the moment `submit`
//!   returns, and an enqueue failure marks it `failed` instead of orphaning it
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tutor_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct GradeProblemSet {
//!     submission_id: String,
//!     answers: Vec<String>,
//! }
//!
//! #[async_trait]
//! impl Job for GradeProblemSet {
//!     type Context = GraderClient;
//!     type Output = Grade;
//!
//!     const KIND: &'static str = "grade-problem-set";
//!     const MAX_ATTEMPTS: Option<u32> = Some(4);
//!
//!     async fn execute(&self, grader: Self::Context, job: &HandlerCtx) -> Result<Grade, JobError> {
//!         grader.grade(&job.idempotency_key(), &self.answers).await
//!     }
//! }
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_job::<GradeProblemSet>(grader)?;
//! let handlers = Arc::new(handlers);
//!
//! let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
//! let registry: Arc<dyn JobRegistry> = Arc::new(MemoryJobRegistry::new());
//! let config = QueueConfig::from_env()?;
//!
//! let dispatcher = Dispatcher::new(store.clone(), registry.clone(), handlers.clone(), config.clone());
//! let receipt = dispatcher
//!     .submit("grade-problem-set", payload, SubmitOptions::default().with_requester("course-42"))
//!     .await?;
//!
//! let pool = WorkerPool::new(store, registry, handlers, config).start()?;
//! // ...
//! pool.shutdown().await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod observability;
pub mod registry;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

// Core API exports
pub use config::QueueConfig;
pub use dispatcher::{Dispatcher, SubmitOptions, SubmitReceipt};
pub use error::{JobError, QueueError, QueueResult};
pub use handler::{HandlerCtx, HandlerRegistry, Job, JobHandler, Registration};
pub use registry::{BoxStream, JobRegistry, MemoryJobRegistry};
pub use status::JobStatusService;
pub use store::{MemoryQueueStore, QueueStore};
pub use types::{
    ClaimedJob, DeadLetterEntry, JobId, JobPatch, JobPriority, JobRecord, JobStatus, JobView,
    LeaseToken, QueueDepth, QueueEntry, WorkerId,
};
pub use worker::{IdleBackoff, PoolHandle, RetryPolicy, ShutdownOutcome, WorkerPool};

// Observability exports
pub use observability::{LiveMetrics, MetricsSnapshot};

// Backend implementations
#[cfg(feature = "redis")]
pub use registry::RedisJobRegistry;

#[cfg(feature = "redis")]
pub use store::RedisQueueStore;

/// Everything needed to define jobs and run the queue
pub mod prelude {
    pub use crate::{
        Dispatcher, HandlerRegistry, JobStatusService, PoolHandle, QueueConfig, ShutdownOutcome,
        SubmitOptions, WorkerPool,
    };

    pub use crate::{
        HandlerCtx, Job, JobError, JobHandler, JobId, JobPriority, JobStatus, JobView, QueueError,
        QueueResult,
    };

    pub use crate::{JobRegistry, MemoryJobRegistry, MemoryQueueStore, QueueStore};

    #[cfg(feature = "redis")]
    pub use crate::{RedisJobRegistry, RedisQueueStore};

    pub use crate::LiveMetrics;

    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
