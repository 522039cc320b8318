pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

use crate::{
    QueueResult,
    types::{JobId, JobPatch, JobRecord},
};

pub use memory::MemoryJobRegistry;

#[cfg(feature = "redis")]
pub use self::redis::RedisJobRegistry;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Durable job status store, queryable after a job has left the queue
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a new record. `DuplicateId` if the id already exists.
    async fn create(&self, record: JobRecord) -> QueueResult<()>;

    /// Atomically apply a transition and return the updated record.
    ///
    /// `NotFound` for unknown ids, `InvalidTransition` when the requested
    /// status does not follow from the current one.
    async fn update(&self, job_id: &JobId, patch: JobPatch) -> QueueResult<JobRecord>;

    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord>;

    /// Records submitted under `requester`, newest first.
    ///
    /// The stream is lazy and finite: the snapshot is taken when it is first
    /// polled. Call again for a fresh snapshot.
    fn list_by_requester(&self, requester: &str) -> BoxStream<QueueResult<JobRecord>>;
}
