pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    QueueResult,
    types::{ClaimedJob, DeadLetterEntry, JobId, LeaseToken, QueueDepth, QueueEntry, WorkerId},
};

pub use memory::MemoryQueueStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;

/// Durable queue storage primitives
///
/// Every method is atomic with respect to concurrent callers, including
/// callers in other processes for durable implementations.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist an entry; it becomes claimable immediately.
    /// Fails with `StoreUnavailable` rather than dropping the entry.
    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()>;

    /// Lease the next eligible entry until `now + lease`.
    ///
    /// Eligible: ready entries whose backoff has elapsed and leased entries
    /// whose lease expired. Higher priority first, FIFO within a priority.
    /// Returns `Ok(None)` when nothing is eligible.
    async fn claim(&self, worker: &WorkerId, lease: Duration) -> QueueResult<Option<ClaimedJob>>;

    /// Remove a completed entry. `InvalidLock` if the token is stale.
    async fn acknowledge(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()>;

    /// Return an entry to the eligible set once `delay` has elapsed.
    async fn release(&self, job_id: &JobId, token: &LeaseToken, delay: Duration) -> QueueResult<()>;

    /// Move an entry to the non-retryable holding area.
    async fn move_to_dead_letter(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()>;

    /// Entries in the dead-letter holding area, oldest first
    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>>;

    async fn depth(&self) -> QueueResult<QueueDepth>;

    /// Connectivity probe
    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
