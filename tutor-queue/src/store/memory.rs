use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    QueueError, QueueResult,
    store::QueueStore,
    types::{ClaimedJob, DeadLetterEntry, JobId, LeaseToken, QueueDepth, QueueEntry, WorkerId},
};

#[derive(Debug, Clone)]
enum Slot {
    Ready { eligible_at: DateTime<Utc> },
    Leased { token: LeaseToken, expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
struct Stored {
    entry: QueueEntry,
    order_key: (u8, u64),
    slot: Slot,
}

impl Stored {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match &self.slot {
            Slot::Ready { eligible_at } => *eligible_at <= now,
            Slot::Leased { expires_at, .. } => *expires_at <= now,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Active entries indexed by job_id
    entries: HashMap<JobId, Stored>,

    /// Claim order: (priority rank, enqueue sequence) -> job_id
    order: BTreeMap<(u8, u64), JobId>,

    dead: Vec<DeadLetterEntry>,

    next_seq: u64,
}

impl QueueState {
    /// The entry held under `token` with an unexpired lease
    fn held(&mut self, job_id: &JobId, token: &LeaseToken, now: DateTime<Utc>) -> QueueResult<&mut Stored> {
        let stored = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| QueueError::InvalidLock(job_id.clone()))?;
        let holds_lease = matches!(
            &stored.slot,
            Slot::Leased { token: held, expires_at } if held == token && *expires_at > now
        );
        if holds_lease {
            Ok(stored)
        } else {
            Err(QueueError::InvalidLock(job_id.clone()))
        }
    }

    fn remove(&mut self, job_id: &JobId) -> Option<Stored> {
        let stored = self.entries.remove(job_id)?;
        self.order.remove(&stored.order_key);
        Some(stored)
    }
}

fn chrono_duration(duration: Duration) -> QueueResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| QueueError::Internal(format!("duration out of range: {:?}", duration)))
}

/// In-memory queue store for tests and single-process development.
///
/// Cloning shares the same underlying queue.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry for `job_id` is still in the active queue
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.state.lock().entries.contains_key(job_id)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&entry.job_id) {
            return Err(QueueError::DuplicateId(entry.job_id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let order_key = (entry.priority.claim_rank(), seq);
        let job_id = entry.job_id.clone();
        state.order.insert(order_key, job_id.clone());
        state.entries.insert(
            job_id,
            Stored {
                entry,
                order_key,
                slot: Slot::Ready { eligible_at: Utc::now() },
            },
        );
        Ok(())
    }

    async fn claim(&self, worker: &WorkerId, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let lease = chrono_duration(lease)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(job_id) = state
            .order
            .values()
            .find(|id| state.entries.get(*id).is_some_and(|stored| stored.claimable(now)))
            .cloned()
        else {
            return Ok(None);
        };

        let Some(stored) = state.entries.get_mut(&job_id) else {
            return Ok(None);
        };

        if let Slot::Leased { expires_at, .. } = &stored.slot {
            debug!(job_id = %job_id, expired_at = %expires_at, "reclaiming expired lease");
        }

        let lease_token = LeaseToken::new();
        let lock_expires_at = now + lease;
        stored.slot = Slot::Leased {
            token: lease_token.clone(),
            expires_at: lock_expires_at,
        };

        Ok(Some(ClaimedJob {
            entry: stored.entry.clone(),
            lease_token,
            lock_expires_at,
            worker_id: worker.clone(),
        }))
    }

    async fn acknowledge(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held(job_id, token, Utc::now())?;
        state.remove(job_id);
        Ok(())
    }

    async fn release(&self, job_id: &JobId, token: &LeaseToken, delay: Duration) -> QueueResult<()> {
        let delay = chrono_duration(delay)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let stored = state.held(job_id, token, now)?;
        stored.slot = Slot::Ready { eligible_at: now + delay };
        Ok(())
    }

    async fn move_to_dead_letter(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.held(job_id, token, now)?;
        if let Some(stored) = state.remove(job_id) {
            state.dead.push(DeadLetterEntry {
                entry: stored.entry,
                dead_lettered_at: now,
            });
        }
        Ok(())
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        Ok(self.state.lock().dead.clone())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut depth = QueueDepth {
            dead: state.dead.len(),
            ..QueueDepth::default()
        };
        for stored in state.entries.values() {
            match &stored.slot {
                Slot::Ready { eligible_at } if *eligible_at <= now => depth.ready += 1,
                Slot::Ready { .. } => depth.delayed += 1,
                Slot::Leased { expires_at, .. } if *expires_at <= now => depth.ready += 1,
                Slot::Leased { .. } => depth.leased += 1,
            }
        }
        Ok(depth)
    }
}
