use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::RwLock;

use crate::{
    QueueError, QueueResult,
    registry::{BoxStream, JobRegistry},
    types::{JobId, JobPatch, JobRecord},
};

#[derive(Default)]
struct RegistryState {
    /// Records with their insertion sequence (tie-break for equal timestamps)
    records: HashMap<JobId, (u64, JobRecord)>,
    next_seq: u64,
}

/// In-memory job registry for tests and single-process development
#[derive(Clone, Default)]
pub struct MemoryJobRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl MemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRegistry for MemoryJobRegistry {
    async fn create(&self, record: JobRecord) -> QueueResult<()> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.id) {
            return Err(QueueError::DuplicateId(record.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(record.id.clone(), (seq, record));
        Ok(())
    }

    async fn update(&self, job_id: &JobId, patch: JobPatch) -> QueueResult<JobRecord> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        record.apply(&patch)?;
        Ok(record.clone())
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.state
            .read()
            .records
            .get(job_id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))
    }

    fn list_by_requester(&self, requester: &str) -> BoxStream<QueueResult<JobRecord>> {
        let state = self.state.clone();
        let requester = requester.to_string();

        let snapshot = stream::once(async move {
            let state = state.read();
            let mut matching: Vec<(u64, JobRecord)> = state
                .records
                .values()
                .filter(|(_, record)| record.requester.as_deref() == Some(requester.as_str()))
                .cloned()
                .collect();
            matching.sort_by_key(|(seq, record)| Reverse((record.created_at, *seq)));
            matching
        });

        Box::pin(
            snapshot
                .flat_map(|records| stream::iter(records.into_iter().map(|(_, record)| Ok(record)))),
        )
    }
}
