use std::sync::Arc;

use futures::TryStreamExt;

use crate::{
    QueueResult,
    registry::JobRegistry,
    types::{JobId, JobView},
};

/// Read-only job queries for the polling client
#[derive(Clone)]
pub struct JobStatusService {
    registry: Arc<dyn JobRegistry>,
}

impl JobStatusService {
    pub fn new(registry: Arc<dyn JobRegistry>) -> Self {
        Self { registry }
    }

    /// `NotFound` maps to a 404 at the HTTP layer
    pub async fn get(&self, job_id: &JobId) -> QueueResult<JobView> {
        self.registry.get(job_id).await.map(|record| record.view())
    }

    /// Jobs submitted under `requester`, newest first
    pub async fn list_by_requester(&self, requester: &str) -> QueueResult<Vec<JobView>> {
        self.registry
            .list_by_requester(requester)
            .map_ok(|record| record.view())
            .try_collect()
            .await
    }
}
