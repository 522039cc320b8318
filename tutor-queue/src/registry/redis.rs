use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use redis::{aio::ConnectionManager, Script};
use tracing::debug;

use crate::{
    QueueError, QueueResult,
    registry::{BoxStream, JobRegistry},
    types::{JobId, JobPatch, JobRecord},
};

/// Conditional update attempts before giving up on a hot record
const MAX_CAS_ATTEMPTS: usize = 16;

const CREATE: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then return 0 end
if ARGV[2] == '1' then redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4]) end
return 1
"#;

const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Durable job registry on redis.
///
/// Records live under `{prefix}:job:{id}` as JSON; each requester has a
/// sorted set of ids scored by creation time.
#[derive(Clone)]
pub struct RedisJobRegistry {
    conn: ConnectionManager,
    prefix: Arc<str>,
    create: Arc<Script>,
    compare_and_set: Arc<Script>,
}

impl RedisJobRegistry {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: Arc::from(prefix),
            create: Arc::new(Script::new(CREATE)),
            compare_and_set: Arc::new(Script::new(COMPARE_AND_SET)),
        }
    }

    pub async fn connect(url: &str, prefix: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    fn record_key(&self, job_id: &JobId) -> String {
        record_key(&self.prefix, job_id)
    }

    fn requester_key(&self, requester: &str) -> String {
        requester_key(&self.prefix, requester)
    }

    async fn read_raw(&self, job_id: &JobId) -> QueueResult<String> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.record_key(job_id))
            .query_async(&mut conn)
            .await?;
        raw.ok_or_else(|| QueueError::NotFound(job_id.clone()))
    }
}

fn record_key(prefix: &str, job_id: &JobId) -> String {
    format!("{}:job:{}", prefix, job_id)
}

fn requester_key(prefix: &str, requester: &str) -> String {
    format!("{}:requester:{}", prefix, requester)
}

/// Records for `requester`, newest first
async fn snapshot(
    mut conn: ConnectionManager,
    prefix: Arc<str>,
    requester: String,
) -> QueueResult<Vec<JobRecord>> {
    let ids: Vec<String> = redis::cmd("ZREVRANGE")
        .arg(requester_key(&prefix, &requester))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let keys: Vec<String> = ids.iter().map(|id| record_key(&prefix, &JobId::from(id.as_str()))).collect();
    let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

    raw.into_iter()
        .flatten()
        .map(|json| serde_json::from_str::<JobRecord>(&json).map_err(QueueError::from))
        .collect()
}

#[async_trait]
impl JobRegistry for RedisJobRegistry {
    async fn create(&self, record: JobRecord) -> QueueResult<()> {
        let json = serde_json::to_string(&record)?;
        let requester = record.requester.as_deref().unwrap_or_default();
        let score = record.created_at.timestamp_micros();
        let mut conn = self.conn.clone();

        let created: i64 = self
            .create
            .key(self.record_key(&record.id))
            .key(self.requester_key(requester))
            .arg(json)
            .arg(if record.requester.is_some() { "1" } else { "0" })
            .arg(score)
            .arg(record.id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(QueueError::DuplicateId(record.id));
        }
        Ok(())
    }

    async fn update(&self, job_id: &JobId, patch: JobPatch) -> QueueResult<JobRecord> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.read_raw(job_id).await?;
            let mut record: JobRecord = serde_json::from_str(&current)?;
            record.apply(&patch)?;
            let next = serde_json::to_string(&record)?;

            let mut conn = self.conn.clone();
            let swapped: i64 = self
                .compare_and_set
                .key(self.record_key(job_id))
                .arg(&current)
                .arg(next)
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                return Ok(record);
            }
            debug!(job_id = %job_id, attempt, "Registry record changed concurrently, retrying");
        }

        Err(QueueError::Internal(format!(
            "job {}: update lost {} compare-and-set races",
            job_id, MAX_CAS_ATTEMPTS
        )))
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        let raw = self.read_raw(job_id).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn list_by_requester(&self, requester: &str) -> BoxStream<QueueResult<JobRecord>> {
        let listing = snapshot(self.conn.clone(), Arc::clone(&self.prefix), requester.to_string());

        Box::pin(stream::once(listing).flat_map(|result| {
            let items: Vec<QueueResult<JobRecord>> = match result {
                Ok(records) => records.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        }))
    }
}
