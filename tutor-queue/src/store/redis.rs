use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{aio::ConnectionManager, Script};
use tracing::debug;

use crate::{
    QueueError, QueueResult,
    store::QueueStore,
    types::{ClaimedJob, DeadLetterEntry, JobId, LeaseToken, QueueDepth, QueueEntry, WorkerId},
};

/// Lease check shared by the settle scripts. KEYS[5] = leased, KEYS[6] = locks.
const HELD: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local id = ARGV[1]
if redis.call('HGET', KEYS[6], id) ~= ARGV[2] then return 0 end
local expires = redis.call('ZSCORE', KEYS[5], id)
if not expires or tonumber(expires) <= now then return 0 end
"#;

const ENQUEUE: &str = r#"
local id = ARGV[1]
if redis.call('HEXISTS', KEYS[1], id) == 1 or redis.call('HEXISTS', KEYS[5], id) == 1 then
  return 0
end
local seq = redis.call('INCR', KEYS[4])
local score = tonumber(ARGV[3]) * 1e15 + seq
redis.call('HSET', KEYS[1], id, ARGV[2])
redis.call('HSET', KEYS[3], id, score)
redis.call('ZADD', KEYS[2], score, id)
return 1
"#;

const CLAIM: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
for _, key in ipairs({KEYS[4], KEYS[5]}) do
  local due = redis.call('ZRANGEBYSCORE', key, '-inf', now)
  for _, id in ipairs(due) do
    redis.call('ZREM', key, id)
    redis.call('HDEL', KEYS[6], id)
    local score = redis.call('HGET', KEYS[3], id)
    if score then redis.call('ZADD', KEYS[2], score, id) end
  end
end
local head = redis.call('ZRANGE', KEYS[2], 0, 0)
if #head == 0 then return false end
local id = head[1]
redis.call('ZREM', KEYS[2], id)
local expires = now + tonumber(ARGV[1])
redis.call('ZADD', KEYS[5], expires, id)
redis.call('HSET', KEYS[6], id, ARGV[2])
return {redis.call('HGET', KEYS[1], id), expires}
"#;

const ACKNOWLEDGE: &str = r#"
redis.call('HDEL', KEYS[1], id)
redis.call('HDEL', KEYS[3], id)
redis.call('ZREM', KEYS[5], id)
redis.call('HDEL', KEYS[6], id)
return 1
"#;

const RELEASE: &str = r#"
redis.call('ZREM', KEYS[5], id)
redis.call('HDEL', KEYS[6], id)
redis.call('ZADD', KEYS[4], now + tonumber(ARGV[3]), id)
return 1
"#;

const DEAD_LETTER: &str = r#"
local entry = redis.call('HGET', KEYS[1], id)
redis.call('HDEL', KEYS[1], id)
redis.call('HDEL', KEYS[3], id)
redis.call('ZREM', KEYS[5], id)
redis.call('HDEL', KEYS[6], id)
redis.call('HSET', KEYS[7], id, entry)
redis.call('ZADD', KEYS[8], now, id)
return 1
"#;

const DEPTH: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local due = redis.call('ZCOUNT', KEYS[2], '-inf', now)
local expired = redis.call('ZCOUNT', KEYS[3], '-inf', now)
return {
  redis.call('ZCARD', KEYS[1]) + due + expired,
  redis.call('ZCARD', KEYS[2]) - due,
  redis.call('ZCARD', KEYS[3]) - expired,
  redis.call('ZCARD', KEYS[4])
}
"#;

/// Redis key layout under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueKeys {
    /// hash: job id -> entry JSON
    entries: String,
    /// zset: claimable ids, scored by priority rank then enqueue sequence
    ready: String,
    /// hash: job id -> ready score, reused when an entry returns to ready
    order: String,
    /// zset: released ids, scored by eligibility time (ms)
    delayed: String,
    /// zset: leased ids, scored by lease expiry (ms)
    leased: String,
    /// hash: job id -> current lease token
    locks: String,
    /// hash: job id -> entry JSON, dead-lettered
    dead: String,
    /// zset: dead-lettered ids, scored by dead-letter time (ms)
    dead_index: String,
    seq: String,
}

impl QueueKeys {
    pub(crate) fn new(prefix: &str) -> Self {
        let key = |name: &str| format!("{}:queue:{}", prefix, name);
        Self {
            entries: key("entries"),
            ready: key("ready"),
            order: key("order"),
            delayed: key("delayed"),
            leased: key("leased"),
            locks: key("locks"),
            dead: key("dead"),
            dead_index: key("dead-index"),
            seq: key("seq"),
        }
    }

    /// Key order expected by the settle scripts
    fn settle(&self) -> [&str; 8] {
        [
            &self.entries,
            &self.ready,
            &self.order,
            &self.delayed,
            &self.leased,
            &self.locks,
            &self.dead,
            &self.dead_index,
        ]
    }
}

struct QueueScripts {
    enqueue: Script,
    claim: Script,
    acknowledge: Script,
    release: Script,
    dead_letter: Script,
    depth: Script,
}

impl QueueScripts {
    fn load() -> Self {
        let settle = |body: &str| Script::new(&format!("{}{}", HELD, body));
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            acknowledge: settle(ACKNOWLEDGE),
            release: settle(RELEASE),
            dead_letter: settle(DEAD_LETTER),
            depth: Script::new(DEPTH),
        }
    }
}

/// Durable queue store on redis; every state change is one Lua script
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    keys: QueueKeys,
    scripts: Arc<QueueScripts>,
}

impl RedisQueueStore {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(prefix),
            scripts: Arc::new(QueueScripts::load()),
        }
    }

    /// Open a managed connection to `url`
    pub async fn connect(url: &str, prefix: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    async fn settle(&self, script: &Script, job_id: &JobId, token: &LeaseToken, extra: Option<u64>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        for key in self.keys.settle() {
            invocation.key(key);
        }
        invocation.arg(job_id.as_str()).arg(token.as_str());
        if let Some(extra) = extra {
            invocation.arg(extra);
        }

        let held: i64 = invocation.invoke_async(&mut conn).await?;
        if held == 1 {
            Ok(())
        } else {
            Err(QueueError::InvalidLock(job_id.clone()))
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timestamp(ms: i64) -> QueueResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::Internal(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()> {
        let json = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();

        let inserted: i64 = self
            .scripts
            .enqueue
            .key(&self.keys.entries)
            .key(&self.keys.ready)
            .key(&self.keys.order)
            .key(&self.keys.seq)
            .key(&self.keys.dead)
            .arg(entry.job_id.as_str())
            .arg(json)
            .arg(u32::from(entry.priority.claim_rank()))
            .invoke_async(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(QueueError::DuplicateId(entry.job_id));
        }
        debug!(job_id = %entry.job_id, "Entry enqueued");
        Ok(())
    }

    async fn claim(&self, worker: &WorkerId, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let token = LeaseToken::new();
        let mut conn = self.conn.clone();

        let claimed: Option<(String, i64)> = self
            .scripts
            .claim
            .key(&self.keys.entries)
            .key(&self.keys.ready)
            .key(&self.keys.order)
            .key(&self.keys.delayed)
            .key(&self.keys.leased)
            .key(&self.keys.locks)
            .arg(millis(lease))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        let Some((json, expires_ms)) = claimed else {
            return Ok(None);
        };

        Ok(Some(ClaimedJob {
            entry: serde_json::from_str(&json)?,
            lease_token: token,
            lock_expires_at: timestamp(expires_ms)?,
            worker_id: worker.clone(),
        }))
    }

    async fn acknowledge(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()> {
        self.settle(&self.scripts.acknowledge, job_id, token, None).await
    }

    async fn release(&self, job_id: &JobId, token: &LeaseToken, delay: Duration) -> QueueResult<()> {
        self.settle(&self.scripts.release, job_id, token, Some(millis(delay))).await
    }

    async fn move_to_dead_letter(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<()> {
        self.settle(&self.scripts.dead_letter, job_id, token, None).await
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();

        let indexed: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.keys.dead_index)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        if indexed.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = indexed.iter().map(|(id, _)| id.as_str()).collect();
        let entries: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.dead)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        indexed
            .iter()
            .zip(entries)
            .filter_map(|((_, ms), json)| json.map(|json| (json, *ms as i64)))
            .map(|(json, ms)| {
                Ok(DeadLetterEntry {
                    entry: serde_json::from_str(&json)?,
                    dead_lettered_at: timestamp(ms)?,
                })
            })
            .collect()
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let (ready, delayed, leased, dead): (usize, usize, usize, usize) = self
            .scripts
            .depth
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.leased)
            .key(&self.keys.dead_index)
            .invoke_async(&mut conn)
            .await?;

        Ok(QueueDepth { ready, delayed, leased, dead })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("tutor");
        assert_eq!(keys.ready, "tutor:queue:ready");
        assert_eq!(keys.dead_index, "tutor:queue:dead-index");
        assert_eq!(keys.settle()[4], "tutor:queue:leased");
        assert_eq!(keys.settle()[5], "tutor:queue:locks");
    }

    #[test]
    fn test_settle_scripts_share_lease_check() {
        let scripts = QueueScripts::load();
        assert_ne!(scripts.acknowledge.get_hash(), scripts.release.get_hash());
        assert!(HELD.contains("KEYS[6]"));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
