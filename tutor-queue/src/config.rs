use std::str::FromStr;
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Configuration for the dispatcher and worker pool
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Number of concurrent worker loops
    pub concurrency: usize,
    /// Lease granted on claim; also the handler timeout
    pub lease_duration: Duration,
    /// Idle poll interval after a claim found work
    pub poll_interval_min: Duration,
    /// Ceiling for the idle poll interval
    pub poll_interval_max: Duration,
    /// Pause after the store reports itself unavailable
    pub store_retry_backoff: Duration,
    /// Base retry backoff duration
    pub base_retry_backoff: Duration,
    /// Maximum retry backoff duration
    pub max_retry_backoff: Duration,
    /// Random extra delay as a fraction of the computed backoff, 0.0..=1.0
    pub retry_jitter: f64,
    /// Attempts granted to jobs whose kind and submission set none
    pub default_max_attempts: u32,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,
    /// Upper bound on the serialized payload size
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_duration: Duration::from_secs(300), // 5 minutes
            poll_interval_min: Duration::from_millis(100),
            poll_interval_max: Duration::from_secs(5),
            store_retry_backoff: Duration::from_secs(1),
            base_retry_backoff: Duration::from_secs(2),
            max_retry_backoff: Duration::from_secs(600),
            retry_jitter: 0.0,
            default_max_attempts: 3,
            shutdown_grace: Duration::from_secs(30),
            max_payload_bytes: 256 * 1024,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `QUEUE_*` environment variables.
    ///
    /// Durations are whole milliseconds (`QUEUE_LEASE_MS=60000`).
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an injectable lookup
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "QUEUE_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(ms) = parse(&lookup, "QUEUE_LEASE_MS")? {
            config.lease_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "QUEUE_POLL_MIN_MS")? {
            config.poll_interval_min = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "QUEUE_POLL_MAX_MS")? {
            config.poll_interval_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "QUEUE_STORE_RETRY_MS")? {
            config.store_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "QUEUE_RETRY_BASE_MS")? {
            config.base_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "QUEUE_RETRY_MAX_MS")? {
            config.max_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "QUEUE_RETRY_JITTER")? {
            config.retry_jitter = v;
        }
        if let Some(v) = parse(&lookup, "QUEUE_DEFAULT_MAX_ATTEMPTS")? {
            config.default_max_attempts = v;
        }
        if let Some(ms) = parse(&lookup, "QUEUE_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "QUEUE_MAX_PAYLOAD_BYTES")? {
            config.max_payload_bytes = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".to_string()));
        }
        if self.lease_duration.is_zero() {
            return Err(QueueError::Config("lease duration must be positive".to_string()));
        }
        if self.poll_interval_min > self.poll_interval_max {
            return Err(QueueError::Config(
                "poll interval minimum exceeds maximum".to_string(),
            ));
        }
        if self.base_retry_backoff > self.max_retry_backoff {
            return Err(QueueError::Config(
                "base retry backoff exceeds maximum".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(QueueError::Config("retry jitter must be within 0.0..=1.0".to_string()));
        }
        if self.default_max_attempts == 0 {
            return Err(QueueError::Config("default max attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> QueueResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| QueueError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
