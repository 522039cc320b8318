use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tutor_queue::QueueConfig;

/// Where queue entries and job records are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Redis,
    /// In-process only; jobs do not survive a restart
    Memory,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "memory" => Ok(Backend::Memory),
            other => Err(anyhow!("unknown queue backend '{}', expected 'redis' or 'memory'", other)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Redis => write!(f, "redis"),
            Backend::Memory => write!(f, "memory"),
        }
    }
}

/// Process-level settings for the worker binary
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub backend: Backend,
    pub redis_url: String,
    pub key_prefix: String,
    pub model_endpoint: String,
    pub model_timeout: Duration,
    pub log_json: bool,
    pub queue: QueueConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tutor".to_string(),
            model_endpoint: "http://127.0.0.1:8080".to_string(),
            model_timeout: Duration::from_secs(120),
            log_json: false,
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerSettings {
    /// Read settings from the process environment. Call `dotenvy::dotenv()`
    /// first to pick up a local `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = match lookup("QUEUE_BACKEND") {
            Some(raw) => raw.parse().context("QUEUE_BACKEND")?,
            None => defaults.backend,
        };

        let model_timeout = match lookup("MODEL_REQUEST_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("MODEL_REQUEST_TIMEOUT_SECS=\"{}\"", raw))?;
                if secs == 0 {
                    bail!("MODEL_REQUEST_TIMEOUT_SECS must be at least 1");
                }
                Duration::from_secs(secs)
            }
            None => defaults.model_timeout,
        };

        let log_json = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") | Some("pretty") => false,
            Some("json") => true,
            Some(other) => bail!("unknown LOG_FORMAT '{}', expected 'text' or 'json'", other),
        };

        let queue = QueueConfig::from_lookup(&lookup).context("queue configuration")?;

        Ok(Self {
            backend,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            model_endpoint: lookup("MODEL_ENDPOINT_URL").unwrap_or(defaults.model_endpoint),
            model_timeout,
            log_json,
            queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.backend, Backend::Redis);
        assert_eq!(settings.key_prefix, "tutor");
        assert_eq!(settings.model_timeout, Duration::from_secs(120));
        assert!(!settings.log_json);
        assert_eq!(settings.queue.concurrency, QueueConfig::default().concurrency);
    }

    #[test]
    fn test_overrides() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("QUEUE_BACKEND", "Memory"),
            ("REDIS_URL", "redis://cache:6380/2"),
            ("QUEUE_KEY_PREFIX", "staging"),
            ("MODEL_ENDPOINT_URL", "http://model:9000"),
            ("MODEL_REQUEST_TIMEOUT_SECS", "30"),
            ("LOG_FORMAT", "json"),
            ("QUEUE_CONCURRENCY", "12"),
        ]))
        .unwrap();

        assert_eq!(settings.backend, Backend::Memory);
        assert_eq!(settings.redis_url, "redis://cache:6380/2");
        assert_eq!(settings.key_prefix, "staging");
        assert_eq!(settings.model_endpoint, "http://model:9000");
        assert_eq!(settings.model_timeout, Duration::from_secs(30));
        assert!(settings.log_json);
        assert_eq!(settings.queue.concurrency, 12);
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(WorkerSettings::from_lookup(lookup(&[("QUEUE_BACKEND", "kafka")])).is_err());
        assert!(WorkerSettings::from_lookup(lookup(&[("MODEL_REQUEST_TIMEOUT_SECS", "soon")])).is_err());
        assert!(WorkerSettings::from_lookup(lookup(&[("MODEL_REQUEST_TIMEOUT_SECS", "0")])).is_err());
        assert!(WorkerSettings::from_lookup(lookup(&[("LOG_FORMAT", "xml")])).is_err());
        assert!(WorkerSettings::from_lookup(lookup(&[("QUEUE_CONCURRENCY", "0")])).is_err());
    }
}
