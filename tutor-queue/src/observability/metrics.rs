use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Live counters for dispatch and worker activity
#[derive(Default)]
pub struct LiveMetrics {
    jobs_submitted: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    leases_lost: AtomicU64,
    handler_panics: AtomicU64,

    // Per-kind metrics
    kinds: Mutex<HashMap<String, KindMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_submitted(&self, kind: &str) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().submitted += 1;
    }

    pub fn increment_jobs_claimed(&self, kind: &str) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().claimed += 1;
    }

    pub fn increment_jobs_succeeded(&self, kind: &str) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().succeeded += 1;
    }

    pub fn increment_jobs_retried(&self, kind: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().retried += 1;
    }

    pub fn increment_jobs_failed(&self, kind: &str) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().failed += 1;
    }

    pub fn increment_jobs_dead_lettered(&self, kind: &str) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.kinds.lock().entry(kind.to_string()).or_default().dead_lettered += 1;
    }

    pub fn increment_leases_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handler_panics(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one handler invocation ran
    pub fn record_execution_time(&self, kind: &str, elapsed: Duration) {
        let mut kinds = self.kinds.lock();
        let metrics = kinds.entry(kind.to_string()).or_default();
        metrics.executions += 1;
        metrics.total_execution += elapsed;
    }

    pub fn jobs_submitted(&self) -> u64 {
        self.jobs_submitted.load(Ordering::Relaxed)
    }

    pub fn jobs_claimed(&self) -> u64 {
        self.jobs_claimed.load(Ordering::Relaxed)
    }

    pub fn jobs_succeeded(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn leases_lost(&self) -> u64 {
        self.leases_lost.load(Ordering::Relaxed)
    }

    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    /// Get metrics for a specific kind
    pub fn kind_metrics(&self, kind: &str) -> Option<KindMetrics> {
        self.kinds.lock().get(kind).cloned()
    }

    /// Collect current snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_submitted: self.jobs_submitted(),
                jobs_claimed: self.jobs_claimed(),
                jobs_succeeded: self.jobs_succeeded(),
                jobs_retried: self.jobs_retried(),
                jobs_failed: self.jobs_failed(),
                jobs_dead_lettered: self.jobs_dead_lettered(),
                leases_lost: self.leases_lost(),
                handler_panics: self.handler_panics(),
            },
            kinds: self.kinds.lock().clone(),
        }
    }
}

/// Metrics for a single job kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindMetrics {
    pub submitted: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub executions: u64,
    pub total_execution: Duration,
}

impl KindMetrics {
    /// Calculate success rate as percentage of finished jobs
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed + self.dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.succeeded as f64 / finished as f64) * 100.0
        }
    }

    pub fn average_execution_time(&self) -> Option<Duration> {
        if self.executions == 0 {
            return None;
        }
        u32::try_from(self.executions)
            .ok()
            .map(|n| self.total_execution / n)
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub kinds: HashMap<String, KindMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalMetrics {
    pub jobs_submitted: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub handler_panics: u64,
}

impl GlobalMetrics {
    /// Submitted jobs that have not reached a terminal state
    pub fn jobs_outstanding(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_succeeded + self.jobs_failed + self.jobs_dead_lettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_metrics() {
        let metrics = LiveMetrics::new();

        metrics.increment_jobs_submitted("grade-problem-set");
        metrics.increment_jobs_submitted("grade-problem-set");
        metrics.increment_jobs_claimed("grade-problem-set");
        metrics.increment_jobs_succeeded("grade-problem-set");
        metrics.increment_leases_lost();

        assert_eq!(metrics.jobs_submitted(), 2);
        assert_eq!(metrics.jobs_succeeded(), 1);
        assert_eq!(metrics.leases_lost(), 1);

        let kind = metrics.kind_metrics("grade-problem-set").unwrap();
        assert_eq!(kind.submitted, 2);
        assert_eq!(kind.success_rate(), 100.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.jobs_outstanding(), 1);
        assert!(snapshot.kinds.contains_key("grade-problem-set"));
    }

    #[test]
    fn test_execution_time_average() {
        let metrics = LiveMetrics::new();
        metrics.record_execution_time("explain", Duration::from_millis(100));
        metrics.record_execution_time("explain", Duration::from_millis(300));

        let kind = metrics.kind_metrics("explain").unwrap();
        assert_eq!(kind.average_execution_time(), Some(Duration::from_millis(200)));
        assert_eq!(KindMetrics::default().average_execution_time(), None);
    }

    #[test]
    fn test_success_rate_counts_dead_letters() {
        let kind = KindMetrics {
            succeeded: 3,
            failed: 0,
            dead_lettered: 1,
            ..KindMetrics::default()
        };
        assert_eq!(kind.success_rate(), 75.0);
    }
}
