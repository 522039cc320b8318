use std::time::Duration;

use rand::Rng;

use crate::QueueConfig;

/// Delay before a transiently failed job becomes claimable again
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed backoff
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter: 0.0 }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.base_retry_backoff, config.max_retry_backoff).with_jitter(config.retry_jitter)
    }

    /// `base * 2^attempt`, capped at `max`, where `attempt` is the attempt
    /// that just failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);

        if self.jitter > 0.0 && !delay.is_zero() {
            let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
            (delay + extra).min(self.max)
        } else {
            delay
        }
    }
}

/// Empty-queue polling interval: doubles while idle, resets on work
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    /// Interval to sleep now; the following call returns double
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max).max(self.min);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_idle_backoff_doubles_and_resets() {
        let mut idle = IdleBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(idle.next_delay(), Duration::from_millis(100));
        assert_eq!(idle.next_delay(), Duration::from_millis(200));
        assert_eq!(idle.next_delay(), Duration::from_millis(400));
        assert_eq!(idle.next_delay(), Duration::from_millis(500));
        assert_eq!(idle.next_delay(), Duration::from_millis(500));

        idle.reset();
        assert_eq!(idle.next_delay(), Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn backoff_is_capped_and_monotonic(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            attempt in 0u32..64,
            jitter in 0.0f64..=1.0,
        ) {
            let policy = RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
                .with_jitter(jitter);
            let delay = policy.backoff(attempt);
            prop_assert!(delay <= Duration::from_millis(max_ms));

            let plain = RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
            prop_assert!(plain.backoff(attempt) <= plain.backoff(attempt + 1));
            prop_assert!(delay >= plain.backoff(attempt));
        }
    }
}
