use std::time::Duration;

use uuid::Uuid;

use crate::config::RetryPolicy;

/// Bounded exponential delay between reconnect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn exhausted(&self) -> bool {
        self.failures > self.policy.max_retries
    }

    /// Records a failed attempt and returns the delay to wait before the next one.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures - 1)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let pow = attempt.min(16); // prevent overflow
        let base = self.policy.base_delay.as_millis() as u64;
        let max = self.policy.max_delay.as_millis() as u64;
        let capped = base.saturating_mul(1u64 << pow).min(max);
        if !self.policy.jitter || capped == 0 {
            return Duration::from_millis(capped);
        }
        let jitter_source = Uuid::new_v4().as_u128();
        let jitter = (jitter_source % (capped as u128 / 2).max(1)) as u64;
        Duration::from_millis(capped.saturating_add(jitter).min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_retries,
            jitter: false,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = Backoff::new(policy(10));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.on_failure().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn reset_restores_base_delay() {
        let mut backoff = Backoff::new(policy(10));
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
    }

    #[test]
    fn exhausted_after_max_retries() {
        let mut backoff = Backoff::new(policy(2));
        backoff.on_failure();
        backoff.on_failure();
        assert!(!backoff.exhausted());
        backoff.on_failure();
        assert!(backoff.exhausted());
    }

    #[test]
    fn jitter_stays_within_cap() {
        let backoff = Backoff::new(RetryPolicy {
            jitter: true,
            ..policy(3)
        });
        for attempt in 0..8 {
            let delay = backoff.delay_for(attempt);
            assert!(delay <= Duration::from_millis(1_000));
            assert!(delay >= Duration::from_millis(100));
        }
    }
}
