//! Crash-restart budget.

use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Restart after this delay.
    RetryAfter(Duration),
    /// Budget spent; stay in `error`.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    /// `base * 2^retries`, capped at 30 s.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Decide what to do after a crash, given the retries spent so far.
    pub fn decide(&self, retries: u32) -> RetryDecision {
        if retries < self.max_retries {
            RetryDecision::RetryAfter(self.backoff(retries))
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(5, Duration::from_millis(1000));
        assert_eq!(p.backoff(0), Duration::from_millis(1000));
        assert_eq!(p.backoff(1), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_millis(8000));
        assert_eq!(p.backoff(10), MAX_BACKOFF);
        assert_eq!(p.backoff(64), MAX_BACKOFF);
    }

    #[test]
    fn budget_boundary() {
        let p = RetryPolicy::new(5, Duration::from_millis(10));
        for retries in 0..5 {
            assert!(matches!(p.decide(retries), RetryDecision::RetryAfter(_)));
        }
        assert_eq!(p.decide(5), RetryDecision::Exhausted);
        assert_eq!(p.decide(6), RetryDecision::Exhausted);
    }

    #[test]
    fn zero_budget_never_retries() {
        let p = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(p.decide(0), RetryDecision::Exhausted);
    }
}
