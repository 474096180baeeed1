//! Retry decisions for failed backend calls

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use crate::backend::BackendError;

/// How a unit is retried after a retryable [`BackendError`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backend calls allowed per unit, first call included
    pub max_attempts: u32,
    /// Wait before the first retry; doubles for each later one
    pub base_delay: Duration,
    /// Longest wait between two calls, provider hints included
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before calling again once `attempts` calls have ended, the last
    /// one with `error`. `None` means the unit has failed for good.
    #[must_use]
    pub fn next_delay(&self, attempts: u32, error: &BackendError) -> Option<Duration> {
        if !error.is_retryable() || attempts >= self.max_attempts.max(1) {
            return None;
        }
        let wait = error
            .retry_after()
            .unwrap_or_else(|| self.backoff(attempts.saturating_sub(1)));
        Some(wait.min(self.max_delay))
    }

    /// Doubling step for the `retry`-th retry (0-based) plus up to a quarter
    /// of spread, so units that failed together do not retry in lockstep
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let step = self.base_delay.saturating_mul(factor).min(self.max_delay);
        step.saturating_add(step.mul_f64(spread()))
    }
}

/// Fraction in `[0, 0.25)`
#[allow(clippy::cast_precision_loss)]
fn spread() -> f64 {
    let bits = RandomState::new().build_hasher().finish();
    (bits % 1000) as f64 / 4000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    fn transient() -> BackendError {
        BackendError::Transient("503".into())
    }

    #[test]
    fn permanent_and_auth_errors_never_retry() {
        let p = policy();
        assert_eq!(p.next_delay(1, &BackendError::Permanent("bad voice".into())), None);
        assert_eq!(p.next_delay(1, &BackendError::Auth("no key".into())), None);
    }

    #[test]
    fn last_attempt_gives_up() {
        let p = policy();
        assert!(p.next_delay(3, &transient()).is_some());
        assert_eq!(p.next_delay(4, &transient()), None);
    }

    #[test]
    fn zero_attempts_means_a_single_call() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        assert_eq!(p.next_delay(1, &transient()), None);
    }

    #[test]
    fn rate_limit_hint_sets_delay() {
        let err = BackendError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(policy().next_delay(1, &err), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rate_limit_hint_capped_at_max_delay() {
        let err = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy().next_delay(1, &err), Some(Duration::from_secs(2)));
    }

    #[test]
    fn rate_limit_without_hint_backs_off() {
        let err = BackendError::RateLimited { retry_after: None };
        let wait = policy().next_delay(1, &err).expect("retried");
        assert!(wait >= Duration::from_millis(100) && wait < Duration::from_millis(125));
    }

    #[test]
    fn timeouts_back_off_exponentially() {
        let p = policy();
        let err = BackendError::Timeout(Duration::from_secs(20));
        for (attempts, floor) in [(1, 100), (2, 200), (3, 400)] {
            let wait = p.next_delay(attempts, &err).expect("retried");
            let floor = Duration::from_millis(floor);
            assert!(wait >= floor && wait < floor + floor / 4, "{attempts}: {wait:?}");
        }
    }

    #[test]
    fn long_retry_chains_stay_under_max_delay() {
        let p = RetryPolicy {
            max_attempts: u32::MAX,
            ..policy()
        };
        for attempts in [10, 40, u32::MAX - 1] {
            let wait = p.next_delay(attempts, &transient()).expect("retried");
            assert!(wait <= p.max_delay, "{attempts}: {wait:?}");
        }
    }

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert_eq!(p.max_delay, Duration::from_secs(5));
    }
}
