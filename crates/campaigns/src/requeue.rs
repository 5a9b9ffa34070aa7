//! Requeue policy shared by every delivery channel.
//!
//! One state machine, parameterized per channel:
//! `queued → sending → { sent | queued (later) | failed }`.
//! Social posts use [`RequeuePolicy::exponential`]; one-shot email sends use
//! [`RequeuePolicy::fail_fast`], which never requeues.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MINUTE: Duration = Duration::from_secs(60);

/// What to do with an item whose delivery attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Put the item back in the queue, due again at `at`.
    Retry { at: DateTime<Utc>, delay: Duration },
    /// Attempts exhausted; the failure is terminal.
    Fail,
}

/// Retry/backoff policy.
///
/// `attempt_count` is the value *after* the claim that produced the failed
/// attempt (claims increment it), so a crash mid-send still consumes budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeuePolicy {
    /// Total attempts allowed, including the first one (>= 1).
    pub max_attempts: u32,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_cap: 60 * MINUTE,
        }
    }
}

impl RequeuePolicy {
    /// Exponential backoff in minutes, capped at `backoff_cap`.
    pub fn exponential(max_attempts: u32, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_cap,
        }
    }

    /// Degenerate policy: a single attempt, failure is terminal.
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// `min(cap, 2^attempt_count)` minutes.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let minutes = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
        let uncapped = MINUTE.checked_mul(u32::try_from(minutes).unwrap_or(u32::MAX));
        match uncapped {
            Some(delay) => delay.min(self.backoff_cap),
            None => self.backoff_cap,
        }
    }

    /// Check if another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Decide the fate of an item that failed on attempt `attempt_count`.
    pub fn on_failure(&self, attempt_count: u32, now: DateTime<Utc>) -> Disposition {
        if !self.should_retry(attempt_count) {
            return Disposition::Fail;
        }
        let delay = self.delay_for_attempt(attempt_count);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Disposition::Retry { at, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_double_until_capped() {
        let p = RequeuePolicy::default();
        assert_eq!(p.delay_for_attempt(1), 2 * MINUTE);
        assert_eq!(p.delay_for_attempt(2), 4 * MINUTE);
        assert_eq!(p.delay_for_attempt(5), 32 * MINUTE);
        assert_eq!(p.delay_for_attempt(6), 60 * MINUTE);
        assert_eq!(p.delay_for_attempt(200), 60 * MINUTE);
    }

    #[test]
    fn retries_until_max_then_fails() {
        let p = RequeuePolicy::default();
        let now = Utc::now();
        for attempt in 1..5 {
            match p.on_failure(attempt, now) {
                Disposition::Retry { at, delay } => {
                    assert!(at > now);
                    assert_eq!(delay, p.delay_for_attempt(attempt));
                }
                Disposition::Fail => panic!("attempt {attempt} should be retried"),
            }
        }
        assert_eq!(p.on_failure(5, now), Disposition::Fail);
        assert_eq!(p.on_failure(6, now), Disposition::Fail);
    }

    #[test]
    fn fail_fast_never_requeues() {
        let p = RequeuePolicy::fail_fast();
        assert_eq!(p.on_failure(1, Utc::now()), Disposition::Fail);
    }

    #[test]
    fn exponential_clamps_zero_attempts() {
        assert_eq!(RequeuePolicy::exponential(0, MINUTE).max_attempts, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn backoff_is_strictly_increasing_below_cap(attempt in 0u32..40, cap_minutes in 1u64..10_000) {
            let p = RequeuePolicy::exponential(5, Duration::from_secs(cap_minutes * 60));
            let a = p.delay_for_attempt(attempt);
            let b = p.delay_for_attempt(attempt + 1);
            prop_assert!(a <= p.backoff_cap);
            if a < p.backoff_cap {
                prop_assert!(b > a);
            } else {
                prop_assert_eq!(b, p.backoff_cap);
            }
        }
    }
}
