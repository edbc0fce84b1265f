//! Retry & Backoff Module
//!
//! Translates per-module call options into a retry budget and a backoff
//! curve. Attempts are 1-based: the first invocation is attempt 1 and
//! consumes no retry budget.

use crate::dag::{BackoffKind, ModuleCallOptions};
use std::time::Duration;

/// Exponential backoff never exceeds one hour.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Resolved retry behavior for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 = fail immediately)
    pub retry: u32,
    /// Base delay between attempts
    pub delay: Duration,
    pub backoff: BackoffKind,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retry: 0,
            delay: Duration::from_millis(100),
            backoff: BackoffKind::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn from_options(options: &ModuleCallOptions) -> Self {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            retry: options.retry.unwrap_or(defaults.retry),
            delay: options
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay),
            backoff: options.backoff.unwrap_or(defaults.backoff),
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.retry
    }

    /// Delay before the attempt following attempt number `attempt`.
    ///
    /// fixed: `delay`; linear: `delay * attempt`;
    /// exponential: `delay * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Linear => self.delay.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        raw.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retry: u32, delay_ms: u64, backoff: BackoffKind) -> RetryPolicy {
        RetryPolicy {
            retry,
            delay: Duration::from_millis(delay_ms),
            backoff,
        }
    }

    #[test]
    fn test_zero_retry_fails_immediately() {
        let p = policy(0, 100, BackoffKind::Fixed);
        assert!(!p.allows_retry(1));
    }

    #[test]
    fn test_retry_budget() {
        let p = policy(2, 100, BackoffKind::Fixed);
        assert!(p.allows_retry(1));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(3, 10, BackoffKind::Fixed);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(p.backoff_delay(5), Duration::from_millis(10));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(3, 10, BackoffKind::Linear);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(30));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let p = policy(3, 10, BackoffKind::Exponential);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(40));
        // Deep attempts saturate at the cap.
        assert_eq!(p.backoff_delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_from_options() {
        let opts = ModuleCallOptions {
            retry: Some(2),
            delay_ms: Some(10),
            backoff: Some(BackoffKind::Exponential),
            ..ModuleCallOptions::default()
        };
        let p = RetryPolicy::from_options(&opts);
        assert_eq!(p.retry, 2);
        assert_eq!(p.delay, Duration::from_millis(10));
        assert_eq!(p.backoff, BackoffKind::Exponential);
    }
}
