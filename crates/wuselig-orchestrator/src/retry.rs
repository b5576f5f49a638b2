use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use wuselig_core::ErrorKind;

/// Configures retry behaviour for failed agent invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries of one phase before escalating to a human.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff, before jitter).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the uniformly random jitter added to every delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_jitter_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// What to do with a failed phase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch the phase as attempt `attempt`.
    Retry { attempt: u32 },
    /// Stop retrying; hand the work item to a human.
    Escalate { cause: String },
}

/// Decides whether a failed step is retried or escalated, and how long to wait.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Decide the fate of an attempt that failed with `kind` after `retry_count` retries.
    pub fn decide(&self, retry_count: u32, kind: ErrorKind, message: Option<&str>) -> RetryDecision {
        let detail = message.unwrap_or("no details reported");
        if !kind.is_retryable() {
            return RetryDecision::Escalate {
                cause: format!("{kind} failure: {detail}"),
            };
        }
        if retry_count >= self.policy.max_retries {
            return RetryDecision::Escalate {
                cause: format!(
                    "retry budget of {} exhausted, last {kind} failure: {detail}",
                    self.policy.max_retries
                ),
            };
        }
        RetryDecision::Retry {
            attempt: retry_count.saturating_add(1),
        }
    }

    /// Backoff before the next attempt: `min(base * 2^retry_count, max)` without jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let delay = self
            .policy
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(delay.min(self.policy.max_delay_ms))
    }

    /// Backoff before the next attempt, with jitter in `[0, jitter_ms]`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter = if self.policy.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.policy.jitter_ms)
        };
        self.base_delay(retry_count)
            .saturating_add(Duration::from_millis(jitter))
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_retries: u32) -> RetryController {
        RetryController::new(RetryPolicy {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 50,
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let c = controller(3);
        assert_eq!(c.base_delay(0), Duration::from_millis(100));
        assert_eq!(c.base_delay(1), Duration::from_millis(200));
        assert_eq!(c.base_delay(3), Duration::from_millis(800));
        assert_eq!(c.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(c.base_delay(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let c = controller(3);
        for retry in 0..5 {
            for _ in 0..50 {
                let d = c.delay(retry);
                let base = c.base_delay(retry);
                assert!(d >= base);
                assert!(d <= base + Duration::from_millis(50));
            }
        }
    }

    #[test]
    fn test_transient_failures_retry_until_budget() {
        let c = controller(3);
        assert_eq!(
            c.decide(0, ErrorKind::Transient, None),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            c.decide(2, ErrorKind::Conflict, Some("lost race")),
            RetryDecision::Retry { attempt: 3 }
        );
        match c.decide(3, ErrorKind::Transient, Some("timeout")) {
            RetryDecision::Escalate { cause } => {
                assert!(cause.contains("retry budget of 3 exhausted"));
                assert!(cause.contains("timeout"));
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_permanent_failure_escalates_immediately() {
        let c = controller(3);
        assert!(matches!(
            c.decide(0, ErrorKind::Permanent, Some("repository archived")),
            RetryDecision::Escalate { .. }
        ));
    }

    #[test]
    fn test_zero_retries_escalates_on_first_failure() {
        let c = controller(0);
        assert!(matches!(
            c.decide(0, ErrorKind::Transient, None),
            RetryDecision::Escalate { .. }
        ));
    }

    #[test]
    fn test_policy_defaults_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_retries = 5").unwrap_or_default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 30_000);
        assert_eq!(policy.jitter_ms, 5_000);
    }
}
