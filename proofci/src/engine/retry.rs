//! Retry controller: decides what happens to a job after each attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{AttemptOutcome, FaultCause};

/// Configuration for attempt retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts a job gets before a transient fault becomes permanent.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles with each attempt.
    pub base_backoff_ms: u64,
    /// Cap applied before jitter.
    pub max_backoff_ms: u64,
    /// Relative jitter, e.g. 0.25 for +/-25%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            jitter: 0.25,
        }
    }
}

/// What to do with a job after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success; the job is done.
    Complete,
    /// Terminal failure, either payload-level or after exhausting attempts.
    FailPermanently { reason: String },
    /// Transient fault with attempts left; run again after `delay`.
    RetryAfter { delay: Duration, reason: String },
    /// The attempt observed an external cancellation.
    Cancel,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetryAfter { .. })
    }
}

/// Whether an outcome is worth another attempt.
///
/// Closed table: every variant and fault cause is listed explicitly.
pub fn is_retryable(outcome: &AttemptOutcome) -> bool {
    match outcome {
        AttemptOutcome::TransientFault { cause, .. } => match cause {
            FaultCause::BackendUnreachable
            | FaultCause::BackendUnavailable
            | FaultCause::BackendTimeout
            | FaultCause::SandboxAllocation
            | FaultCause::ResourceExhausted => true,
        },
        AttemptOutcome::Timeout { .. } => true,
        AttemptOutcome::Success { .. }
        | AttemptOutcome::Failure { .. }
        | AttemptOutcome::Cancelled => false,
    }
}

/// Classifies attempt outcomes and computes backoff.
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide the fate of a job whose attempt `attempt_number` (1-based)
    /// ended with `outcome`.
    pub fn decide(
        &self,
        attempt_number: u32,
        max_attempts: u32,
        outcome: &AttemptOutcome,
    ) -> RetryDecision {
        match outcome {
            AttemptOutcome::Success { .. } => RetryDecision::Complete,
            AttemptOutcome::Cancelled => RetryDecision::Cancel,
            AttemptOutcome::Failure { .. } => RetryDecision::FailPermanently {
                reason: outcome.summary(),
            },
            _ if !is_retryable(outcome) => RetryDecision::FailPermanently {
                reason: outcome.summary(),
            },
            _ if attempt_number >= max_attempts => RetryDecision::FailPermanently {
                reason: format!(
                    "{} (gave up after {} attempts)",
                    outcome.summary(),
                    attempt_number
                ),
            },
            _ => RetryDecision::RetryAfter {
                delay: self.backoff(attempt_number),
                reason: outcome.summary(),
            },
        }
    }

    /// Backoff before the attempt following `attempt_number`, without jitter.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        if attempt_number == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt_number.saturating_sub(1).min(63);
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    /// Jittered backoff.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        self.backoff_with(attempt_number, rand::random::<f64>())
    }

    /// Jittered backoff for a given uniform sample `r` in `[0, 1)`.
    pub fn backoff_with(&self, attempt_number: u32, r: f64) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * r.clamp(0.0, 1.0) - 1.0);
        self.base_delay(attempt_number).mul_f64(factor)
    }

    /// Upper bound on any single backoff for a job with `max_attempts`:
    /// `base * 2^(max_attempts-1) * (1 + jitter)`, or the cap if lower.
    pub fn max_backoff_bound(&self, max_attempts: u32) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        self.base_delay(max_attempts).mul_f64(1.0 + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RetryController {
        RetryController::new(RetryConfig::default())
    }

    #[test]
    fn test_closed_table() {
        assert!(is_retryable(&AttemptOutcome::transient(
            FaultCause::BackendUnreachable,
            "refused"
        )));
        assert!(is_retryable(&AttemptOutcome::timeout(Duration::from_secs(1))));
        assert!(!is_retryable(&AttemptOutcome::success()));
        assert!(!is_retryable(&AttemptOutcome::failure("bad proof")));
        assert!(!is_retryable(&AttemptOutcome::Cancelled));
    }

    #[test]
    fn test_decisions() {
        let c = controller();
        assert_eq!(c.decide(1, 3, &AttemptOutcome::success()), RetryDecision::Complete);
        assert_eq!(c.decide(1, 3, &AttemptOutcome::Cancelled), RetryDecision::Cancel);
        assert!(matches!(
            c.decide(1, 3, &AttemptOutcome::failure("nope")),
            RetryDecision::FailPermanently { .. }
        ));

        let transient = AttemptOutcome::transient(FaultCause::BackendUnavailable, "503");
        assert!(matches!(c.decide(1, 3, &transient), RetryDecision::RetryAfter { .. }));
        assert!(matches!(c.decide(2, 3, &transient), RetryDecision::RetryAfter { .. }));
        assert!(matches!(
            c.decide(3, 3, &transient),
            RetryDecision::FailPermanently { .. }
        ));

        let timeout = AttemptOutcome::timeout(Duration::from_secs(300));
        assert!(matches!(c.decide(3, 3, &timeout), RetryDecision::FailPermanently { .. }));
    }

    #[test]
    fn test_base_delays_double() {
        let c = controller();
        assert_eq!(c.base_delay(1), Duration::from_secs(1));
        assert_eq!(c.base_delay(2), Duration::from_secs(2));
        assert_eq!(c.base_delay(3), Duration::from_secs(4));
        assert_eq!(c.base_delay(30), Duration::from_secs(60));
        assert_eq!(c.base_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let c = controller();
        assert_eq!(c.backoff_with(1, 0.0), Duration::from_millis(750));
        assert_eq!(c.backoff_with(1, 0.5), Duration::from_secs(1));
        assert_eq!(c.backoff_with(2, 1.0), Duration::from_millis(2500));

        for attempt in 1..=3 {
            for _ in 0..200 {
                let d = c.backoff(attempt);
                assert!(d >= c.base_delay(attempt).mul_f64(0.75));
                assert!(d <= c.base_delay(attempt).mul_f64(1.25));
            }
        }
    }

    #[test]
    fn test_backoff_bound() {
        let c = controller();
        let bound = c.max_backoff_bound(3);
        assert_eq!(bound, Duration::from_secs(5));
        for attempt in 1..3 {
            for _ in 0..200 {
                assert!(c.backoff(attempt) <= bound);
            }
        }
    }

    #[test]
    fn test_expected_backoff_non_decreasing() {
        let c = controller();
        let mut previous = Duration::ZERO;
        for attempt in 1..=8 {
            let mean = c.backoff_with(attempt, 0.5);
            assert!(mean >= previous);
            previous = mean;
        }
    }
}
