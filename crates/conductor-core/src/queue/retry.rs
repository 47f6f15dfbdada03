//! Retry policy: decides whether a failed attempt is retried and how long to
//! wait before the next one.
//!
//! Everything here is a pure function of `(attempt, error, config)`; the
//! queue owns all state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{RetryConfig, RetryPolicyKind};
use crate::domain::{AttemptRecord, ExecutionError, RetryMetadata, TaskError};

/// Jitter band applied to every computed delay (±10%).
const JITTER: f64 = 0.1;

/// Retry policy evaluator over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// With initial=1s, multiplier=2:
    /// - exponential: 1s, 2s, 4s, 8s, ...
    /// - linear: 1s, 2s, 3s, 4s, ...
    ///
    /// Capped at `max_delay`. `attempt = 0` is treated as the first attempt
    /// for exponential backoff and yields zero for linear backoff.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms(attempt).round() as u64)
    }

    /// Delay before retry number `attempt`, with ±10% jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`next_delay`](Self::next_delay) with a caller-supplied RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if self.config.policy == RetryPolicyKind::None {
            return Duration::ZERO;
        }
        let base = self.base_delay_ms(attempt);
        let factor = 1.0 + rng.gen_range(-JITTER..=JITTER);
        // Jitter never pushes a delay past the cap.
        let jittered = (base * factor).clamp(0.0, self.config.max_delay_ms as f64);
        Duration::from_millis(jittered.round() as u64)
    }

    /// Is another attempt allowed after `attempts_so_far` retried failures?
    ///
    /// 1. refuse once `attempts_so_far >= max_retries` (or the policy is NONE)
    /// 2. no `retryable_errors` configured: every error is retryable
    /// 3. otherwise the message or code must contain one of the patterns,
    ///    case-insensitively
    pub fn should_retry(&self, attempts_so_far: u32, error: &ExecutionError) -> bool {
        if self.config.policy == RetryPolicyKind::None {
            return false;
        }
        if attempts_so_far >= self.config.max_retries {
            return false;
        }
        let patterns: Vec<String> = self
            .config
            .retryable_errors
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return true;
        }

        let message = error.message.to_lowercase();
        let code = error.code.as_deref().map(str::to_lowercase);
        patterns.iter().any(|pattern| {
            message.contains(pattern.as_str())
                || code.as_deref().is_some_and(|c| c.contains(pattern.as_str()))
        })
    }

    /// Record one failed attempt that is going to be retried.
    ///
    /// Appends an [`AttemptRecord`], bumps `current_attempt` and sets
    /// `next_retry_at = now + delay`. Missing metadata starts from
    /// `current_attempt = 0`. The queue calls this exactly once per retried
    /// failure; it is the only place the history grows.
    ///
    /// Returns the new metadata and the delay to wait.
    pub fn update_retry_metadata(
        &self,
        existing: Option<RetryMetadata>,
        error: &ExecutionError,
        attempt_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (RetryMetadata, Duration) {
        let mut metadata =
            existing.unwrap_or_else(|| RetryMetadata::new(self.config.max_retries));
        let attempt = metadata.current_attempt + 1;
        let delay = self.next_delay(attempt);

        metadata.retry_history.push(AttemptRecord {
            attempt,
            started_at: attempt_started_at,
            completed_at: now.max(attempt_started_at),
            error: TaskError::from(error),
            delay_ms: delay.as_millis() as u64,
        });
        metadata.current_attempt = attempt;
        metadata.next_retry_at = Some(now + chrono_delay(delay));

        (metadata, delay)
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let initial = self.config.initial_delay_ms as f64;
        let raw = match self.config.policy {
            RetryPolicyKind::None => 0.0,
            RetryPolicyKind::Linear => initial * attempt as f64,
            RetryPolicyKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                initial * self.config.backoff_multiplier.powi(exponent)
            }
        };
        // `raw` may be +inf for huge exponents; clamp handles it.
        raw.clamp(0.0, self.config.max_delay_ms as f64)
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn exponential() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            retryable_errors: Vec::new(),
            policy: RetryPolicyKind::Exponential,
        })
    }

    fn with(config: impl FnOnce(&mut RetryConfig)) -> RetryPolicy {
        let mut c = RetryConfig::default();
        config(&mut c);
        RetryPolicy::new(c)
    }

    #[test]
    fn default_policy_has_documented_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.policy, RetryPolicyKind::Exponential);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = exponential();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
    }

    #[rstest]
    #[case::first(1, 900, 1_100)]
    #[case::second(2, 1_800, 2_200)]
    #[case::third(3, 3_600, 4_400)]
    fn exponential_delay_stays_in_jitter_band(#[case] attempt: u32, #[case] lo: u64, #[case] hi: u64) {
        let policy = exponential();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let ms = policy.next_delay_with(attempt, &mut rng).as_millis() as u64;
            assert!((lo..=hi).contains(&ms), "attempt {attempt}: {ms}ms");
        }
    }

    #[test]
    fn linear_backoff_grows_by_initial_delay() {
        let policy = with(|c| c.policy = RetryPolicyKind::Linear);
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(5));
        assert_eq!(policy.base_delay(0), Duration::ZERO);
    }

    #[test]
    fn max_delay_caps_jittered_delays() {
        let policy = with(|c| c.max_delay_ms = 1_500);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=40 {
            let delay = policy.next_delay_with(attempt, &mut rng);
            assert!(delay <= Duration::from_millis(1_500));
        }
        assert_eq!(policy.base_delay(30), Duration::from_millis(1_500));
    }

    #[test]
    fn none_policy_never_waits_and_never_retries() {
        let policy = with(|c| c.policy = RetryPolicyKind::None);
        assert_eq!(policy.next_delay(3), Duration::ZERO);
        assert!(!policy.should_retry(0, &ExecutionError::new("boom")));
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, true)]
    #[case(2, true)]
    #[case(3, false)]
    #[case(7, false)]
    fn retries_stop_at_max_retries(#[case] attempts: u32, #[case] expected: bool) {
        let policy = exponential();
        assert_eq!(policy.should_retry(attempts, &ExecutionError::new("boom")), expected);
    }

    #[test]
    fn retryable_errors_match_message_or_code_case_insensitively() {
        let policy = with(|c| c.retryable_errors = vec!["Rate Limit".into(), "econnreset".into()]);

        assert!(policy.should_retry(0, &ExecutionError::new("API RATE LIMIT exceeded")));
        assert!(policy.should_retry(
            0,
            &ExecutionError::new("socket closed").with_code("ECONNRESET")
        ));
        assert!(!policy.should_retry(0, &ExecutionError::new("syntax error")));
    }

    #[test]
    fn blank_patterns_are_ignored() {
        let policy = with(|c| c.retryable_errors = vec!["  ".into()]);
        assert!(policy.should_retry(0, &ExecutionError::new("anything")));
    }

    #[test]
    fn update_metadata_appends_one_record_per_failure() {
        let policy = exponential();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = ExecutionError::new("boom").with_code("E1");

        let (first, d1) = policy.update_retry_metadata(None, &err, t0, t0);
        assert_eq!(first.current_attempt, 1);
        assert_eq!(first.retry_history.len(), 1);
        assert_eq!(first.max_retries, 3);
        assert_eq!(first.next_retry_at, Some(t0 + chrono::Duration::from_std(d1).unwrap()));
        assert_eq!(first.retry_history[0].error.code.as_deref(), Some("E1"));

        let (second, _) = policy.update_retry_metadata(Some(first), &err, t0, t0);
        assert_eq!(second.current_attempt, 2);
        assert_eq!(second.retry_history.len() as u32, second.current_attempt);
        assert_eq!(second.retry_history[1].attempt, 2);
    }
}
