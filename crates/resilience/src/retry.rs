//! Retry Executor Implementation
//!
//! Configurable retry with exponential backoff and jitter. Only failures
//! classified as transient are retried; everything else fails on the first
//! attempt without consuming the budget.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::OperationError;
use common::LogContext;

/// Retry executor errors
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    /// Every allowed attempt failed
    #[error("All {max_attempts} attempts failed, last error: {last_error}")]
    Exhausted {
        attempts: u32,
        max_attempts: u32,
        #[source]
        last_error: OperationError,
    },

    /// Non-retryable failure, stopped immediately
    #[error("Non-retryable error on attempt {attempts}: {source}")]
    Rejected {
        attempts: u32,
        #[source]
        source: OperationError,
    },
}

impl From<RetryError> for crate::error::PipelineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                max_attempts,
                last_error,
            } => Self::RetryExhausted {
                attempts,
                max_attempts,
                last_error,
            },
            RetryError::Rejected { source, .. } => Self::Rejected { source },
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    /// Upper bound for any computed delay
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Case-insensitive substrings marking an error retryable even when
    /// its kind is not
    pub retryable_error_patterns: Vec<String>,

    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_error_patterns: vec![
                "connection reset".to_string(),
                "network timeout".to_string(),
                "service unavailable".to_string(),
                "rate limit".to_string(),
            ],
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Check whether an error may be retried under this policy.
    pub fn is_retryable(&self, error: &OperationError) -> bool {
        if error.kind.is_retryable() {
            return true;
        }
        let text = format!("{} {}", error.kind, error.message).to_lowercase();
        self.retryable_error_patterns
            .iter()
            .any(|pattern| text.contains(&pattern.to_lowercase()))
    }

    /// Raw exponential delay after `completed_attempts` failures, capped at
    /// `max_delay`, before jitter.
    pub fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay to apply after `completed_attempts` failures, jittered when
    /// enabled.
    pub fn delay_before_next(&self, completed_attempts: u32) -> Duration {
        let raw = self.backoff_delay(completed_attempts);
        if self.jitter_enabled {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            Duration::from_secs_f64(raw.as_secs_f64() * factor)
        } else {
            raw
        }
    }
}

/// Successful outcome, carrying how many invocations it took
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Invocations actually made; 1 means no retries were needed
    pub attempts: u32,
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an operation, retrying transient failures with backoff.
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &LogContext,
        operation: F,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(
                correlation_id = %ctx.correlation_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                "Executing attempt"
            );

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            correlation_id = %ctx.correlation_id,
                            attempts = attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(RetryOutcome { value, attempts: attempt });
                }
                Err(error) => {
                    if !self.policy.is_retryable(&error) {
                        warn!(
                            correlation_id = %ctx.correlation_id,
                            error = %error,
                            attempt,
                            "Operation failed with non-retryable error"
                        );
                        return Err(RetryError::Rejected {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    if attempt >= self.policy.max_attempts {
                        warn!(
                            correlation_id = %ctx.correlation_id,
                            attempts = attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %error,
                            "Retry budget exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            max_attempts: self.policy.max_attempts,
                            last_error: error,
                        });
                    }

                    let delay = self.policy.delay_before_next(attempt);
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn transient(msg: &str) -> OperationError {
        OperationError::retryable(msg)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let ctx = LogContext::new();

        let outcome = executor
            .execute(&ctx, || async { Ok::<_, OperationError>(42) })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            jitter_enabled: false,
            ..Default::default()
        });
        let ctx = LogContext::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let outcome = executor
            .execute(&ctx, move || {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err(transient("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            jitter_enabled: false,
            ..Default::default()
        });
        let ctx = LogContext::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result = executor
            .execute(&ctx, move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(transient("down for maintenance")) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                max_attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(max_attempts, 2);
                assert!(last_error.message.contains("maintenance"));
            }
            other => panic!("expected Exhausted, got {:?}", other.map(|o| o.attempts)),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let ctx = LogContext::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let started = Instant::now();
        let result = executor
            .execute(&ctx, move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<u32, _>(OperationError::new(ErrorKind::InvalidRequest, "bad payload"))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Rejected { attempts: 1, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // No backoff sleep on the non-retryable path
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pattern_makes_unknown_error_retryable() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            retryable_error_patterns: vec!["overloaded".to_string()],
            jitter_enabled: false,
            ..Default::default()
        });
        let ctx = LogContext::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let outcome = executor
            .execute(&ctx, move || {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count == 0 {
                        Err(OperationError::new(ErrorKind::Unknown, "Model Overloaded"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_backoff_timing_with_jitter() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            ..Default::default()
        });
        let ctx = LogContext::new();

        let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let invocations_clone = invocations.clone();
        let _ = executor
            .execute(&ctx, move || {
                invocations_clone.lock().push(Instant::now());
                async { Err::<u32, _>(transient("flaky")) }
            })
            .await;

        let stamps = invocations.lock();
        assert_eq!(stamps.len(), 3);
        let gap1 = stamps[1] - stamps[0];
        let gap2 = stamps[2] - stamps[1];
        // jitter scales the raw delay into [0.5, 1.0]; allow scheduler slack upward
        assert!(gap1 >= Duration::from_millis(50), "gap1 = {gap1:?}");
        assert!(gap1 <= Duration::from_millis(180), "gap1 = {gap1:?}");
        assert!(gap2 >= Duration::from_millis(100), "gap2 = {gap2:?}");
        assert!(gap2 <= Duration::from_millis(320), "gap2 = {gap2:?}");
    }

    #[test]
    fn test_backoff_delay_progression() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_enabled: false,
            ..Default::default()
        };

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(10)); // capped
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_max(attempt in 1u32..20, base_ms in 1u64..2000, multiplier in 1.0f64..4.0) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: multiplier,
                jitter_enabled: false,
                ..Default::default()
            };
            prop_assert!(policy.backoff_delay(attempt) <= Duration::from_secs(30));
        }

        #[test]
        fn prop_jitter_stays_in_half_to_full_range(attempt in 1u32..10) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                jitter_enabled: true,
                ..Default::default()
            };
            let raw = policy.backoff_delay(attempt).as_secs_f64();
            let jittered = policy.delay_before_next(attempt).as_secs_f64();
            prop_assert!(jittered <= raw + 1e-9);
            prop_assert!(jittered >= raw * 0.5 - 1e-9);
        }
    }
}
