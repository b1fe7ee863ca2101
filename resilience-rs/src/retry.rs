//! # Retry Mechanism
//!
//! Bounded retry with exponential backoff around any operation that yields
//! an [`ExecutionResult`]. Only transient failures are retried by default,
//! and the wait between attempts is abandoned as soon as the cancellation
//! token fires.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::result::{ExecutionResult, QualityPolicy};
use crate::types::{ErrorEvent, ErrorKind};

/// Context key set on a failure whose abandoned attempt is still running in
/// the background. Such failures are never retried.
pub const STILL_RUNNING_KEY: &str = "still_running";

/// Predicate deciding whether a failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&ErrorEvent) -> bool + Send + Sync>;

/// Configuration for a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Growth factor applied per attempt; must be greater than one
    pub multiplier: f64,

    /// Upper bound on a single delay
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 - 1.0) to add randomness to backoff
    pub jitter_factor: f64,

    /// Error kinds retried by the default predicate
    pub retryable_kinds: Vec<ErrorKind>,

    /// Whether to record metrics
    pub record_metrics: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
            retryable_kinds: vec![ErrorKind::Timeout, ErrorKind::ResourceExhaustion],
            record_metrics: true,
        }
    }
}

impl RetryConfig {
    /// Repairs out-of-range values instead of rejecting them
    pub(crate) fn normalized(mut self) -> Self {
        let defaults = RetryConfig::default();
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.multiplier.is_nan() || self.multiplier <= 1.0 || self.multiplier.is_infinite() {
            warn!(multiplier = %self.multiplier, "Retry multiplier must be > 1, using default");
            self.multiplier = defaults.multiplier;
        }
        if !self.jitter_factor.is_finite() {
            self.jitter_factor = 0.0;
        }
        self.jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }
}

/// A stateless retry policy applied per call
#[derive(Clone)]
pub struct RetryPolicy {
    /// Name of the policy (for logs and metrics)
    name: String,

    /// Configuration for this policy
    config: RetryConfig,

    /// Decides which failures are retried
    retryable: RetryPredicate,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: Option<RetryConfig>) -> Self {
        let config = config.unwrap_or_default().normalized();
        let kinds = config.retryable_kinds.clone();

        Self {
            name: name.into(),
            config,
            retryable: Arc::new(move |event: &ErrorEvent| kinds.contains(&event.kind())),
        }
    }

    /// A policy that runs the operation exactly once
    pub fn never() -> Self {
        Self::fixed("never", 1)
    }

    /// Default backoff with a fixed number of attempts
    pub fn fixed<S: Into<String>>(name: S, max_attempts: u32) -> Self {
        let config = RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        };
        Self::new(name, Some(config))
    }

    /// Retries timeouts and resource exhaustion with the default backoff
    pub fn transient() -> Self {
        Self::new("transient", None)
    }

    /// Replaces the retryable predicate
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ErrorEvent) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Returns true if any blocking error in `result` may be retried and
    /// none of them marks an attempt that is still running
    pub fn is_retryable(&self, result: &ExecutionResult) -> bool {
        let still_running = result
            .blocking_errors()
            .any(|event| event.context_value(STILL_RUNNING_KEY) == Some(&serde_json::Value::Bool(true)));
        !still_running && result.blocking_errors().any(|event| (self.retryable)(event))
    }

    /// Wait after the given (1-based) failed attempt:
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`,
    /// then jittered by up to `jitter_factor` in either direction.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.base_delay_ms as f64;
        let max_ms = self.config.max_delay_ms as f64;

        let raw = base_ms * self.config.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Executes `operation` under this policy
    ///
    /// The returned result carries the number of attempts consumed.
    pub async fn execute<F, Fut>(&self, operation: F, cancel: &CancellationToken) -> ExecutionResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecutionResult>,
    {
        execute_with_retry(operation, self, cancel).await
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetryPolicy({}, max_attempts={})", self.name, self.config.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", None)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// exhausts `policy.max_attempts()`, or `cancel` fires during a backoff wait.
pub async fn execute_with_retry<F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> ExecutionResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExecutionResult>,
{
    let start_time = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        let result = operation().await;

        if policy.config.record_metrics {
            counter!("retry.attempts", 1, "policy" => policy.name.clone());
        }

        if result.is_success() {
            if attempt > 1 {
                info!(
                    policy = %policy.name,
                    operation = %result.operation_name(),
                    attempts = attempt,
                    duration_ms = %start_time.elapsed().as_millis(),
                    "Operation recovered after retries"
                );
                if policy.config.record_metrics {
                    counter!("retry.recovered", 1, "policy" => policy.name.clone());
                }
            }
            return result.with_attempts(attempt);
        }

        if attempt >= policy.config.max_attempts {
            if policy.config.max_attempts > 1 {
                warn!(
                    policy = %policy.name,
                    operation = %result.operation_name(),
                    attempts = attempt,
                    duration_ms = %start_time.elapsed().as_millis(),
                    "Giving up after retries"
                );
                if policy.config.record_metrics {
                    counter!("retry.exhausted", 1, "policy" => policy.name.clone());
                }
            }
            return result.with_attempts(attempt);
        }

        if !policy.is_retryable(&result) {
            debug!(
                policy = %policy.name,
                operation = %result.operation_name(),
                attempt,
                "Failure is not retryable"
            );
            return result.with_attempts(attempt);
        }

        let backoff = policy.backoff_for(attempt);
        debug!(
            policy = %policy.name,
            operation = %result.operation_name(),
            attempt,
            max_attempts = policy.config.max_attempts,
            backoff_ms = %backoff.as_millis(),
            error = ?result.first_blocking_error().map(|e| e.to_string()),
            "Retrying after error"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(
                    policy = %policy.name,
                    operation = %result.operation_name(),
                    attempts = attempt,
                    "Retry aborted by cancellation"
                );
                return result
                    .with_attempts(attempt)
                    .with_warning(
                        format!("Retry aborted by cancellation after {} attempt(s)", attempt),
                        &QualityPolicy::default(),
                    );
            }
            _ = sleep(backoff) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout_failure() -> ExecutionResult {
        ExecutionResult::failure("op", ErrorEvent::new(ErrorKind::Timeout, "Temporary failure"))
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            Some(RetryConfig {
                max_attempts,
                base_delay_ms: 10,
                ..RetryConfig::default()
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = no_jitter(3);
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(
                || {
                    let counter = counter.clone();
                    async move {
                        let attempt = counter.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 {
                            timeout_failure()
                        } else {
                            ExecutionResult::success("op", serde_json::json!(42))
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts(), 3);
        assert!(result.is_recovered());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        for max_attempts in [1, 2, 5] {
            let policy = no_jitter(max_attempts);
            let counter = Arc::new(AtomicU32::new(0));

            let result = policy
                .execute(
                    || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { timeout_failure() }
                    },
                    &CancellationToken::new(),
                )
                .await;

            assert!(!result.is_success());
            assert_eq!(result.attempts(), max_attempts);
            assert_eq!(counter.load(Ordering::SeqCst), max_attempts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures_are_not_retried() {
        let policy = no_jitter(4);
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        ExecutionResult::failure(
                            "op",
                            ErrorEvent::new(ErrorKind::InvalidType, "Column 'x' must be numeric"),
                        )
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let policy = no_jitter(3).with_retryable(|event| event.kind() == ErrorKind::ComputationFailure);
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        ExecutionResult::failure(
                            "op",
                            ErrorEvent::new(ErrorKind::ComputationFailure, "did not converge"),
                        )
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.attempts(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_backoff() {
        let policy = RetryPolicy::new(
            "slow",
            Some(RetryConfig {
                max_attempts: 5,
                base_delay_ms: 60_000,
                ..RetryConfig::default()
            }),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { timeout_failure() }
                },
                &cancel,
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(result.warnings().iter().any(|w| w.contains("cancellation")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wait_is_pending_until_cancelled() {
        let policy = RetryPolicy::new(
            "slow",
            Some(RetryConfig {
                max_attempts: 5,
                base_delay_ms: 60_000,
                ..RetryConfig::default()
            }),
        );
        let cancel = CancellationToken::new();

        let mut task = tokio_test::task::spawn(policy.execute(|| async { timeout_failure() }, &cancel));
        tokio_test::assert_pending!(task.poll());

        cancel.cancel();
        assert!(task.is_woken());
        let result = tokio_test::assert_ready!(task.poll());

        assert_eq!(result.attempts(), 1);
        assert!(result.warnings().iter().any(|w| w.contains("cancellation")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_running_failures_are_not_retried() {
        let policy = no_jitter(3);
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        ExecutionResult::failure(
                            "op",
                            ErrorEvent::new(ErrorKind::Timeout, "budget exceeded").context(STILL_RUNNING_KEY, true),
                        )
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!policy.is_retryable(&result));
        assert!(policy.is_retryable(&timeout_failure()));
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::new(
            "test",
            Some(RetryConfig {
                base_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 35,
                ..RetryConfig::default()
            }),
        );

        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(35));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(
            "jitter",
            Some(RetryConfig {
                base_delay_ms: 100,
                jitter_factor: 0.5,
                ..RetryConfig::default()
            }),
        );

        for _ in 0..50 {
            let delay = policy.backoff_for(1);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_config_is_normalized() {
        let policy = RetryPolicy::new(
            "broken",
            Some(RetryConfig {
                max_attempts: 0,
                multiplier: 0.5,
                jitter_factor: 3.0,
                ..RetryConfig::default()
            }),
        );

        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.config().multiplier, 2.0);
        assert_eq!(policy.config().jitter_factor, 1.0);
        assert_eq!(RetryPolicy::never().max_attempts(), 1);
    }
}
