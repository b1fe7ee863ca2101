//! # Execution Results
//!
//! The structured outcome of a single worker invocation and the pure
//! quality-scoring function that grades it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorEvent, Severity};

/// Penalties used to derive a quality score from error and warning counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    /// Subtracted once per error event
    pub error_penalty: f64,
    /// Subtracted once per warning
    pub warning_penalty: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            error_penalty: 0.2,
            warning_penalty: 0.1,
        }
    }
}

impl QualityPolicy {
    /// Scores an execution with `errors` error events and `warnings` warnings.
    ///
    /// Always in [0, 1] and non-increasing in both counts; negative penalties
    /// are treated as zero.
    pub fn score(&self, errors: usize, warnings: usize) -> f64 {
        let error_penalty = self.error_penalty.max(0.0);
        let warning_penalty = self.warning_penalty.max(0.0);
        let raw = 1.0 - error_penalty * errors as f64 - warning_penalty * warnings as f64;
        if raw.is_nan() {
            return 0.0;
        }
        raw.clamp(0.0, 1.0)
    }
}

/// `clamp(1.0 - 0.2 * errors - 0.1 * warnings, 0.0, 1.0)`
pub fn quality_for(errors: usize, warnings: usize) -> f64 {
    QualityPolicy::default().score(errors, warnings)
}

/// Outcome of one worker invocation
///
/// `success` is derived from the error list and is false exactly when at
/// least one event has severity `Error` or above.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    success: bool,
    quality_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    errors: Vec<ErrorEvent>,
    warnings: Vec<String>,
    operation_name: String,
    duration: Duration,
    produced_at: DateTime<Utc>,
    attempts: u32,
}

impl ExecutionResult {
    /// Builds a result from its raw parts, deriving success and quality
    pub fn from_parts<S: Into<String>>(
        operation_name: S,
        payload: Option<serde_json::Value>,
        errors: Vec<ErrorEvent>,
        warnings: Vec<String>,
        policy: &QualityPolicy,
    ) -> Self {
        let success = !errors.iter().any(ErrorEvent::is_blocking);
        let quality_score = policy.score(errors.len(), warnings.len());

        Self {
            success,
            quality_score,
            payload,
            errors,
            warnings,
            operation_name: operation_name.into(),
            duration: Duration::ZERO,
            produced_at: Utc::now(),
            attempts: 1,
        }
    }

    /// A clean success carrying `payload`
    pub fn success<S: Into<String>>(operation_name: S, payload: serde_json::Value) -> Self {
        Self::from_parts(
            operation_name,
            Some(payload),
            Vec::new(),
            Vec::new(),
            &QualityPolicy::default(),
        )
    }

    /// A full failure: quality 0 and a single blocking event
    pub fn failure<S: Into<String>>(operation_name: S, event: ErrorEvent) -> Self {
        let mut result = Self::from_parts(
            operation_name,
            None,
            vec![event.at_least(Severity::Error)],
            Vec::new(),
            &QualityPolicy::default(),
        );
        result.quality_score = 0.0;
        result
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Records the attempt count; never below one
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Appends a warning, lowering quality under `policy` if it applies
    pub fn with_warning<S: Into<String>>(mut self, warning: S, policy: &QualityPolicy) -> Self {
        self.warnings.push(warning.into());
        let rescored = policy.score(self.errors.len(), self.warnings.len());
        self.quality_score = self.quality_score.min(rescored);
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn quality_score(&self) -> f64 {
        self.quality_score
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<serde_json::Value> {
        self.payload
    }

    pub fn errors(&self) -> &[ErrorEvent] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// Number of attempts consumed to produce this result
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The first attached event of any severity
    pub fn first_error(&self) -> Option<&ErrorEvent> {
        self.errors.first()
    }

    /// Events with severity `Error` or above
    pub fn blocking_errors(&self) -> impl Iterator<Item = &ErrorEvent> {
        self.errors.iter().filter(|event| event.is_blocking())
    }

    /// The first event that failed this execution, if any
    pub fn first_blocking_error(&self) -> Option<&ErrorEvent> {
        self.blocking_errors().next()
    }

    /// The worst severity among the attached events
    pub fn worst_severity(&self) -> Option<Severity> {
        self.errors.iter().map(ErrorEvent::level).max()
    }

    /// Succeeded, but only after at least one retry
    pub fn is_recovered(&self) -> bool {
        self.success && self.attempts > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_quality_clean_is_exactly_one() {
        assert_eq!(quality_for(0, 0), 1.0);
    }

    #[test]
    fn test_quality_clamps_at_zero() {
        assert_eq!(quality_for(5, 0), 0.0);
        assert_eq!(quality_for(12, 7), 0.0);
    }

    #[test]
    fn test_quality_penalties() {
        assert!((quality_for(1, 0) - 0.8).abs() < 1e-9);
        assert!((quality_for(0, 1) - 0.9).abs() < 1e-9);
        assert!((quality_for(1, 2) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_negative_penalties_are_ignored() {
        let policy = QualityPolicy {
            error_penalty: -1.0,
            warning_penalty: 0.1,
        };
        assert_eq!(policy.score(3, 0), 1.0);
    }

    #[test]
    fn test_success_derived_from_blocking_errors() {
        let policy = QualityPolicy::default();
        let soft = ErrorEvent::new(ErrorKind::InvalidRange, "value 1.2 clipped");
        let result = ExecutionResult::from_parts("op", None, vec![soft], Vec::new(), &policy);
        assert!(result.is_success());
        assert!((result.quality_score() - 0.8).abs() < 1e-9);
        assert_eq!(result.first_error().map(|e| e.kind()), Some(ErrorKind::InvalidRange));
        assert!(result.first_blocking_error().is_none());

        let hard = ErrorEvent::new(ErrorKind::ComputationFailure, "singular matrix");
        let result = ExecutionResult::from_parts("op", None, vec![hard], Vec::new(), &policy);
        assert!(!result.is_success());
        assert_eq!(result.first_blocking_error().map(|e| e.kind()), Some(ErrorKind::ComputationFailure));
    }

    #[test]
    fn test_failure_is_zero_quality_and_blocking() {
        let soft = ErrorEvent::new(ErrorKind::InvalidRange, "alpha must be in (0, 1)");
        let result = ExecutionResult::failure("op", soft);
        assert!(!result.is_success());
        assert_eq!(result.quality_score(), 0.0);
        assert_eq!(result.errors()[0].level(), Severity::Error);
        assert!(result.payload().is_none());
    }

    #[test]
    fn test_with_warning_lowers_quality() {
        let policy = QualityPolicy::default();
        let result = ExecutionResult::success("op", serde_json::json!(1)).with_warning("3 nulls dropped", &policy);
        assert!(result.is_success());
        assert!((result.quality_score() - 0.9).abs() < 1e-9);
        assert_eq!(result.warnings(), ["3 nulls dropped".to_string()]);

        let failed = ExecutionResult::failure("op", ErrorEvent::new(ErrorKind::Timeout, "slow"))
            .with_warning("aborted", &policy);
        assert_eq!(failed.quality_score(), 0.0);
    }

    #[test]
    fn test_attempts_never_below_one() {
        let result = ExecutionResult::success("op", serde_json::json!(null)).with_attempts(0);
        assert_eq!(result.attempts(), 1);
        assert!(!result.is_recovered());
        assert!(result.with_attempts(3).is_recovered());
    }
}
