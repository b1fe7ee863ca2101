//! # Error Taxonomy
//!
//! This module provides the closed set of error kinds a worker can raise,
//! their severities, and the immutable [`ErrorEvent`] that carries a
//! classified failure through the framework.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of an error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Degrades quality but does not fail the operation
    Warning,
    /// Fails the operation
    Error,
    /// Fails the operation and points at a defect or exhausted resource
    Critical,
}

impl Severity {
    /// Returns true if an event of this severity fails an execution
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Categorizes the failures a worker can produce
///
/// The set is closed: new failure modes are added as variants, never as
/// free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required column, field or argument is absent
    MissingInput,
    /// Input has the wrong type (e.g. a text column where numbers are needed)
    InvalidType,
    /// A parameter value is not acceptable
    InvalidParameter,
    /// A value lies outside its meaningful range
    InvalidRange,
    /// Not enough observations to compute a stable result
    InsufficientData,
    /// The computation itself failed
    ComputationFailure,
    /// Memory, handles or another resource ran out
    ResourceExhaustion,
    /// The operation exceeded its time budget or was cancelled
    Timeout,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::MissingInput,
        ErrorKind::InvalidType,
        ErrorKind::InvalidParameter,
        ErrorKind::InvalidRange,
        ErrorKind::InsufficientData,
        ErrorKind::ComputationFailure,
        ErrorKind::ResourceExhaustion,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    /// Severity assigned to events of this kind unless overridden
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::InvalidRange => Severity::Warning,
            ErrorKind::ResourceExhaustion | ErrorKind::Unknown => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// Returns true for kinds that may succeed when simply tried again
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::ResourceExhaustion)
    }

    /// Stable identifier used for histogram keys and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::InvalidType => "invalid_type",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::ComputationFailure => "computation_failure",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Remediation hint attached to events that carry no explicit suggestion
    pub fn default_suggestion(&self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "Check that every required column and parameter is provided",
            ErrorKind::InvalidType => "Convert the input to the expected type before running the analysis",
            ErrorKind::InvalidParameter => "Review the parameter values against the operation's documented options",
            ErrorKind::InvalidRange => "Clip or filter values outside the expected range",
            ErrorKind::InsufficientData => "Collect more observations or relax the minimum sample size",
            ErrorKind::ComputationFailure => "Inspect the input for degenerate values such as constant or all-null columns",
            ErrorKind::ResourceExhaustion => "Reduce the input size or raise the resource limits",
            ErrorKind::Timeout => "Increase the time budget or split the work into smaller batches",
            ErrorKind::Unknown => "Report this failure with its context; it indicates an unclassified defect",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MissingInput => write!(f, "Missing Input"),
            ErrorKind::InvalidType => write!(f, "Invalid Type"),
            ErrorKind::InvalidParameter => write!(f, "Invalid Parameter"),
            ErrorKind::InvalidRange => write!(f, "Invalid Range"),
            ErrorKind::InsufficientData => write!(f, "Insufficient Data"),
            ErrorKind::ComputationFailure => write!(f, "Computation Failure"),
            ErrorKind::ResourceExhaustion => write!(f, "Resource Exhaustion"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Unknown => write!(f, "Unknown Error"),
        }
    }
}

/// A classified failure produced by a worker
///
/// Events are assembled with the consuming builder methods and are read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    kind: ErrorKind,
    message: String,
    severity: Severity,
    #[serde(default)]
    context: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl ErrorEvent {
    /// Creates a new event with the kind's default severity
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: kind.default_severity(),
            context: serde_json::Map::new(),
            suggestion: None,
            occurred_at: Utc::now(),
        }
    }

    /// Overrides the severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Raises the severity to at least `floor`
    pub fn at_least(mut self, floor: Severity) -> Self {
        self.severity = self.severity.max(floor);
        self
    }

    /// Adds context information to the event
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Sets a remediation suggestion
    pub fn suggestion<S: Into<String>>(mut self, suggestion: S) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn level(&self) -> Severity {
        self.severity
    }

    pub fn context_map(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    /// The explicit suggestion, if one was attached
    pub fn explicit_suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    /// The explicit suggestion, falling back to the kind's default hint
    pub fn advice(&self) -> &str {
        self.suggestion
            .as_deref()
            .unwrap_or_else(|| self.kind.default_suggestion())
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Returns true if this event fails the execution it belongs to
    pub fn is_blocking(&self) -> bool {
        self.severity.is_blocking()
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(suggestion) = &self.suggestion {
            write!(f, " (Suggestion: {})", suggestion)?;
        }

        Ok(())
    }
}

/// Errors raised by the framework's own plumbing: setup, configuration and
/// agent assembly. Worker failures never use this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Logging or another global facility could not be initialised
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    /// An agent was assembled with an invalid worker layout
    #[error("Invalid agent configuration: {0}")]
    InvalidAgent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = ErrorEvent::new(ErrorKind::InvalidType, "Column 'age' must be numeric")
            .context("column", "age")
            .suggestion("Cast 'age' to a number");

        assert_eq!(event.kind(), ErrorKind::InvalidType);
        assert_eq!(event.level(), Severity::Error);
        assert_eq!(event.message(), "Column 'age' must be numeric");
        assert_eq!(event.context_value("column"), Some(&serde_json::json!("age")));
        assert_eq!(event.advice(), "Cast 'age' to a number");
    }

    #[test]
    fn test_event_display() {
        let event = ErrorEvent::new(ErrorKind::Timeout, "Exceeded 5s budget")
            .suggestion("Split the input");

        let display = format!("{}", event);
        assert!(display.contains("ERROR"));
        assert!(display.contains("Timeout"));
        assert!(display.contains("Exceeded 5s budget"));
        assert!(display.contains("Suggestion: Split the input"));
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(ErrorKind::InvalidRange.default_severity(), Severity::Warning);
        assert_eq!(ErrorKind::Unknown.default_severity(), Severity::Critical);
        assert_eq!(ErrorKind::ResourceExhaustion.default_severity(), Severity::Critical);
        assert_eq!(ErrorKind::MissingInput.default_severity(), Severity::Error);
        assert!(!Severity::Warning.is_blocking());
        assert!(Severity::Error.is_blocking());
        assert!(Severity::Critical.is_blocking());
    }

    #[test]
    fn test_at_least_never_lowers() {
        let warning = ErrorEvent::new(ErrorKind::InvalidRange, "p out of range");
        assert_eq!(warning.clone().at_least(Severity::Error).level(), Severity::Error);

        let critical = ErrorEvent::new(ErrorKind::Unknown, "boom");
        assert_eq!(critical.at_least(Severity::Error).level(), Severity::Critical);
    }

    #[test]
    fn test_advice_falls_back_to_kind() {
        let event = ErrorEvent::new(ErrorKind::InsufficientData, "3 rows");
        assert!(event.explicit_suggestion().is_none());
        assert_eq!(event.advice(), ErrorKind::InsufficientData.default_suggestion());
    }

    #[test]
    fn test_only_transient_kinds_are_transient() {
        let transient: Vec<_> = ErrorKind::ALL.iter().filter(|k| k.is_transient()).collect();
        assert_eq!(transient, vec![&ErrorKind::ResourceExhaustion, &ErrorKind::Timeout]);
    }
}
