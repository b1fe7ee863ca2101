//! # Tracking Context
//!
//! Context passed alongside every success or error reported to
//! [`ErrorIntelligence`](crate::intelligence::ErrorIntelligence).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key under which the execution's quality score travels in a [`Context`]
pub const QUALITY_SCORE_KEY: &str = "quality_score";

/// Key under which the consumed attempt count travels in a [`Context`]
pub const ATTEMPTS_KEY: &str = "attempts";

/// Represents context information attached to a tracked execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    /// The operation being performed
    pub operation: String,
    /// Additional context keys and values
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Context {
    /// Creates a new context for the specified operation
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Adds a key-value pair to the context
    pub fn add<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }

    /// Records the quality score of the execution
    pub fn quality(self, score: f64) -> Self {
        self.add(QUALITY_SCORE_KEY, score)
    }

    /// Records how many attempts the execution consumed
    pub fn attempts(self, attempts: u32) -> Self {
        self.add(ATTEMPTS_KEY, attempts)
    }

    /// Quality score carried by this context, clamped to [0, 1]
    pub fn quality_score(&self) -> Option<f64> {
        self.data
            .get(QUALITY_SCORE_KEY)
            .and_then(|value| value.as_f64())
            .filter(|score| score.is_finite())
            .map(|score| score.clamp(0.0, 1.0))
    }

    /// Attempt count carried by this context
    pub fn attempt_count(&self) -> Option<u32> {
        self.data
            .get(ATTEMPTS_KEY)
            .and_then(|value| value.as_u64())
            .map(|attempts| attempts.min(u32::MAX as u64) as u32)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "during operation: {}", self.operation)?;

        if !self.data.is_empty() {
            write!(f, " [")?;
            let mut first = true;
            for (k, v) in &self.data {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", k, v)?;
                first = false;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = Context::new("correlation")
            .add("rows", 120)
            .add("method", "pearson");

        assert_eq!(ctx.operation, "correlation");
        assert_eq!(ctx.data.len(), 2);
    }

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(Context::new("op").quality(1.7).quality_score(), Some(1.0));
        assert_eq!(Context::new("op").quality(-0.3).quality_score(), Some(0.0));
        assert_eq!(Context::new("op").quality_score(), None);
    }

    #[test]
    fn test_attempts_round_trip() {
        assert_eq!(Context::new("op").attempts(3).attempt_count(), Some(3));
        assert_eq!(Context::new("op").add(ATTEMPTS_KEY, "three").attempt_count(), None);
    }

    #[test]
    fn test_display() {
        let ctx = Context::new("regression").add("rows", 10);
        assert_eq!(ctx.to_string(), "during operation: regression [rows: 10]");
    }
}
