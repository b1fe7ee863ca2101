//! # Tabular Input
//!
//! A column-oriented handle that upstream providers hand to workers, plus
//! the validation helpers workers use to reject bad input before computing.
//! Helpers return `Result<_, ErrorEvent>` so checks chain with `?` inside
//! [`Worker::validate`](crate::worker::Worker::validate).

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ErrorEvent, ErrorKind};
use crate::worker::Params;

/// A named column of JSON cells; `null` marks a missing observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// True when every non-null cell is a number
    pub fn is_numeric(&self) -> bool {
        self.values.iter().all(|v| v.is_null() || v.is_number())
    }

    /// First non-null cell that is not a number
    pub fn first_non_numeric(&self) -> Option<&Value> {
        self.values.iter().find(|v| !v.is_null() && !v.is_number())
    }

    /// Numeric cells with nulls skipped
    pub fn numeric_values(&self) -> Vec<f64> {
        self.values.iter().filter_map(Value::as_f64).collect()
    }
}

/// Column-oriented table handed to workers by upstream data providers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<Column>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a column
    pub fn with_column<S: Into<String>>(mut self, name: S, values: Vec<Value>) -> Self {
        let column = Column::new(name, values);
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Length of the longest column
    pub fn row_count(&self) -> usize {
        self.columns.iter().map(Column::len).max().unwrap_or(0)
    }
}

/// Fails with `MissingInput` unless the column exists
pub fn require_column<'a>(dataset: &'a Dataset, name: &str) -> Result<&'a Column, ErrorEvent> {
    dataset.column(name).ok_or_else(|| {
        ErrorEvent::new(ErrorKind::MissingInput, format!("Column '{}' not found", name))
            .context("column", name)
            .context("available", dataset.column_names())
    })
}

/// Fails with `InvalidType` unless the column exists and is numeric
pub fn require_numeric<'a>(dataset: &'a Dataset, name: &str) -> Result<&'a Column, ErrorEvent> {
    let column = require_column(dataset, name)?;
    match column.first_non_numeric() {
        None => Ok(column),
        Some(offending) => Err(ErrorEvent::new(
            ErrorKind::InvalidType,
            format!("Column '{}' must be numeric", name),
        )
        .context("column", name)
        .context("offending_value", offending)
        .suggestion(format!("Convert '{}' to numbers or pick a numeric column", name))),
    }
}

/// Fails with `InsufficientData` when the dataset has fewer than `min` rows
pub fn require_min_rows(dataset: &Dataset, min: usize) -> Result<(), ErrorEvent> {
    let rows = dataset.row_count();
    if rows >= min {
        return Ok(());
    }
    Err(ErrorEvent::new(
        ErrorKind::InsufficientData,
        format!("At least {} rows required, found {}", min, rows),
    )
    .context("rows", rows)
    .context("required", min))
}

/// Reads a numeric parameter, falling back to `default` when absent.
///
/// Fails with `InvalidParameter` when present but not a number or outside
/// `range`.
pub fn require_param_in_range(
    params: &Params,
    key: &str,
    range: RangeInclusive<f64>,
    default: f64,
) -> Result<f64, ErrorEvent> {
    let value = match params.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(value) => value,
    };

    let number = value.as_f64().ok_or_else(|| {
        ErrorEvent::new(
            ErrorKind::InvalidParameter,
            format!("Parameter '{}' must be a number", key),
        )
        .context("parameter", key)
        .context("value", value)
    })?;

    if !range.contains(&number) {
        return Err(ErrorEvent::new(
            ErrorKind::InvalidParameter,
            format!(
                "Parameter '{}' = {} is outside [{}, {}]",
                key,
                number,
                range.start(),
                range.end()
            ),
        )
        .context("parameter", key)
        .context("value", number));
    }

    Ok(number)
}

/// One warning per listed column that contains nulls
pub fn null_warnings(dataset: &Dataset, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .filter_map(|name| dataset.column(name))
        .filter(|column| column.null_count() > 0)
        .map(|column| {
            format!(
                "Column '{}' contains {} null values that were skipped",
                column.name,
                column.null_count()
            )
        })
        .collect()
}

/// A warning when the sample is usable but below `recommended` rows
pub fn small_sample_warning(dataset: &Dataset, recommended: usize) -> Option<String> {
    let rows = dataset.row_count();
    (rows < recommended).then(|| {
        format!(
            "Only {} rows available; results may be unstable below {}",
            rows, recommended
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset::new()
            .with_column("age", vec![json!(31), json!(null), json!(45)])
            .with_column("city", vec![json!("Oslo"), json!("Lima"), json!("Pune")])
    }

    #[test]
    fn test_require_numeric_rejects_text_column() {
        let err = require_numeric(&sample(), "city").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidType);
        assert!(err.message().contains("city"));
        assert_eq!(err.context_value("offending_value"), Some(&json!("Oslo")));
    }

    #[test]
    fn test_require_numeric_accepts_nulls() {
        let binding = sample();
        let column = require_numeric(&binding, "age").unwrap();
        assert_eq!(column.numeric_values(), vec![31.0, 45.0]);
    }

    #[test]
    fn test_missing_column() {
        let err = require_column(&sample(), "income").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingInput);
        assert_eq!(err.context_value("available"), Some(&json!(["age", "city"])));
    }

    #[test]
    fn test_min_rows() {
        assert!(require_min_rows(&sample(), 3).is_ok());
        let err = require_min_rows(&sample(), 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[test]
    fn test_param_range() {
        let mut params = Params::new();
        assert_eq!(require_param_in_range(&params, "alpha", 0.0..=1.0, 0.05).unwrap(), 0.05);

        params.insert("alpha".into(), json!(0.1));
        assert_eq!(require_param_in_range(&params, "alpha", 0.0..=1.0, 0.05).unwrap(), 0.1);

        params.insert("alpha".into(), json!(4));
        let err = require_param_in_range(&params, "alpha", 0.0..=1.0, 0.05).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        params.insert("alpha".into(), json!("small"));
        assert!(require_param_in_range(&params, "alpha", 0.0..=1.0, 0.05).is_err());
    }

    #[test]
    fn test_warnings() {
        let data = sample();
        assert_eq!(null_warnings(&data, &["age", "city", "missing"]).len(), 1);
        assert!(small_sample_warning(&data, 30).is_some());
        assert!(small_sample_warning(&data, 3).is_none());
    }

    #[test]
    fn test_with_column_replaces() {
        let data = sample().with_column("age", vec![json!(1)]);
        assert_eq!(data.columns().len(), 2);
        assert_eq!(data.column("age").map(Column::len), Some(1));
    }
}
