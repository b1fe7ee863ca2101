//! # Structured Logging
//!
//! Subscriber setup for binaries embedding the framework, and the passive
//! sink that records every [`ExecutionResult`] as a structured event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::result::ExecutionResult;
use crate::types::{Error, Result, Severity};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Flushes the file writer on drop; lives as long as the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Name of the embedding application; also the log file prefix
    pub service_name: String,
    /// Whether to also write logs to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let file_layer = file_writer(&config).map(|writer| fmt::layer().with_writer(writer).with_ansi(false));

    let registry = Registry::default().with(filter).with(file_layer);

    let installed = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(true);
        tracing::subscriber::set_global_default(registry.with(json_layer))
    } else {
        let text_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true);
        tracing::subscriber::set_global_default(registry.with(text_layer))
    };

    installed.map_err(|e| Error::Initialization(format!("Failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// The daily rolling file writer, if file output is configured. Only the
/// first writer is kept, since its guard is held for the rest of the process.
fn file_writer(config: &LoggingConfig) -> Option<NonBlocking> {
    let log_dir = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => log_dir,
        _ => return None,
    };

    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{}.log", config.service_name));
    let (writer, guard) = NonBlocking::new(appender);
    match FILE_GUARD.set(guard) {
        Ok(()) => Some(writer),
        Err(_) => {
            warn!(log_dir, "File logging already configured; ignoring second writer");
            None
        }
    }
}

/// Returns true once a subscriber has been installed by [`init_logging`]
pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

/// Logs `result` at the level its worst event calls for: `error` for
/// blocking events, `warn` for soft events or warnings, `debug` otherwise.
/// Never alters the result.
pub fn log_execution_result(entity: &str, result: &ExecutionResult) {
    let duration_ms = result.duration().as_millis() as u64;

    match result.worst_severity() {
        Some(severity) if severity.is_blocking() => {
            let first = result.first_blocking_error();
            error!(
                entity,
                operation = %result.operation_name(),
                success = result.is_success(),
                quality_score = result.quality_score(),
                attempts = result.attempts(),
                duration_ms,
                severity = %severity,
                error_kind = ?first.map(|e| e.kind().as_str()),
                message = ?first.map(|e| e.message()),
                suggestion = ?first.map(|e| e.advice()),
                error_count = result.errors().len(),
                "Execution failed"
            );
        }
        Some(Severity::Warning) | None if !result.warnings().is_empty() || !result.errors().is_empty() => {
            warn!(
                entity,
                operation = %result.operation_name(),
                quality_score = result.quality_score(),
                attempts = result.attempts(),
                duration_ms,
                warnings = ?result.warnings(),
                soft_errors = result.errors().len(),
                "Execution completed with warnings"
            );
        }
        _ => {
            debug!(
                entity,
                operation = %result.operation_name(),
                quality_score = result.quality_score(),
                attempts = result.attempts(),
                duration_ms,
                "Execution succeeded"
            );
        }
    }
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and selectively override from the provided config.
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }

        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::QualityPolicy;
    use crate::types::{ErrorEvent, ErrorKind};

    #[test]
    fn test_config_overrides_only_present_keys() {
        let cfg = config::Config::builder()
            .set_override("logging.level", "debug")
            .unwrap()
            .set_override("logging.json_format", false)
            .unwrap()
            .build()
            .unwrap();

        let logging = LoggingConfig::try_from(cfg).unwrap();
        assert_eq!(logging.level, "debug");
        assert!(!logging.json_format);
        assert_eq!(logging.service_name, "resilience");
        assert!(logging.log_dir.is_none());
    }

    #[test]
    fn test_file_writer_keeps_its_guard() {
        let disabled = LoggingConfig::default();
        assert!(file_writer(&disabled).is_none());

        let log_dir = std::env::temp_dir().join(format!("resilience-logs-{}", uuid::Uuid::new_v4()));
        let config = LoggingConfig {
            file_output: true,
            log_dir: Some(log_dir.to_string_lossy().into_owned()),
            ..LoggingConfig::default()
        };

        assert!(file_writer(&config).is_some());
        assert!(FILE_GUARD.get().is_some());
        assert!(file_writer(&config).is_none());

        let _ = std::fs::remove_dir_all(&log_dir);
    }

    #[test]
    fn test_log_execution_result_leaves_result_untouched() {
        let policy = QualityPolicy::default();
        let result = ExecutionResult::from_parts(
            "mean",
            Some(serde_json::json!(1.5)),
            vec![ErrorEvent::new(ErrorKind::InvalidRange, "clipped")],
            vec!["2 nulls".to_string()],
            &policy,
        );
        let before = serde_json::to_value(&result).unwrap();

        log_execution_result("stats.mean", &result);
        log_execution_result("stats.mean", &ExecutionResult::failure("mean", ErrorEvent::new(ErrorKind::Timeout, "slow")));
        log_execution_result("stats.mean", &ExecutionResult::success("mean", serde_json::json!(null)));

        assert_eq!(serde_json::to_value(&result).unwrap(), before);
    }
}
