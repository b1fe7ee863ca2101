//! # Resilience Framework
//!
//! Fault-isolated execution of analysis workers, with classified errors,
//! quality-scored results, retry with cancellable backoff, and a shared
//! error intelligence aggregator that turns execution history into health
//! scores and recommendations.
//!
//! ## Features
//!
//! - A closed error taxonomy with severities and remediation hints
//! - A safe execution boundary that converts every failure, panics included,
//!   into an `ExecutionResult`
//! - Retry policies with exponential backoff over transient error kinds
//! - Per-entity health tracking, reports and failure pattern detection
//! - Agents that compose workers sequentially or in parallel
//! - Structured logging, metrics and layered configuration
//!

pub mod types;
pub mod context;
pub mod result;
pub mod dataset;
pub mod worker;
pub mod retry;
pub mod intelligence;
pub mod agent;
pub mod logging;
pub mod monitoring;
pub mod config;

use std::sync::Arc;

// Re-export commonly used types
pub use types::{Error, ErrorEvent, ErrorKind, Result, Severity};
pub use context::Context;
pub use result::{quality_for, ExecutionResult, QualityPolicy};
pub use dataset::{Column, Dataset};
pub use worker::{Classify, Computation, ComputeError, Params, SafeExecution, Worker};
pub use retry::{execute_with_retry, RetryConfig, RetryPolicy};
pub use intelligence::{EntityScope, ErrorIntelligence, HealthRecord, HealthReport, HealthStatus, IntelligenceConfig};
pub use agent::{Agent, AgentBuilder, AggregateResult, ExecutionMode, TaggedError, WorkerSlot};
pub use logging::{init_logging, log_execution_result, LoggingConfig};
pub use crate::config::FrameworkConfig;

/// Initializes logging with default settings and returns a fresh aggregator
pub fn init() -> Result<Arc<ErrorIntelligence>> {
    init_logging(None)?;
    Ok(ErrorIntelligence::shared(None))
}

/// Initializes the framework from loaded settings
pub fn init_with_config(config: &FrameworkConfig) -> Result<Arc<ErrorIntelligence>> {
    init_logging(Some(config.logging.clone()))?;
    Ok(ErrorIntelligence::shared(Some(config.intelligence.clone())))
}
