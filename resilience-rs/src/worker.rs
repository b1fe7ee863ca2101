//! # Workers and the Safe Execution Boundary
//!
//! A [`Worker`] is a single-responsibility computation with a `validate`
//! step and a `compute` step. Callers never invoke those directly: they go
//! through [`SafeExecution::safe_execute`], which turns every outcome,
//! including panics, into an [`ExecutionResult`].

use std::any::Any;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::result::{ExecutionResult, QualityPolicy};
use crate::types::{ErrorEvent, ErrorKind, Severity};

/// Named parameters passed to a worker alongside its input
pub type Params = serde_json::Map<String, serde_json::Value>;

/// What a successful `compute` hands back: the payload plus anything
/// non-fatal noticed along the way
#[derive(Debug, Clone, Default)]
pub struct Computation {
    payload: serde_json::Value,
    warnings: Vec<String>,
    events: Vec<ErrorEvent>,
}

impl Computation {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            warnings: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Adds a warning (e.g. detected nulls, a borderline sample size)
    pub fn warn<S: Into<String>>(mut self, warning: S) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Adds several warnings at once
    pub fn warnings<I, S>(mut self, warnings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warnings.extend(warnings.into_iter().map(Into::into));
        self
    }

    /// Attaches a classified event; blocking events fail the execution while
    /// keeping the payload
    pub fn event(mut self, event: ErrorEvent) -> Self {
        self.events.push(event);
        self
    }

    fn into_parts(self) -> (serde_json::Value, Vec<String>, Vec<ErrorEvent>) {
        (self.payload, self.warnings, self.events)
    }
}

/// Failure signal returned by `compute`
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid type: {0}")]
    InvalidType(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Value out of range: {0}")]
    InvalidRange(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Computation failed: {0}")]
    Computation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// A failure the worker already classified itself
    #[error("{0}")]
    Event(ErrorEvent),

    /// Anything else; classified by inspecting the error chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComputeError {
    /// The nearest error kind for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComputeError::MissingInput(_) => ErrorKind::MissingInput,
            ComputeError::InvalidType(_) => ErrorKind::InvalidType,
            ComputeError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ComputeError::InvalidRange(_) => ErrorKind::InvalidRange,
            ComputeError::InsufficientData(_) => ErrorKind::InsufficientData,
            ComputeError::Computation(_) => ErrorKind::ComputationFailure,
            ComputeError::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
            ComputeError::Timeout(_) => ErrorKind::Timeout,
            ComputeError::Event(event) => event.kind(),
            ComputeError::Other(err) => classify_chain(err.chain()),
        }
    }

    /// Converts the failure into an event
    pub fn into_event(self) -> ErrorEvent {
        let kind = self.kind();
        match self {
            ComputeError::Event(event) => event,
            ComputeError::Other(err) => {
                let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
                let event = ErrorEvent::new(kind, err.to_string());
                if causes.is_empty() {
                    event
                } else {
                    event.context("causes", causes)
                }
            }
            ComputeError::MissingInput(message)
            | ComputeError::InvalidType(message)
            | ComputeError::InvalidParameter(message)
            | ComputeError::InvalidRange(message)
            | ComputeError::InsufficientData(message)
            | ComputeError::Computation(message)
            | ComputeError::ResourceExhausted(message)
            | ComputeError::Timeout(message) => ErrorEvent::new(kind, message),
        }
    }
}

impl From<ErrorEvent> for ComputeError {
    fn from(event: ErrorEvent) -> Self {
        ComputeError::Event(event)
    }
}

/// Maps well-known std error types found in a chain onto an error kind
fn classify_chain<'a>(chain: impl Iterator<Item = &'a (dyn StdError + 'static)>) -> ErrorKind {
    for cause in chain {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::Timeout,
                std::io::ErrorKind::OutOfMemory => ErrorKind::ResourceExhaustion,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof => ErrorKind::MissingInput,
                std::io::ErrorKind::InvalidData => ErrorKind::InvalidType,
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidParameter,
                _ => ErrorKind::Unknown,
            };
        }
        if cause.is::<std::num::ParseFloatError>()
            || cause.is::<std::num::ParseIntError>()
            || cause.is::<serde_json::Error>()
        {
            return ErrorKind::InvalidType;
        }
        if cause.is::<std::num::TryFromIntError>() {
            return ErrorKind::InvalidRange;
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return ErrorKind::Timeout;
        }
    }
    ErrorKind::Unknown
}

/// Classifies foreign errors inside `compute`
pub trait Classify<T> {
    /// Tags the error with `kind`
    fn classify(self, kind: ErrorKind) -> Result<T, ComputeError>;
}

impl<T, E> Classify<T> for std::result::Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn classify(self, kind: ErrorKind) -> Result<T, ComputeError> {
        self.map_err(|err| ComputeError::Event(ErrorEvent::new(kind, err.to_string())))
    }
}

/// A single-responsibility unit of computation
///
/// Implementations are registered with an agent by name and shared across
/// threads, so they hold no per-call state.
pub trait Worker<I: ?Sized>: Send + Sync {
    /// Stable name; used as the operation name and in health entity keys
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Rejects unusable input before any computation happens
    fn validate(&self, _input: &I, _params: &Params) -> Option<ErrorEvent> {
        None
    }

    fn compute(&self, input: &I, params: &Params) -> Result<Computation, ComputeError>;
}

/// The only way to run a worker. Implemented for every [`Worker`], so the
/// boundary cannot be overridden.
pub trait SafeExecution<I: ?Sized> {
    /// Runs the worker with the default quality policy
    fn safe_execute(&self, input: &I, params: &Params) -> ExecutionResult;

    /// Runs the worker, scoring quality with `policy`
    fn safe_execute_with(&self, input: &I, params: &Params, policy: &QualityPolicy) -> ExecutionResult;
}

impl<I, W> SafeExecution<I> for W
where
    I: ?Sized,
    W: Worker<I> + ?Sized,
{
    fn safe_execute(&self, input: &I, params: &Params) -> ExecutionResult {
        self.safe_execute_with(input, params, &QualityPolicy::default())
    }

    fn safe_execute_with(&self, input: &I, params: &Params, policy: &QualityPolicy) -> ExecutionResult {
        let started = Instant::now();
        let name = self.name().to_string();

        match panic::catch_unwind(AssertUnwindSafe(|| self.validate(input, params))) {
            Ok(None) => {}
            Ok(Some(event)) => {
                return ExecutionResult::failure(name, event.at_least(Severity::Error))
                    .with_duration(started.elapsed());
            }
            Err(panic) => {
                return ExecutionResult::failure(name.clone(), panic_event(&name, "validate", panic))
                    .with_duration(started.elapsed());
            }
        }

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.compute(input, params))) {
            Ok(Ok(computation)) => {
                let (payload, warnings, events) = computation.into_parts();
                ExecutionResult::from_parts(name, Some(payload), events, warnings, policy)
            }
            Ok(Err(err)) => ExecutionResult::failure(name, err.into_event()),
            Err(panic) => ExecutionResult::failure(name.clone(), panic_event(&name, "compute", panic)),
        };

        result.with_duration(started.elapsed())
    }
}

fn panic_event(worker: &str, stage: &str, panic: Box<dyn Any + Send>) -> ErrorEvent {
    let detail = panic_message(panic.as_ref());
    ErrorEvent::new(
        ErrorKind::Unknown,
        format!("Worker '{}' panicked during {}: {}", worker, stage, detail),
    )
    .severity(Severity::Critical)
    .context("panic", true)
    .context("stage", stage)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
