//! # Agents
//!
//! An [`Agent`] composes several [`Worker`]s into one analysis stage. Each
//! worker sits in a [`WorkerSlot`] that says whether it is required, how it
//! is retried and how long it may take. Every execution is reported to the
//! shared [`ErrorIntelligence`] under `"<agent>.<worker>"`, and the slot
//! results are merged, in declaration order, into an [`AggregateResult`]
//! that is itself reported under the agent's name.
//!
//! Worker code is synchronous and runs on tokio's blocking pool; the only
//! suspension points of a run are those blocking tasks and retry backoff.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::intelligence::ErrorIntelligence;
use crate::logging::log_execution_result;
use crate::monitoring;
use crate::result::{ExecutionResult, QualityPolicy};
use crate::retry::{execute_with_retry, RetryPolicy, STILL_RUNNING_KEY};
use crate::types::{Error, ErrorEvent, ErrorKind, Result, Severity};
use crate::worker::{panic_message, Params, SafeExecution, Worker};

/// How an agent schedules its workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One worker at a time, in declaration order
    #[default]
    Sequential,
    /// All workers at once; results are still merged in declaration order
    Parallel,
}

/// Health entity key for a worker inside an agent
pub fn entity_key(agent: &str, worker: &str) -> String {
    format!("{}.{}", agent, worker)
}

/// A worker plus its per-agent configuration
pub struct WorkerSlot<I: ?Sized> {
    worker: Arc<dyn Worker<I>>,
    required: bool,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    params: Params,
}

impl<I: ?Sized> WorkerSlot<I> {
    /// A required slot with no retry, no timeout and no parameters
    pub fn new<W>(worker: W) -> Self
    where
        W: Worker<I> + 'static,
    {
        Self::from_arc(Arc::new(worker))
    }

    pub fn from_arc(worker: Arc<dyn Worker<I>>) -> Self {
        Self {
            worker,
            required: true,
            retry: None,
            timeout: None,
            params: Params::new(),
        }
    }

    /// Marks the slot optional: its failure does not fail the run
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Budget for a single attempt; exceeding it yields a `Timeout` event.
    ///
    /// The worker itself cannot be interrupted and keeps running on the
    /// blocking pool, so a timed-out attempt is marked as still running and
    /// the slot's retry policy does not start another one.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn param<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

impl<I: ?Sized> fmt::Debug for WorkerSlot<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("worker", &self.worker.name())
            .field("required", &self.required)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("params", &self.params)
            .finish()
    }
}

/// An error event together with the worker that raised it
#[derive(Debug, Clone, Serialize)]
pub struct TaggedError {
    pub worker: String,
    pub event: ErrorEvent,
}

/// What happened to one slot during a run
#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub worker: String,
    pub required: bool,
    /// False when the run was cancelled before this worker started
    pub ran: bool,
    pub result: ExecutionResult,
}

/// The merged result of one agent run
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub agent: String,
    pub run_id: Uuid,
    /// True iff every required worker succeeded
    pub success: bool,
    pub overall_quality_score: f64,
    /// Worker name to payload, in declaration order
    pub merged_payload: serde_json::Map<String, serde_json::Value>,
    /// Every event raised during the run, in declaration order
    pub all_errors: Vec<TaggedError>,
    pub outcomes: Vec<WorkerOutcome>,
    /// At least one worker was skipped because the run was cancelled
    pub cancelled: bool,
    pub duration: Duration,
}

impl AggregateResult {
    pub fn outcome(&self, worker: &str) -> Option<&WorkerOutcome> {
        self.outcomes.iter().find(|o| o.worker == worker)
    }

    pub fn payload(&self, worker: &str) -> Option<&serde_json::Value> {
        self.merged_payload.get(worker)
    }

    /// Events with severity `Error` or above
    pub fn blocking_errors(&self) -> impl Iterator<Item = &TaggedError> {
        self.all_errors.iter().filter(|e| e.event.is_blocking())
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder<I: ?Sized> {
    name: String,
    slots: Vec<WorkerSlot<I>>,
    mode: ExecutionMode,
    intelligence: Option<Arc<ErrorIntelligence>>,
    quality: QualityPolicy,
}

impl<I: ?Sized> AgentBuilder<I> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            mode: ExecutionMode::default(),
            intelligence: None,
            quality: QualityPolicy::default(),
        }
    }

    pub fn slot(mut self, slot: WorkerSlot<I>) -> Self {
        self.slots.push(slot);
        self
    }

    /// Adds `worker` as a required slot with default settings
    pub fn worker<W>(self, worker: W) -> Self
    where
        W: Worker<I> + 'static,
    {
        self.slot(WorkerSlot::new(worker))
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn parallel(self) -> Self {
        self.mode(ExecutionMode::Parallel)
    }

    /// Shares an aggregator; a private one is created otherwise
    pub fn intelligence(mut self, intelligence: Arc<ErrorIntelligence>) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    pub fn quality_policy(mut self, policy: QualityPolicy) -> Self {
        self.quality = policy;
        self
    }

    /// Validates the configuration and registers the agent's and every
    /// worker's entity
    pub fn build(self) -> Result<Agent<I>> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidAgent("agent name must not be empty".to_string()));
        }
        if self.slots.is_empty() {
            return Err(Error::InvalidAgent(format!("agent '{}' has no workers", name)));
        }

        let mut seen = HashSet::new();
        for slot in &self.slots {
            let worker = slot.name();
            if worker.trim().is_empty() {
                return Err(Error::InvalidAgent(format!("agent '{}' has a worker with an empty name", name)));
            }
            if !seen.insert(worker) {
                return Err(Error::InvalidAgent(format!(
                    "agent '{}' declares worker '{}' more than once",
                    name, worker
                )));
            }
        }

        let intelligence = self.intelligence.unwrap_or_else(|| ErrorIntelligence::shared(None));
        intelligence.register_agent(&name);
        for slot in &self.slots {
            intelligence.register(&entity_key(&name, slot.name()));
        }

        debug!(agent = %name, workers = self.slots.len(), mode = ?self.mode, "Agent built");

        Ok(Agent {
            name,
            slots: self.slots,
            mode: self.mode,
            intelligence,
            quality: self.quality,
        })
    }
}

/// A configured stage of workers
pub struct Agent<I: ?Sized> {
    name: String,
    slots: Vec<WorkerSlot<I>>,
    mode: ExecutionMode,
    intelligence: Arc<ErrorIntelligence>,
    quality: QualityPolicy,
}

impl<I: ?Sized> fmt::Debug for Agent<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<I> Agent<I>
where
    I: ?Sized + Send + Sync + 'static,
{
    pub fn builder<S: Into<String>>(name: S) -> AgentBuilder<I> {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Worker names in declaration order
    pub fn workers(&self) -> Vec<&str> {
        self.slots.iter().map(WorkerSlot::name).collect()
    }

    pub fn intelligence(&self) -> &Arc<ErrorIntelligence> {
        &self.intelligence
    }

    /// Runs every worker against `input` and merges the results.
    ///
    /// Once `cancel` fires, pending retry waits abort and workers that have
    /// not started are recorded as cancelled instead of running.
    pub async fn run(&self, input: Arc<I>, cancel: &CancellationToken) -> AggregateResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("agent_run", agent = %self.name, run_id = %run_id, mode = ?self.mode);
        self.run_inner(input, cancel, run_id).instrument(span).await
    }

    async fn run_inner(&self, input: Arc<I>, cancel: &CancellationToken, run_id: Uuid) -> AggregateResult {
        let started = Instant::now();
        info!(workers = self.slots.len(), "Agent run started");

        let results: Vec<Option<ExecutionResult>> = match self.mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(self.slots.len());
                for slot in &self.slots {
                    if cancel.is_cancelled() {
                        results.push(None);
                    } else {
                        results.push(Some(self.execute_slot(slot, &input, cancel).await));
                    }
                }
                results
            }
            ExecutionMode::Parallel => {
                if cancel.is_cancelled() {
                    self.slots.iter().map(|_| None).collect()
                } else {
                    join_all(self.slots.iter().map(|slot| self.execute_slot(slot, &input, cancel)))
                        .await
                        .into_iter()
                        .map(Some)
                        .collect()
                }
            }
        };

        let outcomes: Vec<WorkerOutcome> = self
            .slots
            .iter()
            .zip(results)
            .map(|(slot, result)| {
                let (ran, result) = match result {
                    Some(result) => (true, result),
                    None => {
                        let skipped = not_run(slot.name());
                        if let Some(event) = skipped.first_blocking_error() {
                            self.intelligence
                                .track_cancelled(&entity_key(&self.name, slot.name()), event);
                        }
                        (false, skipped)
                    }
                };
                WorkerOutcome {
                    worker: slot.name().to_string(),
                    required: slot.required,
                    ran,
                    result,
                }
            })
            .collect();

        let aggregate = aggregate(&self.name, run_id, outcomes, started.elapsed());
        self.intelligence.track_aggregate(&aggregate);

        if aggregate.success {
            info!(
                quality = aggregate.overall_quality_score,
                errors = aggregate.all_errors.len(),
                cancelled = aggregate.cancelled,
                duration_ms = %aggregate.duration.as_millis(),
                "Agent run finished"
            );
        } else {
            warn!(
                quality = aggregate.overall_quality_score,
                errors = aggregate.all_errors.len(),
                cancelled = aggregate.cancelled,
                duration_ms = %aggregate.duration.as_millis(),
                "Agent run failed"
            );
        }

        aggregate
    }

    async fn execute_slot(&self, slot: &WorkerSlot<I>, input: &Arc<I>, cancel: &CancellationToken) -> ExecutionResult {
        let quality = self.quality;
        let attempt = || {
            run_attempt(
                Arc::clone(&slot.worker),
                Arc::clone(input),
                slot.params.clone(),
                quality,
                slot.timeout,
            )
        };

        let result = match &slot.retry {
            Some(policy) => execute_with_retry(attempt, policy, cancel).await,
            None => attempt().await,
        };

        let entity = entity_key(&self.name, slot.name());
        self.intelligence.track_result(&entity, &result);
        log_execution_result(&entity, &result);
        monitoring::record_execution(&entity, &result);

        result
    }
}

/// One attempt of one worker on the blocking pool, bounded by `limit`
async fn run_attempt<I>(
    worker: Arc<dyn Worker<I>>,
    input: Arc<I>,
    params: Params,
    quality: QualityPolicy,
    limit: Option<Duration>,
) -> ExecutionResult
where
    I: ?Sized + Send + Sync + 'static,
{
    let name = worker.name().to_string();
    let started = Instant::now();
    let handle = tokio::task::spawn_blocking(move || worker.safe_execute_with(&*input, &params, &quality));

    let joined = match limit {
        None => handle.await,
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            // The blocking task cannot be interrupted; its result is discarded.
            Err(_) => {
                let event = ErrorEvent::new(
                    ErrorKind::Timeout,
                    format!("Worker '{}' exceeded its time budget of {} ms", name, limit.as_millis()),
                )
                .context("timeout_ms", limit.as_millis() as u64)
                .context(STILL_RUNNING_KEY, true);
                return ExecutionResult::failure(name, event).with_duration(started.elapsed());
            }
        },
    };

    match joined {
        Ok(result) => result,
        Err(join_error) => {
            let detail = if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                "blocking task was cancelled".to_string()
            };
            let event = ErrorEvent::new(ErrorKind::Unknown, format!("Worker '{}' aborted: {}", name, detail))
                .severity(Severity::Critical)
                .context("stage", "join");
            ExecutionResult::failure(name, event).with_duration(started.elapsed())
        }
    }
}

fn not_run(worker: &str) -> ExecutionResult {
    ExecutionResult::failure(
        worker,
        ErrorEvent::new(
            ErrorKind::Timeout,
            format!("Worker '{}' did not run: the agent run was cancelled", worker),
        )
        .context("cancelled", true),
    )
}

fn aggregate(agent: &str, run_id: Uuid, outcomes: Vec<WorkerOutcome>, duration: Duration) -> AggregateResult {
    let success = outcomes
        .iter()
        .filter(|o| o.required)
        .all(|o| o.result.is_success());

    let participating: Vec<f64> = outcomes
        .iter()
        .filter(|o| o.ran)
        .map(|o| o.result.quality_score())
        .collect();
    let mean = if participating.is_empty() {
        0.0
    } else {
        participating.iter().sum::<f64>() / participating.len() as f64
    };
    let required_floor = outcomes
        .iter()
        .filter(|o| o.required && !o.result.is_success())
        .map(|o| o.result.quality_score())
        .fold(None, |lowest: Option<f64>, score| Some(lowest.map_or(score, |l| l.min(score))));
    // A failed required worker pins the score to its own quality.
    let overall_quality_score = required_floor.unwrap_or(mean);

    let mut merged_payload = serde_json::Map::new();
    let mut all_errors = Vec::new();
    for outcome in &outcomes {
        if let Some(payload) = outcome.result.payload() {
            merged_payload.insert(outcome.worker.clone(), payload.clone());
        }
        all_errors.extend(outcome.result.errors().iter().map(|event| TaggedError {
            worker: outcome.worker.clone(),
            event: event.clone(),
        }));
    }

    AggregateResult {
        agent: agent.to_string(),
        run_id,
        success,
        overall_quality_score,
        merged_payload,
        all_errors,
        cancelled: outcomes.iter().any(|o| !o.ran),
        outcomes,
        duration,
    }
}
