//! # Error Intelligence
//!
//! The system of record for reliability signals. Every execution outcome is
//! folded into a per-entity [`HealthRecord`]; on demand the records are
//! turned into health scores, a system-wide [`HealthReport`] and recurring
//! failure patterns.
//!
//! Health of an entity is
//! `100 * (w_s * success_rate + w_q * mean(recent_quality_scores)) / (w_s + w_q)`
//! with the reference weights `w_s = 0.7`, `w_q = 0.3`. Overall health is the
//! execution-count-weighted mean of entity health over entities that have
//! executed at least once, and 100 while nothing has executed (the report
//! status is then `Unknown`, which never passes a gate).
//!
//! Agents report their merged runs under their own name with
//! [`EntityScope::Agent`]. Those records appear in reports and
//! recommendations but stay out of the overall health, the execution total
//! and the error breakdown, which already count every worker execution.
//!
//! Nothing here fails: unknown entities get a fresh record on first use.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AggregateResult;
use crate::context::Context;
use crate::monitoring;
use crate::result::ExecutionResult;
use crate::types::{ErrorEvent, ErrorKind, Severity};

/// Relative weight of success rate and recent quality in an entity's health
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub success_weight: f64,
    pub quality_weight: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            quality_weight: 0.3,
        }
    }
}

/// Configuration for the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntelligenceConfig {
    /// Capacity of each entity's quality score ring buffer
    pub quality_window: usize,
    /// Capacity of each entity's outcome log used for pattern detection
    pub outcome_window: usize,
    /// Consecutive same-kind failures that make a pattern recurring
    pub pattern_threshold: usize,
    /// Weights of the health formula
    pub weights: HealthWeights,
    /// Share of an entity's errors a single kind needs to be called dominant
    pub dominant_kind_ratio: f64,
    /// Overall health below which the lowest entities are called out
    pub attention_threshold: f64,
    /// Health at or above which an entity is considered healthy
    pub healthy_threshold: f64,
    /// How many of the lowest-health entities a recommendation names
    pub lowest_entities_listed: usize,
    /// Whether to record metrics
    pub record_metrics: bool,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            quality_window: 100,
            outcome_window: 100,
            pattern_threshold: 3,
            weights: HealthWeights::default(),
            dominant_kind_ratio: 0.5,
            attention_threshold: 70.0,
            healthy_threshold: 90.0,
            lowest_entities_listed: 3,
            record_metrics: true,
        }
    }
}

/// Health classification of an entity or of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// At or above the healthy threshold
    Healthy,
    /// Between the attention and healthy thresholds
    Degraded,
    /// Below the attention threshold
    Unhealthy,
    /// Nothing has executed yet
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// What an entity's record aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityScope {
    /// Executions of a single worker
    #[default]
    Worker,
    /// Merged runs of a whole agent
    Agent,
}

/// One entry of an entity's outcome log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { kind: ErrorKind, operation: String },
}

/// Rolling aggregate for one entity
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    scope: EntityScope,
    total_executions: u64,
    total_successes: u64,
    total_errors: u64,
    recovered_executions: u64,
    cancelled_executions: u64,
    error_kind_histogram: BTreeMap<ErrorKind, u64>,
    recent_quality_scores: VecDeque<f64>,
    recent_outcomes: VecDeque<Outcome>,
    last_updated: DateTime<Utc>,
    #[serde(skip)]
    quality_capacity: usize,
    #[serde(skip)]
    outcome_capacity: usize,
}

impl HealthRecord {
    fn new(config: &IntelligenceConfig, scope: EntityScope) -> Self {
        let quality_capacity = config.quality_window.max(1);
        let outcome_capacity = config.outcome_window.max(1);
        Self {
            scope,
            total_executions: 0,
            total_successes: 0,
            total_errors: 0,
            recovered_executions: 0,
            cancelled_executions: 0,
            error_kind_histogram: BTreeMap::new(),
            recent_quality_scores: VecDeque::with_capacity(quality_capacity),
            recent_outcomes: VecDeque::with_capacity(outcome_capacity),
            last_updated: Utc::now(),
            quality_capacity,
            outcome_capacity,
        }
    }

    fn record_success(&mut self, quality: f64, attempts: u32) {
        self.total_executions += 1;
        self.total_successes += 1;
        if attempts > 1 {
            self.recovered_executions += 1;
        }
        self.push_quality(quality);
        self.push_outcome(Outcome::Success);
        self.last_updated = Utc::now();
    }

    /// One failed execution; every kind lands in the histogram and the
    /// first one in the outcome log
    fn record_failure(&mut self, kinds: &[ErrorKind], operation: &str, quality: f64) {
        self.total_executions += 1;
        self.total_errors += 1;
        for kind in kinds {
            *self.error_kind_histogram.entry(*kind).or_insert(0) += 1;
        }
        self.push_quality(quality);
        self.push_outcome(Outcome::Failure {
            kind: kinds.first().copied().unwrap_or(ErrorKind::Unknown),
            operation: operation.to_string(),
        });
        self.last_updated = Utc::now();
    }

    /// A scheduled execution that never started
    fn record_cancelled(&mut self, kind: ErrorKind) {
        self.cancelled_executions += 1;
        *self.error_kind_histogram.entry(kind).or_insert(0) += 1;
        self.last_updated = Utc::now();
    }

    fn push_quality(&mut self, quality: f64) {
        if self.recent_quality_scores.len() >= self.quality_capacity {
            self.recent_quality_scores.pop_front();
        }
        self.recent_quality_scores.push_back(quality);
    }

    fn push_outcome(&mut self, outcome: Outcome) {
        if self.recent_outcomes.len() >= self.outcome_capacity {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(outcome);
    }

    pub fn scope(&self) -> EntityScope {
        self.scope
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    /// Executions that succeeded only after a retry
    pub fn recovered_executions(&self) -> u64 {
        self.recovered_executions
    }

    /// Scheduled executions skipped because their run was cancelled
    pub fn cancelled_executions(&self) -> u64 {
        self.cancelled_executions
    }

    pub fn error_kind_histogram(&self) -> &BTreeMap<ErrorKind, u64> {
        &self.error_kind_histogram
    }

    pub fn recent_quality_scores(&self) -> &VecDeque<f64> {
        &self.recent_quality_scores
    }

    pub fn recent_outcomes(&self) -> &VecDeque<Outcome> {
        &self.recent_outcomes
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Successes over executions; 0 when nothing has executed
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_successes as f64 / self.total_executions as f64
        }
    }

    /// Mean of the quality ring buffer; 0 when it is empty
    pub fn mean_quality(&self) -> f64 {
        if self.recent_quality_scores.is_empty() {
            0.0
        } else {
            self.recent_quality_scores.iter().sum::<f64>() / self.recent_quality_scores.len() as f64
        }
    }

    /// Health in [0, 100] under `weights`; 0 for an untested entity
    pub fn health(&self, weights: &HealthWeights) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        let success_weight = weights.success_weight.max(0.0);
        let quality_weight = weights.quality_weight.max(0.0);
        let total_weight = success_weight + quality_weight;
        if total_weight.is_nan() || total_weight <= 0.0 {
            return 100.0 * self.success_rate();
        }
        let blended = success_weight * self.success_rate() + quality_weight * self.mean_quality();
        (100.0 * blended / total_weight).clamp(0.0, 100.0)
    }

    /// The most frequent error kind and its count
    pub fn dominant_error(&self) -> Option<(ErrorKind, u64)> {
        self.error_kind_histogram
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, count)| (*kind, *count))
    }
}

/// Whether a failure kind keeps coming back or shows up in isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePattern {
    /// At least `pattern_threshold` consecutive failures of this kind
    Recurring,
    /// Only shorter runs; likely transient noise
    Sporadic,
}

/// A failure pattern observed in an entity's recent outcomes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternFinding {
    pub entity: String,
    pub kind: ErrorKind,
    pub pattern: FailurePattern,
    /// Failures of this kind in the outcome log
    pub occurrences: usize,
    /// Longest run of consecutive failures of this kind
    pub longest_run: usize,
    /// The outcome log currently ends inside a run of this kind
    pub ongoing: bool,
    /// Operations that produced these failures
    pub operations: Vec<String>,
}

/// Urgency of a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub message: String,
}

/// Health of one entity as captured in a report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHealth {
    pub scope: EntityScope,
    pub health: f64,
    pub status: HealthStatus,
    pub total_executions: u64,
    pub total_errors: u64,
    pub cancelled_executions: u64,
    pub success_rate: f64,
    pub mean_quality: f64,
}

/// Point-in-time snapshot of system health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_health: f64,
    pub status: HealthStatus,
    pub total_executions: u64,
    pub per_entity_health: BTreeMap<String, EntityHealth>,
    pub error_type_breakdown: BTreeMap<ErrorKind, u64>,
    pub untested_entities: Vec<String>,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// True when something executed and overall health reaches `threshold`
    pub fn passes_gate(&self, threshold: f64) -> bool {
        self.status != HealthStatus::Unknown && self.overall_health >= threshold
    }

    /// The `n` executed workers with the lowest health, lowest first
    pub fn lowest(&self, n: usize) -> Vec<(&str, f64)> {
        let mut executed: Vec<(&str, f64)> = self
            .per_entity_health
            .iter()
            .filter(|(_, entity)| entity.scope == EntityScope::Worker && entity.total_executions > 0)
            .map(|(name, entity)| (name.as_str(), entity.health))
            .collect();
        executed.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        executed.truncate(n);
        executed
    }
}

/// Aggregates execution outcomes into health signals
///
/// Shared as `Arc<ErrorIntelligence>`; every method takes `&self` and is
/// safe to call concurrently. Updates to one entity are applied atomically.
#[derive(Debug, Default)]
pub struct ErrorIntelligence {
    config: IntelligenceConfig,
    records: DashMap<String, HealthRecord>,
}

impl ErrorIntelligence {
    pub fn new(config: Option<IntelligenceConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            records: DashMap::new(),
        }
    }

    /// Convenience constructor returning the shared handle
    pub fn shared(config: Option<IntelligenceConfig>) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &IntelligenceConfig {
        &self.config
    }

    /// Ensures `entity` has a record, so it appears in reports even before it
    /// executes
    pub fn register(&self, entity: &str) {
        self.records
            .entry(entity.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Worker));
    }

    /// Like [`register`](Self::register) for an agent's own record
    pub fn register_agent(&self, agent: &str) {
        self.records
            .entry(agent.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Agent));
    }

    /// Records a successful execution. The quality score is read from the
    /// context (default 1.0).
    pub fn track_success(&self, entity: &str, operation: &str, context: &Context) {
        let quality = context.quality_score().unwrap_or(1.0);
        let attempts = context.attempt_count().unwrap_or(1);

        self.records
            .entry(entity.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Worker))
            .record_success(quality, attempts);

        if self.config.record_metrics {
            counter!("intelligence.tracked", 1, "outcome" => "success");
        }
        debug!(entity, operation, quality, attempts, context = %context, "Tracked success");
    }

    /// Records a failed execution. The degraded quality score is read from
    /// the context (default 0.0).
    pub fn track_error(&self, entity: &str, operation: &str, error: &ErrorEvent, context: &Context) {
        self.track_failure(entity, operation, std::slice::from_ref(error), context);
    }

    /// Records one failed execution raising several blocking events. Every
    /// event's kind is counted; the first one drives pattern detection.
    pub fn track_failure(&self, entity: &str, operation: &str, errors: &[ErrorEvent], context: &Context) {
        let quality = context.quality_score().unwrap_or(0.0);
        let mut kinds: Vec<ErrorKind> = errors.iter().map(ErrorEvent::kind).collect();
        if kinds.is_empty() {
            kinds.push(ErrorKind::Unknown);
        }

        self.records
            .entry(entity.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Worker))
            .record_failure(&kinds, operation, quality);

        if self.config.record_metrics {
            for kind in &kinds {
                counter!("intelligence.tracked", 1, "outcome" => "error", "kind" => kind.as_str());
            }
        }
        for error in errors {
            debug!(
                entity,
                operation,
                error_kind = %error.kind(),
                severity = %error.level(),
                message = %error.message(),
                context = %context,
                "Tracked error"
            );
        }
    }

    /// Records a scheduled execution of `entity` that never started because
    /// its run was cancelled. It counts towards the error breakdown only.
    pub fn track_cancelled(&self, entity: &str, event: &ErrorEvent) {
        self.records
            .entry(entity.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Worker))
            .record_cancelled(event.kind());

        if self.config.record_metrics {
            counter!("intelligence.tracked", 1, "outcome" => "cancelled", "kind" => event.kind().as_str());
        }
        debug!(entity, error_kind = %event.kind(), message = %event.message(), "Tracked cancellation");
    }

    /// Folds a complete execution result into `entity`'s record
    pub fn track_result(&self, entity: &str, result: &ExecutionResult) {
        let context = Context::new(result.operation_name())
            .quality(result.quality_score())
            .attempts(result.attempts());

        if result.is_success() {
            self.track_success(entity, result.operation_name(), &context);
            return;
        }

        let blocking: Vec<ErrorEvent> = result.blocking_errors().cloned().collect();
        if blocking.is_empty() {
            let event = ErrorEvent::new(ErrorKind::Unknown, "Execution failed without a recorded error")
                .severity(Severity::Critical);
            self.track_error(entity, result.operation_name(), &event, &context);
        } else {
            self.track_failure(entity, result.operation_name(), &blocking, &context);
        }
    }

    /// Folds a merged agent run into the agent's own record. A failed run
    /// counts the blocking events of its failed required workers.
    pub fn track_aggregate(&self, aggregate: &AggregateResult) {
        let operation = "run";
        let context = Context::new(operation)
            .add("run_id", aggregate.run_id.to_string())
            .quality(aggregate.overall_quality_score);
        let mut record = self
            .records
            .entry(aggregate.agent.clone())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Agent));

        if aggregate.success {
            record.record_success(aggregate.overall_quality_score, 1);
            drop(record);
            debug!(agent = %aggregate.agent, context = %context, "Tracked agent run");
            return;
        }

        let mut kinds: Vec<ErrorKind> = aggregate
            .outcomes
            .iter()
            .filter(|outcome| outcome.required && !outcome.result.is_success())
            .flat_map(|outcome| outcome.result.blocking_errors().map(ErrorEvent::kind))
            .collect();
        if kinds.is_empty() {
            kinds.push(ErrorKind::Unknown);
        }
        record.record_failure(&kinds, operation, aggregate.overall_quality_score);
        drop(record);

        if self.config.record_metrics {
            counter!("intelligence.tracked", 1, "outcome" => "agent_failure", "kind" => kinds[0].as_str());
        }
        debug!(agent = %aggregate.agent, kinds = ?kinds, context = %context, "Tracked failed agent run");
    }

    /// Health of `entity` in [0, 100]; creates an empty record if needed
    pub fn health_for(&self, entity: &str) -> f64 {
        self.records
            .entry(entity.to_string())
            .or_insert_with(|| HealthRecord::new(&self.config, EntityScope::Worker))
            .health(&self.config.weights)
    }

    fn status_for(&self, health: f64, executions: u64) -> HealthStatus {
        if executions == 0 {
            HealthStatus::Unknown
        } else if health >= self.config.healthy_threshold {
            HealthStatus::Healthy
        } else if health >= self.config.attention_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// A consistent copy of `entity`'s record
    pub fn snapshot(&self, entity: &str) -> Option<HealthRecord> {
        self.records.get(entity).map(|record| record.value().clone())
    }

    /// Tracked entity names, sorted
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Drops every record
    pub fn reset(&self) {
        self.records.clear();
        info!("Error intelligence reset");
    }

    /// Drops one entity's record; returns whether it existed
    pub fn reset_entity(&self, entity: &str) -> bool {
        self.records.remove(entity).is_some()
    }

    /// Finds recurring and sporadic failure kinds in `entity`'s outcome log
    pub fn pattern_detect(&self, entity: &str) -> Vec<PatternFinding> {
        match self.snapshot(entity) {
            Some(record) => detect_patterns(entity, &record, self.config.pattern_threshold.max(1)),
            None => Vec::new(),
        }
    }

    /// Builds a health report over every tracked entity
    pub fn report(&self) -> HealthReport {
        let snapshots: BTreeMap<String, HealthRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let weights = &self.config.weights;
        let mut per_entity_health = BTreeMap::new();
        let mut error_type_breakdown: BTreeMap<ErrorKind, u64> = BTreeMap::new();
        let mut untested_entities = Vec::new();
        let mut weighted_sum = 0.0;
        let mut total_executions = 0u64;

        for (entity, record) in &snapshots {
            let health = record.health(weights);
            let executions = record.total_executions();

            if executions == 0 {
                untested_entities.push(entity.clone());
            }

            if record.scope() == EntityScope::Worker {
                weighted_sum += health * executions as f64;
                total_executions += executions;
                for (kind, count) in record.error_kind_histogram() {
                    *error_type_breakdown.entry(*kind).or_insert(0) += count;
                }
            }

            per_entity_health.insert(
                entity.clone(),
                EntityHealth {
                    scope: record.scope(),
                    health,
                    status: self.status_for(health, executions),
                    total_executions: executions,
                    total_errors: record.total_errors(),
                    cancelled_executions: record.cancelled_executions(),
                    success_rate: record.success_rate(),
                    mean_quality: record.mean_quality(),
                },
            );
        }

        let overall_health = if total_executions == 0 {
            100.0
        } else {
            (weighted_sum / total_executions as f64).clamp(0.0, 100.0)
        };

        let mut report = HealthReport {
            overall_health,
            status: self.status_for(overall_health, total_executions),
            total_executions,
            per_entity_health,
            error_type_breakdown,
            untested_entities,
            recommendations: Vec::new(),
            generated_at: Utc::now(),
        };
        report.recommendations = self.recommend(&snapshots, &report);

        if self.config.record_metrics {
            monitoring::record_health(&report);
        }
        info!(
            overall_health = report.overall_health,
            status = %report.status,
            entities = report.per_entity_health.len(),
            executions = report.total_executions,
            recommendations = report.recommendations.len(),
            "Health report generated"
        );

        report
    }

    fn recommend(&self, snapshots: &BTreeMap<String, HealthRecord>, report: &HealthReport) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        let threshold = self.config.pattern_threshold.max(1);

        for (entity, record) in snapshots {
            if record.total_executions() == 0 {
                recommendations.push(Recommendation {
                    priority: Priority::Low,
                    entity: Some(entity.clone()),
                    message: format!("{} is untested: no executions recorded", entity),
                });
                continue;
            }

            for finding in detect_patterns(entity, record, threshold) {
                if finding.pattern == FailurePattern::Recurring {
                    recommendations.push(Recommendation {
                        priority: Priority::High,
                        entity: Some(entity.clone()),
                        message: format!(
                            "{} shows a recurring {} failure pattern ({} consecutive); treat it as a systemic defect. {}",
                            entity,
                            finding.kind,
                            finding.longest_run,
                            finding.kind.default_suggestion()
                        ),
                    });
                }
            }

            if let Some((kind, count)) = record.dominant_error() {
                let recorded: u64 = record.error_kind_histogram().values().sum();
                let share = count as f64 / recorded.max(1) as f64;
                if share >= self.config.dominant_kind_ratio {
                    let priority = if kind.default_severity() == Severity::Critical {
                        Priority::High
                    } else {
                        Priority::Medium
                    };
                    recommendations.push(Recommendation {
                        priority,
                        entity: Some(entity.clone()),
                        message: format!(
                            "{}: {} of {} recorded errors are {}. {}",
                            entity,
                            count,
                            recorded,
                            kind,
                            kind.default_suggestion()
                        ),
                    });
                }
            }
        }

        if report.total_executions > 0 && report.overall_health < self.config.attention_threshold {
            let lowest = report
                .lowest(self.config.lowest_entities_listed.max(1))
                .into_iter()
                .map(|(name, health)| format!("{} ({:.1})", name, health))
                .collect::<Vec<_>>()
                .join(", ");
            recommendations.push(Recommendation {
                priority: Priority::High,
                entity: None,
                message: format!(
                    "Overall health {:.1} is below {:.0}; prioritize the lowest-health entities: {}",
                    report.overall_health, self.config.attention_threshold, lowest
                ),
            });
        }

        recommendations.sort_by_key(|r| r.priority);
        recommendations
    }
}

fn detect_patterns(entity: &str, record: &HealthRecord, threshold: usize) -> Vec<PatternFinding> {
    struct Tally {
        occurrences: usize,
        longest_run: usize,
        operations: BTreeSet<String>,
    }

    let mut tallies: BTreeMap<ErrorKind, Tally> = BTreeMap::new();
    let mut current: Option<(ErrorKind, usize)> = None;

    for outcome in record.recent_outcomes() {
        match outcome {
            Outcome::Success => current = None,
            Outcome::Failure { kind, operation } => {
                let run = match current {
                    Some((previous, run)) if previous == *kind => run + 1,
                    _ => 1,
                };
                current = Some((*kind, run));

                let tally = tallies.entry(*kind).or_insert_with(|| Tally {
                    occurrences: 0,
                    longest_run: 0,
                    operations: BTreeSet::new(),
                });
                tally.occurrences += 1;
                tally.longest_run = tally.longest_run.max(run);
                tally.operations.insert(operation.clone());
            }
        }
    }

    let mut findings: Vec<PatternFinding> = tallies
        .into_iter()
        .map(|(kind, tally)| PatternFinding {
            entity: entity.to_string(),
            kind,
            pattern: if tally.longest_run >= threshold {
                FailurePattern::Recurring
            } else {
                FailurePattern::Sporadic
            },
            occurrences: tally.occurrences,
            longest_run: tally.longest_run,
            ongoing: matches!(current, Some((k, _)) if k == kind),
            operations: tally.operations.into_iter().collect(),
        })
        .collect();

    findings.sort_by_key(|f| (f.pattern != FailurePattern::Recurring, f.kind));
    findings
}
