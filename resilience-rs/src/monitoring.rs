//! Metrics emitted by the framework
//!
//! Only the `metrics` facade is used; installing an exporter is left to the
//! embedding application.

use metrics::{counter, gauge, histogram};

use crate::intelligence::HealthReport;
use crate::result::ExecutionResult;

/// Records one worker execution under `entity`
pub fn record_execution(entity: &str, result: &ExecutionResult) {
    let entity = entity.to_string();

    counter!("worker.executions", 1, "entity" => entity.clone());
    histogram!(
        "worker.duration_ms",
        result.duration().as_secs_f64() * 1000.0,
        "entity" => entity.clone()
    );
    histogram!("worker.quality_score", result.quality_score(), "entity" => entity.clone());

    for event in result.blocking_errors() {
        counter!(
            "worker.failures",
            1,
            "entity" => entity.clone(),
            "kind" => event.kind().as_str()
        );
    }
}

/// Publishes the gauges derived from a health report
pub fn record_health(report: &HealthReport) {
    gauge!("intelligence.overall_health", report.overall_health);
    for (entity, health) in &report.per_entity_health {
        gauge!("intelligence.entity_health", health.health, "entity" => entity.clone());
    }
}
