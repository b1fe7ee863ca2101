//! Shared aggregator under concurrent agents and trackers

use std::sync::Arc;
use std::thread;

use resilience_rs::{
    Agent, Computation, ComputeError, Context, ErrorEvent, ErrorIntelligence, ErrorKind, Params, Worker, WorkerSlot,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[test]
fn test_concurrent_tracking_loses_no_updates() {
    let intelligence = ErrorIntelligence::shared(None);

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let intelligence = Arc::clone(&intelligence);
            thread::spawn(move || {
                if i % 4 == 0 {
                    let event = ErrorEvent::new(ErrorKind::Timeout, "slow upstream");
                    intelligence.track_error("shared.entity", "op", &event, &Context::new("op"));
                } else {
                    intelligence.track_success("shared.entity", "op", &Context::new("op").quality(1.0));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let record = intelligence.snapshot("shared.entity").unwrap();
    assert_eq!(record.total_executions(), 100);
    assert_eq!(record.total_errors(), 25);
    assert_eq!(record.total_successes(), 75);
    assert_eq!(record.recent_quality_scores().len(), 100);
    assert_eq!(record.error_kind_histogram().get(&ErrorKind::Timeout), Some(&25));
}

#[test]
fn test_reports_never_observe_torn_records() {
    let intelligence = ErrorIntelligence::shared(None);

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let intelligence = Arc::clone(&intelligence);
            thread::spawn(move || {
                let entity = format!("writer.{}", w);
                for i in 0..200 {
                    if i % 2 == 0 {
                        intelligence.track_success(&entity, "op", &Context::new("op"));
                    } else {
                        let event = ErrorEvent::new(ErrorKind::ResourceExhaustion, "pool empty");
                        intelligence.track_error(&entity, "op", &event, &Context::new("op"));
                    }
                }
            })
        })
        .collect();

    for _ in 0..50 {
        let report = intelligence.report();
        for health in report.per_entity_health.values() {
            assert!(health.total_errors <= health.total_executions);
            assert!((0.0..=100.0).contains(&health.health));
        }
        assert!((0.0..=100.0).contains(&report.overall_health));
    }

    for writer in writers {
        writer.join().unwrap();
    }

    let report = intelligence.report();
    assert_eq!(report.total_executions, 8 * 200);
    assert_eq!(report.error_type_breakdown.get(&ErrorKind::ResourceExhaustion), Some(&(8 * 100)));
}

struct Echo(&'static str);

impl Worker<Vec<u32>> for Echo {
    fn name(&self) -> &str {
        self.0
    }

    fn compute(&self, input: &Vec<u32>, _params: &Params) -> Result<Computation, ComputeError> {
        Ok(Computation::new(json!(input.len())))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_share_one_aggregator() {
    let intelligence = ErrorIntelligence::shared(None);
    let mut tasks = Vec::new();

    for a in 0..10 {
        let intelligence = Arc::clone(&intelligence);
        tasks.push(tokio::spawn(async move {
            let agent = Agent::builder(format!("agent{}", a % 2))
                .worker(Echo("left"))
                .slot(WorkerSlot::new(Echo("right")).optional())
                .parallel()
                .intelligence(intelligence)
                .build()
                .unwrap();
            agent.run(Arc::new(vec![1, 2, 3]), &CancellationToken::new()).await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap();
        assert!(result.success);
        assert_eq!(result.payload("left"), Some(&json!(3)));
    }

    for entity in ["agent0", "agent0.left", "agent0.right", "agent1", "agent1.left", "agent1.right"] {
        assert_eq!(intelligence.snapshot(entity).unwrap().total_executions(), 5);
    }
    let report = intelligence.report();
    assert_eq!(report.overall_health, 100.0);
    assert_eq!(report.total_executions, 20);
}
