//! Test: execution history and stats on SQLite

use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;
use stepline::core::config::QueueConfig;
use stepline::core::StepOutcome::{Aborted, Failed, Succeeded};
use stepline::events::EventPublisher;
use stepline::execution::{ExecutionEngine, StatsStore};
use stepline::persistence::{ExecutionStore, SqliteExecutionStore};
use stepline::queue::{InMemoryDefinitions, PipelineJobWorker};
use stepline::trigger::{RunService, INTERRUPTED};
use stepline::{ExecutionStatus, PipelineError, QueueDispatcher};

struct SqliteEngine {
    engine: Arc<ExecutionEngine>,
    store: Arc<SqliteExecutionStore>,
}

async fn sqlite_engine() -> SqliteEngine {
    let calls = CallLog::default();
    let store = Arc::new(SqliteExecutionStore::new(":memory:").await.unwrap());
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(test_registry(&calls)),
        store.clone(),
        store.clone(),
        EventPublisher::new(64),
    ));
    SqliteEngine { engine, store }
}

#[tokio::test]
async fn test_audit_trail_survives_round_trip() {
    let s = sqlite_engine().await;
    let definition = pipeline(
        "audited",
        vec![append_step("a", 1), failing_step("b", 2).with_retries(1), append_step("c", 3)],
    );

    let result = s
        .engine
        .run(&definition, json!([{"id": 1}]), Some("dana".to_string()))
        .await
        .unwrap();
    assert_run_failed(&result);

    let record = s.store.get(result.execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.triggered_by.as_deref(), Some("dana"));
    assert_eq!(record.input_snapshot, json!([{"id": 1}]));
    assert_eq!(record.output_snapshot, Some(json!([{"id": 1}, {"step": "a"}])));
    assert_eq!(record.stats, result.stats);
    assert_eq!(record.error, result.error);
    assert_eq!(record.duration_ms, Some(result.duration_ms));
    assert_step_log(&record, "a", &[Succeeded]);
    assert_step_log(&record, "b", &[Failed, Failed, Aborted]);
    assert!(outcomes(&record, "c").is_empty());
}

#[tokio::test]
async fn test_history_newest_first_and_stats() {
    let s = sqlite_engine().await;
    let definition = pipeline("repeat", vec![append_step("a", 1)]);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(s.engine.run(&definition, json!([]), None).await.unwrap().execution_id);
    }

    let listed: Vec<_> = s
        .store
        .list("repeat")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    ids.reverse();
    assert_eq!(listed, ids);

    let stats = s.store.stats("repeat").await.unwrap();
    assert_eq!(stats.execution_count, 3);
    assert_eq!(stats.total_processed_rows, 3);
}

/// Records left `running` by a crash are failed on startup
#[tokio::test]
async fn test_reconcile_interrupted_runs() {
    let s = sqlite_engine().await;
    let stuck = s.store.create("crashy", None, json!([])).await.unwrap();

    let definitions = Arc::new(InMemoryDefinitions::new());
    let worker = PipelineJobWorker::new(s.engine.clone(), definitions.clone());
    let queue = QueueDispatcher::new(QueueConfig::default(), 1, Arc::new(worker));
    let service = RunService::new(s.engine.clone(), definitions, Arc::new(queue));

    let reconciled = service.reconcile_interrupted().await.unwrap();
    assert_eq!(reconciled, vec![stuck.id]);

    let record = service.get_execution(stuck.id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(INTERRUPTED));
    assert!(record.end_time.is_some());

    // Nothing left to do on a second pass
    assert!(service.reconcile_interrupted().await.unwrap().is_empty());

    let missing = service.get_execution(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, PipelineError::NotFound(_)));
}
