//! Test: per-pipeline rolling statistics

use crate::helpers::*;
use serde_json::json;
use stepline::core::PipelineStats;
use stepline::execution::StatsStore;

#[tokio::test]
async fn test_failed_runs_count_too() {
    let t = test_engine();
    let ok = pipeline("mixed", vec![append_step("a", 1)]);
    let broken = pipeline("mixed", vec![failing_step("b", 1)]);

    let first = t.engine.run(&ok, json!([{"id": 1}]), None).await.unwrap();
    let second = t.engine.run(&broken, json!([]), None).await.unwrap();
    assert_run_completed(&first);
    assert_run_failed(&second);

    let stats = t.stats.stats("mixed").await.unwrap();
    assert_eq!(stats.execution_count, 2);
    // Only the first run got past a step: [{"id": 1}, {"step": "a"}]
    assert_eq!(stats.total_processed_rows, 2);
    let mean = (first.duration_ms + second.duration_ms) as f64 / 2.0;
    assert!((stats.average_execution_time - mean).abs() < 1e-6);
}

/// Two runs of the same pipeline finishing together both count
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_update_stats_atomically() {
    let t = test_engine();
    let definition = pipeline(
        "concurrent",
        vec![slow_step("wait", 1, 50), append_step("a", 2)],
    );

    let (left, right) = tokio::join!(
        t.engine.run(&definition, json!([]), None),
        t.engine.run(&definition, json!([{"id": 1}]), None)
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_run_completed(&left);
    assert_run_completed(&right);
    assert_ne!(left.execution_id, right.execution_id);

    let stats = t.stats.stats("concurrent").await.unwrap();
    assert_eq!(stats.execution_count, 2);
    assert_eq!(stats.total_processed_rows, 2 + 3);
    let mean = (left.duration_ms + right.duration_ms) as f64 / 2.0;
    assert!((stats.average_execution_time - mean).abs() < 1e-6);
}

/// Many runs spawned at once never lose an increment
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_parallel_runs() {
    let t = test_engine();
    let definition = pipeline("burst", vec![append_step("a", 1)]);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = t.engine.clone();
            let definition = definition.clone();
            tokio::spawn(async move { engine.run(&definition, json!([]), None).await })
        })
        .collect();
    for handle in handles {
        assert_run_completed(&handle.await.unwrap().unwrap());
    }

    let stats = t.stats.stats("burst").await.unwrap();
    assert_eq!(stats.execution_count, 20);
    assert_eq!(stats.total_processed_rows, 20);
}

/// Stats already carried by the definition are continued, not restarted
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runs_continue_definition_stats() {
    let t = test_engine();
    let mut definition = pipeline("veteran", vec![slow_step("wait", 1, 20)]);
    definition.stats = PipelineStats {
        execution_count: 5,
        total_processed_rows: 50,
        average_execution_time: 1000.0,
    };

    let (left, right) = tokio::join!(
        t.engine.run(&definition, json!([]), None),
        t.engine.run(&definition, json!([]), None)
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_run_completed(&left);
    assert_run_completed(&right);

    let stats = t.stats.stats("veteran").await.unwrap();
    assert_eq!(stats.execution_count, 5 + 2);
    assert_eq!(stats.total_processed_rows, 50 + 2);
    let mean = (5000.0 + (left.duration_ms + right.duration_ms) as f64) / 7.0;
    assert!((stats.average_execution_time - mean).abs() < 1e-6);
}
