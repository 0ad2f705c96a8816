//! Test: steps run in ascending order, once each

use crate::helpers::*;
use serde_json::json;
use stepline::core::{StepOutcome, StepStatus};
use stepline::persistence::ExecutionStore;
use stepline::PipelineDefinition;

/// Declaration order is irrelevant; `order` decides
#[tokio::test]
async fn test_steps_run_in_order_once() {
    let t = test_engine();
    let pipeline = pipeline(
        "ordering",
        vec![append_step("c", 30), append_step("a", 10), append_step("b", 20)],
    );

    let result = t.engine.run(&pipeline, json!([]), None).await.unwrap();

    assert_run_completed(&result);
    assert_visit_order(&result, &["a", "b", "c"]);
    assert_eq!(t.calls.calls(), vec!["a", "b", "c"]);
    assert_eq!(result.stats.steps_completed, 3);
    assert_eq!(result.stats.records_processed, 3);
    assert_eq!(result.stats.progress, 100);
    assert!(result.errors.is_empty());
}

/// Each step sees the previous step's output
#[tokio::test]
async fn test_output_feeds_next_step() {
    let t = test_engine();
    let pipeline = pipeline("chain", vec![append_step("first", 1), append_step("second", 2)]);

    let result = t
        .engine
        .run(&pipeline, json!([{"id": 7}]), Some("alice".to_string()))
        .await
        .unwrap();

    assert_eq!(
        result.output,
        json!([{"id": 7}, {"step": "first"}, {"step": "second"}])
    );

    let record = t.store.get(result.execution_id).await.unwrap();
    assert_eq!(record.triggered_by.as_deref(), Some("alice"));
    assert_eq!(record.input_snapshot, json!([{"id": 7}]));
    assert_eq!(record.output_snapshot, Some(result.output.clone()));

    // The succeeded entry of each step carries that step's output
    let first = record
        .logs
        .iter()
        .find(|e| e.step_id == "first" && e.outcome == StepOutcome::Succeeded)
        .unwrap();
    assert_eq!(first.output, Some(json!([{"id": 7}, {"step": "first"}])));
}

/// Disabled steps are skipped and the payload passes through untouched
#[tokio::test]
async fn test_disabled_step_is_skipped() {
    let t = test_engine();
    let pipeline = pipeline(
        "disabled",
        vec![
            append_step("a", 1),
            append_step("off", 2).with_status(StepStatus::Disabled),
            append_step("c", 3),
        ],
    );

    let result = t.engine.run(&pipeline, json!([]), None).await.unwrap();

    assert_run_completed(&result);
    assert_visit_order(&result, &["a", "c"]);
    assert_eq!(t.calls.count("off"), 0);
    assert_eq!(result.stats.steps_skipped, 1);
    assert_eq!(result.stats.progress, 100);

    let record = t.store.get(result.execution_id).await.unwrap();
    assert_step_log(&record, "off", &[StepOutcome::Skipped]);
}

/// Steps flagged `error` by their owner still run
#[tokio::test]
async fn test_error_status_step_still_runs() {
    let t = test_engine();
    let pipeline = pipeline(
        "flagged",
        vec![append_step("flagged", 1).with_status(StepStatus::Error)],
    );

    let result = t.engine.run(&pipeline, json!([]), None).await.unwrap();

    assert_run_completed(&result);
    assert_visit_order(&result, &["flagged"]);
}

/// A YAML pipeline of built-in steps over real records
#[tokio::test]
async fn test_builtin_pipeline_from_yaml() {
    let yaml = r#"
id: "adults"
name: "Adult customers"
steps:
  - id: "sort"
    order: 3
    type: sort
    config:
      field: "age"
      descending: true
  - id: "adults"
    order: 1
    type: filter
    config:
      field: "age"
      operator: "gt"
      value: 17
  - id: "dedupe"
    order: 2
    type: deduplicate
    config:
      key_fields: ["email"]
"#;
    let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
    let input = json!([
        {"email": "a@example.com", "age": 30},
        {"email": "b@example.com", "age": 12},
        {"email": "c@example.com", "age": 45},
        {"email": "a@example.com", "age": 30}
    ]);

    let t = test_engine();
    let result = t.engine.run(&pipeline, input, None).await.unwrap();

    assert_run_completed(&result);
    assert_eq!(
        result.output,
        json!([
            {"email": "c@example.com", "age": 45},
            {"email": "a@example.com", "age": 30}
        ])
    );
    assert_eq!(result.stats.records_processed, 2);
    assert_eq!(result.stats.steps_completed, 3);
    assert_eq!(result.warnings, vec!["dedupe: removed 1 duplicate record(s)"]);
}
