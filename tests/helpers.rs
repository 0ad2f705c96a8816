//! Test utility functions for stepline
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepline::core::{ExecutionRecord, StepOutcome};
use stepline::events::EventPublisher;
use stepline::execution::{ExecutionEngine, ExecutionResult, InMemoryStatsStore};
use stepline::persistence::InMemoryExecutionStore;
use stepline::registry::{ConfigValidation, StepError, StepOutput, StepProcessor, StepRegistry};
use stepline::{ExecutionStatus, PipelineDefinition, StepConfig, StepDefinition};

/// Every processor call, in call order, keyed by the step's `tag` setting
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    fn record(&self, tag: &str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(tag.to_string());
        calls.iter().filter(|c| *c == tag).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == tag).count()
    }
}

fn tag(config: &StepConfig) -> String {
    config
        .settings()
        .get("tag")
        .and_then(Value::as_str)
        .unwrap_or("untagged")
        .to_string()
}

/// Appends `{"step": tag}` to an array payload
fn append(input: &Value, tag: &str) -> Result<StepOutput, StepError> {
    let mut rows = input
        .as_array()
        .cloned()
        .ok_or_else(|| StepError::InvalidInput("expected an array".to_string()))?;
    rows.push(json!({ "step": tag }));
    Ok(StepOutput::new(Value::Array(rows)))
}

/// Test processor with a fixed behaviour per step type
pub enum Behaviour {
    /// Append a row
    Append,
    /// Fail every attempt with a retryable error
    Fail,
    /// Fail every attempt with a permanent error
    Reject,
    /// Fail the first `failures` calls per tag, then append
    Flaky,
    /// Sleep `sleep_ms`, then append
    Slow,
}

pub struct MockStep {
    step_type: &'static str,
    behaviour: Behaviour,
    calls: CallLog,
}

impl MockStep {
    pub fn new(step_type: &'static str, behaviour: Behaviour, calls: CallLog) -> Self {
        Self {
            step_type,
            behaviour,
            calls,
        }
    }
}

#[async_trait]
impl StepProcessor for MockStep {
    fn step_type(&self) -> &str {
        self.step_type
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let tag = tag(config);
        let call = self.calls.record(&tag);
        let settings = config.settings();

        match self.behaviour {
            Behaviour::Append => append(input, &tag),
            Behaviour::Fail => Err(StepError::retryable(format!("{} exploded", tag))),
            Behaviour::Reject => Err(StepError::permanent(format!("{} rejected the payload", tag))),
            Behaviour::Flaky => {
                let failures = settings.get("failures").and_then(Value::as_u64).unwrap_or(0);
                if (call as u64) <= failures {
                    Err(StepError::retryable(format!("{} flaked on call {}", tag, call)))
                } else {
                    append(input, &tag)
                }
            }
            Behaviour::Slow => {
                let sleep_ms = settings.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                append(input, &tag)
            }
        }
    }

    fn validate_config(&self, _config: &StepConfig) -> ConfigValidation {
        ConfigValidation::ok()
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::custom(self.step_type, json!({}))
    }
}

/// Registry with the built-ins plus every mock step type
pub fn test_registry(calls: &CallLog) -> StepRegistry {
    StepRegistry::builder()
        .with_builtins()
        .and_then(|b| b.register(MockStep::new("append", Behaviour::Append, calls.clone())))
        .and_then(|b| b.register(MockStep::new("fail", Behaviour::Fail, calls.clone())))
        .and_then(|b| b.register(MockStep::new("reject", Behaviour::Reject, calls.clone())))
        .and_then(|b| b.register(MockStep::new("flaky", Behaviour::Flaky, calls.clone())))
        .and_then(|b| b.register(MockStep::new("slow", Behaviour::Slow, calls.clone())))
        .expect("mock registry should build")
        .build()
}

/// An engine over in-memory stores, with handles to each part
pub struct TestEngine {
    pub engine: Arc<ExecutionEngine>,
    pub store: Arc<InMemoryExecutionStore>,
    pub stats: Arc<InMemoryStatsStore>,
    pub events: EventPublisher,
    pub calls: CallLog,
}

pub fn test_engine() -> TestEngine {
    test_engine_with_events(EventPublisher::new(256))
}

pub fn test_engine_with_events(events: EventPublisher) -> TestEngine {
    let calls = CallLog::default();
    let store = Arc::new(InMemoryExecutionStore::new());
    let stats = Arc::new(InMemoryStatsStore::new());
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(test_registry(&calls)),
        store.clone(),
        stats.clone(),
        events.clone(),
    ));

    TestEngine {
        engine,
        store,
        stats,
        events,
        calls,
    }
}

pub fn pipeline(id: &str, steps: Vec<StepDefinition>) -> PipelineDefinition {
    PipelineDefinition::new(id, format!("Test: {}", id), steps)
}

fn mock_step(id: &str, order: u32, step_type: &str, extra: Value) -> StepDefinition {
    let mut settings = json!({ "tag": id });
    if let (Some(settings), Some(extra)) = (settings.as_object_mut(), extra.as_object()) {
        settings.extend(extra.clone());
    }
    StepDefinition::new(id, order, StepConfig::custom(step_type, settings))
}

pub fn append_step(id: &str, order: u32) -> StepDefinition {
    mock_step(id, order, "append", json!({}))
}

pub fn failing_step(id: &str, order: u32) -> StepDefinition {
    mock_step(id, order, "fail", json!({}))
}

pub fn rejecting_step(id: &str, order: u32) -> StepDefinition {
    mock_step(id, order, "reject", json!({}))
}

pub fn flaky_step(id: &str, order: u32, failures: u64) -> StepDefinition {
    mock_step(id, order, "flaky", json!({ "failures": failures }))
}

pub fn slow_step(id: &str, order: u32, sleep_ms: u64) -> StepDefinition {
    mock_step(id, order, "slow", json!({ "sleep_ms": sleep_ms }))
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the run finished with status `completed`
pub fn assert_run_completed(result: &ExecutionResult) {
    assert_eq!(
        result.status,
        ExecutionStatus::Completed,
        "Expected completed run, got {:?} (error: {:?})",
        result.status,
        result.error
    );
}

/// Assert the run finished with status `failed`
pub fn assert_run_failed(result: &ExecutionResult) {
    assert_eq!(
        result.status,
        ExecutionStatus::Failed,
        "Expected failed run, got {:?}",
        result.status
    );
}

/// Tags appended to the payload, i.e. the steps that succeeded, in order
pub fn visited(output: &Value) -> Vec<String> {
    output
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("step").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Assert the steps that transformed the payload, in order
pub fn assert_visit_order(result: &ExecutionResult, expected: &[&str]) {
    let actual = visited(&result.output);
    assert_eq!(
        actual, expected,
        "Expected visit order {:?}, got {:?}",
        expected, actual
    );
}

/// Outcomes logged for one step, in log order
pub fn outcomes(record: &ExecutionRecord, step_id: &str) -> Vec<StepOutcome> {
    record
        .logs
        .iter()
        .filter(|entry| entry.step_id == step_id)
        .map(|entry| entry.outcome)
        .collect()
}

/// Assert the exact sequence of log outcomes for one step
pub fn assert_step_log(record: &ExecutionRecord, step_id: &str, expected: &[StepOutcome]) {
    let actual = outcomes(record, step_id);
    assert_eq!(
        actual, expected,
        "Step '{}' logged {:?}, expected {:?}",
        step_id, actual, expected
    );
}

/// Number of failed attempts logged for one step
pub fn failed_attempts(record: &ExecutionRecord, step_id: &str) -> usize {
    outcomes(record, step_id)
        .into_iter()
        .filter(|o| *o == StepOutcome::Failed)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_steps_append_their_tag() {
        let calls = CallLog::default();
        let registry = test_registry(&calls);
        let step = append_step("a", 1);

        let processor = registry.resolve(step.step_type()).unwrap();
        let output = processor.process(&json!([]), &step.config).await.unwrap();

        assert_eq!(visited(&output.data), vec!["a"]);
        assert_eq!(calls.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_flaky_step_recovers() {
        let calls = CallLog::default();
        let registry = test_registry(&calls);
        let step = flaky_step("f", 1, 2);
        let processor = registry.resolve(step.step_type()).unwrap();

        assert!(processor.process(&json!([]), &step.config).await.is_err());
        assert!(processor.process(&json!([]), &step.config).await.is_err());
        assert!(processor.process(&json!([]), &step.config).await.is_ok());
        assert_eq!(calls.count("f"), 3);
    }
}
