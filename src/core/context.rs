//! Execution context - in-memory state of one run

use crate::core::state::ExecutionStats;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A step that never succeeded during the run
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step_id: String,
    pub attempts: u32,
    pub error: String,
}

/// Working state of a single run.
///
/// Owned by the run that created it and dropped when the run finishes;
/// nothing here is persisted directly.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,

    /// The step being executed (if any)
    pub current_step_id: Option<String>,

    /// Payload flowing from step to step
    pub data: Value,

    pub stats: ExecutionStats,

    pub errors: Vec<StepFailure>,

    pub warnings: Vec<String>,

    /// Variables shared between steps of this run
    pub variables: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, data: Value) -> Self {
        Self {
            execution_id,
            current_step_id: None,
            data,
            stats: ExecutionStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn record_failure(&mut self, step_id: &str, attempts: u32, error: String) {
        self.stats.steps_failed += 1;
        self.errors.push(StepFailure {
            step_id: step_id.to_string(),
            attempts,
            error,
        });
    }

    /// Recompute progress after `handled` of `total` steps
    pub fn update_progress(&mut self, handled: usize, total: usize) {
        self.stats.progress = percent(handled, total);
    }

    /// Error messages formatted for events and results
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|f| format!("{} ({} attempt(s)): {}", f.step_id, f.attempts, f.error))
            .collect()
    }
}

/// Integer percentage clamped to 0-100
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Number of rows in a payload: array length, 0 for null, 1 otherwise
pub fn row_count(data: &Value) -> u64 {
    match data {
        Value::Array(items) => items.len() as u64,
        Value::Null => 0,
        _ => 1,
    }
}
