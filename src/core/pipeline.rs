//! Pipeline domain model

use crate::core::step::StepDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Lifecycle of a pipeline definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Draft,
    #[default]
    Active,
    Archived,
}

/// Rolling statistics kept per pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub execution_count: u64,
    pub total_processed_rows: u64,
    /// Mean run duration in milliseconds
    pub average_execution_time: f64,
}

impl PipelineStats {
    /// Fold one finished run into the statistics
    pub fn record_run(&mut self, duration_ms: u64, processed_rows: u64) {
        let previous = self.execution_count as f64;
        self.execution_count += 1;
        self.average_execution_time =
            (self.average_execution_time * previous + duration_ms as f64) / self.execution_count as f64;
        self.total_processed_rows += processed_rows;
    }
}

/// A pipeline definition as supplied by the owning application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,

    pub name: String,

    /// Steps in any order; execution order comes from `StepDefinition::order`
    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub status: PipelineStatus,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub stats: PipelineStats,
}

fn default_version() -> u32 {
    1
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps,
            status: PipelineStatus::Active,
            version: default_version(),
            stats: PipelineStats::default(),
        }
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Structural checks that need no step registry
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.status == PipelineStatus::Archived {
            errors.push(format!("pipeline '{}' is archived", self.id));
        }

        if self.steps.is_empty() {
            errors.push("pipeline has no steps".to_string());
            return errors;
        }

        let mut seen_orders = HashSet::new();
        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.order == 0 {
                errors.push(format!("step '{}' has order 0; orders start at 1", step.id));
            } else if !seen_orders.insert(step.order) {
                errors.push(format!("duplicate step order {} (step '{}')", step.order, step.id));
            }
            if !seen_ids.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.id));
            }
            if step.timeout_seconds == 0 {
                errors.push(format!("step '{}' has a zero timeout", step.id));
            }
        }

        errors
    }

    /// Steps sorted ascending by `order`
    pub fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<_> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }
}
