//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Run has not started
    Pending,
    /// Run is currently executing steps
    Running,
    /// Run finished; individual steps may still have failed
    Completed,
    /// Run aborted on a critical step failure
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Status only moves forward: pending -> running -> completed | failed
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// Counters shared by the live context and the persisted record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Rows in the payload after the most recent successful step
    pub records_processed: u64,
    /// Rows rejected by steps during this run
    pub records_with_errors: u64,
    /// 0-100, share of steps handled so far
    pub progress: u8,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
}

/// What happened in a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Skipped,
    Continued,
    Aborted,
}

/// One line of a run's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
    pub outcome: StepOutcome,
    /// Attempt number (1-based) for attempt-level entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub message: String,
    /// Step output snapshot on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl LogEntry {
    pub fn new(step_id: impl Into<String>, outcome: StepOutcome, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id: step_id.into(),
            outcome,
            attempt: None,
            duration_ms: None,
            message: message.into(),
            output: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Durable audit record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub pipeline_id: String,
    /// User that requested the run; `None` for system-triggered runs
    pub triggered_by: Option<String>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_snapshot: Value,
    pub output_snapshot: Option<Value>,
    pub logs: Vec<LogEntry>,
    pub stats: ExecutionStats,
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// A freshly started record
    pub fn started(pipeline_id: &str, triggered_by: Option<String>, input_snapshot: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.to_string(),
            triggered_by,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            input_snapshot,
            output_snapshot: None,
            logs: Vec::new(),
            stats: ExecutionStats::default(),
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}
