//! Background run queue
//!
//! Jobs wait in a priority queue until a worker slot is free. A job whose
//! worker fails is retried with backoff until it runs out of attempts.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{JobCounts, JobHandle, QueueDispatcher};
pub use worker::{DefinitionSource, InMemoryDefinitions, PipelineJobWorker};

use crate::core::config::QueueConfig;
use crate::core::{ExecutionStatus, PipelineError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised when submitting to the queue
#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("invalid job options: {0}")]
    InvalidOptions(String),
}

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Waiting out a backoff delay before the next attempt
    Delayed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

/// Delay before retrying a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_ms * 2^(attempts_made - 1)`, capped at `max_ms`
    Exponential { base_ms: u64, max_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl BackoffStrategy {
    /// Delay after `attempts_made` failed attempts
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent));
                Duration::from_millis(delay_ms.min(max_ms))
            }
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

/// Per-job scheduling options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower runs first; equal priorities run in submission order
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl JobOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            priority: 0,
            max_attempts: config.default_max_attempts,
            backoff: BackoffStrategy::Exponential {
                base_ms: config.backoff_base_ms,
                max_ms: config.backoff_max_ms,
            },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Where a queued run gets its input from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    Inline(Value),
    /// JSON file read when the job is picked up
    File(PathBuf),
}

impl InputRef {
    pub async fn load(&self) -> Result<Value> {
        match self {
            InputRef::Inline(value) => Ok(value.clone()),
            InputRef::File(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read input {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Input {} is not valid JSON", path.display()))
            }
        }
    }
}

/// What a job asks the worker to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub pipeline_id: String,
    pub input: InputRef,
    pub triggered_by: Option<String>,
}

impl JobPayload {
    pub fn inline(pipeline_id: impl Into<String>, input: Value, triggered_by: Option<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            input: InputRef::Inline(input),
            triggered_by,
        }
    }
}

/// Result reported by a worker that ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub success: bool,
}

/// A unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    /// 0-100 progress of the current attempt
    pub progress: u8,
    /// Execution records created by this job's attempts, oldest first
    pub execution_ids: Vec<Uuid>,
    pub last_error: Option<String>,
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a delayed job becomes eligible again
    pub run_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub(crate) fn new(queue: &str, payload: JobPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            progress: 0,
            execution_ids: Vec::new(),
            last_error: None,
            outcome: None,
            created_at: now,
            updated_at: now,
            run_at: None,
        }
    }

    /// The terminal error of a job that ran out of attempts
    pub fn exhausted_error(&self) -> Option<PipelineError> {
        if self.state != JobState::Failed {
            return None;
        }
        Some(PipelineError::QueueExhausted {
            job_id: self.id,
            attempts: self.attempts_made,
            last_error: self.last_error.clone().unwrap_or_default(),
        })
    }
}

/// Executes the payload of a job
#[async_trait::async_trait]
pub trait JobWorker: Send + Sync {
    /// Process one attempt; `Err` (or a panic) schedules a retry
    async fn process(&self, job: &QueueJob, handle: JobHandle) -> Result<JobOutcome>;
}
