//! Error taxonomy for pipeline runs

use crate::persistence::StoreError;
use crate::queue::QueueError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while validating, running or dispatching a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The definition cannot be run at all; no execution record is created
    #[error("pipeline validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step '{step_id}' timed out after {timeout_secs}s")]
    StepTimeout { step_id: String, timeout_secs: u64 },

    #[error("step '{step_id}' failed: {message}")]
    StepProcessing {
        step_id: String,
        message: String,
        retryable: bool,
    },

    /// A step with `continue_on_error = false` exhausted its attempts
    #[error("step '{step_id}' failed after {attempts} attempt(s), aborting run: {cause}")]
    CriticalAbort {
        step_id: String,
        attempts: u32,
        cause: String,
    },

    #[error("job {job_id} exhausted {attempts} attempt(s): {last_error}")]
    QueueExhausted {
        job_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Whether another attempt of the same step could succeed; informational, the executor retries regardless
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::StepTimeout { .. } => true,
            PipelineError::StepProcessing { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this error ends the run with status `failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_) | PipelineError::CriticalAbort { .. }
        )
    }

    /// Short machine-readable name used in log entries
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::UnknownStepType(_) => "unknown_step_type",
            PipelineError::StepTimeout { .. } => "step_timeout",
            PipelineError::StepProcessing { .. } => "step_processing",
            PipelineError::CriticalAbort { .. } => "critical_abort",
            PipelineError::QueueExhausted { .. } => "queue_exhausted",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Store(_) => "store",
            PipelineError::Queue(_) => "queue",
        }
    }
}
