//! Step executor - runs one step with its timeout and retry policy

use crate::{
    core::{PipelineError, StepDefinition},
    registry::{StepOutput, StepRegistry},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// One failed attempt of a step
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    /// 1-based attempt number
    pub attempt: u32,
    pub message: String,
    pub duration_ms: u64,
}

/// Everything that happened while executing a step
#[derive(Debug)]
pub struct StepRun {
    pub attempts: u32,
    pub failures: Vec<AttemptFailure>,
    /// Output of the successful attempt, or the error of the last one
    pub result: Result<StepOutput, PipelineError>,
    /// Wall time across all attempts
    pub duration_ms: u64,
}

impl StepRun {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Executes a single step
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    /// Run `step` against `input`.
    ///
    /// Every failure is retried immediately, up to `retry_count` extra times.
    /// A step type missing from the registry counts as a failed attempt.
    pub async fn execute(&self, step: &StepDefinition, input: &Value) -> StepRun {
        let started = Instant::now();
        info!("Executing step: {} ({})", step.id, step.step_type());

        let max_attempts = step.max_attempts();
        let timeout_duration = Duration::from_secs(step.timeout_seconds);
        let mut failures = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            debug!("Step {} attempt {}/{}", step.id, attempt, max_attempts);

            let outcome = match self.registry.resolve(step.step_type()) {
                Ok(processor) => match timeout(timeout_duration, processor.process(input, &step.config)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(err.into_pipeline_error(&step.id)),
                    Err(_) => Err(PipelineError::StepTimeout {
                        step_id: step.id.clone(),
                        timeout_secs: step.timeout_seconds,
                    }),
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(output) => {
                    debug!("Step {} succeeded on attempt {}", step.id, attempt);
                    return StepRun {
                        attempts: attempt,
                        failures,
                        result: Ok(output),
                        duration_ms: elapsed_ms(started),
                    };
                }
                Err(err) => {
                    warn!("Step {} attempt {}/{} failed: {}", step.id, attempt, max_attempts, err);
                    failures.push(AttemptFailure {
                        attempt,
                        message: err.to_string(),
                        duration_ms: elapsed_ms(attempt_started),
                    });

                    if attempt >= max_attempts {
                        return StepRun {
                            attempts: attempt,
                            failures,
                            result: Err(err),
                            duration_ms: elapsed_ms(started),
                        };
                    }

                    info!("Retrying step {} ({}/{})", step.id, attempt + 1, max_attempts);
                }
            }
        }
    }
}
