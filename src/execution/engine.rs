//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{
        row_count, ExecutionContext, ExecutionStats, ExecutionStatus, LogEntry, PipelineDefinition,
        PipelineError, StepOutcome,
    },
    events::{EventPublisher, PipelineEvent, ProgressCallback},
    execution::{StatsStore, StepExecutor},
    persistence::{ExecutionStore, ExecutionUpdate, FinishExecution},
    registry::StepRegistry,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one run as returned to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    /// Payload after the last successful step
    pub output: Value,
    pub stats: ExecutionStats,
    /// One entry per step that never succeeded
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    /// Terminal error when the run was aborted
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    registry: Arc<StepRegistry>,
    executor: StepExecutor,
    store: Arc<dyn ExecutionStore>,
    stats: Arc<dyn StatsStore>,
    events: EventPublisher,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<StepRegistry>,
        store: Arc<dyn ExecutionStore>,
        stats: Arc<dyn StatsStore>,
        events: EventPublisher,
    ) -> Self {
        Self {
            executor: StepExecutor::new(registry.clone()),
            registry,
            store,
            stats,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<dyn StatsStore> {
        &self.stats
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Check that a pipeline can run at all.
    ///
    /// Step types missing from the registry are not reported here; they fail
    /// as ordinary steps when the run reaches them.
    pub fn validate(&self, pipeline: &PipelineDefinition) -> Result<(), PipelineError> {
        let mut errors = pipeline.structural_errors();

        for step in &pipeline.steps {
            let Ok(processor) = self.registry.resolve(step.step_type()) else {
                continue;
            };
            let validation = processor.validate_config(&step.config);
            if !validation.valid && validation.errors.is_empty() {
                errors.push(format!("step '{}': invalid config", step.id));
            }
            errors.extend(
                validation
                    .errors
                    .into_iter()
                    .map(|e| format!("step '{}': {}", step.id, e)),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation(errors))
        }
    }

    /// Execute the entire pipeline
    pub async fn run(
        &self,
        pipeline: &PipelineDefinition,
        input: Value,
        triggered_by: Option<String>,
    ) -> Result<ExecutionResult, PipelineError> {
        self.run_with_callback(pipeline, input, triggered_by, None).await
    }

    /// Execute the entire pipeline, reporting every event to `callback` as well.
    ///
    /// Returns `Err` only when the pipeline fails validation (no record is
    /// created) or the store cannot record the run. Step failures, including
    /// a critical abort, come back as an `Ok` result with status `failed`.
    pub async fn run_with_callback(
        &self,
        pipeline: &PipelineDefinition,
        input: Value,
        triggered_by: Option<String>,
        callback: Option<&dyn ProgressCallback>,
    ) -> Result<ExecutionResult, PipelineError> {
        if let Err(err) = self.validate(pipeline) {
            warn!("Pipeline {} rejected: {}", pipeline.id, err);
            return Err(err);
        }

        let steps = pipeline.ordered_steps();
        let record = self
            .store
            .create(&pipeline.id, triggered_by.clone(), input.clone())
            .await?;
        let execution_id = record.id;
        let user = triggered_by.as_deref();
        let started = Instant::now();

        info!("Starting pipeline execution: {} ({})", pipeline.name, execution_id);
        self.emit(
            &pipeline.id,
            execution_id,
            user,
            callback,
            PipelineEvent::Started {
                execution_id,
                pipeline_id: pipeline.id.clone(),
                total_steps: steps.len(),
            },
        )
        .await;

        let mut context = ExecutionContext::new(execution_id, input);
        context.set_variable("pipeline_id", Value::String(pipeline.id.clone()));
        context.set_variable("pipeline_version", Value::from(pipeline.version));
        let mut logs: Vec<LogEntry> = Vec::new();
        let mut abort: Option<PipelineError> = None;

        for (index, step) in steps.iter().enumerate() {
            context.current_step_id = Some(step.id.clone());
            let mut entries = Vec::new();
            let mut succeeded = false;

            if step.is_disabled() {
                info!("Skipping disabled step: {}", step.id);
                context.stats.steps_skipped += 1;
                entries.push(LogEntry::new(&step.id, StepOutcome::Skipped, "step is disabled"));
            } else {
                let run = self.executor.execute(step, &context.data).await;
                for failure in &run.failures {
                    entries.push(
                        LogEntry::new(&step.id, StepOutcome::Failed, &failure.message)
                            .with_attempt(failure.attempt)
                            .with_duration(failure.duration_ms),
                    );
                }

                match run.result {
                    Ok(output) => {
                        succeeded = true;
                        context.stats.records_processed = row_count(&output.data);
                        context.stats.records_with_errors += output.records_with_errors;
                        context.stats.steps_completed += 1;
                        context
                            .warnings
                            .extend(output.warnings.iter().map(|w| format!("{}: {}", step.id, w)));
                        entries.push(
                            LogEntry::new(
                                &step.id,
                                StepOutcome::Succeeded,
                                format!("completed after {} attempt(s)", run.attempts),
                            )
                            .with_attempt(run.attempts)
                            .with_duration(run.duration_ms)
                            .with_output(output.data.clone()),
                        );
                        context.data = output.data;
                    }
                    Err(err) => {
                        context.record_failure(&step.id, run.attempts, err.to_string());
                        if step.continue_on_error {
                            warn!("Step {} failed, continuing: {}", step.id, err);
                            entries.push(LogEntry::new(
                                &step.id,
                                StepOutcome::Continued,
                                format!("continuing after {} failed attempt(s)", run.attempts),
                            ));
                        } else {
                            let critical = PipelineError::CriticalAbort {
                                step_id: step.id.clone(),
                                attempts: run.attempts,
                                cause: err.to_string(),
                            };
                            error!("{}", critical);
                            entries.push(LogEntry::new(&step.id, StepOutcome::Aborted, critical.to_string()));
                            abort = Some(critical);
                        }
                    }
                }
            }

            context.update_progress(index + 1, steps.len());
            logs.extend(entries.iter().cloned());
            self.persist_progress(execution_id, entries, context.stats).await;

            if succeeded {
                self.emit(
                    &pipeline.id,
                    execution_id,
                    user,
                    callback,
                    PipelineEvent::Progress {
                        execution_id,
                        step_id: step.id.clone(),
                        percent: context.stats.progress,
                        records_processed: context.stats.records_processed,
                    },
                )
                .await;
            }

            if abort.is_some() {
                break;
            }
        }
        context.current_step_id = None;

        let status = if abort.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        let terminal_error = abort.as_ref().map(|e| e.to_string());

        let finished = self
            .store
            .finish(
                execution_id,
                FinishExecution {
                    status,
                    output_snapshot: context.data.clone(),
                    logs,
                    stats: context.stats,
                    error: terminal_error.clone(),
                },
            )
            .await?;
        let duration_ms = finished
            .duration_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);

        let result = ExecutionResult {
            execution_id,
            pipeline_id: pipeline.id.clone(),
            status,
            errors: context.error_messages(),
            warnings: context.warnings,
            output: context.data,
            stats: context.stats,
            duration_ms,
            error: terminal_error,
        };

        info!(
            "Pipeline {} finished: {} in {}ms ({} step error(s))",
            pipeline.id,
            status.as_str(),
            duration_ms,
            result.errors.len()
        );
        self.emit(
            &pipeline.id,
            execution_id,
            user,
            callback,
            PipelineEvent::Completed {
                execution_id,
                pipeline_id: pipeline.id.clone(),
                success: result.is_success(),
                stats: result.stats,
                errors: result.errors.clone(),
                warnings: result.warnings.clone(),
                duration_ms,
            },
        )
        .await;

        // The run is already durable; a stats failure must not fail it
        if let Err(e) = self
            .stats
            .record_run(&pipeline.id, pipeline.stats, duration_ms, result.stats.records_processed)
            .await
        {
            error!("Failed to update stats for pipeline {}: {:#}", pipeline.id, e);
        }

        Ok(result)
    }

    /// Persist the entries of one step; failures only cost the partial trail
    async fn persist_progress(&self, execution_id: Uuid, entries: Vec<LogEntry>, stats: ExecutionStats) {
        let update = ExecutionUpdate {
            append_logs: entries,
            stats: Some(stats),
        };
        if let Err(e) = self.store.update(execution_id, update).await {
            warn!("Failed to persist progress of {}: {}", execution_id, e);
        }
    }

    /// Emit an event to the callback and the publisher
    async fn emit(
        &self,
        pipeline_id: &str,
        execution_id: Uuid,
        triggered_by: Option<&str>,
        callback: Option<&dyn ProgressCallback>,
        event: PipelineEvent,
    ) {
        if let Some(callback) = callback {
            callback.on_event(&event);
        }
        self.events
            .publish_run_event(pipeline_id, execution_id, triggered_by, event)
            .await;
    }
}
