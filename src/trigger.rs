//! Run requests and execution history
//!
//! The entry point for callers: run a pipeline now and wait for the result,
//! or hand it to the queue and poll later.

use crate::core::{ExecutionRecord, ExecutionStatus, PipelineDefinition, PipelineError};
use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::persistence::{FinishExecution, StoreError};
use crate::queue::{DefinitionSource, InputRef, JobOptions, JobPayload, QueueDispatcher, QueueJob};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Error recorded on runs found stuck in `running` after a restart
pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run on the caller's task and return the final result
    Sync,
    /// Enqueue and return at once
    Async,
}

/// Answer to a run request
#[derive(Debug, Clone, PartialEq)]
pub enum RunTicket {
    /// The run finished; check `is_success` for the terminal status
    Finished(ExecutionResult),
    /// The run was accepted by the queue
    Queued { job_id: Uuid },
}

impl RunTicket {
    /// Execution id, known up front only for synchronous runs
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            RunTicket::Finished(result) => Some(result.execution_id),
            RunTicket::Queued { .. } => None,
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            RunTicket::Queued { job_id } => Some(*job_id),
            RunTicket::Finished(_) => None,
        }
    }
}

/// Trigger and history surface of the engine
pub struct RunService {
    engine: Arc<ExecutionEngine>,
    definitions: Arc<dyn DefinitionSource>,
    queue: Arc<QueueDispatcher>,
}

impl RunService {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        definitions: Arc<dyn DefinitionSource>,
        queue: Arc<QueueDispatcher>,
    ) -> Self {
        Self {
            engine,
            definitions,
            queue,
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<QueueDispatcher> {
        &self.queue
    }

    async fn definition(&self, pipeline_id: &str) -> Result<PipelineDefinition, PipelineError> {
        self.definitions
            .definition(pipeline_id)
            .await
            .map_err(|e| PipelineError::Store(StoreError::Backend(e)))?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline '{}'", pipeline_id)))
    }

    /// Request a run of a pipeline with inline input
    pub async fn request_run(
        &self,
        pipeline_id: &str,
        input: Value,
        triggered_by: Option<String>,
        mode: RunMode,
    ) -> Result<RunTicket, PipelineError> {
        match mode {
            RunMode::Sync => {
                let definition = self.definition(pipeline_id).await?;
                let result = self.engine.run(&definition, input, triggered_by).await?;
                Ok(RunTicket::Finished(result))
            }
            RunMode::Async => {
                let payload = JobPayload::inline(pipeline_id, input, triggered_by);
                self.enqueue(payload, self.queue.default_options())
            }
        }
    }

    /// Enqueue a run with explicit input reference and options
    pub fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<RunTicket, PipelineError> {
        let pipeline_id = payload.pipeline_id.clone();
        let job_id = self.queue.enqueue(payload, options)?;
        info!("Queued run of {} as job {}", pipeline_id, job_id);
        Ok(RunTicket::Queued { job_id })
    }

    /// Enqueue a run whose input is read from a JSON file at pickup
    pub fn enqueue_file(
        &self,
        pipeline_id: &str,
        path: std::path::PathBuf,
        triggered_by: Option<String>,
    ) -> Result<RunTicket, PipelineError> {
        let payload = JobPayload {
            pipeline_id: pipeline_id.to_string(),
            input: InputRef::File(path),
            triggered_by,
        };
        self.enqueue(payload, self.queue.default_options())
    }

    pub fn job(&self, job_id: Uuid) -> Option<QueueJob> {
        self.queue.job(job_id)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, PipelineError> {
        match self.engine.store().get(id).await {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => Err(PipelineError::NotFound(format!("execution {}", id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Executions of a pipeline, newest first
    pub async fn list_executions(&self, pipeline_id: &str) -> Result<Vec<ExecutionRecord>, PipelineError> {
        Ok(self.engine.store().list(pipeline_id).await?)
    }

    /// Fail every record still marked `running`.
    ///
    /// Only safe at startup, before this process has begun any run.
    pub async fn reconcile_interrupted(&self) -> Result<Vec<Uuid>, PipelineError> {
        let store = self.engine.store();
        let mut reconciled = Vec::new();

        for record in store.list_running().await? {
            let finish = FinishExecution {
                status: ExecutionStatus::Failed,
                output_snapshot: Value::Null,
                logs: record.logs.clone(),
                stats: record.stats,
                error: Some(INTERRUPTED.to_string()),
            };
            match store.finish(record.id, finish).await {
                Ok(_) => {
                    warn!("Marked interrupted execution {} of {} as failed", record.id, record.pipeline_id);
                    reconciled.push(record.id);
                }
                Err(StoreError::AlreadyFinished(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(reconciled)
    }
}
