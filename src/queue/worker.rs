//! Queue worker that runs pipelines through the execution engine

use crate::core::PipelineDefinition;
use crate::events::{PipelineEvent, ProgressCallback};
use crate::execution::ExecutionEngine;
use crate::queue::{JobHandle, JobOutcome, JobWorker, QueueJob};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Supplies pipeline definitions owned by the surrounding application
#[async_trait::async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn definition(&self, pipeline_id: &str) -> Result<Option<PipelineDefinition>>;
}

/// Definitions held in memory, e.g. loaded from YAML at startup
#[derive(Default)]
pub struct InMemoryDefinitions {
    definitions: RwLock<HashMap<String, PipelineDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, definition: PipelineDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }
}

impl FromIterator<PipelineDefinition> for InMemoryDefinitions {
    fn from_iter<I: IntoIterator<Item = PipelineDefinition>>(iter: I) -> Self {
        Self {
            definitions: RwLock::new(iter.into_iter().map(|d| (d.id.clone(), d)).collect()),
        }
    }
}

#[async_trait::async_trait]
impl DefinitionSource for InMemoryDefinitions {
    async fn definition(&self, pipeline_id: &str) -> Result<Option<PipelineDefinition>> {
        Ok(self.definitions.read().await.get(pipeline_id).cloned())
    }
}

/// Forwards run events into the job's progress
struct JobProgress<'a> {
    handle: &'a JobHandle,
}

impl ProgressCallback for JobProgress<'_> {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Started { execution_id, .. } => self.handle.record_execution(*execution_id),
            PipelineEvent::Progress { percent, .. } => self.handle.set_progress(*percent),
            _ => {}
        }
    }
}

/// Runs the pipeline named by a job
pub struct PipelineJobWorker {
    engine: Arc<ExecutionEngine>,
    definitions: Arc<dyn DefinitionSource>,
}

impl PipelineJobWorker {
    pub fn new(engine: Arc<ExecutionEngine>, definitions: Arc<dyn DefinitionSource>) -> Self {
        Self { engine, definitions }
    }
}

#[async_trait::async_trait]
impl JobWorker for PipelineJobWorker {
    async fn process(&self, job: &QueueJob, handle: JobHandle) -> Result<JobOutcome> {
        let payload = &job.payload;
        info!(
            "Job {} running pipeline {} (attempt {}/{})",
            job.id, payload.pipeline_id, job.attempts_made, job.options.max_attempts
        );

        let definition = self
            .definitions
            .definition(&payload.pipeline_id)
            .await?
            .ok_or_else(|| anyhow!("pipeline '{}' not found", payload.pipeline_id))?;
        let input = payload.input.load().await?;

        let progress = JobProgress { handle: &handle };
        let callback: &dyn ProgressCallback = &progress;
        let result = self
            .engine
            .run_with_callback(&definition, input, payload.triggered_by.clone(), Some(callback))
            .await?;

        Ok(JobOutcome {
            execution_id: result.execution_id,
            status: result.status,
            success: result.is_success(),
        })
    }
}
