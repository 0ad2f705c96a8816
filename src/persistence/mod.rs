//! Persistence layer for execution records

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{ExecutionRecord, ExecutionStats, ExecutionStatus, LogEntry};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors raised by execution stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("execution {0} is already finished")]
    AlreadyFinished(Uuid),

    #[error("execution {id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Partial update applied while a run is in progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    /// Entries appended to the record's log
    pub append_logs: Vec<LogEntry>,
    pub stats: Option<ExecutionStats>,
}

/// Terminal state written once at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct FinishExecution {
    pub status: ExecutionStatus,
    pub output_snapshot: Value,
    /// Complete log; replaces whatever was appended during the run
    pub logs: Vec<LogEntry>,
    pub stats: ExecutionStats,
    pub error: Option<String>,
}

/// Durable audit trail of runs
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a record in status `running`
    async fn create(
        &self,
        pipeline_id: &str,
        triggered_by: Option<String>,
        input_snapshot: Value,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Apply a partial update to an unfinished record
    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<(), StoreError>;

    /// Finish a record; it is immutable afterwards
    async fn finish(&self, id: Uuid, finish: FinishExecution) -> Result<ExecutionRecord, StoreError>;

    /// Load a record by ID
    async fn get(&self, id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Records of a pipeline, newest first
    async fn list(&self, pipeline_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Records still in `running`, e.g. after a crash
    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// Apply `finish` to a record, enforcing the status rules
pub(crate) fn apply_finish(record: &mut ExecutionRecord, finish: FinishExecution) -> Result<(), StoreError> {
    if record.is_finished() {
        return Err(StoreError::AlreadyFinished(record.id));
    }
    if !record.status.can_transition_to(finish.status) {
        return Err(StoreError::InvalidTransition {
            id: record.id,
            from: record.status,
            to: finish.status,
        });
    }

    let end_time = Utc::now();
    record.status = finish.status;
    record.end_time = Some(end_time);
    record.duration_ms = Some(
        end_time
            .signed_duration_since(record.start_time)
            .num_milliseconds()
            .max(0) as u64,
    );
    record.output_snapshot = Some(finish.output_snapshot);
    record.logs = finish.logs;
    record.stats = finish.stats;
    record.error = finish.error;
    Ok(())
}

/// In-memory store (for testing or ephemeral use)
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    by_pipeline: RwLock<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            by_pipeline: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(
        &self,
        pipeline_id: &str,
        triggered_by: Option<String>,
        input_snapshot: Value,
    ) -> Result<ExecutionRecord, StoreError> {
        let record = ExecutionRecord::started(pipeline_id, triggered_by, input_snapshot);

        let mut execs = self.executions.write().await;
        execs.insert(record.id, record.clone());

        let mut by_pipeline = self.by_pipeline.write().await;
        by_pipeline
            .entry(pipeline_id.to_string())
            .or_default()
            .push(record.id);

        Ok(record)
    }

    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<(), StoreError> {
        let mut execs = self.executions.write().await;
        let record = execs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.is_finished() {
            return Err(StoreError::AlreadyFinished(id));
        }

        record.logs.extend(update.append_logs);
        if let Some(stats) = update.stats {
            record.stats = stats;
        }
        Ok(())
    }

    async fn finish(&self, id: Uuid, finish: FinishExecution) -> Result<ExecutionRecord, StoreError> {
        let mut execs = self.executions.write().await;
        let record = execs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_finish(record, finish)?;
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let execs = self.executions.read().await;
        execs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, pipeline_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let execs = self.executions.read().await;
        let by_pipeline = self.by_pipeline.read().await;

        Ok(by_pipeline
            .get(pipeline_id)
            .map(|ids| ids.iter().rev().filter_map(|id| execs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let execs = self.executions.read().await;
        let mut running: Vec<_> = execs
            .values()
            .filter(|r| r.status == ExecutionStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(running)
    }
}
