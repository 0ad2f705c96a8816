//! Rolling per-pipeline statistics

use crate::core::PipelineStats;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Keeps `PipelineStats` up to date across runs
///
/// `record_run` must be atomic per pipeline: concurrent finishes of the same
/// pipeline may not lose an increment.
#[async_trait::async_trait]
pub trait StatsStore: Send + Sync {
    /// Fold one finished run into the pipeline's stats and return the result
    ///
    /// `baseline` is what the definition already carries; it is the starting
    /// point for a pipeline this store has not seen yet.
    async fn record_run(
        &self,
        pipeline_id: &str,
        baseline: PipelineStats,
        duration_ms: u64,
        processed_rows: u64,
    ) -> Result<PipelineStats>;

    /// Current stats; zeroed for a pipeline that never ran
    async fn stats(&self, pipeline_id: &str) -> Result<PipelineStats>;
}

/// Process-local stats, guarded by a single mutex
#[derive(Default)]
pub struct InMemoryStatsStore {
    stats: Mutex<HashMap<String, PipelineStats>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn record_run(
        &self,
        pipeline_id: &str,
        baseline: PipelineStats,
        duration_ms: u64,
        processed_rows: u64,
    ) -> Result<PipelineStats> {
        let mut guard = self
            .stats
            .lock()
            .map_err(|_| anyhow::anyhow!("stats lock poisoned"))?;
        let entry = guard.entry(pipeline_id.to_string()).or_insert(baseline);
        entry.record_run(duration_ms, processed_rows);
        Ok(entry.clone())
    }

    async fn stats(&self, pipeline_id: &str) -> Result<PipelineStats> {
        let guard = self
            .stats
            .lock()
            .map_err(|_| anyhow::anyhow!("stats lock poisoned"))?;
        Ok(guard.get(pipeline_id).cloned().unwrap_or_default())
    }
}
