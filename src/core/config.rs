//! Engine and pipeline configuration from YAML

use crate::core::pipeline::PipelineDefinition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of runs executing at once
    pub workers: usize,

    /// SQLite database for execution history (default: local data dir)
    pub database_path: Option<PathBuf>,

    /// Capacity of the live event channel
    pub event_buffer: usize,

    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            database_path: None,
            event_buffer: 256,
            queue: QueueConfig::default(),
        }
    }
}

/// Background queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,

    /// Attempts per job when the caller does not specify any
    pub default_max_attempts: u32,

    /// Base delay of exponential backoff
    pub backoff_base_ms: u64,

    /// Upper bound for any single backoff delay
    pub backoff_max_ms: u64,

    /// Completed jobs kept for inspection
    pub retain_completed: usize,

    /// Failed jobs kept for inspection
    pub retain_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "pipeline-runs".to_string(),
            default_max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            retain_completed: 100,
            retain_failed: 500,
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse engine configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be at least 1");
        }
        if self.queue.default_max_attempts == 0 {
            anyhow::bail!("queue.default_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Database path, falling back to the platform data directory
    pub fn resolved_database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("stepline")
                .join("executions.db"),
        }
    }
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline definition from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        Ok(definition)
    }
}
