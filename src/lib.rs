//! stepline - a step-ordered pipeline execution engine

pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod trigger;

// Re-export commonly used types
pub use core::config::{EngineConfig, QueueConfig};
pub use core::{
    ExecutionRecord, ExecutionStatus, PipelineDefinition, PipelineError, StepConfig, StepDefinition,
};
pub use events::{Channel, EventPublisher, PipelineEvent, ProgressCallback};
pub use execution::{ExecutionEngine, ExecutionResult, InMemoryStatsStore, StatsStore};
pub use persistence::{ExecutionStore, InMemoryExecutionStore};
pub use queue::{JobOptions, JobPayload, JobState, QueueDispatcher};
pub use registry::{StepProcessor, StepRegistry};
pub use trigger::{RunMode, RunService, RunTicket};
