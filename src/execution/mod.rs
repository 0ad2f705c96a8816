//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod stats;

pub use engine::{ExecutionEngine, ExecutionResult};
pub use executor::{AttemptFailure, StepExecutor, StepRun};
pub use stats::{InMemoryStatsStore, StatsStore};
