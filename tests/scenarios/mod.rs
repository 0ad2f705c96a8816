//! Scenario-based tests for stepline

mod events;
mod ordering;
mod queue;
mod stats;

#[cfg(feature = "sqlite")]
mod sqlite_history;
