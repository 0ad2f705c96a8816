//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// JSON file with the input payload (default: empty array)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// User the run is attributed to
    #[arg(long)]
    pub user: Option<String>,

    /// Run through the background queue instead of inline
    #[arg(long)]
    pub queue: bool,

    /// Job priority when queued (lower runs first)
    #[arg(long, default_value_t = 0)]
    pub priority: i32,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the output payload as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline ID
    #[arg(short, long)]
    pub pipeline: String,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one execution
#[derive(Debug, Args, Clone)]
pub struct ShowCommand {
    /// Execution ID
    pub execution_id: String,

    /// Include step output snapshots
    #[arg(long)]
    pub outputs: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List registered step types
#[derive(Debug, Args, Clone)]
pub struct StepsCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Fail executions stuck in `running`
#[derive(Debug, Args, Clone)]
pub struct ReconcileCommand {
    /// Only list what would be reconciled
    #[arg(long)]
    pub dry_run: bool,
}
