//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ReconcileCommand, RunCommand, ShowCommand, StepsCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Step-ordered pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "stepline")]
#[command(version = "0.1.0")]
#[command(about = "Run ordered data pipelines with retries, history and a background queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of queue workers (overrides config)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// SQLite database for execution history (overrides config)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show execution history of a pipeline
    History(HistoryCommand),

    /// Show one execution with its log
    Show(ShowCommand),

    /// List registered step types
    Steps(StepsCommand),

    /// Fail executions left running by a previous process
    Reconcile(ReconcileCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
