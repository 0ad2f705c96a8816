//! CLI output formatting

use crate::{
    core::{ExecutionRecord, ExecutionStatus, LogEntry, StepOutcome},
    events::{NotificationLevel, PipelineEvent, ProgressCallback},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a percentage progress bar
pub fn create_progress_bar() -> ProgressBar {
    let progress = ProgressBar::new(100);
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(bar_style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn status_icon(status: ExecutionStatus) -> Emoji<'static, 'static> {
    match status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Pending => INFO,
    }
}

/// One-line summary of an execution record
pub fn format_record_line(record: &ExecutionRecord) -> String {
    let duration = record
        .duration_ms
        .map(format_duration_ms)
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} - {} rows - {}",
        status_icon(record.status),
        style(&record.id.to_string()[..8]).dim(),
        style(record.start_time.format("%Y-%m-%d %H:%M:%S")).dim(),
        format_status(record.status),
        style(record.stats.records_processed).cyan(),
        duration
    )
}

/// Format a log entry for display
pub fn format_log_entry(entry: &LogEntry) -> String {
    let (icon, step) = match entry.outcome {
        StepOutcome::Succeeded => (CHECK, style(&entry.step_id).green()),
        StepOutcome::Failed => (CROSS, style(&entry.step_id).red()),
        StepOutcome::Skipped => (SKIP, style(&entry.step_id).dim()),
        StepOutcome::Continued => (WARN, style(&entry.step_id).yellow()),
        StepOutcome::Aborted => (CROSS, style(&entry.step_id).red().bold()),
    };

    let mut line = format!("{} {}", icon, step);
    if let Some(attempt) = entry.attempt {
        line.push_str(&format!(" {}", style(format!("#{}", attempt)).dim()));
    }
    line.push_str(&format!(": {}", entry.message));
    if let Some(ms) = entry.duration_ms {
        line.push_str(&format!(" {}", style(format!("({})", format_duration_ms(ms))).dim()));
    }
    line
}

/// Format a run event for display
pub fn format_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::Started {
            execution_id,
            pipeline_id,
            total_steps,
        } => format!(
            "{} Starting pipeline {} ({}, {} steps)",
            ROCKET,
            style(pipeline_id).bold(),
            style(&execution_id.to_string()[..8]).dim(),
            total_steps
        ),
        PipelineEvent::Progress {
            step_id,
            percent,
            records_processed,
            ..
        } => format!(
            "{} {} {} - {} rows",
            CHECK,
            style(step_id).green(),
            style(format!("{}%", percent)).cyan(),
            records_processed
        ),
        PipelineEvent::Completed {
            success,
            errors,
            duration_ms,
            ..
        } => {
            let outcome = if *success {
                format!("{} completed", style("successfully").green())
            } else {
                style("failed").red().to_string()
            };
            format!(
                "{} Pipeline {} in {} ({} step error(s))",
                if *success { CHECK } else { CROSS },
                outcome,
                format_duration_ms(*duration_ms),
                errors.len()
            )
        }
        PipelineEvent::Notification { level, title, message } => {
            let icon = match level {
                NotificationLevel::Info => INFO,
                NotificationLevel::Warning => WARN,
                NotificationLevel::Error => CROSS,
            };
            format!("{} {}: {}", icon, style(title).bold(), message)
        }
    }
}

/// Prints run events above a progress bar
pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: create_progress_bar(),
        }
    }

    pub fn set_position(&self, percent: u8) {
        self.bar.set_position(percent as u64);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for ConsoleProgress {
    fn on_event(&self, event: &PipelineEvent) {
        self.bar.println(format_event(event));
        if let PipelineEvent::Progress { percent, step_id, .. } = event {
            self.bar.set_position(*percent as u64);
            self.bar.set_message(step_id.clone());
        }
    }
}

/// Human-readable duration
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1_000;
    if secs < 60 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
