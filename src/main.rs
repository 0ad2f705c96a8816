use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use stepline::cli::commands::{HistoryCommand, ReconcileCommand, RunCommand, ShowCommand, StepsCommand, ValidateCommand};
use stepline::cli::output::*;
use stepline::cli::{Cli, Command};
use stepline::core::{row_count, ExecutionStatus, PipelineDefinition};
use stepline::events::{EventPublisher, ProgressCallback};
use stepline::execution::{ExecutionEngine, ExecutionResult, InMemoryStatsStore, StatsStore};
use stepline::persistence::{ExecutionStore, InMemoryExecutionStore};
use stepline::queue::{InMemoryDefinitions, InputRef, JobPayload, PipelineJobWorker, QueueDispatcher};
use stepline::registry::StepRegistry;
use stepline::trigger::{RunService, RunTicket};
use stepline::EngineConfig;
use tracing::{error, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let config = load_config(&cli)?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &config).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd, &config).await?,
        Command::Show(cmd) => show_execution(cmd, &config).await?,
        Command::Steps(cmd) => list_steps(cmd)?,
        Command::Reconcile(cmd) => reconcile(cmd, &config).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_registry() -> Result<Arc<StepRegistry>> {
    let registry = StepRegistry::builder()
        .with_builtins()
        .context("Failed to register built-in steps")?
        .build();
    Ok(Arc::new(registry))
}

type Stores = (Arc<dyn ExecutionStore>, Arc<dyn StatsStore>);

#[cfg(feature = "sqlite")]
async fn open_stores(config: &EngineConfig, persistent: bool) -> Result<Stores> {
    if !persistent {
        return Ok(in_memory_stores());
    }
    let path = config.resolved_database_path();
    let store = Arc::new(stepline::persistence::SqliteExecutionStore::open(&path).await?);
    let executions: Arc<dyn ExecutionStore> = store.clone();
    let stats: Arc<dyn StatsStore> = store;
    Ok((executions, stats))
}

#[cfg(not(feature = "sqlite"))]
async fn open_stores(_config: &EngineConfig, persistent: bool) -> Result<Stores> {
    if persistent {
        warn!("Built without SQLite support; history is kept in memory only");
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> Stores {
    let executions: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let stats: Arc<dyn StatsStore> = Arc::new(InMemoryStatsStore::new());
    (executions, stats)
}

async fn build_service(
    config: &EngineConfig,
    definitions: Vec<PipelineDefinition>,
    persistent: bool,
) -> Result<RunService> {
    let (store, stats) = open_stores(config, persistent).await?;
    let events = EventPublisher::new(config.event_buffer);
    let engine = Arc::new(ExecutionEngine::new(build_registry()?, store, stats, events.clone()));

    let definitions: Arc<InMemoryDefinitions> = Arc::new(definitions.into_iter().collect());
    let worker = PipelineJobWorker::new(engine.clone(), definitions.clone());
    let queue = QueueDispatcher::new(config.queue.clone(), config.workers, Arc::new(worker)).with_events(events);

    Ok(RunService::new(engine, definitions, Arc::new(queue)))
}

async fn run_pipeline(cmd: &RunCommand, config: &EngineConfig) -> Result<()> {
    let pipeline = PipelineDefinition::from_file(&cmd.file).context("Failed to load pipeline definition")?;

    println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());

    let service = build_service(config, vec![pipeline.clone()], !cmd.no_history).await?;
    let input = match &cmd.input {
        Some(path) => InputRef::File(path.clone()),
        None => InputRef::Inline(Value::Array(Vec::new())),
    };

    let (status, execution_id) = if cmd.queue {
        run_queued(&service, &pipeline, input, cmd).await?
    } else {
        let data = input.load().await?;
        println!("{} Input: {} row(s)", INFO, style(row_count(&data)).cyan());

        let progress = ConsoleProgress::new();
        let callback: &dyn ProgressCallback = &progress;
        let result = service
            .engine()
            .run_with_callback(&pipeline, data, cmd.user.clone(), Some(callback))
            .await;
        progress.finish();

        let result = result?;
        print_result(&result, cmd.json)?;
        (result.status, result.execution_id)
    };

    if !cmd.no_history {
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(execution_id).dim()
        );
    }

    if status == ExecutionStatus::Completed {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&pipeline.name).bold(),
            style("successfully").green()
        );
    } else {
        println!("\n{} {} {}", CROSS, style(&pipeline.name).bold(), style("failed").red());
        std::process::exit(1);
    }

    Ok(())
}

async fn run_queued(
    service: &RunService,
    pipeline: &PipelineDefinition,
    input: InputRef,
    cmd: &RunCommand,
) -> Result<(ExecutionStatus, uuid::Uuid)> {
    let payload = JobPayload {
        pipeline_id: pipeline.id.clone(),
        input,
        triggered_by: cmd.user.clone(),
    };
    let options = service.queue().default_options().with_priority(cmd.priority);
    let ticket = service.enqueue(payload, options)?;
    let RunTicket::Queued { job_id } = ticket else {
        anyhow::bail!("queue did not accept the run");
    };

    println!("{} Queued as job {}", ROCKET, style(job_id).dim());
    service.queue().start();

    let progress = ConsoleProgress::new();
    let mut changes = service.queue().watch();
    let job = loop {
        match service.job(job_id) {
            Some(job) if job.state.is_terminal() => break job,
            Some(job) => progress.set_position(job.progress),
            None => anyhow::bail!("job {} disappeared from the queue", job_id),
        }
        if changes.changed().await.is_err() {
            anyhow::bail!("queue stopped while job {} was pending", job_id);
        }
    };
    progress.finish();
    service.queue().shutdown().await;

    if let Some(err) = job.exhausted_error() {
        error!("{}", err);
        println!("{} {}", CROSS, style(err).red());
        std::process::exit(1);
    }

    let outcome = job
        .outcome
        .with_context(|| format!("job {} finished without an outcome", job_id))?;
    let record = service.get_execution(outcome.execution_id).await?;
    for entry in &record.logs {
        println!("  {}", format_log_entry(entry));
    }
    if cmd.json {
        let output = record.output_snapshot.unwrap_or(Value::Null);
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    Ok((outcome.status, outcome.execution_id))
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    println!(
        "\n{} {} row(s) out, {} rejected, {} step(s) completed, {} skipped",
        INFO,
        style(result.stats.records_processed).cyan(),
        style(result.stats.records_with_errors).yellow(),
        result.stats.steps_completed,
        result.stats.steps_skipped
    );
    for warning in &result.warnings {
        println!("  {} {}", WARN, warning);
    }
    for err in &result.errors {
        println!("  {} {}", CROSS, style(err).red());
    }
    if let Some(err) = &result.error {
        println!("  {} {}", CROSS, style(err).red().bold());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&result.output)?);
    }
    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let pipeline = match PipelineDefinition::from_file(&cmd.file) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    };

    let registry = build_registry()?;
    let engine = ExecutionEngine::new(
        registry.clone(),
        Arc::new(InMemoryExecutionStore::new()),
        Arc::new(InMemoryStatsStore::new()),
        EventPublisher::default(),
    );

    match engine.validate(&pipeline) {
        Ok(()) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&pipeline.name).bold());
            println!("  Steps: {}", style(pipeline.steps.len()).cyan());
            for step in pipeline.ordered_steps() {
                if !registry.contains(step.step_type()) {
                    println!(
                        "  {} step '{}' uses unregistered type '{}'; it will fail at run time",
                        WARN,
                        step.id,
                        step.step_type()
                    );
                }
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&pipeline)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand, config: &EngineConfig) -> Result<()> {
    let service = build_service(config, Vec::new(), true).await?;
    let executions: Vec<_> = service
        .list_executions(&cmd.pipeline)
        .await?
        .into_iter()
        .take(cmd.limit)
        .collect();

    if cmd.json {
        let stats = service.engine().stats().stats(&cmd.pipeline).await?;
        let data = serde_json::json!({ "stats": stats, "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    let stats = service.engine().stats().stats(&cmd.pipeline).await?;
    println!(
        "{} {}: {} run(s), {} row(s) total, average {}",
        INFO,
        style(&cmd.pipeline).bold(),
        style(stats.execution_count).cyan(),
        stats.total_processed_rows,
        format_duration_ms(stats.average_execution_time.round() as u64)
    );
    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for record in &executions {
        println!("  {}", format_record_line(record));
    }

    Ok(())
}

async fn show_execution(cmd: &ShowCommand, config: &EngineConfig) -> Result<()> {
    let id = uuid::Uuid::parse_str(&cmd.execution_id).context("Invalid execution ID format")?;
    let service = build_service(config, Vec::new(), true).await?;

    let record = match service.get_execution(id).await {
        Ok(record) => record,
        Err(stepline::PipelineError::NotFound(_)) => {
            println!("{} Execution not found", WARN);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(record.id).cyan());
    println!("  Pipeline: {}", style(&record.pipeline_id).bold());
    println!("  Status: {}", format_status(record.status));
    if let Some(user) = &record.triggered_by {
        println!("  Triggered by: {}", user);
    }
    println!("  Started: {}", style(record.start_time.to_rfc3339()).dim());
    if let Some(end) = record.end_time {
        println!("  Finished: {}", style(end.to_rfc3339()).dim());
    }
    if let Some(ms) = record.duration_ms {
        println!("  Duration: {}", style(format_duration_ms(ms)).dim());
    }
    println!(
        "  Rows: {} processed, {} rejected",
        style(record.stats.records_processed).cyan(),
        style(record.stats.records_with_errors).yellow()
    );
    if let Some(err) = &record.error {
        println!("  Error: {}", style(err).red());
    }

    println!("\n  {}", style("Log:").bold());
    for entry in &record.logs {
        println!("    {}", format_log_entry(entry));
        if cmd.outputs {
            if let Some(output) = &entry.output {
                for line in serde_json::to_string_pretty(output)?.lines() {
                    println!("      {}", style(line).dim());
                }
            }
        }
    }

    Ok(())
}

fn list_steps(cmd: &StepsCommand) -> Result<()> {
    let registry = build_registry()?;

    if cmd.json {
        let defaults: HashMap<&str, _> = registry
            .step_types()
            .into_iter()
            .filter_map(|t| registry.resolve(t).ok().map(|p| (t, p.default_config())))
            .collect();
        println!("{}", serde_json::to_string_pretty(&defaults)?);
        return Ok(());
    }

    println!("{} Registered step types:", INFO);
    for step_type in registry.step_types() {
        let processor = registry.resolve(step_type)?;
        println!(
            "  {} {}",
            style(step_type).bold(),
            style(processor.default_config().settings()).dim()
        );
    }
    Ok(())
}

async fn reconcile(cmd: &ReconcileCommand, config: &EngineConfig) -> Result<()> {
    let service = build_service(config, Vec::new(), true).await?;

    if cmd.dry_run {
        let running = service.engine().store().list_running().await?;
        if running.is_empty() {
            println!("{} No executions left running", CHECK);
        }
        for record in &running {
            println!("  {}", format_record_line(record));
        }
        return Ok(());
    }

    let reconciled = service.reconcile_interrupted().await?;
    if reconciled.is_empty() {
        println!("{} No executions left running", CHECK);
    } else {
        warn!("Reconciled {} interrupted execution(s)", reconciled.len());
        println!(
            "{} Marked {} interrupted execution(s) as failed",
            WARN,
            style(reconciled.len()).yellow()
        );
        for id in reconciled {
            println!("  {}", style(id).dim());
        }
    }
    Ok(())
}
