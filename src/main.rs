use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use opsrunner::config::{LoggingConfig, OpsrunnerConfig};
use opsrunner::executor::{JobRequest, OutputEvent};
use opsrunner::model::{ExecutionRecord, ExecutionStatus, JobKind};
use opsrunner::scheduler::{self, ScheduleStore, ScheduledTask};
use opsrunner::storage::{Filters, StatsPeriod};

#[derive(Parser)]
#[command(
    name = "opsrunner",
    about = "Run, track, and schedule automation jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $OPSRUNNER_CONFIG, then /etc/opsrunner/opsrunner.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + retention)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a command locally, tail its output, and record it
    Exec {
        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the final record as JSON
        #[arg(long)]
        json: bool,

        /// Program and arguments, after `--`
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Inspect and prune execution history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List executions, newest first
    List {
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        kind: Option<JobKind>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        job: Option<String>,
        /// Only failed executions
        #[arg(long)]
        failed: bool,
        /// Only executions that changed something
        #[arg(long)]
        changed: bool,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        offset: Option<usize>,
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one execution with its output
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Aggregate statistics over a period (hour, day, week, month)
    Stats {
        #[arg(long, default_value = "day")]
        period: StatsPeriod,
        #[arg(long)]
        json: bool,
    },

    /// Delete finished executions older than N days
    Cleanup {
        /// Defaults to the configured retention
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field, or 6/7-field with seconds)
        #[arg(long)]
        cron: String,

        /// Job template as JSON (e.g. {"kind":"playbook",...})
        #[arg(long, conflicts_with = "argv")]
        template: Option<String>,

        /// Command to run, after `--`
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Remove a schedule
    Remove {
        /// Schedule id
        id: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OpsrunnerConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting opsrunner daemon");
            opsrunner::serve(config).await?;
        }
        Commands::Exec { timeout, json, argv } => exec(&config, argv, timeout, json).await?,
        Commands::History { action } => history(&config, action).await?,
        Commands::Schedule { action } => schedule(&config, action).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.is_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

async fn exec(config: &OpsrunnerConfig, argv: Vec<String>, timeout: Option<u64>, json: bool) -> Result<()> {
    let store = opsrunner::open_store(config)?;
    let executor = opsrunner::build_executor(config, store);

    let id = executor.submit(&JobRequest::command(argv, timeout)).await?;
    tracing::info!(execution_id = %id, "execution started");

    let record = match executor.attach(&id) {
        Some(mut rx) => {
            let mut last = None;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(OutputEvent::Line(line)) => println!("{}", line),
                        Some(OutputEvent::Completed(record)) => {
                            last = Some(*record);
                            break;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupted, cancelling {}", id);
                        executor.cancel(&id).await?;
                    }
                }
            }
            match last {
                Some(record) => record,
                None => executor.get(&id).await?,
            }
        }
        None => executor.get(&id).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        eprintln!(
            "[{}] {} exit={} duration={:.2}s",
            record.id, record.status, record.exit_code, record.duration
        );
    }

    if record.status != ExecutionStatus::Success {
        bail!("execution {} finished with status {}", record.id, record.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

async fn history(config: &OpsrunnerConfig, action: HistoryAction) -> Result<()> {
    let store = opsrunner::open_store(config)?;

    match action {
        HistoryAction::List {
            status,
            kind,
            target,
            job,
            failed,
            changed,
            limit,
            offset,
            json,
        } => {
            let filters = Filters {
                status,
                kind,
                target,
                job_name: job,
                only_failed: failed,
                only_changed: changed,
                limit: Some(limit),
                offset,
                ..Filters::default()
            };
            let records = tokio::task::spawn_blocking(move || store.list(&filters)).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions found.");
            } else {
                println!(
                    "{:<36} | {:<14} | {:<9} | {:<25} | {:>8} | Job",
                    "ID", "Kind", "Status", "Started", "Duration"
                );
                println!("{:-<36}-|-{:-<14}-|-{:-<9}-|-{:-<25}-|-{:->8}-|-{:-<20}", "", "", "", "", "", "");
                for rec in &records {
                    println!(
                        "{:<36} | {:<14} | {:<9} | {:<25} | {:>7.1}s | {}",
                        rec.id,
                        rec.kind,
                        rec.status,
                        rec.start_time.to_rfc3339(),
                        rec.duration,
                        rec.job_name.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        HistoryAction::Show { id, json } => {
            let (record, metadata) = tokio::task::spawn_blocking(move || {
                let record = store.get(&id)?;
                let metadata = store.metadata(&id)?;
                Ok::<_, opsrunner::storage::StoreError>((record, metadata))
            })
            .await??;
            if json {
                let doc = serde_json::json!({ "record": record, "metadata": metadata });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print_record(&record);
                if let Some(meta) = metadata {
                    println!("Metadata:   {}", serde_json::to_string(&meta)?);
                }
            }
        }
        HistoryAction::Stats { period, json } => {
            let stats =
                tokio::task::spawn_blocking(move || store.statistics(period.window())).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("\n=== Execution statistics (last {}) ===", period);
                println!("Total:        {}", stats.total);
                println!("Success:      {}", stats.success);
                println!("Failed:       {}", stats.failed);
                println!("Cancelled:    {}", stats.cancelled);
                println!("Running:      {}", stats.running);
                println!("Success rate: {:.1}%", stats.success_rate);
                if let (Some(avg), Some(min), Some(max)) =
                    (stats.avg_duration, stats.min_duration, stats.max_duration)
                {
                    println!("Duration:     avg {:.2}s, min {:.2}s, max {:.2}s", avg, min, max);
                }
                if !stats.top_failed_hosts.is_empty() {
                    println!("\nMost failing hosts:");
                    for entry in &stats.top_failed_hosts {
                        println!(" - {} ({})", entry.name, entry.count);
                    }
                }
                if !stats.top_jobs.is_empty() {
                    println!("\nMost run jobs:");
                    for entry in &stats.top_jobs {
                        println!(" - {} ({})", entry.name, entry.count);
                    }
                }
                println!();
            }
        }
        HistoryAction::Cleanup { days } => {
            let days = days.unwrap_or(config.retention.days);
            let deleted = tokio::task::spawn_blocking(move || store.cleanup(days)).await??;
            println!("Deleted {} execution(s) older than {} day(s).", deleted, days);
        }
    }
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    println!("ID:         {}", record.id);
    println!("Kind:       {}", record.kind);
    println!("Status:     {}", record.status);
    println!("Job:        {}", record.job_name.as_deref().unwrap_or("-"));
    println!("Target:     {}", record.target.as_deref().unwrap_or("-"));
    println!("Started:    {}", record.start_time.to_rfc3339());
    if let Some(end) = record.end_time {
        println!("Ended:      {}", end.to_rfc3339());
    }
    println!("Duration:   {:.2}s", record.duration);
    println!("Exit code:  {}", record.exit_code);
    println!("Changed:    {}", record.changed);
    if !record.per_host_stats.is_empty() {
        println!("\n{:<25} | {:>4} | {:>7} | {:>11} | {:>6}", "Host", "ok", "changed", "unreachable", "failed");
        for (host, s) in &record.per_host_stats {
            println!(
                "{:<25} | {:>4} | {:>7} | {:>11} | {:>6}",
                host, s.ok, s.changed, s.unreachable, s.failed
            );
        }
    }
    println!("\nOutput ({} lines):", record.output.len());
    for line in &record.output {
        println!("  {}", line);
    }
}

// ---------------------------------------------------------------------------
// schedule
// ---------------------------------------------------------------------------

async fn schedule(config: &OpsrunnerConfig, action: ScheduleAction) -> Result<()> {
    let pool = opsrunner::storage::open_pool(&config.storage.db_path.to_string_lossy())?;
    let store = ScheduleStore::new(pool);

    match action {
        ScheduleAction::List => {
            let list = tokio::task::spawn_blocking(move || store.load_all()).await??;
            if list.is_empty() {
                println!("No schedules found.");
            } else {
                println!("{:<36} | {:<20} | {:<15} | Next run", "ID", "Name", "Cron");
                println!("{:-<36}-|-{:-<20}-|-{:-<15}-|-{:-<25}", "", "", "", "");
                for task in list {
                    let next = scheduler::parse_cron(&task.cron_expr)
                        .ok()
                        .and_then(|s| s.upcoming(Utc).next())
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<36} | {:<20} | {:<15} | {}", task.id, task.name, task.cron_expr, next);
                }
            }
        }
        ScheduleAction::Add {
            name,
            cron,
            template,
            argv,
        } => {
            let template = match template {
                Some(raw) => serde_json::from_str::<JobRequest>(&raw)
                    .context("failed to parse --template as a job request")?,
                None if !argv.is_empty() => JobRequest::command(argv, None),
                None => bail!("either --template or a command after `--` is required"),
            };
            let launcher = config.launcher();
            let parsed = scheduler::validate(&cron, &template, launcher.as_ref())?;
            let task = ScheduledTask {
                id: Uuid::new_v4().to_string(),
                name: name.trim().to_string(),
                cron_expr: cron.trim().to_string(),
                template,
                created_at: Utc::now(),
                last_run: None,
                next_run: parsed.upcoming(Utc).next(),
            };
            let row = task.clone();
            tokio::task::spawn_blocking(move || store.insert(&row)).await??;
            println!("Schedule '{}' added ({}).", task.name, task.id);
        }
        ScheduleAction::Remove { id } => {
            let key = id.clone();
            let removed = tokio::task::spawn_blocking(move || store.delete(&key)).await??;
            if !removed {
                bail!("schedule {} not found", id);
            }
            println!("Schedule '{}' removed.", id);
        }
        ScheduleAction::DryRun { hours } => {
            let tasks = tokio::task::spawn_blocking(move || store.load_all()).await??;
            let preview = scheduler::preview(&tasks, hours)?;
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} ({})", run.at.to_rfc3339(), run.name, run.schedule_id);
                }
            }
        }
    }
    Ok(())
}
