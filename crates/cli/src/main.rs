//! `autopilot` console binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::info;

use autopilot_core::{Clock, TaskId};
use autopilot_engine::tasks::handlers::RECURRING_SCHEDULES;
use autopilot_engine::tasks::{NewTask, seed_tasks};
use autopilot_engine::{
    Autopilot, AutopilotConfig, RunExit, StopOutcome, Sweep, SweepReport, TickReport,
};

/// Autopilot: background task scheduling and execution for the CMS.
#[derive(Debug, Parser)]
#[command(name = "autopilot", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler loop (or a single tick with --once).
    Start {
        /// Take over even if another instance is recorded as running.
        #[arg(long)]
        force: bool,
        /// Run one tick and exit without marking the process running.
        #[arg(long)]
        once: bool,
    },

    /// Ask the running instance to stop.
    Stop,

    /// Print `running` or `stopped`.
    Status,

    /// Dispatch the recurring-schedule sweep through the task queue.
    #[command(name = "schedules:process-recurring")]
    ProcessRecurring,

    /// Publish due content and expire content past its unpublish time.
    #[command(name = "content:process-schedule")]
    ProcessContentSchedule,

    /// Dispatch scheduled exports that are due.
    #[command(name = "exports:process-scheduled")]
    ProcessScheduledExports,

    /// Delete analytics exports older than the configured retention.
    #[command(name = "analytics:cleanup-exports")]
    CleanupExports,

    /// Delete autosave versions older than the configured retention.
    #[command(name = "versions:cleanup-autosaves")]
    CleanupAutosaves,

    /// Delete content editing locks that have expired.
    #[command(name = "locks:cleanup-expired")]
    CleanupLocks,

    /// Create the built-in maintenance tasks if they are missing.
    #[command(name = "tasks:seed")]
    SeedTasks,

    /// Enqueue a task by name.
    #[command(name = "tasks:enqueue")]
    Enqueue {
        name: String,
        /// JSON object passed to the handler.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Print task counts per status.
    #[command(name = "tasks:stats")]
    Stats,

    /// List dead-lettered tasks.
    #[command(name = "tasks:list-dead")]
    ListDead {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Re-queue a dead task with a fresh attempt budget.
    #[command(name = "tasks:retry-dead")]
    RetryDead { id: TaskId },

    /// Delete finished tasks older than the configured retention.
    #[command(name = "tasks:purge")]
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AutopilotConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    autopilot_observability::init(config.log_format);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: AutopilotConfig) -> anyhow::Result<()> {
    // Without a database there is no recorded instance.
    if matches!(command, Command::Status) && config.database_url.is_none() {
        println!("stopped");
        return Ok(());
    }

    let stop_grace = Duration::from_secs(config.scheduler.stop_grace_secs);
    let app = Autopilot::connect(config)
        .await
        .context("failed to initialise autopilot")?;

    match command {
        Command::Start { force, once } if once => {
            let report = app.scheduler.run_once(&app.control, force).await?;
            print_tick(&report);
        }
        Command::Start { force, .. } => start(&app, force).await?,
        Command::Stop => match app.control.stop(stop_grace).await? {
            StopOutcome::Graceful => println!("autopilot stopped"),
            StopOutcome::Forced => println!(
                "autopilot did not stop within {}s; state reset to stopped",
                stop_grace.as_secs()
            ),
            StopOutcome::Superseded { owner } => println!(
                "autopilot was taken over by {} during stop; left running",
                owner.as_deref().unwrap_or("another instance")
            ),
        },
        Command::Status => {
            let state = app.control.status().await?;
            println!("{}", if state.running() { "running" } else { "stopped" });
        }
        Command::ProcessRecurring => {
            let now = app.sweep_ctx.clock.now();
            let task = app
                .tasks
                .enqueue(
                    NewTask::new(RECURRING_SCHEDULES, Value::Object(Default::default()))
                        .max_attempts(app.default_max_attempts()),
                    now,
                )
                .await?;
            println!("dispatched {RECURRING_SCHEDULES} task {}", task.id);
        }
        Command::ProcessContentSchedule => {
            sweep(&app, app.sweeps.content_publish.as_ref()).await?;
            sweep(&app, app.sweeps.content_expire.as_ref()).await?;
        }
        Command::ProcessScheduledExports => sweep(&app, app.sweeps.export_due.as_ref()).await?,
        Command::CleanupExports => sweep(&app, app.sweeps.analytics_retention.as_ref()).await?,
        Command::CleanupAutosaves => sweep(&app, app.sweeps.autosave_retention.as_ref()).await?,
        Command::CleanupLocks => sweep(&app, app.sweeps.expired_locks.as_ref()).await?,
        Command::Purge => sweep(&app, app.sweeps.task_retention.as_ref()).await?,
        Command::SeedTasks => {
            let now = app.sweep_ctx.clock.now();
            let report = seed_tasks(app.tasks.as_ref(), app.default_max_attempts(), now).await?;
            for (name, id) in &report.created {
                println!("created {name} ({id})");
            }
            for (name, id) in &report.existing {
                println!("exists  {name} ({id})");
            }
        }
        Command::Enqueue {
            name,
            payload,
            delay_secs,
            max_attempts,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let now = app.sweep_ctx.clock.now();
            let delay = chrono::Duration::seconds(i64::try_from(delay_secs).unwrap_or(i64::MAX));
            let task = NewTask::new(name, payload)
                .available_at(now.checked_add_signed(delay).unwrap_or(now))
                .max_attempts(max_attempts.unwrap_or(app.default_max_attempts()));
            let task = app.tasks.enqueue(task, now).await?;
            println!("enqueued {} ({}) available at {}", task.name, task.id, task.available_at);
        }
        Command::Stats => {
            let stats = app.tasks.stats().await?;
            println!("pending:          {}", stats.pending);
            println!("leased:           {}", stats.leased);
            println!("failed_retryable: {}", stats.failed_retryable);
            println!("succeeded:        {}", stats.succeeded);
            println!("dead:             {}", stats.dead);
            println!("total:            {}", stats.total());
        }
        Command::ListDead { limit } => {
            let dead = app.tasks.list_dead(limit).await?;
            if dead.is_empty() {
                println!("no dead tasks");
            }
            for task in dead {
                println!(
                    "{}  {}  attempts={}  error={}",
                    task.id,
                    task.name,
                    task.attempts,
                    task.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::RetryDead { id } => {
            let now = app.sweep_ctx.clock.now();
            let task = app.tasks.requeue_dead(id, now).await?;
            println!("requeued {} ({})", task.name, task.id);
        }
    }
    Ok(())
}

async fn start(app: &Autopilot, force: bool) -> anyhow::Result<()> {
    app.control.start(force).await?;

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
            signal.notify_one();
        }
    });

    match app.scheduler.run(&app.control, shutdown).await? {
        RunExit::StopRequested | RunExit::Shutdown => println!("autopilot stopped"),
        RunExit::Lost => println!("autopilot was taken over by another instance"),
    }
    Ok(())
}

async fn sweep(app: &Autopilot, sweep: &dyn Sweep) -> anyhow::Result<()> {
    let report = sweep.run(&app.sweep_ctx).await?;
    print_sweep(&report);
    Ok(())
}

fn print_sweep(report: &SweepReport) {
    if report.disabled {
        println!("{}: disabled, 0 deleted", report.sweep);
        return;
    }
    for item in &report.items {
        println!("  {}  {}", item.id, item.label);
    }
    println!(
        "{}: {} processed, {} skipped, {} errors, {} side-effect failures",
        report.sweep, report.applied, report.skipped, report.errors, report.effect_failures
    );
}

fn print_tick(report: &TickReport) {
    println!(
        "reclaimed {}, claimed {}: {} succeeded, {} retrying, {} dead",
        report.reclaimed,
        report.claimed,
        report.succeeded(),
        report.retried(),
        report.dead()
    );
    for sweep in &report.sweeps {
        if sweep.applied > 0 || sweep.errors > 0 {
            print_sweep(sweep);
        }
    }
    if report.sweep_failures > 0 {
        println!("{} sweeps failed", report.sweep_failures);
    }
}
