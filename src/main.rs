//! # Rosterbell: scheduled HR notifications
//!
//! Usage:
//!   rosterbell run                      # Scheduler + delivery workers until Ctrl-C
//!   rosterbell tasks                    # List scheduled tasks and their next run
//!   rosterbell dispatch reminder        # One-off dispatch of a notification kind
//!   rosterbell drain                    # Deliver everything currently queued
//!   rosterbell prune-failed             # Drop old dead-letter rows
//!   rosterbell init-config              # Write the default config file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rosterbell_core::RosterbellConfig;
use rosterbell_core::types::NotificationKind;
use rosterbell_notify::{BroadcastHandle, Broadcaster, NotificationPipeline};
use rosterbell_scheduler::{SchedulerConfig, SchedulerEngine};

#[derive(Parser)]
#[command(
    name = "rosterbell",
    version,
    about = "🔔 Rosterbell: HR digests, reminders and escalations by email"
)]
struct Cli {
    /// Config file (default: ~/.rosterbell/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and delivery workers until Ctrl-C
    Run,
    /// List configured tasks and their next run time
    Tasks,
    /// Dispatch one notification kind now
    Dispatch {
        /// digest_daily, digest_weekly, reminder, overdue or escalation
        kind: String,
        /// Deliver the queued jobs right away
        #[arg(long)]
        drain: bool,
    },
    /// Deliver all claimable queued jobs
    Drain,
    /// Remove dead-letter records past the retention window
    PruneFailed,
    /// Write a config file with the default settings
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "rosterbell=debug,rosterbell_core=debug,rosterbell_scheduler=debug,rosterbell_notify=debug"
    } else {
        "rosterbell=info,rosterbell_core=info,rosterbell_scheduler=info,rosterbell_notify=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<RosterbellConfig> {
    let config = match &cli.config {
        Some(path) => RosterbellConfig::load_from(path),
        None => RosterbellConfig::load(),
    };
    let config = config.context("Failed to load config")?;
    SchedulerConfig::from_config(&config.scheduler).context("Invalid scheduled task")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match &cli.command {
        Command::InitConfig { force } => {
            let path = cli.config.clone().unwrap_or_else(RosterbellConfig::default_path);
            if path.exists() && !force {
                println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            RosterbellConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
        }

        Command::Tasks => {
            let config = load_config(&cli)?;
            let scheduler = SchedulerConfig::from_config(&config.scheduler)?;
            let noop = rosterbell_scheduler::handler_fn(|_| async { Ok::<(), String>(()) });
            let engine = SchedulerEngine::new(scheduler, noop);
            println!("⏰ {} scheduled task(s) (UTC):\n", engine.task_count());
            for (task, next) in engine.list_tasks() {
                let next = next
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "  {:<22} {:<20} next: {}  [{:?}, {:?}]",
                    task.name,
                    task.trigger.to_string(),
                    next,
                    task.overlap,
                    task.mode
                );
            }
        }

        Command::Dispatch { kind, drain } => {
            let kind: NotificationKind = kind.parse()?;
            let config = load_config(&cli)?;
            let pipeline =
                NotificationPipeline::from_config(&config, BroadcastHandle::disconnected())?;
            for report in pipeline.dispatch(&[kind], chrono::Utc::now()).await? {
                println!(
                    "📨 {}: {} due, {} queued, {} already notified today",
                    report.kind, report.due, report.enqueued, report.skipped
                );
            }
            if *drain {
                print_drain(&pipeline).await?;
            }
        }

        Command::Drain => {
            let config = load_config(&cli)?;
            let pipeline =
                NotificationPipeline::from_config(&config, BroadcastHandle::disconnected())?;
            print_drain(&pipeline).await?;
        }

        Command::PruneFailed => {
            let config = load_config(&cli)?;
            let pipeline =
                NotificationPipeline::from_config(&config, BroadcastHandle::disconnected())?;
            let pruned = pipeline.prune_failed(chrono::Utc::now())?;
            println!("🧹 Pruned {pruned} failed job(s)");
        }

        Command::Run => {
            let config = load_config(&cli)?;
            run(config).await?;
        }
    }

    Ok(())
}

async fn print_drain(pipeline: &NotificationPipeline) -> Result<()> {
    let report = pipeline.drain().await?;
    println!(
        "📬 {} delivered, {} retried, {} failed ({} recovered)",
        report.delivered, report.retried, report.failed, report.recovered
    );
    let stats = pipeline.queue().stats()?;
    println!(
        "   queue: {} queued, {} running, {} dead-lettered",
        stats.queued, stats.running, stats.failed
    );
    Ok(())
}

async fn run(config: RosterbellConfig) -> Result<()> {
    let broadcaster = Arc::new(Broadcaster::new(&config.broadcast));
    let (broadcast, broadcast_task) = broadcaster.start();

    let pipeline = Arc::new(NotificationPipeline::from_config(&config, broadcast)?);
    let scheduler = SchedulerConfig::from_config(&config.scheduler)?;
    let engine = SchedulerEngine::new(scheduler, pipeline.handler());

    for (task, next) in engine.list_tasks() {
        tracing::info!(
            "📋 {} [{}] next: {}",
            task.name,
            task.trigger,
            next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
        );
    }

    engine
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    // Last handle goes with the pipeline; the fan-out task then ends.
    drop(pipeline);
    if let Err(e) = broadcast_task.await {
        tracing::warn!("Broadcaster task ended abnormally: {e}");
    }
    tracing::info!("👋 Rosterbell stopped");
    Ok(())
}
