use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tenderwatch_notify::{Distributor, NotifyConfig};
use tenderwatch_storage::PgStore;
use tenderwatch_sync::{SyncConfig, SyncPipeline, TriggerRequest};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tenderwatch")]
#[command(about = "Tender ingestion pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once (or a single source with --source).
    Sync {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        source: Option<String>,
    },
    /// Work the scrape-job queue.
    Jobs {
        /// Queue one job per enabled source before working the queue.
        #[arg(long)]
        enqueue: bool,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Push recent, never-announced tenders to the configured channels.
    Distribute,
    /// Run the periodic sync until interrupted.
    Schedule,
    Serve,
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tenderwatch=debug"));
    let json = std::env::var("TENDERWATCH_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        source: None,
    }) {
        Commands::Sync { force, source } => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            let response = pipeline
                .trigger(TriggerRequest {
                    force,
                    source,
                    ..TriggerRequest::default()
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                bail!(
                    "sync failed: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Jobs { enqueue, limit } => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            if enqueue {
                let queued = pipeline.enqueue_sources().await?;
                info!(queued = queued.len(), "queued scrape jobs");
            }
            let summary = pipeline.run_pending_jobs(limit.max(1)).await?;
            println!(
                "jobs complete: completed={} failed={} already_claimed={}",
                summary.completed, summary.failed, summary.already_claimed
            );
        }
        Commands::Distribute => {
            let sync = SyncConfig::from_env();
            let notify = NotifyConfig::from_env();
            let store = PgStore::connect(&sync.database_url).await?;
            let distributor = Distributor::new(Arc::new(store), notify.build_notifiers()?);
            let since = Utc::now() - ChronoDuration::hours(notify.lookback_hours.max(1));
            let summary = distributor.sweep(since, notify.sweep_limit.max(1)).await?;
            println!(
                "distribution complete: tenders={} sent={} failed={} already_sent={}",
                summary.tenders, summary.sent, summary.failed, summary.already_sent
            );
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            };
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                every_hours = pipeline.config().schedule_interval_hours,
                "periodic sync running; press ctrl-c to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            tenderwatch_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
