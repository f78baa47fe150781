use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use staysync_storage::{PgRecordStore, StoreLimits};
use staysync_sync::{maybe_build_scheduler, pipeline_from_config, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "staysync")]
#[command(about = "Reconcile short-stay calendar feeds into the reservation store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print its summary.
    Sync {
        /// Plan every change but issue no store writes.
        #[arg(long)]
        dry_run: bool,
        /// Removal safety horizon; overrides STAYSYNC_REMOVAL_HORIZON_DAYS.
        #[arg(long)]
        horizon_days: Option<u64>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP trigger surface.
    Serve,
    /// Run passes on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("staysync=info,staysync_sync=info,staysync_web=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        horizon_days: None,
    }) {
        Commands::Sync {
            dry_run,
            horizon_days,
        } => {
            let config = load_config(horizon_days, dry_run)?;
            let summary = pipeline_from_config(config).await?.run_once().await?;
            println!(
                "sync complete: run_id={} feeds={}/{} created={} updated={} reactivated={} superseded={} removed={} deferred={} review={} unresolved={} dry_run={}",
                summary.run_id,
                summary.feeds_succeeded,
                summary.feeds_total,
                summary.created,
                summary.updated,
                summary.reactivated,
                summary.superseded,
                summary.removed,
                summary.deferred.len(),
                summary.review.len(),
                summary.unresolved_writes.len(),
                summary.dry_run,
            );
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Migrate => {
            let database_url =
                std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgRecordStore::connect(&database_url, StoreLimits::default()).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline_from_config(SyncConfig::from_env()?).await?);
            let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            staysync_web::serve(pipeline, staysync_web::port_from_env()).await?;
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(pipeline_from_config(config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// Environment configuration with command-line overrides applied before validation.
fn load_config(horizon_days: Option<u64>, dry_run: bool) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_lookup(|key| match (key, horizon_days) {
        ("STAYSYNC_REMOVAL_HORIZON_DAYS", Some(days)) => Some(days.to_string()),
        _ => std::env::var(key).ok(),
    })?;
    if dry_run {
        config.dry_run = true;
    }
    Ok(config)
}
