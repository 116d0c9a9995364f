use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rentwatch_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rentwatch")]
#[command(about = "Track rental listings and mirror them to a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, reconcile and sync once.
    Run,
    /// Crawl and reconcile the local store only.
    Crawl,
    /// Push pending creates and deactivations without crawling.
    Sync,
    /// Print store counters.
    Status,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} pages={} inserted={} created={} deactivated={} fetch_failures={} remote_failures={}",
                summary.run_id,
                summary.reconcile.pages,
                summary.reconcile.inserted,
                summary.sync.created,
                summary.sync.deactivated,
                summary.fetch_failures(),
                summary.remote_failures(),
            );
            if summary.is_total_fetch_failure() {
                bail!(
                    "no listing page could be fetched: {}",
                    summary.reconcile.fetch_error.unwrap_or_default()
                );
            }
        }
        Commands::Crawl => {
            let report = pipeline.crawl_once().await?;
            println!(
                "crawl complete: pages={} observed={} inserted={} deactivated={} completed={}",
                report.pages,
                report.observed,
                report.inserted,
                report.deactivated,
                report.completed(),
            );
            if report.is_total_fetch_failure() {
                bail!(
                    "no listing page could be fetched: {}",
                    report.fetch_error.unwrap_or_default()
                );
            }
        }
        Commands::Sync => {
            let report = pipeline.sync_once().await?;
            println!(
                "sync complete: created={} deactivated={} remote_failures={}",
                report.created,
                report.deactivated,
                report.remote_failures(),
            );
        }
        Commands::Status => {
            let stats = pipeline.stats().await?;
            println!(
                "listings: total={} active={} pending_create={} pending_deactivation={}",
                stats.total, stats.active, stats.pending_create, stats.pending_deactivation
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled, set RENTWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
