use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bidwatch_core::Series;
use bidwatch_sync::{build_scheduler, collector_from_config, AppConfig, SchedulerConfig};
use bidwatch_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "NSE IPO bid subscription collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the IPO catalog once
    Catalog,
    /// Run one bid collection pass for a series class
    Collect {
        #[arg(long, default_value = "EQ")]
        series: String,
    },
    /// Catalog refresh, settling delay, then mainboard bid collection
    Sequential,
    /// Serve the JSON API
    Serve,
    /// Run the cron scheduler until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let collector = Arc::new(collector_from_config(&config).await?);

    match cli.command.unwrap_or(Commands::Sequential) {
        Commands::Catalog => {
            let summary = collector.refresh_catalog().await;
            println!(
                "catalog refresh: success={} count={} errors={} total={}",
                summary.success, summary.count, summary.errors, summary.total
            );
        }
        Commands::Collect { series } => {
            let series = Series::parse(&series)
                .with_context(|| format!("unknown series {series:?} (expected EQ or SME)"))?;
            let summary = collector.run_collection(series).await;
            println!(
                "collection ({series}): success={} count={} errors={}",
                summary.success, summary.count, summary.errors
            );
        }
        Commands::Sequential => {
            let summary = collector.sequential_refresh().await;
            println!(
                "sequential refresh: success={} catalog_count={} bid_count={} bid_errors={}",
                summary.success, summary.catalog.count, summary.bids.count, summary.bids.errors
            );
        }
        Commands::Serve => {
            let state = AppState::new(collector.store().clone(), collector.clone());
            bidwatch_web::serve_from_env(state).await?;
        }
        Commands::Schedule => {
            let scheduler_config = SchedulerConfig {
                enabled: true,
                ..config.scheduler.clone()
            };
            let Some(mut scheduler) = build_scheduler(collector.clone(), &scheduler_config).await?
            else {
                bail!("scheduler did not start");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
