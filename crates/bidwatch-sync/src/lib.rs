//! Collection orchestration: strictly sequential per-listing fetch cycles,
//! catalog refresh, and cron scheduler wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bidwatch_core::{CatalogSummary, Ipo, RunSummary, SequentialSummary, Series};
use bidwatch_nse::{
    parse_catalog_payload, parse_mainboard_payload, parse_sme_payload, DelayRange, FetchError,
    NseClient, ParsedBids, UpstreamConfig,
};
use bidwatch_store::Store;
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "bidwatch-sync";

/// Hourly, in the seconds-resolution cron format the scheduler expects.
const DEFAULT_CRON: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Between listings within one run, letting upstream per-client
    /// rate-limit state decay before the next fresh session (8-12s).
    pub between_listings: DelayRange,
    /// Catalog-to-bids settling delay in the sequential refresh, so the
    /// collection step never reads a catalog mid-update.
    pub catalog_settle: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            between_listings: DelayRange::new(8_000, 12_000),
            catalog_settle: Duration::from_secs(30),
        }
    }
}

impl CollectorConfig {
    pub fn without_delays() -> Self {
        Self {
            between_listings: DelayRange::ZERO,
            catalog_settle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub catalog_cron: String,
    pub mainboard_cron: String,
    pub sme_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            catalog_cron: DEFAULT_CRON.to_string(),
            mainboard_cron: DEFAULT_CRON.to_string(),
            sme_cron: DEFAULT_CRON.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub upstream: UpstreamConfig,
    pub collector: CollectorConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut upstream = UpstreamConfig::default();
        if let Ok(base_url) = std::env::var("BIDWATCH_BASE_URL") {
            upstream.base_url = base_url;
        }
        if let Ok(user_agent) = std::env::var("BIDWATCH_USER_AGENT") {
            upstream.user_agent = user_agent;
        }
        Self {
            database_path: std::env::var("BIDWATCH_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./bidwatch.db")),
            upstream,
            collector: CollectorConfig::default(),
            scheduler: SchedulerConfig {
                enabled: std::env::var("BIDWATCH_SCHEDULER_ENABLED")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
                catalog_cron: std::env::var("BIDWATCH_CATALOG_CRON")
                    .unwrap_or_else(|_| DEFAULT_CRON.to_string()),
                mainboard_cron: std::env::var("BIDWATCH_MAINBOARD_CRON")
                    .unwrap_or_else(|_| DEFAULT_CRON.to_string()),
                sme_cron: std::env::var("BIDWATCH_SME_CRON")
                    .unwrap_or_else(|_| DEFAULT_CRON.to_string()),
            },
        }
    }
}

pub async fn collector_from_config(config: &AppConfig) -> Result<Collector> {
    let store = Store::connect(&config.database_path)
        .await
        .with_context(|| format!("opening store at {}", config.database_path.display()))?;
    let client = NseClient::with_reqwest(config.upstream.clone())
        .context("building upstream http client")?;
    Ok(Collector::new(store, client, config.collector.clone()))
}

pub struct Collector {
    store: Store,
    client: NseClient,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(store: Store, client: NseClient, config: CollectorConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One collection pass over the active listings of a series class.
    /// Listings are processed strictly sequentially, each with its own fresh
    /// session; failure at any listing is tallied without aborting the run.
    /// Never returns an error — run-level failure lands in the summary.
    pub async fn run_collection(&self, series: Series) -> RunSummary {
        let listings = match self.store.list_active(series).await {
            Ok(listings) => listings,
            Err(err) => {
                error!(%series, error = %err, "failed to read active listings");
                return RunSummary::failed(err.to_string());
            }
        };
        if listings.is_empty() {
            info!(%series, "no active listings to collect");
            return RunSummary::empty_ok();
        }

        info!(%series, listings = listings.len(), "starting bid collection");
        let mut summary = RunSummary::empty_ok();
        for ipo in &listings {
            match self.collect_listing(series, ipo).await {
                Ok(rows) => {
                    summary.count += 1;
                    info!(symbol = %ipo.symbol, rows, "listing processed");
                }
                Err(err) => {
                    summary.errors += 1;
                    warn!(symbol = %ipo.symbol, error = %err, "listing cycle failed");
                }
            }
            self.config.between_listings.sleep().await;
        }
        info!(%series, count = summary.count, errors = summary.errors, "bid collection finished");
        summary
    }

    async fn collect_listing(&self, series: Series, ipo: &Ipo) -> std::result::Result<usize, FetchError> {
        let payload = self.client.fetch_bids(series, &ipo.symbol).await?;
        let parsed: ParsedBids = match series {
            Series::Eq => parse_mainboard_payload(&ipo.symbol, &payload)?,
            Series::Sme => parse_sme_payload(&ipo.symbol, &payload)?,
        };

        let now = Utc::now().timestamp_millis();
        let mut stored = 0usize;
        let mut row_errors = parsed.row_errors;
        for record in &parsed.records {
            match self.store.upsert_bid_series(series, record, now).await {
                Ok(_) => stored += 1,
                Err(err) => {
                    row_errors += 1;
                    warn!(
                        symbol = %ipo.symbol,
                        category = %record.category,
                        error = %err,
                        "failed to persist bid row"
                    );
                }
            }
        }
        if row_errors > 0 {
            warn!(symbol = %ipo.symbol, row_errors, "rows skipped during merge");
        }
        Ok(stored)
    }

    /// Refresh the listing catalog from the upcoming-issues endpoint.
    /// Never returns an error — failure lands in the summary.
    pub async fn refresh_catalog(&self) -> CatalogSummary {
        let payload = match self.client.fetch_upcoming_catalog().await {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "catalog fetch failed");
                return CatalogSummary::failed(err.to_string());
            }
        };
        let parsed = match parse_catalog_payload(&payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(error = %err, "catalog payload rejected");
                return CatalogSummary::failed(err.to_string());
            }
        };

        let now = Utc::now().timestamp_millis();
        let mut summary = CatalogSummary {
            success: true,
            count: 0,
            errors: parsed.row_errors,
            total: parsed.total,
            error: None,
        };
        for draft in &parsed.drafts {
            match self.store.upsert_ipo(draft, now).await {
                Ok(()) => summary.count += 1,
                Err(err) => {
                    summary.errors += 1;
                    warn!(symbol = %draft.symbol, error = %err, "failed to persist listing");
                }
            }
        }
        info!(count = summary.count, errors = summary.errors, total = summary.total, "catalog refresh finished");
        summary
    }

    /// Catalog refresh, settling delay, then mainboard bid collection.
    pub async fn sequential_refresh(&self) -> SequentialSummary {
        let catalog = self.refresh_catalog().await;
        if !self.config.catalog_settle.is_zero() {
            tokio::time::sleep(self.config.catalog_settle).await;
        }
        let bids = self.run_collection(Series::Eq).await;
        SequentialSummary {
            success: catalog.success && bids.success,
            catalog,
            bids,
        }
    }
}

/// Build the cron scheduler with one job per collection task. Returns None
/// when scheduling is disabled.
pub async fn build_scheduler(
    collector: Arc<Collector>,
    config: &SchedulerConfig,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let catalog_collector = collector.clone();
    let catalog_job = Job::new_async(config.catalog_cron.as_str(), move |_uuid, _lock| {
        let collector = catalog_collector.clone();
        Box::pin(async move {
            let summary = collector.refresh_catalog().await;
            info!(
                success = summary.success,
                count = summary.count,
                errors = summary.errors,
                "scheduled catalog refresh finished"
            );
        })
    })
    .with_context(|| format!("creating catalog job for cron {}", config.catalog_cron))?;
    sched.add(catalog_job).await.context("adding catalog job")?;

    let mainboard_collector = collector.clone();
    let mainboard_job = Job::new_async(config.mainboard_cron.as_str(), move |_uuid, _lock| {
        let collector = mainboard_collector.clone();
        Box::pin(async move {
            let summary = collector.run_collection(Series::Eq).await;
            info!(
                success = summary.success,
                count = summary.count,
                errors = summary.errors,
                "scheduled mainboard collection finished"
            );
        })
    })
    .with_context(|| format!("creating mainboard job for cron {}", config.mainboard_cron))?;
    sched
        .add(mainboard_job)
        .await
        .context("adding mainboard job")?;

    let sme_collector = collector;
    let sme_job = Job::new_async(config.sme_cron.as_str(), move |_uuid, _lock| {
        let collector = sme_collector.clone();
        Box::pin(async move {
            let summary = collector.run_collection(Series::Sme).await;
            info!(
                success = summary.success,
                count = summary.count,
                errors = summary.errors,
                "scheduled SME collection finished"
            );
        })
    })
    .with_context(|| format!("creating SME job for cron {}", config.sme_cron))?;
    sched.add(sme_job).await.context("adding SME job")?;

    Ok(Some(sched))
}
