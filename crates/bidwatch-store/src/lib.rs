//! SQLite persistence for the listing catalog and bid time-series entities.

use std::path::Path;

use bidwatch_core::{
    summarize, BidCategoryRecord, BidSeriesEntity, BidSnapshot, BidSummary, Ipo, IpoDraft, Series,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-store";

// Upserts are a read-modify-write on the natural key; the single-connection
// pool plus a transaction keeps them atomic per key even across overlapping
// collection runs.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ipos (
        symbol TEXT PRIMARY KEY,
        company_name TEXT NOT NULL,
        series TEXT NOT NULL,
        issue_start_date TEXT NOT NULL,
        issue_end_date TEXT NOT NULL,
        status TEXT NOT NULL,
        issue_size TEXT NOT NULL,
        issue_price TEXT NOT NULL,
        sr_no INTEGER NOT NULL,
        is_bse TEXT,
        lot_size INTEGER,
        last_updated INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ipos_status ON ipos(status)",
    "CREATE INDEX IF NOT EXISTS idx_ipos_series ON ipos(series)",
    "CREATE INDEX IF NOT EXISTS idx_ipos_status_series ON ipos(status, series)",
    "CREATE INDEX IF NOT EXISTS idx_ipos_issue_start_date ON ipos(issue_start_date)",
    "CREATE TABLE IF NOT EXISTS bid_series (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL,
        category TEXT NOT NULL,
        sr_no TEXT NOT NULL,
        series TEXT NOT NULL,
        share_offered TEXT NOT NULL,
        metrics TEXT NOT NULL,
        update_time TEXT NOT NULL,
        last_updated INTEGER NOT NULL,
        UNIQUE(symbol, category, sr_no)
    )",
    "CREATE INDEX IF NOT EXISTS idx_bid_series_symbol ON bid_series(symbol)",
    "CREATE INDEX IF NOT EXISTS idx_bid_series_symbol_category ON bid_series(symbol, category)",
    "CREATE INDEX IF NOT EXISTS idx_bid_series_symbol_sr_no ON bid_series(symbol, sr_no)",
    "CREATE INDEX IF NOT EXISTS idx_bid_series_last_updated ON bid_series(last_updated)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Catalog counts by lifecycle label substring and series class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpoStats {
    pub total: usize,
    pub open: usize,
    pub upcoming: usize,
    pub closed: usize,
    pub mainboard: usize,
    pub sme: usize,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(":memory:")).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("store schema ready");
        Ok(Self { pool })
    }

    // --- catalog ---

    pub async fn upsert_ipo(&self, draft: &IpoDraft, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ipos (symbol, company_name, series, issue_start_date, issue_end_date,
                              status, issue_size, issue_price, sr_no, is_bse, lot_size, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(symbol) DO UPDATE SET
                company_name = excluded.company_name,
                series = excluded.series,
                issue_start_date = excluded.issue_start_date,
                issue_end_date = excluded.issue_end_date,
                status = excluded.status,
                issue_size = excluded.issue_size,
                issue_price = excluded.issue_price,
                sr_no = excluded.sr_no,
                is_bse = excluded.is_bse,
                lot_size = excluded.lot_size,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&draft.symbol)
        .bind(&draft.company_name)
        .bind(draft.series.as_str())
        .bind(&draft.issue_start_date)
        .bind(&draft.issue_end_date)
        .bind(&draft.status)
        .bind(&draft.issue_size)
        .bind(&draft.issue_price)
        .bind(draft.sr_no)
        .bind(&draft.is_bse)
        .bind(draft.lot_size)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_ipos(&self, status: Option<&str>, series: Option<Series>) -> Result<Vec<Ipo>> {
        let rows = match (status, series) {
            (Some(status), Some(series)) => {
                sqlx::query(
                    "SELECT * FROM ipos WHERE status = ?1 AND series = ?2 ORDER BY last_updated DESC",
                )
                .bind(status)
                .bind(series.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            (Some(status), None) => {
                sqlx::query("SELECT * FROM ipos WHERE status = ?1 ORDER BY last_updated DESC")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(series)) => {
                sqlx::query("SELECT * FROM ipos WHERE series = ?1 ORDER BY last_updated DESC")
                    .bind(series.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM ipos ORDER BY last_updated DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_ipo).collect()
    }

    /// Listings whose lifecycle label contains "active" (case-insensitive),
    /// restricted to one series class. Input set for collection runs.
    pub async fn list_active(&self, series: Series) -> Result<Vec<Ipo>> {
        let rows = sqlx::query(
            "SELECT * FROM ipos WHERE series = ?1 AND instr(lower(status), 'active') > 0
             ORDER BY last_updated DESC",
        )
        .bind(series.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ipo).collect()
    }

    pub async fn ipo_stats(&self) -> Result<IpoStats> {
        let rows = sqlx::query("SELECT status, series FROM ipos")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = IpoStats {
            total: rows.len(),
            open: 0,
            upcoming: 0,
            closed: 0,
            mainboard: 0,
            sme: 0,
        };
        for row in &rows {
            let status: String = row.try_get("status")?;
            let series: String = row.try_get("series")?;
            let status = status.to_lowercase();
            if status.contains("open") {
                stats.open += 1;
            }
            if status.contains("upcoming") {
                stats.upcoming += 1;
            }
            if status.contains("closed") {
                stats.closed += 1;
            }
            match Series::parse(&series) {
                Some(Series::Eq) => stats.mainboard += 1,
                Some(Series::Sme) => stats.sme += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    // --- bid time series ---

    /// Merge one normalized record into its `(symbol, category, sr_no)`
    /// entity, creating it on first sighting. Returns the stable entity id.
    pub async fn upsert_bid_series(
        &self,
        series: Series,
        record: &BidCategoryRecord,
        now: i64,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT * FROM bid_series WHERE symbol = ?1 AND category = ?2 AND sr_no = ?3",
        )
        .bind(&record.symbol)
        .bind(&record.category)
        .bind(&record.sr_no)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(row) => {
                let mut entity = row_to_entity(&row)?;
                entity.apply(record, now);
                sqlx::query(
                    "UPDATE bid_series
                     SET share_offered = ?1, metrics = ?2, update_time = ?3, last_updated = ?4
                     WHERE id = ?5",
                )
                .bind(&entity.share_offered)
                .bind(serde_json::to_string(&entity.metrics)?)
                .bind(&entity.update_time)
                .bind(entity.last_updated)
                .bind(entity.id.to_string())
                .execute(&mut *tx)
                .await?;
                entity.id
            }
            None => {
                let entity = BidSeriesEntity::first_sighting(series, record, now);
                sqlx::query(
                    "INSERT INTO bid_series (id, symbol, category, sr_no, series, share_offered,
                                             metrics, update_time, last_updated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .bind(entity.id.to_string())
                .bind(&entity.symbol)
                .bind(&entity.category)
                .bind(&entity.sr_no)
                .bind(entity.series.as_str())
                .bind(&entity.share_offered)
                .bind(serde_json::to_string(&entity.metrics)?)
                .bind(&entity.update_time)
                .bind(entity.last_updated)
                .execute(&mut *tx)
                .await?;
                entity.id
            }
        };
        tx.commit().await?;
        debug!(symbol = %record.symbol, category = %record.category, sr_no = %record.sr_no, "bid series upserted");
        Ok(id)
    }

    pub async fn entities_for_symbol(&self, symbol: &str) -> Result<Vec<BidSeriesEntity>> {
        let rows = sqlx::query(
            "SELECT * FROM bid_series WHERE symbol = ?1 ORDER BY category, sr_no",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn entities_for_symbol_category(
        &self,
        symbol: &str,
        category: &str,
    ) -> Result<Vec<BidSeriesEntity>> {
        let rows = sqlx::query(
            "SELECT * FROM bid_series WHERE symbol = ?1 AND category = ?2 ORDER BY sr_no",
        )
        .bind(symbol)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn entities_for_symbol_sr_no(
        &self,
        symbol: &str,
        sr_no: &str,
    ) -> Result<Vec<BidSeriesEntity>> {
        let rows = sqlx::query(
            "SELECT * FROM bid_series WHERE symbol = ?1 AND sr_no = ?2 ORDER BY category",
        )
        .bind(symbol)
        .bind(sr_no)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn recently_updated(&self, limit: i64) -> Result<Vec<BidSeriesEntity>> {
        let rows = sqlx::query("SELECT * FROM bid_series ORDER BY last_updated DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn latest_snapshots(&self, symbol: &str) -> Result<Vec<BidSnapshot>> {
        let entities = self.entities_for_symbol(symbol).await?;
        Ok(entities.iter().map(BidSeriesEntity::snapshot).collect())
    }

    pub async fn summary_for_symbol(&self, symbol: &str) -> Result<Option<BidSummary>> {
        let entities = self.entities_for_symbol(symbol).await?;
        Ok(summarize(&entities))
    }
}

fn row_to_ipo(row: &SqliteRow) -> Result<Ipo> {
    let series: String = row.try_get("series")?;
    Ok(Ipo {
        symbol: row.try_get("symbol")?,
        company_name: row.try_get("company_name")?,
        series: Series::parse(&series)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown series label {series:?}")))?,
        issue_start_date: row.try_get("issue_start_date")?,
        issue_end_date: row.try_get("issue_end_date")?,
        status: row.try_get("status")?,
        issue_size: row.try_get("issue_size")?,
        issue_price: row.try_get("issue_price")?,
        sr_no: row.try_get("sr_no")?,
        is_bse: row.try_get("is_bse")?,
        lot_size: row.try_get("lot_size")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn row_to_entity(row: &SqliteRow) -> Result<BidSeriesEntity> {
    let id: String = row.try_get("id")?;
    let series: String = row.try_get("series")?;
    let metrics: String = row.try_get("metrics")?;
    Ok(BidSeriesEntity {
        id: Uuid::parse_str(&id)
            .map_err(|err| StoreError::Corrupt(format!("bad entity id {id:?}: {err}")))?,
        symbol: row.try_get("symbol")?,
        category: row.try_get("category")?,
        sr_no: row.try_get("sr_no")?,
        series: Series::parse(&series)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown series label {series:?}")))?,
        share_offered: row.try_get("share_offered")?,
        metrics: serde_json::from_str(&metrics)?,
        update_time: row.try_get("update_time")?,
        last_updated: row.try_get("last_updated")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_core::{METRIC_SHARES_BID, SERIES_POINT_CAP, TOTAL_SR_NO};

    fn draft(symbol: &str, series: Series, status: &str) -> IpoDraft {
        IpoDraft {
            symbol: symbol.to_string(),
            company_name: format!("{symbol} Ltd"),
            series,
            issue_start_date: "01-Aug-2026".to_string(),
            issue_end_date: "08-Aug-2026".to_string(),
            status: status.to_string(),
            issue_size: "1200".to_string(),
            issue_price: "100-110".to_string(),
            sr_no: 1,
            is_bse: None,
            lot_size: Some(130),
        }
    }

    fn record(symbol: &str, category: &str, sr_no: &str, shares_bid: &str) -> BidCategoryRecord {
        BidCategoryRecord {
            symbol: symbol.to_string(),
            sr_no: sr_no.to_string(),
            category: category.to_string(),
            share_offered: "1000000".to_string(),
            shares_bid: shares_bid.to_string(),
            subscription_multiple: "0.5".to_string(),
            applications: None,
            update_time: "06-Aug-2026 10:00".to_string(),
        }
    }

    #[tokio::test]
    async fn ipo_upsert_is_keyed_by_symbol() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_ipo(&draft("ABCL", Series::Eq, "Active"), 1)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("ABCL", Series::Eq, "Closed"), 2)
            .await
            .unwrap();

        let all = store.list_ipos(None, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "Closed");
        assert_eq!(all[0].last_updated, 2);
    }

    #[tokio::test]
    async fn active_filter_is_case_insensitive_substring() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_ipo(&draft("AAA", Series::Eq, "Active"), 1)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("BBB", Series::Eq, "active now"), 2)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("CCC", Series::Eq, "Closed"), 3)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("DDD", Series::Sme, "Active"), 4)
            .await
            .unwrap();

        let active = store.list_active(Series::Eq).await.unwrap();
        let symbols: Vec<&str> = active.iter().map(|ipo| ipo.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBB", "AAA"]);
    }

    #[tokio::test]
    async fn bid_upsert_is_key_stable() {
        let store = Store::connect_in_memory().await.unwrap();
        let first = store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "100"), 10)
            .await
            .unwrap();
        let second = store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "200"), 20)
            .await
            .unwrap();
        assert_eq!(first, second);

        let entities = store.entities_for_symbol("ABCL").await.unwrap();
        assert_eq!(entities.len(), 1);
        let points = &entities[0].metrics[METRIC_SHARES_BID];
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, "200");
        assert_eq!(entities[0].last_updated, 20);
    }

    #[tokio::test]
    async fn distinct_keys_create_distinct_entities() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "100"), 10)
            .await
            .unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "Total", TOTAL_SR_NO, "100"), 10)
            .await
            .unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("XYZL", "QIB", "1", "100"), 10)
            .await
            .unwrap();

        assert_eq!(store.entities_for_symbol("ABCL").await.unwrap().len(), 2);
        assert_eq!(store.entities_for_symbol("XYZL").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn series_is_bounded_across_upserts() {
        let store = Store::connect_in_memory().await.unwrap();
        for i in 0..(SERIES_POINT_CAP as i64 + 5) {
            store
                .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "100"), i)
                .await
                .unwrap();
        }
        let entities = store.entities_for_symbol("ABCL").await.unwrap();
        let points = &entities[0].metrics[METRIC_SHARES_BID];
        assert_eq!(points.len(), SERIES_POINT_CAP);
        assert_eq!(points.first().unwrap().timestamp, 5);
    }

    #[tokio::test]
    async fn key_scoped_lookups_hit_each_index_path() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "100"), 10)
            .await
            .unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "RII", "2", "100"), 20)
            .await
            .unwrap();

        let by_category = store
            .entities_for_symbol_category("ABCL", "QIB")
            .await
            .unwrap();
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[0].category, "QIB");

        let by_sr_no = store.entities_for_symbol_sr_no("ABCL", "2").await.unwrap();
        assert_eq!(by_sr_no.len(), 1);
        assert_eq!(by_sr_no[0].category, "RII");

        let recent = store.recently_updated(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].last_updated, 20);
    }

    #[tokio::test]
    async fn snapshots_and_summary_follow_latest_points() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "100"), 10)
            .await
            .unwrap();
        store
            .upsert_bid_series(Series::Eq, &record("ABCL", "QIB", "1", "900"), 20)
            .await
            .unwrap();

        let snapshots = store.latest_snapshots("ABCL").await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].shares_bid, "900");

        let summary = store.summary_for_symbol("ABCL").await.unwrap().unwrap();
        assert_eq!(summary.total_shares_bid, 900.0);
        assert_eq!(summary.total_categories, 1);
        assert!(store.summary_for_symbol("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_count_lifecycle_labels() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .upsert_ipo(&draft("AAA", Series::Eq, "Open"), 1)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("BBB", Series::Sme, "Upcoming"), 2)
            .await
            .unwrap();
        store
            .upsert_ipo(&draft("CCC", Series::Eq, "Closed"), 3)
            .await
            .unwrap();

        let stats = store.ipo_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.upcoming, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.mainboard, 2);
        assert_eq!(stats.sme, 1);
    }
}
