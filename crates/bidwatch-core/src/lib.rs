//! Core domain model for bidwatch: catalog listings, normalized bid
//! category records, and bounded time-series entities.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-core";

/// Maximum retained points per metric series. Once exceeded, the oldest
/// points are evicted first.
pub const SERIES_POINT_CAP: usize = 100;

/// Reserved row ordinal for the aggregate "Total" category row, distinct
/// from every ordinary upstream ordinal.
pub const TOTAL_SR_NO: &str = "0";

pub const METRIC_SHARES_BID: &str = "shares_bid";
pub const METRIC_SUBSCRIPTION: &str = "subscription_multiple";
pub const METRIC_APPLICATIONS: &str = "applications";

/// Offering series class. The two classes use different upstream endpoints
/// and payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Series {
    #[serde(rename = "EQ")]
    Eq,
    #[serde(rename = "SME")]
    Sme,
}

impl Series {
    pub fn as_str(&self) -> &'static str {
        match self {
            Series::Eq => "EQ",
            Series::Sme => "SME",
        }
    }

    pub fn parse(label: &str) -> Option<Series> {
        match label.trim().to_ascii_uppercase().as_str() {
            "EQ" => Some(Series::Eq),
            "SME" => Some(Series::Sme),
            _ => None,
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked public offering from the exchange catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipo {
    pub symbol: String,
    pub company_name: String,
    pub series: Series,
    pub issue_start_date: String,
    pub issue_end_date: String,
    pub status: String,
    pub issue_size: String,
    pub issue_price: String,
    pub sr_no: i64,
    pub is_bse: Option<String>,
    pub lot_size: Option<i64>,
    pub last_updated: i64,
}

/// Upsert argument shape for catalog listings; `last_updated` is stamped by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoDraft {
    pub symbol: String,
    pub company_name: String,
    pub series: Series,
    pub issue_start_date: String,
    pub issue_end_date: String,
    pub status: String,
    pub issue_size: String,
    pub issue_price: String,
    pub sr_no: i64,
    pub is_bse: Option<String>,
    pub lot_size: Option<i64>,
}

/// Normalized snapshot of subscription demand for one category of one
/// listing at one point in time. `(symbol, category, sr_no)` is the natural
/// key; the aggregate Total row carries [`TOTAL_SR_NO`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidCategoryRecord {
    pub symbol: String,
    pub sr_no: String,
    pub category: String,
    pub share_offered: String,
    pub shares_bid: String,
    pub subscription_multiple: String,
    pub applications: Option<String>,
    pub update_time: String,
}

/// One sample in a metric series: the normalized value string and the
/// collection timestamp in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub value: String,
    pub timestamp: i64,
}

/// Durable per-(listing, category, row) aggregate accumulating bounded
/// historical data points per metric. Created on first sighting of its key,
/// mutated by every subsequent matching fetch cycle, never deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSeriesEntity {
    pub id: Uuid,
    pub symbol: String,
    pub category: String,
    pub sr_no: String,
    pub series: Series,
    pub share_offered: String,
    pub metrics: BTreeMap<String, Vec<SeriesPoint>>,
    pub update_time: String,
    pub last_updated: i64,
}

impl BidSeriesEntity {
    /// Create the entity for a key seen for the first time; every metric
    /// starts as a single-point sequence.
    pub fn first_sighting(series: Series, record: &BidCategoryRecord, now: i64) -> Self {
        let mut entity = Self {
            id: Uuid::new_v4(),
            symbol: record.symbol.clone(),
            category: record.category.clone(),
            sr_no: record.sr_no.clone(),
            series,
            share_offered: String::new(),
            metrics: BTreeMap::new(),
            update_time: String::new(),
            last_updated: now,
        };
        entity.apply(record, now);
        entity
    }

    /// Merge one fetch cycle into the entity: append a point per metric,
    /// overwrite the scalar fields with the latest values, bump
    /// `last_updated`.
    pub fn apply(&mut self, record: &BidCategoryRecord, now: i64) {
        push_point(
            self.metrics.entry(METRIC_SHARES_BID.to_string()).or_default(),
            &record.shares_bid,
            now,
        );
        push_point(
            self.metrics
                .entry(METRIC_SUBSCRIPTION.to_string())
                .or_default(),
            &record.subscription_multiple,
            now,
        );
        if let Some(applications) = &record.applications {
            push_point(
                self.metrics
                    .entry(METRIC_APPLICATIONS.to_string())
                    .or_default(),
                applications,
                now,
            );
        }
        self.share_offered = record.share_offered.clone();
        self.update_time = record.update_time.clone();
        self.last_updated = now;
    }

    pub fn latest(&self, metric: &str) -> Option<&SeriesPoint> {
        self.metrics.get(metric).and_then(|points| points.last())
    }

    fn latest_value(&self, metric: &str) -> String {
        self.latest(metric)
            .map(|point| point.value.clone())
            .unwrap_or_else(|| "0".to_string())
    }

    /// The flat "latest snapshot" shape is a view derived from the series
    /// tail, not a second independently written record.
    pub fn snapshot(&self) -> BidSnapshot {
        BidSnapshot {
            symbol: self.symbol.clone(),
            category: self.category.clone(),
            sr_no: self.sr_no.clone(),
            series: self.series,
            share_offered: self.share_offered.clone(),
            shares_bid: self.latest_value(METRIC_SHARES_BID),
            subscription_multiple: self.latest_value(METRIC_SUBSCRIPTION),
            applications: self
                .metrics
                .get(METRIC_APPLICATIONS)
                .and_then(|points| points.last())
                .map(|point| point.value.clone()),
            update_time: self.update_time.clone(),
            last_updated: self.last_updated,
        }
    }
}

fn push_point(points: &mut Vec<SeriesPoint>, value: &str, timestamp: i64) {
    points.push(SeriesPoint {
        value: value.to_string(),
        timestamp,
    });
    if points.len() > SERIES_POINT_CAP {
        let excess = points.len() - SERIES_POINT_CAP;
        points.drain(..excess);
    }
}

/// Latest-point view over a [`BidSeriesEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSnapshot {
    pub symbol: String,
    pub category: String,
    pub sr_no: String,
    pub series: Series,
    pub share_offered: String,
    pub shares_bid: String,
    pub subscription_multiple: String,
    pub applications: Option<String>,
    pub update_time: String,
    pub last_updated: i64,
}

/// Per-symbol demand summary computed from latest series points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidSummary {
    pub symbol: String,
    pub series: Series,
    pub total_categories: usize,
    pub total_shares_offered: f64,
    pub total_shares_bid: f64,
    pub total_applications: Option<f64>,
    pub overall_subscription: f64,
    pub update_time: String,
    pub last_updated: i64,
}

/// Summarize a symbol's entities. When entities exist under both series
/// classes the mainboard subset wins; SME is used only when no mainboard
/// entities are present.
pub fn summarize(entities: &[BidSeriesEntity]) -> Option<BidSummary> {
    let preferred = if entities.iter().any(|e| e.series == Series::Eq) {
        Series::Eq
    } else {
        Series::Sme
    };
    let selected: Vec<&BidSeriesEntity> = entities
        .iter()
        .filter(|e| e.series == preferred)
        .collect();
    let first = selected.first()?;

    let total_shares_offered: f64 = selected
        .iter()
        .filter_map(|e| e.share_offered.parse::<f64>().ok())
        .sum();
    let total_shares_bid: f64 = selected
        .iter()
        .filter_map(|e| e.latest_value(METRIC_SHARES_BID).parse::<f64>().ok())
        .sum();
    let has_applications = selected
        .iter()
        .any(|e| e.metrics.contains_key(METRIC_APPLICATIONS));
    let total_applications = has_applications.then(|| {
        selected
            .iter()
            .filter_map(|e| e.latest_value(METRIC_APPLICATIONS).parse::<f64>().ok())
            .sum()
    });
    let overall_subscription = if total_shares_offered > 0.0 {
        total_shares_bid / total_shares_offered
    } else {
        0.0
    };

    Some(BidSummary {
        symbol: first.symbol.clone(),
        series: preferred,
        total_categories: selected.len(),
        total_shares_offered,
        total_shares_bid,
        total_applications,
        overall_subscription,
        update_time: first.update_time.clone(),
        last_updated: selected.iter().map(|e| e.last_updated).max().unwrap_or(0),
    })
}

/// Outcome of one bid-collection run. `count` tallies listings fully
/// processed, `errors` tallies listings whose cycle failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub count: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn empty_ok() -> Self {
        Self {
            success: true,
            count: 0,
            errors: 0,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            count: 0,
            errors: 0,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one catalog refresh. `total` is the upstream row count before
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSummary {
    pub success: bool,
    pub count: usize,
    pub errors: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CatalogSummary {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            count: 0,
            errors: 0,
            total: 0,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a catalog-then-bids sequential refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequentialSummary {
    pub success: bool,
    pub catalog: CatalogSummary,
    pub bids: RunSummary,
}
