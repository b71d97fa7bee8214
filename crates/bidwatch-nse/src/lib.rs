//! NSE upstream layer: browser-like session bootstrap, resilient data fetch
//! with a single degraded-header retry, and payload normalization for the
//! mainboard, SME, and upcoming-issues payload shapes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bidwatch_core::{BidCategoryRecord, IpoDraft, Series, TOTAL_SR_NO};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bidwatch-nse";

pub const DEFAULT_BASE_URL: &str = "https://www.nseindia.com";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Row ordinals the upstream emits for header rows, including the mangled
/// markdown variant seen in live payloads.
const SR_NO_PLACEHOLDERS: &[&str] = &["Sr.No.", "[Sr.No](http://sr.no/)."];

const BODY_EXCERPT_CHARS: usize = 200;

/// Randomized delay bounds for one suspension point, in milliseconds.
/// Tests substitute [`DelayRange::ZERO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange { min_ms: 0, max_ms: 0 };

    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    fn sample_ms(&self) -> u64 {
        if self.max_ms <= self.min_ms {
            self.min_ms
        } else {
            // Sampled outside any await point; thread_rng is not Send.
            rand::Rng::gen_range(&mut rand::thread_rng(), self.min_ms..=self.max_ms)
        }
    }

    pub async fn sleep(&self) {
        let ms = self.sample_ms();
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Between the site-root visit and the content page (3-5s).
    pub warmup_delay: DelayRange,
    /// Between the content page and the data request (4-6s).
    pub data_delay: DelayRange,
    /// Before the single degraded-header retry after a 403 (7-10s).
    pub retry_delay: DelayRange,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            warmup_delay: DelayRange::new(3_000, 5_000),
            data_delay: DelayRange::new(4_000, 6_000),
            retry_delay: DelayRange::new(7_000, 10_000),
        }
    }
}

impl UpstreamConfig {
    pub fn without_delays(mut self) -> Self {
        self.warmup_delay = DelayRange::ZERO;
        self.data_delay = DelayRange::ZERO;
        self.retry_delay = DelayRange::ZERO;
        self
    }
}

#[derive(Debug, Error)]
#[error("network error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub set_cookies: Vec<String>,
    pub body: String,
}

/// Seam between the fetch policy and the wire so the retry and bootstrap
/// paths are exercisable with a scripted transport.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        let body = response.text().await?;
        Ok(TransportResponse {
            status,
            set_cookies,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("session bootstrap failed: {0}")]
    Session(#[source] TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("http {status}: {body_excerpt}")]
    Status { status: u16, body_excerpt: String },
    #[error("rate limited: 403 on first attempt, {retry_status} on retry")]
    RetryExhausted { retry_status: u16 },
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Opaque session context accumulated by the bootstrap sequence, good for
/// one data request. Never reused across listings.
#[derive(Debug, Clone)]
pub struct NseSession {
    pub cookie_header: String,
    pub referer: String,
}

pub struct NseClient {
    transport: Arc<dyn HttpTransport>,
    config: UpstreamConfig,
}

impl NseClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: UpstreamConfig) -> Self {
        Self { transport, config }
    }

    pub fn with_reqwest(config: UpstreamConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(Duration::from_secs(30))?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Scripted warm-up: visit the site root, wait, visit the given content
    /// page with the root as referer, accumulating cookies from both. Any
    /// transport failure here is fatal for the caller's cycle; non-2xx page
    /// statuses are logged and tolerated.
    pub async fn establish_session(&self, content_path: &str) -> Result<NseSession, FetchError> {
        let ua = &self.config.user_agent;
        let root = self.config.base_url.as_str();

        let response = self
            .transport
            .get(root, &homepage_headers(ua))
            .await
            .map_err(FetchError::Session)?;
        debug!(status = response.status, "site root visited");
        let mut cookie_header = String::new();
        merge_cookies(&mut cookie_header, extract_cookies(&response.set_cookies));

        self.config.warmup_delay.sleep().await;

        let content_url = format!("{root}{content_path}");
        let response = self
            .transport
            .get(
                &content_url,
                &content_page_headers(ua, root, &cookie_header),
            )
            .await
            .map_err(FetchError::Session)?;
        debug!(status = response.status, url = %content_url, "content page visited");
        merge_cookies(&mut cookie_header, extract_cookies(&response.set_cookies));

        Ok(NseSession {
            cookie_header,
            referer: content_url,
        })
    }

    /// Issue the data request with the bootstrapped session and classify the
    /// response. A 403 earns exactly one retry with degraded headers after a
    /// longer backoff; there is no retry of the retry.
    pub async fn fetch_json(
        &self,
        session: &NseSession,
        api_path: &str,
    ) -> Result<Value, FetchError> {
        self.config.data_delay.sleep().await;
        let ua = &self.config.user_agent;
        let url = format!("{}{}", self.config.base_url, api_path);

        let response = self
            .transport
            .get(
                &url,
                &xhr_headers(ua, &session.referer, &session.cookie_header),
            )
            .await?;
        if is_success(response.status) {
            return parse_body(&response.body);
        }
        if response.status != 403 {
            return Err(FetchError::Status {
                status: response.status,
                body_excerpt: excerpt(&response.body),
            });
        }

        warn!(url = %url, "got 403, retrying once with degraded headers");
        self.config.retry_delay.sleep().await;
        let retry = self
            .transport
            .get(
                &url,
                &minimal_headers(ua, &session.referer, &session.cookie_header),
            )
            .await?;
        if is_success(retry.status) {
            debug!(url = %url, "retry succeeded");
            return parse_body(&retry.body);
        }
        Err(FetchError::RetryExhausted {
            retry_status: retry.status,
        })
    }

    /// Full bootstrap + fetch cycle for one mainboard listing.
    pub async fn fetch_mainboard_bids(&self, symbol: &str) -> Result<Value, FetchError> {
        let session = self
            .establish_session(&issue_page_path(symbol, Series::Eq))
            .await?;
        self.fetch_json(&session, &format!("/api/ipo-active-category?symbol={symbol}"))
            .await
    }

    /// Full bootstrap + fetch cycle for one SME listing.
    pub async fn fetch_sme_bids(&self, symbol: &str) -> Result<Value, FetchError> {
        let session = self
            .establish_session(&issue_page_path(symbol, Series::Sme))
            .await?;
        self.fetch_json(
            &session,
            &format!("/api/ipo-detail?symbol={symbol}&series=SME"),
        )
        .await
    }

    pub async fn fetch_bids(&self, series: Series, symbol: &str) -> Result<Value, FetchError> {
        match series {
            Series::Eq => self.fetch_mainboard_bids(symbol).await,
            Series::Sme => self.fetch_sme_bids(symbol).await,
        }
    }

    /// Full bootstrap + fetch cycle for the upcoming-issues catalog.
    pub async fn fetch_upcoming_catalog(&self) -> Result<Value, FetchError> {
        let session = self
            .establish_session("/market-data/all-upcoming-issues-ipo")
            .await?;
        self.fetch_json(&session, "/api/all-upcoming-issues?category=ipo")
            .await
    }
}

fn issue_page_path(symbol: &str, series: Series) -> String {
    format!("/market-data/issue-information?symbol={symbol}&series={series}&type=Active")
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn parse_body(body: &str) -> Result<Value, FetchError> {
    serde_json::from_str(body).map_err(|err| FetchError::Payload(err.to_string()))
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}

fn extract_cookies(set_cookies: &[String]) -> Vec<String> {
    set_cookies
        .iter()
        .filter_map(|raw| raw.split(';').next())
        .map(|pair| pair.trim().to_string())
        .filter(|pair| !pair.is_empty())
        .collect()
}

fn merge_cookies(jar: &mut String, fresh: Vec<String>) {
    for cookie in fresh {
        if jar.is_empty() {
            jar.push_str(&cookie);
        } else {
            jar.push_str("; ");
            jar.push_str(&cookie);
        }
    }
}

fn homepage_headers(user_agent: &str) -> Vec<(&'static str, String)> {
    vec![
        ("User-Agent", user_agent.to_string()),
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7".to_string()),
        ("Accept-Language", "en-US,en;q=0.9".to_string()),
        ("DNT", "1".to_string()),
        ("Connection", "keep-alive".to_string()),
        ("Upgrade-Insecure-Requests", "1".to_string()),
        ("Sec-Fetch-Dest", "document".to_string()),
        ("Sec-Fetch-Mode", "navigate".to_string()),
        ("Sec-Fetch-Site", "none".to_string()),
        ("Cache-Control", "max-age=0".to_string()),
    ]
}

fn content_page_headers(
    user_agent: &str,
    referer: &str,
    cookies: &str,
) -> Vec<(&'static str, String)> {
    let mut headers = homepage_headers(user_agent);
    for header in headers.iter_mut() {
        if header.0 == "Sec-Fetch-Site" {
            header.1 = "same-origin".to_string();
        }
    }
    headers.push(("Referer", referer.to_string()));
    if !cookies.is_empty() {
        headers.push(("Cookie", cookies.to_string()));
    }
    headers
}

fn xhr_headers(user_agent: &str, referer: &str, cookies: &str) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Referer", referer.to_string()),
        ("User-Agent", user_agent.to_string()),
        ("Accept", "application/json, text/javascript, */*; q=0.01".to_string()),
        ("Accept-Language", "en-US,en;q=0.9".to_string()),
        ("X-Requested-With", "XMLHttpRequest".to_string()),
        ("DNT", "1".to_string()),
        ("Connection", "keep-alive".to_string()),
        ("Sec-Fetch-Dest", "empty".to_string()),
        ("Sec-Fetch-Mode", "cors".to_string()),
        ("Sec-Fetch-Site", "same-origin".to_string()),
        ("sec-ch-ua", "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"".to_string()),
        ("sec-ch-ua-mobile", "?0".to_string()),
        ("sec-ch-ua-platform", "\"Windows\"".to_string()),
    ];
    if !cookies.is_empty() {
        headers.push(("Cookie", cookies.to_string()));
    }
    headers
}

fn minimal_headers(user_agent: &str, referer: &str, cookies: &str) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("User-Agent", user_agent.to_string()),
        ("Referer", referer.to_string()),
        ("Accept", "*/*".to_string()),
    ];
    if !cookies.is_empty() {
        headers.push(("Cookie", cookies.to_string()));
    }
    headers
}

// --- payload normalization ---

/// Normalized rows from one bid payload plus the count of rows that failed
/// individually.
#[derive(Debug)]
pub struct ParsedBids {
    pub records: Vec<BidCategoryRecord>,
    pub row_errors: usize,
    pub update_time: String,
}

/// Normalized catalog drafts plus per-row error and raw totals.
#[derive(Debug)]
pub struct ParsedCatalog {
    pub drafts: Vec<IpoDraft>,
    pub row_errors: usize,
    pub total: usize,
}

/// Canonical rendering for upstream numeric strings. Missing values become
/// `"0"`, scientific notation expands to a fixed-point integer, whole
/// numbers render without decimals, fractions round to 3 decimals, and
/// non-numeric strings pass through trimmed. Idempotent.
pub fn format_numeric_value(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "0".to_string();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "0".to_string();
    }
    let Ok(num) = trimmed.parse::<f64>() else {
        return trimmed.to_string();
    };
    if trimmed.to_ascii_lowercase().contains('e') {
        return format!("{num:.0}");
    }
    if num.fract() == 0.0 {
        format!("{num}")
    } else {
        format!("{num:.3}")
    }
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A row is data-bearing if it has a non-placeholder ordinal, or is the
/// aggregate Total row (no ordinal, category "total"), which gets the
/// reserved sentinel ordinal. Returns the effective ordinal, or None for
/// header/footer artifacts.
fn effective_sr_no(row: &Value) -> Option<String> {
    let sr_no = value_as_string(row.get("srNo"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    match sr_no {
        Some(ordinal) if !SR_NO_PLACEHOLDERS.contains(&ordinal.as_str()) => Some(ordinal),
        Some(_) => None,
        None => {
            let category = value_as_string(row.get("category"))?;
            category
                .trim()
                .eq_ignore_ascii_case("total")
                .then(|| TOTAL_SR_NO.to_string())
        }
    }
}

fn numeric_field(row: &Value, field: &str) -> String {
    format_numeric_value(value_as_string(row.get(field)).as_deref())
}

/// Normalize the mainboard bid payload: `{ dataList: [...], updateTime }`.
/// A missing or non-array `dataList` fails the whole batch; a malformed row
/// fails only that row.
pub fn parse_mainboard_payload(symbol: &str, payload: &Value) -> Result<ParsedBids, FetchError> {
    let data_list = payload
        .get("dataList")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Payload("missing or non-array dataList".to_string()))?;
    let update_time = payload
        .get("updateTime")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut records = Vec::new();
    let mut row_errors = 0usize;
    for row in data_list {
        if !row.is_object() {
            warn!(symbol, "skipping malformed bid row");
            row_errors += 1;
            continue;
        }
        let Some(sr_no) = effective_sr_no(row) else {
            continue;
        };
        records.push(BidCategoryRecord {
            symbol: symbol.to_string(),
            sr_no,
            category: value_as_string(row.get("category")).unwrap_or_default(),
            share_offered: numeric_field(row, "noOfShareOffered"),
            shares_bid: numeric_field(row, "noOfSharesBid"),
            subscription_multiple: numeric_field(row, "noOfTotalMeant"),
            applications: None,
            update_time: update_time.clone(),
        });
    }
    Ok(ParsedBids {
        records,
        row_errors,
        update_time,
    })
}

/// Normalize the SME bid payload: category rows under `activeCat.dataList`
/// joined by category against `bidDetails` for the application count, which
/// defaults to `"0"` when no matching category exists.
pub fn parse_sme_payload(symbol: &str, payload: &Value) -> Result<ParsedBids, FetchError> {
    let active_cat = payload
        .get("activeCat")
        .ok_or_else(|| FetchError::Payload("missing activeCat section".to_string()))?;
    let data_list = active_cat
        .get("dataList")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Payload("missing or non-array activeCat.dataList".to_string()))?;
    let bid_details = payload
        .get("bidDetails")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Payload("missing or non-array bidDetails".to_string()))?;
    let update_time = active_cat
        .get("updateTime")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut applications_by_category: HashMap<String, Option<String>> = HashMap::new();
    for bid in bid_details {
        if let Some(category) = value_as_string(bid.get("category")) {
            applications_by_category.insert(category, value_as_string(bid.get("noofapplication")));
        }
    }

    let mut records = Vec::new();
    let mut row_errors = 0usize;
    for row in data_list {
        if !row.is_object() {
            warn!(symbol, "skipping malformed SME bid row");
            row_errors += 1;
            continue;
        }
        let Some(sr_no) = effective_sr_no(row) else {
            continue;
        };
        let category = value_as_string(row.get("category")).unwrap_or_default();
        let applications = applications_by_category
            .get(&category)
            .cloned()
            .flatten();
        records.push(BidCategoryRecord {
            symbol: symbol.to_string(),
            sr_no,
            category,
            share_offered: numeric_field(row, "noOfShareOffered"),
            shares_bid: numeric_field(row, "noOfSharesBid"),
            subscription_multiple: numeric_field(row, "noOfTotalMeant"),
            applications: Some(format_numeric_value(applications.as_deref())),
            update_time: update_time.clone(),
        });
    }
    Ok(ParsedBids {
        records,
        row_errors,
        update_time,
    })
}

fn clean_string(value: Option<String>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let mut cleaned = value;
    if cleaned.len() >= 2 && cleaned.starts_with('"') && cleaned.ends_with('"') {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }
    cleaned.replace("\\\"", "\"").trim().to_string()
}

/// Normalize the upcoming-issues catalog payload. The listing array lives at
/// `data` or at the root; rows without a symbol and company name are counted
/// as errors and skipped.
pub fn parse_catalog_payload(payload: &Value) -> Result<ParsedCatalog, FetchError> {
    let list = payload
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array())
        .ok_or_else(|| FetchError::Payload("expected array of listings".to_string()))?;

    let mut drafts = Vec::new();
    let mut row_errors = 0usize;
    for row in list {
        let symbol = clean_string(value_as_string(row.get("symbol")));
        let company_name = clean_string(value_as_string(row.get("companyName")));
        if symbol.is_empty() || company_name.is_empty() {
            warn!("skipping catalog row with missing symbol or company name");
            row_errors += 1;
            continue;
        }
        let series = Series::parse(&clean_string(value_as_string(row.get("series"))))
            .unwrap_or(Series::Eq);
        let status = match clean_string(value_as_string(row.get("status"))) {
            s if s.is_empty() => "Unknown".to_string(),
            s => s,
        };
        let sr_no = match row.get("sr_no") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => clean_string(Some(s.clone())).parse().unwrap_or(0),
            _ => 0,
        };
        let lot_size = value_as_string(row.get("lotSize")).and_then(|raw| {
            let digits: String = clean_string(Some(raw))
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<i64>().ok()
        });
        drafts.push(IpoDraft {
            symbol,
            company_name,
            series,
            issue_start_date: clean_string(value_as_string(row.get("issueStartDate"))),
            issue_end_date: clean_string(value_as_string(row.get("issueEndDate"))),
            status,
            issue_size: clean_string(value_as_string(row.get("issueSize"))),
            issue_price: clean_string(value_as_string(row.get("issuePrice"))),
            sr_no,
            is_bse: value_as_string(row.get("isBse")),
            lot_size,
        });
    }
    Ok(ParsedCatalog {
        drafts,
        row_errors,
        total: list.len(),
    })
}

// --- scripted transport ---

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub header_names: Vec<&'static str>,
    pub cookie: Option<String>,
}

/// Canned-response transport for exercising the bootstrap and retry paths
/// without touching the network. Responses are served in push order.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: TransportResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_html(&self, set_cookies: &[&str]) {
        self.push(TransportResponse {
            status: 200,
            set_cookies: set_cookies.iter().map(|s| s.to_string()).collect(),
            body: "<html></html>".to_string(),
        });
    }

    pub fn push_json(&self, body: &str) {
        self.push(TransportResponse {
            status: 200,
            set_cookies: Vec::new(),
            body: body.to_string(),
        });
    }

    pub fn push_status(&self, status: u16, body: &str) {
        self.push(TransportResponse {
            status,
            set_cookies: Vec::new(),
            body: body.to_string(),
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            header_names: headers.iter().map(|(name, _)| *name).collect(),
            cookie: headers
                .iter()
                .find(|(name, _)| *name == "Cookie")
                .map(|(_, value)| value.clone()),
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::new(format!("no scripted response for {url}")))
    }
}
