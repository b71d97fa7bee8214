//! Axum JSON surface: catalog and bid read endpoints plus the manual
//! collection triggers used by operators and the scheduler alike.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bidwatch_core::Series;
use bidwatch_store::Store;
use bidwatch_sync::Collector;
use serde::Deserialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "bidwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub collector: Arc<Collector>,
}

impl AppState {
    pub fn new(store: Store, collector: Arc<Collector>) -> Self {
        Self { store, collector }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ipos", get(list_ipos_handler))
        .route("/api/ipos/stats", get(ipo_stats_handler))
        .route("/api/bids/{symbol}", get(bids_handler))
        .route("/api/bids/{symbol}/snapshots", get(snapshots_handler))
        .route("/api/bids/{symbol}/summary", get(summary_handler))
        .route("/api/collect/catalog", post(collect_catalog_handler))
        .route("/api/collect/mainboard", post(collect_mainboard_handler))
        .route("/api/collect/sme", post(collect_sme_handler))
        .route("/api/collect/sequential", post(collect_sequential_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("BIDWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct IposQuery {
    status: Option<String>,
    series: Option<String>,
}

async fn list_ipos_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IposQuery>,
) -> Response {
    let series = match query.series.as_deref() {
        Some(label) => match Series::parse(label) {
            Some(series) => Some(series),
            None => return bad_request(format!("unknown series {label:?}")),
        },
        None => None,
    };
    match state.store.list_ipos(query.status.as_deref(), series).await {
        Ok(ipos) => Json(ipos).into_response(),
        Err(err) => server_error(err),
    }
}

async fn ipo_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ipo_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn bids_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(symbol): AxumPath<String>,
) -> Response {
    match state.store.entities_for_symbol(&symbol).await {
        Ok(entities) => Json(entities).into_response(),
        Err(err) => server_error(err),
    }
}

async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(symbol): AxumPath<String>,
) -> Response {
    match state.store.latest_snapshots(&symbol).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => server_error(err),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(symbol): AxumPath<String>,
) -> Response {
    match state.store.summary_for_symbol(&symbol).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no bid data for {symbol}")})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn collect_catalog_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.collector.refresh_catalog().await).into_response()
}

async fn collect_mainboard_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.collector.run_collection(Series::Eq).await).into_response()
}

async fn collect_sme_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.collector.run_collection(Series::Sme).await).into_response()
}

async fn collect_sequential_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.collector.sequential_refresh().await).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn server_error(err: impl Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use bidwatch_core::{BidCategoryRecord, IpoDraft};
    use bidwatch_nse::{NseClient, ScriptedTransport, UpstreamConfig};
    use bidwatch_sync::CollectorConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let store = Store::connect_in_memory().await.unwrap();
        let client = NseClient::new(
            Arc::new(ScriptedTransport::new()),
            UpstreamConfig::default().without_delays(),
        );
        let collector = Arc::new(Collector::new(
            store.clone(),
            client,
            CollectorConfig::without_delays(),
        ));
        AppState::new(store, collector)
    }

    async fn seed(state: &AppState) {
        state
            .store
            .upsert_ipo(
                &IpoDraft {
                    symbol: "ABCL".to_string(),
                    company_name: "ABC Ltd".to_string(),
                    series: Series::Eq,
                    issue_start_date: "01-Aug-2026".to_string(),
                    issue_end_date: "08-Aug-2026".to_string(),
                    status: "Closed".to_string(),
                    issue_size: "1200".to_string(),
                    issue_price: "100-110".to_string(),
                    sr_no: 1,
                    is_bse: None,
                    lot_size: None,
                },
                1,
            )
            .await
            .unwrap();
        state
            .store
            .upsert_bid_series(
                Series::Eq,
                &BidCategoryRecord {
                    symbol: "ABCL".to_string(),
                    sr_no: "1".to_string(),
                    category: "QIB".to_string(),
                    share_offered: "1000000".to_string(),
                    shares_bid: "500000".to_string(),
                    subscription_multiple: "0.5".to_string(),
                    applications: None,
                    update_time: "06-Aug-2026 10:00".to_string(),
                },
                10,
            )
            .await
            .unwrap();
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn ipos_endpoint_lists_catalog() {
        let state = test_state().await;
        seed(&state).await;
        let app = app(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/ipos?series=EQ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("ABCL"));
    }

    #[tokio::test]
    async fn unknown_series_is_a_bad_request() {
        let state = test_state().await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/ipos?series=BOND")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bid_read_side_serves_entities_snapshots_and_summary() {
        let state = test_state().await;
        seed(&state).await;
        let app = app(state);

        for uri in [
            "/api/bids/ABCL",
            "/api/bids/ABCL/snapshots",
            "/api/bids/ABCL/summary",
        ] {
            let response = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let missing = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/bids/NOPE/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_trigger_reports_structured_summary() {
        // No active listings seeded: the trigger is a successful no-op and
        // must not hit the network.
        let state = test_state().await;
        let app = app(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/collect/mainboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["count"], 0);
        assert_eq!(value["errors"], 0);
    }

    #[tokio::test]
    async fn stats_endpoint_counts_catalog() {
        let state = test_state().await;
        seed(&state).await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/ipos/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["mainboard"], 1);
    }
}
