// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and map one-to-one onto datafeed
// operations. Request-validation failures come back as 4xx with a
// `{"s":"error","kind":...}` body; exchange failures as 502.
//
// CORS is permissive: the chart is usually served from another origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::datafeed::Datafeed;
use crate::error::FeedError;
use crate::subscriptions::MuxStats;
use crate::types::{BarsResult, PeriodParams, Quote, SymbolInfo};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and the shared datafeed.
pub fn router(feed: Arc<Datafeed>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/config", get(config))
        .route("/api/v1/time", get(server_time))
        .route("/api/v1/search", get(search))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/history", get(history))
        .route("/api/v1/quotes", get(quotes))
        // ── Live subscriptions ──────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(feed)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    subscriptions: MuxStats,
}

async fn health(State(feed): State<Arc<Datafeed>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        subscriptions: feed.stats(),
    })
}

// =============================================================================
// Configuration & time
// =============================================================================

async fn config(State(feed): State<Arc<Datafeed>>) -> impl IntoResponse {
    Json(feed.get_configuration())
}

/// Epoch seconds.
async fn server_time(State(feed): State<Arc<Datafeed>>) -> impl IntoResponse {
    Json(feed.get_server_time())
}

// =============================================================================
// Symbols
// =============================================================================

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
    #[serde(default)]
    exchange: String,
    #[serde(default, rename = "type")]
    symbol_type: String,
    limit: Option<usize>,
}

async fn search(
    State(feed): State<Arc<Datafeed>>,
    Query(q): Query<SearchQuery>,
) -> impl IntoResponse {
    let mut results = feed.search_symbols(&q.query, &q.exchange, &q.symbol_type).await;
    if let Some(limit) = q.limit {
        results.truncate(limit);
    }
    debug!(query = %q.query, hits = results.len(), "symbol search");
    Json(results)
}

#[derive(Deserialize)]
struct SymbolQuery {
    symbol: String,
}

async fn symbols(
    State(feed): State<Arc<Datafeed>>,
    Query(q): Query<SymbolQuery>,
) -> Result<Json<SymbolInfo>, FeedError> {
    Ok(Json(feed.resolve_symbol(&q.symbol).await?))
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    symbol: String,
    resolution: String,
    from: i64,
    to: i64,
    #[serde(rename = "countback")]
    count_back: u32,
    #[serde(default, rename = "firstDataRequest")]
    first_data_request: bool,
}

async fn history(
    State(feed): State<Arc<Datafeed>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<BarsResult>, FeedError> {
    let info = feed.resolve_symbol(&q.symbol).await?;
    let result = feed
        .get_bars(
            &info,
            &q.resolution,
            PeriodParams {
                from: q.from,
                to: q.to,
                count_back: q.count_back,
                first_data_request: q.first_data_request,
            },
        )
        .await?;
    Ok(Json(result))
}

// =============================================================================
// Quotes
// =============================================================================

#[derive(Deserialize)]
struct QuotesQuery {
    /// Comma-separated `EXCHANGE:SYMBOL` list.
    symbols: String,
}

#[derive(Serialize)]
struct QuotesResponse {
    s: &'static str,
    d: Vec<Quote>,
}

async fn quotes(
    State(feed): State<Arc<Datafeed>>,
    Query(q): Query<QuotesQuery>,
) -> impl IntoResponse {
    let symbols: Vec<String> = q
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Json(QuotesResponse {
        s: "ok",
        d: feed.get_quotes(&symbols).await,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mock_datafeed;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let (_transport, feed) = mock_datafeed();
        let app = router(Arc::new(feed));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_subscription_counts() {
        let (status, json) = get_json("/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["subscriptions"]["bar_channels"], 0);
    }

    #[tokio::test]
    async fn config_lists_exchanges() {
        let (status, json) = get_json("/api/v1/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["exchanges"][0]["value"], "BINANCE");
        assert_eq!(json["supports_search"], true);
    }

    #[tokio::test]
    async fn search_honours_limit() {
        let (_, json) = get_json("/api/v1/search?query=usdt&exchange=binance&limit=1").await;
        let hits = json.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["type"], "crypto");
    }

    #[tokio::test]
    async fn symbol_errors_map_to_status_codes() {
        let (status, json) = get_json("/api/v1/symbols?symbol=BINANCE:NOPE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "unresolvable-symbol");

        let (status, json) = get_json("/api/v1/symbols?symbol=KRAKEN:XBTUSD").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["s"], "error");

        let (status, json) = get_json("/api/v1/symbols?symbol=BINANCE:BTCUSDT").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pricescale"], 100);
    }

    #[tokio::test]
    async fn history_returns_bars_or_no_data() {
        let (status, json) = get_json(
            "/api/v1/history?symbol=BINANCE:BTCUSDT&resolution=60&from=1699999200&to=1700013600&countback=10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["noData"], false);
        // 1699999200..=1700013600 at one hour is five candles.
        assert_eq!(json["bars"].as_array().unwrap().len(), 5);

        let (_, json) = get_json(
            "/api/v1/history?symbol=BINANCE:BTCUSDT&resolution=60&from=1700013600&to=1699999200&countback=10",
        )
        .await;
        assert_eq!(json["noData"], true);

        let (status, json) = get_json(
            "/api/v1/history?symbol=BINANCE:BTCUSDT&resolution=7&from=0&to=1&countback=1",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "unsupported-resolution");
    }

    #[tokio::test]
    async fn quotes_mix_ok_and_error_entries() {
        let (_, json) = get_json("/api/v1/quotes?symbols=BINANCE:BTCUSDT,%20BINANCE:FAILUSDT").await;
        assert_eq!(json["s"], "ok");
        let quotes = json["d"].as_array().unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0]["s"], "ok");
        assert_eq!(quotes[0]["v"]["ask"], 37000.5);
        assert_eq!(quotes[1]["s"], "error");
    }
}
