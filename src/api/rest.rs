// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// History endpoints are read-through queries against the candle store; they
// never touch the live aggregation state.
//
// CORS is configured permissively; the mobile client and browser dashboards
// call these from arbitrary origins.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::app_state::AppState;
use crate::persistence::StoreError;
use crate::types::Candle;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stocks-history", get(stocks_history))
        .route("/stock-candles", get(stock_candles))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    subscribers: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        subscribers: state.registry.len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// History
// =============================================================================

fn store_failure(e: StoreError) -> Response {
    error!(error = %e, "history query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "failed to load candles" })),
    )
        .into_response()
}

/// Group candles by symbol, keeping each group in timestamp order.
fn group_by_symbol(candles: Vec<Candle>) -> BTreeMap<String, Vec<Candle>> {
    let mut grouped: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        grouped.entry(candle.symbol.clone()).or_default().push(candle);
    }
    grouped
}

/// Every stored candle, grouped by symbol.
async fn stocks_history(State(state): State<Arc<AppState>>) -> Response {
    match state.store.history(None).await {
        Ok(candles) => Json(group_by_symbol(candles)).into_response(),
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
struct CandlesQuery {
    #[serde(default)]
    symbol: String,
}

/// Stored candles for one symbol.
async fn stock_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandlesQuery>,
) -> Response {
    let symbol = query.symbol.trim().to_uppercase();
    match state.store.history(Some(&symbol)).await {
        Ok(candles) => Json(candles).into_response(),
        Err(e) => store_failure(e),
    }
}
