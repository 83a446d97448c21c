//! Historical-query and backtest HTTP handlers (spec.md §6), grounded on
//! the teacher's `api/routes.rs` (`Query`/`State` extractors, JSON response
//! structs) but returning `Result<_, ApiError>` so a handler just propagates
//! with `?` instead of manually mapping a bare `StatusCode`.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::backtest::{self, strategy::build_strategy};
use crate::error::ApiError;
use crate::models::{normalize_symbol, BacktestReport, Candle, StrategyConfig};
use crate::persistence;
use crate::AppState;

const DEFAULT_PERIOD: &str = "1m";
const KLINES_LIMIT: i64 = 100;

fn default_period() -> String {
    DEFAULT_PERIOD.to_string()
}

#[derive(Debug, Deserialize)]
pub struct KlinesQuery {
    #[serde(default = "default_period")]
    pub period: String,
}

/// `GET /api/v1/klines/:symbol?period=<p>` — up to 100 most recent candles,
/// newest first.
pub async fn list_klines(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<KlinesQuery>,
) -> Result<Json<Vec<Candle>>, ApiError> {
    let symbol = normalize_symbol(&symbol);
    let candles =
        persistence::load_recent_candles(&state.pool, &symbol, &query.period, KLINES_LIMIT)
            .await?;
    Ok(Json(candles))
}

#[derive(Debug, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub strategy_type: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    pub initial_balance: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default = "default_period")]
    pub period: String,
}

/// `POST /api/v1/backtest` (auth required) — runs a strategy over the
/// persisted candle history for the requested range and returns the report.
pub async fn run_backtest(
    State(state): State<AppState>,
    Json(payload): Json<BacktestRequest>,
) -> Result<Json<BacktestReport>, ApiError> {
    let symbol = normalize_symbol(&payload.symbol);
    let strategy_config = StrategyConfig {
        strategy_type: payload.strategy_type,
        config: payload.config,
    };
    let strategy = build_strategy(&strategy_config)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let candles = backtest::load_candles(
        &state.pool,
        &symbol,
        &payload.period,
        payload.start_time,
        payload.end_time,
    )
    .await?;

    let backtester = backtest::Backtester::new(strategy, payload.initial_balance);
    Ok(Json(backtester.run(&candles)))
}
