//! MarketPulse library surface.
//!
//! Exposes the core modules so integration tests and the `marketpulse`
//! binary share one implementation.

pub mod aggregator;
pub mod api;
pub mod auth;
pub mod backtest;
pub mod bus;
pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod push;

use sqlx::PgPool;

use crate::bus::MarketBus;

/// Shared application state handed to every axum router.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bus: MarketBus,
}
