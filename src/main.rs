//! MarketPulse - real-time crypto market-data pipeline
//! Mission: ingest, bus, aggregate, persist, and push candle/trade data

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketpulse::{
    aggregator::Aggregator,
    api,
    auth::{self, auth_middleware, AuthState, JwtHandler, UserStore},
    bus::MarketBus,
    config::Config,
    db,
    ingestion,
    metrics,
    middleware::request_logging_simple,
    persistence::{KlineWriter, TradeWriter},
    push::{self, PushGateway},
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    let pool = db::connect(&config.db_dsn).await?;
    let bus = MarketBus::connect(&config.nats_url).await?;
    let metrics_handle = metrics::install();

    let state = AppState { pool: pool.clone(), bus: bus.clone() };

    let user_store = Arc::new(UserStore::new(pool.clone()));
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let auth_state = AuthState::new(user_store, jwt_handler.clone());

    let push_gateway = PushGateway::new(bus.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = ingestion::spawn_all(bus.clone(), shutdown_rx.clone());

    let aggregator = Aggregator::new(bus.clone());
    tasks.push(tokio::spawn(supervise("aggregator", {
        let shutdown_rx = shutdown_rx.clone();
        async move { aggregator.run(shutdown_rx).await }
    })));

    let trade_writer = TradeWriter::new(bus.clone(), pool.clone());
    tasks.push(tokio::spawn(supervise("trade_writer", {
        let shutdown_rx = shutdown_rx.clone();
        async move { trade_writer.run(shutdown_rx).await }
    })));

    let kline_writer = KlineWriter::new(bus.clone(), pool.clone());
    tasks.push(tokio::spawn(supervise("kline_writer", {
        let shutdown_rx = shutdown_rx.clone();
        async move { kline_writer.run(shutdown_rx).await }
    })));

    let auth_router = Router::new()
        .route("/api/v1/register", post(auth::api::register))
        .route("/api/v1/login", post(auth::api::login))
        .with_state(auth_state);

    let protected_routes = Router::new()
        .route("/api/v1/backtest", post(api::run_backtest))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth_middleware))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(move || render_metrics(metrics_handle.clone())))
        .route("/api/v1/klines/:symbol", get(api::list_klines))
        .with_state(state.clone());

    let push_routes = Router::new()
        .route("/ws", get(push::websocket_handler))
        .with_state(push_gateway);

    let app = Router::new()
        .merge(public_routes)
        .merge(push_routes)
        .merge(protected_routes)
        .merge(auth_router)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging_simple));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "marketpulse listening");

    let shutdown_signal = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining background tasks");
            let _ = shutdown_tx.send(true);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
            warn!("background task did not exit within the shutdown grace period");
        }
    }

    Ok(())
}

/// Run a background task, logging (rather than panicking the process) if it
/// returns an error — a connector's own reconnect loop survives transient
/// failures, but the batch writers and aggregator surface a hard error only
/// on unrecoverable bus/db failures.
async fn supervise<F>(name: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<()>>,
{
    if let Err(err) = fut.await {
        warn!(task = name, error = %err, "background task exited with an error");
    }
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

async fn health_check() -> &'static str {
    "ok"
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketpulse=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
