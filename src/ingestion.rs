//! Ingestion supervisor (spec.md §4.2), grounded on
//! `original_source/internal/app/worker.go`'s `startIngestionWorker`.
//!
//! One task per [`Target`](crate::connectors::Target): build its connector,
//! spawn it against a bounded channel, and drain that channel onto the
//! market bus, normalizing the symbol and counting each successful
//! hand-off. A publish failure is logged and the trade dropped — retrying
//! here would just reorder trades relative to their bus timestamps.

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::bus::{log_publish_failure, MarketBus};
use crate::connectors::{self, Target};
use crate::metrics;
use crate::models::{normalize_symbol, Trade};

/// Run one target's connector + publish loop until `shutdown` fires.
pub async fn run_target(bus: MarketBus, target: Target, shutdown: watch::Receiver<bool>) {
    let capacity = 1000;
    let (tx, mut rx) = mpsc::channel::<Trade>(capacity);

    let connector = connectors::build(&target);
    let connector_shutdown = shutdown.clone();
    let span = tracing::info_span!("connector", exchange = target.exchange);
    let connector_task = tokio::spawn(
        async move { connector.run(tx, connector_shutdown).await }.instrument(span),
    );

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            trade = rx.recv() => {
                let Some(mut trade) = trade else { break };
                trade.symbol = normalize_symbol(&trade.symbol);

                if let Err(err) = bus.publish_trade(&trade).await {
                    log_publish_failure("raw trade publish", &err);
                    continue;
                }
                metrics::record_trade_ingested(&trade.symbol);
            }
        }
    }

    drop(rx);
    let _ = connector_task.await;
}

/// Spawn one ingestion task per registered target.
pub fn spawn_all(bus: MarketBus, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
    connectors::TARGETS
        .iter()
        .map(|target| {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            let target = *target;
            tokio::spawn(async move { run_target(bus, target, shutdown).await })
        })
        .collect()
}
