//! Binance connector, grounded on `original_source/internal/connector/binance.go`.
//!
//! Single-symbol trade stream embedded in the URL path, no subscribe frame
//! needed. Binance's gateway drives ping/pong itself; `tokio-tungstenite`
//! answers pings transparently, so the only liveness concern here is the
//! rolling read deadline (spec.md §4.1: 60s, refreshed by *any* frame).

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{from_millis, parse_decimal, try_send_or_drop, Backoff, Connector};
use crate::metrics;
use crate::models::{Side, Trade};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);

pub struct BinanceConnector {
    venue_symbol: String,
}

impl BinanceConnector {
    pub fn new(venue_symbol: &str) -> Self {
        Self { venue_symbol: venue_symbol.to_string() }
    }

    fn url(&self) -> String {
        format!("wss://stream.binance.com:9443/ws/{}@trade", self.venue_symbol)
    }
}

/// Binance combined-stream trade event. Only the fields we need are named;
/// the rest (`s`, `E`, `a`, `b`, `M`) are dropped on deserialize.
#[derive(Debug, Deserialize)]
struct BinanceTradeEvent {
    #[serde(rename = "e")]
    event_type: Option<String>,
    #[serde(rename = "t")]
    trade_id: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time_ms: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[async_trait]
impl Connector for BinanceConnector {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    async fn run(&self, tx: mpsc::Sender<Trade>, mut shutdown: watch::Receiver<bool>) {
        let url = self.url();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.connect_and_stream(&url, &tx, &mut shutdown, &mut backoff).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(exchange = "binance", error = %err, "connection lost, reconnecting");
                    let wait = backoff.next();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    continue;
                }
            }
        }
    }
}

impl BinanceConnector {
    async fn connect_and_stream(
        &self,
        url: &str,
        tx: &mpsc::Sender<Trade>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

        info!(exchange = "binance", "connected");
        metrics::record_connection_attach("binance");
        backoff.reset();
        let (_write, mut read) = ws_stream.split();

        let result: anyhow::Result<()> = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                frame = tokio::time::timeout(READ_DEADLINE, read.next()) => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(_) => break Err(anyhow::anyhow!("read deadline exceeded")),
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, tx),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(anyhow::anyhow!("server closed connection"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Err(anyhow::anyhow!(err)),
                    }
                }
            }
        };

        metrics::record_connection_detach("binance");
        result
    }

    fn handle_text(&self, text: &str, tx: &mpsc::Sender<Trade>) {
        let event: BinanceTradeEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(err) => {
                debug!(exchange = "binance", error = %err, "dropping undecodable frame");
                return;
            }
        };

        if event.event_type.as_deref() != Some("trade") {
            return;
        }

        let Some(price) = parse_decimal(&event.price) else { return };
        let Some(amount) = parse_decimal(&event.quantity) else { return };

        // Binance's `m` flag is true when the buyer is the market maker,
        // i.e. the trade was initiated by a sell order hitting the book.
        let side = if event.is_buyer_maker { Side::Sell } else { Side::Buy };

        let trade = Trade {
            id: event.trade_id.to_string(),
            symbol: self.venue_symbol.clone(),
            exchange: "binance".to_string(),
            price,
            amount,
            side,
            timestamp: from_millis(event.trade_time_ms),
        };

        try_send_or_drop(tx, "binance", trade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trade_event_maps_buyer_maker_to_sell() {
        let connector = BinanceConnector::new("btcusdt");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(
            r#"{"e":"trade","E":123,"s":"BTCUSDT","t":12345,"p":"50000.10","q":"0.5","b":1,"a":2,"T":1700000000000,"m":true,"M":true}"#,
            &tx,
        );
        let trade = rx.try_recv().expect("trade forwarded");
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.price.to_string(), "50000.10");
        assert_eq!(trade.amount.to_string(), "0.5");
    }

    #[test]
    fn test_decode_ignores_non_trade_event() {
        let connector = BinanceConnector::new("btcusdt");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"{"result":null,"id":1}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
