//! Bybit connector, grounded on `original_source/internal/connector/bybit.go`.
//!
//! Subscribe frame + a JSON `{"op":"ping"}` heartbeat (distinct from OKX's
//! plain-text ping), matching v5 public spot trade stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
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
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";

pub struct BybitConnector {
    venue_symbol: String,
}

impl BybitConnector {
    pub fn new(venue_symbol: &str) -> Self {
        Self { venue_symbol: venue_symbol.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct BybitEnvelope {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    data: Vec<BybitTrade>,
}

#[derive(Debug, Deserialize)]
struct BybitTrade {
    #[serde(rename = "i")]
    trade_id: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "T")]
    trade_time_ms: i64,
}

#[async_trait]
impl Connector for BybitConnector {
    fn exchange(&self) -> &'static str {
        "bybit"
    }

    async fn run(&self, tx: mpsc::Sender<Trade>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.connect_and_stream(&tx, &mut shutdown, &mut backoff).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(exchange = "bybit", error = %err, "connection lost, reconnecting");
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

impl BybitConnector {
    async fn connect_and_stream(
        &self,
        tx: &mpsc::Sender<Trade>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(WS_URL))
                .await
                .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

        info!(exchange = "bybit", "connected");
        metrics::record_connection_attach("bybit");
        backoff.reset();
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({ "op": "subscribe", "args": [format!("publicTrade.{}", self.venue_symbol)] });
        write.send(Message::Text(subscribe.to_string())).await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        let result: anyhow::Result<()> = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = json!({ "op": "ping" });
                    if write.send(Message::Text(ping.to_string())).await.is_err() {
                        break Err(anyhow::anyhow!("failed to send heartbeat ping"));
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

        metrics::record_connection_detach("bybit");
        result
    }

    fn handle_text(&self, text: &str, tx: &mpsc::Sender<Trade>) {
        let envelope: BybitEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(err) => {
                debug!(exchange = "bybit", error = %err, "dropping undecodable frame");
                return;
            }
        };

        let Some(topic) = envelope.topic else { return };
        if !topic.starts_with("publicTrade.") {
            return;
        }

        for item in envelope.data {
            let Some(price) = parse_decimal(&item.price) else { continue };
            let Some(amount) = parse_decimal(&item.volume) else { continue };
            let side = match item.side.as_str() {
                "Buy" => Side::Buy,
                "Sell" => Side::Sell,
                _ => continue,
            };

            let trade = Trade {
                id: item.trade_id,
                symbol: self.venue_symbol.clone(),
                exchange: "bybit".to_string(),
                price,
                amount,
                side,
                timestamp: from_millis(item.trade_time_ms),
            };

            try_send_or_drop(tx, "bybit", trade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_public_trade_topic() {
        let connector = BybitConnector::new("BTCUSDT");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(
            r#"{"topic":"publicTrade.BTCUSDT","ts":1700000000000,"data":[{"i":"abc","T":1700000000000,"p":"50000.0","v":"0.2","S":"Buy"}]}"#,
            &tx,
        );
        let trade = rx.try_recv().expect("trade forwarded");
        assert_eq!(trade.side, Side::Buy);
    }

    #[test]
    fn test_decode_ignores_pong_response() {
        let connector = BybitConnector::new("BTCUSDT");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"{"success":true,"ret_msg":"pong","op":"ping"}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
