//! OKX connector, grounded on `original_source/internal/connector/okx.go`.
//!
//! Requires an explicit `subscribe` frame after connect, and a textual
//! `"ping"`/`"pong"` heartbeat the client must drive itself (unlike
//! Binance's server-driven protocol ping).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{parse_decimal, try_send_or_drop, Backoff, Connector};
use crate::metrics;
use crate::models::{Side, Trade};
use chrono::Utc;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub struct OkxConnector {
    venue_symbol: String,
}

impl OkxConnector {
    pub fn new(venue_symbol: &str) -> Self {
        Self { venue_symbol: venue_symbol.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct OkxEnvelope {
    #[serde(default)]
    arg: Option<OkxArg>,
    #[serde(default)]
    data: Vec<OkxTrade>,
}

#[derive(Debug, Deserialize)]
struct OkxArg {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct OkxTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    px: String,
    sz: String,
    side: String,
    ts: String,
}

#[async_trait]
impl Connector for OkxConnector {
    fn exchange(&self) -> &'static str {
        "okx"
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
                    warn!(exchange = "okx", error = %err, "connection lost, reconnecting");
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

impl OkxConnector {
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

        info!(exchange = "okx", "connected");
        metrics::record_connection_attach("okx");
        backoff.reset();
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "op": "subscribe",
            "args": [{ "channel": "trades", "instId": self.venue_symbol }]
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        let result: anyhow::Result<()> = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if write.send(Message::Text("ping".to_string())).await.is_err() {
                        break Err(anyhow::anyhow!("failed to send heartbeat ping"));
                    }
                }
                frame = tokio::time::timeout(READ_DEADLINE, read.next()) => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(_) => break Err(anyhow::anyhow!("read deadline exceeded")),
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text == "pong" {
                                continue;
                            }
                            self.handle_text(&text, tx);
                        }
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

        metrics::record_connection_detach("okx");
        result
    }

    fn handle_text(&self, text: &str, tx: &mpsc::Sender<Trade>) {
        let envelope: OkxEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(err) => {
                debug!(exchange = "okx", error = %err, "dropping undecodable frame");
                return;
            }
        };

        let Some(arg) = envelope.arg else { return };
        if arg.channel != "trades" {
            return;
        }

        for item in envelope.data {
            let Some(price) = parse_decimal(&item.px) else { continue };
            let Some(amount) = parse_decimal(&item.sz) else { continue };
            let side = match item.side.as_str() {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                _ => continue,
            };
            let timestamp = item
                .ts
                .parse::<i64>()
                .map(super::from_millis)
                .unwrap_or_else(|_| Utc::now());

            let trade = Trade {
                id: item.trade_id,
                symbol: self.venue_symbol.clone(),
                exchange: "okx".to_string(),
                price,
                amount,
                side,
                timestamp,
            };

            try_send_or_drop(tx, "okx", trade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trade_channel_data() {
        let connector = OkxConnector::new("BTC-USDT");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(
            r#"{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","tradeId":"99","px":"50000.5","sz":"0.1","side":"sell","ts":"1700000000000"}]}"#,
            &tx,
        );
        let trade = rx.try_recv().expect("trade forwarded");
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.id, "99");
    }

    #[test]
    fn test_decode_ignores_non_trades_channel() {
        let connector = OkxConnector::new("BTC-USDT");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT"}}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
