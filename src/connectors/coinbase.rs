//! Coinbase connector, grounded on `original_source/internal/connector/coinbase.go`.
//!
//! No application-level heartbeat: Coinbase's matches channel is active
//! enough in practice that the original relies solely on the rolling read
//! deadline for liveness, so this connector does too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

pub struct CoinbaseConnector {
    venue_symbol: String,
}

impl CoinbaseConnector {
    pub fn new(venue_symbol: &str) -> Self {
        Self { venue_symbol: venue_symbol.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    trade_id: Option<i64>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

#[async_trait]
impl Connector for CoinbaseConnector {
    fn exchange(&self) -> &'static str {
        "coinbase"
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
                    warn!(exchange = "coinbase", error = %err, "connection lost, reconnecting");
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

impl CoinbaseConnector {
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

        info!(exchange = "coinbase", "connected");
        metrics::record_connection_attach("coinbase");
        backoff.reset();
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "type": "subscribe",
            "product_ids": [self.venue_symbol],
            "channels": ["matches"],
        });
        write.send(Message::Text(subscribe.to_string())).await?;

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

        metrics::record_connection_detach("coinbase");
        result
    }

    fn handle_text(&self, text: &str, tx: &mpsc::Sender<Trade>) {
        let msg: CoinbaseMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(err) => {
                debug!(exchange = "coinbase", error = %err, "dropping undecodable frame");
                return;
            }
        };

        if msg.msg_type != "match" && msg.msg_type != "last_match" {
            return;
        }

        let (Some(trade_id), Some(price), Some(size), Some(side), Some(time)) =
            (msg.trade_id, msg.price, msg.size, msg.side, msg.time)
        else {
            return;
        };

        let Some(price) = parse_decimal(&price) else { return };
        let Some(amount) = parse_decimal(&size) else { return };
        let side = match side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => return,
        };
        let timestamp = time
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now());

        let trade = Trade {
            id: trade_id.to_string(),
            symbol: self.venue_symbol.clone(),
            exchange: "coinbase".to_string(),
            price,
            amount,
            side,
            timestamp,
        };

        try_send_or_drop(tx, "coinbase", trade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_match_event() {
        let connector = CoinbaseConnector::new("BTC-USD");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(
            r#"{"type":"match","trade_id":5551,"maker_order_id":"a","taker_order_id":"b","side":"sell","size":"0.01","price":"50010.25","product_id":"BTC-USD","time":"2024-01-01T00:00:01.000Z"}"#,
            &tx,
        );
        let trade = rx.try_recv().expect("trade forwarded");
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.id, "5551");
    }

    #[test]
    fn test_decode_ignores_subscription_ack() {
        let connector = CoinbaseConnector::new("BTC-USD");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"{"type":"subscriptions","channels":[]}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
