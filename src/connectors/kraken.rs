//! Kraken connector, grounded on `original_source/internal/connector/kraken.go`.
//!
//! Kraken's wire format is the odd one out: trade updates arrive as bare
//! JSON arrays (`[channelID, [[price, volume, time, side, ...], ...],
//! "trade", pair]`), while control/status messages arrive as JSON objects
//! (`{"event": ...}`) — the original skips any frame starting with `{`
//! rather than attempting to decode it as a trade. Kraken trades carry no
//! trade ID, so one is synthesized from the trade's own timestamp.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
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
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WS_URL: &str = "wss://ws.kraken.com";

pub struct KrakenConnector {
    venue_symbol: String,
}

impl KrakenConnector {
    pub fn new(venue_symbol: &str) -> Self {
        Self { venue_symbol: venue_symbol.to_string() }
    }
}

#[async_trait]
impl Connector for KrakenConnector {
    fn exchange(&self) -> &'static str {
        "kraken"
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
                    warn!(exchange = "kraken", error = %err, "connection lost, reconnecting");
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

impl KrakenConnector {
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

        info!(exchange = "kraken", "connected");
        metrics::record_connection_attach("kraken");
        backoff.reset();
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "event": "subscribe",
            "pair": [self.venue_symbol],
            "subscription": { "name": "trade" },
        });
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
                    let ping = json!({ "event": "ping" });
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

        metrics::record_connection_detach("kraken");
        result
    }

    fn handle_text(&self, text: &str, tx: &mpsc::Sender<Trade>) {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            // Control/status event (subscriptionStatus, heartbeat, pong, ...); not a trade.
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                debug!(exchange = "kraken", error = %err, "dropping undecodable frame");
                return;
            }
        };

        let Some(frame) = value.as_array() else { return };
        // [channelID, payload, channelName, pair]
        let Some(channel_name) = frame.get(2).and_then(Value::as_str) else { return };
        if channel_name != "trade" {
            return;
        }
        let Some(updates) = frame.get(1).and_then(Value::as_array) else { return };

        for update in updates {
            let Some(fields) = update.as_array() else { continue };
            // [price, volume, time, side, orderType, misc]
            let Some(price) = fields.first().and_then(Value::as_str).and_then(parse_decimal) else { continue };
            let Some(amount) = fields.get(1).and_then(Value::as_str).and_then(parse_decimal) else { continue };
            let Some(time_str) = fields.get(2).and_then(Value::as_str) else { continue };
            let Some(side_tag) = fields.get(3).and_then(Value::as_str) else { continue };

            let side = match side_tag {
                "b" => Side::Buy,
                "s" => Side::Sell,
                _ => continue,
            };

            let Ok(time_secs) = time_str.parse::<f64>() else { continue };
            let nanos = (time_secs * 1_000_000_000.0).round() as i64;
            let timestamp = Utc.timestamp_nanos(nanos);

            // Kraken trades carry no trade ID; synthesize one from the
            // timestamp, matching the original's `fmt.Sprintf("%d", ts.UnixNano())`.
            let trade = Trade {
                id: nanos.to_string(),
                symbol: self.venue_symbol.clone(),
                exchange: "kraken".to_string(),
                price,
                amount,
                side,
                timestamp,
            };

            try_send_or_drop(tx, "kraken", trade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trade_array_frame() {
        let connector = KrakenConnector::new("XBT/USD");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(
            r#"[336,[["50100.10000","0.10000000","1700000000.123456","b","l",""]],"trade","XBT/USD"]"#,
            &tx,
        );
        let trade = rx.try_recv().expect("trade forwarded");
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.price.to_string(), "50100.10000");
    }

    #[test]
    fn test_decode_skips_control_event() {
        let connector = KrakenConnector::new("XBT/USD");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"{"event":"heartbeat"}"#, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_decode_skips_non_trade_channel() {
        let connector = KrakenConnector::new("XBT/USD");
        let (tx, mut rx) = mpsc::channel(8);
        connector.handle_text(r#"[336,{"a":["50100.1"]},"book-10","XBT/USD"]"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
