//! Candle aggregator (spec.md §4.4), grounded on
//! `original_source/internal/processor/kline.go`.
//!
//! Consumes raw trades off the durable `kline_processor` bus consumer,
//! folds each into its one-minute window, and sweeps every 5s for windows
//! that have closed (anything strictly before the current minute
//! boundary), publishing and evicting them. A trade that arrives for a
//! window after it has already been swept creates a fresh single-trade
//! candle and gets published on the next sweep — the original has the same
//! gap (`kline.go`'s comment: "a late trade after flush starts a new
//! window"); spec.md §9 accepts this as reference behavior rather than a
//! bug to fix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{log_publish_failure, MarketBus, RAW_TRADES_WILDCARD};
use crate::models::{Candle, Trade};

const PERIOD: &str = "1m";
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DURABLE_NAME: &str = "kline_processor";

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(ts)
}

fn candle_key(exchange: &str, symbol: &str, window_start: DateTime<Utc>) -> String {
    format!("{exchange}:{symbol}:{}", window_start.to_rfc3339())
}

/// Fold one trade into its window's candle, inserting a fresh single-trade
/// candle the first time a window is seen. Free function so both the live
/// aggregator and its tests share one update rule.
fn apply_trade(candles: &mut HashMap<String, Candle>, trade: &Trade) {
    let window_start = truncate_to_minute(trade.timestamp);
    let key = candle_key(&trade.exchange, &trade.symbol, window_start);

    candles
        .entry(key)
        .and_modify(|candle| {
            if trade.price > candle.high {
                candle.high = trade.price;
            }
            if trade.price < candle.low {
                candle.low = trade.price;
            }
            candle.close = trade.price;
            candle.volume += trade.amount;
        })
        .or_insert_with(|| Candle {
            symbol: trade.symbol.clone(),
            exchange: trade.exchange.clone(),
            period: PERIOD.to_string(),
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.amount,
            timestamp: window_start,
        });
}

pub struct Aggregator {
    bus: MarketBus,
    candles: Mutex<HashMap<String, Candle>>,
}

impl Aggregator {
    pub fn new(bus: MarketBus) -> Arc<Self> {
        Arc::new(Self { bus, candles: Mutex::new(HashMap::new()) })
    }

    /// Consume raw trades and sweep closed windows until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut messages = self.bus.durable_subscribe(RAW_TRADES_WILDCARD, DURABLE_NAME).await?;
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = flush_tick.tick() => {
                    self.flush().await;
                }
                msg = messages.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            if let Ok(trade) = serde_json::from_slice::<Trade>(&message.payload) {
                                self.process_trade(trade);
                            } else {
                                debug!("dropping undecodable trade message on kline_processor");
                            }
                            if let Err(err) = message.ack().await {
                                warn!(error = %err, "failed to ack trade message");
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "kline_processor consumer error"),
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    fn process_trade(&self, trade: Trade) {
        let mut candles = self.candles.lock();
        apply_trade(&mut candles, &trade);
    }

    /// Publish and evict every window strictly before the current minute boundary.
    async fn flush(&self) {
        let current_window = truncate_to_minute(Utc::now());

        let closed: Vec<Candle> = {
            let mut candles = self.candles.lock();
            let keys: Vec<String> = candles
                .iter()
                .filter(|(_, c)| c.timestamp < current_window)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| candles.remove(&k)).collect()
        };

        for candle in closed {
            if let Err(err) = self.bus.publish_candle(&candle).await {
                log_publish_failure("kline publish", &err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn trade(price: &str, amount: &str, ts: DateTime<Utc>) -> Trade {
        Trade {
            id: "1".to_string(),
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            price: Decimal::from_str(price).unwrap(),
            amount: Decimal::from_str(amount).unwrap(),
            side: crate::models::Side::Buy,
            timestamp: ts,
        }
    }

    #[test]
    fn test_window_folds_ohlcv_from_three_trades() {
        let mut candles: HashMap<String, Candle> = HashMap::new();

        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = trade("50000", "1.0", base + chrono::Duration::seconds(10));
        let t2 = trade("50100", "1.5", base + chrono::Duration::seconds(20));
        let t3 = trade("49900", "1.0", base + chrono::Duration::seconds(30));

        for t in [t1, t2, t3] {
            apply_trade(&mut candles, &t);
        }

        let candle = candles.values().next().expect("one window");
        assert_eq!(candle.open, Decimal::from_str("50000").unwrap());
        assert_eq!(candle.high, Decimal::from_str("50100").unwrap());
        assert_eq!(candle.low, Decimal::from_str("49900").unwrap());
        assert_eq!(candle.close, Decimal::from_str("49900").unwrap());
        assert_eq!(candle.volume, Decimal::from_str("3.5").unwrap());
    }

    #[test]
    fn test_truncate_to_minute_drops_seconds_and_nanos() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:45.123Z").unwrap().with_timezone(&Utc);
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated.second(), 0);
        assert_eq!(truncated.nanosecond(), 0);
        assert_eq!(truncated.minute(), 0);
    }
}
