//! Exchange connectors (spec.md §4.1).
//!
//! Each connector owns a reconnecting stream session and feeds normalized
//! [`Trade`]s into a caller-provided bounded channel until the shared
//! shutdown signal fires. The original dispatches by a string exchange tag
//! (`app/worker.go`'s `switch t.Exchange`); per REDESIGN FLAGS §1 this is
//! replaced with a tagged registry (`TARGETS`) the ingestion supervisor
//! iterates, plus one adapter module per venue (§9 "Exchange-specific wire
//! schemas" explicitly avoids a single polymorphic decoder).

pub mod binance;
pub mod bybit;
pub mod coinbase;
pub mod kraken;
pub mod okx;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::models::Trade;

/// Parse a millisecond epoch timestamp, as used by Binance, OKX, and Bybit.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Parse a decimal string, returning `None` (and letting the caller drop
/// the frame) rather than panicking on a malformed venue payload.
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).ok()
}

/// One `(exchange, venue-specific-symbol)` ingestion target, replacing the
/// original's inline `[]struct{Exchange, Symbol string}` literal
/// (`app/worker.go`'s `targets`).
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub exchange: &'static str,
    pub venue_symbol: &'static str,
}

/// Static table of ingestion targets, one per supported venue, mirroring
/// the original's hardcoded target list.
pub const TARGETS: &[Target] = &[
    Target { exchange: "binance", venue_symbol: "btcusdt" },
    Target { exchange: "okx", venue_symbol: "BTC-USDT" },
    Target { exchange: "bybit", venue_symbol: "BTCUSDT" },
    Target { exchange: "coinbase", venue_symbol: "BTC-USD" },
    Target { exchange: "kraken", venue_symbol: "XBT/USD" },
];

/// Common contract every exchange connector implements: run until
/// `shutdown` fires, delivering normalized trades into `tx`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn exchange(&self) -> &'static str;

    async fn run(&self, tx: mpsc::Sender<Trade>, shutdown: watch::Receiver<bool>);
}

/// Build the connector for a registry target. Unknown exchange tags are a
/// programmer error (the table above is the only source of targets), so
/// this panics rather than returning `Option` — matches the original's
/// `default: Warn + return` being effectively unreachable in practice, but
/// made a hard invariant here since `TARGETS` is static.
pub fn build(target: &Target) -> Box<dyn Connector> {
    match target.exchange {
        "binance" => Box::new(binance::BinanceConnector::new(target.venue_symbol)),
        "okx" => Box::new(okx::OkxConnector::new(target.venue_symbol)),
        "bybit" => Box::new(bybit::BybitConnector::new(target.venue_symbol)),
        "coinbase" => Box::new(coinbase::CoinbaseConnector::new(target.venue_symbol)),
        "kraken" => Box::new(kraken::KrakenConnector::new(target.venue_symbol)),
        other => panic!("unknown exchange in connector registry: {other}"),
    }
}

/// Exponential backoff, doubling from a base and capped at a max
/// (spec.md §4.1: "doubling from 1s and capped at 60s; on any successful
/// handshake the backoff resets"). Simplified from the teacher's
/// `BackoffCalculator` (no jitter, no circuit breaker, no endpoint
/// rotation) since spec.md names a single plain reconnect loop per venue,
/// not a multi-endpoint failover scheme.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    /// Duration to sleep before the next attempt, then doubles for next time.
    pub fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    /// Reset to base on successful handshake.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Try to send a trade without blocking the read loop; on a full channel,
/// drop the trade and warn (spec.md §4.1 "Overflow": the sole producer-side
/// backpressure policy).
pub fn try_send_or_drop(tx: &mpsc::Sender<Trade>, exchange: &str, trade: Trade) {
    if let Err(mpsc::error::TrySendError::Full(trade)) = tx.try_send(trade) {
        tracing::warn!(exchange, trade_id = %trade.id, "trade channel full, dropping trade");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.next(), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn test_targets_cover_all_five_venues() {
        let exchanges: Vec<&str> = TARGETS.iter().map(|t| t.exchange).collect();
        assert_eq!(exchanges.len(), 5);
        for venue in ["binance", "okx", "bybit", "coinbase", "kraken"] {
            assert!(exchanges.contains(&venue));
        }
    }
}
