//! Core data model shared by connectors, the aggregator, persistence, the
//! push gateway, and the backtest engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Buy or sell, normalized regardless of venue encoding ("Buy", "BUY", "b", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single normalized trade, as produced by a connector and carried on the
/// bus under `market.raw.<exchange>.<symbol>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// A completed (or in-progress) OHLCV window, carried on the bus under
/// `market.kline.<period>.<symbol>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub period: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A trade emitted by the backtest engine. Immutable once appended to a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub pnl: Decimal,
}

/// Result of a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub strategy_name: String,
    pub trade_count: usize,
    pub win_rate: f64,
    pub total_return: f64,
    pub total_profit: Decimal,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub trades: Vec<SimulatedTrade>,
}

/// Strategy type tag plus its free-form parameter map. Validated at
/// construction by the strategy factory, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_type: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

/// Collapse venue-specific symbol spellings into one canonical form:
/// uppercase, with `-`, `/`, `_` stripped. Idempotent —
/// `normalize_symbol(normalize_symbol(s)) == normalize_symbol(s)`.
pub fn normalize_symbol(s: &str) -> String {
    s.to_uppercase().replace(['-', '/', '_'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol_collapses_venue_spellings() {
        assert_eq!(normalize_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTC_USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("XBT/USD"), "XBTUSD");
    }

    #[test]
    fn test_normalize_symbol_is_idempotent() {
        for s in ["BTC-USDT", "eth/usd", "SOL_USDC", "XBTUSD"] {
            let once = normalize_symbol(s);
            let twice = normalize_symbol(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_trade_round_trips_through_json_without_losing_decimal_precision() {
        let trade = Trade {
            id: "123456".to_string(),
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            price: "64312.10500001".parse().unwrap(),
            amount: "0.00031200".parse().unwrap(),
            side: Side::Buy,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();

        assert_eq!(back.price, trade.price);
        assert_eq!(back.amount, trade.amount);
        assert_eq!(back.side, trade.side);
        assert_eq!(back.symbol, trade.symbol);
    }
}
