//! Backtest engine (spec.md §4.7), grounded on
//! `original_source/internal/engine/backtester.go` and `loader.go`.

pub mod strategy;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::{BacktestReport, Candle, Side, SimulatedTrade};
use crate::persistence;
use strategy::{Action, Strategy};

const FEE_RATE: &str = "0.001";
const SLIPPAGE: &str = "0.0005";

/// Load persisted candles for a symbol/period/time range, ascending by
/// time (`original_source/internal/engine/loader.go`'s `LoadCandles`).
pub async fn load_candles(
    pool: &PgPool,
    symbol: &str,
    period: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<Candle>> {
    persistence::load_candles_range(pool, symbol, period, from, to).await
}

/// Simulates a strategy over a candle history with a single open position
/// at a time, fixed fee and slippage. Mirrors the original's `Backtester`
/// field-for-field.
pub struct Backtester {
    strategy: Box<dyn Strategy>,
    initial_balance: Decimal,
    balance: Decimal,
    position: Decimal,
    fee_rate: Decimal,
    slippage: Decimal,
    trades: Vec<SimulatedTrade>,
    equity_curve: Vec<Decimal>,
    returns: Vec<f64>,
    prev_equity: Decimal,
}

impl Backtester {
    pub fn new(strategy: Box<dyn Strategy>, initial_balance: Decimal) -> Self {
        Self {
            strategy,
            initial_balance,
            balance: initial_balance,
            position: Decimal::ZERO,
            fee_rate: FEE_RATE.parse().expect("valid fee rate literal"),
            slippage: SLIPPAGE.parse().expect("valid slippage literal"),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            returns: Vec::new(),
            prev_equity: initial_balance,
        }
    }

    pub fn run(mut self, candles: &[Candle]) -> BacktestReport {
        for candle in candles {
            match self.strategy.on_candle(candle) {
                Action::Buy => self.buy(candle),
                Action::Sell => self.sell(candle),
                Action::Hold => {}
            }
            self.record_equity(candle.close);
        }

        // Force-liquidate any open position at the last observed price so
        // the report reflects a fully realized outcome. No equity sample is
        // appended for this — the equity curve holds exactly one entry per
        // input candle, matching `backtester.go`'s `Run()`.
        if self.position > Decimal::ZERO {
            if let Some(last) = candles.last() {
                self.sell(last);
            }
        }

        let (win_rate, total_profit) = self.sell_stats();
        let max_drawdown = self.max_drawdown();
        let sharpe_ratio = self.sharpe_ratio();
        let total_return = if self.initial_balance > Decimal::ZERO {
            ((self.balance - self.initial_balance) / self.initial_balance)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        BacktestReport {
            strategy_name: self.strategy.name().to_string(),
            trade_count: self.trades.len(),
            win_rate,
            total_return,
            total_profit,
            max_drawdown,
            sharpe_ratio,
            initial_balance: self.initial_balance,
            final_balance: self.balance,
            trades: self.trades,
        }
    }

    fn buy(&mut self, candle: &Candle) {
        if self.position > Decimal::ZERO || self.balance <= Decimal::ZERO {
            return;
        }

        let exec_price = candle.close * (Decimal::ONE + self.slippage);
        let size = self.balance / (exec_price * (Decimal::ONE + self.fee_rate));
        if size <= Decimal::ZERO {
            return;
        }
        let cost = size * exec_price;
        let fee = cost * self.fee_rate;

        self.position = size;
        self.balance -= cost + fee;

        self.trades.push(SimulatedTrade {
            time: candle.timestamp,
            symbol: candle.symbol.clone(),
            side: Side::Buy,
            price: exec_price,
            size,
            fee,
            pnl: Decimal::ZERO,
        });
    }

    /// Sells the whole open position. The recorded `pnl` is net proceeds
    /// (sale proceeds minus the sell-side fee), not `proceeds - cost_basis`
    /// — the original never folds the buy-side cost back in when recording
    /// a sell's P&L (`backtester.go`'s `RecordTrade` call on sell). Win
    /// rate and total profit inherit this approximation; see DESIGN.md.
    fn sell(&mut self, candle: &Candle) {
        if self.position <= Decimal::ZERO {
            return;
        }

        let exec_price = candle.close * (Decimal::ONE - self.slippage);
        let proceeds = self.position * exec_price;
        let fee = proceeds * self.fee_rate;
        let net_proceeds = proceeds - fee;

        self.balance += net_proceeds;
        self.trades.push(SimulatedTrade {
            time: candle.timestamp,
            symbol: candle.symbol.clone(),
            side: Side::Sell,
            price: exec_price,
            size: self.position,
            fee,
            pnl: net_proceeds,
        });
        self.position = Decimal::ZERO;
    }

    /// Appends one equity sample and one return per call, relative to
    /// `prev_equity` — seeded to `initial_balance` so the very first candle's
    /// return is relative to the starting balance, matching `backtester.go`'s
    /// `Run()` (`prevEquity := initialBalance`, one push per candle, no gap
    /// on the first iteration).
    fn record_equity(&mut self, last_price: Decimal) {
        let equity = self.balance + self.position * last_price;
        if self.prev_equity > Decimal::ZERO {
            let ret = ((equity - self.prev_equity) / self.prev_equity).to_f64().unwrap_or(0.0);
            self.returns.push(ret);
        }
        self.equity_curve.push(equity);
        self.prev_equity = equity;
    }

    fn max_drawdown(&self) -> f64 {
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        for &equity in &self.equity_curve {
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let drawdown = (peak - equity) / peak;
                if drawdown > max_dd {
                    max_dd = drawdown;
                }
            }
        }
        max_dd.to_f64().unwrap_or(0.0)
    }

    /// Win rate and total profit, counting only completed sell trades
    /// (a buy alone realizes nothing).
    fn sell_stats(&self) -> (f64, Decimal) {
        let sells: Vec<&SimulatedTrade> = self.trades.iter().filter(|t| t.side == Side::Sell).collect();
        if sells.is_empty() {
            return (0.0, Decimal::ZERO);
        }
        let wins = sells.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        let total_profit: Decimal = sells
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .sum();
        (wins as f64 / sells.len() as f64, total_profit)
    }

    /// Sharpe ratio over the per-step return series using population
    /// (not sample) standard deviation, with no annualization factor —
    /// matches `calculateSharpeRatio` in the original verbatim.
    fn sharpe_ratio(&self) -> f64 {
        if self.returns.is_empty() {
            return 0.0;
        }
        let mean = self.returns.iter().sum::<f64>() / self.returns.len() as f64;
        let variance = self.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / self.returns.len() as f64;
        let stddev = variance.sqrt();
        if stddev == 0.0 {
            return 0.0;
        }
        mean / stddev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strategy::MaStrategy;

    fn candle(close: &str, minute: i64) -> Candle {
        let price: Decimal = close.parse().unwrap();
        Candle {
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            period: "1m".to_string(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            timestamp: Utc::now() + chrono::Duration::minutes(minute),
        }
    }

    #[test]
    fn test_backtest_trend_then_reverse_liquidates_final_position() {
        let strategy = Box::new(MaStrategy::new(2, 4));
        let backtester = Backtester::new(strategy, Decimal::from(10_000));

        let mut candles = Vec::new();
        // flat warmup to fill the long window
        for (i, price) in ["100", "100", "100", "100"].iter().enumerate() {
            candles.push(candle(price, i as i64));
        }
        // uptrend triggers a buy
        for (i, price) in ["110", "120", "130"].iter().enumerate() {
            candles.push(candle(price, 4 + i as i64));
        }
        // reversal triggers a sell
        for (i, price) in ["90", "80"].iter().enumerate() {
            candles.push(candle(price, 7 + i as i64));
        }

        let report = backtester.run(&candles);

        assert_eq!(report.strategy_name, "ma");
        assert!(report.trade_count >= 2, "expected at least a buy and a sell");
        assert_eq!(report.trades.first().unwrap().side, Side::Buy);
        assert!(report.final_balance > Decimal::ZERO);
    }

    #[test]
    fn test_sell_pnl_is_net_proceeds_not_cost_basis_adjusted() {
        let strategy = Box::new(MaStrategy::new(1, 2));
        let mut backtester = Backtester::new(strategy, Decimal::from(1000));

        backtester.buy(&candle("100", 0));
        let position = backtester.position;

        backtester.sell(&candle("110", 1));

        let trade = backtester.trades.last().unwrap();
        let expected_proceeds = position * trade.price;
        let expected_pnl = expected_proceeds - trade.fee;
        assert_eq!(trade.pnl, expected_pnl);
    }

    #[test]
    fn test_buy_quantity_matches_spec_formula() {
        let strategy = Box::new(MaStrategy::new(1, 2));
        let mut backtester = Backtester::new(strategy, Decimal::from(1000));
        backtester.buy(&candle("100", 0));

        let exec_price: Decimal = "100.05".parse().unwrap(); // 100 * 1.0005
        let fee_rate: Decimal = "0.001".parse().unwrap();
        let expected_size = Decimal::from(1000) / (exec_price * (Decimal::ONE + fee_rate));

        assert_eq!(backtester.position, expected_size);
        assert_eq!(backtester.balance, Decimal::ZERO);
    }

    #[test]
    fn test_equity_curve_and_returns_have_exactly_one_entry_per_candle() {
        let strategy = Box::new(MaStrategy::new(2, 4));
        let mut backtester = Backtester::new(strategy, Decimal::from(10_000));

        // Same trend-then-reverse sequence as above: a position is open
        // going into the last candle, so the forced liquidation must not
        // append an (N+1)th sample.
        let closes = ["100", "100", "100", "100", "110", "120", "130", "90", "80"];
        let candles: Vec<Candle> =
            closes.iter().enumerate().map(|(i, p)| candle(p, i as i64)).collect();

        // Drive the same loop `run` uses, without consuming `self`, so the
        // equity curve can be inspected afterwards.
        for candle in &candles {
            match backtester.strategy.on_candle(candle) {
                Action::Buy => backtester.buy(candle),
                Action::Sell => backtester.sell(candle),
                Action::Hold => {}
            }
            backtester.record_equity(candle.close);
        }
        if backtester.position > Decimal::ZERO {
            if let Some(last) = candles.last() {
                backtester.sell(last);
            }
        }

        assert_eq!(backtester.equity_curve.len(), candles.len());
        assert_eq!(backtester.returns.len(), candles.len());
        assert!(backtester.position == Decimal::ZERO, "final position should be liquidated");
    }

    #[test]
    fn test_first_return_is_relative_to_initial_balance() {
        let strategy = Box::new(MaStrategy::new(1, 2));
        let mut backtester = Backtester::new(strategy, Decimal::from(1000));

        backtester.record_equity(Decimal::from(1100));

        assert_eq!(backtester.equity_curve.len(), 1);
        assert_eq!(backtester.returns.len(), 1);
        assert!((backtester.returns[0] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_max_drawdown_tracks_peak_to_trough() {
        let strategy = Box::new(MaStrategy::new(1, 2));
        let mut backtester = Backtester::new(strategy, Decimal::from(100));
        backtester.equity_curve = vec![
            Decimal::from(100),
            Decimal::from(150),
            Decimal::from(90),
            Decimal::from(120),
        ];
        let dd = backtester.max_drawdown();
        assert!((dd - 0.4).abs() < 1e-9);
    }
}
