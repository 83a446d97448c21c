//! Backtest strategies, grounded on `original_source/internal/strategy/*.go`.

use std::collections::VecDeque;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::models::{Candle, StrategyConfig};

/// What a strategy wants to do on the candle it was just shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

/// A strategy reacts to one candle at a time and decides an action.
/// Implementations hold their rolling state behind an internal lock so
/// `on_candle` can be called concurrently — the backtester itself drives it
/// sequentially, but nothing in the contract requires that.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn on_candle(&self, candle: &Candle) -> Action;
}

fn required_period(config: &StrategyConfig, key: &str) -> Result<usize> {
    let value = config
        .config
        .get(key)
        .ok_or_else(|| anyhow!("strategy config missing required key '{key}'"))?;
    let n = value
        .as_u64()
        .ok_or_else(|| anyhow!("strategy config key '{key}' must be a positive integer"))?;
    if n == 0 {
        return Err(anyhow!("strategy config key '{key}' must be greater than zero"));
    }
    Ok(n as usize)
}

/// Moving-average comparator: buy while the short-window average sits
/// above the long-window average, sell while it sits below, hold on a tie
/// or until enough candles have accumulated to fill the long window.
pub struct MaStrategy {
    short_period: usize,
    long_period: usize,
    window: Mutex<VecDeque<Decimal>>,
}

impl MaStrategy {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self { short_period, long_period, window: Mutex::new(VecDeque::with_capacity(long_period)) }
    }

    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let short_period = required_period(config, "short_period")?;
        let long_period = required_period(config, "long_period")?;
        if short_period >= long_period {
            return Err(anyhow!("short_period must be less than long_period"));
        }
        Ok(Self::new(short_period, long_period))
    }
}

fn average(values: impl Iterator<Item = Decimal>, count: usize) -> Decimal {
    let sum: Decimal = values.sum();
    sum / Decimal::from(count)
}

impl Strategy for MaStrategy {
    fn name(&self) -> &str {
        "ma"
    }

    fn on_candle(&self, candle: &Candle) -> Action {
        let mut window = self.window.lock();
        window.push_back(candle.close);
        while window.len() > self.long_period {
            window.pop_front();
        }

        if window.len() < self.long_period {
            return Action::Hold;
        }

        let long_avg = average(window.iter().copied(), self.long_period);
        let short_avg = average(
            window.iter().rev().take(self.short_period).copied(),
            self.short_period,
        );

        if short_avg > long_avg {
            Action::Buy
        } else if short_avg < long_avg {
            Action::Sell
        } else {
            Action::Hold
        }
    }
}

/// Moving-average crossover: buy on a golden cross (short average moves
/// from at-or-below to above the long average), sell on a death cross
/// (the reverse), hold otherwise. Unlike [`MaStrategy`] this only signals
/// on the step the relationship actually flips.
pub struct MaCrossV2Strategy {
    short_period: usize,
    long_period: usize,
    window: Mutex<MaCrossState>,
}

struct MaCrossState {
    candles: VecDeque<Decimal>,
    was_above: Option<bool>,
}

impl MaCrossV2Strategy {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self {
            short_period,
            long_period,
            window: Mutex::new(MaCrossState { candles: VecDeque::with_capacity(long_period), was_above: None }),
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let short_period = required_period(config, "short_period")?;
        let long_period = required_period(config, "long_period")?;
        if short_period >= long_period {
            return Err(anyhow!("short_period must be less than long_period"));
        }
        Ok(Self::new(short_period, long_period))
    }
}

impl Strategy for MaCrossV2Strategy {
    fn name(&self) -> &str {
        "ma_cross_v2"
    }

    fn on_candle(&self, candle: &Candle) -> Action {
        let mut state = self.window.lock();
        state.candles.push_back(candle.close);
        while state.candles.len() > self.long_period {
            state.candles.pop_front();
        }

        if state.candles.len() < self.long_period {
            return Action::Hold;
        }

        let long_avg = average(state.candles.iter().copied(), self.long_period);
        let short_avg = average(
            state.candles.iter().rev().take(self.short_period).copied(),
            self.short_period,
        );
        let is_above = short_avg > long_avg;

        let action = match state.was_above {
            None => Action::Hold,
            Some(false) if is_above => Action::Buy,
            Some(true) if !is_above => Action::Sell,
            _ => Action::Hold,
        };

        state.was_above = Some(is_above);
        action
    }
}

/// Construct a strategy from its type tag and config map
/// (`original_source/internal/strategy/factory.go`'s `NewStrategy`).
pub fn build_strategy(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    match config.strategy_type.as_str() {
        "ma" => Ok(Box::new(MaStrategy::from_config(config)?)),
        "ma_cross_v2" => Ok(Box::new(MaCrossV2Strategy::from_config(config)?)),
        other => Err(anyhow!("unknown strategy type '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(close: &str) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            period: "1m".to_string(),
            open: Decimal::from_str(close).unwrap(),
            high: Decimal::from_str(close).unwrap(),
            low: Decimal::from_str(close).unwrap(),
            close: Decimal::from_str(close).unwrap(),
            volume: Decimal::ONE,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ma_strategy_buys_when_short_average_exceeds_long() {
        let strategy = MaStrategy::new(2, 4);
        for price in ["100", "100", "100", "100"] {
            assert_eq!(strategy.on_candle(&candle(price)), Action::Hold);
        }
        // window now [100,100,100,100]; push two rising closes
        assert_eq!(strategy.on_candle(&candle("110")), Action::Buy);
        assert_eq!(strategy.on_candle(&candle("120")), Action::Buy);
    }

    #[test]
    fn test_ma_strategy_sells_when_short_average_below_long() {
        let strategy = MaStrategy::new(2, 4);
        for price in ["100", "100", "100", "100"] {
            strategy.on_candle(&candle(price));
        }
        assert_eq!(strategy.on_candle(&candle("90")), Action::Sell);
    }

    #[test]
    fn test_ma_cross_v2_signals_only_on_the_flip() {
        let strategy = MaCrossV2Strategy::new(2, 4);
        for price in ["100", "100", "100", "100"] {
            strategy.on_candle(&candle(price));
        }
        // still flat relative to itself -> Hold at the first evaluable step
        assert_eq!(strategy.on_candle(&candle("100")), Action::Hold);
        // short average rises above long -> golden cross
        assert_eq!(strategy.on_candle(&candle("130")), Action::Buy);
        // next candle: still above, no new cross
        assert_eq!(strategy.on_candle(&candle("131")), Action::Hold);
    }

    #[test]
    fn test_build_strategy_rejects_missing_periods() {
        let config = StrategyConfig { strategy_type: "ma".to_string(), config: Default::default() };
        assert!(build_strategy(&config).is_err());
    }

    #[test]
    fn test_build_strategy_rejects_unknown_type() {
        let mut map = std::collections::HashMap::new();
        map.insert("short_period".to_string(), serde_json::json!(2));
        map.insert("long_period".to_string(), serde_json::json!(4));
        let config = StrategyConfig { strategy_type: "does_not_exist".to_string(), config: map };
        assert!(build_strategy(&config).is_err());
    }
}
