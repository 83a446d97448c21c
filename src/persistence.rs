//! Batch persistence (spec.md §4.5), grounded on
//! `original_source/internal/app/worker.go`'s `startPersistenceService` and
//! `internal/infrastructure` batching pattern: durable bus consumers feed
//! bounded in-memory buffers that flush to Postgres on a timer or once full,
//! whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::warn;

use crate::bus::{MarketBus, KLINES_WILDCARD, RAW_TRADES_WILDCARD};
use crate::metrics;
use crate::models::{Candle, Trade};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const TRADE_BATCH_SIZE: usize = 1000;
const TRADE_BUFFER_CAP: usize = TRADE_BATCH_SIZE * 10;
const TRADE_DURABLE: &str = "trade_saver";

const KLINE_BATCH_SIZE: usize = 100;
const KLINE_BUFFER_CAP: usize = KLINE_BATCH_SIZE * 10;
const KLINE_DURABLE: &str = "kline_saver";

/// Writes normalized trades from `market.raw.*.*` to the `trades` table.
pub struct TradeWriter {
    bus: MarketBus,
    pool: PgPool,
    buffer: Mutex<Vec<Trade>>,
}

impl TradeWriter {
    pub fn new(bus: MarketBus, pool: PgPool) -> Arc<Self> {
        Arc::new(Self { bus, pool, buffer: Mutex::new(Vec::with_capacity(TRADE_BATCH_SIZE)) })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut messages = self.bus.durable_subscribe(RAW_TRADES_WILDCARD, TRADE_DURABLE).await?;
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
                                self.enqueue(trade);
                            }
                            if let Err(err) = message.ack().await {
                                warn!(error = %err, "failed to ack trade_saver message");
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "trade_saver consumer error"),
                        None => break,
                    }
                }
            }
        }

        self.flush().await;
        Ok(())
    }

    fn enqueue(&self, trade: Trade) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= TRADE_BUFFER_CAP {
            buffer.remove(0);
            metrics::record_batch_overflow("trades");
        }
        buffer.push(trade);
    }

    async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(err) = self.insert_batch(&batch).await {
            warn!(error = %err, rows = batch.len(), "trade batch insert failed, re-queuing");
            let mut buffer = self.buffer.lock();
            let mut retry = batch;
            retry.append(&mut buffer);
            *buffer = retry;
            return;
        }

        metrics::record_batch_flush("trades", batch.len());
    }

    async fn insert_batch(&self, batch: &[Trade]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for trade in batch {
            sqlx::query(
                "INSERT INTO trades (trade_id, symbol, exchange, price, amount, side, time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (exchange, trade_id) DO NOTHING",
            )
            .bind(&trade.id)
            .bind(&trade.symbol)
            .bind(&trade.exchange)
            .bind(trade.price)
            .bind(trade.amount)
            .bind(match trade.side {
                crate::models::Side::Buy => "buy",
                crate::models::Side::Sell => "sell",
            })
            .bind(trade.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Writes completed candles from `market.kline.*.*` to the `klines` table.
pub struct KlineWriter {
    bus: MarketBus,
    pool: PgPool,
    buffer: Mutex<Vec<Candle>>,
}

impl KlineWriter {
    pub fn new(bus: MarketBus, pool: PgPool) -> Arc<Self> {
        Arc::new(Self { bus, pool, buffer: Mutex::new(Vec::with_capacity(KLINE_BATCH_SIZE)) })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut messages = self.bus.durable_subscribe(KLINES_WILDCARD, KLINE_DURABLE).await?;
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
                            if let Ok(candle) = serde_json::from_slice::<Candle>(&message.payload) {
                                self.enqueue(candle);
                            }
                            if let Err(err) = message.ack().await {
                                warn!(error = %err, "failed to ack kline_saver message");
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "kline_saver consumer error"),
                        None => break,
                    }
                }
            }
        }

        self.flush().await;
        Ok(())
    }

    fn enqueue(&self, candle: Candle) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= KLINE_BUFFER_CAP {
            buffer.remove(0);
            metrics::record_batch_overflow("klines");
        }
        buffer.push(candle);
    }

    async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(err) = self.insert_batch(&batch).await {
            warn!(error = %err, rows = batch.len(), "kline batch insert failed, re-queuing");
            let mut buffer = self.buffer.lock();
            let mut retry = batch;
            retry.append(&mut buffer);
            *buffer = retry;
            return;
        }

        metrics::record_batch_flush("klines", batch.len());
    }

    async fn insert_batch(&self, batch: &[Candle]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for candle in batch {
            sqlx::query(
                "INSERT INTO klines (symbol, exchange, period, open, high, low, close, volume, time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (exchange, symbol, period, time) DO UPDATE SET
                   open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low,
                   close = EXCLUDED.close, volume = EXCLUDED.volume",
            )
            .bind(&candle.symbol)
            .bind(&candle.exchange)
            .bind(&candle.period)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CandleRow {
    symbol: String,
    exchange: String,
    period: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    time: DateTime<Utc>,
}

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        Candle {
            symbol: row.symbol,
            exchange: row.exchange,
            period: row.period,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            timestamp: row.time,
        }
    }
}

/// Historical query path shared by the backtest loader and the
/// `/api/v1/klines` read endpoint (spec.md §5: "Database pool is shared
/// among batch writers and the historical query path").
///
/// Ascending by time, bounded to `[from, to]`.
pub async fn load_candles_range(
    pool: &PgPool,
    symbol: &str,
    period: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Candle>> {
    let rows = sqlx::query_as::<_, CandleRow>(
        "SELECT symbol, exchange, period, open, high, low, close, volume, time
         FROM klines
         WHERE symbol = $1 AND period = $2 AND time >= $3 AND time <= $4
         ORDER BY time ASC",
    )
    .bind(symbol)
    .bind(period)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
    .context("failed to load candle range")?;

    Ok(rows.into_iter().map(Candle::from).collect())
}

/// Most recent `limit` candles for a symbol/period, newest first
/// (spec.md §6: `GET /api/v1/klines/:symbol` response ordering).
pub async fn load_recent_candles(
    pool: &PgPool,
    symbol: &str,
    period: &str,
    limit: i64,
) -> Result<Vec<Candle>> {
    let rows = sqlx::query_as::<_, CandleRow>(
        "SELECT symbol, exchange, period, open, high, low, close, volume, time
         FROM klines
         WHERE symbol = $1 AND period = $2
         ORDER BY time DESC
         LIMIT $3",
    )
    .bind(symbol)
    .bind(period)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to load recent candles")?;

    Ok(rows.into_iter().map(Candle::from).collect())
}
