//! Market bus client.
//!
//! A thin wrapper around `async-nats`'s JetStream context, grounded on the
//! original's `internal/infrastructure/nats.go` (connect, get-or-create the
//! `MARKET` stream over both wildcards) and on the teacher's pattern of a
//! small infra wrapper struct separating config from live state
//! (`scrapers/binance_session.rs`'s `SessionConfig`/`SessionManager` split),
//! applied here to bus setup instead of websocket session setup.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::pull, stream::Config as StreamConfig, Context as JsContext};
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{Candle, Trade};

pub const STREAM_NAME: &str = "MARKET";
pub const RAW_TRADES_WILDCARD: &str = "market.raw.*.*";
pub const KLINES_WILDCARD: &str = "market.kline.*.*";

/// Live connection to the market bus: a core NATS client (for the push
/// gateway's ephemeral subject subscriptions, matching the original's `NC`)
/// plus a JetStream context (for durable, at-least-once delivery to the
/// savers and kline processor, matching its `JS`).
#[derive(Clone)]
pub struct MarketBus {
    client: async_nats::Client,
    js: JsContext,
}

impl MarketBus {
    /// Connect and ensure the `MARKET` stream exists over both subject
    /// wildcards (create-or-update, matching the original's
    /// `InitNATS`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .context("failed to connect to NATS")?;
        let js = jetstream::new(client.clone());

        let stream_config = StreamConfig {
            name: STREAM_NAME.to_string(),
            subjects: vec![RAW_TRADES_WILDCARD.to_string(), KLINES_WILDCARD.to_string()],
            ..Default::default()
        };

        js.get_or_create_stream(stream_config)
            .await
            .context("failed to create or update MARKET stream")?;

        info!(stream = STREAM_NAME, "market bus stream ready");

        Ok(Self { client, js })
    }

    /// Ephemeral core-NATS subscription to a single subject, used by the
    /// push gateway for live fan-out (no durable state, no replay).
    pub async fn subscribe_subject(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))
    }

    pub fn raw_trade_subject(exchange: &str, symbol: &str) -> String {
        format!("market.raw.{exchange}.{symbol}")
    }

    pub fn kline_subject(period: &str, symbol: &str) -> String {
        format!("market.kline.{period}.{symbol}")
    }

    pub async fn publish_trade(&self, trade: &Trade) -> Result<()> {
        let subject = Self::raw_trade_subject(&trade.exchange, &trade.symbol);
        self.publish_json(subject, trade).await
    }

    pub async fn publish_candle(&self, candle: &Candle) -> Result<()> {
        let subject = Self::kline_subject(&candle.period, &candle.symbol);
        self.publish_json(subject, candle).await
    }

    async fn publish_json<T: Serialize>(&self, subject: String, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value).context("failed to serialize bus payload")?;
        self.js
            .publish(subject, payload.into())
            .await
            .context("failed to publish to bus")?;
        Ok(())
    }

    /// Create (or reattach to) a durable pull consumer bound to `subject`,
    /// used by the trade/kline savers and the kline processor. Manual ack,
    /// at-least-once (spec.md §4.3).
    pub async fn durable_subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<pull::Stream> {
        let stream = self
            .js
            .get_stream(STREAM_NAME)
            .await
            .context("MARKET stream not found")?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to create durable consumer {durable_name}"))?;

        let messages = consumer
            .messages()
            .await
            .with_context(|| format!("failed to open message stream for {durable_name}"))?;

        Ok(messages)
    }
}

/// Log-and-continue helper for the ubiquitous "publish failed, drop the
/// record" policy (spec.md §7: bus publish failure is transient, retrying
/// here would risk duplication, so we just drop and move on).
pub fn log_publish_failure(context: &str, err: &anyhow::Error) {
    warn!(error = %err, context, "bus publish failed, dropping record");
}
