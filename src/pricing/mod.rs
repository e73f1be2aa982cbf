//! Pricing engine.
//!
//! Aggregates LP quotes per instrument into a top-of-book view (stale quotes
//! filtered out, mid normalized to tick, optional CFD markup on the ask) and
//! owns the OHLCV candle aggregator fed by the matching engine's trades.

pub mod candles;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::market::types::{price_to_ticks, ticks_to_price};

pub use candles::{Candle, CandleSeries, CorporateAction, Timeframe, ALL_TIMEFRAMES};

/// One liquidity provider's quote.
#[derive(Debug, Clone)]
pub struct LpQuote {
    pub provider: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub received_at: DateTime<Utc>,
}

/// Aggregated top-of-book across fresh providers.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedQuote {
    pub instrument_id: Uuid,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub spread: f64,
    pub spread_bp: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct PricingEngine {
    config: Arc<ConfigProvider>,
    clock: Clock,
    quotes: RwLock<HashMap<Uuid, HashMap<String, LpQuote>>>,
    candles: RwLock<HashMap<Uuid, CandleSeries>>,
}

impl PricingEngine {
    pub fn new(config: Arc<ConfigProvider>, clock: Clock) -> Self {
        Self {
            config,
            clock,
            quotes: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
        }
    }

    pub fn ingest_quote(
        &self,
        instrument_id: Uuid,
        provider: &str,
        bid: f64,
        ask: f64,
        bid_size: f64,
        ask_size: f64,
    ) {
        if bid <= 0.0 || ask <= 0.0 || ask < bid {
            return;
        }
        let quote = LpQuote {
            provider: provider.to_string(),
            bid,
            ask,
            bid_size,
            ask_size,
            received_at: self.clock.now(),
        };
        self.quotes
            .write()
            .entry(instrument_id)
            .or_default()
            .insert(provider.to_string(), quote);
    }

    /// Best bid/ask across providers whose quote is fresher than the stale
    /// timeout. `None` when no fresh quote exists.
    pub fn aggregated(&self, instrument_id: Uuid, tick_size: f64) -> Option<AggregatedQuote> {
        let cfg = self.config.snapshot();
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::milliseconds(cfg.stale_quote_timeout_ms);

        let quotes = self.quotes.read();
        let fresh: Vec<&LpQuote> = quotes
            .get(&instrument_id)?
            .values()
            .filter(|q| q.received_at >= cutoff)
            .collect();
        if fresh.is_empty() {
            return None;
        }

        let best_bid = fresh.iter().max_by(|a, b| a.bid.total_cmp(&b.bid))?;
        let best_ask = fresh.iter().min_by(|a, b| a.ask.total_cmp(&b.ask))?;

        let mid_raw = (best_bid.bid + best_ask.ask) / 2.0;
        // Normalize mid to the instrument tick.
        let mid = match price_to_ticks((mid_raw / tick_size).round() * tick_size, tick_size) {
            Some(ticks) => ticks_to_price(ticks, tick_size),
            None => mid_raw,
        };

        let mut ask = best_ask.ask;
        if cfg.cfd_markup_bp > 0.0 {
            ask += cfg.cfd_markup_bp * mid / 10_000.0;
        }

        let spread = ask - best_bid.bid;
        Some(AggregatedQuote {
            instrument_id,
            bid: best_bid.bid,
            ask,
            mid,
            spread,
            spread_bp: if mid > 0.0 { spread / mid * 10_000.0 } else { 0.0 },
            bid_size: best_bid.bid_size,
            ask_size: best_ask.ask_size,
            timestamp: now,
        })
    }

    /// Mark price for position valuation: aggregated mid, falling back to
    /// the last trade recorded in the candle series.
    pub fn mark_price(&self, instrument_id: Uuid, tick_size: f64) -> Option<f64> {
        if let Some(quote) = self.aggregated(instrument_id, tick_size) {
            return Some(quote.mid);
        }
        self.candles
            .read()
            .get(&instrument_id)?
            .candles(Timeframe::S1, 1, None, None, &[])
            .last()
            .map(|c| c.close)
    }

    /// Feed one executed trade into the candle aggregator.
    pub fn record_trade(&self, instrument_id: Uuid, price: f64, qty: f64, ts: DateTime<Utc>) {
        self.candles.write().entry(instrument_id).or_default().record_trade(price, qty, ts);
    }

    pub fn candles(
        &self,
        instrument_id: Uuid,
        timeframe: Timeframe,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        actions: &[CorporateAction],
    ) -> Vec<Candle> {
        self.candles
            .read()
            .get(&instrument_id)
            .map(|series| series.candles(timeframe, limit, start, end, actions))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;

    fn engine() -> PricingEngine {
        PricingEngine::new(Arc::new(ConfigProvider::new(ConfigSnapshot::default())), Clock::new())
    }

    #[test]
    fn test_best_across_providers() {
        let engine = engine();
        let instrument = Uuid::new_v4();
        engine.ingest_quote(instrument, "lp-a", 99.0, 101.0, 10.0, 10.0);
        engine.ingest_quote(instrument, "lp-b", 99.5, 100.5, 5.0, 5.0);

        let quote = engine.aggregated(instrument, 0.5).unwrap();
        assert_eq!(quote.bid, 99.5);
        assert_eq!(quote.ask, 100.5);
        assert_eq!(quote.mid, 100.0);
        assert_eq!(quote.bid_size, 5.0);
    }

    #[test]
    fn test_stale_quotes_filtered() {
        let mut cfg = ConfigSnapshot::default();
        cfg.stale_quote_timeout_ms = 5_000;
        let engine = PricingEngine {
            config: Arc::new(ConfigProvider::new(cfg)),
            clock: Clock::new(),
            quotes: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
        };
        let instrument = Uuid::new_v4();
        // Quote stamped far in the past.
        engine.quotes.write().entry(instrument).or_default().insert(
            "lp-a".into(),
            LpQuote {
                provider: "lp-a".into(),
                bid: 99.0,
                ask: 101.0,
                bid_size: 1.0,
                ask_size: 1.0,
                received_at: Utc::now() - chrono::Duration::seconds(60),
            },
        );
        assert!(engine.aggregated(instrument, 0.5).is_none());
    }

    #[test]
    fn test_crossed_or_invalid_quote_ignored() {
        let engine = engine();
        let instrument = Uuid::new_v4();
        engine.ingest_quote(instrument, "lp-a", 101.0, 100.0, 1.0, 1.0); // crossed
        engine.ingest_quote(instrument, "lp-b", -1.0, 100.0, 1.0, 1.0); // negative
        assert!(engine.aggregated(instrument, 0.5).is_none());
    }

    #[test]
    fn test_cfd_markup_applied_to_ask() {
        let mut cfg = ConfigSnapshot::default();
        cfg.cfd_markup_bp = 100.0; // 1%
        let engine = PricingEngine::new(Arc::new(ConfigProvider::new(cfg)), Clock::new());
        let instrument = Uuid::new_v4();
        engine.ingest_quote(instrument, "lp-a", 99.0, 101.0, 1.0, 1.0);

        let quote = engine.aggregated(instrument, 1.0).unwrap();
        // mid = 100, markup = 1% of mid = 1.0 on the ask.
        assert!((quote.ask - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_mark_price_falls_back_to_last_trade() {
        let engine = engine();
        let instrument = Uuid::new_v4();
        assert!(engine.mark_price(instrument, 0.5).is_none());
        engine.record_trade(instrument, 42.0, 1.0, Utc::now());
        assert_eq!(engine.mark_price(instrument, 0.5), Some(42.0));
    }
}
