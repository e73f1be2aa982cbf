//! OHLCV candle aggregation.
//!
//! Trades from the matching engine are bucketed into the twelve supported
//! timeframes. VWAP is tracked per candle as Σ(p×q)/Σq. Corporate actions
//! (splits, dividends) are applied on read by scaling candles that opened
//! before the action's effective instant.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Candles kept per (instrument, timeframe) series.
const MAX_CANDLES_PER_SERIES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    S1,
    S5,
    S15,
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mo1,
}

pub const ALL_TIMEFRAMES: [Timeframe; 12] = [
    Timeframe::S1,
    Timeframe::S5,
    Timeframe::S15,
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::D1,
    Timeframe::W1,
    Timeframe::Mo1,
];

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::S5 => "5s",
            Timeframe::S15 => "15s",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1M",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1s" => Some(Timeframe::S1),
            "5s" => Some(Timeframe::S5),
            "15s" => Some(Timeframe::S15),
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "30m" => Some(Timeframe::M30),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            "1w" => Some(Timeframe::W1),
            "1M" => Some(Timeframe::Mo1),
            _ => None,
        }
    }

    /// Bucket start for a timestamp. Fixed-width frames truncate epoch
    /// seconds; weeks start Monday 00:00 UTC; months are calendar months.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = match self {
            Timeframe::S1 => 1,
            Timeframe::S5 => 5,
            Timeframe::S15 => 15,
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => {
                let day = ts.date_naive();
                let monday = day - Duration::days(day.weekday().num_days_from_monday() as i64);
                return Utc
                    .from_utc_datetime(&monday.and_hms_opt(0, 0, 0).unwrap_or_default());
            }
            Timeframe::Mo1 => {
                return Utc
                    .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(ts);
            }
        };
        let epoch = ts.timestamp();
        Utc.timestamp_opt(epoch - epoch.rem_euclid(secs), 0).single().unwrap_or(ts)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Candle {
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub trades: u64,
    #[serde(skip)]
    notional_sum: f64,
}

impl Candle {
    fn new(start: DateTime<Utc>, price: f64, qty: f64) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
            vwap: price,
            trades: 1,
            notional_sum: price * qty,
        }
    }

    fn record(&mut self, price: f64, qty: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += qty;
        self.trades += 1;
        self.notional_sum += price * qty;
        if self.volume > 0.0 {
            self.vwap = self.notional_sum / self.volume;
        }
    }

    /// Scale prices by a corporate-action factor (volume untouched).
    fn adjusted(&self, factor: f64) -> Candle {
        Candle {
            start: self.start,
            open: self.open * factor,
            high: self.high * factor,
            low: self.low * factor,
            close: self.close * factor,
            volume: self.volume,
            vwap: self.vwap * factor,
            trades: self.trades,
            notional_sum: self.notional_sum * factor,
        }
    }
}

/// Split or dividend adjustment applied to history on read.
#[derive(Debug, Clone)]
pub struct CorporateAction {
    pub factor: f64,
    pub effective_at: DateTime<Utc>,
}

/// Per-instrument candle series across all timeframes.
#[derive(Debug, Default)]
pub struct CandleSeries {
    by_timeframe: HashMap<Timeframe, BTreeMap<i64, Candle>>,
}

impl CandleSeries {
    pub fn record_trade(&mut self, price: f64, qty: f64, ts: DateTime<Utc>) {
        for timeframe in ALL_TIMEFRAMES {
            let start = timeframe.bucket_start(ts);
            let series = self.by_timeframe.entry(timeframe).or_default();
            series
                .entry(start.timestamp())
                .and_modify(|candle| candle.record(price, qty))
                .or_insert_with(|| Candle::new(start, price, qty));

            while series.len() > MAX_CANDLES_PER_SERIES {
                let oldest = *series.keys().next().unwrap_or(&0);
                series.remove(&oldest);
            }
        }
    }

    /// Candles in `[start, end]`, newest last, capped at `limit`, with
    /// corporate actions applied to candles that predate them.
    pub fn candles(
        &self,
        timeframe: Timeframe,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        actions: &[CorporateAction],
    ) -> Vec<Candle> {
        let Some(series) = self.by_timeframe.get(&timeframe) else {
            return Vec::new();
        };

        let mut selected: Vec<&Candle> = series
            .values()
            .filter(|c| start.map(|s| c.start >= s).unwrap_or(true))
            .filter(|c| end.map(|e| c.start <= e).unwrap_or(true))
            .collect();
        if selected.len() > limit {
            selected = selected.split_off(selected.len() - limit);
        }

        selected
            .into_iter()
            .map(|candle| {
                let factor: f64 = actions
                    .iter()
                    .filter(|a| candle.start < a.effective_at)
                    .map(|a| a.factor)
                    .product();
                if (factor - 1.0).abs() > f64::EPSILON {
                    candle.adjusted(factor)
                } else {
                    candle.clone()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_bucket_start_fixed_frames() {
        let t = ts(3_661); // 01:01:01
        assert_eq!(Timeframe::M1.bucket_start(t), ts(3_660));
        assert_eq!(Timeframe::H1.bucket_start(t), ts(3_600));
        assert_eq!(Timeframe::S5.bucket_start(t), ts(3_660));
    }

    #[test]
    fn test_bucket_start_week_is_monday() {
        // 2025-01-08 is a Wednesday; its week starts Monday 2025-01-06.
        let wednesday = Utc.with_ymd_and_hms(2025, 1, 8, 15, 30, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();
        assert_eq!(Timeframe::W1.bucket_start(wednesday), monday);
    }

    #[test]
    fn test_vwap() {
        let mut series = CandleSeries::default();
        series.record_trade(10.0, 1.0, ts(0));
        series.record_trade(20.0, 3.0, ts(1));

        let candles = series.candles(Timeframe::M1, 10, None, None, &[]);
        assert_eq!(candles.len(), 1);
        let candle = &candles[0];
        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.close, 20.0);
        assert_eq!(candle.high, 20.0);
        assert_eq!(candle.volume, 4.0);
        // VWAP = (10*1 + 20*3) / 4 = 17.5
        assert!((candle.vwap - 17.5).abs() < 1e-9);
    }

    #[test]
    fn test_separate_buckets() {
        let mut series = CandleSeries::default();
        series.record_trade(10.0, 1.0, ts(0));
        series.record_trade(12.0, 1.0, ts(61));

        let candles = series.candles(Timeframe::M1, 10, None, None, &[]);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 10.0);
        assert_eq!(candles[1].open, 12.0);
    }

    #[test]
    fn test_corporate_action_adjusts_history() {
        let mut series = CandleSeries::default();
        series.record_trade(100.0, 1.0, ts(0));
        series.record_trade(50.0, 1.0, ts(120));

        // 2:1 split effective at t=60 halves pre-split prices.
        let actions = [CorporateAction { factor: 0.5, effective_at: ts(60) }];
        let candles = series.candles(Timeframe::M1, 10, None, None, &actions);
        assert_eq!(candles[0].close, 50.0); // adjusted
        assert_eq!(candles[1].close, 50.0); // untouched
    }

    #[test]
    fn test_limit_returns_newest() {
        let mut series = CandleSeries::default();
        for i in 0..5 {
            series.record_trade(10.0 + i as f64, 1.0, ts(i * 60));
        }
        let candles = series.candles(Timeframe::M1, 2, None, None, &[]);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 14.0);
    }
}
