//! Bar rows: the canonical schema every adapter normalizes into.

use crate::calendar::{TradingSegment, MARKET_TZ};
use crate::twap::twap;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Shared accessors over the OHLCV part of a row.
pub trait Ohlcv {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> u64;

    /// Prices strictly positive and finite.
    fn prices_valid(&self) -> bool {
        [self.open(), self.high(), self.low(), self.close()]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
    }
}

/// One symbol, one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub twap: f64,
}

impl DailyBar {
    /// Build a bar, deriving its TWAP.
    pub fn new(
        symbol: impl Into<String>,
        date: NaiveDate,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            date,
            open,
            high,
            low,
            close,
            volume,
            twap: twap(open, high, low, close),
        }
    }
}

/// One symbol, one intraday slot.
///
/// `filled` marks rows synthesized by gap filling: zero volume and prices
/// carried from the nearest real bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntradayBar {
    pub symbol: String,
    pub date: NaiveDate,
    #[serde(with = "market_millis")]
    pub timestamp: DateTime<Tz>,
    pub timeslot: u32,
    pub segment: TradingSegment,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub twap: f64,
    pub filled: bool,
}

impl IntradayBar {
    pub fn key(&self) -> (NaiveDate, u32) {
        (self.date, self.timeslot)
    }
}

/// One row of the grouped daily aggregates: one symbol on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: u64,
    pub twap: f64,
}

macro_rules! impl_ohlcv {
    ($($ty:ty),*) => {$(
        impl Ohlcv for $ty {
            fn open(&self) -> f64 { self.open }
            fn high(&self) -> f64 { self.high }
            fn low(&self) -> f64 { self.low }
            fn close(&self) -> f64 { self.close }
            fn volume(&self) -> u64 { self.volume }
        }
    )*};
}

impl_ohlcv!(DailyBar, IntradayBar, MarketBar);

/// Epoch milliseconds on the wire, US/Eastern in memory.
pub mod market_millis {
    use super::MARKET_TZ;
    use chrono::{DateTime, TimeZone};
    use chrono_tz::Tz;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Tz>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(ts.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Tz>, D::Error> {
        let ms = i64::deserialize(d)?;
        MARKET_TZ
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {ms}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_bar_derives_twap() {
        let bar = DailyBar::new("SPY", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.0, 10.0, 10.0, 10.0, 5);
        assert_eq!(bar.twap, 10.0);
        assert!(bar.prices_valid());
    }

    #[test]
    fn nonpositive_price_is_invalid() {
        let mut bar = DailyBar::new("SPY", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 1.0, 2.0, 0.5, 1.5, 5);
        bar.low = 0.0;
        assert!(!bar.prices_valid());
        bar.low = f64::INFINITY;
        assert!(!bar.prices_valid());
    }

    #[test]
    fn intraday_timestamp_serializes_as_millis() {
        let ts = MARKET_TZ.timestamp_millis_opt(1_714_570_200_000).unwrap();
        let bar = IntradayBar {
            symbol: "SPY".into(),
            date: ts.date_naive(),
            timestamp: ts,
            timeslot: 330,
            segment: TradingSegment::RegularHours,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
            twap: 1.0,
            filled: false,
        };
        let json = serde_json::to_value(&bar).unwrap();
        assert_eq!(json["timestamp"], 1_714_570_200_000_i64);
        let back: IntradayBar = serde_json::from_value(json).unwrap();
        assert_eq!(back.timestamp, ts);
    }
}
