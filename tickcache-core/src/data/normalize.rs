//! Row validation, TWAP, intraday slotting and gap filling.
//!
//! Pure functions from raw upstream records to canonical rows. Rows that fail
//! validation are dropped silently; a caller that ends up with no rows reports
//! `Empty` rather than persisting an empty table.

use crate::calendar::{TradingSegment, MARKET_TZ};
use crate::domain::{DailyBar, IntradayBar, MarketBar};
use crate::timeslot::{session_slot, timeslot_to_timestamp, Period};
use crate::twap::twap;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

/// One brokerage candle as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Candle {
    pub datetime: Option<i64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

/// One row of the grouped daily aggregates (`o c h l vw v T`, `n`/`t` ignored).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GroupedRow {
    #[serde(rename = "T")]
    pub symbol: Option<String>,
    #[serde(rename = "o")]
    pub open: Option<f64>,
    #[serde(rename = "h")]
    pub high: Option<f64>,
    #[serde(rename = "l")]
    pub low: Option<f64>,
    #[serde(rename = "c")]
    pub close: Option<f64>,
    #[serde(rename = "vw")]
    pub vwap: Option<f64>,
    #[serde(rename = "v")]
    pub volume: Option<f64>,
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

fn volume(v: Option<f64>) -> Option<u64> {
    v.filter(|x| x.is_finite() && *x >= 0.0).map(|x| x as u64)
}

struct Ohlcv {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl Candle {
    /// Epoch millis plus validated prices, or `None` when the row must be dropped.
    fn validated(&self) -> Option<(i64, Ohlcv)> {
        let ms = self.datetime.filter(|t| *t >= 0)?;
        Some((
            ms,
            Ohlcv {
                open: positive(self.open)?,
                high: positive(self.high)?,
                low: positive(self.low)?,
                close: positive(self.close)?,
                volume: volume(self.volume)?,
            },
        ))
    }
}

/// Daily candles to bars: `datetime` ms becomes the UTC date. Sorted by date.
pub fn daily_bars(symbol: &str, candles: &[Candle]) -> Vec<DailyBar> {
    let mut bars: Vec<DailyBar> = candles
        .iter()
        .filter_map(|c| {
            let (ms, p) = c.validated()?;
            let date = DateTime::<Utc>::from_timestamp_millis(ms)?.date_naive();
            Some(DailyBar::new(symbol, date, p.open, p.high, p.low, p.close, p.volume))
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    bars
}

/// Intraday candles to gap-filled bars sorted by (date, timeslot).
///
/// Candles outside the 04:00-20:00 session are dropped; each date that keeps
/// at least one real bar is filled out to the full slot range.
pub fn intraday_bars(symbol: &str, candles: &[Candle], period: Period) -> Vec<IntradayBar> {
    let minutes = period.minutes();
    let mut by_date: BTreeMap<NaiveDate, Vec<IntradayBar>> = BTreeMap::new();
    for candle in candles {
        let Some((ms, p)) = candle.validated() else {
            continue;
        };
        let Some(ts) = MARKET_TZ.timestamp_millis_opt(ms).single() else {
            continue;
        };
        let Some(slot) = session_slot(&ts, minutes) else {
            continue;
        };
        by_date.entry(ts.date_naive()).or_default().push(IntradayBar {
            symbol: symbol.to_string(),
            date: ts.date_naive(),
            timestamp: ts,
            timeslot: slot,
            segment: TradingSegment::of(&ts),
            open: p.open,
            high: p.high,
            low: p.low,
            close: p.close,
            volume: p.volume,
            twap: twap(p.open, p.high, p.low, p.close),
            filled: false,
        });
    }
    by_date
        .into_iter()
        .flat_map(|(date, bars)| gap_fill(symbol, date, bars, period.slots_per_day(), minutes))
        .collect()
}

/// Fill one date out to `slots` rows with contiguous slots from 0.
///
/// Missing slots carry the TWAP of the nearest earlier real bar, or the
/// nearest later one before the first real bar, as all four prices. They get
/// zero volume, a timestamp rebuilt from the slot and `filled = true`.
/// Duplicate slots keep the first occurrence. No real bar means no rows.
pub fn gap_fill(
    symbol: &str,
    date: NaiveDate,
    bars: Vec<IntradayBar>,
    slots: u32,
    period_minutes: u32,
) -> Vec<IntradayBar> {
    let mut real: Vec<Option<IntradayBar>> = vec![None; slots as usize];
    for bar in bars {
        if let Some(cell) = real.get_mut(bar.timeslot as usize) {
            if cell.is_none() {
                *cell = Some(bar);
            }
        }
    }
    let Some(first_twap) = real.iter().flatten().next().map(|b| b.twap) else {
        return Vec::new();
    };

    let mut carried = first_twap;
    real.into_iter()
        .enumerate()
        .map(|(slot, bar)| match bar {
            Some(bar) => {
                carried = bar.twap;
                bar
            }
            None => {
                let timestamp = timeslot_to_timestamp(slot as i64, period_minutes, date);
                IntradayBar {
                    symbol: symbol.to_string(),
                    date,
                    timestamp,
                    timeslot: slot as u32,
                    segment: TradingSegment::of(&timestamp),
                    open: carried,
                    high: carried,
                    low: carried,
                    close: carried,
                    volume: 0,
                    twap: carried,
                    filled: true,
                }
            }
        })
        .collect()
}

/// Grouped-aggregate rows for `date`; vwap must be positive too.
pub fn market_bars(date: NaiveDate, rows: &[GroupedRow]) -> Vec<MarketBar> {
    rows.iter()
        .filter_map(|r| {
            let symbol = r.symbol.as_deref().filter(|s| !s.is_empty())?;
            let (open, high, low, close) = (
                positive(r.open)?,
                positive(r.high)?,
                positive(r.low)?,
                positive(r.close)?,
            );
            Some(MarketBar {
                symbol: symbol.to_string(),
                date,
                open,
                high,
                low,
                close,
                vwap: positive(r.vwap)?,
                volume: volume(r.volume)?,
                twap: twap(open, high, low, close),
            })
        })
        .collect()
}

/// Sort by key and keep the first row of each key.
pub fn sort_dedup<T, K: Ord + Copy>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(|r| key(r));
    rows.dedup_by_key(|r| key(r));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeslot::timestamp_to_timeslot;

    fn ms(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        MARKET_TZ
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn candle(datetime: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> Candle {
        Candle {
            datetime: Some(datetime),
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: Some(c),
            volume: Some(v),
        }
    }

    #[test]
    fn daily_drops_invalid_and_sorts() {
        let candles = vec![
            candle(1_704_326_400_000, 11.0, 12.0, 10.0, 11.5, 200.0), // 2024-01-04
            candle(1_704_153_600_000, 10.0, 11.0, 9.0, 10.5, 100.0),  // 2024-01-02
            candle(1_704_240_000_000, 10.0, 11.0, 9.0, 0.0, 100.0),   // close = 0
        ];
        let bars = daily_bars("SPY", &candles);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert!(bars.iter().all(|b| b.twap > 0.0));
    }

    #[test]
    fn zero_open_and_negative_volume_rows_are_dropped() {
        let candles = vec![
            candle(1_704_153_600_000, 0.0, 11.0, 9.0, 10.5, 100.0),
            candle(1_704_153_600_000, 10.0, 11.0, 9.0, 10.5, -1.0),
            candle(-5, 10.0, 11.0, 9.0, 10.5, 1.0),
            Candle {
                high: Some(f64::INFINITY),
                ..candle(1_704_153_600_000, 10.0, 11.0, 9.0, 10.5, 1.0)
            },
        ];
        assert!(daily_bars("SPY", &candles).is_empty());
    }

    #[test]
    fn intraday_fills_every_slot() {
        let candles = vec![
            candle(ms(2024, 3, 5, 9, 30), 10.0, 10.0, 10.0, 10.0, 5.0),
            candle(ms(2024, 3, 5, 9, 35), 12.0, 12.0, 12.0, 12.0, 7.0),
        ];
        let bars = intraday_bars("SPY", &candles, Period::Five);
        assert_eq!(bars.len(), 192);
        for (i, bar) in bars.iter().enumerate() {
            assert_eq!(bar.timeslot as usize, i);
            assert_eq!(timestamp_to_timeslot(&bar.timestamp, 5), i as i64);
        }
        // backward fill before the first real bar, forward after the last
        assert_eq!(bars[0].close, 10.0);
        assert!(bars[0].filled);
        assert_eq!(bars[0].volume, 0);
        assert!(!bars[66].filled);
        assert_eq!(bars[66].volume, 5);
        assert_eq!(bars[191].close, 12.0);
        assert_eq!(bars[100].segment, TradingSegment::RegularHours);
    }

    #[test]
    fn dates_without_real_bars_are_dropped() {
        let candles = vec![
            candle(ms(2024, 3, 5, 9, 30), 10.0, 10.0, 10.0, 10.0, 5.0),
            candle(ms(2024, 3, 6, 9, 30), 0.0, 10.0, 10.0, 10.0, 5.0),
            candle(ms(2024, 3, 6, 21, 0), 10.0, 10.0, 10.0, 10.0, 5.0),
        ];
        let bars = intraday_bars("SPY", &candles, Period::Thirty);
        assert_eq!(bars.len(), 32);
        assert!(bars.iter().all(|b| b.date == NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()));
    }

    #[test]
    fn grouped_rows_require_positive_vwap() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let good = GroupedRow {
            symbol: Some("AAPL".into()),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
            vwap: Some(1.2),
            volume: Some(10.0),
        };
        let bad = GroupedRow {
            vwap: Some(0.0),
            ..good.clone()
        };
        let bars = market_bars(date, &[good, bad]);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "AAPL");
    }

    #[test]
    fn sort_dedup_keeps_first() {
        let rows = vec![(2, 'a'), (1, 'b'), (2, 'c')];
        assert_eq!(sort_dedup(rows, |r| r.0), vec![(1, 'b'), (2, 'a')]);
    }
}
