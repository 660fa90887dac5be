//! Typed tables encoded as Parquet through polars.
//!
//! Each row type declares its column layout and a schema version; the store
//! records both next to the bytes so a load can refuse a table written by an
//! older layout instead of misreading it.

use super::StoreError;
use crate::calendar::{TradingSegment, MARKET_TZ};
use crate::domain::{DailyBar, IntradayBar, MarketBar, TickerRef};
use chrono::{NaiveDate, TimeZone, Utc};
use polars::prelude::*;
use std::io::Cursor;

/// A row type persisted as one table object.
pub trait TableRow: Sized {
    /// Content type recorded in the object metadata.
    const ROW_TYPE: &'static str;
    const SCHEMA_VERSION: u32;

    fn to_frame(rows: &[Self]) -> Result<DataFrame, StoreError>;
    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError>;
}

pub fn encode<T: TableRow>(rows: &[T]) -> Result<Vec<u8>, StoreError> {
    let mut df = T::to_frame(rows)?;
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(&mut df)
        .map_err(|e| StoreError::Encoding(format!("write parquet: {e}")))?;
    Ok(buf)
}

pub fn decode<T: TableRow>(bytes: &[u8]) -> Result<Vec<T>, StoreError> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| StoreError::Encoding(format!("read parquet: {e}")))?;
    T::from_frame(&df)
}

fn perr(context: &str) -> impl Fn(PolarsError) -> StoreError + '_ {
    move |e| StoreError::Encoding(format!("{context}: {e}"))
}

fn null_at(column: &str, row: usize) -> StoreError {
    StoreError::Encoding(format!("null {column} at row {row}"))
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid literal date")
}

fn date_column(name: &str, dates: impl Iterator<Item = NaiveDate>) -> Result<Column, StoreError> {
    let days: Vec<i32> = dates.map(|d| (d - epoch()).num_days() as i32).collect();
    Column::new(name.into(), days)
        .cast(&DataType::Date)
        .map_err(perr("date cast"))
}

fn read_dates(df: &DataFrame, name: &str) -> Result<Vec<NaiveDate>, StoreError> {
    let ca = df
        .column(name)
        .map_err(perr(name))?
        .date()
        .map_err(perr(name))?;
    (0..df.height())
        .map(|i| {
            ca.get(i)
                .map(|days| epoch() + chrono::Duration::days(i64::from(days)))
                .ok_or_else(|| null_at(name, i))
        })
        .collect()
}

fn read_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.f64().map_err(perr(name))?;
    (0..df.height())
        .map(|i| ca.get(i).ok_or_else(|| null_at(name, i)))
        .collect()
}

fn read_u64(df: &DataFrame, name: &str) -> Result<Vec<u64>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.u64().map_err(perr(name))?;
    (0..df.height())
        .map(|i| ca.get(i).ok_or_else(|| null_at(name, i)))
        .collect()
}

fn read_i64(df: &DataFrame, name: &str) -> Result<Vec<i64>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.i64().map_err(perr(name))?;
    (0..df.height())
        .map(|i| ca.get(i).ok_or_else(|| null_at(name, i)))
        .collect()
}

fn read_opt_i64(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.i64().map_err(perr(name))?;
    Ok((0..df.height()).map(|i| ca.get(i)).collect())
}

fn read_u32(df: &DataFrame, name: &str) -> Result<Vec<u32>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.u32().map_err(perr(name))?;
    (0..df.height())
        .map(|i| ca.get(i).ok_or_else(|| null_at(name, i)))
        .collect()
}

fn read_bool(df: &DataFrame, name: &str) -> Result<Vec<bool>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.bool().map_err(perr(name))?;
    (0..df.height())
        .map(|i| ca.get(i).ok_or_else(|| null_at(name, i)))
        .collect()
}

fn read_opt_str(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, StoreError> {
    let ca = df.column(name).map_err(perr(name))?.str().map_err(perr(name))?;
    Ok((0..df.height()).map(|i| ca.get(i).map(str::to_string)).collect())
}

fn read_str(df: &DataFrame, name: &str) -> Result<Vec<String>, StoreError> {
    read_opt_str(df, name)?
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| null_at(name, i)))
        .collect()
}

fn frame(columns: Vec<Column>) -> Result<DataFrame, StoreError> {
    DataFrame::new(columns).map_err(perr("dataframe creation"))
}

impl TableRow for DailyBar {
    const ROW_TYPE: &'static str = "DailyBar";
    const SCHEMA_VERSION: u32 = 1;

    fn to_frame(rows: &[Self]) -> Result<DataFrame, StoreError> {
        frame(vec![
            Column::new("symbol".into(), rows.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>()),
            date_column("date", rows.iter().map(|b| b.date))?,
            Column::new("open".into(), rows.iter().map(|b| b.open).collect::<Vec<_>>()),
            Column::new("high".into(), rows.iter().map(|b| b.high).collect::<Vec<_>>()),
            Column::new("low".into(), rows.iter().map(|b| b.low).collect::<Vec<_>>()),
            Column::new("close".into(), rows.iter().map(|b| b.close).collect::<Vec<_>>()),
            Column::new("volume".into(), rows.iter().map(|b| b.volume).collect::<Vec<_>>()),
            Column::new("twap".into(), rows.iter().map(|b| b.twap).collect::<Vec<_>>()),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let symbol = read_str(df, "symbol")?;
        let date = read_dates(df, "date")?;
        let open = read_f64(df, "open")?;
        let high = read_f64(df, "high")?;
        let low = read_f64(df, "low")?;
        let close = read_f64(df, "close")?;
        let volume = read_u64(df, "volume")?;
        let twap = read_f64(df, "twap")?;
        Ok(symbol
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| DailyBar {
                symbol,
                date: date[i],
                open: open[i],
                high: high[i],
                low: low[i],
                close: close[i],
                volume: volume[i],
                twap: twap[i],
            })
            .collect())
    }
}

impl TableRow for IntradayBar {
    const ROW_TYPE: &'static str = "IntradayBar";
    const SCHEMA_VERSION: u32 = 1;

    fn to_frame(rows: &[Self]) -> Result<DataFrame, StoreError> {
        frame(vec![
            Column::new("symbol".into(), rows.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>()),
            date_column("date", rows.iter().map(|b| b.date))?,
            Column::new(
                "timestamp".into(),
                rows.iter().map(|b| b.timestamp.timestamp_millis()).collect::<Vec<_>>(),
            ),
            Column::new("timeslot".into(), rows.iter().map(|b| b.timeslot).collect::<Vec<_>>()),
            Column::new(
                "segment".into(),
                rows.iter().map(|b| b.segment.as_str()).collect::<Vec<_>>(),
            ),
            Column::new("open".into(), rows.iter().map(|b| b.open).collect::<Vec<_>>()),
            Column::new("high".into(), rows.iter().map(|b| b.high).collect::<Vec<_>>()),
            Column::new("low".into(), rows.iter().map(|b| b.low).collect::<Vec<_>>()),
            Column::new("close".into(), rows.iter().map(|b| b.close).collect::<Vec<_>>()),
            Column::new("volume".into(), rows.iter().map(|b| b.volume).collect::<Vec<_>>()),
            Column::new("twap".into(), rows.iter().map(|b| b.twap).collect::<Vec<_>>()),
            Column::new("filled".into(), rows.iter().map(|b| b.filled).collect::<Vec<_>>()),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let symbol = read_str(df, "symbol")?;
        let date = read_dates(df, "date")?;
        let timestamp = read_i64(df, "timestamp")?;
        let timeslot = read_u32(df, "timeslot")?;
        let segment = read_str(df, "segment")?;
        let open = read_f64(df, "open")?;
        let high = read_f64(df, "high")?;
        let low = read_f64(df, "low")?;
        let close = read_f64(df, "close")?;
        let volume = read_u64(df, "volume")?;
        let twap = read_f64(df, "twap")?;
        let filled = read_bool(df, "filled")?;

        symbol
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| {
                let ts = MARKET_TZ
                    .timestamp_millis_opt(timestamp[i])
                    .single()
                    .ok_or_else(|| StoreError::Encoding(format!("bad timestamp at row {i}")))?;
                let seg = TradingSegment::parse(&segment[i])
                    .ok_or_else(|| StoreError::Encoding(format!("bad segment '{}'", segment[i])))?;
                Ok(IntradayBar {
                    symbol,
                    date: date[i],
                    timestamp: ts,
                    timeslot: timeslot[i],
                    segment: seg,
                    open: open[i],
                    high: high[i],
                    low: low[i],
                    close: close[i],
                    volume: volume[i],
                    twap: twap[i],
                    filled: filled[i],
                })
            })
            .collect()
    }
}

impl TableRow for MarketBar {
    const ROW_TYPE: &'static str = "MarketBar";
    const SCHEMA_VERSION: u32 = 1;

    fn to_frame(rows: &[Self]) -> Result<DataFrame, StoreError> {
        frame(vec![
            Column::new("symbol".into(), rows.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>()),
            date_column("date", rows.iter().map(|b| b.date))?,
            Column::new("open".into(), rows.iter().map(|b| b.open).collect::<Vec<_>>()),
            Column::new("high".into(), rows.iter().map(|b| b.high).collect::<Vec<_>>()),
            Column::new("low".into(), rows.iter().map(|b| b.low).collect::<Vec<_>>()),
            Column::new("close".into(), rows.iter().map(|b| b.close).collect::<Vec<_>>()),
            Column::new("vwap".into(), rows.iter().map(|b| b.vwap).collect::<Vec<_>>()),
            Column::new("volume".into(), rows.iter().map(|b| b.volume).collect::<Vec<_>>()),
            Column::new("twap".into(), rows.iter().map(|b| b.twap).collect::<Vec<_>>()),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let symbol = read_str(df, "symbol")?;
        let date = read_dates(df, "date")?;
        let open = read_f64(df, "open")?;
        let high = read_f64(df, "high")?;
        let low = read_f64(df, "low")?;
        let close = read_f64(df, "close")?;
        let vwap = read_f64(df, "vwap")?;
        let volume = read_u64(df, "volume")?;
        let twap = read_f64(df, "twap")?;
        Ok(symbol
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| MarketBar {
                symbol,
                date: date[i],
                open: open[i],
                high: high[i],
                low: low[i],
                close: close[i],
                vwap: vwap[i],
                volume: volume[i],
                twap: twap[i],
            })
            .collect())
    }
}

impl TableRow for TickerRef {
    const ROW_TYPE: &'static str = "TickerRef";
    const SCHEMA_VERSION: u32 = 1;

    fn to_frame(rows: &[Self]) -> Result<DataFrame, StoreError> {
        let opt = |f: fn(&TickerRef) -> &Option<String>| {
            rows.iter().map(|t| f(t).clone()).collect::<Vec<Option<String>>>()
        };
        frame(vec![
            Column::new("symbol".into(), rows.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>()),
            Column::new("name".into(), opt(|t| &t.name)),
            Column::new("market".into(), opt(|t| &t.market)),
            Column::new("locale".into(), opt(|t| &t.locale)),
            Column::new("exchange".into(), opt(|t| &t.exchange)),
            Column::new("kind".into(), opt(|t| &t.kind)),
            Column::new("active".into(), rows.iter().map(|t| t.active).collect::<Vec<_>>()),
            Column::new("currency_name".into(), opt(|t| &t.currency_name)),
            Column::new("cik".into(), opt(|t| &t.cik)),
            Column::new("composite_figi".into(), opt(|t| &t.composite_figi)),
            Column::new("share_class_figi".into(), opt(|t| &t.share_class_figi)),
            Column::new(
                "last_updated_utc".into(),
                rows.iter()
                    .map(|t| t.last_updated_utc.map(|ts| ts.timestamp_millis()))
                    .collect::<Vec<Option<i64>>>(),
            ),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let symbol = read_str(df, "symbol")?;
        let mut name = read_opt_str(df, "name")?;
        let mut market = read_opt_str(df, "market")?;
        let mut locale = read_opt_str(df, "locale")?;
        let mut exchange = read_opt_str(df, "exchange")?;
        let mut kind = read_opt_str(df, "kind")?;
        let active = read_bool(df, "active")?;
        let mut currency_name = read_opt_str(df, "currency_name")?;
        let mut cik = read_opt_str(df, "cik")?;
        let mut composite_figi = read_opt_str(df, "composite_figi")?;
        let mut share_class_figi = read_opt_str(df, "share_class_figi")?;
        let last_updated = read_opt_i64(df, "last_updated_utc")?;

        Ok(symbol
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| TickerRef {
                symbol,
                name: name[i].take(),
                market: market[i].take(),
                locale: locale[i].take(),
                exchange: exchange[i].take(),
                kind: kind[i].take(),
                active: active[i],
                currency_name: currency_name[i].take(),
                cik: cik[i].take(),
                composite_figi: composite_figi[i].take(),
                share_class_figi: share_class_figi[i].take(),
                last_updated_utc: last_updated[i].and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            })
            .collect())
    }
}
