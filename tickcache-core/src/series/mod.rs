//! Incrementally updated, persisted series.
//!
//! Every series lives under a `cache/...` key as one table object. An update
//! loads what is persisted, asks the calendar whether anything can be new,
//! fetches only the missing sessions, then merges and writes the result back
//! in one store write. A fetch that yields no rows never touches the stored
//! table.

pub mod daily;
pub mod intraday;
pub mod market;
pub mod query;
pub mod reference;
pub mod tickers;

pub use daily::DailySeries;
pub use intraday::{resample, IntradaySeries};
pub use market::{MarketSnapshot, MarketStatus};
pub use query::DateKey;
pub use reference::ReferenceTable;
pub use tickers::{TickerCache, TickerStatus};

use crate::calendar::{CalendarError, TradingCalendar};
use crate::data::normalize::sort_dedup;
use crate::data::{DataError, FetchOutcome};
use crate::domain::{DailyBar, IntradayBar};
use crate::store::{Store, StoreError, TableRow};
use crate::timeslot::{Period, TimeslotError};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

pub const DAILY_NAMESPACE: &str = "cache/daily";
pub const TICKERS_NAMESPACE: &str = "cache/tickers";
pub const MARKET_KEY: &str = "cache/market";
pub const REFERENCE_KEY: &str = "cache/reference";

/// Namespace of persisted intraday series at `period`.
pub fn intraday_namespace(period: Period) -> String {
    format!("cache/intraday/{}", period.minutes())
}

/// Namespaces holding one object per symbol.
pub fn symbol_namespaces() -> [String; 4] {
    [
        DAILY_NAMESPACE.to_string(),
        intraday_namespace(Period::One),
        intraday_namespace(Period::Five),
        TICKERS_NAMESPACE.to_string(),
    ]
}

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("invalid date key: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Timeslot(#[from] TimeslotError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A persisted row with a date and a unique sort key.
pub trait SeriesRow: TableRow + Clone {
    type Key: Ord + Copy;

    fn key(&self) -> Self::Key;
    fn date(&self) -> NaiveDate;
}

impl SeriesRow for DailyBar {
    type Key = NaiveDate;

    fn key(&self) -> NaiveDate {
        self.date
    }

    fn date(&self) -> NaiveDate {
        self.date
    }
}

impl SeriesRow for IntradayBar {
    type Key = (NaiveDate, u32);

    fn key(&self) -> (NaiveDate, u32) {
        (self.date, self.timeslot)
    }

    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// What an update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Already holds the last completed session; nothing was fetched.
    Fresh,
    /// New rows were merged and persisted.
    Appended { added: usize },
    /// The fetch produced no rows (`empty`, `not_found` or `failed`).
    Unchanged(&'static str),
}

impl UpdateStatus {
    pub fn fetched(&self) -> bool {
        !matches!(self, UpdateStatus::Fresh)
    }

    pub fn added(&self) -> usize {
        match self {
            UpdateStatus::Appended { added } => *added,
            _ => 0,
        }
    }
}

/// Concatenate, sort by key and drop duplicates. Existing rows win.
pub fn merge<R: SeriesRow>(existing: Vec<R>, fetched: Vec<R>) -> Vec<R> {
    let mut rows = existing;
    rows.extend(fetched);
    sort_dedup(rows, R::key)
}

/// Distinct dates of a sorted series.
pub fn series_dates<R: SeriesRow>(rows: &[R]) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = rows.iter().map(R::date).collect();
    dates.dedup();
    dates
}

/// Load, fetch what is missing through `fetch(start, end)`, merge, persist.
///
/// `start` is `None` for an empty series (full history).
pub fn incremental_update<R: SeriesRow>(
    store: &Store,
    key: &str,
    calendar: &TradingCalendar,
    fetch: impl FnOnce(Option<NaiveDate>, NaiveDate) -> Result<FetchOutcome<Vec<R>>, DataError>,
) -> Result<UpdateStatus, SeriesError> {
    let existing = store.get_table::<R>(key)?.unwrap_or_default();
    let end = calendar.last_completed_session()?;
    let last = existing.last().map(R::date);
    if last == Some(end) {
        debug!(key, %end, "series is fresh");
        return Ok(UpdateStatus::Fresh);
    }
    let start = match last {
        Some(last) => Some(calendar.nth_next_trading_date(1, last)?),
        None => None,
    };
    if start.is_some_and(|start| start > end) {
        return Ok(UpdateStatus::Fresh);
    }

    match fetch(start, end)? {
        FetchOutcome::Rows(rows) => {
            let before = existing.len();
            let fresh: Vec<R> = rows
                .into_iter()
                .filter(|r| last.map_or(true, |last| r.date() > last))
                .collect();
            let merged = merge(existing, fresh);
            let added = merged.len().saturating_sub(before);
            if added == 0 {
                return Ok(UpdateStatus::Unchanged("empty"));
            }
            store.put_table(key, &merged)?;
            info!(key, added, rows = merged.len(), "series updated");
            Ok(UpdateStatus::Appended { added })
        }
        other => {
            debug!(key, outcome = other.label(), "series left untouched");
            Ok(UpdateStatus::Unchanged(other.label()))
        }
    }
}
