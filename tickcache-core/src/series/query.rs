//! Date keys for series lookups.

use super::SeriesError;
use crate::calendar::{CalendarError, TradingCalendar};
use chrono::NaiveDate;

/// A date, an ISO `YYYY-MM-DD` string, or a session offset into the series.
///
/// Offset `k >= 0` is `k` sessions after the first date; `k < 0` counts back
/// from the last date, so `-1` is the last date itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateKey {
    Date(NaiveDate),
    Iso(String),
    Offset(i64),
}

impl From<NaiveDate> for DateKey {
    fn from(date: NaiveDate) -> Self {
        DateKey::Date(date)
    }
}

impl From<&str> for DateKey {
    fn from(s: &str) -> Self {
        DateKey::Iso(s.to_string())
    }
}

impl From<i64> for DateKey {
    fn from(k: i64) -> Self {
        DateKey::Offset(k)
    }
}

impl std::str::FromStr for DateKey {
    type Err = SeriesError;

    /// Integers become offsets, everything else must be an ISO date.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(k) = s.parse::<i64>() {
            return Ok(DateKey::Offset(k));
        }
        parse_iso(s).map(DateKey::Date)
    }
}

fn parse_iso(s: &str) -> Result<NaiveDate, SeriesError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SeriesError::InvalidQuery(format!("{s}: {e}")))
}

impl DateKey {
    /// Resolve against the sorted distinct `dates` of a series. `None` when
    /// the series is empty or an offset runs off the calendar.
    pub fn resolve(&self, dates: &[NaiveDate], calendar: &TradingCalendar) -> Result<Option<NaiveDate>, SeriesError> {
        match self {
            DateKey::Date(date) => Ok(Some(*date)),
            DateKey::Iso(s) => parse_iso(s).map(Some),
            DateKey::Offset(k) => {
                let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
                    return Ok(None);
                };
                let date = if *k >= 0 {
                    calendar.nth_next_trading_date(*k, *first)
                } else {
                    calendar.nth_previous_trading_date((k + 1).abs(), *last)
                };
                match date {
                    Ok(date) => Ok(Some(date)),
                    Err(CalendarError::OutOfRange { .. }) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Rows whose date falls in `[from, to]` (either bound open when `None`).
/// An empty selection, or a bound that resolves to nothing, is `None`.
pub fn select<R: Clone>(
    rows: &[R],
    date_of: impl Fn(&R) -> NaiveDate,
    dates: &[NaiveDate],
    calendar: &TradingCalendar,
    from: Option<&DateKey>,
    to: Option<&DateKey>,
) -> Result<Option<Vec<R>>, SeriesError> {
    if rows.is_empty() {
        return Ok(None);
    }
    let bound = |key: Option<&DateKey>| -> Result<Option<Option<NaiveDate>>, SeriesError> {
        match key {
            Some(key) => Ok(key.resolve(dates, calendar)?.map(Some)),
            None => Ok(Some(None)),
        }
    };
    let (Some(lo), Some(hi)) = (bound(from)?, bound(to)?) else {
        return Ok(None);
    };
    let selected: Vec<R> = rows
        .iter()
        .filter(|r| {
            let date = date_of(r);
            lo.map_or(true, |lo| date >= lo) && hi.map_or(true, |hi| date <= hi)
        })
        .cloned()
        .collect();
    Ok((!selected.is_empty()).then_some(selected))
}
