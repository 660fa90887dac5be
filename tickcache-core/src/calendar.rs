//! NYSE trading calendar.
//!
//! The calendar is computed once from exchange holiday rules over a fixed
//! window and every query is a binary search over the sorted session list.
//!
//! - Weekends, rule-based holidays with weekend observance, special closures
//! - Early closes (13:00) on July 3, the day after Thanksgiving, Christmas Eve
//! - Trading segments (pre-market / regular / extended / closed)
//! - Injectable [`Clock`] so "today" is deterministic in tests
//!
//! A `TradingCalendar` is cheap to clone and is passed explicitly to every
//! component that needs calendar arithmetic.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Market timezone used for every wall-clock conversion.
pub const MARKET_TZ: Tz = New_York;

/// Calendar errors. Both variants are programmer/configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("date {date} is outside the trading calendar window ({first} to {last})")]
    OutOfRange {
        date: NaiveDate,
        first: NaiveDate,
        last: NaiveDate,
    },
}

/// Intraday trading segment of a US/Eastern timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingSegment {
    PreMarket,
    RegularHours,
    ExtendedHours,
    Closed,
}

impl TradingSegment {
    /// Classify a market-local timestamp.
    ///
    /// 04:00-09:29 pre-market, 09:30-15:59 regular, 16:00-19:59 extended.
    pub fn of(timestamp: &DateTime<Tz>) -> Self {
        let (hour, minute) = (timestamp.hour(), timestamp.minute());
        match hour {
            16..=19 => TradingSegment::ExtendedHours,
            4..=8 => TradingSegment::PreMarket,
            9 if minute < 30 => TradingSegment::PreMarket,
            9..=15 => TradingSegment::RegularHours,
            _ => TradingSegment::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingSegment::PreMarket => "pre_market",
            TradingSegment::RegularHours => "regular_hours",
            TradingSegment::ExtendedHours => "extended_hours",
            TradingSegment::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_market" => Some(TradingSegment::PreMarket),
            "regular_hours" => Some(TradingSegment::RegularHours),
            "extended_hours" => Some(TradingSegment::ExtendedHours),
            "closed" => Some(TradingSegment::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TradingSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of "now". The system clock in production, a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Clock frozen at the given US/Eastern wall-clock time.
    pub fn at_market_time(date: NaiveDate, hour: u32, minute: u32) -> Self {
        let local = date
            .and_hms_opt(hour, minute, 0)
            .and_then(|dt| MARKET_TZ.from_local_datetime(&dt).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc());
        FixedClock(local)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// First day of the calendar window.
pub fn window_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).expect("valid literal date")
}

/// Last day of the calendar window (inclusive bound of the search).
pub fn window_end() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid literal date")
}

/// The NYSE session calendar.
#[derive(Clone)]
pub struct TradingCalendar {
    dates: Arc<[NaiveDate]>,
    early_closes: Arc<BTreeSet<NaiveDate>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TradingCalendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradingCalendar")
            .field("sessions", &self.dates.len())
            .field("first", &self.dates.first())
            .field("last", &self.dates.last())
            .finish()
    }
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar {
    /// NYSE calendar for the default window, driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (dates, early_closes) = build_sessions(window_start(), window_end());
        Self {
            dates: dates.into(),
            early_closes: Arc::new(early_closes),
            clock,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Current instant in the market timezone.
    pub fn now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&MARKET_TZ)
    }

    /// Today's market-local date.
    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    pub fn is_trading_date(&self, date: NaiveDate) -> bool {
        self.dates.binary_search(&date).is_ok()
    }

    /// The `n`-th session after `anchor` (`n == 0` returns `anchor`).
    pub fn nth_next_trading_date(
        &self,
        n: i64,
        anchor: NaiveDate,
    ) -> Result<NaiveDate, CalendarError> {
        if n < 0 {
            return Err(CalendarError::InvalidArgument(format!(
                "n must be >= 0, got {n}"
            )));
        }
        if n == 0 {
            return Ok(anchor);
        }
        let idx = self.lower_bound(anchor)? as i64 + n;
        self.at(idx, anchor)
    }

    /// The `n`-th session before `anchor` (`n == 0` returns `anchor`).
    pub fn nth_previous_trading_date(
        &self,
        n: i64,
        anchor: NaiveDate,
    ) -> Result<NaiveDate, CalendarError> {
        if n < 0 {
            return Err(CalendarError::InvalidArgument(format!(
                "n must be >= 0, got {n}"
            )));
        }
        if n == 0 {
            return Ok(anchor);
        }
        let idx = self.lower_bound(anchor)? as i64 - n;
        self.at(idx, anchor)
    }

    /// `nth_next_trading_date(n, today)`.
    pub fn nth_next_from_today(&self, n: i64) -> Result<NaiveDate, CalendarError> {
        self.nth_next_trading_date(n, self.today())
    }

    /// `nth_previous_trading_date(n, today)`.
    pub fn nth_previous_from_today(&self, n: i64) -> Result<NaiveDate, CalendarError> {
        self.nth_previous_trading_date(n, self.today())
    }

    /// Most recently completed session: the session before today.
    pub fn last_completed_session(&self) -> Result<NaiveDate, CalendarError> {
        self.nth_previous_from_today(1)
    }

    /// Sessions after the first session on or after `start`, up to and
    /// including `end` when it is a session. `between(d, d) == 0` for a
    /// session `d`.
    pub fn trading_days_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<i64, CalendarError> {
        let lo = self.lower_bound(start)?;
        let hi = self.upper_bound(end)?;
        Ok(hi as i64 - lo as i64 - 1)
    }

    /// Sessions in `[start, end]`, ascending. The returned range can be
    /// iterated any number of times.
    pub fn trading_daterange(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<TradingDateRange<'_>, CalendarError> {
        let (lo, hi) = self.range_bounds(start, end)?;
        Ok(TradingDateRange {
            dates: &self.dates[lo..hi],
        })
    }

    pub fn is_early_close(&self, date: NaiveDate) -> bool {
        self.early_closes.contains(&date)
    }

    /// Regular-session close for a session date.
    pub fn session_close(&self, date: NaiveDate) -> NaiveTime {
        if self.is_early_close(date) {
            NaiveTime::from_hms_opt(13, 0, 0).expect("valid literal time")
        } else {
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid literal time")
        }
    }

    /// True on a session date while any segment (pre, regular, extended) is live.
    pub fn market_open(&self, at: &DateTime<Tz>) -> bool {
        self.is_trading_date(at.date_naive()) && TradingSegment::of(at) != TradingSegment::Closed
    }

    pub fn market_open_now(&self) -> bool {
        self.market_open(&self.now())
    }

    // ── index helpers ───────────────────────────────────────────────

    fn check_window(&self, date: NaiveDate) -> Result<(), CalendarError> {
        let (first, last) = (window_start(), window_end());
        if date < first || date > last {
            return Err(CalendarError::OutOfRange { date, first, last });
        }
        Ok(())
    }

    fn lower_bound(&self, date: NaiveDate) -> Result<usize, CalendarError> {
        self.check_window(date)?;
        Ok(self.dates.partition_point(|d| *d < date))
    }

    fn upper_bound(&self, date: NaiveDate) -> Result<usize, CalendarError> {
        self.check_window(date)?;
        Ok(self.dates.partition_point(|d| *d <= date))
    }

    fn at(&self, idx: i64, anchor: NaiveDate) -> Result<NaiveDate, CalendarError> {
        if idx < 0 || idx as usize >= self.dates.len() {
            return Err(CalendarError::OutOfRange {
                date: anchor,
                first: window_start(),
                last: window_end(),
            });
        }
        Ok(self.dates[idx as usize])
    }

    /// Half-open index bounds of the sessions in `[start, end]`.
    fn range_bounds(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(usize, usize), CalendarError> {
        let lo = self.lower_bound(start)?;
        let hi = self.upper_bound(end)?;
        Ok((lo, hi.max(lo)))
    }
}

/// A re-iterable, finite, ascending run of sessions.
#[derive(Debug, Clone, Copy)]
pub struct TradingDateRange<'a> {
    dates: &'a [NaiveDate],
}

impl<'a> TradingDateRange<'a> {
    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'a, NaiveDate>> {
        self.dates.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn as_slice(&self) -> &'a [NaiveDate] {
        self.dates
    }

    pub fn to_vec(&self) -> Vec<NaiveDate> {
        self.dates.to_vec()
    }
}

impl<'a> IntoIterator for TradingDateRange<'a> {
    type Item = NaiveDate;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, NaiveDate>>;

    fn into_iter(self) -> Self::IntoIter {
        self.dates.iter().copied()
    }
}

// ── Holiday rules ───────────────────────────────────────────────────

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid rule date")
}

/// Saturday holidays are observed Friday, Sunday holidays Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> NaiveDate {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n).expect("valid rule date")
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let mut day = last_day_of_month(year, month);
    while day.weekday() != weekday {
        day -= Duration::days(1);
    }
    day
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (y, m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    ymd(y, m, 1) - Duration::days(1)
}

/// Gregorian Easter Sunday (anonymous algorithm).
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}

/// Unscheduled full-day closures inside the calendar window.
const SPECIAL_CLOSURES: &[(i32, u32, u32)] = &[
    (1994, 4, 27),  // Nixon funeral
    (2001, 9, 11),  // September 11
    (2001, 9, 12),
    (2001, 9, 13),
    (2001, 9, 14),
    (2004, 6, 11),  // Reagan funeral
    (2007, 1, 2),   // Ford mourning
    (2012, 10, 29), // Hurricane Sandy
    (2012, 10, 30),
    (2018, 12, 5),  // G.H.W. Bush mourning
    (2025, 1, 9),   // Carter mourning
];

/// Exchange holidays that fall in `year`.
fn holidays(year: i32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(12);

    // New Year's Day: a Saturday holiday is not moved into the prior year.
    let new_year = ymd(year, 1, 1);
    match new_year.weekday() {
        Weekday::Sat => {}
        Weekday::Sun => out.push(ymd(year, 1, 2)),
        _ => out.push(new_year),
    }
    if year >= 1998 {
        out.push(nth_weekday(year, 1, Weekday::Mon, 3));
    }
    out.push(nth_weekday(year, 2, Weekday::Mon, 3));
    out.push(easter_sunday(year) - Duration::days(2));
    out.push(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        out.push(observed(ymd(year, 6, 19)));
    }
    out.push(observed(ymd(year, 7, 4)));
    out.push(nth_weekday(year, 9, Weekday::Mon, 1));
    out.push(nth_weekday(year, 11, Weekday::Thu, 4));
    out.push(observed(ymd(year, 12, 25)));

    out.extend(
        SPECIAL_CLOSURES
            .iter()
            .filter(|(y, _, _)| *y == year)
            .map(|&(y, m, d)| ymd(y, m, d)),
    );
    out
}

/// Build the sorted session list and the early-close set for `[first, last]`.
fn build_sessions(first: NaiveDate, last: NaiveDate) -> (Vec<NaiveDate>, BTreeSet<NaiveDate>) {
    let closed: BTreeSet<NaiveDate> = (first.year()..=last.year()).flat_map(holidays).collect();

    let mut sessions = Vec::with_capacity(((last - first).num_days() as usize) * 5 / 7 + 1);
    let mut day = first;
    while day <= last {
        let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
        if !weekend && !closed.contains(&day) {
            sessions.push(day);
        }
        day += Duration::days(1);
    }

    let is_session = |d: NaiveDate| sessions.binary_search(&d).is_ok();
    let mut early = BTreeSet::new();
    for year in first.year()..=last.year() {
        let candidates = [
            ymd(year, 7, 3),
            nth_weekday(year, 11, Weekday::Thu, 4) + Duration::days(1),
            ymd(year, 12, 24),
        ];
        for d in candidates {
            if d >= first && d <= last && is_session(d) {
                early.insert(d);
            }
        }
    }
    (sessions, early)
}
