use super::query::{select, DateKey};
use super::{SeriesError, MARKET_KEY};
use crate::data::polygon::{sort_market, PolygonFetcher};
use crate::data::FetchOutcome;
use crate::domain::MarketBar;
use crate::store::Store;
use chrono::NaiveDate;
use tracing::{info, warn};

/// Sessions fetched when the snapshot is empty.
pub const MARKET_BOOTSTRAP_DAYS: i64 = 503;

/// Sessions behind beyond which a quick check reports the snapshot stale.
pub const QUICK_CHECK_MAX_DAYS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    /// Holds the last completed session.
    Fresh,
    /// Too far behind for a quick check; nothing was fetched.
    Stale { sessions_behind: i64 },
    /// `dates` sessions were fetched and persisted.
    Updated { dates: usize },
    /// Fetching produced no rows.
    Unchanged,
}

/// All symbols' daily aggregates, one table under `cache/market`.
pub struct MarketSnapshot<'a> {
    store: &'a Store,
    fetcher: &'a PolygonFetcher,
}

impl<'a> MarketSnapshot<'a> {
    pub fn new(store: &'a Store, fetcher: &'a PolygonFetcher) -> Self {
        Self { store, fetcher }
    }

    pub fn load(&self) -> Result<Vec<MarketBar>, SeriesError> {
        Ok(self.store.get_table(MARKET_KEY)?.unwrap_or_default())
    }

    pub fn dates(&self) -> Result<Vec<NaiveDate>, SeriesError> {
        let mut dates: Vec<NaiveDate> = self.load()?.iter().map(|b| b.date).collect();
        dates.dedup();
        Ok(dates)
    }

    /// Bring the snapshot up to the last completed session.
    pub fn update(&self, quick_check: bool) -> Result<MarketStatus, SeriesError> {
        let calendar = self.fetcher.calendar();
        let existing = self.load()?;
        let end = calendar.last_completed_session()?;
        let last = existing.last().map(|b| b.date);
        if last == Some(end) {
            return Ok(MarketStatus::Fresh);
        }
        let start = match last {
            Some(last) => calendar.nth_next_trading_date(1, last)?,
            None => calendar.nth_previous_from_today(MARKET_BOOTSTRAP_DAYS)?,
        };
        if start > end {
            return Ok(MarketStatus::Fresh);
        }
        if quick_check {
            let behind = calendar.trading_days_between(start, end)?;
            if behind > QUICK_CHECK_MAX_DAYS {
                warn!(sessions_behind = behind, "market data is out of date, run an update");
                return Ok(MarketStatus::Stale { sessions_behind: behind });
            }
        }
        let dates = calendar.trading_daterange(start, end)?.to_vec();
        let fetched = self.fetcher.fetch_dates(dates)?;
        self.persist(existing, fetched)
    }

    /// Fill every session of the trailing window the snapshot lacks.
    pub fn backfill(&self) -> Result<MarketStatus, SeriesError> {
        let existing = self.load()?;
        let before = existing.len();
        match self.fetcher.fetch_market(existing)? {
            FetchOutcome::Rows(rows) if rows.len() > before => {
                let dates = count_dates(&rows);
                self.store.put_table(MARKET_KEY, &rows)?;
                info!(dates, rows = rows.len(), "market snapshot backfilled");
                Ok(MarketStatus::Updated { dates })
            }
            _ => Ok(MarketStatus::Unchanged),
        }
    }

    fn persist(&self, existing: Vec<MarketBar>, fetched: Vec<MarketBar>) -> Result<MarketStatus, SeriesError> {
        if fetched.is_empty() {
            return Ok(MarketStatus::Unchanged);
        }
        let dates = count_dates(&fetched);
        let mut rows = existing;
        rows.extend(fetched);
        let rows = sort_market(rows);
        self.store.put_table(MARKET_KEY, &rows)?;
        info!(dates, rows = rows.len(), "market snapshot updated");
        Ok(MarketStatus::Updated { dates })
    }

    pub fn range(&self, from: Option<&DateKey>, to: Option<&DateKey>) -> Result<Option<Vec<MarketBar>>, SeriesError> {
        let rows = self.load()?;
        let mut dates: Vec<NaiveDate> = rows.iter().map(|b| b.date).collect();
        dates.dedup();
        select(&rows, |b| b.date, &dates, self.fetcher.calendar(), from, to)
    }

    /// Every symbol's bar for one session.
    pub fn get(&self, key: &DateKey) -> Result<Option<Vec<MarketBar>>, SeriesError> {
        self.range(Some(key), Some(key))
    }
}

fn count_dates(rows: &[MarketBar]) -> usize {
    let mut dates: Vec<NaiveDate> = rows.iter().map(|b| b.date).collect();
    dates.sort();
    dates.dedup();
    dates.len()
}
