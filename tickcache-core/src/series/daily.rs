use super::query::{select, DateKey};
use super::{incremental_update, series_dates, SeriesError, UpdateStatus, DAILY_NAMESPACE};
use crate::data::TdaFetcher;
use crate::domain::DailyBar;
use crate::store::{join_key, Store};

/// Daily bars for one symbol under `cache/daily/{SYMBOL}`.
pub struct DailySeries<'a> {
    store: &'a Store,
    fetcher: &'a TdaFetcher,
    symbol: String,
}

impl<'a> DailySeries<'a> {
    pub fn new(store: &'a Store, fetcher: &'a TdaFetcher, symbol: &str) -> Self {
        Self {
            store,
            fetcher,
            symbol: symbol.to_uppercase(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn key(&self) -> String {
        join_key(DAILY_NAMESPACE, &self.symbol)
    }

    pub fn load(&self) -> Result<Vec<DailyBar>, SeriesError> {
        Ok(self.store.get_table(&self.key())?.unwrap_or_default())
    }

    pub fn update(&self) -> Result<UpdateStatus, SeriesError> {
        incremental_update(self.store, &self.key(), self.fetcher.calendar(), |start, end| {
            self.fetcher.fetch_daily(&self.symbol, start, Some(end))
        })
    }

    /// Bars between two keys, both inclusive.
    pub fn range(&self, from: Option<&DateKey>, to: Option<&DateKey>) -> Result<Option<Vec<DailyBar>>, SeriesError> {
        let rows = self.load()?;
        let dates = series_dates(&rows);
        select(&rows, |b| b.date, &dates, self.fetcher.calendar(), from, to)
    }

    pub fn get(&self, key: &DateKey) -> Result<Option<DailyBar>, SeriesError> {
        Ok(self.range(Some(key), Some(key))?.and_then(|rows| rows.into_iter().next()))
    }
}
