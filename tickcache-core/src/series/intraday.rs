use super::query::{select, DateKey};
use super::{incremental_update, intraday_namespace, series_dates, SeriesError, UpdateStatus};
use crate::calendar::TradingSegment;
use crate::data::TdaFetcher;
use crate::domain::IntradayBar;
use crate::store::{join_key, Store};
use crate::timeslot::{timestamp_to_timeslot, timeslot_to_timestamp, Period};
use crate::twap::twap;
use std::collections::BTreeMap;

/// Intraday bars for one symbol at a sample period.
///
/// Only one- and five-minute series are persisted (`cache/intraday/{1,5}`);
/// any other sample period is resampled from the persisted source on read.
pub struct IntradaySeries<'a> {
    store: &'a Store,
    fetcher: &'a TdaFetcher,
    symbol: String,
    source: Period,
    sample_minutes: u32,
}

impl<'a> IntradaySeries<'a> {
    pub fn new(store: &'a Store, fetcher: &'a TdaFetcher, symbol: &str, sample_minutes: u32) -> Result<Self, SeriesError> {
        let source = match Period::source_for(sample_minutes)? {
            Period::Thirty => Period::Five,
            p => p,
        };
        Ok(Self {
            store,
            fetcher,
            symbol: symbol.to_uppercase(),
            source,
            sample_minutes,
        })
    }

    pub fn source(&self) -> Period {
        self.source
    }

    pub fn sample_minutes(&self) -> u32 {
        self.sample_minutes
    }

    pub fn key(&self) -> String {
        join_key(&intraday_namespace(self.source), &self.symbol)
    }

    /// Persisted source bars, not resampled.
    pub fn load_source(&self) -> Result<Vec<IntradayBar>, SeriesError> {
        Ok(self.store.get_table(&self.key())?.unwrap_or_default())
    }

    /// Bars at the sample period.
    pub fn load(&self) -> Result<Vec<IntradayBar>, SeriesError> {
        let rows = self.load_source()?;
        if self.sample_minutes == self.source.minutes() {
            return Ok(rows);
        }
        Ok(resample(&rows, self.sample_minutes))
    }

    pub fn update(&self) -> Result<UpdateStatus, SeriesError> {
        incremental_update(self.store, &self.key(), self.fetcher.calendar(), |start, end| {
            self.fetcher
                .fetch_intraday(&self.symbol, self.source.minutes(), start, Some(end))
        })
    }

    pub fn range(&self, from: Option<&DateKey>, to: Option<&DateKey>) -> Result<Option<Vec<IntradayBar>>, SeriesError> {
        let rows = self.load()?;
        let dates = series_dates(&rows);
        select(&rows, |b| b.date, &dates, self.fetcher.calendar(), from, to)
    }

    /// All bars of one session.
    pub fn get(&self, key: &DateKey) -> Result<Option<Vec<IntradayBar>>, SeriesError> {
        self.range(Some(key), Some(key))
    }
}

/// Aggregate sorted bars into `sample_minutes` buckets per date.
///
/// open is the first, close the last, high the max, low the min and volume
/// the sum of each bucket. A bucket is `filled` only when all of its bars are.
pub fn resample(bars: &[IntradayBar], sample_minutes: u32) -> Vec<IntradayBar> {
    let mut buckets: BTreeMap<(chrono::NaiveDate, i64), IntradayBar> = BTreeMap::new();
    for bar in bars {
        let slot = timestamp_to_timeslot(&bar.timestamp, sample_minutes);
        buckets
            .entry((bar.date, slot))
            .and_modify(|acc| {
                acc.high = acc.high.max(bar.high);
                acc.low = acc.low.min(bar.low);
                acc.close = bar.close;
                acc.volume += bar.volume;
                acc.filled &= bar.filled;
            })
            .or_insert_with(|| bar.clone());
    }
    buckets
        .into_iter()
        .filter(|((_, slot), _)| *slot >= 0)
        .map(|((date, slot), mut bar)| {
            bar.timestamp = timeslot_to_timestamp(slot, sample_minutes, date);
            bar.timeslot = slot as u32;
            bar.segment = TradingSegment::of(&bar.timestamp);
            bar.twap = twap(bar.open, bar.high, bar.low, bar.close);
            bar
        })
        .collect()
}
