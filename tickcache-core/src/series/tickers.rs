use super::{SeriesError, TICKERS_NAMESPACE};
use crate::data::FinvizFetcher;
use crate::domain::TickerEntry;
use crate::store::{join_key, Store};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Content type of cached ticker entries.
pub const TICKER_ENTRY_TYPE: &str = "TickerEntry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerStatus {
    /// Cached entry younger than the TTL.
    Fresh,
    Refreshed,
    /// Neither details nor news came back; any cached entry was dropped.
    Removed,
}

/// Per-symbol `{details, news}` entries under `cache/tickers`.
pub struct TickerCache<'a> {
    store: &'a Store,
    fetcher: &'a FinvizFetcher,
}

impl<'a> TickerCache<'a> {
    pub fn new(store: &'a Store, fetcher: &'a FinvizFetcher) -> Self {
        Self { store, fetcher }
    }

    pub fn key(symbol: &str) -> String {
        join_key(TICKERS_NAMESPACE, &symbol.to_uppercase())
    }

    pub fn load(&self, symbol: &str) -> Result<Option<TickerEntry>, SeriesError> {
        Ok(self.store.get_json(&Self::key(symbol), TICKER_ENTRY_TYPE)?)
    }

    /// Refetch the entry when missing or older than the TTL.
    pub fn refresh(&self, symbol: &str, now: DateTime<Utc>) -> Result<TickerStatus, SeriesError> {
        let key = Self::key(symbol);
        // An unreadable entry is refetched rather than reported.
        if let Ok(Some(entry)) = self.load(symbol) {
            if !entry.is_stale(now) {
                debug!(symbol, "ticker entry is fresh");
                return Ok(TickerStatus::Fresh);
            }
        }
        let entry = TickerEntry {
            details: self.fetcher.fetch_details(symbol)?.rows(),
            news: self.fetcher.fetch_news(symbol)?.rows(),
            fetched_at: now,
        };
        if entry.is_empty() {
            self.store.delete(&key)?;
            info!(symbol, "no ticker data, entry removed");
            return Ok(TickerStatus::Removed);
        }
        self.store.put_json(&key, TICKER_ENTRY_TYPE, &entry)?;
        info!(symbol, "ticker entry refreshed");
        Ok(TickerStatus::Refreshed)
    }
}
