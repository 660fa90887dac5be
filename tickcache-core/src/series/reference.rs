use super::{SeriesError, REFERENCE_KEY};
use crate::data::{FetchOutcome, PolygonFetcher};
use crate::domain::TickerRef;
use crate::store::Store;
use tracing::info;

/// Latest ticker reference listing under `cache/reference`.
pub struct ReferenceTable<'a> {
    store: &'a Store,
}

impl<'a> ReferenceTable<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Option<Vec<TickerRef>>, SeriesError> {
        Ok(self.store.get_table(REFERENCE_KEY)?)
    }

    /// Replace the listing. Returns the row count, or `None` when the fetch
    /// produced nothing and the old listing was kept.
    pub fn refresh(&self, fetcher: &PolygonFetcher) -> Result<Option<usize>, SeriesError> {
        match fetcher.fetch_tickers()? {
            FetchOutcome::Rows(tickers) => {
                self.store.put_table(REFERENCE_KEY, &tickers)?;
                info!(tickers = tickers.len(), "ticker reference updated");
                Ok(Some(tickers.len()))
            }
            _ => Ok(None),
        }
    }

    pub fn lookup(&self, symbol: &str) -> Result<Option<TickerRef>, SeriesError> {
        let symbol = symbol.to_uppercase();
        Ok(self.load()?.and_then(|rows| {
            rows.binary_search_by(|t| t.symbol.as_str().cmp(&symbol))
                .ok()
                .map(|i| rows[i].clone())
        }))
    }
}
