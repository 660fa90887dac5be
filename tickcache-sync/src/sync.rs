//! Bring the local cache in line with a desired symbol universe.
//!
//! One pass compacts the store, drops malformed artifacts and symbols that
//! left the universe, refreshes the market snapshot, then refreshes every
//! desired symbol in parallel chunks. A failing symbol is logged and counted;
//! the batch continues.

use crate::error::SyncError;
use crate::mapreduce::map_chunks;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tickcache_core::data::{FinvizFetcher, PolygonFetcher, TdaFetcher};
use tickcache_core::domain::{DailyBar, IntradayBar, MarketBar};
use tickcache_core::series::tickers::TICKER_ENTRY_TYPE;
use tickcache_core::series::{
    intraday_namespace, symbol_namespaces, DailySeries, IntradaySeries, MarketSnapshot, SeriesError,
    TickerCache, DAILY_NAMESPACE, MARKET_KEY, TICKERS_NAMESPACE,
};
use tickcache_core::store::{join_key, ObjectMeta, Store, TableRow};
use tickcache_core::timeslot::Period;
use tracing::{error, info, warn};

/// Receives per-symbol events during a sync pass. Called from worker threads.
pub trait SyncProgress: Send + Sync {
    fn on_start(&self, symbol: &str, total: usize);

    fn on_complete(&self, symbol: &str, total: usize, result: &Result<SymbolOutcome, SeriesError>);

    fn on_batch_complete(&self, summary: &SyncSummary);
}

/// Prints one line per symbol and a closing summary.
pub struct StdoutProgress;

impl SyncProgress for StdoutProgress {
    fn on_start(&self, symbol: &str, total: usize) {
        println!("[{total}] refreshing {symbol}...");
    }

    fn on_complete(&self, symbol: &str, _total: usize, result: &Result<SymbolOutcome, SeriesError>) {
        match result {
            Ok(outcome) => println!("  OK: {symbol} (+{} rows)", outcome.rows_added),
            Err(e) => println!("  FAIL: {symbol}: {e}"),
        }
    }

    fn on_batch_complete(&self, summary: &SyncSummary) {
        println!(
            "\nSync complete: {} desired, {} added, {} refreshed, {} removed, {} failed",
            summary.desired, summary.added, summary.refreshed, summary.removed, summary.failed
        );
    }
}

/// Reports nothing. Progress still reaches the log through `tracing`.
pub struct SilentProgress;

impl SyncProgress for SilentProgress {
    fn on_start(&self, _symbol: &str, _total: usize) {}
    fn on_complete(&self, _symbol: &str, _total: usize, _result: &Result<SymbolOutcome, SeriesError>) {}
    fn on_batch_complete(&self, _summary: &SyncSummary) {}
}

/// What one symbol refresh did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolOutcome {
    pub rows_added: usize,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Symbols cached before the pass.
    pub cached: usize,
    pub desired: usize,
    pub removed: usize,
    /// Desired symbols that were not cached before.
    pub added: usize,
    /// Desired symbols that were already cached.
    pub refreshed: usize,
    pub failed: usize,
    /// Malformed artifacts deleted by the structural check.
    pub cleaned: usize,
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub skip_intraday: bool,
    /// Only check the market snapshot's age instead of fetching missing sessions.
    pub market_quick_check: bool,
}

/// The adapters one sync pass talks to.
pub struct Upstreams<'a> {
    pub tda: &'a TdaFetcher,
    pub polygon: &'a PolygonFetcher,
    pub finviz: &'a FinvizFetcher,
}

pub struct CacheSynchronizer<'a> {
    store: &'a Store,
    upstreams: Upstreams<'a>,
    worker_budget: usize,
    options: SyncOptions,
}

impl<'a> CacheSynchronizer<'a> {
    pub fn new(store: &'a Store, upstreams: Upstreams<'a>, worker_budget: usize) -> Self {
        Self {
            store,
            upstreams,
            worker_budget,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Symbols present in any per-symbol namespace.
    pub fn cached_symbols(&self) -> Result<BTreeSet<String>, SyncError> {
        let mut cached = BTreeSet::new();
        for namespace in symbol_namespaces() {
            cached.extend(self.store.list(&namespace)?);
        }
        Ok(cached)
    }

    /// Delete artifacts whose content does not match their namespace.
    pub fn clean(&self) -> Result<usize, SyncError> {
        let mut removed = 0;
        let checks = [
            (DAILY_NAMESPACE.to_string(), DailyBar::ROW_TYPE, DailyBar::SCHEMA_VERSION),
            (intraday_namespace(Period::One), IntradayBar::ROW_TYPE, IntradayBar::SCHEMA_VERSION),
            (intraday_namespace(Period::Five), IntradayBar::ROW_TYPE, IntradayBar::SCHEMA_VERSION),
        ];
        for (namespace, row_type, version) in checks {
            for meta in self.store.list_meta(&namespace)? {
                if !is_table(&meta, row_type, version) {
                    removed += self.discard(&meta)?;
                }
            }
        }
        for meta in self.store.list_meta(TICKERS_NAMESPACE)? {
            if meta.content_type != TICKER_ENTRY_TYPE {
                removed += self.discard(&meta)?;
            }
        }
        if let Some(meta) = self.store.meta(MARKET_KEY)? {
            if !is_table(&meta, MarketBar::ROW_TYPE, MarketBar::SCHEMA_VERSION) {
                removed += self.discard(&meta)?;
            }
        }
        Ok(removed)
    }

    fn discard(&self, meta: &ObjectMeta) -> Result<usize, SyncError> {
        let key = meta.key();
        warn!(key = %key, content_type = %meta.content_type, rows = meta.rows, "removing malformed artifact");
        Ok(usize::from(self.store.delete(&key)?))
    }

    /// Remove `symbol` from every per-symbol namespace.
    pub fn drop_symbol(&self, symbol: &str) -> Result<(), SyncError> {
        let namespaces = symbol_namespaces();
        self.store.transaction(|tx| {
            for namespace in &namespaces {
                tx.delete(&join_key(namespace, symbol))?;
            }
            Ok::<_, SyncError>(())
        })
    }

    /// Refresh one symbol: ticker entry, daily bars, then intraday bars.
    pub fn refresh_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Result<SymbolOutcome, SeriesError> {
        let mut outcome = SymbolOutcome::default();
        TickerCache::new(self.store, self.upstreams.finviz).refresh(symbol, now)?;
        outcome.rows_added += DailySeries::new(self.store, self.upstreams.tda, symbol).update()?.added();
        if !self.options.skip_intraday {
            for period in [Period::One, Period::Five] {
                let series = IntradaySeries::new(self.store, self.upstreams.tda, symbol, period.minutes())?;
                outcome.rows_added += series.update()?.added();
            }
        }
        Ok(outcome)
    }

    /// Run one full pass towards `desired`, judging freshness by the
    /// calendar's clock.
    pub fn sync(&self, desired: &BTreeSet<String>, progress: &dyn SyncProgress) -> Result<SyncSummary, SyncError> {
        let now = self.upstreams.tda.calendar().now().with_timezone(&Utc);
        self.sync_at(desired, progress, now)
    }

    pub fn sync_at(
        &self,
        desired: &BTreeSet<String>,
        progress: &dyn SyncProgress,
        now: DateTime<Utc>,
    ) -> Result<SyncSummary, SyncError> {
        self.store.compact()?;
        let cleaned = self.clean()?;

        let cached = self.cached_symbols()?;
        let exclude: Vec<&String> = cached.difference(desired).collect();

        let snapshot = MarketSnapshot::new(self.store, self.upstreams.polygon);
        match snapshot.update(self.options.market_quick_check) {
            Ok(status) => info!(?status, "market snapshot"),
            Err(e) => error!(error = %e, "market snapshot refresh failed"),
        }

        info!(
            cached = cached.len(),
            desired = desired.len(),
            removing = exclude.len(),
            adding = desired.difference(&cached).count(),
            "synchronizing cache"
        );

        for symbol in &exclude {
            self.drop_symbol(symbol)?;
        }

        let symbols: Vec<&String> = desired.iter().collect();
        let total = symbols.len();
        let results = map_chunks(&symbols, self.worker_budget, |symbol, out| {
            progress.on_start(symbol, total);
            let result = self.refresh_symbol(symbol, now);
            progress.on_complete(symbol, total, &result);
            out.push(((*symbol).clone(), result.map_err(|e| e.to_string())));
        })?;

        let mut summary = SyncSummary {
            cached: cached.len(),
            desired: desired.len(),
            removed: exclude.len(),
            cleaned,
            ..SyncSummary::default()
        };
        for (symbol, result) in results {
            match result {
                Ok(_) if cached.contains(&symbol) => summary.refreshed += 1,
                Ok(_) => summary.added += 1,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "symbol refresh failed");
                    summary.failed += 1;
                    summary.errors.push((symbol, e));
                }
            }
        }
        summary.errors.sort();
        progress.on_batch_complete(&summary);
        Ok(summary)
    }
}

fn is_table(meta: &ObjectMeta, row_type: &str, schema_version: u32) -> bool {
    meta.content_type == row_type && meta.schema_version == schema_version && meta.rows > 0
}
