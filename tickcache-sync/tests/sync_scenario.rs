//! Full synchronization passes against fake upstreams.
//!
//! Tests:
//! 1. Desired {A, B} over cached {B, C}: C dropped everywhere, A added, B refreshed
//! 2. Malformed artifacts are removed before the pass
//! 3. An unreachable upstream leaves that symbol uncached and the batch continues
//! 4. Ticker freshness follows the calendar clock, not the wall clock

use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tickcache_core::calendar::{FixedClock, TradingCalendar, MARKET_TZ};
use tickcache_core::config::Backoff;
use tickcache_core::data::{
    DataError, FinvizFetcher, HttpGet, HttpResponse, PolygonFetcher, PriceHistoryClient,
    PriceHistoryRequest, RateLimiter, TdaFetcher,
};
use tickcache_core::domain::{DailyBar, IntradayBar};
use tickcache_core::series::tickers::TICKER_ENTRY_TYPE;
use tickcache_core::series::{SeriesError, TickerCache};
use tickcache_core::store::Store;
use tickcache_sync::sync::{SymbolOutcome, SyncProgress};
use tickcache_sync::{CacheSynchronizer, SyncOptions, SyncSummary, Upstreams};

// ── Fakes ────────────────────────────────────────────────────────────

/// Daily candles for Mar 4 and 5, one regular-hours minute bar on Mar 5.
/// Symbols in `broken` answer with a server error.
struct Broker {
    broken: Vec<String>,
    requests: Mutex<Vec<PriceHistoryRequest>>,
}

impl PriceHistoryClient for Broker {
    fn get_price_history(&self, request: &PriceHistoryRequest) -> Result<HttpResponse, DataError> {
        self.requests.lock().push(request.clone());
        if self.broken.contains(&request.symbol) {
            return Ok(HttpResponse {
                status: 500,
                body: String::new(),
            });
        }
        let candles = if request.frequency_type.as_str() == "daily" {
            [4, 5]
                .iter()
                .map(|day| {
                    let ms = d(2024, 3, *day).and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
                    serde_json::json!({"datetime": ms, "open": 10.0, "high": 11.0, "low": 9.0, "close": 10.5, "volume": 1000})
                })
                .collect::<Vec<_>>()
        } else {
            let ms = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap().timestamp_millis();
            vec![serde_json::json!({"datetime": ms, "open": 10.0, "high": 11.0, "low": 9.0, "close": 10.5, "volume": 50})]
        };
        Ok(HttpResponse::ok(serde_json::json!({ "candles": candles }).to_string()))
    }
}

struct QuotePage;

impl HttpGet for QuotePage {
    fn get(&self, _url: &str, _query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        Ok(HttpResponse::ok(
            r#"<table><tr class="table-dark-row"><td>Employees</td><td>1,200</td></tr></table>"#,
        ))
    }
}

struct NoMarket;

impl HttpGet for NoMarket {
    fn get(&self, url: &str, _query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        panic!("quick check must not fetch: {url}");
    }
}

#[derive(Default)]
struct CountingProgress {
    started: Mutex<Vec<String>>,
    batches: Mutex<usize>,
}

impl SyncProgress for CountingProgress {
    fn on_start(&self, symbol: &str, _total: usize) {
        self.started.lock().push(symbol.to_string());
    }

    fn on_complete(&self, _symbol: &str, _total: usize, _result: &Result<SymbolOutcome, SeriesError>) {}

    fn on_batch_complete(&self, _summary: &SyncSummary) {
        *self.batches.lock() += 1;
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn limiter(store: &Arc<Store>, name: &str) -> RateLimiter {
    RateLimiter::new(store.clone(), name, Duration::from_millis(1), 8)
        .unwrap()
        .with_backoff(Backoff { unit_ms: 1, cap_ms: 2 })
}

struct Fixture {
    store: Arc<Store>,
    broker: Arc<Broker>,
    tda: TdaFetcher,
    polygon: PolygonFetcher,
    finviz: FinvizFetcher,
}

impl Fixture {
    fn new(broken: &[&str]) -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let calendar = TradingCalendar::with_clock(Arc::new(FixedClock::at_market_time(d(2024, 3, 6), 10, 0)));
        let broker = Arc::new(Broker {
            broken: broken.iter().map(|s| s.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
        });
        let tda = TdaFetcher::new(broker.clone(), limiter(&store, "tda"), calendar.clone(), 2);
        let polygon = PolygonFetcher::new(Arc::new(NoMarket), "key", limiter(&store, "polygon"), calendar, 2);
        let finviz = FinvizFetcher::new(Arc::new(QuotePage), limiter(&store, "finviz"), 2);
        Self {
            store,
            broker,
            tda,
            polygon,
            finviz,
        }
    }

    fn synchronizer(&self) -> CacheSynchronizer<'_> {
        let upstreams = Upstreams {
            tda: &self.tda,
            polygon: &self.polygon,
            finviz: &self.finviz,
        };
        CacheSynchronizer::new(&self.store, upstreams, 4).with_options(SyncOptions {
            skip_intraday: false,
            market_quick_check: true,
        })
    }

    fn seed(&self, symbol: &str) {
        let bar = DailyBar::new(symbol, d(2024, 3, 4), 10.0, 11.0, 9.0, 10.5, 1000);
        self.store.put_table(&format!("cache/daily/{symbol}"), &[bar]).unwrap();
        self.store
            .put_json(
                &format!("cache/tickers/{symbol}"),
                TICKER_ENTRY_TYPE,
                &serde_json::json!({"details": null, "news": [], "fetched_at": "2024-03-05T12:00:00Z"}),
            )
            .unwrap();
    }
}

fn desired(symbols: &[&str]) -> BTreeSet<String> {
    symbols.iter().map(|s| s.to_string()).collect()
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap()
}

// ── 1. Add / refresh / drop ──────────────────────────────────────────

#[test]
fn desired_set_replaces_cached_set() {
    let fx = Fixture::new(&[]);
    fx.seed("B");
    fx.seed("C");
    let intraday_c = IntradayBar {
        symbol: "C".into(),
        date: d(2024, 3, 5),
        timestamp: MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap(),
        timeslot: 0,
        segment: tickcache_core::TradingSegment::PreMarket,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: 1,
        twap: 1.0,
        filled: false,
    };
    fx.store.put_table("cache/intraday/5/C", &[intraday_c]).unwrap();

    let progress = CountingProgress::default();
    let summary = fx
        .synchronizer()
        .sync_at(&desired(&["A", "B"]), &progress, now())
        .unwrap();

    assert_eq!(summary.cached, 2);
    assert_eq!(summary.desired, 2);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.added, 1);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(*progress.batches.lock(), 1);
    let mut started = progress.started.lock().clone();
    started.sort();
    assert_eq!(started, ["A", "B"]);

    for namespace in ["cache/daily", "cache/intraday/1", "cache/intraday/5", "cache/tickers"] {
        assert!(!fx.store.exists(&format!("{namespace}/C")).unwrap(), "C left in {namespace}");
    }

    let a: Vec<DailyBar> = fx.store.get_table("cache/daily/A").unwrap().unwrap();
    assert_eq!(a.iter().map(|b| b.date).collect::<Vec<_>>(), [d(2024, 3, 4), d(2024, 3, 5)]);
    assert!(fx.store.exists("cache/intraday/1/A").unwrap());
    assert!(fx.store.exists("cache/intraday/5/A").unwrap());
    assert!(fx.store.exists("cache/tickers/A").unwrap());

    // B kept its Mar 4 row and gained Mar 5 only.
    let b: Vec<DailyBar> = fx.store.get_table("cache/daily/B").unwrap().unwrap();
    assert_eq!(b.len(), 2);
    let b_daily = fx.broker.requests.lock().iter().any(|r| r.symbol == "B" && r.start == Some(d(2024, 3, 5)));
    assert!(b_daily);
}

// ── 2. Structural cleanup ────────────────────────────────────────────

#[test]
fn malformed_artifacts_are_removed() {
    let fx = Fixture::new(&[]);
    fx.store.put_bytes("cache/daily/JUNK", "text/plain", 1, b"junk").unwrap();
    fx.store.put_table::<DailyBar>("cache/daily/EMPTY", &[]).unwrap();
    fx.store
        .put_json("cache/tickers/ODD", "SomethingElse", &serde_json::json!({}))
        .unwrap();

    let removed = fx.synchronizer().clean().unwrap();
    assert_eq!(removed, 3);
    assert!(fx.synchronizer().cached_symbols().unwrap().is_empty());
}

// ── 3. Upstream failure ─────────────────────────────────────────────

#[test]
fn upstream_failure_leaves_symbol_uncached() {
    let fx = Fixture::new(&["BAD"]);
    let sync = CacheSynchronizer::new(
        &fx.store,
        Upstreams {
            tda: &fx.tda,
            polygon: &fx.polygon,
            finviz: &fx.finviz,
        },
        2,
    )
    .with_options(SyncOptions {
        skip_intraday: true,
        market_quick_check: true,
    });
    let summary = sync.sync_at(&desired(&["BAD", "GOOD"]), &CountingProgress::default(), now()).unwrap();

    // Exhausted retries settle as "no data", not as a symbol failure.
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.added, 2);
    assert!(fx.store.exists("cache/daily/GOOD").unwrap());
    assert!(!fx.store.exists("cache/daily/BAD").unwrap());
    assert!(!fx.store.exists("cache/intraday/5/GOOD").unwrap());
}

// ── 4. Clock ─────────────────────────────────────────────────────────

#[test]
fn ticker_ttl_uses_the_calendar_clock() {
    let fx = Fixture::new(&[]);
    fx.seed("B");
    fx.synchronizer().sync(&desired(&["A", "B"]), &CountingProgress::default()).unwrap();

    let tickers = TickerCache::new(&fx.store, &fx.finviz);
    // Fetched a day before the fixed clock, so still fresh.
    let b = tickers.load("B").unwrap().unwrap();
    assert_eq!(b.fetched_at, Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap());
    let a = tickers.load("A").unwrap().unwrap();
    assert_eq!(a.fetched_at, now());
}
