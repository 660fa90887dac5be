//! Market snapshot and ticker cache scenarios against fake HTTP upstreams.

use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tickcache_core::calendar::{FixedClock, TradingCalendar};
use tickcache_core::config::Backoff;
use tickcache_core::data::{
    DataError, FetchOutcome, FinvizFetcher, HttpGet, HttpResponse, PolygonFetcher, RateLimiter,
};
use tickcache_core::domain::MarketBar;
use tickcache_core::series::{DateKey, MarketSnapshot, MarketStatus, TickerCache, TickerStatus, MARKET_KEY};
use tickcache_core::store::Store;

/// Answers grouped-daily requests with two symbols for whatever date is asked.
#[derive(Default)]
struct GroupedUpstream {
    urls: Mutex<Vec<String>>,
}

impl HttpGet for GroupedUpstream {
    fn get(&self, url: &str, _query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        self.urls.lock().push(url.to_string());
        let body = r#"{"status":"OK","resultsCount":2,"results":[
            {"T":"MSFT","o":1.0,"h":2.0,"l":0.5,"c":1.5,"vw":1.2,"v":100},
            {"T":"AAPL","o":1.0,"h":2.0,"l":0.5,"c":1.5,"vw":1.1,"v":300}]}"#;
        Ok(HttpResponse::ok(body))
    }
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn limiter(store: &Arc<Store>, name: &str) -> RateLimiter {
    RateLimiter::new(store.clone(), name, Duration::from_millis(1), 4)
        .unwrap()
        .with_backoff(Backoff { unit_ms: 1, cap_ms: 2 })
}

fn market_bar(symbol: &str, date: NaiveDate) -> MarketBar {
    MarketBar {
        symbol: symbol.into(),
        date,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        vwap: 1.0,
        volume: 1,
        twap: 1.0,
    }
}

fn polygon(store: &Arc<Store>, http: Arc<GroupedUpstream>, today: NaiveDate) -> PolygonFetcher {
    let calendar = TradingCalendar::with_clock(Arc::new(FixedClock::at_market_time(today, 10, 0)));
    PolygonFetcher::new(http, "key", limiter(store, "polygon"), calendar, 3)
}

#[test]
fn quick_check_reports_empty_snapshot_stale() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let http = Arc::new(GroupedUpstream::default());
    let fetcher = polygon(&store, http.clone(), d(2024, 3, 6));
    let snapshot = MarketSnapshot::new(&store, &fetcher);
    assert!(matches!(snapshot.update(true).unwrap(), MarketStatus::Stale { sessions_behind } if sessions_behind > 5));
    assert!(http.urls.lock().is_empty());
}

#[test]
fn update_fetches_missing_sessions_only() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.put_table(MARKET_KEY, &[market_bar("AAPL", d(2024, 3, 1))]).unwrap();
    let http = Arc::new(GroupedUpstream::default());
    let fetcher = polygon(&store, http.clone(), d(2024, 3, 6));
    let snapshot = MarketSnapshot::new(&store, &fetcher);

    assert_eq!(snapshot.update(true).unwrap(), MarketStatus::Updated { dates: 2 });
    let urls = http.urls.lock().clone();
    assert_eq!(urls.len(), 2);
    assert!(urls[0].ends_with("2024-03-04"));
    assert!(urls[1].ends_with("2024-03-05"));

    assert_eq!(snapshot.dates().unwrap(), [d(2024, 3, 1), d(2024, 3, 4), d(2024, 3, 5)]);
    let last = snapshot.get(&DateKey::Offset(-1)).unwrap().unwrap();
    assert_eq!(last.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>(), ["AAPL", "MSFT"]);
    assert_eq!(snapshot.update(false).unwrap(), MarketStatus::Fresh);
    assert_eq!(http.urls.lock().len(), 2);
}

const QUOTE_PAGE: &str = r#"<table>
  <tr class="table-dark-row"><td>Market Cap</td><td>1.5B</td><td>Optionable</td><td>Yes</td></tr>
</table>
<table><tr><td>Mar-05-24 09:30AM</td><td><a class="tab-link-news" href="u">Headline</a></td></tr></table>"#;

struct QuotePage {
    status: u16,
    calls: Mutex<u32>,
}

impl HttpGet for QuotePage {
    fn get(&self, _url: &str, _query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        *self.calls.lock() += 1;
        Ok(HttpResponse {
            status: self.status,
            body: QUOTE_PAGE.to_string(),
        })
    }
}

#[test]
fn ticker_entries_honor_ttl_and_drop_when_empty() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let page = Arc::new(QuotePage {
        status: 200,
        calls: Mutex::new(0),
    });
    let fetcher = FinvizFetcher::new(page.clone(), limiter(&store, "finviz"), 2);
    let cache = TickerCache::new(&store, &fetcher);
    let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();

    assert_eq!(cache.refresh("msft", now).unwrap(), TickerStatus::Refreshed);
    let entry = cache.load("MSFT").unwrap().unwrap();
    assert_eq!(entry.details.unwrap().market_cap, Some(1_500_000_000));
    assert_eq!(entry.news.unwrap().len(), 1);
    assert_eq!(*page.calls.lock(), 2);

    assert_eq!(cache.refresh("MSFT", now + chrono::Duration::days(3)).unwrap(), TickerStatus::Fresh);
    assert_eq!(*page.calls.lock(), 2);

    let gone = Arc::new(QuotePage {
        status: 404,
        calls: Mutex::new(0),
    });
    let fetcher = FinvizFetcher::new(gone, limiter(&store, "finviz-404"), 2);
    let cache = TickerCache::new(&store, &fetcher);
    assert_eq!(cache.refresh("MSFT", now + chrono::Duration::days(8)).unwrap(), TickerStatus::Removed);
    assert!(!store.exists(&TickerCache::key("MSFT")).unwrap());
}

/// Replays `statuses`, then answers like [`GroupedUpstream`].
struct FlakyUpstream {
    statuses: Mutex<VecDeque<u16>>,
    inner: GroupedUpstream,
}

impl FlakyUpstream {
    fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            inner: GroupedUpstream::default(),
        })
    }

    fn calls(&self) -> usize {
        self.inner.urls.lock().len()
    }
}

impl HttpGet for FlakyUpstream {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        let response = self.inner.get(url, query)?;
        Ok(match self.statuses.lock().pop_front() {
            Some(status) => HttpResponse {
                status,
                body: String::new(),
            },
            None => response,
        })
    }
}

fn flaky_polygon(store: &Arc<Store>, http: Arc<FlakyUpstream>) -> PolygonFetcher {
    let calendar = TradingCalendar::with_clock(Arc::new(FixedClock::at_market_time(d(2024, 3, 6), 10, 0)));
    PolygonFetcher::new(http, "key", limiter(store, "polygon"), calendar, 3)
}

#[test]
fn grouped_daily_status_handling() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let date = d(2024, 3, 5);

    let missing = FlakyUpstream::new(&[404, 404]);
    let fetcher = flaky_polygon(&store, missing.clone());
    assert!(matches!(fetcher.fetch_grouped_daily(date).unwrap(), FetchOutcome::NotFound));
    assert_eq!(missing.calls(), 1);

    let recovering = FlakyUpstream::new(&[503]);
    let fetcher = flaky_polygon(&store, recovering.clone());
    assert_eq!(fetcher.fetch_grouped_daily(date).unwrap().rows().unwrap().len(), 2);
    assert_eq!(recovering.calls(), 2);

    let down = FlakyUpstream::new(&[500, 500, 500]);
    let fetcher = flaky_polygon(&store, down.clone());
    assert!(matches!(
        fetcher.fetch_grouped_daily(date).unwrap(),
        FetchOutcome::Failed(DataError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(down.calls(), 3);
}
