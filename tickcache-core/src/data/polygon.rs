//! Grouped daily aggregates and the ticker reference listing (Polygon).

use super::normalize::{market_bars, GroupedRow};
use super::provider::{fetch_with_retry, DataError, FetchOutcome, HttpGet};
use super::rate_limiter::RateLimiter;
use crate::calendar::TradingCalendar;
use crate::config::{require_secret, POLYGON_API_KEY};
use crate::domain::{MarketBar, TickerRef};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://api.polygon.io";

/// Sessions of history the market snapshot covers.
pub const MARKET_WINDOW_DAYS: i64 = 504;

#[derive(Debug, Deserialize)]
struct GroupedResponse {
    status: String,
    #[serde(rename = "resultsCount", default)]
    results_count: u64,
    #[serde(default)]
    results: Vec<GroupedRow>,
}

#[derive(Debug, Deserialize)]
struct TickersResponse {
    status: String,
    #[serde(default)]
    results: Vec<RawTicker>,
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    ticker: String,
    name: Option<String>,
    market: Option<String>,
    locale: Option<String>,
    primary_exchange: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    active: bool,
    currency_name: Option<String>,
    cik: Option<String>,
    composite_figi: Option<String>,
    share_class_figi: Option<String>,
    last_updated_utc: Option<String>,
}

impl From<RawTicker> for TickerRef {
    fn from(raw: RawTicker) -> Self {
        TickerRef {
            symbol: raw.ticker,
            name: raw.name,
            market: raw.market,
            locale: raw.locale,
            exchange: raw.primary_exchange,
            kind: raw.kind,
            active: raw.active,
            currency_name: raw.currency_name,
            cik: raw.cik,
            composite_figi: raw.composite_figi,
            share_class_figi: raw.share_class_figi,
            last_updated_utc: raw
                .last_updated_utc
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        }
    }
}

pub struct PolygonFetcher {
    http: Arc<dyn HttpGet>,
    api_key: String,
    limiter: RateLimiter,
    calendar: TradingCalendar,
    max_attempts: u32,
    base_url: String,
}

impl PolygonFetcher {
    pub fn new(
        http: Arc<dyn HttpGet>,
        api_key: impl Into<String>,
        limiter: RateLimiter,
        calendar: TradingCalendar,
        max_attempts: u32,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            limiter,
            calendar,
            max_attempts,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Same as [`PolygonFetcher::new`] with the key from `POLYGON_API_KEY`.
    pub fn from_env(
        http: Arc<dyn HttpGet>,
        limiter: RateLimiter,
        calendar: TradingCalendar,
        max_attempts: u32,
    ) -> Result<Self, DataError> {
        let api_key = require_secret(POLYGON_API_KEY)?;
        Ok(Self::new(http, api_key, limiter, calendar, max_attempts))
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// All symbols' aggregates for one session.
    ///
    /// A non-OK status, zero results or a non-200 response is retried; a 404
    /// is `NotFound` straight away.
    pub fn fetch_grouped_daily(&self, date: NaiveDate) -> Result<FetchOutcome<Vec<MarketBar>>, DataError> {
        info!(%date, "fetch grouped daily");
        let url = format!(
            "{}/v2/aggs/grouped/locale/us/market/stocks/{}",
            self.base_url,
            date.format("%Y-%m-%d")
        );
        let query = [("apiKey", self.api_key.clone())];
        let subject = format!("market data for {date}");
        fetch_with_retry(&self.limiter, self.max_attempts, &subject, || {
            let response = self.http.get(&url, &query)?;
            if response.status == 404 {
                return Ok(FetchOutcome::NotFound);
            }
            if response.status != 200 {
                return Err(DataError::HttpStatus {
                    status: response.status,
                    url: url.clone(),
                });
            }
            let body: GroupedResponse = response.json()?;
            if body.status != "OK" {
                return Err(DataError::UpstreamStatus(body.status));
            }
            if body.results_count == 0 || body.results.is_empty() {
                return Err(DataError::NoResults(date.to_string()));
            }
            Ok(FetchOutcome::from_rows(market_bars(date, &body.results)))
        })
    }

    /// Fetch each of `dates` and concatenate what arrived, sorted by (date, symbol).
    ///
    /// A date that fails is skipped; the caller sees it missing on the next run.
    pub fn fetch_dates(&self, dates: impl IntoIterator<Item = NaiveDate>) -> Result<Vec<MarketBar>, DataError> {
        let mut rows = Vec::new();
        for date in dates {
            match self.fetch_grouped_daily(date)? {
                FetchOutcome::Rows(bars) => rows.extend(bars),
                FetchOutcome::Failed(e) => warn!(%date, error = %e, "skipping date"),
                other => debug!(%date, outcome = other.label(), "no market rows"),
            }
        }
        Ok(sort_market(rows))
    }

    /// Extend `existing` with every session of the trailing window it lacks.
    pub fn fetch_market(&self, existing: Vec<MarketBar>) -> Result<FetchOutcome<Vec<MarketBar>>, DataError> {
        let start = self.calendar.nth_previous_from_today(MARKET_WINDOW_DAYS)?;
        let end = self.calendar.last_completed_session()?;
        let have: BTreeSet<NaiveDate> = existing.iter().map(|b| b.date).collect();
        let missing: Vec<NaiveDate> = self
            .calendar
            .trading_daterange(start, end)?
            .iter()
            .filter(|d| !have.contains(d))
            .collect();
        info!(missing = missing.len(), "fetching market dates");
        let mut rows = existing;
        rows.extend(self.fetch_dates(missing)?);
        let rows = sort_market(rows);
        Ok(FetchOutcome::from_rows(rows))
    }

    /// The full reference listing, following `next_url` pages.
    pub fn fetch_tickers(&self) -> Result<FetchOutcome<Vec<TickerRef>>, DataError> {
        let mut tickers: Vec<TickerRef> = Vec::new();
        let mut next = Some(format!("{}/v3/reference/tickers", self.base_url));
        let mut first = true;
        while let Some(url) = next.take() {
            let query: Vec<(&str, String)> = if first {
                vec![
                    ("market", "stocks".to_string()),
                    ("limit", "1000".to_string()),
                    ("apiKey", self.api_key.clone()),
                ]
            } else {
                vec![("apiKey", self.api_key.clone())]
            };
            first = false;
            let outcome = fetch_with_retry(&self.limiter, self.max_attempts, "ticker data", || {
                let response = self.http.get(&url, &query)?;
                if response.status == 404 {
                    return Ok(FetchOutcome::NotFound);
                }
                if response.status != 200 {
                    return Err(DataError::HttpStatus {
                        status: response.status,
                        url: url.clone(),
                    });
                }
                let body: TickersResponse = response.json()?;
                if body.status != "OK" {
                    return Err(DataError::UpstreamStatus(body.status));
                }
                Ok(FetchOutcome::Rows(body))
            })?;
            match outcome {
                FetchOutcome::Rows(page) => {
                    debug!(page = page.results.len(), "ticker page");
                    tickers.extend(page.results.into_iter().map(TickerRef::from));
                    next = page.next_url;
                }
                FetchOutcome::Failed(e) => return Ok(FetchOutcome::Failed(e)),
                FetchOutcome::Empty | FetchOutcome::NotFound => break,
            }
        }
        tickers.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(FetchOutcome::from_rows(tickers))
    }

    #[cfg(test)]
    fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }
}

/// Sort by (date, symbol) and drop duplicate keys, first occurrence wins.
pub fn sort_market(mut rows: Vec<MarketBar>) -> Vec<MarketBar> {
    rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
    rows.dedup_by(|b, a| a.date == b.date && a.symbol == b.symbol);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedClock;
    use crate::config::Backoff;
    use crate::data::provider::HttpResponse;
    use crate::store::Store;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedHttp {
        responses: Mutex<VecDeque<HttpResponse>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedHttp {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpGet for ScriptedHttp {
        fn get(&self, url: &str, _query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
            self.urls.lock().push(url.to_string());
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| DataError::NetworkUnreachable("script exhausted".into()))
        }
    }

    fn fetcher(http: Arc<ScriptedHttp>) -> (tempfile::TempDir, PolygonFetcher) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.db")).unwrap());
        let limiter = RateLimiter::new(store, "polygon", Duration::from_millis(1), 8)
            .unwrap()
            .with_backoff(Backoff { unit_ms: 1, cap_ms: 2 });
        let date = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let calendar = TradingCalendar::with_clock(Arc::new(FixedClock::at_market_time(date, 10, 0)));
        let fetcher = PolygonFetcher::new(http, "key", limiter, calendar, 3).with_base_url("http://fake");
        (dir, fetcher)
    }

    const GROUPED_OK: &str = r#"{"status":"OK","resultsCount":2,"results":[
        {"T":"MSFT","o":1.0,"h":2.0,"l":0.5,"c":1.5,"vw":1.2,"v":100,"n":5,"t":1},
        {"T":"AAPL","o":1.0,"h":2.0,"l":0.5,"c":1.5,"vw":0,"v":100}
    ]}"#;

    #[test]
    fn grouped_daily_retries_then_normalizes() {
        let http = ScriptedHttp::new(vec![
            HttpResponse { status: 500, body: String::new() },
            HttpResponse::ok(r#"{"status":"ERROR","resultsCount":0}"#),
            HttpResponse::ok(GROUPED_OK),
        ]);
        let (_dir, fetcher) = fetcher(http.clone());
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let bars = fetcher.fetch_grouped_daily(date).unwrap().rows().unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "MSFT");
        assert_eq!(http.urls.lock().len(), 3);
        assert!(http.urls.lock()[0].ends_with("/stocks/2024-03-05"));
    }

    #[test]
    fn grouped_daily_zero_results_exhausts() {
        let empty = r#"{"status":"OK","resultsCount":0,"results":[]}"#;
        let http = ScriptedHttp::new(vec![HttpResponse::ok(empty); 3]);
        let (_dir, fetcher) = fetcher(http);
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(matches!(fetcher.fetch_grouped_daily(date).unwrap(), FetchOutcome::Failed(_)));
    }

    #[test]
    fn grouped_daily_404_is_not_retried() {
        let http = ScriptedHttp::new(vec![HttpResponse { status: 404, body: String::new() }; 3]);
        let (_dir, fetcher) = fetcher(http.clone());
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(matches!(fetcher.fetch_grouped_daily(date).unwrap(), FetchOutcome::NotFound));
        assert_eq!(http.urls.lock().len(), 1);
    }

    #[test]
    fn tickers_follow_next_url() {
        let page1 = r#"{"status":"OK","results":[{"ticker":"MSFT","primary_exchange":"XNAS","active":true,
            "last_updated_utc":"2024-03-05T00:00:00Z"}],"next_url":"http://fake/v3/reference/tickers?cursor=abc"}"#;
        let page2 = r#"{"status":"OK","results":[{"ticker":"AAPL","active":true}]}"#;
        let http = ScriptedHttp::new(vec![HttpResponse::ok(page1), HttpResponse::ok(page2)]);
        let (_dir, fetcher) = fetcher(http.clone());
        let tickers = fetcher.fetch_tickers().unwrap().rows().unwrap();
        assert_eq!(tickers.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>(), ["AAPL", "MSFT"]);
        assert_eq!(tickers[1].exchange.as_deref(), Some("XNAS"));
        assert!(tickers[1].last_updated_utc.is_some());
        assert!(http.urls.lock()[1].contains("cursor=abc"));
    }

    #[test]
    fn sort_market_orders_and_dedups() {
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let bar = |symbol: &str, date, close| MarketBar {
            symbol: symbol.into(),
            date,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close,
            vwap: 1.0,
            volume: 1,
            twap: 1.0,
        };
        let rows = sort_market(vec![bar("B", d2, 1.0), bar("A", d2, 2.0), bar("A", d1, 3.0), bar("A", d2, 9.0)]);
        let keys: Vec<_> = rows.iter().map(|b| (b.date, b.symbol.as_str(), b.close)).collect();
        assert_eq!(keys, [(d1, "A", 3.0), (d2, "A", 2.0), (d2, "B", 1.0)]);
    }
}
