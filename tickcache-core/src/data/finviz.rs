//! Fundamentals and news scraped from the Finviz quote page.

use super::provider::{fetch_with_retry, DataError, FetchOutcome, HttpGet};
use super::rate_limiter::RateLimiter;
use crate::domain::{NewsItem, TickerDetails};
use chrono::{NaiveDate, NaiveDateTime};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const QUOTE_URL: &str = "https://finviz.com/quote.ashx";

fn selector(css: &str) -> Result<Selector, DataError> {
    Selector::parse(css).map_err(|e| DataError::ResponseFormatChanged(format!("selector {css}: {e}")))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Label/value pairs of the snapshot table (`tr.table-dark-row td`).
fn snapshot_fields(page: &Html) -> Result<HashMap<String, String>, DataError> {
    let rows = selector("tr.table-dark-row")?;
    let cells = selector("td")?;
    let mut fields = HashMap::new();
    for row in page.select(&rows) {
        let texts: Vec<String> = row.select(&cells).map(cell_text).collect();
        for pair in texts.chunks_exact(2) {
            fields.insert(pair[0].clone(), pair[1].clone());
        }
    }
    Ok(fields)
}

/// `12.5M` -> 12.5e6, `3B` -> 3e9, `7.1%` -> 0.071 (percent only when
/// `percent` is set). `-` and anything unparseable is `None`.
pub fn parse_number(raw: &str, percent: bool) -> Option<f64> {
    let raw = raw.trim();
    let (digits, multiplier) = if let Some(d) = raw.strip_suffix('M') {
        (d, 1e6)
    } else if let Some(d) = raw.strip_suffix('B') {
        (d, 1e9)
    } else if let Some(d) = raw.strip_suffix('%').filter(|_| percent) {
        (d, 0.01)
    } else {
        (raw, 1.0)
    };
    digits
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .map(|v| v * multiplier)
        .filter(|v| v.is_finite())
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Fundamentals from the snapshot table.
pub fn parse_details(page: &Html) -> Result<TickerDetails, DataError> {
    let fields = snapshot_fields(page)?;
    if fields.is_empty() {
        return Err(DataError::ResponseFormatChanged("quote page has no snapshot table".into()));
    }
    let integer = |key: &str| {
        fields
            .get(key)
            .and_then(|v| parse_number(v, false))
            .filter(|v| *v >= 0.0)
            .map(|v| v as u64)
    };
    let fraction = |key: &str| fields.get(key).and_then(|v| parse_number(v, true)).map(|v| round_to(v, 2));
    let flag = |key: &str| fields.get(key).is_some_and(|v| v == "Yes");

    let (insider, institutional, retail) = match (fraction("Insider Own"), fraction("Inst Own")) {
        (Some(insider), Some(inst)) => (
            Some(insider),
            Some(inst),
            Some(round_to((1.0 - inst - insider).abs(), 2)),
        ),
        _ => (None, None, None),
    };
    Ok(TickerDetails {
        market_cap: integer("Market Cap"),
        shares_float: integer("Shs Float"),
        shares_outstanding: integer("Shs Outstand"),
        insider_ownership: insider,
        institutional_ownership: institutional,
        retail_ownership: retail,
        short_float: fraction("Short Float"),
        employees: integer("Employees"),
        has_options: flag("Optionable"),
        is_shortable: flag("Shortable"),
    })
}

/// News links (`a.tab-link-news`) with their row dates. A row showing only a
/// time inherits the date of the nearest earlier row that has one.
pub fn parse_news(page: &Html) -> Result<Vec<NewsItem>, DataError> {
    let links = selector("a.tab-link-news")?;
    let cells = selector("td")?;
    let mut current: Option<NaiveDate> = None;
    let mut items = Vec::new();
    for link in page.select(&links) {
        let Some(row) = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "tr")
        else {
            continue;
        };
        let Some(stamp) = row.select(&cells).next().map(cell_text) else {
            continue;
        };
        let time = match stamp.split_once(' ') {
            Some((day, time)) => {
                current = NaiveDate::parse_from_str(day, "%b-%d-%y").ok();
                time.trim().to_string()
            }
            None => stamp,
        };
        let Some(date) = current else {
            debug!(%time, "news row without a preceding date");
            continue;
        };
        let Ok(date) = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %I:%M%p") else {
            continue;
        };
        items.push(NewsItem {
            date,
            headline: cell_text(link),
            url: link.value().attr("href").unwrap_or_default().to_string(),
        });
    }
    Ok(items)
}

/// Quote page fetches through the fundamentals limiter.
pub struct FinvizFetcher {
    http: Arc<dyn HttpGet>,
    limiter: RateLimiter,
    max_attempts: u32,
}

impl FinvizFetcher {
    pub fn new(http: Arc<dyn HttpGet>, limiter: RateLimiter, max_attempts: u32) -> Self {
        Self {
            http,
            limiter,
            max_attempts,
        }
    }

    fn fetch_page<T>(
        &self,
        symbol: &str,
        what: &str,
        parse: impl Fn(&Html) -> Result<T, DataError>,
    ) -> Result<FetchOutcome<T>, DataError> {
        let query = [("t", symbol.to_uppercase())];
        let subject = format!("{what} for {symbol}");
        fetch_with_retry(&self.limiter, self.max_attempts, &subject, || {
            let response = self.http.get(QUOTE_URL, &query)?;
            match response.status {
                200 => {
                    let page = Html::parse_document(&response.body);
                    Ok(FetchOutcome::Rows(parse(&page)?))
                }
                404 => Ok(FetchOutcome::NotFound),
                status => Err(DataError::HttpStatus {
                    status,
                    url: QUOTE_URL.to_string(),
                }),
            }
        })
    }

    pub fn fetch_details(&self, symbol: &str) -> Result<FetchOutcome<TickerDetails>, DataError> {
        self.fetch_page(symbol, "ticker details", parse_details)
    }

    /// News for `symbol`; a page without news is `Empty`.
    pub fn fetch_news(&self, symbol: &str) -> Result<FetchOutcome<Vec<NewsItem>>, DataError> {
        Ok(self
            .fetch_page(symbol, "ticker news", parse_news)?
            .and_then(FetchOutcome::from_rows))
    }
}
