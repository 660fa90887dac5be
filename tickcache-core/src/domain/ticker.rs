//! Ticker reference rows and the per-symbol fundamentals/news cache entry.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Days a cached [`TickerEntry`] stays fresh.
pub const TICKER_ENTRY_TTL_DAYS: i64 = 7;

/// One listed security from the reference listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRef {
    pub symbol: String,
    pub name: Option<String>,
    pub market: Option<String>,
    pub locale: Option<String>,
    pub exchange: Option<String>,
    pub kind: Option<String>,
    pub active: bool,
    pub currency_name: Option<String>,
    pub cik: Option<String>,
    pub composite_figi: Option<String>,
    pub share_class_figi: Option<String>,
    pub last_updated_utc: Option<DateTime<Utc>>,
}

/// Scraped fundamentals for one symbol. Ownership and short float are fractions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerDetails {
    pub market_cap: Option<u64>,
    pub shares_float: Option<u64>,
    pub shares_outstanding: Option<u64>,
    pub insider_ownership: Option<f64>,
    pub institutional_ownership: Option<f64>,
    pub retail_ownership: Option<f64>,
    pub short_float: Option<f64>,
    pub employees: Option<u64>,
    pub has_options: bool,
    pub is_shortable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub date: NaiveDateTime,
    pub headline: String,
    pub url: String,
}

/// Cached `{details, news}` blob for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerEntry {
    pub details: Option<TickerDetails>,
    pub news: Option<Vec<NewsItem>>,
    pub fetched_at: DateTime<Utc>,
}

impl TickerEntry {
    pub fn is_empty(&self) -> bool {
        self.details.is_none() && self.news.is_none()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.fetched_at).num_days() >= TICKER_ENTRY_TTL_DAYS
    }
}
