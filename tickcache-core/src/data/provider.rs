//! Upstream seams, fetch outcomes, and structured error types.
//!
//! Every adapter talks to the network through one of the traits here
//! ([`HttpGet`] for plain GET endpoints, [`PriceHistoryClient`] for the
//! brokerage), so tests swap in fakes and never touch the network.

use super::rate_limiter::{LimiterError, RateLimiter};
use crate::calendar::CalendarError;
use crate::config::ConfigError;
use crate::store::StoreError;
use crate::timeslot::TimeslotError;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Structured error types for data operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("upstream status is {0}")]
    UpstreamStatus(String),

    #[error("no results returned for {0}")]
    NoResults(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("{attempts} attempts failed, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error(transparent)]
    Timeslot(#[from] TimeslotError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl DataError {
    /// Transient failures are retried; everything else is a caller or setup bug.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::NetworkUnreachable(_)
                | DataError::HttpStatus { .. }
                | DataError::ResponseFormatChanged(_)
                | DataError::UpstreamStatus(_)
                | DataError::NoResults(_)
        )
    }
}

/// Tagged result at every adapter boundary.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    /// Normalized, non-empty rows.
    Rows(T),
    /// The upstream answered but nothing survived validation.
    Empty,
    /// Definitive absence; not retried.
    NotFound,
    /// Retries exhausted.
    Failed(DataError),
}

impl<R> FetchOutcome<Vec<R>> {
    /// `Empty` for no rows, never an empty table.
    pub fn from_rows(rows: Vec<R>) -> Self {
        if rows.is_empty() {
            FetchOutcome::Empty
        } else {
            FetchOutcome::Rows(rows)
        }
    }
}

impl<T> FetchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Rows(t) => FetchOutcome::Rows(f(t)),
            FetchOutcome::Empty => FetchOutcome::Empty,
            FetchOutcome::NotFound => FetchOutcome::NotFound,
            FetchOutcome::Failed(e) => FetchOutcome::Failed(e),
        }
    }

    /// Chain a step that can itself come up empty.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> FetchOutcome<U>) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Rows(t) => f(t),
            FetchOutcome::Empty => FetchOutcome::Empty,
            FetchOutcome::NotFound => FetchOutcome::NotFound,
            FetchOutcome::Failed(e) => FetchOutcome::Failed(e),
        }
    }

    pub fn rows(self) -> Option<T> {
        match self {
            FetchOutcome::Rows(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_rows(&self) -> bool {
        matches!(self, FetchOutcome::Rows(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Rows(_) => "rows",
            FetchOutcome::Empty => "empty",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Failed(_) => "failed",
        }
    }
}

/// Run `f` under `limiter`, retrying transient failures only, and settle
/// the result.
pub fn fetch_with_retry<T>(
    limiter: &RateLimiter,
    max_attempts: u32,
    subject: &str,
    f: impl FnMut() -> Result<FetchOutcome<T>, DataError>,
) -> Result<FetchOutcome<T>, DataError> {
    settle(
        subject,
        limiter.try_request(max_attempts).run_retrying(f, DataError::is_transient),
    )
}

/// Settle a retry loop: exhausted retries become `Failed` (logged at error
/// level), an unknown symbol becomes `NotFound`, and any other permanent or
/// limiter error is fatal.
pub fn settle<T>(
    subject: &str,
    result: Result<Result<FetchOutcome<T>, DataError>, LimiterError>,
) -> Result<FetchOutcome<T>, DataError> {
    match result {
        Ok(Ok(FetchOutcome::NotFound)) | Ok(Err(DataError::SymbolNotFound { .. })) => {
            info!(subject, "not found upstream");
            Ok(FetchOutcome::NotFound)
        }
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => {
            error!(subject, error = %e, "error fetching {subject}, not retried");
            Err(e)
        }
        Err(LimiterError::Exhausted { name, attempts, last }) => {
            error!(subject, limiter = %name, attempts, "error fetching {subject}: {last}");
            Ok(FetchOutcome::Failed(DataError::RetriesExhausted { attempts, last }))
        }
        Err(e) => Err(e.into()),
    }
}

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DataError> {
        serde_json::from_str(&self.body)
            .map_err(|e| DataError::ResponseFormatChanged(format!("malformed JSON: {e}")))
    }
}

/// Plain GET transport.
pub trait HttpGet: Send + Sync {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse, DataError>;
}

/// Blocking reqwest transport.
pub struct BlockingHttp {
    client: reqwest::blocking::Client,
}

impl BlockingHttp {
    pub fn new() -> Result<Self, DataError> {
        Self::with_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .map_err(|e| DataError::NetworkUnreachable(format!("build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub(crate) fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }
}

pub(crate) fn send(request: reqwest::blocking::RequestBuilder) -> Result<HttpResponse, DataError> {
    let resp = request
        .send()
        .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
    let status = resp.status().as_u16();
    let body = resp
        .text()
        .map_err(|e| DataError::ResponseFormatChanged(format!("read body: {e}")))?;
    Ok(HttpResponse { status, body })
}

impl HttpGet for BlockingHttp {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse, DataError> {
        send(self.client.get(url).query(query))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Day,
    Year,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyType {
    Minute,
    Daily,
}

impl FrequencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrequencyType::Minute => "minute",
            FrequencyType::Daily => "daily",
        }
    }
}

/// Arguments of one brokerage price-history call.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceHistoryRequest {
    pub symbol: String,
    pub period_type: PeriodType,
    pub period: Option<u32>,
    pub frequency_type: FrequencyType,
    pub frequency: u32,
    pub start: Option<NaiveDate>,
    pub end: NaiveDate,
    pub extended_hours: bool,
}

/// Brokerage historic-bars endpoint. The body carries
/// `candles: [{datetime, open, high, low, close, volume}]`.
pub trait PriceHistoryClient: Send + Sync {
    fn get_price_history(&self, request: &PriceHistoryRequest) -> Result<HttpResponse, DataError>;
}
