//! Brokerage (TD Ameritrade) historic daily and intraday bars.

use super::normalize::{daily_bars, intraday_bars, Candle};
use super::provider::{
    fetch_with_retry, send, BlockingHttp, DataError, FetchOutcome, FrequencyType, HttpResponse, PeriodType,
    PriceHistoryClient, PriceHistoryRequest,
};
use super::rate_limiter::RateLimiter;
use crate::calendar::{TradingCalendar, MARKET_TZ};
use crate::config::{require_secret, TDA_API_KEY, TDA_TOKEN_PATH};
use crate::domain::{DailyBar, IntradayBar};
use crate::timeslot::{Period, TimeslotError};
use chrono::{NaiveDate, TimeZone};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const PRICE_HISTORY_URL: &str = "https://api.tdameritrade.com/v1/marketdata";

/// Trading days of intraday history fetched when a series is empty.
pub const INTRADAY_LOOKBACK_DAYS: i64 = 252;

#[derive(Debug, Deserialize)]
struct PriceHistoryBody {
    #[serde(default)]
    candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
}

/// API key and stored access token.
///
/// Obtaining or refreshing the token is out of scope; the file at
/// `TDA_TOKEN_PATH` must already hold a valid `access_token`.
#[derive(Debug, Clone)]
pub struct TdaCredentials {
    pub api_key: String,
    pub access_token: String,
}

impl TdaCredentials {
    pub fn from_env() -> Result<Self, DataError> {
        let api_key = require_secret(TDA_API_KEY)?;
        let token_path = require_secret(TDA_TOKEN_PATH)?;
        let raw = std::fs::read_to_string(&token_path).map_err(|e| {
            DataError::AuthenticationRequired(format!("read token file {token_path}: {e}"))
        })?;
        let token: TokenFile = serde_json::from_str(&raw).map_err(|e| {
            DataError::AuthenticationRequired(format!("parse token file {token_path}: {e}"))
        })?;
        Ok(Self {
            api_key,
            access_token: token.access_token,
        })
    }
}

/// Price-history endpoint over HTTP.
pub struct TdaHttpClient {
    http: BlockingHttp,
    credentials: TdaCredentials,
}

impl TdaHttpClient {
    pub fn new(credentials: TdaCredentials) -> Result<Self, DataError> {
        Ok(Self {
            http: BlockingHttp::new()?,
            credentials,
        })
    }

    pub fn from_env() -> Result<Self, DataError> {
        Self::new(TdaCredentials::from_env()?)
    }
}

fn midnight_ms(date: NaiveDate) -> Option<i64> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    MARKET_TZ
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.timestamp_millis())
}

impl PriceHistoryClient for TdaHttpClient {
    fn get_price_history(&self, request: &PriceHistoryRequest) -> Result<HttpResponse, DataError> {
        let url = format!("{PRICE_HISTORY_URL}/{}/pricehistory", request.symbol.to_uppercase());
        let mut query: Vec<(&str, String)> = vec![
            ("apikey", self.credentials.api_key.clone()),
            ("periodType", request.period_type.as_str().to_string()),
            ("frequencyType", request.frequency_type.as_str().to_string()),
            ("frequency", request.frequency.to_string()),
            ("needExtendedHoursData", request.extended_hours.to_string()),
        ];
        if let Some(period) = request.period {
            query.push(("period", period.to_string()));
        }
        if let Some(start) = request.start.and_then(midnight_ms) {
            query.push(("startDate", start.to_string()));
        }
        if let Some(end) = midnight_ms(request.end) {
            query.push(("endDate", end.to_string()));
        }
        send(
            self.http
                .client()
                .get(&url)
                .bearer_auth(&self.credentials.access_token)
                .query(&query),
        )
    }
}

/// Daily and intraday fetches through the brokerage limiter.
pub struct TdaFetcher {
    client: Arc<dyn PriceHistoryClient>,
    limiter: RateLimiter,
    calendar: TradingCalendar,
    max_attempts: u32,
}

impl TdaFetcher {
    pub fn new(
        client: Arc<dyn PriceHistoryClient>,
        limiter: RateLimiter,
        calendar: TradingCalendar,
        max_attempts: u32,
    ) -> Self {
        Self {
            client,
            limiter,
            calendar,
            max_attempts,
        }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Daily bars from `start` (or full history) through `end` (default:
    /// the last completed session).
    pub fn fetch_daily(
        &self,
        symbol: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<FetchOutcome<Vec<DailyBar>>, DataError> {
        let end = match end {
            Some(end) => end,
            None => self.calendar.last_completed_session()?,
        };
        let request = PriceHistoryRequest {
            symbol: symbol.to_uppercase(),
            period_type: PeriodType::Year,
            period: Some(20),
            frequency_type: FrequencyType::Daily,
            frequency: 1,
            start,
            end,
            extended_hours: false,
        };
        Ok(self
            .fetch_candles(&request, "daily")?
            .and_then(|candles| FetchOutcome::from_rows(daily_bars(symbol, &candles))))
    }

    /// Intraday bars at `period_minutes` (1 or 5) from `start` (default: 252
    /// sessions ago) through `end` (default: the last completed session).
    pub fn fetch_intraday(
        &self,
        symbol: &str,
        period_minutes: u32,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<FetchOutcome<Vec<IntradayBar>>, DataError> {
        let period = match Period::from_minutes(period_minutes)? {
            Period::Thirty => return Err(TimeslotError::InvalidPeriod(period_minutes).into()),
            p => p,
        };
        let start = match start {
            Some(start) => start,
            None => self.calendar.nth_previous_from_today(INTRADAY_LOOKBACK_DAYS)?,
        };
        let end = match end {
            Some(end) => end,
            None => self.calendar.last_completed_session()?,
        };
        let request = PriceHistoryRequest {
            symbol: symbol.to_uppercase(),
            period_type: PeriodType::Day,
            period: None,
            frequency_type: FrequencyType::Minute,
            frequency: period.minutes(),
            start: Some(start),
            end,
            extended_hours: true,
        };
        Ok(self
            .fetch_candles(&request, "intraday")?
            .and_then(|candles| FetchOutcome::from_rows(intraday_bars(symbol, &candles, period))))
    }

    fn fetch_candles(
        &self,
        request: &PriceHistoryRequest,
        what: &str,
    ) -> Result<FetchOutcome<Vec<Candle>>, DataError> {
        let subject = format!("{what} data for {}", request.symbol);
        fetch_with_retry(&self.limiter, self.max_attempts, &subject, || {
            let response = self.client.get_price_history(request)?;
            if response.status == 404 {
                return Err(DataError::SymbolNotFound {
                    symbol: request.symbol.clone(),
                });
            }
            if !response.is_success() {
                return Err(DataError::HttpStatus {
                    status: response.status,
                    url: format!("pricehistory/{}", request.symbol),
                });
            }
            let body = response.json::<PriceHistoryBody>()?;
            debug!(symbol = %request.symbol, kind = what, candles = body.candles.len(), "fetched price history");
            Ok(FetchOutcome::Rows(body.candles))
        })
    }
}
