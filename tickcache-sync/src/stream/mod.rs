//! Streaming quotes, chart bars and trades into append-only store logs.
//!
//! A [`writer::StreamWriter`] owns one brokerage connection and appends one
//! fixed-shape tuple per event to `stream/{name}`. Any number of
//! [`reader::StreamReader`]s follow the log from an offset and feed consumers
//! such as the [`nbbo::NbboCache`] and the [`chart_cache::ChartCache`].

pub mod chart_cache;
pub mod client;
pub mod nbbo;
pub mod reader;
pub mod session;
pub mod writer;

pub use chart_cache::ChartCache;
pub use client::{Channel, Qos, StreamClient, StreamMessage, TdaStreamClient};
pub use nbbo::NbboCache;
pub use reader::StreamReader;
pub use session::StreamSession;
pub use writer::{StreamWriter, WriterHandle};

use serde_json::{json, Value};
use thiserror::Error;
use tickcache_core::config::ConfigError;
use tickcache_core::store::StoreError;

pub const STREAM_NAMESPACE: &str = "stream";

pub fn log_name(name: &str) -> String {
    format!("{STREAM_NAMESPACE}/{name}")
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection: {0}")]
    Connection(String),

    #[error("stream login rejected: {0}")]
    Login(String),

    #[error("stream request {command} on {service} rejected: {msg}")]
    Rejected {
        service: String,
        command: String,
        msg: String,
    },

    #[error("malformed stream message: {0}")]
    Malformed(String),

    #[error("invalid stream configuration: {0}")]
    Invalid(String),

    #[error("stream writer stopped")]
    WriterStopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Event kind tags, the first element of every log tuple.
pub const QUOTE: i64 = 1;
pub const CHART: i64 = 2;
pub const TRADE: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteEvent {
    pub msg_ts: Option<i64>,
    pub symbol: String,
    pub quote_time: Option<i64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub trade_time: Option<i64>,
    pub last: Option<f64>,
    pub last_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartEvent {
    pub msg_ts: Option<i64>,
    pub symbol: String,
    pub chart_time: Option<i64>,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub msg_ts: Option<i64>,
    pub symbol: String,
    pub trade_time: Option<i64>,
    pub last: Option<f64>,
    pub last_size: Option<i64>,
}

/// One entry of a stream log. Stored as a JSON array whose first element is
/// the kind tag; absent fields are `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Quote(QuoteEvent),
    Chart(ChartEvent),
    Trade(TradeEvent),
}

impl StreamEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::Quote(e) => &e.symbol,
            StreamEvent::Chart(e) => &e.symbol,
            StreamEvent::Trade(e) => &e.symbol,
        }
    }

    pub fn to_tuple(&self) -> Value {
        match self {
            StreamEvent::Quote(e) => json!([
                QUOTE, e.msg_ts, e.symbol, e.quote_time, e.bid, e.ask, e.trade_time, e.last, e.last_size
            ]),
            StreamEvent::Chart(e) => json!([
                CHART, e.msg_ts, e.symbol, e.chart_time, e.open, e.close, e.high, e.low, e.volume
            ]),
            StreamEvent::Trade(e) => json!([TRADE, e.msg_ts, e.symbol, e.trade_time, e.last, e.last_size]),
        }
    }

    /// Decode a log entry. `Ok(None)` is the end-of-stream sentinel.
    pub fn from_tuple(value: &Value) -> Result<Option<Self>, StreamError> {
        if value.is_null() {
            return Ok(None);
        }
        let fields = value
            .as_array()
            .ok_or_else(|| StreamError::Malformed(format!("log entry is not a tuple: {value}")))?;
        let int = |i: usize| fields.get(i).and_then(Value::as_i64);
        let float = |i: usize| fields.get(i).and_then(Value::as_f64);
        let symbol = fields
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::Malformed(format!("log entry without symbol: {value}")))?
            .to_string();
        let event = match (int(0), fields.len()) {
            (Some(QUOTE), 9) => StreamEvent::Quote(QuoteEvent {
                msg_ts: int(1),
                symbol,
                quote_time: int(3),
                bid: float(4),
                ask: float(5),
                trade_time: int(6),
                last: float(7),
                last_size: int(8),
            }),
            (Some(CHART), 9) => StreamEvent::Chart(ChartEvent {
                msg_ts: int(1),
                symbol,
                chart_time: int(3),
                open: float(4),
                close: float(5),
                high: float(6),
                low: float(7),
                volume: int(8),
            }),
            (Some(TRADE), 6) => StreamEvent::Trade(TradeEvent {
                msg_ts: int(1),
                symbol,
                trade_time: int(3),
                last: float(4),
                last_size: int(5),
            }),
            _ => return Err(StreamError::Malformed(format!("unknown log entry: {value}"))),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_tuple_keeps_absent_fields_null() {
        let event = StreamEvent::Quote(QuoteEvent {
            msg_ts: Some(1),
            symbol: "SPY".into(),
            quote_time: None,
            bid: Some(10.5),
            ask: None,
            trade_time: None,
            last: None,
            last_size: None,
        });
        let tuple = event.to_tuple();
        assert_eq!(tuple, json!([1, 1, "SPY", null, 10.5, null, null, null, null]));
        assert_eq!(StreamEvent::from_tuple(&tuple).unwrap(), Some(event));
    }

    #[test]
    fn null_is_the_sentinel() {
        assert_eq!(StreamEvent::from_tuple(&Value::Null).unwrap(), None);
        assert!(StreamEvent::from_tuple(&json!([9, 0, "X"])).is_err());
    }
}
