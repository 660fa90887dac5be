//! Domain rows for cached market data

pub mod bar;
pub mod ticker;

pub use bar::{DailyBar, IntradayBar, MarketBar, Ohlcv};
pub use ticker::{NewsItem, TickerDetails, TickerEntry, TickerRef, TICKER_ENTRY_TTL_DAYS};
