//! tickcache core: calendar, timeslots, rate limiting, fetch adapters and the
//! incremental series store.
//!
//! - Trading calendar with an injectable clock
//! - Intraday timeslot codec and TWAP
//! - SQLite-backed object store with logs and dicts
//! - Cross-process rate limiter with quadratic backoff
//! - Brokerage, grouped-aggregate and fundamentals adapters
//! - Incremental daily, intraday and market series

pub mod calendar;
pub mod config;
pub mod data;
pub mod domain;
pub mod series;
pub mod store;
pub mod timeslot;
pub mod twap;

pub use calendar::{TradingCalendar, TradingSegment, MARKET_TZ};
pub use config::Settings;
pub use store::{Store, StoreError};
