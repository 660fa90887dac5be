//! Latest bid/ask per symbol and a bounded trade tape.

use super::{StreamError, StreamEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tickcache_core::config::MAX_REALTIME_SYMBOLS;
use tickcache_core::store::Store;

pub const NBBO_DICT: &str = "realtime/nbbo";
pub const TRADES_LOG: &str = "realtime/trades";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nbbo {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeEntry {
    pub symbol: String,
    pub timestamp: Option<i64>,
    pub price: Option<f64>,
    pub size: Option<i64>,
}

pub struct NbboCache {
    store: Arc<Store>,
}

impl NbboCache {
    /// Reset the dict to null sides for `symbols` and bound the tape to
    /// `buffer_size` entries.
    pub fn new(store: Arc<Store>, symbols: &[String], buffer_size: u64) -> Result<Self, StreamError> {
        if symbols.is_empty() || symbols.len() > MAX_REALTIME_SYMBOLS {
            return Err(StreamError::Invalid(format!(
                "realtime stream takes 1 to {MAX_REALTIME_SYMBOLS} symbols, got {}",
                symbols.len()
            )));
        }
        store.transaction(|tx| {
            tx.dict_clear(NBBO_DICT)?;
            for symbol in symbols {
                tx.dict_set(NBBO_DICT, symbol, &Nbbo::default())?;
            }
            tx.log_configure(TRADES_LOG, Some(buffer_size))?;
            Ok::<_, StreamError>(())
        })?;
        Ok(Self { store })
    }

    /// Apply one batch of events in a single transaction.
    pub fn apply(&self, events: &[StreamEvent]) -> Result<(), StreamError> {
        self.store.transaction(|tx| {
            for event in events {
                match event {
                    StreamEvent::Quote(quote) => {
                        if quote.bid.is_none() && quote.ask.is_none() {
                            continue;
                        }
                        let mut nbbo: Nbbo = tx.dict_get(NBBO_DICT, &quote.symbol)?.unwrap_or_default();
                        if let Some(bid) = quote.bid {
                            nbbo.bid = Some(bid);
                        }
                        if let Some(ask) = quote.ask {
                            nbbo.ask = Some(ask);
                        }
                        tx.dict_set(NBBO_DICT, &quote.symbol, &nbbo)?;
                    }
                    StreamEvent::Trade(trade) => {
                        let entry = TapeEntry {
                            symbol: trade.symbol.clone(),
                            timestamp: trade.trade_time,
                            price: trade.last,
                            size: trade.last_size,
                        };
                        tx.log_append(TRADES_LOG, &entry)?;
                    }
                    StreamEvent::Chart(_) => {}
                }
            }
            Ok::<_, StreamError>(())
        })
    }

    pub fn get(&self, symbol: &str) -> Result<Option<Nbbo>, StreamError> {
        Ok(self.store.dict_get(NBBO_DICT, symbol)?)
    }

    pub fn all(&self) -> Result<Vec<(String, Nbbo)>, StreamError> {
        Ok(self.store.dict_items(NBBO_DICT)?)
    }

    /// Retained tape, oldest first.
    pub fn tape(&self) -> Result<Vec<TapeEntry>, StreamError> {
        let len = self.store.log_len(TRADES_LOG)?;
        Ok(self.store.log_slice(TRADES_LOG, 0, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{QuoteEvent, TradeEvent};

    fn quote(symbol: &str, bid: Option<f64>, ask: Option<f64>) -> StreamEvent {
        StreamEvent::Quote(QuoteEvent {
            msg_ts: None,
            symbol: symbol.into(),
            quote_time: None,
            bid,
            ask,
            trade_time: None,
            last: None,
            last_size: None,
        })
    }

    fn trade(price: f64) -> StreamEvent {
        StreamEvent::Trade(TradeEvent {
            msg_ts: None,
            symbol: "SPY".into(),
            trade_time: Some(1),
            last: Some(price),
            last_size: Some(5),
        })
    }

    #[test]
    fn quotes_update_only_present_sides() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = NbboCache::new(store, &["SPY".into(), "QQQ".into()], 10).unwrap();
        assert_eq!(cache.get("QQQ").unwrap(), Some(Nbbo::default()));

        cache
            .apply(&[quote("SPY", Some(1.0), Some(1.2)), quote("SPY", None, Some(1.1))])
            .unwrap();
        assert_eq!(cache.get("SPY").unwrap(), Some(Nbbo { bid: Some(1.0), ask: Some(1.1) }));
        assert_eq!(cache.all().unwrap().len(), 2);
    }

    #[test]
    fn tape_is_bounded() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = NbboCache::new(store, &["SPY".into()], 3).unwrap();
        let events: Vec<StreamEvent> = (1..=5).map(|p| trade(p as f64)).collect();
        cache.apply(&events).unwrap();
        let prices: Vec<f64> = cache.tape().unwrap().iter().filter_map(|t| t.price).collect();
        assert_eq!(prices, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn symbol_count_is_checked() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        assert!(NbboCache::new(store, &[], 10).is_err());
    }
}
