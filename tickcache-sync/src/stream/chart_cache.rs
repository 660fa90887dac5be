//! Dense one-minute chart buffer for the streamed symbols.
//!
//! Shape is `(960, symbols, 6)` with the last axis holding open, close,
//! high, low, volume and a filled flag. The buffer is owned by a single
//! reader thread and written to the store only by [`ChartCache::flush`].

use super::{ChartEvent, StreamError};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tickcache_core::calendar::MARKET_TZ;
use tickcache_core::store::Store;
use tickcache_core::timeslot::{session_slot, Period};
use tracing::{debug, info};

pub const CHART_KEY: &str = "stream/chart";
pub const CHART_CONTENT_TYPE: &str = "f64le";
pub const CHART_COLUMNS: [&str; 6] = ["open", "close", "high", "low", "volume", "filled"];

const SLOTS: usize = 960;
const FIELDS: usize = CHART_COLUMNS.len();

pub struct ChartCache {
    store: Arc<Store>,
    symbols: Vec<String>,
    data: Vec<f64>,
    pending: usize,
}

impl ChartCache {
    /// A zeroed buffer for `symbols`. Symbol order fixes the second axis.
    pub fn new(store: Arc<Store>, symbols: Vec<String>) -> Self {
        let data = vec![0.0; SLOTS * symbols.len() * FIELDS];
        Self {
            store,
            symbols,
            data,
            pending: 0,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (SLOTS, self.symbols.len(), FIELDS)
    }

    /// Events applied since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn offset(&self, slot: usize, symbol: usize) -> usize {
        (slot * self.symbols.len() + symbol) * FIELDS
    }

    /// The six values at `(slot, symbol)`.
    pub fn cell(&self, slot: usize, symbol: &str) -> Option<&[f64]> {
        let index = self.symbols.iter().position(|s| s == symbol)?;
        if slot >= SLOTS {
            return None;
        }
        let start = self.offset(slot, index);
        Some(&self.data[start..start + FIELDS])
    }

    /// Write one chart bar into its minute slot. Events for unknown symbols
    /// or outside the session are ignored; returns whether the buffer changed.
    pub fn apply(&mut self, event: &ChartEvent) -> bool {
        let Some(index) = self.symbols.iter().position(|s| *s == event.symbol) else {
            return false;
        };
        let Some(ms) = event.chart_time else {
            return false;
        };
        let Some(utc) = Utc.timestamp_millis_opt(ms).single() else {
            return false;
        };
        let Some(slot) = session_slot(&utc.with_timezone(&MARKET_TZ), Period::One.minutes()) else {
            return false;
        };
        let start = self.offset(slot as usize, index);
        let values = [
            event.open.unwrap_or(f64::NAN),
            event.close.unwrap_or(f64::NAN),
            event.high.unwrap_or(f64::NAN),
            event.low.unwrap_or(f64::NAN),
            event.volume.map_or(f64::NAN, |v| v as f64),
            1.0,
        ];
        self.data[start..start + FIELDS].copy_from_slice(&values);
        self.pending += 1;
        debug!(symbol = %event.symbol, slot, "chart bar");
        true
    }

    /// Write the buffer to the store as a raw little-endian image.
    pub fn flush(&mut self) -> Result<usize, StreamError> {
        let flushed = self.pending;
        let mut bytes = Vec::with_capacity(self.data.len() * 8);
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let rows = (SLOTS * self.symbols.len()) as u64;
        self.store.put_bytes(CHART_KEY, CHART_CONTENT_TYPE, rows, &bytes)?;
        if flushed > 0 {
            info!(events = flushed, "flushed chart cache");
        }
        self.pending = 0;
        Ok(flushed)
    }

    /// Read a flushed image back into a buffer for `symbols`.
    pub fn load(store: Arc<Store>, symbols: Vec<String>) -> Result<Option<Self>, StreamError> {
        let Some(bytes) = store.get_bytes(CHART_KEY)? else {
            return Ok(None);
        };
        let mut cache = Self::new(store, symbols);
        if bytes.len() != cache.data.len() * 8 {
            return Err(StreamError::Malformed(format!(
                "chart image holds {} bytes, expected {}",
                bytes.len(),
                cache.data.len() * 8
            )));
        }
        for (value, chunk) in cache.data.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *value = f64::from_le_bytes(raw);
        }
        Ok(Some(cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, hour: u32, minute: u32) -> ChartEvent {
        let ts = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap();
        ChartEvent {
            msg_ts: None,
            symbol: symbol.into(),
            chart_time: Some(ts.timestamp_millis()),
            open: Some(1.0),
            close: Some(2.0),
            high: Some(3.0),
            low: Some(0.5),
            volume: Some(100),
        }
    }

    #[test]
    fn events_land_in_their_minute_slot() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut cache = ChartCache::new(store, vec!["AAA".into(), "BBB".into()]);
        assert!(cache.apply(&bar("BBB", 9, 30)));
        assert!(!cache.apply(&bar("ZZZ", 9, 30)));
        assert!(!cache.apply(&bar("AAA", 20, 0)));
        assert_eq!(cache.cell(330, "BBB").unwrap(), [1.0, 2.0, 3.0, 0.5, 100.0, 1.0]);
        assert_eq!(cache.cell(330, "AAA").unwrap(), [0.0; 6]);
        assert_eq!(cache.pending(), 1);
    }

    #[test]
    fn flush_and_load_round_trip() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let symbols = vec!["AAA".to_string()];
        let mut cache = ChartCache::new(store.clone(), symbols.clone());
        cache.apply(&bar("AAA", 4, 0));
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.pending(), 0);

        let meta = store.meta(CHART_KEY).unwrap().unwrap();
        assert_eq!(meta.content_type, CHART_CONTENT_TYPE);
        assert_eq!(meta.size, (960 * 6 * 8) as u64);

        let loaded = ChartCache::load(store, symbols).unwrap().unwrap();
        assert_eq!(loaded.cell(0, "AAA").unwrap()[5], 1.0);
    }
}
