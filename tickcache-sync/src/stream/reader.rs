//! Follows a stream log from an offset.

use super::{log_name, StreamError, StreamEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tickcache_core::store::{Store, StoreError};
use tracing::{debug, warn};

/// Why a reader returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The writer appended its sentinel.
    Sentinel,
    /// The handler asked to stop.
    Stopped,
    /// No new entry arrived within the poll timeout.
    Idle,
}

pub struct StreamReader {
    store: Arc<Store>,
    log: String,
    offset: u64,
    timeout: Option<Duration>,
}

impl StreamReader {
    pub fn new(store: Arc<Store>, name: &str, offset: u64) -> Self {
        Self {
            store,
            log: log_name(name),
            offset,
            timeout: None,
        }
    }

    /// Return [`ReadEnd::Idle`] when nothing arrives for `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Entries consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wait for entries past the offset and return them. An entry of `None`
    /// is the sentinel; nothing after it is returned. `Ok(None)` on timeout.
    fn next_window(&mut self) -> Result<Option<Vec<Option<StreamEvent>>>, StreamError> {
        match self.store.wait_len(&self.log, self.offset + 1, self.timeout) {
            Ok(_) => {}
            Err(StoreError::WaitTimeout { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let offset = self.offset;
        let raw: Vec<Value> = self.store.transaction(|tx| {
            let len = tx.log_len(&self.log)?;
            tx.log_slice(&self.log, offset, len)
        })?;
        self.offset += raw.len() as u64;

        let mut window = Vec::with_capacity(raw.len());
        for value in &raw {
            match StreamEvent::from_tuple(value) {
                Ok(Some(event)) => window.push(Some(event)),
                Ok(None) => {
                    window.push(None);
                    break;
                }
                Err(e) => warn!(log = %self.log, error = %e, "skipping malformed entry"),
            }
        }
        debug!(log = %self.log, entries = window.len(), offset = self.offset, "read window");
        Ok(Some(window))
    }

    /// Feed events one at a time until the sentinel, or until `on_event`
    /// returns `true`.
    pub fn run<F>(&mut self, mut on_event: F) -> Result<ReadEnd, StreamError>
    where
        F: FnMut(StreamEvent) -> Result<bool, StreamError>,
    {
        loop {
            let Some(window) = self.next_window()? else {
                return Ok(ReadEnd::Idle);
            };
            for entry in window {
                let Some(event) = entry else {
                    return Ok(ReadEnd::Sentinel);
                };
                if on_event(event)? {
                    return Ok(ReadEnd::Stopped);
                }
            }
        }
    }

    /// Feed each window as one batch. The batch before a sentinel is still
    /// delivered.
    pub fn run_batches<F>(&mut self, mut on_batch: F) -> Result<ReadEnd, StreamError>
    where
        F: FnMut(&[StreamEvent]) -> Result<bool, StreamError>,
    {
        loop {
            let Some(window) = self.next_window()? else {
                return Ok(ReadEnd::Idle);
            };
            let ended = window.last().is_some_and(Option::is_none);
            let batch: Vec<StreamEvent> = window.into_iter().flatten().collect();
            if !batch.is_empty() && on_batch(&batch)? {
                return Ok(ReadEnd::Stopped);
            }
            if ended {
                return Ok(ReadEnd::Sentinel);
            }
        }
    }
}
