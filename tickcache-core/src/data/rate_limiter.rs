//! Distributed admission control: at most N requests started per rolling interval.
//!
//! State lives in the shared store so every process pointing at the same file
//! sees the same budget:
//! - an entry log bounded to `max_in_flight`, holding `(start_ns, request_id)`
//! - an exit dict `request_id -> end_ns`
//!
//! A slot is reclaimed once `interval` has passed since the oldest entry's
//! effective start: its exit time when it has finished, its entry time when
//! it has not.

use crate::config::{Backoff, RateLimit};
use crate::store::{Store, StoreError};
use chrono::Utc;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate limiter '{name}' is already held by this thread")]
    Reentrant { name: String },

    #[error("rate limiter '{name}': {attempts} attempts failed, last error: {last}")]
    Exhausted {
        name: String,
        attempts: u32,
        last: String,
    },

    #[error("rate limiter state: {0}")]
    Store(#[from] StoreError),
}

thread_local! {
    static HELD: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// `rate-limiter-{blake3(name + interval + max_in_flight + kind)}`
pub fn storage_key(name: &str, interval: Duration, max_in_flight: u32, kind: &str) -> String {
    let material = format!("{name}{}{max_in_flight}{kind}", interval.as_secs_f64());
    format!("rate-limiter-{}", blake3::hash(material.as_bytes()).to_hex())
}

enum Admit {
    Granted(String),
    Wait(Duration),
}

/// Shared limiter for one named upstream.
#[derive(Clone)]
pub struct RateLimiter {
    name: String,
    interval: Duration,
    max_in_flight: u32,
    backoff: Backoff,
    entry_log: String,
    exit_dict: String,
    store: Arc<Store>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<Store>,
        name: impl Into<String>,
        interval: Duration,
        max_in_flight: u32,
    ) -> Result<Self, LimiterError> {
        let name = name.into();
        let max_in_flight = max_in_flight.max(1);
        let entry_log = storage_key(&name, interval, max_in_flight, "entry");
        let exit_dict = storage_key(&name, interval, max_in_flight, "exit");
        store.transaction(|tx| tx.log_configure(&entry_log, Some(u64::from(max_in_flight))))?;
        Ok(Self {
            name,
            interval,
            max_in_flight,
            backoff: Backoff::default(),
            entry_log,
            exit_dict,
            store,
        })
    }

    pub fn from_limit(
        store: Arc<Store>,
        name: impl Into<String>,
        limit: &RateLimit,
        backoff: Backoff,
    ) -> Result<Self, LimiterError> {
        Ok(Self::new(store, name, limit.interval(), limit.max_in_flight)?.with_backoff(backoff))
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    fn held_key(&self) -> &str {
        &self.entry_log
    }

    fn is_held(&self) -> bool {
        HELD.with(|held| held.borrow().contains(self.held_key()))
    }

    /// Start a retry loop of at most `max_attempts` attempts.
    pub fn try_request(&self, max_attempts: u32) -> Attempts<'_> {
        Attempts {
            limiter: self,
            max_attempts,
            attempts: 0,
            errors: Vec::new(),
            failed: false,
        }
    }

    /// Block until a slot is free and take it. The slot is released on drop.
    pub fn admit(&self) -> Result<Admission<'_>, LimiterError> {
        if self.is_held() {
            return Err(LimiterError::Reentrant {
                name: self.name.clone(),
            });
        }
        loop {
            match self.try_admit()? {
                Admit::Granted(request_id) => {
                    HELD.with(|held| held.borrow_mut().insert(self.held_key().to_string()));
                    return Ok(Admission {
                        limiter: self,
                        request_id,
                    });
                }
                Admit::Wait(wait) => {
                    debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "waiting for slot");
                    std::thread::sleep(wait);
                }
            }
        }
    }

    fn try_admit(&self) -> Result<Admit, LimiterError> {
        let interval_ns = self.interval.as_nanos().min(i64::MAX as u128) as i64;
        self.store.transaction(|tx| {
            let request_id = Uuid::new_v4().to_string();
            if tx.log_len(&self.entry_log)? < u64::from(self.max_in_flight) {
                tx.log_append(&self.entry_log, &(now_ns(), &request_id))?;
                return Ok(Admit::Granted(request_id));
            }
            let Some((entry_ns, oldest_id)) = tx.log_get::<(i64, String)>(&self.entry_log, 0)? else {
                tx.log_append(&self.entry_log, &(now_ns(), &request_id))?;
                return Ok(Admit::Granted(request_id));
            };
            let exit_ns = tx.dict_get::<i64>(&self.exit_dict, &oldest_id)?;
            let effective = exit_ns.unwrap_or(entry_ns);
            let now = now_ns();
            if now.saturating_sub(effective) > interval_ns {
                if exit_ns.is_some() {
                    tx.dict_remove(&self.exit_dict, &oldest_id)?;
                }
                tx.log_append(&self.entry_log, &(now, &request_id))?;
                Ok(Admit::Granted(request_id))
            } else {
                let wait = effective.saturating_add(interval_ns).saturating_sub(now).max(0);
                Ok(Admit::Wait(Duration::from_nanos(wait as u64)))
            }
        })
    }

    fn release(&self, request_id: &str) {
        HELD.with(|held| held.borrow_mut().remove(self.held_key()));
        if let Err(e) = self.store.dict_set(&self.exit_dict, request_id, &now_ns()) {
            warn!(limiter = %self.name, error = %e, "failed to record request exit");
        }
    }

    /// Entries currently in the window (for diagnostics).
    pub fn in_flight(&self) -> Result<u64, LimiterError> {
        Ok(self.store.log_len(&self.entry_log)?)
    }

    /// Forget all recorded entries and exits.
    pub fn reset(&self) -> Result<(), LimiterError> {
        self.store.transaction(|tx| {
            tx.log_configure(&self.entry_log, Some(u64::from(self.max_in_flight)))?;
            tx.log_clear(&self.entry_log)?;
            tx.dict_clear(&self.exit_dict)
        })?;
        Ok(())
    }
}

/// A held slot. Dropping it records the exit time.
pub struct Admission<'a> {
    limiter: &'a RateLimiter,
    request_id: String,
}

impl Admission<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.limiter.release(&self.request_id);
    }
}

/// Retry loop state. Iterating yields attempt numbers (1-based), sleeping
/// `i^2 * unit` before attempt `i + 1`; when the iterator ends the loop is
/// marked failed.
pub struct Attempts<'a> {
    limiter: &'a RateLimiter,
    max_attempts: u32,
    attempts: u32,
    errors: Vec<String>,
    failed: bool,
}

impl Iterator for Attempts<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.attempts >= self.max_attempts {
            self.failed = true;
            return None;
        }
        if self.attempts > 0 {
            std::thread::sleep(self.limiter.backoff.delay(self.attempts));
        }
        self.attempts += 1;
        Some(self.attempts)
    }
}

impl Attempts<'_> {
    /// Run one attempt inside an admission. A failure inside `f` is recorded
    /// and reported as `Ok(None)`; only limiter errors propagate.
    pub fn attempt<T, E: Display>(
        &mut self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<Option<T>, LimiterError> {
        let _slot = self.limiter.admit()?;
        match f() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!(limiter = %self.limiter.name, attempt = self.attempts, error = %e, "attempt failed");
                self.errors.push(e.to_string());
                Ok(None)
            }
        }
    }

    /// Drive the whole loop: stop on the first success, or return
    /// [`LimiterError::Exhausted`] once attempts run out.
    pub fn run<T, E: Display>(mut self, mut f: impl FnMut() -> Result<T, E>) -> Result<T, LimiterError> {
        while self.next().is_some() {
            if let Some(value) = self.attempt(&mut f)? {
                if self.attempts > 1 {
                    warn!(limiter = %self.limiter.name, attempts = self.attempts, "request needed retries");
                }
                return Ok(value);
            }
        }
        Err(self.exhausted())
    }

    /// Like [`run`](Self::run), but only errors `retryable` accepts are
    /// retried. Any other error ends the loop at once as `Ok(Err(e))`.
    pub fn run_retrying<T, E: Display>(
        mut self,
        mut f: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<Result<T, E>, LimiterError> {
        while self.next().is_some() {
            let _slot = self.limiter.admit()?;
            match f() {
                Ok(value) => {
                    if self.attempts > 1 {
                        warn!(limiter = %self.limiter.name, attempts = self.attempts, "request needed retries");
                    }
                    return Ok(Ok(value));
                }
                Err(e) if retryable(&e) => {
                    debug!(limiter = %self.limiter.name, attempt = self.attempts, error = %e, "attempt failed");
                    self.errors.push(e.to_string());
                }
                Err(e) => {
                    debug!(limiter = %self.limiter.name, attempt = self.attempts, error = %e, "permanent error");
                    return Ok(Err(e));
                }
            }
        }
        Err(self.exhausted())
    }

    fn exhausted(&self) -> LimiterError {
        LimiterError::Exhausted {
            name: self.limiter.name.clone(),
            attempts: self.attempts,
            last: self.errors.last().cloned().unwrap_or_default(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}
