//! One market session of streaming: writer on the async worker, reader and
//! caches on the calling thread.

use super::chart_cache::ChartCache;
use super::client::{Channel, StreamClient};
use super::nbbo::NbboCache;
use super::reader::{ReadEnd, StreamReader};
use super::writer::{StreamWriter, Subscriptions};
use super::{StreamError, StreamEvent};
use crate::error::SyncError;
use crate::worker::AsyncWorker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickcache_core::calendar::TradingCalendar;
use tickcache_core::config::{StreamSettings, MAX_REALTIME_SYMBOLS};
use tickcache_core::store::Store;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const STREAM_NAME: &str = "realtime";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// False when the market was closed and nothing ran.
    pub ran: bool,
    pub symbols: usize,
    pub events: usize,
    pub flushes: usize,
}

pub struct StreamSession {
    store: Arc<Store>,
    calendar: TradingCalendar,
    settings: StreamSettings,
    name: String,
}

impl StreamSession {
    pub fn new(store: Arc<Store>, calendar: TradingCalendar, settings: StreamSettings) -> Self {
        Self {
            store,
            calendar,
            settings,
            name: STREAM_NAME.to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Configured symbols, upper-cased, sorted and unique.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .settings
            .symbols
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    pub fn market_open(&self) -> bool {
        self.calendar.is_trading_date(self.calendar.today()) && self.calendar.market_open_now()
    }

    /// Stream until the market closes, `limit` elapses or `cancel` fires.
    pub fn run<C>(&self, client: C, limit: Option<Duration>, cancel: CancellationToken) -> Result<SessionReport, SyncError>
    where
        C: StreamClient + 'static,
    {
        if !self.market_open() {
            info!(today = %self.calendar.today(), "market closed, not streaming");
            return Ok(SessionReport::default());
        }
        let symbols = self.symbols();
        if symbols.is_empty() || (self.settings.realtime && symbols.len() > MAX_REALTIME_SYMBOLS) {
            return Err(StreamError::Invalid(format!(
                "stream takes 1 to {MAX_REALTIME_SYMBOLS} symbols, got {}",
                symbols.len()
            ))
            .into());
        }

        let nbbo = NbboCache::new(self.store.clone(), &symbols, self.settings.buffer_size)?;
        let mut chart = ChartCache::new(self.store.clone(), symbols.clone());
        chart.flush()?;

        let subscriptions: Subscriptions = [Channel::Quote, Channel::Chart, Channel::Trade]
            .into_iter()
            .map(|channel| (channel, symbols.clone()))
            .collect();
        let mut writer = StreamWriter::new(self.store.clone(), &self.name, client, subscriptions, self.settings.realtime)?;

        let worker = AsyncWorker::start("tickcache-stream")?;
        let writer = worker.run_task(async move {
            writer.connect().await?;
            Ok(writer)
        })?;
        let token = worker.cancel_token();
        worker.spawn(async move { writer.run(token).await.map_err(SyncError::from) });
        info!(stream = %self.name, symbols = symbols.len(), realtime = self.settings.realtime, "streaming");

        let interval = Duration::from_secs(self.settings.flush_interval_secs.max(1));
        let started = Instant::now();
        let should_stop = || {
            cancel.is_cancelled()
                || limit.is_some_and(|l| started.elapsed() >= l)
                || !self.calendar.market_open_now()
        };

        let mut report = SessionReport {
            ran: true,
            symbols: symbols.len(),
            ..SessionReport::default()
        };
        let mut reader = StreamReader::new(self.store.clone(), &self.name, 0).with_timeout(interval);
        let mut last_flush = Instant::now();
        let mut stopping = false;
        loop {
            let end = reader.run_batches(|batch| {
                nbbo.apply(batch)?;
                for event in batch {
                    if let StreamEvent::Chart(bar) = event {
                        chart.apply(bar);
                    }
                }
                report.events += batch.len();
                if last_flush.elapsed() >= interval {
                    chart.flush()?;
                    report.flushes += 1;
                    last_flush = Instant::now();
                }
                Ok(!stopping && should_stop())
            })?;
            if end == ReadEnd::Sentinel {
                break;
            }
            if chart.pending() > 0 {
                chart.flush()?;
                report.flushes += 1;
                last_flush = Instant::now();
            }
            if !stopping && should_stop() {
                // Cancelling the writer appends the sentinel; keep reading until it arrives.
                worker.cancel_token().cancel();
                stopping = true;
            }
        }

        chart.flush()?;
        report.flushes += 1;
        worker.stop()?;
        info!(events = report.events, flushes = report.flushes, "stream session finished");
        Ok(report)
    }
}
