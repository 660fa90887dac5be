//! Writer, reader and consumers against a scripted stream client.
//!
//! Tests:
//! 1. Writer login/QoS/subscribe order and delayed QoS
//! 2. Events flow through the log into the NBBO dict, tape and chart buffer
//! 3. `add` subscribes only new chart symbols; stop appends the sentinel
//! 4. A session streams only while the market is open
//! 5. A reader on a second store handle follows the same log

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tickcache_core::calendar::{FixedClock, TradingCalendar, MARKET_TZ};
use tickcache_core::config::StreamSettings;
use tickcache_core::store::Store;
use tickcache_sync::stream::chart_cache::CHART_KEY;
use tickcache_sync::stream::nbbo::Nbbo;
use tickcache_sync::stream::reader::ReadEnd;
use tickcache_sync::stream::writer::Subscriptions;
use tickcache_sync::stream::{
    Channel, ChartCache, NbboCache, Qos, StreamClient, StreamError, StreamEvent, StreamMessage, StreamReader,
    StreamSession, StreamWriter,
};
use tickcache_sync::AsyncWorker;
use tokio_util::sync::CancellationToken;

// ── Fake client ──────────────────────────────────────────────────────

/// Replays `script`, then either closes (`hang == false`) or waits forever.
struct ScriptedStream {
    script: VecDeque<StreamMessage>,
    hang: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStream {
    fn new(script: Vec<StreamMessage>, hang: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let client = Self {
            script: script.into(),
            hang,
            calls: calls.clone(),
        };
        (client, calls)
    }
}

#[async_trait]
impl StreamClient for ScriptedStream {
    async fn login(&mut self) -> Result<(), StreamError> {
        self.calls.lock().push("login".into());
        Ok(())
    }

    async fn quality_of_service(&mut self, qos: Qos) -> Result<(), StreamError> {
        self.calls.lock().push(format!("qos {qos:?}"));
        Ok(())
    }

    async fn subscribe(&mut self, channel: Channel, symbols: &[String]) -> Result<(), StreamError> {
        self.calls.lock().push(format!("subs {} {}", channel.service(), symbols.join(",")));
        Ok(())
    }

    async fn chart_add(&mut self, symbols: &[String]) -> Result<(), StreamError> {
        self.calls.lock().push(format!("add {}", symbols.join(",")));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<StreamMessage>, StreamError> {
        match self.script.pop_front() {
            Some(message) => Ok(Some(message)),
            None if self.hang => std::future::pending().await,
            None => Ok(None),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn message(channel: Channel, records: Vec<Value>) -> StreamMessage {
    StreamMessage {
        channel,
        timestamp: Some(1_709_649_000_000),
        content: records.into_iter().filter_map(|r| r.as_object().cloned()).collect(),
    }
}

fn minute_ms(hour: u32, minute: u32) -> i64 {
    MARKET_TZ.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap().timestamp_millis()
}

fn script() -> Vec<StreamMessage> {
    vec![
        message(Channel::Quote, vec![json!({"key": "SPY", "BID_PRICE": 510.1, "ASK_PRICE": 510.2})]),
        message(Channel::Quote, vec![json!({"key": "SPY", "ASK_PRICE": 510.15})]),
        message(
            Channel::Chart,
            vec![json!({"key": "SPY", "OPEN_PRICE": 510.0, "CLOSE_PRICE": 510.1, "HIGH_PRICE": 510.3,
                         "LOW_PRICE": 509.9, "VOLUME": 12000.0, "CHART_TIME": minute_ms(9, 31)})],
        ),
        message(
            Channel::Trade,
            vec![json!({"key": "SPY", "TRADE_TIME": minute_ms(9, 31), "LAST_PRICE": 510.12, "LAST_SIZE": 100.0})],
        ),
    ]
}

fn subscriptions(symbols: &[&str]) -> Subscriptions {
    let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
    [Channel::Quote, Channel::Chart, Channel::Trade]
        .into_iter()
        .map(|c| (c, symbols.clone()))
        .collect()
}

fn calendar_at(date: NaiveDate, hour: u32) -> TradingCalendar {
    TradingCalendar::with_clock(Arc::new(FixedClock::at_market_time(date, hour, 0)))
}

// ── 1-2. Writer to consumers ─────────────────────────────────────────

#[test]
fn events_flow_from_writer_to_consumers() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.log_append("stream/test", &json!("stale")).unwrap();
    let (client, calls) = ScriptedStream::new(script(), false);
    let mut writer = StreamWriter::new(store.clone(), "test", client, subscriptions(&["SPY"]), false).unwrap();
    assert_eq!(store.log_len("stream/test").unwrap(), 0);

    let worker = AsyncWorker::start("test-stream").unwrap();
    let writer = worker
        .run_task(async move {
            writer.connect().await?;
            Ok(writer)
        })
        .unwrap();
    assert_eq!(
        *calls.lock(),
        [
            "login",
            "qos Delayed",
            "subs LEVELONE_EQUITIES SPY",
            "subs CHART_EQUITY SPY",
            "subs TIMESALE_EQUITY SPY",
        ]
    );
    let token = worker.cancel_token();
    worker.spawn(async move { writer.run(token).await.map_err(Into::into) });

    let nbbo = NbboCache::new(store.clone(), &["SPY".into()], 10).unwrap();
    let mut chart = ChartCache::new(store.clone(), vec!["SPY".into()]);
    let mut reader = StreamReader::new(store.clone(), "test", 0);
    let end = reader
        .run_batches(|batch| {
            nbbo.apply(batch)?;
            for event in batch {
                if let StreamEvent::Chart(bar) = event {
                    chart.apply(bar);
                }
            }
            Ok(false)
        })
        .unwrap();
    assert_eq!(end, ReadEnd::Sentinel);
    worker.stop().unwrap();

    assert_eq!(store.log_len("stream/test").unwrap(), 5);
    assert_eq!(
        nbbo.get("SPY").unwrap(),
        Some(Nbbo {
            bid: Some(510.1),
            ask: Some(510.15)
        })
    );
    let tape = nbbo.tape().unwrap();
    assert_eq!(tape.len(), 1);
    assert_eq!(tape[0].size, Some(100));

    let slot = 5 * 60 + 31;
    assert_eq!(chart.cell(slot, "SPY").unwrap(), [510.0, 510.1, 510.3, 509.9, 12000.0, 1.0]);
    chart.flush().unwrap();
    assert!(store.exists(CHART_KEY).unwrap());
}

// ── 3. Adding chart symbols ──────────────────────────────────────────

#[test]
fn add_subscribes_only_new_chart_symbols() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let (client, calls) = ScriptedStream::new(Vec::new(), true);
    let mut writer = StreamWriter::new(store.clone(), "adds", client, subscriptions(&["SPY"]), true).unwrap();
    let handle = writer.handle();

    let worker = AsyncWorker::start("test-stream").unwrap();
    let writer = worker
        .run_task(async move {
            writer.connect().await?;
            Ok(writer)
        })
        .unwrap();
    let token = worker.cancel_token();
    worker.spawn(async move { writer.run(token).await.map_err(Into::into) });

    let added = worker
        .run_task(async move { handle.add(vec!["SPY".into(), "IWM".into(), "IWM".into()]).await.map_err(Into::into) })
        .unwrap();
    assert_eq!(added, ["IWM"]);
    assert!(calls.lock().contains(&"qos Express".to_string()));
    assert_eq!(calls.lock().last().unwrap(), "add IWM");

    worker.stop().unwrap();
    let last: Value = store.log_get("stream/adds", 0).unwrap().unwrap();
    assert!(last.is_null());
}

// ── 4. Session ───────────────────────────────────────────────────────

fn settings() -> StreamSettings {
    StreamSettings {
        symbols: vec!["spy".into()],
        realtime: true,
        buffer_size: 100,
        flush_interval_secs: 1,
    }
}

#[test]
fn session_streams_while_market_is_open() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let calendar = calendar_at(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(), 10);
    let session = StreamSession::new(store.clone(), calendar, settings()).with_name("session");
    let (client, calls) = ScriptedStream::new(script(), false);

    let report = session.run(client, None, CancellationToken::new()).unwrap();
    assert!(report.ran);
    assert_eq!(report.symbols, 1);
    assert_eq!(report.events, 4);
    assert!(report.flushes >= 1);
    assert_eq!(calls.lock()[1], "qos Express");

    let chart = ChartCache::load(store.clone(), vec!["SPY".into()]).unwrap().unwrap();
    assert_eq!(chart.cell(5 * 60 + 31, "SPY").unwrap()[5], 1.0);
    let nbbo = NbboCache::new(store, &["SPY".into()], 100);
    assert!(nbbo.is_ok());
}

#[test]
fn session_skips_closed_days() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let saturday = calendar_at(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), 10);
    let session = StreamSession::new(store, saturday, settings());
    let (client, calls) = ScriptedStream::new(script(), false);

    let report = session.run(client, None, CancellationToken::new()).unwrap();
    assert!(!report.ran);
    assert!(calls.lock().is_empty());
}

// ── 5. Cross-handle reading ──────────────────────────────────────────

#[test]
fn reader_on_another_handle_sees_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.db");
    let writer_store = Arc::new(Store::open(&path).unwrap());
    let reader_store = Arc::new(Store::open(&path).unwrap());

    let (client, _) = ScriptedStream::new(script(), false);
    let writer = StreamWriter::new(writer_store, "shared", client, subscriptions(&["SPY"]), true).unwrap();
    let worker = AsyncWorker::start("test-stream").unwrap();
    let token = worker.cancel_token();
    worker.spawn(async move { writer.run(token).await.map_err(Into::into) });

    let mut seen = Vec::new();
    let mut reader = StreamReader::new(reader_store, "shared", 0).with_timeout(std::time::Duration::from_secs(10));
    let end = reader
        .run(|event| {
            seen.push(event.symbol().to_string());
            Ok(false)
        })
        .unwrap();
    worker.stop().unwrap();

    assert_eq!(end, ReadEnd::Sentinel);
    assert_eq!(seen.len(), 4);
    assert_eq!(reader.offset(), 5);
}
