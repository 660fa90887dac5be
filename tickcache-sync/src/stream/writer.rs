//! Stream writer: one task per brokerage connection, appending normalized
//! events to a store log.

use super::client::{Channel, Qos, StreamClient, StreamMessage};
use super::{log_name, ChartEvent, QuoteEvent, StreamError, StreamEvent, TradeEvent};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tickcache_core::store::Store;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Subscribed symbols per channel.
pub type Subscriptions = BTreeMap<Channel, Vec<String>>;

enum Command {
    AddChart {
        symbols: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, StreamError>>,
    },
}

/// Sends commands to a running writer.
#[derive(Clone)]
pub struct WriterHandle {
    commands: mpsc::Sender<Command>,
}

impl WriterHandle {
    /// Subscribe chart symbols not already subscribed. Returns the symbols
    /// that were actually added.
    pub async fn add(&self, symbols: Vec<String>) -> Result<Vec<String>, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddChart { symbols, reply })
            .await
            .map_err(|_| StreamError::WriterStopped)?;
        rx.await.map_err(|_| StreamError::WriterStopped)?
    }
}

pub struct StreamWriter<C> {
    store: Arc<Store>,
    log: String,
    client: C,
    subscriptions: Subscriptions,
    realtime: bool,
    commands: mpsc::Receiver<Command>,
    sender: mpsc::Sender<Command>,
}

impl<C: StreamClient> StreamWriter<C> {
    /// Clears the log `stream/{name}`.
    pub fn new(
        store: Arc<Store>,
        name: &str,
        client: C,
        subscriptions: Subscriptions,
        realtime: bool,
    ) -> Result<Self, StreamError> {
        let log = log_name(name);
        store.log_reset(&log, None)?;
        let (sender, commands) = mpsc::channel(16);
        Ok(Self {
            store,
            log,
            client,
            subscriptions,
            realtime,
            commands,
            sender,
        })
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            commands: self.sender.clone(),
        }
    }

    /// Log in, select the delivery rate and subscribe every channel.
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        self.client.login().await?;
        let qos = if self.realtime { Qos::Express } else { Qos::Delayed };
        self.client.quality_of_service(qos).await?;
        for (channel, symbols) in &self.subscriptions {
            if symbols.is_empty() {
                continue;
            }
            self.client.subscribe(*channel, symbols).await?;
            info!(log = %self.log, service = channel.service(), symbols = symbols.len(), "subscribed");
        }
        Ok(())
    }

    /// Pump messages into the log until cancelled or the connection closes.
    /// The sentinel is appended on every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(command) = self.commands.recv() => match command {
                    Command::AddChart { symbols, reply } => {
                        let _ = reply.send(self.add_chart(symbols).await);
                    }
                },
                message = self.client.next_message() => match message {
                    Ok(Some(message)) => {
                        if let Err(e) = self.append(&message) {
                            error!(log = %self.log, error = %e, "failed to append stream events");
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };
        self.store.log_append(&self.log, &Value::Null)?;
        info!(log = %self.log, "stream writer stopped");
        result
    }

    async fn add_chart(&mut self, symbols: Vec<String>) -> Result<Vec<String>, StreamError> {
        let current = self.subscriptions.entry(Channel::Chart).or_default();
        let mut added: Vec<String> = symbols.into_iter().filter(|s| !current.contains(s)).collect();
        added.sort();
        added.dedup();
        if added.is_empty() {
            return Ok(added);
        }
        if current.is_empty() {
            self.client.subscribe(Channel::Chart, &added).await?;
        } else {
            self.client.chart_add(&added).await?;
        }
        self.subscriptions.entry(Channel::Chart).or_default().extend(added.iter().cloned());
        info!(log = %self.log, added = added.len(), "chart symbols added");
        Ok(added)
    }

    fn append(&self, message: &StreamMessage) -> Result<(), StreamError> {
        let events = events(message);
        if events.is_empty() {
            return Ok(());
        }
        debug!(log = %self.log, events = events.len(), "appending");
        self.store.transaction(|tx| {
            for event in &events {
                tx.log_append(&self.log, &event.to_tuple())?;
            }
            Ok::<_, StreamError>(())
        })
    }
}

fn float(record: &Map<String, Value>, field: &str) -> Option<f64> {
    record.get(field).and_then(Value::as_f64)
}

fn int(record: &Map<String, Value>, field: &str) -> Option<i64> {
    record
        .get(field)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
}

/// Normalize a data message into log events. Records without a symbol are skipped.
pub fn events(message: &StreamMessage) -> Vec<StreamEvent> {
    let msg_ts = message.timestamp;
    message
        .content
        .iter()
        .filter_map(|record| {
            let symbol = record.get("key")?.as_str()?.to_string();
            let event = match message.channel {
                Channel::Quote => StreamEvent::Quote(QuoteEvent {
                    msg_ts,
                    symbol,
                    quote_time: int(record, "QUOTE_TIME_IN_LONG"),
                    bid: float(record, "BID_PRICE"),
                    ask: float(record, "ASK_PRICE"),
                    trade_time: int(record, "TRADE_TIME_IN_LONG"),
                    last: float(record, "LAST_PRICE"),
                    last_size: int(record, "LAST_SIZE"),
                }),
                Channel::Chart => StreamEvent::Chart(ChartEvent {
                    msg_ts,
                    symbol,
                    chart_time: int(record, "CHART_TIME"),
                    open: float(record, "OPEN_PRICE"),
                    close: float(record, "CLOSE_PRICE"),
                    high: float(record, "HIGH_PRICE"),
                    low: float(record, "LOW_PRICE"),
                    volume: int(record, "VOLUME"),
                }),
                Channel::Trade => StreamEvent::Trade(TradeEvent {
                    msg_ts,
                    symbol,
                    trade_time: int(record, "TRADE_TIME"),
                    last: float(record, "LAST_PRICE"),
                    last_size: int(record, "LAST_SIZE"),
                }),
            };
            Some(event)
        })
        .collect()
}
