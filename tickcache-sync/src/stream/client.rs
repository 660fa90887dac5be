//! Brokerage streaming protocol over a websocket.

use super::StreamError;
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use tickcache_core::config::{require_secret, TDA_ACCOUNT_ID};
use tickcache_core::data::TdaCredentials;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PRINCIPALS_URL: &str = "https://api.tdameritrade.com/v1/userprincipals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Quote,
    Chart,
    Trade,
}

impl Channel {
    pub fn service(self) -> &'static str {
        match self {
            Channel::Quote => "LEVELONE_EQUITIES",
            Channel::Chart => "CHART_EQUITY",
            Channel::Trade => "TIMESALE_EQUITY",
        }
    }

    fn fields(self) -> &'static str {
        match self {
            Channel::Quote => "0,1,2,3,9,50,51",
            Channel::Chart => "0,1,2,3,4,5,6,7,8",
            Channel::Trade => "0,1,2,3,4",
        }
    }

    pub fn from_service(service: &str) -> Option<Self> {
        [Channel::Quote, Channel::Chart, Channel::Trade]
            .into_iter()
            .find(|c| c.service() == service)
    }

    /// Field name for a numeric field id of this channel.
    fn label(self, id: &str) -> Option<&'static str> {
        let label = match (self, id) {
            (_, "0") => "key",
            (Channel::Quote, "1") => "BID_PRICE",
            (Channel::Quote, "2") => "ASK_PRICE",
            (Channel::Quote, "3") => "LAST_PRICE",
            (Channel::Quote, "9") => "LAST_SIZE",
            (Channel::Quote, "50") => "QUOTE_TIME_IN_LONG",
            (Channel::Quote, "51") => "TRADE_TIME_IN_LONG",
            (Channel::Chart, "1") => "OPEN_PRICE",
            (Channel::Chart, "2") => "HIGH_PRICE",
            (Channel::Chart, "3") => "LOW_PRICE",
            (Channel::Chart, "4") => "CLOSE_PRICE",
            (Channel::Chart, "5") => "VOLUME",
            (Channel::Chart, "6") => "SEQUENCE",
            (Channel::Chart, "7") => "CHART_TIME",
            (Channel::Chart, "8") => "CHART_DAY",
            (Channel::Trade, "1") => "TRADE_TIME",
            (Channel::Trade, "2") => "LAST_PRICE",
            (Channel::Trade, "3") => "LAST_SIZE",
            (Channel::Trade, "4") => "LAST_SEQUENCE",
            _ => return None,
        };
        Some(label)
    }
}

/// Delivery rate requested from the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    Express,
    RealTime,
    Fast,
    Moderate,
    Slow,
    Delayed,
}

impl Qos {
    pub fn level(self) -> u8 {
        self as u8
    }
}

/// One data message: a channel, the server timestamp and the per-symbol
/// records with field ids replaced by names.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub channel: Channel,
    pub timestamp: Option<i64>,
    pub content: Vec<Map<String, Value>>,
}

/// A streaming session with the brokerage.
#[async_trait]
pub trait StreamClient: Send {
    async fn login(&mut self) -> Result<(), StreamError>;

    async fn quality_of_service(&mut self, qos: Qos) -> Result<(), StreamError>;

    async fn subscribe(&mut self, channel: Channel, symbols: &[String]) -> Result<(), StreamError>;

    /// Add chart symbols to the existing chart subscription.
    async fn chart_add(&mut self, symbols: &[String]) -> Result<(), StreamError>;

    /// Next data message. `None` once the connection is closed.
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, StreamError>;
}

/// Decoded websocket frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Data(Vec<StreamMessage>),
    Response(Vec<Ack>),
    Notify,
}

/// Server acknowledgement of one request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ack {
    pub service: String,
    pub command: String,
    #[serde(rename = "requestid")]
    pub request_id: String,
    pub content: AckContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AckContent {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Replace numeric field ids with names. Unknown ids are dropped.
pub fn relabel(channel: Channel, record: &Map<String, Value>) -> Map<String, Value> {
    record
        .iter()
        .filter_map(|(id, value)| {
            let name = if id == "key" { Some("key") } else { channel.label(id) };
            name.map(|n| (n.to_string(), value.clone()))
        })
        .collect()
}

pub fn parse_frame(text: &str) -> Result<Frame, StreamError> {
    let value: Value = serde_json::from_str(text).map_err(|e| StreamError::Malformed(format!("{e}: {text}")))?;
    if let Some(data) = value.get("data").and_then(Value::as_array) {
        let mut messages = Vec::new();
        for item in data {
            let Some(channel) = item.get("service").and_then(Value::as_str).and_then(Channel::from_service) else {
                debug!(item = %item, "ignoring data for unknown service");
                continue;
            };
            let content = item
                .get("content")
                .and_then(Value::as_array)
                .map(|records| records.iter().filter_map(Value::as_object).map(|r| relabel(channel, r)).collect())
                .unwrap_or_default();
            messages.push(StreamMessage {
                channel,
                timestamp: item.get("timestamp").and_then(Value::as_i64),
                content,
            });
        }
        return Ok(Frame::Data(messages));
    }
    if let Some(response) = value.get("response") {
        let acks: Vec<Ack> = serde_json::from_value(response.clone())
            .map_err(|e| StreamError::Malformed(format!("response: {e}")))?;
        return Ok(Frame::Response(acks));
    }
    Ok(Frame::Notify)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Principals {
    streamer_info: StreamerInfo,
    accounts: Vec<PrincipalAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamerInfo {
    streamer_socket_url: String,
    token: String,
    token_timestamp: String,
    user_group: String,
    access_level: String,
    acl: String,
    app_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrincipalAccount {
    account_id: String,
    company: String,
    segment: String,
    account_cd_domain_id: String,
}

struct Session {
    socket: WsStream,
    account_id: String,
    app_id: String,
}

/// Websocket client for the brokerage streamer.
pub struct TdaStreamClient {
    http: reqwest::Client,
    api_key: String,
    access_token: String,
    account_id: String,
    session: Option<Session>,
    next_request: u64,
    pending: VecDeque<StreamMessage>,
}

impl TdaStreamClient {
    /// Reads the API key, token file and account id from the environment.
    pub fn from_env() -> Result<Self, StreamError> {
        let credentials = TdaCredentials::from_env().map_err(|e| StreamError::Login(e.to_string()))?;
        let account_id = require_secret(TDA_ACCOUNT_ID)?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: credentials.api_key,
            access_token: credentials.access_token,
            account_id,
            session: None,
            next_request: 0,
            pending: VecDeque::new(),
        })
    }

    async fn principals(&self) -> Result<Principals, StreamError> {
        let resp = self
            .http
            .get(PRINCIPALS_URL)
            .bearer_auth(&self.access_token)
            .query(&[
                ("fields", "streamerSubscriptionKeys,streamerConnectionInfo"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StreamError::Connection(format!("user principals: {e}")))?;
        if !resp.status().is_success() {
            return Err(StreamError::Login(format!("user principals: HTTP {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| StreamError::Malformed(format!("user principals: {e}")))
    }

    fn session(&mut self) -> Result<&mut Session, StreamError> {
        self.session
            .as_mut()
            .ok_or_else(|| StreamError::Connection("not logged in".into()))
    }

    /// Send one request and wait for its acknowledgement. Data that arrives
    /// meanwhile is queued for `next_message`.
    async fn request(&mut self, service: &str, command: &str, parameters: Value) -> Result<(), StreamError> {
        let request_id = self.next_request;
        self.next_request += 1;
        let session = self.session()?;
        let body = json!({
            "requests": [{
                "service": service,
                "command": command,
                "requestid": request_id.to_string(),
                "account": session.account_id,
                "source": session.app_id,
                "parameters": parameters,
            }]
        });
        session
            .socket
            .send(Message::Text(body.to_string()))
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        loop {
            let Some(frame) = self.read_frame().await? else {
                return Err(StreamError::Connection(format!("closed while waiting for {command}")));
            };
            match frame {
                Frame::Data(messages) => self.pending.extend(messages),
                Frame::Response(acks) => {
                    for ack in acks {
                        if ack.request_id != request_id.to_string() {
                            continue;
                        }
                        if ack.content.code != 0 {
                            return Err(StreamError::Rejected {
                                service: ack.service,
                                command: ack.command,
                                msg: ack.content.msg,
                            });
                        }
                        debug!(service, command, "stream request acknowledged");
                        return Ok(());
                    }
                }
                Frame::Notify => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let session = self.session()?;
        loop {
            match session.socket.next().await {
                Some(Ok(Message::Text(text))) => return parse_frame(&text).map(Some),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = session.socket.send(Message::Pong(data)).await {
                        warn!(error = %e, "failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "stream closed by server");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(StreamError::Connection(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Login credential: the url-encoded query string of the principal fields.
fn credential(principals: &Principals) -> Result<String, StreamError> {
    let info = &principals.streamer_info;
    let account = principals
        .accounts
        .first()
        .ok_or_else(|| StreamError::Login("no accounts in user principals".into()))?;
    let timestamp = DateTime::parse_from_str(&info.token_timestamp, "%Y-%m-%dT%H:%M:%S%z")
        .map_err(|e| StreamError::Malformed(format!("token timestamp {}: {e}", info.token_timestamp)))?
        .timestamp_millis();
    let fields = [
        ("userid", account.account_id.clone()),
        ("token", info.token.clone()),
        ("company", account.company.clone()),
        ("segment", account.segment.clone()),
        ("cddomain", account.account_cd_domain_id.clone()),
        ("usergroup", info.user_group.clone()),
        ("accesslevel", info.access_level.clone()),
        ("authorized", "Y".to_string()),
        ("timestamp", timestamp.to_string()),
        ("appid", info.app_id.clone()),
        ("acl", info.acl.clone()),
    ];
    let url = reqwest::Url::parse_with_params("https://localhost/", &fields)
        .map_err(|e| StreamError::Malformed(format!("credential: {e}")))?;
    Ok(url.query().unwrap_or_default().to_string())
}

#[async_trait]
impl StreamClient for TdaStreamClient {
    async fn login(&mut self) -> Result<(), StreamError> {
        let principals = self.principals().await?;
        let account_id = principals
            .accounts
            .iter()
            .find(|a| a.account_id == self.account_id)
            .map(|a| a.account_id.clone())
            .ok_or_else(|| StreamError::Login(format!("account {} not in user principals", self.account_id)))?;
        let url = format!("wss://{}/ws", principals.streamer_info.streamer_socket_url);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Connection(format!("{url}: {e}")))?;
        info!(url = %url, "stream connected");
        self.session = Some(Session {
            socket,
            account_id,
            app_id: principals.streamer_info.app_id.clone(),
        });
        let parameters = json!({
            "credential": credential(&principals)?,
            "token": principals.streamer_info.token,
            "version": "1.0",
        });
        self.request("ADMIN", "LOGIN", parameters)
            .await
            .map_err(|e| StreamError::Login(e.to_string()))
    }

    async fn quality_of_service(&mut self, qos: Qos) -> Result<(), StreamError> {
        self.request("ADMIN", "QOS", json!({ "qoslevel": qos.level().to_string() }))
            .await
    }

    async fn subscribe(&mut self, channel: Channel, symbols: &[String]) -> Result<(), StreamError> {
        let parameters = json!({ "keys": symbols.join(","), "fields": channel.fields() });
        self.request(channel.service(), "SUBS", parameters).await
    }

    async fn chart_add(&mut self, symbols: &[String]) -> Result<(), StreamError> {
        let parameters = json!({ "keys": symbols.join(","), "fields": Channel::Chart.fields() });
        self.request(Channel::Chart.service(), "ADD", parameters).await
    }

    async fn next_message(&mut self) -> Result<Option<StreamMessage>, StreamError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            match self.read_frame().await? {
                Some(Frame::Data(messages)) => self.pending.extend(messages),
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }
}
