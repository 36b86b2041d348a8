//! JSON hub protocol over WebSocket.
//!
//! Every message is a JSON record terminated by `0x1e`. After the socket
//! opens the client sends `{"protocol":"json","version":1}` and the server
//! answers `{}` or `{"error": "..."}`. Afterwards records carry a numeric
//! `type`: 1 invocation, 6 ping, 7 close.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HelpdeskConfig;
use crate::error::PushError;
use crate::push::{PushTransport, TransportSignal};

pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Delays before each reconnect attempt after a drop. After the last one
/// fails the transport gives up.
pub const RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

const HANDSHAKE: &str = r#"{"protocol":"json","version":1}"#;
const PING: &str = r#"{"type":6}"#;
const SIGNAL_CAPACITY: usize = 64;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for one hub connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubOptions {
    pub url: String,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
}

/// Hub URLs are often configured with the page's `http(s)` scheme; the
/// socket needs `ws(s)`.
pub fn socket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

impl HubOptions {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: socket_url(url.as_ref()),
            ping_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
            reconnect_delays: RECONNECT_DELAYS.to_vec(),
        }
    }

    pub fn from_config(config: &HelpdeskConfig) -> Self {
        Self::new(&config.push_url)
    }
}

/// A decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { target: String, payload: Value },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Any other record type; ignored.
    Other(u8),
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    error: Option<String>,
    #[serde(rename = "allowReconnect", default)]
    allow_reconnect: bool,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

/// Split a text frame into its records. Empty trailing pieces are dropped.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn frame(record: &str) -> String {
    format!("{}{}", record, RECORD_SEPARATOR)
}

pub fn parse_record(record: &str) -> Result<HubMessage, PushError> {
    let raw: RawRecord = serde_json::from_str(record)
        .map_err(|e| PushError::Protocol(format!("bad hub record: {}", e)))?;
    Ok(match raw.kind {
        1 => {
            let target = raw
                .target
                .ok_or_else(|| PushError::Protocol("invocation without target".into()))?;
            HubMessage::Invocation {
                target,
                payload: raw.arguments.into_iter().next().unwrap_or(Value::Null),
            }
        }
        6 => HubMessage::Ping,
        7 => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Other(other),
    })
}

/// Open a socket and complete the handshake. Returns the socket and any
/// records that arrived in the same frame as the handshake response.
async fn open(options: &HubOptions) -> Result<(HubSocket, Vec<String>), PushError> {
    let (mut socket, _) = connect_async(options.url.as_str())
        .await
        .map_err(|e| PushError::Connect(e.to_string()))?;

    socket
        .send(Message::text(frame(HANDSHAKE)))
        .await
        .map_err(|e| PushError::Connect(e.to_string()))?;

    let deadline = Instant::now() + options.handshake_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, socket.next())
            .await
            .map_err(|_| PushError::Handshake("timed out waiting for handshake".into()))?;
        match next {
            Some(Ok(Message::Text(text))) => {
                let mut records = split_records(text.as_str());
                let Some(first) = records.next() else {
                    continue;
                };
                let response: HandshakeResponse = serde_json::from_str(first)
                    .map_err(|e| PushError::Handshake(format!("bad handshake response: {}", e)))?;
                if let Some(error) = response.error {
                    return Err(PushError::Handshake(error));
                }
                let rest = records.map(str::to_string).collect();
                debug!(url = %options.url, "hub handshake complete");
                return Ok((socket, rest));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(PushError::Handshake("closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(PushError::Handshake(e.to_string())),
        }
    }
}

/// Why a connected session ended.
enum Ended {
    Stopped,
    /// Nobody is listening for signals anymore.
    Abandoned,
    /// Server close record that forbids reconnecting.
    Closed(Option<String>),
    Lost(String),
}

/// Forward one record. Returns `Some` when the session must end.
async fn handle_record(record: &str, signals: &mpsc::Sender<TransportSignal>) -> Option<Ended> {
    match parse_record(record) {
        Ok(HubMessage::Invocation { target, payload }) => {
            if signals
                .send(TransportSignal::Event { target, payload })
                .await
                .is_err()
            {
                return Some(Ended::Abandoned);
            }
            None
        }
        Ok(HubMessage::Ping) => None,
        Ok(HubMessage::Close {
            error,
            allow_reconnect,
        }) => {
            info!(error = error.as_deref().unwrap_or("none"), allow_reconnect, "hub sent close");
            if allow_reconnect {
                Some(Ended::Lost(
                    error.unwrap_or_else(|| "server closed the connection".to_string()),
                ))
            } else {
                Some(Ended::Closed(error))
            }
        }
        Ok(HubMessage::Other(kind)) => {
            debug!(kind, "ignoring hub record");
            None
        }
        Err(err) => {
            warn!(error = %err, "skipping malformed hub record");
            None
        }
    }
}

async fn drive(
    socket: HubSocket,
    leftover: Vec<String>,
    options: &HubOptions,
    signals: &mpsc::Sender<TransportSignal>,
    cancel: &CancellationToken,
) -> Ended {
    let (mut sink, mut stream) = socket.split();

    for record in &leftover {
        if let Some(ended) = handle_record(record, signals).await {
            return ended;
        }
    }

    let start = Instant::now() + options.ping_interval;
    let mut ping = tokio::time::interval_at(start, options.ping_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ended::Stopped;
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::text(frame(PING))).await {
                    return Ended::Lost(e.to_string());
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for record in split_records(text.as_str()) {
                        if let Some(ended) = handle_record(record, signals).await {
                            return ended;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Ended::Lost("connection closed by server".to_string());
                }
                Some(Ok(Message::Binary(_))) => warn!("ignoring binary hub frame"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ended::Lost(e.to_string()),
            }
        }
    }
}

/// Run sessions until the transport is stopped, closed for good, or out of
/// reconnect attempts.
async fn run(
    options: HubOptions,
    mut socket: HubSocket,
    mut leftover: Vec<String>,
    signals: mpsc::Sender<TransportSignal>,
    cancel: CancellationToken,
) {
    loop {
        let reason = match drive(socket, leftover, &options, &signals, &cancel).await {
            Ended::Stopped | Ended::Abandoned => return,
            Ended::Closed(error) => {
                let _ = signals.send(TransportSignal::Closed(error)).await;
                return;
            }
            Ended::Lost(reason) => reason,
        };

        warn!(error = %reason, "hub connection lost");
        if signals
            .send(TransportSignal::Reconnecting(Some(reason.clone())))
            .await
            .is_err()
        {
            return;
        }

        let mut last_error = reason;
        let mut reopened = None;
        for (attempt, delay) in options.reconnect_delays.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(*delay) => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = open(&options) => result,
            };
            match result {
                Ok(opened) => {
                    info!(attempt = attempt + 1, "hub reconnected");
                    reopened = Some(opened);
                    break;
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "hub reconnect failed");
                    last_error = err.to_string();
                }
            }
        }

        match reopened {
            Some((next_socket, next_leftover)) => {
                if signals.send(TransportSignal::Reconnected).await.is_err() {
                    return;
                }
                socket = next_socket;
                leftover = next_leftover;
            }
            None => {
                let _ = signals.send(TransportSignal::Closed(Some(last_error))).await;
                return;
            }
        }
    }
}

/// `PushTransport` speaking the hub protocol.
#[derive(Debug, Clone)]
pub struct HubTransport {
    options: HubOptions,
}

impl HubTransport {
    pub fn new(options: HubOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }
}

impl PushTransport for HubTransport {
    async fn connect(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportSignal>, PushError> {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(PushError::Stopped),
            opened = timeout(self.options.handshake_timeout * 2, open(&self.options)) => opened,
        };
        let (socket, leftover) = opened.map_err(|_| {
            PushError::Connect(format!("timed out connecting to {}", self.options.url))
        })??;
        info!(url = %self.options.url, "hub connected");

        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
        tokio::spawn(run(self.options.clone(), socket, leftover, tx, cancel));
        Ok(rx)
    }
}
