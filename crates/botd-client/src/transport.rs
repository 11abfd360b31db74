//! Single-attempt session stream transport.
//!
//! A transport opens exactly one connection and reports its lifetime as an
//! event stream: `Opened`, zero or more `Frame`s, then exactly one `Closed`.
//! Retry policy lives in the reconnection controller, never here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::config::{Endpoint, TransportConfig};
use crate::error::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client-requested close (code 1000). Never reconnected.
    Graceful,
    /// Protocol-level rejection (bad auth). Terminal for the session.
    Rejected(String),
    /// Anything else. Drives backoff.
    Abnormal(String),
}

/// One lifecycle event on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed(CloseReason),
}

/// Live connection: a writer handle plus the event stream.
pub struct TransportConnection {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Outbound half of one connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn send(&self, frame: String) -> Result<()>;
    async fn close(&self);
}

/// Single-attempt duplex channel to one session stream.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        session_id: &str,
        after_seq: u64,
    ) -> Result<TransportConnection>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WebSocketTransport {
    config: TransportConfig,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

/// Build the per-session stream URL, carrying the resume cursor.
pub(crate) fn stream_url(endpoint: &Endpoint, session_id: &str, after_seq: u64) -> Result<Url> {
    let base = endpoint.ws_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/v1/sessions/{session_id}/stream"))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut()
        .append_pair("afterSeq", &after_seq.to_string());
    if let Some(token) = endpoint.auth_token.as_deref() {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Map a received close frame to a close reason.
pub(crate) fn classify_close_frame(code: u16, reason: &str) -> CloseReason {
    match code {
        1000 => CloseReason::Graceful,
        4401 | 4403 => CloseReason::Rejected(if reason.is_empty() {
            "authorization rejected".to_string()
        } else {
            reason.to_string()
        }),
        other => CloseReason::Abnormal(format!("close code {other}: {reason}")),
    }
}

#[async_trait]
impl SessionTransport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        session_id: &str,
        after_seq: u64,
    ) -> Result<TransportConnection> {
        let url = stream_url(endpoint, session_id, after_seq)?;
        let connect_result = timeout(self.config.dial_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.dial_timeout
                ))
            })?
            .map_err(|error| match error {
                tokio_tungstenite::tungstenite::Error::Http(response) => ClientError::Http(
                    format!("handshake rejected: status={}", response.status()),
                ),
                other => ClientError::WebSocket(other.to_string()),
            })?;

        let (stream, _response) = connect_result;
        let (writer, mut reader) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = session_id.to_string();

        let _ = events_tx.send(TransportEvent::Opened);
        tokio::spawn(async move {
            let mut close_reason = None;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if events_tx
                            .send(TransportEvent::Frame(text.to_string()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        close_reason = Some(match frame {
                            Some(frame) => {
                                classify_close_frame(u16::from(frame.code), frame.reason.as_ref())
                            }
                            None => CloseReason::Abnormal("closed without close frame".to_string()),
                        });
                        break;
                    }
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping on {} ({} bytes)", session, payload.len());
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Binary(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", session, error);
                        close_reason = Some(CloseReason::Abnormal(error.to_string()));
                        break;
                    }
                }
            }

            let reason =
                close_reason.unwrap_or_else(|| CloseReason::Abnormal("connection lost".to_string()));
            let _ = events_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportConnection {
            handle: Box::new(WsHandle {
                writer: Arc::new(Mutex::new(Some(writer))),
            }),
            events: events_rx,
        })
    }
}

struct WsHandle {
    writer: Arc<Mutex<Option<WsWriter>>>,
}

#[async_trait]
impl TransportHandle for WsHandle {
    async fn send(&self, frame: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(frame.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!("close frame send failed: {}", error);
        }
    }
}

/// Dial timeouts must stay below the backoff base so a hung dial cannot push
/// the next attempt past its scheduled slot.
pub(crate) fn dial_timeout_bounded(config: &TransportConfig, backoff_base: Duration) -> Duration {
    config.dial_timeout.min(backoff_base)
}
