//! Connector speaking newline-delimited JSON to an external messaging bridge.
//!
//! The bridge process owns the messaging protocol and credentials. We send
//! request frames `{"id":N,"op":"send",...}` and receive three kinds of frame:
//!
//! - `{"type":"response","id":N,"ok":true,...}` / `{"type":"response","id":N,"error":".."}`;
//!   `send` answers with the new message's `messageId`
//! - `{"type":"connection","state":"open","user":{"id":"..","name":".."}}`
//!   and `{"type":"connection","state":"close","code":401,"reason":".."}`
//! - `{"type":"message","chat":"..","id":"..","fromMe":false,...}`
//!
//! Responses are matched to requests by id. A bridge stream that ends without
//! a close frame is reported as a lost connection.

use super::{
    ConnectorError, ConnectorFuture, DisconnectReason, EVENT_BUFFER, InboundMessage, MessageRef,
    OutgoingMessage, SessionConnector, SessionEvent, SessionEvents, SessionUser,
};
use chatline::protocol::{CachedMessage, ChatSummary, MAX_LINE_BYTES};
use chatline::transport::{Endpoint, IpcReader, IpcWriter};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// How long a bridge request may take before it is abandoned.
pub const BRIDGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Map<String, Value>, ConnectorError>>>>>;

/// Parse a bridge address: `HOST:PORT`, `tcp://HOST:PORT` or a socket path.
pub fn parse_bridge_addr(s: &str) -> anyhow::Result<Endpoint> {
    if let Ok(addr) = s.trim().parse::<SocketAddr>() {
        return Ok(Endpoint::Tcp(addr));
    }
    Ok(Endpoint::parse(s)?)
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Response {
        id: u64,
        #[serde(default)]
        error: Option<String>,
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    Connection {
        state: String,
        #[serde(default)]
        user: Option<BridgeUser>,
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Message {
        chat: String,
        #[serde(flatten)]
        message: CachedMessage,
    },
}

#[derive(Debug, Deserialize)]
struct BridgeUser {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

fn close_reason(code: Option<u16>, reason: Option<String>) -> DisconnectReason {
    match (code, reason) {
        (Some(code), _) => DisconnectReason::from_code(code),
        (None, Some(label)) => DisconnectReason::from_label(&label),
        (None, None) => DisconnectReason::ConnectionClosed,
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

struct BridgeSession {
    writer: Mutex<FramedWrite<IpcWriter, LinesCodec>>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Production connector backed by a messaging bridge process.
pub struct BridgeConnector {
    endpoint: Endpoint,
    next_id: AtomicU64,
    session: Mutex<Option<Arc<BridgeSession>>>,
}

impl BridgeConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    async fn open_session(&self) -> Result<SessionEvents, ConnectorError> {
        let (r, w) = self.endpoint.connect().await?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(r, event_tx, pending.clone()));
        let session = Arc::new(BridgeSession {
            writer: Mutex::new(FramedWrite::new(
                w,
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            )),
            pending,
            reader,
        });
        *self.session.lock().await = Some(session.clone());

        tracing::info!(bridge = %self.endpoint, "connected to messaging bridge");
        if let Err(e) = self.call(&session, "connect", Map::new()).await {
            self.session.lock().await.take();
            return Err(e);
        }
        Ok(event_rx)
    }

    async fn current(&self) -> Result<Arc<BridgeSession>, ConnectorError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(ConnectorError::Unavailable)
    }

    async fn request(
        &self,
        op: &str,
        params: Map<String, Value>,
    ) -> Result<Map<String, Value>, ConnectorError> {
        let session = self.current().await?;
        self.call(&session, op, params).await
    }

    async fn call(
        &self,
        session: &BridgeSession,
        op: &str,
        mut params: Map<String, Value>,
    ) -> Result<Map<String, Value>, ConnectorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        params.insert("id".to_string(), json!(id));
        params.insert("op".to_string(), json!(op));
        let line = serde_json::to_string(&params)
            .map_err(|e| ConnectorError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        session.pending.lock().await.insert(id, tx);

        let sent = session.writer.lock().await.send(line).await;
        if let Err(e) = sent {
            session.pending.lock().await.remove(&id);
            return Err(ConnectorError::Protocol(format!("failed to write to bridge: {e}")));
        }

        match tokio::time::timeout(BRIDGE_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectorError::Unavailable),
            Err(_) => {
                session.pending.lock().await.remove(&id);
                Err(ConnectorError::Protocol(format!(
                    "bridge did not answer {op} within {BRIDGE_REQUEST_TIMEOUT:?}"
                )))
            }
        }
    }
}

impl SessionConnector for BridgeConnector {
    fn connect(&self) -> ConnectorFuture<'_, SessionEvents> {
        self.open_session().boxed()
    }

    fn send(&self, message: OutgoingMessage) -> ConnectorFuture<'_, String> {
        async move {
            let mut params = Map::new();
            params.insert("chat".into(), json!(message.chat));
            params.insert("text".into(), json!(message.text));
            if let Some(file) = &message.file {
                params.insert("file".into(), json!(file));
            }
            if let Some(reply_to) = &message.reply_to {
                params.insert("replyTo".into(), json!(reply_to));
            }
            let result = self.request("send", params).await?;
            match result.get("messageId") {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(ConnectorError::Protocol(
                    "send response carried no message id".into(),
                )),
            }
        }
        .boxed()
    }

    fn edit(&self, target: MessageRef, new_text: String) -> ConnectorFuture<'_, ()> {
        async move {
            let mut params = target_params(&target);
            params.insert("text".into(), json!(new_text));
            self.request("edit", params).await.map(|_| ())
        }
        .boxed()
    }

    fn delete(&self, target: MessageRef) -> ConnectorFuture<'_, ()> {
        async move {
            self.request("delete", target_params(&target))
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn react(&self, target: MessageRef, emoji: String) -> ConnectorFuture<'_, ()> {
        async move {
            let mut params = target_params(&target);
            params.insert("emoji".into(), json!(emoji));
            self.request("react", params).await.map(|_| ())
        }
        .boxed()
    }

    fn list_chats(&self) -> ConnectorFuture<'_, Vec<ChatSummary>> {
        async move {
            let mut result = self.request("chats", Map::new()).await?;
            let chats = result.remove("chats").unwrap_or(Value::Array(Vec::new()));
            serde_json::from_value(chats).map_err(|e| ConnectorError::Protocol(e.to_string()))
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        async move {
            let Some(session) = self.session.lock().await.take() else {
                return;
            };
            let bye = tokio::time::timeout(
                DISCONNECT_TIMEOUT,
                self.call(&session, "disconnect", Map::new()),
            )
            .await;
            if !matches!(bye, Ok(Ok(_))) {
                tracing::debug!(bridge = %self.endpoint, "bridge did not acknowledge disconnect");
            }
        }
        .boxed()
    }
}

fn target_params(target: &MessageRef) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("chat".into(), json!(target.chat));
    params.insert("messageId".into(), json!(target.id));
    params
}

async fn read_loop(reader: IpcReader, events: mpsc::Sender<SessionEvent>, pending: Pending) {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut closed = false;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(err = %e, "bridge stream failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: BridgeFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "ignoring malformed bridge frame");
                continue;
            }
        };
        match frame {
            BridgeFrame::Response { id, error, data } => {
                let Some(tx) = pending.lock().await.remove(&id) else {
                    tracing::debug!(id, "response for unknown bridge request");
                    continue;
                };
                let result = match error {
                    Some(reason) => Err(ConnectorError::Rejected(reason)),
                    None => Ok(data),
                };
                let _ = tx.send(result);
            }
            BridgeFrame::Connection {
                state,
                user,
                code,
                reason,
            } => {
                let event = match state.as_str() {
                    "open" => {
                        let user = user
                            .map(|u| SessionUser { id: u.id, name: u.name })
                            .unwrap_or_else(|| SessionUser::new("unknown"));
                        SessionEvent::Open { user }
                    }
                    "close" => {
                        closed = true;
                        SessionEvent::Closed {
                            reason: close_reason(code, reason),
                        }
                    }
                    other => {
                        tracing::debug!(state = other, "bridge connection update");
                        continue;
                    }
                };
                if events.send(event).await.is_err() || closed {
                    break;
                }
            }
            BridgeFrame::Message { chat, message } => {
                let event = SessionEvent::Message(InboundMessage { chat, message });
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    if !closed {
        let _ = events
            .send(SessionEvent::Closed {
                reason: DisconnectReason::ConnectionLost,
            })
            .await;
    }
    // Dropping the senders fails every outstanding request.
    pending.lock().await.clear();
}
