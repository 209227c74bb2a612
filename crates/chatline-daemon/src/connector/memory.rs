//! In-process connector driven from a [`MemoryRemote`] handle.
//!
//! Stands in for a real messaging service in tests: the remote decides when
//! the session opens or closes, delivers messages and records every
//! operation the daemon performs.

use super::{
    ConnectorError, ConnectorFuture, DisconnectReason, EVENT_BUFFER, InboundMessage, MessageRef,
    OutgoingMessage, SessionConnector, SessionEvent, SessionEvents, SessionUser,
};
use chatline::protocol::{CachedMessage, ChatSummary};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// An operation the daemon performed against the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Send { id: String, message: OutgoingMessage },
    Edit { target: MessageRef, new_text: String },
    Delete { target: MessageRef },
    React { target: MessageRef, emoji: String },
}

#[derive(Default)]
struct Inner {
    events: Option<mpsc::Sender<SessionEvent>>,
    auto_open: Option<SessionUser>,
    connect_failure: Option<ConnectorError>,
    operation_failure: Option<String>,
    chats: Vec<ChatSummary>,
    ops: Vec<RemoteOp>,
    disconnects: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    connects: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connector and the remote handle that controls it.
pub fn pair() -> (MemoryConnector, MemoryRemote) {
    let (connects, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner::default()),
        connects,
    });
    (
        MemoryConnector {
            shared: shared.clone(),
        },
        MemoryRemote { shared },
    )
}

pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Run `op` against the open session and log the operation it returns.
    fn perform<T>(
        &self,
        op: impl FnOnce() -> (T, RemoteOp),
    ) -> Result<T, ConnectorError> {
        let mut inner = self.shared.lock();
        if inner.events.is_none() {
            return Err(ConnectorError::Unavailable);
        }
        if let Some(reason) = inner.operation_failure.clone() {
            return Err(ConnectorError::Rejected(reason));
        }
        let (value, record) = op();
        inner.ops.push(record);
        Ok(value)
    }
}

impl SessionConnector for MemoryConnector {
    fn connect(&self) -> ConnectorFuture<'_, SessionEvents> {
        let result = {
            let mut inner = self.shared.lock();
            match inner.connect_failure.take() {
                Some(err) => Err(err),
                None => {
                    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                    if let Some(user) = inner.auto_open.clone() {
                        let _ = tx.try_send(SessionEvent::Open { user });
                    }
                    inner.events = Some(tx);
                    Ok(rx)
                }
            }
        };
        self.shared.connects.send_modify(|n| *n += 1);
        async move { result }.boxed()
    }

    fn send(&self, message: OutgoingMessage) -> ConnectorFuture<'_, String> {
        let result = self.perform(|| {
            let id = uuid::Uuid::new_v4().to_string();
            (id.clone(), RemoteOp::Send { id, message })
        });
        async move { result }.boxed()
    }

    fn edit(&self, target: MessageRef, new_text: String) -> ConnectorFuture<'_, ()> {
        let result = self.perform(|| ((), RemoteOp::Edit { target, new_text }));
        async move { result }.boxed()
    }

    fn delete(&self, target: MessageRef) -> ConnectorFuture<'_, ()> {
        let result = self.perform(|| ((), RemoteOp::Delete { target }));
        async move { result }.boxed()
    }

    fn react(&self, target: MessageRef, emoji: String) -> ConnectorFuture<'_, ()> {
        let result = self.perform(|| ((), RemoteOp::React { target, emoji }));
        async move { result }.boxed()
    }

    fn list_chats(&self) -> ConnectorFuture<'_, Vec<ChatSummary>> {
        let result = {
            let inner = self.shared.lock();
            if inner.events.is_none() {
                Err(ConnectorError::Unavailable)
            } else {
                Ok(inner.chats.clone())
            }
        };
        async move { result }.boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        {
            let mut inner = self.shared.lock();
            inner.events = None;
            inner.disconnects += 1;
        }
        async {}.boxed()
    }
}

/// Controls a [`MemoryConnector`] from the outside.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl MemoryRemote {
    /// Open every future session immediately as `user`.
    pub fn auto_open(&self, user: SessionUser) {
        self.shared.lock().auto_open = Some(user);
    }

    /// Make the next `connect()` fail with `err`.
    pub fn fail_next_connect(&self, err: ConnectorError) {
        self.shared.lock().connect_failure = Some(err);
    }

    /// Make every operation fail with a rejection until cleared with `None`.
    pub fn fail_operations(&self, reason: Option<&str>) {
        self.shared.lock().operation_failure = reason.map(str::to_string);
    }

    pub fn set_chats(&self, chats: Vec<ChatSummary>) {
        self.shared.lock().chats = chats;
    }

    /// Authenticate the current session. Returns false if none is connected.
    pub async fn open(&self, user: SessionUser) -> bool {
        self.emit(SessionEvent::Open { user }).await
    }

    /// End the current session with `reason`.
    pub async fn close(&self, reason: DisconnectReason) -> bool {
        let tx = self.shared.lock().events.take();
        match tx {
            Some(tx) => tx.send(SessionEvent::Closed { reason }).await.is_ok(),
            None => false,
        }
    }

    /// Drop the current session without a close event, like a vanished peer.
    pub fn drop_session(&self) {
        self.shared.lock().events = None;
    }

    /// Deliver a message on the current session.
    pub async fn deliver(&self, chat: &str, message: CachedMessage) -> bool {
        self.emit(SessionEvent::Message(InboundMessage {
            chat: chat.to_string(),
            message,
        }))
        .await
    }

    async fn emit(&self, event: SessionEvent) -> bool {
        let tx = self.shared.lock().events.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().events.is_some()
    }

    /// Number of `connect()` calls so far.
    pub fn connects(&self) -> usize {
        *self.shared.connects.borrow()
    }

    /// Wait until `connect()` has been called at least `n` times.
    pub async fn wait_for_connects(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.shared.connects.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn disconnects(&self) -> usize {
        self.shared.lock().disconnects
    }

    pub fn operations(&self) -> Vec<RemoteOp> {
        self.shared.lock().ops.clone()
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                RemoteOp::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }
}
