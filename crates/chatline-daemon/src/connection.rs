//! Owns the external session and its reconnect policy.
//!
//! State machine:
//!
//! ```text
//! disconnected -> connecting -> open
//!                     ^          |
//!                     +----------+   transient loss, after the backoff
//! open/connecting -> disconnected    terminal loss (daemon shuts down)
//! any -> closing -> disconnected     daemon shutdown
//! ```
//!
//! `connecting -> open` happens only when the connector reports the session
//! as open. Operations fail fast unless the state is `open`; nothing is
//! queued across reconnects.

use crate::connector::{
    ConnectorError, DisconnectReason, InboundMessage, MessageRef, OutgoingMessage,
    SessionConnector, SessionEvent, SessionEvents, SessionUser,
};
use crate::shutdown::ShutdownHandle;
use chatline::protocol::{ChatSummary, ConnectionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Fixed wait before reconnecting after a transient loss.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MESSAGE_BUFFER: usize = 1024;

/// What to do after the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reconnect,
    Terminal,
}

/// Classifies disconnect reasons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectPolicy {
    /// Treat reasons the daemon does not recognise as transient.
    pub retry_unclassified: bool,
}

impl DisconnectPolicy {
    pub fn classify(&self, reason: &DisconnectReason) -> Disposition {
        match reason {
            DisconnectReason::LoggedOut | DisconnectReason::ConnectionReplaced => {
                Disposition::Terminal
            }
            DisconnectReason::TimedOut
            | DisconnectReason::ConnectionClosed
            | DisconnectReason::ConnectionLost
            | DisconnectReason::RestartRequired => Disposition::Reconnect,
            DisconnectReason::Other(_) if self.retry_unclassified => Disposition::Reconnect,
            DisconnectReason::Other(_) => Disposition::Terminal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to messaging session (state: {0})")]
    NotConnected(ConnectionState),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    policy: DisconnectPolicy,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
    user: watch::Sender<Option<SessionUser>>,
    messages: broadcast::Sender<InboundMessage>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        policy: DisconnectPolicy,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (user, _) = watch::channel(None);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            connector,
            policy,
            reconnect_delay,
            state,
            user,
            messages,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The authenticated account while the session is open.
    pub fn user(&self) -> Option<SessionUser> {
        self.user.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Messages observed on the session. Subscribe before [`run`](Self::run)
    /// to see everything.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "session state changed");
        }
    }

    /// Keep the session up until shutdown is requested or the session ends
    /// for good.
    ///
    /// Returns the terminal reason, or `None` if shutdown was requested; in
    /// that case the session has already been closed.
    pub async fn run(&self, shutdown: ShutdownHandle) -> Option<DisconnectReason> {
        loop {
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                _ = shutdown.requested() => {
                    self.close().await;
                    return None;
                }
                attempt = self.connector.connect() => attempt,
            };

            let reason = match attempt {
                Ok(events) => match self.drive(events, &shutdown).await {
                    Some(reason) => reason,
                    None => {
                        self.close().await;
                        return None;
                    }
                },
                Err(e) => {
                    tracing::warn!(err = %e, "failed to connect messaging session");
                    DisconnectReason::from_connect_error(&e)
                }
            };
            self.user.send_replace(None);

            match self.policy.classify(&reason) {
                Disposition::Terminal => {
                    tracing::error!(%reason, "messaging session ended, not reconnecting");
                    self.set_state(ConnectionState::Disconnected);
                    return Some(reason);
                }
                Disposition::Reconnect => {
                    tracing::warn!(
                        %reason,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "messaging session lost, reconnecting"
                    );
                    self.set_state(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = shutdown.requested() => {
                            self.close().await;
                            return None;
                        }
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Pump session events until the session closes (returns its reason) or
    /// shutdown is requested (returns `None`).
    async fn drive(
        &self,
        mut events: SessionEvents,
        shutdown: &ShutdownHandle,
    ) -> Option<DisconnectReason> {
        loop {
            let event = tokio::select! {
                _ = shutdown.requested() => return None,
                event = events.recv() => event,
            };
            match event {
                Some(SessionEvent::Open { user }) => {
                    tracing::info!(%user, "messaging session open");
                    self.user.send_replace(Some(user));
                    self.set_state(ConnectionState::Open);
                }
                Some(SessionEvent::Message(message)) => {
                    // No subscribers is fine.
                    let _ = self.messages.send(message);
                }
                Some(SessionEvent::Closed { reason }) => return Some(reason),
                None => return Some(DisconnectReason::ConnectionLost),
            }
        }
    }

    /// Tear the session down: `closing`, connector disconnect, `disconnected`.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.connector.disconnect().await;
        self.user.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            other => Err(SessionError::NotConnected(other)),
        }
    }

    pub async fn send(&self, message: OutgoingMessage) -> Result<String, SessionError> {
        self.ensure_open()?;
        Ok(self.connector.send(message).await?)
    }

    pub async fn edit(&self, target: MessageRef, new_text: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        Ok(self.connector.edit(target, new_text).await?)
    }

    pub async fn delete(&self, target: MessageRef) -> Result<(), SessionError> {
        self.ensure_open()?;
        Ok(self.connector.delete(target).await?)
    }

    pub async fn react(&self, target: MessageRef, emoji: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        Ok(self.connector.react(target, emoji).await?)
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, SessionError> {
        self.ensure_open()?;
        Ok(self.connector.list_chats().await?)
    }
}
