//! The boundary to the external messaging session.
//!
//! The daemon never speaks the messaging protocol itself. A [`SessionConnector`]
//! opens the session, reports its lifecycle as [`SessionEvent`]s and performs
//! the handful of operations the IPC actions need.

pub mod bridge;
pub mod memory;

use chatline::protocol::{CachedMessage, ChatSummary};
use futures_util::future::BoxFuture;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::sync::mpsc;

pub use bridge::BridgeConnector;
pub use memory::{MemoryConnector, MemoryRemote};

/// Future returned by fallible connector operations.
pub type ConnectorFuture<'a, T> = BoxFuture<'a, Result<T, ConnectorError>>;

/// Receiving end of an open session's event stream.
pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// Capacity of the event channel a connector hands out on `connect`.
pub const EVENT_BUFFER: usize = 256;

/// An external messaging session the daemon keeps open.
///
/// Only the connection manager holds one of these. Operations are only
/// attempted while the session is open.
pub trait SessionConnector: Send + Sync {
    /// Start a session. Events arrive on the returned channel until it closes;
    /// the session is usable once [`SessionEvent::Open`] has been received.
    fn connect(&self) -> ConnectorFuture<'_, SessionEvents>;

    /// Send a message and return the id the remote side assigned to it.
    fn send(&self, message: OutgoingMessage) -> ConnectorFuture<'_, String>;

    fn edit(&self, target: MessageRef, new_text: String) -> ConnectorFuture<'_, ()>;

    fn delete(&self, target: MessageRef) -> ConnectorFuture<'_, ()>;

    /// React to a message. An empty emoji removes an existing reaction.
    fn react(&self, target: MessageRef, emoji: String) -> ConnectorFuture<'_, ()>;

    fn list_chats(&self) -> ConnectorFuture<'_, Vec<ChatSummary>>;

    /// Tear the session down. Never fails; errors are only logged.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The account a session authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
    pub name: Option<String>,
}

impl SessionUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for SessionUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A message observed on the session, sent by anyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat: String,
    pub message: CachedMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is authenticated and usable.
    Open { user: SessionUser },
    /// The session ended. No further events follow.
    Closed { reason: DisconnectReason },
    Message(InboundMessage),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account was logged out remotely; credentials are gone.
    LoggedOut,
    /// Another client took over the session.
    ConnectionReplaced,
    TimedOut,
    ConnectionClosed,
    ConnectionLost,
    /// The remote side asked for a fresh connection.
    RestartRequired,
    /// Anything the daemon does not recognise.
    Other(String),
}

impl DisconnectReason {
    /// Classify a numeric status code reported by the remote side.
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 => DisconnectReason::TimedOut,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            503 => DisconnectReason::ConnectionLost,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(format!("status {other}")),
        }
    }

    /// Classify a textual reason such as `logged_out` or `connection_lost`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "logged_out" => DisconnectReason::LoggedOut,
            "connection_replaced" => DisconnectReason::ConnectionReplaced,
            "timed_out" => DisconnectReason::TimedOut,
            "connection_closed" => DisconnectReason::ConnectionClosed,
            "connection_lost" => DisconnectReason::ConnectionLost,
            "restart_required" => DisconnectReason::RestartRequired,
            _ => DisconnectReason::Other(label.to_string()),
        }
    }

    /// How a failed `connect()` attempt is treated. An explicit rejection is
    /// not something a retry fixes on its own, so it is left unclassified.
    pub fn from_connect_error(err: &ConnectorError) -> Self {
        match err {
            ConnectorError::Rejected(reason) => DisconnectReason::Other(reason.clone()),
            ConnectorError::Unavailable | ConnectorError::Io(_) | ConnectorError::Protocol(_) => {
                DisconnectReason::ConnectionLost
            }
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::ConnectionReplaced => write!(f, "connection replaced"),
            DisconnectReason::TimedOut => write!(f, "timed out"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::RestartRequired => write!(f, "restart required"),
            DisconnectReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub chat: String,
    pub text: String,
    /// Absolute path of an attachment.
    pub file: Option<PathBuf>,
    /// Message being replied to.
    pub reply_to: Option<String>,
}

/// Addresses an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub chat: String,
    pub id: String,
}

impl MessageRef {
    pub fn new(chat: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            chat: chat.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("messaging session is unavailable")]
    Unavailable,
    #[error("rejected by messaging service: {0}")]
    Rejected(String),
    #[error("messaging session I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("messaging protocol error: {0}")]
    Protocol(String),
}
