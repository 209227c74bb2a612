pub mod messaging;

use crate::cache::MessageCache;
use crate::config::DaemonConfig;
use crate::connection::{ConnectionManager, SessionError};
use crate::connector::SessionConnector;
use crate::idle::IdleSupervisor;
use crate::shutdown::ShutdownHandle;
use chatline::protocol::{Command, Response, StatusInfo};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Shared daemon state accessible by all client connections.
pub struct DaemonState {
    pub config: DaemonConfig,
    pub session: ConnectionManager,
    pub cache: Mutex<MessageCache>,
    pub idle: IdleSupervisor,
    pub shutdown: ShutdownHandle,
    pub started_at: Instant,
    pub pid: u32,
}

impl DaemonState {
    pub fn new(
        config: DaemonConfig,
        connector: Arc<dyn SessionConnector>,
        cache: MessageCache,
    ) -> Arc<Self> {
        let session = ConnectionManager::new(
            connector,
            config.disconnect_policy(),
            config.reconnect_delay,
        );
        Arc::new(Self {
            idle: IdleSupervisor::new(config.idle_timeout),
            session,
            cache: Mutex::new(cache),
            shutdown: ShutdownHandle::new(),
            started_at: Instant::now(),
            pid: std::process::id(),
            config,
        })
    }

    pub async fn status(&self) -> StatusInfo {
        StatusInfo {
            connected: self.session.is_open(),
            state: self.session.state(),
            user: self.session.user().map(|u| u.to_string()),
            uptime: self.started_at.elapsed().as_secs(),
            pid: self.pid,
            cached_chats: self.cache.lock().await.chat_count(),
        }
    }
}

/// Why a command could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Dispatch one command. Failures become `{"error": ...}` responses.
pub async fn handle_command(state: &DaemonState, cmd: Command) -> Response {
    let action = cmd.action();
    let result = match cmd {
        Command::Ping => Ok(handle_ping(state)),
        Command::Status => handle_status(state).await,
        Command::Send {
            chat,
            message,
            file,
            reply_id,
        } => messaging::handle_send(state, chat, message, file, reply_id).await,
        Command::Edit {
            chat,
            message_id,
            new_text,
        } => messaging::handle_edit(state, chat, message_id, new_text).await,
        Command::Delete { chat, message_id } => {
            messaging::handle_delete(state, chat, message_id).await
        }
        Command::React {
            chat,
            message_id,
            emoji,
        } => messaging::handle_react(state, chat, message_id, emoji).await,
        Command::Chats { limit } => messaging::handle_chats(state, limit).await,
        Command::Read { chat, limit } => messaging::handle_read(state, &chat, limit).await,
        Command::Stop => Ok(Response::ok()),
    };
    result.unwrap_or_else(|e| {
        tracing::warn!(action, err = %e, "command failed");
        Response::error(e.to_string())
    })
}

fn handle_ping(state: &DaemonState) -> Response {
    Response::ok_with(serde_json::json!({ "connected": state.session.is_open() }))
}

async fn handle_status(state: &DaemonState) -> Result<Response, DispatchError> {
    ok_response(&state.status().await)
}

/// Success response carrying the fields of `data`.
pub fn ok_response<T: Serialize>(data: &T) -> Result<Response, DispatchError> {
    Ok(Response::ok_with(serde_json::to_value(data)?))
}
