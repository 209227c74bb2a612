use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Maximum size of a JSON-lines frame on the IPC socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Every action the daemon dispatches, in wire spelling.
pub const ACTIONS: &[&str] = &[
    "ping", "status", "send", "edit", "delete", "react", "chats", "read", "stop",
];

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A request sent from a CLI invocation to the daemon.
///
/// On the wire this is a single JSON object tagged by `action`, with
/// camelCase parameter names: `{"action":"edit","chat":"..","messageId":"..","newText":".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    /// Liveness check; also reports whether the session is open.
    Ping,
    /// Daemon and session status.
    Status,
    /// Send a text message, optionally with an attachment or as a reply.
    Send {
        chat: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_id: Option<String>,
    },
    /// Replace the text of a previously sent message.
    Edit {
        chat: String,
        message_id: String,
        new_text: String,
    },
    /// Delete a message for everyone.
    Delete { chat: String, message_id: String },
    /// React to a message. An empty emoji removes the reaction.
    React {
        chat: String,
        message_id: String,
        #[serde(default)]
        emoji: String,
    },
    /// List conversations.
    Chats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    /// Recent messages of one conversation, served from the daemon's cache.
    Read {
        chat: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    /// Shut the daemon down after answering.
    Stop,
}

impl Command {
    /// Parse one line received on the socket.
    ///
    /// Distinguishes text that is not JSON at all from JSON naming an action
    /// outside the vocabulary, and from a known action with bad parameters.
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(|_| ProtocolError::InvalidJson)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let action = match value.get("action") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingAction),
            Some(Value::String(s)) => s.clone(),
            Some(other) => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        if !ACTIONS.contains(&action.as_str()) {
            return Err(ProtocolError::UnknownAction(action));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidCommand {
            action,
            reason: e.to_string(),
        })
    }

    /// Parse one raw frame read off the socket. Bytes that are not UTF-8
    /// cannot be JSON.
    pub fn parse_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidJson)?;
        Self::parse_line(line.trim_end_matches('\r'))
    }

    /// Wire name of this command's action.
    pub fn action(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Status => "status",
            Command::Send { .. } => "send",
            Command::Edit { .. } => "edit",
            Command::Delete { .. } => "delete",
            Command::React { .. } => "react",
            Command::Chats { .. } => "chats",
            Command::Read { .. } => "read",
            Command::Stop => "stop",
        }
    }

    /// Whether dispatching this command needs an open session.
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Command::Send { .. }
                | Command::Edit { .. }
                | Command::Delete { .. }
                | Command::React { .. }
                | Command::Chats { .. }
        )
    }
}

/// Why a received line could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Request must be a JSON object")]
    NotAnObject,
    #[error("Missing action")]
    MissingAction,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid {action} command: {reason}")]
    InvalidCommand { action: String, reason: String },
    #[error("Request too large")]
    TooLarge,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response from the daemon: `{"ok":true, ...}` or `{"error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error {
        error: String,
    },
    Ok {
        ok: bool,
        #[serde(flatten)]
        data: Map<String, Value>,
    },
}

impl Response {
    /// Success with no result fields.
    pub fn ok() -> Self {
        Response::Ok {
            ok: true,
            data: Map::new(),
        }
    }

    /// Success carrying the fields of `data`. A non-object value is placed
    /// under `result`.
    pub fn ok_with(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Response::Ok { ok: true, data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { ok: true, .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Error { error } => Some(error),
            Response::Ok { .. } => None,
        }
    }

    /// Look up a result field of a successful response.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Response::Ok { data, .. } => data.get(key),
            Response::Error { .. } => None,
        }
    }

    /// Deserialize a result field of a successful response.
    pub fn field<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::error(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// Lifecycle state of the daemon's external session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// A conversation returned by `chats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
}

/// A message held in the daemon's recent-message cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    pub id: String,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub has_media: bool,
}

/// Fields of a `status` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub connected: bool,
    pub state: ConnectionState,
    pub user: Option<String>,
    /// Seconds since the daemon started.
    pub uptime: u64,
    pub pid: u32,
    pub cached_chats: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_wire_names_are_camel_case() {
        let cmd = Command::Edit {
            chat: "team".into(),
            message_id: "m1".into(),
            new_text: "fixed".into(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({"action": "edit", "chat": "team", "messageId": "m1", "newText": "fixed"})
        );
    }

    #[test]
    fn send_optional_fields_are_omitted() {
        let cmd = Command::Send {
            chat: "team".into(),
            message: "hi".into(),
            file: None,
            reply_id: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("file"));
        assert!(!json.contains("replyId"));

        let parsed = Command::parse_line(
            r#"{"action":"send","chat":"team","message":"hi","replyId":"m9"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Command::Send {
                chat: "team".into(),
                message: "hi".into(),
                file: None,
                reply_id: Some("m9".into()),
            }
        );
    }

    #[test]
    fn frame_with_invalid_utf8_is_invalid_json() {
        assert_eq!(
            Command::parse_frame(b"{\"action\":\"p\xffng\"}"),
            Err(ProtocolError::InvalidJson)
        );
        assert_eq!(
            Command::parse_frame(b"{\"action\":\"ping\"}\r"),
            Ok(Command::Ping)
        );
    }

    #[test]
    fn parse_rejects_garbage_as_invalid_json() {
        assert_eq!(
            Command::parse_line("{not json"),
            Err(ProtocolError::InvalidJson)
        );
        assert_eq!(
            Response::from(ProtocolError::InvalidJson),
            Response::error("Invalid JSON")
        );
    }

    #[test]
    fn parse_reports_unknown_action_by_name() {
        let err = Command::parse_line(r#"{"action":"teleport"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownAction("teleport".into()));
        assert_eq!(err.to_string(), "Unknown action: teleport");
    }

    #[test]
    fn parse_reports_missing_fields_for_known_action() {
        let err = Command::parse_line(r#"{"action":"edit","chat":"team"}"#).unwrap_err();
        match err {
            ProtocolError::InvalidCommand { action, reason } => {
                assert_eq!(action, "edit");
                assert!(reason.contains("messageId"), "reason was: {reason}");
            }
            other => panic!("expected InvalidCommand, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_non_object_and_missing_action() {
        assert_eq!(Command::parse_line("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            Command::parse_line(r#"{"chat":"x"}"#),
            Err(ProtocolError::MissingAction)
        );
    }

    #[test]
    fn react_emoji_defaults_to_empty() {
        let cmd = Command::parse_line(r#"{"action":"react","chat":"c","messageId":"m"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::React {
                chat: "c".into(),
                message_id: "m".into(),
                emoji: String::new(),
            }
        );
    }

    #[test]
    fn ok_response_flattens_fields() {
        let resp = Response::ok_with(json!({"connected": true}));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"ok": true, "connected": true})
        );
        assert_eq!(serde_json::to_string(&Response::ok()).unwrap(), r#"{"ok":true}"#);
    }

    #[test]
    fn response_decodes_both_shapes() {
        let ok: Response = serde_json::from_str(r#"{"ok":true,"id":"abc"}"#).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.field::<String>("id").as_deref(), Some("abc"));

        let err: Response = serde_json::from_str(r#"{"error":"Not connected"}"#).unwrap();
        assert!(!err.is_ok());
        assert_eq!(err.error_message(), Some("Not connected"));
        assert!(err.get("id").is_none());
    }

    #[test]
    fn requires_session_matches_session_actions() {
        assert!(!Command::Ping.requires_session());
        assert!(!Command::Stop.requires_session());
        assert!(
            !Command::Read {
                chat: "c".into(),
                limit: None
            }
            .requires_session()
        );
        assert!(Command::Chats { limit: None }.requires_session());
    }

    #[test]
    fn action_names_cover_vocabulary() {
        let commands = [
            Command::Ping,
            Command::Status,
            Command::Chats { limit: None },
            Command::Stop,
        ];
        for cmd in &commands {
            assert!(ACTIONS.contains(&cmd.action()));
            let json = serde_json::to_value(cmd).unwrap();
            assert_eq!(json["action"], cmd.action());
        }
    }
}
