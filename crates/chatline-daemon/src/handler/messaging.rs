use super::{DaemonState, DispatchError};
use crate::cache::EMPTY_NOTE;
use crate::connector::{MessageRef, OutgoingMessage};
use chatline::protocol::{CachedMessage, ChatSummary, Response};
use serde_json::json;
use std::path::PathBuf;

pub const DEFAULT_CHATS_LIMIT: usize = 50;
pub const DEFAULT_READ_LIMIT: usize = 20;

pub async fn handle_send(
    state: &DaemonState,
    chat: String,
    text: String,
    file: Option<PathBuf>,
    reply_to: Option<String>,
) -> Result<Response, DispatchError> {
    if let Some(path) = &file
        && !path.is_file()
    {
        return Err(DispatchError::FileNotFound(path.clone()));
    }
    let has_media = file.is_some();
    let id = state
        .session
        .send(OutgoingMessage {
            chat: chat.clone(),
            text: text.clone(),
            file,
            reply_to,
        })
        .await?;
    tracing::info!(%chat, %id, "message sent");

    state.cache.lock().await.record(
        &chat,
        CachedMessage {
            id: id.clone(),
            from_me: true,
            sender: None,
            timestamp: chatline::now_ms(),
            text,
            has_media,
        },
    );
    Ok(Response::ok_with(json!({ "id": id })))
}

pub async fn handle_edit(
    state: &DaemonState,
    chat: String,
    message_id: String,
    new_text: String,
) -> Result<Response, DispatchError> {
    state
        .session
        .edit(MessageRef::new(&chat, &message_id), new_text.clone())
        .await?;
    state
        .cache
        .lock()
        .await
        .apply_edit(&chat, &message_id, &new_text);
    Ok(Response::ok())
}

pub async fn handle_delete(
    state: &DaemonState,
    chat: String,
    message_id: String,
) -> Result<Response, DispatchError> {
    state
        .session
        .delete(MessageRef::new(&chat, &message_id))
        .await?;
    state.cache.lock().await.remove(&chat, &message_id);
    Ok(Response::ok())
}

pub async fn handle_react(
    state: &DaemonState,
    chat: String,
    message_id: String,
    emoji: String,
) -> Result<Response, DispatchError> {
    state
        .session
        .react(MessageRef::new(chat, message_id), emoji)
        .await?;
    Ok(Response::ok())
}

/// Conversations known to the session, followed by any chat only the cache
/// has seen.
pub async fn handle_chats(
    state: &DaemonState,
    limit: Option<usize>,
) -> Result<Response, DispatchError> {
    let limit = limit.unwrap_or(DEFAULT_CHATS_LIMIT);
    let mut chats = state.session.list_chats().await?;
    for id in state.cache.lock().await.known_chats() {
        if !chats.iter().any(|c| c.id == id) {
            chats.push(ChatSummary {
                name: id.clone(),
                id,
            });
        }
    }
    chats.truncate(limit);
    Ok(Response::ok_with(json!({ "chats": chats })))
}

/// Served from the cache alone, so it works while disconnected.
pub async fn handle_read(
    state: &DaemonState,
    chat: &str,
    limit: Option<usize>,
) -> Result<Response, DispatchError> {
    let limit = limit.unwrap_or(DEFAULT_READ_LIMIT);
    let cache = state.cache.lock().await;
    let messages = cache.read(chat, limit);
    if !cache.has_messages(chat) {
        return Ok(Response::ok_with(
            json!({ "messages": messages, "note": EMPTY_NOTE }),
        ));
    }
    Ok(Response::ok_with(json!({ "messages": messages })))
}
