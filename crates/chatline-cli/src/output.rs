//! Human-readable rendering of daemon responses.

use chatline::protocol::{CachedMessage, ChatSummary, Response, StatusInfo};

/// Render the successful response to `action` for a terminal.
pub fn render(action: &str, resp: &Response) -> String {
    match action {
        "chats" => render_chats(&resp.field::<Vec<ChatSummary>>("chats").unwrap_or_default()),
        "read" => render_messages(
            &resp.field::<Vec<CachedMessage>>("messages").unwrap_or_default(),
            resp.field::<String>("note").as_deref(),
            chatline::now_ms(),
        ),
        "send" => match resp.field::<String>("id") {
            Some(id) => format!("Sent ({id})."),
            None => "Sent.".to_string(),
        },
        "edit" => "Edited.".to_string(),
        "delete" => "Deleted.".to_string(),
        "react" => "Reaction updated.".to_string(),
        "status" => match serde_json::to_value(resp)
            .ok()
            .and_then(|v| serde_json::from_value::<StatusInfo>(v).ok())
        {
            Some(status) => render_status(&status),
            None => pretty(resp),
        },
        "stop" => "Daemon stopping.".to_string(),
        _ => pretty(resp),
    }
}

pub fn pretty(resp: &Response) -> String {
    serde_json::to_string_pretty(resp).unwrap_or_else(|e| format!("<unprintable response: {e}>"))
}

fn render_chats(chats: &[ChatSummary]) -> String {
    if chats.is_empty() {
        return "No chats.".to_string();
    }
    let width = chats.iter().map(|c| c.id.len()).max().unwrap_or(0);
    chats
        .iter()
        .map(|c| format!("{:<width$}  {}", c.id, c.name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Messages arrive newest first; print them oldest first like a chat log.
fn render_messages(messages: &[CachedMessage], note: Option<&str>, now_ms: u64) -> String {
    if messages.is_empty() {
        return note.unwrap_or("No messages.").to_string();
    }
    messages
        .iter()
        .rev()
        .map(|m| {
            let who = if m.from_me {
                "me"
            } else {
                m.sender.as_deref().unwrap_or("?")
            };
            let media = if m.has_media { " [media]" } else { "" };
            format!(
                "[{}] {who}: {}{media}  ({})",
                format_age(now_ms.saturating_sub(m.timestamp)),
                m.text,
                m.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_status(status: &StatusInfo) -> String {
    let mut lines = vec![format!("state:        {}", status.state)];
    if let Some(user) = &status.user {
        lines.push(format!("user:         {user}"));
    }
    lines.push(format!("pid:          {}", status.pid));
    lines.push(format!("uptime:       {}", format_duration(status.uptime)));
    lines.push(format!("cached chats: {}", status.cached_chats));
    lines.join("\n")
}

fn format_age(ms: u64) -> String {
    let secs = ms / 1000;
    if secs < 60 {
        "just now".to_string()
    } else {
        format!("{} ago", format_duration(secs))
    }
}

fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
    }
}
