mod output;

use anyhow::{Context, Result};
use chatline::client::{ClientConfig, ClientError, DaemonClient};
use chatline::paths::{StatePaths, default_state_dir};
use chatline::protocol::{Command, Response};
use chatline::transport::Endpoint;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "chatline", about = "Send and read messages through the chatline daemon")]
struct Cli {
    /// Print raw JSON responses instead of formatted text.
    #[arg(long, global = true)]
    json: bool,

    /// Daemon state directory (default: $CHATLINE_STATE_DIR or ~/.local/state/chatline).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Daemon endpoint: a socket path or tcp://127.0.0.1:PORT (default: $CHATLINE_SOCKET).
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// List conversations.
    Chats {
        /// Maximum number of chats to show.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show recent messages of a conversation.
    Read {
        /// Chat identifier.
        chat: String,
        /// Maximum number of messages to show.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Send a message.
    Send {
        /// Chat identifier.
        chat: String,
        /// Message text (the caption when attaching a file).
        message: String,
        /// Attach a file.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Reply to this message id.
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Replace the text of a message you sent.
    Edit {
        chat: String,
        message_id: String,
        new_text: String,
    },
    /// Delete a message for everyone.
    Delete { chat: String, message_id: String },
    /// React to a message. Omit the emoji to remove your reaction.
    React {
        chat: String,
        message_id: String,
        emoji: Option<String>,
    },
    /// Show daemon and session status.
    Status,
    /// Stop the daemon if it is running.
    Stop,
}

impl Action {
    fn into_command(self) -> Result<Command> {
        Ok(match self {
            Action::Chats { limit } => Command::Chats { limit },
            Action::Read { chat, limit } => Command::Read { chat, limit },
            Action::Send {
                chat,
                message,
                file,
                reply_to,
            } => Command::Send {
                chat,
                message,
                // The daemon resolves paths against its own working directory.
                file: file.map(absolute).transpose()?,
                reply_id: reply_to,
            },
            Action::Edit {
                chat,
                message_id,
                new_text,
            } => Command::Edit {
                chat,
                message_id,
                new_text,
            },
            Action::Delete { chat, message_id } => Command::Delete { chat, message_id },
            Action::React {
                chat,
                message_id,
                emoji,
            } => Command::React {
                chat,
                message_id,
                emoji: emoji.unwrap_or_default(),
            },
            Action::Status => Command::Status,
            Action::Stop => Command::Stop,
        })
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path).with_context(|| format!("invalid path {}", path.display()))
}

fn client_config(state_dir: Option<PathBuf>, socket: Option<String>) -> Result<ClientConfig> {
    let dir = match state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    let mut paths = StatePaths::new(dir);
    let socket = socket.or_else(|| std::env::var("CHATLINE_SOCKET").ok());
    if let Some(socket) = socket.filter(|s| !s.is_empty()) {
        let endpoint =
            Endpoint::parse(&socket).with_context(|| format!("invalid --socket value {socket:?}"))?;
        paths = paths.with_endpoint(endpoint);
    }
    Ok(ClientConfig::new(paths))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let client = DaemonClient::new(client_config(cli.state_dir, cli.socket)?);
    let command = cli.command.into_command()?;

    let resp = if command == Command::Stop {
        match client.execute_if_running(&command).await {
            Err(ClientError::NotRunning) => {
                println!("chatline daemon is not running.");
                return Ok(ExitCode::SUCCESS);
            }
            other => other?,
        }
    } else {
        client.execute(&command).await?
    };

    if print_response(command.action(), &resp, cli.json) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Print a response; returns false for error responses.
fn print_response(action: &str, resp: &Response, json: bool) -> bool {
    if let Some(message) = resp.error_message() {
        if json {
            println!("{}", output::pretty(resp));
        }
        eprintln!("error: {message}");
        return false;
    }
    if json {
        println!("{}", output::pretty(resp));
    } else {
        println!("{}", output::render(action, resp));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_file_is_made_absolute() {
        let cli =
            Cli::try_parse_from(["chatline", "send", "team", "hi", "--file", "notes.txt"]).unwrap();
        let Command::Send { file, .. } = cli.command.into_command().unwrap() else {
            panic!("expected send");
        };
        let file = file.unwrap();
        assert!(file.is_absolute());
        assert!(file.ends_with("notes.txt"));
    }

    #[test]
    fn react_without_emoji_removes_reaction() {
        let cli = Cli::try_parse_from(["chatline", "react", "team", "m1"]).unwrap();
        assert_eq!(
            cli.command.into_command().unwrap(),
            Command::React {
                chat: "team".into(),
                message_id: "m1".into(),
                emoji: String::new(),
            }
        );
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "chatline",
            "read",
            "team",
            "--limit",
            "5",
            "--json",
            "--state-dir",
            "/tmp/cl",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/cl")));
        let config = client_config(cli.state_dir, Some("tcp://127.0.0.1:9000".into())).unwrap();
        assert_eq!(config.paths.dir, PathBuf::from("/tmp/cl"));
        assert_eq!(config.paths.endpoint.to_string(), "tcp://127.0.0.1:9000");
    }

    #[test]
    fn error_response_fails() {
        let resp = Response::error("Unknown chat");
        assert!(!print_response("send", &resp, false));
        assert!(print_response("ping", &Response::ok(), false));
    }
}
