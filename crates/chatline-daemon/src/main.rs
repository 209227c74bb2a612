use anyhow::{Context, Result};
use chatline::paths::{StatePaths, default_state_dir};
use chatline::transport::Endpoint;
use chatline_daemon::connector::BridgeConnector;
use chatline_daemon::connector::bridge::parse_bridge_addr;
#[cfg(unix)]
use chatline_daemon::ShutdownSignals;
use chatline_daemon::{Daemon, DaemonConfig, StartOutcome};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BRIDGE: &str = "127.0.0.1:7720";

#[derive(Parser, Debug)]
#[command(author, version, about = "chatline messaging session daemon")]
struct Args {
    /// State directory for the socket, PID marker and message cache
    /// (default: $CHATLINE_STATE_DIR or ~/.local/state/chatline).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Listening endpoint: a socket path or tcp://127.0.0.1:PORT
    /// (default: $CHATLINE_SOCKET or daemon.sock in the state directory).
    #[arg(long)]
    socket: Option<String>,

    /// Messaging bridge address: HOST:PORT, tcp://HOST:PORT or a socket path
    /// (default: $CHATLINE_BRIDGE or 127.0.0.1:7720).
    #[arg(long)]
    bridge: Option<String>,

    /// Exit after this many seconds without client commands.
    #[arg(long, default_value_t = 30 * 60)]
    idle_timeout_secs: u64,

    /// Wait before reconnecting after a transient disconnect.
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// How often the message cache is written to disk.
    #[arg(long, default_value_t = 30)]
    flush_interval_secs: u64,

    /// Reconnect after disconnects that cannot be classified instead of exiting.
    #[arg(long)]
    retry_unclassified: bool,
}

impl Args {
    fn into_config(self) -> Result<(DaemonConfig, Endpoint)> {
        let state_dir = match self.state_dir {
            Some(dir) => dir,
            None => default_state_dir()?,
        };
        let mut paths = StatePaths::new(state_dir);
        let socket = self.socket.or_else(|| std::env::var("CHATLINE_SOCKET").ok());
        if let Some(socket) = socket.filter(|s| !s.is_empty()) {
            let endpoint = Endpoint::parse(&socket)
                .with_context(|| format!("invalid --socket value {socket:?}"))?;
            paths = paths.with_endpoint(endpoint);
        }
        let bridge = self
            .bridge
            .or_else(|| std::env::var("CHATLINE_BRIDGE").ok())
            .unwrap_or_else(|| DEFAULT_BRIDGE.to_string());
        let bridge = parse_bridge_addr(&bridge)
            .with_context(|| format!("invalid bridge address {bridge:?}"))?;

        let mut config = DaemonConfig::new(paths);
        config.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        config.reconnect_delay = Duration::from_secs(self.reconnect_delay_secs);
        config.flush_interval = Duration::from_secs(self.flush_interval_secs.max(1));
        config.retry_unclassified = self.retry_unclassified;
        Ok((config, bridge))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline_daemon=info".into()),
        )
        .init();

    let (config, bridge) = Args::parse().into_config()?;
    let connector = Arc::new(BridgeConnector::new(bridge));

    #[cfg(unix)]
    let signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    let daemon = match Daemon::start(config, connector).await? {
        StartOutcome::AlreadyRunning { pid } => {
            println!("chatline daemon already running (pid {pid})");
            return Ok(());
        }
        StartOutcome::Started(daemon) => daemon,
    };

    #[cfg(unix)]
    tokio::spawn(signals.forward(daemon.shutdown_handle()));
    #[cfg(not(unix))]
    tokio::spawn(forward_ctrl_c(daemon.shutdown_handle()));

    let reason = daemon.wait().await;
    tracing::info!(%reason, "exiting");
    Ok(())
}

#[cfg(not(unix))]
async fn forward_ctrl_c(shutdown: chatline_daemon::ShutdownHandle) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
    shutdown.request(chatline_daemon::ShutdownReason::Signal);
}
