use crate::liveness::{self, Liveness};
use crate::paths::{StatePaths, ensure_state_dir};
use crate::protocol::{Command, MAX_LINE_BYTES, Response};
use futures_util::{SinkExt, StreamExt};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// How long `ensure_running` waits for a freshly spawned daemon.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between readiness polls while the daemon starts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a single request waits for its response line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for talking to (and starting) the daemon.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub paths: StatePaths,
    /// Daemon executable spawned when none is running.
    pub daemon_bin: PathBuf,
    /// Extra arguments appended when spawning the daemon.
    pub daemon_args: Vec<OsString>,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            daemon_bin: find_daemon_binary(),
            daemon_args: Vec::new(),
            start_timeout: START_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Configuration from `$CHATLINE_STATE_DIR`, `$CHATLINE_SOCKET` and
    /// `$CHATLINE_DAEMON_BIN`.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(StatePaths::from_env()?))
    }
}

/// Locate the daemon binary: `$CHATLINE_DAEMON_BIN`, then next to this
/// executable, then `PATH`.
pub fn find_daemon_binary() -> PathBuf {
    if let Some(bin) = std::env::var_os("CHATLINE_DAEMON_BIN") {
        return PathBuf::from(bin);
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let candidate = dir.join(crate::DAEMON_BIN_NAME);
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(crate::DAEMON_BIN_NAME)
}

/// Failures seen by a CLI invocation talking to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon is not running")]
    NotRunning,
    #[error("failed to prepare state directory: {0:#}")]
    StateDir(anyhow::Error),
    #[error("failed to start daemon {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("daemon did not become ready within {timeout:?} (see {})", .log.display())]
    StartTimeout { timeout: Duration, log: PathBuf },
    #[error("failed to connect to daemon at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("no response from daemon within {0:?}")]
    Timeout(Duration),
    #[error("daemon closed the connection without responding")]
    Disconnected,
    #[error("socket framing error: {0}")]
    Frame(#[from] LinesCodecError),
    #[error("malformed response from daemon: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Client for the chatline daemon.
///
/// Every call opens its own connection, sends exactly one command, reads
/// exactly one response and closes the connection again.
pub struct DaemonClient {
    config: ClientConfig,
}

impl DaemonClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Inspect the liveness record without starting anything.
    pub async fn check(&self) -> Liveness {
        liveness::check(&self.config.paths).await
    }

    /// Make sure a daemon is up, spawning one if needed.
    pub async fn ensure_running(&self) -> Result<(), ClientError> {
        match self.check().await {
            Liveness::Running { .. } => return Ok(()),
            Liveness::Stale => tracing::debug!("stale daemon state found, starting a new daemon"),
            Liveness::Absent => tracing::debug!("no daemon running, starting one"),
        }

        let pid = self.spawn_daemon()?;
        tracing::debug!(pid, "spawned daemon, waiting for readiness");

        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            if self.is_responsive().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::StartTimeout {
                    timeout: self.config.start_timeout,
                    log: self.config.paths.log.clone(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Start the daemon if necessary, then run one command.
    pub async fn execute(&self, command: &Command) -> Result<Response, ClientError> {
        self.ensure_running().await?;
        self.request(command, self.config.request_timeout).await
    }

    /// Run one command against an already running daemon.
    pub async fn execute_if_running(&self, command: &Command) -> Result<Response, ClientError> {
        match self.check().await {
            Liveness::Running { .. } => self.request(command, self.config.request_timeout).await,
            Liveness::Stale | Liveness::Absent => Err(ClientError::NotRunning),
        }
    }

    async fn is_responsive(&self) -> bool {
        if let Some(socket) = self.config.paths.endpoint.socket_file()
            && !socket.exists()
        {
            return false;
        }
        matches!(
            self.request(&Command::Ping, self.config.poll_interval.max(Duration::from_millis(500)))
                .await,
            Ok(resp) if resp.is_ok()
        )
    }

    async fn request(&self, command: &Command, timeout: Duration) -> Result<Response, ClientError> {
        let endpoint = &self.config.paths.endpoint;
        let (r, w) = endpoint
            .connect()
            .await
            .map_err(|source| ClientError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        writer.send(serde_json::to_string(command)?).await?;

        let line = match tokio::time::timeout(timeout, reader.next()).await {
            Err(_) => return Err(ClientError::Timeout(timeout)),
            Ok(None) => return Err(ClientError::Disconnected),
            Ok(Some(line)) => line?,
        };
        Ok(serde_json::from_str(&line)?)
    }

    /// Spawn the daemon detached from this process, logging into the state dir.
    fn spawn_daemon(&self) -> Result<u32, ClientError> {
        let paths = &self.config.paths;
        ensure_state_dir(&paths.dir).map_err(ClientError::StateDir)?;

        let bin = &self.config.daemon_bin;
        let spawn_err = |source| ClientError::Spawn {
            bin: bin.clone(),
            source,
        };

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.log)
            .map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        let mut cmd = std::process::Command::new(bin);
        cmd.arg("--state-dir")
            .arg(&paths.dir)
            .arg("--socket")
            .arg(paths.endpoint.to_string())
            .args(&self.config.daemon_args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: the daemon must outlive the invoking shell's
            // job-control signals.
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        Ok(child.id())
    }
}
