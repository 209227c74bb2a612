use super::client::TestClient;
use anyhow::{Context, Result, bail};
use chatline::paths::StatePaths;
use chatline::protocol::ConnectionState;
use chatline::transport::Endpoint;
use chatline_daemon::connector::SessionUser;
use chatline_daemon::connector::memory::{self, MemoryRemote};
use chatline_daemon::handler::DaemonState;
use chatline_daemon::{Daemon, DaemonConfig, RunningDaemon, ShutdownReason, StartOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Config for test daemons: fast reconnects, no periodic flushes.
pub fn test_config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::new(StatePaths::new(dir));
    config.reconnect_delay = Duration::from_millis(50);
    config.flush_interval = Duration::from_secs(3600);
    config
}

/// Start a daemon in-process with a fresh memory connector.
pub async fn try_start(config: DaemonConfig) -> Result<(StartOutcome, MemoryRemote)> {
    try_start_with(config, |_| {}).await
}

/// Like [`try_start`], letting the caller prepare the remote before the
/// session task starts connecting.
pub async fn try_start_with(
    config: DaemonConfig,
    setup: impl FnOnce(&MemoryRemote),
) -> Result<(StartOutcome, MemoryRemote)> {
    super::init_tracing();
    let (connector, remote) = memory::pair();
    setup(&remote);
    let outcome = Daemon::start(config, Arc::new(connector)).await?;
    Ok((outcome, remote))
}

/// An in-process daemon whose messaging session is a [`MemoryRemote`].
pub struct TestDaemon {
    pub remote: MemoryRemote,
    daemon: RunningDaemon,
}

impl TestDaemon {
    /// Start a daemon whose session never opens unless the test opens it.
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        Self::start_with(config, |_| {}).await
    }

    /// Start a daemon whose session opens as `user` and wait until it is open.
    pub async fn start_open(config: DaemonConfig, user: SessionUser) -> Result<Self> {
        let daemon = Self::start_with(config, |remote| remote.auto_open(user)).await?;
        daemon
            .wait_for_state(ConnectionState::Open, Duration::from_secs(2))
            .await?;
        Ok(daemon)
    }

    pub async fn start_with(
        config: DaemonConfig,
        setup: impl FnOnce(&MemoryRemote),
    ) -> Result<Self> {
        match try_start_with(config, setup).await? {
            (StartOutcome::Started(daemon), remote) => {
                tracing::debug!(endpoint = %daemon.endpoint(), "test daemon started");
                Ok(Self { remote, daemon })
            }
            (StartOutcome::AlreadyRunning { pid }, _) => {
                bail!("a daemon is already running (pid {pid})")
            }
        }
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        self.daemon.state()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.daemon.endpoint()
    }

    pub fn paths(&self) -> &StatePaths {
        self.daemon.paths()
    }

    pub async fn client(&self) -> Result<TestClient> {
        TestClient::connect(self.endpoint()).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().session.state()
    }

    pub async fn wait_for_state(&self, want: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.state().session.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == want))
            .await
            .with_context(|| {
                format!("session did not reach {want}, still {}", self.connection_state())
            })?
            .context("connection manager went away")?;
        Ok(())
    }

    /// Wait for the daemon to shut down on its own.
    pub async fn wait(self, timeout: Duration) -> Result<ShutdownReason> {
        tokio::time::timeout(timeout, self.daemon.wait())
            .await
            .context("daemon did not shut down in time")
    }

    /// Request shutdown and wait for the cleanup to finish.
    pub async fn stop(self) -> ShutdownReason {
        self.daemon.shutdown();
        self.daemon.wait().await
    }
}
