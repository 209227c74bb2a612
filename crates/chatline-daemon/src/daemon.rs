//! Daemon process lifecycle: single-instance start, background tasks and
//! the cleanup that runs on every way out.

use crate::cache::MessageCache;
use crate::config::DaemonConfig;
use crate::connector::SessionConnector;
use crate::handler::DaemonState;
use crate::shutdown::{ShutdownHandle, ShutdownReason};
use crate::socket;
use anyhow::{Context, Result};
use chatline::liveness::{self, Liveness};
use chatline::paths::{StatePaths, ensure_state_dir};
use chatline::transport::Endpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// How long shutdown waits for each background task before abandoning it.
const TASK_GRACE: Duration = Duration::from_secs(5);

pub enum StartOutcome {
    /// A live daemon already owns the state directory.
    AlreadyRunning { pid: u32 },
    Started(RunningDaemon),
}

pub struct Daemon;

impl Daemon {
    /// Start a daemon unless a live one already exists.
    ///
    /// Stale liveness files from a crashed daemon are removed first. On
    /// success the endpoint is bound, the PID marker written and every
    /// background task running.
    pub async fn start(
        mut config: DaemonConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<StartOutcome> {
        let paths = config.paths.clone();
        ensure_state_dir(&paths.dir)?;

        match liveness::check(&paths).await {
            Liveness::Running { pid } => {
                tracing::info!(pid, "daemon already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            Liveness::Stale => {
                tracing::warn!(dir = %paths.dir.display(), "removing stale daemon state");
                liveness::clear(&paths).context("failed to clear stale daemon state")?;
            }
            Liveness::Absent => {}
        }

        let listener = paths
            .endpoint
            .bind()
            .await
            .with_context(|| format!("failed to bind {}", paths.endpoint))?;
        config.paths.endpoint = listener.endpoint().clone();
        let guard = LivenessGuard {
            paths: config.paths.clone(),
        };
        liveness::write_pid(&paths.pid)
            .with_context(|| format!("failed to write {}", paths.pid.display()))?;

        let cache = MessageCache::load(&paths.cache, config.cache_capacity);
        let state = DaemonState::new(config, connector, cache);
        let tasks = spawn_tasks(&state, listener);

        tracing::info!(
            pid = state.pid,
            endpoint = %state.config.paths.endpoint,
            "chatline daemon started"
        );
        Ok(StartOutcome::Started(RunningDaemon {
            state,
            tasks,
            _guard: guard,
        }))
    }
}

struct Tasks {
    session: JoinHandle<()>,
    server: JoinHandle<()>,
    idle: JoinHandle<()>,
    ingest: JoinHandle<()>,
    flush: JoinHandle<()>,
}

fn spawn_tasks(state: &Arc<DaemonState>, listener: chatline::transport::IpcListener) -> Tasks {
    // Subscribe before the session starts so no early message is missed.
    let mut messages = state.session.subscribe_messages();

    let session = {
        let state = state.clone();
        tokio::spawn(async move {
            if let Some(reason) = state.session.run(state.shutdown.clone()).await {
                state.shutdown.request(ShutdownReason::Terminal(reason));
            }
        })
    };

    let server = {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = socket::serve(state.clone(), listener).await {
                tracing::error!(err = %e, "IPC server failed");
                state.shutdown.request(ShutdownReason::Requested);
            }
        })
    };

    let idle = {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = state.idle.expired() => {
                    tracing::info!(
                        window_secs = state.idle.window().as_secs(),
                        "no client activity, shutting down"
                    );
                    state.shutdown.request(ShutdownReason::Idle);
                }
                _ = state.shutdown.requested() => {}
            }
        })
    };

    let ingest = {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = state.shutdown.requested() => break,
                    received = messages.recv() => received,
                };
                match received {
                    Ok(inbound) => {
                        state
                            .cache
                            .lock()
                            .await
                            .record(&inbound.chat, inbound.message);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "message cache fell behind, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let flush = {
        let state = state.clone();
        tokio::spawn(async move {
            let period = state.config.flush_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = state.shutdown.requested() => break,
                    _ = ticker.tick() => flush_cache(&state).await,
                }
            }
        })
    };

    Tasks {
        session,
        server,
        idle,
        ingest,
        flush,
    }
}

async fn flush_cache(state: &DaemonState) {
    let path = &state.config.paths.cache;
    if let Err(e) = state.cache.lock().await.flush(path) {
        tracing::warn!(path = %path.display(), err = %e, "failed to write message cache");
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    let abort = task.abort_handle();
    match tokio::time::timeout(TASK_GRACE, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(task = name, err = %e, "task ended abnormally"),
        Err(_) => {
            tracing::warn!(task = name, "task did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// A started daemon. Dropping it without [`wait`](Self::wait) still removes
/// the liveness files.
pub struct RunningDaemon {
    state: Arc<DaemonState>,
    tasks: Tasks,
    _guard: LivenessGuard,
}

impl RunningDaemon {
    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// The endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.state.config.paths.endpoint
    }

    pub fn paths(&self) -> &StatePaths {
        &self.state.config.paths
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.state.shutdown.clone()
    }

    /// Ask the daemon to stop; [`wait`](Self::wait) then performs the cleanup.
    pub fn shutdown(&self) {
        self.state.shutdown.request(ShutdownReason::Requested);
    }

    /// Run until shutdown is requested, then clean up: close the session,
    /// stop the listener, flush the cache and remove the liveness files.
    pub async fn wait(self) -> ShutdownReason {
        self.state.shutdown.requested().await;
        let reason = self
            .state
            .shutdown
            .reason()
            .unwrap_or(ShutdownReason::Requested);
        tracing::info!(%reason, "chatline daemon shutting down");

        let Tasks {
            session,
            server,
            idle,
            ingest,
            flush,
        } = self.tasks;
        join("session", session).await;
        if let ShutdownReason::Terminal(_) = reason {
            // The manager returned on its own and left the connector as is.
            self.state.session.close().await;
        }
        join("server", server).await;
        join("idle", idle).await;
        join("ingest", ingest).await;
        join("flush", flush).await;

        flush_cache(&self.state).await;
        tracing::info!("chatline daemon stopped");
        reason
        // `_guard` drops here and removes the PID marker and socket file.
    }
}

/// Removes the PID marker and socket file when dropped.
struct LivenessGuard {
    paths: StatePaths,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if let Err(e) = liveness::clear(&self.paths) {
            tracing::warn!(err = %e, "failed to remove daemon liveness files");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SessionUser;
    use crate::connector::memory::{self, MemoryRemote};

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        let mut config = DaemonConfig::new(StatePaths::new(dir));
        config.reconnect_delay = Duration::from_millis(20);
        config
    }

    async fn start(config: DaemonConfig) -> (RunningDaemon, MemoryRemote) {
        let (connector, remote) = memory::pair();
        remote.auto_open(SessionUser::new("me"));
        match Daemon::start(config, Arc::new(connector)).await.unwrap() {
            StartOutcome::Started(daemon) => (daemon, remote),
            StartOutcome::AlreadyRunning { pid } => panic!("unexpected daemon {pid}"),
        }
    }

    #[tokio::test]
    async fn start_writes_liveness_and_wait_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, remote) = start(test_config(dir.path())).await;
        let paths = daemon.paths().clone();
        assert_eq!(liveness::read_pid(&paths.pid), Some(std::process::id()));
        assert!(paths.endpoint.socket_file().unwrap().exists());

        assert!(remote.wait_for_connects(1, Duration::from_secs(2)).await);
        daemon.shutdown();
        assert_eq!(daemon.wait().await, ShutdownReason::Requested);
        assert!(!paths.pid.exists());
        assert!(!paths.endpoint.socket_file().unwrap().exists());
        assert_eq!(remote.disconnects(), 1);
    }

    #[tokio::test]
    async fn second_start_reports_running_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _remote) = start(test_config(dir.path())).await;

        let (connector, remote) = memory::pair();
        let outcome = Daemon::start(test_config(dir.path()), Arc::new(connector))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::AlreadyRunning { pid } if pid == std::process::id()
        ));
        assert_eq!(remote.connects(), 0);

        daemon.shutdown();
        daemon.wait().await;
    }

    #[tokio::test]
    async fn dropping_running_daemon_removes_liveness_files() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, _remote) = start(test_config(dir.path())).await;
        let paths = daemon.paths().clone();
        daemon.shutdown();
        drop(daemon);
        assert!(!paths.pid.exists());
    }

    #[tokio::test]
    async fn cache_is_flushed_on_shutdown_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, remote) = start(test_config(dir.path())).await;
        assert!(remote.wait_for_connects(1, Duration::from_secs(2)).await);
        let mut state_rx = daemon.state().session.subscribe_state();
        state_rx
            .wait_for(|s| *s == chatline::protocol::ConnectionState::Open)
            .await
            .unwrap();

        let message = chatline::protocol::CachedMessage {
            id: "m1".into(),
            from_me: false,
            sender: None,
            timestamp: 1,
            text: "persist me".into(),
            has_media: false,
        };
        assert!(remote.deliver("team", message.clone()).await);
        let state = daemon.state().clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.cache.lock().await.read("team", 1).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(state);

        daemon.shutdown();
        daemon.wait().await;
        let cache_path = dir.path().join(chatline::paths::CACHE_FILE);
        assert!(cache_path.exists());

        let (daemon, _remote) = start(test_config(dir.path())).await;
        assert_eq!(
            daemon.state().cache.lock().await.read("team", 5),
            vec![message]
        );
        daemon.shutdown();
        daemon.wait().await;
    }
}
