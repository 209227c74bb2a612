use crate::connector::DisconnectReason;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why the daemon is going down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A client sent `stop`.
    StopCommand,
    /// The session ended in a way that reconnecting cannot fix.
    Terminal(DisconnectReason),
    /// No client activity for the idle window.
    Idle,
    /// SIGINT or SIGTERM.
    Signal,
    /// Requested programmatically.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::StopCommand => write!(f, "stop command"),
            ShutdownReason::Terminal(reason) => write!(f, "session ended: {reason}"),
            ShutdownReason::Idle => write!(f, "idle timeout"),
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::Requested => write!(f, "requested"),
        }
    }
}

/// Shared shutdown trigger. The first reason recorded wins; every task
/// waiting on [`requested`](Self::requested) wakes up.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns false if shutdown was already requested.
    pub fn request(&self, reason: ShutdownReason) -> bool {
        let mut first = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            tracing::info!(%reason, "shutdown requested");
            *current = Some(reason);
            first = true;
            true
        });
        first
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }

    pub fn is_requested(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once shutdown has been requested, immediately if it already was.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// SIGINT and SIGTERM listeners. Signals that arrive after [`install`]
/// are held until [`forward`] hands them to a daemon.
///
/// [`install`]: Self::install
/// [`forward`]: Self::forward
#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Request a [`ShutdownReason::Signal`] shutdown on the first signal.
    pub async fn forward(mut self, shutdown: ShutdownHandle) {
        tokio::select! {
            _ = self.sigint.recv() => tracing::info!("received SIGINT"),
            _ = self.sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        shutdown.request(ShutdownReason::Signal);
    }
}
