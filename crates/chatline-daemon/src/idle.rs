use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default window without client activity before the daemon exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Tracks client activity. [`expired`](Self::expired) resolves once no
/// command has been seen for the whole idle window.
pub struct IdleSupervisor {
    window: Duration,
    last_activity: watch::Sender<Instant>,
}

impl IdleSupervisor {
    pub fn new(window: Duration) -> Self {
        let (last_activity, _) = watch::channel(Instant::now());
        Self {
            window,
            last_activity,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record activity, pushing the deadline out by a full window.
    pub fn touch(&self) {
        self.last_activity.send_replace(Instant::now());
    }

    fn deadline(&self) -> Instant {
        *self.last_activity.borrow() + self.window
    }

    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            tokio::time::sleep_until(deadline).await;
            // A touch while sleeping moved the deadline.
            if self.deadline() <= Instant::now() {
                return;
            }
        }
    }
}
