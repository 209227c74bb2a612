use crate::cache::DEFAULT_CAPACITY;
use crate::connection::{DEFAULT_RECONNECT_DELAY, DisconnectPolicy};
use crate::idle::DEFAULT_IDLE_TIMEOUT;
use chatline::paths::StatePaths;
use std::time::Duration;

/// How often a changed message cache is written to disk.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a daemon instance needs to know at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// State directory, listening endpoint, PID marker and snapshot locations.
    pub paths: StatePaths,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub flush_interval: Duration,
    /// Reconnect after disconnects the daemon cannot classify.
    pub retry_unclassified: bool,
    /// Messages kept per conversation.
    pub cache_capacity: usize,
}

impl DaemonConfig {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_unclassified: false,
            cache_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn disconnect_policy(&self) -> DisconnectPolicy {
        DisconnectPolicy {
            retry_unclassified: self.retry_unclassified,
        }
    }
}
