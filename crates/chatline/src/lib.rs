pub mod client;
pub mod liveness;
pub mod paths;
pub mod protocol;
pub mod transport;

/// Name of the daemon binary the client library starts on demand.
pub const DAEMON_BIN_NAME: &str = "chatline-daemon";

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
