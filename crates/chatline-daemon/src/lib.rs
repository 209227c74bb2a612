//! The chatline daemon: owns one long-lived messaging session and serves
//! short-lived CLI clients over a local socket.

pub mod cache;
pub mod config;
pub mod connection;
pub mod connector;
pub mod daemon;
pub mod handler;
pub mod idle;
pub mod shutdown;
pub mod socket;

pub use config::DaemonConfig;
pub use daemon::{Daemon, RunningDaemon, StartOutcome};
pub use shutdown::{ShutdownHandle, ShutdownReason};
#[cfg(unix)]
pub use shutdown::ShutdownSignals;
