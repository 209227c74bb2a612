//! The liveness record: PID marker plus listening endpoint.
//!
//! A daemon counts as running only when the PID marker names a live process
//! *and* the endpoint accepts connections. Any other leftover combination is
//! stale and must be cleared before a new daemon binds.

use crate::paths::StatePaths;
use std::io;
use std::path::Path;

/// What the liveness record says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// A daemon with this pid is alive and accepting connections.
    Running { pid: u32 },
    /// Leftover PID marker and/or socket file with nobody behind them.
    Stale,
    /// No trace of a daemon.
    Absent,
}

/// Read the pid stored in a PID marker. Missing or unparsable files yield `None`.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Write this process's pid to the PID marker.
pub fn write_pid(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap check; the endpoint check decides.
    true
}

/// Inspect the liveness record.
pub async fn check(paths: &StatePaths) -> Liveness {
    let pid = read_pid(&paths.pid);
    if let Some(pid) = pid
        && pid_alive(pid)
        && paths.endpoint.accepts_connections().await
    {
        return Liveness::Running { pid };
    }
    let socket_left = paths.endpoint.socket_file().is_some_and(Path::exists);
    if paths.pid.exists() || socket_left {
        Liveness::Stale
    } else {
        Liveness::Absent
    }
}

/// Delete the PID marker and socket file. Missing files are not an error.
pub fn clear(paths: &StatePaths) -> io::Result<()> {
    match std::fs::remove_file(&paths.pid) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(socket) = paths.endpoint.socket_file() {
        crate::transport::remove_socket_file(socket)?;
    }
    Ok(())
}
