use crate::transport::Endpoint;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_STATE_DIR: &str = ".local/state/chatline";

pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const CACHE_FILE: &str = "cache.json";
pub const LOG_FILE: &str = "daemon.log";

/// Return the chatline state directory path.
///
/// Priority: `$CHATLINE_STATE_DIR` env var, then `~/.local/state/chatline`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("CHATLINE_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Ensure the state directory exists with `0700` permissions.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create state dir {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set state dir permissions {}", path.display()))?;
    }
    Ok(())
}

/// Well-known locations of everything the daemon keeps on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    /// Where the daemon listens. A Unix socket inside `dir` unless overridden.
    pub endpoint: Endpoint,
    pub pid: PathBuf,
    pub cache: PathBuf,
    pub log: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            endpoint: Endpoint::Unix(dir.join(SOCKET_FILE)),
            pid: dir.join(PID_FILE),
            cache: dir.join(CACHE_FILE),
            log: dir.join(LOG_FILE),
            dir,
        }
    }

    /// Resolve paths from `$CHATLINE_STATE_DIR` and `$CHATLINE_SOCKET`.
    pub fn from_env() -> Result<Self> {
        let paths = Self::new(default_state_dir()?);
        match std::env::var("CHATLINE_SOCKET") {
            Ok(socket) if !socket.is_empty() => {
                let endpoint = Endpoint::parse(&socket)
                    .with_context(|| format!("invalid CHATLINE_SOCKET value {socket:?}"))?;
                Ok(paths.with_endpoint(endpoint))
            }
            _ => Ok(paths),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("sub/state");
        ensure_state_dir(&state).unwrap();
        assert!(state.exists());
    }

    #[cfg(unix)]
    #[test]
    fn state_dir_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("perms");
        ensure_state_dir(&state).unwrap();
        let meta = std::fs::metadata(&state).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn files_live_in_state_dir() {
        let paths = StatePaths::new("/tmp/chatline-x");
        assert_eq!(paths.pid, PathBuf::from("/tmp/chatline-x/daemon.pid"));
        assert_eq!(paths.cache, PathBuf::from("/tmp/chatline-x/cache.json"));
        assert_eq!(
            paths.endpoint,
            Endpoint::Unix(PathBuf::from("/tmp/chatline-x/daemon.sock"))
        );
    }
}
