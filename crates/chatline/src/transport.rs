//! Local IPC transport.
//!
//! The daemon and its clients exchange newline-delimited JSON over whatever
//! stream this module hands them: a Unix domain socket on POSIX systems, or a
//! loopback TCP port where domain sockets are unavailable. Framing lives a
//! layer above, so both transports carry the identical protocol.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

#[cfg(unix)]
use tokio::net::UnixListener;

/// Read half of an IPC connection.
pub type IpcReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an IPC connection.
pub type IpcWriter = Box<dyn AsyncWrite + Send + Unpin>;

const TCP_PREFIX: &str = "tcp://";
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Address the daemon listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket file.
    Unix(PathBuf),
    /// Loopback-only TCP port.
    Tcp(SocketAddr),
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid tcp address {0:?}")]
    BadAddress(String),
    #[error("tcp endpoint {0} is not a loopback address")]
    NotLoopback(SocketAddr),
    #[error("empty endpoint")]
    Empty,
}

impl Endpoint {
    /// Parse `tcp://127.0.0.1:PORT` as a TCP endpoint; anything else is a
    /// socket path.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }
        match s.strip_prefix(TCP_PREFIX) {
            Some(addr) => {
                let addr: SocketAddr = addr
                    .parse()
                    .map_err(|_| EndpointError::BadAddress(addr.to_string()))?;
                if !addr.ip().is_loopback() {
                    return Err(EndpointError::NotLoopback(addr));
                }
                Ok(Endpoint::Tcp(addr))
            }
            None => Ok(Endpoint::Unix(PathBuf::from(s))),
        }
    }

    /// The socket special file backing this endpoint, if any.
    pub fn socket_file(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }

    /// Open a client connection.
    pub async fn connect(&self) -> io::Result<(IpcReader, IpcWriter)> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unix_unsupported()),
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }

    /// Whether something is currently accepting connections here.
    pub async fn accepts_connections(&self) -> bool {
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, self.connect()).await,
            Ok(Ok(_))
        )
    }

    /// Bind a listener, replacing any leftover socket file.
    ///
    /// Callers must have established that no live daemon owns the endpoint:
    /// the stale file is removed unconditionally. The socket file is
    /// restricted to the owning user.
    pub async fn bind(&self) -> io::Result<IpcListener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                use std::os::unix::fs::PermissionsExt;

                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                remove_socket_file(path)?;
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                Ok(IpcListener {
                    endpoint: self.clone(),
                    inner: ListenerKind::Unix(listener),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unix_unsupported()),
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                // Port 0 binds an ephemeral port; report the real one.
                let endpoint = Endpoint::Tcp(listener.local_addr()?);
                Ok(IpcListener {
                    endpoint,
                    inner: ListenerKind::Tcp(listener),
                })
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{TCP_PREFIX}{addr}"),
        }
    }
}

/// Remove a socket file, treating "already gone" as success.
pub fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn unix_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix domain sockets are not available on this platform; use tcp://127.0.0.1:PORT",
    )
}

enum ListenerKind {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound daemon endpoint yielding one read/write pair per client.
pub struct IpcListener {
    endpoint: Endpoint,
    inner: ListenerKind,
}

impl IpcListener {
    /// The endpoint actually bound (resolves TCP port 0).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&self) -> io::Result<(IpcReader, IpcWriter)> {
        match &self.inner {
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parse_distinguishes_tcp_and_paths() {
        assert_eq!(
            Endpoint::parse("/run/user/1000/chatline.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/user/1000/chatline.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:7000").unwrap(),
            Endpoint::Tcp("127.0.0.1:7000".parse().unwrap())
        );
        assert!(matches!(
            Endpoint::parse("tcp://10.0.0.5:7000"),
            Err(EndpointError::NotLoopback(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://nonsense"),
            Err(EndpointError::BadAddress(_))
        ));
        assert!(matches!(Endpoint::parse("  "), Err(EndpointError::Empty)));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for endpoint in [
            Endpoint::Unix(PathBuf::from("/tmp/x.sock")),
            Endpoint::Tcp("127.0.0.1:9".parse().unwrap()),
        ] {
            assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_bind_replaces_stale_file_and_restricts_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        std::fs::write(&path, "stale").unwrap();

        let endpoint = Endpoint::Unix(path.clone());
        let listener = endpoint.bind().await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let server = tokio::spawn(async move {
            let (mut r, mut w) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).await.unwrap();
            w.write_all(&buf).await.unwrap();
        });

        let (mut r, mut w) = endpoint.connect().await.unwrap();
        w.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_bind_reports_ephemeral_port() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let listener = endpoint.bind().await.unwrap();
        let bound = listener.endpoint().clone();
        match &bound {
            Endpoint::Tcp(addr) => assert_ne!(addr.port(), 0),
            other => panic!("expected tcp endpoint, got {other:?}"),
        }
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        assert!(bound.accepts_connections().await);
        accept.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_check_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("missing.sock"));
        assert!(!endpoint.accepts_connections().await);
    }
}
