use std::fmt;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where a castrpc peer listens.
///
/// Parsed from `tcp://host:port`, `unix:///path/to.sock`, or a bare
/// filesystem path (taken as a Unix domain socket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason| TransportError::InvalidEndpoint {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("endpoint is empty"));
        }

        if let Some(addr) = trimmed.strip_prefix("tcp://") {
            if addr.rsplit_once(':').is_none_or(|(host, port)| host.is_empty() || port.is_empty()) {
                return Err(invalid("tcp endpoint needs host:port"));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }

        if let Some(path) = trimmed.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid("unix endpoint needs a socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if trimmed.contains("://") {
            return Err(invalid("unsupported scheme (use tcp:// or unix://)"));
        }

        Ok(Self::Unix(PathBuf::from(trimmed)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl Endpoint {
    /// Open a connection to a listening peer.
    pub async fn connect(&self) -> Result<Connection> {
        match self {
            Self::Tcp(addr) => {
                let stream =
                    TcpStream::connect(addr.as_str())
                        .await
                        .map_err(|source| TransportError::Connect {
                            endpoint: self.to_string(),
                            source,
                        })?;
                stream.set_nodelay(true)?;
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| addr.clone());
                debug!(%peer, "connected over tcp");
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(Box::new(reader), Box::new(writer), peer))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|source| {
                    TransportError::Connect {
                        endpoint: self.to_string(),
                        source,
                    }
                })?;
                debug!(?path, "connected to unix domain socket");
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(
                    Box::new(reader),
                    Box::new(writer),
                    self.to_string(),
                ))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::Connect {
                endpoint: self.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }
}

/// A connected duplex byte stream, split into halves.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer: String,
}

impl Connection {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Build a connection from any single duplex stream (e.g. `tokio::io::duplex`).
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer), peer)
    }

    /// Human-readable description of the remote side.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Accepts incoming connections on an [`Endpoint`].
pub struct Listener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocketFile),
}

impl Listener {
    /// Bind and listen.
    ///
    /// For TCP, port 0 picks a free port; [`Listener::endpoint`] reports the
    /// bound address. For Unix sockets, a stale socket file at the path is
    /// replaced, but any other kind of file is left alone and binding fails.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|source| {
                    TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                let local = listener.local_addr()?;
                info!(%local, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint: Endpoint::Tcp(local.to_string()),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self {
                inner: ListenerInner::Unix(UnixSocketFile::bind(path.clone())?),
                endpoint: endpoint.clone(),
            }),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Connection> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                stream.set_nodelay(true)?;
                debug!(peer = %addr, "accepted tcp connection");
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(
                    Box::new(reader),
                    Box::new(writer),
                    addr.to_string(),
                ))
            }
            #[cfg(unix)]
            ListenerInner::Unix(socket) => {
                let (stream, _addr) = socket
                    .listener
                    .accept()
                    .await
                    .map_err(TransportError::Accept)?;
                debug!(path = ?socket.path, "accepted unix connection");
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(
                    Box::new(reader),
                    Box::new(writer),
                    self.endpoint.to_string(),
                ))
            }
        }
    }

    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// A bound Unix socket that removes its own file on drop.
#[cfg(unix)]
struct UnixSocketFile {
    listener: tokio::net::UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

#[cfg(unix)]
impl UnixSocketFile {
    const SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    fn bind(path: PathBuf) -> Result<Self> {
        let bind_err = |path: &PathBuf, source| TransportError::Bind {
            endpoint: Endpoint::Unix(path.clone()).to_string(),
            source,
        };

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
        }

        let listener = tokio::net::UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(|e| bind_err(&path, e))?;
        let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: (metadata.dev(), metadata.ino()),
            path,
        })
    }
}

#[cfg(unix)]
impl Drop for UnixSocketFile {
    fn drop(&mut self) {
        let (dev, ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}
