use std::path::PathBuf;

/// Errors that can occur on a castrpc transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint string could not be parsed.
    #[error("invalid endpoint '{input}': {reason}")]
    InvalidEndpoint { input: String, reason: &'static str },

    /// Failed to bind to the specified endpoint.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The envelope header contains an invalid magic number.
    #[error("invalid envelope magic (expected 0x4352 \"CR\")")]
    InvalidMagic,

    /// The message exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
