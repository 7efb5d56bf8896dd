use std::time::Duration;

use castrpc_codec::Value;

/// Errors that can occur in multiplexer and session operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] castrpc_transport::TransportError),

    /// Value or message encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] castrpc_codec::CodecError),

    /// The remote side answered the call with a failure payload.
    #[error("remote call failed: {0}")]
    Remote(Value),

    /// The channel closed while the call was pending.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The multiplexer is closed and accepts no new calls.
    #[error("multiplexer is closed")]
    Closed,

    /// Every call id is taken by a call still awaiting its reply.
    #[error("all {0} call ids are in flight")]
    IdsExhausted(usize),

    /// No reply arrived in time.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The multiplexer went away without settling the call.
    #[error("reply abandoned")]
    Abandoned,
}

impl PeerError {
    /// The failure payload carried by a remote error, if any.
    pub fn remote_payload(&self) -> Option<&Value> {
        match self {
            Self::Remote(payload) => Some(payload),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
