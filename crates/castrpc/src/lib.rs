//! Binary RPC transport for live-streaming clients.
//!
//! castrpc carries request/response calls and server-pushed notifications
//! over one message-oriented channel, using a compact self-describing value
//! encoding.
//!
//! # Crate Structure
//!
//! - [`transport`]: Whole-message delivery over TCP and Unix domain sockets
//! - [`codec`]: Value encoding and RPC message framing
//! - [`peer`]: Call multiplexing, async client sessions and the serving side

/// Re-export transport types.
pub mod transport {
    pub use castrpc_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use castrpc_codec::*;
}

/// Re-export peer types.
pub mod peer {
    pub use castrpc_peer::*;
}

pub use castrpc_codec::{Message, RawMessage, Value};
pub use castrpc_peer::{Multiplexer, PeerError, Responder, Session, SessionConfig};
pub use castrpc_transport::{Endpoint, Listener};
