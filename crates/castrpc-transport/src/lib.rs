//! Message-oriented duplex channels for castrpc.
//!
//! The RPC layer assumes a channel that delivers whole messages, the way a
//! binary WebSocket does. Over byte streams (TCP, Unix domain sockets) this
//! crate restores that guarantee with a small envelope:
//! - A 2-byte magic number ("CR") for stream synchronization
//! - A 4-byte big-endian message length
//!
//! This is the lowest layer of castrpc. Everything else builds on top of the
//! [`Connection`] type provided here.

pub mod endpoint;
pub mod envelope;
pub mod error;

pub use endpoint::{Connection, Endpoint, Listener};
pub use envelope::{
    decode_envelope, encode_envelope, EnvelopeCodec, DEFAULT_MAX_MESSAGE, ENVELOPE_HEADER_SIZE,
    MAGIC,
};
pub use error::{Result, TransportError};
