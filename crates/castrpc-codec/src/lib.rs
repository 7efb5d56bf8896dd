//! Self-describing binary value encoding and RPC message framing.
//!
//! Two layers live here:
//! - [`value`] / [`codec`]: a tagged [`Value`] type and its wire encoding.
//!   Every value starts with a one-byte tag that determines how many bytes
//!   follow, so encoded values are self-delimiting.
//! - [`message`]: a 4-byte header (call id, code) followed by zero or more
//!   encoded values forms one RPC message.
//!
//! All multi-byte integers and floats are big-endian.

pub mod codec;
pub mod error;
pub mod message;
pub mod value;

pub use codec::{decode_value, decode_value_with_config, encode_value, CodecConfig};
pub use error::{CodecError, Result};
pub use message::{
    Message, RawMessage, Side, CALL_ID_SPACE, HEADER_SIZE, NOTIFICATION_ID, RESPONSE_ERROR,
    RESPONSE_OK,
};
pub use value::{Tag, Value};
