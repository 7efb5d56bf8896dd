use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TransportError};

/// Envelope header: magic (2) + length (4) = 6 bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 6;

/// Magic bytes: "CR" (0x43 0x52).
pub const MAGIC: [u8; 2] = [0x43, 0x52];

/// Default maximum message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Wrap one message into the stream envelope.
///
/// Wire format:
/// ```text
/// ┌──────────────┬────────────┬──────────────────┐
/// │ Magic (2B)   │ Length     │ Message          │
/// │ 0x43 0x52    │ (4B BE)    │ (Length bytes)   │
/// │ "CR"         │            │                  │
/// └──────────────┴────────────┴──────────────────┘
/// ```
pub fn encode_envelope(message: &[u8], dst: &mut BytesMut) -> Result<()> {
    if message.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            size: message.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(ENVELOPE_HEADER_SIZE + message.len());
    dst.put_slice(&MAGIC);
    dst.put_u32(message.len() as u32);
    dst.put_slice(message);
    Ok(())
}

/// Unwrap one message from a buffer.
///
/// Returns `Ok(None)` until the buffer holds a complete envelope.
/// On success, consumes the envelope bytes from the buffer.
pub fn decode_envelope(src: &mut BytesMut, max_message: usize) -> Result<Option<Bytes>> {
    if src.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(TransportError::InvalidMagic);
    }

    let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > max_message {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_message,
        });
    }

    let total = ENVELOPE_HEADER_SIZE + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(ENVELOPE_HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// `tokio_util` codec turning a byte stream into a stream of whole messages.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_message: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_message(DEFAULT_MAX_MESSAGE)
    }

    pub fn with_max_message(max_message: usize) -> Self {
        Self { max_message }
    }

    pub fn max_message(&self) -> usize {
        self.max_message
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_envelope(src, self.max_message)
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = TransportError;

    fn encode(&mut self, message: Bytes, dst: &mut BytesMut) -> Result<()> {
        if message.len() > self.max_message {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max: self.max_message,
            });
        }
        encode_envelope(&message, dst)
    }
}
