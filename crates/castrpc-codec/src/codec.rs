use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::value::{Tag, Value};

/// Longest string or byte payload representable by the u32 length prefix.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Most list elements or map entries representable by the u16 count prefix.
pub const MAX_ELEMENTS: usize = u16::MAX as usize;

/// Default container nesting limit for decoding.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Configuration for value decoding.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum container nesting accepted from the wire. Default: 64.
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Append the wire form of `value` to `dst`.
///
/// Wire format (all integers big-endian):
/// ```text
/// Bool     [1] [0|1]
/// Null     [2]
/// Int32    [3] [i32]
/// Float64  [4] [f64 IEEE-754]
/// String   [5] [u32 len] [UTF-8 bytes]
/// Bytes    [6] [u32 len] [raw bytes]
/// List     [7] [u16 count] [value]*count
/// Map      [8] [u16 count] [key value]*count
/// ```
///
/// `dst` grows as needed. On error, bytes already appended for the failing
/// value are left in place; callers encoding a whole message should discard
/// the buffer.
pub fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<()> {
    dst.put_u8(value.tag().as_byte());
    match value {
        Value::Bool(b) => dst.put_u8(u8::from(*b)),
        Value::Null => {}
        Value::Int32(n) => dst.put_i32(*n),
        Value::Float64(n) => dst.put_f64(*n),
        Value::String(s) => put_payload(s.as_bytes(), dst)?,
        Value::Bytes(b) => put_payload(b, dst)?,
        Value::List(items) => {
            put_count(items.len(), dst)?;
            for item in items {
                encode_value(item, dst)?;
            }
        }
        Value::Map(entries) => {
            put_count(entries.len(), dst)?;
            for (key, val) in entries {
                encode_value(key, dst)?;
                encode_value(val, dst)?;
            }
        }
    }
    Ok(())
}

fn put_payload(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLong {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

fn put_count(len: usize, dst: &mut BytesMut) -> Result<()> {
    if len > MAX_ELEMENTS {
        return Err(CodecError::TooManyElements {
            len,
            max: MAX_ELEMENTS,
        });
    }
    dst.put_u16(len as u16);
    Ok(())
}

/// Decode one value starting at `offset`.
///
/// Returns the value and the offset just past it.
pub fn decode_value(src: &[u8], offset: usize) -> Result<(Value, usize)> {
    decode_value_with_config(src, offset, &CodecConfig::default())
}

/// Decode one value starting at `offset` with explicit limits.
pub fn decode_value_with_config(
    src: &[u8],
    offset: usize,
    config: &CodecConfig,
) -> Result<(Value, usize)> {
    let mut reader = Reader {
        src,
        pos: offset,
        max_depth: config.max_depth,
    };
    let value = reader.value(0)?;
    Ok((value, reader.pos))
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.src.len().saturating_sub(self.pos)
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(CodecError::Truncated { needed, remaining });
        }
        let out = &self.src[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn payload(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn count(&mut self, depth: usize) -> Result<usize> {
        if depth >= self.max_depth {
            return Err(CodecError::DepthExceeded {
                max: self.max_depth,
            });
        }
        Ok(usize::from(self.u16()?))
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        let byte = self.u8()?;
        let tag = Tag::from_byte(byte).ok_or(CodecError::UnknownTag(byte))?;

        let value = match tag {
            Tag::Bool => Value::Bool(self.u8()? != 0),
            Tag::Null => Value::Null,
            Tag::Int32 => Value::Int32(i32::from_be_bytes(self.array()?)),
            Tag::Float64 => Value::Float64(f64::from_be_bytes(self.array()?)),
            Tag::String => Value::String(String::from_utf8_lossy(self.payload()?).into_owned()),
            Tag::Bytes => Value::Bytes(Bytes::copy_from_slice(self.payload()?)),
            Tag::List => {
                let count = self.count(depth)?;
                // Every element needs at least its tag byte.
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::List(items)
            }
            Tag::Map => {
                let count = self.count(depth)?;
                let mut entries = Vec::with_capacity(count.min(self.remaining() / 2));
                for _ in 0..count {
                    let key = self.value(depth + 1)?;
                    let val = self.value(depth + 1)?;
                    entries.push((key, val));
                }
                Value::Map(entries)
            }
        };
        Ok(value)
    }
}
