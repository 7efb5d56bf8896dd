use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{decode_value_with_config, encode_value, CodecConfig};
use crate::error::{CodecError, Result};
use crate::value::Value;

/// Message header: id (2) + code (2) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Reserved id marking an unsolicited notification that expects no reply.
pub const NOTIFICATION_ID: u16 = 0xFFFF;

/// Call ids cycle through `0..CALL_ID_SPACE`, well clear of [`NOTIFICATION_ID`].
pub const CALL_ID_SPACE: u16 = 0x8000;

/// Response code sent for a successful call. Any nonzero code reads as success.
pub const RESPONSE_OK: u16 = 1;

/// Response code sent for a failed call.
pub const RESPONSE_ERROR: u16 = 0;

/// One message exactly as it appears on the wire.
///
/// ```text
/// ┌───────────┬─────────────┬──────────────────────────┐
/// │ id (2B BE)│ code (2B BE)│ value*  (self-delimiting)│
/// └───────────┴─────────────┴──────────────────────────┘
/// ```
///
/// The meaning of `code` depends on the direction of travel; see [`Message`]
/// for the typed view.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub id: u16,
    pub code: u16,
    pub args: Vec<Value>,
}

impl RawMessage {
    pub fn new(id: u16, code: u16, args: Vec<Value>) -> Self {
        Self { id, code, args }
    }

    pub fn is_notification(&self) -> bool {
        self.id == NOTIFICATION_ID
    }

    /// Encode header and arguments into a fresh buffer.
    pub fn serialize(&self) -> Result<Bytes> {
        serialize_parts(self.id, self.code, &self.args)
    }

    /// Parse one whole message. The buffer must end exactly after the last value.
    pub fn parse(src: &[u8]) -> Result<Self> {
        Self::parse_with_config(src, &CodecConfig::default())
    }

    pub fn parse_with_config(src: &[u8], config: &CodecConfig) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                remaining: src.len(),
            });
        }

        let id = u16::from_be_bytes([src[0], src[1]]);
        let code = u16::from_be_bytes([src[2], src[3]]);

        let mut args = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < src.len() {
            let (value, next) = decode_value_with_config(src, offset, config)?;
            args.push(value);
            offset = next;
        }

        Ok(Self { id, code, args })
    }
}

fn serialize_parts(id: u16, code: u16, args: &[Value]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(64);
    dst.put_u16(id);
    dst.put_u16(code);
    for arg in args {
        encode_value(arg, &mut dst)?;
    }
    Ok(dst.freeze())
}

/// Which end of the connection is reading a message.
///
/// The wire reuses `code` for three purposes; the reader's side decides how
/// a non-notification frame is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Issues calls; inbound frames are responses or notifications.
    Client,
    /// Answers calls; inbound frames are requests or notifications.
    Server,
}

/// Typed view of a [`RawMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call. `id` must be below [`CALL_ID_SPACE`].
    Request {
        id: u16,
        method: u16,
        args: Vec<Value>,
    },
    /// The reply to the request with the same `id`. A failed call carries its
    /// error payload as the first argument.
    Response { id: u16, ok: bool, args: Vec<Value> },
    /// An unsolicited event; travels with [`NOTIFICATION_ID`].
    Notification { event: u16, args: Vec<Value> },
}

impl Message {
    /// Interpret a raw frame as seen by `receiver`.
    pub fn classify(raw: RawMessage, receiver: Side) -> Self {
        let RawMessage { id, code, args } = raw;
        if id == NOTIFICATION_ID {
            return Self::Notification { event: code, args };
        }
        match receiver {
            Side::Client => Self::Response {
                id,
                ok: code != RESPONSE_ERROR,
                args,
            },
            Side::Server => Self::Request {
                id,
                method: code,
                args,
            },
        }
    }

    pub fn parse(src: &[u8], receiver: Side) -> Result<Self> {
        Ok(Self::classify(RawMessage::parse(src)?, receiver))
    }

    pub fn into_raw(self) -> RawMessage {
        let (id, code) = self.header();
        let args = match self {
            Self::Request { args, .. }
            | Self::Response { args, .. }
            | Self::Notification { args, .. } => args,
        };
        RawMessage { id, code, args }
    }

    pub fn serialize(&self) -> Result<Bytes> {
        let (id, code) = self.header();
        serialize_parts(id, code, self.args())
    }

    /// Call id, or `None` for notifications.
    pub fn id(&self) -> Option<u16> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            Self::Request { args, .. }
            | Self::Response { args, .. }
            | Self::Notification { args, .. } => args,
        }
    }

    fn header(&self) -> (u16, u16) {
        match self {
            Self::Request { id, method, .. } => (*id, *method),
            Self::Response { id, ok, .. } => (*id, if *ok { RESPONSE_OK } else { RESPONSE_ERROR }),
            Self::Notification { event, .. } => (NOTIFICATION_ID, *event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian_id_then_code() {
        let wire = RawMessage::new(0x0102, 0x0304, vec![]).serialize().unwrap();
        assert_eq!(wire.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn request_wire_form() {
        let wire = Message::Request {
            id: 0,
            method: 5,
            args: vec![Value::from("x")],
        }
        .serialize()
        .unwrap();
        assert_eq!(wire.as_ref(), &[0, 0, 0, 5, 5, 0, 0, 0, 1, b'x']);
    }

    #[test]
    fn frame_roundtrip() {
        let raw = RawMessage::new(
            17,
            9,
            vec![
                Value::from("hello"),
                Value::Int32(-4),
                Value::List(vec![Value::Bool(false), Value::Float64(2.5)]),
                Value::Map(vec![(Value::from("k"), Value::Null)]),
                Value::from(vec![1u8, 2, 3]),
            ],
        );
        let wire = raw.serialize().unwrap();
        assert_eq!(RawMessage::parse(&wire).unwrap(), raw);
    }

    #[test]
    fn empty_args_roundtrip() {
        let raw = RawMessage::new(3, 1, vec![]);
        let wire = raw.serialize().unwrap();
        assert_eq!(wire.len(), HEADER_SIZE);
        assert_eq!(RawMessage::parse(&wire).unwrap(), raw);
    }

    #[test]
    fn short_header_is_truncated() {
        assert_eq!(
            RawMessage::parse(&[0, 1, 0]),
            Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                remaining: 3
            })
        );
    }

    #[test]
    fn trailing_partial_value_fails_whole_frame() {
        let mut wire = RawMessage::new(1, 1, vec![Value::Int32(1), Value::from("tail")])
            .serialize()
            .unwrap()
            .to_vec();
        wire.truncate(wire.len() - 2);
        assert!(matches!(
            RawMessage::parse(&wire),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_tag_fails_whole_frame() {
        let wire = [0, 1, 0, 1, 2, 0x63];
        assert_eq!(RawMessage::parse(&wire), Err(CodecError::UnknownTag(0x63)));
    }

    #[test]
    fn sentinel_id_classifies_as_notification_on_both_sides() {
        let raw = RawMessage::new(NOTIFICATION_ID, 7, vec![Value::from("evt")]);
        for side in [Side::Client, Side::Server] {
            assert_eq!(
                Message::classify(raw.clone(), side),
                Message::Notification {
                    event: 7,
                    args: vec![Value::from("evt")]
                }
            );
        }
    }

    #[test]
    fn client_reads_code_as_success_flag() {
        let ok = Message::classify(RawMessage::new(4, RESPONSE_OK, vec![]), Side::Client);
        let other_nonzero = Message::classify(RawMessage::new(4, 0x00FF, vec![]), Side::Client);
        let failed = Message::classify(RawMessage::new(4, RESPONSE_ERROR, vec![]), Side::Client);

        assert!(matches!(ok, Message::Response { id: 4, ok: true, .. }));
        assert!(matches!(other_nonzero, Message::Response { ok: true, .. }));
        assert!(matches!(failed, Message::Response { ok: false, .. }));
    }

    #[test]
    fn server_reads_code_as_method() {
        let msg = Message::parse(
            &RawMessage::new(12, 300, vec![Value::Null]).serialize().unwrap(),
            Side::Server,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::Request {
                id: 12,
                method: 300,
                args: vec![Value::Null]
            }
        );
    }

    #[test]
    fn typed_messages_map_to_raw_headers() {
        let response = Message::Response {
            id: 9,
            ok: false,
            args: vec![Value::from("denied")],
        };
        assert_eq!(response.id(), Some(9));
        assert_eq!(
            response.into_raw(),
            RawMessage::new(9, RESPONSE_ERROR, vec![Value::from("denied")])
        );

        let notification = Message::Notification {
            event: 2,
            args: vec![],
        };
        assert_eq!(notification.id(), None);
        assert!(notification.into_raw().is_notification());
    }

    #[test]
    fn typed_serialize_matches_raw_serialize() {
        let msg = Message::Response {
            id: 100,
            ok: true,
            args: vec![Value::Int32(1), Value::from("a")],
        };
        assert_eq!(
            msg.serialize().unwrap(),
            msg.clone().into_raw().serialize().unwrap()
        );
    }
}
