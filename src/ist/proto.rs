//! Transfer wire protocol: message schemas, CBOR codec, exchange helpers.
//!
//! Every message rides one crc32c frame. The receiver opens with
//! [`Handshake`], the sender answers with [`HandshakeResponse`], the
//! receiver accepts with `ctrl(CTRL_OK)`; after that the sender streams
//! [`Ordered`] events and terminates with `ctrl(CTRL_EOF)`. Control codes
//! are also how a handshake is rejected (any negative value) and how the
//! receiver's self-connect interrupt delivers a premature end of stream.

use std::convert::Infallible;
use std::io::{Read, Write};

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::error::{EINTR, EPROTO};
use crate::event::{Event, EventKind};
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::seqno::Seqno;

/// Handshake accepted.
pub const CTRL_OK: i32 = 0;

/// End of stream. Positive so it can never be mistaken for a rejection.
pub const CTRL_EOF: i32 = 1;

/// Receiver's opening message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// Whether streamed write-sets should retain key annotations.
    pub keep_keys: bool,
}

/// Sender's reply: version echo and the range it will serve. The range is
/// `UNDEFINED..UNDEFINED` when the connecting party has nothing to send
/// (the interrupt path).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub version: u32,
    pub first: Seqno,
    pub last: Seqno,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    Response(HandshakeResponse),
    Ctrl(i32),
    Ordered { event: Event, preload: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Handshake,
    Response,
    Ctrl,
    Ordered,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::Response => "RESPONSE",
            MessageType::Ctrl => "CTRL",
            MessageType::Ordered => "EVENT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HANDSHAKE" => Some(MessageType::Handshake),
            "RESPONSE" => Some(MessageType::Response),
            "CTRL" => Some(MessageType::Ctrl),
            "EVENT" => Some(MessageType::Ordered),
            _ => None,
        }
    }
}

impl Message {
    fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Response(_) => MessageType::Response,
            Message::Ctrl(_) => MessageType::Ctrl,
            Message::Ordered { .. } => MessageType::Ordered,
        }
    }

    fn name(&self) -> &'static str {
        self.message_type().as_str()
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("peer closed the stream mid-exchange")]
    PeerClosed,
    #[error("interrupted")]
    Interrupted,
}

impl ProtoError {
    pub fn code(&self) -> i32 {
        match self {
            ProtoError::Interrupted => EINTR,
            _ => EPROTO,
        }
    }
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtoError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?;
    enc.str(message.message_type().as_str())?;
    enc.str("body")?;
    match message {
        Message::Handshake(hs) => {
            enc.map(2)?;
            enc.str("version")?;
            enc.u32(hs.version)?;
            enc.str("keep_keys")?;
            enc.bool(hs.keep_keys)?;
        }
        Message::Response(resp) => {
            enc.map(3)?;
            enc.str("version")?;
            enc.u32(resp.version)?;
            enc.str("first")?;
            enc.i64(resp.first.get())?;
            enc.str("last")?;
            enc.i64(resp.last.get())?;
        }
        Message::Ctrl(code) => {
            enc.map(1)?;
            enc.str("code")?;
            enc.i32(*code)?;
        }
        Message::Ordered { event, preload } => {
            enc.map(4)?;
            enc.str("seqno")?;
            enc.i64(event.seqno.get())?;
            enc.str("kind")?;
            enc.str(kind_str(event.kind))?;
            enc.str("preload")?;
            enc.bool(*preload)?;
            enc.str("payload")?;
            enc.bytes(&event.payload)?;
        }
    }
    Ok(buf)
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtoError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        match dec.str()? {
            "type" => {
                let raw = dec.str()?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }

    let message_type = message_type.ok_or(ProtoError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoError::MissingField("body"))?;
    decode_body(message_type, &bytes[start..end])
}

fn decode_body(message_type: MessageType, bytes: &[u8]) -> Result<Message, ProtoError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;
    match message_type {
        MessageType::Handshake => {
            let mut version = None;
            let mut keep_keys = None;
            for _ in 0..map_len {
                match dec.str()? {
                    "version" => version = Some(dec.u32()?),
                    "keep_keys" => keep_keys = Some(dec.bool()?),
                    _ => dec.skip()?,
                }
            }
            Ok(Message::Handshake(Handshake {
                version: version.ok_or(ProtoError::MissingField("version"))?,
                keep_keys: keep_keys.ok_or(ProtoError::MissingField("keep_keys"))?,
            }))
        }
        MessageType::Response => {
            let mut version = None;
            let mut first = None;
            let mut last = None;
            for _ in 0..map_len {
                match dec.str()? {
                    "version" => version = Some(dec.u32()?),
                    "first" => first = Some(Seqno::new(dec.i64()?)),
                    "last" => last = Some(Seqno::new(dec.i64()?)),
                    _ => dec.skip()?,
                }
            }
            Ok(Message::Response(HandshakeResponse {
                version: version.ok_or(ProtoError::MissingField("version"))?,
                first: first.ok_or(ProtoError::MissingField("first"))?,
                last: last.ok_or(ProtoError::MissingField("last"))?,
            }))
        }
        MessageType::Ctrl => {
            let mut code = None;
            for _ in 0..map_len {
                match dec.str()? {
                    "code" => code = Some(dec.i32()?),
                    _ => dec.skip()?,
                }
            }
            Ok(Message::Ctrl(code.ok_or(ProtoError::MissingField("code"))?))
        }
        MessageType::Ordered => {
            let mut seqno = None;
            let mut kind = None;
            let mut preload = None;
            let mut payload = None;
            for _ in 0..map_len {
                match dec.str()? {
                    "seqno" => {
                        let raw = dec.i64()?;
                        if raw <= 0 {
                            return Err(ProtoError::InvalidField {
                                field: "seqno",
                                reason: format!("event seqno must be positive, got {raw}"),
                            });
                        }
                        seqno = Some(Seqno::new(raw));
                    }
                    "kind" => {
                        let raw = dec.str()?;
                        kind = Some(parse_kind(raw)?);
                    }
                    "preload" => preload = Some(dec.bool()?),
                    "payload" => payload = Some(Bytes::copy_from_slice(dec.bytes()?)),
                    _ => dec.skip()?,
                }
            }
            Ok(Message::Ordered {
                event: Event {
                    seqno: seqno.ok_or(ProtoError::MissingField("seqno"))?,
                    kind: kind.ok_or(ProtoError::MissingField("kind"))?,
                    payload: payload.ok_or(ProtoError::MissingField("payload"))?,
                },
                preload: preload.ok_or(ProtoError::MissingField("preload"))?,
            })
        }
    }
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, ProtoError> {
    dec.map()?.ok_or(ProtoError::InvalidField {
        field: "map",
        reason: "indefinite-length CBOR not allowed".to_string(),
    })
}

fn kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::WriteSet => "writeset",
        EventKind::ConfChange => "cchange",
    }
}

fn parse_kind(raw: &str) -> Result<EventKind, ProtoError> {
    match raw {
        "writeset" => Ok(EventKind::WriteSet),
        "cchange" => Ok(EventKind::ConfChange),
        _ => Err(ProtoError::InvalidField {
            field: "kind",
            reason: format!("unknown event kind {raw}"),
        }),
    }
}

/// One endpoint's view of the exchange: local protocol version, key
/// retention preference, and the frame size cap.
#[derive(Clone, Debug)]
pub struct Proto {
    pub version: u32,
    pub keep_keys: bool,
    pub max_frame_bytes: usize,
}

impl Proto {
    pub fn new(version: u32, keep_keys: bool, max_frame_bytes: usize) -> Self {
        Proto {
            version,
            keep_keys,
            max_frame_bytes,
        }
    }

    fn send<S: Read + Write>(&self, stream: &mut S, message: &Message) -> Result<(), ProtoError> {
        let bytes = encode_message(message)?;
        let mut writer = FrameWriter::new(&mut *stream, self.max_frame_bytes);
        writer.write_frame(&bytes)?;
        Ok(())
    }

    fn recv<S: Read + Write>(&self, stream: &mut S) -> Result<Message, ProtoError> {
        let mut reader = FrameReader::new(&mut *stream, self.max_frame_bytes);
        let Some(bytes) = reader.read_next()? else {
            return Err(ProtoError::PeerClosed);
        };
        decode_message(&bytes)
    }

    pub fn send_handshake<S: Read + Write>(&self, stream: &mut S) -> Result<(), ProtoError> {
        self.send(
            stream,
            &Message::Handshake(Handshake {
                version: self.version,
                keep_keys: self.keep_keys,
            }),
        )
    }

    pub fn recv_handshake<S: Read + Write>(&self, stream: &mut S) -> Result<Handshake, ProtoError> {
        match self.recv(stream)? {
            Message::Handshake(hs) => Ok(hs),
            other => Err(ProtoError::UnexpectedMessage {
                expected: "HANDSHAKE",
                got: other.name(),
            }),
        }
    }

    pub fn send_handshake_response<S: Read + Write>(
        &self,
        stream: &mut S,
        first: Seqno,
        last: Seqno,
    ) -> Result<(), ProtoError> {
        self.send(
            stream,
            &Message::Response(HandshakeResponse {
                version: self.version,
                first,
                last,
            }),
        )
    }

    /// Receive the sender's reply. An early `ctrl(CTRL_EOF)` here is the
    /// receiver's own interrupt knocking, not a protocol violation.
    pub fn recv_handshake_response<S: Read + Write>(
        &self,
        stream: &mut S,
    ) -> Result<HandshakeResponse, ProtoError> {
        match self.recv(stream)? {
            Message::Response(resp) => Ok(resp),
            Message::Ctrl(CTRL_EOF) => Err(ProtoError::Interrupted),
            other => Err(ProtoError::UnexpectedMessage {
                expected: "RESPONSE",
                got: other.name(),
            }),
        }
    }

    pub fn send_ctrl<S: Read + Write>(&self, stream: &mut S, code: i32) -> Result<(), ProtoError> {
        self.send(stream, &Message::Ctrl(code))
    }

    pub fn recv_ctrl<S: Read + Write>(&self, stream: &mut S) -> Result<i32, ProtoError> {
        match self.recv(stream)? {
            Message::Ctrl(code) => Ok(code),
            other => Err(ProtoError::UnexpectedMessage {
                expected: "CTRL",
                got: other.name(),
            }),
        }
    }

    pub fn send_ordered<S: Read + Write>(
        &self,
        stream: &mut S,
        event: &Event,
        preload: bool,
    ) -> Result<(), ProtoError> {
        self.send(
            stream,
            &Message::Ordered {
                event: event.clone(),
                preload,
            },
        )
    }

    /// Receive the next ordered event and its preload flag; `Ok(None)` is
    /// the end-of-stream marker.
    pub fn recv_ordered<S: Read + Write>(
        &self,
        stream: &mut S,
    ) -> Result<Option<(Event, bool)>, ProtoError> {
        match self.recv(stream)? {
            Message::Ordered { event, preload } => Ok(Some((event, preload))),
            Message::Ctrl(CTRL_EOF) => Ok(None),
            other => Err(ProtoError::UnexpectedMessage {
                expected: "EVENT",
                got: other.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let bytes = encode_message(&message).unwrap();
        decode_message(&bytes).unwrap()
    }

    #[test]
    fn handshake_roundtrip() {
        let msg = Message::Handshake(Handshake {
            version: 10,
            keep_keys: false,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn response_roundtrip_with_undefined_range() {
        let msg = Message::Response(HandshakeResponse {
            version: 10,
            first: Seqno::UNDEFINED,
            last: Seqno::UNDEFINED,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn ctrl_roundtrip_including_rejection() {
        for code in [CTRL_OK, CTRL_EOF, -71] {
            assert_eq!(roundtrip(Message::Ctrl(code)), Message::Ctrl(code));
        }
    }

    #[test]
    fn ordered_roundtrip_keeps_preload_flag() {
        for preload in [false, true] {
            let msg = Message::Ordered {
                event: Event::writeset(Seqno::new(42), Bytes::from_static(b"payload")),
                preload,
            };
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn conf_change_kind_survives() {
        let msg = Message::Ordered {
            event: Event::conf_change(Seqno::new(7), Bytes::from_static(b"view")),
            preload: false,
        };
        let Message::Ordered { event, .. } = roundtrip(msg) else {
            panic!("expected ordered message");
        };
        assert_eq!(event.kind, EventKind::ConfChange);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap();
        enc.str("GOSSIP").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_message(&buf),
            Err(ProtoError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap();
        enc.str("CTRL").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_message(&buf),
            Err(ProtoError::MissingField("code"))
        ));
    }

    #[test]
    fn exchange_over_in_memory_stream() {
        // a socket-like duplex buffer: reads consume what was written
        struct Pipe(std::io::Cursor<Vec<u8>>);
        impl Read for Pipe {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl Write for Pipe {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                let pos = self.0.position();
                self.0.set_position(self.0.get_ref().len() as u64);
                let n = self.0.write(buf)?;
                self.0.set_position(pos);
                Ok(n)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let proto = Proto::new(10, true, 1024);
        let mut pipe = Pipe(std::io::Cursor::new(Vec::new()));
        proto.send_handshake(&mut pipe).unwrap();
        let hs = proto.recv_handshake(&mut pipe).unwrap();
        assert_eq!(hs.version, 10);
        assert!(hs.keep_keys);

        proto.send_ctrl(&mut pipe, CTRL_EOF).unwrap();
        assert!(proto.recv_ordered(&mut pipe).unwrap().is_none());
    }

    #[test]
    fn eof_during_handshake_response_reads_as_interrupt() {
        let bytes = encode_message(&Message::Ctrl(CTRL_EOF)).unwrap();
        let framed = crate::frame::encode_frame(&bytes, 1024).unwrap();

        struct HalfOpen(std::io::Cursor<Vec<u8>>);
        impl Read for HalfOpen {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl Write for HalfOpen {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let proto = Proto::new(10, true, 1024);
        let mut stream = HalfOpen(std::io::Cursor::new(framed));
        assert!(matches!(
            proto.recv_handshake_response(&mut stream),
            Err(ProtoError::Interrupted)
        ));
    }
}
