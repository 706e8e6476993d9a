use std::cell::Cell;
use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::message::{header, Layout, Message, MessageType};
use crate::utils::{parse_headers, put_block, take_block, write_header};

/// Frame marker
pub const MAGIC: &[u8; 4] = b"MSG:";

const PREFIX_LEN: usize = MAGIC.len() + 1;

#[derive(Debug, Clone)]
/// SMQ frame codec
pub struct SmqCodec {
    state: Cell<DecodeState>,
    max_size: Cell<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(MessageType, usize),
}

impl SmqCodec {
    /// Create `SmqCodec` instance
    pub fn new(max_size: u32) -> Self {
        SmqCodec { state: Cell::new(DecodeState::FrameHeader), max_size: Cell::new(max_size) }
    }

    /// Set max inbound header block and body size.
    ///
    /// If max size is set to `0`, size is unlimited.
    pub fn set_max_size(&mut self, size: u32) {
        self.max_size.set(size);
    }

    #[inline]
    fn check_size(&self, len: usize) -> Result<(), DecodeError> {
        let max_size = self.max_size.get() as usize;
        if max_size != 0 && len > max_size {
            return Err(DecodeError::MaxSizeExceeded);
        }
        Ok(())
    }

    /// Longest frame this codec accepts, `None` if unlimited.
    #[inline]
    pub fn max_frame_len(&self) -> Option<usize> {
        match self.max_size.get() as usize {
            0 => None,
            max => Some(PREFIX_LEN + 2 * (4 + max)),
        }
    }

    /// Inspects the buffered bytes without consuming them and returns the
    /// frame type and total frame length once both are known.
    fn frame_len(&self, src: &[u8]) -> Result<Option<(MessageType, usize)>, DecodeError> {
        let n = src.len().min(MAGIC.len());
        ensure!(src[..n] == MAGIC[..n], DecodeError::InvalidProtocol);
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }
        let typ = MessageType::try_from(src[MAGIC.len()])?;
        let mut len = PREFIX_LEN;
        let blocks = match typ.layout() {
            Layout::Empty => 0,
            Layout::OptionalHeaders => {
                if src.len() < len + 4 {
                    return Ok(None);
                }
                if src[len..len + 4] == MAGIC[..] {
                    return Ok(Some((typ, len)));
                }
                1
            }
            Layout::Headers => 1,
            Layout::HeadersAndBody => 2,
        };
        for _ in 0..blocks {
            if src.len() < len + 4 {
                return Ok(None);
            }
            let mut prefix = &src[len..len + 4];
            let block_len = prefix.get_u32() as usize;
            self.check_size(block_len)?;
            len += 4 + block_len;
        }
        Ok(Some((typ, len)))
    }
}

impl Default for SmqCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for SmqCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => match self.frame_len(src)? {
                    Some((typ, len)) => self.state.set(DecodeState::Frame(typ, len)),
                    None => return Ok(None),
                },
                DecodeState::Frame(typ, len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let mut frame = src.split_to(len).freeze();
                    frame.advance(PREFIX_LEN);
                    self.state.set(DecodeState::FrameHeader);
                    return decode_frame(typ, frame).map(Some);
                }
            }
        }
    }

    /// A bare UNSUBSCRIBE or ACK can only be told apart from a truncated
    /// one once the peer has closed its side.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if self.state.get() == DecodeState::FrameHeader && src.len() == PREFIX_LEN {
            let typ = MessageType::try_from(src[MAGIC.len()])?;
            if typ.layout() == Layout::OptionalHeaders {
                src.clear();
                return Ok(Some(Message::new(typ)));
            }
        }
        Ok(None)
    }
}

fn decode_frame(typ: MessageType, mut src: Bytes) -> Result<Message, DecodeError> {
    let mut msg = Message::new(typ);
    let layout = typ.layout();
    if layout == Layout::OptionalHeaders && src.is_empty() {
        return Ok(msg);
    }
    if layout != Layout::Empty {
        msg.headers = parse_headers(&take_block(&mut src)?)?;
        msg.destination = msg.headers.remove(header::DESTINATION).map(Into::into);
    }
    if layout == Layout::HeadersAndBody {
        msg.body = Some(take_block(&mut src)?);
    }
    Ok(msg)
}

impl Encoder<Message> for SmqCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_into(item.destination.as_deref().unwrap_or_default(), &item, dst)
    }
}

impl Encoder<&Message> for SmqCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_into(item.destination.as_deref().unwrap_or_default(), item, dst)
    }
}

/// Serializes `msg` to a new frame addressed to `destination`.
///
/// Fails if `destination` is empty and the message type requires one.
pub fn encode(destination: &str, msg: &Message) -> Result<Bytes, EncodeError> {
    let mut dst = BytesMut::new();
    encode_into(destination, msg, &mut dst)?;
    Ok(dst.freeze())
}

pub fn encode_into(destination: &str, msg: &Message, dst: &mut BytesMut) -> Result<(), EncodeError> {
    if destination.is_empty() && msg.typ.requires_destination() {
        return Err(EncodeError::DestinationRequired(msg.typ));
    }
    let layout = msg.typ.layout();
    let mut headers = String::new();
    if layout != Layout::Empty {
        if !destination.is_empty() {
            write_header(header::DESTINATION, destination, &mut headers)?;
        }
        for (name, value) in msg.headers.iter().filter(|(name, _)| name.as_str() != header::DESTINATION) {
            write_header(name, value, &mut headers)?;
        }
    }
    let body = msg.body.as_deref().unwrap_or_default();
    let layout = match layout {
        Layout::OptionalHeaders if headers.is_empty() => Layout::Empty,
        layout => layout,
    };

    dst.reserve(PREFIX_LEN + 8 + headers.len() + body.len());
    dst.put_slice(MAGIC);
    dst.put_u8(msg.typ.into());
    match layout {
        Layout::Empty => {}
        Layout::OptionalHeaders | Layout::Headers => put_block(headers.as_bytes(), dst)?,
        Layout::HeadersAndBody => {
            put_block(headers.as_bytes(), dst)?;
            put_block(body, dst)?;
        }
    }
    Ok(())
}

/// Reads exactly one frame from a blocking reader.
pub fn read_message<R: Read>(reader: &mut R, codec: &mut SmqCodec) -> Result<Message, DecodeError> {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN);
    let mut chunk = [0u8; 1];
    loop {
        if let Some(msg) = codec.decode(&mut buf)? {
            return Ok(msg);
        }
        let need = match codec.state.get() {
            DecodeState::Frame(_, len) => len - buf.len(),
            DecodeState::FrameHeader => 1,
        };
        if need > 1 {
            let start = buf.len();
            buf.resize(start + need, 0);
            reader.read_exact(&mut buf[start..])?;
        } else {
            reader.read_exact(&mut chunk)?;
            buf.put_u8(chunk[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::publish("orders", Bytes::from_static(b"\x00\x01payload"))
            .header("priority", "high")
            .header(header::MESSAGE_ID, "7");
        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
        assert_eq!(decoded.message_id(), Some(7));
    }

    #[test]
    fn test_encode_with_explicit_destination() {
        let msg = Message::new(MessageType::Message).body("b");
        let bytes = encode("jobs", &msg).unwrap();
        let decoded = SmqCodec::default().decode(&mut BytesMut::from(&bytes[..])).unwrap().unwrap();
        assert_eq!(decoded.get_destination(), Some("jobs"));
        assert_eq!(decoded.body, Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_layout_on_wire() {
        let bytes = encode("", &Message::new(MessageType::Ping)).unwrap();
        assert_eq!(&bytes[..], b"MSG:\x05");

        let bytes = encode("q", &Message::new(MessageType::Subscribe)).unwrap();
        assert_eq!(&bytes[..], b"MSG:\x01\x00\x00\x00\x0fdestination: q\n");

        let bytes = encode("", &Message::connect("c1")).unwrap();
        assert_eq!(&bytes[..], b"MSG:\x00\x00\x00\x00\x0eclient_id: c1\n");
    }

    #[test]
    fn test_destination_required() {
        assert!(matches!(
            encode("", &Message::new(MessageType::Message)),
            Err(EncodeError::DestinationRequired(MessageType::Message))
        ));
        assert!(matches!(
            encode("", &Message::new(MessageType::Subscribe)),
            Err(EncodeError::DestinationRequired(MessageType::Subscribe))
        ));
        assert!(encode("", &Message::new(MessageType::Unsubscribe)).is_ok());
        assert!(encode("", &Message::new(MessageType::Ack)).is_ok());
    }

    #[test]
    fn test_bad_magic() {
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::from(&b"MSX"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::InvalidProtocol)));
    }

    #[test]
    fn test_unknown_type() {
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::from(&b"MSG:\x0c"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::UnknownType(12))));
    }

    #[test]
    fn test_malformed_headers() {
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::from(&b"MSG:\x00\x00\x00\x00\x03abc"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MalformedHeader)));
    }

    #[test]
    fn test_partial_frames() {
        let msg = Message::publish("t", "hello world");
        let bytes = encode("t", &msg).unwrap();
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::new();
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            let res = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(res.is_none());
            } else {
                assert_eq!(res, Some(msg.clone()));
            }
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = SmqCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::new(MessageType::Ping), &mut buf).unwrap();
        codec.encode(Message::publish("a", "1"), &mut buf).unwrap();
        codec.encode(Message::new(MessageType::Disconnect), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().map(|m| m.typ), Some(MessageType::Ping));
        assert_eq!(codec.decode(&mut buf).unwrap().map(|m| m.typ), Some(MessageType::Message));
        assert_eq!(codec.decode(&mut buf).unwrap().map(|m| m.typ), Some(MessageType::Disconnect));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_max_size() {
        let mut codec = SmqCodec::default();
        codec.set_max_size(5);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MSG:\x03\x00\x00\x00\x09");
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));
    }

    #[test]
    fn test_bare_unsubscribe_and_ack() {
        let mut codec = SmqCodec::new(1024 * 1024);
        let mut buf = BytesMut::from(&b"MSG:\x02MSG:\x05MSG:\x04"[..]);
        let m = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(m.typ, MessageType::Unsubscribe);
        assert!(m.get_destination().is_none() && m.headers.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap().map(|m| m.typ), Some(MessageType::Ping));

        // trailing bare ACK is only complete at end of input
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().map(|m| m.typ), Some(MessageType::Ack));
        assert!(buf.is_empty());

        assert_eq!(&encode("", &Message::new(MessageType::Unsubscribe)).unwrap()[..], b"MSG:\x02");
        let bytes = encode("a", &Message::unsubscribe("a")).unwrap();
        assert_eq!(&bytes[..], b"MSG:\x02\x00\x00\x00\x0fdestination: a\n");
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().get_destination(), Some("a"));
    }

    #[test]
    fn test_max_frame_len() {
        assert_eq!(SmqCodec::new(0).max_frame_len(), None);
        assert_eq!(SmqCodec::new(10).max_frame_len(), Some(PREFIX_LEN + 28));
    }

    #[test]
    fn test_read_message() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode("x", &Message::publish("x", "body")).unwrap());
        wire.extend_from_slice(&encode("", &Message::new(MessageType::PingAck)).unwrap());
        let mut reader = std::io::Cursor::new(wire);
        let mut codec = SmqCodec::default();
        let m = read_message(&mut reader, &mut codec).unwrap();
        assert_eq!(m.body, Some(Bytes::from_static(b"body")));
        let m = read_message(&mut reader, &mut codec).unwrap();
        assert_eq!(m.typ, MessageType::PingAck);
        assert!(matches!(read_message(&mut reader, &mut codec), Err(DecodeError::Io(_))));
    }
}
