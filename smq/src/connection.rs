use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use bytestring::ByteString;
use parking_lot::Mutex;
use tokio_util::codec::Decoder;

use smq_codec::{encode_into, DecodeError, Message, SmqCodec};
use smq_net::{ByteStream, NetError};

use crate::error::SmqError;
use crate::types::{ClientId, ConnectionId, Destination, HashSet};

const READ_CHUNK: usize = 8 * 1024;
/// Bytes read per pass when frame size is unlimited
const READ_LIMIT: usize = 64 * READ_CHUNK;

/// Delivered on the client's behalf when the connection ends abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub destination: Destination,
    pub message: ByteString,
}

impl LastWill {
    #[inline]
    pub fn to_message(&self) -> Message {
        Message::publish(self.destination.clone(), self.message.as_bytes().clone())
    }
}

#[derive(Debug, Default)]
struct Session {
    client_id: Option<ClientId>,
    username: Option<String>,
    last_will: Option<LastWill>,
}

struct Reader {
    buf: BytesMut,
    codec: SmqCodec,
}

/// Outcome of one read pass.
#[derive(Debug, Default)]
pub struct Frames {
    /// Complete frames, in arrival order
    pub messages: Vec<Message>,
    /// Read or decode failure hit after `messages`
    pub error: Option<SmqError>,
    /// The peer closed its side
    pub eof: bool,
    /// The pass stopped at its read limit, more bytes may be waiting
    pub more: bool,
}

/// One accepted client.
///
/// The connection does not hold its subscriptions, only the names of the
/// destinations it belongs to; the registry resolves them.
pub struct Connection {
    id: ConnectionId,
    stream: Arc<dyn ByteStream>,
    peer_addr: Option<SocketAddr>,
    session: Mutex<Session>,
    destinations: Mutex<HashSet<Destination>>,
    reader: Mutex<Reader>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: Arc<dyn ByteStream>, max_packet_size: u32) -> Self {
        Connection {
            id: stream.id(),
            peer_addr: stream.peer_addr(),
            stream,
            session: Mutex::new(Session::default()),
            destinations: Mutex::new(HashSet::default()),
            reader: Mutex::new(Reader { buf: BytesMut::with_capacity(READ_CHUNK), codec: SmqCodec::new(max_packet_size) }),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn stream(&self) -> &Arc<dyn ByteStream> {
        &self.stream
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Set once CONNECT has been accepted
    #[inline]
    pub fn client_id(&self) -> Option<ClientId> {
        self.session.lock().client_id.clone()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.session.lock().client_id.is_some()
    }

    pub(crate) fn set_connected(&self, client_id: ClientId, username: Option<String>, last_will: Option<LastWill>) {
        let mut session = self.session.lock();
        session.client_id = Some(client_id);
        session.username = username;
        session.last_will = last_will;
    }

    #[inline]
    pub fn username(&self) -> Option<String> {
        self.session.lock().username.clone()
    }

    /// Takes the last will, so it can be published at most once.
    #[inline]
    pub fn take_last_will(&self) -> Option<LastWill> {
        self.session.lock().last_will.take()
    }

    pub(crate) fn add_destination(&self, name: Destination) -> bool {
        self.destinations.lock().insert(name)
    }

    pub(crate) fn remove_destination(&self, name: &str) -> bool {
        self.destinations.lock().remove(name)
    }

    pub(crate) fn take_destinations(&self) -> Vec<Destination> {
        self.destinations.lock().drain().collect()
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.lock().iter().cloned().collect()
    }

    /// Writes `msg` as one frame addressed to its own destination.
    pub fn send(&self, msg: &Message) -> Result<(), SmqError> {
        if self.is_closed() {
            return Err(NetError::Closed.into());
        }
        let mut frame = BytesMut::new();
        encode_into(msg.destination.as_deref().unwrap_or_default(), msg, &mut frame)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Reads what is available and decodes it chunk by chunk, so an
    /// oversized frame is refused as soon as its length prefix arrives.
    /// One pass reads at most one maximum frame.
    pub fn read_frames(&self) -> Frames {
        let mut reader = self.reader.lock();
        let Reader { buf, codec } = &mut *reader;
        let limit = codec.max_frame_len().unwrap_or(READ_LIMIT).max(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut frames = Frames::default();
        let mut read = 0;
        loop {
            if read >= limit {
                frames.more = true;
                break;
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    frames.eof = true;
                    if let Err(e) = decode_frames(codec, buf, &mut frames.messages, true) {
                        frames.error = Some(e.into());
                    }
                    break;
                }
                Ok(n) => {
                    read += n;
                    buf.extend_from_slice(&chunk[..n]);
                    if let Err(e) = decode_frames(codec, buf, &mut frames.messages, false) {
                        frames.error = Some(e.into());
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    frames.error = Some(NetError::Io(e).into());
                    break;
                }
            }
        }
        frames
    }

    /// Closes the stream, returns false if it already was.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stream.close();
        true
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.stream.is_active()
    }
}

fn decode_frames(codec: &mut SmqCodec, buf: &mut BytesMut, out: &mut Vec<Message>, eof: bool) -> Result<(), DecodeError> {
    loop {
        let msg = if eof { codec.decode_eof(buf)? } else { codec.decode(buf)? };
        match msg {
            Some(msg) => out.push(msg),
            None => return Ok(()),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client_id) => write!(f, "{{{}}}", client_id),
            None => match self.peer_addr {
                Some(addr) => write!(f, "{{#{}@{}}}", self.id, addr),
                None => write!(f, "{{#{}}}", self.id),
            },
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id())
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mio::{Interest, Registry, Token};
    use smq_codec::{encode, MessageType};

    /// In-memory stream: `input` is what the peer sent, `output` what we wrote.
    #[derive(Default)]
    pub(crate) struct MockStream {
        pub id: usize,
        pub input: Mutex<Vec<u8>>,
        pub output: Mutex<Vec<u8>>,
        pub eof: AtomicBool,
        pub closed: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    impl MockStream {
        pub fn new(id: usize) -> Arc<Self> {
            Arc::new(MockStream { id, ..Default::default() })
        }

        pub fn written(&self) -> Vec<Message> {
            let mut out = self.output.lock();
            let mut buf = BytesMut::from(&out[..]);
            out.clear();
            let mut codec = SmqCodec::new(0);
            let mut frames = Vec::new();
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                frames.push(msg);
            }
            frames
        }
    }

    impl ByteStream for MockStream {
        fn id(&self) -> usize {
            self.id
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut input = self.input.lock();
            if input.is_empty() {
                if self.eof.load(Ordering::SeqCst) {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(input.len());
            buf[..n].copy_from_slice(&input[..n]);
            input.drain(..n);
            Ok(n)
        }
        fn write_all(&self, data: &[u8]) -> Result<(), NetError> {
            if self.fail_writes.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return Err(NetError::Closed);
            }
            self.output.lock().extend_from_slice(data);
            Ok(())
        }
        fn bytes_available(&self) -> io::Result<usize> {
            Ok(self.input.lock().len())
        }
        fn is_active(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn register(&self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn reregister(&self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_frames_across_chunks() {
        let stream = MockStream::new(1);
        let conn = Connection::new(stream.clone(), 0);
        let frame = encode("q", &Message::publish("q", "hello")).unwrap();
        let ping = encode("", &Message::new(MessageType::Ping)).unwrap();

        stream.input.lock().extend_from_slice(&frame[..7]);
        let frames = conn.read_frames();
        assert!(frames.messages.is_empty() && !frames.eof && frames.error.is_none());

        stream.input.lock().extend_from_slice(&frame[7..]);
        stream.input.lock().extend_from_slice(&ping);
        stream.input.lock().extend_from_slice(b"MSG:\x02");
        stream.eof.store(true, Ordering::SeqCst);
        let frames = conn.read_frames();
        assert!(frames.eof && frames.error.is_none());
        let types: Vec<_> = frames.messages.iter().map(|m| m.typ).collect();
        assert_eq!(types, vec![MessageType::Message, MessageType::Ping, MessageType::Unsubscribe]);
        assert_eq!(frames.messages[0].get_destination(), Some("q"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let stream = MockStream::new(1);
        let conn = Connection::new(stream.clone(), 0);
        stream.input.lock().extend_from_slice(b"GET / HTTP/1.1\r\n");
        let frames = conn.read_frames();
        assert!(frames.messages.is_empty());
        assert!(matches!(frames.error, Some(SmqError::Decode(_))));
    }

    #[test]
    fn frames_before_garbage_are_kept() {
        let stream = MockStream::new(1);
        let conn = Connection::new(stream.clone(), 0);
        stream.input.lock().extend_from_slice(&encode("q", &Message::publish("q", "hello")).unwrap());
        stream.input.lock().extend_from_slice(b"GARBAGE");
        let frames = conn.read_frames();
        assert_eq!(frames.messages.len(), 1);
        assert_eq!(frames.messages[0].body.as_deref(), Some(&b"hello"[..]));
        assert!(matches!(frames.error, Some(SmqError::Decode(_))));
    }

    #[test]
    fn one_pass_reads_at_most_one_frame_limit() {
        let stream = MockStream::new(1);
        let conn = Connection::new(stream.clone(), 16);
        let ping = encode("", &Message::new(MessageType::Ping)).unwrap();
        for _ in 0..4000 {
            stream.input.lock().extend_from_slice(&ping);
        }
        let frames = conn.read_frames();
        assert!(frames.more && !frames.eof && frames.error.is_none());
        assert_eq!(frames.messages.len(), READ_CHUNK / ping.len());
        assert_eq!(stream.input.lock().len(), 4000 * ping.len() - READ_CHUNK);

        let frames = conn.read_frames();
        assert!(frames.more);
        assert_eq!(frames.messages.len(), READ_CHUNK / ping.len());
    }

    #[test]
    fn oversized_frame_refused_before_it_is_buffered() {
        let stream = MockStream::new(1);
        let conn = Connection::new(stream.clone(), 16);
        stream.input.lock().extend_from_slice(b"MSG:\x03\x00\x10\x00\x00");
        stream.input.lock().extend(std::iter::repeat(b'x').take(4 * READ_CHUNK));
        let frames = conn.read_frames();
        assert!(matches!(frames.error, Some(SmqError::Decode(DecodeError::MaxSizeExceeded))));
        assert!(stream.input.lock().len() >= 3 * READ_CHUNK);
    }

    #[test]
    fn send_and_close() {
        let stream = MockStream::new(3);
        let conn = Connection::new(stream.clone(), 0);
        assert_eq!(conn.to_string(), "{#3}");
        conn.set_connected("c1".into(), None, None);
        assert_eq!(conn.to_string(), "{c1}");

        conn.send(&Message::publish("t", "x")).unwrap();
        let out = stream.written();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_destination(), Some("t"));

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.send(&Message::new(MessageType::PingAck)).is_err());
    }

    #[test]
    fn last_will_taken_once() {
        let conn = Connection::new(MockStream::new(1), 0);
        let will = LastWill { destination: "w".into(), message: "bye".into() };
        conn.set_connected("c".into(), None, Some(will.clone()));
        assert_eq!(conn.take_last_will(), Some(will));
        assert!(conn.take_last_will().is_none());
    }
}
