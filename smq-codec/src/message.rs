use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;

pub type Headers = ahash::AHashMap<String, String>;

/// Well-known header names
pub mod header {
    pub const DESTINATION: &str = "destination";
    pub const CLIENT_ID: &str = "client_id";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const LAST_WILL_DESTINATION: &str = "last_will_destination";
    pub const LAST_WILL_MESSAGE: &str = "last_will_message";
    pub const MESSAGE_ID: &str = "message_id";
    /// `topic` or `queue`, consulted when a SUBSCRIBE creates a destination
    pub const TYPE: &str = "type";
    pub const QOS: &str = "qos";
}

prim_enum! {
    /// Frame type byte
    pub enum MessageType {
        Connect = 0,
        Subscribe = 1,
        Unsubscribe = 2,
        Message = 3,
        Ack = 4,
        Ping = 5,
        Disconnect = 6,
        ConnectAck = 7,
        SubscribeAck = 8,
        UnsubscribeAck = 9,
        PublishAck = 10,
        PingAck = 11
    }
}

/// What follows the type byte of a frame.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Layout {
    Empty,
    /// A header block, or nothing when the next frame's magic follows
    /// the type byte directly
    OptionalHeaders,
    Headers,
    HeadersAndBody,
}

impl MessageType {
    #[inline]
    pub fn layout(self) -> Layout {
        match self {
            MessageType::Connect | MessageType::Subscribe => Layout::Headers,
            MessageType::Unsubscribe | MessageType::Ack => Layout::OptionalHeaders,
            MessageType::Message => Layout::HeadersAndBody,
            MessageType::Ping
            | MessageType::Disconnect
            | MessageType::ConnectAck
            | MessageType::SubscribeAck
            | MessageType::UnsubscribeAck
            | MessageType::PublishAck
            | MessageType::PingAck => Layout::Empty,
        }
    }

    /// Types that cannot be encoded without a destination.
    #[inline]
    pub fn requires_destination(self) -> bool {
        matches!(self, MessageType::Message | MessageType::Subscribe)
    }

    /// The acknowledgement the broker answers this request with, if any.
    #[inline]
    pub fn ack(self) -> Option<MessageType> {
        match self {
            MessageType::Connect => Some(MessageType::ConnectAck),
            MessageType::Subscribe => Some(MessageType::SubscribeAck),
            MessageType::Unsubscribe => Some(MessageType::UnsubscribeAck),
            MessageType::Message => Some(MessageType::PublishAck),
            MessageType::Ping => Some(MessageType::PingAck),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Connect => "CONNECT",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::Message => "MESSAGE",
            MessageType::Ack => "ACK",
            MessageType::Ping => "PING",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::ConnectAck => "CONNECT_ACK",
            MessageType::SubscribeAck => "SUBSCRIBE_ACK",
            MessageType::UnsubscribeAck => "UNSUBSCRIBE_ACK",
            MessageType::PublishAck => "PUBLISH_ACK",
            MessageType::PingAck => "PING_ACK",
        };
        f.write_str(name)
    }
}

/// A protocol message.
///
/// The destination travels on the wire as the `destination` header but is
/// kept apart from the header map once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub typ: MessageType,
    pub headers: Headers,
    pub destination: Option<ByteString>,
    pub body: Option<Bytes>,
}

impl Message {
    #[inline]
    pub fn new(typ: MessageType) -> Self {
        Message { typ, headers: Headers::default(), destination: None, body: None }
    }

    pub fn connect(client_id: &str) -> Self {
        Message::new(MessageType::Connect).header(header::CLIENT_ID, client_id)
    }

    pub fn subscribe<D: Into<ByteString>>(destination: D) -> Self {
        Message::new(MessageType::Subscribe).destination(destination)
    }

    pub fn unsubscribe<D: Into<ByteString>>(destination: D) -> Self {
        Message::new(MessageType::Unsubscribe).destination(destination)
    }

    pub fn publish<D: Into<ByteString>, B: Into<Bytes>>(destination: D, body: B) -> Self {
        Message::new(MessageType::Message).destination(destination).body(body)
    }

    pub fn ack(message_id: u64) -> Self {
        Message::new(MessageType::Ack).header(header::MESSAGE_ID, &message_id.to_string())
    }

    #[inline]
    pub fn destination<D: Into<ByteString>>(mut self, destination: D) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[inline]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_owned(), value.to_owned());
        self
    }

    #[inline]
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    #[inline]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    #[inline]
    pub fn get_destination(&self) -> Option<&str> {
        self.destination.as_deref().filter(|d| !d.is_empty())
    }

    /// Value of the `message_id` header, if present and numeric.
    #[inline]
    pub fn message_id(&self) -> Option<u64> {
        self.get_header(header::MESSAGE_ID).and_then(|id| id.parse().ok())
    }
}
