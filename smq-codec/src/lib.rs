#![deny(unsafe_code)]

//! SMQ wire protocol codec
//!
//! Every frame starts with the `MSG:` marker and a one byte message type.
//! CONNECT, SUBSCRIBE, UNSUBSCRIBE and ACK frames carry a length-prefixed
//! block of `name: value\n` header lines; MESSAGE frames carry the header
//! block followed by a length-prefixed body; all other types end after the
//! type byte. Length prefixes are 32-bit big-endian.
//!
//! ```
//! use bytes::BytesMut;
//! use smq_codec::{Message, SmqCodec};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = SmqCodec::new(1024 * 1024);
//! let mut buf = BytesMut::new();
//! codec.encode(Message::publish("orders", "hello"), &mut buf).unwrap();
//! let msg = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(msg.get_destination(), Some("orders"));
//! ```

#[macro_use]
mod utils;

/// Error types for encoding/decoding operations
pub mod error;

/// Message model and frame type table
pub mod message;

/// Frame encoder/decoder
pub mod codec;

pub use self::codec::{encode, encode_into, read_message, SmqCodec, MAGIC};
pub use self::error::{DecodeError, EncodeError};
pub use self::message::{header, Headers, Layout, Message, MessageType};
