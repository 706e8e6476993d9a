#![deny(unsafe_code)]

//! Transport plumbing for SMQ
//!
//! - [`SocketEvents`]: readiness multiplexer dispatching a callback per ready stream
//! - [`ByteStream`]/[`SocketStream`]: the non-blocking byte stream the broker reads and writes
//! - [`Builder`]/[`Listener`]: TCP listener configuration and the accept loop

mod error;
mod events;
mod server;
mod stream;

pub use error::NetError;
pub use events::{EventFlags, EventHandler, SocketEventAction, SocketEvents, Trigger};
pub use server::{Acceptor, Builder, Listener};
pub use stream::{ByteStream, SocketStream};

pub type Error = anyhow::Error;
pub type Result<T, E = Error> = anyhow::Result<T, E>;
