#![deny(unsafe_code)]

//! # SMQ broker core
//! ```rust,no_run
//!
//! use smq::conf::{Options, Settings};
//! use smq::server::SmqServer;
//!
//! fn main() -> smq::Result<()> {
//!     let server = SmqServer::start(Settings::new(Options::default())?)?;
//!     println!("listening on {}", server.local_addr());
//!     std::thread::park();
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod client; // Blocking client
pub mod connection; // Accepted client, frame reading and writing
pub mod context; // Shared broker state and frame handling
pub mod error;
pub mod executor; // Elastic worker pool
pub mod logger;
pub mod registry; // Destinations and live connections
pub mod server; // Listener, multiplexer and sweeper lifecycle
pub mod store; // In-flight message store
pub mod subscription; // Topic and queue delivery
pub mod types;

pub use smq_codec as codec;
pub use smq_conf as conf;
pub use smq_net as net;
pub use smq_utils as utils;

pub use crate::client::SmqClient;
pub use crate::context::ServerContext;
pub use crate::error::{ClientError, SmqError};
pub use crate::types::*;

pub type Error = anyhow::Error;
pub type Result<T, E = Error> = anyhow::Result<T, E>;
