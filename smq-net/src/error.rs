use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The multiplexer or acceptor has been shut down
    #[error("Event source is stopped")]
    Stopped,
    /// The readiness primitive refused the descriptor
    #[error("Register error, {0}")]
    Register(io::Error),
    /// The peer did not drain its socket in time
    #[error("Write timeout after {0:?}")]
    WriteTimeout(Duration),
    /// The stream was closed locally or by the peer
    #[error("Stream is closed")]
    Closed,
    #[error("io error, {0}")]
    Io(#[from] io::Error),
}
