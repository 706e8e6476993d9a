use smq_codec::{DecodeError, EncodeError, MessageType};
use smq_net::NetError;
use smq_utils::LockTimeout;

use crate::executor::ExecError;
use crate::types::{ClientId, ConnectionId};

#[derive(Debug, thiserror::Error)]
pub enum SmqError {
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transport error: {0}")]
    Net(#[from] NetError),
    #[error("Executor error: {0}")]
    Exec(#[from] ExecError),
    #[error("{0}")]
    LockTimeout(#[from] LockTimeout),
    #[error("Bad username or password")]
    NotAuthorized,
    #[error("Client id {0:?} is already connected")]
    IdentifierRejected(ClientId),
    #[error("Connection {0} is gone")]
    ConnectionGone(ConnectionId),
}

impl SmqError {
    /// Errors after which the connection cannot continue.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmqError::Decode(_)
                | SmqError::Protocol(_)
                | SmqError::Net(_)
                | SmqError::NotAuthorized
                | SmqError::IdentifierRejected(_)
                | SmqError::ConnectionGone(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("io error, {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by broker")]
    Closed,
    #[error("Timed out waiting for {0}")]
    Timeout(MessageType),
    #[error("Expected {expected}, got {got}")]
    Unexpected { expected: MessageType, got: MessageType },
}
