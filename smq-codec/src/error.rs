use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid protocol magic")]
    InvalidProtocol,
    #[error("Unknown message type: {0}")]
    UnknownType(u8),
    #[error("Invalid length")]
    InvalidLength,
    #[error("Malformed header block")]
    MalformedHeader,
    #[error("Max size exceeded")]
    MaxSizeExceeded,
    #[error("utf8 error")]
    Utf8Error,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> DecodeError {
        DecodeError::Io(e)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Destination is required for {0:?}")]
    DestinationRequired(crate::MessageType),
    #[error("Invalid header {0:?}")]
    InvalidHeader(String),
    #[error("Invalid length")]
    InvalidLength,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for EncodeError {
    fn from(e: io::Error) -> EncodeError {
        EncodeError::Io(e)
    }
}
