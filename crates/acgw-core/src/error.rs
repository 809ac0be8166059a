//! Error types for acgw core primitives

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Protobuf decoding failed
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Topic does not follow the gateway grammar
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Cipher hook failed
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Correlator wait expired before a value arrived
    #[error("timed out waiting for reply on {0}")]
    Timeout(String),

    /// Correlator was closed before a value arrived
    #[error("reply channel {0} closed")]
    ChannelClosed(String),

    /// Correlator already holds an unread value
    #[error("reply channel {0} already holds a value")]
    ReplyPending(String),

    /// Worker pool no longer accepts jobs
    #[error("worker pool {0} is shut down")]
    PoolClosed(String),

    /// Worker pool queue is full (non-blocking submit only)
    #[error("worker pool {0} queue is full")]
    PoolFull(String),
}

/// Error returned by a device protocol translator.
///
/// Translation failures are never fatal to a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("malformed device frame: {0}")]
    Decode(String),

    #[error("cannot encode device frame: {0}")]
    Encode(String),

    #[error("unsupported message id 0x{0:08x}")]
    Unsupported(u32),

    #[error("{0}")]
    Other(String),
}

impl TranslateError {
    /// Numeric code carried in a synthesized `MessageError`
    pub fn code(&self) -> i32 {
        match self {
            TranslateError::Decode(_) => 2,
            TranslateError::Encode(_) => 3,
            TranslateError::Unsupported(_) => 4,
            TranslateError::Other(_) => 1,
        }
    }
}

impl From<prost::DecodeError> for TranslateError {
    fn from(e: prost::DecodeError) -> Self {
        TranslateError::Decode(e.to_string())
    }
}
