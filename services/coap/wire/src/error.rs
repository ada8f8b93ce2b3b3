//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    #[error("incomplete message")]
    Incomplete,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Token length above the protocol maximum
    #[error("invalid token length {0}")]
    TokenLength(usize),

    /// Message type outside 0..=3
    #[error("unknown type {0}")]
    Type(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Option delta or length uses the reserved nibble 15
    #[error("malformed option")]
    Option,

    /// Payload marker present but no payload follows
    #[error("empty payload after marker")]
    EmptyPayload,

    /// An empty message (code 0.00) carries token, options or payload
    #[error("empty message with content")]
    NonEmptyEmpty,

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,
}
