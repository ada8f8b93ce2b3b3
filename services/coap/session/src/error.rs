//! Session error types.

use coap_wire::WireError;
use thiserror::Error;

/// Errors surfaced by connections, the server and the client
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket failure; fatal to the serve loop
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Encoding or decoding failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Retransmission exhausted without acknowledgment
    #[error("delivery failed after {attempts} attempts")]
    DeliveryFailed {
        /// Number of transmissions performed
        attempts: u32,
    },

    /// The peer answered with a reset
    #[error("peer reset the exchange")]
    PeerReset,

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Operation on, or interrupted by, a closed connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Another exchange is pending under the same token
    #[error("token already in use by a pending exchange")]
    TokenInUse,

    /// A confirmable message with this id is still awaiting acknowledgment
    #[error("message id {0} is already in flight")]
    MessageIdInUse(u16),

    /// The server has been stopped
    #[error("server stopped")]
    ServerStopped,

    /// The server has no listener yet
    #[error("server is not serving")]
    NotServing,

    /// `serve` called while another listener is active
    #[error("server is already serving")]
    AlreadyServing,

    /// Address could not be parsed or resolved
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl SessionError {
    /// Whether the error was caused by the caller's context ending
    pub fn is_context_error(&self) -> bool {
        matches!(self, SessionError::Cancelled | SessionError::DeadlineExceeded)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SessionError>;
