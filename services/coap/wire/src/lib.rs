//! Message entity, header and option encoding/decoding for CoAP over UDP.
//!
//! This crate provides the low-level wire protocol implementation used by the
//! session engine: the fixed header, tokens, delta-encoded options and the
//! payload, encoded into and decoded from single datagrams.
//!
//! ## Wire Format
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{
    decode_options, encode_options, media_type, option_number, CoapOption, MessageBuilder,
    Options,
};
pub use error::WireError;
pub use header::{Code, Header, MessageType, HEADER_SIZE, MAX_TOKEN_LEN, WIRE_VERSION};
pub use message::{Message, DEFAULT_MAX_MESSAGE_SIZE, PAYLOAD_MARKER};
