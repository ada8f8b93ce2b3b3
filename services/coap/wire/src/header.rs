//! Fixed header processing for the wire protocol.
//!
//! This module defines the 4-byte CoAP header (version, type, token length,
//! code, message id) together with the message type and code enumerations.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum token length in bytes
pub const MAX_TOKEN_LEN: usize = 8;

/// Message types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Requires acknowledgment, retransmitted until acked
    Confirmable = 0,
    /// Fire-and-forget
    NonConfirmable = 1,
    /// Acknowledges a confirmable message, may piggyback a response
    Acknowledgement = 2,
    /// Rejects a message the receiver cannot process
    Reset = 3,
}

impl MessageType {
    /// Short name used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Confirmable),
            1 => Ok(MessageType::NonConfirmable),
            2 => Ok(MessageType::Acknowledgement),
            3 => Ok(MessageType::Reset),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Message code, `class.detail` packed into one byte (3 + 5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code(pub u8);

impl Code {
    /// 0.00, used by pings, empty ACKs and resets
    pub const EMPTY: Code = Code::new(0, 0);
    /// 0.01
    pub const GET: Code = Code::new(0, 1);
    /// 0.02
    pub const POST: Code = Code::new(0, 2);
    /// 0.03
    pub const PUT: Code = Code::new(0, 3);
    /// 0.04
    pub const DELETE: Code = Code::new(0, 4);
    /// 2.01
    pub const CREATED: Code = Code::new(2, 1);
    /// 2.02
    pub const DELETED: Code = Code::new(2, 2);
    /// 2.03
    pub const VALID: Code = Code::new(2, 3);
    /// 2.04
    pub const CHANGED: Code = Code::new(2, 4);
    /// 2.05
    pub const CONTENT: Code = Code::new(2, 5);
    /// 4.00
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    /// 4.01
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    /// 4.04
    pub const NOT_FOUND: Code = Code::new(4, 4);
    /// 4.05
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    /// 5.00
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    /// 5.03
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    /// Build a code from its class and detail
    pub const fn new(class: u8, detail: u8) -> Self {
        Code(((class & 0x07) << 5) | (detail & 0x1F))
    }

    /// Code class (0 = request/empty, 2 = success, 4 = client error, 5 = server error)
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Code detail
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// 0.00
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 0.01 ..= 0.31
    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// Classes 2 to 5
    pub fn is_response(self) -> bool {
        (2..=5).contains(&self.class())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Fixed header structure (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Message type
    pub typ: MessageType,
    /// Token length (0..=8)
    pub token_len: u8,
    /// Message code
    pub code: Code,
    /// Message id, peer scoped
    pub message_id: u16,
}

impl Header {
    /// Create a header for the current wire version
    pub fn new(typ: MessageType, code: Code, message_id: u16, token_len: u8) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            token_len,
            code,
            message_id,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.ver << 6) | ((self.typ as u8) << 4) | (self.token_len & 0x0F));
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let first = buf.get_u8();
        let ver = first >> 6;
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = MessageType::try_from((first >> 4) & 0x03)?;
        let token_len = first & 0x0F;
        if token_len as usize > MAX_TOKEN_LEN {
            return Err(crate::WireError::TokenLength(token_len as usize));
        }

        let code = Code(buf.get_u8());
        let message_id = buf.get_u16();

        Ok(Self {
            ver,
            typ,
            token_len,
            code,
            message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0).unwrap(), MessageType::Confirmable);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Reset);
        assert!(MessageType::try_from(4).is_err());
    }

    #[test]
    fn test_code_classes() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert!(Code::GET.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(Code::EMPTY.is_empty());
        assert!(Code::BAD_REQUEST.is_response());
        assert!(!Code::POST.is_response());
        assert_eq!(Code::INTERNAL_SERVER_ERROR.class(), 5);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = Header::new(MessageType::NonConfirmable, Code::CONTENT, 0xBEEF, 4);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[0], 0x54);

        let mut slice = &buf[..];
        let decoded = Header::decode(&mut slice).unwrap();
        assert_eq!(header, decoded);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_header_validation() {
        // version 2
        let mut slice: &[u8] = &[0x80, 0x01, 0x00, 0x01];
        assert!(matches!(
            Header::decode(&mut slice),
            Err(crate::WireError::Version(2))
        ));

        // token length 9
        let mut slice: &[u8] = &[0x49, 0x01, 0x00, 0x01];
        assert!(matches!(
            Header::decode(&mut slice),
            Err(crate::WireError::TokenLength(9))
        ));

        let mut slice: &[u8] = &[0x40, 0x01];
        assert!(matches!(
            Header::decode(&mut slice),
            Err(crate::WireError::Incomplete)
        ));
    }
}
