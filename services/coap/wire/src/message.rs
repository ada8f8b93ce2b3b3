//! Message framing for the wire protocol.
//!
//! This module provides the complete message structure (fixed header, token,
//! delta-encoded options and payload) and its datagram encoding.

use crate::codec::{decode_options, encode_options, option_number, CoapOption, Options};
use crate::header::{Code, Header, MessageType, HEADER_SIZE, MAX_TOKEN_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum datagram size accepted or produced by default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 - 1;

/// Marker separating options from the payload
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Complete wire message
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub typ: MessageType,
    /// Request method or response code
    pub code: Code,
    /// Message id used for deduplication and ACK matching
    pub message_id: u16,
    /// Correlates a response with its request, independent of the message id
    pub token: Bytes,
    /// Options ordered by number
    pub options: Options,
    /// Payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message without token, options or payload
    pub fn new(typ: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            typ,
            code,
            message_id,
            token: Bytes::new(),
            options: Options::new(),
            payload: Bytes::new(),
        }
    }

    /// Create an empty message (code 0.00): ping, empty ACK or reset
    pub fn empty(typ: MessageType, message_id: u16) -> Self {
        Self::new(typ, Code::EMPTY, message_id)
    }

    /// Whether this is an empty message
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Whether the message requires an acknowledgment
    pub fn is_confirmable(&self) -> bool {
        self.typ == MessageType::Confirmable
    }

    /// Clear all fields so the message can be reused
    pub fn reset(&mut self) {
        self.typ = MessageType::NonConfirmable;
        self.code = Code::EMPTY;
        self.message_id = 0;
        self.token = Bytes::new();
        self.options.clear();
        self.payload = Bytes::new();
    }

    /// First value of an option
    pub fn option(&self, number: u16) -> Option<&Bytes> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| &o.value)
    }

    /// All values of a repeatable option, in order
    pub fn options_by(&self, number: u16) -> impl Iterator<Item = &Bytes> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| &o.value)
    }

    /// Append an option, keeping the list ordered by number
    pub fn add_option(&mut self, number: u16, value: impl Into<Bytes>) {
        let pos = self
            .options
            .iter()
            .position(|o| o.number > number)
            .unwrap_or(self.options.len());
        self.options.insert(
            pos,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    /// Replace every value of an option with a single one
    pub fn set_option(&mut self, number: u16, value: impl Into<Bytes>) {
        self.remove_option(number);
        self.add_option(number, value);
    }

    /// Remove every value of an option
    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    /// Uri-Path segments joined with `/`, always starting with `/`
    pub fn path(&self) -> String {
        let mut path = String::new();
        for segment in self.options_by(option_number::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Replace the Uri-Path options with the segments of `path`
    pub fn set_path(&mut self, path: &str) {
        self.remove_option(option_number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(
                option_number::URI_PATH,
                Bytes::copy_from_slice(segment.as_bytes()),
            );
        }
    }

    /// Content-Format option value
    pub fn content_format(&self) -> Option<u16> {
        self.option(option_number::CONTENT_FORMAT).map(|v| {
            v.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32) as u16
        })
    }

    /// Set the Content-Format option (minimal length uint encoding)
    pub fn set_content_format(&mut self, format: u16) {
        let value = match format {
            0 => Bytes::new(),
            1..=0xFF => Bytes::copy_from_slice(&[format as u8]),
            _ => Bytes::copy_from_slice(&format.to_be_bytes()),
        };
        self.set_option(option_number::CONTENT_FORMAT, value);
    }

    /// Get the total message size when encoded
    pub fn encoded_size(&self) -> usize {
        let mut size = HEADER_SIZE + self.token.len();
        let mut prev = 0u16;
        for opt in self.options.iter() {
            size += 1
                + ext_len(opt.number.saturating_sub(prev) as usize)
                + ext_len(opt.value.len())
                + opt.value.len();
            prev = opt.number;
        }
        if !self.payload.is_empty() {
            size += 1 + self.payload.len();
        }
        size
    }

    /// Encode the message to a datagram
    pub fn encode(&self, max_size: usize) -> Result<Bytes, crate::WireError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(crate::WireError::TokenLength(self.token.len()));
        }
        if self.is_empty()
            && (!self.token.is_empty() || !self.options.is_empty() || !self.payload.is_empty())
        {
            return Err(crate::WireError::NonEmptyEmpty);
        }

        let total_size = self.encoded_size();
        if total_size > max_size {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        Header::new(self.typ, self.code, self.message_id, self.token.len() as u8)
            .encode(&mut buf);
        buf.put_slice(&self.token);
        encode_options(&self.options, &mut buf)?;

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    /// Decode a datagram into a new message
    pub fn decode(datagram: Bytes) -> Result<Self, crate::WireError> {
        let mut msg = Message::empty(MessageType::NonConfirmable, 0);
        msg.decode_into(datagram)?;
        Ok(msg)
    }

    /// Decode a datagram into this message, reusing its option storage.
    ///
    /// Token and payload are zero-copy slices of `datagram`.
    pub fn decode_into(&mut self, datagram: Bytes) -> Result<(), crate::WireError> {
        let mut cursor = &datagram[..];
        let header = Header::decode(&mut cursor)?;

        let token_len = header.token_len as usize;
        if cursor.len() < token_len {
            return Err(crate::WireError::Malformed);
        }
        let token = datagram.slice(HEADER_SIZE..HEADER_SIZE + token_len);

        let body_start = HEADER_SIZE + token_len;
        self.options.clear();
        let payload_start = decode_options(&datagram[body_start..], &mut self.options)?;
        let payload = match payload_start {
            Some(offset) => datagram.slice(body_start + offset..),
            None => Bytes::new(),
        };

        if header.code.is_empty()
            && (token_len != 0 || !self.options.is_empty() || !payload.is_empty())
        {
            return Err(crate::WireError::NonEmptyEmpty);
        }

        self.typ = header.typ;
        self.code = header.code;
        self.message_id = header.message_id;
        self.token = token;
        self.payload = payload;
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("typ", &self.typ)
            .field("code", &format_args!("{}", self.code))
            .field("message_id", &self.message_id)
            .field("token", &format_args!("{:02x?}", &self.token[..]))
            .field("options", &self.options.len())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Extended-length bytes needed for an option delta or length
fn ext_len(v: usize) -> usize {
    match v {
        0..=12 => 0,
        13..=268 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::media_type;

    #[test]
    fn test_empty_message_is_four_bytes() {
        let ping = Message::empty(MessageType::Confirmable, 0x1234);
        let bytes = ping.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(&bytes[..], &[0x40, 0x00, 0x12, 0x34]);

        let decoded = Message::decode(bytes).unwrap();
        assert_eq!(decoded, ping);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_request_with_options_and_payload() {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST, 7);
        msg.token = Bytes::from_static(&[1, 2, 3, 4]);
        msg.set_path("/oic/res");
        msg.set_content_format(media_type::APP_JSON);
        msg.payload = Bytes::from_static(b"{\"a\":1}");

        let bytes = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(bytes.len(), msg.encoded_size());

        let decoded = Message::decode(bytes).unwrap();
        assert_eq!(decoded.path(), "/oic/res");
        assert_eq!(decoded.content_format(), Some(media_type::APP_JSON));
        assert_eq!(decoded.token, msg.token);
        assert_eq!(&decoded.payload[..], b"{\"a\":1}");
    }

    #[test]
    fn test_long_option_values_use_extended_lengths() {
        let mut msg = Message::new(MessageType::NonConfirmable, Code::GET, 1);
        let segment = "x".repeat(300);
        msg.set_path(&format!("/{}/y", segment));
        msg.add_option(option_number::URI_QUERY, Bytes::from_static(b"q=1"));

        let bytes = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let decoded = Message::decode(bytes).unwrap();
        assert_eq!(decoded.path(), format!("/{}/y", segment));
        assert_eq!(
            decoded.option(option_number::URI_QUERY).map(|v| &v[..]),
            Some(&b"q=1"[..])
        );
    }

    #[test]
    fn test_size_limit() {
        let mut msg = Message::new(MessageType::NonConfirmable, Code::CONTENT, 1);
        msg.payload = Bytes::from(vec![0u8; 2048]);
        assert!(matches!(
            msg.encode(1024),
            Err(crate::WireError::Size(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_datagrams() {
        // empty message with a token
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0x41, 0x00, 0x00, 0x01, 0xAA])),
            Err(crate::WireError::NonEmptyEmpty)
        ));
        // token truncated
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0x44, 0x01, 0x00, 0x01, 0xAA])),
            Err(crate::WireError::Malformed)
        ));
        // payload marker without payload
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0x40, 0x01, 0x00, 0x01, 0xFF])),
            Err(crate::WireError::EmptyPayload)
        ));
        // reserved option nibble
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0x40, 0x01, 0x00, 0x01, 0xF1, 0x00])),
            Err(crate::WireError::Option)
        ));
    }

    #[test]
    fn test_decode_into_reuses_message() {
        let mut first = Message::new(MessageType::Confirmable, Code::GET, 10);
        first.set_path("/a/b/c");
        let mut second = Message::new(MessageType::Acknowledgement, Code::CONTENT, 10);
        second.payload = Bytes::from_static(b"ok");

        let mut reused = Message::decode(first.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap()).unwrap();
        assert_eq!(reused.options.len(), 3);

        reused
            .decode_into(second.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap())
            .unwrap();
        assert_eq!(reused, second);
    }
}
