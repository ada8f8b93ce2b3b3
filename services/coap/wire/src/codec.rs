//! Option encoding/decoding and message builders for the wire protocol.
//!
//! Options are carried as (number, opaque value) pairs, delta-encoded on the
//! wire in ascending number order.

use crate::header::{Code, MessageType};
use crate::message::{Message, PAYLOAD_MARKER};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Well-known option numbers
pub mod option_number {
    /// If-Match
    pub const IF_MATCH: u16 = 1;
    /// Uri-Host
    pub const URI_HOST: u16 = 3;
    /// ETag
    pub const ETAG: u16 = 4;
    /// Observe
    pub const OBSERVE: u16 = 6;
    /// Uri-Port
    pub const URI_PORT: u16 = 7;
    /// Location-Path
    pub const LOCATION_PATH: u16 = 8;
    /// Uri-Path, one option per path segment
    pub const URI_PATH: u16 = 11;
    /// Content-Format
    pub const CONTENT_FORMAT: u16 = 12;
    /// Max-Age
    pub const MAX_AGE: u16 = 14;
    /// Uri-Query, one option per query argument
    pub const URI_QUERY: u16 = 15;
    /// Accept
    pub const ACCEPT: u16 = 17;
}

/// Content-Format registry values used by the service
pub mod media_type {
    /// text/plain; charset=utf-8
    pub const TEXT_PLAIN: u16 = 0;
    /// application/link-format
    pub const APP_LINK_FORMAT: u16 = 40;
    /// application/octet-stream
    pub const APP_OCTET_STREAM: u16 = 42;
    /// application/json
    pub const APP_JSON: u16 = 50;
    /// application/cbor
    pub const APP_CBOR: u16 = 60;
}

/// One option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number
    pub number: u16,
    /// Opaque option value
    pub value: Bytes,
}

/// Option list; most messages carry only a handful
pub type Options = SmallVec<[CoapOption; 4]>;

/// Encode options in ascending number order
pub fn encode_options(options: &Options, buf: &mut BytesMut) -> Result<(), crate::WireError> {
    let mut prev = 0u16;
    for opt in options.iter() {
        if opt.number < prev {
            return Err(crate::WireError::Option);
        }
        let delta = (opt.number - prev) as usize;
        let len = opt.value.len();
        if len > u16::MAX as usize + 269 {
            return Err(crate::WireError::Size(len));
        }

        buf.put_u8((nibble(delta) << 4) | nibble(len));
        put_ext(buf, delta);
        put_ext(buf, len);
        buf.put_slice(&opt.value);
        prev = opt.number;
    }
    Ok(())
}

/// Decode options until the payload marker or the end of the buffer.
///
/// Returns the offset of the first payload byte when a payload is present.
pub fn decode_options(
    buf: &[u8],
    options: &mut Options,
) -> Result<Option<usize>, crate::WireError> {
    let mut pos = 0usize;
    let mut number = 0u16;

    while pos < buf.len() {
        let first = buf[pos];
        pos += 1;

        if first == PAYLOAD_MARKER {
            if pos == buf.len() {
                return Err(crate::WireError::EmptyPayload);
            }
            return Ok(Some(pos));
        }

        let delta = read_ext(buf, &mut pos, first >> 4)?;
        let len = read_ext(buf, &mut pos, first & 0x0F)?;

        number = u16::try_from(number as usize + delta).map_err(|_| crate::WireError::Option)?;
        if buf.len() - pos < len {
            return Err(crate::WireError::Malformed);
        }

        options.push(CoapOption {
            number,
            value: Bytes::copy_from_slice(&buf[pos..pos + len]),
        });
        pos += len;
    }

    Ok(None)
}

fn nibble(v: usize) -> u8 {
    match v {
        0..=12 => v as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn put_ext(buf: &mut BytesMut, v: usize) {
    match v {
        0..=12 => {}
        13..=268 => buf.put_u8((v - 13) as u8),
        _ => buf.put_u16((v - 269) as u16),
    }
}

fn read_ext(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<usize, crate::WireError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *buf.get(*pos).ok_or(crate::WireError::Malformed)?;
            *pos += 1;
            Ok(b as usize + 13)
        }
        14 => {
            if buf.len() < *pos + 2 {
                return Err(crate::WireError::Malformed);
            }
            let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
            *pos += 2;
            Ok(v as usize + 269)
        }
        _ => Err(crate::WireError::Option),
    }
}

/// Message builder for constructing requests and responses
#[derive(Debug)]
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new(typ: MessageType, code: Code) -> Self {
        Self {
            msg: Message::new(typ, code, 0),
        }
    }

    /// Confirmable GET for `path`
    pub fn get(path: &str) -> Self {
        Self::new(MessageType::Confirmable, Code::GET).path(path)
    }

    /// Set the message id
    pub fn message_id(mut self, message_id: u16) -> Self {
        self.msg.message_id = message_id;
        self
    }

    /// Set the token
    pub fn token(mut self, token: impl Into<Bytes>) -> Self {
        self.msg.token = token.into();
        self
    }

    /// Set the Uri-Path options
    pub fn path(mut self, path: &str) -> Self {
        self.msg.set_path(path);
        self
    }

    /// Add one Uri-Query option
    pub fn query(mut self, query: &str) -> Self {
        self.msg.add_option(
            option_number::URI_QUERY,
            Bytes::copy_from_slice(query.as_bytes()),
        );
        self
    }

    /// Add an arbitrary option
    pub fn option(mut self, number: u16, value: impl Into<Bytes>) -> Self {
        self.msg.add_option(number, value);
        self
    }

    /// Set the Content-Format option
    pub fn content_format(mut self, format: u16) -> Self {
        self.msg.set_content_format(format);
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.msg.payload = payload.into();
        self
    }

    /// Build the message
    pub fn build(self) -> Message {
        self.msg
    }
}
