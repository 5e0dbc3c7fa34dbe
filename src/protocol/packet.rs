//! The in-memory packet: header plus raw body bytes.
//!
//! Inbound, the body is the on-wire bytes after framing and before
//! transfer-filter unwinding; typed decoding happens at the handler or
//! pull-caller seam. Uses `bytes::Bytes` so the body shares the read
//! buffer without copying.

use bytes::Bytes;

use crate::codec::BodyCodec;

use super::wire_format::{Header, Kind};

/// A single message reconstructed from (or destined for) the wire.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Decoded header.
    pub header: Header,
    /// Codec the header itself was (or will be) encoded with.
    pub header_codec: BodyCodec,
    /// Raw body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Packet {
    /// Create a packet from parts.
    pub fn new(header: Header, header_codec: BodyCodec, body: Bytes) -> Self {
        Self {
            header,
            header_codec,
            body,
        }
    }

    /// Sequence number.
    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Typed kind; `None` when the wire byte is unsupported.
    #[inline]
    pub fn kind(&self) -> Option<Kind> {
        self.header.kind()
    }

    /// Packet URI.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.header.uri
    }

    /// Body length in bytes.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}
