//! Wire format encoding and decoding.
//!
//! A frame is a length-prefixed header followed by the body bytes:
//!
//! ```text
//! ┌───────────┬────────────┬──────────────┬──────────────┬───────────┐
//! │ frame len │ header len │ header codec │ header bytes │ body      │
//! │ u32 BE    │ u16 BE     │ 1 byte (id)  │ (per codec)  │ bytes     │
//! └───────────┴────────────┴──────────────┴──────────────┴───────────┘
//! ```
//!
//! `frame len` counts everything after itself. The header struct is
//! serialized with the body codec named by the one-byte codec id (default
//! json); body bytes are opaque here - transfer filters and the body codec
//! operate on them at the session/handler seam.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::codec::BodyCodec;
use crate::error::{Error, Result};

/// Size of the frame length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default packet size upper limit (8 MiB).
pub const DEFAULT_READ_LIMIT: u32 = 8 * 1024 * 1024;

static READ_LIMIT: AtomicU32 = AtomicU32::new(DEFAULT_READ_LIMIT);

/// Get the process-wide packet size upper limit.
#[inline]
pub fn read_limit() -> u32 {
    READ_LIMIT.load(Ordering::Relaxed)
}

/// Set the process-wide packet size upper limit.
///
/// Zero means unlimited (`u32::MAX`). Set before constructing peers; frames
/// already in flight are bounded by the value at read time.
pub fn set_read_limit(max_packet_size: u32) {
    let limit = if max_packet_size == 0 {
        u32::MAX
    } else {
        max_packet_size
    };
    READ_LIMIT.store(limit, Ordering::Relaxed);
}

/// Packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Request expecting a correlated REPLY.
    Pull = 1,
    /// One-way notification.
    Push = 2,
    /// Answer to a PULL, correlated by sequence.
    Reply = 3,
}

impl Kind {
    /// Decode the wire byte; `None` for an unsupported kind.
    pub fn from_u8(b: u8) -> Option<Kind> {
        match b {
            1 => Some(Kind::Pull),
            2 => Some(Kind::Push),
            3 => Some(Kind::Reply),
            _ => None,
        }
    }
}

/// Packet header.
///
/// Separable from the body so routing and authorization can run before the
/// body bytes are decoded. `kind` stays a raw byte here; an unsupported
/// value is a session-level decision, not a framing error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Sequence number, monotonic per session per direction.
    pub seq: u32,
    /// Packet kind byte; see [`Kind`].
    pub kind: u8,
    /// Absolute path plus optional query, e.g. `/math/add?verbose=yes`.
    pub uri: String,
    /// Body codec name, e.g. "json".
    #[serde(default)]
    pub body_codec: String,
    /// Ordered transfer-filter id stack; outbound order, inbound unwinds
    /// in reverse.
    #[serde(default)]
    pub xfer: Vec<u8>,
    /// REPLY status code; zero on PULL/PUSH.
    #[serde(default)]
    pub status_code: u16,
    /// REPLY status text; empty on PULL/PUSH.
    #[serde(default)]
    pub status: String,
}

impl Header {
    /// Create a PULL header.
    pub fn new_pull(seq: u32, uri: impl Into<String>, body_codec: BodyCodec, xfer: Vec<u8>) -> Self {
        Self {
            seq,
            kind: Kind::Pull as u8,
            uri: uri.into(),
            body_codec: body_codec.name().to_string(),
            xfer,
            status_code: 0,
            status: String::new(),
        }
    }

    /// Create a PUSH header.
    pub fn new_push(seq: u32, uri: impl Into<String>, body_codec: BodyCodec, xfer: Vec<u8>) -> Self {
        Self {
            kind: Kind::Push as u8,
            ..Self::new_pull(seq, uri, body_codec, xfer)
        }
    }

    /// Create the REPLY header answering a PULL: same seq, uri and filter
    /// stack; status fields start empty and are set during handling.
    pub fn reply_to(pull: &Header) -> Self {
        Self {
            seq: pull.seq,
            kind: Kind::Reply as u8,
            uri: pull.uri.clone(),
            body_codec: pull.body_codec.clone(),
            xfer: pull.xfer.clone(),
            status_code: 0,
            status: String::new(),
        }
    }

    /// Typed kind; `None` when the wire byte is unsupported.
    #[inline]
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_u8(self.kind)
    }

    /// URI split at the query separator: (path, raw query).
    pub fn split_uri(&self) -> (&str, &str) {
        match self.uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (self.uri.as_str(), ""),
        }
    }
}

/// Encode a complete frame: length prefix, header, body.
///
/// # Errors
///
/// `Error::Protocol` when the header overflows its u16 length field or the
/// frame exceeds the process-wide read limit.
pub fn encode_frame(header: &Header, header_codec: BodyCodec, body: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = header_codec.encode(header)?;
    if header_bytes.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "header size {} exceeds maximum {}",
            header_bytes.len(),
            u16::MAX
        )));
    }

    let frame_len = 2 + 1 + header_bytes.len() + body.len();
    if frame_len as u64 + LEN_PREFIX_SIZE as u64 > read_limit() as u64 {
        return Err(Error::Protocol(format!(
            "packet size {} exceeds limit {}",
            frame_len + LEN_PREFIX_SIZE,
            read_limit()
        )));
    }

    let mut buf = Vec::with_capacity(LEN_PREFIX_SIZE + frame_len);
    buf.extend_from_slice(&(frame_len as u32).to_be_bytes());
    buf.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    buf.push(header_codec.id());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(body);
    Ok(buf)
}
