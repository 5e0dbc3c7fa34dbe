//! Error types and wire status codes.
//!
//! Two error layers exist side by side:
//!
//! - [`WireError`] - a status code plus text that travels in REPLY headers
//!   and is surfaced to pull callers. Handlers and plugins return it.
//! - [`Error`] - the local error type for everything that never crosses the
//!   wire: I/O failures, codec failures, configuration and route
//!   registration mistakes.

use thiserror::Error;

/// Wire status code carried in REPLY headers.
///
/// The numbering is fixed here and nowhere else; both sides of a connection
/// agree on it by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    /// The peer closed the connection before the reply arrived.
    pub const CONN_CLOSED: Status = Status(102);
    /// Writing the packet onto the socket failed.
    pub const WRITE_FAILED: Status = Status(104);
    /// The packet could not be decoded (bad filter id, bad body bytes).
    pub const BAD_PACKET: Status = Status(112);
    /// Success.
    pub const OK: Status = Status(200);
    /// The packet URI did not parse.
    pub const BAD_URI: Status = Status(400);
    /// No handler is registered for the path and no unknown handler exists.
    pub const NOT_FOUND: Status = Status(404);
    /// The pull deadline expired before a reply arrived.
    pub const DEADLINE_EXCEEDED: Status = Status(408);
    /// The packet kind is not one of PULL, PUSH, REPLY.
    pub const UNSUPPORTED_TX: Status = Status(415);
    /// The handler panicked or failed internally.
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);

    /// Human-readable text for the status.
    pub fn text(self) -> &'static str {
        match self {
            Status::CONN_CLOSED => "connection closed",
            Status::WRITE_FAILED => "write failed",
            Status::BAD_PACKET => "bad packet",
            Status::OK => "ok",
            Status::BAD_URI => "bad uri",
            Status::NOT_FOUND => "not found",
            Status::DEADLINE_EXCEEDED => "deadline exceeded",
            Status::UNSUPPORTED_TX => "unsupported transfer",
            Status::INTERNAL_SERVER_ERROR => "internal server error",
            _ => "unknown status",
        }
    }

    /// Numeric code.
    #[inline]
    pub fn code(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.text())
    }
}

/// An error that travels on the wire: REPLY status code + text, with an
/// optional cause folded into the text when present.
///
/// Returned by handlers and plugin hooks; surfaced to pull callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    code: u16,
    text: String,
}

impl WireError {
    /// Create a wire error from a status, using its canonical text.
    pub fn new(status: Status) -> Self {
        Self {
            code: status.code(),
            text: status.text().to_string(),
        }
    }

    /// Create a wire error with custom text.
    pub fn with_text(status: Status, text: impl Into<String>) -> Self {
        Self {
            code: status.code(),
            text: text.into(),
        }
    }

    /// Create a wire error from a status and an underlying cause.
    pub fn with_cause(status: Status, cause: impl std::fmt::Display) -> Self {
        Self {
            code: status.code(),
            text: format!("{}: {}", status.text(), cause),
        }
    }

    /// Reconstruct a wire error from REPLY header status fields.
    pub fn from_header(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Status code.
    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Status text.
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this error carries the given status code.
    #[inline]
    pub fn is(&self, status: Status) -> bool {
        self.code == status.code()
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

impl std::error::Error for WireError {}

/// Local error type for all peerwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, oversized packet, unknown codec).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid peer configuration, detected at `Peer::new`.
    #[error("Config error: {0}")]
    Config(String),

    /// Route registration error (duplicate path, bad prefix).
    #[error("Route error: {0}")]
    Route(String),

    /// The session is not open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An error received from or destined for the remote peer.
    #[error("Wire error: {0}")]
    Wire(WireError),
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Wire(e)
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        assert_eq!(Status::OK.text(), "ok");
        assert_eq!(Status::NOT_FOUND.text(), "not found");
        assert_eq!(Status::CONN_CLOSED.text(), "connection closed");
        assert_eq!(Status(999).text(), "unknown status");
    }

    #[test]
    fn test_status_codes_distinct() {
        let codes = [
            Status::CONN_CLOSED,
            Status::WRITE_FAILED,
            Status::BAD_PACKET,
            Status::OK,
            Status::BAD_URI,
            Status::NOT_FOUND,
            Status::DEADLINE_EXCEEDED,
            Status::UNSUPPORTED_TX,
            Status::INTERNAL_SERVER_ERROR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for (j, b) in codes.iter().enumerate() {
                if i != j {
                    assert_ne!(a.code(), b.code());
                }
            }
        }
    }

    #[test]
    fn test_wire_error_new_uses_canonical_text() {
        let e = WireError::new(Status::NOT_FOUND);
        assert_eq!(e.code(), 404);
        assert_eq!(e.text(), "not found");
        assert!(e.is(Status::NOT_FOUND));
    }

    #[test]
    fn test_wire_error_with_cause_appends() {
        let e = WireError::with_cause(Status::BAD_PACKET, "gzip header missing");
        assert_eq!(e.code(), 112);
        assert_eq!(e.text(), "bad packet: gzip header missing");
    }

    #[test]
    fn test_wire_error_header_roundtrip() {
        let e = WireError::with_text(Status::INTERNAL_SERVER_ERROR, "boom");
        let back = WireError::from_header(e.code(), e.text());
        assert_eq!(back, e);
    }

    #[test]
    fn test_error_from_wire_error() {
        let err: Error = WireError::new(Status::CONN_CLOSED).into();
        assert!(matches!(err, Error::Wire(ref w) if w.is(Status::CONN_CLOSED)));
    }
}
