//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a two-state
//! machine for fragmented frames:
//! - `WaitingForLen`: need the 4-byte length prefix
//! - `WaitingForFrame`: prefix parsed, need N more frame bytes
//!
//! # Example
//!
//! ```ignore
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! let packets = buffer.push(&chunk)?;
//! for pkt in packets {
//!     println!("seq {} uri {}", pkt.seq(), pkt.uri());
//! }
//! ```

use bytes::{Buf, BytesMut};

use crate::codec::BodyCodec;
use crate::error::{Error, Result};

use super::packet::Packet;
use super::wire_format::{read_limit, Header, LEN_PREFIX_SIZE};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete length prefix.
    WaitingForLen,
    /// Prefix parsed, waiting for the rest of the frame.
    WaitingForFrame { frame_len: usize },
}

/// Buffer accumulating incoming bytes and extracting complete packets.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Packet size upper limit, captured at construction.
    limit: u32,
}

impl FrameBuffer {
    /// Create a frame buffer bounded by the process-wide read limit.
    pub fn new() -> Self {
        Self::with_read_limit(read_limit())
    }

    /// Create a frame buffer with an explicit packet size limit.
    pub fn with_read_limit(limit: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLen,
            limit,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial data is retained for the next push.
    ///
    /// # Errors
    ///
    /// `Error::Protocol` on an oversized frame, an unknown header codec id,
    /// a truncated header, or a header that fails to decode. All of these
    /// poison the stream; the caller must close the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(pkt) = self.try_extract_one()? {
            packets.push(pkt);
        }
        Ok(packets)
    }

    fn try_extract_one(&mut self) -> Result<Option<Packet>> {
        match self.state {
            State::WaitingForLen => {
                if self.buffer.len() < LEN_PREFIX_SIZE {
                    return Ok(None);
                }
                let frame_len =
                    u32::from_be_bytes(self.buffer[..LEN_PREFIX_SIZE].try_into().unwrap());

                if frame_len as u64 + LEN_PREFIX_SIZE as u64 > self.limit as u64 {
                    return Err(Error::Protocol(format!(
                        "packet size {} exceeds limit {}",
                        frame_len as u64 + LEN_PREFIX_SIZE as u64,
                        self.limit
                    )));
                }
                // A frame must at least hold header_len + codec id.
                if frame_len < 3 {
                    return Err(Error::Protocol(format!("runt frame of {} bytes", frame_len)));
                }

                self.buffer.advance(LEN_PREFIX_SIZE);
                self.state = State::WaitingForFrame {
                    frame_len: frame_len as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForFrame { frame_len } => {
                if self.buffer.len() < frame_len {
                    return Ok(None);
                }

                let mut frame = self.buffer.split_to(frame_len);
                self.state = State::WaitingForLen;

                let header_len = u16::from_be_bytes(frame[..2].try_into().unwrap()) as usize;
                let codec_id = frame[2];
                frame.advance(3);

                if frame.len() < header_len {
                    return Err(Error::Protocol(format!(
                        "header length {} exceeds frame remainder {}",
                        header_len,
                        frame.len()
                    )));
                }

                let header_codec = BodyCodec::from_id(codec_id).ok_or_else(|| {
                    Error::Protocol(format!("unknown header codec id {}", codec_id))
                })?;

                let header_bytes = frame.split_to(header_len);
                let header: Header = header_codec.decode(&header_bytes)?;
                let body = frame.freeze();

                Ok(Some(Packet::new(header, header_codec, body)))
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
