//! Protocol module - wire format, framing, and the in-memory packet.
//!
//! This module implements the framing for one connection:
//! - length-prefixed frame layout with a codec-encoded header
//! - [`FrameBuffer`] accumulating partial reads into complete packets
//! - [`Packet`] and [`Header`] carrying one message in memory

mod frame_buffer;
mod packet;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use packet::Packet;
pub use wire_format::{
    encode_frame, read_limit, set_read_limit, Header, Kind, DEFAULT_READ_LIMIT, LEN_PREFIX_SIZE,
};
