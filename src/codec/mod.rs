//! Body codecs - serialization between typed values and packet body bytes.
//!
//! A codec is identified two ways:
//!
//! - by **name** (short string, e.g. `"json"`) in packet headers and
//!   configuration;
//! - by **id** (one byte) where the wire needs a codec marker before any
//!   codec-encoded bytes exist (the header-codec byte of a frame).
//!
//! Codecs are marker structs with static methods rather than trait objects;
//! encode/decode monomorphize at the call site and [`BodyCodec`] is the
//! registry resolving names and ids. Adding a codec is an init-time act:
//! a new variant plus a marker struct, no per-call reflection.
//!
//! # Example
//!
//! ```
//! use peerwire::codec::BodyCodec;
//!
//! let codec = BodyCodec::from_name("json").unwrap();
//! let bytes = codec.encode(&vec![1, 2, 3]).unwrap();
//! let back: Vec<i32> = codec.decode(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::Result;

/// A registered body codec, resolvable by name or one-byte id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BodyCodec {
    /// JSON via serde_json. The default codec.
    Json = b'j',
    /// MessagePack via rmp-serde, struct-as-map format.
    MsgPack = b'm',
}

impl BodyCodec {
    /// All registered codecs.
    pub const ALL: &'static [BodyCodec] = &[BodyCodec::Json, BodyCodec::MsgPack];

    /// One-byte wire id.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Short registry name.
    pub fn name(self) -> &'static str {
        match self {
            BodyCodec::Json => "json",
            BodyCodec::MsgPack => "msgpack",
        }
    }

    /// Resolve a codec by registry name.
    pub fn from_name(name: &str) -> Option<BodyCodec> {
        match name {
            "json" => Some(BodyCodec::Json),
            "msgpack" => Some(BodyCodec::MsgPack),
            _ => None,
        }
    }

    /// Resolve a codec by one-byte wire id.
    pub fn from_id(id: u8) -> Option<BodyCodec> {
        match id {
            b'j' => Some(BodyCodec::Json),
            b'm' => Some(BodyCodec::MsgPack),
            _ => None,
        }
    }

    /// Encode a value to bytes.
    pub fn encode<T: serde::Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            BodyCodec::Json => JsonCodec::encode(value),
            BodyCodec::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode bytes to a value.
    pub fn decode<T: serde::de::DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            BodyCodec::Json => JsonCodec::decode(bytes),
            BodyCodec::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_id_resolution() {
        for &codec in BodyCodec::ALL {
            assert_eq!(BodyCodec::from_name(codec.name()), Some(codec));
            assert_eq!(BodyCodec::from_id(codec.id()), Some(codec));
        }
        assert_eq!(BodyCodec::from_name("protobuf"), None);
        assert_eq!(BodyCodec::from_id(b'x'), None);
    }

    #[test]
    fn test_ids_distinct() {
        assert_ne!(BodyCodec::Json.id(), BodyCodec::MsgPack.id());
    }

    #[test]
    fn test_encode_decode_through_registry() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Point {
            x: i32,
            y: i32,
        }

        for &codec in BodyCodec::ALL {
            let p = Point { x: 3, y: -7 };
            let bytes = codec.encode(&p).unwrap();
            let back: Point = codec.decode(&bytes).unwrap();
            assert_eq!(back, p);
        }
    }

    #[test]
    fn test_cross_codec_bytes_differ() {
        let v = vec!["a".to_string(), "b".to_string()];
        let json = BodyCodec::Json.encode(&v).unwrap();
        let msgpack = BodyCodec::MsgPack.encode(&v).unwrap();
        assert_ne!(json, msgpack);
    }
}
