//! MessagePack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps (with field names)
//! rather than positional arrays; peers written against self-describing
//! msgpack decoders interoperate without schema coordination.

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, struct-as-map format.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_as_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // fixmap marker (0x8X), not fixarray (0x9X)
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_encode_decode_option() {
        let some_val: Option<i32> = Some(42);
        let encoded = MsgPackCodec::encode(&some_val).unwrap();
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, some_val);

        let none_val: Option<i32> = None;
        let encoded = MsgPackCodec::encode(&none_val).unwrap();
        assert_eq!(encoded, vec![0xc0]);
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, none_val);
    }

    #[test]
    fn test_encode_decode_nested() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Inner {
            value: i32,
        }

        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Outer {
            inner: Inner,
            items: Vec<String>,
        }

        let original = Outer {
            inner: Inner { value: 999 },
            items: vec!["a".to_string(), "b".to_string()],
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Outer = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }
}
