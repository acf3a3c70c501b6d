//! Payload serialization for handshake and application messages.
//!
//! The broker itself only needs the codec for one thing: carrying the
//! dedicated endpoint name across the rendezvous pipe as a lossless string.
//! Consumers are free to use the same codec for their own payloads, or to
//! push pre-encoded [`bytes::Bytes`] and bring their own format.
//!
//! # Example
//!
//! ```
//! use pipehub::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hub.sock_1").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hub.sock_1");
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
///
/// Uses `rmp_serde::to_vec_named` so structs serialize as maps (with field
/// names) rather than positional arrays, which keeps payloads readable by
/// MessagePack implementations in other languages.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
