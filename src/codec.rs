//! MsgPack codec using `rmp-serde`.
//!
//! Everything on the bus is MessagePack. Structs are encoded as maps
//! (`to_vec_named`), never as positional arrays: peers resolve record
//! fields by name, and call arguments are already positional at the
//! tuple layer (see [`Tuple`](crate::protocol::Tuple)), so the base
//! format stays fully self-describing.

use crate::error::Result;

/// MessagePack codec for wire records and individual tuple elements.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, structs as maps.
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
