//! # Serializer Contract
//!
//! Storage engines persist headers, event lists and snapshot payloads as
//! bytes. They do so through a [`Serializer`] so the wire format stays
//! swappable. Values cross the trait as `serde_json::Value`, which keeps the
//! trait object-safe (engines hold an `Arc<dyn Serializer>`) while still
//! round-tripping nulls, numbers and nested objects.
//!
//! Typed helpers ([`serialize_value`], [`deserialize_value`]) convert any
//! serde type to and from bytes through a serializer.

use serde::de::DeserializeOwned;

use crate::error::Result;

/// Turns values into bytes and back.
pub trait Serializer: Send + Sync {
    /// Encodes a value.
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decodes a value previously produced by [`Serializer::serialize`].
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Encodes values as compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serializes any serde type through `serializer`.
pub fn serialize_value<T: serde::Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    serializer.serialize(&value)
}

/// Deserializes any serde type through `serializer`.
pub fn deserialize_value<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T> {
    let value = serializer.deserialize(bytes)?;
    Ok(serde_json::from_value(value)?)
}
