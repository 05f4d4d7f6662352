use super::EncodingError;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Encodes store metadata with bincode.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Decodes store metadata written by [`serialize`].
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)).into())
}
