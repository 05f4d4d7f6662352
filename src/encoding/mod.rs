//! Byte encodings for everything the store persists.
//!
//! - [`keycode`]: order-preserving encodings of typed values. Unsigned
//!   byte-wise comparison of an encoding matches the natural ordering of the
//!   value, which is what lets session rows sort by (key, start, end).
//! - [`time`]: instants truncated to a precision and packed into a fixed width.
//! - [`bincode`]: serde encoding for metadata that is never compared.
//! - [`format`]: human readable rendering of raw keys for logs.

pub mod bincode;
pub mod format;
pub mod keycode;
pub mod time;

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    UnsupportedType(String),
    TruncatedData,
    InvalidUtf8,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::UnsupportedType(msg) => write!(f, "Unsupported data type: {}", msg),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::InvalidUtf8 => write!(f, "Invalid UTF-8 sequence"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        match err {
            EncodingError::UnsupportedType(_) => crate::Error::InvalidInput(err.to_string()),
            _ => crate::Error::InvalidData(err.to_string()),
        }
    }
}
