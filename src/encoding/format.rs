//! Formats raw keys and values for log and error messages.

use itertools::Itertools as _;

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }

    /// Formats bytes as space separated hex pairs.
    pub fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).join(" ")
    }
}
