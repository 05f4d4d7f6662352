use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

use crate::config::HashLength;

/// Fixed-width hash of arbitrary content, used to address hash lookup entries.
pub trait ContentHash: Send + Sync {
    /// Width of every hash this function produces.
    fn width(&self) -> usize;

    /// Appends the hash of `content` to `out`.
    fn hash_into(&self, content: &[u8], out: &mut Vec<u8>);

    fn hash(&self, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width());
        self.hash_into(content, &mut out);
        out
    }
}

/// xxh3 content hash truncated to the configured width.
#[derive(Clone, Copy)]
pub struct Hasher {
    length: HashLength,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({:?})", self.length)
    }
}

impl Hasher {
    pub fn new(length: HashLength) -> Self {
        Self { length }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(HashLength::Long)
    }
}

impl ContentHash for Hasher {
    fn width(&self) -> usize {
        self.length.bytes()
    }

    fn hash_into(&self, content: &[u8], out: &mut Vec<u8>) {
        let hash = xxh3_64(content);
        match self.length {
            HashLength::Integer => out.extend_from_slice(&(hash as u32).to_be_bytes()),
            HashLength::Long => out.extend_from_slice(&hash.to_be_bytes()),
        }
    }
}
