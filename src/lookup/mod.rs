//! Deduplicating lookup tables that stand in for long key content.
//!
//! A session key backed by a lookup table stores a fixed-width surrogate id
//! instead of the content itself. Ids are local to one store.

pub mod hash;
pub mod uid;

pub use hash::HashLookupTable;
pub use uid::UidLookupTable;
