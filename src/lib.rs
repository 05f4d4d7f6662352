pub mod cancel;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod kv;
pub mod lookup;
pub mod session;

pub use cancel::Cancellation;
pub use config::{CommitConfig, HashLength, KeyType, SessionConfig, TemporalPrecision};
pub use error::{Error, Result};
pub use hasher::{ContentHash, Hasher};
pub use session::{
    FieldIndex, FieldValue, Predicate, SearchMatch, Session, SessionStore, SessionWriter, Val,
};
