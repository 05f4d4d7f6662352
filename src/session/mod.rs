//! Sessions and the store that keeps them.

pub mod codec;
pub mod fields;
pub mod store;
pub mod value;

pub use codec::SessionKeyCodec;
pub use fields::{FieldIndex, FieldValue, Predicate, SessionField};
pub use store::{
    CondenseOutcome, MergeOutcome, SchemaInfo, SearchMatch, SearchOutcome, SessionStore,
    SessionWriter,
};
pub use value::{Session, Val};
