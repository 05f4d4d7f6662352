//! Projection of sessions onto named field slots for predicate evaluation.

use std::fmt;

use chrono::{DateTime, Utc};

use super::Val;

pub const KEY: &str = "Key";
pub const START: &str = "Start";
pub const END: &str = "End";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Key,
    Start,
    End,
}

impl SessionField {
    pub fn name(&self) -> &'static str {
        match self {
            SessionField::Key => KEY,
            SessionField::Start => START,
            SessionField::End => END,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            KEY => Some(SessionField::Key),
            START => Some(SessionField::Start),
            END => Some(SessionField::End),
            _ => None,
        }
    }
}

/// Value in one field slot.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Value(Val),
    Time(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_val(&self) -> Option<&Val> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Value(v) => write!(f, "{}", v),
            FieldValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

/// Ordered field names a caller wants populated, one slot per name.
///
/// Names that sessions do not expose are kept and always read as null.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    names: Vec<String>,
    fields: Vec<Option<SessionField>>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key, start and end, in that order.
    pub fn session() -> Self {
        let mut index = Self::new();
        for field in [SessionField::Key, SessionField::Start, SessionField::End] {
            index.create(field.name());
        }
        index
    }

    /// Position of `name`, adding a slot for it if needed.
    pub fn create(&mut self, name: &str) -> usize {
        if let Some(pos) = self.pos(name) {
            return pos;
        }
        self.names.push(name.to_string());
        self.fields.push(SessionField::from_name(name));
        self.names.len() - 1
    }

    pub fn pos(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Values for each slot, in index order.
    pub fn project(&self, key: &Val, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<FieldValue> {
        self.fields
            .iter()
            .map(|field| match field {
                Some(SessionField::Key) => FieldValue::Value(key.clone()),
                Some(SessionField::Start) => FieldValue::Time(start),
                Some(SessionField::End) => FieldValue::Time(end),
                None => FieldValue::Null,
            })
            .collect()
    }

    /// Overwrites the start and end slots of projected `values`.
    pub fn set_interval(&self, values: &mut [FieldValue], start: DateTime<Utc>, end: DateTime<Utc>) {
        for (field, value) in self.fields.iter().zip(values.iter_mut()) {
            match field {
                Some(SessionField::Start) => *value = FieldValue::Time(start),
                Some(SessionField::End) => *value = FieldValue::Time(end),
                _ => {}
            }
        }
    }
}

/// A compiled condition over projected field values.
pub trait Predicate {
    fn test(&self, values: &[FieldValue]) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&[FieldValue]) -> bool,
{
    fn test(&self, values: &[FieldValue]) -> bool {
        self(values)
    }
}
