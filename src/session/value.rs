use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::Error;

/// A typed session key.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Val {
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Boolean(_) => "boolean",
            Val::Byte(_) => "byte",
            Val::Short(_) => "short",
            Val::Int(_) => "int",
            Val::Long(_) => "long",
            Val::Float(_) => "float",
            Val::Double(_) => "double",
            Val::String(_) => "string",
        }
    }

    /// Integer view of the value, when it has one without loss.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Val::Byte(v) => Some(*v as i64),
            Val::Short(v) => Some(*v as i64),
            Val::Int(v) => Some(*v as i64),
            Val::Long(v) => Some(*v),
            Val::Float(v) => exact_i64(*v as f64),
            Val::Double(v) => exact_i64(*v),
            Val::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Val::Byte(v) => Some(*v as f64),
            Val::Short(v) => Some(*v as f64),
            Val::Int(v) => Some(*v as f64),
            Val::Long(v) => {
                let f = *v as f64;
                (f as i128 == *v as i128).then_some(f)
            }
            Val::Float(v) => Some(*v as f64),
            Val::Double(v) => Some(*v),
            Val::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Val::Boolean(b) => Some(*b),
            Val::String(s) => s.trim().parse().ok(),
            other => other.to_i64().and_then(|i| match i {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            }),
        }
    }
}

// 2^63, the first double above i64::MAX.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

fn exact_i64(v: f64) -> Option<i64> {
    (v.fract() == 0.0 && (-I64_LIMIT..I64_LIMIT).contains(&v)).then_some(v as i64)
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => f.write_str("null"),
            Val::Boolean(v) => write!(f, "{}", v),
            Val::Byte(v) => write!(f, "{}", v),
            Val::Short(v) => write!(f, "{}", v),
            Val::Int(v) => write!(f, "{}", v),
            Val::Long(v) => write!(f, "{}", v),
            Val::Float(v) => write!(f, "{}", v),
            Val::Double(v) => write!(f, "{}", v),
            Val::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Val {
    fn from(v: bool) -> Self {
        Val::Boolean(v)
    }
}

impl From<i8> for Val {
    fn from(v: i8) -> Self {
        Val::Byte(v)
    }
}

impl From<i16> for Val {
    fn from(v: i16) -> Self {
        Val::Short(v)
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::Int(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::Long(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::Float(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::Double(v)
    }
}

impl From<&str> for Val {
    fn from(v: &str) -> Self {
        Val::String(v.to_string())
    }
}

impl From<String> for Val {
    fn from(v: String) -> Self {
        Val::String(v)
    }
}

/// The interval during which a key was observed active.
///
/// Immutable once built; `start <= end` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    key: Val,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<Val>, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInput(format!(
                "Session start {} is after end {}",
                start, end
            )));
        }
        Ok(Self {
            key: key.into(),
            start,
            end,
        })
    }

    pub fn key(&self) -> &Val {
        &self.key
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Same key over a different interval.
    pub fn with_interval(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Session::new(self.key.clone(), start, end)
    }

    pub fn into_key(self) -> Val {
        self.key
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} .. {}]", self.key, self.start, self.end)
    }
}
