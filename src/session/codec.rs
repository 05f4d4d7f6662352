//! Physical key layouts for sessions.
//!
//! Every layout is `value ‖ start ‖ end`, where the value part depends on the
//! key type and the two instants come from [`TimeCodec`]. The value part is
//! self-delimiting or fixed width, so it is also the prefix that isolates
//! every row of one key.

use chrono::{DateTime, Utc};

use super::{Session, Val};
use crate::config::KeyType;
use crate::encoding::format::Raw;
use crate::encoding::keycode::{self, TAG_STRING};
use crate::encoding::time::TimeCodec;
use crate::encoding::EncodingError;
use crate::error::Result;
use crate::kv::{KvRead, WriteTxn};
use crate::lookup::uid::UID_WIDTH;
use crate::lookup::{HashLookupTable, UidLookupTable};
use crate::Error;

/// VARIABLE tag for strings interned in the uid table.
pub const TAG_UID_STRING: u8 = 0x10;
/// VARIABLE tag for strings deduplicated in the hash table.
pub const TAG_HASH_STRING: u8 = 0x11;

/// Longest string, in UTF-8 bytes, that VARIABLE sends to the uid table.
pub const MAX_UID_STRING_LEN: usize = 32;

/// Encoding of the key value portion of a session key.
trait ValuePart {
    /// Appends the value part, creating lookup entries as needed.
    fn write_value(&self, txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()>;

    /// Appends the value part without writing. Returns false when the value
    /// has no lookup entry, and so no rows.
    fn find_value<R: KvRead + ?Sized>(&self, reader: &R, key: &Val, out: &mut Vec<u8>)
        -> Result<bool>;

    /// Decodes exactly `bytes`, the value part of a key.
    fn read_value<R: KvRead + ?Sized>(&self, reader: &R, bytes: &[u8]) -> Result<Val>;

    fn uses_lookup(&self, value: &[u8]) -> bool;
}

fn expect_consumed(consumed: usize, bytes: &[u8]) -> Result<()> {
    if consumed != bytes.len() {
        return Err(EncodingError::InvalidFormat(format!(
            "key value is {} bytes, expected {}",
            bytes.len(),
            consumed
        ))
        .into());
    }
    Ok(())
}

/// Fixed-width primitives stored in the key itself.
#[derive(Debug, Clone)]
pub struct InlineCodec {
    key_type: KeyType,
}

impl ValuePart for InlineCodec {
    fn write_value(&self, _txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        keycode::write_as(self.key_type, key, out)
    }

    fn find_value<R: KvRead + ?Sized>(&self, _reader: &R, key: &Val, out: &mut Vec<u8>) -> Result<bool> {
        keycode::write_as(self.key_type, key, out)?;
        Ok(true)
    }

    fn read_value<R: KvRead + ?Sized>(&self, _reader: &R, bytes: &[u8]) -> Result<Val> {
        let (val, consumed) = keycode::read_as(self.key_type, bytes)?;
        expect_consumed(consumed, bytes)?;
        Ok(val)
    }

    fn uses_lookup(&self, _value: &[u8]) -> bool {
        false
    }
}

/// Escaped, terminated strings stored in the key itself.
#[derive(Debug, Clone)]
pub struct StringCodec {
    max_length: usize,
}

impl StringCodec {
    fn encode(&self, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        let mark = out.len();
        keycode::write_as(KeyType::String, key, out)?;
        let len = out.len() - mark;
        if len > self.max_length {
            out.truncate(mark);
            return Err(Error::ValueTooLarge {
                field: "string key",
                len,
                max: self.max_length,
            });
        }
        Ok(())
    }
}

impl ValuePart for StringCodec {
    fn write_value(&self, _txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        self.encode(key, out)
    }

    fn find_value<R: KvRead + ?Sized>(&self, _reader: &R, key: &Val, out: &mut Vec<u8>) -> Result<bool> {
        self.encode(key, out)?;
        Ok(true)
    }

    fn read_value<R: KvRead + ?Sized>(&self, _reader: &R, bytes: &[u8]) -> Result<Val> {
        let (val, consumed) = keycode::read_as(KeyType::String, bytes)?;
        expect_consumed(consumed, bytes)?;
        Ok(val)
    }

    fn uses_lookup(&self, _value: &[u8]) -> bool {
        false
    }
}

fn tagged(key: &Val) -> Vec<u8> {
    let mut content = Vec::new();
    keycode::write_tagged(key, &mut content);
    content
}

/// Keys interned in the uid table; the key holds a 4 byte uid.
#[derive(Debug, Clone)]
pub struct UidLookupCodec {
    uids: UidLookupTable,
}

impl ValuePart for UidLookupCodec {
    fn write_value(&self, txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        let uid = self.uids.get_or_create(txn, &tagged(key))?;
        out.extend_from_slice(&UidLookupTable::encode_uid(uid));
        Ok(())
    }

    fn find_value<R: KvRead + ?Sized>(&self, reader: &R, key: &Val, out: &mut Vec<u8>) -> Result<bool> {
        match self.uids.find(reader, &tagged(key))? {
            Some(uid) => {
                out.extend_from_slice(&UidLookupTable::encode_uid(uid));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_value<R: KvRead + ?Sized>(&self, reader: &R, bytes: &[u8]) -> Result<Val> {
        expect_consumed(UID_WIDTH, bytes)?;
        let uid = UidLookupTable::decode_uid(bytes)?;
        let content = self
            .uids
            .get(reader, uid)?
            .ok_or_else(|| Error::InvalidData(format!("Unknown uid {}", uid)))?;
        keycode::read_tagged(content)
    }

    fn uses_lookup(&self, _value: &[u8]) -> bool {
        true
    }
}

/// Keys deduplicated in the hash table; the key holds the surrogate id.
#[derive(Debug, Clone)]
pub struct HashLookupCodec {
    hashes: HashLookupTable,
}

impl ValuePart for HashLookupCodec {
    fn write_value(&self, txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        let id = self.hashes.put(txn, &tagged(key))?;
        out.extend_from_slice(&id);
        Ok(())
    }

    fn find_value<R: KvRead + ?Sized>(&self, reader: &R, key: &Val, out: &mut Vec<u8>) -> Result<bool> {
        match self.hashes.get(reader, &tagged(key))? {
            Some(id) => {
                out.extend_from_slice(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_value<R: KvRead + ?Sized>(&self, reader: &R, bytes: &[u8]) -> Result<Val> {
        let content = self
            .hashes
            .resolve(reader, bytes)?
            .ok_or_else(|| Error::InvalidData(format!("Unknown hash lookup id {}", Raw::hex(bytes))))?;
        keycode::read_tagged(content)
    }

    fn uses_lookup(&self, _value: &[u8]) -> bool {
        true
    }
}

/// Self-describing keys of any type: a tag byte, then either the inline
/// primitive or a lookup id for strings.
#[derive(Debug, Clone)]
pub struct VariableCodec {
    uids: UidLookupTable,
    hashes: HashLookupTable,
}

impl VariableCodec {
    fn string_content(s: &str) -> &[u8] {
        s.as_bytes()
    }

    fn string_val(content: &[u8]) -> Result<Val> {
        keycode::read_tagged_payload(TAG_STRING, content)
    }
}

impl ValuePart for VariableCodec {
    fn write_value(&self, txn: &mut WriteTxn<'_>, key: &Val, out: &mut Vec<u8>) -> Result<()> {
        match key {
            Val::String(s) if s.len() <= MAX_UID_STRING_LEN => {
                let uid = self.uids.get_or_create(txn, Self::string_content(s))?;
                out.push(TAG_UID_STRING);
                out.extend_from_slice(&UidLookupTable::encode_uid(uid));
            }
            Val::String(s) => {
                let id = self.hashes.put(txn, Self::string_content(s))?;
                out.push(TAG_HASH_STRING);
                out.extend_from_slice(&id);
            }
            other => keycode::write_tagged(other, out),
        }
        Ok(())
    }

    fn find_value<R: KvRead + ?Sized>(&self, reader: &R, key: &Val, out: &mut Vec<u8>) -> Result<bool> {
        match key {
            Val::String(s) if s.len() <= MAX_UID_STRING_LEN => {
                match self.uids.find(reader, Self::string_content(s))? {
                    Some(uid) => {
                        out.push(TAG_UID_STRING);
                        out.extend_from_slice(&UidLookupTable::encode_uid(uid));
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Val::String(s) => match self.hashes.get(reader, Self::string_content(s))? {
                Some(id) => {
                    out.push(TAG_HASH_STRING);
                    out.extend_from_slice(&id);
                    Ok(true)
                }
                None => Ok(false),
            },
            other => {
                keycode::write_tagged(other, out);
                Ok(true)
            }
        }
    }

    fn read_value<R: KvRead + ?Sized>(&self, reader: &R, bytes: &[u8]) -> Result<Val> {
        let (&tag, payload) = bytes.split_first().ok_or(EncodingError::TruncatedData)?;
        match tag {
            TAG_UID_STRING => {
                expect_consumed(UID_WIDTH, payload)?;
                let uid = UidLookupTable::decode_uid(payload)?;
                let content = self
                    .uids
                    .get(reader, uid)?
                    .ok_or_else(|| Error::InvalidData(format!("Unknown uid {}", uid)))?;
                Self::string_val(content)
            }
            TAG_HASH_STRING => {
                let content = self
                    .hashes
                    .resolve(reader, payload)?
                    .ok_or_else(|| Error::InvalidData("Unknown hash lookup id".to_string()))?;
                Self::string_val(content)
            }
            tag => {
                let width = keycode::tagged_width(tag).ok_or_else(|| {
                    EncodingError::InvalidFormat(format!("Unknown variable key tag {:#04x}", tag))
                })?;
                expect_consumed(width, payload)?;
                keycode::read_tagged_payload(tag, payload)
            }
        }
    }

    fn uses_lookup(&self, value: &[u8]) -> bool {
        matches!(value.first(), Some(&TAG_UID_STRING) | Some(&TAG_HASH_STRING))
    }
}

#[derive(Debug, Clone)]
enum Strategy {
    Inline(InlineCodec),
    String(StringCodec),
    UidLookup(UidLookupCodec),
    HashLookup(HashLookupCodec),
    Variable(VariableCodec),
}

macro_rules! dispatch {
    ($self:expr, $codec:ident => $body:expr) => {
        match $self {
            Strategy::Inline($codec) => $body,
            Strategy::String($codec) => $body,
            Strategy::UidLookup($codec) => $body,
            Strategy::HashLookup($codec) => $body,
            Strategy::Variable($codec) => $body,
        }
    };
}

/// Encodes and decodes session keys for one key type.
#[derive(Debug, Clone)]
pub struct SessionKeyCodec {
    key_type: KeyType,
    strategy: Strategy,
    time: TimeCodec,
    max_key_length: usize,
}

impl SessionKeyCodec {
    /// Selects the strategy for `key_type`. Lookup tables are only consulted
    /// by the strategies that need them.
    pub fn new(
        key_type: KeyType,
        time: TimeCodec,
        max_key_length: usize,
        uids: UidLookupTable,
        hashes: HashLookupTable,
    ) -> Result<Self> {
        let time_width = 2 * time.width();
        if max_key_length <= time_width {
            return Err(Error::InvalidInput(format!(
                "max_key_length {} leaves no room for a key value",
                max_key_length
            )));
        }
        let strategy = match key_type {
            KeyType::Boolean
            | KeyType::Byte
            | KeyType::Short
            | KeyType::Int
            | KeyType::Long
            | KeyType::Float
            | KeyType::Double => Strategy::Inline(InlineCodec { key_type }),
            KeyType::String => Strategy::String(StringCodec {
                max_length: max_key_length - time_width,
            }),
            KeyType::UidLookup => Strategy::UidLookup(UidLookupCodec { uids }),
            KeyType::HashLookup => Strategy::HashLookup(HashLookupCodec { hashes }),
            KeyType::Variable => Strategy::Variable(VariableCodec { uids, hashes }),
        };
        Ok(Self {
            key_type,
            strategy,
            time,
            max_key_length,
        })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn time(&self) -> &TimeCodec {
        &self.time
    }

    fn interval_width(&self) -> usize {
        2 * self.time.width()
    }

    fn append_interval(&self, start: DateTime<Utc>, end: DateTime<Utc>, out: &mut Vec<u8>) -> Result<()> {
        self.time.write(start, out)?;
        self.time.write(end, out)
    }

    fn check_length(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_length {
            return Err(Error::ValueTooLarge {
                field: "session key",
                len: key.len(),
                max: self.max_key_length,
            });
        }
        Ok(())
    }

    /// Encodes `session`, creating lookup entries in `txn` as needed.
    pub fn write(&self, txn: &mut WriteTxn<'_>, session: &Session) -> Result<Vec<u8>> {
        // Validate the interval before any lookup write.
        let mut interval = Vec::with_capacity(self.interval_width());
        self.append_interval(session.start(), session.end(), &mut interval)?;

        let mut key = Vec::new();
        dispatch!(&self.strategy, codec => codec.write_value(txn, session.key(), &mut key))?;
        key.extend_from_slice(&interval);
        self.check_length(&key)?;
        Ok(key)
    }

    /// Encodes `session` without writing. `None` when its key value has no
    /// lookup entry.
    pub fn find<R: KvRead + ?Sized>(&self, reader: &R, session: &Session) -> Result<Option<Vec<u8>>> {
        let Some(mut key) = self.key_prefix(reader, session.key())? else {
            return Ok(None);
        };
        self.append_interval(session.start(), session.end(), &mut key)?;
        Ok(Some(key))
    }

    /// The prefix shared by every row of `key`, for probes. `None` when the
    /// key value has no lookup entry.
    pub fn key_prefix<R: KvRead + ?Sized>(&self, reader: &R, key: &Val) -> Result<Option<Vec<u8>>> {
        let mut prefix = Vec::new();
        let found = dispatch!(&self.strategy, codec => codec.find_value(reader, key, &mut prefix))?;
        Ok(found.then_some(prefix))
    }

    /// Probe key for "as of" lookups: the key prefix, `time`, then the
    /// largest possible end.
    pub fn probe_key(&self, prefix: &[u8], time: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut probe = Vec::with_capacity(prefix.len() + self.interval_width());
        probe.extend_from_slice(prefix);
        self.time.write(time, &mut probe)?;
        self.time.write_max(&mut probe);
        Ok(probe)
    }

    /// Key value portion of a stored key.
    pub fn prefix<'k>(&self, key: &'k [u8]) -> Result<&'k [u8]> {
        let width = self.interval_width();
        if key.len() <= width {
            return Err(EncodingError::TruncatedData.into());
        }
        Ok(&key[..key.len() - width])
    }

    /// Start and end of a stored key, without resolving its value.
    pub fn read_interval(&self, key: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let prefix_len = self.prefix(key)?.len();
        let width = self.time.width();
        let start = self.time.read(&key[prefix_len..])?;
        let end = self.time.read(&key[prefix_len + width..])?;
        Ok((start, end))
    }

    /// Key with the same value part as `key` over a different interval.
    pub fn with_interval(&self, key: &[u8], start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut out = self.prefix(key)?.to_vec();
        self.append_interval(start, end, &mut out)?;
        Ok(out)
    }

    pub fn read_key<R: KvRead + ?Sized>(&self, reader: &R, key: &[u8]) -> Result<Val> {
        let value = self.prefix(key)?;
        dispatch!(&self.strategy, codec => codec.read_value(reader, value))
    }

    /// Decodes a stored key, resolving lookup ids through `reader`.
    pub fn read<R: KvRead + ?Sized>(&self, reader: &R, key: &[u8]) -> Result<Session> {
        let val = self.read_key(reader, key)?;
        let (start, end) = self.read_interval(key)?;
        Session::new(val, start, end)
    }

    /// True when `key` refers to lookup entries, so copying it to another
    /// store needs a decode and re-encode.
    pub fn uses_lookup(&self, key: &[u8]) -> bool {
        if !self.key_type.may_use_lookup() {
            return false;
        }
        match self.prefix(key) {
            Ok(value) => dispatch!(&self.strategy, codec => codec.uses_lookup(value)),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HashLength, TemporalPrecision};
    use crate::hasher::Hasher;
    use crate::kv::{Env, EnvOptions, Table};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    const UID: Table = Table::new(0);
    const UID_INDEX: Table = Table::new(1);
    const HASH: Table = Table::new(2);
    const INFO: Table = Table::new(3);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn open(dir: &TempDir) -> Result<Env> {
        Env::open(
            dir.path(),
            &["uid", "uid_index", "hash", "info"],
            EnvOptions::default(),
        )
    }

    fn codec(key_type: KeyType) -> SessionKeyCodec {
        SessionKeyCodec::new(
            key_type,
            TimeCodec::new(TemporalPrecision::Second),
            64,
            UidLookupTable::new(UID, UID_INDEX, INFO, 64),
            HashLookupTable::new(HASH, INFO, Arc::new(Hasher::new(HashLength::Integer))),
        )
        .unwrap()
    }

    fn session(key: impl Into<Val>, start: i64, end: i64) -> Session {
        Session::new(key, at(start), at(end)).unwrap()
    }

    /// Sessions for `key_type` listed in their natural order.
    fn ordered_sessions(key_type: KeyType) -> Vec<Session> {
        let keys: Vec<Val> = match key_type {
            KeyType::Boolean => vec![false.into(), true.into()],
            KeyType::Byte => vec![(-5i8).into(), 0i8.into(), 7i8.into()],
            KeyType::Short => vec![(-500i16).into(), 2i16.into(), 300i16.into()],
            KeyType::Int => vec![(-70000i32).into(), 0i32.into(), 70000i32.into()],
            KeyType::Long => vec![i64::MIN.into(), (-1i64).into(), (1i64 << 40).into()],
            KeyType::Float => vec![(-1.5f32).into(), 0.25f32.into(), 8.0f32.into()],
            KeyType::Double => vec![(-1e10f64).into(), 0.5f64.into(), 1e10f64.into()],
            _ => vec!["".into(), "a".into(), "a\0b".into(), "ab".into(), "b".into()],
        };
        let mut sessions = Vec::new();
        for key in keys {
            sessions.push(Session::new(key.clone(), at(-10), at(0)).unwrap());
            sessions.push(Session::new(key.clone(), at(0), at(5)).unwrap());
            sessions.push(Session::new(key.clone(), at(0), at(10)).unwrap());
            sessions.push(Session::new(key, at(3), at(4)).unwrap());
        }
        sessions
    }

    #[test]
    fn test_inline_and_string_keys_preserve_order() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;

        for key_type in [
            KeyType::Boolean,
            KeyType::Byte,
            KeyType::Short,
            KeyType::Int,
            KeyType::Long,
            KeyType::Float,
            KeyType::Double,
            KeyType::String,
        ] {
            let codec = codec(key_type);
            let sessions = ordered_sessions(key_type);
            let keys = sessions
                .iter()
                .map(|s| codec.write(&mut txn, s))
                .collect::<Result<Vec<_>>>()?;
            for i in 1..keys.len() {
                assert!(
                    keys[i - 1] < keys[i],
                    "{} keys for {} and {} out of order",
                    key_type,
                    sessions[i - 1],
                    sessions[i]
                );
            }
            for (session, key) in sessions.iter().zip(keys.iter()) {
                assert_eq!(&codec.read(&txn, key)?, session);
                assert!(!codec.uses_lookup(key));
            }
        }
        Ok(())
    }

    #[test]
    fn test_lookup_keys_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let long = "x".repeat(MAX_UID_STRING_LEN + 1);
        let sessions = vec![
            session("short", 0, 10),
            session(long.as_str(), 0, 10),
            session(42i64, 5, 6),
            session(2.5f64, 5, 6),
            session(true, 1, 2),
            Session::new(Val::Null, at(1), at(2))?,
        ];

        for key_type in [KeyType::UidLookup, KeyType::HashLookup, KeyType::Variable] {
            let codec = codec(key_type);
            let mut txn = env.write()?;
            let keys = sessions
                .iter()
                .map(|s| codec.write(&mut txn, s))
                .collect::<Result<Vec<_>>>()?;
            txn.commit()?;

            let read = env.read()?;
            for (session, key) in sessions.iter().zip(keys.iter()) {
                assert_eq!(&codec.read(&read, key)?, session, "{}", key_type);
                assert_eq!(codec.find(&read, session)?.as_ref(), Some(key));
            }
        }
        Ok(())
    }

    #[test]
    fn test_variable_routes_by_runtime_type() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let codec = codec(KeyType::Variable);
        let mut txn = env.write()?;

        let inline = codec.write(&mut txn, &session(7i32, 0, 1))?;
        assert_eq!(inline[0], keycode::TAG_INT);
        assert!(!codec.uses_lookup(&inline));

        let short = codec.write(&mut txn, &session("k", 0, 1))?;
        assert_eq!(short[0], TAG_UID_STRING);
        assert_eq!(codec.prefix(&short)?.len(), 1 + UID_WIDTH);
        assert!(codec.uses_lookup(&short));

        let long = codec.write(&mut txn, &session("y".repeat(40), 0, 1))?;
        assert_eq!(long[0], TAG_HASH_STRING);
        assert_eq!(codec.prefix(&long)?.len(), 1 + 4 + 2);
        assert!(codec.uses_lookup(&long));
        Ok(())
    }

    #[test]
    fn test_lookup_dedup_through_codec() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;

        let uid_codec = codec(KeyType::UidLookup);
        let a = uid_codec.write(&mut txn, &session("same", 0, 1))?;
        let b = uid_codec.write(&mut txn, &session("same", 5, 9))?;
        assert_eq!(uid_codec.prefix(&a)?, uid_codec.prefix(&b)?);
        assert_eq!(txn.get(UID, &[0, 0, 0, 1])?, None);

        let hash_codec = codec(KeyType::HashLookup);
        let a = hash_codec.write(&mut txn, &session("same", 0, 1))?;
        let b = hash_codec.write(&mut txn, &session("same", 5, 9))?;
        assert_eq!(hash_codec.prefix(&a)?, hash_codec.prefix(&b)?);
        txn.commit()?;

        assert_eq!(env.read()?.len(HASH)?, 1);
        assert_eq!(env.read()?.len(UID)?, 1);
        Ok(())
    }

    #[test]
    fn test_unknown_lookup_value_has_no_prefix() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let read = env.read()?;

        assert_eq!(codec(KeyType::UidLookup).key_prefix(&read, &Val::from("nope"))?, None);
        assert_eq!(codec(KeyType::HashLookup).key_prefix(&read, &Val::from("nope"))?, None);
        assert!(codec(KeyType::Int).key_prefix(&read, &Val::Int(1))?.is_some());
        Ok(())
    }

    #[test]
    fn test_oversized_string_rejected_before_write() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;

        // 64 bytes total, 12 for the interval, 2 for the terminator.
        let codec = codec(KeyType::String);
        assert!(codec.write(&mut txn, &session("z".repeat(50), 0, 1)).is_ok());
        let result = codec.write(&mut txn, &session("z".repeat(51), 0, 1));
        assert!(matches!(result, Err(Error::ValueTooLarge { len: 53, max: 52, .. })));

        let uid_codec = codec_uid_small();
        let result = uid_codec.write(&mut txn, &session("z".repeat(20), 0, 1));
        assert!(matches!(result, Err(Error::ValueTooLarge { .. })));
        assert_eq!(txn.changes(), 0);
        Ok(())
    }

    fn codec_uid_small() -> SessionKeyCodec {
        SessionKeyCodec::new(
            KeyType::UidLookup,
            TimeCodec::new(TemporalPrecision::Second),
            64,
            UidLookupTable::new(UID, UID_INDEX, INFO, 16),
            HashLookupTable::new(HASH, INFO, Arc::new(Hasher::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_type_mismatch_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;

        let codec = codec(KeyType::Int);
        assert!(matches!(
            codec.write(&mut txn, &session("not a number", 0, 1)),
            Err(Error::InvalidInput(_))
        ));
        // Lossless coercion is accepted.
        let key = codec.write(&mut txn, &session(9i64, 0, 1))?;
        assert_eq!(codec.read(&txn, &key)?.key(), &Val::Int(9));
        Ok(())
    }

    #[test]
    fn test_interval_helpers() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;
        let codec = codec(KeyType::Long);

        let key = codec.write(&mut txn, &session(1i64, 10, 20))?;
        assert_eq!(codec.read_interval(&key)?, (at(10), at(20)));

        let wider = codec.with_interval(&key, at(0), at(30))?;
        assert_eq!(codec.read(&txn, &wider)?, session(1i64, 0, 30));

        let probe = codec.probe_key(codec.prefix(&key)?, at(15))?;
        assert!(key < probe);
        assert!(codec.with_interval(&key, at(16), at(16))? > probe);
        assert!(codec.prefix(&key[..5]).is_err());
        Ok(())
    }

    #[test]
    fn test_max_key_length_must_fit_interval() {
        let result = SessionKeyCodec::new(
            KeyType::Int,
            TimeCodec::new(TemporalPrecision::Millisecond),
            16,
            UidLookupTable::new(UID, UID_INDEX, INFO, 16),
            HashLookupTable::new(HASH, INFO, Arc::new(Hasher::default())),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
