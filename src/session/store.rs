//! The session store: marker rows keyed by `value ‖ start ‖ end`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec::SessionKeyCodec;
use super::fields::{FieldIndex, FieldValue, Predicate};
use super::{Session, Val};
use crate::cancel::Cancellation;
use crate::config::{HashLength, KeyType, SessionConfig, TemporalPrecision};
use crate::encoding::bincode;
use crate::encoding::format::Raw;
use crate::encoding::keycode;
use crate::encoding::time::TimeCodec;
use crate::error::Result;
use crate::hasher::{ContentHash, Hasher};
use crate::kv::{Env, EnvOptions, Table, Writer};
use crate::lookup::{HashLookupTable, UidLookupTable};
use crate::Error;

pub const SESSION: Table = Table::new(0);
pub const KEY_UID: Table = Table::new(1);
pub const KEY_UID_INDEX: Table = Table::new(2);
pub const KEY_HASH: Table = Table::new(3);
pub const INFO: Table = Table::new(4);

const TABLES: [&str; 5] = ["session", "key_uid", "key_uid_index", "key_hash", "info"];
const SCHEMA_KEY: &[u8] = b"schema";

pub const SCHEMA_VERSION: u32 = 1;

/// Sessions that may be open at once while a search reconstructs them.
pub const MAX_OPEN_SESSIONS: usize = 1000;

/// Schema fixed when a store is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub schema_version: u32,
    pub key_type: KeyType,
    pub temporal_precision: TemporalPrecision,
    pub hash_length: HashLength,
}

impl SchemaInfo {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            key_type: config.key_type,
            temporal_precision: config.temporal_precision,
            hash_length: config.hash_length,
        }
    }
}

impl fmt::Display for SchemaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} {} keys, {:?} precision, {} byte hashes",
            self.schema_version,
            self.key_type,
            self.temporal_precision,
            self.hash_length.bytes()
        )
    }
}

/// One reconstructed session from [`SessionStore::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    pub session: Session,
    /// Field values of the row that opened the session, with the interval
    /// slots set to the coalesced interval.
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub rows_scanned: u64,
    pub rows_matched: u64,
    pub sessions: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows copied byte for byte.
    pub copied: u64,
    /// Rows decoded and re-encoded against this store's lookup tables.
    pub reencoded: u64,
    pub source_deleted: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondenseOutcome {
    pub rows_scanned: u64,
    /// Rows dropped because they ended before the retention cutoff.
    pub deleted: u64,
    /// Rows folded into a wider session.
    pub merged: u64,
    /// Wider sessions written.
    pub inserted: u64,
    pub cancelled: bool,
}

impl CondenseOutcome {
    pub fn changes(&self) -> u64 {
        self.deleted + self.merged + self.inserted
    }
}

/// Embedded interval store for one key schema.
pub struct SessionStore {
    config: SessionConfig,
    schema: SchemaInfo,
    hasher: Arc<dyn ContentHash>,
    hashes: HashLookupTable,
    codec: SessionKeyCodec,
    env: Env,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("dir", &self.config.dir)
            .field("schema", &self.schema)
            .field("read_only", &self.env.is_read_only())
            .finish()
    }
}

impl SessionStore {
    /// Opens or creates the store in `config.dir`.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let hasher = Arc::new(Hasher::new(config.hash_length));
        Self::open_with_hasher(config, hasher)
    }

    /// Like [`open`](Self::open) with a custom content hash for the hash
    /// lookup table. Its width must match `config.hash_length`.
    pub fn open_with_hasher(config: SessionConfig, hasher: Arc<dyn ContentHash>) -> Result<Self> {
        check_hasher(&config, hasher.as_ref())?;
        let env = Env::open(&config.dir, &TABLES, env_options(&config, false))?;
        let expected = SchemaInfo::from_config(&config);

        let stored = read_schema(&env)?;
        match stored {
            Some(found) if found != expected => {
                return Err(Error::SchemaMismatch {
                    expected: expected.to_string(),
                    found: found.to_string(),
                })
            }
            Some(_) => {}
            None => {
                let mut txn = env.write()?;
                txn.put(INFO, SCHEMA_KEY, &bincode::serialize(&expected)?)?;
                txn.commit()?;
                tracing::info!(dir = ?config.dir, schema = %expected, "Created session store");
            }
        }

        Self::build(config, expected, hasher, env)
    }

    /// Opens an existing store without locking it or ever writing to it.
    /// The schema is taken from the store itself.
    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_read_only_with(dir.as_ref(), None)
    }

    fn open_read_only_with(dir: &Path, hasher: Option<Arc<dyn ContentHash>>) -> Result<Self> {
        let probe = SessionConfig::new(dir);
        let env = Env::open(dir, &TABLES, env_options(&probe, true))?;
        let schema = read_schema(&env)?.ok_or_else(|| {
            Error::InvalidData(format!("{:?} holds no session store schema", dir))
        })?;
        if schema.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaMismatch {
                expected: format!("schema version {}", SCHEMA_VERSION),
                found: schema.to_string(),
            });
        }

        let config = probe
            .key_type(schema.key_type)
            .temporal_precision(schema.temporal_precision)
            .hash_length(schema.hash_length);
        let hasher: Arc<dyn ContentHash> = match hasher {
            Some(hasher) => hasher,
            None => Arc::new(Hasher::new(schema.hash_length)),
        };
        Self::build(config, schema, hasher, env)
    }

    fn build(
        config: SessionConfig,
        schema: SchemaInfo,
        hasher: Arc<dyn ContentHash>,
        env: Env,
    ) -> Result<Self> {
        check_hasher(&config, hasher.as_ref())?;
        let uids = UidLookupTable::new(KEY_UID, KEY_UID_INDEX, INFO, config.max_key_length);
        let hashes = HashLookupTable::new(KEY_HASH, INFO, hasher.clone());
        let codec = SessionKeyCodec::new(
            config.key_type,
            TimeCodec::new(config.temporal_precision),
            config.max_key_length,
            uids,
            hashes.clone(),
        )?;
        Ok(Self {
            config,
            schema,
            hasher,
            hashes,
            codec,
            env,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    pub fn codec(&self) -> &SessionKeyCodec {
        &self.codec
    }

    /// Starts a batching writer. Only one can be open at a time.
    pub fn writer(&self) -> Result<SessionWriter<'_>> {
        Ok(SessionWriter {
            codec: &self.codec,
            writer: Writer::new(&self.env, self.config.commit.clone())?,
            inserted: 0,
        })
    }

    /// Inserts one session and commits.
    pub fn insert(&self, session: &Session) -> Result<()> {
        let mut writer = self.writer()?;
        writer.insert(session)?;
        writer.finish()?;
        Ok(())
    }

    /// Inserts every session, committing in batches.
    pub fn insert_all<'a, I>(&self, sessions: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Session>,
    {
        let mut writer = self.writer()?;
        for session in sessions {
            writer.insert(session)?;
        }
        writer.finish()
    }

    /// True if exactly this session is stored.
    pub fn get(&self, session: &Session) -> Result<bool> {
        let read = self.env.read()?;
        match self.codec.find(&read, session)? {
            Some(key) => Ok(read.get(SESSION, &key)?.is_some()),
            None => Ok(false),
        }
    }

    /// Session of `key` covering `time`.
    ///
    /// Scans backwards from `(key, time, MAX)` and keeps the last row it
    /// passes whose start is at or before `time`. The scan stops at the first
    /// row that ends before `time`, so in a run of sessions that all cover
    /// `time` the earliest one wins.
    pub fn get_state(&self, key: &Val, time: DateTime<Utc>) -> Result<Option<Session>> {
        let read = self.env.read()?;
        let Some(prefix) = self.codec.key_prefix(&read, key)? else {
            return Ok(None);
        };
        let time = self.codec.time().truncate(time)?;
        let probe = self.codec.probe_key(&prefix, time)?;

        let mut found = None;
        let rows = read.range(
            SESSION,
            (Bound::Included(prefix.as_slice()), Bound::Included(probe.as_slice())),
        )?;
        for (row, _) in rows.rev() {
            if self.codec.prefix(row)? != prefix.as_slice() {
                break;
            }
            let (start, end) = self.codec.read_interval(row)?;
            if end < time {
                break;
            }
            if start <= time {
                found = Some(row);
            }
        }
        tracing::trace!(probe = %Raw::hex(&probe), found = found.is_some(), "Point lookup");

        found.map(|row| self.codec.read(&read, row)).transpose()
    }

    /// Scans every row in key order and hands `consumer` the sessions formed
    /// by coalescing matching rows that touch or overlap.
    ///
    /// `predicate` sees each row projected through `index`. Returns early,
    /// without emitting sessions still open, when `cancel` fires.
    pub fn search<P, F>(
        &self,
        index: &FieldIndex,
        predicate: &P,
        cancel: &Cancellation,
        mut consumer: F,
    ) -> Result<SearchOutcome>
    where
        P: Predicate + ?Sized,
        F: FnMut(SearchMatch) -> Result<()>,
    {
        let read = self.env.read()?;
        let mut outcome = SearchOutcome::default();
        let mut open = OpenSessions::new(index, MAX_OPEN_SESSIONS);
        let mut last_prefix: Option<&[u8]> = None;

        for (row, _) in read.iter(SESSION)? {
            if cancel.is_cancelled() {
                tracing::warn!(rows_scanned = outcome.rows_scanned, "Search cancelled");
                outcome.cancelled = true;
                return Ok(outcome);
            }
            outcome.rows_scanned += 1;

            let prefix = self.codec.prefix(row)?;
            if last_prefix.is_some_and(|last| last != prefix) {
                outcome.sessions += open.flush(&mut consumer)?;
            }
            last_prefix = Some(prefix);

            let session = self.codec.read(&read, row)?;
            let values = index.project(session.key(), session.start(), session.end());
            if !predicate.test(&values) {
                continue;
            }
            outcome.rows_matched += 1;
            outcome.sessions += open.add(session, values, &mut consumer)?;
        }
        outcome.sessions += open.flush(&mut consumer)?;
        Ok(outcome)
    }

    /// Copies every session of the store in `source_dir` into this store,
    /// then deletes the source directory.
    ///
    /// Rows whose keys hold lookup ids are decoded and inserted again, since
    /// ids are local to a store; all others are copied as raw keys. The
    /// source must not be written to while this runs.
    pub fn merge(&self, source_dir: impl AsRef<Path>, cancel: &Cancellation) -> Result<MergeOutcome> {
        let source_dir = source_dir.as_ref();
        if source_dir.canonicalize()? == self.config.dir.canonicalize()? {
            return Err(Error::InvalidInput(
                "Cannot merge a store into itself".to_string(),
            ));
        }

        let mut outcome = MergeOutcome::default();
        {
            let source = Self::open_read_only_with(source_dir, Some(self.hasher.clone()))?;
            if source.schema != self.schema {
                return Err(Error::SchemaMismatch {
                    expected: self.schema.to_string(),
                    found: source.schema.to_string(),
                });
            }

            let read = source.env.read()?;
            let mut writer = self.writer()?;
            for (key, _) in read.iter(SESSION)? {
                if cancel.is_cancelled() {
                    tracing::warn!(source = ?source_dir, "Merge cancelled");
                    outcome.cancelled = true;
                    break;
                }
                if source.codec.uses_lookup(key) {
                    let session = source.codec.read(&read, key)?;
                    writer.insert(&session)?;
                    outcome.reencoded += 1;
                } else {
                    writer.insert_key(key)?;
                    outcome.copied += 1;
                }
            }
            writer.finish()?;
        }

        if !outcome.cancelled {
            std::fs::remove_dir_all(source_dir)?;
            outcome.source_deleted = true;
        }

        tracing::info!(
            source = ?source_dir,
            copied = outcome.copied,
            reencoded = outcome.reencoded,
            source_deleted = outcome.source_deleted,
            "Merged session store"
        );
        Ok(outcome)
    }

    /// Deletes sessions that ended before `delete_before` and folds each
    /// session starting before `condense_before` into the previous session
    /// of the same key when the two touch or overlap.
    ///
    /// Work is committed in batches; a cancelled or failed run leaves a
    /// consistent, partially condensed store.
    pub fn condense(
        &self,
        condense_before: DateTime<Utc>,
        delete_before: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<CondenseOutcome> {
        let mut writer = Writer::new(&self.env, self.config.commit.clone())?;
        let mut outcome = CondenseOutcome::default();
        let mut tracked: Option<Tracked> = None;
        // Last row handled before the most recent commit.
        let mut resume: Option<Vec<u8>> = None;

        loop {
            // A fresh snapshot per batch, released before the batch commits.
            let read = self.env.read()?;
            let after = resume.take();
            let from = match after.as_deref() {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            for (row, _) in read.range(SESSION, (from, Bound::Unbounded))? {
                if cancel.is_cancelled() {
                    tracing::warn!(rows_scanned = outcome.rows_scanned, "Condense cancelled");
                    outcome.cancelled = true;
                    break;
                }
                outcome.rows_scanned += 1;

                let (start, end) = self.codec.read_interval(row)?;
                if end < delete_before {
                    writer.delete(SESSION, row)?;
                    outcome.deleted += 1;
                } else {
                    let extend = match tracked.as_ref() {
                        Some(t) => {
                            start < condense_before
                                && start <= t.end
                                && self.codec.prefix(&t.key)? == self.codec.prefix(row)?
                        }
                        None => false,
                    };

                    if extend {
                        if let Some(t) = tracked.as_mut() {
                            if t.stored {
                                writer.delete(SESSION, &t.key)?;
                            }
                            writer.delete(SESSION, row)?;
                            outcome.merged += 1;
                            t.end = t.end.max(end);
                            t.key = self.codec.with_interval(row, t.start, t.end)?;
                            t.stored = false;
                        }
                    } else {
                        if let Some(t) = tracked.as_mut() {
                            outcome.inserted += t.store(&mut writer)?;
                        }
                        tracked = Some(Tracked {
                            key: row.to_vec(),
                            start,
                            end,
                            stored: true,
                        });
                    }
                }

                // Never commit with a wider session only held in memory.
                if writer.should_commit() {
                    if let Some(t) = tracked.as_mut() {
                        outcome.inserted += t.store(&mut writer)?;
                    }
                    resume = Some(row.to_vec());
                    break;
                }
            }
            drop(read);

            if resume.is_none() {
                break;
            }
            writer.commit()?;
        }

        if let Some(t) = tracked.as_mut() {
            outcome.inserted += t.store(&mut writer)?;
        }
        writer.finish()?;

        tracing::info!(
            %condense_before,
            %delete_before,
            rows_scanned = outcome.rows_scanned,
            deleted = outcome.deleted,
            merged = outcome.merged,
            inserted = outcome.inserted,
            "Condensed session store"
        );
        Ok(outcome)
    }

    /// Number of stored rows.
    pub fn count(&self) -> Result<usize> {
        self.env.read()?.len(SESSION)
    }

    /// Every stored session in key order.
    pub fn sessions(&self) -> Result<Vec<Session>> {
        let read = self.env.read()?;
        let mut sessions = Vec::with_capacity(read.len(SESSION)?);
        for (key, _) in read.iter(SESSION)? {
            sessions.push(self.codec.read(&read, key)?);
        }
        Ok(sessions)
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.env.checkpoint()
    }

    /// Number of hash lookup entries stored away from their home slot.
    pub fn hash_clash_count(&self) -> Result<u64> {
        self.hashes.clash_count(&self.env.read()?)
    }
}

fn env_options(config: &SessionConfig, read_only: bool) -> EnvOptions {
    EnvOptions {
        read_only,
        wal_buffer_size: config.wal_buffer_size,
        sync_on_commit: config.sync_on_commit,
        checkpoint_wal_size: config.checkpoint_wal_size,
    }
}

fn check_hasher(config: &SessionConfig, hasher: &dyn ContentHash) -> Result<()> {
    if hasher.width() != config.hash_length.bytes() {
        return Err(Error::InvalidInput(format!(
            "Content hash is {} bytes wide, schema expects {}",
            hasher.width(),
            config.hash_length.bytes()
        )));
    }
    Ok(())
}

fn read_schema(env: &Env) -> Result<Option<SchemaInfo>> {
    env.read()?
        .get(INFO, SCHEMA_KEY)?
        .map(bincode::deserialize)
        .transpose()
}

/// Session condense is currently widening.
struct Tracked {
    key: Vec<u8>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    // Whether `key` is present in the store.
    stored: bool,
}

impl Tracked {
    fn store(&mut self, writer: &mut Writer<'_>) -> Result<u64> {
        if self.stored {
            return Ok(0);
        }
        writer.put(SESSION, &self.key, &[])?;
        self.stored = true;
        Ok(1)
    }
}

struct OpenSession {
    session: Session,
    values: Vec<FieldValue>,
}

/// Sessions being reconstructed by a search, keyed by the tagged encoding
/// of their key value.
struct OpenSessions<'i> {
    index: &'i FieldIndex,
    limit: usize,
    open: BTreeMap<Vec<u8>, OpenSession>,
}

impl<'i> OpenSessions<'i> {
    fn new(index: &'i FieldIndex, limit: usize) -> Self {
        Self {
            index,
            limit,
            open: BTreeMap::new(),
        }
    }

    fn emit<F>(&self, open: OpenSession, consumer: &mut F) -> Result<()>
    where
        F: FnMut(SearchMatch) -> Result<()>,
    {
        let OpenSession { session, mut values } = open;
        self.index
            .set_interval(&mut values, session.start(), session.end());
        consumer(SearchMatch { session, values })
    }

    /// Folds a matching row in, emitting the session it ends. Returns the
    /// number of sessions emitted.
    fn add<F>(&mut self, session: Session, values: Vec<FieldValue>, consumer: &mut F) -> Result<u64>
    where
        F: FnMut(SearchMatch) -> Result<()>,
    {
        let mut slot = Vec::new();
        keycode::write_tagged(session.key(), &mut slot);

        let Some(current) = self.open.get_mut(&slot) else {
            if self.open.len() >= self.limit {
                return Err(Error::TooManyOpenSessions(self.limit));
            }
            self.open.insert(slot, OpenSession { session, values });
            return Ok(0);
        };

        if current.session.end() < session.start() {
            let ended = std::mem::replace(current, OpenSession { session, values });
            self.emit(ended, consumer)?;
            return Ok(1);
        }
        if session.end() > current.session.end() {
            current.session = current
                .session
                .with_interval(current.session.start(), session.end())?;
        }
        Ok(0)
    }

    /// Emits and forgets every open session.
    fn flush<F>(&mut self, consumer: &mut F) -> Result<u64>
    where
        F: FnMut(SearchMatch) -> Result<()>,
    {
        let open = std::mem::take(&mut self.open);
        let count = open.len() as u64;
        for (_, session) in open {
            self.emit(session, consumer)?;
        }
        Ok(count)
    }
}

/// Session writes batched into few transactions.
///
/// Lookup entries created for a session land in the same transaction as its
/// row. Call [`finish`](Self::finish) to commit the last batch; dropping the
/// writer discards it.
pub struct SessionWriter<'s> {
    codec: &'s SessionKeyCodec,
    writer: Writer<'s>,
    inserted: usize,
}

impl SessionWriter<'_> {
    pub fn insert(&mut self, session: &Session) -> Result<()> {
        let key = self.codec.write(self.writer.txn()?, session)?;
        self.insert_key(&key)
    }

    /// Inserts an already encoded session key.
    fn insert_key(&mut self, key: &[u8]) -> Result<()> {
        self.writer.put(SESSION, key, &[])?;
        self.inserted += 1;
        self.writer.try_commit()?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.writer.commit()
    }

    /// Commits and returns the number of sessions inserted.
    pub fn finish(self) -> Result<usize> {
        self.writer.finish()?;
        Ok(self.inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitConfig;
    use crate::session::fields::{END, KEY, START};
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn session(key: impl Into<Val>, start: i64, end: i64) -> Session {
        Session::new(key, at(start), at(end)).unwrap()
    }

    fn config(dir: &Path, key_type: KeyType) -> SessionConfig {
        SessionConfig::new(dir)
            .key_type(key_type)
            .temporal_precision(TemporalPrecision::Second)
            .sync_on_commit(false)
    }

    fn open(dir: &TempDir, key_type: KeyType) -> Result<SessionStore> {
        SessionStore::open(config(dir.path(), key_type))
    }

    fn search_all(store: &SessionStore) -> Result<Vec<Session>> {
        let mut found = Vec::new();
        let always = |_: &[FieldValue]| true;
        store.search(&FieldIndex::session(), &always, &Cancellation::new(), |m| {
            found.push(m.session);
            Ok(())
        })?;
        Ok(found)
    }

    /// Sends every input to the same bucket.
    struct ConstantHash;

    impl ContentHash for ConstantHash {
        fn width(&self) -> usize {
            8
        }

        fn hash_into(&self, _content: &[u8], out: &mut Vec<u8>) {
            out.extend_from_slice(&[7; 8]);
        }
    }

    #[test]
    fn test_search_coalesces_touching_rows() -> Result<()> {
        for key_type in [KeyType::String, KeyType::UidLookup, KeyType::HashLookup, KeyType::Variable] {
            let dir = TempDir::new()?;
            let store = open(&dir, key_type)?;
            store.insert_all(&[
                session("K", 0, 10),
                session("K", 10, 20),
                session("K", 25, 30),
                session("L", 5, 6),
            ])?;

            let found = search_all(&store)?;
            let k: Vec<_> = found.iter().filter(|s| s.key() == &Val::from("K")).collect();
            assert_eq!(k, vec![&session("K", 0, 20), &session("K", 25, 30)], "{}", key_type);
            assert!(found.contains(&session("L", 5, 6)));
            assert_eq!(found.len(), 3);
        }
        Ok(())
    }

    #[test]
    fn test_search_overlap_and_projection() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::Long)?;
        store.insert_all(&[
            session(1i64, 0, 50),
            session(1i64, 10, 20),
            session(1i64, 40, 60),
            session(2i64, 0, 5),
        ])?;

        let mut index = FieldIndex::new();
        let end = index.create(END);
        let key = index.create(KEY);
        let missing = index.create("Feed");
        let only_one = move |values: &[FieldValue]| values[key] == FieldValue::Value(Val::Long(1));

        let mut matches = Vec::new();
        let outcome = store.search(&index, &only_one, &Cancellation::new(), |m| {
            matches.push(m);
            Ok(())
        })?;

        assert_eq!(outcome.rows_scanned, 4);
        assert_eq!(outcome.rows_matched, 3);
        assert_eq!(outcome.sessions, 1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].session, session(1i64, 0, 60));
        assert_eq!(matches[0].values[end], FieldValue::Time(at(60)));
        assert_eq!(matches[0].values[missing], FieldValue::Null);
        Ok(())
    }

    #[test]
    fn test_search_open_session_cap() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::Int)?;
        let index = FieldIndex::session();
        let always = |_: &[FieldValue]| true;

        let mut open_sessions = OpenSessions::new(&index, 2);
        let mut emitted = Vec::new();
        let mut consumer = |m: SearchMatch| -> Result<()> {
            emitted.push(m.session);
            Ok(())
        };
        for key in 0..2i32 {
            let s = session(key, 0, 1);
            let values = index.project(s.key(), s.start(), s.end());
            open_sessions.add(s, values, &mut consumer)?;
        }
        let s = session(3i32, 0, 1);
        let values = index.project(s.key(), s.start(), s.end());
        assert!(matches!(
            open_sessions.add(s, values, &mut consumer),
            Err(Error::TooManyOpenSessions(2))
        ));
        assert_eq!(open_sessions.flush(&mut consumer)?, 2);
        drop(consumer);
        assert_eq!(emitted.len(), 2);

        // The store itself stays within the cap when keys are distinct.
        let many: Vec<_> = (0..1500i32).map(|k| session(k, 0, 1)).collect();
        store.insert_all(&many)?;
        let outcome = store.search(&index, &always, &Cancellation::new(), |_| Ok(()))?;
        assert_eq!(outcome.sessions, 1500);
        Ok(())
    }

    #[test]
    fn test_search_cancelled() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::Int)?;
        store.insert_all(&[session(1i32, 0, 1), session(2i32, 0, 1)])?;

        let cancel = Cancellation::new();
        cancel.cancel();
        let always = |_: &[FieldValue]| true;
        let mut emitted = 0;
        let outcome = store.search(&FieldIndex::session(), &always, &cancel, |_| {
            emitted += 1;
            Ok(())
        })?;
        assert!(outcome.cancelled);
        assert_eq!(outcome.rows_scanned, 0);
        assert_eq!(emitted, 0);
        Ok(())
    }

    #[test]
    fn test_get_state() -> Result<()> {
        for key_type in [KeyType::Long, KeyType::Variable, KeyType::HashLookup] {
            let dir = TempDir::new()?;
            let store = open(&dir, key_type)?;
            store.insert_all(&[session(7i64, 0, 10), session(7i64, 20, 30), session(8i64, 0, 100)])?;

            let key = Val::Long(7);
            assert_eq!(store.get_state(&key, at(5))?, Some(session(7i64, 0, 10)));
            assert_eq!(store.get_state(&key, at(15))?, None);
            assert_eq!(store.get_state(&key, at(25))?, Some(session(7i64, 20, 30)));
            assert_eq!(store.get_state(&key, at(30))?, Some(session(7i64, 20, 30)));
            assert_eq!(store.get_state(&key, at(31))?, None);
            assert_eq!(store.get_state(&Val::Long(9), at(5))?, None);
        }
        Ok(())
    }

    #[test]
    fn test_get_state_returns_earliest_covering_session() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::String)?;
        store.insert_all(&[session("k", 0, 10), session("k", 5, 15)])?;

        assert_eq!(store.get_state(&Val::from("k"), at(7))?, Some(session("k", 0, 10)));
        assert_eq!(store.get_state(&Val::from("k"), at(12))?, Some(session("k", 5, 15)));
        Ok(())
    }

    #[test]
    fn test_get_state_truncates_query_time() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SessionStore::open(
            config(dir.path(), KeyType::Int).temporal_precision(TemporalPrecision::Minute),
        )?;
        store.insert(&session(1i32, 60, 120))?;

        assert_eq!(store.get_state(&Val::Int(1), at(179))?, Some(session(1i32, 60, 120)));
        assert_eq!(store.get_state(&Val::Int(1), at(59))?, None);
        Ok(())
    }

    #[test]
    fn test_insert_is_idempotent_and_get() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::UidLookup)?;
        store.insert(&session("a", 0, 1))?;
        store.insert(&session("a", 0, 1))?;

        assert_eq!(store.count()?, 1);
        assert!(store.get(&session("a", 0, 1))?);
        assert!(!store.get(&session("a", 0, 2))?);
        assert!(!store.get(&session("b", 0, 1))?);
        assert_eq!(store.sessions()?, vec![session("a", 0, 1)]);
        Ok(())
    }

    #[test]
    fn test_oversized_key_writes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SessionStore::open(config(dir.path(), KeyType::String).max_key_length(32))?;

        let result = store.insert(&session("x".repeat(40), 0, 1));
        assert!(matches!(result, Err(Error::ValueTooLarge { .. })));
        assert_eq!(store.count()?, 0);
        Ok(())
    }

    #[test]
    fn test_writer_batches_commits() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SessionStore::open(config(dir.path(), KeyType::Int).commit(
            CommitConfig::default()
                .max_uncommitted_changes(2)
                .max_commit_interval(Duration::from_secs(3600)),
        ))?;

        let mut writer = store.writer()?;
        writer.insert(&session(1i32, 0, 1))?;
        assert_eq!(store.count()?, 0);
        writer.insert(&session(2i32, 0, 1))?;
        assert_eq!(store.count()?, 2);
        writer.insert(&session(3i32, 0, 1))?;
        assert_eq!(writer.finish()?, 3);
        assert_eq!(store.count()?, 3);
        Ok(())
    }

    #[test]
    fn test_hash_clash_through_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SessionStore::open_with_hasher(
            config(dir.path(), KeyType::HashLookup),
            Arc::new(ConstantHash),
        )?;
        store.insert_all(&[session("first", 0, 1), session("second", 0, 1), session("third", 2, 3)])?;

        assert_eq!(store.hash_clash_count()?, 2);
        assert!(store.get(&session("second", 0, 1))?);
        assert_eq!(
            store.get_state(&Val::from("third"), at(2))?,
            Some(session("third", 2, 3))
        );
        let mut keys: Vec<_> = store.sessions()?.into_iter().map(Session::into_key).collect();
        keys.sort_by_key(|k| k.to_string());
        assert_eq!(keys, vec![Val::from("first"), Val::from("second"), Val::from("third")]);
        Ok(())
    }

    #[test]
    fn test_hasher_width_must_match_schema() -> Result<()> {
        let dir = TempDir::new()?;
        let result = SessionStore::open_with_hasher(
            config(dir.path(), KeyType::HashLookup).hash_length(HashLength::Integer),
            Arc::new(ConstantHash),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_condense_retention_and_union() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::String)?;
        store.insert_all(&[
            session("a", 0, 5),
            session("a", 10, 20),
            session("a", 20, 30),
            session("a", 25, 28),
            session("a", 35, 40),
            session("a", 90, 120),
            session("a", 120, 130),
            session("b", 30, 40),
            session("b", 40, 50),
        ])?;

        let outcome = store.condense(at(100), at(8), &Cancellation::new())?;
        assert_eq!(outcome.deleted, 1);
        assert!(!outcome.cancelled);
        assert_eq!(
            store.sessions()?,
            vec![
                session("a", 10, 30),
                session("a", 35, 40),
                session("a", 90, 120),
                session("a", 120, 130),
                session("b", 30, 50),
            ]
        );

        let before = store.sessions()?;
        let again = store.condense(at(100), at(8), &Cancellation::new())?;
        assert_eq!(again.changes(), 0);
        assert_eq!(store.sessions()?, before);
        Ok(())
    }

    #[test]
    fn test_condense_commits_in_batches() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SessionStore::open(config(dir.path(), KeyType::Int).commit(
            CommitConfig::default()
                .max_uncommitted_changes(3)
                .max_commit_interval(Duration::from_secs(3600)),
        ))?;
        let rows: Vec<_> = (0..20).map(|i| session(1i32, i * 10, i * 10 + 10)).collect();
        store.insert_all(&rows)?;

        let outcome = store.condense(at(1000), at(0), &Cancellation::new())?;
        assert_eq!(outcome.merged, 19);
        assert_eq!(store.sessions()?, vec![session(1i32, 0, 200)]);
        Ok(())
    }

    #[test]
    fn test_condense_cancelled_keeps_store_valid() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::Int)?;
        store.insert_all(&[session(1i32, 0, 10), session(1i32, 10, 20)])?;

        let cancel = Cancellation::new();
        cancel.cancel();
        let outcome = store.condense(at(100), at(0), &cancel)?;
        assert!(outcome.cancelled);
        assert_eq!(outcome.changes(), 0);
        assert_eq!(store.count()?, 2);
        Ok(())
    }

    #[test]
    fn test_condense_merges_row_straddling_threshold() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir, KeyType::Int)?;
        store.insert_all(&[
            session(1i32, 0, 10),
            session(1i32, 10, 50),
            session(1i32, 50, 60),
            session(2i32, 30, 40),
        ])?;

        let outcome = store.condense(at(20), at(0), &Cancellation::new())?;
        assert_eq!(outcome.merged, 1);
        assert_eq!(
            store.sessions()?,
            vec![
                session(1i32, 0, 50),
                session(1i32, 50, 60),
                session(2i32, 30, 40),
            ]
        );

        let again = store.condense(at(20), at(0), &Cancellation::new())?;
        assert_eq!(again.changes(), 0);
        Ok(())
    }

    #[test]
    fn test_condense_batches_match_single_pass() -> Result<()> {
        let rows: Vec<_> = (0..4i32)
            .flat_map(|k| {
                [
                    session(k, 0, 5),
                    session(k, 10, 20),
                    session(k, 20, 30),
                    session(k, 25, 40),
                    session(k, 60, 70),
                    session(k, 70, 80),
                ]
            })
            .collect();

        let single_dir = TempDir::new()?;
        let single = open(&single_dir, KeyType::Int)?;
        single.insert_all(&rows)?;
        let expected = single.condense(at(75), at(8), &Cancellation::new())?;

        let batched_dir = TempDir::new()?;
        let batched = SessionStore::open(config(batched_dir.path(), KeyType::Int).commit(
            CommitConfig::default()
                .max_uncommitted_changes(2)
                .max_commit_interval(Duration::from_secs(3600)),
        ))?;
        batched.insert_all(&rows)?;
        let outcome = batched.condense(at(75), at(8), &Cancellation::new())?;

        assert_eq!(outcome.rows_scanned, expected.rows_scanned);
        assert_eq!(outcome.deleted, 4);
        assert_eq!(batched.sessions()?, single.sessions()?);
        assert_eq!(
            batched.sessions()?[..2].to_vec(),
            vec![session(0i32, 10, 40), session(0i32, 60, 80)]
        );
        Ok(())
    }

    #[test]
    fn test_condense_failure_keeps_covered_time() -> Result<()> {
        for batch in [1000, 3] {
            let dir = TempDir::new()?;
            let store = SessionStore::open(config(dir.path(), KeyType::Int).commit(
                CommitConfig::default()
                    .max_uncommitted_changes(batch)
                    .max_commit_interval(Duration::from_secs(3600)),
            ))?;
            store.insert_all(&[
                session(1i32, 0, 10),
                session(1i32, 10, 20),
                session(1i32, 20, 30),
            ])?;
            // A row too short to hold an interval sorts after every int key.
            let mut txn = store.env.write()?;
            txn.put(SESSION, &[0xff], &[])?;
            txn.commit()?;

            assert!(store.condense(at(100), at(0), &Cancellation::new()).is_err());

            let key = Val::Int(1);
            for t in [0, 10, 15, 25, 30] {
                assert!(store.get_state(&key, at(t))?.is_some(), "lost time {}", t);
            }
            assert!(store.env.read()?.get(SESSION, &[0xff])?.is_some());
        }
        Ok(())
    }

    #[test]
    fn test_schema_mismatch_on_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = open(&dir, KeyType::Int)?;
            store.insert(&session(1i32, 0, 1))?;
            assert_eq!(store.schema().key_type, KeyType::Int);
        }
        assert!(matches!(
            open(&dir, KeyType::Long),
            Err(Error::SchemaMismatch { .. })
        ));

        let store = open(&dir, KeyType::Int)?;
        assert_eq!(store.sessions()?, vec![session(1i32, 0, 1)]);
        Ok(())
    }

    #[test]
    fn test_read_only_adopts_stored_schema() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = open(&dir, KeyType::Variable)?;
            store.insert(&session("v", 0, 1))?;
        }

        let store = SessionStore::open_read_only(dir.path())?;
        assert_eq!(store.schema().key_type, KeyType::Variable);
        assert_eq!(store.schema().temporal_precision, TemporalPrecision::Second);
        assert!(store.get(&session("v", 0, 1))?);
        assert!(matches!(store.insert(&session("w", 0, 1)), Err(Error::ReadOnly)));

        let empty = TempDir::new()?;
        assert!(SessionStore::open_read_only(empty.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_merge() -> Result<()> {
        for key_type in [KeyType::Long, KeyType::Variable, KeyType::UidLookup] {
            let dest_dir = TempDir::new()?;
            let source_dir = TempDir::new()?;
            let source_path = source_dir.path().join("shard");

            let s = match key_type {
                KeyType::Long => Val::Long(50),
                _ => Val::from("s"),
            };
            let dest = open(&dest_dir, key_type)?;
            // Different first-seen order gives the two stores different ids.
            dest.insert_all(&[session(2i64, 0, 1), session(s.clone(), 5, 6)])?;
            {
                let source = SessionStore::open(config(&source_path, key_type))?;
                source.insert_all(&[
                    session(s.clone(), 6, 9),
                    session(1i64, 0, 1),
                    session(2i64, 3, 4),
                ])?;
            }

            let outcome = dest.merge(&source_path, &Cancellation::new())?;
            assert!(outcome.source_deleted);
            assert!(!source_path.exists());
            assert_eq!(outcome.copied + outcome.reencoded, 3);
            match key_type {
                KeyType::Long => assert_eq!(outcome.reencoded, 0),
                KeyType::UidLookup => assert_eq!(outcome.copied, 0),
                _ => assert_eq!(outcome.reencoded, 1),
            }

            assert!(dest.get(&session(s.clone(), 6, 9))?, "{}", key_type);
            assert!(dest.get(&session(1i64, 0, 1))?);
            assert!(dest.get(&session(2i64, 3, 4))?);
            assert_eq!(dest.get_state(&s, at(6))?, Some(session(s.clone(), 5, 6)));
            assert_eq!(dest.count()?, 5);
        }
        Ok(())
    }

    #[test]
    fn test_merge_rejects_schema_mismatch() -> Result<()> {
        let dest_dir = TempDir::new()?;
        let source_dir = TempDir::new()?;
        let dest = open(&dest_dir, KeyType::Int)?;
        {
            let source = open(&source_dir, KeyType::Long)?;
            source.insert(&session(1i64, 0, 1))?;
        }

        assert!(matches!(
            dest.merge(source_dir.path(), &Cancellation::new()),
            Err(Error::SchemaMismatch { .. })
        ));
        assert!(source_dir.path().exists());
        assert_eq!(dest.count()?, 0);
        assert!(matches!(
            dest.merge(dest_dir.path(), &Cancellation::new()),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_merge_cancelled_keeps_source() -> Result<()> {
        let dest_dir = TempDir::new()?;
        let source_dir = TempDir::new()?;
        let dest = open(&dest_dir, KeyType::Int)?;
        {
            let source = open(&source_dir, KeyType::Int)?;
            source.insert(&session(1i32, 0, 1))?;
        }

        let cancel = Cancellation::new();
        cancel.cancel();
        let outcome = dest.merge(source_dir.path(), &cancel)?;
        assert!(outcome.cancelled);
        assert!(!outcome.source_deleted);
        assert!(source_dir.path().exists());
        Ok(())
    }

    #[test]
    fn test_reopen_after_checkpoint() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = open(&dir, KeyType::HashLookup)?;
            store.insert_all(&[session("x", 0, 10), session("y", 5, 6)])?;
            store.checkpoint()?;
            store.insert(&session("x", 10, 12))?;
        }
        let store = open(&dir, KeyType::HashLookup)?;

        // Hash lookup rows sort by surrogate id, not by key value.
        let mut found = search_all(&store)?;
        found.sort_by_key(|s| s.key().to_string());
        assert_eq!(found, vec![session("x", 0, 12), session("y", 5, 6)]);
        Ok(())
    }
}
