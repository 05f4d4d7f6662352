//! Ordered key-value engine the session store runs on.
//!
//! An [`Env`] owns a fixed set of named tables, each an ordered map of byte
//! keys to byte values compared unsigned-lexicographically. Readers take an
//! immutable snapshot ([`ReadTxn`]) and never block. A single [`WriteTxn`] at
//! a time buffers changes, logs them to the WAL on commit and then publishes
//! a new snapshot. Snapshots are copy-on-write per table, so a commit only
//! copies tables that both changed and are still referenced by a reader.
//!
//! Durability comes from `data.wal`; `data.snap` holds the last checkpoint.

pub mod wal;
pub mod writer;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use crate::error::Result;
use crate::flock::DirLock;
use crate::Error;
use wal::header::FileKind;
use wal::{Record, ReplayIterator, Wal};

pub use writer::Writer;

pub const WAL_FILE: &str = "data.wal";
pub const SNAPSHOT_FILE: &str = "data.snap";

/// Handle to one of the tables an [`Env`] was opened with, by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Table(u8);

impl Table {
    pub const fn new(id: u8) -> Self {
        Table(id)
    }

    pub fn id(&self) -> u8 {
        self.0
    }
}

type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: Vec<Arc<TableMap>>,
}

impl Snapshot {
    fn with_tables(count: usize) -> Self {
        Self {
            tables: (0..count).map(|_| Arc::new(TableMap::new())).collect(),
        }
    }

    fn table(&self, table: Table) -> Result<&TableMap> {
        self.tables
            .get(table.0 as usize)
            .map(|t| t.as_ref())
            .ok_or_else(|| Error::InvalidInput(format!("Unknown table {}", table.0)))
    }

    fn table_mut(&mut self, id: u8) -> Result<&mut TableMap> {
        self.tables
            .get_mut(id as usize)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::InvalidData(format!("Record for unknown table {}", id)))
    }

    fn apply(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Put { table, key, value } => {
                self.table_mut(table)?.insert(key, value);
            }
            Record::Delete { table, key } => {
                self.table_mut(table)?.remove(&key);
            }
            Record::Commit => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Open without taking the directory lock; every write fails
    pub read_only: bool,
    pub wal_buffer_size: usize,
    pub sync_on_commit: bool,
    /// WAL size that triggers a checkpoint after commit
    pub checkpoint_wal_size: u64,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            wal_buffer_size: 64 * 1024,
            sync_on_commit: true,
            checkpoint_wal_size: 64 * 1024 * 1024,
        }
    }
}

/// Read access shared by snapshots and write transactions.
pub trait KvRead {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>>;
}

pub struct Env {
    dir: PathBuf,
    table_names: Vec<String>,
    options: EnvOptions,
    committed: RwLock<Arc<Snapshot>>,
    // Doubles as the writer lock; `None` when read-only.
    wal: Mutex<Option<Wal>>,
    _lock: Option<DirLock>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("dir", &self.dir)
            .field("tables", &self.table_names)
            .field("read_only", &self.options.read_only)
            .finish()
    }
}

impl Env {
    /// Opens (or creates) the environment in `dir` with the given tables.
    ///
    /// Loads the last checkpoint, then replays every committed WAL batch on
    /// top of it. An incomplete batch at the tail of the WAL is discarded and,
    /// unless read-only, truncated away.
    pub fn open(dir: impl AsRef<Path>, tables: &[&str], options: EnvOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if tables.len() > u8::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "At most {} tables are supported",
                u8::MAX
            )));
        }

        let lock = if options.read_only {
            if !dir.is_dir() {
                return Err(Error::InvalidInput(format!(
                    "Store directory {:?} does not exist",
                    dir
                )));
            }
            None
        } else {
            std::fs::create_dir_all(&dir)?;
            Some(DirLock::acquire(&dir)?)
        };

        let mut snapshot = Snapshot::with_tables(tables.len());
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            load_snapshot(&snapshot_path, &mut snapshot)?;
        }

        let wal_path = dir.join(WAL_FILE);
        let mut wal = if options.read_only {
            None
        } else {
            Some(Wal::open(&wal_path, options.wal_buffer_size)?)
        };

        if wal_path.exists() {
            let (valid_len, file_len) = replay_wal(&wal_path, &mut snapshot)?;
            if valid_len < file_len {
                tracing::warn!(
                    path = ?wal_path,
                    valid_len,
                    file_len,
                    "Discarding incomplete WAL tail"
                );
                if let Some(wal) = wal.as_mut() {
                    wal.truncate(valid_len)?;
                }
            }
        }

        tracing::info!(
            dir = ?dir,
            tables = tables.len(),
            read_only = options.read_only,
            "Opened environment"
        );

        Ok(Self {
            dir,
            table_names: tables.iter().map(|t| t.to_string()).collect(),
            options,
            committed: RwLock::new(Arc::new(snapshot)),
            wal: Mutex::new(wal),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_names(&self) -> &[String] {
        &self.table_names
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Takes a snapshot of the committed state.
    pub fn read(&self) -> Result<ReadTxn> {
        Ok(ReadTxn {
            snapshot: self.committed.read()?.clone(),
        })
    }

    /// Begins the write transaction, blocking while another one is open.
    pub fn write(&self) -> Result<WriteTxn<'_>> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let wal = self.wal.lock()?;
        let base = self.committed.read()?.clone();
        Ok(WriteTxn {
            env: self,
            wal,
            pending: vec![BTreeMap::new(); base.tables.len()],
            base,
            hooks: Vec::new(),
            changes: 0,
        })
    }

    /// Writes the committed state to the checkpoint file and empties the WAL.
    ///
    /// Fails with `InvalidState` instead of blocking when a write transaction
    /// is open.
    pub fn checkpoint(&self) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let mut guard = match self.wal.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(Error::InvalidState(
                    "Cannot checkpoint while a write transaction is open".to_string(),
                ))
            }
            Err(TryLockError::Poisoned(_)) => return Err(Error::MutexPoisoned),
        };
        let wal = guard.as_mut().ok_or(Error::ReadOnly)?;
        let snapshot = self.committed.read()?.clone();
        self.write_checkpoint(wal, &snapshot)
    }

    fn write_checkpoint(&self, wal: &mut Wal, snapshot: &Snapshot) -> Result<()> {
        let entries = snapshot.tables.iter().enumerate().flat_map(|(id, table)| {
            table
                .iter()
                .map(move |(k, v)| (id as u8, k.as_slice(), v.as_slice()))
        });
        let count = wal::write_snapshot(&self.dir.join(SNAPSHOT_FILE), entries)?;
        let wal_size = wal.size();
        wal.reset()?;

        tracing::debug!(entries = count, wal_size, "Checkpoint written");
        Ok(())
    }
}

fn load_snapshot(path: &Path, snapshot: &mut Snapshot) -> Result<()> {
    let mut complete = false;
    for record in ReplayIterator::new(path, FileKind::Snapshot)? {
        let record = record?;
        complete = record == Record::Commit;
        snapshot.apply(record)?;
    }
    if !complete {
        return Err(Error::InvalidData(format!(
            "Checkpoint {:?} is incomplete",
            path
        )));
    }
    Ok(())
}

/// Applies every committed batch in the WAL, returning the offset just past
/// the last commit record and the file length.
fn replay_wal(path: &Path, snapshot: &mut Snapshot) -> Result<(u64, u64)> {
    let file_len = std::fs::metadata(path)?.len();
    let mut replay = ReplayIterator::new(path, FileKind::Wal)?;
    let mut valid_len = replay.offset();
    let mut batch = Vec::new();

    while let Some(record) = replay.next() {
        match record {
            Ok(Record::Commit) => {
                for record in batch.drain(..) {
                    snapshot.apply(record)?;
                }
                valid_len = replay.offset();
            }
            Ok(record) => batch.push(record),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Stopping WAL replay at corrupt record");
                break;
            }
        }
    }
    Ok((valid_len, file_len))
}

/// A consistent, immutable view of the committed state.
#[derive(Debug, Clone)]
pub struct ReadTxn {
    snapshot: Arc<Snapshot>,
}

impl ReadTxn {
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>> {
        Ok(self.snapshot.table(table)?.get(key).map(|v| v.as_slice()))
    }

    /// Iterates an ordered range of entries, forwards or (with `rev`) backwards.
    pub fn range<'a>(
        &'a self,
        table: Table,
        range: (Bound<&[u8]>, Bound<&[u8]>),
    ) -> Result<impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> + 'a> {
        let map = self.snapshot.table(table)?;
        // BTreeMap::range panics on inverted bounds; they select nothing.
        let empty = match (range.0, range.1) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        };
        let iter = if empty {
            None
        } else {
            Some(map.range::<[u8], _>(range))
        };
        Ok(iter
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    /// Iterates all entries whose key starts with `prefix`.
    pub fn scan_prefix<'a>(
        &'a self,
        table: Table,
        prefix: &[u8],
    ) -> Result<impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> + 'a> {
        let end = prefix_end(prefix);
        let map = self.snapshot.table(table)?;
        let end_bound = match &end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        Ok(map
            .range::<[u8], _>((Bound::Included(prefix), end_bound))
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    pub fn iter(
        &self,
        table: Table,
    ) -> Result<impl DoubleEndedIterator<Item = (&[u8], &[u8])> + '_> {
        Ok(self
            .snapshot
            .table(table)?
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    pub fn len(&self, table: Table) -> Result<usize> {
        Ok(self.snapshot.table(table)?.len())
    }

    pub fn is_empty(&self, table: Table) -> Result<bool> {
        Ok(self.len(table)? == 0)
    }
}

impl KvRead for ReadTxn {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>> {
        ReadTxn::get(self, table, key)
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let i = prefix.iter().rposition(|b| *b != 0xff)?;
    let mut end = prefix[..i].to_vec();
    end.push(prefix[i] + 1);
    Some(end)
}

/// Work run once at commit, before the transaction's changes become visible.
pub type CommitHook = Box<dyn FnOnce(&mut WriteTxn<'_>) -> Result<()>>;

/// The single open write transaction. Dropping it without `commit` discards
/// every change.
pub struct WriteTxn<'env> {
    env: &'env Env,
    wal: MutexGuard<'env, Option<Wal>>,
    base: Arc<Snapshot>,
    pending: Vec<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    hooks: Vec<CommitHook>,
    changes: usize,
}

impl<'env> WriteTxn<'env> {
    fn pending_mut(&mut self, table: Table) -> Result<&mut BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        self.pending
            .get_mut(table.0 as usize)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown table {}", table.0)))
    }

    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending_mut(table)?
            .insert(key.to_vec(), Some(value.to_vec()));
        self.changes += 1;
        Ok(())
    }

    pub fn delete(&mut self, table: Table, key: &[u8]) -> Result<()> {
        self.pending_mut(table)?.insert(key.to_vec(), None);
        self.changes += 1;
        Ok(())
    }

    /// Reads through the pending changes to the state the transaction began on.
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>> {
        let pending = self
            .pending
            .get(table.0 as usize)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown table {}", table.0)))?;
        match pending.get(key) {
            Some(value) => Ok(value.as_deref()),
            None => Ok(self.base.table(table)?.get(key).map(|v| v.as_slice())),
        }
    }

    /// Registers work to run exactly once when the transaction commits.
    pub fn on_commit(&mut self, hook: impl FnOnce(&mut WriteTxn<'_>) -> Result<()> + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Number of puts and deletes so far.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Runs commit hooks, logs the batch and publishes the new snapshot.
    pub fn commit(mut self) -> Result<()> {
        while !self.hooks.is_empty() {
            for hook in std::mem::take(&mut self.hooks) {
                hook(&mut self)?;
            }
        }

        let WriteTxn {
            env,
            mut wal,
            base,
            pending,
            changes,
            ..
        } = self;
        drop(base);

        if pending.iter().all(|p| p.is_empty()) {
            return Ok(());
        }

        let log = wal.as_mut().ok_or(Error::ReadOnly)?;
        for (id, table) in pending.iter().enumerate() {
            for (key, value) in table {
                match value {
                    Some(value) => log.append_put(id as u8, key, value)?,
                    None => log.append_delete(id as u8, key)?,
                }
            }
        }
        log.append_commit()?;
        log.flush(env.options.sync_on_commit)?;

        let published = {
            let mut committed = env.committed.write()?;
            let current = std::mem::take(&mut *committed);
            let mut snapshot = Arc::try_unwrap(current).unwrap_or_else(|arc| (*arc).clone());
            for (id, table) in pending.into_iter().enumerate() {
                if table.is_empty() {
                    continue;
                }
                let map = snapshot.table_mut(id as u8)?;
                for (key, value) in table {
                    match value {
                        Some(value) => {
                            map.insert(key, value);
                        }
                        None => {
                            map.remove(&key);
                        }
                    }
                }
            }
            let published = Arc::new(snapshot);
            *committed = published.clone();
            published
        };

        tracing::debug!(changes, wal_size = log.size(), "Committed write transaction");

        if log.size() > env.options.checkpoint_wal_size {
            env.write_checkpoint(log, &published)?;
        }
        Ok(())
    }
}

impl KvRead for WriteTxn<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>> {
        WriteTxn::get(self, table, key)
    }
}
