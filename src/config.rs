use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Physical encoding strategy for session keys.
///
/// Chosen once when a store is created and fixed for the life of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    UidLookup,
    HashLookup,
    Variable,
}

impl KeyType {
    /// True for the strategies that may route key content through a lookup table.
    pub fn may_use_lookup(&self) -> bool {
        matches!(
            self,
            KeyType::UidLookup | KeyType::HashLookup | KeyType::Variable
        )
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Boolean => "BOOLEAN",
            KeyType::Byte => "BYTE",
            KeyType::Short => "SHORT",
            KeyType::Int => "INT",
            KeyType::Long => "LONG",
            KeyType::Float => "FLOAT",
            KeyType::Double => "DOUBLE",
            KeyType::String => "STRING",
            KeyType::UidLookup => "UID_LOOKUP",
            KeyType::HashLookup => "HASH_LOOKUP",
            KeyType::Variable => "VARIABLE",
        };
        f.write_str(name)
    }
}

/// Precision that session start and end instants are truncated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemporalPrecision {
    Nanosecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

/// Width of the content hash used by hash lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashLength {
    Integer,
    Long,
}

impl HashLength {
    pub fn bytes(&self) -> usize {
        match self {
            HashLength::Integer => 4,
            HashLength::Long => 8,
        }
    }
}

/// Configuration for a session store
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding the store's files
    pub dir: PathBuf,

    /// Key encoding strategy (default: Variable)
    pub key_type: KeyType,

    /// Precision of stored instants (default: Millisecond)
    pub temporal_precision: TemporalPrecision,

    /// Hash width for hash lookup backed schemas (default: Long)
    pub hash_length: HashLength,

    /// Upper bound on the width of an encoded session key (default: 511)
    pub max_key_length: usize,

    /// WAL buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// fsync the WAL on every commit (default: true)
    pub sync_on_commit: bool,

    /// WAL size that triggers a checkpoint after commit (default: 64MB)
    pub checkpoint_wal_size: u64,

    /// Write batching configuration
    pub commit: CommitConfig,
}

#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Uncommitted changes that force a commit (default: 10000)
    pub max_uncommitted_changes: usize,

    /// Age of the open write transaction that forces a commit (default: 10s)
    pub max_commit_interval: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_uncommitted_changes: 10_000,
            max_commit_interval: Duration::from_secs(10),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./sessiondb"),
            key_type: KeyType::Variable,
            temporal_precision: TemporalPrecision::Millisecond,
            hash_length: HashLength::Long,
            max_key_length: 511,
            wal_buffer_size: 64 * 1024, // 64KB
            sync_on_commit: true,
            checkpoint_wal_size: 64 * 1024 * 1024, // 64MB
            commit: CommitConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the key encoding strategy
    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Set the temporal precision
    pub fn temporal_precision(mut self, precision: TemporalPrecision) -> Self {
        self.temporal_precision = precision;
        self
    }

    /// Set the hash length
    pub fn hash_length(mut self, hash_length: HashLength) -> Self {
        self.hash_length = hash_length;
        self
    }

    /// Set the maximum encoded key length
    pub fn max_key_length(mut self, len: usize) -> Self {
        self.max_key_length = len;
        self
    }

    /// Set WAL buffer size
    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    /// Enable or disable fsync on commit
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Set the WAL size that triggers a checkpoint
    pub fn checkpoint_wal_size(mut self, size: u64) -> Self {
        self.checkpoint_wal_size = size;
        self
    }

    /// Configure write batching
    pub fn commit(mut self, config: CommitConfig) -> Self {
        self.commit = config;
        self
    }

    /// Same settings rooted at another directory.
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }
}

impl CommitConfig {
    /// Set the uncommitted change threshold
    pub fn max_uncommitted_changes(mut self, changes: usize) -> Self {
        self.max_uncommitted_changes = changes;
        self
    }

    /// Set the maximum write transaction age
    pub fn max_commit_interval(mut self, interval: Duration) -> Self {
        self.max_commit_interval = interval;
        self
    }
}
