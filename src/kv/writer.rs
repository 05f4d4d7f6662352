use std::time::Instant;

use super::{Env, KvRead, Table, WriteTxn};
use crate::config::CommitConfig;
use crate::error::Result;
use crate::Error;

/// Batches many small writes into few committed transactions.
///
/// A transaction is always open while the writer is alive. `try_commit`
/// commits once the change count or transaction age passes the configured
/// limits. Pending changes reach the store only through `commit`, `try_commit`
/// or `finish`; dropping the writer discards them.
pub struct Writer<'env> {
    env: &'env Env,
    txn: Option<WriteTxn<'env>>,
    config: CommitConfig,
    started: Instant,
}

impl<'env> Writer<'env> {
    pub fn new(env: &'env Env, config: CommitConfig) -> Result<Self> {
        Ok(Self {
            env,
            txn: Some(env.write()?),
            config,
            started: Instant::now(),
        })
    }

    pub fn txn(&mut self) -> Result<&mut WriteTxn<'env>> {
        self.txn
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Writer has no open transaction".to_string()))
    }

    fn txn_ref(&self) -> Result<&WriteTxn<'env>> {
        self.txn
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Writer has no open transaction".to_string()))
    }

    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.txn()?.put(table, key, value)
    }

    pub fn delete(&mut self, table: Table, key: &[u8]) -> Result<()> {
        self.txn()?.delete(table, key)
    }

    /// Changes in the open transaction.
    pub fn uncommitted(&self) -> usize {
        self.txn.as_ref().map_or(0, |txn| txn.changes())
    }

    /// True once the open transaction is large or old enough to commit.
    pub fn should_commit(&self) -> bool {
        let changes = self.uncommitted();
        changes > 0
            && (changes >= self.config.max_uncommitted_changes
                || self.started.elapsed() >= self.config.max_commit_interval)
    }

    /// Commits if `should_commit` says so. Returns whether it did.
    pub fn try_commit(&mut self) -> Result<bool> {
        if self.should_commit() {
            self.commit()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commits the open transaction and begins a fresh one.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
        }
        self.txn = Some(self.env.write()?);
        self.started = Instant::now();
        Ok(())
    }

    /// Commits the open transaction and releases the writer lock.
    pub fn finish(mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.commit(),
            None => Ok(()),
        }
    }
}

impl KvRead for Writer<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<&[u8]>> {
        self.txn_ref()?.get(table, key)
    }
}
