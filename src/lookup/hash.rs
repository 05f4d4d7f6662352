use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::encoding::format::Raw;
use crate::error::Result;
use crate::hasher::ContentHash;
use crate::kv::{KvRead, Table, WriteTxn};
use crate::Error;

const CLASH_INDEX_WIDTH: usize = 2;
const CLASH_COUNT_KEY: &[u8] = b"hash_clash_count";

/// Deduplicates content of any length behind a fixed-width hash key.
///
/// Entries are keyed by `hash(content) ‖ clash_index`. Content whose hash
/// is already taken by different content moves to the next free clash index,
/// so lookups probe from index 0 until they find the content or a free slot.
/// The full entry key is the surrogate id.
#[derive(Clone)]
pub struct HashLookupTable {
    table: Table,
    info: Table,
    hasher: Arc<dyn ContentHash>,
}

impl std::fmt::Debug for HashLookupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashLookupTable")
            .field("table", &self.table)
            .field("width", &self.width())
            .finish()
    }
}

impl HashLookupTable {
    pub fn new(table: Table, info: Table, hasher: Arc<dyn ContentHash>) -> Self {
        Self {
            table,
            info,
            hasher,
        }
    }

    /// Width of every surrogate id.
    pub fn width(&self) -> usize {
        self.hasher.width() + CLASH_INDEX_WIDTH
    }

    fn slot(hash: &[u8], index: u16) -> Vec<u8> {
        let mut key = Vec::with_capacity(hash.len() + CLASH_INDEX_WIDTH);
        key.extend_from_slice(hash);
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    /// Walks the clash chain for `content`: `Ok(id)` when found, `Err(id)`
    /// with the first free slot otherwise.
    fn probe<R: KvRead + ?Sized>(
        &self,
        reader: &R,
        content: &[u8],
    ) -> Result<std::result::Result<Vec<u8>, (Vec<u8>, u16)>> {
        let hash = self.hasher.hash(content);
        for index in 0..=u16::MAX {
            let key = Self::slot(&hash, index);
            match reader.get(self.table, &key)? {
                Some(existing) if existing == content => return Ok(Ok(key)),
                Some(_) => continue,
                None => return Ok(Err((key, index))),
            }
        }
        Err(Error::InvalidState(format!(
            "Hash bucket {} is full",
            Raw::hex(&hash)
        )))
    }

    /// Stores `content` if absent and returns its surrogate id.
    pub fn put(&self, txn: &mut WriteTxn<'_>, content: &[u8]) -> Result<Vec<u8>> {
        match self.probe(&*txn, content)? {
            Ok(id) => Ok(id),
            Err((id, index)) => {
                txn.put(self.table, &id, content)?;
                if index > 0 {
                    tracing::debug!(
                        id = %Raw::hex(&id),
                        clash_index = index,
                        "Hash clash, content stored at next free index"
                    );
                    let info = self.info;
                    txn.on_commit(move |txn| {
                        let count = clash_count(&*txn, info)?;
                        txn.put(info, CLASH_COUNT_KEY, &(count + 1).to_be_bytes())
                    });
                }
                Ok(id)
            }
        }
    }

    /// Surrogate id of `content` if it is stored.
    pub fn get<R: KvRead + ?Sized>(&self, reader: &R, content: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.probe(reader, content)?.ok())
    }

    /// Content stored under surrogate id `id`.
    pub fn resolve<'r, R: KvRead + ?Sized>(
        &self,
        reader: &'r R,
        id: &[u8],
    ) -> Result<Option<&'r [u8]>> {
        if id.len() != self.width() {
            return Err(Error::InvalidData(format!(
                "Hash lookup id {} should be {} bytes",
                Raw::hex(id),
                self.width()
            )));
        }
        reader.get(self.table, id)
    }

    /// Number of entries stored at a clash index above zero.
    pub fn clash_count<R: KvRead + ?Sized>(&self, reader: &R) -> Result<u64> {
        clash_count(reader, self.info)
    }
}

fn clash_count<R: KvRead + ?Sized>(reader: &R, info: Table) -> Result<u64> {
    match reader.get(info, CLASH_COUNT_KEY)? {
        Some(bytes) if bytes.len() == 8 => Ok(BigEndian::read_u64(bytes)),
        Some(bytes) => Err(Error::InvalidData(format!(
            "Clash count should be 8 bytes, got {}",
            bytes.len()
        ))),
        None => Ok(0),
    }
}
