use byteorder::{BigEndian, ByteOrder};

use crate::encoding::format::Raw;
use crate::error::Result;
use crate::kv::{KvRead, Table, WriteTxn};
use crate::Error;

/// Width of an encoded uid.
pub const UID_WIDTH: usize = 4;

const NEXT_UID_KEY: &[u8] = b"uid_next";

/// Interns content behind sequential `u32` ids.
///
/// Ids start at 0 and are assigned in first-seen order. The next id is kept
/// in the info table and only ever grows, so ids are never reused.
#[derive(Debug, Clone)]
pub struct UidLookupTable {
    forward: Table,
    reverse: Table,
    info: Table,
    max_length: usize,
}

impl UidLookupTable {
    /// `forward` maps uid to content, `reverse` content to uid.
    pub fn new(forward: Table, reverse: Table, info: Table, max_length: usize) -> Self {
        Self {
            forward,
            reverse,
            info,
            max_length,
        }
    }

    pub fn encode_uid(uid: u32) -> [u8; UID_WIDTH] {
        uid.to_be_bytes()
    }

    pub fn decode_uid(bytes: &[u8]) -> Result<u32> {
        if bytes.len() < UID_WIDTH {
            return Err(Error::InvalidData(format!(
                "uid needs {} bytes, got {}",
                UID_WIDTH,
                bytes.len()
            )));
        }
        Ok(BigEndian::read_u32(&bytes[..UID_WIDTH]))
    }

    /// Returns the uid of `content`, assigning the next one if it is new.
    pub fn get_or_create(&self, txn: &mut WriteTxn<'_>, content: &[u8]) -> Result<u32> {
        if content.len() > self.max_length {
            return Err(Error::ValueTooLarge {
                field: "uid lookup content",
                len: content.len(),
                max: self.max_length,
            });
        }
        if let Some(uid) = self.find(&*txn, content)? {
            return Ok(uid);
        }

        let uid = self.next_uid(&*txn)?;
        let next = uid
            .checked_add(1)
            .ok_or_else(|| Error::InvalidState("uid space exhausted".to_string()))?;

        txn.put(self.forward, &Self::encode_uid(uid), content)?;
        txn.put(self.reverse, content, &Self::encode_uid(uid))?;
        txn.put(self.info, NEXT_UID_KEY, &next.to_be_bytes())?;
        tracing::trace!(uid, content = %Raw::bytes(content), "Assigned uid");
        Ok(uid)
    }

    /// Content for `uid`, if assigned.
    pub fn get<'r, R: KvRead + ?Sized>(&self, reader: &'r R, uid: u32) -> Result<Option<&'r [u8]>> {
        reader.get(self.forward, &Self::encode_uid(uid))
    }

    /// Uid already assigned to `content`, without assigning one.
    pub fn find<R: KvRead + ?Sized>(&self, reader: &R, content: &[u8]) -> Result<Option<u32>> {
        reader
            .get(self.reverse, content)?
            .map(Self::decode_uid)
            .transpose()
    }

    /// Number of uids assigned so far.
    pub fn next_uid<R: KvRead + ?Sized>(&self, reader: &R) -> Result<u32> {
        Ok(reader
            .get(self.info, NEXT_UID_KEY)?
            .map(Self::decode_uid)
            .transpose()?
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Env, EnvOptions};
    use tempfile::TempDir;

    const FORWARD: Table = Table::new(0);
    const REVERSE: Table = Table::new(1);
    const INFO: Table = Table::new(2);

    fn open(dir: &TempDir) -> Result<Env> {
        Env::open(dir.path(), &["uid", "uid_index", "info"], EnvOptions::default())
    }

    fn table() -> UidLookupTable {
        UidLookupTable::new(FORWARD, REVERSE, INFO, 16)
    }

    #[test]
    fn test_sequential_ids_and_dedup() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let uids = table();

        let mut txn = env.write()?;
        assert_eq!(uids.get_or_create(&mut txn, b"alpha")?, 0);
        assert_eq!(uids.get_or_create(&mut txn, b"beta")?, 1);
        assert_eq!(uids.get_or_create(&mut txn, b"alpha")?, 0);
        txn.commit()?;

        let read = env.read()?;
        assert_eq!(uids.get(&read, 0)?, Some(&b"alpha"[..]));
        assert_eq!(uids.get(&read, 1)?, Some(&b"beta"[..]));
        assert_eq!(uids.get(&read, 2)?, None);
        assert_eq!(uids.find(&read, b"beta")?, Some(1));
        assert_eq!(uids.find(&read, b"gamma")?, None);
        assert_eq!(read.len(FORWARD)?, 2);
        assert_eq!(uids.next_uid(&read)?, 2);
        Ok(())
    }

    #[test]
    fn test_ids_survive_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let env = open(&dir)?;
            let mut txn = env.write()?;
            table().get_or_create(&mut txn, b"alpha")?;
            txn.commit()?;
        }

        let env = open(&dir)?;
        let mut txn = env.write()?;
        assert_eq!(table().get_or_create(&mut txn, b"alpha")?, 0);
        assert_eq!(table().get_or_create(&mut txn, b"beta")?, 1);
        Ok(())
    }

    #[test]
    fn test_aborted_assignment_is_not_visible() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        {
            let mut txn = env.write()?;
            table().get_or_create(&mut txn, b"alpha")?;
        }
        let read = env.read()?;
        assert_eq!(table().find(&read, b"alpha")?, None);
        assert_eq!(table().next_uid(&read)?, 0);
        Ok(())
    }

    #[test]
    fn test_rejects_oversized_content() -> Result<()> {
        let dir = TempDir::new()?;
        let env = open(&dir)?;
        let mut txn = env.write()?;
        let result = table().get_or_create(&mut txn, &[b'x'; 17]);
        assert!(matches!(result, Err(Error::ValueTooLarge { len: 17, .. })));
        assert_eq!(txn.changes(), 0);
        Ok(())
    }
}
