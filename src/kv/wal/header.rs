use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 64;

const WAL_MAGIC: &[u8; 8] = b"SESSDBWL";
const SNAPSHOT_MAGIC: &[u8; 8] = b"SESSDBSN";
const VERSION: u32 = 1;

/// Which of the two record files a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Wal,
    Snapshot,
}

impl FileKind {
    fn magic(&self) -> &'static [u8; 8] {
        match self {
            FileKind::Wal => WAL_MAGIC,
            FileKind::Snapshot => SNAPSHOT_MAGIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub entry_count: u64,
}

impl Header {
    pub fn new(kind: FileKind) -> Self {
        Header {
            magic: *kind.magic(),
            version: VERSION,
            entry_count: 0,
        }
    }

    pub fn validate(&self, kind: FileKind) -> Result<()> {
        if self.magic != *kind.magic() {
            return Err(Error::InvalidWalMagic);
        }
        if self.version != VERSION {
            return Err(Error::UnsupportedWalVersion(self.version));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.entry_count);
        buf
    }

    pub fn decode(bytes: &[u8], kind: FileKind) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        let header = Self {
            magic,
            version: BigEndian::read_u32(&bytes[8..12]),
            entry_count: BigEndian::read_u64(&bytes[12..20]),
        };
        header.validate(kind)?;
        Ok(header)
    }
}
