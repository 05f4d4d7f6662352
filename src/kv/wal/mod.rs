//! Write-ahead log and checkpoint files for the KV engine.
//!
//! Both files share one binary format:
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+---------------------------+-----------+
//! |len:u32    | payload                   |crc32:u32  |
//! +-----------+---------------------------+-----------+
//! ```
//!
//! The payload starts with a kind byte:
//!
//! - `PUT`: table:u8, key_len:u32, value_len:u32, key, value
//! - `DELETE`: table:u8, key_len:u32, key
//! - `COMMIT`: nothing. Terminates a batch; records after the last commit
//!   are discarded on replay.
//!
//! All multi-byte integers are big-endian and the CRC32 covers the payload.

pub mod header;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;
use header::{FileKind, Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_COMMIT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put {
        table: u8,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: u8,
        key: Vec<u8>,
    },
    Commit,
}

fn encode_put(table: u8, key: &[u8], value: &[u8], payload: &mut Vec<u8>) -> Result<()> {
    payload.write_u8(KIND_PUT)?;
    payload.write_u8(table)?;
    payload.write_u32::<BigEndian>(key.len() as u32)?;
    payload.write_u32::<BigEndian>(value.len() as u32)?;
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);
    Ok(())
}

fn encode_delete(table: u8, key: &[u8], payload: &mut Vec<u8>) -> Result<()> {
    payload.write_u8(KIND_DELETE)?;
    payload.write_u8(table)?;
    payload.write_u32::<BigEndian>(key.len() as u32)?;
    payload.extend_from_slice(key);
    Ok(())
}

fn write_framed<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
    Ok(payload.len() as u64 + 8)
}

impl Record {
    fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = payload;
        let kind = cursor.read_u8()?;
        match kind {
            KIND_PUT => {
                let table = cursor.read_u8()?;
                let key_len = cursor.read_u32::<BigEndian>()? as usize;
                let value_len = cursor.read_u32::<BigEndian>()? as usize;
                if cursor.len() != key_len + value_len {
                    return Err(Error::InvalidData("Put record length mismatch".to_string()));
                }
                let (key, value) = cursor.split_at(key_len);
                Ok(Record::Put {
                    table,
                    key: key.to_vec(),
                    value: value.to_vec(),
                })
            }
            KIND_DELETE => {
                let table = cursor.read_u8()?;
                let key_len = cursor.read_u32::<BigEndian>()? as usize;
                if cursor.len() != key_len {
                    return Err(Error::InvalidData(
                        "Delete record length mismatch".to_string(),
                    ));
                }
                Ok(Record::Delete {
                    table,
                    key: cursor.to_vec(),
                })
            }
            KIND_COMMIT => Ok(Record::Commit),
            other => Err(Error::InvalidData(format!("Unknown record kind {}", other))),
        }
    }
}

pub struct Wal {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    header: Header,
    size: u64,
    payload: Vec<u8>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl Wal {
    /// Opens the log at `path`, creating it with a fresh header if it is
    /// missing or empty. Appends go to the end of the file.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let header = if file.metadata()?.len() == 0 {
            let h = Header::new(FileKind::Wal);
            file.write_all_at(&h.encode(), 0)?;
            file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact_at(&mut buf, 0)?;
            Header::decode(&buf, FileKind::Wal)?
        };

        let size = file.seek(SeekFrom::End(0))?;
        let writer = BufWriter::with_capacity(buffer_size, file.try_clone()?);

        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
            header,
            size,
            payload: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the log, including buffered appends.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    fn append_payload(&mut self) -> Result<()> {
        self.size += write_framed(&mut self.writer, &self.payload)?;
        self.header.entry_count += 1;
        self.payload.clear();
        Ok(())
    }

    pub fn append_put(&mut self, table: u8, key: &[u8], value: &[u8]) -> Result<()> {
        encode_put(table, key, value, &mut self.payload)?;
        self.append_payload()
    }

    pub fn append_delete(&mut self, table: u8, key: &[u8]) -> Result<()> {
        encode_delete(table, key, &mut self.payload)?;
        self.append_payload()
    }

    pub fn append_commit(&mut self) -> Result<()> {
        self.payload.write_u8(KIND_COMMIT)?;
        self.append_payload()
    }

    /// Flushes buffered appends and rewrites the header, optionally fsyncing.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        self.writer.flush()?;
        self.file.write_all_at(&self.header.encode(), 0)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cuts the log back to `len` bytes, dropping everything after it.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.writer.flush()?;
        self.file.set_len(len)?;
        self.writer.get_mut().seek(SeekFrom::Start(len))?;
        self.size = len;
        self.file.sync_all()?;
        Ok(())
    }

    /// Empties the log after a checkpoint.
    pub fn reset(&mut self) -> Result<()> {
        self.header.entry_count = 0;
        self.truncate(HEADER_SIZE as u64)?;
        self.flush(true)
    }

    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path, FileKind::Wal)
    }
}

/// Writes a checkpoint of `entries` to `path` atomically: the records go to a
/// temporary sibling which is synced and renamed over `path`.
pub fn write_snapshot<'a>(
    path: &Path,
    entries: impl Iterator<Item = (u8, &'a [u8], &'a [u8])>,
) -> Result<u64> {
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file.try_clone()?);

    let mut header = Header::new(FileKind::Snapshot);
    writer.write_all(&header.encode())?;

    let mut payload = Vec::new();
    for (table, key, value) in entries {
        encode_put(table, key, value, &mut payload)?;
        write_framed(&mut writer, &payload)?;
        payload.clear();
        header.entry_count += 1;
    }
    payload.write_u8(KIND_COMMIT)?;
    write_framed(&mut writer, &payload)?;
    writer.flush()?;
    drop(writer);

    file.write_all_at(&header.encode(), 0)?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(header.entry_count)
}

pub struct ReplayIterator {
    reader: BufReader<File>,
    offset: u64,
}

impl ReplayIterator {
    pub fn new(path: &Path, kind: FileKind) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Header::decode(&buf, kind)?;

        Ok(ReplayIterator {
            reader,
            offset: HEADER_SIZE as u64,
        })
    }

    /// File offset just past the last record read successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read<R: Read>(reader: &mut R) -> Result<Option<(Record, u64)>> {
        let record_len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; record_len];
        if let Err(e) = reader.read_exact(&mut payload) {
            return Err(Error::InvalidData(format!("Failed to read payload: {}", e)));
        }

        let stored_crc = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::InvalidData(format!("Failed to read checksum: {}", e)))?;

        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::InvalidData("Checksum mismatch".to_string()));
        }

        let record = Record::decode(&payload)?;
        Ok(Some((record, record_len as u64 + 8)))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match ReplayIterator::read(&mut self.reader) {
            Ok(Some((record, len))) => {
                self.offset += len;
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
