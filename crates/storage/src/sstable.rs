//! Immutable sorted on-disk runs.
//!
//! File layout: a sequence of `key_len:u32 | key | val_len:u64 | val`
//! entries in ascending key order, followed by a CRC32C over everything
//! before it. A `val_len` of [`TOMBSTONE_LEN`] marks a deletion. A sparse
//! in-memory index samples every [`SPARSE_INDEX_INTERVAL`]th key so lookups
//! only scan one segment of the file.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::warn;
use tissdb_model::{deserialize_document, ser, Document};

use crate::{error::StorageError, memtable::Memtable};

pub(crate) const TOMBSTONE_LEN: u64 = u64::MAX;
const SPARSE_INDEX_INTERVAL: usize = 16;
const CRC_LEN: u64 = 4;

/// One immutable sorted table.
#[derive(Debug)]
pub struct SsTable {
    path: PathBuf,
    /// Every Nth key, with the byte offset its entry starts at.
    sparse_index: Vec<(String, u64)>,
    /// Length of the entry region (the file minus its trailing checksum).
    data_len: u64,
    /// Set when the file failed its checksum; the table then reads as empty.
    corrupt: bool,
}

impl SsTable {
    /// Open an existing table, verify its checksum and build the sparse
    /// index. A table whose checksum does not match is kept (so compaction
    /// can drop it) but serves no entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len < CRC_LEN {
            warn!("sstable {}: shorter than its checksum, treating as empty", path.display());
            return Ok(Self {
                path,
                sparse_index: Vec::new(),
                data_len: 0,
                corrupt: true,
            });
        }

        let data_len = file_len - CRC_LEN;
        let mut data = vec![0u8; data_len as usize];
        file.read_exact(&mut data)?;
        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;
        if crc32c::crc32c(&data) != u32::from_be_bytes(crc_bytes) {
            warn!("sstable {}: checksum mismatch, treating as empty", path.display());
            return Ok(Self {
                path,
                sparse_index: Vec::new(),
                data_len: 0,
                corrupt: true,
            });
        }

        let mut sparse_index = Vec::new();
        let mut cursor = data.as_slice();
        let mut offset = 0u64;
        let mut n = 0usize;
        while !cursor.is_empty() {
            let before = cursor.len();
            let (key, value) = read_entry(&mut cursor)
                .map_err(|reason| StorageError::corrupt(&path, reason))?;
            if n % SPARSE_INDEX_INTERVAL == 0 {
                sparse_index.push((key, offset));
            }
            let _ = value;
            offset += (before - cursor.len()) as u64;
            n += 1;
        }

        Ok(Self {
            path,
            sparse_index,
            data_len,
            corrupt: false,
        })
    }

    /// Write a new table from a memtable snapshot and open it.
    pub fn write_from_memtable(dir: &Path, memtable: &Memtable) -> Result<Self, StorageError> {
        let entries = memtable
            .iter()
            .map(|(key, doc)| (key.clone(), doc.map(ser::serialize_document)));
        Self::write_entries(dir, entries)
    }

    /// Write a new table from already-sorted `(key, value)` pairs.
    pub(crate) fn write_entries(
        dir: &Path,
        entries: impl IntoIterator<Item = (String, Option<Vec<u8>>)>,
    ) -> Result<Self, StorageError> {
        let path = next_table_path(dir);
        let mut data = Vec::new();
        for (key, value) in entries {
            data.extend_from_slice(&(key.len() as u32).to_be_bytes());
            data.extend_from_slice(key.as_bytes());
            match value {
                Some(bytes) => {
                    data.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
                    data.extend_from_slice(&bytes);
                }
                None => data.extend_from_slice(&TOMBSTONE_LEN.to_be_bytes()),
            }
        }
        let crc = crc32c::crc32c(&data);

        let mut file = File::create(&path)?;
        file.write_all(&data)?;
        file.write_all(&crc.to_be_bytes())?;
        file.sync_all()?;

        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup. `None` = key absent, `Some(None)` = tombstone.
    pub fn find(&self, key: &str) -> Result<Option<Option<Document>>, StorageError> {
        if self.corrupt || self.sparse_index.is_empty() {
            return Ok(None);
        }
        // Find the last sampled key <= key; the entry, if present, lives in
        // the segment starting there.
        let slot = match self
            .sparse_index
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
        {
            Ok(i) => i,
            Err(0) => return Ok(None),
            Err(i) => i - 1,
        };
        let start = self.sparse_index[slot].1;
        let end = self
            .sparse_index
            .get(slot + 1)
            .map(|(_, off)| *off)
            .unwrap_or(self.data_len);

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut segment = vec![0u8; (end - start) as usize];
        file.read_exact(&mut segment)?;

        let mut cursor = segment.as_slice();
        while !cursor.is_empty() {
            let (entry_key, value) =
                read_entry(&mut cursor).map_err(|reason| StorageError::corrupt(&self.path, reason))?;
            match entry_key.as_str().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Equal => {
                    return Ok(Some(match value {
                        Some(bytes) => Some(deserialize_document(&bytes)?),
                        None => None,
                    }))
                }
            }
        }
        Ok(None)
    }

    /// Stream all entries, tombstones included, as raw value bytes.
    pub(crate) fn scan_raw(&self) -> Result<Vec<(String, Option<Vec<u8>>)>, StorageError> {
        if self.corrupt {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut data = vec![0u8; self.data_len as usize];
        reader.read_exact(&mut data)?;

        let mut out = Vec::new();
        let mut cursor = data.as_slice();
        while !cursor.is_empty() {
            let entry =
                read_entry(&mut cursor).map_err(|reason| StorageError::corrupt(&self.path, reason))?;
            out.push(entry);
        }
        Ok(out)
    }

    /// All live and deleted entries as documents.
    pub fn scan(&self) -> Result<Vec<(String, Option<Document>)>, StorageError> {
        self.scan_raw()?
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    key,
                    match value {
                        Some(bytes) => Some(deserialize_document(&bytes)?),
                        None => None,
                    },
                ))
            })
            .collect()
    }

    /// Merge `tables` (given newest first) into a single new table.
    ///
    /// The newest value for each key wins. Tombstones are carried over unless
    /// `drop_tombstones` is set, which is only sound when the merge covers
    /// every older table that could hold a shadowed value.
    pub fn merge(
        dir: &Path,
        tables: &[&SsTable],
        drop_tombstones: bool,
    ) -> Result<Self, StorageError> {
        let mut merged: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
        // Oldest first, so newer tables overwrite.
        for table in tables.iter().rev() {
            for (key, value) in table.scan_raw()? {
                merged.insert(key, value);
            }
        }
        let entries = merged
            .into_iter()
            .filter(|(_, value)| !(drop_tombstones && value.is_none()));
        Self::write_entries(dir, entries)
    }
}

fn read_entry(cursor: &mut &[u8]) -> Result<(String, Option<Vec<u8>>), String> {
    let key_len = take(cursor, 4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))? as usize;
    let key_bytes = take(cursor, key_len)?;
    let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| "entry key is not UTF-8".to_owned())?;
    let val_len = take(cursor, 8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))?;
    if val_len == TOMBSTONE_LEN {
        return Ok((key, None));
    }
    let value = take(cursor, val_len as usize)?.to_vec();
    Ok((key, Some(value)))
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], String> {
    if cursor.len() < len {
        return Err(format!("entry truncated: needed {len} bytes, have {}", cursor.len()));
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head)
}

/// Pick a fresh `sstable_<ms>.db` name; the millisecond stamp is bumped until
/// it does not collide so that names stay monotonic within a directory.
fn next_table_path(dir: &Path) -> PathBuf {
    let mut ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    loop {
        let path = dir.join(format!("sstable_{ms}.db"));
        if !path.exists() {
            return path;
        }
        ms += 1;
    }
}
