use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::warn;

use crate::{
    error::WalError,
    record::Record,
};

/// A single append-only log file.
///
/// [`Wal::append`] does not return until the record is flushed and fsynced,
/// so an acknowledged write survives process death. Recovery replays records
/// until the first framing or checksum failure and treats everything after
/// that point as a torn tail.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| WalError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The record is on stable storage when this returns.
    pub fn append(&mut self, record: &Record) -> Result<(), WalError> {
        let mut buf = Vec::new();
        record.encode(&mut buf);
        self.file.write_all(&buf).map_err(WalError::Durability)?;
        self.file.flush().map_err(WalError::Durability)?;
        self.file.sync_data().map_err(WalError::Durability)?;
        Ok(())
    }

    /// Replay the log from the beginning.
    ///
    /// Stops cleanly at the first record that fails to frame or checksum:
    /// a crash can tear the tail of the file, and a torn tail is by
    /// definition unacknowledged data.
    pub fn recover(&mut self) -> Result<Vec<Record>, WalError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut cursor = bytes.as_slice();
        while !cursor.is_empty() {
            match Record::decode(&mut cursor) {
                Ok(record) => records.push(record),
                Err(err) => {
                    let offset = bytes.len() - cursor.len();
                    warn!(
                        "wal {}: stopping recovery at byte {offset} of {}: {err}",
                        self.path.display(),
                        bytes.len(),
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Drop all records, typically after the memtable they protect has been
    /// flushed to an SSTable.
    pub fn clear(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }
}
