use std::{io, path::PathBuf};

use thiserror::Error;
use tissdb_model::DecodeError;

/// A checksum mismatch was detected.
///
/// During recovery this marks the torn tail of the log, not a hard error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

/// Error decoding a single log record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("unknown record kind {0:#04x}")]
    UnknownKind(u8),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Checksum(#[from] ChecksumMismatch),
}

/// Error surfaced by [`crate::Wal`] operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("failed to open write-ahead log at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The append was not made durable; the caller must not treat the write
    /// as acknowledged.
    #[error("failed to flush write-ahead log append")]
    Durability(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
