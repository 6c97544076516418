mod error;
mod record;
mod wal;

pub use crate::{
    error::{ChecksumMismatch, RecordError, WalError},
    record::{Record, RecordKind, NO_TXN},
    wal::Wal,
};
