use std::{io, path::PathBuf};

use thiserror::Error;
use tissdb_model::{DecodeError, SchemaError};
use tissdb_wal::WalError;

use crate::txn::TxnId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database `{0}` not found")]
    DatabaseNotFound(String),
    #[error("database `{0}` already exists")]
    DatabaseExists(String),
    #[error("collection `{0}` not found")]
    CollectionNotFound(String),
    #[error("collection `{0}` already exists")]
    CollectionExists(String),
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaError),
    #[error("primary key violation: {0}")]
    PrimaryKey(String),
    #[error(
        "foreign key violation: `{field}` = `{value}` has no match in collection `{collection}`"
    )]
    ForeignKey {
        field: String,
        value: String,
        collection: String,
    },
    #[error("unique constraint violated for index `{index}` with key `{key}`")]
    Unique { index: String, key: String },
    #[error("index `{0}` not found")]
    IndexNotFound(String),
    #[error("invalid index definition: {0}")]
    InvalidIndex(String),
    #[error("transaction {0} is not active")]
    TransactionNotActive(TxnId),
    /// The write-ahead log append failed; the operation was not acknowledged
    /// and in-memory state was left untouched. The caller may retry.
    #[error("write-ahead log failure")]
    Durability(#[from] WalError),
    #[error("corrupt data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
