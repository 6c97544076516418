//! Transaction bookkeeping: id allocation and staged operation buffers.
//!
//! Staged operations are invisible to other sessions until commit. The
//! database drives the commit itself (validation, the WAL commit record and
//! the application of ops live there); this module owns the lifecycle.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tissdb_model::{
    buffer::{self, BufReader, BufWriter, DecodeError},
    deserialize_document, serialize_document, Document,
};

use crate::error::StorageError;

pub type TxnId = u64;

/// One staged operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    Put {
        collection: String,
        key: String,
        doc: Document,
    },
    Delete {
        collection: String,
        key: String,
    },
}

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

impl TxnOp {
    pub fn collection(&self) -> &str {
        match self {
            TxnOp::Put { collection, .. } | TxnOp::Delete { collection, .. } => collection,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key, .. } => key,
        }
    }

    /// Encode a whole op list; the inverse of [`TxnOp::decode_ops`]. This is
    /// the payload of a `TXN_COMMIT` WAL record.
    pub fn encode_ops(ops: &[TxnOp]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32(ops.len() as u32);
        for op in ops {
            match op {
                TxnOp::Put { collection, key, doc } => {
                    out.put_u8(OP_PUT);
                    buffer::put_str(&mut out, collection);
                    buffer::put_str(&mut out, key);
                    buffer::put_bytes(&mut out, &serialize_document(doc));
                }
                TxnOp::Delete { collection, key } => {
                    out.put_u8(OP_DELETE);
                    buffer::put_str(&mut out, collection);
                    buffer::put_str(&mut out, key);
                }
            }
        }
        out
    }

    pub fn decode_ops(payload: &[u8]) -> Result<Vec<TxnOp>, DecodeError> {
        let mut buf = payload;
        let count = buf.get_u32()? as usize;
        let mut ops = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let tag = buf.get_u8()?;
            let collection = buffer::get_str(&mut buf)?;
            let key = buffer::get_str(&mut buf)?;
            ops.push(match tag {
                OP_PUT => {
                    let doc_bytes = buffer::get_bytes(&mut buf)?;
                    TxnOp::Put {
                        collection,
                        key,
                        doc: deserialize_document(&doc_bytes)?,
                    }
                }
                OP_DELETE => TxnOp::Delete { collection, key },
                tag => return Err(DecodeError::InvalidTag { tag, kind: "txn op" }),
            });
        }
        Ok(ops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub state: TxnState,
    pub ops: Vec<TxnOp>,
}

/// Allocates ids and tracks active transactions.
#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: AtomicU64,
    active: Mutex<HashMap<TxnId, Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            id,
            Transaction {
                id,
                state: TxnState::Active,
                ops: Vec::new(),
            },
        );
        id
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.active.lock().contains_key(&id)
    }

    pub fn stage(&self, id: TxnId, op: TxnOp) -> Result<(), StorageError> {
        let mut active = self.active.lock();
        let txn = active
            .get_mut(&id)
            .ok_or(StorageError::TransactionNotActive(id))?;
        txn.ops.push(op);
        Ok(())
    }

    /// Staged ops of an active transaction, for overlaying reads.
    pub fn ops(&self, id: TxnId) -> Result<Vec<TxnOp>, StorageError> {
        let active = self.active.lock();
        let txn = active
            .get(&id)
            .ok_or(StorageError::TransactionNotActive(id))?;
        Ok(txn.ops.clone())
    }

    /// Remove the transaction for commit. Once taken it can no longer be
    /// staged to; a failed commit simply never applies the returned ops.
    pub fn take(&self, id: TxnId) -> Result<Vec<TxnOp>, StorageError> {
        self.active
            .lock()
            .remove(&id)
            .map(|txn| txn.ops)
            .ok_or(StorageError::TransactionNotActive(id))
    }

    /// Discard the staged ops. Rolling back a transaction that no longer
    /// exists is fine; session teardown rolls back defensively.
    pub fn rollback(&self, id: TxnId) {
        self.active.lock().remove(&id);
    }
}
