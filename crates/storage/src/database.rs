//! The per-database root: a named set of collections, cross-collection
//! constraint checks, and transactional commit.
//!
//! Lock discipline: any operation that needs more than one collection
//! acquires them in collection-name order, which keeps concurrent commits
//! and foreign-key checks deadlock-free. Commits hold the write locks of
//! every touched collection from validation through application, so readers
//! never observe half a transaction.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use tissdb_model::{Document, Schema};
use tissdb_wal::{Record, RecordKind, Wal};

use crate::{
    collection::{self, Collection, CollectionOptions},
    error::StorageError,
    index::IndexKind,
    txn::{TransactionManager, TxnId, TxnOp},
};

const DB_WAL_FILE: &str = "wal.log";

/// One database: a directory of collections plus a database-level WAL that
/// carries collection DDL and transaction commit records.
pub struct Database {
    name: String,
    path: PathBuf,
    options: CollectionOptions,
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
    wal: Mutex<Wal>,
    txns: TransactionManager,
}

impl Database {
    /// Open the database at `path`, discovering collection subdirectories
    /// and replaying the database WAL (committed transactions included).
    pub fn open(
        name: &str,
        path: impl Into<PathBuf>,
        options: CollectionOptions,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        let mut collections = BTreeMap::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(collection_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let collection = Collection::open(&path, &collection_name, options)?;
            collections.insert(collection_name, Arc::new(collection));
        }

        let mut wal = Wal::open(path.join(DB_WAL_FILE))?;
        let records = wal.recover()?;

        let db = Self {
            name: name.to_owned(),
            path,
            options,
            collections: RwLock::new(collections),
            wal: Mutex::new(wal),
            txns: TransactionManager::new(),
        };
        db.replay(records)?;
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(&self, records: Vec<Record>) -> Result<(), StorageError> {
        let mut replayed = 0usize;
        for record in records {
            match record.kind {
                RecordKind::CreateCollection => {
                    let schema = if record.payload.is_empty() {
                        None
                    } else {
                        serde_json::from_slice::<Schema>(&record.payload).ok()
                    };
                    if self.collection(&record.collection).is_err() {
                        self.create_collection_quiet(&record.collection, schema)?;
                    }
                }
                RecordKind::DeleteCollection => {
                    let _ = self.drop_collection_dir(&record.collection);
                }
                RecordKind::TxnCommit => {
                    // Re-apply committed ops; collection-level replay may
                    // already hold them, and re-application is idempotent.
                    let ops = match TxnOp::decode_ops(&record.payload) {
                        Ok(ops) => ops,
                        Err(err) => {
                            warn!("database {}: bad TXN_COMMIT payload: {err}", self.name);
                            continue;
                        }
                    };
                    replayed += 1;
                    self.apply_ops(&ops, record.txn_id)?;
                }
                _ => {}
            }
        }
        if replayed > 0 {
            info!("database {}: re-applied {replayed} committed transactions", self.name);
        }
        Ok(())
    }

    // Collection management

    pub fn create_collection(
        &self,
        name: &str,
        schema: Option<Schema>,
    ) -> Result<(), StorageError> {
        if self.collections.read().contains_key(name) {
            return Err(StorageError::CollectionExists(name.to_owned()));
        }
        let payload = match &schema {
            Some(schema) => serde_json::to_vec(schema)
                .map_err(|e| StorageError::corrupt(&self.path, e.to_string()))?,
            None => Vec::new(),
        };
        self.wal
            .lock()
            .append(&Record::create_collection(name, payload))?;
        self.create_collection_quiet(name, schema)
    }

    fn create_collection_quiet(
        &self,
        name: &str,
        schema: Option<Schema>,
    ) -> Result<(), StorageError> {
        let collection = Collection::open(&self.path, name, self.options)?;
        if let Some(schema) = schema {
            collection.set_schema(schema)?;
        }
        self.collections
            .write()
            .insert(name.to_owned(), Arc::new(collection));
        Ok(())
    }

    pub fn delete_collection(&self, name: &str) -> Result<(), StorageError> {
        if !self.collections.read().contains_key(name) {
            return Err(StorageError::CollectionNotFound(name.to_owned()));
        }
        self.wal.lock().append(&Record::delete_collection(name))?;
        self.drop_collection_dir(name)
    }

    fn drop_collection_dir(&self, name: &str) -> Result<(), StorageError> {
        self.collections.write().remove(name);
        let dir = self.path.join(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, StorageError> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_owned()))
    }

    // Document operations

    /// Insert or replace a document, or stage the write when `txn` is given.
    pub fn put(
        &self,
        collection: &str,
        key: &str,
        doc: Document,
        txn: Option<TxnId>,
    ) -> Result<(), StorageError> {
        let target = self.collection(collection)?;
        if let Some(id) = txn {
            // Staged writes are validated at commit; stage and return.
            return self.txns.stage(
                id,
                TxnOp::Put {
                    collection: collection.to_owned(),
                    key: key.to_owned(),
                    doc,
                },
            );
        }
        self.check_foreign_keys(&target, &doc, None)?;
        target.put(key, doc)
    }

    pub fn delete(
        &self,
        collection: &str,
        key: &str,
        txn: Option<TxnId>,
    ) -> Result<(), StorageError> {
        let target = self.collection(collection)?;
        if let Some(id) = txn {
            return self.txns.stage(
                id,
                TxnOp::Delete {
                    collection: collection.to_owned(),
                    key: key.to_owned(),
                },
            );
        }
        target.delete(key)
    }

    /// Point lookup. With `txn`, the transaction's staged ops overlay the
    /// committed view.
    pub fn get(
        &self,
        collection: &str,
        key: &str,
        txn: Option<TxnId>,
    ) -> Result<Option<Document>, StorageError> {
        let target = self.collection(collection)?;
        if let Some(id) = txn {
            let ops = self.txns.ops(id)?;
            // Later ops win, so scan the buffer backwards.
            for op in ops.iter().rev() {
                if op.collection() == collection && op.key() == key {
                    return Ok(match op {
                        TxnOp::Put { doc, .. } => Some(doc.clone()),
                        TxnOp::Delete { .. } => None,
                    });
                }
            }
        }
        target.get(key)
    }

    pub fn get_many(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<Document>, StorageError> {
        self.collection(collection)?.get_many(keys)
    }

    pub fn scan(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        self.collection(collection)?.scan()
    }

    // Index plumbing for the query planner

    pub fn create_index(
        &self,
        collection: &str,
        fields: &[String],
        unique: bool,
        kind: IndexKind,
    ) -> Result<(), StorageError> {
        self.collection(collection)?.create_index(fields, unique, kind)
    }

    pub fn has_index(&self, collection: &str, fields: &[String]) -> Result<bool, StorageError> {
        Ok(self.collection(collection)?.has_index(fields))
    }

    pub fn available_indexes(&self, collection: &str) -> Result<Vec<Vec<String>>, StorageError> {
        Ok(self.collection(collection)?.available_indexes())
    }

    pub fn find_by_index(
        &self,
        collection: &str,
        fields: &[String],
        values: &[String],
    ) -> Result<Vec<String>, StorageError> {
        self.collection(collection)?.find_by_index(fields, values)
    }

    pub fn find_by_timestamp_range(
        &self,
        collection: &str,
        index_name: &str,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<String>, StorageError> {
        self.collection(collection)?
            .find_by_timestamp_range(index_name, lo, hi)
    }

    // Transactions

    pub fn begin_transaction(&self) -> TxnId {
        self.txns.begin()
    }

    pub fn rollback_transaction(&self, id: TxnId) {
        self.txns.rollback(id);
    }

    /// Commit a transaction: validate every staged op against the committed
    /// state plus the transaction's own earlier ops, write one durable
    /// `TXN_COMMIT` record, then apply. Any validation or durability failure
    /// aborts the transaction with no visible effect.
    pub fn commit_transaction(&self, id: TxnId) -> Result<(), StorageError> {
        let ops = self.txns.take(id)?;
        if ops.is_empty() {
            return Ok(());
        }

        // Write locks for every touched collection, acquired in name order.
        let touched: BTreeSet<&str> = ops.iter().map(|op| op.collection()).collect();
        let mut handles = BTreeMap::new();
        for name in &touched {
            handles.insert(*name, self.collection(name)?);
        }
        let mut guards: BTreeMap<&str, _> = handles
            .iter()
            .map(|(name, handle)| (*name, handle.lock_write()))
            .collect();

        // Validation pass: committed view + earlier ops of this txn.
        for (i, op) in ops.iter().enumerate() {
            if let TxnOp::Put { collection, key, doc } = op {
                let handle = &handles[collection.as_str()];
                let guard = &guards[collection.as_str()];
                handle.validate_locked(guard, key, doc)?;
                check_unique_within(guard, &ops[..i], collection, key, doc)?;
                self.check_foreign_keys_guarded(handle, doc, &ops[..i], &guards)?;
            }
        }

        // Single durable commit record; after this the transaction is
        // logically committed even if we crash mid-apply.
        self.wal
            .lock()
            .append(&Record::txn_commit(id as i64, TxnOp::encode_ops(&ops)))?;

        for op in &ops {
            let handle = &handles[op.collection()];
            let guard = guards.get_mut(op.collection()).expect("guard held");
            match op {
                TxnOp::Put { key, doc, .. } => {
                    handle.apply_put_locked(guard, key, doc.clone(), id as i64)?
                }
                TxnOp::Delete { key, .. } => handle.apply_delete_locked(guard, key, id as i64)?,
            }
        }
        for (name, guard) in guards.iter_mut() {
            handles[*name].maybe_flush_locked(guard)?;
        }
        Ok(())
    }

    /// Re-apply committed ops during recovery, outside any validation.
    fn apply_ops(&self, ops: &[TxnOp], txn_id: i64) -> Result<(), StorageError> {
        for op in ops {
            let Ok(handle) = self.collection(op.collection()) else {
                warn!(
                    "database {}: commit record references missing collection `{}`",
                    self.name,
                    op.collection()
                );
                continue;
            };
            let mut guard = handle.lock_write();
            match op {
                TxnOp::Put { key, doc, .. } => {
                    handle.apply_put_locked(&mut guard, key, doc.clone(), txn_id)?
                }
                TxnOp::Delete { key, .. } => handle.apply_delete_locked(&mut guard, key, txn_id)?,
            }
        }
        Ok(())
    }

    /// FK pre-check for a non-transactional put: every FK value must point
    /// at an existing document id in the referenced collection.
    fn check_foreign_keys(
        &self,
        target: &Collection,
        doc: &Document,
        overlay: Option<&[TxnOp]>,
    ) -> Result<(), StorageError> {
        let Some(schema) = target.schema() else {
            return Ok(());
        };
        for fk in schema.foreign_keys() {
            let Some(value) = doc.get(&fk.field) else { continue };
            if value.is_null() {
                continue;
            }
            let Some(ref_id) = value.canonical_text() else {
                continue;
            };
            if let Some(ops) = overlay {
                let staged = ops.iter().rev().find(|op| {
                    op.collection() == fk.references_collection && op.key() == ref_id
                });
                match staged {
                    Some(TxnOp::Put { .. }) => continue,
                    Some(TxnOp::Delete { .. }) => {
                        return Err(StorageError::ForeignKey {
                            field: fk.field.clone(),
                            value: ref_id,
                            collection: fk.references_collection.clone(),
                        })
                    }
                    None => {}
                }
            }
            let referenced = self.collection(&fk.references_collection).map_err(|_| {
                StorageError::ForeignKey {
                    field: fk.field.clone(),
                    value: ref_id.clone(),
                    collection: fk.references_collection.clone(),
                }
            })?;
            if referenced.get(&ref_id)?.is_none() {
                return Err(StorageError::ForeignKey {
                    field: fk.field.clone(),
                    value: ref_id,
                    collection: fk.references_collection.clone(),
                });
            }
        }
        Ok(())
    }

    /// FK check during commit: referenced collections already write-locked
    /// by this commit are read through their held guards; others get a
    /// transient read.
    fn check_foreign_keys_guarded(
        &self,
        target: &Collection,
        doc: &Document,
        earlier: &[TxnOp],
        guards: &BTreeMap<&str, parking_lot::RwLockWriteGuard<'_, collection::CollectionInner>>,
    ) -> Result<(), StorageError> {
        let Some(schema) = target.schema() else {
            return Ok(());
        };
        for fk in schema.foreign_keys() {
            let Some(value) = doc.get(&fk.field) else { continue };
            if value.is_null() {
                continue;
            }
            let Some(ref_id) = value.canonical_text() else {
                continue;
            };
            let missing = StorageError::ForeignKey {
                field: fk.field.clone(),
                value: ref_id.clone(),
                collection: fk.references_collection.clone(),
            };

            // Earlier staged ops in the same transaction can satisfy or
            // break the reference.
            let staged = earlier.iter().rev().find(|op| {
                op.collection() == fk.references_collection && op.key() == ref_id
            });
            match staged {
                Some(TxnOp::Put { .. }) => continue,
                Some(TxnOp::Delete { .. }) => return Err(missing),
                None => {}
            }

            let found = match guards.get(fk.references_collection.as_str()) {
                Some(guard) => collection::get_locked(guard, &ref_id)?.is_some(),
                None => {
                    let referenced = self
                        .collection(&fk.references_collection)
                        .map_err(|_| StorageError::ForeignKey {
                            field: fk.field.clone(),
                            value: ref_id.clone(),
                            collection: fk.references_collection.clone(),
                        })?;
                    referenced.get(&ref_id)?.is_some()
                }
            };
            if !found {
                return Err(missing);
            }
        }
        Ok(())
    }

    /// Flush every collection and truncate the database WAL. Called on
    /// graceful shutdown; after this, reopening replays nothing.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let collections: Vec<Arc<Collection>> = self.collections.read().values().cloned().collect();
        for collection in collections {
            collection.checkpoint()?;
        }
        self.wal.lock().clear()?;
        Ok(())
    }
}

/// Unique-within-transaction check: two staged puts in the same collection
/// must not claim the same unique composite key under different storage
/// keys. The indexer's own check covers the committed state; this covers
/// op-vs-op collisions inside the buffer.
fn check_unique_within(
    guard: &collection::CollectionInner,
    earlier: &[TxnOp],
    collection_name: &str,
    key: &str,
    doc: &Document,
) -> Result<(), StorageError> {
    use crate::index::Indexer;

    for fields in guard.indexer.unique_index_fields() {
        let Some(composite) = Indexer::composite_key(&fields, doc) else {
            continue;
        };
        for op in earlier {
            let TxnOp::Put {
                collection: other_collection,
                key: other_key,
                doc: other_doc,
            } = op
            else {
                continue;
            };
            if other_collection != collection_name || other_key == key {
                continue;
            }
            if Indexer::composite_key(&fields, other_doc).as_deref() == Some(composite.as_str()) {
                return Err(StorageError::Unique {
                    index: Indexer::index_name(&fields),
                    key: composite.replace('\0', "\\0"),
                });
            }
        }
    }
    Ok(())
}
