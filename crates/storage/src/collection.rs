//! A collection: schema, WAL, memtable, SSTables and secondary indexes.
//!
//! All mutable state sits behind one write lock, so a write's WAL append,
//! memtable update and index maintenance are atomic with respect to other
//! writers and readers never observe a partial write. Foreign keys need
//! other collections and are enforced one level up, in
//! [`crate::database::Database`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tissdb_model::{ser, Document, Schema};
use tissdb_wal::{Record, RecordKind, Wal, NO_TXN};

use crate::{
    error::StorageError,
    index::{IndexKind, Indexer},
    memtable::Memtable,
    sstable::SsTable,
};

const SCHEMA_FILE: &str = "schema.json";
const WAL_FILE: &str = "wal.log";

/// Tunables for one collection.
#[derive(Debug, Clone, Copy)]
pub struct CollectionOptions {
    /// Flush the memtable to a new SSTable once its accounted size reaches
    /// this many bytes.
    pub memtable_flush_threshold: usize,
    /// Merge all SSTables into one once this many files have accumulated.
    pub compaction_file_threshold: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            memtable_flush_threshold: 4 * 1024 * 1024,
            compaction_file_threshold: 8,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CollectionInner {
    pub(crate) schema: Option<Schema>,
    pub(crate) wal: Wal,
    pub(crate) memtable: Memtable,
    /// Oldest first; lookups walk it in reverse.
    pub(crate) sstables: Vec<SsTable>,
    pub(crate) indexer: Indexer,
    /// Name of the unique index backing the primary key, when a schema with
    /// a PK is set. Unique violations on it surface as PK violations.
    pk_index: Option<String>,
}

#[derive(Debug)]
pub struct Collection {
    name: String,
    path: PathBuf,
    options: CollectionOptions,
    inner: RwLock<CollectionInner>,
}

impl Collection {
    /// Open (or create) the collection directory under `db_path`, then
    /// replay its WAL into the memtable and indexes.
    pub(crate) fn open(
        db_path: &Path,
        name: &str,
        options: CollectionOptions,
    ) -> Result<Self, StorageError> {
        let path = db_path.join(name);
        fs::create_dir_all(&path)?;

        let schema = match fs::read(path.join(SCHEMA_FILE)) {
            Ok(bytes) => Some(
                serde_json::from_slice::<Schema>(&bytes)
                    .map_err(|e| StorageError::corrupt(path.join(SCHEMA_FILE), e.to_string()))?,
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let mut sstables = Vec::new();
        let mut table_paths: Vec<PathBuf> = fs::read_dir(&path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "db")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("sstable_"))
            })
            .collect();
        table_paths.sort();
        for table_path in table_paths {
            sstables.push(SsTable::open(table_path)?);
        }

        let indexer = Indexer::load(&path)?;
        let mut wal = Wal::open(path.join(WAL_FILE))?;
        let records = wal.recover()?;

        let pk_index = schema
            .as_ref()
            .filter(|s| !s.primary_key_fields().is_empty())
            .map(|s| Indexer::index_name(s.primary_key_fields()));

        let mut inner = CollectionInner {
            schema,
            wal,
            memtable: Memtable::new(),
            sstables,
            indexer,
            pk_index,
        };

        let replayed = records.len();
        for record in records {
            replay(&mut inner, &record)?;
        }
        if replayed > 0 {
            info!("collection {name}: replayed {replayed} WAL records");
        }

        Ok(Self {
            name: name.to_owned(),
            path,
            options,
            inner: RwLock::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock_write(&self) -> RwLockWriteGuard<'_, CollectionInner> {
        self.inner.write()
    }

    fn lock_read(&self) -> RwLockReadGuard<'_, CollectionInner> {
        self.inner.read()
    }

    /// Install a schema, persist it, and back the unique surface (PK and
    /// UNIQUE fields) with unique indexes.
    pub fn set_schema(&self, schema: Schema) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        let json = serde_json::to_vec_pretty(&schema)
            .map_err(|e| StorageError::corrupt(self.path.join(SCHEMA_FILE), e.to_string()))?;
        fs::write(self.path.join(SCHEMA_FILE), json)?;

        if !schema.primary_key_fields().is_empty() {
            let pk_fields = schema.primary_key_fields().to_vec();
            self.create_index_locked(&mut inner, &pk_fields, true, IndexKind::String)?;
            inner.pk_index = Some(Indexer::index_name(&pk_fields));
        }
        for field in schema.fields() {
            if field.unique {
                self.create_index_locked(
                    &mut inner,
                    std::slice::from_ref(&field.name),
                    true,
                    IndexKind::String,
                )?;
            }
        }
        inner.schema = Some(schema);
        Ok(())
    }

    pub fn schema(&self) -> Option<Schema> {
        self.lock_read().schema.clone()
    }

    /// Insert or replace a document. Validates the schema, primary key and
    /// unique constraints; foreign keys are the database's business.
    pub fn put(&self, key: &str, doc: Document) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.validate_locked(&inner, key, &doc)?;
        self.apply_put_locked(&mut inner, key, doc, NO_TXN)?;
        self.maybe_flush_locked(&mut inner)
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.apply_delete_locked(&mut inner, key, NO_TXN)?;
        self.maybe_flush_locked(&mut inner)
    }

    pub fn get(&self, key: &str) -> Result<Option<Document>, StorageError> {
        let inner = self.lock_read();
        get_locked(&inner, key)
    }

    pub fn get_many(&self, keys: &[String]) -> Result<Vec<Document>, StorageError> {
        let inner = self.lock_read();
        let mut docs = Vec::new();
        for key in keys {
            if let Some(doc) = get_locked(&inner, key)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// All live documents, newest version of each key, in key order.
    pub fn scan(&self) -> Result<Vec<Document>, StorageError> {
        let inner = self.lock_read();
        scan_locked(&inner)
    }

    pub fn create_index(
        &self,
        fields: &[String],
        unique: bool,
        kind: IndexKind,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.create_index_locked(&mut inner, fields, unique, kind)?;
        inner.indexer.save(&self.path)
    }

    fn create_index_locked(
        &self,
        inner: &mut CollectionInner,
        fields: &[String],
        unique: bool,
        kind: IndexKind,
    ) -> Result<(), StorageError> {
        if inner.indexer.has_index(fields) {
            return Ok(());
        }
        let entries = scan_entries_locked(inner)?;

        // Refuse up front if existing data already breaks the constraint, so
        // a failed creation leaves no half-filled index behind.
        if unique {
            let mut seen = std::collections::BTreeMap::new();
            for (key, doc) in &entries {
                if let Some(composite) = Indexer::composite_key(fields, doc) {
                    if seen.insert(composite.clone(), key.clone()).is_some() {
                        return Err(StorageError::Unique {
                            index: Indexer::index_name(fields),
                            key: composite.replace('\0', "\\0"),
                        });
                    }
                }
            }
        }

        inner.indexer.create_index(fields, unique, kind)?;
        for (key, doc) in &entries {
            inner.indexer.update(key, doc)?;
        }
        debug!(
            "collection {}: created {:?} index on {:?} (unique: {unique}, backfilled {})",
            self.name,
            kind,
            fields,
            entries.len()
        );
        Ok(())
    }

    pub fn has_index(&self, fields: &[String]) -> bool {
        self.lock_read().indexer.has_index(fields)
    }

    pub fn available_indexes(&self) -> Vec<Vec<String>> {
        self.lock_read().indexer.available_indexes()
    }

    pub fn find_by_index(
        &self,
        fields: &[String],
        values: &[String],
    ) -> Result<Vec<String>, StorageError> {
        self.lock_read()
            .indexer
            .find_by_index(&Indexer::index_name(fields), values)
    }

    pub fn find_by_timestamp_range(
        &self,
        index_name: &str,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<String>, StorageError> {
        self.lock_read().indexer.find_by_timestamp_range(index_name, lo, hi)
    }

    /// Write the memtable out as a new SSTable, then clear it and the WAL.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.flush_locked(&mut inner)
    }

    /// Merge every SSTable into one, dropping superseded values and
    /// tombstones (the merge covers all levels).
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.compact_locked(&mut inner)
    }

    pub fn sstable_count(&self) -> usize {
        self.lock_read().sstables.len()
    }

    // Write-path internals. The `_locked` functions run under a held write
    // guard so multi-collection commits can validate and apply atomically.

    pub(crate) fn validate_locked(
        &self,
        inner: &CollectionInner,
        key: &str,
        doc: &Document,
    ) -> Result<(), StorageError> {
        if let Some(schema) = &inner.schema {
            schema.validate(doc)?;
            for field in schema.primary_key_fields() {
                if doc.get(field).map(|v| v.is_null()).unwrap_or(true) {
                    return Err(StorageError::PrimaryKey(format!(
                        "document `{key}` is missing primary key field `{field}`"
                    )));
                }
            }
        }
        inner.indexer.check_unique(key, doc).map_err(|err| match err {
            StorageError::Unique { index, key } if Some(&index) == inner.pk_index.as_ref() => {
                StorageError::PrimaryKey(format!("duplicate primary key `{key}`"))
            }
            other => other,
        })
    }

    pub(crate) fn apply_put_locked(
        &self,
        inner: &mut CollectionInner,
        key: &str,
        doc: Document,
        txn_id: i64,
    ) -> Result<(), StorageError> {
        let mut record = Record::put(self.name.clone(), key, ser::serialize_document(&doc));
        record.txn_id = txn_id;
        inner.wal.append(&record)?;

        // A replaced document must leave the indexes it no longer matches.
        if let Some(old) = get_locked(inner, key)? {
            inner.indexer.remove(key, &old);
        }
        inner.indexer.update(key, &doc)?;
        inner.memtable.put(key.to_owned(), doc);
        Ok(())
    }

    pub(crate) fn apply_delete_locked(
        &self,
        inner: &mut CollectionInner,
        key: &str,
        txn_id: i64,
    ) -> Result<(), StorageError> {
        let mut record = Record::delete(self.name.clone(), key);
        record.txn_id = txn_id;
        inner.wal.append(&record)?;

        if let Some(old) = get_locked(inner, key)? {
            inner.indexer.remove(key, &old);
        }
        inner.memtable.delete(key.to_owned());
        Ok(())
    }

    pub(crate) fn maybe_flush_locked(
        &self,
        inner: &mut CollectionInner,
    ) -> Result<(), StorageError> {
        if inner.memtable.approximate_size() >= self.options.memtable_flush_threshold {
            self.flush_locked(inner)?;
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut CollectionInner) -> Result<(), StorageError> {
        if inner.memtable.is_empty() {
            return Ok(());
        }
        let table = SsTable::write_from_memtable(&self.path, &inner.memtable)?;
        debug!(
            "collection {}: flushed {} entries to {}",
            self.name,
            inner.memtable.len(),
            table.path().display()
        );
        inner.sstables.push(table);
        inner.memtable.clear();
        inner.wal.clear()?;
        inner.indexer.save(&self.path)?;

        if inner.sstables.len() >= self.options.compaction_file_threshold {
            self.compact_locked(inner)?;
        }
        Ok(())
    }

    fn compact_locked(&self, inner: &mut CollectionInner) -> Result<(), StorageError> {
        if inner.sstables.len() < 2 {
            return Ok(());
        }
        // Newest first for the merge.
        let refs: Vec<&SsTable> = inner.sstables.iter().rev().collect();
        let merged = SsTable::merge(&self.path, &refs, true)?;
        info!(
            "collection {}: compacted {} tables into {}",
            self.name,
            inner.sstables.len(),
            merged.path().display()
        );
        let old = std::mem::replace(&mut inner.sstables, vec![merged]);
        for table in old {
            if let Err(err) = fs::remove_file(table.path()) {
                log::warn!("failed to remove {}: {err}", table.path().display());
            }
        }
        Ok(())
    }

    /// Persist what must survive a clean shutdown without a replayable WAL.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let mut inner = self.lock_write();
        self.flush_locked(&mut inner)?;
        inner.indexer.save(&self.path)
    }
}

/// Newest-wins lookup across memtable and SSTables under a held guard.
pub(crate) fn get_locked(
    inner: &CollectionInner,
    key: &str,
) -> Result<Option<Document>, StorageError> {
    match inner.memtable.get(key) {
        Some(Some(doc)) => return Ok(Some(doc.clone())),
        Some(None) => return Ok(None),
        None => {}
    }
    for table in inner.sstables.iter().rev() {
        match table.find(key)? {
            Some(Some(doc)) => return Ok(Some(doc)),
            Some(None) => return Ok(None),
            None => {}
        }
    }
    Ok(None)
}

pub(crate) fn scan_locked(inner: &CollectionInner) -> Result<Vec<Document>, StorageError> {
    Ok(scan_entries_locked(inner)?
        .into_iter()
        .map(|(_, doc)| doc)
        .collect())
}

/// Live `(storage key, document)` pairs in key order.
pub(crate) fn scan_entries_locked(
    inner: &CollectionInner,
) -> Result<Vec<(String, Document)>, StorageError> {
    let mut merged: std::collections::BTreeMap<String, Option<Document>> = Default::default();
    for table in &inner.sstables {
        for (key, doc) in table.scan()? {
            merged.insert(key, doc);
        }
    }
    for (key, doc) in inner.memtable.iter() {
        merged.insert(key.clone(), doc.cloned());
    }
    Ok(merged
        .into_iter()
        .filter_map(|(key, doc)| doc.map(|doc| (key, doc)))
        .collect())
}

fn replay(inner: &mut CollectionInner, record: &Record) -> Result<(), StorageError> {
    match record.kind {
        RecordKind::Put => {
            let doc = tissdb_model::deserialize_document(&record.payload)?;
            if let Some(old) = get_locked(inner, &record.doc_id)? {
                inner.indexer.remove(&record.doc_id, &old);
            }
            if let Err(err) = inner.indexer.update(&record.doc_id, &doc) {
                // The write passed validation before it reached the WAL;
                // replaying it cannot legitimately conflict.
                log::warn!("replay index update for `{}`: {err}", record.doc_id);
            }
            inner.memtable.put(record.doc_id.clone(), doc);
        }
        RecordKind::Delete => {
            if let Some(old) = get_locked(inner, &record.doc_id)? {
                inner.indexer.remove(&record.doc_id, &old);
            }
            inner.memtable.delete(record.doc_id.clone());
        }
        // Collection-level WALs only carry data records; everything else
        // lives in the database WAL.
        _ => {}
    }
    Ok(())
}
