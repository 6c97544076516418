use std::collections::BTreeMap;

use tissdb_model::{ser, Document};

/// In-memory sorted write buffer.
///
/// `None` values are tombstones: the key was deleted and the deletion has not
/// yet been compacted away. Size accounting tracks the serialized size of
/// live entries so the owning collection can decide when to flush.
#[derive(Debug, Default)]
pub struct Memtable {
    entries: BTreeMap<String, Option<Document>>,
    approximate_size: usize,
}

/// Accounted size of a tombstone beyond its key.
const TOMBSTONE_OVERHEAD: usize = 8;

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: String, doc: Document) {
        let size = entry_size(&key, Some(&doc));
        if let Some(old) = self.entries.insert(key.clone(), Some(doc)) {
            self.approximate_size -= entry_size(&key, old.as_ref());
        }
        self.approximate_size += size;
    }

    pub fn delete(&mut self, key: String) {
        let size = entry_size(&key, None);
        if let Some(old) = self.entries.insert(key.clone(), None) {
            self.approximate_size -= entry_size(&key, old.as_ref());
        }
        self.approximate_size += size;
    }

    /// Tri-state lookup: `None` = never seen, `Some(None)` = tombstone,
    /// `Some(Some(doc))` = live.
    pub fn get(&self, key: &str) -> Option<Option<&Document>> {
        self.entries.get(key).map(|slot| slot.as_ref())
    }

    /// All entries in key order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&String, Option<&Document>)> {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.approximate_size = 0;
    }
}

fn entry_size(key: &str, doc: Option<&Document>) -> usize {
    key.len()
        + match doc {
            Some(doc) => ser::encoded_len(doc),
            None => TOMBSTONE_OVERHEAD,
        }
}
