//! Secondary index management for one collection.
//!
//! Every index maps a composite key to the set of document ids whose fields
//! produce that key. Composite keys join the canonical text of each indexed
//! field with a NUL byte. Timestamp indexes cover exactly one field and key
//! on the raw microsecond value.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};
use tissdb_model::{Document, Value};

use crate::{
    btree::{BTree, DEFAULT_ORDER},
    error::StorageError,
};

pub const COMPOSITE_SEPARATOR: char = '\0';
const META_FILE: &str = "indexes.meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    String,
    Timestamp,
}

#[derive(Debug)]
enum IndexTree {
    Str(BTree<String, Vec<String>>),
    Ts(BTree<i64, Vec<String>>),
}

#[derive(Debug)]
struct Index {
    fields: Vec<String>,
    unique: bool,
    kind: IndexKind,
    /// Creation order; the query planner breaks coverage ties with it.
    seq: usize,
    tree: IndexTree,
}

/// All indexes of one collection.
#[derive(Debug, Default)]
pub struct Indexer {
    indexes: BTreeMap<String, Index>,
    next_seq: usize,
}

/// On-disk shape of `indexes.meta`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    fields: BTreeMap<String, Vec<String>>,
    unique: BTreeMap<String, bool>,
    #[serde(default)]
    kinds: BTreeMap<String, IndexKind>,
    /// Creation order of the index names.
    #[serde(default)]
    declared: Vec<String>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The logical index name for a field list: the fields joined with `_`.
    pub fn index_name(fields: &[String]) -> String {
        fields.join("_")
    }

    pub fn create_index(
        &mut self,
        fields: &[String],
        unique: bool,
        kind: IndexKind,
    ) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Err(StorageError::InvalidIndex("no fields given".into()));
        }
        if kind == IndexKind::Timestamp {
            if fields.len() != 1 {
                return Err(StorageError::InvalidIndex(
                    "timestamp indexes cover exactly one field".into(),
                ));
            }
            if unique {
                return Err(StorageError::InvalidIndex(
                    "unique timestamp indexes are not supported".into(),
                ));
            }
        }
        let name = Self::index_name(fields);
        if self.indexes.contains_key(&name) {
            return Ok(());
        }
        let tree = match kind {
            IndexKind::String => IndexTree::Str(BTree::new(DEFAULT_ORDER)),
            IndexKind::Timestamp => IndexTree::Ts(BTree::new(DEFAULT_ORDER)),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.indexes.insert(
            name,
            Index {
                fields: fields.to_vec(),
                unique,
                kind,
                seq,
                tree,
            },
        );
        Ok(())
    }

    pub fn has_index(&self, fields: &[String]) -> bool {
        self.indexes.contains_key(&Self::index_name(fields))
    }

    /// Field lists of every index, in creation order.
    pub fn available_indexes(&self) -> Vec<Vec<String>> {
        self.indexes
            .values()
            .sorted_by_key(|index| index.seq)
            .map(|index| index.fields.clone())
            .collect()
    }

    /// Field lists of the unique indexes only, in creation order.
    pub fn unique_index_fields(&self) -> Vec<Vec<String>> {
        self.indexes
            .values()
            .filter(|index| index.unique)
            .sorted_by_key(|index| index.seq)
            .map(|index| index.fields.clone())
            .collect()
    }

    /// The NUL-joined composite key of `doc` for `fields`, or `None` when
    /// some field is absent or has no text rendering.
    pub fn composite_key(fields: &[String], doc: &Document) -> Option<String> {
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            parts.push(doc.get(field)?.canonical_text()?);
        }
        Some(parts.join(&COMPOSITE_SEPARATOR.to_string()))
    }

    /// Check what [`Indexer::update`] would reject, without mutating.
    pub fn check_unique(&self, doc_id: &str, doc: &Document) -> Result<(), StorageError> {
        for (name, index) in &self.indexes {
            if !index.unique {
                continue;
            }
            let IndexTree::Str(tree) = &index.tree else { continue };
            let Some(key) = Self::composite_key(&index.fields, doc) else {
                continue;
            };
            if let Some(ids) = tree.find(&key) {
                if !ids.is_empty() && !ids.iter().any(|id| id == doc_id) {
                    return Err(StorageError::Unique {
                        index: name.clone(),
                        key: key.replace(COMPOSITE_SEPARATOR, "\\0"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Add `doc_id` to every index entry `doc` participates in.
    pub fn update(&mut self, doc_id: &str, doc: &Document) -> Result<(), StorageError> {
        self.check_unique(doc_id, doc)?;
        for index in self.indexes.values_mut() {
            match &mut index.tree {
                IndexTree::Str(tree) => {
                    let Some(key) = Self::composite_key(&index.fields, doc) else {
                        continue;
                    };
                    let mut ids = tree.find(&key).cloned().unwrap_or_default();
                    if insert_sorted(&mut ids, doc_id) {
                        tree.insert(key, ids);
                    }
                }
                IndexTree::Ts(tree) => {
                    let Some(Value::Timestamp(ts)) = doc.get(&index.fields[0]) else {
                        continue;
                    };
                    let key = ts.as_micros();
                    let mut ids = tree.find(&key).cloned().unwrap_or_default();
                    if insert_sorted(&mut ids, doc_id) {
                        tree.insert(key, ids);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove `doc_id` from every index entry `doc` participates in, erasing
    /// entries that become empty.
    pub fn remove(&mut self, doc_id: &str, doc: &Document) {
        for index in self.indexes.values_mut() {
            match &mut index.tree {
                IndexTree::Str(tree) => {
                    let Some(key) = Self::composite_key(&index.fields, doc) else {
                        continue;
                    };
                    let Some(ids) = tree.find(&key) else { continue };
                    let mut ids = ids.clone();
                    ids.retain(|id| id != doc_id);
                    if ids.is_empty() {
                        tree.erase(&key);
                    } else {
                        tree.insert(key, ids);
                    }
                }
                IndexTree::Ts(tree) => {
                    let Some(Value::Timestamp(ts)) = doc.get(&index.fields[0]) else {
                        continue;
                    };
                    let key = ts.as_micros();
                    let Some(ids) = tree.find(&key) else { continue };
                    let mut ids = ids.clone();
                    ids.retain(|id| id != doc_id);
                    if ids.is_empty() {
                        tree.erase(&key);
                    } else {
                        tree.insert(key, ids);
                    }
                }
            }
        }
    }

    /// Look up the doc ids for one composite key, given the per-field values
    /// in index field order.
    pub fn find_by_index(&self, name: &str, values: &[String]) -> Result<Vec<String>, StorageError> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_owned()))?;
        match &index.tree {
            IndexTree::Str(tree) => {
                let key = values.join(&COMPOSITE_SEPARATOR.to_string());
                Ok(tree.find(&key).cloned().unwrap_or_default())
            }
            IndexTree::Ts(tree) => {
                let Some(micros) = values.first().and_then(|v| v.parse::<i64>().ok()) else {
                    return Ok(Vec::new());
                };
                Ok(tree.find(&micros).cloned().unwrap_or_default())
            }
        }
    }

    /// Union of the doc ids for all timestamp keys in `[lo, hi]`, sorted and
    /// deduplicated.
    pub fn find_by_timestamp_range(
        &self,
        name: &str,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<String>, StorageError> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_owned()))?;
        let IndexTree::Ts(tree) = &index.tree else {
            return Err(StorageError::InvalidIndex(format!(
                "index `{name}` is not a timestamp index"
            )));
        };
        let mut ids: Vec<String> = tree
            .find_range(&lo, &hi)
            .into_iter()
            .flat_map(|(_, ids)| ids)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Persist the metadata file plus one `.bpt` dump per index.
    pub fn save(&self, dir: &Path) -> Result<(), StorageError> {
        let mut meta = Meta::default();
        let by_seq = self.indexes.iter().sorted_by_key(|(_, index)| index.seq);
        for (name, index) in by_seq {
            meta.fields.insert(name.clone(), index.fields.clone());
            meta.unique.insert(name.clone(), index.unique);
            meta.kinds.insert(name.clone(), index.kind);
            meta.declared.push(name.clone());

            let bytes = match &index.tree {
                IndexTree::Str(tree) => tree.dump(),
                IndexTree::Ts(tree) => tree.dump(),
            };
            fs::write(dir.join(format!("{name}.bpt")), bytes)?;
        }
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::corrupt(dir.join(META_FILE), e.to_string()))?;
        fs::write(dir.join(META_FILE), json)?;
        Ok(())
    }

    /// Load indexes previously written by [`Indexer::save`]. A missing meta
    /// file yields an empty indexer; an unreadable dump is skipped with a
    /// warning so one bad file cannot take the collection down.
    pub fn load(dir: &Path) -> Result<Self, StorageError> {
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Ok(Self::new());
        }
        let json = fs::read(&meta_path)?;
        let meta: Meta = serde_json::from_slice(&json)
            .map_err(|e| StorageError::corrupt(&meta_path, e.to_string()))?;

        let names: Vec<String> = if meta.declared.is_empty() {
            meta.fields.keys().cloned().collect()
        } else {
            meta.declared.clone()
        };

        let mut indexer = Self::new();
        for name in names {
            let Some(fields) = meta.fields.get(&name) else {
                continue;
            };
            let unique = meta.unique.get(&name).copied().unwrap_or(false);
            let kind = meta.kinds.get(&name).copied().unwrap_or(IndexKind::String);

            let dump_path = dir.join(format!("{name}.bpt"));
            let tree = match fs::read(&dump_path) {
                Ok(bytes) => {
                    let loaded = match kind {
                        IndexKind::String => BTree::load(&bytes).map(IndexTree::Str),
                        IndexKind::Timestamp => BTree::load(&bytes).map(IndexTree::Ts),
                    };
                    match loaded {
                        Ok(tree) => Some(tree),
                        Err(err) => {
                            warn!("index dump {}: {err}; rebuilding empty", dump_path.display());
                            None
                        }
                    }
                }
                Err(err) => {
                    warn!("index dump {}: {err}; rebuilding empty", dump_path.display());
                    None
                }
            };
            let tree = tree.unwrap_or_else(|| match kind {
                IndexKind::String => IndexTree::Str(BTree::new(DEFAULT_ORDER)),
                IndexKind::Timestamp => IndexTree::Ts(BTree::new(DEFAULT_ORDER)),
            });

            let seq = indexer.next_seq;
            indexer.next_seq += 1;
            indexer.indexes.insert(
                name,
                Index {
                    fields: fields.clone(),
                    unique,
                    kind,
                    seq,
                    tree,
                },
            );
        }
        Ok(indexer)
    }
}

/// Insert into a sorted id set; returns whether the set changed.
fn insert_sorted(ids: &mut Vec<String>, doc_id: &str) -> bool {
    match ids.binary_search_by(|id| id.as_str().cmp(doc_id)) {
        Ok(_) => false,
        Err(pos) => {
            ids.insert(pos, doc_id.to_owned());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tissdb_model::Timestamp;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn composite_key_joins_with_nul() {
        let doc = Document::new("d1").with("brand", "Acme").with("price", 100.0);
        let key = Indexer::composite_key(&fields(&["brand", "price"]), &doc).unwrap();
        assert_eq!(key, "Acme\0100");

        // A missing field means no key at all.
        assert_eq!(Indexer::composite_key(&fields(&["brand", "type"]), &doc), None);
    }

    #[test]
    fn update_find_remove() {
        let mut indexer = Indexer::new();
        indexer
            .create_index(&fields(&["brand"]), false, IndexKind::String)
            .unwrap();

        let d1 = Document::new("d1").with("brand", "Acme");
        let d2 = Document::new("d2").with("brand", "Acme");
        indexer.update("d1", &d1).unwrap();
        indexer.update("d2", &d2).unwrap();
        // Idempotent re-update.
        indexer.update("d1", &d1).unwrap();

        assert_eq!(
            indexer.find_by_index("brand", &["Acme".into()]).unwrap(),
            vec!["d1".to_owned(), "d2".to_owned()]
        );

        indexer.remove("d1", &d1);
        assert_eq!(
            indexer.find_by_index("brand", &["Acme".into()]).unwrap(),
            vec!["d2".to_owned()]
        );
        indexer.remove("d2", &d2);
        assert!(indexer.find_by_index("brand", &["Acme".into()]).unwrap().is_empty());
    }

    #[test]
    fn unique_index_rejects_second_writer() {
        let mut indexer = Indexer::new();
        indexer
            .create_index(&fields(&["email"]), true, IndexKind::String)
            .unwrap();

        indexer
            .update("u1", &Document::new("u1").with("email", "a@x"))
            .unwrap();
        // Same doc id may rewrite its own entry.
        indexer
            .update("u1", &Document::new("u1").with("email", "a@x"))
            .unwrap();

        let err = indexer
            .update("u2", &Document::new("u2").with("email", "a@x"))
            .unwrap_err();
        assert!(matches!(err, StorageError::Unique { .. }));

        // The failed update left no trace.
        assert_eq!(
            indexer.find_by_index("email", &["a@x".into()]).unwrap(),
            vec!["u1".to_owned()]
        );
    }

    #[test]
    fn timestamp_range_dedups_across_keys() {
        let mut indexer = Indexer::new();
        indexer
            .create_index(&fields(&["at"]), false, IndexKind::Timestamp)
            .unwrap();

        for (id, micros) in [("d3", 300), ("d1", 100), ("d2", 200), ("d4", 400)] {
            let doc = Document::new(id).with("at", Timestamp::from_micros(micros));
            indexer.update(id, &doc).unwrap();
        }
        // Two docs sharing one timestamp.
        indexer
            .update("d5", &Document::new("d5").with("at", Timestamp::from_micros(200)))
            .unwrap();

        let hits = indexer.find_by_timestamp_range("at", 100, 300).unwrap();
        assert_eq!(hits, vec!["d1", "d2", "d3", "d5"]);

        assert!(indexer.find_by_timestamp_range("at", 401, 500).unwrap().is_empty());
        assert!(matches!(
            indexer.find_by_timestamp_range("missing", 0, 1),
            Err(StorageError::IndexNotFound(_))
        ));
    }

    #[test]
    fn save_load_roundtrip_preserves_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = Indexer::new();
        indexer
            .create_index(&fields(&["brand"]), false, IndexKind::String)
            .unwrap();
        indexer
            .create_index(&fields(&["at"]), false, IndexKind::Timestamp)
            .unwrap();
        indexer
            .create_index(&fields(&["brand", "type"]), true, IndexKind::String)
            .unwrap();

        let doc = Document::new("d1")
            .with("brand", "Acme")
            .with("type", "anvil")
            .with("at", Timestamp::from_micros(42));
        indexer.update("d1", &doc).unwrap();
        indexer.save(dir.path()).unwrap();

        let loaded = Indexer::load(dir.path()).unwrap();
        assert_eq!(
            loaded.available_indexes(),
            vec![fields(&["brand"]), fields(&["at"]), fields(&["brand", "type"])]
        );
        assert_eq!(
            loaded.find_by_index("brand_type", &["Acme".into(), "anvil".into()]).unwrap(),
            vec!["d1".to_owned()]
        );
        assert_eq!(loaded.find_by_timestamp_range("at", 0, 100).unwrap(), vec!["d1"]);

        // The unique flag survives.
        let err = loaded_unique_check(&loaded);
        assert!(matches!(err, Err(StorageError::Unique { .. })));
    }

    fn loaded_unique_check(indexer: &Indexer) -> Result<(), StorageError> {
        indexer.check_unique(
            "d2",
            &Document::new("d2").with("brand", "Acme").with("type", "anvil"),
        )
    }
}
