//! INSERT, UPDATE and DELETE execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tissdb_model::{Document, Element};
use tissdb_storage::{Database, TxnId};

use crate::{
    ast::{DeleteStatement, InsertStatement, UpdateStatement},
    error::SqlError,
    exec::{
        eval::{eval_predicate, eval_update_value},
        select::fetch_candidates,
    },
};

pub(crate) fn execute_insert(
    db: &Database,
    stmt: &InsertStatement,
    txn: Option<TxnId>,
) -> Result<Vec<Document>, SqlError> {
    if stmt.columns.len() != stmt.values.len() {
        return Err(SqlError::ColumnCountMismatch {
            columns: stmt.columns.len(),
            values: stmt.values.len(),
        });
    }

    // VALUES entries are literal expressions; evaluate them with no row
    // context, so identifiers are rejected.
    let empty = Document::default();
    let mut elements = Vec::with_capacity(stmt.columns.len());
    for (column, expr) in stmt.columns.iter().zip(&stmt.values) {
        let value = eval_update_value(expr, &empty)?;
        elements.push(Element::new(column.clone(), value));
    }

    let mut doc = Document::new(String::new());
    doc.elements = elements;
    doc.id = document_id(db, stmt, &doc)?;

    let id = doc.id.clone();
    db.put(&stmt.collection, &id, doc, txn)?;
    Ok(Vec::new())
}

/// The storage id for an inserted row: the NUL-joined canonical primary-key
/// values when the collection declares a PK, a fresh time-based id
/// otherwise.
fn document_id(
    db: &Database,
    stmt: &InsertStatement,
    doc: &Document,
) -> Result<String, SqlError> {
    if let Some(schema) = db.collection(&stmt.collection)?.schema() {
        let pk = schema.primary_key_fields();
        if !pk.is_empty() {
            let mut parts = Vec::with_capacity(pk.len());
            for field in pk {
                if let Some(text) = doc.get(field).and_then(|v| v.canonical_text()) {
                    parts.push(text);
                }
            }
            if parts.len() == pk.len() {
                return Ok(parts.join("\0"));
            }
        }
    }

    static SEQ: AtomicU64 = AtomicU64::new(0);
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    Ok(format!("{micros:x}-{:x}", SEQ.fetch_add(1, Ordering::Relaxed)))
}

pub(crate) fn execute_update(
    db: &Database,
    stmt: &UpdateStatement,
    txn: Option<TxnId>,
) -> Result<Vec<Document>, SqlError> {
    let candidates = fetch_candidates(db, &stmt.collection, stmt.where_clause.as_ref())?;
    let mut updated = 0u64;
    for original in candidates {
        if let Some(where_clause) = &stmt.where_clause {
            if !eval_predicate(where_clause, &original)? {
                continue;
            }
        }
        // Every SET expression sees the pre-write row, not the partially
        // updated one.
        let mut next = original.clone();
        for (field, expr) in &stmt.set {
            let value = eval_update_value(expr, &original)?;
            next.set(field.clone(), value);
        }
        db.put(&stmt.collection, &original.id, next, txn)?;
        updated += 1;
    }
    Ok(vec![summary("updated_count", updated)])
}

pub(crate) fn execute_delete(
    db: &Database,
    stmt: &DeleteStatement,
    txn: Option<TxnId>,
) -> Result<Vec<Document>, SqlError> {
    let candidates = fetch_candidates(db, &stmt.collection, stmt.where_clause.as_ref())?;
    let mut deleted = 0u64;
    for doc in candidates {
        if let Some(where_clause) = &stmt.where_clause {
            if !eval_predicate(where_clause, &doc)? {
                continue;
            }
        }
        db.delete(&stmt.collection, &doc.id, txn)?;
        deleted += 1;
    }
    Ok(vec![summary("deleted_count", deleted)])
}

fn summary(key: &str, count: u64) -> Document {
    Document::new("summary").with(key, count as f64)
}
