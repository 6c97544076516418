//! SELECT execution: candidate fetch (index probe or scan), joins,
//! filtering, aggregation, HAVING, projection, DISTINCT, ORDER BY, LIMIT
//! and UNION.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use tissdb_model::{Document, Element, Value};
use tissdb_storage::Database;

use crate::{
    ast::{
        AggregateFunction, AggregateKind, Expr, JoinKind, SelectItem, SelectStatement,
        SortDirection,
    },
    error::SqlError,
    exec::{
        eval::{eval_predicate, order_values},
        plan::{choose_index, extract_equality_conditions},
    },
};

pub(crate) fn execute_select(
    db: &Database,
    stmt: &SelectStatement,
) -> Result<Vec<Document>, SqlError> {
    let mut rows = select_core(db, stmt)?;
    if let Some(union) = &stmt.union {
        let right = execute_select(db, &union.select)?;
        rows.extend(right);
        if !union.all {
            rows.sort_by(|a, b| a.id.cmp(&b.id));
            rows.dedup();
        }
    }
    Ok(rows)
}

fn select_core(db: &Database, stmt: &SelectStatement) -> Result<Vec<Document>, SqlError> {
    let mut rows = fetch_candidates(db, &stmt.from, stmt.where_clause.as_ref())?;

    if let Some(join) = &stmt.join {
        rows = join_rows(db, rows, join)?;
    }

    if let Some(where_clause) = &stmt.where_clause {
        let mut filtered = Vec::with_capacity(rows.len());
        for row in rows {
            if eval_predicate(where_clause, &row)? {
                filtered.push(row);
            }
        }
        rows = filtered;
    }

    let has_aggregate = stmt
        .items
        .iter()
        .any(|item| matches!(item, SelectItem::Aggregate(_)));
    let mut rows = if has_aggregate {
        let aggregated = aggregate_rows(stmt, rows)?;
        match &stmt.having {
            Some(having) => {
                validate_having(stmt, having)?;
                let mut kept = Vec::with_capacity(aggregated.len());
                for row in aggregated {
                    if eval_predicate(having, &row)? {
                        kept.push(row);
                    }
                }
                kept
            }
            None => aggregated,
        }
    } else {
        project(stmt, rows)
    };

    if stmt.distinct {
        let mut unique: Vec<Document> = Vec::with_capacity(rows.len());
        for row in rows {
            if !unique.contains(&row) {
                unique.push(row);
            }
        }
        rows = unique;
    }

    if !stmt.order_by.is_empty() {
        rows.sort_by(|a, b| {
            for order in &stmt.order_by {
                let cmp = order_values(a.get(&order.column), b.get(&order.column));
                let cmp = match order.direction {
                    SortDirection::Asc => cmp,
                    SortDirection::Desc => cmp.reverse(),
                };
                if cmp != std::cmp::Ordering::Equal {
                    return cmp;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    if let Some(limit) = stmt.limit {
        rows.truncate(limit as usize);
    }

    Ok(rows)
}

/// Fetch the candidate rows for a statement over `collection`, probing the
/// best covering index when the WHERE clause allows it.
pub(crate) fn fetch_candidates(
    db: &Database,
    collection: &str,
    where_clause: Option<&Expr>,
) -> Result<Vec<Document>, SqlError> {
    if let Some(expr) = where_clause {
        let mut conditions = BTreeMap::new();
        extract_equality_conditions(expr, &mut conditions);
        if !conditions.is_empty() {
            let available = db.available_indexes(collection)?;
            if let Some(fields) = choose_index(&available, &conditions) {
                let values: Vec<String> =
                    fields.iter().map(|f| conditions[f].clone()).collect();
                let ids = db.find_by_index(collection, &fields, &values)?;
                debug!(
                    "query on {collection}: index {:?} matched {} candidates",
                    fields,
                    ids.len()
                );
                let mut docs = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(doc) = db.get(collection, &id, None)? {
                        docs.push(doc);
                    }
                }
                return Ok(docs);
            }
        }
    }
    debug!("query on {collection}: full scan");
    Ok(db.scan(collection)?)
}

fn join_rows(
    db: &Database,
    left_rows: Vec<Document>,
    join: &crate::ast::JoinClause,
) -> Result<Vec<Document>, SqlError> {
    let right_rows = db.scan(&join.collection)?;
    let mut joined = Vec::new();

    if join.kind == JoinKind::Cross {
        for left in &left_rows {
            for right in &right_rows {
                joined.push(combine(left, right));
            }
        }
        return Ok(joined);
    }

    let on = join.on.as_ref();
    let mut right_matched = vec![false; right_rows.len()];
    for left in &left_rows {
        let mut left_matched = false;
        for (i, right) in right_rows.iter().enumerate() {
            let combined = combine(left, right);
            let hit = match on {
                Some(expr) => eval_predicate(expr, &combined)?,
                None => true,
            };
            if hit {
                joined.push(combined);
                left_matched = true;
                right_matched[i] = true;
            }
        }
        if !left_matched && matches!(join.kind, JoinKind::Left | JoinKind::Full) {
            joined.push(left.clone());
        }
    }
    if matches!(join.kind, JoinKind::Right | JoinKind::Full) {
        for (i, right) in right_rows.iter().enumerate() {
            if !right_matched[i] {
                joined.push(right.clone());
            }
        }
    }
    Ok(joined)
}

/// Merge two documents for a join row: ids joined with `_`, left-side
/// elements win on key collisions.
fn combine(left: &Document, right: &Document) -> Document {
    let mut combined = Document::new(format!("{}_{}", left.id, right.id));
    combined.elements = left.elements.clone();
    for element in &right.elements {
        if combined.get(&element.key).is_none() {
            combined.elements.push(element.clone());
        }
    }
    combined
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    sum_sq: f64,
    /// Non-null occurrences, for COUNT(field).
    count: u64,
    /// Rows seen, for COUNT(*).
    rows: u64,
    /// Values that coerced to a number, for AVG and STDDEV.
    numeric_count: u64,
    min: Option<f64>,
    max: Option<f64>,
    min_str: Option<String>,
    max_str: Option<String>,
}

impl Accumulator {
    fn feed(&mut self, agg: &AggregateFunction, doc: &Document) {
        self.rows += 1;
        let Some(field) = &agg.field else {
            return;
        };
        let Some(value) = doc.get(field) else {
            return;
        };
        if value.is_null() {
            return;
        }
        self.count += 1;
        match value {
            Value::Number(n) => {
                self.numeric_count += 1;
                self.sum += n;
                self.sum_sq += n * n;
                self.min = Some(self.min.map_or(*n, |m| m.min(*n)));
                self.max = Some(self.max.map_or(*n, |m| m.max(*n)));
            }
            Value::String(s) => {
                if self.min_str.as_ref().map_or(true, |m| s < m) {
                    self.min_str = Some(s.clone());
                }
                if self.max_str.as_ref().map_or(true, |m| s > m) {
                    self.max_str = Some(s.clone());
                }
            }
            _ => {}
        }
    }

    fn result(&self, kind: AggregateKind, star: bool) -> Value {
        match kind {
            AggregateKind::Sum => Value::Number(self.sum),
            AggregateKind::Count => {
                Value::Number(if star { self.rows } else { self.count } as f64)
            }
            AggregateKind::Avg => {
                if self.numeric_count > 0 {
                    Value::Number(self.sum / self.numeric_count as f64)
                } else {
                    Value::Number(0.0)
                }
            }
            AggregateKind::Min => match (&self.min_str, self.min) {
                (Some(s), _) => Value::String(s.clone()),
                (None, Some(n)) => Value::Number(n),
                (None, None) => Value::Number(0.0),
            },
            AggregateKind::Max => match (&self.max_str, self.max) {
                (Some(s), _) => Value::String(s.clone()),
                (None, Some(n)) => Value::Number(n),
                (None, None) => Value::Number(0.0),
            },
            AggregateKind::Stddev => {
                if self.numeric_count > 0 {
                    let n = self.numeric_count as f64;
                    let mean = self.sum / n;
                    Value::Number((self.sum_sq / n - mean * mean).max(0.0).sqrt())
                } else {
                    Value::Number(0.0)
                }
            }
        }
    }
}

fn aggregate_rows(
    stmt: &SelectStatement,
    rows: Vec<Document>,
) -> Result<Vec<Document>, SqlError> {
    let mut buckets: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for row in rows {
        let key = if stmt.group_by.is_empty() {
            "aggregate".to_owned()
        } else {
            stmt.group_by
                .iter()
                .map(|field| {
                    row.get(field)
                        .and_then(Value::canonical_text)
                        .unwrap_or_else(|| "NULL".to_owned())
                })
                .join("::")
        };
        buckets.entry(key).or_default().push(row);
    }
    // With no input rows and no GROUP BY, aggregates still emit one row
    // (COUNT(*) of nothing is 0).
    if buckets.is_empty() && stmt.group_by.is_empty() {
        buckets.insert("aggregate".to_owned(), Vec::new());
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (key, docs) in buckets {
        let mut row = Document::new(key);
        if let Some(first) = docs.first() {
            for field in &stmt.group_by {
                if let Some(value) = first.get(field) {
                    row.elements.push(Element::new(field.clone(), value.clone()));
                }
            }
        }
        for item in &stmt.items {
            let SelectItem::Aggregate(agg) = item else {
                continue;
            };
            let mut acc = Accumulator::default();
            for doc in &docs {
                acc.feed(agg, doc);
            }
            row.elements.push(Element::new(
                agg.result_key(),
                acc.result(agg.kind, agg.field.is_none()),
            ));
        }
        out.push(row);
    }
    Ok(out)
}

/// HAVING may only reference the aggregated row: GROUP BY columns and the
/// `FN(field)` keys the select list emits.
fn validate_having(stmt: &SelectStatement, having: &Expr) -> Result<(), SqlError> {
    let mut allowed: Vec<String> = stmt.group_by.clone();
    for item in &stmt.items {
        if let SelectItem::Aggregate(agg) = item {
            allowed.push(agg.result_key());
        }
    }
    let mut bad = None;
    having.walk(&mut |expr| {
        if let Expr::Identifier(name) = expr {
            if bad.is_none() && !allowed.iter().any(|a| a == name) {
                bad = Some(name.clone());
            }
        }
    });
    match bad {
        Some(name) => Err(SqlError::UnknownField(name)),
        None => Ok(()),
    }
}

fn project(stmt: &SelectStatement, rows: Vec<Document>) -> Vec<Document> {
    if stmt.items.iter().any(|item| matches!(item, SelectItem::All)) {
        return rows;
    }
    rows.into_iter()
        .map(|row| {
            let mut projected = Document::new(row.id.clone());
            for item in &stmt.items {
                if let SelectItem::Column(name) = item {
                    if let Some(value) = row.get(name) {
                        projected.elements.push(Element::new(name.clone(), value.clone()));
                    }
                }
            }
            projected
        })
        .collect()
}
