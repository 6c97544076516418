//! Index selection.
//!
//! Only AND-connected `field = literal` conditions can feed an index probe.
//! Among the indexes whose entire field list is covered by the conditions,
//! the one with the most fields wins; declaration order breaks ties (the
//! available list arrives in declaration order, and the scan below keeps
//! the first maximum).

use std::collections::BTreeMap;

use crate::ast::{BinOp, Expr, LogicalOp};

/// Collect AND-connected equality conditions as field → canonical text.
pub(crate) fn extract_equality_conditions(expr: &Expr, out: &mut BTreeMap<String, String>) {
    match expr {
        Expr::Logical {
            left,
            op: LogicalOp::And,
            right,
        } => {
            extract_equality_conditions(left, out);
            extract_equality_conditions(right, out);
        }
        Expr::Binary {
            left,
            op: BinOp::Eq,
            right,
        } => {
            if let (Expr::Identifier(field), Expr::Literal(value)) = (&**left, &**right) {
                if let Some(text) = value.canonical_text() {
                    out.insert(field.clone(), text);
                }
            }
        }
        _ => {}
    }
}

/// Pick the best covering index for the given equality conditions.
pub fn choose_index(
    available: &[Vec<String>],
    conditions: &BTreeMap<String, String>,
) -> Option<Vec<String>> {
    let mut best: Option<&Vec<String>> = None;
    for fields in available {
        if fields.is_empty() || !fields.iter().all(|f| conditions.contains_key(f)) {
            continue;
        }
        if best.map_or(true, |b| fields.len() > b.len()) {
            best = Some(fields);
        }
    }
    best.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Statement;
    use crate::parse;
    use pretty_assertions::assert_eq;

    fn conditions_of(query: &str) -> BTreeMap<String, String> {
        let Statement::Select(stmt) = parse(query).unwrap() else {
            panic!("expected select");
        };
        let mut out = BTreeMap::new();
        extract_equality_conditions(&stmt.where_clause.unwrap(), &mut out);
        out
    }

    fn idx(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn only_and_connected_equalities_count() {
        let conds = conditions_of(
            "SELECT * FROM t WHERE brand = 'X' AND price = 1 AND (size > 2 OR color = 'red')",
        );
        assert_eq!(conds.len(), 2);
        assert_eq!(conds["brand"], "X");
        assert_eq!(conds["price"], "1");

        // Under OR nothing is extractable.
        let conds = conditions_of("SELECT * FROM t WHERE brand = 'X' OR price = 1");
        assert!(conds.is_empty());
    }

    #[test]
    fn compound_index_preferred_when_fully_covered() {
        // Both {brand} and {brand, type} exist.
        let available = vec![idx(&["brand"]), idx(&["brand", "type"])];

        let conds = conditions_of("SELECT * FROM t WHERE brand = 'X' AND type = 'Y'");
        assert_eq!(choose_index(&available, &conds), Some(idx(&["brand", "type"])));

        // price is not indexed, so only {brand} is covered; the residual
        // condition filters after the probe.
        let conds = conditions_of("SELECT * FROM t WHERE brand = 'X' AND price = 1");
        assert_eq!(choose_index(&available, &conds), Some(idx(&["brand"])));

        let conds = conditions_of("SELECT * FROM t WHERE price = 1");
        assert_eq!(choose_index(&available, &conds), None);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let available = vec![idx(&["a", "b"]), idx(&["b", "c"])];
        let conds = conditions_of("SELECT * FROM t WHERE a = 1 AND b = 2 AND c = 3");
        assert_eq!(choose_index(&available, &conds), Some(idx(&["a", "b"])));
    }
}
