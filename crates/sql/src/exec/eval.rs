//! Predicate and scalar evaluation over documents.
//!
//! Comparisons try a numeric interpretation of both sides first (strings
//! holding a valid double coerce); failing that they fall back to the
//! canonical text rendering. A missing field never matches anything.

use std::cmp::Ordering;

use tissdb_model::{Document, Value};

use crate::{
    ast::{BinOp, Expr, LogicalOp},
    error::SqlError,
};

pub(crate) fn eval_predicate(expr: &Expr, doc: &Document) -> Result<bool, SqlError> {
    match expr {
        Expr::Logical { left, op, right } => match op {
            LogicalOp::And => Ok(eval_predicate(left, doc)? && eval_predicate(right, doc)?),
            LogicalOp::Or => Ok(eval_predicate(left, doc)? || eval_predicate(right, doc)?),
        },
        Expr::Not(inner) => Ok(!eval_predicate(inner, doc)?),
        Expr::Binary { left, op, right } if op.is_comparison() => {
            let (Some(lhs), Some(rhs)) = (eval_operand(left, doc)?, eval_operand(right, doc)?)
            else {
                return Ok(false);
            };
            Ok(compare(*op, &lhs, &rhs))
        }
        // A bare value or arithmetic expression is not a predicate.
        _ => Ok(false),
    }
}

impl BinOp {
    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Like
        )
    }
}

/// Evaluate one side of a comparison. `None` means "no value" (missing
/// field, or arithmetic over non-numeric input), which makes the enclosing
/// comparison false.
pub(crate) fn eval_operand(expr: &Expr, doc: &Document) -> Result<Option<Value>, SqlError> {
    Ok(match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Identifier(name) => doc.get(name).cloned(),
        Expr::Aggregate(agg) => doc.get(&agg.result_key()).cloned(),
        Expr::Param(_) => None,
        Expr::Binary { left, op, right } if !op.is_comparison() => {
            let lhs = eval_operand(left, doc)?.as_ref().and_then(Value::as_f64);
            let rhs = eval_operand(right, doc)?.as_ref().and_then(Value::as_f64);
            match (lhs, rhs) {
                (Some(a), Some(b)) => Some(Value::Number(arith(*op, a, b)?)),
                _ => None,
            }
        }
        _ => None,
    })
}

fn arith(op: BinOp, a: f64, b: f64) -> Result<f64, SqlError> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(SqlError::DivisionByZero);
            }
            a / b
        }
        _ => unreachable!("comparison ops handled by the caller"),
    })
}

pub(crate) fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> bool {
    if op == BinOp::Like {
        let (Some(text), Some(pattern)) = (lhs.canonical_text(), rhs.canonical_text()) else {
            return false;
        };
        return like_match(&text, &pattern);
    }

    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Lt => a < b,
            BinOp::Gt => a > b,
            BinOp::Le => a <= b,
            BinOp::Ge => a >= b,
            _ => false,
        };
    }

    let (Some(a), Some(b)) = (lhs.canonical_text(), rhs.canonical_text()) else {
        return false;
    };
    match op {
        BinOp::Eq => a == b,
        BinOp::Ne => a != b,
        BinOp::Lt => a < b,
        BinOp::Gt => a > b,
        BinOp::Le => a <= b,
        BinOp::Ge => a >= b,
        _ => false,
    }
}

/// Ordering used by ORDER BY: numeric when both sides coerce, canonical
/// text otherwise, absent values first.
pub(crate) fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            } else {
                match (a.canonical_text(), b.canonical_text()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => Ordering::Equal,
                }
            }
        }
    }
}

/// Translate a LIKE pattern into an anchored regex: `%` → `.*`, `_` → `.`,
/// all other regex metacharacters escaped.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '.' | '+' | '*' | '?' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

pub(crate) fn like_match(text: &str, pattern: &str) -> bool {
    match regex::Regex::new(&like_to_regex(pattern)) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Evaluate a SET expression against the pre-write state of the row.
/// Unlike predicate operands, missing fields here are hard errors.
pub(crate) fn eval_update_value(expr: &Expr, original: &Document) -> Result<Value, SqlError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(name) => original
            .get(name)
            .cloned()
            .ok_or_else(|| SqlError::UnknownField(name.clone())),
        Expr::Binary { left, op, right } if !op.is_comparison() => {
            let lhs = eval_update_value(left, original)?;
            let rhs = eval_update_value(right, original)?;
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(SqlError::FieldTypeMismatch {
                    field: format!("{expr:?}"),
                    expected: "numeric",
                });
            };
            Ok(Value::Number(arith(*op, a, b)?))
        }
        _ => Err(SqlError::FieldTypeMismatch {
            field: format!("{expr:?}"),
            expected: "literal, field or arithmetic",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use crate::ast::Statement;

    fn where_of(query: &str) -> Expr {
        match parse(query).unwrap() {
            Statement::Select(s) => s.where_clause.unwrap(),
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn numeric_comparison_coerces_strings() {
        let doc = Document::new("d").with("price", "100");
        let expr = where_of("SELECT * FROM t WHERE price > 50");
        assert!(eval_predicate(&expr, &doc).unwrap());
        let expr = where_of("SELECT * FROM t WHERE price > 500");
        assert!(!eval_predicate(&expr, &doc).unwrap());
    }

    #[test]
    fn string_fallback_and_missing_fields() {
        let doc = Document::new("d").with("name", "Bob").with("active", true);
        assert!(eval_predicate(&where_of("SELECT * FROM t WHERE name = 'Bob'"), &doc).unwrap());
        assert!(eval_predicate(&where_of("SELECT * FROM t WHERE active = 'true'"), &doc).unwrap());
        // Missing field compares false, and NOT flips it.
        assert!(!eval_predicate(&where_of("SELECT * FROM t WHERE ghost = 1"), &doc).unwrap());
        assert!(eval_predicate(&where_of("SELECT * FROM t WHERE NOT ghost = 1"), &doc).unwrap());
    }

    #[test]
    fn like_semantics() {
        // Wildcards plus metacharacter escaping.
        assert!(like_match("Alice", "Ali%"));
        assert!(like_match("Alicia", "Ali%"));
        assert!(!like_match("Bob", "Ali%"));
        assert!(like_match("Alice", "%e"));
        assert!(like_match("Charlie", "%e"));
        assert!(like_match("Alice", "Ali_e"));
        assert!(!like_match("Alicia", "Ali_e"));
        assert!(like_match("3.14", "3.1_"));
        assert!(!like_match("3x14", "3.1_"));
        assert!(like_match("a*b", "a*b"));
        assert!(!like_match("aXb", "a*b"));
        assert!(like_match("(x)|[y]", "(x)|[y]"));
    }

    #[test]
    fn division_by_zero_surfaces() {
        let doc = Document::new("d").with("a", 1.0);
        let expr = where_of("SELECT * FROM t WHERE a = 1 / 0");
        assert!(matches!(
            eval_predicate(&expr, &doc),
            Err(SqlError::DivisionByZero)
        ));
    }

    #[test]
    fn update_values_use_original_row() {
        let doc = Document::new("d").with("a", 2.0).with("b", 3.0);
        let Statement::Update(stmt) = parse("UPDATE t SET a = a + b, b = a * 2").unwrap() else {
            panic!();
        };
        assert_eq!(eval_update_value(&stmt.set[0].1, &doc).unwrap(), Value::Number(5.0));
        // Still the original `a`, not the updated one.
        assert_eq!(eval_update_value(&stmt.set[1].1, &doc).unwrap(), Value::Number(4.0));

        let Statement::Update(stmt) = parse("UPDATE t SET x = missing + 1").unwrap() else {
            panic!();
        };
        assert!(matches!(
            eval_update_value(&stmt.set[0].1, &doc),
            Err(SqlError::UnknownField(_))
        ));
    }
}
