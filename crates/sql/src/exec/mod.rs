//! Query execution against a [`Database`].

mod eval;
mod mutate;
mod plan;
mod select;

use tissdb_model::{Document, Value};
use tissdb_storage::{Database, TxnId};

use crate::{
    ast::{Expr, SelectStatement, Statement},
    error::SqlError,
};

pub use plan::choose_index;

/// Executes parsed statements. Rows come back as documents; UPDATE and
/// DELETE return a one-row summary (`updated_count` / `deleted_count`).
pub struct Executor<'a> {
    db: &'a Database,
}

impl<'a> Executor<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn execute(
        &self,
        statement: &Statement,
        params: &[Value],
    ) -> Result<Vec<Document>, SqlError> {
        self.execute_in(statement, params, None)
    }

    /// Execute with mutations routed through transaction `txn` when given.
    /// Reads see committed state only; staged writes become visible at
    /// commit.
    pub fn execute_in(
        &self,
        statement: &Statement,
        params: &[Value],
        txn: Option<TxnId>,
    ) -> Result<Vec<Document>, SqlError> {
        let statement = bind_params(statement, params)?;
        match &statement {
            Statement::Select(stmt) => select::execute_select(self.db, stmt),
            Statement::Insert(stmt) => mutate::execute_insert(self.db, stmt, txn),
            Statement::Update(stmt) => mutate::execute_update(self.db, stmt, txn),
            Statement::Delete(stmt) => mutate::execute_delete(self.db, stmt, txn),
        }
    }
}

/// Substitute positional placeholders, failing on a count mismatch.
fn bind_params(statement: &Statement, params: &[Value]) -> Result<Statement, SqlError> {
    let expected = count_params(statement);
    if expected != params.len() {
        return Err(SqlError::ParameterCount {
            expected,
            supplied: params.len(),
        });
    }
    Ok(map_statement(statement, &mut |expr| {
        if let Expr::Param(index) = expr {
            Expr::Literal(params[*index].clone())
        } else {
            expr.clone()
        }
    }))
}

fn count_params(statement: &Statement) -> usize {
    let mut max_index = None::<usize>;
    visit_statement(statement, &mut |expr| {
        if let Expr::Param(index) = expr {
            max_index = Some(max_index.map_or(*index, |m: usize| m.max(*index)));
        }
    });
    max_index.map_or(0, |m| m + 1)
}

fn visit_statement(statement: &Statement, f: &mut impl FnMut(&Expr)) {
    match statement {
        Statement::Select(stmt) => visit_select(stmt, f),
        Statement::Insert(stmt) => {
            for value in &stmt.values {
                value.walk(f);
            }
        }
        Statement::Update(stmt) => {
            for (_, value) in &stmt.set {
                value.walk(f);
            }
            if let Some(expr) = &stmt.where_clause {
                expr.walk(f);
            }
        }
        Statement::Delete(stmt) => {
            if let Some(expr) = &stmt.where_clause {
                expr.walk(f);
            }
        }
    }
}

fn visit_select(stmt: &SelectStatement, f: &mut impl FnMut(&Expr)) {
    if let Some(join) = &stmt.join {
        if let Some(on) = &join.on {
            on.walk(f);
        }
    }
    if let Some(expr) = &stmt.where_clause {
        expr.walk(f);
    }
    if let Some(expr) = &stmt.having {
        expr.walk(f);
    }
    if let Some(union) = &stmt.union {
        visit_select(&union.select, f);
    }
}

/// Rebuild a statement with every expression mapped through `f`.
fn map_statement(statement: &Statement, f: &mut impl FnMut(&Expr) -> Expr) -> Statement {
    match statement {
        Statement::Select(stmt) => Statement::Select(map_select(stmt, f)),
        Statement::Insert(stmt) => {
            let mut stmt = stmt.clone();
            stmt.values = stmt.values.iter().map(|e| map_expr(e, f)).collect();
            Statement::Insert(stmt)
        }
        Statement::Update(stmt) => {
            let mut stmt = stmt.clone();
            stmt.set = stmt
                .set
                .iter()
                .map(|(field, value)| (field.clone(), map_expr(value, f)))
                .collect();
            stmt.where_clause = stmt.where_clause.as_ref().map(|e| map_expr(e, f));
            Statement::Update(stmt)
        }
        Statement::Delete(stmt) => {
            let mut stmt = stmt.clone();
            stmt.where_clause = stmt.where_clause.as_ref().map(|e| map_expr(e, f));
            Statement::Delete(stmt)
        }
    }
}

fn map_select(stmt: &SelectStatement, f: &mut impl FnMut(&Expr) -> Expr) -> SelectStatement {
    let mut stmt = stmt.clone();
    if let Some(join) = &mut stmt.join {
        join.on = join.on.as_ref().map(|e| map_expr(e, f));
    }
    stmt.where_clause = stmt.where_clause.as_ref().map(|e| map_expr(e, f));
    stmt.having = stmt.having.as_ref().map(|e| map_expr(e, f));
    if let Some(union) = stmt.union.take() {
        stmt.union = Some(Box::new(crate::ast::UnionClause {
            all: union.all,
            select: map_select(&union.select, f),
        }));
    }
    stmt
}

fn map_expr(expr: &Expr, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
    let mapped = f(expr);
    match mapped {
        Expr::Not(inner) => Expr::Not(Box::new(map_expr(&inner, f))),
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(map_expr(&left, f)),
            op,
            right: Box::new(map_expr(&right, f)),
        },
        Expr::Logical { left, op, right } => Expr::Logical {
            left: Box::new(map_expr(&left, f)),
            op,
            right: Box::new(map_expr(&right, f)),
        },
        other => other,
    }
}
