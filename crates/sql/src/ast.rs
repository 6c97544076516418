//! The TissQL abstract syntax tree.
//!
//! Recursive expression nodes are boxed; equality everywhere is structural,
//! so tests can compare whole parse trees.

use tissdb_model::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Stddev,
}

impl AggregateKind {
    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Sum => "SUM",
            AggregateKind::Avg => "AVG",
            AggregateKind::Count => "COUNT",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Stddev => "STDDEV",
        }
    }

    pub(crate) fn parse(word: &str) -> Option<Self> {
        Some(match word.to_ascii_uppercase().as_str() {
            "SUM" => AggregateKind::Sum,
            "AVG" => AggregateKind::Avg,
            "COUNT" => AggregateKind::Count,
            "MIN" => AggregateKind::Min,
            "MAX" => AggregateKind::Max,
            "STDDEV" => AggregateKind::Stddev,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFunction {
    pub kind: AggregateKind,
    /// `None` is `COUNT(*)`.
    pub field: Option<String>,
}

impl AggregateFunction {
    /// The column name this aggregate emits, e.g. `SUM(amount)`.
    pub fn result_key(&self) -> String {
        match &self.field {
            Some(field) => format!("{}({field})", self.kind.name()),
            None => format!("{}(*)", self.kind.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    All,
    Column(String),
    Aggregate(AggregateFunction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub collection: String,
    pub kind: JoinKind,
    /// Absent only for CROSS joins.
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionClause {
    pub all: bool,
    pub select: SelectStatement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub items: Vec<SelectItem>,
    pub distinct: bool,
    pub from: String,
    pub join: Option<JoinClause>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<String>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub union: Option<Box<UnionClause>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub collection: String,
    pub columns: Vec<String>,
    pub values: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub collection: String,
    pub set: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub collection: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    /// Positional `?` placeholder, replaced before execution.
    Param(usize),
    /// Aggregate reference; legal in select lists and HAVING.
    Aggregate(AggregateFunction),
    Not(Box<Expr>),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Logical {
        left: Box<Expr>,
        op: LogicalOp,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn logical(left: Expr, op: LogicalOp, right: Expr) -> Expr {
        Expr::Logical {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Walk the tree, calling `f` on every node.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Not(inner) => inner.walk(f),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            _ => {}
        }
    }
}
