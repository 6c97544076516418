//! Recursive-descent parser with precedence climbing for expressions.
//!
//! Precedence, loosest first: OR, AND, NOT, comparisons (`= != < > <= >=
//! LIKE`), additive (`+ -`), multiplicative (`* /`), primary.

use tissdb_model::Value;

use crate::{
    ast::*,
    error::ParseError,
    lexer::tokenize,
    token::{Keyword, Op, Token, TokenKind},
};

const BP_OR: u8 = 1;
const BP_AND: u8 = 2;
const BP_NOT: u8 = 3;
const BP_CMP: u8 = 4;
const BP_ADD: u8 = 5;
const BP_MUL: u8 = 6;

/// Parse one TissQL statement.
pub fn parse(input: &str) -> Result<Statement, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.parse_statement()?;
    parser.expect_eoi()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek2(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].offset
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.offset(), message)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if *self.peek() == TokenKind::Keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {keyword:?}")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            TokenKind::Ident(_) => {
                let TokenKind::Ident(name) = self.advance() else { unreachable!() };
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn expect_token(&mut self, token: TokenKind, what: &str) -> Result<(), ParseError> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_eoi(&self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Eoi => Ok(()),
            _ => Err(self.error("unexpected trailing input")),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek() {
            TokenKind::Keyword(Keyword::Select) => self.parse_select().map(Statement::Select),
            TokenKind::Keyword(Keyword::Insert) => self.parse_insert().map(Statement::Insert),
            TokenKind::Keyword(Keyword::Update) => self.parse_update().map(Statement::Update),
            TokenKind::Keyword(Keyword::Delete) => self.parse_delete().map(Statement::Delete),
            _ => Err(self.error("expected SELECT, INSERT, UPDATE or DELETE")),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStatement, ParseError> {
        self.expect_keyword(Keyword::Select)?;
        let distinct = self.eat_keyword(Keyword::Distinct);
        let items = self.parse_select_list()?;
        self.expect_keyword(Keyword::From)?;
        let from = self.expect_ident("collection name")?;
        let join = self.parse_join()?;

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_expr(0)?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By)?;
            loop {
                group_by.push(self.expect_ident("GROUP BY column")?);
                if !matches!(self.peek(), TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }

        let having = if self.eat_keyword(Keyword::Having) {
            Some(self.parse_expr(0)?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.eat_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let column = self.expect_ident("ORDER BY column")?;
                let direction = if self.eat_keyword(Keyword::Desc) {
                    SortDirection::Desc
                } else {
                    self.eat_keyword(Keyword::Asc);
                    SortDirection::Asc
                };
                order_by.push(OrderBy { column, direction });
                if !matches!(self.peek(), TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }

        let limit = if self.eat_keyword(Keyword::Limit) {
            match self.advance() {
                TokenKind::Number(n) if n >= 0.0 => Some(n as u64),
                _ => return Err(self.error("expected LIMIT count")),
            }
        } else {
            None
        };

        let union = if self.eat_keyword(Keyword::Union) {
            let all = self.eat_keyword(Keyword::All);
            let select = self.parse_select()?;
            Some(Box::new(UnionClause { all, select }))
        } else {
            None
        };

        Ok(SelectStatement {
            items,
            distinct,
            from,
            join,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            union,
        })
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>, ParseError> {
        let mut items = Vec::new();
        loop {
            let item = match self.peek().clone() {
                TokenKind::Op(Op::Star) => {
                    self.advance();
                    SelectItem::All
                }
                TokenKind::Ident(word) => {
                    if let Some(kind) = AggregateKind::parse(&word) {
                        if matches!(self.peek2(), Some(TokenKind::LParen)) {
                            self.advance();
                            SelectItem::Aggregate(self.parse_aggregate_args(kind)?)
                        } else {
                            SelectItem::Column(self.expect_ident("column")?)
                        }
                    } else {
                        SelectItem::Column(self.expect_ident("column")?)
                    }
                }
                _ => return Err(self.error("expected column, aggregate or `*`")),
            };
            items.push(item);
            if !matches!(self.peek(), TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    fn parse_aggregate_args(&mut self, kind: AggregateKind) -> Result<AggregateFunction, ParseError> {
        self.expect_token(TokenKind::LParen, "`(`")?;
        let field = match self.peek() {
            TokenKind::Op(Op::Star) => {
                self.advance();
                None
            }
            TokenKind::Ident(_) => Some(self.expect_ident("aggregate field")?),
            _ => return Err(self.error("expected field name or `*`")),
        };
        self.expect_token(TokenKind::RParen, "`)`")?;
        Ok(AggregateFunction { kind, field })
    }

    fn parse_join(&mut self) -> Result<Option<JoinClause>, ParseError> {
        let kind = if self.eat_keyword(Keyword::Inner) {
            JoinKind::Inner
        } else if self.eat_keyword(Keyword::Left) {
            JoinKind::Left
        } else if self.eat_keyword(Keyword::Right) {
            JoinKind::Right
        } else if self.eat_keyword(Keyword::Full) {
            JoinKind::Full
        } else if self.eat_keyword(Keyword::Cross) {
            JoinKind::Cross
        } else if matches!(self.peek(), TokenKind::Keyword(Keyword::Join)) {
            JoinKind::Inner
        } else {
            return Ok(None);
        };
        self.expect_keyword(Keyword::Join)?;
        let collection = self.expect_ident("join collection")?;
        let on = if kind == JoinKind::Cross {
            None
        } else {
            self.expect_keyword(Keyword::On)?;
            Some(self.parse_expr(0)?)
        };
        Ok(Some(JoinClause { collection, kind, on }))
    }

    fn parse_insert(&mut self) -> Result<InsertStatement, ParseError> {
        self.expect_keyword(Keyword::Insert)?;
        self.expect_keyword(Keyword::Into)?;
        let collection = self.expect_ident("collection name")?;

        self.expect_token(TokenKind::LParen, "`(`")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.expect_ident("column name")?);
            if matches!(self.peek(), TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_token(TokenKind::RParen, "`)`")?;

        self.expect_keyword(Keyword::Values)?;
        self.expect_token(TokenKind::LParen, "`(`")?;
        let mut values = Vec::new();
        loop {
            values.push(self.parse_expr(0)?);
            if matches!(self.peek(), TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_token(TokenKind::RParen, "`)`")?;

        Ok(InsertStatement {
            collection,
            columns,
            values,
        })
    }

    fn parse_update(&mut self) -> Result<UpdateStatement, ParseError> {
        self.expect_keyword(Keyword::Update)?;
        let collection = self.expect_ident("collection name")?;
        self.expect_keyword(Keyword::Set)?;

        let mut set = Vec::new();
        loop {
            let field = self.expect_ident("SET field")?;
            self.expect_token(TokenKind::Op(Op::Eq), "`=`")?;
            // Comparison operators make no sense in a SET value; parse the
            // arithmetic levels only.
            let value = self.parse_expr(BP_CMP)?;
            set.push((field, value));
            if matches!(self.peek(), TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_expr(0)?)
        } else {
            None
        };

        Ok(UpdateStatement {
            collection,
            set,
            where_clause,
        })
    }

    fn parse_delete(&mut self) -> Result<DeleteStatement, ParseError> {
        self.expect_keyword(Keyword::Delete)?;
        self.expect_keyword(Keyword::From)?;
        let collection = self.expect_ident("collection name")?;
        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_expr(0)?)
        } else {
            None
        };
        Ok(DeleteStatement {
            collection,
            where_clause,
        })
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut left = if self.eat_keyword(Keyword::Not) {
            Expr::Not(Box::new(self.parse_expr(BP_NOT)?))
        } else {
            self.parse_primary()?
        };

        loop {
            let (bp, op) = match self.peek() {
                TokenKind::Keyword(Keyword::Or) => (BP_OR, None),
                TokenKind::Keyword(Keyword::And) => (BP_AND, None),
                TokenKind::Keyword(Keyword::Like) => (BP_CMP, Some(BinOp::Like)),
                TokenKind::Op(Op::Eq) => (BP_CMP, Some(BinOp::Eq)),
                TokenKind::Op(Op::Ne) => (BP_CMP, Some(BinOp::Ne)),
                TokenKind::Op(Op::Lt) => (BP_CMP, Some(BinOp::Lt)),
                TokenKind::Op(Op::Gt) => (BP_CMP, Some(BinOp::Gt)),
                TokenKind::Op(Op::Le) => (BP_CMP, Some(BinOp::Le)),
                TokenKind::Op(Op::Ge) => (BP_CMP, Some(BinOp::Ge)),
                TokenKind::Op(Op::Plus) => (BP_ADD, Some(BinOp::Add)),
                TokenKind::Op(Op::Minus) => (BP_ADD, Some(BinOp::Sub)),
                TokenKind::Op(Op::Star) => (BP_MUL, Some(BinOp::Mul)),
                TokenKind::Op(Op::Slash) => (BP_MUL, Some(BinOp::Div)),
                _ => break,
            };
            if bp <= min_bp {
                break;
            }
            let logical = match self.peek() {
                TokenKind::Keyword(Keyword::Or) => Some(LogicalOp::Or),
                TokenKind::Keyword(Keyword::And) => Some(LogicalOp::And),
                _ => None,
            };
            self.advance();
            let right = self.parse_expr(bp)?;
            left = match (logical, op) {
                (Some(logical_op), _) => Expr::logical(left, logical_op, right),
                (None, Some(bin_op)) => Expr::binary(left, bin_op, right),
                (None, None) => unreachable!("operator table covers all arms"),
            };
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal(Value::Number(n)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            TokenKind::Param(index) => {
                self.advance();
                Ok(Expr::Param(index))
            }
            TokenKind::Op(Op::Minus) => {
                self.advance();
                match self.peek() {
                    TokenKind::Number(n) => {
                        let n = *n;
                        self.advance();
                        Ok(Expr::Literal(Value::Number(-n)))
                    }
                    _ => Err(self.error("expected number after `-`")),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr(0)?;
                self.expect_token(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::Ident(word) => {
                if let Some(kind) = AggregateKind::parse(&word) {
                    if matches!(self.peek2(), Some(TokenKind::LParen)) {
                        self.advance();
                        return Ok(Expr::Aggregate(self.parse_aggregate_args(kind)?));
                    }
                }
                self.advance();
                Ok(Expr::Identifier(word))
            }
            _ => Err(self.error("expected expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn select(input: &str) -> SelectStatement {
        match parse(input).unwrap() {
            Statement::Select(s) => s,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn minimal_select() {
        let stmt = select("SELECT * FROM users");
        assert_eq!(stmt.items, vec![SelectItem::All]);
        assert_eq!(stmt.from, "users");
        assert!(stmt.where_clause.is_none());
    }

    #[test]
    fn precedence_or_and_cmp() {
        // a = 1 OR b = 2 AND c = 3  ==>  a=1 OR ((b=2) AND (c=3))
        let stmt = select("SELECT * FROM t WHERE a = 1 OR b = 2 AND c = 3");
        let expected = Expr::logical(
            Expr::binary(
                Expr::Identifier("a".into()),
                BinOp::Eq,
                Expr::Literal(Value::Number(1.0)),
            ),
            LogicalOp::Or,
            Expr::logical(
                Expr::binary(
                    Expr::Identifier("b".into()),
                    BinOp::Eq,
                    Expr::Literal(Value::Number(2.0)),
                ),
                LogicalOp::And,
                Expr::binary(
                    Expr::Identifier("c".into()),
                    BinOp::Eq,
                    Expr::Literal(Value::Number(3.0)),
                ),
            ),
        );
        assert_eq!(stmt.where_clause.unwrap(), expected);
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let stmt = select("SELECT * FROM t WHERE NOT a = 1 AND b = 2");
        let Expr::Logical { left, op, .. } = stmt.where_clause.unwrap() else {
            panic!("expected AND at the top");
        };
        assert_eq!(op, LogicalOp::And);
        assert!(matches!(*left, Expr::Not(_)));
    }

    #[test]
    fn arithmetic_precedence_in_set() {
        let Statement::Update(stmt) = parse("UPDATE t SET x = a + 2 * 3 WHERE id = 'k'").unwrap()
        else {
            panic!("expected update");
        };
        let expected = Expr::binary(
            Expr::Identifier("a".into()),
            BinOp::Add,
            Expr::binary(
                Expr::Literal(Value::Number(2.0)),
                BinOp::Mul,
                Expr::Literal(Value::Number(3.0)),
            ),
        );
        assert_eq!(stmt.set, vec![("x".to_owned(), expected)]);
        assert!(stmt.where_clause.is_some());
    }

    #[test]
    fn full_select_clause_train() {
        let stmt = select(
            "SELECT cat, SUM(amt), COUNT(*) FROM sales WHERE amt > 0 \
             GROUP BY cat HAVING SUM(amt) >= 10 ORDER BY cat DESC LIMIT 5",
        );
        assert_eq!(
            stmt.items,
            vec![
                SelectItem::Column("cat".into()),
                SelectItem::Aggregate(AggregateFunction {
                    kind: AggregateKind::Sum,
                    field: Some("amt".into()),
                }),
                SelectItem::Aggregate(AggregateFunction {
                    kind: AggregateKind::Count,
                    field: None,
                }),
            ]
        );
        assert_eq!(stmt.group_by, vec!["cat".to_owned()]);
        assert!(matches!(
            stmt.having,
            Some(Expr::Binary { op: BinOp::Ge, .. })
        ));
        assert_eq!(
            stmt.order_by,
            vec![OrderBy {
                column: "cat".into(),
                direction: SortDirection::Desc,
            }]
        );
        assert_eq!(stmt.limit, Some(5));
    }

    #[test]
    fn joins_and_union() {
        let stmt = select("SELECT * FROM a LEFT JOIN b ON a.id = b.a_id");
        let join = stmt.join.unwrap();
        assert_eq!(join.kind, JoinKind::Left);
        assert_eq!(join.collection, "b");
        assert!(join.on.is_some());

        let stmt = select("SELECT * FROM a CROSS JOIN b");
        assert_eq!(stmt.join.unwrap().kind, JoinKind::Cross);

        let stmt = select("SELECT x FROM a UNION ALL SELECT x FROM b");
        let union = stmt.union.unwrap();
        assert!(union.all);
        assert_eq!(union.select.from, "b");

        let stmt = select("SELECT x FROM a UNION SELECT x FROM b");
        assert!(!stmt.union.unwrap().all);
    }

    #[test]
    fn insert_and_params() {
        let Statement::Insert(stmt) =
            parse("INSERT INTO users (id, name, age) VALUES (?, ?, 30)").unwrap()
        else {
            panic!("expected insert");
        };
        assert_eq!(stmt.collection, "users");
        assert_eq!(stmt.columns, vec!["id", "name", "age"]);
        assert_eq!(
            stmt.values,
            vec![
                Expr::Param(0),
                Expr::Param(1),
                Expr::Literal(Value::Number(30.0)),
            ]
        );
    }

    #[test]
    fn delete_statement() {
        let Statement::Delete(stmt) = parse("DELETE FROM t WHERE name LIKE 'Ali%'").unwrap()
        else {
            panic!("expected delete");
        };
        assert_eq!(stmt.collection, "t");
        assert!(matches!(
            stmt.where_clause,
            Some(Expr::Binary { op: BinOp::Like, .. })
        ));
    }

    #[test]
    fn errors_have_offsets() {
        let err = parse("SELECT FROM t").unwrap_err();
        assert_eq!(err.offset, 7);
        let err = parse("SELECT * FROM t WHERE").unwrap_err();
        assert_eq!(err.offset, 21);
        let err = parse("SELECT * FROM t extra").unwrap_err();
        assert!(err.message.contains("trailing"));
    }

    #[test]
    fn parse_then_compare_roundtrip() {
        // Structural equality of independently parsed, semantically equal
        // forms: keyword case and whitespace do not matter.
        let a = parse("select * from T where A = 1 and B = 'x'").unwrap();
        let b = parse("SELECT  *  FROM T WHERE a = 1.0 AND b = 'x'").unwrap();
        // Identifier case is preserved, so compare against itself instead.
        assert_eq!(a, parse("SELECT * FROM T WHERE A = 1 AND B = 'x'").unwrap());
        assert_ne!(a, b);
    }
}
