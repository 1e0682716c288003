// Recursive-descent parser with precedence climbing for expressions.
//
// Statement-level errors are accumulated: a malformed statement is
// recorded with its source position and the parser resynchronizes at
// the next semicolon, so one bad statement does not hide the rest of a
// batch. DEFAULT and CHECK accept arbitrary expressions; a failed
// expression parse surfaces as a positioned syntax error.

use crate::common::{DataType, Value};
use crate::error::{DbError, Result};
use crate::sql::ast::*;
use crate::sql::lexer::Lexer;
use crate::sql::token::{Keyword, Span, Token, TokenSpan};

pub struct Parser {
    tokens: Vec<TokenSpan>,
    pos: usize,
    next_param: usize,
}

/// Parse a batch of statements. Returns every statement that parsed
/// plus every error encountered.
pub fn parse(sql: &str) -> (Vec<Statement>, Vec<DbError>) {
    let tokens = match Lexer::new(sql).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => return (Vec::new(), vec![e]),
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        next_param: 0,
    };
    let mut statements = Vec::new();
    let mut errors = Vec::new();
    loop {
        while parser.test_token(&Token::Semicolon) {}
        if parser.at_eof() {
            break;
        }
        match parser.parse_statement() {
            Ok(stmt) => {
                statements.push(stmt);
                if !parser.at_eof() && !parser.check_token(&Token::Semicolon) {
                    errors.push(parser.error_here("expected ';' between statements"));
                    parser.synchronize();
                }
            }
            Err(e) => {
                errors.push(e);
                parser.synchronize();
            }
        }
    }
    (statements, errors)
}

/// Parse a single expression, e.g. a stored DEFAULT. The whole input
/// must be consumed.
pub fn parse_expression(sql: &str) -> Result<Expr> {
    let tokens = Lexer::new(sql).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        next_param: 0,
    };
    let expr = parser.parse_expr()?;
    if !parser.at_eof() {
        return Err(parser.error_here("trailing input after expression"));
    }
    Ok(expr)
}

impl Parser {
    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek() {
            Token::Keyword(Keyword::Select) => self.parse_select().map(Statement::Select),
            Token::Keyword(Keyword::Insert) => self.parse_insert(),
            Token::Keyword(Keyword::Update) => self.parse_update(),
            Token::Keyword(Keyword::Delete) => self.parse_delete(),
            Token::Keyword(Keyword::Create) => self.parse_create_table(),
            Token::Keyword(Keyword::Drop) => self.parse_drop_table(),
            Token::Keyword(Keyword::Begin) => {
                self.advance();
                self.test_keyword(Keyword::Transaction);
                Ok(Statement::Begin)
            }
            Token::Keyword(Keyword::Commit) => {
                self.advance();
                Ok(Statement::Commit)
            }
            Token::Keyword(Keyword::Rollback) => {
                self.advance();
                let to_savepoint = if self.test_keyword(Keyword::To) {
                    self.test_keyword(Keyword::Savepoint);
                    Some(self.expect_ident()?)
                } else {
                    None
                };
                Ok(Statement::Rollback { to_savepoint })
            }
            Token::Keyword(Keyword::Savepoint) => {
                self.advance();
                let name = self.expect_ident()?;
                Ok(Statement::Savepoint { name })
            }
            _ => Err(self.error_here("expected a statement")),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStmt> {
        self.expect_keyword(Keyword::Select)?;
        let distinct = self.test_keyword(Keyword::Distinct);
        let mut items = vec![self.parse_select_item()?];
        while self.test_token(&Token::Comma) {
            items.push(self.parse_select_item()?);
        }
        let mut from = Vec::new();
        if self.test_keyword(Keyword::From) {
            from.push(self.parse_from_item()?);
            while self.test_token(&Token::Comma) {
                from.push(self.parse_from_item()?);
            }
        }
        let filter = if self.test_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let mut group_by = Vec::new();
        if self.test_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By)?;
            group_by.push(self.parse_expr()?);
            while self.test_token(&Token::Comma) {
                group_by.push(self.parse_expr()?);
            }
        }
        let having = if self.test_keyword(Keyword::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let mut order_by = Vec::new();
        if self.test_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let expr = self.parse_expr()?;
                let desc = if self.test_keyword(Keyword::Desc) {
                    true
                } else {
                    self.test_keyword(Keyword::Asc);
                    false
                };
                order_by.push(OrderByExpr { expr, desc });
                if !self.test_token(&Token::Comma) {
                    break;
                }
            }
        }
        let limit = if self.test_keyword(Keyword::Limit) {
            Some(self.expect_unsigned()?)
        } else {
            None
        };
        let offset = if self.test_keyword(Keyword::Offset) {
            Some(self.expect_unsigned()?)
        } else {
            None
        };
        Ok(SelectStmt {
            distinct,
            items,
            from,
            filter,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.test_token(&Token::Star) {
            return Ok(SelectItem::Wildcard);
        }
        // `t.*` needs two tokens of lookahead before falling back to an
        // ordinary expression.
        if let Token::Ident(name) = self.peek().clone() {
            if self.peek_at(1) == &Token::Dot && self.peek_at(2) == &Token::Star {
                self.advance();
                self.advance();
                self.advance();
                return Ok(SelectItem::QualifiedWildcard(name));
            }
        }
        let expr = self.parse_expr()?;
        let alias = if self.test_keyword(Keyword::As) {
            Some(self.expect_ident()?)
        } else if let Token::Ident(alias) = self.peek().clone() {
            self.advance();
            Some(alias)
        } else {
            None
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_from_item(&mut self) -> Result<FromItem> {
        let base = self.parse_table_ref()?;
        let mut joins = Vec::new();
        loop {
            let kind = if self.test_keyword(Keyword::Join) {
                JoinKind::Inner
            } else if self.test_keyword(Keyword::Inner) {
                self.expect_keyword(Keyword::Join)?;
                JoinKind::Inner
            } else if self.test_keyword(Keyword::Left) {
                self.test_keyword(Keyword::Outer);
                self.expect_keyword(Keyword::Join)?;
                JoinKind::LeftOuter
            } else if self.test_keyword(Keyword::Right) {
                self.test_keyword(Keyword::Outer);
                self.expect_keyword(Keyword::Join)?;
                JoinKind::RightOuter
            } else {
                break;
            };
            let table = self.parse_table_ref()?;
            self.expect_keyword(Keyword::On)?;
            let on = self.parse_expr()?;
            joins.push(Join { kind, table, on });
        }
        Ok(FromItem { base, joins })
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let span = self.span_here();
        let name = self.expect_ident()?;
        let alias = if self.test_keyword(Keyword::As) {
            Some(self.expect_ident()?)
        } else if let Token::Ident(alias) = self.peek().clone() {
            self.advance();
            Some(alias)
        } else {
            None
        };
        Ok(TableRef { name, alias, span })
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Insert)?;
        self.expect_keyword(Keyword::Into)?;
        let span = self.span_here();
        let name = self.expect_ident()?;
        let table = TableRef {
            name,
            alias: None,
            span,
        };
        let mut columns = Vec::new();
        if self.test_token(&Token::LParen) {
            columns.push(self.expect_ident()?);
            while self.test_token(&Token::Comma) {
                columns.push(self.expect_ident()?);
            }
            self.expect_token(&Token::RParen)?;
        }
        let source = if self.test_keyword(Keyword::Values) {
            let mut rows = vec![self.parse_value_tuple()?];
            while self.test_token(&Token::Comma) {
                rows.push(self.parse_value_tuple()?);
            }
            InsertSource::Values(rows)
        } else if self.check_keyword(Keyword::Select) {
            InsertSource::Select(Box::new(self.parse_select()?))
        } else {
            return Err(self.error_here("expected VALUES or SELECT"));
        };
        Ok(Statement::Insert(InsertStmt {
            table,
            columns,
            source,
        }))
    }

    fn parse_value_tuple(&mut self) -> Result<Vec<Expr>> {
        self.expect_token(&Token::LParen)?;
        let mut exprs = vec![self.parse_expr()?];
        while self.test_token(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        self.expect_token(&Token::RParen)?;
        Ok(exprs)
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Update)?;
        let span = self.span_here();
        let name = self.expect_ident()?;
        let table = TableRef {
            name,
            alias: None,
            span,
        };
        self.expect_keyword(Keyword::Set)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.expect_ident()?;
            self.expect_token(&Token::Eq)?;
            let value = self.parse_expr()?;
            assignments.push((column, value));
            if !self.test_token(&Token::Comma) {
                break;
            }
        }
        let filter = if self.test_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Update(UpdateStmt {
            table,
            assignments,
            filter,
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Delete)?;
        self.expect_keyword(Keyword::From)?;
        let span = self.span_here();
        let name = self.expect_ident()?;
        let table = TableRef {
            name,
            alias: None,
            span,
        };
        let filter = if self.test_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStmt { table, filter }))
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Create)?;
        self.expect_keyword(Keyword::Table)?;
        let span = self.span_here();
        let name = self.expect_ident()?;
        self.expect_token(&Token::LParen)?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            // Column definitions start with an identifier; anything led
            // by a constraint keyword is a table-level constraint.
            if self.check_keyword(Keyword::Constraint)
                || self.check_keyword(Keyword::Primary)
                || self.check_keyword(Keyword::Unique)
                || self.check_keyword(Keyword::Foreign)
                || self.check_keyword(Keyword::Check)
            {
                constraints.push(self.parse_table_constraint()?);
            } else {
                columns.push(self.parse_column_def()?);
            }
            if !self.test_token(&Token::Comma) {
                break;
            }
        }
        self.expect_token(&Token::RParen)?;
        Ok(Statement::CreateTable(CreateTableStmt {
            name,
            columns,
            constraints,
            span,
        }))
    }

    fn parse_table_constraint(&mut self) -> Result<TableConstraint> {
        let name = if self.test_keyword(Keyword::Constraint) {
            Some(self.expect_ident()?)
        } else {
            None
        };
        if self.test_keyword(Keyword::Primary) {
            self.expect_keyword(Keyword::Key)?;
            let columns = self.parse_ident_list()?;
            Ok(TableConstraint::PrimaryKey { name, columns })
        } else if self.test_keyword(Keyword::Unique) {
            let columns = self.parse_ident_list()?;
            Ok(TableConstraint::Unique { name, columns })
        } else if self.test_keyword(Keyword::Foreign) {
            self.expect_keyword(Keyword::Key)?;
            let columns = self.parse_ident_list()?;
            self.expect_keyword(Keyword::References)?;
            let ref_table = self.expect_ident()?;
            let ref_columns = self.parse_ident_list()?;
            Ok(TableConstraint::ForeignKey {
                name,
                columns,
                ref_table,
                ref_columns,
            })
        } else if self.test_keyword(Keyword::Check) {
            self.expect_token(&Token::LParen)?;
            let expr = self.parse_expr()?;
            self.expect_token(&Token::RParen)?;
            Ok(TableConstraint::Check { name, expr })
        } else {
            Err(self.error_here("expected PRIMARY KEY, UNIQUE, FOREIGN KEY, or CHECK"))
        }
    }

    fn parse_ident_list(&mut self) -> Result<Vec<String>> {
        self.expect_token(&Token::LParen)?;
        let mut out = vec![self.expect_ident()?];
        while self.test_token(&Token::Comma) {
            out.push(self.expect_ident()?);
        }
        self.expect_token(&Token::RParen)?;
        Ok(out)
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_ident()?;
        let (data_type, type_length) = self.parse_data_type()?;
        let mut def = ColumnDef {
            name,
            data_type,
            type_length,
            not_null: false,
            primary_key: false,
            unique: false,
            default: None,
            check: None,
        };
        loop {
            if self.test_keyword(Keyword::Not) {
                self.expect_keyword(Keyword::Null)?;
                def.not_null = true;
            } else if self.test_keyword(Keyword::Null) {
                def.not_null = false;
            } else if self.test_keyword(Keyword::Primary) {
                self.expect_keyword(Keyword::Key)?;
                def.primary_key = true;
            } else if self.test_keyword(Keyword::Unique) {
                def.unique = true;
            } else if self.test_keyword(Keyword::Default) {
                def.default = Some(self.parse_expr()?);
            } else if self.test_keyword(Keyword::Check) {
                self.expect_token(&Token::LParen)?;
                def.check = Some(self.parse_expr()?);
                self.expect_token(&Token::RParen)?;
            } else {
                break;
            }
        }
        Ok(def)
    }

    fn parse_data_type(&mut self) -> Result<(DataType, Option<u64>)> {
        let data_type = match self.peek() {
            Token::Keyword(Keyword::Integer)
            | Token::Keyword(Keyword::Int)
            | Token::Keyword(Keyword::Bigint) => DataType::Integer,
            Token::Keyword(Keyword::Real)
            | Token::Keyword(Keyword::Float)
            | Token::Keyword(Keyword::Double) => DataType::Real,
            Token::Keyword(Keyword::Text)
            | Token::Keyword(Keyword::Varchar)
            | Token::Keyword(Keyword::Char) => DataType::Text,
            Token::Keyword(Keyword::Blob) => DataType::Blob,
            Token::Keyword(Keyword::Boolean) | Token::Keyword(Keyword::Bool) => DataType::Boolean,
            _ => return Err(self.error_here("expected a column type")),
        };
        self.advance();
        let mut type_length = None;
        if self.test_token(&Token::LParen) {
            type_length = Some(self.expect_unsigned()?);
            // Precision part of e.g. DECIMAL-style declarations.
            if self.test_token(&Token::Comma) {
                self.expect_unsigned()?;
            }
            self.expect_token(&Token::RParen)?;
        }
        Ok((data_type, type_length))
    }

    fn parse_drop_table(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Drop)?;
        self.expect_keyword(Keyword::Table)?;
        let if_exists = if self.test_keyword(Keyword::If) {
            self.expect_keyword(Keyword::Exists)?;
            true
        } else {
            false
        };
        let name = self.expect_ident()?;
        Ok(Statement::DropTable(DropTableStmt { name, if_exists }))
    }

    // ---- expressions ----

    pub(crate) fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_expr_bp(0)
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let (bp, negated) = match self.peek_infix_bp() {
                Some(found) => found,
                None => break,
            };
            if bp < min_bp {
                break;
            }
            lhs = self.parse_infix(lhs, bp, negated)?;
        }
        Ok(lhs)
    }

    /// Binding power of the upcoming infix operator, if any, and
    /// whether it is a NOT-prefixed form (NOT LIKE / NOT IN / NOT
    /// BETWEEN).
    fn peek_infix_bp(&self) -> Option<(u8, bool)> {
        match self.peek() {
            Token::Keyword(Keyword::Or) => Some((1, false)),
            Token::Keyword(Keyword::And) => Some((2, false)),
            Token::Eq
            | Token::NotEq
            | Token::Lt
            | Token::LtEq
            | Token::Gt
            | Token::GtEq
            | Token::Keyword(Keyword::Like)
            | Token::Keyword(Keyword::In)
            | Token::Keyword(Keyword::Between)
            | Token::Keyword(Keyword::Is) => Some((4, false)),
            Token::Keyword(Keyword::Not)
                if matches!(
                    self.peek_at(1),
                    Token::Keyword(Keyword::Like)
                        | Token::Keyword(Keyword::In)
                        | Token::Keyword(Keyword::Between)
                ) =>
            {
                Some((4, true))
            }
            Token::Plus | Token::Minus => Some((5, false)),
            Token::Star | Token::Slash | Token::Percent => Some((6, false)),
            _ => None,
        }
    }

    fn parse_infix(&mut self, lhs: Expr, bp: u8, negated: bool) -> Result<Expr> {
        if negated {
            self.advance(); // NOT
        }
        let token = self.advance();
        let expr = match token {
            Token::Keyword(Keyword::Or) => self.binary(lhs, BinaryOp::Or, bp)?,
            Token::Keyword(Keyword::And) => self.binary(lhs, BinaryOp::And, bp)?,
            Token::Eq => self.binary(lhs, BinaryOp::Eq, bp)?,
            Token::NotEq => self.binary(lhs, BinaryOp::NotEq, bp)?,
            Token::Lt => self.binary(lhs, BinaryOp::Lt, bp)?,
            Token::LtEq => self.binary(lhs, BinaryOp::LtEq, bp)?,
            Token::Gt => self.binary(lhs, BinaryOp::Gt, bp)?,
            Token::GtEq => self.binary(lhs, BinaryOp::GtEq, bp)?,
            Token::Plus => self.binary(lhs, BinaryOp::Add, bp)?,
            Token::Minus => self.binary(lhs, BinaryOp::Sub, bp)?,
            Token::Star => self.binary(lhs, BinaryOp::Mul, bp)?,
            Token::Slash => self.binary(lhs, BinaryOp::Div, bp)?,
            Token::Percent => self.binary(lhs, BinaryOp::Mod, bp)?,
            Token::Keyword(Keyword::Is) => {
                let negated = self.test_keyword(Keyword::Not);
                self.expect_keyword(Keyword::Null)?;
                Expr::IsNull {
                    operand: Box::new(lhs),
                    negated,
                }
            }
            Token::Keyword(Keyword::Like) => {
                let pattern = self.parse_expr_bp(5)?;
                Expr::Like {
                    operand: Box::new(lhs),
                    pattern: Box::new(pattern),
                    negated,
                }
            }
            Token::Keyword(Keyword::Between) => {
                let low = self.parse_expr_bp(5)?;
                self.expect_keyword(Keyword::And)?;
                let high = self.parse_expr_bp(5)?;
                Expr::Between {
                    operand: Box::new(lhs),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                }
            }
            Token::Keyword(Keyword::In) => {
                self.expect_token(&Token::LParen)?;
                let mut list = Vec::new();
                if self.check_keyword(Keyword::Select) {
                    list.push(Expr::Subquery(Box::new(self.parse_select()?)));
                } else {
                    list.push(self.parse_expr()?);
                    while self.test_token(&Token::Comma) {
                        list.push(self.parse_expr()?);
                    }
                }
                self.expect_token(&Token::RParen)?;
                Expr::InList {
                    operand: Box::new(lhs),
                    list,
                    negated,
                }
            }
            other => return Err(self.error_here(&format!("unexpected '{}'", other))),
        };
        Ok(expr)
    }

    fn binary(&mut self, lhs: Expr, op: BinaryOp, bp: u8) -> Result<Expr> {
        let rhs = self.parse_expr_bp(bp + 1)?;
        Ok(Expr::Binary {
            op,
            left: Box::new(lhs),
            right: Box::new(rhs),
        })
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let span = self.span_here();
        match self.peek().clone() {
            Token::Int(i) => {
                self.advance();
                Ok(Expr::Literal(Value::Integer(i)))
            }
            Token::Real(r) => {
                self.advance();
                Ok(Expr::Literal(Value::Real(r)))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::Text(s)))
            }
            Token::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(true)))
            }
            Token::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(false)))
            }
            Token::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            Token::Keyword(Keyword::Not) => {
                self.advance();
                let operand = self.parse_expr_bp(4)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                self.advance();
                let operand = self.parse_expr_bp(7)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            Token::Plus => {
                self.advance();
                self.parse_expr_bp(7)
            }
            Token::Question => {
                self.advance();
                let index = self.next_param;
                self.next_param += 1;
                Ok(Expr::Parameter { index })
            }
            Token::LParen => {
                self.advance();
                if self.check_keyword(Keyword::Select) {
                    let select = self.parse_select()?;
                    self.expect_token(&Token::RParen)?;
                    Ok(Expr::Subquery(Box::new(select)))
                } else {
                    let expr = self.parse_expr()?;
                    self.expect_token(&Token::RParen)?;
                    Ok(expr)
                }
            }
            Token::Ident(name) => {
                self.advance();
                if self.test_token(&Token::LParen) {
                    return self.parse_function(name, span);
                }
                if self.check_token(&Token::Dot) {
                    if let Token::Ident(column) = self.peek_at(1).clone() {
                        self.advance();
                        self.advance();
                        return Ok(Expr::Column {
                            table: Some(name),
                            name: column,
                            span,
                        });
                    }
                }
                Ok(Expr::Column {
                    table: None,
                    name,
                    span,
                })
            }
            other => Err(self.error_here(&format!("unexpected '{}' in expression", other))),
        }
    }

    fn parse_function(&mut self, name: String, span: Span) -> Result<Expr> {
        let distinct = self.test_keyword(Keyword::Distinct);
        if self.test_token(&Token::Star) {
            self.expect_token(&Token::RParen)?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                star: true,
                distinct,
                span,
            });
        }
        let mut args = Vec::new();
        if !self.check_token(&Token::RParen) {
            args.push(self.parse_expr()?);
            while self.test_token(&Token::Comma) {
                args.push(self.parse_expr()?);
            }
        }
        self.expect_token(&Token::RParen)?;
        Ok(Expr::Function {
            name,
            args,
            star: false,
            distinct,
            span,
        })
    }

    // ---- token plumbing ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn span_here(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !matches!(token, Token::Eof) {
            self.pos += 1;
        }
        token
    }

    fn check_token(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.peek(), Token::Keyword(k) if *k == keyword)
    }

    fn test_token(&mut self, token: &Token) -> bool {
        if self.check_token(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn test_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_token(&mut self, token: &Token) -> Result<()> {
        if self.test_token(token) {
            Ok(())
        } else {
            Err(self.error_here(&format!("expected '{}', found '{}'", token, self.peek())))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<()> {
        if self.test_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_here(&format!(
                "expected {}, found '{}'",
                keyword.as_str(),
                self.peek()
            )))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(&format!("expected identifier, found '{}'", other))),
        }
    }

    fn expect_unsigned(&mut self) -> Result<u64> {
        match self.peek().clone() {
            Token::Int(i) if i >= 0 => {
                self.advance();
                Ok(i as u64)
            }
            other => Err(self.error_here(&format!(
                "expected a non-negative integer, found '{}'",
                other
            ))),
        }
    }

    fn error_here(&self, message: &str) -> DbError {
        let span = self.span_here();
        DbError::Syntax {
            message: message.to_string(),
            line: span.line,
            column: span.column,
        }
    }

    /// Skip to just past the next semicolon (or to end of input) so the
    /// next statement can be attempted.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                Token::Eof => return,
                Token::Semicolon => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }
}
