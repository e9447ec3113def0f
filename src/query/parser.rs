//! Recursive-descent parser from tokens to [`Statement`].

use super::ast::{
    BinaryOp, Clause, Expr, Literal, NodePattern, PatternPath, Projection, ProjectionItem,
    RelDirection, RelPattern, RemoveItem, SetItem, ShortestKind, Statement, UnaryOp,
};
use super::errors::QueryError;
use super::lexer::{tokenize, Tok, Token};

/// Parses one statement.
pub fn parse(input: &str) -> Result<Statement, QueryError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.statement()
}

const RESERVED: &[&str] = &[
    "MATCH", "OPTIONAL", "WHERE", "RETURN", "WITH", "CREATE", "MERGE", "SET", "REMOVE", "DELETE",
    "DETACH", "UNWIND", "CALL", "YIELD", "AS", "ORDER", "BY", "SKIP", "LIMIT", "ASC", "ASCENDING",
    "DESC", "DESCENDING", "AND", "OR", "XOR", "NOT", "IN", "STARTS", "ENDS", "CONTAINS", "IS",
    "NULL", "TRUE", "FALSE", "CASE", "WHEN", "THEN", "ELSE", "END", "DISTINCT", "ON", "EXPLAIN",
];

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(s) => format!("`{s}`"),
        Tok::Quoted(s) => format!("`{s}`"),
        Tok::Str(s) => format!("string '{s}'"),
        Tok::Int(i) => format!("integer {i}"),
        Tok::Float(f) => format!("float {f}"),
        Tok::Param(p) => format!("parameter ${p}"),
        Tok::Eof => "end of input".to_owned(),
        other => {
            let text = match other {
                Tok::LParen => "(",
                Tok::RParen => ")",
                Tok::LBracket => "[",
                Tok::RBracket => "]",
                Tok::LBrace => "{",
                Tok::RBrace => "}",
                Tok::Comma => ",",
                Tok::Dot => ".",
                Tok::DotDot => "..",
                Tok::Colon => ":",
                Tok::Semicolon => ";",
                Tok::Pipe => "|",
                Tok::Star => "*",
                Tok::Plus => "+",
                Tok::PlusEq => "+=",
                Tok::Minus => "-",
                Tok::Slash => "/",
                Tok::Percent => "%",
                Tok::Caret => "^",
                Tok::Eq => "=",
                Tok::Ne => "<>",
                Tok::Lt => "<",
                Tok::Le => "<=",
                Tok::Gt => ">",
                Tok::Ge => ">=",
                _ => "?",
            };
            format!("`{text}`")
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        QueryError::parse(message, token.line, token.column)
    }

    fn unexpected(&self, expected: &str) -> QueryError {
        self.error(format!(
            "expected {expected}, found {}",
            describe(self.peek())
        ))
    }

    fn is_kw_at(&self, offset: usize, kw: &str) -> bool {
        matches!(self.peek_at(offset), Tok::Ident(s) if s.eq_ignore_ascii_case(kw))
    }

    fn is_kw(&self, kw: &str) -> bool {
        self.is_kw_at(0, kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), QueryError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(kw))
        }
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), QueryError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected(&describe(tok)))
        }
    }

    /// Variable names: identifiers that are not reserved, or quoted.
    fn variable(&mut self) -> Result<String, QueryError> {
        match self.peek().clone() {
            Tok::Ident(name) if !is_reserved(&name) => {
                self.advance();
                Ok(name)
            }
            Tok::Quoted(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a variable name")),
        }
    }

    /// Labels, types, property keys: any identifier.
    fn symbolic_name(&mut self) -> Result<String, QueryError> {
        match self.peek().clone() {
            Tok::Ident(name) | Tok::Quoted(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn at_variable(&self) -> bool {
        match self.peek() {
            Tok::Ident(name) => !is_reserved(name),
            Tok::Quoted(_) => true,
            _ => false,
        }
    }

    fn statement(&mut self) -> Result<Statement, QueryError> {
        let explain = self.eat_kw("EXPLAIN");
        let mut clauses = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Semicolon => {
                    self.advance();
                    if *self.peek() != Tok::Eof {
                        return Err(self.error("only one statement per query is supported"));
                    }
                    break;
                }
                _ => clauses.push(self.clause()?),
            }
        }
        if clauses.is_empty() {
            return Err(self.error("empty query"));
        }
        Ok(Statement { explain, clauses })
    }

    fn clause(&mut self) -> Result<Clause, QueryError> {
        if self.is_kw("OPTIONAL") {
            self.advance();
            self.expect_kw("MATCH")?;
            return self.match_body(true);
        }
        if self.eat_kw("MATCH") {
            return self.match_body(false);
        }
        if self.eat_kw("UNWIND") {
            let expr = self.expr()?;
            self.expect_kw("AS")?;
            let alias = self.variable()?;
            return Ok(Clause::Unwind { expr, alias });
        }
        if self.eat_kw("WITH") {
            let mut projection = self.projection()?;
            if self.eat_kw("WHERE") {
                projection.predicate = Some(self.expr()?);
            }
            return Ok(Clause::With(projection));
        }
        if self.eat_kw("RETURN") {
            return Ok(Clause::Return(self.projection()?));
        }
        if self.eat_kw("CREATE") {
            return Ok(Clause::Create(self.patterns()?));
        }
        if self.eat_kw("MERGE") {
            return self.merge();
        }
        if self.eat_kw("SET") {
            return Ok(Clause::Set(self.set_items()?));
        }
        if self.eat_kw("REMOVE") {
            return Ok(Clause::Remove(self.remove_items()?));
        }
        if self.is_kw("DETACH") {
            self.advance();
            self.expect_kw("DELETE")?;
            return Ok(Clause::Delete {
                detach: true,
                exprs: self.expr_list()?,
            });
        }
        if self.eat_kw("DELETE") {
            return Ok(Clause::Delete {
                detach: false,
                exprs: self.expr_list()?,
            });
        }
        if self.eat_kw("CALL") {
            return self.call();
        }
        Err(self.unexpected("a clause (MATCH, CREATE, RETURN, ...)"))
    }

    fn match_body(&mut self, optional: bool) -> Result<Clause, QueryError> {
        let patterns = self.patterns()?;
        let predicate = if self.eat_kw("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Clause::Match {
            optional,
            patterns,
            predicate,
        })
    }

    fn merge(&mut self) -> Result<Clause, QueryError> {
        let pattern = self.pattern()?;
        let mut on_create = Vec::new();
        let mut on_match = Vec::new();
        while self.is_kw("ON") {
            self.advance();
            if self.eat_kw("CREATE") {
                self.expect_kw("SET")?;
                on_create.extend(self.set_items()?);
            } else if self.eat_kw("MATCH") {
                self.expect_kw("SET")?;
                on_match.extend(self.set_items()?);
            } else {
                return Err(self.unexpected("CREATE or MATCH"));
            }
        }
        Ok(Clause::Merge {
            pattern,
            on_create,
            on_match,
        })
    }

    fn call(&mut self) -> Result<Clause, QueryError> {
        let mut procedure = self.symbolic_name()?;
        while self.eat(&Tok::Dot) {
            procedure.push('.');
            procedure.push_str(&self.symbolic_name()?);
        }
        self.expect(&Tok::LParen)?;
        let args = if *self.peek() == Tok::RParen {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.expect(&Tok::RParen)?;
        let mut yields = None;
        let mut predicate = None;
        if self.eat_kw("YIELD") {
            if !self.eat(&Tok::Star) {
                let mut items = Vec::new();
                loop {
                    let name = self.symbolic_name()?;
                    let alias = if self.eat_kw("AS") {
                        self.variable()?
                    } else {
                        name.clone()
                    };
                    items.push((name, alias));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                yields = Some(items);
            }
            if self.eat_kw("WHERE") {
                predicate = Some(self.expr()?);
            }
        }
        Ok(Clause::Call {
            procedure,
            args,
            yields,
            predicate,
        })
    }

    fn projection(&mut self) -> Result<Projection, QueryError> {
        let mut projection = Projection {
            distinct: self.eat_kw("DISTINCT"),
            ..Projection::default()
        };
        if self.eat(&Tok::Star) {
            projection.star = true;
            if !self.eat(&Tok::Comma) {
                return self.projection_tail(projection);
            }
        }
        loop {
            let expr = self.expr()?;
            let alias = if self.eat_kw("AS") {
                self.variable()?
            } else {
                match &expr {
                    Expr::Var(name) => name.clone(),
                    other => other.to_string(),
                }
            };
            projection.items.push(ProjectionItem { expr, alias });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.projection_tail(projection)
    }

    fn projection_tail(&mut self, mut projection: Projection) -> Result<Projection, QueryError> {
        if self.is_kw("ORDER") {
            self.advance();
            self.expect_kw("BY")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_kw("DESC") || self.eat_kw("DESCENDING") {
                    true
                } else {
                    let _ = self.eat_kw("ASC") || self.eat_kw("ASCENDING");
                    false
                };
                projection.order_by.push((expr, descending));
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        if self.eat_kw("SKIP") {
            projection.skip = Some(self.expr()?);
        }
        if self.eat_kw("LIMIT") {
            projection.limit = Some(self.expr()?);
        }
        Ok(projection)
    }

    fn set_items(&mut self) -> Result<Vec<SetItem>, QueryError> {
        let mut items = Vec::new();
        loop {
            let var = self.variable()?;
            let item = match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let key = self.symbolic_name()?;
                    self.expect(&Tok::Eq)?;
                    SetItem::Property {
                        var,
                        key,
                        value: self.expr()?,
                    }
                }
                Tok::Eq => {
                    self.advance();
                    SetItem::Replace {
                        var,
                        value: self.expr()?,
                    }
                }
                Tok::PlusEq => {
                    self.advance();
                    SetItem::Merge {
                        var,
                        value: self.expr()?,
                    }
                }
                Tok::Colon => SetItem::Labels {
                    var,
                    labels: self.label_list()?,
                },
                _ => return Err(self.unexpected("`.`, `=`, `+=` or `:`")),
            };
            items.push(item);
            if !self.eat(&Tok::Comma) {
                return Ok(items);
            }
        }
    }

    fn remove_items(&mut self) -> Result<Vec<RemoveItem>, QueryError> {
        let mut items = Vec::new();
        loop {
            let var = self.variable()?;
            let item = match self.peek() {
                Tok::Dot => {
                    self.advance();
                    RemoveItem::Property {
                        var,
                        key: self.symbolic_name()?,
                    }
                }
                Tok::Colon => RemoveItem::Labels {
                    var,
                    labels: self.label_list()?,
                },
                _ => return Err(self.unexpected("`.` or `:`")),
            };
            items.push(item);
            if !self.eat(&Tok::Comma) {
                return Ok(items);
            }
        }
    }

    fn label_list(&mut self) -> Result<Vec<String>, QueryError> {
        let mut labels = Vec::new();
        while self.eat(&Tok::Colon) {
            labels.push(self.symbolic_name()?);
        }
        Ok(labels)
    }

    fn patterns(&mut self) -> Result<Vec<PatternPath>, QueryError> {
        let mut patterns = vec![self.pattern()?];
        while self.eat(&Tok::Comma) {
            patterns.push(self.pattern()?);
        }
        Ok(patterns)
    }

    fn pattern(&mut self) -> Result<PatternPath, QueryError> {
        let var = if self.at_variable() && *self.peek_at(1) == Tok::Eq {
            let name = self.variable()?;
            self.advance();
            Some(name)
        } else {
            None
        };
        let shortest = if self.is_kw("shortestPath") {
            Some(ShortestKind::Single)
        } else if self.is_kw("allShortestPaths") {
            Some(ShortestKind::All)
        } else {
            None
        };
        if shortest.is_some() {
            self.advance();
            self.expect(&Tok::LParen)?;
        }
        let start = self.node_pattern()?;
        let mut steps = Vec::new();
        while matches!(self.peek(), Tok::Minus | Tok::Lt) {
            let rel = self.rel_pattern()?;
            let node = self.node_pattern()?;
            steps.push((rel, node));
        }
        if shortest.is_some() {
            self.expect(&Tok::RParen)?;
            if steps.len() != 1 {
                return Err(self.error("shortestPath requires a pattern with exactly one relationship"));
            }
        }
        Ok(PatternPath {
            var,
            shortest,
            start,
            steps,
        })
    }

    fn node_pattern(&mut self) -> Result<NodePattern, QueryError> {
        self.expect(&Tok::LParen)?;
        let var = if self.at_variable() {
            Some(self.variable()?)
        } else {
            None
        };
        let labels = self.label_list()?;
        let props = self.inline_props()?;
        self.expect(&Tok::RParen)?;
        Ok(NodePattern { var, labels, props })
    }

    fn inline_props(&mut self) -> Result<Option<Expr>, QueryError> {
        match self.peek().clone() {
            Tok::LBrace => Ok(Some(self.map_literal()?)),
            Tok::Param(name) => {
                self.advance();
                Ok(Some(Expr::Param(name)))
            }
            _ => Ok(None),
        }
    }

    fn rel_pattern(&mut self) -> Result<RelPattern, QueryError> {
        let left = self.eat(&Tok::Lt);
        self.expect(&Tok::Minus)?;
        let mut rel = RelPattern {
            var: None,
            types: Vec::new(),
            direction: RelDirection::Either,
            props: None,
            length: None,
        };
        if self.eat(&Tok::LBracket) {
            if self.at_variable() {
                rel.var = Some(self.variable()?);
            }
            if self.eat(&Tok::Colon) {
                rel.types.push(self.symbolic_name()?);
                while self.eat(&Tok::Pipe) {
                    let _ = self.eat(&Tok::Colon);
                    rel.types.push(self.symbolic_name()?);
                }
            }
            if self.eat(&Tok::Star) {
                rel.length = Some(self.hop_range()?);
            }
            rel.props = self.inline_props()?;
            self.expect(&Tok::RBracket)?;
        }
        self.expect(&Tok::Minus)?;
        let right = self.eat(&Tok::Gt);
        rel.direction = match (left, right) {
            (true, false) => RelDirection::Left,
            (false, true) => RelDirection::Right,
            (false, false) => RelDirection::Either,
            (true, true) => return Err(self.error("a relationship cannot point both ways")),
        };
        Ok(rel)
    }

    fn hop_bound(&mut self) -> Result<Option<u32>, QueryError> {
        match self.peek().clone() {
            Tok::Int(n) => {
                self.advance();
                u32::try_from(n)
                    .map(Some)
                    .map_err(|_| self.error(format!("invalid hop count {n}")))
            }
            _ => Ok(None),
        }
    }

    fn hop_range(&mut self) -> Result<(Option<u32>, Option<u32>), QueryError> {
        let min = self.hop_bound()?;
        if self.eat(&Tok::DotDot) {
            let max = self.hop_bound()?;
            return Ok((min, max));
        }
        // `*n` means exactly n hops.
        Ok((min, min))
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, QueryError> {
        let mut exprs = vec![self.expr()?];
        while self.eat(&Tok::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    pub(crate) fn expr(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.xor_expr()?;
        while self.eat_kw("OR") {
            let rhs = self.xor_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn xor_expr(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.and_expr()?;
        while self.eat_kw("XOR") {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Xor, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.not_expr()?;
        while self.eat_kw("AND") {
            let rhs = self.not_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, QueryError> {
        if self.eat_kw("NOT") {
            let inner = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    /// `a < b <= c` reads as `a < b AND b <= c`.
    fn comparison(&mut self) -> Result<Expr, QueryError> {
        let first = self.predicate()?;
        let mut terms: Vec<Expr> = Vec::new();
        let mut lhs = first;
        loop {
            let op = match self.peek() {
                Tok::Eq => BinaryOp::Eq,
                Tok::Ne => BinaryOp::Ne,
                Tok::Lt => BinaryOp::Lt,
                Tok::Le => BinaryOp::Le,
                Tok::Gt => BinaryOp::Gt,
                Tok::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.predicate()?;
            terms.push(Expr::Binary(op, Box::new(lhs), Box::new(rhs.clone())));
            lhs = rhs;
        }
        let mut terms = terms.into_iter();
        match terms.next() {
            None => Ok(lhs),
            Some(first) => Ok(terms.fold(first, |acc, term| {
                Expr::Binary(BinaryOp::And, Box::new(acc), Box::new(term))
            })),
        }
    }

    fn predicate(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.additive()?;
        loop {
            if self.eat_kw("IN") {
                let rhs = self.additive()?;
                lhs = Expr::Binary(BinaryOp::In, Box::new(lhs), Box::new(rhs));
            } else if self.is_kw("STARTS") && self.is_kw_at(1, "WITH") {
                self.pos += 2;
                let rhs = self.additive()?;
                lhs = Expr::Binary(BinaryOp::StartsWith, Box::new(lhs), Box::new(rhs));
            } else if self.is_kw("ENDS") && self.is_kw_at(1, "WITH") {
                self.pos += 2;
                let rhs = self.additive()?;
                lhs = Expr::Binary(BinaryOp::EndsWith, Box::new(lhs), Box::new(rhs));
            } else if self.eat_kw("CONTAINS") {
                let rhs = self.additive()?;
                lhs = Expr::Binary(BinaryOp::Contains, Box::new(lhs), Box::new(rhs));
            } else if self.eat_kw("IS") {
                let negated = self.eat_kw("NOT");
                self.expect_kw("NULL")?;
                lhs = Expr::IsNull(Box::new(lhs), negated);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn additive(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn power(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.unary()?;
        while self.eat(&Tok::Caret) {
            let rhs = self.unary()?;
            lhs = Expr::Binary(BinaryOp::Pow, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, QueryError> {
        if self.eat(&Tok::Minus) {
            return Ok(match self.unary()? {
                Expr::Literal(Literal::Int(i)) => Expr::Literal(Literal::Int(-i)),
                Expr::Literal(Literal::Float(f)) => Expr::Literal(Literal::Float(-f)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        if self.eat(&Tok::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, QueryError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let key = self.symbolic_name()?;
                    expr = Expr::Property(Box::new(expr), key);
                }
                Tok::LBracket => {
                    self.advance();
                    if self.eat(&Tok::DotDot) {
                        let to = self.optional_slice_bound()?;
                        self.expect(&Tok::RBracket)?;
                        expr = Expr::Slice(Box::new(expr), None, to);
                        continue;
                    }
                    let index = self.expr()?;
                    if self.eat(&Tok::DotDot) {
                        let to = self.optional_slice_bound()?;
                        self.expect(&Tok::RBracket)?;
                        expr = Expr::Slice(Box::new(expr), Some(Box::new(index)), to);
                    } else {
                        self.expect(&Tok::RBracket)?;
                        expr = Expr::Index(Box::new(expr), Box::new(index));
                    }
                }
                Tok::Colon => {
                    let labels = self.label_list()?;
                    expr = Expr::HasLabels(Box::new(expr), labels);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn optional_slice_bound(&mut self) -> Result<Option<Box<Expr>>, QueryError> {
        if *self.peek() == Tok::RBracket {
            Ok(None)
        } else {
            Ok(Some(Box::new(self.expr()?)))
        }
    }

    fn map_literal(&mut self) -> Result<Expr, QueryError> {
        self.expect(&Tok::LBrace)?;
        let mut entries = Vec::new();
        if !self.eat(&Tok::RBrace) {
            loop {
                let key = match self.peek().clone() {
                    Tok::Str(s) => {
                        self.advance();
                        s
                    }
                    _ => self.symbolic_name()?,
                };
                self.expect(&Tok::Colon)?;
                entries.push((key, self.expr()?));
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::RBrace)?;
        }
        Ok(Expr::Map(entries))
    }

    fn atom(&mut self) -> Result<Expr, QueryError> {
        match self.peek().clone() {
            Tok::Int(i) => {
                self.advance();
                Ok(Expr::Literal(Literal::Int(i)))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(f)))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::String(s)))
            }
            Tok::Param(name) => {
                self.advance();
                Ok(Expr::Param(name))
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    items = self.expr_list()?;
                    self.expect(&Tok::RBracket)?;
                }
                Ok(Expr::List(items))
            }
            Tok::LBrace => self.map_literal(),
            Tok::Quoted(name) => {
                self.advance();
                Ok(Expr::Var(name))
            }
            Tok::Ident(word) => self.word(word),
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn word(&mut self, word: String) -> Result<Expr, QueryError> {
        let upper = word.to_ascii_uppercase();
        match upper.as_str() {
            "TRUE" => {
                self.advance();
                return Ok(Expr::Literal(Literal::Bool(true)));
            }
            "FALSE" => {
                self.advance();
                return Ok(Expr::Literal(Literal::Bool(false)));
            }
            "NULL" => {
                self.advance();
                return Ok(Expr::Literal(Literal::Null));
            }
            "CASE" => {
                self.advance();
                return self.case();
            }
            _ => {}
        }
        if *self.peek_at(1) == Tok::LParen {
            self.advance();
            self.advance();
            return self.call_args(word);
        }
        if is_reserved(&word) {
            return Err(self.unexpected("an expression"));
        }
        self.advance();
        Ok(Expr::Var(word))
    }

    fn call_args(&mut self, name: String) -> Result<Expr, QueryError> {
        if name.eq_ignore_ascii_case("count") && *self.peek() == Tok::Star {
            self.advance();
            self.expect(&Tok::RParen)?;
            return Ok(Expr::CountStar);
        }
        let distinct = self.eat_kw("DISTINCT");
        let args = if *self.peek() == Tok::RParen {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.expect(&Tok::RParen)?;
        Ok(Expr::Call {
            name,
            distinct,
            args,
        })
    }

    fn case(&mut self) -> Result<Expr, QueryError> {
        let operand = if self.is_kw("WHEN") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let mut branches = Vec::new();
        while self.eat_kw("WHEN") {
            let when = self.expr()?;
            self.expect_kw("THEN")?;
            let then = self.expr()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.unexpected("WHEN"));
        }
        let default = if self.eat_kw("ELSE") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_kw("END")?;
        Ok(Expr::Case {
            operand,
            branches,
            default,
        })
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}
