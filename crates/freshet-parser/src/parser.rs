//! Recursive descent parser for FQL
//!
//! A hand-written recursive descent parser over the token stream. Keywords
//! are matched case-insensitively against identifier tokens, which keeps
//! keywords usable as node names.

use crate::error::{ParseError, ParseResult};
use crate::lexer::{tokenize, SpannedToken, Token};
use freshet_core::ast::*;
use freshet_core::path::{Path, Segment};
use freshet_core::Span;

/// Parses a single statement, returning it together with the unconsumed
/// remainder of the input. Trailing whitespace, comments and the statement's
/// semicolon are consumed as part of the statement.
pub fn parse(source: &str) -> ParseResult<(Stmt, &str)> {
    let mut parser = Parser::new(source);
    let stmt = parser.parse_statement()?;
    parser.match_token(&Token::Semicolon);
    Ok((stmt, parser.remaining()))
}

/// Parses every statement in the input, consuming semicolons between them.
pub fn parse_all(source: &str) -> ParseResult<Vec<Stmt>> {
    let mut parser = Parser::new(source);
    let mut statements = Vec::new();
    loop {
        while parser.match_token(&Token::Semicolon) {}
        if parser.is_at_end() {
            break;
        }
        statements.push(parser.parse_statement()?);
        if !parser.match_token(&Token::Semicolon) && !parser.is_at_end() {
            return Err(parser.err_here("expected ';' between statements"));
        }
    }
    Ok(statements)
}

struct Parser<'source> {
    source: &'source str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'source> Parser<'source> {
    fn new(source: &'source str) -> Self {
        Self {
            source,
            tokens: tokenize(source),
            pos: 0,
        }
    }

    fn current(&self) -> &SpannedToken {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self, ahead: usize) -> &Token {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn advance(&mut self) -> SpannedToken {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current().token, Token::Eof)
    }

    fn remaining(&self) -> &'source str {
        &self.source[self.current().start.min(self.source.len())..]
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(&self.current().token) == std::mem::discriminant(token)
    }

    fn check_kw(&self, kw: &str) -> bool {
        self.current().token.is_kw(kw)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, token: &Token, expected: &str) -> ParseResult<SpannedToken> {
        if self.check(token) {
            Ok(self.advance())
        } else {
            Err(self.err_here(format!(
                "expected {}, found '{}'",
                expected,
                self.current().token
            )))
        }
    }

    fn consume_kw(&mut self, kw: &str) -> ParseResult<()> {
        if self.match_kw(kw) {
            Ok(())
        } else {
            Err(self.err_here(format!(
                "expected {}, found '{}'",
                kw.to_uppercase(),
                self.current().token
            )))
        }
    }

    fn parse_identifier(&mut self) -> ParseResult<String> {
        match &self.current().token {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.err_here(format!("expected identifier, found '{}'", other))),
        }
    }

    fn parse_integer(&mut self) -> ParseResult<i64> {
        match self.current().token {
            Token::Integer(n) => {
                self.advance();
                Ok(n)
            }
            ref other => Err(self.err_here(format!("expected integer, found '{}'", other))),
        }
    }

    fn err_here(&self, message: impl Into<String>) -> ParseError {
        let tok = self.current();
        ParseError::new(self.source, Span::new(tok.start, tok.end), message)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        if self.check_kw("create") {
            return self.parse_create();
        }
        if self.match_kw("insert") {
            self.consume_kw("into")?;
            let sink = self.parse_identifier()?;
            self.consume_kw("from")?;
            let stream = self.parse_identifier()?;
            return Ok(Stmt::InsertInto { sink, stream });
        }
        if self.match_kw("pause") {
            self.consume_kw("source")?;
            return Ok(Stmt::PauseSource(self.parse_identifier()?));
        }
        if self.match_kw("resume") {
            self.consume_kw("source")?;
            return Ok(Stmt::ResumeSource(self.parse_identifier()?));
        }
        if self.match_kw("rewind") {
            self.consume_kw("source")?;
            return Ok(Stmt::RewindSource(self.parse_identifier()?));
        }
        if self.match_kw("drop") {
            let kind = if self.match_kw("source") {
                DropTarget::Source
            } else if self.match_kw("stream") {
                DropTarget::Stream
            } else if self.match_kw("sink") {
                DropTarget::Sink
            } else if self.match_kw("state") {
                DropTarget::State
            } else {
                return Err(self.err_here("expected SOURCE, STREAM, SINK or STATE after DROP"));
            };
            return Ok(Stmt::Drop {
                kind,
                name: self.parse_identifier()?,
            });
        }
        if self.match_kw("update") {
            let kind = if self.match_kw("source") {
                UpdateTarget::Source
            } else if self.match_kw("sink") {
                UpdateTarget::Sink
            } else if self.match_kw("state") {
                UpdateTarget::State
            } else {
                return Err(self.err_here("expected SOURCE, SINK or STATE after UPDATE"));
            };
            let name = self.parse_identifier()?;
            self.consume_kw("set")?;
            let params = self.parse_params()?;
            return Ok(Stmt::UpdateNode { kind, name, params });
        }
        if self.match_kw("load") {
            return self.parse_load_state();
        }
        if self.match_kw("save") {
            self.consume_kw("state")?;
            let name = self.parse_identifier()?;
            let tag = if self.match_kw("tag") {
                Some(self.parse_identifier()?)
            } else {
                None
            };
            return Ok(Stmt::SaveState { name, tag });
        }
        if self.check_kw("select") {
            return Ok(Stmt::Select(self.parse_select_union()?));
        }
        if self.match_kw("eval") {
            let expr = self.parse_expr()?;
            let input = if self.match_kw("on") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            return Ok(Stmt::Eval { expr, input });
        }
        Err(self.err_here(format!(
            "expected a statement, found '{}'",
            self.current().token
        )))
    }

    fn parse_create(&mut self) -> ParseResult<Stmt> {
        self.consume_kw("create")?;
        let paused = self.match_kw("paused");
        if self.match_kw("source") {
            let name = self.parse_identifier()?;
            self.consume_kw("type")?;
            let source_type = self.parse_identifier()?;
            let params = self.parse_with_params()?;
            return Ok(Stmt::CreateSource {
                paused,
                name,
                source_type,
                params,
            });
        }
        if paused {
            return Err(self.err_here("PAUSED is only valid for CREATE SOURCE"));
        }
        if self.match_kw("sink") {
            let name = self.parse_identifier()?;
            self.consume_kw("type")?;
            let sink_type = self.parse_identifier()?;
            let params = self.parse_with_params()?;
            return Ok(Stmt::CreateSink {
                name,
                sink_type,
                params,
            });
        }
        if self.match_kw("state") {
            let name = self.parse_identifier()?;
            self.consume_kw("type")?;
            let state_type = self.parse_identifier()?;
            let params = self.parse_with_params()?;
            return Ok(Stmt::CreateState {
                name,
                state_type,
                params,
            });
        }
        if self.match_kw("stream") {
            let name = self.parse_identifier()?;
            self.consume_kw("as")?;
            let select = self.parse_select_union()?;
            return Ok(Stmt::CreateStream { name, select });
        }
        Err(self.err_here("expected SOURCE, SINK, STREAM or STATE after CREATE"))
    }

    fn parse_load_state(&mut self) -> ParseResult<Stmt> {
        self.consume_kw("state")?;
        let name = self.parse_identifier()?;
        self.consume_kw("type")?;
        let state_type = self.parse_identifier()?;
        let tag = if self.match_kw("tag") {
            Some(self.parse_identifier()?)
        } else {
            None
        };
        let params = if self.match_kw("set") {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let create_if_not_saved = if self.match_kw("or") {
            self.consume_kw("create")?;
            self.consume_kw("if")?;
            self.consume_kw("not")?;
            self.consume_kw("saved")?;
            Some(self.parse_with_params()?)
        } else {
            None
        };
        Ok(Stmt::LoadState {
            name,
            state_type,
            tag,
            params,
            create_if_not_saved,
        })
    }

    /// `WITH k=v, ...` - empty when WITH is absent.
    fn parse_with_params(&mut self) -> ParseResult<Vec<(String, Expr)>> {
        if self.match_kw("with") {
            self.parse_params()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_params(&mut self) -> ParseResult<Vec<(String, Expr)>> {
        let mut params = Vec::new();
        loop {
            let key = self.parse_identifier()?;
            self.consume(&Token::Eq, "'='")?;
            let value = self.parse_expr()?;
            params.push((key, value));
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        Ok(params)
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    fn parse_select_union(&mut self) -> ParseResult<SelectUnion> {
        let mut selects = vec![self.parse_select()?];
        while self.check_kw("union") {
            self.advance();
            self.consume_kw("all")?;
            selects.push(self.parse_select()?);
        }
        Ok(SelectUnion { selects })
    }

    fn parse_select(&mut self) -> ParseResult<Select> {
        self.consume_kw("select")?;
        let emitter = self.parse_emitter()?;
        let projections = self.parse_projections()?;
        self.consume_kw("from")?;
        let from = self.parse_relations()?;
        let filter = if self.match_kw("where") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let group_by = if self.match_kw("group") {
            self.consume_kw("by")?;
            let mut exprs = vec![self.parse_expr()?];
            while self.match_token(&Token::Comma) {
                exprs.push(self.parse_expr()?);
            }
            exprs
        } else {
            Vec::new()
        };
        let having = if self.match_kw("having") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Select {
            emitter,
            projections,
            from,
            filter,
            group_by,
            having,
        })
    }

    fn parse_emitter(&mut self) -> ParseResult<Emitter> {
        let mode = if self.match_kw("istream") {
            EmitterMode::Istream
        } else if self.match_kw("dstream") {
            EmitterMode::Dstream
        } else if self.match_kw("rstream") {
            EmitterMode::Rstream
        } else {
            return Err(self.err_here("expected ISTREAM, DSTREAM or RSTREAM"));
        };

        // `[LIMIT ..]` after the emitter; the lookahead keeps array-literal
        // projections unambiguous.
        let mut samplers = Vec::new();
        if self.check(&Token::LBracket)
            && (self.peek(1).is_kw("limit")
                || self.peek(1).is_kw("every")
                || self.peek(1).is_kw("sample"))
        {
            self.advance();
            loop {
                samplers.push(self.parse_sampler()?);
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
            self.consume(&Token::RBracket, "']'")?;
        }
        Ok(Emitter { mode, samplers })
    }

    fn parse_sampler(&mut self) -> ParseResult<Sampler> {
        if self.match_kw("limit") {
            return Ok(Sampler::Limit(self.parse_integer()?));
        }
        if self.match_kw("sample") {
            let p = match self.advance().token {
                Token::Integer(n) => n as f64,
                Token::Float(f) => f,
                other => {
                    return Err(self.err_here(format!(
                        "expected a percentage after SAMPLE, found '{}'",
                        other
                    )))
                }
            };
            self.consume(&Token::Percent, "'%'")?;
            return Ok(Sampler::SamplePercent(p));
        }
        if self.match_kw("every") {
            if let Token::Ordinal(k) = self.current().token {
                self.advance();
                self.consume_kw("tuple")?;
                return Ok(Sampler::EveryKth(k));
            }
            let n = self.parse_integer()?;
            if self.match_kw("seconds") {
                return Ok(Sampler::EveryInterval { millis: n * 1000 });
            }
            self.consume_kw("milliseconds")?;
            return Ok(Sampler::EveryInterval { millis: n });
        }
        Err(self.err_here("expected LIMIT, EVERY or SAMPLE"))
    }

    fn parse_projections(&mut self) -> ParseResult<Vec<Projection>> {
        let mut projections = Vec::new();
        loop {
            projections.push(self.parse_projection()?);
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        Ok(projections)
    }

    fn parse_projection(&mut self) -> ParseResult<Projection> {
        if self.match_token(&Token::Star) {
            return Ok(Projection::Wildcard { relation: None });
        }
        // `rel:*`
        if matches!(self.current().token, Token::Ident(_))
            && *self.peek(1) == Token::Colon
            && *self.peek(2) == Token::Star
        {
            let relation = self.parse_identifier()?;
            self.advance(); // ':'
            self.advance(); // '*'
            return Ok(Projection::Wildcard {
                relation: Some(relation),
            });
        }
        let expr = self.parse_expr()?;
        let alias = if self.match_kw("as") {
            Some(self.parse_identifier()?)
        } else {
            None
        };
        Ok(Projection::Expr { expr, alias })
    }

    fn parse_relations(&mut self) -> ParseResult<Vec<Relation>> {
        let mut relations = Vec::new();
        loop {
            relations.push(self.parse_relation()?);
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        Ok(relations)
    }

    fn parse_relation(&mut self) -> ParseResult<Relation> {
        let name = self.parse_identifier()?;
        let source = if self.match_token(&Token::LParen) {
            let mut args = Vec::new();
            if !self.check(&Token::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    if !self.match_token(&Token::Comma) {
                        break;
                    }
                }
            }
            self.consume(&Token::RParen, "')'")?;
            RelationSource::Udsf { name, args }
        } else {
            RelationSource::Stream(name)
        };
        let window = self.parse_window()?;
        let alias = if self.match_kw("as") {
            Some(self.parse_identifier()?)
        } else {
            None
        };
        Ok(Relation {
            source,
            alias,
            window,
        })
    }

    fn parse_window(&mut self) -> ParseResult<WindowSpec> {
        self.consume(&Token::LBracket, "window specification '[RANGE ..]'")?;
        self.consume_kw("range")?;
        let range = self.parse_integer()?;
        let unit = if self.match_kw("tuples") {
            WindowUnit::Tuples
        } else if self.match_kw("seconds") {
            WindowUnit::Seconds
        } else if self.match_kw("milliseconds") {
            WindowUnit::Milliseconds
        } else {
            return Err(self.err_here("expected TUPLES, SECONDS or MILLISECONDS"));
        };

        let mut capacity = None;
        let mut shedding = Shedding::Wait;
        while self.match_token(&Token::Comma) {
            if self.match_kw("buffer") {
                self.consume_kw("size")?;
                capacity = Some(self.parse_integer()?);
            } else if self.match_kw("wait") {
                self.consume_kw("if")?;
                self.consume_kw("full")?;
                shedding = Shedding::Wait;
            } else if self.match_kw("drop") {
                shedding = if self.match_kw("oldest") {
                    Shedding::DropOldest
                } else if self.match_kw("newest") {
                    Shedding::DropNewest
                } else {
                    return Err(self.err_here("expected OLDEST or NEWEST after DROP"));
                };
                self.consume_kw("if")?;
                self.consume_kw("full")?;
            } else {
                return Err(self.err_here("expected BUFFER SIZE, WAIT or DROP in window"));
            }
        }
        self.consume(&Token::RBracket, "']'")?;
        Ok(WindowSpec {
            range,
            unit,
            capacity,
            shedding,
        })
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.match_kw("or") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.match_kw("and") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.match_kw("not") {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_concat()?;
        let op = match self.current().token {
            Token::Eq => BinOp::Eq,
            Token::NotEq => BinOp::NotEq,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_concat()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_concat(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_is()?;
        while self.match_token(&Token::Concat) {
            let right = self.parse_is()?;
            left = Expr::Binary {
                op: BinOp::Concat,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_is(&mut self) -> ParseResult<Expr> {
        let expr = self.parse_additive()?;
        if self.match_kw("is") {
            let negated = self.match_kw("not");
            let missing = if self.match_kw("null") {
                false
            } else if self.match_kw("missing") {
                true
            } else {
                return Err(self.err_here("expected NULL or MISSING after IS"));
            };
            return Ok(Expr::IsCheck {
                expr: Box::new(expr),
                negated,
                missing,
            });
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current().token {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current().token {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.match_token(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.current().token.clone() {
            Token::Integer(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            Token::Float(f) => {
                self.advance();
                Ok(Expr::Float(f))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.consume(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.match_token(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&Token::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                if !self.check(&Token::RBrace) {
                    loop {
                        let key = match self.advance().token {
                            Token::String(s) => s,
                            Token::Ident(s) => s,
                            other => {
                                return Err(self.err_here(format!(
                                    "expected map key, found '{}'",
                                    other
                                )))
                            }
                        };
                        self.consume(&Token::Colon, "':'")?;
                        entries.push((key, self.parse_expr()?));
                        if !self.match_token(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&Token::RBrace, "'}'")?;
                Ok(Expr::Map(entries))
            }
            Token::Ident(_) => self.parse_ident_expr(),
            ref other => Err(self.err_here(format!("expected expression, found '{}'", other))),
        }
    }

    fn parse_ident_expr(&mut self) -> ParseResult<Expr> {
        if self.match_kw("true") {
            return Ok(Expr::Bool(true));
        }
        if self.match_kw("false") {
            return Ok(Expr::Bool(false));
        }
        if self.match_kw("null") {
            return Ok(Expr::Null);
        }
        if self.check_kw("case") {
            return self.parse_case();
        }
        if self.check_kw("cast") && *self.peek(1) == Token::LParen {
            return self.parse_cast();
        }

        let name = self.parse_identifier()?;

        // Function call
        if self.match_token(&Token::LParen) {
            let mut args = Vec::new();
            if !self.check(&Token::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    if !self.match_token(&Token::Comma) {
                        break;
                    }
                }
            }
            self.consume(&Token::RParen, "')'")?;
            return Ok(Expr::FuncCall { name, args });
        }

        // Qualified row reference `rel:col...`
        if self.match_token(&Token::Colon) {
            let column = self.parse_identifier()?;
            let mut segments = vec![Segment::Field(column)];
            self.parse_path_continuation(&mut segments)?;
            return Ok(Expr::RowValue {
                relation: name,
                path: Path::new(segments),
            });
        }

        // Unqualified row reference `col...`
        let mut segments = vec![Segment::Field(name)];
        self.parse_path_continuation(&mut segments)?;
        Ok(Expr::RowValue {
            relation: String::new(),
            path: Path::new(segments),
        })
    }

    fn parse_path_continuation(&mut self, segments: &mut Vec<Segment>) -> ParseResult<()> {
        loop {
            if self.match_token(&Token::Dot) {
                segments.push(Segment::Field(self.parse_identifier()?));
            } else if self.match_token(&Token::DotDot) {
                let key = match self.advance().token {
                    Token::Ident(s) | Token::String(s) => s,
                    other => {
                        return Err(
                            self.err_here(format!("expected key after '..', found '{}'", other))
                        )
                    }
                };
                segments.push(Segment::Recursive(key));
            } else if self.match_token(&Token::LBracket) {
                segments.push(self.parse_path_bracket()?);
            } else {
                return Ok(());
            }
        }
    }

    fn parse_path_bracket(&mut self) -> ParseResult<Segment> {
        if let Token::String(key) = self.current().token.clone() {
            self.advance();
            self.consume(&Token::RBracket, "']'")?;
            return Ok(Segment::Field(key));
        }
        if self.match_token(&Token::Colon) {
            let end = self.parse_path_bound()?;
            self.consume(&Token::RBracket, "']'")?;
            return Ok(Segment::Slice(None, end));
        }
        let first = self.parse_signed_integer()?;
        if self.match_token(&Token::Colon) {
            let end = self.parse_path_bound()?;
            self.consume(&Token::RBracket, "']'")?;
            return Ok(Segment::Slice(Some(first), end));
        }
        self.consume(&Token::RBracket, "']'")?;
        Ok(Segment::Index(first))
    }

    fn parse_path_bound(&mut self) -> ParseResult<Option<i64>> {
        if self.check(&Token::RBracket) {
            Ok(None)
        } else {
            Ok(Some(self.parse_signed_integer()?))
        }
    }

    fn parse_signed_integer(&mut self) -> ParseResult<i64> {
        let negative = self.match_token(&Token::Minus);
        let n = self.parse_integer()?;
        Ok(if negative { -n } else { n })
    }

    fn parse_case(&mut self) -> ParseResult<Expr> {
        self.consume_kw("case")?;
        let operand = if self.check_kw("when") {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let mut whens = Vec::new();
        while self.match_kw("when") {
            let when = self.parse_expr()?;
            self.consume_kw("then")?;
            let then = self.parse_expr()?;
            whens.push((when, then));
        }
        if whens.is_empty() {
            return Err(self.err_here("CASE requires at least one WHEN clause"));
        }
        let else_branch = if self.match_kw("else") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.consume_kw("end")?;
        Ok(Expr::Case {
            operand,
            whens,
            else_branch,
        })
    }

    fn parse_cast(&mut self) -> ParseResult<Expr> {
        self.consume_kw("cast")?;
        self.consume(&Token::LParen, "'('")?;
        let expr = self.parse_expr()?;
        self.consume_kw("as")?;
        let target = if self.match_kw("bool") {
            CastType::Bool
        } else if self.match_kw("int") {
            CastType::Int
        } else if self.match_kw("float") {
            CastType::Float
        } else if self.match_kw("string") {
            CastType::Str
        } else if self.match_kw("blob") {
            CastType::Blob
        } else if self.match_kw("timestamp") {
            CastType::Timestamp
        } else {
            return Err(self.err_here("expected a type name after AS"));
        };
        self.consume(&Token::RParen, "')'")?;
        Ok(Expr::Cast {
            expr: Box::new(expr),
            target,
        })
    }
}
