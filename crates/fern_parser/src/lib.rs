use std::fmt;
use std::sync::Arc;

use fern_syntax::{
    BinaryOp, CallArg, Diagnostic, Expr, ExprKind, Field, FieldInit, FnBody, FnClause,
    FunctionDef, ImplDef, InterpPart, MapEntry, MatchArm, Param, Pattern, PatternKind, Program,
    ReceiveAfter, SourceLoc, Stmt, StmtKind, TraitDef, TraitMethod, TypeDef, TypeDefBody,
    TypeExpr, TypeExprKind, TypedFn, UnaryOp, Variant, WithBinding,
};

pub mod lexer;

pub use lexer::{tokenize, Lexer, LexerState};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    After,
    And,
    As,
    Break,
    Continue,
    Defer,
    Derive,
    Do,
    Else,
    False,
    Fn,
    For,
    If,
    Impl,
    Import,
    In,
    Let,
    Loop,
    Match,
    Module,
    Newtype,
    Not,
    Or,
    Pub,
    Receive,
    Return,
    Send,
    Spawn,
    Trait,
    True,
    Type,
    Where,
    While,
    With,
    // Literals
    Ident(String),
    Int(i64),
    Float(f64),
    String(String),
    StringBegin(String),
    StringMid(String),
    StringEnd(String),
    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    DotDot,
    DotDotEqual,
    Ellipsis,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Equals,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Arrow,
    FatArrow,
    Bind,
    PipeGreater,
    Bar,
    Underscore,
    At,
    Question,
    // Layout
    Indent,
    Dedent,
    Newline,
    Error(String),
    Eof,
}

impl TokenKind {
    pub fn is_layout(&self) -> bool {
        matches!(self, TokenKind::Indent | TokenKind::Dedent | TokenKind::Newline)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Keywords
            TokenKind::After => write!(f, "`after`"),
            TokenKind::And => write!(f, "`and`"),
            TokenKind::As => write!(f, "`as`"),
            TokenKind::Break => write!(f, "`break`"),
            TokenKind::Continue => write!(f, "`continue`"),
            TokenKind::Defer => write!(f, "`defer`"),
            TokenKind::Derive => write!(f, "`derive`"),
            TokenKind::Do => write!(f, "`do`"),
            TokenKind::Else => write!(f, "`else`"),
            TokenKind::False => write!(f, "`false`"),
            TokenKind::Fn => write!(f, "`fn`"),
            TokenKind::For => write!(f, "`for`"),
            TokenKind::If => write!(f, "`if`"),
            TokenKind::Impl => write!(f, "`impl`"),
            TokenKind::Import => write!(f, "`import`"),
            TokenKind::In => write!(f, "`in`"),
            TokenKind::Let => write!(f, "`let`"),
            TokenKind::Loop => write!(f, "`loop`"),
            TokenKind::Match => write!(f, "`match`"),
            TokenKind::Module => write!(f, "`module`"),
            TokenKind::Newtype => write!(f, "`newtype`"),
            TokenKind::Not => write!(f, "`not`"),
            TokenKind::Or => write!(f, "`or`"),
            TokenKind::Pub => write!(f, "`pub`"),
            TokenKind::Receive => write!(f, "`receive`"),
            TokenKind::Return => write!(f, "`return`"),
            TokenKind::Send => write!(f, "`send`"),
            TokenKind::Spawn => write!(f, "`spawn`"),
            TokenKind::Trait => write!(f, "`trait`"),
            TokenKind::True => write!(f, "`true`"),
            TokenKind::Type => write!(f, "`type`"),
            TokenKind::Where => write!(f, "`where`"),
            TokenKind::While => write!(f, "`while`"),
            TokenKind::With => write!(f, "`with`"),
            // Literals
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Int(value) => write!(f, "integer `{value}`"),
            TokenKind::Float(value) => write!(f, "float `{value}`"),
            TokenKind::String(_) => write!(f, "string literal"),
            TokenKind::StringBegin(_) | TokenKind::StringMid(_) | TokenKind::StringEnd(_) => {
                write!(f, "interpolated string")
            }
            // Punctuation
            TokenKind::LParen => write!(f, "`(`"),
            TokenKind::RParen => write!(f, "`)`"),
            TokenKind::LBracket => write!(f, "`[`"),
            TokenKind::RBracket => write!(f, "`]`"),
            TokenKind::LBrace => write!(f, "`{{`"),
            TokenKind::RBrace => write!(f, "`}}`"),
            TokenKind::Comma => write!(f, "`,`"),
            TokenKind::Colon => write!(f, "`:`"),
            TokenKind::Dot => write!(f, "`.`"),
            TokenKind::DotDot => write!(f, "`..`"),
            TokenKind::DotDotEqual => write!(f, "`..=`"),
            TokenKind::Ellipsis => write!(f, "`...`"),
            TokenKind::Plus => write!(f, "`+`"),
            TokenKind::Minus => write!(f, "`-`"),
            TokenKind::Star => write!(f, "`*`"),
            TokenKind::StarStar => write!(f, "`**`"),
            TokenKind::Slash => write!(f, "`/`"),
            TokenKind::Percent => write!(f, "`%`"),
            TokenKind::Equals => write!(f, "`=`"),
            TokenKind::EqualEqual => write!(f, "`==`"),
            TokenKind::BangEqual => write!(f, "`!=`"),
            TokenKind::Less => write!(f, "`<`"),
            TokenKind::LessEqual => write!(f, "`<=`"),
            TokenKind::Greater => write!(f, "`>`"),
            TokenKind::GreaterEqual => write!(f, "`>=`"),
            TokenKind::Arrow => write!(f, "`->`"),
            TokenKind::FatArrow => write!(f, "`=>`"),
            TokenKind::Bind => write!(f, "`<-`"),
            TokenKind::PipeGreater => write!(f, "`|>`"),
            TokenKind::Bar => write!(f, "`|`"),
            TokenKind::Underscore => write!(f, "`_`"),
            TokenKind::At => write!(f, "`@`"),
            TokenKind::Question => write!(f, "`?`"),
            // Layout
            TokenKind::Indent => write!(f, "indent"),
            TokenKind::Dedent => write!(f, "dedent"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Error(message) => write!(f, "invalid token ({message})"),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("{loc}: {message}")]
    Lex {
        message: String,
        lexeme: String,
        loc: SourceLoc,
    },
    #[error("{loc}: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: TokenKind,
        lexeme: String,
        loc: SourceLoc,
    },
    #[error("{loc}: {message}")]
    Invalid {
        message: String,
        lexeme: String,
        loc: SourceLoc,
    },
}

impl ParseError {
    pub fn loc(&self) -> &SourceLoc {
        match self {
            ParseError::Lex { loc, .. }
            | ParseError::UnexpectedToken { loc, .. }
            | ParseError::Invalid { loc, .. } => loc,
        }
    }

    /// The message without its location prefix.
    pub fn message(&self) -> String {
        match self {
            ParseError::Lex { message, .. } | ParseError::Invalid { message, .. } => {
                message.clone()
            }
            ParseError::UnexpectedToken {
                expected, found, ..
            } => format!("expected {expected}, found {found}"),
        }
    }

    fn lexeme(&self) -> &str {
        match self {
            ParseError::Lex { lexeme, .. }
            | ParseError::UnexpectedToken { lexeme, .. }
            | ParseError::Invalid { lexeme, .. } => lexeme,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.message(), Some(self.loc().clone()))
            .with_length(self.lexeme().chars().count())
    }
}

/// Parses a whole source file, returning whatever tree could be built along
/// with every error encountered.
pub fn parse_program(source: &str, file: &str) -> (Program, Vec<ParseError>) {
    let mut parser = Parser::new(Lexer::with_file(source, Arc::from(file)));
    let program = parser.parse_program();
    (program, parser.into_errors())
}

pub fn parse(source: &str) -> Result<Program, Vec<ParseError>> {
    let (program, errors) = parse_program(source, "<input>");
    if errors.is_empty() {
        Ok(program)
    } else {
        Err(errors)
    }
}

pub fn parse_expr(source: &str) -> Result<Expr, Vec<ParseError>> {
    parse_expr_in(source, "<input>")
}

pub fn parse_expr_in(source: &str, file: &str) -> Result<Expr, Vec<ParseError>> {
    let mut parser = Parser::new(Lexer::with_file(source, Arc::from(file)));
    let expr = parser.parse_expression();
    parser.finish(expr)
}

pub fn parse_stmt(source: &str) -> Result<Stmt, Vec<ParseError>> {
    parse_stmt_in(source, "<input>")
}

pub fn parse_stmt_in(source: &str, file: &str) -> Result<Stmt, Vec<ParseError>> {
    let mut parser = Parser::new(Lexer::with_file(source, Arc::from(file)));
    let stmt = parser.parse_statement();
    parser.finish(stmt)
}

#[derive(Clone)]
struct Checkpoint {
    lexer: LexerState,
    current: Token,
    pending_dedents: usize,
    open_indents: usize,
    saw_newline: bool,
    saw_indent: bool,
    errors: usize,
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    errors: Vec<ParseError>,
    /// Dedents crossed by `advance` that no block has claimed yet.
    pending_dedents: usize,
    /// Indents crossed that no block has claimed: continuation lines.
    open_indents: usize,
    /// `open_indents` when the statement being parsed began.
    indent_base: usize,
    saw_newline: bool,
    saw_indent: bool,
    /// Open expression, pattern and type productions.
    depth: usize,
}

/// Deeper input is rejected before it can exhaust the stack.
const MAX_NESTING: usize = 32;

impl<'a> Parser<'a> {
    pub fn new(lexer: Lexer<'a>) -> Self {
        let loc = SourceLoc::new(lexer.file().clone(), 1, 1);
        let mut parser = Self {
            lexer,
            current: Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                loc,
            },
            errors: Vec::new(),
            pending_dedents: 0,
            open_indents: 0,
            indent_base: 0,
            saw_newline: false,
            saw_indent: false,
            depth: 0,
        };
        parser.advance();
        parser
    }

    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<ParseError> {
        self.errors
    }

    fn finish<T>(mut self, result: Result<T, ParseError>) -> Result<T, Vec<ParseError>> {
        match result {
            Ok(value) => {
                if !self.check(&TokenKind::Eof) {
                    let err = self.unexpected("end of input");
                    self.errors.push(err);
                }
                if self.errors.is_empty() {
                    Ok(value)
                } else {
                    Err(self.errors)
                }
            }
            Err(err) => {
                self.errors.push(err);
                Err(self.errors)
            }
        }
    }

    pub fn parse_program(&mut self) -> Program {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            self.pending_dedents = 0;
            self.open_indents = 0;
            let start = self.current.loc.clone();
            match self.parse_statement() {
                Ok(stmt) => {
                    self.push_stmt(&mut stmts, stmt);
                    if !self.check(&TokenKind::Eof) && !self.saw_newline {
                        let err = self.unexpected("newline after statement");
                        self.errors.push(err);
                        self.recover_to_top_level(&start);
                    }
                }
                Err(err) => {
                    self.errors.push(err);
                    self.recover_to_top_level(&start);
                }
            }
        }
        Program {
            file: self.lexer.file().clone(),
            stmts,
        }
    }

    /// Panic-mode recovery: skip tokens until a line that starts at the
    /// outermost indentation level. Always makes progress past `start`.
    fn recover_to_top_level(&mut self, start: &SourceLoc) {
        tracing::debug!(line = self.current.loc.line, "recovering from parse error");
        if self.current.loc == *start && !self.check(&TokenKind::Eof) {
            self.advance();
        }
        while !self.check(&TokenKind::Eof) {
            if self.saw_newline && self.lexer.indent_depth() == 0 {
                break;
            }
            self.advance();
        }
    }

    /// Appends a statement, merging a function clause into an adjacent
    /// definition of the same name.
    fn push_stmt(&mut self, stmts: &mut Vec<Stmt>, stmt: Stmt) {
        let Stmt { kind, loc } = stmt;
        let def = match kind {
            StmtKind::Fn(def) if def.is_multi_clause() => def,
            other => {
                stmts.push(Stmt::new(other, loc));
                return;
            }
        };
        if let Some(Stmt {
            kind: StmtKind::Fn(previous),
            ..
        }) = stmts.last_mut()
        {
            if previous.name == def.name {
                if let (FnBody::Clauses(existing), FnBody::Clauses(added)) =
                    (&mut previous.body, def.body.clone())
                {
                    existing.extend(added);
                    return;
                }
                self.errors.push(ParseError::Invalid {
                    message: format!(
                        "Function '{}' mixes a typed definition with clause definitions",
                        def.name
                    ),
                    lexeme: def.name.clone(),
                    loc: loc.clone(),
                });
                stmts.push(Stmt::new(StmtKind::Fn(def), loc));
                return;
            }
        }
        let duplicate = stmts
            .iter()
            .any(|stmt| matches!(&stmt.kind, StmtKind::Fn(other) if other.name == def.name));
        if duplicate {
            self.errors.push(ParseError::Invalid {
                message: format!("Function clauses for '{}' must be adjacent", def.name),
                lexeme: def.name.clone(),
                loc: loc.clone(),
            });
        }
        stmts.push(Stmt::new(StmtKind::Fn(def), loc));
    }

    // --- statements ---

    pub fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let base = std::mem::replace(&mut self.indent_base, self.open_indents);
        let result = self.parse_statement_inner();
        self.indent_base = base;
        result
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, ParseError> {
        match self.current.kind {
            TokenKind::Let => self.parse_let(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Fn => {
                let def = self.parse_function(false)?;
                let loc = def.loc.clone();
                Ok(Stmt::new(StmtKind::Fn(def), loc))
            }
            TokenKind::Pub => self.parse_pub(),
            TokenKind::Import => self.parse_import(),
            TokenKind::Defer => {
                let loc = self.current.loc.clone();
                self.advance();
                let expr = self.parse_expression()?;
                Ok(Stmt::new(StmtKind::Defer(expr), loc))
            }
            TokenKind::Type => self.parse_type_def(false),
            TokenKind::Newtype => self.parse_newtype(false),
            TokenKind::Break => {
                let loc = self.current.loc.clone();
                self.advance();
                let value = if self.at_expr_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Stmt::new(StmtKind::Break(value), loc))
            }
            TokenKind::Continue => {
                let loc = self.current.loc.clone();
                self.advance();
                Ok(Stmt::new(StmtKind::Continue, loc))
            }
            TokenKind::Trait => self.parse_trait(),
            TokenKind::Impl => self.parse_impl(),
            TokenKind::Module => {
                let loc = self.current.loc.clone();
                self.advance();
                let path = self.parse_dotted_path()?;
                Ok(Stmt::new(StmtKind::Module { path }, loc))
            }
            _ => {
                let expr = self.parse_expression()?;
                Ok(Stmt::expr(expr))
            }
        }
    }

    fn parse_pub(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.advance();
        match self.current.kind {
            TokenKind::Fn => {
                let mut def = self.parse_function(true)?;
                def.loc = loc.clone();
                Ok(Stmt::new(StmtKind::Fn(def), loc))
            }
            TokenKind::Type => {
                let mut stmt = self.parse_type_def(true)?;
                stmt.loc = loc;
                Ok(stmt)
            }
            TokenKind::Newtype => {
                let mut stmt = self.parse_newtype(true)?;
                stmt.loc = loc;
                Ok(stmt)
            }
            _ => Err(self.unexpected("`fn`, `type` or `newtype` after `pub`")),
        }
    }

    fn parse_let(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.advance();
        let pattern = self.parse_pattern()?;
        let type_ann = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(TokenKind::Equals)?;
        let value = self.parse_expression()?;
        let else_branch = if self.check(&TokenKind::Else) && !self.saw_newline {
            self.advance();
            self.expect(TokenKind::Colon)?;
            Some(self.parse_body()?)
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::Let {
                pattern,
                type_ann,
                value,
                else_branch,
            },
            loc,
        ))
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.advance();
        let value = if self.at_expr_end() || self.check(&TokenKind::If) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        let condition = if self.check(&TokenKind::If) && !self.saw_newline {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::Return { value, condition }, loc))
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.advance();
        let mut path = vec![self.expect_ident()?.name];
        let mut items = Vec::new();
        while self.check(&TokenKind::Dot) {
            self.advance();
            if self.eat(&TokenKind::LBrace) {
                loop {
                    items.push(self.expect_ident()?.name);
                    if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RBrace) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                break;
            }
            path.push(self.expect_ident()?.name);
        }
        let alias = if self.eat(&TokenKind::As) {
            Some(self.expect_ident()?.name)
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::Import { path, items, alias }, loc))
    }

    fn parse_dotted_path(&mut self) -> Result<Vec<String>, ParseError> {
        let mut path = vec![self.expect_ident()?.name];
        while self.eat(&TokenKind::Dot) {
            path.push(self.expect_ident()?.name);
        }
        Ok(path)
    }

    fn parse_function(&mut self, is_pub: bool) -> Result<FunctionDef, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Fn)?;
        let name = self.expect_ident()?.name;
        self.expect(TokenKind::LParen)?;

        let mut typed = Vec::new();
        let mut patterns = Vec::new();
        let mut all_typed = true;
        while !self.check(&TokenKind::RParen) {
            let param_loc = self.current.loc.clone();
            let is_typed = matches!(self.current.kind, TokenKind::Ident(_))
                && self.lexer.peek().kind == TokenKind::Colon;
            if is_typed {
                let ident = self.expect_ident()?;
                self.expect(TokenKind::Colon)?;
                let ty = self.parse_type()?;
                patterns.push(Pattern::new(
                    PatternKind::Ident(ident.name.clone()),
                    param_loc.clone(),
                ));
                typed.push(Param {
                    name: ident.name,
                    ty,
                    loc: param_loc,
                });
            } else {
                all_typed = false;
                patterns.push(self.parse_pattern()?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        let mut return_type = None;
        let mut arrow_body = false;
        if self.eat(&TokenKind::Arrow) {
            let checkpoint = self.checkpoint();
            match self.parse_type() {
                Ok(ty) if self.check(&TokenKind::Colon) || self.check(&TokenKind::Where) => {
                    return_type = Some(ty);
                }
                _ => {
                    self.restore(checkpoint);
                    arrow_body = true;
                }
            }
        }
        let mut where_clauses = Vec::new();
        if !arrow_body {
            if self.eat(&TokenKind::Where) {
                loop {
                    where_clauses.push(self.parse_type()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::Colon)?;
        }
        let body = self.parse_body()?;

        let body = if all_typed {
            FnBody::Typed(TypedFn {
                params: typed,
                return_type,
                where_clauses,
                body: Box::new(body),
            })
        } else {
            FnBody::Clauses(vec![FnClause {
                params: patterns,
                return_type,
                body,
                loc: loc.clone(),
            }])
        };
        Ok(FunctionDef {
            name,
            is_pub,
            body,
            loc,
        })
    }

    fn parse_type_def(&mut self, is_pub: bool) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Type)?;
        let name = self.expect_ident()?.name;
        let type_params = self.parse_type_params()?;
        let mut derives = Vec::new();
        if self.eat(&TokenKind::Derive) {
            self.expect(TokenKind::LParen)?;
            while !self.check(&TokenKind::RParen) {
                derives.push(self.expect_ident()?.name);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        self.expect(TokenKind::Colon)?;

        let items = self.parse_layout_items(Self::parse_type_item)?;
        let mut variants = Vec::new();
        let mut fields = Vec::new();
        for item in items {
            match item {
                TypeItem::Variant(variant) => variants.push(variant),
                TypeItem::Field(field) => fields.push(field),
            }
        }
        let body = match (variants.is_empty(), fields.is_empty()) {
            (false, true) => TypeDefBody::Variants(variants),
            (true, false) => TypeDefBody::Record(fields),
            (true, true) => {
                return Err(self.invalid(format!("type '{name}' has no variants or fields")))
            }
            (false, false) => {
                return Err(self.invalid(format!(
                    "type '{name}' mixes record fields and variants"
                )))
            }
        };
        Ok(Stmt::new(
            StmtKind::TypeDef(TypeDef {
                name,
                is_pub,
                type_params,
                body,
                derives,
            }),
            loc,
        ))
    }

    fn parse_type_item(&mut self) -> Result<TypeItem, ParseError> {
        let loc = self.current.loc.clone();
        let ident = self.expect_ident()?;
        if starts_uppercase(&ident.name) {
            let mut fields = Vec::new();
            if self.eat(&TokenKind::LParen) {
                while !self.check(&TokenKind::RParen) {
                    fields.push(self.parse_field(false)?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
            }
            return Ok(TypeItem::Variant(Variant {
                name: ident.name,
                fields,
                loc,
            }));
        }
        self.expect(TokenKind::Colon)?;
        let ty = self.parse_type()?;
        Ok(TypeItem::Field(Field {
            name: Some(ident.name),
            ty,
            loc,
        }))
    }

    /// A variant field: `name: Type` or a bare positional `Type`.
    fn parse_field(&mut self, require_name: bool) -> Result<Field, ParseError> {
        let loc = self.current.loc.clone();
        let named = matches!(self.current.kind, TokenKind::Ident(_))
            && self.lexer.peek().kind == TokenKind::Colon;
        if named {
            let name = self.expect_ident()?.name;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            return Ok(Field {
                name: Some(name),
                ty,
                loc,
            });
        }
        if require_name {
            return Err(self.unexpected("field name"));
        }
        Ok(Field {
            name: None,
            ty: self.parse_type()?,
            loc,
        })
    }

    fn parse_type_params(&mut self) -> Result<Vec<String>, ParseError> {
        let mut params = Vec::new();
        if self.eat(&TokenKind::LParen) {
            while !self.check(&TokenKind::RParen) {
                params.push(self.expect_ident()?.name);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(params)
    }

    fn parse_newtype(&mut self, is_pub: bool) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Newtype)?;
        let name = self.expect_ident()?.name;
        self.expect(TokenKind::Equals)?;
        let constructor = self.expect_ident()?.name;
        self.expect(TokenKind::LParen)?;
        let inner = self.parse_type()?;
        self.expect(TokenKind::RParen)?;
        Ok(Stmt::new(
            StmtKind::Newtype {
                name,
                constructor,
                inner,
                is_pub,
            },
            loc,
        ))
    }

    fn parse_trait(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Trait)?;
        let name = self.expect_ident()?.name;
        let type_params = self.parse_type_params()?;
        let mut constraints = Vec::new();
        if self.eat(&TokenKind::With) {
            loop {
                constraints.push(self.parse_type()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::Colon)?;
        let methods = self.parse_layout_items(Self::parse_trait_method)?;
        Ok(Stmt::new(
            StmtKind::Trait(TraitDef {
                name,
                type_params,
                constraints,
                methods,
            }),
            loc,
        ))
    }

    fn parse_trait_method(&mut self) -> Result<TraitMethod, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Fn)?;
        let name = self.expect_ident()?.name;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let param_loc = self.current.loc.clone();
            let field = self.parse_field(true)?;
            params.push(Param {
                name: field.name.unwrap_or_default(),
                ty: field.ty,
                loc: param_loc,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        Ok(TraitMethod {
            name,
            params,
            return_type,
            loc,
        })
    }

    fn parse_impl(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Impl)?;
        let trait_name = self.expect_ident()?.name;
        let mut type_args = Vec::new();
        if self.eat(&TokenKind::LParen) {
            while !self.check(&TokenKind::RParen) {
                type_args.push(self.parse_type()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        self.expect(TokenKind::Colon)?;
        let methods = self.parse_layout_items(|parser| parser.parse_function(false))?;
        Ok(Stmt::new(
            StmtKind::Impl(ImplDef {
                trait_name,
                type_args,
                methods,
            }),
            loc,
        ))
    }

    /// Items after a `:` either fill an indented block, one per line, or
    /// follow on the same line separated by `,` or `|`.
    fn parse_layout_items<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = Vec::new();
        if self.saw_indent {
            self.claim_indent();
            let snapshot = self.pending_dedents;
            loop {
                if self.pending_dedents > snapshot {
                    self.pending_dedents -= 1;
                    break;
                }
                if self.check(&TokenKind::Eof) {
                    break;
                }
                items.push(item(self)?);
                self.eat(&TokenKind::Comma);
            }
        } else {
            loop {
                items.push(item(self)?);
                if !(self.eat(&TokenKind::Comma) || self.eat(&TokenKind::Bar)) {
                    break;
                }
            }
        }
        Ok(items)
    }

    // --- blocks ---

    /// The body after `:` or `->`: an indented block when the next token
    /// starts a deeper line, otherwise a single expression on the same line.
    fn parse_body(&mut self) -> Result<Expr, ParseError> {
        if self.saw_indent {
            return self.parse_indented_block();
        }
        if matches!(
            self.current.kind,
            TokenKind::Let
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Defer
        ) {
            let stmt = self.parse_statement()?;
            let loc = stmt.loc.clone();
            return Ok(Expr::new(
                ExprKind::Block {
                    stmts: vec![stmt],
                    final_expr: None,
                },
                loc,
            ));
        }
        self.parse_expression()
    }

    fn parse_indented_block(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.claim_indent();
        let snapshot = self.pending_dedents;
        let mut stmts = Vec::new();
        loop {
            if self.pending_dedents > snapshot {
                self.pending_dedents -= 1;
                break;
            }
            if self.at_block_terminator() {
                break;
            }
            if !stmts.is_empty() && !self.saw_newline {
                return Err(self.unexpected("newline after statement"));
            }
            let stmt = self.parse_statement()?;
            self.push_stmt(&mut stmts, stmt);
        }
        Ok(block_from_stmts(stmts, loc))
    }

    fn at_block_terminator(&self) -> bool {
        match self.current.kind {
            TokenKind::Eof | TokenKind::Else => true,
            TokenKind::Fn
            | TokenKind::Type
            | TokenKind::Trait
            | TokenKind::Impl
            | TokenKind::Pub => self.saw_newline && self.lexer.indent_depth() == 0,
            _ => false,
        }
    }

    fn parse_brace_block(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let stmt = self.parse_statement()?;
            self.push_stmt(&mut stmts, stmt);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(block_from_stmts(stmts, loc))
    }

    // --- expressions ---

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_pipe)
    }

    fn nested<T>(
        &mut self,
        production: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.invalid(format!(
                "nesting is too deep (more than {MAX_NESTING} levels)"
            )));
        }
        self.depth += 1;
        let result = production(self);
        self.depth -= 1;
        result
    }

    fn parse_pipe(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_range()?;
        while self.check(&TokenKind::PipeGreater) && self.continues_line() {
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_range()?;
            expr = binary(BinaryOp::Pipe, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_range(&mut self) -> Result<Expr, ParseError> {
        let start = self.parse_or()?;
        let inclusive = match self.current.kind {
            TokenKind::DotDot => false,
            TokenKind::DotDotEqual => true,
            _ => return Ok(start),
        };
        if !self.continues_line() {
            return Ok(start);
        }
        self.advance();
        let end = self.parse_or()?;
        let loc = start.loc.clone();
        Ok(Expr::new(
            ExprKind::Range {
                start: Box::new(start),
                end: Box::new(end),
                inclusive,
            },
            loc,
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.check(&TokenKind::Or) && self.continues_line() {
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_and()?;
            expr = binary(BinaryOp::Or, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_equality()?;
        while self.check(&TokenKind::And) && self.continues_line() {
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_equality()?;
            expr = binary(BinaryOp::And, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqualEqual => BinaryOp::Eq,
                TokenKind::BangEqual => BinaryOp::Ne,
                _ => break,
            };
            if !self.continues_line() {
                break;
            }
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_comparison()?;
            expr = binary(op, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                TokenKind::In => BinaryOp::In,
                _ => break,
            };
            if !self.continues_line() {
                break;
            }
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_additive()?;
            expr = binary(op, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            if !self.continues_line() {
                break;
            }
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_multiplicative()?;
            expr = binary(op, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_power()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            if !self.continues_line() {
                break;
            }
            let loc = self.current.loc.clone();
            self.advance();
            let right = self.parse_power()?;
            expr = binary(op, expr, right, loc);
        }
        Ok(expr)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_unary()?;
        if self.check(&TokenKind::StarStar) && self.continues_line() {
            let loc = self.current.loc.clone();
            self.advance();
            let exponent = self.nested(Self::parse_power)?;
            return Ok(binary(BinaryOp::Pow, base, exponent, loc));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.current.kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Not => UnaryOp::Not,
            _ => return self.parse_postfix(),
        };
        let loc = self.current.loc.clone();
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            loc,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current.kind {
                TokenKind::Question if !self.saw_newline => {
                    self.advance();
                    let loc = expr.loc.clone();
                    expr = Expr::new(ExprKind::Try(Box::new(expr)), loc);
                }
                TokenKind::LParen if !self.saw_newline => {
                    let args = self.parse_call_args()?;
                    let loc = expr.loc.clone();
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        loc,
                    );
                }
                TokenKind::LBracket if !self.saw_newline => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket)?;
                    let loc = expr.loc.clone();
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    );
                }
                TokenKind::Dot if self.continues_line() => {
                    self.advance();
                    let field = match &self.current.kind {
                        TokenKind::Ident(name) => name.clone(),
                        TokenKind::Int(index) => index.to_string(),
                        _ => return Err(self.unexpected("field name or tuple index")),
                    };
                    self.advance();
                    let loc = expr.loc.clone();
                    expr = Expr::new(
                        ExprKind::Dot {
                            object: Box::new(expr),
                            field,
                        },
                        loc,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let labeled = matches!(self.current.kind, TokenKind::Ident(_))
                && self.lexer.peek().kind == TokenKind::Colon;
            let label = if labeled {
                let name = self.expect_ident()?.name;
                self.expect(TokenKind::Colon)?;
                Some(name)
            } else {
                None
            };
            let value = self.parse_expression()?;
            args.push(CallArg { label, value });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        let kind = match self.current.kind.clone() {
            TokenKind::Int(value) => {
                self.advance();
                ExprKind::Int(value)
            }
            TokenKind::Float(value) => {
                self.advance();
                ExprKind::Float(value)
            }
            TokenKind::String(value) => {
                self.advance();
                ExprKind::String(value)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::StringBegin(text) => return self.parse_interpolated(text, loc),
            TokenKind::Ident(name) => {
                self.advance();
                if self.check(&TokenKind::Bind) && !self.saw_newline {
                    self.advance();
                    let value = self.parse_expression()?;
                    ExprKind::Bind {
                        name,
                        value: Box::new(value),
                    }
                } else {
                    ExprKind::Ident(name)
                }
            }
            TokenKind::LParen => return self.parse_paren(),
            TokenKind::LBracket => return self.parse_list(),
            TokenKind::LBrace => return self.parse_brace_block(),
            TokenKind::Percent => return self.parse_map_or_update(),
            TokenKind::If => return self.parse_if(),
            TokenKind::Match => return self.parse_match(),
            TokenKind::With => return self.parse_with(),
            TokenKind::For => {
                self.advance();
                let var = self.expect_ident()?.name;
                self.expect(TokenKind::In)?;
                let iterable = self.parse_expression()?;
                self.expect(TokenKind::Colon)?;
                let body = self.parse_body()?;
                ExprKind::For {
                    var,
                    iterable: Box::new(iterable),
                    body: Box::new(body),
                }
            }
            TokenKind::While => {
                self.advance();
                let condition = self.parse_expression()?;
                self.expect(TokenKind::Colon)?;
                let body = self.parse_body()?;
                ExprKind::While {
                    condition: Box::new(condition),
                    body: Box::new(body),
                }
            }
            TokenKind::Loop => {
                self.advance();
                self.expect(TokenKind::Colon)?;
                let body = self.parse_body()?;
                ExprKind::Loop {
                    body: Box::new(body),
                }
            }
            TokenKind::Spawn => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                ExprKind::Spawn(Box::new(inner))
            }
            TokenKind::Send => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let target = self.parse_expression()?;
                self.expect(TokenKind::Comma)?;
                let message = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                ExprKind::Send {
                    target: Box::new(target),
                    message: Box::new(message),
                }
            }
            TokenKind::Receive => return self.parse_receive(),
            _ => return Err(self.unexpected("expression")),
        };
        Ok(Expr::new(kind, loc))
    }

    fn parse_interpolated(&mut self, first: String, loc: SourceLoc) -> Result<Expr, ParseError> {
        self.advance();
        let mut parts = Vec::new();
        if !first.is_empty() {
            parts.push(InterpPart::Literal(first));
        }
        loop {
            parts.push(InterpPart::Expr(self.parse_expression()?));
            match self.current.kind.clone() {
                TokenKind::StringMid(text) => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(InterpPart::Literal(text));
                    }
                }
                TokenKind::StringEnd(text) => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(InterpPart::Literal(text));
                    }
                    break;
                }
                _ => return Err(self.unexpected("`}` closing the interpolation")),
            }
        }
        Ok(Expr::new(ExprKind::InterpString(parts), loc))
    }

    /// `(a, b) -> body` is a lambda; anything else in parentheses is a
    /// grouped expression, a tuple, or unit.
    fn parse_paren(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        let checkpoint = self.checkpoint();
        if let Some(params) = self.try_lambda_params() {
            let body = self.parse_body()?;
            return Ok(Expr::new(
                ExprKind::Lambda {
                    params,
                    body: Box::new(body),
                },
                loc,
            ));
        }
        self.restore(checkpoint);

        self.expect(TokenKind::LParen)?;
        if self.eat(&TokenKind::RParen) {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), loc));
        }
        let first = self.parse_expression()?;
        if !self.check(&TokenKind::Comma) {
            self.expect(TokenKind::RParen)?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RParen) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn try_lambda_params(&mut self) -> Option<Vec<String>> {
        self.advance();
        let mut params = Vec::new();
        while let TokenKind::Ident(name) = &self.current.kind {
            params.push(name.clone());
            self.advance();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        if !self.eat(&TokenKind::RParen) {
            return None;
        }
        if !self.check(&TokenKind::Arrow) || self.saw_newline {
            return None;
        }
        self.advance();
        Some(params)
    }

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::LBracket)?;
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), loc));
        }
        let first = self.parse_expression()?;
        if self.eat(&TokenKind::For) {
            let var = self.expect_ident()?.name;
            self.expect(TokenKind::In)?;
            let iterable = self.parse_expression()?;
            let condition = if self.eat(&TokenKind::If) {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    body: Box::new(first),
                    var,
                    iterable: Box::new(iterable),
                    condition,
                },
                loc,
            ));
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::List(items), loc))
    }

    /// `%{k: v, ...}` is a map literal; `%{base | field: v, ...}` updates a record.
    fn parse_map_or_update(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Percent)?;
        self.expect(TokenKind::LBrace)?;
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::new(ExprKind::Map(Vec::new()), loc));
        }
        let first = self.parse_expression()?;
        if self.eat(&TokenKind::Bar) {
            let mut fields = Vec::new();
            while !self.check(&TokenKind::RBrace) {
                let field = self.expect_ident()?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expression()?;
                fields.push(FieldInit {
                    name: field.name,
                    value,
                    loc: field.loc,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Expr::new(
                ExprKind::RecordUpdate {
                    base: Box::new(first),
                    fields,
                },
                loc,
            ));
        }
        self.expect(TokenKind::Colon)?;
        let value = self.parse_expression()?;
        let mut entries = vec![MapEntry { key: first, value }];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RBrace) {
                break;
            }
            let key = self.parse_expression()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression()?;
            entries.push(MapEntry { key, value });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Map(entries), loc))
    }

    fn parse_if(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::If)?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::Colon)?;
        let then_branch = self.parse_body()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                self.expect(TokenKind::Colon)?;
                Some(Box::new(self.parse_body()?))
            }
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch,
            },
            loc,
        ))
    }

    fn parse_match(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Match)?;
        let value = if self.check(&TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        self.expect(TokenKind::Colon)?;
        let conditional = value.is_none();
        let arms = self.parse_arms(|parser| parser.parse_match_arm(conditional))?;
        Ok(Expr::new(ExprKind::Match { value, arms }, loc))
    }

    /// Arms continue after a `,`, or, in the indented form, on each following
    /// line until the block's dedent arrives.
    fn parse_arms<T>(
        &mut self,
        mut arm: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let indented = self.saw_indent;
        if indented {
            self.claim_indent();
        }
        let snapshot = self.pending_dedents;
        let mut arms = Vec::new();
        loop {
            if indented && self.pending_dedents > snapshot {
                break;
            }
            arms.push(arm(self)?);
            if self.eat(&TokenKind::Comma) {
                if indented && self.pending_dedents > snapshot {
                    break;
                }
                if self.can_start_arm() {
                    continue;
                }
                break;
            }
            let next_line_arm = indented
                && self.saw_newline
                && self.pending_dedents == snapshot
                && self.can_start_arm();
            if !next_line_arm {
                break;
            }
        }
        if indented && self.pending_dedents > snapshot {
            self.pending_dedents -= 1;
        }
        Ok(arms)
    }

    fn parse_match_arm(&mut self, conditional: bool) -> Result<MatchArm, ParseError> {
        let loc = self.current.loc.clone();
        let (pattern, guard) = if conditional {
            if self.check(&TokenKind::Underscore) {
                let pattern = self.parse_pattern()?;
                (pattern, None)
            } else {
                let condition = self.parse_expression()?;
                (Pattern::new(PatternKind::Wildcard, loc.clone()), Some(condition))
            }
        } else {
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(&TokenKind::If) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            (pattern, guard)
        };
        self.expect(TokenKind::Arrow)?;
        let body = self.parse_body()?;
        Ok(MatchArm {
            pattern,
            guard,
            body,
            loc,
        })
    }

    fn parse_with(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::With)?;
        let mut bindings = Vec::new();
        loop {
            let ident = self.expect_ident()?;
            self.expect(TokenKind::Bind)?;
            let value = self.parse_expression()?;
            bindings.push(WithBinding {
                name: ident.name,
                value,
                loc: ident.loc,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Do)?;
        self.eat(&TokenKind::Colon);
        let body = self.parse_body()?;
        let else_arms = if self.eat(&TokenKind::Else) {
            self.eat(&TokenKind::Colon);
            self.parse_arms(|parser| parser.parse_match_arm(false))?
        } else {
            Vec::new()
        };
        Ok(Expr::new(
            ExprKind::With {
                bindings,
                body: Box::new(body),
                else_arms,
            },
            loc,
        ))
    }

    fn parse_receive(&mut self) -> Result<Expr, ParseError> {
        let loc = self.current.loc.clone();
        self.expect(TokenKind::Receive)?;
        self.expect(TokenKind::Colon)?;
        let mut after = None;
        let arms = self.parse_arms(|parser| {
            if parser.check(&TokenKind::After) {
                let after_loc = parser.current.loc.clone();
                parser.advance();
                let timeout = parser.parse_expression()?;
                parser.expect(TokenKind::Arrow)?;
                let body = parser.parse_body()?;
                after = Some(ReceiveAfter {
                    timeout: Box::new(timeout),
                    body: Some(Box::new(body)),
                    loc: after_loc,
                });
                return Ok(None);
            }
            parser.parse_match_arm(false).map(Some)
        })?;
        Ok(Expr::new(
            ExprKind::Receive {
                arms: arms.into_iter().flatten().collect(),
                after,
            },
            loc,
        ))
    }

    // --- patterns ---

    pub fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        self.nested(Self::pattern)
    }

    fn pattern(&mut self) -> Result<Pattern, ParseError> {
        let loc = self.current.loc.clone();
        let kind = match self.current.kind.clone() {
            TokenKind::Underscore => {
                self.advance();
                PatternKind::Wildcard
            }
            TokenKind::Ident(name) => {
                self.advance();
                if starts_uppercase(&name) {
                    let mut args = Vec::new();
                    if self.check(&TokenKind::LParen) && !self.saw_newline {
                        self.advance();
                        while !self.check(&TokenKind::RParen) {
                            args.push(self.parse_pattern()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen)?;
                    }
                    PatternKind::Constructor { name, args }
                } else {
                    PatternKind::Ident(name)
                }
            }
            TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::String(_)
            | TokenKind::True
            | TokenKind::False => {
                let literal = self.parse_primary()?;
                PatternKind::Lit(Box::new(literal))
            }
            TokenKind::Minus => {
                self.advance();
                let literal = match self.current.kind {
                    TokenKind::Int(value) => ExprKind::Int(-value),
                    TokenKind::Float(value) => ExprKind::Float(-value),
                    _ => return Err(self.unexpected("numeric literal after `-`")),
                };
                self.advance();
                PatternKind::Lit(Box::new(Expr::new(literal, loc.clone())))
            }
            TokenKind::LParen => {
                self.advance();
                let mut items = Vec::new();
                let mut trailing_comma = false;
                while !self.check(&TokenKind::RParen) {
                    items.push(self.parse_pattern()?);
                    trailing_comma = self.eat(&TokenKind::Comma);
                    if !trailing_comma {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                if items.len() == 1 && !trailing_comma {
                    return Ok(items.remove(0));
                }
                PatternKind::Tuple(items)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_pattern()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                PatternKind::List(items)
            }
            TokenKind::DotDot => {
                self.advance();
                match self.current.kind.clone() {
                    TokenKind::Underscore => {
                        self.advance();
                        PatternKind::Rest(None)
                    }
                    TokenKind::Ident(name) => {
                        self.advance();
                        PatternKind::Rest(Some(name))
                    }
                    _ => return Err(self.unexpected("name or `_` after `..`")),
                }
            }
            _ => return Err(self.unexpected("pattern")),
        };
        Ok(Pattern::new(kind, loc))
    }

    fn can_start_arm(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::After
                | TokenKind::Ident(_)
                | TokenKind::Underscore
                | TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::String(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::Minus
                | TokenKind::DotDot
        )
    }

    // --- types ---

    pub fn parse_type(&mut self) -> Result<TypeExpr, ParseError> {
        self.nested(Self::type_expr)
    }

    fn type_expr(&mut self) -> Result<TypeExpr, ParseError> {
        let loc = self.current.loc.clone();
        match self.current.kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                let mut args = Vec::new();
                if self.check(&TokenKind::LParen) && !self.saw_newline {
                    self.advance();
                    while !self.check(&TokenKind::RParen) {
                        args.push(self.parse_type()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                }
                Ok(TypeExpr {
                    kind: TypeExprKind::Named { name, args },
                    loc,
                })
            }
            TokenKind::LParen => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    items.push(self.parse_type()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                if self.check(&TokenKind::Arrow) && !self.saw_newline {
                    self.advance();
                    let ret = self.parse_type()?;
                    return Ok(TypeExpr {
                        kind: TypeExprKind::Function {
                            params: items,
                            ret: Box::new(ret),
                        },
                        loc,
                    });
                }
                if items.len() == 1 {
                    return Ok(items.remove(0));
                }
                Ok(TypeExpr {
                    kind: TypeExprKind::Tuple(items),
                    loc,
                })
            }
            _ => Err(self.unexpected("type")),
        }
    }

    // --- token plumbing ---

    fn advance(&mut self) {
        self.saw_newline = false;
        self.saw_indent = false;
        loop {
            let token = self.lexer.next_token();
            match token.kind {
                TokenKind::Newline => self.saw_newline = true,
                TokenKind::Indent => {
                    self.saw_newline = true;
                    self.saw_indent = true;
                    self.open_indents += 1;
                }
                TokenKind::Dedent => {
                    self.saw_newline = true;
                    if self.open_indents > 0 {
                        self.open_indents -= 1;
                    } else {
                        self.pending_dedents += 1;
                    }
                }
                TokenKind::Error(message) => {
                    self.errors.push(ParseError::Lex {
                        message,
                        lexeme: token.lexeme,
                        loc: token.loc,
                    });
                }
                _ => {
                    self.current = token;
                    return;
                }
            }
        }
    }

    /// A block opening here takes ownership of the indent just crossed.
    fn claim_indent(&mut self) {
        self.open_indents = self.open_indents.saturating_sub(1);
    }

    /// Binary operators and `.` may continue an expression onto a following
    /// line only when that line is indented past the statement's start.
    fn continues_line(&self) -> bool {
        !self.saw_newline || self.saw_indent || self.open_indents > self.indent_base
    }

    fn at_expr_end(&self) -> bool {
        self.saw_newline
            || matches!(
                self.current.kind,
                TokenKind::Eof
                    | TokenKind::RBrace
                    | TokenKind::RParen
                    | TokenKind::RBracket
                    | TokenKind::Comma
                    | TokenKind::Else
            )
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            lexer: self.lexer.save(),
            current: self.current.clone(),
            pending_dedents: self.pending_dedents,
            open_indents: self.open_indents,
            saw_newline: self.saw_newline,
            saw_indent: self.saw_indent,
            errors: self.errors.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.lexer.restore(checkpoint.lexer);
        self.current = checkpoint.current;
        self.pending_dedents = checkpoint.pending_dedents;
        self.open_indents = checkpoint.open_indents;
        self.saw_newline = checkpoint.saw_newline;
        self.saw_indent = checkpoint.saw_indent;
        self.errors.truncate(checkpoint.errors);
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn expect_ident(&mut self) -> Result<fern_syntax::Ident, ParseError> {
        match &self.current.kind {
            TokenKind::Ident(name) => {
                let ident = fern_syntax::Ident {
                    name: name.clone(),
                    loc: self.current.loc.clone(),
                };
                self.advance();
                Ok(ident)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: self.current.kind.clone(),
            lexeme: self.current.lexeme.clone(),
            loc: self.current.loc.clone(),
        }
    }

    fn invalid(&self, message: String) -> ParseError {
        ParseError::Invalid {
            message,
            lexeme: self.current.lexeme.clone(),
            loc: self.current.loc.clone(),
        }
    }
}

enum TypeItem {
    Variant(Variant),
    Field(Field),
}

fn binary(op: BinaryOp, left: Expr, right: Expr, loc: SourceLoc) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        loc,
    )
}

fn block_from_stmts(mut stmts: Vec<Stmt>, loc: SourceLoc) -> Expr {
    let final_expr = match stmts.last() {
        Some(Stmt {
            kind: StmtKind::Expr(_),
            ..
        }) => match stmts.pop() {
            Some(Stmt {
                kind: StmtKind::Expr(expr),
                ..
            }) => Some(Box::new(expr)),
            _ => None,
        },
        _ => None,
    };
    Expr::new(ExprKind::Block { stmts, final_expr }, loc)
}

fn starts_uppercase(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_syntax::validate_program;
    use proptest::prelude::*;

    fn parse_ok(source: &str) -> Program {
        let (program, errors) = parse_program(source, "test.fn");
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        validate_program(&program).expect("valid tree");
        program
    }

    fn only_fn(program: &Program) -> &FunctionDef {
        match &program.stmts[..] {
            [Stmt {
                kind: StmtKind::Fn(def),
                ..
            }] => def,
            other => panic!("expected a single fn, got {other:?}"),
        }
    }

    #[test]
    fn parses_precedence_of_arithmetic() {
        let expr = parse_expr("1 + 2 * 3").expect("parse");
        let ExprKind::Binary { op, left, right } = &expr.kind else {
            panic!("expected binary, got {expr:?}");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert_eq!(left.kind, ExprKind::Int(1));
        let ExprKind::Binary { op, left, right } = &right.kind else {
            panic!("expected nested binary");
        };
        assert_eq!(*op, BinaryOp::Mul);
        assert_eq!(left.kind, ExprKind::Int(2));
        assert_eq!(right.kind, ExprKind::Int(3));
    }

    #[test]
    fn parses_power_as_right_associative() {
        let expr = parse_expr("2 ** 3 ** 2").expect("parse");
        let ExprKind::Binary { op, left, right } = &expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Pow);
        assert_eq!(left.kind, ExprKind::Int(2));
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn parses_pipe_as_lowest_precedence() {
        let expr = parse_expr("x + 1 |> double()").expect("parse");
        let ExprKind::Binary { op, left, right } = &expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Pipe);
        assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Add, .. }));
        assert!(matches!(right.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn parses_range_below_logic() {
        let expr = parse_expr("0..n + 1").expect("parse");
        let ExprKind::Range { inclusive, end, .. } = &expr.kind else {
            panic!("expected range");
        };
        assert!(!inclusive);
        assert!(matches!(end.kind, ExprKind::Binary { op: BinaryOp::Add, .. }));
        let inclusive = parse_expr("1..=3").expect("parse");
        assert!(matches!(inclusive.kind, ExprKind::Range { inclusive: true, .. }));
    }

    #[test]
    fn parses_unary_operators() {
        let expr = parse_expr("not -x").expect("parse");
        let ExprKind::Unary { op, operand } = &expr.kind else {
            panic!("expected unary");
        };
        assert_eq!(*op, UnaryOp::Not);
        assert!(matches!(operand.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn parses_postfix_chain() {
        let expr = parse_expr("load(path)?.items[0]").expect("parse");
        let ExprKind::Index { object, .. } = &expr.kind else {
            panic!("expected index, got {expr:?}");
        };
        let ExprKind::Dot { object, field } = &object.kind else {
            panic!("expected dot");
        };
        assert_eq!(field, "items");
        assert!(matches!(object.kind, ExprKind::Try(_)));
    }

    #[test]
    fn parses_labeled_call_arguments() {
        let expr = parse_expr("Point(x: 1, y: 2)").expect("parse");
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected call");
        };
        let labels: Vec<_> = args.iter().map(|arg| arg.label.as_deref()).collect();
        assert_eq!(labels, vec![Some("x"), Some("y")]);
    }

    #[test]
    fn parses_brace_block_with_final_expression() {
        let expr = parse_expr("{ let x = 5, x + 1 }").expect("parse");
        let ExprKind::Block { stmts, final_expr } = &expr.kind else {
            panic!("expected block");
        };
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0].kind, StmtKind::Let { .. }));
        assert!(matches!(
            final_expr.as_deref().map(|expr| &expr.kind),
            Some(ExprKind::Binary { op: BinaryOp::Add, .. })
        ));
    }

    #[test]
    fn parses_let_with_type_annotation() {
        let expr = parse_expr("{ let x: Int = 42, x }").expect("parse");
        let ExprKind::Block { stmts, .. } = &expr.kind else {
            panic!("expected block");
        };
        let StmtKind::Let { type_ann, .. } = &stmts[0].kind else {
            panic!("expected let");
        };
        assert_eq!(type_ann.as_ref().map(ToString::to_string).as_deref(), Some("Int"));
    }

    #[test]
    fn parses_single_line_match() {
        let expr = parse_expr("match x: 1 -> true, _ -> false").expect("parse");
        let ExprKind::Match { value, arms } = &expr.kind else {
            panic!("expected match");
        };
        assert!(value.is_some());
        assert_eq!(arms.len(), 2);
        assert!(matches!(arms[1].pattern.kind, PatternKind::Wildcard));
    }

    #[test]
    fn parses_indented_match_arms_with_guards() {
        let source = "fn sign(n):\n    match n:\n        0 -> \"zero\"\n        x if x > 0 -> \"pos\"\n        _ -> \"neg\"\n";
        let program = parse_ok(source);
        let def = only_fn(&program);
        let clauses = def.clauses().expect("clause fn");
        let ExprKind::Block { final_expr, .. } = &clauses[0].body.kind else {
            panic!("expected block body");
        };
        let Some(ExprKind::Match { arms, .. }) = final_expr.as_deref().map(|e| &e.kind) else {
            panic!("expected match");
        };
        assert_eq!(arms.len(), 3);
        assert!(arms[1].guard.is_some());
    }

    #[test]
    fn parses_conditional_match() {
        let expr = parse_expr("match: x > 0 -> 1, _ -> 0").expect("parse");
        let ExprKind::Match { value, arms } = &expr.kind else {
            panic!("expected match");
        };
        assert!(value.is_none());
        assert!(arms[0].guard.is_some());
        assert!(matches!(arms[0].pattern.kind, PatternKind::Wildcard));
        assert!(arms[1].guard.is_none());
    }

    #[test]
    fn match_ends_at_dedent_and_outer_block_continues() {
        let source = "fn f(x):\n    let y = match x:\n        1 -> 10\n        _ -> 20\n    y + 1\n";
        let program = parse_ok(source);
        let clauses = only_fn(&program).clauses().expect("clauses");
        let ExprKind::Block { stmts, final_expr } = &clauses[0].body.kind else {
            panic!("expected block");
        };
        assert_eq!(stmts.len(), 1);
        assert!(matches!(
            final_expr.as_deref().map(|e| &e.kind),
            Some(ExprKind::Binary { op: BinaryOp::Add, .. })
        ));
    }

    #[test]
    fn parses_single_line_if_else() {
        let expr = parse_expr("if x > 0: 1 else: 0").expect("parse");
        let ExprKind::If {
            then_branch,
            else_branch,
            ..
        } = &expr.kind
        else {
            panic!("expected if");
        };
        assert_eq!(then_branch.kind, ExprKind::Int(1));
        assert_eq!(else_branch.as_deref().map(|e| &e.kind), Some(&ExprKind::Int(0)));
        let no_else = parse_expr("if true: 42").expect("parse");
        assert!(matches!(no_else.kind, ExprKind::If { else_branch: None, .. }));
    }

    #[test]
    fn parses_indented_if_else_chain() {
        let source = "fn f(x):\n    if x > 0:\n        1\n    else if x < 0:\n        2\n    else:\n        3\n";
        let program = parse_ok(source);
        let clauses = only_fn(&program).clauses().expect("clauses");
        let ExprKind::Block { final_expr, .. } = &clauses[0].body.kind else {
            panic!("expected block");
        };
        let Some(ExprKind::If { else_branch, .. }) = final_expr.as_deref().map(|e| &e.kind) else {
            panic!("expected if");
        };
        assert!(matches!(
            else_branch.as_deref().map(|e| &e.kind),
            Some(ExprKind::If { else_branch: Some(_), .. })
        ));
    }

    #[test]
    fn nested_blocks_consume_their_own_dedents() {
        let source = "fn f(x):\n    if x:\n        1\n    else:\n        2\nfn g(): 3\n";
        let program = parse_ok(source);
        assert_eq!(program.stmts.len(), 2);
    }

    #[test]
    fn parses_lambda_versus_tuple() {
        let lambda = parse_expr("(a, b) -> a + b").expect("parse");
        assert!(matches!(&lambda.kind, ExprKind::Lambda { params, .. } if params.len() == 2));
        let tuple = parse_expr("(1, \"hello\", true)").expect("parse");
        assert!(matches!(&tuple.kind, ExprKind::Tuple(items) if items.len() == 3));
        let grouped = parse_expr("(a)").expect("parse");
        assert_eq!(grouped.kind, ExprKind::Ident("a".into()));
        let unit = parse_expr("()").expect("parse");
        assert_eq!(unit.kind, ExprKind::Tuple(Vec::new()));
    }

    #[test]
    fn call_does_not_continue_onto_next_line() {
        let program = parse_ok("f\n(1, 2)\n");
        assert_eq!(program.stmts.len(), 2);
        assert!(matches!(
            &program.stmts[1].kind,
            StmtKind::Expr(Expr { kind: ExprKind::Tuple(_), .. })
        ));
    }

    #[test]
    fn indented_pipeline_continues_expression() {
        let source = "fn f(xs):\n    let r = xs\n        |> map(inc)\n        |> sum()\n    r\n";
        let program = parse_ok(source);
        let clauses = only_fn(&program).clauses().expect("clauses");
        let ExprKind::Block { stmts, final_expr } = &clauses[0].body.kind else {
            panic!("expected block");
        };
        assert_eq!(stmts.len(), 1);
        let StmtKind::Let { value, .. } = &stmts[0].kind else {
            panic!("expected let");
        };
        assert!(matches!(value.kind, ExprKind::Binary { op: BinaryOp::Pipe, .. }));
        assert_eq!(final_expr.as_deref().map(|e| &e.kind), Some(&ExprKind::Ident("r".into())));
    }

    #[test]
    fn parses_bind_expression() {
        let expr = parse_expr("x <- f()").expect("parse");
        let ExprKind::Bind { name, value } = &expr.kind else {
            panic!("expected bind");
        };
        assert_eq!(name, "x");
        assert!(matches!(value.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn parses_with_do_else() {
        let expr =
            parse_expr("with a <- f(), b <- g(a) do a + b else: Err(e) -> 0").expect("parse");
        let ExprKind::With {
            bindings,
            else_arms,
            ..
        } = &expr.kind
        else {
            panic!("expected with");
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(else_arms.len(), 1);
    }

    #[test]
    fn parses_list_comprehension() {
        let expr = parse_expr("[x * 2 for x in nums if x > 0]").expect("parse");
        let ExprKind::ListComp { var, condition, .. } = &expr.kind else {
            panic!("expected comprehension");
        };
        assert_eq!(var, "x");
        assert!(condition.is_some());
    }

    #[test]
    fn parses_map_literal_and_record_update() {
        let map = parse_expr("%{\"a\": 1, \"b\": 2}").expect("parse");
        assert!(matches!(&map.kind, ExprKind::Map(entries) if entries.len() == 2));
        let update = parse_expr("%{p | x: 3}").expect("parse");
        let ExprKind::RecordUpdate { fields, .. } = &update.kind else {
            panic!("expected record update");
        };
        assert_eq!(fields[0].name, "x");
    }

    #[test]
    fn parses_interpolated_string_parts() {
        let expr = parse_expr("\"hi {name}!\"").expect("parse");
        let ExprKind::InterpString(parts) = &expr.kind else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(
            &parts[1],
            InterpPart::Expr(Expr { kind: ExprKind::Ident(n), .. }) if n == "name"
        ));
    }

    #[test]
    fn parses_actor_primitives() {
        let source = "let pid = spawn(worker)\nsend(pid, 1)\nreceive:\n    Ping -> 1\n    after 100 -> 0\n";
        let program = parse_ok(source);
        let StmtKind::Expr(Expr {
            kind: ExprKind::Receive { arms, after },
            ..
        }) = &program.stmts[2].kind
        else {
            panic!("expected receive");
        };
        assert_eq!(arms.len(), 1);
        assert!(after.as_ref().and_then(|after| after.body.as_ref()).is_some());
    }

    #[test]
    fn parses_for_while_loop() {
        let source = "for x in xs:\n    print(x)\nwhile go:\n    step()\nloop:\n    break\n";
        let program = parse_ok(source);
        let kinds: Vec<&ExprKind> = program
            .stmts
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Expr(expr) => Some(&expr.kind),
                _ => None,
            })
            .collect();
        assert!(matches!(kinds[0], ExprKind::For { .. }));
        assert!(matches!(kinds[1], ExprKind::While { .. }));
        assert!(matches!(kinds[2], ExprKind::Loop { .. }));
    }

    #[test]
    fn parses_typed_function() {
        let program = parse_ok("fn add(x: Int, y: Int) -> Int: x + y\n");
        let def = only_fn(&program);
        let FnBody::Typed(typed) = &def.body else {
            panic!("expected typed fn");
        };
        assert_eq!(typed.params.len(), 2);
        assert_eq!(typed.return_type.as_ref().map(ToString::to_string).as_deref(), Some("Int"));
    }

    #[test]
    fn untyped_params_make_a_clause() {
        let program = parse_ok("fn add(a, b): a + b\n");
        let def = only_fn(&program);
        assert_eq!(def.clauses().map(<[FnClause]>::len), Some(1));
    }

    #[test]
    fn merges_adjacent_clauses() {
        let program = parse_ok("fn fact(0) -> 1\nfn fact(n) -> n * fact(n - 1)\n");
        let def = only_fn(&program);
        assert_eq!(def.name, "fact");
        assert_eq!(def.clauses().map(<[FnClause]>::len), Some(2));
    }

    #[test]
    fn rejects_non_adjacent_clauses() {
        let source = "fn fact(0) -> 1\nfn fact(n) -> n * fact(n - 1)\nlet x = 1\nfn fact(n) -> n\n";
        let (_, errors) = parse_program(source, "test.fn");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message(), "Function clauses for 'fact' must be adjacent");
        assert_eq!(errors[0].loc().line, 4);
    }

    #[test]
    fn rejects_clause_following_typed_definition() {
        let source = "fn fact(n: Int) -> Int: n\nfn fact(0) -> 1\n";
        let (program, errors) = parse_program(source, "test.fn");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message(),
            "Function 'fact' mixes a typed definition with clause definitions"
        );
        assert_eq!(errors[0].loc().line, 2);
        assert_eq!(program.stmts.len(), 2);
    }

    #[test]
    fn rejects_runaway_nesting_without_overflowing() {
        let depth = 1000;
        let source = format!("let x = {}1{}\nlet y = 2\n", "(".repeat(depth), ")".repeat(depth));
        let (_, errors) = parse_program(&source, "test.fn");
        assert!(!errors.is_empty());
        assert!(errors[0].message().starts_with("nesting is too deep"));

        let negations = format!("let z = {}1\n", "-".repeat(depth));
        let (_, errors) = parse_program(&negations, "test.fn");
        assert!(errors[0].message().starts_with("nesting is too deep"));

        let ty = format!("let t: {}Int{} = 1\n", "List(".repeat(depth), ")".repeat(depth));
        let (_, errors) = parse_program(&ty, "test.fn");
        assert!(errors[0].message().starts_with("nesting is too deep"));

        let pattern = format!("let {}a{} = 1\n", "[".repeat(depth), "]".repeat(depth));
        let (_, errors) = parse_program(&pattern, "test.fn");
        assert!(errors[0].message().starts_with("nesting is too deep"));
    }

    #[test]
    fn accepts_reasonable_nesting() {
        let source = format!("let x = {}1{}\n", "(".repeat(20), ")".repeat(20));
        parse_ok(&source);
    }

    #[test]
    fn parses_return_with_guard() {
        let program = parse_ok("fn f(x):\n    return 0 if x < 0\n    x\n");
        let clauses = only_fn(&program).clauses().expect("clauses");
        let ExprKind::Block { stmts, .. } = &clauses[0].body.kind else {
            panic!("expected block");
        };
        assert!(matches!(
            &stmts[0].kind,
            StmtKind::Return { value: Some(_), condition: Some(_) }
        ));
    }

    #[test]
    fn parses_sum_and_record_types() {
        let source = "type Shape derive(Show):\n    Circle(radius: Float)\n    Square(Float)\n    Empty\ntype Point:\n    x: Int\n    y: Int\npub type Option2(a): Some2(a), None2\n";
        let program = parse_ok(source);
        let StmtKind::TypeDef(shape) = &program.stmts[0].kind else {
            panic!("expected type def");
        };
        assert_eq!(shape.derives, vec!["Show".to_string()]);
        assert!(matches!(&shape.body, TypeDefBody::Variants(v) if v.len() == 3));
        let StmtKind::TypeDef(point) = &program.stmts[1].kind else {
            panic!("expected type def");
        };
        assert!(matches!(&point.body, TypeDefBody::Record(f) if f.len() == 2));
        let StmtKind::TypeDef(generic) = &program.stmts[2].kind else {
            panic!("expected type def");
        };
        assert!(generic.is_pub);
        assert_eq!(generic.type_params, vec!["a".to_string()]);
    }

    #[test]
    fn parses_trait_and_impl() {
        let source = "trait Show(a):\n    fn show(x: a) -> String\nimpl Show(Int):\n    fn show(x: Int) -> String: \"int\"\n";
        let program = parse_ok(source);
        assert!(matches!(&program.stmts[0].kind, StmtKind::Trait(def) if def.methods.len() == 1));
        assert!(matches!(
            &program.stmts[1].kind,
            StmtKind::Impl(def) if def.methods.len() == 1 && def.trait_name == "Show"
        ));
    }

    #[test]
    fn parses_import_forms() {
        let source =
            "import std.io\nimport std.list.{map, filter}\nimport std.string as s\nmodule app.main\n";
        let program = parse_ok(source);
        let StmtKind::Import { path, items, .. } = &program.stmts[1].kind else {
            panic!("expected import");
        };
        assert_eq!(path, &vec!["std".to_string(), "list".to_string()]);
        assert_eq!(items, &vec!["map".to_string(), "filter".to_string()]);
        assert!(matches!(
            &program.stmts[2].kind,
            StmtKind::Import { alias: Some(a), .. } if a == "s"
        ));
        assert!(matches!(&program.stmts[3].kind, StmtKind::Module { path } if path.len() == 2));
    }

    #[test]
    fn parses_patterns() {
        let program = parse_ok("let (a, [first, ..rest], Some(_)) = value\nlet [.._] = xs\n");
        let StmtKind::Let { pattern, .. } = &program.stmts[0].kind else {
            panic!("expected let");
        };
        assert_eq!(pattern.binders(), vec!["a", "first", "rest"]);
    }

    #[test]
    fn parses_newtype_and_refutable_let() {
        let program = parse_ok("newtype UserId = UserId(Int)\nlet Some(x) = lookup(k) else: 0\n");
        assert!(matches!(
            &program.stmts[0].kind,
            StmtKind::Newtype { constructor, .. } if constructor == "UserId"
        ));
        assert!(matches!(&program.stmts[1].kind, StmtKind::Let { else_branch: Some(_), .. }));
    }

    #[test]
    fn recovers_and_reports_multiple_errors() {
        let source = "let = 1\nlet y = 2\nfn (x): x\nlet z = 3\n";
        let (program, errors) = parse_program(source, "test.fn");
        assert_eq!(errors.len(), 2);
        assert_eq!(program.stmts.len(), 2);
        assert_eq!(errors[0].loc().line, 1);
        assert_eq!(errors[1].loc().line, 3);
    }

    #[test]
    fn reports_lex_error_as_parse_error() {
        let (_, errors) = parse_program("let x = \"open\n", "test.fn");
        assert!(errors.iter().any(|err| err.message() == "Unterminated string"));
    }

    #[test]
    fn renders_error_with_caret() {
        let source = "let x = )\n";
        let (_, errors) = parse_program(source, "test.fn");
        let rendered = errors[0].to_diagnostic().render(source, false);
        assert!(rendered.starts_with("error: expected expression, found `)`"));
        assert!(rendered.contains("--> test.fn:1:9"));
        assert!(rendered.contains("        ^"));
    }

    #[test]
    fn every_node_has_a_positive_location() {
        let source = "fn f(x: Int) -> Int:\n    let y = [x for x in xs if x > 0]\n    match y: [] -> 0, _ -> 1\n";
        parse_ok(source);
    }

    fn simple_stmt() -> impl Strategy<Value = String> {
        prop_oneof![
            (0i64..1000).prop_map(|n| format!("let v = {n}")),
            "[a-z]{1,6}".prop_map(|name| format!("fn {name}_f(x: Int) -> Int: x + 1")),
            (0i64..50, 0i64..50).prop_map(|(a, b)| format!("print({a} + {b} * 2)")),
            Just("if ready: go() else: wait()".to_string()),
            Just("for x in items:\n    show(x)".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn trailing_blank_lines_do_not_change_the_tree(
            stmts in prop::collection::vec(simple_stmt(), 1..6)
        ) {
            let source = stmts.join("\n");
            let (first, first_errors) = parse_program(&source, "prop.fn");
            let padded = format!("{source}\n\n");
            let (second, second_errors) = parse_program(&padded, "prop.fn");
            prop_assert!(first_errors.is_empty());
            prop_assert_eq!(first_errors, second_errors);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn accepted_programs_validate(stmts in prop::collection::vec(simple_stmt(), 1..6)) {
            let source = stmts.join("\n");
            let (program, errors) = parse_program(&source, "prop.fn");
            prop_assert!(errors.is_empty());
            prop_assert!(validate_program(&program).is_ok());
        }
    }
}
