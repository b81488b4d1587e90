use std::sync::Arc;

use fern_syntax::SourceLoc;

use crate::{Token, TokenKind};

const TAB_WIDTH: usize = 8;

/// Everything the lexer mutates. Cloning it is a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexerState {
    pos: usize,
    line: u32,
    column: u32,
    indent_stack: Vec<usize>,
    pending_dedents: usize,
    at_line_start: bool,
    line_has_token: bool,
    bracket_depth: usize,
    /// One entry per open interpolation, counting braces opened inside it.
    interp_stack: Vec<usize>,
    done: bool,
}

#[derive(Clone)]
pub struct Lexer<'a> {
    source: &'a str,
    file: Arc<str>,
    state: LexerState,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self::with_file(source, Arc::from("<input>"))
    }

    pub fn with_file(source: &'a str, file: Arc<str>) -> Self {
        Self {
            source,
            file,
            state: LexerState {
                pos: 0,
                line: 1,
                column: 1,
                indent_stack: vec![0],
                pending_dedents: 0,
                at_line_start: true,
                line_has_token: false,
                bracket_depth: 0,
                interp_stack: Vec::new(),
                done: false,
            },
        }
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    pub fn file(&self) -> &Arc<str> {
        &self.file
    }

    pub fn save(&self) -> LexerState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: LexerState) {
        self.state = state;
    }

    /// Number of indentation levels open on the current line.
    pub fn indent_depth(&self) -> usize {
        self.state.indent_stack.len().saturating_sub(1)
    }

    pub fn peek(&mut self) -> Token {
        let state = self.save();
        let token = self.next_token();
        self.restore(state);
        token
    }

    pub fn next_token(&mut self) -> Token {
        if self.state.pending_dedents > 0 {
            self.state.pending_dedents -= 1;
            return self.layout_token(TokenKind::Dedent);
        }
        if self.state.at_line_start && self.layout_active() {
            self.state.at_line_start = false;
            if let Some(token) = self.measure_indent() {
                return token;
            }
        }
        self.skip_trivia();
        let Some(ch) = self.current() else {
            return self.eof_token();
        };
        if ch == '\n' {
            self.bump();
            self.state.at_line_start = true;
            if self.state.line_has_token {
                self.state.line_has_token = false;
                return self.layout_token(TokenKind::Newline);
            }
            return self.next_token();
        }
        self.state.line_has_token = true;
        self.scan_token()
    }

    fn layout_active(&self) -> bool {
        self.state.bracket_depth == 0 && self.state.interp_stack.is_empty()
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file.clone(), self.state.line, self.state.column)
    }

    fn layout_token(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            lexeme: String::new(),
            loc: self.loc(),
        }
    }

    fn eof_token(&mut self) -> Token {
        if self.state.line_has_token {
            self.state.line_has_token = false;
            return self.layout_token(TokenKind::Newline);
        }
        if self.state.indent_stack.len() > 1 {
            self.state.indent_stack.pop();
            return self.layout_token(TokenKind::Dedent);
        }
        self.layout_token(TokenKind::Eof)
    }

    /// Handles the start of a physical line: skips blank and comment-only
    /// lines, then compares the indentation against the stack.
    fn measure_indent(&mut self) -> Option<Token> {
        loop {
            let mut width = 0usize;
            while let Some(ch) = self.current() {
                match ch {
                    ' ' => width += 1,
                    '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                    '\r' => {}
                    _ => break,
                }
                self.bump();
            }
            match self.current() {
                None => return None,
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    self.skip_line_comment();
                    continue;
                }
                Some('/') if self.next_char() == Some('*') => {
                    self.skip_block_comment();
                    self.skip_inline_space();
                    if matches!(self.current(), None | Some('\n') | Some('#')) {
                        continue;
                    }
                }
                _ => {}
            }

            let top = self.state.indent_stack.last().copied().unwrap_or(0);
            if width > top {
                self.state.indent_stack.push(width);
                return Some(self.layout_token(TokenKind::Indent));
            }
            if width < top {
                let mut popped = 0usize;
                while self.state.indent_stack.len() > 1
                    && self.state.indent_stack.last().copied().unwrap_or(0) > width
                {
                    self.state.indent_stack.pop();
                    popped += 1;
                }
                let landed = self.state.indent_stack.last().copied().unwrap_or(0);
                if landed != width {
                    self.state.pending_dedents = popped;
                    return Some(self.error_token(
                        self.state.pos,
                        self.loc(),
                        "Inconsistent indentation".to_string(),
                    ));
                }
                self.state.pending_dedents = popped - 1;
                return Some(self.layout_token(TokenKind::Dedent));
            }
            return None;
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.current() {
                Some(' ') | Some('\t') | Some('\r') => self.bump(),
                Some('\n') if !self.layout_active() => self.bump(),
                Some('#') => self.skip_line_comment(),
                Some('/') if self.next_char() == Some('*') => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.current(), Some(' ') | Some('\t') | Some('\r')) {
            self.bump();
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) {
        self.bump();
        self.bump();
        while let Some(ch) = self.current() {
            if ch == '*' && self.next_char() == Some('/') {
                self.bump();
                self.bump();
                return;
            }
            self.bump();
        }
    }

    fn scan_token(&mut self) -> Token {
        let start = self.state.pos;
        let loc = self.loc();
        let Some(ch) = self.current() else {
            return self.eof_token();
        };

        if is_ident_start(ch) {
            return self.ident_or_keyword(start, loc);
        }
        if ch.is_ascii_digit() {
            return self.number(start, loc);
        }
        if ch == '"' {
            self.bump();
            return self.string_segment(start, loc, true);
        }

        self.bump();
        let kind = match ch {
            '(' | '[' => {
                self.state.bracket_depth += 1;
                if ch == '(' {
                    TokenKind::LParen
                } else {
                    TokenKind::LBracket
                }
            }
            ')' => {
                self.state.bracket_depth = self.state.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            ']' => {
                self.state.bracket_depth = self.state.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            '{' => {
                if let Some(depth) = self.state.interp_stack.last_mut() {
                    *depth += 1;
                }
                self.state.bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                if let Some(depth) = self.state.interp_stack.last_mut() {
                    if *depth == 0 {
                        self.state.interp_stack.pop();
                        return self.string_segment(start, loc, false);
                    }
                    *depth -= 1;
                }
                self.state.bracket_depth = self.state.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '+' => TokenKind::Plus,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '@' => TokenKind::At,
            '?' => TokenKind::Question,
            '<' => {
                if self.eat('-') {
                    TokenKind::Bind
                } else if self.eat('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '=' => {
                if self.eat('=') {
                    TokenKind::EqualEqual
                } else if self.eat('>') {
                    TokenKind::FatArrow
                } else {
                    TokenKind::Equals
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::BangEqual
                } else {
                    return self.error_token(start, loc, "Unexpected character '!'".to_string());
                }
            }
            '-' => {
                if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '|' => {
                if self.eat('>') {
                    TokenKind::PipeGreater
                } else {
                    TokenKind::Bar
                }
            }
            '*' => {
                if self.eat('*') {
                    TokenKind::StarStar
                } else {
                    TokenKind::Star
                }
            }
            '.' => {
                if self.eat('.') {
                    if self.eat('.') {
                        TokenKind::Ellipsis
                    } else if self.eat('=') {
                        TokenKind::DotDotEqual
                    } else {
                        TokenKind::DotDot
                    }
                } else {
                    TokenKind::Dot
                }
            }
            other => {
                return self.error_token(start, loc, format!("Unexpected character '{other}'"));
            }
        };
        self.token(kind, start, loc)
    }

    fn ident_or_keyword(&mut self, start: usize, loc: SourceLoc) -> Token {
        while let Some(ch) = self.current() {
            if !is_ident_continue(ch) {
                break;
            }
            self.bump();
        }
        let text = &self.source[start..self.state.pos];
        let kind = keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()));
        self.token(kind, start, loc)
    }

    fn number(&mut self, start: usize, loc: SourceLoc) -> Token {
        let radix = if self.current() == Some('0') {
            match self.next_char() {
                Some('x') | Some('X') => Some(16),
                Some('b') | Some('B') => Some(2),
                Some('o') | Some('O') => Some(8),
                _ => None,
            }
        } else {
            None
        };

        if let Some(radix) = radix {
            self.bump();
            self.bump();
            let digits_start = self.state.pos;
            while let Some(ch) = self.current() {
                if ch == '_' || ch.is_digit(radix) {
                    self.bump();
                } else {
                    break;
                }
            }
            let digits: String = self.source[digits_start..self.state.pos]
                .chars()
                .filter(|ch| *ch != '_')
                .collect();
            return match i64::from_str_radix(&digits, radix) {
                Ok(value) => self.token(TokenKind::Int(value), start, loc),
                Err(_) => self.error_token(start, loc, "Invalid number literal".to_string()),
            };
        }

        self.eat_digits();
        let mut is_float = false;
        if self.current() == Some('.') && self.next_char().is_some_and(|ch| ch.is_ascii_digit()) {
            is_float = true;
            self.bump();
            self.eat_digits();
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let after = self.source[self.state.pos..].chars().nth(1);
            let after_sign = self.source[self.state.pos..].chars().nth(2);
            let has_exponent = after.is_some_and(|ch| ch.is_ascii_digit())
                || (matches!(after, Some('+') | Some('-'))
                    && after_sign.is_some_and(|ch| ch.is_ascii_digit()));
            if has_exponent {
                is_float = true;
                self.bump();
                if matches!(self.current(), Some('+') | Some('-')) {
                    self.bump();
                }
                self.eat_digits();
            }
        }

        let text: String = self.source[start..self.state.pos]
            .chars()
            .filter(|ch| *ch != '_')
            .collect();
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => self.token(TokenKind::Float(value), start, loc),
                Err(_) => self.error_token(start, loc, "Invalid number literal".to_string()),
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => self.token(TokenKind::Int(value), start, loc),
                Err(_) => self.error_token(start, loc, "Integer literal out of range".to_string()),
            }
        }
    }

    fn eat_digits(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() || ch == '_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// Scans string text up to the closing quote or the next interpolation.
    /// `opening` is true right after a `"`, false after an interpolation's `}`.
    fn string_segment(&mut self, start: usize, loc: SourceLoc, opening: bool) -> Token {
        let mut value = String::new();
        loop {
            let Some(ch) = self.current() else {
                return self.error_token(start, loc, "Unterminated string".to_string());
            };
            match ch {
                '"' => {
                    self.bump();
                    let kind = if opening {
                        TokenKind::String(value)
                    } else {
                        TokenKind::StringEnd(value)
                    };
                    return self.token(kind, start, loc);
                }
                '\\' => {
                    self.bump();
                    let escaped = match self.current() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('{') => '{',
                        Some('}') => '}',
                        Some(other) => {
                            self.bump();
                            return self.error_token(
                                start,
                                loc,
                                format!("Invalid escape sequence '\\{other}'"),
                            );
                        }
                        None => {
                            return self.error_token(start, loc, "Unterminated string".to_string());
                        }
                    };
                    self.bump();
                    value.push(escaped);
                }
                '{' if self.next_char() != Some('"') => {
                    self.bump();
                    self.state.interp_stack.push(0);
                    let kind = if opening {
                        TokenKind::StringBegin(value)
                    } else {
                        TokenKind::StringMid(value)
                    };
                    return self.token(kind, start, loc);
                }
                other => {
                    value.push(other);
                    self.bump();
                }
            }
        }
    }

    fn token(&self, kind: TokenKind, start: usize, loc: SourceLoc) -> Token {
        Token {
            kind,
            lexeme: self.source[start..self.state.pos].to_string(),
            loc,
        }
    }

    fn error_token(&self, start: usize, loc: SourceLoc, message: String) -> Token {
        Token {
            kind: TokenKind::Error(message),
            lexeme: self.source[start..self.state.pos].to_string(),
            loc,
        }
    }

    fn current(&self) -> Option<char> {
        self.source[self.state.pos..].chars().next()
    }

    fn next_char(&self) -> Option<char> {
        let mut chars = self.source[self.state.pos..].chars();
        chars.next();
        chars.next()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.current() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn bump(&mut self) {
        if let Some(ch) = self.current() {
            self.state.pos += ch.len_utf8();
            if ch == '\n' {
                self.state.line += 1;
                self.state.column = 1;
            } else {
                self.state.column += 1;
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.state.done {
            return None;
        }
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            self.state.done = true;
        }
        Some(token)
    }
}

pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new(source).collect()
}

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "_" => TokenKind::Underscore,
        "after" => TokenKind::After,
        "and" => TokenKind::And,
        "as" => TokenKind::As,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "defer" => TokenKind::Defer,
        "derive" => TokenKind::Derive,
        "do" => TokenKind::Do,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "fn" => TokenKind::Fn,
        "for" => TokenKind::For,
        "if" => TokenKind::If,
        "impl" => TokenKind::Impl,
        "import" => TokenKind::Import,
        "in" => TokenKind::In,
        "let" => TokenKind::Let,
        "loop" => TokenKind::Loop,
        "match" => TokenKind::Match,
        "module" => TokenKind::Module,
        "newtype" => TokenKind::Newtype,
        "not" => TokenKind::Not,
        "or" => TokenKind::Or,
        "pub" => TokenKind::Pub,
        "receive" => TokenKind::Receive,
        "return" => TokenKind::Return,
        "send" => TokenKind::Send,
        "spawn" => TokenKind::Spawn,
        "trait" => TokenKind::Trait,
        "true" => TokenKind::True,
        "type" => TokenKind::Type,
        "where" => TokenKind::Where,
        "while" => TokenKind::While,
        "with" => TokenKind::With,
        _ => return None,
    };
    Some(kind)
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_alphabetic()
}

fn is_ident_continue(ch: char) -> bool {
    ch == '_' || ch.is_alphanumeric()
}
