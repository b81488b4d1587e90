use std::io::{self, Write};
use std::path::PathBuf;

use fern_check::{Checker, BUILTINS, KEYWORDS};
use fern_parser::{parse_expr_in, parse_stmt_in, ParseError};
use fern_syntax::StmtKind;
use rustyline::completion::Completer;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};

const FILE_NAME: &str = "<repl>";

const STATEMENT_STARTS: &[&str] = &["let", "fn", "pub", "type", "import"];

#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("line editor: {0}")]
    Readline(#[from] rustyline::error::ReadlineError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ReplConfig {
    pub prompt: String,
    pub history_path: Option<PathBuf>,
    pub history_max: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "fern> ".to_string(),
            history_path: std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".fern_history")),
            history_max: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

/// An interactive session. The checker lives as long as the session, so
/// bindings from earlier lines stay visible.
pub struct Repl {
    checker: Checker,
    color: bool,
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

impl Repl {
    pub fn new() -> Self {
        Self {
            checker: Checker::new(),
            color: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    /// Evaluates one input line, writing results and diagnostics to `out`.
    pub fn eval_line(&mut self, line: &str, out: &mut dyn Write) -> io::Result<Outcome> {
        self.checker.clear_errors();
        let line = line.trim();
        if line.is_empty() {
            return Ok(Outcome::Continue);
        }
        if let Some(command) = line.strip_prefix(':') {
            return self.command(command, out);
        }
        let first_word = line
            .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
            .next()
            .unwrap_or_default();
        if STATEMENT_STARTS.contains(&first_word) {
            self.statement(line, out)?;
        } else {
            self.expression(line, out)?;
        }
        Ok(Outcome::Continue)
    }

    fn statement(&mut self, line: &str, out: &mut dyn Write) -> io::Result<()> {
        let stmt = match parse_stmt_in(line, FILE_NAME) {
            Ok(stmt) => stmt,
            Err(errors) => return self.report_parse(line, &errors, out),
        };
        if !self.checker.check_stmt(&stmt) {
            return self.report_type_error(line, out);
        }
        match &stmt.kind {
            StmtKind::Let { pattern, .. } => {
                for name in pattern.binders() {
                    if let Some(ty) = self.checker.describe(name) {
                        writeln!(out, "{name} : {ty}")?;
                    }
                }
            }
            StmtKind::Fn(def) => writeln!(out, "fn {} defined", def.name)?,
            StmtKind::TypeDef(def) => writeln!(out, "type {} defined", def.name)?,
            StmtKind::Newtype { name, .. } => writeln!(out, "type {name} defined")?,
            StmtKind::Import { path, items, alias } => {
                let names = if items.is_empty() {
                    alias.iter().chain(path.last()).take(1).cloned().collect()
                } else {
                    items.clone()
                };
                for name in names {
                    if let Some(ty) = self.checker.describe(&name) {
                        writeln!(out, "{name} : {ty}")?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn expression(&mut self, line: &str, out: &mut dyn Write) -> io::Result<()> {
        let expr = match parse_expr_in(line, FILE_NAME) {
            Ok(expr) => expr,
            Err(errors) => return self.report_parse(line, &errors, out),
        };
        let ty = self.checker.infer_expr(&expr);
        if self.checker.has_errors() {
            return self.report_type_error(line, out);
        }
        let ty = self.checker.type_to_string(ty);
        if expr.is_literal() {
            writeln!(out, "{line} : {ty}")
        } else {
            writeln!(out, "<expr> : {ty}")
        }
    }

    fn command(&mut self, command: &str, out: &mut dyn Write) -> io::Result<Outcome> {
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));
        tracing::debug!(command = name, "repl command");
        match name {
            "quit" | "q" => {
                writeln!(out, "Goodbye!")?;
                return Ok(Outcome::Quit);
            }
            "help" | "h" => write!(out, "{HELP}")?,
            "clear" => write!(out, "\x1b[2J\x1b[H")?,
            "type" | "t" if rest.is_empty() => writeln!(out, "usage: :type <expression>")?,
            "type" | "t" => {
                let expr = match parse_expr_in(rest, FILE_NAME) {
                    Ok(expr) => expr,
                    Err(errors) => {
                        self.report_parse(rest, &errors, out)?;
                        return Ok(Outcome::Continue);
                    }
                };
                let ty = self.checker.infer_expr(&expr);
                if self.checker.has_errors() {
                    self.report_type_error(rest, out)?;
                } else {
                    writeln!(out, "{}", self.checker.type_to_string(ty))?;
                }
            }
            _ => {
                writeln!(out, "unknown command: :{name}")?;
                writeln!(out, "Type :help for available commands")?;
            }
        }
        Ok(Outcome::Continue)
    }

    fn report_parse(
        &self,
        source: &str,
        errors: &[ParseError],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if let Some(error) = errors.first() {
            write!(out, "{}", error.to_diagnostic().render(source, self.color))?;
        }
        Ok(())
    }

    fn report_type_error(&mut self, source: &str, out: &mut dyn Write) -> io::Result<()> {
        if let Some(error) = self.checker.first_error() {
            write!(out, "{}", error.to_diagnostic().render(source, self.color))?;
        }
        self.checker.clear_errors();
        Ok(())
    }
}

const HELP: &str = "\
Fern REPL Commands:
  :help, :h     Show this help message
  :quit, :q     Exit the REPL
  :type <expr>  Show the type of an expression
  :clear        Clear the screen

Examples:
  1 + 2              Check an expression
  let x = 42         Define a variable
  fn add(a, b): a+b  Define a function
  :type x + 1        Show a type
";

/// Completes keywords and builtin names under the cursor.
pub struct FernHelper;

impl FernHelper {
    pub fn candidates(prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return Vec::new();
        }
        KEYWORDS
            .iter()
            .chain(BUILTINS)
            .filter(|word| word.starts_with(prefix))
            .map(|word| word.to_string())
            .collect()
    }
}

impl Completer for FernHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let head = line.get(..pos).unwrap_or(line);
        let start = head
            .char_indices()
            .rev()
            .find(|(_, ch)| !(ch.is_alphanumeric() || *ch == '_'))
            .map_or(0, |(idx, ch)| idx + ch.len_utf8());
        Ok((start, Self::candidates(&head[start..])))
    }
}

impl Hinter for FernHelper {
    type Hint = String;
}

impl Highlighter for FernHelper {}

impl Validator for FernHelper {}

impl Helper for FernHelper {}

/// Runs the interactive loop on the terminal until `:quit` or end of input.
pub fn run(config: &ReplConfig, color: bool) -> Result<(), ReplError> {
    let editor_config = rustyline::Config::builder()
        .max_history_size(config.history_max)?
        .auto_add_history(false)
        .build();
    let mut rl: Editor<FernHelper, DefaultHistory> = Editor::with_config(editor_config)?;
    rl.set_helper(Some(FernHelper));
    if let Some(path) = config.history_path.as_ref() {
        if let Err(err) = rl.load_history(path) {
            tracing::debug!(path = %path.display(), %err, "no history loaded");
        }
    }

    let mut stdout = io::stdout();
    writeln!(stdout, "Fern {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(stdout, "Type :help for help, :quit to exit\n")?;

    let mut repl = Repl::new().with_color(color);
    loop {
        let line = match rl.readline(&config.prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => {
                writeln!(stdout)?;
                break;
            }
            Err(err) => return Err(err.into()),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        rl.add_history_entry(trimmed)?;
        if repl.eval_line(trimmed, &mut stdout)? == Outcome::Quit {
            break;
        }
        stdout.flush()?;
    }

    if let Some(path) = config.history_path.as_ref() {
        if let Err(err) = rl.save_history(path) {
            tracing::warn!(path = %path.display(), %err, "failed to save history");
        }
    }
    Ok(())
}
