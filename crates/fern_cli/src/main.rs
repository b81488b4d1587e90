use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use fern_check::Checker;
use fern_parser::parse_program;
use fern_repl::ReplConfig;
use fern_syntax::{validate_program, Diagnostic};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fern", version, about = "Fern language front end")]
struct Cli {
    /// When to color diagnostics.
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
    /// Log more; repeat for trace output.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, validate and type-check source files.
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the syntax tree of a file as JSON.
    Parse {
        file: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Start the interactive REPL.
    Repl,
    /// Serve the language server protocol on stdin/stdout.
    Lsp,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn enabled(self) -> bool {
        match self {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => {
                if std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()) {
                    false
                } else if std::env::var_os("FORCE_COLOR").is_some_and(|value| !value.is_empty()) {
                    true
                } else {
                    std::io::stderr().is_terminal()
                }
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FERN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let color = cli.color.enabled();

    match cli.command {
        Command::Check { files } => {
            let mut failed = false;
            for file in &files {
                failed |= !check_file(file, color);
            }
            if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Parse { file, pretty } => parse_file(&file, pretty, color),
        Command::Repl => match fern_repl::run(&ReplConfig::default(), color) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        },
        Command::Lsp => match fern_lsp::run_stdio() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(%err, "language server failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn read_source(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", path.display());
            None
        }
    }
}

/// Returns true when the file has no errors.
fn check_file(path: &Path, color: bool) -> bool {
    let Some(source) = read_source(path) else {
        return false;
    };
    let name = path.display().to_string();
    tracing::info!(file = %name, "checking");
    let (program, parse_errors) = parse_program(&source, &name);
    if !parse_errors.is_empty() {
        for error in &parse_errors {
            eprint!("{}", error.to_diagnostic().render(&source, color));
        }
        return false;
    }
    if let Err(error) = validate_program(&program) {
        let diagnostic = Diagnostic::error(error.message, Some(error.loc));
        eprint!("{}", diagnostic.render(&source, color));
        return false;
    }
    let mut checker = Checker::new();
    if checker.check_program(&program) {
        return true;
    }
    for error in checker.errors() {
        eprint!("{}", error.to_diagnostic().render(&source, color));
    }
    false
}

fn parse_file(path: &Path, pretty: bool, color: bool) -> ExitCode {
    let Some(source) = read_source(path) else {
        return ExitCode::FAILURE;
    };
    let (program, errors) = parse_program(&source, &path.display().to_string());
    if !errors.is_empty() {
        for error in &errors {
            eprint!("{}", error.to_diagnostic().render(&source, color));
        }
        return ExitCode::FAILURE;
    }
    let json = if pretty {
        serde_json::to_string_pretty(&program)
    } else {
        serde_json::to_string(&program)
    };
    match json {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: cannot serialize syntax tree: {err}");
            ExitCode::FAILURE
        }
    }
}
