use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;

use fern_check::{Checker, BUILTINS, KEYWORDS};
use fern_parser::{parse_program, ParseError};
use fern_syntax::{Program, SourceLoc, StmtKind};
use lsp_server::{ErrorCode, Message, Notification, Request, RequestId, Response};
use lsp_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, CodeActionParams,
    CodeActionProviderCapability, Command, CompletionItem, CompletionItemKind, CompletionOptions,
    CompletionParams, CompletionResponse, Diagnostic, DiagnosticSeverity,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverContents, HoverParams,
    HoverProviderCapability, InitializeResult, Location, MarkupContent, MarkupKind, OneOf,
    Position, PublishDiagnosticsParams, Range, RenameParams, ServerCapabilities, ServerInfo,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextEdit, Uri, WorkspaceEdit,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

const MODULES: &[&str] = &[
    "String", "List", "File", "System", "Regex", "json", "http", "sql", "actors",
];

const MAX_COMPLETIONS: usize = 160;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// An open text document and the results of its last analysis.
pub struct Document {
    pub text: String,
    pub version: i32,
    pub program: Program,
    pub parse_errors: Vec<ParseError>,
    pub checker: Checker,
    pub has_errors: bool,
}

impl Document {
    pub fn analyze(uri: &Uri, text: String, version: i32) -> Self {
        let (program, parse_errors) = parse_program(&text, uri.as_str());
        let mut checker = Checker::new();
        checker.check_program(&program);
        let has_errors = !parse_errors.is_empty() || checker.has_errors();
        tracing::debug!(
            uri = uri.as_str(),
            version,
            parse_errors = parse_errors.len(),
            type_errors = checker.errors().len(),
            "analyzed document"
        );
        Self {
            text,
            version,
            program,
            parse_errors,
            checker,
            has_errors,
        }
    }

    /// The message and location of the error to surface: the first parse
    /// error, otherwise the first type error.
    pub fn first_error(&self) -> Option<(String, Option<SourceLoc>)> {
        if let Some(error) = self.parse_errors.first() {
            return Some((error.message(), Some(error.loc().clone())));
        }
        self.checker
            .first_error()
            .map(|error| (error.message.clone(), error.loc.clone()))
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let Some((message, loc)) = self.first_error() else {
            return Vec::new();
        };
        let start = match loc {
            Some(loc) => loc_to_position(&loc),
            None => location_in_message(&message)
                .map(|(line, column)| {
                    Position::new(line.saturating_sub(1), column.saturating_sub(1))
                })
                .unwrap_or_default(),
        };
        let end = Position::new(start.line, start.character + 1);
        vec![Diagnostic {
            range: Range::new(start, end),
            severity: Some(DiagnosticSeverity::ERROR),
            source: Some("fern".to_string()),
            message,
            ..Diagnostic::default()
        }]
    }
}

pub struct Server {
    documents: HashMap<Uri, Document>,
    shutdown_requested: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            documents: HashMap::new(),
            shutdown_requested: false,
        }
    }

    pub fn document(&self, uri: &Uri) -> Option<&Document> {
        self.documents.get(uri)
    }

    pub fn capabilities() -> ServerCapabilities {
        ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            definition_provider: Some(OneOf::Left(true)),
            completion_provider: Some(CompletionOptions::default()),
            rename_provider: Some(OneOf::Left(true)),
            code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
            ..ServerCapabilities::default()
        }
    }

    /// Handles one incoming message, pushing any replies onto `out`.
    /// Breaks when the client sends `exit`.
    pub fn handle(&mut self, message: Message, out: &mut Vec<Message>) -> ControlFlow<()> {
        match message {
            Message::Request(request) => {
                tracing::debug!(method = %request.method, "request");
                out.push(Message::Response(self.handle_request(request)));
            }
            Message::Notification(notification) => {
                tracing::debug!(method = %notification.method, "notification");
                if notification.method == "exit" {
                    return ControlFlow::Break(());
                }
                self.handle_notification(notification, out);
            }
            Message::Response(_) => {}
        }
        ControlFlow::Continue(())
    }

    fn handle_request(&mut self, request: Request) -> Response {
        let Request { id, method, params } = request;
        if self.shutdown_requested {
            return Response::new_err(
                id,
                ErrorCode::InvalidRequest as i32,
                "server is shutting down".to_string(),
            );
        }
        match method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    capabilities: Self::capabilities(),
                    server_info: Some(ServerInfo {
                        name: "fern-lsp".to_string(),
                        version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    }),
                };
                Response::new_ok(id, result)
            }
            "shutdown" => {
                self.shutdown_requested = true;
                Response::new_ok(id, serde_json::Value::Null)
            }
            "textDocument/hover" => self.respond(id, params, |server, params: HoverParams| {
                let position = params.text_document_position_params;
                server.hover(&position.text_document.uri, position.position)
            }),
            "textDocument/definition" => {
                self.respond(id, params, |server, params: GotoDefinitionParams| {
                    let position = params.text_document_position_params;
                    server.definition(&position.text_document.uri, position.position)
                })
            }
            "textDocument/completion" => {
                self.respond(id, params, |server, params: CompletionParams| {
                    let position = params.text_document_position;
                    server.completion(&position.text_document.uri, position.position)
                })
            }
            "textDocument/rename" => {
                let params: RenameParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(err) => return invalid_params(id, err),
                };
                if !is_valid_identifier(&params.new_name) {
                    return Response::new_err(
                        id,
                        ErrorCode::InvalidParams as i32,
                        format!("'{}' is not a valid identifier", params.new_name),
                    );
                }
                let position = params.text_document_position;
                let edit = self.rename(
                    &position.text_document.uri,
                    position.position,
                    &params.new_name,
                );
                Response::new_ok(id, edit)
            }
            "textDocument/codeAction" => {
                self.respond(id, params, |server, params: CodeActionParams| {
                    server.code_actions(&params.text_document.uri)
                })
            }
            _ => {
                tracing::debug!(%method, "unknown request");
                Response::new_err(
                    id,
                    ErrorCode::MethodNotFound as i32,
                    format!("unknown request: {method}"),
                )
            }
        }
    }

    fn respond<P, R>(
        &mut self,
        id: RequestId,
        params: serde_json::Value,
        provide: impl FnOnce(&mut Self, P) -> R,
    ) -> Response
    where
        P: DeserializeOwned,
        R: Serialize,
    {
        match serde_json::from_value(params) {
            Ok(params) => Response::new_ok(id, provide(self, params)),
            Err(err) => invalid_params(id, err),
        }
    }

    fn handle_notification(&mut self, notification: Notification, out: &mut Vec<Message>) {
        match notification.method.as_str() {
            "textDocument/didOpen" => {
                let Some(params) = decode::<DidOpenTextDocumentParams>(notification.params) else {
                    return;
                };
                let item = params.text_document;
                self.open(item.uri, item.text, item.version, out);
            }
            "textDocument/didChange" => {
                let Some(params) = decode::<DidChangeTextDocumentParams>(notification.params)
                else {
                    return;
                };
                let uri = params.text_document.uri;
                let text = match params.content_changes.into_iter().last() {
                    Some(change) => change.text,
                    None => self
                        .documents
                        .get(&uri)
                        .map(|doc| doc.text.clone())
                        .unwrap_or_default(),
                };
                self.open(uri, text, params.text_document.version, out);
            }
            "textDocument/didClose" => {
                let Some(params) = decode::<DidCloseTextDocumentParams>(notification.params) else {
                    return;
                };
                let uri = params.text_document.uri;
                self.documents.remove(&uri);
                out.push(publish(uri, Vec::new(), None));
            }
            _ => {}
        }
    }

    fn open(&mut self, uri: Uri, text: String, version: i32, out: &mut Vec<Message>) {
        let document = Document::analyze(&uri, text, version);
        let diagnostics = document.diagnostics();
        self.documents.insert(uri.clone(), document);
        out.push(publish(uri, diagnostics, Some(version)));
    }

    pub fn hover(&self, uri: &Uri, position: Position) -> Option<Hover> {
        let doc = self.documents.get(uri)?;
        let (name, range) = ident_at(&doc.text, position)?;
        let ty = doc.checker.describe(&name)?;
        Some(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: format!("```fern\n{name} : {ty}\n```"),
            }),
            range: Some(range),
        })
    }

    pub fn definition(&self, uri: &Uri, position: Position) -> Option<GotoDefinitionResponse> {
        let doc = self.documents.get(uri)?;
        let (name, _) = ident_at(&doc.text, position)?;
        let def_loc = doc.program.stmts.iter().find_map(|stmt| match &stmt.kind {
            StmtKind::Fn(def) if def.name == name => Some(&def.loc),
            _ => None,
        })?;
        let start = loc_to_position(def_loc);
        let line = doc.text.lines().nth(start.line as usize).unwrap_or_default();
        let start = name_after(line, &name, start.character)
            .map_or(start, |character| Position::new(start.line, character));
        let end = Position::new(start.line, start.character + utf16_len(&name));
        Some(GotoDefinitionResponse::Scalar(Location::new(
            uri.clone(),
            Range::new(start, end),
        )))
    }

    pub fn completion(&self, uri: &Uri, position: Position) -> Option<CompletionResponse> {
        let doc = self.documents.get(uri)?;
        let prefix = prefix_at(&doc.text, position);
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut offer = |label: &str, kind: CompletionItemKind, detail: Option<String>| {
            if items.len() < MAX_COMPLETIONS
                && prefix_matches(label, &prefix)
                && seen.insert(label.to_string())
            {
                items.push(CompletionItem {
                    label: label.to_string(),
                    kind: Some(kind),
                    detail,
                    ..CompletionItem::default()
                });
            }
        };

        for keyword in KEYWORDS.iter().copied() {
            offer(keyword, CompletionItemKind::KEYWORD, None);
        }
        for module in MODULES.iter().copied() {
            offer(module, CompletionItemKind::MODULE, None);
        }
        for stmt in &doc.program.stmts {
            match &stmt.kind {
                StmtKind::Fn(def) => {
                    let detail = doc.checker.describe(&def.name);
                    offer(def.name.as_str(), CompletionItemKind::FUNCTION, detail);
                }
                StmtKind::Let { pattern, .. } => {
                    for name in pattern.binders() {
                        offer(name, CompletionItemKind::VARIABLE, doc.checker.describe(name));
                    }
                }
                _ => {}
            }
        }
        for builtin in BUILTINS.iter().copied() {
            offer(builtin, CompletionItemKind::FUNCTION, Some("builtin".to_string()));
        }
        Some(CompletionResponse::Array(items))
    }

    pub fn rename(&self, uri: &Uri, position: Position, new_name: &str) -> Option<WorkspaceEdit> {
        let doc = self.documents.get(uri)?;
        let (old_name, _) = ident_at(&doc.text, position)?;
        let edits: Vec<TextEdit> = identifier_ranges(&doc.text, &old_name)
            .into_iter()
            .map(|range| TextEdit::new(range, new_name.to_string()))
            .collect();
        let mut changes = HashMap::new();
        changes.insert(uri.clone(), edits);
        Some(WorkspaceEdit {
            changes: Some(changes),
            ..WorkspaceEdit::default()
        })
    }

    pub fn code_actions(&self, uri: &Uri) -> Option<Vec<CodeActionOrCommand>> {
        let doc = self.documents.get(uri)?;
        let mut actions = Vec::new();
        let first = doc.first_error();
        let arguments = Some(vec![serde_json::Value::String(uri.as_str().to_string())]);
        if doc.has_errors
            && first
                .as_ref()
                .is_some_and(|(message, _)| message.contains("Unhandled Result value"))
        {
            let title = "Handle Result value (match/with/?)".to_string();
            actions.push(CodeActionOrCommand::CodeAction(CodeAction {
                title: title.clone(),
                kind: Some(CodeActionKind::QUICKFIX),
                command: Some(Command::new(
                    title,
                    "fern.handleResult".to_string(),
                    arguments.clone(),
                )),
                ..CodeAction::default()
            }));
        }
        let title = "Show Fern diagnostic details".to_string();
        actions.push(CodeActionOrCommand::CodeAction(CodeAction {
            title: title.clone(),
            kind: Some(CodeActionKind::EMPTY),
            command: Some(Command::new(title, "fern.showDiagnostic".to_string(), arguments)),
            ..CodeAction::default()
        }));
        Some(actions)
    }
}

/// Serves messages from `reader` until `exit` or end of input.
pub fn run<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> Result<(), LspError> {
    let mut server = Server::new();
    let mut outgoing = Vec::new();
    while let Some(message) = Message::read(reader)? {
        let flow = server.handle(message, &mut outgoing);
        for message in outgoing.drain(..) {
            message.write(writer)?;
        }
        writer.flush()?;
        if flow.is_break() {
            break;
        }
    }
    tracing::info!("language server stopped");
    Ok(())
}

pub fn run_stdio() -> Result<(), LspError> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run(&mut stdin.lock(), &mut stdout.lock())
}

fn decode<P: DeserializeOwned>(params: serde_json::Value) -> Option<P> {
    match serde_json::from_value(params) {
        Ok(params) => Some(params),
        Err(err) => {
            tracing::warn!(%err, "dropping notification with malformed params");
            None
        }
    }
}

fn invalid_params(id: RequestId, err: serde_json::Error) -> Response {
    Response::new_err(id, ErrorCode::InvalidParams as i32, err.to_string())
}

fn publish(uri: Uri, diagnostics: Vec<Diagnostic>, version: Option<i32>) -> Message {
    let params = PublishDiagnosticsParams {
        uri,
        diagnostics,
        version,
    };
    Message::Notification(Notification::new(
        "textDocument/publishDiagnostics".to_string(),
        params,
    ))
}

fn loc_to_position(loc: &SourceLoc) -> Position {
    Position::new(loc.line.saturating_sub(1), loc.column.saturating_sub(1))
}

/// Finds a `line:col:` location inside a message such as
/// `main.fn:3:7: Undefined variable: x`.
fn location_in_message(message: &str) -> Option<(u32, u32)> {
    message.match_indices(':').find_map(|(idx, _)| {
        let mut parts = message[idx + 1..].splitn(3, ':');
        let line = parts.next()?.parse().ok()?;
        let column = parts.next()?.parse().ok()?;
        parts.next()?;
        Some((line, column))
    })
    .or_else(|| {
        let mut parts = message.splitn(3, ':');
        let line = parts.next()?.parse().ok()?;
        let column = parts.next()?.parse().ok()?;
        parts.next()?;
        Some((line, column))
    })
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(is_ident_continue)
}

fn utf16_len(text: &str) -> u32 {
    text.chars().map(|ch| ch.len_utf16() as u32).sum()
}

/// Byte offset of a UTF-16 column within `line`, clamped to its end.
fn column_to_offset(line: &str, character: u32) -> usize {
    let mut units = 0;
    for (offset, ch) in line.char_indices() {
        if units >= character {
            return offset;
        }
        units += ch.len_utf16() as u32;
    }
    line.len()
}

/// The identifier under `position` and its range.
fn ident_at(text: &str, position: Position) -> Option<(String, Range)> {
    let line = text.lines().nth(position.line as usize)?;
    let offset = column_to_offset(line, position.character);
    let start = line[..offset]
        .char_indices()
        .rev()
        .take_while(|(_, ch)| is_ident_continue(*ch))
        .last()
        .map_or(offset, |(idx, _)| idx);
    let end = line[offset..]
        .char_indices()
        .find(|(_, ch)| !is_ident_continue(*ch))
        .map_or(line.len(), |(idx, _)| offset + idx);
    if start == end {
        return None;
    }
    let name = &line[start..end];
    if name.starts_with(|ch: char| ch.is_ascii_digit()) {
        return None;
    }
    let range = Range::new(
        Position::new(position.line, utf16_len(&line[..start])),
        Position::new(position.line, utf16_len(&line[..end])),
    );
    Some((name.to_string(), range))
}

fn prefix_at(text: &str, position: Position) -> String {
    let Some(line) = text.lines().nth(position.line as usize) else {
        return String::new();
    };
    let offset = column_to_offset(line, position.character);
    let head = &line[..offset];
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, ch)| is_ident_continue(*ch))
        .last()
        .map_or(offset, |(idx, _)| idx);
    head[start..].to_string()
}

/// The label starts with the prefix's first character and contains the rest
/// of it in order, so `ad` offers both `add` and `and`.
fn prefix_matches(label: &str, prefix: &str) -> bool {
    let mut wanted = prefix.chars();
    let Some(first) = wanted.next() else {
        return true;
    };
    let mut chars = label.chars();
    if chars.next() != Some(first) {
        return false;
    }
    wanted.all(|ch| chars.any(|candidate| candidate == ch))
}

/// Every occurrence of `name` as a whole identifier.
fn identifier_ranges(text: &str, name: &str) -> Vec<Range> {
    let mut ranges = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut search = 0;
        while let Some(found) = line[search..].find(name) {
            let start = search + found;
            let end = start + name.len();
            let before = line[..start].chars().next_back();
            let after = line[end..].chars().next();
            if !before.is_some_and(is_ident_continue) && !after.is_some_and(is_ident_continue) {
                let line_no = line_no as u32;
                ranges.push(Range::new(
                    Position::new(line_no, utf16_len(&line[..start])),
                    Position::new(line_no, utf16_len(&line[..end])),
                ));
            }
            search = end;
        }
    }
    ranges
}

/// UTF-16 column of the first whole-identifier `name` at or after `from`.
fn name_after(line: &str, name: &str, from: u32) -> Option<u32> {
    let offset = column_to_offset(line, from);
    let mut search = offset;
    while let Some(found) = line[search..].find(name) {
        let start = search + found;
        let end = start + name.len();
        let before = line[..start].chars().next_back();
        let after = line[end..].chars().next();
        if !before.is_some_and(is_ident_continue) && !after.is_some_and(is_ident_continue) {
            return Some(utf16_len(&line[..start]));
        }
        search = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::str::FromStr;

    fn doc_uri(path: &str) -> Uri {
        Uri::from_str(&format!("file:///tmp/{path}")).expect("valid uri")
    }

    fn open(server: &mut Server, uri: &Uri, text: &str) -> Vec<Message> {
        let params = DidOpenTextDocumentParams {
            text_document: lsp_types::TextDocumentItem {
                uri: uri.clone(),
                language_id: "fern".to_string(),
                version: 1,
                text: text.to_string(),
            },
        };
        let mut out = Vec::new();
        let notification = Notification::new("textDocument/didOpen".to_string(), params);
        let flow = server.handle(Message::Notification(notification), &mut out);
        assert!(flow.is_continue());
        out
    }

    fn published(messages: &[Message]) -> PublishDiagnosticsParams {
        let Some(Message::Notification(notification)) = messages.first() else {
            panic!("expected a notification, got {messages:?}");
        };
        assert_eq!(notification.method, "textDocument/publishDiagnostics");
        serde_json::from_value(notification.params.clone()).expect("diagnostic params")
    }

    fn request(server: &mut Server, id: i32, method: &str, params: serde_json::Value) -> Response {
        let mut out = Vec::new();
        let request = Request::new(RequestId::from(id), method.to_string(), params);
        server.handle(Message::Request(request), &mut out);
        match out.pop() {
            Some(Message::Response(response)) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn completion_labels(response: &Response) -> Vec<String> {
        let items: Vec<CompletionItem> =
            serde_json::from_value(response.result.clone().expect("result")).expect("items");
        items.into_iter().map(|item| item.label).collect()
    }

    fn frame(message: serde_json::Value) -> String {
        let body = message.to_string();
        format!("Content-Length: {}\r\n\r\n{body}", body.len())
    }

    #[test]
    fn publishes_declared_return_type_diagnostic() {
        let mut server = Server::new();
        let uri = doc_uri("main.fn");
        let out = open(&mut server, &uri, "fn main() -> Int:\n    \"oops\"\n");
        let params = published(&out);
        assert_eq!(params.diagnostics.len(), 1);
        let diagnostic = &params.diagnostics[0];
        assert_eq!(diagnostic.range.start.line, 1);
        assert!(diagnostic.range.start.character >= 4);
        assert!(diagnostic.message.contains("declared return type"));
        assert_eq!(diagnostic.source.as_deref(), Some("fern"));
        assert_eq!(diagnostic.severity, Some(DiagnosticSeverity::ERROR));
    }

    #[test]
    fn publishes_empty_diagnostics_for_clean_document() {
        let mut server = Server::new();
        let uri = doc_uri("clean.fn");
        let out = open(&mut server, &uri, "fn main() -> Int:\n    0\n");
        assert!(published(&out).diagnostics.is_empty());
        assert!(!server.document(&uri).expect("document").has_errors);
    }

    #[test]
    fn reports_parse_errors_before_type_errors() {
        let mut server = Server::new();
        let uri = doc_uri("broken.fn");
        let out = open(&mut server, &uri, "let x = \nlet y = missing\n");
        let params = published(&out);
        assert_eq!(params.diagnostics.len(), 1);
        assert!(!params.diagnostics[0].message.contains("Undefined variable"));
    }

    #[test]
    fn completes_functions_and_keywords_without_duplicates() {
        let mut server = Server::new();
        let uri = doc_uri("completion.fn");
        let source = "fn add(x: Int, y: Int) -> Int:\n    x + y\n\nfn main() -> Int:\n    ad\n";
        open(&mut server, &uri, source);
        let params = serde_json::json!({
            "textDocument": { "uri": uri.as_str() },
            "position": { "line": 4, "character": 6 },
        });
        let response = request(&mut server, 1, "textDocument/completion", params);
        let labels = completion_labels(&response);
        assert!(labels.contains(&"add".to_string()));
        assert!(labels.contains(&"and".to_string()));
        let unique: HashSet<&String> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());

        let params = serde_json::json!({
            "textDocument": { "uri": uri.as_str() },
            "position": { "line": 4, "character": 4 },
        });
        let response = request(&mut server, 2, "textDocument/completion", params);
        let everything = completion_labels(&response);
        assert!(everything.contains(&"fn".to_string()));
        assert!(everything.len() <= MAX_COMPLETIONS);
    }

    #[test]
    fn completes_let_binders() {
        let mut server = Server::new();
        let uri = doc_uri("binders.fn");
        open(&mut server, &uri, "let (alpha, [beta, ..rest]) = (1, [2])\nal\n");
        let params = serde_json::json!({
            "textDocument": { "uri": uri.as_str() },
            "position": { "line": 1, "character": 2 },
        });
        assert!(completion_labels(&request(&mut server, 1, "textDocument/completion", params))
            .contains(&"alpha".to_string()));
    }

    #[test]
    fn renames_definition_and_calls() {
        let mut server = Server::new();
        let uri = doc_uri("rename.fn");
        let source = "fn add(x: Int, y: Int) -> Int:\n    x + y\n\nfn main() -> Int:\n    add(1, 2)\n";
        open(&mut server, &uri, source);
        let edit = server
            .rename(&uri, Position::new(4, 5), "sum")
            .expect("workspace edit");
        let edits = &edit.changes.expect("changes")[&uri];
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].range.start, Position::new(0, 3));
        assert_eq!(edits[1].range.start, Position::new(4, 4));
        assert!(edits.iter().all(|edit| edit.new_text == "sum"));
    }

    fn apply_edits(text: &str, edits: &[TextEdit]) -> String {
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut edits = edits.to_vec();
        edits.sort_by_key(|edit| {
            std::cmp::Reverse((edit.range.start.line, edit.range.start.character))
        });
        for edit in edits {
            let line = &mut lines[edit.range.start.line as usize];
            let start = column_to_offset(line, edit.range.start.character);
            let end = column_to_offset(line, edit.range.end.character);
            line.replace_range(start..end, &edit.new_text);
        }
        lines.join("\n") + "\n"
    }

    #[test]
    fn renamed_document_uses_new_name_where_old_one_was() {
        let mut server = Server::new();
        let uri = doc_uri("rename_roundtrip.fn");
        let source = "fn total(xs: List(Int)) -> Int: list_len(xs)\nlet subtotal = 1\nfn main() -> Int:\n    total([subtotal])\n";
        open(&mut server, &uri, source);
        let before = identifier_ranges(source, "total");
        let edit = server
            .rename(&uri, Position::new(3, 6), "grand_total")
            .expect("workspace edit");
        let edits = &edit.changes.expect("changes")[&uri];
        let renamed = apply_edits(source, edits);

        let after = identifier_ranges(&renamed, "grand_total");
        let starts = |ranges: &[Range]| ranges.iter().map(|range| range.start).collect::<Vec<_>>();
        assert_eq!(starts(&after), starts(&before));
        assert!(identifier_ranges(&renamed, "total").is_empty());
        assert_eq!(identifier_ranges(&renamed, "subtotal").len(), 2);

        let document = Document::analyze(&uri, renamed, 2);
        assert!(document.parse_errors.is_empty());
        assert!(!document.has_errors, "{:?}", document.first_error());
    }

    #[test]
    fn analysis_is_repeatable() {
        let uri = doc_uri("repeat.fn");
        let sources = [
            "fn main() -> Int:\n    \"oops\"\n",
            "let x = missing + 1\nlet y = x * 2\n",
            "let x = \n",
            "fn main() -> Int: 0\n",
        ];
        for source in sources {
            let first = Document::analyze(&uri, source.to_string(), 1).diagnostics();
            let second = Document::analyze(&uri, source.to_string(), 1).diagnostics();
            assert_eq!(first, second, "{source}");
        }

        let mut server = Server::new();
        let first = published(&open(&mut server, &uri, sources[1])).diagnostics;
        let again = published(&open(&mut server, &uri, sources[1])).diagnostics;
        assert_eq!(first, again);
    }

    #[test]
    fn rejects_invalid_rename_target() {
        let mut server = Server::new();
        let uri = doc_uri("rename.fn");
        open(&mut server, &uri, "fn add(x: Int) -> Int: x\n");
        let params = serde_json::json!({
            "textDocument": { "uri": uri.as_str() },
            "position": { "line": 0, "character": 4 },
            "newName": "9lives",
        });
        let response = request(&mut server, 1, "textDocument/rename", params);
        let error = response.error.expect("error response");
        assert_eq!(error.code, ErrorCode::InvalidParams as i32);
    }

    #[test]
    fn offers_result_quickfix() {
        let mut server = Server::new();
        let uri = doc_uri("actions.fn");
        let source = "fn read(path: String) -> Result(String, String): Ok(path)\nfn main() -> Int:\n    read(\"notes.txt\")\n    0\n";
        open(&mut server, &uri, source);
        let actions = server.code_actions(&uri).expect("actions");
        let titles: Vec<String> = actions
            .into_iter()
            .map(|action| match action {
                CodeActionOrCommand::CodeAction(action) => action.title,
                CodeActionOrCommand::Command(command) => command.title,
            })
            .collect();
        assert!(titles.contains(&"Handle Result value (match/with/?)".to_string()));
        assert!(titles.contains(&"Show Fern diagnostic details".to_string()));

        let clean = doc_uri("clean.fn");
        open(&mut server, &clean, "let x = 1\n");
        assert_eq!(server.code_actions(&clean).expect("actions").len(), 1);
    }

    #[test]
    fn hovers_with_type() {
        let mut server = Server::new();
        let uri = doc_uri("hover.fn");
        open(&mut server, &uri, "let answer = 42\n");
        let hover = server.hover(&uri, Position::new(0, 6)).expect("hover");
        let HoverContents::Markup(markup) = hover.contents else {
            panic!("expected markup");
        };
        assert_eq!(markup.value, "```fern\nanswer : Int\n```");
        assert_eq!(hover.range, Some(Range::new(Position::new(0, 4), Position::new(0, 10))));
        assert!(server.hover(&uri, Position::new(0, 11)).is_none());
    }

    #[test]
    fn finds_definition_at_name_column() {
        let mut server = Server::new();
        let uri = doc_uri("definition.fn");
        let source = "pub fn add(x: Int) -> Int: x\nlet y = add(1)\n";
        open(&mut server, &uri, source);
        let Some(GotoDefinitionResponse::Scalar(location)) =
            server.definition(&uri, Position::new(1, 9))
        else {
            panic!("expected a location");
        };
        assert_eq!(location.range.start, Position::new(0, 7));
        assert_eq!(location.range.end, Position::new(0, 10));
    }

    #[test]
    fn answers_unknown_methods_and_post_shutdown_requests() {
        let mut server = Server::new();
        let response = request(&mut server, 1, "textDocument/frobnicate", serde_json::Value::Null);
        assert_eq!(
            response.error.expect("error").code,
            ErrorCode::MethodNotFound as i32
        );
        let response = request(&mut server, 2, "shutdown", serde_json::Value::Null);
        assert!(response.error.is_none());
        let response = request(&mut server, 3, "textDocument/hover", serde_json::Value::Null);
        assert_eq!(
            response.error.expect("error").code,
            ErrorCode::InvalidRequest as i32
        );
    }

    #[test]
    fn returns_null_for_unknown_documents() {
        let mut server = Server::new();
        let params = serde_json::json!({
            "textDocument": { "uri": "file:///tmp/missing.fn" },
            "position": { "line": 0, "character": 0 },
        });
        let response = request(&mut server, 1, "textDocument/hover", params);
        assert_eq!(response.result, Some(serde_json::Value::Null));
    }

    #[test]
    fn serves_framed_session() {
        let input = [
            frame(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "capabilities": {} },
            })),
            frame(serde_json::json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} })),
            frame(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/didOpen",
                "params": { "textDocument": {
                    "uri": "file:///tmp/session.fn", "languageId": "fern", "version": 1,
                    "text": "let x = missing\n",
                }},
            })),
            frame(serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "shutdown" })),
            frame(serde_json::json!({ "jsonrpc": "2.0", "method": "exit" })),
        ]
        .concat();
        let mut reader = Cursor::new(input.into_bytes());
        let mut output = Vec::new();
        run(&mut reader, &mut output).expect("session");

        let mut replies = Cursor::new(output);
        let mut messages = Vec::new();
        while let Some(message) = Message::read(&mut replies).expect("framed reply") {
            messages.push(message);
        }
        assert_eq!(messages.len(), 3);
        let Message::Response(init) = &messages[0] else {
            panic!("expected initialize response");
        };
        let capabilities = &init.result.as_ref().expect("result")["capabilities"];
        assert_eq!(capabilities["renameProvider"], serde_json::json!(true));
        let diagnostics = published(&messages[1..2]);
        assert_eq!(diagnostics.diagnostics[0].message, "Undefined variable: missing");
        assert_eq!(diagnostics.diagnostics[0].range.start, Position::new(0, 8));
    }

    #[test]
    fn reads_locations_from_messages() {
        assert_eq!(location_in_message("main.fn:3:7: oops"), Some((3, 7)));
        assert_eq!(location_in_message("3:7: oops"), Some((3, 7)));
        assert_eq!(location_in_message("no location"), None);
    }

    #[test]
    fn validates_identifiers() {
        assert!(is_valid_identifier("sum"));
        assert!(is_valid_identifier("_tmp2"));
        assert!(!is_valid_identifier("2x"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier(""));
    }
}
