use std::fmt;
use std::sync::Arc;

pub mod validate;

pub use validate::{validate_expr, validate_program, validate_stmt, ValidationError};

/// A 1-indexed position in a named source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceLoc {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(file: Arc<str>, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub name: String,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Pipe,
    In,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Pipe => "|>",
            BinaryOp::In => "in",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Pow
        )
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Ident(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<CallArg>,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    /// `value` is absent for the conditional form `match:`.
    Match {
        value: Option<Box<Expr>>,
        arms: Vec<MatchArm>,
    },
    Block {
        stmts: Vec<Stmt>,
        final_expr: Option<Box<Expr>>,
    },
    List(Vec<Expr>),
    Bind {
        name: String,
        value: Box<Expr>,
    },
    With {
        bindings: Vec<WithBinding>,
        body: Box<Expr>,
        else_arms: Vec<MatchArm>,
    },
    Dot {
        object: Box<Expr>,
        field: String,
    },
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },
    For {
        var: String,
        iterable: Box<Expr>,
        body: Box<Expr>,
    },
    While {
        condition: Box<Expr>,
        body: Box<Expr>,
    },
    Loop {
        body: Box<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    InterpString(Vec<InterpPart>),
    Map(Vec<MapEntry>),
    Tuple(Vec<Expr>),
    RecordUpdate {
        base: Box<Expr>,
        fields: Vec<FieldInit>,
    },
    ListComp {
        body: Box<Expr>,
        var: String,
        iterable: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
    Spawn(Box<Expr>),
    Send {
        target: Box<Expr>,
        message: Box<Expr>,
    },
    Receive {
        arms: Vec<MatchArm>,
        after: Option<ReceiveAfter>,
    },
    Try(Box<Expr>),
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallArg {
    pub label: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Expr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WithBinding {
    pub name: String,
    pub value: Expr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum InterpPart {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MapEntry {
    pub key: Expr,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldInit {
    pub name: String,
    pub value: Expr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReceiveAfter {
    pub timeout: Box<Expr>,
    pub body: Option<Box<Expr>>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PatternKind {
    Ident(String),
    Wildcard,
    /// Wraps an int, float, string or bool literal expression.
    Lit(Box<Expr>),
    Constructor { name: String, args: Vec<Pattern> },
    Tuple(Vec<Pattern>),
    List(Vec<Pattern>),
    /// `..name`, or `.._` when the name is absent.
    Rest(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TypeExprKind {
    Named { name: String, args: Vec<TypeExpr> },
    Function { params: Vec<TypeExpr>, ret: Box<TypeExpr> },
    /// An empty tuple is the unit type `()`.
    Tuple(Vec<TypeExpr>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StmtKind {
    Let {
        pattern: Pattern,
        type_ann: Option<TypeExpr>,
        value: Expr,
        else_branch: Option<Expr>,
    },
    Return {
        value: Option<Expr>,
        condition: Option<Expr>,
    },
    Expr(Expr),
    Fn(FunctionDef),
    Import {
        path: Vec<String>,
        items: Vec<String>,
        alias: Option<String>,
    },
    Defer(Expr),
    TypeDef(TypeDef),
    Newtype {
        name: String,
        constructor: String,
        inner: TypeExpr,
        is_pub: bool,
    },
    Break(Option<Expr>),
    Continue,
    Trait(TraitDef),
    Impl(ImplDef),
    Module {
        path: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    pub loc: SourceLoc,
}

/// A function is either a single typed definition or a list of pattern clauses, never both.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub is_pub: bool,
    pub body: FnBody,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FnBody {
    Typed(TypedFn),
    Clauses(Vec<FnClause>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypedFn {
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub where_clauses: Vec<TypeExpr>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FnClause {
    pub params: Vec<Pattern>,
    pub return_type: Option<TypeExpr>,
    pub body: Expr,
    pub loc: SourceLoc,
}

impl FunctionDef {
    pub fn clauses(&self) -> Option<&[FnClause]> {
        match &self.body {
            FnBody::Clauses(clauses) => Some(clauses),
            FnBody::Typed(_) => None,
        }
    }

    pub fn is_multi_clause(&self) -> bool {
        matches!(self.body, FnBody::Clauses(_))
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub is_pub: bool,
    pub type_params: Vec<String>,
    pub body: TypeDefBody,
    pub derives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TypeDefBody {
    Variants(Vec<Variant>),
    Record(Vec<Field>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Variant {
    pub name: String,
    pub fields: Vec<Field>,
    pub loc: SourceLoc,
}

/// Variant fields may be positional; record fields are always named.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeExpr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TraitDef {
    pub name: String,
    pub type_params: Vec<String>,
    pub constraints: Vec<TypeExpr>,
    pub methods: Vec<TraitMethod>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TraitMethod {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImplDef {
    pub trait_name: String,
    pub type_args: Vec<TypeExpr>,
    pub methods: Vec<FunctionDef>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub file: Arc<str>,
    pub stmts: Vec<Stmt>,
}

// --- builders ---

impl Expr {
    pub fn new(kind: ExprKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }

    pub fn int(value: i64, loc: SourceLoc) -> Self {
        Self::new(ExprKind::Int(value), loc)
    }

    pub fn ident(name: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(ExprKind::Ident(name.into()), loc)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        let loc = left.loc.clone();
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            loc,
        )
    }

    pub fn call(callee: Expr, args: Vec<Expr>, loc: SourceLoc) -> Self {
        let args = args
            .into_iter()
            .map(|value| CallArg { label: None, value })
            .collect();
        Self::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            loc,
        )
    }

    /// Literal-valued expressions are the ones the REPL echoes back as values.
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::String(_) | ExprKind::Bool(_)
        )
    }

    /// The location of the value a block-shaped expression produces.
    pub fn result_loc(&self) -> &SourceLoc {
        match &self.kind {
            ExprKind::Block {
                final_expr: Some(expr),
                ..
            } => expr.result_loc(),
            _ => &self.loc,
        }
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }

    pub fn expr(expr: Expr) -> Self {
        let loc = expr.loc.clone();
        Self::new(StmtKind::Expr(expr), loc)
    }
}

impl Pattern {
    pub fn new(kind: PatternKind, loc: SourceLoc) -> Self {
        Self { kind, loc }
    }

    /// Names bound by this pattern, in source order.
    pub fn binders(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_binders(self, &mut out);
        out
    }
}

fn collect_binders<'a>(pattern: &'a Pattern, out: &mut Vec<&'a str>) {
    match &pattern.kind {
        PatternKind::Ident(name) => out.push(name),
        PatternKind::Rest(Some(name)) => out.push(name),
        PatternKind::Constructor { args, .. } => {
            for arg in args {
                collect_binders(arg, out);
            }
        }
        PatternKind::Tuple(items) | PatternKind::List(items) => {
            for item in items {
                collect_binders(item, out);
            }
        }
        PatternKind::Wildcard | PatternKind::Lit(_) | PatternKind::Rest(None) => {}
    }
}

impl TypeExpr {
    pub fn named(name: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            kind: TypeExprKind::Named {
                name: name.into(),
                args: Vec::new(),
            },
            loc,
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeExprKind::Named { name, args } => {
                write!(f, "{name}")?;
                if !args.is_empty() {
                    write!(f, "(")?;
                    write_joined(f, args)?;
                    write!(f, ")")?;
                }
                Ok(())
            }
            TypeExprKind::Function { params, ret } => {
                write!(f, "(")?;
                write_joined(f, params)?;
                write!(f, ") -> {ret}")
            }
            TypeExprKind::Tuple(items) => {
                write!(f, "(")?;
                write_joined(f, items)?;
                write!(f, ")")
            }
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[TypeExpr]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

// --- visitor ---

pub trait AstVisitor {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }
    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }
    fn visit_pattern(&mut self, pattern: &Pattern) {
        walk_pattern(self, pattern);
    }
    fn visit_type_expr(&mut self, ty: &TypeExpr) {
        walk_type_expr(self, ty);
    }
    fn visit_function(&mut self, function: &FunctionDef) {
        walk_function(self, function);
    }
}

pub fn walk_program<V: AstVisitor + ?Sized>(visitor: &mut V, program: &Program) {
    for stmt in &program.stmts {
        visitor.visit_stmt(stmt);
    }
}

pub fn walk_function<V: AstVisitor + ?Sized>(visitor: &mut V, function: &FunctionDef) {
    match &function.body {
        FnBody::Typed(typed) => {
            for param in &typed.params {
                visitor.visit_type_expr(&param.ty);
            }
            if let Some(ret) = &typed.return_type {
                visitor.visit_type_expr(ret);
            }
            for constraint in &typed.where_clauses {
                visitor.visit_type_expr(constraint);
            }
            visitor.visit_expr(&typed.body);
        }
        FnBody::Clauses(clauses) => {
            for clause in clauses {
                for param in &clause.params {
                    visitor.visit_pattern(param);
                }
                if let Some(ret) = &clause.return_type {
                    visitor.visit_type_expr(ret);
                }
                visitor.visit_expr(&clause.body);
            }
        }
    }
}

pub fn walk_stmt<V: AstVisitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Let {
            pattern,
            type_ann,
            value,
            else_branch,
        } => {
            visitor.visit_pattern(pattern);
            if let Some(ty) = type_ann {
                visitor.visit_type_expr(ty);
            }
            visitor.visit_expr(value);
            if let Some(else_branch) = else_branch {
                visitor.visit_expr(else_branch);
            }
        }
        StmtKind::Return { value, condition } => {
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
            if let Some(condition) = condition {
                visitor.visit_expr(condition);
            }
        }
        StmtKind::Expr(expr) | StmtKind::Defer(expr) => visitor.visit_expr(expr),
        StmtKind::Fn(function) => visitor.visit_function(function),
        StmtKind::TypeDef(def) => match &def.body {
            TypeDefBody::Variants(variants) => {
                for variant in variants {
                    for field in &variant.fields {
                        visitor.visit_type_expr(&field.ty);
                    }
                }
            }
            TypeDefBody::Record(fields) => {
                for field in fields {
                    visitor.visit_type_expr(&field.ty);
                }
            }
        },
        StmtKind::Newtype { inner, .. } => visitor.visit_type_expr(inner),
        StmtKind::Break(value) => {
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
        }
        StmtKind::Trait(def) => {
            for constraint in &def.constraints {
                visitor.visit_type_expr(constraint);
            }
            for method in &def.methods {
                for param in &method.params {
                    visitor.visit_type_expr(&param.ty);
                }
                if let Some(ret) = &method.return_type {
                    visitor.visit_type_expr(ret);
                }
            }
        }
        StmtKind::Impl(def) => {
            for arg in &def.type_args {
                visitor.visit_type_expr(arg);
            }
            for method in &def.methods {
                visitor.visit_function(method);
            }
        }
        StmtKind::Import { .. } | StmtKind::Continue | StmtKind::Module { .. } => {}
    }
}

pub fn walk_expr<V: AstVisitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::String(_)
        | ExprKind::Bool(_)
        | ExprKind::Ident(_) => {}
        ExprKind::Binary { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        ExprKind::Unary { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Call { callee, args } => {
            visitor.visit_expr(callee);
            for arg in args {
                visitor.visit_expr(&arg.value);
            }
        }
        ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            visitor.visit_expr(condition);
            visitor.visit_expr(then_branch);
            if let Some(else_branch) = else_branch {
                visitor.visit_expr(else_branch);
            }
        }
        ExprKind::Match { value, arms } => {
            if let Some(value) = value {
                visitor.visit_expr(value);
            }
            walk_arms(visitor, arms);
        }
        ExprKind::Block { stmts, final_expr } => {
            for stmt in stmts {
                visitor.visit_stmt(stmt);
            }
            if let Some(final_expr) = final_expr {
                visitor.visit_expr(final_expr);
            }
        }
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            for item in items {
                visitor.visit_expr(item);
            }
        }
        ExprKind::Bind { value, .. } => visitor.visit_expr(value),
        ExprKind::With {
            bindings,
            body,
            else_arms,
        } => {
            for binding in bindings {
                visitor.visit_expr(&binding.value);
            }
            visitor.visit_expr(body);
            walk_arms(visitor, else_arms);
        }
        ExprKind::Dot { object, .. } => visitor.visit_expr(object),
        ExprKind::Range { start, end, .. } => {
            visitor.visit_expr(start);
            visitor.visit_expr(end);
        }
        ExprKind::For { iterable, body, .. } => {
            visitor.visit_expr(iterable);
            visitor.visit_expr(body);
        }
        ExprKind::While { condition, body } => {
            visitor.visit_expr(condition);
            visitor.visit_expr(body);
        }
        ExprKind::Loop { body } | ExprKind::Lambda { body, .. } => visitor.visit_expr(body),
        ExprKind::InterpString(parts) => {
            for part in parts {
                if let InterpPart::Expr(expr) = part {
                    visitor.visit_expr(expr);
                }
            }
        }
        ExprKind::Map(entries) => {
            for entry in entries {
                visitor.visit_expr(&entry.key);
                visitor.visit_expr(&entry.value);
            }
        }
        ExprKind::RecordUpdate { base, fields } => {
            visitor.visit_expr(base);
            for field in fields {
                visitor.visit_expr(&field.value);
            }
        }
        ExprKind::ListComp {
            body,
            iterable,
            condition,
            ..
        } => {
            visitor.visit_expr(iterable);
            if let Some(condition) = condition {
                visitor.visit_expr(condition);
            }
            visitor.visit_expr(body);
        }
        ExprKind::Spawn(inner) | ExprKind::Try(inner) => visitor.visit_expr(inner),
        ExprKind::Send { target, message } => {
            visitor.visit_expr(target);
            visitor.visit_expr(message);
        }
        ExprKind::Receive { arms, after } => {
            walk_arms(visitor, arms);
            if let Some(after) = after {
                visitor.visit_expr(&after.timeout);
                if let Some(body) = &after.body {
                    visitor.visit_expr(body);
                }
            }
        }
        ExprKind::Index { object, index } => {
            visitor.visit_expr(object);
            visitor.visit_expr(index);
        }
    }
}

fn walk_arms<V: AstVisitor + ?Sized>(visitor: &mut V, arms: &[MatchArm]) {
    for arm in arms {
        visitor.visit_pattern(&arm.pattern);
        if let Some(guard) = &arm.guard {
            visitor.visit_expr(guard);
        }
        visitor.visit_expr(&arm.body);
    }
}

pub fn walk_pattern<V: AstVisitor + ?Sized>(visitor: &mut V, pattern: &Pattern) {
    match &pattern.kind {
        PatternKind::Lit(expr) => visitor.visit_expr(expr),
        PatternKind::Constructor { args, .. } => {
            for arg in args {
                visitor.visit_pattern(arg);
            }
        }
        PatternKind::Tuple(items) | PatternKind::List(items) => {
            for item in items {
                visitor.visit_pattern(item);
            }
        }
        PatternKind::Ident(_) | PatternKind::Wildcard | PatternKind::Rest(_) => {}
    }
}

pub fn walk_type_expr<V: AstVisitor + ?Sized>(visitor: &mut V, ty: &TypeExpr) {
    match &ty.kind {
        TypeExprKind::Named { args, .. } => {
            for arg in args {
                visitor.visit_type_expr(arg);
            }
        }
        TypeExprKind::Function { params, ret } => {
            for param in params {
                visitor.visit_type_expr(param);
            }
            visitor.visit_type_expr(ret);
        }
        TypeExprKind::Tuple(items) => {
            for item in items {
                visitor.visit_type_expr(item);
            }
        }
    }
}

// --- diagnostics ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
            Severity::Help => "help",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Severity::Error => "\x1b[1;31m",
            Severity::Warning => "\x1b[1;33m",
            Severity::Note => "\x1b[1;36m",
            Severity::Help => "\x1b[1;32m",
        }
    }
}

const BLUE: &str = "\x1b[1;34m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// A located message ready to be rendered against its source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub loc: Option<SourceLoc>,
    /// Width of the underline in characters; at least one caret is drawn.
    pub length: usize,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            loc,
            length: 1,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length.max(1);
        self
    }

    /// Renders in the
    /// `error: msg` / `--> file:line:col` / gutter / source line / caret layout.
    pub fn render(&self, source: &str, color: bool) -> String {
        let (sev, blue, bold, reset) = if color {
            (self.severity.color(), BLUE, BOLD, RESET)
        } else {
            ("", "", "", "")
        };
        let mut out = format!(
            "{sev}{}{reset}{bold}: {}{reset}\n",
            self.severity.label(),
            self.message
        );
        let Some(loc) = &self.loc else {
            return out;
        };
        let line_no = loc.line.to_string();
        let gutter = " ".repeat(line_no.len() + 1);
        out.push_str(&format!("{gutter}{blue}-->{reset} {loc}\n"));
        let Some(line_text) = source.lines().nth(loc.line.saturating_sub(1) as usize) else {
            return out;
        };
        out.push_str(&format!("{gutter}{blue}|{reset}\n"));
        out.push_str(&format!("{blue}{line_no} |{reset} {line_text}\n"));
        let pad = " ".repeat(loc.column.saturating_sub(1) as usize);
        let carets = "^".repeat(self.length.max(1));
        out.push_str(&format!(
            "{gutter}{blue}|{reset} {pad}{sev}{carets} {}{reset}\n",
            self.message
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: u32, column: u32) -> SourceLoc {
        SourceLoc::new(Arc::from("main.fn"), line, column)
    }

    #[test]
    fn renders_diagnostic_with_caret_under_column() {
        let source = "let x = 1\nlet y = x + \"a\"\n";
        let rendered = Diagnostic::error("Cannot apply '+' to Int and String", Some(loc(2, 9)))
            .with_length(7)
            .render(source, false);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "error: Cannot apply '+' to Int and String");
        assert_eq!(lines[1], "  --> main.fn:2:9");
        assert_eq!(lines[2], "  |");
        assert_eq!(lines[3], "2 | let y = x + \"a\"");
        assert_eq!(lines[4], "  |         ^^^^^^^ Cannot apply '+' to Int and String");
    }

    #[test]
    fn renders_unlocated_diagnostic_as_single_line() {
        let rendered = Diagnostic::error("boom", None).render("", false);
        assert_eq!(rendered, "error: boom\n");
    }

    #[test]
    fn colored_rendering_wraps_label() {
        let rendered = Diagnostic::error("boom", None).render("", true);
        assert!(rendered.starts_with("\x1b[1;31merror\x1b[0m"));
    }

    #[test]
    fn collects_pattern_binders_in_order() {
        let pattern = Pattern::new(
            PatternKind::Tuple(vec![
                Pattern::new(PatternKind::Ident("a".into()), loc(1, 2)),
                Pattern::new(
                    PatternKind::Constructor {
                        name: "Some".into(),
                        args: vec![Pattern::new(PatternKind::Ident("b".into()), loc(1, 10))],
                    },
                    loc(1, 5),
                ),
                Pattern::new(PatternKind::Rest(Some("rest".into())), loc(1, 14)),
                Pattern::new(PatternKind::Wildcard, loc(1, 20)),
            ]),
            loc(1, 1),
        );
        assert_eq!(pattern.binders(), vec!["a", "b", "rest"]);
    }

    #[test]
    fn result_loc_points_at_block_tail() {
        let tail = Expr::new(ExprKind::String("oops".into()), loc(2, 5));
        let block = Expr::new(
            ExprKind::Block {
                stmts: Vec::new(),
                final_expr: Some(Box::new(tail)),
            },
            loc(2, 5),
        );
        assert_eq!(block.result_loc(), &loc(2, 5));
        let binary = Expr::binary(BinaryOp::Add, Expr::int(1, loc(1, 1)), Expr::int(2, loc(1, 5)));
        assert_eq!(binary.result_loc(), &loc(1, 1));
    }

    #[test]
    fn displays_type_expressions() {
        let result = TypeExpr {
            kind: TypeExprKind::Named {
                name: "Result".into(),
                args: vec![
                    TypeExpr::named("Int", loc(1, 8)),
                    TypeExpr::named("String", loc(1, 13)),
                ],
            },
            loc: loc(1, 1),
        };
        assert_eq!(result.to_string(), "Result(Int, String)");
        let func = TypeExpr {
            kind: TypeExprKind::Function {
                params: vec![TypeExpr::named("Int", loc(1, 2))],
                ret: Box::new(TypeExpr::named("Bool", loc(1, 10))),
            },
            loc: loc(1, 1),
        };
        assert_eq!(func.to_string(), "(Int) -> Bool");
    }

    proptest::proptest! {
        #[test]
        fn caret_lands_under_the_reported_column(
            lines in proptest::collection::vec("[a-z ]{1,20}", 1..8),
            pick in 0usize..8,
            column in 1u32..21,
        ) {
            let line = pick % lines.len();
            let source = lines.join("\n");
            let rendered = Diagnostic::error("boom", Some(loc(line as u32 + 1, column)))
                .render(&source, false);
            let caret_line = rendered.lines().nth(4).expect("caret line");
            let gutter = (line + 1).to_string().len() + 1;
            let caret = caret_line.find('^').expect("caret");
            proptest::prop_assert_eq!(caret, gutter + 2 + column as usize - 1);
        }
    }
}
