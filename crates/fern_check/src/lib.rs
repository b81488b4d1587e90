use indexmap::IndexMap;

use fern_syntax::{
    BinaryOp, CallArg, Diagnostic, Expr, ExprKind, FnBody, FunctionDef, InterpPart, MatchArm,
    Pattern, PatternKind, Program, SourceLoc, Stmt, StmtKind, TraitDef, TypeDef, TypeDefBody,
    TypeExpr, TypeExprKind, UnaryOp,
};

pub mod env;
pub mod types;

pub use env::{Binding, TypeEnv, TypeInfo, TypeShape};
pub use types::{TypeArena, TypeId, TypeKind};

/// Reserved words, offered by the editor integrations.
pub const KEYWORDS: &[&str] = &[
    "fn", "let", "if", "else", "match", "with", "return", "import", "type", "trait", "impl", "pub",
    "module", "for", "break", "continue", "true", "false", "spawn", "send", "receive", "and", "or",
    "not", "in", "do", "while", "loop", "defer", "as",
];

/// Names the checker binds before any user code runs.
pub const BUILTINS: &[&str] = &[
    "print", "println", "str_len", "list_len", "to_string", "Some", "None", "Ok", "Err",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", located(.loc, .message))]
pub struct TypeError {
    pub message: String,
    pub loc: Option<SourceLoc>,
}

fn located(loc: &Option<SourceLoc>, message: &str) -> String {
    match loc {
        Some(loc) => format!("{loc}: {message}"),
        None => message.to_string(),
    }
}

impl TypeError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.message.clone(), self.loc.clone())
    }
}

/// Checks a whole program with a fresh checker.
pub fn check_program(program: &Program) -> Result<(), Vec<TypeError>> {
    let mut checker = Checker::new();
    checker.check_program(program);
    if checker.errors.is_empty() {
        Ok(())
    } else {
        Err(checker.errors)
    }
}

type TypeVars = Vec<(String, TypeId)>;

pub struct Checker {
    arena: TypeArena,
    env: TypeEnv,
    errors: Vec<TypeError>,
    /// Declared return type of each enclosing function, innermost last.
    returns: Vec<Option<TypeId>>,
    /// Signatures bound by the declaration pre-pass, consumed when the
    /// function body is checked.
    predeclared: IndexMap<String, TypeId>,
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker {
    pub fn new() -> Self {
        let mut checker = Self {
            arena: TypeArena::new(),
            env: TypeEnv::new(),
            errors: Vec::new(),
            returns: Vec::new(),
            predeclared: IndexMap::new(),
        };
        checker.load_builtins();
        checker
    }

    fn load_builtins(&mut self) {
        let arena = &mut self.arena;
        let mut builtins = Vec::new();

        for name in ["print", "println"] {
            let a = arena.var("a");
            let unit = arena.unit();
            builtins.push((name, arena.func(vec![a], unit)));
        }
        let string = arena.string();
        let int = arena.int();
        builtins.push(("str_len", arena.func(vec![string], int)));
        let a = arena.var("a");
        let list = arena.list(a);
        let int = arena.int();
        builtins.push(("list_len", arena.func(vec![list], int)));
        let a = arena.var("a");
        let string = arena.string();
        builtins.push(("to_string", arena.func(vec![a], string)));

        let a = arena.var("a");
        let option = arena.option(a);
        builtins.push(("Some", arena.func(vec![a], option)));
        let a = arena.var("a");
        builtins.push(("None", arena.option(a)));
        let (a, e) = (arena.var("a"), arena.var("e"));
        let result = arena.result(a, e);
        builtins.push(("Ok", arena.func(vec![a], result)));
        let (a, e) = (arena.var("a"), arena.var("e"));
        let result = arena.result(a, e);
        builtins.push(("Err", arena.func(vec![e], result)));

        for (name, ty) in builtins {
            self.env.define_generic(name, ty);
        }
    }

    // --- accessors ---

    pub fn arena(&self) -> &TypeArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut TypeArena {
        &mut self.arena
    }

    pub fn env(&self) -> &TypeEnv {
        &self.env
    }

    pub fn errors(&self) -> &[TypeError] {
        &self.errors
    }

    pub fn first_error(&self) -> Option<&TypeError> {
        self.errors.first()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn take_errors(&mut self) -> Vec<TypeError> {
        std::mem::take(&mut self.errors)
    }

    pub fn define(&mut self, name: impl Into<String>, ty: TypeId) {
        self.env.define(name, ty);
    }

    pub fn push_scope(&mut self) {
        self.env.push_scope();
    }

    pub fn pop_scope(&mut self) {
        self.env.pop_scope();
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.env.lookup(name)
    }

    /// The rendered type of a visible name, as hover and the REPL show it.
    pub fn describe(&self, name: &str) -> Option<String> {
        self.lookup(name).map(|ty| self.arena.display(ty))
    }

    pub fn type_to_string(&self, ty: TypeId) -> String {
        self.arena.display(ty)
    }

    // --- errors ---

    fn error_at(&mut self, loc: &SourceLoc, message: impl Into<String>) -> TypeId {
        let message = message.into();
        tracing::debug!(%loc, %message, "type error");
        let ty = self.arena.error(message.clone());
        self.errors.push(TypeError {
            message,
            loc: Some(loc.clone()),
        });
        ty
    }

    fn show(&self, ty: TypeId) -> String {
        self.arena.display(ty)
    }

    /// A value whose result nobody reads must not be a Result.
    fn discard(&mut self, ty: TypeId, loc: &SourceLoc) {
        if self.arena.con_args(ty, "Result").is_some() {
            self.error_at(loc, "Unhandled Result value");
        }
    }

    fn is_error(&self, ty: TypeId) -> bool {
        self.arena.is_error(ty)
    }

    fn kind(&self, ty: TypeId) -> TypeKind {
        self.arena.kind(self.arena.resolve(ty)).clone()
    }

    // --- programs and statements ---

    /// Checks every statement, after binding type declarations and
    /// function signatures so that definitions may appear in any order.
    /// Returns true when no new error was reported.
    pub fn check_program(&mut self, program: &Program) -> bool {
        let before = self.errors.len();
        self.load_declarations(&program.stmts);
        self.load_functions(&program.stmts);
        for stmt in &program.stmts {
            match &stmt.kind {
                StmtKind::TypeDef(_) | StmtKind::Newtype { .. } | StmtKind::Trait(_) => {}
                _ => self.check_stmt_inner(stmt),
            }
        }
        self.predeclared.clear();
        self.errors.len() == before
    }

    fn load_declarations(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::TypeDef(def) => self.register_type_def(def),
                StmtKind::Newtype {
                    name,
                    constructor,
                    inner,
                    ..
                } => self.register_newtype(name, constructor, inner),
                StmtKind::Trait(def) => self.register_trait(def),
                _ => {}
            }
        }
    }

    fn load_functions(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let StmtKind::Fn(def) = &stmt.kind {
                let signature = self.signature(def);
                self.env.define_generic(def.name.clone(), signature);
                self.predeclared.insert(def.name.clone(), signature);
            }
        }
    }

    /// Checks one statement in the current scope. Returns true when it
    /// reported no new error.
    pub fn check_stmt(&mut self, stmt: &Stmt) -> bool {
        let before = self.errors.len();
        self.check_stmt_inner(stmt);
        self.errors.len() == before
    }

    fn check_stmt_inner(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let {
                pattern,
                type_ann,
                value,
                else_branch,
            } => self.check_let(pattern, type_ann.as_ref(), value, else_branch.as_ref()),
            StmtKind::Return { value, condition } => {
                if let Some(condition) = condition {
                    self.expect_bool(condition, "Return condition must be Bool");
                }
                let (ty, loc) = match value {
                    Some(value) => (self.infer_expr(value), &value.loc),
                    None => (self.arena.unit(), &stmt.loc),
                };
                match self.returns.last().copied() {
                    None => {
                        self.error_at(&stmt.loc, "return outside of a function");
                    }
                    Some(Some(expected)) => {
                        if !self.is_error(ty) && !self.arena.unify(expected, ty) {
                            let message = format!(
                                "Return type mismatch: expected {}, got {}",
                                self.show(expected),
                                self.show(ty)
                            );
                            self.error_at(loc, message);
                        }
                    }
                    Some(None) => {}
                }
            }
            StmtKind::Expr(expr) => {
                let ty = self.infer_expr(expr);
                self.discard(ty, &expr.loc);
            }
            StmtKind::Fn(def) => self.check_function(def),
            StmtKind::Import { path, items, alias } => {
                if items.is_empty() {
                    let name = alias.clone().or_else(|| path.last().cloned());
                    if let Some(name) = name {
                        let module = self.arena.con("Module", Vec::new());
                        self.env.define(name, module);
                    }
                } else {
                    for item in items {
                        let ty = self.arena.var(item.clone());
                        self.env.define_generic(item.clone(), ty);
                    }
                }
            }
            StmtKind::Defer(expr) => {
                let ty = self.infer_expr(expr);
                self.discard(ty, expr.result_loc());
            }
            StmtKind::TypeDef(def) => self.register_type_def(def),
            StmtKind::Newtype {
                name,
                constructor,
                inner,
                ..
            } => self.register_newtype(name, constructor, inner),
            StmtKind::Break(value) => {
                if let Some(value) = value {
                    self.infer_expr(value);
                }
            }
            StmtKind::Continue | StmtKind::Module { .. } => {}
            StmtKind::Trait(def) => self.register_trait(def),
            StmtKind::Impl(def) => {
                // Method resolution happens later; bodies are still checked.
                for method in &def.methods {
                    self.env.push_scope();
                    self.check_function(method);
                    self.env.pop_scope();
                }
            }
        }
    }

    fn check_let(
        &mut self,
        pattern: &Pattern,
        type_ann: Option<&TypeExpr>,
        value: &Expr,
        else_branch: Option<&Expr>,
    ) {
        let mut ty = self.infer_expr(value);
        if let Some(annotation) = type_ann {
            let declared = self.resolve_type_expr(annotation, &mut Vec::new(), false);
            if !self.is_error(ty) && !self.arena.unify(declared, ty) {
                let message = format!(
                    "Type mismatch: expected {}, got {}",
                    self.show(declared),
                    self.show(ty)
                );
                self.error_at(&value.loc, message);
            }
            ty = declared;
        }
        if let Some(fallback) = else_branch {
            self.infer_expr(fallback);
        }
        self.bind_pattern(pattern, ty);
    }

    // --- functions ---

    /// The function's type before its body is checked. Unannotated
    /// parameters and results are fresh variables.
    fn signature(&mut self, def: &FunctionDef) -> TypeId {
        match &def.body {
            FnBody::Typed(typed) => {
                let mut vars = TypeVars::new();
                let params = typed
                    .params
                    .iter()
                    .map(|param| self.resolve_type_expr(&param.ty, &mut vars, false))
                    .collect();
                let result = match &typed.return_type {
                    Some(ret) => self.resolve_type_expr(ret, &mut vars, false),
                    None => self.arena.fresh_var(),
                };
                self.arena.func(params, result)
            }
            FnBody::Clauses(clauses) => {
                let arity = clauses.first().map_or(0, |clause| clause.params.len());
                let params = (0..arity).map(|_| self.arena.fresh_var()).collect();
                let declared = clauses.iter().find_map(|clause| clause.return_type.as_ref());
                let result = match declared {
                    Some(ret) => self.resolve_type_expr(ret, &mut Vec::new(), false),
                    None => self.arena.fresh_var(),
                };
                self.arena.func(params, result)
            }
        }
    }

    fn check_function(&mut self, def: &FunctionDef) {
        let signature = match self.predeclared.shift_remove(&def.name) {
            Some(signature) => signature,
            None => {
                let signature = self.signature(def);
                self.env.define_generic(def.name.clone(), signature);
                signature
            }
        };
        let TypeKind::Fn { params, result } = self.kind(signature) else {
            return;
        };
        tracing::trace!(name = %def.name, signature = %self.show(signature), "checking function");

        match &def.body {
            FnBody::Typed(typed) => {
                let declared = typed.return_type.as_ref().map(|_| result);
                self.env.push_scope();
                self.returns.push(declared);
                for (param, ty) in typed.params.iter().zip(&params) {
                    self.env.define(param.name.clone(), *ty);
                }
                let body_ty = self.infer_expr(&typed.body);
                self.returns.pop();
                self.env.pop_scope();
                self.check_body_type(def, body_ty, result, declared.is_some(), &typed.body);
            }
            FnBody::Clauses(clauses) => {
                let declared = clauses
                    .iter()
                    .any(|clause| clause.return_type.is_some())
                    .then_some(result);
                for clause in clauses {
                    if clause.params.len() != params.len() {
                        let message = format!(
                            "Function clauses for '{}' have different numbers of parameters",
                            def.name
                        );
                        self.error_at(&clause.loc, message);
                        continue;
                    }
                    self.env.push_scope();
                    self.returns.push(declared);
                    for (pattern, ty) in clause.params.iter().zip(&params) {
                        self.bind_pattern(pattern, *ty);
                    }
                    let body_ty = self.infer_expr(&clause.body);
                    self.returns.pop();
                    self.env.pop_scope();
                    self.check_body_type(def, body_ty, result, declared.is_some(), &clause.body);
                }
            }
        }
    }

    fn check_body_type(
        &mut self,
        def: &FunctionDef,
        body_ty: TypeId,
        result: TypeId,
        declared: bool,
        body: &Expr,
    ) {
        if self.is_error(body_ty) || self.arena.unify(result, body_ty) {
            return;
        }
        let message = if declared {
            format!(
                "Function '{}' body has type {}, but declared return type is {}",
                def.name,
                self.show(body_ty),
                self.show(result)
            )
        } else {
            format!(
                "Function '{}' clause has type {}, but earlier clauses have type {}",
                def.name,
                self.show(body_ty),
                self.show(result)
            )
        };
        self.error_at(body.result_loc(), message);
    }

    // --- declarations ---

    fn register_type_def(&mut self, def: &TypeDef) {
        let mut vars: TypeVars = def
            .type_params
            .iter()
            .map(|param| (param.clone(), self.arena.var(param.clone())))
            .collect();
        let params: Vec<TypeId> = vars.iter().map(|(_, var)| *var).collect();
        let self_ty = self.arena.con(def.name.clone(), params.clone());
        self.env.define_type(TypeInfo {
            name: def.name.clone(),
            ty: self_ty,
            params: params.clone(),
            shape: TypeShape::Opaque,
        });

        let shape = match &def.body {
            TypeDefBody::Variants(variants) => {
                let mut table = IndexMap::new();
                for variant in variants {
                    let fields: Vec<TypeId> = variant
                        .fields
                        .iter()
                        .map(|field| self.resolve_type_expr(&field.ty, &mut vars, true))
                        .collect();
                    let constructor = if fields.is_empty() {
                        self_ty
                    } else {
                        self.arena.func(fields.clone(), self_ty)
                    };
                    self.env.define_generic(variant.name.clone(), constructor);
                    table.insert(variant.name.clone(), fields);
                }
                TypeShape::Variants(table)
            }
            TypeDefBody::Record(fields) => {
                let mut table = IndexMap::new();
                for field in fields {
                    let ty = self.resolve_type_expr(&field.ty, &mut vars, true);
                    table.insert(field.name.clone().unwrap_or_default(), ty);
                }
                let constructor = self.arena.func(table.values().copied().collect(), self_ty);
                self.env.define_generic(def.name.clone(), constructor);
                TypeShape::Record(table)
            }
        };
        self.env.define_type(TypeInfo {
            name: def.name.clone(),
            ty: self_ty,
            params,
            shape,
        });
    }

    fn register_newtype(&mut self, name: &str, constructor: &str, inner: &TypeExpr) {
        let self_ty = self.arena.con(name, Vec::new());
        let inner_ty = self.resolve_type_expr(inner, &mut Vec::new(), true);
        self.env.define_type(TypeInfo {
            name: name.to_string(),
            ty: self_ty,
            params: Vec::new(),
            shape: TypeShape::Newtype(inner_ty),
        });
        let func = self.arena.func(vec![inner_ty], self_ty);
        self.env.define_generic(constructor, func);
    }

    /// Trait methods become generic functions over the trait's parameters.
    fn register_trait(&mut self, def: &TraitDef) {
        for method in &def.methods {
            let mut vars: TypeVars = def
                .type_params
                .iter()
                .map(|param| (param.clone(), self.arena.var(param.clone())))
                .collect();
            let params = method
                .params
                .iter()
                .map(|param| self.resolve_type_expr(&param.ty, &mut vars, false))
                .collect();
            let result = match &method.return_type {
                Some(ret) => self.resolve_type_expr(ret, &mut vars, false),
                None => self.arena.unit(),
            };
            let func = self.arena.func(params, result);
            self.env.define_generic(method.name.clone(), func);
        }
    }

    /// Lowercase single names are type variables scoped to `vars`. In
    /// strict mode an unknown uppercase name is an error.
    fn resolve_type_expr(&mut self, ty: &TypeExpr, vars: &mut TypeVars, strict: bool) -> TypeId {
        match &ty.kind {
            TypeExprKind::Named { name, args } => {
                let resolved: Vec<TypeId> = args
                    .iter()
                    .map(|arg| self.resolve_type_expr(arg, vars, strict))
                    .collect();
                match (name.as_str(), resolved.as_slice()) {
                    ("Int", []) => return self.arena.int(),
                    ("Float", []) => return self.arena.float(),
                    ("String", []) => return self.arena.string(),
                    ("Bool", []) => return self.arena.bool(),
                    ("Unit", []) => return self.arena.unit(),
                    ("List", [elem]) => return self.arena.list(*elem),
                    ("Option", [inner]) => return self.arena.option(*inner),
                    ("Result", [ok, err]) => return self.arena.result(*ok, *err),
                    ("Map", [key, value]) => return self.arena.map(*key, *value),
                    ("Range", [elem]) => return self.arena.range(*elem),
                    _ => {}
                }
                if resolved.is_empty() && name.starts_with(|ch: char| ch.is_lowercase()) {
                    if let Some((_, var)) = vars.iter().find(|(var, _)| var == name) {
                        return *var;
                    }
                    let var = self.arena.var(name.clone());
                    vars.push((name.clone(), var));
                    return var;
                }
                if let Some(info) = self.env.lookup_type(name) {
                    if resolved.is_empty() && !info.params.is_empty() {
                        let count = info.params.len();
                        let fresh = (0..count).map(|_| self.arena.fresh_var()).collect();
                        return self.arena.con(name.clone(), fresh);
                    }
                    return self.arena.con(name.clone(), resolved);
                }
                if strict {
                    return self.error_at(&ty.loc, format!("Unknown type '{name}'"));
                }
                self.arena.con(name.clone(), resolved)
            }
            TypeExprKind::Function { params, ret } => {
                let params = params
                    .iter()
                    .map(|param| self.resolve_type_expr(param, vars, strict))
                    .collect();
                let ret = self.resolve_type_expr(ret, vars, strict);
                self.arena.func(params, ret)
            }
            TypeExprKind::Tuple(items) if items.is_empty() => self.arena.unit(),
            TypeExprKind::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.resolve_type_expr(item, vars, strict))
                    .collect();
                self.arena.tuple(items)
            }
        }
    }

    // --- patterns ---

    /// Checks `pattern` against `ty`, binding its names in the current scope.
    fn bind_pattern(&mut self, pattern: &Pattern, ty: TypeId) {
        match &pattern.kind {
            PatternKind::Ident(name) => self.env.define(name.clone(), ty),
            PatternKind::Rest(Some(name)) => self.env.define(name.clone(), ty),
            PatternKind::Wildcard | PatternKind::Rest(None) => {}
            PatternKind::Lit(literal) => {
                let literal_ty = self.infer_expr(literal);
                if !self.is_error(ty) && !self.arena.unify(literal_ty, ty) {
                    let message = format!(
                        "Pattern type mismatch: expected {}, got {}",
                        self.show(ty),
                        self.show(literal_ty)
                    );
                    self.error_at(&pattern.loc, message);
                }
            }
            PatternKind::Constructor { name, args } => {
                self.bind_constructor(pattern, name, args, ty)
            }
            PatternKind::Tuple(items) => {
                if items.is_empty() {
                    let unit = self.arena.unit();
                    if !self.arena.unify(unit, ty) {
                        let message =
                            format!("Cannot destructure non-tuple type {}", self.show(ty));
                        self.error_at(&pattern.loc, message);
                    }
                    return;
                }
                let elems = match self.kind(ty) {
                    TypeKind::Tuple(elems) => elems,
                    TypeKind::Var { .. } => {
                        let elems: Vec<TypeId> =
                            items.iter().map(|_| self.arena.fresh_var()).collect();
                        let tuple = self.arena.tuple(elems.clone());
                        self.arena.unify(ty, tuple);
                        elems
                    }
                    TypeKind::Error(_) => {
                        self.bind_all_to_error(items);
                        return;
                    }
                    _ => {
                        let message =
                            format!("Cannot destructure non-tuple type {}", self.show(ty));
                        self.error_at(&pattern.loc, message);
                        self.bind_all_to_error(items);
                        return;
                    }
                };
                if elems.len() != items.len() {
                    let message = format!(
                        "Tuple pattern has {} elements but type has {}",
                        items.len(),
                        elems.len()
                    );
                    self.error_at(&pattern.loc, message);
                    self.bind_all_to_error(items);
                    return;
                }
                for (item, elem) in items.iter().zip(elems) {
                    self.bind_pattern(item, elem);
                }
            }
            PatternKind::List(items) => {
                let elem = match self.kind(ty) {
                    TypeKind::Con { name, args } if name == "List" && args.len() == 1 => args[0],
                    TypeKind::Var { .. } => {
                        let elem = self.arena.fresh_var();
                        let list = self.arena.list(elem);
                        self.arena.unify(ty, list);
                        elem
                    }
                    TypeKind::Error(_) => ty,
                    _ => {
                        let message = format!("Cannot destructure non-list type {}", self.show(ty));
                        self.error_at(&pattern.loc, message)
                    }
                };
                for item in items {
                    match &item.kind {
                        PatternKind::Rest(Some(name)) => self.env.define(name.clone(), ty),
                        _ => self.bind_pattern(item, elem),
                    }
                }
            }
        }
    }

    fn bind_constructor(&mut self, pattern: &Pattern, name: &str, args: &[Pattern], ty: TypeId) {
        let Some(binding) = self.env.lookup_binding(name) else {
            self.error_at(&pattern.loc, format!("Unknown constructor '{name}'"));
            self.bind_all_to_error(args);
            return;
        };
        let ctor = if binding.generic {
            self.arena.instantiate(binding.ty)
        } else {
            binding.ty
        };
        let (params, built) = match self.kind(ctor) {
            TypeKind::Fn { params, result } => (params, result),
            _ => (Vec::new(), ctor),
        };
        if !self.arena.unify(built, ty) {
            let message = format!(
                "Pattern type mismatch: constructor '{name}' builds {}, but the value has type {}",
                self.show(built),
                self.show(ty)
            );
            self.error_at(&pattern.loc, message);
            self.bind_all_to_error(args);
            return;
        }
        if params.len() != args.len() {
            let message = format!(
                "Constructor '{name}' expects {} arguments, got {}",
                params.len(),
                args.len()
            );
            self.error_at(&pattern.loc, message);
            self.bind_all_to_error(args);
            return;
        }
        for (arg, param) in args.iter().zip(params) {
            self.bind_pattern(arg, param);
        }
    }

    fn bind_all_to_error(&mut self, patterns: &[Pattern]) {
        for pattern in patterns {
            for name in pattern.binders() {
                let poisoned = self.arena.error("unbound pattern");
                self.env.define(name, poisoned);
            }
        }
    }

    // --- expressions ---

    /// Infers the type of `expr`, reporting errors as it goes. A poisoned
    /// operand yields an error type without a second report.
    pub fn infer_expr(&mut self, expr: &Expr) -> TypeId {
        match &expr.kind {
            ExprKind::Int(_) => self.arena.int(),
            ExprKind::Float(_) => self.arena.float(),
            ExprKind::String(_) => self.arena.string(),
            ExprKind::Bool(_) => self.arena.bool(),
            ExprKind::Ident(name) => match self.env.lookup_binding(name) {
                Some(Binding { ty, generic: true }) => self.arena.instantiate(ty),
                Some(Binding { ty, .. }) => ty,
                None => self.error_at(&expr.loc, format!("Undefined variable: {name}")),
            },
            ExprKind::Binary { op, left, right } => self.infer_binary(expr, *op, left, right),
            ExprKind::Unary { op, operand } => self.infer_unary(expr, *op, operand),
            ExprKind::Call { callee, args } => self.infer_call(expr, callee, args, None),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition_ty = self.infer_expr(condition);
                if !self.is_error(condition_ty) {
                    let bool_ty = self.arena.bool();
                    if !self.arena.unify(condition_ty, bool_ty) {
                        let message =
                            format!("If condition must be Bool, got {}", self.show(condition_ty));
                        self.error_at(&condition.loc, message);
                    }
                }
                let then_ty = self.infer_expr(then_branch);
                let Some(else_branch) = else_branch else {
                    self.discard(then_ty, then_branch.result_loc());
                    return self.arena.unit();
                };
                let else_ty = self.infer_expr(else_branch);
                if self.is_error(then_ty) || self.is_error(else_ty) {
                    return self.arena.error("branch");
                }
                if !self.arena.unify(then_ty, else_ty) {
                    let message = format!(
                        "If branches have different types: {} vs {}",
                        self.show(then_ty),
                        self.show(else_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                then_ty
            }
            ExprKind::Match { value, arms } => {
                let scrutinee = match value {
                    Some(value) => self.infer_expr(value),
                    None => self.arena.bool(),
                };
                self.check_arms(scrutinee, arms, "Match")
                    .unwrap_or_else(|| self.arena.unit())
            }
            ExprKind::Block { stmts, final_expr } => {
                self.env.push_scope();
                for stmt in stmts {
                    self.check_stmt_inner(stmt);
                }
                let ty = match final_expr {
                    Some(expr) => self.infer_expr(expr),
                    None => self.arena.unit(),
                };
                self.env.pop_scope();
                ty
            }
            ExprKind::List(items) => {
                let Some((first, rest)) = items.split_first() else {
                    let elem = self.arena.fresh_var();
                    return self.arena.list(elem);
                };
                let elem = self.infer_expr(first);
                for (offset, item) in rest.iter().enumerate() {
                    let item_ty = self.infer_expr(item);
                    if self.is_error(item_ty) || self.is_error(elem) {
                        continue;
                    }
                    if !self.arena.unify(elem, item_ty) {
                        let message = format!(
                            "List element type mismatch: expected {}, got {} at index {}",
                            self.show(elem),
                            self.show(item_ty),
                            offset + 1
                        );
                        self.error_at(&item.loc, message);
                    }
                }
                self.arena.list(elem)
            }
            ExprKind::Bind { name, value } => {
                let ty = self.infer_expr(value);
                let ok = self.unwrap_result(ty, &value.loc, "<-");
                self.env.define(name.clone(), ok);
                ok
            }
            ExprKind::With {
                bindings,
                body,
                else_arms,
            } => {
                self.env.push_scope();
                let err = self.arena.fresh_var();
                for binding in bindings {
                    let ty = self.infer_expr(&binding.value);
                    let ok = match self.result_parts(ty) {
                        Some((ok, binding_err)) => {
                            if !self.arena.unify(err, binding_err) {
                                let message = format!(
                                    "with bindings have different error types: {} vs {}",
                                    self.show(err),
                                    self.show(binding_err)
                                );
                                self.error_at(&binding.loc, message);
                            }
                            ok
                        }
                        None if self.is_error(ty) => ty,
                        None => {
                            let message =
                                format!("with binding requires Result type, got {}", self.show(ty));
                            self.error_at(&binding.value.loc, message)
                        }
                    };
                    self.env.define(binding.name.clone(), ok);
                }
                let body_ty = self.infer_expr(body);
                self.env.pop_scope();
                if else_arms.is_empty() {
                    self.result_obligation(err, &expr.loc, "with");
                    return body_ty;
                }
                let ok = self.arena.fresh_var();
                let scrutinee = self.arena.result(ok, err);
                let Some(arms_ty) = self.check_arms(scrutinee, else_arms, "With") else {
                    return body_ty;
                };
                if !self.is_error(body_ty) && !self.arena.unify(body_ty, arms_ty) {
                    let message = format!(
                        "with else arms must have the body's type: expected {}, got {}",
                        self.show(body_ty),
                        self.show(arms_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                body_ty
            }
            ExprKind::Dot { object, field } => self.infer_dot(expr, object, field),
            ExprKind::Range { start, end, .. } => {
                let start_ty = self.infer_expr(start);
                let end_ty = self.infer_expr(end);
                if self.is_error(start_ty) || self.is_error(end_ty) {
                    return self.arena.error("range");
                }
                if !self.arena.unify(start_ty, end_ty) {
                    let message = format!(
                        "Range bounds must have same type: {} vs {}",
                        self.show(start_ty),
                        self.show(end_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                self.arena.range(start_ty)
            }
            ExprKind::For {
                var,
                iterable,
                body,
            } => {
                let iterable_ty = self.infer_expr(iterable);
                let elem = self.iterable_elem(iterable_ty, &iterable.loc, "for loop");
                self.env.push_scope();
                self.env.define(var.clone(), elem);
                let body_ty = self.infer_expr(body);
                self.discard(body_ty, body.result_loc());
                self.env.pop_scope();
                self.arena.unit()
            }
            ExprKind::While { condition, body } => {
                self.expect_bool(condition, "While condition must be Bool");
                let body_ty = self.infer_expr(body);
                self.discard(body_ty, body.result_loc());
                self.arena.unit()
            }
            ExprKind::Loop { body } => {
                let body_ty = self.infer_expr(body);
                self.discard(body_ty, body.result_loc());
                self.arena.unit()
            }
            ExprKind::Lambda { params, body } => {
                self.env.push_scope();
                let param_tys: Vec<TypeId> = params
                    .iter()
                    .map(|param| {
                        let ty = self.arena.fresh_var();
                        self.env.define(param.clone(), ty);
                        ty
                    })
                    .collect();
                self.returns.push(None);
                let body_ty = self.infer_expr(body);
                self.returns.pop();
                self.env.pop_scope();
                self.arena.func(param_tys, body_ty)
            }
            ExprKind::InterpString(parts) => {
                for part in parts {
                    if let InterpPart::Expr(inner) = part {
                        self.infer_expr(inner);
                    }
                }
                self.arena.string()
            }
            ExprKind::Map(entries) => {
                let key = self.arena.fresh_var();
                let value = self.arena.fresh_var();
                for (idx, entry) in entries.iter().enumerate() {
                    let key_ty = self.infer_expr(&entry.key);
                    if !self.is_error(key_ty) && !self.arena.unify(key, key_ty) {
                        self.error_at(
                            &entry.key.loc,
                            format!("Map key type mismatch at entry {idx}"),
                        );
                    }
                    let value_ty = self.infer_expr(&entry.value);
                    if !self.is_error(value_ty) && !self.arena.unify(value, value_ty) {
                        self.error_at(
                            &entry.value.loc,
                            format!("Map value type mismatch at entry {idx}"),
                        );
                    }
                }
                self.arena.map(key, value)
            }
            ExprKind::Tuple(items) if items.is_empty() => self.arena.unit(),
            ExprKind::Tuple(items) => {
                let items = items.iter().map(|item| self.infer_expr(item)).collect();
                self.arena.tuple(items)
            }
            ExprKind::RecordUpdate { base, fields } => {
                let base_ty = self.infer_expr(base);
                if self.is_error(base_ty) {
                    return base_ty;
                }
                let Some(record) = self.record_of(base_ty) else {
                    let message =
                        format!("Cannot update fields of non-record type {}", self.show(base_ty));
                    return self.error_at(&base.loc, message);
                };
                for field in fields {
                    let value_ty = self.infer_expr(&field.value);
                    let Some(expected) = record.get(&field.name).copied() else {
                        let message =
                            format!("Record {} has no field '{}'", self.show(base_ty), field.name);
                        self.error_at(&field.loc, message);
                        continue;
                    };
                    if !self.is_error(value_ty) && !self.arena.unify(expected, value_ty) {
                        let message = format!(
                            "Field '{}' expects {}, got {}",
                            field.name,
                            self.show(expected),
                            self.show(value_ty)
                        );
                        self.error_at(&field.value.loc, message);
                    }
                }
                base_ty
            }
            ExprKind::ListComp {
                body,
                var,
                iterable,
                condition,
            } => {
                let iterable_ty = self.infer_expr(iterable);
                let elem = self.iterable_elem(iterable_ty, &iterable.loc, "List comprehension");
                self.env.push_scope();
                self.env.define(var.clone(), elem);
                if let Some(condition) = condition {
                    self.expect_bool(condition, "List comprehension filter must be Bool");
                }
                let body_ty = self.infer_expr(body);
                self.env.pop_scope();
                self.arena.list(body_ty)
            }
            ExprKind::Spawn(inner) => {
                self.infer_expr(inner);
                self.arena.int()
            }
            ExprKind::Send { target, message } => {
                let target_ty = self.infer_expr(target);
                let int = self.arena.int();
                if !self.is_error(target_ty) && !self.arena.unify(target_ty, int) {
                    let text = format!(
                        "send target must be a process id (Int), got {}",
                        self.show(target_ty)
                    );
                    self.error_at(&target.loc, text);
                }
                self.infer_expr(message);
                self.arena.bool()
            }
            ExprKind::Receive { arms, after } => {
                let message = self.arena.fresh_var();
                let arms_ty = self.check_arms(message, arms, "Receive");
                let Some(after) = after else {
                    return arms_ty.unwrap_or_else(|| self.arena.unit());
                };
                let timeout = self.infer_expr(&after.timeout);
                let int = self.arena.int();
                if !self.is_error(timeout) && !self.arena.unify(timeout, int) {
                    let text = format!("Receive timeout must be Int, got {}", self.show(timeout));
                    self.error_at(&after.timeout.loc, text);
                }
                let after_ty = match &after.body {
                    Some(body) => self.infer_expr(body),
                    None => self.arena.unit(),
                };
                match arms_ty {
                    Some(arms_ty) => {
                        if !self.is_error(after_ty) && !self.arena.unify(arms_ty, after_ty) {
                            let text = format!(
                                "Receive arm types must be equal: expected {}, got {}",
                                self.show(arms_ty),
                                self.show(after_ty)
                            );
                            self.error_at(&after.loc, text);
                        }
                        arms_ty
                    }
                    None => after_ty,
                }
            }
            ExprKind::Try(inner) => {
                let ty = self.infer_expr(inner);
                self.unwrap_result(ty, &inner.loc, "?")
            }
            ExprKind::Index { object, index } => {
                let object_ty = self.infer_expr(object);
                let index_ty = self.infer_expr(index);
                if self.is_error(object_ty) || self.is_error(index_ty) {
                    return self.arena.error("index");
                }
                match self.kind(object_ty) {
                    TypeKind::Con { name, args } if name == "List" && args.len() == 1 => {
                        let int = self.arena.int();
                        if !self.arena.unify(index_ty, int) {
                            let message =
                                format!("List index must be Int, got {}", self.show(index_ty));
                            return self.error_at(&index.loc, message);
                        }
                        args[0]
                    }
                    TypeKind::Con { name, args } if name == "Map" && args.len() == 2 => {
                        if !self.arena.unify(args[0], index_ty) {
                            let message = format!(
                                "Map key type mismatch: expected {}, got {}",
                                self.show(args[0]),
                                self.show(index_ty)
                            );
                            return self.error_at(&index.loc, message);
                        }
                        args[1]
                    }
                    TypeKind::Var { .. } => self.arena.fresh_var(),
                    _ => {
                        let message = format!("Cannot index type {}", self.show(object_ty));
                        self.error_at(&object.loc, message)
                    }
                }
            }
        }
    }

    fn expect_bool(&mut self, expr: &Expr, what: &str) {
        let ty = self.infer_expr(expr);
        if self.is_error(ty) {
            return;
        }
        let bool_ty = self.arena.bool();
        if !self.arena.unify(ty, bool_ty) {
            let message = format!("{what}, got {}", self.show(ty));
            self.error_at(&expr.loc, message);
        }
    }

    fn infer_binary(&mut self, expr: &Expr, op: BinaryOp, left: &Expr, right: &Expr) -> TypeId {
        if op == BinaryOp::Pipe {
            return self.infer_pipe(left, right);
        }
        let left_ty = self.infer_expr(left);
        let right_ty = self.infer_expr(right);
        if self.is_error(left_ty) || self.is_error(right_ty) {
            return self.arena.error("operand");
        }
        let symbol = op.symbol();

        if op.is_arithmetic() {
            if self.arena.is_unbound_var(left_ty) || self.arena.is_unbound_var(right_ty) {
                self.arena.unify(left_ty, right_ty);
            }
            let same = self.arena.equals(left_ty, right_ty);
            if same && self.arena.is_numeric(left_ty) {
                return left_ty;
            }
            if same && op == BinaryOp::Add && matches!(self.kind(left_ty), TypeKind::String) {
                return left_ty;
            }
            if same && self.arena.is_unbound_var(left_ty) {
                return left_ty;
            }
            let message = format!(
                "Cannot apply '{symbol}' to {} and {}",
                self.show(left_ty),
                self.show(right_ty)
            );
            return self.error_at(&expr.loc, message);
        }

        match op {
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                if !self.arena.unify(left_ty, right_ty) {
                    let message = format!(
                        "Cannot compare {} with {} using '{symbol}'",
                        self.show(left_ty),
                        self.show(right_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                if !self.arena.is_comparable(left_ty) {
                    let message = format!("Type {} is not comparable", self.show(left_ty));
                    return self.error_at(&expr.loc, message);
                }
                self.arena.bool()
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                if !self.arena.unify(left_ty, right_ty) {
                    let message = format!(
                        "Cannot compare {} with {} using '{symbol}'",
                        self.show(left_ty),
                        self.show(right_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                self.arena.bool()
            }
            BinaryOp::And | BinaryOp::Or => {
                let bool_ty = self.arena.bool();
                if !self.arena.unify(left_ty, bool_ty) {
                    let message = format!(
                        "Left operand of '{symbol}' must be Bool, got {}",
                        self.show(left_ty)
                    );
                    return self.error_at(&left.loc, message);
                }
                if !self.arena.unify(right_ty, bool_ty) {
                    let message = format!(
                        "Right operand of '{symbol}' must be Bool, got {}",
                        self.show(right_ty)
                    );
                    return self.error_at(&right.loc, message);
                }
                bool_ty
            }
            BinaryOp::In => {
                let container = self.kind(right_ty);
                let elem = match container {
                    TypeKind::Con { name, args }
                        if (name == "List" || name == "Range") && args.len() == 1 =>
                    {
                        Some(args[0])
                    }
                    TypeKind::Con { name, args } if name == "Map" && args.len() == 2 => {
                        Some(args[0])
                    }
                    TypeKind::String => Some(right_ty),
                    TypeKind::Var { .. } => {
                        let list = self.arena.list(left_ty);
                        self.arena.unify(right_ty, list);
                        Some(left_ty)
                    }
                    _ => None,
                };
                let Some(elem) = elem else {
                    let message = format!(
                        "Operator 'in' requires a List, Map or Range, got {}",
                        self.show(right_ty)
                    );
                    return self.error_at(&right.loc, message);
                };
                if !self.arena.unify(left_ty, elem) {
                    let message = format!(
                        "Cannot check membership of {} in {}",
                        self.show(left_ty),
                        self.show(right_ty)
                    );
                    return self.error_at(&expr.loc, message);
                }
                self.arena.bool()
            }
            _ => self.arena.error("operator"),
        }
    }

    fn infer_unary(&mut self, expr: &Expr, op: UnaryOp, operand: &Expr) -> TypeId {
        let ty = self.infer_expr(operand);
        if self.is_error(ty) {
            return ty;
        }
        match op {
            UnaryOp::Neg => {
                if self.arena.is_numeric(ty) || self.arena.is_unbound_var(ty) {
                    ty
                } else {
                    let message = format!("Cannot negate type {}", self.show(ty));
                    self.error_at(&expr.loc, message)
                }
            }
            UnaryOp::Not => {
                let bool_ty = self.arena.bool();
                if self.arena.unify(ty, bool_ty) {
                    bool_ty
                } else {
                    let message = format!("Operator 'not' requires Bool, got {}", self.show(ty));
                    self.error_at(&expr.loc, message)
                }
            }
        }
    }

    /// `value |> f(args)` checks as `f(value, args)`.
    fn infer_pipe(&mut self, left: &Expr, right: &Expr) -> TypeId {
        let left_ty = self.infer_expr(left);
        if self.is_error(left_ty) {
            return left_ty;
        }
        match &right.kind {
            ExprKind::Call { callee, args } => {
                self.infer_call(right, callee, args, Some((left_ty, &left.loc)))
            }
            _ => self.error_at(&right.loc, "Pipe target must be a function call"),
        }
    }

    fn infer_call(
        &mut self,
        expr: &Expr,
        callee: &Expr,
        args: &[CallArg],
        piped: Option<(TypeId, &SourceLoc)>,
    ) -> TypeId {
        let ordered = match self.order_record_args(callee, args) {
            Ok(ordered) => ordered,
            Err(error) => return error,
        };
        let callee_ty = self.infer_expr(callee);
        if self.is_error(callee_ty) {
            return callee_ty;
        }
        let offset = usize::from(piped.is_some());
        let total = ordered.len() + offset;

        let (params, result) = match self.kind(callee_ty) {
            TypeKind::Fn { params, result } => (params, result),
            TypeKind::Var { .. } => {
                let params: Vec<TypeId> = (0..total).map(|_| self.arena.fresh_var()).collect();
                let result = self.arena.fresh_var();
                let func = self.arena.func(params.clone(), result);
                self.arena.unify(callee_ty, func);
                (params, result)
            }
            _ => {
                let message = format!("Cannot call non-function type {}", self.show(callee_ty));
                return self.error_at(&callee.loc, message);
            }
        };

        if params.len() != total {
            let suffix = if piped.is_some() {
                " (including piped value)"
            } else {
                ""
            };
            let message = format!("Expected {} arguments, got {total}{suffix}", params.len());
            return self.error_at(&expr.loc, message);
        }

        if let Some((piped_ty, loc)) = piped {
            if !self.arena.unify(params[0], piped_ty) {
                let message = format!(
                    "argument type mismatch: Argument 1: expected {}, got {}",
                    self.show(params[0]),
                    self.show(piped_ty)
                );
                return self.error_at(loc, message);
            }
        }
        for (idx, arg) in ordered.iter().enumerate() {
            let actual = self.infer_expr(arg);
            if self.is_error(actual) {
                return actual;
            }
            let expected = params[idx + offset];
            if !self.arena.unify(expected, actual) {
                let message = format!(
                    "argument type mismatch: Argument {}: expected {}, got {}",
                    idx + offset + 1,
                    self.show(expected),
                    self.show(actual)
                );
                return self.error_at(&arg.loc, message);
            }
        }
        result
    }

    /// Puts labeled arguments of a record construction `Point(y: 2, x: 1)`
    /// into field order. Other calls keep their argument order.
    fn order_record_args<'e>(
        &mut self,
        callee: &Expr,
        args: &'e [CallArg],
    ) -> Result<Vec<&'e Expr>, TypeId> {
        let positional = || -> Vec<&'e Expr> { args.iter().map(|arg| &arg.value).collect() };
        if args.iter().all(|arg| arg.label.is_none()) {
            return Ok(positional());
        }
        let ExprKind::Ident(name) = &callee.kind else {
            return Ok(positional());
        };
        let Some(fields) = self.env.record_fields(name) else {
            return Ok(positional());
        };
        let names: Vec<String> = fields.keys().cloned().collect();
        let mut slots: Vec<Option<&'e Expr>> = vec![None; names.len()];
        let mut next = 0;
        for arg in args {
            let idx = match &arg.label {
                Some(label) => match names.iter().position(|field| field == label) {
                    Some(idx) => idx,
                    None => {
                        let message = format!("Record {name} has no field '{label}'");
                        return Err(self.error_at(&arg.value.loc, message));
                    }
                },
                None => next,
            };
            if let Some(slot) = slots.get_mut(idx) {
                *slot = Some(&arg.value);
            }
            next = idx + 1;
        }
        let mut ordered = Vec::with_capacity(slots.len());
        for (slot, field) in slots.into_iter().zip(&names) {
            match slot {
                Some(value) => ordered.push(value),
                None => {
                    let message = format!("Missing field '{field}' in {name}");
                    return Err(self.error_at(&callee.loc, message));
                }
            }
        }
        Ok(ordered)
    }

    fn infer_dot(&mut self, expr: &Expr, object: &Expr, field: &str) -> TypeId {
        let object_ty = self.infer_expr(object);
        if self.is_error(object_ty) {
            return object_ty;
        }
        match self.kind(object_ty) {
            TypeKind::Tuple(items) => match field.parse::<usize>() {
                Ok(idx) if idx < items.len() => items[idx],
                Ok(idx) => {
                    let message = format!(
                        "Tuple index {idx} out of bounds (tuple has {} elements)",
                        items.len()
                    );
                    self.error_at(&expr.loc, message)
                }
                Err(_) => {
                    let message =
                        format!("Cannot access field '{field}' on type {}", self.show(object_ty));
                    self.error_at(&expr.loc, message)
                }
            },
            TypeKind::Con { name, .. } if name == "Module" => self.arena.fresh_var(),
            TypeKind::Var { .. } => self.arena.fresh_var(),
            _ => {
                if let Some(ty) = self
                    .record_of(object_ty)
                    .and_then(|fields| fields.get(field).copied())
                {
                    return ty;
                }
                let message =
                    format!("Cannot access field '{field}' on type {}", self.show(object_ty));
                self.error_at(&expr.loc, message)
            }
        }
    }

    /// Field types of a record value, with the record's type parameters
    /// replaced by the value's type arguments.
    fn record_of(&mut self, ty: TypeId) -> Option<IndexMap<String, TypeId>> {
        let TypeKind::Con { name, args } = self.kind(ty) else {
            return None;
        };
        let info = self.env.lookup_type(&name)?.clone();
        let TypeShape::Record(fields) = info.shape else {
            return None;
        };
        let mapping: Vec<(TypeId, TypeId)> = info.params.into_iter().zip(args).collect();
        Some(
            fields
                .into_iter()
                .map(|(field, field_ty)| (field, self.arena.substitute(field_ty, &mapping)))
                .collect(),
        )
    }

    fn iterable_elem(&mut self, ty: TypeId, loc: &SourceLoc, what: &str) -> TypeId {
        if self.is_error(ty) {
            return ty;
        }
        match self.kind(ty) {
            TypeKind::Con { name, args }
                if (name == "List" || name == "Range") && args.len() == 1 =>
            {
                args[0]
            }
            TypeKind::Con { name, args } if name == "Map" && args.len() == 2 => args[1],
            TypeKind::Var { .. } => {
                let elem = self.arena.fresh_var();
                let list = self.arena.list(elem);
                self.arena.unify(ty, list);
                elem
            }
            _ => {
                let message = format!(
                    "{what} requires an iterable (List, Map or Range), got {}",
                    self.show(ty)
                );
                self.error_at(loc, message)
            }
        }
    }

    fn result_parts(&mut self, ty: TypeId) -> Option<(TypeId, TypeId)> {
        if self.arena.is_unbound_var(ty) {
            let ok = self.arena.fresh_var();
            let err = self.arena.fresh_var();
            let result = self.arena.result(ok, err);
            self.arena.unify(ty, result);
            return Some((ok, err));
        }
        match self.arena.con_args(ty, "Result")?.as_slice() {
            [ok, err] => Some((*ok, *err)),
            _ => None,
        }
    }

    /// The success type of a `?` or `<-` operand. The error side must fit
    /// the enclosing function's declared return type.
    fn unwrap_result(&mut self, ty: TypeId, loc: &SourceLoc, operator: &str) -> TypeId {
        if self.is_error(ty) {
            return ty;
        }
        let Some((ok, err)) = self.result_parts(ty) else {
            let message = format!(
                "The {operator} operator requires a Result type, got {}",
                self.show(ty)
            );
            return self.error_at(loc, message);
        };
        self.result_obligation(err, loc, operator);
        ok
    }

    fn result_obligation(&mut self, err: TypeId, loc: &SourceLoc, operator: &str) {
        let Some(Some(declared)) = self.returns.last().copied() else {
            return;
        };
        if self.is_error(declared) {
            return;
        }
        let fits = match self.result_parts(declared) {
            Some((_, declared_err)) => self.arena.unify(declared_err, err),
            None => false,
        };
        if !fits {
            let message = format!(
                "The {operator} operator requires the enclosing function to return Result(_, {}), but it returns {}",
                self.show(err),
                self.show(declared)
            );
            self.error_at(loc, message);
        }
    }

    /// Checks arms against `scrutinee`. Returns the shared arm type, or
    /// `None` when there are no arms.
    /// `None` only for an empty arm list. When every arm body is poisoned the
    /// result is poisoned too.
    fn check_arms(&mut self, scrutinee: TypeId, arms: &[MatchArm], what: &str) -> Option<TypeId> {
        if arms.is_empty() {
            return None;
        }
        let mut result: Option<TypeId> = None;
        for arm in arms {
            self.env.push_scope();
            self.bind_pattern(&arm.pattern, scrutinee);
            if let Some(guard) = &arm.guard {
                let guard_ty = self.infer_expr(guard);
                let bool_ty = self.arena.bool();
                if !self.is_error(guard_ty) && !self.arena.unify(guard_ty, bool_ty) {
                    let message = format!("{what} guard must be Bool, got {}", self.show(guard_ty));
                    self.error_at(&guard.loc, message);
                }
            }
            let body_ty = self.infer_expr(&arm.body);
            self.env.pop_scope();
            if self.is_error(body_ty) {
                continue;
            }
            match result {
                None => result = Some(body_ty),
                Some(expected) => {
                    if !self.arena.unify(expected, body_ty) {
                        let message = format!(
                            "{what} arm types must be equal: expected {}, got {}",
                            self.show(expected),
                            self.show(body_ty)
                        );
                        self.error_at(arm.body.result_loc(), message);
                    }
                }
            }
        }
        Some(result.unwrap_or_else(|| self.arena.error("arms")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_parser::{parse_expr, parse_program};
    use proptest::prelude::*;

    fn check_source(source: &str) -> Checker {
        let (program, errors) = parse_program(source, "test.fn");
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        let mut checker = Checker::new();
        checker.check_program(&program);
        checker
    }

    fn messages(checker: &Checker) -> Vec<&str> {
        checker
            .errors()
            .iter()
            .map(|error| error.message.as_str())
            .collect()
    }

    fn infer(source: &str) -> (Checker, String) {
        let expr = parse_expr(source).expect("parse expression");
        let mut checker = Checker::new();
        let ty = checker.infer_expr(&expr);
        let shown = checker.type_to_string(ty);
        (checker, shown)
    }

    #[test]
    fn keywords_are_reserved_and_distinct_from_builtins() {
        for word in KEYWORDS {
            let tokens = fern_parser::tokenize(word);
            assert!(
                !matches!(tokens[0].kind, fern_parser::TokenKind::Ident(_)),
                "{word} lexes as an identifier"
            );
            assert!(!BUILTINS.contains(word));
        }
    }

    #[test]
    fn infers_arithmetic_with_precedence() {
        let (checker, ty) = infer("1 + 2 * 3");
        assert!(!checker.has_errors());
        assert_eq!(ty, "Int");
    }

    #[test]
    fn allows_string_concatenation() {
        let (checker, ty) = infer("\"a\" + \"b\"");
        assert!(!checker.has_errors());
        assert_eq!(ty, "String");
    }

    #[test]
    fn errors_on_mixed_arithmetic() {
        let (checker, _) = infer("1 + 2.5");
        assert_eq!(messages(&checker), vec!["Cannot apply '+' to Int and Float"]);
    }

    #[test]
    fn errors_on_argument_type_mismatch_at_argument() {
        let checker = check_source("fn f(x: Int) -> Int: x + 1\nf(\"hi\")\n");
        let error = checker.first_error().expect("an error");
        assert_eq!(
            error.message,
            "argument type mismatch: Argument 1: expected Int, got String"
        );
        let loc = error.loc.as_ref().expect("location");
        assert_eq!((loc.line, loc.column), (2, 3));
        assert_eq!(
            error.to_string(),
            "test.fn:2:3: argument type mismatch: Argument 1: expected Int, got String"
        );
        assert_eq!(checker.errors().len(), 1);
    }

    #[test]
    fn errors_on_wrong_arity() {
        let checker = check_source("fn f(x: Int) -> Int: x\nlet y = f(1, 2)\n");
        assert_eq!(messages(&checker), vec!["Expected 1 arguments, got 2"]);
    }

    #[test]
    fn infers_list_comprehension() {
        let expr = parse_expr("[x for x in nums if x > 0]").expect("parse");
        let mut checker = Checker::new();
        let int = checker.arena_mut().int();
        let list = checker.arena_mut().list(int);
        checker.define("nums", list);
        let ty = checker.infer_expr(&expr);
        assert!(!checker.has_errors());
        assert_eq!(checker.type_to_string(ty), "List(Int)");

        let bad = parse_expr("[x for x in nums if x]").expect("parse");
        checker.infer_expr(&bad);
        assert_eq!(messages(&checker), vec!["List comprehension filter must be Bool, got Int"]);
    }

    #[test]
    fn instantiates_generic_functions_per_call() {
        let checker = check_source(
            "fn identity(x: a) -> a: x\nlet n = identity(42)\nlet s = identity(\"s\")\n",
        );
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("n").as_deref(), Some("Int"));
        assert_eq!(checker.describe("s").as_deref(), Some("String"));
        assert_eq!(checker.describe("identity").as_deref(), Some("(a) -> a"));
    }

    #[test]
    fn errors_on_declared_return_type_at_body_value() {
        let checker = check_source("fn main() -> Int:\n    \"oops\"\n");
        let error = checker.first_error().expect("an error");
        assert_eq!(
            error.message,
            "Function 'main' body has type String, but declared return type is Int"
        );
        let loc = error.loc.as_ref().expect("location");
        assert_eq!((loc.line, loc.column), (2, 5));
    }

    #[test]
    fn poisoned_operands_report_once() {
        let (checker, ty) = infer("(missing + 1) * 2 - 3");
        assert_eq!(messages(&checker), vec!["Undefined variable: missing"]);
        assert!(ty.starts_with("<error"));

        let (checker, _) = infer("(1 + \"a\") * 2");
        assert_eq!(checker.errors().len(), 1);
    }

    #[test]
    fn rejects_unhandled_result_statement() {
        let source = "fn parse(s: String) -> Result(Int, String): Ok(1)\nfn main() -> Result(Int, String):\n    parse(\"1\")\n    Ok(0)\n";
        let checker = check_source(source);
        assert_eq!(messages(&checker), vec!["Unhandled Result value"]);
    }

    #[test]
    fn rejects_result_discarded_by_block_forms() {
        let prelude = "fn r() -> Result(Int, String): Ok(1)\n";
        let discarding = [
            "if true:\n        r()\n",
            "for i in [1, 2]:\n        r()\n",
            "while false:\n        r()\n",
            "loop:\n        r()\n",
            "defer r()\n",
        ];
        for form in discarding {
            let source = format!("{prelude}fn main() -> Int:\n    {form}    0\n");
            let checker = check_source(&source);
            assert_eq!(messages(&checker), vec!["Unhandled Result value"], "{form}");
        }
    }

    #[test]
    fn discarded_block_reports_at_its_tail() {
        let source = "fn r() -> Result(Int, String): Ok(1)\nfn main() -> Int:\n    for i in [1]:\n        let n = i\n        r()\n    0\n";
        let checker = check_source(source);
        let loc = checker.first_error().and_then(|e| e.loc.clone()).expect("location");
        assert_eq!((loc.line, loc.column), (5, 9));
    }

    #[test]
    fn poisoned_match_arms_poison_the_match() {
        let source = "fn f(x: Int) -> Int:\n    let z = match x:\n        1 -> nope\n        _ -> nope2\n    z + 1\n";
        let checker = check_source(source);
        assert_eq!(
            messages(&checker),
            vec!["Undefined variable: nope", "Undefined variable: nope2"]
        );
    }

    #[test]
    fn allows_handled_result_forms() {
        let prelude = "fn parse(s: String) -> Result(Int, String): Ok(1)\n";
        let handled = [
            "fn main() -> Result(Int, String):\n    parse(\"1\")?\n    Ok(0)\n",
            "fn main() -> Result(Int, String):\n    x <- parse(\"1\")\n    Ok(x)\n",
            "fn main() -> Result(Int, String):\n    match parse(\"1\"):\n        Ok(n) -> n\n        Err(e) -> 0\n    Ok(0)\n",
            "fn main() -> Int:\n    with n <- parse(\"1\") do n else: Err(e) -> 0\n",
        ];
        for body in handled {
            let checker = check_source(&format!("{prelude}{body}"));
            assert!(!checker.has_errors(), "{body}: {:?}", checker.errors());
        }
    }

    #[test]
    fn errors_when_try_escapes_non_result_function() {
        let source = "fn parse(s: String) -> Result(Int, String): Ok(1)\nfn g() -> Int:\n    let x = parse(\"1\")?\n    x\n";
        let checker = check_source(source);
        assert_eq!(
            messages(&checker),
            vec!["The ? operator requires the enclosing function to return Result(_, String), but it returns Int"]
        );
    }

    #[test]
    fn errors_on_try_of_non_result() {
        let checker = check_source("fn g() -> Result(Int, String):\n    let x = 5?\n    Ok(x)\n");
        assert_eq!(messages(&checker), vec!["The ? operator requires a Result type, got Int"]);
    }

    #[test]
    fn distributes_option_arguments_to_patterns() {
        let checker =
            check_source("let v = Some(5)\nlet r = match v: Some(n) -> n + 1, None -> 0\n");
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("r").as_deref(), Some("Int"));
    }

    #[test]
    fn errors_on_mismatched_match_arms() {
        let (checker, _) = infer("match 1: 1 -> \"a\", _ -> 2");
        assert_eq!(
            messages(&checker),
            vec!["Match arm types must be equal: expected String, got Int"]
        );
    }

    #[test]
    fn errors_on_non_bool_if_condition_and_branch_mismatch() {
        let (checker, _) = infer("if 1: 2 else: 3");
        assert_eq!(messages(&checker), vec!["If condition must be Bool, got Int"]);
        let (checker, _) = infer("if true: 2 else: \"x\"");
        assert_eq!(messages(&checker), vec!["If branches have different types: Int vs String"]);
        let (checker, ty) = infer("if true: 2");
        assert!(!checker.has_errors());
        assert_eq!(ty, "()");
    }

    #[test]
    fn errors_on_list_element_mismatch_with_index() {
        let (checker, _) = infer("[1, 2, \"a\"]");
        assert_eq!(
            messages(&checker),
            vec!["List element type mismatch: expected Int, got String at index 2"]
        );
        let (checker, ty) = infer("[]");
        assert!(!checker.has_errors());
        assert!(ty.starts_with("List("));
    }

    #[test]
    fn checks_records() {
        let source = "type Point:\n    x: Int\n    y: Int\nlet p = Point(y: 2, x: 1)\nlet q = %{p | x: 5}\nlet n = q.x\n";
        let checker = check_source(source);
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("q").as_deref(), Some("Point"));
        assert_eq!(checker.describe("n").as_deref(), Some("Int"));

        let source = "type Point:\n    x: Int\n    y: Int\nlet p = Point(x: 1, y: 2)\nlet z = p.z\n";
        let checker = check_source(source);
        assert_eq!(messages(&checker), vec!["Cannot access field 'z' on type Point"]);
    }

    #[test]
    fn checks_variants_through_match() {
        let source = "type Shape:\n    Circle(Float)\n    Square(Float)\nfn area(s):\n    match s:\n        Circle(r) -> r * r\n        Square(w) -> w * w\n";
        let checker = check_source(source);
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("area").as_deref(), Some("(Shape) -> Float"));
    }

    #[test]
    fn errors_on_unknown_field_type() {
        let checker = check_source("type Bad:\n    Thing(Nope)\n");
        assert_eq!(messages(&checker), vec!["Unknown type 'Nope'"]);
    }

    #[test]
    fn infers_multi_clause_function() {
        let checker = check_source("fn fact(0) -> 1\nfn fact(n) -> n * fact(n - 1)\n");
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("fact").as_deref(), Some("(Int) -> Int"));
    }

    #[test]
    fn allows_forward_references_between_functions() {
        let checker = check_source("fn a() -> Int: b()\nfn b() -> Int: 1\n");
        assert!(!checker.has_errors(), "{:?}", checker.errors());
    }

    #[test]
    fn scopes_shadow_and_restore() {
        let mut checker = Checker::new();
        let int = checker.arena_mut().int();
        let string = checker.arena_mut().string();
        checker.define("x", int);
        checker.push_scope();
        checker.define("x", string);
        assert_eq!(checker.describe("x").as_deref(), Some("String"));
        checker.pop_scope();
        assert_eq!(checker.describe("x").as_deref(), Some("Int"));
    }

    #[test]
    fn errors_on_tuple_index_out_of_bounds() {
        let (checker, _) = infer("(1, 2).5");
        assert_eq!(
            messages(&checker),
            vec!["Tuple index 5 out of bounds (tuple has 2 elements)"]
        );
        let (checker, ty) = infer("(1, \"a\").1");
        assert!(!checker.has_errors());
        assert_eq!(ty, "String");
    }

    #[test]
    fn errors_on_non_iterable_for() {
        let checker = check_source("for x in 5:\n    print(x)\n");
        assert_eq!(
            messages(&checker),
            vec!["for loop requires an iterable (List, Map or Range), got Int"]
        );
        let checker = check_source("for i in 0..10:\n    print(i)\n");
        assert!(!checker.has_errors());
    }

    #[test]
    fn infers_lambda_from_use() {
        let checker = check_source("let add = (a, b) -> a + b\nlet n = add(1, 2)\n");
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("n").as_deref(), Some("Int"));
    }

    #[test]
    fn checks_pipe_targets() {
        let checker = check_source("fn double(x: Int) -> Int: x * 2\nlet y = 3 |> double()\n");
        assert!(!checker.has_errors());
        assert_eq!(checker.describe("y").as_deref(), Some("Int"));
        let (checker, _) = infer("3 |> 4");
        assert_eq!(messages(&checker), vec!["Pipe target must be a function call"]);
    }

    #[test]
    fn checks_with_else_arms() {
        let source = "fn parse(s: String) -> Result(Int, String): Ok(1)\nlet v = with a <- parse(\"1\"), b <- parse(\"2\") do a + b else: Err(e) -> 0\n";
        let checker = check_source(source);
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("v").as_deref(), Some("Int"));
    }

    #[test]
    fn checks_interpolated_parts() {
        let (checker, ty) = infer("\"hi {nobody}\"");
        assert_eq!(ty, "String");
        assert_eq!(messages(&checker), vec!["Undefined variable: nobody"]);
    }

    #[test]
    fn checks_let_annotation() {
        let checker = check_source("let x: Int = \"no\"\n");
        assert_eq!(messages(&checker), vec!["Type mismatch: expected Int, got String"]);
    }

    #[test]
    fn binds_imported_module_names() {
        let source = "import std.io\nio.println(\"x\")\nimport std.list.{map}\nlet ys = map([1], (x) -> x)\n";
        let checker = check_source(source);
        assert!(!checker.has_errors(), "{:?}", checker.errors());
    }

    #[test]
    fn checks_map_literals_and_indexing() {
        let (checker, ty) = infer("%{\"a\": 1, \"b\": 2}[\"a\"]");
        assert!(!checker.has_errors());
        assert_eq!(ty, "Int");
        let (checker, _) = infer("%{\"a\": 1, 2: 3}");
        assert_eq!(messages(&checker), vec!["Map key type mismatch at entry 1"]);
        let (checker, _) = infer("5[0]");
        assert_eq!(messages(&checker), vec!["Cannot index type Int"]);
    }

    #[test]
    fn checks_actor_primitives() {
        let checker = check_source(
            "let pid = spawn(() -> 1)\nlet ok = send(pid, \"ping\")\nlet got = receive:\n    \"pong\" -> 1\n    after 100 -> 0\n",
        );
        assert!(!checker.has_errors(), "{:?}", checker.errors());
        assert_eq!(checker.describe("pid").as_deref(), Some("Int"));
        assert_eq!(checker.describe("ok").as_deref(), Some("Bool"));
        assert_eq!(checker.describe("got").as_deref(), Some("Int"));
    }

    #[test]
    fn free_function_reports_all_errors() {
        let (program, _) = parse_program("let a = missing\nlet b = 1 + true\n", "test.fn");
        let errors = super::check_program(&program).expect_err("type errors");
        assert_eq!(errors.len(), 2);
    }

    proptest! {
        #[test]
        fn poisoned_operand_adds_no_error(
            op in prop::sample::select(vec!["+", "-", "*", "/", "<", "==", "and", "or"]),
            value in 0i64..100,
            poisoned_left in any::<bool>(),
        ) {
            let source = if poisoned_left {
                format!("undefined_name {op} {value}")
            } else {
                format!("{value} {op} undefined_name")
            };
            let (checker, ty) = infer(&source);
            prop_assert_eq!(messages(&checker), vec!["Undefined variable: undefined_name"]);
            prop_assert!(ty.starts_with("<error"));
        }
    }
}
