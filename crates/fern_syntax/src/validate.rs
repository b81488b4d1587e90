//! Structural checks over a parsed tree. Nothing here looks at types.

use crate::{
    walk_expr, walk_function, walk_pattern, walk_stmt, walk_type_expr, AstVisitor, Expr, ExprKind,
    FnBody, FunctionDef, InterpPart, Pattern, PatternKind, Program, SourceLoc, Stmt, StmtKind,
    TypeDefBody, TypeExpr, TypeExprKind,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{loc}: {message}")]
pub struct ValidationError {
    pub message: String,
    pub loc: SourceLoc,
}

pub fn validate_program(program: &Program) -> Result<(), ValidationError> {
    let mut validator = Validator::default();
    for stmt in &program.stmts {
        validator.visit_stmt(stmt);
    }
    validator.finish()
}

pub fn validate_stmt(stmt: &Stmt) -> Result<(), ValidationError> {
    let mut validator = Validator::default();
    validator.visit_stmt(stmt);
    validator.finish()
}

pub fn validate_expr(expr: &Expr) -> Result<(), ValidationError> {
    let mut validator = Validator::default();
    validator.visit_expr(expr);
    validator.finish()
}

#[derive(Default)]
struct Validator {
    error: Option<ValidationError>,
}

impl Validator {
    fn finish(self) -> Result<(), ValidationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail(&mut self, message: &str, loc: &SourceLoc) {
        if self.error.is_none() {
            self.error = Some(ValidationError {
                message: message.to_string(),
                loc: loc.clone(),
            });
        }
    }

    /// Returns false once an error has been recorded so walks stop early.
    fn check_loc(&mut self, loc: &SourceLoc) -> bool {
        if self.error.is_some() {
            return false;
        }
        if loc.line == 0 || loc.column == 0 {
            self.fail("node has an invalid source location", loc);
            return false;
        }
        true
    }

    fn require_name(&mut self, name: &str, message: &str, loc: &SourceLoc) {
        if name.is_empty() {
            self.fail(message, loc);
        }
    }

    fn require_path(&mut self, path: &[String], empty: &str, segment: &str, loc: &SourceLoc) {
        if path.is_empty() {
            self.fail(empty, loc);
        } else if path.iter().any(String::is_empty) {
            self.fail(segment, loc);
        }
    }
}

impl AstVisitor for Validator {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if !self.check_loc(&stmt.loc) {
            return;
        }
        match &stmt.kind {
            StmtKind::Import { path, items, alias } => {
                self.require_path(
                    path,
                    "import path is empty",
                    "import path segment is empty",
                    &stmt.loc,
                );
                if items.iter().any(String::is_empty) {
                    self.fail("import item is empty", &stmt.loc);
                }
                if alias.as_deref() == Some("") {
                    self.fail("import alias is empty", &stmt.loc);
                }
            }
            StmtKind::Module { path } => {
                self.require_path(
                    path,
                    "module path is empty",
                    "module path segment is empty",
                    &stmt.loc,
                );
            }
            StmtKind::TypeDef(def) => {
                self.require_name(&def.name, "type name is empty", &stmt.loc);
                if def.derives.iter().any(String::is_empty) {
                    self.fail("derive name is empty", &stmt.loc);
                }
                match &def.body {
                    TypeDefBody::Variants(variants) => {
                        for variant in variants {
                            self.check_loc(&variant.loc);
                            self.require_name(&variant.name, "variant name is empty", &variant.loc);
                            for field in &variant.fields {
                                if field.name.as_deref() == Some("") {
                                    self.fail("variant field name is empty", &field.loc);
                                }
                            }
                        }
                    }
                    TypeDefBody::Record(fields) => {
                        for field in fields {
                            self.check_loc(&field.loc);
                            if field.name.as_deref().map_or(true, str::is_empty) {
                                self.fail("record field name is empty", &field.loc);
                            }
                        }
                    }
                }
            }
            StmtKind::Newtype {
                name, constructor, ..
            } => {
                self.require_name(name, "newtype name is empty", &stmt.loc);
                self.require_name(constructor, "newtype ctor is empty", &stmt.loc);
            }
            StmtKind::Trait(def) => {
                self.require_name(&def.name, "trait name is empty", &stmt.loc);
                for method in &def.methods {
                    self.check_loc(&method.loc);
                    self.require_name(&method.name, "trait method name is empty", &method.loc);
                }
            }
            StmtKind::Impl(def) => {
                self.require_name(&def.trait_name, "impl trait name is empty", &stmt.loc);
            }
            _ => {}
        }
        if self.error.is_none() {
            walk_stmt(self, stmt);
        }
    }

    fn visit_function(&mut self, function: &FunctionDef) {
        if !self.check_loc(&function.loc) {
            return;
        }
        self.require_name(&function.name, "function name is empty", &function.loc);
        match &function.body {
            FnBody::Typed(typed) => {
                for param in &typed.params {
                    self.check_loc(&param.loc);
                    self.require_name(&param.name, "function param name is empty", &param.loc);
                }
            }
            FnBody::Clauses(clauses) => {
                if clauses.is_empty() {
                    self.fail("function clauses are empty", &function.loc);
                }
                for clause in clauses {
                    self.check_loc(&clause.loc);
                }
            }
        }
        if self.error.is_none() {
            walk_function(self, function);
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        if !self.check_loc(&expr.loc) {
            return;
        }
        match &expr.kind {
            ExprKind::Ident(name) => self.require_name(name, "identifier name is empty", &expr.loc),
            ExprKind::Bind { name, .. } => self.require_name(name, "bind name is empty", &expr.loc),
            ExprKind::Dot { field, .. } => {
                self.require_name(field, "dot field is empty", &expr.loc)
            }
            ExprKind::For { var, .. } => self.require_name(var, "for var name is empty", &expr.loc),
            ExprKind::ListComp { var, .. } => {
                self.require_name(var, "list comp var name is empty", &expr.loc)
            }
            ExprKind::Lambda { params, .. } => {
                if params.iter().any(String::is_empty) {
                    self.fail("lambda param name is empty", &expr.loc);
                }
            }
            ExprKind::Match { arms, .. } => {
                if arms.is_empty() {
                    self.fail("match arms are empty", &expr.loc);
                }
                for arm in arms {
                    self.check_loc(&arm.loc);
                }
            }
            ExprKind::With { bindings, .. } => {
                if bindings.is_empty() {
                    self.fail("with has no bindings", &expr.loc);
                }
                for binding in bindings {
                    self.check_loc(&binding.loc);
                    self.require_name(&binding.name, "with binding name is empty", &binding.loc);
                }
            }
            ExprKind::RecordUpdate { fields, .. } => {
                for field in fields {
                    self.check_loc(&field.loc);
                    self.require_name(&field.name, "record field name is empty", &field.loc);
                }
            }
            ExprKind::Call { args, .. } => {
                if args.iter().any(|arg| arg.label.as_deref() == Some("")) {
                    self.fail("call arg label is empty", &expr.loc);
                }
            }
            ExprKind::InterpString(parts) => {
                if parts.is_empty() {
                    self.fail("interp parts are empty", &expr.loc);
                }
                let literal_only = parts.iter().all(|part| matches!(part, InterpPart::Literal(_)));
                if literal_only && parts.len() > 1 {
                    self.fail("interpolated string has no expressions", &expr.loc);
                }
            }
            ExprKind::Receive { after: Some(after), .. } => {
                self.check_loc(&after.loc);
                if after.body.is_none() {
                    self.fail("receive after timeout without body", &after.loc);
                }
            }
            _ => {}
        }
        if self.error.is_none() {
            walk_expr(self, expr);
        }
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        if !self.check_loc(&pattern.loc) {
            return;
        }
        match &pattern.kind {
            PatternKind::Ident(name) => {
                self.require_name(name, "pattern ident name is empty", &pattern.loc)
            }
            PatternKind::Constructor { name, .. } => {
                self.require_name(name, "constructor name is empty", &pattern.loc)
            }
            PatternKind::Rest(Some(name)) => {
                self.require_name(name, "rest pattern name is empty", &pattern.loc)
            }
            PatternKind::Lit(expr) => {
                if !expr.is_literal() {
                    self.fail("pattern literal is not a literal", &pattern.loc);
                }
            }
            _ => {}
        }
        if self.error.is_none() {
            walk_pattern(self, pattern);
        }
    }

    fn visit_type_expr(&mut self, ty: &TypeExpr) {
        if !self.check_loc(&ty.loc) {
            return;
        }
        if let TypeExprKind::Named { name, .. } = &ty.kind {
            self.require_name(name, "type name is empty", &ty.loc);
        }
        if self.error.is_none() {
            walk_type_expr(self, ty);
        }
    }
}
