use indexmap::IndexMap;

use crate::types::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub ty: TypeId,
    /// Generic bindings are instantiated afresh at every reference.
    pub generic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeShape {
    Record(IndexMap<String, TypeId>),
    Variants(IndexMap<String, Vec<TypeId>>),
    Newtype(TypeId),
    /// Primitives and opaque names.
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub name: String,
    /// The declared type with its parameters as variables, e.g. `Box(a)`.
    pub ty: TypeId,
    pub params: Vec<TypeId>,
    pub shape: TypeShape,
}

#[derive(Debug, Default)]
struct Frame {
    values: IndexMap<String, Binding>,
    types: IndexMap<String, TypeInfo>,
}

/// Lexical scopes, innermost last. The global frame is never popped.
#[derive(Debug)]
pub struct TypeEnv {
    frames: Vec<Frame>,
}

impl Default for TypeEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeEnv {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_scope(&mut self) {
        self.frames.push(Frame::default());
        tracing::trace!(depth = self.frames.len(), "push scope");
    }

    pub fn pop_scope(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
            tracing::trace!(depth = self.frames.len(), "pop scope");
        }
    }

    /// Binds `name` in the innermost scope, shadowing any outer binding.
    pub fn define(&mut self, name: impl Into<String>, ty: TypeId) {
        self.insert(name.into(), Binding { ty, generic: false });
    }

    pub fn define_generic(&mut self, name: impl Into<String>, ty: TypeId) {
        self.insert(name.into(), Binding { ty, generic: true });
    }

    fn insert(&mut self, name: String, binding: Binding) {
        if let Some(frame) = self.frames.last_mut() {
            frame.values.insert(name, binding);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.lookup_binding(name).map(|binding| binding.ty)
    }

    pub fn lookup_binding(&self, name: &str) -> Option<Binding> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.values.get(name).copied())
    }

    pub fn is_defined_in_current_scope(&self, name: &str) -> bool {
        self.frames
            .last()
            .is_some_and(|frame| frame.values.contains_key(name))
    }

    pub fn define_type(&mut self, info: TypeInfo) {
        if let Some(frame) = self.frames.last_mut() {
            frame.types.insert(info.name.clone(), info);
        }
    }

    pub fn lookup_type(&self, name: &str) -> Option<&TypeInfo> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.types.get(name))
    }

    /// Finds the declared record or sum type whose name matches.
    pub fn record_fields(&self, name: &str) -> Option<&IndexMap<String, TypeId>> {
        match &self.lookup_type(name)?.shape {
            TypeShape::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// Every visible value name with its binding, innermost shadowing outer.
    pub fn names(&self) -> Vec<(&str, Binding)> {
        let mut out: IndexMap<&str, Binding> = IndexMap::new();
        for frame in &self.frames {
            for (name, binding) in &frame.values {
                out.insert(name.as_str(), *binding);
            }
        }
        out.into_iter().collect()
    }
}
