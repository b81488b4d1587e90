use la_arena::{Arena, Idx};

pub type TypeId = Idx<TypeKind>;

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Int,
    Float,
    String,
    Bool,
    Unit,
    /// A unification variable; `bound` is set once it is solved.
    Var {
        name: String,
        id: u32,
        bound: Option<TypeId>,
    },
    /// Named constructor: `List(T)`, `Option(T)`, `Result(T, E)`, `Map(K, V)`,
    /// `Range(T)` and user-defined types.
    Con {
        name: String,
        args: Vec<TypeId>,
    },
    Fn {
        params: Vec<TypeId>,
        result: TypeId,
    },
    Tuple(Vec<TypeId>),
    /// Poisoned result of a failed check. Unifies with anything so a single
    /// mistake is reported once.
    Error(String),
}

/// Owns every type the checker creates. Ids stay valid as long as the arena.
#[derive(Debug, Default)]
pub struct TypeArena {
    types: Arena<TypeKind>,
    next_var: u32,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: TypeKind) -> TypeId {
        self.types.alloc(kind)
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.types[id]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn int(&mut self) -> TypeId {
        self.alloc(TypeKind::Int)
    }

    pub fn float(&mut self) -> TypeId {
        self.alloc(TypeKind::Float)
    }

    pub fn string(&mut self) -> TypeId {
        self.alloc(TypeKind::String)
    }

    pub fn bool(&mut self) -> TypeId {
        self.alloc(TypeKind::Bool)
    }

    pub fn unit(&mut self) -> TypeId {
        self.alloc(TypeKind::Unit)
    }

    pub fn error(&mut self, message: impl Into<String>) -> TypeId {
        self.alloc(TypeKind::Error(message.into()))
    }

    /// A new unbound variable. Ids come from a counter that only grows.
    pub fn var(&mut self, name: impl Into<String>) -> TypeId {
        let id = self.next_var;
        self.next_var += 1;
        self.alloc(TypeKind::Var {
            name: name.into(),
            id,
            bound: None,
        })
    }

    pub fn fresh_var(&mut self) -> TypeId {
        let name = format!("t{}", self.next_var);
        self.var(name)
    }

    pub fn con(&mut self, name: impl Into<String>, args: Vec<TypeId>) -> TypeId {
        self.alloc(TypeKind::Con {
            name: name.into(),
            args,
        })
    }

    pub fn list(&mut self, elem: TypeId) -> TypeId {
        self.con("List", vec![elem])
    }

    pub fn option(&mut self, inner: TypeId) -> TypeId {
        self.con("Option", vec![inner])
    }

    pub fn result(&mut self, ok: TypeId, err: TypeId) -> TypeId {
        self.con("Result", vec![ok, err])
    }

    pub fn map(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.con("Map", vec![key, value])
    }

    pub fn range(&mut self, elem: TypeId) -> TypeId {
        self.con("Range", vec![elem])
    }

    pub fn func(&mut self, params: Vec<TypeId>, result: TypeId) -> TypeId {
        self.alloc(TypeKind::Fn { params, result })
    }

    pub fn tuple(&mut self, items: Vec<TypeId>) -> TypeId {
        self.alloc(TypeKind::Tuple(items))
    }

    /// Follows variable bindings to the representative type.
    pub fn resolve(&self, mut id: TypeId) -> TypeId {
        while let TypeKind::Var {
            bound: Some(next), ..
        } = &self.types[id]
        {
            id = *next;
        }
        id
    }

    pub fn is_error(&self, id: TypeId) -> bool {
        matches!(self.types[self.resolve(id)], TypeKind::Error(_))
    }

    pub fn is_numeric(&self, id: TypeId) -> bool {
        matches!(self.types[self.resolve(id)], TypeKind::Int | TypeKind::Float)
    }

    pub fn is_unbound_var(&self, id: TypeId) -> bool {
        matches!(self.types[self.resolve(id)], TypeKind::Var { .. })
    }

    /// Comparable types are everything except functions and errors.
    pub fn is_comparable(&self, id: TypeId) -> bool {
        !matches!(
            self.types[self.resolve(id)],
            TypeKind::Fn { .. } | TypeKind::Error(_)
        )
    }

    /// The arguments of constructor `name`, if `id` resolves to one.
    pub fn con_args(&self, id: TypeId, name: &str) -> Option<Vec<TypeId>> {
        match &self.types[self.resolve(id)] {
            TypeKind::Con { name: con, args } if con == name => Some(args.clone()),
            _ => None,
        }
    }

    /// Makes `a` and `b` the same type, binding variables as needed.
    /// Bindings made before a failure are kept.
    pub fn unify(&mut self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (self.types[a].clone(), self.types[b].clone()) {
            (TypeKind::Error(_), _) | (_, TypeKind::Error(_)) => true,
            (TypeKind::Var { id: x, .. }, TypeKind::Var { id: y, .. }) if x == y => true,
            (TypeKind::Var { .. }, _) => self.bind(a, b),
            (_, TypeKind::Var { .. }) => self.bind(b, a),
            (TypeKind::Int, TypeKind::Int)
            | (TypeKind::Float, TypeKind::Float)
            | (TypeKind::String, TypeKind::String)
            | (TypeKind::Bool, TypeKind::Bool)
            | (TypeKind::Unit, TypeKind::Unit) => true,
            (TypeKind::Unit, TypeKind::Tuple(items)) | (TypeKind::Tuple(items), TypeKind::Unit) => {
                items.is_empty()
            }
            (
                TypeKind::Con {
                    name: left_name,
                    args: left_args,
                },
                TypeKind::Con {
                    name: right_name,
                    args: right_args,
                },
            ) => left_name == right_name && self.unify_all(&left_args, &right_args),
            (
                TypeKind::Fn {
                    params: left_params,
                    result: left_result,
                },
                TypeKind::Fn {
                    params: right_params,
                    result: right_result,
                },
            ) => {
                self.unify_all(&left_params, &right_params) && self.unify(left_result, right_result)
            }
            (TypeKind::Tuple(left), TypeKind::Tuple(right)) => self.unify_all(&left, &right),
            _ => false,
        }
    }

    fn unify_all(&mut self, left: &[TypeId], right: &[TypeId]) -> bool {
        left.len() == right.len()
            && left
                .iter()
                .zip(right)
                .all(|(left, right)| self.unify(*left, *right))
    }

    fn bind(&mut self, var: TypeId, target: TypeId) -> bool {
        if self.occurs(var, target) {
            tracing::trace!(
                var = %self.display(var),
                target = %self.display(target),
                "occurs check failed"
            );
            return false;
        }
        if let TypeKind::Var { bound, .. } = &mut self.types[var] {
            *bound = Some(target);
        }
        true
    }

    fn occurs(&self, var: TypeId, ty: TypeId) -> bool {
        let ty = self.resolve(ty);
        if ty == var {
            return true;
        }
        match &self.types[ty] {
            TypeKind::Con { args: items, .. } | TypeKind::Tuple(items) => {
                items.iter().any(|item| self.occurs(var, *item))
            }
            TypeKind::Fn { params, result } => {
                params.iter().any(|param| self.occurs(var, *param)) || self.occurs(var, *result)
            }
            _ => false,
        }
    }

    /// Structural equality. Unbound variables are equal when their ids are;
    /// bound variables compare by what they are bound to.
    pub fn equals(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (&self.types[a], &self.types[b]) {
            (TypeKind::Var { id: x, .. }, TypeKind::Var { id: y, .. }) => x == y,
            (TypeKind::Int, TypeKind::Int)
            | (TypeKind::Float, TypeKind::Float)
            | (TypeKind::String, TypeKind::String)
            | (TypeKind::Bool, TypeKind::Bool)
            | (TypeKind::Unit, TypeKind::Unit)
            | (TypeKind::Error(_), TypeKind::Error(_)) => true,
            (
                TypeKind::Con {
                    name: left_name,
                    args: left_args,
                },
                TypeKind::Con {
                    name: right_name,
                    args: right_args,
                },
            ) => left_name == right_name && self.equals_all(left_args, right_args),
            (
                TypeKind::Fn {
                    params: left_params,
                    result: left_result,
                },
                TypeKind::Fn {
                    params: right_params,
                    result: right_result,
                },
            ) => {
                self.equals_all(left_params, right_params)
                    && self.equals(*left_result, *right_result)
            }
            (TypeKind::Tuple(left), TypeKind::Tuple(right)) => self.equals_all(left, right),
            _ => false,
        }
    }

    fn equals_all(&self, left: &[TypeId], right: &[TypeId]) -> bool {
        left.len() == right.len()
            && left
                .iter()
                .zip(right)
                .all(|(left, right)| self.equals(*left, *right))
    }

    /// Copies a type into fresh slots. Variables keep their id, so the copy
    /// is equal to the original.
    pub fn deep_clone(&mut self, id: TypeId) -> TypeId {
        let kind = self.types[id].clone();
        let cloned = match kind {
            TypeKind::Var { name, id, bound } => TypeKind::Var {
                name,
                id,
                bound: bound.map(|bound| self.deep_clone(bound)),
            },
            TypeKind::Con { name, args } => TypeKind::Con {
                name,
                args: args.into_iter().map(|arg| self.deep_clone(arg)).collect(),
            },
            TypeKind::Fn { params, result } => TypeKind::Fn {
                params: params.into_iter().map(|param| self.deep_clone(param)).collect(),
                result: self.deep_clone(result),
            },
            TypeKind::Tuple(items) => {
                TypeKind::Tuple(items.into_iter().map(|item| self.deep_clone(item)).collect())
            }
            leaf => leaf,
        };
        self.alloc(cloned)
    }

    /// Unbound variables reachable from `id`, each listed once.
    pub fn free_vars(&self, id: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        self.collect_free_vars(id, &mut out);
        out
    }

    fn collect_free_vars(&self, id: TypeId, out: &mut Vec<TypeId>) {
        let id = self.resolve(id);
        match &self.types[id] {
            TypeKind::Var { .. } => {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            TypeKind::Con { args: items, .. } | TypeKind::Tuple(items) => {
                for item in items {
                    self.collect_free_vars(*item, out);
                }
            }
            TypeKind::Fn { params, result } => {
                for param in params {
                    self.collect_free_vars(*param, out);
                }
                self.collect_free_vars(*result, out);
            }
            _ => {}
        }
    }

    /// Replaces variables per `mapping`, rebuilding only what changes.
    pub fn substitute(&mut self, id: TypeId, mapping: &[(TypeId, TypeId)]) -> TypeId {
        let id = self.resolve(id);
        if let Some((_, replacement)) = mapping.iter().find(|(var, _)| *var == id) {
            return *replacement;
        }
        match self.types[id].clone() {
            TypeKind::Con { name, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.substitute(arg, mapping))
                    .collect();
                self.con(name, args)
            }
            TypeKind::Fn { params, result } => {
                let params = params
                    .into_iter()
                    .map(|param| self.substitute(param, mapping))
                    .collect();
                let result = self.substitute(result, mapping);
                self.func(params, result)
            }
            TypeKind::Tuple(items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.substitute(item, mapping))
                    .collect();
                self.tuple(items)
            }
            _ => id,
        }
    }

    /// Gives every free variable of a generic type a fresh variable with
    /// the same name, so separate uses do not constrain each other.
    pub fn instantiate(&mut self, id: TypeId) -> TypeId {
        let free = self.free_vars(id);
        if free.is_empty() {
            return id;
        }
        let mapping: Vec<(TypeId, TypeId)> = free
            .into_iter()
            .map(|var| {
                let name = match &self.types[var] {
                    TypeKind::Var { name, .. } => name.clone(),
                    _ => String::from("t"),
                };
                (var, self.var(name))
            })
            .collect();
        self.substitute(id, &mapping)
    }

    /// Renders the type in Fern syntax: `Result(Int, String)`, `(Int) -> Bool`.
    pub fn display(&self, id: TypeId) -> String {
        match &self.types[id] {
            TypeKind::Int => "Int".to_string(),
            TypeKind::Float => "Float".to_string(),
            TypeKind::String => "String".to_string(),
            TypeKind::Bool => "Bool".to_string(),
            TypeKind::Unit => "()".to_string(),
            TypeKind::Error(message) => format!("<error: {message}>"),
            TypeKind::Var {
                bound: Some(bound), ..
            } => self.display(*bound),
            TypeKind::Var { name, .. } => name.clone(),
            TypeKind::Con { name, args } if args.is_empty() => name.clone(),
            TypeKind::Con { name, args } => format!("{name}({})", self.display_list(args)),
            TypeKind::Fn { params, result } => {
                format!("({}) -> {}", self.display_list(params), self.display(*result))
            }
            TypeKind::Tuple(items) => format!("({})", self.display_list(items)),
        }
    }

    fn display_list(&self, items: &[TypeId]) -> String {
        items
            .iter()
            .map(|item| self.display(*item))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn displays_canonical_syntax() {
        let mut arena = TypeArena::new();
        let int = arena.int();
        let string = arena.string();
        let result = arena.result(int, string);
        assert_eq!(arena.display(result), "Result(Int, String)");
        let int2 = arena.int();
        let add = arena.func(vec![int, int2], int);
        assert_eq!(arena.display(add), "(Int, Int) -> Int");
        let pair = arena.tuple(vec![int, string]);
        assert_eq!(arena.display(pair), "(Int, String)");
        let unit = arena.unit();
        assert_eq!(arena.display(unit), "()");
    }

    #[test]
    fn unifies_variable_with_concrete_type() {
        let mut arena = TypeArena::new();
        let var = arena.var("a");
        let int = arena.int();
        let list_var = arena.list(var);
        let list_int = arena.list(int);
        assert!(arena.unify(list_var, list_int));
        assert_eq!(arena.display(var), "Int");
        assert!(arena.equals(list_var, list_int));
    }

    #[test]
    fn rejects_mismatched_constructors() {
        let mut arena = TypeArena::new();
        let int = arena.int();
        let list = arena.list(int);
        let option = arena.option(int);
        assert!(!arena.unify(list, option));
    }

    #[test]
    fn occurs_check_prevents_infinite_type() {
        let mut arena = TypeArena::new();
        let var = arena.var("a");
        let list = arena.list(var);
        assert!(!arena.unify(var, list));
        assert!(arena.is_unbound_var(var));
    }

    #[test]
    fn error_unifies_with_anything() {
        let mut arena = TypeArena::new();
        let error = arena.error("boom");
        let string = arena.string();
        assert!(arena.unify(error, string));
        assert!(arena.is_error(error));
    }

    #[test]
    fn instantiate_gives_fresh_variables_with_same_name() {
        let mut arena = TypeArena::new();
        let a = arena.var("a");
        let identity = arena.func(vec![a], a);
        let first = arena.instantiate(identity);
        let second = arena.instantiate(identity);
        assert!(!arena.equals(first, identity));
        assert!(!arena.equals(first, second));
        assert_eq!(arena.display(first), "(a) -> a");

        let int = arena.int();
        let TypeKind::Fn { params, result } = arena.kind(first).clone() else {
            panic!("expected fn");
        };
        assert!(arena.unify(params[0], int));
        assert_eq!(arena.display(result), "Int");
        assert!(arena.is_unbound_var(a));
    }

    #[test]
    fn var_ids_are_monotonic() {
        let mut arena = TypeArena::new();
        let first = arena.fresh_var();
        let second = arena.fresh_var();
        let (TypeKind::Var { id: x, .. }, TypeKind::Var { id: y, .. }) =
            (arena.kind(first), arena.kind(second))
        else {
            panic!("expected vars");
        };
        assert!(y > x);
    }

    #[derive(Debug, Clone)]
    enum Shape {
        Int,
        Float,
        String,
        Bool,
        Unit,
        Var(u8),
        List(Box<Shape>),
        Result(Box<Shape>, Box<Shape>),
        Fn(Vec<Shape>, Box<Shape>),
        Tuple(Vec<Shape>),
    }

    fn shape() -> impl Strategy<Value = Shape> {
        let leaf = prop_oneof![
            Just(Shape::Int),
            Just(Shape::Float),
            Just(Shape::String),
            Just(Shape::Bool),
            Just(Shape::Unit),
            (0u8..3).prop_map(Shape::Var),
        ];
        leaf.prop_recursive(3, 16, 3, |inner| {
            prop_oneof![
                inner.clone().prop_map(|s| Shape::List(Box::new(s))),
                (inner.clone(), inner.clone())
                    .prop_map(|(ok, err)| Shape::Result(Box::new(ok), Box::new(err))),
                (prop::collection::vec(inner.clone(), 0..3), inner.clone())
                    .prop_map(|(params, ret)| Shape::Fn(params, Box::new(ret))),
                prop::collection::vec(inner, 0..3).prop_map(Shape::Tuple),
            ]
        })
    }

    fn build(arena: &mut TypeArena, vars: &[TypeId], shape: &Shape) -> TypeId {
        match shape {
            Shape::Int => arena.int(),
            Shape::Float => arena.float(),
            Shape::String => arena.string(),
            Shape::Bool => arena.bool(),
            Shape::Unit => arena.unit(),
            Shape::Var(idx) => vars[*idx as usize],
            Shape::List(elem) => {
                let elem = build(arena, vars, elem);
                arena.list(elem)
            }
            Shape::Result(ok, err) => {
                let ok = build(arena, vars, ok);
                let err = build(arena, vars, err);
                arena.result(ok, err)
            }
            Shape::Fn(params, ret) => {
                let params = params.iter().map(|p| build(arena, vars, p)).collect();
                let ret = build(arena, vars, ret);
                arena.func(params, ret)
            }
            Shape::Tuple(items) => {
                let items = items.iter().map(|i| build(arena, vars, i)).collect();
                arena.tuple(items)
            }
        }
    }

    proptest! {
        #[test]
        fn equality_is_reflexive_and_survives_clone(shape in shape()) {
            let mut arena = TypeArena::new();
            let vars = vec![arena.var("a"), arena.var("b"), arena.var("c")];
            let ty = build(&mut arena, &vars, &shape);
            prop_assert!(arena.equals(ty, ty));
            let cloned = arena.deep_clone(ty);
            prop_assert!(arena.equals(ty, cloned));
            prop_assert!(arena.equals(cloned, ty));
            prop_assert_eq!(arena.display(ty), arena.display(cloned));
        }

        #[test]
        fn equality_is_symmetric(left in shape(), right in shape()) {
            let mut arena = TypeArena::new();
            let vars = vec![arena.var("a"), arena.var("b"), arena.var("c")];
            let left = build(&mut arena, &vars, &left);
            let right = build(&mut arena, &vars, &right);
            prop_assert_eq!(arena.equals(left, right), arena.equals(right, left));
        }
    }
}
