// symbols.rs — Scopes and symbol lookup
//
// Scopes form a tree (global → namespace → struct → template instance).
// Unqualified lookup walks outwards; at each level the scope's own names win
// over names imported with `using namespace`, and two imports offering the
// same name are an ambiguity. Qualified lookup searches one scope only.
//
// Preconditions: scope ids come from the same `ScopeTable`.
// Postconditions: lookups never mutate the table.
// Failure modes: `Lookup::Ambiguous` when imported namespaces collide.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::Visibility;
use crate::const_eval::ConstValue;
use crate::id::{EnumId, FunctionId, GlobalId, ScopeId, StructId, TemplateId};
use crate::types::Type;

/// Builtin type families and functions registered in the global scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Span,
    Dyn,
    Block,
    Float4,
    ProcessData,
    PolyData,
    HiseEvent,
    PrepareSpecs,
    ExternalData,
    Slice,
    Index(IndexKind),
    Container { split: bool },
    Wrap(WrapKind),
    Param(ParamKind),
    Identity,
    Math(crate::thir::MathFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Unsafe,
    Wrapped,
    Clamped,
    Looped,
    Normalised,
    Unscaled,
    Lerp,
    Hermite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapKind {
    Fix,
    Frame,
    Event,
    Init,
    Mod,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Plain,
    Expression,
    From0To1,
    Chain,
    List,
    Empty,
}

/// A named entity in a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Namespace(ScopeId),
    Struct(StructId),
    StructTemplate(TemplateId),
    Enum(EnumId),
    EnumValue(EnumId, i32),
    /// `using` alias, resolved on first use.
    Alias(usize),
    /// A bound template type parameter.
    Type(Type),
    /// A bound template value parameter.
    Value(ConstValue),
    Function(FunctionId),
    FunctionTemplate(TemplateId),
    Field(StructId, usize),
    Global(GlobalId),
    Builtin(Builtin),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub symbol: Symbol,
    pub visibility: Visibility,
    /// Struct whose private section declares the entry.
    pub owner: Option<StructId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Namespace,
    Struct(StructId),
    /// Binds the parameters of one template instantiation.
    Template,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Qualified name prefix for declarations in this scope (`ns::X`).
    pub path: String,
    pub names: HashMap<String, Vec<Entry>>,
    pub using: Vec<ScopeId>,
}

/// Outcome of a name lookup.
#[derive(Debug, Clone)]
pub enum Lookup<'a> {
    Found(&'a [Entry], ScopeId),
    Ambiguous,
    Missing,
}

#[derive(Debug, Default)]
pub struct ScopeTable {
    scopes: Vec<Scope>,
}

impl ScopeTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table.push(ScopeKind::Global, None, String::new());
        table
    }

    pub const GLOBAL: ScopeId = ScopeId(0);

    pub fn push(&mut self, kind: ScopeKind, parent: Option<ScopeId>, path: String) -> ScopeId {
        let id = ScopeId::from_index(self.scopes.len());
        self.scopes.push(Scope {
            kind,
            parent,
            path,
            names: HashMap::new(),
            using: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    /// Qualified name of `name` declared in `scope`.
    pub fn qualify(&self, scope: ScopeId, name: &str) -> String {
        let path = &self.get(scope).path;
        if path.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", path, name)
        }
    }

    pub fn insert(&mut self, scope: ScopeId, name: &str, entry: Entry) {
        self.scopes[scope.index()]
            .names
            .entry(name.to_string())
            .or_default()
            .push(entry);
    }

    pub fn add_using(&mut self, scope: ScopeId, target: ScopeId) {
        let using = &mut self.scopes[scope.index()].using;
        if !using.contains(&target) {
            using.push(target);
        }
    }

    /// Names declared directly in `scope`.
    pub fn local(&self, scope: ScopeId, name: &str) -> Option<&[Entry]> {
        self.get(scope).names.get(name).map(Vec::as_slice)
    }

    /// Lookup inside one scope, then its `using` imports.
    pub fn qualified(&self, scope: ScopeId, name: &str) -> Lookup<'_> {
        if let Some(entries) = self.local(scope, name) {
            return Lookup::Found(entries, scope);
        }
        let mut hits = self
            .get(scope)
            .using
            .iter()
            .filter_map(|&u| self.local(u, name).map(|e| (e, u)));
        match (hits.next(), hits.next()) {
            (Some((e, u)), None) => Lookup::Found(e, u),
            (Some(_), Some(_)) => Lookup::Ambiguous,
            _ => Lookup::Missing,
        }
    }

    /// Innermost-first lookup through the enclosing scopes.
    pub fn unqualified(&self, scope: ScopeId, name: &str) -> Lookup<'_> {
        let mut current = Some(scope);
        while let Some(id) = current {
            match self.qualified(id, name) {
                Lookup::Missing => current = self.get(id).parent,
                found => return found,
            }
        }
        Lookup::Missing
    }

    /// Whether `inner` is `outer` or nested inside it.
    pub fn is_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        let mut current = Some(inner);
        while let Some(id) = current {
            if id == outer {
                return true;
            }
            current = self.get(id).parent;
        }
        false
    }

    /// The innermost struct enclosing `scope`.
    pub fn enclosing_struct(&self, scope: ScopeId) -> Option<StructId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let ScopeKind::Struct(s) = self.get(id).kind {
                return Some(s);
            }
            current = self.get(id).parent;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(symbol: Symbol) -> Entry {
        Entry {
            symbol,
            visibility: Visibility::Public,
            owner: None,
        }
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let mut t = ScopeTable::new();
        let ns = t.push(ScopeKind::Namespace, Some(ScopeTable::GLOBAL), "ns".into());
        t.insert(ScopeTable::GLOBAL, "x", entry(Symbol::Global(GlobalId(0))));
        t.insert(ns, "x", entry(Symbol::Global(GlobalId(1))));
        match t.unqualified(ns, "x") {
            Lookup::Found(e, s) => {
                assert_eq!(s, ns);
                assert_eq!(e[0].symbol, Symbol::Global(GlobalId(1)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.qualify(ns, "y"), "ns::y");
    }

    #[test]
    fn two_imports_of_one_name_are_ambiguous() {
        let mut t = ScopeTable::new();
        let a = t.push(ScopeKind::Namespace, Some(ScopeTable::GLOBAL), "a".into());
        let b = t.push(ScopeKind::Namespace, Some(ScopeTable::GLOBAL), "b".into());
        t.insert(a, "f", entry(Symbol::Function(FunctionId(0))));
        t.insert(b, "f", entry(Symbol::Function(FunctionId(1))));
        t.add_using(ScopeTable::GLOBAL, a);
        assert!(matches!(t.unqualified(ScopeTable::GLOBAL, "f"), Lookup::Found(..)));
        t.add_using(ScopeTable::GLOBAL, b);
        assert!(matches!(t.unqualified(ScopeTable::GLOBAL, "f"), Lookup::Ambiguous));
    }

    #[test]
    fn qualified_lookup_does_not_walk_outwards() {
        let mut t = ScopeTable::new();
        let ns = t.push(ScopeKind::Namespace, Some(ScopeTable::GLOBAL), "ns".into());
        t.insert(ScopeTable::GLOBAL, "x", entry(Symbol::Global(GlobalId(0))));
        assert!(matches!(t.qualified(ns, "x"), Lookup::Missing));
        assert!(t.is_within(ns, ScopeTable::GLOBAL));
    }
}
