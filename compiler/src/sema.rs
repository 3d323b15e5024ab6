// sema.rs — Semantic analysis driver and declaration model
//
// Turns the parsed AST into a `TypedProgram`. Declarations are collected
// first (names only), then completed on demand: struct fields, function
// signatures, static members and aliases resolve the first time anything
// needs them, so declaration order inside a struct does not matter and a
// dependency cycle is detected by an in-progress marker. Function bodies run
// from a worklist; template instance methods join it only when referenced.
//
// Preconditions: `program` is a complete parse without errors.
// Postconditions: on success every reachable function has a typed body and
//   every expression a resolved type; on failure the diagnostics are sorted
//   by source position and the first one is authoritative.
// Failure modes: the first error inside a declaration stops that
//   declaration; analysis resumes at the next one. Failed declarations are
//   poisoned so that dependent uses do not report again.
// Side effects: none (each call owns its tables).

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{
    EnumDecl, FnName, FunctionDecl, Ident, Item, ItemKind, OverloadOp, Path, PathSegment,
    Program, Span, StructDecl, TemplateParam, TypeExpr, TypeKind, UsingDecl, VarDecl, Visibility,
};
use crate::const_eval::ConstValue;
use crate::diag::{codes, DiagCode, Diagnostic};
use crate::id::{EnumId, FunctionId, GlobalId, ScopeId, StructId, TemplateId};
use crate::stmt::FnCx;
use crate::symbols::{
    Builtin, Entry, IndexKind, Lookup, ParamKind, ScopeKind, ScopeTable, Symbol, WrapKind,
};
use crate::thir::{
    EnumInfo, FieldInfo, FnKind, FunctionInfo, GlobalInfo, LocalInfo, MathFn, ParamInfo,
    StructInfo, TInit, TypedProgram,
};
use crate::types::{TemplateValue, Type, TypeContext, TypeInfo};

// ── Errors ───────────────────────────────────────────────────────────────

/// Why analysis of the current declaration stopped.
#[derive(Debug, Clone)]
pub enum Halt {
    /// A new error to report.
    Report(Box<Diagnostic>),
    /// A dependency already failed and was reported.
    Poisoned,
}

impl From<Diagnostic> for Halt {
    fn from(d: Diagnostic) -> Self {
        Halt::Report(Box::new(d))
    }
}

pub type SemaResult<T> = Result<T, Halt>;

pub(crate) fn fail<T>(code: DiagCode, span: Span, message: impl Into<String>) -> SemaResult<T> {
    Err(Diagnostic::error(code, span, message).into())
}

// ── Declaration state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending,
    Active,
    Done,
    Failed,
}

pub(crate) struct AliasState {
    pub decl: UsingDecl,
    pub scope: ScopeId,
    pub phase: Phase,
    pub ty: Option<Type>,
}

pub(crate) struct StructState {
    pub decl: Rc<StructDecl>,
    pub scope: ScopeId,
    pub phase: Phase,
}

pub(crate) struct FnState {
    pub decl: Rc<FunctionDecl>,
    /// Scope used for name lookup inside the body.
    pub scope: ScopeId,
    pub sig: Phase,
    pub body: Phase,
    pub queued: bool,
    /// `Some(is_ref)` for an `auto` / `auto&` return type.
    pub auto_ret: Option<bool>,
}

pub(crate) struct GlobalState {
    pub decl: VarDecl,
    pub scope: ScopeId,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub(crate) enum TemplateDecl {
    Struct(Rc<StructDecl>),
    Function(Rc<FunctionDecl>),
}

pub(crate) struct TemplateInfo {
    pub decl: TemplateDecl,
    pub params: Vec<TemplateParam>,
    /// Declaring scope; instances nest a parameter scope inside it.
    pub scope: ScopeId,
    pub owner: Option<StructId>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instance {
    Struct(StructId),
    Function(FunctionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Active,
    Done(Instance),
    Failed,
}

/// What a path names.
#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    Namespace(ScopeId),
    Type(Type),
    /// A struct template named without arguments.
    StructTemplate(TemplateId),
    Value(ConstValue),
    EnumValue(EnumId, i32),
    Functions {
        ids: Vec<FunctionId>,
        templates: Vec<TemplateId>,
        explicit: Option<Vec<TemplateValue>>,
    },
    Field(StructId, usize),
    Global(GlobalId),
    Builtin(Builtin),
}

/// Options that depend on how the compiled unit will be driven.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// A node type that will be processed directly, with its channel count.
    pub node_entry: Option<(String, usize)>,
}

/// Counters reported by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    pub structs: usize,
    pub functions: usize,
    pub instantiations: usize,
}

/// Maximum nesting of template instantiations.
pub(crate) const MAX_INSTANTIATION_DEPTH: usize = 64;

// ── Analyzer ─────────────────────────────────────────────────────────────

pub struct Analyzer {
    pub(crate) prog: TypedProgram,
    pub(crate) scopes: ScopeTable,
    pub(crate) aliases: Vec<AliasState>,
    pub(crate) struct_states: Vec<StructState>,
    pub(crate) fn_states: Vec<FnState>,
    pub(crate) global_states: Vec<GlobalState>,
    pub(crate) templates: Vec<TemplateInfo>,
    pub(crate) instances: HashMap<(TemplateId, Vec<TemplateValue>), InstanceState>,
    pub(crate) enum_scopes: HashMap<EnumId, ScopeId>,
    pub(crate) queue: VecDeque<FunctionId>,
    pub(crate) diags: Vec<Diagnostic>,
    pub(crate) depth: usize,
    pub(crate) instantiations: usize,
}

/// Analyze a parsed program.
pub fn analyze(
    program: &Program,
    options: &AnalyzeOptions,
) -> Result<(TypedProgram, AnalysisStats), Vec<Diagnostic>> {
    let mut a = Analyzer::new();
    a.collect_items(&program.items, ScopeTable::GLOBAL);

    if let Some((name, channels)) = &options.node_entry {
        let r = a.bind_entry_node(name, *channels, program.span);
        a.report(r);
    }
    a.settle();

    let stats = AnalysisStats {
        structs: a.prog.structs.len(),
        functions: a.prog.functions.len(),
        instantiations: a.instantiations,
    };
    debug!(
        structs = stats.structs,
        functions = stats.functions,
        instantiations = stats.instantiations,
        "analysis finished"
    );

    if a.diags.is_empty() {
        Ok((a.prog, stats))
    } else {
        let mut diags = a.diags;
        diags.sort_by_key(|d| d.span.start);
        Err(diags)
    }
}

impl Analyzer {
    pub(crate) fn new() -> Self {
        let mut a = Self {
            prog: TypedProgram::default(),
            scopes: ScopeTable::new(),
            aliases: Vec::new(),
            struct_states: Vec::new(),
            fn_states: Vec::new(),
            global_states: Vec::new(),
            templates: Vec::new(),
            instances: HashMap::new(),
            enum_scopes: HashMap::new(),
            queue: VecDeque::new(),
            diags: Vec::new(),
            depth: 0,
            instantiations: 0,
        };
        a.register_builtins();
        a
    }

    pub(crate) fn report<T>(&mut self, result: SemaResult<T>) {
        if let Err(Halt::Report(d)) = result {
            self.diags.push(*d);
        }
    }

    /// Complete every declaration and analyze queued bodies until nothing
    /// new is instantiated.
    pub(crate) fn settle(&mut self) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.struct_states.len() {
                if self.struct_states[i].phase == Phase::Pending {
                    let r = self.complete_struct(StructId::from_index(i));
                    self.report(r);
                    progressed = true;
                }
                i += 1;
            }
            let mut i = 0;
            while i < self.global_states.len() {
                if self.global_states[i].phase == Phase::Pending {
                    let r = self.global(GlobalId::from_index(i));
                    self.report(r);
                    progressed = true;
                }
                i += 1;
            }
            while let Some(fid) = self.queue.pop_front() {
                let r = self.analyze_body(fid);
                self.report(r);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn register_builtins(&mut self) {
        let g = ScopeTable::GLOBAL;
        let top = [
            ("span", Builtin::Span),
            ("dyn", Builtin::Dyn),
            ("block", Builtin::Block),
            ("float4", Builtin::Float4),
            ("ProcessData", Builtin::ProcessData),
            ("PolyData", Builtin::PolyData),
            ("HiseEvent", Builtin::HiseEvent),
            ("PrepareSpecs", Builtin::PrepareSpecs),
            ("ExternalData", Builtin::ExternalData),
            ("slice", Builtin::Slice),
        ];
        for (name, b) in top {
            self.scopes.insert(g, name, public(Symbol::Builtin(b)));
        }

        let index = [
            ("unsafe", IndexKind::Unsafe),
            ("wrapped", IndexKind::Wrapped),
            ("clamped", IndexKind::Clamped),
            ("looped", IndexKind::Looped),
            ("normalised", IndexKind::Normalised),
            ("unscaled", IndexKind::Unscaled),
            ("lerp", IndexKind::Lerp),
            ("hermite", IndexKind::Hermite),
        ];
        let ns = self.builtin_namespace("index");
        for (name, k) in index {
            self.scopes.insert(ns, name, public(Symbol::Builtin(Builtin::Index(k))));
        }

        let ns = self.builtin_namespace("container");
        for (name, split) in [("chain", false), ("split", true)] {
            self.scopes
                .insert(ns, name, public(Symbol::Builtin(Builtin::Container { split })));
        }

        let wrap = [
            ("fix", WrapKind::Fix),
            ("frame", WrapKind::Frame),
            ("event", WrapKind::Event),
            ("init", WrapKind::Init),
            ("mod", WrapKind::Mod),
            ("data", WrapKind::Data),
        ];
        let ns = self.builtin_namespace("wrap");
        for (name, k) in wrap {
            self.scopes.insert(ns, name, public(Symbol::Builtin(Builtin::Wrap(k))));
        }

        let params = [
            ("plain", ParamKind::Plain),
            ("expression", ParamKind::Expression),
            ("from0To1", ParamKind::From0To1),
            ("chain", ParamKind::Chain),
            ("list", ParamKind::List),
            ("empty", ParamKind::Empty),
        ];
        let ns = self.builtin_namespace("parameter");
        for (name, k) in params {
            self.scopes.insert(ns, name, public(Symbol::Builtin(Builtin::Param(k))));
        }

        let ns = self.builtin_namespace("ranges");
        self.scopes
            .insert(ns, "Identity", public(Symbol::Builtin(Builtin::Identity)));

        let ns = self.builtin_namespace("Math");
        for name in [
            "sin", "cos", "tan", "abs", "sqrt", "exp", "pow", "min", "max", "floor", "ceil",
            "fmod", "sign", "range", "map",
        ] {
            if let Some(f) = MathFn::from_name(name) {
                self.scopes.insert(ns, name, public(Symbol::Builtin(Builtin::Math(f))));
            }
        }
    }

    fn builtin_namespace(&mut self, name: &str) -> ScopeId {
        let g = ScopeTable::GLOBAL;
        let ns = self.scopes.push(ScopeKind::Namespace, Some(g), name.to_string());
        self.scopes.insert(g, name, public(Symbol::Namespace(ns)));
        ns
    }

    // ── Collection ───────────────────────────────────────────────────────

    pub(crate) fn collect_items(&mut self, items: &[Item], scope: ScopeId) {
        for item in items {
            let r = self.collect_item(item, scope);
            self.report(r);
        }
    }

    fn collect_item(&mut self, item: &Item, scope: ScopeId) -> SemaResult<()> {
        match &item.kind {
            ItemKind::Namespace(ns) => {
                let existing = match self.scopes.local(scope, &ns.name.name) {
                    Some([Entry {
                        symbol: Symbol::Namespace(s),
                        ..
                    }]) => Some(*s),
                    Some(_) => {
                        return fail(
                            codes::E0203,
                            ns.name.span,
                            format!("Duplicate symbol {}", ns.name.name),
                        )
                    }
                    None => None,
                };
                let inner = match existing {
                    Some(s) => s,
                    None => {
                        let path = self.scopes.qualify(scope, &ns.name.name);
                        let s = self.scopes.push(ScopeKind::Namespace, Some(scope), path);
                        self.scopes
                            .insert(scope, &ns.name.name, public(Symbol::Namespace(s)));
                        s
                    }
                };
                self.collect_items(&ns.items, inner);
                Ok(())
            }
            ItemKind::UsingNamespace(path) => match self.resolve_path(path, scope, scope)? {
                Resolved::Namespace(target) => {
                    self.scopes.add_using(scope, target);
                    Ok(())
                }
                _ => fail(
                    codes::E0201,
                    path.span,
                    format!("{} is not a namespace", path.display_name()),
                ),
            },
            ItemKind::Using(u) => self.declare_alias(u, scope, Visibility::Public, None),
            ItemKind::Enum(e) => self
                .declare_enum(e, scope, Visibility::Public, None)
                .map(|_| ()),
            ItemKind::Struct(s) => {
                if s.template.is_some() {
                    self.declare_template(TemplateDecl::Struct(s.clone()), &s.name, scope, None, Visibility::Public)
                } else {
                    self.declare_struct(s.clone(), scope, &s.name, None, Visibility::Public, true)
                        .map(|_| ())
                }
            }
            ItemKind::Function(f) => {
                if f.template.is_some() {
                    let name = fn_ident(&f.name);
                    self.declare_template(TemplateDecl::Function(f.clone()), &name, scope, None, Visibility::Public)
                } else {
                    self.declare_function(f.clone(), scope, None, Visibility::Public, true)
                        .map(|_| ())
                }
            }
            ItemKind::Global(v) => self.declare_global(v, scope, None, Visibility::Public).map(|_| ()),
        }
    }

    /// Register `name` in `scope`; only functions may share a name.
    fn declare_name(&mut self, scope: ScopeId, name: &Ident, entry: Entry) -> SemaResult<()> {
        let overloadable = |s: &Symbol| matches!(s, Symbol::Function(_) | Symbol::FunctionTemplate(_));
        if let Some(existing) = self.scopes.local(scope, &name.name) {
            if !overloadable(&entry.symbol) || existing.iter().any(|e| !overloadable(&e.symbol)) {
                return fail(
                    codes::E0203,
                    name.span,
                    format!("Duplicate symbol {}", self.scopes.qualify(scope, &name.name)),
                );
            }
        }
        self.scopes.insert(scope, &name.name, entry);
        Ok(())
    }

    fn declare_alias(
        &mut self,
        decl: &UsingDecl,
        scope: ScopeId,
        visibility: Visibility,
        owner: Option<StructId>,
    ) -> SemaResult<()> {
        let id = self.aliases.len();
        self.aliases.push(AliasState {
            decl: decl.clone(),
            scope,
            phase: Phase::Pending,
            ty: None,
        });
        self.declare_name(
            scope,
            &decl.name,
            Entry {
                symbol: Symbol::Alias(id),
                visibility,
                owner,
            },
        )
    }

    pub(crate) fn declare_enum(
        &mut self,
        decl: &EnumDecl,
        scope: ScopeId,
        visibility: Visibility,
        owner: Option<StructId>,
    ) -> SemaResult<EnumId> {
        let id = EnumId::from_index(self.prog.enums.len());
        let name = self.scopes.qualify(scope, &decl.name.name);
        self.prog.enums.push(EnumInfo {
            name: name.clone(),
            is_class: decl.is_class,
            values: Vec::new(),
        });
        self.declare_name(
            scope,
            &decl.name,
            Entry {
                symbol: Symbol::Enum(id),
                visibility,
                owner,
            },
        )?;
        self.prog.types_by_name.insert(name.clone(), Type::Enum(id));

        // Values are reachable as `E::A`; plain enum values also leak out.
        let value_scope = self.scopes.push(ScopeKind::Namespace, Some(scope), name);
        self.enum_scopes.insert(id, value_scope);

        let mut next = 0i32;
        for (ident, value) in &decl.variants {
            if let Some(e) = value {
                let v = self.eval_const(e, value_scope)?;
                next = match v {
                    ConstValue::Int(i) => i,
                    _ => {
                        return fail(
                            codes::E0301,
                            e.span,
                            format!("enum value must be an integer, got {}", v.ty().display(&self.prog)),
                        )
                    }
                };
            }
            self.prog.enums[id.index()]
                .values
                .push((ident.name.clone(), next));
            let entry = Entry {
                symbol: Symbol::EnumValue(id, next),
                visibility,
                owner,
            };
            self.declare_name(value_scope, ident, entry.clone())?;
            if !decl.is_class {
                self.declare_name(scope, ident, entry)?;
            }
            next = next.wrapping_add(1);
        }
        Ok(id)
    }

    /// Allocate a struct and register its members' names. Fields, method
    /// signatures and statics resolve later.
    pub(crate) fn declare_struct(
        &mut self,
        decl: Rc<StructDecl>,
        scope: ScopeId,
        name: &Ident,
        display: Option<String>,
        visibility: Visibility,
        eager: bool,
    ) -> SemaResult<StructId> {
        let sid = StructId::from_index(self.prog.structs.len());
        let qualified = display.unwrap_or_else(|| self.scopes.qualify(scope, &name.name));
        self.prog.structs.push(StructInfo {
            name: qualified.clone(),
            is_class: decl.is_class,
            fields: Vec::new(),
            ctors: Vec::new(),
            dtor: None,
            methods: Vec::new(),
            statics: Vec::new(),
            span: decl.span,
        });
        let s_scope = self
            .scopes
            .push(ScopeKind::Struct(sid), Some(scope), qualified.clone());
        self.struct_states.push(StructState {
            decl: decl.clone(),
            scope: s_scope,
            phase: Phase::Pending,
        });
        self.prog
            .types_by_name
            .insert(qualified, Type::Struct(sid));

        // Template instances are registered by the instantiation key.
        if decl.template.is_none() {
            self.declare_name(
                scope,
                name,
                Entry {
                    symbol: Symbol::Struct(sid),
                    visibility,
                    owner: self.scopes.enclosing_struct(scope),
                },
            )?;
        }

        let mut field_index = 0;
        for member in &decl.members {
            let vis = member.visibility;
            let owner = Some(sid);
            match &member.kind {
                crate::ast::MemberKind::Field(v) if v.is_static => {
                    let gid = self.declare_global(v, s_scope, owner, vis)?;
                    self.prog.structs[sid.index()].statics.push(gid);
                }
                crate::ast::MemberKind::Field(v) => {
                    self.declare_name(
                        s_scope,
                        &v.name,
                        Entry {
                            symbol: Symbol::Field(sid, field_index),
                            visibility: vis,
                            owner,
                        },
                    )?;
                    field_index += 1;
                }
                crate::ast::MemberKind::Method(f) => match &f.name {
                    FnName::Ctor(ident) | FnName::Dtor(ident) if ident.name != decl.name.name => {
                        return fail(
                            codes::E0201,
                            ident.span,
                            format!("Can't resolve symbol {}", ident.name),
                        );
                    }
                    FnName::Ctor(_) => {
                        let fid = self.declare_function(f.clone(), s_scope, owner, vis, eager)?;
                        self.prog.structs[sid.index()].ctors.push(fid);
                    }
                    FnName::Dtor(_) => {
                        let fid = self.declare_function(f.clone(), s_scope, owner, vis, eager)?;
                        self.prog.structs[sid.index()].dtor = Some(fid);
                    }
                    _ if f.template.is_some() => {
                        let name = fn_ident(&f.name);
                        self.declare_template(TemplateDecl::Function(f.clone()), &name, s_scope, owner, vis)?;
                    }
                    _ => {
                        let fid = self.declare_function(f.clone(), s_scope, owner, vis, eager)?;
                        self.prog.structs[sid.index()].methods.push(fid);
                    }
                },
                crate::ast::MemberKind::Struct(inner) => {
                    if inner.template.is_some() {
                        self.declare_template(TemplateDecl::Struct(inner.clone()), &inner.name, s_scope, owner, vis)?;
                    } else {
                        self.declare_struct(inner.clone(), s_scope, &inner.name, None, vis, eager)?;
                    }
                }
                crate::ast::MemberKind::Enum(e) => {
                    self.declare_enum(e, s_scope, vis, owner)?;
                }
                crate::ast::MemberKind::Using(u) => self.declare_alias(u, s_scope, vis, owner)?,
            }
        }
        trace!(name = %self.prog.structs[sid.index()].name, "declared struct");
        Ok(sid)
    }

    pub(crate) fn declare_function(
        &mut self,
        decl: Rc<FunctionDecl>,
        scope: ScopeId,
        owner: Option<StructId>,
        visibility: Visibility,
        eager: bool,
    ) -> SemaResult<FunctionId> {
        let kind = match (&decl.name, owner) {
            (FnName::Ctor(_), _) => FnKind::Ctor,
            (FnName::Dtor(_), _) => FnKind::Dtor,
            (_, Some(_)) if decl.is_static => FnKind::Static,
            (_, Some(_)) => FnKind::Method,
            (_, None) => FnKind::Free,
        };
        let fid = self.push_function(decl.clone(), scope, owner, kind);
        if matches!(kind, FnKind::Free | FnKind::Static | FnKind::Method) {
            let ident = fn_ident(&decl.name);
            self.declare_name(
                scope,
                &ident,
                Entry {
                    symbol: Symbol::Function(fid),
                    visibility,
                    owner,
                },
            )?;
            let name = self.prog.functions[fid.index()].name.clone();
            self.prog.functions_by_name.entry(name).or_default().push(fid);
        }
        if eager {
            self.mark_used(fid);
        }
        Ok(fid)
    }

    /// Allocate a function record; the signature resolves on first use.
    pub(crate) fn push_function(
        &mut self,
        decl: Rc<FunctionDecl>,
        scope: ScopeId,
        owner: Option<StructId>,
        kind: FnKind,
    ) -> FunctionId {
        let fid = FunctionId::from_index(self.prog.functions.len());
        let name = self.scopes.qualify(scope, &fn_ident(&decl.name).name);
        self.prog.functions.push(FunctionInfo {
            name,
            kind,
            owner,
            params: Vec::new(),
            ret: TypeInfo::value(Type::Void),
            is_const: decl.is_const,
            locals: Vec::new(),
            body: None,
            exit_cleanup: Vec::new(),
            span: decl.span,
        });
        let auto_ret = match &decl.ret {
            Some(TypeExpr {
                kind: TypeKind::Auto,
                is_ref,
                ..
            }) => Some(*is_ref),
            _ => None,
        };
        self.fn_states.push(FnState {
            decl,
            scope,
            sig: Phase::Pending,
            body: Phase::Pending,
            queued: false,
            auto_ret,
        });
        fid
    }

    fn declare_template(
        &mut self,
        decl: TemplateDecl,
        name: &Ident,
        scope: ScopeId,
        owner: Option<StructId>,
        visibility: Visibility,
    ) -> SemaResult<()> {
        let tid = TemplateId::from_index(self.templates.len());
        let (params, symbol) = match &decl {
            TemplateDecl::Struct(s) => (
                s.template.clone().unwrap_or_default(),
                Symbol::StructTemplate(tid),
            ),
            TemplateDecl::Function(f) => (
                f.template.clone().unwrap_or_default(),
                Symbol::FunctionTemplate(tid),
            ),
        };
        self.templates.push(TemplateInfo {
            decl,
            params,
            scope,
            owner,
            name: self.scopes.qualify(scope, &name.name),
        });
        self.declare_name(
            scope,
            name,
            Entry {
                symbol,
                visibility,
                owner,
            },
        )
    }

    pub(crate) fn declare_global(
        &mut self,
        decl: &VarDecl,
        scope: ScopeId,
        owner: Option<StructId>,
        visibility: Visibility,
    ) -> SemaResult<GlobalId> {
        let gid = GlobalId::from_index(self.prog.globals.len());
        self.prog.globals.push(GlobalInfo {
            name: self.scopes.qualify(scope, &decl.name.name),
            ty: Type::Void,
            is_const: decl.ty.is_const,
            init: None,
            value: None,
            span: decl.span,
        });
        self.global_states.push(GlobalState {
            decl: decl.clone(),
            scope,
            phase: Phase::Pending,
        });
        self.declare_name(
            scope,
            &decl.name,
            Entry {
                symbol: Symbol::Global(gid),
                visibility,
                owner,
            },
        )?;
        Ok(gid)
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Resolve the fields of `sid` (and of every struct it stores by value).
    pub(crate) fn complete_struct(&mut self, sid: StructId) -> SemaResult<()> {
        match self.struct_states[sid.index()].phase {
            Phase::Done => return Ok(()),
            Phase::Failed => return Err(Halt::Poisoned),
            Phase::Active => {
                let span = self.prog.structs[sid.index()].span;
                return fail(
                    codes::E0306,
                    span,
                    format!("{} contains itself", self.prog.structs[sid.index()].name),
                );
            }
            Phase::Pending => {}
        }
        self.struct_states[sid.index()].phase = Phase::Active;
        let result = self.complete_fields(sid);
        self.struct_states[sid.index()].phase = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn complete_fields(&mut self, sid: StructId) -> SemaResult<()> {
        let decl = self.struct_states[sid.index()].decl.clone();
        let scope = self.struct_states[sid.index()].scope;
        for member in &decl.members {
            let crate::ast::MemberKind::Field(v) = &member.kind else {
                continue;
            };
            if v.is_static {
                continue;
            }
            if v.ty.kind == TypeKind::Auto {
                return fail(codes::E0306, v.ty.span, "Can't use auto on member variables");
            }
            let info = self.resolve_type(&v.ty, scope)?;
            if info.is_ref {
                return fail(codes::E0602, v.ty.span, "Can't use references as member variables");
            }
            if info.ty == Type::Void {
                return fail(codes::E0306, v.ty.span, "Can't use void as member type");
            }
            self.complete_type(&info.ty)?;
            let default = match &v.init {
                Some(init) => {
                    let mut cx = FnCx::detached(scope, None);
                    Some(self.initializer(&mut cx, &info.ty, Some(init), v.span)?)
                }
                None => Some(self.default_init(&info.ty, v.span)?),
            };
            self.prog.structs[sid.index()].fields.push(FieldInfo {
                name: v.name.name.clone(),
                ty: info.ty,
                is_mutable: v.is_mutable,
                is_public: member.visibility == Visibility::Public,
                default,
                span: v.span,
            });
        }
        Ok(())
    }

    /// Complete every struct stored by value inside `ty`.
    pub(crate) fn complete_type(&mut self, ty: &Type) -> SemaResult<()> {
        match ty {
            Type::Struct(sid) => self.complete_struct(*sid),
            Type::Span(t, _) | Type::PolyData(t, _) => self.complete_type(t),
            Type::Node(n) => {
                for t in n.storage() {
                    self.complete_type(&t)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resolve the type, initializer and constant value of a global.
    pub(crate) fn global(&mut self, gid: GlobalId) -> SemaResult<()> {
        match self.global_states[gid.index()].phase {
            Phase::Done => return Ok(()),
            Phase::Failed => return Err(Halt::Poisoned),
            Phase::Active => {
                let span = self.prog.globals[gid.index()].span;
                return fail(
                    codes::E0309,
                    span,
                    format!("recursive initialisation of {}", self.prog.globals[gid.index()].name),
                );
            }
            Phase::Pending => {}
        }
        self.global_states[gid.index()].phase = Phase::Active;
        let result = self.resolve_global(gid);
        self.global_states[gid.index()].phase = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn resolve_global(&mut self, gid: GlobalId) -> SemaResult<()> {
        let decl = self.global_states[gid.index()].decl.clone();
        let scope = self.global_states[gid.index()].scope;
        let mut cx = FnCx::detached(scope, None);
        let (ty, init) = if decl.ty.kind == TypeKind::Auto {
            let Some(crate::ast::Initializer::Assign(e)) = &decl.init else {
                return fail(codes::E0306, decl.ty.span, "Can't deduce auto type");
            };
            let te = self.expr(&mut cx, e)?;
            (te.ty.clone(), TInit::Expr(te))
        } else {
            let info = self.resolve_type(&decl.ty, scope)?;
            if info.is_ref {
                return fail(codes::E0602, decl.ty.span, "Can't declare global references");
            }
            self.complete_type(&info.ty)?;
            let init = self.initializer(&mut cx, &info.ty, decl.init.as_ref(), decl.span)?;
            (info.ty, init)
        };
        let value = match (&init, decl.ty.is_const) {
            (TInit::Expr(e), true) => e.const_value(),
            _ => None,
        };
        let g = &mut self.prog.globals[gid.index()];
        g.ty = ty;
        g.init = Some(init);
        g.value = value;
        Ok(())
    }

    pub(crate) fn alias(&mut self, id: usize) -> SemaResult<Type> {
        match self.aliases[id].phase {
            Phase::Done => {
                return self.aliases[id].ty.clone().ok_or(Halt::Poisoned);
            }
            Phase::Failed => return Err(Halt::Poisoned),
            Phase::Active => {
                let span = self.aliases[id].decl.name.span;
                return fail(
                    codes::E0306,
                    span,
                    format!("recursive alias {}", self.aliases[id].decl.name.name),
                );
            }
            Phase::Pending => {}
        }
        self.aliases[id].phase = Phase::Active;
        let decl = self.aliases[id].decl.ty.clone();
        let scope = self.aliases[id].scope;
        let result = self.resolve_type(&decl, scope);
        match result {
            Ok(info) => {
                let name = self.scopes.qualify(scope, &self.aliases[id].decl.name.name);
                self.prog.types_by_name.insert(name, info.ty.clone());
                self.aliases[id].phase = Phase::Done;
                self.aliases[id].ty = Some(info.ty.clone());
                Ok(info.ty)
            }
            Err(e) => {
                self.aliases[id].phase = Phase::Failed;
                Err(e)
            }
        }
    }

    // ── Functions ────────────────────────────────────────────────────────

    /// Queue a function body for analysis.
    pub(crate) fn mark_used(&mut self, fid: FunctionId) {
        let st = &mut self.fn_states[fid.index()];
        if !st.queued {
            st.queued = true;
            self.queue.push_back(fid);
        }
    }

    /// Resolve parameter and return types.
    pub(crate) fn signature(&mut self, fid: FunctionId) -> SemaResult<()> {
        match self.fn_states[fid.index()].sig {
            Phase::Done => return Ok(()),
            Phase::Failed => return Err(Halt::Poisoned),
            Phase::Active => {
                let span = self.prog.functions[fid.index()].span;
                return fail(codes::E0306, span, "Can't deduce type");
            }
            Phase::Pending => {}
        }
        self.fn_states[fid.index()].sig = Phase::Active;
        let result = self.resolve_signature(fid);
        self.fn_states[fid.index()].sig = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn resolve_signature(&mut self, fid: FunctionId) -> SemaResult<()> {
        let decl = self.fn_states[fid.index()].decl.clone();
        let scope = self.fn_states[fid.index()].scope;
        let mut params = Vec::new();
        let mut locals = Vec::new();
        for (i, p) in decl.params.iter().enumerate() {
            if p.ty.kind == TypeKind::Auto {
                return fail(codes::E0306, p.ty.span, "Can't deduce type");
            }
            let info = self.resolve_type(&p.ty, scope)?;
            if info.ty == Type::Void {
                return fail(codes::E0306, p.ty.span, "Can't use void as parameter type");
            }
            self.complete_type(&info.ty)?;
            locals.push(LocalInfo {
                name: p.name.name.clone(),
                ty: info.ty.clone(),
                is_const: info.is_const,
                by_ref: info.is_ref,
                span: p.name.span,
            });
            params.push(ParamInfo {
                name: p.name.name.clone(),
                ty: info,
                local: crate::id::LocalId::from_index(i),
                default: None,
            });
        }

        let ret = match (&decl.name, &decl.ret) {
            (FnName::Operator(OverloadOp::Bool, _), _) => TypeInfo::value(Type::Bool),
            (_, None) => TypeInfo::value(Type::Void),
            (_, Some(t)) if t.kind == TypeKind::Auto => TypeInfo {
                ty: Type::Void,
                is_const: t.is_const,
                is_ref: t.is_ref,
            },
            (_, Some(t)) => {
                let info = self.resolve_type(t, scope)?;
                self.complete_type(&info.ty)?;
                info
            }
        };

        {
            let f = &mut self.prog.functions[fid.index()];
            f.params = params;
            f.locals = locals;
            f.ret = ret;
        }

        // Defaults may call other functions, so they resolve last.
        for (i, p) in decl.params.iter().enumerate() {
            if let Some(d) = &p.default {
                let ty = self.prog.functions[fid.index()].params[i].ty.ty.clone();
                let mut cx = FnCx::detached(scope, None);
                let te = self.expr_to(&mut cx, d, &ty)?;
                self.prog.functions[fid.index()].params[i].default = Some(te);
            }
        }
        Ok(())
    }

    /// Return type of `fid`, analysing the body first for `auto`.
    pub(crate) fn return_type(&mut self, fid: FunctionId, span: Span) -> SemaResult<TypeInfo> {
        self.signature(fid)?;
        if self.fn_states[fid.index()].auto_ret.is_some() {
            match self.fn_states[fid.index()].body {
                Phase::Active => return fail(codes::E0306, span, "Can't deduce auto type"),
                Phase::Failed => return Err(Halt::Poisoned),
                _ => self.analyze_body(fid)?,
            }
        }
        Ok(self.prog.functions[fid.index()].ret.clone())
    }

    pub(crate) fn analyze_body(&mut self, fid: FunctionId) -> SemaResult<()> {
        match self.fn_states[fid.index()].body {
            Phase::Done | Phase::Active => return Ok(()),
            Phase::Failed => return Err(Halt::Poisoned),
            Phase::Pending => {}
        }
        self.signature(fid)?;
        self.fn_states[fid.index()].body = Phase::Active;
        self.fn_states[fid.index()].queued = true;
        let result = self.function_body(fid);
        self.fn_states[fid.index()].body = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn function_body(&mut self, fid: FunctionId) -> SemaResult<()> {
        let decl = self.fn_states[fid.index()].decl.clone();
        let scope = self.fn_states[fid.index()].scope;
        let auto_ret = self.fn_states[fid.index()].auto_ret;
        let info = &self.prog.functions[fid.index()];
        let this = match info.kind {
            FnKind::Method | FnKind::Ctor | FnKind::Dtor => info.owner,
            _ => None,
        };
        let mut cx = FnCx::detached(scope, this);
        cx.func = Some(fid);
        cx.const_this = info.is_const;
        cx.ret = if auto_ret.is_some() {
            None
        } else {
            Some(info.ret.clone())
        };
        cx.auto_ref = auto_ret.unwrap_or(false);
        cx.locals = info.locals.clone();
        cx.push_block();
        for (i, l) in info.locals.iter().enumerate() {
            cx.bind(&l.name, crate::id::LocalId::from_index(i));
        }

        let mut body = self.block(&mut cx, &decl.body)?;

        let ret = match auto_ret {
            Some(is_ref) => match &cx.deduced {
                Some(d) => TypeInfo {
                    ty: d.ty.clone(),
                    is_const: d.is_const,
                    is_ref,
                },
                None => TypeInfo::value(Type::Void),
            },
            None => self.prog.functions[fid.index()].ret.clone(),
        };
        if ret.ty != Type::Void && !crate::stmt::block_returns(&body) {
            return fail(
                codes::E0307,
                fn_ident(&decl.name).span,
                "Not all paths return a value",
            );
        }

        crate::lifetime::synthesize(&self.prog, &cx.locals, &mut body);
        let exit = crate::lifetime::exit_cleanup(
            &self.prog,
            &self.prog.functions[fid.index()].params,
            &cx.locals,
        );
        let f = &mut self.prog.functions[fid.index()];
        f.ret = ret;
        f.locals = cx.locals;
        f.body = Some(body);
        f.exit_cleanup = exit;
        Ok(())
    }

    // ── Names ────────────────────────────────────────────────────────────

    /// Resolve a (possibly qualified, possibly templated) path. `from` is
    /// the scope whose private members are accessible.
    pub(crate) fn resolve_path(
        &mut self,
        path: &Path,
        scope: ScopeId,
        from: ScopeId,
    ) -> SemaResult<Resolved> {
        let full = path.display_name();
        let first = &path.segments[0];
        let entries = match self.scopes.unqualified(scope, &first.ident.name) {
            Lookup::Found(e, _) => e.to_vec(),
            Lookup::Ambiguous => {
                return fail(
                    codes::E0202,
                    first.ident.span,
                    format!("{} is ambiguous", first.ident.name),
                )
            }
            Lookup::Missing => {
                return fail(
                    codes::E0201,
                    first.ident.span,
                    format!("Can't resolve symbol {}", full),
                )
            }
        };
        let mut current = self.entries_to_resolved(&entries, first, scope)?;

        for seg in &path.segments[1..] {
            let container = match &current {
                Resolved::Namespace(s) => *s,
                Resolved::Type(Type::Struct(sid)) => self.struct_states[sid.index()].scope,
                Resolved::Type(Type::Enum(e)) => match self.enum_scopes.get(e) {
                    Some(s) => *s,
                    None => return self.unresolved(seg, &full),
                },
                _ => return self.unresolved(seg, &full),
            };
            let entries = match self.scopes.qualified(container, &seg.ident.name) {
                Lookup::Found(e, _) => e.to_vec(),
                Lookup::Ambiguous => {
                    return fail(
                        codes::E0202,
                        seg.ident.span,
                        format!("{} is ambiguous", seg.ident.name),
                    )
                }
                Lookup::Missing => return self.unresolved(seg, &full),
            };
            for e in &entries {
                self.check_access(e, container, &seg.ident, from)?;
            }
            current = self.entries_to_resolved(&entries, seg, scope)?;
        }
        Ok(current)
    }

    fn unresolved<T>(&self, seg: &PathSegment, full: &str) -> SemaResult<T> {
        fail(
            codes::E0201,
            seg.ident.span,
            format!("Can't resolve symbol {}", full),
        )
    }

    /// Private members are visible inside their struct and nested scopes.
    pub(crate) fn check_access(
        &self,
        entry: &Entry,
        container: ScopeId,
        ident: &Ident,
        from: ScopeId,
    ) -> SemaResult<()> {
        if entry.visibility == Visibility::Public {
            return Ok(());
        }
        let Some(owner) = entry.owner else {
            return Ok(());
        };
        let owner_scope = self.struct_states[owner.index()].scope;
        if self.scopes.is_within(from, owner_scope) {
            return Ok(());
        }
        fail(
            codes::E0401,
            ident.span,
            format!(
                "{} is not accessible",
                self.scopes.qualify(container, &ident.name)
            ),
        )
    }

    fn entries_to_resolved(
        &mut self,
        entries: &[Entry],
        seg: &PathSegment,
        scope: ScopeId,
    ) -> SemaResult<Resolved> {
        let is_fn = |e: &Entry| matches!(e.symbol, Symbol::Function(_) | Symbol::FunctionTemplate(_));
        if !entries.is_empty() && entries.iter().all(is_fn) {
            let mut ids = Vec::new();
            let mut templates = Vec::new();
            for e in entries {
                match e.symbol {
                    Symbol::Function(f) => ids.push(f),
                    Symbol::FunctionTemplate(t) => templates.push(t),
                    _ => {}
                }
            }
            let explicit = match &seg.args {
                Some(args) => Some(self.template_args(args, scope)?),
                None => None,
            };
            return Ok(Resolved::Functions {
                ids,
                templates,
                explicit,
            });
        }
        let Some(entry) = entries.first() else {
            return fail(
                codes::E0201,
                seg.ident.span,
                format!("Can't resolve symbol {}", seg.ident.name),
            );
        };
        let not_template = |name: &str| {
            fail::<Resolved>(
                codes::E0306,
                seg.ident.span,
                format!("{} is not a template", name),
            )
        };
        Ok(match &entry.symbol {
            Symbol::Namespace(s) => Resolved::Namespace(*s),
            Symbol::Struct(sid) => {
                if seg.args.is_some() {
                    return not_template(&seg.ident.name);
                }
                Resolved::Type(Type::Struct(*sid))
            }
            Symbol::StructTemplate(tid) => match &seg.args {
                Some(args) => {
                    let values = self.template_args(args, scope)?;
                    let sid = self.instantiate_struct(*tid, values, seg.ident.span)?;
                    Resolved::Type(Type::Struct(sid))
                }
                None => match self.current_instance(*tid, scope) {
                    Some(sid) => Resolved::Type(Type::Struct(sid)),
                    None => Resolved::StructTemplate(*tid),
                },
            },
            Symbol::Enum(e) => Resolved::Type(Type::Enum(*e)),
            Symbol::EnumValue(e, v) => Resolved::EnumValue(*e, *v),
            Symbol::Alias(a) => Resolved::Type(self.alias(*a)?),
            Symbol::Type(t) => Resolved::Type(t.clone()),
            Symbol::Value(c) => Resolved::Value(*c),
            Symbol::Field(s, i) => Resolved::Field(*s, *i),
            Symbol::Global(g) => Resolved::Global(*g),
            Symbol::Builtin(b) => match &seg.args {
                Some(args) => {
                    let values = self.template_args(args, scope)?;
                    Resolved::Type(self.builtin_type(*b, values, seg.ident.span)?)
                }
                None => match self.builtin_type_without_args(*b) {
                    Some(t) => Resolved::Type(t),
                    None => Resolved::Builtin(*b),
                },
            },
            Symbol::Function(_) | Symbol::FunctionTemplate(_) => {
                return fail(
                    codes::E0201,
                    seg.ident.span,
                    format!("Can't resolve symbol {}", seg.ident.name),
                )
            }
        })
    }

    /// Inside the body of a template instance, the bare template name means
    /// that instance.
    fn current_instance(&self, tid: TemplateId, scope: ScopeId) -> Option<StructId> {
        let mut current = Some(scope);
        while let Some(s) = current {
            if let ScopeKind::Struct(sid) = self.scopes.get(s).kind {
                let hit = self
                    .instances
                    .iter()
                    .any(|((t, _), st)| *t == tid && *st == InstanceState::Done(Instance::Struct(sid)));
                if hit {
                    return Some(sid);
                }
            }
            current = self.scopes.get(s).parent;
        }
        None
    }

    // ── Types ────────────────────────────────────────────────────────────

    pub(crate) fn resolve_type(&mut self, te: &TypeExpr, scope: ScopeId) -> SemaResult<TypeInfo> {
        let ty = match &te.kind {
            TypeKind::Prim(p) => prim_type(*p),
            TypeKind::Auto => return fail(codes::E0306, te.span, "Can't deduce type"),
            TypeKind::Path(path) => match self.resolve_path(path, scope, scope)? {
                Resolved::Type(t) => t,
                Resolved::StructTemplate(tid) => {
                    let values = self.default_template_args(tid, path.span)?;
                    Type::Struct(self.instantiate_struct(tid, values, path.span)?)
                }
                Resolved::Builtin(_) => {
                    return fail(
                        codes::E0306,
                        path.span,
                        format!("{} requires template arguments", path.display_name()),
                    )
                }
                _ => {
                    return fail(
                        codes::E0201,
                        path.span,
                        format!("{} is not a type", path.display_name()),
                    )
                }
            },
        };
        Ok(TypeInfo {
            ty,
            is_const: te.is_const,
            is_ref: te.is_ref,
        })
    }

    /// Evaluate a constant expression in `scope`.
    pub(crate) fn eval_const(&mut self, e: &crate::ast::Expr, scope: ScopeId) -> SemaResult<ConstValue> {
        let mut cx = FnCx::detached(scope, None);
        let te = self.expr(&mut cx, e)?;
        match te.const_value() {
            Some(c) => Ok(c),
            None => fail(codes::E0309, e.span, "Can't evaluate expression"),
        }
    }

    pub(crate) fn display(&self, ty: &Type) -> String {
        ty.display(&self.prog)
    }

    /// Struct scope for member lookup.
    pub(crate) fn struct_scope(&self, sid: StructId) -> ScopeId {
        self.struct_states[sid.index()].scope
    }
}

impl TypeContext for Analyzer {
    fn struct_name(&self, id: StructId) -> String {
        self.prog.struct_name(id)
    }

    fn enum_name(&self, id: EnumId) -> String {
        self.prog.enum_name(id)
    }

    fn enum_is_class(&self, id: EnumId) -> bool {
        self.prog.enum_is_class(id)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn public(symbol: Symbol) -> Entry {
    Entry {
        symbol,
        visibility: Visibility::Public,
        owner: None,
    }
}

pub(crate) fn prim_type(p: crate::ast::Prim) -> Type {
    match p {
        crate::ast::Prim::Void => Type::Void,
        crate::ast::Prim::Int => Type::Int,
        crate::ast::Prim::Float => Type::Float,
        crate::ast::Prim::Double => Type::Double,
        crate::ast::Prim::Bool => Type::Bool,
    }
}

/// Lookup key of a function name (`process`, `operator+=`, …).
pub(crate) fn fn_ident(name: &FnName) -> Ident {
    match name {
        FnName::Ident(i) | FnName::Ctor(i) => i.clone(),
        FnName::Dtor(i) => Ident {
            name: format!("~{}", i.name),
            span: i.span,
        },
        FnName::Operator(op, span) => Ident {
            name: operator_name(*op),
            span: *span,
        },
    }
}

pub(crate) fn operator_name(op: OverloadOp) -> String {
    match op {
        OverloadOp::Assign => "operator=".into(),
        OverloadOp::Subscript => "operator[]".into(),
        OverloadOp::Increment => "operator++".into(),
        OverloadOp::Decrement => "operator--".into(),
        OverloadOp::Bool => "operator bool".into(),
        OverloadOp::Compound(op) => format!("operator{}=", op.symbol()),
        OverloadOp::Binary(op) => format!("operator{}", op.symbol()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(src: &str) -> Result<TypedProgram, Vec<Diagnostic>> {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        analyze(&program, &AnalyzeOptions::default()).map(|(p, _)| p)
    }

    fn first_error(src: &str) -> String {
        match check(src) {
            Ok(_) => panic!("expected an error"),
            Err(d) => d[0].message.clone(),
        }
    }

    #[test]
    fn declaration_order_inside_struct_is_free() {
        let p = check(
            "struct X { int get() const { return value; } int value = 3; };
             int main() { X x; return x.get(); }",
        )
        .expect("analysis");
        assert!(p.functions_by_name.contains_key("main"));
        assert_eq!(p.structs[0].fields.len(), 1);
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        assert_eq!(first_error("int x = 1; float x = 2.0f;"), "Duplicate symbol x");
    }

    #[test]
    fn unresolved_symbol_names_the_path() {
        assert_eq!(
            first_error("int main() { return ns::nope; }"),
            "Can't resolve symbol ns::nope"
        );
    }

    #[test]
    fn private_members_are_not_accessible_outside() {
        let msg = first_error(
            "class X { int v = 1; public: static const int K = 2; };
             int main() { X x; return x.v; }",
        );
        assert_eq!(msg, "X::v is not accessible");
    }

    #[test]
    fn using_namespace_ambiguity() {
        let msg = first_error(
            "namespace a { int f() { return 1; } }
             namespace b { int f() { return 2; } }
             using namespace a;
             using namespace b;
             int main() { return f(); }",
        );
        assert_eq!(msg, "f is ambiguous");
    }

    #[test]
    fn enums_auto_increment() {
        let p = check("enum E { A, B = 5, C }; int main() { return C; }").expect("analysis");
        assert_eq!(
            p.enums[0].values,
            vec![("A".to_string(), 0), ("B".to_string(), 5), ("C".to_string(), 6)]
        );
    }

    #[test]
    fn missing_return_path_is_reported() {
        assert_eq!(
            first_error("int f(int a) { if (a > 0) { return 1; } }"),
            "Not all paths return a value"
        );
    }

    #[test]
    fn auto_return_recursion_cannot_deduce() {
        let msg = first_error("auto f() { return f(); } int main() { return 0; }");
        assert_eq!(msg, "Can't deduce auto type");
    }
}
