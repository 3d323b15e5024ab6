// graph.rs — Node graph layout and parameter wiring
//
// Builds the `NodeGraph` handed across the backend boundary: per-struct
// memory layout, the callbacks and channel count of every user node, and the
// parameter wiring table of every container type the program stores. Also
// checks that every parameter slot called somewhere is connected somewhere.
//
// Preconditions: `prog` passed semantic analysis.
// Postconditions: layouts follow C rules (fields in order, each aligned to its
//   own alignment, size rounded up to the struct alignment).
// Failure modes: unconnected parameter slots → E0703 diagnostics.
// Side effects: none.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::ast::Span;
use crate::diag::{codes, Diagnostic};
use crate::id::{LocalId, StructId};
use crate::thir::{
    BuiltinOp, LetInit, NodeOp, TBlock, TExpr, TExprKind, TInit, TStmt, TypedProgram,
};
use crate::types::{IndexType, NodeType, ParamType, Type};
use dspl_runtime::index::Policy;

// ── Public types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldLayout {
    pub name: String,
    pub ty: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructLayout {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldLayout>,
}

/// A user struct acting as a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub channels: Option<usize>,
    /// Callback names the backend must bind, e.g. `process<2>`.
    pub callbacks: Vec<String>,
}

/// One leaf of a container's parameter spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamWire {
    pub container: String,
    /// `setParameter<slot>` of the container.
    pub slot: usize,
    /// Index passed to `connect<i>` for this leaf.
    pub connection: usize,
    pub target: String,
    pub index: usize,
    pub transform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryLayout {
    pub name: String,
    pub ty: String,
    pub channels: usize,
    pub frame: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeGraph {
    pub layouts: Vec<StructLayout>,
    pub nodes: Vec<NodeInfo>,
    pub wiring: Vec<ParamWire>,
    pub entry: Option<EntryLayout>,
}

impl NodeGraph {
    pub fn layout(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.iter().find(|l| l.name == name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

// ── Construction ─────────────────────────────────────────────────────────

pub fn build(prog: &TypedProgram) -> NodeGraph {
    let layouts = prog
        .structs
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let sid = StructId::from_index(i);
            let (size, align) = size_align(prog, &Type::Struct(sid));
            let offsets = field_offsets(prog, sid);
            StructLayout {
                name: s.name.clone(),
                size,
                align,
                fields: s
                    .fields
                    .iter()
                    .zip(offsets)
                    .map(|(f, offset)| FieldLayout {
                        name: f.name.clone(),
                        ty: f.ty.display(prog),
                        offset,
                    })
                    .collect(),
            }
        })
        .collect();

    let ordered: BTreeMap<StructId, _> = prog.nodes.iter().map(|(k, v)| (*k, v)).collect();
    let nodes = ordered
        .into_iter()
        .map(|(sid, m)| {
            let mut callbacks = Vec::new();
            let single = [
                ("reset", m.reset),
                ("prepare", m.prepare),
                ("handleHiseEvent", m.handle_event),
                ("handleModulation", m.handle_modulation),
                ("setExternalData", m.set_external_data),
            ];
            for (name, f) in single {
                if f.is_some() {
                    callbacks.push(name.to_string());
                }
            }
            callbacks.extend(m.process.keys().map(|c| format!("process<{}>", c)));
            callbacks.extend(m.process_frame.keys().map(|c| format!("processFrame<{}>", c)));
            callbacks.extend(m.set_parameter.keys().map(|p| format!("setParameter<{}>", p)));
            NodeInfo {
                name: prog.structs[sid.index()].name.clone(),
                channels: m.channels,
                callbacks,
            }
        })
        .collect();

    let mut containers = Vec::new();
    let mut seen = HashSet::new();
    for s in &prog.structs {
        for f in &s.fields {
            collect_nodes(&f.ty, &mut containers, &mut seen);
        }
    }
    for g in &prog.globals {
        collect_nodes(&g.ty, &mut containers, &mut seen);
    }
    for f in &prog.functions {
        for l in &f.locals {
            collect_nodes(&l.ty, &mut containers, &mut seen);
        }
    }
    let mut wiring = Vec::new();
    for node in &containers {
        wire(prog, node, &mut wiring);
    }

    let entry = prog.entry.as_ref().map(|e| EntryLayout {
        name: e.name.clone(),
        ty: e.ty.display(prog),
        channels: e.channels,
        frame: e.frame,
    });

    NodeGraph {
        layouts,
        nodes,
        wiring,
        entry,
    }
}

fn collect_nodes(ty: &Type, out: &mut Vec<NodeType>, seen: &mut HashSet<NodeType>) {
    match ty {
        Type::Node(n) => {
            for t in n.storage() {
                collect_nodes(&t, out, seen);
            }
            if n.params().is_some() && seen.insert((**n).clone()) {
                out.push((**n).clone());
            }
        }
        Type::Span(t, _) | Type::PolyData(t, _) => collect_nodes(t, out, seen),
        _ => {}
    }
}

fn wire(prog: &TypedProgram, node: &NodeType, out: &mut Vec<ParamWire>) {
    let Some(params) = node.params() else {
        return;
    };
    let container = Type::Node(Box::new(node.clone())).display(prog);
    for slot in 0..params.slots() {
        let Some(spec) = params.slot(slot) else {
            continue;
        };
        for connection in 0..spec.connect_targets() {
            let Some((_, leaf)) = spec.leaf(connection) else {
                continue;
            };
            let Some((target, index)) = leaf.leaf_target() else {
                continue;
            };
            let transform = match leaf {
                ParamType::Expression { expr, .. } => Some(prog.structs[expr.index()].name.clone()),
                ParamType::From0To1 { range, .. } => Some(range.display(prog)),
                _ => match spec {
                    ParamType::Chain { range, .. } => Some(range.display(prog)),
                    _ => None,
                },
            };
            out.push(ParamWire {
                container: container.clone(),
                slot,
                connection,
                target: target.display(prog),
                index,
                transform,
            });
        }
    }
}

// ── Memory layout ────────────────────────────────────────────────────────

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align.max(1)) * align.max(1)
}

/// C layout of a sequence of members.
fn record(members: impl IntoIterator<Item = (usize, usize)>) -> (usize, usize, Vec<usize>) {
    let mut size = 0;
    let mut align = 1;
    let mut offsets = Vec::new();
    for (s, a) in members {
        size = align_up(size, a);
        offsets.push(size);
        size += s;
        align = align.max(a);
    }
    (align_up(size.max(1), align), align, offsets)
}

fn field_offsets(prog: &TypedProgram, sid: StructId) -> Vec<usize> {
    let members: Vec<_> = prog.structs[sid.index()]
        .fields
        .iter()
        .map(|f| size_align(prog, &f.ty))
        .collect();
    record(members).2
}

/// Size and alignment of a value of `ty`.
pub fn size_align(prog: &TypedProgram, ty: &Type) -> (usize, usize) {
    match ty {
        Type::Void | Type::Identity => (1, 1),
        Type::Bool => (1, 1),
        Type::Int | Type::Float | Type::Enum(_) => (4, 4),
        Type::Double => (8, 8),
        Type::Struct(sid) => {
            let members: Vec<_> = prog.structs[sid.index()]
                .fields
                .iter()
                .map(|f| size_align(prog, &f.ty))
                .collect();
            let (size, align, _) = record(members);
            (size, align)
        }
        Type::Span(t, n) => {
            let (s, a) = size_align(prog, t);
            let align = if **t == Type::Float && *n == crate::types::LANE_WIDTH {
                16
            } else {
                a
            };
            (align_up(s * n, align), align)
        }
        Type::Dyn(_) => (16, 8),
        Type::Index(IndexType::Int {
            policy: Policy::Looped,
            ..
        }) => (12, 4),
        Type::Index(i) => match i.value_type() {
            Type::Double => (8, 8),
            _ => (4, 4),
        },
        Type::Node(n) => {
            let members: Vec<_> = n.storage().iter().map(|t| size_align(prog, t)).collect();
            let (size, align, _) = record(members);
            (size, align)
        }
        Type::Param(p) => param_size(p),
        Type::ProcessData(_) | Type::FrameData(_) => (24, 8),
        Type::PolyData(t, n) => {
            let (s, a) = size_align(prog, t);
            let align = a.max(4);
            (align_up(s * n + 4, align), align)
        }
        Type::Event => (16, 4),
        Type::PrepareSpecs => (16, 8),
        Type::ExternalData => (24, 8),
    }
}

/// Leaves hold a pointer to their target; composites hold their children.
fn param_size(p: &ParamType) -> (usize, usize) {
    match p {
        ParamType::Empty => (1, 1),
        ParamType::Chain { items, .. } | ParamType::List(items) => {
            let (size, align, _) = record(items.iter().map(param_size));
            (size, align)
        }
        _ => (8, 8),
    }
}

// ── Connection check ─────────────────────────────────────────────────────

/// Report every parameter call whose slot has no `connect` anywhere in the
/// unit.
pub fn check_connections(prog: &TypedProgram) -> Vec<Diagnostic> {
    let mut c = Collector::default();
    for (i, f) in prog.functions.iter().enumerate() {
        if let Some(body) = &f.body {
            c.func = i;
            c.aliases.clear();
            c.block(body);
        }
    }
    for g in &prog.globals {
        if let Some(init) = &g.init {
            c.init(init);
        }
    }

    let mut diags = Vec::new();
    for call in &c.calls {
        for leaf in call.leaves.clone() {
            let exact = call
                .key
                .as_ref()
                .is_some_and(|k| !k.starts_with("this") && c.connected.contains(&(k.clone(), leaf)));
            let loose = c.loose.contains(&(call.ty.clone(), leaf));
            let any = match &call.key {
                Some(k) if !k.starts_with("this") => false,
                _ => c.any.contains(&(call.ty.clone(), leaf)),
            };
            if !(exact || loose || any) {
                diags.push(
                    Diagnostic::error(
                        codes::E0703,
                        call.span,
                        format!(
                            "{}: connection {} is not connected",
                            call.ty.display(prog),
                            leaf
                        ),
                    )
                    .with_hint(format!("call connect<{}>(node) before the parameter is used", leaf)),
                );
                break;
            }
        }
    }
    diags
}

struct ParamCall {
    /// Storage path of the parameter object.
    key: Option<String>,
    ty: Type,
    leaves: std::ops::Range<usize>,
    span: Span,
}

#[derive(Default)]
struct Collector {
    func: usize,
    aliases: BTreeMap<LocalId, Option<String>>,
    /// `(path, leaf)` of connections through a fixed storage path.
    connected: HashSet<(String, usize)>,
    /// `(param type, leaf)` of connections through `this` or a reference.
    loose: HashSet<(Type, usize)>,
    /// `(param type, leaf)` of every connection.
    any: HashSet<(Type, usize)>,
    calls: Vec<ParamCall>,
}

impl Collector {
    fn block(&mut self, b: &TBlock) {
        for s in &b.stmts {
            self.stmt(s);
        }
    }

    fn stmt(&mut self, s: &TStmt) {
        match s {
            TStmt::Let { local, init } => match init {
                LetInit::Ref(e) => {
                    let key = self.key(e);
                    self.aliases.insert(*local, key);
                    self.expr(e);
                }
                LetInit::Value(i) => self.init(i),
            },
            TStmt::Expr(e) => self.expr(e),
            TStmt::If { cond, then, els } => {
                self.expr(cond);
                self.stmt(then);
                if let Some(e) = els {
                    self.stmt(e);
                }
            }
            TStmt::While { cond, body } => {
                self.expr(cond);
                self.stmt(body);
            }
            TStmt::For { cond, step, body } => {
                if let Some(c) = cond {
                    self.expr(c);
                }
                if let Some(s) = step {
                    self.expr(s);
                }
                self.stmt(body);
            }
            TStmt::RangeFor {
                local, range, body, ..
            } => {
                self.aliases.insert(*local, None);
                self.expr(range);
                self.stmt(body);
            }
            TStmt::Return(Some(e), _) => self.expr(e),
            TStmt::Block(b) => self.block(b),
            TStmt::Break(_) | TStmt::Continue(_) | TStmt::Return(None, _) => {}
        }
    }

    fn init(&mut self, i: &TInit) {
        match i {
            TInit::Default(_) => {}
            TInit::Expr(e) => self.expr(e),
            TInit::Ctor { args, .. } => {
                for a in args {
                    self.expr(&a.expr);
                }
            }
            TInit::List { items, .. } => {
                for item in items {
                    self.init(item);
                }
            }
            TInit::Splat { item, .. } => self.init(item),
        }
    }

    fn expr(&mut self, e: &TExpr) {
        match &e.kind {
            TExprKind::Builtin { op, this, args } => {
                if let Some(ob) = this {
                    self.builtin(*op, ob, e.span);
                    self.expr(ob);
                }
                for a in args {
                    self.expr(&a.expr);
                }
            }
            TExprKind::Call { this, args, .. } => {
                if let Some(ob) = this {
                    self.expr(ob);
                }
                for a in args {
                    self.expr(&a.expr);
                }
            }
            TExprKind::Field { object, .. } => self.expr(object),
            TExprKind::Elem { object, index, .. } => {
                self.expr(object);
                self.expr(index);
            }
            TExprKind::Construct(i) => self.init(i),
            TExprKind::Convert(x) | TExprKind::Unary { expr: x, .. } => self.expr(x),
            TExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            TExprKind::Assign { target, value } | TExprKind::Compound { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            TExprKind::IncDec { target, .. } => self.expr(target),
            TExprKind::Ternary { cond, then, els } => {
                self.expr(cond);
                self.expr(then);
                self.expr(els);
            }
            TExprKind::Const(_) | TExprKind::Local(_) | TExprKind::Global(_) | TExprKind::This => {}
        }
    }

    fn builtin(&mut self, op: BuiltinOp, ob: &TExpr, span: Span) {
        match op {
            BuiltinOp::Connect(i) => {
                let key = self.key(ob);
                self.any.insert((ob.ty.clone(), i));
                match key {
                    Some(k) if !k.starts_with("this") => {
                        self.connected.insert((k, i));
                    }
                    _ => {
                        self.loose.insert((ob.ty.clone(), i));
                    }
                }
            }
            BuiltinOp::ParamCall(index) => {
                let Type::Param(spec) = &ob.ty else {
                    return;
                };
                let leaves = match (&**spec, index) {
                    (ParamType::List(items), Some(i)) => {
                        let start: usize = items[..i].iter().map(ParamType::connect_targets).sum();
                        start..start + items.get(i).map_or(0, ParamType::connect_targets)
                    }
                    _ => 0..spec.connect_targets(),
                };
                self.calls.push(ParamCall {
                    key: self.key(ob),
                    ty: ob.ty.clone(),
                    leaves,
                    span,
                });
            }
            BuiltinOp::Node(NodeOp::SetParameter(p)) => {
                let mut key = self.key(ob);
                let mut ty = ob.ty.clone();
                // Wrappers without parameters forward to the wrapped node.
                while let Type::Node(n) = &ty {
                    if n.params().is_some() {
                        break;
                    }
                    let Some((inner, slot)) = n.inner() else {
                        break;
                    };
                    key = key.map(|k| format!("{}.s{}", k, slot));
                    ty = inner.clone();
                }
                let Type::Node(n) = &ty else {
                    return;
                };
                let (spec, suffix) = match &**n {
                    NodeType::Chain { params, .. } => (params.slot(p), format!(".p{}", p)),
                    _ => return,
                };
                let Some(spec) = spec else {
                    return;
                };
                self.calls.push(ParamCall {
                    key: key.map(|k| k + &suffix),
                    ty: Type::Param(Box::new(spec.clone())),
                    leaves: 0..spec.connect_targets(),
                    span,
                });
            }
            _ => {}
        }
    }

    /// Storage path of a place, rooted at a global, a local or `this`.
    fn key(&self, e: &TExpr) -> Option<String> {
        match &e.kind {
            TExprKind::Global(g) => Some(format!("g{}", g.index())),
            TExprKind::Local(l) => match self.aliases.get(l) {
                Some(alias) => alias.clone(),
                None => Some(format!("f{}.l{}", self.func, l.index())),
            },
            TExprKind::This => Some("this".to_string()),
            TExprKind::Field { object, index } => {
                self.key(object).map(|k| format!("{}.f{}", k, index))
            }
            TExprKind::Builtin {
                op,
                this: Some(ob),
                ..
            } => {
                let base = self.key(ob)?;
                match op {
                    // Slot 0 of a chain holds its parameters.
                    BuiltinOp::Get(i) => Some(format!("{}.s{}", base, i + 1)),
                    BuiltinOp::GetParameter(Some(i)) => Some(format!("{}.p{}", base, i)),
                    BuiltinOp::GetParameter(None) => Some(format!("{}.p0", base)),
                    BuiltinOp::GetObject => {
                        let Type::Node(n) = &ob.ty else {
                            return None;
                        };
                        let (_, slot) = n.inner()?;
                        Some(format!("{}.s{}", base, slot))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::{analyze, AnalyzeOptions};

    const NODE: &str = "
        struct Test {
            void reset() {}
            void processFrame(span<float, 1>& d) {}
            template <int P> void setParameter(double v) { value = v; }
            double value = 0.0;
        };";

    fn analyzed(body: &str) -> Result<TypedProgram, Vec<String>> {
        let src = format!("{} {}", NODE, body);
        let parsed = crate::parser::parse(&src);
        let program = parsed.program.expect("parse failed");
        analyze(&program, &AnalyzeOptions::default())
            .map(|(p, _)| p)
            .map_err(|d| d.into_iter().map(|d| d.message).collect())
    }

    #[test]
    fn struct_layout_follows_c_rules() {
        let p = analyzed("struct L { bool b; double d; int i; }; L l; int main() { return 0; }")
            .expect("analysis");
        let g = build(&p);
        let l = g.layout("L").expect("layout");
        assert_eq!((l.size, l.align), (24, 8));
        let offsets: Vec<usize> = l.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 8, 16]);
    }

    #[test]
    fn simd_spans_are_16_byte_aligned() {
        let p = analyzed("struct V { int a; float4 lanes; }; V v; int main() { return 0; }")
            .expect("analysis");
        let g = build(&p);
        let v = g.layout("V").expect("layout");
        assert_eq!(v.fields[1].offset, 16);
        assert_eq!(v.size, 32);
    }

    #[test]
    fn wiring_lists_every_leaf() {
        let p = analyzed(
            "using P = parameter::chain<ranges::Identity, parameter::plain<Test, 0>, parameter::plain<Test, 1>>;
             container::chain<P, Test, Test> c;
             int main() {
                 c.getParameter<0>().connect<0>(c.get<0>());
                 c.getParameter<0>().connect<1>(c.get<1>());
                 c.setParameter<0>(0.5);
                 return 0;
             }",
        )
        .expect("analysis");
        let g = build(&p);
        assert_eq!(g.wiring.len(), 2);
        assert_eq!(g.wiring[1].connection, 1);
        assert_eq!(g.wiring[1].index, 1);
        assert_eq!(g.wiring[0].transform.as_deref(), Some("ranges::Identity"));
        assert!(check_connections(&p).is_empty());
    }

    #[test]
    fn calling_an_unconnected_slot_is_reported() {
        let p = analyzed(
            "container::chain<parameter::plain<Test, 0>, Test> c;
             int main() { c.setParameter<0>(0.5); return 0; }",
        )
        .expect("analysis");
        let d = check_connections(&p);
        assert_eq!(d.len(), 1);
        assert_eq!(
            d[0].message,
            "parameter::plain<Test, 0>: connection 0 is not connected"
        );
    }
}
