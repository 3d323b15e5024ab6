// nodes.rs — Node callback contract and channel binding
//
// A user struct becomes a node the first time it is placed in a container,
// wrapper or parameter target. Its callbacks are looked up once and cached
// in `TypedProgram::nodes`; `process`/`processFrame` templates are
// instantiated per channel count when a graph is bound to a channel count.
//
// Preconditions: the struct's declaration has been collected.
// Postconditions: every callback a bound graph can reach is queued for
//   analysis; containers agree on one channel count.
// Failure modes: missing callbacks, channel mismatches, non-node children.
// Side effects: instantiates callback templates; fills `nodes` and `entry`.

use crate::ast::{Ident, Path, PathSegment, Span, TemplateParamKind};
use crate::diag::{codes, Diagnostic};
use crate::id::{FunctionId, StructId, TemplateId};
use crate::sema::{fail, Analyzer, Resolved, SemaResult};
use crate::symbols::{ScopeTable, Symbol};
use crate::thir::{EntryNode, NodeMethods};
use crate::types::{NodeType, TemplateValue, Type};

impl Analyzer {
    // ── Member lookup ────────────────────────────────────────────────────

    /// A non-template member function declared directly in `sid`.
    pub(crate) fn find_method(&self, sid: StructId, name: &str) -> Option<FunctionId> {
        let entries = self.scopes.local(self.struct_scope(sid), name)?;
        entries.iter().find_map(|e| match e.symbol {
            Symbol::Function(f) => Some(f),
            _ => None,
        })
    }

    fn find_template(&self, sid: StructId, name: &str) -> Option<TemplateId> {
        let entries = self.scopes.local(self.struct_scope(sid), name)?;
        entries.iter().find_map(|e| match e.symbol {
            Symbol::FunctionTemplate(t) => Some(t),
            _ => None,
        })
    }

    fn has_member_fn(&self, sid: StructId, name: &str) -> bool {
        self.find_method(sid, name).is_some() || self.find_template(sid, name).is_some()
    }

    fn missing_fn<T>(&self, sid: StructId, name: &str, span: Span) -> SemaResult<T> {
        fail(
            codes::E0701,
            span,
            format!(
                "missing function {}::{}",
                self.prog.structs[sid.index()].name,
                name
            ),
        )
    }

    // ── User nodes ───────────────────────────────────────────────────────

    /// Callbacks of a user node. Requires `reset` and one of `process` or
    /// `processFrame`.
    pub(crate) fn user_node(&mut self, sid: StructId, span: Span) -> SemaResult<NodeMethods> {
        if let Some(m) = self.prog.nodes.get(&sid) {
            return Ok(m.clone());
        }
        self.complete_struct(sid)?;
        let Some(reset) = self.find_method(sid, "reset") else {
            return self.missing_fn(sid, "reset", span);
        };
        if !self.has_member_fn(sid, "process") && !self.has_member_fn(sid, "processFrame") {
            return self.missing_fn(sid, "process", span);
        }

        let mut m = NodeMethods {
            reset: Some(reset),
            ..NodeMethods::default()
        };
        m.channels = self.declared_channels(sid)?;

        for (name, frame) in [("process", false), ("processFrame", true)] {
            let Some(fid) = self.find_method(sid, name) else {
                continue;
            };
            self.signature(fid)?;
            let param = self.prog.functions[fid.index()].params.first().map(|p| p.ty.ty.clone());
            let channels = match (param, frame) {
                (Some(Type::ProcessData(c)), false) => c,
                (Some(Type::Span(t, c)), true) if *t == Type::Float => c,
                _ => {
                    return fail(
                        codes::E0701,
                        self.prog.functions[fid.index()].span,
                        format!("{}: wrong signature", self.prog.functions[fid.index()].name),
                    )
                }
            };
            if m.channels.is_none() {
                m.channels = Some(channels);
            }
            if frame {
                m.process_frame.insert(channels, fid);
            } else {
                m.process.insert(channels, fid);
            }
            self.mark_used(fid);
        }

        m.prepare = self.find_method(sid, "prepare");
        m.handle_event = self.find_method(sid, "handleHiseEvent");
        for fid in [Some(reset), m.prepare, m.handle_event].into_iter().flatten() {
            self.mark_used(fid);
        }
        self.prog.nodes.insert(sid, m.clone());
        Ok(m)
    }

    /// `static const int NumChannels`, if declared.
    fn declared_channels(&mut self, sid: StructId) -> SemaResult<Option<usize>> {
        let Some(entries) = self.scopes.local(self.struct_scope(sid), "NumChannels") else {
            return Ok(None);
        };
        let Some(gid) = entries.iter().find_map(|e| match e.symbol {
            Symbol::Global(g) => Some(g),
            _ => None,
        }) else {
            return Ok(None);
        };
        self.global(gid)?;
        match self.prog.globals[gid.index()].value.and_then(|v| v.as_i64()) {
            Some(c) if c > 0 => Ok(Some(c as usize)),
            _ => fail(
                codes::E0702,
                self.prog.globals[gid.index()].span,
                "NumChannels must be a positive constant",
            ),
        }
    }

    /// Channel count a node pins, `None` for channel-polymorphic nodes.
    pub(crate) fn node_channels(&mut self, ty: &Type, span: Span) -> SemaResult<Option<usize>> {
        match ty {
            Type::Struct(sid) => Ok(self.user_node(*sid, span)?.channels),
            Type::Node(node) => match &**node {
                NodeType::Fix { channels, .. } | NodeType::Frame { channels, .. } => {
                    Ok(Some(*channels))
                }
                NodeType::Chain { nodes, .. } => {
                    for n in nodes {
                        if let Some(c) = self.node_channels(n, span)? {
                            return Ok(Some(c));
                        }
                    }
                    Ok(None)
                }
                NodeType::Event(inner)
                | NodeType::Init { inner, .. }
                | NodeType::Mod { inner, .. }
                | NodeType::Data { inner, .. } => self.node_channels(inner, span),
            },
            other => fail(
                codes::E0701,
                span,
                format!("{} is not a node", self.display(other)),
            ),
        }
    }

    /// The innermost user struct behind nested wrappers.
    fn innermost(&self, ty: &Type) -> Option<StructId> {
        match ty {
            Type::Struct(sid) => Some(*sid),
            Type::Node(node) => node.inner().and_then(|(inner, _)| self.innermost(inner)),
            _ => None,
        }
    }

    // ── Container validation ─────────────────────────────────────────────

    /// Validate a container or wrapper and wrap it in `Type::Node`.
    pub(crate) fn node_type(&mut self, node: NodeType, span: Span) -> SemaResult<Type> {
        self.check_node(&node, span)?;
        Ok(Type::Node(Box::new(node)))
    }

    fn check_node(&mut self, node: &NodeType, span: Span) -> SemaResult<()> {
        let shown = self.display(&Type::Node(Box::new(node.clone())));
        let illegal = |span: Span| {
            fail::<()>(
                codes::E0702,
                span,
                format!("{}: illegal channel wrap amount", shown),
            )
        };
        match node {
            NodeType::Chain { nodes, .. } => {
                let mut pinned = None;
                for n in nodes {
                    match (pinned, self.node_channels(n, span)?) {
                        (Some(a), Some(b)) if a != b => return illegal(span),
                        (None, Some(b)) => pinned = Some(b),
                        _ => {}
                    }
                }
                Ok(())
            }
            NodeType::Fix { channels, inner } => match self.node_channels(inner, span)? {
                Some(c) if c != *channels => illegal(span),
                _ => Ok(()),
            },
            NodeType::Frame { channels, inner } => {
                if let Some(c) = self.node_channels(inner, span)? {
                    if c != *channels {
                        return illegal(span);
                    }
                }
                if let Type::Struct(sid) = inner {
                    if !self.has_member_fn(*sid, "processFrame") {
                        return self.missing_fn(*sid, "processFrame", span);
                    }
                }
                Ok(())
            }
            NodeType::Event(inner) => self.node_channels(inner, span).map(|_| ()),
            NodeType::Init { inner, initialiser } => {
                self.node_channels(inner, span)?;
                self.init_ctor(inner, initialiser, span)
            }
            NodeType::Mod { inner, .. } => {
                self.node_channels(inner, span)?;
                let Some(sid) = self.innermost(inner) else {
                    return Ok(());
                };
                let Some(fid) = self.find_method(sid, "handleModulation") else {
                    return self.missing_fn(sid, "handleModulation", span);
                };
                self.signature(fid)?;
                let f = &self.prog.functions[fid.index()];
                let ok = f.ret.ty == Type::Bool
                    && f.params.len() == 1
                    && f.params[0].ty.ty == Type::Double
                    && f.params[0].ty.is_ref;
                if !ok {
                    return fail(
                        codes::E0701,
                        f.span,
                        format!("{} must be bool(double&)", f.name),
                    );
                }
                self.mark_used(fid);
                if let Some(m) = self.prog.nodes.get_mut(&sid) {
                    m.handle_modulation = Some(fid);
                }
                Ok(())
            }
            NodeType::Data { inner, .. } => {
                self.node_channels(inner, span)?;
                let Some(sid) = self.innermost(inner) else {
                    return Ok(());
                };
                let Some(fid) = self.find_method(sid, "setExternalData") else {
                    return self.missing_fn(sid, "setExternalData", span);
                };
                self.signature(fid)?;
                self.mark_used(fid);
                if let Some(m) = self.prog.nodes.get_mut(&sid) {
                    m.set_external_data = Some(fid);
                }
                Ok(())
            }
        }
    }

    /// `wrap::init<N, I>` constructs `I` from `N&`.
    fn init_ctor(&mut self, inner: &Type, initialiser: &Type, span: Span) -> SemaResult<()> {
        let Type::Struct(iid) = initialiser else {
            return Ok(());
        };
        self.complete_struct(*iid)?;
        for fid in self.prog.structs[iid.index()].ctors.clone() {
            self.signature(fid)?;
            let f = &self.prog.functions[fid.index()];
            if let [p] = f.params.as_slice() {
                if p.ty.ty == *inner && p.ty.is_ref && !p.ty.is_const {
                    self.mark_used(fid);
                    return Ok(());
                }
            }
        }
        let name = self.display(initialiser);
        fail(
            codes::E0701,
            span,
            format!("missing constructor {}({}&)", name, self.display(inner)),
        )
    }

    // ── Parameters ───────────────────────────────────────────────────────

    /// Make `setParameter<index>` of `target` available. Absent user
    /// callbacks are no-ops.
    pub(crate) fn ensure_set_parameter(
        &mut self,
        target: &Type,
        index: usize,
        span: Span,
    ) -> SemaResult<()> {
        match target {
            Type::Struct(sid) => {
                let methods = self.user_node(*sid, span)?;
                if methods.set_parameter.contains_key(&index) {
                    return Ok(());
                }
                let fid = if let Some(tid) = self.find_template(*sid, "setParameter") {
                    self.instantiate_function(tid, vec![TemplateValue::Int(index as i64)], span)?
                } else if let Some(fid) = self.find_method(*sid, "setParameter") {
                    fid
                } else {
                    return Ok(());
                };
                self.signature(fid)?;
                let f = &self.prog.functions[fid.index()];
                if f.params.len() != 1 || !f.params[0].ty.ty.is_numeric() {
                    return fail(
                        codes::E0701,
                        f.span,
                        format!("{} must take one double", f.name),
                    );
                }
                self.mark_used(fid);
                if let Some(m) = self.prog.nodes.get_mut(sid) {
                    m.set_parameter.insert(index, fid);
                }
                Ok(())
            }
            Type::Node(node) => match &**node {
                NodeType::Chain { params, .. } => {
                    if params.slot(index).is_none() {
                        return fail(
                            codes::E0704,
                            span,
                            format!(
                                "{}: no parameter at index {}",
                                self.display(target),
                                index
                            ),
                        );
                    }
                    Ok(())
                }
                NodeType::Mod { param, .. } if param.slot(index).is_some() => Ok(()),
                other => match other.inner() {
                    Some((inner, _)) => {
                        let inner = inner.clone();
                        self.ensure_set_parameter(&inner, index, span)
                    }
                    None => Ok(()),
                },
            },
            other => fail(
                codes::E0701,
                span,
                format!("{} is not a node", self.display(other)),
            ),
        }
    }

    // ── Channel binding ──────────────────────────────────────────────────

    /// Instantiate the `process` (or `processFrame`) callbacks reachable
    /// from `ty` for `channels` channels.
    pub(crate) fn bind_node(
        &mut self,
        ty: &Type,
        channels: usize,
        frame: bool,
        span: Span,
    ) -> SemaResult<()> {
        match ty {
            Type::Struct(sid) => self.bind_user_node(*sid, channels, frame, span),
            Type::Node(node) => match &**node {
                NodeType::Chain { nodes, .. } => {
                    for n in nodes {
                        self.bind_node(n, channels, frame, span)?;
                    }
                    Ok(())
                }
                NodeType::Fix { channels: c, inner } => self.bind_node(inner, *c, frame, span),
                NodeType::Frame { channels: c, inner } => self.bind_node(inner, *c, true, span),
                NodeType::Event(inner)
                | NodeType::Init { inner, .. }
                | NodeType::Mod { inner, .. }
                | NodeType::Data { inner, .. } => self.bind_node(inner, channels, frame, span),
            },
            other => fail(
                codes::E0701,
                span,
                format!("{} is not a node", self.display(other)),
            ),
        }
    }

    fn bind_user_node(
        &mut self,
        sid: StructId,
        channels: usize,
        frame: bool,
        span: Span,
    ) -> SemaResult<()> {
        let methods = self.user_node(sid, span)?;
        if let Some(native) = methods.channels.filter(|c| *c != channels) {
            return Err(Diagnostic::error(
                codes::E0702,
                span,
                format!(
                    "{}: illegal channel wrap amount",
                    self.prog.structs[sid.index()].name
                ),
            )
            .with_hint(format!("the node declares NumChannels = {}", native))
            .with_related(self.prog.structs[sid.index()].span, "node declared here")
            .into());
        }
        // Block processing falls back to per-frame calls on leaves without `process`.
        let frame = frame || !self.has_member_fn(sid, "process");
        let (name, bound) = if frame {
            ("processFrame", &methods.process_frame)
        } else {
            ("process", &methods.process)
        };
        if bound.contains_key(&channels) {
            return Ok(());
        }
        let Some(tid) = self.find_template(sid, name) else {
            return self.missing_fn(sid, name, span);
        };
        let arg = match self.templates[tid.index()].params.first().map(|p| &p.kind) {
            Some(TemplateParamKind::Type) if frame => {
                TemplateValue::Type(Type::Span(Box::new(Type::Float), channels))
            }
            Some(TemplateParamKind::Type) => TemplateValue::Type(Type::ProcessData(channels)),
            Some(TemplateParamKind::Value(_)) => TemplateValue::Int(channels as i64),
            None => return self.missing_fn(sid, name, span),
        };
        let fid = self.instantiate_function(tid, vec![arg], span)?;
        if let Some(m) = self.prog.nodes.get_mut(&sid) {
            if frame {
                m.process_frame.insert(channels, fid);
            } else {
                m.process.insert(channels, fid);
            }
        }
        Ok(())
    }

    /// Resolve the node type `name` (`a::b`) and bind it to `channels`.
    pub(crate) fn bind_entry_node(
        &mut self,
        name: &str,
        channels: usize,
        span: Span,
    ) -> SemaResult<()> {
        let path = Path {
            segments: name
                .split("::")
                .map(|s| PathSegment {
                    ident: Ident {
                        name: s.to_string(),
                        span,
                    },
                    args: None,
                })
                .collect(),
            span,
        };
        let g = ScopeTable::GLOBAL;
        let ty = match self.resolve_path(&path, g, g)? {
            Resolved::Type(t @ (Type::Struct(_) | Type::Node(_))) => t,
            _ => {
                return fail(
                    codes::E0201,
                    span,
                    format!("Can't resolve node {}", name),
                )
            }
        };
        let frame = match &ty {
            Type::Struct(sid) => {
                self.user_node(*sid, span)?;
                !self.has_member_fn(*sid, "process")
            }
            _ => false,
        };
        self.bind_node(&ty, channels, frame, span)?;
        self.prog.entry = Some(EntryNode {
            name: name.to_string(),
            ty,
            channels,
            frame,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};

    const TEST_NODE: &str = "
        struct Test {
            static const int NumChannels = 1;
            void reset() { v = 1; }
            void processFrame(span<float, 1>& data) { data[0] = data[0] * 2.0f; }
            int v = 0;
        };";

    fn first(src: &str) -> String {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        match analyze(&program, &AnalyzeOptions::default()) {
            Ok(_) => String::new(),
            Err(d) => d[0].message.clone(),
        }
    }

    #[test]
    fn fix_must_match_native_channels() {
        let bad = format!("{} wrap::fix<2, Test> obj; int main() {{ return 0; }}", TEST_NODE);
        assert_eq!(first(&bad), "wrap::fix<2, Test>: illegal channel wrap amount");
        let good = format!("{} wrap::fix<1, Test> obj; int main() {{ return 0; }}", TEST_NODE);
        assert_eq!(first(&good), "");
    }

    #[test]
    fn children_need_reset() {
        let src = "
            struct NoReset { void processFrame(span<float, 1>& d) {} };
            container::chain<parameter::empty, NoReset> c;
            int main() { return 0; }";
        assert_eq!(first(src), "missing function NoReset::reset");
    }

    #[test]
    fn mod_needs_handle_modulation() {
        let src = format!(
            "{} wrap::mod<parameter::empty, Test> m; int main() {{ return 0; }}",
            TEST_NODE
        );
        assert_eq!(first(&src), "missing function Test::handleModulation");
    }

    #[test]
    fn chain_get_is_bounds_checked() {
        let src = format!(
            "{} container::chain<parameter::empty, Test, Test> c;
             int main() {{ return c.get<2>().v; }}",
            TEST_NODE
        );
        assert_eq!(
            first(&src),
            "container::chain<parameter::empty, Test, Test>: no child at index 2"
        );
    }

    #[test]
    fn entry_node_instantiates_process_templates() {
        let src = "
            struct Gain {
                void reset() {}
                template <int C> void process(ProcessData<C>& d) {}
            };
            int main() { return 0; }";
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        let options = AnalyzeOptions {
            node_entry: Some(("Gain".to_string(), 2)),
        };
        let (prog, _) = analyze(&program, &options).expect("analysis");
        let entry = prog.entry.as_ref().expect("entry");
        assert_eq!(entry.channels, 2);
        assert!(!entry.frame);
        let methods = prog.nodes.values().next().expect("node");
        assert!(methods.process.contains_key(&2));
    }
}
