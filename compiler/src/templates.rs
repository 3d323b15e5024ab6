// templates.rs — Template arguments, instantiation and deduction
//
// Instantiations are memoized per compile unit under the key
// (template, canonical argument list). Each instance gets a scope binding its
// parameters and its own copy of every static member, so `X<5>` declared in
// two places is one struct with one set of statics. A key that is still
// being instantiated when it is requested again is a recursion error.
//
// Preconditions: template ids come from the same analyzer.
// Postconditions: argument lists are complete (defaults applied) before
//   they are used as keys.
// Failure modes: wrong argument kinds or counts, recursion, depth limit.
//   Errors inside an instance carry an "instantiated from here" cause and
//   poison the key.
// Side effects: allocates structs, functions and scopes.

use tracing::trace;

use crate::ast::{Path, Span, TemplateArg, TemplateParamKind, TypeExpr, TypeKind};
use crate::const_eval::ConstValue;
use crate::diag::codes;
use crate::id::{FunctionId, ScopeId, StructId, TemplateId};
use crate::sema::{
    fail, Analyzer, Halt, Instance, InstanceState, Resolved, SemaResult, TemplateDecl,
    MAX_INSTANTIATION_DEPTH,
};
use crate::symbols::{Entry, ScopeKind, Symbol};
use crate::thir::FnKind;
use crate::types::{TemplateValue, Type};

impl Analyzer {
    // ── Arguments ────────────────────────────────────────────────────────

    pub(crate) fn template_args(
        &mut self,
        args: &[TemplateArg],
        scope: ScopeId,
    ) -> SemaResult<Vec<TemplateValue>> {
        args.iter().map(|a| self.template_arg(a, scope)).collect()
    }

    fn template_arg(&mut self, arg: &TemplateArg, scope: ScopeId) -> SemaResult<TemplateValue> {
        match arg {
            TemplateArg::Const(e) => {
                let v = self.eval_const(e, scope)?;
                const_arg(v, e.span)
            }
            TemplateArg::Type(te) => match &te.kind {
                TypeKind::Path(path) if !te.is_ref => self.path_arg(path, scope),
                _ => Ok(TemplateValue::Type(self.resolve_type(te, scope)?.ty)),
            },
        }
    }

    /// A bare path argument may name a type or a constant.
    fn path_arg(&mut self, path: &Path, scope: ScopeId) -> SemaResult<TemplateValue> {
        match self.resolve_path(path, scope, scope)? {
            Resolved::Type(t) => Ok(TemplateValue::Type(t)),
            Resolved::Value(v) => const_arg(v, path.span),
            Resolved::EnumValue(_, v) => Ok(TemplateValue::Int(v as i64)),
            Resolved::Global(g) => {
                self.global(g)?;
                match self.prog.globals[g.index()].value {
                    Some(v) => const_arg(v, path.span),
                    None => fail(
                        codes::E0306,
                        path.span,
                        "Can't use non-integers as template argument",
                    ),
                }
            }
            Resolved::StructTemplate(tid) => {
                let values = self.default_template_args(tid, path.span)?;
                let sid = self.instantiate_struct(tid, values, path.span)?;
                Ok(TemplateValue::Type(Type::Struct(sid)))
            }
            _ => fail(
                codes::E0306,
                path.span,
                format!("{} is not a type", path.display_name()),
            ),
        }
    }

    /// Arguments for a template named without any: every parameter needs a
    /// default.
    pub(crate) fn default_template_args(
        &mut self,
        tid: TemplateId,
        span: Span,
    ) -> SemaResult<Vec<TemplateValue>> {
        let t = &self.templates[tid.index()];
        if t.params.iter().all(|p| p.default.is_some()) {
            Ok(Vec::new())
        } else {
            fail(
                codes::E0306,
                span,
                format!("{} requires template arguments", t.name),
            )
        }
    }

    /// Apply defaults and check argument kinds.
    fn complete_args(
        &mut self,
        tid: TemplateId,
        mut values: Vec<TemplateValue>,
        span: Span,
    ) -> SemaResult<Vec<TemplateValue>> {
        let params = self.templates[tid.index()].params.clone();
        let name = self.templates[tid.index()].name.clone();
        if values.len() > params.len() {
            return fail(
                codes::E0306,
                span,
                format!("too many template arguments for {}", name),
            );
        }
        for (i, p) in params.iter().enumerate() {
            if i >= values.len() {
                let Some(default) = &p.default else {
                    return fail(
                        codes::E0306,
                        span,
                        format!("missing template argument {} for {}", p.name.name, name),
                    );
                };
                let scope = self.bind_template_scope(tid, &values);
                let v = self.template_arg(default, scope)?;
                values.push(v);
            }
            match (p.kind, &values[i]) {
                (TemplateParamKind::Type, TemplateValue::Int(_)) => {
                    return fail(
                        codes::E0306,
                        span,
                        format!("template argument {} of {} must be a type", p.name.name, name),
                    )
                }
                (TemplateParamKind::Value(_), TemplateValue::Type(_)) => {
                    return fail(
                        codes::E0306,
                        span,
                        "Can't use non-integers as template argument",
                    )
                }
                _ => {}
            }
        }
        Ok(values)
    }

    /// A scope binding the first `values.len()` parameters of `tid`.
    fn bind_template_scope(&mut self, tid: TemplateId, values: &[TemplateValue]) -> ScopeId {
        let t = &self.templates[tid.index()];
        let parent = t.scope;
        let params = t.params.clone();
        let path = self.scopes.get(parent).path.clone();
        let scope = self.scopes.push(ScopeKind::Template, Some(parent), path);
        for (p, v) in params.iter().zip(values) {
            let symbol = match (p.kind, v) {
                (_, TemplateValue::Type(t)) => Symbol::Type(t.clone()),
                (TemplateParamKind::Value(crate::ast::Prim::Bool), TemplateValue::Int(i)) => {
                    Symbol::Value(ConstValue::Bool(*i != 0))
                }
                (_, TemplateValue::Int(i)) => Symbol::Value(ConstValue::Int(*i as i32)),
            };
            self.scopes.insert(
                scope,
                &p.name.name,
                Entry {
                    symbol,
                    visibility: crate::ast::Visibility::Public,
                    owner: None,
                },
            );
        }
        scope
    }

    fn instance_name(&self, tid: TemplateId, values: &[TemplateValue]) -> String {
        let args: Vec<String> = values.iter().map(|v| v.display(&self.prog)).collect();
        format!("{}<{}>", self.templates[tid.index()].name, args.join(", "))
    }

    // ── Instantiation ────────────────────────────────────────────────────

    /// Look up or start an instantiation. `Ok(Some)` is a memo hit.
    fn begin_instance(
        &mut self,
        tid: TemplateId,
        values: &[TemplateValue],
        span: Span,
    ) -> SemaResult<Option<Instance>> {
        let key = (tid, values.to_vec());
        match self.instances.get(&key) {
            Some(InstanceState::Done(i)) => return Ok(Some(*i)),
            Some(InstanceState::Failed) => return Err(Halt::Poisoned),
            Some(InstanceState::Active) => {
                return fail(
                    codes::E0306,
                    span,
                    format!(
                        "recursive template instantiation of {}",
                        self.instance_name(tid, values)
                    ),
                )
            }
            None => {}
        }
        if self.depth >= MAX_INSTANTIATION_DEPTH {
            return fail(
                codes::E0306,
                span,
                format!(
                    "template instantiation depth exceeded at {}",
                    self.instance_name(tid, values)
                ),
            );
        }
        self.instances.insert(key, InstanceState::Active);
        self.instantiations += 1;
        Ok(None)
    }

    fn finish_instance<T>(
        &mut self,
        tid: TemplateId,
        values: Vec<TemplateValue>,
        name: &str,
        span: Span,
        result: SemaResult<(T, Instance)>,
    ) -> SemaResult<T> {
        match result {
            Ok((v, instance)) => {
                self.instances
                    .insert((tid, values), InstanceState::Done(instance));
                Ok(v)
            }
            Err(e) => {
                self.instances.insert((tid, values), InstanceState::Failed);
                Err(match e {
                    Halt::Report(d) => Halt::Report(Box::new(
                        d.with_cause(format!("instantiated from here: {}", name), Some(span)),
                    )),
                    Halt::Poisoned => Halt::Poisoned,
                })
            }
        }
    }

    pub(crate) fn instantiate_struct(
        &mut self,
        tid: TemplateId,
        values: Vec<TemplateValue>,
        span: Span,
    ) -> SemaResult<StructId> {
        let values = self.complete_args(tid, values, span)?;
        match self.begin_instance(tid, &values, span)? {
            Some(Instance::Struct(sid)) => return Ok(sid),
            Some(Instance::Function(_)) => {
                return fail(codes::E0306, span, "template is not a struct template")
            }
            None => {}
        }
        let name = self.instance_name(tid, &values);
        trace!(name = %name, "instantiating struct template");

        self.depth += 1;
        let result = self.build_struct_instance(tid, &values, &name);
        self.depth -= 1;
        self.finish_instance(tid, values, &name, span, result)
    }

    fn build_struct_instance(
        &mut self,
        tid: TemplateId,
        values: &[TemplateValue],
        name: &str,
    ) -> SemaResult<(StructId, Instance)> {
        let TemplateDecl::Struct(decl) = self.templates[tid.index()].decl.clone() else {
            return fail(
                codes::E0306,
                self.templates[tid.index()].params[0].name.span,
                "template is not a struct template",
            );
        };
        let scope = self.bind_template_scope(tid, values);
        let sid = self.declare_struct(
            decl.clone(),
            scope,
            &decl.name,
            Some(name.to_string()),
            crate::ast::Visibility::Public,
            false,
        )?;
        self.complete_struct(sid)?;
        if let Some(dtor) = self.prog.structs[sid.index()].dtor {
            self.mark_used(dtor);
        }
        Ok((sid, Instance::Struct(sid)))
    }

    pub(crate) fn instantiate_function(
        &mut self,
        tid: TemplateId,
        values: Vec<TemplateValue>,
        span: Span,
    ) -> SemaResult<FunctionId> {
        let values = self.complete_args(tid, values, span)?;
        match self.begin_instance(tid, &values, span)? {
            Some(Instance::Function(fid)) => return Ok(fid),
            Some(Instance::Struct(_)) => {
                return fail(codes::E0306, span, "template is not a function template")
            }
            None => {}
        }
        let name = self.instance_name(tid, &values);
        trace!(name = %name, "instantiating function template");

        self.depth += 1;
        let result = self.build_function_instance(tid, &values, &name);
        self.depth -= 1;
        self.finish_instance(tid, values, &name, span, result)
    }

    fn build_function_instance(
        &mut self,
        tid: TemplateId,
        values: &[TemplateValue],
        name: &str,
    ) -> SemaResult<(FunctionId, Instance)> {
        let TemplateDecl::Function(decl) = self.templates[tid.index()].decl.clone() else {
            return fail(
                codes::E0306,
                self.templates[tid.index()].params[0].name.span,
                "template is not a function template",
            );
        };
        let owner = self.templates[tid.index()].owner;
        let kind = match owner {
            Some(_) if decl.is_static => FnKind::Static,
            Some(_) => FnKind::Method,
            None => FnKind::Free,
        };
        let scope = self.bind_template_scope(tid, values);
        let fid = self.push_function(decl, scope, owner, kind);
        self.prog.functions[fid.index()].name = name.to_string();
        if let Some(sid) = owner {
            self.prog.structs[sid.index()].methods.push(fid);
        }
        self.instances
            .insert((tid, values.to_vec()), InstanceState::Done(Instance::Function(fid)));
        self.signature(fid)?;
        self.mark_used(fid);
        Ok((fid, Instance::Function(fid)))
    }

    // ── Deduction ────────────────────────────────────────────────────────

    /// Deduce the arguments of a function template from explicit arguments
    /// and call argument types. `None` when the call cannot match.
    pub(crate) fn deduce(
        &mut self,
        tid: TemplateId,
        explicit: &[TemplateValue],
        args: &[Type],
    ) -> Option<Vec<TemplateValue>> {
        let TemplateDecl::Function(decl) = self.templates[tid.index()].decl.clone() else {
            return None;
        };
        let params = self.templates[tid.index()].params.clone();
        if explicit.len() > params.len() {
            return None;
        }
        let names: Vec<String> = params.iter().map(|p| p.name.name.clone()).collect();
        let mut bound: Vec<Option<TemplateValue>> = params
            .iter()
            .enumerate()
            .map(|(i, _)| explicit.get(i).cloned())
            .collect();
        for (p, ty) in decl.params.iter().zip(args) {
            if !deduce_from(&p.ty, ty, &names, &mut bound) {
                return None;
            }
        }
        let mut values = Vec::new();
        for (i, b) in bound.into_iter().enumerate() {
            match b {
                Some(v) => values.push(v),
                None if params[i].default.is_some() => break,
                None => return None,
            }
        }
        Some(values)
    }
}

fn const_arg(v: ConstValue, span: Span) -> SemaResult<TemplateValue> {
    match v {
        ConstValue::Int(i) => Ok(TemplateValue::Int(i as i64)),
        ConstValue::Bool(b) => Ok(TemplateValue::Int(b as i64)),
        _ => fail(
            codes::E0306,
            span,
            "Can't use non-integers as template argument",
        ),
    }
}

/// Name of a template argument written as a bare identifier.
fn bare_name(arg: &TemplateArg) -> Option<&str> {
    let path = match arg {
        TemplateArg::Type(TypeExpr {
            kind: TypeKind::Path(p),
            ..
        }) => p,
        TemplateArg::Const(crate::ast::Expr {
            kind: crate::ast::ExprKind::Path(p),
            ..
        }) => p,
        _ => return None,
    };
    match path.segments.as_slice() {
        [seg] if seg.args.is_none() => Some(seg.ident.name.as_str()),
        _ => None,
    }
}

fn bind(
    names: &[String],
    bound: &mut [Option<TemplateValue>],
    name: &str,
    value: TemplateValue,
) -> Option<bool> {
    let i = names.iter().position(|n| n == name)?;
    Some(match &bound[i] {
        Some(existing) => *existing == value,
        None => {
            bound[i] = Some(value);
            true
        }
    })
}

/// Match a parameter type pattern against an argument type, binding
/// template parameters. Non-template parts are left to overload resolution.
fn deduce_from(
    pattern: &TypeExpr,
    ty: &Type,
    names: &[String],
    bound: &mut [Option<TemplateValue>],
) -> bool {
    let TypeKind::Path(path) = &pattern.kind else {
        return true;
    };
    let [seg] = path.segments.as_slice() else {
        return true;
    };
    let Some(args) = &seg.args else {
        return bind(names, bound, &seg.ident.name, TemplateValue::Type(ty.clone())).unwrap_or(true);
    };
    let parts: Vec<TemplateValue> = match (seg.ident.name.as_str(), ty) {
        ("span", Type::Span(t, n)) => vec![TemplateValue::Type((**t).clone()), TemplateValue::Int(*n as i64)],
        ("dyn", Type::Dyn(t)) => vec![TemplateValue::Type((**t).clone())],
        ("ProcessData", Type::ProcessData(c)) => vec![TemplateValue::Int(*c as i64)],
        ("PolyData", Type::PolyData(t, n)) => {
            vec![TemplateValue::Type((**t).clone()), TemplateValue::Int(*n as i64)]
        }
        _ => return true,
    };
    for (arg, value) in args.iter().zip(parts) {
        if let Some(name) = bare_name(arg) {
            if bind(names, bound, name, value) == Some(false) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};

    fn check(src: &str) -> Result<crate::thir::TypedProgram, Vec<crate::diag::Diagnostic>> {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        analyze(&program, &AnalyzeOptions::default()).map(|(p, _)| p)
    }

    #[test]
    fn instantiation_is_memoized() {
        let p = check(
            "template <int N> struct X { static const int V = N * 2; };
             int main() { X<5> a; X<5> b; X<3> c; return X<5>::V; }",
        )
        .expect("analysis");
        let names: Vec<&str> = p.structs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["X<5>", "X<3>"]);
    }

    #[test]
    fn default_arguments_complete_the_key() {
        let p = check(
            "template <int N, int M = 4> struct X { int v = N + M; };
             int main() { X<1> a; X<1, 4> b; return a.v + b.v; }",
        )
        .expect("analysis");
        assert_eq!(p.structs.len(), 1);
        assert_eq!(p.structs[0].name, "X<1, 4>");
    }

    #[test]
    fn self_recursive_template_is_rejected() {
        let errors = check(
            "template <int N> struct R { R<N> inner; };
             int main() { R<1> r; return 0; }",
        )
        .expect_err("recursion");
        assert!(errors[0].message.contains("recursive template instantiation"));
        assert!(!errors[0].cause_chain.is_empty());
    }

    #[test]
    fn unbounded_recursion_hits_the_depth_limit() {
        let errors = check(
            "template <int N> struct R { R<N + 1> inner; };
             int main() { R<1> r; return 0; }",
        )
        .expect_err("depth");
        assert!(errors[0].message.contains("depth exceeded"));
    }

    #[test]
    fn non_integer_template_argument() {
        let errors = check(
            "template <int N> struct X { };
             int main() { X<1.5f> x; return 0; }",
        )
        .expect_err("float argument");
        assert_eq!(errors[0].message, "Can't use non-integers as template argument");
    }

    #[test]
    fn function_template_deduces_type_parameters() {
        let p = check(
            "template <typename T> T twice(T v) { return v + v; }
             int main() { float f = twice(1.5f); return twice(2); }",
        )
        .expect("analysis");
        assert!(p.functions.iter().any(|f| f.name == "twice<float>"));
        assert!(p.functions.iter().any(|f| f.name == "twice<int>"));
    }
}
