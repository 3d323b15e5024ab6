// expr.rs — Expression analysis
//
// Types every expression, folds constants, inserts explicit conversions and
// desugars operators on user structs into method calls. Overload resolution
// ranks candidates by the number of implicit conversions they need; equal
// best ranks are an ambiguity.
//
// Preconditions: called with the function context of the enclosing body.
// Postconditions: the result type is fully resolved; constant operands are
//   folded to `Const` nodes.
// Failure modes: the first error in an expression aborts it.
// Side effects: may instantiate templates and queue callees.

use dspl_runtime::index::Policy;

use crate::ast::{BinOp, Expr, ExprKind, Ident, Path, PostOp, Span, TemplateArg, UnOp};
use crate::const_eval::{ConstValue, ScalarError};
use crate::diag::{codes, Diagnostic};
use crate::id::{EnumId, FunctionId, GlobalId, StructId, TemplateId};
use crate::sema::{fail, prim_type, Analyzer, Resolved, SemaResult};
use crate::stmt::FnCx;
use crate::symbols::{Builtin, Lookup, Symbol};
use crate::thir::{Access, BuiltinOp, FnKind, MathFn, TArg, TExpr, TExprKind};
use crate::types::{implicit_cost, unify_numeric, IndexType, TemplateValue, Type};

/// Overload candidates of one call.
#[derive(Debug, Clone, Default)]
pub(crate) struct Candidates {
    pub ids: Vec<FunctionId>,
    pub templates: Vec<TemplateId>,
    pub explicit: Option<Vec<TemplateValue>>,
}

fn texpr(kind: TExprKind, ty: Type, lvalue: bool, is_const: bool, span: Span) -> TExpr {
    TExpr {
        kind,
        ty,
        lvalue,
        is_const,
        span,
    }
}

fn enum_const(e: EnumId, v: i32, span: Span) -> TExpr {
    texpr(
        TExprKind::Const(ConstValue::Int(v)),
        Type::Enum(e),
        false,
        true,
        span,
    )
}

impl Analyzer {
    pub(crate) fn expr(&mut self, cx: &mut FnCx, e: &Expr) -> SemaResult<TExpr> {
        let span = e.span;
        match &e.kind {
            ExprKind::Int(v) => match i32::try_from(*v) {
                Ok(i) => Ok(TExpr::constant(ConstValue::Int(i), span)),
                Err(_) => fail(codes::E0309, span, "integer literal out of range"),
            },
            ExprKind::Float(v) => Ok(TExpr::constant(ConstValue::Float(*v as f32), span)),
            ExprKind::Double(v) => Ok(TExpr::constant(ConstValue::Double(*v), span)),
            ExprKind::Bool(b) => Ok(TExpr::constant(ConstValue::Bool(*b), span)),
            ExprKind::Path(p) => self.path_expr(cx, p),
            ExprKind::This => self.this_expr(cx, span),
            ExprKind::Member { object, name, args } => {
                if args.is_some() {
                    return fail(
                        codes::E0310,
                        name.span,
                        format!("{} must be called", name.name),
                    );
                }
                self.member_expr(cx, object, name, span)
            }
            ExprKind::Call { callee, args } => self.call_expr(cx, callee, args, span),
            ExprKind::Index { object, index } => self.index_expr(cx, object, index, span),
            ExprKind::Unary { op, expr } => self.unary_expr(cx, *op, expr, span),
            ExprKind::Postfix { op, expr } => {
                let target = self.expr(cx, expr)?;
                self.incdec(target, *op == PostOp::Inc, false, span)
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary_expr(cx, *op, lhs, rhs, span),
            ExprKind::Assign { op, target, value } => {
                self.assign_expr(cx, *op, target, value, span)
            }
            ExprKind::Ternary { cond, then, els } => self.ternary_expr(cx, cond, then, els, span),
            ExprKind::Cast { to, expr } => {
                let te = self.expr(cx, expr)?;
                self.cast(te, &prim_type(*to), span)
            }
            ExprKind::InitList(_) => fail(codes::E0310, span, "initialiser list not allowed here"),
        }
    }

    /// Analyze `e` where a value of type `ty` is expected. Initializer
    /// lists are only valid in such contexts.
    pub(crate) fn expr_to(&mut self, cx: &mut FnCx, e: &Expr, ty: &Type) -> SemaResult<TExpr> {
        if let ExprKind::InitList(items) = &e.kind {
            let init = self.init_list(cx, ty, items, e.span)?;
            return Ok(TExpr::rvalue(
                TExprKind::Construct(Box::new(init)),
                ty.clone(),
                e.span,
            ));
        }
        let te = self.expr(cx, e)?;
        self.coerce(te, ty)
    }

    pub(crate) fn exprs(&mut self, cx: &mut FnCx, args: &[Expr]) -> SemaResult<Vec<TExpr>> {
        args.iter().map(|a| self.expr(cx, a)).collect()
    }

    // ── Conversions ──────────────────────────────────────────────────────

    /// Implicitly convert `te` to `ty`, folding constants.
    pub(crate) fn coerce(&mut self, te: TExpr, ty: &Type) -> SemaResult<TExpr> {
        if te.ty == *ty {
            return Ok(te);
        }
        let constant = te.const_value();
        if implicit_cost(&te.ty, ty, constant.as_ref(), &self.prog).is_none() {
            return fail(
                codes::E0301,
                te.span,
                format!(
                    "Can't implicitely cast {} to {}",
                    self.display(&te.ty),
                    self.display(ty)
                ),
            );
        }
        if let (Some(ConstValue::Int(v)), Type::Index(it)) = (constant, ty) {
            if v < 0 && it.policy() == (Policy::Wrapped { allow_negative: false }) {
                return fail(
                    codes::E0305,
                    te.span,
                    format!("negative value {} for {}", v, self.display(ty)),
                );
            }
        }
        if let Some(folded) = constant.and_then(|c| c.convert(ty)) {
            return Ok(TExpr::constant(folded, te.span));
        }
        let span = te.span;
        Ok(TExpr::rvalue(
            TExprKind::Convert(Box::new(te)),
            ty.clone(),
            span,
        ))
    }

    /// A value usable as a condition.
    pub(crate) fn to_bool(&mut self, te: TExpr) -> SemaResult<TExpr> {
        if te.ty == Type::Bool {
            return Ok(te);
        }
        if let Type::Struct(sid) = te.ty {
            let span = te.span;
            if let Some(call) = self.struct_operator(te.clone(), sid, "operator bool", Vec::new(), span)? {
                return Ok(call);
            }
        }
        fail(codes::E0301, te.span, "Condition must be boolean expression")
    }

    pub(crate) fn cast(&mut self, te: TExpr, to: &Type, span: Span) -> SemaResult<TExpr> {
        if te.ty == *to {
            return Ok(TExpr { lvalue: false, ..te });
        }
        let scalar = |t: &Type| t.is_numeric() || *t == Type::Bool;
        let allowed = match (&te.ty, to) {
            (f, t) if scalar(f) && scalar(t) => true,
            (Type::Enum(_), t) if t.is_numeric() => true,
            (Type::Index(it), t) if t.is_numeric() => {
                if it.bound() == 0 {
                    return fail(
                        codes::E0305,
                        span,
                        format!("Can't cast {} with dynamic bounds", self.display(&te.ty)),
                    );
                }
                true
            }
            (Type::Struct(sid), Type::Bool) => {
                let sid = *sid;
                if let Some(call) = self.struct_operator(te.clone(), sid, "operator bool", Vec::new(), span)? {
                    return Ok(call);
                }
                false
            }
            _ => false,
        };
        if !allowed {
            return fail(
                codes::E0301,
                span,
                format!(
                    "Can't cast {} to {}",
                    self.display(&te.ty),
                    self.display(to)
                ),
            );
        }
        if let Some(folded) = te.const_value().and_then(|c| c.convert(to)) {
            return Ok(TExpr::constant(folded, span));
        }
        Ok(TExpr::rvalue(TExprKind::Convert(Box::new(te)), to.clone(), span))
    }

    // ── Names ────────────────────────────────────────────────────────────

    fn path_expr(&mut self, cx: &mut FnCx, p: &Path) -> SemaResult<TExpr> {
        let span = p.span;
        if let [seg] = p.segments.as_slice() {
            if seg.args.is_none() {
                if let Some(id) = cx.lookup(&seg.ident.name) {
                    let l = cx.local(id);
                    return Ok(texpr(TExprKind::Local(id), l.ty.clone(), true, l.is_const, span));
                }
            }
        }
        match self.resolve_path(p, cx.scope, cx.scope)? {
            Resolved::Value(c) => Ok(TExpr::constant(c, span)),
            Resolved::EnumValue(e, v) => Ok(enum_const(e, v, span)),
            Resolved::Global(g) => self.global_expr(g, span),
            Resolved::Field(sid, index) => {
                let this = self.this_expr(cx, span)?;
                if this.ty != Type::Struct(sid) {
                    return fail(
                        codes::E0310,
                        span,
                        "Can't use this pointer outside of class method",
                    );
                }
                self.field_access(this, sid, index, span)
            }
            Resolved::Functions { .. } => fail(
                codes::E0310,
                span,
                format!("{} must be called", p.display_name()),
            ),
            _ => fail(
                codes::E0310,
                span,
                format!("{} is not a value", p.display_name()),
            ),
        }
    }

    pub(crate) fn global_expr(&mut self, g: GlobalId, span: Span) -> SemaResult<TExpr> {
        self.global(g)?;
        let info = &self.prog.globals[g.index()];
        if let (true, Some(v)) = (info.is_const, info.value) {
            return Ok(TExpr::constant(v, span));
        }
        Ok(texpr(
            TExprKind::Global(g),
            info.ty.clone(),
            true,
            info.is_const,
            span,
        ))
    }

    fn this_expr(&self, cx: &FnCx, span: Span) -> SemaResult<TExpr> {
        match (cx.this, cx.func) {
            (Some(sid), Some(_)) => Ok(texpr(
                TExprKind::This,
                Type::Struct(sid),
                true,
                cx.const_this,
                span,
            )),
            _ => fail(
                codes::E0310,
                span,
                "Can't use this pointer outside of class method",
            ),
        }
    }

    pub(crate) fn field_access(
        &mut self,
        object: TExpr,
        sid: StructId,
        index: usize,
        span: Span,
    ) -> SemaResult<TExpr> {
        self.complete_struct(sid)?;
        let Some(f) = self.prog.structs[sid.index()].fields.get(index) else {
            return fail(codes::E0201, span, "Can't resolve symbol");
        };
        let ty = f.ty.clone();
        let is_const = object.is_const && !f.is_mutable;
        let lvalue = object.lvalue;
        Ok(texpr(
            TExprKind::Field {
                object: Box::new(object),
                index,
            },
            ty,
            lvalue,
            is_const,
            span,
        ))
    }

    fn member_expr(
        &mut self,
        cx: &mut FnCx,
        object: &Expr,
        name: &Ident,
        span: Span,
    ) -> SemaResult<TExpr> {
        let ob = self.expr(cx, object)?;
        let Type::Struct(sid) = ob.ty else {
            let Some((index, ty)) = self.builtin_field(&ob.ty, &name.name) else {
                return fail(
                    codes::E0201,
                    name.span,
                    format!("Can't resolve symbol {}", name.name),
                );
            };
            let (lvalue, is_const) = (ob.lvalue, ob.is_const);
            return Ok(texpr(
                TExprKind::Field {
                    object: Box::new(ob),
                    index,
                },
                ty,
                lvalue,
                is_const,
                span,
            ));
        };
        let scope = self.struct_scope(sid);
        let entries = match self.scopes.qualified(scope, &name.name) {
            Lookup::Found(e, _) => e.to_vec(),
            _ => {
                return fail(
                    codes::E0201,
                    name.span,
                    format!("Can't resolve symbol {}", name.name),
                )
            }
        };
        for e in &entries {
            self.check_access(e, scope, name, cx.scope)?;
        }
        match entries[0].symbol {
            Symbol::Field(s, i) => self.field_access(ob, s, i, span),
            Symbol::Global(g) => self.global_expr(g, span),
            Symbol::Function(_) | Symbol::FunctionTemplate(_) => fail(
                codes::E0310,
                name.span,
                format!("{} must be called", name.name),
            ),
            _ => fail(
                codes::E0201,
                name.span,
                format!("Can't resolve symbol {}", name.name),
            ),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn call_expr(
        &mut self,
        cx: &mut FnCx,
        callee: &Expr,
        args: &[Expr],
        span: Span,
    ) -> SemaResult<TExpr> {
        match &callee.kind {
            ExprKind::Member {
                object,
                name,
                args: targs,
            } => {
                let ob = self.expr(cx, object)?;
                if let Type::Struct(sid) = ob.ty {
                    return self.method_call(cx, ob, sid, name, targs.as_deref(), args, span);
                }
                self.builtin_method(cx, ob, name, targs.as_deref(), args, span)
            }
            ExprKind::Path(p) => {
                if let [seg] = p.segments.as_slice() {
                    if cx.lookup(&seg.ident.name).is_some() {
                        return fail(
                            codes::E0310,
                            p.span,
                            format!("{} is not a function", seg.ident.name),
                        );
                    }
                }
                match self.resolve_path(p, cx.scope, cx.scope)? {
                    Resolved::Functions {
                        ids,
                        templates,
                        explicit,
                    } => {
                        let values = self.exprs(cx, args)?;
                        let cands = Candidates {
                            ids,
                            templates,
                            explicit,
                        };
                        let object_const = cx.this.is_some() && cx.const_this;
                        let (fid, targs) =
                            self.resolve_call(&cands, values, object_const, &p.display_name(), span)?;
                        let info = &self.prog.functions[fid.index()];
                        let this = match info.kind {
                            FnKind::Method => {
                                let owner = info.owner;
                                let this = self.this_expr(cx, span)?;
                                if owner.map(Type::Struct) != Some(this.ty.clone()) {
                                    return fail(
                                        codes::E0310,
                                        span,
                                        "Can't use this pointer outside of class method",
                                    );
                                }
                                Some(Box::new(this))
                            }
                            FnKind::Ctor | FnKind::Dtor => {
                                return fail(
                                    codes::E0310,
                                    span,
                                    format!("Can't call {} directly", info.name),
                                )
                            }
                            _ => None,
                        };
                        self.call_result(fid, this, targs, span)
                    }
                    Resolved::Type(t) => {
                        self.complete_type(&t)?;
                        let init = self.construct(cx, &t, args, span)?;
                        Ok(TExpr::rvalue(TExprKind::Construct(Box::new(init)), t, span))
                    }
                    Resolved::Builtin(Builtin::Math(f)) => self.math_call(cx, f, args, span),
                    Resolved::Builtin(Builtin::Slice) => self.slice_call(cx, args, span),
                    _ => fail(
                        codes::E0310,
                        p.span,
                        format!("{} is not a function", p.display_name()),
                    ),
                }
            }
            _ => fail(codes::E0310, callee.span, "expression is not callable"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn method_call(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        sid: StructId,
        name: &Ident,
        targs: Option<&[TemplateArg]>,
        args: &[Expr],
        span: Span,
    ) -> SemaResult<TExpr> {
        let scope = self.struct_scope(sid);
        let qualified = format!("{}::{}", self.prog.structs[sid.index()].name, name.name);
        let entries = match self.scopes.qualified(scope, &name.name) {
            Lookup::Found(e, _) => e.to_vec(),
            _ => {
                return fail(
                    codes::E0204,
                    name.span,
                    format!("Can't find function {}", qualified),
                )
            }
        };
        let mut cands = Candidates::default();
        for e in &entries {
            self.check_access(e, scope, name, cx.scope)?;
            match e.symbol {
                Symbol::Function(f) => cands.ids.push(f),
                Symbol::FunctionTemplate(t) => cands.templates.push(t),
                _ => {
                    return fail(
                        codes::E0310,
                        name.span,
                        format!("{} is not a function", qualified),
                    )
                }
            }
        }
        if let Some(targs) = targs {
            cands.explicit = Some(self.template_args(targs, cx.scope)?);
        }
        let values = self.exprs(cx, args)?;
        let (fid, targs) = self.resolve_call(&cands, values, ob.is_const, &qualified, span)?;
        let this = match self.prog.functions[fid.index()].kind {
            FnKind::Static => None,
            _ => Some(Box::new(ob)),
        };
        self.call_result(fid, this, targs, span)
    }

    /// Call a struct operator method if the struct declares one.
    pub(crate) fn struct_operator(
        &mut self,
        ob: TExpr,
        sid: StructId,
        name: &str,
        args: Vec<TExpr>,
        span: Span,
    ) -> SemaResult<Option<TExpr>> {
        let scope = self.struct_scope(sid);
        let Lookup::Found(entries, _) = self.scopes.qualified(scope, name) else {
            return Ok(None);
        };
        let mut cands = Candidates::default();
        for e in entries {
            match e.symbol {
                Symbol::Function(f) => cands.ids.push(f),
                Symbol::FunctionTemplate(t) => cands.templates.push(t),
                _ => {}
            }
        }
        let qualified = format!("{}::{}", self.prog.structs[sid.index()].name, name);
        let (fid, targs) = self.resolve_call(&cands, args, ob.is_const, &qualified, span)?;
        self.call_result(fid, Some(Box::new(ob)), targs, span).map(Some)
    }

    pub(crate) fn call_result(
        &mut self,
        fid: FunctionId,
        this: Option<Box<TExpr>>,
        args: Vec<TArg>,
        span: Span,
    ) -> SemaResult<TExpr> {
        let ret = self.return_type(fid, span)?;
        Ok(texpr(
            TExprKind::Call {
                func: fid,
                this,
                args,
            },
            ret.ty,
            ret.is_ref,
            ret.is_ref && ret.is_const,
            span,
        ))
    }

    /// Pick the cheapest viable overload and bind its arguments.
    pub(crate) fn resolve_call(
        &mut self,
        cands: &Candidates,
        args: Vec<TExpr>,
        object_const: bool,
        name: &str,
        span: Span,
    ) -> SemaResult<(FunctionId, Vec<TArg>)> {
        let mut fids = Vec::new();
        if cands.explicit.is_none() {
            fids.extend(cands.ids.iter().copied());
        }
        let arg_types: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
        for &tid in &cands.templates {
            let explicit = cands.explicit.clone().unwrap_or_default();
            if let Some(values) = self.deduce(tid, &explicit, &arg_types) {
                fids.push(self.instantiate_function(tid, values, span)?);
            }
        }

        let mut best: Option<(u32, Vec<FunctionId>)> = None;
        let mut const_blocked = false;
        for fid in fids {
            self.signature(fid)?;
            let info = &self.prog.functions[fid.index()];
            let required = info.params.iter().filter(|p| p.default.is_none()).count();
            if args.len() > info.params.len() || args.len() < required {
                continue;
            }
            let mut cost = 0;
            let mut viable = true;
            for (arg, param) in args.iter().zip(&info.params) {
                let c = if param.ty.is_ref && !param.ty.is_const {
                    (arg.ty == param.ty.ty).then_some(0)
                } else {
                    implicit_cost(&arg.ty, &param.ty.ty, arg.const_value().as_ref(), &self.prog)
                };
                match c {
                    Some(c) => cost += c,
                    None => {
                        viable = false;
                        break;
                    }
                }
            }
            if !viable {
                continue;
            }
            if object_const && info.kind == FnKind::Method && !info.is_const {
                const_blocked = true;
                continue;
            }
            match &mut best {
                Some((c, list)) if *c == cost => list.push(fid),
                Some((c, _)) if *c < cost => {}
                _ => best = Some((cost, vec![fid])),
            }
        }

        let fid = match best {
            Some((_, list)) if list.len() == 1 => list[0],
            Some(_) => {
                return fail(
                    codes::E0303,
                    span,
                    format!("Ambiguous function call {}", name),
                )
            }
            None if const_blocked => {
                return fail(codes::E0501, span, "Can't modify const object");
            }
            None => {
                return fail(
                    codes::E0304,
                    span,
                    format!("Wrong argument types for function call {}", name),
                )
            }
        };

        let params = self.prog.functions[fid.index()].params.clone();
        let mut bound = Vec::with_capacity(params.len());
        let mut args = args.into_iter();
        for param in &params {
            let Some(arg) = args.next() else {
                if let Some(d) = &param.default {
                    bound.push(TArg {
                        expr: d.clone(),
                        by_ref: false,
                    });
                }
                continue;
            };
            if param.ty.is_ref {
                if !arg.lvalue {
                    if !param.ty.is_const {
                        return Err(Diagnostic::error(
                            codes::E0601,
                            arg.span,
                            "Can't use rvalues for reference parameters",
                        )
                        .with_hint("pass a variable, or take the parameter as const&")
                        .into());
                    }
                    let expr = self.coerce(arg, &param.ty.ty)?;
                    bound.push(TArg {
                        expr,
                        by_ref: false,
                    });
                    continue;
                }
                if arg.ty == param.ty.ty {
                    if arg.is_const && !param.ty.is_const {
                        return fail(codes::E0501, arg.span, "Can't modify const object");
                    }
                    bound.push(TArg {
                        expr: arg,
                        by_ref: true,
                    });
                    continue;
                }
            }
            let expr = self.coerce(arg, &param.ty.ty)?;
            bound.push(TArg {
                expr,
                by_ref: false,
            });
        }
        self.mark_used(fid);
        Ok((fid, bound))
    }

    fn math_call(
        &mut self,
        cx: &mut FnCx,
        f: MathFn,
        args: &[Expr],
        span: Span,
    ) -> SemaResult<TExpr> {
        let values = self.exprs(cx, args)?;
        let wrong = || {
            fail::<TExpr>(
                codes::E0304,
                span,
                format!("Wrong argument types for function call Math::{}", f.name()),
            )
        };
        if values.len() != f.arity() || values.iter().any(|v| !v.ty.is_numeric()) {
            return wrong();
        }
        let mut ty = values[0].ty.clone();
        let mut constant = values[0].const_value();
        for v in &values[1..] {
            let Some(t) = unify_numeric(&ty, constant.as_ref(), &v.ty, v.const_value().as_ref())
            else {
                return wrong();
            };
            constant = constant.filter(|_| t == ty).and(v.const_value().filter(|_| t == v.ty));
            ty = t;
        }
        if ty == Type::Int && !matches!(f, MathFn::Abs | MathFn::Min | MathFn::Max | MathFn::Range | MathFn::Sign) {
            ty = Type::Double;
        }
        let mut coerced = Vec::with_capacity(values.len());
        for v in values {
            coerced.push(self.coerce(v, &ty)?);
        }
        let consts: Option<Vec<f64>> = coerced
            .iter()
            .map(|v| v.const_value().map(|c| c.as_f64()))
            .collect();
        if let Some(c) = consts {
            if let Some(v) = ConstValue::Double(f.apply(&c)).convert(&ty) {
                return Ok(TExpr::constant(v, span));
            }
        }
        Ok(TExpr::rvalue(
            TExprKind::Builtin {
                op: BuiltinOp::Math(f),
                this: None,
                args: coerced
                    .into_iter()
                    .map(|expr| TArg {
                        expr,
                        by_ref: false,
                    })
                    .collect(),
            },
            ty,
            span,
        ))
    }

    fn slice_call(&mut self, cx: &mut FnCx, args: &[Expr], span: Span) -> SemaResult<TExpr> {
        let [src, offset, len] = args else {
            return fail(
                codes::E0304,
                span,
                "Wrong argument types for function call slice",
            );
        };
        let src = self.expr(cx, src)?;
        let Some(elem) = src.ty.element().cloned() else {
            return fail(
                codes::E0304,
                span,
                "Wrong argument types for function call slice",
            );
        };
        if !src.lvalue {
            return fail(codes::E0601, src.span, "Can't use rvalues for reference parameters");
        }
        let offset = self.expr_to(cx, offset, &Type::Int)?;
        let len = self.expr_to(cx, len, &Type::Int)?;
        Ok(TExpr::rvalue(
            TExprKind::Builtin {
                op: BuiltinOp::Slice,
                this: None,
                args: vec![
                    TArg {
                        expr: src,
                        by_ref: true,
                    },
                    TArg {
                        expr: offset,
                        by_ref: false,
                    },
                    TArg {
                        expr: len,
                        by_ref: false,
                    },
                ],
            },
            Type::Dyn(Box::new(elem)),
            span,
        ))
    }

    // ── Subscripts ───────────────────────────────────────────────────────

    fn index_expr(
        &mut self,
        cx: &mut FnCx,
        object: &Expr,
        index: &Expr,
        span: Span,
    ) -> SemaResult<TExpr> {
        let ob = self.expr(cx, object)?;
        match ob.ty.clone() {
            Type::Struct(sid) => {
                let ix = self.expr(cx, index)?;
                match self.struct_operator(ob, sid, "operator[]", vec![ix], span)? {
                    Some(call) => Ok(call),
                    None => fail(codes::E0305, span, "Can't use [] on primitive types"),
                }
            }
            Type::Span(elem, n) => self.subscript(cx, ob, *elem, Some(n), index, span),
            Type::Dyn(elem) => self.subscript(cx, ob, *elem, None, index, span),
            Type::FrameData(c) => self.subscript(cx, ob, Type::Float, Some(c), index, span),
            Type::ProcessData(c) => {
                let ix = self.expr_to(cx, index, &Type::Int)?;
                match ix.const_value() {
                    Some(ConstValue::Int(i)) if i >= 0 && (i as usize) < c => {}
                    Some(_) => return fail(codes::E0305, ix.span, "constant index out of bounds"),
                    None => {
                        return fail(
                            codes::E0305,
                            ix.span,
                            "Can't use non-constant integer as index",
                        )
                    }
                }
                Ok(TExpr::rvalue(
                    TExprKind::Builtin {
                        op: BuiltinOp::ChannelData,
                        this: Some(Box::new(ob)),
                        args: vec![TArg {
                            expr: ix,
                            by_ref: false,
                        }],
                    },
                    Type::block(),
                    span,
                ))
            }
            _ => fail(codes::E0305, span, "Can't use [] on primitive types"),
        }
    }

    fn subscript(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        elem: Type,
        size: Option<usize>,
        index: &Expr,
        span: Span,
    ) -> SemaResult<TExpr> {
        let ix = self.expr(cx, index)?;
        let (lvalue, is_const) = (ob.lvalue, ob.is_const);
        if let Type::Index(it) = &ix.ty {
            if let Some(n) = size {
                if it.bound() > n {
                    return fail(
                        codes::E0305,
                        ix.span,
                        format!("index bound {} exceeds container size {}", it.bound(), n),
                    );
                }
            }
            if it.is_interp() && !elem.is_floating() {
                return fail(
                    codes::E0305,
                    ix.span,
                    format!("Can't interpolate {} elements", self.display(&elem)),
                );
            }
            let access = crate::thir::Access::Index(it.clone());
            let interp = it.is_interp();
            return Ok(texpr(
                TExprKind::Elem {
                    object: Box::new(ob),
                    index: Box::new(ix),
                    access,
                },
                elem,
                lvalue && !interp,
                is_const,
                span,
            ));
        }
        let ix = self.coerce(ix, &Type::Int)?;
        match ix.const_value() {
            Some(ConstValue::Int(i)) => {
                if let Some(n) = size {
                    if i < 0 || i as usize >= n {
                        return fail(codes::E0305, ix.span, "constant index out of bounds");
                    }
                }
            }
            _ => {
                return fail(
                    codes::E0305,
                    ix.span,
                    "Can't use non-constant integer as index",
                )
            }
        }
        Ok(texpr(
            TExprKind::Elem {
                object: Box::new(ob),
                index: Box::new(ix),
                access: Access::Const,
            },
            elem,
            lvalue,
            is_const,
            span,
        ))
    }

    // ── Operators ────────────────────────────────────────────────────────

    fn unary_expr(&mut self, cx: &mut FnCx, op: UnOp, inner: &Expr, span: Span) -> SemaResult<TExpr> {
        match op {
            UnOp::Neg => {
                let te = self.expr(cx, inner)?;
                if !te.ty.is_numeric() {
                    return fail(
                        codes::E0308,
                        span,
                        format!("Can't negate {}", self.display(&te.ty)),
                    );
                }
                if let Some(c) = te.const_value() {
                    if let Ok(v) = c.unary(UnOp::Neg) {
                        return Ok(TExpr::constant(v, span));
                    }
                }
                let ty = te.ty.clone();
                Ok(TExpr::rvalue(
                    TExprKind::Unary {
                        op,
                        expr: Box::new(te),
                    },
                    ty,
                    span,
                ))
            }
            UnOp::Not => {
                let te = self.condition(cx, inner)?;
                if let Some(c) = te.const_value() {
                    if let Ok(v) = c.unary(UnOp::Not) {
                        return Ok(TExpr::constant(v, span));
                    }
                }
                Ok(TExpr::rvalue(
                    TExprKind::Unary {
                        op,
                        expr: Box::new(te),
                    },
                    Type::Bool,
                    span,
                ))
            }
            UnOp::PreInc | UnOp::PreDec => {
                let target = self.expr(cx, inner)?;
                self.incdec(target, op == UnOp::PreInc, true, span)
            }
            UnOp::Deref => {
                if inner.kind != ExprKind::This {
                    return fail(codes::E0308, span, "Can't dereference non-pointer");
                }
                self.this_expr(cx, inner.span)
            }
        }
    }

    fn incdec(&mut self, target: TExpr, inc: bool, prefix: bool, span: Span) -> SemaResult<TExpr> {
        if let Type::Struct(sid) = target.ty {
            let name = if inc { "operator++" } else { "operator--" };
            return match self.struct_operator(target.clone(), sid, name, Vec::new(), span)? {
                Some(call) => Ok(call),
                None => fail(
                    codes::E0308,
                    span,
                    format!("Can't use {} on {}", name, self.display(&target.ty)),
                ),
            };
        }
        if !target.ty.is_numeric() && !matches!(target.ty, Type::Index(_)) {
            return fail(
                codes::E0308,
                span,
                format!("Can't increment {}", self.display(&target.ty)),
            );
        }
        self.check_mutable(&target)?;
        let ty = target.ty.clone();
        Ok(TExpr::rvalue(
            TExprKind::IncDec {
                target: Box::new(target),
                inc,
                prefix,
            },
            ty,
            span,
        ))
    }

    pub(crate) fn check_mutable(&self, target: &TExpr) -> SemaResult<()> {
        if !target.lvalue {
            return fail(codes::E0310, target.span, "Can't assign to target");
        }
        if target.is_const {
            let msg = match target.kind {
                TExprKind::Local(_) | TExprKind::Global(_) => "Can't change constant variable",
                _ => "Can't modify const object",
            };
            return fail(codes::E0501, target.span, msg);
        }
        Ok(())
    }

    fn binary_expr(
        &mut self,
        cx: &mut FnCx,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> SemaResult<TExpr> {
        if op.is_logical() {
            let l = self.condition(cx, lhs)?;
            let r = self.condition(cx, rhs)?;
            return self.fold_binary(op, l, r, Type::Bool, span);
        }
        let l = self.expr(cx, lhs)?;
        if let Type::Struct(sid) = l.ty {
            let r = self.expr(cx, rhs)?;
            let name = format!("operator{}", op.symbol());
            let ty = l.ty.clone();
            return match self.struct_operator(l, sid, &name, vec![r], span)? {
                Some(call) => Ok(call),
                None => fail(
                    codes::E0308,
                    span,
                    format!("Can't use {} on {}", name, self.display(&ty)),
                ),
            };
        }
        let r = self.expr(cx, rhs)?;
        self.arith(op, l, r, span)
    }

    fn arith(&mut self, op: BinOp, l: TExpr, r: TExpr, span: Span) -> SemaResult<TExpr> {
        if let Type::Index(IndexType::Int { .. }) = l.ty {
            if matches!(op, BinOp::Add | BinOp::Sub) {
                let r = self.coerce(r, &Type::Int)?;
                let ty = l.ty.clone();
                return Ok(TExpr::rvalue(
                    TExprKind::Binary {
                        op,
                        lhs: Box::new(l),
                        rhs: Box::new(r),
                    },
                    ty,
                    span,
                ));
            }
        }
        let operands = format!(
            "Can't use operator {} on {} and {}",
            op.symbol(),
            self.display(&l.ty),
            self.display(&r.ty)
        );

        if let (Type::Enum(a), Type::Enum(b)) = (&l.ty, &r.ty) {
            if a == b && matches!(op, BinOp::Eq | BinOp::Ne) {
                return self.fold_binary(op, l, r, Type::Bool, span);
            }
        }
        let l = self.enum_operand(l)?;
        let r = self.enum_operand(r)?;

        if l.ty == Type::Bool && r.ty == Type::Bool && matches!(op, BinOp::Eq | BinOp::Ne) {
            return self.fold_binary(op, l, r, Type::Bool, span);
        }
        if !l.ty.is_numeric() || !r.ty.is_numeric() {
            return fail(codes::E0308, span, operands);
        }
        let Some(ty) = unify_numeric(
            &l.ty,
            l.const_value().as_ref(),
            &r.ty,
            r.const_value().as_ref(),
        ) else {
            return fail(codes::E0308, span, operands);
        };
        let l = self.coerce(l, &ty)?;
        let r = self.coerce(r, &ty)?;
        if matches!(op, BinOp::Div | BinOp::Rem)
            && ty == Type::Int
            && r.const_value() == Some(ConstValue::Int(0))
        {
            return fail(codes::E0309, span, "Division by zero");
        }
        let result = if op.is_comparison() { Type::Bool } else { ty };
        self.fold_binary(op, l, r, result, span)
    }

    /// Plain enums decay to `int`; class enums may not take part in
    /// arithmetic.
    fn enum_operand(&mut self, te: TExpr) -> SemaResult<TExpr> {
        match te.ty {
            Type::Enum(e) if self.prog.enums[e.index()].is_class => fail(
                codes::E0308,
                te.span,
                format!(
                    "Can't use class enum {} in arithmetic",
                    self.prog.enums[e.index()].name
                ),
            ),
            Type::Enum(_) => self.coerce(te, &Type::Int),
            _ => Ok(te),
        }
    }

    fn fold_binary(
        &mut self,
        op: BinOp,
        l: TExpr,
        r: TExpr,
        ty: Type,
        span: Span,
    ) -> SemaResult<TExpr> {
        if let (Some(a), Some(b)) = (l.const_value(), r.const_value()) {
            match ConstValue::binary(op, a, b) {
                Ok(v) => return Ok(TExpr::constant(v, span)),
                Err(ScalarError::DivisionByZero) => {
                    return fail(codes::E0309, span, "Division by zero")
                }
                Err(ScalarError::Unsupported) => {}
            }
        }
        Ok(TExpr::rvalue(
            TExprKind::Binary {
                op,
                lhs: Box::new(l),
                rhs: Box::new(r),
            },
            ty,
            span,
        ))
    }

    fn assign_expr(
        &mut self,
        cx: &mut FnCx,
        op: Option<BinOp>,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> SemaResult<TExpr> {
        let t = self.expr(cx, target)?;
        if let Type::Struct(sid) = t.ty {
            let name = match op {
                None => "operator=".to_string(),
                Some(o) => format!("operator{}=", o.symbol()),
            };
            let v = match (&value.kind, op) {
                (ExprKind::InitList(_), None) => self.expr_to(cx, value, &t.ty)?,
                _ => self.expr(cx, value)?,
            };
            if let Some(call) = self.struct_operator(t.clone(), sid, &name, vec![v.clone()], span)? {
                return Ok(call);
            }
            if op.is_some() {
                return fail(
                    codes::E0308,
                    span,
                    format!("Can't use {} on {}", name, self.display(&t.ty)),
                );
            }
            self.check_mutable(&t)?;
            let v = self.coerce(v, &t.ty)?;
            return Ok(self.assign_node(t, v, span));
        }

        self.check_mutable(&t)?;
        let Some(op) = op else {
            let v = self.expr_to(cx, value, &t.ty)?;
            return Ok(self.assign_node(t, v, span));
        };
        if op.is_comparison() || op.is_logical() {
            return fail(codes::E0308, span, format!("Can't use operator {}=", op.symbol()));
        }
        let v = self.expr(cx, value)?;
        let v = match &t.ty {
            ty if ty.is_numeric() => {
                let v = self.coerce(v, ty)?;
                if matches!(op, BinOp::Div | BinOp::Rem)
                    && *ty == Type::Int
                    && v.const_value() == Some(ConstValue::Int(0))
                {
                    return fail(codes::E0309, span, "Division by zero");
                }
                v
            }
            Type::Index(IndexType::Int { .. }) if matches!(op, BinOp::Add | BinOp::Sub) => {
                self.coerce(v, &Type::Int)?
            }
            Type::Span(..) | Type::Dyn(..) => {
                let base = scalar_base(&t.ty);
                if !base.is_numeric() {
                    return fail(
                        codes::E0308,
                        span,
                        format!("Can't use operator {}= on {}", op.symbol(), self.display(&t.ty)),
                    );
                }
                if v.ty == t.ty || (v.ty.element().is_some() && scalar_base(&v.ty) == base) {
                    v
                } else {
                    self.coerce(v, &base)?
                }
            }
            _ => {
                return fail(
                    codes::E0308,
                    span,
                    format!("Can't use operator {}= on {}", op.symbol(), self.display(&t.ty)),
                )
            }
        };
        let ty = t.ty.clone();
        Ok(TExpr::rvalue(
            TExprKind::Compound {
                op,
                target: Box::new(t),
                value: Box::new(v),
            },
            ty,
            span,
        ))
    }

    fn assign_node(&self, target: TExpr, value: TExpr, span: Span) -> TExpr {
        let ty = target.ty.clone();
        TExpr::rvalue(
            TExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
            span,
        )
    }

    fn ternary_expr(
        &mut self,
        cx: &mut FnCx,
        cond: &Expr,
        then: &Expr,
        els: &Expr,
        span: Span,
    ) -> SemaResult<TExpr> {
        let cond = self.condition(cx, cond)?;
        let a = self.expr(cx, then)?;
        let b = self.expr(cx, els)?;
        let (a, b) = if a.ty == b.ty {
            (a, b)
        } else {
            let ty = unify_numeric(&a.ty, a.const_value().as_ref(), &b.ty, b.const_value().as_ref());
            let Some(ty) = ty else {
                return fail(
                    codes::E0301,
                    span,
                    format!(
                        "Can't implicitely cast {} to {}",
                        self.display(&b.ty),
                        self.display(&a.ty)
                    ),
                );
            };
            (self.coerce(a, &ty)?, self.coerce(b, &ty)?)
        };
        if let Some(c) = cond.const_value() {
            return Ok(if c.is_truthy() { a } else { b });
        }
        let ty = a.ty.clone();
        let lvalue = a.lvalue && b.lvalue;
        let is_const = a.is_const || b.is_const;
        Ok(texpr(
            TExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(a),
                els: Box::new(b),
            },
            ty,
            lvalue,
            is_const,
            span,
        ))
    }
}

/// Innermost element type of nested spans and dyns.
pub(crate) fn scalar_base(ty: &Type) -> Type {
    match ty.element() {
        Some(t) => scalar_base(t),
        None => ty.clone(),
    }
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};
    use crate::thir::{TExprKind, TStmt};

    fn errors(src: &str) -> Vec<String> {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        match analyze(&program, &AnalyzeOptions::default()) {
            Ok(_) => Vec::new(),
            Err(d) => d.into_iter().map(|d| d.message).collect(),
        }
    }

    fn first(src: &str) -> String {
        errors(src).into_iter().next().unwrap_or_default()
    }

    #[test]
    fn constants_fold_through_arithmetic() {
        let parsed = crate::parser::parse("int main() { return 2 * 3 + 1; }");
        let (p, _) = analyze(&parsed.program.expect("parse"), &AnalyzeOptions::default())
            .expect("analysis");
        let body = p.functions[0].body.as_ref().expect("body");
        let TStmt::Return(Some(e), _) = &body.stmts[0] else {
            panic!("expected return");
        };
        assert!(matches!(e.kind, TExprKind::Const(crate::const_eval::ConstValue::Int(7))));
    }

    #[test]
    fn narrowing_is_rejected_for_non_constants() {
        assert_eq!(
            first("int f(double d) { int x = d; return x; }"),
            "Can't implicitely cast double to int"
        );
        assert!(errors("float f() { float x = 2.0; return x; }").is_empty());
    }

    #[test]
    fn constant_division_by_zero() {
        assert_eq!(first("int main() { return 1 / 0; }"), "Division by zero");
    }

    #[test]
    fn overload_picks_the_cheapest_candidate() {
        assert!(errors(
            "int f(int a) { return 1; } int f(double a) { return 2; }
             int main() { return f(1) + f(1.0); }"
        )
        .is_empty());
        assert_eq!(
            first(
                "int f(float a) { return 1; } int f(double a) { return 2; }
                 int main() { return f(1); }"
            ),
            "Ambiguous function call f"
        );
        assert_eq!(
            first("int f(int a) { return a; } int main() { return f(true); }"),
            "Wrong argument types for function call f"
        );
    }

    #[test]
    fn rvalues_do_not_bind_to_reference_parameters() {
        assert_eq!(
            first("void f(int& a) { a = 1; } int main() { f(2); return 0; }"),
            "Can't use rvalues for reference parameters"
        );
        assert!(errors("int f(const int& a) { return a; } int main() { return f(2); }").is_empty());
    }

    #[test]
    fn const_objects_reject_mutation() {
        assert_eq!(
            first(
                "struct X { int v = 0; void set() { v = 1; } };
                 int main() { const X x; x.set(); return 0; }"
            ),
            "Can't modify const object"
        );
        assert_eq!(
            first("struct X { int v = 0; void get() const { v = 2; } };"),
            "Can't modify const object"
        );
        assert!(errors("struct X { mutable int v = 0; void get() const { v = 2; } };").is_empty());
        assert_eq!(
            first("int main() { const int x = 1; x = 2; return x; }"),
            "Can't change constant variable"
        );
    }

    #[test]
    fn class_enums_stay_out_of_arithmetic() {
        assert_eq!(
            first("enum class E { A, B }; int main() { return E::A + 1; }"),
            "Can't use class enum E in arithmetic"
        );
        assert!(errors("enum E { A, B }; int main() { return A + B; }").is_empty());
    }

    #[test]
    fn conditions_must_be_boolean() {
        assert_eq!(
            first("int main() { int x = 1; if (x) { return 1; } return 0; }"),
            "Condition must be boolean expression"
        );
        assert!(errors(
            "struct F { int v = 1; operator bool() const { return v > 0; } };
             int main() { F f; if (f) { return 1; } return 0; }"
        )
        .is_empty());
    }

    #[test]
    fn subscripts_need_index_types_or_constants() {
        assert_eq!(
            first("int main() { span<int, 3> d = {1, 2, 3}; return d[3]; }"),
            "constant index out of bounds"
        );
        assert_eq!(
            first("int main() { span<int, 3> d = {1, 2, 3}; int i = 1; return d[i]; }"),
            "Can't use non-constant integer as index"
        );
        assert_eq!(
            first("int main() { int x = 1; return x[0]; }"),
            "Can't use [] on primitive types"
        );
        assert!(errors(
            "int main() { span<int, 3> d = {1, 2, 3}; index::wrapped<3> i(4); return d[i]; }"
        )
        .is_empty());
    }

    #[test]
    fn interpolated_subscripts_are_rvalues() {
        let msg = first(
            "float main() {
                 span<float, 4> d = {0.0f, 1.0f, 2.0f, 3.0f};
                 index::lerp<index::normalised<float, index::clamped<4>>> i(0.5f);
                 float& r = d[i];
                 return r;
             }",
        );
        assert_eq!(msg, "Can't assign non-reference");
    }

    #[test]
    fn operators_on_structs_become_method_calls() {
        assert!(errors(
            "struct V { int v = 0; V& operator+=(int x) { v += x; return *this; }
                        int operator[](int i) const { return v + i; } };
             int main() { V a; a += 2; return a[1]; }"
        )
        .is_empty());
        assert_eq!(
            first("struct V { int v = 0; }; int main() { V a; a += 2; return 0; }"),
            "Can't use operator+= on V"
        );
    }

    #[test]
    fn math_intrinsics_fold() {
        assert!(errors("double main() { return Math::max(1.0, 2.0) + Math::sin(0.0); }").is_empty());
        assert_eq!(
            first("double main() { return Math::pow(1.0); }"),
            "Wrong argument types for function call Math::pow"
        );
    }
}
