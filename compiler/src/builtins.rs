// builtins.rs — Builtin types and their methods
//
// Resolves `span`, `dyn`, index, container, wrapper and parameter templates
// into `Type`s, and types the methods those builtins expose (`size`,
// `referTo`, `get<i>`, `connect<i>`, ...). Node and parameter types are
// validated as they are constructed, so a malformed graph fails where its
// type is written.
//
// Preconditions: template arguments are resolved.
// Postconditions: every constructed node type has passed `check_node`.
// Failure modes: wrong template arguments, unknown methods, bad argument
//   types or value categories.
// Side effects: instantiates node callbacks and queues them.

use crate::ast::{Expr, Ident, Span, TemplateArg};
use crate::const_eval::ConstValue;
use crate::diag::codes;
use crate::sema::{fail, Analyzer, SemaResult};
use crate::stmt::FnCx;
use crate::symbols::{Builtin, IndexKind, ParamKind, WrapKind};
use crate::thir::{BuiltinOp, EventField, EventKind, NodeOp, TArg, TExpr, TExprKind};
use crate::types::{IndexType, NodeType, ParamType, TemplateValue, Type};
use dspl_runtime::index::Policy;

fn builtin_name(b: Builtin) -> String {
    match b {
        Builtin::Span => "span".into(),
        Builtin::Dyn => "dyn".into(),
        Builtin::Block => "block".into(),
        Builtin::Float4 => "float4".into(),
        Builtin::ProcessData => "ProcessData".into(),
        Builtin::PolyData => "PolyData".into(),
        Builtin::HiseEvent => "HiseEvent".into(),
        Builtin::PrepareSpecs => "PrepareSpecs".into(),
        Builtin::ExternalData => "ExternalData".into(),
        Builtin::Slice => "slice".into(),
        Builtin::Index(k) => format!("index::{:?}", k).to_lowercase(),
        Builtin::Container { split } => {
            if split {
                "container::split".into()
            } else {
                "container::chain".into()
            }
        }
        Builtin::Wrap(k) => format!("wrap::{:?}", k).to_lowercase(),
        Builtin::Param(ParamKind::From0To1) => "parameter::from0To1".into(),
        Builtin::Param(k) => format!("parameter::{:?}", k).to_lowercase(),
        Builtin::Identity => "ranges::Identity".into(),
        Builtin::Math(f) => format!("Math::{}", f.name()),
    }
}

/// One builtin method call, for its diagnostics.
struct Site {
    owner: String,
    method: String,
    name_span: Span,
    span: Span,
}

impl Site {
    fn missing<T>(&self) -> SemaResult<T> {
        fail(
            codes::E0204,
            self.name_span,
            format!("Can't find function {}::{}", self.owner, self.method),
        )
    }

    fn wrong<T>(&self) -> SemaResult<T> {
        fail(
            codes::E0304,
            self.span,
            format!(
                "Wrong argument types for function call {}::{}",
                self.owner, self.method
            ),
        )
    }

    fn arity(&self, args: &[Expr], n: usize) -> SemaResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            self.wrong()
        }
    }
}

fn by_value(expr: TExpr) -> TArg {
    TArg {
        expr,
        by_ref: false,
    }
}

fn by_ref(expr: TExpr) -> TArg {
    TArg { expr, by_ref: true }
}

fn call(op: BuiltinOp, this: TExpr, args: Vec<TArg>, ty: Type, span: Span) -> TExpr {
    TExpr::rvalue(
        TExprKind::Builtin {
            op,
            this: Some(Box::new(this)),
            args,
        },
        ty,
        span,
    )
}

/// Like `call`, but the result names storage inside `this`.
fn place(op: BuiltinOp, this: TExpr, args: Vec<TArg>, ty: Type, span: Span) -> TExpr {
    let (lvalue, is_const) = (this.lvalue, this.is_const);
    TExpr {
        lvalue,
        is_const,
        ..call(op, this, args, ty, span)
    }
}

impl Analyzer {
    // ── Types ────────────────────────────────────────────────────────────

    /// A builtin usable without template arguments.
    pub(crate) fn builtin_type_without_args(&self, b: Builtin) -> Option<Type> {
        match b {
            Builtin::Block => Some(Type::block()),
            Builtin::Float4 => Some(Type::float4()),
            Builtin::HiseEvent => Some(Type::Event),
            Builtin::PrepareSpecs => Some(Type::PrepareSpecs),
            Builtin::ExternalData => Some(Type::ExternalData),
            Builtin::Identity => Some(Type::Identity),
            Builtin::Param(ParamKind::Empty) => Some(Type::Param(Box::new(ParamType::Empty))),
            _ => None,
        }
    }

    pub(crate) fn builtin_type(
        &mut self,
        b: Builtin,
        values: Vec<TemplateValue>,
        span: Span,
    ) -> SemaResult<Type> {
        let name = builtin_name(b);
        let bad = || {
            fail::<Type>(
                codes::E0306,
                span,
                format!("wrong template arguments for {}", name),
            )
        };
        use TemplateValue as V;
        let ty = match (b, values.as_slice()) {
            (Builtin::Span, [V::Type(t), V::Int(n)]) if *n > 0 => {
                if *t == Type::Void {
                    return bad();
                }
                Type::Span(Box::new(t.clone()), *n as usize)
            }
            (Builtin::Dyn, [V::Type(t)]) if *t != Type::Void => Type::Dyn(Box::new(t.clone())),
            (Builtin::ProcessData, [V::Int(c)]) if *c > 0 => Type::ProcessData(*c as usize),
            (Builtin::PolyData, [V::Type(t), V::Int(n)]) if *n > 0 => {
                Type::PolyData(Box::new(t.clone()), *n as usize)
            }
            (Builtin::Index(k), _) => match self.index_type(k, &values) {
                Some(it) => Type::Index(it),
                None => return bad(),
            },
            (Builtin::Container { split }, [V::Type(Type::Param(p)), nodes @ ..]) => {
                let mut children = Vec::with_capacity(nodes.len());
                for n in nodes {
                    match n {
                        V::Type(t) => children.push(t.clone()),
                        V::Int(_) => return bad(),
                    }
                }
                self.node_type(
                    NodeType::Chain {
                        split,
                        params: (**p).clone(),
                        nodes: children,
                    },
                    span,
                )?
            }
            (Builtin::Wrap(k), _) => {
                let node = match (k, values.as_slice()) {
                    (WrapKind::Fix, [V::Int(c), V::Type(inner)]) if *c > 0 => NodeType::Fix {
                        channels: *c as usize,
                        inner: inner.clone(),
                    },
                    (WrapKind::Frame, [V::Int(c), V::Type(inner)]) if *c > 0 => NodeType::Frame {
                        channels: *c as usize,
                        inner: inner.clone(),
                    },
                    (WrapKind::Event, [V::Type(inner)]) => NodeType::Event(inner.clone()),
                    (WrapKind::Init, [V::Type(inner), V::Type(init @ Type::Struct(_))]) => {
                        NodeType::Init {
                            inner: inner.clone(),
                            initialiser: init.clone(),
                        }
                    }
                    (WrapKind::Mod, [V::Type(Type::Param(p)), V::Type(inner)]) => NodeType::Mod {
                        param: (**p).clone(),
                        inner: inner.clone(),
                    },
                    (WrapKind::Data, [V::Type(inner), V::Int(slot)]) if *slot >= 0 => {
                        NodeType::Data {
                            inner: inner.clone(),
                            slot: *slot as usize,
                        }
                    }
                    _ => return bad(),
                };
                self.node_type(node, span)?
            }
            (Builtin::Param(k), _) => match self.param_type(k, &values, span)? {
                Some(p) => Type::Param(Box::new(p)),
                None => return bad(),
            },
            (Builtin::Slice, _) | (Builtin::Math(_), _) => {
                return fail(codes::E0306, span, format!("{} is not a type", name))
            }
            (b, []) => match self.builtin_type_without_args(b) {
                Some(t) => t,
                None => return bad(),
            },
            _ => {
                if self.builtin_type_without_args(b).is_some() {
                    return fail(codes::E0306, span, format!("{} is not a template", name));
                }
                return bad();
            }
        };
        self.complete_type(&ty)?;
        Ok(ty)
    }

    fn index_type(&self, k: IndexKind, values: &[TemplateValue]) -> Option<IndexType> {
        use TemplateValue as V;
        let int = |policy: Policy, n: i64| {
            (n >= 0).then_some(IndexType::Int {
                policy,
                bound: n as usize,
            })
        };
        match (k, values) {
            (IndexKind::Unsafe, [V::Int(n)]) => int(Policy::Unsafe, *n),
            (IndexKind::Wrapped, [V::Int(n)]) => int(
                Policy::Wrapped {
                    allow_negative: true,
                },
                *n,
            ),
            (IndexKind::Wrapped, [V::Int(n), V::Int(neg)]) => int(
                Policy::Wrapped {
                    allow_negative: *neg != 0,
                },
                *n,
            ),
            (IndexKind::Clamped, [V::Int(n)]) => int(Policy::Clamped, *n),
            (IndexKind::Looped, [V::Int(n)]) => int(Policy::Looped, *n),
            (
                IndexKind::Normalised | IndexKind::Unscaled,
                [V::Type(prec), V::Type(Type::Index(base @ IndexType::Int { .. }))],
            ) if prec.is_floating() => Some(IndexType::Float {
                normalised: k == IndexKind::Normalised,
                double: *prec == Type::Double,
                base: Box::new(base.clone()),
            }),
            (
                IndexKind::Lerp | IndexKind::Hermite,
                [V::Type(Type::Index(base @ IndexType::Float { .. }))],
            ) => Some(IndexType::Interp {
                hermite: k == IndexKind::Hermite,
                base: Box::new(base.clone()),
            }),
            _ => None,
        }
    }

    fn param_type(
        &mut self,
        k: ParamKind,
        values: &[TemplateValue],
        span: Span,
    ) -> SemaResult<Option<ParamType>> {
        use TemplateValue as V;
        let spec = match (k, values) {
            (ParamKind::Plain, [V::Type(target), V::Int(i)]) if *i >= 0 => ParamType::Plain {
                target: target.clone(),
                index: *i as usize,
            },
            (ParamKind::Expression, [V::Type(target), V::Int(i), V::Type(Type::Struct(e))])
                if *i >= 0 =>
            {
                self.transform(*e, "op", span)?;
                ParamType::Expression {
                    target: target.clone(),
                    index: *i as usize,
                    expr: *e,
                }
            }
            (ParamKind::From0To1, [V::Type(target), V::Int(i), V::Type(range)]) if *i >= 0 => {
                self.range_type(range, span)?;
                ParamType::From0To1 {
                    target: target.clone(),
                    index: *i as usize,
                    range: range.clone(),
                }
            }
            (ParamKind::Chain, [V::Type(range), items @ ..]) => {
                self.range_type(range, span)?;
                let Some(items) = param_items(items) else {
                    return Ok(None);
                };
                ParamType::Chain {
                    range: range.clone(),
                    items,
                }
            }
            (ParamKind::List, items) => {
                let Some(items) = param_items(items) else {
                    return Ok(None);
                };
                ParamType::List(items)
            }
            (ParamKind::Empty, []) => ParamType::Empty,
            _ => return Ok(None),
        };
        if let Some((target, index)) = spec.leaf_target() {
            let target = target.clone();
            self.ensure_set_parameter(&target, index, span)?;
        }
        Ok(Some(spec))
    }

    fn range_type(&mut self, range: &Type, span: Span) -> SemaResult<()> {
        match range {
            Type::Identity => Ok(()),
            Type::Struct(sid) => self.transform(*sid, "from0To1", span),
            other => fail(
                codes::E0306,
                span,
                format!("{} is not a range", self.display(other)),
            ),
        }
    }

    /// Record the static transform function `name` of a range or expression
    /// class.
    fn transform(&mut self, sid: crate::id::StructId, name: &str, span: Span) -> SemaResult<()> {
        let Some(fid) = self.find_method(sid, name) else {
            return fail(
                codes::E0701,
                span,
                format!("missing function {}::{}", self.prog.structs[sid.index()].name, name),
            );
        };
        self.signature(fid)?;
        let f = &self.prog.functions[fid.index()];
        let ok = f.kind == crate::thir::FnKind::Static
            && f.params.len() == 1
            && f.params[0].ty.ty == Type::Double
            && f.ret.ty == Type::Double;
        if !ok {
            return fail(
                codes::E0701,
                span,
                format!("{} must be static double(double)", f.name),
            );
        }
        self.mark_used(fid);
        self.prog.transforms.insert(sid, fid);
        Ok(())
    }

    /// Element type visited by a range-based `for`.
    pub(crate) fn range_element(&self, ty: &Type) -> Option<Type> {
        match ty {
            Type::Span(t, _) | Type::Dyn(t) | Type::PolyData(t, _) => Some((**t).clone()),
            Type::ProcessData(_) => Some(Type::block()),
            _ => None,
        }
    }

    /// Named data members of builtin aggregates.
    pub(crate) fn builtin_field(&self, ty: &Type, name: &str) -> Option<(usize, Type)> {
        match (ty, name) {
            (Type::PrepareSpecs, "sampleRate") => Some((0, Type::Double)),
            (Type::PrepareSpecs, "blockSize") => Some((1, Type::Int)),
            (Type::PrepareSpecs, "numChannels") => Some((2, Type::Int)),
            (Type::ExternalData, "numSamples") => Some((0, Type::Int)),
            (Type::ExternalData, "numChannels") => Some((1, Type::Int)),
            _ => None,
        }
    }

    // ── Methods ──────────────────────────────────────────────────────────

    pub(crate) fn builtin_method(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        name: &Ident,
        targs: Option<&[TemplateArg]>,
        args: &[Expr],
        span: Span,
    ) -> SemaResult<TExpr> {
        let method = name.name.as_str();
        let index = match targs {
            Some(t) => Some(self.method_index(t, cx, span)?),
            None => None,
        };
        let site = Site {
            owner: self.display(&ob.ty),
            method: method.to_string(),
            name_span: name.span,
            span,
        };

        match (ob.ty.clone(), method, index) {
            (Type::Span(_, n), "size", None) => {
                site.arity(args, 0)?;
                Ok(TExpr::constant(ConstValue::Int(n as i32), span))
            }
            (Type::Span(elem, _) | Type::Dyn(elem), "toSimd", None) => {
                site.arity(args, 0)?;
                if *elem != Type::Float {
                    return fail(
                        codes::E0305,
                        span,
                        format!("Can't convert {} to SIMD", site.owner),
                    );
                }
                if !ob.lvalue {
                    return fail(codes::E0601, ob.span, "Can't use rvalues for reference parameters");
                }
                Ok(call(BuiltinOp::ToSimd, ob, Vec::new(), Type::Dyn(Box::new(Type::float4())), span))
            }
            (Type::Dyn(_), "size", None) => {
                site.arity(args, 0)?;
                Ok(call(BuiltinOp::Size, ob, Vec::new(), Type::Int, span))
            }
            (Type::Dyn(_), "isSimdable", None) => {
                site.arity(args, 0)?;
                Ok(call(BuiltinOp::IsSimdable, ob, Vec::new(), Type::Bool, span))
            }
            (Type::Dyn(elem), "referTo", None) => {
                if args.is_empty() || args.len() > 3 {
                    return site.wrong();
                }
                self.check_mutable(&ob)?;
                let src = self.expr(cx, &args[0])?;
                if src.ty.element() != Some(&*elem) {
                    return site.wrong();
                }
                if !src.lvalue {
                    return fail(
                        codes::E0601,
                        src.span,
                        "Can't use rvalues for reference parameters",
                    );
                }
                let mut bound = vec![by_ref(src)];
                for a in &args[1..] {
                    bound.push(by_value(self.expr_to(cx, a, &Type::Int)?));
                }
                Ok(call(BuiltinOp::ReferTo, ob, bound, Type::Void, span))
            }
            (Type::Index(IndexType::Int { policy: Policy::Looped, .. }), "setLoopRange", None) => {
                site.arity(args, 2)?;
                self.check_mutable(&ob)?;
                let lo = self.expr_to(cx, &args[0], &Type::Int)?;
                let hi = self.expr_to(cx, &args[1], &Type::Int)?;
                Ok(call(
                    BuiltinOp::SetLoopRange,
                    ob,
                    vec![by_value(lo), by_value(hi)],
                    Type::Void,
                    span,
                ))
            }
            (Type::ProcessData(c), "getNumChannels", None) => {
                site.arity(args, 0)?;
                Ok(TExpr::constant(ConstValue::Int(c as i32), span))
            }
            (Type::ProcessData(_), "getNumSamples", None) => {
                site.arity(args, 0)?;
                Ok(call(BuiltinOp::NumSamples, ob, Vec::new(), Type::Int, span))
            }
            (Type::ProcessData(c), "toFrameData", None) => {
                site.arity(args, 0)?;
                Ok(call(BuiltinOp::FrameData, ob, Vec::new(), Type::FrameData(c), span))
            }
            (Type::ProcessData(_), "toEventData", None) => {
                site.arity(args, 0)?;
                Ok(call(BuiltinOp::EventData, ob, Vec::new(), Type::Dyn(Box::new(Type::Event)), span))
            }
            (Type::FrameData(_), "next", None) => {
                site.arity(args, 0)?;
                self.check_mutable(&ob)?;
                Ok(call(BuiltinOp::FrameNext, ob, Vec::new(), Type::Bool, span))
            }
            (Type::FrameData(c), "toSpan", None) => {
                site.arity(args, 0)?;
                Ok(place(
                    BuiltinOp::FrameSpan,
                    ob,
                    Vec::new(),
                    Type::Span(Box::new(Type::Float), c),
                    span,
                ))
            }
            (Type::Event, m, None) => self.event_method(cx, ob, m, args, span, &site),
            (Type::ExternalData, "referBlockTo", None) => {
                site.arity(args, 2)?;
                let target = self.expr(cx, &args[0])?;
                if target.ty != Type::block() {
                    return site.wrong();
                }
                self.check_mutable(&target)?;
                let channel = self.expr_to(cx, &args[1], &Type::Int)?;
                Ok(call(
                    BuiltinOp::ReferBlockTo,
                    ob,
                    vec![by_ref(target), by_value(channel)],
                    Type::Void,
                    span,
                ))
            }
            (Type::PolyData(elem, _), "get", None) => {
                site.arity(args, 0)?;
                Ok(place(BuiltinOp::PolyGet, ob, Vec::new(), *elem, span))
            }
            (Type::Node(node), m, index) => {
                self.node_method(cx, ob, &node, m, index, args, span, &site)
            }
            (Type::Param(spec), m, index) => {
                self.param_method(cx, ob, &spec, m, index, args, span, &site)
            }
            _ => site.missing(),
        }
    }

    /// The single compile-time integer of `get<i>`, `connect<i>`, ...
    fn method_index(&mut self, targs: &[TemplateArg], cx: &FnCx, span: Span) -> SemaResult<usize> {
        let values = self.template_args(targs, cx.scope)?;
        match values.as_slice() {
            [TemplateValue::Int(i)] if *i >= 0 => Ok(*i as usize),
            _ => fail(
                codes::E0306,
                span,
                "Can't use non-integers as template argument",
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn event_method(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        method: &str,
        args: &[Expr],
        span: Span,
        site: &Site,
    ) -> SemaResult<TExpr> {
        let field = |name: &str| match name {
            "NoteNumber" => Some(EventField::NoteNumber),
            "Velocity" => Some(EventField::Velocity),
            "Channel" => Some(EventField::Channel),
            "TimeStamp" => Some(EventField::TimeStamp),
            "ControllerNumber" => Some(EventField::ControllerNumber),
            "ControllerValue" => Some(EventField::ControllerValue),
            _ => None,
        };
        if let Some(f) = method.strip_prefix("get").and_then(field) {
            site.arity(args, 0)?;
            return Ok(call(BuiltinOp::EventGet(f), ob, Vec::new(), Type::Int, span));
        }
        if let Some(f) = method.strip_prefix("set").and_then(field) {
            site.arity(args, 1)?;
            self.check_mutable(&ob)?;
            let v = self.expr_to(cx, &args[0], &Type::Int)?;
            return Ok(call(BuiltinOp::EventSet(f), ob, vec![by_value(v)], Type::Void, span));
        }
        let kind = match method {
            "isNoteOn" => EventKind::NoteOn,
            "isNoteOff" => EventKind::NoteOff,
            "isController" => EventKind::Controller,
            _ => return site.missing(),
        };
        site.arity(args, 0)?;
        Ok(call(BuiltinOp::EventIs(kind), ob, Vec::new(), Type::Bool, span))
    }

    #[allow(clippy::too_many_arguments)]
    fn node_method(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        node: &NodeType,
        method: &str,
        index: Option<usize>,
        args: &[Expr],
        span: Span,
        site: &Site,
    ) -> SemaResult<TExpr> {
        let node_op = |op| BuiltinOp::Node(op);
        match (method, index) {
            ("get", Some(i)) => {
                site.arity(args, 0)?;
                let NodeType::Chain { nodes, .. } = node else {
                    return site.missing();
                };
                let Some(child) = nodes.get(i) else {
                    return fail(
                        codes::E0704,
                        span,
                        format!("{}: no child at index {}", self.display(&ob.ty), i),
                    );
                };
                Ok(place(BuiltinOp::Get(i), ob, Vec::new(), child.clone(), span))
            }
            ("getObject", None) => {
                site.arity(args, 0)?;
                let Some((inner, _)) = node.inner() else {
                    return site.missing();
                };
                let inner = inner.clone();
                Ok(place(BuiltinOp::GetObject, ob, Vec::new(), inner, span))
            }
            ("getWrappedObject", None) => {
                site.arity(args, 0)?;
                let mut current = match node.inner() {
                    Some((inner, _)) => inner.clone(),
                    None => return site.missing(),
                };
                while let Type::Node(n) = &current {
                    match n.inner() {
                        Some((inner, _)) => current = inner.clone(),
                        None => break,
                    }
                }
                Ok(place(BuiltinOp::GetWrappedObject, ob, Vec::new(), current, span))
            }
            ("getParameter", index) => {
                site.arity(args, 0)?;
                let spec = match (node, index) {
                    (NodeType::Chain { params, .. }, Some(i)) => params.slot(i),
                    (NodeType::Mod { param, .. }, None) => Some(param),
                    _ => return site.missing(),
                };
                let Some(spec) = spec else {
                    return fail(
                        codes::E0704,
                        span,
                        format!(
                            "{}: no parameter at index {}",
                            self.display(&ob.ty),
                            index.unwrap_or(0)
                        ),
                    );
                };
                let ty = Type::Param(Box::new(spec.clone()));
                Ok(place(BuiltinOp::GetParameter(index), ob, Vec::new(), ty, span))
            }
            ("reset", None) => {
                site.arity(args, 0)?;
                self.check_mutable(&ob)?;
                Ok(call(node_op(NodeOp::Reset), ob, Vec::new(), Type::Void, span))
            }
            ("prepare", None) => {
                site.arity(args, 1)?;
                self.check_mutable(&ob)?;
                let specs = self.expr_to(cx, &args[0], &Type::PrepareSpecs)?;
                Ok(call(node_op(NodeOp::Prepare), ob, vec![by_value(specs)], Type::Void, span))
            }
            ("handleHiseEvent", None) => {
                site.arity(args, 1)?;
                self.check_mutable(&ob)?;
                let e = self.expr(cx, &args[0])?;
                if e.ty != Type::Event || !e.lvalue {
                    return site.wrong();
                }
                Ok(call(node_op(NodeOp::HandleEvent), ob, vec![by_ref(e)], Type::Void, span))
            }
            ("process", None) | ("processFrame", None) => {
                site.arity(args, 1)?;
                self.check_mutable(&ob)?;
                let data = self.expr(cx, &args[0])?;
                let frame = method == "processFrame";
                let channels = match (&data.ty, frame) {
                    (Type::ProcessData(c), false) => *c,
                    (Type::Span(t, c), true) if **t == Type::Float => *c,
                    _ => return site.wrong(),
                };
                if !data.lvalue {
                    return fail(
                        codes::E0601,
                        data.span,
                        "Can't use rvalues for reference parameters",
                    );
                }
                let ty = ob.ty.clone();
                self.bind_node(&ty, channels, frame, span)?;
                let op = if frame {
                    NodeOp::ProcessFrame
                } else {
                    NodeOp::Process
                };
                Ok(call(node_op(op), ob, vec![by_ref(data)], Type::Void, span))
            }
            ("setParameter", Some(p)) => {
                site.arity(args, 1)?;
                self.check_mutable(&ob)?;
                let ty = ob.ty.clone();
                self.ensure_set_parameter(&ty, p, span)?;
                let v = self.expr_to(cx, &args[0], &Type::Double)?;
                Ok(call(
                    node_op(NodeOp::SetParameter(p)),
                    ob,
                    vec![by_value(v)],
                    Type::Void,
                    span,
                ))
            }
            _ => site.missing(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn param_method(
        &mut self,
        cx: &mut FnCx,
        ob: TExpr,
        spec: &ParamType,
        method: &str,
        index: Option<usize>,
        args: &[Expr],
        span: Span,
        site: &Site,
    ) -> SemaResult<TExpr> {
        match (method, index) {
            ("connect", Some(i)) => {
                site.arity(args, 1)?;
                self.check_mutable(&ob)?;
                let Some((target, _)) = spec.leaf(i).and_then(|(_, leaf)| leaf.leaf_target()) else {
                    return fail(
                        codes::E0704,
                        span,
                        format!("{}: no connection at index {}", self.display(&ob.ty), i),
                    );
                };
                let target = target.clone();
                let node = self.expr(cx, &args[0])?;
                if node.ty != target {
                    return fail(
                        codes::E0301,
                        node.span,
                        format!(
                            "Can't connect {} to {}",
                            self.display(&node.ty),
                            self.display(&target)
                        ),
                    );
                }
                self.check_mutable(&node)?;
                Ok(call(BuiltinOp::Connect(i), ob, vec![by_ref(node)], Type::Void, span))
            }
            ("call", index) => {
                site.arity(args, 1)?;
                let ok = match (spec, index) {
                    (ParamType::List(items), Some(i)) => i < items.len(),
                    (ParamType::List(_), None) => false,
                    (_, None) => true,
                    (_, Some(i)) => i < spec.slots(),
                };
                if !ok {
                    return fail(
                        codes::E0704,
                        span,
                        format!(
                            "{}: no parameter at index {}",
                            self.display(&ob.ty),
                            index.unwrap_or(0)
                        ),
                    );
                }
                let v = self.expr_to(cx, &args[0], &Type::Double)?;
                let index = match spec {
                    ParamType::List(_) => index,
                    _ => None,
                };
                Ok(call(BuiltinOp::ParamCall(index), ob, vec![by_value(v)], Type::Void, span))
            }
            _ => site.missing(),
        }
    }
}

fn param_items(values: &[TemplateValue]) -> Option<Vec<ParamType>> {
    values
        .iter()
        .map(|v| match v {
            TemplateValue::Type(Type::Param(p)) => Some((**p).clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};

    fn first(src: &str) -> String {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        match analyze(&program, &AnalyzeOptions::default()) {
            Ok(_) => String::new(),
            Err(d) => d[0].message.clone(),
        }
    }

    #[test]
    fn builtin_template_arguments_are_checked() {
        assert_eq!(first("int main() { span<int, 0> s; return 0; }"), "wrong template arguments for span");
        assert_eq!(first("int main() { dyn<int, 2> s; return 0; }"), "wrong template arguments for dyn");
        assert_eq!(
            first("int main() { index::lerp<index::wrapped<4>> i; return 0; }"),
            "wrong template arguments for index::lerp"
        );
    }

    #[test]
    fn span_size_is_a_constant() {
        assert_eq!(first("int main() { span<int, 4> s; return s.size(); }"), "");
    }

    #[test]
    fn refer_to_needs_a_matching_lvalue() {
        assert_eq!(
            first("int main() { span<float, 4> s; dyn<float> d; d.referTo(s, 2, 1); return d.size(); }"),
            ""
        );
        assert_eq!(
            first("int main() { span<int, 4> s; dyn<float> d; d.referTo(s); return 0; }"),
            "Wrong argument types for function call dyn<float>::referTo"
        );
    }

    #[test]
    fn loop_range_only_on_looped_indices() {
        assert_eq!(
            first("int main() { index::looped<8> i; i.setLoopRange(2, 6); return 0; }"),
            ""
        );
        assert_eq!(
            first("int main() { index::wrapped<8> i; i.setLoopRange(2, 6); return 0; }"),
            "Can't find function index::wrapped<8>::setLoopRange"
        );
    }

    #[test]
    fn unknown_methods_name_the_type() {
        assert_eq!(
            first("int main() { span<int, 2> s; s.clear(); return 0; }"),
            "Can't find function span<int, 2>::clear"
        );
    }
}
