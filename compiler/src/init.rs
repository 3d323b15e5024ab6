// init.rs — Initializer analysis
//
// Turns `T x;`, `T x = e;`, `T x(a, b);` and `T x = { ... };` into typed
// initializers. Structs with constructors always run one; structs without
// take their fields positionally. A single-item list broadcasts over a span,
// except that a span of structs with a user constructor constructs element 0
// from the item and default-constructs the rest.
//
// Preconditions: `ty` is complete.
// Postconditions: the initializer's type equals `ty`.
// Failure modes: arity mismatches, missing constructors, bad conversions.
// Side effects: queues every constructor it selects.

use crate::ast::{Expr, ExprKind, Initializer, Span};
use crate::diag::codes;
use crate::expr::Candidates;
use crate::id::StructId;
use crate::sema::{fail, Analyzer, SemaResult};
use crate::stmt::FnCx;
use crate::thir::{TArg, TInit};
use crate::types::{NodeType, Type};

impl Analyzer {
    pub(crate) fn initializer(
        &mut self,
        cx: &mut FnCx,
        ty: &Type,
        init: Option<&Initializer>,
        span: Span,
    ) -> SemaResult<TInit> {
        match init {
            None => self.default_init(ty, span),
            Some(Initializer::Assign(e)) => self.init_item(cx, ty, e),
            Some(Initializer::Construct(args)) => self.construct(cx, ty, args, span),
            Some(Initializer::List(items, span)) => self.init_list(cx, ty, items, *span),
        }
    }

    /// Default construction: the zero-argument constructor of structs that
    /// declare constructors, field defaults otherwise.
    pub(crate) fn default_init(&mut self, ty: &Type, span: Span) -> SemaResult<TInit> {
        match ty {
            Type::Struct(sid) => {
                self.complete_struct(*sid)?;
                if self.prog.structs[sid.index()].ctors.is_empty() {
                    return Ok(TInit::Default(ty.clone()));
                }
                let (func, args) = self.select_ctor(*sid, Vec::new(), span)?;
                Ok(TInit::Ctor {
                    ty: ty.clone(),
                    func,
                    args,
                })
            }
            Type::Span(elem, _) | Type::PolyData(elem, _) if self.has_ctor(elem) => {
                let item = self.default_init(elem, span)?;
                Ok(TInit::Splat {
                    ty: ty.clone(),
                    item: Box::new(item),
                })
            }
            Type::Node(node) => {
                let init_wrapper = matches!(**node, NodeType::Init { .. });
                let mut items = Vec::new();
                for (i, t) in node.storage().into_iter().enumerate() {
                    // The initialiser of `wrap::init` is built from the node.
                    if init_wrapper && i == 1 {
                        items.push(TInit::Default(t));
                        continue;
                    }
                    items.push(self.default_init(&t, span)?);
                }
                Ok(TInit::List {
                    ty: ty.clone(),
                    items,
                })
            }
            _ => Ok(TInit::Default(ty.clone())),
        }
    }

    /// `T x(args)` or `T(args)`.
    pub(crate) fn construct(
        &mut self,
        cx: &mut FnCx,
        ty: &Type,
        args: &[Expr],
        span: Span,
    ) -> SemaResult<TInit> {
        if args.is_empty() {
            return self.default_init(ty, span);
        }
        if let Type::Struct(sid) = ty {
            self.complete_struct(*sid)?;
            let values = self.exprs(cx, args)?;
            if let [only] = values.as_slice() {
                if only.ty == *ty {
                    return Ok(TInit::Expr(only.clone()));
                }
            }
            if self.prog.structs[sid.index()].ctors.is_empty() {
                return fail(
                    codes::E0304,
                    span,
                    format!("Can't find constructor for {}", self.display(ty)),
                );
            }
            let (func, args) = self.select_ctor(*sid, values, span)?;
            return Ok(TInit::Ctor {
                ty: ty.clone(),
                func,
                args,
            });
        }
        match (ty, args) {
            (_, [one]) if !matches!(ty, Type::Span(..) | Type::Node(_)) => {
                Ok(TInit::Expr(self.expr_to(cx, one, ty)?))
            }
            _ => fail(
                codes::E0304,
                span,
                format!("Can't find constructor for {}", self.display(ty)),
            ),
        }
    }

    /// `T x = { items }`.
    pub(crate) fn init_list(
        &mut self,
        cx: &mut FnCx,
        ty: &Type,
        items: &[Expr],
        span: Span,
    ) -> SemaResult<TInit> {
        if items.is_empty() {
            return self.default_init(ty, span);
        }
        match ty {
            Type::Struct(sid) => {
                self.complete_struct(*sid)?;
                if !self.prog.structs[sid.index()].ctors.is_empty() {
                    return self.construct(cx, ty, items, span);
                }
                let fields: Vec<Type> = self.prog.structs[sid.index()]
                    .fields
                    .iter()
                    .map(|f| f.ty.clone())
                    .collect();
                if items.len() > fields.len() {
                    return self.size_mismatch(fields.len(), items.len(), span);
                }
                let mut out = Vec::with_capacity(items.len());
                for (item, fty) in items.iter().zip(&fields) {
                    out.push(self.init_item(cx, fty, item)?);
                }
                Ok(TInit::List {
                    ty: ty.clone(),
                    items: out,
                })
            }
            Type::Span(elem, n) => {
                if items.len() == *n {
                    let mut out = Vec::with_capacity(*n);
                    for item in items {
                        out.push(self.init_item(cx, elem, item)?);
                    }
                    return Ok(TInit::List {
                        ty: ty.clone(),
                        items: out,
                    });
                }
                if items.len() != 1 {
                    return self.size_mismatch(*n, items.len(), span);
                }
                let first = self.init_item(cx, elem, &items[0])?;
                if !self.has_ctor(elem) {
                    return Ok(TInit::Splat {
                        ty: ty.clone(),
                        item: Box::new(first),
                    });
                }
                let mut out = vec![first];
                for _ in 1..*n {
                    out.push(self.default_init(elem, span)?);
                }
                Ok(TInit::List {
                    ty: ty.clone(),
                    items: out,
                })
            }
            Type::PolyData(elem, _) if items.len() == 1 => {
                let item = self.init_item(cx, elem, &items[0])?;
                Ok(TInit::Splat {
                    ty: ty.clone(),
                    item: Box::new(item),
                })
            }
            Type::Int | Type::Float | Type::Double | Type::Bool | Type::Index(_) | Type::Enum(_) => {
                match items {
                    [one] => Ok(TInit::Expr(self.expr_to(cx, one, ty)?)),
                    _ => self.size_mismatch(1, items.len(), span),
                }
            }
            _ => fail(
                codes::E0301,
                span,
                format!("Can't use initialiser list for {}", self.display(ty)),
            ),
        }
    }

    /// One item of a list, or the right-hand side of `T x = e`.
    fn init_item(&mut self, cx: &mut FnCx, ty: &Type, e: &Expr) -> SemaResult<TInit> {
        if let ExprKind::InitList(items) = &e.kind {
            return self.init_list(cx, ty, items, e.span);
        }
        match ty {
            Type::Struct(_) if self.has_ctor(ty) => {
                let value = self.expr(cx, e)?;
                if value.ty == *ty {
                    return Ok(TInit::Expr(value));
                }
                self.construct(cx, ty, std::slice::from_ref(e), e.span)
            }
            Type::Span(elem, _) => {
                let value = self.expr(cx, e)?;
                if value.ty == *ty {
                    return Ok(TInit::Expr(value));
                }
                // A container source is converted whole, never splatted.
                if matches!(value.ty, Type::Span(..) | Type::Dyn(_)) && value.ty != **elem {
                    return Ok(TInit::Expr(self.coerce(value, ty)?));
                }
                let item = self.init_item(cx, elem, e)?;
                Ok(TInit::Splat {
                    ty: ty.clone(),
                    item: Box::new(item),
                })
            }
            _ => Ok(TInit::Expr(self.expr_to(cx, e, ty)?)),
        }
    }

    fn has_ctor(&self, ty: &Type) -> bool {
        match ty {
            Type::Struct(sid) => !self.prog.structs[sid.index()].ctors.is_empty(),
            _ => false,
        }
    }

    fn select_ctor(
        &mut self,
        sid: StructId,
        args: Vec<crate::thir::TExpr>,
        span: Span,
    ) -> SemaResult<(crate::id::FunctionId, Vec<TArg>)> {
        let cands = Candidates {
            ids: self.prog.structs[sid.index()].ctors.clone(),
            ..Candidates::default()
        };
        let name = self.prog.structs[sid.index()].name.clone();
        match self.resolve_call(&cands, args, false, &name, span) {
            Err(crate::sema::Halt::Report(d)) if d.message.starts_with("Wrong argument types") => {
                fail(codes::E0304, span, format!("Can't find constructor for {}", name))
            }
            other => other,
        }
    }

    fn size_mismatch<T>(&self, expected: usize, actual: usize, span: Span) -> SemaResult<T> {
        fail(
            codes::E0302,
            span,
            format!(
                "initialiser list size mismatch. Expected: {}, Actual: {}",
                expected, actual
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};
    use crate::thir::{LetInit, TInit, TStmt};

    fn analyze_src(src: &str) -> Result<crate::thir::TypedProgram, String> {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        analyze(&program, &AnalyzeOptions::default())
            .map(|(p, _)| p)
            .map_err(|d| d[0].message.clone())
    }

    fn main_lets(p: &crate::thir::TypedProgram) -> Vec<TInit> {
        let f = p
            .functions
            .iter()
            .find(|f| f.name == "main")
            .expect("main");
        f.body
            .as_ref()
            .expect("body")
            .stmts
            .iter()
            .filter_map(|s| match s {
                TStmt::Let {
                    init: LetInit::Value(i),
                    ..
                } => Some(i.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn list_size_must_match_or_broadcast() {
        assert_eq!(
            analyze_src("int main() { span<int, 3> d = {1, 2}; return 0; }").unwrap_err(),
            "initialiser list size mismatch. Expected: 3, Actual: 2"
        );
        let p = analyze_src("int main() { span<int, 3> d = {7}; return d[0]; }").expect("ok");
        assert!(matches!(main_lets(&p)[0], TInit::Splat { .. }));
    }

    #[test]
    fn span_of_another_size_names_both_spans() {
        assert_eq!(
            analyze_src("int main() { span<int, 3> a = {1, 2, 3}; span<int, 4> b = a; return b[0]; }")
                .unwrap_err(),
            "Can't implicitely cast span<int, 3> to span<int, 4>"
        );
        let p = analyze_src(
            "int main() { span<int, 3> a = {1, 2, 3}; span<span<int, 3>, 2> b = a; return b[1][2]; }",
        )
        .expect("ok");
        assert!(matches!(main_lets(&p)[1], TInit::Splat { .. }));
    }

    #[test]
    fn user_constructor_fills_element_zero_only() {
        let p = analyze_src(
            "struct X { X(int a = 9) { value = a * 2; } int value = 0; };
             int main() { span<X, 2> data = {5}; return data[0].value + data[1].value; }",
        )
        .expect("ok");
        let TInit::List { items, .. } = &main_lets(&p)[0] else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], TInit::Ctor { args, .. } if args.len() == 1));
        assert!(matches!(&items[1], TInit::Ctor { args, .. } if args.len() == 1));
    }

    #[test]
    fn aggregates_take_fields_positionally() {
        assert!(analyze_src(
            "struct P { int a = 0; float b = 0.0f; };
             int main() { P p = {1, 2.0f}; return p.a; }"
        )
        .is_ok());
        assert_eq!(
            analyze_src("struct P { int a = 0; }; int main() { P p = {1, 2}; return p.a; }")
                .unwrap_err(),
            "initialiser list size mismatch. Expected: 1, Actual: 2"
        );
    }

    #[test]
    fn missing_constructor_is_reported() {
        assert_eq!(
            analyze_src(
                "struct X { X(int a, int b) { v = a + b; } int v = 0; };
                 int main() { X x; return x.v; }"
            )
            .unwrap_err(),
            "Can't find constructor for X"
        );
    }
}
