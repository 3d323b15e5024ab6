// stmt.rs — Statement analysis
//
// Lowers AST statements of one function body into typed statements. Local
// scopes are tracked in `FnCx`; destruction lists are left empty here and
// filled in afterwards by the lifetime pass.
//
// Preconditions: the function's signature is resolved.
// Postconditions: every `Let` introduces a fresh `LocalId`; `for` init
//   statements are hoisted into an enclosing block.
// Failure modes: the first error aborts the body.
// Side effects: may instantiate templates and queue callees.

use crate::ast::{Block, Expr, Initializer, Stmt, StmtKind, TypeKind, VarDecl};
use crate::diag::codes;
use crate::id::{FunctionId, LocalId, ScopeId, StructId};
use crate::sema::{fail, Analyzer, SemaResult};
use crate::thir::{LetInit, LocalInfo, TBlock, TExpr, TInit, TStmt};
use crate::types::{Type, TypeInfo};

// ── Function context ─────────────────────────────────────────────────────

/// Per-body analysis state.
pub(crate) struct FnCx {
    pub func: Option<FunctionId>,
    pub scope: ScopeId,
    /// Struct of `this`, inside methods, constructors and destructors.
    pub this: Option<StructId>,
    pub const_this: bool,
    /// Declared return type; `None` while an `auto` return is deduced.
    pub ret: Option<TypeInfo>,
    pub auto_ref: bool,
    pub deduced: Option<TypeInfo>,
    pub locals: Vec<LocalInfo>,
    blocks: Vec<Vec<(String, LocalId)>>,
    pub loops: usize,
}

impl FnCx {
    /// A context for expressions outside any function body (initializers of
    /// globals and fields, default arguments, constant expressions).
    pub fn detached(scope: ScopeId, this: Option<StructId>) -> Self {
        Self {
            func: None,
            scope,
            this,
            const_this: false,
            ret: None,
            auto_ref: false,
            deduced: None,
            locals: Vec::new(),
            blocks: Vec::new(),
            loops: 0,
        }
    }

    pub fn push_block(&mut self) {
        self.blocks.push(Vec::new());
    }

    pub fn pop_block(&mut self) {
        self.blocks.pop();
    }

    pub fn bind(&mut self, name: &str, id: LocalId) {
        if let Some(b) = self.blocks.last_mut() {
            b.push((name.to_string(), id));
        }
    }

    pub fn declare(&mut self, info: LocalInfo) -> LocalId {
        let id = LocalId::from_index(self.locals.len());
        let name = info.name.clone();
        self.locals.push(info);
        self.bind(&name, id);
        id
    }

    /// Innermost local named `name`.
    pub fn lookup(&self, name: &str) -> Option<LocalId> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|b| b.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    fn declared_here(&self, name: &str) -> bool {
        self.blocks
            .last()
            .is_some_and(|b| b.iter().any(|(n, _)| n == name))
    }

    pub fn local(&self, id: LocalId) -> &LocalInfo {
        &self.locals[id.index()]
    }
}

// ── Statements ───────────────────────────────────────────────────────────

impl Analyzer {
    pub(crate) fn block(&mut self, cx: &mut FnCx, block: &Block) -> SemaResult<TBlock> {
        cx.push_block();
        let result = self.stmts(cx, &block.stmts);
        cx.pop_block();
        Ok(TBlock {
            stmts: result?,
            cleanup: Vec::new(),
            span: block.span,
        })
    }

    fn stmts(&mut self, cx: &mut FnCx, stmts: &[Stmt]) -> SemaResult<Vec<TStmt>> {
        let mut out = Vec::new();
        for s in stmts {
            if let Some(t) = self.stmt(cx, s)? {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// A nested statement gets its own scope.
    fn sub_stmt(&mut self, cx: &mut FnCx, stmt: &Stmt) -> SemaResult<TStmt> {
        if let StmtKind::Block(b) = &stmt.kind {
            return Ok(TStmt::Block(self.block(cx, b)?));
        }
        cx.push_block();
        let result = self.stmt(cx, stmt);
        cx.pop_block();
        Ok(TStmt::Block(TBlock {
            stmts: result?.into_iter().collect(),
            cleanup: Vec::new(),
            span: stmt.span,
        }))
    }

    fn stmt(&mut self, cx: &mut FnCx, stmt: &Stmt) -> SemaResult<Option<TStmt>> {
        Ok(Some(match &stmt.kind {
            StmtKind::Var(v) => self.local_decl(cx, v)?,
            StmtKind::Expr(e) => TStmt::Expr(self.expr(cx, e)?),
            StmtKind::If { cond, then, els } => {
                let cond = self.condition(cx, cond)?;
                let then = Box::new(self.sub_stmt(cx, then)?);
                let els = match els {
                    Some(e) => Some(Box::new(self.sub_stmt(cx, e)?)),
                    None => None,
                };
                TStmt::If { cond, then, els }
            }
            StmtKind::While { cond, body } => {
                let cond = self.condition(cx, cond)?;
                let body = Box::new(self.loop_body(cx, body)?);
                TStmt::While { cond, body }
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                cx.push_block();
                let result = self.for_loop(cx, init.as_deref(), cond.as_ref(), step.as_ref(), body);
                cx.pop_block();
                TStmt::Block(TBlock {
                    stmts: result?,
                    cleanup: Vec::new(),
                    span: stmt.span,
                })
            }
            StmtKind::RangeFor {
                ty,
                name,
                range,
                body,
            } => {
                let range = self.expr(cx, range)?;
                let Some(elem) = self.range_element(&range.ty) else {
                    return fail(
                        codes::E0305,
                        range.span,
                        "Can't iterate over non-blocks",
                    );
                };
                let declared = match &ty.kind {
                    TypeKind::Auto => elem.clone(),
                    _ => self.resolve_type(ty, cx.scope)?.ty,
                };
                if declared != elem {
                    return fail(
                        codes::E0301,
                        ty.span,
                        format!(
                            "Can't implicitely cast {} to {}",
                            self.display(&elem),
                            self.display(&declared)
                        ),
                    );
                }
                cx.push_block();
                let local = cx.declare(LocalInfo {
                    name: name.name.clone(),
                    ty: elem,
                    is_const: ty.is_const || (ty.is_ref && range.is_const),
                    by_ref: ty.is_ref,
                    span: name.span,
                });
                let body = self.loop_body(cx, body);
                cx.pop_block();
                TStmt::RangeFor {
                    local,
                    by_ref: ty.is_ref,
                    range,
                    body: Box::new(body?),
                    cleanup: Vec::new(),
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                if cx.loops == 0 {
                    let what = if matches!(stmt.kind, StmtKind::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    return fail(codes::E0310, stmt.span, format!("{} outside of loop", what));
                }
                if matches!(stmt.kind, StmtKind::Break) {
                    TStmt::Break(Vec::new())
                } else {
                    TStmt::Continue(Vec::new())
                }
            }
            StmtKind::Return(value) => self.return_stmt(cx, value.as_ref(), stmt)?,
            StmtKind::Block(b) => TStmt::Block(self.block(cx, b)?),
            StmtKind::Empty => return Ok(None),
        }))
    }

    fn loop_body(&mut self, cx: &mut FnCx, body: &Stmt) -> SemaResult<TStmt> {
        cx.loops += 1;
        let result = self.sub_stmt(cx, body);
        cx.loops -= 1;
        result
    }

    fn for_loop(
        &mut self,
        cx: &mut FnCx,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> SemaResult<Vec<TStmt>> {
        let mut out = Vec::new();
        if let Some(init) = init {
            if let Some(s) = self.stmt(cx, init)? {
                out.push(s);
            }
        }
        let cond = match cond {
            Some(c) => Some(self.condition(cx, c)?),
            None => None,
        };
        let step = match step {
            Some(s) => Some(self.expr(cx, s)?),
            None => None,
        };
        let body = Box::new(self.loop_body(cx, body)?);
        out.push(TStmt::For { cond, step, body });
        Ok(out)
    }

    fn local_decl(&mut self, cx: &mut FnCx, v: &VarDecl) -> SemaResult<TStmt> {
        if v.is_static {
            return fail(codes::E0310, v.span, "Can't declare static local variables");
        }
        if cx.declared_here(&v.name.name) {
            return fail(
                codes::E0203,
                v.name.span,
                format!("Duplicate symbol {}", v.name.name),
            );
        }

        if v.ty.is_ref {
            let Some(Initializer::Assign(e)) = &v.init else {
                return fail(codes::E0602, v.span, "Can't declare a reference without initialiser");
            };
            let te = self.expr(cx, e)?;
            let declared = match &v.ty.kind {
                TypeKind::Auto => te.ty.clone(),
                _ => self.resolve_type(&v.ty, cx.scope)?.ty,
            };
            let init = self.bind_reference(te, &declared, v.ty.is_const)?;
            let is_const = v.ty.is_const || matches!(&init, LetInit::Ref(t) if t.is_const);
            let local = cx.declare(LocalInfo {
                name: v.name.name.clone(),
                ty: declared,
                is_const,
                by_ref: matches!(init, LetInit::Ref(_)),
                span: v.name.span,
            });
            return Ok(TStmt::Let { local, init });
        }

        let (ty, init) = match &v.ty.kind {
            TypeKind::Auto => {
                let Some(Initializer::Assign(e)) = &v.init else {
                    return fail(codes::E0306, v.ty.span, "Can't deduce auto type");
                };
                let te = self.expr(cx, e)?;
                if te.ty == Type::Void {
                    return fail(codes::E0306, e.span, "Can't deduce auto type");
                }
                (te.ty.clone(), TInit::Expr(te))
            }
            _ => {
                let ty = self.resolve_type(&v.ty, cx.scope)?.ty;
                if ty == Type::Void {
                    return fail(codes::E0306, v.ty.span, "Can't declare void variables");
                }
                self.complete_type(&ty)?;
                let init = self.initializer(cx, &ty, v.init.as_ref(), v.span)?;
                (ty, init)
            }
        };
        let local = cx.declare(LocalInfo {
            name: v.name.name.clone(),
            ty,
            is_const: v.ty.is_const,
            by_ref: false,
            span: v.name.span,
        });
        Ok(TStmt::Let {
            local,
            init: LetInit::Value(init),
        })
    }

    /// Bind a reference of type `ty` to `te`. A const reference to an
    /// rvalue holds a copy.
    fn bind_reference(&mut self, te: TExpr, ty: &Type, is_const: bool) -> SemaResult<LetInit> {
        if !te.lvalue {
            if is_const {
                let converted = self.coerce(te, ty)?;
                return Ok(LetInit::Value(TInit::Expr(converted)));
            }
            return fail(codes::E0602, te.span, "Can't assign non-reference");
        }
        if te.ty != *ty {
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
        if te.is_const && !is_const {
            return fail(codes::E0501, te.span, "Can't modify const object");
        }
        Ok(LetInit::Ref(te))
    }

    fn return_stmt(
        &mut self,
        cx: &mut FnCx,
        value: Option<&Expr>,
        stmt: &Stmt,
    ) -> SemaResult<TStmt> {
        let value = match (cx.ret.clone(), value) {
            (Some(ret), None) => {
                if ret.ty != Type::Void {
                    return fail(codes::E0307, stmt.span, "function must return a value");
                }
                None
            }
            (Some(ret), Some(e)) => {
                if ret.ty == Type::Void {
                    return fail(
                        codes::E0307,
                        e.span,
                        "Can't return a value from a void function.",
                    );
                }
                if ret.is_ref {
                    let te = self.expr(cx, e)?;
                    if !te.lvalue {
                        return fail(codes::E0602, e.span, "Can't assign non-reference");
                    }
                    if te.ty != ret.ty {
                        return fail(
                            codes::E0301,
                            e.span,
                            format!(
                                "Can't implicitely cast {} to {}",
                                self.display(&te.ty),
                                self.display(&ret.ty)
                            ),
                        );
                    }
                    if te.is_const && !ret.is_const {
                        return fail(codes::E0501, e.span, "Can't modify const object");
                    }
                    Some(te)
                } else {
                    Some(self.expr_to(cx, e, &ret.ty)?)
                }
            }
            (None, value) => {
                let te = match value {
                    Some(e) => Some(self.expr(cx, e)?),
                    None => None,
                };
                let info = TypeInfo {
                    ty: te.as_ref().map_or(Type::Void, |t| t.ty.clone()),
                    is_const: te.as_ref().is_some_and(|t| t.is_const && cx.auto_ref),
                    is_ref: cx.auto_ref,
                };
                if cx.auto_ref && te.as_ref().is_some_and(|t| !t.lvalue) {
                    return fail(codes::E0602, stmt.span, "Can't assign non-reference");
                }
                match &cx.deduced {
                    Some(prev) if prev.ty != info.ty => {
                        return fail(codes::E0307, stmt.span, "Ambigous return types");
                    }
                    Some(_) => {}
                    None => cx.deduced = Some(info),
                }
                te
            }
        };
        Ok(TStmt::Return(value, Vec::new()))
    }

    /// A boolean condition: `bool`, or a struct with `operator bool`.
    pub(crate) fn condition(&mut self, cx: &mut FnCx, e: &Expr) -> SemaResult<TExpr> {
        let te = self.expr(cx, e)?;
        self.to_bool(te)
    }
}

// ── Return paths ─────────────────────────────────────────────────────────

/// Whether every path through `block` ends in a `return`.
pub(crate) fn block_returns(block: &TBlock) -> bool {
    block.stmts.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &TStmt) -> bool {
    match stmt {
        TStmt::Return(..) => true,
        TStmt::Block(b) => block_returns(b),
        TStmt::If {
            then,
            els: Some(els),
            ..
        } => stmt_returns(then) && stmt_returns(els),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn span() -> Span {
        (0..1).into()
    }

    #[test]
    fn inner_blocks_shadow_outer_locals() {
        let mut cx = FnCx::detached(crate::symbols::ScopeTable::GLOBAL, None);
        cx.push_block();
        let info = |name: &str| LocalInfo {
            name: name.into(),
            ty: Type::Int,
            is_const: false,
            by_ref: false,
            span: span(),
        };
        let outer = cx.declare(info("x"));
        cx.push_block();
        let inner = cx.declare(info("x"));
        assert_eq!(cx.lookup("x"), Some(inner));
        cx.pop_block();
        assert_eq!(cx.lookup("x"), Some(outer));
        assert!(cx.lookup("y").is_none());
    }

    #[test]
    fn if_without_else_does_not_return() {
        let ret = TStmt::Return(None, Vec::new());
        let cond = TExpr::constant(crate::const_eval::ConstValue::Bool(true), span());
        let only_then = TBlock {
            stmts: vec![TStmt::If {
                cond: cond.clone(),
                then: Box::new(ret.clone()),
                els: None,
            }],
            cleanup: Vec::new(),
            span: span(),
        };
        assert!(!block_returns(&only_then));
        let both = TBlock {
            stmts: vec![TStmt::If {
                cond,
                then: Box::new(ret.clone()),
                els: Some(Box::new(ret)),
            }],
            cleanup: Vec::new(),
            span: span(),
        };
        assert!(block_returns(&both));
    }
}
