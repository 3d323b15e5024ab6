// lifetime.rs — Destruction lists for every exit edge
//
// Runs once per analyzed body. Each block gets the locals it owns in reverse
// declaration order; `break`/`continue` unwind the scopes opened inside the
// innermost loop; `return` unwinds everything. By-value parameters are
// destroyed when the call ends. Temporaries are not tracked.
//
// Preconditions: the body is fully typed and struct layouts are complete.
// Postconditions: a local appears in exactly the cleanup lists of the exit
//   edges that leave its scope.
// Failure modes: none.
// Side effects: none.

use crate::id::LocalId;
use crate::thir::{Cleanup, LetInit, LocalInfo, ParamInfo, TBlock, TStmt, TypedProgram};

/// Fill the cleanup lists of `body`.
pub(crate) fn synthesize(prog: &TypedProgram, locals: &[LocalInfo], body: &mut TBlock) {
    let mut w = Walker {
        prog,
        locals,
        scopes: Vec::new(),
        loops: Vec::new(),
    };
    w.block(body);
}

/// By-value parameters that need destruction, in destruction order.
pub(crate) fn exit_cleanup(
    prog: &TypedProgram,
    params: &[ParamInfo],
    locals: &[LocalInfo],
) -> Cleanup {
    params
        .iter()
        .rev()
        .map(|p| p.local)
        .filter(|id| owns(prog, locals, *id))
        .collect()
}

fn owns(prog: &TypedProgram, locals: &[LocalInfo], id: LocalId) -> bool {
    let l = &locals[id.index()];
    !l.by_ref && prog.needs_drop(&l.ty)
}

struct Walker<'a> {
    prog: &'a TypedProgram,
    locals: &'a [LocalInfo],
    /// Owned locals of each open scope, in declaration order.
    scopes: Vec<Vec<LocalId>>,
    /// Scope depth at the entry of each enclosing loop body.
    loops: Vec<usize>,
}

impl Walker<'_> {
    fn block(&mut self, b: &mut TBlock) {
        self.scopes.push(Vec::new());
        for s in &mut b.stmts {
            self.stmt(s);
        }
        let owned = self.scopes.pop().unwrap_or_default();
        b.cleanup = owned.into_iter().rev().collect();
    }

    fn stmt(&mut self, s: &mut TStmt) {
        match s {
            TStmt::Let { local, init } => {
                if matches!(init, LetInit::Value(_)) && owns(self.prog, self.locals, *local) {
                    if let Some(top) = self.scopes.last_mut() {
                        top.push(*local);
                    }
                }
            }
            TStmt::Expr(_) => {}
            TStmt::If { then, els, .. } => {
                self.stmt(then);
                if let Some(e) = els {
                    self.stmt(e);
                }
            }
            TStmt::While { body, .. } | TStmt::For { body, .. } => {
                self.loops.push(self.scopes.len());
                self.stmt(body);
                self.loops.pop();
            }
            TStmt::RangeFor {
                local,
                body,
                cleanup,
                ..
            } => {
                *cleanup = if owns(self.prog, self.locals, *local) {
                    vec![*local]
                } else {
                    Vec::new()
                };
                // The loop variable is destroyed by the iteration itself, so
                // break and continue unwind only the body.
                self.scopes.push(cleanup.clone());
                self.loops.push(self.scopes.len());
                self.stmt(body);
                self.loops.pop();
                self.scopes.pop();
            }
            TStmt::Break(c) | TStmt::Continue(c) => {
                let from = self.loops.last().copied().unwrap_or(0);
                *c = self.unwind(from);
            }
            TStmt::Return(_, c) => *c = self.unwind(0),
            TStmt::Block(b) => self.block(b),
        }
    }

    fn unwind(&self, from: usize) -> Cleanup {
        self.scopes[from.min(self.scopes.len())..]
            .iter()
            .rev()
            .flat_map(|s| s.iter().rev().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::sema::{analyze, AnalyzeOptions};
    use crate::thir::{FunctionInfo, TStmt, TypedProgram};

    const TRACKED: &str = "
        struct D { ~D() { } int id = 0; };";

    fn program(body: &str) -> TypedProgram {
        let src = format!("{} {}", TRACKED, body);
        let parsed = crate::parser::parse(&src);
        let program = parsed.program.expect("parse failed");
        analyze(&program, &AnalyzeOptions::default())
            .expect("analysis")
            .0
    }

    fn main_fn(p: &TypedProgram) -> &FunctionInfo {
        p.functions.iter().find(|f| f.name == "main").expect("main")
    }

    fn names(f: &FunctionInfo, ids: &[crate::id::LocalId]) -> Vec<String> {
        ids.iter().map(|id| f.locals[id.index()].name.clone()).collect()
    }

    #[test]
    fn block_end_destroys_in_reverse_order() {
        let p = program("int main() { D a; int x = 1; D b; { D c; } return x; }");
        let f = main_fn(&p);
        let body = f.body.as_ref().expect("body");
        let TStmt::Block(inner) = &body.stmts[3] else {
            panic!("expected inner block");
        };
        assert_eq!(names(f, &inner.cleanup), ["c"]);
        let TStmt::Return(_, c) = &body.stmts[4] else {
            panic!("expected return");
        };
        assert_eq!(names(f, c), ["b", "a"]);
    }

    #[test]
    fn break_unwinds_only_the_loop() {
        let p = program(
            "int main() { D outer; while (true) { D inner; if (true) { D deeper; break; } } return 0; }",
        );
        let f = main_fn(&p);
        let mut found = None;
        visit(&f.body.as_ref().expect("body").stmts, &mut |s| {
            if let TStmt::Break(c) = s {
                found = Some(c.clone());
            }
        });
        assert_eq!(names(f, &found.expect("break")), ["deeper", "inner"]);
    }

    #[test]
    fn references_are_not_destroyed() {
        let p = program("int main() { D a; D& r = a; return 0; }");
        let f = main_fn(&p);
        let TStmt::Return(_, c) = &f.body.as_ref().expect("body").stmts[2] else {
            panic!("expected return");
        };
        assert_eq!(names(f, c), ["a"]);
    }

    #[test]
    fn by_value_parameters_die_on_exit() {
        let p = program("int use(D d, D& r) { return d.id; } int main() { D a; return use(a, a); }");
        let f = p.functions.iter().find(|f| f.name == "use").expect("use");
        assert_eq!(names(f, &f.exit_cleanup), ["d"]);
    }

    fn visit(stmts: &[TStmt], f: &mut dyn FnMut(&TStmt)) {
        for s in stmts {
            f(s);
            match s {
                TStmt::If { then, els, .. } => {
                    visit(std::slice::from_ref(then), f);
                    if let Some(e) = els {
                        visit(std::slice::from_ref(e), f);
                    }
                }
                TStmt::While { body, .. }
                | TStmt::For { body, .. }
                | TStmt::RangeFor { body, .. } => visit(std::slice::from_ref(body), f),
                TStmt::Block(b) => visit(&b.stmts, f),
                _ => {}
            }
        }
    }
}
