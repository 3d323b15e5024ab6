// parser.rs — Parser for dspl source files
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators with declared recursion for the type/expression grammar.
//
// Template argument lists in expressions are only accepted where they are
// followed by `(` or `::`, so `a < b` stays a comparison. A statement is
// tried as a declaration (`Type name ...`) before it is tried as an
// expression.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors.
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use std::rc::Rc;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::recursive::{Indirect, Recursive};
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

type Err<'t> = extra::Err<Rich<'t, Token, SimpleSpan>>;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a dspl source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program: if all_errors.is_empty() { program } else { None },
        errors: all_errors,
    }
}

// ── Helper types ──

#[derive(Debug, Clone)]
enum Postfix {
    Call(Vec<Expr>),
    Index(Expr),
    Member(Ident, Option<Vec<TemplateArg>>),
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy)]
enum Prefix {
    Op(UnOp),
    Cast(Prim),
}

#[derive(Debug, Clone)]
enum MemberEntry {
    Label(Visibility),
    Member(MemberKind, Span),
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = join(lhs.span, rhs.span);
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, Err<'tokens>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let mut ty = Recursive::<Indirect<'tokens, 'tokens, I, TypeExpr, Err<'tokens>>>::declare();
    let mut expr = Recursive::<Indirect<'tokens, 'tokens, I, Expr, Err<'tokens>>>::declare();

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let prim = select! {
        Token::Void => Prim::Void,
        Token::Int => Prim::Int,
        Token::Float => Prim::Float,
        Token::Double => Prim::Double,
        Token::Bool => Prim::Bool,
    };

    // ── Literals ──

    let literal = select! {
        Token::IntLit(v) => ExprKind::Int(v),
        Token::FloatLit(v) => ExprKind::Float(v),
        Token::DoubleLit(v) => ExprKind::Double(v),
        Token::True => ExprKind::Bool(true),
        Token::False => ExprKind::Bool(false),
    }
    .map_with(|kind, e| Expr {
        kind,
        span: e.span(),
    });

    // ── Paths ──

    let plain_path = ident
        .clone()
        .map(|ident| PathSegment { ident, args: None })
        .separated_by(just(Token::ColonColon))
        .at_least(1)
        .collect::<Vec<_>>()
        .map_with(|segments, e| Path {
            segments,
            span: e.span(),
        })
        .boxed();

    // ── Template arguments ──
    //
    // A type (or a bare path, which may name a constant) directly followed by
    // `,` or `>` is taken as written; anything else is a small constant
    // expression over literals and paths.

    let targ_atom = choice((
        literal.clone(),
        plain_path.clone().map_with(|p, e| Expr {
            kind: ExprKind::Path(p),
            span: e.span(),
        }),
    ));

    let targ_unary = just(Token::Minus)
        .map_with(|_, e| e.span())
        .repeated()
        .foldr(targ_atom, |span: Span, rhs: Expr| {
            let span = join(span, rhs.span);
            Expr {
                kind: ExprKind::Unary {
                    op: UnOp::Neg,
                    expr: Box::new(rhs),
                },
                span,
            }
        });

    let targ_product = targ_unary.clone().foldl(
        choice((
            just(Token::Star).to(BinOp::Mul),
            just(Token::Slash).to(BinOp::Div),
            just(Token::Percent).to(BinOp::Rem),
        ))
        .then(targ_unary)
        .repeated(),
        |lhs, (op, rhs)| binary(op, lhs, rhs),
    );

    let targ_expr = targ_product
        .clone()
        .foldl(
            choice((
                just(Token::Plus).to(BinOp::Add),
                just(Token::Minus).to(BinOp::Sub),
            ))
            .then(targ_product)
            .repeated(),
            |lhs, (op, rhs)| binary(op, lhs, rhs),
        )
        .boxed();

    let template_arg = ty
        .clone()
        .then_ignore(choice((just(Token::Comma), just(Token::Gt))).rewind())
        .map(TemplateArg::Type)
        .or(targ_expr.map(TemplateArg::Const))
        .boxed();

    let template_args = template_arg
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::Lt), just(Token::Gt))
        .boxed();

    let path = ident
        .clone()
        .then(template_args.clone().or_not())
        .map(|(ident, args)| PathSegment { ident, args })
        .separated_by(just(Token::ColonColon))
        .at_least(1)
        .collect::<Vec<_>>()
        .map_with(|segments, e| Path {
            segments,
            span: e.span(),
        })
        .boxed();

    // A path whose last segment carries template arguments must be a call.
    let expr_path = path
        .clone()
        .then(just(Token::LParen).rewind().or_not())
        .try_map(|(p, paren), span| {
            let trailing_args = p.segments.last().is_some_and(|s| s.args.is_some());
            if trailing_args && paren.is_none() {
                Err(Rich::custom(span, "expected '(' after template arguments"))
            } else {
                Ok(p)
            }
        })
        .or(plain_path.clone())
        .boxed();

    // ── Types ──

    ty.define({
        let base = choice((
            prim.clone().map(TypeKind::Prim),
            just(Token::Auto).to(TypeKind::Auto),
            path.clone().map(TypeKind::Path),
        ));
        just(Token::Const)
            .or_not()
            .then(base)
            .then(just(Token::Const).or_not())
            .then(just(Token::Amp).or_not())
            .map_with(|(((c1, kind), c2), amp), e| TypeExpr {
                kind,
                is_const: c1.is_some() || c2.is_some(),
                is_ref: amp.is_some(),
                span: e.span(),
            })
    });

    // ── Expressions ──

    let call_args = expr
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .boxed();

    let brace_list = expr
        .clone()
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .boxed();

    expr.define({
        let atom = choice((
            literal.clone(),
            just(Token::This).map_with(|_, e| Expr {
                kind: ExprKind::This,
                span: e.span(),
            }),
            prim.clone()
                .then(expr.clone().delimited_by(just(Token::LParen), just(Token::RParen)))
                .map_with(|(to, inner), e| Expr {
                    kind: ExprKind::Cast {
                        to,
                        expr: Box::new(inner),
                    },
                    span: e.span(),
                }),
            expr_path.clone().map_with(|p, e| Expr {
                kind: ExprKind::Path(p),
                span: e.span(),
            }),
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
            brace_list.clone().map_with(|items, e| Expr {
                kind: ExprKind::InitList(items),
                span: e.span(),
            }),
        ))
        .boxed();

        let member_args = template_args
            .clone()
            .then_ignore(just(Token::LParen).rewind());

        let postfix_op = choice((
            call_args.clone().map(Postfix::Call),
            expr.clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map(Postfix::Index),
            just(Token::Dot)
                .or(just(Token::Arrow))
                .ignore_then(ident.clone())
                .then(member_args.or_not())
                .map(|(name, args)| Postfix::Member(name, args)),
            just(Token::PlusPlus).to(Postfix::Inc),
            just(Token::MinusMinus).to(Postfix::Dec),
        ))
        .map_with(|op, e| (op, e.span()));

        let postfix = atom
            .foldl(postfix_op.repeated(), |lhs, (op, span): (Postfix, Span)| {
                let span = join(lhs.span, span);
                let object = Box::new(lhs);
                let kind = match op {
                    Postfix::Call(args) => ExprKind::Call {
                        callee: object,
                        args,
                    },
                    Postfix::Index(index) => ExprKind::Index {
                        object,
                        index: Box::new(index),
                    },
                    Postfix::Member(name, args) => ExprKind::Member { object, name, args },
                    Postfix::Inc => ExprKind::Postfix {
                        op: PostOp::Inc,
                        expr: object,
                    },
                    Postfix::Dec => ExprKind::Postfix {
                        op: PostOp::Dec,
                        expr: object,
                    },
                };
                Expr { kind, span }
            })
            .boxed();

        let prefix = choice((
            just(Token::Minus).to(Prefix::Op(UnOp::Neg)),
            just(Token::Bang).to(Prefix::Op(UnOp::Not)),
            just(Token::PlusPlus).to(Prefix::Op(UnOp::PreInc)),
            just(Token::MinusMinus).to(Prefix::Op(UnOp::PreDec)),
            just(Token::Star).to(Prefix::Op(UnOp::Deref)),
            prim.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .map(Prefix::Cast),
        ))
        .map_with(|p, e| (p, e.span()));

        let unary = prefix
            .repeated()
            .foldr(postfix, |(p, span): (Prefix, Span), rhs: Expr| {
                let span = join(span, rhs.span);
                let kind = match p {
                    Prefix::Op(op) => ExprKind::Unary {
                        op,
                        expr: Box::new(rhs),
                    },
                    Prefix::Cast(to) => ExprKind::Cast {
                        to,
                        expr: Box::new(rhs),
                    },
                };
                Expr { kind, span }
            })
            .boxed();

        let product = unary
            .clone()
            .foldl(
                choice((
                    just(Token::Star).to(BinOp::Mul),
                    just(Token::Slash).to(BinOp::Div),
                    just(Token::Percent).to(BinOp::Rem),
                ))
                .then(unary)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((
                    just(Token::Plus).to(BinOp::Add),
                    just(Token::Minus).to(BinOp::Sub),
                ))
                .then(product)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let comparison = sum
            .clone()
            .foldl(
                choice((
                    just(Token::LtEq).to(BinOp::Le),
                    just(Token::GtEq).to(BinOp::Ge),
                    just(Token::Lt).to(BinOp::Lt),
                    just(Token::Gt).to(BinOp::Gt),
                ))
                .then(sum)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let equality = comparison
            .clone()
            .foldl(
                choice((
                    just(Token::EqEq).to(BinOp::Eq),
                    just(Token::NotEq).to(BinOp::Ne),
                ))
                .then(comparison)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let and = equality
            .clone()
            .foldl(
                just(Token::AndAnd).to(BinOp::And).then(equality).repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let or = and
            .clone()
            .foldl(
                just(Token::OrOr).to(BinOp::Or).then(and).repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let ternary = or
            .then(
                just(Token::Question)
                    .ignore_then(expr.clone())
                    .then_ignore(just(Token::Colon))
                    .then(expr.clone())
                    .or_not(),
            )
            .map(|(cond, branches)| match branches {
                Some((then, els)) => {
                    let span = join(cond.span, els.span);
                    Expr {
                        kind: ExprKind::Ternary {
                            cond: Box::new(cond),
                            then: Box::new(then),
                            els: Box::new(els),
                        },
                        span,
                    }
                }
                None => cond,
            })
            .boxed();

        let assign_op = choice((
            just(Token::Assign).to(None),
            just(Token::PlusEq).to(Some(BinOp::Add)),
            just(Token::MinusEq).to(Some(BinOp::Sub)),
            just(Token::StarEq).to(Some(BinOp::Mul)),
            just(Token::SlashEq).to(Some(BinOp::Div)),
            just(Token::PercentEq).to(Some(BinOp::Rem)),
        ));

        ternary
            .then(assign_op.then(expr.clone()).or_not())
            .map(|(target, rhs)| match rhs {
                Some((op, value)) => {
                    let span = join(target.span, value.span);
                    Expr {
                        kind: ExprKind::Assign {
                            op,
                            target: Box::new(target),
                            value: Box::new(value),
                        },
                        span,
                    }
                }
                None => target,
            })
    });

    // ── Declarations ──

    let initializer = choice((
        just(Token::Assign)
            .ignore_then(brace_list.clone())
            .map_with(|items, e| Initializer::List(items, e.span())),
        just(Token::Assign)
            .ignore_then(expr.clone())
            .map(Initializer::Assign),
        call_args.clone().map(Initializer::Construct),
        brace_list
            .clone()
            .map_with(|items, e| Initializer::List(items, e.span())),
    ));

    let var_decl = just(Token::Static)
        .or_not()
        .then(just(Token::Mutable).or_not())
        .then(ty.clone())
        .then(ident.clone())
        .then(initializer.or_not())
        .then_ignore(just(Token::Semi))
        .map_with(|((((st, mu), ty), name), init), e| VarDecl {
            ty,
            name,
            init,
            is_static: st.is_some(),
            is_mutable: mu.is_some(),
            span: e.span(),
        })
        .boxed();

    // ── Statements ──

    let stmt = recursive(|stmt| {
        let block = stmt
            .clone()
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|stmts, e| Block {
                stmts,
                span: e.span(),
            });

        let paren_cond = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let if_stmt = just(Token::If)
            .ignore_then(paren_cond.clone())
            .then(stmt.clone())
            .then(just(Token::Else).ignore_then(stmt.clone()).or_not())
            .map(|((cond, then), els): ((Expr, Stmt), Option<Stmt>)| StmtKind::If {
                cond,
                then: Box::new(then),
                els: els.map(Box::new),
            });

        let while_stmt = just(Token::While)
            .ignore_then(paren_cond)
            .then(stmt.clone())
            .map(|(cond, body): (Expr, Stmt)| StmtKind::While {
                cond,
                body: Box::new(body),
            });

        let for_init = choice((
            var_decl.clone().map(StmtKind::Var),
            expr.clone()
                .then_ignore(just(Token::Semi))
                .map(StmtKind::Expr),
            just(Token::Semi).to(StmtKind::Empty),
        ))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        });

        let for_stmt = just(Token::For)
            .ignore_then(
                for_init
                    .then(expr.clone().or_not())
                    .then_ignore(just(Token::Semi))
                    .then(expr.clone().or_not())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(stmt.clone())
            .map(|(((init, cond), step), body): (((Stmt, Option<Expr>), Option<Expr>), Stmt)| {
                let init = match init.kind {
                    StmtKind::Empty => None,
                    _ => Some(Box::new(init)),
                };
                StmtKind::For {
                    init,
                    cond,
                    step,
                    body: Box::new(body),
                }
            });

        let range_for = just(Token::For)
            .ignore_then(
                ty.clone()
                    .then(ident.clone())
                    .then_ignore(just(Token::Colon))
                    .then(expr.clone())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(stmt.clone())
            .map(|(((ty, name), range), body): (((TypeExpr, Ident), Expr), Stmt)| {
                StmtKind::RangeFor {
                    ty,
                    name,
                    range,
                    body: Box::new(body),
                }
            });

        let return_stmt = just(Token::Return)
            .ignore_then(expr.clone().or_not())
            .then_ignore(just(Token::Semi))
            .map(StmtKind::Return);

        choice((
            block.map(StmtKind::Block),
            if_stmt,
            while_stmt,
            range_for,
            for_stmt,
            just(Token::Break)
                .then(just(Token::Semi))
                .to(StmtKind::Break),
            just(Token::Continue)
                .then(just(Token::Semi))
                .to(StmtKind::Continue),
            return_stmt,
            just(Token::Semi).to(StmtKind::Empty),
            var_decl.clone().map(StmtKind::Var),
            expr.clone()
                .then_ignore(just(Token::Semi))
                .map(StmtKind::Expr),
        ))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        })
    });

    let block = stmt
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|stmts, e| Block {
            stmts,
            span: e.span(),
        })
        .boxed();

    // ── Templates ──

    let template_param = choice((
        just(Token::Typename)
            .or(just(Token::Class))
            .ignore_then(ident.clone())
            .then(
                just(Token::Assign)
                    .ignore_then(ty.clone().map(TemplateArg::Type))
                    .or_not(),
            )
            .map(|(name, default)| TemplateParam {
                kind: TemplateParamKind::Type,
                name,
                default,
            }),
        prim.clone()
            .then(ident.clone())
            .then(just(Token::Assign).ignore_then(template_arg.clone()).or_not())
            .map(|((p, name), default)| TemplateParam {
                kind: TemplateParamKind::Value(p),
                name,
                default,
            }),
    ));

    let template_header = just(Token::Template)
        .ignore_then(
            template_param
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::Lt), just(Token::Gt)),
        )
        .boxed();

    // ── Functions ──

    let param = ty
        .clone()
        .then(ident.clone())
        .then(just(Token::Assign).ignore_then(expr.clone()).or_not())
        .map(|((ty, name), default)| Param { ty, name, default });

    let params = param
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .boxed();

    let overload_op = choice((
        just(Token::LBracket)
            .then(just(Token::RBracket))
            .to(OverloadOp::Subscript),
        just(Token::PlusEq).to(OverloadOp::Compound(BinOp::Add)),
        just(Token::MinusEq).to(OverloadOp::Compound(BinOp::Sub)),
        just(Token::StarEq).to(OverloadOp::Compound(BinOp::Mul)),
        just(Token::SlashEq).to(OverloadOp::Compound(BinOp::Div)),
        just(Token::PercentEq).to(OverloadOp::Compound(BinOp::Rem)),
        just(Token::PlusPlus).to(OverloadOp::Increment),
        just(Token::MinusMinus).to(OverloadOp::Decrement),
        just(Token::EqEq).to(OverloadOp::Binary(BinOp::Eq)),
        just(Token::NotEq).to(OverloadOp::Binary(BinOp::Ne)),
        just(Token::LtEq).to(OverloadOp::Binary(BinOp::Le)),
        just(Token::GtEq).to(OverloadOp::Binary(BinOp::Ge)),
        just(Token::Lt).to(OverloadOp::Binary(BinOp::Lt)),
        just(Token::Gt).to(OverloadOp::Binary(BinOp::Gt)),
        just(Token::Plus).to(OverloadOp::Binary(BinOp::Add)),
        just(Token::Minus).to(OverloadOp::Binary(BinOp::Sub)),
        just(Token::Star).to(OverloadOp::Binary(BinOp::Mul)),
        just(Token::Slash).to(OverloadOp::Binary(BinOp::Div)),
        just(Token::Assign).to(OverloadOp::Assign),
    ));

    let fn_name = choice((
        just(Token::Operator)
            .ignore_then(overload_op)
            .map_with(|op, e| FnName::Operator(op, e.span())),
        ident.clone().map(FnName::Ident),
    ));

    let function = template_header
        .clone()
        .or_not()
        .then(just(Token::Static).or_not())
        .then(ty.clone())
        .then(fn_name)
        .then(params.clone())
        .then(just(Token::Const).or_not())
        .then(block.clone())
        .map_with(
            |((((((template, st), ret), name), params), c), body), e| FunctionDecl {
                name,
                template,
                ret: Some(ret),
                params,
                is_const: c.is_some(),
                is_static: st.is_some(),
                body,
                span: e.span(),
            },
        )
        .boxed();

    let conversion = just(Token::Operator)
        .ignore_then(just(Token::Bool))
        .map_with(|_, e| FnName::Operator(OverloadOp::Bool, e.span()))
        .then_ignore(just(Token::LParen).then(just(Token::RParen)))
        .then(just(Token::Const).or_not())
        .then(block.clone())
        .map_with(|((name, c), body), e| FunctionDecl {
            name,
            template: None,
            ret: None,
            params: Vec::new(),
            is_const: c.is_some(),
            is_static: false,
            body,
            span: e.span(),
        });

    let ctor = ident
        .clone()
        .then(params.clone())
        .then(block.clone())
        .map_with(|((name, params), body), e| FunctionDecl {
            name: FnName::Ctor(name),
            template: None,
            ret: None,
            params,
            is_const: false,
            is_static: false,
            body,
            span: e.span(),
        });

    let dtor = just(Token::Tilde)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::LParen).then(just(Token::RParen)))
        .then(block.clone())
        .map_with(|(name, body), e| FunctionDecl {
            name: FnName::Dtor(name),
            template: None,
            ret: None,
            params: Vec::new(),
            is_const: false,
            is_static: false,
            body,
            span: e.span(),
        });

    // ── Enums and aliases ──

    let enum_decl = just(Token::Enum)
        .ignore_then(just(Token::Class).or_not())
        .then(ident.clone())
        .then(
            ident
                .clone()
                .then(just(Token::Assign).ignore_then(expr.clone()).or_not())
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .then_ignore(just(Token::Semi))
        .map_with(|((class, name), variants), e| EnumDecl {
            name,
            is_class: class.is_some(),
            variants,
            span: e.span(),
        })
        .boxed();

    let using_decl = just(Token::Using)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Assign))
        .then(ty.clone())
        .then_ignore(just(Token::Semi))
        .map(|(name, ty)| UsingDecl { name, ty })
        .boxed();

    // ── Structs ──

    let struct_decl = recursive(|struct_decl| {
        let member = choice((
            just(Token::Public)
                .then(just(Token::Colon))
                .to(MemberEntry::Label(Visibility::Public)),
            just(Token::Private)
                .then(just(Token::Colon))
                .to(MemberEntry::Label(Visibility::Private)),
            struct_decl
                .map_with(|s, e| MemberEntry::Member(MemberKind::Struct(Rc::new(s)), e.span())),
            enum_decl
                .clone()
                .map_with(|d, e| MemberEntry::Member(MemberKind::Enum(d), e.span())),
            using_decl
                .clone()
                .map_with(|u, e| MemberEntry::Member(MemberKind::Using(u), e.span())),
            function
                .clone()
                .map_with(|f, e| MemberEntry::Member(MemberKind::Method(Rc::new(f)), e.span())),
            conversion
                .map_with(|f, e| MemberEntry::Member(MemberKind::Method(Rc::new(f)), e.span())),
            ctor.map_with(|f, e| MemberEntry::Member(MemberKind::Method(Rc::new(f)), e.span())),
            dtor.map_with(|f, e| MemberEntry::Member(MemberKind::Method(Rc::new(f)), e.span())),
            var_decl
                .clone()
                .map_with(|v, e| MemberEntry::Member(MemberKind::Field(v), e.span())),
        ));

        template_header
            .clone()
            .or_not()
            .then(
                just(Token::Struct)
                    .to(false)
                    .or(just(Token::Class).to(true)),
            )
            .then(ident.clone())
            .then(
                member
                    .repeated()
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            )
            .then_ignore(just(Token::Semi))
            .map_with(|(((template, is_class), name), entries), e| {
                let mut visibility = if is_class {
                    Visibility::Private
                } else {
                    Visibility::Public
                };
                let mut members = Vec::new();
                for entry in entries {
                    match entry {
                        MemberEntry::Label(v) => visibility = v,
                        MemberEntry::Member(kind, span) => members.push(Member {
                            visibility,
                            kind,
                            span,
                        }),
                    }
                }
                StructDecl {
                    name,
                    template,
                    is_class,
                    members,
                    span: e.span(),
                }
            })
    })
    .boxed();

    // ── Items ──

    let item = recursive(|item| {
        let namespace = just(Token::Namespace)
            .ignore_then(ident.clone())
            .then(
                item.repeated()
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            )
            .map(|(name, items)| ItemKind::Namespace(NamespaceDecl { name, items }));

        let using_namespace = just(Token::Using)
            .ignore_then(just(Token::Namespace))
            .ignore_then(plain_path.clone())
            .then_ignore(just(Token::Semi))
            .map(ItemKind::UsingNamespace);

        choice((
            namespace,
            using_namespace,
            using_decl.clone().map(ItemKind::Using),
            enum_decl.clone().map(ItemKind::Enum),
            struct_decl.clone().map(|s| ItemKind::Struct(Rc::new(s))),
            function.clone().map(|f| ItemKind::Function(Rc::new(f))),
            var_decl.clone().map(ItemKind::Global),
        ))
        .map_with(|kind, e| Item {
            kind,
            span: e.span(),
        })
    });

    item.repeated()
        .collect::<Vec<_>>()
        .map_with(|items, e| Program {
            items,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.program.expect("expected program")
    }

    fn parse_body(body: &str) -> Vec<Stmt> {
        let prog = parse_ok(&format!("void f() {{ {body} }}"));
        let ItemKind::Function(f) = &prog.items[0].kind else {
            panic!("expected function")
        };
        f.body.stmts.clone()
    }

    #[test]
    fn empty_program() {
        let prog = parse_ok("");
        assert!(prog.items.is_empty());
    }

    #[test]
    fn struct_with_members_and_visibility() {
        let prog = parse_ok(
            "class X { int a = 0; public: X(int v) { a = v; } int get() const { return a; } };",
        );
        let ItemKind::Struct(s) = &prog.items[0].kind else {
            panic!("expected struct")
        };
        assert!(s.is_class);
        assert_eq!(s.members.len(), 3);
        assert_eq!(s.members[0].visibility, Visibility::Private);
        assert_eq!(s.members[1].visibility, Visibility::Public);
        let MemberKind::Method(ctor) = &s.members[1].kind else {
            panic!("expected ctor")
        };
        assert!(matches!(ctor.name, FnName::Ctor(_)));
        let MemberKind::Method(get) = &s.members[2].kind else {
            panic!("expected method")
        };
        assert!(get.is_const);
    }

    #[test]
    fn template_struct_header() {
        let prog = parse_ok("template <int N, typename T = float> struct X { static const int v = N; };");
        let ItemKind::Struct(s) = &prog.items[0].kind else {
            panic!("expected struct")
        };
        let params = s.template.as_ref().expect("template params");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].kind, TemplateParamKind::Value(Prim::Int));
        assert_eq!(params[1].kind, TemplateParamKind::Type);
        assert!(params[1].default.is_some());
    }

    #[test]
    fn declaration_with_template_type_and_construct() {
        let stmts = parse_body("index::wrapped<5> i(7);");
        let StmtKind::Var(v) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let TypeKind::Path(p) = &v.ty.kind else {
            panic!("expected path type")
        };
        assert_eq!(p.display_name(), "index::wrapped");
        assert!(matches!(&v.init, Some(Initializer::Construct(args)) if args.len() == 1));
    }

    #[test]
    fn less_than_stays_comparison() {
        let stmts = parse_body("bool b = a < c;");
        let StmtKind::Var(v) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let Some(Initializer::Assign(e)) = &v.init else {
            panic!("expected assignment")
        };
        assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Lt, .. }));
    }

    #[test]
    fn member_template_call() {
        let stmts = parse_body("c.get<0>().v = 1;");
        let StmtKind::Expr(e) = &stmts[0].kind else {
            panic!("expected expression")
        };
        let ExprKind::Assign { target, .. } = &e.kind else {
            panic!("expected assignment")
        };
        let ExprKind::Member { object, .. } = &target.kind else {
            panic!("expected member")
        };
        let ExprKind::Call { callee, .. } = &object.kind else {
            panic!("expected call")
        };
        assert!(matches!(&callee.kind, ExprKind::Member { args: Some(a), .. } if a.len() == 1));
    }

    #[test]
    fn static_member_through_template_path() {
        let stmts = parse_body("int x = X<5>::value;");
        let StmtKind::Var(v) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let Some(Initializer::Assign(e)) = &v.init else {
            panic!("expected assignment")
        };
        let ExprKind::Path(p) = &e.kind else {
            panic!("expected path")
        };
        assert_eq!(p.segments.len(), 2);
        assert!(p.segments[0].args.is_some());
    }

    #[test]
    fn template_args_allow_constant_arithmetic() {
        let stmts = parse_body("X<N - 1> a; span<float, 2 * 4> b; return *this;");
        let StmtKind::Var(v) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let TypeKind::Path(p) = &v.ty.kind else {
            panic!("expected path type")
        };
        let args = p.segments[0].args.as_ref().expect("template args");
        assert!(matches!(&args[0], TemplateArg::Const(e) if matches!(e.kind, ExprKind::Binary { op: BinOp::Sub, .. })));
        let StmtKind::Return(Some(e)) = &stmts[2].kind else {
            panic!("expected return")
        };
        assert!(matches!(e.kind, ExprKind::Unary { op: UnOp::Deref, .. }));
    }

    #[test]
    fn casts_and_precedence() {
        let stmts = parse_body("float x = (float)a + 2.0f * b;");
        let StmtKind::Var(v) = &stmts[0].kind else {
            panic!("expected declaration")
        };
        let Some(Initializer::Assign(e)) = &v.init else {
            panic!("expected assignment")
        };
        let ExprKind::Binary { op, lhs, rhs } = &e.kind else {
            panic!("expected binary")
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(lhs.kind, ExprKind::Cast { to: Prim::Float, .. }));
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn loops_and_control_flow() {
        let stmts = parse_body(
            "for (int i = 0; i < 4; i++) { if (i == 2) continue; } for (auto& s : data) s = 1.0f; while (true) break;",
        );
        assert!(matches!(stmts[0].kind, StmtKind::For { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::RangeFor { .. }));
        assert!(matches!(stmts[2].kind, StmtKind::While { .. }));
    }

    #[test]
    fn initializer_list_forms() {
        let stmts = parse_body("span<int, 3> a = { 1, 2, 3 }; span<int, 2> b { 4, 5 };");
        assert!(matches!(&stmts[0].kind, StmtKind::Var(VarDecl { init: Some(Initializer::List(items, _)), .. }) if items.len() == 3));
        assert!(matches!(&stmts[1].kind, StmtKind::Var(VarDecl { init: Some(Initializer::List(items, _)), .. }) if items.len() == 2));
    }

    #[test]
    fn operators_and_namespaces() {
        let prog = parse_ok(
            "namespace a { struct C { C& operator+=(int v) { return *this; } }; } using namespace a; enum class E { A, B = 3 };",
        );
        assert_eq!(prog.items.len(), 3);
    }

    #[test]
    fn syntax_error_is_reported() {
        let result = parse("int f( { return 1; }");
        assert!(!result.errors.is_empty());
        assert!(result.program.is_none());
    }
}
