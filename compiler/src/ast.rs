// ast.rs — AST node types for dspl source files
//
// Every node carries a `SimpleSpan` for error reporting in downstream phases.
// Declarations that templates instantiate repeatedly are reference counted so
// an instantiation can hold on to its pattern without cloning the tree.
//
// Preconditions: produced by the parser from a valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use std::rc::Rc;

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// Smallest span covering `a` and `b`.
pub fn join(a: Span, b: Span) -> Span {
    (a.start.min(b.start)..a.end.max(b.end)).into()
}

// ── Root ──

/// A complete compile unit: a sequence of top-level items.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Items ──

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub kind: ItemKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Struct(Rc<StructDecl>),
    Function(Rc<FunctionDecl>),
    Namespace(NamespaceDecl),
    Using(UsingDecl),
    UsingNamespace(Path),
    Enum(EnumDecl),
    Global(VarDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceDecl {
    pub name: Ident,
    pub items: Vec<Item>,
}

/// `using Alias = Type;`
#[derive(Debug, Clone, PartialEq)]
pub struct UsingDecl {
    pub name: Ident,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: Ident,
    pub is_class: bool,
    pub variants: Vec<(Ident, Option<Expr>)>,
    pub span: Span,
}

// ── Templates ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateParamKind {
    /// `typename T` / `class T`
    Type,
    /// `int N` / `bool B`
    Value(Prim),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateParam {
    pub kind: TemplateParamKind,
    pub name: Ident,
    pub default: Option<TemplateArg>,
}

/// A template argument as written. A bare path may name either a type or a
/// constant; resolution decides.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateArg {
    Type(TypeExpr),
    Const(Expr),
}

impl TemplateArg {
    pub fn span(&self) -> Span {
        match self {
            TemplateArg::Type(t) => t.span,
            TemplateArg::Const(e) => e.span,
        }
    }
}

// ── Structs ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: Ident,
    pub template: Option<Vec<TemplateParam>>,
    pub is_class: bool,
    pub members: Vec<Member>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub visibility: Visibility,
    pub kind: MemberKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    Field(VarDecl),
    Method(Rc<FunctionDecl>),
    Struct(Rc<StructDecl>),
    Enum(EnumDecl),
    Using(UsingDecl),
}

// ── Functions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadOp {
    Assign,
    Subscript,
    Increment,
    Decrement,
    Bool,
    Compound(BinOp),
    Binary(BinOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FnName {
    Ident(Ident),
    Operator(OverloadOp, Span),
    Ctor(Ident),
    Dtor(Ident),
}

impl FnName {
    pub fn span(&self) -> Span {
        match self {
            FnName::Ident(i) | FnName::Ctor(i) | FnName::Dtor(i) => i.span,
            FnName::Operator(_, s) => *s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: TypeExpr,
    pub name: Ident,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: FnName,
    pub template: Option<Vec<TemplateParam>>,
    /// `None` for constructors, destructors and conversion operators.
    pub ret: Option<TypeExpr>,
    pub params: Vec<Param>,
    pub is_const: bool,
    pub is_static: bool,
    pub body: Block,
    pub span: Span,
}

// ── Types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    Void,
    Int,
    Float,
    Double,
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Prim(Prim),
    Auto,
    Path(Path),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeKind,
    pub is_const: bool,
    pub is_ref: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub ident: Ident,
    pub args: Option<Vec<TemplateArg>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub segments: Vec<PathSegment>,
    pub span: Span,
}

impl Path {
    /// `a::b::c` without template arguments.
    pub fn display_name(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.ident.name.as_str())
            .collect::<Vec<_>>()
            .join("::")
    }
}

// ── Variables ──

#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    /// `T x = expr;`
    Assign(Expr),
    /// `T x(a, b);`
    Construct(Vec<Expr>),
    /// `T x = { ... };` or `T x { ... };`
    List(Vec<Expr>, Span),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub ty: TypeExpr,
    pub name: Ident,
    pub init: Option<Initializer>,
    pub is_static: bool,
    pub is_mutable: bool,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Var(VarDecl),
    Expr(Expr),
    If {
        cond: Expr,
        then: Box<Stmt>,
        els: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    RangeFor {
        ty: TypeExpr,
        name: Ident,
        range: Expr,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Block(Block),
    Empty,
}

// ── Expressions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    PreInc,
    PreDec,
    /// `*this`; no other pointer exists in the language.
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Double(f64),
    Bool(bool),
    Path(Path),
    This,
    Member {
        object: Box<Expr>,
        name: Ident,
        args: Option<Vec<TemplateArg>>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Postfix {
        op: PostOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `target = value` or `target op= value`.
    Assign {
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// `(float)x` or `float(x)`; only primitive targets.
    Cast {
        to: Prim,
        expr: Box<Expr>,
    },
    InitList(Vec<Expr>),
}
