// thir.rs — Typed program: the analyzer's output and the backend's input
//
// Every expression carries its resolved type and value category. Operator
// sugar on user structs is already desugared into method calls, implicit
// conversions are explicit `Convert` nodes, constants are folded, and every
// scope exit carries the list of objects it destroys.
//
// Preconditions: produced by `sema::analyze` from an error-free AST.
// Postconditions: ids index into the arenas of the same `TypedProgram`.
// Failure modes: none (data-only module).
// Side effects: none.

use std::collections::{BTreeMap, HashMap};

use crate::ast::{BinOp, Span, UnOp};
use crate::const_eval::ConstValue;
use crate::id::{EnumId, FunctionId, GlobalId, LocalId, StructId};
use crate::types::{Type, TypeContext, TypeInfo};

// ── Program ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TypedProgram {
    pub structs: Vec<StructInfo>,
    pub functions: Vec<FunctionInfo>,
    pub globals: Vec<GlobalInfo>,
    pub enums: Vec<EnumInfo>,
    /// Free functions by qualified name (`ns::f`), all overloads.
    pub functions_by_name: HashMap<String, Vec<FunctionId>>,
    /// Named types (structs and aliases) by qualified name.
    pub types_by_name: HashMap<String, Type>,
    /// Callbacks of every user struct used as a node.
    pub nodes: HashMap<StructId, NodeMethods>,
    /// `op` of expression classes and `from0To1` of range classes.
    pub transforms: HashMap<StructId, FunctionId>,
    /// The node processed directly by the unit's driver.
    pub entry: Option<EntryNode>,
}

impl TypedProgram {
    pub fn function(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id.index()]
    }

    pub fn struct_info(&self, id: StructId) -> &StructInfo {
        &self.structs[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalInfo {
        &self.globals[id.index()]
    }

    /// Whether destroying a value of `ty` runs any destructor.
    pub fn needs_drop(&self, ty: &Type) -> bool {
        match ty {
            Type::Struct(id) => {
                let s = self.struct_info(*id);
                s.dtor.is_some() || s.fields.iter().any(|f| self.needs_drop(&f.ty))
            }
            Type::Span(t, _) | Type::PolyData(t, _) => self.needs_drop(t),
            Type::Node(n) => n.storage().iter().any(|t| self.needs_drop(t)),
            _ => false,
        }
    }
}

impl TypeContext for TypedProgram {
    fn struct_name(&self, id: StructId) -> String {
        self.structs[id.index()].name.clone()
    }

    fn enum_name(&self, id: EnumId) -> String {
        self.enums[id.index()].name.clone()
    }

    fn enum_is_class(&self, id: EnumId) -> bool {
        self.enums[id.index()].is_class
    }
}

/// Callbacks of a user node, resolved when it is placed in a container.
/// Absent optional callbacks forward as no-ops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMethods {
    pub channels: Option<usize>,
    pub reset: Option<FunctionId>,
    pub prepare: Option<FunctionId>,
    /// `process` instantiations by channel count.
    pub process: BTreeMap<usize, FunctionId>,
    /// `processFrame` instantiations by channel count.
    pub process_frame: BTreeMap<usize, FunctionId>,
    pub handle_event: Option<FunctionId>,
    pub handle_modulation: Option<FunctionId>,
    pub set_external_data: Option<FunctionId>,
    /// `setParameter<P>` instantiations by parameter index.
    pub set_parameter: BTreeMap<usize, FunctionId>,
}

/// A node type driven from outside, bound to a channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryNode {
    pub name: String,
    pub ty: Type,
    pub channels: usize,
    /// Driven through `processFrame` because the node has no `process`.
    pub frame: bool,
}

// ── Declarations ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StructInfo {
    /// Qualified name including template arguments, e.g. `X<5>`.
    pub name: String,
    pub is_class: bool,
    pub fields: Vec<FieldInfo>,
    pub ctors: Vec<FunctionId>,
    pub dtor: Option<FunctionId>,
    pub methods: Vec<FunctionId>,
    pub statics: Vec<GlobalId>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub ty: Type,
    pub is_mutable: bool,
    pub is_public: bool,
    pub default: Option<TInit>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Free,
    Method,
    Static,
    Ctor,
    Dtor,
}

#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub ty: TypeInfo,
    pub local: LocalId,
    pub default: Option<TExpr>,
}

#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub name: String,
    pub ty: Type,
    pub is_const: bool,
    pub by_ref: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Qualified name, e.g. `Test::process`.
    pub name: String,
    pub kind: FnKind,
    pub owner: Option<StructId>,
    pub params: Vec<ParamInfo>,
    pub ret: TypeInfo,
    pub is_const: bool,
    pub locals: Vec<LocalInfo>,
    pub body: Option<TBlock>,
    /// By-value parameters destroyed when the call ends, in order.
    pub exit_cleanup: Vec<LocalId>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub name: String,
    pub ty: Type,
    pub is_const: bool,
    pub init: Option<TInit>,
    pub value: Option<ConstValue>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: String,
    pub is_class: bool,
    pub values: Vec<(String, i32)>,
}

// ── Statements ───────────────────────────────────────────────────────────

/// Locals destroyed on an exit edge, already in destruction order.
pub type Cleanup = Vec<LocalId>;

#[derive(Debug, Clone)]
pub struct TBlock {
    pub stmts: Vec<TStmt>,
    pub cleanup: Cleanup,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TStmt {
    Let {
        local: LocalId,
        init: LetInit,
    },
    Expr(TExpr),
    If {
        cond: TExpr,
        then: Box<TStmt>,
        els: Option<Box<TStmt>>,
    },
    While {
        cond: TExpr,
        body: Box<TStmt>,
    },
    /// `for (;cond;step)`; an init statement is hoisted into an enclosing
    /// block by the analyzer.
    For {
        cond: Option<TExpr>,
        step: Option<TExpr>,
        body: Box<TStmt>,
    },
    RangeFor {
        local: LocalId,
        by_ref: bool,
        range: TExpr,
        body: Box<TStmt>,
        /// Destroys the loop variable at the end of each iteration.
        cleanup: Cleanup,
    },
    Break(Cleanup),
    Continue(Cleanup),
    Return(Option<TExpr>, Cleanup),
    Block(TBlock),
}

#[derive(Debug, Clone)]
pub enum LetInit {
    /// Owns storage built from the initializer.
    Value(TInit),
    /// Aliases the place of an lvalue.
    Ref(TExpr),
}

// ── Initializers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TInit {
    /// Field defaults then the default constructor; zero for scalars.
    Default(Type),
    /// Copy of an expression already converted to the target type.
    Expr(TExpr),
    /// Field defaults, then the constructor on the new storage.
    Ctor {
        ty: Type,
        func: FunctionId,
        args: Vec<TArg>,
    },
    /// Positional struct fields (missing ones take their default) or
    /// span elements (exact arity).
    List { ty: Type, items: Vec<TInit> },
    /// One initializer broadcast to every span element.
    Splat { ty: Type, item: Box<TInit> },
}

impl TInit {
    pub fn ty(&self) -> &Type {
        match self {
            TInit::Default(t) => t,
            TInit::Expr(e) => &e.ty,
            TInit::Ctor { ty, .. } | TInit::List { ty, .. } | TInit::Splat { ty, .. } => ty,
        }
    }
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TExpr {
    pub kind: TExprKind,
    pub ty: Type,
    pub lvalue: bool,
    pub is_const: bool,
    pub span: Span,
}

impl TExpr {
    pub fn constant(value: ConstValue, span: Span) -> Self {
        Self {
            ty: value.ty(),
            kind: TExprKind::Const(value),
            lvalue: false,
            is_const: true,
            span,
        }
    }

    pub fn rvalue(kind: TExprKind, ty: Type, span: Span) -> Self {
        Self {
            kind,
            ty,
            lvalue: false,
            is_const: false,
            span,
        }
    }

    pub fn const_value(&self) -> Option<ConstValue> {
        match self.kind {
            TExprKind::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// A call argument: a value, or the place of an lvalue for `T&` parameters.
#[derive(Debug, Clone)]
pub struct TArg {
    pub expr: TExpr,
    pub by_ref: bool,
}

/// How a subscript maps its index onto an element.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Constant integer; spans are checked during analysis, dyns at run time.
    Const,
    /// Value of an index type, resolved through its policy.
    Index(crate::types::IndexType),
}

#[derive(Debug, Clone)]
pub enum TExprKind {
    Const(ConstValue),
    Local(LocalId),
    Global(GlobalId),
    This,
    Field {
        object: Box<TExpr>,
        index: usize,
    },
    Elem {
        object: Box<TExpr>,
        index: Box<TExpr>,
        access: Access,
    },
    Call {
        func: FunctionId,
        this: Option<Box<TExpr>>,
        args: Vec<TArg>,
    },
    Builtin {
        op: BuiltinOp,
        this: Option<Box<TExpr>>,
        args: Vec<TArg>,
    },
    /// Temporary object of the expression's type.
    Construct(Box<TInit>),
    /// Conversion to the expression's type: numeric, enum to int, index to
    /// its native integer, span or dyn to a `dyn` view.
    Convert(Box<TExpr>),
    Unary {
        op: UnOp,
        expr: Box<TExpr>,
    },
    /// Arithmetic, comparison and logical operators on scalars; `+`/`-` of
    /// an index and an int yields a moved index.
    Binary {
        op: BinOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    /// Plain assignment: scalar, struct or span copy, index update, or
    /// `dyn` rebinding.
    Assign {
        target: Box<TExpr>,
        value: Box<TExpr>,
    },
    /// `op=` on scalars, or element-wise on numeric spans.
    Compound {
        op: BinOp,
        target: Box<TExpr>,
        value: Box<TExpr>,
    },
    IncDec {
        target: Box<TExpr>,
        inc: bool,
        prefix: bool,
    },
    Ternary {
        cond: Box<TExpr>,
        then: Box<TExpr>,
        els: Box<TExpr>,
    },
}

// ── Builtin operations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    /// `dyn::size()`
    Size,
    /// `dyn::referTo(source, size, offset)`
    ReferTo,
    IsSimdable,
    /// Lane view over a float span or dyn.
    ToSimd,
    /// `slice(source, offset, length)`
    Slice,
    /// `looped::setLoopRange(lo, hi)`
    SetLoopRange,
    NumChannels,
    NumSamples,
    ChannelData,
    EventData,
    FrameData,
    FrameNext,
    FrameSpan,
    EventGet(EventField),
    EventSet(EventField),
    EventIs(EventKind),
    /// `ExternalData::referBlockTo(block&, channel)`
    ReferBlockTo,
    /// `PolyData::get()`
    PolyGet,
    Node(NodeOp),
    /// `get<i>()` on a container.
    Get(usize),
    /// `getObject()` on a wrapper.
    GetObject,
    /// `getWrappedObject()`: the innermost user node.
    GetWrappedObject,
    /// `getParameter<i>()` on a container, `getParameter()` on `wrap::mod`.
    GetParameter(Option<usize>),
    /// `connect<i>(node)`: binds the i-th leaf of a parameter spec.
    Connect(usize),
    /// `call(v)` on a single-slot spec or `call<i>(v)` on a list.
    ParamCall(Option<usize>),
    Math(MathFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    Reset,
    Prepare,
    Process,
    ProcessFrame,
    HandleEvent,
    SetParameter(usize),
}

impl NodeOp {
    pub fn method_name(self) -> &'static str {
        match self {
            NodeOp::Reset => "reset",
            NodeOp::Prepare => "prepare",
            NodeOp::Process => "process",
            NodeOp::ProcessFrame => "processFrame",
            NodeOp::HandleEvent => "handleHiseEvent",
            NodeOp::SetParameter(_) => "setParameter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    NoteNumber,
    Velocity,
    Channel,
    TimeStamp,
    ControllerNumber,
    ControllerValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sin,
    Cos,
    Tan,
    Abs,
    Sqrt,
    Exp,
    Pow,
    Min,
    Max,
    Floor,
    Ceil,
    Fmod,
    Sign,
    Range,
    Map,
}

impl MathFn {
    pub fn from_name(name: &str) -> Option<MathFn> {
        Some(match name {
            "sin" => MathFn::Sin,
            "cos" => MathFn::Cos,
            "tan" => MathFn::Tan,
            "abs" => MathFn::Abs,
            "sqrt" => MathFn::Sqrt,
            "exp" => MathFn::Exp,
            "pow" => MathFn::Pow,
            "min" => MathFn::Min,
            "max" => MathFn::Max,
            "floor" => MathFn::Floor,
            "ceil" => MathFn::Ceil,
            "fmod" => MathFn::Fmod,
            "sign" => MathFn::Sign,
            "range" => MathFn::Range,
            "map" => MathFn::Map,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Tan => "tan",
            MathFn::Abs => "abs",
            MathFn::Sqrt => "sqrt",
            MathFn::Exp => "exp",
            MathFn::Pow => "pow",
            MathFn::Min => "min",
            MathFn::Max => "max",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Fmod => "fmod",
            MathFn::Sign => "sign",
            MathFn::Range => "range",
            MathFn::Map => "map",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFn::Pow | MathFn::Min | MathFn::Max | MathFn::Fmod => 2,
            MathFn::Range | MathFn::Map => 3,
            _ => 1,
        }
    }

    pub fn apply(self, a: &[f64]) -> f64 {
        let x = a.first().copied().unwrap_or(0.0);
        let y = a.get(1).copied().unwrap_or(0.0);
        let z = a.get(2).copied().unwrap_or(0.0);
        match self {
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Tan => x.tan(),
            MathFn::Abs => x.abs(),
            MathFn::Sqrt => x.sqrt(),
            MathFn::Exp => x.exp(),
            MathFn::Pow => x.powf(y),
            MathFn::Min => x.min(y),
            MathFn::Max => x.max(y),
            MathFn::Floor => x.floor(),
            MathFn::Ceil => x.ceil(),
            MathFn::Fmod => x % y,
            MathFn::Sign => {
                if x >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            MathFn::Range => x.max(y).min(z),
            MathFn::Map => y + x * (z - y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_functions_by_name() {
        assert_eq!(MathFn::from_name("fmod"), Some(MathFn::Fmod));
        assert_eq!(MathFn::from_name("nope"), None);
        assert_eq!(MathFn::Range.apply(&[5.0, 0.0, 1.0]), 1.0);
        assert_eq!(MathFn::Map.apply(&[0.5, 2.0, 4.0]), 3.0);
        assert_eq!(MathFn::Max.arity(), 2);
    }
}
