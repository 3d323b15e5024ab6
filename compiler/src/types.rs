// types.rs — Resolved types of the dspl type system
//
// Every expression carries exactly one `Type` once analysis succeeds.
// Builtin families (index types, node containers, parameter specs, process
// payloads) are structural variants; user structs and enums are arena ids.
//
// Preconditions: ids refer to the arenas of the analysis that produced them.
// Postconditions: `implicit_cost` is a fixed partial order: numeric widening,
//   constant-only narrowing, plain enum to int, never struct to struct.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use dspl_runtime::index::Policy;

use crate::const_eval::ConstValue;
use crate::id::{EnumId, StructId};

// ── Type ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Int,
    Float,
    Double,
    Bool,
    Struct(StructId),
    Enum(EnumId),
    /// `span<T, N>`; `float4` is `span<float, 4>`.
    Span(Box<Type>, usize),
    /// `dyn<T>`; `block` is `dyn<float>`.
    Dyn(Box<Type>),
    Index(IndexType),
    Node(Box<NodeType>),
    Param(Box<ParamType>),
    ProcessData(usize),
    /// Frame iterator returned by `ProcessData::toFrameData()`.
    FrameData(usize),
    PolyData(Box<Type>, usize),
    Event,
    PrepareSpecs,
    ExternalData,
    /// `ranges::Identity`
    Identity,
}

/// SIMD lane width of `float4`.
pub const LANE_WIDTH: usize = 4;

impl Type {
    pub fn float4() -> Type {
        Type::Span(Box::new(Type::Float), LANE_WIDTH)
    }

    pub fn block() -> Type {
        Type::Dyn(Box::new(Type::Float))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Double)
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, Type::Float | Type::Double)
    }

    /// Widening rank of a numeric type.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Type::Int => Some(0),
            Type::Float => Some(1),
            Type::Double => Some(2),
            _ => None,
        }
    }

    /// Element type of a span or dyn.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Span(t, _) | Type::Dyn(t) => Some(t),
            _ => None,
        }
    }

    /// Number of scalar leaves of nested spans (`span<span<int,2>,3>` → 6).
    pub fn flat_len(&self) -> Option<usize> {
        match self {
            Type::Span(t, n) => Some(n * t.flat_len().unwrap_or(1)),
            _ => None,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Type::Node(_))
    }
}

// ── Index types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// `unsafe`, `wrapped`, `clamped`, `looped`. A bound of 0 uses the
    /// container's length.
    Int { policy: Policy, bound: usize },
    /// `normalised<T, Base>` (scaled by the bound) or `unscaled<T, Base>`.
    Float {
        normalised: bool,
        double: bool,
        base: Box<IndexType>,
    },
    /// `lerp<F>` or `hermite<F>` over a float index.
    Interp { hermite: bool, base: Box<IndexType> },
}

impl IndexType {
    /// Integer policy at the bottom of the stack.
    pub fn policy(&self) -> Policy {
        match self {
            IndexType::Int { policy, .. } => *policy,
            IndexType::Float { base, .. } | IndexType::Interp { base, .. } => base.policy(),
        }
    }

    pub fn bound(&self) -> usize {
        match self {
            IndexType::Int { bound, .. } => *bound,
            IndexType::Float { base, .. } | IndexType::Interp { base, .. } => base.bound(),
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, IndexType::Int { .. })
    }

    pub fn is_interp(&self) -> bool {
        matches!(self, IndexType::Interp { .. })
    }

    /// Value type stored in the index (`int`, `float` or `double`).
    pub fn value_type(&self) -> Type {
        match self {
            IndexType::Int { .. } => Type::Int,
            IndexType::Float { double, .. } => {
                if *double {
                    Type::Double
                } else {
                    Type::Float
                }
            }
            IndexType::Interp { base, .. } => base.value_type(),
        }
    }
}

// ── Node containers ──────────────────────────────────────────────────────

/// A builtin node container or wrapper.
///
/// Storage order (used by layout and evaluation): chain/split hold
/// `[params, nodes...]`, mod holds `[param, inner]`, init holds
/// `[inner, initialiser]`, every other wrapper holds `[inner]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeType {
    Chain {
        split: bool,
        params: ParamType,
        nodes: Vec<Type>,
    },
    Fix { channels: usize, inner: Type },
    Frame { channels: usize, inner: Type },
    Event(Type),
    Init { inner: Type, initialiser: Type },
    Mod { param: ParamType, inner: Type },
    Data { inner: Type, slot: usize },
}

impl NodeType {
    /// The wrapped node and its storage slot, for wrappers.
    pub fn inner(&self) -> Option<(&Type, usize)> {
        match self {
            NodeType::Chain { .. } => None,
            NodeType::Fix { inner, .. }
            | NodeType::Frame { inner, .. }
            | NodeType::Event(inner)
            | NodeType::Init { inner, .. }
            | NodeType::Data { inner, .. } => Some((inner, 0)),
            NodeType::Mod { inner, .. } => Some((inner, 1)),
        }
    }

    /// The parameter spec stored at slot 0, if any.
    pub fn params(&self) -> Option<&ParamType> {
        match self {
            NodeType::Chain { params, .. } => Some(params),
            NodeType::Mod { param, .. } => Some(param),
            _ => None,
        }
    }

    /// Types in storage order.
    pub fn storage(&self) -> Vec<Type> {
        match self {
            NodeType::Chain { params, nodes, .. } => {
                let mut v = vec![Type::Param(Box::new(params.clone()))];
                v.extend(nodes.iter().cloned());
                v
            }
            NodeType::Mod { param, inner } => {
                vec![Type::Param(Box::new(param.clone())), inner.clone()]
            }
            NodeType::Init { inner, initialiser } => vec![inner.clone(), initialiser.clone()],
            NodeType::Fix { inner, .. }
            | NodeType::Frame { inner, .. }
            | NodeType::Event(inner)
            | NodeType::Data { inner, .. } => vec![inner.clone()],
        }
    }
}

// ── Parameter specs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    Plain {
        target: Type,
        index: usize,
    },
    Expression {
        target: Type,
        index: usize,
        expr: StructId,
    },
    From0To1 {
        target: Type,
        index: usize,
        range: Type,
    },
    Chain {
        range: Type,
        items: Vec<ParamType>,
    },
    List(Vec<ParamType>),
    Empty,
}

impl ParamType {
    /// Independently addressable slots (`setParameter<i>`).
    pub fn slots(&self) -> usize {
        match self {
            ParamType::List(items) => items.len(),
            ParamType::Empty => 0,
            _ => 1,
        }
    }

    /// Target node type and parameter index of a leaf.
    pub fn leaf_target(&self) -> Option<(&Type, usize)> {
        match self {
            ParamType::Plain { target, index }
            | ParamType::Expression { target, index, .. }
            | ParamType::From0To1 { target, index, .. } => Some((target, *index)),
            _ => None,
        }
    }

    /// Sub-parameters addressed by `connect<i>`.
    pub fn children(&self) -> &[ParamType] {
        match self {
            ParamType::Chain { items, .. } | ParamType::List(items) => items,
            _ => &[],
        }
    }

    /// Number of `connect<i>` targets: the leaves in depth-first order.
    pub fn connect_targets(&self) -> usize {
        match self {
            ParamType::Chain { items, .. } | ParamType::List(items) => {
                items.iter().map(ParamType::connect_targets).sum()
            }
            ParamType::Empty => 0,
            _ => 1,
        }
    }

    /// The `k`-th leaf in depth-first order, with the child index path
    /// leading to it.
    pub fn leaf(&self, k: usize) -> Option<(Vec<usize>, &ParamType)> {
        match self {
            ParamType::Chain { items, .. } | ParamType::List(items) => {
                let mut k = k;
                for (i, item) in items.iter().enumerate() {
                    let n = item.connect_targets();
                    if k < n {
                        let (mut path, leaf) = item.leaf(k)?;
                        path.insert(0, i);
                        return Some((path, leaf));
                    }
                    k -= n;
                }
                None
            }
            ParamType::Empty => None,
            _ if k == 0 => Some((Vec::new(), self)),
            _ => None,
        }
    }

    /// The spec behind slot `slot`: a list child, or the spec itself.
    pub fn slot(&self, slot: usize) -> Option<&ParamType> {
        match self {
            ParamType::List(items) => items.get(slot),
            ParamType::Empty => None,
            _ if slot == 0 => Some(self),
            _ => None,
        }
    }
}

// ── Qualified type ───────────────────────────────────────────────────────

/// A type plus the qualifiers of a declaration or signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub ty: Type,
    pub is_const: bool,
    pub is_ref: bool,
}

impl TypeInfo {
    pub fn value(ty: Type) -> Self {
        Self {
            ty,
            is_const: false,
            is_ref: false,
        }
    }
}

/// A resolved template argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateValue {
    Type(Type),
    Int(i64),
}

// ── Naming context ───────────────────────────────────────────────────────

/// Names and kinds of arena-allocated types.
pub trait TypeContext {
    fn struct_name(&self, id: StructId) -> String;
    fn enum_name(&self, id: EnumId) -> String;
    fn enum_is_class(&self, id: EnumId) -> bool;
}

impl Type {
    /// Source-level spelling, e.g. `wrap::fix<2, Test>`.
    pub fn display(&self, cx: &dyn TypeContext) -> String {
        let mut s = String::new();
        write_type(&mut s, self, cx);
        s
    }
}

impl TemplateValue {
    pub fn display(&self, cx: &dyn TypeContext) -> String {
        match self {
            TemplateValue::Type(t) => t.display(cx),
            TemplateValue::Int(v) => v.to_string(),
        }
    }
}

fn write_type(s: &mut String, ty: &Type, cx: &dyn TypeContext) {
    match ty {
        Type::Void => s.push_str("void"),
        Type::Int => s.push_str("int"),
        Type::Float => s.push_str("float"),
        Type::Double => s.push_str("double"),
        Type::Bool => s.push_str("bool"),
        Type::Struct(id) => s.push_str(&cx.struct_name(*id)),
        Type::Enum(id) => s.push_str(&cx.enum_name(*id)),
        Type::Span(t, n) => {
            s.push_str("span<");
            write_type(s, t, cx);
            let _ = write!(s, ", {}>", n);
        }
        Type::Dyn(t) => {
            s.push_str("dyn<");
            write_type(s, t, cx);
            s.push('>');
        }
        Type::Index(i) => write_index(s, i, cx),
        Type::Node(n) => write_node(s, n, cx),
        Type::Param(p) => write_param(s, p, cx),
        Type::ProcessData(c) => {
            let _ = write!(s, "ProcessData<{}>", c);
        }
        Type::FrameData(c) => {
            let _ = write!(s, "FrameProcessor<{}>", c);
        }
        Type::PolyData(t, n) => {
            s.push_str("PolyData<");
            write_type(s, t, cx);
            let _ = write!(s, ", {}>", n);
        }
        Type::Event => s.push_str("HiseEvent"),
        Type::PrepareSpecs => s.push_str("PrepareSpecs"),
        Type::ExternalData => s.push_str("ExternalData"),
        Type::Identity => s.push_str("ranges::Identity"),
    }
}

fn write_index(s: &mut String, index: &IndexType, cx: &dyn TypeContext) {
    match index {
        IndexType::Int { policy, bound } => {
            let _ = write!(s, "index::{}<{}", policy.name(), bound);
            if let Policy::Wrapped {
                allow_negative: false,
            } = policy
            {
                s.push_str(", false");
            }
            s.push('>');
        }
        IndexType::Float {
            normalised,
            double,
            base,
        } => {
            let name = if *normalised { "normalised" } else { "unscaled" };
            let prec = if *double { "double" } else { "float" };
            let _ = write!(s, "index::{}<{}, ", name, prec);
            write_index(s, base, cx);
            s.push('>');
        }
        IndexType::Interp { hermite, base } => {
            s.push_str(if *hermite {
                "index::hermite<"
            } else {
                "index::lerp<"
            });
            write_index(s, base, cx);
            s.push('>');
        }
    }
}

fn write_list(s: &mut String, head: &str, items: &[String]) {
    s.push_str(head);
    s.push('<');
    s.push_str(&items.join(", "));
    s.push('>');
}

fn write_node(s: &mut String, node: &NodeType, cx: &dyn TypeContext) {
    match node {
        NodeType::Chain {
            split,
            params,
            nodes,
        } => {
            let mut items = vec![param_name(params, cx)];
            items.extend(nodes.iter().map(|n| n.display(cx)));
            let head = if *split {
                "container::split"
            } else {
                "container::chain"
            };
            write_list(s, head, &items);
        }
        NodeType::Fix { channels, inner } => {
            write_list(s, "wrap::fix", &[channels.to_string(), inner.display(cx)])
        }
        NodeType::Frame { channels, inner } => {
            write_list(s, "wrap::frame", &[channels.to_string(), inner.display(cx)])
        }
        NodeType::Event(inner) => write_list(s, "wrap::event", &[inner.display(cx)]),
        NodeType::Init { inner, initialiser } => write_list(
            s,
            "wrap::init",
            &[inner.display(cx), initialiser.display(cx)],
        ),
        NodeType::Mod { param, inner } => {
            write_list(s, "wrap::mod", &[param_name(param, cx), inner.display(cx)])
        }
        NodeType::Data { inner, slot } => {
            write_list(s, "wrap::data", &[inner.display(cx), slot.to_string()])
        }
    }
}

fn param_name(param: &ParamType, cx: &dyn TypeContext) -> String {
    let mut s = String::new();
    write_param(&mut s, param, cx);
    s
}

fn write_param(s: &mut String, param: &ParamType, cx: &dyn TypeContext) {
    match param {
        ParamType::Plain { target, index } => write_list(
            s,
            "parameter::plain",
            &[target.display(cx), index.to_string()],
        ),
        ParamType::Expression {
            target,
            index,
            expr,
        } => write_list(
            s,
            "parameter::expression",
            &[target.display(cx), index.to_string(), cx.struct_name(*expr)],
        ),
        ParamType::From0To1 {
            target,
            index,
            range,
        } => write_list(
            s,
            "parameter::from0To1",
            &[target.display(cx), index.to_string(), range.display(cx)],
        ),
        ParamType::Chain { range, items } => {
            let mut v = vec![range.display(cx)];
            v.extend(items.iter().map(|p| param_name(p, cx)));
            write_list(s, "parameter::chain", &v);
        }
        ParamType::List(items) => {
            let v: Vec<String> = items.iter().map(|p| param_name(p, cx)).collect();
            write_list(s, "parameter::list", &v);
        }
        ParamType::Empty => s.push_str("parameter::empty"),
    }
}

// ── Implicit conversions ─────────────────────────────────────────────────

/// Cost of implicitly converting `from` to `to`, or `None` if forbidden.
///
/// `constant` is the compile-time value of the source expression, if any; a
/// constant may narrow when its value fits the target.
pub fn implicit_cost(
    from: &Type,
    to: &Type,
    constant: Option<&ConstValue>,
    cx: &dyn TypeContext,
) -> Option<u32> {
    if from == to {
        return Some(0);
    }
    match (from, to) {
        (f, t) if f.is_numeric() && t.is_numeric() => {
            if f.rank() < t.rank() || constant.is_some_and(|c| c.fits(t)) {
                Some(1)
            } else {
                None
            }
        }
        (Type::Enum(e), Type::Int) if !cx.enum_is_class(*e) => Some(1),
        (Type::Int, Type::Index(IndexType::Int { .. })) => Some(1),
        (f, Type::Index(i @ (IndexType::Float { .. } | IndexType::Interp { .. }))) if f.is_numeric() => {
            let target = i.value_type();
            if f.rank() <= target.rank() || constant.is_some_and(|c| c.fits(&target)) {
                Some(1)
            } else {
                None
            }
        }
        (Type::Span(a, _), Type::Dyn(b)) if a == b => Some(1),
        _ => None,
    }
}

/// Common type of two numeric operands. A constant operand adapts to the
/// other side when its value fits.
pub fn unify_numeric(
    lhs: &Type,
    lhs_const: Option<&ConstValue>,
    rhs: &Type,
    rhs_const: Option<&ConstValue>,
) -> Option<Type> {
    let (l, r) = (lhs.rank()?, rhs.rank()?);
    if l == r {
        return Some(lhs.clone());
    }
    match (lhs_const, rhs_const) {
        (None, Some(c)) if c.fits(lhs) => Some(lhs.clone()),
        (Some(c), None) if c.fits(rhs) => Some(rhs.clone()),
        _ => Some(if l > r { lhs.clone() } else { rhs.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Names;

    impl TypeContext for Names {
        fn struct_name(&self, id: StructId) -> String {
            format!("S{}", id.0)
        }

        fn enum_name(&self, id: EnumId) -> String {
            format!("E{}", id.0)
        }

        fn enum_is_class(&self, id: EnumId) -> bool {
            id.0 == 1
        }
    }

    #[test]
    fn widening_is_allowed_narrowing_is_not() {
        assert_eq!(implicit_cost(&Type::Int, &Type::Float, None, &Names), Some(1));
        assert_eq!(implicit_cost(&Type::Float, &Type::Double, None, &Names), Some(1));
        assert_eq!(implicit_cost(&Type::Double, &Type::Float, None, &Names), None);
        assert_eq!(implicit_cost(&Type::Float, &Type::Int, None, &Names), None);
        assert_eq!(
            implicit_cost(&Type::Double, &Type::Float, Some(&ConstValue::Double(0.5)), &Names),
            Some(1)
        );
        assert_eq!(
            implicit_cost(&Type::Double, &Type::Int, Some(&ConstValue::Double(2.5)), &Names),
            None
        );
    }

    #[test]
    fn structs_and_class_enums_never_convert() {
        let a = Type::Struct(StructId(0));
        let b = Type::Struct(StructId(1));
        assert_eq!(implicit_cost(&a, &b, None, &Names), None);
        assert_eq!(implicit_cost(&Type::Enum(EnumId(0)), &Type::Int, None, &Names), Some(1));
        assert_eq!(implicit_cost(&Type::Enum(EnumId(1)), &Type::Int, None, &Names), None);
        assert_eq!(implicit_cost(&Type::Bool, &Type::Int, None, &Names), None);
    }

    #[test]
    fn numbers_convert_to_interpolating_indexes() {
        let lerp = Type::Index(IndexType::Interp {
            hermite: true,
            base: Box::new(IndexType::Float {
                normalised: false,
                double: false,
                base: Box::new(IndexType::Int {
                    policy: Policy::Clamped,
                    bound: 4,
                }),
            }),
        });
        assert_eq!(implicit_cost(&Type::Float, &lerp, None, &Names), Some(1));
        assert_eq!(implicit_cost(&Type::Double, &lerp, None, &Names), None);
        let c = ConstValue::Double(1.5);
        assert_eq!(implicit_cost(&Type::Double, &lerp, Some(&c), &Names), Some(1));
        assert_eq!(implicit_cost(&Type::Bool, &lerp, None, &Names), None);
    }

    #[test]
    fn constants_adapt_in_binary_operations() {
        let c = ConstValue::Double(2.0);
        assert_eq!(unify_numeric(&Type::Float, None, &Type::Double, Some(&c)), Some(Type::Float));
        let half = ConstValue::Double(0.5);
        assert_eq!(unify_numeric(&Type::Int, None, &Type::Double, Some(&half)), Some(Type::Double));
        assert_eq!(unify_numeric(&Type::Int, None, &Type::Float, None), Some(Type::Float));
    }

    #[test]
    fn display_builtin_families() {
        let fix = Type::Node(Box::new(NodeType::Fix {
            channels: 2,
            inner: Type::Struct(StructId(3)),
        }));
        assert_eq!(fix.display(&Names), "wrap::fix<2, S3>");

        let lerp = Type::Index(IndexType::Interp {
            hermite: false,
            base: Box::new(IndexType::Float {
                normalised: true,
                double: false,
                base: Box::new(IndexType::Int {
                    policy: Policy::Wrapped {
                        allow_negative: false,
                    },
                    bound: 8,
                }),
            }),
        });
        assert_eq!(
            lerp.display(&Names),
            "index::lerp<index::normalised<float, index::wrapped<8, false>>>"
        );

        let chain = Type::Node(Box::new(NodeType::Chain {
            split: false,
            params: ParamType::Plain {
                target: Type::Struct(StructId(0)),
                index: 1,
            },
            nodes: vec![Type::Struct(StructId(0))],
        }));
        assert_eq!(
            chain.display(&Names),
            "container::chain<parameter::plain<S0, 1>, S0>"
        );
    }

    #[test]
    fn connect_targets_are_flattened_leaves() {
        let leaf = |i| ParamType::Plain {
            target: Type::Struct(StructId(0)),
            index: i,
        };
        let p = ParamType::List(vec![
            leaf(0),
            ParamType::Chain {
                range: Type::Identity,
                items: vec![leaf(1), leaf(2)],
            },
        ]);
        assert_eq!(p.connect_targets(), 3);
        let (path, l) = p.leaf(2).expect("leaf");
        assert_eq!(path, vec![1, 1]);
        assert_eq!(l.leaf_target().map(|(_, i)| i), Some(2));
        assert!(p.leaf(3).is_none());
        assert_eq!(p.slots(), 2);
        assert!(p.slot(1).is_some());
    }

    #[test]
    fn nested_span_flat_length() {
        let t = Type::Span(Box::new(Type::Span(Box::new(Type::Int), 2)), 3);
        assert_eq!(t.flat_len(), Some(6));
        assert_eq!(Type::float4().flat_len(), Some(4));
    }
}
