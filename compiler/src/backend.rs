// backend.rs — Contract between the analyzer and a code generator
//
// A backend receives the fully typed program together with the node-graph
// layout and returns a unit whose entry points can be called by name. The
// reference evaluator in `eval` is the only backend in this crate; a native
// code generator plugs in behind the same trait.
//
// Preconditions: the program passed analysis and the connection check.
// Postconditions: a compiled unit exposes every function of the program.
// Failure modes: `BackendError` for conditions the analyzer can't see
//   (negative `wrapped<N, false>` values, dyn subscripts out of range,
//   dangling references, unconnected parameters reached at run time).
// Side effects: none at compile time; calls mutate the unit's own state.

use std::fmt;
use std::str::FromStr;

use dspl_runtime::index::IndexError;
use dspl_runtime::HiseEvent;
pub use dspl_runtime::ExternalData;

use crate::const_eval::ScalarError;
use crate::graph::NodeGraph;
use crate::thir::TypedProgram;

// ── Flags ────────────────────────────────────────────────────────────────

/// Optimisation switches named by the fixture `compile_flags` key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileFlags {
    pub auto_vectorisation: bool,
    pub inlining: bool,
    pub loop_optimisation: bool,
}

impl CompileFlags {
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.auto_vectorisation {
            out.push("AutoVectorisation");
        }
        if self.inlining {
            out.push("Inlining");
        }
        if self.loop_optimisation {
            out.push("LoopOptimisation");
        }
        out
    }
}

impl FromStr for CompileFlags {
    type Err = String;

    /// Comma or whitespace separated flag names; `All` and `None` are
    /// accepted shorthands.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = CompileFlags::default();
        for word in s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|w| !w.is_empty())
        {
            match word {
                "AutoVectorisation" => flags.auto_vectorisation = true,
                "Inlining" => flags.inlining = true,
                "LoopOptimisation" => flags.loop_optimisation = true,
                "All" => {
                    flags = CompileFlags {
                        auto_vectorisation: true,
                        inlining: true,
                        loop_optimisation: true,
                    }
                }
                "None" => flags = CompileFlags::default(),
                other => return Err(format!("unknown compile flag '{}'", other)),
            }
        }
        Ok(flags)
    }
}

// ── Input ────────────────────────────────────────────────────────────────

/// Everything a backend gets from the core.
pub struct BackendInput<'a> {
    pub program: &'a TypedProgram,
    pub graph: &'a NodeGraph,
    pub flags: CompileFlags,
    pub external: &'a [ExternalData],
}

// ── Values ───────────────────────────────────────────────────────────────

/// Argument and return values crossing the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i32),
    Float(f32),
    Double(f64),
    Bool(bool),
    /// Span contents, outermost dimension first.
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::Float(v) => Some(v as f64),
            Value::Double(v) => Some(v),
            Value::Bool(v) => Some(v as i32 as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    UnknownFunction(String),
    UnknownNode(String),
    BadArguments { name: String, message: String },
    NegativeIndex(i32),
    OutOfRange { index: i64, size: usize },
    DanglingReference,
    Unconnected(String),
    DivisionByZero,
    StackOverflow(String),
    Unsupported(String),
    /// An evaluator invariant broke; indicates an analyzer bug.
    Fault(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::UnknownFunction(name) => write!(f, "Can't find function {}", name),
            BackendError::UnknownNode(name) => write!(f, "Can't find node {}", name),
            BackendError::BadArguments { name, message } => {
                write!(f, "{}: {}", name, message)
            }
            BackendError::NegativeIndex(v) => {
                write!(f, "{}", IndexError::Negative(*v))
            }
            BackendError::OutOfRange { index, size } => {
                write!(f, "index {} out of range for size {}", index, size)
            }
            BackendError::DanglingReference => write!(f, "access through a dangling reference"),
            BackendError::Unconnected(spec) => write!(f, "{}: parameter is not connected", spec),
            BackendError::DivisionByZero => write!(f, "Division by zero"),
            BackendError::StackOverflow(name) => write!(f, "stack overflow in {}", name),
            BackendError::Unsupported(what) => write!(f, "unsupported: {}", what),
            BackendError::Fault(what) => write!(f, "internal evaluator fault: {}", what),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<IndexError> for BackendError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Negative(v) => BackendError::NegativeIndex(v),
        }
    }
}

impl From<ScalarError> for BackendError {
    fn from(e: ScalarError) -> Self {
        match e {
            ScalarError::DivisionByZero => BackendError::DivisionByZero,
            ScalarError::Unsupported => BackendError::Fault(e.to_string()),
        }
    }
}

// ── Traits ───────────────────────────────────────────────────────────────

/// Callable result of a compilation.
pub trait CompiledUnit {
    /// Call a free function by qualified name.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, BackendError>;

    /// Run one block through the node type `name`. The node is created,
    /// prepared and reset on first use and keeps its state afterwards.
    fn process_node(
        &mut self,
        name: &str,
        channels: &mut [Vec<f32>],
        events: &[HiseEvent],
    ) -> Result<(), BackendError>;

    /// Select the active voice of every `PolyData`; `None` means no voice.
    fn set_voice_index(&mut self, voice: Option<usize>);
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile<'a>(
        &mut self,
        input: &BackendInput<'a>,
    ) -> Result<Box<dyn CompiledUnit + 'a>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_from_fixture_text() {
        let f: CompileFlags = "Inlining, LoopOptimisation".parse().expect("flags");
        assert!(f.inlining && f.loop_optimisation && !f.auto_vectorisation);
        assert_eq!(f.names(), ["Inlining", "LoopOptimisation"]);
        assert!("Turbo".parse::<CompileFlags>().is_err());
        assert_eq!("".parse::<CompileFlags>(), Ok(CompileFlags::default()));
    }

    #[test]
    fn index_errors_become_backend_errors() {
        let e: BackendError = IndexError::Negative(-3).into();
        assert_eq!(e, BackendError::NegativeIndex(-3));
        assert_eq!(e.to_string(), "negative index -3 for non-negative wrap");
    }

    #[test]
    fn values_print_like_fixture_literals() {
        let v = Value::List(vec![Value::Int(1), Value::Float(2.5)]);
        assert_eq!(v.to_string(), "[1, 2.5]");
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
    }
}
