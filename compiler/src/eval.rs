// eval.rs — Reference evaluator behind the backend boundary
//
// A tree-walking interpreter over the typed program. Every variable owns a
// storage root holding a tree of values; references, `dyn` views and
// parameter connections are places (a root plus a child path). Copies are
// deep. Every exit edge runs the cleanup list the analyzer attached to it,
// and storage owned by a call is marked dead when the call returns, so a
// reference that outlives its target is reported instead of read.
//
// Preconditions: the program passed analysis and the connection check.
// Postconditions: none beyond the unit's own storage.
// Failure modes: `BackendError` for run-time faults (negative index on a
//   non-negative wrap, dyn access out of range, dangling reference,
//   unconnected parameter, integer division by zero, call depth).
// Side effects: none outside the unit.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use dspl_runtime::index::{hermite, lerp, LoopRange, Policy};
use dspl_runtime::node::EventType;
use dspl_runtime::{HiseEvent, PrepareSpecs};
use tracing::{debug, trace};

use crate::ast::{BinOp, UnOp};
use crate::backend::{
    Backend, BackendError, BackendInput, CompileFlags, CompiledUnit, ExternalData, Value,
};
use crate::const_eval::ConstValue;
use crate::graph::NodeGraph;
use crate::id::{FunctionId, LocalId, StructId};
use crate::thir::{
    Access, BuiltinOp, EventField, EventKind, FieldInfo, LetInit, NodeOp, TArg, TBlock, TExpr,
    TExprKind, TInit, TStmt, TypedProgram,
};
use crate::types::{IndexType, NodeType, ParamType, Type, LANE_WIDTH};

type EvalResult<T> = Result<T, BackendError>;

/// Nested calls before the evaluator gives up.
const MAX_DEPTH: usize = 256;

fn fault(what: impl Into<String>) -> BackendError {
    BackendError::Fault(what.into())
}

// ── Storage ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Storage {
    value: RefCell<Val>,
    alive: Cell<bool>,
}

/// A location: a storage root, the child path inside it, and optionally a
/// run of consecutive children read and written as one span (SIMD lanes).
#[derive(Debug, Clone)]
struct Place {
    root: Rc<Storage>,
    path: Vec<usize>,
    window: Option<(usize, usize)>,
}

impl Place {
    fn temp(v: Val) -> Place {
        Place::root(v).0
    }

    fn root(v: Val) -> (Place, Rc<Storage>) {
        let root = Rc::new(Storage {
            value: RefCell::new(v),
            alive: Cell::new(true),
        });
        (
            Place {
                root: root.clone(),
                path: Vec::new(),
                window: None,
            },
            root,
        )
    }

    fn child(&self, i: usize) -> Place {
        let mut path = self.path.clone();
        path.push(self.window.map_or(i, |(start, _)| start + i));
        Place {
            root: self.root.clone(),
            path,
            window: None,
        }
    }

    fn window(&self, start: usize, len: usize) -> Place {
        let start = self.window.map_or(start, |(s, _)| s + start);
        Place {
            root: self.root.clone(),
            path: self.path.clone(),
            window: Some((start, len)),
        }
    }

    fn read(&self) -> EvalResult<Val> {
        if !self.root.alive.get() {
            return Err(BackendError::DanglingReference);
        }
        let root = self.root.value.borrow();
        let mut v = &*root;
        for &i in &self.path {
            v = v.child(i).ok_or_else(|| fault("invalid place"))?;
        }
        match (self.window, v) {
            (None, v) => Ok(v.clone()),
            (Some((s, n)), Val::Agg(items)) => items
                .get(s..s + n)
                .map(|w| Val::Agg(w.to_vec()))
                .ok_or_else(|| fault("lane window out of range")),
            _ => Err(fault("lane window over a scalar")),
        }
    }

    fn write(&self, new: Val) -> EvalResult<()> {
        if !self.root.alive.get() {
            return Err(BackendError::DanglingReference);
        }
        let mut root = self.root.value.borrow_mut();
        let mut v = &mut *root;
        for &i in &self.path {
            v = v.child_mut(i).ok_or_else(|| fault("invalid place"))?;
        }
        match (self.window, v, new) {
            (None, v, new) => *v = new,
            (Some((s, n)), Val::Agg(items), Val::Agg(lanes)) if lanes.len() == n => {
                let slots = items
                    .get_mut(s..s + n)
                    .ok_or_else(|| fault("lane window out of range"))?;
                slots.clone_from_slice(&lanes);
            }
            _ => return Err(fault("lane window shape mismatch")),
        }
        Ok(())
    }
}

// ── Values ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Val {
    Void,
    Scalar(ConstValue),
    /// Integer index: raw value and the loop window of `looped`.
    Index(i32, LoopRange),
    FloatIndex(f64),
    /// Struct fields, span elements, node storage, voices.
    Agg(Vec<Val>),
    View(View),
    /// A parameter connection or an external data binding.
    Ref(Option<Place>),
    Process(ProcessState),
    Frame(Box<FrameState>),
    Event(HiseEvent),
}

impl Val {
    fn child(&self, i: usize) -> Option<&Val> {
        match self {
            Val::Agg(items) => items.get(i),
            Val::Frame(f) if i == 0 => Some(&f.frame),
            _ => None,
        }
    }

    fn child_mut(&mut self, i: usize) -> Option<&mut Val> {
        match self {
            Val::Agg(items) => items.get_mut(i),
            Val::Frame(f) if i == 0 => Some(&mut f.frame),
            _ => None,
        }
    }

    fn scalar(&self) -> EvalResult<ConstValue> {
        match self {
            Val::Scalar(c) => Ok(*c),
            Val::Index(v, _) => Ok(ConstValue::Int(*v)),
            Val::FloatIndex(v) => Ok(ConstValue::Double(*v)),
            other => Err(fault(format!("expected a scalar, found {:?}", other))),
        }
    }

    fn int(&self) -> EvalResult<i32> {
        match self.scalar()? {
            ConstValue::Int(v) => Ok(v),
            other => Ok(other.as_f64() as i32),
        }
    }

    fn f64(&self) -> EvalResult<f64> {
        Ok(self.scalar()?.as_f64())
    }

    fn truthy(&self) -> EvalResult<bool> {
        Ok(self.scalar()?.is_truthy())
    }

    fn view(self) -> EvalResult<View> {
        match self {
            Val::View(v) => Ok(v),
            other => Err(fault(format!("expected a dyn, found {:?}", other))),
        }
    }

    fn process(self) -> EvalResult<ProcessState> {
        match self {
            Val::Process(p) => Ok(p),
            other => Err(fault(format!("expected process data, found {:?}", other))),
        }
    }

    fn event(self) -> EvalResult<HiseEvent> {
        match self {
            Val::Event(e) => Ok(e),
            other => Err(fault(format!("expected an event, found {:?}", other))),
        }
    }
}

/// `len` elements of the aggregate at `base`, starting at `offset`. With
/// `lanes > 1` every element is a window of that many scalars.
#[derive(Debug, Clone)]
struct View {
    base: Place,
    offset: usize,
    len: usize,
    lanes: usize,
}

impl View {
    fn over(base: Place, len: usize) -> View {
        View {
            base,
            offset: 0,
            len,
            lanes: 1,
        }
    }

    fn empty() -> View {
        View::over(Place::temp(Val::Agg(Vec::new())), 0)
    }

    fn elem(&self, i: usize) -> Place {
        if self.lanes == 1 {
            self.base.child(self.offset + i)
        } else {
            self.base.window(self.offset + i * self.lanes, self.lanes)
        }
    }

    /// `size` elements from `offset`; `None` takes the rest.
    fn sub(&self, offset: i32, size: Option<i32>) -> EvalResult<View> {
        let len = self.len as i64;
        let off = offset as i64;
        let size = size.map_or(len - off, |s| s as i64);
        if off < 0 || size < 0 || off + size > len {
            return Err(BackendError::OutOfRange {
                index: off + size,
                size: self.len,
            });
        }
        Ok(View {
            base: self.base.clone(),
            offset: self.offset + off as usize * self.lanes,
            len: size as usize,
            lanes: self.lanes,
        })
    }

    /// Groups of four floats; a trailing remainder is not covered.
    fn simd(&self) -> View {
        if self.lanes != 1 {
            return self.clone();
        }
        View {
            base: self.base.clone(),
            offset: self.offset,
            len: self.len / LANE_WIDTH,
            lanes: LANE_WIDTH,
        }
    }

    fn is_simdable(&self) -> bool {
        self.lanes == LANE_WIDTH
            || (self.len % LANE_WIDTH == 0 && self.offset % LANE_WIDTH == 0)
    }
}

#[derive(Debug, Clone)]
struct ProcessState {
    /// Aggregate of channel aggregates.
    data: Place,
    channels: usize,
    samples: usize,
    events: Place,
    num_events: usize,
}

impl ProcessState {
    fn empty(channels: usize) -> ProcessState {
        ProcessState {
            data: Place::temp(Val::Agg(vec![Val::Agg(Vec::new()); channels])),
            channels,
            samples: 0,
            events: Place::temp(Val::Agg(Vec::new())),
            num_events: 0,
        }
    }

    fn channel(&self, c: usize) -> View {
        View::over(self.data.child(c), self.samples)
    }

    fn sample(&self, c: usize, s: usize) -> Place {
        self.data.child(c).child(s)
    }
}

/// Iterator state of `toFrameData()`; child 0 is the current frame.
#[derive(Debug, Clone)]
struct FrameState {
    data: Place,
    channels: usize,
    samples: usize,
    pos: Option<usize>,
    frame: Val,
}

impl FrameState {
    fn new(pd: &ProcessState) -> FrameState {
        FrameState {
            data: pd.data.clone(),
            channels: pd.channels,
            samples: pd.samples,
            pos: None,
            frame: Val::Agg(vec![Val::Scalar(ConstValue::Float(0.0)); pd.channels]),
        }
    }
}

fn empty_event() -> HiseEvent {
    HiseEvent {
        kind: EventType::Empty,
        channel: 0,
        value1: 0,
        value2: 0,
        timestamp: 0,
    }
}

fn specs_val(specs: PrepareSpecs) -> Val {
    Val::Agg(vec![
        Val::Scalar(ConstValue::Double(specs.sample_rate)),
        Val::Scalar(ConstValue::Int(specs.block_size as i32)),
        Val::Scalar(ConstValue::Int(specs.num_channels as i32)),
    ])
}

fn event_field(e: &HiseEvent, f: EventField) -> i32 {
    match f {
        EventField::NoteNumber | EventField::ControllerNumber => e.value1 as i32,
        EventField::Velocity | EventField::ControllerValue => e.value2 as i32,
        EventField::Channel => e.channel as i32,
        EventField::TimeStamp => e.timestamp as i32,
    }
}

fn set_event_field(e: &mut HiseEvent, f: EventField, v: i32) {
    let byte = v.clamp(0, u8::MAX as i32) as u8;
    match f {
        EventField::NoteNumber | EventField::ControllerNumber => e.value1 = byte,
        EventField::Velocity | EventField::ControllerValue => e.value2 = byte,
        EventField::Channel => e.channel = byte,
        EventField::TimeStamp => e.timestamp = v.max(0) as u32,
    }
}

fn event_is(e: &HiseEvent, k: EventKind) -> bool {
    match k {
        EventKind::NoteOn => e.kind == EventType::NoteOn,
        EventKind::NoteOff => e.kind == EventType::NoteOff,
        EventKind::Controller => e.kind == EventType::Controller,
    }
}

// ── Index resolution ─────────────────────────────────────────────────────

fn limit(bound: usize, len: usize) -> i32 {
    let l = if bound > 0 { bound } else { len };
    l.max(1) as i32
}

/// Fractional position of a float index on a container of `len` elements.
fn position(it: &IndexType, raw: &Val, len: usize) -> EvalResult<f64> {
    match it {
        IndexType::Float {
            normalised: true, ..
        } => Ok(raw.f64()? * limit(it.bound(), len) as f64),
        IndexType::Interp { base, .. } => position(base, raw, len),
        _ => raw.f64(),
    }
}

/// Slot addressed by `raw` (moved by `delta`) on a container of `len`.
fn resolve_slot(it: &IndexType, raw: &Val, len: usize, delta: i32) -> EvalResult<usize> {
    let slot = match it {
        IndexType::Int { policy, bound } => {
            let (v, range) = match raw {
                Val::Index(v, r) => (*v, *r),
                other => (other.int()?, LoopRange::default()),
            };
            policy.apply(v.wrapping_add(delta), limit(*bound, len), range)?
        }
        IndexType::Float { .. } | IndexType::Interp { .. } => {
            let base = position(it, raw, len)?.floor() as i32;
            it.policy().apply(
                base.wrapping_add(delta),
                limit(it.bound(), len),
                LoopRange::default(),
            )?
        }
    };
    if slot < 0 || slot as usize >= len {
        return Err(BackendError::OutOfRange {
            index: slot as i64,
            size: len,
        });
    }
    Ok(slot as usize)
}

// ── Element-wise helpers ─────────────────────────────────────────────────

fn leaf_places(p: &Place, ty: &Type, out: &mut Vec<Place>) -> EvalResult<()> {
    match ty {
        Type::Span(t, n) => {
            for i in 0..*n {
                leaf_places(&p.child(i), t, out)?;
            }
        }
        Type::Dyn(t) => {
            let view = p.read()?.view()?;
            for i in 0..view.len {
                leaf_places(&view.elem(i), t, out)?;
            }
        }
        _ => out.push(p.clone()),
    }
    Ok(())
}

fn leaf_values(v: &Val, ty: &Type, out: &mut Vec<ConstValue>) -> EvalResult<()> {
    match (ty, v) {
        (Type::Span(t, _), Val::Agg(items)) => {
            for item in items {
                leaf_values(item, t, out)?;
            }
        }
        (Type::Dyn(t), Val::View(view)) => {
            for i in 0..view.len {
                leaf_values(&view.elem(i).read()?, t, out)?;
            }
        }
        (_, v) => out.push(v.scalar()?),
    }
    Ok(())
}

fn zeroed(v: &Val) -> Val {
    match v {
        Val::Agg(items) => Val::Agg(items.iter().map(zeroed).collect()),
        Val::Scalar(c) => Val::Scalar(ConstValue::Int(0).convert(&c.ty()).unwrap_or(*c)),
        other => other.clone(),
    }
}

fn mix(acc: &mut Val, v: &Val) -> EvalResult<()> {
    match (acc, v) {
        (Val::Agg(a), Val::Agg(b)) => {
            for (x, y) in a.iter_mut().zip(b) {
                mix(x, y)?;
            }
        }
        (Val::Scalar(a), Val::Scalar(b)) => {
            *a = ConstValue::binary(BinOp::Add, *a, *b)?;
        }
        _ => {}
    }
    Ok(())
}

// ── Call machinery ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Arg {
    Place(Place),
    Value(Val),
}

impl Arg {
    fn read(&self) -> EvalResult<Val> {
        match self {
            Arg::Place(p) => p.read(),
            Arg::Value(v) => Ok(v.clone()),
        }
    }
}

enum Ret {
    Value(Val),
    Place(Place),
}

impl Ret {
    fn into_value(self) -> EvalResult<Val> {
        match self {
            Ret::Value(v) => Ok(v),
            Ret::Place(p) => p.read(),
        }
    }

    fn into_place(self) -> Place {
        match self {
            Ret::Place(p) => p,
            Ret::Value(v) => Place::temp(v),
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Ret),
}

struct Activation {
    func: Option<FunctionId>,
    locals: Vec<Option<Place>>,
    this: Option<Place>,
    ret_ref: bool,
    /// Storage that dies with the call.
    owned: Vec<Rc<Storage>>,
}

impl Activation {
    /// Context for initializers evaluated outside any function.
    fn detached(this: Option<Place>) -> Self {
        Self {
            func: None,
            locals: Vec::new(),
            this,
            ret_ref: false,
            owned: Vec::new(),
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// The reference backend: interprets the typed program directly.
#[derive(Debug, Default)]
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn compile<'a>(
        &mut self,
        input: &BackendInput<'a>,
    ) -> Result<Box<dyn CompiledUnit + 'a>, BackendError> {
        Ok(Box::new(Evaluator::new(input)?))
    }
}

pub struct Evaluator<'a> {
    prog: &'a TypedProgram,
    graph: &'a NodeGraph,
    globals: Vec<Place>,
    /// External data slots: contents, samples, channels.
    external: Vec<(Place, usize, usize)>,
    voice: Option<usize>,
    stack: Vec<Activation>,
    /// Nodes driven by `process_node`, by name.
    instances: HashMap<String, (Type, Place)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(input: &BackendInput<'a>) -> EvalResult<Self> {
        let prog = input.program;
        log_flags(input.flags);
        let mut ev = Evaluator {
            prog,
            graph: input.graph,
            globals: Vec::with_capacity(prog.globals.len()),
            external: input.external.iter().map(external_storage).collect(),
            voice: None,
            stack: Vec::new(),
            instances: HashMap::new(),
        };
        for g in &prog.globals {
            let v = ev.default_val(&g.ty);
            ev.globals.push(Place::temp(v));
        }
        ev.stack.push(Activation::detached(None));
        let result = ev.init_globals();
        ev.stack.clear();
        result?;
        debug!(globals = prog.globals.len(), "evaluator ready");
        Ok(ev)
    }

    fn init_globals(&mut self) -> EvalResult<()> {
        let prog = self.prog;
        for (i, g) in prog.globals.iter().enumerate() {
            let p = self.globals[i].clone();
            match (&g.value, &g.init) {
                (Some(c), _) => p.write(Val::Scalar(*c))?,
                (None, Some(init)) => self.init_into(&p, init)?,
                (None, None) => self.default_into(&p, &g.ty)?,
            }
        }
        Ok(())
    }

    // ── Activations ──────────────────────────────────────────────────────

    fn top(&mut self) -> EvalResult<&mut Activation> {
        self.stack.last_mut().ok_or_else(|| fault("no active call"))
    }

    fn local(&self, id: LocalId) -> EvalResult<Place> {
        self.stack
            .last()
            .and_then(|a| a.locals.get(id.index()).cloned().flatten())
            .ok_or_else(|| fault(format!("local {} is not bound", id.index())))
    }

    fn set_local(&mut self, id: LocalId, p: Place) -> EvalResult<()> {
        let top = self.top()?;
        match top.locals.get_mut(id.index()) {
            Some(slot) => {
                *slot = Some(p);
                Ok(())
            }
            None => Err(fault(format!("local {} out of range", id.index()))),
        }
    }

    /// New storage owned by the current call.
    fn own(&mut self, v: Val) -> EvalResult<Place> {
        let (p, root) = Place::root(v);
        self.top()?.owned.push(root);
        Ok(p)
    }

    fn this(&self) -> EvalResult<Place> {
        self.stack
            .last()
            .and_then(|a| a.this.clone())
            .ok_or_else(|| fault("`this` outside a method"))
    }

    fn invoke(&mut self, fid: FunctionId, this: Option<Place>, args: Vec<Arg>) -> EvalResult<Ret> {
        let prog = self.prog;
        let f = prog.function(fid);
        let Some(body) = &f.body else {
            return Err(BackendError::Unsupported(format!("{} has no body", f.name)));
        };
        if self.stack.len() >= MAX_DEPTH {
            return Err(BackendError::StackOverflow(f.name.clone()));
        }
        trace!(function = %f.name, "call");
        let mut act = Activation {
            func: Some(fid),
            locals: vec![None; f.locals.len()],
            this,
            ret_ref: f.ret.is_ref,
            owned: Vec::new(),
        };
        for (p, a) in f.params.iter().zip(args) {
            let place = match (p.ty.is_ref, a) {
                (true, Arg::Place(pl)) => pl,
                (true, Arg::Value(v)) => Place::temp(v),
                (false, a) => {
                    let (pl, root) = Place::root(a.read()?);
                    act.owned.push(root);
                    pl
                }
            };
            if let Some(slot) = act.locals.get_mut(p.local.index()) {
                *slot = Some(place);
            }
        }
        self.stack.push(act);
        let result = self.run_body(body, &f.exit_cleanup);
        if let Some(act) = self.stack.pop() {
            for root in act.owned {
                root.alive.set(false);
            }
        }
        result
    }

    fn run_body(&mut self, body: &TBlock, exit: &[LocalId]) -> EvalResult<Ret> {
        let ret = match self.block(body)? {
            Flow::Return(r) => r,
            _ => Ret::Value(Val::Void),
        };
        self.cleanup(exit)?;
        Ok(ret)
    }

    fn args(&mut self, args: &[TArg]) -> EvalResult<Vec<Arg>> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            out.push(if a.by_ref {
                Arg::Place(self.place_or_temp(&a.expr)?)
            } else {
                Arg::Value(self.value(&a.expr)?)
            });
        }
        Ok(out)
    }

    // ── Lifetimes ────────────────────────────────────────────────────────

    fn cleanup(&mut self, ids: &[LocalId]) -> EvalResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let prog = self.prog;
        let func = self
            .stack
            .last()
            .and_then(|a| a.func)
            .ok_or_else(|| fault("cleanup outside a call"))?;
        for id in ids {
            let ty = &prog.function(func).locals[id.index()].ty;
            let p = self.local(*id)?;
            self.destroy(&p, ty)?;
        }
        Ok(())
    }

    /// Destructor body first, then members in reverse order.
    fn destroy(&mut self, p: &Place, ty: &Type) -> EvalResult<()> {
        let prog = self.prog;
        match ty {
            Type::Struct(sid) => {
                let s = prog.struct_info(*sid);
                if let Some(d) = s.dtor {
                    self.invoke(d, Some(p.clone()), Vec::new())?;
                }
                for (i, f) in s.fields.iter().enumerate().rev() {
                    if prog.needs_drop(&f.ty) {
                        self.destroy(&p.child(i), &f.ty)?;
                    }
                }
            }
            Type::Span(t, n) | Type::PolyData(t, n) if prog.needs_drop(t) => {
                for i in (0..*n).rev() {
                    self.destroy(&p.child(i), t)?;
                }
            }
            Type::Node(n) => {
                for (i, t) in n.storage().iter().enumerate().rev() {
                    if prog.needs_drop(t) {
                        self.destroy(&p.child(i), t)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ── Construction ─────────────────────────────────────────────────────

    /// Zero value of `ty`, without running any initializer.
    fn default_val(&self, ty: &Type) -> Val {
        match ty {
            Type::Void | Type::Identity => Val::Void,
            Type::Int | Type::Enum(_) => Val::Scalar(ConstValue::Int(0)),
            Type::Float => Val::Scalar(ConstValue::Float(0.0)),
            Type::Double => Val::Scalar(ConstValue::Double(0.0)),
            Type::Bool => Val::Scalar(ConstValue::Bool(false)),
            Type::Struct(sid) => Val::Agg(
                self.prog
                    .struct_info(*sid)
                    .fields
                    .iter()
                    .map(|f| self.default_val(&f.ty))
                    .collect(),
            ),
            Type::Span(t, n) | Type::PolyData(t, n) => Val::Agg(vec![self.default_val(t); *n]),
            Type::Dyn(_) => Val::View(View::empty()),
            Type::Index(it) if it.is_float() => Val::FloatIndex(0.0),
            Type::Index(_) => Val::Index(0, LoopRange::default()),
            Type::Node(n) => Val::Agg(n.storage().iter().map(|t| self.default_val(t)).collect()),
            Type::Param(p) => param_default(p),
            Type::ProcessData(c) => Val::Process(ProcessState::empty(*c)),
            Type::FrameData(c) => Val::Frame(Box::new(FrameState::new(&ProcessState::empty(*c)))),
            Type::Event => Val::Event(empty_event()),
            Type::PrepareSpecs => specs_val(PrepareSpecs::default()),
            Type::ExternalData => Val::Agg(vec![
                Val::Scalar(ConstValue::Int(0)),
                Val::Scalar(ConstValue::Int(0)),
                Val::Ref(None),
            ]),
        }
    }

    /// Full default construction, including default constructors.
    fn default_into(&mut self, p: &Place, ty: &Type) -> EvalResult<()> {
        p.write(self.default_val(ty))?;
        self.construct_children(p, ty)
    }

    fn construct_children(&mut self, p: &Place, ty: &Type) -> EvalResult<()> {
        match ty {
            Type::Struct(sid) => {
                self.field_defaults(p, *sid)?;
                if let Some(ctor) = self.default_ctor(*sid) {
                    let args = self.default_args(ctor)?;
                    self.invoke(ctor, Some(p.clone()), args)?;
                }
                Ok(())
            }
            Type::Span(t, n) | Type::PolyData(t, n) => {
                if matches!(**t, Type::Struct(_) | Type::Node(_) | Type::Span(..)) {
                    for i in 0..*n {
                        self.construct_children(&p.child(i), t)?;
                    }
                }
                Ok(())
            }
            Type::Node(node) => {
                let init_wrapper = matches!(**node, NodeType::Init { .. });
                for (i, t) in node.storage().iter().enumerate() {
                    if init_wrapper && i == 1 {
                        if let Type::Struct(iid) = t {
                            self.field_defaults(&p.child(1), *iid)?;
                        }
                        continue;
                    }
                    self.construct_children(&p.child(i), t)?;
                }
                self.construct_initialiser(p, node)
            }
            _ => Ok(()),
        }
    }

    /// Member default initializers, evaluated with `this` bound.
    fn field_defaults(&mut self, p: &Place, sid: StructId) -> EvalResult<()> {
        let prog = self.prog;
        let fields = &prog.struct_info(sid).fields;
        for i in 0..fields.len() {
            self.field_default(p, fields, i)?;
        }
        Ok(())
    }

    fn field_default(&mut self, p: &Place, fields: &[FieldInfo], i: usize) -> EvalResult<()> {
        let target = p.child(i);
        match &fields[i].default {
            Some(init) => {
                self.stack.push(Activation::detached(Some(p.clone())));
                let r = self.init_into(&target, init);
                self.stack.pop();
                r
            }
            None => self.default_into(&target, &fields[i].ty),
        }
    }

    fn default_ctor(&self, sid: StructId) -> Option<FunctionId> {
        let prog = self.prog;
        prog.struct_info(sid).ctors.iter().copied().find(|f| {
            prog.function(*f)
                .params
                .iter()
                .all(|p| p.default.is_some())
        })
    }

    fn default_args(&mut self, fid: FunctionId) -> EvalResult<Vec<Arg>> {
        let prog = self.prog;
        let mut out = Vec::new();
        for p in &prog.function(fid).params {
            let Some(d) = &p.default else {
                return Err(fault(format!("{} has no default", p.name)));
            };
            out.push(Arg::Value(self.value(d)?));
        }
        Ok(out)
    }

    /// `wrap::init<N, I>`: construct `I` from the freshly built `N`.
    fn construct_initialiser(&mut self, p: &Place, node: &NodeType) -> EvalResult<()> {
        let NodeType::Init {
            inner,
            initialiser: Type::Struct(iid),
        } = node
        else {
            return Ok(());
        };
        let prog = self.prog;
        let ctor = prog.struct_info(*iid).ctors.iter().copied().find(|f| {
            let f = prog.function(*f);
            f.params.len() == 1 && f.params[0].ty.ty == *inner && f.params[0].ty.is_ref
        });
        if let Some(ctor) = ctor {
            self.invoke(ctor, Some(p.child(1)), vec![Arg::Place(p.child(0))])?;
        }
        Ok(())
    }

    fn init_into(&mut self, p: &Place, init: &TInit) -> EvalResult<()> {
        let prog = self.prog;
        match init {
            TInit::Default(ty) => self.default_into(p, ty),
            TInit::Expr(e) => {
                let v = self.value(e)?;
                p.write(v)
            }
            TInit::Ctor { ty, func, args } => {
                let args = self.args(args)?;
                p.write(self.default_val(ty))?;
                if let Type::Struct(sid) = ty {
                    self.field_defaults(p, *sid)?;
                }
                self.invoke(*func, Some(p.clone()), args)?;
                Ok(())
            }
            TInit::List { ty, items } => {
                p.write(self.default_val(ty))?;
                match ty {
                    Type::Struct(sid) => {
                        let fields = &prog.struct_info(*sid).fields;
                        for i in 0..fields.len() {
                            match items.get(i) {
                                Some(item) => self.init_into(&p.child(i), item)?,
                                None => self.field_default(p, fields, i)?,
                            }
                        }
                        Ok(())
                    }
                    Type::Node(node) => {
                        for (i, item) in items.iter().enumerate() {
                            self.init_into(&p.child(i), item)?;
                        }
                        self.construct_initialiser(p, node)
                    }
                    _ => {
                        for (i, item) in items.iter().enumerate() {
                            self.init_into(&p.child(i), item)?;
                        }
                        Ok(())
                    }
                }
            }
            TInit::Splat { ty, item } => {
                p.write(self.default_val(ty))?;
                let n = match ty {
                    Type::Span(_, n) | Type::PolyData(_, n) => *n,
                    _ => 0,
                };
                for i in 0..n {
                    self.init_into(&p.child(i), item)?;
                }
                Ok(())
            }
        }
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn block(&mut self, b: &TBlock) -> EvalResult<Flow> {
        for s in &b.stmts {
            let flow = self.stmt(s)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        self.cleanup(&b.cleanup)?;
        Ok(Flow::Normal)
    }

    fn stmt(&mut self, s: &TStmt) -> EvalResult<Flow> {
        match s {
            TStmt::Let { local, init } => {
                let p = match init {
                    LetInit::Value(init) => {
                        let p = self.own(Val::Void)?;
                        self.init_into(&p, init)?;
                        p
                    }
                    LetInit::Ref(e) => self.place(e)?,
                };
                self.set_local(*local, p)?;
                Ok(Flow::Normal)
            }
            TStmt::Expr(e) => {
                self.value(e)?;
                Ok(Flow::Normal)
            }
            TStmt::If { cond, then, els } => {
                if self.value(cond)?.truthy()? {
                    self.stmt(then)
                } else if let Some(e) = els {
                    self.stmt(e)
                } else {
                    Ok(Flow::Normal)
                }
            }
            TStmt::While { cond, body } => {
                while self.value(cond)?.truthy()? {
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(r) => return Ok(Flow::Return(r)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            TStmt::For { cond, step, body } => {
                loop {
                    if let Some(c) = cond {
                        if !self.value(c)?.truthy()? {
                            break;
                        }
                    }
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return(r) => return Ok(Flow::Return(r)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(s) = step {
                        self.value(s)?;
                    }
                }
                Ok(Flow::Normal)
            }
            TStmt::RangeFor {
                local,
                by_ref,
                range,
                body,
                cleanup,
            } => self.range_for(*local, *by_ref, range, body, cleanup),
            TStmt::Break(c) => {
                self.cleanup(c)?;
                Ok(Flow::Break)
            }
            TStmt::Continue(c) => {
                self.cleanup(c)?;
                Ok(Flow::Continue)
            }
            TStmt::Return(value, c) => {
                let ret = match value {
                    None => Ret::Value(Val::Void),
                    Some(e) if self.top()?.ret_ref => Ret::Place(self.place(e)?),
                    Some(e) => Ret::Value(self.value(e)?),
                };
                self.cleanup(c)?;
                Ok(Flow::Return(ret))
            }
            TStmt::Block(b) => self.block(b),
        }
    }

    fn range_for(
        &mut self,
        local: LocalId,
        by_ref: bool,
        range: &TExpr,
        body: &TStmt,
        cleanup: &[LocalId],
    ) -> EvalResult<Flow> {
        let items: Vec<Place> = match &range.ty {
            Type::Span(_, n) => {
                let base = self.place_or_temp(range)?;
                (0..*n).map(|i| base.child(i)).collect()
            }
            Type::Dyn(_) => {
                let view = self.value(range)?.view()?;
                (0..view.len).map(|i| view.elem(i)).collect()
            }
            Type::ProcessData(_) => {
                let pd = self.value(range)?.process()?;
                (0..pd.channels)
                    .map(|c| Place::temp(Val::View(pd.channel(c))))
                    .collect()
            }
            Type::PolyData(_, n) => {
                let base = self.place_or_temp(range)?;
                match self.voice {
                    Some(v) if v < *n => vec![base.child(v)],
                    _ => (0..*n).map(|i| base.child(i)).collect(),
                }
            }
            other => return Err(fault(format!("can't iterate {:?}", other))),
        };
        for item in items {
            let slot = if by_ref {
                item
            } else {
                let v = item.read()?;
                self.own(v)?
            };
            self.set_local(local, slot)?;
            match self.stmt(body)? {
                Flow::Break => {
                    self.cleanup(cleanup)?;
                    break;
                }
                Flow::Return(r) => return Ok(Flow::Return(r)),
                Flow::Normal | Flow::Continue => self.cleanup(cleanup)?,
            }
        }
        Ok(Flow::Normal)
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn place_or_temp(&mut self, e: &TExpr) -> EvalResult<Place> {
        if e.lvalue {
            self.place(e)
        } else {
            Ok(Place::temp(self.value(e)?))
        }
    }

    fn place(&mut self, e: &TExpr) -> EvalResult<Place> {
        match &e.kind {
            TExprKind::Local(l) => self.local(*l),
            TExprKind::Global(g) => self
                .globals
                .get(g.index())
                .cloned()
                .ok_or_else(|| fault("unknown global")),
            TExprKind::This => self.this(),
            TExprKind::Unary {
                op: UnOp::Deref,
                expr,
            } => self.place(expr),
            TExprKind::Field { object, index } => Ok(self.place_or_temp(object)?.child(*index)),
            TExprKind::Elem {
                object,
                index,
                access,
            } if !matches!(access, Access::Index(it) if it.is_interp()) => {
                self.elem_place(object, index, access)
            }
            TExprKind::Call { func, this, args } => {
                Ok(self.call_expr(*func, this.as_deref(), args)?.into_place())
            }
            TExprKind::Builtin { op, this, args } => {
                Ok(self.builtin(*op, this.as_deref(), args, &e.ty)?.into_place())
            }
            TExprKind::Ternary { cond, then, els } => {
                if self.value(cond)?.truthy()? {
                    self.place(then)
                } else {
                    self.place(els)
                }
            }
            _ if e.lvalue => Err(fault("lvalue without a place")),
            _ => Ok(Place::temp(self.value(e)?)),
        }
    }

    fn value(&mut self, e: &TExpr) -> EvalResult<Val> {
        if e.lvalue {
            return self.place(e)?.read();
        }
        match &e.kind {
            TExprKind::Const(c) => Ok(Val::Scalar(*c)),
            TExprKind::Local(_) | TExprKind::Global(_) | TExprKind::This => self.place(e)?.read(),
            TExprKind::Field { object, index } => self
                .value(object)?
                .child(*index)
                .cloned()
                .ok_or_else(|| fault("field of a non-aggregate")),
            TExprKind::Elem {
                object,
                index,
                access,
            } => self.elem_value(object, index, access, &e.ty),
            TExprKind::Call { func, this, args } => {
                self.call_expr(*func, this.as_deref(), args)?.into_value()
            }
            TExprKind::Builtin { op, this, args } => {
                self.builtin(*op, this.as_deref(), args, &e.ty)?.into_value()
            }
            TExprKind::Construct(init) => {
                let p = Place::temp(Val::Void);
                self.init_into(&p, init)?;
                p.read()
            }
            TExprKind::Convert(x) => self.convert(x, &e.ty),
            TExprKind::Unary {
                op: UnOp::Deref,
                expr,
            } => self.place(expr)?.read(),
            TExprKind::Unary { op, expr } => Ok(Val::Scalar(self.value(expr)?.scalar()?.unary(*op)?)),
            TExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            TExprKind::Assign { target, value } => self.assign(target, value),
            TExprKind::Compound { op, target, value } => self.compound(*op, target, value),
            TExprKind::IncDec {
                target,
                inc,
                prefix,
            } => self.incdec(target, *inc, *prefix),
            TExprKind::Ternary { cond, then, els } => {
                if self.value(cond)?.truthy()? {
                    self.value(then)
                } else {
                    self.value(els)
                }
            }
        }
    }

    fn call_expr(
        &mut self,
        func: FunctionId,
        this: Option<&TExpr>,
        args: &[TArg],
    ) -> EvalResult<Ret> {
        let this = match this {
            Some(t) => Some(self.place_or_temp(t)?),
            None => None,
        };
        let args = self.args(args)?;
        self.invoke(func, this, args)
    }

    /// Elements of a span, dyn or frame as a view.
    fn container_view(&mut self, object: &TExpr) -> EvalResult<View> {
        match &object.ty {
            Type::Span(_, n) => Ok(View::over(self.place_or_temp(object)?, *n)),
            Type::FrameData(c) => Ok(View::over(self.place_or_temp(object)?.child(0), *c)),
            Type::Dyn(_) => self.value(object)?.view(),
            other => Err(fault(format!("subscript on {:?}", other))),
        }
    }

    fn elem_place(&mut self, object: &TExpr, index: &TExpr, access: &Access) -> EvalResult<Place> {
        let view = self.container_view(object)?;
        let raw = self.value(index)?;
        let slot = match access {
            Access::Const => {
                let i = raw.int()?;
                if i < 0 || i as usize >= view.len {
                    return Err(BackendError::OutOfRange {
                        index: i as i64,
                        size: view.len,
                    });
                }
                i as usize
            }
            Access::Index(it) => resolve_slot(it, &raw, view.len, 0)?,
        };
        Ok(view.elem(slot))
    }

    fn elem_value(
        &mut self,
        object: &TExpr,
        index: &TExpr,
        access: &Access,
        ty: &Type,
    ) -> EvalResult<Val> {
        let Access::Index(IndexType::Interp { hermite: cubic, base }) = access else {
            return self.elem_place(object, index, access)?.read();
        };
        let view = self.container_view(object)?;
        let raw = self.value(index)?;
        let pos = position(base, &raw, view.len)?;
        let alpha = pos - pos.floor();
        let at = |d: i32| -> EvalResult<f64> {
            let s = resolve_slot(base, &raw, view.len, d)?;
            view.elem(s).read()?.f64()
        };
        let r = if *cubic {
            hermite(at(-1)?, at(0)?, at(1)?, at(2)?, alpha)
        } else {
            lerp(at(0)?, at(1)?, alpha)
        };
        cast(ConstValue::Double(r), ty)
    }

    fn convert(&mut self, x: &TExpr, to: &Type) -> EvalResult<Val> {
        match (&x.ty, to) {
            (Type::Span(_, n), Type::Dyn(_)) => Ok(Val::View(View::over(self.place_or_temp(x)?, *n))),
            (Type::Dyn(_), Type::Dyn(_)) | (Type::Index(_), Type::Index(_)) => self.value(x),
            (Type::Index(it), t) => {
                let raw = self.value(x)?;
                let native = match it {
                    IndexType::Int {
                        policy: Policy::Unsafe,
                        ..
                    } => ConstValue::Int(raw.int()?),
                    IndexType::Int { bound: 0, .. } => ConstValue::Int(raw.int()?),
                    IndexType::Int { bound, .. } => {
                        ConstValue::Int(resolve_slot(it, &raw, *bound, 0)? as i32)
                    }
                    _ => ConstValue::Double(raw.f64()?),
                };
                cast(native, t)
            }
            (_, Type::Index(it)) => {
                let c = self.value(x)?.scalar()?;
                Ok(if it.is_float() {
                    Val::FloatIndex(c.as_f64())
                } else {
                    Val::Index(Val::Scalar(c).int()?, LoopRange::default())
                })
            }
            (_, t) => {
                let c = self.value(x)?.scalar()?;
                cast(c, t)
            }
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &TExpr, rhs: &TExpr) -> EvalResult<Val> {
        match op {
            BinOp::And => {
                let r = self.value(lhs)?.truthy()? && self.value(rhs)?.truthy()?;
                return Ok(Val::Scalar(ConstValue::Bool(r)));
            }
            BinOp::Or => {
                let r = self.value(lhs)?.truthy()? || self.value(rhs)?.truthy()?;
                return Ok(Val::Scalar(ConstValue::Bool(r)));
            }
            _ => {}
        }
        let l = self.value(lhs)?;
        let r = self.value(rhs)?;
        if let Val::Index(v, range) = l {
            let d = r.int()?;
            let moved = if op == BinOp::Sub {
                v.wrapping_sub(d)
            } else {
                v.wrapping_add(d)
            };
            return Ok(Val::Index(moved, range));
        }
        Ok(Val::Scalar(ConstValue::binary(op, l.scalar()?, r.scalar()?)?))
    }

    fn assign(&mut self, target: &TExpr, value: &TExpr) -> EvalResult<Val> {
        let v = self.value(value)?;
        let p = self.place(target)?;
        let v = match (&target.ty, v) {
            (Type::Index(_), Val::Index(nv, r)) if r.is_unset() => match p.read()? {
                Val::Index(_, old) => Val::Index(nv, old),
                _ => Val::Index(nv, r),
            },
            (_, v) => v,
        };
        p.write(v.clone())?;
        Ok(v)
    }

    fn compound(&mut self, op: BinOp, target: &TExpr, value: &TExpr) -> EvalResult<Val> {
        let rhs = self.value(value)?;
        let p = self.place(target)?;
        match &target.ty {
            Type::Index(_) => {
                let Val::Index(v, range) = p.read()? else {
                    return Err(fault("index compound on a non-index"));
                };
                let d = rhs.int()?;
                let moved = if op == BinOp::Sub {
                    v.wrapping_sub(d)
                } else {
                    v.wrapping_add(d)
                };
                let new = Val::Index(moved, range);
                p.write(new.clone())?;
                Ok(new)
            }
            Type::Span(..) | Type::Dyn(..) => {
                let mut targets = Vec::new();
                leaf_places(&p, &target.ty, &mut targets)?;
                let mut values = Vec::new();
                leaf_values(&rhs, &value.ty, &mut values)?;
                if values.is_empty() {
                    return Ok(Val::Void);
                }
                for (k, t) in targets.iter().enumerate() {
                    let cur = t.read()?.scalar()?;
                    let r = values[k % values.len()];
                    let r = r.convert(&cur.ty()).unwrap_or(r);
                    t.write(Val::Scalar(ConstValue::binary(op, cur, r)?))?;
                }
                Ok(Val::Void)
            }
            _ => {
                let cur = p.read()?.scalar()?;
                let new = Val::Scalar(ConstValue::binary(op, cur, rhs.scalar()?)?);
                p.write(new.clone())?;
                Ok(new)
            }
        }
    }

    fn incdec(&mut self, target: &TExpr, inc: bool, prefix: bool) -> EvalResult<Val> {
        let p = self.place(target)?;
        let old = p.read()?;
        let new = match &old {
            Val::Index(v, r) => Val::Index(if inc { v.wrapping_add(1) } else { v.wrapping_sub(1) }, *r),
            Val::FloatIndex(x) => Val::FloatIndex(if inc { x + 1.0 } else { x - 1.0 }),
            other => {
                let c = other.scalar()?;
                let one = ConstValue::Int(1).convert(&c.ty()).unwrap_or(ConstValue::Int(1));
                let op = if inc { BinOp::Add } else { BinOp::Sub };
                Val::Scalar(ConstValue::binary(op, c, one)?)
            }
        };
        p.write(new.clone())?;
        Ok(if prefix { new } else { old })
    }

    // ── Builtins ─────────────────────────────────────────────────────────

    fn this_place(&mut self, this: Option<&TExpr>) -> EvalResult<Place> {
        match this {
            Some(t) => self.place_or_temp(t),
            None => Err(fault("builtin method without an object")),
        }
    }

    fn arg_int(&mut self, args: &[TArg], i: usize) -> EvalResult<i32> {
        match args.get(i) {
            Some(a) => self.value(&a.expr)?.int(),
            None => Err(fault(format!("missing builtin argument {}", i))),
        }
    }

    fn process_of(&mut self, this: Option<&TExpr>) -> EvalResult<ProcessState> {
        self.this_place(this)?.read()?.process()
    }

    fn builtin(
        &mut self,
        op: BuiltinOp,
        this: Option<&TExpr>,
        args: &[TArg],
        ty: &Type,
    ) -> EvalResult<Ret> {
        let int = |v: usize| Ok(Ret::Value(Val::Scalar(ConstValue::Int(v as i32))));
        let boolean = |b: bool| Ok(Ret::Value(Val::Scalar(ConstValue::Bool(b))));
        let void = || Ok(Ret::Value(Val::Void));
        let object_ty = this.map(|t| t.ty.clone()).unwrap_or(Type::Void);
        match op {
            BuiltinOp::Size => {
                let t = this.ok_or_else(|| fault("size() without an object"))?;
                int(self.container_view(t)?.len)
            }
            BuiltinOp::IsSimdable => {
                let t = this.ok_or_else(|| fault("isSimdable() without an object"))?;
                boolean(self.container_view(t)?.is_simdable())
            }
            BuiltinOp::ToSimd => {
                let t = this.ok_or_else(|| fault("toSimd() without an object"))?;
                Ok(Ret::Value(Val::View(self.container_view(t)?.simd())))
            }
            BuiltinOp::ReferTo => {
                let target = self.this_place(this)?;
                let src = match args.first() {
                    Some(a) => self.container_view(&a.expr)?,
                    None => return Err(fault("referTo() without a source")),
                };
                let size = match args.get(1) {
                    Some(_) => Some(self.arg_int(args, 1)?),
                    None => None,
                };
                let offset = match args.get(2) {
                    Some(_) => self.arg_int(args, 2)?,
                    None => 0,
                };
                target.write(Val::View(src.sub(offset, size)?))?;
                void()
            }
            BuiltinOp::Slice => {
                let src = match args.first() {
                    Some(a) => self.container_view(&a.expr)?,
                    None => return Err(fault("slice() without a source")),
                };
                let offset = self.arg_int(args, 1)?;
                let len = self.arg_int(args, 2)?;
                Ok(Ret::Value(Val::View(src.sub(offset, Some(len))?)))
            }
            BuiltinOp::SetLoopRange => {
                let p = self.this_place(this)?;
                let lo = self.arg_int(args, 0)?;
                let hi = self.arg_int(args, 1)?;
                match p.read()? {
                    Val::Index(v, _) => p.write(Val::Index(v, LoopRange::new(lo, hi)))?,
                    other => return Err(fault(format!("setLoopRange on {:?}", other))),
                }
                void()
            }
            BuiltinOp::NumChannels => int(self.process_of(this)?.channels),
            BuiltinOp::NumSamples => int(self.process_of(this)?.samples),
            BuiltinOp::ChannelData => {
                let pd = self.process_of(this)?;
                let ch = self.arg_int(args, 0)?;
                if ch < 0 || ch as usize >= pd.channels {
                    return Err(BackendError::OutOfRange {
                        index: ch as i64,
                        size: pd.channels,
                    });
                }
                Ok(Ret::Value(Val::View(pd.channel(ch as usize))))
            }
            BuiltinOp::EventData => {
                let pd = self.process_of(this)?;
                Ok(Ret::Value(Val::View(View::over(pd.events, pd.num_events))))
            }
            BuiltinOp::FrameData => {
                let pd = self.process_of(this)?;
                Ok(Ret::Value(Val::Frame(Box::new(FrameState::new(&pd)))))
            }
            BuiltinOp::FrameNext => {
                let p = self.this_place(this)?;
                boolean(frame_next(&p)?)
            }
            BuiltinOp::FrameSpan => Ok(Ret::Place(self.this_place(this)?.child(0))),
            BuiltinOp::EventGet(f) => {
                let e = self.this_place(this)?.read()?.event()?;
                Ok(Ret::Value(Val::Scalar(ConstValue::Int(event_field(&e, f)))))
            }
            BuiltinOp::EventSet(f) => {
                let p = self.this_place(this)?;
                let v = self.arg_int(args, 0)?;
                let mut e = p.read()?.event()?;
                set_event_field(&mut e, f, v);
                p.write(Val::Event(e))?;
                void()
            }
            BuiltinOp::EventIs(k) => {
                let e = self.this_place(this)?.read()?.event()?;
                boolean(event_is(&e, k))
            }
            BuiltinOp::ReferBlockTo => {
                let ext = self.this_place(this)?.read()?;
                let target = match args.first() {
                    Some(a) => self.place(&a.expr)?,
                    None => return Err(fault("referBlockTo() without a target")),
                };
                let ch = self.arg_int(args, 1)?;
                let (samples, channels, data) = match ext {
                    Val::Agg(items) => match items.as_slice() {
                        [n, c, Val::Ref(data)] => (n.int()?, c.int()?, data.clone()),
                        _ => return Err(fault("malformed external data")),
                    },
                    _ => return Err(fault("malformed external data")),
                };
                let Some(data) = data.filter(|_| ch >= 0 && ch < channels) else {
                    return Err(BackendError::OutOfRange {
                        index: ch as i64,
                        size: channels.max(0) as usize,
                    });
                };
                target.write(Val::View(View::over(data.child(ch as usize), samples as usize)))?;
                void()
            }
            BuiltinOp::PolyGet => {
                let p = self.this_place(this)?;
                Ok(Ret::Place(p.child(self.voice.unwrap_or(0))))
            }
            BuiltinOp::Node(nop) => {
                let p = self.this_place(this)?;
                let args = self.args(args)?;
                self.node_call(&object_ty, &p, nop, args)?;
                void()
            }
            BuiltinOp::Get(i) => Ok(Ret::Place(self.this_place(this)?.child(i + 1))),
            BuiltinOp::GetObject => {
                let p = self.this_place(this)?;
                let slot = match &object_ty {
                    Type::Node(n) => n.inner().map(|(_, s)| s),
                    _ => None,
                };
                let slot = slot.ok_or_else(|| fault("getObject() on a non-wrapper"))?;
                Ok(Ret::Place(p.child(slot)))
            }
            BuiltinOp::GetWrappedObject => {
                let p = self.this_place(this)?;
                Ok(Ret::Place(innermost(&object_ty, p).1))
            }
            BuiltinOp::GetParameter(index) => {
                let p = self.this_place(this)?.child(0);
                let list = matches!(
                    &object_ty,
                    Type::Node(n) if matches!(**n, NodeType::Chain { params: ParamType::List(_), .. })
                );
                Ok(Ret::Place(match (list, index) {
                    (true, Some(i)) => p.child(i),
                    _ => p,
                }))
            }
            BuiltinOp::Connect(i) => {
                let Type::Param(spec) = &object_ty else {
                    return Err(fault("connect() on a non-parameter"));
                };
                let (path, _) = spec
                    .leaf(i)
                    .ok_or_else(|| fault(format!("no connection {}", i)))?;
                let mut slot = self.this_place(this)?;
                for k in path {
                    slot = slot.child(k);
                }
                let target = match args.first() {
                    Some(a) => self.place(&a.expr)?,
                    None => return Err(fault("connect() without a target")),
                };
                slot.write(Val::Ref(Some(target)))?;
                void()
            }
            BuiltinOp::ParamCall(index) => {
                let Type::Param(spec) = &object_ty else {
                    return Err(fault("call() on a non-parameter"));
                };
                let p = self.this_place(this)?;
                let v = match args.first() {
                    Some(a) => self.value(&a.expr)?.f64()?,
                    None => return Err(fault("call() without a value")),
                };
                match (&**spec, index) {
                    (ParamType::List(items), Some(i)) => match items.get(i) {
                        Some(item) => self.route(item, &p.child(i), v)?,
                        None => return Err(fault(format!("no parameter {}", i))),
                    },
                    (spec, _) => self.route(spec, &p, v)?,
                }
                void()
            }
            BuiltinOp::Math(f) => {
                let mut xs = Vec::with_capacity(args.len());
                for a in args {
                    xs.push(self.value(&a.expr)?.f64()?);
                }
                Ok(Ret::Value(cast(ConstValue::Double(f.apply(&xs)), ty)?))
            }
        }
    }

    // ── Nodes ────────────────────────────────────────────────────────────

    /// Run callback `op` of the node of type `ty` stored at `p`.
    fn node_call(&mut self, ty: &Type, p: &Place, op: NodeOp, args: Vec<Arg>) -> EvalResult<()> {
        let prog = self.prog;
        match ty {
            Type::Struct(sid) => {
                let s = prog.struct_info(*sid);
                let Some(m) = prog.nodes.get(sid) else {
                    return Err(fault(format!("{} is not a node", s.name)));
                };
                let fid = match op {
                    NodeOp::Reset => m.reset,
                    NodeOp::Prepare => m.prepare,
                    NodeOp::HandleEvent => m.handle_event,
                    NodeOp::SetParameter(i) => m.set_parameter.get(&i).copied(),
                    NodeOp::Process => {
                        let pd = first_arg(&args)?.process()?;
                        match m.process.get(&pd.channels) {
                            Some(f) => Some(*f),
                            None if m.process_frame.contains_key(&pd.channels) => {
                                return self.process_frames(ty, p, &pd);
                            }
                            None => {
                                return Err(BackendError::Unsupported(format!(
                                    "{}::process for {} channels",
                                    s.name, pd.channels
                                )))
                            }
                        }
                    }
                    NodeOp::ProcessFrame => {
                        let channels = match first_arg(&args)? {
                            Val::Agg(items) => items.len(),
                            _ => 0,
                        };
                        match m.process_frame.get(&channels) {
                            Some(f) => Some(*f),
                            None => {
                                return Err(BackendError::Unsupported(format!(
                                    "{}::processFrame for {} channels",
                                    s.name, channels
                                )))
                            }
                        }
                    }
                };
                if let Some(f) = fid {
                    self.invoke(f, Some(p.clone()), args)?;
                }
                Ok(())
            }
            Type::Node(node) => self.container_call(node, p, op, args),
            other => Err(fault(format!("{} is not a node", other.display(prog)))),
        }
    }

    fn container_call(
        &mut self,
        node: &NodeType,
        p: &Place,
        op: NodeOp,
        args: Vec<Arg>,
    ) -> EvalResult<()> {
        match node {
            NodeType::Chain { params, .. } if matches!(op, NodeOp::SetParameter(_)) => {
                let NodeOp::SetParameter(i) = op else {
                    return Ok(());
                };
                let v = first_arg(&args)?.f64()?;
                match (params, params.slot(i)) {
                    (ParamType::List(_), Some(item)) => self.route(item, &p.child(0).child(i), v),
                    (_, Some(spec)) => self.route(spec, &p.child(0), v),
                    (_, None) => Ok(()),
                }
            }
            NodeType::Chain {
                split: true, nodes, ..
            } if matches!(op, NodeOp::Process | NodeOp::ProcessFrame) => {
                let data = match (&op, args.first()) {
                    (NodeOp::Process, _) => first_arg(&args)?.process()?.data,
                    (_, Some(Arg::Place(frame))) => frame.clone(),
                    _ => return Err(fault("processFrame without a frame")),
                };
                let original = data.read()?;
                let mut sum = zeroed(&original);
                for (i, t) in nodes.iter().enumerate() {
                    data.write(original.clone())?;
                    self.node_call(t, &p.child(i + 1), op, args.clone())?;
                    mix(&mut sum, &data.read()?)?;
                }
                data.write(sum)
            }
            NodeType::Chain { nodes, .. } => {
                for (i, t) in nodes.iter().enumerate() {
                    self.node_call(t, &p.child(i + 1), op, args.clone())?;
                }
                Ok(())
            }
            NodeType::Fix { channels, inner } if op == NodeOp::Process => {
                let mut pd = first_arg(&args)?.process()?;
                if pd.channels > *channels {
                    pd.channels = *channels;
                }
                let pd = Place::temp(Val::Process(pd));
                self.node_call(inner, &p.child(0), op, vec![Arg::Place(pd)])
            }
            NodeType::Frame { inner, .. } if op == NodeOp::Process => {
                let pd = first_arg(&args)?.process()?;
                self.process_frames(inner, &p.child(0), &pd)
            }
            NodeType::Mod { param, .. } if matches!(op, NodeOp::SetParameter(i) if param.slot(i).is_some()) => {
                let v = first_arg(&args)?.f64()?;
                self.route(param, &p.child(0), v)
            }
            NodeType::Mod { param, inner } => {
                self.node_call(inner, &p.child(1), op, args)?;
                if matches!(op, NodeOp::Process | NodeOp::ProcessFrame) {
                    self.modulate(param, inner, p)?;
                }
                Ok(())
            }
            NodeType::Data { inner, slot } => {
                self.node_call(inner, &p.child(0), op, args)?;
                if op == NodeOp::Prepare {
                    self.bind_external(inner, &p.child(0), *slot)?;
                }
                Ok(())
            }
            NodeType::Fix { inner, .. }
            | NodeType::Frame { inner, .. }
            | NodeType::Event(inner)
            | NodeType::Init { inner, .. } => self.node_call(inner, &p.child(0), op, args),
        }
    }

    /// Drive `processFrame` once per sample of `pd`.
    fn process_frames(&mut self, ty: &Type, p: &Place, pd: &ProcessState) -> EvalResult<()> {
        for s in 0..pd.samples {
            let mut frame = Vec::with_capacity(pd.channels);
            for c in 0..pd.channels {
                frame.push(pd.sample(c, s).read()?);
            }
            let fp = Place::temp(Val::Agg(frame));
            self.node_call(ty, p, NodeOp::ProcessFrame, vec![Arg::Place(fp.clone())])?;
            for c in 0..pd.channels {
                pd.sample(c, s).write(fp.child(c).read()?)?;
            }
        }
        Ok(())
    }

    /// `wrap::mod`: forward the modulation value when the node reports one.
    fn modulate(&mut self, param: &ParamType, inner: &Type, p: &Place) -> EvalResult<()> {
        let prog = self.prog;
        let (ity, ip) = innermost(inner, p.child(1));
        let Type::Struct(sid) = ity else {
            return Ok(());
        };
        let Some(f) = prog.nodes.get(&sid).and_then(|m| m.handle_modulation) else {
            return Ok(());
        };
        let value = Place::temp(Val::Scalar(ConstValue::Double(0.0)));
        let changed = self
            .invoke(f, Some(ip), vec![Arg::Place(value.clone())])?
            .into_value()?;
        if changed.truthy()? {
            let v = value.read()?.f64()?;
            self.route(param, &p.child(0), v)?;
        }
        Ok(())
    }

    fn bind_external(&mut self, inner: &Type, p: &Place, slot: usize) -> EvalResult<()> {
        let prog = self.prog;
        let (ity, ip) = innermost(inner, p.clone());
        let Type::Struct(sid) = ity else {
            return Ok(());
        };
        let Some(f) = prog.nodes.get(&sid).and_then(|m| m.set_external_data) else {
            return Ok(());
        };
        let data = match self.external.get(slot) {
            Some((place, samples, channels)) => Val::Agg(vec![
                Val::Scalar(ConstValue::Int(*samples as i32)),
                Val::Scalar(ConstValue::Int(*channels as i32)),
                Val::Ref(Some(place.clone())),
            ]),
            None => self.default_val(&Type::ExternalData),
        };
        let mut args = vec![
            Arg::Value(data),
            Arg::Value(Val::Scalar(ConstValue::Int(slot as i32))),
        ];
        args.truncate(prog.function(f).params.len());
        self.invoke(f, Some(ip), args)?;
        Ok(())
    }

    // ── Parameters ───────────────────────────────────────────────────────

    /// Send `v` through `spec`, whose connection storage is at `p`.
    fn route(&mut self, spec: &ParamType, p: &Place, v: f64) -> EvalResult<()> {
        match spec {
            ParamType::Empty => Ok(()),
            ParamType::Plain { target, index } => self.send(spec, target, *index, p, v),
            ParamType::Expression {
                target,
                index,
                expr,
            } => {
                let v = self.transform(*expr, v)?;
                self.send(spec, target, *index, p, v)
            }
            ParamType::From0To1 {
                target,
                index,
                range,
            } => {
                let v = self.range(range, v)?;
                self.send(spec, target, *index, p, v)
            }
            ParamType::Chain { range, items } => {
                let v = self.range(range, v)?;
                for (k, item) in items.iter().enumerate() {
                    self.route(item, &p.child(k), v)?;
                }
                Ok(())
            }
            ParamType::List(items) => {
                for (k, item) in items.iter().enumerate() {
                    self.route(item, &p.child(k), v)?;
                }
                Ok(())
            }
        }
    }

    fn send(&mut self, spec: &ParamType, target: &Type, index: usize, p: &Place, v: f64) -> EvalResult<()> {
        match p.read()? {
            Val::Ref(Some(node)) => self.node_call(
                target,
                &node,
                NodeOp::SetParameter(index),
                vec![Arg::Value(Val::Scalar(ConstValue::Double(v)))],
            ),
            _ => Err(BackendError::Unconnected(
                Type::Param(Box::new(spec.clone())).display(self.prog),
            )),
        }
    }

    fn transform(&mut self, sid: StructId, v: f64) -> EvalResult<f64> {
        let f = self
            .prog
            .transforms
            .get(&sid)
            .copied()
            .ok_or_else(|| fault("missing transform"))?;
        let args = vec![Arg::Value(Val::Scalar(ConstValue::Double(v)))];
        self.invoke(f, None, args)?.into_value()?.f64()
    }

    fn range(&mut self, range: &Type, v: f64) -> EvalResult<f64> {
        match range {
            Type::Struct(sid) => self.transform(*sid, v),
            _ => Ok(v),
        }
    }

    // ── Boundary conversions ─────────────────────────────────────────────

    fn from_value(&self, v: &Value, ty: &Type) -> Option<Val> {
        let scalar = match v {
            Value::Int(i) => Some(ConstValue::Int(*i)),
            Value::Float(f) => Some(ConstValue::Float(*f)),
            Value::Double(d) => Some(ConstValue::Double(*d)),
            Value::Bool(b) => Some(ConstValue::Bool(*b)),
            _ => None,
        };
        match (ty, v) {
            (Type::Span(t, n), Value::List(items)) if items.len() == *n => items
                .iter()
                .map(|i| self.from_value(i, t))
                .collect::<Option<Vec<_>>>()
                .map(Val::Agg),
            (Type::Dyn(t), Value::List(items)) => {
                let elems = items
                    .iter()
                    .map(|i| self.from_value(i, t))
                    .collect::<Option<Vec<_>>>()?;
                let len = elems.len();
                Some(Val::View(View::over(Place::temp(Val::Agg(elems)), len)))
            }
            (Type::Index(it), _) if it.is_float() => Some(Val::FloatIndex(scalar?.as_f64())),
            (Type::Index(_), _) => Some(Val::Index(
                Val::Scalar(scalar?).int().ok()?,
                LoopRange::default(),
            )),
            (Type::Enum(_), _) => scalar?.convert(&Type::Int).map(Val::Scalar),
            (t, _) => scalar?.convert(t).map(Val::Scalar),
        }
    }

    fn to_value(&self, v: &Val) -> Value {
        match v {
            Val::Scalar(ConstValue::Int(i)) => Value::Int(*i),
            Val::Scalar(ConstValue::Float(f)) => Value::Float(*f),
            Val::Scalar(ConstValue::Double(d)) => Value::Double(*d),
            Val::Scalar(ConstValue::Bool(b)) => Value::Bool(*b),
            Val::Index(i, _) => Value::Int(*i),
            Val::FloatIndex(x) => Value::Double(*x),
            Val::Agg(items) => Value::List(items.iter().map(|i| self.to_value(i)).collect()),
            Val::View(view) => Value::List(
                (0..view.len)
                    .map(|i| {
                        view.elem(i)
                            .read()
                            .map(|v| self.to_value(&v))
                            .unwrap_or(Value::Void)
                    })
                    .collect(),
            ),
            _ => Value::Void,
        }
    }

    fn create_node(&mut self, name: &str, channels: usize, samples: usize) -> EvalResult<(Type, Place)> {
        let prog = self.prog;
        let ty = match &prog.entry {
            Some(e) if e.name == name => e.ty.clone(),
            _ => prog
                .types_by_name
                .get(name)
                .cloned()
                .ok_or_else(|| BackendError::UnknownNode(name.to_string()))?,
        };
        let node = Place::temp(Val::Void);
        self.stack.push(Activation::detached(None));
        let result = self.default_into(&node, &ty).and_then(|_| {
            let specs = PrepareSpecs {
                sample_rate: 44100.0,
                block_size: samples,
                num_channels: channels,
            };
            self.node_call(&ty, &node, NodeOp::Prepare, vec![Arg::Value(specs_val(specs))])?;
            self.node_call(&ty, &node, NodeOp::Reset, Vec::new())
        });
        self.stack.clear();
        result?;
        debug!(node = %name, channels, "node created");
        Ok((ty, node))
    }
}

impl CompiledUnit for Evaluator<'_> {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, BackendError> {
        let prog = self.prog;
        let fid = prog
            .functions_by_name
            .get(name)
            .and_then(|ids| {
                ids.iter().copied().find(|f| {
                    let f = prog.function(*f);
                    let required = f.params.iter().filter(|p| p.default.is_none()).count();
                    f.body.is_some() && args.len() >= required && args.len() <= f.params.len()
                })
            })
            .ok_or_else(|| BackendError::UnknownFunction(name.to_string()))?;
        let f = prog.function(fid);
        self.stack.clear();
        self.stack.push(Activation::detached(None));
        let mut values = Vec::with_capacity(f.params.len());
        for (i, p) in f.params.iter().enumerate() {
            let v = match (args.get(i), &p.default) {
                (Some(a), _) => self.from_value(a, &p.ty.ty).ok_or_else(|| BackendError::BadArguments {
                    name: name.to_string(),
                    message: format!("can't pass {} as {}", a, p.ty.ty.display(prog)),
                })?,
                (None, Some(d)) => self.value(d)?,
                (None, None) => {
                    return Err(BackendError::BadArguments {
                        name: name.to_string(),
                        message: format!("missing argument {}", p.name),
                    })
                }
            };
            values.push(if p.ty.is_ref {
                Arg::Place(Place::temp(v))
            } else {
                Arg::Value(v)
            });
        }
        let result = self.invoke(fid, None, values).and_then(Ret::into_value);
        self.stack.clear();
        Ok(self.to_value(&result?))
    }

    fn process_node(
        &mut self,
        name: &str,
        channels: &mut [Vec<f32>],
        events: &[HiseEvent],
    ) -> Result<(), BackendError> {
        if let Some(entry) = &self.graph.entry {
            if entry.name == name && entry.channels != channels.len() {
                return Err(BackendError::BadArguments {
                    name: name.to_string(),
                    message: format!(
                        "expected {} channels, got {}",
                        entry.channels,
                        channels.len()
                    ),
                });
            }
        }
        let samples = channels.iter().map(Vec::len).min().unwrap_or(0);
        let (ty, node) = match self.instances.get(name) {
            Some(found) => found.clone(),
            None => {
                let created = self.create_node(name, channels.len(), samples)?;
                self.instances.insert(name.to_string(), created.clone());
                created
            }
        };

        let data = Place::temp(Val::Agg(
            channels
                .iter()
                .map(|c| {
                    Val::Agg(
                        c[..samples]
                            .iter()
                            .map(|s| Val::Scalar(ConstValue::Float(*s)))
                            .collect(),
                    )
                })
                .collect(),
        ));
        let evs = Place::temp(Val::Agg(events.iter().map(|e| Val::Event(*e)).collect()));
        let pd = ProcessState {
            data: data.clone(),
            channels: channels.len(),
            samples,
            events: evs.clone(),
            num_events: events.len(),
        };

        self.stack.clear();
        self.stack.push(Activation::detached(None));
        let result = (|| {
            for k in 0..events.len() {
                self.node_call(&ty, &node, NodeOp::HandleEvent, vec![Arg::Place(evs.child(k))])?;
            }
            let pd = Place::temp(Val::Process(pd));
            self.node_call(&ty, &node, NodeOp::Process, vec![Arg::Place(pd)])
        })();
        self.stack.clear();
        result?;

        for (c, out) in channels.iter_mut().enumerate() {
            for (s, slot) in out.iter_mut().take(samples).enumerate() {
                *slot = data.child(c).child(s).read()?.f64()? as f32;
            }
        }
        Ok(())
    }

    fn set_voice_index(&mut self, voice: Option<usize>) {
        self.voice = voice;
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────

fn log_flags(flags: CompileFlags) {
    debug!(flags = ?flags.names(), "reference backend ignores optimisation flags");
}

fn external_storage(data: &ExternalData) -> (Place, usize, usize) {
    let channels = (0..data.num_channels())
        .filter_map(|c| data.channel(c))
        .map(|c| Val::Agg(c.iter().map(|s| Val::Scalar(ConstValue::Float(*s))).collect()))
        .collect();
    (Place::temp(Val::Agg(channels)), data.num_samples(), data.num_channels())
}

fn param_default(p: &ParamType) -> Val {
    match p {
        ParamType::Plain { .. } | ParamType::Expression { .. } | ParamType::From0To1 { .. } => {
            Val::Ref(None)
        }
        ParamType::Chain { items, .. } | ParamType::List(items) => {
            Val::Agg(items.iter().map(param_default).collect())
        }
        ParamType::Empty => Val::Void,
    }
}

fn cast(c: ConstValue, t: &Type) -> EvalResult<Val> {
    let target = match t {
        Type::Enum(_) => &Type::Int,
        t => t,
    };
    c.convert(target)
        .map(Val::Scalar)
        .ok_or_else(|| fault(format!("can't convert {} to {:?}", c, t)))
}

fn first_arg(args: &[Arg]) -> EvalResult<Val> {
    args.first()
        .ok_or_else(|| fault("missing callback argument"))?
        .read()
}

/// Descend through wrappers to the innermost node and its storage.
fn innermost(ty: &Type, p: Place) -> (Type, Place) {
    let mut ty = ty.clone();
    let mut p = p;
    loop {
        let next = match &ty {
            Type::Node(n) => n.inner().map(|(t, slot)| (t.clone(), slot)),
            _ => None,
        };
        match next {
            Some((t, slot)) => {
                p = p.child(slot);
                ty = t;
            }
            None => return (ty, p),
        }
    }
}

/// Advance a frame iterator: store the current frame back, load the next.
fn frame_next(p: &Place) -> EvalResult<bool> {
    let Val::Frame(mut st) = p.read()? else {
        return Err(fault("next() on a non-frame"));
    };
    if let (Some(i), Val::Agg(frame)) = (st.pos, &st.frame) {
        if i < st.samples {
            for (c, v) in frame.iter().enumerate().take(st.channels) {
                st.data.child(c).child(i).write(v.clone())?;
            }
        }
    }
    let next = st.pos.map_or(0, |i| i + 1);
    let more = next < st.samples;
    if more {
        let mut frame = Vec::with_capacity(st.channels);
        for c in 0..st.channels {
            frame.push(st.data.child(c).child(next).read()?);
        }
        st.frame = Val::Agg(frame);
    }
    st.pos = Some(next.min(st.samples));
    p.write(Val::Frame(st))?;
    Ok(more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::{analyze, AnalyzeOptions};

    struct Compiled {
        prog: TypedProgram,
        graph: NodeGraph,
    }

    fn compile(src: &str, entry: Option<(&str, usize)>) -> Compiled {
        let parsed = crate::parser::parse(src);
        let program = parsed.program.expect("parse failed");
        let options = AnalyzeOptions {
            node_entry: entry.map(|(n, c)| (n.to_string(), c)),
        };
        let (prog, _) = match analyze(&program, &options) {
            Ok(r) => r,
            Err(d) => panic!("analysis failed: {}", d[0].message),
        };
        let graph = crate::graph::build(&prog);
        Compiled { prog, graph }
    }

    fn run(src: &str, args: &[Value]) -> Result<Value, BackendError> {
        let c = compile(src, None);
        let input = BackendInput {
            program: &c.prog,
            graph: &c.graph,
            flags: CompileFlags::default(),
            external: &[],
        };
        let mut unit = ReferenceBackend.compile(&input)?;
        unit.call("main", args)
    }

    #[test]
    fn arithmetic_and_calls() {
        let src = "int twice(int x) { return x * 2; } int main(int a) { return twice(a) + 1; }";
        assert_eq!(run(src, &[Value::Int(5)]), Ok(Value::Int(11)));
    }

    #[test]
    fn spans_copy_deeply() {
        let src = "int main() {
            span<int, 2> a = {1, 2};
            span<int, 2> b = a;
            b[0] = 10;
            return a[0] + b[0];
        }";
        assert_eq!(run(src, &[]), Ok(Value::Int(11)));
    }

    #[test]
    fn index_policies_resolve_through_the_runtime() {
        let src = "int main() {
            span<int, 3> d = {1, 2, 3};
            index::wrapped<3> w(4);
            index::clamped<3> c(9);
            return d[w] * 10 + d[c];
        }";
        assert_eq!(run(src, &[]), Ok(Value::Int(23)));
    }

    #[test]
    fn negative_value_on_non_negative_wrap_fails_at_run_time() {
        let src = "int main(int v) {
            span<int, 4> d = {1, 2, 3, 4};
            index::wrapped<4, false> i(v);
            return d[i];
        }";
        assert_eq!(run(src, &[Value::Int(-1)]), Err(BackendError::NegativeIndex(-1)));
        assert_eq!(run(src, &[Value::Int(5)]), Ok(Value::Int(2)));
    }

    #[test]
    fn dyn_views_alias_their_source() {
        let src = "int main() {
            span<int, 4> d = {1, 2, 3, 4};
            dyn<int> v;
            v.referTo(d, 2, 1);
            v[0] = 20;
            return d[1] + v.size();
        }";
        assert_eq!(run(src, &[]), Ok(Value::Int(22)));
    }

    #[test]
    fn dyn_constant_subscript_is_checked() {
        let src = "int main() {
            span<int, 4> d = {1, 2, 3, 4};
            dyn<int> v;
            v.referTo(d, 2);
            return v[3];
        }";
        assert_eq!(
            run(src, &[]),
            Err(BackendError::OutOfRange { index: 3, size: 2 })
        );
    }

    #[test]
    fn interpolation_reads_between_slots() {
        let src = "float main() {
            span<float, 4> d = {0.0f, 1.0f, 2.0f, 3.0f};
            index::lerp<index::unscaled<float, index::clamped<4>>> i(1.25f);
            return d[i];
        }";
        assert_eq!(run(src, &[]), Ok(Value::Float(1.25)));
    }

    #[test]
    fn destructors_run_on_every_exit_edge() {
        let src = "int counter = 0;
            struct D { D() { counter = counter + 1; } ~D() { counter = counter - 1; } int v = 0; };
            int main() {
                for (int i = 0; i < 4; i++) {
                    D a;
                    if (i == 1) { D b; continue; }
                    if (i == 2) { D c; break; }
                }
                return counter;
            }";
        assert_eq!(run(src, &[]), Ok(Value::Int(0)));
    }

    #[test]
    fn returned_reference_to_a_local_dangles() {
        let src = "int& bad() { int x = 1; return x; } int main() { int& r = bad(); return r; }";
        assert_eq!(run(src, &[]), Err(BackendError::DanglingReference));
    }

    #[test]
    fn simd_lanes_write_through() {
        let src = "float main() {
            span<float, 8> d = {1.0f};
            for (auto& v : d.toSimd()) { v *= 2.0f; }
            return d[7];
        }";
        assert_eq!(run(src, &[]), Ok(Value::Float(2.0)));
    }

    #[test]
    fn plain_parameter_reaches_its_target() {
        let src = "struct Test {
                void reset() {}
                void processFrame(span<float, 1>& d) {}
                template <int P> void setParameter(double v) { value = v; }
                double value = 0.0;
            };
            parameter::plain<Test, 0> p;
            Test t;
            double main() { p.connect<0>(t); p.call(2.0); return t.value; }";
        assert_eq!(run(src, &[]), Ok(Value::Double(2.0)));
    }

    #[test]
    fn nodes_process_blocks() {
        let src = "struct Gain {
                static const int NumChannels = 2;
                void reset() {}
                template <typename PD> void process(PD& d) {
                    for (auto& ch : d) { for (auto& s : ch) { s *= 0.5f; } }
                }
            };";
        let c = compile(src, Some(("Gain", 2)));
        let input = BackendInput {
            program: &c.prog,
            graph: &c.graph,
            flags: CompileFlags::default(),
            external: &[],
        };
        let mut unit = ReferenceBackend.compile(&input).expect("compile");
        let mut channels = vec![vec![1.0, 2.0], vec![4.0, 8.0]];
        unit.process_node("Gain", &mut channels, &[]).expect("process");
        assert_eq!(channels, vec![vec![0.5, 1.0], vec![2.0, 4.0]]);
        let mut wrong = vec![vec![1.0]];
        assert!(matches!(
            unit.process_node("Gain", &mut wrong, &[]),
            Err(BackendError::BadArguments { .. })
        ));
    }

    #[test]
    fn poly_data_follows_the_voice_index() {
        let src = "PolyData<int, 4> data;
            int main(int v) { data.get() = v; int sum = 0; for (auto& x : data) { sum += x; } return sum; }";
        let c = compile(src, None);
        let input = BackendInput {
            program: &c.prog,
            graph: &c.graph,
            flags: CompileFlags::default(),
            external: &[],
        };
        let mut unit = ReferenceBackend.compile(&input).expect("compile");
        unit.set_voice_index(Some(2));
        assert_eq!(unit.call("main", &[Value::Int(7)]), Ok(Value::Int(7)));
        unit.set_voice_index(None);
        assert_eq!(unit.call("main", &[Value::Int(1)]), Ok(Value::Int(8)));
    }
}
