// fixture.rs — Test-data blocks embedded in source files
//
// A fixture is a comment block between `BEGIN_TEST_DATA` and
// `END_TEST_DATA` holding `key: value` lines. `f` names the function to
// call, or `{Node}` for a node processing test whose `input` and `output`
// are JSON channel arrays. A `ret: T` fixture runs once per numeric type
// with `T` bound to `int`, `float` and `double`.
//
// Preconditions: none.
// Postconditions: `run` compiles the whole file and compares either the
//   first diagnostic against `error` or the result against `output`.
// Failure modes: `FixtureError` for malformed metadata and for mismatches.
// Side effects: none.

use std::fmt;
use std::path::Path;

use dspl_runtime::node::EventType;
use dspl_runtime::HiseEvent;
use serde::Deserialize;
use tracing::debug;

use crate::backend::{BackendError, CompileFlags, CompiledUnit, Value};
use crate::eval::ReferenceBackend;
use crate::pipeline::{CompileUnit, LoadError};
use crate::thir::{TStmt, TypedProgram};

const BEGIN: &str = "BEGIN_TEST_DATA";
const END: &str = "END_TEST_DATA";

/// Events must sit on this sample grid.
pub const EVENT_RASTER: u32 = 8;

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FixtureError {
    Load(LoadError),
    MissingBlock,
    IllegalLine(String),
    MissingKey(&'static str),
    BadValue { key: &'static str, value: String },
    UnalignedEvent(u32),
    /// Compilation failed where `error` expected success, or the other way.
    UnexpectedError(String),
    ExpectedError(String),
    ErrorMismatch { expected: String, actual: String },
    ValueMismatch { expected: String, actual: String },
    LoopCount { expected: usize, actual: usize },
    Backend(BackendError),
}

impl fmt::Display for FixtureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureError::Load(e) => write!(f, "{}", e),
            FixtureError::MissingBlock => write!(f, "Can't find metadata"),
            FixtureError::IllegalLine(l) => write!(f, "{}: Illegal line", l),
            FixtureError::MissingKey(k) => write!(f, "missing key '{}'", k),
            FixtureError::BadValue { key, value } => {
                write!(f, "can't parse {} value '{}'", key, value)
            }
            FixtureError::UnalignedEvent(ts) => write!(f, "Unaligned event: timestamp {}", ts),
            FixtureError::UnexpectedError(m) => write!(f, "unexpected error: {}", m),
            FixtureError::ExpectedError(m) => {
                write!(f, "FAIL: Expected message: {}\nActual message: [No error message]", m)
            }
            FixtureError::ErrorMismatch { expected, actual } => write!(
                f,
                "FAIL: Expected message: {}\nActual message: {}",
                expected, actual
            ),
            FixtureError::ValueMismatch { expected, actual } => {
                write!(f, "FAIL: Expected: {}, Actual: {}", expected, actual)
            }
            FixtureError::LoopCount { expected, actual } => {
                write!(f, "FAIL: Expected {} loops, found {}", expected, actual)
            }
            FixtureError::Backend(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FixtureError {}

impl From<LoadError> for FixtureError {
    fn from(e: LoadError) -> Self {
        FixtureError::Load(e)
    }
}

impl From<BackendError> for FixtureError {
    fn from(e: BackendError) -> Self {
        FixtureError::Backend(e)
    }
}

// ── Metadata ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Function(String),
    Node(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int,
    Float,
    Double,
    Bool,
    /// `T`: each of int, float and double in turn.
    Generic,
}

impl ScalarKind {
    fn parse(s: &str) -> Option<ScalarKind> {
        match s {
            "int" => Some(ScalarKind::Int),
            "float" => Some(ScalarKind::Float),
            "double" => Some(ScalarKind::Double),
            "bool" => Some(ScalarKind::Bool),
            "T" => Some(ScalarKind::Generic),
            _ => None,
        }
    }

    fn bind(self, generic: ScalarKind) -> ScalarKind {
        match self {
            ScalarKind::Generic => generic,
            k => k,
        }
    }

    fn type_name(self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Bool => "bool",
            ScalarKind::Generic => "T",
        }
    }

    fn value(self, text: &str) -> Option<Value> {
        let text = text.trim().trim_end_matches('f');
        match self {
            ScalarKind::Int => text.parse::<i32>().ok().map(Value::Int),
            ScalarKind::Float => text.parse::<f32>().ok().map(Value::Float),
            ScalarKind::Double | ScalarKind::Generic => text.parse::<f64>().ok().map(Value::Double),
            ScalarKind::Bool => match text {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub target: Target,
    pub ret: Option<ScalarKind>,
    pub args: Vec<ScalarKind>,
    /// Raw argument texts, parsed once the argument types are bound.
    pub input: Vec<String>,
    pub output: Option<String>,
    /// Node tests: one array per channel.
    pub channels_in: Vec<Vec<f32>>,
    pub channels_out: Option<Vec<Vec<f32>>>,
    pub error: Option<String>,
    pub filename: Option<String>,
    pub events: Vec<HiseEvent>,
    pub flags: CompileFlags,
    pub loop_count: Option<usize>,
    pub voice_index: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventSpec {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    channel: u8,
    #[serde(default)]
    value1: u8,
    #[serde(default)]
    value2: u8,
    #[serde(default)]
    timestamp: u32,
}

fn parse_event(spec: EventSpec) -> Result<HiseEvent, FixtureError> {
    let kind = match spec.kind.as_str() {
        "NoteOn" => EventType::NoteOn,
        "NoteOff" => EventType::NoteOff,
        "Controller" => EventType::Controller,
        other => {
            return Err(FixtureError::BadValue {
                key: "events",
                value: other.to_string(),
            })
        }
    };
    if spec.timestamp % EVENT_RASTER != 0 {
        return Err(FixtureError::UnalignedEvent(spec.timestamp));
    }
    Ok(HiseEvent {
        kind,
        channel: spec.channel,
        value1: spec.value1,
        value2: spec.value2,
        timestamp: spec.timestamp,
    })
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn channels(key: &'static str, text: &str) -> Result<Vec<Vec<f32>>, FixtureError> {
    serde_json::from_str(unquote(text)).map_err(|_| FixtureError::BadValue {
        key,
        value: text.to_string(),
    })
}

impl Fixture {
    /// Read the block out of a source file's text.
    pub fn parse(source: &str) -> Result<Fixture, FixtureError> {
        let start = source.find(BEGIN).ok_or(FixtureError::MissingBlock)? + BEGIN.len();
        let len = source[start..].find(END).ok_or(FixtureError::MissingBlock)?;
        let block = &source[start..start + len];

        let mut pairs: Vec<(String, String)> = Vec::new();
        for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((k, v)) = line.split_once(':') else {
                return Err(FixtureError::IllegalLine(line.to_string()));
            };
            pairs.push((k.trim().to_string(), v.trim().to_string()));
        }
        let get = |key: &str| -> Option<&str> {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let bad = |key: &'static str, value: &str| FixtureError::BadValue {
            key,
            value: value.to_string(),
        };

        let f = get("f").ok_or(FixtureError::MissingKey("f"))?;
        let error = get("error")
            .map(unquote)
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        let mut flags: CompileFlags = match get("compile_flags") {
            Some(v) => v.parse().map_err(|_| bad("compile_flags", v))?,
            None => CompileFlags::default(),
        };
        let loop_count = match get("loop_count").filter(|v| !v.is_empty()) {
            Some(v) => Some(v.parse::<usize>().map_err(|_| bad("loop_count", v))?),
            None => None,
        };
        if loop_count.is_some() {
            flags.loop_optimisation = true;
        }
        let voice_index = match get("voiceindex") {
            Some(v) => {
                let i = v.parse::<i32>().map_err(|_| bad("voiceindex", v))?;
                usize::try_from(i).ok()
            }
            None => None,
        };
        let events = match get("events").filter(|v| !v.is_empty()) {
            Some(v) => {
                let specs: Vec<EventSpec> =
                    serde_json::from_str(v).map_err(|_| bad("events", v))?;
                specs
                    .into_iter()
                    .map(parse_event)
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => Vec::new(),
        };
        let filename = get("filename")
            .map(unquote)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut fixture = Fixture {
            target: Target::Function(f.to_string()),
            ret: None,
            args: Vec::new(),
            input: Vec::new(),
            output: None,
            channels_in: Vec::new(),
            channels_out: None,
            error,
            filename,
            events,
            flags,
            loop_count,
            voice_index,
        };

        if f.starts_with('{') {
            let name: String = f.chars().filter(|c| !"{} \t".contains(*c)).collect();
            fixture.target = Target::Node(name);
            if let Some(v) = get("input") {
                fixture.channels_in = channels("input", v)?;
            }
            if fixture.error.is_none() {
                fixture.channels_out = match get("output") {
                    Some(v) if !unquote(v).is_empty() => Some(channels("output", v)?),
                    _ => None,
                };
            }
            return Ok(fixture);
        }

        let ret = get("ret").ok_or(FixtureError::MissingKey("ret"))?;
        fixture.ret = Some(ScalarKind::parse(ret).ok_or_else(|| bad("ret", ret))?);
        for a in get("args").unwrap_or("").split_whitespace() {
            fixture
                .args
                .push(ScalarKind::parse(a).ok_or_else(|| bad("args", a))?);
        }
        fixture.input = get("input")
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if fixture.input.len() != fixture.args.len() {
            return Err(FixtureError::BadValue {
                key: "input",
                value: "Input amount mismatch".into(),
            });
        }
        if fixture.error.is_none() {
            fixture.output = Some(
                get("output")
                    .map(|v| unquote(v).to_string())
                    .ok_or(FixtureError::MissingKey("output"))?,
            );
        }
        Ok(fixture)
    }

    fn is_generic(&self) -> bool {
        self.ret == Some(ScalarKind::Generic) || self.args.contains(&ScalarKind::Generic)
    }
}

// ── Runner ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// The fixture needs optimisations the runner doesn't enable.
    Skipped(String),
}

/// Runs fixtures with a set of active optimisation flags.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    pub active: CompileFlags,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            active: "All".parse().unwrap_or_default(),
        }
    }
}

impl Runner {
    pub fn run_file(&self, path: &Path) -> Result<Outcome, FixtureError> {
        let unit = CompileUnit::from_file(path)?;
        self.run_source(unit.name(), unit.source())
    }

    pub fn run_source(&self, name: &str, source: &str) -> Result<Outcome, FixtureError> {
        let fixture = Fixture::parse(source)?;
        let missing: Vec<&str> = fixture
            .flags
            .names()
            .into_iter()
            .filter(|n| !self.active.names().contains(n))
            .collect();
        if !missing.is_empty() {
            return Ok(Outcome::Skipped(format!("needs {}", missing.join(", "))));
        }
        if fixture.is_generic() {
            for kind in [ScalarKind::Int, ScalarKind::Float, ScalarKind::Double] {
                debug!(fixture = %name, ty = kind.type_name(), "generic pass");
                let bound = format!("using T = {}; {}", kind.type_name(), source);
                self.run_one(name, &bound, &fixture, kind)?;
            }
            return Ok(Outcome::Passed);
        }
        self.run_one(name, source, &fixture, ScalarKind::Generic)?;
        Ok(Outcome::Passed)
    }

    fn run_one(
        &self,
        name: &str,
        source: &str,
        fixture: &Fixture,
        generic: ScalarKind,
    ) -> Result<(), FixtureError> {
        let mut unit = CompileUnit::new(name, source).with_flags(self.active);
        if let Target::Node(node) = &fixture.target {
            unit = unit.with_entry_node(node.clone(), fixture.channels_in.len());
        }

        let compiled = match (unit.compile(), &fixture.error) {
            (Err(e), Some(expected)) => {
                let actual = e.first_message();
                if actual != expected {
                    return Err(FixtureError::ErrorMismatch {
                        expected: expected.clone(),
                        actual: actual.to_string(),
                    });
                }
                return Ok(());
            }
            (Err(e), None) => {
                return Err(FixtureError::UnexpectedError(e.first_message().to_string()))
            }
            (Ok(_), Some(expected)) => return Err(FixtureError::ExpectedError(expected.clone())),
            (Ok(c), None) => c,
        };

        let mut backend = ReferenceBackend;
        let mut unit = compiled.instantiate(&mut backend)?;
        unit.set_voice_index(fixture.voice_index);

        match &fixture.target {
            Target::Node(node) => {
                let mut data = fixture.channels_in.clone();
                unit.process_node(node, &mut data, &fixture.events)?;
                if let Some(expected) = &fixture.channels_out {
                    compare_channels(expected, &data)?;
                }
            }
            Target::Function(f) => {
                if let Some(expected) = fixture.loop_count {
                    let actual = count_loops(&compiled.program, f);
                    if actual != expected {
                        return Err(FixtureError::LoopCount { expected, actual });
                    }
                }
                let result = call(unit.as_mut(), fixture, f, generic)?;
                let ret = fixture.ret.unwrap_or(ScalarKind::Int).bind(generic);
                let output = fixture.output.as_deref().unwrap_or("");
                let expected = ret.value(output).ok_or(FixtureError::BadValue {
                    key: "output",
                    value: output.to_string(),
                })?;
                if !same(&expected, &result) {
                    return Err(FixtureError::ValueMismatch {
                        expected: expected.to_string(),
                        actual: result.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn call(
    unit: &mut dyn CompiledUnit,
    fixture: &Fixture,
    f: &str,
    generic: ScalarKind,
) -> Result<Value, FixtureError> {
    let mut args = Vec::with_capacity(fixture.args.len());
    for (kind, text) in fixture.args.iter().zip(&fixture.input) {
        let kind = kind.bind(generic);
        args.push(kind.value(text).ok_or_else(|| FixtureError::BadValue {
            key: "input",
            value: text.clone(),
        })?);
    }
    Ok(unit.call(f, &args)?)
}

/// Float results compare within one part in a million.
fn same(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => match (expected.as_f64(), actual.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= 1e-6 * a.abs().max(1.0),
            _ => expected == actual,
        },
    }
}

fn compare_channels(expected: &[Vec<f32>], actual: &[Vec<f32>]) -> Result<(), FixtureError> {
    let mismatch = || FixtureError::ValueMismatch {
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    };
    if expected.len() != actual.len() {
        return Err(mismatch());
    }
    for (e, a) in expected.iter().zip(actual) {
        if e.len() != a.len() || e.iter().zip(a).any(|(x, y)| (x - y).abs() > 1e-5) {
            return Err(mismatch());
        }
    }
    Ok(())
}

/// Loop statements in the body of `name`. The reference backend doesn't
/// unroll, so this is the count written in the source.
pub fn count_loops(prog: &TypedProgram, name: &str) -> usize {
    let Some(ids) = prog.functions_by_name.get(name) else {
        return 0;
    };
    ids.iter()
        .filter_map(|id| prog.function(*id).body.as_ref())
        .map(|b| b.stmts.iter().map(loops_in).sum::<usize>())
        .sum()
}

fn loops_in(s: &TStmt) -> usize {
    match s {
        TStmt::While { body, .. } | TStmt::For { body, .. } | TStmt::RangeFor { body, .. } => {
            1 + loops_in(body)
        }
        TStmt::If { then, els, .. } => loops_in(then) + els.as_deref().map_or(0, loops_in),
        TStmt::Block(b) => b.stmts.iter().map(loops_in).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALAR: &str = "/** BEGIN_TEST_DATA
  f: main
  ret: int
  args: int int
  input: 4 5
  output: 9
  error: \"\"
  filename: \"basic/add\"
END_TEST_DATA */
int main(int a, int b) { return a + b; }
";

    #[test]
    fn metadata_block_is_read() {
        let f = Fixture::parse(SCALAR).expect("fixture");
        assert_eq!(f.target, Target::Function("main".into()));
        assert_eq!(f.args, [ScalarKind::Int, ScalarKind::Int]);
        assert_eq!(f.input, ["4", "5"]);
        assert_eq!(f.output.as_deref(), Some("9"));
        assert_eq!(f.error, None);
        assert_eq!(f.filename.as_deref(), Some("basic/add"));
    }

    #[test]
    fn scalar_fixture_passes() {
        assert_eq!(Runner::default().run_source("add", SCALAR).expect("run"), Outcome::Passed);
        let wrong = SCALAR.replace("output: 9", "output: 10");
        assert!(matches!(
            Runner::default().run_source("add", &wrong),
            Err(FixtureError::ValueMismatch { .. })
        ));
    }

    #[test]
    fn error_fixtures_compare_the_first_message() {
        let src = "/** BEGIN_TEST_DATA
  f: main
  ret: int
  args: int
  input: 1
  output: 0
  error: \"Line 9(30): Can't resolve symbol y\"
END_TEST_DATA */
int main(int a) { return a + y; }
";
        assert_eq!(Runner::default().run_source("err", src).expect("run"), Outcome::Passed);
    }

    #[test]
    fn events_must_be_aligned() {
        let src = "BEGIN_TEST_DATA
  f: {Node}
  events: [{\"Type\": \"NoteOn\", \"Channel\": 1, \"Value1\": 64, \"Value2\": 127, \"Timestamp\": 3}]
END_TEST_DATA";
        assert!(matches!(Fixture::parse(src), Err(FixtureError::UnalignedEvent(3))));
        let ok = src.replace("\"Timestamp\": 3", "\"Timestamp\": 16");
        let f = Fixture::parse(&ok).expect("fixture");
        assert_eq!(f.events[0].value1, 64);
        assert_eq!(f.target, Target::Node("Node".into()));
    }

    #[test]
    fn generic_fixtures_run_for_each_numeric_type() {
        let src = "/** BEGIN_TEST_DATA
  f: main
  ret: T
  args: T
  input: 3
  output: 6
END_TEST_DATA */
T main(T v) { return v + v; }
";
        assert_eq!(Runner::default().run_source("gen", src).expect("run"), Outcome::Passed);
    }

    #[test]
    fn loop_fixtures_need_loop_optimisation() {
        let src = "/** BEGIN_TEST_DATA
  f: main
  ret: int
  args: int
  input: 3
  output: 3
  loop_count: 1
END_TEST_DATA */
int main(int n) { int s = 0; for (int i = 0; i < n; i++) { s += 1; } return s; }
";
        let off = Runner {
            active: CompileFlags::default(),
        };
        assert!(matches!(off.run_source("loop", src), Ok(Outcome::Skipped(_))));
        assert_eq!(Runner::default().run_source("loop", src).expect("run"), Outcome::Passed);
    }
}
