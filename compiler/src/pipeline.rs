// pipeline.rs — Compile-unit orchestration
//
// Runs parse → analyze → connection check → layout for one source text and
// keeps every artifact a backend or a tool needs. A unit owns its source,
// its analysis options and its external data; nothing is shared between
// units.
//
// Preconditions: none.
// Postconditions: `compile` returns either every artifact or the
//   diagnostics of the first failing phase, sorted by position.
// Failure modes: `PipelineError` (any phase reporting errors), `LoadError`
//   (source file can't be read).
// Side effects: `tracing` events per phase.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::ast::Program;
use crate::backend::{Backend, BackendError, BackendInput, CompileFlags, CompiledUnit, ExternalData};
use crate::diag::{codes, Diagnostic, LineIndex};
use crate::graph::NodeGraph;
use crate::sema::{AnalysisStats, AnalyzeOptions};
use crate::thir::TypedProgram;

// ── Phases ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parse,
    Analyze,
    Connect,
    Layout,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::Analyze => "analyze",
            Phase::Connect => "connect",
            Phase::Layout => "layout",
        }
    }
}

// ── Provenance ───────────────────────────────────────────────────────────

/// Identifies the input and compiler that produced a set of artifacts.
///
/// `source_hash`: SHA-256 of the raw source text, hex encoded.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub source_hash: String,
    pub compiler_version: &'static str,
}

pub fn compute_provenance(source: &str) -> Provenance {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    Provenance {
        source_hash: hex,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

/// A phase reported errors. `messages` are rendered as `Line L(C): message`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_phase: Phase,
    pub diagnostics: Vec<Diagnostic>,
    pub messages: Vec<String>,
}

impl PipelineError {
    /// The authoritative error: the first one by source position.
    pub fn first_message(&self) -> &str {
        self.messages.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.failing_phase.name())?;
        for m in &self.messages {
            write!(f, "\n{}", m)?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {}

/// Source file could not be read.
#[derive(Debug)]
pub struct LoadError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// ── Compile unit ─────────────────────────────────────────────────────────

pub struct CompileUnit {
    name: String,
    source: String,
    lines: LineIndex,
    options: AnalyzeOptions,
    flags: CompileFlags,
    external: Vec<ExternalData>,
}

impl CompileUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            name: name.into(),
            lines: LineIndex::new(&source),
            source,
            options: AnalyzeOptions::default(),
            flags: CompileFlags::default(),
            external: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let source = std::fs::read_to_string(path).map_err(|source| LoadError {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, source))
    }

    /// Process the node type `name` directly with `channels` channels.
    pub fn with_entry_node(mut self, name: impl Into<String>, channels: usize) -> Self {
        self.options.node_entry = Some((name.into(), channels));
        self
    }

    pub fn with_external_data(mut self, data: Vec<ExternalData>) -> Self {
        self.external = data;
        self
    }

    pub fn with_flags(mut self, flags: CompileFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        self.lines.render(d)
    }

    /// 1-based `(line, column)` of a byte offset in this unit's source.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        self.lines.line_col(offset)
    }

    fn fail(&self, phase: Phase, mut diagnostics: Vec<Diagnostic>) -> PipelineError {
        diagnostics.sort_by_key(|d| d.span.start);
        let messages = diagnostics.iter().map(|d| self.render(d)).collect();
        PipelineError {
            failing_phase: phase,
            diagnostics,
            messages,
        }
    }

    pub fn parse(&self) -> Result<Program, PipelineError> {
        let t = Instant::now();
        let result = crate::parser::parse(&self.source);
        debug!(
            unit = %self.name,
            elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
            "parse complete"
        );
        let diags: Vec<Diagnostic> = result
            .errors
            .iter()
            .map(|e| Diagnostic::error(codes::E0101, *e.span(), e.to_string()))
            .collect();
        match result.program {
            Some(p) if diags.is_empty() => Ok(p),
            _ => Err(self.fail(Phase::Parse, diags)),
        }
    }

    /// Run every phase up to the node layout.
    pub fn compile(&self) -> Result<Compiled, PipelineError> {
        let ast = self.parse()?;

        let t = Instant::now();
        let (program, stats) = crate::sema::analyze(&ast, &self.options)
            .map_err(|d| self.fail(Phase::Analyze, d))?;
        debug!(
            unit = %self.name,
            structs = stats.structs,
            functions = stats.functions,
            instantiations = stats.instantiations,
            elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
            "analyze complete"
        );

        let t = Instant::now();
        let unconnected = crate::graph::check_connections(&program);
        if !unconnected.is_empty() {
            return Err(self.fail(Phase::Connect, unconnected));
        }
        debug!(
            unit = %self.name,
            elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
            "connect complete"
        );

        let t = Instant::now();
        let graph = crate::graph::build(&program);
        debug!(
            unit = %self.name,
            layouts = graph.layouts.len(),
            nodes = graph.nodes.len(),
            elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
            "layout complete"
        );

        Ok(Compiled {
            ast,
            program,
            graph,
            stats,
            provenance: compute_provenance(&self.source),
            flags: self.flags,
            external: self.external.clone(),
        })
    }
}

// ── Artifacts ────────────────────────────────────────────────────────────

pub struct Compiled {
    pub ast: Program,
    pub program: TypedProgram,
    pub graph: NodeGraph,
    pub stats: AnalysisStats,
    pub provenance: Provenance,
    pub flags: CompileFlags,
    pub external: Vec<ExternalData>,
}

#[derive(Serialize)]
struct GraphReport<'a> {
    provenance: &'a Provenance,
    graph: &'a NodeGraph,
}

impl Compiled {
    pub fn input(&self) -> BackendInput<'_> {
        BackendInput {
            program: &self.program,
            graph: &self.graph,
            flags: self.flags,
            external: &self.external,
        }
    }

    pub fn instantiate(
        &self,
        backend: &mut dyn Backend,
    ) -> Result<Box<dyn CompiledUnit + '_>, BackendError> {
        debug!(backend = backend.name(), "instantiate");
        backend.compile(&self.input())
    }

    /// Node layout and wiring with provenance, for `--emit graph`.
    pub fn graph_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&GraphReport {
            provenance: &self.provenance,
            graph: &self.graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_is_stable_per_source() {
        let a = compute_provenance("int main() { return 1; }");
        let b = compute_provenance("int main() { return 1; }");
        let c = compute_provenance("int main() { return 2; }");
        assert_eq!(a, b);
        assert_ne!(a.source_hash, c.source_hash);
        assert_eq!(a.source_hash.len(), 64);
        assert_eq!(a.compiler_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn first_error_is_rendered_with_line_and_column() {
        let unit = CompileUnit::new("t", "int main() {\n  return x;\n}");
        let err = unit.compile().err().expect("should fail");
        assert_eq!(err.failing_phase, Phase::Analyze);
        assert_eq!(err.first_message(), "Line 2(10): Can't resolve symbol x");
    }

    #[test]
    fn syntax_errors_stop_at_parse() {
        let unit = CompileUnit::new("t", "int main( { return 1; }");
        let err = unit.compile().err().expect("should fail");
        assert_eq!(err.failing_phase, Phase::Parse);
        assert!(err.first_message().starts_with("Line 1("));
    }

    #[test]
    fn graph_report_carries_provenance() {
        let unit = CompileUnit::new("t", "struct P { int a = 0; float b = 0.0f; }; P p;");
        let compiled = unit.compile().expect("compile");
        let json = compiled.graph_json().expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(v["provenance"]["source_hash"], compiled.provenance.source_hash.as_str());
        assert!(v["graph"]["layouts"].is_array());
    }
}
