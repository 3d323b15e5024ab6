// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases, the
// stable code table, the error taxonomy and the `Line L(C): message`
// rendering used by fixtures and the CLI.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0201`).
///
/// Codes are `&'static str` constants defined in the `codes` module. The
/// hundreds digit selects the error kind (see `ErrorKind::of`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by error kind.
pub mod codes {
    use super::DiagCode;

    // E01xx: parse
    pub const E0101: DiagCode = DiagCode("E0101"); // syntax error
    pub const E0102: DiagCode = DiagCode("E0102"); // unexpected character

    // E02xx: unresolved names
    pub const E0201: DiagCode = DiagCode("E0201"); // can't resolve symbol
    pub const E0202: DiagCode = DiagCode("E0202"); // ambiguous name
    pub const E0203: DiagCode = DiagCode("E0203"); // duplicate symbol
    pub const E0204: DiagCode = DiagCode("E0204"); // missing function / member

    // E03xx: type mismatch
    pub const E0301: DiagCode = DiagCode("E0301"); // implicit cast rejected
    pub const E0302: DiagCode = DiagCode("E0302"); // initialiser list size mismatch
    pub const E0303: DiagCode = DiagCode("E0303"); // ambiguous overload
    pub const E0304: DiagCode = DiagCode("E0304"); // no matching overload / ctor
    pub const E0305: DiagCode = DiagCode("E0305"); // illegal subscript
    pub const E0306: DiagCode = DiagCode("E0306"); // template argument error
    pub const E0307: DiagCode = DiagCode("E0307"); // return path / value error
    pub const E0308: DiagCode = DiagCode("E0308"); // invalid operand types
    pub const E0309: DiagCode = DiagCode("E0309"); // constant evaluation error
    pub const E0310: DiagCode = DiagCode("E0310"); // misplaced statement / expression

    // E04xx: access
    pub const E0401: DiagCode = DiagCode("E0401"); // member not accessible

    // E05xx: mutability
    pub const E0501: DiagCode = DiagCode("E0501"); // modification of const object

    // E06xx: reference binding
    pub const E0601: DiagCode = DiagCode("E0601"); // rvalue to reference parameter
    pub const E0602: DiagCode = DiagCode("E0602"); // reference to non-reference result

    // E07xx: structural graph
    pub const E0701: DiagCode = DiagCode("E0701"); // node missing required method
    pub const E0702: DiagCode = DiagCode("E0702"); // channel count mismatch
    pub const E0703: DiagCode = DiagCode("E0703"); // unconnected parameter slot
    pub const E0704: DiagCode = DiagCode("E0704"); // container index out of range
}

// ── Error taxonomy ───────────────────────────────────────────────────────

/// Error kind of a diagnostic, derived from its code family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    UnresolvedName,
    TypeMismatch,
    Access,
    Mutability,
    ReferenceBinding,
    StructuralGraph,
}

impl ErrorKind {
    /// Kind of a code (`E02xx` → `UnresolvedName`, …).
    pub fn of(code: DiagCode) -> Option<ErrorKind> {
        let family = code.0.get(1..3)?;
        Some(match family {
            "01" => ErrorKind::Parse,
            "02" => ErrorKind::UnresolvedName,
            "03" => ErrorKind::TypeMismatch,
            "04" => ErrorKind::Access,
            "05" => ErrorKind::Mutability,
            "06" => ErrorKind::ReferenceBinding,
            "07" => ErrorKind::StructuralGraph,
            _ => return None,
        })
    }
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain, e.g. the template instantiation that led to
/// an error inside the template body.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub span: Option<Span>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related spans, or causes.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic carrying `code`.
    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, span: Option<Span>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            span,
        });
        self
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.code.and_then(ErrorKind::of)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Source positions ─────────────────────────────────────────────────────

/// Maps byte offsets to 1-based line and column numbers.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|&(_, b)| b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { line_starts }
    }

    /// `(line, column)`, both 1-based.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line + 1, offset - self.line_starts[line] + 1)
    }

    /// Render as `Line L(C): message`.
    pub fn render(&self, diag: &Diagnostic) -> String {
        let (line, col) = self.line_col(diag.span.start);
        format!("Line {}({}): {}", line, col, diag.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        use chumsky::span::Span as _;
        Span::new((), 0..1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, dummy_span(), "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::error(codes::E0201, dummy_span(), "Can't resolve symbol x");
        assert_eq!(format!("{d}"), "error[E0201]: Can't resolve symbol x");
        assert_eq!(d.kind(), Some(ErrorKind::UnresolvedName));
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error(codes::E0702, dummy_span(), "illegal channel wrap amount")
            .with_hint("match the node's NumChannels")
            .with_related(dummy_span(), "node declared here")
            .with_cause("instantiated from here", Some(dummy_span()));

        assert_eq!(d.kind(), Some(ErrorKind::StructuralGraph));
        assert_eq!(d.hint.as_deref(), Some("match the node's NumChannels"));
        assert_eq!(d.related_spans.len(), 1);
        assert_eq!(d.cause_chain.len(), 1);
    }

    #[test]
    fn every_code_family_has_a_kind() {
        for code in [
            codes::E0101,
            codes::E0203,
            codes::E0310,
            codes::E0401,
            codes::E0501,
            codes::E0602,
            codes::E0704,
        ] {
            assert!(ErrorKind::of(code).is_some(), "{code}");
        }
        assert_eq!(ErrorKind::of(DiagCode("W0001")), None);
    }

    #[test]
    fn line_and_column_are_one_based() {
        let index = LineIndex::new("int x;\n  foo();\n");
        assert_eq!(index.line_col(0), (1, 1));
        assert_eq!(index.line_col(9), (2, 3));
        let d = Diagnostic::error(codes::E0201, (9..12).into(), "Can't resolve symbol foo");
        assert_eq!(index.render(&d), "Line 2(3): Can't resolve symbol foo");
    }
}
