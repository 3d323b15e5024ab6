// Semantic error reporting through the pipeline.
//
// Each case is a small source with one designated first error. The tests
// lock three things: the phase that stops compilation, the error kind derived
// from the diagnostic code, and the rendered `Line L(C): message` text.
//
// Run `cargo insta review` after intentional message changes.

use dsplc::diag::ErrorKind;
use dsplc::pipeline::{CompileUnit, Phase, PipelineError};

fn fail(src: &str) -> PipelineError {
    match CompileUnit::new("sema", src).compile() {
        Ok(_) => panic!("expected an error in:\n{}", src),
        Err(e) => e,
    }
}

/// `KIND CODE Line L(C): message` for the first error.
fn report(src: &str) -> String {
    let err = fail(src);
    let first = &err.diagnostics[0];
    format!(
        "{:?} {} {}",
        first.kind().expect("coded diagnostic"),
        first.code.map(|c| c.to_string()).unwrap_or_default(),
        err.first_message()
    )
}

fn kind(src: &str) -> ErrorKind {
    fail(src).diagnostics[0]
        .kind()
        .expect("coded diagnostic")
}

// ── Rendered positions ──────────────────────────────────────────────────────

#[test]
fn unresolved_name() {
    insta::assert_snapshot!(
        report("int main() {\n    return x;\n}"),
        @"UnresolvedName E0201 Line 2(12): Can't resolve symbol x"
    );
}

#[test]
fn non_boolean_condition() {
    insta::assert_snapshot!(
        report("int main() {\n    int x = 1;\n    if (x) { return 1; }\n    return 0;\n}"),
        @"TypeMismatch E0301 Line 3(9): Condition must be boolean expression"
    );
}

#[test]
fn assignment_to_constant_variable() {
    insta::assert_snapshot!(
        report("int main() {\n    const int x = 1;\n    x = 2;\n    return x;\n}"),
        @"Mutability E0501 Line 3(5): Can't change constant variable"
    );
}

#[test]
fn rvalue_bound_to_reference_parameter() {
    insta::assert_snapshot!(
        report("void f(int& a) { a = 1; }\nint main() {\n    f(2);\n    return 0;\n}"),
        @"ReferenceBinding E0601 Line 3(7): Can't use rvalues for reference parameters"
    );
}

#[test]
fn reference_binding_errors_carry_a_hint() {
    let err = fail("void f(int& a) { a = 1; } int main() { f(2); return 0; }");
    assert_eq!(
        err.diagnostics[0].hint.as_deref(),
        Some("pass a variable, or take the parameter as const&")
    );
}

#[test]
fn break_outside_of_loop() {
    insta::assert_snapshot!(
        report("int main() {\n    break;\n    return 0;\n}"),
        @"TypeMismatch E0310 Line 2(5): break outside of loop"
    );
}

// ── Error kinds ─────────────────────────────────────────────────────────────

#[test]
fn private_member_is_an_access_error() {
    let src = "class X { int v = 1; public: static const int K = 2; };
               int main() { X x; return x.v; }";
    assert_eq!(kind(src), ErrorKind::Access);
    assert!(fail(src).first_message().ends_with("X::v is not accessible"));
}

#[test]
fn nested_struct_needs_its_namespace() {
    let src = "namespace dsp { struct Osc { int v = 0; }; }
               int main() { Osc o; return o.v; }";
    assert_eq!(kind(src), ErrorKind::UnresolvedName);
    assert!(fail(src).first_message().ends_with("Can't resolve symbol Osc"));
}

#[test]
fn narrowing_casts_are_type_mismatches() {
    let src = "int f(double d) { int x = d; return x; }";
    assert_eq!(kind(src), ErrorKind::TypeMismatch);
    assert!(fail(src)
        .first_message()
        .ends_with("Can't implicitely cast double to int"));
}

#[test]
fn initialiser_list_size_is_checked() {
    let src = "int main() { span<int, 3> d = {1, 2}; return d[0]; }";
    assert_eq!(kind(src), ErrorKind::TypeMismatch);
    assert!(fail(src)
        .first_message()
        .ends_with("initialiser list size mismatch. Expected: 3, Actual: 2"));
}

#[test]
fn const_method_cannot_mutate() {
    let src = "struct X { int v = 0; void get() const { v = 2; } };";
    assert_eq!(kind(src), ErrorKind::Mutability);
}

#[test]
fn node_without_callbacks_is_a_graph_error() {
    let src = "struct NoReset { void processFrame(span<float, 1>& d) {} };
               container::chain<parameter::empty, NoReset> c;
               int main() { return 0; }";
    assert_eq!(kind(src), ErrorKind::StructuralGraph);
    assert!(fail(src)
        .first_message()
        .ends_with("missing function NoReset::reset"));
}

#[test]
fn unconnected_parameter_stops_the_connect_phase() {
    let src = "struct Test {
                   void reset() {}
                   void processFrame(span<float, 1>& d) {}
                   template <int P> void setParameter(double v) {}
               };
               container::chain<parameter::plain<Test, 0>, Test> c;
               int main() { c.setParameter<0>(0.5); return 0; }";
    let err = fail(src);
    assert_eq!(err.failing_phase, Phase::Connect);
    assert_eq!(err.diagnostics[0].kind(), Some(ErrorKind::StructuralGraph));
}

// ── Reporting policy ────────────────────────────────────────────────────────

#[test]
fn parse_errors_are_reported_alone() {
    let err = fail("int main( { return 1; }\nint g() { return y; }");
    assert_eq!(err.failing_phase, Phase::Parse);
    assert_eq!(err.diagnostics[0].kind(), Some(ErrorKind::Parse));
    assert!(err.messages.iter().all(|m| !m.contains("Can't resolve symbol")));
}

#[test]
fn first_message_is_the_earliest_by_position() {
    let err = fail("int a() { return p; }\nint b() { return q; }");
    assert!(err.first_message().starts_with("Line 1("));
    let starts: Vec<usize> = err.diagnostics.iter().map(|d| d.span.start).collect();
    let mut sorted = starts.clone();
    sorted.sort_unstable();
    assert_eq!(starts, sorted);
}

#[test]
fn independent_units_do_not_share_state() {
    let first = CompileUnit::new("a", "struct X { int v = 1; }; int main() { X x; return x.v; }");
    let second = CompileUnit::new("b", "int main() { X x; return 0; }");
    assert!(first.compile().is_ok());
    assert_eq!(kind(second.source()), ErrorKind::UnresolvedName);
    assert!(first.compile().is_ok());
}
