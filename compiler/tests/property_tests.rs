// Property-based tests for the compiled language.
//
// Three categories:
// 1. Index subscripts in source agree with the runtime index policies
// 2. Dyn views alias their source span for any in-range window
// 3. Constant folding agrees with run-time evaluation
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use dspl_runtime::index;
use dsplc::backend::Value;
use dsplc::eval::ReferenceBackend;
use dsplc::pipeline::CompileUnit;
use proptest::prelude::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn run(src: &str, args: &[Value]) -> Value {
    let compiled = CompileUnit::new("prop", src)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}\n{}", e, src));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");
    unit.call("main", args)
        .unwrap_or_else(|e| panic!("run failed: {}\n{}", e, src))
}

/// `{0, 1, ..., n - 1}`
fn ramp(n: usize) -> String {
    let items: Vec<String> = (0..n).map(|i| i.to_string()).collect();
    format!("{{{}}}", items.join(", "))
}

fn subscript_program(policy: &str, n: usize) -> String {
    format!(
        "int main(int v) {{
            span<int, {n}> d = {ramp};
            index::{policy}<{n}> i(v);
            return d[i];
        }}",
        n = n,
        ramp = ramp(n),
        policy = policy,
    )
}

// ── Index policies ──────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn wrapped_subscript_matches_runtime(v in -200i32..200, n in 1usize..9) {
        let got = run(&subscript_program("wrapped", n), &[Value::Int(v)]);
        prop_assert_eq!(got, Value::Int(index::wrap(v, n as i32)));
    }

    #[test]
    fn clamped_subscript_matches_runtime(v in -200i32..200, n in 1usize..9) {
        let got = run(&subscript_program("clamped", n), &[Value::Int(v)]);
        prop_assert_eq!(got, Value::Int(index::clamp(v, n as i32)));
    }

    #[test]
    fn wrapped_subscript_is_periodic(v in -100i32..100, k in -5i32..5) {
        let src = subscript_program("wrapped", 5);
        let a = run(&src, &[Value::Int(v)]);
        let b = run(&src, &[Value::Int(v + k * 5)]);
        prop_assert_eq!(a, b);
    }
}

// ── Dyn aliasing ────────────────────────────────────────────────────────────

fn window() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=8).prop_flat_map(|len| (Just(len), 0..=(8 - len)))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn dyn_window_aliases_source((len, off) in window()) {
        let src = format!(
            "int main() {{
                span<int, 8> s = {{10, 11, 12, 13, 14, 15, 16, 17}};
                dyn<int> d;
                d.referTo(s, {len}, {off});
                d[0] = d[0] + 100;
                return d.size() * 1000 + s[{off}];
            }}",
            len = len,
            off = off,
        );
        let expected = (len * 1000 + 110 + off) as i32;
        prop_assert_eq!(run(&src, &[]), Value::Int(expected));
    }
}

// ── Folding ─────────────────────────────────────────────────────────────────

fn arb_op() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("+"), Just("-"), Just("*"), Just("<"), Just("==")]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn folded_and_evaluated_arithmetic_agree(
        a in -1000i32..1000,
        b in -1000i32..1000,
        op in arb_op(),
    ) {
        let ret = if matches!(op, "<" | "==") { "bool" } else { "int" };
        let folded = run(
            &format!("{} main() {{ return {} {} {}; }}", ret, a, op, b),
            &[],
        );
        let evaluated = run(
            &format!("{} main(int a, int b) {{ return a {} b; }}", ret, op),
            &[Value::Int(a), Value::Int(b)],
        );
        prop_assert_eq!(folded, evaluated);
    }
}
