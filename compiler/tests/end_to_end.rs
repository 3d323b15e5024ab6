// End-to-end evaluation through the public pipeline.
//
// Every case compiles a complete source with `CompileUnit`, instantiates it
// on the reference backend and checks observable results: returned values,
// processed channel data and run-time errors.

use dsplc::backend::{BackendError, ExternalData, Value};
use dsplc::eval::ReferenceBackend;
use dsplc::pipeline::{CompileUnit, Phase};
use dspl_runtime::node::EventType;
use dspl_runtime::HiseEvent;

const TEST_NODE: &str = "
    struct Test {
        static const int NumChannels = 1;
        void reset() { v = 1; }
        void processFrame(span<float, 1>& data) { data[0] = data[0] * 2.0f; }
        template <int P> void setParameter(double x) { value = x; }
        int v = 0;
        double value = 0.0;
    };";

fn call(src: &str, args: &[Value]) -> Result<Value, BackendError> {
    let compiled = CompileUnit::new("e2e", src)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend)?;
    unit.call("main", args)
}

fn with_node(body: &str) -> String {
    format!("{} {}", TEST_NODE, body)
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn wrapped_index_reduces_modulo_size() {
    let src = "int main(int v) {
        span<int, 5> d = {1, 2, 3, 4, 5};
        index::wrapped<5> i(v);
        return d[i];
    }";
    assert_eq!(call(src, &[Value::Int(7)]), Ok(Value::Int(3)));
    assert_eq!(call(src, &[Value::Int(-3)]), Ok(Value::Int(3)));
}

#[test]
fn dyn_view_over_a_broadcast_span() {
    let src = "float main() {
        dyn<float> d;
        span<float, 12> data = {90.0f};
        d.referTo(data, data.size());
        return d[0] + d[11];
    }";
    assert_eq!(call(src, &[]), Ok(Value::Float(180.0)));
}

#[test]
fn list_initialised_objects_run_their_constructors() {
    let src = "struct X { X(int a = 9) { value = a * 2; } int value = 0; };
        int main() {
            span<X, 2> data = {5};
            return data[0].value * 100 + data[1].value;
        }";
    assert_eq!(call(src, &[]), Ok(Value::Int(1018)));
}

#[test]
fn chain_reset_reaches_every_child() {
    let src = with_node(
        "container::chain<parameter::empty, Test, Test, Test> c;
         int main() {
             c.reset();
             return c.get<0>().v * 100 + c.get<1>().v * 10 + c.get<2>().v;
         }",
    );
    assert_eq!(call(&src, &[]), Ok(Value::Int(111)));
}

#[test]
fn plain_parameter_sets_the_connected_instance() {
    let src = with_node(
        "parameter::plain<Test, 0> p;
         Test t;
         double main() { p.connect<0>(t); p.call(2.0); return t.value; }",
    );
    assert_eq!(call(&src, &[]), Ok(Value::Double(2.0)));
}

// ── Templates and lifetimes ─────────────────────────────────────────────────

#[test]
fn one_instantiation_many_instances() {
    let src = "int counter = 0;
        template <int N> struct X {
            static const int V = N * 2;
            X() { counter = counter + 1; }
            int v = N;
        };
        int main() {
            X<5> a;
            X<5> b;
            X<3> c;
            return counter * 100 + X<5>::V + a.v - b.v;
        }";
    assert_eq!(call(src, &[]), Ok(Value::Int(310)));
}

#[test]
fn nested_scopes_destroy_in_reverse_order() {
    let src = "int trace = 0;
        struct D {
            D(int i) { id = i; }
            ~D() { trace = trace * 10 + id; }
            int id = 0;
        };
        void body() {
            D a(1);
            D b(2);
            { D c(3); }
        }
        int main() { body(); return trace; }";
    assert_eq!(call(src, &[]), Ok(Value::Int(321)));
}

#[test]
fn counters_balance_on_every_exit_path() {
    let src = "int counter = 0;
        struct D { D() { counter = counter + 1; } ~D() { counter = counter - 1; } int v = 0; };
        int main(int n) {
            for (int i = 0; i < n; i++) {
                D a;
                if (i == 1) { D b; continue; }
                if (i == 2) { D c; break; }
            }
            return counter;
        }";
    for n in [0, 1, 2, 3, 8] {
        assert_eq!(call(src, &[Value::Int(n)]), Ok(Value::Int(0)), "n = {}", n);
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

#[test]
fn parameter_chain_fans_out_to_every_target() {
    let src = with_node(
        "using P = parameter::chain<ranges::Identity, parameter::plain<Test, 0>, parameter::plain<Test, 1>>;
         container::chain<P, Test, Test> c;
         double main(double v) {
             c.getParameter<0>().connect<0>(c.get<0>());
             c.getParameter<0>().connect<1>(c.get<1>());
             c.setParameter<0>(v);
             return c.get<0>().value + c.get<1>().value;
         }",
    );
    assert_eq!(call(&src, &[Value::Double(0.5)]), Ok(Value::Double(1.0)));
}

#[test]
fn parameter_list_addresses_one_slot() {
    let src = with_node(
        "using P = parameter::list<parameter::plain<Test, 0>, parameter::plain<Test, 0>>;
         container::chain<P, Test, Test> c;
         double main(double v) {
             c.getParameter<0>().connect<0>(c.get<0>());
             c.getParameter<1>().connect<0>(c.get<1>());
             c.setParameter<1>(v);
             return c.get<0>().value * 10.0 + c.get<1>().value;
         }",
    );
    assert_eq!(call(&src, &[Value::Double(0.75)]), Ok(Value::Double(0.75)));
}

#[test]
fn unconnected_slot_is_rejected_before_running() {
    let src = with_node(
        "container::chain<parameter::plain<Test, 0>, Test> c;
         int main() { c.setParameter<0>(0.5); return 0; }",
    );
    let err = CompileUnit::new("e2e", src)
        .compile()
        .err()
        .expect("unconnected slot");
    assert_eq!(err.failing_phase, Phase::Connect);
    assert!(err.first_message().ends_with("connection 0 is not connected"));
}

// ── Nodes ───────────────────────────────────────────────────────────────────

#[test]
fn fix_wrapper_matching_native_channels_processes() {
    let src = with_node("using Fixed = wrap::fix<1, Test>;");
    let compiled = CompileUnit::new("e2e", src)
        .with_entry_node("Fixed", 1)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");
    let mut data = vec![vec![1.0, 2.0, 3.0]];
    unit.process_node("Fixed", &mut data, &[]).expect("process");
    assert_eq!(data, vec![vec![2.0, 4.0, 6.0]]);

    // State survives between blocks: the node is created once.
    unit.process_node("Fixed", &mut data, &[]).expect("process");
    assert_eq!(data, vec![vec![4.0, 8.0, 12.0]]);
}

#[test]
fn chain_entry_runs_frame_only_children_per_frame() {
    let src = with_node("using C = container::chain<parameter::empty, Test, wrap::fix<1, Test>>;");
    let compiled = CompileUnit::new("e2e", src)
        .with_entry_node("C", 1)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");
    let mut data = vec![vec![1.0, 2.0, 3.0]];
    unit.process_node("C", &mut data, &[]).expect("process");
    assert_eq!(data, vec![vec![4.0, 8.0, 12.0]]);
}

#[test]
fn interpolating_indexes_read_between_slots() {
    let src = "float main(float x) {
        span<float, 4> d = {0.0f, 1.0f, 2.0f, 3.0f};
        index::lerp<index::unscaled<float, index::clamped<4>>> l(x);
        index::hermite<index::unscaled<float, index::clamped<4>>> h(x);
        return d[l] + d[h];
    }";
    assert_eq!(call(src, &[Value::Float(1.5)]), Ok(Value::Float(3.0)));
    assert_eq!(call(src, &[Value::Float(0.25)]), Ok(Value::Float(0.4296875)));
}

#[test]
fn fix_wrapper_with_wrong_channel_count_is_rejected() {
    let src = with_node("wrap::fix<2, Test> obj; int main() { return 0; }");
    let err = CompileUnit::new("e2e", src)
        .compile()
        .err()
        .expect("channel mismatch");
    assert_eq!(err.failing_phase, Phase::Analyze);
    assert!(err
        .first_message()
        .ends_with("wrap::fix<2, Test>: illegal channel wrap amount"));
}

#[test]
fn events_reach_the_node_before_its_block() {
    let src = "struct Gate {
            static const int NumChannels = 1;
            float gain = 0.0f;
            void reset() { gain = 0.0f; }
            void handleHiseEvent(HiseEvent& e) { if (e.isNoteOn()) { gain = 0.5f; } }
            void processFrame(span<float, 1>& d) { d[0] = d[0] * gain; }
        };";
    let compiled = CompileUnit::new("e2e", src)
        .with_entry_node("Gate", 1)
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");

    let mut silent = vec![vec![1.0; 4]];
    unit.process_node("Gate", &mut silent, &[]).expect("process");
    assert_eq!(silent, vec![vec![0.0; 4]]);

    let note = HiseEvent {
        kind: EventType::NoteOn,
        channel: 1,
        value1: 60,
        value2: 100,
        timestamp: 0,
    };
    let mut open = vec![vec![1.0; 4]];
    unit.process_node("Gate", &mut open, &[note]).expect("process");
    assert_eq!(open, vec![vec![0.5; 4]]);
}

// ── Run-time errors ─────────────────────────────────────────────────────────

#[test]
fn external_data_is_bound_during_prepare() {
    let src = "
        struct Table {
            static const int NumChannels = 1;
            void reset() {}
            void setExternalData(const ExternalData& d, int index) { d.referBlockTo(table, 0); }
            void processFrame(span<float, 1>& data) { data[0] = table[1]; }
            dyn<float> table;
        };
        wrap::data<Table, 0> w;
        float main() {
            PrepareSpecs ps;
            w.prepare(ps);
            span<float, 1> f = {0.0f};
            w.processFrame(f);
            return f[0];
        }";
    let compiled = CompileUnit::new("e2e", src)
        .with_external_data(vec![ExternalData::mono(vec![0.25f32, 0.5, 0.75])])
        .compile()
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e));
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");
    assert_eq!(unit.call("main", &[]), Ok(Value::Float(0.5)));
}

#[test]
fn unknown_entry_points_are_reported() {
    let compiled = CompileUnit::new("e2e", "int main() { return 0; }")
        .compile()
        .expect("compile");
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");
    assert_eq!(
        unit.call("missing", &[]),
        Err(BackendError::UnknownFunction("missing".into()))
    );
    let mut data = vec![vec![0.0]];
    assert_eq!(
        unit.process_node("Nope", &mut data, &[]),
        Err(BackendError::UnknownNode("Nope".into()))
    );
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let src = "int down(int n) { return down(n + 1); } int main() { return down(0); }";
    // The evaluator recurses natively; give it room to reach its own limit.
    let result = std::thread::Builder::new()
        .stack_size(256 * 1024 * 1024)
        .spawn(move || call(src, &[]))
        .expect("spawn")
        .join()
        .expect("join");
    assert!(matches!(result, Err(BackendError::StackOverflow(_))));
}
