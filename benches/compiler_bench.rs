use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use dsplc::backend::Value;
use dsplc::eval::ReferenceBackend;
use dsplc::pipeline::CompileUnit;
use dsplc::sema::{self, AnalyzeOptions};
use dsplc::{graph, parser};

// KPI-aligned benchmark scenarios. Every scenario compiles cleanly.

const SIMPLE: &str = r#"
int main(int v)
{
    span<int, 5> d = { 1, 2, 3, 4, 5 };
    index::wrapped<5> i(v);
    return d[i];
}
"#;

const TEMPLATES: &str = r#"
template <int N> struct Delay
{
    span<float, N> buffer;
    int write = 0;

    float tick(float input)
    {
        index::wrapped<N> i(write);
        float out = buffer[i];
        buffer[i] = input;
        write = write + 1;
        return out;
    }
};

Delay<4> d4;
Delay<16> d16;
Delay<64> d64;

float main(float x)
{
    return d4.tick(x) + d16.tick(x) + d64.tick(x);
}
"#;

const NODES: &str = r#"
struct Gain
{
    static const int NumChannels = 1;
    void reset() { v = 1.0; }
    template <int P> void setParameter(double x) { v = x; }
    void processFrame(span<float, 1>& data) { data[0] = data[0] * 0.5f; }
    double v = 0.0;
};

using P = parameter::chain<ranges::Identity, parameter::plain<Gain, 0>, parameter::plain<Gain, 0>>;
container::chain<P, Gain, Gain, wrap::fix<1, Gain>> c;

double main(double x)
{
    c.getParameter<0>().connect<0>(c.get<0>());
    c.getParameter<0>().connect<1>(c.get<1>());
    c.setParameter<0>(x);
    return c.get<0>().v + c.get<1>().v;
}
"#;

fn scenarios() -> [(&'static str, &'static str); 3] {
    [("simple", SIMPLE), ("templates", TEMPLATES), ("nodes", NODES)]
}

/// One struct template instantiated `n` times with distinct arguments.
fn generate_instantiations(n: usize) -> String {
    let mut src = String::from("template <int N> struct Acc { span<int, N> d; int sum() { int s = 0; for (auto& x : d) { s += x; } return s; } };\n");
    for i in 1..=n {
        src.push_str(&format!("Acc<{}> a{};\n", i, i));
    }
    src.push_str("int main() { int s = 0;");
    for i in 1..=n {
        src.push_str(&format!(" s += a{}.sum();", i));
    }
    src.push_str(" return s; }\n");
    src
}

// KPI: parser latency for representative scenarios.
fn bench_kpi_parse_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/parse_latency");

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let r = parser::parse(black_box(source));
                black_box(&r.program);
            });
        });
    }

    group.finish();
}

// KPI: full compile latency (parse -> analyze -> connect -> layout).
fn bench_kpi_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let unit = CompileUnit::new(name, black_box(source));
                let compiled = unit.compile().expect("benchmark scenario must compile");
                black_box(compiled.graph.layouts.len());
            });
        });
    }

    group.finish();
}

// KPI: phase-level latency on the node scenario.
fn bench_kpi_phase_latency(c: &mut Criterion) {
    let source = NODES;
    let options = AnalyzeOptions::default();

    {
        let mut group = c.benchmark_group("kpi/phase_latency/analyze");
        group.bench_function("nodes", |b| {
            b.iter_batched(
                || parser::parse(source).program.expect("benchmark scenario must parse"),
                |ast| {
                    let r = sema::analyze(black_box(&ast), &options);
                    black_box(r.is_ok());
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("kpi/phase_latency/layout");
        group.bench_function("nodes", |b| {
            b.iter_batched(
                || {
                    let ast = parser::parse(source).program.expect("benchmark scenario must parse");
                    let (prog, _) = sema::analyze(&ast, &options).expect("benchmark scenario must analyze");
                    prog
                },
                |prog| {
                    assert!(graph::check_connections(&prog).is_empty());
                    black_box(graph::build(black_box(&prog)));
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }
}

// KPI: reference backend call latency once compiled.
fn bench_kpi_eval_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/eval_latency");
    let compiled = CompileUnit::new("templates", TEMPLATES)
        .compile()
        .expect("benchmark scenario must compile");
    let mut backend = ReferenceBackend;
    let mut unit = compiled.instantiate(&mut backend).expect("instantiate");

    group.bench_function("templates", |b| {
        b.iter(|| {
            let v = unit.call("main", &[Value::Float(black_box(0.5))]);
            black_box(v)
        });
    });

    group.finish();
}

// KPI: analysis scaling vs number of distinct instantiations.
fn bench_kpi_instantiation_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/instantiation_scaling");

    for n in [1_usize, 8, 32, 64] {
        let source = generate_instantiations(n);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}instances", n)),
            &source,
            |b, source| {
                b.iter(|| {
                    let compiled = CompileUnit::new("scaling", black_box(source.as_str()))
                        .compile()
                        .expect("generated program must compile");
                    black_box(compiled.stats.instantiations);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_kpi_parse_latency,
    bench_kpi_full_compile_latency,
    bench_kpi_phase_latency,
    bench_kpi_eval_latency,
    bench_kpi_instantiation_scaling,
);
criterion_main!(benches);
