use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Sample Streamlet programs ───────────────────────────────────────────────

const SIMPLE_PIPELINE: &str = r#"
void->int filter Counter {
    int n = 0;
    work push 1 { push(n); n = n + 1; }
}
int->void filter Printer { work pop 1 { println(pop()); } }
void->void pipeline Main { add Counter(); add Printer(); }
"#;

const MEDIUM_PIPELINE: &str = r#"
void->int filter Source {
    int n = 0;
    work push 8 { for (int i = 0; i < 8; i++) { push(n); n = n + 1; } }
}
int->int filter Scale(int k) {
    work pop 1 push 1 { push(pop() * k); }
}
int->int filter MovingSum {
    work peek 4 pop 1 push 1 {
        push(peek(0) + peek(1) + peek(2) + peek(3));
        pop();
    }
}
int->void filter Sink { work pop 1 { pop(); } }
void->void pipeline Main {
    add Source();
    add Scale(3);
    add MovingSum();
    add Sink();
}
"#;

const SPLITJOIN_PIPELINE: &str = r#"
void->int filter Source {
    int n = 0;
    work push 16 { for (int i = 0; i < 16; i++) { push(n); n = n + 1; } }
}
int->int filter Lag(int k) {
    work pop 16 push 1 {
        int acc = 0;
        for (int i = 0; i < 16; i++) { acc = acc + pop() * k; }
        push(acc);
    }
}
int->int splitjoin Correlate {
    split duplicate;
    add Lag(1);
    add Lag(2);
    add Lag(3);
    add Lag(4);
    join roundrobin;
}
int->void filter Sink { work pop 4 { for (int i = 0; i < 4; i++) pop(); } }
void->void pipeline Main {
    add Source();
    add Correlate();
    add Sink();
}
"#;

fn compile_to_vhdl(source: &str) {
    let parsed = shc::parser::parse(source);
    let mut state = shc::pipeline::CompilationState::new(parsed.program.unwrap());
    shc::pipeline::run_pipeline(
        &mut state,
        shc::pass::PassId::EmitVhdl,
        &shc::pipeline::EmitOptions::default(),
        false,
        |_, _| {},
    )
    .unwrap();
    black_box(state.artifacts.vhdl);
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for (name, source) in [
        ("simple", SIMPLE_PIPELINE),
        ("medium", MEDIUM_PIPELINE),
        ("splitjoin", SPLITJOIN_PIPELINE),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| black_box(shc::parser::parse(source)));
        });
    }
    group.finish();
}

fn bench_full_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_to_vhdl");
    for (name, source) in [
        ("simple", SIMPLE_PIPELINE),
        ("medium", MEDIUM_PIPELINE),
        ("splitjoin", SPLITJOIN_PIPELINE),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| compile_to_vhdl(source));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_full_compile);
criterion_main!(benches);
