// End-to-end pipeline tests through the library API: parse → sema →
// lower → graph → emit, with cross-artifact consistency checks.

use shc::pass::PassId;
use shc::pipeline::{compute_provenance, run_pipeline, CompilationState, EmitOptions};

fn compile(source: &str, terminal: PassId) -> CompilationState {
    let parsed = shc::parser::parse(source);
    assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
    let mut state = CompilationState::new(parsed.program.unwrap());
    state.provenance = Some(compute_provenance(source));
    let _ = run_pipeline(&mut state, terminal, &EmitOptions::default(), false, |_, _| {});
    state
}

const COUNTER: &str = "void->int filter Counter {
    int n = 0;
    work push 1 { push(n); n = n + 1; }
}
int->void filter OutputWriter { work pop 1 { println(pop()); } }
void->void pipeline Main { add Counter(); add OutputWriter(); }";

#[test]
fn counter_compiles_to_all_artifacts() {
    let state = compile(COUNTER, PassId::EmitVhdl);
    assert!(!state.has_error, "{:?}", state.diagnostics);

    // Stream graph: one channel, multiplicity 1, depth 4.
    let graph = state.artifacts.graph.as_ref().unwrap();
    assert_eq!(graph.channels.len(), 1);
    assert_eq!(graph.channels[0].multiplicity, 1);
    assert_eq!(graph.channels[0].depth, 4);

    // C: one file per filter; the counter pushes its state then bumps it.
    let c_code = state.artifacts.c_code.as_ref().unwrap();
    assert_eq!(c_code.files.len(), 2);
    let counter_c = c_code.files.iter().find(|f| f.name == "Counter").unwrap();
    assert!(counter_c.source.contains("llvm_cbe_n"));
    assert!(counter_c.source.contains("Counter_work"));

    // VHDL: wrapper per instance + top + test bench.
    let vhdl = state.artifacts.vhdl.as_ref().unwrap();
    assert_eq!(vhdl.len(), 4);
    let tb = vhdl
        .iter()
        .find(|f| f.filename.ends_with("_tb.vhd"))
        .unwrap();
    // The bench observes the output FIFO of the counter.
    assert!(tb.source.contains("mon_dout"));
    assert!(tb.source.contains("writeline"));
}

#[test]
fn type_mismatch_produces_diagnostic_and_stops() {
    // `int x = true;` reports a TypeMismatch pointing at the
    // initializer, and no downstream artifacts are produced.
    let state = compile(
        "int->int filter F { work pop 1 push 1 { int x = true; push(pop() + x); } }
        void->int filter Src { work push 1 { push(1); } }
        int->void filter Snk { work pop 1 { pop(); } }
        void->void pipeline Main { add Src(); add F(); add Snk(); }",
        PassId::EmitVhdl,
    );
    assert!(state.has_error);
    assert!(state
        .diagnostics
        .iter()
        .any(|d| d.code.map(|c| c.0) == Some("E0200")));
    assert!(state.artifacts.lowered.is_none());
    assert!(state.artifacts.c_code.is_none());
}

#[test]
fn short_circuit_and_only_evaluates_rhs_conditionally() {
    // In `f() && g()`, the call to g must sit in a block guarded by a
    // conditional branch, never in the entry block.
    let state = compile(
        "boolean side(boolean x) { return !x; }
        boolean->boolean filter F {
            work pop 1 push 1 {
                boolean a = pop();
                push(a && side(a));
            }
        }
        void->boolean filter Src { work push 1 { push(true); } }
        boolean->void filter Snk { work pop 1 { pop(); } }
        void->void pipeline Main { add Src(); add F(); add Snk(); }",
        PassId::EmitVhdl,
    );
    assert!(!state.has_error, "{:?}", state.diagnostics);

    let sema = state.artifacts.sema.as_ref().unwrap();
    let lowered = state.artifacts.lowered.as_ref().unwrap();
    let f_idx = sema.filters.iter().position(|f| f.name == "F").unwrap();
    let module = &lowered
        .filters
        .iter()
        .find(|fm| fm.filter == f_idx)
        .unwrap()
        .module;
    let work = module.function("F_work").unwrap();

    // Locate the call to side() and check it is not in the entry block.
    let mut call_block = None;
    for (bidx, block) in work.blocks.iter().enumerate() {
        for &v in &block.insts {
            if let Some(inst) = work.inst(v) {
                if let shc::ir::Opcode::Call { callee, .. } = &inst.op {
                    if callee.symbol.starts_with("side") {
                        call_block = Some(bidx);
                    }
                }
            }
        }
    }
    let call_block = call_block.expect("call to side() not found");
    assert_ne!(call_block, 0, "short-circuit rhs must not be unconditional");

    // The emitted C guards the rhs with a branch and merges via a PHI
    // shadow variable.
    let c_code = state.artifacts.c_code.as_ref().unwrap();
    let f_c = c_code.files.iter().find(|f| f.name == "F").unwrap();
    assert!(f_c.source.contains("__PHI_TEMPORARY"));
    assert!(f_c.source.contains("if ("));
}

#[test]
fn scramble_array_and_rates_flow_to_hardware() {
    // A pop-1 push-8 filter with a 7-element state array: the producer
    // channel multiplicity is 8 per firing, and the C emitter wraps the
    // array in a single-field struct.
    let state = compile(
        "int->int filter Scramble {
            int[7] s = {1, 1, 0, 1, 1, 0, 0};
            work pop 1 push 8 {
                int v = pop();
                for (int i = 0; i < 8; i++) push(v + s[3]);
            }
        }
        void->int filter Src { work push 1 { push(1); } }
        int->void filter Snk { work pop 1 { pop(); } }
        void->void pipeline Main { add Src(); add Scramble(); add Snk(); }",
        PassId::EmitVhdl,
    );
    assert!(!state.has_error, "{:?}", state.diagnostics);

    let graph = state.artifacts.graph.as_ref().unwrap();
    let scramble = graph
        .filter_instances()
        .find(|(_, f)| f.name.starts_with("Scramble"))
        .unwrap();
    let out = graph
        .channels
        .iter()
        .find(|c| c.source == scramble.0)
        .unwrap();
    assert_eq!(out.multiplicity, scramble.1.multiplicity * 8);

    let c_code = state.artifacts.c_code.as_ref().unwrap();
    let c = c_code.files.iter().find(|f| f.name == "Scramble").unwrap();
    assert!(c.source.contains("struct l_array_7_uint32_t"));
}

#[test]
fn recompiling_the_same_source_is_deterministic() {
    let first = compile(COUNTER, PassId::EmitVhdl);
    let second = compile(COUNTER, PassId::EmitVhdl);
    let c1 = &first.artifacts.c_code.as_ref().unwrap().files;
    let c2 = &second.artifacts.c_code.as_ref().unwrap().files;
    assert_eq!(c1.len(), c2.len());
    for (a, b) in c1.iter().zip(c2.iter()) {
        assert_eq!(a.source, b.source);
    }
    let v1 = &first.artifacts.vhdl.as_ref().unwrap();
    let v2 = &second.artifacts.vhdl.as_ref().unwrap();
    for (a, b) in v1.iter().zip(v2.iter()) {
        assert_eq!(a.source, b.source);
    }
    assert_eq!(
        first.provenance.as_ref().unwrap().source_hash,
        second.provenance.as_ref().unwrap().source_hash
    );
}

#[test]
fn every_ir_function_passes_verification() {
    let state = compile(
        "int gain(int x) { return x * 2; }
        void->int filter Src {
            int n = 0;
            work push 4 {
                for (int i = 0; i < 4; i++) {
                    if (n > 100) { n = 0; } else { n = n + 1; }
                    push(gain(n));
                }
            }
        }
        int->int filter Window {
            work peek 2 pop 2 push 1 { push(peek(0) + peek(1)); pop(); pop(); }
        }
        int->void filter Snk { work pop 1 { pop(); } }
        void->void pipeline Main { add Src(); add Window(); add Snk(); }",
        PassId::EmitVhdl,
    );
    assert!(!state.has_error, "{:?}", state.diagnostics);
    let lowered = state.artifacts.lowered.as_ref().unwrap();
    for fm in &lowered.filters {
        for func in &fm.module.functions {
            assert!(
                shc::ir::verify(func).is_empty(),
                "IR verification failed for {}: {:?}",
                func.name,
                shc::ir::verify(func)
            );
        }
    }
    for func in &lowered.shared.functions {
        assert!(shc::ir::verify(func).is_empty());
    }
}
