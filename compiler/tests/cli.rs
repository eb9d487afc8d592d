// CLI conformance at the binary boundary: exit codes and emitted files.
//
// Exit codes: 0 success, 1 parse/semantic error, 2 internal error,
// 3 I/O error.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

fn shc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shc"))
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_dir = std::env::temp_dir();
    if ext.is_empty() {
        tmp_dir.join(format!("{}_{}_{}", prefix, std::process::id(), n))
    } else {
        tmp_dir.join(format!("{}_{}_{}.{}", prefix, std::process::id(), n, ext))
    }
}

const COUNTER_PROGRAM: &str = "void->int filter Counter {
    int n = 0;
    work push 1 { push(n); n = n + 1; }
}
int->void filter OutputWriter { work pop 1 { println(pop()); } }
void->void pipeline Main { add Counter(); add OutputWriter(); }
";

#[test]
fn successful_compile_writes_artefacts_and_exits_zero() {
    let src = temp_path("shc_cli_ok", "str");
    let out = temp_path("shc_cli_ok_out", "");
    std::fs::write(&src, COUNTER_PROGRAM).unwrap();

    let output = Command::new(shc_binary())
        .arg(&src)
        .arg("-o")
        .arg(&out)
        .arg("--name")
        .arg("counter")
        .output()
        .expect("failed to run shc");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    for file in [
        "filter_Counter.c",
        "filter_OutputWriter.c",
        "filter_Counter_0.vhd",
        "filter_OutputWriter_1.vhd",
        "counter.vhd",
        "counter_tb.vhd",
        "manifest.json",
    ] {
        assert!(out.join(file).exists(), "missing {file}");
    }

    let manifest = std::fs::read_to_string(out.join("manifest.json")).unwrap();
    assert!(manifest.contains("\"counter.vhd\""));
    assert!(manifest.contains("\"hls_c\""));
}

#[test]
fn semantic_error_exits_one() {
    let src = temp_path("shc_cli_sema", "str");
    std::fs::write(
        &src,
        "int->int filter F { work pop 1 push 1 { int x = true; push(pop() + x); } }
        void->void pipeline Main { add F(); }",
    )
    .unwrap();

    let output = Command::new(shc_binary())
        .arg(&src)
        .output()
        .expect("failed to run shc");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0200"), "stderr: {stderr}");
}

#[test]
fn parse_error_exits_one() {
    let src = temp_path("shc_cli_parse", "str");
    std::fs::write(&src, "void->void pipeline Main { add ; }").unwrap();

    let output = Command::new(shc_binary())
        .arg(&src)
        .output()
        .expect("failed to run shc");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0001"), "stderr: {stderr}");
}

#[test]
fn missing_input_exits_three() {
    let output = Command::new(shc_binary())
        .arg("/nonexistent/definitely_missing.str")
        .output()
        .expect("failed to run shc");
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn dot_emission_writes_graphviz() {
    let src = temp_path("shc_cli_dot", "str");
    let out = temp_path("shc_cli_dot_out", "");
    std::fs::write(&src, COUNTER_PROGRAM).unwrap();

    let output = Command::new(shc_binary())
        .arg(&src)
        .arg("-o")
        .arg(&out)
        .arg("--name")
        .arg("counter")
        .arg("--emit")
        .arg("dot")
        .output()
        .expect("failed to run shc");
    assert!(output.status.success());
    let dot = std::fs::read_to_string(out.join("counter.dot")).unwrap();
    assert!(dot.starts_with("digraph streamlet {"));
    assert!(dot.contains("multiplicity"));
}
