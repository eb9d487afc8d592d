// pipeline.rs — Compilation state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId, accumulating diagnostics and short-circuiting on the
// first pass that reports an error.
//
// Preconditions: the parsed Program must be set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or
//                 has_error is set.
// Failure modes: any pass emitting error-level diagnostics.
// Side effects: calls the on_pass_complete callback after each pass for
//               immediate display.

use std::time::Instant;

use crate::ast::Program;
use crate::codegen::GeneratedCode;
use crate::diag::{DiagLevel, Diagnostic};
use crate::graph::StreamGraph;
use crate::lower::LoweredProgram;
use crate::pass::{descriptor, required_passes, PassId};
use crate::sema::SemaProgram;
use crate::vhdl::{VhdlFile, VhdlOptions};

// ── Artifact storage ───────────────────────────────────────────────────────

/// Artifacts produced by the passes, in dependency order.
pub struct Artifacts {
    pub program: Program,
    pub sema: Option<SemaProgram>,
    pub lowered: Option<LoweredProgram>,
    pub graph: Option<StreamGraph>,
    pub c_code: Option<GeneratedCode>,
    pub vhdl: Option<Vec<VhdlFile>>,
}

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `source_hash`: SHA-256 of the raw `.str` source text.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.source_hash {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

/// Compute provenance from the source text (SHA-256).
pub fn compute_provenance(source: &str) -> Provenance {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);

    Provenance {
        source_hash: hash,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub artifacts: Artifacts,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(program: Program) -> Self {
        Self {
            artifacts: Artifacts {
                program,
                sema: None,
                lowered: None,
                graph: None,
                c_code: None,
                vhdl: None,
            },
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Emission options ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub vhdl: VhdlOptions,
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "shc: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose →
/// error check.
///
/// Preconditions: `state.artifacts.program` is set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)`
///   are populated, or `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics.
/// Side effects: calls `on_pass_complete` after each pass.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &EmitOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for &pass_id in &required_passes(terminal) {
        match pass_id {
            PassId::Sema => {
                let t = Instant::now();
                let result = crate::sema::analyze(&state.artifacts.program);
                let elapsed = t.elapsed();
                state.artifacts.sema = Some(result.program);
                finish_pass(
                    state,
                    PassId::Sema,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Lower => {
                let t = Instant::now();
                let result =
                    crate::lower::lower_program(state.artifacts.sema.as_mut().unwrap());
                let elapsed = t.elapsed();
                state.artifacts.lowered = Some(result.lowered);
                finish_pass(
                    state,
                    PassId::Lower,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::BuildGraph => {
                let t = Instant::now();
                let result = crate::graph::build_graph(state.artifacts.sema.as_ref().unwrap());
                let elapsed = t.elapsed();
                state.artifacts.graph = Some(result.graph);
                finish_pass(
                    state,
                    PassId::BuildGraph,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::EmitC => {
                let t = Instant::now();
                let result = crate::codegen::emit_c(
                    state.artifacts.sema.as_ref().unwrap(),
                    state.artifacts.lowered.as_ref().unwrap(),
                    state.artifacts.graph.as_ref().unwrap(),
                );
                let elapsed = t.elapsed();
                state.artifacts.c_code = Some(result.generated);
                finish_pass(
                    state,
                    PassId::EmitC,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::EmitVhdl => {
                let t = Instant::now();
                let result = crate::vhdl::emit_vhdl(
                    state.artifacts.sema.as_ref().unwrap(),
                    state.artifacts.graph.as_ref().unwrap(),
                    &options.vhdl,
                );
                let elapsed = t.elapsed();
                state.artifacts.vhdl = Some(result.files);
                finish_pass(
                    state,
                    PassId::EmitVhdl,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
        }
    }
    Ok(())
}
