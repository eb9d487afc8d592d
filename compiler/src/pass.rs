// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's 5 semantic passes (parse is outside the runner),
// their dependency edges, and the artifacts they produce. Used by the
// pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (parse excluded — handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Sema,
    Lower,
    BuildGraph,
    EmitC,
    EmitVhdl,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Sema,    // SemaProgram
    Lowered, // LoweredProgram
    Graph,   // StreamGraph
    CCode,   // GeneratedCode
    Vhdl,    // Vec<VhdlFile>
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What the pass guarantees on success.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Sema => PassDescriptor {
            name: "sema",
            inputs: &[],
            outputs: &[ArtifactId::Sema],
            invariants: "every expression typed, every name resolved",
        },
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[PassId::Sema],
            outputs: &[ArtifactId::Lowered],
            invariants: "every emitted IR function passes verification",
        },
        // Lowering completes for all filters before the graph is built,
        // so instances reference finished IR modules.
        PassId::BuildGraph => PassDescriptor {
            name: "build_graph",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::Graph],
            invariants: "every channel satisfies producer push = consumer pop",
        },
        PassId::EmitC => PassDescriptor {
            name: "emit_c",
            inputs: &[PassId::BuildGraph],
            outputs: &[ArtifactId::CCode],
            invariants: "one C file per filter permutation",
        },
        PassId::EmitVhdl => PassDescriptor {
            name: "emit_vhdl",
            inputs: &[PassId::EmitC],
            outputs: &[ArtifactId::Vhdl],
            invariants: "wrappers, interconnect, and test bench emitted",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All 5 pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 5] = [
    PassId::Sema,
    PassId::Lower,
    PassId::BuildGraph,
    PassId::EmitC,
    PassId::EmitVhdl,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
