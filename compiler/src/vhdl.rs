// vhdl.rs — VHDL component shells, interconnect, test bench, manifest
//
// Emits one wrapper entity per filter instance (input FIFO of the
// scheduled depth plus the HLS core component), a top-level entity that
// instantiates wrappers and split/join logic along the stream-graph
// edges, a test bench driving clock/reset and recording the final
// channel to a file, and the project manifest.
//
// The `fifo` entity comes from the fixed component library; the
// `filter_<perm>` cores are produced by the HLS tool from the emitted C.
//
// Preconditions: graph construction and C emission succeeded.
// Postconditions: returns the VHDL file set and manifest for the program.
// Failure modes: float-carrying channels are rejected — the hardware flow
//                is integer-only.
// Side effects: none (pure text generation; callers write files).

use std::fmt::Write as _;

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::graph::{NodeId, SplitMode, StreamGraph, StreamNode};
use crate::sema::SemaProgram;

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VhdlOptions {
    /// Clock period driven by the test bench.
    pub clk_period_ns: u32,
    /// Cycles the test bench holds reset asserted.
    pub reset_cycles: u32,
    /// Top-level entity name.
    pub program_name: String,
}

impl Default for VhdlOptions {
    fn default() -> Self {
        Self {
            clk_period_ns: 10,
            reset_cycles: 4,
            program_name: "program".to_string(),
        }
    }
}

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VhdlFile {
    pub filename: String,
    pub source: String,
}

#[derive(Debug)]
pub struct VhdlResult {
    pub files: Vec<VhdlFile>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Manifest ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub program: String,
    pub compiler_version: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub path: String,
    pub kind: String,
}

impl Manifest {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("manifest serialization cannot fail")
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Emit the VHDL file set: a wrapper per filter instance, the top-level
/// interconnect, and the test bench.
pub fn emit_vhdl(sema: &SemaProgram, graph: &StreamGraph, options: &VhdlOptions) -> VhdlResult {
    let mut diagnostics = Vec::new();

    // The hardware flow carries flattened bit vectors; floats have no
    // integer representation here.
    for channel in &graph.channels {
        if sema.types.contains_float(channel.elem) {
            use chumsky::span::Span as _;
            diagnostics.push(Diagnostic::error(
                codes::E0500,
                crate::ast::Span::new((), 0..0),
                format!(
                    "channel {} -> {} carries '{}', which the integer-only HDL flow cannot represent",
                    graph.node(channel.source).name(),
                    graph.node(channel.dest).name(),
                    sema.types.name(channel.elem),
                ),
            ));
        }
    }
    if crate::diag::has_errors(&diagnostics) {
        return VhdlResult {
            files: Vec::new(),
            diagnostics,
        };
    }

    let mut files = Vec::new();
    for (id, filter) in graph.filter_instances() {
        let perm = &graph.permutations[filter.permutation];
        let source = emit_wrapper(sema, graph, id, filter, perm);
        files.push(VhdlFile {
            filename: format!("filter_{}.vhd", filter.name),
            source,
        });
    }
    files.push(VhdlFile {
        filename: format!("{}.vhd", options.program_name),
        source: emit_top(sema, graph, options),
    });
    files.push(VhdlFile {
        filename: format!("{}_tb.vhd", options.program_name),
        source: emit_test_bench(sema, graph, options),
    });

    VhdlResult {
        files,
        diagnostics,
    }
}

const VHDL_HEADER: &str = "library IEEE;\nuse IEEE.STD_LOGIC_1164.ALL;\nuse IEEE.NUMERIC_STD.ALL;\n\n";

/// HLS tools prefix ported C variables with this string.
const HLS_VARIABLE_PREFIX: &str = "llvm_cbe_";

// ── Filter wrapper ──────────────────────────────────────────────────────────

fn emit_wrapper(
    sema: &SemaProgram,
    graph: &StreamGraph,
    id: NodeId,
    filter: &crate::graph::FilterNode,
    perm: &crate::graph::FilterPermutation,
) -> String {
    let types = &sema.types;
    let has_input = !types.is_void(filter.input);
    let has_output = !types.is_void(filter.output);
    let in_vec = has_input.then(|| types.vhdl_vector_type(filter.input));
    let out_vec = has_output.then(|| types.vhdl_vector_type(filter.output));

    let mut os = String::new();
    os.push_str(VHDL_HEADER);

    // Entity: upstream pushes into our FIFO; downstream handshakes on the
    // core's output.
    let _ = writeln!(os, "entity {}_wrapper is", filter.name);
    os.push_str("  port (\n");
    os.push_str("    clk : in std_logic;\n");
    os.push_str("    rst_n : in std_logic;\n");
    os.push_str("    start : in std_logic;\n");
    os.push_str("    done : out std_logic");
    if let Some(vec) = &in_vec {
        os.push_str(";\n");
        let _ = writeln!(os, "    din : in {vec};");
        os.push_str("    din_write : in std_logic;\n");
        os.push_str("    din_full_n : out std_logic");
    }
    if let Some(vec) = &out_vec {
        os.push_str(";\n");
        let _ = writeln!(os, "    dout : out {vec};");
        os.push_str("    dout_full_n : in std_logic;\n");
        os.push_str("    dout_write : out std_logic");
    }
    os.push_str("\n  );\n");
    let _ = writeln!(os, "end {}_wrapper;", filter.name);
    os.push('\n');
    let _ = writeln!(os, "architecture behav of {}_wrapper is", filter.name);
    os.push('\n');

    // HLS core component declaration.
    let _ = writeln!(os, "component filter_{} is", perm.name);
    os.push_str("  port (\n");
    os.push_str("    ap_clk : in std_logic;\n");
    os.push_str("    ap_rst_n : in std_logic;\n");
    os.push_str("    ap_start : in std_logic;\n");
    os.push_str("    ap_done : out std_logic");
    if let Some(vec) = &in_vec {
        os.push_str(";\n");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_dout : in {vec};");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_empty_n : in std_logic;");
        let _ = write!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_read : out std_logic");
    }
    if let Some(vec) = &out_vec {
        os.push_str(";\n");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_din : out {vec};");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_full_n : in std_logic;");
        let _ = write!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_write : out std_logic");
    }
    os.push_str("\n  );\n");
    os.push_str("end component;\n\n");

    if has_input {
        os.push_str("signal fifo_read : std_logic;\n");
        os.push_str("signal fifo_empty_n : std_logic;\n");
        let _ = writeln!(os, "signal fifo_dout : {};", in_vec.as_ref().unwrap());
    }
    os.push_str("\nbegin\n\n");

    if has_input {
        let depth = graph
            .input_channel(id)
            .map(|c| c.depth)
            .unwrap_or(crate::graph::FIFO_SIZE_MULTIPLIER);
        let width = types.bit_width(filter.input);
        let _ = writeln!(os, "-- FIFO with depth {depth}");
        os.push_str("input_fifo : entity work.fifo(behav)\n");
        os.push_str("  generic map (\n");
        let _ = writeln!(os, "    DATA_WIDTH => {width},");
        let _ = writeln!(os, "    SIZE => {depth}");
        os.push_str("  )\n");
        os.push_str("  port map (\n");
        os.push_str("    clk => clk,\n");
        os.push_str("    rst_n => rst_n,\n");
        os.push_str("    read => fifo_read,\n");
        os.push_str("    write => din_write,\n");
        os.push_str("    empty_n => fifo_empty_n,\n");
        os.push_str("    full_n => din_full_n,\n");
        os.push_str("    dout => fifo_dout,\n");
        os.push_str("    din => din\n");
        os.push_str("  );\n\n");
    }

    let _ = writeln!(os, "core : filter_{}", perm.name);
    os.push_str("  port map (\n");
    os.push_str("    ap_clk => clk,\n");
    os.push_str("    ap_rst_n => rst_n,\n");
    os.push_str("    ap_start => start,\n");
    os.push_str("    ap_done => done");
    if has_input {
        os.push_str(",\n");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_dout => fifo_dout,");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_empty_n => fifo_empty_n,");
        let _ = write!(os, "    {HLS_VARIABLE_PREFIX}in_ptr_read => fifo_read");
    }
    if has_output {
        os.push_str(",\n");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_din => dout,");
        let _ = writeln!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_full_n => dout_full_n,");
        let _ = write!(os, "    {HLS_VARIABLE_PREFIX}out_ptr_write => dout_write");
    }
    os.push_str("\n  );\n");
    os.push_str("\nend behav;\n");
    os
}

// ── Top level ───────────────────────────────────────────────────────────────

/// Signal stem for a channel, derived from its endpoints.
fn channel_stem(graph: &StreamGraph, channel: &crate::graph::Channel) -> String {
    format!(
        "{}_to_{}",
        graph.node(channel.source).name(),
        graph.node(channel.dest).name()
    )
}

/// The channel feeding the final leaf of the program (what the test bench
/// records).
fn last_channel(graph: &StreamGraph) -> Option<usize> {
    // The final sink is a filter with no output connection; its input
    // channel is the program's observable output.
    let sink = graph
        .filter_instances()
        .find(|(_, f)| f.output_connection.is_none())?
        .0;
    graph.channels.iter().position(|c| c.dest == sink)
}

fn emit_top(sema: &SemaProgram, graph: &StreamGraph, options: &VhdlOptions) -> String {
    let types = &sema.types;
    let mut signals = String::new();
    let mut body = String::new();
    let monitor = last_channel(graph);

    // Per-channel interconnect signals (producer-side handshake).
    for channel in &graph.channels {
        let stem = channel_stem(graph, channel);
        let vec = types.vhdl_vector_type(channel.elem);
        let _ = writeln!(signals, "signal {stem}_din : {vec};");
        let _ = writeln!(signals, "signal {stem}_write : std_logic;");
        let _ = writeln!(signals, "signal {stem}_full_n : std_logic;");
    }
    let _ = writeln!(signals, "signal all_done : std_logic;");

    // Filter instances.
    let mut done_signals = Vec::new();
    for (id, filter) in graph.filter_instances() {
        let _ = writeln!(
            body,
            "-- Filter instance {} (permutation {})",
            filter.name, graph.permutations[filter.permutation].name
        );
        let done = format!("{}_done", filter.name);
        let _ = writeln!(signals, "signal {done} : std_logic;");
        done_signals.push(done.clone());

        let _ = writeln!(body, "{} : entity work.{}_wrapper(behav)", filter.name, filter.name);
        body.push_str("  port map (\n");
        body.push_str("    clk => clk,\n");
        body.push_str("    rst_n => rst_n,\n");
        body.push_str("    start => start,\n");
        let _ = write!(body, "    done => {done}");
        if let Some(input) = graph.input_channel(id) {
            let stem = channel_stem(graph, input);
            body.push_str(",\n");
            let _ = writeln!(body, "    din => {stem}_din,");
            let _ = writeln!(body, "    din_write => {stem}_write,");
            let _ = write!(body, "    din_full_n => {stem}_full_n");
        }
        if let Some(output) = graph.channels.iter().find(|c| c.source == id) {
            let stem = channel_stem(graph, output);
            body.push_str(",\n");
            let _ = writeln!(body, "    dout => {stem}_din,");
            let _ = writeln!(body, "    dout_full_n => {stem}_full_n,");
            let _ = write!(body, "    dout_write => {stem}_write");
        } else if filter.output_connection.is_none() && !types.is_void(filter.output) {
            // Dangling output (no consumer): sink the handshake.
            body.push_str(",\n");
            body.push_str("    dout => open,\n");
            body.push_str("    dout_full_n => '1',\n");
            body.push_str("    dout_write => open");
        }
        body.push_str("\n  );\n\n");
    }

    // Split and join logic.
    for (idx, node) in graph.nodes.iter().enumerate() {
        let id = NodeId(idx as u32);
        match node {
            StreamNode::Split(split) => {
                emit_split(sema, graph, id, split, &mut signals, &mut body);
            }
            StreamNode::Join(join) => {
                emit_join(sema, graph, id, join, &mut signals, &mut body);
            }
            _ => {}
        }
    }

    let _ = writeln!(
        body,
        "all_done <= {};",
        if done_signals.is_empty() {
            "'1'".to_string()
        } else {
            done_signals.join(" and ")
        }
    );
    body.push_str("done <= all_done;\n");
    if let Some(mon) = monitor {
        let stem = channel_stem(graph, &graph.channels[mon]);
        let _ = writeln!(body, "mon_dout <= {stem}_din;");
        let _ = writeln!(body, "mon_write <= {stem}_write;");
    }

    // Assemble the entity around the collected signals and body.
    let mut os = String::new();
    os.push_str(VHDL_HEADER);
    let _ = writeln!(os, "entity {} is", options.program_name);
    os.push_str("  port (\n");
    os.push_str("    clk : in std_logic;\n");
    os.push_str("    rst_n : in std_logic;\n");
    os.push_str("    start : in std_logic;\n");
    os.push_str("    done : out std_logic");
    if let Some(mon) = monitor {
        let vec = types.vhdl_vector_type(graph.channels[mon].elem);
        os.push_str(";\n");
        let _ = writeln!(os, "    mon_dout : out {vec};");
        os.push_str("    mon_write : out std_logic");
    }
    os.push_str("\n  );\n");
    let _ = writeln!(os, "end {};", options.program_name);
    os.push('\n');
    let _ = writeln!(os, "architecture behav of {} is", options.program_name);
    os.push('\n');
    os.push_str("-- Signal declarations\n");
    os.push_str(&signals);
    os.push('\n');
    os.push_str("-- Start instantiating components\n");
    os.push_str("begin\n");
    os.push('\n');
    os.push_str(&body);
    os.push('\n');
    os.push_str("end behav;\n");
    os
}

/// Duplicate splits fan one element out to every branch at once;
/// round-robin splits walk their weight table with a counter.
fn emit_split(
    sema: &SemaProgram,
    graph: &StreamGraph,
    id: NodeId,
    split: &crate::graph::SplitNode,
    signals: &mut String,
    body: &mut String,
) {
    let types = &sema.types;
    let name = &split.name;
    let vec = types.vhdl_vector_type(split.ty);
    let width = types.bit_width(split.ty);
    let depth = graph
        .input_channel(id)
        .map(|c| c.depth)
        .unwrap_or(crate::graph::FIFO_SIZE_MULTIPLIER);
    let input_stem = graph
        .input_channel(id)
        .map(|c| channel_stem(graph, c))
        .expect("split without an input channel");

    let branch_stems: Vec<String> = graph
        .channels
        .iter()
        .filter(|c| c.source == id)
        .map(|c| channel_stem(graph, c))
        .collect();

    let _ = writeln!(signals, "signal {name}_read : std_logic;");
    let _ = writeln!(signals, "signal {name}_empty_n : std_logic;");
    let _ = writeln!(signals, "signal {name}_dout : {vec};");

    let _ = writeln!(body, "-- Split {name}");
    let _ = writeln!(body, "{name}_fifo : entity work.fifo(behav)");
    body.push_str("  generic map (\n");
    let _ = writeln!(body, "    DATA_WIDTH => {width},");
    let _ = writeln!(body, "    SIZE => {depth}");
    body.push_str("  )\n");
    body.push_str("  port map (\n");
    body.push_str("    clk => clk,\n");
    body.push_str("    rst_n => rst_n,\n");
    let _ = writeln!(body, "    read => {name}_read,");
    let _ = writeln!(body, "    write => {input_stem}_write,");
    let _ = writeln!(body, "    empty_n => {name}_empty_n,");
    let _ = writeln!(body, "    full_n => {input_stem}_full_n,");
    let _ = writeln!(body, "    dout => {name}_dout,");
    let _ = writeln!(body, "    din => {input_stem}_din");
    body.push_str("  );\n\n");

    match split.mode {
        SplitMode::Duplicate => {
            let all_ready: Vec<String> = branch_stems
                .iter()
                .map(|s| format!("{s}_full_n = '1'"))
                .collect();
            let _ = writeln!(
                body,
                "{name}_read <= '1' when {name}_empty_n = '1' and {} else '0';",
                all_ready.join(" and ")
            );
            for stem in &branch_stems {
                let _ = writeln!(body, "{stem}_din <= {name}_dout;");
                let _ = writeln!(body, "{stem}_write <= {name}_read;");
            }
        }
        SplitMode::RoundRobin => {
            let total: u32 = split.weights.iter().sum();
            let _ = writeln!(
                signals,
                "signal {name}_count : integer range 0 to {} := 0;",
                total - 1
            );
            // Cumulative weight boundaries pick the active branch.
            let mut bounds = Vec::new();
            let mut acc = 0;
            for &w in &split.weights {
                acc += w;
                bounds.push(acc);
            }
            let ready: Vec<String> = branch_stems
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let lo = if i == 0 { 0 } else { bounds[i - 1] };
                    format!(
                        "({name}_count >= {lo} and {name}_count < {hi} and {s}_full_n = '1')",
                        hi = bounds[i]
                    )
                })
                .collect();
            let _ = writeln!(
                body,
                "{name}_read <= '1' when {name}_empty_n = '1' and ({}) else '0';",
                ready.join(" or ")
            );
            for (i, stem) in branch_stems.iter().enumerate() {
                let lo = if i == 0 { 0 } else { bounds[i - 1] };
                let hi = bounds[i];
                let _ = writeln!(body, "{stem}_din <= {name}_dout;");
                let _ = writeln!(
                    body,
                    "{stem}_write <= '1' when {name}_read = '1' and {name}_count >= {lo} and {name}_count < {hi} else '0';"
                );
            }
            let _ = writeln!(body, "{name}_counter : process(clk)");
            body.push_str("begin\n");
            body.push_str("  if rising_edge(clk) then\n");
            body.push_str("    if rst_n = '0' then\n");
            let _ = writeln!(body, "      {name}_count <= 0;");
            let _ = writeln!(body, "    elsif {name}_read = '1' then");
            let _ = writeln!(body, "      if {name}_count = {} then", total - 1);
            let _ = writeln!(body, "        {name}_count <= 0;");
            body.push_str("      else\n");
            let _ = writeln!(body, "        {name}_count <= {name}_count + 1;");
            body.push_str("      end if;\n");
            body.push_str("    end if;\n");
            body.push_str("  end if;\n");
            let _ = writeln!(body, "end process {name}_counter;");
        }
    }
    body.push('\n');
}

/// Round-robin joins drain each branch FIFO its weight's worth of
/// elements before advancing.
fn emit_join(
    sema: &SemaProgram,
    graph: &StreamGraph,
    id: NodeId,
    join: &crate::graph::JoinNode,
    signals: &mut String,
    body: &mut String,
) {
    let types = &sema.types;
    let name = &join.name;
    let vec = types.vhdl_vector_type(join.ty);
    let width = types.bit_width(join.ty);

    // One FIFO per incoming branch, in branch order.
    let incoming: Vec<&crate::graph::Channel> =
        graph.channels.iter().filter(|c| c.dest == id).collect();
    let out_stem = graph
        .channels
        .iter()
        .find(|c| c.source == id)
        .map(|c| channel_stem(graph, c));

    let total: u32 = join.weights.iter().sum();
    let _ = writeln!(
        signals,
        "signal {name}_count : integer range 0 to {} := 0;",
        total - 1
    );
    for (i, _) in incoming.iter().enumerate() {
        let _ = writeln!(signals, "signal {name}_b{i}_read : std_logic;");
        let _ = writeln!(signals, "signal {name}_b{i}_empty_n : std_logic;");
        let _ = writeln!(signals, "signal {name}_b{i}_dout : {vec};");
    }

    let _ = writeln!(body, "-- Join {name}");
    for (i, channel) in incoming.iter().enumerate() {
        let stem = channel_stem(graph, channel);
        let _ = writeln!(body, "{name}_b{i}_fifo : entity work.fifo(behav)");
        body.push_str("  generic map (\n");
        let _ = writeln!(body, "    DATA_WIDTH => {width},");
        let _ = writeln!(body, "    SIZE => {}", channel.depth);
        body.push_str("  )\n");
        body.push_str("  port map (\n");
        body.push_str("    clk => clk,\n");
        body.push_str("    rst_n => rst_n,\n");
        let _ = writeln!(body, "    read => {name}_b{i}_read,");
        let _ = writeln!(body, "    write => {stem}_write,");
        let _ = writeln!(body, "    empty_n => {name}_b{i}_empty_n,");
        let _ = writeln!(body, "    full_n => {stem}_full_n,");
        let _ = writeln!(body, "    dout => {name}_b{i}_dout,");
        let _ = writeln!(body, "    din => {stem}_din");
        body.push_str("  );\n");
    }
    body.push('\n');

    // Cumulative weight boundaries pick the active branch.
    let mut bounds = Vec::new();
    let mut acc = 0;
    for &w in &join.weights {
        acc += w;
        bounds.push(acc);
    }
    let Some(out_stem) = out_stem else {
        // A join with no consumer terminates the graph; nothing to drive.
        return;
    };
    let _ = writeln!(signals, "signal {name}_go : std_logic;");

    let ready: Vec<String> = (0..incoming.len())
        .map(|i| {
            let lo = if i == 0 { 0 } else { bounds[i - 1] };
            format!(
                "({name}_count >= {lo} and {name}_count < {hi} and {name}_b{i}_empty_n = '1')",
                hi = bounds[i]
            )
        })
        .collect();
    // Select / advance logic.
    let _ = writeln!(
        body,
        "{name}_go <= '1' when {out_stem}_full_n = '1' and ({}) else '0';",
        ready.join(" or ")
    );
    for i in 0..incoming.len() {
        let lo = if i == 0 { 0 } else { bounds[i - 1] };
        let hi = bounds[i];
        let _ = writeln!(
            body,
            "{name}_b{i}_read <= '1' when {name}_go = '1' and {name}_count >= {lo} and {name}_count < {hi} else '0';"
        );
    }
    let selects: Vec<String> = (0..incoming.len())
        .map(|i| {
            let lo = if i == 0 { 0 } else { bounds[i - 1] };
            format!(
                "{name}_b{i}_dout when {name}_count >= {lo} and {name}_count < {} else",
                bounds[i]
            )
        })
        .collect();
    let _ = writeln!(
        body,
        "{out_stem}_din <= {} (others => '0');",
        selects.join(" ")
    );
    let _ = writeln!(body, "{out_stem}_write <= {name}_go;");
    let _ = writeln!(body, "{name}_counter : process(clk)");
    body.push_str("begin\n");
    body.push_str("  if rising_edge(clk) then\n");
    body.push_str("    if rst_n = '0' then\n");
    let _ = writeln!(body, "      {name}_count <= 0;");
    let _ = writeln!(body, "    elsif {name}_go = '1' then");
    let _ = writeln!(body, "      if {name}_count = {} then", total - 1);
    let _ = writeln!(body, "        {name}_count <= 0;");
    body.push_str("      else\n");
    let _ = writeln!(body, "        {name}_count <= {name}_count + 1;");
    body.push_str("      end if;\n");
    body.push_str("    end if;\n");
    body.push_str("  end if;\n");
    let _ = writeln!(body, "end process {name}_counter;");
    body.push('\n');
}

// ── Test bench ──────────────────────────────────────────────────────────────

fn emit_test_bench(sema: &SemaProgram, graph: &StreamGraph, options: &VhdlOptions) -> String {
    let types = &sema.types;
    let monitor = last_channel(graph);
    let program = &options.program_name;

    let mut os = String::new();
    os.push_str(VHDL_HEADER);
    os.push_str("use STD.TEXTIO.ALL;\n\n");

    let _ = writeln!(os, "entity {program}_tb is");
    let _ = writeln!(os, "end {program}_tb;");
    os.push('\n');
    let _ = writeln!(os, "architecture behav of {program}_tb is");
    os.push('\n');
    let _ = writeln!(os, "constant CLK_PERIOD : time := {} ns;", options.clk_period_ns);
    let _ = writeln!(os, "constant RESET_CYCLES : natural := {};", options.reset_cycles);
    os.push_str("signal clk : std_logic := '0';\n");
    os.push_str("signal runsim : std_logic := '1';\n");
    os.push_str("signal rst_n : std_logic := '0';\n");
    os.push_str("signal start : std_logic := '0';\n");
    os.push_str("signal done : std_logic;\n");
    if let Some(mon) = monitor {
        let vec = types.vhdl_vector_type(graph.channels[mon].elem);
        let _ = writeln!(os, "signal mon_dout : {vec};");
        os.push_str("signal mon_write : std_logic;\n");
    }
    os.push('\n');
    os.push_str("begin\n\n");

    // Clock with the declared period.
    os.push_str("clk_gen : process\n");
    os.push_str("begin\n");
    os.push_str("  while runsim = '1' loop\n");
    os.push_str("    clk <= '0';\n");
    os.push_str("    wait for CLK_PERIOD / 2;\n");
    os.push_str("    clk <= '1';\n");
    os.push_str("    wait for CLK_PERIOD / 2;\n");
    os.push_str("  end loop;\n");
    os.push_str("  wait;\n");
    os.push_str("end process clk_gen;\n\n");

    // Reset held for the configured number of cycles, then start.
    os.push_str("rst_gen : process\n");
    os.push_str("begin\n");
    os.push_str("  rst_n <= '0';\n");
    os.push_str("  for i in 1 to RESET_CYCLES loop\n");
    os.push_str("    wait until rising_edge(clk);\n");
    os.push_str("  end loop;\n");
    os.push_str("  rst_n <= '1';\n");
    os.push_str("  start <= '1';\n");
    os.push_str("  wait;\n");
    os.push_str("end process rst_gen;\n\n");

    // Unit under test.
    let _ = writeln!(os, "uut : entity work.{program}(behav)");
    os.push_str("  port map (\n");
    os.push_str("    clk => clk,\n");
    os.push_str("    rst_n => rst_n,\n");
    os.push_str("    start => start,\n");
    os.push_str("    done => done");
    if monitor.is_some() {
        os.push_str(",\n");
        os.push_str("    mon_dout => mon_dout,\n");
        os.push_str("    mon_write => mon_write");
    }
    os.push_str("\n  );\n\n");

    // Record the output channel to a file, one value per line.
    if monitor.is_some() {
        let _ = writeln!(os, "record_output : process(clk)");
        let _ = writeln!(
            os,
            "  file out_file : text open write_mode is \"{program}_out.txt\";"
        );
        os.push_str("  variable l : line;\n");
        os.push_str("begin\n");
        os.push_str("  if rising_edge(clk) and mon_write = '1' then\n");
        os.push_str("    write(l, to_integer(unsigned(mon_dout)));\n");
        os.push_str("    writeline(out_file, l);\n");
        os.push_str("  end if;\n");
        os.push_str("end process record_output;\n");
    }

    os.push_str("\nend behav;\n");
    os
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhdl_for(source: &str) -> VhdlResult {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let sema = crate::sema::analyze(&parsed.program.unwrap());
        assert!(
            !crate::diag::has_errors(&sema.diagnostics),
            "{:?}",
            sema.diagnostics
        );
        let graph = crate::graph::build_graph(&sema.program);
        assert!(
            !crate::diag::has_errors(&graph.diagnostics),
            "{:?}",
            graph.diagnostics
        );
        emit_vhdl(&sema.program, &graph.graph, &VhdlOptions::default())
    }

    const COUNTER: &str = "void->int filter Counter {
        int n = 0;
        work push 1 { push(n); n = n + 1; }
    }
    int->void filter OutputWriter { work pop 1 { println(pop()); } }
    void->void pipeline Main { add Counter(); add OutputWriter(); }";

    #[test]
    fn wrapper_per_instance_plus_top_and_tb() {
        let result = vhdl_for(COUNTER);
        assert!(result.diagnostics.is_empty());
        let names: Vec<&str> = result.files.iter().map(|f| f.filename.as_str()).collect();
        assert!(names.contains(&"filter_Counter_0.vhd"));
        assert!(names.contains(&"filter_OutputWriter_1.vhd"));
        assert!(names.contains(&"program.vhd"));
        assert!(names.contains(&"program_tb.vhd"));
    }

    #[test]
    fn sink_wrapper_instantiates_depth_4_fifo() {
        let result = vhdl_for(COUNTER);
        let sink = result
            .files
            .iter()
            .find(|f| f.filename == "filter_OutputWriter_1.vhd")
            .unwrap();
        assert!(sink.source.contains("entity OutputWriter_1_wrapper is"));
        assert!(sink.source.contains("-- FIFO with depth 4"));
        assert!(sink.source.contains("SIZE => 4"));
        assert!(sink.source.contains("DATA_WIDTH => 32"));
        assert!(sink.source.contains("llvm_cbe_in_ptr_read"));
        // A sink has no output-side ports.
        assert!(!sink.source.contains("dout_write"));
    }

    #[test]
    fn source_wrapper_has_no_fifo() {
        let result = vhdl_for(COUNTER);
        let counter = result
            .files
            .iter()
            .find(|f| f.filename == "filter_Counter_0.vhd")
            .unwrap();
        assert!(!counter.source.contains("entity work.fifo"));
        assert!(counter.source.contains("llvm_cbe_out_ptr_din"));
    }

    #[test]
    fn top_connects_channel_and_monitors_last_fifo() {
        let result = vhdl_for(COUNTER);
        let top = result
            .files
            .iter()
            .find(|f| f.filename == "program.vhd")
            .unwrap();
        assert!(top.source.contains("entity program is"));
        assert!(top
            .source
            .contains("signal Counter_0_to_OutputWriter_1_din"));
        assert!(top.source.contains("mon_dout <= Counter_0_to_OutputWriter_1_din;"));
        assert!(top.source.contains("entity work.Counter_0_wrapper(behav)"));
    }

    #[test]
    fn test_bench_drives_clock_reset_and_records() {
        let result = vhdl_for(COUNTER);
        let tb = result
            .files
            .iter()
            .find(|f| f.filename == "program_tb.vhd")
            .unwrap();
        assert!(tb.source.contains("constant CLK_PERIOD : time := 10 ns;"));
        assert!(tb.source.contains("constant RESET_CYCLES : natural := 4;"));
        assert!(tb.source.contains("file out_file : text open write_mode is \"program_out.txt\";"));
        assert!(tb.source.contains("to_integer(unsigned(mon_dout))"));
    }

    #[test]
    fn duplicate_split_fans_out() {
        let result = vhdl_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->int filter F { work pop 1 push 1 { push(pop()); } }
            int->int splitjoin Fan {
                split duplicate;
                add F();
                add F();
                join roundrobin;
            }
            int->void filter Snk { work pop 2 { pop(); pop(); } }
            void->void pipeline Main { add Src(); add Fan(); add Snk(); }",
        );
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let top = result
            .files
            .iter()
            .find(|f| f.filename == "program.vhd")
            .unwrap();
        assert!(top.source.contains("-- Split split_"));
        assert!(top.source.contains("-- Join join_"));
        // Duplicate split gates on every branch being ready.
        assert!(top.source.contains("_full_n = '1' and"));
    }

    #[test]
    fn float_channels_are_rejected_for_hardware() {
        let parsed = crate::parser::parse(
            "void->float filter Src { work push 1 { push(1.0); } }
            float->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Snk(); }",
        );
        let sema = crate::sema::analyze(&parsed.program.unwrap());
        let graph = crate::graph::build_graph(&sema.program);
        let result = emit_vhdl(&sema.program, &graph.graph, &VhdlOptions::default());
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code.map(|c| c.0) == Some("E0500")));
        assert!(result.files.is_empty());
    }

    #[test]
    fn manifest_lists_files_as_json() {
        let manifest = Manifest {
            program: "program".to_string(),
            compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            files: vec![
                ManifestEntry {
                    path: "filter_Counter.c".to_string(),
                    kind: "hls_c".to_string(),
                },
                ManifestEntry {
                    path: "program.vhd".to_string(),
                    kind: "vhdl_top".to_string(),
                },
            ],
        };
        let json = manifest.to_json();
        assert!(json.contains("\"program\": \"program\""));
        assert!(json.contains("\"filter_Counter.c\""));
        assert!(json.contains("\"vhdl_top\""));
    }
}
