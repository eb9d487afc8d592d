// dot.rs — Graphviz DOT output for stream graphs
//
// Transforms a scheduled StreamGraph into DOT format suitable for
// rendering with `dot`, `neato`, or other Graphviz layout engines.
// Filter labels carry the per-firing and net rates plus the steady-state
// multiplicity.
//
// Preconditions: `graph` is a fully constructed and scheduled StreamGraph.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{StreamGraph, StreamNode};
use crate::types::TypeTable;

/// Emit the stream graph as a Graphviz DOT string.
pub fn emit_dot(graph: &StreamGraph, types: &TypeTable) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph streamlet {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();
    writeln!(buf).unwrap();

    for node in &graph.nodes {
        match node {
            StreamNode::Filter(f) => {
                writeln!(
                    buf,
                    "    {} [shape=box, label=\"{}\\npeek {}({}) pop {}({}) push {}({})\\nmultiplicity {}\"];",
                    sanitize(&f.name),
                    f.name,
                    f.peek_rate,
                    f.peek_rate * f.multiplicity,
                    f.pop_rate,
                    f.pop_rate * f.multiplicity,
                    f.push_rate,
                    f.push_rate * f.multiplicity,
                    f.multiplicity,
                )
                .unwrap();
            }
            StreamNode::Split(s) => {
                writeln!(
                    buf,
                    "    {} [shape=triangle, label=\"{}\\n{:?} {:?}\\nmultiplicity {}\"];",
                    sanitize(&s.name),
                    s.name,
                    s.mode,
                    s.weights,
                    s.multiplicity,
                )
                .unwrap();
            }
            StreamNode::Join(j) => {
                writeln!(
                    buf,
                    "    {} [shape=invtriangle, label=\"{}\\nroundrobin {:?}\\nmultiplicity {}\"];",
                    sanitize(&j.name),
                    j.name,
                    j.weights,
                    j.multiplicity,
                )
                .unwrap();
            }
            // Composites are implicit in the leaf wiring.
            StreamNode::Pipeline(_) | StreamNode::SplitJoin(_) => {}
        }
    }

    writeln!(buf).unwrap();
    for channel in &graph.channels {
        writeln!(
            buf,
            "    {} -> {} [label=\"{} x{} (depth {})\"];",
            sanitize(graph.node(channel.source).name()),
            sanitize(graph.node(channel.dest).name()),
            types.name(channel.elem),
            channel.multiplicity,
            channel.depth,
        )
        .unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

/// Graphviz identifiers allow only alphanumerics and underscores.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
