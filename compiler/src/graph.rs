// graph.rs — Stream graph construction and steady-state scheduling
//
// Elaborates the top-level pipeline into a tree of filter instances,
// splits, and joins; binds stream parameters to constants; computes the
// steady-state multiplicity of every node by pairwise GCD balancing with
// backward LCM propagation; and derives the channel list with FIFO
// depths.
//
// Preconditions: semantic analysis succeeded; lowering has run for every
//                filter (per-filter IR modules exist).
// Postconditions: returns a `GraphResult`; on success every channel
//                 satisfies producer·push = consumer·pop.
// Failure modes: missing top pipeline, non-constant stream arguments,
//                structural type mismatches, zero-rate demand and other
//                unschedulable graphs produce `Diagnostic` errors.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::diag::{codes, Diagnostic};
use crate::id::{DeclId, IdAllocator};
use crate::sema::{
    fold_const, AddStmt, CompositeKind, ConstValue, ParamEnv, SemaProgram, SplitPolicy, TExpr,
};
use crate::types::TypeId;

/// FIFO depth per unit of channel multiplicity.
pub const FIFO_SIZE_MULTIPLIER: u32 = 4;

/// Elaboration recursion limit (mutually recursive composites).
const MAX_ELABORATION_DEPTH: u32 = 64;

// ── Public types ────────────────────────────────────────────────────────────

/// Unique identifier for a node within the stream graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// A filter declaration materialised with one particular set of constant
/// parameter values. Instances of equal permutations share emitted code.
#[derive(Debug)]
pub struct FilterPermutation {
    pub name: String,
    /// Index into `SemaProgram::filters`.
    pub filter: usize,
    pub params: Vec<ConstValue>,
    pub input: TypeId,
    pub output: TypeId,
    pub peek_rate: u32,
    pub pop_rate: u32,
    pub push_rate: u32,
}

/// A leaf filter instance.
#[derive(Debug)]
pub struct FilterNode {
    pub name: String,
    pub permutation: usize,
    pub input: TypeId,
    pub output: TypeId,
    pub peek_rate: u32,
    pub pop_rate: u32,
    pub push_rate: u32,
    pub multiplicity: u32,
    pub output_connection: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Duplicate,
    RoundRobin,
}

/// One-in N-out distribution node.
#[derive(Debug)]
pub struct SplitNode {
    pub name: String,
    pub mode: SplitMode,
    /// Per-branch weights (all ones for duplicate).
    pub weights: Vec<u32>,
    pub ty: TypeId,
    pub multiplicity: u32,
    pub outputs: Vec<NodeId>,
}

/// N-in one-out round-robin merge node.
#[derive(Debug)]
pub struct JoinNode {
    pub name: String,
    pub weights: Vec<u32>,
    pub ty: TypeId,
    pub multiplicity: u32,
    pub output_connection: Option<NodeId>,
}

/// Serial composition. Aggregate rates are net rates of the ends.
#[derive(Debug)]
pub struct PipelineNode {
    pub name: String,
    pub children: Vec<NodeId>,
    pub peek_rate: u32,
    pub pop_rate: u32,
    pub push_rate: u32,
    pub multiplicity: u32,
}

/// Parallel composition between one split and one join.
#[derive(Debug)]
pub struct SplitJoinNode {
    pub name: String,
    pub split: NodeId,
    pub children: Vec<NodeId>,
    pub join: NodeId,
    pub peek_rate: u32,
    pub pop_rate: u32,
    pub push_rate: u32,
    pub multiplicity: u32,
}

#[derive(Debug)]
pub enum StreamNode {
    Filter(FilterNode),
    Split(SplitNode),
    Join(JoinNode),
    Pipeline(PipelineNode),
    SplitJoin(SplitJoinNode),
}

impl StreamNode {
    pub fn name(&self) -> &str {
        match self {
            StreamNode::Filter(n) => &n.name,
            StreamNode::Split(n) => &n.name,
            StreamNode::Join(n) => &n.name,
            StreamNode::Pipeline(n) => &n.name,
            StreamNode::SplitJoin(n) => &n.name,
        }
    }

    pub fn multiplicity(&self) -> u32 {
        match self {
            StreamNode::Filter(n) => n.multiplicity,
            StreamNode::Split(n) => n.multiplicity,
            StreamNode::Join(n) => n.multiplicity,
            StreamNode::Pipeline(n) => n.multiplicity,
            StreamNode::SplitJoin(n) => n.multiplicity,
        }
    }
}

/// A FIFO edge between two leaf nodes.
#[derive(Debug)]
pub struct Channel {
    pub source: NodeId,
    pub dest: NodeId,
    pub elem: TypeId,
    /// Elements crossing per steady-state cycle.
    pub multiplicity: u32,
    /// FIFO depth: multiplicity × `FIFO_SIZE_MULTIPLIER`.
    pub depth: u32,
}

#[derive(Debug)]
pub struct StreamGraph {
    pub nodes: Vec<StreamNode>,
    pub root: Option<NodeId>,
    pub permutations: Vec<FilterPermutation>,
    pub channels: Vec<Channel>,
}

impl StreamGraph {
    pub fn node(&self, id: NodeId) -> &StreamNode {
        &self.nodes[id.0 as usize]
    }

    /// All leaf filter instances, in elaboration order.
    pub fn filter_instances(&self) -> impl Iterator<Item = (NodeId, &FilterNode)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match n {
            StreamNode::Filter(f) => Some((NodeId(i as u32), f)),
            _ => None,
        })
    }

    /// The channel feeding `dest`, if any.
    pub fn input_channel(&self, dest: NodeId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.dest == dest)
    }
}

impl fmt::Display for StreamGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StreamGraph ({} nodes)", self.nodes.len())?;
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                StreamNode::Filter(n) => writeln!(
                    f,
                    "  [{}] filter {} peek {} pop {} push {} x{}",
                    i, n.name, n.peek_rate, n.pop_rate, n.push_rate, n.multiplicity
                )?,
                StreamNode::Split(n) => writeln!(
                    f,
                    "  [{}] split {} {:?} {:?} x{}",
                    i, n.name, n.mode, n.weights, n.multiplicity
                )?,
                StreamNode::Join(n) => writeln!(
                    f,
                    "  [{}] join {} {:?} x{}",
                    i, n.name, n.weights, n.multiplicity
                )?,
                StreamNode::Pipeline(n) => {
                    writeln!(f, "  [{}] pipeline {} x{}", i, n.name, n.multiplicity)?
                }
                StreamNode::SplitJoin(n) => {
                    writeln!(f, "  [{}] splitjoin {} x{}", i, n.name, n.multiplicity)?
                }
            }
        }
        for c in &self.channels {
            writeln!(
                f,
                "  {} -> {} (mult {}, depth {})",
                self.node(c.source).name(),
                self.node(c.dest).name(),
                c.multiplicity,
                c.depth
            )?;
        }
        Ok(())
    }
}

/// Result of graph construction.
#[derive(Debug)]
pub struct GraphResult {
    pub graph: StreamGraph,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Elaborate the analysed program into a stream graph and schedule it.
pub fn build_graph(sema: &SemaProgram) -> GraphResult {
    let mut builder = GraphBuilder::new(sema);
    builder.build();
    GraphResult {
        graph: StreamGraph {
            nodes: builder.nodes,
            root: builder.root,
            permutations: builder.permutations,
            channels: builder.channels,
        },
        diagnostics: builder.diagnostics,
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

struct GraphBuilder<'a> {
    sema: &'a SemaProgram,
    nodes: Vec<StreamNode>,
    root: Option<NodeId>,
    permutations: Vec<FilterPermutation>,
    channels: Vec<Channel>,
    diagnostics: Vec<Diagnostic>,
    ids: IdAllocator,
    /// Per-filter permutation counter for stable permutation names.
    perm_counters: HashMap<usize, u32>,
}

impl<'a> GraphBuilder<'a> {
    fn new(sema: &'a SemaProgram) -> Self {
        Self {
            sema,
            nodes: Vec::new(),
            root: None,
            permutations: Vec::new(),
            channels: Vec::new(),
            diagnostics: Vec::new(),
            ids: IdAllocator::new(),
            perm_counters: HashMap::new(),
        }
    }

    fn error(&mut self, code: crate::diag::DiagCode, span: crate::ast::Span, msg: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, msg));
    }

    fn build(&mut self) {
        let Some(top) = self.sema.top else {
            use chumsky::span::Span as _;
            self.error(
                codes::E0100,
                crate::ast::Span::new((), 0..0),
                "program has no top-level void -> void pipeline",
            );
            return;
        };
        let root = self.elaborate(top, Vec::new(), 0, self.sema.decl(top).span);
        if crate::diag::has_errors(&self.diagnostics) {
            return;
        }
        let Some(root) = root else { return };
        self.root = Some(root);

        self.steady_schedule(root);
        if crate::diag::has_errors(&self.diagnostics) {
            return;
        }
        self.build_channels();
        self.check_rate_closure();
    }

    fn add_node(&mut self, node: StreamNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    // ── Elaboration ──

    /// Materialise a stream declaration with the given constant arguments.
    fn elaborate(
        &mut self,
        decl: DeclId,
        args: Vec<ConstValue>,
        depth: u32,
        span: crate::ast::Span,
    ) -> Option<NodeId> {
        if depth > MAX_ELABORATION_DEPTH {
            self.error(
                codes::E0401,
                span,
                "stream elaboration exceeds the recursion limit (recursive add?)",
            );
            return None;
        }

        if let Some(filter_idx) = match self.sema.decl(decl).kind {
            crate::sema::DeclKind::Filter(idx) => Some(idx),
            _ => None,
        } {
            return self.elaborate_filter(filter_idx, args, span);
        }

        let composite = self
            .sema
            .composite_of(decl)
            .expect("add target is neither filter nor composite");
        let env: ParamEnv = composite
            .params
            .iter()
            .copied()
            .zip(args.iter().copied())
            .collect();

        match &composite.kind {
            CompositeKind::Pipeline { adds } => {
                self.elaborate_pipeline(composite, adds, &env, depth)
            }
            CompositeKind::SplitJoin { split, adds, join } => {
                self.elaborate_splitjoin(composite, split, adds, join, &env, depth)
            }
        }
    }

    fn eval_add_args(&mut self, add: &AddStmt, env: &ParamEnv) -> Option<Vec<ConstValue>> {
        let mut values = Vec::new();
        for arg in &add.args {
            match fold_const(arg, env) {
                Some(v) => values.push(v),
                None => {
                    self.error(
                        codes::E0204,
                        arg.span,
                        "stream argument does not evaluate to a constant",
                    );
                    return None;
                }
            }
        }
        Some(values)
    }

    fn elaborate_child(&mut self, add: &AddStmt, env: &ParamEnv, depth: u32) -> Option<NodeId> {
        let args = self.eval_add_args(add, env)?;
        self.elaborate(add.target, args, depth + 1, add.span)
    }

    fn elaborate_pipeline(
        &mut self,
        composite: &crate::sema::CompositeDef,
        adds: &[AddStmt],
        env: &ParamEnv,
        depth: u32,
    ) -> Option<NodeId> {
        let mut children = Vec::new();
        for add in adds {
            children.push(self.elaborate_child(add, env, depth)?);
        }

        // Adjacent children must agree on the shared channel's type.
        for pair in children.windows(2) {
            let out_ty = self.output_type(pair[0]);
            let in_ty = self.input_type(pair[1]);
            if out_ty != in_ty {
                let msg = format!(
                    "pipeline '{}': '{}' produces '{}' but '{}' consumes '{}'",
                    composite.name,
                    self.nodes[pair[0].0 as usize].name(),
                    self.sema.types.name(out_ty),
                    self.nodes[pair[1].0 as usize].name(),
                    self.sema.types.name(in_ty),
                );
                self.error(codes::E0400, composite.span, msg);
                return None;
            }
        }

        // Connect leaf to leaf along the chain.
        for pair in children.windows(2) {
            let src_leaf = self.output_leaf(pair[0]);
            let dst_leaf = self.input_leaf(pair[1]);
            self.connect(src_leaf, dst_leaf);
        }

        // End-point element types verify against the declaration.
        let first_in = self.input_type(children[0]);
        let last_out = self.output_type(*children.last().unwrap());
        if first_in != composite.input || last_out != composite.output {
            let msg = format!(
                "pipeline '{}' declares '{} -> {}' but its body is '{} -> {}'",
                composite.name,
                self.sema.types.name(composite.input),
                self.sema.types.name(composite.output),
                self.sema.types.name(first_in),
                self.sema.types.name(last_out),
            );
            self.error(codes::E0400, composite.span, msg);
            return None;
        }

        let id = self.ids.alloc_instance();
        Some(self.add_node(StreamNode::Pipeline(PipelineNode {
            name: format!("{}_{}", composite.name, id.0),
            children,
            peek_rate: 0,
            pop_rate: 0,
            push_rate: 0,
            multiplicity: 1,
        })))
    }

    fn elaborate_splitjoin(
        &mut self,
        composite: &crate::sema::CompositeDef,
        split: &SplitPolicy,
        adds: &[AddStmt],
        join: &crate::sema::JoinPolicy,
        env: &ParamEnv,
        depth: u32,
    ) -> Option<NodeId> {
        // A split distributes data; without an input element type there is
        // nothing to distribute.
        if self.sema.types.is_void(composite.input) || self.sema.types.is_void(composite.output) {
            self.error(
                codes::E0400,
                composite.span,
                format!(
                    "splitjoin '{}' must have non-void input and output types",
                    composite.name
                ),
            );
            return None;
        }

        let mut children = Vec::new();
        for add in adds {
            children.push(self.elaborate_child(add, env, depth)?);
        }

        for &child in &children {
            let in_ty = self.input_type(child);
            let out_ty = self.output_type(child);
            if in_ty != composite.input || out_ty != composite.output {
                let msg = format!(
                    "splitjoin '{}': branch '{}' is '{} -> {}', expected '{} -> {}'",
                    composite.name,
                    self.nodes[child.0 as usize].name(),
                    self.sema.types.name(in_ty),
                    self.sema.types.name(out_ty),
                    self.sema.types.name(composite.input),
                    self.sema.types.name(composite.output),
                );
                self.error(codes::E0400, composite.span, msg);
                return None;
            }
        }

        let (mode, split_weights) = match split {
            SplitPolicy::Duplicate => (SplitMode::Duplicate, vec![1u32; children.len()]),
            SplitPolicy::RoundRobin(weights) => (
                SplitMode::RoundRobin,
                self.eval_weights(weights, env, children.len(), composite)?,
            ),
        };
        let join_weights = self.eval_weights(&join.weights, env, children.len(), composite)?;

        let split_instance = self.ids.alloc_instance();
        let split_id = self.add_node(StreamNode::Split(SplitNode {
            name: format!("split_{}", split_instance.0),
            mode,
            weights: split_weights,
            ty: composite.input,
            multiplicity: 1,
            outputs: Vec::new(),
        }));
        let join_instance = self.ids.alloc_instance();
        let join_id = self.add_node(StreamNode::Join(JoinNode {
            name: format!("join_{}", join_instance.0),
            weights: join_weights,
            ty: composite.output,
            multiplicity: 1,
            output_connection: None,
        }));

        // Wire split → branches → join at leaf level.
        let branch_inputs: Vec<NodeId> =
            children.iter().map(|&c| self.input_leaf(c)).collect();
        if let StreamNode::Split(s) = &mut self.nodes[split_id.0 as usize] {
            s.outputs = branch_inputs;
        }
        for &child in &children {
            let leaf = self.output_leaf(child);
            self.connect(leaf, join_id);
        }

        let id = self.ids.alloc_instance();
        Some(self.add_node(StreamNode::SplitJoin(SplitJoinNode {
            name: format!("{}_{}", composite.name, id.0),
            split: split_id,
            children,
            join: join_id,
            peek_rate: 0,
            pop_rate: 0,
            push_rate: 0,
            multiplicity: 1,
        })))
    }

    /// Weights default to all-ones when omitted; a zero weight starves
    /// its branch and cannot be scheduled.
    fn eval_weights(
        &mut self,
        weights: &[TExpr],
        env: &ParamEnv,
        branches: usize,
        composite: &crate::sema::CompositeDef,
    ) -> Option<Vec<u32>> {
        if weights.is_empty() {
            return Some(vec![1; branches]);
        }
        if weights.len() != branches {
            let msg = format!(
                "splitjoin '{}' has {} branch(es) but {} weight(s)",
                composite.name,
                branches,
                weights.len()
            );
            self.error(codes::E0400, composite.span, msg);
            return None;
        }
        let mut out = Vec::new();
        for w in weights {
            let value = match fold_const(w, env).and_then(ConstValue::as_int) {
                Some(v) => v,
                None => {
                    self.error(codes::E0204, w.span, "round-robin weight is not constant");
                    return None;
                }
            };
            if value <= 0 {
                self.error(
                    codes::E0401,
                    w.span,
                    format!("round-robin weight must be positive, got {value}"),
                );
                return None;
            }
            out.push(value as u32);
        }
        Some(out)
    }

    fn elaborate_filter(
        &mut self,
        filter_idx: usize,
        args: Vec<ConstValue>,
        span: crate::ast::Span,
    ) -> Option<NodeId> {
        let filter = &self.sema.filters[filter_idx];
        let env: ParamEnv = filter
            .params
            .iter()
            .copied()
            .zip(args.iter().copied())
            .collect();

        let fold_rate = |rate: &Option<TExpr>| -> Option<i64> {
            match rate {
                None => Some(0),
                Some(r) => fold_const(r, &env).and_then(ConstValue::as_int),
            }
        };
        let Some(pop) = fold_rate(&filter.work.pop_rate) else {
            self.error(
                codes::E0204,
                span,
                format!("pop rate of '{}' does not evaluate to a constant", filter.name),
            );
            return None;
        };
        let Some(push) = fold_rate(&filter.work.push_rate) else {
            self.error(
                codes::E0204,
                span,
                format!("push rate of '{}' does not evaluate to a constant", filter.name),
            );
            return None;
        };
        let peek = match &filter.work.peek_rate {
            None => pop,
            Some(r) => match fold_const(r, &env).and_then(ConstValue::as_int) {
                Some(v) => v.max(pop),
                None => {
                    self.error(
                        codes::E0204,
                        span,
                        format!("peek rate of '{}' does not evaluate to a constant", filter.name),
                    );
                    return None;
                }
            },
        };
        for (what, v) in [("peek", peek), ("pop", pop), ("push", push)] {
            if v < 0 {
                self.error(
                    codes::E0300,
                    span,
                    format!("{what} rate of '{}' is negative ({v})", filter.name),
                );
                return None;
            }
        }

        let permutation = self.intern_permutation(filter_idx, args, peek as u32, pop as u32, push as u32);
        let instance = self.ids.alloc_instance();
        let perm = &self.permutations[permutation];
        let node = FilterNode {
            name: format!("{}_{}", perm.name, instance.0),
            permutation,
            input: perm.input,
            output: perm.output,
            peek_rate: perm.peek_rate,
            pop_rate: perm.pop_rate,
            push_rate: perm.push_rate,
            multiplicity: 1,
            output_connection: None,
        };
        Some(self.add_node(StreamNode::Filter(node)))
    }

    fn intern_permutation(
        &mut self,
        filter_idx: usize,
        params: Vec<ConstValue>,
        peek: u32,
        pop: u32,
        push: u32,
    ) -> usize {
        if let Some(existing) = self
            .permutations
            .iter()
            .position(|p| p.filter == filter_idx && p.params == params)
        {
            return existing;
        }
        let filter = &self.sema.filters[filter_idx];
        let name = if params.is_empty() {
            filter.name.clone()
        } else {
            let counter = self.perm_counters.entry(filter_idx).or_insert(0);
            *counter += 1;
            format!("{}_p{}", filter.name, counter)
        };
        self.permutations.push(FilterPermutation {
            name,
            filter: filter_idx,
            params,
            input: filter.input,
            output: filter.output,
            peek_rate: peek,
            pop_rate: pop,
            push_rate: push,
        });
        self.permutations.len() - 1
    }

    // ── Leaf topology ──

    /// The leaf that receives this node's input (first filter or split).
    fn input_leaf(&self, id: NodeId) -> NodeId {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(_) | StreamNode::Split(_) | StreamNode::Join(_) => id,
            StreamNode::Pipeline(p) => self.input_leaf(p.children[0]),
            StreamNode::SplitJoin(sj) => sj.split,
        }
    }

    /// The leaf that produces this node's output (last filter or join).
    fn output_leaf(&self, id: NodeId) -> NodeId {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(_) | StreamNode::Split(_) | StreamNode::Join(_) => id,
            StreamNode::Pipeline(p) => self.output_leaf(*p.children.last().unwrap()),
            StreamNode::SplitJoin(sj) => sj.join,
        }
    }

    fn connect(&mut self, src_leaf: NodeId, dst_leaf: NodeId) {
        match &mut self.nodes[src_leaf.0 as usize] {
            StreamNode::Filter(f) => f.output_connection = Some(dst_leaf),
            StreamNode::Join(j) => j.output_connection = Some(dst_leaf),
            _ => panic!("source leaf is not a filter or join"),
        }
    }

    fn input_type(&self, id: NodeId) -> TypeId {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => f.input,
            StreamNode::Split(s) => s.ty,
            StreamNode::Join(j) => j.ty,
            StreamNode::Pipeline(p) => self.input_type(p.children[0]),
            StreamNode::SplitJoin(sj) => self.input_type(sj.split),
        }
    }

    fn output_type(&self, id: NodeId) -> TypeId {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => f.output,
            StreamNode::Split(s) => s.ty,
            StreamNode::Join(j) => j.ty,
            StreamNode::Pipeline(p) => self.output_type(*p.children.last().unwrap()),
            StreamNode::SplitJoin(sj) => self.output_type(sj.join),
        }
    }

    // ── Steady-state scheduling ──
    //
    // Per-firing rates: a split consumes its weight total (1 for
    // duplicate) and sends weight(i) to branch i; a join consumes
    // weight(i) from branch i and produces its weight total.

    fn net_pop(&self, id: NodeId) -> u64 {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => f.pop_rate as u64 * f.multiplicity as u64,
            StreamNode::Split(s) => {
                let per_firing: u64 = match s.mode {
                    SplitMode::Duplicate => 1,
                    SplitMode::RoundRobin => s.weights.iter().map(|&w| w as u64).sum(),
                };
                per_firing * s.multiplicity as u64
            }
            StreamNode::Join(j) => {
                // Not meaningful as a single number; used only through
                // per-branch demand.
                j.weights.iter().map(|&w| w as u64).sum::<u64>() * j.multiplicity as u64
            }
            StreamNode::Pipeline(p) => p.pop_rate as u64 * p.multiplicity as u64,
            StreamNode::SplitJoin(sj) => sj.pop_rate as u64 * sj.multiplicity as u64,
        }
    }

    fn net_peek(&self, id: NodeId) -> u64 {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => f.peek_rate as u64 * f.multiplicity as u64,
            StreamNode::Pipeline(p) => p.peek_rate as u64 * p.multiplicity as u64,
            StreamNode::SplitJoin(sj) => sj.peek_rate as u64 * sj.multiplicity as u64,
            _ => self.net_pop(id),
        }
    }

    fn net_push(&self, id: NodeId) -> u64 {
        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => f.push_rate as u64 * f.multiplicity as u64,
            StreamNode::Split(s) => s.multiplicity as u64, // per-branch base; scaled by weight
            StreamNode::Join(j) => {
                j.weights.iter().map(|&w| w as u64).sum::<u64>() * j.multiplicity as u64
            }
            StreamNode::Pipeline(p) => p.push_rate as u64 * p.multiplicity as u64,
            StreamNode::SplitJoin(sj) => sj.push_rate as u64 * sj.multiplicity as u64,
        }
    }

    fn add_multiplicity(&mut self, id: NodeId, count: u32) {
        match &mut self.nodes[id.0 as usize] {
            StreamNode::Filter(f) => {
                f.multiplicity *= count;
                return;
            }
            StreamNode::Split(s) => {
                s.multiplicity *= count;
                return;
            }
            StreamNode::Join(j) => {
                j.multiplicity *= count;
                return;
            }
            StreamNode::Pipeline(p) => p.multiplicity *= count,
            StreamNode::SplitJoin(sj) => sj.multiplicity *= count,
        }
        // Composite: propagate into the whole subtree.
        let children: Vec<NodeId> = match &self.nodes[id.0 as usize] {
            StreamNode::Pipeline(p) => p.children.clone(),
            StreamNode::SplitJoin(sj) => {
                let mut c = vec![sj.split, sj.join];
                c.extend(&sj.children);
                c
            }
            _ => unreachable!(),
        };
        for child in children {
            self.add_multiplicity(child, count);
        }
    }

    /// Balance a producer/consumer pair. Returns the scale factors
    /// (for_producer_side, for_consumer_side), or reports the graph as
    /// unschedulable when one side demands data the other never supplies.
    fn balance(
        &mut self,
        prev_send: u64,
        next_recv: u64,
        span: crate::ast::Span,
    ) -> Option<(u32, u32)> {
        if prev_send == next_recv {
            return Some((1, 1));
        }
        if prev_send == 0 || next_recv == 0 {
            self.error(
                codes::E0401,
                span,
                format!(
                    "unschedulable graph: producer supplies {prev_send} element(s) per cycle \
                     while the consumer requires {next_recv}"
                ),
            );
            return None;
        }
        let g = gcd(prev_send, next_recv);
        Some(((next_recv / g) as u32, (prev_send / g) as u32))
    }

    fn steady_schedule(&mut self, id: NodeId) {
        use chumsky::span::Span as _;
        let span = crate::ast::Span::new((), 0..0);

        match &self.nodes[id.0 as usize] {
            StreamNode::Filter(_) | StreamNode::Split(_) | StreamNode::Join(_) => {}
            StreamNode::Pipeline(p) => {
                let children = p.children.clone();
                for &child in &children {
                    self.steady_schedule(child);
                }
                for i in 1..children.len() {
                    let prev_send = self.net_push(children[i - 1]);
                    let next_recv = self.net_pop(children[i]);
                    let Some((up, down)) = self.balance(prev_send, next_recv, span) else {
                        return;
                    };
                    if (up, down) != (1, 1) {
                        for &earlier in &children[..i] {
                            self.add_multiplicity(earlier, up);
                        }
                        self.add_multiplicity(children[i], down);
                    }
                }
                let first = children[0];
                let last = *children.last().unwrap();
                let peek = self.net_peek(first) as u32;
                let pop = self.net_pop(first) as u32;
                let push = self.net_push(last) as u32;
                if let StreamNode::Pipeline(p) = &mut self.nodes[id.0 as usize] {
                    p.peek_rate = peek;
                    p.pop_rate = pop;
                    p.push_rate = push;
                }
            }
            StreamNode::SplitJoin(sj) => {
                let split = sj.split;
                let join = sj.join;
                let children = sj.children.clone();
                for &child in &children {
                    self.steady_schedule(child);
                }

                // Split against each branch.
                for (i, &child) in children.iter().enumerate() {
                    let weight = match &self.nodes[split.0 as usize] {
                        StreamNode::Split(s) => s.weights[i] as u64,
                        _ => unreachable!(),
                    };
                    let prev_send = self.net_push(split) * weight;
                    let next_recv = self.net_pop(child);
                    // A zero-rate branch pair is fine for duplicate sinks;
                    // both sides zero means no constraint.
                    if prev_send == 0 && next_recv == 0 {
                        continue;
                    }
                    let Some((up, down)) = self.balance(prev_send, next_recv, span) else {
                        return;
                    };
                    if (up, down) != (1, 1) {
                        self.add_multiplicity(split, up);
                        for &earlier in &children[..i] {
                            self.add_multiplicity(earlier, up);
                        }
                        self.add_multiplicity(child, down);
                    }
                }

                // First branch against the join.
                let join_w0 = match &self.nodes[join.0 as usize] {
                    StreamNode::Join(j) => j.weights[0] as u64,
                    _ => unreachable!(),
                };
                let join_mult = self.nodes[join.0 as usize].multiplicity() as u64;
                let prev_send = self.net_push(children[0]);
                let next_recv = join_mult * join_w0;
                if !(prev_send == 0 && next_recv == 0) {
                    let Some((up, down)) = self.balance(prev_send, next_recv, span) else {
                        return;
                    };
                    if (up, down) != (1, 1) {
                        self.add_multiplicity(split, up);
                        for &child in &children {
                            self.add_multiplicity(child, up);
                        }
                        self.add_multiplicity(join, down);
                    }
                }

                // Remaining branches must now agree with the join.
                for (i, &child) in children.iter().enumerate().skip(1) {
                    let weight = match &self.nodes[join.0 as usize] {
                        StreamNode::Join(j) => j.weights[i] as u64,
                        _ => unreachable!(),
                    };
                    let join_mult = self.nodes[join.0 as usize].multiplicity() as u64;
                    let supplied = self.net_push(child);
                    let required = join_mult * weight;
                    if supplied != required {
                        self.error(
                            codes::E0401,
                            span,
                            format!(
                                "unschedulable graph: branch {i} supplies {supplied} element(s) \
                                 per cycle but the join consumes {required}"
                            ),
                        );
                        return;
                    }
                }

                let peek = self.net_peek(split) as u32;
                let pop = self.net_pop(split) as u32;
                let push = self.net_push(join) as u32;
                if let StreamNode::SplitJoin(sj) = &mut self.nodes[id.0 as usize] {
                    sj.peek_rate = peek;
                    sj.pop_rate = pop;
                    sj.push_rate = push;
                }
            }
        }
    }

    // ── Channels ──

    fn build_channels(&mut self) {
        let mut channels = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let src = NodeId(idx as u32);
            match node {
                StreamNode::Filter(f) => {
                    if let Some(dest) = f.output_connection {
                        let mult = f.multiplicity * f.push_rate;
                        channels.push(Channel {
                            source: src,
                            dest,
                            elem: f.output,
                            multiplicity: mult,
                            depth: mult * FIFO_SIZE_MULTIPLIER,
                        });
                    }
                }
                StreamNode::Split(s) => {
                    for (i, &dest) in s.outputs.iter().enumerate() {
                        let mult = s.multiplicity * s.weights[i];
                        channels.push(Channel {
                            source: src,
                            dest,
                            elem: s.ty,
                            multiplicity: mult,
                            depth: mult * FIFO_SIZE_MULTIPLIER,
                        });
                    }
                }
                StreamNode::Join(j) => {
                    if let Some(dest) = j.output_connection {
                        let mult =
                            j.multiplicity * j.weights.iter().sum::<u32>();
                        channels.push(Channel {
                            source: src,
                            dest,
                            elem: j.ty,
                            multiplicity: mult,
                            depth: mult * FIFO_SIZE_MULTIPLIER,
                        });
                    }
                }
                StreamNode::Pipeline(_) | StreamNode::SplitJoin(_) => {}
            }
        }
        self.channels = channels;
    }

    /// Every channel must balance: producer firings × push = consumer
    /// firings × pop. A violation here is a scheduling bug.
    fn check_rate_closure(&mut self) {
        use chumsky::span::Span as _;
        let span = crate::ast::Span::new((), 0..0);
        let mut failures = Vec::new();
        for channel in &self.channels {
            let produced = channel.multiplicity as u64;
            let consumed = self.consumer_demand(channel.dest, channel.source);
            if produced != consumed {
                failures.push(format!(
                    "channel {} -> {} produces {produced} but consumes {consumed}",
                    self.nodes[channel.source.0 as usize].name(),
                    self.nodes[channel.dest.0 as usize].name(),
                ));
            }
            if channel.multiplicity == 0 {
                failures.push(format!(
                    "channel {} -> {} has zero multiplicity",
                    self.nodes[channel.source.0 as usize].name(),
                    self.nodes[channel.dest.0 as usize].name(),
                ));
            }
        }
        for failure in failures {
            self.error(codes::E0401, span, format!("unschedulable graph: {failure}"));
        }
    }

    /// Elements the consumer drains from the given producer per cycle.
    fn consumer_demand(&self, dest: NodeId, source: NodeId) -> u64 {
        match &self.nodes[dest.0 as usize] {
            StreamNode::Filter(f) => f.pop_rate as u64 * f.multiplicity as u64,
            StreamNode::Split(_) => self.net_pop(dest),
            StreamNode::Join(j) => {
                // Find which branch feeds this join.
                let branch = self
                    .channels_into_join_branch(dest, source)
                    .expect("join predecessor not found");
                j.weights[branch] as u64 * j.multiplicity as u64
            }
            _ => 0,
        }
    }

    fn channels_into_join_branch(&self, join: NodeId, source: NodeId) -> Option<usize> {
        // Branch order equals elaboration order of the splitjoin children;
        // recover it by scanning producers that connect to this join.
        let mut branch = 0;
        for (idx, node) in self.nodes.iter().enumerate() {
            let out = match node {
                StreamNode::Filter(f) => f.output_connection,
                StreamNode::Join(j) => j.output_connection,
                _ => None,
            };
            if out == Some(join) {
                if NodeId(idx as u32) == source {
                    return Some(branch);
                }
                branch += 1;
            }
        }
        None
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::has_errors;

    fn graph_for(source: &str) -> (SemaProgram, StreamGraph) {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let sema = crate::sema::analyze(&parsed.program.unwrap());
        assert!(!has_errors(&sema.diagnostics), "{:?}", sema.diagnostics);
        let result = build_graph(&sema.program);
        assert!(!has_errors(&result.diagnostics), "{:?}", result.diagnostics);
        (sema.program, result.graph)
    }

    fn graph_err(source: &str, code: &str) {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let sema = crate::sema::analyze(&parsed.program.unwrap());
        assert!(!has_errors(&sema.diagnostics), "{:?}", sema.diagnostics);
        let result = build_graph(&sema.program);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.code.map(|c| c.0) == Some(code)),
            "expected {code}, got {:?}",
            result.diagnostics
        );
    }

    #[test]
    fn counter_pipeline_has_one_unit_channel() {
        let (_sema, graph) = graph_for(
            "void->int filter Counter {
                int n = 0;
                work push 1 { push(n); n = n + 1; }
            }
            int->void filter OutputWriter { work pop 1 { println(pop()); } }
            void->void pipeline Main { add Counter(); add OutputWriter(); }",
        );
        assert_eq!(graph.channels.len(), 1);
        let channel = &graph.channels[0];
        assert_eq!(channel.multiplicity, 1);
        assert_eq!(channel.depth, 4);
        let filters: Vec<_> = graph.filter_instances().collect();
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().all(|(_, f)| f.multiplicity == 1));
    }

    #[test]
    fn rate_mismatch_scales_firings() {
        // Scrambler: pop 1 push 8 into a pop-1 sink → sink fires 8 times.
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->int filter Scramble { work pop 1 push 8 { int v = pop(); for (int i = 0; i < 8; i++) push(v); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Scramble(); add Snk(); }",
        );
        let by_name = |n: &str| {
            graph
                .filter_instances()
                .find(|(_, f)| f.name.starts_with(n))
                .unwrap()
                .1
                .multiplicity
        };
        assert_eq!(by_name("Src"), 1);
        assert_eq!(by_name("Scramble"), 1);
        assert_eq!(by_name("Snk"), 8);
        // Producer-side multiplicity: 8 × firing count of the scrambler.
        let out_channel = graph
            .channels
            .iter()
            .find(|c| graph.node(c.source).name().starts_with("Scramble"))
            .unwrap();
        assert_eq!(out_channel.multiplicity, 8);
        assert_eq!(out_channel.depth, 32);
    }

    #[test]
    fn duplicate_splitjoin_with_default_join_weights() {
        // Two duplicate copies of a pop-1 push-8 filter merged by a
        // default round-robin join: output multiplicity is 2 * 8 * n_F.
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->int filter F { work pop 1 push 8 { int v = pop(); for (int i = 0; i < 8; i++) push(v); } }
            int->int splitjoin Fan {
                split duplicate;
                add F();
                add F();
                join roundrobin;
            }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Fan(); add Snk(); }",
        );
        let join_channel = graph
            .channels
            .iter()
            .find(|c| matches!(graph.node(c.source), StreamNode::Join(_)))
            .unwrap();
        assert_eq!(join_channel.multiplicity, 16);
        // Join weights defaulted to [1, 1].
        let join = graph
            .nodes
            .iter()
            .find_map(|n| match n {
                StreamNode::Join(j) => Some(j),
                _ => None,
            })
            .unwrap();
        assert_eq!(join.weights, vec![1, 1]);
        assert_eq!(join.multiplicity, 16 / 2);
    }

    #[test]
    fn autocorrelation_shape() {
        // Cor1(N=16, NLAGS=4): duplicate split into four pop-N push-1
        // branches and a default round-robin join.
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 16 { for (int i = 0; i < 16; i++) push(i); } }
            int->int filter Lag(int N, int k) {
                work pop 16 push 1 {
                    int acc = 0;
                    for (int i = 0; i < 16; i++) { acc = acc + pop(); }
                    push(acc + k);
                }
            }
            int->int splitjoin Cor1(int N, int NLAGS) {
                split duplicate;
                add Lag(N, 0);
                add Lag(N, 1);
                add Lag(N, 2);
                add Lag(N, 3);
                join roundrobin;
            }
            int->void filter Snk { work pop 4 { for (int i = 0; i < 4; i++) pop(); } }
            void->void pipeline Main { add Src(); add Cor1(16, 4); add Snk(); }",
        );
        // Four branch instances, one split, one join.
        assert_eq!(graph.filter_instances().count(), 6);
        let branches: Vec<_> = graph
            .filter_instances()
            .filter(|(_, f)| f.name.starts_with("Lag"))
            .collect();
        assert_eq!(branches.len(), 4);
        // Every branch consumes 16 elements per firing.
        for (id, f) in &branches {
            assert_eq!(f.pop_rate, 16);
            let input = graph.input_channel(*id).unwrap();
            assert_eq!(input.multiplicity, 16);
        }
        // Join output multiplicity = NLAGS.
        let join_channel = graph
            .channels
            .iter()
            .find(|c| matches!(graph.node(c.source), StreamNode::Join(_)))
            .unwrap();
        assert_eq!(join_channel.multiplicity, 4);
    }

    #[test]
    fn parameterized_permutations_are_shared() {
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->int filter Gain(int k) { work pop 1 push 1 { push(pop() * k); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Gain(3); add Gain(3); add Gain(5); add Snk(); }",
        );
        // Gain(3) twice shares one permutation; Gain(5) gets its own.
        let gain_perms: Vec<_> = graph
            .permutations
            .iter()
            .filter(|p| p.name.starts_with("Gain"))
            .collect();
        assert_eq!(gain_perms.len(), 2);
        assert_eq!(graph.filter_instances().count(), 5);
    }

    #[test]
    fn pipeline_type_mismatch() {
        graph_err(
            "void->int filter Src { work push 1 { push(1); } }
            float->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Snk(); }",
            "E0400",
        );
    }

    #[test]
    fn zero_rate_demand_is_unschedulable() {
        graph_err(
            "void->int filter Src { work push 0 { } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Snk(); }",
            "E0401",
        );
    }

    #[test]
    fn missing_top_pipeline() {
        graph_err(
            "void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            int->int pipeline NotTop { add Src(); add Snk(); }",
            "E0100",
        );
    }

    #[test]
    fn recursive_pipeline_is_rejected() {
        graph_err(
            "void->void pipeline Main { add Main(); }",
            "E0401",
        );
    }

    #[test]
    fn weight_count_mismatch() {
        graph_err(
            "void->int filter Src { work push 2 { push(1); push(2); } }
            int->int filter F { work pop 1 push 1 { push(pop()); } }
            int->int splitjoin Fan {
                split roundrobin(1, 1, 1);
                add F();
                add F();
                join roundrobin;
            }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Fan(); add Snk(); }",
            "E0400",
        );
    }

    #[test]
    fn weighted_roundrobin_distribution() {
        // Split 2:1 — branch A gets 2 of every 3 elements.
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 3 { push(1); push(2); push(3); } }
            int->int filter A { work pop 2 push 2 { push(pop()); push(pop()); } }
            int->int filter B { work pop 1 push 1 { push(pop()); } }
            int->int splitjoin Fan {
                split roundrobin(2, 1);
                add A();
                add B();
                join roundrobin(2, 1);
            }
            int->void filter Snk { work pop 3 { pop(); pop(); pop(); } }
            void->void pipeline Main { add Src(); add Fan(); add Snk(); }",
        );
        let split = graph
            .nodes
            .iter()
            .find_map(|n| match n {
                StreamNode::Split(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(split.weights, vec![2, 1]);
        // Branch channels carry weight × split firings.
        let branch_channels: Vec<_> = graph
            .channels
            .iter()
            .filter(|c| matches!(graph.node(c.source), StreamNode::Split(_)))
            .collect();
        assert_eq!(branch_channels.len(), 2);
        assert_eq!(branch_channels[0].multiplicity, 2);
        assert_eq!(branch_channels[1].multiplicity, 1);
    }

    #[test]
    fn nested_pipeline_flattens_connections() {
        let (_sema, graph) = graph_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->int filter F { work pop 1 push 1 { push(pop()); } }
            int->int pipeline Inner { add F(); add F(); }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Inner(); add Snk(); }",
        );
        // Channels: Src→F, F→F, F→Snk.
        assert_eq!(graph.channels.len(), 3);
        for channel in &graph.channels {
            assert_eq!(channel.multiplicity, 1);
        }
    }
}
