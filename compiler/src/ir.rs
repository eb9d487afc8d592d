// ir.rs — SSA intermediate representation
//
// Modules contain globals and functions; functions contain basic blocks;
// blocks contain instructions; instruction operands are other values
// (instructions, constants, parameters, global references). PHI nodes
// reconcile values across predecessor blocks. Types are the interned
// `TypeId`s of the type lattice; pointers exist only at this level.
//
// Preconditions: types referenced by values are interned in the job's
//                `TypeTable`.
// Postconditions: `verify` holds for every function built through
//                 `FuncBuilder` from well-typed input.
// Failure modes: malformed IR is a compiler bug — `verify` reports it and
//                the pipeline surfaces `Internal`.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::sema::{Builtin, ConstValue};
use crate::types::{TypeId, TypeTable};

// ── Identifiers ─────────────────────────────────────────────────────────────

/// A value within one function: constant, parameter, global reference, or
/// instruction result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// A basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

// ── Module ──────────────────────────────────────────────────────────────────

/// A compilation unit: global state variables plus functions.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn add_global(&mut self, global: Global) -> usize {
        self.globals.push(global);
        self.globals.len() - 1
    }

    pub fn add_function(&mut self, func: Function) -> usize {
        self.functions.push(func);
        self.functions.len() - 1
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A module-level mutable variable (filter state).
#[derive(Debug)]
pub struct Global {
    pub name: String,
    pub ty: TypeId,
    pub init: GlobalInit,
}

#[derive(Debug)]
pub enum GlobalInit {
    Zero,
    Scalar(ConstValue),
    Array(Vec<ConstValue>),
}

// ── Function ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FuncParam {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<FuncParam>,
    pub ret: TypeId,
    pub blocks: Vec<Block>,
    pub values: Vec<ValueData>,
}

#[derive(Debug)]
pub struct Block {
    pub label: String,
    pub insts: Vec<ValueId>,
}

#[derive(Debug)]
pub enum ValueData {
    ConstInt { ty: TypeId, value: i64 },
    ConstFloat { ty: TypeId, value: f64 },
    /// Index into `Function::params`; `ty` is the parameter's type.
    Param { ty: TypeId, index: usize },
    /// Pointer to `Module::globals[index]`; `ty` is the pointer type.
    GlobalRef { ty: TypeId, index: usize },
    Inst(Inst),
}

impl ValueData {
    pub fn ty(&self) -> TypeId {
        match self {
            ValueData::ConstInt { ty, .. }
            | ValueData::ConstFloat { ty, .. }
            | ValueData::Param { ty, .. }
            | ValueData::GlobalRef { ty, .. } => *ty,
            ValueData::Inst(inst) => inst.ty,
        }
    }
}

#[derive(Debug)]
pub struct Inst {
    pub ty: TypeId,
    pub op: Opcode,
}

/// Integer binary operations carry their signedness where C emission
/// needs it (divide, remainder, shift right).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

impl BinOp {
    pub fn is_float(self) -> bool {
        matches!(self, BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv)
    }

    /// Operations whose C form must be signed (everything else is emitted
    /// on unsigned operands to dodge overflow UB).
    pub fn needs_signed_emission(self) -> bool {
        matches!(self, BinOp::SDiv | BinOp::SRem | BinOp::AShr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// Same bit pattern / width; no C-level conversion beyond the type name.
    Nop,
    Trunc,
    Sext,
    Zext,
    SiToFp,
    UiToFp,
    FpToSi,
    /// Same-width int ↔ float reinterpretation (through a union in C).
    Bitcast,
}

/// Callee of a call instruction. User functions are referenced by their
/// mangled symbol; built-ins keep their identity so the C emitter can
/// inline the libc/libm form.
#[derive(Debug, Clone)]
pub struct Callee {
    pub symbol: String,
    pub builtin: Option<Builtin>,
}

#[derive(Debug)]
pub enum Opcode {
    /// Stack slot in the entry block; result type is `Ptr(slot_ty)`.
    Alloca { slot_ty: TypeId },
    Load { ptr: ValueId },
    Store { value: ValueId, ptr: ValueId },
    /// Address computation: base pointer plus structured indices
    /// (a leading zero index steps through an array-typed pointee).
    Gep { base: ValueId, indices: Vec<ValueId> },
    Binary { op: BinOp, lhs: ValueId, rhs: ValueId },
    Icmp { pred: CmpPred, signed: bool, lhs: ValueId, rhs: ValueId },
    Fcmp { pred: CmpPred, lhs: ValueId, rhs: ValueId },
    Cast { kind: CastKind, value: ValueId },
    Phi { incomings: Vec<(BlockId, ValueId)> },
    Call { callee: Callee, args: Vec<ValueId> },
    Br { target: BlockId },
    CondBr { cond: ValueId, then_bb: BlockId, else_bb: BlockId },
    Ret { value: Option<ValueId> },
}

impl Opcode {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Br { .. } | Opcode::CondBr { .. } | Opcode::Ret { .. })
    }

    /// Operand values, for verification and use counting.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Opcode::Alloca { .. } => Vec::new(),
            Opcode::Load { ptr } => vec![*ptr],
            Opcode::Store { value, ptr } => vec![*value, *ptr],
            Opcode::Gep { base, indices } => {
                let mut ops = vec![*base];
                ops.extend(indices.iter().copied());
                ops
            }
            Opcode::Binary { lhs, rhs, .. }
            | Opcode::Icmp { lhs, rhs, .. }
            | Opcode::Fcmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Opcode::Cast { value, .. } => vec![*value],
            Opcode::Phi { incomings } => incomings.iter().map(|(_, v)| *v).collect(),
            Opcode::Call { args, .. } => args.clone(),
            Opcode::Br { .. } => Vec::new(),
            Opcode::CondBr { cond, .. } => vec![*cond],
            Opcode::Ret { value } => value.iter().copied().collect(),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Opcode::Br { target } => vec![*target],
            Opcode::CondBr { then_bb, else_bb, .. } => vec![*then_bb, *else_bb],
            _ => Vec::new(),
        }
    }
}

impl Function {
    /// Create a function with an empty entry block and one value per
    /// parameter.
    pub fn new(name: impl Into<String>, params: Vec<FuncParam>, ret: TypeId) -> Self {
        let mut func = Self {
            name: name.into(),
            params,
            ret,
            blocks: vec![Block {
                label: "entry".to_string(),
                insts: Vec::new(),
            }],
            values: Vec::new(),
        };
        for (index, param) in func.params.iter().enumerate() {
            func.values.push(ValueData::Param {
                ty: param.ty,
                index,
            });
        }
        func
    }

    pub const ENTRY: BlockId = BlockId(0);

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.0 as usize]
    }

    pub fn value_ty(&self, id: ValueId) -> TypeId {
        self.value(id).ty()
    }

    pub fn param_value(&self, index: usize) -> ValueId {
        debug_assert!(index < self.params.len());
        ValueId(index as u32)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: ValueId) -> Option<&Inst> {
        match self.value(id) {
            ValueData::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    fn block_terminated(&self, id: BlockId) -> bool {
        self.block(id)
            .insts
            .last()
            .and_then(|&v| self.inst(v))
            .is_some_and(|inst| inst.op.is_terminator())
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Insertion-point builder over one function. Mirrors the usual IR-builder
/// discipline: instructions append to the current block; allocas go to the
/// top of the entry block.
pub struct FuncBuilder<'f> {
    pub func: &'f mut Function,
    cur: BlockId,
}

impl<'f> FuncBuilder<'f> {
    pub fn new(func: &'f mut Function) -> Self {
        Self {
            func,
            cur: Function::ENTRY,
        }
    }

    pub fn current_block(&self) -> BlockId {
        self.cur
    }

    pub fn create_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block {
            label: label.into(),
            insts: Vec::new(),
        });
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    pub fn is_terminated(&self) -> bool {
        self.func.block_terminated(self.cur)
    }

    fn add_value(&mut self, data: ValueData) -> ValueId {
        let id = ValueId(self.func.values.len() as u32);
        self.func.values.push(data);
        id
    }

    pub fn const_int(&mut self, ty: TypeId, value: i64) -> ValueId {
        self.add_value(ValueData::ConstInt { ty, value })
    }

    pub fn const_float(&mut self, ty: TypeId, value: f64) -> ValueId {
        self.add_value(ValueData::ConstFloat { ty, value })
    }

    pub fn global_ref(&mut self, ptr_ty: TypeId, index: usize) -> ValueId {
        self.add_value(ValueData::GlobalRef { ty: ptr_ty, index })
    }

    fn push_inst(&mut self, ty: TypeId, op: Opcode) -> ValueId {
        debug_assert!(
            !self.func.block_terminated(self.cur),
            "emitting into a terminated block"
        );
        let id = self.add_value(ValueData::Inst(Inst { ty, op }));
        self.func.blocks[self.cur.0 as usize].insts.push(id);
        id
    }

    /// Stack slot, hoisted to the top of the entry block so promotable
    /// slots are recognizable.
    pub fn alloca(&mut self, types: &mut TypeTable, slot_ty: TypeId) -> ValueId {
        let ptr_ty = types.ptr(slot_ty);
        let id = self.add_value(ValueData::Inst(Inst {
            ty: ptr_ty,
            op: Opcode::Alloca { slot_ty },
        }));
        let entry_insts = &self.func.blocks[Function::ENTRY.0 as usize].insts;
        let at = entry_insts
            .iter()
            .position(|&v| {
                !matches!(
                    self.func.values[v.0 as usize],
                    ValueData::Inst(Inst {
                        op: Opcode::Alloca { .. },
                        ..
                    })
                )
            })
            .unwrap_or(entry_insts.len());
        self.func.blocks[Function::ENTRY.0 as usize]
            .insts
            .insert(at, id);
        id
    }

    pub fn load(&mut self, types: &TypeTable, ptr: ValueId) -> ValueId {
        let elem = match types.kind(self.func.value_ty(ptr)) {
            crate::types::TypeKind::Ptr(elem) => *elem,
            _ => panic!("load from non-pointer value"),
        };
        self.push_inst(elem, Opcode::Load { ptr })
    }

    pub fn store(&mut self, types: &TypeTable, value: ValueId, ptr: ValueId) {
        let void = types.void();
        self.push_inst(void, Opcode::Store { value, ptr });
    }

    pub fn gep(&mut self, ty: TypeId, base: ValueId, indices: Vec<ValueId>) -> ValueId {
        self.push_inst(ty, Opcode::Gep { base, indices })
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.value_ty(lhs);
        self.push_inst(ty, Opcode::Binary { op, lhs, rhs })
    }

    pub fn icmp(
        &mut self,
        types: &TypeTable,
        pred: CmpPred,
        signed: bool,
        lhs: ValueId,
        rhs: ValueId,
    ) -> ValueId {
        let b = types.bool_();
        self.push_inst(b, Opcode::Icmp { pred, signed, lhs, rhs })
    }

    pub fn fcmp(&mut self, types: &TypeTable, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        let b = types.bool_();
        self.push_inst(b, Opcode::Fcmp { pred, lhs, rhs })
    }

    pub fn cast(&mut self, ty: TypeId, kind: CastKind, value: ValueId) -> ValueId {
        self.push_inst(ty, Opcode::Cast { kind, value })
    }

    pub fn phi(&mut self, ty: TypeId, incomings: Vec<(BlockId, ValueId)>) -> ValueId {
        debug_assert!(
            self.func.blocks[self.cur.0 as usize].insts.is_empty()
                || self.func.blocks[self.cur.0 as usize]
                    .insts
                    .iter()
                    .all(|&v| matches!(
                        self.func.values[v.0 as usize],
                        ValueData::Inst(Inst {
                            op: Opcode::Phi { .. },
                            ..
                        })
                    )),
            "phi emitted after a non-phi instruction"
        );
        self.push_inst(ty, Opcode::Phi { incomings })
    }

    pub fn call(&mut self, ret: TypeId, callee: Callee, args: Vec<ValueId>) -> ValueId {
        self.push_inst(ret, Opcode::Call { callee, args })
    }

    pub fn br(&mut self, types: &TypeTable, target: BlockId) {
        let void = types.void();
        self.push_inst(void, Opcode::Br { target });
    }

    pub fn cond_br(&mut self, types: &TypeTable, cond: ValueId, then_bb: BlockId, else_bb: BlockId) {
        let void = types.void();
        self.push_inst(
            void,
            Opcode::CondBr {
                cond,
                then_bb,
                else_bb,
            },
        );
    }

    pub fn ret(&mut self, types: &TypeTable, value: Option<ValueId>) {
        let void = types.void();
        self.push_inst(void, Opcode::Ret { value });
    }
}

// ── Verifier ────────────────────────────────────────────────────────────────

/// Structural verification: terminator discipline, PHI placement, and
/// def-dominates-use over the reachable CFG. Returns human-readable
/// violations; empty means the function is well-formed.
pub fn verify(func: &Function) -> Vec<String> {
    let mut errors = Vec::new();

    // Terminators: exactly one, at the end of each block.
    for (idx, block) in func.blocks.iter().enumerate() {
        let id = BlockId(idx as u32);
        match block.insts.last().and_then(|&v| func.inst(v)) {
            Some(inst) if inst.op.is_terminator() => {}
            _ => errors.push(format!("block {} ({}) lacks a terminator", id.0, block.label)),
        }
        for &v in block.insts.iter().rev().skip(1) {
            if let Some(inst) = func.inst(v) {
                if inst.op.is_terminator() {
                    errors.push(format!(
                        "block {} ({}) has a terminator before its end",
                        id.0, block.label
                    ));
                }
            }
        }
        // PHIs only at block entry.
        let mut seen_non_phi = false;
        for &v in &block.insts {
            let is_phi = matches!(
                func.inst(v),
                Some(Inst {
                    op: Opcode::Phi { .. },
                    ..
                })
            );
            if is_phi && seen_non_phi {
                errors.push(format!(
                    "block {} ({}) has a PHI after a non-PHI instruction",
                    id.0, block.label
                ));
            }
            if !is_phi {
                seen_non_phi = true;
            }
        }
    }
    if !errors.is_empty() {
        return errors; // dominance analysis needs well-formed blocks
    }

    // Reachability and dominators (iterative dataflow).
    let n = func.blocks.len();
    let mut reachable = vec![false; n];
    let mut stack = vec![Function::ENTRY];
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    while let Some(b) = stack.pop() {
        if std::mem::replace(&mut reachable[b.0 as usize], true) {
            continue;
        }
        let term = func.block(b).insts.last().unwrap();
        for succ in func.inst(*term).unwrap().op.successors() {
            preds[succ.0 as usize].push(b.0 as usize);
            stack.push(succ);
        }
    }

    let full: u128 = if n >= 128 {
        u128::MAX
    } else {
        (1u128 << n) - 1
    };
    if n > 128 {
        // Bitset dominators cap out; functions this large do not occur in
        // lowered filter bodies.
        return errors;
    }
    let mut dom = vec![full; n];
    dom[0] = 1;
    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            if !reachable[b] {
                continue;
            }
            let mut new = full;
            for &p in &preds[b] {
                if reachable[p] {
                    new &= dom[p];
                }
            }
            new |= 1u128 << b;
            if new != dom[b] {
                dom[b] = new;
                changed = true;
            }
        }
    }
    let dominates =
        |a: usize, b: usize| -> bool { reachable[b] && (dom[b] & (1u128 << a)) != 0 };

    // Map instruction values to (block, position).
    let mut positions: HashMap<ValueId, (usize, usize)> = HashMap::new();
    for (bidx, block) in func.blocks.iter().enumerate() {
        for (pos, &v) in block.insts.iter().enumerate() {
            positions.insert(v, (bidx, pos));
        }
    }

    for (bidx, block) in func.blocks.iter().enumerate() {
        if !reachable[bidx] {
            continue;
        }
        for (pos, &v) in block.insts.iter().enumerate() {
            let inst = func.inst(v).unwrap();
            if let Opcode::Phi { incomings } = &inst.op {
                // A PHI operand must dominate the edge's predecessor exit.
                for (pred_bb, value) in incomings {
                    if let Some(&(def_b, _)) = positions.get(value) {
                        if !dominates(def_b, pred_bb.0 as usize) {
                            errors.push(format!(
                                "phi operand %{} does not dominate predecessor {}",
                                value.0, pred_bb.0
                            ));
                        }
                    }
                }
                continue;
            }
            for operand in inst.op.operands() {
                let Some(&(def_b, def_pos)) = positions.get(&operand) else {
                    continue; // constants, params, globals
                };
                let ok = if def_b == bidx {
                    def_pos < pos
                } else {
                    dominates(def_b, bidx)
                };
                if !ok {
                    errors.push(format!(
                        "use of %{} in block {} is not dominated by its definition",
                        operand.0, bidx
                    ));
                }
            }
        }
    }

    errors
}

// ── Textual form ────────────────────────────────────────────────────────────

/// Render one function in a readable SSA text form (debugging and
/// snapshot tests).
pub fn display_function(func: &Function, types: &TypeTable) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let params: Vec<String> = func
        .params
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{} %{}", types.name(p.ty), i))
        .collect();
    let _ = writeln!(
        out,
        "fn @{}({}) -> {} {{",
        func.name,
        params.join(", "),
        types.name(func.ret)
    );
    for (bidx, block) in func.blocks.iter().enumerate() {
        let _ = writeln!(out, "{}.{}:", block.label, bidx);
        for &v in &block.insts {
            let inst = func.inst(v).unwrap();
            let _ = writeln!(out, "  %{} = {}", v.0, display_op(func, types, inst));
        }
    }
    out.push_str("}\n");
    out
}

fn display_op(func: &Function, types: &TypeTable, inst: &Inst) -> String {
    let val = |v: &ValueId| match func.value(*v) {
        ValueData::ConstInt { value, .. } => format!("{value}"),
        ValueData::ConstFloat { value, .. } => format!("{value}"),
        ValueData::Param { index, .. } => format!("%arg{index}"),
        ValueData::GlobalRef { index, .. } => format!("@{}", func_global_name(func, *index)),
        ValueData::Inst(_) => format!("%{}", v.0),
    };
    match &inst.op {
        Opcode::Alloca { slot_ty } => format!("alloca {}", types.name(*slot_ty)),
        Opcode::Load { ptr } => format!("load {}", val(ptr)),
        Opcode::Store { value, ptr } => format!("store {}, {}", val(value), val(ptr)),
        Opcode::Gep { base, indices } => {
            let idx: Vec<String> = indices.iter().map(val).collect();
            format!("gep {}, [{}]", val(base), idx.join(", "))
        }
        Opcode::Binary { op, lhs, rhs } => format!("{:?} {}, {}", op, val(lhs), val(rhs)),
        Opcode::Icmp { pred, signed, lhs, rhs } => {
            format!("icmp.{:?}{} {}, {}", pred, if *signed { ".s" } else { ".u" }, val(lhs), val(rhs))
        }
        Opcode::Fcmp { pred, lhs, rhs } => format!("fcmp.{:?} {}, {}", pred, val(lhs), val(rhs)),
        Opcode::Cast { kind, value } => {
            format!("{:?} {} to {}", kind, val(value), types.name(inst.ty))
        }
        Opcode::Phi { incomings } => {
            let inc: Vec<String> = incomings
                .iter()
                .map(|(b, v)| format!("[bb{}, {}]", b.0, val(v)))
                .collect();
            format!("phi {}", inc.join(", "))
        }
        Opcode::Call { callee, args } => {
            let a: Vec<String> = args.iter().map(val).collect();
            format!("call @{}({})", callee.symbol, a.join(", "))
        }
        Opcode::Br { target } => format!("br bb{}", target.0),
        Opcode::CondBr {
            cond,
            then_bb,
            else_bb,
        } => format!("condbr {}, bb{}, bb{}", val(cond), then_bb.0, else_bb.0),
        Opcode::Ret { value } => match value {
            Some(v) => format!("ret {}", val(v)),
            None => "ret void".to_string(),
        },
    }
}

// Globals are named at module level; the function-local display falls
// back to the index when the module is not at hand.
fn func_global_name(_func: &Function, index: usize) -> String {
    format!("g{index}")
}

impl fmt::Display for CmpPred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Lt => "lt",
            CmpPred::Le => "le",
            CmpPred::Gt => "gt",
            CmpPred::Ge => "ge",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_func(types: &mut TypeTable) -> Function {
        let int = types.int();
        Function::new(
            "f",
            vec![FuncParam {
                name: "x".to_string(),
                ty: int,
            }],
            int,
        )
    }

    #[test]
    fn straight_line_function_verifies() {
        let mut types = TypeTable::new();
        let mut func = int_func(&mut types);
        let mut b = FuncBuilder::new(&mut func);
        let x = b.func.param_value(0);
        let one = b.const_int(types.int(), 1);
        let sum = b.binary(BinOp::Add, x, one);
        b.ret(&types, Some(sum));
        assert!(verify(&func).is_empty(), "{:?}", verify(&func));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut types = TypeTable::new();
        let mut func = int_func(&mut types);
        let mut b = FuncBuilder::new(&mut func);
        let x = b.func.param_value(0);
        let one = b.const_int(types.int(), 1);
        b.binary(BinOp::Add, x, one);
        let errors = verify(&func);
        assert!(errors.iter().any(|e| e.contains("lacks a terminator")));
    }

    #[test]
    fn use_before_def_across_blocks_is_reported() {
        let mut types = TypeTable::new();
        let int = types.int();
        let mut func = int_func(&mut types);
        let mut b = FuncBuilder::new(&mut func);
        let then_bb = b.create_block("then");
        let else_bb = b.create_block("else");
        let t = b.const_int(types.bool_(), 1);
        b.cond_br(&types, t, then_bb, else_bb);

        // Define a value only on the `then` path…
        b.switch_to(then_bb);
        let x = b.func.param_value(0);
        let one = b.const_int(int, 1);
        let def = b.binary(BinOp::Add, x, one);
        b.ret(&types, Some(def));

        // …and use it on the `else` path, which it does not dominate.
        b.switch_to(else_bb);
        let bad = b.binary(BinOp::Mul, def, one);
        b.ret(&types, Some(bad));

        let errors = verify(&func);
        assert!(
            errors.iter().any(|e| e.contains("not dominated")),
            "{errors:?}"
        );
    }

    #[test]
    fn diamond_with_phi_verifies() {
        let mut types = TypeTable::new();
        let int = types.int();
        let mut func = int_func(&mut types);
        let mut b = FuncBuilder::new(&mut func);
        let then_bb = b.create_block("then");
        let else_bb = b.create_block("else");
        let merge = b.create_block("merge");

        let x = b.func.param_value(0);
        let zero = b.const_int(int, 0);
        let cond = b.icmp(&types, CmpPred::Gt, true, x, zero);
        b.cond_br(&types, cond, then_bb, else_bb);

        b.switch_to(then_bb);
        let one = b.const_int(int, 1);
        let a = b.binary(BinOp::Add, x, one);
        b.br(&types, merge);

        b.switch_to(else_bb);
        let two = b.const_int(int, 2);
        let c = b.binary(BinOp::Mul, x, two);
        b.br(&types, merge);

        b.switch_to(merge);
        let phi = b.phi(int, vec![(then_bb, a), (else_bb, c)]);
        b.ret(&types, Some(phi));

        assert!(verify(&func).is_empty(), "{:?}", verify(&func));
    }

    #[test]
    fn allocas_float_to_entry_top() {
        let mut types = TypeTable::new();
        let int = types.int();
        let void = types.void();
        let mut func = Function::new("g", Vec::new(), void);
        let mut b = FuncBuilder::new(&mut func);
        let one = b.const_int(int, 1);
        let slot0 = b.alloca(&mut types, int);
        b.store(&types, one, slot0);
        let slot1 = b.alloca(&mut types, int);
        b.store(&types, one, slot1);
        b.ret(&types, None);

        let entry = func.block(Function::ENTRY);
        // Both allocas precede the first store.
        let first_store = entry
            .insts
            .iter()
            .position(|&v| matches!(func.inst(v).unwrap().op, Opcode::Store { .. }))
            .unwrap();
        let alloca_count = entry.insts[..first_store]
            .iter()
            .filter(|&&v| matches!(func.inst(v).unwrap().op, Opcode::Alloca { .. }))
            .count();
        assert_eq!(alloca_count, 2);
    }

    #[test]
    fn display_contains_blocks_and_ops() {
        let mut types = TypeTable::new();
        let mut func = int_func(&mut types);
        let mut b = FuncBuilder::new(&mut func);
        let x = b.func.param_value(0);
        let one = b.const_int(types.int(), 1);
        let sum = b.binary(BinOp::Add, x, one);
        b.ret(&types, Some(sum));
        let text = display_function(&func, &types);
        assert!(text.contains("fn @f"));
        assert!(text.contains("entry.0:"));
        assert!(text.contains("Add"));
    }
}
