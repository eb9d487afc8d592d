// codegen.rs — C-syntax serialisation of SSA IR for HLS consumption
//
// Emits one C source file per filter permutation: helper macros, the
// reachable type declarations, baked parameter constants, filter state,
// reachable helper functions, and one C function per work-block IR
// function. Integer arithmetic is emitted on unsigned operands with
// signedness reintroduced only where C semantics require it; odd-width
// integers are masked on store and truncating use; PHI nodes become
// shadow variables assigned in predecessors.
//
// Preconditions: lowering and graph construction succeeded.
// Postconditions: returns one compilable C file per permutation.
// Failure modes: none reachable from verified IR; impossible cases panic.
// Side effects: none (pure text generation; callers write files).

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::diag::Diagnostic;
use crate::graph::{FilterPermutation, StreamGraph};
use crate::ir::{
    BinOp, BlockId, CastKind, CmpPred, Function, GlobalInit, Module, Opcode, ValueData, ValueId,
};
use crate::lower::LoweredProgram;
use crate::sema::{Builtin, ConstValue, SemaProgram};
use crate::types::{TypeId, TypeKind, TypeTable};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CodegenResult {
    pub generated: GeneratedCode,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct GeneratedCode {
    pub files: Vec<CFile>,
}

/// One HLS C source file, covering one filter permutation.
#[derive(Debug)]
pub struct CFile {
    /// Permutation name, e.g. `Gain_p1`.
    pub name: String,
    pub filename: String,
    pub source: String,
    /// Exported function names present in the file (init/prework/work).
    pub functions: Vec<String>,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Emit the C file set for every filter permutation in the graph.
pub fn emit_c(sema: &SemaProgram, lowered: &LoweredProgram, graph: &StreamGraph) -> CodegenResult {
    let mut files = Vec::new();
    for perm in &graph.permutations {
        let filter_module = lowered
            .filters
            .iter()
            .find(|fm| fm.filter == perm.filter)
            .expect("missing lowered module for filter");
        let mut writer = CWriter::new(&sema.types, lowered, perm, &filter_module.module);
        let source = writer.emit_file();
        files.push(CFile {
            name: perm.name.clone(),
            filename: format!("filter_{}.c", perm.name),
            source,
            functions: writer.exported,
        });
    }
    CodegenResult {
        generated: GeneratedCode { files },
        diagnostics: Vec::new(),
    }
}

// ── Name mangling ───────────────────────────────────────────────────────────

/// Escape non-alphanumeric characters as `_<hex>_` so any source name
/// becomes a C identifier.
pub fn cbe_mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            let _ = write!(out, "_{:x}_", c as u32);
        }
    }
    out
}

// ── C type mapping ──────────────────────────────────────────────────────────

/// Container width for an integer type: widths round up to 8/16/32/64/128.
fn container_bits(width: u32) -> u32 {
    match width {
        0..=8 => 8,
        9..=16 => 16,
        17..=32 => 32,
        33..=64 => 64,
        _ => 128,
    }
}

fn int_cty(bits: u32, signed: bool) -> String {
    match (container_bits(bits), signed) {
        (8, false) => "uint8_t".to_string(),
        (8, true) => "int8_t".to_string(),
        (16, false) => "uint16_t".to_string(),
        (16, true) => "int16_t".to_string(),
        (32, false) => "uint32_t".to_string(),
        (32, true) => "int32_t".to_string(),
        (64, false) => "uint64_t".to_string(),
        (64, true) => "int64_t".to_string(),
        (_, false) => "unsigned __int128".to_string(),
        (_, true) => "__int128".to_string(),
    }
}

const PRELUDE: &str = r#"/* Provide Declarations */
#include <stdarg.h>
#include <limits.h>
#include <stdint.h>
#include <math.h>

#if defined(__GNUC__)
#define NORETURN __attribute__((noreturn))
#define FORCEINLINE __attribute__((always_inline))
#else
#define NORETURN
#define FORCEINLINE
#endif

#ifndef __cplusplus
typedef unsigned char bool;
#define true 1
#define false 0
#endif

#if defined(__GNUC__)
#define LLVM_NAN(NanStr)   __builtin_nan(NanStr)   /* Double */
#define LLVM_NANF(NanStr)  __builtin_nanf(NanStr)  /* Float */
#define LLVM_INF           __builtin_inf()         /* Double */
#define LLVM_INFF          __builtin_inff()        /* Float */
#else
#define LLVM_NAN(NanStr)   ((double)NAN)           /* Double */
#define LLVM_NANF(NanStr)  ((float)NAN)            /* Float */
#define LLVM_INF           ((double)INFINITY)      /* Double */
#define LLVM_INFF          ((float)INFINITY)       /* Float */
#endif

/* FP <-> int reinterpretation without strict-aliasing violations */
typedef union {
  uint32_t Int32;
  float Float;
} llvmBitCastUnion;
"#;

// ── Emission planning ───────────────────────────────────────────────────────

/// Which instructions inline into their single use.
struct EmissionPlan {
    inline_set: HashSet<ValueId>,
}

impl EmissionPlan {
    fn build(func: &Function) -> Self {
        let mut use_count: HashMap<ValueId, u32> = HashMap::new();
        let mut use_site: HashMap<ValueId, (usize, usize)> = HashMap::new();
        for (bidx, block) in func.blocks.iter().enumerate() {
            for (pos, &v) in block.insts.iter().enumerate() {
                let inst = func.inst(v).unwrap();
                for operand in inst.op.operands() {
                    *use_count.entry(operand).or_insert(0) += 1;
                    use_site.insert(operand, (bidx, pos));
                }
            }
        }

        let mut inline_set = HashSet::new();
        for (bidx, block) in func.blocks.iter().enumerate() {
            for (pos, &v) in block.insts.iter().enumerate() {
                let inst = func.inst(v).unwrap();
                let candidate = match &inst.op {
                    Opcode::Alloca { .. }
                    | Opcode::Call { .. }
                    | Opcode::Phi { .. }
                    | Opcode::Store { .. }
                    | Opcode::Br { .. }
                    | Opcode::CondBr { .. }
                    | Opcode::Ret { .. } => false,
                    _ => true,
                };
                if !candidate || use_count.get(&v).copied() != Some(1) {
                    continue;
                }
                let Some(&(use_block, use_pos)) = use_site.get(&v) else {
                    continue;
                };
                if use_block != bidx {
                    continue;
                }
                // A load may not be carried across a store or call.
                if matches!(inst.op, Opcode::Load { .. }) {
                    let crosses = block.insts[pos + 1..use_pos].iter().any(|&w| {
                        matches!(
                            func.inst(w).map(|i| &i.op),
                            Some(Opcode::Store { .. }) | Some(Opcode::Call { .. })
                        )
                    });
                    if crosses {
                        continue;
                    }
                }
                inline_set.insert(v);
            }
        }
        Self { inline_set }
    }
}

// ── Writer ──────────────────────────────────────────────────────────────────

struct CWriter<'a> {
    types: &'a TypeTable,
    lowered: &'a LoweredProgram,
    perm: &'a FilterPermutation,
    module: &'a Module,
    /// Type declarations accumulate here; bodies in their own buffer; the
    /// two concatenate at the end of `emit_file`.
    header: String,
    declared_types: HashMap<TypeId, String>,
    reachable_fns: Vec<String>,
    exported: Vec<String>,
    /// Per-module anonymous-value counter (reset per file).
    tmp_counter: u32,
}

impl<'a> CWriter<'a> {
    fn new(
        types: &'a TypeTable,
        lowered: &'a LoweredProgram,
        perm: &'a FilterPermutation,
        module: &'a Module,
    ) -> Self {
        Self {
            types,
            lowered,
            perm,
            module,
            header: String::new(),
            declared_types: HashMap::new(),
            reachable_fns: Vec::new(),
            exported: Vec::new(),
            tmp_counter: 0,
        }
    }

    // ── Types ──

    /// The C name of a type, declaring array/struct wrappers into the
    /// header on first use (reachability-ordered emission).
    fn cty(&mut self, ty: TypeId) -> String {
        if let Some(name) = self.declared_types.get(&ty) {
            return name.clone();
        }
        let name = match self.types.kind(ty) {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Bit => "uint8_t".to_string(),
            TypeKind::Int => "uint32_t".to_string(),
            TypeKind::Float => "float".to_string(),
            TypeKind::ApInt { width, .. } => int_cty(*width, false),
            TypeKind::Array { elem, len } => {
                let (elem, len) = (*elem, *len);
                let elem_name = self.cty(elem);
                let tag = format!("l_array_{}_{}", len, cbe_mangle(&elem_name));
                let _ = writeln!(
                    self.header,
                    "struct {tag} {{\n  {elem_name} array[{len}];\n}};"
                );
                format!("struct {tag}")
            }
            TypeKind::Struct { name, fields } => {
                let fields = fields.clone();
                let tag = format!("l_struct_{}", cbe_mangle(name));
                let mut lines = Vec::new();
                for (fname, fty) in &fields {
                    let fty_name = self.cty(*fty);
                    lines.push(format!("  {fty_name} {};", cbe_mangle(fname)));
                }
                let _ = writeln!(self.header, "struct {tag} {{\n{}\n}};", lines.join("\n"));
                format!("struct {tag}")
            }
            TypeKind::Ptr(elem) => {
                let elem = *elem;
                let inner = self.cty(elem);
                format!("{inner}*")
            }
        };
        self.declared_types.insert(ty, name.clone());
        name
    }

    /// Signed counterpart of an integer C type, for the operations that
    /// must be signed.
    fn signed_cty(&self, ty: TypeId) -> String {
        match self.types.kind(ty) {
            TypeKind::Bool | TypeKind::Bit => "int8_t".to_string(),
            TypeKind::Int => "int32_t".to_string(),
            TypeKind::ApInt { width, .. } => int_cty(*width, true),
            _ => panic!("signed view of a non-integer type"),
        }
    }

    /// True when the type's width does not fill its C container, so
    /// stores and truncating uses must mask.
    fn needs_mask(&self, ty: TypeId) -> bool {
        match self.types.kind(ty) {
            TypeKind::ApInt { width, .. } => *width != container_bits(*width),
            _ => false,
        }
    }

    fn mask_literal(&self, ty: TypeId) -> String {
        let TypeKind::ApInt { width, .. } = self.types.kind(ty) else {
            panic!("mask of a non-ApInt type");
        };
        if *width >= 64 {
            format!("((((unsigned __int128)1) << {width}) - 1)")
        } else {
            format!("((1ull << {width}) - 1)")
        }
    }

    fn masked(&self, ty: TypeId, expr: String) -> String {
        if self.needs_mask(ty) {
            format!("(({expr}) & {})", self.mask_literal(ty))
        } else {
            expr
        }
    }

    /// Sign-extended signed view of an operand (for signed divide,
    /// remainder, shift right, and signed compares). Odd widths recover
    /// the sign through a shift pair over the container.
    fn signed_operand(&self, ty: TypeId, expr: &str) -> String {
        let sty = self.signed_cty(ty);
        if self.needs_mask(ty) {
            let TypeKind::ApInt { width, .. } = self.types.kind(ty) else {
                unreachable!();
            };
            let shift = container_bits(*width) - width;
            let uty = int_cty(*width, false);
            format!("(({sty})(({uty})({expr}) << {shift}) >> {shift})")
        } else {
            format!("(({sty})({expr}))")
        }
    }

    // ── File assembly ──

    fn emit_file(&mut self) -> String {
        self.collect_reachable_functions();

        let mut globals = String::new();
        for global in &self.module.globals {
            let line = self.emit_global(global);
            globals.push_str(&line);
        }

        let mut fn_bodies = String::new();
        // Shared helpers first (callees before callers), then the filter's
        // own entry points.
        for symbol in &self.reachable_fns.clone() {
            let func = self
                .lowered
                .shared
                .function(symbol)
                .expect("reachable function missing from shared module");
            let text = self.emit_function(func, None);
            fn_bodies.push_str(&text);
            fn_bodies.push('\n');
        }
        for func in &self.module.functions {
            let exported = exported_name(&func.name, &self.perm.name);
            let text = self.emit_function(func, Some(exported.clone()));
            self.exported.push(exported);
            fn_bodies.push_str(&text);
            fn_bodies.push('\n');
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "/* filter_{}.c — HLS C for filter permutation {} */",
            self.perm.name, self.perm.name
        );
        out.push_str(PRELUDE);
        let builtins = self.builtin_helper_text();
        if !builtins.is_empty() {
            out.push_str("\n/* Built-ins */\n");
            out.push_str(&builtins);
        }
        if !self.header.is_empty() {
            out.push_str("\n/* Types */\n");
            out.push_str(&self.header);
        }
        if !globals.is_empty() {
            out.push_str("\n/* Filter state */\n");
            out.push_str(&globals);
        }
        out.push('\n');
        out.push_str(&fn_bodies);
        out
    }

    fn collect_reachable_functions(&mut self) {
        fn callees(func: &Function, seen: &mut HashSet<String>, work: &mut Vec<String>) {
            for value in &func.values {
                if let ValueData::Inst(inst) = value {
                    if let Opcode::Call { callee, .. } = &inst.op {
                        if callee.builtin.is_none() && seen.insert(callee.symbol.clone()) {
                            work.push(callee.symbol.clone());
                        }
                    }
                }
            }
        }
        let mut seen = HashSet::new();
        let mut work = Vec::new();
        for func in &self.module.functions {
            callees(func, &mut seen, &mut work);
        }
        let mut ordered = Vec::new();
        while let Some(symbol) = work.pop() {
            if let Some(func) = self.lowered.shared.function(&symbol) {
                callees(func, &mut seen, &mut work);
                ordered.push(symbol);
            }
        }
        // Callees end up after callers in discovery order; reverse so
        // every definition precedes its uses.
        ordered.reverse();
        self.reachable_fns = ordered;
    }

    fn emit_global(&mut self, global: &crate::ir::Global) -> String {
        let cty = self.cty(global.ty);
        let name = format!("llvm_cbe_{}", cbe_mangle(&global.name));
        match &global.init {
            GlobalInit::Zero => format!("static {cty} {name};\n"),
            GlobalInit::Scalar(v) => {
                format!("static {cty} {name} = {};\n", const_literal(*v))
            }
            GlobalInit::Array(values) => {
                let elems: Vec<String> = values.iter().map(|v| const_literal(*v)).collect();
                format!("static {cty} {name} = {{ {{ {} }} }};\n", elems.join(", "))
            }
        }
    }

    fn builtin_helper_text(&self) -> String {
        let mut used: HashSet<&'static str> = HashSet::new();
        let mut scan = |func: &Function| {
            for value in &func.values {
                if let ValueData::Inst(inst) = value {
                    if let Opcode::Call { callee, args } = &inst.op {
                        if let Some(b) = callee.builtin {
                            let arg_ty = args.first().map(|&a| func.value_ty(a));
                            let is_float =
                                arg_ty.is_some_and(|ty| self.types.is_float(ty));
                            match (b, is_float) {
                                (Builtin::Abs, false) => {
                                    used.insert(ABS_I32);
                                }
                                (Builtin::Abs, true) => {
                                    used.insert(ABS_F32);
                                }
                                (Builtin::Min, false) => {
                                    used.insert(MIN_I32);
                                }
                                (Builtin::Min, true) => {
                                    used.insert(MIN_F32);
                                }
                                (Builtin::Max, false) => {
                                    used.insert(MAX_I32);
                                }
                                (Builtin::Max, true) => {
                                    used.insert(MAX_F32);
                                }
                                (Builtin::Println, _) => {
                                    let decl = match arg_ty.map(|t| self.types.kind(t)) {
                                        Some(TypeKind::Float) => PRINTLN_F32,
                                        Some(TypeKind::Bool) => PRINTLN_BOOL,
                                        Some(TypeKind::Bit) => PRINTLN_BIT,
                                        _ => PRINTLN_I32,
                                    };
                                    used.insert(decl);
                                }
                                _ => {} // libm calls need no helper
                            }
                        }
                    }
                }
            }
        };
        for func in &self.module.functions {
            scan(func);
        }
        for symbol in &self.reachable_fns {
            if let Some(func) = self.lowered.shared.function(symbol) {
                scan(func);
            }
        }
        let mut out = String::new();
        for helper in [
            ABS_I32, ABS_F32, MIN_I32, MIN_F32, MAX_I32, MAX_F32, PRINTLN_I32, PRINTLN_F32,
            PRINTLN_BOOL, PRINTLN_BIT,
        ] {
            if used.contains(helper) {
                out.push_str(helper);
            }
        }
        out
    }

    // ── Function emission ──

    /// Emit one IR function. `exported_as` renames filter entry points to
    /// their permutation-qualified form and bakes the permutation's
    /// parameter constants; shared helpers emit `static`.
    fn emit_function(&mut self, func: &Function, exported_as: Option<String>) -> String {
        let plan = EmissionPlan::build(func);
        let mut ctx = FnCtx {
            func,
            plan,
            names: HashMap::new(),
        };

        // Parameters: channel pointers stay in the C signature; for
        // exported entry points the remaining parameters are baked as
        // constants from the permutation.
        let channel_params = if exported_as.is_some() {
            func.params
                .iter()
                .take_while(|p| matches!(self.types.kind(p.ty), TypeKind::Ptr(_)))
                .count()
        } else {
            func.params.len()
        };
        for (index, param) in func.params.iter().enumerate() {
            ctx.names.insert(
                func.param_value(index),
                format!("llvm_cbe_{}", cbe_mangle(&param.name)),
            );
        }

        // Names for non-inlined instruction results and slots.
        for block in &func.blocks {
            for &v in &block.insts {
                let inst = func.inst(v).unwrap();
                let named = match &inst.op {
                    Opcode::Store { .. }
                    | Opcode::Br { .. }
                    | Opcode::CondBr { .. }
                    | Opcode::Ret { .. } => false,
                    Opcode::Call { .. } => !self.types.is_void(inst.ty),
                    _ => !ctx.plan.inline_set.contains(&v),
                };
                if named {
                    ctx.names.insert(v, format!("llvm_cbe_tmp{}", self.tmp_counter));
                    self.tmp_counter += 1;
                }
            }
        }

        // Signature.
        let mut sig_params = Vec::new();
        for param in func.params.iter().take(channel_params) {
            let cty = self.cty(param.ty);
            sig_params.push(format!("{cty} llvm_cbe_{}", cbe_mangle(&param.name)));
        }
        let ret_cty = self.cty(func.ret);
        let linkage = if exported_as.is_some() { "" } else { "static " };
        let name = exported_as.as_deref().unwrap_or(&func.name);

        let mut text = String::new();
        let _ = writeln!(
            text,
            "{linkage}{ret_cty} {name}({}) {{",
            if sig_params.is_empty() {
                "void".to_string()
            } else {
                sig_params.join(", ")
            }
        );

        // Baked parameter constants.
        if exported_as.is_some() {
            for (pos, param) in func.params.iter().enumerate().skip(channel_params) {
                let value = self.perm.params[pos - channel_params];
                let cty = self.cty(param.ty);
                let _ = writeln!(
                    text,
                    "  static const {cty} llvm_cbe_{} = {};",
                    cbe_mangle(&param.name),
                    const_literal(value)
                );
            }
        }

        // Local declarations: slots, instruction results, PHI shadows.
        for block in &func.blocks {
            for &v in &block.insts {
                let inst = func.inst(v).unwrap();
                match &inst.op {
                    Opcode::Alloca { slot_ty } => {
                        let cty = self.cty(*slot_ty);
                        let _ = writeln!(text, "  {cty} {};", ctx.names[&v]);
                    }
                    Opcode::Phi { .. } => {
                        let cty = self.cty(inst.ty);
                        let name = &ctx.names[&v];
                        let _ = writeln!(text, "  {cty} {name};");
                        let _ = writeln!(text, "  {cty} {name}__PHI_TEMPORARY;");
                    }
                    _ => {
                        if let Some(name) = ctx.names.get(&v) {
                            if !self.types.is_void(inst.ty) {
                                let cty = self.cty(inst.ty);
                                let _ = writeln!(text, "  {cty} {name};");
                            }
                        }
                    }
                }
            }
        }
        text.push('\n');

        // Blocks.
        for (bidx, block) in func.blocks.iter().enumerate() {
            if bidx != 0 {
                let _ = writeln!(text, "bb{bidx}:;");
            }
            for &v in &block.insts {
                self.emit_inst(&mut text, &ctx, v);
            }
        }

        text.push_str("}\n");
        text
    }

    fn emit_inst(&mut self, text: &mut String, ctx: &FnCtx, v: ValueId) {
        let inst = ctx.func.inst(v).unwrap();
        match &inst.op {
            Opcode::Alloca { .. } => {} // declared up front
            Opcode::Phi { .. } => {
                // Copy the shadow assigned by the predecessors.
                let name = &ctx.names[&v];
                let _ = writeln!(text, "  {name} = {name}__PHI_TEMPORARY;");
            }
            Opcode::Store { value, ptr } => {
                let lvalue = self.lvalue_of(ctx, *ptr);
                let value_ty = ctx.func.value_ty(*value);
                let rhs = self.operand(ctx, *value);
                let rhs = self.masked(value_ty, rhs);
                let _ = writeln!(text, "  {lvalue} = {rhs};");
            }
            Opcode::Br { target } => {
                self.emit_phi_copies(text, ctx, ctx_block_of(ctx, v), *target, "  ");
                let _ = writeln!(text, "  goto bb{};", target.0);
            }
            Opcode::CondBr {
                cond,
                then_bb,
                else_bb,
            } => {
                let cur = ctx_block_of(ctx, v);
                let cond = self.operand(ctx, *cond);
                let _ = writeln!(text, "  if ({cond}) {{");
                self.emit_phi_copies(text, ctx, cur, *then_bb, "    ");
                let _ = writeln!(text, "    goto bb{};", then_bb.0);
                let _ = writeln!(text, "  }} else {{");
                self.emit_phi_copies(text, ctx, cur, *else_bb, "    ");
                let _ = writeln!(text, "    goto bb{};", else_bb.0);
                let _ = writeln!(text, "  }}");
            }
            Opcode::Ret { value } => match value {
                Some(v) => {
                    let expr = self.operand(ctx, *v);
                    let _ = writeln!(text, "  return {expr};");
                }
                None => {
                    let _ = writeln!(text, "  return;");
                }
            },
            Opcode::Call { .. } if self.types.is_void(inst.ty) => {
                let expr = self.inst_expr(ctx, v);
                let _ = writeln!(text, "  {expr};");
            }
            _ => {
                if ctx.plan.inline_set.contains(&v) {
                    return; // expands at its single use
                }
                let name = &ctx.names[&v];
                let expr = self.inst_expr(ctx, v);
                let _ = writeln!(text, "  {name} = {expr};");
            }
        }
    }

    /// Assign `__PHI_TEMPORARY` shadows for every PHI in `target` that has
    /// an incoming edge from `from`.
    fn emit_phi_copies(
        &mut self,
        text: &mut String,
        ctx: &FnCtx,
        from: BlockId,
        target: BlockId,
        indent: &str,
    ) {
        for &v in &ctx.func.block(target).insts {
            let Some(inst) = ctx.func.inst(v) else { continue };
            let Opcode::Phi { incomings } = &inst.op else {
                break; // phis sit at block entry
            };
            for (pred, value) in incomings {
                if *pred == from {
                    let name = &ctx.names[&v];
                    let expr = self.operand(ctx, *value);
                    let _ = writeln!(text, "{indent}{name}__PHI_TEMPORARY = {expr};");
                }
            }
        }
    }

    // ── Expressions ──

    /// Printable lvalue for a pointer operand: direct variables bypass the
    /// dereference.
    fn lvalue_of(&mut self, ctx: &FnCtx, ptr: ValueId) -> String {
        if let Some(direct) = self.direct_var(ctx, ptr) {
            return direct;
        }
        format!("*{}", self.operand(ctx, ptr))
    }

    /// If the pointer is a slot or global, the bare variable name.
    fn direct_var(&self, ctx: &FnCtx, ptr: ValueId) -> Option<String> {
        match ctx.func.value(ptr) {
            ValueData::GlobalRef { index, .. } => Some(format!(
                "llvm_cbe_{}",
                cbe_mangle(&self.module.globals[*index].name)
            )),
            ValueData::Inst(inst) if matches!(inst.op, Opcode::Alloca { .. }) => {
                Some(ctx.names[&ptr].clone())
            }
            _ => None,
        }
    }

    fn operand(&mut self, ctx: &FnCtx, v: ValueId) -> String {
        match ctx.func.value(v) {
            ValueData::ConstInt { ty, value } => {
                if self.types.is_bool(*ty) {
                    return format!("{}", *value as u8);
                }
                let cty = self.cty(*ty);
                if *value < 0 {
                    format!("(({cty})({value}))")
                } else if self.types.bit_width(*ty) > 32 {
                    format!("{value}ull")
                } else {
                    format!("{value}u")
                }
            }
            ValueData::ConstFloat { value, .. } => format_float(*value),
            ValueData::Param { .. } | ValueData::GlobalRef { .. } => match ctx.func.value(v) {
                ValueData::GlobalRef { index, .. } => format!(
                    "(&llvm_cbe_{})",
                    cbe_mangle(&self.module.globals[*index].name)
                ),
                _ => ctx.names[&v].clone(),
            },
            ValueData::Inst(inst) => {
                if matches!(inst.op, Opcode::Alloca { .. }) {
                    return format!("(&{})", ctx.names[&v]);
                }
                if ctx.plan.inline_set.contains(&v) {
                    format!("({})", self.inst_expr(ctx, v))
                } else {
                    ctx.names[&v].clone()
                }
            }
        }
    }

    fn inst_expr(&mut self, ctx: &FnCtx, v: ValueId) -> String {
        let inst = ctx.func.inst(v).unwrap();
        match &inst.op {
            Opcode::Load { ptr } => self.lvalue_of(ctx, *ptr),
            Opcode::Gep { base, indices } => self.gep_expr(ctx, *base, indices),
            Opcode::Binary { op, lhs, rhs } => self.binary_expr(ctx, inst.ty, *op, *lhs, *rhs),
            Opcode::Icmp {
                pred,
                signed,
                lhs,
                rhs,
            } => {
                let ty = ctx.func.value_ty(*lhs);
                let (l, r) = (self.operand(ctx, *lhs), self.operand(ctx, *rhs));
                if *signed && !matches!(pred, CmpPred::Eq | CmpPred::Ne) {
                    format!(
                        "({} {} {})",
                        self.signed_operand(ty, &l),
                        cmp_op(*pred),
                        self.signed_operand(ty, &r)
                    )
                } else {
                    format!("({l} {} {r})", cmp_op(*pred))
                }
            }
            Opcode::Fcmp { pred, lhs, rhs } => {
                let (l, r) = (self.operand(ctx, *lhs), self.operand(ctx, *rhs));
                format!("({l} {} {r})", cmp_op(*pred))
            }
            Opcode::Cast { kind, value } => self.cast_expr(ctx, inst.ty, *kind, *value),
            Opcode::Call { callee, args } => {
                let args: Vec<String> = args.iter().map(|&a| self.operand(ctx, a)).collect();
                let arg_ty = inst
                    .op
                    .operands()
                    .first()
                    .map(|&a| ctx.func.value_ty(a));
                let name = match callee.builtin {
                    Some(b) => self.builtin_call_name(b, arg_ty),
                    None => callee.symbol.clone(),
                };
                format!("{name}({})", args.join(", "))
            }
            Opcode::Alloca { .. }
            | Opcode::Phi { .. }
            | Opcode::Store { .. }
            | Opcode::Br { .. }
            | Opcode::CondBr { .. }
            | Opcode::Ret { .. } => unreachable!("statement opcode in expression position"),
        }
    }

    fn gep_expr(&mut self, ctx: &FnCtx, base: ValueId, indices: &[ValueId]) -> String {
        match indices {
            // Pointer arithmetic on a channel pointer.
            [index] => {
                let b = self.operand(ctx, base);
                let i = self.operand(ctx, *index);
                format!("(&{b}[{i}])")
            }
            // Leading zero steps into the wrapped array field.
            [_zero, index] => {
                let i = self.operand(ctx, *index);
                if let Some(direct) = self.direct_var(ctx, base) {
                    format!("(&{direct}.array[{i}])")
                } else {
                    let b = self.operand(ctx, base);
                    format!("(&{b}->array[{i}])")
                }
            }
            _ => panic!("unsupported GEP shape"),
        }
    }

    fn binary_expr(
        &mut self,
        ctx: &FnCtx,
        result_ty: TypeId,
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> String {
        let l = self.operand(ctx, lhs);
        let r = self.operand(ctx, rhs);
        if op.is_float() {
            return format!("({l} {} {r})", float_op(op));
        }
        let expr = match op {
            // Signed semantics re-enter through casts; results return to
            // the unsigned container.
            BinOp::SDiv | BinOp::SRem => {
                let ty = ctx.func.value_ty(lhs);
                let cty = self.cty(result_ty);
                format!(
                    "(({cty})({} {} {}))",
                    self.signed_operand(ty, &l),
                    if op == BinOp::SDiv { "/" } else { "%" },
                    self.signed_operand(ty, &r)
                )
            }
            BinOp::AShr => {
                let ty = ctx.func.value_ty(lhs);
                let cty = self.cty(result_ty);
                format!("(({cty})({} >> {r}))", self.signed_operand(ty, &l))
            }
            BinOp::Add => format!("({l} + {r})"),
            BinOp::Sub => format!("({l} - {r})"),
            BinOp::Mul => format!("({l} * {r})"),
            BinOp::UDiv => format!("({l} / {r})"),
            BinOp::URem => format!("({l} % {r})"),
            BinOp::And => format!("({l} & {r})"),
            BinOp::Or => format!("({l} | {r})"),
            BinOp::Xor => format!("({l} ^ {r})"),
            BinOp::Shl => format!("({l} << {r})"),
            BinOp::LShr => format!("({l} >> {r})"),
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => unreachable!(),
        };
        // Overflowing unsigned results stay canonical under the mask.
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Shl | BinOp::SDiv | BinOp::SRem
            | BinOp::AShr => self.masked(result_ty, expr),
            _ => expr,
        }
    }

    fn cast_expr(&mut self, ctx: &FnCtx, to: TypeId, kind: CastKind, value: ValueId) -> String {
        let from = ctx.func.value_ty(value);
        let v = self.operand(ctx, value);
        match kind {
            CastKind::Nop | CastKind::Zext => {
                let cty = self.cty(to);
                format!("(({cty})({v}))")
            }
            CastKind::Trunc => {
                let cty = self.cty(to);
                self.masked(to, format!("(({cty})({v}))"))
            }
            CastKind::Sext => {
                let cty = self.cty(to);
                let signed = self.signed_operand(from, &v);
                self.masked(to, format!("(({cty}){signed})"))
            }
            CastKind::SiToFp => {
                let signed = self.signed_operand(from, &v);
                format!("((float){signed})")
            }
            CastKind::UiToFp => format!("((float)({v}))"),
            CastKind::FpToSi => {
                let cty = self.cty(to);
                let sty = self.signed_cty(to);
                self.masked(to, format!("(({cty})(({sty})({v})))"))
            }
            // Same-width reinterpretation through the helper union keeps
            // strict aliasing intact.
            CastKind::Bitcast => {
                if self.types.is_float(to) {
                    format!("(((llvmBitCastUnion){{ .Int32 = ({v}) }}).Float)")
                } else {
                    format!("(((llvmBitCastUnion){{ .Float = ({v}) }}).Int32)")
                }
            }
        }
    }

    fn builtin_call_name(&self, b: Builtin, arg_ty: Option<TypeId>) -> String {
        let is_float = arg_ty.is_some_and(|ty| self.types.is_float(ty));
        match (b, is_float) {
            (Builtin::Println, _) => match arg_ty.map(|t| self.types.kind(t)) {
                Some(TypeKind::Float) => "streamlet_println_f32".to_string(),
                Some(TypeKind::Bool) => "streamlet_println_bool".to_string(),
                Some(TypeKind::Bit) => "streamlet_println_bit".to_string(),
                _ => "streamlet_println_i32".to_string(),
            },
            (Builtin::Abs, false) => "streamlet_abs_i32".to_string(),
            (Builtin::Abs, true) => "streamlet_abs_f32".to_string(),
            (Builtin::Min, false) => "streamlet_min_i32".to_string(),
            (Builtin::Min, true) => "streamlet_min_f32".to_string(),
            (Builtin::Max, false) => "streamlet_max_i32".to_string(),
            (Builtin::Max, true) => "streamlet_max_f32".to_string(),
            (Builtin::Sqrt, _) => "sqrtf".to_string(),
            (Builtin::Sin, _) => "sinf".to_string(),
            (Builtin::Cos, _) => "cosf".to_string(),
            (Builtin::Tan, _) => "tanf".to_string(),
            (Builtin::Floor, _) => "floorf".to_string(),
            (Builtin::Ceil, _) => "ceilf".to_string(),
            (Builtin::Log, _) => "logf".to_string(),
            (Builtin::Exp, _) => "expf".to_string(),
            (Builtin::Pow, _) => "powf".to_string(),
        }
    }
}

struct FnCtx<'f> {
    func: &'f Function,
    plan: EmissionPlan,
    names: HashMap<ValueId, String>,
}

/// Block containing a given instruction (terminators only; linear scan is
/// fine at this scale).
fn ctx_block_of(ctx: &FnCtx, v: ValueId) -> BlockId {
    for (bidx, block) in ctx.func.blocks.iter().enumerate() {
        if block.insts.contains(&v) {
            return BlockId(bidx as u32);
        }
    }
    panic!("instruction not found in any block");
}

fn exported_name(func_name: &str, perm_name: &str) -> String {
    // `<Filter>_work` → `<perm>_work`.
    let suffix = func_name.rsplit('_').next().unwrap_or("work");
    format!("{perm_name}_{suffix}")
}

fn cmp_op(pred: CmpPred) -> &'static str {
    match pred {
        CmpPred::Eq => "==",
        CmpPred::Ne => "!=",
        CmpPred::Lt => "<",
        CmpPred::Le => "<=",
        CmpPred::Gt => ">",
        CmpPred::Ge => ">=",
    }
}

fn float_op(op: BinOp) -> &'static str {
    match op {
        BinOp::FAdd => "+",
        BinOp::FSub => "-",
        BinOp::FMul => "*",
        BinOp::FDiv => "/",
        _ => unreachable!(),
    }
}

fn const_literal(v: ConstValue) -> String {
    match v {
        ConstValue::Int(i) => format!("{i}"),
        ConstValue::Bool(b) => format!("{}", b as u8),
        ConstValue::Float(f) => format_float(f),
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "LLVM_NANF(\"\")".to_string()
    } else if f.is_infinite() {
        if f > 0.0 {
            "LLVM_INFF".to_string()
        } else {
            "(-LLVM_INFF)".to_string()
        }
    } else {
        let mut s = format!("{f}");
        if !s.contains('.') && !s.contains('e') {
            s.push_str(".0");
        }
        s.push('f');
        s
    }
}

// Built-in helper definitions, emitted only when used.
const ABS_I32: &str = "static FORCEINLINE uint32_t streamlet_abs_i32(uint32_t x) {\n  return ((int32_t)x < 0) ? (uint32_t)(-(int32_t)x) : x;\n}\n";
const ABS_F32: &str =
    "static FORCEINLINE float streamlet_abs_f32(float x) {\n  return fabsf(x);\n}\n";
const MIN_I32: &str = "static FORCEINLINE uint32_t streamlet_min_i32(uint32_t a, uint32_t b) {\n  return ((int32_t)a < (int32_t)b) ? a : b;\n}\n";
const MIN_F32: &str =
    "static FORCEINLINE float streamlet_min_f32(float a, float b) {\n  return fminf(a, b);\n}\n";
const MAX_I32: &str = "static FORCEINLINE uint32_t streamlet_max_i32(uint32_t a, uint32_t b) {\n  return ((int32_t)a > (int32_t)b) ? a : b;\n}\n";
const MAX_F32: &str =
    "static FORCEINLINE float streamlet_max_f32(float a, float b) {\n  return fmaxf(a, b);\n}\n";
// println family members are black boxes to the HLS tool; simulation
// harnesses link their own definitions.
const PRINTLN_I32: &str = "extern void streamlet_println_i32(uint32_t value);\n";
const PRINTLN_F32: &str = "extern void streamlet_println_f32(float value);\n";
const PRINTLN_BOOL: &str = "extern void streamlet_println_bool(bool value);\n";
const PRINTLN_BIT: &str = "extern void streamlet_println_bit(uint8_t value);\n";

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_for(source: &str) -> GeneratedCode {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let mut sema = crate::sema::analyze(&parsed.program.unwrap());
        assert!(
            !crate::diag::has_errors(&sema.diagnostics),
            "{:?}",
            sema.diagnostics
        );
        let lowered = crate::lower::lower_program(&mut sema.program);
        assert!(lowered.diagnostics.is_empty(), "{:?}", lowered.diagnostics);
        let graph = crate::graph::build_graph(&sema.program);
        assert!(
            !crate::diag::has_errors(&graph.diagnostics),
            "{:?}",
            graph.diagnostics
        );
        emit_c(&sema.program, &lowered.lowered, &graph.graph).generated
    }

    const COUNTER: &str = "void->int filter Counter {
        int n = 0;
        work push 1 { push(n); n = n + 1; }
    }
    int->void filter Sink { work pop 1 { pop(); } }
    void->void pipeline Main { add Counter(); add Sink(); }";

    #[test]
    fn one_file_per_permutation_with_standard_prelude() {
        let generated = emit_for(COUNTER);
        assert_eq!(generated.files.len(), 2);
        let counter = &generated.files[0];
        assert_eq!(counter.filename, "filter_Counter.c");
        for header in ["<stdarg.h>", "<limits.h>", "<stdint.h>", "<math.h>"] {
            assert!(counter.source.contains(header), "missing {header}");
        }
        assert!(counter.source.contains("#define NORETURN"));
        assert!(counter.source.contains("#define FORCEINLINE"));
        assert!(counter.source.contains("LLVM_NANF"));
        assert!(counter.source.contains("llvmBitCastUnion"));
        assert!(counter.source.contains("typedef unsigned char bool;"));
    }

    #[test]
    fn counter_work_signature_and_state() {
        let generated = emit_for(COUNTER);
        let counter = &generated.files[0];
        // State variable with baked zero initializer.
        assert!(counter.source.contains("static uint32_t llvm_cbe_n = 0;"));
        // Work function takes only the output channel pointer.
        assert!(counter
            .source
            .contains("void Counter_work(uint32_t* llvm_cbe_out_ptr)"));
        assert!(counter.functions.contains(&"Counter_work".to_string()));
    }

    #[test]
    fn array_state_wraps_in_named_struct() {
        let generated = emit_for(
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
        );
        let scramble = generated
            .files
            .iter()
            .find(|f| f.name == "Scramble")
            .unwrap();
        assert!(scramble
            .source
            .contains("struct l_array_7_uint32_t {\n  uint32_t array[7];\n};"));
        assert!(scramble
            .source
            .contains("static struct l_array_7_uint32_t llvm_cbe_s = { { 1, 1, 0, 1, 1, 0, 0 } };"));
        assert!(scramble.source.contains(".array["));
    }

    #[test]
    fn parameters_bake_as_constants() {
        let generated = emit_for(
            "int->int filter Gain(int k) { work pop 1 push 1 { push(pop() * k); } }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Gain(3); add Snk(); }",
        );
        let gain = generated
            .files
            .iter()
            .find(|f| f.name.starts_with("Gain"))
            .unwrap();
        assert!(gain
            .source
            .contains("static const uint32_t llvm_cbe_k = 3;"));
        // The C signature carries only the channel pointers.
        assert!(gain.source.contains("_work(uint32_t* llvm_cbe_in_ptr, uint32_t* llvm_cbe_out_ptr)"));
    }

    #[test]
    fn odd_width_stores_are_masked() {
        let generated = emit_for(
            "int<3> -> int<3> filter Narrow {
                work pop 1 push 1 { push(pop() + (int<3>)1); }
            }
            void->int<3> filter Src { work push 1 { push((int<3>)1); } }
            int<3>->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Narrow(); add Snk(); }",
        );
        let narrow = generated
            .files
            .iter()
            .find(|f| f.name == "Narrow")
            .unwrap();
        assert!(
            narrow.source.contains("& ((1ull << 3) - 1)"),
            "missing 3-bit mask in: {}",
            narrow.source
        );
    }

    #[test]
    fn signed_division_reintroduces_signedness() {
        let generated = emit_for(
            "int->int filter Halve { work pop 1 push 1 { push(pop() / 2); } }
            void->int filter Src { work push 1 { push(8); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Halve(); add Snk(); }",
        );
        let halve = generated.files.iter().find(|f| f.name == "Halve").unwrap();
        assert!(
            halve.source.contains("(int32_t)"),
            "division must cast to signed: {}",
            halve.source
        );
    }

    #[test]
    fn phi_nodes_use_shadow_variables() {
        let generated = emit_for(
            "boolean->boolean filter F {
                work pop 2 push 1 {
                    boolean a = pop();
                    boolean b = pop();
                    push(a && b);
                }
            }
            void->boolean filter Src { work push 1 { push(true); } }
            boolean->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
        let f = generated.files.iter().find(|f| f.name == "F").unwrap();
        assert!(f.source.contains("__PHI_TEMPORARY = "));
        assert!(f.source.contains("__PHI_TEMPORARY;"));
        assert!(f.source.contains("goto bb"));
    }

    #[test]
    fn user_functions_emit_static_and_mangled() {
        let generated = emit_for(
            "int triple(int x) { return x * 3; }
            void->int filter F { work push 1 { push(triple(2)); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
        let f = generated.files.iter().find(|f| f.name == "F").unwrap();
        assert!(f.source.contains("static uint32_t triple__i32("));
        assert!(f.source.contains("triple__i32("));
        // The sink never calls triple, so its file must not define it.
        let snk = generated.files.iter().find(|f| f.name == "Snk").unwrap();
        assert!(!snk.source.contains("triple__i32"));
    }

    #[test]
    fn println_is_an_extern_black_box() {
        let generated = emit_for(COUNTER);
        let sink = generated.files.iter().find(|f| f.name == "Sink").unwrap();
        // Sink only pops; no println. Counter has none either.
        assert!(!sink.source.contains("streamlet_println"));

        let generated = emit_for(
            "void->int filter Src { work push 1 { push(1); } }
            int->void filter Printer { work pop 1 { println(pop()); } }
            void->void pipeline Main { add Src(); add Printer(); }",
        );
        let printer = generated
            .files
            .iter()
            .find(|f| f.name == "Printer")
            .unwrap();
        assert!(printer
            .source
            .contains("extern void streamlet_println_i32(uint32_t value);"));
        assert!(printer.source.contains("streamlet_println_i32("));
    }

    #[test]
    fn mangling_escapes_non_alphanumerics() {
        assert_eq!(cbe_mangle("plain_name"), "plain_name");
        assert_eq!(cbe_mangle("a.b"), "a_2e_b");
        assert_eq!(cbe_mangle("x-y"), "x_2d_y");
    }

    #[test]
    fn integer_constant_round_trip() {
        // A pushed literal survives to the C text as the same number.
        let generated = emit_for(
            "void->int filter K { work push 1 { push(12345); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add K(); add Snk(); }",
        );
        let k = generated.files.iter().find(|f| f.name == "K").unwrap();
        assert!(k.source.contains("12345u"));
    }
}
