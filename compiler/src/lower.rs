// lower.rs — Lowering of analysed filter bodies into SSA IR
//
// Produces one IR module per filter (a function per work block) plus a
// shared module holding user helper functions. Streaming primitives go
// through the `ChannelBackend` capability trait, so SSA construction is
// independent of how a target models FIFO access.
//
// Preconditions: semantic analysis succeeded with no errors.
// Postconditions: every emitted function passes `ir::verify`.
// Failure modes: none reachable from well-typed input; verifier failures
//                surface as `Internal` diagnostics.
// Side effects: interns pointer types into the job's `TypeTable`.

use std::collections::HashMap;

use crate::ast::{BinaryOp, LogicalOp, RelOp, UnaryOp};
use crate::diag::{codes, Diagnostic, DiagLevel};
use crate::id::DeclId;
use crate::ir::{
    BinOp, BlockId, Callee, CastKind, CmpPred, FuncBuilder, FuncParam, Function, Global,
    GlobalInit, Module, ValueId,
};
use crate::sema::{
    fold_const, Builtin, ConstValue, DeclKind, Declaration, FuncKind, FuncSig, ParamEnv,
    SemaProgram, TExpr, TExprKind, TStmt, TStmtKind,
};
use crate::types::{TypeId, TypeKind, TypeTable};

// ── Channel backend ─────────────────────────────────────────────────────────

/// The capability set a target supplies to lower streaming primitives.
/// These three operations are the only data-path coupling between the
/// generic lowerer and a particular backend.
pub trait ChannelBackend {
    /// Called once per function, with the builder positioned in the entry
    /// block, so the backend can set up any cursor state it needs.
    fn begin_function(&mut self, b: &mut FuncBuilder, types: &mut TypeTable);

    /// Consume one element of the filter's input channel.
    fn build_pop(&mut self, b: &mut FuncBuilder, types: &mut TypeTable) -> ValueId;

    /// Read the element `index` positions ahead without consuming.
    fn build_peek(&mut self, b: &mut FuncBuilder, types: &mut TypeTable, index: ValueId)
        -> ValueId;

    /// Produce one element on the filter's output channel.
    fn build_push(&mut self, b: &mut FuncBuilder, types: &mut TypeTable, value: ValueId);
}

/// HLS C backend: channels are pointer parameters indexed by cursor
/// slots. The HLS tool maps the pointers onto FIFO ports; sequential
/// cursor access keeps the interface streamable.
pub struct HlsChannelBackend {
    input_ty: Option<TypeId>,
    output_ty: Option<TypeId>,
    in_ptr: Option<ValueId>,
    out_ptr: Option<ValueId>,
    read_cursor: Option<ValueId>,
    write_cursor: Option<ValueId>,
}

impl HlsChannelBackend {
    pub fn new(
        input_ty: Option<TypeId>,
        output_ty: Option<TypeId>,
        in_ptr: Option<ValueId>,
        out_ptr: Option<ValueId>,
    ) -> Self {
        Self {
            input_ty,
            output_ty,
            in_ptr,
            out_ptr,
            read_cursor: None,
            write_cursor: None,
        }
    }
}

impl ChannelBackend for HlsChannelBackend {
    fn begin_function(&mut self, b: &mut FuncBuilder, types: &mut TypeTable) {
        let int = types.int();
        if self.in_ptr.is_some() {
            let slot = b.alloca(types, int);
            let zero = b.const_int(int, 0);
            b.store(types, zero, slot);
            self.read_cursor = Some(slot);
        }
        if self.out_ptr.is_some() {
            let slot = b.alloca(types, int);
            let zero = b.const_int(int, 0);
            b.store(types, zero, slot);
            self.write_cursor = Some(slot);
        }
    }

    fn build_pop(&mut self, b: &mut FuncBuilder, types: &mut TypeTable) -> ValueId {
        let elem = self.input_ty.expect("pop on a void-input filter");
        let cursor = self.read_cursor.expect("backend not initialized");
        let in_ptr = self.in_ptr.unwrap();
        let int = types.int();
        let idx = b.load(types, cursor);
        let elem_ptr_ty = types.ptr(elem);
        let addr = b.gep(elem_ptr_ty, in_ptr, vec![idx]);
        let value = b.load(types, addr);
        let one = b.const_int(int, 1);
        let next = b.binary(BinOp::Add, idx, one);
        b.store(types, next, cursor);
        value
    }

    fn build_peek(
        &mut self,
        b: &mut FuncBuilder,
        types: &mut TypeTable,
        index: ValueId,
    ) -> ValueId {
        let elem = self.input_ty.expect("peek on a void-input filter");
        let cursor = self.read_cursor.expect("backend not initialized");
        let in_ptr = self.in_ptr.unwrap();
        let idx = b.load(types, cursor);
        let offset = b.binary(BinOp::Add, idx, index);
        let elem_ptr_ty = types.ptr(elem);
        let addr = b.gep(elem_ptr_ty, in_ptr, vec![offset]);
        b.load(types, addr)
    }

    fn build_push(&mut self, b: &mut FuncBuilder, types: &mut TypeTable, value: ValueId) {
        let elem = self.output_ty.expect("push on a void-output filter");
        let cursor = self.write_cursor.expect("backend not initialized");
        let out_ptr = self.out_ptr.unwrap();
        let int = types.int();
        let idx = b.load(types, cursor);
        let elem_ptr_ty = types.ptr(elem);
        let addr = b.gep(elem_ptr_ty, out_ptr, vec![idx]);
        b.store(types, value, addr);
        let one = b.const_int(int, 1);
        let next = b.binary(BinOp::Add, idx, one);
        b.store(types, next, cursor);
    }
}

// ── Output types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LowerResult {
    pub lowered: LoweredProgram,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct LoweredProgram {
    /// One module per filter, parallel to `SemaProgram::filters`.
    pub filters: Vec<FilterModule>,
    /// User helper functions, shared by every filter that calls them.
    pub shared: Module,
}

#[derive(Debug)]
pub struct FilterModule {
    pub filter: usize,
    pub module: Module,
    pub has_input: bool,
    pub has_output: bool,
    /// Filter parameter declarations, in IR-parameter order (after the
    /// channel pointers).
    pub param_decls: Vec<DeclId>,
}

impl FilterModule {
    pub fn work_name(&self, filter_name: &str) -> String {
        format!("{filter_name}_work")
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Lower every filter and user function. Mutates only the type table
/// (pointer-type interning).
pub fn lower_program(sema: &mut SemaProgram) -> LowerResult {
    let SemaProgram {
        types,
        decls,
        func_sigs,
        functions,
        filters,
        ..
    } = sema;

    let mut diagnostics = Vec::new();

    // Shared module: user helper functions.
    let mut shared = Module::new("functions");
    for (idx, function) in functions.iter().enumerate() {
        let sig = func_sigs
            .iter()
            .find(|s| matches!(s.kind, FuncKind::User(i) if i == idx))
            .expect("user function without signature");
        let symbol = symbol_for_sig(types, sig);
        let params: Vec<FuncParam> = function
            .params
            .iter()
            .map(|&d| FuncParam {
                name: decls[d.0 as usize].name.clone(),
                ty: decls[d.0 as usize].ty,
            })
            .collect();
        let mut func = Function::new(symbol, params, function.ret);
        {
            let mut lowerer = FuncLowerer::new(types, decls, func_sigs, &mut func, None);
            for (pos, &d) in function.params.iter().enumerate() {
                lowerer.bind_param(d, pos);
            }
            lowerer.backend_begin();
            lowerer.lower_block(&function.body);
            lowerer.finish();
        }
        check_verify(&func, &mut diagnostics);
        shared.add_function(func);
    }

    // Per-filter modules.
    let mut filter_modules = Vec::new();
    for (fidx, filter) in filters.iter().enumerate() {
        let has_input = !types.is_void(filter.input);
        let has_output = !types.is_void(filter.output);

        let mut module = Module::new(filter.name.clone());

        // State variables become module globals; constant initializers
        // are baked, the rest run in init.
        let mut global_map: HashMap<DeclId, usize> = HashMap::new();
        let mut runtime_inits: Vec<(DeclId, &TExpr)> = Vec::new();
        let env = ParamEnv::new();
        for sv in &filter.state {
            let decl = &decls[sv.decl.0 as usize];
            let init = match &sv.init {
                None => GlobalInit::Zero,
                Some(expr) => match const_global_init(expr, &env) {
                    Some(init) => init,
                    None => {
                        runtime_inits.push((sv.decl, expr));
                        GlobalInit::Zero
                    }
                },
            };
            let index = module.add_global(Global {
                name: decl.name.clone(),
                ty: decl.ty,
                init,
            });
            global_map.insert(sv.decl, index);
        }

        let needs_init = filter.init.is_some() || !runtime_inits.is_empty();
        if needs_init {
            // init takes the filter parameters but no channel pointers.
            let mut func = filter_function(
                types,
                decls,
                &format!("{}_init", filter.name),
                filter,
                false,
                false,
            );
            {
                let mut lowerer =
                    FuncLowerer::new(types, decls, func_sigs, &mut func, None);
                lowerer.globals = Some(&global_map);
                bind_filter_params(&mut lowerer, filter, 0);
                lowerer.backend_begin();
                for (decl, expr) in &runtime_inits {
                    let addr = lowerer.global_addr(*decl);
                    lowerer.lower_init_into(expr, addr);
                }
                if let Some(block) = &filter.init {
                    lowerer.lower_block(&block.body);
                }
                lowerer.finish();
            }
            check_verify(&func, &mut diagnostics);
            module.add_function(func);
        }

        for (suffix, block) in [
            ("prework", filter.prework.as_ref()),
            ("work", Some(&filter.work)),
        ] {
            let Some(block) = block else { continue };
            let mut func = filter_function(
                types,
                decls,
                &format!("{}_{}", filter.name, suffix),
                filter,
                has_input,
                has_output,
            );
            let channel_params = has_input as usize + has_output as usize;
            {
                let in_ptr = has_input.then(|| func.param_value(0));
                let out_ptr = has_output.then(|| func.param_value(has_input as usize));
                let mut backend = HlsChannelBackend::new(
                    has_input.then_some(filter.input),
                    has_output.then_some(filter.output),
                    in_ptr,
                    out_ptr,
                );
                let mut lowerer =
                    FuncLowerer::new(types, decls, func_sigs, &mut func, Some(&mut backend));
                lowerer.globals = Some(&global_map);
                bind_filter_params(&mut lowerer, filter, channel_params);
                lowerer.backend_begin();
                lowerer.lower_block(&block.body);
                lowerer.finish();
            }
            check_verify(&func, &mut diagnostics);
            module.add_function(func);
        }

        filter_modules.push(FilterModule {
            filter: fidx,
            module,
            has_input,
            has_output,
            param_decls: filter.params.clone(),
        });
    }

    LowerResult {
        lowered: LoweredProgram {
            filters: filter_modules,
            shared,
        },
        diagnostics,
    }
}

fn check_verify(func: &Function, diagnostics: &mut Vec<Diagnostic>) {
    for error in crate::ir::verify(func) {
        use chumsky::span::Span as _;
        diagnostics.push(
            Diagnostic::new(
                DiagLevel::Error,
                crate::ast::Span::new((), 0..0),
                format!("IR verification failed in '{}': {error}", func.name),
            )
            .with_code(codes::E0900),
        );
    }
}

/// Mangled symbol for a callable: the source name plus its parameter
/// types, so overloads stay distinct at the C level.
pub fn symbol_for_sig(types: &TypeTable, sig: &FuncSig) -> String {
    let mut symbol = sig.name.clone();
    for &p in &sig.params {
        symbol.push_str("__");
        symbol.push_str(&type_tag(types, p));
    }
    symbol
}

fn type_tag(types: &TypeTable, ty: TypeId) -> String {
    match types.kind(ty) {
        TypeKind::Bool => "b".to_string(),
        TypeKind::Bit => "u1".to_string(),
        TypeKind::Int => "i32".to_string(),
        TypeKind::Float => "f32".to_string(),
        TypeKind::ApInt { signed, width } => {
            format!("{}{}", if *signed { "i" } else { "u" }, width)
        }
        TypeKind::Array { elem, len } => format!("a{}{}", len, type_tag(types, *elem)),
        TypeKind::Struct { name, .. } => format!("s{name}"),
        TypeKind::Void => "v".to_string(),
        TypeKind::Ptr(elem) => format!("p{}", type_tag(types, *elem)),
    }
}

fn filter_function(
    types: &mut TypeTable,
    decls: &[Declaration],
    name: &str,
    filter: &crate::sema::Filter,
    has_input: bool,
    has_output: bool,
) -> Function {
    let mut params = Vec::new();
    if has_input {
        let ty = types.ptr(filter.input);
        params.push(FuncParam {
            name: "in_ptr".to_string(),
            ty,
        });
    }
    if has_output {
        let ty = types.ptr(filter.output);
        params.push(FuncParam {
            name: "out_ptr".to_string(),
            ty,
        });
    }
    for &d in &filter.params {
        params.push(FuncParam {
            name: decls[d.0 as usize].name.clone(),
            ty: decls[d.0 as usize].ty,
        });
    }
    let void = types.void();
    Function::new(name, params, void)
}

fn bind_filter_params(lowerer: &mut FuncLowerer, filter: &crate::sema::Filter, offset: usize) {
    for (pos, &d) in filter.params.iter().enumerate() {
        lowerer.bind_param(d, offset + pos);
    }
}

fn const_global_init(expr: &TExpr, env: &ParamEnv) -> Option<GlobalInit> {
    match &expr.kind {
        TExprKind::InitList(elems) => {
            let values: Option<Vec<ConstValue>> =
                elems.iter().map(|e| fold_const(e, env)).collect();
            values.map(GlobalInit::Array)
        }
        _ => fold_const(expr, env).map(GlobalInit::Scalar),
    }
}

// ── Per-function lowering ───────────────────────────────────────────────────

/// Where a declaration's storage lives during lowering.
#[derive(Clone, Copy)]
enum Binding {
    /// Constant SSA value (function parameters).
    Direct(ValueId),
    /// Stack slot; loads and stores go through the pointer.
    Slot(ValueId),
}

struct FuncLowerer<'a, 'f> {
    types: &'a mut TypeTable,
    decls: &'a [Declaration],
    func_sigs: &'a [FuncSig],
    b: FuncBuilder<'f>,
    backend: Option<&'a mut dyn ChannelBackend>,
    globals: Option<&'a HashMap<DeclId, usize>>,
    bindings: HashMap<DeclId, Binding>,
    break_stack: Vec<BlockId>,
    continue_stack: Vec<BlockId>,
    label_counter: u32,
}

impl<'a, 'f> FuncLowerer<'a, 'f> {
    fn new(
        types: &'a mut TypeTable,
        decls: &'a [Declaration],
        func_sigs: &'a [FuncSig],
        func: &'f mut Function,
        backend: Option<&'a mut dyn ChannelBackend>,
    ) -> Self {
        Self {
            types,
            decls,
            func_sigs,
            b: FuncBuilder::new(func),
            backend,
            globals: None,
            bindings: HashMap::new(),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            label_counter: 0,
        }
    }

    fn bind_param(&mut self, decl: DeclId, index: usize) {
        let value = self.b.func.param_value(index);
        self.bindings.insert(decl, Binding::Direct(value));
    }

    fn backend_begin(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.begin_function(&mut self.b, self.types);
        }
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.label_counter += 1;
        format!("{stem}{}", self.label_counter)
    }

    /// Terminate any block left open (work-block functions return void;
    /// non-void user functions fall back to a zero return).
    fn finish(&mut self) {
        for idx in 0..self.b.func.blocks.len() {
            let id = BlockId(idx as u32);
            let terminated = self.b.func.block(id).insts.last().is_some_and(|&v| {
                self.b
                    .func
                    .inst(v)
                    .is_some_and(|inst| inst.op.is_terminator())
            });
            if terminated {
                continue;
            }
            self.b.switch_to(id);
            if self.types.is_void(self.b.func.ret) {
                self.b.ret(self.types, None);
            } else {
                let ret_ty = self.b.func.ret;
                let zero = if self.types.is_float(ret_ty) {
                    self.b.const_float(ret_ty, 0.0)
                } else {
                    self.b.const_int(ret_ty, 0)
                };
                self.b.ret(self.types, Some(zero));
            }
        }
    }

    fn global_addr(&mut self, decl: DeclId) -> ValueId {
        let index = *self
            .globals
            .expect("state access outside a filter")
            .get(&decl)
            .expect("unmapped state variable");
        let ty = self.decls[decl.0 as usize].ty;
        let ptr = self.types.ptr(ty);
        self.b.global_ref(ptr, index)
    }

    /// Store an initializer into `addr`: init lists element-wise, scalars
    /// with a single store.
    fn lower_init_into(&mut self, expr: &TExpr, addr: ValueId) {
        if let TExprKind::InitList(elems) = &expr.kind {
            let (elem_ty, _) = self
                .types
                .array_elem(expr.ty)
                .expect("init list on non-array");
            let int = self.types.int();
            let elem_ptr = self.types.ptr(elem_ty);
            for (i, elem) in elems.iter().enumerate() {
                let v = self.lower_expr(elem);
                let zero = self.b.const_int(int, 0);
                let idx = self.b.const_int(int, i as i64);
                let slot = self.b.gep(elem_ptr, addr, vec![zero, idx]);
                self.b.store(self.types, v, slot);
            }
            return;
        }
        let v = self.lower_expr(expr);
        self.b.store(self.types, v, addr);
    }

    // ── Statements ──

    fn lower_block(&mut self, stmts: &[TStmt]) {
        for stmt in stmts {
            self.lower_stmt(stmt);
        }
    }

    fn lower_stmt(&mut self, stmt: &TStmt) {
        match &stmt.kind {
            TStmtKind::Expr(e) => {
                self.lower_expr(e);
            }
            TStmtKind::VarDecl { decl, init } => self.lower_var_decl(*decl, init.as_ref()),
            TStmtKind::Push(value) => {
                let v = self.lower_expr(value);
                let backend = self.backend.as_mut().expect("push outside a work block");
                backend.build_push(&mut self.b, self.types, v);
            }
            TStmtKind::If {
                condition,
                then_block,
                else_block,
            } => self.lower_if(condition, then_block, else_block.as_deref()),
            TStmtKind::For {
                init,
                condition,
                step,
                body,
            } => self.lower_for(init.as_deref(), condition.as_ref(), step.as_ref(), body),
            TStmtKind::Break => {
                let target = *self.break_stack.last().expect("break outside a loop");
                self.b.br(self.types, target);
                let dead = self.fresh_label("dead");
                let dead = self.b.create_block(dead);
                self.b.switch_to(dead);
            }
            TStmtKind::Continue => {
                let target = *self.continue_stack.last().expect("continue outside a loop");
                self.b.br(self.types, target);
                let dead = self.fresh_label("dead");
                let dead = self.b.create_block(dead);
                self.b.switch_to(dead);
            }
            TStmtKind::Return(value) => {
                let v = value.as_ref().map(|e| self.lower_expr(e));
                self.b.ret(self.types, v);
                let dead = self.fresh_label("dead");
                let dead = self.b.create_block(dead);
                self.b.switch_to(dead);
            }
        }
    }

    fn lower_var_decl(&mut self, decl: DeclId, init: Option<&TExpr>) {
        let ty = self.decls[decl.0 as usize].ty;
        let slot = self.b.alloca(self.types, ty);
        self.bindings.insert(decl, Binding::Slot(slot));
        if let Some(init) = init {
            self.lower_init_into(init, slot);
        }
    }

    /// if/else: three new blocks; the current block ends with a
    /// conditional branch on the lowered condition.
    fn lower_if(&mut self, condition: &TExpr, then_block: &[TStmt], else_block: Option<&[TStmt]>) {
        let cond = self.lower_expr(condition);
        let then_label = self.fresh_label("then");
        let then_bb = self.b.create_block(then_label);
        let merge_label = self.fresh_label("merge");
        let merge_bb = self.b.create_block(merge_label);
        let else_bb = match else_block {
            Some(_) => {
                let label = self.fresh_label("else");
                self.b.create_block(label)
            }
            None => merge_bb,
        };

        self.b.cond_br(self.types, cond, then_bb, else_bb);

        self.b.switch_to(then_bb);
        self.lower_block(then_block);
        if !self.b.is_terminated() {
            self.b.br(self.types, merge_bb);
        }

        if let Some(else_stmts) = else_block {
            self.b.switch_to(else_bb);
            self.lower_block(else_stmts);
            if !self.b.is_terminated() {
                self.b.br(self.types, merge_bb);
            }
        }

        self.b.switch_to(merge_bb);
    }

    /// for: header tests the condition, body jumps to step, step jumps
    /// back to the header. break targets exit, continue targets step.
    fn lower_for(
        &mut self,
        init: Option<&TStmt>,
        condition: Option<&TExpr>,
        step: Option<&TExpr>,
        body: &[TStmt],
    ) {
        if let Some(init) = init {
            self.lower_stmt(init);
        }
        let header_label = self.fresh_label("header");
        let header = self.b.create_block(header_label);
        let body_label = self.fresh_label("body");
        let body_bb = self.b.create_block(body_label);
        let step_label = self.fresh_label("step");
        let step_bb = self.b.create_block(step_label);
        let exit_label = self.fresh_label("exit");
        let exit_bb = self.b.create_block(exit_label);

        self.b.br(self.types, header);

        self.b.switch_to(header);
        match condition {
            Some(c) => {
                let cond = self.lower_expr(c);
                self.b.cond_br(self.types, cond, body_bb, exit_bb);
            }
            None => self.b.br(self.types, body_bb),
        }

        self.break_stack.push(exit_bb);
        self.continue_stack.push(step_bb);
        self.b.switch_to(body_bb);
        self.lower_block(body);
        if !self.b.is_terminated() {
            self.b.br(self.types, step_bb);
        }
        self.break_stack.pop();
        self.continue_stack.pop();

        self.b.switch_to(step_bb);
        if let Some(step) = step {
            self.lower_expr(step);
        }
        self.b.br(self.types, header);

        self.b.switch_to(exit_bb);
    }

    // ── Addresses (lvalues) ──

    fn lower_addr(&mut self, expr: &TExpr) -> ValueId {
        match &expr.kind {
            TExprKind::Var(decl) => match self.bindings.get(decl).copied() {
                Some(Binding::Slot(ptr)) => ptr,
                Some(Binding::Direct(_)) => panic!("address of a constant binding"),
                None => self.global_addr(*decl),
            },
            TExprKind::Index { base, index } => {
                let base_addr = self.lower_addr(base);
                let idx = self.lower_expr(index);
                let int = self.types.int();
                let zero = self.b.const_int(int, 0);
                let elem_ptr = self.types.ptr(expr.ty);
                self.b.gep(elem_ptr, base_addr, vec![zero, idx])
            }
            _ => panic!("not an lvalue after semantic analysis"),
        }
    }

    // ── Expressions ──

    fn lower_expr(&mut self, expr: &TExpr) -> ValueId {
        match &expr.kind {
            TExprKind::IntLit(v) => self.b.const_int(expr.ty, *v),
            TExprKind::BoolLit(v) => self.b.const_int(expr.ty, *v as i64),
            TExprKind::FloatLit(v) => self.b.const_float(expr.ty, *v),
            TExprKind::Var(decl) => match self.bindings.get(decl).copied() {
                Some(Binding::Direct(v)) => v,
                Some(Binding::Slot(ptr)) => self.b.load(self.types, ptr),
                None => {
                    let addr = self.global_addr(*decl);
                    self.b.load(self.types, addr)
                }
            },
            TExprKind::Index { .. } => {
                let addr = self.lower_addr(expr);
                self.b.load(self.types, addr)
            }
            TExprKind::Unary { op, operand } => self.lower_unary(expr.ty, *op, operand),
            TExprKind::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let bin = self.pick_binop(*op, lhs.ty);
                self.b.binary(bin, l, r)
            }
            TExprKind::Relational { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let pred = rel_pred(*op);
                if self.types.is_float(lhs.ty) {
                    self.b.fcmp(self.types, pred, l, r)
                } else {
                    let signed = !is_unsigned(self.types, lhs.ty);
                    self.b.icmp(self.types, pred, signed, l, r)
                }
            }
            TExprKind::Logical { op, lhs, rhs } => self.lower_logical(*op, lhs, rhs),
            TExprKind::Comma { lhs, rhs } => {
                self.lower_expr(lhs);
                self.lower_expr(rhs)
            }
            TExprKind::Assign { op, target, value } => {
                let addr = self.lower_addr(target);
                let v = self.lower_expr(value);
                let stored = match op {
                    None => v,
                    Some(op) => {
                        let old = self.b.load(self.types, addr);
                        let bin = self.pick_binop(*op, target.ty);
                        self.b.binary(bin, old, v)
                    }
                };
                self.b.store(self.types, stored, addr);
                stored
            }
            TExprKind::Peek(index) => {
                let idx = self.lower_expr(index);
                let backend = self.backend.as_mut().expect("peek outside a work block");
                backend.build_peek(&mut self.b, self.types, idx)
            }
            TExprKind::Pop => {
                let backend = self.backend.as_mut().expect("pop outside a work block");
                backend.build_pop(&mut self.b, self.types)
            }
            TExprKind::Call { sig, args } => {
                let lowered: Vec<ValueId> = args.iter().map(|a| self.lower_expr(a)).collect();
                let sig = &self.func_sigs[*sig];
                let callee = Callee {
                    symbol: symbol_for_sig(self.types, sig),
                    builtin: match sig.kind {
                        FuncKind::Builtin(b) => Some(b),
                        FuncKind::User(_) => None,
                    },
                };
                self.b.call(sig.ret, callee, lowered)
            }
            TExprKind::Cast(inner) => {
                let v = self.lower_expr(inner);
                let kind = cast_kind(self.types, inner.ty, expr.ty);
                match kind {
                    CastKind::Nop if inner.ty == expr.ty => v,
                    _ => self.b.cast(expr.ty, kind, v),
                }
            }
            TExprKind::InitList(_) => {
                panic!("initializer list outside a declaration after semantic analysis")
            }
        }
    }

    fn lower_unary(&mut self, result_ty: TypeId, op: UnaryOp, operand: &TExpr) -> ValueId {
        match op {
            UnaryOp::PreIncrement
            | UnaryOp::PreDecrement
            | UnaryOp::PostIncrement
            | UnaryOp::PostDecrement => {
                let addr = self.lower_addr(operand);
                let old = self.b.load(self.types, addr);
                let is_float = self.types.is_float(operand.ty);
                let one = if is_float {
                    self.b.const_float(operand.ty, 1.0)
                } else {
                    self.b.const_int(operand.ty, 1)
                };
                let bin = match (op, is_float) {
                    (UnaryOp::PreIncrement | UnaryOp::PostIncrement, false) => BinOp::Add,
                    (UnaryOp::PreIncrement | UnaryOp::PostIncrement, true) => BinOp::FAdd,
                    (_, false) => BinOp::Sub,
                    (_, true) => BinOp::FSub,
                };
                let new = self.b.binary(bin, old, one);
                self.b.store(self.types, new, addr);
                match op {
                    UnaryOp::PreIncrement | UnaryOp::PreDecrement => new,
                    _ => old,
                }
            }
            UnaryOp::Positive => {
                let v = self.lower_expr(operand);
                self.widen_if_needed(v, operand.ty, result_ty)
            }
            UnaryOp::Negative => {
                let v = self.lower_expr(operand);
                let v = self.widen_if_needed(v, operand.ty, result_ty);
                if self.types.is_float(result_ty) {
                    let zero = self.b.const_float(result_ty, 0.0);
                    self.b.binary(BinOp::FSub, zero, v)
                } else {
                    let zero = self.b.const_int(result_ty, 0);
                    self.b.binary(BinOp::Sub, zero, v)
                }
            }
            UnaryOp::LogicalNot => {
                let v = self.lower_expr(operand);
                let one = self.b.const_int(result_ty, 1);
                self.b.binary(BinOp::Xor, v, one)
            }
            UnaryOp::BitwiseNot => {
                let v = self.lower_expr(operand);
                let ones = self.b.const_int(result_ty, -1);
                self.b.binary(BinOp::Xor, v, ones)
            }
        }
    }

    fn widen_if_needed(&mut self, v: ValueId, from: TypeId, to: TypeId) -> ValueId {
        if from == to {
            return v;
        }
        let kind = cast_kind(self.types, from, to);
        self.b.cast(to, kind, v)
    }

    /// Short-circuit && and ||: diamond control flow with a PHI at the
    /// merge. The right operand only evaluates when the left one did not
    /// decide the result.
    fn lower_logical(&mut self, op: LogicalOp, lhs: &TExpr, rhs: &TExpr) -> ValueId {
        let l = self.lower_expr(lhs);
        let lhs_end = self.b.current_block();
        let rhs_label = self.fresh_label("rhs");
        let rhs_bb = self.b.create_block(rhs_label);
        let merge_label = self.fresh_label("sc_merge");
        let merge_bb = self.b.create_block(merge_label);

        let bool_ty = self.types.bool_();
        // The value the expression takes when the left operand decides it.
        let short_value = match op {
            LogicalOp::And => {
                self.b.cond_br(self.types, l, rhs_bb, merge_bb);
                0
            }
            LogicalOp::Or => {
                self.b.cond_br(self.types, l, merge_bb, rhs_bb);
                1
            }
        };

        self.b.switch_to(rhs_bb);
        let r = self.lower_expr(rhs);
        let rhs_end = self.b.current_block();
        self.b.br(self.types, merge_bb);

        self.b.switch_to(merge_bb);
        let short_const = self.b.const_int(bool_ty, short_value);
        self.b.phi(
            bool_ty,
            vec![(lhs_end, short_const), (rhs_end, r)],
        )
    }

    fn pick_binop(&self, op: BinaryOp, operand_ty: TypeId) -> BinOp {
        let float = self.types.is_float(operand_ty);
        let unsigned = is_unsigned(self.types, operand_ty);
        match op {
            BinaryOp::Add => {
                if float {
                    BinOp::FAdd
                } else {
                    BinOp::Add
                }
            }
            BinaryOp::Sub => {
                if float {
                    BinOp::FSub
                } else {
                    BinOp::Sub
                }
            }
            BinaryOp::Mul => {
                if float {
                    BinOp::FMul
                } else {
                    BinOp::Mul
                }
            }
            BinaryOp::Div => {
                if float {
                    BinOp::FDiv
                } else if unsigned {
                    BinOp::UDiv
                } else {
                    BinOp::SDiv
                }
            }
            BinaryOp::Rem => {
                if unsigned {
                    BinOp::URem
                } else {
                    BinOp::SRem
                }
            }
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::BitXor => BinOp::Xor,
            BinaryOp::Shl => BinOp::Shl,
            BinaryOp::Shr => {
                if unsigned {
                    BinOp::LShr
                } else {
                    BinOp::AShr
                }
            }
        }
    }
}

fn rel_pred(op: RelOp) -> CmpPred {
    match op {
        RelOp::Less => CmpPred::Lt,
        RelOp::LessEqual => CmpPred::Le,
        RelOp::Greater => CmpPred::Gt,
        RelOp::GreaterEqual => CmpPred::Ge,
        RelOp::Equal => CmpPred::Eq,
        RelOp::NotEqual => CmpPred::Ne,
    }
}

fn is_unsigned(types: &TypeTable, ty: TypeId) -> bool {
    matches!(
        types.kind(ty),
        TypeKind::Bit | TypeKind::Bool | TypeKind::ApInt { signed: false, .. }
    )
}

/// Classify a conversion per the lattice: integer widening sign- or
/// zero-extends (zero for Bit/Bool), narrowing truncates, int → float is
/// a signed/unsigned convert, float → int truncates toward zero.
pub fn cast_kind(types: &TypeTable, from: TypeId, to: TypeId) -> CastKind {
    if from == to {
        return CastKind::Nop;
    }
    let from_float = types.is_float(from);
    let to_float = types.is_float(to);
    match (from_float, to_float) {
        (true, true) => CastKind::Nop,
        (false, true) => {
            if is_unsigned(types, from) {
                CastKind::UiToFp
            } else {
                CastKind::SiToFp
            }
        }
        (true, false) => CastKind::FpToSi,
        (false, false) => {
            let wf = types.bit_width(from);
            let wt = types.bit_width(to);
            use std::cmp::Ordering;
            match wf.cmp(&wt) {
                Ordering::Less => {
                    if is_unsigned(types, from) {
                        CastKind::Zext
                    } else {
                        CastKind::Sext
                    }
                }
                Ordering::Greater => CastKind::Trunc,
                Ordering::Equal => CastKind::Nop,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{self, Opcode};

    fn lower_source(source: &str) -> (SemaProgram, LoweredProgram) {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let mut result = crate::sema::analyze(&parsed.program.unwrap());
        assert!(
            !crate::diag::has_errors(&result.diagnostics),
            "{:?}",
            result.diagnostics
        );
        let lowered = lower_program(&mut result.program);
        assert!(
            lowered.diagnostics.is_empty(),
            "{:?}",
            lowered.diagnostics
        );
        (result.program, lowered.lowered)
    }

    fn work_fn<'a>(
        lowered: &'a LoweredProgram,
        sema: &SemaProgram,
        filter_name: &str,
    ) -> &'a Function {
        let fm = lowered
            .filters
            .iter()
            .find(|fm| sema.filters[fm.filter].name == filter_name)
            .unwrap();
        fm.module
            .function(&format!("{filter_name}_work"))
            .unwrap()
    }

    const COUNTER: &str = "void->int filter Counter {
        int n = 0;
        work push 1 { push(n); n = n + 1; }
    }
    int->void filter Sink { work pop 1 { pop(); } }
    void->void pipeline Main { add Counter(); add Sink(); }";

    #[test]
    fn counter_lowers_and_verifies() {
        let (sema, lowered) = lower_source(COUNTER);
        let work = work_fn(&lowered, &sema, "Counter");
        assert!(ir::verify(work).is_empty());
        // n is module state, not a function slot.
        let counter_mod = &lowered.filters[0].module;
        assert_eq!(counter_mod.globals.len(), 1);
        assert_eq!(counter_mod.globals[0].name, "n");
        assert!(matches!(
            counter_mod.globals[0].init,
            GlobalInit::Scalar(ConstValue::Int(0))
        ));
    }

    #[test]
    fn work_function_params_model_channels() {
        let (sema, lowered) = lower_source(COUNTER);
        let counter_work = work_fn(&lowered, &sema, "Counter");
        // void input: only the output pointer.
        assert_eq!(counter_work.params.len(), 1);
        assert_eq!(counter_work.params[0].name, "out_ptr");
        let sink_work = work_fn(&lowered, &sema, "Sink");
        assert_eq!(sink_work.params.len(), 1);
        assert_eq!(sink_work.params[0].name, "in_ptr");
    }

    #[test]
    fn if_else_produces_diamond() {
        let (sema, lowered) = lower_source(
            "int->int filter F {
                work pop 1 push 1 {
                    int x = pop();
                    if (x > 0) push(x); else push(0 - x);
                }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
        let work = work_fn(&lowered, &sema, "F");
        assert!(ir::verify(work).is_empty(), "{:?}", ir::verify(work));
        // entry + then + merge + else
        assert!(work.blocks.len() >= 4);
        let cond_brs = work
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|&&v| {
                matches!(
                    work.inst(v).map(|i| &i.op),
                    Some(Opcode::CondBr { .. })
                )
            })
            .count();
        assert_eq!(cond_brs, 1);
    }

    #[test]
    fn for_loop_produces_header_body_step_exit() {
        let (sema, lowered) = lower_source(
            "void->int filter F {
                work push 4 { for (int i = 0; i < 4; i++) push(i); }
            }
            int->void filter Snk { work pop 4 { for (int i = 0; i < 4; i++) pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
        let work = work_fn(&lowered, &sema, "F");
        assert!(ir::verify(work).is_empty(), "{:?}", ir::verify(work));
        let labels: Vec<&str> = work.blocks.iter().map(|b| b.label.as_str()).collect();
        assert!(labels.iter().any(|l| l.starts_with("header")));
        assert!(labels.iter().any(|l| l.starts_with("body")));
        assert!(labels.iter().any(|l| l.starts_with("step")));
        assert!(labels.iter().any(|l| l.starts_with("exit")));
    }

    #[test]
    fn logical_and_emits_phi() {
        let (sema, lowered) = lower_source(
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
        let work = work_fn(&lowered, &sema, "F");
        assert!(ir::verify(work).is_empty(), "{:?}", ir::verify(work));
        let phis = work
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|&&v| matches!(work.inst(v).map(|i| &i.op), Some(Opcode::Phi { .. })))
            .count();
        assert_eq!(phis, 1);
    }

    #[test]
    fn array_init_list_stores_elementwise() {
        let (sema, lowered) = lower_source(
            "int->int filter S {
                work pop 1 push 1 {
                    int[3] s = {4, 5, 6};
                    push(pop() + s[1]);
                }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add S(); add Snk(); }",
        );
        let work = work_fn(&lowered, &sema, "S");
        assert!(ir::verify(work).is_empty());
        let geps = work
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|&&v| matches!(work.inst(v).map(|i| &i.op), Some(Opcode::Gep { .. })))
            .count();
        // 3 init stores + 1 indexed read, plus channel cursor GEPs.
        assert!(geps >= 4, "expected at least 4 GEPs, got {geps}");
    }

    #[test]
    fn state_array_with_const_init_becomes_global() {
        let (_sema, lowered) = lower_source(
            "int->int filter Scramble {
                int[7] s = {1, 1, 0, 1, 1, 0, 0};
                work pop 1 push 1 { push(pop() + s[3]); }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Scramble(); add Snk(); }",
        );
        let module = &lowered.filters[0].module;
        assert_eq!(module.globals.len(), 1);
        let GlobalInit::Array(values) = &module.globals[0].init else {
            panic!("expected array init");
        };
        assert_eq!(values.len(), 7);
        assert_eq!(values[0], ConstValue::Int(1));
        assert_eq!(values[2], ConstValue::Int(0));
    }

    #[test]
    fn runtime_state_init_moves_to_init_function() {
        let (sema, lowered) = lower_source(
            "int->int filter Gain(int k) {
                int factor = k * 2;
                work pop 1 push 1 { push(pop() * factor); }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Gain(3); add Snk(); }",
        );
        let fm = lowered
            .filters
            .iter()
            .find(|fm| sema.filters[fm.filter].name == "Gain")
            .unwrap();
        let init = fm.module.function("Gain_init").expect("init function");
        assert!(ir::verify(init).is_empty());
        // The parameter-dependent initializer stores into the global.
        let stores = init
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|&&v| matches!(init.inst(v).map(|i| &i.op), Some(Opcode::Store { .. })))
            .count();
        assert!(stores >= 1);
    }

    #[test]
    fn user_functions_lower_into_shared_module() {
        let (_sema, lowered) = lower_source(
            "int triple(int x) { return x * 3; }
            void->int filter F { work push 1 { push(triple(2)); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
        let f = lowered.shared.function("triple__i32").expect("mangled fn");
        assert!(ir::verify(f).is_empty());
        assert_eq!(f.params.len(), 1);
    }

    #[test]
    fn casts_lower_per_lattice() {
        let mut types = TypeTable::new();
        let i8t = types.ap_int(true, 8);
        let int = types.int();
        let float = types.float();
        let bit = types.bit();
        assert_eq!(cast_kind(&types, i8t, int), CastKind::Sext);
        assert_eq!(cast_kind(&types, bit, int), CastKind::Zext);
        assert_eq!(cast_kind(&types, int, i8t), CastKind::Trunc);
        assert_eq!(cast_kind(&types, int, float), CastKind::SiToFp);
        assert_eq!(cast_kind(&types, bit, float), CastKind::UiToFp);
        assert_eq!(cast_kind(&types, float, int), CastKind::FpToSi);
        assert_eq!(cast_kind(&types, int, int), CastKind::Nop);
    }

    /// A recording backend proves the lowerer works against any backend,
    /// not just the HLS one.
    struct RecordingBackend {
        pops: usize,
        peeks: usize,
        pushes: usize,
        dummy_ty: TypeId,
    }

    impl ChannelBackend for RecordingBackend {
        fn begin_function(&mut self, _b: &mut FuncBuilder, _types: &mut TypeTable) {}

        fn build_pop(&mut self, b: &mut FuncBuilder, _types: &mut TypeTable) -> ValueId {
            self.pops += 1;
            b.const_int(self.dummy_ty, 0)
        }

        fn build_peek(
            &mut self,
            b: &mut FuncBuilder,
            _types: &mut TypeTable,
            _index: ValueId,
        ) -> ValueId {
            self.peeks += 1;
            b.const_int(self.dummy_ty, 0)
        }

        fn build_push(&mut self, _b: &mut FuncBuilder, _types: &mut TypeTable, _value: ValueId) {
            self.pushes += 1;
        }
    }

    #[test]
    fn backend_is_pluggable() {
        let parsed = crate::parser::parse(
            "int->int filter F { work peek 2 pop 1 push 2 { push(peek(1)); push(pop()); } }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
        let mut result = crate::sema::analyze(&parsed.program.unwrap());
        assert!(!crate::diag::has_errors(&result.diagnostics));
        let sema = &mut result.program;
        let filter = sema
            .filters
            .iter()
            .position(|f| f.name == "F")
            .unwrap();

        let void = sema.types.void();
        let mut func = Function::new("probe", Vec::new(), void);
        let int = sema.types.int();
        let mut backend = RecordingBackend {
            pops: 0,
            peeks: 0,
            pushes: 0,
            dummy_ty: int,
        };
        {
            let SemaProgram {
                types,
                decls,
                func_sigs,
                filters,
                ..
            } = sema;
            let empty = HashMap::new();
            let mut lowerer =
                FuncLowerer::new(types, decls, func_sigs, &mut func, Some(&mut backend));
            lowerer.globals = Some(&empty);
            lowerer.backend_begin();
            let body = &filters[filter].work.body;
            lowerer.lower_block(body);
            lowerer.finish();
        }
        assert_eq!(backend.pops, 1);
        assert_eq!(backend.peeks, 1);
        assert_eq!(backend.pushes, 2);
    }
}
