// sema.rs — Semantic analysis for Streamlet programs
//
// Walks the AST once and produces a fully typed program: every expression
// carries its resolved type, every identifier its declaration id, every
// implicit conversion an explicit cast node. Also validates lexical
// scoping, overloads, constant array sizes, and work-block rates, and
// infers filter statefulness from writes to filter-scope state.
//
// Preconditions: `program` is a parsed AST.
// Postconditions: returns `SemaResult`; artifacts are complete iff no
//                 error-level diagnostics were produced.
// Failure modes: all user-facing semantic errors, reported as diagnostics;
//                analysis continues at statement boundaries.
// Side effects: none. Re-running on the same AST yields identical output.

use std::collections::HashMap;

use crate::ast::{self, BinaryOp, LogicalOp, RelOp, Span, UnaryOp};
use crate::diag::{codes, Diagnostic};
use crate::id::{DeclId, IdAllocator};
use crate::types::{TypeId, TypeKind, TypeTable};

// ── Typed program ───────────────────────────────────────────────────────────

/// Result of semantic analysis.
#[derive(Debug)]
pub struct SemaResult {
    pub program: SemaProgram,
    pub diagnostics: Vec<Diagnostic>,
}

/// The analysed program: typed declarations, filters, composites, and
/// helper functions, with all names resolved to `DeclId`s.
#[derive(Debug)]
pub struct SemaProgram {
    pub types: TypeTable,
    pub decls: Vec<Declaration>,
    pub func_sigs: Vec<FuncSig>,
    pub functions: Vec<Function>,
    pub filters: Vec<Filter>,
    pub composites: Vec<CompositeDef>,
    /// The top-level void → void pipeline, if one exists.
    pub top: Option<DeclId>,
}

impl SemaProgram {
    pub fn decl(&self, id: DeclId) -> &Declaration {
        &self.decls[id.0 as usize]
    }

    pub fn filter_of(&self, id: DeclId) -> Option<&Filter> {
        match self.decl(id).kind {
            DeclKind::Filter(idx) => Some(&self.filters[idx]),
            _ => None,
        }
    }

    pub fn composite_of(&self, id: DeclId) -> Option<&CompositeDef> {
        match self.decl(id).kind {
            DeclKind::Pipeline(idx) | DeclKind::SplitJoin(idx) => Some(&self.composites[idx]),
            _ => None,
        }
    }
}

/// A named entity. Stream declarations carry their element types on the
/// `Filter`/`CompositeDef` records; `ty` is meaningful for values.
#[derive(Debug)]
pub struct Declaration {
    pub name: String,
    pub span: Span,
    pub ty: TypeId,
    pub constant: bool,
    pub kind: DeclKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Variable,
    /// Filter-scope state, persistent across work invocations.
    StateVariable,
    Parameter,
    Filter(usize),
    Pipeline(usize),
    SplitJoin(usize),
    Function(usize),
}

/// A callable signature — built-in or user helper function.
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub kind: FuncKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Builtin(Builtin),
    /// Index into `SemaProgram::functions`.
    User(usize),
}

/// Pre-registered built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Println,
    Abs,
    Min,
    Max,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
    Log,
    Exp,
    Pow,
}

/// A typed user helper function.
#[derive(Debug)]
pub struct Function {
    pub decl: DeclId,
    pub name: String,
    pub params: Vec<DeclId>,
    pub ret: TypeId,
    pub body: Vec<TStmt>,
}

/// A typed filter declaration.
#[derive(Debug)]
pub struct Filter {
    pub decl: DeclId,
    pub name: String,
    pub input: TypeId,
    pub output: TypeId,
    /// Declared with `stateful`, or inferred from a state write outside
    /// the init block.
    pub stateful: bool,
    pub params: Vec<DeclId>,
    pub state: Vec<StateVar>,
    pub init: Option<TWorkBlock>,
    pub prework: Option<TWorkBlock>,
    pub work: TWorkBlock,
    pub span: Span,
}

#[derive(Debug)]
pub struct StateVar {
    pub decl: DeclId,
    pub init: Option<TExpr>,
}

/// A typed work block. Rates stay as expressions: they may reference
/// filter parameters, which are bound per instance during stream-graph
/// elaboration.
#[derive(Debug)]
pub struct TWorkBlock {
    pub peek_rate: Option<TExpr>,
    pub pop_rate: Option<TExpr>,
    pub push_rate: Option<TExpr>,
    pub body: Vec<TStmt>,
    pub span: Span,
}

/// A typed pipeline or splitjoin declaration.
#[derive(Debug)]
pub struct CompositeDef {
    pub decl: DeclId,
    pub name: String,
    pub input: TypeId,
    pub output: TypeId,
    pub params: Vec<DeclId>,
    pub kind: CompositeKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum CompositeKind {
    Pipeline {
        adds: Vec<AddStmt>,
    },
    SplitJoin {
        split: SplitPolicy,
        adds: Vec<AddStmt>,
        join: JoinPolicy,
    },
}

#[derive(Debug)]
pub struct AddStmt {
    pub target: DeclId,
    pub args: Vec<TExpr>,
    pub span: Span,
}

/// Split distribution policy. Round-robin weights stay as expressions for
/// the same reason rates do; an empty list means all-ones.
#[derive(Debug)]
pub enum SplitPolicy {
    Duplicate,
    RoundRobin(Vec<TExpr>),
}

#[derive(Debug)]
pub struct JoinPolicy {
    pub weights: Vec<TExpr>,
}

// ── Typed statements and expressions ────────────────────────────────────────

#[derive(Debug)]
pub struct TStmt {
    pub kind: TStmtKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum TStmtKind {
    Expr(TExpr),
    VarDecl {
        decl: DeclId,
        init: Option<TExpr>,
    },
    Push(TExpr),
    If {
        condition: TExpr,
        then_block: Vec<TStmt>,
        else_block: Option<Vec<TStmt>>,
    },
    For {
        init: Option<Box<TStmt>>,
        condition: Option<TExpr>,
        step: Option<TExpr>,
        body: Vec<TStmt>,
    },
    Break,
    Continue,
    Return(Option<TExpr>),
}

#[derive(Debug)]
pub struct TExpr {
    pub ty: TypeId,
    pub span: Span,
    pub kind: TExprKind,
}

#[derive(Debug)]
pub enum TExprKind {
    IntLit(i64),
    BoolLit(bool),
    FloatLit(f64),
    Var(DeclId),
    Index {
        base: Box<TExpr>,
        index: Box<TExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<TExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Relational {
        op: RelOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Comma {
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    /// Plain or compound assignment. For compound forms the operand
    /// conversion has been checked; lowering emits load-modify-store.
    Assign {
        op: Option<BinaryOp>,
        target: Box<TExpr>,
        value: Box<TExpr>,
    },
    Peek(Box<TExpr>),
    Pop,
    Call {
        sig: usize,
        args: Vec<TExpr>,
    },
    /// Conversion to `self.ty` — explicit in source or inserted by sema.
    Cast(Box<TExpr>),
    InitList(Vec<TExpr>),
}

// ── Constant values and folding ─────────────────────────────────────────────

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl ConstValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(v),
            ConstValue::Bool(b) => Some(b as i64),
            ConstValue::Float(_) => None,
        }
    }
}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Bindings from parameter declarations to constant values, supplied by
/// the stream-graph builder when it elaborates a filter instance.
pub type ParamEnv = HashMap<DeclId, ConstValue>;

/// Fold a typed expression to a constant, if every leaf is compile-time
/// known under `env`. Division by zero and out-of-range shifts fold to
/// `None` (callers report non-constant where a constant is required).
pub fn fold_const(expr: &TExpr, env: &ParamEnv) -> Option<ConstValue> {
    match &expr.kind {
        TExprKind::IntLit(v) => Some(ConstValue::Int(*v)),
        TExprKind::BoolLit(b) => Some(ConstValue::Bool(*b)),
        TExprKind::FloatLit(v) => Some(ConstValue::Float(*v)),
        TExprKind::Var(decl) => env.get(decl).copied(),
        TExprKind::Cast(inner) => fold_const(inner, env),
        TExprKind::Unary { op, operand } => {
            let v = fold_const(operand, env)?;
            match (op, v) {
                (UnaryOp::Positive, v) => Some(v),
                (UnaryOp::Negative, ConstValue::Int(i)) => Some(ConstValue::Int(i.wrapping_neg())),
                (UnaryOp::Negative, ConstValue::Float(f)) => Some(ConstValue::Float(-f)),
                (UnaryOp::LogicalNot, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
                (UnaryOp::BitwiseNot, ConstValue::Int(i)) => Some(ConstValue::Int(!i)),
                _ => None,
            }
        }
        TExprKind::Binary { op, lhs, rhs } => {
            let l = fold_const(lhs, env)?;
            let r = fold_const(rhs, env)?;
            match (l, r) {
                (ConstValue::Int(a), ConstValue::Int(b)) => {
                    let v = match op {
                        BinaryOp::Add => a.wrapping_add(b),
                        BinaryOp::Sub => a.wrapping_sub(b),
                        BinaryOp::Mul => a.wrapping_mul(b),
                        BinaryOp::Div => {
                            if b == 0 {
                                return None;
                            }
                            a.wrapping_div(b)
                        }
                        BinaryOp::Rem => {
                            if b == 0 {
                                return None;
                            }
                            a.wrapping_rem(b)
                        }
                        BinaryOp::BitAnd => a & b,
                        BinaryOp::BitOr => a | b,
                        BinaryOp::BitXor => a ^ b,
                        BinaryOp::Shl => {
                            if !(0..64).contains(&b) {
                                return None;
                            }
                            a.wrapping_shl(b as u32)
                        }
                        BinaryOp::Shr => {
                            if !(0..64).contains(&b) {
                                return None;
                            }
                            a.wrapping_shr(b as u32)
                        }
                    };
                    Some(ConstValue::Int(v))
                }
                (ConstValue::Float(a), ConstValue::Float(b)) => {
                    let v = match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        _ => return None,
                    };
                    Some(ConstValue::Float(v))
                }
                _ => None,
            }
        }
        TExprKind::Relational { op, lhs, rhs } => {
            let l = fold_const(lhs, env)?;
            let r = fold_const(rhs, env)?;
            let cmp = match (l, r) {
                (ConstValue::Int(a), ConstValue::Int(b)) => a.partial_cmp(&b),
                (ConstValue::Float(a), ConstValue::Float(b)) => a.partial_cmp(&b),
                (ConstValue::Bool(a), ConstValue::Bool(b)) => a.partial_cmp(&b),
                _ => None,
            }?;
            let v = match op {
                RelOp::Less => cmp.is_lt(),
                RelOp::LessEqual => cmp.is_le(),
                RelOp::Greater => cmp.is_gt(),
                RelOp::GreaterEqual => cmp.is_ge(),
                RelOp::Equal => cmp.is_eq(),
                RelOp::NotEqual => cmp.is_ne(),
            };
            Some(ConstValue::Bool(v))
        }
        TExprKind::Logical { op, lhs, rhs } => {
            let ConstValue::Bool(l) = fold_const(lhs, env)? else {
                return None;
            };
            // Short-circuit even when folding.
            match (op, l) {
                (LogicalOp::And, false) => Some(ConstValue::Bool(false)),
                (LogicalOp::Or, true) => Some(ConstValue::Bool(true)),
                _ => fold_const(rhs, env),
            }
        }
        _ => None,
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Analyse a parsed program.
pub fn analyze(program: &ast::Program) -> SemaResult {
    let mut analyzer = Analyzer::new();
    analyzer.run(program);
    SemaResult {
        program: SemaProgram {
            types: analyzer.types,
            decls: analyzer.decls,
            func_sigs: analyzer.func_sigs,
            functions: analyzer.functions,
            filters: analyzer.filters,
            composites: analyzer.composites,
            top: analyzer.top,
        },
        diagnostics: analyzer.diagnostics,
    }
}

// ── Analyzer state ──────────────────────────────────────────────────────────

struct FilterCtx {
    input: TypeId,
    output: TypeId,
    /// Effective peek window of the block being analysed, when foldable
    /// without parameter bindings.
    peek_bound: Option<i64>,
    /// True inside the init block, where state writes do not make the
    /// filter stateful.
    in_init: bool,
    /// Set when a state variable is written outside init.
    wrote_state: bool,
}

struct Analyzer {
    types: TypeTable,
    decls: Vec<Declaration>,
    scopes: Vec<HashMap<String, DeclId>>,
    func_sigs: Vec<FuncSig>,
    functions: Vec<Function>,
    filters: Vec<Filter>,
    composites: Vec<CompositeDef>,
    /// Declared parameter arity per filter / composite, captured during
    /// registration so adds can be checked before bodies are analysed.
    filter_arity: Vec<usize>,
    composite_arity: Vec<usize>,
    struct_types: HashMap<String, TypeId>,
    diagnostics: Vec<Diagnostic>,
    id_alloc: IdAllocator,
    filter_ctx: Option<FilterCtx>,
    return_type: Option<TypeId>,
    top: Option<DeclId>,
}

impl Analyzer {
    fn new() -> Self {
        let mut analyzer = Self {
            types: TypeTable::new(),
            decls: Vec::new(),
            scopes: vec![HashMap::new()],
            func_sigs: Vec::new(),
            functions: Vec::new(),
            filters: Vec::new(),
            composites: Vec::new(),
            filter_arity: Vec::new(),
            composite_arity: Vec::new(),
            struct_types: HashMap::new(),
            diagnostics: Vec::new(),
            id_alloc: IdAllocator::new(),
            filter_ctx: None,
            return_type: None,
            top: None,
        };
        analyzer.register_builtins();
        analyzer
    }

    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    fn warn(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::warning(code, span, message));
    }

    // ── Scopes ──

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, name: &str) -> Option<DeclId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    /// Allocate a declaration record without touching the scope stack
    /// (used for functions, which resolve through the signature table and
    /// may be overloaded).
    fn alloc_decl(
        &mut self,
        name: &str,
        span: Span,
        ty: TypeId,
        constant: bool,
        kind: DeclKind,
    ) -> DeclId {
        let id = self.id_alloc.alloc_decl();
        debug_assert_eq!(id.0 as usize, self.decls.len());
        self.decls.push(Declaration {
            name: name.to_string(),
            span,
            ty,
            constant,
            kind,
        });
        id
    }

    /// Declare a name in the innermost scope. Same-scope duplicates are a
    /// `Redefinition`; shadowing an outer scope is allowed.
    fn declare(
        &mut self,
        name: &str,
        span: Span,
        ty: TypeId,
        constant: bool,
        kind: DeclKind,
    ) -> DeclId {
        let id = self.alloc_decl(name, span, ty, constant, kind);
        let scope = self.scopes.last_mut().unwrap();
        if let Some(&prev) = scope.get(name) {
            let prev_span = self.decls[prev.0 as usize].span;
            self.diagnostics.push(
                Diagnostic::error(codes::E0101, span, format!("'{name}' is already defined"))
                    .with_related(prev_span, "previous definition here"),
            );
        } else {
            scope.insert(name.to_string(), id);
        }
        id
    }

    // ── Built-ins ──

    fn register_builtins(&mut self) {
        let int = self.types.int();
        let float = self.types.float();
        let boolean = self.types.bool_();
        let bit = self.types.bit();
        let void = self.types.void();

        let mut sig = |this: &mut Self, name: &str, params: Vec<TypeId>, ret, builtin| {
            this.func_sigs.push(FuncSig {
                name: name.to_string(),
                params,
                ret,
                kind: FuncKind::Builtin(builtin),
            });
        };

        for ty in [int, float, boolean, bit] {
            sig(self, "println", vec![ty], void, Builtin::Println);
        }
        for ty in [int, float] {
            sig(self, "abs", vec![ty], ty, Builtin::Abs);
            sig(self, "min", vec![ty, ty], ty, Builtin::Min);
            sig(self, "max", vec![ty, ty], ty, Builtin::Max);
        }
        for (name, builtin) in [
            ("sqrt", Builtin::Sqrt),
            ("sin", Builtin::Sin),
            ("cos", Builtin::Cos),
            ("tan", Builtin::Tan),
            ("floor", Builtin::Floor),
            ("ceil", Builtin::Ceil),
            ("log", Builtin::Log),
            ("exp", Builtin::Exp),
        ] {
            sig(self, name, vec![float], float, builtin);
        }
        sig(self, "pow", vec![float, float], float, Builtin::Pow);
    }

    // ── Driver ──

    fn run(&mut self, program: &ast::Program) {
        // Struct declarations first: later types may reference them.
        for s in &program.structs {
            self.analyze_struct(s);
        }

        // Pre-register helper-function signatures so call order does not
        // matter, then stream declarations so pipelines can reference
        // filters declared after them.
        for f in &program.functions {
            self.register_function(f);
        }
        for s in &program.streams {
            self.register_stream(s);
        }

        for (idx, f) in program.functions.iter().enumerate() {
            self.analyze_function_body(idx, f);
        }
        for s in &program.streams {
            match s {
                ast::StreamDecl::Filter(f) => self.analyze_filter(f),
                ast::StreamDecl::Pipeline(p) => self.analyze_pipeline(p),
                ast::StreamDecl::SplitJoin(sj) => self.analyze_splitjoin(sj),
            }
        }

        self.check_unused_streams();
    }

    // ── Types ──

    fn resolve_type(&mut self, spec: &ast::TypeSpec) -> Option<TypeId> {
        match &spec.kind {
            ast::TypeSpecKind::Void => Some(self.types.void()),
            ast::TypeSpecKind::Boolean => Some(self.types.bool_()),
            ast::TypeSpecKind::Bit => Some(self.types.bit()),
            ast::TypeSpecKind::Int => Some(self.types.int()),
            ast::TypeSpecKind::Float => Some(self.types.float()),
            ast::TypeSpecKind::Complex => {
                self.error(
                    codes::E0500,
                    spec.span,
                    "'complex' is not supported by the hardware flow",
                );
                None
            }
            ast::TypeSpecKind::ApInt(width_expr) => {
                let width = self.const_int_expr(width_expr, "integer width")?;
                if !(2..=128).contains(&width) {
                    self.error(
                        codes::E0200,
                        spec.span,
                        format!("int<{width}> is out of range (2..=128)"),
                    );
                    return None;
                }
                Some(self.types.ap_int(true, width as u32))
            }
            ast::TypeSpecKind::Named(name) => match self.struct_types.get(name) {
                Some(&ty) => Some(ty),
                None => {
                    self.error(codes::E0100, spec.span, format!("unknown type '{name}'"));
                    None
                }
            },
            ast::TypeSpecKind::Array { elem, len } => {
                let elem_ty = self.resolve_type(elem)?;
                let len = self.array_len(len)?;
                Some(self.types.array(elem_ty, len))
            }
        }
    }

    /// Array lengths must be positive compile-time constants — they shape
    /// the hardware, so parameter-dependent sizes are rejected here.
    fn array_len(&mut self, expr: &ast::Expr) -> Option<u32> {
        let texpr = self.analyze_expr(expr)?;
        match fold_const(&texpr, &ParamEnv::new()).and_then(ConstValue::as_int) {
            Some(len) if len > 0 && len <= u32::MAX as i64 => Some(len as u32),
            Some(len) => {
                self.error(
                    codes::E0204,
                    expr.span,
                    format!("array size must be positive, got {len}"),
                );
                None
            }
            None => {
                self.error(codes::E0204, expr.span, "array size is not constant");
                None
            }
        }
    }

    fn const_int_expr(&mut self, expr: &ast::Expr, what: &str) -> Option<i64> {
        let texpr = self.analyze_expr(expr)?;
        match fold_const(&texpr, &ParamEnv::new()).and_then(ConstValue::as_int) {
            Some(v) => Some(v),
            None => {
                self.error(codes::E0204, expr.span, format!("{what} is not constant"));
                None
            }
        }
    }

    // ── Structs ──

    fn analyze_struct(&mut self, s: &ast::StructDecl) {
        if self.struct_types.contains_key(&s.name.name) {
            self.error(
                codes::E0101,
                s.name.span,
                format!("structure '{}' already defined", s.name.name),
            );
            return;
        }
        let mut fields: Vec<(String, TypeId)> = Vec::new();
        for field in &s.fields {
            if fields.iter().any(|(name, _)| name == &field.name.name) {
                self.error(
                    codes::E0101,
                    field.name.span,
                    format!("duplicate field name '{}'", field.name.name),
                );
                continue;
            }
            if let Some(ty) = self.resolve_type(&field.ty) {
                fields.push((field.name.name.clone(), ty));
            }
        }
        let ty = self.types.intern(TypeKind::Struct {
            name: s.name.name.clone(),
            fields,
        });
        self.struct_types.insert(s.name.name.clone(), ty);
    }

    // ── Registration passes ──

    fn register_function(&mut self, f: &ast::FunctionDecl) {
        let ret = self
            .resolve_type(&f.return_type)
            .unwrap_or_else(|| self.types.void());
        let mut params = Vec::new();
        for p in &f.params {
            let ty = self.resolve_type(&p.ty).unwrap_or_else(|| self.types.int());
            params.push(ty);
        }

        let duplicate = self
            .func_sigs
            .iter()
            .any(|sig| sig.name == f.name.name && sig.params == params);
        if duplicate {
            self.error(
                codes::E0101,
                f.name.span,
                format!(
                    "function '{}' with this signature is already defined",
                    f.name.name
                ),
            );
            return;
        }

        let index = self.functions.len();
        let decl = self.alloc_decl(
            &f.name.name,
            f.name.span,
            ret,
            true,
            DeclKind::Function(index),
        );
        // Body is analysed later; reserve the slot so call resolution can
        // see every user function up front.
        self.functions.push(Function {
            decl,
            name: f.name.name.clone(),
            params: Vec::new(),
            ret,
            body: Vec::new(),
        });
        self.func_sigs.push(FuncSig {
            name: f.name.name.clone(),
            params,
            ret,
            kind: FuncKind::User(index),
        });
    }

    fn register_stream(&mut self, s: &ast::StreamDecl) {
        let (input_spec, output_spec, params, name) = match s {
            ast::StreamDecl::Filter(f) => (&f.input_type, &f.output_type, &f.params, &f.name),
            ast::StreamDecl::Pipeline(p) => (&p.input_type, &p.output_type, &p.params, &p.name),
            ast::StreamDecl::SplitJoin(sj) => {
                (&sj.input_type, &sj.output_type, &sj.params, &sj.name)
            }
        };
        let input = self
            .resolve_type(input_spec)
            .unwrap_or_else(|| self.types.void());
        let output = self
            .resolve_type(output_spec)
            .unwrap_or_else(|| self.types.void());

        // Parameters bind to compile-time scalars at elaboration.
        for p in params {
            if let Some(ty) = self.resolve_type(&p.ty) {
                if !self.types.is_scalar(ty) {
                    self.error(
                        codes::E0200,
                        p.span,
                        "stream parameters must have scalar types",
                    );
                }
            }
        }

        let void = self.types.void();
        let kind = match s {
            ast::StreamDecl::Filter(_) => {
                let idx = self.filters.len();
                self.filters.push(Filter {
                    decl: DeclId(0), // patched below
                    name: name.name.clone(),
                    input,
                    output,
                    stateful: false,
                    params: Vec::new(),
                    state: Vec::new(),
                    init: None,
                    prework: None,
                    work: TWorkBlock {
                        peek_rate: None,
                        pop_rate: None,
                        push_rate: None,
                        body: Vec::new(),
                        span: s.span(),
                    },
                    span: s.span(),
                });
                self.filter_arity.push(params.len());
                DeclKind::Filter(idx)
            }
            ast::StreamDecl::Pipeline(_) => {
                let idx = self.composites.len();
                self.composites.push(CompositeDef {
                    decl: DeclId(0),
                    name: name.name.clone(),
                    input,
                    output,
                    params: Vec::new(),
                    kind: CompositeKind::Pipeline { adds: Vec::new() },
                    span: s.span(),
                });
                self.composite_arity.push(params.len());
                DeclKind::Pipeline(idx)
            }
            ast::StreamDecl::SplitJoin(_) => {
                let idx = self.composites.len();
                self.composites.push(CompositeDef {
                    decl: DeclId(0),
                    name: name.name.clone(),
                    input,
                    output,
                    params: Vec::new(),
                    kind: CompositeKind::SplitJoin {
                        split: SplitPolicy::Duplicate,
                        adds: Vec::new(),
                        join: JoinPolicy {
                            weights: Vec::new(),
                        },
                    },
                    span: s.span(),
                });
                self.composite_arity.push(params.len());
                DeclKind::SplitJoin(idx)
            }
        };

        let decl = self.declare(&name.name, name.span, void, true, kind);
        match kind {
            DeclKind::Filter(idx) => self.filters[idx].decl = decl,
            DeclKind::Pipeline(idx) | DeclKind::SplitJoin(idx) => {
                self.composites[idx].decl = decl
            }
            _ => unreachable!(),
        }

        // First void → void pipeline is the program entry.
        if self.top.is_none()
            && matches!(kind, DeclKind::Pipeline(_))
            && input == void
            && output == void
        {
            self.top = Some(decl);
        }
    }

    // ── Functions ──

    fn analyze_function_body(&mut self, index: usize, f: &ast::FunctionDecl) {
        let sig = self
            .func_sigs
            .iter()
            .find(|sig| matches!(sig.kind, FuncKind::User(i) if i == index))
            .cloned();
        let Some(sig) = sig else { return };

        self.push_scope();
        let mut params = Vec::new();
        for (p, &ty) in f.params.iter().zip(&sig.params) {
            let decl = self.declare(&p.name.name, p.name.span, ty, true, DeclKind::Parameter);
            params.push(decl);
        }
        self.return_type = Some(sig.ret);
        let body = self.analyze_block(&f.body);
        self.return_type = None;
        self.pop_scope();

        self.functions[index].params = params;
        self.functions[index].body = body;
    }

    // ── Filters ──

    fn analyze_filter(&mut self, f: &ast::FilterDecl) {
        let stream_decl = self.lookup_stream(&f.name);
        let DeclKind::Filter(idx) = self.decls[stream_decl.0 as usize].kind else {
            return;
        };
        let input = self.filters[idx].input;
        let output = self.filters[idx].output;

        self.push_scope();
        let mut params = Vec::new();
        for p in &f.params {
            let ty = self.resolve_type(&p.ty).unwrap_or_else(|| self.types.int());
            let decl = self.declare(&p.name.name, p.name.span, ty, true, DeclKind::Parameter);
            params.push(decl);
        }

        // Filter-scope state variables.
        let mut state = Vec::new();
        for var in &f.vars {
            if let Some((decl, init)) = self.analyze_var_decl(var, DeclKind::StateVariable) {
                state.push(StateVar { decl, init });
            }
        }

        self.filter_ctx = Some(FilterCtx {
            input,
            output,
            peek_bound: None,
            in_init: false,
            wrote_state: false,
        });

        let init = f.init.as_ref().map(|block| {
            self.filter_ctx.as_mut().unwrap().in_init = true;
            let b = self.analyze_work_block(block, true);
            self.filter_ctx.as_mut().unwrap().in_init = false;
            b
        });
        let prework = f
            .prework
            .as_ref()
            .map(|block| self.analyze_work_block(block, false));
        let work = self.analyze_work_block(&f.work, false);

        self.validate_work_rates(f, &work);
        let wrote_state = self.filter_ctx.take().unwrap().wrote_state;
        self.pop_scope();

        let filter = &mut self.filters[idx];
        filter.stateful = f.stateful || wrote_state;
        filter.params = params;
        filter.state = state;
        filter.init = init;
        filter.prework = prework;
        filter.work = work;
    }

    fn lookup_stream(&mut self, name: &ast::Ident) -> DeclId {
        // Stream names live in the global scope and were pre-registered.
        self.scopes[0][&name.name]
    }

    fn analyze_work_block(&mut self, block: &ast::WorkBlock, is_init: bool) -> TWorkBlock {
        let peek_rate = block.peek_rate.as_ref().and_then(|e| self.analyze_expr(e));
        let pop_rate = block.pop_rate.as_ref().and_then(|e| self.analyze_expr(e));
        let push_rate = block.push_rate.as_ref().and_then(|e| self.analyze_expr(e));

        if is_init && (block.peek_rate.is_some() || block.pop_rate.is_some() || block.push_rate.is_some())
        {
            self.error(
                codes::E0300,
                block.span,
                "init blocks have no rates: they run before any data flows",
            );
        }

        // Effective peek window of this block, for peek-offset checks.
        // Parameter-dependent rates are re-validated per instance by the
        // graph builder.
        let empty = ParamEnv::new();
        let folded_peek = peek_rate
            .as_ref()
            .and_then(|r| fold_const(r, &empty))
            .and_then(ConstValue::as_int);
        let folded_pop = pop_rate
            .as_ref()
            .and_then(|r| fold_const(r, &empty))
            .and_then(ConstValue::as_int);
        let bound = match (folded_peek, folded_pop) {
            (Some(peek), Some(pop)) => Some(peek.max(pop)),
            (Some(peek), None) => Some(peek),
            (None, pop) if block.peek_rate.is_none() => pop,
            _ => None,
        };
        if let Some(ctx) = self.filter_ctx.as_mut() {
            ctx.peek_bound = bound;
        }

        self.push_scope();
        let body = self.analyze_block(&block.statements);
        self.pop_scope();

        if is_init {
            let counts = count_stream_ops(&body);
            if !(counts.pops == OpBound::Exact(0) && counts.pushes == OpBound::Exact(0))
                || body_contains_peek(&body)
            {
                self.error(
                    codes::E0300,
                    block.span,
                    "init blocks run before any data flows and cannot peek, pop, or push",
                );
            }
        }

        TWorkBlock {
            peek_rate,
            pop_rate,
            push_rate,
            body,
            span: block.span,
        }
    }

    /// Rate consistency for the steady-state work block: declared rates
    /// must be non-negative, peek ≥ pop, void channels must have zero
    /// rates, and the statically countable pop/push totals must agree
    /// with the declaration.
    fn validate_work_rates(&mut self, f: &ast::FilterDecl, work: &TWorkBlock) {
        let empty = ParamEnv::new();
        let fold = |rate: &Option<TExpr>| {
            rate.as_ref()
                .and_then(|r| fold_const(r, &empty))
                .and_then(ConstValue::as_int)
        };
        let peek = fold(&work.peek_rate);
        let pop = fold(&work.pop_rate);
        let push = fold(&work.push_rate);

        for (name, value) in [("peek", peek), ("pop", pop), ("push", push)] {
            if let Some(v) = value {
                if v < 0 {
                    self.error(
                        codes::E0300,
                        work.span,
                        format!("{name} rate must be non-negative, got {v}"),
                    );
                }
            }
        }
        if let (Some(peek), Some(pop)) = (peek, pop) {
            if peek < pop {
                self.error(
                    codes::E0300,
                    work.span,
                    format!("peek rate {peek} is less than pop rate {pop}"),
                );
            }
        }

        let input_void = self.types.is_void(self.filter_ctx.as_ref().unwrap().input);
        let output_void = self.types.is_void(self.filter_ctx.as_ref().unwrap().output);
        if input_void && (work.pop_rate.is_some() || work.peek_rate.is_some()) {
            self.error(
                codes::E0300,
                work.span,
                "a void-input filter cannot declare pop or peek rates",
            );
        }
        if !input_void && work.pop_rate.is_none() {
            self.error(
                codes::E0300,
                work.span,
                format!(
                    "filter '{}' consumes input but declares no pop rate",
                    f.name.name
                ),
            );
        }
        if output_void && work.push_rate.is_some() {
            self.error(
                codes::E0300,
                work.span,
                "a void-output filter cannot declare a push rate",
            );
        }
        if !output_void && work.push_rate.is_none() {
            self.error(
                codes::E0300,
                work.span,
                format!(
                    "filter '{}' produces output but declares no push rate",
                    f.name.name
                ),
            );
        }

        // Symbolic op counting against the declared rates.
        let counts = count_stream_ops(&work.body);
        match (counts.pushes, push) {
            (OpBound::Exact(n), Some(declared)) if n as i64 != declared => {
                self.error(
                    codes::E0300,
                    work.span,
                    format!("work block pushes {n} value(s) but declares push {declared}"),
                );
            }
            (OpBound::Unknown, _) => {
                self.warn(
                    codes::W0300,
                    work.span,
                    "push count cannot be bounded statically",
                );
            }
            _ => {}
        }
        match (counts.pops, pop) {
            (OpBound::Exact(n), Some(declared)) if n as i64 > declared => {
                self.error(
                    codes::E0300,
                    work.span,
                    format!("work block pops {n} value(s) but declares pop {declared}"),
                );
            }
            (OpBound::Unknown, _) => {
                self.warn(
                    codes::W0300,
                    work.span,
                    "pop count cannot be bounded statically",
                );
            }
            _ => {}
        }
    }

    // ── Composites ──

    fn analyze_pipeline(&mut self, p: &ast::PipelineDecl) {
        let decl = self.lookup_stream(&p.name);
        let DeclKind::Pipeline(idx) = self.decls[decl.0 as usize].kind else {
            return;
        };

        self.push_scope();
        let params = self.declare_params(&p.params);
        let mut adds = Vec::new();
        for stmt in &p.statements {
            match &stmt.kind {
                ast::StmtKind::Add { name, args } => {
                    if let Some(add) = self.analyze_add(name, args, stmt.span) {
                        adds.push(add);
                    }
                }
                _ => {
                    self.error(
                        codes::E0001,
                        stmt.span,
                        "only add statements are allowed in a pipeline body",
                    );
                }
            }
        }
        if adds.is_empty() {
            self.error(codes::E0001, p.span, "pipeline has no children");
        }
        self.pop_scope();

        self.composites[idx].params = params;
        self.composites[idx].kind = CompositeKind::Pipeline { adds };
    }

    fn analyze_splitjoin(&mut self, sj: &ast::SplitJoinDecl) {
        let decl = self.lookup_stream(&sj.name);
        let DeclKind::SplitJoin(idx) = self.decls[decl.0 as usize].kind else {
            return;
        };

        self.push_scope();
        let params = self.declare_params(&sj.params);
        let mut split = None;
        let mut join = None;
        let mut adds = Vec::new();
        for stmt in &sj.statements {
            match &stmt.kind {
                ast::StmtKind::Split(spec) => {
                    if split.is_some() {
                        self.error(codes::E0001, stmt.span, "duplicate split statement");
                        continue;
                    }
                    split = Some(match spec {
                        ast::SplitSpec::Duplicate => SplitPolicy::Duplicate,
                        ast::SplitSpec::RoundRobin(weights) => {
                            SplitPolicy::RoundRobin(self.analyze_weights(weights))
                        }
                    });
                }
                ast::StmtKind::Join(spec) => {
                    if join.is_some() {
                        self.error(codes::E0001, stmt.span, "duplicate join statement");
                        continue;
                    }
                    join = Some(JoinPolicy {
                        weights: self.analyze_weights(&spec.weights),
                    });
                }
                ast::StmtKind::Add { name, args } => {
                    if let Some(add) = self.analyze_add(name, args, stmt.span) {
                        adds.push(add);
                    }
                }
                _ => {
                    self.error(
                        codes::E0001,
                        stmt.span,
                        "only split/add/join statements are allowed in a splitjoin body",
                    );
                }
            }
        }
        let split = split.unwrap_or_else(|| {
            self.error(codes::E0001, sj.span, "splitjoin has no split statement");
            SplitPolicy::Duplicate
        });
        let join = join.unwrap_or_else(|| {
            self.error(codes::E0001, sj.span, "splitjoin has no join statement");
            JoinPolicy {
                weights: Vec::new(),
            }
        });
        if adds.is_empty() {
            self.error(codes::E0001, sj.span, "splitjoin has no children");
        }
        self.pop_scope();

        self.composites[idx].params = params;
        self.composites[idx].kind = CompositeKind::SplitJoin { split, adds, join };
    }

    fn declare_params(&mut self, params: &[ast::Param]) -> Vec<DeclId> {
        let mut decls = Vec::new();
        for p in params {
            let ty = self.resolve_type(&p.ty).unwrap_or_else(|| self.types.int());
            let decl = self.declare(&p.name.name, p.name.span, ty, true, DeclKind::Parameter);
            decls.push(decl);
        }
        decls
    }

    fn analyze_weights(&mut self, weights: &[ast::Expr]) -> Vec<TExpr> {
        weights
            .iter()
            .filter_map(|w| {
                let t = self.analyze_expr(w)?;
                if !self.types.is_integral(t.ty) {
                    self.error(codes::E0200, w.span, "round-robin weights must be integers");
                    return None;
                }
                Some(t)
            })
            .collect()
    }

    fn analyze_add(
        &mut self,
        name: &ast::Ident,
        args: &[ast::Expr],
        span: Span,
    ) -> Option<AddStmt> {
        let Some(target) = self.lookup(&name.name) else {
            self.error(
                codes::E0100,
                name.span,
                format!("referencing undefined stream '{}'", name.name),
            );
            return None;
        };
        let target_kind = self.decls[target.0 as usize].kind;
        let param_count = match target_kind {
            DeclKind::Filter(idx) => self.filter_arity[idx],
            DeclKind::Pipeline(idx) | DeclKind::SplitJoin(idx) => self.composite_arity[idx],
            _ => {
                self.error(
                    codes::E0200,
                    name.span,
                    format!("'{}' is not a stream", name.name),
                );
                return None;
            }
        };
        if args.len() != param_count {
            self.error(
                codes::E0202,
                span,
                format!(
                    "'{}' expects {} argument(s), got {}",
                    name.name,
                    param_count,
                    args.len()
                ),
            );
            return None;
        }
        let mut targs = Vec::new();
        for arg in args {
            let t = self.analyze_expr(arg)?;
            if !self.types.is_scalar(t.ty) {
                self.error(codes::E0200, arg.span, "stream arguments must be scalars");
                return None;
            }
            targs.push(t);
        }
        Some(AddStmt {
            target,
            args: targs,
            span,
        })
    }

    // ── Statements ──

    fn analyze_block(&mut self, stmts: &[ast::Stmt]) -> Vec<TStmt> {
        let mut out = Vec::new();
        for stmt in stmts {
            if let Some(t) = self.analyze_stmt(stmt) {
                out.push(t);
            }
        }
        out
    }

    fn analyze_stmt(&mut self, stmt: &ast::Stmt) -> Option<TStmt> {
        let kind = match &stmt.kind {
            ast::StmtKind::Expr(e) => TStmtKind::Expr(self.analyze_expr(e)?),
            ast::StmtKind::VarDecl(var) => {
                let (decl, init) = self.analyze_var_decl(var, DeclKind::Variable)?;
                TStmtKind::VarDecl { decl, init }
            }
            ast::StmtKind::Push(value) => {
                let ctx_output = self.filter_ctx.as_ref().map(|c| c.output);
                let Some(output) = ctx_output else {
                    self.error(codes::E0001, stmt.span, "push outside a filter work block");
                    return None;
                };
                if self.types.is_void(output) {
                    self.error(
                        codes::E0200,
                        stmt.span,
                        "cannot push from a filter with void output",
                    );
                    return None;
                }
                let value = self.analyze_expr(value)?;
                let value = self.convert(value, output, stmt.span)?;
                TStmtKind::Push(value)
            }
            ast::StmtKind::Add { .. } | ast::StmtKind::Split(_) | ast::StmtKind::Join(_) => {
                self.error(
                    codes::E0001,
                    stmt.span,
                    "stream composition statements are not allowed here",
                );
                return None;
            }
            ast::StmtKind::If {
                condition,
                then_block,
                else_block,
            } => {
                let condition = self.analyze_expr(condition)?;
                if !self.types.is_bool(condition.ty) {
                    self.error(
                        codes::E0200,
                        condition.span,
                        "if condition must be a boolean expression",
                    );
                    return None;
                }
                self.push_scope();
                let then_block = self.analyze_block(then_block);
                self.pop_scope();
                let else_block = else_block.as_ref().map(|stmts| {
                    self.push_scope();
                    let b = self.analyze_block(stmts);
                    self.pop_scope();
                    b
                });
                TStmtKind::If {
                    condition,
                    then_block,
                    else_block,
                }
            }
            ast::StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                self.push_scope();
                let init = init
                    .as_ref()
                    .and_then(|s| self.analyze_stmt(s))
                    .map(Box::new);
                let condition = condition.as_ref().and_then(|c| {
                    let t = self.analyze_expr(c)?;
                    if !self.types.is_bool(t.ty) {
                        self.error(codes::E0200, c.span, "loop condition must be boolean");
                        return None;
                    }
                    Some(t)
                });
                let step = step.as_ref().and_then(|s| self.analyze_expr(s));
                self.push_scope();
                let body = self.analyze_block(body);
                self.pop_scope();
                self.pop_scope();
                TStmtKind::For {
                    init,
                    condition,
                    step,
                    body,
                }
            }
            ast::StmtKind::Break => TStmtKind::Break,
            ast::StmtKind::Continue => TStmtKind::Continue,
            ast::StmtKind::Return(value) => {
                let Some(expected) = self.return_type else {
                    self.error(codes::E0001, stmt.span, "return outside a function");
                    return None;
                };
                let value = match value {
                    Some(e) => {
                        let t = self.analyze_expr(e)?;
                        Some(self.convert(t, expected, stmt.span)?)
                    }
                    None => {
                        if !self.types.is_void(expected) {
                            self.error(
                                codes::E0200,
                                stmt.span,
                                "non-void function must return a value",
                            );
                            return None;
                        }
                        None
                    }
                };
                TStmtKind::Return(value)
            }
        };
        Some(TStmt {
            kind,
            span: stmt.span,
        })
    }

    fn analyze_var_decl(
        &mut self,
        var: &ast::VarDecl,
        kind: DeclKind,
    ) -> Option<(DeclId, Option<TExpr>)> {
        let ty = self.resolve_type(&var.ty)?;
        if self.types.is_void(ty) {
            self.error(codes::E0200, var.span, "variables cannot have void type");
            return None;
        }
        let init = match &var.initializer {
            Some(init) => Some(self.analyze_initializer(init, ty)?),
            None => None,
        };
        let decl = self.declare(&var.name.name, var.name.span, ty, false, kind);
        Some((decl, init))
    }

    fn analyze_initializer(&mut self, init: &ast::Expr, target: TypeId) -> Option<TExpr> {
        if let ast::ExprKind::InitList(elems) = &init.kind {
            let Some((elem_ty, len)) = self.types.array_elem(target) else {
                self.error(
                    codes::E0200,
                    init.span,
                    "initializer lists apply only to arrays",
                );
                return None;
            };
            if elems.len() as u32 != len {
                self.error(
                    codes::E0200,
                    init.span,
                    format!(
                        "initializer has {} element(s), array expects {len}",
                        elems.len()
                    ),
                );
                return None;
            }
            let mut telems = Vec::new();
            for e in elems {
                let t = self.analyze_expr(e)?;
                telems.push(self.convert(t, elem_ty, e.span)?);
            }
            return Some(TExpr {
                ty: target,
                span: init.span,
                kind: TExprKind::InitList(telems),
            });
        }
        let t = self.analyze_expr(init)?;
        self.convert(t, target, init.span)
    }

    // ── Expressions ──

    /// Insert a cast when the types differ; fail with `TypeMismatch` when
    /// the conversion is not in the lattice.
    fn convert(&mut self, expr: TExpr, target: TypeId, span: Span) -> Option<TExpr> {
        if expr.ty == target {
            return Some(expr);
        }
        if !self.types.convertible(expr.ty, target) {
            self.error(
                codes::E0200,
                span,
                format!(
                    "cannot implicitly convert from '{}' to '{}'",
                    self.types.name(expr.ty),
                    self.types.name(target)
                ),
            );
            return None;
        }
        Some(TExpr {
            ty: target,
            span,
            kind: TExprKind::Cast(Box::new(expr)),
        })
    }

    fn analyze_expr(&mut self, expr: &ast::Expr) -> Option<TExpr> {
        let span = expr.span;
        let (ty, kind) = match &expr.kind {
            ast::ExprKind::IntLit(v) => (self.types.int(), TExprKind::IntLit(*v)),
            ast::ExprKind::BoolLit(b) => (self.types.bool_(), TExprKind::BoolLit(*b)),
            ast::ExprKind::FloatLit(v) => (self.types.float(), TExprKind::FloatLit(*v)),
            ast::ExprKind::Ident(name) => {
                let Some(decl) = self.lookup(name) else {
                    self.error(codes::E0100, span, format!("unknown identifier '{name}'"));
                    return None;
                };
                let d = &self.decls[decl.0 as usize];
                if !matches!(
                    d.kind,
                    DeclKind::Variable | DeclKind::StateVariable | DeclKind::Parameter
                ) {
                    self.error(codes::E0200, span, format!("'{name}' is not a value"));
                    return None;
                }
                (d.ty, TExprKind::Var(decl))
            }
            ast::ExprKind::Index { base, index } => {
                let base = self.analyze_expr(base)?;
                let Some((elem_ty, _)) = self.types.array_elem(base.ty) else {
                    self.error(
                        codes::E0200,
                        span,
                        format!("cannot index non-array type '{}'", self.types.name(base.ty)),
                    );
                    return None;
                };
                let index = self.analyze_expr(index)?;
                if !self.types.is_integral(index.ty) {
                    self.error(codes::E0200, index.span, "array index must be an integer");
                    return None;
                }
                let int = self.types.int();
                let index = self.convert(index, int, span)?;
                (
                    elem_ty,
                    TExprKind::Index {
                        base: Box::new(base),
                        index: Box::new(index),
                    },
                )
            }
            ast::ExprKind::Unary { op, operand } => return self.analyze_unary(*op, operand, span),
            ast::ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.analyze_expr(lhs)?;
                let rhs = self.analyze_expr(rhs)?;
                let Some(common) = self.types.common_type(lhs.ty, rhs.ty) else {
                    self.error(
                        codes::E0200,
                        span,
                        format!(
                            "no common type for '{}' and '{}'",
                            self.types.name(lhs.ty),
                            self.types.name(rhs.ty)
                        ),
                    );
                    return None;
                };
                if !self.types.is_numeric(common) {
                    self.error(codes::E0200, span, "arithmetic requires numeric operands");
                    return None;
                }
                let integer_only = matches!(
                    op,
                    BinaryOp::Rem
                        | BinaryOp::BitAnd
                        | BinaryOp::BitOr
                        | BinaryOp::BitXor
                        | BinaryOp::Shl
                        | BinaryOp::Shr
                );
                if integer_only && !self.types.is_integral(common) {
                    self.error(
                        codes::E0200,
                        span,
                        format!("operator '{op}' requires integer operands"),
                    );
                    return None;
                }
                let lhs = self.convert(lhs, common, span)?;
                let rhs = self.convert(rhs, common, span)?;
                (
                    common,
                    TExprKind::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            }
            ast::ExprKind::Relational { op, lhs, rhs } => {
                let lhs = self.analyze_expr(lhs)?;
                let rhs = self.analyze_expr(rhs)?;
                let Some(common) = self.types.common_type(lhs.ty, rhs.ty) else {
                    self.error(
                        codes::E0200,
                        span,
                        format!(
                            "cannot compare '{}' with '{}'",
                            self.types.name(lhs.ty),
                            self.types.name(rhs.ty)
                        ),
                    );
                    return None;
                };
                let ordered = matches!(
                    op,
                    RelOp::Less | RelOp::LessEqual | RelOp::Greater | RelOp::GreaterEqual
                );
                if ordered && !self.types.is_numeric(common) {
                    self.error(
                        codes::E0200,
                        span,
                        "relational operators apply only to numeric types",
                    );
                    return None;
                }
                let lhs = self.convert(lhs, common, span)?;
                let rhs = self.convert(rhs, common, span)?;
                (
                    self.types.bool_(),
                    TExprKind::Relational {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            }
            ast::ExprKind::Logical { op, lhs, rhs } => {
                let lhs = self.analyze_expr(lhs)?;
                let rhs = self.analyze_expr(rhs)?;
                if !self.types.is_bool(lhs.ty) || !self.types.is_bool(rhs.ty) {
                    self.error(
                        codes::E0200,
                        span,
                        "logical operators require boolean operands",
                    );
                    return None;
                }
                (
                    self.types.bool_(),
                    TExprKind::Logical {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            }
            ast::ExprKind::Comma { lhs, rhs } => {
                let lhs = self.analyze_expr(lhs)?;
                let rhs = self.analyze_expr(rhs)?;
                (
                    rhs.ty,
                    TExprKind::Comma {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                )
            }
            ast::ExprKind::Assign { op, lhs, rhs } => {
                let target = self.analyze_expr(lhs)?;
                self.check_lvalue(&target)?;
                let value = self.analyze_expr(rhs)?;
                if let Some(op) = op {
                    // Compound assignment computes in the target's type.
                    if !self.types.is_numeric(target.ty) {
                        self.error(
                            codes::E0200,
                            span,
                            "compound assignment requires a numeric target",
                        );
                        return None;
                    }
                    let integer_only = matches!(
                        op,
                        BinaryOp::Rem
                            | BinaryOp::BitAnd
                            | BinaryOp::BitOr
                            | BinaryOp::BitXor
                            | BinaryOp::Shl
                            | BinaryOp::Shr
                    );
                    if integer_only && !self.types.is_integral(target.ty) {
                        self.error(
                            codes::E0200,
                            span,
                            format!("operator '{op}=' requires an integer target"),
                        );
                        return None;
                    }
                }
                let value = self.convert(value, target.ty, span)?;
                (
                    target.ty,
                    TExprKind::Assign {
                        op: *op,
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                )
            }
            ast::ExprKind::Peek(index) => {
                let Some(input) = self.filter_ctx.as_ref().map(|c| c.input) else {
                    self.error(codes::E0001, span, "peek outside a filter work block");
                    return None;
                };
                if self.types.is_void(input) {
                    self.error(codes::E0200, span, "cannot peek on a filter with void input");
                    return None;
                }
                let index = self.analyze_expr(index)?;
                if !self.types.is_integral(index.ty) {
                    self.error(codes::E0200, index.span, "peek index must be an integer");
                    return None;
                }
                // Peek offsets must be compile-time constants within the
                // declared window.
                match fold_const(&index, &ParamEnv::new()).and_then(ConstValue::as_int) {
                    Some(offset) => {
                        if offset < 0 {
                            self.error(
                                codes::E0300,
                                span,
                                format!("peek offset {offset} is negative"),
                            );
                            return None;
                        }
                        if let Some(bound) = self.filter_ctx.as_ref().unwrap().peek_bound {
                            if offset >= bound {
                                self.error(
                                    codes::E0300,
                                    span,
                                    format!(
                                        "peek offset {offset} exceeds the declared peek window ({bound})"
                                    ),
                                );
                                return None;
                            }
                        }
                    }
                    None => {
                        self.error(codes::E0204, span, "peek offset is not constant");
                        return None;
                    }
                }
                let int = self.types.int();
                let index = self.convert(index, int, span)?;
                (input, TExprKind::Peek(Box::new(index)))
            }
            ast::ExprKind::Pop => {
                let Some(input) = self.filter_ctx.as_ref().map(|c| c.input) else {
                    self.error(codes::E0001, span, "pop outside a filter work block");
                    return None;
                };
                if self.types.is_void(input) {
                    self.error(codes::E0200, span, "cannot pop on a filter with void input");
                    return None;
                }
                (input, TExprKind::Pop)
            }
            ast::ExprKind::Call { name, args } => return self.analyze_call(name, args, span),
            ast::ExprKind::Cast { ty, expr: inner } => {
                let target = self.resolve_type(ty)?;
                let inner = self.analyze_expr(inner)?;
                if !self.types.is_scalar(target) || !self.types.is_scalar(inner.ty) {
                    self.error(
                        codes::E0200,
                        span,
                        "explicit casts apply only to scalar types",
                    );
                    return None;
                }
                (target, TExprKind::Cast(Box::new(inner)))
            }
            ast::ExprKind::InitList(_) => {
                self.error(
                    codes::E0200,
                    span,
                    "initializer lists are only valid in declarations",
                );
                return None;
            }
        };
        Some(TExpr { ty, span, kind })
    }

    fn analyze_unary(&mut self, op: UnaryOp, operand: &ast::Expr, span: Span) -> Option<TExpr> {
        let operand = self.analyze_expr(operand)?;
        let ty = match op {
            UnaryOp::PreIncrement
            | UnaryOp::PreDecrement
            | UnaryOp::PostIncrement
            | UnaryOp::PostDecrement => {
                self.check_lvalue(&operand)?;
                if !self.types.is_numeric(operand.ty) {
                    self.error(
                        codes::E0200,
                        span,
                        "increment/decrement requires a numeric operand",
                    );
                    return None;
                }
                operand.ty
            }
            UnaryOp::Positive | UnaryOp::Negative => {
                if !self.types.is_numeric(operand.ty) {
                    self.error(codes::E0200, span, "unary sign requires a numeric operand");
                    return None;
                }
                match self.types.kind(operand.ty) {
                    // Negating a 1-bit quantity promotes to int.
                    TypeKind::Bool | TypeKind::Bit => self.types.int(),
                    _ => operand.ty,
                }
            }
            UnaryOp::LogicalNot => {
                if !self.types.is_bool(operand.ty) {
                    self.error(codes::E0200, span, "'!' requires a boolean operand");
                    return None;
                }
                operand.ty
            }
            UnaryOp::BitwiseNot => {
                if !self.types.is_integral(operand.ty) {
                    self.error(codes::E0200, span, "'~' requires an integer operand");
                    return None;
                }
                operand.ty
            }
        };
        Some(TExpr {
            ty,
            span,
            kind: TExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    /// An lvalue is an identifier bound to a mutable declaration, or an
    /// index into an lvalue. A write to filter state outside init marks
    /// the filter stateful.
    fn check_lvalue(&mut self, expr: &TExpr) -> Option<()> {
        match &expr.kind {
            TExprKind::Var(decl) => {
                let d = &self.decls[decl.0 as usize];
                if d.constant || d.kind == DeclKind::Parameter {
                    let name = d.name.clone();
                    self.error(
                        codes::E0201,
                        expr.span,
                        format!("cannot assign to constant '{name}'"),
                    );
                    return None;
                }
                if d.kind == DeclKind::StateVariable {
                    if let Some(ctx) = self.filter_ctx.as_mut() {
                        if !ctx.in_init {
                            ctx.wrote_state = true;
                        }
                    }
                }
                Some(())
            }
            TExprKind::Index { base, .. } => self.check_lvalue(base),
            _ => {
                self.error(codes::E0201, expr.span, "expression is not assignable");
                None
            }
        }
    }

    /// Overload resolution: arity filters the candidate set, then each
    /// candidate is scored by exact argument-type matches; remaining
    /// arguments must at least convert. A strict best wins.
    fn analyze_call(&mut self, name: &ast::Ident, args: &[ast::Expr], span: Span) -> Option<TExpr> {
        let mut targs = Vec::new();
        for arg in args {
            targs.push(self.analyze_expr(arg)?);
        }

        let named: Vec<usize> = self
            .func_sigs
            .iter()
            .enumerate()
            .filter(|(_, sig)| sig.name == name.name)
            .map(|(i, _)| i)
            .collect();
        if named.is_empty() {
            self.error(
                codes::E0100,
                name.span,
                format!("unknown function '{}'", name.name),
            );
            return None;
        }

        let arity_matched: Vec<usize> = named
            .iter()
            .copied()
            .filter(|&i| self.func_sigs[i].params.len() == targs.len())
            .collect();
        if arity_matched.is_empty() {
            self.error(
                codes::E0202,
                span,
                format!(
                    "no overload of '{}' takes {} argument(s)",
                    name.name,
                    targs.len()
                ),
            );
            return None;
        }

        let mut best_score = -1i32;
        let mut best: Vec<usize> = Vec::new();
        for &i in &arity_matched {
            let sig = &self.func_sigs[i];
            let mut score = 0i32;
            let mut viable = true;
            for (arg, &param) in targs.iter().zip(&sig.params) {
                if arg.ty == param {
                    score += 1;
                } else if !self.types.convertible(arg.ty, param) {
                    viable = false;
                    break;
                }
            }
            if !viable {
                continue;
            }
            match score.cmp(&best_score) {
                std::cmp::Ordering::Greater => {
                    best_score = score;
                    best = vec![i];
                }
                std::cmp::Ordering::Equal => best.push(i),
                std::cmp::Ordering::Less => {}
            }
        }

        let sig_index = match best.len() {
            0 => {
                let types: Vec<String> = targs.iter().map(|a| self.types.name(a.ty)).collect();
                self.error(
                    codes::E0200,
                    span,
                    format!(
                        "no overload of '{}' accepts ({})",
                        name.name,
                        types.join(", ")
                    ),
                );
                return None;
            }
            1 => best[0],
            _ => {
                self.error(
                    codes::E0203,
                    span,
                    format!("call to '{}' is ambiguous", name.name),
                );
                return None;
            }
        };

        let sig = self.func_sigs[sig_index].clone();
        let mut converted = Vec::new();
        for (arg, &param) in targs.into_iter().zip(&sig.params) {
            let span = arg.span;
            converted.push(self.convert(arg, param, span)?);
        }
        Some(TExpr {
            ty: sig.ret,
            span,
            kind: TExprKind::Call {
                sig: sig_index,
                args: converted,
            },
        })
    }

    // ── Unused streams ──

    fn check_unused_streams(&mut self) {
        let mut used: Vec<bool> = vec![false; self.decls.len()];
        if let Some(top) = self.top {
            used[top.0 as usize] = true;
        }
        for composite in &self.composites {
            let adds = match &composite.kind {
                CompositeKind::Pipeline { adds } => adds,
                CompositeKind::SplitJoin { adds, .. } => adds,
            };
            for add in adds {
                used[add.target.0 as usize] = true;
            }
        }
        let mut warnings = Vec::new();
        for (idx, decl) in self.decls.iter().enumerate() {
            let is_stream = matches!(
                decl.kind,
                DeclKind::Filter(_) | DeclKind::Pipeline(_) | DeclKind::SplitJoin(_)
            );
            if is_stream && !used[idx] {
                warnings.push((decl.span, decl.name.clone()));
            }
        }
        for (span, name) in warnings {
            self.warn(
                codes::W0100,
                span,
                format!("stream '{name}' is never added to the graph"),
            );
        }
    }
}

// ── Symbolic pop/push counting ──────────────────────────────────────────────

/// A statically-derived operation count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpBound {
    Exact(u64),
    Unknown,
}

impl OpBound {
    fn add(self, other: OpBound) -> OpBound {
        match (self, other) {
            (OpBound::Exact(a), OpBound::Exact(b)) => OpBound::Exact(a + b),
            _ => OpBound::Unknown,
        }
    }

    fn scale(self, factor: Option<u64>) -> OpBound {
        match (self, factor) {
            (OpBound::Exact(0), _) => OpBound::Exact(0),
            (OpBound::Exact(n), Some(f)) => OpBound::Exact(n * f),
            _ => OpBound::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpCounts {
    pub pops: OpBound,
    pub pushes: OpBound,
}

const ZERO_COUNTS: OpCounts = OpCounts {
    pops: OpBound::Exact(0),
    pushes: OpBound::Exact(0),
};

impl OpCounts {
    fn merge(self, other: OpCounts) -> OpCounts {
        OpCounts {
            pops: self.pops.add(other.pops),
            pushes: self.pushes.add(other.pushes),
        }
    }

    fn is_zero(self) -> bool {
        self.pops == OpBound::Exact(0) && self.pushes == OpBound::Exact(0)
    }
}

/// Count pop/push executions in a statement list. `for` loops with a
/// recognizable constant trip count multiply their body counts; anything
/// else containing stream ops is `Unknown`. Diverging `if` branches are
/// `Unknown` too — the count must hold on every path.
pub fn count_stream_ops(stmts: &[TStmt]) -> OpCounts {
    stmts
        .iter()
        .fold(ZERO_COUNTS, |acc, stmt| acc.merge(count_stmt(stmt)))
}

fn count_stmt(stmt: &TStmt) -> OpCounts {
    match &stmt.kind {
        TStmtKind::Expr(e) => count_expr(e),
        TStmtKind::VarDecl { init, .. } => init.as_ref().map_or(ZERO_COUNTS, count_expr),
        TStmtKind::Push(value) => {
            let mut c = count_expr(value);
            c.pushes = c.pushes.add(OpBound::Exact(1));
            c
        }
        TStmtKind::If {
            condition,
            then_block,
            else_block,
        } => {
            let cond = count_expr(condition);
            let then_c = count_stream_ops(then_block);
            let else_c = else_block
                .as_ref()
                .map(|b| count_stream_ops(b))
                .unwrap_or(ZERO_COUNTS);
            let pops = if then_c.pops == else_c.pops {
                then_c.pops
            } else {
                OpBound::Unknown
            };
            let pushes = if then_c.pushes == else_c.pushes {
                then_c.pushes
            } else {
                OpBound::Unknown
            };
            cond.merge(OpCounts { pops, pushes })
        }
        TStmtKind::For {
            init,
            condition,
            step,
            body,
        } => {
            let body_c = count_stream_ops(body);
            let header_c = [
                init.as_ref().map(|s| count_stmt(s)),
                condition.as_ref().map(count_expr),
                step.as_ref().map(count_expr),
            ]
            .into_iter()
            .flatten()
            .fold(ZERO_COUNTS, OpCounts::merge);

            // break/continue make scaled counts unreliable.
            if !body_c.is_zero() && has_early_exit(body) {
                return header_c.merge(OpCounts {
                    pops: OpBound::Unknown,
                    pushes: OpBound::Unknown,
                });
            }
            let trip = trip_count(init.as_deref(), condition.as_ref(), step.as_ref());
            header_c.merge(OpCounts {
                pops: body_c.pops.scale(trip),
                pushes: body_c.pushes.scale(trip),
            })
        }
        TStmtKind::Break | TStmtKind::Continue => ZERO_COUNTS,
        TStmtKind::Return(value) => value.as_ref().map_or(ZERO_COUNTS, count_expr),
    }
}

fn count_expr(expr: &TExpr) -> OpCounts {
    match &expr.kind {
        TExprKind::Pop => OpCounts {
            pops: OpBound::Exact(1),
            pushes: OpBound::Exact(0),
        },
        TExprKind::IntLit(_)
        | TExprKind::BoolLit(_)
        | TExprKind::FloatLit(_)
        | TExprKind::Var(_) => ZERO_COUNTS,
        TExprKind::Peek(index) => count_expr(index),
        TExprKind::Index { base, index } => count_expr(base).merge(count_expr(index)),
        TExprKind::Unary { operand, .. } => count_expr(operand),
        TExprKind::Binary { lhs, rhs, .. }
        | TExprKind::Relational { lhs, rhs, .. }
        | TExprKind::Comma { lhs, rhs } => count_expr(lhs).merge(count_expr(rhs)),
        // The right operand runs conditionally; a pop there cannot be
        // counted exactly.
        TExprKind::Logical { lhs, rhs, .. } => {
            let l = count_expr(lhs);
            let r = count_expr(rhs);
            if r.is_zero() {
                l
            } else {
                OpCounts {
                    pops: OpBound::Unknown,
                    pushes: OpBound::Unknown,
                }
            }
        }
        TExprKind::Assign { target, value, .. } => count_expr(target).merge(count_expr(value)),
        TExprKind::Call { args, .. } => args
            .iter()
            .fold(ZERO_COUNTS, |acc, a| acc.merge(count_expr(a))),
        TExprKind::Cast(inner) => count_expr(inner),
        TExprKind::InitList(elems) => elems
            .iter()
            .fold(ZERO_COUNTS, |acc, e| acc.merge(count_expr(e))),
    }
}

/// Does the statement list touch the peek window anywhere?
fn body_contains_peek(stmts: &[TStmt]) -> bool {
    fn expr_has_peek(expr: &TExpr) -> bool {
        match &expr.kind {
            TExprKind::Peek(_) => true,
            TExprKind::IntLit(_)
            | TExprKind::BoolLit(_)
            | TExprKind::FloatLit(_)
            | TExprKind::Var(_)
            | TExprKind::Pop => false,
            TExprKind::Index { base, index } => expr_has_peek(base) || expr_has_peek(index),
            TExprKind::Unary { operand, .. } => expr_has_peek(operand),
            TExprKind::Binary { lhs, rhs, .. }
            | TExprKind::Relational { lhs, rhs, .. }
            | TExprKind::Logical { lhs, rhs, .. }
            | TExprKind::Comma { lhs, rhs } => expr_has_peek(lhs) || expr_has_peek(rhs),
            TExprKind::Assign { target, value, .. } => {
                expr_has_peek(target) || expr_has_peek(value)
            }
            TExprKind::Call { args, .. } => args.iter().any(expr_has_peek),
            TExprKind::Cast(inner) => expr_has_peek(inner),
            TExprKind::InitList(elems) => elems.iter().any(expr_has_peek),
        }
    }
    stmts.iter().any(|stmt| match &stmt.kind {
        TStmtKind::Expr(e) | TStmtKind::Push(e) => expr_has_peek(e),
        TStmtKind::VarDecl { init, .. } => init.as_ref().is_some_and(expr_has_peek),
        TStmtKind::If {
            condition,
            then_block,
            else_block,
        } => {
            expr_has_peek(condition)
                || body_contains_peek(then_block)
                || else_block.as_ref().is_some_and(|b| body_contains_peek(b))
        }
        TStmtKind::For {
            init,
            condition,
            step,
            body,
        } => {
            init.as_ref()
                .is_some_and(|s| body_contains_peek(std::slice::from_ref(&**s)))
                || condition.as_ref().is_some_and(expr_has_peek)
                || step.as_ref().is_some_and(expr_has_peek)
                || body_contains_peek(body)
        }
        TStmtKind::Break | TStmtKind::Continue => false,
        TStmtKind::Return(value) => value.as_ref().is_some_and(expr_has_peek),
    })
}

/// Does the statement list contain a break/continue that would exit the
/// *enclosing* loop? Descends into if blocks but not into nested loops,
/// whose break/continue target the inner loop.
fn has_early_exit(stmts: &[TStmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.kind {
        TStmtKind::Break | TStmtKind::Continue => true,
        TStmtKind::If {
            then_block,
            else_block,
            ..
        } => {
            has_early_exit(then_block)
                || else_block.as_ref().is_some_and(|b| has_early_exit(b))
        }
        _ => false,
    })
}

/// Recognize `for (int i = C0; i < C1; i++)`-shaped loops (also `<=`,
/// `i += C`). Returns the trip count when all three parts are constant.
fn trip_count(
    init: Option<&TStmt>,
    condition: Option<&TExpr>,
    step: Option<&TExpr>,
) -> Option<u64> {
    let env = ParamEnv::new();
    let (var, start) = match init {
        Some(TStmt {
            kind:
                TStmtKind::VarDecl {
                    decl,
                    init: Some(e),
                },
            ..
        }) => (*decl, fold_const(e, &env)?.as_int()?),
        Some(TStmt {
            kind: TStmtKind::Expr(TExpr {
                kind:
                    TExprKind::Assign {
                        op: None,
                        target,
                        value,
                    },
                ..
            }),
            ..
        }) => match &strip_casts(target).kind {
            TExprKind::Var(decl) => (*decl, fold_const(value, &env)?.as_int()?),
            _ => return None,
        },
        _ => return None,
    };

    let (inclusive, limit) = match condition {
        Some(TExpr {
            kind: TExprKind::Relational { op, lhs, rhs },
            ..
        }) => {
            if !matches!(&strip_casts(lhs).kind, TExprKind::Var(d) if *d == var) {
                return None;
            }
            let limit = fold_const(rhs, &env)?.as_int()?;
            match op {
                RelOp::Less => (false, limit),
                RelOp::LessEqual => (true, limit),
                _ => return None,
            }
        }
        _ => return None,
    };

    let stride = match step {
        Some(TExpr {
            kind: TExprKind::Unary { op, operand },
            ..
        }) if matches!(op, UnaryOp::PreIncrement | UnaryOp::PostIncrement) => {
            match &strip_casts(operand).kind {
                TExprKind::Var(d) if *d == var => 1,
                _ => return None,
            }
        }
        Some(TExpr {
            kind:
                TExprKind::Assign {
                    op: Some(BinaryOp::Add),
                    target,
                    value,
                },
            ..
        }) => {
            if !matches!(&strip_casts(target).kind, TExprKind::Var(d) if *d == var) {
                return None;
            }
            let s = fold_const(value, &env)?.as_int()?;
            if s <= 0 {
                return None;
            }
            s
        }
        _ => return None,
    };

    let end = if inclusive { limit + 1 } else { limit };
    if end <= start {
        return Some(0);
    }
    Some(((end - start + stride - 1) / stride) as u64)
}

fn strip_casts(expr: &TExpr) -> &TExpr {
    match &expr.kind {
        TExprKind::Cast(inner) => strip_casts(inner),
        _ => expr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::has_errors;

    fn analyze_source(source: &str) -> SemaResult {
        let parsed = crate::parser::parse(source);
        assert!(
            parsed.errors.is_empty(),
            "parse errors: {:?}",
            parsed.errors
        );
        analyze(&parsed.program.unwrap())
    }

    fn expect_code(source: &str, code: &str) {
        let result = analyze_source(source);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.code.map(|c| c.0) == Some(code)),
            "expected {code}, got {:?}",
            result.diagnostics
        );
    }

    fn expect_clean(source: &str) -> SemaResult {
        let result = analyze_source(source);
        assert!(
            !has_errors(&result.diagnostics),
            "unexpected errors: {:?}",
            result.diagnostics
        );
        result
    }

    const COUNTER: &str = "void->int filter Counter {
        int n = 0;
        work push 1 { push(n); n = n + 1; }
    }
    int->void filter Sink { work pop 1 { pop(); } }
    void->void pipeline Main { add Counter(); add Sink(); }";

    #[test]
    fn counter_pipeline_is_clean() {
        let result = expect_clean(COUNTER);
        assert_eq!(result.program.filters.len(), 2);
        assert!(result.program.top.is_some());
    }

    #[test]
    fn state_write_infers_stateful() {
        let result = expect_clean(COUNTER);
        let counter = &result.program.filters[0];
        assert!(counter.stateful, "counter writes `n`, so it is stateful");
        let sink = &result.program.filters[1];
        assert!(!sink.stateful);
    }

    #[test]
    fn analysis_is_idempotent() {
        let parsed = crate::parser::parse(COUNTER);
        let program = parsed.program.unwrap();
        let first = analyze(&program);
        let second = analyze(&program);
        assert_eq!(first.diagnostics.len(), second.diagnostics.len());
        assert_eq!(first.program.decls.len(), second.program.decls.len());
        assert_eq!(first.program.top, second.program.top);
    }

    #[test]
    fn every_expression_is_typed() {
        let result = expect_clean(COUNTER);
        // Spot-check the counter's push argument: typed as the output int.
        let counter = &result.program.filters[0];
        let TStmtKind::Push(value) = &counter.work.body[0].kind else {
            panic!("expected push");
        };
        assert_eq!(value.ty, result.program.types.int());
    }

    #[test]
    fn type_mismatch_on_bool_to_int() {
        expect_code(
            "int->int filter F { work pop 1 push 1 { int x = true; push(pop() + x); } }",
            "E0200",
        );
    }

    #[test]
    fn undeclared_name() {
        expect_code(
            "int->int filter F { work pop 1 push 1 { push(pop() + missing); } }",
            "E0100",
        );
    }

    #[test]
    fn redefinition_in_same_scope() {
        expect_code(
            "int->int filter F { work pop 1 push 1 { int x = 0; int x = 1; push(pop() + x); } }",
            "E0101",
        );
    }

    #[test]
    fn shadowing_is_allowed() {
        expect_clean(
            "int->int filter F {
                work pop 1 push 1 {
                    int x = pop();
                    if (x > 0) { int v = x * 2; push(v); } else { push(x); }
                }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
    }

    #[test]
    fn assignment_to_non_lvalue() {
        expect_code(
            "int->int filter F { work pop 1 push 1 { 3 = pop(); push(0); } }",
            "E0201",
        );
    }

    #[test]
    fn assignment_to_parameter_is_rejected() {
        expect_code(
            "int->int filter F(int k) { work pop 1 push 1 { k = 2; push(pop() * k); } }",
            "E0201",
        );
    }

    #[test]
    fn push_count_mismatch() {
        expect_code("void->int filter F { work push 2 { push(1); } }", "E0300");
    }

    #[test]
    fn push_count_through_constant_loop() {
        expect_clean(
            "void->int filter F {
                work push 8 { for (int i = 0; i < 8; i++) push(i); }
            }
            int->void filter Snk { work pop 8 { for (int i = 0; i < 8; i++) pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
    }

    #[test]
    fn unbounded_push_count_warns() {
        let result = analyze_source(
            "void->int filter F {
                int n = 1;
                work push 1 { for (int i = 0; i < n; i++) push(i); n = n; }
            }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code.map(|c| c.0) == Some("W0300")));
    }

    #[test]
    fn loop_with_break_is_not_statically_counted() {
        let result = analyze_source(
            "int->int filter F {
                work pop 1 push 4 {
                    int x = pop();
                    for (int i = 0; i < 4; i++) { if (x == 0) break; push(i); }
                }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code.map(|c| c.0) == Some("W0300")));
    }

    #[test]
    fn peek_offset_out_of_window() {
        expect_code(
            "int->int filter F { work peek 2 pop 1 push 1 { push(peek(2)); pop(); } }",
            "E0300",
        );
    }

    #[test]
    fn peek_offset_must_be_constant() {
        expect_code(
            "int->int filter F {
                work peek 4 pop 4 push 1 {
                    int idx = pop() + pop() + pop() + pop();
                    push(peek(idx));
                }
            }",
            "E0204",
        );
    }

    #[test]
    fn peek_defaults_to_pop_rate() {
        expect_clean(
            "int->int filter F { work pop 2 push 2 { push(peek(1)); pop(); push(pop()); } }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
    }

    #[test]
    fn peek_below_pop_is_rejected() {
        expect_code(
            "int->int filter F { work peek 1 pop 2 push 1 { pop(); push(pop()); } }",
            "E0300",
        );
    }

    #[test]
    fn missing_pop_rate_on_consuming_filter() {
        expect_code("int->int filter F { work push 1 { push(pop()); } }", "E0300");
    }

    #[test]
    fn array_size_must_fold() {
        expect_code(
            "void->int filter F {
                int n = 3;
                work push 1 {
                    int[n] a;
                    push(0);
                }
            }",
            "E0204",
        );
    }

    #[test]
    fn overload_resolution_picks_exact_match() {
        let result = expect_clean(
            "void->float filter F { work push 1 { push(abs(-2.5)); } }
            float->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
        let filter = &result.program.filters[0];
        let TStmtKind::Push(value) = &filter.work.body[0].kind else {
            panic!();
        };
        let TExprKind::Call { sig, .. } = &value.kind else {
            panic!("expected call, got {:?}", value.kind);
        };
        let sig = &result.program.func_sigs[*sig];
        assert_eq!(sig.params[0], result.program.types.float());
    }

    #[test]
    fn ambiguous_overload() {
        // min(bit, bit): both the int and float overloads need two
        // conversions; neither is strictly better.
        expect_code(
            "bit->float filter F {
                work pop 2 push 1 {
                    bit a = pop();
                    bit b = pop();
                    push(min(a, b));
                }
            }",
            "E0203",
        );
    }

    #[test]
    fn arity_mismatch_on_call() {
        expect_code(
            "void->float filter F { work push 1 { push(pow(2.0)); } }",
            "E0202",
        );
    }

    #[test]
    fn add_arity_mismatch() {
        expect_code(
            "int->int filter Stage(int k) { work pop 1 push 1 { push(pop() * k); } }
            void->void pipeline Main { add Stage(); }",
            "E0202",
        );
    }

    #[test]
    fn user_function_calls_resolve() {
        expect_clean(
            "int double_it(int x) { return x * 2; }
            void->int filter F { work push 1 { push(double_it(21)); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add F(); add Snk(); }",
        );
    }

    #[test]
    fn complex_type_is_rejected() {
        expect_code(
            "complex->complex filter F { work pop 1 push 1 { push(pop()); } }",
            "E0500",
        );
    }

    #[test]
    fn logical_requires_bool() {
        expect_code(
            "int->int filter F { work pop 1 push 1 { int x = pop(); if (x && true) push(1); else push(0); } }",
            "E0200",
        );
    }

    #[test]
    fn init_block_rates_rejected() {
        expect_code(
            "void->int filter F { init push 1 { } work push 1 { push(1); } }",
            "E0300",
        );
    }

    #[test]
    fn unused_filter_warns() {
        let result = analyze_source(
            "void->int filter Orphan { work push 1 { push(1); } }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add Snk(); }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code.map(|c| c.0) == Some("W0100")));
    }

    #[test]
    fn constant_folding_resolves_sizes_and_peeks() {
        expect_clean(
            "int->int filter F {
                work peek 2 + 2 pop 4 push 1 {
                    int[2 * 2] window;
                    window[0] = peek(0);
                    window[3] = peek(4 - 1);
                    for (int i = 0; i < 4; i++) { pop(); }
                    push(window[0] + window[3]);
                }
            }
            void->int filter Src { work push 1 { push(1); } }
            int->void filter Snk { work pop 1 { pop(); } }
            void->void pipeline Main { add Src(); add F(); add Snk(); }",
        );
    }
}
