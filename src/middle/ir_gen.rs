//! Code generator: resolved AST to Veld IR
//!
//! Walks the annotated arena once and emits basic-block IR. The
//! resolver has already typed every node; generation re-derives
//! operand types only to cast both sides of an operation to the
//! promoted type, and treats any disagreement with the annotation as
//! an internal invariant violation.
//!
//! The per-function context threads the termination-flag stack and
//! the chained-comparison temporary list explicitly, so the balance
//! invariants hold by construction: every body push has a matching
//! pop and the temporary list is drained before a chain returns.

use std::collections::{HashMap, HashSet};

use crate::frontend::ast::{BinOp, ChainLink, CmpOp, NodeId, NodeKind, Resolution, UnOp};
use crate::frontend::module::CompilationUnit;
use crate::frontend::semantic::{value_type_of, Symbol, SymbolKind};
use crate::middle::ir::{
    BinAri, BlockId, CmpKind, Constant, Instruction, IrExtern, IrFunction, IrGlobal, IrModule,
    IrStruct, IrType, Linkage, Register, Terminator, Value,
};
use crate::stdlib::builtins;
use crate::types::{mangle, promote, type_system, PrimitiveType, ResolvedType};
use crate::utils::{Error, Result, Span};

/// A generated value together with its resolved type
#[derive(Debug, Clone)]
struct TypedValue {
    value: Value,
    ty: ResolvedType,
}

impl TypedValue {
    fn unit() -> Self {
        Self {
            value: Value::Unit,
            ty: ResolvedType::VOID,
        }
    }
}

/// Per-function generation context
struct FnCtx {
    func: IrFunction,
    current: BlockId,
    next_reg: usize,
    /// Local slots, one scope per lexical body; lookup walks
    /// innermost-to-outermost so branch-local shadowing resolves to
    /// the same slot the resolver saw
    locals: Vec<HashMap<String, (Register, ResolvedType)>>,
    /// Return type of the function being generated
    ret_ty: ResolvedType,
    /// One flag per lexical body: true once every path through it
    /// has returned
    term_stack: Vec<bool>,
    /// In-flight chained-comparison temporaries; drained before each
    /// chain's generation returns
    chain_temps: Vec<Register>,
}

impl FnCtx {
    fn new(name: &str, linkage: Linkage, params: Vec<(String, IrType)>, ret: ResolvedType) -> Self {
        let mut func = IrFunction::new(name, linkage, params, IrType::from_resolved(&ret));
        let entry = func.add_block("entry");
        Self {
            func,
            current: entry,
            next_reg: 0,
            locals: vec![HashMap::new()],
            ret_ty: ret,
            term_stack: Vec::new(),
            chain_temps: Vec::new(),
        }
    }

    fn define_local(&mut self, name: &str, slot: Register, ty: ResolvedType) {
        self.locals
            .last_mut()
            .expect("local scopes never empty")
            .insert(name.to_string(), (slot, ty));
    }

    fn local(&self, name: &str) -> Option<(Register, ResolvedType)> {
        self.locals.iter().rev().find_map(|s| s.get(name)).cloned()
    }

    fn reg(&mut self) -> Register {
        let r = Register(self.next_reg);
        self.next_reg += 1;
        r
    }

    fn emit(&mut self, inst: Instruction) {
        let current = self.current;
        let block = self.func.block_mut(current);
        if block.terminator.is_none() {
            block.instructions.push(inst);
        }
    }

    fn add_block(&mut self, label: &str) -> BlockId {
        self.func.add_block(label)
    }

    fn terminate(&mut self, term: Terminator) {
        let current = self.current;
        self.terminate_block(current, term);
    }

    fn terminate_block(&mut self, id: BlockId, term: Terminator) {
        let block = self.func.block_mut(id);
        if block.terminator.is_none() {
            block.terminator = Some(term);
        }
    }

    fn mark_terminated(&mut self) {
        if let Some(flag) = self.term_stack.last_mut() {
            *flag = true;
        }
    }

    fn is_terminated(&self) -> bool {
        self.term_stack.last().copied().unwrap_or(false)
    }

    /// Fresh stack slot of the given type
    fn alloca(&mut self, ty: IrType) -> Register {
        let dest = self.reg();
        self.emit(Instruction::Alloca { dest, ty });
        dest
    }
}

/// Generate the IR module for one resolved compilation unit
pub fn generate(unit: &CompilationUnit) -> Result<IrModule> {
    Generator::new(unit).run()
}

/// The code generator for one unit
struct Generator<'u> {
    unit: &'u CompilationUnit,
    module: IrModule,
    /// Mangled names of functions defined in this unit
    defined: HashSet<String>,
    externs_seen: HashSet<String>,
}

impl<'u> Generator<'u> {
    fn new(unit: &'u CompilationUnit) -> Self {
        let init = mangle::root_init(&unit.namespace);
        Self {
            unit,
            module: IrModule::new(&unit.name, init),
            defined: HashSet::new(),
            externs_seen: HashSet::new(),
        }
    }

    fn run(mut self) -> Result<IrModule> {
        // Struct layouts first: field access requires the struct type
        // to already be registered with the backend. Also collect the
        // functions this unit defines so calls to anything else become
        // imported declarations.
        for &root in &self.unit.roots {
            match &self.unit.ast.node(root).kind {
                NodeKind::StructDef { .. } => self.register_struct(root)?,
                NodeKind::FuncDef { .. } => {
                    if let Resolution::Function { mangled } = &self.unit.ast.node(root).res {
                        self.defined.insert(mangled.clone());
                    }
                }
                _ => {}
            }
        }

        // Global initializer stores accumulate in the root init
        // function, executed once before any other entry point.
        let init_name = self.module.init.clone();
        let mut init_ctx = FnCtx::new(&init_name, Linkage::Internal, Vec::new(), ResolvedType::VOID);

        let mut top_index = 0;
        for &root in &self.unit.roots.clone() {
            match self.unit.ast.node(root).kind.clone() {
                NodeKind::StructDef { .. } | NodeKind::TypeDef { .. } | NodeKind::Using { .. } => {}
                NodeKind::FuncDecl { .. } => self.gen_func_decl(root)?,
                NodeKind::FuncDef { .. } => self.gen_func_def(root)?,
                NodeKind::VarDef { .. } => self.gen_global_def(&mut init_ctx, root)?,
                _ => {
                    self.gen_top_expr(root, top_index)?;
                    top_index += 1;
                }
            }
        }

        init_ctx.terminate(Terminator::Return(None));
        debug_assert!(init_ctx.term_stack.is_empty(), "unbalanced termination flags");
        debug_assert!(init_ctx.chain_temps.is_empty(), "undrained chain temporaries");
        self.module.functions.insert(0, init_ctx.func);

        log::debug!(
            "generated unit {}: {} functions, {} globals",
            self.unit.name,
            self.module.functions.len(),
            self.module.globals.len()
        );
        Ok(self.module)
    }

    // ==================== Top-Level Nodes ====================

    fn register_struct(&mut self, root: NodeId) -> Result<()> {
        let strukt = self
            .unit
            .ast
            .ty(root)
            .as_struct()
            .cloned()
            .ok_or_else(|| Error::Internal("struct definition without struct type".into()))?;
        let fields = strukt
            .fields
            .iter()
            .map(|(name, ty)| (name.clone(), IrType::from_resolved(ty)))
            .collect();
        self.module.structs.push(IrStruct {
            name: strukt.mangled,
            fields,
        });
        Ok(())
    }

    fn gen_func_decl(&mut self, root: NodeId) -> Result<()> {
        let mangled = self.function_resolution(root)?;
        let symbol = self.callable(&mangled, self.unit.ast.node(root).span)?;
        self.ensure_extern(&symbol);
        Ok(())
    }

    fn gen_func_def(&mut self, root: NodeId) -> Result<()> {
        let span = self.unit.ast.node(root).span;
        let mangled = self.function_resolution(root)?;
        let symbol = self.callable(&mangled, span)?;
        let body = match &self.unit.ast.node(root).kind {
            NodeKind::FuncDef { body, .. } => body.clone(),
            _ => return Err(Error::Internal("gen_func_def on non-definition".into())),
        };

        let params = match &symbol.kind {
            SymbolKind::Function { params, .. } => params.clone(),
            _ => return Err(Error::Internal("function symbol without signature".into())),
        };
        let ir_params: Vec<(String, IrType)> = params
            .iter()
            .map(|(n, t)| (n.clone(), IrType::from_resolved(t)))
            .collect();

        let mut ctx = FnCtx::new(&mangled, Linkage::Exported, ir_params, symbol.ty.clone());

        // Parameters become addressable local bindings
        for (i, (pname, pty)) in params.iter().enumerate() {
            let slot = ctx.alloca(IrType::from_resolved(pty));
            ctx.emit(Instruction::Store {
                ptr: Value::Reg(slot),
                value: Value::Param(i),
                ty: IrType::from_resolved(pty),
            });
            ctx.define_local(pname, slot, pty.clone());
        }

        let (_, terminated) = self.gen_body(&mut ctx, &body)?;
        if !terminated {
            return Err(Error::MalformedControlFlow {
                context: format!("function {}", symbol.name),
                span,
            });
        }

        debug_assert!(ctx.term_stack.is_empty(), "unbalanced termination flags");
        debug_assert!(ctx.chain_temps.is_empty(), "undrained chain temporaries");
        self.module.functions.push(ctx.func);
        Ok(())
    }

    fn gen_global_def(&mut self, init_ctx: &mut FnCtx, root: NodeId) -> Result<()> {
        let node = self.unit.ast.node(root);
        let span = node.span;
        let ty = node.ty.clone();
        let (mangled, init) = match (&node.res, &node.kind) {
            (Resolution::Global { mangled }, NodeKind::VarDef { init, .. }) => {
                (mangled.clone(), *init)
            }
            _ => return Err(Error::Internal("top-level var-def is not a global".into())),
        };

        self.module.globals.push(IrGlobal {
            name: mangled.clone(),
            ty: IrType::from_resolved(&ty),
        });

        if let Some(init) = init {
            let tv = self.gen_expr(init_ctx, init)?;
            let casted = self.cast_value(init_ctx, tv, &ty, span)?;
            init_ctx.emit(Instruction::Store {
                ptr: Value::Global(mangled),
                value: casted.value,
                ty: IrType::from_resolved(&ty),
            });
        }
        Ok(())
    }

    /// Wrap one top-level expression into its own synthesized
    /// function; a non-void result is handed to the default output
    /// routine so interactive evaluation prints it.
    fn gen_top_expr(&mut self, root: NodeId, index: usize) -> Result<()> {
        let name = mangle::top_level(&self.unit.namespace, index);
        let span = self.unit.ast.node(root).span;
        let mut ctx = FnCtx::new(&name, Linkage::Internal, Vec::new(), ResolvedType::VOID);

        let tv = self.gen_expr(&mut ctx, root)?;
        let vt = value_type_of(&self.unit.ast, root);
        if let Some(p) = vt.primitive() {
            if let Some((routine, widen)) = builtins::default_output_routine(p) {
                let target = ResolvedType::prim(widen);
                let casted = self.cast_value(&mut ctx, tv, &target, span)?;
                if !self.externs_seen.contains(routine) {
                    self.externs_seen.insert(routine.to_string());
                    self.module.externs.push(IrExtern {
                        name: routine.to_string(),
                        params: vec![IrType::from_resolved(&target)],
                        ret: IrType::Void,
                    });
                }
                ctx.emit(Instruction::Call {
                    dest: None,
                    func: routine.to_string(),
                    args: vec![casted.value],
                });
            }
        }

        ctx.terminate(Terminator::Return(None));
        debug_assert!(ctx.term_stack.is_empty(), "unbalanced termination flags");
        debug_assert!(ctx.chain_temps.is_empty(), "undrained chain temporaries");
        self.module.functions.push(ctx.func);
        self.module.entries.push(name);
        Ok(())
    }

    // ==================== Bodies ====================

    /// Generate a statement body with its own termination flag.
    /// Returns the value of the last statement (None once terminated
    /// or when the body yields nothing) and whether every path
    /// through the body returned.
    fn gen_body(&mut self, ctx: &mut FnCtx, stmts: &[NodeId]) -> Result<(Option<TypedValue>, bool)> {
        ctx.term_stack.push(false);
        ctx.locals.push(HashMap::new());
        let mut last: Option<(NodeId, TypedValue)> = None;
        let mut failed = None;
        for &stmt in stmts {
            if ctx.is_terminated() {
                // Unreachable code after a returning construct
                break;
            }
            match self.gen_expr(ctx, stmt) {
                Ok(tv) => last = Some((stmt, tv)),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        ctx.locals.pop();
        let terminated = ctx.term_stack.pop().unwrap_or(false);
        if let Some(e) = failed {
            return Err(e);
        }
        let value = match last {
            Some((id, tv)) if !terminated && !value_type_of(&self.unit.ast, id).is_void() => {
                Some(tv)
            }
            _ => None,
        };
        Ok((value, terminated))
    }

    // ==================== Expressions ====================

    fn gen_expr(&mut self, ctx: &mut FnCtx, id: NodeId) -> Result<TypedValue> {
        let node = self.unit.ast.node(id);
        let span = node.span;
        let node_ty = node.ty.clone();
        let res = node.res.clone();
        match node.kind.clone() {
            NodeKind::IntLit(v) => Ok(TypedValue {
                value: Value::Const(Constant::Int {
                    value: v,
                    ty: IrType::from_resolved(&node_ty),
                }),
                ty: node_ty,
            }),
            NodeKind::FloatLit(v) => Ok(TypedValue {
                value: Value::Const(Constant::Float {
                    value: v,
                    ty: IrType::F64,
                }),
                ty: node_ty,
            }),
            NodeKind::StrLit(s) => Ok(TypedValue {
                value: Value::Const(Constant::Str(s)),
                ty: node_ty,
            }),
            NodeKind::BoolLit(b) => Ok(TypedValue {
                value: Value::Const(Constant::Bool(b)),
                ty: node_ty,
            }),
            NodeKind::VarRef { .. } | NodeKind::Dot { .. } => match res {
                Resolution::Local | Resolution::Global { .. } | Resolution::Field { .. } => {
                    let (ptr, ty) = self.gen_addr(ctx, id)?;
                    let dest = ctx.reg();
                    ctx.emit(Instruction::Load {
                        dest,
                        ptr,
                        ty: IrType::from_resolved(&ty),
                    });
                    Ok(TypedValue {
                        value: Value::Reg(dest),
                        ty,
                    })
                }
                other => Err(Error::Internal(format!(
                    "reference generated as a value: {:?}",
                    other
                ))),
            },
            NodeKind::Unary { op, operand } => self.gen_unary(ctx, op, operand, &node_ty, span),
            NodeKind::Binary { op, lhs, rhs } => {
                if op.is_connective() {
                    self.gen_connective(ctx, op, lhs, rhs, span)
                } else {
                    self.gen_arith(ctx, op, lhs, rhs, &node_ty, span)
                }
            }
            NodeKind::Compare { op, lhs, rhs } => {
                let lt = self.gen_expr(ctx, lhs)?;
                let rt = self.gen_expr(ctx, rhs)?;
                self.gen_cmp(ctx, op, lt, rt, span)
            }
            NodeKind::Chain { links } => self.gen_chain(ctx, &links, span),
            NodeKind::Assign { target, value } => self.gen_assign(ctx, target, value, span),
            NodeKind::Call { args, .. } => self.gen_call(ctx, id, &args, span),
            NodeKind::If {
                cond,
                then_body,
                else_body,
            } => self.gen_if(ctx, cond, &then_body, &else_body, &node_ty, span),
            NodeKind::While {
                cond,
                body,
                else_body,
            } => self.gen_while(ctx, cond, &body, &else_body, &node_ty, span),
            NodeKind::Block { body } => {
                let (value, terminated) = self.gen_body(ctx, &body)?;
                if terminated {
                    ctx.mark_terminated();
                }
                Ok(value.unwrap_or_else(TypedValue::unit))
            }
            NodeKind::VarDef { name, init, .. } => {
                self.gen_local_def(ctx, &name, init, &node_ty, span)
            }
            NodeKind::Return { value } => self.gen_return(ctx, value, span),
            NodeKind::FuncDecl { .. }
            | NodeKind::FuncDef { .. }
            | NodeKind::StructDef { .. }
            | NodeKind::TypeDef { .. }
            | NodeKind::Using { .. } => Err(Error::Internal(
                "definition node in expression position".into(),
            )),
        }
    }

    fn gen_unary(
        &mut self,
        ctx: &mut FnCtx,
        op: UnOp,
        operand: NodeId,
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        let tv = self.gen_expr(ctx, operand)?;
        match op {
            UnOp::Neg => {
                // Constant negation folds so literal range checks see
                // the signed value.
                if let Value::Const(Constant::Int { value, ty }) = &tv.value {
                    return Ok(TypedValue {
                        value: Value::Const(Constant::Int {
                            value: value.wrapping_neg(),
                            ty: ty.clone(),
                        }),
                        ty: tv.ty,
                    });
                }
                if let Value::Const(Constant::Float { value, ty }) = &tv.value {
                    return Ok(TypedValue {
                        value: Value::Const(Constant::Float {
                            value: -value,
                            ty: ty.clone(),
                        }),
                        ty: tv.ty,
                    });
                }
                let dest = ctx.reg();
                ctx.emit(Instruction::Neg {
                    dest,
                    ty: IrType::from_resolved(node_ty),
                    value: tv.value,
                });
                Ok(TypedValue {
                    value: Value::Reg(dest),
                    ty: node_ty.clone(),
                })
            }
            UnOp::Not => {
                let b = self.to_bool(ctx, tv, span)?;
                let dest = ctx.reg();
                ctx.emit(Instruction::Not { dest, value: b });
                Ok(TypedValue {
                    value: Value::Reg(dest),
                    ty: ResolvedType::BOOL,
                })
            }
        }
    }

    fn gen_arith(
        &mut self,
        ctx: &mut FnCtx,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        let lt = self.gen_expr(ctx, lhs)?;
        let rt = self.gen_expr(ctx, rhs)?;

        // Re-derive the common type and check it against what
        // resolution annotated; a mismatch is a compiler bug.
        let promoted = promote(&lt.ty, &rt.ty)
            .ok_or_else(|| Error::Internal("unpromotable operands after resolution".into()))?;
        if !promoted.same_type(node_ty) {
            return Err(Error::Internal(format!(
                "generation derived {} where resolution annotated {}",
                promoted.display_name(),
                node_ty.display_name()
            )));
        }

        let l = self.cast_value(ctx, lt, &promoted, span)?;
        let r = self.cast_value(ctx, rt, &promoted, span)?;
        let ir_op = match op {
            BinOp::Add => BinAri::Add,
            BinOp::Sub => BinAri::Sub,
            BinOp::Mul => BinAri::Mul,
            BinOp::Div => BinAri::Div,
            BinOp::Rem => BinAri::Rem,
            _ => return Err(Error::Internal("connective in arithmetic path".into())),
        };
        let dest = ctx.reg();
        ctx.emit(Instruction::Bin {
            dest,
            op: ir_op,
            ty: IrType::from_resolved(&promoted),
            lhs: l.value,
            rhs: r.value,
        });
        Ok(TypedValue {
            value: Value::Reg(dest),
            ty: promoted,
        })
    }

    fn gen_cmp(
        &mut self,
        ctx: &mut FnCtx,
        op: CmpOp,
        lt: TypedValue,
        rt: TypedValue,
        span: Span,
    ) -> Result<TypedValue> {
        let promoted = promote(&lt.ty, &rt.ty)
            .ok_or_else(|| Error::Internal("unpromotable comparison after resolution".into()))?;
        let l = self.cast_value(ctx, lt, &promoted, span)?;
        let r = self.cast_value(ctx, rt, &promoted, span)?;
        let kind = match op {
            CmpOp::Eq => CmpKind::Eq,
            CmpOp::Ne => CmpKind::Ne,
            CmpOp::Lt => CmpKind::Lt,
            CmpOp::Le => CmpKind::Le,
            CmpOp::Gt => CmpKind::Gt,
            CmpOp::Ge => CmpKind::Ge,
        };
        let dest = ctx.reg();
        ctx.emit(Instruction::Cmp {
            dest,
            op: kind,
            ty: IrType::from_resolved(&promoted),
            lhs: l.value,
            rhs: r.value,
        });
        Ok(TypedValue {
            value: Value::Reg(dest),
            ty: ResolvedType::BOOL,
        })
    }

    /// Boolean connectives evaluate both operands exactly once and
    /// store them into fresh temporaries before combining; there is
    /// no short-circuit skipping of side effects. NAND/NOR/XNOR are
    /// synthesized from AND/OR/NOT.
    fn gen_connective(
        &mut self,
        ctx: &mut FnCtx,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        span: Span,
    ) -> Result<TypedValue> {
        let lt = self.gen_expr(ctx, lhs)?;
        let lb = self.to_bool(ctx, lt, span)?;
        let lslot = ctx.alloca(IrType::Bool);
        ctx.emit(Instruction::Store {
            ptr: Value::Reg(lslot),
            value: lb,
            ty: IrType::Bool,
        });

        let rt = self.gen_expr(ctx, rhs)?;
        let rb = self.to_bool(ctx, rt, span)?;
        let rslot = ctx.alloca(IrType::Bool);
        ctx.emit(Instruction::Store {
            ptr: Value::Reg(rslot),
            value: rb,
            ty: IrType::Bool,
        });

        let la = ctx.reg();
        ctx.emit(Instruction::Load {
            dest: la,
            ptr: Value::Reg(lslot),
            ty: IrType::Bool,
        });
        let ra = ctx.reg();
        ctx.emit(Instruction::Load {
            dest: ra,
            ptr: Value::Reg(rslot),
            ty: IrType::Bool,
        });

        let base = match op {
            BinOp::And | BinOp::Nand => BinAri::And,
            BinOp::Or | BinOp::Nor => BinAri::Or,
            BinOp::Xor | BinOp::Xnor => BinAri::Xor,
            _ => return Err(Error::Internal("arithmetic op in connective path".into())),
        };
        let combined = ctx.reg();
        ctx.emit(Instruction::Bin {
            dest: combined,
            op: base,
            ty: IrType::Bool,
            lhs: Value::Reg(la),
            rhs: Value::Reg(ra),
        });

        let result = if matches!(op, BinOp::Nand | BinOp::Nor | BinOp::Xnor) {
            let neg = ctx.reg();
            ctx.emit(Instruction::Not {
                dest: neg,
                value: Value::Reg(combined),
            });
            neg
        } else {
            combined
        };
        Ok(TypedValue {
            value: Value::Reg(result),
            ty: ResolvedType::BOOL,
        })
    }

    /// Desugar `a < b < c` into `(a<b) AND (b<c)`, materializing each
    /// shared boundary operand into a temporary exactly once.
    fn gen_chain(&mut self, ctx: &mut FnCtx, links: &[ChainLink], span: Span) -> Result<TypedValue> {
        let mark = ctx.chain_temps.len();

        let mut slots: HashMap<NodeId, (Register, ResolvedType)> = HashMap::new();
        let mut operands: Vec<NodeId> = Vec::new();
        if let Some(first) = links.first() {
            operands.push(first.lhs);
        }
        for link in links {
            operands.push(link.rhs);
        }
        for id in operands {
            if slots.contains_key(&id) {
                continue;
            }
            let tv = self.gen_expr(ctx, id)?;
            let slot = ctx.alloca(IrType::from_resolved(&tv.ty));
            ctx.emit(Instruction::Store {
                ptr: Value::Reg(slot),
                value: tv.value,
                ty: IrType::from_resolved(&tv.ty),
            });
            ctx.chain_temps.push(slot);
            slots.insert(id, (slot, tv.ty));
        }

        let mut acc: Option<Value> = None;
        for link in links {
            let (lslot, lty) = slots
                .get(&link.lhs)
                .cloned()
                .ok_or_else(|| Error::Internal("missing chain operand slot".into()))?;
            let (rslot, rty) = slots
                .get(&link.rhs)
                .cloned()
                .ok_or_else(|| Error::Internal("missing chain operand slot".into()))?;

            let lv = ctx.reg();
            ctx.emit(Instruction::Load {
                dest: lv,
                ptr: Value::Reg(lslot),
                ty: IrType::from_resolved(&lty),
            });
            let rv = ctx.reg();
            ctx.emit(Instruction::Load {
                dest: rv,
                ptr: Value::Reg(rslot),
                ty: IrType::from_resolved(&rty),
            });

            let mut lval = TypedValue {
                value: Value::Reg(lv),
                ty: lty,
            };
            let mut rval = TypedValue {
                value: Value::Reg(rv),
                ty: rty,
            };
            lval.ty.is_const = false;
            rval.ty.is_const = false;
            let cmp = self.gen_cmp(ctx, link.op, lval, rval, span)?;

            acc = Some(match acc {
                None => cmp.value,
                Some(prev) => {
                    let dest = ctx.reg();
                    ctx.emit(Instruction::Bin {
                        dest,
                        op: BinAri::And,
                        ty: IrType::Bool,
                        lhs: prev,
                        rhs: cmp.value,
                    });
                    Value::Reg(dest)
                }
            });
        }

        // Drain the in-flight temporaries before returning
        ctx.chain_temps.truncate(mark);
        debug_assert_eq!(ctx.chain_temps.len(), mark, "chain temporaries not drained");

        Ok(TypedValue {
            value: acc.ok_or_else(|| Error::Internal("empty comparison chain".into()))?,
            ty: ResolvedType::BOOL,
        })
    }

    /// Right-hand side first, then the addressable target; the stored
    /// (casted) value is the assignment's own value.
    fn gen_assign(
        &mut self,
        ctx: &mut FnCtx,
        target: NodeId,
        value: NodeId,
        span: Span,
    ) -> Result<TypedValue> {
        let tv = self.gen_expr(ctx, value)?;
        let (ptr, target_ty) = self.gen_addr(ctx, target)?;
        let casted = self.cast_value(ctx, tv, &target_ty, span)?;
        ctx.emit(Instruction::Store {
            ptr,
            value: casted.value.clone(),
            ty: IrType::from_resolved(&target_ty),
        });
        Ok(casted)
    }

    fn gen_call(
        &mut self,
        ctx: &mut FnCtx,
        id: NodeId,
        args: &[NodeId],
        span: Span,
    ) -> Result<TypedValue> {
        let mangled = self.function_resolution(id)?;
        let symbol = self.callable(&mangled, span)?;
        let params = match &symbol.kind {
            SymbolKind::Function { params, .. } => params.clone(),
            _ => return Err(Error::Internal("call target is not a function".into())),
        };
        self.ensure_callee(&symbol);

        let mut values = Vec::new();
        for (&arg, (_, pty)) in args.iter().zip(params.iter()) {
            let tv = self.gen_expr(ctx, arg)?;
            let casted = self.cast_value(ctx, tv, pty, self.unit.ast.node(arg).span)?;
            values.push(casted.value);
        }

        let ret = symbol.ty.clone();
        let dest = if ret.is_void() {
            None
        } else {
            Some(ctx.reg())
        };
        ctx.emit(Instruction::Call {
            dest,
            func: mangled,
            args: values,
        });
        Ok(match dest {
            Some(r) => TypedValue {
                value: Value::Reg(r),
                ty: ret,
            },
            None => TypedValue::unit(),
        })
    }

    /// Build then/else blocks, propagate termination, and join with a
    /// continuation block unless both branches already returned.
    fn gen_if(
        &mut self,
        ctx: &mut FnCtx,
        cond: NodeId,
        then_body: &[NodeId],
        else_body: &[NodeId],
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        let ct = self.gen_expr(ctx, cond)?;
        let cb = self.to_bool(ctx, ct, span)?;

        let result_slot = if node_ty.is_void() {
            None
        } else {
            Some(ctx.alloca(IrType::from_resolved(node_ty)))
        };

        let then_blk = ctx.add_block("then");
        let else_blk = ctx.add_block("else");
        ctx.terminate(Terminator::Branch {
            cond: cb,
            then_to: then_blk,
            else_to: else_blk,
        });

        ctx.current = then_blk;
        let (then_val, then_term) = self.gen_body(ctx, then_body)?;
        if !then_term {
            self.store_branch_result(ctx, result_slot, then_val, node_ty, span)?;
        }
        let then_end = ctx.current;

        ctx.current = else_blk;
        let (else_val, else_term) = self.gen_body(ctx, else_body)?;
        if !else_term {
            self.store_branch_result(ctx, result_slot, else_val, node_ty, span)?;
        }
        let else_end = ctx.current;

        if then_term && else_term {
            // No continuation: the construct itself is terminated
            ctx.mark_terminated();
            return Ok(TypedValue::unit());
        }

        let cont = ctx.add_block("endif");
        if !then_term {
            ctx.terminate_block(then_end, Terminator::Jump(cont));
        }
        if !else_term {
            ctx.terminate_block(else_end, Terminator::Jump(cont));
        }
        ctx.current = cont;

        match result_slot {
            Some(slot) => {
                let dest = ctx.reg();
                ctx.emit(Instruction::Load {
                    dest,
                    ptr: Value::Reg(slot),
                    ty: IrType::from_resolved(node_ty),
                });
                Ok(TypedValue {
                    value: Value::Reg(dest),
                    ty: node_ty.clone(),
                })
            }
            None => Ok(TypedValue::unit()),
        }
    }

    /// The condition block doubles as the loop-back target: it is
    /// evaluated once on entry (before any ELSE runs) and again after
    /// every body iteration. A false condition always leaves through
    /// the ELSE (or straight to the continuation).
    fn gen_while(
        &mut self,
        ctx: &mut FnCtx,
        cond: NodeId,
        body: &[NodeId],
        else_body: &[NodeId],
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        let result_slot = if node_ty.is_void() {
            None
        } else {
            Some(ctx.alloca(IrType::from_resolved(node_ty)))
        };

        let cond_blk = ctx.add_block("while_cond");
        ctx.terminate(Terminator::Jump(cond_blk));
        ctx.current = cond_blk;
        let ct = self.gen_expr(ctx, cond)?;
        let cb = self.to_bool(ctx, ct, span)?;

        let body_blk = ctx.add_block("while_body");
        let has_else = !else_body.is_empty();
        let mut cont = None;
        let exit_blk = if has_else {
            ctx.add_block("while_else")
        } else {
            let c = ctx.add_block("while_end");
            cont = Some(c);
            c
        };
        ctx.terminate_block(
            cond_blk,
            Terminator::Branch {
                cond: cb,
                then_to: body_blk,
                else_to: exit_blk,
            },
        );

        ctx.current = body_blk;
        let (body_val, body_term) = self.gen_body(ctx, body)?;
        if !body_term {
            self.store_branch_result(ctx, result_slot, body_val, node_ty, span)?;
            // Loop back to the shared condition block
            ctx.terminate(Terminator::Jump(cond_blk));
        }

        if has_else {
            ctx.current = exit_blk;
            let (else_val, else_term) = self.gen_body(ctx, else_body)?;
            if else_term {
                // The only way out of the loop returns; the construct
                // is terminated and no continuation exists.
                ctx.mark_terminated();
                return Ok(TypedValue::unit());
            }
            self.store_branch_result(ctx, result_slot, else_val, node_ty, span)?;
            let c = ctx.add_block("while_end");
            ctx.terminate(Terminator::Jump(c));
            cont = Some(c);
        }

        ctx.current = cont.ok_or_else(|| Error::Internal("missing loop continuation".into()))?;
        match result_slot {
            Some(slot) => {
                let dest = ctx.reg();
                ctx.emit(Instruction::Load {
                    dest,
                    ptr: Value::Reg(slot),
                    ty: IrType::from_resolved(node_ty),
                });
                Ok(TypedValue {
                    value: Value::Reg(dest),
                    ty: node_ty.clone(),
                })
            }
            None => Ok(TypedValue::unit()),
        }
    }

    fn gen_local_def(
        &mut self,
        ctx: &mut FnCtx,
        name: &str,
        init: Option<NodeId>,
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        let slot = ctx.alloca(IrType::from_resolved(node_ty));
        ctx.define_local(name, slot, node_ty.clone());
        if let Some(init) = init {
            let tv = self.gen_expr(ctx, init)?;
            let casted = self.cast_value(ctx, tv, node_ty, span)?;
            ctx.emit(Instruction::Store {
                ptr: Value::Reg(slot),
                value: casted.value,
                ty: IrType::from_resolved(node_ty),
            });
        }
        Ok(TypedValue::unit())
    }

    fn gen_return(
        &mut self,
        ctx: &mut FnCtx,
        value: Option<NodeId>,
        span: Span,
    ) -> Result<TypedValue> {
        match value {
            Some(v) => {
                let tv = self.gen_expr(ctx, v)?;
                let ret_ty = ctx.ret_ty.clone();
                let casted = self.cast_value(ctx, tv, &ret_ty, span)?;
                ctx.terminate(Terminator::Return(Some(casted.value)));
            }
            None => ctx.terminate(Terminator::Return(None)),
        }
        ctx.mark_terminated();
        Ok(TypedValue::unit())
    }

    // ==================== Addresses ====================

    /// Address of an assignable location: a variable or a struct
    /// field chain. Callers request either an address (here) or a
    /// value (`gen_expr`), never both.
    fn gen_addr(&mut self, ctx: &mut FnCtx, id: NodeId) -> Result<(Value, ResolvedType)> {
        let node = self.unit.ast.node(id);
        let res = node.res.clone();
        let node_ty = node.ty.clone();
        match node.kind.clone() {
            NodeKind::VarRef { name } => match res {
                Resolution::Local => {
                    let (reg, ty) = ctx
                        .local(&name)
                        .ok_or_else(|| Error::Internal(format!("untracked local {name}")))?;
                    Ok((Value::Reg(reg), ty))
                }
                Resolution::Global { mangled } => Ok((Value::Global(mangled), node_ty)),
                other => Err(Error::Internal(format!(
                    "unaddressable variable reference: {:?}",
                    other
                ))),
            },
            NodeKind::Dot { base, .. } => match res {
                Resolution::Field { index } => {
                    let (base_ptr, base_ty) = self.gen_addr(ctx, base)?;
                    let strukt = base_ty
                        .as_struct()
                        .ok_or_else(|| Error::Internal("field access on non-struct".into()))?;
                    let dest = ctx.reg();
                    ctx.emit(Instruction::FieldPtr {
                        dest,
                        base: base_ptr,
                        strukt: strukt.mangled.clone(),
                        index,
                    });
                    let field_ty = strukt.fields[index as usize].1.clone();
                    Ok((Value::Reg(dest), field_ty))
                }
                Resolution::Global { mangled } => Ok((Value::Global(mangled), node_ty)),
                other => Err(Error::Internal(format!(
                    "unaddressable field access: {:?}",
                    other
                ))),
            },
            _ => Err(Error::Internal("address of non-reference node".into())),
        }
    }

    // ==================== Casting ====================

    /// Cast a value to a target type. Constant operands fold with a
    /// range check: integer narrowing must fit the target's min/max
    /// and integer-to-float conversion must be exact.
    fn cast_value(
        &mut self,
        ctx: &mut FnCtx,
        tv: TypedValue,
        target: &ResolvedType,
        span: Span,
    ) -> Result<TypedValue> {
        if tv.ty.same_type(target) {
            return Ok(tv);
        }
        let tp = match target.primitive() {
            Some(p) if p != PrimitiveType::Void => p,
            _ => {
                return Err(Error::InvalidPromotion {
                    lhs: tv.ty.display_name(),
                    rhs: target.display_name(),
                    span,
                })
            }
        };
        let numeric_source = tv.ty.indirection == 0
            && tv
                .ty
                .primitive()
                .map_or(false, |p| p.is_numeric() || p == PrimitiveType::Bool);
        if !numeric_source || target.indirection > 0 || !(tp.is_numeric() || tp == PrimitiveType::Bool)
        {
            return Err(Error::InvalidPromotion {
                lhs: tv.ty.display_name(),
                rhs: target.display_name(),
                span,
            });
        }

        // Compile-time constants fold, with the range check
        if let Value::Const(c) = &tv.value {
            match c {
                Constant::Int { value, .. } => {
                    if !type_system::const_int_fits(*value, tp) {
                        return Err(Error::RangeOverflow {
                            value: value.to_string(),
                            target: target.display_name(),
                            span,
                        });
                    }
                    let folded = if tp.is_float() {
                        Constant::Float {
                            value: *value as f64,
                            ty: IrType::from_resolved(target),
                        }
                    } else if tp == PrimitiveType::Bool {
                        Constant::Bool(*value != 0)
                    } else {
                        Constant::Int {
                            value: *value,
                            ty: IrType::from_resolved(target),
                        }
                    };
                    return Ok(TypedValue {
                        value: Value::Const(folded),
                        ty: target.clone(),
                    });
                }
                Constant::Float { value, .. } if tp.is_float() => {
                    return Ok(TypedValue {
                        value: Value::Const(Constant::Float {
                            value: *value,
                            ty: IrType::from_resolved(target),
                        }),
                        ty: target.clone(),
                    });
                }
                Constant::Bool(b) => {
                    if tp.is_integer() {
                        return Ok(TypedValue {
                            value: Value::Const(Constant::Int {
                                value: *b as i64,
                                ty: IrType::from_resolved(target),
                            }),
                            ty: target.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let from = IrType::from_resolved(&tv.ty);
        let to = IrType::from_resolved(target);
        if from == to {
            return Ok(TypedValue {
                value: tv.value,
                ty: target.clone(),
            });
        }
        let dest = ctx.reg();
        ctx.emit(Instruction::Cast {
            dest,
            value: tv.value,
            from,
            to,
        });
        Ok(TypedValue {
            value: Value::Reg(dest),
            ty: target.clone(),
        })
    }

    /// Condition lowering: cast through Int, then to Bool by
    /// comparing against zero.
    fn to_bool(&mut self, ctx: &mut FnCtx, tv: TypedValue, span: Span) -> Result<Value> {
        let int = self.cast_value(ctx, tv, &ResolvedType::INT, span)?;
        let dest = ctx.reg();
        ctx.emit(Instruction::Cmp {
            dest,
            op: CmpKind::Ne,
            ty: IrType::I32,
            lhs: int.value,
            rhs: Value::Const(Constant::Int {
                value: 0,
                ty: IrType::I32,
            }),
        });
        Ok(Value::Reg(dest))
    }

    // ==================== Helpers ====================

    fn store_branch_result(
        &mut self,
        ctx: &mut FnCtx,
        slot: Option<Register>,
        value: Option<TypedValue>,
        node_ty: &ResolvedType,
        span: Span,
    ) -> Result<()> {
        let Some(slot) = slot else { return Ok(()) };
        let tv = value.ok_or_else(|| Error::Internal("valued branch produced no value".into()))?;
        let casted = self.cast_value(ctx, tv, node_ty, span)?;
        ctx.emit(Instruction::Store {
            ptr: Value::Reg(slot),
            value: casted.value,
            ty: IrType::from_resolved(node_ty),
        });
        Ok(())
    }

    fn function_resolution(&self, id: NodeId) -> Result<String> {
        match &self.unit.ast.node(id).res {
            Resolution::Function { mangled } => Ok(mangled.clone()),
            other => Err(Error::Internal(format!(
                "expected function resolution, got {:?}",
                other
            ))),
        }
    }

    fn callable(&self, mangled: &str, _span: Span) -> Result<Symbol> {
        self.unit
            .callables
            .get(mangled)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown callable {mangled}")))
    }

    /// Functions not defined in this unit become imported
    /// declarations under their final linkage name.
    fn ensure_callee(&mut self, symbol: &Symbol) {
        if self.defined.contains(&symbol.mangled) {
            return;
        }
        self.ensure_extern(symbol);
    }

    fn ensure_extern(&mut self, symbol: &Symbol) {
        if self.externs_seen.contains(&symbol.mangled) {
            return;
        }
        self.externs_seen.insert(symbol.mangled.clone());
        let params = symbol
            .param_types()
            .iter()
            .map(IrType::from_resolved)
            .collect();
        self.module.externs.push(IrExtern {
            name: symbol.mangled.clone(),
            params,
            ret: IrType::from_resolved(&symbol.ty),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::module::UnitManager;

    fn gen(source: &str) -> Result<IrModule> {
        let mut manager = UnitManager::new(Vec::new());
        let unit = manager.load_source(source, "test")?;
        generate(&unit)
    }

    fn count_calls(f: &IrFunction, pred: impl Fn(&str) -> bool) -> usize {
        f.blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i, Instruction::Call { func, .. } if pred(func)))
            .count()
    }

    #[test]
    fn test_function_generation() {
        let module = gen("FUNC Int i = add(Int a, Int b) DO RETURN a + b END").unwrap();
        let f = module.function("vdi_add_i_i").expect("mangled function");
        assert_eq!(f.linkage, Linkage::Exported);
        assert_eq!(f.ret, IrType::I32);
        assert!(f
            .blocks
            .iter()
            .all(|b| b.terminator.is_some() || b.instructions.is_empty()));
    }

    #[test]
    fn test_missing_return_is_fatal() {
        let err = gen("FUNC Int i = f(Int a) DO IF a < 0 THEN RETURN 0 END END").unwrap_err();
        assert!(matches!(err, Error::MalformedControlFlow { .. }));
    }

    #[test]
    fn test_both_branches_return_no_continuation() {
        let module =
            gen("FUNC Int i = f(Int a) DO IF a < 0 THEN RETURN 0 ELSE RETURN 1 END END").unwrap();
        let f = module.function("vdi_f_i").unwrap();
        assert!(
            !f.blocks.iter().any(|b| b.label == "endif"),
            "terminated IF must not build a continuation block"
        );
    }

    #[test]
    fn test_single_branch_return_has_continuation() {
        let module =
            gen("FUNC Int i = f(Int a) DO IF a < 0 THEN RETURN 0 END RETURN a END").unwrap();
        let f = module.function("vdi_f_i").unwrap();
        assert_eq!(
            f.blocks.iter().filter(|b| b.label == "endif").count(),
            1,
            "one continuation block reached from the non-returning branch"
        );
    }

    #[test]
    fn test_chain_operands_evaluated_once() {
        let module = gen(
            "FUNC Int i = a() DO RETURN 1 END \
             FUNC Int i = b() DO RETURN 2 END \
             FUNC Int i = c() DO RETURN 3 END \
             a() < b() < c()",
        )
        .unwrap();
        let wrapper = module
            .function(module.entries.last().unwrap())
            .expect("top-level wrapper");
        // a, b and c are each called exactly once even though b
        // participates in two comparisons
        assert_eq!(count_calls(wrapper, |f| f.starts_with("vdi_")), 3);
    }

    #[test]
    fn test_connectives_evaluate_both_operands() {
        let module = gen(
            "FUNC Int i = a() DO RETURN 1 END \
             FUNC Int i = b() DO RETURN 0 END \
             a() AND b()",
        )
        .unwrap();
        let wrapper = module.function(module.entries.last().unwrap()).unwrap();
        assert_eq!(count_calls(wrapper, |f| f.starts_with("vdi_")), 2);
        // No branching: the connective never short-circuits
        assert_eq!(wrapper.blocks.len(), 1);
    }

    #[test]
    fn test_global_initializer_in_root_init() {
        let module = gen("Int g = 41").unwrap();
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.globals[0].name, "vdi_g");
        let init = module.function(&module.init).expect("root init");
        let stores = init
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| {
                matches!(i, Instruction::Store { ptr: Value::Global(g), .. } if g == "vdi_g")
            })
            .count();
        assert_eq!(stores, 1);
    }

    #[test]
    fn test_top_level_value_is_printed() {
        let module = gen("1 + 2").unwrap();
        assert_eq!(module.entries.len(), 1);
        let wrapper = module.function(&module.entries[0]).unwrap();
        assert_eq!(count_calls(wrapper, |f| f == "veld_print_int"), 1);
    }

    #[test]
    fn test_constant_range_check() {
        assert!(gen("Int i = 300").is_ok());
        let err = gen("Byte b = 300").unwrap_err();
        assert!(matches!(err, Error::RangeOverflow { .. }));
    }

    #[test]
    fn test_constant_float_exactness() {
        assert!(gen("Double d = 16777217").is_ok());
        let err = gen("Float f = 16777217").unwrap_err();
        assert!(matches!(err, Error::RangeOverflow { .. }));
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let module = gen(
            "FUNC Int i = count(Int n) DO Int acc = 0 WHILE acc < n DO acc = acc + 1 END RETURN acc END",
        )
        .unwrap();
        let f = module.function("vdi_count_i").unwrap();
        let cond = f
            .blocks
            .iter()
            .find(|b| b.label == "while_cond")
            .expect("condition block");
        let body = f
            .blocks
            .iter()
            .find(|b| b.label == "while_body")
            .expect("body block");
        assert!(matches!(
            body.terminator,
            Some(Terminator::Jump(target)) if target == cond.id
        ));
    }

    #[test]
    fn test_struct_field_store() {
        let module = gen("STRUCT P DO Int x Double y END P p p.x = 3").unwrap();
        assert_eq!(module.structs.len(), 1);
        assert_eq!(module.structs[0].name, "vdT_P");
        let wrapper = module.function(module.entries.last().unwrap()).unwrap();
        let field_ptrs = wrapper
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i, Instruction::FieldPtr { index: 0, .. }))
            .count();
        assert!(field_ptrs >= 1);
    }

    #[test]
    fn test_imported_callee_declared_as_extern() {
        let module = gen(r#"FUNC Int r = puts(String s) EXTERN "puts" puts("hi")"#).unwrap();
        assert!(module.externs.iter().any(|e| e.name == "puts"));
    }

    #[test]
    fn test_if_expression_result_slot() {
        let module = gen("Int a = 1 Int r = IF a < 2 THEN 10 ELSE 20 END").unwrap();
        let init = module.function(&module.init).unwrap();
        // Both branches store into the result temporary
        let stores = init
            .blocks
            .iter()
            .filter(|b| b.label == "then" || b.label == "else")
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i, Instruction::Store { .. }))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn test_branch_local_shadowing_keeps_outer_slot() {
        let module =
            gen("FUNC Int i = f() DO Int x = 1 IF TRUE THEN Int x = 2 x = 3 END RETURN x END")
                .unwrap();
        let f = module.function("vdi_f").unwrap();
        // First alloca in the entry block is the outer x
        let outer_slot = f.blocks[0]
            .instructions
            .iter()
            .find_map(|i| match i {
                Instruction::Alloca { dest, .. } => Some(*dest),
                _ => None,
            })
            .expect("outer local slot");
        // The load feeding the return reads the outer slot, not the
        // branch-local one that shadowed it
        let ret_block = f
            .blocks
            .iter()
            .find(|b| matches!(b.terminator, Some(Terminator::Return(Some(_)))))
            .expect("returning block");
        let load_ptr = ret_block
            .instructions
            .iter()
            .find_map(|i| match i {
                Instruction::Load {
                    ptr: Value::Reg(p), ..
                } => Some(*p),
                _ => None,
            })
            .expect("load before return");
        assert_eq!(load_ptr, outer_slot);
    }

    #[test]
    fn test_argument_cast_to_parameter_type() {
        let module = gen(
            "FUNC Long l = f(Long a) DO RETURN a END \
             Int x = 1 \
             f(x)",
        )
        .unwrap();
        let wrapper = module.function(module.entries.last().unwrap()).unwrap();
        let casts = wrapper
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i, Instruction::Cast { to: IrType::I64, .. }))
            .count();
        assert!(casts >= 1, "Int argument widens to Long parameter");
    }
}
