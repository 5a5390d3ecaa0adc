//! LLVM MCJIT backend
//!
//! Translates Veld IR into LLVM IR and compiles it in-process through
//! MCJIT. Runtime support routines are registered by literal name
//! before the execution engine is created, so generated code can call
//! straight into the host process.

use llvm_sys::analysis::*;
use llvm_sys::core::*;
use llvm_sys::execution_engine::*;
use llvm_sys::prelude::*;
use llvm_sys::support::LLVMAddSymbol;
use llvm_sys::target::{LLVM_InitializeNativeAsmPrinter, LLVM_InitializeNativeTarget};
use llvm_sys::{LLVMIntPredicate, LLVMRealPredicate};

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::Once;

use crate::backend::codegen::{EntryFn, NativeBackend};
use crate::middle::ir::*;
use crate::stdlib::builtins::runtime;
use crate::utils::{Error, Result};

/// LLVM-based JIT backend
pub struct JitBackend {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    engine: Option<LLVMExecutionEngineRef>,
    // Mapping from IR registers to LLVM values, per function
    value_map: HashMap<Register, LLVMValueRef>,
    // Mapping from block ids to LLVM basic blocks, per function
    block_map: HashMap<usize, LLVMBasicBlockRef>,
    current_function: Option<LLVMValueRef>,
}

impl JitBackend {
    pub fn new(name: &str) -> Self {
        unsafe {
            let context = LLVMContextCreate();
            let module_name = CString::new(name).unwrap();
            let module = LLVMModuleCreateWithNameInContext(module_name.as_ptr(), context);
            let builder = LLVMCreateBuilderInContext(context);
            Self {
                context,
                module,
                builder,
                engine: None,
                value_map: HashMap::new(),
                block_map: HashMap::new(),
                current_function: None,
            }
        }
    }

    fn ir_type_to_llvm(&self, ty: &IrType) -> Result<LLVMTypeRef> {
        unsafe {
            Ok(match ty {
                IrType::Void => LLVMVoidTypeInContext(self.context),
                IrType::Bool => LLVMInt1TypeInContext(self.context),
                IrType::I8 | IrType::U8 => LLVMInt8TypeInContext(self.context),
                IrType::I16 | IrType::U16 => LLVMInt16TypeInContext(self.context),
                IrType::I32 | IrType::U32 => LLVMInt32TypeInContext(self.context),
                IrType::I64 | IrType::U64 => LLVMInt64TypeInContext(self.context),
                IrType::F32 => LLVMFloatTypeInContext(self.context),
                IrType::F64 => LLVMDoubleTypeInContext(self.context),
                IrType::Ptr => LLVMPointerTypeInContext(self.context, 0),
                IrType::Struct(name) => {
                    let name_c = CString::new(name.as_str()).unwrap();
                    let existing = LLVMGetTypeByName2(self.context, name_c.as_ptr());
                    if existing.is_null() {
                        return Err(Error::BackendFailure(format!(
                            "struct {} not registered",
                            name
                        )));
                    }
                    existing
                }
            })
        }
    }

    fn declare_struct(&mut self, strukt: &IrStruct) -> Result<()> {
        unsafe {
            let name_c = CString::new(strukt.name.as_str()).unwrap();
            // A struct name is registered with the backend at most once
            if !LLVMGetTypeByName2(self.context, name_c.as_ptr()).is_null() {
                return Ok(());
            }
            let ty = LLVMStructCreateNamed(self.context, name_c.as_ptr());
            let mut fields: Vec<LLVMTypeRef> = Vec::new();
            for (_, fty) in &strukt.fields {
                fields.push(self.ir_type_to_llvm(fty)?);
            }
            LLVMStructSetBody(ty, fields.as_mut_ptr(), fields.len() as u32, 0);
            Ok(())
        }
    }

    fn declare_global(&mut self, global: &IrGlobal) -> Result<()> {
        unsafe {
            let name_c = CString::new(global.name.as_str()).unwrap();
            if !LLVMGetNamedGlobal(self.module, name_c.as_ptr()).is_null() {
                return Ok(());
            }
            let ty = self.ir_type_to_llvm(&global.ty)?;
            let g = LLVMAddGlobal(self.module, ty, name_c.as_ptr());
            // Zero-initialized; the root init function runs the real
            // initializer stores before any other entry point.
            LLVMSetInitializer(g, LLVMConstNull(ty));
            Ok(())
        }
    }

    fn declare_function(
        &mut self,
        name: &str,
        params: &[IrType],
        ret: &IrType,
    ) -> Result<LLVMValueRef> {
        unsafe {
            let name_c = CString::new(name).unwrap();
            let existing = LLVMGetNamedFunction(self.module, name_c.as_ptr());
            if !existing.is_null() {
                return Ok(existing);
            }
            let ret_ty = self.ir_type_to_llvm(ret)?;
            let mut param_tys: Vec<LLVMTypeRef> = Vec::new();
            for p in params {
                param_tys.push(self.ir_type_to_llvm(p)?);
            }
            let fn_ty = LLVMFunctionType(
                ret_ty,
                param_tys.as_mut_ptr(),
                param_tys.len() as u32,
                0, // not variadic
            );
            Ok(LLVMAddFunction(self.module, name_c.as_ptr(), fn_ty))
        }
    }

    fn lower_function(&mut self, func: &IrFunction) -> Result<()> {
        let param_tys: Vec<IrType> = func.params.iter().map(|(_, t)| t.clone()).collect();
        let llvm_func = self.declare_function(&func.name, &param_tys, &func.ret)?;
        self.current_function = Some(llvm_func);
        self.value_map.clear();
        self.block_map.clear();

        unsafe {
            for block in &func.blocks {
                let label = CString::new(block.label.as_str()).unwrap();
                let bb = LLVMAppendBasicBlockInContext(self.context, llvm_func, label.as_ptr());
                self.block_map.insert(block.id.0, bb);
            }

            for block in &func.blocks {
                let bb = self.block_map[&block.id.0];
                LLVMPositionBuilderAtEnd(self.builder, bb);
                for inst in &block.instructions {
                    self.lower_instruction(inst)?;
                }
                match &block.terminator {
                    Some(term) => self.lower_terminator(term)?,
                    // The generator terminates every reachable block;
                    // anything left is dead.
                    None => {
                        LLVMBuildUnreachable(self.builder);
                    }
                }
            }
        }

        self.current_function = None;
        Ok(())
    }

    fn lower_instruction(&mut self, inst: &Instruction) -> Result<()> {
        let empty = CString::new("").unwrap();
        unsafe {
            match inst {
                Instruction::Alloca { dest, ty } => {
                    let llvm_ty = self.ir_type_to_llvm(ty)?;
                    let v = LLVMBuildAlloca(self.builder, llvm_ty, empty.as_ptr());
                    self.value_map.insert(*dest, v);
                }
                Instruction::Load { dest, ptr, ty } => {
                    let p = self.get_value(ptr)?;
                    let llvm_ty = self.ir_type_to_llvm(ty)?;
                    let v = LLVMBuildLoad2(self.builder, llvm_ty, p, empty.as_ptr());
                    self.value_map.insert(*dest, v);
                }
                Instruction::Store { ptr, value, .. } => {
                    let p = self.get_value(ptr)?;
                    let v = self.get_value(value)?;
                    LLVMBuildStore(self.builder, v, p);
                }
                Instruction::Bin {
                    dest,
                    op,
                    ty,
                    lhs,
                    rhs,
                } => {
                    let l = self.get_value(lhs)?;
                    let r = self.get_value(rhs)?;
                    let v = self.lower_bin(*op, ty, l, r);
                    self.value_map.insert(*dest, v);
                }
                Instruction::Cmp {
                    dest,
                    op,
                    ty,
                    lhs,
                    rhs,
                } => {
                    let l = self.get_value(lhs)?;
                    let r = self.get_value(rhs)?;
                    let v = self.lower_cmp(*op, ty, l, r);
                    self.value_map.insert(*dest, v);
                }
                Instruction::Neg { dest, ty, value } => {
                    let v = self.get_value(value)?;
                    let out = if ty.is_float() {
                        LLVMBuildFNeg(self.builder, v, empty.as_ptr())
                    } else {
                        LLVMBuildNeg(self.builder, v, empty.as_ptr())
                    };
                    self.value_map.insert(*dest, out);
                }
                Instruction::Not { dest, value } => {
                    let v = self.get_value(value)?;
                    let out = LLVMBuildNot(self.builder, v, empty.as_ptr());
                    self.value_map.insert(*dest, out);
                }
                Instruction::Cast {
                    dest,
                    value,
                    from,
                    to,
                } => {
                    let v = self.get_value(value)?;
                    let out = self.lower_cast(v, from, to)?;
                    self.value_map.insert(*dest, out);
                }
                Instruction::FieldPtr {
                    dest,
                    base,
                    strukt,
                    index,
                } => {
                    let b = self.get_value(base)?;
                    let struct_ty = self.ir_type_to_llvm(&IrType::Struct(strukt.clone()))?;
                    let v =
                        LLVMBuildStructGEP2(self.builder, struct_ty, b, *index, empty.as_ptr());
                    self.value_map.insert(*dest, v);
                }
                Instruction::Call { dest, func, args } => {
                    let name_c = CString::new(func.as_str()).unwrap();
                    let callee = LLVMGetNamedFunction(self.module, name_c.as_ptr());
                    if callee.is_null() {
                        return Err(Error::BackendFailure(format!("unknown function {}", func)));
                    }
                    let fn_ty = LLVMGlobalGetValueType(callee);
                    let mut argv: Vec<LLVMValueRef> = Vec::new();
                    for a in args {
                        argv.push(self.get_value(a)?);
                    }
                    let is_void = LLVMGetTypeKind(LLVMGetReturnType(fn_ty))
                        == llvm_sys::LLVMTypeKind::LLVMVoidTypeKind;
                    let call_name = if is_void {
                        CString::new("").unwrap()
                    } else {
                        CString::new("call").unwrap()
                    };
                    let v = LLVMBuildCall2(
                        self.builder,
                        fn_ty,
                        callee,
                        argv.as_mut_ptr(),
                        argv.len() as u32,
                        call_name.as_ptr(),
                    );
                    if let Some(d) = dest {
                        if !is_void {
                            self.value_map.insert(*d, v);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn lower_bin(
        &mut self,
        op: BinAri,
        ty: &IrType,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
    ) -> LLVMValueRef {
        let empty = CString::new("").unwrap();
        unsafe {
            if ty.is_float() {
                match op {
                    BinAri::Add => LLVMBuildFAdd(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Sub => LLVMBuildFSub(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Mul => LLVMBuildFMul(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Div => LLVMBuildFDiv(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Rem => LLVMBuildFRem(self.builder, lhs, rhs, empty.as_ptr()),
                    // And/Or/Xor never see float operands
                    BinAri::And | BinAri::Or | BinAri::Xor => {
                        LLVMBuildAnd(self.builder, lhs, rhs, empty.as_ptr())
                    }
                }
            } else {
                match op {
                    BinAri::Add => LLVMBuildAdd(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Sub => LLVMBuildSub(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Mul => LLVMBuildMul(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Div => {
                        if ty.is_signed_int() {
                            LLVMBuildSDiv(self.builder, lhs, rhs, empty.as_ptr())
                        } else {
                            LLVMBuildUDiv(self.builder, lhs, rhs, empty.as_ptr())
                        }
                    }
                    BinAri::Rem => {
                        if ty.is_signed_int() {
                            LLVMBuildSRem(self.builder, lhs, rhs, empty.as_ptr())
                        } else {
                            LLVMBuildURem(self.builder, lhs, rhs, empty.as_ptr())
                        }
                    }
                    BinAri::And => LLVMBuildAnd(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Or => LLVMBuildOr(self.builder, lhs, rhs, empty.as_ptr()),
                    BinAri::Xor => LLVMBuildXor(self.builder, lhs, rhs, empty.as_ptr()),
                }
            }
        }
    }

    fn lower_cmp(
        &mut self,
        op: CmpKind,
        ty: &IrType,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
    ) -> LLVMValueRef {
        let empty = CString::new("").unwrap();
        unsafe {
            if ty.is_float() {
                let pred = match op {
                    CmpKind::Eq => LLVMRealPredicate::LLVMRealOEQ,
                    CmpKind::Ne => LLVMRealPredicate::LLVMRealONE,
                    CmpKind::Lt => LLVMRealPredicate::LLVMRealOLT,
                    CmpKind::Le => LLVMRealPredicate::LLVMRealOLE,
                    CmpKind::Gt => LLVMRealPredicate::LLVMRealOGT,
                    CmpKind::Ge => LLVMRealPredicate::LLVMRealOGE,
                };
                LLVMBuildFCmp(self.builder, pred, lhs, rhs, empty.as_ptr())
            } else {
                let signed = ty.is_signed_int();
                let pred = match (op, signed) {
                    (CmpKind::Eq, _) => LLVMIntPredicate::LLVMIntEQ,
                    (CmpKind::Ne, _) => LLVMIntPredicate::LLVMIntNE,
                    (CmpKind::Lt, true) => LLVMIntPredicate::LLVMIntSLT,
                    (CmpKind::Lt, false) => LLVMIntPredicate::LLVMIntULT,
                    (CmpKind::Le, true) => LLVMIntPredicate::LLVMIntSLE,
                    (CmpKind::Le, false) => LLVMIntPredicate::LLVMIntULE,
                    (CmpKind::Gt, true) => LLVMIntPredicate::LLVMIntSGT,
                    (CmpKind::Gt, false) => LLVMIntPredicate::LLVMIntUGT,
                    (CmpKind::Ge, true) => LLVMIntPredicate::LLVMIntSGE,
                    (CmpKind::Ge, false) => LLVMIntPredicate::LLVMIntUGE,
                };
                LLVMBuildICmp(self.builder, pred, lhs, rhs, empty.as_ptr())
            }
        }
    }

    fn lower_cast(&mut self, v: LLVMValueRef, from: &IrType, to: &IrType) -> Result<LLVMValueRef> {
        let empty = CString::new("").unwrap();
        let to_ty = self.ir_type_to_llvm(to)?;
        unsafe {
            let out = match (from, to) {
                (f, t) if f == t => v,
                // Integer to integer: width decides, source signedness
                // picks the extension
                (f, t) if f.int_bits() > 0 && t.int_bits() > 0 => {
                    let fb = f.int_bits();
                    let tb = t.int_bits();
                    if tb < fb {
                        LLVMBuildTrunc(self.builder, v, to_ty, empty.as_ptr())
                    } else if tb > fb {
                        if f.is_signed_int() {
                            LLVMBuildSExt(self.builder, v, to_ty, empty.as_ptr())
                        } else {
                            LLVMBuildZExt(self.builder, v, to_ty, empty.as_ptr())
                        }
                    } else {
                        // Same width, signedness reinterpreted
                        v
                    }
                }
                (f, t) if f.int_bits() > 0 && t.is_float() => {
                    if f.is_signed_int() {
                        LLVMBuildSIToFP(self.builder, v, to_ty, empty.as_ptr())
                    } else {
                        LLVMBuildUIToFP(self.builder, v, to_ty, empty.as_ptr())
                    }
                }
                (f, t) if f.is_float() && t.int_bits() > 0 => {
                    if t.is_signed_int() {
                        LLVMBuildFPToSI(self.builder, v, to_ty, empty.as_ptr())
                    } else {
                        LLVMBuildFPToUI(self.builder, v, to_ty, empty.as_ptr())
                    }
                }
                (IrType::F32, IrType::F64) => {
                    LLVMBuildFPExt(self.builder, v, to_ty, empty.as_ptr())
                }
                (IrType::F64, IrType::F32) => {
                    LLVMBuildFPTrunc(self.builder, v, to_ty, empty.as_ptr())
                }
                (IrType::Ptr, t) if t.int_bits() > 0 => {
                    LLVMBuildPtrToInt(self.builder, v, to_ty, empty.as_ptr())
                }
                (f, IrType::Ptr) if f.int_bits() > 0 => {
                    LLVMBuildIntToPtr(self.builder, v, to_ty, empty.as_ptr())
                }
                _ => LLVMBuildBitCast(self.builder, v, to_ty, empty.as_ptr()),
            };
            Ok(out)
        }
    }

    fn lower_terminator(&mut self, term: &Terminator) -> Result<()> {
        unsafe {
            match term {
                Terminator::Return(Some(v)) => {
                    let val = self.get_value(v)?;
                    LLVMBuildRet(self.builder, val);
                }
                Terminator::Return(None) => {
                    LLVMBuildRetVoid(self.builder);
                }
                Terminator::Jump(target) => {
                    let bb = self.block_map[&target.0];
                    LLVMBuildBr(self.builder, bb);
                }
                Terminator::Branch {
                    cond,
                    then_to,
                    else_to,
                } => {
                    let c = self.get_value(cond)?;
                    let then_bb = self.block_map[&then_to.0];
                    let else_bb = self.block_map[&else_to.0];
                    LLVMBuildCondBr(self.builder, c, then_bb, else_bb);
                }
                Terminator::Unreachable => {
                    LLVMBuildUnreachable(self.builder);
                }
            }
        }
        Ok(())
    }

    fn get_value(&mut self, val: &Value) -> Result<LLVMValueRef> {
        unsafe {
            match val {
                Value::Reg(r) => self
                    .value_map
                    .get(r)
                    .copied()
                    .ok_or_else(|| Error::BackendFailure(format!("unknown register {}", r))),
                Value::Param(i) => {
                    let func = self.current_function.ok_or_else(|| {
                        Error::BackendFailure("parameter outside a function".into())
                    })?;
                    Ok(LLVMGetParam(func, *i as u32))
                }
                Value::Global(name) => {
                    let name_c = CString::new(name.as_str()).unwrap();
                    let g = LLVMGetNamedGlobal(self.module, name_c.as_ptr());
                    if g.is_null() {
                        Err(Error::BackendFailure(format!("unknown global {}", name)))
                    } else {
                        Ok(g)
                    }
                }
                Value::Const(c) => self.lower_constant(c),
                Value::Unit => Err(Error::BackendFailure("void value materialized".into())),
            }
        }
    }

    fn lower_constant(&mut self, c: &Constant) -> Result<LLVMValueRef> {
        unsafe {
            Ok(match c {
                Constant::Int { value, ty } => {
                    let llvm_ty = self.ir_type_to_llvm(ty)?;
                    let sign_extend = if ty.is_signed_int() { 1 } else { 0 };
                    LLVMConstInt(llvm_ty, *value as u64, sign_extend)
                }
                Constant::Float { value, ty } => {
                    let llvm_ty = self.ir_type_to_llvm(ty)?;
                    LLVMConstReal(llvm_ty, *value)
                }
                Constant::Bool(b) => {
                    let i1 = LLVMInt1TypeInContext(self.context);
                    LLVMConstInt(i1, *b as u64, 0)
                }
                Constant::Str(s) => {
                    let clean: String = s.chars().filter(|&c| c != '\0').collect();
                    let s_c = CString::new(clean).unwrap();
                    let name_c = CString::new("str").unwrap();
                    LLVMBuildGlobalStringPtr(self.builder, s_c.as_ptr(), name_c.as_ptr())
                }
            })
        }
    }

    fn verify_module(&self) -> Result<()> {
        unsafe {
            let mut error_msg: *mut i8 = ptr::null_mut();
            let failed = LLVMVerifyModule(
                self.module,
                LLVMVerifierFailureAction::LLVMReturnStatusAction,
                &mut error_msg,
            );
            if failed != 0 {
                let msg = if error_msg.is_null() {
                    "unknown verification error".to_string()
                } else {
                    let m = CStr::from_ptr(error_msg).to_string_lossy().to_string();
                    LLVMDisposeMessage(error_msg);
                    m
                };
                return Err(Error::BackendFailure(msg));
            }
        }
        Ok(())
    }

    /// Print the LLVM IR to a string (for debugging)
    pub fn print_ir(&self) -> String {
        unsafe {
            let c_str = LLVMPrintModuleToString(self.module);
            let result = CStr::from_ptr(c_str).to_string_lossy().to_string();
            LLVMDisposeMessage(c_str);
            result
        }
    }
}

impl NativeBackend for JitBackend {
    fn lower(&mut self, module: &IrModule) -> Result<()> {
        for s in &module.structs {
            self.declare_struct(s)?;
        }
        for g in &module.globals {
            self.declare_global(g)?;
        }
        for e in &module.externs {
            self.declare_function(&e.name, &e.params, &e.ret)?;
        }
        for f in &module.functions {
            self.lower_function(f)?;
        }
        log::debug!("lowered unit {} into LLVM module", module.name);
        Ok(())
    }

    fn compile(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        self.verify_module()?;

        // Target initialization and runtime symbol registration are
        // process-wide and must run exactly once.
        static INIT: Once = Once::new();
        let mut init_failed = false;
        INIT.call_once(|| unsafe {
            LLVMLinkInMCJIT();
            if LLVM_InitializeNativeTarget() != 0 || LLVM_InitializeNativeAsmPrinter() != 0 {
                init_failed = true;
                return;
            }
            // Bind the runtime support routines by literal name
            for (name, addr) in runtime::symbol_table() {
                let name_c = CString::new(name).unwrap();
                LLVMAddSymbol(name_c.as_ptr(), addr as *mut std::ffi::c_void);
            }
        });
        if init_failed {
            return Err(Error::BackendFailure("no native JIT target".into()));
        }

        unsafe {

            let mut engine: LLVMExecutionEngineRef = ptr::null_mut();
            let mut error_msg: *mut i8 = ptr::null_mut();
            if LLVMCreateExecutionEngineForModule(&mut engine, self.module, &mut error_msg) != 0 {
                let msg = if error_msg.is_null() {
                    "failed to create execution engine".to_string()
                } else {
                    let m = CStr::from_ptr(error_msg).to_string_lossy().to_string();
                    LLVMDisposeMessage(error_msg);
                    m
                };
                return Err(Error::BackendFailure(msg));
            }
            self.engine = Some(engine);
        }
        log::debug!("JIT compilation complete");
        Ok(())
    }

    fn entry_point(&self, name: &str) -> Option<EntryFn> {
        let engine = self.engine?;
        unsafe {
            let name_c = CString::new(name).ok()?;
            let addr = LLVMGetFunctionAddress(engine, name_c.as_ptr());
            if addr == 0 {
                None
            } else {
                Some(std::mem::transmute::<u64, EntryFn>(addr))
            }
        }
    }

    fn dump_ir(&self, path: &Path) -> Result<()> {
        unsafe {
            let path_c = CString::new(path.to_string_lossy().as_bytes())
                .map_err(|e| Error::Io(e.to_string()))?;
            let mut error_msg: *mut i8 = ptr::null_mut();
            if LLVMPrintModuleToFile(self.module, path_c.as_ptr(), &mut error_msg) != 0 {
                let msg = if error_msg.is_null() {
                    "failed to write IR".to_string()
                } else {
                    let m = CStr::from_ptr(error_msg).to_string_lossy().to_string();
                    LLVMDisposeMessage(error_msg);
                    m
                };
                return Err(Error::BackendFailure(msg));
            }
        }
        Ok(())
    }
}

impl Drop for JitBackend {
    fn drop(&mut self) {
        unsafe {
            LLVMDisposeBuilder(self.builder);
            match self.engine {
                // The engine owns the module
                Some(engine) => LLVMDisposeExecutionEngine(engine),
                None => LLVMDisposeModule(self.module),
            }
            LLVMContextDispose(self.context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::module::UnitManager;
    use crate::middle::ir_gen::generate;

    fn jit(source: &str) -> (JitBackend, IrModule) {
        let mut manager = UnitManager::new(Vec::new());
        let unit = manager.load_source(source, "test").expect("resolve");
        let module = generate(&unit).expect("generate");
        let mut backend = JitBackend::new("test");
        backend.lower(&module).expect("lower");
        backend.compile().expect("compile");
        (backend, module)
    }

    #[test]
    fn test_add_executes() {
        let (backend, _) = jit("FUNC Int i = add(Int a, Int b) DO RETURN a + b END");
        let entry = backend.entry_point("vdi_add_i_i").expect("entry point");
        let add: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(add(2, 3), 5);
    }

    #[test]
    fn test_top_level_call_prints_five() {
        // The end-to-end contract: defining add and calling it at top
        // level produces an entry that prints 5 through the default
        // output routine.
        let (backend, module) =
            jit("FUNC Int i = add(Int a, Int b) DO RETURN a + b END add(2, 3)");
        assert_eq!(module.entries.len(), 1);
        let init = backend.entry_point(&module.init).expect("init");
        let entry = backend.entry_point(&module.entries[0]).expect("entry");
        unsafe {
            init();
            entry();
        }
    }

    #[test]
    fn test_global_initializer_runs_first() {
        let (backend, module) = jit(
            "Long counter = 40 \
             FUNC Long l = bump() DO counter = counter + 2 RETURN counter END",
        );
        let init = backend.entry_point(&module.init).expect("init");
        unsafe { init() };
        let entry = backend.entry_point("vdl_bump").expect("bump");
        let bump: extern "C" fn() -> i64 = unsafe { std::mem::transmute(entry) };
        assert_eq!(bump(), 42);
    }

    #[test]
    fn test_struct_field_round_trip() {
        let (backend, module) = jit(
            "STRUCT P DO Int x Double y END \
             P p \
             FUNC Int i = getx() DO RETURN p.x END \
             p.x = 41",
        );
        let init = backend.entry_point(&module.init).expect("init");
        let assign = backend.entry_point(&module.entries[0]).expect("assign");
        unsafe {
            init();
            assign();
        }
        let entry = backend.entry_point("vdi_getx").expect("getx");
        let getx: extern "C" fn() -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(getx(), 41);
    }

    #[test]
    fn test_while_loop_executes() {
        let (backend, _) = jit(
            "FUNC Int i = sum(Int n) DO \
               Int acc = 0 \
               Int k = 0 \
               WHILE k < n DO \
                 acc = acc + k \
                 k = k + 1 \
               END \
               RETURN acc \
             END",
        );
        let entry = backend.entry_point("vdi_sum_i").expect("sum");
        let sum: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(sum(5), 10);
    }

    #[test]
    fn test_branch_local_shadowing_executes() {
        let (backend, _) = jit(
            "FUNC Int i = f() DO Int x = 1 IF TRUE THEN Int x = 2 x = x + 1 END RETURN x END",
        );
        let entry = backend.entry_point("vdi_f").expect("f");
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 1);
    }

    #[test]
    fn test_chained_comparison_executes() {
        let (backend, _) = jit(
            "FUNC Bool o = between(Int lo, Int x, Int hi) DO RETURN lo < x < hi END",
        );
        let entry = backend.entry_point("vdo_between_i_i_i").expect("between");
        let between: extern "C" fn(i32, i32, i32) -> bool = unsafe { std::mem::transmute(entry) };
        assert!(between(1, 2, 3));
        assert!(!between(1, 5, 3));
    }
}
