//! LLVM MCJIT backend

mod llvm_codegen;

pub use llvm_codegen::JitBackend;
