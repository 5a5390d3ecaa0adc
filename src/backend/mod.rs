//! Native code generation backends

pub mod codegen;
#[cfg(feature = "llvm")]
pub mod llvm;
