//! Native backend abstraction
//!
//! The compiler core emits Veld IR; a backend turns lowered modules
//! into executable machine code and hands back callable entry points.

use std::path::Path;

use crate::middle::ir::IrModule;
use crate::utils::Result;

/// A native entry point of a generated zero-argument function
pub type EntryFn = unsafe extern "C" fn();

/// Native code generation service
pub trait NativeBackend {
    /// Lower one IR module into the backend's compilation context.
    /// Units must be lowered in dependency order (imports first).
    fn lower(&mut self, module: &IrModule) -> Result<()>;

    /// Compile everything lowered so far to executable machine code
    fn compile(&mut self) -> Result<()>;

    /// Native address of a generated function, by linkage name.
    /// Only valid after `compile`.
    fn entry_point(&self, name: &str) -> Option<EntryFn>;

    /// Write the backend's intermediate representation to a file
    fn dump_ir(&self, path: &Path) -> Result<()>;
}
