//! Built-in functions and runtime support
//!
//! The built-in scope is the shared fallback consulted after the
//! ordinary scope stack. Every entry is a foreign-linkage function
//! bound to one of the `extern "C"` routines below, which the JIT
//! resolves by literal name.

use crate::frontend::semantic::{Scope, Symbol, SymbolKind};
use crate::types::{PrimitiveType, ResolvedType};
use crate::utils::Span;

fn builtin(name: &str, c_name: &str, params: Vec<(String, ResolvedType)>, ret: ResolvedType) -> Symbol {
    Symbol {
        name: name.to_string(),
        namespace: Vec::new(),
        kind: SymbolKind::Function {
            params,
            returns: Vec::new(),
            external: true,
        },
        ty: ret,
        mangled: c_name.to_string(),
        span: Span::dummy(),
    }
}

/// Build the shared built-in scope
pub fn builtin_scope() -> Scope {
    let mut scope = Scope::new();
    let entries = vec![
        builtin(
            "print",
            "veld_print_str",
            vec![("s".to_string(), ResolvedType::STR)],
            ResolvedType::VOID,
        ),
        builtin(
            "printInt",
            "veld_print_int",
            vec![("n".to_string(), ResolvedType::LONG)],
            ResolvedType::VOID,
        ),
        builtin(
            "printUint",
            "veld_print_uint",
            vec![(
                "n".to_string(),
                ResolvedType::prim(PrimitiveType::ULong),
            )],
            ResolvedType::VOID,
        ),
        builtin(
            "printFloat",
            "veld_print_float",
            vec![("x".to_string(), ResolvedType::DOUBLE)],
            ResolvedType::VOID,
        ),
        builtin(
            "printBool",
            "veld_print_bool",
            vec![("b".to_string(), ResolvedType::BOOL)],
            ResolvedType::VOID,
        ),
    ];
    for sym in entries {
        scope.define(sym).expect("builtin names are unique");
    }
    scope
}

/// The default output routine for a value of the given primitive type:
/// the runtime function name and the type the value is widened to
/// before the call. Used for top-level expression results.
pub fn default_output_routine(p: PrimitiveType) -> Option<(&'static str, PrimitiveType)> {
    use PrimitiveType::*;
    match p {
        SByte | Short | Int | Long => Some(("veld_print_int", Long)),
        Byte | UShort | UInt | ULong => Some(("veld_print_uint", ULong)),
        Float | Double => Some(("veld_print_float", Double)),
        Bool => Some(("veld_print_bool", Bool)),
        Str => Some(("veld_print_str", Str)),
        Void => None,
    }
}

/// Runtime routines linked into generated code. These are plain C ABI
/// functions; the JIT maps each builtin's literal name onto the
/// matching address before compilation.
pub mod runtime {
    use std::ffi::CStr;
    use std::os::raw::c_char;

    #[no_mangle]
    pub extern "C" fn veld_print_int(v: i64) {
        println!("{}", v);
    }

    #[no_mangle]
    pub extern "C" fn veld_print_uint(v: u64) {
        println!("{}", v);
    }

    #[no_mangle]
    pub extern "C" fn veld_print_float(v: f64) {
        println!("{}", v);
    }

    #[no_mangle]
    pub extern "C" fn veld_print_bool(v: u8) {
        println!("{}", if v != 0 { "TRUE" } else { "FALSE" });
    }

    /// # Safety
    /// `s` must be a valid NUL-terminated string; generated code only
    /// passes string constants emitted by the backend.
    #[no_mangle]
    pub unsafe extern "C" fn veld_print_str(s: *const c_char) {
        if s.is_null() {
            return;
        }
        let text = CStr::from_ptr(s).to_string_lossy();
        println!("{}", text);
    }

    /// Name/address pairs for JIT symbol registration
    pub fn symbol_table() -> Vec<(&'static str, usize)> {
        vec![
            ("veld_print_int", veld_print_int as usize),
            ("veld_print_uint", veld_print_uint as usize),
            ("veld_print_float", veld_print_float as usize),
            ("veld_print_bool", veld_print_bool as usize),
            ("veld_print_str", veld_print_str as *const () as usize),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_external_functions() {
        let scope = builtin_scope();
        let print = scope.get("print").unwrap();
        match &print.kind {
            SymbolKind::Function { external, .. } => assert!(*external),
            other => panic!("expected function, got {:?}", other),
        }
        assert_eq!(print.mangled, "veld_print_str");
    }

    #[test]
    fn test_output_routine_widens() {
        assert_eq!(
            default_output_routine(PrimitiveType::Short),
            Some(("veld_print_int", PrimitiveType::Long))
        );
        assert_eq!(default_output_routine(PrimitiveType::Void), None);
    }
}
