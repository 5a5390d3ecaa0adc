//! External linkage names
//!
//! Every function and namespaced variable gets one deterministic name
//! computed from its namespace, name and signature. The name is the
//! only binding contract between independently generated units, so
//! distinct signatures must always produce distinct names and the same
//! signature must produce the same name on every run.

use crate::types::type_system::{PrimitiveType, ResolvedType, TypeKind};

/// Fixed prefix on every mangled name
const PREFIX: &str = "vd";

/// Single-letter code for a primitive type. Void encodes as nothing.
fn prim_code(p: PrimitiveType) -> &'static str {
    use PrimitiveType::*;
    match p {
        SByte => "a",
        Short => "s",
        Int => "i",
        Long => "l",
        Byte => "b",
        UShort => "h",
        UInt => "u",
        ULong => "q",
        Float => "f",
        Double => "d",
        Bool => "o",
        Str => "t",
        Void => "",
    }
}

/// Encode one type: its short code followed by one `p` per pointer
/// indirection. Struct types encode as their own mangled name wrapped
/// in `S...S`.
pub fn type_code(ty: &ResolvedType) -> String {
    let base = match &ty.kind {
        TypeKind::Primitive(p) => prim_code(*p).to_string(),
        TypeKind::Struct(s) => format!("S{}S", s.mangled),
        TypeKind::Invalid => "?".to_string(),
    };
    format!("{}{}", base, "p".repeat(ty.indirection as usize))
}

/// Double every underscore so a single `_` stays an unambiguous
/// delimiter between name and parameter blocks.
fn escape(name: &str) -> String {
    name.replace('_', "__")
}

/// One `N...N` block per namespace segment, dots removed by
/// construction (segments never contain dots).
fn namespace_blocks(namespace: &[String]) -> String {
    namespace
        .iter()
        .map(|seg| format!("N{}N", escape(seg)))
        .collect()
}

/// Mangled name of a function from its full signature.
pub fn function(
    namespace: &[String],
    name: &str,
    params: &[ResolvedType],
    ret: &ResolvedType,
) -> String {
    let mut out = String::from(PREFIX);
    out.push_str(&type_code(ret));
    out.push_str(&namespace_blocks(namespace));
    out.push('_');
    out.push_str(&escape(name));
    for p in params {
        out.push('_');
        out.push_str(&type_code(p));
    }
    out
}

/// Mangled name of a namespaced (global) variable.
pub fn variable(namespace: &[String], name: &str, ty: &ResolvedType) -> String {
    let mut out = String::from(PREFIX);
    out.push_str(&type_code(ty));
    out.push_str(&namespace_blocks(namespace));
    out.push('_');
    out.push_str(&escape(name));
    out
}

/// Mangled name a struct type is registered under with the backend.
pub fn struct_type(namespace: &[String], name: &str) -> String {
    format!("{}T{}_{}", PREFIX, namespace_blocks(namespace), escape(name))
}

/// Name of the per-unit root initializer function.
pub fn root_init(namespace: &[String]) -> String {
    format!("{}{}__init", PREFIX, namespace_blocks(namespace))
}

/// Name of the synthesized wrapper for the n-th top-level expression
/// of a unit.
pub fn top_level(namespace: &[String], index: usize) -> String {
    format!("{}{}__top{}", PREFIX, namespace_blocks(namespace), index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn int() -> ResolvedType {
        ResolvedType::INT
    }
    fn long() -> ResolvedType {
        ResolvedType::LONG
    }

    #[test]
    fn test_function_shape() {
        let m = function(&[], "add", &[int(), int()], &int());
        assert_eq!(m, "vdi_add_i_i");
    }

    #[test]
    fn test_void_return_encodes_empty() {
        let m = function(&[], "emit", &[long()], &ResolvedType::VOID);
        assert_eq!(m, "vd_emit_l");
    }

    #[test]
    fn test_namespace_blocks() {
        let ns = vec!["math".to_string(), "vec".to_string()];
        let m = function(&ns, "dot", &[], &ResolvedType::DOUBLE);
        assert_eq!(m, "vddNmathNNvecN_dot");
    }

    #[test]
    fn test_underscores_doubled() {
        let m = variable(&["my_ns".to_string()], "a_b", &int());
        assert_eq!(m, "vdiNmy__nsN_a__b");
    }

    #[test]
    fn test_pointer_letters() {
        let mut t = int();
        t.indirection = 2;
        assert_eq!(type_code(&t), "ipp");
    }

    #[test]
    fn test_injectivity() {
        // Pairwise distinct across name/namespace/params/return
        // variations, including the delimiter-collision cases.
        let sigs: Vec<String> = vec![
            function(&[], "add", &[int(), int()], &int()),
            function(&[], "add", &[int()], &int()),
            function(&[], "add", &[long(), int()], &int()),
            function(&[], "add", &[int(), int()], &long()),
            function(&[], "add", &[int(), int()], &ResolvedType::VOID),
            function(&["m".into()], "add", &[int(), int()], &int()),
            function(&[], "add_i", &[int()], &int()),
            function(&[], "addi", &[int()], &int()),
            variable(&[], "add", &int()),
            struct_type(&[], "add"),
        ];
        let unique: HashSet<&String> = sigs.iter().collect();
        assert_eq!(unique.len(), sigs.len(), "collision in {:?}", sigs);
    }

    #[test]
    fn test_stability() {
        let a = function(&["m".into()], "f", &[int()], &long());
        let b = function(&["m".into()], "f", &[int()], &long());
        assert_eq!(a, b);
    }
}
