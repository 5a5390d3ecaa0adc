//! Type system and linkage naming

pub mod mangle;
pub mod type_system;

pub use type_system::{promote, PrimitiveType, ResolvedType, StructType, TypeKind};
