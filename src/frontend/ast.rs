//! Abstract Syntax Tree for Veld
//!
//! Nodes live in a per-unit arena and reference each other through
//! stable `NodeId` handles. Adjacent links of a chained comparison
//! share their boundary operand handle, so the shared operand is one
//! node reached from two places rather than an owned duplicate.
#![allow(dead_code)]

use crate::types::ResolvedType;
use crate::utils::Span;

/// Handle of a node inside its unit's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// The node arena of one compilation unit
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn alloc(&mut self, kind: NodeKind, span: Span) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            span,
            ty: ResolvedType::INVALID,
            res: Resolution::Unresolved,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Resolved type annotation of a node
    pub fn ty(&self, id: NodeId) -> &ResolvedType {
        &self.node(id).ty
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One AST node: its variant, its source position and the two
/// annotations written by the resolver (value type and resolution).
/// Annotations are written exactly once and are read-only during code
/// generation.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub ty: ResolvedType,
    pub res: Resolution,
}

/// How a reference node was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Unresolved,
    /// A variable in the enclosing function scope
    Local,
    /// A unit-level variable, addressed by its mangled name
    Global { mangled: String },
    /// A function, addressed by its final linkage name
    Function { mangled: String },
    /// A dot node resolved as struct field access
    Field { index: u32 },
    /// A dot/ref node that is only a namespace prefix, carrying no
    /// value of its own
    Namespace { path: Vec<String> },
}

/// Binary operators (arithmetic and boolean connectives)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Xnor,
}

impl BinOp {
    /// The boolean connectives, which evaluate both operands
    pub fn is_connective(&self) -> bool {
        matches!(
            self,
            Self::And | Self::Or | Self::Xor | Self::Nand | Self::Nor | Self::Xnor
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A named type as written in source, possibly namespace-qualified,
/// with a pointer indirection count.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRef {
    pub namespace: Vec<String>,
    pub name: String,
    pub indirection: u8,
    pub span: Span,
}

/// A `Type name` pair inside a parameter or return list
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub ty: TypeRef,
    pub name: String,
    pub span: Span,
}

/// A function header: name, parameters and the (possibly empty)
/// named return list.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSig {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub returns: Vec<ParamDecl>,
}

/// One link of a chained comparison. `lhs` of link N is the same
/// handle as `rhs` of link N-1.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub op: CmpOp,
    pub lhs: NodeId,
    pub rhs: NodeId,
}

/// The closed set of node variants
#[derive(Debug, Clone)]
pub enum NodeKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    BoolLit(bool),
    VarRef {
        name: String,
    },
    Binary {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Unary {
        op: UnOp,
        operand: NodeId,
    },
    Compare {
        op: CmpOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Chain {
        links: Vec<ChainLink>,
    },
    Assign {
        target: NodeId,
        value: NodeId,
    },
    Dot {
        base: NodeId,
        field: String,
    },
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    /// Bodyless function header: an externally linked function
    FuncDecl {
        sig: FuncSig,
        /// Foreign linkage name; bypasses mangling when present
        extern_name: Option<String>,
    },
    FuncDef {
        sig: FuncSig,
        body: Vec<NodeId>,
    },
    If {
        cond: NodeId,
        then_body: Vec<NodeId>,
        else_body: Vec<NodeId>,
    },
    While {
        cond: NodeId,
        body: Vec<NodeId>,
        else_body: Vec<NodeId>,
    },
    Block {
        body: Vec<NodeId>,
    },
    VarDef {
        ty: TypeRef,
        name: String,
        init: Option<NodeId>,
    },
    StructDef {
        name: String,
        fields: Vec<(TypeRef, String)>,
    },
    TypeDef {
        name: String,
        target: TypeRef,
    },
    Using {
        path: Vec<String>,
    },
    Return {
        value: Option<NodeId>,
    },
}
