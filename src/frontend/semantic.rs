//! Semantic Analysis for Veld
//!
//! Performs:
//! - Symbol table management (scopes, definitions)
//! - Type resolution and annotation of every AST node
//! - Namespace/import linking through the unit manager
//!
//! Resolution runs exactly once per node, in a single pass, and writes
//! the node's value type and resolution into the arena. Code
//! generation reads those annotations and never resolves names again.
#![allow(dead_code)]

use indexmap::IndexMap;

use crate::frontend::ast::{
    Ast, ChainLink, FuncSig, NodeId, NodeKind, ParamDecl, Resolution, TypeRef, UnOp,
};
use crate::frontend::module::{CompilationUnit, UnitManager};
use crate::stdlib::builtins;
use crate::types::{mangle, promote, PrimitiveType, ResolvedType, StructType};
use crate::utils::{Error, Result, Span};

// ==================== Symbols ====================

/// Kind of symbol
#[derive(Debug, Clone)]
pub enum SymbolKind {
    /// A primitive-typed variable
    Variable,
    /// A struct-typed variable
    StructVariable,
    Function {
        /// Cloned parameter list: name and resolved type
        params: Vec<(String, ResolvedType)>,
        /// Cloned return list (empty for void)
        returns: Vec<(String, ResolvedType)>,
        /// Foreign linkage: the mangled field holds the literal name
        external: bool,
    },
}

/// A resolved, storage-independent description of a declared name.
/// One authoritative instance lives in the innermost scope that
/// declared it; the backend function handle for a function symbol is
/// keyed by the same mangled name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub namespace: Vec<String>,
    pub kind: SymbolKind,
    /// Value type; for functions, the return type
    pub ty: ResolvedType,
    /// External linkage name, computed once at resolution time
    pub mangled: String,
    pub span: Span,
}

impl Symbol {
    pub fn variable(name: &str, ty: ResolvedType, mangled: String, span: Span) -> Self {
        let kind = if ty.as_struct().is_some() {
            SymbolKind::StructVariable
        } else {
            SymbolKind::Variable
        };
        Self {
            name: name.to_string(),
            namespace: Vec::new(),
            kind,
            ty,
            mangled,
            span,
        }
    }

    pub fn param_types(&self) -> Vec<ResolvedType> {
        match &self.kind {
            SymbolKind::Function { params, .. } => params.iter().map(|(_, t)| t.clone()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, SymbolKind::Function { .. })
    }
}

// ==================== Scopes ====================

/// An insertion-ordered set of symbols, unique by name
#[derive(Debug, Clone, Default)]
pub struct Scope {
    symbols: IndexMap<String, Symbol>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a symbol; duplicate declaration is a fatal error
    pub fn define(&mut self, symbol: Symbol) -> Result<()> {
        if self.symbols.contains_key(&symbol.name) {
            return Err(Error::DuplicateDeclaration {
                name: symbol.name.clone(),
                span: symbol.span,
            });
        }
        self.symbols.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

/// Nested object scopes. The bottom scope holds the unit's globals;
/// every push has a matching pop.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Scope::new());
    }

    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popped the unit scope");
        self.scopes.pop();
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Define into the innermost scope
    pub fn define(&mut self, symbol: Symbol) -> Result<()> {
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .define(symbol)
    }

    /// Innermost-to-outermost lookup; returns the scope index so the
    /// caller can tell unit globals (index 0) from function locals.
    pub fn lookup(&self, name: &str) -> Option<(usize, &Symbol)> {
        for (idx, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(sym) = scope.get(name) {
                return Some((idx, sym));
            }
        }
        None
    }

    /// The unit-level (global) scope
    pub fn globals(&self) -> &Scope {
        &self.scopes[0]
    }
}

/// Nested type scopes. The bottom scope is seeded with the built-in
/// primitive types; user TYPE/STRUCT declarations extend the current
/// scope.
#[derive(Debug, Default)]
pub struct TypeScopes {
    scopes: Vec<IndexMap<String, ResolvedType>>,
}

impl TypeScopes {
    pub fn new() -> Self {
        let mut primitives = IndexMap::new();
        for &p in PrimitiveType::all_named() {
            primitives.insert(p.name().to_string(), ResolvedType::prim(p));
        }
        Self {
            scopes: vec![primitives, IndexMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(IndexMap::new());
    }

    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 2, "popped the unit type scope");
        self.scopes.pop();
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn define(&mut self, name: &str, ty: ResolvedType, span: Span) -> Result<()> {
        // A type name may not shadow a primitive or an existing type
        if self.lookup(name).is_some() {
            return Err(Error::DuplicateDeclaration {
                name: name.to_string(),
                span,
            });
        }
        self.scopes
            .last_mut()
            .expect("type scopes never empty")
            .insert(name.to_string(), ty);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&ResolvedType> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    /// The unit-level type scope (above the primitives)
    pub fn unit_scope(&self) -> &IndexMap<String, ResolvedType> {
        &self.scopes[1]
    }
}

// ==================== Resolver ====================

/// The resolver for one compilation unit.
///
/// Owns the unit's scope stacks while resolution runs and hands them
/// back to the unit afterwards, so lookups during code generation (and
/// from importing units) see the finished global scopes.
pub struct Resolver<'m> {
    manager: &'m mut UnitManager,
    namespace: Vec<String>,
    objects: ScopeStack,
    types: TypeScopes,
    builtins: Scope,
    links: Vec<String>,
    /// Cloned signatures of every callable referenced by this unit,
    /// keyed by mangled name; code generation casts call arguments
    /// against these.
    callables: IndexMap<String, Symbol>,
    /// Return types of the enclosing function definitions
    ret_stack: Vec<ResolvedType>,
}

impl<'m> Resolver<'m> {
    pub fn new(manager: &'m mut UnitManager, namespace: Vec<String>) -> Self {
        Self {
            manager,
            namespace,
            objects: ScopeStack::new(),
            types: TypeScopes::new(),
            builtins: builtins::builtin_scope(),
            links: Vec::new(),
            callables: IndexMap::new(),
            ret_stack: Vec::new(),
        }
    }

    /// Resolve all top-level nodes of a unit in file order, mutating
    /// them in place, then store the finished scopes on the unit.
    pub fn resolve_unit(&mut self, unit: &mut CompilationUnit) -> Result<()> {
        let roots = unit.roots.clone();
        for id in roots {
            self.resolve(&mut unit.ast, id)?;
        }
        debug_assert_eq!(self.objects.depth(), 1, "unbalanced object scopes");
        debug_assert_eq!(self.types.depth(), 2, "unbalanced type scopes");
        unit.objects = std::mem::take(&mut self.objects);
        unit.types = std::mem::take(&mut self.types);
        unit.links = std::mem::take(&mut self.links);
        unit.callables = std::mem::take(&mut self.callables);
        log::debug!("resolved unit {}", unit.name);
        Ok(())
    }

    /// Resolve one node, annotating its type and resolution
    fn resolve(&mut self, ast: &mut Ast, id: NodeId) -> Result<ResolvedType> {
        let span = ast.node(id).span;
        let kind = ast.node(id).kind.clone();
        let ty = match kind {
            NodeKind::IntLit(v) => {
                let p = if i32::try_from(v).is_ok() {
                    PrimitiveType::Int
                } else {
                    PrimitiveType::Long
                };
                ResolvedType::prim(p).constant()
            }
            NodeKind::FloatLit(_) => ResolvedType::DOUBLE.constant(),
            NodeKind::StrLit(_) => ResolvedType::STR.constant(),
            NodeKind::BoolLit(_) => ResolvedType::BOOL.constant(),
            NodeKind::VarRef { name } => self.resolve_var_ref(ast, id, &name, span)?,
            NodeKind::Binary { op, lhs, rhs } => {
                let lt = self.resolve(ast, lhs)?;
                let rt = self.resolve(ast, rhs)?;
                if op.is_connective() {
                    // Connective operands are cast through Int to Bool
                    // during generation; they only need to be numeric.
                    self.require_promotes(&lt, &ResolvedType::INT, span)?;
                    self.require_promotes(&rt, &ResolvedType::INT, span)?;
                    ResolvedType::BOOL
                } else {
                    self.promote_or_fail(&lt, &rt, span)?
                }
            }
            NodeKind::Unary { op, operand } => {
                let ot = self.resolve(ast, operand)?;
                self.require_promotes(&ot, &ResolvedType::INT, span)?;
                match op {
                    // Negating a constant stays a constant
                    UnOp::Neg => ot,
                    UnOp::Not => ResolvedType::BOOL,
                }
            }
            NodeKind::Compare { lhs, rhs, .. } => {
                let lt = self.resolve(ast, lhs)?;
                let rt = self.resolve(ast, rhs)?;
                self.promote_or_fail(&lt, &rt, span)?;
                ResolvedType::BOOL
            }
            NodeKind::Chain { links } => self.resolve_chain(ast, &links, span)?,
            NodeKind::Assign { target, value } => self.resolve_assign(ast, target, value, span)?,
            NodeKind::Dot { base, field } => self.resolve_dot(ast, id, base, &field, span)?,
            NodeKind::Call { callee, args } => self.resolve_call(ast, id, callee, &args, span)?,
            NodeKind::FuncDecl { sig, extern_name } => {
                let symbol = self.resolve_func_header(&sig, extern_name.as_deref(), span)?;
                ast.node_mut(id).res = Resolution::Function {
                    mangled: symbol.mangled,
                };
                ResolvedType::VOID
            }
            NodeKind::FuncDef { sig, body } => {
                let symbol = self.resolve_func_header(&sig, None, span)?;
                self.resolve_func_body(ast, id, &symbol, &body)?;
                ResolvedType::VOID
            }
            NodeKind::If {
                cond,
                then_body,
                else_body,
            } => self.resolve_branches(ast, cond, &then_body, &else_body, span)?,
            NodeKind::While {
                cond,
                body,
                else_body,
            } => self.resolve_branches(ast, cond, &body, &else_body, span)?,
            NodeKind::Block { body } => {
                self.push_scope();
                let mut last = None;
                for &stmt in &body {
                    self.resolve(ast, stmt)?;
                    last = Some(stmt);
                }
                self.pop_scope();
                last.map_or(ResolvedType::VOID, |s| value_type_of(ast, s))
            }
            NodeKind::VarDef { ty, name, init } => {
                self.resolve_var_def(ast, id, &ty, &name, init, span)?
            }
            NodeKind::StructDef { name, fields } => self.resolve_struct_def(&name, &fields, span)?,
            NodeKind::TypeDef { name, target } => {
                let ty = self.lookup_type(&target)?;
                self.types.define(&name, ty.clone(), span)?;
                ty
            }
            NodeKind::Using { path } => {
                let key = self.manager.link_import(&path)?;
                if !self.links.contains(&key) {
                    self.links.push(key);
                }
                ResolvedType::VOID
            }
            NodeKind::Return { value } => self.resolve_return(ast, value, span)?,
        };

        let node = ast.node_mut(id);
        node.ty = ty.clone();
        Ok(ty)
    }

    // ==================== Node Kinds ====================

    fn resolve_var_ref(
        &mut self,
        ast: &mut Ast,
        id: NodeId,
        name: &str,
        span: Span,
    ) -> Result<ResolvedType> {
        if let Some((idx, sym)) = self.objects.lookup(name) {
            let sym = sym.clone();
            let res = if sym.is_function() {
                self.callables.insert(sym.mangled.clone(), sym.clone());
                Resolution::Function {
                    mangled: sym.mangled.clone(),
                }
            } else if idx == 0 {
                Resolution::Global {
                    mangled: sym.mangled.clone(),
                }
            } else {
                Resolution::Local
            };
            ast.node_mut(id).res = res;
            return Ok(sym.ty);
        }
        if let Some(sym) = self.builtins.get(name) {
            let sym = sym.clone();
            self.callables.insert(sym.mangled.clone(), sym.clone());
            ast.node_mut(id).res = Resolution::Function {
                mangled: sym.mangled.clone(),
            };
            return Ok(sym.ty);
        }
        // A lone name can still be the first segment of a namespace
        // path; the enclosing dot node picks it up.
        if self.is_namespace_prefix(&[name.to_string()]) {
            ast.node_mut(id).res = Resolution::Namespace {
                path: vec![name.to_string()],
            };
            return Ok(ResolvedType::VOID);
        }
        Err(Error::UnresolvedSymbol {
            name: name.to_string(),
            namespace: Vec::new(),
            span,
        })
    }

    fn resolve_chain(
        &mut self,
        ast: &mut Ast,
        links: &[ChainLink],
        span: Span,
    ) -> Result<ResolvedType> {
        // Adjacent links share their boundary operand handle; resolve
        // each link's left operand and the final link's right operand
        // so every distinct operand resolves exactly once.
        for link in links {
            self.resolve(ast, link.lhs)?;
        }
        if let Some(last) = links.last() {
            self.resolve(ast, last.rhs)?;
        }
        for link in links {
            let lt = ast.ty(link.lhs).clone();
            let rt = ast.ty(link.rhs).clone();
            self.promote_or_fail(&lt, &rt, span)?;
        }
        // The chain's own type is always boolean, regardless of the
        // operand types.
        Ok(ResolvedType::BOOL)
    }

    fn resolve_assign(
        &mut self,
        ast: &mut Ast,
        target: NodeId,
        value: NodeId,
        span: Span,
    ) -> Result<ResolvedType> {
        // Right-hand side first; assignability is enforced by the
        // generation-time cast, not here.
        self.resolve(ast, value)?;
        let target_ty = self.resolve(ast, target)?;
        match ast.node(target).res {
            Resolution::Local | Resolution::Global { .. } | Resolution::Field { .. } => {}
            _ => return Err(Error::NotAddressable { span }),
        }
        Ok(target_ty)
    }

    fn resolve_dot(
        &mut self,
        ast: &mut Ast,
        id: NodeId,
        base: NodeId,
        field: &str,
        span: Span,
    ) -> Result<ResolvedType> {
        let base_ty = self.resolve(ast, base)?;

        // Namespace prefix: this dot names a symbol (or a longer
        // prefix) inside a linked unit.
        if let Resolution::Namespace { path } = ast.node(base).res.clone() {
            if let Some(sym) = self.find_linked_symbol(&path, field) {
                let res = if sym.is_function() {
                    self.callables.insert(sym.mangled.clone(), sym.clone());
                    Resolution::Function {
                        mangled: sym.mangled.clone(),
                    }
                } else {
                    Resolution::Global {
                        mangled: sym.mangled.clone(),
                    }
                };
                ast.node_mut(id).res = res;
                return Ok(sym.ty);
            }
            let mut longer = path.clone();
            longer.push(field.to_string());
            if self.is_namespace_prefix(&longer) {
                ast.node_mut(id).res = Resolution::Namespace { path: longer };
                return Ok(ResolvedType::VOID);
            }
            return Err(Error::UnresolvedSymbol {
                name: field.to_string(),
                namespace: path,
                span,
            });
        }

        // Struct field access. The base must itself be an addressable
        // location (variable or field chain).
        match ast.node(base).res {
            Resolution::Local | Resolution::Global { .. } | Resolution::Field { .. } => {}
            _ => return Err(Error::NotAddressable { span }),
        }
        let strukt = base_ty.as_struct().ok_or(Error::NotAStruct { span })?;
        let index = strukt
            .field_index(field)
            .ok_or_else(|| Error::UnknownField {
                field: field.to_string(),
                span,
            })?;
        let field_ty = strukt.fields[index].1.clone();
        ast.node_mut(id).res = Resolution::Field {
            index: index as u32,
        };
        Ok(field_ty)
    }

    fn resolve_call(
        &mut self,
        ast: &mut Ast,
        id: NodeId,
        callee: NodeId,
        args: &[NodeId],
        span: Span,
    ) -> Result<ResolvedType> {
        self.resolve(ast, callee)?;
        let symbol = match ast.node(callee).res.clone() {
            Resolution::Function { mangled } => self
                .callables
                .get(&mangled)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("unregistered callable {mangled}")))?,
            Resolution::Namespace { path } => {
                return Err(Error::UnresolvedSymbol {
                    name: path.join("."),
                    namespace: Vec::new(),
                    span,
                })
            }
            _ => return Err(Error::NotCallable { span }),
        };

        let params = symbol.param_types();
        if args.len() != params.len() {
            return Err(Error::ArityMismatch {
                name: symbol.name.clone(),
                expected: params.len(),
                got: args.len(),
                span,
            });
        }
        for (&arg, param_ty) in args.iter().zip(params.iter()) {
            let arg_ty = self.resolve(ast, arg)?;
            // A constant argument is range-checked by the
            // generation-time cast instead.
            if arg_ty.is_const && param_ty.primitive().map_or(false, |p| p.is_numeric()) {
                continue;
            }
            let promoted = self.promote_or_fail(&arg_ty, param_ty, ast.node(arg).span)?;
            if !promoted.same_type(param_ty) {
                return Err(Error::InvalidPromotion {
                    lhs: arg_ty.display_name(),
                    rhs: param_ty.display_name(),
                    span: ast.node(arg).span,
                });
            }
        }

        ast.node_mut(id).res = Resolution::Function {
            mangled: symbol.mangled.clone(),
        };
        Ok(symbol.ty)
    }

    /// Resolve a FUNC header: parameter and return lists each in their
    /// own transient scope (so return-value names may shadow parameter
    /// names), compute the linkage name, and register the symbol in
    /// the enclosing scope.
    fn resolve_func_header(
        &mut self,
        sig: &FuncSig,
        extern_name: Option<&str>,
        span: Span,
    ) -> Result<Symbol> {
        let params = self.resolve_decl_list(&sig.params)?;
        let returns = self.resolve_decl_list(&sig.returns)?;

        let ret_ty = returns
            .first()
            .map(|(_, t)| t.clone())
            .unwrap_or(ResolvedType::VOID);
        let param_tys: Vec<ResolvedType> = params.iter().map(|(_, t)| t.clone()).collect();
        let mangled = match extern_name {
            Some(literal) => literal.to_string(),
            None => mangle::function(&self.namespace, &sig.name, &param_tys, &ret_ty),
        };

        let symbol = Symbol {
            name: sig.name.clone(),
            namespace: self.namespace.clone(),
            kind: SymbolKind::Function {
                params: params.clone(),
                returns,
                external: extern_name.is_some(),
            },
            ty: ret_ty,
            mangled: mangled.clone(),
            span,
        };
        self.objects.define(symbol.clone())?;
        self.callables.insert(mangled, symbol.clone());
        Ok(symbol)
    }

    fn resolve_func_body(
        &mut self,
        ast: &mut Ast,
        id: NodeId,
        symbol: &Symbol,
        body: &[NodeId],
    ) -> Result<()> {
        ast.node_mut(id).res = Resolution::Function {
            mangled: symbol.mangled.clone(),
        };

        self.push_scope();
        if let SymbolKind::Function { params, .. } = &symbol.kind {
            for (pname, pty) in params {
                let sym =
                    Symbol::variable(pname, pty.clone(), pname.clone(), ast.node(id).span);
                self.objects.define(sym)?;
            }
        }
        self.ret_stack.push(symbol.ty.clone());
        let result = (|| {
            for &stmt in body {
                self.resolve(ast, stmt)?;
            }
            Ok(())
        })();
        self.ret_stack.pop();
        self.pop_scope();
        result
    }

    /// Resolve a parameter or return list in its own transient scope
    fn resolve_decl_list(&mut self, decls: &[ParamDecl]) -> Result<Vec<(String, ResolvedType)>> {
        self.push_scope();
        let result = (|| {
            let mut out = Vec::new();
            for decl in decls {
                let ty = self.lookup_type(&decl.ty)?;
                let sym = Symbol::variable(&decl.name, ty.clone(), decl.name.clone(), decl.span);
                self.objects.define(sym)?;
                out.push((decl.name.clone(), ty));
            }
            Ok(out)
        })();
        self.pop_scope();
        result
    }

    fn resolve_branches(
        &mut self,
        ast: &mut Ast,
        cond: NodeId,
        first: &[NodeId],
        second: &[NodeId],
        span: Span,
    ) -> Result<ResolvedType> {
        let cond_ty = self.resolve(ast, cond)?;
        self.require_promotes(&cond_ty, &ResolvedType::INT, span)?;

        let first_ty = self.resolve_branch(ast, first)?;
        let second_ty = self.resolve_branch(ast, second)?;

        // The construct carries a value only when every taken branch
        // produced one.
        match (first_ty, second_ty) {
            (Some(a), Some(b)) if !a.is_void() && !b.is_void() => self.promote_or_fail(&a, &b, span),
            _ => Ok(ResolvedType::VOID),
        }
    }

    /// Resolve one branch in its own pushed-and-popped scope; returns
    /// None for an absent branch.
    fn resolve_branch(&mut self, ast: &mut Ast, body: &[NodeId]) -> Result<Option<ResolvedType>> {
        if body.is_empty() {
            return Ok(None);
        }
        self.push_scope();
        let result = (|| {
            for &stmt in body {
                self.resolve(ast, stmt)?;
            }
            Ok(value_type_of(ast, *body.last().expect("non-empty branch")))
        })();
        self.pop_scope();
        result.map(Some)
    }

    fn resolve_var_def(
        &mut self,
        ast: &mut Ast,
        id: NodeId,
        ty_ref: &TypeRef,
        name: &str,
        init: Option<NodeId>,
        span: Span,
    ) -> Result<ResolvedType> {
        let ty = self.lookup_type(ty_ref)?;

        // Definition depth decides storage: depth 1 is the unit scope,
        // so the variable is a backend global.
        let global = self.objects.depth() == 1;
        let mangled = if global {
            mangle::variable(&self.namespace, name, &ty)
        } else {
            name.to_string()
        };

        let mut symbol = Symbol::variable(name, ty.clone(), mangled.clone(), span);
        symbol.namespace = if global {
            self.namespace.clone()
        } else {
            Vec::new()
        };
        self.objects.define(symbol)?;

        ast.node_mut(id).res = if global {
            Resolution::Global { mangled }
        } else {
            Resolution::Local
        };

        if let Some(init) = init {
            // Assignability becomes a generation-time cast.
            self.resolve(ast, init)?;
        }
        Ok(ty)
    }

    fn resolve_struct_def(
        &mut self,
        name: &str,
        fields: &[(TypeRef, String)],
        span: Span,
    ) -> Result<ResolvedType> {
        // Fields resolve as non-scope-pushing var-defs: they are not
        // visible as ordinary variables anywhere.
        let mut resolved = Vec::new();
        for (ty_ref, fname) in fields {
            if resolved.iter().any(|(existing, _): &(String, _)| existing == fname) {
                return Err(Error::DuplicateDeclaration {
                    name: fname.clone(),
                    span,
                });
            }
            let fty = self.lookup_type(ty_ref)?;
            resolved.push((fname.clone(), fty));
        }

        let strukt = StructType {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            fields: resolved,
            mangled: mangle::struct_type(&self.namespace, name),
        };
        let ty = ResolvedType::strukt(strukt);
        self.types.define(name, ty.clone(), span)?;
        Ok(ty)
    }

    fn resolve_return(
        &mut self,
        ast: &mut Ast,
        value: Option<NodeId>,
        span: Span,
    ) -> Result<ResolvedType> {
        let expected = self
            .ret_stack
            .last()
            .cloned()
            .ok_or(Error::MalformedControlFlow {
                context: "RETURN outside a function body".to_string(),
                span,
            })?;
        match value {
            Some(v) => {
                let vt = self.resolve(ast, v)?;
                if expected.is_void() {
                    return Err(Error::InvalidPromotion {
                        lhs: vt.display_name(),
                        rhs: expected.display_name(),
                        span,
                    });
                }
                if !vt.is_const {
                    self.require_promotes(&vt, &expected, span)?;
                }
            }
            None => {
                if !expected.is_void() {
                    return Err(Error::MalformedControlFlow {
                        context: "RETURN without a value in a value-returning function"
                            .to_string(),
                        span,
                    });
                }
            }
        }
        Ok(ResolvedType::VOID)
    }

    // ==================== Helpers ====================

    fn push_scope(&mut self) {
        self.objects.push();
        self.types.push();
    }

    fn pop_scope(&mut self) {
        self.types.pop();
        self.objects.pop();
    }

    fn promote_or_fail(
        &self,
        a: &ResolvedType,
        b: &ResolvedType,
        span: Span,
    ) -> Result<ResolvedType> {
        promote(a, b).ok_or_else(|| Error::InvalidPromotion {
            lhs: a.display_name(),
            rhs: b.display_name(),
            span,
        })
    }

    fn require_promotes(&self, a: &ResolvedType, b: &ResolvedType, span: Span) -> Result<()> {
        self.promote_or_fail(a, b, span).map(|_| ())
    }

    /// Look up a type name, searching the type-scope stack and then
    /// the linked units when the reference is namespace-qualified.
    fn lookup_type(&self, ty_ref: &TypeRef) -> Result<ResolvedType> {
        let found = if ty_ref.namespace.is_empty() {
            self.types.lookup(&ty_ref.name).cloned()
        } else {
            self.find_linked_type(&ty_ref.namespace, &ty_ref.name)
        };
        let mut ty = found.ok_or_else(|| Error::UnresolvedSymbol {
            name: ty_ref.name.clone(),
            namespace: ty_ref.namespace.clone(),
            span: ty_ref.span,
        })?;
        ty.indirection = ty.indirection.saturating_add(ty_ref.indirection);
        Ok(ty)
    }

    /// True when some linked unit's namespace starts with `path`
    fn is_namespace_prefix(&self, path: &[String]) -> bool {
        self.links.iter().any(|key| {
            self.manager
                .unit(key)
                .map_or(false, |u| u.namespace.starts_with(path))
        })
    }

    fn find_linked_symbol(&self, namespace: &[String], name: &str) -> Option<Symbol> {
        for key in &self.links {
            if let Some(unit) = self.manager.unit(key) {
                if unit.namespace == namespace {
                    if let Some(sym) = unit.objects.globals().get(name) {
                        return Some(sym.clone());
                    }
                }
            }
        }
        None
    }

    fn find_linked_type(&self, namespace: &[String], name: &str) -> Option<ResolvedType> {
        for key in &self.links {
            if let Some(unit) = self.manager.unit(key) {
                if unit.namespace == namespace {
                    if let Some(ty) = unit.types.unit_scope().get(name) {
                        return Some(ty.clone());
                    }
                }
            }
        }
        None
    }
}

/// The value a node contributes when it ends a branch or stands at
/// top level. Definitions and control statements contribute none.
pub fn value_type_of(ast: &Ast, id: NodeId) -> ResolvedType {
    match ast.node(id).kind {
        NodeKind::VarDef { .. }
        | NodeKind::StructDef { .. }
        | NodeKind::TypeDef { .. }
        | NodeKind::Using { .. }
        | NodeKind::FuncDecl { .. }
        | NodeKind::FuncDef { .. }
        | NodeKind::Return { .. } => ResolvedType::VOID,
        _ => ast.node(id).ty.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::module::UnitManager;
    use crate::types::TypeKind;

    fn resolve_source(source: &str) -> Result<CompilationUnit> {
        let mut manager = UnitManager::new(Vec::new());
        manager.load_source(source, "test")
    }

    #[test]
    fn test_simple_function() {
        let unit = resolve_source("FUNC Int i = add(Int a, Int b) DO RETURN a + b END").unwrap();
        let sym = unit.objects.globals().get("add").unwrap();
        assert!(sym.is_function());
        assert_eq!(sym.ty, ResolvedType::INT);
        assert_eq!(sym.mangled, "vdi_add_i_i");
    }

    #[test]
    fn test_scopes_balanced_after_resolution() {
        let unit = resolve_source(
            "FUNC Int r = f(Int a) DO IF a < 0 THEN RETURN 0 ELSE WHILE a > 0 DO a = a - 1 END RETURN a END END",
        )
        .unwrap();
        assert_eq!(unit.objects.depth(), 1);
        assert_eq!(unit.types.depth(), 2);
    }

    #[test]
    fn test_unresolved_symbol() {
        let err = resolve_source("x + 1").unwrap_err();
        assert!(matches!(err, Error::UnresolvedSymbol { .. }));
    }

    #[test]
    fn test_duplicate_declaration() {
        let err = resolve_source("Int x Int x").unwrap_err();
        assert!(matches!(err, Error::DuplicateDeclaration { .. }));
    }

    #[test]
    fn test_duplicate_struct() {
        let err = resolve_source("STRUCT P DO Int x END STRUCT P DO Int y END").unwrap_err();
        assert!(matches!(err, Error::DuplicateDeclaration { .. }));
    }

    #[test]
    fn test_branch_shadowing_allowed() {
        // Each branch resolves in its own scope, so both may declare x
        resolve_source("IF TRUE THEN Int x ELSE Int x END").unwrap();
    }

    #[test]
    fn test_arity_mismatch() {
        let err =
            resolve_source("FUNC Int i = f(Int a) DO RETURN a END f(1, 2)").unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { expected: 1, got: 2, .. }));
    }

    #[test]
    fn test_call_type_checked_after_promotion() {
        // A Long variable cannot narrow to an Int parameter
        let err = resolve_source(
            "FUNC Int i = f(Int a) DO RETURN a END Long x = 1 f(x)",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPromotion { .. }));
    }

    #[test]
    fn test_chain_type_is_bool() {
        let unit = resolve_source("Int a = 1 Int b = 2 a < b < 10").unwrap();
        let last = *unit.roots.last().unwrap();
        assert_eq!(unit.ast.ty(last), &ResolvedType::BOOL);
    }

    #[test]
    fn test_if_expression_common_type() {
        let unit = resolve_source("Int a = 1 Long r = IF a < 2 THEN a ELSE 5 END").unwrap();
        // The IF is the initializer of the last var-def
        let last = *unit.roots.last().unwrap();
        if let NodeKind::VarDef {
            init: Some(init), ..
        } = &unit.ast.node(last).kind
        {
            // promote(Int, Int-const) is Int
            assert_eq!(unit.ast.ty(*init).primitive(), Some(PrimitiveType::Int));
        } else {
            panic!("expected var-def with initializer");
        }
    }

    #[test]
    fn test_struct_field_resolution() {
        let unit = resolve_source(
            "STRUCT Point DO Int x Double y END Point p p.x = 3",
        )
        .unwrap();
        let last = *unit.roots.last().unwrap();
        if let NodeKind::Assign { target, .. } = &unit.ast.node(last).kind {
            assert_eq!(unit.ast.node(*target).res, Resolution::Field { index: 0 });
            assert_eq!(unit.ast.ty(*target).primitive(), Some(PrimitiveType::Int));
        } else {
            panic!("expected assignment");
        }
    }

    #[test]
    fn test_unknown_field() {
        let err =
            resolve_source("STRUCT P DO Int x END P p p.z = 1").unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn test_type_alias() {
        let unit = resolve_source("TYPE Index Int Index i = 4").unwrap();
        let last = *unit.roots.last().unwrap();
        assert_eq!(unit.ast.ty(last).primitive(), Some(PrimitiveType::Int));
    }

    #[test]
    fn test_return_type_mismatch() {
        let err = resolve_source("FUNC Int i = f(String s) DO RETURN s END").unwrap_err();
        assert!(matches!(err, Error::InvalidPromotion { .. }));
    }

    #[test]
    fn test_return_outside_function() {
        let err = resolve_source("RETURN 1").unwrap_err();
        assert!(matches!(err, Error::MalformedControlFlow { .. }));
    }

    #[test]
    fn test_return_name_may_shadow_parameter() {
        // The return list resolves in its own transient scope
        resolve_source("FUNC Int a = f(Int a) DO RETURN a END").unwrap();
    }

    #[test]
    fn test_builtin_print_resolves() {
        let unit = resolve_source(r#"print("hi")"#).unwrap();
        let last = *unit.roots.last().unwrap();
        assert!(matches!(
            unit.ast.node(last).res,
            Resolution::Function { .. }
        ));
    }

    #[test]
    fn test_global_variable_gets_mangled_name() {
        let unit = resolve_source("Int counter = 0").unwrap();
        let root = unit.roots[0];
        match &unit.ast.node(root).res {
            Resolution::Global { mangled } => assert_eq!(mangled, "vdi_counter"),
            other => panic!("expected global resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_def_type_annotation() {
        let unit = resolve_source("STRUCT Point DO Int x Double y END").unwrap();
        let root = unit.roots[0];
        match &unit.ast.ty(root).kind {
            TypeKind::Struct(s) => {
                assert_eq!(s.fields.len(), 2);
                assert_eq!(s.mangled, "vdT_Point");
            }
            other => panic!("expected struct type, got {:?}", other),
        }
    }
}
