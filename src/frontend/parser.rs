//! Parser for Veld
//!
//! Recursive descent over the token buffer, allocating nodes into the
//! unit's arena. Comparison sequences of two or more operators build a
//! chain node whose adjacent links share their boundary operand
//! handle.

use crate::frontend::ast::{
    Ast, BinOp, ChainLink, CmpOp, FuncSig, NodeId, NodeKind, ParamDecl, TypeRef, UnOp,
};
use crate::frontend::lexer::Lexer;
use crate::frontend::token::{Token, TokenKind};
use crate::utils::{Error, Result, Span};

/// The parser
pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ast: &'a mut Ast,
}

impl<'a> Parser<'a> {
    /// Create a new parser from a lexer, allocating into `ast`
    pub fn new(mut lexer: Lexer, ast: &'a mut Ast) -> Self {
        Self {
            tokens: lexer.tokenize(),
            pos: 0,
            ast,
        }
    }

    // ==================== Helper Methods ====================

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("tokens never empty"))
    }

    fn current_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn span(&self) -> Span {
        self.current().span
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.current_kind()) == std::mem::discriminant(kind)
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(Error::UnexpectedToken {
                expected: format!("{:?}", expected),
                got: format!("{:?}", self.current_kind()),
                span: self.span(),
            })
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current_kind(), TokenKind::Eof)
    }

    fn parse_name(&mut self) -> Result<String> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(Error::ExpectedIdent { span: token.span }),
        }
    }

    /// True when the current token can begin an expression
    fn starts_expr(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::Ident(_)
                | TokenKind::IntLit(_)
                | TokenKind::FloatLit(_)
                | TokenKind::StringLit(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::LParen
                | TokenKind::Minus
                | TokenKind::Not
                | TokenKind::If
                | TokenKind::While
        )
    }

    /// Lookahead for `Type name`: identifiers joined by dots, then
    /// another identifier. Pointer stars are not accepted here so
    /// `a * b` stays a multiplication; pointer types appear only in
    /// parameter, return, field and typedef positions.
    fn looks_like_var_def(&self) -> bool {
        let mut i = 0;
        if !matches!(self.kind_at(i), Some(TokenKind::Ident(_))) {
            return false;
        }
        i += 1;
        while matches!(self.kind_at(i), Some(TokenKind::Dot))
            && matches!(self.kind_at(i + 1), Some(TokenKind::Ident(_)))
        {
            i += 2;
        }
        matches!(self.kind_at(i), Some(TokenKind::Ident(_)))
    }

    /// Same shape as `looks_like_var_def`, followed by `=`: a typed
    /// return in a FUNC header.
    fn looks_like_typed_return(&self) -> bool {
        let mut i = 0;
        if !matches!(self.kind_at(i), Some(TokenKind::Ident(_))) {
            return false;
        }
        i += 1;
        while matches!(self.kind_at(i), Some(TokenKind::Dot))
            && matches!(self.kind_at(i + 1), Some(TokenKind::Ident(_)))
        {
            i += 2;
        }
        while matches!(self.kind_at(i), Some(TokenKind::Star)) {
            i += 1;
        }
        matches!(self.kind_at(i), Some(TokenKind::Ident(_)))
            && matches!(self.kind_at(i + 1), Some(TokenKind::Eq))
    }

    // ==================== Top Level ====================

    /// Parse all top-level nodes of a unit, in file order
    pub fn parse_unit(&mut self) -> Result<Vec<NodeId>> {
        let mut roots = Vec::new();
        while !self.is_at_end() {
            roots.push(self.parse_top()?);
        }
        Ok(roots)
    }

    fn parse_top(&mut self) -> Result<NodeId> {
        match self.current_kind() {
            TokenKind::Using => self.parse_using(),
            TokenKind::Struct => self.parse_struct(),
            TokenKind::Type => self.parse_typedef(),
            TokenKind::Func => self.parse_func(),
            _ => self.parse_stmt(),
        }
    }

    fn parse_using(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::Using)?.span;
        let mut path = vec![self.parse_name()?];
        while self.consume(&TokenKind::Dot) {
            path.push(self.parse_name()?);
        }
        Ok(self.ast.alloc(NodeKind::Using { path }, span))
    }

    fn parse_struct(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::Struct)?.span;
        let name = self.parse_name()?;
        self.expect(TokenKind::Do)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::End) && !self.is_at_end() {
            let ty = self.parse_type_ref()?;
            let field = self.parse_name()?;
            fields.push((ty, field));
        }
        self.expect(TokenKind::End)?;
        Ok(self.ast.alloc(NodeKind::StructDef { name, fields }, span))
    }

    fn parse_typedef(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::Type)?.span;
        let name = self.parse_name()?;
        let target = self.parse_type_ref()?;
        Ok(self.ast.alloc(NodeKind::TypeDef { name, target }, span))
    }

    fn parse_type_ref(&mut self) -> Result<TypeRef> {
        let span = self.span();
        let mut segments = vec![self.parse_name()?];
        while matches!(self.current_kind(), TokenKind::Dot)
            && matches!(self.kind_at(1), Some(TokenKind::Ident(_)))
        {
            self.advance();
            segments.push(self.parse_name()?);
        }
        let mut indirection: u8 = 0;
        while self.consume(&TokenKind::Star) {
            indirection += 1;
        }
        let name = segments.pop().expect("at least one segment");
        Ok(TypeRef {
            namespace: segments,
            name,
            indirection,
            span,
        })
    }

    fn parse_func(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::Func)?.span;

        let mut returns = Vec::new();
        if self.looks_like_typed_return() {
            let rspan = self.span();
            let ty = self.parse_type_ref()?;
            let rname = self.parse_name()?;
            self.expect(TokenKind::Eq)?;
            returns.push(ParamDecl {
                ty,
                name: rname,
                span: rspan,
            });
        }

        let name = self.parse_name()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) && !self.is_at_end() {
            let pspan = self.span();
            let ty = self.parse_type_ref()?;
            let pname = self.parse_name()?;
            params.push(ParamDecl {
                ty,
                name: pname,
                span: pspan,
            });
            if !self.consume(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        let sig = FuncSig {
            name,
            params,
            returns,
        };

        if self.consume(&TokenKind::Do) {
            let body = self.parse_body()?;
            self.expect(TokenKind::End)?;
            Ok(self.ast.alloc(NodeKind::FuncDef { sig, body }, span))
        } else if self.consume(&TokenKind::Extern) {
            let extern_name = match self.current_kind() {
                TokenKind::StringLit(s) => {
                    let s = s.clone();
                    self.advance();
                    Some(s)
                }
                _ => None,
            };
            Ok(self.ast.alloc(NodeKind::FuncDecl { sig, extern_name }, span))
        } else {
            Ok(self.ast.alloc(
                NodeKind::FuncDecl {
                    sig,
                    extern_name: None,
                },
                span,
            ))
        }
    }

    // ==================== Statements ====================

    /// Parse statements up to (not including) END or ELSE
    fn parse_body(&mut self) -> Result<Vec<NodeId>> {
        let mut body = Vec::new();
        while !matches!(self.current_kind(), TokenKind::End | TokenKind::Else) && !self.is_at_end()
        {
            body.push(self.parse_stmt()?);
        }
        Ok(body)
    }

    fn parse_stmt(&mut self) -> Result<NodeId> {
        match self.current_kind() {
            TokenKind::Return => self.parse_return(),
            _ if self.looks_like_var_def() => self.parse_var_def(),
            _ => self.parse_expr(),
        }
    }

    fn parse_return(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::Return)?.span;
        let value = if self.starts_expr() {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(self.ast.alloc(NodeKind::Return { value }, span))
    }

    fn parse_var_def(&mut self) -> Result<NodeId> {
        let span = self.span();
        let ty = self.parse_type_ref()?;
        let name = self.parse_name()?;
        let init = if self.consume(&TokenKind::Eq) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(self.ast.alloc(NodeKind::VarDef { ty, name, init }, span))
    }

    fn parse_if(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::If)?.span;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        let then_body = self.parse_body()?;
        let else_body = if self.consume(&TokenKind::Else) {
            self.parse_body()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::End)?;
        Ok(self.ast.alloc(
            NodeKind::If {
                cond,
                then_body,
                else_body,
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> Result<NodeId> {
        let span = self.expect(TokenKind::While)?.span;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_body()?;
        let else_body = if self.consume(&TokenKind::Else) {
            self.parse_body()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::End)?;
        Ok(self.ast.alloc(
            NodeKind::While {
                cond,
                body,
                else_body,
            },
            span,
        ))
    }

    // ==================== Expressions ====================

    fn parse_expr(&mut self) -> Result<NodeId> {
        self.parse_assign()
    }

    /// Assignment is right-associative and lowest precedence; the
    /// target's addressability is checked during resolution.
    fn parse_assign(&mut self) -> Result<NodeId> {
        let target = self.parse_or()?;
        if self.check(&TokenKind::Eq) {
            let span = self.advance().span;
            let value = self.parse_assign()?;
            return Ok(self.ast.alloc(NodeKind::Assign { target, value }, span));
        }
        Ok(target)
    }

    fn parse_or(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_xor()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Or => BinOp::Or,
                TokenKind::Nor => BinOp::Nor,
                _ => break,
            };
            let span = self.advance().span;
            let rhs = self.parse_xor()?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_xor(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_and()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Xor => BinOp::Xor,
                TokenKind::Xnor => BinOp::Xnor,
                _ => break,
            };
            let span = self.advance().span;
            let rhs = self.parse_and()?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_cmp()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::And => BinOp::And,
                TokenKind::Nand => BinOp::Nand,
                _ => break,
            };
            let span = self.advance().span;
            let rhs = self.parse_cmp()?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    /// One comparison builds a plain compare node; two or more build a
    /// chain whose adjacent links share the boundary operand handle.
    fn parse_cmp(&mut self) -> Result<NodeId> {
        let first = self.parse_add()?;
        if !self.current_kind().is_comparison() {
            return Ok(first);
        }

        let span = self.span();
        let mut links = Vec::new();
        let mut prev = first;
        while self.current_kind().is_comparison() {
            let op = match self.advance().kind {
                TokenKind::EqEq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                _ => unreachable!("is_comparison checked"),
            };
            let rhs = self.parse_add()?;
            links.push(ChainLink { op, lhs: prev, rhs });
            prev = rhs;
        }

        if links.len() == 1 {
            let link = links.pop().expect("one link");
            Ok(self.ast.alloc(
                NodeKind::Compare {
                    op: link.op,
                    lhs: link.lhs,
                    rhs: link.rhs,
                },
                span,
            ))
        } else {
            Ok(self.ast.alloc(NodeKind::Chain { links }, span))
        }
    }

    fn parse_add(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.advance().span;
            let rhs = self.parse_mul()?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Rem,
                _ => break,
            };
            let span = self.advance().span;
            let rhs = self.parse_unary()?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeId> {
        let op = match self.current_kind() {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Not => Some(UnOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.advance().span;
            let operand = self.parse_unary()?;
            return Ok(self.ast.alloc(NodeKind::Unary { op, operand }, span));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<NodeId> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&TokenKind::Dot) {
                let span = self.advance().span;
                let field = self.parse_name()?;
                expr = self.ast.alloc(NodeKind::Dot { base: expr, field }, span);
            } else if self.check(&TokenKind::LParen) {
                let span = self.advance().span;
                let mut args = Vec::new();
                while !self.check(&TokenKind::RParen) && !self.is_at_end() {
                    args.push(self.parse_expr()?);
                    if !self.consume(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                expr = self.ast.alloc(NodeKind::Call { callee: expr, args }, span);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<NodeId> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::IntLit(v) => {
                self.advance();
                Ok(self.ast.alloc(NodeKind::IntLit(v), token.span))
            }
            TokenKind::FloatLit(v) => {
                self.advance();
                Ok(self.ast.alloc(NodeKind::FloatLit(v), token.span))
            }
            TokenKind::StringLit(ref s) => {
                self.advance();
                Ok(self.ast.alloc(NodeKind::StrLit(s.clone()), token.span))
            }
            TokenKind::True => {
                self.advance();
                Ok(self.ast.alloc(NodeKind::BoolLit(true), token.span))
            }
            TokenKind::False => {
                self.advance();
                Ok(self.ast.alloc(NodeKind::BoolLit(false), token.span))
            }
            TokenKind::Ident(ref name) => {
                self.advance();
                Ok(self
                    .ast
                    .alloc(NodeKind::VarRef { name: name.clone() }, token.span))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            _ => Err(Error::ExpectedExpr { span: token.span }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Ast, Vec<NodeId>) {
        let mut ast = Ast::new();
        let roots = {
            let lexer = Lexer::new(source, 0);
            let mut parser = Parser::new(lexer, &mut ast);
            parser.parse_unit().expect("parse failed")
        };
        (ast, roots)
    }

    #[test]
    fn test_function_definition() {
        let (ast, roots) = parse("FUNC Int i = add(Int a, Int b) DO RETURN a + b END");
        assert_eq!(roots.len(), 1);
        match &ast.node(roots[0]).kind {
            NodeKind::FuncDef { sig, body } => {
                assert_eq!(sig.name, "add");
                assert_eq!(sig.params.len(), 2);
                assert_eq!(sig.returns.len(), 1);
                assert_eq!(sig.returns[0].ty.name, "Int");
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected FuncDef, got {:?}", other),
        }
    }

    #[test]
    fn test_void_function_header() {
        let (ast, roots) = parse("FUNC greet(String s) DO RETURN END");
        match &ast.node(roots[0]).kind {
            NodeKind::FuncDef { sig, .. } => {
                assert_eq!(sig.name, "greet");
                assert!(sig.returns.is_empty());
            }
            other => panic!("expected FuncDef, got {:?}", other),
        }
    }

    #[test]
    fn test_extern_declaration() {
        let (ast, roots) = parse(r#"FUNC Int r = puts(String s) EXTERN "puts""#);
        match &ast.node(roots[0]).kind {
            NodeKind::FuncDecl { sig, extern_name } => {
                assert_eq!(sig.name, "puts");
                assert_eq!(extern_name.as_deref(), Some("puts"));
            }
            other => panic!("expected FuncDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_shares_boundary_handles() {
        let (ast, roots) = parse("a < b < c < d");
        match &ast.node(roots[0]).kind {
            NodeKind::Chain { links } => {
                assert_eq!(links.len(), 3);
                assert_eq!(links[0].rhs, links[1].lhs);
                assert_eq!(links[1].rhs, links[2].lhs);
            }
            other => panic!("expected Chain, got {:?}", other),
        }
    }

    #[test]
    fn test_single_comparison_is_not_a_chain() {
        let (ast, roots) = parse("a < b");
        assert!(matches!(
            ast.node(roots[0]).kind,
            NodeKind::Compare { op: CmpOp::Lt, .. }
        ));
    }

    #[test]
    fn test_var_def_with_init() {
        let (ast, roots) = parse("Int i = 300");
        match &ast.node(roots[0]).kind {
            NodeKind::VarDef { ty, name, init } => {
                assert_eq!(ty.name, "Int");
                assert_eq!(name, "i");
                assert!(init.is_some());
            }
            other => panic!("expected VarDef, got {:?}", other),
        }
    }

    #[test]
    fn test_namespaced_type_var_def() {
        let (ast, roots) = parse("geo.Point p");
        match &ast.node(roots[0]).kind {
            NodeKind::VarDef { ty, name, .. } => {
                assert_eq!(ty.namespace, vec!["geo".to_string()]);
                assert_eq!(ty.name, "Point");
                assert_eq!(name, "p");
            }
            other => panic!("expected VarDef, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_definition() {
        let (ast, roots) = parse("STRUCT Point DO Int x Double y END");
        match &ast.node(roots[0]).kind {
            NodeKind::StructDef { name, fields } => {
                assert_eq!(name, "Point");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].1, "x");
                assert_eq!(fields[1].0.name, "Double");
            }
            other => panic!("expected StructDef, got {:?}", other),
        }
    }

    #[test]
    fn test_using_path() {
        let (ast, roots) = parse("USING lib.math");
        match &ast.node(roots[0]).kind {
            NodeKind::Using { path } => {
                assert_eq!(path, &["lib".to_string(), "math".to_string()]);
            }
            other => panic!("expected Using, got {:?}", other),
        }
    }

    #[test]
    fn test_while_with_else() {
        let (ast, roots) = parse("WHILE i < 10 DO i = i + 1 ELSE i = 0 END");
        match &ast.node(roots[0]).kind {
            NodeKind::While {
                body, else_body, ..
            } => {
                assert_eq!(body.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected While, got {:?}", other),
        }
    }

    #[test]
    fn test_if_as_expression() {
        let (ast, roots) = parse("x = IF y THEN 1 ELSE 2 END");
        match &ast.node(roots[0]).kind {
            NodeKind::Assign { value, .. } => {
                assert!(matches!(ast.node(*value).kind, NodeKind::If { .. }));
            }
            other => panic!("expected Assign, got {:?}", other),
        }
    }

    #[test]
    fn test_dot_call() {
        let (ast, roots) = parse("lib.twice(2)");
        match &ast.node(roots[0]).kind {
            NodeKind::Call { callee, args } => {
                assert_eq!(args.len(), 1);
                assert!(matches!(ast.node(*callee).kind, NodeKind::Dot { .. }));
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_connective_precedence() {
        // AND binds tighter than OR
        let (ast, roots) = parse("a OR b AND c");
        match &ast.node(roots[0]).kind {
            NodeKind::Binary { op, rhs, .. } => {
                assert_eq!(*op, BinOp::Or);
                assert!(matches!(
                    ast.node(*rhs).kind,
                    NodeKind::Binary { op: BinOp::And, .. }
                ));
            }
            other => panic!("expected Binary, got {:?}", other),
        }
    }
}
