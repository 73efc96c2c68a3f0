//! Expression parsing.
//!
//! Constructors run the typing pass as they build, so every subtree is
//! typed by the time its parent is assembled; pointer arithmetic scaling
//! and the usual conversions happen right here.

use super::{init, Parser, ScopeEntry};
use crate::ast::{BinOp, Node, NodeKind, ObjId};
use crate::error::CompileError;
use crate::token::{NumType, StrEncoding, Token, TokenKind, TokenValue};
use crate::typecheck::{add_type, new_cast};
use crate::types::{TypeId, TypeKind};
use cvm_core::source::Loc;

impl<'a> Parser<'a> {
    // --- typed node helpers ---------------------------------------------

    fn typed(&mut self, kind: NodeKind, loc: Option<Loc>) -> Node {
        let mut n = Node::new(kind, loc);
        add_type(self.cc, &mut n);
        n
    }

    pub(crate) fn node_num(&mut self, val: i64, loc: Option<Loc>) -> Node {
        self.typed(NodeKind::Num { val }, loc)
    }

    pub(crate) fn node_var(&mut self, obj: ObjId, loc: Option<Loc>) -> Node {
        self.typed(NodeKind::Var { obj }, loc)
    }

    fn node_addr(&mut self, expr: Node, loc: Option<Loc>) -> Node {
        self.typed(
            NodeKind::Addr {
                expr: Box::new(expr),
            },
            loc,
        )
    }

    fn node_deref(&mut self, expr: Node, loc: Option<Loc>) -> Node {
        self.typed(
            NodeKind::Deref {
                expr: Box::new(expr),
            },
            loc,
        )
    }

    pub(crate) fn node_assign(&mut self, lhs: Node, rhs: Node, loc: Option<Loc>) -> Node {
        self.typed(
            NodeKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        )
    }

    fn node_binary(&mut self, op: BinOp, lhs: Node, rhs: Node, loc: Option<Loc>) -> Node {
        self.typed(
            NodeKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        )
    }

    fn node_comma(&mut self, lhs: Node, rhs: Node, loc: Option<Loc>) -> Node {
        self.typed(
            NodeKind::Comma {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        )
    }

    fn error_node(&mut self) -> Node {
        Node::typed(NodeKind::Error, self.cc.types.ty_error, self.loc())
    }

    fn is_typename_at(&self, n: usize) -> bool {
        let tok = self.la(n).clone();
        self.is_typename(&tok)
    }

    /// Report a recoverable expression error: diagnose and yield an
    /// Error-typed stub so parsing continues.
    fn recover(&mut self, loc: Option<Loc>, msg: String) -> Result<Node, CompileError> {
        if self.cc.options.collect_errors {
            self.cc.diags.push(cvm_core::diag::Diagnostic {
                severity: cvm_core::diag::Severity::Error,
                message: msg,
                loc,
                expansion: self.last_token_expansion(),
            });
            Ok(self.error_node())
        } else {
            Err(self.error_at(loc, msg))
        }
    }

    fn is_err_node(&self, n: &Node) -> bool {
        n.ty.is_some_and(|t| self.cc.types.is_error(t))
    }

    // --- pointer-aware + and - ------------------------------------------

    pub(crate) fn new_add(&mut self, lhs: Node, rhs: Node, loc: Option<Loc>) -> Result<Node, CompileError> {
        if self.is_err_node(&lhs) || self.is_err_node(&rhs) {
            return Ok(self.error_node());
        }
        let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
        let lptr = self.decayed_base(lt);
        let rptr = self.decayed_base(rt);
        match (lptr, rptr) {
            (None, None) => Ok(self.node_binary(BinOp::Add, lhs, rhs, loc)),
            (Some(_), Some(_)) => self.recover(loc, "invalid operands to +".into()),
            (Some(base), None) => {
                let scaled = self.scale_index(rhs, base, loc)?;
                let lhs = self.decay(lhs);
                Ok(self.node_binary(BinOp::Add, lhs, scaled, loc))
            }
            (None, Some(base)) => {
                let scaled = self.scale_index(lhs, base, loc)?;
                let rhs = self.decay(rhs);
                Ok(self.node_binary(BinOp::Add, rhs, scaled, loc))
            }
        }
    }

    pub(crate) fn new_sub(&mut self, lhs: Node, rhs: Node, loc: Option<Loc>) -> Result<Node, CompileError> {
        if self.is_err_node(&lhs) || self.is_err_node(&rhs) {
            return Ok(self.error_node());
        }
        let (lt, rt) = (lhs.ty.unwrap(), rhs.ty.unwrap());
        let lptr = self.decayed_base(lt);
        let rptr = self.decayed_base(rt);
        match (lptr, rptr) {
            (None, None) => Ok(self.node_binary(BinOp::Sub, lhs, rhs, loc)),
            (Some(base), None) => {
                let scaled = self.scale_index(rhs, base, loc)?;
                let lhs = self.decay(lhs);
                Ok(self.node_binary(BinOp::Sub, lhs, scaled, loc))
            }
            (Some(base), Some(_)) => {
                // ptr - ptr: element distance, type long.
                let size = self.cc.types.get(base).size.max(1);
                let lhs = self.decay(lhs);
                let rhs = self.decay(rhs);
                let ty_long = self.cc.types.ty_long;
                let lhs = new_cast(self.cc, lhs, ty_long);
                let rhs = new_cast(self.cc, rhs, ty_long);
                let diff = self.node_binary(BinOp::Sub, lhs, rhs, loc);
                let size_node = Node::typed(NodeKind::Num { val: size }, ty_long, loc);
                Ok(self.node_binary(BinOp::Div, diff, size_node, loc))
            }
            (None, Some(_)) => self.recover(loc, "invalid operands to -".into()),
        }
    }

    /// Pointer-ish base type for arithmetic (pointers, arrays, VLAs).
    fn decayed_base(&self, ty: TypeId) -> Option<TypeId> {
        self.cc.types.base_of(ty)
    }

    /// Arrays and VLA variables decay to a pointer value in arithmetic.
    fn decay(&mut self, node: Node) -> Node {
        let ty = node.ty.unwrap();
        match self.cc.types.get(ty).kind {
            TypeKind::Array { base, .. } => {
                let loc = node.loc;
                let pt = self.cc.types.pointer_to(base);
                let mut addr = self.node_addr(node, loc);
                addr.ty = Some(pt);
                addr
            }
            TypeKind::Vla { base, .. } => {
                // The slot already holds a pointer; retype the load.
                let pt = self.cc.types.pointer_to(base);
                let mut n = node;
                n.ty = Some(pt);
                n
            }
            _ => node,
        }
    }

    fn scale_index(&mut self, idx: Node, base: TypeId, loc: Option<Loc>) -> Result<Node, CompileError> {
        let it = idx.ty.unwrap();
        if !self.cc.types.is_integer(it) {
            return self.recover(loc, "pointer offset must be an integer".into());
        }
        let size = self.cc.types.get(base).size;
        if size < 0 {
            return self.recover(loc, "pointer arithmetic on incomplete type".into());
        }
        let ty_long = self.cc.types.ty_long;
        let idx = new_cast(self.cc, idx, ty_long);
        let size_node = Node::typed(NodeKind::Num { val: size.max(1) }, ty_long, loc);
        Ok(self.node_binary(BinOp::Mul, idx, size_node, loc))
    }

    // --- precedence chain ------------------------------------------------

    pub(crate) fn expr(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let node = self.assign()?;
        if self.tok().is(",") {
            self.advance();
            let rhs = self.expr()?;
            return Ok(self.node_comma(node, rhs, loc));
        }
        Ok(node)
    }

    pub(crate) fn assign(&mut self) -> Result<Node, CompileError> {
        let lhs = self.conditional()?;
        let loc = self.loc();

        if self.tok().is("=") {
            self.advance();
            let rhs = self.assign()?;
            return Ok(self.node_assign(lhs, rhs, loc));
        }

        let compound = [
            ("+=", Some(BinOp::Add)),
            ("-=", Some(BinOp::Sub)),
            ("*=", Some(BinOp::Mul)),
            ("/=", Some(BinOp::Div)),
            ("%=", Some(BinOp::Mod)),
            ("&=", Some(BinOp::BitAnd)),
            ("|=", Some(BinOp::BitOr)),
            ("^=", Some(BinOp::BitXor)),
            ("<<=", Some(BinOp::Shl)),
            (">>=", Some(BinOp::Shr)),
        ]
        .into_iter()
        .find(|(p, _)| self.tok().is(p));
        if let Some((_, Some(op))) = compound {
            self.advance();
            let rhs = self.assign()?;
            return self.to_assign(op, lhs, rhs, loc);
        }

        Ok(lhs)
    }

    /// Rewrite `A op= B` as `tmp = &A, *tmp = *tmp op B` so A is evaluated
    /// once. A bitfield member keeps its member access on both sides.
    fn to_assign(
        &mut self,
        op: BinOp,
        lhs: Node,
        rhs: Node,
        loc: Option<Loc>,
    ) -> Result<Node, CompileError> {
        if self.is_err_node(&lhs) || self.is_err_node(&rhs) {
            return Ok(self.error_node());
        }
        if let NodeKind::Member { base, member_idx } = lhs.kind {
            let idx = member_idx;
            let base_ty = base.ty.unwrap();
            let pt = self.cc.types.pointer_to(base_ty);
            let tmp = self.new_anon_lvar(pt);
            let addr = self.node_addr(*base, loc);
            let tmp_init = {
                let tv = self.node_var(tmp, loc);
                self.node_assign(tv, addr, loc)
            };
            let read = {
                let tv = self.node_var(tmp, loc);
                let de = self.node_deref(tv, loc);
                self.typed(
                    NodeKind::Member {
                        base: Box::new(de),
                        member_idx: idx,
                    },
                    loc,
                )
            };
            let write_target = {
                let tv = self.node_var(tmp, loc);
                let de = self.node_deref(tv, loc);
                self.typed(
                    NodeKind::Member {
                        base: Box::new(de),
                        member_idx: idx,
                    },
                    loc,
                )
            };
            let combined = self.make_binop(op, read, rhs, loc)?;
            let store = self.node_assign(write_target, combined, loc);
            return Ok(self.node_comma(tmp_init, store, loc));
        }

        let lhs_ty = lhs.ty.unwrap();
        let pt = self.cc.types.pointer_to(lhs_ty);
        let tmp = self.new_anon_lvar(pt);
        let addr = self.node_addr(lhs, loc);
        let tmp_init = {
            let tv = self.node_var(tmp, loc);
            self.node_assign(tv, addr, loc)
        };
        let read = {
            let tv = self.node_var(tmp, loc);
            self.node_deref(tv, loc)
        };
        let write_target = {
            let tv = self.node_var(tmp, loc);
            self.node_deref(tv, loc)
        };
        let combined = self.make_binop(op, read, rhs, loc)?;
        let store = self.node_assign(write_target, combined, loc);
        Ok(self.node_comma(tmp_init, store, loc))
    }

    fn make_binop(
        &mut self,
        op: BinOp,
        lhs: Node,
        rhs: Node,
        loc: Option<Loc>,
    ) -> Result<Node, CompileError> {
        match op {
            BinOp::Add => self.new_add(lhs, rhs, loc),
            BinOp::Sub => self.new_sub(lhs, rhs, loc),
            _ => Ok(self.node_binary(op, lhs, rhs, loc)),
        }
    }

    pub(crate) fn conditional(&mut self) -> Result<Node, CompileError> {
        let cond = self.logor()?;
        if !self.tok().is("?") {
            return Ok(cond);
        }
        let loc = self.loc();
        self.advance();
        // GNU a ?: b
        if self.tok().is(":") {
            self.advance();
            let els = self.conditional()?;
            let cond_ty = cond.ty.unwrap();
            let tmp = self.new_anon_lvar(cond_ty);
            let tv = self.node_var(tmp, loc);
            let store = self.node_assign(tv, cond, loc);
            let then_v = self.node_var(tmp, loc);
            let cond_v = self.node_var(tmp, loc);
            let sel = self.typed(
                NodeKind::Cond {
                    cond: Box::new(cond_v),
                    then_expr: Box::new(then_v),
                    else_expr: Box::new(els),
                },
                loc,
            );
            return Ok(self.node_comma(store, sel, loc));
        }
        let then_expr = self.expr()?;
        self.expect(":")?;
        let else_expr = self.conditional()?;
        Ok(self.typed(
            NodeKind::Cond {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            loc,
        ))
    }

    fn logor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.logand()?;
        while self.tok().is("||") {
            let loc = self.loc();
            self.advance();
            let rhs = self.logand()?;
            node = self.typed(
                NodeKind::LogOr {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(node)
    }

    fn logand(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitor()?;
        while self.tok().is("&&") {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitor()?;
            node = self.typed(
                NodeKind::LogAnd {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(node)
    }

    fn bitor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitxor()?;
        while self.tok().is("|") {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitxor()?;
            node = self.node_binary(BinOp::BitOr, node, rhs, loc);
        }
        Ok(node)
    }

    fn bitxor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitand()?;
        while self.tok().is("^") {
            let loc = self.loc();
            self.advance();
            let rhs = self.bitand()?;
            node = self.node_binary(BinOp::BitXor, node, rhs, loc);
        }
        Ok(node)
    }

    fn bitand(&mut self) -> Result<Node, CompileError> {
        let mut node = self.equality()?;
        while self.tok().is("&") {
            let loc = self.loc();
            self.advance();
            let rhs = self.equality()?;
            node = self.node_binary(BinOp::BitAnd, node, rhs, loc);
        }
        Ok(node)
    }

    fn equality(&mut self) -> Result<Node, CompileError> {
        let mut node = self.relational()?;
        loop {
            let loc = self.loc();
            let op = if self.tok().is("==") {
                BinOp::Eq
            } else if self.tok().is("!=") {
                BinOp::Ne
            } else {
                return Ok(node);
            };
            self.advance();
            let rhs = self.relational()?;
            let lhs = self.decay(node);
            let rhs = self.decay(rhs);
            node = self.node_binary(op, lhs, rhs, loc);
        }
    }

    fn relational(&mut self) -> Result<Node, CompileError> {
        let mut node = self.shift()?;
        loop {
            let loc = self.loc();
            let op = if self.tok().is("<=") {
                BinOp::Le
            } else if self.tok().is(">=") {
                BinOp::Ge
            } else if self.tok().is("<") {
                BinOp::Lt
            } else if self.tok().is(">") {
                BinOp::Gt
            } else {
                return Ok(node);
            };
            self.advance();
            let rhs = self.shift()?;
            let lhs = self.decay(node);
            let rhs = self.decay(rhs);
            node = self.node_binary(op, lhs, rhs, loc);
        }
    }

    fn shift(&mut self) -> Result<Node, CompileError> {
        let mut node = self.add_expr()?;
        loop {
            let loc = self.loc();
            let op = if self.tok().is("<<") {
                BinOp::Shl
            } else if self.tok().is(">>") {
                BinOp::Shr
            } else {
                return Ok(node);
            };
            self.advance();
            let rhs = self.add_expr()?;
            node = self.node_binary(op, node, rhs, loc);
        }
    }

    fn add_expr(&mut self) -> Result<Node, CompileError> {
        let mut node = self.mul_expr()?;
        loop {
            let loc = self.loc();
            if self.tok().is("+") {
                self.advance();
                let rhs = self.mul_expr()?;
                node = self.new_add(node, rhs, loc)?;
            } else if self.tok().is("-") {
                self.advance();
                let rhs = self.mul_expr()?;
                node = self.new_sub(node, rhs, loc)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn mul_expr(&mut self) -> Result<Node, CompileError> {
        let mut node = self.cast_expr()?;
        loop {
            let loc = self.loc();
            let op = if self.tok().is("*") {
                BinOp::Mul
            } else if self.tok().is("/") {
                BinOp::Div
            } else if self.tok().is("%") {
                BinOp::Mod
            } else {
                return Ok(node);
            };
            self.advance();
            let rhs = self.cast_expr()?;
            node = self.node_binary(op, node, rhs, loc);
        }
    }

    fn cast_expr(&mut self) -> Result<Node, CompileError> {
        if self.tok().is("(") && self.is_typename_at(1) {
            let start = self.pos;
            self.advance();
            let ty = self.typename()?;
            self.expect(")")?;
            if self.tok().is("{") {
                // Compound literal: hand the whole thing to postfix.
                self.pos = start;
                return self.unary();
            }
            let inner = self.cast_expr()?;
            if self.is_err_node(&inner) {
                return Ok(inner);
            }
            let inner = self.decay(inner);
            return Ok(new_cast(self.cc, inner, ty));
        }
        self.unary()
    }

    pub(crate) fn unary(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();

        if self.tok().is("+") {
            self.advance();
            return self.cast_expr();
        }
        if self.tok().is("-") {
            self.advance();
            let e = self.cast_expr()?;
            return Ok(self.typed(
                NodeKind::Neg {
                    expr: Box::new(e),
                },
                loc,
            ));
        }
        if self.tok().is("&") {
            self.advance();
            let e = self.cast_expr()?;
            if self.is_err_node(&e) {
                return Ok(e);
            }
            if let NodeKind::Member { base, member_idx } = &e.kind {
                let bt = base.ty.unwrap();
                if self
                    .cc
                    .types
                    .members_of(bt)
                    .get(*member_idx)
                    .is_some_and(|m| m.is_bitfield)
                {
                    return self.recover(loc, "cannot take the address of a bitfield".into());
                }
            }
            return Ok(self.node_addr(e, loc));
        }
        if self.tok().is("*") {
            self.advance();
            let e = self.cast_expr()?;
            if self.is_err_node(&e) {
                return Ok(e);
            }
            // Dereferencing a function (pointer) leaves it callable.
            let ty = e.ty.unwrap();
            if self.cc.types.is_func(ty) {
                return Ok(e);
            }
            if let Some(base) = self.cc.types.base_of(ty) {
                if self.cc.types.is_func(base) {
                    let mut n = e;
                    n.ty = Some(base);
                    return Ok(n);
                }
            }
            let e = self.decay(e);
            return Ok(self.node_deref(e, loc));
        }
        if self.tok().is("!") {
            self.advance();
            let e = self.cast_expr()?;
            return Ok(self.typed(
                NodeKind::LogNot {
                    expr: Box::new(e),
                },
                loc,
            ));
        }
        if self.tok().is("~") {
            self.advance();
            let e = self.cast_expr()?;
            return Ok(self.typed(
                NodeKind::BitNot {
                    expr: Box::new(e),
                },
                loc,
            ));
        }
        if self.tok().is("++") {
            self.advance();
            let e = self.unary()?;
            let one = self.node_num(1, loc);
            return self.to_assign(BinOp::Add, e, one, loc);
        }
        if self.tok().is("--") {
            self.advance();
            let e = self.unary()?;
            let one = self.node_num(1, loc);
            return self.to_assign(BinOp::Sub, e, one, loc);
        }
        // Label address: &&label
        if self.tok().is("&&") {
            self.advance();
            let name = self.advance();
            if name.kind != TokenKind::Ident {
                return Err(self.error_at(Some(name.loc), "label name expected after &&"));
            }
            return Ok(self.typed(
                NodeKind::LabelVal {
                    label: format!("u.{}", name.text),
                },
                loc,
            ));
        }
        if self.tok().is("sizeof") {
            self.advance();
            if self.tok().is("(") && self.is_typename_at(1) {
                self.advance();
                let ty = self.typename()?;
                self.expect(")")?;
                return self.sizeof_type(ty, loc);
            }
            let mut e = self.unary()?;
            add_type(self.cc, &mut e);
            if self.is_err_node(&e) {
                return Ok(e);
            }
            return self.sizeof_type(e.ty.unwrap(), loc);
        }
        if self.tok().is("_Alignof") {
            self.advance();
            self.expect("(")?;
            let align = if self.is_typename_at(0) {
                let ty = self.typename()?;
                self.cc.types.get(ty).align
            } else {
                let mut e = self.unary()?;
                add_type(self.cc, &mut e);
                self.cc.types.get(e.ty.unwrap()).align
            };
            self.expect(")")?;
            let mut n = self.node_num(align, loc);
            n.ty = Some(self.cc.types.ty_ulong);
            return Ok(n);
        }
        self.postfix()
    }

    fn sizeof_type(&mut self, ty: TypeId, loc: Option<Loc>) -> Result<Node, CompileError> {
        if let TypeKind::Vla { size_var, .. } = self.cc.types.get(ty).kind {
            let Some(var) = size_var else {
                return self.recover(loc, "sizeof applied to an unbound variable-length array".into());
            };
            return Ok(self.node_var(var, loc));
        }
        let size = self.cc.types.get(ty).size;
        if size < 0 {
            return self.recover(loc, "sizeof applied to an incomplete type".into());
        }
        let mut n = self.node_num(size, loc);
        n.ty = Some(self.cc.types.ty_ulong);
        Ok(n)
    }

    fn postfix(&mut self) -> Result<Node, CompileError> {
        // Compound literal: "(" type-name ")" "{" ... "}"
        if self.tok().is("(") && self.is_typename_at(1) {
            let loc = self.loc();
            self.advance();
            let ty = self.typename()?;
            self.expect(")")?;
            let node = init::compound_literal(self, ty, loc)?;
            return self.postfix_tail(node);
        }
        let node = self.primary()?;
        self.postfix_tail(node)
    }

    fn postfix_tail(&mut self, mut node: Node) -> Result<Node, CompileError> {
        loop {
            let loc = self.loc();
            if self.tok().is("(") {
                self.advance();
                node = self.funcall(node, loc)?;
                continue;
            }
            if self.tok().is("[") {
                self.advance();
                let idx = self.expr()?;
                self.expect("]")?;
                let sum = self.new_add(node, idx, loc)?;
                if self.is_err_node(&sum) {
                    node = sum;
                    continue;
                }
                node = self.node_deref(sum, loc);
                continue;
            }
            if self.tok().is(".") {
                self.advance();
                let name = self.advance();
                node = self.struct_ref(node, &name, loc)?;
                continue;
            }
            if self.tok().is("->") {
                self.advance();
                let name = self.advance();
                if self.is_err_node(&node) {
                    continue;
                }
                let de = self.decay(node);
                let de = self.node_deref(de, loc);
                node = self.struct_ref(de, &name, loc)?;
                continue;
            }
            if self.tok().is("++") {
                self.advance();
                node = self.post_inc_dec(node, 1, loc)?;
                continue;
            }
            if self.tok().is("--") {
                self.advance();
                node = self.post_inc_dec(node, -1, loc)?;
                continue;
            }
            return Ok(node);
        }
    }

    /// `A++` is `(typeof A)((A += 1) - 1)`.
    fn post_inc_dec(&mut self, node: Node, delta: i64, loc: Option<Loc>) -> Result<Node, CompileError> {
        if self.is_err_node(&node) {
            return Ok(node);
        }
        let ty = node.ty.unwrap();
        let d = self.node_num(delta, loc);
        let incremented = self.to_assign(BinOp::Add, node, d, loc)?;
        let neg = self.node_num(-delta, loc);
        let back = self.new_add(incremented, neg, loc)?;
        if self.is_err_node(&back) {
            return Ok(back);
        }
        Ok(new_cast(self.cc, back, ty))
    }

    fn struct_ref(&mut self, node: Node, name: &Token, loc: Option<Loc>) -> Result<Node, CompileError> {
        if self.is_err_node(&node) {
            return Ok(node);
        }
        if name.kind != TokenKind::Ident {
            return self.recover(loc, "member name expected".into());
        }
        let ty = node.ty.unwrap();
        if !self.cc.types.is_struct_or_union(ty) {
            return self.recover(
                loc,
                format!("'{}' is not a struct or union", self.cc.types.display(ty)),
            );
        }
        let Some(path) = member_path(self, ty, &name.text) else {
            return self.recover(loc, format!("no member named '{}'", name.text));
        };
        let mut cur = node;
        for idx in path {
            cur = self.typed(
                NodeKind::Member {
                    base: Box::new(cur),
                    member_idx: idx,
                },
                loc,
            );
        }
        Ok(cur)
    }

    fn funcall(&mut self, func: Node, loc: Option<Loc>) -> Result<Node, CompileError> {
        // Collect arguments first so parsing always continues.
        let mut args: Vec<Node> = Vec::new();
        while !self.tok().is(")") {
            if !args.is_empty() {
                self.expect(",")?;
            }
            let mut a = self.assign()?;
            add_type(self.cc, &mut a);
            args.push(self.decay(a));
        }
        self.expect(")")?;

        if self.is_err_node(&func) {
            return Ok(self.error_node());
        }
        let fty = func.ty.unwrap();
        let fty = match self.cc.types.get(fty).kind {
            TypeKind::Func { .. } => fty,
            TypeKind::Ptr { base } if self.cc.types.is_func(base) => base,
            _ => {
                return self.recover(loc, "called object is not a function".into());
            }
        };
        let (params, variadic) = match &self.cc.types.get(fty).kind {
            TypeKind::Func {
                params,
                is_variadic,
                ..
            } => (params.clone(), *is_variadic),
            _ => unreachable!(),
        };

        if args.len() > cvm_core::isa::NUM_ARG_REGS {
            return self.recover(
                loc,
                format!(
                    "too many call arguments (at most {} are supported)",
                    cvm_core::isa::NUM_ARG_REGS
                ),
            );
        }
        if !params.is_empty() {
            if args.len() < params.len() {
                return self.recover(loc, "too few arguments in call".into());
            }
            if args.len() > params.len() && !variadic {
                return self.recover(loc, "too many arguments in call".into());
            }
        }

        // Fixed arguments convert to parameter types; extra (variadic or
        // unprototyped) arguments get the default promotions.
        for (i, arg) in args.iter_mut().enumerate() {
            let at = arg.ty.unwrap();
            if self.cc.types.is_error(at) {
                return Ok(self.error_node());
            }
            if let Some(&pt) = params.get(i) {
                if !self.cc.types.is_struct_or_union(pt) {
                    let owned = std::mem::replace(arg, Node::null(None));
                    *arg = new_cast(self.cc, owned, pt);
                }
            } else {
                let promoted = if matches!(self.cc.types.get(at).kind, TypeKind::Float) {
                    Some(self.cc.types.ty_double)
                } else if self.cc.types.is_integer(at) && self.cc.types.get(at).size < 4 {
                    Some(self.cc.types.ty_int)
                } else {
                    None
                };
                if let Some(pt) = promoted {
                    let owned = std::mem::replace(arg, Node::null(None));
                    *arg = new_cast(self.cc, owned, pt);
                }
            }
        }

        Ok(self.typed(
            NodeKind::Funcall {
                func: Box::new(func),
                args,
            },
            loc,
        ))
    }

    fn generic_selection(&mut self, loc: Option<Loc>) -> Result<Node, CompileError> {
        self.expect("(")?;
        let mut ctrl = self.assign()?;
        add_type(self.cc, &mut ctrl);
        let mut ctrl_ty = ctrl.ty.unwrap();
        // The controlling expression undergoes lvalue conversion.
        match self.cc.types.get(ctrl_ty).kind {
            TypeKind::Array { base, .. } | TypeKind::Vla { base, .. } => {
                ctrl_ty = self.cc.types.pointer_to(base);
            }
            TypeKind::Func { .. } => {
                ctrl_ty = self.cc.types.pointer_to(ctrl_ty);
            }
            _ => {}
        }
        let mut selected: Option<Node> = None;
        let mut default_expr: Option<Node> = None;
        while self.tok().is(",") {
            self.advance();
            if self.tok().is("default") {
                self.advance();
                self.expect(":")?;
                let e = self.assign()?;
                default_expr = Some(e);
                continue;
            }
            let ty = self.typename()?;
            self.expect(":")?;
            let e = self.assign()?;
            if self.cc.types.is_compatible(ty, ctrl_ty) && selected.is_none() {
                selected = Some(e);
            }
        }
        self.expect(")")?;
        match selected.or(default_expr) {
            Some(e) => Ok(e),
            None => self.recover(loc, "controlling expression matches no generic association".into()),
        }
    }

    fn primary(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();

        // GNU statement expression: ({ ... })
        if self.tok().is("(") && self.la(1).is("{") {
            self.advance();
            self.advance();
            let block = self.compound_stmt()?;
            self.expect(")")?;
            let body = match block.kind {
                NodeKind::Block { body } => body,
                _ => Vec::new(),
            };
            return Ok(self.typed(NodeKind::StmtExpr { body }, loc));
        }

        if self.tok().is("(") {
            self.advance();
            let e = self.expr()?;
            self.expect(")")?;
            return Ok(e);
        }

        if self.tok().is("_Generic") {
            self.advance();
            return self.generic_selection(loc);
        }

        if self.tok().is("__builtin_va_start") {
            self.advance();
            self.expect("(")?;
            self.expect(")")?;
            if !self.cur_fn_variadic {
                return self.recover(loc, "va_start outside a variadic function".into());
            }
            return Ok(self.typed(NodeKind::VaStart, loc));
        }

        if self.tok().is("__builtin_compare_and_swap") {
            self.advance();
            self.expect("(")?;
            let addr = self.assign()?;
            self.expect(",")?;
            let expected = self.assign()?;
            self.expect(",")?;
            let desired = self.assign()?;
            self.expect(")")?;
            return Ok(self.typed(
                NodeKind::Cas {
                    addr: Box::new(addr),
                    expected: Box::new(expected),
                    desired: Box::new(desired),
                },
                loc,
            ));
        }

        if self.tok().is("__builtin_atomic_exchange") {
            self.advance();
            self.expect("(")?;
            let addr = self.assign()?;
            self.expect(",")?;
            let val = self.assign()?;
            self.expect(")")?;
            return Ok(self.typed(
                NodeKind::Exch {
                    addr: Box::new(addr),
                    val: Box::new(val),
                },
                loc,
            ));
        }

        let tok = self.tok().clone();
        match tok.kind {
            TokenKind::Ident => {
                self.advance();
                match self.lookup(&tok.text) {
                    Some(ScopeEntry::Var(obj)) => Ok(self.node_var(obj, loc)),
                    Some(ScopeEntry::EnumConst { ty, val }) => {
                        let mut n = self.node_num(val, loc);
                        n.ty = Some(ty);
                        Ok(n)
                    }
                    Some(ScopeEntry::Typedef(_)) => {
                        self.recover(loc, format!("unexpected type name '{}'", tok.text))
                    }
                    None => {
                        if self.tok().is("(") {
                            self.recover(
                                loc,
                                format!("implicit declaration of function '{}'", tok.text),
                            )
                        } else {
                            self.recover(loc, format!("undefined variable '{}'", tok.text))
                        }
                    }
                }
            }
            TokenKind::Num | TokenKind::Char => {
                self.advance();
                match tok.value {
                    TokenValue::Int { val, ty } => {
                        let tid = self.numtype(ty);
                        Ok(Node::typed(NodeKind::Num { val }, tid, loc))
                    }
                    TokenValue::Float { val, ty } => {
                        let tid = self.numtype(ty);
                        Ok(Node::typed(NodeKind::FNum { val }, tid, loc))
                    }
                    _ => Err(self.error_at(Some(tok.loc), "malformed numeric literal")),
                }
            }
            TokenKind::Str => {
                self.advance();
                let (bytes, enc) = match tok.value {
                    TokenValue::Str { bytes, enc } => (bytes, enc),
                    _ => unreachable!(),
                };
                let elem = match enc {
                    StrEncoding::Narrow | StrEncoding::Utf8 => self.cc.types.ty_char,
                    StrEncoding::Utf16 => self.cc.types.ty_ushort,
                    StrEncoding::Utf32 => self.cc.types.ty_uint,
                    StrEncoding::Wide => self.cc.types.ty_int,
                };
                let obj = self.new_string_literal(bytes, elem);
                Ok(self.node_var(obj, loc))
            }
            _ => Err(self.error_at(
                Some(tok.loc),
                format!("expected an expression, found '{}'", tok.text),
            )),
        }
    }

    fn numtype(&self, ty: NumType) -> TypeId {
        let t = &self.cc.types;
        match ty {
            NumType::Int => t.ty_int,
            NumType::UInt => t.ty_uint,
            NumType::Long => t.ty_long,
            NumType::ULong => t.ty_ulong,
            NumType::Float => t.ty_float,
            NumType::Double => t.ty_double,
            NumType::LongDouble => t.ty_ldouble,
        }
    }
}

/// Member lookup with descent through anonymous struct/union members.
fn member_path(p: &Parser<'_>, ty: TypeId, name: &str) -> Option<Vec<usize>> {
    let members = p.cc.types.members_of(ty);
    for (i, m) in members.iter().enumerate() {
        if m.name.as_deref() == Some(name) {
            return Some(vec![i]);
        }
        if m.name.is_none() && !m.is_bitfield && p.cc.types.is_struct_or_union(m.ty) {
            if let Some(mut path) = member_path(p, m.ty, name) {
                path.insert(0, i);
                return Some(path);
            }
        }
    }
    None
}
