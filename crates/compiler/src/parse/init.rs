//! Initializers and constant expression evaluation.
//!
//! An initializer parses into a tree mirroring the initialized type, then
//! lowers two ways: locals become a zero-fill plus a chain of ordinary
//! assignments evaluated at declaration time; globals are serialized into
//! initializer bytes, with address constants recorded as relocations
//! resolved at segment layout.

use super::Parser;
use crate::ast::{BinOp, Node, NodeKind, ObjId, Reloc};
use crate::error::CompileError;
use crate::token::{TokenKind, TokenValue};
use crate::typecheck::{add_type, new_cast};
use crate::types::{TypeId, TypeKind};
use crate::Compiler;
use cvm_core::source::Loc;

struct Initializer {
    ty: TypeId,
    expr: Option<Node>,
    children: Vec<Initializer>,
    /// Incomplete array whose length the initializer determines.
    is_flexible: bool,
    /// Which union member the initializer wrote.
    active: usize,
}

fn new_initializer(p: &mut Parser<'_>, ty: TypeId, flexible: bool) -> Initializer {
    let mut init = Initializer {
        ty,
        expr: None,
        children: Vec::new(),
        is_flexible: false,
        active: 0,
    };
    match p.cc.types.get(ty).kind.clone() {
        TypeKind::Array { base, len } => {
            if len < 0 && flexible {
                init.is_flexible = true;
            } else {
                for _ in 0..len.max(0) {
                    init.children.push(new_initializer(p, base, false));
                }
            }
        }
        TypeKind::Struct {
            ref members,
            is_flexible: flex,
            ..
        } => {
            let members = members.clone();
            let n = members.len();
            for (i, m) in members.iter().enumerate() {
                let last_flex = flex && i == n - 1 && flexible;
                init.children.push(new_initializer(p, m.ty, last_flex));
            }
        }
        _ => {}
    }
    init
}

fn array_base(p: &Parser<'_>, ty: TypeId) -> TypeId {
    p.cc.types.base_of(ty).unwrap()
}

/// Grow a flexible array initializer so index `n` exists.
fn ensure_child(p: &mut Parser<'_>, init: &mut Initializer, n: usize) {
    let base = array_base(p, init.ty);
    while init.children.len() <= n {
        let c = new_initializer(p, base, false);
        init.children.push(c);
    }
}

fn is_struct_design_skippable(p: &Parser<'_>, ty: TypeId, idx: usize) -> bool {
    // Unnamed bitfields take no initializer.
    p.cc.types
        .members_of(ty)
        .get(idx)
        .is_some_and(|m| m.name.is_none() && m.is_bitfield)
}

impl<'a> Parser<'a> {
    fn is_end_of_list(&self) -> bool {
        self.tok().is("}") || (self.tok().is(",") && self.la(1).is("}"))
    }

    fn consume_end(&mut self) -> bool {
        if self.eat("}") {
            return true;
        }
        if self.tok().is(",") && self.la(1).is("}") {
            self.advance();
            self.advance();
            return true;
        }
        false
    }
}

fn string_init_units(bytes: &[u8], elem_size: i64) -> Vec<i64> {
    let mut out = Vec::new();
    let n = elem_size as usize;
    for chunk in bytes.chunks(n) {
        let mut v: i64 = 0;
        for (i, b) in chunk.iter().enumerate() {
            v |= (*b as i64) << (8 * i);
        }
        out.push(v);
    }
    out
}

fn initializer2(p: &mut Parser<'_>, init: &mut Initializer) -> Result<(), CompileError> {
    let ty = init.ty;
    let kind = p.cc.types.get(ty).kind.clone();

    match kind {
        TypeKind::Array { base, .. } => {
            // A string literal initializes a character (or wide) array.
            if p.tok().kind == TokenKind::Str {
                let tok = p.advance();
                let (bytes, _) = match tok.value {
                    TokenValue::Str { bytes, enc } => (bytes, enc),
                    _ => unreachable!(),
                };
                let esize = p.cc.types.get(base).size.max(1);
                let units = string_init_units(&bytes, esize);
                if init.is_flexible {
                    ensure_child(p, init, units.len().saturating_sub(1));
                    init.is_flexible = false;
                    init.ty = p.cc.types.array_of(base, units.len() as i64);
                }
                for (i, u) in units.iter().enumerate() {
                    if i >= init.children.len() {
                        break;
                    }
                    init.children[i].expr =
                        Some(Node::typed(NodeKind::Num { val: *u }, base, Some(tok.loc)));
                }
                return Ok(());
            }
            if p.tok().is("{") {
                return array_initializer_braced(p, init);
            }
            return array_initializer_unbraced(p, init);
        }
        TypeKind::Struct { is_union, .. } => {
            if !p.tok().is("{") {
                // A bare expression of the same aggregate type copies it.
                let save = p.pos;
                let mut e = p.assign()?;
                add_type(p.cc, &mut e);
                if e.ty.is_some_and(|t| p.cc.types.is_compatible(t, ty))
                    || e.ty.is_some_and(|t| p.cc.types.is_error(t))
                {
                    init.expr = Some(e);
                    return Ok(());
                }
                p.pos = save;
                return struct_initializer_unbraced(p, init, is_union);
            }
            if is_union {
                return union_initializer_braced(p, init);
            }
            return struct_initializer_braced(p, init);
        }
        TypeKind::Vla { .. } => Err(p.error_here("cannot initialize a variable-length array")),
        _ => {
            // Scalar, possibly brace-wrapped.
            if p.eat("{") {
                initializer2(p, init)?;
                p.expect("}")?;
                return Ok(());
            }
            let mut e = p.assign()?;
            add_type(p.cc, &mut e);
            init.expr = Some(e);
            Ok(())
        }
    }
}

fn array_initializer_braced(
    p: &mut Parser<'_>,
    init: &mut Initializer,
) -> Result<(), CompileError> {
    p.expect("{")?;
    let mut idx: usize = 0;
    let mut max_written: usize = 0;
    let mut first = true;
    while !p.consume_end() {
        if !first {
            p.expect(",")?;
        }
        first = false;
        if p.tok().is("[") {
            p.advance();
            let mut e = p.conditional()?;
            add_type(p.cc, &mut e);
            let v = eval_const(p.cc, &e)
                .map_err(|_| p.error_here("array designator must be constant"))?;
            if v < 0 {
                return Err(p.error_here("array designator index is negative"));
            }
            p.expect("]")?;
            idx = v as usize;
            if init.is_flexible {
                ensure_child(p, init, idx);
            }
            if idx >= init.children.len() {
                return Err(p.error_here("array designator index out of bounds"));
            }
            designation_tail(p, &mut init.children[idx])?;
            max_written = max_written.max(idx + 1);
            idx += 1;
            continue;
        }
        if init.is_flexible {
            ensure_child(p, init, idx);
        }
        if idx >= init.children.len() {
            return Err(p.error_here("excess elements in array initializer"));
        }
        initializer2(p, &mut init.children[idx])?;
        max_written = max_written.max(idx + 1);
        idx += 1;
    }
    if init.is_flexible {
        let base = array_base(p, init.ty);
        init.ty = p.cc.types.array_of(base, max_written.max(init.children.len()) as i64);
        init.is_flexible = false;
    }
    Ok(())
}

fn array_initializer_unbraced(
    p: &mut Parser<'_>,
    init: &mut Initializer,
) -> Result<(), CompileError> {
    let mut idx = 0usize;
    let mut first = true;
    while !p.is_end_of_list() && !p.tok().is_eof() {
        if !first && !p.tok().is(",") {
            break;
        }
        if !first {
            p.advance();
        }
        first = false;
        if init.is_flexible {
            ensure_child(p, init, idx);
        }
        if idx >= init.children.len() {
            break;
        }
        initializer2(p, &mut init.children[idx])?;
        idx += 1;
    }
    if init.is_flexible {
        let base = array_base(p, init.ty);
        init.ty = p.cc.types.array_of(base, idx as i64);
        init.is_flexible = false;
    }
    Ok(())
}

/// After a designator chain's head, either continue the chain or read the
/// `= value` (the `=` is optional in GNU C).
fn designation_tail(p: &mut Parser<'_>, init: &mut Initializer) -> Result<(), CompileError> {
    if p.tok().is("[") {
        let ty = init.ty;
        if !matches!(p.cc.types.get(ty).kind, TypeKind::Array { .. }) {
            return Err(p.error_here("array designator on a non-array"));
        }
        p.advance();
        let mut e = p.conditional()?;
        add_type(p.cc, &mut e);
        let v = eval_const(p.cc, &e)
            .map_err(|_| p.error_here("array designator must be constant"))?;
        p.expect("]")?;
        let idx = v.max(0) as usize;
        if init.is_flexible {
            ensure_child(p, init, idx);
        }
        if idx >= init.children.len() {
            return Err(p.error_here("array designator index out of bounds"));
        }
        return designation_tail(p, &mut init.children[idx]);
    }
    if p.tok().is(".") {
        p.advance();
        let name = p.advance();
        let ty = init.ty;
        if !p.cc.types.is_struct_or_union(ty) {
            return Err(p.error_at(
                Some(name.loc),
                "member designator on a non-struct",
            ));
        }
        let idx = p
            .cc
            .types
            .members_of(ty)
            .iter()
            .position(|m| m.name.as_deref() == Some(name.text.as_str()))
            .ok_or_else(|| {
                p.error_at(Some(name.loc), format!("no member named '{}'", name.text))
            })?;
        init.active = idx;
        return designation_tail(p, &mut init.children[idx]);
    }
    let _ = p.eat("=");
    initializer2(p, init)
}

fn struct_initializer_braced(
    p: &mut Parser<'_>,
    init: &mut Initializer,
) -> Result<(), CompileError> {
    p.expect("{")?;
    let ty = init.ty;
    let nmembers = init.children.len();
    let mut idx = 0usize;
    let mut first = true;
    while !p.consume_end() {
        if !first {
            p.expect(",")?;
        }
        first = false;
        if p.tok().is(".") {
            let name = p.la(1).clone();
            let pos = p
                .cc
                .types
                .members_of(ty)
                .iter()
                .position(|m| m.name.as_deref() == Some(name.text.as_str()));
            match pos {
                Some(i) => {
                    p.advance(); // .
                    p.advance(); // name
                    designation_tail(p, &mut init.children[i])?;
                    idx = i + 1;
                    continue;
                }
                None => {
                    return Err(p.error_at(
                        Some(name.loc),
                        format!("no member named '{}'", name.text),
                    ))
                }
            }
        }
        while idx < nmembers && is_struct_design_skippable(p, ty, idx) {
            idx += 1;
        }
        if idx >= nmembers {
            return Err(p.error_here("excess elements in struct initializer"));
        }
        initializer2(p, &mut init.children[idx])?;
        idx += 1;
    }
    Ok(())
}

fn struct_initializer_unbraced(
    p: &mut Parser<'_>,
    init: &mut Initializer,
    is_union: bool,
) -> Result<(), CompileError> {
    let ty = init.ty;
    let nmembers = init.children.len();
    let mut idx = 0usize;
    let mut first = true;
    while idx < nmembers && !p.is_end_of_list() && !p.tok().is_eof() {
        if !first && !p.tok().is(",") {
            break;
        }
        if !first {
            p.advance();
        }
        first = false;
        while idx < nmembers && is_struct_design_skippable(p, ty, idx) {
            idx += 1;
        }
        if idx >= nmembers {
            break;
        }
        initializer2(p, &mut init.children[idx])?;
        init.active = idx;
        idx += 1;
        if is_union {
            break;
        }
    }
    Ok(())
}

fn union_initializer_braced(
    p: &mut Parser<'_>,
    init: &mut Initializer,
) -> Result<(), CompileError> {
    p.expect("{")?;
    let ty = init.ty;
    if p.tok().is(".") {
        let name = p.la(1).clone();
        let idx = p
            .cc
            .types
            .members_of(ty)
            .iter()
            .position(|m| m.name.as_deref() == Some(name.text.as_str()))
            .ok_or_else(|| {
                p.error_at(Some(name.loc), format!("no member named '{}'", name.text))
            })?;
        p.advance();
        p.advance();
        init.active = idx;
        designation_tail(p, &mut init.children[idx])?;
    } else if !p.tok().is("}") {
        init.active = 0;
        initializer2(p, &mut init.children[0])?;
    }
    while p.tok().is(",") && !p.la(1).is("}") {
        // Later initializers overwrite; keep parsing for correctness.
        p.advance();
        initializer2(p, &mut init.children[init.active])?;
    }
    let _ = p.consume_end() || p.eat("}");
    Ok(())
}

// --- lowering: locals ----------------------------------------------------

/// Lvalue designation while walking the initializer tree.
enum Desg<'d> {
    Var(ObjId),
    Index(&'d Desg<'d>, i64),
    Member(&'d Desg<'d>, usize),
}

fn desg_expr(p: &mut Parser<'_>, desg: &Desg<'_>, loc: Option<Loc>) -> Result<Node, CompileError> {
    match desg {
        Desg::Var(obj) => Ok(p.node_var(*obj, loc)),
        Desg::Member(parent, idx) => {
            let base = desg_expr(p, parent, loc)?;
            let mut n = Node::new(
                NodeKind::Member {
                    base: Box::new(base),
                    member_idx: *idx,
                },
                loc,
            );
            add_type(p.cc, &mut n);
            Ok(n)
        }
        Desg::Index(parent, i) => {
            let base = desg_expr(p, parent, loc)?;
            let idx = p.node_num(*i, loc);
            let sum = p.new_add(base, idx, loc)?;
            let mut n = Node::new(
                NodeKind::Deref {
                    expr: Box::new(sum),
                },
                loc,
            );
            add_type(p.cc, &mut n);
            Ok(n)
        }
    }
}

fn create_lvar_init(
    p: &mut Parser<'_>,
    init: &Initializer,
    desg: &Desg<'_>,
    loc: Option<Loc>,
) -> Result<Option<Node>, CompileError> {
    let kind = p.cc.types.get(init.ty).kind.clone();
    match kind {
        TypeKind::Array { .. } => {
            let mut chain: Option<Node> = None;
            for (i, child) in init.children.iter().enumerate() {
                let d = Desg::Index(desg, i as i64);
                if let Some(n) = create_lvar_init(p, child, &d, loc)? {
                    chain = Some(match chain {
                        Some(c) => comma(p, c, n, loc),
                        None => n,
                    });
                }
            }
            Ok(chain)
        }
        TypeKind::Struct { is_union, .. } => {
            if let Some(e) = &init.expr {
                // Whole-aggregate copy.
                let target = desg_expr(p, desg, loc)?;
                let e = e.clone();
                return Ok(Some(init_assign(p, target, e, loc)));
            }
            if is_union {
                let child = &init.children[init.active];
                let d = Desg::Member(desg, init.active);
                return create_lvar_init(p, child, &d, loc);
            }
            let mut chain: Option<Node> = None;
            for (i, child) in init.children.iter().enumerate() {
                let d = Desg::Member(desg, i);
                if let Some(n) = create_lvar_init(p, child, &d, loc)? {
                    chain = Some(match chain {
                        Some(c) => comma(p, c, n, loc),
                        None => n,
                    });
                }
            }
            Ok(chain)
        }
        _ => match &init.expr {
            Some(e) => {
                let target = desg_expr(p, desg, loc)?;
                let e = e.clone();
                Ok(Some(init_assign(p, target, e, loc)))
            }
            None => Ok(None),
        },
    }
}

/// An initializing store. Unlike a plain assignment this may write
/// through const: initialization is what gives a const object its value.
fn init_assign(p: &mut Parser<'_>, target: Node, value: Node, loc: Option<Loc>) -> Node {
    let lt = target.ty.unwrap();
    let value = if !p.cc.types.is_struct_or_union(lt)
        && !p.cc.types.is_error(lt)
        && !value.ty.is_some_and(|t| p.cc.types.is_error(t))
    {
        new_cast(p.cc, value, lt)
    } else {
        value
    };
    Node::typed(
        NodeKind::Assign {
            lhs: Box::new(target),
            rhs: Box::new(value),
        },
        lt,
        loc,
    )
}

fn comma(p: &mut Parser<'_>, lhs: Node, rhs: Node, loc: Option<Loc>) -> Node {
    let mut n = Node::new(
        NodeKind::Comma {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        loc,
    );
    add_type(p.cc, &mut n);
    n
}

/// Parse `= initializer` for a local and lower it to an expression:
/// zero-fill then assignments in source order.
pub(super) fn lvar_initializer(p: &mut Parser<'_>, var: ObjId) -> Result<Node, CompileError> {
    let loc = p.loc();
    let ty = p.cc.objs.get(var).ty;
    let mut init = new_initializer(p, ty, true);
    initializer2(p, &mut init)?;
    // A flexible initializer fixed the length; retype the variable.
    if init.ty != ty {
        p.cc.objs.get_mut(var).ty = init.ty;
    }
    let mut zero = Node::new(NodeKind::MemZero { var }, loc);
    add_type(p.cc, &mut zero);
    let desg = Desg::Var(var);
    let chain = create_lvar_init(p, &init, &desg, loc)?;
    Ok(match chain {
        Some(c) => comma(p, zero, c, loc),
        None => zero,
    })
}

/// A compound literal `(T){...}`: a local temporary inside functions, an
/// anonymous global at file scope.
pub(super) fn compound_literal(
    p: &mut Parser<'_>,
    ty: TypeId,
    loc: Option<Loc>,
) -> Result<Node, CompileError> {
    if p.cur_fn_ret.is_some() {
        let var = p.new_anon_lvar(ty);
        let chain = lvar_initializer(p, var)?;
        let v = p.node_var(var, loc);
        return Ok(comma(p, chain, v, loc));
    }
    let name = p.cc.new_unique_name("cl");
    let mut obj = crate::ast::Obj::new(name, ty);
    obj.is_definition = true;
    obj.is_static = true;
    let id = p.cc.objs.alloc(obj);
    p.globals.push(id);
    gvar_initializer(p, id)?;
    Ok(p.node_var(id, loc))
}

// --- lowering: globals ----------------------------------------------------

pub(super) fn gvar_initializer(p: &mut Parser<'_>, var: ObjId) -> Result<(), CompileError> {
    let ty = p.cc.objs.get(var).ty;
    let mut init = new_initializer(p, ty, true);
    initializer2(p, &mut init)?;
    if init.ty != ty {
        p.cc.objs.get_mut(var).ty = init.ty;
    }
    let size = p.cc.types.get(init.ty).size.max(0) as usize;
    let mut buf = vec![0u8; size];
    let mut relocs: Vec<Reloc> = Vec::new();
    write_gvar_data(p, &init, 0, &mut buf, &mut relocs)?;
    let obj = p.cc.objs.get_mut(var);
    obj.init_data = Some(buf);
    obj.relocs = relocs;
    Ok(())
}

fn write_gvar_data(
    p: &mut Parser<'_>,
    init: &Initializer,
    offset: usize,
    buf: &mut [u8],
    relocs: &mut Vec<Reloc>,
) -> Result<(), CompileError> {
    let kind = p.cc.types.get(init.ty).kind.clone();
    match kind {
        TypeKind::Array { base, .. } => {
            let esize = p.cc.types.get(base).size.max(1) as usize;
            for (i, child) in init.children.iter().enumerate() {
                write_gvar_data(p, child, offset + i * esize, buf, relocs)?;
            }
            Ok(())
        }
        TypeKind::Struct {
            ref members,
            is_union,
            ..
        } => {
            if let Some(e) = &init.expr {
                return Err(p.error_at(
                    e.loc,
                    "initializer element is not a compile-time constant",
                ));
            }
            let members = members.clone();
            for (i, child) in init.children.iter().enumerate() {
                if is_union && i != init.active {
                    continue;
                }
                let m = &members[i];
                if m.is_bitfield {
                    let Some(e) = &child.expr else { continue };
                    let val = eval_const(p.cc, e).map_err(|_| {
                        p.error_at(e.loc, "initializer element is not a compile-time constant")
                    })?;
                    let unit = p.cc.types.get(m.ty).size as usize;
                    let at = offset + m.offset as usize;
                    let mut word: u64 = 0;
                    for b in 0..unit {
                        word |= (buf[at + b] as u64) << (8 * b);
                    }
                    let mask = if m.bit_width >= 64 {
                        u64::MAX
                    } else {
                        (1u64 << m.bit_width) - 1
                    };
                    word &= !(mask << m.bit_offset);
                    word |= ((val as u64) & mask) << m.bit_offset;
                    for b in 0..unit {
                        buf[at + b] = (word >> (8 * b)) as u8;
                    }
                } else {
                    write_gvar_data(p, child, offset + m.offset as usize, buf, relocs)?;
                }
            }
            Ok(())
        }
        _ => {
            let Some(e) = &init.expr else {
                return Ok(());
            };
            let size = p.cc.types.get(init.ty).size.max(0) as usize;
            if p.cc.types.is_flonum(init.ty) {
                let v = eval_const_float(p.cc, e).map_err(|_| {
                    p.error_at(e.loc, "initializer element is not a compile-time constant")
                })?;
                let bytes = if size == 4 {
                    (v as f32).to_le_bytes().to_vec()
                } else {
                    v.to_le_bytes().to_vec()
                };
                buf[offset..offset + size.min(8)].copy_from_slice(&bytes[..size.min(8)]);
                return Ok(());
            }
            match eval_addr(p.cc, e) {
                Ok((Some(symbol), addend)) => {
                    relocs.push(Reloc {
                        offset,
                        symbol,
                        addend,
                    });
                    Ok(())
                }
                Ok((None, val)) => {
                    let bytes = val.to_le_bytes();
                    buf[offset..offset + size.min(8)].copy_from_slice(&bytes[..size.min(8)]);
                    Ok(())
                }
                Err(()) => Err(p.error_at(
                    e.loc,
                    "initializer element is not a compile-time constant",
                )),
            }
        }
    }
}

// --- constant evaluation --------------------------------------------------

fn mask_to(val: i64, ty_size: i64, unsigned: bool) -> i64 {
    match ty_size {
        1 => {
            if unsigned {
                (val as u8) as i64
            } else {
                (val as i8) as i64
            }
        }
        2 => {
            if unsigned {
                (val as u16) as i64
            } else {
                (val as i16) as i64
            }
        }
        4 => {
            if unsigned {
                (val as u32) as i64
            } else {
                (val as i32) as i64
            }
        }
        _ => val,
    }
}

/// Evaluate an integer constant expression.
pub(crate) fn eval_const(cc: &Compiler, node: &Node) -> Result<i64, ()> {
    let unsigned_ctx = node
        .ty
        .map(|t| cc.types.get(t).is_unsigned)
        .unwrap_or(false);
    match &node.kind {
        NodeKind::Num { val } => Ok(*val),
        NodeKind::FNum { val } => Ok(*val as i64),
        NodeKind::Binary { op, lhs, rhs } => {
            let l = eval_const(cc, lhs)?;
            let r = eval_const(cc, rhs)?;
            let u = unsigned_ctx
                || lhs
                    .ty
                    .map(|t| cc.types.get(t).is_unsigned)
                    .unwrap_or(false);
            Ok(match op {
                BinOp::Add => l.wrapping_add(r),
                BinOp::Sub => l.wrapping_sub(r),
                BinOp::Mul => l.wrapping_mul(r),
                BinOp::Div => {
                    if r == 0 {
                        return Err(());
                    }
                    if u {
                        ((l as u64) / (r as u64)) as i64
                    } else {
                        l.wrapping_div(r)
                    }
                }
                BinOp::Mod => {
                    if r == 0 {
                        return Err(());
                    }
                    if u {
                        ((l as u64) % (r as u64)) as i64
                    } else {
                        l.wrapping_rem(r)
                    }
                }
                BinOp::BitAnd => l & r,
                BinOp::BitOr => l | r,
                BinOp::BitXor => l ^ r,
                BinOp::Shl => l.wrapping_shl(r as u32),
                BinOp::Shr => {
                    if u {
                        ((l as u64).wrapping_shr(r as u32)) as i64
                    } else {
                        l.wrapping_shr(r as u32)
                    }
                }
                BinOp::Eq => (l == r) as i64,
                BinOp::Ne => (l != r) as i64,
                BinOp::Lt => {
                    if u {
                        ((l as u64) < (r as u64)) as i64
                    } else {
                        (l < r) as i64
                    }
                }
                BinOp::Le => {
                    if u {
                        ((l as u64) <= (r as u64)) as i64
                    } else {
                        (l <= r) as i64
                    }
                }
                BinOp::Gt => {
                    if u {
                        ((l as u64) > (r as u64)) as i64
                    } else {
                        (l > r) as i64
                    }
                }
                BinOp::Ge => {
                    if u {
                        ((l as u64) >= (r as u64)) as i64
                    } else {
                        (l >= r) as i64
                    }
                }
            })
        }
        NodeKind::Neg { expr } => Ok(eval_const(cc, expr)?.wrapping_neg()),
        NodeKind::BitNot { expr } => Ok(!eval_const(cc, expr)?),
        NodeKind::LogNot { expr } => Ok((eval_const(cc, expr)? == 0) as i64),
        NodeKind::LogAnd { lhs, rhs } => {
            Ok(((eval_const(cc, lhs)? != 0) && (eval_const(cc, rhs)? != 0)) as i64)
        }
        NodeKind::LogOr { lhs, rhs } => {
            Ok(((eval_const(cc, lhs)? != 0) || (eval_const(cc, rhs)? != 0)) as i64)
        }
        NodeKind::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            if eval_const(cc, cond)? != 0 {
                eval_const(cc, then_expr)
            } else {
                eval_const(cc, else_expr)
            }
        }
        NodeKind::Comma { rhs, .. } => eval_const(cc, rhs),
        NodeKind::Cast { expr } => {
            let ty = node.ty.ok_or(())?;
            if cc.types.is_flonum(ty) {
                return Err(());
            }
            let t = cc.types.get(ty);
            if cc.types.is_flonum(expr.ty.ok_or(())?) {
                let f = eval_const_float(cc, expr)?;
                return Ok(mask_to(f as i64, t.size, t.is_unsigned));
            }
            let v = eval_const(cc, expr)?;
            Ok(mask_to(v, t.size, t.is_unsigned))
        }
        _ => Err(()),
    }
}

/// Evaluate a floating constant expression.
pub(crate) fn eval_const_float(cc: &Compiler, node: &Node) -> Result<f64, ()> {
    match &node.kind {
        NodeKind::FNum { val } => Ok(*val),
        NodeKind::Num { val } => Ok(*val as f64),
        NodeKind::Binary { op, lhs, rhs } => {
            let l = eval_const_float(cc, lhs)?;
            let r = eval_const_float(cc, rhs)?;
            Ok(match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                _ => return Err(()),
            })
        }
        NodeKind::Neg { expr } => Ok(-eval_const_float(cc, expr)?),
        NodeKind::Cast { expr } => {
            let ty = node.ty.ok_or(())?;
            if cc.types.is_flonum(ty) {
                let inner_ty = expr.ty.ok_or(())?;
                let v = if cc.types.is_flonum(inner_ty) {
                    eval_const_float(cc, expr)?
                } else {
                    let i = eval_const(cc, expr)?;
                    if cc.types.get(inner_ty).is_unsigned {
                        (i as u64) as f64
                    } else {
                        i as f64
                    }
                };
                if matches!(cc.types.get(ty).kind, TypeKind::Float) {
                    Ok(v as f32 as f64)
                } else {
                    Ok(v)
                }
            } else {
                Err(())
            }
        }
        NodeKind::Comma { rhs, .. } => eval_const_float(cc, rhs),
        _ => Err(()),
    }
}

/// Evaluate an address constant for a global initializer: a symbol plus an
/// addend, or a plain integer.
fn eval_addr(cc: &Compiler, node: &Node) -> Result<(Option<String>, i64), ()> {
    match &node.kind {
        NodeKind::Num { val } => Ok((None, *val)),
        NodeKind::Cast { expr } => eval_addr(cc, expr),
        NodeKind::Addr { expr } => eval_lvalue_addr(cc, expr),
        NodeKind::Var { obj } => {
            let o = cc.objs.get(*obj);
            // Arrays and functions used as values are address constants.
            if matches!(
                cc.types.get(o.ty).kind,
                TypeKind::Array { .. } | TypeKind::Func { .. }
            ) || o.is_function
            {
                Ok((Some(o.name.clone()), 0))
            } else {
                Err(())
            }
        }
        NodeKind::Binary { op, lhs, rhs } if matches!(op, BinOp::Add | BinOp::Sub) => {
            let (ls, lv) = eval_addr(cc, lhs)?;
            let (rs, rv) = eval_addr(cc, rhs)?;
            match (ls, rs, op) {
                (s, None, BinOp::Add) => Ok((s, lv.wrapping_add(rv))),
                (None, s, BinOp::Add) => Ok((s, lv.wrapping_add(rv))),
                (s, None, BinOp::Sub) => Ok((s, lv.wrapping_sub(rv))),
                (None, None, BinOp::Sub) => Ok((None, lv.wrapping_sub(rv))),
                _ => Err(()),
            }
        }
        _ => {
            // Fall back to a plain constant.
            eval_const(cc, node).map(|v| (None, v))
        }
    }
}

/// Address of an lvalue: base symbol plus byte offset.
fn eval_lvalue_addr(cc: &Compiler, node: &Node) -> Result<(Option<String>, i64), ()> {
    match &node.kind {
        NodeKind::Var { obj } => Ok((Some(cc.objs.get(*obj).name.clone()), 0)),
        NodeKind::Member { base, member_idx } => {
            let (sym, off) = eval_lvalue_addr(cc, base)?;
            let bt = base.ty.ok_or(())?;
            let m = cc.types.members_of(bt).get(*member_idx).ok_or(())?;
            Ok((sym, off + m.offset))
        }
        NodeKind::Deref { expr } => eval_addr(cc, expr),
        _ => Err(()),
    }
}
