//! Expression lowering.
//!
//! Every value lands in a caller-chosen register: integers and pointers in
//! the integer file, floating values in the float file at the same index,
//! aggregates as their address. Anything that must survive a call is
//! spilled to a frame slot first, because the callee may use every
//! register.

use super::CodeGen;
use crate::ast::{BinOp, Node, NodeKind, ObjId};
use crate::error::CompileError;
use crate::types::{TypeId, TypeKind};
use cvm_core::isa::{self, Op, Reg, A0, A1, ZERO};

/// Argument passing classes at a call site.
enum ArgClass {
    Int,
    Float,
    /// A double funneled into an integer register for a variadic callee.
    FunnelFloat,
    /// A by-value aggregate: the slot holds the copy, the register gets
    /// its address.
    Struct(i64),
}

enum Callee {
    Direct(String),
    Indirect,
    Foreign(String),
}

impl CodeGen<'_> {
    fn ty(&self, node: &Node) -> TypeId {
        node.ty.expect("codegen reached an untyped node")
    }

    fn is_flonum(&self, ty: TypeId) -> bool {
        self.cc.types.is_flonum(ty)
    }

    /// Does evaluating this subtree involve a function call (so registers
    /// would be clobbered)?
    fn has_call(node: &Node) -> bool {
        match &node.kind {
            NodeKind::Funcall { .. } | NodeKind::VlaAlloc { .. } => true,
            NodeKind::Num { .. }
            | NodeKind::FNum { .. }
            | NodeKind::Var { .. }
            | NodeKind::NullExpr
            | NodeKind::LabelVal { .. }
            | NodeKind::VaStart
            | NodeKind::Error => false,
            NodeKind::Member { base, .. } => Self::has_call(base),
            NodeKind::Deref { expr }
            | NodeKind::Addr { expr }
            | NodeKind::Neg { expr }
            | NodeKind::LogNot { expr }
            | NodeKind::BitNot { expr }
            | NodeKind::Cast { expr }
            | NodeKind::ExprStmt { expr }
            | NodeKind::GotoExpr { expr } => Self::has_call(expr),
            NodeKind::Binary { lhs, rhs, .. }
            | NodeKind::LogAnd { lhs, rhs }
            | NodeKind::LogOr { lhs, rhs }
            | NodeKind::Assign { lhs, rhs }
            | NodeKind::Comma { lhs, rhs } => Self::has_call(lhs) || Self::has_call(rhs),
            NodeKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => Self::has_call(cond) || Self::has_call(then_expr) || Self::has_call(else_expr),
            NodeKind::Cas {
                addr,
                expected,
                desired,
            } => Self::has_call(addr) || Self::has_call(expected) || Self::has_call(desired),
            NodeKind::Exch { addr, val } => Self::has_call(addr) || Self::has_call(val),
            NodeKind::MemZero { .. } => false,
            NodeKind::StmtExpr { body } | NodeKind::Block { body } => {
                body.iter().any(Self::has_call)
            }
            _ => true, // statements inside expressions: be conservative
        }
    }

    /// Save a value to a fresh frame slot across a clobbering evaluation.
    fn spill(&mut self, r: Reg, float: bool) -> Result<i64, CompileError> {
        let slot = self.alloc_spill(8);
        let addr = self.alloc_reg()?;
        self.emit_lea(addr, slot);
        self.emit_rr(if float { Op::FStr } else { Op::StrD }, addr, r);
        self.free_reg(addr);
        Ok(slot)
    }

    fn unspill(&mut self, slot: i64, r: Reg, float: bool) -> Result<(), CompileError> {
        let addr = self.alloc_reg()?;
        self.emit_lea(addr, slot);
        self.emit_rr(if float { Op::FLdr } else { Op::LdrD }, r, addr);
        self.free_reg(addr);
        self.free_spill(8);
        Ok(())
    }

    // --- memory access ----------------------------------------------------

    /// Sanitizer checks in front of a memory access through `addr`.
    fn emit_access_checks(&mut self, addr: Reg, size: i64) {
        let san = self.cc.options.sanitizers;
        if san.memory_tagging {
            self.emit1(Op::ChkTag, addr as i64);
        }
        // Quarantine hits surface through the same liveness check.
        if san.bounds_checks || san.uaf_detection || san.stack_scope {
            self.emit1(Op::ChkPtr, isa::pack_chk(addr, size.max(1) as u32));
        }
    }

    /// rd <- mem[addr], by type. Aggregates keep their address as value.
    fn load(&mut self, ty: TypeId, dest: Reg, addr: Reg) {
        let t = self.cc.types.get(ty);
        let (size, unsigned) = (t.size, t.is_unsigned);
        match &t.kind {
            TypeKind::Struct { .. } | TypeKind::Array { .. } | TypeKind::Func { .. } => {
                self.emit_rr(Op::Mov, dest, addr);
                return;
            }
            TypeKind::Vla { .. } | TypeKind::Ptr { .. } => {
                self.emit_access_checks(addr, 8);
                self.emit_rr(Op::LdrD, dest, addr);
                return;
            }
            TypeKind::Float => {
                self.emit_access_checks(addr, 4);
                self.emit_rr(Op::FLdrS, dest, addr);
                return;
            }
            TypeKind::Double | TypeKind::LongDouble => {
                self.emit_access_checks(addr, 8);
                self.emit_rr(Op::FLdr, dest, addr);
                return;
            }
            _ => {}
        }
        self.emit_access_checks(addr, size.max(1));
        let op = match (size, unsigned) {
            (1, false) => Op::LdrB,
            (1, true) => Op::LdrBu,
            (2, false) => Op::LdrH,
            (2, true) => Op::LdrHu,
            (4, false) => Op::LdrW,
            (4, true) => Op::LdrWu,
            _ => Op::LdrD,
        };
        self.emit_rr(op, dest, addr);
    }

    /// mem[addr] <- val, by type. Aggregates copy bytes.
    fn store(&mut self, ty: TypeId, addr: Reg, val: Reg) -> Result<(), CompileError> {
        let t = self.cc.types.get(ty);
        let size = t.size;
        match &t.kind {
            TypeKind::Struct { .. } | TypeKind::Array { .. } => {
                self.emit_access_checks(addr, size.max(1));
                let len = self.alloc_reg()?;
                self.emit_li(len, size.max(0));
                self.emit_rrr(Op::Mcpy, addr, val, len);
                self.free_reg(len);
                return Ok(());
            }
            TypeKind::Float => {
                self.emit_access_checks(addr, 4);
                self.emit_rr(Op::FStrS, addr, val);
                return Ok(());
            }
            TypeKind::Double | TypeKind::LongDouble => {
                self.emit_access_checks(addr, 8);
                self.emit_rr(Op::FStr, addr, val);
                return Ok(());
            }
            _ => {}
        }
        self.emit_access_checks(addr, size.max(1));
        let op = match size {
            1 => Op::StrB,
            2 => Op::StrH,
            4 => Op::StrW,
            _ => Op::StrD,
        };
        self.emit_rr(op, addr, val);
        Ok(())
    }

    /// Re-normalize a 32-bit arithmetic result held in a 64-bit register.
    fn fix_width(&mut self, ty: TypeId, r: Reg) {
        let t = self.cc.types.get(ty);
        if !self.cc.types.is_integer(ty) {
            return;
        }
        match (t.size, t.is_unsigned) {
            (4, false) => self.emit_rr(Op::SextW, r, r),
            (4, true) => self.emit_rr(Op::ZextW, r, r),
            _ => {}
        }
    }

    // --- addresses --------------------------------------------------------

    pub(super) fn gen_addr(&mut self, node: &Node, dest: Reg) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Var { obj } => self.gen_var_addr(*obj, dest, node),
            NodeKind::Deref { expr } => self.gen_expr(expr, dest),
            NodeKind::Member { base, member_idx } => {
                self.gen_addr(base, dest)?;
                let off = self
                    .cc
                    .types
                    .members_of(self.ty(base))
                    .get(*member_idx)
                    .map(|m| m.offset)
                    .ok_or_else(|| self.internal("member index out of range"))?;
                if off != 0 {
                    self.emit2(Op::AddI, dest as i64, off);
                }
                Ok(())
            }
            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs, dest)?;
                self.gen_addr(rhs, dest)
            }
            NodeKind::Assign { .. } | NodeKind::Cond { .. } | NodeKind::Funcall { .. }
            | NodeKind::StmtExpr { .. } => {
                // Aggregate-valued expressions evaluate to their address.
                if self.cc.types.is_struct_or_union(self.ty(node)) {
                    self.gen_expr(node, dest)
                } else {
                    Err(self.internal("expression is not an lvalue"))
                }
            }
            _ => Err(self.internal(format!(
                "address of unsupported node {:?}",
                std::mem::discriminant(&node.kind)
            ))),
        }
    }

    fn gen_var_addr(&mut self, id: ObjId, dest: Reg, node: &Node) -> Result<(), CompileError> {
        let (is_local, is_function, is_param, name, offset, ty) = {
            let o = self.obj(id);
            (
                o.is_local,
                o.is_function,
                o.is_param,
                o.name.clone(),
                o.offset,
                o.ty,
            )
        };
        if is_function {
            // Function used as a value: absolute text address, patched once
            // the callee's entry offset is known.
            if !self.fn_defined(&name) {
                return Err(CompileError::Link {
                    loc: node.loc,
                    msg: format!("undefined reference to function '{}'", name),
                });
            }
            self.text.push(Op::Li.word());
            self.text.push(dest as i64);
            let slot = self.text.len();
            self.push_call_patch(name, slot, node.loc);
            self.text.push(super::PATCH_PLACEHOLDER);
            return Ok(());
        }
        if is_local {
            // Struct parameters and VLA variables hold a pointer in their
            // slot; the pointed-to storage is the object.
            let indirect = (is_param && self.cc.types.is_struct_or_union(ty))
                || self.cc.types.is_vla(ty);
            self.emit_lea(dest, offset);
            if indirect {
                self.emit_rr(Op::LdrD, dest, dest);
            }
            return Ok(());
        }
        match self.global_addr(&name) {
            Some(addr) => {
                self.emit_li(dest, addr as i64);
                Ok(())
            }
            None => Err(CompileError::Link {
                loc: node.loc,
                msg: format!("undefined reference to '{}'", name),
            }),
        }
    }

    // --- conditions -------------------------------------------------------

    /// Evaluate to 0/1 in an integer register.
    pub(super) fn gen_cond(&mut self, node: &Node, dest: Reg) -> Result<(), CompileError> {
        self.gen_expr(node, dest)?;
        let ty = self.ty(node);
        if self.is_flonum(ty) {
            let z = self.alloc_reg()?;
            self.emit_rr(Op::R2Fr, z, ZERO);
            self.emit_rrr(Op::FNe, dest, dest, z);
            self.free_reg(z);
        } else {
            self.emit_rrr(Op::Sne, dest, dest, ZERO);
        }
        Ok(())
    }

    // --- expressions ------------------------------------------------------

    pub(super) fn gen_expr(&mut self, node: &Node, dest: Reg) -> Result<(), CompileError> {
        self.note_loc(node.loc);
        match &node.kind {
            NodeKind::NullExpr => {
                self.emit_li(dest, 0);
                Ok(())
            }
            NodeKind::Num { val } => {
                self.emit_li(dest, *val);
                Ok(())
            }
            NodeKind::FNum { val } => {
                // Floats materialize from the data segment.
                let addr = self.float_const(*val);
                let t = self.alloc_reg()?;
                self.emit_li(t, addr as i64);
                self.emit_rr(Op::FLdr, dest, t);
                self.free_reg(t);
                Ok(())
            }
            NodeKind::Var { obj } => {
                let oty = self.obj(*obj).ty;
                let ty = self.ty(node);
                self.gen_addr(node, dest)?;
                // A VLA variable's decayed value is its storage address,
                // which gen_addr already produced.
                if !self.cc.types.is_vla(oty) {
                    self.load_in_place(ty, dest, dest);
                }
                Ok(())
            }
            NodeKind::Member { base, member_idx } => {
                let m = self
                    .cc
                    .types
                    .members_of(self.ty(base))
                    .get(*member_idx)
                    .cloned()
                    .ok_or_else(|| self.internal("member index out of range"))?;
                self.gen_addr(node, dest)?;
                if m.is_bitfield {
                    self.load_bitfield(&m, dest)?;
                } else {
                    self.load_in_place(m.ty, dest, dest);
                }
                Ok(())
            }
            NodeKind::Deref { expr } => {
                let ty = self.ty(node);
                self.gen_expr(expr, dest)?;
                self.load_in_place(ty, dest, dest);
                Ok(())
            }
            NodeKind::Addr { expr } => self.gen_addr(expr, dest),
            NodeKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs, dest),
            NodeKind::Binary { op, lhs, rhs } => self.gen_binary(node, *op, lhs, rhs, dest),
            NodeKind::Neg { expr } => {
                self.gen_expr(expr, dest)?;
                let ty = self.ty(node);
                if self.is_flonum(ty) {
                    self.emit_rr(Op::FNeg, dest, dest);
                } else {
                    self.emit_rr(Op::Neg, dest, dest);
                    self.fix_width(ty, dest);
                }
                Ok(())
            }
            NodeKind::BitNot { expr } => {
                self.gen_expr(expr, dest)?;
                self.emit_rr(Op::BNot, dest, dest);
                self.fix_width(self.ty(node), dest);
                Ok(())
            }
            NodeKind::LogNot { expr } => {
                self.gen_cond(expr, dest)?;
                self.emit_rr(Op::Not, dest, dest);
                Ok(())
            }
            NodeKind::LogAnd { lhs, rhs } => {
                let l_false = self.unique("false");
                let l_end = self.unique("end");
                self.gen_cond(lhs, dest)?;
                self.emit_jz(dest, &l_false);
                self.gen_cond(rhs, dest)?;
                self.emit_jz(dest, &l_false);
                self.emit_li(dest, 1);
                self.emit_jmp(&l_end);
                self.define_label(&l_false);
                self.emit_li(dest, 0);
                self.define_label(&l_end);
                Ok(())
            }
            NodeKind::LogOr { lhs, rhs } => {
                let l_true = self.unique("true");
                let l_end = self.unique("end");
                self.gen_cond(lhs, dest)?;
                self.emit_jnz(dest, &l_true);
                self.gen_cond(rhs, dest)?;
                self.emit_jnz(dest, &l_true);
                self.emit_li(dest, 0);
                self.emit_jmp(&l_end);
                self.define_label(&l_true);
                self.emit_li(dest, 1);
                self.define_label(&l_end);
                Ok(())
            }
            NodeKind::Cast { expr } => {
                self.gen_expr(expr, dest)?;
                self.gen_cast(self.ty(expr), self.ty(node), dest)
            }
            NodeKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                let l_else = self.unique("else");
                let l_end = self.unique("end");
                let c = self.alloc_reg()?;
                self.gen_cond(cond, c)?;
                self.emit_jz(c, &l_else);
                self.free_reg(c);
                self.gen_expr(then_expr, dest)?;
                self.emit_jmp(&l_end);
                self.define_label(&l_else);
                self.gen_expr(else_expr, dest)?;
                self.define_label(&l_end);
                Ok(())
            }
            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs, dest)?;
                self.gen_expr(rhs, dest)
            }
            NodeKind::Funcall { func, args } => self.gen_funcall(node, func, args, dest),
            NodeKind::StmtExpr { body } => {
                if let Some((last, rest)) = body.split_last() {
                    for n in rest {
                        self.gen_stmt(n)?;
                    }
                    match &last.kind {
                        NodeKind::ExprStmt { expr } => self.gen_expr(expr, dest)?,
                        _ => self.gen_stmt(last)?,
                    }
                }
                Ok(())
            }
            NodeKind::MemZero { var } => self.gen_memzero(*var),
            NodeKind::VlaAlloc { var, size } => self.gen_vla_alloc(*var, size),
            NodeKind::VaStart => {
                let off = self.va_area_offset();
                self.emit_lea(dest, off);
                Ok(())
            }
            NodeKind::LabelVal { label } => {
                let label = label.clone();
                self.emit_label_addr(dest, &label);
                Ok(())
            }
            NodeKind::Cas {
                addr,
                expected,
                desired,
            } => {
                let a = self.alloc_reg()?;
                self.gen_expr(addr, a)?;
                let e = self.alloc_reg()?;
                self.gen_expr(expected, e)?;
                let d = self.alloc_reg()?;
                self.gen_expr(desired, d)?;
                self.emit1(Op::Cas, isa::pack_rrrr(dest, a, e, d));
                self.free_reg(d);
                self.free_reg(e);
                self.free_reg(a);
                Ok(())
            }
            NodeKind::Exch { addr, val } => {
                let a = self.alloc_reg()?;
                self.gen_expr(addr, a)?;
                let v = self.alloc_reg()?;
                self.gen_expr(val, v)?;
                self.emit_rrr(Op::Exch, dest, a, v);
                self.free_reg(v);
                self.free_reg(a);
                Ok(())
            }
            NodeKind::Error => Err(self.internal("error node reached code generation")),
            _ => Err(self.internal(format!(
                "unsupported node in expression position: {:?}",
                std::mem::discriminant(&node.kind)
            ))),
        }
    }

    /// Load when the address currently sits in the destination register.
    fn load_in_place(&mut self, ty: TypeId, dest: Reg, addr: Reg) {
        self.load(ty, dest, addr);
    }

    // --- bitfields --------------------------------------------------------

    fn load_bitfield(
        &mut self,
        m: &crate::types::Member,
        dest: Reg,
    ) -> Result<(), CompileError> {
        let unit = self.cc.types.get(m.ty).size;
        let unsigned = self.cc.types.get(m.ty).is_unsigned;
        self.emit_access_checks(dest, unit.max(1));
        let op = match unit {
            1 => Op::LdrBu,
            2 => Op::LdrHu,
            4 => Op::LdrWu,
            _ => Op::LdrD,
        };
        self.emit_rr(op, dest, dest);
        let sh = self.alloc_reg()?;
        self.emit_li(sh, 64 - m.bit_offset - m.bit_width);
        self.emit_rrr(Op::Shl, dest, dest, sh);
        self.emit_li(sh, 64 - m.bit_width);
        self.emit_rrr(if unsigned { Op::Shr } else { Op::Sar }, dest, dest, sh);
        self.free_reg(sh);
        Ok(())
    }

    fn store_bitfield(
        &mut self,
        m: &crate::types::Member,
        addr: Reg,
        val: Reg,
    ) -> Result<(), CompileError> {
        let unit = self.cc.types.get(m.ty).size;
        let mask: u64 = if m.bit_width >= 64 {
            u64::MAX
        } else {
            (1u64 << m.bit_width) - 1
        };
        let old = self.alloc_reg()?;
        let t = self.alloc_reg()?;
        self.emit_access_checks(addr, unit.max(1));
        let (ldr, str_) = match unit {
            1 => (Op::LdrBu, Op::StrB),
            2 => (Op::LdrHu, Op::StrH),
            4 => (Op::LdrWu, Op::StrW),
            _ => (Op::LdrD, Op::StrD),
        };
        self.emit_rr(ldr, old, addr);
        // old &= ~(mask << off)
        self.emit_li(t, !(mask << m.bit_offset) as i64);
        self.emit_rrr(Op::And, old, old, t);
        // old |= (val & mask) << off
        let v = self.alloc_reg()?;
        self.emit_li(t, mask as i64);
        self.emit_rrr(Op::And, v, val, t);
        self.emit_li(t, m.bit_offset);
        self.emit_rrr(Op::Shl, v, v, t);
        self.emit_rrr(Op::Or, old, old, v);
        self.emit_rr(str_, addr, old);
        self.free_reg(v);
        self.free_reg(t);
        self.free_reg(old);
        Ok(())
    }

    // --- assignment -------------------------------------------------------

    fn gen_assign(&mut self, lhs: &Node, rhs: &Node, dest: Reg) -> Result<(), CompileError> {
        let ty = self.ty(lhs);

        if self.cc.types.is_struct_or_union(ty) {
            // Both sides are addresses; copy the bytes.
            let src = self.alloc_reg()?;
            self.gen_addr(rhs, src)?;
            let spilled = if Self::has_call(lhs) {
                Some(self.spill(src, false)?)
            } else {
                None
            };
            self.gen_addr(lhs, dest)?;
            if let Some(slot) = spilled {
                self.unspill(slot, src, false)?;
            }
            let size = self.cc.types.get(ty).size;
            self.emit_access_checks(dest, size.max(1));
            let len = self.alloc_reg()?;
            self.emit_li(len, size);
            self.emit_rrr(Op::Mcpy, dest, src, len);
            self.free_reg(len);
            self.free_reg(src);
            return Ok(());
        }

        // Scalar: RHS first (it may contain a call that clobbers temps),
        // then the target address, then the store.
        let is_float = self.is_flonum(ty);
        self.gen_expr(rhs, dest)?;
        let spilled = if Self::has_call(lhs) {
            Some(self.spill(dest, is_float)?)
        } else {
            None
        };
        let addr = self.alloc_reg()?;

        // A bitfield member stores through its storage unit.
        if let NodeKind::Member { base, member_idx } = &lhs.kind {
            let m = self
                .cc
                .types
                .members_of(self.ty(base))
                .get(*member_idx)
                .cloned()
                .ok_or_else(|| self.internal("member index out of range"))?;
            if m.is_bitfield {
                self.gen_addr(lhs, addr)?;
                if let Some(slot) = spilled {
                    self.unspill(slot, dest, is_float)?;
                }
                self.store_bitfield(&m, addr, dest)?;
                self.free_reg(addr);
                // The value of the assignment is the (truncated) value.
                let sh = self.alloc_reg()?;
                self.emit_li(sh, 64 - m.bit_width);
                self.emit_rrr(Op::Shl, dest, dest, sh);
                self.emit_rrr(
                    if self.cc.types.get(m.ty).is_unsigned {
                        Op::Shr
                    } else {
                        Op::Sar
                    },
                    dest,
                    dest,
                    sh,
                );
                self.free_reg(sh);
                return Ok(());
            }
        }

        self.gen_addr(lhs, addr)?;
        if let Some(slot) = spilled {
            self.unspill(slot, dest, is_float)?;
        }
        self.store(ty, addr, dest)?;
        self.free_reg(addr);
        Ok(())
    }

    // --- binary operators -------------------------------------------------

    fn gen_binary(
        &mut self,
        node: &Node,
        op: BinOp,
        lhs: &Node,
        rhs: &Node,
        dest: Reg,
    ) -> Result<(), CompileError> {
        let operand_ty = self.ty(lhs);
        let float = self.is_flonum(operand_ty);

        self.gen_expr(lhs, dest)?;
        let spilled = if Self::has_call(rhs) {
            Some(self.spill(dest, float)?)
        } else {
            None
        };
        let tmp = self.alloc_reg()?;
        self.gen_expr(rhs, tmp)?;
        if let Some(slot) = spilled {
            self.unspill(slot, dest, float)?;
        }

        if float {
            let fop = match op {
                BinOp::Add => Op::FAdd,
                BinOp::Sub => Op::FSub,
                BinOp::Mul => Op::FMul,
                BinOp::Div => Op::FDiv,
                BinOp::Eq => Op::FEq,
                BinOp::Ne => Op::FNe,
                BinOp::Lt => Op::FLt,
                BinOp::Le => Op::FLe,
                BinOp::Gt => Op::FGt,
                BinOp::Ge => Op::FGe,
                _ => return Err(self.internal("invalid float operator")),
            };
            self.emit_rrr(fop, dest, dest, tmp);
            self.free_reg(tmp);
            // Arithmetic on C floats rounds through single precision.
            if !op.is_compare() && matches!(self.cc.types.get(self.ty(node)).kind, TypeKind::Float)
            {
                self.emit_rr(Op::FRound32, dest, dest);
            }
            return Ok(());
        }

        let unsigned = self.cc.types.get(operand_ty).is_unsigned;
        let iop = match (op, unsigned) {
            (BinOp::Add, _) => Op::Add,
            (BinOp::Sub, _) => Op::Sub,
            (BinOp::Mul, _) => Op::Mul,
            (BinOp::Div, false) => Op::Div,
            (BinOp::Div, true) => Op::DivU,
            (BinOp::Mod, false) => Op::Mod,
            (BinOp::Mod, true) => Op::ModU,
            (BinOp::BitAnd, _) => Op::And,
            (BinOp::BitOr, _) => Op::Or,
            (BinOp::BitXor, _) => Op::Xor,
            (BinOp::Shl, _) => Op::Shl,
            (BinOp::Shr, false) => Op::Sar,
            (BinOp::Shr, true) => Op::Shr,
            (BinOp::Eq, _) => Op::Seq,
            (BinOp::Ne, _) => Op::Sne,
            (BinOp::Lt, false) => Op::Slt,
            (BinOp::Lt, true) => Op::SltU,
            (BinOp::Le, false) => Op::Sle,
            (BinOp::Le, true) => Op::SleU,
            (BinOp::Gt, false) => Op::Sgt,
            (BinOp::Gt, true) => Op::SgtU,
            (BinOp::Ge, false) => Op::Sge,
            (BinOp::Ge, true) => Op::SgeU,
        };
        self.emit_rrr(iop, dest, dest, tmp);
        self.free_reg(tmp);
        if !op.is_compare() {
            self.fix_width(self.ty(node), dest);
        }
        Ok(())
    }

    // --- casts ------------------------------------------------------------

    fn gen_cast(&mut self, from: TypeId, to: TypeId, r: Reg) -> Result<(), CompileError> {
        let from_f = self.is_flonum(from);
        let to_t = self.cc.types.get(to);
        match &to_t.kind {
            TypeKind::Void => Ok(()),
            TypeKind::Bool => {
                if from_f {
                    let z = self.alloc_reg()?;
                    self.emit_rr(Op::R2Fr, z, ZERO);
                    self.emit_rrr(Op::FNe, r, r, z);
                    self.free_reg(z);
                } else {
                    self.emit_rrr(Op::Sne, r, r, ZERO);
                }
                Ok(())
            }
            TypeKind::Float => {
                if !from_f {
                    let unsigned = self.cc.types.get(from).is_unsigned;
                    self.emit_rr(if unsigned { Op::U2F } else { Op::I2F }, r, r);
                }
                self.emit_rr(Op::FRound32, r, r);
                Ok(())
            }
            TypeKind::Double | TypeKind::LongDouble => {
                if !from_f {
                    let unsigned = self.cc.types.get(from).is_unsigned;
                    self.emit_rr(if unsigned { Op::U2F } else { Op::I2F }, r, r);
                }
                Ok(())
            }
            _ => {
                // Integer or pointer target.
                let (size, unsigned) = (to_t.size, to_t.is_unsigned);
                if from_f {
                    self.emit_rr(Op::F2I, r, r);
                }
                match (size, unsigned) {
                    (1, false) => self.emit_rr(Op::SextB, r, r),
                    (1, true) => self.emit_rr(Op::ZextB, r, r),
                    (2, false) => self.emit_rr(Op::SextH, r, r),
                    (2, true) => self.emit_rr(Op::ZextH, r, r),
                    (4, false) => self.emit_rr(Op::SextW, r, r),
                    (4, true) => self.emit_rr(Op::ZextW, r, r),
                    _ => {}
                }
                Ok(())
            }
        }
    }

    // --- zero-fill and VLAs ----------------------------------------------

    fn gen_memzero(&mut self, var: ObjId) -> Result<(), CompileError> {
        let (offset, size) = {
            let o = self.obj(var);
            (o.offset, self.cc.types.get(o.ty).size.max(0))
        };
        if size == 0 {
            return Ok(());
        }
        let addr = self.alloc_reg()?;
        self.emit_lea(addr, offset);
        if size % 8 == 0 && size <= 64 {
            for i in 0..size / 8 {
                if i > 0 {
                    self.emit2(Op::AddI, addr as i64, 8);
                }
                self.emit_rr(Op::StrD, addr, ZERO);
            }
            self.free_reg(addr);
            return Ok(());
        }
        let cnt = self.alloc_reg()?;
        self.emit_li(cnt, size);
        let l_loop = self.unique("zero");
        let l_end = self.unique("zend");
        self.define_label(&l_loop);
        self.emit_jz(cnt, &l_end);
        self.emit_rr(Op::StrB, addr, ZERO);
        self.emit2(Op::AddI, addr as i64, 1);
        self.emit2(Op::AddI, cnt as i64, -1);
        self.emit_jmp(&l_loop);
        self.define_label(&l_end);
        self.free_reg(cnt);
        self.free_reg(addr);
        Ok(())
    }

    fn gen_vla_alloc(&mut self, var: ObjId, size: &Node) -> Result<(), CompileError> {
        let (var_off, size_var) = {
            let o = self.obj(var);
            let sv = match self.cc.types.get(o.ty).kind {
                TypeKind::Vla { size_var, .. } => size_var,
                _ => None,
            };
            (o.offset, sv)
        };
        let t = self.alloc_reg()?;
        self.gen_expr(size, t)?;
        // Remember the byte size for sizeof.
        if let Some(sv) = size_var {
            let off = self.obj(sv).offset;
            let a = self.alloc_reg()?;
            self.emit_lea(a, off);
            self.emit_rr(Op::StrD, a, t);
            self.free_reg(a);
        }
        self.emit_rr(Op::Mov, A0, t);
        self.free_reg(t);
        self.emit0(Op::Alloca);
        let a = self.alloc_reg()?;
        self.emit_lea(a, var_off);
        self.emit_rr(Op::StrD, a, A0);
        self.free_reg(a);
        Ok(())
    }

    // --- calls ------------------------------------------------------------

    fn gen_funcall(
        &mut self,
        node: &Node,
        func: &Node,
        args: &[Node],
        dest: Reg,
    ) -> Result<(), CompileError> {
        // Builtins first.
        if let NodeKind::Var { obj } = &func.kind {
            let (is_fn, name) = {
                let o = self.obj(*obj);
                (o.is_function, o.name.clone())
            };
            if is_fn {
                match name.as_str() {
                    "alloca" => {
                        let t = self.alloc_reg()?;
                        self.gen_expr(&args[0], t)?;
                        self.emit_rr(Op::Mov, A0, t);
                        self.free_reg(t);
                        self.emit0(Op::Alloca);
                        self.emit_rr(Op::Mov, dest, A0);
                        return Ok(());
                    }
                    "setjmp" | "_setjmp" => {
                        let t = self.alloc_reg()?;
                        self.gen_expr(&args[0], t)?;
                        self.emit_rr(Op::Mov, A0, t);
                        self.free_reg(t);
                        self.emit0(Op::SetJmp);
                        self.emit_rr(Op::Mov, dest, A0);
                        return Ok(());
                    }
                    "longjmp" | "_longjmp" => {
                        let t = self.alloc_reg()?;
                        self.gen_expr(&args[0], t)?;
                        let v = self.alloc_reg()?;
                        self.gen_expr(&args[1], v)?;
                        self.emit_rr(Op::Mov, A0, t);
                        self.emit_rr(Op::Mov, A1, v);
                        self.free_reg(v);
                        self.free_reg(t);
                        self.emit0(Op::LongJmp);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }

        let fty = {
            let t = self.ty(func);
            match self.cc.types.get(t).kind {
                TypeKind::Func { .. } => t,
                TypeKind::Ptr { base } => base,
                _ => return Err(self.internal("call through a non-function type")),
            }
        };
        let (nfixed, is_variadic, ret_ty) = match &self.cc.types.get(fty).kind {
            TypeKind::Func {
                params,
                is_variadic,
                ret,
            } => (params.len(), *is_variadic, *ret),
            _ => return Err(self.internal("call through a non-function type")),
        };

        let callee = match &func.kind {
            NodeKind::Var { obj } if self.obj(*obj).is_function => {
                let name = self.obj(*obj).name.clone();
                if self.fn_defined(&name) {
                    Callee::Direct(name)
                } else {
                    Callee::Foreign(name)
                }
            }
            _ => Callee::Indirect,
        };
        let foreign = matches!(callee, Callee::Foreign(_));

        // Indirect targets evaluate first and wait in a spill slot.
        let mut target_slot: Option<i64> = None;
        let mut spill_sizes: Vec<i64> = Vec::new();
        if matches!(callee, Callee::Indirect) {
            let t = self.alloc_reg()?;
            self.gen_expr(func, t)?;
            target_slot = Some(self.spill(t, false)?);
            spill_sizes.push(8);
            self.free_reg(t);
        }

        // Evaluate arguments left to right into frame slots.
        let mut arg_slots: Vec<(i64, ArgClass)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let aty = self.ty(arg);
            if self.cc.types.is_struct_or_union(aty) {
                // By-value aggregate: copy into the slot, pass its address.
                let size = crate::types::align_to(self.cc.types.get(aty).size.max(8), 8);
                let t = self.alloc_reg()?;
                self.gen_expr(arg, t)?;
                let slot = self.alloc_spill(size);
                spill_sizes.push(size);
                let a = self.alloc_reg()?;
                self.emit_lea(a, slot);
                let len = self.alloc_reg()?;
                self.emit_li(len, self.cc.types.get(aty).size);
                self.emit_rrr(Op::Mcpy, a, t, len);
                self.free_reg(len);
                self.free_reg(a);
                self.free_reg(t);
                arg_slots.push((slot, ArgClass::Struct(size)));
                continue;
            }
            let float = self.is_flonum(aty);
            let t = self.alloc_reg()?;
            self.gen_expr(arg, t)?;
            let slot = self.alloc_spill(8);
            spill_sizes.push(8);
            let a = self.alloc_reg()?;
            self.emit_lea(a, slot);
            self.emit_rr(if float { Op::FStr } else { Op::StrD }, a, t);
            self.free_reg(a);
            self.free_reg(t);
            let class = if float && !foreign && (is_variadic && i >= nfixed) {
                // Variadic doubles ride in integer registers so the callee
                // can spill one contiguous block for va_arg.
                ArgClass::FunnelFloat
            } else if float {
                ArgClass::Float
            } else {
                ArgClass::Int
            };
            arg_slots.push((slot, class));
        }

        // Load the argument registers.
        let a = self.alloc_reg()?;
        let mut double_mask: i64 = 0;
        for (i, (slot, class)) in arg_slots.iter().enumerate() {
            let areg = A0 + i as u8;
            match class {
                ArgClass::Int => {
                    self.emit_lea(a, *slot);
                    self.emit_rr(Op::LdrD, areg, a);
                }
                ArgClass::Float => {
                    self.emit_lea(a, *slot);
                    self.emit_rr(Op::FLdr, areg, a);
                    double_mask |= 1 << i;
                }
                ArgClass::FunnelFloat => {
                    // The raw bit pattern moves through the integer file.
                    self.emit_lea(a, *slot);
                    self.emit_rr(Op::LdrD, areg, a);
                }
                ArgClass::Struct(_) => {
                    self.emit_lea(areg, *slot);
                }
            }
        }

        match callee {
            Callee::Direct(name) => {
                self.free_reg(a);
                self.text.push(Op::Call.word());
                let slot = self.text.len();
                self.push_call_patch(name, slot, node.loc);
                self.text.push(super::PATCH_PLACEHOLDER);
            }
            Callee::Indirect => {
                let slot = target_slot.unwrap();
                self.emit_lea(a, slot);
                self.emit_rr(Op::LdrD, a, a);
                self.emit1(Op::CallI, a as i64);
                self.free_reg(a);
            }
            Callee::Foreign(name) => {
                self.free_reg(a);
                let idx = self.intern_ffi(&name);
                self.emit3(Op::CallF, idx as i64, args.len() as i64, double_mask);
            }
        }

        // Release spill slots (stack discipline: reverse order).
        for size in spill_sizes.into_iter().rev() {
            self.free_spill(size);
        }

        // Fetch the result.
        if self.cc.types.is_void(ret_ty) {
            self.emit_li(dest, 0);
        } else if self.is_flonum(ret_ty) {
            self.emit_rr(Op::FMov, dest, A0);
        } else {
            self.emit_rr(Op::Mov, dest, A0);
        }
        Ok(())
    }
}
