//! Bytecode generation.
//!
//! The generator walks typed ASTs and emits instruction words into the
//! text segment. Expressions evaluate into explicitly allocated temporary
//! registers (a bitmap over T0..T10); values that must survive a call are
//! spilled to per-call-site frame slots, because every register is
//! caller-saved. Forward control flow goes through a per-function label
//! patch table; calls and function-address references go through a
//! program-wide patch pass once every function's entry offset is known.
//!
//! Frame shape (stack grows down, bp points at the saved-bp slot):
//!
//! ```text
//! [bp+8]   return address        (pushed by CALL)
//! [bp]     caller's bp           (pushed by ENT3)
//! [bp-8]   canary slot           (always reserved)
//! [bp-16]  parameter 0           (A0 spilled here by ENT3)
//! ...      parameters 1..n, then locals, then call-site spill slots
//! ```
//!
//! Variadic functions spill all eight A registers so `va_arg` can walk the
//! parameter block as contiguous memory.

mod expr;

use crate::ast::{Node, NodeKind, Obj, ObjId};
use crate::error::CompileError;
use crate::types::{align_to, TypeId, TypeKind};
use crate::Compiler;
use cvm_core::image::{Image, SourceMapEntry, Symbol, SymbolKind};
use cvm_core::isa::{self, Op, Reg, A0, DATA_BASE, NUM_ARG_REGS};
use cvm_core::source::Loc;
use std::collections::{HashMap, HashSet};

/// Placeholder operand for unresolved jumps and addresses. A deliberately
/// invalid text offset, so anything left unpatched faults fast.
const PATCH_PLACEHOLDER: i64 = i64::MIN;

pub(crate) struct CodeGen<'a> {
    cc: &'a mut Compiler,
    text: Vec<i64>,
    data: Vec<u8>,
    ffi_names: Vec<String>,
    ffi_index: HashMap<String, usize>,
    /// Function name -> entry offset, filled as functions are generated.
    fn_addrs: HashMap<String, i64>,
    /// Global name -> virtual data address.
    global_addrs: HashMap<String, u64>,
    /// Names of functions with bodies anywhere in the program.
    defined_fns: HashSet<String>,
    /// Call/address patch sites: (function name, operand slot, loc).
    call_patches: Vec<(String, usize, Option<Loc>)>,
    /// Function-pointer relocations inside the data segment.
    data_fn_relocs: Vec<(usize, String, i64)>,
    /// Interned 8-byte float constants in the data segment.
    float_consts: HashMap<u64, u64>,
    symbols: Vec<Symbol>,
    source_map: Vec<SourceMapEntry>,
    // per-function state
    labels: HashMap<String, i64>,
    label_patches: Vec<(String, usize)>,
    regs_in_use: u16,
    spill_cur: i64,
    spill_max: i64,
    locals_size: i64,
    ret_label: String,
    cur_fn_ret: Option<TypeId>,
    cur_fn_nfixed: usize,
    ret_pool: (u32, u32),
    last_line: u32,
}

pub(crate) fn generate(cc: &mut Compiler, program: &[ObjId]) -> Result<Image, CompileError> {
    let mut g = CodeGen {
        cc,
        text: vec![0], // text[0] holds the entry offset
        data: Vec::new(),
        ffi_names: Vec::new(),
        ffi_index: HashMap::new(),
        fn_addrs: HashMap::new(),
        global_addrs: HashMap::new(),
        defined_fns: HashSet::new(),
        call_patches: Vec::new(),
        data_fn_relocs: Vec::new(),
        float_consts: HashMap::new(),
        symbols: Vec::new(),
        source_map: Vec::new(),
        labels: HashMap::new(),
        label_patches: Vec::new(),
        regs_in_use: 0,
        spill_cur: 0,
        spill_max: 0,
        locals_size: 0,
        ret_label: String::new(),
        cur_fn_ret: None,
        cur_fn_nfixed: 0,
        ret_pool: (0, 0),
        last_line: 0,
    };
    g.layout_data(program)?;
    g.gen_program(program)?;
    g.finish(program)
}

impl<'a> CodeGen<'a> {
    fn internal(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Codegen { msg: msg.into() }
    }

    // --- emission --------------------------------------------------------

    fn here(&self) -> usize {
        self.text.len()
    }

    fn emit0(&mut self, op: Op) {
        self.text.push(op.word());
    }

    fn emit1(&mut self, op: Op, w: i64) {
        self.text.push(op.word());
        self.text.push(w);
    }

    fn emit2(&mut self, op: Op, w1: i64, w2: i64) {
        self.text.push(op.word());
        self.text.push(w1);
        self.text.push(w2);
    }

    fn emit3(&mut self, op: Op, w1: i64, w2: i64, w3: i64) {
        self.text.push(op.word());
        self.text.push(w1);
        self.text.push(w2);
        self.text.push(w3);
    }

    fn emit_rrr(&mut self, op: Op, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit1(op, isa::pack_rrr(rd, rs1, rs2));
    }

    fn emit_rr(&mut self, op: Op, rd: Reg, rs: Reg) {
        // A move onto itself is a no-op; the peephole drops it at the source.
        if self.cc.options.optimize && matches!(op, Op::Mov | Op::FMov) && rd == rs {
            return;
        }
        self.emit1(op, isa::pack_rr(rd, rs));
    }

    fn emit_li(&mut self, rd: Reg, val: i64) {
        self.emit2(Op::Li, rd as i64, val);
    }

    fn emit_lea(&mut self, rd: Reg, frame_off: i64) {
        self.emit2(Op::Lea, rd as i64, -frame_off);
    }

    fn note_loc(&mut self, loc: Option<Loc>) {
        if !self.cc.options.enable_debugger {
            return;
        }
        if let Some(loc) = loc {
            if loc.line != self.last_line {
                self.last_line = loc.line;
                self.source_map.push(SourceMapEntry {
                    text_off: self.here() as u32,
                    loc,
                });
            }
        }
    }

    // --- registers and spill slots --------------------------------------

    fn alloc_reg(&mut self) -> Result<Reg, CompileError> {
        for i in 0..isa::NUM_TEMP_REGS {
            let bit = 1u16 << i;
            if self.regs_in_use & bit == 0 {
                self.regs_in_use |= bit;
                return Ok(isa::T0 + i as u8);
            }
        }
        Err(self.internal("out of temporary registers"))
    }

    fn free_reg(&mut self, r: Reg) {
        debug_assert!((isa::T0..isa::T0 + isa::NUM_TEMP_REGS as u8).contains(&r));
        self.regs_in_use &= !(1u16 << (r - isa::T0));
    }

    /// Reserve `size` bytes of call-site spill space in the current frame.
    fn alloc_spill(&mut self, size: i64) -> i64 {
        let size = align_to(size.max(8), 8);
        self.spill_cur += size;
        self.spill_max = self.spill_max.max(self.spill_cur);
        self.locals_size + self.spill_cur
    }

    fn free_spill(&mut self, size: i64) {
        let size = align_to(size.max(8), 8);
        self.spill_cur -= size;
        debug_assert!(self.spill_cur >= 0);
    }

    // --- labels ----------------------------------------------------------

    fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.here() as i64);
    }

    /// Emit a jump with a patched target.
    fn emit_jmp(&mut self, label: &str) {
        self.text.push(Op::Jmp.word());
        self.label_patches.push((label.to_string(), self.here()));
        self.text.push(PATCH_PLACEHOLDER);
    }

    fn emit_jz(&mut self, rs: Reg, label: &str) {
        self.text.push(Op::Jz.word());
        self.text.push(rs as i64);
        self.label_patches.push((label.to_string(), self.here()));
        self.text.push(PATCH_PLACEHOLDER);
    }

    fn emit_jnz(&mut self, rs: Reg, label: &str) {
        self.text.push(Op::Jnz.word());
        self.text.push(rs as i64);
        self.label_patches.push((label.to_string(), self.here()));
        self.text.push(PATCH_PLACEHOLDER);
    }

    /// Load a label's absolute text address (for `&&label`).
    fn emit_label_addr(&mut self, rd: Reg, label: &str) {
        self.text.push(Op::Li.word());
        self.text.push(rd as i64);
        self.label_patches.push((label.to_string(), self.here()));
        self.text.push(PATCH_PLACEHOLDER);
    }

    fn patch_labels(&mut self) -> Result<(), CompileError> {
        for (name, slot) in std::mem::take(&mut self.label_patches) {
            match self.labels.get(&name) {
                Some(&target) => self.text[slot] = target,
                None => {
                    let pretty = name.strip_prefix("u.").unwrap_or(&name);
                    return Err(CompileError::Link {
                        loc: None,
                        msg: format!("use of undefined label '{}'", pretty),
                    });
                }
            }
        }
        self.labels.clear();
        Ok(())
    }

    // --- ffi and constants ----------------------------------------------

    fn intern_ffi(&mut self, name: &str) -> usize {
        if let Some(&i) = self.ffi_index.get(name) {
            return i;
        }
        let i = self.ffi_names.len();
        self.ffi_names.push(name.to_string());
        self.ffi_index.insert(name.to_string(), i);
        i
    }

    /// Virtual address of an 8-byte float constant in the data segment.
    fn float_const(&mut self, val: f64) -> u64 {
        let bits = val.to_bits();
        if let Some(&addr) = self.float_consts.get(&bits) {
            return addr;
        }
        let off = align_to(self.data.len() as i64, 8) as usize;
        self.data.resize(off, 0);
        self.data.extend_from_slice(&bits.to_le_bytes());
        let addr = DATA_BASE + off as u64;
        self.float_consts.insert(bits, addr);
        addr
    }

    // --- data segment layout ---------------------------------------------

    fn layout_data(&mut self, program: &[ObjId]) -> Result<(), CompileError> {
        // Globals first, in program order.
        for &id in program {
            let (is_fn, name, ty, size, align, has_def) = {
                let o = self.cc.objs.get(id);
                let t = self.cc.types.get(o.ty);
                (
                    o.is_function,
                    o.name.clone(),
                    o.ty,
                    t.size,
                    t.align.max(1),
                    o.is_definition,
                )
            };
            if is_fn {
                if self.cc.objs.get(id).body.is_some() {
                    self.defined_fns.insert(name);
                }
                continue;
            }
            if !has_def || size < 0 {
                continue; // extern declaration; resolution may still fail later
            }
            let off = align_to(self.data.len() as i64, align) as usize;
            self.data.resize(off, 0);
            let addr = DATA_BASE + off as u64;
            match self.cc.objs.get(id).init_data.clone() {
                Some(bytes) => {
                    self.data.extend_from_slice(&bytes);
                    if bytes.len() < size as usize {
                        self.data
                            .extend(std::iter::repeat(0).take(size as usize - bytes.len()));
                    }
                }
                None => self.data.extend(std::iter::repeat(0).take(size as usize)),
            }
            self.global_addrs.insert(name.clone(), addr);
            self.cc.objs.get_mut(id).data_addr = addr;
            self.symbols.push(Symbol {
                name,
                kind: SymbolKind::Data,
                addr,
                size: size as u64,
            });
            let _ = ty;
        }

        // Rotating struct-return buffer pool, sized for the largest
        // struct-returning function in the program.
        let mut max_ret: i64 = 0;
        for &id in program {
            let o = self.cc.objs.get(id);
            if !o.is_function {
                continue;
            }
            if let Some(ret) = self.cc.types.return_type_of(o.ty) {
                if self.cc.types.is_struct_or_union(ret) {
                    max_ret = max_ret.max(self.cc.types.get(ret).size);
                }
            }
        }
        if max_ret > 0 {
            let slot = align_to(max_ret, 8);
            let off = align_to(self.data.len() as i64, 8) as usize;
            self.data
                .resize(off + slot as usize * isa::RET_BUF_SLOTS, 0);
            self.ret_pool = (off as u32, slot as u32);
        }

        // Initializer relocations now that every global has its address.
        for &id in program {
            let (base_addr, relocs) = {
                let o = self.cc.objs.get(id);
                (o.data_addr, o.relocs.clone())
            };
            if relocs.is_empty() || base_addr == 0 {
                continue;
            }
            for r in relocs {
                let at = (base_addr - DATA_BASE) as usize + r.offset;
                if let Some(&addr) = self.global_addrs.get(&r.symbol) {
                    let val = (addr as i64).wrapping_add(r.addend) as u64;
                    self.data[at..at + 8].copy_from_slice(&val.to_le_bytes());
                } else if self.defined_fns.contains(&r.symbol) {
                    self.data_fn_relocs.push((at, r.symbol, r.addend));
                } else {
                    let loc = self.cc.objs.get(id).loc;
                    return Err(CompileError::Link {
                        loc,
                        msg: format!("undefined reference to '{}'", r.symbol),
                    });
                }
            }
        }
        Ok(())
    }

    // --- functions --------------------------------------------------------

    fn gen_program(&mut self, program: &[ObjId]) -> Result<(), CompileError> {
        for &id in program {
            let is_def_fn = {
                let o = self.cc.objs.get(id);
                o.is_function && o.body.is_some()
            };
            if is_def_fn {
                self.gen_function(id)?;
            }
        }
        Ok(())
    }

    fn assign_lvar_offsets(&mut self, fnid: ObjId) -> (i64, u8, bool, i64) {
        let (params, locals, fty) = {
            let o = self.cc.objs.get(fnid);
            (o.params.clone(), o.locals.clone(), o.ty)
        };
        let is_variadic = matches!(
            self.cc.types.get(fty).kind,
            TypeKind::Func {
                is_variadic: true,
                ..
            }
        );
        let nparams = params.len() as u8;

        // Parameter slots sit just under the canary slot; variadic
        // functions reserve the full A-register spill block.
        for (i, &pid) in params.iter().enumerate() {
            self.cc.objs.get_mut(pid).offset = 16 + 8 * i as i64;
        }
        let nslots = if is_variadic {
            NUM_ARG_REGS as i64
        } else {
            nparams as i64
        };
        let mut cur = 16 + 8 * nslots - 8; // last used byte offset
        if cur < 8 {
            cur = 8;
        }
        for &lid in &locals {
            if self.cc.objs.get(lid).is_param {
                continue;
            }
            let (size, align) = {
                let t = self.cc.types.get(self.cc.objs.get(lid).ty);
                (t.size.max(8), t.align.max(8))
            };
            cur += size;
            cur = align_to(cur, align);
            self.cc.objs.get_mut(lid).offset = cur;
        }
        // Float parameter mask for the prologue's register spill.
        let mut fmask: i64 = 0;
        for (i, &pid) in params.iter().enumerate() {
            let ty = self.cc.objs.get(pid).ty;
            if self.cc.types.is_flonum(ty) {
                fmask |= 1 << i;
            }
        }
        (cur, nparams, is_variadic, fmask)
    }

    fn gen_function(&mut self, fnid: ObjId) -> Result<(), CompileError> {
        let (name, loc, fty) = {
            let o = self.cc.objs.get(fnid);
            (o.name.clone(), o.loc, o.ty)
        };
        self.labels.clear();
        self.label_patches.clear();
        self.regs_in_use = 0;
        self.spill_cur = 0;
        self.spill_max = 0;
        self.last_line = 0;

        let (locals_size, nparams, is_variadic, fmask) = self.assign_lvar_offsets(fnid);
        self.locals_size = locals_size;
        self.cur_fn_nfixed = nparams as usize;
        self.cur_fn_ret = self.cc.types.return_type_of(fty);

        let entry = self.here() as i64;
        self.cc.objs.get_mut(fnid).code_addr = entry;
        self.fn_addrs.insert(name.clone(), entry);
        self.note_loc(loc);

        // The frame size operand is patched once spill usage is known.
        let enter_operand_at = self.here() + 1;
        self.emit2(
            Op::Enter,
            isa::pack_enter(0, nparams, is_variadic),
            fmask,
        );

        self.ret_label = self.cc.new_unique_name("ret");
        let body = self
            .cc
            .objs
            .get_mut(fnid)
            .body
            .take()
            .ok_or_else(|| self.internal("function without a body reached codegen"))?;
        self.gen_stmt(&body)?;
        self.cc.objs.get_mut(fnid).body = Some(body);

        // Falling off the end of main returns zero.
        let ret = self.ret_label.clone();
        if name == "main" {
            self.emit_li(A0, 0);
        }
        self.define_label(&ret);
        self.emit0(Op::Leave);

        let frame = align_to(self.locals_size + self.spill_max, 16);
        self.text[enter_operand_at] = isa::pack_enter(frame as u32, nparams, is_variadic);
        self.cc.objs.get_mut(fnid).stack_size = frame;

        self.patch_labels()?;
        if self.regs_in_use != 0 {
            return Err(self.internal(format!(
                "register leak in '{}' (bitmap {:#b})",
                name, self.regs_in_use
            )));
        }

        self.symbols.push(Symbol {
            name,
            kind: SymbolKind::Function,
            addr: entry as u64,
            size: (self.here() as i64 - entry) as u64,
        });
        Ok(())
    }

    // --- statements -------------------------------------------------------

    fn gen_stmt(&mut self, node: &Node) -> Result<(), CompileError> {
        self.note_loc(node.loc);
        match &node.kind {
            NodeKind::Block { body } => {
                for n in body {
                    self.gen_stmt(n)?;
                }
                Ok(())
            }
            NodeKind::ExprStmt { expr } => {
                let r = self.alloc_reg()?;
                self.gen_expr(expr, r)?;
                self.free_reg(r);
                Ok(())
            }
            NodeKind::Return { expr } => {
                if let Some(e) = expr {
                    let ret_ty = e.ty.unwrap();
                    if self.cc.types.is_struct_or_union(ret_ty) {
                        self.gen_struct_return(e)?;
                    } else if self.cc.types.is_flonum(ret_ty) {
                        let r = self.alloc_reg()?;
                        self.gen_expr(e, r)?;
                        self.emit_rr(Op::FMov, A0, r);
                        self.free_reg(r);
                    } else {
                        let r = self.alloc_reg()?;
                        self.gen_expr(e, r)?;
                        self.emit_rr(Op::Mov, A0, r);
                        self.free_reg(r);
                    }
                }
                let ret = self.ret_label.clone();
                self.emit_jmp(&ret);
                Ok(())
            }
            NodeKind::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                let l_else = self.cc.new_unique_name("else");
                let l_end = self.cc.new_unique_name("end");
                let r = self.alloc_reg()?;
                self.gen_cond(cond, r)?;
                self.emit_jz(r, &l_else);
                self.free_reg(r);
                self.gen_stmt(then_stmt)?;
                self.emit_jmp(&l_end);
                self.define_label(&l_else);
                if let Some(e) = else_stmt {
                    self.gen_stmt(e)?;
                }
                self.define_label(&l_end);
                Ok(())
            }
            NodeKind::For {
                init,
                cond,
                inc,
                body,
                brk_label,
                cont_label,
            } => {
                let l_begin = self.cc.new_unique_name("begin");
                if let Some(i) = init {
                    self.gen_stmt(i)?;
                }
                self.define_label(&l_begin);
                if let Some(c) = cond {
                    let r = self.alloc_reg()?;
                    self.gen_cond(c, r)?;
                    self.emit_jz(r, brk_label);
                    self.free_reg(r);
                }
                self.gen_stmt(body)?;
                self.define_label(cont_label);
                if let Some(i) = inc {
                    let r = self.alloc_reg()?;
                    self.gen_expr(i, r)?;
                    self.free_reg(r);
                }
                self.emit_jmp(&l_begin);
                self.define_label(brk_label);
                Ok(())
            }
            NodeKind::DoWhile {
                body,
                cond,
                brk_label,
                cont_label,
            } => {
                let l_begin = self.cc.new_unique_name("begin");
                self.define_label(&l_begin);
                self.gen_stmt(body)?;
                self.define_label(cont_label);
                let r = self.alloc_reg()?;
                self.gen_cond(cond, r)?;
                self.emit_jnz(r, &l_begin);
                self.free_reg(r);
                self.define_label(brk_label);
                Ok(())
            }
            NodeKind::Switch {
                cond,
                body,
                cases,
                default_label,
                brk_label,
            } => {
                // Linear compare chain, then default (or past the switch).
                let val = self.alloc_reg()?;
                self.gen_expr(cond, val)?;
                let t = self.alloc_reg()?;
                let chk = self.alloc_reg()?;
                for case in cases {
                    if case.lo == case.hi {
                        self.emit_li(t, case.lo);
                        self.emit_rrr(Op::Seq, chk, val, t);
                        self.emit_jnz(chk, &case.label);
                    } else {
                        // GNU range: lo <= v && v <= hi
                        let l_skip = self.cc.new_unique_name("skip");
                        self.emit_li(t, case.lo);
                        self.emit_rrr(Op::Slt, chk, val, t);
                        self.emit_jnz(chk, &l_skip);
                        self.emit_li(t, case.hi);
                        self.emit_rrr(Op::Sgt, chk, val, t);
                        self.emit_jnz(chk, &l_skip);
                        self.emit_jmp(&case.label);
                        self.define_label(&l_skip);
                    }
                }
                self.free_reg(chk);
                self.free_reg(t);
                self.free_reg(val);
                match default_label {
                    Some(d) => self.emit_jmp(d),
                    None => self.emit_jmp(brk_label),
                }
                self.gen_stmt(body)?;
                self.define_label(brk_label);
                Ok(())
            }
            NodeKind::Case { label, body } => {
                self.define_label(label);
                self.gen_stmt(body)
            }
            NodeKind::Goto { label } => {
                self.emit_jmp(label);
                Ok(())
            }
            NodeKind::GotoExpr { expr } => {
                let r = self.alloc_reg()?;
                self.gen_expr(expr, r)?;
                self.emit1(Op::JmpI, r as i64);
                self.free_reg(r);
                Ok(())
            }
            NodeKind::Label { label, body } => {
                self.define_label(label);
                self.gen_stmt(body)
            }
            NodeKind::Asm { .. } => Ok(()),
            NodeKind::Error => Err(self.internal("error node reached code generation")),
            // Expression used in statement position (e.g. initializer
            // lowering chains).
            _ => {
                let r = self.alloc_reg()?;
                self.gen_expr(node, r)?;
                self.free_reg(r);
                Ok(())
            }
        }
    }

    fn gen_struct_return(&mut self, e: &Node) -> Result<(), CompileError> {
        let size = self.cc.types.get(e.ty.unwrap()).size;
        let src = self.alloc_reg()?;
        self.gen_addr(e, src)?;
        let (pool_off, slot) = self.ret_pool;
        if slot == 0 {
            return Err(self.internal("struct return without a return buffer pool"));
        }
        // RETBUF rotates the pool and leaves the slot address in A1.
        self.emit1(Op::RetBuf, isa::pack_retbuf(pool_off, slot));
        let len = self.alloc_reg()?;
        self.emit_li(len, size);
        self.emit_rrr(Op::Mcpy, isa::A1, src, len);
        self.free_reg(len);
        self.free_reg(src);
        self.emit_rr(Op::Mov, A0, isa::A1);
        Ok(())
    }

    // --- finish -----------------------------------------------------------

    fn finish(mut self, program: &[ObjId]) -> Result<Image, CompileError> {
        // Resolve call and function-address patches.
        for (name, slot, loc) in std::mem::take(&mut self.call_patches) {
            match self.fn_addrs.get(&name) {
                Some(&addr) => self.text[slot] = addr,
                None => {
                    return Err(CompileError::Link {
                        loc,
                        msg: format!("undefined reference to function '{}'", name),
                    })
                }
            }
        }
        // Function pointers stored in global initializers.
        for (at, name, addend) in std::mem::take(&mut self.data_fn_relocs) {
            let addr = *self.fn_addrs.get(&name).ok_or_else(|| CompileError::Link {
                loc: None,
                msg: format!("undefined reference to function '{}'", name),
            })?;
            let val = addr.wrapping_add(addend) as u64;
            self.data[at..at + 8].copy_from_slice(&val.to_le_bytes());
        }
        // Entry point.
        let main_addr = self
            .fn_addrs
            .get("main")
            .copied()
            .ok_or_else(|| CompileError::Link {
                loc: None,
                msg: "undefined reference to 'main'".to_string(),
            })?;
        self.text[0] = main_addr;

        debug_assert!(
            !self.text.contains(&PATCH_PLACEHOLDER),
            "unresolved patch slot in text segment"
        );

        let _ = program;
        Ok(Image {
            text: self.text,
            data: self.data,
            ffi_names: self.ffi_names,
            symbols: self.symbols,
            source_map: self.source_map,
            files: self.cc.files.clone(),
        })
    }

    // --- shared lookups used by expression generation --------------------

    fn obj(&self, id: ObjId) -> &Obj {
        self.cc.objs.get(id)
    }

    fn unique(&mut self, tag: &str) -> String {
        self.cc.new_unique_name(tag)
    }

    fn fn_defined(&self, name: &str) -> bool {
        self.defined_fns.contains(name)
    }

    fn global_addr(&self, name: &str) -> Option<u64> {
        self.global_addrs.get(name).copied()
    }

    fn push_call_patch(&mut self, name: String, slot: usize, loc: Option<Loc>) {
        self.call_patches.push((name, slot, loc));
    }

    /// bp-relative frame offset of the first variadic argument slot.
    fn va_area_offset(&self) -> i64 {
        16 + 8 * self.cur_fn_nfixed as i64
    }
}
