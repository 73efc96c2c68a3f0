//! The CVM instruction set.
//!
//! Instructions are sequences of 64-bit words: one opcode word followed by
//! zero to three operand words. An operand word never shares a slot with an
//! opcode word, and the decoder always consumes an opcode together with its
//! operands, so the stream can be walked without a separate length table.
//!
//! Operand word packings:
//!
//! - three-register: `rd | rs1 << 8 | rs2 << 16` (one word)
//! - two-register:   `rd | rs << 8` (one word)
//! - register+immediate: a register word, then a raw 64-bit immediate
//! - control flow: absolute text addresses or register indices, one per word
//!
//! There are two register files sharing one numbering: integer and float.
//! A0..A7 carry arguments and returns, T0..T10 are caller-saved scratch, and
//! ZERO reads zero and ignores writes.

use std::fmt::Write as _;

pub type Reg = u8;

pub const A0: Reg = 0;
pub const A1: Reg = 1;
pub const A2: Reg = 2;
pub const A3: Reg = 3;
pub const A4: Reg = 4;
pub const A5: Reg = 5;
pub const A6: Reg = 6;
pub const A7: Reg = 7;
pub const T0: Reg = 8;
pub const ZERO: Reg = 19;
pub const NUM_ARG_REGS: usize = 8;
pub const NUM_TEMP_REGS: usize = 11;
pub const NUM_REGS: usize = 20;

pub fn reg_name(r: Reg) -> String {
    match r {
        0..=7 => format!("a{}", r),
        8..=18 => format!("t{}", r - 8),
        19 => "zero".to_string(),
        _ => format!("r?{}", r),
    }
}

pub fn freg_name(r: Reg) -> String {
    match r {
        0..=7 => format!("fa{}", r),
        8..=18 => format!("ft{}", r - 8),
        19 => "fzero".to_string(),
        _ => format!("f?{}", r),
    }
}

// --- virtual address space ---------------------------------------------

/// Function addresses are plain text-segment word indices, below DATA_BASE.
pub const DATA_BASE: u64 = 0x4000_0000;
pub const HEAP_BASE: u64 = 0x8000_0000;
/// The stack occupies [STACK_TOP - stack_size, STACK_TOP) and grows down.
pub const STACK_TOP: u64 = 0xC000_0000;

/// Memory-tagged pointers carry a generation in bits 56..63.
pub const TAG_SHIFT: u32 = 56;
pub const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;

pub fn strip_tag(addr: u64) -> u64 {
    addr & ADDR_MASK
}

pub fn tag_of(addr: u64) -> u8 {
    (addr >> TAG_SHIFT) as u8
}

pub fn with_tag(addr: u64, tag: u8) -> u64 {
    (addr & ADDR_MASK) | ((tag as u64) << TAG_SHIFT)
}

/// Slots in the rotating struct-return buffer pool.
pub const RET_BUF_SLOTS: usize = 8;

macro_rules! define_ops {
    ($($(#[$attr:meta])* $variant:ident => ($mnemonic:literal, $words:expr)),* $(,)?) => {
        /// Every opcode, with its original-flavored mnemonic.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($(#[$attr])* $variant),*
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$variant),*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Op::$variant => $mnemonic),*
                }
            }

            /// How many operand words follow the opcode word.
            pub fn operand_words(self) -> usize {
                match self {
                    $(Op::$variant => $words),*
                }
            }

            pub fn from_word(word: i64) -> Option<Op> {
                usize::try_from(word).ok().and_then(|i| Self::ALL.get(i).copied())
            }

            pub fn word(self) -> i64 {
                self as i64
            }
        }
    };
}

define_ops! {
    Nop => ("NOP", 0),

    // Integer three-register arithmetic and compares.
    Add => ("ADD3", 1),
    Sub => ("SUB3", 1),
    Mul => ("MUL3", 1),
    Div => ("DIV3", 1),
    DivU => ("DIVU3", 1),
    Mod => ("MOD3", 1),
    ModU => ("MODU3", 1),
    And => ("AND3", 1),
    Or => ("OR3", 1),
    Xor => ("XOR3", 1),
    Shl => ("SHL3", 1),
    Shr => ("SHR3", 1),
    Sar => ("SAR3", 1),
    Seq => ("SEQ3", 1),
    Sne => ("SNE3", 1),
    Slt => ("SLT3", 1),
    SltU => ("SLTU3", 1),
    Sle => ("SLE3", 1),
    SleU => ("SLEU3", 1),
    Sgt => ("SGT3", 1),
    SgtU => ("SGTU3", 1),
    Sge => ("SGE3", 1),
    SgeU => ("SGEU3", 1),

    // Float three-register; compares write an integer register.
    FAdd => ("FADD3", 1),
    FSub => ("FSUB3", 1),
    FMul => ("FMUL3", 1),
    FDiv => ("FDIV3", 1),
    FEq => ("FEQ3", 1),
    FNe => ("FNE3", 1),
    FLt => ("FLT3", 1),
    FLe => ("FLE3", 1),
    FGt => ("FGT3", 1),
    FGe => ("FGE3", 1),

    // Aggregate copy: dest addr, src addr, byte length.
    Mcpy => ("MCPY", 1),
    // Atomics: CAS packs four registers (dest, addr, expected-addr, desired).
    Cas => ("CAS", 1),
    Exch => ("EXCH", 1),

    // Two-register moves, unaries, conversions.
    Mov => ("MOV3", 1),
    Neg => ("NEG3", 1),
    Not => ("NOT3", 1),
    BNot => ("BNOT3", 1),
    FMov => ("FMOV3", 1),
    FNeg => ("FNEG3", 1),
    SextB => ("SEXT_B", 1),
    SextH => ("SEXT_H", 1),
    SextW => ("SEXT_W", 1),
    ZextB => ("ZEXT_B", 1),
    ZextH => ("ZEXT_H", 1),
    ZextW => ("ZEXT_W", 1),
    I2F => ("I2F3", 1),
    U2F => ("U2F3", 1),
    F2I => ("F2I3", 1),
    FRound32 => ("FRND32", 1),
    /// Raw bit move, float register to integer register.
    Fr2R => ("FR2R", 1),
    /// Raw bit move, integer register to float register.
    R2Fr => ("R2FR", 1),

    // Loads: rd <- mem[rs]; signed unless the _U variant.
    LdrB => ("LDR_B", 1),
    LdrH => ("LDR_H", 1),
    LdrW => ("LDR_W", 1),
    LdrD => ("LDR_D", 1),
    LdrBu => ("LDR_BU", 1),
    LdrHu => ("LDR_HU", 1),
    LdrWu => ("LDR_WU", 1),
    FLdr => ("FLDR", 1),
    FLdrS => ("FLDR_S", 1),

    // Stores: mem[rd] <- rs (rs is a float register for FSTR variants).
    StrB => ("STR_B", 1),
    StrH => ("STR_H", 1),
    StrW => ("STR_W", 1),
    StrD => ("STR_D", 1),
    FStr => ("FSTR", 1),
    FStrS => ("FSTR_S", 1),

    // Register+immediate.
    Li => ("LI3", 2),
    Lea => ("LEA3", 2),
    AddI => ("ADDI3", 2),

    // Control flow.
    Jmp => ("JMP", 1),
    Jz => ("JZ3", 2),
    Jnz => ("JNZ3", 2),
    JmpI => ("JMPI", 1),
    Call => ("CALL", 1),
    CallI => ("CALLI", 1),
    CallF => ("CALLF", 3),
    Enter => ("ENT3", 2),
    Leave => ("LEV3", 0),
    RetBuf => ("RETBUF", 1),
    Alloca => ("MALC", 0),
    SetJmp => ("SETJMP", 0),
    LongJmp => ("LONGJMP", 0),
    Exit => ("EXIT", 0),

    // Sanitizer support.
    ScopeIn => ("SCOPEIN", 1),
    ScopeOut => ("SCOPEOUT", 1),
    ChkPtr => ("CHKP3", 1),
    ChkAlign => ("CHKA3", 1),
    ChkTag => ("CHKT3", 1),
}

// --- operand word packing ----------------------------------------------

pub fn pack_rrr(rd: Reg, rs1: Reg, rs2: Reg) -> i64 {
    rd as i64 | (rs1 as i64) << 8 | (rs2 as i64) << 16
}

pub fn unpack_rrr(word: i64) -> (Reg, Reg, Reg) {
    (word as u8, (word >> 8) as u8, (word >> 16) as u8)
}

pub fn pack_rrrr(rd: Reg, rs1: Reg, rs2: Reg, rs3: Reg) -> i64 {
    pack_rrr(rd, rs1, rs2) | (rs3 as i64) << 24
}

pub fn unpack_rrrr(word: i64) -> (Reg, Reg, Reg, Reg) {
    (
        word as u8,
        (word >> 8) as u8,
        (word >> 16) as u8,
        (word >> 24) as u8,
    )
}

pub fn pack_rr(rd: Reg, rs: Reg) -> i64 {
    rd as i64 | (rs as i64) << 8
}

pub fn unpack_rr(word: i64) -> (Reg, Reg) {
    (word as u8, (word >> 8) as u8)
}

/// ENT3 operand: frame byte size, parameter count, variadic flag.
pub fn pack_enter(stack_size: u32, nparams: u8, is_variadic: bool) -> i64 {
    stack_size as i64 | (nparams as i64) << 32 | (is_variadic as i64) << 40
}

pub fn unpack_enter(word: i64) -> (u32, u8, bool) {
    (word as u32, (word >> 32) as u8, (word >> 40) & 1 != 0)
}

/// RETBUF operand: data-segment offset of the pool and per-slot byte size.
pub fn pack_retbuf(pool_off: u32, slot_size: u32) -> i64 {
    pool_off as i64 | (slot_size as i64) << 32
}

pub fn unpack_retbuf(word: i64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// SCOPEIN/SCOPEOUT operand: frame-offset range [lo, lo+len) below bp.
pub fn pack_scope(lo: u32, len: u32) -> i64 {
    lo as i64 | (len as i64) << 32
}

pub fn unpack_scope(word: i64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// CHKP3/CHKA3 operand: register plus access size (or required alignment).
pub fn pack_chk(rs: Reg, size: u32) -> i64 {
    rs as i64 | (size as i64) << 16
}

pub fn unpack_chk(word: i64) -> (Reg, u32) {
    (word as u8, (word >> 16) as u32)
}

// --- disassembler -------------------------------------------------------

/// Render the instruction at `pc`. Returns the text and the total word
/// count consumed, or None if the opcode word is invalid.
pub fn disasm_one(text: &[i64], pc: usize) -> Option<(String, usize)> {
    let op = Op::from_word(*text.get(pc)?)?;
    let nops = op.operand_words();
    if nops > 0 && pc + nops >= text.len() {
        return None;
    }
    let w = |i: usize| text.get(pc + i).copied().unwrap_or(0);
    let mut s = format!("{:6}", op.mnemonic());
    match op {
        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::DivU
        | Op::Mod
        | Op::ModU
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Shl
        | Op::Shr
        | Op::Sar
        | Op::Seq
        | Op::Sne
        | Op::Slt
        | Op::SltU
        | Op::Sle
        | Op::SleU
        | Op::Sgt
        | Op::SgtU
        | Op::Sge
        | Op::SgeU
        | Op::Mcpy
        | Op::Exch => {
            let (rd, rs1, rs2) = unpack_rrr(w(1));
            let _ = write!(s, " {}, {}, {}", reg_name(rd), reg_name(rs1), reg_name(rs2));
        }
        Op::Cas => {
            let (rd, rs1, rs2, rs3) = unpack_rrrr(w(1));
            let _ = write!(
                s,
                " {}, {}, {}, {}",
                reg_name(rd),
                reg_name(rs1),
                reg_name(rs2),
                reg_name(rs3)
            );
        }
        Op::FAdd | Op::FSub | Op::FMul | Op::FDiv => {
            let (rd, rs1, rs2) = unpack_rrr(w(1));
            let _ = write!(
                s,
                " {}, {}, {}",
                freg_name(rd),
                freg_name(rs1),
                freg_name(rs2)
            );
        }
        Op::FEq | Op::FNe | Op::FLt | Op::FLe | Op::FGt | Op::FGe => {
            let (rd, rs1, rs2) = unpack_rrr(w(1));
            let _ = write!(
                s,
                " {}, {}, {}",
                reg_name(rd),
                freg_name(rs1),
                freg_name(rs2)
            );
        }
        Op::Mov | Op::Neg | Op::Not | Op::BNot | Op::SextB | Op::SextH | Op::SextW
        | Op::ZextB | Op::ZextH | Op::ZextW => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, {}", reg_name(rd), reg_name(rs));
        }
        Op::FMov | Op::FNeg | Op::FRound32 => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, {}", freg_name(rd), freg_name(rs));
        }
        Op::I2F | Op::U2F | Op::R2Fr => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, {}", freg_name(rd), reg_name(rs));
        }
        Op::F2I | Op::Fr2R => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, {}", reg_name(rd), freg_name(rs));
        }
        Op::LdrB | Op::LdrH | Op::LdrW | Op::LdrD | Op::LdrBu | Op::LdrHu | Op::LdrWu => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, [{}]", reg_name(rd), reg_name(rs));
        }
        Op::FLdr | Op::FLdrS => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " {}, [{}]", freg_name(rd), reg_name(rs));
        }
        Op::StrB | Op::StrH | Op::StrW | Op::StrD => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " [{}], {}", reg_name(rd), reg_name(rs));
        }
        Op::FStr | Op::FStrS => {
            let (rd, rs) = unpack_rr(w(1));
            let _ = write!(s, " [{}], {}", reg_name(rd), freg_name(rs));
        }
        Op::Li | Op::AddI => {
            let _ = write!(s, " {}, {}", reg_name(w(1) as u8), w(2));
        }
        Op::Lea => {
            let _ = write!(s, " {}, bp{:+}", reg_name(w(1) as u8), w(2));
        }
        Op::Jmp | Op::Call => {
            let _ = write!(s, " {:#x}", w(1));
        }
        Op::Jz | Op::Jnz => {
            let _ = write!(s, " {}, {:#x}", reg_name(w(1) as u8), w(2));
        }
        Op::JmpI | Op::CallI => {
            let _ = write!(s, " [{}]", reg_name(w(1) as u8));
        }
        Op::CallF => {
            let _ = write!(s, " ffi#{}, nargs={}, fmask={:#b}", w(1), w(2), w(3));
        }
        Op::Enter => {
            let (size, nparams, variadic) = unpack_enter(w(1));
            let _ = write!(
                s,
                " frame={}, params={}{}, fmask={:#b}",
                size,
                nparams,
                if variadic { ", variadic" } else { "" },
                w(2)
            );
        }
        Op::RetBuf => {
            let (off, slot) = unpack_retbuf(w(1));
            let _ = write!(s, " pool={:#x}, slot={}", off, slot);
        }
        Op::ScopeIn | Op::ScopeOut => {
            let (lo, len) = unpack_scope(w(1));
            let _ = write!(s, " bp-{}..bp-{}", lo + len, lo);
        }
        Op::ChkPtr | Op::ChkAlign => {
            let (rs, size) = unpack_chk(w(1));
            let _ = write!(s, " {}, {}", reg_name(rs), size);
        }
        Op::ChkTag => {
            let _ = write!(s, " {}", reg_name(w(1) as u8));
        }
        Op::Nop | Op::Leave | Op::Alloca | Op::SetJmp | Op::LongJmp | Op::Exit => {}
    }
    Some((s, 1 + nops))
}

/// Disassemble a whole text segment. `text[0]` is the entry offset.
pub fn disassemble(text: &[i64]) -> String {
    let mut out = String::new();
    if text.is_empty() {
        return out;
    }
    let _ = writeln!(out, "entry: {:#x}", text[0]);
    let mut pc = 1;
    while pc < text.len() {
        match disasm_one(text, pc) {
            Some((s, n)) => {
                let _ = writeln!(out, "{:#08x}: {}", pc, s);
                pc += n;
            }
            None => {
                let _ = writeln!(out, "{:#08x}: .word {:#x}", pc, text[pc]);
                pc += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_words_round_trip() {
        for &op in Op::ALL {
            assert_eq!(Op::from_word(op.word()), Some(op));
        }
        assert_eq!(Op::from_word(-1), None);
        assert_eq!(Op::from_word(Op::ALL.len() as i64), None);
    }

    #[test]
    fn rrr_packing_round_trips() {
        let w = pack_rrr(T0, A0, A1);
        assert_eq!(unpack_rrr(w), (T0, A0, A1));
        let w = pack_rrrr(T0, A0, A1, A2);
        assert_eq!(unpack_rrrr(w), (T0, A0, A1, A2));
    }

    #[test]
    fn enter_packing_round_trips() {
        let w = pack_enter(4096, 7, true);
        assert_eq!(unpack_enter(w), (4096, 7, true));
        let w = pack_enter(0, 0, false);
        assert_eq!(unpack_enter(w), (0, 0, false));
    }

    #[test]
    fn tagged_pointers() {
        let p = HEAP_BASE + 64;
        let t = with_tag(p, 3);
        assert_eq!(strip_tag(t), p);
        assert_eq!(tag_of(t), 3);
    }

    #[test]
    fn disassembles_a_simple_add() {
        let text = vec![
            2, // entry
            Op::Li.word(),
            A0 as i64,
            42,
            Op::Add.word(),
            pack_rrr(A0, A0, ZERO),
            Op::Leave.word(),
        ];
        let out = disassemble(&text);
        assert!(out.contains("LI3"), "{}", out);
        assert!(out.contains("ADD3"), "{}", out);
        assert!(out.contains("LEV3"), "{}", out);
    }
}
