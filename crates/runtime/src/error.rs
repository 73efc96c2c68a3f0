//! Runtime faults.
//!
//! Every fault renders as a banner naming the failure, the operands
//! involved, and the text offset, plus the enclosing function and source
//! line when the image carries them. Faults terminate the run; none of
//! them return control to the guest program.

use cvm_core::image::Image;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    InvalidMemory { addr: u64 },
    MisalignedAccess { addr: u64, align: u64 },
    UnknownOpcode { word: i64 },
    BadJump { target: i64 },
    DivideByZero,
    StackOverflow,
    OutOfMemory { requested: u64 },
    StackCanary { found: u64 },
    HeapCanary { addr: u64, which: &'static str },
    DoubleFree { addr: u64 },
    InvalidFree { addr: u64 },
    UseAfterFree { addr: u64 },
    OutOfBounds { addr: u64, size: u64 },
    UseAfterScope { addr: u64 },
    TagMismatch { addr: u64, expected: u8, found: u8 },
    CfiViolation { expected: u64, found: u64 },
    Overflow { op: &'static str },
    UninitRead { addr: u64 },
    FfiDenied { name: String },
    FfiUnknown { name: String },
    FfiArity { name: String, expected: usize, got: usize },
    Abort { msg: String },
}

impl Fault {
    pub fn describe(&self) -> String {
        match self {
            Fault::InvalidMemory { addr } => {
                format!("invalid memory access at {:#x}", addr)
            }
            Fault::MisalignedAccess { addr, align } => {
                format!("misaligned access at {:#x} (requires {}-byte alignment)", addr, align)
            }
            Fault::UnknownOpcode { word } => format!("unknown opcode word {:#x}", word),
            Fault::BadJump { target } => format!("jump outside the text segment ({:#x})", target),
            Fault::DivideByZero => "division by zero".to_string(),
            Fault::StackOverflow => "stack overflow".to_string(),
            Fault::OutOfMemory { requested } => {
                format!("out of memory (requested {} bytes)", requested)
            }
            Fault::StackCanary { found } => format!(
                "stack canary corrupted (found {:#x}); stack buffer overflow",
                found
            ),
            Fault::HeapCanary { addr, which } => format!(
                "heap canary corrupted ({} guard) on block at {:#x}; heap buffer overflow",
                which, addr
            ),
            Fault::DoubleFree { addr } => format!("double free of {:#x}", addr),
            Fault::InvalidFree { addr } => {
                format!("free of {:#x}, which is not an allocated block", addr)
            }
            Fault::UseAfterFree { addr } => format!("use after free at {:#x}", addr),
            Fault::OutOfBounds { addr, size } => {
                format!("out-of-bounds access of {} byte(s) at {:#x}", size, addr)
            }
            Fault::UseAfterScope { addr } => {
                format!("use of out-of-scope stack memory at {:#x}", addr)
            }
            Fault::TagMismatch {
                addr,
                expected,
                found,
            } => format!(
                "memory tag mismatch at {:#x} (pointer generation {}, block generation {})",
                addr, found, expected
            ),
            Fault::CfiViolation { expected, found } => format!(
                "CFI violation: return address {:#x} does not match shadow stack entry {:#x}",
                found, expected
            ),
            Fault::Overflow { op } => format!("signed integer overflow in {}", op),
            Fault::UninitRead { addr } => {
                format!("read of uninitialized stack memory at {:#x}", addr)
            }
            Fault::FfiDenied { name } => format!("foreign call to '{}' denied by policy", name),
            Fault::FfiUnknown { name } => format!("call to unknown foreign function '{}'", name),
            Fault::FfiArity {
                name,
                expected,
                got,
            } => format!(
                "foreign function '{}' expects {} argument(s), got {}",
                name, expected, got
            ),
            Fault::Abort { msg } => msg.clone(),
        }
    }
}

/// A fault bound to the program counter where it happened.
#[derive(Debug)]
pub struct VmError {
    pub fault: Fault,
    pub pc: usize,
    /// Function name and source position, when the image knows them.
    pub context: Option<String>,
}

impl VmError {
    pub fn new(fault: Fault, pc: usize) -> Self {
        VmError {
            fault,
            pc,
            context: None,
        }
    }

    pub fn with_image(mut self, image: &Image) -> Self {
        let mut parts = Vec::new();
        if let Some(f) = image.function_at(self.pc as u64) {
            parts.push(format!("in function '{}'", f.name));
        }
        if let Some(loc) = image.source_loc(self.pc) {
            if let Some(file) = image.files.get(loc.file_no as usize) {
                parts.push(format!("at {}:{}:{}", file.display_name, loc.line, loc.col));
            }
        }
        if !parts.is_empty() {
            self.context = Some(parts.join(" "));
        }
        self
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== CVM runtime fault ====")?;
        writeln!(f, "{}", self.fault.describe())?;
        match &self.context {
            Some(ctx) => write!(f, "  at text offset {:#x} {}", self.pc, ctx),
            None => write!(f, "  at text offset {:#x}", self.pc),
        }
    }
}

impl std::error::Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banners_name_the_fault() {
        let e = VmError::new(Fault::DoubleFree { addr: 0x8000_0040 }, 12);
        let text = e.to_string();
        assert!(text.contains("double free"), "{}", text);
        assert!(text.contains("0xc"), "{}", text);

        let e = VmError::new(
            Fault::CfiViolation {
                expected: 0x10,
                found: 0x20,
            },
            3,
        );
        assert!(e.to_string().contains("CFI violation"));
    }
}
