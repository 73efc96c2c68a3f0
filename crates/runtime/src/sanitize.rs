//! Sanitizer state kept alongside the interpreter.
//!
//! The shadow return-address stack backs CFI, the per-slot init bitmap
//! backs uninitialized-read detection, and the poisoned-range list backs
//! stack-scope checking. Heap-side checks (canaries, quarantine, tags)
//! live in the heap allocator itself.

use crate::error::Fault;
use cvm_core::flags::SanitizerFlags;

/// Written above each frame's locals and verified on return.
pub const STACK_CANARY: u64 = 0x5AFE_C0DE_5AFE_C0DE_u64;

pub struct Sanitizers {
    pub flags: SanitizerFlags,
    shadow_stack: Vec<u64>,
    /// One bit per 8-byte stack slot: has it ever been written?
    init_bits: Vec<u8>,
    stack_base: u64,
    /// Stack ranges whose lexical scope has ended.
    dead_ranges: Vec<(u64, u64)>,
}

impl Sanitizers {
    pub fn new(flags: SanitizerFlags, stack_base: u64, stack_size: usize) -> Self {
        Sanitizers {
            flags,
            shadow_stack: Vec::new(),
            init_bits: vec![0; stack_size / 8 / 8 + 1],
            stack_base,
            dead_ranges: Vec::new(),
        }
    }

    // --- CFI shadow stack -------------------------------------------------

    pub fn push_return(&mut self, addr: u64) {
        if self.flags.cfi {
            self.shadow_stack.push(addr);
        }
    }

    /// Verify a popped return address against the shadow stack.
    pub fn check_return(&mut self, found: u64) -> Result<(), Fault> {
        if !self.flags.cfi {
            return Ok(());
        }
        match self.shadow_stack.pop() {
            Some(expected) if expected == found => Ok(()),
            Some(expected) => Err(Fault::CfiViolation { expected, found }),
            None => Err(Fault::CfiViolation {
                expected: 0,
                found,
            }),
        }
    }

    pub fn shadow_depth(&self) -> usize {
        self.shadow_stack.len()
    }

    /// Longjmp unwinds several frames at once.
    pub fn truncate_shadow(&mut self, depth: usize) {
        self.shadow_stack.truncate(depth);
    }

    // --- uninitialized-read tracking --------------------------------------

    fn slot_range(&self, addr: u64, size: u64) -> Option<(usize, usize)> {
        if addr < self.stack_base {
            return None;
        }
        let first = ((addr - self.stack_base) / 8) as usize;
        let last = ((addr + size.max(1) - 1 - self.stack_base) / 8) as usize;
        Some((first, last))
    }

    pub fn mark_init(&mut self, addr: u64, size: u64) {
        if !self.flags.uninit_detection {
            return;
        }
        let Some((first, last)) = self.slot_range(addr, size) else {
            return;
        };
        for slot in first..=last {
            if let Some(byte) = self.init_bits.get_mut(slot / 8) {
                *byte |= 1 << (slot % 8);
            }
        }
    }

    pub fn check_init(&self, addr: u64, size: u64) -> Result<(), Fault> {
        if !self.flags.uninit_detection {
            return Ok(());
        }
        let Some((first, last)) = self.slot_range(addr, size) else {
            return Ok(());
        };
        for slot in first..=last {
            let set = self
                .init_bits
                .get(slot / 8)
                .is_some_and(|b| b & (1 << (slot % 8)) != 0);
            if !set {
                return Err(Fault::UninitRead { addr });
            }
        }
        Ok(())
    }

    /// A returning frame's slots become untouched again.
    pub fn clear_init_range(&mut self, lo: u64, hi: u64) {
        if !self.flags.uninit_detection || hi <= lo {
            return;
        }
        if let Some((first, last)) = self.slot_range(lo, hi - lo) {
            for slot in first..=last {
                if let Some(byte) = self.init_bits.get_mut(slot / 8) {
                    *byte &= !(1 << (slot % 8));
                }
            }
        }
    }

    // --- stack-scope poisoning --------------------------------------------

    pub fn scope_out(&mut self, lo: u64, hi: u64) {
        if self.flags.stack_scope && hi > lo {
            self.dead_ranges.push((lo, hi));
        }
    }

    pub fn scope_in(&mut self, lo: u64, hi: u64) {
        self.dead_ranges.retain(|&(l, h)| !(l == lo && h == hi));
    }

    /// Frames at and below `sp` are gone; their poisons go with them.
    pub fn drop_scopes_below(&mut self, sp: u64) {
        self.dead_ranges.retain(|&(_, h)| h > sp);
    }

    pub fn check_scope(&self, addr: u64, size: u64) -> Result<(), Fault> {
        if !self.flags.stack_scope {
            return Ok(());
        }
        let end = addr + size.max(1);
        for &(lo, hi) in &self.dead_ranges {
            if addr < hi && end > lo {
                return Err(Fault::UseAfterScope { addr });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn san(flags: SanitizerFlags) -> Sanitizers {
        Sanitizers::new(flags, 0x1000, 0x1000)
    }

    #[test]
    fn cfi_catches_mismatched_return() {
        let mut s = san(SanitizerFlags {
            cfi: true,
            ..SanitizerFlags::none()
        });
        s.push_return(0x42);
        assert!(s.check_return(0x42).is_ok());
        s.push_return(0x42);
        assert!(matches!(
            s.check_return(0x99),
            Err(Fault::CfiViolation { .. })
        ));
    }

    #[test]
    fn uninit_reads_flag_only_untouched_slots() {
        let mut s = san(SanitizerFlags {
            uninit_detection: true,
            ..SanitizerFlags::none()
        });
        assert!(matches!(
            s.check_init(0x1100, 8),
            Err(Fault::UninitRead { .. })
        ));
        s.mark_init(0x1100, 8);
        assert!(s.check_init(0x1100, 8).is_ok());
        s.clear_init_range(0x1100, 0x1108);
        assert!(s.check_init(0x1100, 8).is_err());
    }

    #[test]
    fn scope_poison_hits_overlapping_accesses() {
        let mut s = san(SanitizerFlags {
            stack_scope: true,
            ..SanitizerFlags::none()
        });
        s.scope_out(0x1200, 0x1240);
        assert!(s.check_scope(0x1210, 8).is_err());
        assert!(s.check_scope(0x1240, 8).is_ok());
        s.scope_in(0x1200, 0x1240);
        assert!(s.check_scope(0x1210, 8).is_ok());
    }
}
