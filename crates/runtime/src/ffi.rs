//! Foreign function bridge.
//!
//! Host functions are Rust closures registered by name with an arity and a
//! float-return flag. A CALLF site carries the argument count and a
//! double-argument bitmask; the machine gathers integer arguments from
//! A0..A7 and float arguments from FA0..FA7 at the same indices and hands
//! them over. Variadic registrations may also be reached through numbered
//! wrapper names (`printf3` falls back to `printf`).
//!
//! The allow/deny policy gates every call at runtime; a denied call either
//! warns and yields zero or aborts the run, depending on the policy's
//! `fatal` flag.

use crate::error::Fault;
use crate::heap::Heap;
use crate::io::Io;
use crate::memory::Memory;
use cvm_core::isa::NUM_ARG_REGS;
use std::collections::HashMap;

/// What a host function sees of the machine.
pub struct VmContext<'a> {
    pub mem: &'a mut Memory,
    pub heap: &'a mut Heap,
    pub io: &'a mut Io,
    /// Setting this terminates the run with the given status.
    pub exit: &'a mut Option<i32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FfiArgs {
    pub ints: [i64; NUM_ARG_REGS],
    pub floats: [f64; NUM_ARG_REGS],
    pub nargs: usize,
    pub double_mask: u16,
}

impl FfiArgs {
    pub fn int(&self, i: usize) -> i64 {
        self.ints[i]
    }

    pub fn uint(&self, i: usize) -> u64 {
        self.ints[i] as u64
    }

    pub fn float(&self, i: usize) -> f64 {
        self.floats[i]
    }

    pub fn is_float(&self, i: usize) -> bool {
        self.double_mask & (1 << i) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FfiValue {
    Int(i64),
    Float(f64),
}

impl FfiValue {
    pub fn unit() -> Self {
        FfiValue::Int(0)
    }
}

pub type HostFn = Box<dyn FnMut(&mut VmContext<'_>, &FfiArgs) -> Result<FfiValue, Fault>>;

pub struct FfiEntry {
    pub handler: HostFn,
    pub arg_count: usize,
    pub variadic: bool,
    pub returns_float: bool,
}

#[derive(Default)]
pub struct FfiRegistry {
    entries: HashMap<String, FfiEntry>,
}

impl FfiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        arg_count: usize,
        returns_float: bool,
        handler: HostFn,
    ) {
        self.entries.insert(
            name.to_string(),
            FfiEntry {
                handler,
                arg_count,
                variadic: false,
                returns_float,
            },
        );
    }

    pub fn register_variadic(
        &mut self,
        name: &str,
        fixed_args: usize,
        returns_float: bool,
        handler: HostFn,
    ) {
        self.entries.insert(
            name.to_string(),
            FfiEntry {
                handler,
                arg_count: fixed_args,
                variadic: true,
                returns_float,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve_key(name).is_some()
    }

    /// Exact name first; a trailing-digit name falls back to its variadic
    /// base (`printf3` → `printf`).
    fn resolve_key<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.entries.contains_key(name) {
            return Some(name);
        }
        let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
        if base.len() < name.len() {
            if let Some(e) = self.entries.get(base) {
                if e.variadic {
                    return self
                        .entries
                        .get_key_value(base)
                        .map(|(k, _)| k.as_str());
                }
            }
        }
        None
    }

    pub fn call(
        &mut self,
        name: &str,
        ctx: &mut VmContext<'_>,
        args: &FfiArgs,
    ) -> Result<FfiValue, Fault> {
        let key = self
            .resolve_key(name)
            .ok_or_else(|| Fault::FfiUnknown {
                name: name.to_string(),
            })?
            .to_string();
        let entry = self.entries.get_mut(&key).unwrap();
        if entry.variadic {
            if args.nargs < entry.arg_count {
                return Err(Fault::FfiArity {
                    name: name.to_string(),
                    expected: entry.arg_count,
                    got: args.nargs,
                });
            }
        } else if args.nargs != entry.arg_count {
            return Err(Fault::FfiArity {
                name: name.to_string(),
                expected: entry.arg_count,
                got: args.nargs,
            });
        }
        (entry.handler)(ctx, args)
    }

    pub fn returns_float(&self, name: &str) -> bool {
        self.resolve_key(name)
            .and_then(|k| self.entries.get(k))
            .map(|e| e.returns_float)
            .unwrap_or(false)
    }
}

/// Runtime gate for foreign calls.
#[derive(Debug, Clone, Default)]
pub struct FfiPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub disable: bool,
    /// Denied calls abort instead of warning.
    pub fatal: bool,
}

impl FfiPolicy {
    pub fn permits(&self, name: &str) -> bool {
        if self.disable {
            return false;
        }
        if self.deny.iter().any(|d| d == name) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.iter().any(|a| a == name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_variadic_names_fall_back() {
        let mut reg = FfiRegistry::new();
        reg.register_variadic("printf", 1, false, Box::new(|_, _| Ok(FfiValue::Int(0))));
        reg.register("puts", 1, false, Box::new(|_, _| Ok(FfiValue::Int(0))));
        assert!(reg.contains("printf"));
        assert!(reg.contains("printf3"));
        assert!(!reg.contains("puts2"));
        assert!(!reg.contains("sprintf"));
    }

    #[test]
    fn policy_gates_calls() {
        let p = FfiPolicy {
            deny: vec!["system".into()],
            ..FfiPolicy::default()
        };
        assert!(p.permits("printf"));
        assert!(!p.permits("system"));

        let p = FfiPolicy {
            allow: vec!["puts".into()],
            ..FfiPolicy::default()
        };
        assert!(p.permits("puts"));
        assert!(!p.permits("printf"));

        let p = FfiPolicy {
            disable: true,
            ..FfiPolicy::default()
        };
        assert!(!p.permits("puts"));
    }
}
