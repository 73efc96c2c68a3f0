//! Shared foundation for the CVM C compiler and bytecode virtual machine.
//!
//! Everything both halves of the system need lives here:
//!
//! - [`isa`]: the instruction set. Opcodes, register names, operand word
//!   packing, and a disassembler. The compiler encodes against it, the VM
//!   decodes against it, and neither ever sees the other's internals.
//! - [`image`]: the compiled program image (text and data segments, symbol
//!   table, FFI call-site names, source map) handed from compiler to VM.
//! - [`arena`]: typed index arenas. Self-referential types (a struct holding
//!   a pointer to itself) are cycles of ids into an arena, never ownership
//!   cycles.
//! - [`source`] and [`diag`]: source files with positions, and diagnostics
//!   rendered with a caret under the offending token.

pub mod arena;
pub mod diag;
pub mod flags;
pub mod image;
pub mod isa;
pub mod source;
