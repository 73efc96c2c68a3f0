//! CVM bytecode virtual machine.
//!
//! Executes program images produced by the compiler: a register file, a
//! segmented virtual address space (data, heap, stack; text addresses are
//! word indices), a first-fit coalescing heap, opt-in runtime sanitizers,
//! and a foreign-function bridge into host Rust closures.
//!
//! ```no_run
//! use cvm_runtime::{hostlib, Vm, VmOptions};
//! # let image = cvm_core::image::Image::default();
//! let mut vm = Vm::new(image, VmOptions::default());
//! hostlib::install(&mut vm);
//! let status = vm.run(&["prog".to_string()]).expect("run");
//! ```

pub mod error;
pub mod ffi;
pub mod heap;
pub mod hostlib;
pub mod io;
pub mod machine;
pub mod memory;
pub mod report;
pub mod sanitize;

pub use error::VmError;
pub use machine::{Vm, VmOptions};
