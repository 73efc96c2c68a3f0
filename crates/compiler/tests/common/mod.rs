//! Shared pipeline harness: compile C source in-process, run it on the VM,
//! capture the exit status and output.
#![allow(dead_code)]

use cvm_core::flags::SanitizerFlags;
use cvm_core::image::Image;
use cvm_runtime::ffi::FfiPolicy;
use cvm_runtime::{hostlib, Vm, VmOptions};
use cvmc::config::Options;
use cvmc::Compiler;

pub fn compile_with(src: &str, options: Options) -> Image {
    let mut cc = Compiler::with_options(options);
    match cc.compile_source("test.c", src) {
        Ok(image) => image,
        Err(e) => panic!(
            "compile failed: {}\n{}",
            e,
            cc.render_diagnostics()
        ),
    }
}

pub fn compile(src: &str) -> Image {
    compile_with(src, Options::default())
}

#[derive(Debug)]
pub struct RunResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub fn run_image(
    image: Image,
    sanitizers: SanitizerFlags,
    argv: &[&str],
) -> Result<RunResult, String> {
    let options = VmOptions {
        sanitizers,
        ffi: FfiPolicy {
            fatal: true,
            ..FfiPolicy::default()
        },
        ..VmOptions::default()
    };
    let mut vm = Vm::new(image, options);
    hostlib::install(&mut vm);
    let out = vm.capture_stdout();
    let err = vm.capture_stderr();
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    let argv = if argv.is_empty() {
        vec!["test".to_string()]
    } else {
        argv
    };
    match vm.run(&argv) {
        Ok(status) => Ok(RunResult {
            status,
            stdout: String::from_utf8_lossy(&out.borrow()).into_owned(),
            stderr: String::from_utf8_lossy(&err.borrow()).into_owned(),
        }),
        Err(fault) => Err(fault.to_string()),
    }
}

/// Compile and run with default settings; panic on any failure.
pub fn run(src: &str) -> RunResult {
    run_image(compile(src), SanitizerFlags::none(), &[]).expect("program faulted")
}

pub fn run_status(src: &str) -> i32 {
    run(src).status
}

/// Compile with the given sanitizers and run with the same set.
pub fn run_sanitized(src: &str, sanitizers: SanitizerFlags) -> Result<RunResult, String> {
    let options = Options {
        sanitizers,
        ..Options::default()
    };
    run_image(compile_with(src, options), sanitizers, &[])
}

/// Compile several translation units, link them, and run.
pub fn run_units(srcs: &[&str]) -> RunResult {
    let mut cc = Compiler::new();
    let mut units = Vec::new();
    for (i, src) in srcs.iter().enumerate() {
        let tokens = cc
            .preprocess_source(&format!("unit{}.c", i), src)
            .expect("preprocess");
        units.push(cc.parse(tokens).expect("parse"));
    }
    assert!(
        !cc.diags.has_errors(),
        "unexpected diagnostics:\n{}",
        cc.render_diagnostics()
    );
    let prog = cc.link(units).expect("link");
    let image = cc.codegen(&prog).expect("codegen");
    run_image(image, SanitizerFlags::none(), &[]).expect("program faulted")
}
