//! CVM compiler CLI.
//!
//! Compiles one or more C translation units, links them in-process, and by
//! default runs the result on the bytecode VM, exiting with the program's
//! exit status. `-E` stops after preprocessing, `--dump-bytecode` after
//! code generation.

use clap::Parser as ClapParser;
use cvm_core::diag::{Diagnostic, Severity};
use cvm_core::flags::SanitizerFlags;
use cvmc::config::{ConfigFile, Options};
use cvmc::error::CompileError;
use cvmc::token::print_tokens;
use cvmc::Compiler;
use cvm_runtime::ffi::FfiPolicy;
use cvm_runtime::{hostlib, Vm, VmOptions};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(name = "cvmc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "C11 compiler and bytecode virtual machine", long_about = None)]
struct Cli {
    /// Input C source files (several files are linked together)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Stop after preprocessing and print the token stream
    #[arg(short = 'E', long = "preprocess")]
    preprocess_only: bool,

    /// Print a disassembly of the generated bytecode and exit
    #[arg(long)]
    dump_bytecode: bool,

    /// Write -E / --dump-bytecode output to a file instead of stdout
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Add a directory to the include search path
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Predefine a macro (NAME or NAME=VALUE)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// Undefine a macro
    #[arg(short = 'U', value_name = "NAME")]
    undef: Vec<String>,

    /// Project configuration file (TOML) with default flags
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stop at the first compile error instead of collecting them
    #[arg(long)]
    no_error_recovery: bool,

    /// Disable the peephole pass
    #[arg(long)]
    no_optimize: bool,

    /// Build a source map and keep debug symbols
    #[arg(long)]
    enable_debugger: bool,

    // --- sanitizers ---
    /// Write and verify stack canaries on every call frame
    #[arg(long)]
    stack_canaries: bool,

    /// Guard words around every heap allocation
    #[arg(long)]
    heap_canaries: bool,

    /// Verify that dereferenced pointers hit live allocations
    #[arg(long)]
    bounds_checks: bool,

    /// Maintain a shadow return-address stack (control-flow integrity)
    #[arg(long)]
    cfi: bool,

    /// Generation-tag heap pointers and verify them on dereference
    #[arg(long)]
    memory_tagging: bool,

    /// Detect signed integer overflow
    #[arg(long)]
    overflow_checks: bool,

    /// Detect reads of never-written stack slots
    #[arg(long)]
    uninit_checks: bool,

    /// Quarantine freed memory and detect use-after-free
    #[arg(long)]
    uaf_checks: bool,

    /// Report never-freed allocations at exit
    #[arg(long)]
    leak_check: bool,

    /// Enable every sanitizer
    #[arg(long)]
    check_all: bool,

    // --- FFI policy ---
    /// Allow only these foreign functions at runtime
    #[arg(long, value_name = "NAME")]
    ffi_allow: Vec<String>,

    /// Deny these foreign functions at runtime
    #[arg(long, value_name = "NAME")]
    ffi_deny: Vec<String>,

    /// Block every foreign call
    #[arg(long)]
    disable_ffi: bool,

    /// Denied foreign calls warn instead of aborting
    #[arg(long)]
    ffi_warn_only: bool,

    /// Arguments passed to the program's main (after --)
    #[arg(last = true)]
    args: Vec<String>,
}

fn sanitizers_from(cli: &Cli) -> SanitizerFlags {
    if cli.check_all {
        return SanitizerFlags::all();
    }
    SanitizerFlags {
        stack_canaries: cli.stack_canaries,
        heap_canaries: cli.heap_canaries,
        bounds_checks: cli.bounds_checks,
        cfi: cli.cfi,
        memory_tagging: cli.memory_tagging,
        overflow_checks: cli.overflow_checks,
        uninit_detection: cli.uninit_checks,
        uaf_detection: cli.uaf_checks,
        leak_detection: cli.leak_check,
        stack_scope: false,
    }
}

fn report(cc: &Compiler, err: &CompileError) {
    let diags = cc.render_diagnostics();
    if !diags.is_empty() {
        eprint!("{}", diags);
    }
    if matches!(err, CompileError::Reported { .. }) {
        eprintln!("{}", err);
        return;
    }
    let diag = Diagnostic {
        severity: Severity::Error,
        message: err.message(),
        loc: err.loc(),
        expansion: Vec::new(),
    };
    eprint!("{}", diag.render(&cc.files));
}

fn write_output(path: Option<&PathBuf>, text: &str) -> Result<(), String> {
    match path {
        Some(p) => std::fs::write(p, text).map_err(|e| format!("{}: {}", p.display(), e)),
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut options = Options {
        include_paths: cli.include.clone(),
        defines: cli
            .define
            .iter()
            .map(|d| match d.split_once('=') {
                Some((n, v)) => (n.to_string(), v.to_string()),
                None => (d.clone(), "1".to_string()),
            })
            .collect(),
        undefines: cli.undef.clone(),
        sanitizers: sanitizers_from(&cli),
        collect_errors: !cli.no_error_recovery,
        enable_debugger: cli.enable_debugger,
        optimize: !cli.no_optimize,
        ffi_allow: cli.ffi_allow.clone(),
        ffi_deny: cli.ffi_deny.clone(),
        disable_ffi: cli.disable_ffi,
        ffi_fatal: !cli.ffi_warn_only,
    };
    if let Some(path) = &cli.config {
        match ConfigFile::load(path) {
            Ok(cfg) => cfg.apply(&mut options),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let sanitizers = options.sanitizers;
    let mut cc = Compiler::with_options(options);

    if cli.preprocess_only {
        let mut out = String::new();
        for input in &cli.inputs {
            match cc.preprocess_file(input) {
                Ok(tokens) => out.push_str(&print_tokens(&tokens)),
                Err(e) => {
                    report(&cc, &e);
                    return ExitCode::FAILURE;
                }
            }
        }
        if let Err(e) = write_output(cli.output.as_ref(), &out) {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    // Compile every unit, then link, then generate code.
    let mut units = Vec::new();
    for input in &cli.inputs {
        let unit = cc
            .preprocess_file(input)
            .and_then(|tokens| cc.parse(tokens));
        match unit {
            Ok(u) => units.push(u),
            Err(e) => {
                report(&cc, &e);
                return ExitCode::FAILURE;
            }
        }
    }
    if cc.diags.has_errors() {
        let err = CompileError::Reported {
            count: cc.diags.error_count(),
        };
        report(&cc, &err);
        return ExitCode::FAILURE;
    }
    let image = match cc.link(units).and_then(|prog| cc.codegen(&prog)) {
        Ok(image) => image,
        Err(e) => {
            report(&cc, &e);
            return ExitCode::FAILURE;
        }
    };
    // Warnings still print on success.
    let rendered = cc.render_diagnostics();
    if !rendered.is_empty() {
        eprint!("{}", rendered);
    }

    if cli.dump_bytecode {
        let text = cvm_core::isa::disassemble(&image.text);
        if let Err(e) = write_output(cli.output.as_ref(), &text) {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    // Execute.
    let vm_options = VmOptions {
        sanitizers,
        ffi: FfiPolicy {
            allow: cli.ffi_allow.clone(),
            deny: cli.ffi_deny.clone(),
            disable: cli.disable_ffi,
            fatal: !cli.ffi_warn_only,
        },
        ..VmOptions::default()
    };
    let mut vm = Vm::new(image, vm_options);
    hostlib::install(&mut vm);

    let mut argv: Vec<String> = vec![cli.inputs[0].display().to_string()];
    argv.extend(cli.args.iter().cloned());
    match vm.run(&argv) {
        Ok(status) => ExitCode::from((status & 0xff) as u8),
        Err(fault) => {
            eprintln!("{}", fault);
            ExitCode::FAILURE
        }
    }
}
