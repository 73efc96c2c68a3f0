//! Include resolution against real files: search paths, guards,
//! #pragma once, #include_next, #embed.

mod common;

use common::run_image;
use cvm_core::flags::SanitizerFlags;
use cvmc::config::Options;
use cvmc::Compiler;
use std::fs;

fn run_with_dir(src: &str, dir: &std::path::Path) -> i32 {
    let options = Options {
        include_paths: vec![dir.to_path_buf()],
        ..Options::default()
    };
    let mut cc = Compiler::with_options(options);
    let image = match cc.compile_source("main.c", src) {
        Ok(i) => i,
        Err(e) => panic!("compile failed: {}\n{}", e, cc.render_diagnostics()),
    };
    run_image(image, SanitizerFlags::none(), &[])
        .expect("program faulted")
        .status
}

#[test]
fn quoted_and_angled_includes_resolve() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("value.h"), "#define VALUE 40\n").unwrap();
    fs::write(
        dir.path().join("lib.h"),
        "#include \"value.h\"\nstatic int lib(void) { return VALUE; }\n",
    )
    .unwrap();
    let src = "#include <lib.h>\nint main(void){ return lib() + 2; }";
    assert_eq!(run_with_dir(src, dir.path()), 42);
}

#[test]
fn include_guards_allow_repeated_inclusion() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("guarded.h"),
        "#ifndef GUARDED_H\n#define GUARDED_H\nint twice = 2;\n#endif\n",
    )
    .unwrap();
    let src = r#"
        #include <guarded.h>
        #include <guarded.h>
        int main(void) { return twice * 21; }
    "#;
    assert_eq!(run_with_dir(src, dir.path()), 42);
}

#[test]
fn pragma_once_prevents_reinclusion() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("once.h"),
        "#pragma once\nint counter_slot = 1;\n",
    )
    .unwrap();
    let src = r#"
        #include <once.h>
        #include <once.h>
        #include <once.h>
        int main(void) { return counter_slot * 42; }
    "#;
    assert_eq!(run_with_dir(src, dir.path()), 42);
}

#[test]
fn builtin_headers_can_be_shadowed() {
    // A real file on the search path wins over the embedded header.
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("limits.h"), "#define SHADOWED 42\n").unwrap();
    let src = "#include <limits.h>\nint main(void){ return SHADOWED; }";
    assert_eq!(run_with_dir(src, dir.path()), 42);
}

#[test]
fn embed_inserts_bytes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("blob.bin"), [10u8, 20, 30, 40]).unwrap();
    let src = r#"
        unsigned char data[] = {
        #embed <blob.bin>
        };
        int main(void) { return data[0] + data[3] - sizeof(data); }
    "#;
    // 10 + 40 - 4
    assert_eq!(run_with_dir(src, dir.path()), 46);
}

#[test]
fn embed_limit_and_if_empty() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("blob.bin"), [1u8, 2, 3, 4, 5, 6]).unwrap();
    fs::write(dir.path().join("empty.bin"), []).unwrap();
    let src = r#"
        unsigned char capped[] = {
        #embed <blob.bin> limit(2)
        };
        unsigned char fallback[] = {
        #embed <empty.bin> if_empty(9, 9, 9)
        };
        int main(void) { return sizeof(capped) * 10 + sizeof(fallback); }
    "#;
    assert_eq!(run_with_dir(src, dir.path()), 23);
}

#[test]
fn embed_prefix_suffix() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b.bin"), [7u8]).unwrap();
    let src = r#"
        unsigned char data[] = {
        #embed <b.bin> prefix(1, ) suffix(, 2)
        };
        int main(void) { return data[0] * 100 + data[1] * 10 + data[2]; }
    "#;
    assert_eq!(run_with_dir(src, dir.path()), 172);
}

#[test]
fn include_next_resumes_search() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    // The wrapper in the first directory defers to the one in the second.
    fs::write(
        first.path().join("layer.h"),
        "#include_next <layer.h>\n#define WRAPPED (BASE + 2)\n",
    )
    .unwrap();
    fs::write(second.path().join("layer.h"), "#define BASE 40\n").unwrap();
    let options = Options {
        include_paths: vec![first.path().to_path_buf(), second.path().to_path_buf()],
        ..Options::default()
    };
    let mut cc = Compiler::with_options(options);
    let src = "#include <layer.h>\nint main(void){ return WRAPPED; }";
    let image = cc
        .compile_source("main.c", src)
        .unwrap_or_else(|e| panic!("{}\n{}", e, cc.render_diagnostics()));
    let status = run_image(image, SanitizerFlags::none(), &[])
        .expect("run")
        .status;
    assert_eq!(status, 42);
}
