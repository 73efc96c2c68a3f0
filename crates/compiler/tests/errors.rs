//! Diagnostics: error collection, cascade suppression, fatal paths.

mod common;

use cvmc::config::Options;
use cvmc::error::CompileError;
use cvmc::Compiler;

fn collect_errors(src: &str) -> (usize, String) {
    let mut cc = Compiler::new();
    let result = cc.compile_source("test.c", src);
    match result {
        Err(CompileError::Reported { count }) => (count, cc.render_diagnostics()),
        Err(e) => panic!("expected collected diagnostics, got fatal error: {}", e),
        Ok(_) => panic!("expected errors, program compiled"),
    }
}

#[test]
fn n_independent_errors_produce_n_diagnostics() {
    let src = r#"
        int main(void) {
            int a = undefined_one;
            int b = undefined_two;
            int c = undefined_three;
            return a + b + c;
        }
    "#;
    let (count, rendered) = collect_errors(src);
    assert_eq!(count, 3, "diagnostics:\n{}", rendered);
    assert!(rendered.contains("undefined_one"));
    assert!(rendered.contains("undefined_three"));
}

#[test]
fn broken_operand_does_not_cascade() {
    // The undefined variable is diagnosed once; every expression built on
    // top of it stays quiet.
    let src = r#"
        int main(void) {
            int x = missing + 5;
            int y = x * 2 + missing2;
            return y;
        }
    "#;
    let (count, rendered) = collect_errors(src);
    assert_eq!(count, 2, "diagnostics:\n{}", rendered);
}

#[test]
fn statement_resynchronization_recovers() {
    // A mangled statement must not swallow the rest of the function.
    let src = r#"
        int main(void) {
            int a = 1 +;
            int b = also_missing;
            return a + b;
        }
    "#;
    let (count, _) = collect_errors(src);
    assert_eq!(count, 2);
}

#[test]
fn type_errors_are_recoverable() {
    let src = r#"
        struct S { int x; };
        int main(void) {
            struct S s;
            int a = s.nonexistent;
            int b = bad_name;
            return a + b;
        }
    "#;
    let (count, rendered) = collect_errors(src);
    assert_eq!(count, 2, "diagnostics:\n{}", rendered);
    assert!(rendered.contains("nonexistent"));
}

#[test]
fn const_assignment_is_diagnosed() {
    let src = r#"
        int main(void) {
            const int x = 1;
            x = 2;
            return x;
        }
    "#;
    let (count, rendered) = collect_errors(src);
    assert_eq!(count, 1);
    assert!(rendered.contains("read-only"), "{}", rendered);
}

#[test]
fn void_pointer_deref_is_diagnosed() {
    let src = r#"
        int main(void) {
            void *p = 0;
            return *p;
        }
    "#;
    let (count, rendered) = collect_errors(src);
    assert_eq!(count, 1);
    assert!(rendered.contains("void pointer"), "{}", rendered);
}

#[test]
fn first_error_is_fatal_without_recovery() {
    let options = Options {
        collect_errors: false,
        ..Options::default()
    };
    let mut cc = Compiler::with_options(options);
    let err = cc
        .compile_source("test.c", "int main(void){ return missing; }")
        .unwrap_err();
    assert!(matches!(err, CompileError::Parse { .. }));
    assert!(err.to_string().contains("missing"));
}

#[test]
fn diagnostics_carry_caret_and_position() {
    let mut cc = Compiler::new();
    let _ = cc.compile_source("demo.c", "int main(void){\n  return oops;\n}\n");
    let rendered = cc.render_diagnostics();
    assert!(rendered.contains("demo.c:2:"), "{}", rendered);
    assert!(rendered.contains("  return oops;"), "{}", rendered);
    assert!(rendered.contains("^"), "{}", rendered);
}

#[test]
fn macro_expansion_chain_is_reported() {
    let mut cc = Compiler::new();
    let src = "#define USE(x) (x + missing_inside)\nint main(void){ return USE(1); }\n";
    let _ = cc.compile_source("m.c", src);
    let rendered = cc.render_diagnostics();
    assert!(
        rendered.contains("in expansion of macro 'USE'"),
        "{}",
        rendered
    );
}

#[test]
fn undefined_label_is_a_link_error() {
    let mut cc = Compiler::new();
    let err = cc
        .compile_source("test.c", "int main(void){ goto nowhere; return 0; }")
        .unwrap_err();
    assert!(matches!(err, CompileError::Link { .. }));
    assert!(err.to_string().contains("nowhere"));
}

#[test]
fn undefined_global_reference_is_a_link_error() {
    let mut cc = Compiler::new();
    let err = cc
        .compile_source(
            "test.c",
            "extern int missing_global; int main(void){ return missing_global; }",
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::Link { .. }));
    assert!(err.to_string().contains("missing_global"));
}

#[test]
fn missing_main_is_a_link_error() {
    let mut cc = Compiler::new();
    let err = cc
        .compile_source("test.c", "int helper(void){ return 1; }")
        .unwrap_err();
    assert!(err.to_string().contains("main"));
}

#[test]
fn static_assert_failure_reports() {
    let mut cc = Compiler::new();
    let err = cc
        .compile_source("test.c", "_Static_assert(1 == 2, \"sizes\");\nint main(void){return 0;}")
        .unwrap_err();
    assert!(err.to_string().contains("static assertion"), "{}", err);
}

#[test]
fn stray_break_is_diagnosed() {
    let (count, rendered) = collect_errors("int main(void){ break; return 0; }");
    assert_eq!(count, 1);
    assert!(rendered.contains("break"), "{}", rendered);
}

#[test]
fn unknown_foreign_function_faults_at_runtime() {
    // Calling an undefined function compiles (it may be a host function)
    // and faults only when no host registration exists.
    let src = "int mystery(int); int main(void){ return mystery(1); }";
    let image = common::compile(src);
    let err = common::run_image(image, cvm_core::flags::SanitizerFlags::none(), &[]).unwrap_err();
    assert!(err.contains("mystery"), "{}", err);
}
