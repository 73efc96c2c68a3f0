//! Sanitizer soundness: with a flag on, each planted misuse is caught;
//! with flags off, well-behaved programs run clean.

mod common;

use common::{run_sanitized, run_status};
use cvm_core::flags::SanitizerFlags;

fn flags(f: impl Fn(&mut SanitizerFlags)) -> SanitizerFlags {
    let mut s = SanitizerFlags::none();
    f(&mut s);
    s
}

// --- detections ---------------------------------------------------------

#[test]
fn double_free_aborts() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            int *p = malloc(16);
            free(p);
            free(p);
            return 0;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.heap_canaries = true)).unwrap_err();
    assert!(err.contains("double free"), "{}", err);
}

#[test]
fn heap_canary_catches_overflow() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            char *p = malloc(8);
            for (int i = 0; i < 12; i++) p[i] = 'A';
            free(p);
            return 0;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.heap_canaries = true)).unwrap_err();
    assert!(err.contains("heap canary"), "{}", err);
}

#[test]
fn stack_canary_catches_frame_smash() {
    let src = r#"
        int main(void) {
            char buf[8];
            for (int i = 0; i < 16; i++) buf[i] = 'X';
            return 0;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.stack_canaries = true)).unwrap_err();
    assert!(err.contains("stack canary"), "{}", err);
}

#[test]
fn bounds_check_catches_heap_overrun() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            int *p = malloc(2 * sizeof(int));
            p[4] = 1;
            return 0;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.bounds_checks = true)).unwrap_err();
    assert!(err.contains("out-of-bounds"), "{}", err);
}

#[test]
fn use_after_free_is_quarantined() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            int *p = malloc(8);
            *p = 1;
            free(p);
            return *p;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.uaf_detection = true)).unwrap_err();
    assert!(err.contains("use after free"), "{}", err);
}

#[test]
fn memory_tagging_catches_stale_pointer() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            int *old = malloc(8);
            free(old);
            int *fresh = malloc(8);   /* reuses the block, new generation */
            *fresh = 7;
            return *old;              /* stale tag */
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.memory_tagging = true)).unwrap_err();
    assert!(err.contains("tag mismatch"), "{}", err);
}

#[test]
fn cfi_catches_return_address_overwrite() {
    let src = r#"
        int victim(void) {
            long x = 0;
            long *p = &x;
            p[3] = 0x41;   /* x sits at bp-16; bp+8 holds the return address */
            return (int)x;
        }
        int main(void) { return victim(); }
    "#;
    let err = run_sanitized(src, flags(|s| s.cfi = true)).unwrap_err();
    assert!(err.contains("CFI violation"), "{}", err);
}

#[test]
fn overflow_check_catches_signed_wrap() {
    let src = r#"
        #include <limits.h>
        int main(void) {
            long x = LONG_MAX;
            long y = x + 1;
            return (int)y;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.overflow_checks = true)).unwrap_err();
    assert!(err.contains("overflow"), "{}", err);
}

#[test]
fn uninitialized_read_is_detected() {
    let src = r#"
        int main(void) {
            int x;
            int y = x;
            return y;
        }
    "#;
    let err = run_sanitized(src, flags(|s| s.uninit_detection = true)).unwrap_err();
    assert!(err.contains("uninitialized"), "{}", err);
}

#[test]
fn leak_report_lists_unfreed_blocks() {
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            malloc(24);
            void *p = malloc(8);
            free(p);
            return 0;
        }
    "#;
    let r = run_sanitized(src, flags(|s| s.leak_detection = true)).unwrap();
    assert_eq!(r.status, 0);
    assert!(r.stderr.contains("leak report"), "{}", r.stderr);
    assert!(r.stderr.contains("24 byte"), "{}", r.stderr);
}

#[test]
fn division_by_zero_always_faults() {
    let src = "int main(void){ int z = 0; return 1 / z; }";
    let err = run_sanitized(src, SanitizerFlags::none()).unwrap_err();
    assert!(err.contains("division by zero"), "{}", err);
}

// --- no false positives -------------------------------------------------

const WELL_BEHAVED: &str = r#"
    #include <stdlib.h>
    #include <string.h>
    int sum(int *v, int n) {
        int t = 0;
        for (int i = 0; i < n; i++) t += v[i];
        return t;
    }
    int main(void) {
        int local[4] = { 1, 2, 3, 4 };
        int *heap = malloc(4 * sizeof(int));
        memcpy(heap, local, sizeof(local));
        int t = sum(heap, 4) + sum(local, 4);
        free(heap);
        return t;   /* 20 */
    }
"#;

#[test]
fn clean_program_passes_each_sanitizer() {
    let all = [
        flags(|s| s.stack_canaries = true),
        flags(|s| s.heap_canaries = true),
        flags(|s| s.bounds_checks = true),
        flags(|s| s.cfi = true),
        flags(|s| s.memory_tagging = true),
        flags(|s| s.overflow_checks = true),
        flags(|s| s.uninit_detection = true),
        flags(|s| s.uaf_detection = true),
        flags(|s| s.leak_detection = true),
    ];
    for (i, f) in all.into_iter().enumerate() {
        let r = run_sanitized(WELL_BEHAVED, f)
            .unwrap_or_else(|e| panic!("sanitizer #{} false positive: {}", i, e));
        assert_eq!(r.status, 20, "sanitizer #{}", i);
    }
}

#[test]
fn clean_program_passes_all_sanitizers_together() {
    let mut all = SanitizerFlags::all();
    all.stack_scope = false; // scope instrumentation is not emitted
    let r = run_sanitized(WELL_BEHAVED, all).expect("no sanitizer may fire");
    assert_eq!(r.status, 20);
}

#[test]
fn recursion_is_clean_under_cfi_and_canaries() {
    let src = r#"
        int fib(int n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
        int main(void) { return fib(12); }
    "#;
    let f = flags(|s| {
        s.cfi = true;
        s.stack_canaries = true;
    });
    let r = run_sanitized(src, f).expect("clean recursion");
    assert_eq!(r.status, 144);
}

#[test]
fn sanitizers_do_not_change_results() {
    // The same program computes the same value with checks on and off.
    let src = r#"
        #include <stdlib.h>
        int main(void) {
            int *p = malloc(3 * sizeof(int));
            p[0] = 11; p[1] = 13; p[2] = 18;
            int t = p[0] + p[1] + p[2];
            free(p);
            return t;
        }
    "#;
    assert_eq!(run_status(src), 42);
    let f = flags(|s| {
        s.bounds_checks = true;
        s.heap_canaries = true;
        s.memory_tagging = true;
    });
    assert_eq!(run_sanitized(src, f).unwrap().status, 42);
}

#[test]
fn ffi_deny_policy_blocks_calls() {
    use cvm_runtime::ffi::FfiPolicy;
    use cvm_runtime::{hostlib, Vm, VmOptions};

    let src = "#include <stdio.h>\nint main(void){ puts(\"hi\"); return 0; }";
    let image = common::compile(src);
    let options = VmOptions {
        ffi: FfiPolicy {
            deny: vec!["puts".to_string()],
            fatal: true,
            ..FfiPolicy::default()
        },
        ..VmOptions::default()
    };
    let mut vm = Vm::new(image, options);
    hostlib::install(&mut vm);
    let err = vm.run(&["t".to_string()]).unwrap_err();
    assert!(err.to_string().contains("denied"), "{}", err);
}

#[test]
fn ffi_deny_warns_when_not_fatal() {
    use cvm_runtime::ffi::FfiPolicy;
    use cvm_runtime::{hostlib, Vm, VmOptions};

    let src = "#include <stdio.h>\nint main(void){ puts(\"hi\"); return 7; }";
    let image = common::compile(src);
    let options = VmOptions {
        ffi: FfiPolicy {
            deny: vec!["puts".to_string()],
            fatal: false,
            ..FfiPolicy::default()
        },
        ..VmOptions::default()
    };
    let mut vm = Vm::new(image, options);
    hostlib::install(&mut vm);
    let err_buf = vm.capture_stderr();
    let out_buf = vm.capture_stdout();
    let status = vm.run(&["t".to_string()]).expect("warns, not faults");
    assert_eq!(status, 7);
    let stderr = String::from_utf8_lossy(&err_buf.borrow()).into_owned();
    assert!(stderr.contains("denied"), "{}", stderr);
    assert!(out_buf.borrow().is_empty());
}

#[test]
fn disable_ffi_blocks_everything() {
    use cvm_runtime::ffi::FfiPolicy;
    use cvm_runtime::{hostlib, Vm, VmOptions};

    let src = "#include <stdlib.h>\nint main(void){ return malloc(8) != 0; }";
    let image = common::compile(src);
    let options = VmOptions {
        ffi: FfiPolicy {
            disable: true,
            fatal: true,
            ..FfiPolicy::default()
        },
        ..VmOptions::default()
    };
    let mut vm = Vm::new(image, options);
    hostlib::install(&mut vm);
    assert!(vm.run(&["t".to_string()]).is_err());
}
