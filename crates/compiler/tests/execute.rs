//! End-to-end: compile C source, run it on the VM, check the result.

mod common;

use common::{compile, run, run_image, run_status, run_units};
use cvm_core::flags::SanitizerFlags;

// --- the canonical scenarios -------------------------------------------

#[test]
fn ternary_chains() {
    let src = "int main(){int a=1?10:20;int b=0?10:20;return a+b==30?42:0;}";
    assert_eq!(run_status(src), 42);
}

#[test]
fn struct_by_value_return() {
    let src = r#"
        struct P { int x, y; };
        struct P mk() { struct P p; p.x = 20; p.y = 22; return p; }
        int main() { struct P p = mk(); return p.x + p.y; }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn variadic_printf_writes_stdout() {
    let src = "#include <stdio.h>\nint main(){printf(\"%d\\n\",42);return 0;}";
    let r = run(src);
    assert_eq!(r.status, 0);
    assert_eq!(r.stdout, "42\n");
}

#[test]
fn variable_length_array() {
    let src = r#"
        int main() {
            int n = 5;
            int a[n];
            for (int i = 0; i < n; i++) a[i] = i * 10;
            return a[0] + a[1] + a[2] + a[3] + a[4] - 58;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

// --- expressions --------------------------------------------------------

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run_status("int main(){return 2+3*4;}"), 14);
    assert_eq!(run_status("int main(){return (2+3)*4;}"), 20);
    assert_eq!(run_status("int main(){return 7/2 + 7%2;}"), 4);
    assert_eq!(run_status("int main(){return 1<<4 | 2;}"), 18);
    assert_eq!(run_status("int main(){return (5 & 3) ^ 1;}"), 0);
    assert_eq!(run_status("int main(){return -(-42);}"), 42);
    assert_eq!(run_status("int main(){return ~0 & 255;}"), 255);
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(run_status("int main(){return (1<2) + (2<=2) + (3>2) + (2>=3);}"), 3);
    assert_eq!(run_status("int main(){return (1==1) + (1!=1);}"), 1);
    assert_eq!(run_status("int main(){return !0 + !5;}"), 1);
    assert_eq!(run_status("int main(){return 1 && 2;}"), 1);
    assert_eq!(run_status("int main(){return 0 || 3 ? 7 : 8;}"), 7);
}

#[test]
fn short_circuit_skips_side_effects() {
    let src = r#"
        int hits = 0;
        int bump() { hits++; return 1; }
        int main() {
            0 && bump();
            1 || bump();
            1 && bump();
            return hits;
        }
    "#;
    assert_eq!(run_status(src), 1);
}

#[test]
fn unsigned_semantics() {
    assert_eq!(
        run_status("int main(){unsigned int a = 0u - 1u; return a > 2147483647u;}"),
        1
    );
    assert_eq!(
        run_status("int main(){unsigned long a = 0xffffffffffffffffUL; return a / 2 > 0x7fffffffffffff00UL;}"),
        1
    );
    assert_eq!(
        run_status("int main(){int a = -8; unsigned int b = 2; return a / (int)b == -4;}"),
        1
    );
}

#[test]
fn integer_width_truncation() {
    assert_eq!(
        run_status("int main(){char c = 300; return c;}"),
        300 % 256
    );
    assert_eq!(
        run_status("int main(){short s = -1; return s == -1;}"),
        1
    );
    assert_eq!(
        run_status("int main(){long x = 0x1234567890L; int y = x; return y == 0x34567890;}"),
        1
    );
    assert_eq!(
        run_status("int main(){int x = 2147483647; x = x + 1; return x == -2147483648 ? 1 : 0;}"),
        1
    );
}

#[test]
fn compound_assignment_and_incdec() {
    let src = r#"
        int main() {
            int x = 10;
            x += 5; x -= 3; x *= 2; x /= 4; x %= 5;
            x <<= 3; x >>= 1; x |= 9; x &= 13; x ^= 2;
            int y = x++;
            int z = ++x;
            return y + z + x--;
        }
    "#;
    // x: 10,15,12,24,6,1,8,4,13,13,15 → y=15(x→16), z=17(x=17), x-- yields 17
    assert_eq!(run_status(src), 15 + 17 + 17);
}

#[test]
fn comma_and_conditional_lvalues() {
    assert_eq!(run_status("int main(){int a=(1,2,3); return a;}"), 3);
    assert_eq!(run_status("int main(){int a = 5 ?: 9; return a;}"), 5);
}

// --- pointers and arrays ------------------------------------------------

#[test]
fn pointers_and_arithmetic() {
    let src = r#"
        int main() {
            int a[4];
            a[0] = 1; a[1] = 2; a[2] = 3; a[3] = 4;
            int *p = a;
            p = p + 2;
            int d = p - a;
            return *p * 10 + d;   /* 32 */
        }
    "#;
    assert_eq!(run_status(src), 32);
}

#[test]
fn multidimensional_arrays() {
    let src = r#"
        int main() {
            int m[3][4];
            for (int i = 0; i < 3; i++)
                for (int j = 0; j < 4; j++)
                    m[i][j] = i * 4 + j;
            return m[2][3];
        }
    "#;
    assert_eq!(run_status(src), 11);
}

#[test]
fn address_of_and_deref() {
    let src = r#"
        void set(int *p, int v) { *p = v; }
        int main() { int x = 0; set(&x, 42); return x; }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn string_literals_index() {
    assert_eq!(run_status("int main(){char *s = \"ABC\"; return s[1];}"), 66);
    assert_eq!(run_status("int main(){return \"hello\"[4];}"), 'o' as i32);
    assert_eq!(run_status("int main(){char s[] = \"hi\"; return sizeof(s);}"), 3);
    // Wide string elements are ints.
    assert_eq!(run_status("int main(){return L\"AB\"[1];}"), 66);
}

#[test]
fn function_pointers() {
    let src = r#"
        int add(int a, int b) { return a + b; }
        int sub(int a, int b) { return a - b; }
        int main() {
            int (*f)(int, int) = add;
            int (*ops[2])(int, int); ops[0] = add; ops[1] = sub;
            return f(40, 2) + ops[1](10, 10);
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn global_function_pointer_table() {
    let src = r#"
        int one(void) { return 1; }
        int two(void) { return 2; }
        int (*table[2])(void) = { one, two };
        int main() { return table[0]() + table[1]() * 10; }
    "#;
    assert_eq!(run_status(src), 21);
}

// --- control flow -------------------------------------------------------

#[test]
fn loops_break_continue() {
    let src = r#"
        int main() {
            int sum = 0;
            for (int i = 0; i < 100; i++) {
                if (i % 2) continue;
                if (i >= 20) break;
                sum += i;
            }
            int j = 0;
            while (j < 3) j++;
            int k = 0;
            do { k++; } while (k < 5);
            return sum + j + k;   /* 90 + 3 + 5 */
        }
    "#;
    assert_eq!(run_status(src), 98);
}

#[test]
fn switch_with_fallthrough_and_ranges() {
    let src = r#"
        int classify(int x) {
            int y = 0;
            switch (x) {
            case 1: y += 1;
            case 2: y += 2; break;
            case 5 ... 7: y = 50; break;
            default: y = 9;
            }
            return y;
        }
        int main() {
            return classify(1) * 100 + classify(2) * 10 + classify(6) + classify(99) / 9;
        }
    "#;
    // classify(1)=3, classify(2)=2, classify(6)=50, classify(99)=9
    assert_eq!(run_status(src), 3 * 100 + 2 * 10 + 50 + 1);
}

#[test]
fn nested_switch_preserves_outer_state() {
    let src = r#"
        int main() {
            int r = 0;
            switch (1) {
            case 1:
                switch (2) {
                case 2: r += 40; break;
                default: r += 7;
                }
                r += 2;
                break;
            default: r = 9;
            }
            return r;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn goto_and_labels() {
    let src = r#"
        int main() {
            int x = 0;
        again:
            x++;
            if (x < 5) goto again;
            goto done;
            x = 100;
        done:
            return x;
        }
    "#;
    assert_eq!(run_status(src), 5);
}

#[test]
fn computed_goto() {
    let src = r#"
        int main() {
            void *t[2] = { &&a, &&b };
            int i = 1;
            goto *t[i];
        a: return 1;
        b: return 42;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn recursion() {
    let src = r#"
        int fib(int n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
        int main() { return fib(10); }
    "#;
    assert_eq!(run_status(src), 55);
}

// --- aggregates ---------------------------------------------------------

#[test]
fn structs_nested_and_arrow() {
    let src = r#"
        struct Inner { int a, b; };
        struct Outer { struct Inner in; int c; };
        int main() {
            struct Outer o;
            struct Outer *p = &o;
            p->in.a = 30; p->in.b = 10; p->c = 2;
            struct Outer copy = o;
            return copy.in.a + copy.in.b + copy.c;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn struct_by_value_argument() {
    let src = r#"
        struct P { int x, y; };
        int total(struct P p) { p.x += 100; return p.x + p.y; }
        int main() {
            struct P p; p.x = 1; p.y = 2;
            int t = total(p);
            /* the callee's mutation does not leak back */
            return t == 103 && p.x == 1 ? 42 : 0;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn unions_share_storage() {
    let src = r#"
        union U { int i; unsigned char b[4]; };
        int main() {
            union U u;
            u.i = 0x01020304;
            return u.b[0] + u.b[3];   /* little-endian: 4 + 1 */
        }
    "#;
    assert_eq!(run_status(src), 5);
}

#[test]
fn bitfields_pack_and_sign_extend() {
    let src = r#"
        struct F { unsigned a : 3; unsigned b : 5; int c : 4; };
        int main() {
            struct F f;
            f.a = 5; f.b = 17; f.c = -3;
            return f.a + f.b + (f.c == -3 ? 20 : 0);
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn anonymous_members_resolve() {
    let src = r#"
        struct S { union { int x; unsigned u; }; int z; };
        int main() { struct S s; s.x = 40; s.z = 2; return s.x + s.z; }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn enums_and_typedefs() {
    let src = r#"
        typedef enum { RED, GREEN = 40, BLUE } Color;
        typedef int myint;
        int main() { Color c = BLUE; myint x = 1; return c + x; }
    "#;
    assert_eq!(run_status(src), 42);
}

// --- initializers -------------------------------------------------------

#[test]
fn local_initializers_with_designators() {
    let src = r#"
        struct P { int x, y, z; };
        int main() {
            int a[5] = { 1, [3] = 30, 2 };
            struct P p = { .y = 20, .z = 2 };
            int b[] = { 1, 2, 3 };
            return a[0] + a[3] + a[4] + p.y + p.z + sizeof(b) / sizeof(b[0]);
        }
    "#;
    // 1 + 30 + 2 + 20 + 2 + 3
    assert_eq!(run_status(src), 58);
}

#[test]
fn global_initializers() {
    let src = r#"
        int g = 40;
        int arr[4] = { 1, 2, 3, 4 };
        char msg[] = "hey";
        char *ptr = msg + 1;
        struct P { int a; int b; } gp = { .b = 7 };
        int main() {
            return g + arr[1] + (msg[0] == 'h') + (ptr[0] == 'e') + gp.b * 0 + gp.a;
        }
    "#;
    assert_eq!(run_status(src), 44);
}

#[test]
fn compound_literals() {
    let src = r#"
        struct P { int x, y; };
        int main() {
            struct P p = (struct P){ 40, 2 };
            int *q = (int[]){ 5, 6, 7 };
            return p.x + p.y + q[1] - 6;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn statement_expressions() {
    let src = r#"
        int main() {
            int x = ({ int t = 40; t + 2; });
            return x;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn generic_selection() {
    let src = r#"
        int main() {
            int i = _Generic(1, int: 40, double: 1, default: 2);
            int d = _Generic(1.5, int: 1, double: 2, default: 3);
            return i + d;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

// --- floating point -----------------------------------------------------

#[test]
fn float_arithmetic_and_compare() {
    let src = r#"
        int main() {
            double a = 1.5, b = 2.25;
            float f = 0.5f;
            if (a + b != 3.75) return 1;
            if (a * 2.0 <= 2.9) return 2;
            if ((double)f != 0.5) return 3;
            int i = (int)(a + b);   /* 3 */
            double back = i;        /* 3.0 */
            return back == 3.0 ? 42 : 4;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn float_parameters_and_returns() {
    let src = r#"
        double scale(double x, double k) { return x * k; }
        int main() { return (int)scale(10.5, 4.0); }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn printf_float_formats() {
    let src = r#"
        #include <stdio.h>
        int main() {
            printf("%.2f %g %d\n", 3.14159, 0.5, 7);
            return 0;
        }
    "#;
    assert_eq!(run(src).stdout, "3.14 0.5 7\n");
}

#[test]
fn global_float_initializers() {
    let src = r#"
        double half = 0.5;
        float quarter = 0.25f;
        int main() { return (int)((half + quarter) * 4.0); }
    "#;
    assert_eq!(run_status(src), 3);
}

// --- the host library ---------------------------------------------------

#[test]
fn malloc_free_and_strings() {
    let src = r#"
        #include <stdlib.h>
        #include <string.h>
        int main() {
            char *p = malloc(16);
            strcpy(p, "answer");
            int n = strlen(p);
            int c = strcmp(p, "answer");
            free(p);
            return n * 7 + c;   /* 6*7 + 0 */
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn sprintf_and_snprintf() {
    let src = r#"
        #include <stdio.h>
        #include <string.h>
        int main() {
            char buf[32];
            sprintf(buf, "%s=%d", "x", 42);
            if (strcmp(buf, "x=42") != 0) return 1;
            char small[4];
            int full = snprintf(small, 4, "%d", 123456);
            return strcmp(small, "123") == 0 ? full : 2;
        }
    "#;
    assert_eq!(run_status(src), 6);
}

#[test]
fn memcpy_memset_memcmp() {
    let src = r#"
        #include <string.h>
        int main() {
            char a[8], b[8];
            memset(a, 7, 8);
            memcpy(b, a, 8);
            return memcmp(a, b, 8) == 0 ? a[5] * 6 : 1;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn math_functions() {
    let src = r#"
        #include <math.h>
        int main() {
            double r = sqrt(16.0) + pow(2.0, 5.0) + floor(2.9) + fabs(-4.0);
            return (int)r;   /* 4 + 32 + 2 + 4 */
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn ctype_and_conversions() {
    let src = r#"
        #include <ctype.h>
        #include <stdlib.h>
        int main() {
            if (!isdigit('7') || isalpha('7')) return 1;
            if (toupper('a') != 'A') return 2;
            return atoi("40") + (int)strtol("2", 0, 10);
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn exit_stops_immediately() {
    let src = r#"
        #include <stdlib.h>
        int main() { exit(42); return 7; }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn assert_failure_aborts() {
    let src = r#"
        #include <assert.h>
        int main() { assert(1 == 2); return 0; }
    "#;
    let err = run_image(compile(src), SanitizerFlags::none(), &[]).unwrap_err();
    assert!(err.contains("assertion failed"), "{}", err);
}

// --- varargs, setjmp, alloca -------------------------------------------

#[test]
fn user_variadic_function() {
    let src = r#"
        #include <stdarg.h>
        int sum(int n, ...) {
            va_list ap;
            va_start(ap, n);
            int total = 0;
            for (int i = 0; i < n; i++)
                total += va_arg(ap, int);
            va_end(ap);
            return total;
        }
        int main() { return sum(4, 10, 11, 12, 9); }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn variadic_doubles_funnel_through() {
    let src = r#"
        #include <stdarg.h>
        int isum(int n, ...) {
            va_list ap;
            va_start(ap, n);
            double total = 0;
            for (int i = 0; i < n; i++)
                total += va_arg(ap, double);
            va_end(ap);
            return (int)total;
        }
        int main() { return isum(2, 40.5, 1.5); }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn setjmp_longjmp() {
    let src = r#"
        #include <setjmp.h>
        jmp_buf env;
        void jump(void) { longjmp(env, 42); }
        int main() {
            int v = setjmp(env);
            if (v) return v;
            jump();
            return 1;
        }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn alloca_gives_usable_memory() {
    let src = r#"
        #include <stdlib.h>
        int main() {
            int *p = alloca(4 * sizeof(int));
            for (int i = 0; i < 4; i++) p[i] = i;
            return p[0] + p[1] + p[2] + p[3];
        }
    "#;
    assert_eq!(run_status(src), 6);
}

// --- program arguments --------------------------------------------------

#[test]
fn argc_argv_reach_main() {
    let src = "int main(int argc, char **argv){ return argc * 10 + argv[1][0] - 'a'; }";
    let r = run_image(compile(src), SanitizerFlags::none(), &["prog", "b"]).unwrap();
    assert_eq!(r.status, 21);
}

// --- linking ------------------------------------------------------------

#[test]
fn two_translation_units_link() {
    let a = r#"
        extern int shared;
        int helper(void);
        int main() { return helper() + shared; }
    "#;
    let b = r#"
        int shared = 2;
        int helper(void) { return 40; }
    "#;
    assert_eq!(run_units(&[a, b]).status, 42);
}

#[test]
fn sizeof_and_alignof() {
    let src = r#"
        struct S { char c; int i; };
        int main() {
            _Static_assert(sizeof(int) == 4, "int is 4 bytes");
            return sizeof(struct S) + sizeof(long) + _Alignof(double);
        }
    "#;
    assert_eq!(run_status(src), 8 + 8 + 8);
}

#[test]
fn static_locals_persist() {
    let src = r#"
        int next(void) { static int n = 39; n += 1; return n; }
        int main() { next(); next(); return next(); }
    "#;
    assert_eq!(run_status(src), 42);
}

#[test]
fn const_locals_initialize() {
    let src = "int main(){ const int x = 42; return x; }";
    assert_eq!(run_status(src), 42);
}

#[test]
fn dump_bytecode_is_well_formed() {
    let image = compile("int main(){return 2+2;}");
    let text = cvm_core::isa::disassemble(&image.text);
    assert!(text.contains("ENT3"), "{}", text);
    assert!(text.contains("LEV3"), "{}", text);
    // Every CALL/JMP target resolved: no placeholder words survive.
    assert!(!image.text.contains(&i64::MIN));
}
