//! Built-in system headers.
//!
//! The headers the host library backs are embedded in the binary, so a
//! translation unit can `#include <stdio.h>` without any installed libc.
//! On-disk include paths are searched first, which lets a project shadow
//! any of these.

pub fn builtin_header(name: &str) -> Option<&'static str> {
    Some(match name {
        "stdio.h" => include_str!("../include/stdio.h"),
        "stdlib.h" => include_str!("../include/stdlib.h"),
        "string.h" => include_str!("../include/string.h"),
        "stdarg.h" => include_str!("../include/stdarg.h"),
        "stdbool.h" => include_str!("../include/stdbool.h"),
        "stddef.h" => include_str!("../include/stddef.h"),
        "stdint.h" => include_str!("../include/stdint.h"),
        "math.h" => include_str!("../include/math.h"),
        "assert.h" => include_str!("../include/assert.h"),
        "ctype.h" => include_str!("../include/ctype.h"),
        "errno.h" => include_str!("../include/errno.h"),
        "limits.h" => include_str!("../include/limits.h"),
        "setjmp.h" => include_str!("../include/setjmp.h"),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_headers_resolve() {
        for name in ["stdio.h", "stdlib.h", "string.h", "stdarg.h", "setjmp.h"] {
            assert!(builtin_header(name).is_some(), "{} missing", name);
        }
        assert!(builtin_header("nonexistent.h").is_none());
    }
}
