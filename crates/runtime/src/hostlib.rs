//! Default host library.
//!
//! The C standard library functions the built-in headers declare, written
//! against guest memory: the printf family with its own formatter,
//! string and memory routines, allocation on the guest heap, character
//! classification, math, and process control. `install` registers the
//! whole set on a fresh VM.

use crate::error::Fault;
use crate::ffi::{FfiArgs, FfiValue, VmContext};
use crate::io::{STDIN_HANDLE, STDOUT_HANDLE};
use crate::machine::Vm;
use crate::memory::Memory;
use std::cell::Cell;
use std::rc::Rc;

// --- varargs sources ----------------------------------------------------

/// Where the formatter pulls its arguments from: the A registers of a
/// CALLF, or guest memory through a `va_list`.
enum VaSource<'a> {
    Regs { args: &'a FfiArgs, pos: usize },
    Mem { mem: &'a Memory, ap: u64 },
}

impl VaSource<'_> {
    fn next_int(&mut self) -> i64 {
        match self {
            VaSource::Regs { args, pos } => {
                let v = if *pos < args.nargs { args.int(*pos) } else { 0 };
                *pos += 1;
                v
            }
            VaSource::Mem { mem, ap } => {
                let v = mem.read_int(*ap, 8, true).unwrap_or(0);
                *ap = ap.wrapping_sub(8);
                v
            }
        }
    }

    fn next_float(&mut self) -> f64 {
        match self {
            VaSource::Regs { args, pos } => {
                let v = if *pos < args.nargs && args.is_float(*pos) {
                    args.float(*pos)
                } else if *pos < args.nargs {
                    // Doubles funneled through integer registers.
                    f64::from_bits(args.uint(*pos))
                } else {
                    0.0
                };
                *pos += 1;
                v
            }
            VaSource::Mem { mem, ap } => {
                let v = mem.read_f64(*ap).unwrap_or(0.0);
                *ap = ap.wrapping_sub(8);
                v
            }
        }
    }
}

// --- formatter ----------------------------------------------------------

#[derive(Default, Clone, Copy)]
struct Spec {
    minus: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
}

fn pad(spec: &Spec, body: String, numeric: bool) -> String {
    if body.len() >= spec.width {
        return body;
    }
    let fill = spec.width - body.len();
    if spec.minus {
        let mut s = body;
        s.push_str(&" ".repeat(fill));
        s
    } else if spec.zero && numeric && spec.precision.is_none() {
        // Zero padding goes after any sign.
        let (sign, digits) = match body.chars().next() {
            Some(c @ ('-' | '+' | ' ')) => (Some(c), &body[1..]),
            _ => (None, body.as_str()),
        };
        let mut s = String::new();
        if let Some(c) = sign {
            s.push(c);
        }
        s.push_str(&"0".repeat(fill));
        s.push_str(digits);
        s
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn format_signed(spec: &Spec, v: i64) -> String {
    let mut body = v.abs().to_string();
    if v == i64::MIN {
        body = (v as i128).unsigned_abs().to_string();
    }
    if let Some(p) = spec.precision {
        while body.len() < p {
            body.insert(0, '0');
        }
    }
    if v < 0 {
        body.insert(0, '-');
    } else if spec.plus {
        body.insert(0, '+');
    } else if spec.space {
        body.insert(0, ' ');
    }
    pad(spec, body, true)
}

fn format_unsigned(spec: &Spec, v: u64, radix: u32, upper: bool) -> String {
    let mut body = match radix {
        8 => format!("{:o}", v),
        16 => {
            if upper {
                format!("{:X}", v)
            } else {
                format!("{:x}", v)
            }
        }
        _ => v.to_string(),
    };
    if let Some(p) = spec.precision {
        while body.len() < p {
            body.insert(0, '0');
        }
    }
    if spec.alt && radix == 16 && v != 0 {
        body.insert_str(0, if upper { "0X" } else { "0x" });
    }
    if spec.alt && radix == 8 && !body.starts_with('0') {
        body.insert(0, '0');
    }
    pad(spec, body, true)
}

fn format_float(spec: &Spec, v: f64, conv: char) -> String {
    let prec = spec.precision.unwrap_or(6);
    let mut body = match conv {
        'e' | 'E' => {
            let s = format!("{:.*e}", prec, v);
            // Rust renders `1.5e2`; C wants `1.500000e+02`.
            match s.split_once('e') {
                Some((m, e)) => {
                    let exp: i32 = e.parse().unwrap_or(0);
                    format!("{}e{}{:02}", m, if exp < 0 { '-' } else { '+' }, exp.abs())
                }
                None => s,
            }
        }
        'g' | 'G' => {
            let p = if prec == 0 { 1 } else { prec };
            let exp = if v == 0.0 {
                0
            } else {
                v.abs().log10().floor() as i32
            };
            if exp < -4 || exp >= p as i32 {
                let s = format!("{:.*e}", p.saturating_sub(1), v);
                match s.split_once('e') {
                    Some((m, e)) => {
                        let m = m.trim_end_matches('0').trim_end_matches('.');
                        let expn: i32 = e.parse().unwrap_or(0);
                        format!(
                            "{}e{}{:02}",
                            m,
                            if expn < 0 { '-' } else { '+' },
                            expn.abs()
                        )
                    }
                    None => s,
                }
            } else {
                let decimals = (p as i32 - 1 - exp).max(0) as usize;
                let s = format!("{:.*}", decimals, v);
                if s.contains('.') {
                    s.trim_end_matches('0').trim_end_matches('.').to_string()
                } else {
                    s
                }
            }
        }
        _ => format!("{:.*}", prec, v),
    };
    if conv == 'E' || conv == 'G' {
        body = body.to_uppercase();
    }
    if v >= 0.0 {
        if spec.plus {
            body.insert(0, '+');
        } else if spec.space {
            body.insert(0, ' ');
        }
    }
    pad(spec, body, true)
}

/// C printf-style formatting against guest memory.
fn format_guest(mem: &Memory, fmt: &[u8], src: &mut VaSource<'_>) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < fmt.len() {
        let c = fmt[i];
        if c != b'%' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            break;
        }
        if fmt[i] == b'%' {
            out.push(b'%');
            i += 1;
            continue;
        }
        let mut spec = Spec::default();
        // Flags.
        while i < fmt.len() {
            match fmt[i] {
                b'-' => spec.minus = true,
                b'0' => spec.zero = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alt = true,
                _ => break,
            }
            i += 1;
        }
        // Width.
        if i < fmt.len() && fmt[i] == b'*' {
            spec.width = src.next_int().max(0) as usize;
            i += 1;
        } else {
            while i < fmt.len() && fmt[i].is_ascii_digit() {
                spec.width = spec.width * 10 + (fmt[i] - b'0') as usize;
                i += 1;
            }
        }
        // Precision.
        if i < fmt.len() && fmt[i] == b'.' {
            i += 1;
            if i < fmt.len() && fmt[i] == b'*' {
                spec.precision = Some(src.next_int().max(0) as usize);
                i += 1;
            } else {
                let mut p = 0;
                while i < fmt.len() && fmt[i].is_ascii_digit() {
                    p = p * 10 + (fmt[i] - b'0') as usize;
                    i += 1;
                }
                spec.precision = Some(p);
            }
        }
        // Length modifiers change nothing: everything is 64-bit already.
        while i < fmt.len() && matches!(fmt[i], b'l' | b'h' | b'z' | b't' | b'L' | b'j') {
            i += 1;
        }
        if i >= fmt.len() {
            break;
        }
        let conv = fmt[i] as char;
        i += 1;
        let piece = match conv {
            'd' | 'i' => format_signed(&spec, src.next_int()),
            'u' => format_unsigned(&spec, src.next_int() as u64, 10, false),
            'o' => format_unsigned(&spec, src.next_int() as u64, 8, false),
            'x' => format_unsigned(&spec, src.next_int() as u64, 16, false),
            'X' => format_unsigned(&spec, src.next_int() as u64, 16, true),
            'p' => format!("0x{:x}", src.next_int() as u64),
            'c' => {
                let b = src.next_int() as u8;
                pad(&spec, (b as char).to_string(), false)
            }
            's' => {
                let ptr = src.next_int() as u64;
                let s = if ptr == 0 {
                    b"(null)".to_vec()
                } else {
                    mem.read_cstr(cvm_core::isa::strip_tag(ptr)).unwrap_or_default()
                };
                let mut s = String::from_utf8_lossy(&s).into_owned();
                if let Some(p) = spec.precision {
                    s.truncate(p);
                }
                pad(&spec, s, false)
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => format_float(&spec, src.next_float(), conv),
            other => format!("%{}", other),
        };
        out.extend_from_slice(piece.as_bytes());
    }
    out
}

// --- registration -------------------------------------------------------

fn cstr(ctx: &VmContext<'_>, ptr: i64) -> Result<Vec<u8>, Fault> {
    ctx.mem.read_cstr(cvm_core::isa::strip_tag(ptr as u64))
}

fn addr(ptr: i64) -> u64 {
    cvm_core::isa::strip_tag(ptr as u64)
}

/// Register the default host library on a VM.
pub fn install(vm: &mut Vm) {
    // --- printf family ---
    vm.register_variadic(
        "printf",
        1,
        false,
        Box::new(|ctx, args| {
            let fmt = cstr(ctx, args.int(0))?;
            let mut src = VaSource::Regs { args, pos: 1 };
            let out = format_guest(ctx.mem, &fmt, &mut src);
            let n = ctx.io.write_stream(STDOUT_HANDLE, &out);
            Ok(FfiValue::Int(n))
        }),
    );
    vm.register_variadic(
        "fprintf",
        2,
        false,
        Box::new(|ctx, args| {
            let handle = args.int(0) as u64;
            let fmt = cstr(ctx, args.int(1))?;
            let mut src = VaSource::Regs { args, pos: 2 };
            let out = format_guest(ctx.mem, &fmt, &mut src);
            let n = ctx.io.write_stream(handle, &out);
            Ok(FfiValue::Int(n))
        }),
    );
    vm.register_variadic(
        "sprintf",
        2,
        false,
        Box::new(|ctx, args| {
            let buf = addr(args.int(0));
            let fmt = cstr(ctx, args.int(1))?;
            let mut src = VaSource::Regs { args, pos: 2 };
            let mut out = format_guest(ctx.mem, &fmt, &mut src);
            out.push(0);
            ctx.mem.write_bytes(buf, &out)?;
            Ok(FfiValue::Int(out.len() as i64 - 1))
        }),
    );
    vm.register_variadic(
        "snprintf",
        3,
        false,
        Box::new(|ctx, args| {
            let buf = addr(args.int(0));
            let cap = args.int(1).max(0) as usize;
            let fmt = cstr(ctx, args.int(2))?;
            let mut src = VaSource::Regs { args, pos: 3 };
            let out = format_guest(ctx.mem, &fmt, &mut src);
            let full = out.len() as i64;
            if cap > 0 {
                let n = out.len().min(cap - 1);
                ctx.mem.write_bytes(buf, &out[..n])?;
                ctx.mem.write_int(buf + n as u64, 1, 0)?;
            }
            Ok(FfiValue::Int(full))
        }),
    );
    vm.register(
        "vprintf",
        2,
        false,
        Box::new(|ctx, args| {
            let fmt = cstr(ctx, args.int(0))?;
            let ap = addr(args.int(1));
            let mut src = VaSource::Mem { mem: ctx.mem, ap };
            let out = format_guest(ctx.mem, &fmt, &mut src);
            let n = ctx.io.write_stream(STDOUT_HANDLE, &out);
            Ok(FfiValue::Int(n))
        }),
    );

    // --- basic character and line I/O ---
    vm.register(
        "puts",
        1,
        false,
        Box::new(|ctx, args| {
            let mut s = cstr(ctx, args.int(0))?;
            s.push(b'\n');
            ctx.io.write_stream(STDOUT_HANDLE, &s);
            Ok(FfiValue::Int(0))
        }),
    );
    vm.register(
        "putchar",
        1,
        false,
        Box::new(|ctx, args| {
            let c = args.int(0) as u8;
            ctx.io.write_stream(STDOUT_HANDLE, &[c]);
            Ok(FfiValue::Int(c as i64))
        }),
    );
    vm.register(
        "getchar",
        0,
        false,
        Box::new(|ctx, _| Ok(FfiValue::Int(ctx.io.read_byte(STDIN_HANDLE)))),
    );
    vm.register(
        "fputc",
        2,
        false,
        Box::new(|ctx, args| {
            let c = args.int(0) as u8;
            let n = ctx.io.write_stream(args.int(1) as u64, &[c]);
            Ok(FfiValue::Int(if n == 1 { c as i64 } else { -1 }))
        }),
    );
    vm.register(
        "fgetc",
        1,
        false,
        Box::new(|ctx, args| Ok(FfiValue::Int(ctx.io.read_byte(args.int(0) as u64)))),
    );
    vm.register(
        "fputs",
        2,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            let n = ctx.io.write_stream(args.int(1) as u64, &s);
            Ok(FfiValue::Int(if n < 0 { -1 } else { 0 }))
        }),
    );
    vm.register(
        "fgets",
        3,
        false,
        Box::new(|ctx, args| {
            let buf = addr(args.int(0));
            let size = args.int(1).max(0) as usize;
            let handle = args.int(2) as u64;
            if size == 0 {
                return Ok(FfiValue::Int(0));
            }
            let mut out = Vec::new();
            while out.len() < size - 1 {
                match ctx.io.read_stream(handle, 1) {
                    Some(b) if b.len() == 1 => {
                        out.push(b[0]);
                        if b[0] == b'\n' {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            if out.is_empty() {
                return Ok(FfiValue::Int(0));
            }
            out.push(0);
            ctx.mem.write_bytes(buf, &out)?;
            Ok(FfiValue::Int(buf as i64))
        }),
    );

    // --- files ---
    vm.register(
        "fopen",
        2,
        false,
        Box::new(|ctx, args| {
            let path = String::from_utf8_lossy(&cstr(ctx, args.int(0))?).into_owned();
            let mode = String::from_utf8_lossy(&cstr(ctx, args.int(1))?).into_owned();
            Ok(FfiValue::Int(ctx.io.open(&path, &mode) as i64))
        }),
    );
    vm.register(
        "fclose",
        1,
        false,
        Box::new(|ctx, args| Ok(FfiValue::Int(ctx.io.close(args.int(0) as u64)))),
    );
    vm.register("fflush", 1, false, Box::new(|_, _| Ok(FfiValue::Int(0))));
    vm.register(
        "fread",
        4,
        false,
        Box::new(|ctx, args| {
            let ptr = addr(args.int(0));
            let size = args.int(1).max(0) as usize;
            let nmemb = args.int(2).max(0) as usize;
            let handle = args.int(3) as u64;
            let total = size.saturating_mul(nmemb);
            match ctx.io.read_stream(handle, total) {
                Some(bytes) => {
                    ctx.mem.write_bytes(ptr, &bytes)?;
                    Ok(FfiValue::Int(
                        if size == 0 { 0 } else { bytes.len() / size } as i64,
                    ))
                }
                None => Ok(FfiValue::Int(0)),
            }
        }),
    );
    vm.register(
        "fwrite",
        4,
        false,
        Box::new(|ctx, args| {
            let ptr = addr(args.int(0));
            let size = args.int(1).max(0) as usize;
            let nmemb = args.int(2).max(0) as usize;
            let handle = args.int(3) as u64;
            let total = size.saturating_mul(nmemb);
            let bytes = ctx.mem.read_bytes(ptr, total)?;
            let n = ctx.io.write_stream(handle, &bytes);
            Ok(FfiValue::Int(if size == 0 || n < 0 {
                0
            } else {
                n / size as i64
            }))
        }),
    );
    vm.register(
        "fseek",
        3,
        false,
        Box::new(|ctx, args| {
            Ok(FfiValue::Int(ctx.io.seek(
                args.int(0) as u64,
                args.int(1),
                args.int(2),
            )))
        }),
    );
    vm.register(
        "ftell",
        1,
        false,
        Box::new(|ctx, args| Ok(FfiValue::Int(ctx.io.tell(args.int(0) as u64)))),
    );
    vm.register(
        "remove",
        1,
        false,
        Box::new(|ctx, args| {
            let path = String::from_utf8_lossy(&cstr(ctx, args.int(0))?).into_owned();
            Ok(FfiValue::Int(match std::fs::remove_file(path) {
                Ok(()) => 0,
                Err(_) => -1,
            }))
        }),
    );

    // --- allocation ---
    vm.register(
        "malloc",
        1,
        false,
        Box::new(|ctx, args| {
            match ctx.heap.alloc(&mut ctx.mem.heap, args.int(0).max(0) as u64) {
                Ok(p) => Ok(FfiValue::Int(p as i64)),
                Err(Fault::OutOfMemory { .. }) => Ok(FfiValue::Int(0)),
                Err(e) => Err(e),
            }
        }),
    );
    vm.register(
        "calloc",
        2,
        false,
        Box::new(|ctx, args| {
            let n = args.int(0).max(0) as u64;
            let m = args.int(1).max(0) as u64;
            let Some(total) = n.checked_mul(m) else {
                return Ok(FfiValue::Int(0));
            };
            match ctx.heap.alloc(&mut ctx.mem.heap, total) {
                Ok(p) => {
                    let zeros = vec![0u8; total as usize];
                    ctx.mem.write_bytes(addr(p as i64), &zeros)?;
                    Ok(FfiValue::Int(p as i64))
                }
                Err(Fault::OutOfMemory { .. }) => Ok(FfiValue::Int(0)),
                Err(e) => Err(e),
            }
        }),
    );
    vm.register(
        "realloc",
        2,
        false,
        Box::new(|ctx, args| {
            let old = args.int(0);
            let size = args.int(1).max(0) as u64;
            if old == 0 {
                return match ctx.heap.alloc(&mut ctx.mem.heap, size) {
                    Ok(p) => Ok(FfiValue::Int(p as i64)),
                    Err(Fault::OutOfMemory { .. }) => Ok(FfiValue::Int(0)),
                    Err(e) => Err(e),
                };
            }
            if size == 0 {
                ctx.heap.free(&mut ctx.mem.heap, old as u64)?;
                return Ok(FfiValue::Int(0));
            }
            let old_size = ctx.heap.payload_size(old as u64).unwrap_or(0);
            let new = match ctx.heap.alloc(&mut ctx.mem.heap, size) {
                Ok(p) => p,
                Err(Fault::OutOfMemory { .. }) => return Ok(FfiValue::Int(0)),
                Err(e) => return Err(e),
            };
            let n = old_size.min(size) as usize;
            if n > 0 {
                ctx.mem.copy(addr(new as i64), addr(old), n)?;
            }
            ctx.heap.free(&mut ctx.mem.heap, old as u64)?;
            Ok(FfiValue::Int(new as i64))
        }),
    );
    vm.register(
        "free",
        1,
        false,
        Box::new(|ctx, args| {
            let p = args.int(0);
            if p != 0 {
                ctx.heap.free(&mut ctx.mem.heap, p as u64)?;
            }
            Ok(FfiValue::Int(0))
        }),
    );

    // --- memory and strings ---
    vm.register(
        "memcpy",
        3,
        false,
        Box::new(|ctx, args| {
            ctx.mem
                .copy(addr(args.int(0)), addr(args.int(1)), args.int(2).max(0) as usize)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "memmove",
        3,
        false,
        Box::new(|ctx, args| {
            ctx.mem
                .copy(addr(args.int(0)), addr(args.int(1)), args.int(2).max(0) as usize)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "memset",
        3,
        false,
        Box::new(|ctx, args| {
            let bytes = vec![args.int(1) as u8; args.int(2).max(0) as usize];
            ctx.mem.write_bytes(addr(args.int(0)), &bytes)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "memcmp",
        3,
        false,
        Box::new(|ctx, args| {
            let n = args.int(2).max(0) as usize;
            let a = ctx.mem.read_bytes(addr(args.int(0)), n)?;
            let b = ctx.mem.read_bytes(addr(args.int(1)), n)?;
            Ok(FfiValue::Int(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }))
        }),
    );
    vm.register(
        "strlen",
        1,
        false,
        Box::new(|ctx, args| Ok(FfiValue::Int(cstr(ctx, args.int(0))?.len() as i64))),
    );
    vm.register(
        "strcpy",
        2,
        false,
        Box::new(|ctx, args| {
            let mut s = cstr(ctx, args.int(1))?;
            s.push(0);
            ctx.mem.write_bytes(addr(args.int(0)), &s)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "strncpy",
        3,
        false,
        Box::new(|ctx, args| {
            let n = args.int(2).max(0) as usize;
            let mut s = cstr(ctx, args.int(1))?;
            s.truncate(n);
            while s.len() < n {
                s.push(0);
            }
            ctx.mem.write_bytes(addr(args.int(0)), &s)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "strcat",
        2,
        false,
        Box::new(|ctx, args| {
            let dest = cstr(ctx, args.int(0))?;
            let mut src = cstr(ctx, args.int(1))?;
            src.push(0);
            ctx.mem
                .write_bytes(addr(args.int(0)) + dest.len() as u64, &src)?;
            Ok(FfiValue::Int(args.int(0)))
        }),
    );
    vm.register(
        "strcmp",
        2,
        false,
        Box::new(|ctx, args| {
            let a = cstr(ctx, args.int(0))?;
            let b = cstr(ctx, args.int(1))?;
            Ok(FfiValue::Int(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }))
        }),
    );
    vm.register(
        "strncmp",
        3,
        false,
        Box::new(|ctx, args| {
            let n = args.int(2).max(0) as usize;
            let mut a = cstr(ctx, args.int(0))?;
            let mut b = cstr(ctx, args.int(1))?;
            a.truncate(n);
            b.truncate(n);
            Ok(FfiValue::Int(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }))
        }),
    );
    vm.register(
        "strchr",
        2,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            let c = args.int(1) as u8;
            if c == 0 {
                return Ok(FfiValue::Int(args.int(0) + s.len() as i64));
            }
            Ok(FfiValue::Int(
                s.iter()
                    .position(|&b| b == c)
                    .map(|i| args.int(0) + i as i64)
                    .unwrap_or(0),
            ))
        }),
    );
    vm.register(
        "strrchr",
        2,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            let c = args.int(1) as u8;
            Ok(FfiValue::Int(
                s.iter()
                    .rposition(|&b| b == c)
                    .map(|i| args.int(0) + i as i64)
                    .unwrap_or(0),
            ))
        }),
    );
    vm.register(
        "strstr",
        2,
        false,
        Box::new(|ctx, args| {
            let hay = cstr(ctx, args.int(0))?;
            let needle = cstr(ctx, args.int(1))?;
            if needle.is_empty() {
                return Ok(FfiValue::Int(args.int(0)));
            }
            Ok(FfiValue::Int(
                hay.windows(needle.len())
                    .position(|w| w == needle)
                    .map(|i| args.int(0) + i as i64)
                    .unwrap_or(0),
            ))
        }),
    );
    vm.register(
        "strdup",
        1,
        false,
        Box::new(|ctx, args| {
            let mut s = cstr(ctx, args.int(0))?;
            s.push(0);
            match ctx.heap.alloc(&mut ctx.mem.heap, s.len() as u64) {
                Ok(p) => {
                    ctx.mem.write_bytes(addr(p as i64), &s)?;
                    Ok(FfiValue::Int(p as i64))
                }
                Err(Fault::OutOfMemory { .. }) => Ok(FfiValue::Int(0)),
                Err(e) => Err(e),
            }
        }),
    );

    // --- conversions and misc ---
    vm.register(
        "abs",
        1,
        false,
        Box::new(|_, args| Ok(FfiValue::Int((args.int(0) as i32).wrapping_abs() as i64))),
    );
    vm.register(
        "labs",
        1,
        false,
        Box::new(|_, args| Ok(FfiValue::Int(args.int(0).wrapping_abs()))),
    );
    vm.register(
        "atoi",
        1,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            Ok(FfiValue::Int(parse_long(&s, 10).0))
        }),
    );
    vm.register(
        "atol",
        1,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            Ok(FfiValue::Int(parse_long(&s, 10).0))
        }),
    );
    vm.register(
        "atof",
        1,
        false,
        Box::new(|ctx, args| {
            let s = String::from_utf8_lossy(&cstr(ctx, args.int(0))?).into_owned();
            Ok(FfiValue::Float(s.trim().parse().unwrap_or(0.0)))
        }),
    );
    vm.register(
        "strtol",
        3,
        false,
        Box::new(|ctx, args| {
            let s = cstr(ctx, args.int(0))?;
            let base = args.int(2) as u32;
            let (v, used) = parse_long(&s, base);
            let endp = addr(args.int(1));
            if endp != 0 {
                ctx.mem
                    .write_int(endp, 8, args.int(0) + used as i64)?;
            }
            Ok(FfiValue::Int(v))
        }),
    );
    {
        let state = Rc::new(Cell::new(0x2545_F491_4F6C_DD1Du64));
        let s1 = state.clone();
        vm.register(
            "rand",
            0,
            false,
            Box::new(move |_, _| {
                let mut x = s1.get();
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                s1.set(x);
                Ok(FfiValue::Int((x >> 33) as i64 & 0x7fff_ffff))
            }),
        );
        let s2 = state;
        vm.register(
            "srand",
            1,
            false,
            Box::new(move |_, args| {
                s2.set(args.uint(0) | 1);
                Ok(FfiValue::Int(0))
            }),
        );
    }
    vm.register(
        "getenv",
        1,
        false,
        Box::new(|ctx, args| {
            let name = String::from_utf8_lossy(&cstr(ctx, args.int(0))?).into_owned();
            match std::env::var(&name) {
                Ok(val) => {
                    let mut bytes = val.into_bytes();
                    bytes.push(0);
                    match ctx.heap.alloc(&mut ctx.mem.heap, bytes.len() as u64) {
                        Ok(p) => {
                            ctx.mem.write_bytes(addr(p as i64), &bytes)?;
                            Ok(FfiValue::Int(p as i64))
                        }
                        Err(_) => Ok(FfiValue::Int(0)),
                    }
                }
                Err(_) => Ok(FfiValue::Int(0)),
            }
        }),
    );
    vm.register(
        "exit",
        1,
        false,
        Box::new(|ctx, args| {
            *ctx.exit = Some(args.int(0) as i32);
            Ok(FfiValue::Int(0))
        }),
    );
    vm.register(
        "abort",
        0,
        false,
        Box::new(|_, _| {
            Err(Fault::Abort {
                msg: "abort() called".to_string(),
            })
        }),
    );
    vm.register(
        "__assert_fail",
        3,
        false,
        Box::new(|ctx, args| {
            let expr = String::from_utf8_lossy(&cstr(ctx, args.int(0))?).into_owned();
            let file = String::from_utf8_lossy(&cstr(ctx, args.int(1))?).into_owned();
            Err(Fault::Abort {
                msg: format!(
                    "assertion failed: {} ({}:{})",
                    expr,
                    file,
                    args.int(2)
                ),
            })
        }),
    );
    {
        let cell = Rc::new(Cell::new(0u64));
        vm.register(
            "__errno_location",
            0,
            false,
            Box::new(move |ctx, _| {
                if cell.get() == 0 {
                    let p = ctx.heap.alloc(&mut ctx.mem.heap, 8)?;
                    ctx.mem.write_int(addr(p as i64), 8, 0)?;
                    cell.set(p);
                }
                Ok(FfiValue::Int(cell.get() as i64))
            }),
        );
    }

    // --- math ---
    let unary: &[(&str, fn(f64) -> f64)] = &[
        ("fabs", f64::abs),
        ("floor", f64::floor),
        ("ceil", f64::ceil),
        ("sqrt", f64::sqrt),
        ("sin", f64::sin),
        ("cos", f64::cos),
        ("tan", f64::tan),
        ("exp", f64::exp),
        ("log", f64::ln),
        ("log2", f64::log2),
        ("log10", f64::log10),
    ];
    for &(name, f) in unary {
        vm.register(
            name,
            1,
            true,
            Box::new(move |_, args| Ok(FfiValue::Float(f(args.float(0))))),
        );
    }
    vm.register(
        "pow",
        2,
        true,
        Box::new(|_, args| Ok(FfiValue::Float(args.float(0).powf(args.float(1))))),
    );
    vm.register(
        "fmod",
        2,
        true,
        Box::new(|_, args| Ok(FfiValue::Float(args.float(0) % args.float(1)))),
    );

    // --- ctype ---
    let classes: &[(&str, fn(u8) -> bool)] = &[
        ("isalpha", |c| c.is_ascii_alphabetic()),
        ("isdigit", |c| c.is_ascii_digit()),
        ("isalnum", |c| c.is_ascii_alphanumeric()),
        ("isspace", |c| c.is_ascii_whitespace() || c == 0x0b),
        ("isupper", |c| c.is_ascii_uppercase()),
        ("islower", |c| c.is_ascii_lowercase()),
        ("ispunct", |c| c.is_ascii_punctuation()),
        ("isxdigit", |c| c.is_ascii_hexdigit()),
    ];
    for &(name, f) in classes {
        vm.register(
            name,
            1,
            false,
            Box::new(move |_, args| Ok(FfiValue::Int(f(args.int(0) as u8) as i64))),
        );
    }
    vm.register(
        "toupper",
        1,
        false,
        Box::new(|_, args| {
            Ok(FfiValue::Int(
                (args.int(0) as u8).to_ascii_uppercase() as i64
            ))
        }),
    );
    vm.register(
        "tolower",
        1,
        false,
        Box::new(|_, args| {
            Ok(FfiValue::Int(
                (args.int(0) as u8).to_ascii_lowercase() as i64
            ))
        }),
    );
}

/// strtol-style parsing: returns the value and how many bytes were used.
fn parse_long(s: &[u8], base: u32) -> (i64, usize) {
    let mut i = 0;
    while i < s.len() && (s[i] as char).is_whitespace() {
        i += 1;
    }
    let mut neg = false;
    if i < s.len() && (s[i] == b'-' || s[i] == b'+') {
        neg = s[i] == b'-';
        i += 1;
    }
    let mut base = base;
    if base == 0 {
        if s[i..].starts_with(b"0x") || s[i..].starts_with(b"0X") {
            base = 16;
            i += 2;
        } else if i < s.len() && s[i] == b'0' {
            base = 8;
        } else {
            base = 10;
        }
    } else if base == 16 && (s[i..].starts_with(b"0x") || s[i..].starts_with(b"0X")) {
        i += 2;
    }
    let mut val: i64 = 0;
    let mut any = false;
    while i < s.len() {
        let Some(d) = (s[i] as char).to_digit(base) else {
            break;
        };
        val = val.wrapping_mul(base as i64).wrapping_add(d as i64);
        any = true;
        i += 1;
    }
    let _ = any;
    (if neg { -val } else { val }, i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(fmt_str: &str, ints: &[i64]) -> String {
        let mem = Memory::new(vec![0; 16], 16, 16);
        let mut args = FfiArgs::default();
        for (i, &v) in ints.iter().enumerate() {
            args.ints[i] = v;
        }
        args.nargs = ints.len();
        let mut src = VaSource::Regs {
            args: &args,
            pos: 0,
        };
        String::from_utf8(format_guest(&mem, fmt_str.as_bytes(), &mut src)).unwrap()
    }

    fn fmt_f(fmt_str: &str, v: f64) -> String {
        let mem = Memory::new(vec![0; 16], 16, 16);
        let mut args = FfiArgs {
            nargs: 1,
            double_mask: 1,
            ..FfiArgs::default()
        };
        args.floats[0] = v;
        let mut src = VaSource::Regs {
            args: &args,
            pos: 0,
        };
        String::from_utf8(format_guest(&mem, fmt_str.as_bytes(), &mut src)).unwrap()
    }

    #[test]
    fn integer_conversions() {
        assert_eq!(fmt("%d", &[42]), "42");
        assert_eq!(fmt("%d", &[-7]), "-7");
        assert_eq!(fmt("%5d", &[42]), "   42");
        assert_eq!(fmt("%-5d|", &[42]), "42   |");
        assert_eq!(fmt("%05d", &[42]), "00042");
        assert_eq!(fmt("%x", &[255]), "ff");
        assert_eq!(fmt("%X", &[255]), "FF");
        assert_eq!(fmt("%#x", &[255]), "0xff");
        assert_eq!(fmt("%o", &[8]), "10");
        assert_eq!(fmt("%u", &[42]), "42");
        assert_eq!(fmt("%+d", &[42]), "+42");
    }

    #[test]
    fn char_percent_and_width_star() {
        assert_eq!(fmt("%c", &[65]), "A");
        assert_eq!(fmt("100%%", &[]), "100%");
        assert_eq!(fmt("%*d", &[5, 42]), "   42");
    }

    #[test]
    fn float_conversions() {
        assert_eq!(fmt_f("%f", 3.5), "3.500000");
        assert_eq!(fmt_f("%.2f", 3.14159), "3.14");
        assert_eq!(fmt_f("%e", 150.0), "1.500000e+02");
        assert_eq!(fmt_f("%g", 0.0001), "0.0001");
        assert_eq!(fmt_f("%g", 100000000.0), "1e+08");
    }

    #[test]
    fn string_conversion_reads_guest_memory() {
        let mut mem = Memory::new(vec![0; 64], 16, 16);
        mem.write_bytes(cvm_core::isa::DATA_BASE, b"world\0").unwrap();
        let mut args = FfiArgs {
            nargs: 1,
            ..FfiArgs::default()
        };
        args.ints[0] = cvm_core::isa::DATA_BASE as i64;
        let mut src = VaSource::Regs {
            args: &args,
            pos: 0,
        };
        let out = format_guest(&mem, b"hello %s", &mut src);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn strtol_parsing() {
        assert_eq!(parse_long(b"  42abc", 10), (42, 4));
        assert_eq!(parse_long(b"-0x1f", 0).0, -31);
        assert_eq!(parse_long(b"077", 0).0, 63);
    }
}
