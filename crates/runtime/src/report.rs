//! End-of-run reports.
//!
//! The leak report prints to stderr as plain text, or as JSON when
//! `CVM_REPORT=json` is set so tooling can consume it.

use crate::io::Io;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct LeakEntry {
    address: u64,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct LeakReport {
    leaked_allocations: usize,
    leaked_bytes: u64,
    leaks: Vec<LeakEntry>,
}

/// Report never-freed allocations. Returns how many there were.
pub fn emit_leak_report(io: &mut Io, leaks: &[(u64, u64)]) -> usize {
    if leaks.is_empty() {
        return 0;
    }
    let report = LeakReport {
        leaked_allocations: leaks.len(),
        leaked_bytes: leaks.iter().map(|&(_, n)| n).sum(),
        leaks: leaks
            .iter()
            .map(|&(address, bytes)| LeakEntry { address, bytes })
            .collect(),
    };
    let json = std::env::var("CVM_REPORT").is_ok_and(|v| v == "json");
    let text = if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => format!("{}\n", s),
            Err(_) => String::new(),
        }
    } else {
        let mut s = format!(
            "==== CVM leak report ====\n{} allocation(s) never freed, {} byte(s) total\n",
            report.leaked_allocations, report.leaked_bytes
        );
        for leak in &report.leaks {
            s.push_str(&format!(
                "  {:#x}: {} byte(s)\n",
                leak.address, leak.bytes
            ));
        }
        s
    };
    io.write_stream(crate::io::STDERR_HANDLE, text.as_bytes());
    report.leaked_allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn capture(leaks: &[(u64, u64)]) -> String {
        let mut io = Io::default();
        let buf = io.capture_stderr();
        emit_leak_report(&mut io, leaks);
        let out = String::from_utf8_lossy(&buf.borrow()).into_owned();
        out
    }

    #[test]
    #[serial]
    fn text_report_lists_each_leak() {
        std::env::remove_var("CVM_REPORT");
        let out = capture(&[(0x8000_0000, 16), (0x8000_0040, 8)]);
        assert!(out.contains("2 allocation(s) never freed"), "{}", out);
        assert!(out.contains("24 byte(s) total"), "{}", out);
        assert!(out.contains("0x80000040"), "{}", out);
    }

    #[test]
    #[serial]
    fn json_report_is_machine_readable() {
        std::env::set_var("CVM_REPORT", "json");
        let out = capture(&[(0x8000_0000, 32)]);
        std::env::remove_var("CVM_REPORT");
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid json");
        assert_eq!(parsed["leaked_allocations"], 1);
        assert_eq!(parsed["leaked_bytes"], 32);
    }

    #[test]
    #[serial]
    fn silent_when_nothing_leaked() {
        std::env::remove_var("CVM_REPORT");
        assert_eq!(capture(&[]), "");
    }
}
