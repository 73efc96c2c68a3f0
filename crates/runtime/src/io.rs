//! Host I/O for the guest program.
//!
//! Standard streams either inherit the process's or capture into a buffer
//! (what the end-to-end tests use). Guest `FILE *` values are small
//! integer handles: 1/2/3 are stdin/stdout/stderr, real files start at 4.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

pub const STDIN_HANDLE: u64 = 1;
pub const STDOUT_HANDLE: u64 = 2;
pub const STDERR_HANDLE: u64 = 3;

pub enum Sink {
    Stdout,
    Stderr,
    Capture(Rc<RefCell<Vec<u8>>>),
}

impl Sink {
    fn write(&mut self, bytes: &[u8]) {
        match self {
            Sink::Stdout => {
                let _ = std::io::stdout().write_all(bytes);
                let _ = std::io::stdout().flush();
            }
            Sink::Stderr => {
                let _ = std::io::stderr().write_all(bytes);
            }
            Sink::Capture(buf) => buf.borrow_mut().extend_from_slice(bytes),
        }
    }
}

pub struct Io {
    pub stdout: Sink,
    pub stderr: Sink,
    files: HashMap<u64, File>,
    next_handle: u64,
}

impl Default for Io {
    fn default() -> Self {
        Io {
            stdout: Sink::Stdout,
            stderr: Sink::Stderr,
            files: HashMap::new(),
            next_handle: 4,
        }
    }
}

impl Io {
    /// Redirect guest stdout into a buffer and return the handle.
    pub fn capture_stdout(&mut self) -> Rc<RefCell<Vec<u8>>> {
        let buf = Rc::new(RefCell::new(Vec::new()));
        self.stdout = Sink::Capture(buf.clone());
        buf
    }

    pub fn capture_stderr(&mut self) -> Rc<RefCell<Vec<u8>>> {
        let buf = Rc::new(RefCell::new(Vec::new()));
        self.stderr = Sink::Capture(buf.clone());
        buf
    }

    pub fn write_stream(&mut self, handle: u64, bytes: &[u8]) -> i64 {
        match handle {
            STDOUT_HANDLE => {
                self.stdout.write(bytes);
                bytes.len() as i64
            }
            STDERR_HANDLE => {
                self.stderr.write(bytes);
                bytes.len() as i64
            }
            h => match self.files.get_mut(&h) {
                Some(f) => match f.write(bytes) {
                    Ok(n) => n as i64,
                    Err(_) => -1,
                },
                None => -1,
            },
        }
    }

    pub fn read_stream(&mut self, handle: u64, len: usize) -> Option<Vec<u8>> {
        match handle {
            STDIN_HANDLE => {
                let mut buf = vec![0u8; len];
                match std::io::stdin().read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Some(buf)
                    }
                    Err(_) => None,
                }
            }
            h => {
                let f = self.files.get_mut(&h)?;
                let mut buf = vec![0u8; len];
                match f.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Some(buf)
                    }
                    Err(_) => None,
                }
            }
        }
    }

    pub fn read_byte(&mut self, handle: u64) -> i64 {
        match self.read_stream(handle, 1) {
            Some(b) if b.len() == 1 => b[0] as i64,
            _ => -1, // EOF
        }
    }

    pub fn open(&mut self, path: &str, mode: &str) -> u64 {
        let result = match mode.trim_end_matches('b') {
            "r" => File::open(path),
            "w" => File::create(path),
            "a" => std::fs::OpenOptions::new().append(true).create(true).open(path),
            "r+" => std::fs::OpenOptions::new().read(true).write(true).open(path),
            "w+" => std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
            _ => File::open(path),
        };
        match result {
            Ok(f) => {
                let h = self.next_handle;
                self.next_handle += 1;
                self.files.insert(h, f);
                h
            }
            Err(_) => 0,
        }
    }

    pub fn close(&mut self, handle: u64) -> i64 {
        if self.files.remove(&handle).is_some() {
            0
        } else {
            -1
        }
    }

    pub fn seek(&mut self, handle: u64, offset: i64, whence: i64) -> i64 {
        let Some(f) = self.files.get_mut(&handle) else {
            return -1;
        };
        let pos = match whence {
            0 => SeekFrom::Start(offset.max(0) as u64),
            1 => SeekFrom::Current(offset),
            _ => SeekFrom::End(offset),
        };
        match f.seek(pos) {
            Ok(_) => 0,
            Err(_) => -1,
        }
    }

    pub fn tell(&mut self, handle: u64) -> i64 {
        match self.files.get_mut(&handle) {
            Some(f) => f.stream_position().map(|p| p as i64).unwrap_or(-1),
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        let mut io = Io::default();
        let h = io.open(path.to_str().unwrap(), "w");
        assert!(h >= 4);
        assert_eq!(io.write_stream(h, b"hello"), 5);
        assert_eq!(io.close(h), 0);
        let h = io.open(path.to_str().unwrap(), "r");
        assert_eq!(io.read_stream(h, 5).unwrap(), b"hello");
        assert_eq!(io.read_byte(h), -1);
        io.close(h);
    }

    #[test]
    fn missing_files_yield_null_handles() {
        let mut io = Io::default();
        assert_eq!(io.open("/nonexistent/definitely/not/here", "r"), 0);
        assert_eq!(io.close(99), -1);
    }

    #[test]
    fn capture_redirects_stdout() {
        let mut io = Io::default();
        let buf = io.capture_stdout();
        io.write_stream(STDOUT_HANDLE, b"out");
        assert_eq!(buf.borrow().as_slice(), b"out");
    }
}
