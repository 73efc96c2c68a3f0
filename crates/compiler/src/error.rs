//! Compiler error types.
//!
//! Fatal problems (unreadable file, unterminated literal, preprocessor
//! failure, linker conflict) propagate with `?` and abort the pipeline.
//! Recoverable parse and type errors do not use this type at all: they
//! accumulate in the diagnostics sink while the offending nodes adopt the
//! Error type, so one run can report many independent problems.

use cvm_core::source::Loc;
use std::fmt;

#[derive(Debug)]
pub enum CompileError {
    /// Lexical error: invalid character, unterminated literal.
    Lex { loc: Loc, msg: String },
    /// Preprocessor error: bad directive, unterminated conditional, #error.
    Preprocess { loc: Option<Loc>, msg: String },
    /// Fatal parse error (only raised when error collection is off or the
    /// parser cannot resynchronize).
    Parse { loc: Option<Loc>, msg: String },
    /// Symbol conflicts and unresolved references at link/patch time.
    Link { loc: Option<Loc>, msg: String },
    /// Internal code generator inconsistency (out of registers, unsupported
    /// node shape). Always a bug, never user error.
    Codegen { msg: String },
    Io { path: String, msg: String },
    /// Collect-errors mode finished with diagnostics; the count is the
    /// number of errors reported through the sink.
    Reported { count: usize },
}

impl CompileError {
    pub fn loc(&self) -> Option<Loc> {
        match self {
            CompileError::Lex { loc, .. } => Some(*loc),
            CompileError::Preprocess { loc, .. }
            | CompileError::Parse { loc, .. }
            | CompileError::Link { loc, .. } => *loc,
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CompileError::Lex { msg, .. }
            | CompileError::Preprocess { msg, .. }
            | CompileError::Parse { msg, .. }
            | CompileError::Link { msg, .. } => msg.clone(),
            CompileError::Codegen { msg } => format!("internal error: {}", msg),
            CompileError::Io { path, msg } => format!("{}: {}", path, msg),
            CompileError::Reported { count } => format!("{} error(s) generated", count),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for CompileError {}
