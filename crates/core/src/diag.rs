//! Diagnostics.
//!
//! Every diagnostic renders as `file:line:col: severity: message`, followed
//! by the source line with a caret under the offending column. Tokens that
//! came out of macro expansion carry a chain of expansion notes so the user
//! can see where the text originally appeared.

use crate::source::{FileSet, Loc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// One step of macro expansion leading to the diagnosed token.
#[derive(Debug, Clone)]
pub struct ExpansionNote {
    pub macro_name: String,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub loc: Option<Loc>,
    pub expansion: Vec<ExpansionNote>,
}

impl Diagnostic {
    pub fn render(&self, files: &FileSet) -> String {
        let mut out = String::new();
        self.render_line(&mut out, self.severity, &self.message, self.loc, files);
        for note in &self.expansion {
            self.render_line(
                &mut out,
                Severity::Note,
                &format!("in expansion of macro '{}'", note.macro_name),
                Some(note.loc),
                files,
            );
        }
        out
    }

    fn render_line(
        &self,
        out: &mut String,
        severity: Severity,
        message: &str,
        loc: Option<Loc>,
        files: &FileSet,
    ) {
        match loc {
            Some(loc) => {
                let (name, line) = match files.get(loc.file_no as usize) {
                    Some(file) => (
                        file.display_name.as_str(),
                        loc.line as i64 + file.line_delta,
                    ),
                    None => ("<unknown>", loc.line as i64),
                };
                out.push_str(&format!(
                    "{}:{}:{}: {}: {}\n",
                    name, line, loc.col, severity, message
                ));
                if let Some(text) = files.line_text(loc.file_no as usize, loc.offset as usize) {
                    out.push_str(text);
                    out.push('\n');
                    // Caret under the offending column; tabs keep their width.
                    let col = (loc.col as usize).saturating_sub(1);
                    for ch in text.chars().take(col) {
                        out.push(if ch == '\t' { '\t' } else { ' ' });
                    }
                    out.push_str("^\n");
                }
            }
            None => {
                out.push_str(&format!("{}: {}\n", severity, message));
            }
        }
    }
}

/// Accumulates diagnostics for one compilation.
#[derive(Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
    errors: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        if diag.severity == Severity::Error {
            self.errors += 1;
        }
        self.list.push(diag);
    }

    pub fn error(&mut self, loc: Option<Loc>, message: impl Into<String>) {
        self.push(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            loc,
            expansion: Vec::new(),
        });
    }

    pub fn warning(&mut self, loc: Option<Loc>, message: impl Into<String>) {
        self.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            loc,
            expansion: Vec::new(),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    pub fn render_all(&self, files: &FileSet) -> String {
        let mut out = String::new();
        for diag in &self.list {
            out.push_str(&diag.render(files));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_caret_under_column() {
        let mut files = FileSet::new();
        files.add("t.c", "int x = $;\n");
        let mut diags = Diagnostics::new();
        diags.error(Some(Loc::new(0, 8, 1, 9)), "invalid character");
        let text = diags.render_all(&files);
        assert!(text.starts_with("t.c:1:9: error: invalid character\n"));
        assert!(text.contains("int x = $;\n        ^\n"));
    }

    #[test]
    fn counts_only_errors() {
        let mut diags = Diagnostics::new();
        diags.warning(None, "w");
        diags.error(None, "e");
        diags.error(None, "e2");
        assert_eq!(diags.error_count(), 2);
        assert!(diags.has_errors());
    }
}
