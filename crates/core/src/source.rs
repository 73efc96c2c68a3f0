//! Source files and positions.

/// One translation-unit input: a file, a string presented as a file, or a
/// built-in virtual header.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path as opened (or a `<...>` pseudo-name for strings and built-ins).
    pub name: String,
    /// Name reported in diagnostics; `#line` can change it.
    pub display_name: String,
    pub file_no: usize,
    pub contents: String,
    /// Added to physical line numbers when reporting; set by `#line`.
    pub line_delta: i64,
}

/// A position inside a [`SourceFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub file_no: u32,
    /// Byte offset into the file contents.
    pub offset: u32,
    /// 1-based physical line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl Loc {
    pub fn new(file_no: usize, offset: usize, line: u32, col: u32) -> Self {
        Loc {
            file_no: file_no as u32,
            offset: offset as u32,
            line,
            col,
        }
    }
}

/// The set of files seen by one compiler instance. Cloned into the program
/// image so runtime faults can still name their source line.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: Vec<SourceFile>,
}

impl FileSet {
    pub fn new() -> Self {
        FileSet { files: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, contents: impl Into<String>) -> usize {
        let file_no = self.files.len();
        let name = name.into();
        self.files.push(SourceFile {
            display_name: name.clone(),
            name,
            file_no,
            contents: contents.into(),
            line_delta: 0,
        });
        file_no
    }

    pub fn get(&self, file_no: usize) -> Option<&SourceFile> {
        self.files.get(file_no)
    }

    pub fn get_mut(&mut self, file_no: usize) -> Option<&mut SourceFile> {
        self.files.get_mut(file_no)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The text of the physical line containing `offset`, without newline.
    pub fn line_text(&self, file_no: usize, offset: usize) -> Option<&str> {
        let file = self.get(file_no)?;
        let bytes = file.contents.as_bytes();
        if offset > bytes.len() {
            return None;
        }
        let start = file.contents[..offset.min(bytes.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = file.contents[start..]
            .find('\n')
            .map(|i| start + i)
            .unwrap_or(bytes.len());
        Some(&file.contents[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_text_finds_the_enclosing_line() {
        let mut files = FileSet::new();
        let f = files.add("t.c", "int main() {\n  return 0;\n}\n");
        assert_eq!(files.line_text(f, 0), Some("int main() {"));
        assert_eq!(files.line_text(f, 15), Some("  return 0;"));
        assert_eq!(files.line_text(f, 26), Some("}"));
    }
}
