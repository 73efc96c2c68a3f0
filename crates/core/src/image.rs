//! The compiled program image.
//!
//! This is the hand-off artifact between the compiler and the VM: a text
//! segment of instruction words with the entry offset in `text[0]`, the
//! initial data segment, a symbol table for diagnostics and foreign-call
//! resolution, the table of foreign names referenced by CALLF sites, and an
//! append-only source map keyed by text offset.

use crate::source::{FileSet, Loc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Text word index for functions, virtual data address for objects.
    pub addr: u64,
    pub size: u64,
}

/// One source-map record; the vector is sorted by `text_off` because codegen
/// appends in emission order.
#[derive(Debug, Clone, Copy)]
pub struct SourceMapEntry {
    pub text_off: u32,
    pub loc: Loc,
}

#[derive(Debug, Clone, Default)]
pub struct Image {
    /// Instruction words; `text[0]` holds the entry offset of `main`.
    pub text: Vec<i64>,
    /// Initial contents of the data segment (globals, strings, return pool).
    pub data: Vec<u8>,
    /// Names referenced by CALLF call sites, indexed by the first operand.
    pub ffi_names: Vec<String>,
    pub symbols: Vec<Symbol>,
    pub source_map: Vec<SourceMapEntry>,
    pub files: FileSet,
}

impl Image {
    pub fn entry(&self) -> usize {
        self.text.first().copied().unwrap_or(0) as usize
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// The function symbol containing a text address, for fault banners.
    pub fn function_at(&self, text_off: u64) -> Option<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function && s.addr <= text_off)
            .max_by_key(|s| s.addr)
    }

    /// Binary-search the source map for the record covering `text_off`.
    pub fn source_loc(&self, text_off: usize) -> Option<Loc> {
        if self.source_map.is_empty() {
            return None;
        }
        let i = self
            .source_map
            .partition_point(|e| e.text_off as usize <= text_off);
        if i == 0 {
            return None;
        }
        Some(self.source_map[i - 1].loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_map_lookup_picks_the_covering_record() {
        let mut image = Image::default();
        for (off, line) in [(1u32, 1u32), (10, 2), (25, 3)] {
            image.source_map.push(SourceMapEntry {
                text_off: off,
                loc: Loc::new(0, 0, line, 1),
            });
        }
        assert_eq!(image.source_loc(0), None);
        assert_eq!(image.source_loc(1).unwrap().line, 1);
        assert_eq!(image.source_loc(9).unwrap().line, 1);
        assert_eq!(image.source_loc(10).unwrap().line, 2);
        assert_eq!(image.source_loc(400).unwrap().line, 3);
    }

    #[test]
    fn function_at_finds_the_enclosing_symbol() {
        let mut image = Image::default();
        image.symbols.push(Symbol {
            name: "main".into(),
            kind: SymbolKind::Function,
            addr: 1,
            size: 20,
        });
        image.symbols.push(Symbol {
            name: "helper".into(),
            kind: SymbolKind::Function,
            addr: 21,
            size: 10,
        });
        assert_eq!(image.function_at(5).unwrap().name, "main");
        assert_eq!(image.function_at(30).unwrap().name, "helper");
    }
}
