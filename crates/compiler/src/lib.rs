//! CVM compiler library.
//!
//! The pipeline: source text → tokens → preprocessed tokens → AST (a list
//! of global objects per translation unit) → linked object list → bytecode
//! image for the CVM virtual machine.
//!
//! A [`Compiler`] is one self-contained instance: it owns its type arena,
//! object arena, macro table, include caches and diagnostics. Two instances
//! in one process share nothing: each has its own `__COUNTER__`, its own
//! anonymous symbol names, its own everything.
//!
//! ```no_run
//! use cvmc::Compiler;
//!
//! let mut cc = Compiler::new();
//! let image = cc.compile_source("demo.c", "int main(void) { return 42; }")
//!     .expect("compile");
//! assert_eq!(image.entry(), image.text[0] as usize);
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod headers;
pub mod lexer;
pub mod link;
pub mod parse;
pub mod preprocess;
pub mod token;
pub mod typecheck;
pub mod types;

use crate::ast::{Obj, ObjId};
use crate::config::Options;
use crate::error::CompileError;
use crate::preprocess::{Macro, Preprocessor};
use crate::token::Token;
use crate::types::TypeTable;
use cvm_core::arena::Arena;
use cvm_core::diag::Diagnostics;
use cvm_core::image::Image;
use cvm_core::source::FileSet;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct Compiler {
    pub files: FileSet,
    pub types: TypeTable,
    pub objs: Arena<Obj>,
    pub diags: Diagnostics,
    pub options: Options,
    pub include_paths: Vec<PathBuf>,
    pub(crate) macros: HashMap<String, Macro>,
    pub(crate) pragma_once: HashSet<PathBuf>,
    /// path → guard macro name, so a second inclusion can be skipped
    /// without opening the file.
    pub(crate) include_guards: HashMap<PathBuf, String>,
    /// Which include-path entry a file was found under, for #include_next.
    pub(crate) include_found_at: HashMap<PathBuf, usize>,
    pub(crate) counter: u64,
    pub(crate) unique: u64,
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let mut macros = HashMap::new();
        preprocess::init_macros(&mut macros);
        let include_paths = options.include_paths.clone();
        let mut cc = Compiler {
            files: FileSet::new(),
            types: TypeTable::new(),
            objs: Arena::new(),
            diags: Diagnostics::new(),
            options,
            include_paths,
            macros,
            pragma_once: HashSet::new(),
            include_guards: HashMap::new(),
            include_found_at: HashMap::new(),
            counter: 0,
            unique: 0,
        };
        for (name, value) in [
            ("__STDC__", "1"),
            ("__STDC_VERSION__", "201112L"),
            ("__STDC_HOSTED__", "1"),
            ("__CVM__", "1"),
        ] {
            cc.define_macro(name, value);
        }
        let defines = cc.options.defines.clone();
        for (name, value) in defines {
            cc.define_macro(&name, &value);
        }
        let undefines = cc.options.undefines.clone();
        for name in undefines {
            cc.undef_macro(&name);
        }
        cc
    }

    /// Define an object-like macro from a source-level body, the `-D` path.
    pub fn define_macro(&mut self, name: &str, body: &str) {
        let file_no = self
            .files
            .add("<command-line>", lexer::canonicalize(body));
        let tokens = match lexer::tokenize(self.files.get(file_no).unwrap()) {
            Ok(t) => t,
            Err(_) => return,
        };
        let body: Vec<Token> = tokens.into_iter().filter(|t| !t.is_eof()).collect();
        self.macros.insert(
            name.to_string(),
            Macro {
                body: preprocess::MacroBody::ObjLike(body),
            },
        );
    }

    pub fn undef_macro(&mut self, name: &str) {
        self.macros.remove(name);
    }

    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    pub(crate) fn new_unique_name(&mut self, tag: &str) -> String {
        let n = self.unique;
        self.unique += 1;
        format!(".L.{}.{}", tag, n)
    }

    // --- pipeline -------------------------------------------------------

    /// Tokenize and preprocess an on-disk file.
    pub fn preprocess_file(&mut self, path: &Path) -> Result<Vec<Token>, CompileError> {
        let contents = std::fs::read_to_string(path).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        self.preprocess_source(&path.display().to_string(), &contents)
    }

    /// Tokenize and preprocess an in-memory string presented as a file.
    pub fn preprocess_source(
        &mut self,
        name: &str,
        contents: &str,
    ) -> Result<Vec<Token>, CompileError> {
        let file_no = self.files.add(name, lexer::canonicalize(contents));
        let tokens = lexer::tokenize(self.files.get(file_no).unwrap())?;
        Preprocessor::new(self, tokens, name.to_string()).run()
    }

    /// Parse one preprocessed translation unit into its global objects.
    pub fn parse(&mut self, tokens: Vec<Token>) -> Result<Vec<ObjId>, CompileError> {
        parse::parse(self, tokens)
    }

    /// Merge the objects of several translation units.
    pub fn link(&mut self, units: Vec<Vec<ObjId>>) -> Result<Vec<ObjId>, CompileError> {
        link::link(self, units)
    }

    /// Generate a runnable image from a linked object list.
    pub fn codegen(&mut self, program: &[ObjId]) -> Result<Image, CompileError> {
        codegen::generate(self, program)
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<Image, CompileError> {
        let tokens = self.preprocess_file(path)?;
        self.compile_tokens(tokens)
    }

    pub fn compile_source(&mut self, name: &str, src: &str) -> Result<Image, CompileError> {
        let tokens = self.preprocess_source(name, src)?;
        self.compile_tokens(tokens)
    }

    fn compile_tokens(&mut self, tokens: Vec<Token>) -> Result<Image, CompileError> {
        let unit = self.parse(tokens)?;
        if self.diags.has_errors() {
            return Err(CompileError::Reported {
                count: self.diags.error_count(),
            });
        }
        let prog = self.link(vec![unit])?;
        self.codegen(&prog)
    }

    /// Render accumulated diagnostics for the user.
    pub fn render_diagnostics(&self) -> String {
        self.diags.render_all(&self.files)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_isolated() {
        let mut a = Compiler::new();
        let mut b = Compiler::new();
        let ta = a.preprocess_source("a.c", "__COUNTER__ __COUNTER__").unwrap();
        let tb = b.preprocess_source("b.c", "__COUNTER__").unwrap();
        assert_eq!(ta[0].text, "0");
        assert_eq!(ta[1].text, "1");
        // The second instance starts from zero again.
        assert_eq!(tb[0].text, "0");
        // Anonymous names are also instance-local.
        assert_eq!(a.new_unique_name("anon"), b.new_unique_name("anon"));
    }
}
