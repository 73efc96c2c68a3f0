//! Recursive-descent C11 parser.
//!
//! Declarations follow the standard outside-in declarator grammar; a
//! nested declarator is parsed twice, once to find its closing parenthesis
//! and once with the real base type. Expressions live in [`expr`],
//! initializers and constant evaluation in [`init`].
//!
//! Error recovery: a recoverable parse error is recorded in the
//! diagnostics sink, the parser skips to the next statement boundary
//! (`;`, `}`, or a statement keyword) and drops an Error-typed stub node
//! in place. Error types propagate silently through the typing pass, so
//! one broken expression never produces a second diagnostic.

mod expr;
mod init;

pub(crate) use init::{eval_const, eval_const_float};

use crate::ast::{CaseLabel, Node, NodeKind, Obj, ObjId};
use crate::error::CompileError;
use crate::token::{Token, TokenKind};
use crate::typecheck::{add_type, new_cast};
use crate::types::{align_to, Member, TypeId, TypeKind};
use crate::Compiler;
use cvm_core::source::Loc;
use std::collections::HashMap;

const TYPE_KEYWORDS: &[&str] = &[
    "void", "_Bool", "bool", "char", "short", "int", "long", "float", "double", "struct", "union",
    "enum", "typedef", "static", "extern", "register", "auto", "signed", "unsigned", "const",
    "volatile", "restrict", "__restrict", "__restrict__", "_Atomic", "inline", "__inline",
    "_Noreturn", "_Alignas", "_Thread_local", "typeof", "typeof_unqual",
];

const STMT_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "case", "default", "return", "break",
    "continue", "goto",
];

#[derive(Debug, Clone)]
enum ScopeEntry {
    Var(ObjId),
    Typedef(TypeId),
    EnumConst { ty: TypeId, val: i64 },
}

#[derive(Default)]
struct Scope {
    vars: HashMap<String, ScopeEntry>,
    tags: HashMap<String, TypeId>,
}

/// Storage-class and alignment attributes gathered by declspec.
#[derive(Debug, Clone, Copy, Default)]
struct VarAttr {
    is_typedef: bool,
    is_static: bool,
    is_extern: bool,
    is_inline: bool,
    align: Option<i64>,
}

#[derive(Debug)]
struct ParamDecl {
    ty: TypeId,
    name: Option<Token>,
}

struct Declarator {
    ty: TypeId,
    name: Option<Token>,
    /// Parameters of the outermost function suffix, when `ty` is a
    /// function type declared with a parameter list.
    fn_params: Vec<ParamDecl>,
}

struct SwitchCtx {
    cases: Vec<CaseLabel>,
    default_label: Option<String>,
    brk_label: String,
}

pub(crate) struct Parser<'a> {
    pub cc: &'a mut Compiler,
    toks: Vec<Token>,
    pos: usize,
    scopes: Vec<Scope>,
    globals: Vec<ObjId>,
    /// Locals of the function being parsed, parameters included.
    locals: Vec<ObjId>,
    cur_fn_ret: Option<TypeId>,
    cur_fn_variadic: bool,
    brk_label: Option<String>,
    cont_label: Option<String>,
    switch: Option<SwitchCtx>,
    /// Pending length expressions for VLA types built inside declarators.
    vla_lens: HashMap<TypeId, Node>,
}

/// Parse one preprocessed translation unit into a list of global objects.
pub(crate) fn parse(cc: &mut Compiler, tokens: Vec<Token>) -> Result<Vec<ObjId>, CompileError> {
    let mut p = Parser {
        cc,
        toks: tokens,
        pos: 0,
        scopes: vec![Scope::default()],
        globals: Vec::new(),
        locals: Vec::new(),
        cur_fn_ret: None,
        cur_fn_variadic: false,
        brk_label: None,
        cont_label: None,
        switch: None,
        vla_lens: HashMap::new(),
    };
    p.translation_unit()?;
    Ok(p.globals)
}

impl<'a> Parser<'a> {
    // --- token plumbing -------------------------------------------------

    fn tok(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn la(&self, n: usize) -> &Token {
        &self.toks[(self.pos + n).min(self.toks.len() - 1)]
    }

    fn loc(&self) -> Option<Loc> {
        Some(self.tok().loc)
    }

    fn advance(&mut self) -> Token {
        let t = self.tok().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at_eof(&self) -> bool {
        self.tok().is_eof()
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.tok().is(s) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, s: &str) -> Result<Token, CompileError> {
        if self.tok().is(s) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected '{}', found '{}'", s, self.tok().text)))
        }
    }

    fn error_here(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Parse {
            loc: Some(self.tok().loc),
            msg: msg.into(),
        }
    }

    fn error_at(&self, loc: Option<Loc>, msg: impl Into<String>) -> CompileError {
        CompileError::Parse {
            loc,
            msg: msg.into(),
        }
    }

    /// Macro-expansion footnotes for the most recently consumed token, so a
    /// diagnostic inside an expansion can name the macro chain.
    fn last_token_expansion(&self) -> Vec<cvm_core::diag::ExpansionNote> {
        let at = self.pos.saturating_sub(1).min(self.toks.len() - 1);
        self.toks[at]
            .expansion_chain()
            .into_iter()
            .map(|(macro_name, loc)| cvm_core::diag::ExpansionNote { macro_name, loc })
            .collect()
    }

    // --- scopes ---------------------------------------------------------

    fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: &str, entry: ScopeEntry) {
        self.scopes
            .last_mut()
            .unwrap()
            .vars
            .insert(name.to_string(), entry);
    }

    fn lookup(&self, name: &str) -> Option<ScopeEntry> {
        for scope in self.scopes.iter().rev() {
            if let Some(e) = scope.vars.get(name) {
                return Some(e.clone());
            }
        }
        None
    }

    fn bind_tag(&mut self, name: &str, ty: TypeId) {
        self.scopes
            .last_mut()
            .unwrap()
            .tags
            .insert(name.to_string(), ty);
    }

    fn lookup_tag(&self, name: &str) -> Option<TypeId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&t) = scope.tags.get(name) {
                return Some(t);
            }
        }
        None
    }

    fn lookup_tag_current(&self, name: &str) -> Option<TypeId> {
        self.scopes.last().unwrap().tags.get(name).copied()
    }

    fn typedef_of(&self, tok: &Token) -> Option<TypeId> {
        if tok.kind != TokenKind::Ident {
            return None;
        }
        match self.lookup(&tok.text) {
            Some(ScopeEntry::Typedef(t)) => Some(t),
            _ => None,
        }
    }

    fn is_typename(&self, tok: &Token) -> bool {
        if tok.kind == TokenKind::Ident && TYPE_KEYWORDS.contains(&tok.text.as_str()) {
            return true;
        }
        self.typedef_of(tok).is_some()
    }

    // --- objects --------------------------------------------------------

    fn new_lvar(&mut self, name: &str, ty: TypeId) -> ObjId {
        let mut obj = Obj::new(name, ty);
        obj.is_local = true;
        obj.loc = self.loc();
        let id = self.cc.objs.alloc(obj);
        self.locals.push(id);
        if !name.is_empty() {
            self.bind(name, ScopeEntry::Var(id));
        }
        id
    }

    fn new_anon_lvar(&mut self, ty: TypeId) -> ObjId {
        let name = self.cc.new_unique_name("tmp");
        let mut obj = Obj::new(name, ty);
        obj.is_local = true;
        let id = self.cc.objs.alloc(obj);
        self.locals.push(id);
        id
    }

    fn new_gvar(&mut self, name: &str, ty: TypeId) -> ObjId {
        let mut obj = Obj::new(name, ty);
        obj.is_definition = true;
        obj.loc = self.loc();
        let id = self.cc.objs.alloc(obj);
        self.globals.push(id);
        if !name.is_empty() {
            // File scope.
            self.scopes[0]
                .vars
                .insert(name.to_string(), ScopeEntry::Var(id));
        }
        id
    }

    pub(crate) fn new_string_literal(&mut self, bytes: Vec<u8>, elem: TypeId) -> ObjId {
        let elem_size = self.cc.types.get(elem).size.max(1);
        let len = bytes.len() as i64 / elem_size;
        let ty = self.cc.types.array_of(elem, len);
        let name = self.cc.new_unique_name("str");
        let mut obj = Obj::new(name, ty);
        obj.is_definition = true;
        obj.is_static = true;
        obj.is_local = false;
        obj.init_data = Some(bytes);
        let id = self.cc.objs.alloc(obj);
        self.globals.push(id);
        id
    }

    // --- translation unit -----------------------------------------------

    fn translation_unit(&mut self) -> Result<(), CompileError> {
        while !self.at_eof() {
            let start = self.pos;
            let result = self.top_level();
            match result {
                Ok(()) => {}
                Err(e @ CompileError::Parse { .. }) if self.cc.options.collect_errors => {
                    self.cc.diags.error(e.loc(), e.message());
                    self.resync_top();
                    if self.pos == start && !self.at_eof() {
                        self.advance();
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn top_level(&mut self) -> Result<(), CompileError> {
        if self.eat(";") {
            return Ok(());
        }
        if self.tok().is("_Static_assert") || self.tok().is("static_assert") {
            return self.static_assert();
        }
        let mut attr = VarAttr::default();
        let basety = self.declspec(Some(&mut attr))?;

        if attr.is_typedef {
            self.parse_typedef(basety)?;
            return Ok(());
        }

        // A lone `struct S;` or `enum E;` declares only a tag.
        if self.eat(";") {
            return Ok(());
        }

        let decl = self.declarator(basety)?;
        let is_func = matches!(self.cc.types.get(decl.ty).kind, TypeKind::Func { .. });
        if is_func && (self.tok().is("{") || self.tok().is(";")) {
            return self.function(decl, attr);
        }
        self.global_variable(decl, attr)
    }

    fn resync_top(&mut self) {
        while !self.at_eof() {
            if self.eat(";") {
                return;
            }
            if self.eat("}") {
                return;
            }
            self.advance();
        }
    }

    fn static_assert(&mut self) -> Result<(), CompileError> {
        let kw = self.advance();
        self.expect("(")?;
        let mut cond = self.conditional()?;
        add_type(self.cc, &mut cond);
        let val = eval_const(self.cc, &cond).map_err(|_| {
            self.error_at(Some(kw.loc), "static assertion requires a constant expression")
        })?;
        let msg = if self.eat(",") {
            let t = self.advance();
            t.text
        } else {
            String::new()
        };
        self.expect(")")?;
        self.expect(";")?;
        if val == 0 {
            return Err(self.error_at(Some(kw.loc), format!("static assertion failed {}", msg)));
        }
        Ok(())
    }

    fn parse_typedef(&mut self, basety: TypeId) -> Result<(), CompileError> {
        let mut first = true;
        while !self.eat(";") {
            if !first {
                self.expect(",")?;
            }
            first = false;
            let decl = self.declarator(basety)?;
            let Some(name) = decl.name else {
                return Err(self.error_here("typedef name omitted"));
            };
            let alias = self.cc.types.copy_type(decl.ty);
            self.cc.types.get_mut(alias).origin = Some(decl.ty);
            self.bind(&name.text, ScopeEntry::Typedef(alias));
        }
        Ok(())
    }

    fn function(&mut self, decl: Declarator, attr: VarAttr) -> Result<(), CompileError> {
        let Some(name_tok) = decl.name else {
            return Err(self.error_here("function name omitted"));
        };
        let name = name_tok.text.clone();

        // A second definition of the same function in this unit is an error.
        if self.tok().is("{") {
            if let Some(ScopeEntry::Var(existing)) = self.scopes[0].vars.get(&name) {
                let prev = self.cc.objs.get(*existing);
                if prev.is_function && prev.is_definition {
                    return Err(self.error_at(
                        Some(name_tok.loc),
                        format!("redefinition of '{}'", name),
                    ));
                }
            }
        }

        let mut obj = Obj::new(&name, decl.ty);
        obj.is_function = true;
        obj.is_static = attr.is_static;
        obj.is_inline = attr.is_inline;
        obj.loc = Some(name_tok.loc);
        let id = self.cc.objs.alloc(obj);
        self.globals.push(id);
        self.scopes[0]
            .vars
            .insert(name.clone(), ScopeEntry::Var(id));

        if self.eat(";") {
            return Ok(()); // declaration only
        }

        self.cc.objs.get_mut(id).is_definition = true;
        self.locals.clear();
        let (ret, variadic) = match &self.cc.types.get(decl.ty).kind {
            TypeKind::Func {
                ret, is_variadic, ..
            } => (*ret, *is_variadic),
            _ => unreachable!(),
        };
        self.cur_fn_ret = Some(ret);
        self.cur_fn_variadic = variadic;

        self.enter_scope();
        let mut params = Vec::new();
        for p in &decl.fn_params {
            let Some(name) = &p.name else {
                self.leave_scope();
                return Err(self.error_at(Some(name_tok.loc), "parameter name omitted"));
            };
            let name = name.text.clone();
            let pid = self.new_lvar(&name, p.ty);
            self.cc.objs.get_mut(pid).is_param = true;
            params.push(pid);
        }
        if params.len() > cvm_core::isa::NUM_ARG_REGS {
            self.leave_scope();
            return Err(self.error_at(
                Some(name_tok.loc),
                format!(
                    "too many parameters (at most {} are supported)",
                    cvm_core::isa::NUM_ARG_REGS
                ),
            ));
        }

        self.expect("{")?;
        let body = self.compound_stmt()?;
        self.leave_scope();

        let fobj = self.cc.objs.get_mut(id);
        fobj.params = params;
        fobj.locals = std::mem::take(&mut self.locals);
        fobj.body = Some(body);
        self.cur_fn_ret = None;
        self.cur_fn_variadic = false;
        Ok(())
    }

    fn global_variable(&mut self, first: Declarator, attr: VarAttr) -> Result<(), CompileError> {
        let mut d = first;
        loop {
            let Some(name) = &d.name else {
                return Err(self.error_here("variable name omitted"));
            };
            let id = self.new_gvar(&name.text, d.ty);
            {
                let obj = self.cc.objs.get_mut(id);
                obj.is_static = attr.is_static;
                obj.is_definition = !attr.is_extern;
            }
            if self.eat("=") {
                init::gvar_initializer(self, id)?;
            }
            if self.eat(";") {
                return Ok(());
            }
            self.expect(",")?;
            let basety = self.base_of_declared(d.ty);
            d = self.declarator(basety)?;
        }
    }

    /// Recover the base type for the next declarator in a comma list.
    fn base_of_declared(&self, ty: TypeId) -> TypeId {
        // The declspec result was recorded as the deepest base; walking a
        // derived chain down to it reproduces the original.
        let mut t = ty;
        loop {
            match self.cc.types.get(t).kind {
                TypeKind::Ptr { base }
                | TypeKind::Array { base, .. }
                | TypeKind::Vla { base, .. } => t = base,
                TypeKind::Func { ret, .. } => t = ret,
                _ => return t,
            }
        }
    }

    // --- declaration specifiers ------------------------------------------

    fn declspec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<TypeId, CompileError> {
        const VOID: u32 = 1 << 0;
        const BOOL: u32 = 1 << 2;
        const CHAR: u32 = 1 << 4;
        const SHORT: u32 = 1 << 6;
        const INT: u32 = 1 << 8;
        const LONG: u32 = 1 << 10;
        const FLOAT: u32 = 1 << 12;
        const DOUBLE: u32 = 1 << 14;
        const OTHER: u32 = 1 << 16;
        const SIGNED: u32 = 1 << 17;
        const UNSIGNED: u32 = 1 << 18;

        let mut counter: u32 = 0;
        let mut is_const = false;
        let mut is_atomic = false;
        let mut ty = self.cc.types.ty_int;
        let start_loc = self.loc();

        while self.is_typename(self.tok()) {
            let text = self.tok().text.clone();

            // Storage classes and function specifiers.
            if matches!(
                text.as_str(),
                "typedef" | "static" | "extern" | "inline" | "__inline" | "_Thread_local"
                    | "_Noreturn" | "register" | "auto"
            ) {
                let tok_loc = self.loc();
                self.advance();
                match attr.as_deref_mut() {
                    Some(a) => match text.as_str() {
                        "typedef" => a.is_typedef = true,
                        "static" => a.is_static = true,
                        "extern" => a.is_extern = true,
                        "inline" | "__inline" => a.is_inline = true,
                        _ => {}
                    },
                    None if matches!(text.as_str(), "typedef" | "static" | "extern") => {
                        return Err(self.error_at(
                            tok_loc,
                            "storage class specifier is not allowed in this context",
                        ));
                    }
                    None => {}
                }
                continue;
            }

            if matches!(
                text.as_str(),
                "const" | "volatile" | "restrict" | "__restrict" | "__restrict__"
            ) {
                if text == "const" {
                    is_const = true;
                }
                self.advance();
                continue;
            }

            if text == "_Atomic" {
                self.advance();
                // _Atomic "(" typename ")" is a type specifier.
                if self.eat("(") {
                    ty = self.typename()?;
                    self.expect(")")?;
                    counter |= OTHER;
                }
                is_atomic = true;
                continue;
            }

            if text == "_Alignas" {
                self.advance();
                self.expect("(")?;
                let align = if self.is_typename(self.tok()) {
                    let t = self.typename()?;
                    self.cc.types.get(t).align
                } else {
                    let mut e = self.conditional()?;
                    add_type(self.cc, &mut e);
                    eval_const(self.cc, &e)
                        .map_err(|_| self.error_here("alignment must be constant"))?
                };
                self.expect(")")?;
                if let Some(a) = attr.as_deref_mut() {
                    a.align = Some(align);
                }
                continue;
            }

            if text == "struct" || text == "union" {
                ty = self.struct_union_decl(text == "union")?;
                counter |= OTHER;
                continue;
            }
            if text == "enum" {
                ty = self.enum_specifier()?;
                counter |= OTHER;
                continue;
            }
            if text == "typeof" || text == "typeof_unqual" {
                self.advance();
                self.expect("(")?;
                ty = if self.is_typename(self.tok()) {
                    self.typename()?
                } else {
                    let mut e = self.expr()?;
                    add_type(self.cc, &mut e);
                    e.ty.unwrap()
                };
                self.expect(")")?;
                counter |= OTHER;
                continue;
            }
            if let Some(t) = self.typedef_of(self.tok()) {
                if counter != 0 {
                    break;
                }
                self.advance();
                ty = t;
                counter |= OTHER;
                continue;
            }

            self.advance();
            counter += match text.as_str() {
                "void" => VOID,
                "_Bool" | "bool" => BOOL,
                "char" => CHAR,
                "short" => SHORT,
                "int" => INT,
                "long" => LONG,
                "float" => FLOAT,
                "double" => DOUBLE,
                "signed" => SIGNED,
                "unsigned" => UNSIGNED,
                _ => 0,
            };

            let t = &self.cc.types;
            ty = match counter & !(SIGNED | UNSIGNED) {
                0 if counter & UNSIGNED != 0 => t.ty_uint,
                0 => t.ty_int,
                VOID => t.ty_void,
                BOOL => t.ty_bool,
                CHAR => {
                    if counter & UNSIGNED != 0 {
                        t.ty_uchar
                    } else {
                        t.ty_char
                    }
                }
                x if x == SHORT || x == SHORT + INT => {
                    if counter & UNSIGNED != 0 {
                        t.ty_ushort
                    } else {
                        t.ty_short
                    }
                }
                INT => {
                    if counter & UNSIGNED != 0 {
                        t.ty_uint
                    } else {
                        t.ty_int
                    }
                }
                x if x == LONG || x == LONG + INT || x == LONG + LONG || x == LONG + LONG + INT => {
                    if counter & UNSIGNED != 0 {
                        t.ty_ulong
                    } else {
                        t.ty_long
                    }
                }
                FLOAT => t.ty_float,
                DOUBLE => t.ty_double,
                x if x == LONG + DOUBLE => t.ty_ldouble,
                _ => {
                    return Err(self.error_at(start_loc, "invalid type specifier combination"));
                }
            };
        }

        if is_const || is_atomic {
            let new = self.cc.types.copy_type(ty);
            {
                let t = self.cc.types.get_mut(new);
                t.is_const = is_const;
                t.is_atomic = is_atomic;
                t.origin = Some(ty);
            }
            ty = new;
        }
        Ok(ty)
    }

    fn typename(&mut self) -> Result<TypeId, CompileError> {
        let base = self.declspec(None)?;
        let d = self.abstract_declarator(base)?;
        Ok(d)
    }

    // --- declarators ----------------------------------------------------

    fn pointers(&mut self, mut ty: TypeId) -> Result<TypeId, CompileError> {
        while self.eat("*") {
            ty = self.cc.types.pointer_to(ty);
            let mut is_const = false;
            while matches!(
                self.tok().text.as_str(),
                "const" | "volatile" | "restrict" | "__restrict" | "__restrict__" | "_Atomic"
            ) && self.tok().kind == TokenKind::Ident
            {
                if self.tok().is("const") {
                    is_const = true;
                }
                self.advance();
            }
            if is_const {
                self.cc.types.get_mut(ty).is_const = true;
            }
        }
        Ok(ty)
    }

    fn declarator(&mut self, base: TypeId) -> Result<Declarator, CompileError> {
        let ty = self.pointers(base)?;

        if self.tok().is("(") && !self.is_typename(self.la(1)) && !self.la(1).is(")") {
            // Nested declarator: find its end, build the outer suffix, then
            // re-parse the inside against the full type.
            let inner_start = self.pos + 1;
            self.advance();
            let placeholder = self.cc.types.ty_int;
            let _ = self.declarator(placeholder)?;
            self.expect(")")?;
            let (outer, _) = self.type_suffix(ty)?;
            let end = self.pos;
            self.pos = inner_start;
            let d = self.declarator(outer)?;
            self.pos = end;
            return Ok(d);
        }

        let name = if self.tok().kind == TokenKind::Ident && !self.is_typename(self.tok()) {
            Some(self.advance())
        } else {
            None
        };
        let (ty, fn_params) = self.type_suffix(ty)?;
        Ok(Declarator {
            ty,
            name,
            fn_params,
        })
    }

    fn abstract_declarator(&mut self, base: TypeId) -> Result<TypeId, CompileError> {
        let d = self.declarator(base)?;
        if let Some(name) = d.name {
            return Err(self.error_at(Some(name.loc), "unexpected identifier in type name"));
        }
        Ok(d.ty)
    }

    fn type_suffix(&mut self, ty: TypeId) -> Result<(TypeId, Vec<ParamDecl>), CompileError> {
        if self.tok().is("(") {
            self.advance();
            return self.func_params(ty);
        }
        if self.tok().is("[") {
            self.advance();
            return Ok((self.array_suffix(ty)?, Vec::new()));
        }
        Ok((ty, Vec::new()))
    }

    fn array_suffix(&mut self, base: TypeId) -> Result<TypeId, CompileError> {
        // C11 allows static and qualifiers inside parameter array brackets.
        while matches!(
            self.tok().text.as_str(),
            "static" | "const" | "volatile" | "restrict" | "__restrict"
        ) && self.tok().kind == TokenKind::Ident
        {
            self.advance();
        }
        if self.eat("]") {
            let (inner, _) = self.type_suffix(base)?;
            return Ok(self.cc.types.array_of(inner, -1));
        }
        let loc = self.loc();
        let mut len_expr = self.conditional()?;
        add_type(self.cc, &mut len_expr);
        self.expect("]")?;
        let (inner, _) = self.type_suffix(base)?;
        match eval_const(self.cc, &len_expr) {
            Ok(len) => {
                if len < 0 {
                    return Err(self.error_at(loc, "array size must be non-negative"));
                }
                Ok(self.cc.types.array_of(inner, len))
            }
            Err(_) => {
                // Runtime length: a variable-length array.
                if self.cc.types.is_vla(inner)
                    || matches!(self.cc.types.get(inner).kind, TypeKind::Array { .. })
                {
                    return Err(self.error_at(
                        loc,
                        "variable-length arrays of arrays are not supported",
                    ));
                }
                let vla = self.cc.types.vla_of(inner);
                self.vla_lens.insert(vla, len_expr);
                Ok(vla)
            }
        }
    }

    fn func_params(&mut self, ret: TypeId) -> Result<(TypeId, Vec<ParamDecl>), CompileError> {
        let mut params: Vec<ParamDecl> = Vec::new();
        let mut is_variadic = false;
        if self.tok().is("void") && self.la(1).is(")") {
            self.advance();
            self.advance();
        } else {
            while !self.eat(")") {
                if !params.is_empty() {
                    self.expect(",")?;
                }
                if self.eat("...") {
                    is_variadic = true;
                    self.expect(")")?;
                    break;
                }
                let base = self.declspec(None)?;
                let d = self.declarator(base)?;
                let mut ty = d.ty;
                // Arrays and functions decay in parameter position.
                match self.cc.types.get(ty).kind {
                    TypeKind::Array { base, .. } | TypeKind::Vla { base, .. } => {
                        ty = self.cc.types.pointer_to(base);
                    }
                    TypeKind::Func { .. } => {
                        ty = self.cc.types.pointer_to(ty);
                    }
                    _ => {}
                }
                params.push(ParamDecl { ty, name: d.name });
            }
        }
        let param_tys: Vec<TypeId> = params.iter().map(|p| p.ty).collect();
        let fty = self.cc.types.func_type(ret, param_tys, is_variadic);
        Ok((fty, params))
    }

    // --- struct/union/enum ----------------------------------------------

    fn struct_union_decl(&mut self, is_union: bool) -> Result<TypeId, CompileError> {
        self.advance(); // struct | union
        let tag = if self.tok().kind == TokenKind::Ident && !self.tok().is("{") {
            Some(self.advance())
        } else {
            None
        };

        if let Some(tag) = &tag {
            if !self.tok().is("{") {
                if let Some(t) = self.lookup_tag(&tag.text) {
                    return Ok(t);
                }
                let t = self.cc.types.struct_type(is_union);
                self.cc.types.get_mut(t).kind = TypeKind::Struct {
                    members: Vec::new(),
                    tag: Some(tag.text.clone()),
                    is_union,
                    is_flexible: false,
                    is_complete: false,
                };
                self.bind_tag(&tag.text, t);
                return Ok(t);
            }
        }

        // Definition with a member list. Reuse an incomplete tag declared in
        // this scope so existing pointers complete in place.
        let ty = match tag
            .as_ref()
            .and_then(|t| self.lookup_tag_current(&t.text))
        {
            Some(existing) => {
                let complete = match &self.cc.types.get(existing).kind {
                    TypeKind::Struct { is_complete, .. } => *is_complete,
                    _ => true,
                };
                if complete {
                    return Err(self.error_here(format!(
                        "redefinition of '{}'",
                        tag.as_ref().unwrap().text
                    )));
                }
                existing
            }
            None => {
                let t = self.cc.types.struct_type(is_union);
                if let Some(tag) = &tag {
                    self.bind_tag(&tag.text, t);
                }
                t
            }
        };

        self.expect("{")?;
        let (members, is_flexible) = self.struct_members(is_union)?;
        self.layout_struct(ty, members, is_union, is_flexible, tag.map(|t| t.text));
        Ok(ty)
    }

    fn struct_members(
        &mut self,
        is_union: bool,
    ) -> Result<(Vec<Member>, bool), CompileError> {
        let mut members: Vec<Member> = Vec::new();
        let mut is_flexible = false;
        while !self.eat("}") {
            if self.tok().is("_Static_assert") || self.tok().is("static_assert") {
                self.static_assert()?;
                continue;
            }
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            // Anonymous struct or union member: `struct { ... };`.
            if self.tok().is(";")
                && matches!(self.cc.types.get(basety).kind, TypeKind::Struct { .. })
            {
                self.advance();
                members.push(Member {
                    name: None,
                    ty: basety,
                    loc: self.loc(),
                    offset: 0,
                    align: self.cc.types.get(basety).align,
                    is_bitfield: false,
                    bit_offset: 0,
                    bit_width: 0,
                });
                continue;
            }

            let mut first = true;
            while !self.eat(";") {
                if !first {
                    self.expect(",")?;
                }
                first = false;

                // Unnamed bitfield.
                if self.tok().is(":") {
                    self.advance();
                    let mut w = self.conditional()?;
                    add_type(self.cc, &mut w);
                    let width = eval_const(self.cc, &w)
                        .map_err(|_| self.error_here("bitfield width must be constant"))?;
                    members.push(Member {
                        name: None,
                        ty: basety,
                        loc: self.loc(),
                        offset: 0,
                        align: self.cc.types.get(basety).align,
                        is_bitfield: true,
                        bit_offset: 0,
                        bit_width: width,
                    });
                    continue;
                }

                let d = self.declarator(basety)?;
                let name = d.name.as_ref().map(|t| t.text.clone());
                let mut m = Member {
                    name,
                    ty: d.ty,
                    loc: d.name.as_ref().map(|t| t.loc),
                    offset: 0,
                    align: attr
                        .align
                        .unwrap_or_else(|| self.cc.types.get(d.ty).align),
                    is_bitfield: false,
                    bit_offset: 0,
                    bit_width: 0,
                };
                if self.eat(":") {
                    let mut w = self.conditional()?;
                    add_type(self.cc, &mut w);
                    let width = eval_const(self.cc, &w)
                        .map_err(|_| self.error_here("bitfield width must be constant"))?;
                    let tsize = self.cc.types.get(d.ty).size * 8;
                    if width < 0 || width > tsize {
                        return Err(self.error_here("invalid bitfield width"));
                    }
                    m.is_bitfield = true;
                    m.bit_width = width;
                }
                // A trailing incomplete array is a flexible array member.
                if let TypeKind::Array { len: -1, .. } = self.cc.types.get(d.ty).kind {
                    if self.tok().is(";") && self.la(1).is("}") && !is_union {
                        is_flexible = true;
                    }
                }
                members.push(m);
            }
        }
        Ok((members, is_flexible))
    }

    fn layout_struct(
        &mut self,
        ty: TypeId,
        mut members: Vec<Member>,
        is_union: bool,
        is_flexible: bool,
        tag: Option<String>,
    ) {
        let mut bits: i64 = 0;
        let mut align: i64 = 1;
        let mut max_size: i64 = 0;
        for m in members.iter_mut() {
            let msize = self.cc.types.get(m.ty).size.max(0);
            if is_union {
                m.offset = 0;
                align = align.max(m.align);
                let sz = if m.is_bitfield {
                    (m.bit_width + 7) / 8
                } else {
                    msize
                };
                max_size = max_size.max(sz);
                continue;
            }
            if m.is_bitfield {
                let unit = self.cc.types.get(m.ty).size * 8;
                if m.bit_width == 0 {
                    // Zero-width bitfields force unit alignment.
                    bits = align_to(bits, unit);
                    continue;
                }
                if bits / unit != (bits + m.bit_width - 1) / unit {
                    bits = align_to(bits, unit);
                }
                m.offset = bits / 8 / (unit / 8) * (unit / 8);
                m.bit_offset = bits % unit;
                bits += m.bit_width;
                align = align.max(m.align);
            } else {
                align = align.max(m.align);
                bits = align_to(bits, m.align * 8);
                m.offset = bits / 8;
                bits += msize * 8;
            }
        }
        let size = if is_union {
            align_to(max_size, align)
        } else {
            align_to(bits, align * 8) / 8
        };
        let t = self.cc.types.get_mut(ty);
        t.kind = TypeKind::Struct {
            members,
            tag,
            is_union,
            is_flexible,
            is_complete: true,
        };
        t.size = size;
        t.align = align;
    }

    fn enum_specifier(&mut self) -> Result<TypeId, CompileError> {
        self.advance(); // enum
        let tag = if self.tok().kind == TokenKind::Ident && !self.tok().is("{") {
            Some(self.advance())
        } else {
            None
        };
        if let Some(tag) = &tag {
            if !self.tok().is("{") {
                return self
                    .lookup_tag(&tag.text)
                    .ok_or_else(|| self.error_here(format!("unknown enum type '{}'", tag.text)));
            }
        }
        self.expect("{")?;
        let ty = self.cc.types.enum_type();
        let mut val: i64 = 0;
        let mut first = true;
        while !self.eat("}") {
            if !first {
                self.expect(",")?;
                if self.eat("}") {
                    break;
                }
            }
            first = false;
            let name = self.advance();
            if name.kind != TokenKind::Ident {
                return Err(self.error_at(Some(name.loc), "enumerator name expected"));
            }
            if self.eat("=") {
                let mut e = self.conditional()?;
                add_type(self.cc, &mut e);
                val = eval_const(self.cc, &e)
                    .map_err(|_| self.error_here("enum value must be constant"))?;
            }
            self.bind(&name.text, ScopeEntry::EnumConst { ty, val });
            val += 1;
        }
        if let Some(tag) = &tag {
            self.bind_tag(&tag.text, ty);
        }
        Ok(ty)
    }

    // --- statements -------------------------------------------------------

    pub(crate) fn compound_stmt(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();
        let mut body: Vec<Node> = Vec::new();
        self.enter_scope();
        while !self.tok().is("}") {
            if self.at_eof() {
                self.leave_scope();
                return Err(self.error_here("unexpected end of file, expected '}'"));
            }
            let start = self.pos;
            let result = self.block_item(&mut body);
            match result {
                Ok(()) => {}
                Err(e @ CompileError::Parse { .. }) if self.cc.options.collect_errors => {
                    self.cc.diags.error(e.loc(), e.message());
                    self.resync_stmt();
                    if self.pos == start && !self.at_eof() && !self.tok().is("}") {
                        self.advance();
                    }
                    body.push(Node::error(loc));
                }
                Err(e) => {
                    self.leave_scope();
                    return Err(e);
                }
            }
        }
        self.advance(); // }
        self.leave_scope();
        Ok(Node::new(NodeKind::Block { body }, loc))
    }

    /// Skip to a statement boundary: past the next `;`, or up to a `}` or a
    /// statement keyword.
    fn resync_stmt(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            let t = self.tok();
            if depth == 0 {
                if t.is(";") {
                    self.advance();
                    return;
                }
                if t.is("}") {
                    return;
                }
                if t.kind == TokenKind::Ident && STMT_KEYWORDS.contains(&t.text.as_str()) {
                    return;
                }
            }
            if t.is("{") {
                depth += 1;
            } else if t.is("}") {
                depth = depth.saturating_sub(1);
            }
            self.advance();
        }
    }

    fn block_item(&mut self, body: &mut Vec<Node>) -> Result<(), CompileError> {
        if self.tok().is("_Static_assert") || self.tok().is("static_assert") {
            return self.static_assert();
        }
        if self.is_typename(self.tok()) && !self.la(1).is(":") {
            self.declaration(body)?;
            return Ok(());
        }
        let mut node = self.stmt()?;
        add_type(self.cc, &mut node);
        body.push(node);
        Ok(())
    }

    fn declaration(&mut self, body: &mut Vec<Node>) -> Result<(), CompileError> {
        let mut attr = VarAttr::default();
        let basety = self.declspec(Some(&mut attr))?;
        if attr.is_typedef {
            return self.parse_typedef(basety);
        }
        let mut first = true;
        while !self.eat(";") {
            if !first {
                self.expect(",")?;
            }
            first = false;

            let decl = self.declarator(basety)?;
            let Some(name_tok) = &decl.name else {
                return Err(self.error_here("variable name omitted"));
            };
            let name = name_tok.text.clone();
            let loc = Some(name_tok.loc);

            if self.cc.types.is_void(decl.ty) {
                return Err(self.error_at(loc, "variable declared void"));
            }

            if attr.is_extern || matches!(self.cc.types.get(decl.ty).kind, TypeKind::Func { .. })
            {
                // Local extern declaration or function declaration: file
                // scope object, block-scope name.
                let mut obj = Obj::new(&name, decl.ty);
                obj.is_function = self.cc.types.is_func(decl.ty);
                obj.loc = loc;
                let id = self.cc.objs.alloc(obj);
                self.globals.push(id);
                self.bind(&name, ScopeEntry::Var(id));
                continue;
            }

            if attr.is_static {
                // Block-scope static: an anonymous global bound to the name.
                let unique = self.cc.new_unique_name("static");
                let mut obj = Obj::new(&unique, decl.ty);
                obj.is_definition = true;
                obj.is_static = true;
                obj.loc = loc;
                let id = self.cc.objs.alloc(obj);
                self.globals.push(id);
                self.bind(&name, ScopeEntry::Var(id));
                if self.eat("=") {
                    init::gvar_initializer(self, id)?;
                }
                continue;
            }

            if self.cc.types.is_vla(decl.ty) {
                // Evaluate the length now, allocate storage, remember the
                // byte size in a hidden local for sizeof.
                let len = self
                    .vla_lens
                    .remove(&decl.ty)
                    .ok_or_else(|| self.error_at(loc, "missing length for variable-length array"))?;
                let ulong = self.cc.types.ty_ulong;
                let size_var = self.new_anon_lvar(ulong);
                if let TypeKind::Vla { size_var: sv, .. } =
                    &mut self.cc.types.get_mut(decl.ty).kind
                {
                    *sv = Some(size_var);
                }
                let id = self.new_lvar(&name, decl.ty);
                let elem_size = {
                    let base = self.cc.types.base_of(decl.ty).unwrap();
                    self.cc.types.get(base).size
                };
                let ty_long = self.cc.types.ty_long;
                let len_cast = new_cast(self.cc, len, ty_long);
                let mut size_expr = Node::new(
                    NodeKind::Binary {
                        op: crate::ast::BinOp::Mul,
                        lhs: Box::new(len_cast),
                        rhs: Box::new(Node::typed(
                            NodeKind::Num { val: elem_size },
                            ty_long,
                            loc,
                        )),
                    },
                    loc,
                );
                add_type(self.cc, &mut size_expr);
                let mut alloc = Node::new(
                    NodeKind::VlaAlloc {
                        var: id,
                        size: Box::new(size_expr),
                    },
                    loc,
                );
                add_type(self.cc, &mut alloc);
                body.push(alloc);
                if self.tok().is("=") {
                    return Err(self.error_here("variable-length array cannot be initialized"));
                }
                continue;
            }

            if self.cc.types.get(decl.ty).size < 0 {
                return Err(self.error_at(loc, "variable has incomplete type"));
            }

            let id = self.new_lvar(&name, decl.ty);
            if self.eat("=") {
                let chain = init::lvar_initializer(self, id)?;
                body.push(chain);
            } else if self.cc.options.sanitizers.uninit_detection {
                // Leave the slot unmarked so reads before writes diagnose.
            }
        }
        Ok(())
    }

    fn stmt(&mut self) -> Result<Node, CompileError> {
        let loc = self.loc();

        if self.tok().is("return") {
            self.advance();
            if self.eat(";") {
                return Ok(Node::new(NodeKind::Return { expr: None }, loc));
            }
            let mut e = self.expr()?;
            add_type(self.cc, &mut e);
            self.expect(";")?;
            let ret = self.cur_fn_ret.unwrap();
            let e = if self.cc.types.is_struct_or_union(ret)
                || self.cc.types.is_error(e.ty.unwrap())
                || self.cc.types.is_void(ret)
            {
                e
            } else {
                new_cast(self.cc, e, ret)
            };
            return Ok(Node::new(
                NodeKind::Return {
                    expr: Some(Box::new(e)),
                },
                loc,
            ));
        }

        if self.tok().is("if") {
            self.advance();
            self.expect("(")?;
            let mut cond = self.expr()?;
            add_type(self.cc, &mut cond);
            self.expect(")")?;
            let then_stmt = Box::new(self.stmt()?);
            let else_stmt = if self.eat("else") {
                Some(Box::new(self.stmt()?))
            } else {
                None
            };
            return Ok(Node::new(
                NodeKind::If {
                    cond: Box::new(cond),
                    then_stmt,
                    else_stmt,
                },
                loc,
            ));
        }

        if self.tok().is("switch") {
            self.advance();
            self.expect("(")?;
            let mut cond = self.expr()?;
            add_type(self.cc, &mut cond);
            self.expect(")")?;
            let brk = self.cc.new_unique_name("brk");
            let saved_brk = self.brk_label.replace(brk.clone());
            let saved_switch = self.switch.replace(SwitchCtx {
                cases: Vec::new(),
                default_label: None,
                brk_label: brk.clone(),
            });
            let body = Box::new(self.stmt()?);
            let ctx = self.switch.take().unwrap();
            self.switch = saved_switch;
            self.brk_label = saved_brk;
            return Ok(Node::new(
                NodeKind::Switch {
                    cond: Box::new(cond),
                    body,
                    cases: ctx.cases,
                    default_label: ctx.default_label,
                    brk_label: brk,
                },
                loc,
            ));
        }

        if self.tok().is("case") {
            self.advance();
            let mut lo_expr = self.conditional()?;
            add_type(self.cc, &mut lo_expr);
            let lo = eval_const(self.cc, &lo_expr)
                .map_err(|_| self.error_at(loc, "case label must be constant"))?;
            // GNU case ranges: case 1 ... 5:
            let hi = if self.eat("...") {
                let mut hi_expr = self.conditional()?;
                add_type(self.cc, &mut hi_expr);
                eval_const(self.cc, &hi_expr)
                    .map_err(|_| self.error_at(loc, "case label must be constant"))?
            } else {
                lo
            };
            self.expect(":")?;
            let label = self.cc.new_unique_name("case");
            match &mut self.switch {
                Some(ctx) => ctx.cases.push(CaseLabel {
                    label: label.clone(),
                    lo,
                    hi,
                }),
                None => return Err(self.error_at(loc, "case label not within a switch")),
            }
            let body = Box::new(self.stmt()?);
            return Ok(Node::new(NodeKind::Case { label, body }, loc));
        }

        if self.tok().is("default") {
            self.advance();
            self.expect(":")?;
            let label = self.cc.new_unique_name("default");
            match &mut self.switch {
                Some(ctx) => {
                    if ctx.default_label.is_some() {
                        return Err(self.error_at(loc, "multiple default labels in one switch"));
                    }
                    ctx.default_label = Some(label.clone());
                }
                None => return Err(self.error_at(loc, "default label not within a switch")),
            }
            let body = Box::new(self.stmt()?);
            return Ok(Node::new(NodeKind::Case { label, body }, loc));
        }

        if self.tok().is("for") {
            self.advance();
            self.expect("(")?;
            self.enter_scope();
            let mut init_items: Vec<Node> = Vec::new();
            if !self.eat(";") {
                if self.is_typename(self.tok()) {
                    self.declaration(&mut init_items)?;
                } else {
                    let mut e = self.expr()?;
                    add_type(self.cc, &mut e);
                    init_items.push(Node::new(
                        NodeKind::ExprStmt { expr: Box::new(e) },
                        loc,
                    ));
                    self.expect(";")?;
                }
            }
            let cond = if self.tok().is(";") {
                None
            } else {
                let mut e = self.expr()?;
                add_type(self.cc, &mut e);
                Some(Box::new(e))
            };
            self.expect(";")?;
            let inc = if self.tok().is(")") {
                None
            } else {
                let mut e = self.expr()?;
                add_type(self.cc, &mut e);
                Some(Box::new(e))
            };
            self.expect(")")?;

            let brk = self.cc.new_unique_name("brk");
            let cont = self.cc.new_unique_name("cont");
            let saved_brk = self.brk_label.replace(brk.clone());
            let saved_cont = self.cont_label.replace(cont.clone());
            let body = Box::new(self.stmt()?);
            self.brk_label = saved_brk;
            self.cont_label = saved_cont;
            self.leave_scope();

            let init = if init_items.is_empty() {
                None
            } else {
                Some(Box::new(Node::new(
                    NodeKind::Block { body: init_items },
                    loc,
                )))
            };
            return Ok(Node::new(
                NodeKind::For {
                    init,
                    cond,
                    inc,
                    body,
                    brk_label: brk,
                    cont_label: cont,
                },
                loc,
            ));
        }

        if self.tok().is("while") {
            self.advance();
            self.expect("(")?;
            let mut cond = self.expr()?;
            add_type(self.cc, &mut cond);
            self.expect(")")?;
            let brk = self.cc.new_unique_name("brk");
            let cont = self.cc.new_unique_name("cont");
            let saved_brk = self.brk_label.replace(brk.clone());
            let saved_cont = self.cont_label.replace(cont.clone());
            let body = Box::new(self.stmt()?);
            self.brk_label = saved_brk;
            self.cont_label = saved_cont;
            return Ok(Node::new(
                NodeKind::For {
                    init: None,
                    cond: Some(Box::new(cond)),
                    inc: None,
                    body,
                    brk_label: brk,
                    cont_label: cont,
                },
                loc,
            ));
        }

        if self.tok().is("do") {
            self.advance();
            let brk = self.cc.new_unique_name("brk");
            let cont = self.cc.new_unique_name("cont");
            let saved_brk = self.brk_label.replace(brk.clone());
            let saved_cont = self.cont_label.replace(cont.clone());
            let body = Box::new(self.stmt()?);
            self.brk_label = saved_brk;
            self.cont_label = saved_cont;
            self.expect("while")?;
            self.expect("(")?;
            let mut cond = self.expr()?;
            add_type(self.cc, &mut cond);
            self.expect(")")?;
            self.expect(";")?;
            return Ok(Node::new(
                NodeKind::DoWhile {
                    body,
                    cond: Box::new(cond),
                    brk_label: brk,
                    cont_label: cont,
                },
                loc,
            ));
        }

        if self.tok().is("goto") {
            self.advance();
            // Computed goto: goto *expr;
            if self.eat("*") {
                let mut e = self.unary()?;
                add_type(self.cc, &mut e);
                self.expect(";")?;
                return Ok(Node::new(
                    NodeKind::GotoExpr { expr: Box::new(e) },
                    loc,
                ));
            }
            let name = self.advance();
            if name.kind != TokenKind::Ident {
                return Err(self.error_at(Some(name.loc), "label name expected after goto"));
            }
            self.expect(";")?;
            return Ok(Node::new(
                NodeKind::Goto {
                    label: format!("u.{}", name.text),
                },
                loc,
            ));
        }

        if self.tok().is("break") {
            self.advance();
            self.expect(";")?;
            let label = self
                .brk_label
                .clone()
                .ok_or_else(|| self.error_at(loc, "stray break statement"))?;
            return Ok(Node::new(NodeKind::Goto { label }, loc));
        }

        if self.tok().is("continue") {
            self.advance();
            self.expect(";")?;
            let label = self
                .cont_label
                .clone()
                .ok_or_else(|| self.error_at(loc, "stray continue statement"))?;
            return Ok(Node::new(NodeKind::Goto { label }, loc));
        }

        // Inline assembly is parsed, then discarded.
        if self.tok().is("asm") || self.tok().is("__asm__") {
            self.advance();
            while matches!(self.tok().text.as_str(), "volatile" | "inline") {
                self.advance();
            }
            self.expect("(")?;
            let mut text = String::new();
            let mut depth = 1usize;
            while depth > 0 && !self.at_eof() {
                let t = self.advance();
                if t.is("(") {
                    depth += 1;
                } else if t.is(")") {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                text.push_str(&t.text);
            }
            self.expect(";")?;
            return Ok(Node::new(NodeKind::Asm { text }, loc));
        }

        // Labeled statement.
        if self.tok().kind == TokenKind::Ident && self.la(1).is(":") {
            let name = self.advance();
            self.advance(); // :
            let body = Box::new(self.stmt()?);
            return Ok(Node::new(
                NodeKind::Label {
                    label: format!("u.{}", name.text),
                    body,
                },
                loc,
            ));
        }

        if self.tok().is("{") {
            self.advance();
            return self.compound_stmt();
        }

        if self.eat(";") {
            return Ok(Node::new(NodeKind::Block { body: Vec::new() }, loc));
        }

        let mut e = self.expr()?;
        add_type(self.cc, &mut e);
        self.expect(";")?;
        Ok(Node::new(NodeKind::ExprStmt { expr: Box::new(e) }, loc))
    }
}
