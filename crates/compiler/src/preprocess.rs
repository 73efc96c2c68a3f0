//! Preprocessor.
//!
//! Macro expansion follows the hideset algorithm: every token carries the
//! set of macro names that already expanded it, expansion adds the macro's
//! name to each produced token, and a token whose hideset contains a macro's
//! name is never expanded by it again. That single rule makes recursive
//! macro graphs terminate. For a function-like expansion the new hideset is
//! the intersection of the macro token's and the closing parenthesis's
//! hidesets, union the macro name.
//!
//! Expansion output is pushed back onto the input so it is rescanned, which
//! is what nested macro calls require. Directives are only recognized on a
//! `#` that is the first token of its physical line.

use crate::error::CompileError;
use crate::lexer;
use crate::token::{
    hideset_add, hideset_contains, hideset_intersection, hideset_union, Origin, StrEncoding,
    Token, TokenKind, TokenValue,
};
use crate::Compiler;
use cvm_core::source::Loc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone)]
pub(crate) enum MacroBody {
    ObjLike(Vec<Token>),
    FuncLike {
        params: Vec<String>,
        /// Name bound to the trailing `...` arguments (`__VA_ARGS__` for an
        /// anonymous rest parameter).
        va_name: Option<String>,
        body: Vec<Token>,
    },
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    File,
    Line,
    Counter,
    Date,
    Time,
    Timestamp,
    BaseFile,
}

#[derive(Debug, Clone)]
pub(crate) struct Macro {
    pub body: MacroBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondState {
    InThen,
    InElif,
    InElse,
}

struct CondFrame {
    state: CondState,
    /// Whether some branch of this conditional has been taken already.
    included: bool,
    loc: Loc,
}

pub struct Preprocessor<'a> {
    cc: &'a mut Compiler,
    /// Remaining input, reversed so the next token is at the end.
    input: Vec<Token>,
    out: Vec<Token>,
    cond_stack: Vec<CondFrame>,
    base_file: String,
}

impl<'a> Preprocessor<'a> {
    pub fn new(cc: &'a mut Compiler, tokens: Vec<Token>, base_file: String) -> Self {
        let mut input = tokens;
        input.reverse();
        Preprocessor {
            cc,
            input,
            out: Vec::new(),
            cond_stack: Vec::new(),
            base_file,
        }
    }

    fn err(&self, loc: Option<Loc>, msg: impl Into<String>) -> CompileError {
        CompileError::Preprocess {
            loc,
            msg: msg.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        self.input.pop()
    }

    fn peek(&self) -> Option<&Token> {
        self.input.last()
    }

    /// Remaining tokens of the current directive line.
    fn read_line(&mut self) -> Vec<Token> {
        let mut line = Vec::new();
        while let Some(tok) = self.peek() {
            if tok.at_bol || tok.is_eof() {
                break;
            }
            line.push(self.input.pop().unwrap());
        }
        line
    }

    fn push_tokens(&mut self, tokens: Vec<Token>) {
        for tok in tokens.into_iter().rev() {
            self.input.push(tok);
        }
    }

    // --- main loop ------------------------------------------------------

    pub fn run(mut self) -> Result<Vec<Token>, CompileError> {
        while let Some(tok) = self.next() {
            if tok.is_eof() {
                if self.input.is_empty() {
                    self.out.push(tok);
                    break;
                }
                // End of an included file; keep going in the includer.
                continue;
            }
            if tok.at_bol && tok.is("#") {
                self.directive(&tok)?;
                continue;
            }
            if tok.kind == TokenKind::Ident && self.try_expand(&tok)? {
                continue;
            }
            self.out.push(tok);
        }
        if let Some(frame) = self.cond_stack.last() {
            return Err(self.err(Some(frame.loc), "unterminated conditional directive"));
        }
        let mut out = self.out;
        lexer::convert_pp_tokens(&mut out)?;
        join_adjacent_string_literals(&mut out)?;
        Ok(out)
    }

    // --- macro expansion ------------------------------------------------

    fn try_expand(&mut self, tok: &Token) -> Result<bool, CompileError> {
        if hideset_contains(&tok.hideset, &tok.text) {
            return Ok(false);
        }
        let Some(mac) = self.cc.macros.get(&tok.text).cloned() else {
            return Ok(false);
        };
        match mac.body {
            MacroBody::Builtin(builtin) => {
                let t = self.expand_builtin(builtin, tok)?;
                self.input.push(t);
                Ok(true)
            }
            MacroBody::ObjLike(body) => {
                let hs = hideset_add(tok.hideset.clone(), &tok.text);
                let mut result: Vec<Token> = body;
                for t in result.iter_mut() {
                    t.hideset = hideset_union(&t.hideset, &hs);
                    t.origin = Some(Rc::new(Origin {
                        macro_name: tok.text.clone(),
                        loc: tok.loc,
                        parent: t.origin.take(),
                    }));
                }
                if let Some(first) = result.first_mut() {
                    first.at_bol = tok.at_bol;
                    first.has_space = tok.has_space;
                }
                self.push_tokens(result);
                Ok(true)
            }
            MacroBody::FuncLike {
                params,
                va_name,
                body,
            } => {
                // Only a call-shaped use expands.
                if !self.peek().is_some_and(|t| t.is("(")) {
                    return Ok(false);
                }
                self.next(); // '('
                let (args, rparen) = self.read_macro_args(tok, &params, va_name.as_deref())?;
                let substituted = self.subst(&body, &params, va_name.as_deref(), &args, tok)?;
                let hs = hideset_add(
                    hideset_intersection(&tok.hideset, &rparen.hideset),
                    &tok.text,
                );
                let mut result = substituted;
                for t in result.iter_mut() {
                    t.hideset = hideset_union(&t.hideset, &hs);
                    t.origin = Some(Rc::new(Origin {
                        macro_name: tok.text.clone(),
                        loc: tok.loc,
                        parent: t.origin.take(),
                    }));
                }
                if let Some(first) = result.first_mut() {
                    first.at_bol = tok.at_bol;
                    first.has_space = tok.has_space;
                }
                self.push_tokens(result);
                Ok(true)
            }
        }
    }

    fn expand_builtin(&mut self, builtin: Builtin, tok: &Token) -> Result<Token, CompileError> {
        let make_num = |val: i64, tok: &Token| {
            let mut t = Token::new(TokenKind::PpNum, val.to_string(), tok.loc);
            t.at_bol = tok.at_bol;
            t.has_space = tok.has_space;
            t
        };
        let make_str = |text: &str, tok: &Token| {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            let mut t = Token::new(TokenKind::Str, format!("\"{}\"", text), tok.loc);
            t.value = TokenValue::Str {
                bytes,
                enc: StrEncoding::Narrow,
            };
            t.at_bol = tok.at_bol;
            t.has_space = tok.has_space;
            t
        };
        // Inside a macro body, __FILE__ and __LINE__ refer to the outermost
        // expansion site, not the #define line.
        let mut loc = tok.loc;
        let mut origin = tok.origin.clone();
        while let Some(o) = origin {
            loc = o.loc;
            origin = o.parent.clone();
        }
        let file = self.cc.files.get(loc.file_no as usize);
        Ok(match builtin {
            Builtin::File => {
                let name = file.map(|f| f.display_name.clone()).unwrap_or_default();
                make_str(&name, tok)
            }
            Builtin::BaseFile => make_str(&self.base_file.clone(), tok),
            Builtin::Line => {
                let delta = file.map(|f| f.line_delta).unwrap_or(0);
                make_num(loc.line as i64 + delta, tok)
            }
            Builtin::Counter => {
                let n = self.cc.counter;
                self.cc.counter += 1;
                make_num(n as i64, tok)
            }
            Builtin::Date => make_str(&format_date(now_secs()), tok),
            Builtin::Time => make_str(&format_time(now_secs()), tok),
            Builtin::Timestamp => {
                make_str(&format!("{} {}", format_date(now_secs()), format_time(now_secs())), tok)
            }
        })
    }

    /// Read the arguments of a function-like macro call. The opening paren
    /// has been consumed; returns the arguments and the closing paren.
    fn read_macro_args(
        &mut self,
        macro_tok: &Token,
        params: &[String],
        va_name: Option<&str>,
    ) -> Result<(HashMap<String, Vec<Token>>, Token), CompileError> {
        let mut raw_args: Vec<Vec<Token>> = Vec::new();
        let mut cur: Vec<Token> = Vec::new();
        let mut depth = 0usize;
        let rparen;
        loop {
            let Some(tok) = self.next() else {
                return Err(self.err(Some(macro_tok.loc), "unterminated macro call"));
            };
            if tok.is_eof() {
                return Err(self.err(Some(macro_tok.loc), "unterminated macro call"));
            }
            if depth == 0 && tok.is(")") {
                rparen = tok;
                break;
            }
            if depth == 0 && tok.is(",") {
                // Split while named parameters are still unfilled; once the
                // rest parameter starts, commas belong to __VA_ARGS__.
                let split = if va_name.is_some() {
                    raw_args.len() < params.len()
                } else if params.len() > 1 {
                    raw_args.len() < params.len() - 1
                } else {
                    false
                };
                if split {
                    raw_args.push(std::mem::take(&mut cur));
                    continue;
                }
                if va_name.is_none() {
                    return Err(self.err(Some(tok.loc), "too many arguments in macro call"));
                }
            }
            if tok.is("(") {
                depth += 1;
            } else if tok.is(")") {
                depth -= 1;
            }
            cur.push(tok);
        }
        if !cur.is_empty() || !raw_args.is_empty() || !params.is_empty() || va_name.is_some() {
            raw_args.push(cur);
        }

        let mut args: HashMap<String, Vec<Token>> = HashMap::new();
        if va_name.is_some() {
            // Named parameters first, the rest (with its commas) is variadic.
            if raw_args.len() < params.len() {
                raw_args.resize(params.len(), Vec::new());
            }
            let rest = if raw_args.len() > params.len() {
                // Re-join everything past the named parameters.
                let tail: Vec<Vec<Token>> = raw_args.split_off(params.len());
                let mut joined = Vec::new();
                for (i, mut part) in tail.into_iter().enumerate() {
                    if i > 0 {
                        let mut comma = Token::new(TokenKind::Punct, ",", macro_tok.loc);
                        comma.has_space = false;
                        joined.push(comma);
                    }
                    joined.append(&mut part);
                }
                joined
            } else {
                Vec::new()
            };
            args.insert(va_name.unwrap().to_string(), rest);
        } else if raw_args.len() < params.len() {
            raw_args.resize(params.len(), Vec::new());
        } else if raw_args.len() > params.len() {
            return Err(self.err(Some(macro_tok.loc), "too many arguments in macro call"));
        }
        for (name, arg) in params.iter().zip(raw_args.into_iter()) {
            args.insert(name.clone(), arg);
        }
        Ok((args, rparen))
    }

    /// Fully macro-expand a detached token sequence (used for macro
    /// arguments and `#if` lines).
    fn expand_tokens(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let saved_input = std::mem::take(&mut self.input);
        let saved_out = std::mem::take(&mut self.out);
        self.input = tokens;
        self.input.reverse();
        while let Some(tok) = self.next() {
            if tok.is_eof() {
                continue;
            }
            if tok.kind == TokenKind::Ident && self.try_expand(&tok)? {
                continue;
            }
            self.out.push(tok);
        }
        let result = std::mem::take(&mut self.out);
        self.input = saved_input;
        self.out = saved_out;
        Ok(result)
    }

    fn subst(
        &mut self,
        body: &[Token],
        params: &[String],
        va_name: Option<&str>,
        args: &HashMap<String, Vec<Token>>,
        macro_tok: &Token,
    ) -> Result<Vec<Token>, CompileError> {
        let is_param = |t: &Token| {
            t.kind == TokenKind::Ident
                && (params.contains(&t.text) || va_name == Some(t.text.as_str()))
        };
        let mut out: Vec<Token> = Vec::new();
        let mut i = 0;
        // Set when a parameter before `##` expanded to nothing; the paste
        // then degenerates to the raw right-hand side.
        let mut empty_lhs = false;
        while i < body.len() {
            let tok = &body[i];

            // Stringizing: # param
            if tok.is("#") {
                let Some(p) = body.get(i + 1).filter(|p| is_param(p)) else {
                    return Err(self.err(
                        Some(tok.loc),
                        "'#' is not followed by a macro parameter",
                    ));
                };
                out.push(self.stringize(&args[&p.text], tok)?);
                i += 2;
                continue;
            }

            // [GNU] ,##__VA_ARGS__ swallows the comma when empty.
            if tok.is(",")
                && body.get(i + 1).is_some_and(|t| t.is("##"))
                && body.get(i + 2).is_some_and(|t| {
                    va_name == Some(t.text.as_str()) && t.kind == TokenKind::Ident
                })
            {
                let va = &args[&body[i + 2].text];
                if !va.is_empty() {
                    out.push(tok.clone());
                    out.extend(va.iter().cloned());
                }
                i += 3;
                continue;
            }

            // __VA_OPT__(...) expands its group iff __VA_ARGS__ is non-empty.
            if tok.is_ident("__VA_OPT__") && body.get(i + 1).is_some_and(|t| t.is("(")) {
                let (group, after) = read_group(body, i + 1)
                    .ok_or_else(|| self.err(Some(tok.loc), "unterminated __VA_OPT__"))?;
                let va_nonempty = va_name
                    .and_then(|n| args.get(n))
                    .is_some_and(|a| !a.is_empty());
                if va_nonempty {
                    let inner = self.subst(group, params, va_name, args, macro_tok)?;
                    out.extend(inner);
                }
                i = after;
                continue;
            }

            // Token pasting.
            if tok.is("##") {
                let Some(rhs) = body.get(i + 1) else {
                    return Err(self.err(Some(tok.loc), "'##' cannot appear at end of macro body"));
                };
                let rhs_toks: Vec<Token> = if is_param(rhs) {
                    args[&rhs.text].clone()
                } else {
                    vec![rhs.clone()]
                };
                if rhs_toks.is_empty() {
                    empty_lhs = false;
                    i += 2;
                    continue;
                }
                if empty_lhs {
                    out.extend(rhs_toks);
                    empty_lhs = false;
                } else {
                    let lhs = out.pop().ok_or_else(|| {
                        self.err(Some(tok.loc), "'##' cannot appear at start of macro body")
                    })?;
                    let pasted = self.paste(&lhs, &rhs_toks[0])?;
                    out.push(pasted);
                    out.extend(rhs_toks.into_iter().skip(1));
                }
                i += 2;
                continue;
            }

            if is_param(tok) {
                if body.get(i + 1).is_some_and(|t| t.is("##")) {
                    // Operand of ## uses the raw argument.
                    let raw = &args[&tok.text];
                    if raw.is_empty() {
                        empty_lhs = true;
                    } else {
                        let mut raw = raw.clone();
                        if let Some(first) = raw.first_mut() {
                            first.has_space = tok.has_space;
                        }
                        out.extend(raw);
                    }
                } else {
                    let mut expanded = self.expand_tokens(args[&tok.text].clone())?;
                    if let Some(first) = expanded.first_mut() {
                        first.has_space = tok.has_space;
                        first.at_bol = false;
                    }
                    out.extend(expanded);
                }
                i += 1;
                continue;
            }

            out.push(tok.clone());
            i += 1;
        }
        Ok(out)
    }

    fn stringize(&self, arg: &[Token], hash_tok: &Token) -> Result<Token, CompileError> {
        let mut inner = String::new();
        for (i, t) in arg.iter().enumerate() {
            if i > 0 && t.has_space {
                inner.push(' ');
            }
            inner.push_str(&t.text);
        }
        let escaped: String = inner
            .chars()
            .flat_map(|c| match c {
                '"' | '\\' => vec!['\\', c],
                _ => vec![c],
            })
            .collect();
        let lexeme = format!("\"{}\"", escaped);
        let toks = self.lex_fragment(&lexeme, hash_tok.loc)?;
        let mut t = toks.into_iter().next().ok_or_else(|| {
            self.err(Some(hash_tok.loc), "stringizing produced no token")
        })?;
        t.loc = hash_tok.loc;
        t.has_space = hash_tok.has_space;
        t.at_bol = false;
        Ok(t)
    }

    fn paste(&self, lhs: &Token, rhs: &Token) -> Result<Token, CompileError> {
        let text = format!("{}{}", lhs.text, rhs.text);
        let toks = self.lex_fragment(&text, lhs.loc)?;
        let real: Vec<&Token> = toks.iter().filter(|t| !t.is_eof()).collect();
        if real.len() != 1 {
            return Err(self.err(
                Some(lhs.loc),
                format!("pasting forms '{}', an invalid token", text),
            ));
        }
        let mut t = real[0].clone();
        t.loc = lhs.loc;
        t.at_bol = false;
        t.has_space = lhs.has_space;
        t.hideset = hideset_intersection(&lhs.hideset, &rhs.hideset);
        Ok(t)
    }

    /// Lex a transient piece of text (paste results, stringized literals).
    fn lex_fragment(&self, text: &str, loc: Loc) -> Result<Vec<Token>, CompileError> {
        use cvm_core::source::SourceFile;
        let file = SourceFile {
            name: "<scratch>".into(),
            display_name: "<scratch>".into(),
            file_no: loc.file_no as usize,
            contents: lexer::canonicalize(text),
            line_delta: 0,
        };
        lexer::tokenize(&file)
    }

    // --- directives -----------------------------------------------------

    fn directive(&mut self, hash: &Token) -> Result<(), CompileError> {
        let Some(name_tok) = self.peek() else {
            return Ok(());
        };
        // A lone '#' is a null directive.
        if name_tok.at_bol || name_tok.is_eof() {
            return Ok(());
        }
        let name_tok = self.next().unwrap();
        let name = name_tok.text.clone();
        match name.as_str() {
            "include" | "include_next" => self.do_include(&name_tok, name == "include_next"),
            "define" => self.do_define(),
            "undef" => {
                let line = self.read_line();
                match line.first() {
                    Some(t) if t.kind == TokenKind::Ident => {
                        self.cc.macros.remove(&t.text);
                        Ok(())
                    }
                    _ => Err(self.err(Some(name_tok.loc), "macro name expected after #undef")),
                }
            }
            "if" => {
                let line = self.read_line();
                let val = self.eval_const_expr(line, &name_tok)?;
                self.cond_stack.push(CondFrame {
                    state: CondState::InThen,
                    included: val != 0,
                    loc: name_tok.loc,
                });
                if val == 0 {
                    self.skip_cond_branch()?;
                }
                Ok(())
            }
            "ifdef" | "ifndef" => {
                let line = self.read_line();
                let defined = line
                    .first()
                    .map(|t| self.cc.macros.contains_key(&t.text))
                    .unwrap_or(false);
                let included = defined == (name == "ifdef");
                self.cond_stack.push(CondFrame {
                    state: CondState::InThen,
                    included,
                    loc: name_tok.loc,
                });
                if !included {
                    self.skip_cond_branch()?;
                }
                Ok(())
            }
            "elif" => {
                let line = self.read_line();
                let Some(frame) = self.cond_stack.last_mut() else {
                    return Err(self.err(Some(name_tok.loc), "stray #elif"));
                };
                if frame.state == CondState::InElse {
                    return Err(self.err(Some(name_tok.loc), "#elif after #else"));
                }
                frame.state = CondState::InElif;
                if frame.included {
                    // Some earlier branch already won; skip the rest.
                    self.skip_to_endif()?;
                    return Ok(());
                }
                let val = self.eval_const_expr(line, &name_tok)?;
                if val != 0 {
                    self.cond_stack.last_mut().unwrap().included = true;
                } else {
                    self.skip_cond_branch()?;
                }
                Ok(())
            }
            "else" => {
                let _ = self.read_line();
                let Some(frame) = self.cond_stack.last_mut() else {
                    return Err(self.err(Some(name_tok.loc), "stray #else"));
                };
                if frame.state == CondState::InElse {
                    return Err(self.err(Some(name_tok.loc), "duplicate #else"));
                }
                frame.state = CondState::InElse;
                if frame.included {
                    self.skip_to_endif()?;
                }
                Ok(())
            }
            "endif" => {
                let _ = self.read_line();
                if self.cond_stack.pop().is_none() {
                    return Err(self.err(Some(name_tok.loc), "stray #endif"));
                }
                Ok(())
            }
            "line" => self.do_line(&name_tok),
            "error" => {
                let line = self.read_line();
                let text: Vec<String> = line.iter().map(|t| t.text.clone()).collect();
                Err(self.err(
                    Some(name_tok.loc),
                    format!("#error {}", text.join(" ")),
                ))
            }
            "warning" => {
                let line = self.read_line();
                let text: Vec<String> = line.iter().map(|t| t.text.clone()).collect();
                self.cc
                    .diags
                    .warning(Some(name_tok.loc), format!("#warning {}", text.join(" ")));
                Ok(())
            }
            "pragma" => self.do_pragma(&name_tok),
            "embed" => self.do_embed(&name_tok),
            _ => Err(self.err(
                Some(name_tok.loc),
                format!("invalid preprocessor directive #{}", name),
            )),
        }?;
        let _ = hash;
        Ok(())
    }

    /// Skip until the next branch of the current conditional that might be
    /// taken (#elif/#else) or its #endif.
    fn skip_cond_branch(&mut self) -> Result<(), CompileError> {
        let mut depth = 0usize;
        while let Some(tok) = self.next() {
            if tok.is_eof() {
                if self.input.is_empty() {
                    let loc = self.cond_stack.last().map(|f| f.loc);
                    return Err(self.err(loc, "unterminated conditional directive"));
                }
                continue;
            }
            if !(tok.at_bol && tok.is("#")) {
                continue;
            }
            let Some(name) = self
                .peek()
                .filter(|t| !t.at_bol && !t.is_eof())
                .map(|t| t.text.clone())
            else {
                continue;
            };
            match name.as_str() {
                "if" | "ifdef" | "ifndef" => {
                    self.next();
                    let _ = self.read_line();
                    depth += 1;
                }
                "endif" => {
                    if depth == 0 {
                        // Re-push so the main loop handles it.
                        self.input.push(tok);
                        return Ok(());
                    }
                    self.next();
                    let _ = self.read_line();
                    depth -= 1;
                }
                "elif" | "else" if depth == 0 => {
                    self.input.push(tok);
                    return Ok(());
                }
                _ => {
                    self.next();
                    let _ = self.read_line();
                }
            }
        }
        let loc = self.cond_stack.last().map(|f| f.loc);
        Err(self.err(loc, "unterminated conditional directive"))
    }

    /// Skip everything up to and including the matching #endif.
    fn skip_to_endif(&mut self) -> Result<(), CompileError> {
        let mut depth = 0usize;
        while let Some(tok) = self.next() {
            if tok.is_eof() {
                if self.input.is_empty() {
                    break;
                }
                continue;
            }
            if !(tok.at_bol && tok.is("#")) {
                continue;
            }
            let Some(name) = self
                .peek()
                .filter(|t| !t.at_bol && !t.is_eof())
                .map(|t| t.text.clone())
            else {
                continue;
            };
            match name.as_str() {
                "if" | "ifdef" | "ifndef" => {
                    self.next();
                    let _ = self.read_line();
                    depth += 1;
                }
                "endif" => {
                    self.next();
                    let _ = self.read_line();
                    if depth == 0 {
                        self.cond_stack.pop();
                        return Ok(());
                    }
                    depth -= 1;
                }
                _ => {
                    self.next();
                    let _ = self.read_line();
                }
            }
        }
        let loc = self.cond_stack.last().map(|f| f.loc);
        Err(self.err(loc, "unterminated conditional directive"))
    }

    fn do_define(&mut self) -> Result<(), CompileError> {
        let line = self.read_line();
        if line.is_empty() || line[0].kind != TokenKind::Ident {
            return Err(self.err(line.first().map(|t| t.loc), "macro name expected"));
        }
        let name = line[0].text.clone();
        // A '(' directly attached to the name makes it function-like.
        let func_like = line.get(1).is_some_and(|t| t.is("(") && !t.has_space);
        if !func_like {
            let body: Vec<Token> = line[1..].to_vec();
            self.cc.macros.insert(
                name,
                Macro {
                    body: MacroBody::ObjLike(body),
                },
            );
            return Ok(());
        }
        let mut params = Vec::new();
        let mut va_name = None;
        let mut i = 2;
        loop {
            let Some(tok) = line.get(i) else {
                return Err(self.err(Some(line[0].loc), "unterminated macro parameter list"));
            };
            if tok.is(")") {
                i += 1;
                break;
            }
            if !params.is_empty() || va_name.is_some() {
                if !tok.is(",") {
                    return Err(self.err(Some(tok.loc), "expected ',' in macro parameter list"));
                }
                i += 1;
            }
            let Some(tok) = line.get(i) else {
                return Err(self.err(Some(line[0].loc), "unterminated macro parameter list"));
            };
            if tok.is("...") {
                va_name = Some("__VA_ARGS__".to_string());
                i += 1;
                continue;
            }
            if tok.kind != TokenKind::Ident {
                return Err(self.err(Some(tok.loc), "macro parameter name expected"));
            }
            // GNU named rest parameter: name...
            if line.get(i + 1).is_some_and(|t| t.is("...")) {
                va_name = Some(tok.text.clone());
                i += 2;
                continue;
            }
            params.push(tok.text.clone());
            i += 1;
        }
        let body: Vec<Token> = line[i..].to_vec();
        self.cc.macros.insert(
            name,
            Macro {
                body: MacroBody::FuncLike {
                    params,
                    va_name,
                    body,
                },
            },
        );
        Ok(())
    }

    fn do_line(&mut self, name_tok: &Token) -> Result<(), CompileError> {
        let line = self.read_line();
        let line = self.expand_tokens(line)?;
        let mut line = line;
        lexer::convert_pp_tokens(&mut line)?;
        let Some(TokenValue::Int { val, .. }) = line.first().map(|t| t.value.clone()) else {
            return Err(self.err(Some(name_tok.loc), "invalid #line directive"));
        };
        let file_no = name_tok.loc.file_no as usize;
        if let Some(file) = self.cc.files.get_mut(file_no) {
            file.line_delta = val - name_tok.loc.line as i64 - 1;
            if let Some(t) = line.get(1) {
                if t.kind == TokenKind::Str {
                    file.display_name = t.text.trim_matches('"').to_string();
                }
            }
        }
        Ok(())
    }

    fn do_pragma(&mut self, name_tok: &Token) -> Result<(), CompileError> {
        let line = self.read_line();
        match line.first() {
            Some(t) if t.is_ident("once") => {
                let file_no = name_tok.loc.file_no as usize;
                if let Some(file) = self.cc.files.get(file_no) {
                    self.cc.pragma_once.insert(PathBuf::from(&file.name));
                }
                Ok(())
            }
            // Unknown pragmas are ignored; the meta-compilation pragma layer
            // is handled outside the core pipeline.
            _ => Ok(()),
        }
    }

    fn do_embed(&mut self, name_tok: &Token) -> Result<(), CompileError> {
        let line = self.read_line();
        let mut i = 0;
        let filename = match line.first() {
            Some(t) if t.kind == TokenKind::Str => {
                i += 1;
                t.text.trim_matches('"').to_string()
            }
            Some(t) if t.is("<") => {
                let mut name = String::new();
                i += 1;
                while let Some(t) = line.get(i) {
                    if t.is(">") {
                        i += 1;
                        break;
                    }
                    name.push_str(&t.text);
                    i += 1;
                }
                name
            }
            _ => return Err(self.err(Some(name_tok.loc), "#embed expects a file name")),
        };

        let mut limit: Option<usize> = None;
        let mut prefix: Vec<Token> = Vec::new();
        let mut suffix: Vec<Token> = Vec::new();
        let mut if_empty: Vec<Token> = Vec::new();
        while let Some(t) = line.get(i) {
            let param = t.text.clone();
            if line.get(i + 1).is_none_or(|t| !t.is("(")) {
                return Err(self.err(Some(t.loc), format!("bad #embed parameter '{}'", param)));
            }
            let (group, after) = read_group(&line, i + 1)
                .ok_or_else(|| self.err(Some(t.loc), "unterminated #embed parameter"))?;
            match param.as_str() {
                "limit" => {
                    let mut g = group.to_vec();
                    lexer::convert_pp_tokens(&mut g)?;
                    match g.first().map(|t| t.value.clone()) {
                        Some(TokenValue::Int { val, .. }) if val >= 0 => {
                            limit = Some(val as usize)
                        }
                        _ => return Err(self.err(Some(t.loc), "invalid #embed limit")),
                    }
                }
                "prefix" => prefix = group.to_vec(),
                "suffix" => suffix = group.to_vec(),
                "if_empty" => if_empty = group.to_vec(),
                _ => {
                    return Err(self.err(Some(t.loc), format!("bad #embed parameter '{}'", param)))
                }
            }
            i = after;
        }

        let path = self
            .search_include(&filename, name_tok, false, false)
            .ok_or_else(|| {
                self.err(Some(name_tok.loc), format!("#embed: {}: not found", filename))
            })?;
        let bytes = match path {
            IncludeSource::Disk(p) => std::fs::read(&p).map_err(|e| CompileError::Io {
                path: p.display().to_string(),
                msg: e.to_string(),
            })?,
            IncludeSource::Builtin(_, contents) => contents.into_bytes(),
        };
        let bytes = match limit {
            Some(n) => &bytes[..n.min(bytes.len())],
            None => &bytes[..],
        };
        let mut result = Vec::new();
        if bytes.is_empty() {
            result.extend(if_empty);
        } else {
            result.extend(prefix);
            for (idx, b) in bytes.iter().enumerate() {
                if idx > 0 {
                    result.push(Token::new(TokenKind::Punct, ",", name_tok.loc));
                }
                let mut t = Token::new(TokenKind::PpNum, b.to_string(), name_tok.loc);
                t.has_space = idx > 0;
                result.push(t);
            }
            result.extend(suffix);
        }
        self.push_tokens(result);
        Ok(())
    }

    // --- includes -------------------------------------------------------

    fn do_include(&mut self, name_tok: &Token, is_next: bool) -> Result<(), CompileError> {
        let line = self.read_line();
        let (filename, quoted) = self.read_include_filename(line, name_tok)?;

        let source = self
            .search_include(&filename, name_tok, quoted, is_next)
            .ok_or_else(|| {
                self.err(
                    Some(name_tok.loc),
                    format!("{}: file not found", filename),
                )
            })?;

        let (canonical, contents, disk_path) = match source {
            IncludeSource::Disk(p) => {
                let contents = std::fs::read_to_string(&p).map_err(|e| CompileError::Io {
                    path: p.display().to_string(),
                    msg: e.to_string(),
                })?;
                (p.clone(), contents, Some(p))
            }
            IncludeSource::Builtin(name, contents) => (PathBuf::from(name), contents, None),
        };

        if self.cc.pragma_once.contains(&canonical) {
            return Ok(());
        }
        // Include-guard cache: skip the file without reopening it when its
        // guard macro is still defined.
        if let Some(guard) = self.cc.include_guards.get(&canonical) {
            if self.cc.macros.contains_key(guard) {
                return Ok(());
            }
        }

        let file_no = self.cc.files.add(
            canonical.to_string_lossy().to_string(),
            lexer::canonicalize(&contents),
        );
        let _ = disk_path;
        let tokens = lexer::tokenize(self.cc.files.get(file_no).unwrap())?;
        if let Some(guard) = detect_include_guard(&tokens) {
            self.cc.include_guards.insert(canonical, guard);
        }
        self.push_tokens(tokens);
        Ok(())
    }

    fn read_include_filename(
        &mut self,
        line: Vec<Token>,
        name_tok: &Token,
    ) -> Result<(String, bool), CompileError> {
        match line.first() {
            // "...": the raw spelling, escapes not interpreted.
            Some(t) if t.kind == TokenKind::Str => {
                Ok((t.text.trim_matches('"').to_string(), true))
            }
            Some(t) if t.is("<") => {
                let mut name = String::new();
                for t in line.iter().skip(1) {
                    if t.is(">") {
                        return Ok((name, false));
                    }
                    name.push_str(&t.text);
                }
                Err(self.err(Some(t.loc), "expected '>' in #include"))
            }
            // Macro-expanded form: #include FOO
            Some(t) if t.kind == TokenKind::Ident => {
                let expanded = self.expand_tokens(line)?;
                self.read_include_filename(expanded, name_tok)
            }
            _ => Err(self.err(Some(name_tok.loc), "expected a file name in #include")),
        }
    }

    fn search_include(
        &mut self,
        filename: &str,
        name_tok: &Token,
        quoted: bool,
        is_next: bool,
    ) -> Option<IncludeSource> {
        if filename.starts_with('/') {
            let p = PathBuf::from(filename);
            if p.is_file() {
                return Some(IncludeSource::Disk(p));
            }
        }
        // include_next resumes after the directory that held the includer.
        let start = if is_next {
            let file_no = name_tok.loc.file_no as usize;
            self.cc
                .files
                .get(file_no)
                .and_then(|f| self.cc.include_found_at.get(Path::new(&f.name)))
                .map(|&i| i + 1)
                .unwrap_or(0)
        } else {
            0
        };
        if quoted && !is_next {
            let file_no = name_tok.loc.file_no as usize;
            if let Some(dir) = self
                .cc
                .files
                .get(file_no)
                .and_then(|f| Path::new(&f.name).parent().map(|p| p.to_path_buf()))
            {
                let p = dir.join(filename);
                if p.is_file() {
                    return Some(IncludeSource::Disk(p));
                }
            }
        }
        for (idx, dir) in self.cc.include_paths.clone().iter().enumerate().skip(start) {
            let p = dir.join(filename);
            if p.is_file() {
                self.cc.include_found_at.insert(p.clone(), idx);
                return Some(IncludeSource::Disk(p));
            }
        }
        crate::headers::builtin_header(filename).map(|contents| {
            IncludeSource::Builtin(format!("<builtin>/{}", filename), contents.to_string())
        })
    }

    // --- #if expression evaluation --------------------------------------

    fn eval_const_expr(
        &mut self,
        line: Vec<Token>,
        name_tok: &Token,
    ) -> Result<i64, CompileError> {
        if line.is_empty() {
            return Err(self.err(Some(name_tok.loc), "no expression after #if"));
        }
        // Resolve `defined` before expansion.
        let mut resolved = Vec::new();
        let mut i = 0;
        while i < line.len() {
            let t = &line[i];
            if t.is_ident("defined") {
                let (name, after) = if line.get(i + 1).is_some_and(|t| t.is("(")) {
                    let name = line
                        .get(i + 2)
                        .filter(|t| t.kind == TokenKind::Ident)
                        .map(|t| t.text.clone())
                        .ok_or_else(|| self.err(Some(t.loc), "macro name expected"))?;
                    if !line.get(i + 3).is_some_and(|t| t.is(")")) {
                        return Err(self.err(Some(t.loc), "expected ')' after defined"));
                    }
                    (name, i + 4)
                } else {
                    let name = line
                        .get(i + 1)
                        .filter(|t| t.kind == TokenKind::Ident)
                        .map(|t| t.text.clone())
                        .ok_or_else(|| self.err(Some(t.loc), "macro name expected"))?;
                    (name, i + 2)
                };
                let val = self.cc.macros.contains_key(&name) as i64;
                let mut num = Token::new(TokenKind::PpNum, val.to_string(), t.loc);
                num.has_space = t.has_space;
                resolved.push(num);
                i = after;
            } else {
                resolved.push(t.clone());
                i += 1;
            }
        }
        let mut expanded = self.expand_tokens(resolved)?;
        // Identifiers surviving expansion become 0; true/false are C23.
        for t in expanded.iter_mut() {
            if t.kind == TokenKind::Ident {
                let val = if t.text == "true" { 1 } else { 0 };
                t.kind = TokenKind::PpNum;
                t.text = val.to_string();
            }
        }
        lexer::convert_pp_tokens(&mut expanded)?;
        let mut eval = CondEval {
            toks: &expanded,
            pos: 0,
            pp: self,
            loc: name_tok.loc,
        };
        let val = eval.ternary()?;
        Ok(val)
    }
}

enum IncludeSource {
    Disk(PathBuf),
    Builtin(String, String),
}

/// Balanced `( ... )` group starting at `open`; returns the inner slice and
/// the index just past the closing paren.
fn read_group(tokens: &[Token], open: usize) -> Option<(&[Token], usize)> {
    if !tokens.get(open)?.is("(") {
        return None;
    }
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is("(") {
            depth += 1;
        } else if t.is(")") {
            depth -= 1;
            if depth == 0 {
                return Some((&tokens[open + 1..i], i + 1));
            }
        }
    }
    None
}

/// Recognize the classic `#ifndef G` / `#define G` ... `#endif` shape so a
/// second inclusion can be skipped without reopening the file.
fn detect_include_guard(tokens: &[Token]) -> Option<String> {
    let t = tokens;
    if t.len() < 7 {
        return None;
    }
    if !(t[0].at_bol && t[0].is("#") && t[1].is_ident("ifndef")) {
        return None;
    }
    let guard = t[2].text.clone();
    if !(t[3].at_bol && t[3].is("#") && t[4].is_ident("define") && t[5].text == guard) {
        return None;
    }
    // The matching #endif must close at end of file.
    let mut depth = 0i32;
    let mut i = 0;
    let mut last_endif = None;
    while i < t.len() {
        if t[i].at_bol && t[i].is("#") {
            match t.get(i + 1).map(|t| t.text.as_str()) {
                Some("if") | Some("ifdef") | Some("ifndef") => depth += 1,
                Some("endif") => {
                    depth -= 1;
                    if depth == 0 {
                        last_endif = Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    let endif_at = last_endif?;
    // Only whitespace (no tokens) may follow the closing #endif.
    let after = &t[endif_at + 2..];
    if after.iter().all(|t| t.is_eof()) {
        Some(guard)
    } else {
        None
    }
}

/// Minimal constant-expression evaluator for #if lines.
struct CondEval<'a, 'b> {
    toks: &'a [Token],
    pos: usize,
    pp: &'a Preprocessor<'b>,
    loc: Loc,
}

impl CondEval<'_, '_> {
    fn err(&self, msg: impl Into<String>) -> CompileError {
        self.pp.err(Some(self.loc), msg)
    }

    fn peek_is(&self, s: &str) -> bool {
        self.toks.get(self.pos).is_some_and(|t| t.is(s))
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.peek_is(s) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, s: &str) -> Result<(), CompileError> {
        if self.eat(s) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{}' in preprocessor expression", s)))
        }
    }

    fn ternary(&mut self) -> Result<i64, CompileError> {
        let cond = self.logor()?;
        if self.eat("?") {
            let then = self.ternary()?;
            self.expect(":")?;
            let els = self.ternary()?;
            return Ok(if cond != 0 { then } else { els });
        }
        Ok(cond)
    }

    fn logor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.logand()?;
        while self.eat("||") {
            let r = self.logand()?;
            v = ((v != 0) || (r != 0)) as i64;
        }
        Ok(v)
    }

    fn logand(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitor()?;
        while self.eat("&&") {
            let r = self.bitor()?;
            v = ((v != 0) && (r != 0)) as i64;
        }
        Ok(v)
    }

    fn bitor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitxor()?;
        while self.eat("|") {
            v |= self.bitxor()?;
        }
        Ok(v)
    }

    fn bitxor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitand()?;
        while self.eat("^") {
            v ^= self.bitand()?;
        }
        Ok(v)
    }

    fn bitand(&mut self) -> Result<i64, CompileError> {
        let mut v = self.equality()?;
        while self.eat("&") {
            v &= self.equality()?;
        }
        Ok(v)
    }

    fn equality(&mut self) -> Result<i64, CompileError> {
        let mut v = self.relational()?;
        loop {
            if self.eat("==") {
                v = (v == self.relational()?) as i64;
            } else if self.eat("!=") {
                v = (v != self.relational()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }

    fn relational(&mut self) -> Result<i64, CompileError> {
        let mut v = self.shift()?;
        loop {
            if self.eat("<=") {
                v = (v <= self.shift()?) as i64;
            } else if self.eat(">=") {
                v = (v >= self.shift()?) as i64;
            } else if self.eat("<") {
                v = (v < self.shift()?) as i64;
            } else if self.eat(">") {
                v = (v > self.shift()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }

    fn shift(&mut self) -> Result<i64, CompileError> {
        let mut v = self.additive()?;
        loop {
            if self.eat("<<") {
                v = v.wrapping_shl(self.additive()? as u32);
            } else if self.eat(">>") {
                v = v.wrapping_shr(self.additive()? as u32);
            } else {
                return Ok(v);
            }
        }
    }

    fn additive(&mut self) -> Result<i64, CompileError> {
        let mut v = self.multiplicative()?;
        loop {
            if self.eat("+") {
                v = v.wrapping_add(self.multiplicative()?);
            } else if self.eat("-") {
                v = v.wrapping_sub(self.multiplicative()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<i64, CompileError> {
        let mut v = self.unary()?;
        loop {
            if self.eat("*") {
                v = v.wrapping_mul(self.unary()?);
            } else if self.eat("/") {
                let r = self.unary()?;
                if r == 0 {
                    return Err(self.err("division by zero in preprocessor expression"));
                }
                v = v.wrapping_div(r);
            } else if self.eat("%") {
                let r = self.unary()?;
                if r == 0 {
                    return Err(self.err("division by zero in preprocessor expression"));
                }
                v = v.wrapping_rem(r);
            } else {
                return Ok(v);
            }
        }
    }

    fn unary(&mut self) -> Result<i64, CompileError> {
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.eat("!") {
            return Ok((self.unary()? == 0) as i64);
        }
        if self.eat("~") {
            return Ok(!self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, CompileError> {
        if self.eat("(") {
            let v = self.ternary()?;
            self.expect(")")?;
            return Ok(v);
        }
        let Some(tok) = self.toks.get(self.pos) else {
            return Err(self.err("unexpected end of preprocessor expression"));
        };
        match &tok.value {
            TokenValue::Int { val, .. } => {
                self.pos += 1;
                Ok(*val)
            }
            TokenValue::Float { .. } => {
                Err(self.err("floating constant in preprocessor expression"))
            }
            _ => Err(self.err(format!(
                "unexpected token '{}' in preprocessor expression",
                tok.text
            ))),
        }
    }
}

// --- post passes --------------------------------------------------------

fn unit_size(enc: StrEncoding) -> usize {
    match enc {
        StrEncoding::Narrow | StrEncoding::Utf8 => 1,
        StrEncoding::Utf16 => 2,
        StrEncoding::Utf32 | StrEncoding::Wide => 4,
    }
}

/// Adjacent string literals concatenate; if any operand is wide, every
/// operand is re-encoded with the widest element type first.
fn join_adjacent_string_literals(tokens: &mut Vec<Token>) -> Result<(), CompileError> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].kind != TokenKind::Str
            || tokens.get(i + 1).map(|t| t.kind) != Some(TokenKind::Str)
        {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        }
        let mut j = i;
        let mut enc = StrEncoding::Narrow;
        while j < tokens.len() && tokens[j].kind == TokenKind::Str {
            if let TokenValue::Str { enc: e, .. } = &tokens[j].value {
                if unit_size(*e) > unit_size(enc) {
                    enc = *e;
                }
            }
            j += 1;
        }
        let mut bytes: Vec<u8> = Vec::new();
        let mut text = String::new();
        for tok in &tokens[i..j] {
            let piece = recode_string(tok, enc)?;
            let term = unit_size(enc);
            bytes.extend_from_slice(&piece[..piece.len() - term]);
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&tok.text);
        }
        bytes.extend(std::iter::repeat(0u8).take(unit_size(enc)));
        let mut joined = tokens[i].clone();
        joined.text = text;
        joined.value = TokenValue::Str { bytes, enc };
        out.push(joined);
        i = j;
    }
    *tokens = std::mem::take(&mut out);
    Ok(())
}

/// Re-encode one string literal token's bytes in a (possibly wider) target
/// encoding by re-lexing its spelling with the target prefix.
fn recode_string(tok: &Token, target: StrEncoding) -> Result<Vec<u8>, CompileError> {
    let (bytes, enc) = match &tok.value {
        TokenValue::Str { bytes, enc } => (bytes.clone(), *enc),
        _ => {
            return Err(CompileError::Preprocess {
                loc: Some(tok.loc),
                msg: "expected string literal".into(),
            })
        }
    };
    if unit_size(enc) == unit_size(target) {
        return Ok(bytes);
    }
    let body = tok
        .text
        .find('"')
        .map(|q| &tok.text[q..])
        .unwrap_or(&tok.text);
    let prefix = match target {
        StrEncoding::Narrow => "",
        StrEncoding::Utf8 => "u8",
        StrEncoding::Utf16 => "u",
        StrEncoding::Utf32 => "U",
        StrEncoding::Wide => "L",
    };
    let spelled = format!("{}{}", prefix, body);
    let file = cvm_core::source::SourceFile {
        name: "<concat>".into(),
        display_name: "<concat>".into(),
        file_no: tok.loc.file_no as usize,
        contents: lexer::canonicalize(&spelled),
        line_delta: 0,
    };
    let toks = lexer::tokenize(&file)?;
    match toks.first().map(|t| t.value.clone()) {
        Some(TokenValue::Str { bytes, .. }) => Ok(bytes),
        _ => Err(CompileError::Preprocess {
            loc: Some(tok.loc),
            msg: "invalid string concatenation".into(),
        }),
    }
}

// --- built-in macro clock ----------------------------------------------

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// "Mmm dd yyyy", from a civil-from-days conversion.
fn format_date(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let (y, m, d) = civil_from_days(days);
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    format!("{} {:2} {}", MONTHS[(m - 1) as usize], d, y)
}

fn format_time(secs: u64) -> String {
    let s = secs % 86_400;
    format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Install the predefined and builtin macros for a fresh compiler instance.
pub(crate) fn init_macros(macros: &mut HashMap<String, Macro>) {
    let builtins = [
        ("__FILE__", Builtin::File),
        ("__LINE__", Builtin::Line),
        ("__COUNTER__", Builtin::Counter),
        ("__DATE__", Builtin::Date),
        ("__TIME__", Builtin::Time),
        ("__TIMESTAMP__", Builtin::Timestamp),
        ("__BASE_FILE__", Builtin::BaseFile),
    ];
    for (name, b) in builtins {
        macros.insert(
            name.to_string(),
            Macro {
                body: MacroBody::Builtin(b),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::token::print_tokens;
    use crate::Compiler;

    fn pp(src: &str) -> String {
        let mut cc = Compiler::new();
        let toks = cc.preprocess_source("test.c", src).expect("preprocess");
        print_tokens(&toks).trim_end().to_string()
    }

    fn pp_err(src: &str) -> String {
        let mut cc = Compiler::new();
        match cc.preprocess_source("test.c", src) {
            Ok(_) => panic!("expected preprocess error"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn object_macro_expands() {
        assert_eq!(pp("#define N 42\nN"), "42");
    }

    #[test]
    fn recursive_macro_terminates() {
        // T -> U -> T stops because T is in the hideset.
        assert_eq!(pp("#define T U\n#define U T\nT"), "T");
    }

    #[test]
    fn function_macro_with_args() {
        assert_eq!(pp("#define ADD(a, b) ((a) + (b))\nADD(1, 2)"), "((1) + (2))");
    }

    #[test]
    fn function_macro_without_parens_is_untouched() {
        assert_eq!(pp("#define F(x) x\nF"), "F");
    }

    #[test]
    fn stringize_and_paste() {
        assert_eq!(pp("#define S(x) #x\nS(a b)"), "\"a b\"");
        assert_eq!(pp("#define CAT(a, b) a##b\nCAT(foo, bar)"), "foobar");
        assert_eq!(pp("#define CAT(a, b) a##b\nCAT(1, 2)"), "12");
    }

    #[test]
    fn va_args_and_comma_swallow() {
        assert_eq!(
            pp("#define LOG(f, ...) printf(f, ##__VA_ARGS__)\nLOG(\"x\")"),
            "printf(\"x\")"
        );
        assert_eq!(
            pp("#define LOG(f, ...) printf(f, ##__VA_ARGS__)\nLOG(\"x\", 1, 2)"),
            "printf(\"x\", 1, 2)"
        );
    }

    #[test]
    fn va_opt() {
        let src = "#define F(x, ...) f(x __VA_OPT__(,) __VA_ARGS__)\nF(1)\nF(1, 2)";
        assert_eq!(pp(src), "f(1)\nf(1, 2)");
    }

    #[test]
    fn conditionals() {
        assert_eq!(pp("#if 1\na\n#else\nb\n#endif"), "a");
        assert_eq!(pp("#if 0\na\n#else\nb\n#endif"), "b");
        assert_eq!(pp("#if 0\na\n#elif 1\nb\n#else\nc\n#endif"), "b");
        assert_eq!(pp("#if defined(X)\na\n#endif\n#define X\n#ifdef X\nb\n#endif"), "b");
    }

    #[test]
    fn undefined_identifiers_evaluate_to_zero() {
        assert_eq!(pp("#if FOO + 1\nyes\n#endif"), "yes");
    }

    #[test]
    fn unterminated_conditional_is_fatal() {
        let msg = pp_err("#if 1\nint x;\n");
        assert!(msg.contains("unterminated conditional"), "{}", msg);
    }

    #[test]
    fn stray_else_is_fatal() {
        let msg = pp_err("#else\n");
        assert!(msg.contains("stray #else"), "{}", msg);
    }

    #[test]
    fn error_directive_is_fatal() {
        let msg = pp_err("#error boom here\n");
        assert!(msg.contains("boom here"), "{}", msg);
    }

    #[test]
    fn counter_is_instance_local() {
        assert_eq!(pp("__COUNTER__ __COUNTER__ __COUNTER__"), "0 1 2");
        // A fresh instance restarts at zero.
        assert_eq!(pp("__COUNTER__"), "0");
    }

    #[test]
    fn line_and_file_builtins() {
        assert_eq!(pp("__LINE__\n__LINE__"), "1\n2");
        assert_eq!(pp("__FILE__"), "\"test.c\"");
    }

    #[test]
    fn adjacent_strings_concatenate() {
        let mut cc = Compiler::new();
        let toks = cc.preprocess_source("t.c", "\"ab\" \"cd\"").unwrap();
        match &toks[0].value {
            crate::token::TokenValue::Str { bytes, .. } => {
                assert_eq!(bytes, &[b'a', b'b', b'c', b'd', 0]);
            }
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn wide_promotion_in_concatenation() {
        let mut cc = Compiler::new();
        let toks = cc.preprocess_source("t.c", "\"a\" L\"b\"").unwrap();
        match &toks[0].value {
            crate::token::TokenValue::Str { bytes, enc } => {
                assert_eq!(*enc, crate::token::StrEncoding::Wide);
                assert_eq!(bytes.len(), 12); // 'a', 'b', NUL as 4-byte units
            }
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn hash_must_start_the_line() {
        // A '#' that is not at the beginning of a line is not a directive.
        assert_eq!(pp("int x; # define"), "int x; # define");
    }
}
