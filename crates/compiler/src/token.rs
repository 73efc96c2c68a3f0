//! Tokens.
//!
//! The tokenizer produces a flat vector of tokens; the preprocessor consumes
//! and produces the same shape. Two flags recorded at lexing time drive
//! preprocessing: `at_bol` (first token on its physical line, needed to
//! recognize `#` directives) and `has_space` (preceded by whitespace, needed
//! for faithful stringizing and re-emission).

use cvm_core::source::Loc;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Punct,
    /// A numeric literal before conversion. The preprocessor may paste
    /// pp-numbers together, so conversion is deferred until it finishes.
    PpNum,
    /// A converted numeric literal; the value lives in [`TokenValue`].
    Num,
    Str,
    Char,
    Eof,
}

/// Encoding prefix of a string or character literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrEncoding {
    /// Plain `"..."`: array of char.
    Narrow,
    /// `u8"..."`: array of char, UTF-8.
    Utf8,
    /// `u"..."`: array of uint16_t.
    Utf16,
    /// `U"..."`: array of uint32_t.
    Utf32,
    /// `L"..."`: array of int.
    Wide,
}

/// The numeric type a literal's suffix and magnitude selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumType {
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    LongDouble,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Int { val: i64, ty: NumType },
    Float { val: f64, ty: NumType },
    /// Decoded bytes including the terminating NUL, in the target encoding's
    /// element width.
    Str { bytes: Vec<u8>, enc: StrEncoding },
}

/// Where a token came from, for diagnostics through macro expansion.
#[derive(Debug)]
pub struct Origin {
    pub macro_name: String,
    pub loc: Loc,
    pub parent: Option<Rc<Origin>>,
}

/// A hideset is a persistent set of macro names that must not expand this
/// token again. Shared tails keep expansion cheap.
pub type Hideset = Option<Rc<HidesetNode>>;

#[derive(Debug)]
pub struct HidesetNode {
    pub name: Rc<str>,
    pub next: Hideset,
}

pub fn hideset_contains(hs: &Hideset, name: &str) -> bool {
    let mut cur = hs;
    while let Some(node) = cur {
        if &*node.name == name {
            return true;
        }
        cur = &node.next;
    }
    false
}

pub fn hideset_add(hs: Hideset, name: &str) -> Hideset {
    Some(Rc::new(HidesetNode {
        name: Rc::from(name),
        next: hs,
    }))
}

pub fn hideset_union(a: &Hideset, b: &Hideset) -> Hideset {
    let mut out = b.clone();
    let mut cur = a;
    while let Some(node) = cur {
        if !hideset_contains(b, &node.name) {
            out = Some(Rc::new(HidesetNode {
                name: node.name.clone(),
                next: out,
            }));
        }
        cur = &node.next;
    }
    out
}

pub fn hideset_intersection(a: &Hideset, b: &Hideset) -> Hideset {
    let mut out = None;
    let mut cur = a;
    while let Some(node) = cur {
        if hideset_contains(b, &node.name) {
            out = Some(Rc::new(HidesetNode {
                name: node.name.clone(),
                next: out,
            }));
        }
        cur = &node.next;
    }
    out
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw lexeme.
    pub text: String,
    pub loc: Loc,
    pub at_bol: bool,
    pub has_space: bool,
    pub hideset: Hideset,
    pub value: TokenValue,
    pub origin: Option<Rc<Origin>>,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, loc: Loc) -> Self {
        Token {
            kind,
            text: text.into(),
            loc,
            at_bol: false,
            has_space: false,
            hideset: None,
            value: TokenValue::None,
            origin: None,
        }
    }

    pub fn eof(loc: Loc) -> Self {
        let mut t = Token::new(TokenKind::Eof, "", loc);
        t.at_bol = true;
        t
    }

    pub fn is(&self, text: &str) -> bool {
        self.kind != TokenKind::Eof && self.text == text
    }

    pub fn is_ident(&self, text: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == text
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// Chain of macro expansions that produced this token, outermost last.
    pub fn expansion_chain(&self) -> Vec<(String, Loc)> {
        let mut out = Vec::new();
        let mut cur = self.origin.clone();
        while let Some(o) = cur {
            out.push((o.macro_name.clone(), o.loc));
            cur = o.parent.clone();
        }
        out
    }
}

/// Print a token stream the way the original file spelled it, using the
/// recorded newline and whitespace flags.
pub fn print_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut first = true;
    for tok in tokens {
        if tok.is_eof() {
            break;
        }
        if tok.at_bol && !first {
            out.push('\n');
        } else if tok.has_space && !first && !tok.at_bol {
            out.push(' ');
        }
        out.push_str(&tok.text);
        first = false;
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hideset_operations() {
        let hs = hideset_add(None, "A");
        let hs = hideset_add(hs, "B");
        assert!(hideset_contains(&hs, "A"));
        assert!(hideset_contains(&hs, "B"));
        assert!(!hideset_contains(&hs, "C"));

        let other = hideset_add(None, "B");
        let other = hideset_add(other, "C");
        let inter = hideset_intersection(&hs, &other);
        assert!(hideset_contains(&inter, "B"));
        assert!(!hideset_contains(&inter, "A"));
        assert!(!hideset_contains(&inter, "C"));

        let union = hideset_union(&hs, &other);
        for name in ["A", "B", "C"] {
            assert!(hideset_contains(&union, name));
        }
    }
}
