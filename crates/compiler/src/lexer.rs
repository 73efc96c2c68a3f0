//! Tokenizer.
//!
//! Turns a source file into a token vector. Numeric literals are lexed as
//! pp-numbers and converted only after preprocessing, because `##` can paste
//! two pp-numbers into one. String and character literals are decoded here,
//! including encoding prefixes and escape sequences.

use crate::error::CompileError;
use crate::token::{NumType, StrEncoding, Token, TokenKind, TokenValue};
use cvm_core::source::{Loc, SourceFile};

/// Punctuators, longest first so maximal munch falls out of the scan order.
const PUNCTUATORS: &[&str] = &[
    "<<=", ">>=", "...", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "++", "--", "%=",
    "&=", "|=", "^=", "&&", "||", "<<", ">>", "##", "+", "-", "*", "/", "%", "&", "|", "^", "<",
    ">", "=", "!", "?", ":", ";", ",", ".", "(", ")", "[", "]", "{", "}", "#", "~",
];

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_ascii_alphabetic() || (!c.is_ascii() && c.is_alphabetic())
}

fn is_ident_continue(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || (!c.is_ascii() && c.is_alphanumeric())
}

/// Strip carriage returns and splice backslash-newline pairs. Removed
/// newlines are re-inserted after the next physical newline so later lines
/// keep their numbers.
pub fn canonicalize(src: &str) -> String {
    let mut out = String::with_capacity(src.len() + 1);
    let mut pending = 0usize;
    let mut chars = src.chars().filter(|&c| c != '\r').peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'\n') {
            chars.next();
            pending += 1;
        } else if c == '\n' {
            out.push('\n');
            for _ in 0..pending {
                out.push('\n');
            }
            pending = 0;
        } else {
            out.push(c);
        }
    }
    for _ in 0..pending {
        out.push('\n');
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

struct Lexer<'a> {
    src: &'a str,
    file_no: usize,
    pos: usize,
    line: u32,
    col: u32,
    at_bol: bool,
    has_space: bool,
}

impl<'a> Lexer<'a> {
    fn new(file: &'a SourceFile) -> Self {
        Lexer {
            src: &file.contents,
            file_no: file.file_no,
            pos: 0,
            line: 1,
            col: 1,
            at_bol: true,
            has_space: false,
        }
    }

    fn loc(&self) -> Loc {
        Loc::new(self.file_no, self.pos, self.line, self.col)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn bump_n(&mut self, n_chars: usize) {
        for _ in 0..n_chars {
            self.bump();
        }
    }

    fn err(&self, loc: Loc, msg: impl Into<String>) -> CompileError {
        CompileError::Lex {
            loc,
            msg: msg.into(),
        }
    }

    fn finish_token(&mut self, mut tok: Token) -> Token {
        tok.at_bol = self.at_bol;
        tok.has_space = self.has_space;
        self.at_bol = false;
        self.has_space = false;
        tok
    }

    fn run(&mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        loop {
            let Some(c) = self.peek() else { break };

            if c == '\n' {
                self.bump();
                self.at_bol = true;
                self.has_space = false;
                continue;
            }
            if c == ' ' || c == '\t' || c == '\u{b}' || c == '\u{c}' {
                self.bump();
                self.has_space = true;
                continue;
            }
            if self.starts_with("//") {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                self.has_space = true;
                continue;
            }
            if self.starts_with("/*") {
                let loc = self.loc();
                self.bump_n(2);
                loop {
                    if self.starts_with("*/") {
                        self.bump_n(2);
                        break;
                    }
                    if self.bump().is_none() {
                        return Err(self.err(loc, "unterminated block comment"));
                    }
                }
                self.has_space = true;
                continue;
            }

            // String literals, with encoding prefixes.
            let str_prefix = [
                ("u8\"", StrEncoding::Utf8, 2),
                ("u\"", StrEncoding::Utf16, 1),
                ("U\"", StrEncoding::Utf32, 1),
                ("L\"", StrEncoding::Wide, 1),
                ("\"", StrEncoding::Narrow, 0),
            ]
            .into_iter()
            .find(|(p, _, _)| self.starts_with(p));
            if let Some((_, enc, skip)) = str_prefix {
                let tok = self.read_string_literal(enc, skip)?;
                tokens.push(tok);
                continue;
            }

            // Character literals.
            let char_prefix = [
                ("u'", NumType::UInt, 1),
                ("U'", NumType::UInt, 1),
                ("L'", NumType::Int, 1),
                ("'", NumType::Int, 0),
            ]
            .into_iter()
            .find(|(p, _, _)| self.starts_with(p));
            if let Some((_, ty, skip)) = char_prefix {
                let tok = self.read_char_literal(ty, skip)?;
                tokens.push(tok);
                continue;
            }

            // pp-numbers: a digit, or '.' followed by a digit.
            if c.is_ascii_digit()
                || (c == '.' && self.rest().chars().nth(1).is_some_and(|d| d.is_ascii_digit()))
            {
                let tok = self.read_pp_number();
                tokens.push(tok);
                continue;
            }

            if is_ident_start(c) {
                let loc = self.loc();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if !is_ident_continue(c) {
                        break;
                    }
                    self.bump();
                }
                let text = &self.src[start..self.pos];
                let tok = Token::new(TokenKind::Ident, text, loc);
                let tok = self.finish_token(tok);
                tokens.push(tok);
                continue;
            }

            if let Some(p) = PUNCTUATORS.iter().find(|p| self.starts_with(p)) {
                let loc = self.loc();
                self.bump_n(p.chars().count());
                let tok = Token::new(TokenKind::Punct, *p, loc);
                let tok = self.finish_token(tok);
                tokens.push(tok);
                continue;
            }

            return Err(self.err(self.loc(), format!("invalid character '{}'", c)));
        }
        let mut eof = Token::eof(self.loc());
        eof.at_bol = true;
        tokens.push(eof);
        Ok(tokens)
    }

    fn read_pp_number(&mut self) -> Token {
        let loc = self.loc();
        let start = self.pos;
        let mut prev = '\0';
        while let Some(c) = self.peek() {
            let ok = c.is_ascii_alphanumeric()
                || c == '.'
                || c == '_'
                || c == '\''
                || ((c == '+' || c == '-') && matches!(prev, 'e' | 'E' | 'p' | 'P'));
            if !ok {
                break;
            }
            prev = c;
            self.bump();
        }
        let text = &self.src[start..self.pos];
        let tok = Token::new(TokenKind::PpNum, text, loc);
        self.finish_token(tok)
    }

    /// One escape sequence, after the backslash has been consumed.
    fn read_escape(&mut self, loc: Loc) -> Result<u32, CompileError> {
        let c = self
            .bump()
            .ok_or_else(|| self.err(loc, "unterminated escape sequence"))?;
        match c {
            'a' => Ok(0x07),
            'b' => Ok(0x08),
            'f' => Ok(0x0c),
            'n' => Ok(0x0a),
            'r' => Ok(0x0d),
            't' => Ok(0x09),
            'v' => Ok(0x0b),
            'e' => Ok(0x1b),
            '\\' | '\'' | '"' | '?' => Ok(c as u32),
            '0'..='7' => {
                let mut val = c as u32 - '0' as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ '0'..='7') => {
                            val = val * 8 + (d as u32 - '0' as u32);
                            self.bump();
                        }
                        _ => break,
                    }
                }
                Ok(val)
            }
            'x' => {
                let mut val: u32 = 0;
                let mut seen = false;
                while let Some(d) = self.peek() {
                    if let Some(v) = d.to_digit(16) {
                        val = val.wrapping_mul(16).wrapping_add(v);
                        seen = true;
                        self.bump();
                    } else {
                        break;
                    }
                }
                if !seen {
                    return Err(self.err(loc, "invalid hex escape sequence"));
                }
                Ok(val)
            }
            'u' | 'U' => {
                let digits = if c == 'u' { 4 } else { 8 };
                let mut val: u32 = 0;
                for _ in 0..digits {
                    let d = self
                        .peek()
                        .and_then(|d| d.to_digit(16))
                        .ok_or_else(|| self.err(loc, "invalid universal character name"))?;
                    val = val * 16 + d;
                    self.bump();
                }
                Ok(val)
            }
            _ => Err(self.err(loc, format!("unknown escape sequence '\\{}'", c))),
        }
    }

    fn read_string_literal(
        &mut self,
        enc: StrEncoding,
        prefix_chars: usize,
    ) -> Result<Token, CompileError> {
        let loc = self.loc();
        let start = self.pos;
        self.bump_n(prefix_chars + 1); // prefix + opening quote
        let mut units: Vec<u32> = Vec::new();
        let mut raw_bytes: Vec<u8> = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err(loc, "unterminated string literal"));
            };
            if c == '\n' {
                return Err(self.err(loc, "unterminated string literal"));
            }
            if c == '"' {
                self.bump();
                break;
            }
            if c == '\\' {
                self.bump();
                let v = self.read_escape(loc)?;
                units.push(v);
                match char::from_u32(v).filter(|_| v > 0xff) {
                    // Universal character names become UTF-8 in narrow strings.
                    Some(ch) => {
                        let mut buf = [0u8; 4];
                        raw_bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                    None => raw_bytes.push(v as u8),
                }
            } else {
                self.bump();
                units.push(c as u32);
                let mut buf = [0u8; 4];
                raw_bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
        let bytes = match enc {
            StrEncoding::Narrow | StrEncoding::Utf8 => {
                let mut b = raw_bytes;
                b.push(0);
                b
            }
            StrEncoding::Utf16 => {
                let mut b = Vec::new();
                for &u in &units {
                    if u >= 0x10000 {
                        let u = u - 0x10000;
                        let hi = 0xd800 + (u >> 10) as u16;
                        let lo = 0xdc00 + (u & 0x3ff) as u16;
                        b.extend_from_slice(&hi.to_le_bytes());
                        b.extend_from_slice(&lo.to_le_bytes());
                    } else {
                        b.extend_from_slice(&(u as u16).to_le_bytes());
                    }
                }
                b.extend_from_slice(&0u16.to_le_bytes());
                b
            }
            StrEncoding::Utf32 | StrEncoding::Wide => {
                let mut b = Vec::new();
                for &u in &units {
                    b.extend_from_slice(&u.to_le_bytes());
                }
                b.extend_from_slice(&0u32.to_le_bytes());
                b
            }
        };
        let text = &self.src[start..self.pos];
        let mut tok = Token::new(TokenKind::Str, text, loc);
        tok.value = TokenValue::Str { bytes, enc };
        Ok(self.finish_token(tok))
    }

    fn read_char_literal(
        &mut self,
        ty: NumType,
        prefix_chars: usize,
    ) -> Result<Token, CompileError> {
        let loc = self.loc();
        let start = self.pos;
        self.bump_n(prefix_chars + 1);
        let c = self
            .peek()
            .ok_or_else(|| self.err(loc, "unterminated character literal"))?;
        if c == '\n' || c == '\'' {
            return Err(self.err(loc, "empty or unterminated character literal"));
        }
        let val: u32 = if c == '\\' {
            self.bump();
            self.read_escape(loc)?
        } else {
            self.bump();
            c as u32
        };
        if self.peek() != Some('\'') {
            return Err(self.err(loc, "unterminated character literal"));
        }
        self.bump();
        // Plain character constants have type int with the value of the
        // (sign-extended) char.
        let ival = if prefix_chars == 0 {
            (val as u8) as i8 as i64
        } else {
            val as i64
        };
        let text = &self.src[start..self.pos];
        let mut tok = Token::new(TokenKind::Char, text, loc);
        tok.value = TokenValue::Int { val: ival, ty };
        Ok(self.finish_token(tok))
    }
}

/// Tokenize one canonicalized source file.
pub fn tokenize(file: &SourceFile) -> Result<Vec<Token>, CompileError> {
    Lexer::new(file).run()
}

// --- pp-number conversion ----------------------------------------------

fn parse_int_radix(digits: &str, radix: u32) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    let mut val: u64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(radix)? as u64;
        val = val.wrapping_mul(radix as u64).wrapping_add(d);
    }
    Some(val)
}

/// Hexadecimal floating constants (`0x1.8p3`).
fn parse_hex_float(s: &str) -> Option<f64> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    let (mantissa, exponent) = s.split_once(['p', 'P'])?;
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    let mut val = 0.0f64;
    for c in int_part.chars() {
        val = val * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        val += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    let exp: i32 = exponent.parse().ok()?;
    Some(val * 2f64.powi(exp))
}

fn convert_number(tok: &mut Token) -> Result<(), CompileError> {
    // C23 digit separators are purely visual.
    let text: String = tok.text.chars().filter(|&c| c != '\'').collect();

    // Try an integer constant first.
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower
        .strip_prefix("0x")
        .filter(|r| r.chars().next().is_some_and(|c| c.is_ascii_hexdigit()))
    {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else if lower.starts_with('0') && lower.len() > 1 {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };

    let suffix_start = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    let (num_part, suffix) = digits.split_at(suffix_start);
    let (is_u, l_count, suffix_ok) = {
        let mut u = false;
        let mut l = 0;
        let mut ok = true;
        let mut prev_l = false;
        for c in suffix.chars() {
            match c {
                'u' if !u => u = true,
                'l' if l == 0 || prev_l => {
                    l += 1;
                    prev_l = true;
                    if l > 2 {
                        ok = false;
                    }
                    continue;
                }
                _ => ok = false,
            }
            prev_l = false;
        }
        (u, l, ok)
    };

    if suffix_ok && !num_part.is_empty() {
        if let Some(val) = parse_int_radix(num_part, radix) {
            let is_long = l_count > 0;
            let ty = if radix == 10 {
                match (is_u, is_long) {
                    (true, true) => NumType::ULong,
                    (false, true) => NumType::Long,
                    (true, false) => {
                        if val >> 32 != 0 {
                            NumType::ULong
                        } else {
                            NumType::UInt
                        }
                    }
                    (false, false) => {
                        if val >> 31 != 0 {
                            NumType::Long
                        } else {
                            NumType::Int
                        }
                    }
                }
            } else if is_u && is_long {
                NumType::ULong
            } else if is_long {
                if val >> 63 != 0 {
                    NumType::ULong
                } else {
                    NumType::Long
                }
            } else if is_u {
                if val >> 32 != 0 {
                    NumType::ULong
                } else {
                    NumType::UInt
                }
            } else if val >> 63 != 0 {
                NumType::ULong
            } else if val >> 32 != 0 {
                NumType::Long
            } else if val >> 31 != 0 {
                NumType::UInt
            } else {
                NumType::Int
            };
            tok.kind = TokenKind::Num;
            tok.value = TokenValue::Int {
                val: val as i64,
                ty,
            };
            return Ok(());
        }
    }

    // Floating constant.
    let (body, fty) = if let Some(b) = lower.strip_suffix('f') {
        (b, NumType::Float)
    } else if let Some(b) = lower.strip_suffix('l') {
        (b, NumType::LongDouble)
    } else {
        (lower.as_str(), NumType::Double)
    };
    let fval = if body.starts_with("0x") {
        parse_hex_float(body)
    } else {
        body.parse::<f64>().ok()
    };
    match fval {
        Some(val) => {
            tok.kind = TokenKind::Num;
            tok.value = TokenValue::Float { val, ty: fty };
            Ok(())
        }
        None => Err(CompileError::Lex {
            loc: tok.loc,
            msg: format!("invalid numeric constant '{}'", tok.text),
        }),
    }
}

/// Convert every pp-number left after preprocessing into a typed constant.
pub fn convert_pp_tokens(tokens: &mut [Token]) -> Result<(), CompileError> {
    for tok in tokens.iter_mut() {
        if tok.kind == TokenKind::PpNum {
            convert_number(tok)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::print_tokens;
    use cvm_core::source::FileSet;

    fn lex(src: &str) -> Vec<Token> {
        let mut files = FileSet::new();
        let n = files.add("test.c", canonicalize(src));
        tokenize(files.get(n).unwrap()).unwrap()
    }

    fn lex_converted(src: &str) -> Vec<Token> {
        let mut toks = lex(src);
        convert_pp_tokens(&mut toks).unwrap();
        toks
    }

    #[test]
    fn punctuators_use_longest_match() {
        let toks = lex("a <<= b >> c >= d");
        let texts: Vec<_> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "<<=", "b", ">>", "c", ">=", "d", ""]);
    }

    #[test]
    fn bol_and_space_flags() {
        let toks = lex("a b\nc");
        assert!(toks[0].at_bol && !toks[0].has_space);
        assert!(!toks[1].at_bol && toks[1].has_space);
        assert!(toks[2].at_bol);
    }

    #[test]
    fn backslash_newline_is_spliced() {
        let toks = lex("ab\\\ncd");
        assert_eq!(toks[0].text, "abcd");
    }

    #[test]
    fn integer_literals() {
        let toks = lex_converted("42 0x2a 052 0b101010 42u 42l 4294967296");
        let vals: Vec<i64> = toks
            .iter()
            .filter_map(|t| match t.value {
                TokenValue::Int { val, .. } => Some(val),
                _ => None,
            })
            .collect();
        assert_eq!(vals, vec![42, 42, 42, 42, 42, 42, 4294967296]);
        match toks[6].value {
            TokenValue::Int { ty, .. } => assert_eq!(ty, NumType::Long),
            _ => panic!("expected int"),
        }
    }

    #[test]
    fn digit_separators_are_ignored() {
        let toks = lex_converted("1'000'000");
        assert_eq!(
            toks[0].value,
            TokenValue::Int {
                val: 1_000_000,
                ty: NumType::Int
            }
        );
    }

    #[test]
    fn float_literals() {
        let toks = lex_converted("3.5 1e3 2.5f 0x1.8p3");
        let vals: Vec<f64> = toks
            .iter()
            .filter_map(|t| match t.value {
                TokenValue::Float { val, .. } => Some(val),
                _ => None,
            })
            .collect();
        assert_eq!(vals, vec![3.5, 1000.0, 2.5, 12.0]);
    }

    #[test]
    fn string_escapes_decode() {
        let toks = lex("\"a\\n\\x41\\0\"");
        match &toks[0].value {
            TokenValue::Str { bytes, .. } => assert_eq!(bytes, &[b'a', b'\n', b'A', 0, 0]),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn char_literals_sign_extend() {
        let toks = lex("'\\xff'");
        assert!(matches!(toks[0].value, TokenValue::Int { val: -1, .. }));
    }

    #[test]
    fn utf16_strings_use_two_byte_units() {
        let toks = lex("u\"hi\"");
        match &toks[0].value {
            TokenValue::Str { bytes, enc } => {
                assert_eq!(*enc, StrEncoding::Utf16);
                assert_eq!(bytes, &[b'h', 0, b'i', 0, 0, 0]);
            }
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn unterminated_literal_is_fatal() {
        let mut files = FileSet::new();
        let n = files.add("test.c", canonicalize("\"abc"));
        assert!(tokenize(files.get(n).unwrap()).is_err());
    }

    #[test]
    fn token_stream_round_trips() {
        let src = "int main(void) {\n  return 40 + 2; /* c */\n}\n";
        let toks = lex(src);
        let printed = print_tokens(&toks);
        let again = lex(&printed);
        let a: Vec<_> = toks.iter().map(|t| (t.kind, t.text.clone())).collect();
        let b: Vec<_> = again.iter().map(|t| (t.kind, t.text.clone())).collect();
        assert_eq!(a, b);
    }
}
