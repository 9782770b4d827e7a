//! Tokenizer for the snippet language
//!
//! Produces an indentation-aware token stream: logical lines end in
//! `Newline`, block structure is carried by `Indent`/`Dedent`. Newlines
//! inside brackets are ignored.

use std::fmt;

/// One lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw body of an f-string, parsed later into literal and expression parts
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(n) => write!(f, "'{}'", n),
            Tok::Int(i) => write!(f, "{}", i),
            Tok::Float(x) => write!(f, "{}", x),
            Tok::Str(_) | Tok::FStr(_) => f.write_str("string literal"),
            Tok::Op(op) => write!(f, "'{}'", op),
            Tok::Newline => f.write_str("end of line"),
            Tok::Indent => f.write_str("indent"),
            Tok::Dedent => f.write_str("dedent"),
            Tok::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

/// Longest operators first so `**=` wins over `**` and `*`
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=",
    "->", ":=", "<<", ">>", "&=", "|=", "^=", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")",
    "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
    _src: &'a str,
}

/// Tokenize a whole snippet
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        _src: src,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line: self.line,
        }
    }

    fn run(&mut self) -> Result<(), LexError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).map_or(false, |d| d.is_ascii_digit())) =>
                {
                    self.number()?
                }
                c if c.is_alphabetic() || c == '_' => {
                    if !self.string_with_prefix()? {
                        self.name();
                    }
                }
                '"' | '\'' => {
                    let body = self.string_body(false)?;
                    self.push(Tok::Str(body));
                }
                _ => self.operator()?,
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected end of input inside brackets"));
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    fn push_newline(&mut self) {
        if !matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        ) {
            self.push(Tok::Newline);
        }
    }

    /// Measure leading whitespace; returns true for blank or comment-only lines
    fn handle_indentation(&mut self) -> Result<bool, LexError> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width += 4 - (width % 4),
                '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn name(&mut self) {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.push(Tok::Name(name));
    }

    /// Handle `f"..."`, `r'...'`, `rf"..."` and friends
    fn string_with_prefix(&mut self) -> Result<bool, LexError> {
        let mut len = 0;
        let mut raw = false;
        let mut fmt = false;
        while let Some(c) = self.peek_at(len) {
            match c.to_ascii_lowercase() {
                'r' if !raw => raw = true,
                'f' if !fmt => fmt = true,
                'b' | 'u' => {
                    if matches!(self.peek_at(len + 1), Some('"') | Some('\'')) {
                        return Err(self.error("byte and unicode string prefixes are not supported"));
                    }
                    return Ok(false);
                }
                _ => break,
            }
            len += 1;
            if len > 2 {
                return Ok(false);
            }
        }

        if len == 0 || !matches!(self.peek_at(len), Some('"') | Some('\'')) {
            return Ok(false);
        }

        self.pos += len;
        let body = self.string_body(raw)?;
        self.push(if fmt { Tok::FStr(body) } else { Tok::Str(body) });
        Ok(true)
    }

    fn string_body(&mut self, raw: bool) -> Result<String, LexError> {
        let quote = self.peek().ok_or_else(|| self.error("expected string"))?;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let start_line = self.line;
        let mut out = String::new();

        loop {
            let Some(c) = self.peek() else {
                return Err(LexError {
                    message: "unterminated string literal".into(),
                    line: start_line,
                });
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }

            if c == '\n' {
                if !triple {
                    return Err(LexError {
                        message: "unterminated string literal".into(),
                        line: start_line,
                    });
                }
                self.line += 1;
            }

            if c == '\\' && !raw {
                self.pos += 1;
                let esc = self.peek().ok_or_else(|| self.error("unterminated string literal"))?;
                self.pos += 1;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    '\n' => self.line += 1,
                    'x' => out.push(self.hex_escape(2)?),
                    'u' => out.push(self.hex_escape(4)?),
                    'U' => out.push(self.hex_escape(8)?),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }

            out.push(c);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, LexError> {
        let end = self.pos + digits;
        if end > self.chars.len() {
            return Err(self.error("truncated escape sequence"));
        }
        let hex: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(format!("invalid escape sequence '{}'", hex)))
    }

    fn number(&mut self) -> Result<(), LexError> {
        let start = self.pos;

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().map_or(false, |c| c.is_ascii_hexdigit() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("invalid hexadecimal literal"))?;
            self.push(Tok::Int(value));
            return Ok(());
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float && self.peek_at(1) != Some('.') {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && self.peek_at(1).map_or(false, |d| {
                    d.is_ascii_digit() || ((d == '-' || d == '+') && self.peek_at(2).map_or(false, |e| e.is_ascii_digit()))
                })
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("invalid number '{}'", text)))?;
            self.push(Tok::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("integer literal '{}' is too large", text)))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn operator(&mut self) -> Result<(), LexError> {
        for op in OPERATORS {
            let len = op.chars().count();
            if op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c))
            {
                self.pos += len;
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => {
                        if self.depth == 0 {
                            return Err(self.error(format!("unmatched '{}'", op)));
                        }
                        self.depth -= 1;
                    }
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }

        let c = self.peek().unwrap_or(' ');
        Err(self.error(format!("invalid character '{}'", c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            toks("x = 1 + 2.5"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Op("+"),
                Tok::Float(2.5),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let tokens = toks("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert_eq!(
            tokens,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = toks("xs = [\n  1,\n  2,\n]");
        assert!(!tokens[..tokens.len() - 2].contains(&Tok::Newline));
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn test_strings() {
        assert_eq!(toks(r#"'a\'b\n'"#)[0], Tok::Str("a'b\n".into()));
        assert_eq!(toks(r#"r'a\n'"#)[0], Tok::Str("a\\n".into()));
        assert_eq!(toks("f'{x}!'")[0], Tok::FStr("{x}!".into()));
        assert_eq!(toks("\"\"\"multi\nline\"\"\"")[0], Tok::Str("multi\nline".into()));
        assert_eq!(toks("'\\u00e9'")[0], Tok::Str("é".into()));
    }

    #[test]
    fn test_errors_carry_line() {
        let err = tokenize("x = 1\ny = 'open").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(tokenize("if x:\n    y\n  z").is_err());
        assert!(tokenize("x = $").is_err());
        assert!(tokenize("x = (1").is_err());
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(
            toks("a **= 2 // 3"),
            vec![
                Tok::Name("a".into()),
                Tok::Op("**="),
                Tok::Int(2),
                Tok::Op("//"),
                Tok::Int(3),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }
}
