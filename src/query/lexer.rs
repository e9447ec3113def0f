//! Tokenizer for the query language.

use super::errors::QueryError;

/// Token kinds. Keywords are plain identifiers; the parser matches them
/// case-insensitively.
#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    /// Identifier or keyword.
    Ident(String),
    /// Backtick-quoted identifier (never a keyword).
    Quoted(String),
    /// String literal.
    Str(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// `$name` parameter.
    Param(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    DotDot,
    Colon,
    Semicolon,
    Pipe,
    Star,
    Plus,
    PlusEq,
    Minus,
    Slash,
    Percent,
    Caret,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// End of input.
    Eof,
}

/// A token with its 1-based source position.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek2(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::parse(message, self.line, self.column)
    }

    fn skip_trivia(&mut self) -> Result<(), QueryError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek2() == Some('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek2() == Some('*') => {
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(self.error("unterminated comment"));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, QueryError> {
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string literal"));
            };
            match c {
                c if c == quote => return Ok(out),
                '\\' => {
                    let Some(escaped) = self.bump() else {
                        return Err(self.error("unterminated string literal"));
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        'u' => {
                            let mut code = String::new();
                            for _ in 0..4 {
                                match self.bump() {
                                    Some(h) if h.is_ascii_hexdigit() => code.push(h),
                                    _ => return Err(self.error("invalid unicode escape")),
                                }
                            }
                            let ch = u32::from_str_radix(&code, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid unicode escape"))?;
                            out.push(ch);
                        }
                        other => return Err(self.error(format!("invalid escape `\\{other}`"))),
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char) -> Result<Tok, QueryError> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float && self.peek2().is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek2()
                    .is_some_and(|d| d.is_ascii_digit() || d == '-' || d == '+')
            {
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(sign) = self.peek().filter(|s| *s == '-' || *s == '+') {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid number `{text}`")))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("integer `{text}` is too large")))
        }
    }

    fn ident(&mut self, first: char) -> String {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }
}

/// Splits `input` into tokens, ending with [`Tok::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut lx = Lexer {
        chars: input.char_indices().peekable(),
        line: 1,
        column: 1,
    };
    let mut out = Vec::new();
    loop {
        lx.skip_trivia()?;
        let (line, column) = (lx.line, lx.column);
        let Some(c) = lx.bump() else {
            out.push(Token {
                tok: Tok::Eof,
                line,
                column,
            });
            return Ok(out);
        };
        let tok = match c {
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            ';' => Tok::Semicolon,
            '|' => Tok::Pipe,
            '*' => Tok::Star,
            '-' => Tok::Minus,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '^' => Tok::Caret,
            '=' => Tok::Eq,
            '.' if lx.peek() == Some('.') => {
                lx.bump();
                Tok::DotDot
            }
            '.' => Tok::Dot,
            '+' if lx.peek() == Some('=') => {
                lx.bump();
                Tok::PlusEq
            }
            '+' => Tok::Plus,
            '<' if lx.peek() == Some('=') => {
                lx.bump();
                Tok::Le
            }
            '<' if lx.peek() == Some('>') => {
                lx.bump();
                Tok::Ne
            }
            '<' => Tok::Lt,
            '>' if lx.peek() == Some('=') => {
                lx.bump();
                Tok::Ge
            }
            '>' => Tok::Gt,
            '!' if lx.peek() == Some('=') => {
                lx.bump();
                Tok::Ne
            }
            '\'' | '"' => Tok::Str(lx.string(c)?),
            '`' => {
                let mut name = String::new();
                loop {
                    match lx.bump() {
                        Some('`') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(QueryError::parse(
                                "unterminated quoted identifier",
                                line,
                                column,
                            ))
                        }
                    }
                }
                Tok::Quoted(name)
            }
            '$' => match lx.bump() {
                Some(ch) if ch.is_alphanumeric() || ch == '_' => Tok::Param(lx.ident(ch)),
                _ => return Err(QueryError::parse("expected parameter name after `$`", line, column)),
            },
            c if c.is_ascii_digit() => lx.number(c)?,
            c if c.is_alphabetic() || c == '_' => Tok::Ident(lx.ident(c)),
            other => {
                return Err(QueryError::parse(
                    format!("unexpected character `{other}`"),
                    line,
                    column,
                ))
            }
        };
        out.push(Token { tok, line, column });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Tok> {
        tokenize(input).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn ranges_do_not_lex_as_floats() {
        assert_eq!(
            kinds("*1..3"),
            vec![Tok::Star, Tok::Int(1), Tok::DotDot, Tok::Int(3), Tok::Eof]
        );
        assert_eq!(kinds("1.5e2"), vec![Tok::Float(150.0), Tok::Eof]);
    }

    #[test]
    fn arrows_and_comparisons() {
        assert_eq!(
            kinds("<-->= <>"),
            vec![Tok::Lt, Tok::Minus, Tok::Minus, Tok::Ge, Tok::Ne, Tok::Eof]
        );
    }

    #[test]
    fn positions_track_lines() {
        let toks = tokenize("MATCH (n)\n  RETURN 'x\\'y' // trailing").unwrap();
        let ret = &toks[4];
        assert_eq!(ret.tok, Tok::Ident("RETURN".into()));
        assert_eq!((ret.line, ret.column), (2, 3));
        assert_eq!(toks[5].tok, Tok::Str("x'y".into()));
    }

    #[test]
    fn unterminated_string_reports_position() {
        let err = tokenize("RETURN 'abc").unwrap_err();
        assert!(matches!(err, QueryError::Parse { line: 1, .. }));
    }
}
