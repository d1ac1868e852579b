use crate::mmt::data::{HasSpan, Position, Span};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum TokenKind {
    /// An unparsed numeric literal; conversion happens in the parser where
    /// a diagnostic can be attached.
    Number(String),
    Ident(String),
    /// The text between `[` and `]`, without the brackets.
    Unit(String),
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Caret,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    Comma,
    Dot,
    Unknown(char),
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Number(_) => write!(f, "number"),
            TokenKind::Ident(_) => write!(f, "identifier"),
            TokenKind::Unit(_) => write!(f, "unit"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::SlashSlash => write!(f, "'//'"),
            TokenKind::Percent => write!(f, "'%'"),
            TokenKind::Caret => write!(f, "'^'"),
            TokenKind::EqEq => write!(f, "'=='"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::LtEq => write!(f, "'<='"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::GtEq => write!(f, "'>='"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Unknown(ch) => write!(f, "'{ch}'"),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub source: Arc<str>,
}

impl HasSpan for Token {
    fn span(&self) -> Span {
        self.span
    }
}

/// A byte cursor over the source text, tracking line and character offsets.
struct Cursor {
    bytes: Vec<u8>,
    index: usize,
    pos: Position,
}

impl Cursor {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.index += 1;
        self.pos = match ch {
            b'\n' => Position::new(self.pos.line() + 1, 0),
            _ => Position::new(self.pos.line(), self.pos.character() + 1),
        };
        Some(ch)
    }

    fn bump_while(&mut self, cond: impl Fn(u8) -> bool) -> String {
        let mut out = vec![];
        while let Some(ch) = self.peek() {
            if !cond(ch) {
                break;
            }
            out.push(ch);
            self.bump();
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

pub struct Lexer {
    cursor: Cursor,
    source: Arc<str>,
}

impl Lexer {
    pub fn new(text: &str) -> Lexer {
        Lexer {
            cursor: Cursor {
                bytes: text.as_bytes().to_vec(),
                index: 0,
                pos: Position::zero(),
            },
            source: Arc::from(text),
        }
    }

    pub fn source(&self) -> Arc<str> {
        self.source.clone()
    }

    fn token(&self, kind: TokenKind, start: Position) -> Token {
        Token {
            kind,
            span: start.to(self.cursor.pos),
            source: self.source.clone(),
        }
    }

    fn number(&mut self, start: Position) -> Token {
        let mut text = self.cursor.bump_while(|ch| ch.is_ascii_digit());
        if self.cursor.peek() == Some(b'.') && self.cursor.peek_at(1).is_some_and(|ch| ch.is_ascii_digit()) {
            self.cursor.bump();
            text.push('.');
            text.push_str(&self.cursor.bump_while(|ch| ch.is_ascii_digit()));
        }
        if matches!(self.cursor.peek(), Some(b'e') | Some(b'E')) {
            let next = self.cursor.peek_at(1);
            let after_sign = self.cursor.peek_at(2);
            let exponent = match next {
                Some(d) if d.is_ascii_digit() => true,
                Some(b'+') | Some(b'-') => after_sign.is_some_and(|ch| ch.is_ascii_digit()),
                _ => false,
            };
            if exponent {
                text.push(self.cursor.bump().unwrap() as char);
                if matches!(self.cursor.peek(), Some(b'+') | Some(b'-')) {
                    text.push(self.cursor.bump().unwrap() as char);
                }
                text.push_str(&self.cursor.bump_while(|ch| ch.is_ascii_digit()));
            }
        }
        self.token(TokenKind::Number(text), start)
    }

    fn next_token(&mut self) -> Option<Token> {
        loop {
            while self
                .cursor
                .peek()
                .is_some_and(|ch| ch.is_ascii_whitespace())
            {
                self.cursor.bump();
            }
            // line comments
            if self.cursor.peek() == Some(b'#') {
                self.cursor.bump_while(|ch| ch != b'\n');
                continue;
            }
            break;
        }
        let start = self.cursor.pos;
        let ch = self.cursor.peek()?;
        match ch {
            b'0'..=b'9' => Some(self.number(start)),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let ident = self
                    .cursor
                    .bump_while(|ch| ch.is_ascii_alphanumeric() || ch == b'_');
                Some(self.token(TokenKind::Ident(ident), start))
            }
            b'[' => {
                self.cursor.bump();
                let text = self.cursor.bump_while(|ch| ch != b']');
                self.cursor.bump();
                Some(self.token(TokenKind::Unit(text.trim().to_string()), start))
            }
            _ => {
                self.cursor.bump();
                let kind = match ch {
                    b'+' => TokenKind::Plus,
                    b'-' => TokenKind::Minus,
                    b'*' => TokenKind::Star,
                    b'/' if self.cursor.peek() == Some(b'/') => {
                        self.cursor.bump();
                        TokenKind::SlashSlash
                    }
                    b'/' => TokenKind::Slash,
                    b'%' => TokenKind::Percent,
                    b'^' => TokenKind::Caret,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b',' => TokenKind::Comma,
                    b'.' => TokenKind::Dot,
                    b'=' if self.cursor.peek() == Some(b'=') => {
                        self.cursor.bump();
                        TokenKind::EqEq
                    }
                    b'!' if self.cursor.peek() == Some(b'=') => {
                        self.cursor.bump();
                        TokenKind::NotEq
                    }
                    b'<' if self.cursor.peek() == Some(b'=') => {
                        self.cursor.bump();
                        TokenKind::LtEq
                    }
                    b'<' => TokenKind::Lt,
                    b'>' if self.cursor.peek() == Some(b'=') => {
                        self.cursor.bump();
                        TokenKind::GtEq
                    }
                    b'>' => TokenKind::Gt,
                    other => TokenKind::Unknown(other as char),
                };
                Some(self.token(kind, start))
            }
        }
    }
}

impl Iterator for Lexer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.next_token()
    }
}

/// Tokenizes a full expression string.
pub fn lex(text: &str) -> Vec<Token> {
    Lexer::new(text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        lex(text).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_operators() {
        assert_eq!(
            kinds("+ - * / // % ^ == != < <= > >="),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::SlashSlash,
                TokenKind::Percent,
                TokenKind::Caret,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::LtEq,
                TokenKind::Gt,
                TokenKind::GtEq,
            ]
        );
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(
            kinds("5 5.2 1e-5 2.5E3 3e"),
            vec![
                TokenKind::Number("5".into()),
                TokenKind::Number("5.2".into()),
                TokenKind::Number("1e-5".into()),
                TokenKind::Number("2.5E3".into()),
                TokenKind::Number("3".into()),
                TokenKind::Ident("e".into()),
            ]
        );
    }

    #[test]
    fn lex_qualified_name() {
        assert_eq!(
            kinds("membrane.V"),
            vec![
                TokenKind::Ident("membrane".into()),
                TokenKind::Dot,
                TokenKind::Ident("V".into()),
            ]
        );
    }

    #[test]
    fn lex_number_with_unit() {
        assert_eq!(
            kinds("5 [mV]"),
            vec![
                TokenKind::Number("5".into()),
                TokenKind::Unit("mV".into()),
            ]
        );
    }

    #[test]
    fn lex_skips_comments() {
        assert_eq!(
            kinds("1 # the rest is ignored\n+ 2"),
            vec![
                TokenKind::Number("1".into()),
                TokenKind::Plus,
                TokenKind::Number("2".into()),
            ]
        );
    }

    #[test]
    fn spans_track_lines_and_columns() {
        let tokens = lex("1 +\n  x");
        assert_eq!(tokens[1].span.start(), Position::new(0, 2));
        assert_eq!(tokens[2].span.start(), Position::new(1, 2));
        assert_eq!(tokens[2].span.end(), Position::new(1, 3));
    }
}
