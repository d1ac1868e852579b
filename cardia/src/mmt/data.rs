use std::fmt::{Debug, Display, Formatter};

/// A source position, defined by its zero-based line offset and zero-based
/// character offset.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Position {
    line: u32,
    character: u32,
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.character)
    }
}

impl Debug for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Position {
    pub fn new(line: u32, character: u32) -> Position {
        Position { line, character }
    }

    pub fn zero() -> Position {
        Position::new(0, 0)
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn character(&self) -> u32 {
        self.character
    }

    pub fn to(&self, other: Position) -> Span {
        debug_assert!(other >= *self, "Position {other} is before {self}");
        Span::new(*self, other)
    }

    /// Returns the zero-length span formed by this position repeated.
    pub fn as_span(&self) -> Span {
        Span::new(*self, *self)
    }

    /// Returns the span covering the single character at this position.
    pub fn as_char_span(&self) -> Span {
        Span::new(*self, Position::new(self.line, self.character + 1))
    }
}

/// A half-open span in a source text: the start position is included, the
/// end position is not.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Span {
    start: Position,
    end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Span {
        Span { start, end }
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && self.end > position
    }
}

pub trait HasSpan {
    fn span(&self) -> Span;

    fn start(&self) -> Position {
        self.span().start()
    }

    fn end(&self) -> Position {
        self.span().end()
    }
}

impl HasSpan for Span {
    fn span(&self) -> Span {
        *self
    }
}
