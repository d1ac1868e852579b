use crate::mmt::data::{HasSpan, Span};
use crate::mmt::error_codes::{ErrorCode, SeverityMap};
use codespan_reporting::diagnostic as codespan;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Severity {
    Error,
    Warning,
    Hint,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Hint => write!(f, "hint"),
        }
    }
}

/// A located message produced while lexing, parsing or analyzing an
/// expression.
#[derive(PartialEq, Debug, Clone)]
pub struct Diagnostic {
    code: ErrorCode,
    span: Span,
    source: Arc<str>,
    message: String,
}

impl Diagnostic {
    pub fn new(
        span: Span,
        source: Arc<str>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Diagnostic {
        Diagnostic {
            code,
            span,
            source,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Arc<str> {
        self.source.clone()
    }

    /// Converts this diagnostic for rendering with `codespan_reporting`.
    ///
    /// The `offsets` parameter must give the byte offset at the start of
    /// every source line.
    pub fn into_codespan_diagnostic(
        self,
        file_id: usize,
        line_offsets: &[usize],
        severities: &SeverityMap,
    ) -> codespan::Diagnostic<usize> {
        let severity = match severities[self.code] {
            Severity::Error => codespan::Severity::Error,
            Severity::Warning => codespan::Severity::Warning,
            Severity::Hint => codespan::Severity::Help,
        };
        let to_offset = |pos: crate::mmt::data::Position| {
            line_offsets
                .get(pos.line() as usize)
                .copied()
                .unwrap_or(0)
                + pos.character() as usize
        };
        let range = to_offset(self.span.start())..to_offset(self.span.end());
        codespan::Diagnostic::new(severity)
            .with_code(self.code.as_ref())
            .with_message(self.message)
            .with_labels(vec![codespan::Label::primary(file_id, range)])
    }
}

impl HasSpan for Diagnostic {
    fn span(&self) -> Span {
        self.span
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}: {}",
            self.span.start().line() + 1,
            self.span.start().character() + 1,
            self.message
        )
    }
}

/// A structural error: malformed construction or failed validation.
///
/// Trees that fail validation must not be evaluated.
#[derive(PartialEq, Debug, Clone)]
pub struct IntegrityError {
    message: String,
    span: Option<Span>,
}

impl IntegrityError {
    pub fn new(message: impl Into<String>, span: Option<Span>) -> IntegrityError {
        IntegrityError {
            message: message.into(),
            span,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }
}

impl Display for IntegrityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IntegrityError {}

/// A unit inference failure, raised by strict unit evaluation and by
/// tolerant evaluation when concretely known units conflict.
#[derive(PartialEq, Debug, Clone)]
pub struct IncompatibleUnitError {
    message: String,
    span: Option<Span>,
}

impl IncompatibleUnitError {
    pub fn new(message: impl Into<String>, span: Option<Span>) -> IncompatibleUnitError {
        IncompatibleUnitError {
            message: message.into(),
            span,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }
}

impl Display for IncompatibleUnitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.span {
            Some(span) => write!(
                f,
                "Incompatible units on line {}: {}",
                span.start().line() + 1,
                self.message
            ),
            None => write!(f, "Incompatible units: {}", self.message),
        }
    }
}

impl std::error::Error for IncompatibleUnitError {}

/// A numeric evaluation failure. The message is multi-line: it names the
/// offending sub-expression, the values of its operands, and the values of
/// the variables the sub-expression refers to.
#[derive(PartialEq, Debug, Clone)]
pub struct NumericalError {
    message: String,
}

impl NumericalError {
    pub fn new(message: impl Into<String>) -> NumericalError {
        NumericalError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for NumericalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NumericalError {}
