//! The expression parser: a right-binding-power (top-down operator
//! precedence) parser over the token stream, producing expression trees
//! with source tokens attached for diagnostics.

use crate::mmt::data::{HasSpan, Position, Span};
use crate::mmt::diagnostics::Diagnostic;
use crate::mmt::error_codes::ErrorCode;
use crate::mmt::expression::{BinaryOp, Expr, MathFunction, PREFIX};
use crate::mmt::lexer::{lex, Token, TokenKind};
use crate::mmt::model::Component;
use crate::mmt::unit::parse_unit;
use itertools::Itertools;
use std::sync::Arc;

type Result<T> = std::result::Result<T, Diagnostic>;

pub struct Parser {
    tokens: Vec<Token>,
    index: usize,
    source: Arc<str>,
    context: Option<Component>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(text: &str, context: Option<&Component>) -> Parser {
        Parser {
            tokens: lex(text),
            index: 0,
            source: Arc::from(text),
            context: context.cloned(),
            diagnostics: vec![],
        }
    }

    /// Parses the whole input as a single expression.
    pub fn parse(&mut self) -> Result<Expr> {
        let expr = self.expression(0)?;
        if let Some(token) = self.peek() {
            return Err(self.error_at(
                token.span,
                ErrorCode::Expected,
                format!("Expected end of input, found {}", token.kind),
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn end_position(&self) -> Position {
        self.tokens
            .last()
            .map(|t| t.span.end())
            .unwrap_or_else(Position::zero)
    }

    fn error_at(&self, span: Span, code: ErrorCode, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(span, self.source.clone(), code, message)
    }

    fn unexpected_eof(&self, expected: &str) -> Diagnostic {
        self.error_at(
            self.end_position().as_span(),
            ErrorCode::UnexpectedEof,
            format!("Unexpected end of input, expected {expected}"),
        )
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(self.error_at(
                token.span,
                ErrorCode::Expected,
                format!("Expected {kind}, found {}", token.kind),
            )),
            None => Err(self.unexpected_eof(&kind.to_string())),
        }
    }

    /// Precedence climbing: consumes infix operators that bind more
    /// strongly than `rbp`.
    fn expression(&mut self, rbp: u8) -> Result<Expr> {
        let mut left = self.prefix()?;
        while let Some((op, token)) = self.peek_infix() {
            if op.rbp() <= rbp {
                break;
            }
            self.index += 1;
            let right = self.expression(op.rbp())?;
            left = Expr::binary(op, left, right).attach_token(token);
        }
        Ok(left)
    }

    fn peek_infix(&self) -> Option<(BinaryOp, Token)> {
        let token = self.peek()?;
        let op = match &token.kind {
            TokenKind::Plus => BinaryOp::Plus,
            TokenKind::Minus => BinaryOp::Minus,
            TokenKind::Star => BinaryOp::Multiply,
            TokenKind::Slash => BinaryOp::Divide,
            TokenKind::SlashSlash => BinaryOp::Quotient,
            TokenKind::Percent => BinaryOp::Remainder,
            TokenKind::Caret => BinaryOp::Power,
            TokenKind::EqEq => BinaryOp::Equal,
            TokenKind::NotEq => BinaryOp::NotEqual,
            TokenKind::Lt => BinaryOp::Less,
            TokenKind::LtEq => BinaryOp::LessEqual,
            TokenKind::Gt => BinaryOp::More,
            TokenKind::GtEq => BinaryOp::MoreEqual,
            TokenKind::Ident(name) if name == "and" => BinaryOp::And,
            TokenKind::Ident(name) if name == "or" => BinaryOp::Or,
            _ => return None,
        };
        Some((op, token.clone()))
    }

    fn prefix(&mut self) -> Result<Expr> {
        let Some(token) = self.advance() else {
            return Err(self.unexpected_eof("an expression"));
        };
        match token.kind.clone() {
            TokenKind::Number(text) => self.number(token, &text),
            TokenKind::Plus => {
                let op = self.expression(PREFIX)?;
                Ok(Expr::prefix_plus(op).attach_token(token))
            }
            TokenKind::Minus => {
                let op = self.expression(PREFIX)?;
                Ok(Expr::prefix_minus(op).attach_token(token))
            }
            TokenKind::LParen => {
                let expr = self.expression(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) if name == "not" => {
                let op = self.expression(PREFIX)?;
                Ok(Expr::not(op).attach_token(token))
            }
            TokenKind::Ident(name) => {
                if matches!(self.peek(), Some(t) if t.kind == TokenKind::LParen) {
                    self.call(token, &name)
                } else {
                    self.name(token, &name)
                }
            }
            kind => Err(self.error_at(
                token.span,
                ErrorCode::Expected,
                format!("Expected an expression, found {kind}"),
            )),
        }
    }

    fn number(&mut self, token: Token, text: &str) -> Result<Expr> {
        let value: f64 = text.parse().map_err(|_| {
            self.error_at(
                token.span,
                ErrorCode::InvalidNumber,
                format!("Invalid number '{text}'"),
            )
        })?;
        let mut unit = None;
        if let Some(unit_token) = self.peek().cloned() {
            if let TokenKind::Unit(text) = &unit_token.kind {
                self.index += 1;
                unit = Some(parse_unit(text).map_err(|message| {
                    self.error_at(unit_token.span, ErrorCode::InvalidUnit, message)
                })?);
            }
        }
        Ok(Expr::number_with_unit(value, unit).attach_token(token))
    }

    /// A call: a built-in function, a conditional, or one of the
    /// `dot`/`init`/`partial` operators.
    fn call(&mut self, token: Token, name: &str) -> Result<Expr> {
        let args = self.arguments()?;
        let wrong_arity = |expected: &str| {
            self.error_at(
                token.span,
                ErrorCode::WrongArity,
                format!("{name}() expects {expected} argument(s)"),
            )
        };
        let expr = match name {
            "if" => {
                let Ok([cond, then, otherwise]) = <[Expr; 3]>::try_from(args) else {
                    return Err(wrong_arity("3"));
                };
                Expr::if_then_else(cond, then, otherwise)
            }
            "piecewise" => Expr::piecewise(args).map_err(|e| {
                self.error_at(token.span, ErrorCode::WrongArity, e.message().to_string())
            })?,
            "dot" => {
                let Ok([op]) = <[Expr; 1]>::try_from(args) else {
                    return Err(wrong_arity("1"));
                };
                Expr::derivative(op).map_err(|e| {
                    self.error_at(token.span, ErrorCode::Expected, e.message().to_string())
                })?
            }
            "init" => {
                let Ok([op]) = <[Expr; 1]>::try_from(args) else {
                    return Err(wrong_arity("1"));
                };
                Expr::initial(op).map_err(|e| {
                    self.error_at(token.span, ErrorCode::Expected, e.message().to_string())
                })?
            }
            "partial" => {
                let Ok([a, b]) = <[Expr; 2]>::try_from(args) else {
                    return Err(wrong_arity("2"));
                };
                Expr::partial(a, b).map_err(|e| {
                    self.error_at(token.span, ErrorCode::Expected, e.message().to_string())
                })?
            }
            name => match MathFunction::from_name(name) {
                Some(function) => Expr::function(function, args).map_err(|_| {
                    wrong_arity(
                        &function
                            .arities()
                            .iter()
                            .map(usize::to_string)
                            .join(" or "),
                    )
                })?,
                None => {
                    return Err(self.error_at(
                        token.span,
                        ErrorCode::UnresolvedName,
                        format!("Unknown function '{name}'"),
                    ));
                }
            },
        };
        Ok(expr.attach_token(token))
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let mut args = vec![];
        if matches!(self.peek(), Some(t) if t.kind == TokenKind::RParen) {
            self.index += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression(0)?);
            match self.advance() {
                Some(token) if token.kind == TokenKind::Comma => continue,
                Some(token) if token.kind == TokenKind::RParen => return Ok(args),
                Some(token) => {
                    return Err(self.error_at(
                        token.span,
                        ErrorCode::Expected,
                        format!("Expected ',' or ')', found {}", token.kind),
                    ));
                }
                None => return Err(self.unexpected_eof("',' or ')'")),
            }
        }
    }

    /// A possibly dotted variable reference, resolved against the context
    /// component when one is available.
    fn name(&mut self, token: Token, first: &str) -> Result<Expr> {
        let mut parts = vec![first.to_string()];
        let mut end = token.span.end();
        while matches!(self.peek(), Some(t) if t.kind == TokenKind::Dot) {
            self.index += 1;
            match self.advance() {
                Some(part) => match &part.kind {
                    TokenKind::Ident(name) => {
                        parts.push(name.clone());
                        end = part.span.end();
                    }
                    kind => {
                        return Err(self.error_at(
                            part.span,
                            ErrorCode::Expected,
                            format!("Expected identifier after '.', found {kind}"),
                        ));
                    }
                },
                None => return Err(self.unexpected_eof("an identifier")),
            }
        }
        let span = token.span.start().to(end);
        let qname = parts.iter().join(".");

        let Some(context) = self.context.clone() else {
            // No resolution context: keep a sentinel so purely literal
            // expressions still parse, and let validation flag the name.
            let warning = self.error_at(
                span,
                ErrorCode::SentinelName,
                format!("Name '{qname}' was not resolved against a model"),
            );
            self.diagnostics.push(warning);
            return Ok(Expr::sentinel_name(qname).attach_token(token));
        };

        if let Some(variable) = resolve(&context, &parts) {
            return Ok(Expr::name(&variable).attach_token(token));
        }
        Err(self.error_at(
            span,
            ErrorCode::UnresolvedName,
            format!("Unknown variable '{qname}'"),
        ))
    }
}

/// Resolution order: local variable (descending into nested variables),
/// then alias, then fully qualified name.
fn resolve(context: &Component, parts: &[String]) -> Option<crate::mmt::model::Variable> {
    if let Some(mut variable) = context.variable(&parts[0]) {
        let mut found = true;
        for part in &parts[1..] {
            match variable.nested(part) {
                Some(nested) => variable = nested,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            return Some(variable);
        }
    }
    if parts.len() == 1 {
        if let Some(variable) = context.alias(&parts[0]) {
            return Some(variable);
        }
    }
    context
        .model()
        .and_then(|model| model.variable(&parts.iter().join(".")))
}

/// Parses a single expression, resolving names against `context`.
pub fn parse_expression(text: &str, context: Option<&Component>) -> Result<Expr> {
    Parser::new(text, context).parse()
}
