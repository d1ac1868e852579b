//! The `mmt` expression engine: the in-memory representation of model
//! equations and the operations defined over them.
//!
//! Expressions are immutable trees over numbers, variable references,
//! arithmetic, transcendental functions, conditionals and the
//! derivative/initial-value operators. On top of the tree the engine
//! provides numeric evaluation, unit inference, symbolic partial
//! differentiation, precedence-aware rendering, a canonical form with
//! structural equality and hashing, and integrity validation.

mod data;
mod derive;
mod diagnostics;
mod error_codes;
mod eval;
mod expression;
mod lexer;
mod model;
mod parser;
mod render;
mod unit;
mod unit_eval;

pub use data::{HasSpan, Position, Span};
pub use derive::derivative_value;
pub use diagnostics::{
    Diagnostic, IncompatibleUnitError, IntegrityError, NumericalError, Severity,
};
pub use error_codes::{ErrorCode, SeverityMap};
pub use eval::Precision;
pub use expression::{
    BinaryOp, Expr, ExprKind, MathFunction, NameTarget, RetainSet, SubstMap, UnaryOp, Walk,
    CONDITIONAL, CONDITION_AND, FUNCTION_CALL, LITERAL, POWER, PREFIX, PRODUCT, SUM,
};
pub use lexer::{lex, Lexer, Token, TokenKind};
pub use model::{Component, Model, VarRef, Variable};
pub use parser::{parse_expression, Parser};
pub use render::format_number;
pub use unit::{parse_unit, units, Rational, Unit, UnitMode};
