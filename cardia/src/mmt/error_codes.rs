use crate::mmt::diagnostics::Severity;
use enum_map::{enum_map, Enum, EnumMap};
use std::ops::Index;
use strum::{AsRefStr, EnumString};

#[derive(PartialEq, Debug, Copy, Clone, EnumString, AsRefStr, Enum)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    UnexpectedEof,
    Expected,
    InvalidNumber,
    InvalidUnit,
    UnresolvedName,
    SentinelName,
    WrongArity,
    IntegrityViolation,
    IncompatibleUnits,
    NumericalFault,
}

/// The `SeverityMap` maps error codes to severities.
///
/// Implementation for `Index` is provided, so elements within the map can
/// be accessed using the `[]` operator.
#[derive(Clone, PartialEq, Eq, Debug, Copy)]
pub struct SeverityMap {
    // Using an `EnumMap` ensures that each error code is mapped to exactly
    // one severity.
    inner: EnumMap<ErrorCode, Severity>,
}

impl Default for SeverityMap {
    fn default() -> Self {
        use ErrorCode::*;
        let map = enum_map! {
            UnexpectedEof
            | Expected
            | InvalidNumber
            | InvalidUnit
            | UnresolvedName
            | WrongArity
            | IntegrityViolation
            | IncompatibleUnits
            | NumericalFault => Severity::Error,
            // A name without a resolution context parses to a sentinel that
            // later fails validation; at parse time it is only a warning.
            SentinelName => Severity::Warning
        };
        SeverityMap { inner: map }
    }
}

impl Index<ErrorCode> for SeverityMap {
    type Output = Severity;

    fn index(&self, key: ErrorCode) -> &Self::Output {
        self.inner.index(key)
    }
}
