//! A symbolic expression engine for cardiac cell models.
//!
//! Models are systems of ordinary differential and algebraic equations;
//! each right-hand side is an expression tree that this crate represents,
//! evaluates, unit-checks, differentiates, renders and validates. See the
//! [`mmt`] module for the engine itself.

pub mod mmt;
