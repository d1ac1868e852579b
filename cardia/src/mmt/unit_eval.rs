//! Unit inference over expression trees.
//!
//! Unlike numeric evaluation, unit evaluation walks every branch of an
//! expression: unit checking is a static property of the whole tree, so
//! conditionals do not short-circuit here.

use crate::mmt::diagnostics::IncompatibleUnitError;
use crate::mmt::eval::Precision;
use crate::mmt::expression::{
    BinaryOp, Expr, ExprKind, MathFunction, NameTarget, UnaryOp,
};
use crate::mmt::unit::{Unit, UnitMode};

struct UnitError {
    expr: Expr,
    message: String,
}

type Result<T = Option<Unit>> = std::result::Result<T, UnitError>;

fn fail<T>(expr: &Expr, message: impl Into<String>) -> Result<T> {
    Err(UnitError {
        expr: expr.clone(),
        message: message.into(),
    })
}

impl Expr {
    /// Evaluates the unit this expression should have, based on the units
    /// of its variables and literals.
    ///
    /// In strict mode every unspecified unit reads as dimensionless and the
    /// result is always a concrete unit (or an error). In tolerant mode
    /// unspecified units propagate as `None` and only conflicts between
    /// concretely known units are reported. Results, including errors, are
    /// cached per mode per node.
    pub fn eval_unit(
        &self,
        mode: UnitMode,
    ) -> std::result::Result<Option<Unit>, IncompatibleUnitError> {
        let slot = match mode {
            UnitMode::Tolerant => &self.caches().unit_tolerant,
            UnitMode::Strict => &self.caches().unit_strict,
        };
        if let Some(cached) = slot.read().clone() {
            return cached;
        }
        let result = self.unit_inner(mode).map_err(|e| {
            IncompatibleUnitError::new(unit_error_message(self, &e), e.expr.span().or(self.span()))
        });
        *slot.write() = Some(result.clone());
        result
    }

    fn unit_inner(&self, mode: UnitMode) -> Result {
        // Reuse a successfully cached result; errors are re-derived so the
        // entry point can attach its own context.
        {
            let slot = match mode {
                UnitMode::Tolerant => &self.caches().unit_tolerant,
                UnitMode::Strict => &self.caches().unit_strict,
            };
            if let Some(Ok(unit)) = slot.read().clone() {
                return Ok(unit);
            }
        }
        let result = self.unit_of_kind(mode)?;
        let slot = match mode {
            UnitMode::Tolerant => &self.caches().unit_tolerant,
            UnitMode::Strict => &self.caches().unit_strict,
        };
        let mut guard = slot.write();
        if guard.is_none() {
            *guard = Some(Ok(result.clone()));
        }
        Ok(result)
    }

    fn unit_of_kind(&self, mode: UnitMode) -> Result {
        match self.kind() {
            ExprKind::Number { unit, .. } => Ok(match mode {
                UnitMode::Strict => unit.clone().or_else(|| Some(Unit::dimensionless())),
                UnitMode::Tolerant => unit.clone(),
            }),
            // The unit comes from the variable's declaration, never from its
            // defining expression: an unspecified unit must stay unspecified
            // in tolerant mode, and following definitions could cycle.
            ExprKind::Name(NameTarget::Variable(var_ref)) => match var_ref.upgrade() {
                Some(var) => Ok(var.unit(mode)),
                None => Ok(unlinked(mode)),
            },
            ExprKind::Name(NameTarget::Sentinel(_)) => Ok(unlinked(mode)),
            ExprKind::Derivative(op) => {
                let numerator = op.unit_inner(mode)?;
                let denominator = match op.var().and_then(|v| v.model()) {
                    Some(model) => model.time_unit(mode),
                    None => unlinked(mode),
                };
                Ok(divide_units(numerator, denominator))
            }
            ExprKind::Partial(a, b) => {
                let numerator = a.unit_inner(mode)?;
                let denominator = b.unit_inner(mode)?;
                Ok(divide_units(numerator, denominator))
            }
            ExprKind::Initial(op) => op.unit_inner(mode),
            ExprKind::Unary(UnaryOp::Plus, x) | ExprKind::Unary(UnaryOp::Minus, x) => {
                x.unit_inner(mode)
            }
            ExprKind::Unary(UnaryOp::Not, x) => {
                let unit = x.unit_inner(mode)?;
                match unit {
                    None => Ok(None),
                    Some(ref u) if u.is_dimensionless() => Ok(unit),
                    Some(u) => fail(
                        self,
                        format!("Operator `not` expects a dimensionless operand, got {u}."),
                    ),
                }
            }
            ExprKind::Binary(op, left, right) => self.binary_unit(*op, left, right, mode),
            ExprKind::Function(f, args) => self.function_unit(*f, args, mode),
            ExprKind::If(cond, then, otherwise) => {
                cond.unit_inner(mode)?;
                let unit2 = then.unit_inner(mode)?;
                let unit3 = otherwise.unit_inner(mode)?;
                if unit2 == unit3 {
                    return Ok(unit2);
                }
                match (unit2, unit3) {
                    (None, unit) | (unit, None) => Ok(unit),
                    (Some(a), Some(b)) => fail(
                        self,
                        format!(
                            "Units of `then` and `else` part of an `if` must match. Got {a} and \
                             {b}."
                        ),
                    ),
                }
            }
            ExprKind::Piecewise(ops) => {
                let mut units: Vec<Unit> = vec![];
                let mut any_none = false;
                for (i, op) in ops.iter().enumerate() {
                    let unit = op.unit_inner(mode)?;
                    // Even-indexed operands (except the final default) are
                    // conditions; their units are checked and discarded.
                    let is_condition = i % 2 == 0 && i != ops.len() - 1;
                    if is_condition {
                        continue;
                    }
                    match unit {
                        None => any_none = true,
                        Some(unit) => {
                            if !units.contains(&unit) {
                                units.push(unit);
                            }
                        }
                    }
                }
                match units.len() {
                    0 if any_none => Ok(None),
                    0 => Ok(Some(Unit::dimensionless())),
                    1 => Ok(Some(units.pop().unwrap())),
                    _ => fail(
                        self,
                        "All branches of a piecewise() must have the same unit.",
                    ),
                }
            }
        }
    }

    fn binary_unit(&self, op: BinaryOp, left: &Expr, right: &Expr, mode: UnitMode) -> Result {
        let unit1 = left.unit_inner(mode)?;
        let unit2 = right.unit_inner(mode)?;
        match op {
            BinaryOp::Plus | BinaryOp::Minus => {
                if unit1 == unit2 {
                    return Ok(unit1);
                }
                match (unit1, unit2) {
                    (None, unit) | (unit, None) => Ok(unit),
                    (Some(a), Some(b)) => {
                        let verb = if op == BinaryOp::Plus {
                            "Addition"
                        } else {
                            "Subtraction"
                        };
                        fail(self, format!("{verb} requires equal units, got {a} and {b}."))
                    }
                }
            }
            BinaryOp::Multiply => match (unit1, unit2) {
                (None, unit) | (unit, None) => Ok(unit),
                (Some(a), Some(b)) => Ok(Some(&a * &b)),
            },
            BinaryOp::Divide | BinaryOp::Quotient => Ok(divide_units(unit1, unit2)),
            // 14 pizzas divided over 5 kids leaves 4 pizzas: the remainder
            // keeps the left operand's unit. The right unit was still
            // evaluated above, so errors inside it surface.
            BinaryOp::Remainder => Ok(unit1),
            BinaryOp::Power => {
                if mode == UnitMode::Strict
                    && unit2.as_ref().is_some_and(|u| !u.is_dimensionless())
                {
                    return fail(self, "Exponent in Power must be dimensionless.");
                }
                let Some(base) = unit1 else {
                    return Ok(None);
                };
                if base.is_dimensionless() {
                    return Ok(Some(Unit::dimensionless()));
                }
                let exponent = match right.eval(None, Precision::Double) {
                    Ok(value) => value,
                    Err(_) => {
                        return fail(
                            self,
                            "The unit of a power with a non-dimensionless base can only be \
                             derived if its exponent can be evaluated.",
                        );
                    }
                };
                match base.powf(exponent) {
                    Some(unit) => Ok(Some(unit)),
                    None => fail(
                        self,
                        format!(
                            "The exponent {exponent} has no rational representation, so the \
                             unit of this power cannot be derived."
                        ),
                    ),
                }
            }
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::More
            | BinaryOp::MoreEqual => {
                if unit1 == unit2 {
                    return Ok(unit1.map(|_| Unit::dimensionless()));
                }
                match (unit1, unit2) {
                    (None, _) | (_, None) => Ok(Some(Unit::dimensionless())),
                    (Some(a), Some(b)) => fail(
                        self,
                        format!(
                            "Condition {} requires equal units on both sides, got {a} and {b}.",
                            op.rep()
                        ),
                    ),
                }
            }
            BinaryOp::And | BinaryOp::Or => {
                if unit1.is_none() && unit2.is_none() {
                    return Ok(None);
                }
                let a = unit1.unwrap_or_else(Unit::dimensionless);
                let b = unit2.unwrap_or_else(Unit::dimensionless);
                if a.is_dimensionless() && b.is_dimensionless() {
                    Ok(Some(a))
                } else {
                    fail(
                        self,
                        format!("Operator `{}` expects dimensionless operands.", op.rep()),
                    )
                }
            }
        }
    }

    fn function_unit(&self, function: MathFunction, args: &[Expr], mode: UnitMode) -> Result {
        match function {
            MathFunction::Sqrt => {
                let unit = args[0].unit_inner(mode)?;
                Ok(unit.map(|u| u.pow(crate::mmt::unit::Rational::new(1, 2))))
            }
            MathFunction::Floor | MathFunction::Ceil | MathFunction::Abs => {
                args[0].unit_inner(mode)
            }
            MathFunction::Log => {
                let units: Vec<Option<Unit>> = args
                    .iter()
                    .map(|a| a.unit_inner(mode))
                    .collect::<Result<_>>()?;
                if units.iter().all(Option::is_none) {
                    return Ok(None);
                }
                if mode == UnitMode::Strict
                    && units
                        .iter()
                        .any(|u| u.as_ref().is_some_and(|u| !u.is_dimensionless()))
                {
                    return fail(self, "log() requires dimensionless operands.");
                }
                Ok(Some(Unit::dimensionless()))
            }
            // All remaining functions are dimensionless-to-dimensionless.
            _ => {
                let unit = args[0].unit_inner(mode)?;
                let Some(unit) = unit else {
                    return Ok(None);
                };
                if mode == UnitMode::Strict && !unit.is_dimensionless() {
                    return fail(
                        self,
                        format!(
                            "Function {}() requires a dimensionless operand, got {unit}.",
                            function.name()
                        ),
                    );
                }
                Ok(Some(Unit::dimensionless()))
            }
        }
    }
}

fn unlinked(mode: UnitMode) -> Option<Unit> {
    match mode {
        UnitMode::Strict => Some(Unit::dimensionless()),
        UnitMode::Tolerant => None,
    }
}

fn divide_units(numerator: Option<Unit>, denominator: Option<Unit>) -> Option<Unit> {
    match (numerator, denominator) {
        (unit, None) => unit,
        (None, Some(b)) => Some(b.inverse()),
        (Some(a), Some(b)) => Some(&a / &b),
    }
}

fn unit_error_message(owner: &Expr, error: &UnitError) -> String {
    let mut out = vec![error.message.clone()];
    out.push("Encountered when evaluating".to_string());
    let owner_line = format!("  {}", owner.code(None));
    out.push(owner_line.clone());
    let err_str = error.expr.code(None);
    if let Some(start) = owner_line.find(&err_str) {
        out.push(format!("{}{}", " ".repeat(start), "~".repeat(err_str.len())));
    }
    out.join("\n")
}
