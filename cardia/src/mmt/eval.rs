//! Numeric evaluation of expression trees.
//!
//! Internal failures carry the offending sub-expression; the public entry
//! point turns them into a `NumericalError` whose message shows where in
//! the tree the failure happened, the operand values, and the values of the
//! variables involved.

use crate::mmt::diagnostics::NumericalError;
use crate::mmt::expression::{
    BinaryOp, Expr, ExprKind, MathFunction, NameTarget, SubstMap, UnaryOp,
};
use crate::mmt::render::format_number;

/// Evaluation precision. Single precision rounds through `f32` at every
/// step, for debugging precision-sensitive models.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    fn clamp(&self, value: f64) -> f64 {
        match self {
            Precision::Single => value as f32 as f64,
            Precision::Double => value,
        }
    }
}

struct EvalError {
    expr: Expr,
    message: String,
}

type Result<T = f64> = std::result::Result<T, EvalError>;

fn fail<T>(expr: &Expr, message: impl Into<String>) -> Result<T> {
    Err(EvalError {
        expr: expr.clone(),
        message: message.into(),
    })
}

impl Expr {
    /// Evaluates this expression to a number.
    ///
    /// Names resolve through their variable's defining expression; a state
    /// variable evaluates to its current state value. The optional `subst`
    /// map replaces matching sub-expressions before resolution; substituted
    /// values are evaluated as-is, without further substitution.
    pub fn eval(
        &self,
        subst: Option<&SubstMap>,
        precision: Precision,
    ) -> std::result::Result<f64, NumericalError> {
        self.eval_inner(subst, precision)
            .map_err(|e| NumericalError::new(error_message(self, &e, subst, precision)))
    }

    fn eval_inner(&self, subst: Option<&SubstMap>, precision: Precision) -> Result {
        match self.kind() {
            ExprKind::Number { value, .. } => Ok(precision.clamp(*value)),
            ExprKind::Name(_) | ExprKind::Derivative(_) => {
                if let Some(replacement) = subst.and_then(|s| s.get(self)) {
                    return replacement.eval_inner(None, precision);
                }
                match rhs_of(self) {
                    Some(rhs) => rhs.eval_inner(subst, precision),
                    None => fail(self, format!("No value found for {}", self.code(None))),
                }
            }
            ExprKind::Partial(..) | ExprKind::Initial(_) => {
                if let Some(replacement) = subst.and_then(|s| s.get(self)) {
                    return replacement.eval_inner(None, precision);
                }
                fail(
                    self,
                    format!("{} cannot be evaluated numerically", self.code(None)),
                )
            }
            ExprKind::Unary(op, x) => {
                let value = x.eval_inner(subst, precision)?;
                Ok(match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => precision.clamp(-value),
                    UnaryOp::Not => bool_value(value == 0.0),
                })
            }
            ExprKind::Binary(op, left, right) => self.eval_binary(*op, left, right, subst, precision),
            ExprKind::Function(f, args) => self.eval_function(*f, args, subst, precision),
            ExprKind::If(cond, then, otherwise) => {
                if cond.eval_inner(subst, precision)? != 0.0 {
                    then.eval_inner(subst, precision)
                } else {
                    otherwise.eval_inner(subst, precision)
                }
            }
            ExprKind::Piecewise(ops) => {
                let mut pairs = ops.chunks_exact(2);
                for pair in pairs.by_ref() {
                    if pair[0].eval_inner(subst, precision)? != 0.0 {
                        return pair[1].eval_inner(subst, precision);
                    }
                }
                // The trailing operand is the default.
                ops[ops.len() - 1].eval_inner(subst, precision)
            }
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        subst: Option<&SubstMap>,
        precision: Precision,
    ) -> Result {
        // `and`/`or` only evaluate their right operand when needed.
        if op == BinaryOp::And {
            if left.eval_inner(subst, precision)? == 0.0 {
                return Ok(bool_value(false));
            }
            return Ok(bool_value(right.eval_inner(subst, precision)? != 0.0));
        }
        if op == BinaryOp::Or {
            if left.eval_inner(subst, precision)? != 0.0 {
                return Ok(bool_value(true));
            }
            return Ok(bool_value(right.eval_inner(subst, precision)? != 0.0));
        }

        let a = left.eval_inner(subst, precision)?;
        let b = right.eval_inner(subst, precision)?;
        let value = match op {
            BinaryOp::Plus => a + b,
            BinaryOp::Minus => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => {
                if b == 0.0 {
                    return fail(self, "Division by zero");
                }
                a / b
            }
            // Integer division rounds towards negative infinity, and the
            // remainder follows the sign of the divisor, so that
            // a == b * (a // b) + (a % b).
            BinaryOp::Quotient => {
                if b == 0.0 {
                    return fail(self, "Division by zero");
                }
                (a / b).floor()
            }
            BinaryOp::Remainder => {
                if b == 0.0 {
                    return fail(self, "Division by zero");
                }
                a - b * (a / b).floor()
            }
            BinaryOp::Power => {
                let value = a.powf(b);
                if value.is_nan() && !a.is_nan() && !b.is_nan() {
                    return fail(self, "Math domain error");
                }
                value
            }
            BinaryOp::Equal => bool_value(a == b),
            BinaryOp::NotEqual => bool_value(a != b),
            BinaryOp::Less => bool_value(a < b),
            BinaryOp::LessEqual => bool_value(a <= b),
            BinaryOp::More => bool_value(a > b),
            BinaryOp::MoreEqual => bool_value(a >= b),
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        };
        Ok(precision.clamp(value))
    }

    fn eval_function(
        &self,
        function: MathFunction,
        args: &[Expr],
        subst: Option<&SubstMap>,
        precision: Precision,
    ) -> Result {
        let a = args[0].eval_inner(subst, precision)?;
        let value = match function {
            MathFunction::Sqrt => {
                if a < 0.0 {
                    return fail(self, "Math domain error: sqrt() of a negative number");
                }
                a.sqrt()
            }
            MathFunction::Sin => a.sin(),
            MathFunction::Cos => a.cos(),
            MathFunction::Tan => a.tan(),
            MathFunction::ASin => {
                if !(-1.0..=1.0).contains(&a) {
                    return fail(self, "Math domain error: asin() argument out of range");
                }
                a.asin()
            }
            MathFunction::ACos => {
                if !(-1.0..=1.0).contains(&a) {
                    return fail(self, "Math domain error: acos() argument out of range");
                }
                a.acos()
            }
            MathFunction::ATan => a.atan(),
            MathFunction::Exp => a.exp(),
            MathFunction::Log => {
                if a <= 0.0 {
                    return fail(self, "Math domain error: log() of a non-positive number");
                }
                match args.get(1) {
                    None => a.ln(),
                    Some(base) => {
                        let b = base.eval_inner(subst, precision)?;
                        if b <= 0.0 {
                            return fail(
                                self,
                                "Math domain error: log() base must be positive",
                            );
                        }
                        a.ln() / b.ln()
                    }
                }
            }
            MathFunction::Log10 => {
                if a <= 0.0 {
                    return fail(self, "Math domain error: log10() of a non-positive number");
                }
                a.log10()
            }
            MathFunction::Floor => a.floor(),
            MathFunction::Ceil => a.ceil(),
            MathFunction::Abs => a.abs(),
        };
        Ok(precision.clamp(value))
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// The expression a reference evaluates through: the current value for a
/// state's name, the defining expression otherwise, and the state equation
/// for a `dot()`.
fn rhs_of(expr: &Expr) -> Option<Expr> {
    match expr.kind() {
        ExprKind::Name(NameTarget::Variable(_)) => {
            let var = expr.var()?;
            match var.state_value() {
                Some(value) => Some(Expr::number(value)),
                None => var.rhs(),
            }
        }
        ExprKind::Derivative(_) => expr.var()?.rhs(),
        _ => None,
    }
}

/// Builds the user-facing multi-line evaluation error message: the error,
/// the expression it occurred in, a trail to the variable whose definition
/// failed, the operand values, and the referenced variables.
fn error_message(
    owner: &Expr,
    error: &EvalError,
    subst: Option<&SubstMap>,
    precision: Precision,
) -> String {
    let mut out = vec![error.message.clone()];
    out.push("Encountered when evaluating".to_string());
    let mut located = format!("  {}", owner.code(None));
    out.push(located.clone());

    let trail = name_trail(owner, &error.expr);
    if let Some(last) = trail.last() {
        out.push("Error located at:".to_string());
        for (i, name) in trail.iter().enumerate() {
            out.push(format!("{}{}", "  ".repeat(1 + i), name.code(None)));
        }
        if let Some(rhs) = rhs_of(last) {
            located = format!("{} = {}", last.code(None), rhs.code(None));
            out.push(located.clone());
        }
    }

    let err_str = error.expr.code(None);
    if let Some(start) = located.find(&err_str) {
        out.push(format!("{}{}", " ".repeat(start), "~".repeat(err_str.len())));
    }

    let operands = error.expr.operands();
    if !operands.is_empty() {
        out.push("With the following operands:".to_string());
        for (i, op) in operands.iter().enumerate() {
            let pre = format!("  ({}) ", 1 + i);
            match op.eval_inner(subst, precision) {
                Ok(value) => out.push(format!("{pre}{}", format_number(value))),
                Err(_) => out.push(format!("{pre}another error")),
            }
        }
    }

    let references = error.expr.references();
    if !references.is_empty() {
        out.push("And the following variables:".to_string());
        for reference in references {
            let name = reference.code(None);
            let rhs = subst
                .and_then(|s| s.get(&reference).cloned())
                .or_else(|| rhs_of(&reference));
            let Some(rhs) = rhs else {
                out.push(format!("  {name} = undefined"));
                continue;
            };
            let pre = if rhs.is_number(None) {
                format!("  {name} = ")
            } else {
                out.push(format!("  {name} = {}", rhs.code(None)));
                format!("  {} = ", " ".repeat(name.len()))
            };
            match rhs.eval_inner(subst, precision) {
                Ok(value) => out.push(format!("{pre}{}", format_number(value))),
                Err(_) => out.push(format!("{pre}another error")),
            }
        }
    }

    out.join("\n")
}

/// Finds the chain of names leading from `root` to the expression that
/// failed, following variable definitions. Empty if the failure is directly
/// inside `root`.
fn name_trail(root: &Expr, target: &Expr) -> Vec<Expr> {
    fn search(root: &Expr, target: &Expr, trail: &mut Vec<Expr>) -> bool {
        if root == target {
            return true;
        }
        if root.is_name() {
            trail.push(root.clone());
            if let Some(rhs) = rhs_of(root) {
                if search(&rhs, target, trail) {
                    return true;
                }
            }
            trail.pop();
            return false;
        }
        for child in root.operands() {
            if search(&child, target, trail) {
                return true;
            }
        }
        false
    }
    let mut trail = vec![];
    search(root, target, &mut trail);
    trail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmt::model::Model;

    fn check_equal(expr: &Expr, value: f64) {
        assert_eq!(expr.eval(None, Precision::Double).unwrap(), value);
    }

    fn num(value: f64) -> Expr {
        Expr::number(value)
    }

    #[test]
    fn eval_simple_expressions() {
        check_equal(&Expr::plus(num(5.0), num(2.0)), 7.0);
        check_equal(&Expr::minus(num(5.0), num(2.0)), 3.0);
        check_equal(&Expr::multiply(num(5.0), num(2.0)), 10.0);
        check_equal(&Expr::divide(num(5.0), num(2.0)), 2.5);
        check_equal(&Expr::power(num(2.0), num(10.0)), 1024.0);
        check_equal(
            &Expr::function(MathFunction::Sqrt, vec![num(25.0)]).unwrap(),
            5.0,
        );
    }

    #[test]
    fn eval_prefix_expressions() {
        check_equal(&Expr::prefix_plus(num(10.0)), 10.0);
        check_equal(&Expr::prefix_minus(num(10.0)), -10.0);
        check_equal(&Expr::not(num(0.0)), 1.0);
        check_equal(&Expr::not(num(42.0)), 0.0);
    }

    #[test]
    fn quotient_rounds_towards_negative_infinity() {
        let quot = |a: f64, b: f64| Expr::binary(BinaryOp::Quotient, num(a), num(b));
        check_equal(&quot(7.0, 3.0), 2.0);
        check_equal(&quot(-7.0, 3.0), -3.0);
        check_equal(&quot(5.0, -3.0), -2.0);
    }

    #[test]
    fn remainder_follows_divisor_sign() {
        let rem = |a: f64, b: f64| Expr::binary(BinaryOp::Remainder, num(a), num(b));
        check_equal(&rem(7.0, 3.0), 1.0);
        check_equal(&rem(-7.0, 3.0), 2.0);
        check_equal(&rem(5.0, -3.0), -1.0);
    }

    #[test]
    fn transcendentals() {
        check_equal(
            &Expr::function(MathFunction::Log, vec![num(256.0), num(2.0)]).unwrap(),
            8.0,
        );
        check_equal(
            &Expr::function(MathFunction::Log10, vec![num(100.0)]).unwrap(),
            2.0,
        );
        check_equal(
            &Expr::function(MathFunction::Floor, vec![num(-5.2)]).unwrap(),
            -6.0,
        );
        check_equal(
            &Expr::function(MathFunction::Ceil, vec![num(-5.2)]).unwrap(),
            -5.0,
        );
        check_equal(
            &Expr::function(MathFunction::Abs, vec![num(-5.0)]).unwrap(),
            5.0,
        );
        let e = Expr::function(MathFunction::Exp, vec![num(1.0)]).unwrap();
        assert!((e.eval(None, Precision::Double).unwrap() - std::f64::consts::E).abs() < 1e-12);
    }

    #[test]
    fn comparisons_and_connectives() {
        let cmp = |op, a: f64, b: f64| Expr::binary(op, num(a), num(b));
        check_equal(&cmp(BinaryOp::Equal, 1.0, 1.0), 1.0);
        check_equal(&cmp(BinaryOp::NotEqual, 1.0, 1.0), 0.0);
        check_equal(&cmp(BinaryOp::Less, 1.0, 2.0), 1.0);
        check_equal(&cmp(BinaryOp::LessEqual, 2.0, 2.0), 1.0);
        check_equal(&cmp(BinaryOp::More, 1.0, 2.0), 0.0);
        check_equal(&cmp(BinaryOp::MoreEqual, 2.0, 2.0), 1.0);
        check_equal(&cmp(BinaryOp::And, 1.0, 0.0), 0.0);
        check_equal(&cmp(BinaryOp::Or, 1.0, 0.0), 1.0);
    }

    #[test]
    fn short_circuiting_skips_failing_branches() {
        let division_by_zero = Expr::divide(num(1.0), num(0.0));
        let e = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Equal, num(0.0), num(1.0)),
            division_by_zero.clone(),
        );
        check_equal(&e, 0.0);

        let e = Expr::binary(
            BinaryOp::Or,
            Expr::binary(BinaryOp::Equal, num(1.0), num(1.0)),
            division_by_zero.clone(),
        );
        check_equal(&e, 1.0);

        let e = Expr::if_then_else(
            Expr::binary(BinaryOp::Less, num(1.0), num(2.0)),
            num(3.0),
            division_by_zero,
        );
        check_equal(&e, 3.0);
    }

    #[test]
    fn conditional_scenario() {
        // if(V < 10, 5 * V + 100, 6 * V)
        let model = Model::new("m");
        let c = model.add_component("c");
        let v = c.add_variable("V", None);
        let e = Expr::if_then_else(
            Expr::binary(BinaryOp::Less, Expr::name(&v), num(10.0)),
            Expr::plus(Expr::multiply(num(5.0), Expr::name(&v)), num(100.0)),
            Expr::multiply(num(6.0), Expr::name(&v)),
        );
        let mut subst = SubstMap::new();
        subst.insert(Expr::name(&v), num(9.0));
        assert_eq!(e.eval(Some(&subst), Precision::Double).unwrap(), 145.0);
        subst.insert(Expr::name(&v), num(10.0));
        assert_eq!(e.eval(Some(&subst), Precision::Double).unwrap(), 60.0);
    }

    #[test]
    fn piecewise_falls_through_to_default() {
        let e = Expr::piecewise(vec![
            Expr::binary(BinaryOp::Less, num(5.0), num(1.0)),
            num(10.0),
            num(20.0),
        ])
        .unwrap();
        check_equal(&e, 20.0);

        let e = Expr::piecewise(vec![
            Expr::binary(BinaryOp::Less, num(5.0), num(1.0)),
            num(10.0),
            Expr::binary(BinaryOp::Less, num(0.0), num(1.0)),
            num(30.0),
            num(20.0),
        ])
        .unwrap();
        check_equal(&e, 30.0);
    }

    #[test]
    fn names_resolve_through_the_model() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let y = c.add_variable("y", None);
        y.set_rhs(num(3.0));
        x.set_rhs(Expr::multiply(Expr::name(&y), num(2.0)));
        check_equal(&Expr::name(&x), 6.0);

        let state = c.add_variable("s", None);
        state.promote_to_state(-80.0);
        state.set_rhs(Expr::prefix_minus(Expr::name(&state)));
        check_equal(&Expr::name(&state), -80.0);
        let dot = Expr::derivative(Expr::name(&state)).unwrap();
        check_equal(&dot, 80.0);
    }

    #[test]
    fn single_precision_truncates() {
        let third = 1.0f64 / 3.0;
        let e = num(third);
        assert_eq!(e.eval(None, Precision::Double).unwrap(), third);
        assert_eq!(
            e.eval(None, Precision::Single).unwrap(),
            third as f32 as f64
        );
        assert_ne!(e.eval(None, Precision::Single).unwrap(), third);
    }

    #[test]
    fn division_by_zero_reports_operands() {
        let e = Expr::divide(Expr::plus(num(1.0), num(2.0)), num(0.0));
        let err = e.eval(None, Precision::Double).unwrap_err();
        let message = err.message();
        assert!(message.starts_with("Division by zero"), "{message}");
        assert!(message.contains("Encountered when evaluating"), "{message}");
        assert!(message.contains("  1 + 2 / 0") || message.contains("(1 + 2) / 0"), "{message}");
        assert!(message.contains("With the following operands:"), "{message}");
        assert!(message.contains("  (1) 3"), "{message}");
        assert!(message.contains("  (2) 0"), "{message}");
    }

    #[test]
    fn nested_errors_are_traced_to_variables() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let y = c.add_variable("y", None);
        y.set_rhs(Expr::divide(num(1.0), num(0.0)));
        x.set_rhs(Expr::plus(Expr::name(&y), num(1.0)));
        let err = Expr::name(&x).eval(None, Precision::Double).unwrap_err();
        let message = err.message();
        assert!(message.contains("Error located at:"), "{message}");
        assert!(message.contains("c.y"), "{message}");
    }

    #[test]
    fn partials_cannot_be_evaluated() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let y = c.add_variable("y", None);
        let partial = Expr::partial(Expr::name(&x), Expr::name(&y)).unwrap();
        assert!(partial.eval(None, Precision::Double).is_err());

        // A substituted value is accepted.
        let mut subst = SubstMap::new();
        subst.insert(partial.clone(), num(4.0));
        assert_eq!(partial.eval(Some(&subst), Precision::Double).unwrap(), 4.0);
    }

    #[test]
    fn power_domain_error() {
        let e = Expr::power(num(-1.0), num(0.5));
        assert!(e.eval(None, Precision::Double).is_err());
    }
}
