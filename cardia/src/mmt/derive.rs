//! Symbolic partial differentiation.
//!
//! The traversal returns `None` for "zero of unknown unit", which lets
//! whole branches collapse without building zero-valued trees. The public
//! entry point turns a final `None` into a zero number carrying the unit
//! the derivative should have. Multiplications by one are never folded
//! away: they often encode unit conversions.

use crate::mmt::diagnostics::IntegrityError;
use crate::mmt::expression::{
    BinaryOp, Expr, ExprKind, MathFunction, NameTarget, SubstMap, UnaryOp,
};
use crate::mmt::model::Variable;
use crate::mmt::unit::{Unit, UnitMode};

type Result<T> = std::result::Result<T, IntegrityError>;

/// Re-binds a constant variable for the duration of a differentiation, so
/// the traversal does not short-circuit it to zero. Dropping the guard
/// restores the variable on every exit path.
struct BindingGuard {
    variable: Variable,
}

impl BindingGuard {
    fn bind(variable: &Variable, label: String) -> BindingGuard {
        variable.set_binding(Some(label));
        BindingGuard {
            variable: variable.clone(),
        }
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.variable.set_binding(None);
    }
}

fn fun(function: MathFunction, args: Vec<Expr>) -> Expr {
    Expr::build(ExprKind::Function(function, args), None)
}

fn ln(x: Expr) -> Expr {
    fun(MathFunction::Log, vec![x])
}

fn squared(x: Expr) -> Expr {
    Expr::power(x, Expr::number(2.0))
}

impl Expr {
    /// Returns an expression for the derivative of this expression with
    /// respect to the variable named by `lhs`.
    ///
    /// The result may contain `partial()` references for the derivatives of
    /// non-constant, non-bound variables. Sub-trees known to be exactly
    /// zero are eliminated; no other simplification is performed.
    /// Discontinuities are ignored: `floor`, `ceil` and `//` differentiate
    /// to zero, `abs` uses the right-derivative at zero, and conditionals
    /// differentiate branch-wise.
    pub fn partial_derivative(&self, lhs: &Expr) -> Result<Expr> {
        if !lhs.is_name() {
            return Err(IntegrityError::new(
                "Partial derivatives can only be taken with respect to a variable name.",
                lhs.span(),
            ));
        }
        let Some(variable) = lhs.var() else {
            return Err(IntegrityError::new(
                "Partial derivatives require a name that resolves to a model variable.",
                lhs.span(),
            ));
        };

        // A constant target would be short-circuited to zero by the name
        // rule below; bind it for the duration of the traversal.
        let _guard = if variable.is_constant() {
            let label = variable
                .model()
                .map(|m| m.unused_label())
                .unwrap_or_else(|| "unused".to_string());
            Some(BindingGuard::bind(&variable, label))
        } else {
            None
        };

        let derivative = self.diff(lhs)?;
        Ok(match derivative {
            Some(derivative) => derivative,
            None => Expr::number_with_unit(0.0, self.partial_derivative_unit(lhs)),
        })
    }

    /// The unit the derivative of this expression w.r.t. `lhs` should have,
    /// or `None` when either unit is unknown.
    fn partial_derivative_unit(&self, lhs: &Expr) -> Option<Unit> {
        let unit1 = self.eval_unit(UnitMode::Tolerant).ok()??;
        let unit2 = lhs.var()?.unit(UnitMode::Tolerant)?;
        Some(&unit1 / &unit2)
    }

    /// Internal rule dispatch; may assume `lhs` is a name referring to a
    /// non-constant variable, and returns `None` for a derivative that is
    /// known to be zero.
    fn diff(&self, lhs: &Expr) -> Result<Option<Expr>> {
        match self.kind() {
            ExprKind::Number { .. } => Ok(None),
            ExprKind::Name(NameTarget::Sentinel(name)) => Err(IntegrityError::new(
                format!("Cannot differentiate unresolved name \"{name}\"."),
                self.span(),
            )),
            ExprKind::Name(NameTarget::Variable(var_ref)) => {
                if self == lhs {
                    // dx/dx = 1, with units U/U = dimensionless.
                    return Ok(Some(Expr::number_with_unit(
                        1.0,
                        Some(Unit::dimensionless()),
                    )));
                }
                let Some(variable) = var_ref.upgrade() else {
                    return Err(IntegrityError::new(
                        format!(
                            "Cannot differentiate \"{}\": its model no longer exists.",
                            var_ref.name()
                        ),
                        self.span(),
                    ));
                };
                // Bound variables are external inputs, constants cannot
                // depend on the target (which, if constant itself, is
                // temporarily bound while we run).
                if variable.is_bound() || variable.is_constant() {
                    Ok(None)
                } else {
                    Ok(Some(Expr::build(
                        ExprKind::Partial(self.clone(), lhs.clone()),
                        None,
                    )))
                }
            }
            ExprKind::Derivative(_) => Ok(Some(Expr::build(
                ExprKind::Partial(self.clone(), lhs.clone()),
                None,
            ))),
            ExprKind::Partial(..) => Err(IntegrityError::new(
                "Partial derivatives of partial derivatives are not supported.",
                self.span(),
            )),
            ExprKind::Initial(_) => Err(IntegrityError::new(
                "Partial derivatives of initial conditions are not supported.",
                self.span(),
            )),
            ExprKind::Unary(UnaryOp::Plus, x) => {
                Ok(x.diff(lhs)?.map(Expr::prefix_plus))
            }
            ExprKind::Unary(UnaryOp::Minus, x) => {
                Ok(x.diff(lhs)?.map(Expr::prefix_minus))
            }
            ExprKind::Unary(UnaryOp::Not, _) => Err(IntegrityError::new(
                "Conditions do not have partial derivatives.",
                self.span(),
            )),
            ExprKind::Binary(op, left, right) => self.diff_binary(*op, left, right, lhs),
            ExprKind::Function(f, args) => self.diff_function(*f, args, lhs),
            ExprKind::If(cond, then, otherwise) => {
                let dthen = then.diff(lhs)?;
                let dotherwise = otherwise.diff(lhs)?;
                Ok(match (dthen, dotherwise) {
                    (None, None) => None,
                    (Some(t), Some(e)) => Some(Expr::if_then_else(cond.clone(), t, e)),
                    // One branch vanished: substitute a zero with the unit
                    // this derivative should carry.
                    (t, e) => {
                        let zero =
                            Expr::number_with_unit(0.0, self.partial_derivative_unit(lhs));
                        Some(Expr::if_then_else(
                            cond.clone(),
                            t.unwrap_or_else(|| zero.clone()),
                            e.unwrap_or(zero),
                        ))
                    }
                })
            }
            ExprKind::Piecewise(ops) => {
                let mut derivatives = vec![];
                for (i, op) in ops.iter().enumerate() {
                    let is_condition = i % 2 == 0 && i != ops.len() - 1;
                    if is_condition {
                        derivatives.push(None);
                    } else {
                        derivatives.push(Some(op.diff(lhs)?));
                    }
                }
                if derivatives
                    .iter()
                    .all(|d| matches!(d, None | Some(None)))
                {
                    return Ok(None);
                }
                let zero = Expr::number_with_unit(0.0, self.partial_derivative_unit(lhs));
                let rebuilt = ops
                    .iter()
                    .zip(derivatives)
                    .map(|(op, derivative)| match derivative {
                        // A condition operand is carried over unchanged.
                        None => op.clone(),
                        Some(Some(derivative)) => derivative,
                        Some(None) => zero.clone(),
                    })
                    .collect();
                Ok(Some(Expr::build(ExprKind::Piecewise(rebuilt), None)))
            }
        }
    }

    fn diff_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        lhs: &Expr,
    ) -> Result<Option<Expr>> {
        if op.is_condition() {
            return Err(IntegrityError::new(
                "Conditions do not have partial derivatives.",
                self.span(),
            ));
        }
        match op {
            BinaryOp::Plus => {
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                Ok(match (da, db) {
                    (None, db) => db,
                    (da, None) => da,
                    (Some(da), Some(db)) => Some(Expr::plus(da, db)),
                })
            }
            BinaryOp::Minus => {
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                Ok(match (da, db) {
                    (da, None) => da,
                    (None, Some(db)) => Some(Expr::prefix_minus(db)),
                    (Some(da), Some(db)) => Some(Expr::minus(da, db)),
                })
            }
            BinaryOp::Multiply => {
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                Ok(match (da, db) {
                    (None, None) => None,
                    // f' g
                    (Some(da), None) => Some(Expr::multiply(da, right.clone())),
                    // f g'
                    (None, Some(db)) => Some(Expr::multiply(left.clone(), db)),
                    (Some(da), Some(db)) => Some(Expr::plus(
                        Expr::multiply(da, right.clone()),
                        Expr::multiply(left.clone(), db),
                    )),
                })
            }
            BinaryOp::Divide => {
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                Ok(match (da, db) {
                    (None, None) => None,
                    // g f' / g^2 = f' / g
                    (Some(da), None) => Some(Expr::divide(da, right.clone())),
                    // -(f g') / g^2
                    (None, Some(db)) => Some(Expr::prefix_minus(Expr::divide(
                        Expr::multiply(left.clone(), db),
                        squared(right.clone()),
                    ))),
                    // (f' g - f g') / g^2
                    (Some(da), Some(db)) => Some(Expr::divide(
                        Expr::minus(
                            Expr::multiply(da, right.clone()),
                            Expr::multiply(left.clone(), db),
                        ),
                        squared(right.clone()),
                    )),
                })
            }
            // a // b is flat between its jumps; the jumps are ignored in
            // favour of the right-derivative, which is zero everywhere.
            BinaryOp::Quotient => Ok(None),
            // a % b = a - b * floor(a/b), and floor differentiates to zero,
            // leaving a' - b' * floor(a/b).
            BinaryOp::Remainder => {
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                let floor_ab = || {
                    fun(
                        MathFunction::Floor,
                        vec![Expr::divide(left.clone(), right.clone())],
                    )
                };
                Ok(match (da, db) {
                    (None, None) => None,
                    (da, None) => da,
                    (None, Some(db)) => {
                        Some(Expr::prefix_minus(Expr::multiply(db, floor_ab())))
                    }
                    (Some(da), Some(db)) => {
                        Some(Expr::minus(da, Expr::multiply(db, floor_ab())))
                    }
                })
            }
            BinaryOp::Power => {
                // Derived from a^b = exp(b ln a); when one side is constant
                // this reduces to the power rule or the exponential rule.
                let da = left.diff(lhs)?;
                let db = right.diff(lhs)?;
                Ok(match (da, db) {
                    (None, None) => None,
                    // b * a^(b-1) * a'
                    (Some(da), None) => Some(Expr::multiply(
                        Expr::multiply(
                            right.clone(),
                            Expr::power(
                                left.clone(),
                                Expr::minus(right.clone(), Expr::number(1.0)),
                            ),
                        ),
                        da,
                    )),
                    // a^b * b' / ln(a)
                    (None, Some(db)) => Some(Expr::divide(
                        Expr::multiply(self.clone(), db),
                        ln(left.clone()),
                    )),
                    // a^b * (ln(a) * b' + (b/a) * a')
                    (Some(da), Some(db)) => Some(Expr::multiply(
                        self.clone(),
                        Expr::plus(
                            Expr::multiply(ln(left.clone()), db),
                            Expr::multiply(Expr::divide(right.clone(), left.clone()), da),
                        ),
                    )),
                })
            }
            _ => unreachable!("conditions handled above"),
        }
    }

    fn diff_function(
        &self,
        function: MathFunction,
        args: &[Expr],
        lhs: &Expr,
    ) -> Result<Option<Expr>> {
        // Floor and ceil are stepwise constant; as with //, the jumps are
        // ignored and the derivative is zero everywhere.
        if matches!(function, MathFunction::Floor | MathFunction::Ceil) {
            return Ok(None);
        }
        if function == MathFunction::Log && args.len() == 2 {
            return self.diff_log2(&args[0], &args[1], lhs);
        }
        let x = &args[0];
        let Some(dx) = x.diff(lhs)? else {
            return Ok(None);
        };
        Ok(Some(match function {
            // x' / (2 * sqrt(x))
            MathFunction::Sqrt => {
                Expr::divide(dx, Expr::multiply(Expr::number(2.0), self.clone()))
            }
            MathFunction::Sin => Expr::multiply(fun(MathFunction::Cos, vec![x.clone()]), dx),
            MathFunction::Cos => Expr::prefix_minus(Expr::multiply(
                fun(MathFunction::Sin, vec![x.clone()]),
                dx,
            )),
            MathFunction::Tan => Expr::divide(
                dx,
                squared(fun(MathFunction::Cos, vec![x.clone()])),
            ),
            MathFunction::ASin => Expr::divide(
                dx,
                fun(
                    MathFunction::Sqrt,
                    vec![Expr::minus(Expr::number(1.0), squared(x.clone()))],
                ),
            ),
            MathFunction::ACos => Expr::divide(
                Expr::prefix_minus(dx),
                fun(
                    MathFunction::Sqrt,
                    vec![Expr::minus(Expr::number(1.0), squared(x.clone()))],
                ),
            ),
            MathFunction::ATan => Expr::divide(
                dx,
                Expr::plus(Expr::number(1.0), squared(x.clone())),
            ),
            MathFunction::Exp => Expr::multiply(self.clone(), dx),
            MathFunction::Log => Expr::divide(dx, x.clone()),
            // x' / (x * ln(10))
            MathFunction::Log10 => Expr::divide(
                dx,
                Expr::multiply(x.clone(), ln(Expr::number(10.0))),
            ),
            // The right-derivative: x' for x >= 0, -x' below. The zero in
            // the comparison carries the operand's unit where known.
            MathFunction::Abs => {
                let unit = x.eval_unit(UnitMode::Tolerant).ok().flatten();
                Expr::if_then_else(
                    Expr::binary(
                        BinaryOp::MoreEqual,
                        x.clone(),
                        Expr::number_with_unit(0.0, unit),
                    ),
                    dx.clone(),
                    Expr::prefix_minus(dx),
                )
            }
            MathFunction::Floor | MathFunction::Ceil => unreachable!(),
        }))
    }

    /// Derivative of `log(b, a)`, the base-`a` logarithm of `b`.
    fn diff_log2(&self, b: &Expr, a: &Expr, lhs: &Expr) -> Result<Option<Expr>> {
        let db = b.diff(lhs)?;
        let da = a.diff(lhs)?;
        Ok(match (db, da) {
            (None, None) => None,
            // b' / (b * ln(a))
            (Some(db), None) => Some(Expr::divide(
                db,
                Expr::multiply(b.clone(), ln(a.clone())),
            )),
            // -(a' ln(b)) / (a * ln(a)^2)
            (None, Some(da)) => Some(Expr::prefix_minus(Expr::divide(
                Expr::multiply(da, ln(b.clone())),
                Expr::multiply(a.clone(), squared(ln(a.clone()))),
            ))),
            // b' / (b ln(a)) - (a' ln(b)) / (a ln(a)^2)
            (Some(db), Some(da)) => Some(Expr::minus(
                Expr::divide(db, Expr::multiply(b.clone(), ln(a.clone()))),
                Expr::divide(
                    Expr::multiply(da, ln(b.clone())),
                    Expr::multiply(a.clone(), squared(ln(a.clone()))),
                ),
            )),
        })
    }
}

/// Differentiation commutes with substitution for variables other than the
/// target; exposed for tests and model tooling.
pub fn derivative_value(
    expr: &Expr,
    lhs: &Expr,
    at: f64,
) -> std::result::Result<f64, Box<dyn std::error::Error>> {
    let derivative = expr.partial_derivative(lhs)?;
    let mut subst = SubstMap::new();
    subst.insert(lhs.clone(), Expr::number(at));
    Ok(derivative.eval(Some(&subst), crate::mmt::eval::Precision::Double)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmt::eval::Precision;
    use crate::mmt::model::Model;
    use crate::mmt::unit::{parse_unit, units};
    use assert_matches::assert_matches;

    fn model_with_x() -> (Model, Expr) {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", Some(units::millisecond()));
        (model, Expr::name(&x))
    }

    fn check_derivative(expr: &Expr, lhs: &Expr, at: f64, expected: f64) {
        let value = derivative_value(expr, lhs, at).unwrap();
        assert!(
            (value - expected).abs() < 1e-9,
            "d[{expr}] at {at}: expected {expected}, got {value}"
        );
    }

    #[test]
    fn derivative_of_number_is_united_zero() {
        let (_model, x) = model_with_x();
        let e = Expr::number_with_unit(5.0, Some(units::millivolt()));
        let d = e.partial_derivative(&x).unwrap();
        assert!(d.is_number(Some(0.0)));
        assert_eq!(
            d.number_unit(),
            Some(&units::millivolt() / &units::millisecond())
        );

        // Without units on either side the zero stays bare.
        let model = Model::new("m");
        let c = model.add_component("c");
        let y = c.add_variable("y", None);
        let d = Expr::number(5.0).partial_derivative(&Expr::name(&y)).unwrap();
        assert!(d.is_number(Some(0.0)));
        assert_eq!(d.number_unit(), None);
    }

    #[test]
    fn derivative_of_self_is_one() {
        let (_model, x) = model_with_x();
        let d = x.partial_derivative(&x).unwrap();
        assert!(d.is_number(Some(1.0)));
        assert_eq!(d.number_unit(), Some(crate::mmt::unit::Unit::dimensionless()));
    }

    #[test]
    fn names_reduce_to_partials_or_zero() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let s = c.add_variable("s", None);
        s.promote_to_state(1.0);
        let y = c.add_variable("y", None);
        y.set_rhs(Expr::multiply(Expr::number(2.0), Expr::name(&s)));

        // y depends on a state, so its derivative stays symbolic.
        let d = Expr::name(&y).partial_derivative(&Expr::name(&x)).unwrap();
        assert_eq!(
            d,
            Expr::partial(Expr::name(&y), Expr::name(&x)).unwrap()
        );

        // Bound variables are external inputs.
        let t = c.add_variable("t", None);
        t.set_binding(Some("time".to_string()));
        let d = Expr::name(&t).partial_derivative(&Expr::name(&x)).unwrap();
        assert!(d.is_number(Some(0.0)));

        // Constants vanish too.
        let k = c.add_variable("k", None);
        k.set_rhs(Expr::number(8.0));
        let d = Expr::name(&k).partial_derivative(&Expr::name(&x)).unwrap();
        assert!(d.is_number(Some(0.0)));
    }

    #[test]
    fn product_rule() {
        let (_model, x) = model_with_x();
        let e = Expr::multiply(x.clone(), x.clone());
        check_derivative(&e, &x, 3.0, 6.0);
    }

    #[test]
    fn quotient_rule() {
        let (_model, x) = model_with_x();
        // d/dx (x / (x + 1)) = 1 / (x + 1)^2
        let e = Expr::divide(x.clone(), Expr::plus(x.clone(), Expr::number(1.0)));
        check_derivative(&e, &x, 2.0, 1.0 / 9.0);
        // Constant numerator: d/dx (3 / x) = -3 / x^2
        let e = Expr::divide(Expr::number(3.0), x.clone());
        check_derivative(&e, &x, 2.0, -0.75);
    }

    #[test]
    fn power_rules() {
        let (_model, x) = model_with_x();
        // Power rule
        let e = Expr::power(x.clone(), Expr::number(3.0));
        check_derivative(&e, &x, 2.0, 12.0);
        // Constant-base reduction: a^b * b' / ln(a)
        let e = Expr::power(Expr::number(2.0), x.clone());
        check_derivative(&e, &x, 3.0, 8.0 / 2f64.ln());
        // Full form, checked against d/dx x^x = x^x (ln x + 1)
        let e = Expr::power(x.clone(), x.clone());
        let expected = 27.0 * (3f64.ln() + 1.0);
        check_derivative(&e, &x, 3.0, expected);
    }

    #[test]
    fn chain_rules() {
        let (_model, x) = model_with_x();
        let x2 = Expr::power(x.clone(), Expr::number(2.0));

        let e = fun(MathFunction::Sin, vec![x2.clone()]);
        check_derivative(&e, &x, 1.5, (1.5f64 * 1.5).cos() * 3.0);

        let e = fun(MathFunction::Cos, vec![x.clone()]);
        check_derivative(&e, &x, 1.0, -(1f64.sin()));

        let e = fun(MathFunction::Tan, vec![x.clone()]);
        check_derivative(&e, &x, 0.5, 1.0 / 0.5f64.cos().powi(2));

        let e = fun(MathFunction::Exp, vec![x2]);
        check_derivative(&e, &x, 1.0, 1f64.exp() * 2.0);

        let e = fun(MathFunction::Sqrt, vec![x.clone()]);
        check_derivative(&e, &x, 4.0, 0.25);

        let e = fun(MathFunction::ASin, vec![x.clone()]);
        check_derivative(&e, &x, 0.5, 1.0 / (1.0 - 0.25f64).sqrt());

        let e = fun(MathFunction::ACos, vec![x.clone()]);
        check_derivative(&e, &x, 0.5, -1.0 / (1.0 - 0.25f64).sqrt());

        let e = fun(MathFunction::ATan, vec![x.clone()]);
        check_derivative(&e, &x, 2.0, 0.2);

        let e = fun(MathFunction::Log, vec![x.clone()]);
        check_derivative(&e, &x, 4.0, 0.25);

        let e = fun(MathFunction::Log10, vec![x.clone()]);
        check_derivative(&e, &x, 10.0, 1.0 / (10.0 * 10f64.ln()));

        let e = fun(MathFunction::Log, vec![x.clone(), Expr::number(2.0)]);
        check_derivative(&e, &x, 4.0, 1.0 / (4.0 * 2f64.ln()));
    }

    #[test]
    fn discontinuous_operations_differentiate_to_zero() {
        let (_model, x) = model_with_x();
        let e = Expr::binary(BinaryOp::Quotient, x.clone(), Expr::number(3.0));
        let d = e.partial_derivative(&x).unwrap();
        assert!(d.is_number(Some(0.0)));

        for f in [MathFunction::Floor, MathFunction::Ceil] {
            let e = fun(f, vec![x.clone()]);
            let d = e.partial_derivative(&x).unwrap();
            assert!(d.is_number(Some(0.0)), "{f:?}");
        }
    }

    #[test]
    fn remainder_rule() {
        let (_model, x) = model_with_x();
        // d/dx (x % 3) = 1 (away from the jumps)
        let e = Expr::binary(BinaryOp::Remainder, x.clone(), Expr::number(3.0));
        check_derivative(&e, &x, 7.5, 1.0);

        // Full form: d/dx (7 % x) = -floor(7/x) at x = 3 gives -2
        let e = Expr::binary(BinaryOp::Remainder, Expr::number(7.0), x.clone());
        check_derivative(&e, &x, 3.0, -2.0);
    }

    #[test]
    fn abs_uses_the_right_derivative() {
        let (_model, x) = model_with_x();
        let e = fun(MathFunction::Abs, vec![x.clone()]);
        check_derivative(&e, &x, 2.0, 1.0);
        check_derivative(&e, &x, -2.0, -1.0);
        check_derivative(&e, &x, 0.0, 1.0);

        // The comparison zero carries the operand's unit.
        let d = e.partial_derivative(&x).unwrap();
        let ExprKind::If(cond, ..) = d.kind() else {
            panic!("expected if(), got {d}");
        };
        let ExprKind::Binary(BinaryOp::MoreEqual, _, zero) = cond.kind() else {
            panic!("expected >=, got {cond}");
        };
        assert_eq!(zero.number_unit(), Some(units::millisecond()));
    }

    #[test]
    fn conditionals_differentiate_branchwise() {
        let (_model, x) = model_with_x();
        let cond = Expr::binary(BinaryOp::Less, x.clone(), Expr::number(0.0));
        let e = Expr::if_then_else(
            cond.clone(),
            Expr::multiply(x.clone(), x.clone()),
            Expr::multiply(Expr::number(3.0), x.clone()),
        );
        check_derivative(&e, &x, -2.0, -4.0);
        check_derivative(&e, &x, 2.0, 3.0);

        // One constant branch becomes a zero, not a collapse.
        let e = Expr::if_then_else(cond.clone(), Expr::number(5.0), x.clone());
        check_derivative(&e, &x, -1.0, 0.0);
        check_derivative(&e, &x, 1.0, 1.0);

        // Wholly constant conditionals vanish.
        let e = Expr::if_then_else(cond, Expr::number(5.0), Expr::number(6.0));
        let d = e.partial_derivative(&x).unwrap();
        assert!(d.is_number(Some(0.0)));
    }

    #[test]
    fn piecewise_differentiates_branchwise() {
        let (_model, x) = model_with_x();
        let e = Expr::piecewise(vec![
            Expr::binary(BinaryOp::Less, x.clone(), Expr::number(0.0)),
            Expr::multiply(x.clone(), x.clone()),
            Expr::binary(BinaryOp::Less, x.clone(), Expr::number(10.0)),
            Expr::number(4.0),
            Expr::multiply(Expr::number(3.0), x.clone()),
        ])
        .unwrap();
        check_derivative(&e, &x, -2.0, -4.0);
        check_derivative(&e, &x, 5.0, 0.0);
        check_derivative(&e, &x, 20.0, 3.0);

        let d = e.partial_derivative(&x).unwrap();
        assert_matches!(d.kind(), ExprKind::Piecewise(ops) if ops.len() == 5);
    }

    #[test]
    fn multiplications_by_one_are_preserved() {
        let (_model, x) = model_with_x();
        let conversion = Expr::number_with_unit(1.0, Some(units::millivolt()));
        let e = Expr::multiply(conversion, x.clone());
        let d = e.partial_derivative(&x).unwrap();
        assert!(d.polish().contains("1 [mV]"), "{}", d.polish());
    }

    #[test]
    fn derivative_with_respect_to_a_constant_rebinds() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let k = c.add_variable("k", None);
        k.set_rhs(Expr::number(3.0));
        assert!(k.is_constant());

        let e = Expr::multiply(Expr::name(&k), Expr::name(&k));
        let d = e.partial_derivative(&Expr::name(&k)).unwrap();
        let mut subst = SubstMap::new();
        subst.insert(Expr::name(&k), Expr::number(3.0));
        assert_eq!(d.eval(Some(&subst), Precision::Double).unwrap(), 6.0);

        // The temporary binding is gone.
        assert!(!k.is_bound());
        assert!(k.is_constant());
    }

    #[test]
    fn rebinding_is_undone_on_failure() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let k = c.add_variable("k", None);
        assert!(k.is_constant());

        let s = c.add_variable("s", None);
        s.promote_to_state(0.0);
        let partial = Expr::partial(Expr::name(&s), Expr::name(&k)).unwrap();
        let e = Expr::plus(partial, Expr::name(&k));
        assert_matches!(e.partial_derivative(&Expr::name(&k)), Err(_));
        assert!(!k.is_bound());
    }

    #[test]
    fn conditions_are_not_differentiable() {
        let (_model, x) = model_with_x();
        let cond = Expr::binary(BinaryOp::Equal, x.clone(), Expr::number(1.0));
        assert_matches!(cond.partial_derivative(&x), Err(_));
        assert_matches!(Expr::not(cond).partial_derivative(&x), Err(_));
        assert_matches!(
            Expr::number(1.0).partial_derivative(&Expr::number(2.0)),
            Err(_)
        );
    }

    #[test]
    fn derivative_of_dot_is_a_partial() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let s = c.add_variable("s", None);
        s.promote_to_state(0.0);
        let x = c.add_variable("x", None);
        let dot = Expr::derivative(Expr::name(&s)).unwrap();
        let d = dot.partial_derivative(&Expr::name(&x)).unwrap();
        assert_eq!(d, Expr::partial(dot, Expr::name(&x)).unwrap());
    }

    #[test]
    fn derivative_unit_of_zero_result() {
        // d(5 [mV]) / d(x [ms]) carries [mV/ms]; with an unknown unit on
        // either side the zero carries no unit.
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let d = Expr::number_with_unit(5.0, Some(units::millivolt()))
            .partial_derivative(&Expr::name(&x))
            .unwrap();
        assert_eq!(d.number_unit(), None);

        let y = c.add_variable("y", Some(parse_unit("ms").unwrap()));
        let d = Expr::number_with_unit(5.0, Some(units::millivolt()))
            .partial_derivative(&Expr::name(&y))
            .unwrap();
        assert_eq!(d.number_unit(), Some(parse_unit("mV/ms").unwrap()));
    }

    #[test]
    fn differentiation_commutes_with_substitution() {
        // For a constant variable other than the target, substituting
        // before or after differentiation gives the same expression.
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let k = c.add_variable("k", None);
        k.set_rhs(Expr::number(4.0));
        let xe = Expr::name(&x);
        let ke = Expr::name(&k);

        let e = Expr::multiply(xe.clone(), ke.clone());
        let mut subst = SubstMap::new();
        subst.insert(ke, Expr::number(4.0));

        let sub_then_diff = e
            .clone_with(Some(&subst), false, None)
            .partial_derivative(&xe)
            .unwrap();
        let diff_then_sub = e
            .partial_derivative(&xe)
            .unwrap()
            .clone_with(Some(&subst), false, None);
        assert_eq!(sub_then_diff, diff_then_sub);
    }
}
