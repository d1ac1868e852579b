//! The two writers over the node model: `code` produces surface syntax with
//! precedence-aware parenthesisation, `polish` produces the reverse-Polish
//! canonical form that equality and hashing are defined on.

use crate::mmt::expression::{Expr, ExprKind, NameTarget, UnaryOp, LITERAL};
use crate::mmt::model::Component;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// Formats a value the way the surface syntax writes numbers: no trailing
/// `.0` on integral values, normalised exponent notation for very small and
/// very large magnitudes.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    if value == value.trunc() && value.abs() < 1e16 {
        return format!("{}", value as i64);
    }
    if value.abs() < 1e-4 || value.abs() >= 1e16 {
        format!("{value:e}")
    } else {
        format!("{value}")
    }
}

impl Expr {
    /// Renders this expression in surface syntax.
    ///
    /// Names render fully qualified, except: nested variables always use
    /// their short name, and when `component` is given, variables of that
    /// component use their short name and variables with an alias in that
    /// component use the alias.
    pub fn code(&self, component: Option<&Component>) -> String {
        let mut out = String::new();
        self.write_code(&mut out, component);
        out
    }

    fn write_code(&self, b: &mut String, c: Option<&Component>) {
        match self.kind() {
            ExprKind::Number { value, unit } => {
                b.push_str(&format_number(*value));
                if let Some(unit) = unit {
                    if !unit.is_dimensionless() {
                        b.push(' ');
                        b.push_str(&unit.to_string());
                    }
                }
            }
            ExprKind::Name(NameTarget::Sentinel(name)) => {
                b.push_str("str:");
                b.push_str(name);
            }
            ExprKind::Name(NameTarget::Variable(var_ref)) => match var_ref.upgrade() {
                Some(var) => {
                    if var.is_nested() {
                        b.push_str(&var.name());
                    } else if let Some(alias) = c.and_then(|c| c.alias_for(&var)) {
                        b.push_str(&alias);
                    } else {
                        b.push_str(&var.qname(c));
                    }
                }
                None => b.push_str(&var_ref.name()),
            },
            ExprKind::Derivative(op) => {
                b.push_str("dot(");
                op.write_code(b, c);
                b.push(')');
            }
            ExprKind::Partial(a, op_b) => {
                b.push_str("partial(");
                a.write_code(b, c);
                b.push_str(", ");
                op_b.write_code(b, c);
                b.push(')');
            }
            ExprKind::Initial(op) => {
                b.push_str("init(");
                op.write_code(b, c);
                b.push(')');
            }
            ExprKind::Unary(op, x) => {
                b.push_str(op.rep());
                if *op == UnaryOp::Not {
                    b.push(' ');
                }
                let brackets = x.rbp() > LITERAL && x.rbp() < self.rbp();
                if brackets {
                    b.push('(');
                }
                x.write_code(b, c);
                if brackets {
                    b.push(')');
                }
            }
            ExprKind::Binary(op, left, right) => {
                // Left operand brackets on `<`, right operand on `<=`, so
                // left-associative chains render flat while grouping on the
                // right side is kept visible.
                if left.rbp() > LITERAL && left.rbp() < self.rbp() {
                    b.push('(');
                    left.write_code(b, c);
                    b.push(')');
                } else {
                    left.write_code(b, c);
                }
                b.push(' ');
                b.push_str(op.rep());
                b.push(' ');
                if right.rbp() > LITERAL && right.rbp() <= self.rbp() {
                    b.push('(');
                    right.write_code(b, c);
                    b.push(')');
                } else {
                    right.write_code(b, c);
                }
            }
            ExprKind::Function(f, args) => {
                b.push_str(f.name());
                b.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        b.push_str(", ");
                    }
                    arg.write_code(b, c);
                }
                b.push(')');
            }
            ExprKind::If(cond, then, otherwise) => {
                b.push_str("if(");
                cond.write_code(b, c);
                b.push_str(", ");
                then.write_code(b, c);
                b.push_str(", ");
                otherwise.write_code(b, c);
                b.push(')');
            }
            ExprKind::Piecewise(ops) => {
                b.push_str("piecewise(");
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        b.push_str(", ");
                    }
                    op.write_code(b, c);
                }
                b.push(')');
            }
        }
    }

    /// The reverse-Polish canonical form of this expression. Variable
    /// references are written by identity, not by name, so equal trees over
    /// the same variables produce identical canonical forms regardless of
    /// surface spelling. Cached per node.
    ///
    /// The canonical form must stay usable before validation, so this walk
    /// never evaluates and never infers units.
    pub fn polish(&self) -> Arc<str> {
        if let Some(cached) = self.caches().polish.read().clone() {
            return cached;
        }
        let mut out = String::new();
        self.write_polish(&mut out);
        let out: Arc<str> = Arc::from(out);
        *self.caches().polish.write() = Some(out.clone());
        out
    }

    fn write_polish(&self, b: &mut String) {
        match self.kind() {
            ExprKind::Number { value, unit } => {
                b.push_str(&format_number(*value));
                if let Some(unit) = unit {
                    if !unit.is_dimensionless() {
                        b.push(' ');
                        b.push_str(&unit.to_string());
                    }
                }
            }
            ExprKind::Name(NameTarget::Sentinel(name)) => {
                b.push_str("str:");
                b.push_str(name);
            }
            ExprKind::Name(NameTarget::Variable(var_ref)) => {
                b.push_str("var:");
                b.push_str(&var_ref.id().to_string());
            }
            ExprKind::Derivative(op) => {
                b.push_str("dot ");
                op.write_polish(b);
            }
            ExprKind::Partial(a, op_b) => {
                b.push_str("partial ");
                a.write_polish(b);
                b.push(' ');
                op_b.write_polish(b);
            }
            ExprKind::Initial(op) => {
                b.push_str("init ");
                op.write_polish(b);
            }
            ExprKind::Unary(UnaryOp::Plus, x) => x.write_polish(b),
            ExprKind::Unary(UnaryOp::Minus, x) => {
                b.push_str("~ ");
                x.write_polish(b);
            }
            ExprKind::Unary(UnaryOp::Not, x) => {
                b.push_str("not ");
                x.write_polish(b);
            }
            ExprKind::Binary(op, left, right) => {
                b.push_str(op.rep());
                b.push(' ');
                left.write_polish(b);
                b.push(' ');
                right.write_polish(b);
            }
            ExprKind::Function(f, args) => {
                b.push_str(f.name());
                b.push(' ');
                b.push_str(&args.len().to_string());
                for arg in args {
                    b.push(' ');
                    arg.write_polish(b);
                }
            }
            ExprKind::If(..) | ExprKind::Piecewise(_) => {
                let name = if matches!(self.kind(), ExprKind::If(..)) {
                    "if"
                } else {
                    "piecewise"
                };
                let operands = self.operands();
                b.push_str(name);
                b.push(' ');
                b.push_str(&operands.len().to_string());
                for op in operands {
                    b.push(' ');
                    op.write_polish(b);
                }
            }
        }
    }

    /// The hash of the canonical form, cached per node.
    pub(crate) fn polish_hash(&self) -> u64 {
        if let Some(cached) = *self.caches().hash.read() {
            return cached;
        }
        let mut hasher = DefaultHasher::new();
        hasher.write(self.polish().as_bytes());
        let hash = hasher.finish();
        *self.caches().hash.write() = Some(hash);
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmt::expression::{BinaryOp, MathFunction};
    use crate::mmt::model::Model;
    use crate::mmt::unit::units;

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-5.0), "-5");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(100000.0), "100000");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(1e-5), "1e-5");
        assert_eq!(format_number(2.5e-7), "2.5e-7");
        assert_eq!(format_number(1e16), "1e16");
        assert_eq!(format_number(1.5e17), "1.5e17");
    }

    #[test]
    fn numbers_carry_units() {
        assert_eq!(Expr::number(5.0).code(None), "5");
        assert_eq!(
            Expr::number_with_unit(5.0, Some(units::volt())).code(None),
            "5 [V]"
        );
        assert_eq!(
            Expr::number_with_unit(5.0, Some(crate::mmt::unit::Unit::dimensionless())).code(None),
            "5"
        );
    }

    #[test]
    fn subtraction_keeps_right_grouping() {
        let left_nested = Expr::minus(
            Expr::minus(Expr::number(1.0), Expr::number(2.0)),
            Expr::number(3.0),
        );
        assert_eq!(left_nested.code(None), "1 - 2 - 3");

        let right_nested = Expr::minus(
            Expr::number(1.0),
            Expr::minus(Expr::number(2.0), Expr::number(3.0)),
        );
        assert_eq!(right_nested.code(None), "1 - (2 - 3)");
    }

    #[test]
    fn precedence_brackets() {
        let e = Expr::multiply(
            Expr::number(2.0),
            Expr::plus(Expr::number(5.0), Expr::number(3.0)),
        );
        assert_eq!(e.code(None), "2 * (5 + 3)");

        let e = Expr::plus(
            Expr::number(2.0),
            Expr::multiply(Expr::number(5.0), Expr::number(3.0)),
        );
        assert_eq!(e.code(None), "2 + 5 * 3");

        let e = Expr::power(
            Expr::number(2.0),
            Expr::power(Expr::number(3.0), Expr::number(4.0)),
        );
        assert_eq!(e.code(None), "2 ^ (3 ^ 4)");

        let e = Expr::power(
            Expr::power(Expr::number(2.0), Expr::number(3.0)),
            Expr::number(4.0),
        );
        assert_eq!(e.code(None), "2 ^ 3 ^ 4");
    }

    #[test]
    fn prefix_rendering() {
        let e = Expr::prefix_minus(Expr::plus(Expr::number(2.0), Expr::number(3.0)));
        assert_eq!(e.code(None), "-(2 + 3)");

        let e = Expr::prefix_minus(Expr::number(5.0));
        assert_eq!(e.code(None), "-5");

        let e = Expr::multiply(Expr::prefix_minus(Expr::number(5.0)), Expr::number(3.0));
        assert_eq!(e.code(None), "-5 * 3");

        let cond = Expr::binary(BinaryOp::Equal, Expr::number(1.0), Expr::number(1.0));
        assert_eq!(Expr::not(cond).code(None), "not (1 == 1)");
    }

    #[test]
    fn conditional_and_function_rendering() {
        let e = Expr::if_then_else(
            Expr::binary(BinaryOp::Less, Expr::number(1.0), Expr::number(2.0)),
            Expr::number(3.0),
            Expr::function(MathFunction::Log, vec![Expr::number(8.0), Expr::number(2.0)])
                .unwrap(),
        );
        assert_eq!(e.code(None), "if(1 < 2, 3, log(8, 2))");

        let pw = Expr::piecewise(vec![
            Expr::binary(BinaryOp::Less, Expr::number(1.0), Expr::number(2.0)),
            Expr::number(3.0),
            Expr::number(4.0),
        ])
        .unwrap();
        assert_eq!(pw.code(None), "piecewise(1 < 2, 3, 4)");
    }

    #[test]
    fn name_rendering_context() {
        let model = Model::new("m");
        let membrane = model.add_component("membrane");
        let ina = model.add_component("ina");
        let v = membrane.add_variable("V", None);

        let e = Expr::name(&v);
        assert_eq!(e.code(None), "membrane.V");
        assert_eq!(e.code(Some(&membrane)), "V");
        assert_eq!(e.code(Some(&ina)), "membrane.V");

        ina.add_alias("Vm", &v);
        assert_eq!(e.code(Some(&ina)), "Vm");

        let nested = v.add_nested_variable("alpha", None);
        assert_eq!(Expr::name(&nested).code(None), "alpha");
    }

    #[test]
    fn derivative_rendering() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        x.promote_to_state(0.0);
        let dot = Expr::derivative(Expr::name(&x)).unwrap();
        assert_eq!(dot.code(Some(&c)), "dot(x)");
        let init = Expr::initial(Expr::name(&x)).unwrap();
        assert_eq!(init.code(Some(&c)), "init(x)");
        let partial = Expr::partial(Expr::name(&x), init).unwrap();
        assert_eq!(partial.code(Some(&c)), "partial(x, init(x))");
    }

    #[test]
    fn polish_forms() {
        let e = Expr::plus(Expr::number(5.0), Expr::number(2.0));
        assert_eq!(&*e.polish(), "+ 5 2");

        let e = Expr::prefix_minus(Expr::number(5.0));
        assert_eq!(&*e.polish(), "~ 5");

        let e = Expr::function(MathFunction::Log, vec![Expr::number(8.0), Expr::number(2.0)])
            .unwrap();
        assert_eq!(&*e.polish(), "log 2 8 2");

        let pw = Expr::piecewise(vec![
            Expr::binary(BinaryOp::Less, Expr::number(1.0), Expr::number(2.0)),
            Expr::number(3.0),
            Expr::number(4.0),
        ])
        .unwrap();
        assert_eq!(&*pw.polish(), "piecewise 3 < 1 2 3 4");
    }

    #[test]
    fn polish_keeps_partial_operands_separated() {
        let model = Model::new("m");
        let c = model.add_component("c");
        let x = c.add_variable("x", None);
        let xy = c.add_variable("xy", None);
        let p1 = Expr::partial(Expr::name(&x), Expr::name(&xy)).unwrap();
        let p2 = Expr::partial(Expr::name(&xy), Expr::name(&x)).unwrap();
        assert_ne!(p1.polish(), p2.polish());
        assert!(p1.polish().contains(' '));
    }

    #[test]
    fn polish_uses_variable_identity() {
        let model = Model::new("m");
        let c1 = model.add_component("c1");
        let c2 = model.add_component("c2");
        let x1 = c1.add_variable("x", None);
        let x2 = c2.add_variable("x", None);
        assert_ne!(Expr::name(&x1).polish(), Expr::name(&x2).polish());
        // Same handle, different surface spellings, same canonical form.
        c2.add_alias("y", &x1);
        let e = Expr::name(&x1);
        assert_ne!(e.code(Some(&c1)), e.code(Some(&c2)));
        assert_eq!(e.polish(), Expr::name(&x1).polish());
    }
}
