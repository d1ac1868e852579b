//! The expression node model: an immutable tree of tagged nodes with
//! per-node write-once caches for the canonical form, the hash, and the
//! unit inference results.

use crate::mmt::diagnostics::{IncompatibleUnitError, IntegrityError};
use crate::mmt::lexer::Token;
use crate::mmt::model::{VarRef, Variable};
use crate::mmt::unit::Unit;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Right binding powers, as used by the surface parser and the renderer.
pub const LITERAL: u8 = 0;
pub const CONDITION_AND: u8 = 10;
pub const CONDITIONAL: u8 = 20;
pub const SUM: u8 = 30;
pub const PRODUCT: u8 = 40;
pub const PREFIX: u8 = 50;
pub const POWER: u8 = 60;
pub const FUNCTION_CALL: u8 = 70;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

impl UnaryOp {
    pub fn rep(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "not",
        }
    }

    pub fn is_condition(&self) -> bool {
        matches!(self, UnaryOp::Not)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BinaryOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Quotient,
    Remainder,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    More,
    MoreEqual,
    And,
    Or,
}

impl BinaryOp {
    pub fn rep(&self) -> &'static str {
        match self {
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Quotient => "//",
            BinaryOp::Remainder => "%",
            BinaryOp::Power => "^",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::More => ">",
            BinaryOp::MoreEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn rbp(&self) -> u8 {
        match self {
            BinaryOp::Plus | BinaryOp::Minus => SUM,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Quotient | BinaryOp::Remainder => {
                PRODUCT
            }
            BinaryOp::Power => POWER,
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::More
            | BinaryOp::MoreEqual => CONDITIONAL,
            BinaryOp::And | BinaryOp::Or => CONDITION_AND,
        }
    }

    /// True for the operators whose result is a truth value.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::More
                | BinaryOp::MoreEqual
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MathFunction {
    Sqrt,
    Sin,
    Cos,
    Tan,
    ASin,
    ACos,
    ATan,
    Exp,
    Log,
    Log10,
    Floor,
    Ceil,
    Abs,
}

impl MathFunction {
    pub fn name(&self) -> &'static str {
        match self {
            MathFunction::Sqrt => "sqrt",
            MathFunction::Sin => "sin",
            MathFunction::Cos => "cos",
            MathFunction::Tan => "tan",
            MathFunction::ASin => "asin",
            MathFunction::ACos => "acos",
            MathFunction::ATan => "atan",
            MathFunction::Exp => "exp",
            MathFunction::Log => "log",
            MathFunction::Log10 => "log10",
            MathFunction::Floor => "floor",
            MathFunction::Ceil => "ceil",
            MathFunction::Abs => "abs",
        }
    }

    pub fn from_name(name: &str) -> Option<MathFunction> {
        use MathFunction::*;
        Some(match name {
            "sqrt" => Sqrt,
            "sin" => Sin,
            "cos" => Cos,
            "tan" => Tan,
            "asin" => ASin,
            "acos" => ACos,
            "atan" => ATan,
            "exp" => Exp,
            "log" => Log,
            "log10" => Log10,
            "floor" => Floor,
            "ceil" => Ceil,
            "abs" => Abs,
            _ => return None,
        })
    }

    /// The argument counts this function accepts.
    pub fn arities(&self) -> &'static [usize] {
        match self {
            MathFunction::Log => &[1, 2],
            _ => &[1],
        }
    }

    /// True for the functions that require (and return) dimensionless
    /// values.
    pub fn is_dimensionless(&self) -> bool {
        matches!(
            self,
            MathFunction::Sin
                | MathFunction::Cos
                | MathFunction::Tan
                | MathFunction::ASin
                | MathFunction::ACos
                | MathFunction::ATan
                | MathFunction::Exp
                | MathFunction::Log10
        )
    }
}

/// The target of a `Name` node: normally a variable handle, but a plain
/// string is accepted during construction for debugging. Validation rejects
/// the sentinel form.
#[derive(Clone, Debug)]
pub enum NameTarget {
    Variable(VarRef),
    Sentinel(String),
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Number { value: f64, unit: Option<Unit> },
    Name(NameTarget),
    Derivative(Expr),
    Partial(Expr, Expr),
    Initial(Expr),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
    Function(MathFunction, Vec<Expr>),
    If(Expr, Expr, Expr),
    Piecewise(Vec<Expr>),
}

pub(crate) type UnitResult = Result<Option<Unit>, IncompatibleUnitError>;

#[derive(Default)]
pub(crate) struct Caches {
    pub polish: RwLock<Option<Arc<str>>>,
    pub hash: RwLock<Option<u64>>,
    pub unit_tolerant: RwLock<Option<UnitResult>>,
    pub unit_strict: RwLock<Option<UnitResult>>,
    pub validated: AtomicBool,
}

pub struct ExprNode {
    kind: ExprKind,
    token: Option<Token>,
    has_partials: bool,
    has_initials: bool,
    caches: Caches,
}

/// An immutable expression tree. `Expr` is a cheap handle: cloning shares
/// the node, which is safe because nodes never change after construction.
#[derive(Clone)]
pub struct Expr {
    node: Arc<ExprNode>,
}

pub type SubstMap = HashMap<Expr, Expr>;

impl Expr {
    pub(crate) fn build(kind: ExprKind, token: Option<Token>) -> Expr {
        let mut has_partials = matches!(kind, ExprKind::Partial(..));
        let mut has_initials = matches!(kind, ExprKind::Initial(..));
        for op in kind_operands(&kind) {
            has_partials |= op.node.has_partials;
            has_initials |= op.node.has_initials;
        }
        Expr {
            node: Arc::new(ExprNode {
                kind,
                token,
                has_partials,
                has_initials,
                caches: Caches::default(),
            }),
        }
    }

    pub fn number(value: f64) -> Expr {
        Expr::number_with_unit(value, None)
    }

    pub fn number_with_unit(value: f64, unit: Option<Unit>) -> Expr {
        Expr::build(ExprKind::Number { value, unit }, None)
    }

    pub fn name(variable: &Variable) -> Expr {
        Expr::build(ExprKind::Name(NameTarget::Variable(variable.downgrade())), None)
    }

    /// A name that refers to nothing; fails validation but renders. Useful
    /// for debugging and for parsing without a resolution context.
    pub fn sentinel_name(name: impl Into<String>) -> Expr {
        Expr::build(ExprKind::Name(NameTarget::Sentinel(name.into())), None)
    }

    /// A reference to the time derivative of a state variable: `dot(x)`.
    pub fn derivative(op: Expr) -> Result<Expr, IntegrityError> {
        if !op.is_name() {
            return Err(IntegrityError::new(
                "The dot() operator can only be used on variables.",
                op.span(),
            ));
        }
        Ok(Expr::build(ExprKind::Derivative(op), None))
    }

    /// A reference to the partial derivative of one variable with respect
    /// to another: `partial(x, y)` or `partial(x, init(y))`.
    pub fn partial(var1: Expr, var2: Expr) -> Result<Expr, IntegrityError> {
        if !var1.is_name() {
            return Err(IntegrityError::new(
                "The first argument to a partial derivative must be a variable name.",
                var1.span(),
            ));
        }
        if !(var2.is_name() || matches!(var2.kind(), ExprKind::Initial(_))) {
            return Err(IntegrityError::new(
                "The second argument to a partial derivative must be a variable name or an \
                 initial value.",
                var2.span(),
            ));
        }
        Ok(Expr::build(ExprKind::Partial(var1, var2), None))
    }

    /// A reference to the initial value of a state variable: `init(x)`.
    pub fn initial(op: Expr) -> Result<Expr, IntegrityError> {
        if !op.is_name() {
            return Err(IntegrityError::new(
                "The init() operator can only be used on variables.",
                op.span(),
            ));
        }
        Ok(Expr::build(ExprKind::Initial(op), None))
    }

    pub fn unary(op: UnaryOp, x: Expr) -> Expr {
        Expr::build(ExprKind::Unary(op, x), None)
    }

    pub fn prefix_plus(x: Expr) -> Expr {
        Expr::unary(UnaryOp::Plus, x)
    }

    pub fn prefix_minus(x: Expr) -> Expr {
        Expr::unary(UnaryOp::Minus, x)
    }

    pub fn not(x: Expr) -> Expr {
        Expr::unary(UnaryOp::Not, x)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::build(ExprKind::Binary(op, left, right), None)
    }

    pub fn plus(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Plus, left, right)
    }

    pub fn minus(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Minus, left, right)
    }

    pub fn multiply(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Multiply, left, right)
    }

    pub fn divide(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Divide, left, right)
    }

    pub fn power(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Power, left, right)
    }

    pub fn function(function: MathFunction, args: Vec<Expr>) -> Result<Expr, IntegrityError> {
        if !function.arities().contains(&args.len()) {
            return Err(IntegrityError::new(
                format!(
                    "Function {}() created with wrong number of arguments ({}, expecting {}).",
                    function.name(),
                    args.len(),
                    function
                        .arities()
                        .iter()
                        .map(usize::to_string)
                        .collect::<Vec<_>>()
                        .join(" or ")
                ),
                args.first().and_then(Expr::span),
            ));
        }
        Ok(Expr::build(ExprKind::Function(function, args), None))
    }

    pub fn if_then_else(condition: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::build(ExprKind::If(condition, then, otherwise), None)
    }

    /// A piecewise expression: `(condition, value)` pairs followed by a
    /// default, so the argument count must be odd and at least 3.
    pub fn piecewise(ops: Vec<Expr>) -> Result<Expr, IntegrityError> {
        if ops.len() % 2 == 0 {
            return Err(IntegrityError::new(
                "Piecewise function must have odd number of arguments: \
                 ([condition, value]+, else_value).",
                ops.first().and_then(Expr::span),
            ));
        }
        if ops.len() < 3 {
            return Err(IntegrityError::new(
                "Piecewise function must have 3 or more arguments.",
                ops.first().and_then(Expr::span),
            ));
        }
        Ok(Expr::build(ExprKind::Piecewise(ops), None))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.node.kind
    }

    pub fn token(&self) -> Option<&Token> {
        self.node.token.as_ref()
    }

    /// A copy of this node carrying a source token, sharing the children.
    pub(crate) fn attach_token(&self, token: Token) -> Expr {
        Expr::build(self.node.kind.clone(), Some(token))
    }

    pub fn span(&self) -> Option<crate::mmt::data::Span> {
        self.node.token.as_ref().map(|t| t.span)
    }

    pub(crate) fn caches(&self) -> &Caches {
        &self.node.caches
    }

    /// The node's identity, used for cycle detection and DAG-aware
    /// traversals.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.node) as usize
    }

    pub fn rbp(&self) -> u8 {
        match &self.node.kind {
            ExprKind::Number { .. } | ExprKind::Name(_) => LITERAL,
            ExprKind::Unary(..) => PREFIX,
            ExprKind::Binary(op, ..) => op.rbp(),
            _ => FUNCTION_CALL,
        }
    }

    pub fn operands(&self) -> Vec<Expr> {
        kind_operands(&self.node.kind).into_iter().cloned().collect()
    }

    /// Depth-first pre-order iterator over the whole tree.
    pub fn walk(&self) -> Walk {
        Walk {
            stack: vec![self.clone()],
        }
    }

    pub fn contains_partials(&self) -> bool {
        self.node.has_partials
    }

    pub fn contains_initials(&self) -> bool {
        self.node.has_initials
    }

    /// All references to variables made in this expression. A `dot(x)`
    /// counts as a reference to the derivative, not to `x` itself.
    pub fn references(&self) -> HashSet<Expr> {
        let mut out = HashSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut HashSet<Expr>) {
        match &self.node.kind {
            ExprKind::Name(_)
            | ExprKind::Derivative(_)
            | ExprKind::Partial(..)
            | ExprKind::Initial(_) => {
                out.insert(self.clone());
            }
            kind => {
                for op in kind_operands(kind) {
                    op.collect_references(out);
                }
            }
        }
    }

    pub fn depends_on(&self, lhs: &Expr) -> bool {
        self.references().contains(lhs)
    }

    /// True if the expression contains no variable references.
    pub fn is_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// True if the expression only references variables with a constant
    /// value.
    pub fn is_constant(&self) -> bool {
        self.references().iter().all(|r| match r.var() {
            Some(var) => var.is_constant(),
            None => false,
        })
    }

    pub fn is_conditional(&self) -> bool {
        self.walk()
            .any(|e| matches!(e.kind(), ExprKind::If(..) | ExprKind::Piecewise(_)))
    }

    pub fn is_name(&self) -> bool {
        matches!(self.node.kind, ExprKind::Name(_))
    }

    pub fn is_number(&self, value: Option<f64>) -> bool {
        match (&self.node.kind, value) {
            (ExprKind::Number { .. }, None) => true,
            (ExprKind::Number { value: v, .. }, Some(expected)) => *v == expected,
            _ => false,
        }
    }

    pub fn is_derivative(&self) -> bool {
        matches!(self.node.kind, ExprKind::Derivative(_))
    }

    /// True if this is a name pointing at the current value of a state.
    pub fn is_state_value(&self) -> bool {
        self.is_name() && self.var().is_some_and(|v| v.is_state())
    }

    /// For the left-hand-side kinds, the variable referred to. `dot(x)`,
    /// `init(x)` and `partial(x, _)` all answer `x`.
    pub fn var(&self) -> Option<Variable> {
        match &self.node.kind {
            ExprKind::Name(NameTarget::Variable(var)) => var.upgrade(),
            ExprKind::Name(NameTarget::Sentinel(_)) => None,
            ExprKind::Derivative(op) | ExprKind::Initial(op) | ExprKind::Partial(op, _) => {
                op.var()
            }
            _ => None,
        }
    }

    /// The number's stored unit, if this is a number.
    pub fn number_unit(&self) -> Option<Unit> {
        match &self.node.kind {
            ExprKind::Number { unit, .. } => unit.clone(),
            _ => None,
        }
    }

    /// Clones this expression, optionally substituting whole sub-trees and
    /// expanding variables.
    ///
    /// Any sub-expression equal to a key of `subst` is replaced by the
    /// mapped value, without descending into it. With `expand` set, a name
    /// of a non-state variable is replaced by a clone of the variable's
    /// defining expression, unless the variable is matched by `retain`.
    /// Substitution takes precedence over expansion.
    pub fn clone_with(
        &self,
        subst: Option<&SubstMap>,
        expand: bool,
        retain: Option<&RetainSet>,
    ) -> Expr {
        if let Some(replacement) = subst.and_then(|s| s.get(self)) {
            return replacement.clone();
        }
        if expand {
            if let ExprKind::Name(NameTarget::Variable(var_ref)) = &self.node.kind {
                if let Some(var) = var_ref.upgrade() {
                    let retained = retain.is_some_and(|r| r.contains(&var));
                    if !var.is_state() && !retained {
                        if let Some(rhs) = var.rhs() {
                            return rhs.clone_with(subst, expand, retain);
                        }
                    }
                }
            }
        }
        let kind = match &self.node.kind {
            ExprKind::Number { value, unit } => ExprKind::Number {
                value: *value,
                unit: unit.clone(),
            },
            ExprKind::Name(target) => ExprKind::Name(target.clone()),
            ExprKind::Derivative(op) => {
                ExprKind::Derivative(op.clone_with(subst, expand, retain))
            }
            ExprKind::Partial(a, b) => ExprKind::Partial(
                a.clone_with(subst, expand, retain),
                b.clone_with(subst, expand, retain),
            ),
            ExprKind::Initial(op) => ExprKind::Initial(op.clone_with(subst, expand, retain)),
            ExprKind::Unary(op, x) => {
                ExprKind::Unary(*op, x.clone_with(subst, expand, retain))
            }
            ExprKind::Binary(op, a, b) => ExprKind::Binary(
                *op,
                a.clone_with(subst, expand, retain),
                b.clone_with(subst, expand, retain),
            ),
            ExprKind::Function(f, args) => ExprKind::Function(
                *f,
                args.iter()
                    .map(|a| a.clone_with(subst, expand, retain))
                    .collect(),
            ),
            ExprKind::If(c, t, e) => ExprKind::If(
                c.clone_with(subst, expand, retain),
                t.clone_with(subst, expand, retain),
                e.clone_with(subst, expand, retain),
            ),
            ExprKind::Piecewise(ops) => ExprKind::Piecewise(
                ops.iter()
                    .map(|o| o.clone_with(subst, expand, retain))
                    .collect(),
            ),
        };
        Expr::build(kind, None)
    }

    /// Validates operand kinds and checks for cyclical structures, without
    /// following variable references. The result is cached per node.
    pub fn validate(&self) -> Result<(), IntegrityError> {
        self.validate_with_trail(&mut vec![])
    }

    fn validate_with_trail(&self, trail: &mut Vec<usize>) -> Result<(), IntegrityError> {
        if self.node.caches.validated.load(Ordering::Acquire) {
            return Ok(());
        }
        let identity = self.identity();
        // Identity comparison is deliberate: equal-but-distinct nodes in two
        // branches are fine, a node that is its own ancestor is not.
        if trail.contains(&identity) {
            return Err(IntegrityError::new("Cyclical expression found", self.span()));
        }
        match &self.node.kind {
            ExprKind::Name(NameTarget::Sentinel(name)) => {
                return Err(IntegrityError::new(
                    format!("Name value \"{name}\" is not a model variable"),
                    self.span(),
                ));
            }
            ExprKind::Name(NameTarget::Variable(var_ref)) => {
                if var_ref.upgrade().is_none() {
                    return Err(IntegrityError::new(
                        format!(
                            "Name \"{}\" refers to a variable whose model no longer exists",
                            var_ref.name()
                        ),
                        self.span(),
                    ));
                }
            }
            ExprKind::Derivative(op) => {
                if !op.var().is_some_and(|v| v.is_state()) {
                    return Err(IntegrityError::new(
                        "Derivatives can only be defined for state variables.",
                        self.span(),
                    ));
                }
            }
            ExprKind::Initial(op) => {
                if !op.var().is_some_and(|v| v.is_state()) {
                    return Err(IntegrityError::new(
                        "Initial values can only be defined for state variables.",
                        self.span(),
                    ));
                }
            }
            // Constructors enforce these, but cloning with substitution can
            // rebuild a partial around a replaced operand.
            ExprKind::Partial(a, b) => {
                if !a.is_name() {
                    return Err(IntegrityError::new(
                        "The first argument to a partial derivative must be a variable name.",
                        self.span(),
                    ));
                }
                if !(b.is_name() || matches!(b.kind(), ExprKind::Initial(_))) {
                    return Err(IntegrityError::new(
                        "The second argument to a partial derivative must be a variable name \
                         or an initial value.",
                        self.span(),
                    ));
                }
            }
            _ => {}
        }
        trail.push(identity);
        for op in self.operands() {
            op.validate_with_trail(trail)?;
        }
        trail.pop();
        self.node.caches.validated.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes the parse tree as an indented multi-line string.
    pub fn tree_str(&self) -> String {
        let mut out = String::new();
        self.tree_str_into(&mut out, 0);
        out
    }

    fn tree_str_into(&self, out: &mut String, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        let label = match &self.node.kind {
            ExprKind::Number { .. } => self.code(None),
            ExprKind::Name(_) => self.code(None),
            ExprKind::Derivative(op) => format!("dot({})", op.code(None)),
            ExprKind::Partial(a, b) => format!("partial({}, {})", a.code(None), b.code(None)),
            ExprKind::Initial(op) => format!("init({})", op.code(None)),
            ExprKind::Unary(op, _) => op.rep().to_string(),
            ExprKind::Binary(op, ..) => op.rep().to_string(),
            ExprKind::Function(f, _) => f.name().to_string(),
            ExprKind::If(..) => "if".to_string(),
            ExprKind::Piecewise(_) => "piecewise".to_string(),
        };
        out.push_str(&label);
        out.push('\n');
        match &self.node.kind {
            ExprKind::Number { .. }
            | ExprKind::Name(_)
            | ExprKind::Derivative(_)
            | ExprKind::Partial(..)
            | ExprKind::Initial(_) => {}
            kind => {
                for op in kind_operands(kind) {
                    op.tree_str_into(out, depth + 1);
                }
            }
        }
    }

    /// True if both nodes have the same kind tag, including the operator or
    /// function for the operator-carrying kinds.
    pub fn same_kind(&self, other: &Expr) -> bool {
        match (&self.node.kind, &other.node.kind) {
            (ExprKind::Number { .. }, ExprKind::Number { .. }) => true,
            (ExprKind::Name(_), ExprKind::Name(_)) => true,
            (ExprKind::Derivative(_), ExprKind::Derivative(_)) => true,
            (ExprKind::Partial(..), ExprKind::Partial(..)) => true,
            (ExprKind::Initial(_), ExprKind::Initial(_)) => true,
            (ExprKind::Unary(a, _), ExprKind::Unary(b, _)) => a == b,
            (ExprKind::Binary(a, ..), ExprKind::Binary(b, ..)) => a == b,
            (ExprKind::Function(a, _), ExprKind::Function(b, _)) => a == b,
            (ExprKind::If(..), ExprKind::If(..)) => true,
            (ExprKind::Piecewise(_), ExprKind::Piecewise(_)) => true,
            _ => false,
        }
    }
}

fn kind_operands(kind: &ExprKind) -> Vec<&Expr> {
    match kind {
        ExprKind::Number { .. } | ExprKind::Name(_) => vec![],
        ExprKind::Derivative(op) | ExprKind::Initial(op) | ExprKind::Unary(_, op) => {
            vec![op]
        }
        ExprKind::Partial(a, b) | ExprKind::Binary(_, a, b) => vec![a, b],
        ExprKind::Function(_, args) => args.iter().collect(),
        ExprKind::If(c, t, e) => vec![c, t, e],
        ExprKind::Piecewise(ops) => ops.iter().collect(),
    }
}

pub struct Walk {
    stack: Vec<Expr>,
}

impl Iterator for Walk {
    type Item = Expr;

    fn next(&mut self) -> Option<Expr> {
        let next = self.stack.pop()?;
        let mut operands = next.operands();
        operands.reverse();
        self.stack.extend(operands);
        Some(next)
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.same_kind(other) && self.polish() == other.polish()
    }
}

impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.polish_hash());
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code(None))
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expr[{}]", self.code(None))
    }
}

/// Variables exempted from expansion in `clone_with`. A variable matches if
/// its handle was added, or if its short or qualified name was.
#[derive(Default)]
pub struct RetainSet {
    ids: HashSet<u64>,
    names: HashSet<String>,
}

impl RetainSet {
    pub fn new() -> RetainSet {
        RetainSet::default()
    }

    pub fn add_variable(&mut self, variable: &Variable) {
        self.ids.insert(variable.id());
    }

    pub fn add_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, variable: &Variable) -> bool {
        self.ids.contains(&variable.id())
            || self.names.contains(&variable.name())
            || self.names.contains(&variable.qname(None))
    }
}
