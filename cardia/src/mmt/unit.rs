use std::fmt::{Display, Formatter};
use std::ops::{Div, Mul};

/// A rational number used for unit exponents.
///
/// Always stored in reduced form with a positive denominator, so derived
/// equality and hashing are structural.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Rational {
    num: i64,
    den: i64,
}

const fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    if a < 0 {
        -a
    } else {
        a
    }
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    pub fn new(num: i64, den: i64) -> Rational {
        assert!(den != 0, "Rational with zero denominator");
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den);
        Rational {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    pub const fn from_int(num: i64) -> Rational {
        Rational { num, den: 1 }
    }

    /// Finds a rational close to `value` using a bounded continued fraction
    /// expansion. Returns `None` if no denominator up to 1000 gets within
    /// 1e-9 of the value.
    pub fn approx_from_f64(value: f64) -> Option<Rational> {
        if !value.is_finite() {
            return None;
        }
        let (mut h0, mut h1) = (1i64, value.floor() as i64);
        let (mut k0, mut k1) = (0i64, 1i64);
        let mut frac = value - value.floor();
        for _ in 0..32 {
            if (h1 as f64 / k1 as f64 - value).abs() < 1e-9 {
                return Some(Rational::new(h1, k1));
            }
            if frac.abs() < 1e-12 {
                break;
            }
            let r = 1.0 / frac;
            let a = r.floor();
            frac = r - a;
            let h2 = a as i64 * h1 + h0;
            let k2 = a as i64 * k1 + k0;
            if k2 > 1000 {
                break;
            }
            (h0, h1) = (h1, h2);
            (k0, k1) = (k1, k2);
        }
        None
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn add(&self, other: Rational) -> Rational {
        Rational::new(self.num * other.den + other.num * self.den, self.den * other.den)
    }

    pub fn sub(&self, other: Rational) -> Rational {
        Rational::new(self.num * other.den - other.num * self.den, self.den * other.den)
    }

    pub fn mul(&self, other: Rational) -> Rational {
        Rational::new(self.num * other.num, self.den * other.den)
    }

    pub fn neg(&self) -> Rational {
        Rational {
            num: -self.num,
            den: self.den,
        }
    }
}

impl Display for Rational {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "({}/{})", self.num, self.den)
        }
    }
}

/// The policy for handling missing unit annotations during unit inference:
/// tolerant propagates unknown as unknown, strict treats unknown as
/// dimensionless.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UnitMode {
    Tolerant,
    Strict,
}

/// Number of base dimensions: grams, metres, seconds, amperes, kelvin,
/// candela, mole.
const DIMENSIONS: usize = 7;

const BASE_SYMBOLS: [&str; DIMENSIONS] = ["g", "m", "s", "A", "K", "cd", "mol"];

/// A product of base units with rational exponents and a scale factor.
///
/// The scale factor is stored as its base-10 logarithm, so that
/// multiplication and division of units stay additive and exact powers of
/// ten remain exact. `[mV]` is volts with a log multiplier of -3.
#[derive(Clone, Debug)]
pub struct Unit {
    exponents: [Rational; DIMENSIONS],
    multiplier_log10: f64,
}

/// Tolerance used when comparing unit multipliers on the log scale.
const MULTIPLIER_TOLERANCE: f64 = 1e-9;

const fn exps(g: i64, m: i64, s: i64, a: i64, k: i64, cd: i64, mol: i64) -> [Rational; DIMENSIONS] {
    [
        Rational::from_int(g),
        Rational::from_int(m),
        Rational::from_int(s),
        Rational::from_int(a),
        Rational::from_int(k),
        Rational::from_int(cd),
        Rational::from_int(mol),
    ]
}

const fn base_unit(exponents: [Rational; DIMENSIONS], multiplier_log10: f64) -> Unit {
    Unit {
        exponents,
        multiplier_log10,
    }
}

/// Derived units known by name. Order matters: the formatter picks the first
/// exact match.
const NAMED_UNITS: [(&str, Unit); 12] = [
    ("V", base_unit(exps(1, 2, -3, -1, 0, 0, 0), 3.0)),
    ("A", base_unit(exps(0, 0, 0, 1, 0, 0, 0), 0.0)),
    ("F", base_unit(exps(-1, -2, 4, 2, 0, 0, 0), -3.0)),
    ("S", base_unit(exps(-1, -2, 3, 2, 0, 0, 0), -3.0)),
    ("ohm", base_unit(exps(1, 2, -3, -2, 0, 0, 0), 3.0)),
    ("N", base_unit(exps(1, 1, -2, 0, 0, 0, 0), 3.0)),
    ("J", base_unit(exps(1, 2, -2, 0, 0, 0, 0), 3.0)),
    ("W", base_unit(exps(1, 2, -3, 0, 0, 0, 0), 3.0)),
    ("Hz", base_unit(exps(0, 0, -1, 0, 0, 0, 0), 0.0)),
    ("C", base_unit(exps(0, 0, 1, 1, 0, 0, 0), 0.0)),
    ("Pa", base_unit(exps(1, -1, -2, 0, 0, 0, 0), 3.0)),
    ("L", base_unit(exps(0, 3, 0, 0, 0, 0, 0), -3.0)),
];

/// SI prefixes, longest symbols first so that prefix stripping is greedy.
const PREFIXES: [(&str, f64); 16] = [
    ("da", 1.0),
    ("T", 12.0),
    ("G", 9.0),
    ("M", 6.0),
    ("k", 3.0),
    ("h", 2.0),
    ("d", -1.0),
    ("c", -2.0),
    ("u", -6.0),
    ("n", -9.0),
    ("p", -12.0),
    ("f", -15.0),
    ("a", -18.0),
    ("z", -21.0),
    ("y", -24.0),
    ("m", -3.0),
];

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.exponents == other.exponents
            && (self.multiplier_log10 - other.multiplier_log10).abs() < MULTIPLIER_TOLERANCE
    }
}

impl Unit {
    pub fn dimensionless() -> Unit {
        base_unit(exps(0, 0, 0, 0, 0, 0, 0), 0.0)
    }

    /// Returns the unit scaled by an additional factor, e.g.
    /// `units::volt().scaled(-3.0)` is a millivolt.
    pub fn scaled(&self, log10: f64) -> Unit {
        Unit {
            exponents: self.exponents,
            multiplier_log10: self.multiplier_log10 + log10,
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.exponents.iter().all(Rational::is_zero)
            && self.multiplier_log10.abs() < MULTIPLIER_TOLERANCE
    }

    pub fn multiplier(&self) -> f64 {
        10f64.powf(self.multiplier_log10)
    }

    pub fn inverse(&self) -> Unit {
        let mut exponents = [Rational::ZERO; DIMENSIONS];
        for (i, e) in self.exponents.iter().enumerate() {
            exponents[i] = e.neg();
        }
        Unit {
            exponents,
            multiplier_log10: -self.multiplier_log10,
        }
    }

    pub fn pow(&self, exponent: Rational) -> Unit {
        let mut exponents = [Rational::ZERO; DIMENSIONS];
        for (i, e) in self.exponents.iter().enumerate() {
            exponents[i] = e.mul(exponent);
        }
        Unit {
            exponents,
            multiplier_log10: self.multiplier_log10 * exponent.as_f64(),
        }
    }

    /// Raises the unit to a float power, as needed for `a ^ b` where the
    /// exponent is only known by evaluation. Fails if the exponent is not
    /// (close to) a small rational, since the result would have no exact
    /// exponent representation.
    pub fn powf(&self, exponent: f64) -> Option<Unit> {
        if self.is_dimensionless() {
            return Some(Unit::dimensionless());
        }
        Rational::approx_from_f64(exponent).map(|r| self.pow(r))
    }

    fn try_named(&self) -> Option<String> {
        for (symbol, unit) in &NAMED_UNITS {
            if self == unit {
                return Some((*symbol).to_string());
            }
        }
        for (i, symbol) in BASE_SYMBOLS.iter().enumerate() {
            let mut exponents = [Rational::ZERO; DIMENSIONS];
            exponents[i] = Rational::ONE;
            if self.exponents == exponents && self.multiplier_log10.abs() < MULTIPLIER_TOLERANCE {
                return Some((*symbol).to_string());
            }
        }
        None
    }

    fn try_prefixed(&self) -> Option<String> {
        for (prefix, log10) in &PREFIXES {
            if let Some(name) = self.scaled(-log10).try_named() {
                return Some(format!("{prefix}{name}"));
            }
        }
        None
    }

    fn composed(&self) -> String {
        let mut numerator = String::new();
        let mut denominator = String::new();
        for (i, e) in self.exponents.iter().enumerate() {
            if e.is_zero() {
                continue;
            }
            let (target, exp) = if e.num > 0 {
                (&mut numerator, *e)
            } else {
                (&mut denominator, e.neg())
            };
            if !target.is_empty() {
                target.push('*');
            }
            target.push_str(BASE_SYMBOLS[i]);
            if exp != Rational::ONE {
                target.push('^');
                target.push_str(&exp.to_string());
            }
        }
        let mut out = if numerator.is_empty() {
            "1".to_string()
        } else {
            numerator
        };
        if !denominator.is_empty() {
            out.push('/');
            out.push_str(&denominator);
        }
        if self.multiplier_log10.abs() >= MULTIPLIER_TOLERANCE {
            out.push_str(&format!(" ({})", format_multiplier(self.multiplier())));
        }
        out
    }
}

fn format_multiplier(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e16 {
        format!("{}", value as i64)
    } else {
        format!("{value:e}")
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let body = self
            .try_named()
            .or_else(|| self.try_prefixed())
            .unwrap_or_else(|| self.composed());
        write!(f, "[{body}]")
    }
}

impl Mul for &Unit {
    type Output = Unit;

    fn mul(self, rhs: &Unit) -> Unit {
        let mut exponents = [Rational::ZERO; DIMENSIONS];
        for i in 0..DIMENSIONS {
            exponents[i] = self.exponents[i].add(rhs.exponents[i]);
        }
        Unit {
            exponents,
            multiplier_log10: self.multiplier_log10 + rhs.multiplier_log10,
        }
    }
}

impl Div for &Unit {
    type Output = Unit;

    fn div(self, rhs: &Unit) -> Unit {
        let mut exponents = [Rational::ZERO; DIMENSIONS];
        for i in 0..DIMENSIONS {
            exponents[i] = self.exponents[i].sub(rhs.exponents[i]);
        }
        Unit {
            exponents,
            multiplier_log10: self.multiplier_log10 - rhs.multiplier_log10,
        }
    }
}

fn resolve_symbol(symbol: &str) -> Option<Unit> {
    for (name, unit) in &NAMED_UNITS {
        if *name == symbol {
            return Some(unit.clone());
        }
    }
    for (i, name) in BASE_SYMBOLS.iter().enumerate() {
        if *name == symbol {
            let mut exponents = [Rational::ZERO; DIMENSIONS];
            exponents[i] = Rational::ONE;
            return Some(base_unit(exponents, 0.0));
        }
    }
    None
}

/// Parses a unit expression such as `mV`, `m^2`, `mS/uF` or `1`.
///
/// The grammar is a product of (possibly prefixed) unit names with optional
/// integer exponents, separated by `*` or `/`.
pub fn parse_unit(text: &str) -> Result<Unit, String> {
    let mut result = Unit::dimensionless();
    let mut divide = false;
    let mut rest = text.trim();
    if rest.is_empty() {
        return Err("Empty unit specification".to_string());
    }
    // A trailing ` (x)` is a plain scale factor, as written by the formatter.
    if let Some((head, tail)) = rest.rsplit_once(" (") {
        let factor: f64 = tail
            .strip_suffix(')')
            .and_then(|t| t.trim().parse().ok())
            .filter(|f: &f64| *f > 0.0)
            .ok_or_else(|| format!("Invalid unit multiplier '({tail}'"))?;
        result = result.scaled(factor.log10());
        rest = head.trim();
    }
    loop {
        let end = rest
            .find(['*', '/'])
            .unwrap_or(rest.len());
        let factor = parse_factor(rest[..end].trim())?;
        result = if divide {
            &result / &factor
        } else {
            &result * &factor
        };
        if end == rest.len() {
            return Ok(result);
        }
        divide = rest.as_bytes()[end] == b'/';
        rest = &rest[end + 1..];
    }
}

fn parse_factor(text: &str) -> Result<Unit, String> {
    let (name, exponent) = match text.split_once('^') {
        Some((name, exp)) => {
            let exp: i64 = exp
                .trim()
                .parse()
                .map_err(|_| format!("Invalid unit exponent '{exp}'"))?;
            (name.trim(), Rational::from_int(exp))
        }
        None => (text, Rational::ONE),
    };
    if name == "1" {
        return Ok(Unit::dimensionless());
    }
    let unit = resolve_symbol(name).or_else(|| {
        PREFIXES.iter().find_map(|(prefix, log10)| {
            name.strip_prefix(prefix)
                .and_then(resolve_symbol)
                .map(|unit| unit.scaled(*log10))
        })
    });
    match unit {
        Some(unit) => Ok(unit.pow(exponent)),
        None => Err(format!("Unknown unit '{name}'")),
    }
}

/// Frequently used units, for tests and programmatic model construction.
pub mod units {
    use super::{parse_unit, Unit};

    fn resolved(text: &str) -> Unit {
        parse_unit(text).expect("builtin unit")
    }

    pub fn second() -> Unit {
        resolved("s")
    }

    pub fn millisecond() -> Unit {
        resolved("ms")
    }

    pub fn metre() -> Unit {
        resolved("m")
    }

    pub fn volt() -> Unit {
        resolved("V")
    }

    pub fn millivolt() -> Unit {
        resolved("mV")
    }

    pub fn ampere() -> Unit {
        resolved("A")
    }

    pub fn picofarad() -> Unit {
        resolved("pF")
    }

    pub fn millisiemens() -> Unit {
        resolved("mS")
    }

    pub fn millimolar() -> Unit {
        resolved("mmol/L")
    }

    pub fn kelvin() -> Unit {
        resolved("K")
    }
}
