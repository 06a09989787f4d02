//! Scalar expressions of the host statement IR.
//!
//! Expressions are plain owned trees. The GPU emitter builds a lot of index
//! arithmetic by substitution, so [`Expr::simplify`] canonicalises the linear
//! part of an expression: sums are flattened into a [`LinearForm`] whose
//! non-linear sub-terms act as atoms.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

use itertools::Itertools;

use crate::aff::Interval;

/// Binary operators of the host IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    FloorMod,
    Min,
    Max,
    Lt,
    Le,
    Eq,
    And,
    Or,
}

impl BinOp {
    fn symbol(&self) -> Option<&'static str> {
        Some(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::And => "&&",
            Self::Or => "||",
            _ => return None,
        })
    }

    fn fold(&self, a: i64, b: i64) -> Option<i64> {
        Some(match self {
            Self::Add => a.checked_add(b)?,
            Self::Sub => a.checked_sub(b)?,
            Self::Mul => a.checked_mul(b)?,
            Self::FloorDiv if b != 0 => a.div_euclid(b) - i64::from(b < 0 && a.rem_euclid(b) != 0),
            Self::FloorMod if b != 0 => a - b * Self::FloorDiv.fold(a, b)?,
            Self::FloorDiv | Self::FloorMod => return None,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            Self::Lt => i64::from(a < b),
            Self::Le => i64::from(a <= b),
            Self::Eq => i64::from(a == b),
            Self::And => i64::from(a != 0 && b != 0),
            Self::Or => i64::from(a != 0 || b != 0),
        })
    }
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Int(i64),
    Var(String),
    Str(String),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Load { tensor: String, indices: Vec<Expr> },
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Self::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    pub fn load(tensor: impl Into<String>, indices: Vec<Expr>) -> Self {
        Self::Load { tensor: tensor.into(), indices }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call { name: name.into(), args }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn floor_div(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::FloorDiv, self, rhs.into())
    }

    pub fn floor_mod(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::FloorMod, self, rhs.into())
    }

    pub fn min(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::Min, self, rhs.into())
    }

    pub fn max(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::Max, self, rhs.into())
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::Lt, self, rhs.into())
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::Le, self, rhs.into())
    }

    pub fn eq_to(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::Eq, self, rhs.into())
    }

    pub fn and(self, rhs: impl Into<Expr>) -> Self {
        Self::binary(BinOp::And, self, rhs.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Self::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Conjunction of `conds`, `None` when empty.
    pub fn all(conds: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        conds.into_iter().reduce(Expr::and)
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Rebuilds the expression bottom-up, giving `f` the chance to replace each node.
    pub fn transform(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        let rebuilt = match self {
            Self::Binary { op, lhs, rhs } => Self::binary(*op, lhs.transform(f), rhs.transform(f)),
            Self::Load { tensor, indices } => {
                Self::Load { tensor: tensor.clone(), indices: indices.iter().map(|i| i.transform(f)).collect() }
            }
            Self::Call { name, args } => {
                Self::Call { name: name.clone(), args: args.iter().map(|a| a.transform(f)).collect() }
            }
            leaf => leaf.clone(),
        };
        f(&rebuilt).unwrap_or(rebuilt)
    }

    /// Replaces variables for which `lookup` returns an expression.
    pub fn substitute(&self, lookup: &impl Fn(&str) -> Option<Expr>) -> Expr {
        self.transform(&mut |e| match e {
            Self::Var(name) => lookup(name),
            _ => None,
        })
    }

    pub fn substitute_map(&self, map: &BTreeMap<String, Expr>) -> Expr {
        if map.is_empty() {
            return self.clone();
        }
        self.substitute(&|name| map.get(name).cloned())
    }

    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Self::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Self::Load { indices: args, .. } | Self::Call { args, .. } => args.iter().for_each(|a| a.visit(f)),
            _ => {}
        }
    }

    pub fn free_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.visit(&mut |e| {
            if let Self::Var(name) = e
                && !vars.contains(name)
            {
                vars.push(name.clone());
            }
        });
        vars
    }

    // =========================================================================
    // Simplification
    // =========================================================================

    pub fn simplify(&self) -> Expr {
        match self {
            Self::Binary { op, lhs, rhs } => simplify_binary(*op, lhs.simplify(), rhs.simplify()),
            Self::Load { tensor, indices } => {
                Self::Load { tensor: tensor.clone(), indices: indices.iter().map(Expr::simplify).collect() }
            }
            Self::Call { name, args } => Self::Call { name: name.clone(), args: args.iter().map(Expr::simplify).collect() },
            leaf => leaf.clone(),
        }
    }

    /// Linear view of the expression; non-linear sub-terms become atoms.
    pub fn linear_form(&self) -> LinearForm {
        match self {
            Self::Int(v) => LinearForm::constant(*v),
            Self::Binary { op: BinOp::Add, lhs, rhs } => lhs.linear_form().plus(&rhs.linear_form(), 1),
            Self::Binary { op: BinOp::Sub, lhs, rhs } => lhs.linear_form().plus(&rhs.linear_form(), -1),
            Self::Binary { op: BinOp::Mul, lhs, rhs } => {
                let (l, r) = (lhs.linear_form(), rhs.linear_form());
                match (l.as_constant(), r.as_constant()) {
                    (Some(k), _) => r.scaled(k),
                    (_, Some(k)) => l.scaled(k),
                    _ => LinearForm::atom(self.clone()),
                }
            }
            other => LinearForm::atom(other.clone()),
        }
    }

    /// Interval of the expression given bounds of its variables.
    pub fn bounds(&self, var_bounds: &impl Fn(&str) -> Option<Interval>) -> Option<Interval> {
        match self {
            Self::Int(v) => Some(Interval::point(*v)),
            Self::Var(name) => var_bounds(name),
            Self::Binary { op, lhs, rhs } => {
                let l = lhs.bounds(var_bounds)?;
                let r = rhs.bounds(var_bounds)?;
                match op {
                    BinOp::Add => Some(Interval::new(l.lo + r.lo, l.hi + r.hi)),
                    BinOp::Sub => Some(Interval::new(l.lo - r.hi, l.hi - r.lo)),
                    BinOp::Mul => {
                        let corners = [l.lo * r.lo, l.lo * r.hi, l.hi * r.lo, l.hi * r.hi];
                        Some(Interval::new(*corners.iter().min()?, *corners.iter().max()?))
                    }
                    BinOp::FloorDiv if r.lo == r.hi && r.lo > 0 => {
                        Some(Interval::new(l.lo.div_euclid(r.lo), l.hi.div_euclid(r.lo)))
                    }
                    BinOp::FloorMod if r.lo == r.hi && r.lo > 0 => {
                        let m = r.lo;
                        if l.lo.div_euclid(m) == l.hi.div_euclid(m) {
                            Some(Interval::new(l.lo.rem_euclid(m), l.hi.rem_euclid(m)))
                        } else {
                            Some(Interval::new(0, m - 1))
                        }
                    }
                    BinOp::Min => Some(Interval::new(l.lo.min(r.lo), l.hi.min(r.hi))),
                    BinOp::Max => Some(Interval::new(l.lo.max(r.lo), l.hi.max(r.hi))),
                    _ => Some(Interval::new(0, 1)),
                }
            }
            _ => None,
        }
    }
}

fn simplify_binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int())
        && let Some(v) = op.fold(a, b)
    {
        return Expr::Int(v);
    }

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => {
            let linear = Expr::binary(op, lhs.clone(), rhs.clone()).linear_form();
            // A product of two non-constant terms stays as it is.
            if op == BinOp::Mul && linear.terms.len() == 1 && linear.terms.keys().next().is_some_and(is_product) {
                return Expr::binary(op, lhs, rhs);
            }
            linear.to_expr()
        }
        BinOp::FloorDiv => match rhs.as_int() {
            Some(1) => lhs,
            Some(d) if d > 1 => {
                if let Expr::Binary { op: BinOp::FloorDiv, lhs: inner, rhs: inner_d } = &lhs
                    && let Some(d0) = inner_d.as_int()
                    && d0 > 0
                {
                    return simplify_binary(BinOp::FloorDiv, (**inner).clone(), Expr::Int(d0 * d));
                }
                let linear = lhs.linear_form();
                if linear.terms.values().all(|c| c % d == 0) {
                    // floor((d*x + k) / d) = x + floor(k / d)
                    let scaled = LinearForm {
                        terms: linear.terms.iter().map(|(a, c)| (a.clone(), c / d)).collect(),
                        constant: linear.constant.div_euclid(d),
                    };
                    return scaled.to_expr();
                }
                Expr::binary(op, lhs, rhs)
            }
            _ => Expr::binary(op, lhs, rhs),
        },
        BinOp::FloorMod => match rhs.as_int() {
            Some(1) => Expr::Int(0),
            Some(m) if m > 1 => {
                let mut linear = lhs.linear_form();
                linear.terms.retain(|_, c| *c % m != 0);
                linear.constant = linear.constant.rem_euclid(m);
                if linear.terms.is_empty() {
                    return Expr::Int(linear.constant);
                }
                Expr::binary(op, linear.to_expr(), rhs)
            }
            _ => Expr::binary(op, lhs, rhs),
        },
        BinOp::And => match (lhs.as_int(), rhs.as_int()) {
            (Some(0), _) | (_, Some(0)) => Expr::Int(0),
            (Some(_), _) => rhs,
            (_, Some(_)) => lhs,
            _ => Expr::binary(op, lhs, rhs),
        },
        BinOp::Lt | BinOp::Le | BinOp::Eq => {
            // Compare the difference against zero when it folds to a constant.
            let diff = lhs.linear_form().plus(&rhs.linear_form(), -1);
            match diff.as_constant() {
                Some(d) => Expr::Int(op.fold(d, 0).unwrap_or_default()),
                None => Expr::binary(op, lhs, rhs),
            }
        }
        _ => Expr::binary(op, lhs, rhs),
    }
}

fn is_product(e: &Expr) -> bool {
    matches!(e, Expr::Binary { op: BinOp::Mul, .. })
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Self::Var(name.to_string())
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl Add<i64> for Expr {
    type Output = Expr;
    fn add(self, rhs: i64) -> Expr {
        Expr::binary(BinOp::Add, self, Expr::Int(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl Sub<i64> for Expr {
    type Output = Expr;
    fn sub(self, rhs: i64) -> Expr {
        Expr::binary(BinOp::Sub, self, Expr::Int(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl Mul<i64> for Expr {
    type Output = Expr;
    fn mul(self, rhs: i64) -> Expr {
        Expr::binary(BinOp::Mul, self, Expr::Int(rhs))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Var(name) => write!(f, "{name}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Binary { op, lhs, rhs } => match op.symbol() {
                Some(sym) => write!(f, "({lhs} {sym} {rhs})"),
                None => write!(f, "{}({lhs}, {rhs})", op.to_string().to_lowercase()),
            },
            Self::Load { tensor, indices } => write!(f, "{tensor}[{}]", indices.iter().join(", ")),
            Self::Call { name, args } => write!(f, "{name}({})", args.iter().join(", ")),
        }
    }
}

// ============================================================================
// LINEAR FORM
// ============================================================================

/// `Σ coeff·atom + constant` where atoms are arbitrary non-linear expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearForm {
    pub terms: BTreeMap<Expr, i64>,
    pub constant: i64,
}

impl LinearForm {
    pub fn constant(value: i64) -> Self {
        Self { terms: BTreeMap::new(), constant: value }
    }

    pub fn atom(expr: Expr) -> Self {
        Self { terms: BTreeMap::from([(expr, 1)]), constant: 0 }
    }

    pub fn as_constant(&self) -> Option<i64> {
        self.terms.is_empty().then_some(self.constant)
    }

    /// `self + factor * other`.
    pub fn plus(&self, other: &LinearForm, factor: i64) -> LinearForm {
        let mut out = self.clone();
        for (atom, coeff) in &other.terms {
            *out.terms.entry(atom.clone()).or_default() += coeff * factor;
        }
        out.terms.retain(|_, c| *c != 0);
        out.constant += other.constant * factor;
        out
    }

    pub fn scaled(&self, factor: i64) -> LinearForm {
        LinearForm::default().plus(self, factor)
    }

    pub fn to_expr(&self) -> Expr {
        let mut acc: Option<Expr> = None;
        // Positive terms first so the result reads as `a + b - c`.
        let ordered = self.terms.iter().sorted_by_key(|(_, c)| **c < 0);
        for (atom, &coeff) in ordered {
            let magnitude = coeff.abs();
            let term = if magnitude == 1 { atom.clone() } else { Expr::binary(BinOp::Mul, atom.clone(), magnitude.into()) };
            acc = Some(match acc {
                None if coeff < 0 => Expr::binary(BinOp::Sub, Expr::Int(0), term),
                None => term,
                Some(prev) if coeff < 0 => Expr::binary(BinOp::Sub, prev, term),
                Some(prev) => Expr::binary(BinOp::Add, prev, term),
            });
        }
        match acc {
            None => Expr::Int(self.constant),
            Some(e) if self.constant > 0 => Expr::binary(BinOp::Add, e, self.constant.into()),
            Some(e) if self.constant < 0 => Expr::binary(BinOp::Sub, e, (-self.constant).into()),
            Some(e) => e,
        }
    }
}
