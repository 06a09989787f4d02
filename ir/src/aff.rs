//! Affine model of statement domains and band schedules.
//!
//! Statement domains are boxes of iterators. Band members are quasi-affine
//! functions `floor(aff / div) mod modulo` of the iterators, which is exactly
//! the closure of affine schedules under tiling. Inversion recovers iterator
//! values from the values of the schedule dimensions by mixed-radix
//! reconstruction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Mul, Sub};

use snafu::ensure;

use crate::error::*;
use crate::expr::{BinOp, Expr};

/// Inclusive integer interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    pub fn point(v: i64) -> Self {
        Self { lo: v, hi: v }
    }

    pub fn size(&self) -> i64 {
        self.hi - self.lo + 1
    }

    pub fn hull(&self, other: &Interval) -> Interval {
        Interval::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }
}

/// Iterator of a rectangular statement domain: `lo <= name < lo + extent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iter {
    pub name: String,
    pub lo: i64,
    pub extent: i64,
}

impl Iter {
    pub fn new(name: impl Into<String>, extent: i64) -> Self {
        Self { name: name.into(), lo: 0, extent }
    }

    pub fn with_lo(name: impl Into<String>, lo: i64, extent: i64) -> Self {
        Self { name: name.into(), lo, extent }
    }

    pub fn hi(&self) -> i64 {
        self.lo + self.extent - 1
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.lo, self.hi())
    }
}

fn lookup<'a>(domain: &'a [Iter], name: &str) -> Option<&'a Iter> {
    domain.iter().find(|it| it.name == name)
}

// ============================================================================
// AFFINE EXPRESSIONS
// ============================================================================

/// `Σ coeff·var + constant`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffExpr {
    terms: BTreeMap<String, i64>,
    constant: i64,
}

impl AffExpr {
    pub fn constant(value: i64) -> Self {
        Self { terms: BTreeMap::new(), constant: value }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::term(name, 1)
    }

    pub fn term(name: impl Into<String>, coeff: i64) -> Self {
        let mut terms = BTreeMap::new();
        if coeff != 0 {
            terms.insert(name.into(), coeff);
        }
        Self { terms, constant: 0 }
    }

    pub fn coeff(&self, name: &str) -> i64 {
        self.terms.get(name).copied().unwrap_or(0)
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, i64)> {
        self.terms.iter().map(|(n, c)| (n.as_str(), *c))
    }

    pub fn constant_term(&self) -> i64 {
        self.constant
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn vars(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(String::as_str)
    }

    pub fn eval(&self, env: &impl Fn(&str) -> Option<i64>) -> Option<i64> {
        self.terms.iter().try_fold(self.constant, |acc, (name, coeff)| Some(acc + coeff * env(name)?))
    }

    /// Range over a box domain; `None` when a variable is not a domain iterator.
    pub fn range(&self, domain: &[Iter]) -> Option<Interval> {
        let mut out = Interval::point(self.constant);
        for (name, &coeff) in &self.terms {
            let it = lookup(domain, name)?;
            let (a, b) = (coeff * it.lo, coeff * it.hi());
            out.lo += a.min(b);
            out.hi += a.max(b);
        }
        Some(out)
    }

    /// Substitutes each variable by an affine expression.
    pub fn compose(&self, subst: &impl Fn(&str) -> Option<AffExpr>) -> Option<AffExpr> {
        self.terms.iter().try_fold(AffExpr::constant(self.constant), |acc, (name, coeff)| {
            Some(acc + subst(name)? * *coeff)
        })
    }

    pub fn to_expr(&self) -> Expr {
        let mut form = crate::expr::LinearForm::constant(self.constant);
        for (name, coeff) in &self.terms {
            form.terms.insert(Expr::var(name.clone()), *coeff);
        }
        form.to_expr()
    }

    /// Affine view of an index expression.
    pub fn try_from_expr(expr: &Expr) -> Option<AffExpr> {
        match expr {
            Expr::Int(v) => Some(AffExpr::constant(*v)),
            Expr::Var(name) => Some(AffExpr::var(name.clone())),
            Expr::Binary { op: BinOp::Add, lhs, rhs } => Some(Self::try_from_expr(lhs)? + Self::try_from_expr(rhs)?),
            Expr::Binary { op: BinOp::Sub, lhs, rhs } => Some(Self::try_from_expr(lhs)? - Self::try_from_expr(rhs)?),
            Expr::Binary { op: BinOp::Mul, lhs, rhs } => {
                let (l, r) = (Self::try_from_expr(lhs)?, Self::try_from_expr(rhs)?);
                match (l.is_constant(), r.is_constant()) {
                    (true, _) => Some(r * l.constant),
                    (_, true) => Some(l * r.constant),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl Add for AffExpr {
    type Output = AffExpr;
    fn add(mut self, rhs: AffExpr) -> AffExpr {
        for (name, coeff) in rhs.terms {
            *self.terms.entry(name).or_default() += coeff;
        }
        self.terms.retain(|_, c| *c != 0);
        self.constant += rhs.constant;
        self
    }
}

impl Add<i64> for AffExpr {
    type Output = AffExpr;
    fn add(mut self, rhs: i64) -> AffExpr {
        self.constant += rhs;
        self
    }
}

impl Sub for AffExpr {
    type Output = AffExpr;
    fn sub(self, rhs: AffExpr) -> AffExpr {
        self + rhs * -1
    }
}

impl Mul<i64> for AffExpr {
    type Output = AffExpr;
    fn mul(mut self, rhs: i64) -> AffExpr {
        if rhs == 0 {
            return AffExpr::constant(0);
        }
        self.terms.values_mut().for_each(|c| *c *= rhs);
        self.constant *= rhs;
        self
    }
}

impl fmt::Display for AffExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expr())
    }
}

// ============================================================================
// QUASI-AFFINE BAND MEMBERS
// ============================================================================

/// `floor(aff / div) mod modulo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuasiAff {
    pub aff: AffExpr,
    pub div: i64,
    pub modulo: Option<i64>,
}

impl QuasiAff {
    pub fn new(aff: AffExpr) -> Self {
        Self { aff, div: 1, modulo: None }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::new(AffExpr::var(name))
    }

    pub fn constant(value: i64) -> Self {
        Self::new(AffExpr::constant(value))
    }

    pub fn is_constant(&self) -> bool {
        self.aff.is_constant()
    }

    pub fn eval(&self, env: &impl Fn(&str) -> Option<i64>) -> Option<i64> {
        let q = self.aff.eval(env)?.div_euclid(self.div);
        Some(self.modulo.map_or(q, |m| q.rem_euclid(m)))
    }

    pub fn range(&self, domain: &[Iter]) -> Option<Interval> {
        let a = self.aff.range(domain)?;
        let q = Interval::new(a.lo.div_euclid(self.div), a.hi.div_euclid(self.div));
        Some(match self.modulo {
            Some(m) if q.lo.div_euclid(m) == q.hi.div_euclid(m) => Interval::new(q.lo.rem_euclid(m), q.hi.rem_euclid(m)),
            Some(m) => Interval::new(0, m - 1),
            None => q,
        })
    }

    /// Splits the member into a tile member and a point member of size `size`.
    pub fn tile(&self, member: usize, size: i64) -> Result<(QuasiAff, QuasiAff)> {
        ensure!(size > 0, InvalidTileSizeSnafu { member, size });
        if let Some(m) = self.modulo {
            ensure!(m % size == 0, TileNotDivisibleSnafu { member, size, modulo: m });
        }
        let outer = QuasiAff { aff: self.aff.clone(), div: self.div * size, modulo: self.modulo.map(|m| m / size) };
        let inner = QuasiAff { aff: self.aff.clone(), div: self.div, modulo: Some(size) };
        Ok((outer, inner))
    }

    pub fn to_expr(&self) -> Expr {
        let q = self.aff.to_expr().floor_div(self.div);
        match self.modulo {
            Some(m) => q.floor_mod(m),
            None => q,
        }
        .simplify()
    }

    /// Iterator moved, and by how much, when this member advances by one.
    pub fn unit_step(&self, domain: &[Iter]) -> Option<(String, i64)> {
        let vars = radix_order(&self.aff, domain)?;
        let (name, coeff) = vars.iter().rev().find(|(_, c)| c.abs() <= self.div && self.div % c.abs() == 0)?;
        Some((name.clone(), self.div / coeff))
    }
}

impl fmt::Display for QuasiAff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expr())
    }
}

/// Variables of `aff` sorted by coefficient magnitude, validated as a mixed radix.
///
/// Each coefficient must divide the next one and leave room for the full
/// extent of the previous variable, so the variables can be recovered with
/// nested div/mod.
fn radix_order(aff: &AffExpr, domain: &[Iter]) -> Option<Vec<(String, i64)>> {
    let mut vars: Vec<(String, i64)> = aff.terms().map(|(n, c)| (n.to_string(), c)).collect();
    vars.sort_by_key(|(_, c)| c.abs());
    if vars.len() > 1 {
        if vars.iter().any(|(_, c)| *c < 0) {
            return None;
        }
        for pair in vars.windows(2) {
            let extent = lookup(domain, &pair[0].0)?.extent;
            if pair[1].1 % pair[0].1 != 0 || pair[1].1 < pair[0].1 * extent {
                return None;
            }
        }
    }
    Some(vars)
}

// ============================================================================
// INVERSION
// ============================================================================

/// Chain of `(div, value)` pieces of one affine expression, largest div first.
struct Chain {
    pieces: Vec<(i64, Expr)>,
    /// Smallest div reached by the chain; the aff is known up to `[0, tail)`.
    tail: i64,
}

/// Groups schedule dimensions by aff and keeps, per aff, the contiguous chain
/// that starts at an unbounded (modulo-free) piece.
fn chains(dims: &[(QuasiAff, Expr)]) -> BTreeMap<AffExpr, Chain> {
    let mut groups: BTreeMap<AffExpr, Vec<(i64, Option<i64>, Expr)>> = BTreeMap::new();
    for (q, value) in dims {
        if !q.is_constant() {
            groups.entry(q.aff.clone()).or_default().push((q.div, q.modulo, value.clone()));
        }
    }

    let mut out = BTreeMap::new();
    for (aff, mut pieces) in groups {
        pieces.sort_by_key(|(div, _, _)| std::cmp::Reverse(*div));
        let Some((first_div, None, first)) = pieces.first().cloned() else {
            continue;
        };
        let mut chain = Chain { pieces: vec![(first_div, first)], tail: first_div };
        for (div, modulo, value) in pieces.into_iter().skip(1) {
            match modulo {
                Some(m) if div * m == chain.tail => {
                    chain.pieces.push((div, value));
                    chain.tail = div;
                }
                _ => break,
            }
        }
        out.insert(aff, chain);
    }
    out
}

fn chain_value(chain: &Chain) -> Expr {
    chain.pieces.iter().map(|(div, value)| value.clone() * *div).reduce(|a, b| a + b).unwrap_or(Expr::Int(0))
}

/// Recovers each domain iterator from the values of the schedule dimensions.
///
/// `dims` lists, outermost first, the member schedule of the statement at each
/// schedule depth together with the expression holding that depth's value.
pub fn invert(stmt: &str, domain: &[Iter], dims: &[(QuasiAff, Expr)]) -> Result<BTreeMap<String, Expr>> {
    let not_invertible = |reason: String| NotInvertibleSnafu { stmt: stmt.to_string(), reason }.build();
    let mut out = BTreeMap::new();

    for (aff, chain) in chains(dims) {
        ensure!(chain.tail == 1, NotInvertibleSnafu { stmt, reason: format!("'{aff}' is only scheduled down to {}", chain.tail) });
        let radix = radix_order(&aff, domain).ok_or_else(|| not_invertible(format!("'{aff}' is not a mixed radix")))?;
        let value = chain_value(&chain);

        if let [(name, coeff)] = radix.as_slice() {
            let v = match coeff {
                1 => value - aff.constant_term(),
                -1 => Expr::Int(aff.constant_term()) - value,
                c => (value - aff.constant_term()).floor_div(*c),
            };
            ensure!(out.insert(name.clone(), v.simplify()).is_none(), NotInvertibleSnafu { stmt, reason: format!("'{name}' is scheduled twice") });
            continue;
        }

        let base: i64 = aff.constant_term() + radix.iter().map(|(n, c)| c * lookup(domain, n).map_or(0, |it| it.lo)).sum::<i64>();
        let rest = value - base;
        for (k, (name, coeff)) in radix.iter().enumerate() {
            let lo = lookup(domain, name).map_or(0, |it| it.lo);
            let digit = rest.clone().floor_div(*coeff);
            let digit = match radix.get(k + 1) {
                Some((_, next)) => digit.floor_mod(next / coeff),
                None => digit,
            };
            ensure!(out.insert(name.clone(), (digit + lo).simplify()).is_none(), NotInvertibleSnafu { stmt, reason: format!("'{name}' is scheduled twice") });
        }
    }

    for it in domain {
        if !out.contains_key(&it.name) {
            ensure!(it.extent == 1, NotInvertibleSnafu { stmt, reason: format!("'{}' is never scheduled", it.name) });
            out.insert(it.name.clone(), Expr::Int(it.lo));
        }
    }
    Ok(out)
}

/// Box of iterator values left open once the given outer dimensions are fixed.
///
/// Returns, per iterator, an offset expression over the dimension values and
/// a constant extent. Iterators no outer dimension constrains span their whole
/// domain.
pub fn prefix_ranges(domain: &[Iter], dims: &[(QuasiAff, Expr)]) -> BTreeMap<String, (Expr, i64)> {
    let mut out: BTreeMap<String, (Expr, i64)> = BTreeMap::new();
    let mut constrained = BTreeSet::new();

    for (aff, chain) in chains(dims) {
        let Some(radix) = radix_order(&aff, domain) else {
            continue;
        };
        let value = chain_value(&chain);
        let tail = chain.tail;

        if let [(name, coeff)] = radix.as_slice() {
            let Some(it) = lookup(domain, name) else { continue };
            let range = match coeff {
                1 => (value - aff.constant_term(), tail.min(it.extent)),
                -1 => (Expr::Int(aff.constant_term() - (tail - 1)) - value, tail.min(it.extent)),
                _ => continue,
            };
            constrained.insert(name.clone());
            out.insert(name.clone(), (range.0.simplify(), range.1));
            continue;
        }

        let base: i64 = aff.constant_term() + radix.iter().map(|(n, c)| c * lookup(domain, n).map_or(0, |it| it.lo)).sum::<i64>();
        let rest = value - base;
        for (k, (name, coeff)) in radix.iter().enumerate() {
            let Some(it) = lookup(domain, name) else { continue };
            let next = radix.get(k + 1).map(|(_, c)| *c);
            let digit = |e: Expr| match next {
                Some(n) => e.floor_div(*coeff).floor_mod(n / coeff),
                None => e.floor_div(*coeff),
            };
            let range = if tail <= *coeff && coeff % tail == 0 {
                (digit(rest.clone()) + it.lo, 1)
            } else if next.is_some_and(|n| tail >= n) || tail % coeff != 0 {
                (Expr::Int(it.lo), it.extent)
            } else {
                (digit(rest.clone()) + it.lo, (tail / coeff).min(it.extent))
            };
            constrained.insert(name.clone());
            out.insert(name.clone(), (range.0.simplify(), range.1));
        }
    }

    for it in domain {
        if !constrained.contains(&it.name) {
            out.insert(it.name.clone(), (Expr::Int(it.lo), it.extent));
        }
    }
    out
}
