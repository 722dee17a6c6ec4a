//! Quasi-affine expressions and piecewise functions over statement instances.
//!
//! An [`AffExpr`] is built from iteration coordinates, integer constants,
//! sums, integer scaling, floor division and modulo by positive constants.
//! A [`UnionPwAff`] attaches one expression to each statement (optionally
//! restricted to a subset of its instances), and a [`MultiUnionPwAff`]
//! stacks several of them into a vector-valued projection, the shape of a
//! band's partial schedule or of a thread-coordinate mapping.

use crate::error::{PolyError, PolyResult};
use crate::parse::{self, Params};
use crate::set::{Instance, UnionSet};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AffExpr {
    Const(i64),
    /// Iteration coordinate by position
    Dim(usize),
    Add(Box<AffExpr>, Box<AffExpr>),
    Scale(i64, Box<AffExpr>),
    /// `floor(e / d)` with `d > 0`
    FloorDiv(Box<AffExpr>, i64),
    /// `e mod m` with `m > 0`, always non-negative
    Mod(Box<AffExpr>, i64),
}

impl AffExpr {
    pub fn constant(value: i64) -> Self {
        AffExpr::Const(value)
    }

    pub fn dim(pos: usize) -> Self {
        AffExpr::Dim(pos)
    }

    pub fn add(self, other: AffExpr) -> Self {
        match (self, other) {
            (AffExpr::Const(a), AffExpr::Const(b)) => AffExpr::Const(a + b),
            (AffExpr::Const(0), e) | (e, AffExpr::Const(0)) => e,
            (a, b) => AffExpr::Add(Box::new(a), Box::new(b)),
        }
    }

    pub fn scale(self, factor: i64) -> Self {
        match (factor, self) {
            (0, _) => AffExpr::Const(0),
            (1, e) => e,
            (f, AffExpr::Const(c)) => AffExpr::Const(f * c),
            (f, e) => AffExpr::Scale(f, Box::new(e)),
        }
    }

    pub fn floor_div(self, divisor: i64) -> Self {
        debug_assert!(divisor > 0);
        match (divisor, self) {
            (1, e) => e,
            (d, AffExpr::Const(c)) => AffExpr::Const(c.div_euclid(d)),
            (d, e) => AffExpr::FloorDiv(Box::new(e), d),
        }
    }

    pub fn modulo(self, modulus: i64) -> Self {
        debug_assert!(modulus > 0);
        match (modulus, self) {
            (1, _) => AffExpr::Const(0),
            (m, AffExpr::Const(c)) => AffExpr::Const(c.rem_euclid(m)),
            (m, e) => AffExpr::Mod(Box::new(e), m),
        }
    }

    /// Evaluate at an iteration point; `None` if a coordinate is missing.
    pub fn eval(&self, point: &[i64]) -> Option<i64> {
        Some(match self {
            AffExpr::Const(c) => *c,
            AffExpr::Dim(pos) => *point.get(*pos)?,
            AffExpr::Add(a, b) => a.eval(point)? + b.eval(point)?,
            AffExpr::Scale(f, e) => f * e.eval(point)?,
            AffExpr::FloorDiv(e, d) => e.eval(point)?.div_euclid(*d),
            AffExpr::Mod(e, m) => e.eval(point)?.rem_euclid(*m),
        })
    }

    /// Replace every `Dim(k)` by `args[k]`.
    pub fn substitute(&self, args: &[AffExpr]) -> AffExpr {
        match self {
            AffExpr::Const(c) => AffExpr::Const(*c),
            AffExpr::Dim(pos) => args.get(*pos).cloned().unwrap_or(AffExpr::Dim(*pos)),
            AffExpr::Add(a, b) => a.substitute(args).add(b.substitute(args)),
            AffExpr::Scale(f, e) => e.substitute(args).scale(*f),
            AffExpr::FloorDiv(e, d) => e.substitute(args).floor_div(*d),
            AffExpr::Mod(e, m) => e.substitute(args).modulo(*m),
        }
    }

    /// Highest coordinate referenced, if any
    pub fn max_dim(&self) -> Option<usize> {
        match self {
            AffExpr::Const(_) => None,
            AffExpr::Dim(pos) => Some(*pos),
            AffExpr::Add(a, b) => match (a.max_dim(), b.max_dim()) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, y) => x.or(y),
            },
            AffExpr::Scale(_, e) | AffExpr::FloorDiv(e, _) | AffExpr::Mod(e, _) => e.max_dim(),
        }
    }

    pub fn is_constant(&self) -> bool {
        self.max_dim().is_none()
    }
}

impl fmt::Display for AffExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffExpr::Const(c) => write!(f, "{}", c),
            AffExpr::Dim(pos) => write!(f, "i{}", pos),
            AffExpr::Add(a, b) => write!(f, "{} + {}", a, b),
            AffExpr::Scale(c, e) => match e.as_ref() {
                AffExpr::Dim(_) => write!(f, "{}*{}", c, e),
                _ => write!(f, "{}*({})", c, e),
            },
            AffExpr::FloorDiv(e, d) => write!(f, "floor(({})/{})", e, d),
            AffExpr::Mod(e, m) => write!(f, "({}) mod {}", e, m),
        }
    }
}

/// One piece of a [`UnionPwAff`]: an expression over the coordinates of
/// `stmt`, defined on all its instances or only on `domain`.
#[derive(Clone, Debug, PartialEq)]
pub struct AffPiece {
    pub stmt: String,
    pub domain: Option<UnionSet>,
    pub expr: AffExpr,
}

impl AffPiece {
    pub fn covers(&self, instance: &Instance) -> bool {
        instance.name == self.stmt && self.domain.as_ref().map_or(true, |d| d.contains(instance))
    }
}

/// Piecewise quasi-affine function from statement instances to integers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnionPwAff {
    pieces: Vec<AffPiece>,
}

impl UnionPwAff {
    pub fn new(pieces: Vec<AffPiece>) -> Self {
        UnionPwAff { pieces }
    }

    /// Single unrestricted piece for `stmt`
    pub fn from_expr(stmt: impl Into<String>, expr: AffExpr) -> Self {
        UnionPwAff {
            pieces: vec![AffPiece {
                stmt: stmt.into(),
                domain: None,
                expr,
            }],
        }
    }

    pub fn read_from_str(text: &str) -> PolyResult<Self> {
        parse::read_union_pw_aff(text, &Params::new())
    }

    /// The constant `value` on exactly the instances of `domain`.
    pub fn constant_on(domain: &UnionSet, value: i64) -> Self {
        let pieces = domain
            .statement_names()
            .into_iter()
            .map(|stmt| AffPiece {
                stmt: stmt.to_string(),
                domain: Some(domain.filter_statement(stmt)),
                expr: AffExpr::Const(value),
            })
            .collect();
        UnionPwAff { pieces }
    }

    pub fn pieces(&self) -> &[AffPiece] {
        &self.pieces
    }

    pub fn push(&mut self, piece: AffPiece) {
        self.pieces.push(piece);
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Value at `instance`, taken from the first piece that covers it.
    pub fn eval(&self, instance: &Instance) -> Option<i64> {
        self.pieces
            .iter()
            .find(|p| p.covers(instance))
            .and_then(|p| p.expr.eval(&instance.point))
    }

    pub fn covers(&self, instance: &Instance) -> bool {
        self.pieces.iter().any(|p| p.covers(instance))
    }

    /// Restrict every piece to the instances of `set`; pieces left empty
    /// are dropped.
    pub fn intersect_domain(&self, set: &UnionSet) -> UnionPwAff {
        let pieces = self
            .pieces
            .iter()
            .filter_map(|p| {
                let restricted = set.filter(|i| p.covers(i));
                if restricted.is_empty() {
                    None
                } else {
                    Some(AffPiece {
                        stmt: p.stmt.clone(),
                        domain: Some(restricted),
                        expr: p.expr.clone(),
                    })
                }
            })
            .collect();
        UnionPwAff { pieces }
    }

    /// Apply `f` to the expression of every piece, keeping the domains.
    pub fn map_expr<F: Fn(&AffExpr) -> AffExpr>(&self, f: F) -> UnionPwAff {
        UnionPwAff {
            pieces: self
                .pieces
                .iter()
                .map(|p| AffPiece {
                    stmt: p.stmt.clone(),
                    domain: p.domain.clone(),
                    expr: f(&p.expr),
                })
                .collect(),
        }
    }

    pub fn modulo(&self, modulus: i64) -> PolyResult<UnionPwAff> {
        if modulus <= 0 {
            return Err(PolyError::NonPositive(modulus));
        }
        Ok(self.map_expr(|e| e.clone().modulo(modulus)))
    }

    pub fn scale(&self, factor: i64) -> UnionPwAff {
        self.map_expr(|e| e.clone().scale(factor))
    }

    /// `floor(self / divisor)`
    pub fn scale_down_floor(&self, divisor: i64) -> PolyResult<UnionPwAff> {
        if divisor <= 0 {
            return Err(PolyError::NonPositive(divisor));
        }
        Ok(self.map_expr(|e| e.clone().floor_div(divisor)))
    }

    /// Instances of `universe` on which the function is defined
    pub fn domain_within(&self, universe: &UnionSet) -> UnionSet {
        universe.filter(|i| self.covers(i))
    }

    /// Smallest and largest value over the covered part of `universe`
    pub fn value_range(&self, universe: &UnionSet) -> Option<(i64, i64)> {
        universe
            .iter()
            .filter_map(|i| self.eval(i))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

impl fmt::Display for UnionPwAff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, p) in self.pieces.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} -> [({})]", p.stmt, p.expr)?;
        }
        write!(f, " }}")
    }
}

/// Vector-valued piecewise quasi-affine function (`isl_multi_union_pw_aff`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultiUnionPwAff {
    members: Vec<UnionPwAff>,
}

impl MultiUnionPwAff {
    pub fn new(members: Vec<UnionPwAff>) -> Self {
        MultiUnionPwAff { members }
    }

    pub fn read_from_str(text: &str) -> PolyResult<Self> {
        parse::read_multi_union_pw_aff(text, &Params::new())
    }

    pub fn read_with_params(text: &str, params: &Params) -> PolyResult<Self> {
        parse::read_multi_union_pw_aff(text, params)
    }

    pub fn members(&self) -> &[UnionPwAff] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn get_at(&self, pos: usize) -> Option<&UnionPwAff> {
        self.members.get(pos)
    }

    pub fn push(&mut self, member: UnionPwAff) {
        self.members.push(member);
    }

    /// Vector value at `instance`; `None` unless every member is defined.
    pub fn eval(&self, instance: &Instance) -> Option<Vec<i64>> {
        self.members.iter().map(|m| m.eval(instance)).collect()
    }

    pub fn intersect_domain(&self, set: &UnionSet) -> MultiUnionPwAff {
        MultiUnionPwAff {
            members: self.members.iter().map(|m| m.intersect_domain(set)).collect(),
        }
    }

    /// Instances of `universe` on which every member is defined
    pub fn domain_within(&self, universe: &UnionSet) -> UnionSet {
        universe.filter(|i| self.members.iter().all(|m| m.covers(i)))
    }

    /// Combine two projections defined on (usually disjoint) parts of the
    /// domain. Where both are defined the pieces of `self` win. If the
    /// dimensions differ the shorter operand is padded with zero members.
    pub fn union_add(&self, other: &MultiUnionPwAff) -> MultiUnionPwAff {
        let size = self.size().max(other.size());
        let lhs = self.padded(size);
        let rhs = other.padded(size);
        let members = lhs
            .members
            .into_iter()
            .zip(rhs.members)
            .map(|(mut a, b)| {
                a.pieces.extend(b.pieces);
                a
            })
            .collect();
        MultiUnionPwAff { members }
    }

    fn padded(&self, size: usize) -> MultiUnionPwAff {
        let mut out = self.clone();
        let zero = match self.members.first() {
            Some(first) => first.map_expr(|_| AffExpr::Const(0)),
            None => UnionPwAff::default(),
        };
        while out.members.len() < size {
            out.members.push(zero.clone());
        }
        out
    }

    /// Compose with `ma`: the result maps an instance `x` to `ma(self(x))`.
    ///
    /// Every member must carry a piece with the same statement and domain
    /// as each piece of the first member.
    pub fn apply(&self, ma: &MultiAff) -> PolyResult<MultiUnionPwAff> {
        if ma.n_in() != self.size() {
            return Err(PolyError::DimensionMismatch {
                expected: ma.n_in(),
                found: self.size(),
            });
        }
        let mut members = vec![UnionPwAff::default(); ma.size()];
        let Some(first) = self.members.first() else {
            return Ok(MultiUnionPwAff { members });
        };

        for piece in first.pieces() {
            let mut args = Vec::with_capacity(self.size());
            for member in &self.members {
                let matching = member
                    .pieces()
                    .iter()
                    .find(|p| p.stmt == piece.stmt && p.domain == piece.domain)
                    .ok_or_else(|| PolyError::Unaligned(piece.stmt.clone()))?;
                args.push(matching.expr.clone());
            }
            for (out, expr) in members.iter_mut().zip(ma.exprs()) {
                out.push(AffPiece {
                    stmt: piece.stmt.clone(),
                    domain: piece.domain.clone(),
                    expr: expr.substitute(&args),
                });
            }
        }
        Ok(MultiUnionPwAff { members })
    }
}

impl fmt::Display for MultiUnionPwAff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "]")
    }
}

/// Quasi-affine function on an anonymous integer tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiAff {
    n_in: usize,
    exprs: Vec<AffExpr>,
}

impl MultiAff {
    pub fn new(n_in: usize, exprs: Vec<AffExpr>) -> Self {
        MultiAff { n_in, exprs }
    }

    pub fn identity(n: usize) -> Self {
        MultiAff {
            n_in: n,
            exprs: (0..n).map(AffExpr::Dim).collect(),
        }
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn size(&self) -> usize {
        self.exprs.len()
    }

    pub fn exprs(&self) -> &[AffExpr] {
        &self.exprs
    }

    pub fn get_aff(&self, pos: usize) -> Option<&AffExpr> {
        self.exprs.get(pos)
    }

    pub fn eval(&self, point: &[i64]) -> Option<Vec<i64>> {
        self.exprs.iter().map(|e| e.eval(point)).collect()
    }
}
