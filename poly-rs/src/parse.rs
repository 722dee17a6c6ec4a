//! Reader for the subset of ISL notation used by schedule trees and
//! dependence relations.
//!
//! Parameters are bound to integer values when text is read, so every set
//! that comes out of the reader is finite and explicit. Variables of a
//! standalone set need lower and upper bounds that can be evaluated from
//! parameters and earlier variables; sets and relations read *within* a
//! universe are instead resolved by filtering the universe's instances.

use crate::aff::{AffExpr, AffPiece, MultiUnionPwAff, UnionPwAff};
use crate::error::{PolyError, PolyResult};
use crate::map::UnionMap;
use crate::set::{Instance, UnionSet};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;

/// Parameter values, e.g. `N = 64`
pub type Params = BTreeMap<String, i64>;

/// Upper limit on the number of points visited while enumerating one part
pub const MAX_POINTS: usize = 1 << 20;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(
        r"^\s*(?:(?P<num>\d+)|(?P<ident>[A-Za-z_][A-Za-z0-9_']*)|(?P<sym><=|>=|->|[-+*/(){}\[\]:;,<>=]))"
    )
    .unwrap();
}

const KEYWORDS: &[&str] = &["and", "or", "mod", "floor", "exists"];

fn is_keyword(id: &str) -> bool {
    KEYWORDS.contains(&id)
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(i64),
    Ident(String),
    Sym(String),
}

#[derive(Clone, Debug)]
struct Token {
    pos: usize,
    tok: Tok,
}

fn tokenize(text: &str) -> PolyResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    while offset < text.len() {
        let rest = &text[offset..];
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        let caps = TOKEN.captures(rest).ok_or_else(|| PolyError::Parse {
            pos: offset + rest.len() - trimmed.len(),
            msg: format!(
                "unexpected character `{}`",
                trimmed.chars().next().unwrap_or(' ')
            ),
        })?;
        let end = caps.get(0).map_or(rest.len(), |m| m.end());

        let token = if let Some(m) = caps.name("num") {
            let value = m.as_str().parse::<i64>().map_err(|_| PolyError::Parse {
                pos: offset + m.start(),
                msg: format!("integer literal `{}` out of range", m.as_str()),
            })?;
            Token {
                pos: offset + m.start(),
                tok: Tok::Num(value),
            }
        } else if let Some(m) = caps.name("ident") {
            Token {
                pos: offset + m.start(),
                tok: Tok::Ident(m.as_str().to_string()),
            }
        } else if let Some(m) = caps.name("sym") {
            Token {
                pos: offset + m.start(),
                tok: Tok::Sym(m.as_str().to_string()),
            }
        } else {
            break;
        };
        tokens.push(token);
        offset += end;
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rel {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Rel {
    fn flip(self) -> Rel {
        match self {
            Rel::Lt => Rel::Gt,
            Rel::Le => Rel::Ge,
            Rel::Eq => Rel::Eq,
            Rel::Ge => Rel::Le,
            Rel::Gt => Rel::Lt,
        }
    }

    fn holds(self, a: i64, b: i64) -> bool {
        match self {
            Rel::Lt => a < b,
            Rel::Le => a <= b,
            Rel::Eq => a == b,
            Rel::Ge => a >= b,
            Rel::Gt => a > b,
        }
    }
}

/// `lhs op rhs` over the variables of one part
#[derive(Clone, Debug)]
struct Atom {
    lhs: AffExpr,
    op: Rel,
    rhs: AffExpr,
}

impl Atom {
    fn max_dim(&self) -> Option<usize> {
        match (self.lhs.max_dim(), self.rhs.max_dim()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// The atom as `Dim(k) op expr` with `expr` over earlier variables only.
    fn bound_on(&self, k: usize) -> Option<(Rel, &AffExpr)> {
        let earlier = |e: &AffExpr| e.max_dim().map_or(true, |d| d < k);
        if self.lhs == AffExpr::Dim(k) && earlier(&self.rhs) {
            Some((self.op, &self.rhs))
        } else if self.rhs == AffExpr::Dim(k) && earlier(&self.lhs) {
            Some((self.op.flip(), &self.lhs))
        } else {
            None
        }
    }

    fn holds(&self, point: &[i64]) -> bool {
        match (self.lhs.eval(point), self.rhs.eval(point)) {
            (Some(a), Some(b)) => self.op.holds(a, b),
            _ => false,
        }
    }
}

/// One `;`-separated part of a set or of a relation.
///
/// Every tuple position owns one variable; positions holding an expression
/// get an anonymous variable tied to it by an equality atom.
#[derive(Debug)]
struct Part {
    stmt: String,
    out_stmt: Option<String>,
    n_in: usize,
    vars: Vec<String>,
    atoms: Vec<Atom>,
}

impl Part {
    /// All atoms whose variables are assigned in `point` hold.
    fn satisfied(&self, point: &[i64]) -> bool {
        self.atoms
            .iter()
            .filter(|a| a.max_dim().map_or(true, |d| d < point.len()))
            .all(|a| a.holds(point))
    }

    fn bounds(&self, k: usize, point: &[i64]) -> PolyResult<(i64, i64)> {
        let mut lo: Option<i64> = None;
        let mut hi: Option<i64> = None;
        for atom in &self.atoms {
            let Some((op, expr)) = atom.bound_on(k) else {
                continue;
            };
            let Some(v) = expr.eval(point) else {
                continue;
            };
            let (l, h) = match op {
                Rel::Lt => (None, Some(v - 1)),
                Rel::Le => (None, Some(v)),
                Rel::Eq => (Some(v), Some(v)),
                Rel::Ge => (Some(v), None),
                Rel::Gt => (Some(v + 1), None),
            };
            if let Some(l) = l {
                lo = Some(lo.map_or(l, |x| x.max(l)));
            }
            if let Some(h) = h {
                hi = Some(hi.map_or(h, |x| x.min(h)));
            }
        }
        match (lo, hi) {
            (Some(lo), Some(hi)) => Ok((lo, hi)),
            _ => Err(PolyError::Unbounded {
                stmt: self.stmt.clone(),
                var: self.vars.get(k).cloned().unwrap_or_default(),
            }),
        }
    }

    fn enumerate(&self, out: &mut UnionSet) -> PolyResult<()> {
        let mut point = Vec::with_capacity(self.vars.len());
        let mut budget = MAX_POINTS;
        self.enumerate_from(&mut point, &mut budget, out)
    }

    fn enumerate_from(
        &self,
        point: &mut Vec<i64>,
        budget: &mut usize,
        out: &mut UnionSet,
    ) -> PolyResult<()> {
        let k = point.len();
        if k == self.vars.len() {
            out.insert(Instance::new(self.stmt.clone(), point.clone()));
            return Ok(());
        }
        let (lo, hi) = self.bounds(k, point)?;
        for v in lo..=hi {
            if *budget == 0 {
                return Err(PolyError::TooLarge {
                    stmt: self.stmt.clone(),
                    count: MAX_POINTS as i128,
                });
            }
            *budget -= 1;
            point.push(v);
            if self.satisfied(point) {
                self.enumerate_from(point, budget, out)?;
            }
            point.pop();
        }
        Ok(())
    }

    /// Output coordinates fixed by equalities over earlier variables
    fn determined_outputs(&self, src: &[i64]) -> Option<Vec<i64>> {
        let mut point = src.to_vec();
        for k in self.n_in..self.vars.len() {
            let value = self.atoms.iter().find_map(|a| match a.bound_on(k) {
                Some((Rel::Eq, expr)) => expr.eval(&point),
                _ => None,
            })?;
            point.push(value);
        }
        Some(point.split_off(self.n_in))
    }
}

struct Parser<'p> {
    tokens: Vec<Token>,
    cursor: usize,
    end: usize,
    params: &'p Params,
    vars: Vec<String>,
}

impl<'p> Parser<'p> {
    fn new(text: &str, params: &'p Params) -> PolyResult<Self> {
        Ok(Parser {
            tokens: tokenize(text)?,
            cursor: 0,
            end: text.len(),
            params,
            vars: Vec::new(),
        })
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.cursor + n).map(|t| &t.tok)
    }

    fn peek(&self) -> Option<&Tok> {
        self.peek_at(0)
    }

    fn pos(&self) -> usize {
        self.tokens.get(self.cursor).map_or(self.end, |t| t.pos)
    }

    fn next_tok(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.cursor).map(|t| t.tok.clone());
        if tok.is_some() {
            self.cursor += 1;
        }
        tok
    }

    fn error(&self, msg: impl Into<String>) -> PolyError {
        PolyError::Parse {
            pos: self.pos(),
            msg: msg.into(),
        }
    }

    fn is_sym(&self, s: &str) -> bool {
        matches!(self.peek(), Some(Tok::Sym(t)) if t == s)
    }

    fn eat_sym(&mut self, s: &str) -> bool {
        if self.is_sym(s) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, s: &str) -> PolyResult<()> {
        if self.eat_sym(s) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", s)))
        }
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(t)) if t == k) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> PolyResult<String> {
        let id = match self.peek() {
            Some(Tok::Ident(id)) if !is_keyword(id) => id.clone(),
            _ => return Err(self.error("expected an identifier")),
        };
        self.cursor += 1;
        Ok(id)
    }

    fn expect_end(&self) -> PolyResult<()> {
        if self.cursor == self.tokens.len() {
            Ok(())
        } else {
            Err(self.error("trailing input"))
        }
    }

    fn parse_positive_int(&mut self) -> PolyResult<i64> {
        let pos = self.pos();
        match self.next_tok() {
            Some(Tok::Num(n)) if n > 0 => Ok(n),
            Some(Tok::Ident(id)) => match self.params.get(&id) {
                Some(&n) if n > 0 => Ok(n),
                Some(&n) => Err(PolyError::NonPositive(n)),
                None => Err(PolyError::UnknownIdentifier(id)),
            },
            _ => Err(PolyError::Parse {
                pos,
                msg: "expected a positive integer".to_string(),
            }),
        }
    }

    /// `[N, M] ->` ahead of the cursor
    fn at_param_prefix(&self) -> bool {
        if !self.is_sym("[") {
            return false;
        }
        let mut n = 1;
        loop {
            match self.peek_at(n) {
                Some(Tok::Ident(_)) => n += 1,
                Some(Tok::Sym(s)) if s == "," => n += 1,
                Some(Tok::Sym(s)) if s == "]" => {
                    return matches!(self.peek_at(n + 1), Some(Tok::Sym(t)) if t == "->");
                }
                _ => return false,
            }
        }
    }

    fn parse_param_prefix(&mut self) -> PolyResult<()> {
        if !self.at_param_prefix() {
            return Ok(());
        }
        self.expect_sym("[")?;
        while !self.eat_sym("]") {
            let name = self.expect_ident()?;
            if !self.params.contains_key(&name) {
                return Err(PolyError::UnknownIdentifier(name));
            }
            self.eat_sym(",");
        }
        self.expect_sym("->")
    }

    fn resolve(&self, id: &str) -> PolyResult<AffExpr> {
        if let Some(k) = self.vars.iter().rposition(|v| v == id) {
            return Ok(AffExpr::Dim(k));
        }
        match self.params.get(id) {
            Some(&v) => Ok(AffExpr::Const(v)),
            None => Err(PolyError::UnknownIdentifier(id.to_string())),
        }
    }

    fn is_bound(&self, id: &str) -> bool {
        self.vars.iter().any(|v| v == id) || self.params.contains_key(id)
    }

    fn parse_expr(&mut self) -> PolyResult<AffExpr> {
        let mut acc = self.parse_term()?;
        loop {
            if self.eat_sym("+") {
                acc = acc.add(self.parse_term()?);
            } else if self.eat_sym("-") {
                acc = acc.add(self.parse_term()?.scale(-1));
            } else {
                return Ok(acc);
            }
        }
    }

    fn parse_term(&mut self) -> PolyResult<AffExpr> {
        let mut acc = self.parse_factor()?;
        loop {
            if self.eat_sym("*") {
                let rhs = self.parse_factor()?;
                acc = multiply(acc, rhs)?;
            } else if self.eat_keyword("mod") {
                let m = self.parse_positive_int()?;
                acc = acc.modulo(m);
            } else {
                return Ok(acc);
            }
        }
    }

    fn parse_factor(&mut self) -> PolyResult<AffExpr> {
        let pos = self.pos();
        match self.next_tok() {
            Some(Tok::Sym(s)) if s == "-" => Ok(self.parse_factor()?.scale(-1)),
            Some(Tok::Sym(s)) if s == "(" => {
                let e = self.parse_expr()?;
                self.expect_sym(")")?;
                Ok(e)
            }
            Some(Tok::Num(n)) => {
                // juxtaposition: `2i`, `2(i + j)`
                let juxtaposed = matches!(self.peek(), Some(Tok::Ident(id)) if !is_keyword(id))
                    || self.is_sym("(");
                if juxtaposed {
                    Ok(self.parse_factor()?.scale(n))
                } else {
                    Ok(AffExpr::Const(n))
                }
            }
            Some(Tok::Ident(id)) if id == "floor" => {
                self.expect_sym("(")?;
                let e = self.parse_expr()?;
                self.expect_sym("/")?;
                let d = self.parse_positive_int()?;
                self.expect_sym(")")?;
                Ok(e.floor_div(d))
            }
            Some(Tok::Ident(id)) if !is_keyword(&id) => self.resolve(&id),
            Some(tok) => Err(PolyError::Parse {
                pos,
                msg: format!("unexpected token {:?}", tok),
            }),
            None => Err(PolyError::Parse {
                pos,
                msg: "unexpected end of input".to_string(),
            }),
        }
    }

    /// `S0[e0, e1]`; each entry becomes a variable
    fn parse_tuple(&mut self, atoms: &mut Vec<Atom>) -> PolyResult<String> {
        let name = self.expect_ident()?;
        if !self.eat_sym("[") || self.eat_sym("]") {
            return Ok(name);
        }
        loop {
            let fresh = match (self.peek(), self.peek_at(1)) {
                (Some(Tok::Ident(id)), Some(Tok::Sym(s)))
                    if (s == "," || s == "]") && !is_keyword(id) && !self.is_bound(id) =>
                {
                    Some(id.clone())
                }
                _ => None,
            };
            match fresh {
                Some(id) => {
                    self.cursor += 1;
                    self.vars.push(id);
                }
                None => {
                    let expr = self.parse_expr()?;
                    let k = self.vars.len();
                    self.vars.push(format!("#{}", k));
                    atoms.push(Atom {
                        lhs: AffExpr::Dim(k),
                        op: Rel::Eq,
                        rhs: expr,
                    });
                }
            }
            if self.eat_sym(",") {
                continue;
            }
            self.expect_sym("]")?;
            return Ok(name);
        }
    }

    fn eat_relation(&mut self) -> Option<Rel> {
        let rel = match self.peek() {
            Some(Tok::Sym(s)) => match s.as_str() {
                "<" => Rel::Lt,
                "<=" => Rel::Le,
                "=" => Rel::Eq,
                ">=" => Rel::Ge,
                ">" => Rel::Gt,
                _ => return None,
            },
            _ => return None,
        };
        self.cursor += 1;
        Some(rel)
    }

    fn parse_expr_list(&mut self) -> PolyResult<Vec<AffExpr>> {
        let mut list = vec![self.parse_expr()?];
        while self.eat_sym(",") {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    /// `0 <= i, j < N and i <= j`
    fn parse_constraints(&mut self, atoms: &mut Vec<Atom>) -> PolyResult<()> {
        loop {
            let mut lhs = self.parse_expr_list()?;
            let mut chained = false;
            while let Some(op) = self.eat_relation() {
                let rhs = self.parse_expr_list()?;
                for l in &lhs {
                    for r in &rhs {
                        atoms.push(Atom {
                            lhs: l.clone(),
                            op,
                            rhs: r.clone(),
                        });
                    }
                }
                lhs = rhs;
                chained = true;
            }
            if !chained {
                return Err(self.error("expected a comparison"));
            }
            if !self.eat_keyword("and") {
                return Ok(());
            }
        }
    }

    fn parse_set_part(&mut self) -> PolyResult<Part> {
        self.vars.clear();
        let mut atoms = Vec::new();
        let stmt = self.parse_tuple(&mut atoms)?;
        if self.eat_sym(":") {
            self.parse_constraints(&mut atoms)?;
        }
        Ok(Part {
            stmt,
            out_stmt: None,
            n_in: self.vars.len(),
            vars: self.vars.clone(),
            atoms,
        })
    }

    fn parse_map_part(&mut self) -> PolyResult<Part> {
        self.vars.clear();
        let mut atoms = Vec::new();
        let stmt = self.parse_tuple(&mut atoms)?;
        let n_in = self.vars.len();
        self.expect_sym("->")?;
        let out_stmt = self.parse_tuple(&mut atoms)?;
        if self.eat_sym(":") {
            self.parse_constraints(&mut atoms)?;
        }
        Ok(Part {
            stmt,
            out_stmt: Some(out_stmt),
            n_in,
            vars: self.vars.clone(),
            atoms,
        })
    }

    /// `{ part; part }`
    fn parse_braced<F>(&mut self, mut part: F) -> PolyResult<Vec<Part>>
    where
        F: FnMut(&mut Self) -> PolyResult<Part>,
    {
        self.expect_sym("{")?;
        let mut parts = Vec::new();
        if self.eat_sym("}") {
            return Ok(parts);
        }
        loop {
            parts.push(part(self)?);
            if self.eat_sym(";") {
                continue;
            }
            self.expect_sym("}")?;
            return Ok(parts);
        }
    }

    /// `{ S0[i, j] -> [(i)] : i < 4; S1[k] -> [(k)] }`
    fn parse_upa(&mut self) -> PolyResult<UnionPwAff> {
        self.expect_sym("{")?;
        let mut upa = UnionPwAff::default();
        if self.eat_sym("}") {
            return Ok(upa);
        }
        loop {
            self.vars.clear();
            let mut atoms = Vec::new();
            let stmt = self.parse_tuple(&mut atoms)?;
            self.expect_sym("->")?;
            if matches!(self.peek(), Some(Tok::Ident(_))) {
                self.cursor += 1;
            }
            self.expect_sym("[")?;
            let expr = self.parse_expr()?;
            self.expect_sym("]")?;
            if self.eat_sym(":") {
                self.parse_constraints(&mut atoms)?;
            }
            let domain = if atoms.is_empty() {
                None
            } else {
                let part = Part {
                    stmt: stmt.clone(),
                    out_stmt: None,
                    n_in: self.vars.len(),
                    vars: self.vars.clone(),
                    atoms,
                };
                let mut set = UnionSet::empty();
                part.enumerate(&mut set)?;
                Some(set)
            };
            upa.push(AffPiece { stmt, domain, expr });
            if self.eat_sym(";") {
                continue;
            }
            self.expect_sym("}")?;
            return Ok(upa);
        }
    }
}

fn multiply(a: AffExpr, b: AffExpr) -> PolyResult<AffExpr> {
    if let Some(c) = a.is_constant().then(|| a.eval(&[])).flatten() {
        Ok(b.scale(c))
    } else if let Some(c) = b.is_constant().then(|| b.eval(&[])).flatten() {
        Ok(a.scale(c))
    } else {
        Err(PolyError::NonAffine(format!("({}) * ({})", a, b)))
    }
}

/// Read a set, enumerating each part from the bounds of its variables.
pub fn read_union_set(text: &str, params: &Params) -> PolyResult<UnionSet> {
    let mut parser = Parser::new(text, params)?;
    parser.parse_param_prefix()?;
    let parts = parser.parse_braced(Parser::parse_set_part)?;
    parser.expect_end()?;

    let mut set = UnionSet::empty();
    for part in &parts {
        part.enumerate(&mut set)?;
    }
    debug!("Read set with {} instances", set.card());
    Ok(set)
}

/// Read a set as the instances of `universe` that satisfy it.
pub fn read_union_set_within(
    text: &str,
    universe: &UnionSet,
    params: &Params,
) -> PolyResult<UnionSet> {
    let mut parser = Parser::new(text, params)?;
    parser.parse_param_prefix()?;
    let parts = parser.parse_braced(Parser::parse_set_part)?;
    parser.expect_end()?;

    Ok(universe.filter(|inst| {
        parts.iter().any(|p| {
            p.stmt == inst.name && p.vars.len() == inst.arity() && p.satisfied(&inst.point)
        })
    }))
}

/// Read a relation whose source and destination lie in `universe`.
pub fn read_union_map_within(
    text: &str,
    universe: &UnionSet,
    params: &Params,
) -> PolyResult<UnionMap> {
    let mut parser = Parser::new(text, params)?;
    parser.parse_param_prefix()?;
    let parts = parser.parse_braced(Parser::parse_map_part)?;
    parser.expect_end()?;

    let mut map = UnionMap::empty();
    for part in &parts {
        let out_stmt = part.out_stmt.as_deref().unwrap_or_default();
        let n_out = part.vars.len() - part.n_in;
        for src in universe.iter() {
            if src.name != part.stmt || src.arity() != part.n_in || !part.satisfied(&src.point) {
                continue;
            }
            if let Some(dst_point) = part.determined_outputs(&src.point) {
                let mut full = src.point.clone();
                full.extend_from_slice(&dst_point);
                let dst = Instance::new(out_stmt, dst_point);
                if part.satisfied(&full) && universe.contains(&dst) {
                    map.insert(src.clone(), dst);
                }
                continue;
            }
            for dst in universe.iter() {
                if dst.name != out_stmt || dst.arity() != n_out {
                    continue;
                }
                let mut full = src.point.clone();
                full.extend_from_slice(&dst.point);
                if part.satisfied(&full) {
                    map.insert(src.clone(), dst.clone());
                }
            }
        }
    }
    debug!("Read relation with {} pairs", map.len());
    Ok(map)
}

/// Read `{ S0[i, j] -> [(i)]; ... }`.
pub fn read_union_pw_aff(text: &str, params: &Params) -> PolyResult<UnionPwAff> {
    let mut parser = Parser::new(text, params)?;
    parser.parse_param_prefix()?;
    let upa = parser.parse_upa()?;
    parser.expect_end()?;
    Ok(upa)
}

/// Read `[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]`.
///
/// A single braced function is accepted as a one-member projection.
pub fn read_multi_union_pw_aff(text: &str, params: &Params) -> PolyResult<MultiUnionPwAff> {
    let mut parser = Parser::new(text, params)?;
    parser.parse_param_prefix()?;
    let mut mupa = MultiUnionPwAff::default();
    if parser.is_sym("{") {
        mupa.push(parser.parse_upa()?);
    } else {
        parser.expect_sym("[")?;
        if !parser.eat_sym("]") {
            loop {
                mupa.push(parser.parse_upa()?);
                if parser.eat_sym(",") {
                    continue;
                }
                parser.expect_sym("]")?;
                break;
            }
        }
    }
    parser.expect_end()?;
    Ok(mupa)
}
