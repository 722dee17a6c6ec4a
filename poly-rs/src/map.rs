//! Explicit relations between statement instances.

use crate::aff::MultiUnionPwAff;
use crate::error::PolyResult;
use crate::parse::{self, Params};
use crate::set::{Instance, UnionSet};
use std::collections::BTreeSet;
use std::fmt;

/// A finite relation between statement instances (`isl_union_map`,
/// enumerated). Dependence relations are the main use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnionMap {
    pairs: BTreeSet<(Instance, Instance)>,
}

impl UnionMap {
    pub fn empty() -> Self {
        UnionMap::default()
    }

    /// Read a relation whose ends are resolved against `universe`.
    pub fn read_within(text: &str, universe: &UnionSet) -> PolyResult<Self> {
        parse::read_union_map_within(text, universe, &Params::new())
    }

    pub fn read_within_with_params(
        text: &str,
        universe: &UnionSet,
        params: &Params,
    ) -> PolyResult<Self> {
        parse::read_union_map_within(text, universe, params)
    }

    pub fn insert(&mut self, src: Instance, dst: Instance) -> bool {
        self.pairs.insert((src, dst))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Instance, Instance)> {
        self.pairs.iter()
    }

    /// Sources of the relation
    pub fn domain(&self) -> UnionSet {
        self.pairs.iter().map(|(s, _)| s.clone()).collect()
    }

    /// Destinations of the relation
    pub fn range(&self) -> UnionSet {
        self.pairs.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn intersect_domain(&self, set: &UnionSet) -> UnionMap {
        self.filter(|s, _| set.contains(s))
    }

    pub fn intersect_range(&self, set: &UnionSet) -> UnionMap {
        self.filter(|_, d| set.contains(d))
    }

    /// Keep the pairs whose both ends lie in the instantiated context.
    pub fn intersect_context(&self, context: &UnionSet) -> UnionMap {
        self.filter(|s, d| context.contains(s) && context.contains(d))
    }

    pub fn union(&self, other: &UnionMap) -> UnionMap {
        UnionMap {
            pairs: self.pairs.union(&other.pairs).cloned().collect(),
        }
    }

    pub fn is_subset(&self, other: &UnionMap) -> bool {
        self.pairs.is_subset(&other.pairs)
    }

    /// Pairs mapped to the same value by `proj`. Pairs with an end outside
    /// the projection's domain are dropped.
    pub fn eq_at(&self, proj: &MultiUnionPwAff) -> UnionMap {
        self.filter(|s, d| match (proj.eval(s), proj.eval(d)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }

    fn filter<F: Fn(&Instance, &Instance) -> bool>(&self, pred: F) -> UnionMap {
        UnionMap {
            pairs: self
                .pairs
                .iter()
                .filter(|(s, d)| pred(s, d))
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<(Instance, Instance)> for UnionMap {
    fn from_iter<I: IntoIterator<Item = (Instance, Instance)>>(iter: I) -> Self {
        UnionMap {
            pairs: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for UnionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, (s, d)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} -> {}", s, d)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aff::{AffExpr, UnionPwAff};

    fn inst(name: &str, p: &[i64]) -> Instance {
        Instance::new(name, p.to_vec())
    }

    #[test]
    fn test_domain_and_range_restriction() {
        let map: UnionMap = [
            (inst("S0", &[0]), inst("S1", &[0])),
            (inst("S0", &[1]), inst("S1", &[1])),
            (inst("S1", &[0]), inst("S2", &[0])),
        ]
        .into_iter()
        .collect();

        let s0: UnionSet = [inst("S0", &[0]), inst("S0", &[1])].into_iter().collect();
        let s1_0: UnionSet = [inst("S1", &[0])].into_iter().collect();
        assert_eq!(map.intersect_domain(&s0).len(), 2);
        assert_eq!(map.intersect_domain(&s0).intersect_range(&s1_0).len(), 1);
        assert_eq!(map.domain().card(), 3);
        assert_eq!(map.range().statement_names().len(), 2);
    }

    #[test]
    fn test_eq_at_projection() {
        let map: UnionMap = [
            (inst("S0", &[0]), inst("S1", &[0])),
            (inst("S0", &[1]), inst("S1", &[2])),
        ]
        .into_iter()
        .collect();
        let proj = MultiUnionPwAff::new(vec![UnionPwAff::new(vec![
            crate::aff::AffPiece {
                stmt: "S0".into(),
                domain: None,
                expr: AffExpr::dim(0),
            },
            crate::aff::AffPiece {
                stmt: "S1".into(),
                domain: None,
                expr: AffExpr::dim(0),
            },
        ])]);
        let equal = map.eq_at(&proj);
        assert_eq!(equal.len(), 1);
        assert!(equal.is_subset(&map));

        // S1 outside the projection's domain
        let partial = MultiUnionPwAff::new(vec![UnionPwAff::from_expr("S0", AffExpr::dim(0))]);
        assert!(map.eq_at(&partial).is_empty());
    }
}
