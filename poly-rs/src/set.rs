//! Explicit sets of statement instances.

use crate::error::PolyResult;
use crate::parse::{self, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One dynamic execution of a statement, e.g. `S0[3, 7]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub point: Vec<i64>,
}

impl Instance {
    pub fn new(name: impl Into<String>, point: Vec<i64>) -> Self {
        Instance {
            name: name.into(),
            point,
        }
    }

    /// Number of iteration coordinates
    pub fn arity(&self) -> usize {
        self.point.len()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.name)?;
        for (i, v) in self.point.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// A finite union of statement instance sets (ISL's `isl_union_set`,
/// enumerated).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UnionSet {
    instances: BTreeSet<Instance>,
}

impl UnionSet {
    pub fn empty() -> Self {
        UnionSet::default()
    }

    /// Read a parameter-free set with constant bounds.
    pub fn read_from_str(text: &str) -> PolyResult<Self> {
        parse::read_union_set(text, &Params::new())
    }

    /// Read a set whose bounds mention parameters.
    pub fn read_with_params(text: &str, params: &Params) -> PolyResult<Self> {
        parse::read_union_set(text, params)
    }

    /// Read a set by filtering the instances of `universe`.
    ///
    /// Tuple variables need no bounds here, so filters such as
    /// `{ S0[i, j] : i < 4; S1[k] }` are resolved against the domain they
    /// restrict.
    pub fn read_within(text: &str, universe: &UnionSet) -> PolyResult<Self> {
        parse::read_union_set_within(text, universe, &Params::new())
    }

    pub fn read_within_with_params(
        text: &str,
        universe: &UnionSet,
        params: &Params,
    ) -> PolyResult<Self> {
        parse::read_union_set_within(text, universe, params)
    }

    pub fn insert(&mut self, instance: Instance) -> bool {
        self.instances.insert(instance)
    }

    pub fn contains(&self, instance: &Instance) -> bool {
        self.instances.contains(instance)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of instances
    pub fn card(&self) -> usize {
        self.instances.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    pub fn union(&self, other: &UnionSet) -> UnionSet {
        UnionSet {
            instances: self.instances.union(&other.instances).cloned().collect(),
        }
    }

    pub fn intersect(&self, other: &UnionSet) -> UnionSet {
        UnionSet {
            instances: self
                .instances
                .intersection(&other.instances)
                .cloned()
                .collect(),
        }
    }

    pub fn subtract(&self, other: &UnionSet) -> UnionSet {
        UnionSet {
            instances: self
                .instances
                .difference(&other.instances)
                .cloned()
                .collect(),
        }
    }

    pub fn is_subset(&self, other: &UnionSet) -> bool {
        self.instances.is_subset(&other.instances)
    }

    /// Names of the statements with at least one instance in the set
    pub fn statement_names(&self) -> BTreeSet<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }

    /// Instances of a single statement
    pub fn filter_statement(&self, name: &str) -> UnionSet {
        self.filter(|i| i.name == name)
    }

    pub fn filter<F: Fn(&Instance) -> bool>(&self, pred: F) -> UnionSet {
        UnionSet {
            instances: self.instances.iter().filter(|i| pred(i)).cloned().collect(),
        }
    }
}

impl FromIterator<Instance> for UnionSet {
    fn from_iter<I: IntoIterator<Item = Instance>>(iter: I) -> Self {
        UnionSet {
            instances: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a UnionSet {
    type Item = &'a Instance;
    type IntoIter = std::collections::btree_set::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

/// Small sets print every instance; larger ones print a per-statement count.
impl fmt::Display for UnionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LISTED: usize = 8;
        write!(f, "{{ ")?;
        if self.card() <= LISTED {
            for (i, inst) in self.instances.iter().enumerate() {
                if i > 0 {
                    write!(f, "; ")?;
                }
                write!(f, "{}", inst)?;
            }
        } else {
            for (i, name) in self.statement_names().into_iter().enumerate() {
                if i > 0 {
                    write!(f, "; ")?;
                }
                let count = self.instances.iter().filter(|s| s.name == name).count();
                write!(f, "{}[...] x{}", name, count)?;
            }
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(points: &[(&str, &[i64])]) -> UnionSet {
        points
            .iter()
            .map(|(n, p)| Instance::new(*n, p.to_vec()))
            .collect()
    }

    #[test]
    fn test_set_operations() {
        let a = set(&[("S0", &[0]), ("S0", &[1]), ("S1", &[0])]);
        let b = set(&[("S0", &[1]), ("S1", &[0]), ("S1", &[1])]);

        assert_eq!(a.union(&b).card(), 4);
        assert_eq!(a.intersect(&b), set(&[("S0", &[1]), ("S1", &[0])]));
        assert_eq!(a.subtract(&b), set(&[("S0", &[0])]));
        assert!(a.intersect(&b).is_subset(&a));
        assert!(!a.is_subset(&b));
    }

    #[test]
    fn test_statement_filtering() {
        let a = set(&[("S0", &[0, 1]), ("S1", &[2]), ("S1", &[3])]);
        assert_eq!(a.statement_names().len(), 2);
        assert_eq!(a.filter_statement("S1").card(), 2);
        assert!(a.filter_statement("S2").is_empty());
    }

    #[test]
    fn test_display_summarizes_large_sets() {
        let small = set(&[("S0", &[0, 1])]);
        assert_eq!(small.to_string(), "{ S0[0, 1] }");

        let large: UnionSet = (0..20).map(|i| Instance::new("S0", vec![i])).collect();
        assert_eq!(large.to_string(), "{ S0[...] x20 }");
    }
}
