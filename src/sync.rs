//! Barrier placement between the children of a sequence.
//!
//! The children of a sequence form a ring: the sequence may sit in an
//! enclosing loop, so the last child is followed by the first one of the
//! next iteration. A barrier at position `p` separates child `p` from
//! child `(p + 1) % n`. A requirement from child `a` to child `b` is met
//! by any barrier of at least its level on the ring path `a, ..., b - 1`.
//!
//! Placement runs the greedy interval stabbing scheme once per level
//! (block barriers first, since they also satisfy warp requirements) and
//! then drops any barrier the others make redundant.

use crate::error::{MappingError, MappingResult};
use log::{debug, trace};
use poly_rs::{Instance, MultiUnionPwAff, NodeId, Schedule, ScheduleNodeType, UnionMap, UnionSet};
use serde::Serialize;
use std::fmt;

/// Strength of a barrier. Ordered so that a stronger level satisfies a
/// weaker requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLevel {
    Empty,
    Warp,
    Block,
}

impl fmt::Display for SyncLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncLevel::Empty => write!(f, "empty"),
            SyncLevel::Warp => write!(f, "warp"),
            SyncLevel::Block => write!(f, "block"),
        }
    }
}

/// A barrier after the child at `pos`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Synchronization {
    pub level: SyncLevel,
    pub pos: usize,
}

impl Synchronization {
    pub fn new(level: SyncLevel, pos: usize) -> Self {
        Synchronization { level, pos }
    }
}

/// One child of the sequence.
#[derive(Clone, Debug)]
pub struct SyncCandidate {
    pub idx: usize,
    pub domain: UnionSet,
    /// Requirement from this child to each child, by index
    pub levels: Vec<SyncLevel>,
    /// Block requirements seen from this child up to each child, walking
    /// the ring forward
    pub num_block_sync_to: Vec<usize>,
    /// Same for requirements that only need a warp barrier
    pub num_warp_sync_to: Vec<usize>,
}

impl SyncCandidate {
    fn num_sync_between(&self, other: usize, level: SyncLevel) -> usize {
        usize::from(self.levels[other] >= level)
    }

    fn num_sync_to(&self, other: usize, level: SyncLevel) -> usize {
        match level {
            SyncLevel::Block => self.num_block_sync_to[other],
            SyncLevel::Warp => self.num_warp_sync_to[other],
            SyncLevel::Empty => 0,
        }
    }
}

/// The children of one sequence, with their pairwise requirements.
#[derive(Clone, Debug)]
pub struct SyncCandidateRing {
    candidates: Vec<SyncCandidate>,
}

impl SyncCandidateRing {
    /// Classify the requirement of every ordered pair of distinct
    /// children of `seq`.
    ///
    /// Dependences between the two children are restricted to `context`.
    /// None left means no barrier; if every remaining pair runs on the
    /// same thread, none either; on the same warp, a warp barrier;
    /// otherwise a block barrier.
    pub fn build(
        sch: &Schedule,
        seq: NodeId,
        dependences: &UnionMap,
        context: &UnionSet,
        thread: &MultiUnionPwAff,
        warp: &MultiUnionPwAff,
    ) -> MappingResult<Self> {
        let n = sch.n_children(seq);
        let mut candidates = Vec::with_capacity(n);
        for (idx, &filter) in sch.children(seq).iter().enumerate() {
            if sch.node_type(filter) != ScheduleNodeType::Filter {
                return Err(MappingError::ExpectedFilter {
                    node: filter,
                    found: sch.node_type(filter),
                });
            }
            let domain = match sch.child(filter, 0) {
                Some(below) => sch.collect_domain(below),
                None => sch.filter(filter)?.clone(),
            };
            candidates.push(SyncCandidate {
                idx,
                domain,
                levels: vec![SyncLevel::Empty; n],
                num_block_sync_to: vec![0; n],
                num_warp_sync_to: vec![0; n],
            });
        }

        for a in 0..n {
            for b in (0..n).filter(|&b| b != a) {
                let dep = dependences
                    .intersect_domain(&candidates[a].domain)
                    .intersect_range(&candidates[b].domain);
                candidates[a].levels[b] = classify(&dep, context, thread, warp);
            }
        }
        trace!(
            "Sync requirements of {}: {:?}",
            seq,
            candidates.iter().map(|c| &c.levels).collect::<Vec<_>>()
        );
        Ok(SyncCandidateRing { candidates })
    }

    /// Ring built from explicit requirement levels, `levels[a][b]` being
    /// the requirement from child `a` to child `b`.
    pub fn from_levels(levels: Vec<Vec<SyncLevel>>) -> Self {
        let n = levels.len();
        let candidates = levels
            .into_iter()
            .enumerate()
            .map(|(idx, mut levels)| {
                levels.resize(n, SyncLevel::Empty);
                levels[idx] = SyncLevel::Empty;
                SyncCandidate {
                    idx,
                    domain: UnionSet::empty(),
                    levels,
                    num_block_sync_to: vec![0; n],
                    num_warp_sync_to: vec![0; n],
                }
            })
            .collect();
        SyncCandidateRing { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[SyncCandidate] {
        &self.candidates
    }

    pub fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.len()
    }

    /// Indices of the other children, walking the ring forward from `from`.
    fn others_top_down(&self, from: usize) -> impl Iterator<Item = usize> {
        let n = self.len();
        (1..n).map(move |k| (from + k) % n)
    }

    /// Fill the running requirement counts of every candidate. Warp
    /// counts leave out requirements a block barrier already covers.
    pub fn count_sync_number_among_loop(&mut self) {
        for a in 0..self.len() {
            let mut block = 0;
            let mut warp = 0;
            let order: Vec<usize> = self.others_top_down(a).collect();
            for b in order {
                let cand = &self.candidates[a];
                let block_count = cand.num_sync_between(b, SyncLevel::Block);
                let warp_count = cand
                    .num_sync_between(b, SyncLevel::Warp)
                    .saturating_sub(block_count);
                block = block.max(block_count);
                warp = warp.max(warp_count);
                let cand = &mut self.candidates[a];
                cand.num_block_sync_to[b] = block;
                cand.num_warp_sync_to[b] = warp;
            }
        }
    }

    /// Next barrier position of `level` when walking from child `start`,
    /// or `None` if no requirement is left open within two laps.
    ///
    /// `open` collects the children whose requirements are not cut by a
    /// barrier yet. The first gap at which one of them reaches its
    /// target gets the barrier.
    fn optimal_sync_pos(
        &self,
        start: usize,
        level: SyncLevel,
        placed: &[Synchronization],
    ) -> Option<usize> {
        let n = self.len();
        let covered = |pos: usize| placed.iter().any(|s| s.pos == pos && s.level >= level);
        let mut open: Vec<usize> = Vec::new();
        for step in 0..2 * n {
            let pos = (start + step) % n;
            if !open.contains(&pos) {
                open.push(pos);
            }
            if covered(pos) {
                open.clear();
                continue;
            }
            let next = self.next(pos);
            let blocked = open.iter().any(|&m| {
                m != next && self.candidates[m].num_sync_to(next, level) > 0
            });
            if blocked {
                return Some(pos);
            }
        }
        None
    }

    /// Greedy placement for all levels, starting at child `start`.
    ///
    /// For each level the walk resumes after the last placed barrier and
    /// stops once nothing is left open or a position repeats.
    pub fn determine_opt_sync_pos(&self, start: usize) -> Vec<Synchronization> {
        let mut syncs = Vec::new();
        if self.is_empty() {
            return syncs;
        }
        for level in [SyncLevel::Block, SyncLevel::Warp] {
            let mut cur = start % self.len();
            while let Some(pos) = self.optimal_sync_pos(cur, level, &syncs) {
                let sync = Synchronization::new(level, pos);
                if syncs.contains(&sync) {
                    break;
                }
                debug!("Placing {} barrier after child {}", level, pos);
                syncs.push(sync);
                cur = self.next(pos);
            }
        }
        self.prune_redundant(syncs)
    }

    /// True if every requirement has a barrier of its level on its path.
    pub fn is_satisfied_by(&self, syncs: &[Synchronization]) -> bool {
        self.candidates.iter().all(|cand| {
            cand.levels.iter().enumerate().all(|(target, &level)| {
                level == SyncLevel::Empty || self.path_has_barrier(cand.idx, target, level, syncs)
            })
        })
    }

    fn path_has_barrier(
        &self,
        from: usize,
        to: usize,
        level: SyncLevel,
        syncs: &[Synchronization],
    ) -> bool {
        let mut pos = from;
        while pos != to {
            if syncs.iter().any(|s| s.pos == pos && s.level >= level) {
                return true;
            }
            pos = self.next(pos);
        }
        false
    }

    /// Drop barriers, first placed first, while all requirements stay met.
    fn prune_redundant(&self, mut syncs: Vec<Synchronization>) -> Vec<Synchronization> {
        let mut i = 0;
        while i < syncs.len() {
            let mut without = syncs.clone();
            let removed = without.remove(i);
            if self.is_satisfied_by(&without) {
                debug!("Dropping redundant {} barrier after child {}", removed.level, removed.pos);
                syncs = without;
            } else {
                i += 1;
            }
        }
        syncs
    }
}

fn classify(
    dep: &UnionMap,
    context: &UnionSet,
    thread: &MultiUnionPwAff,
    warp: &MultiUnionPwAff,
) -> SyncLevel {
    if dep.is_empty() {
        return SyncLevel::Empty;
    }
    let dep = dep.intersect_context(context);
    if dep.is_subset(&dep.eq_at(thread)) {
        SyncLevel::Empty
    } else if dep.is_subset(&dep.eq_at(warp)) {
        SyncLevel::Warp
    } else {
        SyncLevel::Block
    }
}

/// Where the greedy walk starts. Every child is a valid start; the first
/// one is used until a cost model ranks them.
pub fn best_sync_start_point(_is_outer: bool) -> usize {
    0
}

/// A barrier statement inserted into the tree.
#[derive(Clone, Debug, Serialize)]
pub struct InsertedSync {
    pub sequence: usize,
    pub level: SyncLevel,
    pub pos: usize,
    pub statement: String,
}

/// Names barrier statements and inserts them as extension nodes.
#[derive(Clone, Debug, Default)]
pub struct SyncManager {
    counter: usize,
    inserted: Vec<InsertedSync>,
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager::default()
    }

    /// Fresh zero-dimensional barrier instance, e.g. `sync_block_0[]`
    pub fn make_sync_instance(&mut self, level: SyncLevel) -> Instance {
        let name = format!("sync_{}_{}", level, self.counter);
        self.counter += 1;
        Instance::new(name, Vec::new())
    }

    /// Run a barrier of `sync.level` right after the subtree at `target`,
    /// the first node below child `sync.pos` of `seq`.
    pub fn insert_extension_node(
        &mut self,
        sch: &mut Schedule,
        seq: NodeId,
        target: NodeId,
        sync: Synchronization,
    ) -> NodeId {
        let instance = self.make_sync_instance(sync.level);
        let statement = instance.name.clone();
        let extension: UnionSet = std::iter::once(instance).collect();
        let ext = sch.insert_extension(target, extension, true);
        debug!("Inserted {} after child {} of {}", statement, sync.pos, seq);
        self.inserted.push(InsertedSync {
            sequence: seq.index(),
            level: sync.level,
            pos: sync.pos,
            statement,
        });
        ext
    }

    pub fn inserted(&self) -> &[InsertedSync] {
        &self.inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SyncLevel::{Block, Empty, Warp};

    fn place(levels: Vec<Vec<SyncLevel>>) -> Vec<Synchronization> {
        let mut ring = SyncCandidateRing::from_levels(levels);
        ring.count_sync_number_among_loop();
        ring.determine_opt_sync_pos(best_sync_start_point(false))
    }

    #[test]
    fn test_single_block_requirement() {
        let syncs = place(vec![
            vec![Empty, Block, Empty],
            vec![Empty, Empty, Empty],
            vec![Empty, Empty, Empty],
        ]);
        assert_eq!(syncs, vec![Synchronization::new(Block, 0)]);
    }

    #[test]
    fn test_single_warp_requirement() {
        let syncs = place(vec![
            vec![Empty, Warp, Empty],
            vec![Empty, Empty, Empty],
            vec![Empty, Empty, Empty],
        ]);
        assert_eq!(syncs, vec![Synchronization::new(Warp, 0)]);
    }

    #[test]
    fn test_running_counts() {
        let mut ring = SyncCandidateRing::from_levels(vec![
            vec![Empty, Empty, Warp, Block],
            vec![Empty; 4],
            vec![Empty; 4],
            vec![Empty; 4],
        ]);
        ring.count_sync_number_among_loop();
        let c0 = &ring.candidates()[0];
        assert_eq!(c0.num_warp_sync_to, vec![0, 0, 1, 1]);
        assert_eq!(c0.num_block_sync_to, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_ring_of_block_requirements() {
        let n = 4;
        let levels = (0..n)
            .map(|a| {
                (0..n)
                    .map(|b| if b == (a + 1) % n { Block } else { Empty })
                    .collect()
            })
            .collect();
        let mut syncs = place(levels);
        syncs.sort();
        let expected: Vec<_> = (0..n).map(|p| Synchronization::new(Block, p)).collect();
        assert_eq!(syncs, expected);
    }

    #[test]
    fn test_block_barrier_covers_warp_requirement() {
        let syncs = place(vec![
            vec![Empty, Empty, Block],
            vec![Empty, Empty, Warp],
            vec![Empty, Empty, Empty],
        ]);
        assert_eq!(syncs, vec![Synchronization::new(Block, 1)]);
    }

    #[test]
    fn test_minimal_and_sufficient() {
        let levels = vec![
            vec![Empty, Empty, Block, Empty, Empty],
            vec![Empty, Empty, Empty, Warp, Empty],
            vec![Empty, Empty, Empty, Empty, Block],
            vec![Warp, Empty, Empty, Empty, Empty],
            vec![Empty, Block, Empty, Empty, Empty],
        ];
        let mut ring = SyncCandidateRing::from_levels(levels);
        ring.count_sync_number_among_loop();
        let syncs = ring.determine_opt_sync_pos(0);
        assert!(ring.is_satisfied_by(&syncs), "All requirements must be met: {:?}", syncs);
        for i in 0..syncs.len() {
            let mut without = syncs.clone();
            without.remove(i);
            assert!(!ring.is_satisfied_by(&without), "Barrier {:?} is redundant", syncs[i]);
        }
    }

    #[test]
    fn test_no_requirements() {
        assert!(place(vec![vec![Empty; 3]; 3]).is_empty());
        assert!(place(Vec::new()).is_empty());
    }

    #[test]
    fn test_sync_instance_names() {
        let mut manager = SyncManager::new();
        assert_eq!(manager.make_sync_instance(Block).name, "sync_block_0");
        assert_eq!(manager.make_sync_instance(Warp).name, "sync_warp_1");
    }
}
