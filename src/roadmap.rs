//! Which schedule-tree nodes have already been bound to threads.

use poly_rs::{NodeId, Schedule, ScheduleNodeType};

/// Append-only log of `(node, thread coordinates consumed)` for one pass.
///
/// Nodes are logged by id. Ids survive the rewrites the pass performs, so
/// every ancestor or descendant question is answered from the current tree
/// by walking parent links.
#[derive(Clone, Debug, Default)]
pub struct RoadMap {
    records: Vec<(NodeId, usize)>,
}

impl RoadMap {
    pub fn new() -> Self {
        RoadMap::default()
    }

    /// Log a mapped node. A node logged twice keeps its latest count.
    pub fn push(&mut self, node: NodeId, mapped: usize) {
        match self.records.iter_mut().find(|(n, _)| *n == node) {
            Some(record) => record.1 = mapped,
            None => self.records.push((node, mapped)),
        }
    }

    pub fn records(&self) -> &[(NodeId, usize)] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Thread count logged for `node` or for a node whose nearest enclosing
    /// filter is `node`.
    pub fn mapped_size_at(&self, sch: &Schedule, node: NodeId) -> Option<usize> {
        self.records
            .iter()
            .find(|(r, _)| *r == node || enclosing_filter(sch, *r) == Some(node))
            .map(|(_, size)| *size)
    }

    pub fn has_mapped(&self, sch: &Schedule, node: NodeId) -> bool {
        self.mapped_size_at(sch, node).is_some()
    }

    /// Largest thread count logged at `node` or below it; 0 if none.
    pub fn num_mapped_descendant(&self, sch: &Schedule, node: NodeId) -> usize {
        self.records
            .iter()
            .filter(|(r, _)| sch.is_descendant_of(*r, node))
            .map(|(_, size)| *size)
            .max()
            .unwrap_or(0)
    }
}

/// Nearest filter at or above `id` that is reached without crossing a
/// sequence or set.
fn enclosing_filter(sch: &Schedule, id: NodeId) -> Option<NodeId> {
    let mut node = Some(id);
    while let Some(n) = node {
        match sch.node_type(n) {
            ScheduleNodeType::Filter => return Some(n),
            ScheduleNodeType::Sequence | ScheduleNodeType::Set => return None,
            _ => node = sch.parent(n),
        }
    }
    None
}

fn is_inner_most_band(sch: &Schedule, node: NodeId, roadmap: &RoadMap) -> bool {
    sch.as_permutable_band(node).is_some() && roadmap.num_mapped_descendant(sch, node) == 0
}

/// A permutable band with nothing mapped below it can take threads. Below
/// a sequence, all siblings have to be mappable (or already mapped) so the
/// sequence is never left half synchronized.
pub fn can_be_mapped_to_thread(sch: &Schedule, node: NodeId, roadmap: &RoadMap) -> bool {
    if !is_inner_most_band(sch, node, roadmap) {
        return false;
    }

    let Some(seq) = sch
        .ancestor(node, 2)
        .filter(|a| sch.node_type(*a) == ScheduleNodeType::Sequence)
    else {
        return true;
    };
    sch.children(seq).iter().all(|&filter| {
        let Some(first) = sch.child(filter, 0) else {
            return true;
        };
        sch.node_type(first) == ScheduleNodeType::Mark
            || is_inner_most_band(sch, first, roadmap)
            || roadmap.has_mapped(sch, filter)
    })
}
