//! Schedule trees stored as an arena of nodes.
//!
//! Every node is addressed by a [`NodeId`] that stays valid while the tree
//! around it is rewritten: inserting a mark above a band, tiling it or
//! deleting a neighbouring node never changes the band's id. Ancestor and
//! descendant tests walk parent links, so a pass can keep a log of node ids
//! across rewrites and still ask structural questions about them later.
//!
//! The node kinds follow ISL's schedule trees:
//!
//! ```text
//! Domain { S0[i, j] : 0 <= i, j < 64 }
//!   Band [{ S0 -> [(i0)] }, { S0 -> [(i1)] }] permutable=1 coincident=[1, 1]
//!     Leaf
//! ```

use crate::aff::{MultiUnionPwAff, UnionPwAff};
use crate::error::{PolyError, PolyResult};
use crate::parse::Params;
use crate::set::UnionSet;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleNodeType {
    Band,
    Domain,
    Extension,
    Filter,
    Leaf,
    Mark,
    Sequence,
    Set,
}

/// A band: one or more schedule dimensions scheduled together.
#[derive(Clone, Debug, PartialEq)]
pub struct Band {
    pub schedule: MultiUnionPwAff,
    pub permutable: bool,
    pub coincident: Vec<bool>,
}

impl Band {
    /// Missing coincident flags default to false.
    pub fn new(schedule: MultiUnionPwAff, permutable: bool, mut coincident: Vec<bool>) -> Self {
        coincident.resize(schedule.size(), false);
        Band {
            schedule,
            permutable,
            coincident,
        }
    }

    pub fn n_member(&self) -> usize {
        self.schedule.size()
    }

    pub fn member_get_coincident(&self, pos: usize) -> bool {
        self.coincident.get(pos).copied().unwrap_or(false)
    }

    /// Length of the leading run of coincident members
    pub fn count_consecutive_coincident(&self) -> usize {
        self.coincident.iter().take_while(|c| **c).count()
    }

    pub fn member(&self, pos: usize) -> PolyResult<&UnionPwAff> {
        self.schedule
            .get_at(pos)
            .ok_or(PolyError::BandMemberOutOfRange {
                pos,
                n_member: self.n_member(),
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Domain(UnionSet),
    Band(Band),
    Filter(UnionSet),
    Sequence,
    Set,
    Mark(String),
    /// Instances introduced at this point of the tree
    Extension(UnionSet),
    Leaf,
}

impl NodeKind {
    pub fn node_type(&self) -> ScheduleNodeType {
        match self {
            NodeKind::Domain(_) => ScheduleNodeType::Domain,
            NodeKind::Band(_) => ScheduleNodeType::Band,
            NodeKind::Filter(_) => ScheduleNodeType::Filter,
            NodeKind::Sequence => ScheduleNodeType::Sequence,
            NodeKind::Set => ScheduleNodeType::Set,
            NodeKind::Mark(_) => ScheduleNodeType::Mark,
            NodeKind::Extension(_) => ScheduleNodeType::Extension,
            NodeKind::Leaf => ScheduleNodeType::Leaf,
        }
    }
}

#[derive(Clone, Debug)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    removed: bool,
}

/// A schedule tree. Nodes are never moved in the arena; deleted nodes are
/// detached and flagged.
#[derive(Clone, Debug)]
pub struct Schedule {
    nodes: Vec<NodeData>,
    root: NodeId,
}

impl Schedule {
    /// A domain node with a single leaf below it.
    pub fn from_domain(domain: UnionSet) -> Self {
        let mut sch = Schedule {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        let root = sch.alloc(NodeKind::Domain(domain), None);
        let leaf = sch.alloc(NodeKind::Leaf, Some(root));
        sch.nodes[root.0].children.push(leaf);
        sch.root = root;
        sch
    }

    fn alloc(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            kind,
            parent,
            children: Vec::new(),
            removed: false,
        });
        id
    }

    fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The instance set of the root domain node
    pub fn domain(&self) -> UnionSet {
        match self.kind(self.root) {
            NodeKind::Domain(d) => d.clone(),
            _ => UnionSet::empty(),
        }
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.data(id).kind
    }

    pub fn node_type(&self, id: NodeId) -> ScheduleNodeType {
        self.kind(id).node_type()
    }

    pub fn is_removed(&self, id: NodeId) -> bool {
        self.data(id).removed
    }

    fn unexpected(&self, id: NodeId, expected: &'static str) -> PolyError {
        PolyError::UnexpectedNode {
            node: id.0,
            expected,
            found: self.node_type(id),
        }
    }

    pub fn band(&self, id: NodeId) -> PolyResult<&Band> {
        match self.kind(id) {
            NodeKind::Band(b) => Ok(b),
            _ => Err(self.unexpected(id, "band")),
        }
    }

    pub fn band_mut(&mut self, id: NodeId) -> PolyResult<&mut Band> {
        match &mut self.nodes[id.0].kind {
            NodeKind::Band(b) => Ok(b),
            other => Err(PolyError::UnexpectedNode {
                node: id.0,
                expected: "band",
                found: other.node_type(),
            }),
        }
    }

    /// Permutable band at `id`, if it is one
    pub fn as_permutable_band(&self, id: NodeId) -> Option<&Band> {
        match self.kind(id) {
            NodeKind::Band(b) if b.permutable => Some(b),
            _ => None,
        }
    }

    pub fn filter(&self, id: NodeId) -> PolyResult<&UnionSet> {
        match self.kind(id) {
            NodeKind::Filter(f) => Ok(f),
            _ => Err(self.unexpected(id, "filter")),
        }
    }

    pub fn mark_name(&self, id: NodeId) -> Option<&str> {
        match self.kind(id) {
            NodeKind::Mark(name) => Some(name),
            _ => None,
        }
    }

    /// True if `id` has a parent that is a mark named `name`.
    pub fn parent_is_mark(&self, id: NodeId, name: &str) -> bool {
        self.parent(id)
            .and_then(|p| self.mark_name(p))
            .map_or(false, |m| m == name)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id).parent
    }

    pub fn has_parent(&self, id: NodeId) -> bool {
        self.parent(id).is_some()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.data(id).children
    }

    pub fn child(&self, id: NodeId, pos: usize) -> Option<NodeId> {
        self.data(id).children.get(pos).copied()
    }

    pub fn n_children(&self, id: NodeId) -> usize {
        self.data(id).children.len()
    }

    /// The `generation`-th ancestor; `ancestor(id, 0)` is `id` itself.
    pub fn ancestor(&self, id: NodeId, generation: usize) -> Option<NodeId> {
        let mut node = id;
        for _ in 0..generation {
            node = self.parent(node)?;
        }
        Some(node)
    }

    /// Number of ancestors
    pub fn tree_depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut node = id;
        while let Some(p) = self.parent(node) {
            depth += 1;
            node = p;
        }
        depth
    }

    /// True if `id` is `ancestor` or lies below it.
    pub fn is_descendant_of(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut node = Some(id);
        while let Some(n) = node {
            if n == ancestor {
                return true;
            }
            node = self.parent(n);
        }
        false
    }

    /// Statement instances that reach `id`: the root domain, restricted by
    /// the filters of its ancestors and extended by their extensions.
    pub fn collect_domain(&self, id: NodeId) -> UnionSet {
        let mut path = Vec::new();
        let mut node = self.parent(id);
        while let Some(n) = node {
            path.push(n);
            node = self.parent(n);
        }

        let mut domain = UnionSet::empty();
        for n in path.into_iter().rev() {
            match self.kind(n) {
                NodeKind::Domain(d) => domain = d.clone(),
                NodeKind::Filter(f) => domain = domain.intersect(f),
                NodeKind::Extension(e) => domain = domain.union(e),
                _ => {}
            }
        }
        domain
    }

    /// Put a new node in the place of `id` and make `id` its only child.
    pub fn insert_above(&mut self, id: NodeId, kind: NodeKind) -> NodeId {
        let parent = self.parent(id);
        let new = self.alloc(kind, parent);
        match parent {
            Some(p) => {
                for c in self.nodes[p.0].children.iter_mut() {
                    if *c == id {
                        *c = new;
                    }
                }
            }
            None => self.root = new,
        }
        self.nodes[new.0].children.push(id);
        self.nodes[id.0].parent = Some(new);
        new
    }

    pub fn insert_mark(&mut self, id: NodeId, name: impl Into<String>) -> NodeId {
        self.insert_above(id, NodeKind::Mark(name.into()))
    }

    pub fn insert_filter(&mut self, id: NodeId, filter: UnionSet) -> NodeId {
        self.insert_above(id, NodeKind::Filter(filter))
    }

    pub fn insert_band(&mut self, id: NodeId, band: Band) -> NodeId {
        self.insert_above(id, NodeKind::Band(band))
    }

    /// Remove a node with exactly one child, returning that child.
    pub fn delete(&mut self, id: NodeId) -> PolyResult<NodeId> {
        let children = self.children(id).to_vec();
        let [child] = children[..] else {
            return Err(PolyError::InvalidTree(format!(
                "cannot delete {:?} node {} with {} children",
                self.node_type(id),
                id,
                children.len()
            )));
        };
        let parent = self.parent(id);
        match parent {
            Some(p) => {
                for c in self.nodes[p.0].children.iter_mut() {
                    if *c == id {
                        *c = child;
                    }
                }
            }
            None => self.root = child,
        }
        self.nodes[child.0].parent = parent;
        let data = &mut self.nodes[id.0];
        data.children.clear();
        data.parent = None;
        data.removed = true;
        Ok(child)
    }

    pub fn band_set_partial_schedule(
        &mut self,
        id: NodeId,
        schedule: MultiUnionPwAff,
    ) -> PolyResult<()> {
        let band = self.band_mut(id)?;
        band.coincident.resize(schedule.size(), false);
        band.schedule = schedule;
        Ok(())
    }

    pub fn band_member_set_coincident(
        &mut self,
        id: NodeId,
        pos: usize,
        coincident: bool,
    ) -> PolyResult<()> {
        let band = self.band_mut(id)?;
        let n_member = band.n_member();
        let flag = band
            .coincident
            .get_mut(pos)
            .ok_or(PolyError::BandMemberOutOfRange { pos, n_member })?;
        *flag = coincident;
        Ok(())
    }

    /// Tile the band at `id` by `sizes`. The node keeps the tile loops
    /// `floor(e / t)`; a point band `e mod t` is inserted as its child.
    /// Returns the id of the point band.
    pub fn band_tile(&mut self, id: NodeId, sizes: &[i64]) -> PolyResult<NodeId> {
        let band = self.band(id)?.clone();
        if sizes.len() != band.n_member() {
            return Err(PolyError::DimensionMismatch {
                expected: band.n_member(),
                found: sizes.len(),
            });
        }
        let mut tile = MultiUnionPwAff::default();
        let mut point = MultiUnionPwAff::default();
        for (member, &size) in band.schedule.members().iter().zip(sizes) {
            tile.push(member.scale_down_floor(size)?);
            point.push(member.modulo(size)?);
        }
        debug!("Tiling band {} with sizes {:?}", id, sizes);

        let child = self.child(id, 0).ok_or_else(|| {
            PolyError::InvalidTree(format!("band {} has no child", id))
        })?;
        let point_band = Band::new(point, band.permutable, band.coincident.clone());
        let point_id = self.insert_band(child, point_band);
        self.band_set_partial_schedule(id, tile)?;
        Ok(point_id)
    }

    /// Split the band at `id` after its first `pos` members. The remaining
    /// members move to a new band below; its id is returned.
    pub fn band_split(&mut self, id: NodeId, pos: usize) -> PolyResult<NodeId> {
        let band = self.band(id)?.clone();
        let n_member = band.n_member();
        if pos == 0 || pos >= n_member {
            return Err(PolyError::BandMemberOutOfRange { pos, n_member });
        }
        let members = band.schedule.members();
        let outer = Band::new(
            MultiUnionPwAff::new(members[..pos].to_vec()),
            band.permutable,
            band.coincident[..pos].to_vec(),
        );
        let inner = Band::new(
            MultiUnionPwAff::new(members[pos..].to_vec()),
            band.permutable,
            band.coincident[pos..].to_vec(),
        );
        let child = self.child(id, 0).ok_or_else(|| {
            PolyError::InvalidTree(format!("band {} has no child", id))
        })?;
        let inner_id = self.insert_band(child, inner);
        *self.band_mut(id)? = outer;
        Ok(inner_id)
    }

    /// Introduce the instances of `extension` next to the subtree at
    /// `target`:
    ///
    /// ```text
    /// Extension(extension)
    ///   Sequence
    ///     Filter(domain of target)  -> target
    ///     Filter(extension)         -> Leaf
    /// ```
    ///
    /// With `after == false` the extension filter comes first. Returns the
    /// id of the extension node.
    pub fn insert_extension(
        &mut self,
        target: NodeId,
        extension: UnionSet,
        after: bool,
    ) -> NodeId {
        let target_domain = self.collect_domain(target);
        let target_filter = self.insert_filter(target, target_domain);
        let seq = self.insert_above(target_filter, NodeKind::Sequence);
        let ext = self.insert_above(seq, NodeKind::Extension(extension.clone()));

        let ext_filter = self.alloc(NodeKind::Filter(extension), Some(seq));
        let leaf = self.alloc(NodeKind::Leaf, Some(ext_filter));
        self.nodes[ext_filter.0].children.push(leaf);
        if after {
            self.nodes[seq.0].children.push(ext_filter);
        } else {
            self.nodes[seq.0].children.insert(0, ext_filter);
        }
        ext
    }

    /// Visit the subtree at `id` in post-order and let `f` rewrite each
    /// node. Nodes deleted by `f` while their subtree is being visited are
    /// not visited themselves. Returns what `f` returned for `id`.
    pub fn map_descendant_bottom_up<E, F>(&mut self, id: NodeId, f: &mut F) -> Result<NodeId, E>
    where
        F: FnMut(&mut Schedule, NodeId) -> Result<NodeId, E>,
    {
        let mut i = 0;
        while let Some(child) = self.child(id, i) {
            self.map_descendant_bottom_up(child, f)?;
            i += 1;
        }
        if self.is_removed(id) {
            return Ok(id);
        }
        f(self, id)
    }

    /// Nodes of the subtree at `id` in pre-order
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    pub fn from_tree_spec(spec: &TreeSpec, params: &Params) -> PolyResult<Self> {
        let TreeSpec::Domain { domain, child } = spec else {
            return Err(PolyError::InvalidTree(
                "the root of a schedule tree must be a domain node".to_string(),
            ));
        };
        let domain = UnionSet::read_with_params(domain, params)?;
        let mut sch = Schedule {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        let root = sch.alloc(NodeKind::Domain(domain.clone()), None);
        sch.root = root;
        sch.build_child(root, child.as_deref(), &domain, params)?;
        debug!("Built schedule tree with {} nodes", sch.nodes.len());
        Ok(sch)
    }

    pub fn read_from_json(text: &str, params: &Params) -> PolyResult<Self> {
        let spec: TreeSpec = serde_json::from_str(text)?;
        Schedule::from_tree_spec(&spec, params)
    }

    fn build_child(
        &mut self,
        parent: NodeId,
        spec: Option<&TreeSpec>,
        reaching: &UnionSet,
        params: &Params,
    ) -> PolyResult<()> {
        let Some(spec) = spec else {
            let leaf = self.alloc(NodeKind::Leaf, Some(parent));
            self.nodes[parent.0].children.push(leaf);
            return Ok(());
        };
        let (kind, child) = match spec {
            TreeSpec::Domain { .. } => {
                return Err(PolyError::InvalidTree(
                    "domain node below the root".to_string(),
                ))
            }
            TreeSpec::Band {
                schedule,
                permutable,
                coincident,
                child,
            } => {
                let schedule = MultiUnionPwAff::read_with_params(schedule, params)?;
                let coincident = coincident.iter().map(|c| c.is_set()).collect();
                let permutable = permutable.map_or(false, |p| p.is_set());
                (
                    NodeKind::Band(Band::new(schedule, permutable, coincident)),
                    child.as_deref(),
                )
            }
            TreeSpec::Filter { filter, child } => {
                let set = UnionSet::read_within_with_params(filter, reaching, params)?;
                let id = self.alloc(NodeKind::Filter(set.clone()), Some(parent));
                self.nodes[parent.0].children.push(id);
                return self.build_child(id, child.as_deref(), &set, params);
            }
            TreeSpec::Mark { mark, child } => (NodeKind::Mark(mark.clone()), child.as_deref()),
            TreeSpec::Sequence { sequence: list } | TreeSpec::Set { set: list } => {
                let kind = match spec {
                    TreeSpec::Sequence { .. } => NodeKind::Sequence,
                    _ => NodeKind::Set,
                };
                let id = self.alloc(kind, Some(parent));
                self.nodes[parent.0].children.push(id);
                for item in list {
                    if !matches!(item, TreeSpec::Filter { .. }) {
                        return Err(PolyError::InvalidTree(
                            "children of a sequence or set must be filters".to_string(),
                        ));
                    }
                    self.build_child(id, Some(item), reaching, params)?;
                }
                return Ok(());
            }
        };
        let id = self.alloc(kind, Some(parent));
        self.nodes[parent.0].children.push(id);
        self.build_child(id, child, reaching, params)
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}", "", indent = depth * 2)?;
        match self.kind(id) {
            NodeKind::Domain(d) => writeln!(f, "Domain {}", d)?,
            NodeKind::Band(b) => {
                let flags: Vec<String> = b
                    .coincident
                    .iter()
                    .map(|c| (*c as u8).to_string())
                    .collect();
                writeln!(
                    f,
                    "Band {} permutable={} coincident=[{}]",
                    b.schedule,
                    b.permutable as u8,
                    flags.join(", ")
                )?
            }
            NodeKind::Filter(s) => writeln!(f, "Filter {}", s)?,
            NodeKind::Sequence => writeln!(f, "Sequence")?,
            NodeKind::Set => writeln!(f, "Set")?,
            NodeKind::Mark(name) => writeln!(f, "Mark \"{}\"", name)?,
            NodeKind::Extension(e) => writeln!(f, "Extension {}", e)?,
            NodeKind::Leaf => writeln!(f, "Leaf")?,
        }
        for c in self.children(id) {
            self.fmt_node(f, *c, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, self.root, 0)
    }
}

/// Band flags are written either as booleans or as 0/1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    pub fn is_set(self) -> bool {
        match self {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

/// JSON description of a schedule tree, keyed like ISL's YAML form:
///
/// ```json
/// { "domain": "{ S0[i] : 0 <= i < 64 }",
///   "child": { "schedule": "[{ S0[i] -> [(i)] }]",
///              "permutable": 1, "coincident": [1] } }
/// ```
///
/// A missing `child` stands for a leaf.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeSpec {
    Domain {
        domain: String,
        #[serde(default)]
        child: Option<Box<TreeSpec>>,
    },
    Band {
        schedule: String,
        #[serde(default)]
        permutable: Option<Flag>,
        #[serde(default)]
        coincident: Vec<Flag>,
        #[serde(default)]
        child: Option<Box<TreeSpec>>,
    },
    Filter {
        filter: String,
        #[serde(default)]
        child: Option<Box<TreeSpec>>,
    },
    Mark {
        mark: String,
        #[serde(default)]
        child: Option<Box<TreeSpec>>,
    },
    Sequence {
        sequence: Vec<TreeSpec>,
    },
    Set {
        set: Vec<TreeSpec>,
    },
}
