//! The outer-band mapping pass.
//!
//! Threads are bound bottom-up: every innermost permutable band takes the
//! innermost coincident members, sequences whose children were mapped get
//! their missing coordinates filled and barriers placed between the
//! children. Blocks are then bound to the outermost permutable band.
//! Kernels with a custom mapping table follow the table instead.

use crate::config::{MappingCfg, ReduceDirection, WARP_COMPUTE};
use crate::error::{MappingError, MappingResult};
use crate::mapping::{
    bind_band, zero_mapping, BLOCK_MARKER, INSERT_SYNC, MAP_TO_WARP, PRESERVE_MARKER, REDUCE_MARKER,
    SKIP_MARKER, THREAD_MARKER, WARP_MARKER,
};
use crate::roadmap::{can_be_mapped_to_thread, RoadMap};
use crate::scop::{PassInfo, ScopInfo};
use crate::strategy::{
    detect_and_mark_reduce, mark_atomic_add_tensor, need_atomic_add, MappingStrategy,
};
use crate::sync::{best_sync_start_point, SyncCandidateRing};
use crate::warp::{map_domain_to_thread, map_domain_to_warp};
use log::{debug, info, warn};
use poly_rs::{NodeId, PolyError, Schedule, ScheduleNodeType};
use std::collections::{BTreeMap, BTreeSet};

/// Bookkeeping of one bottom-up thread-mapping walk
#[derive(Default)]
struct ThreadWalk {
    roadmap: RoadMap,
    is_reduce_stmt: bool,
}

pub struct MappingOuterBand<'a> {
    pass_info: &'a PassInfo,
    scop_info: &'a mut ScopInfo,
}

impl<'a> MappingOuterBand<'a> {
    pub fn new(pass_info: &'a PassInfo, scop_info: &'a mut ScopInfo) -> Self {
        MappingOuterBand {
            pass_info,
            scop_info,
        }
    }

    pub fn run(&mut self, mut sch: Schedule) -> MappingResult<Schedule> {
        if self.scop_info.analysis_result.is_custom_mapping {
            return self.do_custom_mapping(sch);
        }
        if self.scop_info.user_config.enable_akg_reduce_lib {
            detect_and_mark_reduce(&mut sch);
        }
        let sch = self.do_thread_mapping(sch)?;
        self.do_block_mapping(sch)
    }

    pub fn do_thread_mapping(&mut self, mut sch: Schedule) -> MappingResult<Schedule> {
        let thread_cfg = self.scop_info.user_config.thread_config()?;
        if thread_cfg.bound() < 1 {
            return Ok(sch);
        }

        let mut walk = ThreadWalk::default();
        let root = sch.root();
        sch.map_descendant_bottom_up(root, &mut |sch: &mut Schedule, node: NodeId| {
            self.map_from_inner(sch, node, &mut walk)
        })?;
        info!("Thread mapping logged {} node(s)", walk.roadmap.len());
        Ok(sch)
    }

    fn map_from_inner(
        &mut self,
        sch: &mut Schedule,
        node: NodeId,
        walk: &mut ThreadWalk,
    ) -> MappingResult<NodeId> {
        let config = &self.scop_info.user_config;
        let tensor_core = config.enable_tensor_core_use_poly;
        let conv_tensor_core = config.enable_conv_tensor_core;
        let vectorization = config.enable_vectorization;
        let reduce_lib = config.enable_akg_reduce_lib;

        let mut is_bmm_stmt = false;
        if tensor_core {
            if let Some(mark) = parent_mark(sch, node, SKIP_MARKER) {
                sch.delete(mark)?;
                return Ok(node);
            }
            if let Some(mark) = parent_mark(sch, node, MAP_TO_WARP) {
                sch.delete(mark)?;
                is_bmm_stmt = true;
            }
        }
        if sch.parent_is_mark(node, PRESERVE_MARKER) {
            return Ok(node);
        }

        if can_be_mapped_to_thread(sch, node, &walk.roadmap) {
            if vectorization {
                if let Some(mark) = parent_mark(sch, node, SKIP_MARKER) {
                    sch.delete(mark)?;
                }
            }
            let strategy = if reduce_lib && sch.parent_is_mark(node, REDUCE_MARKER) {
                walk.is_reduce_stmt = true;
                MappingStrategy::Reduce
            } else if is_bmm_stmt && conv_tensor_core {
                MappingStrategy::Conv
            } else if is_bmm_stmt {
                MappingStrategy::BatchMatmul
            } else {
                MappingStrategy::Elementwise
            };
            let reverse = self.scop_info.analysis_result.reduce_direction == ReduceDirection::Y;
            let mapped = strategy.map_thread_helper(sch, node, self.scop_info, reverse)?;
            walk.roadmap.push(mapped.record, mapped.mapped);
            return Ok(node);
        }

        if sch.n_children(node) <= 1 || walk.roadmap.num_mapped_descendant(sch, node) == 0 {
            return Ok(node);
        }

        let node = self.map_sequence_node(sch, node, &walk.roadmap)?;
        if sch.node_type(node) != ScheduleNodeType::Sequence {
            return Ok(node);
        }
        if walk.is_reduce_stmt {
            if let Some(mark) = parent_mark(sch, node, INSERT_SYNC) {
                sch.delete(mark)?;
                return self.do_thread_synchronization(sch, node, &[]);
            }
            Ok(node)
        } else if tensor_core {
            let warp_cfg = self
                .scop_info
                .user_config
                .replace_config(WARP_COMPUTE)
                .cloned()
                .ok_or_else(|| {
                    MappingError::Config(format!("replace config `{}` is missing", WARP_COMPUTE))
                })?;
            self.do_thread_synchronization(sch, node, &[warp_cfg])
        } else {
            self.do_thread_synchronization(sch, node, &[])
        }
    }

    /// Complete the thread coordinates of the mapped children of a
    /// sequence or set.
    fn map_sequence_node(
        &mut self,
        sch: &mut Schedule,
        node: NodeId,
        roadmap: &RoadMap,
    ) -> MappingResult<NodeId> {
        let children = sch.children(node).to_vec();
        for child in children {
            if let Some(size) = roadmap.mapped_size_at(sch, child) {
                self.fill_remaining_threads(sch, child, size)?;
            }
        }
        Ok(node)
    }

    /// A child that consumed `begin` thread coordinates gets the rest
    /// bound to 0. A child with nothing bound gets a thread marker with
    /// an all-zero mapping.
    fn fill_remaining_threads(
        &mut self,
        sch: &mut Schedule,
        filter: NodeId,
        begin: usize,
    ) -> MappingResult<NodeId> {
        let thread_cfg = self.scop_info.user_config.thread_config()?.clone();
        if begin >= thread_cfg.bound() {
            return Ok(filter);
        }
        if sch.node_type(filter) != ScheduleNodeType::Filter {
            return Err(MappingError::ExpectedFilter {
                node: filter,
                found: sch.node_type(filter),
            });
        }

        let mut found = false;
        for (mapped, mapping) in self.scop_info.upa_node_mapping.iter_mut() {
            if !sch.is_descendant_of(*mapped, filter) {
                continue;
            }
            found = true;
            if mapping.uses(&thread_cfg) {
                let domain = sch.collect_domain(*mapped);
                mapping.fill_zero(&thread_cfg, &domain, &BTreeSet::new());
            }
        }
        if !found {
            let below = sch.child(filter, 0).ok_or_else(|| {
                PolyError::InvalidTree(format!("filter {} has no child", filter))
            })?;
            let domain = sch.collect_domain(below);
            let mark = sch.insert_mark(below, THREAD_MARKER);
            debug!("Filling threads of filter {} with zeros", filter);
            self.scop_info
                .record_mapping(mark, zero_mapping(&thread_cfg, &domain));
        }
        Ok(filter)
    }

    /// Place the barriers the children of the sequence at `node` need.
    ///
    /// `other_cfgs` are configurations (such as `warp_compute`) whose
    /// mappings complete the thread projection.
    pub fn do_thread_synchronization(
        &mut self,
        sch: &mut Schedule,
        node: NodeId,
        other_cfgs: &[MappingCfg],
    ) -> MappingResult<NodeId> {
        let thread_cfg = self.scop_info.user_config.thread_config()?.clone();
        let is_outer = is_outer_band_with_no_coincident(sch, node);

        let mut domain_thread =
            map_domain_to_thread(sch, node, &thread_cfg, &self.scop_info.upa_node_mapping);
        for cfg in other_cfgs {
            let other = map_domain_to_thread(sch, node, cfg, &self.scop_info.upa_node_mapping);
            domain_thread = domain_thread.union_add(&other);
        }

        let domain_node = sch.collect_domain(node);
        let covered = domain_thread.domain_within(&domain_node);
        if covered != domain_node {
            return Err(MappingError::UnmappedDomain(
                domain_node.subtract(&covered).to_string(),
            ));
        }

        let domain_warp = map_domain_to_warp(&thread_cfg, &domain_thread)?;
        let mut ring = SyncCandidateRing::build(
            sch,
            node,
            &self.pass_info.dependences,
            &sch.domain(),
            &domain_thread,
            &domain_warp,
        )?;
        ring.count_sync_number_among_loop();
        let start = best_sync_start_point(is_outer);
        let mut syncs = ring.determine_opt_sync_pos(start);
        syncs.sort_by(|a, b| b.pos.cmp(&a.pos));

        for sync in syncs {
            let below = sch
                .child(node, sync.pos)
                .and_then(|filter| sch.child(filter, 0))
                .ok_or_else(|| {
                    PolyError::InvalidTree(format!("child {} of {} has no subtree", sync.pos, node))
                })?;
            self.scop_info
                .sync_manager
                .insert_extension_node(sch, node, below, sync);
        }
        Ok(node)
    }

    pub fn do_block_mapping(&mut self, mut sch: Schedule) -> MappingResult<Schedule> {
        let node = get_outer_band(&sch, sch.root());
        let Some(band) = sch.as_permutable_band(node) else {
            warn!("No permutable outer band node to map block.");
            return Ok(sch);
        };

        let config = &self.scop_info.user_config;
        let block_cfg = config.block_config()?;
        let mut n_block_map = if config.enable_akg_reduce_lib || config.enable_stitch_fusion {
            band.n_member()
        } else {
            band.count_consecutive_coincident()
        };
        n_block_map = n_block_map.min(block_cfg.max_dim()).min(block_cfg.bound());
        if n_block_map < 1 {
            return Ok(sch);
        }

        // scalar kernels usually have a single outer member; it takes the
        // largest block extent
        let need_shift = n_block_map < block_cfg.bound() && !config.consider_coincidence;
        let mut map_idx_shift = BTreeMap::new();
        if need_shift {
            let mut new_idx = 0;
            for (i, (_, extent)) in block_cfg.iter().enumerate() {
                if block_cfg.get_at(new_idx).map_or(false, |(_, e)| extent > e) {
                    new_idx = i;
                }
            }
            if self.scop_info.analysis_result.enabled_auto_tiling {
                self.scop_info.user_config.block_config_mut()?.swap_config(0, new_idx);
            } else {
                map_idx_shift.insert(0, new_idx);
                map_idx_shift.insert(new_idx, 0);
            }
        }

        let check_extent = map_idx_shift.is_empty();
        if self.scop_info.user_config.enable_akg_reduce_lib {
            if self.scop_info.user_config.enable_atomic_add
                && need_atomic_add(&sch, node, n_block_map)?
            {
                mark_atomic_add_tensor(&mut sch, node, self.scop_info);
            }
            MappingStrategy::Reduce.map_block_helper(
                &mut sch,
                node,
                self.scop_info,
                n_block_map,
                check_extent,
                &map_idx_shift,
            )?;
        } else if self.scop_info.user_config.enable_conv_tensor_core {
            MappingStrategy::Conv.reset_conv_block_mapping_config(
                &mut sch,
                node,
                self.scop_info,
                n_block_map,
                check_extent,
            )?;
        } else {
            MappingStrategy::Elementwise.map_block_helper(
                &mut sch,
                node,
                self.scop_info,
                n_block_map,
                check_extent,
                &map_idx_shift,
            )?;
        }
        self.scop_info.block_shift = map_idx_shift;
        Ok(sch)
    }

    pub fn do_custom_mapping(&mut self, mut sch: Schedule) -> MappingResult<Schedule> {
        let thread_cfg = self.scop_info.user_config.thread_config()?.clone();

        let mut roadmap = RoadMap::new();
        let root = sch.root();
        sch.map_descendant_bottom_up(root, &mut |sch: &mut Schedule, node: NodeId| {
            if can_be_mapped_to_thread(sch, node, &roadmap) {
                match self.map_custom_helper(sch, node, true, &thread_cfg)? {
                    Some(mark) => roadmap.push(mark, thread_cfg.bound()),
                    None => roadmap.push(node, 0),
                }
                return Ok(node);
            }
            if sch.n_children(node) <= 1 || roadmap.num_mapped_descendant(sch, node) == 0 {
                return Ok(node);
            }
            let node = self.map_sequence_node(sch, node, &roadmap)?;
            if sch.node_type(node) == ScheduleNodeType::Sequence {
                return self.do_thread_synchronization(sch, node, &[]);
            }
            Ok(node)
        })?;

        let outer = get_outer_band(&sch, sch.root());
        let outer_cfg = if self.scop_info.analysis_result.is_outer_block_mapping {
            self.scop_info.user_config.block_config()?.clone()
        } else {
            thread_cfg
        };
        self.map_custom_helper(&mut sch, outer, false, &outer_cfg)?;
        Ok(sch)
    }

    /// Bind the band at `node` following the custom inner or outer table.
    /// Returns the inserted marker, or `None` if `node` is not a
    /// permutable band.
    fn map_custom_helper(
        &mut self,
        sch: &mut Schedule,
        node: NodeId,
        is_inner: bool,
        cfg: &MappingCfg,
    ) -> MappingResult<Option<NodeId>> {
        let Some(band) = sch.as_permutable_band(node) else {
            return Ok(None);
        };
        let n_member = band.n_member();
        let config = &self.scop_info.user_config;
        let table = if is_inner {
            &config.custom_inner_mapping
        } else {
            &config.custom_outer_mapping
        };
        if table.is_empty() {
            return Err(MappingError::EmptyCustomMapping(if is_inner {
                "inner"
            } else {
                "outer"
            }));
        }

        let mut assignments = Vec::with_capacity(table.len());
        for (&member, name) in table.iter().filter(|(m, _)| **m < n_member) {
            let (coord, _) = cfg
                .get_by_name(name)
                .ok_or_else(|| MappingError::UnknownCoordinate(name.clone()))?;
            assignments.push((member, coord));
        }
        // the inner band leaves the outer table's coordinates unbound
        let keep_free: Option<BTreeSet<String>> = is_inner.then(|| {
            std::iter::once(SKIP_MARKER.to_string())
                .chain(config.custom_outer_mapping.values().cloned())
                .collect()
        });

        let marker = if is_inner { THREAD_MARKER } else { BLOCK_MARKER };
        let mut bound = bind_band(sch, node, cfg, &assignments, true, marker)?;
        if let Some(keep_free) = keep_free {
            let domain = sch.collect_domain(node);
            bound.mapping.fill_zero(cfg, &domain, &keep_free);
        }
        info!(
            "Custom {} mapping bound band {} to {} coordinate(s)",
            if is_inner { "inner" } else { "outer" },
            node,
            bound.mapping.len()
        );
        self.scop_info.record_mapping(bound.mark, bound.mapping);
        Ok(Some(bound.mark))
    }
}

fn parent_mark(sch: &Schedule, node: NodeId, name: &str) -> Option<NodeId> {
    if sch.parent_is_mark(node, name) {
        sch.parent(node)
    } else {
        None
    }
}

/// First band below `root` along single-child nodes. The walk stops at a
/// branching node, a leaf, or a subtree already bound to threads.
pub fn get_outer_band(sch: &Schedule, root: NodeId) -> NodeId {
    let mut node = root;
    loop {
        match sch.node_type(node) {
            ScheduleNodeType::Band | ScheduleNodeType::Sequence | ScheduleNodeType::Set => {
                return node
            }
            ScheduleNodeType::Mark
                if matches!(sch.mark_name(node), Some(THREAD_MARKER) | Some(WARP_MARKER)) =>
            {
                return node
            }
            _ => match sch.children(node) {
                [only] => node = *only,
                _ => return node,
            },
        }
    }
}

/// True if, walking from the root down to `node`, a band with a
/// non-coincident member comes before any sequence.
pub fn is_outer_band_with_no_coincident(sch: &Schedule, node: NodeId) -> bool {
    let depth = sch.tree_depth(node);
    for i in 0..depth {
        let Some(ancestor) = sch.ancestor(node, depth - i) else {
            continue;
        };
        match sch.node_type(ancestor) {
            ScheduleNodeType::Band => {
                if let Ok(band) = sch.band(ancestor) {
                    if band.n_member() > band.count_consecutive_coincident() {
                        return true;
                    }
                }
            }
            ScheduleNodeType::Sequence => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::mapping::Mapping;
    use poly_rs::{AffExpr, NodeKind, Params, UnionPwAff, UnionSet};

    #[test]
    fn test_outer_band_lookup() {
        let json = r#"{
            "domain": "{ S[i, j] : 0 <= i < 4 and 0 <= j < 4 }",
            "child": { "mark": "kernel", "child": {
                "schedule": "[{ S[i, j] -> [(i)] }, { S[i, j] -> [(j)] }]",
                "permutable": 1, "coincident": [1, 0],
                "child": { "sequence": [
                    { "filter": "{ S[i, j] : j < 2 }" },
                    { "filter": "{ S[i, j] : j >= 2 }" }
                ] }
            } }
        }"#;
        let sch = Schedule::read_from_json(json, &Params::new()).unwrap();
        let mark = sch.child(sch.root(), 0).unwrap();
        let band = sch.child(mark, 0).unwrap();
        let seq = sch.child(band, 0).unwrap();
        assert_eq!(get_outer_band(&sch, sch.root()), band);
        assert!(is_outer_band_with_no_coincident(&sch, seq));
        assert!(!is_outer_band_with_no_coincident(&sch, band));
    }

    #[test]
    fn test_sequence_child_must_be_filter() {
        let domain = UnionSet::read_from_str("{ S0[i] : 0 <= i < 4 }").unwrap();
        let mut sch = Schedule::from_domain(domain);
        let leaf = sch.child(sch.root(), 0).unwrap();
        let mark = sch.insert_mark(leaf, THREAD_MARKER);
        let seq = sch.insert_above(mark, NodeKind::Sequence);

        let config = UserConfig::default().with_thread_config(MappingCfg::threads(&[4]).unwrap());
        let mut scop_info = ScopInfo::new(config, Default::default());
        let mut mapping = Mapping::new();
        mapping.insert("thread.x", UnionPwAff::from_expr("S0", AffExpr::dim(0)));
        scop_info.record_mapping(mark, mapping);
        let pass_info = PassInfo::default();
        let mut pass = MappingOuterBand::new(&pass_info, &mut scop_info);

        match pass.do_thread_synchronization(&mut sch, seq, &[]) {
            Err(MappingError::ExpectedFilter { node, found }) => {
                assert_eq!(node, mark);
                assert_eq!(found, ScheduleNodeType::Mark);
            }
            other => panic!("Expected ExpectedFilter, got {:?}", other),
        }
        assert!(matches!(
            pass.fill_remaining_threads(&mut sch, mark, 0),
            Err(MappingError::ExpectedFilter { .. })
        ));
    }
}
