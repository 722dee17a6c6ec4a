//! Per-kernel-kind choice of which band members go to which coordinates.

use crate::config::{MappingCfg, WARP_COMPUTE};
use crate::error::{MappingError, MappingResult};
use crate::mapping::{
    bind_band, isolate_members, ATOMIC_MARKER, BLOCK_MARKER, INSERT_SYNC, REDUCE_MARKER,
    THREAD_MARKER, WARP_MARKER,
};
use crate::scop::ScopInfo;
use log::{debug, info};
use poly_rs::{NodeId, Schedule, ScheduleNodeType};
use std::collections::{BTreeMap, BTreeSet};

/// How a band is bound, chosen from the kernel kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingStrategy {
    /// Reduction handled by the reduce library; reduction axes take
    /// threads too
    Reduce,
    /// Tensor-core matmul; bound to the `warp_compute` configuration
    BatchMatmul,
    /// Tensor-core convolution; like `BatchMatmul` after the kernel
    /// reduction axes are split off
    Conv,
    /// Everything else: innermost coincident members take threads
    Elementwise,
}

/// Outcome of a thread binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadMapped {
    /// Node to log in the road map: the marker if one was inserted
    pub record: NodeId,
    /// Number of coordinates consumed
    pub mapped: usize,
}

impl MappingStrategy {
    fn thread_cfg(self, scop_info: &ScopInfo) -> MappingResult<MappingCfg> {
        match self {
            MappingStrategy::BatchMatmul | MappingStrategy::Conv => scop_info
                .user_config
                .replace_config(WARP_COMPUTE)
                .cloned()
                .ok_or_else(|| {
                    MappingError::Config(format!("replace config `{}` is missing", WARP_COMPUTE))
                }),
            _ => Ok(scop_info.user_config.thread_config()?.clone()),
        }
    }

    /// Bind inner members of the band at `node` to threads (or warps).
    ///
    /// With `reverse` the outermost bound member takes `x` instead of the
    /// innermost one.
    pub fn map_thread_helper(
        self,
        sch: &mut Schedule,
        node: NodeId,
        scop_info: &mut ScopInfo,
        reverse: bool,
    ) -> MappingResult<ThreadMapped> {
        let cfg = self.thread_cfg(scop_info)?;
        let node = match self {
            MappingStrategy::Conv => adjust_conv_schedule_tree_structure(sch, node)?,
            _ => node,
        };
        let band = sch.band(node)?;
        let n_member = band.n_member();

        // reduction axes are bound as well; otherwise only coincident ones
        let last = match self {
            MappingStrategy::Reduce => n_member,
            _ => band.count_consecutive_coincident(),
        };
        let count = last.min(cfg.bound());
        if count == 0 {
            debug!("Band {} has no member to bind to threads", node);
            return Ok(ThreadMapped {
                record: node,
                mapped: 0,
            });
        }

        let first = last - count;
        let target = isolate_members(sch, node, first, count)?;
        let assignments: Vec<(usize, usize)> = (0..count)
            .map(|j| (j, if reverse { j } else { count - 1 - j }))
            .collect();
        let marker = match self {
            MappingStrategy::BatchMatmul | MappingStrategy::Conv => WARP_MARKER,
            _ => THREAD_MARKER,
        };
        let mut bound = bind_band(sch, target, &cfg, &assignments, true, marker)?;
        let domain = sch.collect_domain(target);
        bound.mapping.fill_zero(&cfg, &domain, &BTreeSet::new());
        scop_info.record_mapping(bound.mark, bound.mapping);
        info!("{:?} mapping bound {} member(s) of band {} to {}", self, count, node, marker);

        Ok(ThreadMapped {
            record: bound.mark,
            mapped: count,
        })
    }

    /// Bind the first `n_block_map` members of the band at `node` to
    /// blocks. `map_idx_shift` reroutes a member to another coordinate.
    /// Returns the bound band.
    pub fn map_block_helper(
        self,
        sch: &mut Schedule,
        node: NodeId,
        scop_info: &mut ScopInfo,
        n_block_map: usize,
        check_extent: bool,
        map_idx_shift: &BTreeMap<usize, usize>,
    ) -> MappingResult<NodeId> {
        let cfg = scop_info.user_config.block_config()?.clone();
        let n = n_block_map.min(sch.band(node)?.n_member());
        let target = isolate_members(sch, node, 0, n)?;

        let mut assignments = Vec::with_capacity(n);
        for member in 0..n {
            let coord = map_idx_shift.get(&member).copied().unwrap_or(member);
            if coord >= cfg.bound() {
                return Err(MappingError::UnknownCoordinate(format!("block #{}", coord)));
            }
            assignments.push((member, coord));
        }
        let mut bound = bind_band(sch, target, &cfg, &assignments, check_extent, BLOCK_MARKER)?;
        let domain = sch.collect_domain(target);
        bound.mapping.fill_zero(&cfg, &domain, &BTreeSet::new());
        scop_info.record_mapping(bound.mark, bound.mapping);
        info!("{:?} mapping bound {} member(s) of band {} to blocks", self, n, node);
        Ok(target)
    }

    /// Convolution blocks cover each mapped member exactly: the block
    /// extents are reset to the members' value ranges before binding.
    pub fn reset_conv_block_mapping_config(
        self,
        sch: &mut Schedule,
        node: NodeId,
        scop_info: &mut ScopInfo,
        n_block_map: usize,
        check_extent: bool,
    ) -> MappingResult<NodeId> {
        let band = sch.band(node)?.clone();
        let domain = sch.collect_domain(node);
        let cfg = scop_info.user_config.block_config()?.clone();
        let mut extents: Vec<i64> = cfg.iter().map(|(_, e)| e).collect();
        for (member, extent) in extents.iter_mut().enumerate().take(n_block_map) {
            if let Some((lo, hi)) = band.member(member)?.value_range(&domain) {
                *extent = hi - lo + 1;
            }
        }
        *scop_info.user_config.block_config_mut()? = MappingCfg::blocks(&extents)?;
        debug!("Reset conv block config to {:?}", extents);
        self.map_block_helper(sch, node, scop_info, n_block_map, check_extent, &BTreeMap::new())
    }
}

/// A reduction axis bound to blocks leaves partial results to combine.
pub fn need_atomic_add(sch: &Schedule, band: NodeId, n_block_map: usize) -> MappingResult<bool> {
    let band = sch.band(band)?;
    Ok((0..n_block_map.min(band.n_member())).any(|i| !band.member_get_coincident(i)))
}

pub fn mark_atomic_add_tensor(sch: &mut Schedule, band: NodeId, scop_info: &mut ScopInfo) {
    sch.insert_mark(band, ATOMIC_MARKER);
    scop_info.atomic_add = true;
    info!("Band {} writes through atomic add", band);
}

/// Split leading non-coincident (kernel) members off a convolution band
/// and return the band left to map.
pub fn adjust_conv_schedule_tree_structure(
    sch: &mut Schedule,
    node: NodeId,
) -> MappingResult<NodeId> {
    let band = sch.band(node)?;
    let leading = (0..band.n_member())
        .take_while(|&i| !band.member_get_coincident(i))
        .count();
    if leading == 0 || leading == band.n_member() {
        return Ok(node);
    }
    debug!("Splitting {} kernel member(s) off conv band {}", leading, node);
    Ok(sch.band_split(node, leading)?)
}

/// Mark innermost bands with a reduction axis for the reduce library, and
/// the sequence above each of them for a barrier. Returns how many bands
/// were marked.
pub fn detect_and_mark_reduce(sch: &mut Schedule) -> usize {
    let reductions: Vec<NodeId> = sch
        .descendants(sch.root())
        .into_iter()
        .filter(|&n| match sch.band(n) {
            Ok(band) => {
                band.count_consecutive_coincident() < band.n_member()
                    && !sch.parent_is_mark(n, REDUCE_MARKER)
                    && sch.descendants(n)[1..]
                        .iter()
                        .all(|d| sch.node_type(*d) != ScheduleNodeType::Band)
            }
            Err(_) => false,
        })
        .collect();

    for &band in &reductions {
        sch.insert_mark(band, REDUCE_MARKER);
        let mut node = sch.parent(band);
        while let Some(n) = node {
            if sch.node_type(n) == ScheduleNodeType::Sequence {
                if !sch.parent_is_mark(n, INSERT_SYNC) {
                    sch.insert_mark(n, INSERT_SYNC);
                }
                break;
            }
            node = sch.parent(n);
        }
    }
    if !reductions.is_empty() {
        info!("Marked {} reduction band(s)", reductions.len());
    }
    reductions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MappingCfg, UserConfig};
    use crate::mapping::BLOCK_MARKER;
    use poly_rs::{Instance, Params};

    fn scop_info() -> ScopInfo {
        let config = UserConfig::default()
            .with_thread_config(MappingCfg::threads(&[16, 4]).unwrap())
            .with_block_config(MappingCfg::blocks(&[8, 8]).unwrap());
        ScopInfo::new(config, Default::default())
    }

    fn band_schedule(coincident: &str) -> (Schedule, NodeId) {
        let json = format!(
            r#"{{
            "domain": "{{ S[i, j, k] : 0 <= i < 8 and 0 <= j < 4 and 0 <= k < 16 }}",
            "child": {{
                "schedule": "[{{ S[i, j, k] -> [(i)] }}, {{ S[i, j, k] -> [(j)] }}, {{ S[i, j, k] -> [(k)] }}]",
                "permutable": 1,
                "coincident": {}
            }}
        }}"#,
            coincident
        );
        let sch = Schedule::read_from_json(&json, &Params::new()).unwrap();
        let band = sch.child(sch.root(), 0).unwrap();
        (sch, band)
    }

    #[test]
    fn test_elementwise_threads_take_inner_coincident_members() {
        let (mut sch, band) = band_schedule("[1, 1, 1]");
        let mut info = scop_info();
        let mapped = MappingStrategy::Elementwise
            .map_thread_helper(&mut sch, band, &mut info, false)
            .unwrap();
        assert_eq!(mapped.mapped, 2);

        let (_, mapping) = &info.upa_node_mapping[0];
        let s = Instance::new("S", vec![5, 3, 11]);
        assert_eq!(mapping.get("thread.x").unwrap().eval(&s), Some(11));
        assert_eq!(mapping.get("thread.y").unwrap().eval(&s), Some(3));
        // i stays an outer sequential loop
        assert_eq!(sch.band(band).unwrap().n_member(), 1);
    }

    #[test]
    fn test_reverse_and_non_coincident_tail() {
        let (mut sch, band) = band_schedule("[1, 1, 0]");
        let mut info = scop_info();
        let mapped = MappingStrategy::Elementwise
            .map_thread_helper(&mut sch, band, &mut info, true)
            .unwrap();
        assert_eq!(mapped.mapped, 2);
        let (_, mapping) = &info.upa_node_mapping[0];
        let s = Instance::new("S", vec![5, 3, 11]);
        assert_eq!(mapping.get("thread.x").unwrap().eval(&s), Some(5 % 16));
        assert_eq!(mapping.get("thread.y").unwrap().eval(&s), Some(3));
    }

    #[test]
    fn test_nothing_coincident_maps_nothing() {
        let (mut sch, band) = band_schedule("[0, 0, 0]");
        let mut info = scop_info();
        let mapped = MappingStrategy::Elementwise
            .map_thread_helper(&mut sch, band, &mut info, false)
            .unwrap();
        assert_eq!(mapped, ThreadMapped { record: band, mapped: 0 });
        assert!(info.upa_node_mapping.is_empty());
    }

    #[test]
    fn test_block_helper_with_shift() {
        let (mut sch, band) = band_schedule("[1, 1, 1]");
        let mut info = scop_info();
        let shift: BTreeMap<usize, usize> = [(0, 1), (1, 0)].into_iter().collect();
        let target = MappingStrategy::Elementwise
            .map_block_helper(&mut sch, band, &mut info, 1, false, &shift)
            .unwrap();
        assert_eq!(target, band);
        assert_eq!(sch.mark_name(sch.parent(band).unwrap()), Some(BLOCK_MARKER));
        let (_, mapping) = &info.upa_node_mapping[0];
        let s = Instance::new("S", vec![5, 3, 11]);
        assert_eq!(mapping.get("block.y").unwrap().eval(&s), Some(5));
        assert_eq!(mapping.get("block.x").unwrap().eval(&s), Some(0));
    }

    #[test]
    fn test_detect_reduce_and_atomic_add() {
        let (mut sch, band) = band_schedule("[1, 1, 0]");
        assert_eq!(detect_and_mark_reduce(&mut sch), 1);
        assert!(sch.parent_is_mark(band, REDUCE_MARKER));
        assert_eq!(detect_and_mark_reduce(&mut sch), 0, "Marking is idempotent");

        assert!(!need_atomic_add(&sch, band, 2).unwrap());
        assert!(need_atomic_add(&sch, band, 3).unwrap());
        let mut info = scop_info();
        mark_atomic_add_tensor(&mut sch, band, &mut info);
        assert!(info.atomic_add);
        assert!(sch.parent_is_mark(band, ATOMIC_MARKER));
    }

    #[test]
    fn test_conv_split_leading_kernel_members() {
        let (mut sch, band) = band_schedule("[0, 1, 1]");
        let inner = adjust_conv_schedule_tree_structure(&mut sch, band).unwrap();
        assert_ne!(inner, band);
        assert_eq!(sch.band(inner).unwrap().n_member(), 2);
        assert_eq!(sch.band(band).unwrap().n_member(), 1);
    }
}
