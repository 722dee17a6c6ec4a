//! Thread and warp projections of a subtree's domain.

use crate::config::MappingCfg;
use crate::mapping::{zero_mapping, Mapping};
use log::trace;
use poly_rs::{AffExpr, MultiAff, MultiUnionPwAff, NodeId, PolyResult, Schedule};

/// Threads per warp
pub const WARP_SIZE: i64 = 32;

/// Thread coordinates of every instance mapped below `node`, one member
/// per coordinate of `cfg` in declaration order.
///
/// Only mappings that bind some coordinate of `cfg` contribute; their
/// unbound coordinates read as 0.
pub fn map_domain_to_thread(
    sch: &Schedule,
    node: NodeId,
    cfg: &MappingCfg,
    upa_node_mapping: &[(NodeId, Mapping)],
) -> MultiUnionPwAff {
    let mut result = MultiUnionPwAff::default();
    for (mapped, mapping) in upa_node_mapping {
        if !sch.is_descendant_of(*mapped, node) || !mapping.uses(cfg) {
            continue;
        }
        let zeros = zero_mapping(cfg, &sch.collect_domain(*mapped));
        let members = cfg
            .iter()
            .filter_map(|(name, _)| mapping.get(name).or_else(|| zeros.get(name)).cloned())
            .collect();
        trace!("Thread projection of {} from mapping at {}", node, mapped);
        result = result.union_add(&MultiUnionPwAff::new(members));
    }
    result
}

/// Linearize the thread coordinates (x fastest) and divide by the warp
/// size: `floor((x + ext_x * (y + ext_y * z)) / WARP_SIZE)`.
pub fn map_domain_to_warp(cfg: &MappingCfg, thread: &MultiUnionPwAff) -> PolyResult<MultiUnionPwAff> {
    let mut linear = AffExpr::constant(0);
    for pos in (0..cfg.bound()).rev() {
        let extent = cfg.get_at(pos).map_or(1, |(_, e)| e);
        linear = linear.scale(extent).add(AffExpr::dim(pos));
    }
    let warp = MultiAff::new(thread.size(), vec![linear.floor_div(WARP_SIZE)]);
    thread.apply(&warp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{bind_band, THREAD_MARKER};
    use poly_rs::{Instance, Params};

    #[test]
    fn test_warp_of_linearized_thread() {
        let json = r#"{
            "domain": "{ S[i, j] : 0 <= i < 4 and 0 <= j < 64 }",
            "child": {
                "schedule": "[{ S[i, j] -> [(i)] }, { S[i, j] -> [(j)] }]",
                "permutable": 1,
                "coincident": [1, 1]
            }
        }"#;
        let mut sch = Schedule::read_from_json(json, &Params::new()).unwrap();
        let band = sch.child(sch.root(), 0).unwrap();
        let cfg = MappingCfg::threads(&[64, 4]).unwrap();
        let mapped = bind_band(&mut sch, band, &cfg, &[(1, 0), (0, 1)], true, THREAD_MARKER).unwrap();
        let records = vec![(mapped.mark, mapped.mapping)];

        let thread = map_domain_to_thread(&sch, sch.root(), &cfg, &records);
        assert_eq!(thread.size(), 2);
        let s = Instance::new("S", vec![1, 40]);
        assert_eq!(thread.eval(&s), Some(vec![40, 1]));

        let warp = map_domain_to_warp(&cfg, &thread).unwrap();
        // (40 + 64 * 1) / 32
        assert_eq!(warp.eval(&s), Some(vec![3]));
        assert_eq!(warp.eval(&Instance::new("S", vec![0, 31])), Some(vec![0]));
    }

    #[test]
    fn test_unrelated_mappings_are_skipped() {
        let json = r#"{ "domain": "{ S[i] : 0 <= i < 8 }",
                        "child": { "schedule": "[{ S[i] -> [(i)] }]", "permutable": 1, "coincident": [1] } }"#;
        let mut sch = Schedule::read_from_json(json, &Params::new()).unwrap();
        let band = sch.child(sch.root(), 0).unwrap();
        let blocks = MappingCfg::blocks(&[8]).unwrap();
        let mapped = bind_band(&mut sch, band, &blocks, &[(0, 0)], true, "block_marker").unwrap();
        let records = vec![(mapped.mark, mapped.mapping)];

        let threads = MappingCfg::threads(&[8]).unwrap();
        assert_eq!(map_domain_to_thread(&sch, sch.root(), &threads, &records).size(), 0);
    }
}
