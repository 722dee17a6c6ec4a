//! Block mapping of the outermost permutable band
//!
//! Kernels are two nested bands: an outer `i` band that takes blocks and
//! an inner `j` band that takes threads.
//!
//! | Test | Situation |
//! |------|-----------|
//! | `test_outer_band_takes_blocks` | one coincident member, one block coordinate |
//! | `test_single_member_is_shifted_to_widest_block` | consider_coincidence off, no auto tiling |
//! | `test_auto_tiling_swaps_block_config` | consider_coincidence off, auto tiling |
//! | `test_non_permutable_outer_band_is_left_alone` | outer band not permutable |
//! | `test_reduction_axis_on_blocks_needs_atomic_add` | reduce library with atomic add |

use polymap::mapping::{ATOMIC_MARKER, BLOCK_MARKER, THREAD_MARKER};
use polymap::{MappingOuterBand, ScopFile, ScopInfo};
use poly_rs::{Instance, Schedule};

// ============================================================================
// Helpers
// ============================================================================

fn nested_bands(outer_permutable: u8, config: &str, analysis: &str) -> String {
    format!(
        r#"{{
        "schedule": {{
            "domain": "{{ S[i, j] : 0 <= i < 256 and 0 <= j < 32 }}",
            "child": {{
                "schedule": "[{{ S[i, j] -> [(i)] }}]",
                "permutable": {},
                "coincident": [1],
                "child": {{ "schedule": "[{{ S[i, j] -> [(j)] }}]", "permutable": 1, "coincident": [1] }}
            }}
        }},
        "config": {},
        "analysis": {}
    }}"#,
        outer_permutable, config, analysis
    )
}

fn run_scop(json: &str) -> (Schedule, ScopInfo) {
    let (sch, pass_info, mut scop_info) = ScopFile::from_json_str(json)
        .and_then(ScopFile::load)
        .expect("Failed to load scop");
    let sch = MappingOuterBand::new(&pass_info, &mut scop_info)
        .run(sch)
        .expect("Mapping failed");
    println!("{}", sch);
    (sch, scop_info)
}

fn marks(sch: &Schedule) -> Vec<String> {
    sch.descendants(sch.root())
        .into_iter()
        .filter_map(|n| sch.mark_name(n).map(str::to_string))
        .collect()
}

fn eval(scop_info: &ScopInfo, coord: &str, instance: &Instance) -> Option<i64> {
    scop_info
        .upa_node_mapping
        .iter()
        .find_map(|(_, mapping)| mapping.get(coord))
        .and_then(|upa| upa.eval(instance))
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_outer_band_takes_blocks() {
    let (sch, scop_info) = run_scop(&nested_bands(
        1,
        r#"{ "thread_config": [32], "block_config": [256] }"#,
        "{}",
    ));

    let top = sch.child(sch.root(), 0).unwrap();
    assert_eq!(sch.mark_name(top), Some(BLOCK_MARKER));
    assert!(marks(&sch).contains(&THREAD_MARKER.to_string()));

    let s = Instance::new("S", vec![100, 5]);
    assert_eq!(eval(&scop_info, "block.x", &s), Some(100));
    assert_eq!(eval(&scop_info, "thread.x", &s), Some(5));
    assert!(scop_info.block_shift.is_empty());
}

#[test]
fn test_single_member_is_shifted_to_widest_block() {
    let (_, scop_info) = run_scop(&nested_bands(
        1,
        r#"{ "thread_config": [32], "block_config": [1, 1024], "consider_coincidence": false }"#,
        "{}",
    ));

    let expected = [(0, 1), (1, 0)].into_iter().collect();
    assert_eq!(scop_info.block_shift, expected);

    let s = Instance::new("S", vec![200, 7]);
    assert_eq!(eval(&scop_info, "block.y", &s), Some(200));
    assert_eq!(eval(&scop_info, "block.x", &s), Some(0));
}

#[test]
fn test_auto_tiling_swaps_block_config() {
    let (_, scop_info) = run_scop(&nested_bands(
        1,
        r#"{ "thread_config": [32], "block_config": [1, 1024], "consider_coincidence": false }"#,
        r#"{ "enabled_auto_tiling": true }"#,
    ));

    assert!(scop_info.block_shift.is_empty());
    let block_cfg = scop_info.user_config.block_config().unwrap();
    assert_eq!(block_cfg.get_at(0), Some(("block.x", 1024)));
    assert_eq!(block_cfg.get_at(1), Some(("block.y", 1)));

    let s = Instance::new("S", vec![200, 7]);
    assert_eq!(eval(&scop_info, "block.x", &s), Some(200));
}

#[test]
fn test_non_permutable_outer_band_is_left_alone() {
    let (sch, scop_info) = run_scop(&nested_bands(
        0,
        r#"{ "thread_config": [32], "block_config": [256] }"#,
        "{}",
    ));

    assert!(!marks(&sch).contains(&BLOCK_MARKER.to_string()));
    assert_eq!(scop_info.upa_node_mapping.len(), 1, "Only the thread mapping");
}

#[test]
fn test_reduction_axis_on_blocks_needs_atomic_add() {
    // k is the reduction axis and stays outermost
    let json = r#"{
        "schedule": {
            "domain": "{ S[i, k] : 0 <= i < 8 and 0 <= k < 64 }",
            "child": {
                "schedule": "[{ S[i, k] -> [(k)] }, { S[i, k] -> [(i)] }]",
                "permutable": 1,
                "coincident": [0, 1]
            }
        },
        "config": {
            "thread_config": [64],
            "block_config": [8, 8],
            "enable_akg_reduce_lib": true,
            "enable_atomic_add": true
        }
    }"#;
    let (sch, scop_info) = run_scop(json);

    assert!(scop_info.atomic_add);
    let names = marks(&sch);
    for expected in ["reduce_marker", ATOMIC_MARKER, BLOCK_MARKER, THREAD_MARKER] {
        assert!(names.contains(&expected.to_string()), "Missing mark {}", expected);
    }

    let s = Instance::new("S", vec![3, 21]);
    assert_eq!(eval(&scop_info, "thread.x", &s), Some(3));
    assert_eq!(eval(&scop_info, "block.x", &s), Some(21 % 8));
    assert_eq!(eval(&scop_info, "block.y", &s), Some(0));
}
