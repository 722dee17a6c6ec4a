//! Thread mapping and barrier insertion on sequences
//!
//! | Test | Kernel | Expected barriers |
//! |------|--------|-------------------|
//! | `test_cross_warp_dependence_needs_block_barrier` | S0 → S1 on mirrored threads | one block barrier after child 0 |
//! | `test_same_warp_dependence_needs_warp_barrier` | S0 → S1 on the neighbouring thread | one warp barrier after child 0 |
//! | `test_same_thread_dependence_needs_nothing` | S0 → S1 on the same thread | none |
//! | `test_loop_carried_ring_needs_every_barrier` | 4 children in a loop, each feeding the next | four block barriers |
//! | `test_unmapped_child_is_reported` | one child kept out of thread mapping | `UnmappedDomain` |
//! | `test_unbound_child_gets_zero_threads` | one child without coincident members | all-zero thread mapping |

use polymap::mapping::{THREAD_MARKER, WARP_MARKER};
use polymap::{MappingError, MappingOuterBand, ScopFile, SyncLevel};
use poly_rs::{Instance, NodeKind, Schedule, ScheduleNodeType};

fn run_scop(json: &str) -> Result<(Schedule, polymap::ScopInfo), MappingError> {
    let (sch, pass_info, mut scop_info) = ScopFile::from_json_str(json)?.load()?;
    let sch = MappingOuterBand::new(&pass_info, &mut scop_info).run(sch)?;
    Ok((sch, scop_info))
}

fn three_children(dependences: &str) -> String {
    format!(
        r#"{{
        "schedule": {{
            "domain": "{{ S0[i] : 0 <= i < 64; S1[i] : 0 <= i < 64; S2[i] : 0 <= i < 64 }}",
            "child": {{ "sequence": [
                {{ "filter": "{{ S0[i] }}", "child": {{ "schedule": "[{{ S0[i] -> [(i)] }}]", "permutable": 1, "coincident": [1] }} }},
                {{ "filter": "{{ S1[i] }}", "child": {{ "schedule": "[{{ S1[i] -> [(i)] }}]", "permutable": 1, "coincident": [1] }} }},
                {{ "filter": "{{ S2[i] }}", "child": {{ "schedule": "[{{ S2[i] -> [(i)] }}]", "permutable": 1, "coincident": [1] }} }}
            ] }}
        }},
        "dependences": "{}",
        "config": {{ "thread_config": [64], "block_config": [1] }}
    }}"#,
        dependences
    )
}

#[test]
fn test_cross_warp_dependence_needs_block_barrier() {
    let (sch, scop_info) = run_scop(&three_children("{ S0[i] -> S1[63 - i] }")).unwrap();
    println!("{}", sch);

    let syncs = scop_info.sync_manager.inserted();
    assert_eq!(syncs.len(), 1, "Exactly one barrier expected: {:?}", syncs);
    assert_eq!(syncs[0].level, SyncLevel::Block);
    assert_eq!(syncs[0].pos, 0);

    // the barrier runs right after the first child
    let seq = sch.child(sch.root(), 0).unwrap();
    let first = sch.child(seq, 0).unwrap();
    let ext = sch.child(first, 0).unwrap();
    assert_eq!(sch.node_type(ext), ScheduleNodeType::Extension);
    let inner_seq = sch.child(ext, 0).unwrap();
    let barrier_filter = sch.child(inner_seq, 1).unwrap();
    let barrier = Instance::new(syncs[0].statement.clone(), vec![]);
    assert!(sch.filter(barrier_filter).unwrap().contains(&barrier));
}

#[test]
fn test_same_warp_dependence_needs_warp_barrier() {
    let (_, scop_info) = run_scop(&three_children("{ S0[i] -> S1[i + 1] : i < 31 }")).unwrap();
    let syncs = scop_info.sync_manager.inserted();
    assert_eq!(syncs.len(), 1, "Exactly one barrier expected: {:?}", syncs);
    assert_eq!(syncs[0].level, SyncLevel::Warp);
    assert_eq!(syncs[0].pos, 0);
}

#[test]
fn test_same_thread_dependence_needs_nothing() {
    let (sch, scop_info) = run_scop(&three_children("{ S0[i] -> S1[i]; S1[i] -> S2[i] }")).unwrap();
    assert!(scop_info.sync_manager.inserted().is_empty());

    // every child is still bound to threads
    let seq = sch.child(sch.root(), 0).unwrap();
    for &filter in sch.children(seq) {
        let first = sch.child(filter, 0).unwrap();
        assert_eq!(sch.mark_name(first), Some(THREAD_MARKER));
    }
    assert_eq!(scop_info.upa_node_mapping.len(), 3);
}

#[test]
fn test_loop_carried_ring_needs_every_barrier() {
    let json = r#"{
        "schedule": {
            "domain": "{ S0[t, i] : 0 <= t < 2 and 0 <= i < 64; S1[t, i] : 0 <= t < 2 and 0 <= i < 64; S2[t, i] : 0 <= t < 2 and 0 <= i < 64; S3[t, i] : 0 <= t < 2 and 0 <= i < 64 }",
            "child": {
                "schedule": "[{ S0[t, i] -> [(t)]; S1[t, i] -> [(t)]; S2[t, i] -> [(t)]; S3[t, i] -> [(t)] }]",
                "permutable": 0,
                "coincident": [0],
                "child": { "sequence": [
                    { "filter": "{ S0[t, i] }", "child": { "schedule": "[{ S0[t, i] -> [(i)] }]", "permutable": 1, "coincident": [1] } },
                    { "filter": "{ S1[t, i] }", "child": { "schedule": "[{ S1[t, i] -> [(i)] }]", "permutable": 1, "coincident": [1] } },
                    { "filter": "{ S2[t, i] }", "child": { "schedule": "[{ S2[t, i] -> [(i)] }]", "permutable": 1, "coincident": [1] } },
                    { "filter": "{ S3[t, i] }", "child": { "schedule": "[{ S3[t, i] -> [(i)] }]", "permutable": 1, "coincident": [1] } }
                ] }
            }
        },
        "dependences": "{ S0[t, i] -> S1[t, 63 - i]; S1[t, i] -> S2[t, 63 - i]; S2[t, i] -> S3[t, 63 - i]; S3[t, i] -> S0[t + 1, 63 - i] }",
        "config": { "thread_config": [64], "block_config": [1] }
    }"#;
    let (_, scop_info) = run_scop(json).unwrap();

    let mut placed: Vec<(SyncLevel, usize)> = scop_info
        .sync_manager
        .inserted()
        .iter()
        .map(|s| (s.level, s.pos))
        .collect();
    placed.sort();
    println!("Barriers: {:?}", placed);
    assert_eq!(
        placed,
        vec![
            (SyncLevel::Block, 0),
            (SyncLevel::Block, 1),
            (SyncLevel::Block, 2),
            (SyncLevel::Block, 3)
        ]
    );
}

#[test]
fn test_unmapped_child_is_reported() {
    let json = r#"{
        "schedule": {
            "domain": "{ S0[i] : 0 <= i < 32; S1[i] : 0 <= i < 32 }",
            "child": { "sequence": [
                { "filter": "{ S0[i] }", "child": { "schedule": "[{ S0[i] -> [(i)] }]", "permutable": 1, "coincident": [1] } },
                { "filter": "{ S1[i] }", "child": { "mark": "preserve_dimension", "child":
                    { "schedule": "[{ S1[i] -> [(i)] }]", "permutable": 1, "coincident": [1] } } }
            ] }
        },
        "dependences": "{ S0[i] -> S1[i] }",
        "config": { "thread_config": [32] }
    }"#;
    match run_scop(json) {
        Err(MappingError::UnmappedDomain(rest)) => {
            println!("Unmapped: {}", rest);
            assert!(rest.contains("S1"), "S1 is the unmapped statement");
        }
        other => panic!("Expected UnmappedDomain, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_unbound_child_gets_zero_threads() {
    let json = r#"{
        "schedule": {
            "domain": "{ S0[i, j] : 0 <= i < 4 and 0 <= j < 32; S1[k] : 0 <= k < 8 }",
            "child": { "sequence": [
                { "filter": "{ S0[i, j] }", "child": { "schedule": "[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]", "permutable": 1, "coincident": [1, 1] } },
                { "filter": "{ S1[k] }", "child": { "schedule": "[{ S1[k] -> [(k)] }]", "permutable": 1, "coincident": [0] } }
            ] }
        },
        "config": { "thread_config": [32, 4] }
    }"#;
    let (sch, scop_info) = run_scop(json).unwrap();

    assert_eq!(scop_info.upa_node_mapping.len(), 2);
    for (node, mapping) in &scop_info.upa_node_mapping {
        assert!(matches!(sch.kind(*node), NodeKind::Mark(_)));
        assert!(mapping.contains("thread.x") && mapping.contains("thread.y"));
    }
    let (_, zeros) = &scop_info.upa_node_mapping[1];
    let s1 = Instance::new("S1", vec![5]);
    assert_eq!(zeros.get("thread.x").unwrap().eval(&s1), Some(0));
    assert_eq!(zeros.get("thread.y").unwrap().eval(&s1), Some(0));

    let (_, bound) = &scop_info.upa_node_mapping[0];
    let s0 = Instance::new("S0", vec![3, 17]);
    assert_eq!(bound.get("thread.x").unwrap().eval(&s0), Some(17));
    assert_eq!(bound.get("thread.y").unwrap().eval(&s0), Some(3));
}

#[test]
fn test_tensor_core_child_maps_to_warps() {
    let json = r#"{
        "schedule": {
            "domain": "{ S0[i, j] : 0 <= i < 2 and 0 <= j < 2; S1[k] : 0 <= k < 32 }",
            "child": { "sequence": [
                { "filter": "{ S0[i, j] }", "child": { "mark": "map_to_warp", "child":
                    { "schedule": "[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]", "permutable": 1, "coincident": [1, 1] } } },
                { "filter": "{ S1[k] }", "child": { "schedule": "[{ S1[k] -> [(k)] }]", "permutable": 1, "coincident": [1] } }
            ] }
        },
        "config": {
            "thread_config": [32],
            "replace_config": { "warp_compute": [2, 2] },
            "enable_tensor_core_use_poly": true
        }
    }"#;
    let (sch, scop_info) = run_scop(json).unwrap();
    println!("{}", sch);

    let marks: Vec<&str> = sch
        .descendants(sch.root())
        .into_iter()
        .filter_map(|n| sch.mark_name(n))
        .collect();
    assert!(!marks.contains(&"map_to_warp"), "The warp request is consumed");
    assert!(marks.contains(&WARP_MARKER));
    assert!(marks.contains(&THREAD_MARKER));

    let (_, warp) = &scop_info.upa_node_mapping[0];
    let s0 = Instance::new("S0", vec![1, 0]);
    assert_eq!(warp.get("warp.x").unwrap().eval(&s0), Some(0));
    assert_eq!(warp.get("warp.y").unwrap().eval(&s0), Some(1));
    assert!(scop_info.sync_manager.inserted().is_empty());
}
