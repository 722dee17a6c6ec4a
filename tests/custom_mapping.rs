//! Kernels that come with their own member → coordinate tables

use polymap::mapping::{BLOCK_MARKER, THREAD_MARKER};
use polymap::{MappingError, MappingOuterBand, ScopFile};
use poly_rs::Instance;

const TILED_KERNEL: &str = r#"{
    "domain": "{ S[i, j] : 0 <= i < 128 and 0 <= j < 32 }",
    "child": {
        "schedule": "[{ S[i, j] -> [(floor(i / 8))] }]",
        "permutable": 1,
        "coincident": [1],
        "child": {
            "schedule": "[{ S[i, j] -> [(i mod 8)] }, { S[i, j] -> [(j)] }]",
            "permutable": 1,
            "coincident": [1, 1]
        }
    }
}"#;

fn scop(config: &str) -> String {
    format!(
        r#"{{ "schedule": {}, "config": {}, "analysis": {{ "is_custom_mapping": true, "is_outer_block_mapping": true }} }}"#,
        TILED_KERNEL, config
    )
}

#[test]
fn test_tables_decide_coordinates() {
    let json = scop(
        r#"{
        "thread_config": [32, 8],
        "block_config": [16],
        "custom_inner_mapping": { "0": "thread.y", "1": "thread.x" },
        "custom_outer_mapping": { "0": "block.x" }
    }"#,
    );
    let (sch, pass_info, mut scop_info) = ScopFile::from_json_str(&json)
        .and_then(ScopFile::load)
        .unwrap();
    let sch = MappingOuterBand::new(&pass_info, &mut scop_info)
        .run(sch)
        .unwrap();
    println!("{}", sch);

    assert_eq!(scop_info.upa_node_mapping.len(), 2);
    let (thread_mark, threads) = &scop_info.upa_node_mapping[0];
    let (block_mark, blocks) = &scop_info.upa_node_mapping[1];
    assert_eq!(sch.mark_name(*thread_mark), Some(THREAD_MARKER));
    assert_eq!(sch.mark_name(*block_mark), Some(BLOCK_MARKER));

    let s = Instance::new("S", vec![78, 5]);
    assert_eq!(threads.get("thread.y").unwrap().eval(&s), Some(78 % 8));
    assert_eq!(threads.get("thread.x").unwrap().eval(&s), Some(5));
    assert_eq!(blocks.get("block.x").unwrap().eval(&s), Some(78 / 8));
    assert!(!threads.contains("block.x"), "Outer coordinates stay off the inner band");
}

#[test]
fn test_missing_inner_table_is_rejected() {
    let json = scop(r#"{ "thread_config": [32, 8], "block_config": [16] }"#);
    let (sch, pass_info, mut scop_info) = ScopFile::from_json_str(&json)
        .and_then(ScopFile::load)
        .unwrap();
    let result = MappingOuterBand::new(&pass_info, &mut scop_info).run(sch);
    assert!(
        matches!(result, Err(MappingError::EmptyCustomMapping("inner"))),
        "Expected an empty inner table error"
    );
}

#[test]
fn test_unknown_coordinate_in_table_is_rejected() {
    let json = scop(
        r#"{
        "thread_config": [32, 8],
        "block_config": [16],
        "custom_inner_mapping": { "0": "thread.w" },
        "custom_outer_mapping": { "0": "block.x" }
    }"#,
    );
    let err = ScopFile::from_json_str(&json).unwrap_err();
    println!("Rejected: {}", err);
    assert!(err.to_string().contains("thread.w"));
}
