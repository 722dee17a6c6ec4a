//! Kernel description loaded from disk and the state a pass accumulates.
//!
//! A scop file bundles everything the mapping pass reads:
//!
//! ```json
//! {
//!   "params": { "N": 128 },
//!   "schedule": { "domain": "[N] -> { S0[i] : 0 <= i < N }", "child": { ... } },
//!   "dependences": "[N] -> { S0[i] -> S1[i] }",
//!   "config": { "thread_config": [32], "block_config": [4] },
//!   "analysis": { "is_custom_mapping": false }
//! }
//! ```

use crate::config::{AnalysisResult, UserConfig};
use crate::error::MappingResult;
use crate::mapping::Mapping;
use crate::sync::{InsertedSync, SyncManager};
use log::info;
use poly_rs::{NodeId, Params, Schedule, TreeSpec, UnionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only facts shared by all passes.
#[derive(Clone, Debug, Default)]
pub struct PassInfo {
    /// Pairs of instances that must run in order
    pub dependences: UnionMap,
}

/// Mutable per-kernel state.
#[derive(Clone, Debug, Default)]
pub struct ScopInfo {
    pub user_config: UserConfig,
    pub analysis_result: AnalysisResult,
    /// Every binding performed so far, keyed by the marker above the band
    pub upa_node_mapping: Vec<(NodeId, Mapping)>,
    pub sync_manager: SyncManager,
    /// Block member index -> block coordinate, when block mapping shifted
    pub block_shift: BTreeMap<usize, usize>,
    /// Set when a reduction axis was bound to blocks
    pub atomic_add: bool,
}

impl ScopInfo {
    pub fn new(user_config: UserConfig, analysis_result: AnalysisResult) -> Self {
        ScopInfo {
            user_config,
            analysis_result,
            ..ScopInfo::default()
        }
    }

    pub fn record_mapping(&mut self, node: NodeId, mapping: Mapping) {
        self.upa_node_mapping.push((node, mapping));
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScopFile {
    #[serde(default)]
    pub params: Params,
    pub schedule: TreeSpec,
    #[serde(default)]
    pub dependences: Option<String>,
    #[serde(default)]
    pub config: UserConfig,
    #[serde(default)]
    pub analysis: AnalysisResult,
}

impl ScopFile {
    pub fn from_json_str(text: &str) -> MappingResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> MappingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Instantiate the tree and the dependences.
    pub fn load(self) -> MappingResult<(Schedule, PassInfo, ScopInfo)> {
        let sch = Schedule::from_tree_spec(&self.schedule, &self.params)?;
        let dependences = match &self.dependences {
            Some(text) => UnionMap::read_within_with_params(text, &sch.domain(), &self.params)?,
            None => UnionMap::empty(),
        };
        info!(
            "Loaded scop: {} instances, {} dependence pairs",
            sch.domain().card(),
            dependences.len()
        );
        Ok((
            sch,
            PassInfo { dependences },
            ScopInfo::new(self.config, self.analysis),
        ))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MappingEntry {
    pub node: usize,
    pub coords: BTreeMap<String, String>,
}

/// What a pass did, for printing.
#[derive(Clone, Debug, Serialize)]
pub struct MappingReport {
    pub schedule: String,
    pub mappings: Vec<MappingEntry>,
    pub syncs: Vec<InsertedSync>,
    pub block_shift: BTreeMap<usize, usize>,
    pub atomic_add: bool,
}

impl MappingReport {
    pub fn new(sch: &Schedule, scop_info: &ScopInfo) -> Self {
        let mappings = scop_info
            .upa_node_mapping
            .iter()
            .map(|(node, mapping)| MappingEntry {
                node: node.index(),
                coords: mapping
                    .iter()
                    .map(|(name, upa)| (name.to_string(), upa.to_string()))
                    .collect(),
            })
            .collect();
        MappingReport {
            schedule: sch.to_string(),
            mappings,
            syncs: scop_info.sync_manager.inserted().to_vec(),
            block_shift: scop_info.block_shift.clone(),
            atomic_add: scop_info.atomic_add,
        }
    }

    pub fn to_json(&self) -> MappingResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_scop() {
        let scop = ScopFile::from_json_str(
            r#"{
            "params": { "N": 8 },
            "schedule": {
                "domain": "[N] -> { S0[i] : 0 <= i < N; S1[i] : 0 <= i < N }",
                "child": { "schedule": "[N] -> [{ S0[i] -> [(i)]; S1[i] -> [(i)] }]" }
            },
            "dependences": "[N] -> { S0[i] -> S1[i + 1] }",
            "config": { "thread_config": [8] }
        }"#,
        )
        .unwrap();
        let (sch, pass_info, scop_info) = scop.load().unwrap();
        assert_eq!(sch.domain().card(), 16);
        // i + 1 < N drops the last pair
        assert_eq!(pass_info.dependences.len(), 7);
        assert_eq!(scop_info.user_config.thread_config().unwrap().bound(), 1);
        assert!(!scop_info.analysis_result.is_custom_mapping);
    }

    #[test]
    fn test_missing_schedule_is_rejected() {
        assert!(ScopFile::from_json_str(r#"{ "params": {} }"#).is_err());
    }
}
