//! Mapping configuration
//!
//! The thread and block configurations come from the tiling stage; the
//! switches and custom coordinate tables come from the user. Both are
//! read-only during a pass, except for [`MappingCfg::swap_config`] which
//! block mapping uses to put the largest extent on the mapped coordinate.
//!
//! Configuration files are JSON:
//!
//! ```json
//! {
//!   "thread_config": [32, 4],
//!   "block_config": [128, 1],
//!   "replace_config": { "warp_compute": [2, 2] },
//!   "enable_akg_reduce_lib": true,
//!   "custom_inner_mapping": { "0": "thread.x" }
//! }
//! ```

use crate::error::{MappingError, MappingResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Hardware limit on thread, block and warp coordinates
pub const MAX_DIM: usize = 3;

/// Key of the tensor-core warp configuration in `replace_config`
pub const WARP_COMPUTE: &str = "warp_compute";

const THREAD_NAMES: [&str; MAX_DIM] = ["thread.x", "thread.y", "thread.z"];
const BLOCK_NAMES: [&str; MAX_DIM] = ["block.x", "block.y", "block.z"];
const WARP_NAMES: [&str; MAX_DIM] = ["warp.x", "warp.y", "warp.z"];

/// Ordered list of `(coordinate, extent)` pairs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MappingCfg {
    coords: Vec<(String, i64)>,
}

impl MappingCfg {
    pub fn new(coords: Vec<(String, i64)>) -> MappingResult<Self> {
        if coords.len() > MAX_DIM {
            return Err(MappingError::Config(format!(
                "at most {} coordinates can be mapped, got {}",
                MAX_DIM,
                coords.len()
            )));
        }
        if let Some((name, extent)) = coords.iter().find(|(_, e)| *e <= 0) {
            return Err(MappingError::NonPositiveExtent {
                name: name.clone(),
                extent: *extent,
            });
        }
        Ok(MappingCfg { coords })
    }

    fn named(names: &[&str; MAX_DIM], extents: &[i64]) -> MappingResult<Self> {
        if extents.len() > MAX_DIM {
            return Err(MappingError::Config(format!(
                "at most {} coordinates can be mapped, got {}",
                MAX_DIM,
                extents.len()
            )));
        }
        let coords = names
            .iter()
            .zip(extents)
            .map(|(n, e)| (n.to_string(), *e))
            .collect();
        MappingCfg::new(coords)
    }

    /// `thread.x`, `thread.y`, `thread.z`
    pub fn threads(extents: &[i64]) -> MappingResult<Self> {
        Self::named(&THREAD_NAMES, extents)
    }

    /// `block.x`, `block.y`, `block.z`
    pub fn blocks(extents: &[i64]) -> MappingResult<Self> {
        Self::named(&BLOCK_NAMES, extents)
    }

    /// `warp.x`, `warp.y`, `warp.z`
    pub fn warps(extents: &[i64]) -> MappingResult<Self> {
        Self::named(&WARP_NAMES, extents)
    }

    /// Number of declared coordinates
    pub fn bound(&self) -> usize {
        self.coords.len()
    }

    pub fn max_dim(&self) -> usize {
        MAX_DIM
    }

    pub fn get_at(&self, pos: usize) -> Option<(&str, i64)> {
        self.coords.get(pos).map(|(n, e)| (n.as_str(), *e))
    }

    /// Position and extent of a coordinate
    pub fn get_by_name(&self, name: &str) -> Option<(usize, i64)> {
        self.coords
            .iter()
            .position(|(n, _)| n == name)
            .map(|pos| (pos, self.coords[pos].1))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.coords.iter().map(|(n, e)| (n.as_str(), *e))
    }

    /// Exchange the extents of two slots; names stay in place.
    pub fn swap_config(&mut self, a: usize, b: usize) {
        if a >= self.coords.len() || b >= self.coords.len() || a == b {
            return;
        }
        let ea = self.coords[a].1;
        self.coords[a].1 = self.coords[b].1;
        self.coords[b].1 = ea;
        debug!("Swapped mapping config slots {} and {}", a, b);
    }
}

/// Which axis a reduction runs along.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceDirection {
    #[default]
    Unknown,
    X,
    Y,
    All,
}

/// Facts about the kernel computed by earlier analysis.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub is_custom_mapping: bool,
    pub is_outer_block_mapping: bool,
    pub enabled_auto_tiling: bool,
    pub reduce_direction: ReduceDirection,
}

/// JSON form of [`UserConfig`]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct UserConfigSpec {
    thread_config: Option<Vec<i64>>,
    block_config: Option<Vec<i64>>,
    replace_config: BTreeMap<String, Vec<i64>>,
    enable_akg_reduce_lib: bool,
    enable_tensor_core_use_poly: bool,
    enable_conv_tensor_core: bool,
    enable_vectorization: bool,
    enable_atomic_add: bool,
    enable_stitch_fusion: bool,
    consider_coincidence: Option<bool>,
    custom_inner_mapping: BTreeMap<usize, String>,
    custom_outer_mapping: BTreeMap<usize, String>,
}

/// User switches and the mapping configurations of one kernel.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "UserConfigSpec")]
pub struct UserConfig {
    thread_cfg: Option<MappingCfg>,
    block_cfg: Option<MappingCfg>,
    replace_cfg: BTreeMap<String, MappingCfg>,
    pub enable_akg_reduce_lib: bool,
    pub enable_tensor_core_use_poly: bool,
    pub enable_conv_tensor_core: bool,
    pub enable_vectorization: bool,
    pub enable_atomic_add: bool,
    pub enable_stitch_fusion: bool,
    /// Block mapping counts only coincident members when set
    pub consider_coincidence: bool,
    /// Band member index -> thread coordinate name
    pub custom_inner_mapping: BTreeMap<usize, String>,
    /// Band member index -> block (or thread) coordinate name
    pub custom_outer_mapping: BTreeMap<usize, String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            thread_cfg: None,
            block_cfg: None,
            replace_cfg: BTreeMap::new(),
            enable_akg_reduce_lib: false,
            enable_tensor_core_use_poly: false,
            enable_conv_tensor_core: false,
            enable_vectorization: false,
            enable_atomic_add: false,
            enable_stitch_fusion: false,
            consider_coincidence: true,
            custom_inner_mapping: BTreeMap::new(),
            custom_outer_mapping: BTreeMap::new(),
        }
    }
}

impl TryFrom<UserConfigSpec> for UserConfig {
    type Error = MappingError;

    fn try_from(spec: UserConfigSpec) -> MappingResult<Self> {
        let thread_cfg = spec
            .thread_config
            .as_deref()
            .map(MappingCfg::threads)
            .transpose()?;
        let block_cfg = spec
            .block_config
            .as_deref()
            .map(MappingCfg::blocks)
            .transpose()?;
        let mut replace_cfg = BTreeMap::new();
        for (name, extents) in &spec.replace_config {
            replace_cfg.insert(name.clone(), MappingCfg::warps(extents)?);
        }

        let config = UserConfig {
            thread_cfg,
            block_cfg,
            replace_cfg,
            enable_akg_reduce_lib: spec.enable_akg_reduce_lib,
            enable_tensor_core_use_poly: spec.enable_tensor_core_use_poly,
            enable_conv_tensor_core: spec.enable_conv_tensor_core,
            enable_vectorization: spec.enable_vectorization,
            enable_atomic_add: spec.enable_atomic_add,
            enable_stitch_fusion: spec.enable_stitch_fusion,
            consider_coincidence: spec.consider_coincidence.unwrap_or(true),
            custom_inner_mapping: spec.custom_inner_mapping,
            custom_outer_mapping: spec.custom_outer_mapping,
        };
        config.validate_custom_tables()?;
        Ok(config)
    }
}

impl UserConfig {
    pub fn from_json_str(text: &str) -> MappingResult<Self> {
        let config: UserConfig = serde_json::from_str(text)?;
        debug!(
            "Loaded user config: threads={:?}, blocks={:?}",
            config.thread_cfg, config.block_cfg
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> MappingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_thread_config(mut self, cfg: MappingCfg) -> Self {
        self.thread_cfg = Some(cfg);
        self
    }

    pub fn with_block_config(mut self, cfg: MappingCfg) -> Self {
        self.block_cfg = Some(cfg);
        self
    }

    pub fn with_replace_config(mut self, name: &str, cfg: MappingCfg) -> Self {
        self.replace_cfg.insert(name.to_string(), cfg);
        self
    }

    pub fn thread_config(&self) -> MappingResult<&MappingCfg> {
        self.thread_cfg
            .as_ref()
            .ok_or(MappingError::NullConfig("thread"))
    }

    pub fn block_config(&self) -> MappingResult<&MappingCfg> {
        self.block_cfg.as_ref().ok_or(MappingError::NullConfig("block"))
    }

    pub fn block_config_mut(&mut self) -> MappingResult<&mut MappingCfg> {
        self.block_cfg.as_mut().ok_or(MappingError::NullConfig("block"))
    }

    pub fn replace_config(&self, name: &str) -> Option<&MappingCfg> {
        self.replace_cfg.get(name)
    }

    /// Custom tables may only name declared coordinates.
    fn validate_custom_tables(&self) -> MappingResult<()> {
        let known = |name: &str| {
            let in_cfg = |cfg: &Option<MappingCfg>| {
                cfg.as_ref().map_or(false, |c| c.get_by_name(name).is_some())
            };
            in_cfg(&self.thread_cfg) || in_cfg(&self.block_cfg)
        };
        for name in self
            .custom_inner_mapping
            .values()
            .chain(self.custom_outer_mapping.values())
        {
            if !known(name) {
                return Err(MappingError::UnknownCoordinate(name.clone()));
            }
        }
        Ok(())
    }
}
