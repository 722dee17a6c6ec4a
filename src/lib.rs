//! polymap: GPU thread/block mapping for polyhedral schedule trees
//!
//! Given a schedule tree, the dependences between statement instances and
//! the thread/block configuration chosen by tiling, the outer-band pass
//! binds band members to hardware coordinates and inserts the barriers
//! that keep cross-thread dependences ordered.
//!
//! # Pass Flow
//! ```text
//! scop file → Schedule + dependences + config
//!               ↓
//!   thread mapping (bottom-up) ── per sequence: barrier placement
//!               ↓
//!   block mapping (outermost permutable band)
//!               ↓
//!   mapped tree + coordinate mappings + barrier statements
//! ```
//!
//! # Module Organization
//!
//! - [`config`]: thread/block configurations and user switches
//! - [`mapping`]: binding band members to coordinates, marker names
//! - [`roadmap`]: which nodes already hold threads
//! - [`strategy`]: reduce, matmul, conv and elementwise binding rules
//! - [`warp`]: thread and warp projections of a domain
//! - [`sync`]: barrier requirement analysis and placement
//! - [`mapping_outer_band`]: the pass itself
//! - [`scop`]: loading kernels and reporting results
//!
//! The polyhedral primitives (sets, relations, quasi-affine functions,
//! the schedule tree) live in the `poly-rs` workspace crate.

pub mod config;
pub mod error;
pub mod mapping;
pub mod mapping_outer_band;
pub mod roadmap;
pub mod scop;
pub mod strategy;
pub mod sync;
pub mod warp;

pub use config::{AnalysisResult, MappingCfg, ReduceDirection, UserConfig};
pub use error::{MappingError, MappingResult};
pub use mapping::Mapping;
pub use mapping_outer_band::MappingOuterBand;
pub use scop::{MappingReport, PassInfo, ScopFile, ScopInfo};
pub use sync::{SyncLevel, Synchronization};
