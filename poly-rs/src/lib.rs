//! poly-rs: finite polyhedral primitives for schedule-tree passes.
//!
//! This crate provides the two collaborators a GPU mapping pass consumes:
//!
//! - a **domain algebra** over explicit sets of statement instances
//!   ([`UnionSet`], [`UnionMap`]) and quasi-affine projections
//!   ([`AffExpr`], [`UnionPwAff`], [`MultiUnionPwAff`], [`MultiAff`]);
//! - a **schedule tree** ([`Schedule`]) stored as an arena of nodes with
//!   stable [`NodeId`]s, so that a node keeps its identity while the tree
//!   around it is rewritten in place.
//!
//! Sets are enumerated eagerly: parameters are instantiated when text is
//! read and every set is a finite collection of integer points. The reader
//! accepts the usual ISL notation for the subset of the language these
//! passes need:
//!
//! ```text
//! [N] -> { S0[i, j] : 0 <= i < N and 0 <= j <= i; S1[k] : 0 <= k < 8 }
//! { S0[i, j] -> S1[i, j + 1] : j < 7 }
//! [{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]
//! ```

pub mod aff;
pub mod error;
pub mod map;
pub mod parse;
pub mod schedule_tree;
pub mod set;

pub use aff::{AffExpr, AffPiece, MultiAff, MultiUnionPwAff, UnionPwAff};
pub use error::{PolyError, PolyResult};
pub use map::UnionMap;
pub use parse::Params;
pub use schedule_tree::{Band, NodeId, NodeKind, Schedule, ScheduleNodeType, TreeSpec};
pub use set::{Instance, UnionSet};
