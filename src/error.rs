use poly_rs::{NodeId, PolyError, ScheduleNodeType};
use thiserror::Error;

/// Errors that abort the mapping pass.
///
/// Most variants describe broken upstream contracts (a missing config, a
/// tree shape the scheduler never produces); they are reported rather than
/// worked around.
#[derive(Error, Debug)]
pub enum MappingError {
    /// Thread or block configuration was not provided
    #[error("{0} config is null")]
    NullConfig(&'static str),

    /// Part of a sequence's domain has no thread coordinate
    #[error("there are remaining domains that have not been mapped to threadID: {0}")]
    UnmappedDomain(String),

    /// A child of a set or sequence node is not a filter
    #[error("the child of set or sequence must be a filter, found {found:?} at node {node}")]
    ExpectedFilter {
        node: NodeId,
        found: ScheduleNodeType,
    },

    /// Custom mapping was requested without a coordinate table
    #[error("the custom {0} configuration was not obtained")]
    EmptyCustomMapping(&'static str),

    /// Mapping extents must be positive
    #[error("extent of `{name}` must be positive, got {extent}")]
    NonPositiveExtent { name: String, extent: i64 },

    /// Coordinate name not declared in the mapping config
    #[error("unknown mapping coordinate `{0}`")]
    UnknownCoordinate(String),

    /// Configuration rejected on load
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Poly(#[from] PolyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MappingResult<T> = Result<T, MappingError>;
