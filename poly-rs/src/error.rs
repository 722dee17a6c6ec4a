use crate::schedule_tree::ScheduleNodeType;
use thiserror::Error;

/// Errors raised by the set algebra, the reader and the schedule tree.
#[derive(Error, Debug)]
pub enum PolyError {
    /// Text could not be read
    #[error("parse error at byte {pos}: {msg}")]
    Parse { pos: usize, msg: String },

    /// An identifier is neither a tuple variable nor a known parameter
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    /// A domain variable has no lower or upper bound we can evaluate
    #[error("variable `{var}` of `{stmt}` has no computable bounds")]
    Unbounded { stmt: String, var: String },

    /// Multiplication of two non-constant expressions
    #[error("non-affine expression: {0}")]
    NonAffine(String),

    /// Enumeration would exceed the point budget
    #[error("set of `{stmt}` is too large to enumerate ({count} points)")]
    TooLarge { stmt: String, count: i128 },

    /// Node had the wrong type for the requested operation
    #[error("node {node} is a {found:?}, expected {expected}")]
    UnexpectedNode {
        node: usize,
        expected: &'static str,
        found: ScheduleNodeType,
    },

    /// Band member index out of range
    #[error("band member {pos} out of range for band with {n_member} members")]
    BandMemberOutOfRange { pos: usize, n_member: usize },

    /// Divisor, modulus or tile size that must be positive was not
    #[error("expected a positive integer, got {0}")]
    NonPositive(i64),

    /// Pieces of a multi union pw aff do not line up for composition
    #[error("members of the multi union pw aff have unaligned pieces for `{0}`")]
    Unaligned(String),

    /// Dimension count mismatch between a function and its argument
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Structural error in a schedule tree description
    #[error("invalid schedule tree: {0}")]
    InvalidTree(String),

    /// JSON (de)serialization of a schedule tree description failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type PolyResult<T> = Result<T, PolyError>;
