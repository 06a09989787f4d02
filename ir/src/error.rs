use snafu::Snafu;

use crate::tree::Path;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Violations of the contracts between the scheduling stages.
///
/// None of these are recoverable: they mean an upstream stage produced
/// something the GPU back-end cannot compile without miscompiling.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Mark name with a known prefix but an unparseable payload.
    #[snafu(display("malformed mark name '{name}'"))]
    MalformedMark { name: String },

    /// Mapping config extent below 1.
    #[snafu(display("mapping config '{cfg}' has non-positive extent {extent} on axis {axis}"))]
    NonPositiveExtent { cfg: String, axis: usize, extent: i64 },

    /// Mapping configs describe at most x, y and z.
    #[snafu(display("mapping config '{cfg}' has {count} axes, at most 3 are supported"))]
    TooManyAxes { cfg: String, count: usize },

    /// Mapping config string could not be parsed.
    #[snafu(display("cannot parse mapping config '{input}'"))]
    ParseMappingCfg { input: String },

    /// A block or thread config is required but missing.
    #[snafu(display("{kind} config is missing"))]
    MissingMappingCfg { kind: &'static str },

    /// Replacement config referenced before it was registered.
    #[snafu(display("replace config '{name}' is not registered"))]
    UnknownReplaceCfg { name: String },

    /// Tensor referenced by a statement or config does not exist.
    #[snafu(display("unknown tensor '{name}'"))]
    UnknownTensor { name: String },

    /// Statement referenced by the schedule does not exist.
    #[snafu(display("unknown statement '{name}'"))]
    UnknownStatement { name: String },

    /// Tensor index is not affine in the statement iterators.
    #[snafu(display("access to '{tensor}' in statement '{stmt}' is not affine"))]
    NonAffineAccess { stmt: String, tensor: String },

    /// Access rank does not match the tensor rank.
    #[snafu(display("access to '{tensor}' in statement '{stmt}' has {got} indices, tensor has rank {rank}"))]
    AccessRank { stmt: String, tensor: String, got: usize, rank: usize },

    /// Statement iterators cannot be recovered from the schedule.
    #[snafu(display("schedule of statement '{stmt}' is not invertible: {reason}"))]
    NotInvertible { stmt: String, reason: String },

    /// Path does not address a node.
    #[snafu(display("invalid schedule tree path {path:?}"))]
    InvalidPath { path: Path },

    /// Node at path has an unexpected kind.
    #[snafu(display("expected {expected} node at {path:?}, found {found}"))]
    UnexpectedNode { expected: &'static str, found: &'static str, path: Path },

    /// Band split position outside the band.
    #[snafu(display("cannot split band of {members} members at {pos}"))]
    SplitOutOfRange { pos: usize, members: usize },

    /// Tile size incompatible with a member.
    #[snafu(display("tile size {size} does not divide modulo {modulo} of band member {member}"))]
    TileNotDivisible { member: usize, size: i64, modulo: i64 },

    /// Non-positive tile size.
    #[snafu(display("tile size {size} for band member {member} must be positive"))]
    InvalidTileSize { member: usize, size: i64 },

    /// Promotion was requested for a zero-dimensional tensor.
    #[snafu(display("tensor '{tensor}' is a scalar and cannot be promoted"))]
    ScalarPromotion { tensor: String },
}
