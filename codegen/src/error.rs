//! Error types for AST construction and emission.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"), context(false))]
    Ir { source: polygpu_ir::Error },

    #[snafu(display("{source}"), context(false))]
    Schedule { source: polygpu_schedule::Error },

    /// Loop whose increment is zero.
    #[snafu(display("loop over '{iterator}' has a zero stride"))]
    ZeroStride { iterator: String },

    /// Loop condition that is not `iterator < bound` or `iterator <= bound`.
    #[snafu(display("loop over '{iterator}' has an unsupported condition {cond}"))]
    LoopCondition { iterator: String, cond: String },

    /// User node without a recorded node info.
    #[snafu(display("no node info for annotation '{annotation}'"))]
    MissingNodeInfo { annotation: String },

    /// Annotation ids are write-once.
    #[snafu(display("node info for annotation '{annotation}' already exists"))]
    DuplicateNodeInfo { annotation: String },

    /// Realize of a promoted buffer nothing describes.
    #[snafu(display("no buffer definition for promoted buffer '{name}'"))]
    UnknownBuffer { name: String },

    /// The relaxed rerun asked for another restart.
    #[snafu(display("scheduling of kernel '{kernel}' still requests a restart with relaxed coincidence"))]
    RestartExhausted { kernel: String },
}
