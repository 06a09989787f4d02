use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"), context(false))]
    Ir { source: polygpu_ir::Error },

    /// A pass failed; the tree handed to it is still valid.
    #[snafu(display("pass '{pass}' failed: {source}"))]
    Pass {
        pass: &'static str,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Band with too few members for the convolution mapping.
    #[snafu(display("convolution band has {members} members, at least 4 are required"))]
    ConvBand { members: usize },
}
