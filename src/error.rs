use thiserror::Error;

/// Errors surfaced while building, rewriting, or planning a graph.
///
/// Caller contract violations (out-of-range accessor indices, touching an
/// arena after materialisation, reading unbound storage) are not represented
/// here; they panic with a diagnostic instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("shape mismatch: {reason}")]
    ShapeMismatch { reason: String },

    #[error("graph invariant violated: {reason}")]
    InvalidGraph { reason: String },

    #[error("graph contains a cycle, no topological order exists")]
    CyclicGraph,

    #[error("runtime failed to allocate {bytes} bytes of arena backing")]
    AllocFailed { bytes: usize },
}

impl Error {
    pub(crate) fn shape_mismatch(reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_graph(reason: impl Into<String>) -> Self {
        Error::InvalidGraph {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
