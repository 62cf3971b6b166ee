use thiserror::Error;

/// Errors raised by the multivariate-analysis engines.
///
/// Validation problems (bad shapes, unsupported parameters, negative data
/// under the Poisson assumption) are reported before any computation runs
/// and are never retried. Numerical degeneracies that can be recovered
/// locally (a singular unmixing matrix) do not appear here; they are handled
/// with a pseudo-inverse fallback and a warning.
#[derive(Debug, Error)]
pub enum MvaError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("{0} requires a prior decomposition; run decomposition() first")]
    MissingDecomposition(&'static str),

    #[error("shape mismatch for {name}: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        actual: String,
    },

    #[error("linear algebra routine failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to read or write learning results: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, MvaError>;

/// The SVD backend was asked for factors it did not return.
pub(crate) fn factor_missing() -> MvaError {
    MvaError::Validation("SVD did not return the requested factors".into())
}
