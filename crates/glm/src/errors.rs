use thiserror::Error;

/// A result type for GLM fitting algorithm
pub type Result<T> = std::result::Result<T, GlmError>;

/// An error when using [`GlmAlgorithm`](crate::GlmAlgorithm) or its building blocks
#[derive(Error, Debug)]
pub enum GlmError {
    /// When sizes or dimensions of given data do not match
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What is being checked
        what: String,
        /// Expected size or shape
        expected: String,
        /// Actual size or shape
        actual: String,
    },
    /// When the covariance matrix could not be factorized even after diagonal regularization
    #[error(
        "Could not compute the Cholesky factor of the covariance matrix: \
         scaling up to {cumulated_scaling} was not enough"
    )]
    NumericalInstability {
        /// Total amount added to the diagonal before giving up
        cumulated_scaling: f64,
    },
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When the likelihood optimizer fails
    #[error("Optimization error: {0}")]
    OptimizationError(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}

impl GlmError {
    pub(crate) fn dimension_mismatch(
        what: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        GlmError::DimensionMismatch {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
