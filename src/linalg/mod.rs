pub mod normal;

use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

pub use normal::{LmStep, NormalEquationsSolver, SortedEigen, gradient, jtj, lstsq};

/// Solver for the damped normal equations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    /// SVD least squares with a relative singular-value cutoff
    #[default]
    SvdLeastSquares,
    /// Cholesky factorization, falling back to SVD when the matrix is not positive definite
    Cholesky,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SvdLeastSquares => write!(f, "SVD least squares"),
            LinearSolverType::Cholesky => write!(f, "Cholesky"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (SVD, eigendecomposition)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Operand shapes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error from the third-party library (must implement Debug)
    ///
    /// # Example
    /// ```ignore
    /// svd.solve(&b, eps)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed("SVD solve failed".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;
