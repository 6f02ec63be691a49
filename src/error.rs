//! Error types for the voxfit library
//!
//! - **`VoxfitError`** is the top-level error returned by the drivers
//! - **Module errors** (`CoreError`, `JacobianError`, `OptimizerError`, ...) are wrapped inside it
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! VoxfitError::Jacobian(
//!     JacobianError::State(
//!         CoreError::InvalidParticleUpdate { index: 3, .. }
//!     )
//! )
//! ```

use crate::{
    core::CoreError, jacobian::JacobianError, linalg::LinAlgError, observers::ObserverError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the voxfit library
pub type VoxfitResult<T> = Result<T, VoxfitError>;

/// Main error type for the voxfit library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = solver.optimize(&mut state, &block) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum VoxfitError {
    /// State, parameter block and particle update errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Jacobian construction and pixel budget errors
    #[error(transparent)]
    Jacobian(#[from] JacobianError),

    /// Optimization driver errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Observer errors
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

impl VoxfitError {
    /// Get the full error chain as a string for logging and debugging.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// error!("Fit failed: {}", err.chain_compact());
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxfit_error_display() {
        let error = VoxfitError::from(OptimizerError::LineSearchFailure {
            start: 1.0,
            best: 2.0,
        });
        assert!(error.to_string().contains("Line search failed"));
    }

    #[test]
    fn test_voxfit_error_chain() {
        let linalg_error = LinAlgError::FactorizationFailed("SVD did not converge".to_string());
        let error = VoxfitError::from(linalg_error);

        let chain = error.chain();
        assert!(chain.contains("factorization"));
        assert!(chain.contains("SVD"));
    }

    #[test]
    fn test_voxfit_error_chain_compact() {
        let core_error = CoreError::ParticleIndex { index: 7, count: 3 };
        let error = VoxfitError::from(JacobianError::from(core_error));

        let chain_compact = error.chain_compact();
        assert!(chain_compact.contains('7'));
    }

    #[test]
    fn test_voxfit_result_err() {
        let core_error = CoreError::InvalidInput("Test error".to_string());
        let result: VoxfitResult<i32> = Err(VoxfitError::from(core_error));
        assert!(result.is_err());
    }

    #[test]
    fn test_transparent_error_conversion() {
        let budget = JacobianError::InfeasiblePixelBudget {
            nparams: 10,
            min_pixels: 200,
            max_pixels: 100,
        };

        let voxfit_error: VoxfitError = budget.into();
        match voxfit_error {
            VoxfitError::Jacobian(_) => { /* Expected */ }
            _ => panic!("Expected Jacobian variant"),
        }
    }
}
