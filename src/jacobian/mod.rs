//! Approximate Jacobians of the difference image.
//!
//! Two flavors are provided:
//! - a stochastic Jacobian over a random sample of interior pixels, one row per parameter of an
//!   exploded block ([`sampler::stochastic_jacobian`])
//! - an exact per-particle Jacobian over every masked pixel of a tile, four rows per particle
//!   ([`sampler::particle_jacobian`])
//!
//! Derivatives are finite differences ([`finite_diff`]). Rows index parameters and columns
//! index pixels throughout, so the normal matrix is `J·Jᵗ`.

pub mod finite_diff;
pub mod sampler;

pub use finite_diff::{FiniteDifferenceConfig, Perturbation, Stencil, eval_deriv};
pub use sampler::{
    PixelBudget, PixelSample, particle_jacobian, sampled_residuals, stochastic_jacobian,
    tile_residuals,
};

use crate::core::CoreError;
use thiserror::Error;
use tracing::error;

/// Jacobian construction error types
#[derive(Debug, Clone, Error)]
pub enum JacobianError {
    /// The memory ceiling cannot hold the minimum redundant number of pixels
    #[error(
        "Infeasible pixel budget: {min_pixels} pixels required for {nparams} parameters but memory allows only {max_pixels}"
    )]
    InfeasiblePixelBudget {
        nparams: usize,
        min_pixels: usize,
        max_pixels: usize,
    },

    /// Finite-difference or budget settings are invalid
    #[error("Invalid Jacobian configuration: {0}")]
    InvalidConfig(String),

    /// The state rejected an update while derivatives were evaluated
    #[error(transparent)]
    State(#[from] CoreError),
}

impl JacobianError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for Jacobian construction
pub type JacobianResult<T> = Result<T, JacobianError>;
