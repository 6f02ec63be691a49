//! Optimization drivers for fitting a rendered model to an observed volume.
//!
//! - Levenberg-Marquardt over arbitrary parameter blocks with a stochastic Jacobian
//! - Levenberg-Marquardt over particle positions and radii with an exact tile Jacobian,
//!   plus a driver sweeping every particle group of the volume
//! - Line minimization along the eigenvectors of `JTJ`
//! - Direct linear least squares for blocks the model depends on linearly
//!
//! All drivers borrow the state mutably for one call and leave it at the best parameters found.

pub mod conjugate_direction;
pub mod damping;
pub mod levenberg_marquardt;
pub mod line_search;
pub mod linear_fit;
pub mod particles;

pub use conjugate_direction::{
    ConjugateDirection, ConjugateDirectionConfig, ConjugateDirectionSummary,
};
pub use damping::{DampingController, DampingPhase, StepOutcome, TrialChoice};
pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig, LevmarqSummary};
pub use line_search::{BrentResult, brent, do_line_min, line_minimize};
pub use linear_fit::{LinearFit, LinearFitConfig, LinearFitSummary};
pub use particles::{
    GroupSummary, ParticleGroupConfig, ParticleLevenbergMarquardt, calc_region_size,
};

// Re-export observer types from the observers module
pub use crate::observers::{IterationHistory, OptObserver, OptObserverVec};

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, error};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Line minimization ended above the error it started from
    #[error("Line search failed: best error {best:.6e} is above the start error {start:.6e}")]
    LineSearchFailure { start: f64, best: f64 },
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
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
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Per-iteration statistics for detailed logging (Ceres-style output).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Global error after the iteration
    pub error: f64,
    /// Change in error over the iteration
    pub error_change: f64,
    /// L2 norm of the gradient (||J·r||)
    pub gradient_norm: f64,
    /// L2 norm of the kept step
    pub step_norm: f64,
    /// Damping after the iteration
    pub damping: f64,
    /// Effective rank of the damped solve
    pub rank: usize,
    /// Extra steps taken with the same Jacobian
    pub run_steps: usize,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether a trial step was kept
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>5}  {:>4}  {:>11}  {:>13}  {:>6}",
            "iter",
            "error",
            "error_change",
            "|gradient|",
            "|step|",
            "damping",
            "rank",
            "run",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line in Ceres-style format with scientific notation
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>5}  {:>4}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.error,
            self.error_change,
            self.gradient_norm,
            self.step_norm,
            self.damping,
            self.rank,
            self.run_steps,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Random source for pixel sampling; seeded runs are reproducible.
pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
