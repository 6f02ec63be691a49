//! Line minimization along the eigenvectors of a stochastic `JTJ`.
//!
//! One Jacobian is sampled per call. Its normal matrix is diagonalized and, for each sweep, the
//! state is line-minimized along every eigenvector from the stiffest down, starting at the
//! Newton-like point `v·0.5·(-g·v)/λ`. Eigenvalues below `min_eigval·λ_max` are skipped.

use crate::core::{ImageState, ParameterBlock};
use crate::error::VoxfitResult;
use crate::jacobian::{
    FiniteDifferenceConfig, PixelBudget, PixelSample, sampled_residuals, stochastic_jacobian,
};
use crate::linalg::{SortedEigen, gradient, jtj};
use crate::optimizer::line_search::do_line_min;
use crate::optimizer::{OptimizerError, seeded_rng};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::debug;
use web_time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ConjugateDirectionConfig {
    /// Relative eigenvalue cutoff
    pub min_eigval: f64,
    pub num_sweeps: usize,
    /// Brent iterations per direction
    pub maxiter: usize,
    pub pixel_budget: PixelBudget,
    pub finite_difference: FiniteDifferenceConfig,
    pub seed: Option<u64>,
}

impl Default for ConjugateDirectionConfig {
    fn default() -> Self {
        Self {
            min_eigval: 1e-12,
            num_sweeps: 2,
            maxiter: 10,
            pixel_budget: PixelBudget::default(),
            finite_difference: FiniteDifferenceConfig::new()
                .with_dl(2e-5)
                .with_be_nice(true),
            seed: None,
        }
    }
}

impl ConjugateDirectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_eigval(mut self, min_eigval: f64) -> Self {
        self.min_eigval = min_eigval;
        self
    }

    pub fn with_num_sweeps(mut self, num_sweeps: usize) -> Self {
        self.num_sweeps = num_sweeps;
        self
    }

    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    pub fn with_pixel_budget(mut self, pixel_budget: PixelBudget) -> Self {
        self.pixel_budget = pixel_budget;
        self
    }

    pub fn with_finite_difference(mut self, finite_difference: FiniteDifferenceConfig) -> Self {
        self.finite_difference = finite_difference;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> VoxfitResult<()> {
        if !(self.min_eigval >= 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "min_eigval must be non-negative, got {}",
                self.min_eigval
            ))
            .log()
            .into());
        }
        if self.maxiter == 0 {
            return Err(OptimizerError::InvalidParameters(
                "maxiter must be at least 1".to_string(),
            )
            .log()
            .into());
        }
        self.pixel_budget.validate()?;
        self.finite_difference.validate()?;
        Ok(())
    }

    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:          Conjugate directions\n  Sweeps:          {}\n  Brent maxiter:   {}\n  Min eigval:      {:.2e}\n  Max memory:      {:.2e} bytes\n  Finite diff dl:  {:.2e} (be_nice {})",
            self.num_sweeps,
            self.maxiter,
            self.min_eigval,
            self.pixel_budget.max_mem,
            self.finite_difference.dl,
            self.finite_difference.be_nice
        );
    }
}

#[derive(Debug, Clone)]
pub struct ConjugateDirectionSummary {
    pub initial_error: f64,
    pub final_error: f64,
    /// Line searches performed
    pub directions_searched: usize,
    /// Directions skipped for a small eigenvalue
    pub directions_skipped: usize,
    pub num_pixels: usize,
    pub total_time: Duration,
}

impl Display for ConjugateDirectionSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Conjugate Direction Final Result")?;
        writeln!(f, "  Initial error: {:.6e}", self.initial_error)?;
        writeln!(f, "  Final error:   {:.6e}", self.final_error)?;
        writeln!(
            f,
            "  Directions:    {} searched, {} skipped",
            self.directions_searched, self.directions_skipped
        )?;
        writeln!(
            f,
            "  Total time:    {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )
    }
}

#[derive(Default)]
pub struct ConjugateDirection {
    config: ConjugateDirectionConfig,
}

impl ConjugateDirection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ConjugateDirectionConfig) -> Self {
        Self { config }
    }

    pub fn optimize<S: ImageState + ?Sized>(
        &mut self,
        state: &mut S,
        block: &ParameterBlock,
    ) -> VoxfitResult<ConjugateDirectionSummary> {
        self.config.validate()?;
        state.layout().validate()?;
        let start = Instant::now();
        let initial_error = state.error();
        let mut summary = ConjugateDirectionSummary {
            initial_error,
            final_error: initial_error,
            directions_searched: 0,
            directions_skipped: 0,
            num_pixels: 0,
            total_time: Duration::ZERO,
        };

        let nparams = block.count();
        if nparams == 0 {
            summary.total_time = start.elapsed();
            return Ok(summary);
        }
        self.config.print_configuration();

        let interior = state.interior();
        let num_px = self.config.pixel_budget.num_pixels(interior.size(), nparams)?;
        let mut rng = seeded_rng(self.config.seed);
        let sample = PixelSample::draw(&interior, num_px, &mut rng);
        summary.num_pixels = sample.len(&interior);

        let snapshot = state.snapshot();
        let j = stochastic_jacobian(state, block, &sample, &self.config.finite_difference)?;
        state.restore(&snapshot)?;
        let normal = jtj(&j);
        let grad = gradient(&j, &sampled_residuals(state, &sample))?;
        let eig = SortedEigen::new(&normal)?;
        let lambda_max = eig.eigenvalues.max();
        let cutoff = self.config.min_eigval * lambda_max;

        for sweep in 0..self.config.num_sweeps {
            for a in (0..nparams).rev() {
                let lambda = eig.eigenvalues[a];
                if !(lambda > 0.0) || lambda < cutoff {
                    summary.directions_skipped += 1;
                    continue;
                }
                let v = eig.eigenvectors.column(a).into_owned();
                let scale = 0.5 * (-&grad).dot(&v) / lambda;
                let direction = v * scale;
                let result = do_line_min(state, block, &direction, self.config.maxiter)?;
                summary.directions_searched += 1;
                debug!(
                    "Sweep {} direction {} (λ = {:.3e}): x = {:.3e}, error = {:.6e}",
                    sweep, a, lambda, result.x, result.fx
                );
            }
        }

        summary.final_error = state.error();
        summary.total_time = start.elapsed();
        debug!("{}", summary);
        Ok(summary)
    }
}
