//! Direct least squares for blocks the model depends on linearly (illumination, background,
//! offset). The design matrix is built from unit renders of the block, so no finite differences
//! are involved.

use crate::core::{CoreError, ImageState, ParameterBlock};
use crate::error::VoxfitResult;
use crate::jacobian::{PixelBudget, PixelSample};
use crate::linalg::lstsq;
use crate::optimizer::{OptimizerError, seeded_rng};
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::{debug, warn};
use web_time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LinearFitConfig {
    /// Relative singular-value cutoff of the least-squares solves
    pub min_eigval: f64,
    /// Solve for a change of the current values instead of the values themselves
    pub relative: bool,
    /// Refinement solves against the sampled residual
    pub num_iter: usize,
    pub pixel_budget: PixelBudget,
    pub seed: Option<u64>,
}

impl Default for LinearFitConfig {
    fn default() -> Self {
        Self {
            min_eigval: 1e-11,
            relative: false,
            num_iter: 5,
            pixel_budget: PixelBudget::default(),
            seed: None,
        }
    }
}

impl LinearFitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_eigval(mut self, min_eigval: f64) -> Self {
        self.min_eigval = min_eigval;
        self
    }

    pub fn with_relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    pub fn with_num_iter(mut self, num_iter: usize) -> Self {
        self.num_iter = num_iter;
        self
    }

    pub fn with_pixel_budget(mut self, pixel_budget: PixelBudget) -> Self {
        self.pixel_budget = pixel_budget;
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
        self.pixel_budget.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LinearFitSummary {
    pub initial_error: f64,
    pub final_error: f64,
    /// The fit made things worse and the old values were put back
    pub reverted: bool,
    /// Rank of the first least-squares solve
    pub rank: usize,
    pub num_pixels: usize,
    pub total_time: Duration,
}

impl Display for LinearFitSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Linear Fit Final Result")?;
        writeln!(f, "  Initial error: {:.6e}", self.initial_error)?;
        writeln!(f, "  Final error:   {:.6e}", self.final_error)?;
        writeln!(f, "  Rank:          {}", self.rank)?;
        if self.reverted {
            writeln!(f, "  Reverted to the starting values")?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct LinearFit {
    config: LinearFitConfig,
}

impl LinearFit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LinearFitConfig) -> Self {
        Self { config }
    }

    pub fn optimize<S: ImageState + ?Sized>(
        &mut self,
        state: &mut S,
        block: &ParameterBlock,
    ) -> VoxfitResult<LinearFitSummary> {
        self.config.validate()?;
        state.layout().validate()?;
        if block.len() != state.parameters().len() {
            return Err(CoreError::DimensionMismatch(format!(
                "block covers {} parameters but the state has {}",
                block.len(),
                state.parameters().len()
            ))
            .log()
            .into());
        }

        let start = Instant::now();
        let initial_error = state.error();
        let mut summary = LinearFitSummary {
            initial_error,
            final_error: initial_error,
            reverted: false,
            rank: 0,
            num_pixels: 0,
            total_time: Duration::ZERO,
        };
        let nparams = block.count();
        if nparams == 0 {
            summary.total_time = start.elapsed();
            return Ok(summary);
        }

        let interior = state.interior();
        let num_px = self.config.pixel_budget.num_pixels(interior.size(), nparams)?;
        let sample = PixelSample::draw(&interior, num_px, &mut seeded_rng(self.config.seed));
        summary.num_pixels = sample.len(&interior);
        let gather = |state: &S| DVector::from_vec(sample.gather(state.model_image(), &interior));

        let snapshot = state.snapshot();
        let old_values = state.block_values(block);

        state.set_parameters(block, &DVector::zeros(nparams))?;
        let baseline = gather(&*state);
        let mut a = DMatrix::zeros(summary.num_pixels, nparams);
        for col in 0..nparams {
            let mut unit = DVector::zeros(nparams);
            unit[col] = 1.0;
            state.set_parameters(block, &unit)?;
            a.set_column(col, &(gather(&*state) - &baseline));
        }
        state.restore(&snapshot)?;

        let observed = DVector::from_vec(sample.gather(state.image(), &interior));
        let target = if self.config.relative {
            &observed - gather(&*state)
        } else {
            &observed - &baseline
        };
        let first = lstsq(&a, &target, self.config.min_eigval)?;
        summary.rank = first.rank;
        let mut best = if self.config.relative {
            &old_values + &first.delta
        } else {
            first.delta
        };
        state.set_parameters(block, &best)?;

        for _ in 0..self.config.num_iter {
            let residual = &observed - gather(&*state);
            best += lstsq(&a, &residual, self.config.min_eigval)?.delta;
            state.set_parameters(block, &best)?;
        }

        let final_error = state.error();
        if final_error > initial_error {
            warn!(
                "Linear fit raised the error from {:.6e} to {:.6e}, keeping the old values",
                initial_error, final_error
            );
            state.restore(&snapshot)?;
            summary.reverted = true;
        }
        summary.final_error = state.error();
        summary.total_time = start.elapsed();
        debug!("{}", summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ParamCategory, Particle};
    use crate::synthetic::{SyntheticModel, SyntheticState};
    use nalgebra::Vector3;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn truth() -> SyntheticModel {
        SyntheticModel::new([14, 14, 14])
            .with_particle(Particle::new(Vector3::new(7.0, 6.5, 7.5), 2.5, 1.0))
            .with_ilm(1.2, 0.3)
            .with_bkg(0.2, -0.1)
            .with_offset(0.4)
    }

    fn linear_block(state: &SyntheticState) -> Result<ParameterBlock, Box<dyn std::error::Error>> {
        Ok(state.layout().blocks(&[
            ParamCategory::Ilm,
            ParamCategory::Bkg,
            ParamCategory::Off,
        ])?)
    }

    #[test]
    fn test_absolute_fit_recovers_linear_parameters() -> TestResult {
        let truth = truth();
        let start = truth
            .clone()
            .with_ilm(1.0, 0.0)
            .with_bkg(0.0, 0.0)
            .with_offset(0.0);
        let mut state = SyntheticState::new(truth.render(), start)?;
        let block = linear_block(&state)?;

        let summary = LinearFit::with_config(LinearFitConfig::new().with_seed(4))
            .optimize(&mut state, &block)?;
        assert!(!summary.reverted);
        assert_eq!(summary.rank, 5);
        let fitted = state.block_values(&block);
        let expected = [1.2, 0.3, 0.2, -0.1, 0.4];
        for (value, want) in fitted.iter().zip(expected) {
            assert!((value - want).abs() < 1e-6, "{value} vs {want}");
        }
        assert!(summary.final_error < 1e-10);
        Ok(())
    }

    #[test]
    fn test_relative_fit_from_nearby_values() -> TestResult {
        let truth = truth();
        let start = truth.clone().with_ilm(1.1, 0.25).with_offset(0.35);
        let mut state = SyntheticState::new(truth.render(), start)?;
        let block = linear_block(&state)?;

        let summary = LinearFit::with_config(LinearFitConfig::new().with_relative(true).with_seed(5))
            .optimize(&mut state, &block)?;
        assert!(summary.final_error < 1e-10);
        assert!((state.block_values(&block)[4] - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_empty_block_is_noop() -> TestResult {
        let truth = truth();
        let mut state = SyntheticState::new(truth.render(), truth.clone().with_offset(0.0))?;
        let block = ParameterBlock::empty(state.parameters().len());
        let summary = LinearFit::new().optimize(&mut state, &block)?;
        assert_eq!(summary.initial_error, summary.final_error);
        assert_eq!(summary.num_pixels, 0);
        Ok(())
    }
}
