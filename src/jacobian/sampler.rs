//! Pixel sampling, pixel budgets and Jacobian assembly.

use crate::core::{ImageState, ParameterBlock, ParticleState, Tile};
use crate::jacobian::finite_diff::{eval_particle_grad, tile_difference};
use crate::jacobian::{FiniteDifferenceConfig, JacobianError, JacobianResult, eval_deriv};
use faer::Mat;
use nalgebra::DVector;
use ndarray::Array3;
use rand::Rng;
use tracing::debug;
use web_time::Instant;

/// Memory ceiling and redundancy settings deciding how many pixels go into a stochastic
/// Jacobian.
#[derive(Debug, Clone)]
pub struct PixelBudget {
    /// Bytes available for J
    pub max_mem: f64,
    /// Minimum number of pixels per parameter
    pub min_redundant: usize,
    /// Use one pixel in `decimate` of the interior
    pub decimate: usize,
}

impl Default for PixelBudget {
    fn default() -> Self {
        Self {
            max_mem: 2e9,
            min_redundant: 20,
            decimate: 1,
        }
    }
}

impl PixelBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_mem(mut self, max_mem: f64) -> Self {
        self.max_mem = max_mem;
        self
    }

    pub fn with_min_redundant(mut self, min_redundant: usize) -> Self {
        self.min_redundant = min_redundant;
        self
    }

    pub fn with_decimate(mut self, decimate: usize) -> Self {
        self.decimate = decimate;
        self
    }

    pub fn validate(&self) -> JacobianResult<()> {
        if self.decimate == 0 {
            return Err(
                JacobianError::InvalidConfig("decimate must be at least 1".to_string()).log(),
            );
        }
        if !(self.max_mem > 0.0) {
            return Err(JacobianError::InvalidConfig(format!(
                "max_mem must be positive, got {}",
                self.max_mem
            ))
            .log());
        }
        Ok(())
    }

    /// Number of pixels to sample for `nparams` parameters over an interior of
    /// `interior_size` pixels.
    ///
    /// The decimated interior is clipped to `[min_redundant · nparams, max_mem / 8 / nparams]`.
    /// Fails when the redundancy floor does not fit in memory.
    pub fn num_pixels(&self, interior_size: usize, nparams: usize) -> JacobianResult<usize> {
        if nparams == 0 {
            return Ok(0);
        }
        self.validate()?;
        let px_mem = (self.max_mem / 8.0 / nparams as f64).floor() as usize;
        let px_red = self.min_redundant * nparams;
        let px_dec = interior_size / self.decimate;
        if px_red > px_mem {
            return Err(JacobianError::InfeasiblePixelBudget {
                nparams,
                min_pixels: px_red,
                max_pixels: px_mem,
            }
            .log());
        }
        Ok(px_dec.clamp(px_red, px_mem))
    }
}

/// Pixels of the interior entering a stochastic Jacobian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelSample {
    /// Every interior pixel in row-major order
    All,
    /// Flat row-major offsets into the interior tile
    Indices(Vec<usize>),
}

impl PixelSample {
    /// Draw `num_inds` distinct interior pixels. Asking for at least the whole interior selects
    /// every pixel.
    pub fn draw<R: Rng + ?Sized>(interior: &Tile, num_inds: usize, rng: &mut R) -> Self {
        let size = interior.size();
        if num_inds >= size {
            PixelSample::All
        } else {
            PixelSample::Indices(rand::seq::index::sample(rng, size, num_inds).into_vec())
        }
    }

    pub fn len(&self, interior: &Tile) -> usize {
        match self {
            PixelSample::All => interior.size(),
            PixelSample::Indices(inds) => inds.len(),
        }
    }

    pub fn is_empty(&self, interior: &Tile) -> bool {
        self.len(interior) == 0
    }

    /// Absolute voxel indices of the sample.
    pub fn voxels(&self, interior: &Tile) -> Vec<[usize; 3]> {
        match self {
            PixelSample::All => (0..interior.size()).map(|f| interior.unravel(f)).collect(),
            PixelSample::Indices(inds) => inds.iter().map(|&f| interior.unravel(f)).collect(),
        }
    }

    /// Values of `volume` at the sampled pixels.
    pub fn gather(&self, volume: &Array3<f64>, interior: &Tile) -> Vec<f64> {
        match self {
            PixelSample::All => interior.view(volume).iter().copied().collect(),
            PixelSample::Indices(inds) => inds
                .iter()
                .map(|&f| {
                    let [i, j, k] = interior.unravel(f);
                    volume[[i, j, k]]
                })
                .collect(),
        }
    }
}

/// Difference image at the sampled pixels.
pub fn sampled_residuals<S: ImageState + ?Sized>(state: &S, sample: &PixelSample) -> DVector<f64> {
    DVector::from_vec(sample.gather(&state.difference_image(), &state.interior()))
}

/// Stochastic Jacobian: one row per exploded entry of `block`, one column per sampled pixel.
pub fn stochastic_jacobian<S: ImageState + ?Sized>(
    state: &mut S,
    block: &ParameterBlock,
    sample: &PixelSample,
    config: &FiniteDifferenceConfig,
) -> JacobianResult<Mat<f64>> {
    config.validate()?;
    let start = Instant::now();
    let interior = state.interior();
    let rows = block.explode();
    let ncols = sample.len(&interior);
    let mut j = Mat::zeros(rows.len(), ncols);
    if ncols == 0 {
        return Ok(j);
    }
    for (r, row_block) in rows.iter().enumerate() {
        let deriv = eval_deriv(state, row_block, config)?;
        for (c, v) in sample.gather(&deriv, &interior).into_iter().enumerate() {
            j[(r, c)] = v;
        }
    }
    debug!(
        "Built stochastic J ({} x {}) in {:.2}ms",
        rows.len(),
        ncols,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(j)
}

/// Exact Jacobian of `particles` over the masked pixels of `tile`.
///
/// Rows are `(p0, p1, p2, r)` for each particle in the given order.
pub fn particle_jacobian<S: ParticleState + ?Sized>(
    state: &mut S,
    particles: &[usize],
    tile: &Tile,
    config: &FiniteDifferenceConfig,
) -> JacobianResult<Mat<f64>> {
    config.validate()?;
    let start = Instant::now();
    let ncols = tile_difference(&*state, tile, state.pixel_mask()).len();
    let mut j = Mat::zeros(4 * particles.len(), ncols);
    for (a, &particle) in particles.iter().enumerate() {
        let rows = eval_particle_grad(state, particle, tile, config)?;
        for (r, row) in rows.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                j[(4 * a + r, c)] = v;
            }
        }
    }
    debug!(
        "Built particle J ({} x {}) over {} in {:.2}ms",
        j.nrows(),
        ncols,
        tile,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(j)
}

/// Difference image at the masked pixels of `tile`, as used with [`particle_jacobian`].
pub fn tile_residuals<S: ImageState + ?Sized>(state: &S, tile: &Tile) -> DVector<f64> {
    DVector::from_vec(tile_difference(state, tile, state.pixel_mask()))
}
