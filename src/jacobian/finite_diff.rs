//! Finite-difference derivatives of the difference image.

use crate::core::particles::ParticleUpdate;
use crate::core::{
    CoreResult, ImageState, ParameterBlock, ParticleState, Tile, update_one_particle,
};
use crate::jacobian::{JacobianError, JacobianResult};
use nalgebra::{DVector, Vector3};
use ndarray::{Array3, Zip};
use tracing::warn;

/// Finite-difference stencil.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Stencil {
    /// `(f(x+dl) - f(x)) / dl`
    #[default]
    TwoPoint,
    /// `(f(x+dl) - f(x-dl)) / 2dl`
    ThreePoint,
}

/// Settings for finite-difference derivatives.
#[derive(Debug, Clone)]
pub struct FiniteDifferenceConfig {
    /// Step added to the perturbed parameters
    pub dl: f64,
    pub stencil: Stencil,
    /// Put perturbed parameters back after each derivative. When false the state is left at
    /// the last evaluated offset.
    pub be_nice: bool,
}

impl Default for FiniteDifferenceConfig {
    fn default() -> Self {
        Self {
            dl: 1e-8,
            stencil: Stencil::TwoPoint,
            be_nice: false,
        }
    }
}

impl FiniteDifferenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for particle position and radius derivatives.
    pub fn for_particles() -> Self {
        Self {
            dl: 1e-6,
            ..Self::default()
        }
    }

    pub fn with_dl(mut self, dl: f64) -> Self {
        self.dl = dl;
        self
    }

    pub fn with_stencil(mut self, stencil: Stencil) -> Self {
        self.stencil = stencil;
        self
    }

    pub fn with_be_nice(mut self, be_nice: bool) -> Self {
        self.be_nice = be_nice;
        self
    }

    pub fn validate(&self) -> JacobianResult<()> {
        if !(self.dl.is_finite() && self.dl > 0.0) {
            return Err(JacobianError::InvalidConfig(format!(
                "finite-difference step must be positive, got {}",
                self.dl
            ))
            .log());
        }
        Ok(())
    }
}

/// Scoped uniform perturbation of a parameter block.
///
/// Every entry of the block is offset from its value at construction. When created with
/// `restore = true` the original values are written back on drop, including early returns;
/// use [`Perturbation::finish`] to see restore errors instead of logging them.
pub struct Perturbation<'a, S: ImageState + ?Sized> {
    state: &'a mut S,
    block: &'a ParameterBlock,
    original: DVector<f64>,
    restore: bool,
}

impl<'a, S: ImageState + ?Sized> Perturbation<'a, S> {
    pub fn new(state: &'a mut S, block: &'a ParameterBlock, restore: bool) -> Self {
        let original = state.block_values(block);
        Self {
            state,
            block,
            original,
            restore,
        }
    }

    /// Move the block to `original + offset`.
    pub fn set(&mut self, offset: f64) -> CoreResult<()> {
        let values = self.original.add_scalar(offset);
        self.state.set_parameters(self.block, &values)
    }

    pub fn state(&self) -> &S {
        &*self.state
    }

    /// Restore (when requested) and surface any error.
    pub fn finish(mut self) -> CoreResult<()> {
        let result = if self.restore {
            self.state.set_parameters(self.block, &self.original)
        } else {
            Ok(())
        };
        self.restore = false;
        result
    }
}

impl<S: ImageState + ?Sized> Drop for Perturbation<'_, S> {
    fn drop(&mut self) {
        if self.restore
            && let Err(e) = self.state.set_parameters(self.block, &self.original)
        {
            warn!("Failed to restore perturbed block: {}", e);
        }
    }
}

/// Derivative of the difference image with respect to a uniform change of `block`.
pub fn eval_deriv<S: ImageState + ?Sized>(
    state: &mut S,
    block: &ParameterBlock,
    config: &FiniteDifferenceConfig,
) -> JacobianResult<Array3<f64>> {
    let dl = config.dl;
    let i0 = match config.stencil {
        Stencil::TwoPoint => Some(state.difference_image()),
        Stencil::ThreePoint => None,
    };

    let mut guard = Perturbation::new(state, block, config.be_nice);
    guard.set(dl)?;
    let i1 = guard.state().difference_image();
    let deriv = match i0 {
        Some(i0) => (i1 - i0) / dl,
        None => {
            guard.set(-dl)?;
            let i2 = guard.state().difference_image();
            (i1 - i2) * (0.5 / dl)
        }
    };
    guard.finish()?;
    Ok(deriv)
}

/// Difference image at the masked pixels of `tile`, in row-major order.
///
/// `mask` covers the whole volume; `None` keeps every pixel.
pub fn tile_difference<S: ImageState + ?Sized>(
    state: &S,
    tile: &Tile,
    mask: Option<&Array3<bool>>,
) -> Vec<f64> {
    let image = tile.view(state.image());
    let model = tile.view(state.model_image());
    let mut out = Vec::with_capacity(tile.size());
    match mask {
        Some(mask) => Zip::from(&image)
            .and(&model)
            .and(&tile.view(mask))
            .for_each(|&i, &m, &keep| {
                if keep {
                    out.push(i - m);
                }
            }),
        None => Zip::from(&image)
            .and(&model)
            .for_each(|&i, &m| out.push(i - m)),
    }
    out
}

/// Number of optimized parameters per particle and their derivative order.
const PARTICLE_AXES: usize = 4;

fn nudge<S: ParticleState + ?Sized>(
    state: &mut S,
    particle: usize,
    axis: usize,
    amount: f64,
) -> CoreResult<()> {
    let mut update = if axis < 3 {
        let mut pos = Vector3::zeros();
        pos[axis] = amount;
        ParticleUpdate::new(pos, 0.0)
    } else {
        ParticleUpdate::new(Vector3::zeros(), amount)
    };
    update_one_particle(state, particle, &mut update, true, false, true).map(|_| ())
}

/// Derivatives of the difference image with respect to a particle's `(p0, p1, p2, r)` at the
/// masked pixels of `tile`. Returns one row per parameter.
pub fn eval_particle_grad<S: ParticleState + ?Sized>(
    state: &mut S,
    particle: usize,
    tile: &Tile,
    config: &FiniteDifferenceConfig,
) -> JacobianResult<Vec<Vec<f64>>> {
    let dl = config.dl;
    let mask = state.pixel_mask().cloned();
    let diff = |s: &S| tile_difference(s, tile, mask.as_ref());

    let mut rows = Vec::with_capacity(PARTICLE_AXES);
    for axis in 0..PARTICLE_AXES {
        let row: Vec<f64> = match config.stencil {
            Stencil::TwoPoint => {
                let i0 = diff(&*state);
                nudge(state, particle, axis, dl)?;
                let i1 = diff(&*state);
                if config.be_nice {
                    nudge(state, particle, axis, -dl)?;
                }
                i1.iter().zip(&i0).map(|(a, b)| (a - b) / dl).collect()
            }
            Stencil::ThreePoint => {
                nudge(state, particle, axis, dl)?;
                let i1 = diff(&*state);
                nudge(state, particle, axis, -2.0 * dl)?;
                let i2 = diff(&*state);
                if config.be_nice {
                    nudge(state, particle, axis, dl)?;
                }
                i1.iter()
                    .zip(&i2)
                    .map(|(a, b)| 0.5 * (a - b) / dl)
                    .collect()
            }
        };
        rows.push(row);
    }
    Ok(rows)
}
