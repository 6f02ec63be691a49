//! Capability traits for the states driven by the optimizers.
//!
//! Optimizers never render anything themselves. They read parameters, write parameter blocks,
//! and look at the model and difference images through [`ImageState`]. Particle drivers need a
//! little more (per-particle object updates and partial re-rendering), which [`ParticleState`]
//! adds on top.

use crate::core::{CoreError, CoreResult, ParameterBlock, ParameterLayout, Tile, UpdateTiles};
use nalgebra::{DVector, Vector3};
use ndarray::{Array3, Zip};

/// One spherical particle of the object model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    /// Position in voxel coordinates, one entry per image axis
    pub pos: Vector3<f64>,
    /// Radius in voxels
    pub rad: f64,
    /// Type / amplitude
    pub typ: f64,
}

impl Particle {
    pub fn new(pos: Vector3<f64>, rad: f64, typ: f64) -> Self {
        Self { pos, rad, typ }
    }
}

/// Exact copy of everything a rollback needs: the parameter vector and the model image.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    params: DVector<f64>,
    model: Array3<f64>,
}

impl StateSnapshot {
    pub fn new(params: DVector<f64>, model: Array3<f64>) -> Self {
        Self { params, model }
    }

    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    pub fn model(&self) -> &Array3<f64> {
        &self.model
    }

    pub fn into_parts(self) -> (DVector<f64>, Array3<f64>) {
        (self.params, self.model)
    }
}

/// A parametric model of an observed volume.
///
/// Implementors keep the model image consistent with the parameter vector after every
/// mutating call.
pub trait ImageState {
    /// Full parameter vector.
    fn parameters(&self) -> &DVector<f64>;

    /// Placement of each parameter category in the vector.
    fn layout(&self) -> &ParameterLayout;

    /// Set the entries selected by `block` to `values` (canonical order) and update the model.
    fn set_parameters(&mut self, block: &ParameterBlock, values: &DVector<f64>)
    -> CoreResult<()>;

    fn snapshot(&self) -> StateSnapshot;

    /// Put the parameters and model back exactly as captured, without re-rendering.
    fn restore(&mut self, snapshot: &StateSnapshot) -> CoreResult<()>;

    /// Observed volume.
    fn image(&self) -> &Array3<f64>;

    /// Current model volume.
    fn model_image(&self) -> &Array3<f64>;

    /// Region of the volume where the model is trusted; pixel sampling draws from here.
    fn interior(&self) -> Tile;

    /// Re-render the whole model from the parameters.
    fn rebuild(&mut self) -> CoreResult<()>;

    /// Pixels that take part in the fit. `None` means every pixel.
    fn pixel_mask(&self) -> Option<&Array3<bool>> {
        None
    }

    /// Observed minus model.
    fn difference_image(&self) -> Array3<f64> {
        self.image() - self.model_image()
    }

    /// Volume shape.
    fn shape(&self) -> [usize; 3] {
        let (n0, n1, n2) = self.image().dim();
        [n0, n1, n2]
    }

    /// Global fit error: sum of squared differences over every participating pixel.
    fn error(&self) -> f64 {
        let image = self.image();
        let model = self.model_image();
        match self.pixel_mask() {
            Some(mask) => Zip::from(image)
                .and(model)
                .and(mask)
                .fold(0.0, |acc, &i, &m, &keep| {
                    if keep { acc + (i - m) * (i - m) } else { acc }
                }),
            None => Zip::from(image)
                .and(model)
                .fold(0.0, |acc, &i, &m| acc + (i - m) * (i - m)),
        }
    }

    /// Values currently held by the entries of `block`.
    fn block_values(&self, block: &ParameterBlock) -> DVector<f64> {
        block.gather(self.parameters())
    }

    /// Add `delta` to the entries of `block`.
    fn update_block(&mut self, block: &ParameterBlock, delta: &DVector<f64>) -> CoreResult<()> {
        if delta.len() != block.count() {
            return Err(CoreError::DimensionMismatch(format!(
                "step of length {} for block of {} parameters",
                delta.len(),
                block.count()
            ))
            .log());
        }
        let values = self.block_values(block) + delta;
        self.set_parameters(block, &values)
    }
}

/// A state whose object model is a list of particles that can be updated locally.
pub trait ParticleState: ImageState {
    fn num_particles(&self) -> usize;

    fn particle(&self, index: usize) -> CoreResult<Particle>;

    /// Replace a particle in the object model and the parameter vector without re-rendering.
    fn set_particle(&mut self, index: usize, particle: Particle) -> CoreResult<()>;

    /// Region of the model image affected by moving a particle from `before` to `after`.
    fn particle_support(&self, before: &Particle, after: &Particle) -> Tile;

    /// Extent of the point-spread function around `tile`.
    fn psf_support(&self, tile: &Tile) -> [i64; 3];

    /// Re-render `tiles.outer` and write its `io` part over `tiles.inner` in the model image.
    fn update_tile(&mut self, tiles: &UpdateTiles) -> CoreResult<()>;

    /// Positions of every particle.
    fn particle_positions(&self) -> CoreResult<Vec<Vector3<f64>>> {
        (0..self.num_particles())
            .map(|i| self.particle(i).map(|p| p.pos))
            .collect()
    }
}
