//! Reference state built from analytic Gaussian blobs.
//!
//! [`SyntheticState`] implements [`ImageState`] and [`ParticleState`] with a deliberately simple
//! generative model, enough to exercise every optimizer end to end:
//!
//! ```text
//! model = off + bkg + slab + ilm · Σ blob
//! bkg   = b0 · y/ny + b1 · x/nx
//! slab  = amp · sigmoid(z0 - z)
//! ilm   = a0 + a1 · z/nz
//! blob  = typ · (s_r²/s²)^1.5 · exp(-d² / 2s²) · window
//! ```
//!
//! with `s_r = rad · rscale`, `s² = s_r² + psf²` and the axial distance scaled by `zscale`. Each
//! blob is cut off by a smooth separable window reaching [`WINDOW_SIGMAS`] standard deviations, so
//! a particle change only touches a bounded tile and local re-rendering is exact. The `sigma`
//! parameter is carried for completeness and does not enter the model.

use crate::core::{
    CoreError, CoreResult, ImageState, ParamCategory, ParameterBlock, ParameterLayout, Particle,
    ParticleState, StateSnapshot, Tile, UpdateTiles,
};
use nalgebra::{DVector, Vector3};
use ndarray::Array3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeSet;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Reach of the blob window in units of the blob's standard deviation.
pub const WINDOW_SIGMAS: f64 = 5.0;

/// Parameters of a synthetic volume, used both as ground truth and as a starting guess.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    pub shape: [usize; 3],
    pub particles: Vec<Particle>,
    pub psf: f64,
    pub ilm: [f64; 2],
    pub bkg: [f64; 2],
    pub off: f64,
    pub slab: [f64; 2],
    pub zscale: f64,
    pub sigma: f64,
    pub rscale: f64,
    /// Width of the border excluded from the interior
    pub pad: usize,
}

impl SyntheticModel {
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            particles: Vec::new(),
            psf: 1.0,
            ilm: [1.0, 0.0],
            bkg: [0.0, 0.0],
            off: 0.0,
            slab: [0.0, 0.0],
            zscale: 1.0,
            sigma: 0.05,
            rscale: 1.0,
            pad: 2,
        }
    }

    pub fn with_particle(mut self, particle: Particle) -> Self {
        self.particles.push(particle);
        self
    }

    pub fn with_particles(mut self, particles: Vec<Particle>) -> Self {
        self.particles = particles;
        self
    }

    pub fn with_psf(mut self, psf: f64) -> Self {
        self.psf = psf;
        self
    }

    pub fn with_ilm(mut self, a0: f64, a1: f64) -> Self {
        self.ilm = [a0, a1];
        self
    }

    pub fn with_bkg(mut self, b0: f64, b1: f64) -> Self {
        self.bkg = [b0, b1];
        self
    }

    pub fn with_offset(mut self, off: f64) -> Self {
        self.off = off;
        self
    }

    pub fn with_slab(mut self, amp: f64, z0: f64) -> Self {
        self.slab = [amp, z0];
        self
    }

    pub fn with_zscale(mut self, zscale: f64) -> Self {
        self.zscale = zscale;
        self
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn with_rscale(mut self, rscale: f64) -> Self {
        self.rscale = rscale;
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    /// Layout of the parameter vector for this model.
    pub fn layout(&self) -> ParameterLayout {
        let n = self.particles.len();
        ParameterLayout::new(&[
            (ParamCategory::Pos, 3 * n),
            (ParamCategory::Rad, n),
            (ParamCategory::Typ, n),
            (ParamCategory::Psf, 1),
            (ParamCategory::Ilm, 2),
            (ParamCategory::Bkg, 2),
            (ParamCategory::Off, 1),
            (ParamCategory::Slab, 2),
            (ParamCategory::ZScale, 1),
            (ParamCategory::Sigma, 1),
            (ParamCategory::RScale, 1),
        ])
    }

    /// Flatten the model into a parameter vector matching [`SyntheticModel::layout`].
    pub fn parameters(&self) -> DVector<f64> {
        let mut values = Vec::with_capacity(self.layout().len());
        values.extend(self.particles.iter().flat_map(|p| [p.pos[0], p.pos[1], p.pos[2]]));
        values.extend(self.particles.iter().map(|p| p.rad));
        values.extend(self.particles.iter().map(|p| p.typ));
        values.push(self.psf);
        values.extend(self.ilm);
        values.extend(self.bkg);
        values.push(self.off);
        values.extend(self.slab);
        values.push(self.zscale);
        values.push(self.sigma);
        values.push(self.rscale);
        DVector::from_vec(values)
    }

    /// Render the noiseless model volume.
    pub fn render(&self) -> Array3<f64> {
        let indices = Indices::for_particles(self.particles.len());
        Renderer::new(self.shape, &indices, self.particles.len(), &self.parameters())
            .render_full()
    }

    /// Render the model and add Gaussian noise of standard deviation `sigma`.
    pub fn render_noisy(&self, seed: u64) -> CoreResult<Array3<f64>> {
        let mut image = self.render();
        add_noise(&mut image, self.sigma, seed)?;
        Ok(image)
    }
}

/// Add independent Gaussian noise to every voxel.
pub fn add_noise(image: &mut Array3<f64>, sigma: f64, seed: u64) -> CoreResult<()> {
    if sigma == 0.0 {
        return Ok(());
    }
    let normal = Normal::new(0.0, sigma).map_err(|e| {
        CoreError::InvalidInput(format!("invalid noise level {sigma}")).log_with_source(e)
    })?;
    let mut rng = StdRng::seed_from_u64(seed);
    image.iter_mut().for_each(|v| *v += normal.sample(&mut rng));
    Ok(())
}

/// Start index of every category in the synthetic layout.
#[derive(Debug, Clone, Copy)]
struct Indices {
    pos: usize,
    rad: usize,
    typ: usize,
    psf: usize,
    ilm: usize,
    bkg: usize,
    off: usize,
    slab: usize,
    zscale: usize,
    sigma: usize,
    rscale: usize,
}

impl Indices {
    fn for_particles(n: usize) -> Self {
        Self {
            pos: 0,
            rad: 3 * n,
            typ: 4 * n,
            psf: 5 * n,
            ilm: 5 * n + 1,
            bkg: 5 * n + 3,
            off: 5 * n + 5,
            slab: 5 * n + 6,
            zscale: 5 * n + 8,
            sigma: 5 * n + 9,
            rscale: 5 * n + 10,
        }
    }

    fn particle(&self, params: &DVector<f64>, index: usize) -> Particle {
        let o = self.pos + 3 * index;
        Particle::new(
            Vector3::new(params[o], params[o + 1], params[o + 2]),
            params[self.rad + index],
            params[self.typ + index],
        )
    }
}

/// One particle prepared for rendering.
#[derive(Debug, Clone, Copy)]
struct Blob {
    pos: Vector3<f64>,
    zscale: f64,
    s2: f64,
    amp: f64,
    reach: [f64; 3],
}

impl Blob {
    fn new(p: &Particle, psf: f64, rscale: f64, zscale: f64) -> Self {
        let s_r = p.rad * rscale;
        let s2 = s_r * s_r + psf * psf;
        let amp = if s2 > 0.0 {
            p.typ * (s_r * s_r / s2).powf(1.5)
        } else {
            0.0
        };
        let reach = WINDOW_SIGMAS * s2.sqrt();
        Self {
            pos: p.pos,
            zscale,
            s2,
            amp,
            reach: [reach / zscale.abs().max(1e-12), reach, reach],
        }
    }

    fn tile(&self) -> Tile {
        let mut l = [0; 3];
        let mut r = [0; 3];
        for a in 0..3 {
            l[a] = (self.pos[a] - self.reach[a]).floor() as i64;
            r[a] = (self.pos[a] + self.reach[a]).floor() as i64 + 1;
        }
        Tile::new(l, r)
    }

    fn value(&self, idx: [usize; 3]) -> f64 {
        if self.amp == 0.0 {
            return 0.0;
        }
        let mut window = 1.0;
        let mut d = [0.0; 3];
        for a in 0..3 {
            d[a] = idx[a] as f64 - self.pos[a];
            let u = d[a] / self.reach[a];
            if u.abs() >= 1.0 {
                return 0.0;
            }
            window *= (1.0 - u * u) * (1.0 - u * u);
        }
        let dz = d[0] * self.zscale;
        let r2 = dz * dz + d[1] * d[1] + d[2] * d[2];
        self.amp * (-r2 / (2.0 * self.s2)).exp() * window
    }
}

/// Everything needed to evaluate the model at a voxel.
struct Renderer {
    shape: [usize; 3],
    ilm: [f64; 2],
    bkg: [f64; 2],
    off: f64,
    slab: [f64; 2],
    blobs: Vec<Blob>,
}

impl Renderer {
    fn new(shape: [usize; 3], idx: &Indices, n: usize, params: &DVector<f64>) -> Self {
        let psf = params[idx.psf];
        let rscale = params[idx.rscale];
        let zscale = params[idx.zscale];
        let blobs = (0..n)
            .map(|i| Blob::new(&idx.particle(params, i), psf, rscale, zscale))
            .collect();
        Self {
            shape,
            ilm: [params[idx.ilm], params[idx.ilm + 1]],
            bkg: [params[idx.bkg], params[idx.bkg + 1]],
            off: params[idx.off],
            slab: [params[idx.slab], params[idx.slab + 1]],
            blobs,
        }
    }

    fn voxel(&self, blobs: &[&Blob], idx: [usize; 3]) -> f64 {
        let [n0, n1, n2] = self.shape.map(|n| n.max(1) as f64);
        let z = idx[0] as f64;
        let ilm = self.ilm[0] + self.ilm[1] * z / n0;
        let bkg = self.bkg[0] * idx[1] as f64 / n1 + self.bkg[1] * idx[2] as f64 / n2;
        let slab = self.slab[0] / (1.0 + (z - self.slab[1]).exp());
        let objects: f64 = blobs.iter().map(|b| b.value(idx)).sum();
        self.off + bkg + slab + ilm * objects
    }

    /// Render the voxels of `tile`, which must lie inside the volume.
    fn render(&self, tile: &Tile) -> Array3<f64> {
        let blobs: Vec<&Blob> = self
            .blobs
            .iter()
            .filter(|b| b.tile().overlaps(tile))
            .collect();
        let [s0, s1, s2] = tile.shape().map(|n| n as usize);

        #[cfg(feature = "parallel")]
        let values: Vec<f64> = (0..tile.size())
            .into_par_iter()
            .map(|flat| self.voxel(&blobs, tile.unravel(flat)))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let values: Vec<f64> = (0..tile.size())
            .map(|flat| self.voxel(&blobs, tile.unravel(flat)))
            .collect();

        Array3::from_shape_fn((s0, s1, s2), |(i, j, k)| values[(i * s1 + j) * s2 + k])
    }

    fn render_full(&self) -> Array3<f64> {
        self.render(&Tile::from_shape(self.shape))
    }
}

/// A fit state over an observed volume using the synthetic model.
#[derive(Debug, Clone)]
pub struct SyntheticState {
    image: Array3<f64>,
    model: Array3<f64>,
    params: DVector<f64>,
    layout: ParameterLayout,
    indices: Indices,
    num_particles: usize,
    pad: usize,
    mask: Option<Array3<bool>>,
}

impl SyntheticState {
    /// Build a state fitting `model` to `image`. The model image is rendered immediately.
    pub fn new(image: Array3<f64>, model: SyntheticModel) -> CoreResult<Self> {
        let (n0, n1, n2) = image.dim();
        if [n0, n1, n2] != model.shape {
            return Err(CoreError::DimensionMismatch(format!(
                "image shape {:?} does not match model shape {:?}",
                [n0, n1, n2],
                model.shape
            ))
            .log());
        }
        if model.shape.iter().any(|&n| 2 * model.pad > n) {
            return Err(CoreError::InvalidInput(format!(
                "pad {} leaves no interior in shape {:?}",
                model.pad, model.shape
            ))
            .log());
        }
        let layout = model.layout();
        layout.validate()?;
        let num_particles = model.particles.len();
        let indices = Indices::for_particles(num_particles);
        let params = model.parameters();
        let model_image =
            Renderer::new(model.shape, &indices, num_particles, &params).render_full();
        debug!(
            "Synthetic state: shape {:?}, {} particles, {} parameters",
            model.shape,
            num_particles,
            layout.len()
        );
        Ok(Self {
            image,
            model: model_image,
            params,
            layout,
            indices,
            num_particles,
            pad: model.pad,
            mask: None,
        })
    }

    /// Restrict the fit to the pixels where `mask` is true.
    pub fn with_mask(mut self, mask: Array3<bool>) -> CoreResult<Self> {
        if mask.dim() != self.image.dim() {
            return Err(CoreError::DimensionMismatch(format!(
                "mask shape {:?} does not match image shape {:?}",
                mask.dim(),
                self.image.dim()
            ))
            .log());
        }
        self.mask = Some(mask);
        Ok(self)
    }

    fn renderer(&self) -> Renderer {
        Renderer::new(self.shape(), &self.indices, self.num_particles, &self.params)
    }

    fn blob(&self, p: &Particle) -> Blob {
        Blob::new(
            p,
            self.params[self.indices.psf],
            self.params[self.indices.rscale],
            self.params[self.indices.zscale],
        )
    }

    /// Particle owning parameter `index`, if it is a position, radius or type entry.
    fn particle_of(&self, index: usize) -> Option<usize> {
        let n = self.num_particles;
        let idx = &self.indices;
        if index >= idx.pos && index < idx.pos + 3 * n {
            Some((index - idx.pos) / 3)
        } else if index >= idx.rad && index < idx.rad + n {
            Some(index - idx.rad)
        } else if index >= idx.typ && index < idx.typ + n {
            Some(index - idx.typ)
        } else {
            None
        }
    }

    fn check_particle(&self, index: usize) -> CoreResult<()> {
        if index >= self.num_particles {
            return Err(CoreError::ParticleIndex {
                index,
                count: self.num_particles,
            }
            .log());
        }
        Ok(())
    }

    /// Current parameters as a model description.
    pub fn to_model(&self) -> SyntheticModel {
        let idx = &self.indices;
        let p = &self.params;
        SyntheticModel {
            shape: self.shape(),
            particles: (0..self.num_particles)
                .map(|i| idx.particle(p, i))
                .collect(),
            psf: p[idx.psf],
            ilm: [p[idx.ilm], p[idx.ilm + 1]],
            bkg: [p[idx.bkg], p[idx.bkg + 1]],
            off: p[idx.off],
            slab: [p[idx.slab], p[idx.slab + 1]],
            zscale: p[idx.zscale],
            sigma: p[idx.sigma],
            rscale: p[idx.rscale],
            pad: self.pad,
        }
    }
}

impl ImageState for SyntheticState {
    fn parameters(&self) -> &DVector<f64> {
        &self.params
    }

    fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    fn set_parameters(
        &mut self,
        block: &ParameterBlock,
        values: &DVector<f64>,
    ) -> CoreResult<()> {
        if block.len() != self.params.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "block over {} parameters applied to state with {}",
                block.len(),
                self.params.len()
            ))
            .log());
        }
        let indices = block.indices();
        let owners: Option<BTreeSet<usize>> =
            indices.iter().map(|&i| self.particle_of(i)).collect();

        match owners {
            Some(touched) => {
                let before: Vec<Particle> = touched
                    .iter()
                    .map(|&i| self.indices.particle(&self.params, i))
                    .collect();
                block.scatter(&mut self.params, values)?;

                let image = Tile::from_shape(self.shape());
                let supports: Vec<Tile> = touched
                    .iter()
                    .zip(&before)
                    .map(|(&i, b)| {
                        let after = self.indices.particle(&self.params, i);
                        self.particle_support(b, &after).intersection(&image)
                    })
                    .collect();
                if let Some(bounding) = Tile::bounding(&supports) {
                    let pad = self.psf_support(&bounding).map(|p| p / 2 + 1);
                    let tiles = UpdateTiles::for_region(&bounding, pad, self.shape());
                    self.update_tile(&tiles)?;
                }
                Ok(())
            }
            None => {
                block.scatter(&mut self.params, values)?;
                self.rebuild()
            }
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.params.clone(), self.model.clone())
    }

    fn restore(&mut self, snapshot: &StateSnapshot) -> CoreResult<()> {
        if snapshot.params().len() != self.params.len()
            || snapshot.model().dim() != self.model.dim()
        {
            return Err(CoreError::DimensionMismatch(
                "snapshot was taken from a different state".to_string(),
            )
            .log());
        }
        self.params.copy_from(snapshot.params());
        self.model.assign(snapshot.model());
        Ok(())
    }

    fn image(&self) -> &Array3<f64> {
        &self.image
    }

    fn model_image(&self) -> &Array3<f64> {
        &self.model
    }

    fn interior(&self) -> Tile {
        let pad = self.pad as i64;
        Tile::from_shape(self.shape()).pad([-pad, -pad, -pad])
    }

    fn rebuild(&mut self) -> CoreResult<()> {
        self.model = self.renderer().render_full();
        Ok(())
    }

    fn pixel_mask(&self) -> Option<&Array3<bool>> {
        self.mask.as_ref()
    }
}

impl ParticleState for SyntheticState {
    fn num_particles(&self) -> usize {
        self.num_particles
    }

    fn particle(&self, index: usize) -> CoreResult<Particle> {
        self.check_particle(index)?;
        Ok(self.indices.particle(&self.params, index))
    }

    fn set_particle(&mut self, index: usize, particle: Particle) -> CoreResult<()> {
        self.check_particle(index)?;
        let o = self.indices.pos + 3 * index;
        self.params[o] = particle.pos[0];
        self.params[o + 1] = particle.pos[1];
        self.params[o + 2] = particle.pos[2];
        self.params[self.indices.rad + index] = particle.rad;
        self.params[self.indices.typ + index] = particle.typ;
        Ok(())
    }

    fn particle_support(&self, before: &Particle, after: &Particle) -> Tile {
        let tiles = [self.blob(before).tile(), self.blob(after).tile()];
        Tile::bounding(&tiles).unwrap_or(tiles[0])
    }

    fn psf_support(&self, _tile: &Tile) -> [i64; 3] {
        // The PSF is folded into each blob's width.
        [0, 0, 0]
    }

    fn update_tile(&mut self, tiles: &UpdateTiles) -> CoreResult<()> {
        if tiles.inner.is_empty() {
            return Ok(());
        }
        let image = Tile::from_shape(self.shape());
        if tiles.outer.intersection(&image) != tiles.outer {
            return Err(CoreError::DimensionMismatch(format!(
                "update region {} leaves the volume",
                tiles.outer
            ))
            .log());
        }
        let rendered = self.renderer().render(&tiles.outer);
        tiles.inner.view_mut(&mut self.model).assign(&tiles.io.view(&rendered));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn single_blob() -> SyntheticModel {
        SyntheticModel::new([16, 16, 16])
            .with_particle(Particle::new(Vector3::new(8.0, 7.4, 8.2), 2.0, 1.0))
            .with_offset(0.1)
    }

    #[test]
    fn test_blob_peaks_at_particle() {
        let image = single_blob().render();
        let (mut best, mut at) = (f64::MIN, (0, 0, 0));
        for (idx, &v) in image.indexed_iter() {
            if v > best {
                best = v;
                at = idx;
            }
        }
        assert_eq!(at, (8, 7, 8));
        assert!(best > 0.1);
    }

    #[test]
    fn test_state_matches_truth() -> TestResult {
        let truth = single_blob();
        let state = SyntheticState::new(truth.render(), truth)?;
        assert_eq!(state.error(), 0.0);
        state.layout().validate()?;
        assert_eq!(state.interior(), Tile::new([2, 2, 2], [14, 14, 14]));
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let truth = single_blob();
        let result = SyntheticState::new(Array3::zeros((4, 4, 4)), truth);
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
    }

    #[test]
    fn test_local_parameter_update_matches_rebuild() -> TestResult {
        let truth = single_blob();
        let mut state = SyntheticState::new(truth.render(), truth)?;
        let block = state.layout().particle_block(0)?;
        state.update_block(&block, &DVector::from_vec(vec![0.3, -0.6, 0.2, 0.4]))?;
        let local = state.model_image().clone();
        state.rebuild()?;
        assert!((&local - state.model_image()).iter().all(|d| d.abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn test_snapshot_restore_is_exact() -> TestResult {
        let truth = single_blob();
        let mut state = SyntheticState::new(truth.render(), truth)?;
        let snapshot = state.snapshot();
        let block = state.layout().block(ParamCategory::Psf)?;
        state.update_block(&block, &DVector::from_vec(vec![0.5]))?;
        assert!(state.error() > 0.0);
        state.restore(&snapshot)?;
        assert_eq!(state.error(), 0.0);
        assert_eq!(state.parameters(), snapshot.params());
        Ok(())
    }

    #[test]
    fn test_noise_is_seeded() -> TestResult {
        let truth = single_blob().with_sigma(0.1);
        assert_eq!(truth.render_noisy(7)?, truth.render_noisy(7)?);
        assert_ne!(truth.render_noisy(7)?, truth.render());
        Ok(())
    }

    #[test]
    fn test_pad_larger_than_volume_rejected() -> TestResult {
        let truth = SyntheticModel::new([4, 10, 10]).with_pad(3);
        let result = SyntheticState::new(truth.render(), truth);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));

        // A pad of half the shape leaves an empty interior.
        let truth = SyntheticModel::new([4, 10, 10]).with_pad(2);
        let state = SyntheticState::new(truth.render(), truth)?;
        assert!(state.interior().is_empty());
        Ok(())
    }

    #[test]
    fn test_masked_error_ignores_excluded_pixels() -> TestResult {
        let truth = single_blob();
        let mut image = truth.render();
        image[[0, 0, 0]] += 5.0;
        image[[15, 3, 9]] -= 2.0;
        let mut mask = Array3::from_elem((16, 16, 16), true);
        mask[[0, 0, 0]] = false;

        let unmasked = SyntheticState::new(image.clone(), truth.clone())?;
        assert!((unmasked.error() - 29.0).abs() < 1e-9);

        let state = SyntheticState::new(image, truth)?.with_mask(mask)?;
        assert!((state.error() - 4.0).abs() < 1e-9);
        assert_eq!(state.pixel_mask().map(|m| m.iter().filter(|&&k| !k).count()), Some(1));
        Ok(())
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() -> TestResult {
        let truth = single_blob();
        let state = SyntheticState::new(truth.render(), truth)?;
        let result = state.with_mask(Array3::from_elem((16, 16, 8), true));
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
        Ok(())
    }
}
