//! Parameter categories, layouts and block masks.
//!
//! The global parameter vector of a state is partitioned into named categories
//! (`pos`, `rad`, ..., `rscale`). A [`ParameterLayout`] records where each category lives;
//! a [`ParameterBlock`] is a boolean mask selecting the entries a driver optimizes.
//!
//! Blocks always enumerate their entries in ascending index order, which is the row order of
//! every Jacobian built from them and the order of every step vector applied to them.

use crate::core::{CoreError, CoreResult};
use nalgebra::DVector;
use std::fmt;
use std::ops::Range;

/// Number of position coordinates per particle.
pub const POS_DIM: usize = 3;

/// Named groups of parameters recognized by the optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamCategory {
    /// Particle positions, three per particle
    Pos,
    /// Particle radii
    Rad,
    /// Particle types (amplitudes)
    Typ,
    /// Point-spread function
    Psf,
    /// Illumination field
    Ilm,
    /// Background field
    Bkg,
    /// Global offset
    Off,
    /// Coverslip slab
    Slab,
    /// Axial scale of particle coordinates
    ZScale,
    /// Noise level
    Sigma,
    /// Global radius scale
    RScale,
}

impl ParamCategory {
    /// Every category a state must declare, in canonical order.
    pub const ALL: [ParamCategory; 11] = [
        ParamCategory::Pos,
        ParamCategory::Rad,
        ParamCategory::Typ,
        ParamCategory::Psf,
        ParamCategory::Ilm,
        ParamCategory::Bkg,
        ParamCategory::Off,
        ParamCategory::Slab,
        ParamCategory::ZScale,
        ParamCategory::Sigma,
        ParamCategory::RScale,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParamCategory::Pos => "pos",
            ParamCategory::Rad => "rad",
            ParamCategory::Typ => "typ",
            ParamCategory::Psf => "psf",
            ParamCategory::Ilm => "ilm",
            ParamCategory::Bkg => "bkg",
            ParamCategory::Off => "off",
            ParamCategory::Slab => "slab",
            ParamCategory::ZScale => "zscale",
            ParamCategory::Sigma => "sigma",
            ParamCategory::RScale => "rscale",
        }
    }
}

impl fmt::Display for ParamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Boolean selection over the global parameter vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlock {
    mask: Vec<bool>,
}

impl ParameterBlock {
    /// Block selecting nothing in a vector of length `len`.
    pub fn empty(len: usize) -> Self {
        Self {
            mask: vec![false; len],
        }
    }

    pub fn from_mask(mask: Vec<bool>) -> Self {
        Self { mask }
    }

    /// Block selecting the given indices. Out-of-range indices are an error.
    pub fn from_indices(len: usize, indices: &[usize]) -> CoreResult<Self> {
        let mut mask = vec![false; len];
        for &i in indices {
            let slot = mask.get_mut(i).ok_or_else(|| {
                CoreError::DimensionMismatch(format!(
                    "parameter index {i} out of range for vector of length {len}"
                ))
                .log()
            })?;
            *slot = true;
        }
        Ok(Self { mask })
    }

    fn from_range(len: usize, range: Range<usize>) -> Self {
        let mut mask = vec![false; len];
        for slot in &mut mask[range] {
            *slot = true;
        }
        Self { mask }
    }

    /// Length of the underlying parameter vector.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Number of selected entries.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.mask.get(index).copied().unwrap_or(false)
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Selected indices in canonical (ascending) order.
    pub fn indices(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect()
    }

    /// Split into one single-entry block per selected entry, in canonical order.
    pub fn explode(&self) -> Vec<ParameterBlock> {
        self.indices()
            .into_iter()
            .map(|i| Self::from_range(self.len(), i..i + 1))
            .collect()
    }

    pub fn union(&self, other: &ParameterBlock) -> ParameterBlock {
        Self {
            mask: self
                .mask
                .iter()
                .zip(&other.mask)
                .map(|(&a, &b)| a || b)
                .collect(),
        }
    }

    pub fn intersects(&self, other: &ParameterBlock) -> bool {
        self.mask.iter().zip(&other.mask).any(|(&a, &b)| a && b)
    }

    /// Gather the selected entries of `params`.
    pub fn gather(&self, params: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(self.count(), self.indices().into_iter().map(|i| params[i]))
    }

    /// Write `values` into the selected entries of `params`.
    pub fn scatter(&self, params: &mut DVector<f64>, values: &DVector<f64>) -> CoreResult<()> {
        if values.len() != self.count() {
            return Err(CoreError::DimensionMismatch(format!(
                "block selects {} entries but {} values were given",
                self.count(),
                values.len()
            ))
            .log());
        }
        for (i, v) in self.indices().into_iter().zip(values.iter()) {
            params[i] = *v;
        }
        Ok(())
    }
}

/// Placement of each category inside the global parameter vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLayout {
    entries: Vec<(ParamCategory, Range<usize>)>,
    len: usize,
}

impl ParameterLayout {
    /// Lay categories out contiguously in the given order.
    pub fn new(sizes: &[(ParamCategory, usize)]) -> Self {
        let mut entries = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for &(category, size) in sizes {
            entries.push((category, offset..offset + size));
            offset += size;
        }
        Self {
            entries,
            len: offset,
        }
    }

    /// Total number of parameters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn categories(&self) -> impl Iterator<Item = ParamCategory> + '_ {
        self.entries.iter().map(|(c, _)| *c)
    }

    /// Check that exactly the recognized categories are declared, each once.
    pub fn validate(&self) -> CoreResult<()> {
        for category in ParamCategory::ALL {
            let declared = self.entries.iter().filter(|(c, _)| *c == category).count();
            if declared != 1 {
                return Err(CoreError::UnsupportedParameters(format!(
                    "category '{category}' declared {declared} times, expected exactly once"
                ))
                .log());
            }
        }
        if self.entries.len() != ParamCategory::ALL.len() {
            return Err(CoreError::UnsupportedParameters(format!(
                "layout declares {} categories, expected {}",
                self.entries.len(),
                ParamCategory::ALL.len()
            ))
            .log());
        }
        Ok(())
    }

    /// Index range of a category.
    pub fn range(&self, category: ParamCategory) -> CoreResult<Range<usize>> {
        self.entries
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| {
                CoreError::UnsupportedParameters(format!("category '{category}' not in layout"))
                    .log()
            })
    }

    /// Block selecting a whole category.
    pub fn block(&self, category: ParamCategory) -> CoreResult<ParameterBlock> {
        Ok(ParameterBlock::from_range(self.len, self.range(category)?))
    }

    /// Block selecting several categories.
    pub fn blocks(&self, categories: &[ParamCategory]) -> CoreResult<ParameterBlock> {
        categories
            .iter()
            .try_fold(ParameterBlock::empty(self.len), |acc, &c| {
                Ok(acc.union(&self.block(c)?))
            })
    }

    /// Number of particles implied by the `rad` category.
    pub fn num_particles(&self) -> usize {
        self.range(ParamCategory::Rad).map(|r| r.len()).unwrap_or(0)
    }

    fn particle_check(&self, particle: usize) -> CoreResult<()> {
        if particle >= self.num_particles() {
            return Err(CoreError::ParticleIndex {
                index: particle,
                count: self.num_particles(),
            }
            .log());
        }
        Ok(())
    }

    /// Index of coordinate `axis` of `particle`'s position.
    pub fn pos_index(&self, particle: usize, axis: usize) -> CoreResult<usize> {
        self.particle_check(particle)?;
        Ok(self.range(ParamCategory::Pos)?.start + POS_DIM * particle + axis)
    }

    pub fn rad_index(&self, particle: usize) -> CoreResult<usize> {
        self.particle_check(particle)?;
        Ok(self.range(ParamCategory::Rad)?.start + particle)
    }

    pub fn typ_index(&self, particle: usize) -> CoreResult<usize> {
        self.particle_check(particle)?;
        Ok(self.range(ParamCategory::Typ)?.start + particle)
    }

    /// Block selecting the three position coordinates of a particle.
    pub fn particle_pos_block(&self, particle: usize) -> CoreResult<ParameterBlock> {
        let start = self.pos_index(particle, 0)?;
        Ok(ParameterBlock::from_range(self.len, start..start + POS_DIM))
    }

    /// Block selecting a particle's position and radius.
    pub fn particle_block(&self, particle: usize) -> CoreResult<ParameterBlock> {
        let rad = ParameterBlock::from_indices(self.len, &[self.rad_index(particle)?])?;
        Ok(self.particle_pos_block(particle)?.union(&rad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn full_layout(n: usize) -> ParameterLayout {
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

    #[test]
    fn test_layout_partitions_vector() -> TestResult {
        let layout = full_layout(2);
        layout.validate()?;
        assert_eq!(layout.len(), 6 + 2 + 2 + 1 + 2 + 2 + 1 + 2 + 1 + 1 + 1);

        let total: usize = ParamCategory::ALL
            .iter()
            .map(|&c| layout.block(c).map(|b| b.count()))
            .sum::<CoreResult<usize>>()?;
        assert_eq!(total, layout.len());
        Ok(())
    }

    #[test]
    fn test_missing_category_rejected() {
        let layout = ParameterLayout::new(&[(ParamCategory::Pos, 3), (ParamCategory::Rad, 1)]);
        assert!(matches!(
            layout.validate(),
            Err(CoreError::UnsupportedParameters(_))
        ));
    }

    #[test]
    fn test_explode_is_canonical() -> TestResult {
        let block = ParameterBlock::from_indices(6, &[4, 1, 2])?;
        let exploded = block.explode();
        assert_eq!(exploded.len(), 3);
        assert_eq!(exploded[0].indices(), vec![1]);
        assert_eq!(exploded[1].indices(), vec![2]);
        assert_eq!(exploded[2].indices(), vec![4]);
        Ok(())
    }

    #[test]
    fn test_particle_block_order() -> TestResult {
        let layout = full_layout(3);
        let block = layout.particle_block(1)?;
        assert_eq!(block.indices(), vec![3, 4, 5, 10]);
        assert!(matches!(
            layout.particle_block(3),
            Err(CoreError::ParticleIndex { index: 3, count: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_gather_scatter() -> TestResult {
        let block = ParameterBlock::from_indices(4, &[1, 3])?;
        let mut params = DVector::from_vec(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(block.gather(&params).as_slice(), &[1.0, 3.0]);
        block.scatter(&mut params, &DVector::from_vec(vec![10.0, 30.0]))?;
        assert_eq!(params.as_slice(), &[0.0, 10.0, 2.0, 30.0]);
        assert!(block.scatter(&mut params, &DVector::from_vec(vec![1.0])).is_err());
        Ok(())
    }
}
