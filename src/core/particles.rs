//! Validated particle updates and spatial grouping of particles.

use crate::core::{CoreError, CoreResult, Particle, ParticleState, Tile, UpdateTiles};
use nalgebra::{DVector, Vector3};
use tracing::debug;

/// Closest a particle may get to the volume boundary, and the smallest allowed radius, when
/// updates are clamped. Larger than any finite-difference step used on particles.
pub const MIN_DIST: f64 = 3e-3;

/// Number of optimized parameters per particle: three position coordinates and a radius.
pub const PARAMS_PER_PARTICLE: usize = 4;

/// A requested change to one particle.
///
/// With `relative` updates `pos` and `rad` are deltas. When errors are fixed the clamped values
/// are written back here, so the caller knows exactly what was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleUpdate {
    pub pos: Vector3<f64>,
    pub rad: f64,
    /// New type; `None` keeps the current one
    pub typ: Option<f64>,
}

impl ParticleUpdate {
    pub fn new(pos: Vector3<f64>, rad: f64) -> Self {
        Self {
            pos,
            rad,
            typ: None,
        }
    }

    pub fn with_typ(mut self, typ: f64) -> Self {
        self.typ = Some(typ);
        self
    }
}

fn is_bad_update(pos: &Vector3<f64>, rad: f64, shape: [usize; 3]) -> bool {
    (0..3).any(|a| pos[a] < 0.0 || pos[a] > shape[a] as f64) || rad < 0.0
}

/// Update regions for moving a particle from `before` to `after`.
///
/// The particle support is clipped to the volume, padded by half the PSF support plus one,
/// and any remaining overhang is reflected inward.
pub fn tiles_from_particle_change<S: ParticleState + ?Sized>(
    state: &S,
    before: &Particle,
    after: &Particle,
) -> UpdateTiles {
    let shape = state.shape();
    let support = state
        .particle_support(before, after)
        .intersection(&Tile::from_shape(shape));
    tiles_for_support(state, &support)
}

fn tiles_for_support<S: ParticleState + ?Sized>(state: &S, support: &Tile) -> UpdateTiles {
    let psf = state.psf_support(support);
    let pad = [psf[0] / 2 + 1, psf[1] / 2 + 1, psf[2] / 2 + 1];
    UpdateTiles::for_region(support, pad, state.shape())
}

/// Where `update` takes a particle currently at `before`, clamped when `fix_errors` is set.
///
/// Fails with [`CoreError::InvalidParticleUpdate`] for a bad update that is not fixed. Clamped
/// requests are written back into `update`.
fn resolve_update(
    index: usize,
    before: &Particle,
    update: &mut ParticleUpdate,
    relative: bool,
    fix_errors: bool,
    shape: [usize; 3],
) -> CoreResult<Particle> {
    if fix_errors {
        if relative {
            if is_bad_update(&(before.pos + update.pos), before.rad + update.rad, shape) {
                for a in 0..3 {
                    let lo = MIN_DIST - before.pos[a];
                    let hi = shape[a] as f64 - MIN_DIST - before.pos[a];
                    update.pos[a] = update.pos[a].clamp(lo, hi);
                }
                update.rad = update.rad.max(MIN_DIST - before.rad);
            }
        } else if is_bad_update(&update.pos, update.rad, shape) {
            for a in 0..3 {
                update.pos[a] = update.pos[a].clamp(MIN_DIST, shape[a] as f64 - MIN_DIST);
            }
            update.rad = update.rad.max(MIN_DIST);
        }
    }

    let after = if relative {
        Particle::new(
            before.pos + update.pos,
            before.rad + update.rad,
            update.typ.unwrap_or(before.typ),
        )
    } else {
        Particle::new(update.pos, update.rad, update.typ.unwrap_or(before.typ))
    };

    if is_bad_update(&after.pos, after.rad, shape) {
        return Err(CoreError::InvalidParticleUpdate {
            index,
            pos: [after.pos[0], after.pos[1], after.pos[2]],
            rad: after.rad,
            shape,
        }
        .log());
    }
    Ok(after)
}

/// Update one particle of the state.
///
/// A bad update places any coordinate below zero or beyond the volume shape, or makes the radius
/// negative. With `fix_errors` a bad update is clamped per axis into `[MIN_DIST, shape - MIN_DIST]`
/// (radius to at least `MIN_DIST`) and the clamped request is written back into `update`;
/// otherwise it fails with [`CoreError::InvalidParticleUpdate`] and the state is untouched.
///
/// With `render = false` only the object is changed; the caller re-renders later.
pub fn update_one_particle<S: ParticleState + ?Sized>(
    state: &mut S,
    index: usize,
    update: &mut ParticleUpdate,
    relative: bool,
    fix_errors: bool,
    render: bool,
) -> CoreResult<UpdateTiles> {
    let before = state.particle(index)?;
    let after = resolve_update(index, &before, update, relative, fix_errors, state.shape())?;

    let tiles = tiles_from_particle_change(state, &before, &after);
    state.set_particle(index, after)?;
    if render {
        state.update_tile(&tiles)?;
    }
    Ok(tiles)
}

/// Update several particles and re-render once.
///
/// `params` holds `(p0, p1, p2, r)` for each entry of `particles`, in order. Every update is
/// resolved before any particle moves, so a bad update leaves the state untouched. Objects are
/// then updated and the model is re-rendered over the bounding tile of every particle's change,
/// padded by the PSF support. Clamped values are written back into `params`.
pub fn update_particles<S: ParticleState + ?Sized>(
    state: &mut S,
    particles: &[usize],
    params: &mut DVector<f64>,
    relative: bool,
    fix_errors: bool,
) -> CoreResult<UpdateTiles> {
    if params.len() != PARAMS_PER_PARTICLE * particles.len() {
        return Err(CoreError::DimensionMismatch(format!(
            "{} particle parameters for {} particles",
            params.len(),
            particles.len()
        ))
        .log());
    }

    let shape = state.shape();
    let mut moves = Vec::with_capacity(particles.len());
    let mut applied = params.clone();
    for (a, &index) in particles.iter().enumerate() {
        let o = PARAMS_PER_PARTICLE * a;
        let before = state.particle(index)?;
        let mut update = ParticleUpdate::new(
            Vector3::new(params[o], params[o + 1], params[o + 2]),
            params[o + 3],
        );
        let after = resolve_update(index, &before, &mut update, relative, fix_errors, shape)?;
        applied[o] = update.pos[0];
        applied[o + 1] = update.pos[1];
        applied[o + 2] = update.pos[2];
        applied[o + 3] = update.rad;
        moves.push((index, before, after));
    }
    *params = applied;

    let image = Tile::from_shape(shape);
    let mut supports = Vec::with_capacity(moves.len());
    for (index, before, after) in moves {
        supports.push(state.particle_support(&before, &after).intersection(&image));
        state.set_particle(index, after)?;
    }

    let Some(bounding) = Tile::bounding(&supports) else {
        let empty = Tile::new([0; 3], [0; 3]);
        return Ok(UpdateTiles {
            outer: empty,
            inner: empty,
            io: empty,
        });
    };
    let tiles = tiles_for_support(state, &bounding);
    state.update_tile(&tiles)?;
    Ok(tiles)
}

/// Bounding tile of the regions touched by every listed particle as it currently sits.
pub fn particle_group_tile<S: ParticleState + ?Sized>(
    state: &S,
    particles: &[usize],
) -> CoreResult<Tile> {
    let mut outers = Vec::with_capacity(particles.len());
    for &index in particles {
        let p = state.particle(index)?;
        outers.push(tiles_from_particle_change(state, &p, &p).outer);
    }
    Ok(Tile::bounding(&outers).unwrap_or(Tile::new([0; 3], [0; 3])))
}

/// Indices of the particles with `l < pos <= r` on every axis.
pub fn find_particles_in_box<S: ParticleState + ?Sized>(
    state: &S,
    bounds: &Tile,
) -> CoreResult<Vec<usize>> {
    let positions = state.particle_positions()?;
    Ok(members(&positions, bounds, [false; 3]))
}

/// Indices of `positions` inside `bounds`. Membership is `l < pos <= r`, or `l <= pos <= r` on
/// the axes flagged in `closed_low`.
fn members(positions: &[Vector3<f64>], bounds: &Tile, closed_low: [bool; 3]) -> Vec<usize> {
    positions
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            (0..3).all(|a| {
                let l = bounds.l[a] as f64;
                let above = if closed_low[a] { p[a] >= l } else { p[a] > l };
                above && p[a] <= bounds.r[a] as f64
            })
        })
        .map(|(i, _)| i)
        .collect()
}

/// Particles sharing one grouping box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleGroup {
    /// Grouping box the particles were found in
    pub region: Tile,
    /// Particle indices, ascending
    pub particles: Vec<usize>,
}

/// Split the particles inside `bounds` (whole volume by default) into groups of nearby
/// particles by tiling the bounds with boxes of `region_size`.
///
/// Boxes hold particles with `l < pos <= r`, except that the first box along each axis also
/// takes particles sitting on its lower face. Boxes at the far edge are clipped to `bounds`, so
/// every particle inside the closed bounds lands in exactly one group. Empty boxes produce no
/// group.
pub fn separate_particles_into_groups<S: ParticleState + ?Sized>(
    state: &S,
    region_size: [i64; 3],
    bounds: Option<Tile>,
) -> CoreResult<Vec<ParticleGroup>> {
    if region_size.iter().any(|&r| r <= 0) {
        return Err(CoreError::InvalidInput(format!(
            "region size must be positive on every axis, got {region_size:?}"
        ))
        .log());
    }
    let bounds = bounds.unwrap_or_else(|| Tile::from_shape(state.shape()));

    let starts = |axis: usize| {
        (bounds.l[axis]..bounds.r[axis])
            .step_by(region_size[axis] as usize)
            .collect::<Vec<_>>()
    };
    let (s0, s1, s2) = (starts(0), starts(1), starts(2));
    let positions = state.particle_positions()?;

    let mut groups = Vec::new();
    for &a in &s0 {
        for &b in &s1 {
            for &c in &s2 {
                let region = Tile::new(
                    [a, b, c],
                    [
                        (a + region_size[0]).min(bounds.r[0]),
                        (b + region_size[1]).min(bounds.r[1]),
                        (c + region_size[2]).min(bounds.r[2]),
                    ],
                );
                let closed_low = [a == bounds.l[0], b == bounds.l[1], c == bounds.l[2]];
                let particles = members(&positions, &region, closed_low);
                if !particles.is_empty() {
                    groups.push(ParticleGroup { region, particles });
                }
            }
        }
    }
    debug!(
        "Separated particles into {} groups with region size {:?}",
        groups.len(),
        region_size
    );
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ImageState;
    use crate::synthetic::{SyntheticModel, SyntheticState};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn two_particle_state() -> Result<SyntheticState, Box<dyn std::error::Error>> {
        let model = SyntheticModel::new([16, 16, 16])
            .with_particle(Particle::new(Vector3::new(5.0, 5.0, 5.0), 2.0, 1.0))
            .with_particle(Particle::new(Vector3::new(11.0, 10.0, 9.0), 2.5, 1.0));
        let image = model.render();
        Ok(SyntheticState::new(image, model)?)
    }

    #[test]
    fn test_invalid_update_is_rejected() -> TestResult {
        let mut state = two_particle_state()?;
        let params = state.parameters().clone();
        let mut update = ParticleUpdate::new(Vector3::new(-1.0, 5.0, 5.0), 2.0);
        let result = update_one_particle(&mut state, 0, &mut update, false, false, true);
        assert!(matches!(
            result,
            Err(CoreError::InvalidParticleUpdate { index: 0, .. })
        ));
        assert_eq!(state.parameters(), &params);
        Ok(())
    }

    #[test]
    fn test_fix_errors_clamps_each_axis() -> TestResult {
        let mut state = two_particle_state()?;
        let mut update = ParticleUpdate::new(Vector3::new(-10.0, 0.5, 40.0), -5.0);
        update_one_particle(&mut state, 0, &mut update, true, true, true)?;

        let p = state.particle(0)?;
        assert!((p.pos[0] - MIN_DIST).abs() < 1e-12);
        assert!((p.pos[1] - 5.5).abs() < 1e-12);
        assert!((p.pos[2] - (16.0 - MIN_DIST)).abs() < 1e-12);
        assert!((p.rad - MIN_DIST).abs() < 1e-12);
        // The clamped request is what was applied.
        assert!((update.pos[0] - (MIN_DIST - 5.0)).abs() < 1e-12);
        assert!((update.rad - (MIN_DIST - 2.0)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_relative_update_round_trip() -> TestResult {
        let mut state = two_particle_state()?;
        let params = state.parameters().clone();
        let err = state.error();

        let mut delta = DVector::from_vec(vec![0.3, -0.2, 0.1, 0.05, -0.4, 0.2, 0.0, -0.1]);
        update_particles(&mut state, &[0, 1], &mut delta, true, true)?;
        assert!(state.error() > err);

        let mut back = -delta;
        update_particles(&mut state, &[0, 1], &mut back, true, true)?;
        assert!((state.parameters() - &params).amax() < 1e-12);
        assert!((state.error() - err).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_local_update_matches_rebuild() -> TestResult {
        let mut state = two_particle_state()?;
        let mut delta = DVector::from_vec(vec![0.4, 0.3, -0.2, 0.2, 0.0, 0.0, 0.0, 0.0]);
        update_particles(&mut state, &[0, 1], &mut delta, true, false)?;
        let local = state.model_image().clone();
        state.rebuild()?;
        let max_diff = (&local - state.model_image())
            .iter()
            .fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(max_diff < 1e-10, "max difference {max_diff}");
        Ok(())
    }

    #[test]
    fn test_find_particles_in_box_is_half_open() -> TestResult {
        let state = two_particle_state()?;
        assert_eq!(
            find_particles_in_box(&state, &Tile::new([0, 0, 0], [5, 5, 5]))?,
            vec![0]
        );
        assert!(find_particles_in_box(&state, &Tile::new([5, 5, 5], [10, 10, 10]))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_groups_partition_particles() -> TestResult {
        let state = two_particle_state()?;
        for size in [[3, 3, 3], [7, 5, 4], [40, 40, 40]] {
            let groups = separate_particles_into_groups(&state, size, None)?;
            let mut seen: Vec<usize> = groups.iter().flat_map(|g| g.particles.clone()).collect();
            seen.sort_unstable();
            assert_eq!(seen, vec![0, 1], "region size {size:?}");
        }
        assert!(separate_particles_into_groups(&state, [0, 4, 4], None).is_err());
        Ok(())
    }

    #[test]
    fn test_bad_update_in_batch_leaves_state_untouched() -> TestResult {
        let mut state = two_particle_state()?;
        let params = state.parameters().clone();
        let model = state.model_image().clone();

        // The first particle's move is valid, the second one leaves the volume.
        let mut delta = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 0.0]);
        let requested = delta.clone();
        let result = update_particles(&mut state, &[0, 1], &mut delta, true, false);
        assert!(matches!(
            result,
            Err(CoreError::InvalidParticleUpdate { index: 1, .. })
        ));
        assert_eq!(state.parameters(), &params);
        assert_eq!(state.model_image(), &model);
        assert_eq!(delta, requested);
        assert!(state.error() < 1e-20);

        // The untouched state still matches a full render.
        state.rebuild()?;
        let max_diff = (&model - state.model_image())
            .iter()
            .fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(max_diff < 1e-12, "max difference {max_diff}");
        Ok(())
    }

    #[test]
    fn test_particle_on_lower_face_is_grouped() -> TestResult {
        let mut state = two_particle_state()?;
        let mut update = ParticleUpdate::new(Vector3::new(0.0, 5.0, 5.0), 2.0);
        update_one_particle(&mut state, 0, &mut update, false, false, true)?;
        let mut update = ParticleUpdate::new(Vector3::new(8.0, 0.0, 16.0), 2.0);
        update_one_particle(&mut state, 1, &mut update, false, false, true)?;

        for bounds in [None, Some(Tile::from_shape([16, 16, 16]))] {
            let groups = separate_particles_into_groups(&state, [8, 8, 8], bounds)?;
            let mut seen: Vec<usize> = groups.iter().flat_map(|g| g.particles.clone()).collect();
            seen.sort_unstable();
            assert_eq!(seen, vec![0, 1]);
            // Shared faces still belong to the lower box only.
            let owner = groups.iter().find(|g| g.particles.contains(&1)).map(|g| g.region);
            assert_eq!(owner, Some(Tile::new([0, 0, 8], [8, 8, 16])));
        }
        // The standalone box query keeps its open lower face.
        assert!(find_particles_in_box(&state, &Tile::new([0, 0, 0], [8, 8, 8]))?.is_empty());
        Ok(())
    }
}
