//! Levenberg-Marquardt over particle positions and radii.
//!
//! Unlike the global driver, the Jacobian here is exact: every masked pixel of the tile touched
//! by the particles enters it, four rows per particle `(p0, p1, p2, r)`. Steps go through
//! [`update_particles`] in relative mode with clamping, so a step that would push a particle out
//! of the volume is cut back instead of failing. The clamped deltas are what gets rolled back.
//!
//! [`ParticleLevenbergMarquardt::optimize_all_groups`] sweeps the whole volume: particles are
//! split into groups by grouping boxes, each group is fitted on its own, and the model is rebuilt
//! after every group to catch drift between local and full renders.

use crate::core::particles::particle_group_tile;
use crate::core::{
    CoreError, CoreResult, ImageState, ParticleGroup, ParticleState, Tile,
    separate_particles_into_groups, update_particles,
};
use crate::error::VoxfitResult;
use crate::jacobian::{particle_jacobian, tile_residuals};
use crate::linalg::{NormalEquationsSolver, gradient, jtj};
use crate::optimizer::damping::PARTICLE_BAD_STEP_WEIGHT;
use crate::optimizer::{
    DampingController, IterationStats, LevenbergMarquardtConfig, LevmarqSummary, OptObserverVec,
    StepOutcome, TrialChoice,
};
use faer::Mat;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

/// Rolled-back error may exceed the start error by this much before the snapshot is restored.
pub const ROLLBACK_TOLERANCE: f64 = 1e-3;

/// Relative error change across a rebuild reported as drift.
pub const DRIFT_TOLERANCE: f64 = 1e-7;

/// Bytes per Jacobian entry assumed by [`calc_region_size`], with room for temporaries.
const BYTES_PER_ENTRY: f64 = 32.0;

struct TileLinearization {
    tile: Tile,
    j: Mat<f64>,
    jtj: DMatrix<f64>,
}

/// Levenberg-Marquardt driver over a list of particles.
pub struct ParticleLevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    observers: OptObserverVec,
}

impl Default for ParticleLevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticleLevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::for_particles())
    }

    /// The pixel budget and seed of `config` are unused; particle Jacobians are exact.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            config,
            observers: OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    pub fn add_observer(&mut self, observer: impl crate::optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    fn linearize<S: ParticleState + ?Sized>(
        &self,
        state: &mut S,
        particles: &[usize],
    ) -> VoxfitResult<TileLinearization> {
        let tile = particle_group_tile(state, particles)?;
        let j = particle_jacobian(state, particles, &tile, &self.config.finite_difference)?;
        Ok(TileLinearization {
            jtj: jtj(&j),
            j,
            tile,
        })
    }

    fn run<S: ParticleState + ?Sized>(
        &self,
        state: &mut S,
        particles: &[usize],
        lin: &TileLinearization,
        solver: &NormalEquationsSolver,
        damp: f64,
    ) -> VoxfitResult<usize> {
        let mut taken = 0;
        for _ in 0..self.config.run_length {
            let old_err = state.error();
            let snapshot = state.snapshot();
            let grad = gradient(&lin.j, &tile_residuals(state, &lin.tile))?;
            let mut dnew = solver.solve(&lin.jtj, &grad, damp)?.delta;
            update_particles(state, particles, &mut dnew, true, true)?;
            if state.error() > old_err {
                state.restore(&snapshot)?;
                break;
            }
            taken += 1;
        }
        debug!("Particle run kept {} of {} steps", taken, self.config.run_length);
        Ok(taken)
    }

    /// Fit the positions and radii of `particles`.
    pub fn optimize<S: ParticleState + ?Sized>(
        &mut self,
        state: &mut S,
        particles: &[usize],
    ) -> VoxfitResult<LevmarqSummary> {
        self.config.validate()?;
        let mut seen = BTreeSet::new();
        for &index in particles {
            state.particle(index)?;
            if !seen.insert(index) {
                return Err(CoreError::InvalidInput(format!(
                    "particle {index} listed twice"
                ))
                .log()
                .into());
            }
        }

        let start = Instant::now();
        let initial_error = state.error();
        let mut summary = LevmarqSummary::new(initial_error, self.config.damping);
        let mut damping = DampingController::new(
            self.config.damping,
            self.config.damping_step,
            self.config.num_iter,
            PARTICLE_BAD_STEP_WEIGHT,
        )?;
        if particles.is_empty() {
            summary.finish(initial_error, &damping, 0, start);
            return Ok(summary);
        }

        let solver =
            NormalEquationsSolver::new(self.config.linear_solver_type, self.config.min_eigval);
        debug!("Optimizing {} particles", particles.len());
        IterationStats::print_header();

        let mut reuse: Option<TileLinearization> = None;
        let mut iteration = 0;
        while !damping.finished() {
            let iter_start = Instant::now();
            let err_start = state.error();
            let snapshot = state.snapshot();

            let lin = match reuse.take() {
                Some(lin) => lin,
                None => {
                    let lin = self.linearize(state, particles)?;
                    state.restore(&snapshot)?;
                    summary.jacobian_evaluations += 1;
                    summary.num_pixels = lin.j.ncols();
                    damping.on_new_jacobian();
                    lin
                }
            };

            let grad = gradient(&lin.j, &tile_residuals(state, &lin.tile))?;
            let (damp0, damp1) = damping.trial_dampings();
            let step0 = solver.solve(&lin.jtj, &grad, damp0)?;
            let step1 = solver.solve(&lin.jtj, &grad, damp1)?;

            let mut d0 = step0.delta.clone();
            update_particles(state, particles, &mut d0, true, true)?;
            let err0 = state.error();
            let mut d1md0 = &step1.delta - &d0;
            update_particles(state, particles, &mut d1md0, true, true)?;
            let err1 = state.error();

            let (accepted, step_norm, rank, run_steps) =
                match damping.evaluate(err_start, err0, err1) {
                    StepOutcome::Bad => {
                        let mut back: DVector<f64> = -&d1md0 - &d0;
                        update_particles(state, particles, &mut back, true, true)?;
                        let err_back = state.error();
                        if err_back > err_start + ROLLBACK_TOLERANCE {
                            warn!(
                                "Particle rollback left error {:.6e} above start {:.6e}, restoring snapshot",
                                err_back, err_start
                            );
                            state.restore(&snapshot)?;
                        }
                        summary.bad_steps += 1;
                        reuse = Some(lin);
                        (false, 0.0, step0.rank, 0)
                    }
                    StepOutcome::Good(choice) => {
                        let (norm, rank) = match choice {
                            TrialChoice::First => {
                                let mut back = -&d1md0;
                                update_particles(state, particles, &mut back, true, false)?;
                                (d0.norm(), step0.rank)
                            }
                            TrialChoice::Second => ((&d0 + &d1md0).norm(), step1.rank),
                        };
                        summary.good_steps += 1;
                        let runs = if self.config.do_run {
                            self.run(state, particles, &lin, &solver, damping.damping())?
                        } else {
                            0
                        };
                        summary.run_steps += runs;
                        (true, norm, rank, runs)
                    }
                };

            let error = state.error();
            let stats = IterationStats {
                iteration,
                error,
                error_change: err_start - error,
                gradient_norm: grad.norm(),
                step_norm,
                damping: damping.damping(),
                rank,
                run_steps,
                iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                accepted,
            };
            stats.print_line();
            self.observers.set_iteration_metrics(
                error,
                stats.gradient_norm,
                Some(stats.damping),
                step_norm,
                Some(accepted),
            );
            self.observers.notify(state.parameters(), iteration);
            summary.iteration_history.push(stats);
            iteration += 1;
        }

        summary.finish(state.error(), &damping, iteration, start);
        Ok(summary)
    }

    /// Fit every particle group of the volume in turn.
    ///
    /// After each group the model is rebuilt from scratch; a relative error change above
    /// [`DRIFT_TOLERANCE`] is logged as drift and the rebuilt model is kept.
    pub fn optimize_all_groups<S: ParticleState + ?Sized>(
        &mut self,
        state: &mut S,
        groups_config: &ParticleGroupConfig,
    ) -> VoxfitResult<GroupSummary> {
        groups_config.validate()?;
        let start = Instant::now();
        let initial_error = state.error();

        let region_size = if groups_config.calc_region_size {
            calc_region_size(
                state,
                groups_config.region_size,
                groups_config.max_mem,
                groups_config.bounds,
            )?
        } else {
            groups_config.region_size
        };
        let groups = separate_particles_into_groups(state, region_size, groups_config.bounds)?;
        debug!(
            "Fitting {} particle groups with region size {:?}",
            groups.len(),
            region_size
        );

        let mut summary = GroupSummary {
            region_size,
            groups: Vec::with_capacity(groups.len()),
            no_trouble: Vec::with_capacity(groups.len()),
            update_regions: Vec::with_capacity(groups.len()),
            summaries: Vec::with_capacity(groups.len()),
            initial_error,
            final_error: initial_error,
            drift_events: 0,
            total_time: Duration::ZERO,
        };

        for (i, group) in groups.into_iter().enumerate() {
            let region = particle_group_tile(state, &group.particles)?;
            let result = self.optimize(state, &group.particles)?;

            let old_err = state.error();
            state.rebuild()?;
            let new_err = state.error();
            if (old_err - new_err).abs() > DRIFT_TOLERANCE * old_err {
                warn!(
                    "State drift detected after group {}: error {:.10e} before rebuild, {:.10e} after",
                    i, old_err, new_err
                );
                summary.drift_events += 1;
            }
            debug!(
                "Group {} ({} particles): error {:.6e} -> {:.6e}",
                i,
                group.particles.len(),
                result.initial_error,
                result.final_error
            );

            summary.no_trouble.push(result.no_trouble);
            summary.summaries.push(result);
            summary.update_regions.push(region);
            summary.groups.push(group);
        }

        summary.final_error = state.error();
        summary.total_time = start.elapsed();
        info!(
            "Particle groups: {} fitted, error {:.6e} -> {:.6e}",
            summary.groups.len(),
            summary.initial_error,
            summary.final_error
        );
        Ok(summary)
    }
}

/// Settings for [`ParticleLevenbergMarquardt::optimize_all_groups`].
#[derive(Debug, Clone)]
pub struct ParticleGroupConfig {
    /// Edge lengths of the grouping boxes
    pub region_size: [i64; 3],
    /// Derive the region size from `max_mem`, starting at `region_size`
    pub calc_region_size: bool,
    /// Memory ceiling for the group Jacobian in bytes
    pub max_mem: f64,
    /// Only particles inside these bounds are fitted; the whole volume by default
    pub bounds: Option<Tile>,
}

impl Default for ParticleGroupConfig {
    fn default() -> Self {
        Self {
            region_size: [40; 3],
            calc_region_size: false,
            max_mem: 4e9,
            bounds: None,
        }
    }
}

impl ParticleGroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cubic grouping boxes.
    pub fn with_region_size(mut self, region_size: i64) -> Self {
        self.region_size = [region_size; 3];
        self
    }

    pub fn with_region_size_per_axis(mut self, region_size: [i64; 3]) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_calc_region_size(mut self, calc_region_size: bool) -> Self {
        self.calc_region_size = calc_region_size;
        self
    }

    pub fn with_max_mem(mut self, max_mem: f64) -> Self {
        self.max_mem = max_mem;
        self
    }

    pub fn with_bounds(mut self, bounds: Tile) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.region_size.iter().any(|&r| r <= 0) {
            return Err(CoreError::InvalidInput(format!(
                "region size must be positive on every axis, got {:?}",
                self.region_size
            ))
            .log());
        }
        if !(self.max_mem > 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "max_mem must be positive, got {}",
                self.max_mem
            ))
            .log());
        }
        Ok(())
    }
}

/// Outcome of a sweep over all particle groups.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    /// Region size the groups were built with
    pub region_size: [i64; 3],
    pub groups: Vec<ParticleGroup>,
    /// Per-group `no_trouble` flags, in group order
    pub no_trouble: Vec<bool>,
    /// Padded tile each group's Jacobian covered when it started
    pub update_regions: Vec<Tile>,
    pub summaries: Vec<LevmarqSummary>,
    pub initial_error: f64,
    pub final_error: f64,
    /// Groups after which the rebuild changed the error noticeably
    pub drift_events: usize,
    pub total_time: Duration,
}

impl GroupSummary {
    pub fn all_no_trouble(&self) -> bool {
        self.no_trouble.iter().all(|&ok| ok)
    }
}

/// Estimate a region size whose largest group Jacobian fits in `max_mem`.
///
/// Memory is estimated as `32 · max_group_size · Π(region + 2·pad)` with `pad` the interior
/// border. Starting from `start`, the region shrinks by one on every axis (down to 2) while the
/// estimate is above `max_mem`, or otherwise grows while the next size still fits and stays
/// within the volume.
pub fn calc_region_size<S: ParticleState + ?Sized>(
    state: &S,
    start: [i64; 3],
    max_mem: f64,
    bounds: Option<Tile>,
) -> CoreResult<[i64; 3]> {
    let pad = state.interior().l;
    let shape = state.shape();
    let mem = |rs: [i64; 3]| -> CoreResult<f64> {
        let groups = separate_particles_into_groups(state, rs, bounds)?;
        let max_group = groups.iter().map(|g| g.particles.len()).max().unwrap_or(0);
        let volume: f64 = (0..3).map(|a| (rs[a] + 2 * pad[a]) as f64).product();
        Ok(BYTES_PER_ENTRY * max_group as f64 * volume)
    };

    let mut rs = start;
    if mem(rs)? > max_mem {
        while rs.iter().any(|&r| r > 2) && mem(rs)? > max_mem {
            rs = rs.map(|r| (r - 1).max(2));
        }
    } else {
        loop {
            let next = rs.map(|r| r + 1);
            if (0..3).any(|a| next[a] > shape[a] as i64) || mem(next)? > max_mem {
                break;
            }
            rs = next;
        }
    }
    debug!("Region size {:?} from start {:?}", rs, start);
    Ok(rs)
}
