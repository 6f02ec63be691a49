//! End-to-end tests for voxfit
//!
//! Every scenario fits a perturbed synthetic model back to a volume rendered from the true
//! parameters, driving the optimizers only through the public API.
//!
//! # Test Coverage
//!
//! - **Global LM**: monotonic error on linear blocks, single-blob convergence on a particle block
//! - **Particle LM**: group sweep over a lattice of particles
//! - **Conjugate directions** and **linear fits**
//! - **Configuration errors**: infeasible pixel budgets and invalid particle updates

use nalgebra::{DVector, Vector3};
use voxfit::core::{
    CoreError, ImageState, ParamCategory, Particle, ParticleState, Tile,
    separate_particles_into_groups, update_particles,
};
use voxfit::jacobian::JacobianError;
use voxfit::optimizer::{
    ConjugateDirection, ConjugateDirectionConfig, LevenbergMarquardt, LevenbergMarquardtConfig,
    IterationHistory, LinearFit, LinearFitConfig, ParticleGroupConfig, ParticleLevenbergMarquardt,
};
use voxfit::synthetic::{SyntheticModel, SyntheticState};
use voxfit::{FiniteDifferenceConfig, PixelBudget, VoxfitError};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn assert_non_increasing(initial: f64, errors: &[f64]) {
    let mut last = initial;
    for &e in errors {
        assert!(e <= last * (1.0 + 1e-12), "error rose from {last} to {e}");
        last = e;
    }
}

fn lattice(shape: usize, spacing: f64, rad: f64) -> Vec<Particle> {
    let coords: Vec<f64> = (0..)
        .map(|i| 6.0 + spacing * i as f64)
        .take_while(|&c| c <= shape as f64 - 6.0)
        .collect();
    let mut particles = Vec::new();
    for &z in &coords {
        for &y in &coords {
            for &x in &coords {
                particles.push(Particle::new(Vector3::new(z, y, x), rad, 1.0));
            }
        }
    }
    particles
}

#[test]
fn test_global_lm_never_increases_error() -> TestResult {
    let truth = SyntheticModel::new([16, 16, 16])
        .with_particle(Particle::new(Vector3::new(8.0, 8.0, 8.0), 2.5, 1.0))
        .with_ilm(1.1, 0.2)
        .with_bkg(0.2, -0.1)
        .with_offset(0.3);
    let start = truth
        .clone()
        .with_ilm(1.0, 0.0)
        .with_bkg(0.0, 0.0)
        .with_offset(0.0);
    let mut state = SyntheticState::new(truth.render(), start)?;
    let block = state
        .layout()
        .blocks(&[ParamCategory::Ilm, ParamCategory::Bkg, ParamCategory::Off])?;

    let recorder = IterationHistory::new();
    let mut solver = LevenbergMarquardt::with_config(
        LevenbergMarquardtConfig::new()
            .with_num_iter(6)
            .with_seed(21)
            .with_finite_difference(FiniteDifferenceConfig::new().with_dl(1e-6)),
    );
    solver.add_observer(recorder.clone());
    let summary = solver.optimize(&mut state, &block)?;

    let errors = recorder.errors()?;
    assert_eq!(errors.len(), summary.iterations);
    assert_non_increasing(summary.initial_error, &errors);
    assert!(summary.final_error < 1e-6 * summary.initial_error);
    Ok(())
}

#[test]
fn test_single_blob_converges_with_global_lm() -> TestResult {
    let true_pos = Vector3::new(8.0, 7.6, 8.3);
    let truth = SyntheticModel::new([16, 16, 16])
        .with_particle(Particle::new(true_pos, 2.5, 1.0));
    let start = SyntheticModel {
        particles: vec![Particle::new(
            true_pos + Vector3::new(0.3, -0.25, 0.2),
            2.35,
            1.0,
        )],
        ..truth.clone()
    };
    let mut state = SyntheticState::new(truth.render(), start)?;
    let block = state.layout().particle_block(0)?;

    let recorder = IterationHistory::new();
    let mut solver = LevenbergMarquardt::with_config(
        LevenbergMarquardtConfig::new()
            .with_num_iter(10)
            .with_seed(5)
            .with_finite_difference(FiniteDifferenceConfig::new().with_dl(1e-6)),
    );
    solver.add_observer(recorder.clone());
    let summary = solver.optimize(&mut state, &block)?;

    let truth_values = [true_pos[0], true_pos[1], true_pos[2], 2.5];
    let history = recorder.parameters()?;
    let converged_at = history.iter().position(|p| {
        let fitted = block.gather(p);
        fitted
            .iter()
            .zip(truth_values)
            .all(|(v, want)| (v - want).abs() < 1e-3)
    });
    let converged_at = converged_at.ok_or("never within 1e-3 of the truth")?;
    assert!(converged_at < 20, "converged after {converged_at} iterations");

    let p = state.particle(0)?;
    assert!((p.pos - true_pos).amax() < 1e-3);
    assert!((p.rad - 2.5).abs() < 1e-3);
    assert_non_increasing(
        summary.initial_error,
        &recorder.errors()?,
    );
    Ok(())
}

#[test]
fn test_particle_groups_fit_lattice() -> TestResult {
    let particles = lattice(28, 8.0, 2.0);
    assert_eq!(particles.len(), 27);
    let truth = SyntheticModel::new([28, 28, 28])
        .with_particles(particles.clone())
        .with_offset(0.1);
    let start = SyntheticModel {
        particles: particles
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let s = if i % 2 == 0 { 1.0 } else { -1.0 };
                Particle::new(p.pos + Vector3::new(0.15 * s, -0.1, 0.1 * s), 2.1, 1.0)
            })
            .collect(),
        ..truth.clone()
    };
    let mut state = SyntheticState::new(truth.render(), start)?;

    let config = ParticleGroupConfig::new().with_region_size(8);
    let summary = ParticleLevenbergMarquardt::new().optimize_all_groups(&mut state, &config)?;

    let mut fitted: Vec<usize> = summary
        .groups
        .iter()
        .flat_map(|g| g.particles.iter().copied())
        .collect();
    fitted.sort_unstable();
    assert_eq!(fitted, (0..27).collect::<Vec<_>>());
    assert_eq!(summary.no_trouble.len(), summary.groups.len());
    assert_eq!(summary.drift_events, 0);
    assert!(summary.final_error < 1e-2 * summary.initial_error);
    for (i, p) in particles.iter().enumerate() {
        assert!((state.particle(i)?.pos - p.pos).amax() < 2e-2);
    }
    Ok(())
}

#[test]
fn test_groups_partition_particles_in_bounds() -> TestResult {
    let truth = SyntheticModel::new([28, 28, 28]).with_particles(lattice(28, 8.0, 2.0));
    let state = SyntheticState::new(truth.render(), truth)?;
    let bounds = Tile::new([0, 0, 0], [28, 15, 28]);

    let groups = separate_particles_into_groups(&state, [5, 7, 9], Some(bounds))?;
    let mut seen: Vec<usize> = groups
        .iter()
        .flat_map(|g| g.particles.iter().copied())
        .collect();
    seen.sort_unstable();
    let expected: Vec<usize> = state
        .particle_positions()?
        .iter()
        .enumerate()
        .filter(|(_, p)| p[1] <= 15.0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(expected.len(), 18);
    Ok(())
}

#[test]
fn test_conjugate_directions_then_lm() -> TestResult {
    let truth = SyntheticModel::new([14, 14, 14])
        .with_particle(Particle::new(Vector3::new(7.0, 7.0, 7.0), 2.5, 1.0))
        .with_ilm(1.2, 0.0)
        .with_offset(0.25)
        .with_pad(0);
    let start = truth.clone().with_ilm(1.0, 0.0).with_offset(0.0);
    let mut state = SyntheticState::new(truth.render(), start)?;
    let block = state.layout().blocks(&[ParamCategory::Ilm, ParamCategory::Off])?;

    let cd = ConjugateDirection::with_config(ConjugateDirectionConfig::new().with_seed(8))
        .optimize(&mut state, &block)?;
    assert!(cd.final_error < 1e-3 * cd.initial_error);

    let lm = LevenbergMarquardt::with_config(LevenbergMarquardtConfig::new().with_seed(9))
        .optimize(&mut state, &block)?;
    assert!(lm.final_error <= cd.final_error);
    let fitted = state.block_values(&block);
    assert!((fitted[0] - 1.2).abs() < 1e-4);
    assert!((fitted[2] - 0.25).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_linear_fit_on_noisy_volume() -> TestResult {
    let truth = SyntheticModel::new([20, 20, 20])
        .with_particles(lattice(20, 8.0, 2.5))
        .with_ilm(1.3, 0.2)
        .with_bkg(0.1, 0.05)
        .with_offset(0.2)
        .with_sigma(0.01);
    let image = truth.render_noisy(17)?;
    let start = truth
        .clone()
        .with_ilm(1.0, 0.0)
        .with_bkg(0.0, 0.0)
        .with_offset(0.0);
    let mut state = SyntheticState::new(image, start)?;
    let block = state
        .layout()
        .blocks(&[ParamCategory::Ilm, ParamCategory::Bkg, ParamCategory::Off])?;

    let summary = LinearFit::with_config(LinearFitConfig::new().with_seed(3))
        .optimize(&mut state, &block)?;
    assert!(!summary.reverted);
    assert!(summary.final_error < summary.initial_error);
    let fitted = state.block_values(&block);
    for (value, want) in fitted.iter().zip([1.3, 0.2, 0.1, 0.05, 0.2]) {
        assert!((value - want).abs() < 2e-2, "{value} vs {want}");
    }
    Ok(())
}

#[test]
fn test_infeasible_pixel_budget_is_rejected() -> TestResult {
    let truth = SyntheticModel::new([10, 10, 10]).with_offset(0.1);
    let mut state = SyntheticState::new(truth.render(), truth.clone().with_offset(0.0))?;
    let block = state.layout().blocks(&[ParamCategory::Bkg, ParamCategory::Off])?;

    // 20 pixels per parameter need 480 bytes for three parameters.
    let config =
        LevenbergMarquardtConfig::new().with_pixel_budget(PixelBudget::new().with_max_mem(400.0));
    let before = state.parameters().clone();
    let result = LevenbergMarquardt::with_config(config).optimize(&mut state, &block);
    assert!(matches!(
        result,
        Err(VoxfitError::Jacobian(
            JacobianError::InfeasiblePixelBudget { nparams: 3, .. }
        ))
    ));
    assert_eq!(state.parameters(), &before);
    Ok(())
}

#[test]
fn test_particle_update_outside_volume() -> TestResult {
    let truth = SyntheticModel::new([12, 12, 12])
        .with_particle(Particle::new(Vector3::new(6.0, 6.0, 6.0), 2.0, 1.0));
    let mut state = SyntheticState::new(truth.render(), truth)?;

    let mut step = DVector::from_vec(vec![10.0, 0.0, 0.0, 0.0]);
    let result = update_particles(&mut state, &[0], &mut step, true, false);
    assert!(matches!(
        result,
        Err(CoreError::InvalidParticleUpdate { index: 0, .. })
    ));
    assert_eq!(state.particle(0)?.pos, Vector3::new(6.0, 6.0, 6.0));

    update_particles(&mut state, &[0], &mut step, true, true)?;
    let moved = state.particle(0)?;
    assert!((moved.pos[0] - (12.0 - voxfit::core::MIN_DIST)).abs() < 1e-12);
    assert!(step[0] < 10.0);

    let mut back = -&step;
    update_particles(&mut state, &[0], &mut back, true, false)?;
    assert!((state.particle(0)?.pos - Vector3::new(6.0, 6.0, 6.0)).amax() < 1e-12);
    Ok(())
}
