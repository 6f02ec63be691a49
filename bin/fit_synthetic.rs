use clap::Parser;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};
use voxfit::core::{ImageState, ParamCategory, Particle, ParticleState};
use voxfit::logger::{init_logger_with_level, level_from_verbosity};
use voxfit::optimizer::{
    ConjugateDirection, ConjugateDirectionConfig, LevenbergMarquardt, LevenbergMarquardtConfig,
    LinearFit, LinearFitConfig, ParticleGroupConfig, ParticleLevenbergMarquardt,
};
use voxfit::synthetic::{SyntheticModel, SyntheticState};
use voxfit::{VoxfitError, VoxfitResult};
use web_time::Instant;

#[derive(Parser)]
#[command(name = "fit_synthetic")]
#[command(about = "Fit a perturbed model to a noisy synthetic particle volume")]
struct Args {
    /// Edge length of the cubic volume in voxels
    #[arg(short, long, default_value = "32")]
    size: usize,

    /// Particle spacing on the lattice
    #[arg(long, default_value = "10.0")]
    spacing: f64,

    /// Particle radius
    #[arg(long, default_value = "2.5")]
    radius: f64,

    /// Noise level of the observed volume
    #[arg(long, default_value = "0.02")]
    noise: f64,

    /// Largest position perturbation applied to the starting guess
    #[arg(long, default_value = "0.4")]
    jitter: f64,

    /// Grouping box edge length for the particle sweep
    #[arg(long, default_value = "12")]
    region_size: i64,

    /// Number of global Levenberg-Marquardt iterations
    #[arg(long, default_value = "5")]
    num_iter: usize,

    /// Seed for noise, perturbations and pixel sampling
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn lattice(args: &Args) -> Vec<Particle> {
    let margin = args.radius + 3.0;
    let upper = args.size as f64 - margin;
    let mut coords = Vec::new();
    let mut x = margin;
    while x <= upper {
        coords.push(x);
        x += args.spacing;
    }
    let mut particles = Vec::new();
    for &z in &coords {
        for &y in &coords {
            for &x in &coords {
                particles.push(Particle::new(Vector3::new(z, y, x), args.radius, 1.0));
            }
        }
    }
    particles
}

fn mean_position_error(state: &SyntheticState, truth: &[Particle]) -> VoxfitResult<f64> {
    let mut total = 0.0;
    for (i, p) in truth.iter().enumerate() {
        total += (state.particle(i)?.pos - p.pos).norm();
    }
    Ok(total / truth.len().max(1) as f64)
}

fn run(args: &Args) -> VoxfitResult<()> {
    let truth = SyntheticModel::new([args.size; 3])
        .with_particles(lattice(args))
        .with_ilm(1.0, 0.2)
        .with_bkg(0.1, -0.05)
        .with_offset(0.1)
        .with_sigma(args.noise);
    let image = truth.render_noisy(args.seed)?;
    info!(
        "Synthetic volume {:?} with {} particles, noise {}",
        truth.shape,
        truth.particles.len(),
        args.noise
    );

    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    let mut jitter = || rng.random_range(-args.jitter..=args.jitter);
    let particles = truth
        .particles
        .iter()
        .map(|p| {
            Particle::new(
                p.pos + Vector3::new(jitter(), jitter(), jitter()),
                p.rad * (1.0 + 0.2 * jitter()),
                p.typ,
            )
        })
        .collect();
    let start = SyntheticModel {
        particles,
        ..truth.clone()
    }
    .with_ilm(0.9, 0.0)
    .with_bkg(0.0, 0.0)
    .with_offset(0.0);
    let mut state = SyntheticState::new(image, start)?;
    let total = Instant::now();
    info!(
        "Start: error {:.6e}, mean position error {:.4}",
        state.error(),
        mean_position_error(&state, &truth.particles)?
    );

    let linear = state
        .layout()
        .blocks(&[ParamCategory::Ilm, ParamCategory::Bkg, ParamCategory::Off])?;
    let fit = LinearFit::with_config(LinearFitConfig::new().with_seed(args.seed))
        .optimize(&mut state, &linear)?;
    info!(
        "Linear fit: error {:.6e} -> {:.6e}",
        fit.initial_error, fit.final_error
    );

    let groups = ParticleLevenbergMarquardt::new().optimize_all_groups(
        &mut state,
        &ParticleGroupConfig::new().with_region_size(args.region_size),
    )?;
    info!(
        "Particle groups: {} groups, {} without trouble, error {:.6e} -> {:.6e}",
        groups.groups.len(),
        groups.no_trouble.iter().filter(|&&ok| ok).count(),
        groups.initial_error,
        groups.final_error
    );

    let global = state.layout().blocks(&[
        ParamCategory::Psf,
        ParamCategory::Ilm,
        ParamCategory::Bkg,
        ParamCategory::Off,
    ])?;
    let lm = LevenbergMarquardt::with_config(
        LevenbergMarquardtConfig::new()
            .with_num_iter(args.num_iter)
            .with_seed(args.seed),
    )
    .optimize(&mut state, &global)?;
    info!("{}", lm);

    let cd = ConjugateDirection::with_config(ConjugateDirectionConfig::new().with_seed(args.seed))
        .optimize(&mut state, &global)?;
    info!("{}", cd);

    info!(
        "Done in {:.2}ms: error {:.6e}, mean position error {:.4}",
        total.elapsed().as_secs_f64() * 1000.0,
        state.error(),
        mean_position_error(&state, &truth.particles)?
    );
    Ok(())
}

fn main() -> Result<(), VoxfitError> {
    let args = Args::parse();
    init_logger_with_level(level_from_verbosity(args.verbose));

    info!("VOXFIT SYNTHETIC FIT\n");
    run(&args).inspect_err(|e| error!("Fit failed: {}", e.chain()))
}
