//! Levenberg-Marquardt over an arbitrary parameter block with a stochastic Jacobian.
//!
//! Each outer iteration works on a Jacobian sampled at a random subset of interior pixels:
//!
//! ```text
//! J     = ∂(image - model)/∂p at the sampled pixels   (nparams × npixels)
//! JTJ   = J·Jᵗ
//! grad  = J·r
//! delta = solve((JTJ + damp·diag(JTJ))·delta = -grad)
//! ```
//!
//! Two trial steps (damped by `damp` and `damp·ddamp`) are compared against the error before the
//! iteration, always measured over the whole image, never the sample. See
//! [`DampingController`](crate::optimizer::DampingController) for how the pair is judged.
//!
//! After a kept step, up to `run_length` cheap extra steps reuse the same `J` and `JTJ` with a
//! refreshed gradient; the run stops at the first step that raises the error, which is undone.
//! A rejected pair reuses `J` for the next iteration; a kept pair resamples it.
//!
//! Kept steps never increase the global error.

use crate::core::{ImageState, ParameterBlock};
use crate::error::VoxfitResult;
use crate::jacobian::{
    FiniteDifferenceConfig, PixelBudget, PixelSample, sampled_residuals, stochastic_jacobian,
};
use crate::linalg::{LinearSolverType, NormalEquationsSolver, gradient, jtj};
use crate::optimizer::damping::GLOBAL_BAD_STEP_WEIGHT;
use crate::optimizer::{
    DampingController, IterationStats, OptObserverVec, OptimizerError, StepOutcome, TrialChoice,
    seeded_rng,
};
use faer::Mat;
use nalgebra::DMatrix;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::debug;
use web_time::{Duration, Instant};

/// Summary statistics of one Levenberg-Marquardt call.
#[derive(Debug, Clone)]
pub struct LevmarqSummary {
    /// False when the damping heuristic got stuck since the last Jacobian
    pub no_trouble: bool,
    /// Global error before the call
    pub initial_error: f64,
    /// Global error after the call
    pub final_error: f64,
    /// Outer iterations performed
    pub iterations: usize,
    /// Final value of the weighted iteration counter
    pub counter: f64,
    /// Iterations that kept a trial step
    pub good_steps: usize,
    /// Iterations whose trials were both rejected
    pub bad_steps: usize,
    /// Extra steps taken on reused Jacobians
    pub run_steps: usize,
    /// Final damping parameter value
    pub final_damping: f64,
    /// Number of Jacobians built
    pub jacobian_evaluations: usize,
    /// Pixels per Jacobian
    pub num_pixels: usize,
    /// Total time elapsed
    pub total_time: Duration,
    /// Detailed per-iteration statistics history
    pub iteration_history: Vec<IterationStats>,
}

impl LevmarqSummary {
    pub(crate) fn new(initial_error: f64, damping: f64) -> Self {
        Self {
            no_trouble: true,
            initial_error,
            final_error: initial_error,
            iterations: 0,
            counter: 0.0,
            good_steps: 0,
            bad_steps: 0,
            run_steps: 0,
            final_damping: damping,
            jacobian_evaluations: 0,
            num_pixels: 0,
            total_time: Duration::ZERO,
            iteration_history: Vec::new(),
        }
    }

    pub(crate) fn finish(
        &mut self,
        final_error: f64,
        damping: &DampingController,
        iterations: usize,
        start: Instant,
    ) {
        self.no_trouble = damping.no_trouble();
        self.final_error = final_error;
        self.iterations = iterations;
        self.counter = damping.counter();
        self.final_damping = damping.damping();
        self.total_time = start.elapsed();
    }
}

impl Display for LevmarqSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Levenberg-Marquardt Final Result")?;
        if self.no_trouble {
            writeln!(f, "NO TROUBLE")?;
        } else {
            writeln!(f, "STUCK (damping raised to {:.2e})", self.final_damping)?;
        }

        writeln!(f)?;
        writeln!(f, "Error:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_error)?;
        writeln!(f, "  Final:     {:.6e}", self.final_error)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_error - self.final_error,
            100.0 * (self.initial_error - self.final_error) / self.initial_error.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(f, "  Good steps:         {}", self.good_steps)?;
        writeln!(f, "  Bad steps:          {}", self.bad_steps)?;
        writeln!(f, "  Run steps:          {}", self.run_steps)?;
        writeln!(f, "  Jacobians:          {}", self.jacobian_evaluations)?;
        writeln!(f, "  Final damping:      {:.2e}", self.final_damping)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0 / self.iterations.max(1) as f64
        )?;

        Ok(())
    }
}

/// Configuration parameters for the Levenberg-Marquardt drivers.
///
/// ```
/// use voxfit::optimizer::LevenbergMarquardtConfig;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_num_iter(10)
///     .with_damping(1.0)
///     .with_seed(7);
/// ```
#[derive(Clone)]
pub struct LevenbergMarquardtConfig {
    /// Initial damping `damp`
    pub damping: f64,
    /// Multiplicative damping change `ddamp`
    pub damping_step: f64,
    /// Outer iterations; rejected steps count a fraction
    pub num_iter: usize,
    /// Take extra steps with each accepted Jacobian
    pub do_run: bool,
    /// Maximum number of extra steps per Jacobian
    pub run_length: usize,
    pub pixel_budget: PixelBudget,
    pub finite_difference: FiniteDifferenceConfig,
    /// Relative singular-value cutoff of the damped solve
    pub min_eigval: f64,
    pub linear_solver_type: LinearSolverType,
    /// Seed for pixel sampling; `None` draws from the OS
    pub seed: Option<u64>,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            damping: 0.1,
            damping_step: 0.1,
            num_iter: 5,
            do_run: true,
            run_length: 5,
            pixel_budget: PixelBudget::default(),
            finite_difference: FiniteDifferenceConfig::default(),
            min_eigval: 1e-12,
            linear_solver_type: LinearSolverType::default(),
            seed: None,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for fitting particle positions and radii.
    pub fn for_particles() -> Self {
        Self {
            damping_step: 0.2,
            num_iter: 3,
            finite_difference: FiniteDifferenceConfig::for_particles(),
            ..Self::default()
        }
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_step(mut self, damping_step: f64) -> Self {
        self.damping_step = damping_step;
        self
    }

    pub fn with_num_iter(mut self, num_iter: usize) -> Self {
        self.num_iter = num_iter;
        self
    }

    pub fn with_run(mut self, do_run: bool, run_length: usize) -> Self {
        self.do_run = do_run;
        self.run_length = run_length;
        self
    }

    pub fn with_pixel_budget(mut self, pixel_budget: PixelBudget) -> Self {
        self.pixel_budget = pixel_budget;
        self
    }

    pub fn with_finite_difference(mut self, finite_difference: FiniteDifferenceConfig) -> Self {
        self.finite_difference = finite_difference;
        self
    }

    pub fn with_min_eigval(mut self, min_eigval: f64) -> Self {
        self.min_eigval = min_eigval;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> VoxfitResult<()> {
        if !(self.damping.is_finite() && self.damping >= 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping must be finite and non-negative, got {}",
                self.damping
            ))
            .log()
            .into());
        }
        if !(self.damping_step.is_finite() && self.damping_step > 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping step must be finite and positive, got {}",
                self.damping_step
            ))
            .log()
            .into());
        }
        if self.do_run && self.run_length == 0 {
            return Err(OptimizerError::InvalidParameters(
                "run length must be positive when runs are enabled".to_string(),
            )
            .log()
            .into());
        }
        if !(self.min_eigval >= 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "min_eigval must be non-negative, got {}",
                self.min_eigval
            ))
            .log()
            .into());
        }
        self.pixel_budget.validate()?;
        self.finite_difference.validate()?;
        Ok(())
    }

    ///   Print configuration parameters (debug level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:          Levenberg-Marquardt\n  Linear solver:   {}\n  Iterations:      {}\n  Damping:         {:.2e}\n  Damping step:    {:.2e}\n  Run:             {} (length {})\n  Max memory:      {:.2e} bytes\n  Min redundant:   {}\n  Decimate:        {}\n  Finite diff dl:  {:.2e} ({:?}, be_nice {})\n  Min eigval:      {:.2e}\n  Seed:            {:?}",
            self.linear_solver_type,
            self.num_iter,
            self.damping,
            self.damping_step,
            if self.do_run { "enabled" } else { "disabled" },
            self.run_length,
            self.pixel_budget.max_mem,
            self.pixel_budget.min_redundant,
            self.pixel_budget.decimate,
            self.finite_difference.dl,
            self.finite_difference.stencil,
            self.finite_difference.be_nice,
            self.min_eigval,
            self.seed
        );
    }
}

/// A sampled Jacobian with its normal matrix, kept across rejected iterations.
struct Linearization {
    j: Mat<f64>,
    jtj: DMatrix<f64>,
    sample: PixelSample,
}

/// Levenberg-Marquardt driver over an arbitrary parameter block.
///
/// # Examples
///
/// ```no_run
/// use voxfit::core::{ImageState, ParamCategory};
/// use voxfit::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
/// use voxfit::synthetic::{SyntheticModel, SyntheticState};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let truth = SyntheticModel::new([16, 16, 16]).with_bkg(0.2, 0.1);
/// let mut state = SyntheticState::new(truth.render(), truth.clone().with_bkg(0.0, 0.0))?;
/// let block = state.layout().block(ParamCategory::Bkg)?;
///
/// let mut solver = LevenbergMarquardt::with_config(LevenbergMarquardtConfig::new().with_seed(1));
/// let summary = solver.optimize(&mut state, &block)?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    observers: OptObserverVec,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            config,
            observers: OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Add an observer notified after every outer iteration.
    pub fn add_observer(&mut self, observer: impl crate::optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Extra steps reusing `lin` at damping `damp`. Returns the number of steps kept.
    fn run<S: ImageState + ?Sized>(
        &self,
        state: &mut S,
        block: &ParameterBlock,
        lin: &Linearization,
        solver: &NormalEquationsSolver,
        damp: f64,
    ) -> VoxfitResult<usize> {
        let mut taken = 0;
        for _ in 0..self.config.run_length {
            let old_err = state.error();
            let snapshot = state.snapshot();
            let p = state.block_values(block);
            let grad = gradient(&lin.j, &sampled_residuals(state, &lin.sample))?;
            let step = solver.solve(&lin.jtj, &grad, damp)?;
            state.set_parameters(block, &(&p + &step.delta))?;
            let new_err = state.error();
            if new_err > old_err {
                state.restore(&snapshot)?;
                break;
            }
            taken += 1;
        }
        debug!("Run kept {} of {} steps", taken, self.config.run_length);
        Ok(taken)
    }

    /// Minimize the global error over `block`, leaving the state at the best parameters found.
    pub fn optimize<S: ImageState + ?Sized>(
        &mut self,
        state: &mut S,
        block: &ParameterBlock,
    ) -> VoxfitResult<LevmarqSummary> {
        self.config.validate()?;
        state.layout().validate()?;
        if block.len() != state.parameters().len() {
            return Err(crate::core::CoreError::DimensionMismatch(format!(
                "block covers {} parameters but the state has {}",
                block.len(),
                state.parameters().len()
            ))
            .log()
            .into());
        }

        let start = Instant::now();
        let initial_error = state.error();
        let mut summary = LevmarqSummary::new(initial_error, self.config.damping);
        let mut damping = DampingController::new(
            self.config.damping,
            self.config.damping_step,
            self.config.num_iter,
            GLOBAL_BAD_STEP_WEIGHT,
        )?;

        let nparams = block.count();
        if nparams == 0 {
            debug!("Empty parameter block, nothing to optimize");
            summary.finish(initial_error, &damping, 0, start);
            return Ok(summary);
        }

        let interior = state.interior();
        let num_px = self.config.pixel_budget.num_pixels(interior.size(), nparams)?;
        summary.num_pixels = num_px.min(interior.size());
        let solver = NormalEquationsSolver::new(self.config.linear_solver_type, self.config.min_eigval);
        let mut rng = seeded_rng(self.config.seed);

        self.config.print_configuration();
        debug!(
            "Optimizing {} parameters with {} pixels per Jacobian",
            nparams, summary.num_pixels
        );
        IterationStats::print_header();

        let mut reuse: Option<Linearization> = None;
        let mut iteration = 0;
        while !damping.finished() {
            let iter_start = Instant::now();
            let err_start = state.error();
            let snapshot = state.snapshot();
            let p0 = state.block_values(block);

            let lin = match reuse.take() {
                Some(lin) => lin,
                None => {
                    let sample = PixelSample::draw(&interior, num_px, &mut rng);
                    let j = stochastic_jacobian(
                        state,
                        block,
                        &sample,
                        &self.config.finite_difference,
                    )?;
                    // Undo any perturbation left by the finite differences.
                    state.restore(&snapshot)?;
                    summary.jacobian_evaluations += 1;
                    damping.on_new_jacobian();
                    Linearization {
                        jtj: jtj(&j),
                        j,
                        sample,
                    }
                }
            };

            let grad = gradient(&lin.j, &sampled_residuals(state, &lin.sample))?;
            let (damp0, damp1) = damping.trial_dampings();
            let step0 = solver.solve(&lin.jtj, &grad, damp0)?;
            let step1 = solver.solve(&lin.jtj, &grad, damp1)?;

            state.set_parameters(block, &(&p0 + &step0.delta))?;
            let err0 = state.error();
            state.set_parameters(block, &(&p0 + &step1.delta))?;
            let err1 = state.error();

            let (accepted, step_norm, rank, run_steps) =
                match damping.evaluate(err_start, err0, err1) {
                    StepOutcome::Bad => {
                        state.restore(&snapshot)?;
                        summary.bad_steps += 1;
                        reuse = Some(lin);
                        (false, 0.0, step0.rank, 0)
                    }
                    StepOutcome::Good(choice) => {
                        let kept = match choice {
                            TrialChoice::First => {
                                state.set_parameters(block, &(&p0 + &step0.delta))?;
                                &step0
                            }
                            TrialChoice::Second => &step1,
                        };
                        summary.good_steps += 1;
                        let runs = if self.config.do_run {
                            self.run(state, block, &lin, &solver, damping.damping())?
                        } else {
                            0
                        };
                        summary.run_steps += runs;
                        (true, kept.delta.norm(), kept.rank, runs)
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
        debug!("{}", summary);
        Ok(summary)
    }
}
