//! Two-trial damping heuristic shared by the Levenberg-Marquardt drivers.
//!
//! Each outer iteration tries two steps, damped by `damp` and `damp·ddamp`, and compares both with
//! the error before the iteration:
//!
//! - both worse: the step is bad. Damping is raised, or `ddamp` is inverted once if the larger
//!   damping did even worse. A second inversion request means the fit is stuck: damping jumps to
//!   at least 100 and the call reports trouble.
//! - otherwise the better trial is kept; keeping the less damped trial also lowers `damp`.
//!
//! The controller also owns the iteration counter. Good steps count 1, bad steps count a
//! fraction, so repeated rejections on one Jacobian still end the loop.

use crate::optimizer::{OptimizerError, OptimizerResult};

/// Damping a stuck fit falls back to at least.
pub const STUCK_DAMPING: f64 = 100.0;

/// Counter increment of a rejected step in the global driver.
pub const GLOBAL_BAD_STEP_WEIGHT: f64 = 0.2;

/// Counter increment of a rejected step in the particle driver.
pub const PARTICLE_BAD_STEP_WEIGHT: f64 = 0.1;

const COUNTER_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DampingPhase {
    /// Waiting for the errors of the next pair of trials
    AwaitingTrial,
    /// The last pair improved the error
    GoodStep,
    /// The last pair made things worse; the Jacobian is reused
    BadStep,
    /// `ddamp` was already inverted and still failed
    Stuck,
}

/// Which of the two trial steps to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialChoice {
    /// Damped by `damp`
    First,
    /// Damped by `damp·ddamp`
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Good(TrialChoice),
    Bad,
}

#[derive(Debug, Clone)]
pub struct DampingController {
    damp: f64,
    ddamp: f64,
    has_inverted: bool,
    no_trouble: bool,
    phase: DampingPhase,
    counter: f64,
    num_iter: usize,
    bad_step_weight: f64,
}

impl DampingController {
    pub fn new(
        damp: f64,
        ddamp: f64,
        num_iter: usize,
        bad_step_weight: f64,
    ) -> OptimizerResult<Self> {
        if !(damp.is_finite() && damp >= 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping must be finite and non-negative, got {damp}"
            ))
            .log());
        }
        if !(ddamp.is_finite() && ddamp > 0.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping step must be finite and positive, got {ddamp}"
            ))
            .log());
        }
        Ok(Self {
            damp,
            ddamp,
            has_inverted: false,
            no_trouble: true,
            phase: DampingPhase::AwaitingTrial,
            counter: 0.0,
            num_iter,
            bad_step_weight,
        })
    }

    /// Dampings of the two trial steps.
    pub fn trial_dampings(&self) -> (f64, f64) {
        (self.damp, self.damp * self.ddamp)
    }

    pub fn damping(&self) -> f64 {
        self.damp
    }

    pub fn damping_step(&self) -> f64 {
        self.ddamp
    }

    pub fn phase(&self) -> DampingPhase {
        self.phase
    }

    pub fn counter(&self) -> f64 {
        self.counter
    }

    /// False once the fit got stuck since the last Jacobian.
    pub fn no_trouble(&self) -> bool {
        self.no_trouble
    }

    pub fn finished(&self) -> bool {
        // Fractional increments accumulate rounding error.
        self.counter >= self.num_iter as f64 - COUNTER_TOLERANCE
    }

    /// A fresh Jacobian clears the inversion and trouble flags.
    pub fn on_new_jacobian(&mut self) {
        self.has_inverted = false;
        self.no_trouble = true;
        self.phase = DampingPhase::AwaitingTrial;
    }

    /// Classify a pair of trials against the start error and adapt the damping.
    pub fn evaluate(&mut self, err_start: f64, err0: f64, err1: f64) -> StepOutcome {
        if err0.min(err1) > err_start {
            self.counter += self.bad_step_weight;
            self.phase = DampingPhase::BadStep;
            if err0 < err1 {
                if self.has_inverted {
                    self.ddamp = self.ddamp.max(1.0 / self.ddamp);
                    self.damp = STUCK_DAMPING.max(self.damp * self.ddamp);
                    self.no_trouble = false;
                    self.phase = DampingPhase::Stuck;
                } else {
                    self.ddamp = 1.0 / self.ddamp;
                    self.has_inverted = true;
                }
            } else {
                self.damp *= self.ddamp * self.ddamp;
            }
            StepOutcome::Bad
        } else {
            self.counter += 1.0;
            self.phase = DampingPhase::GoodStep;
            if err0 < err1 {
                StepOutcome::Good(TrialChoice::First)
            } else {
                self.damp *= self.ddamp;
                StepOutcome::Good(TrialChoice::Second)
            }
        }
    }
}
