//! # voxfit
//!
//! Stochastic Levenberg-Marquardt fitting of a rendered generative model to an observed 3D
//! volume, as used for locating particles in confocal microscopy stacks.
//!
//! ## Features
//!
//! - **Stochastic Jacobians**: finite-difference derivatives over a random pixel sample sized to a
//!   memory budget
//! - **Levenberg-Marquardt**: a two-trial damping heuristic with Jacobian reuse and extra "run"
//!   steps, for any parameter block
//! - **Particle fits**: exact tile Jacobians over particle positions and radii, with validated
//!   local updates and a sweep over spatial groups of particles
//! - **Line minimization**: Brent searches along the eigenvectors of `JTJ`
//! - **Linear fits**: direct least squares for illumination, background and offset
//!
//! ## States
//!
//! Optimizers drive anything implementing [`core::ImageState`] (and [`core::ParticleState`] for
//! the particle drivers). [`synthetic::SyntheticState`] is a self-contained Gaussian-blob model
//! used by the tests and the `fit_synthetic` binary.

pub mod core;
pub mod error;
pub mod jacobian;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;
pub mod optimizer;
pub mod synthetic;

// Re-export core types
pub use core::{
    ImageState, ParamCategory, ParameterBlock, ParameterLayout, Particle, ParticleState, Tile,
};
pub use error::{VoxfitError, VoxfitResult};

pub use jacobian::{FiniteDifferenceConfig, PixelBudget};
pub use linalg::LinearSolverType;
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    ConjugateDirection, ConjugateDirectionConfig, IterationHistory, LevenbergMarquardt,
    LevenbergMarquardtConfig, LinearFit, LinearFitConfig, OptObserver, OptObserverVec,
    ParticleGroupConfig, ParticleLevenbergMarquardt,
};
