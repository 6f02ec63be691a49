//! Core building blocks for fitting a generative model to a volume
//!
//! This module contains the pieces every optimizer relies on:
//! - Parameter layouts and blocks selecting what to optimize
//! - Tiles describing which part of the volume a change touches
//! - The state capability traits the optimizers drive
//! - Validated particle updates and spatial grouping of particles

pub mod block;
pub mod particles;
pub mod state;
pub mod tile;

pub use block::{ParamCategory, ParameterBlock, ParameterLayout};
pub use particles::{
    MIN_DIST, ParticleGroup, ParticleUpdate, find_particles_in_box,
    separate_particles_into_groups, update_one_particle, update_particles,
};
pub use state::{ImageState, Particle, ParticleState, StateSnapshot};
pub use tile::{Tile, UpdateTiles};

use thiserror::Error;
use tracing::error;

/// Core module error types for states, parameter blocks and particle updates
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A particle update would leave the particle outside the volume or with a negative radius
    #[error(
        "Invalid particle update for particle {index}: pos = {pos:?}, rad = {rad:.4} (volume shape {shape:?})"
    )]
    InvalidParticleUpdate {
        index: usize,
        pos: [f64; 3],
        rad: f64,
        shape: [usize; 3],
    },

    /// The state's parameter layout is missing a recognized category or declares an unknown one
    #[error("Unsupported parameters: {0}")]
    UnsupportedParameters(String),

    /// Dimension mismatch between blocks, values, images or tiles
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Particle index outside the state's particle list
    #[error("Particle index {index} out of range ({count} particles)")]
    ParticleIndex { index: usize, count: usize },

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// layout
    ///     .range(category)
    ///     .map_err(|e| e.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
