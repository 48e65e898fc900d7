#![warn(clippy::todo, unused_qualifications)]

//! FDTD solver core for ground-penetrating radar models.
//!
//! A [`config::ModelDescription`] is turned into a [`grid::Grid`] by
//! [`model::build_grid`], which paints the geometry, builds PML regions and
//! edge material IDs, runs the admission check and computes the update
//! coefficients. A [`solver::SolverBackend`] (CPU or `wgpu`) then runs the
//! leapfrog loop on the grid. [`model::Simulation`] does all of this for a
//! sequence of model runs and returns a [`output::ModelOutput`] per run.

pub mod admission;
pub mod coefficients;
pub mod config;
pub mod dispersion;
pub mod error;
pub mod grid;
pub mod lattice;
pub mod material;
pub mod model;
pub mod output;
pub mod pml;
pub mod receiver;
pub mod solver;
pub mod source;
pub mod util;
pub mod waveform;

pub use crate::error::Error;

/// Precision of field values.
pub type Real = f32;

/// Dispersive accumulators and coefficients.
pub type Complex = num::Complex<Real>;
