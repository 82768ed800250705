//! VPSC Core - visco-plastic self-consistent polycrystal plasticity
//!
//! Predicts the macroscopic response, grain stresses, texture, hardening
//! and grain-shape evolution of a polycrystalline aggregate under
//! prescribed deformation:
//! - Anisotropic Eshelby tensors of ellipsoidal grains in a viscous medium
//! - Single-grain power-law solver (Newton-Raphson with line search)
//! - Self-consistent homogenization with affine, secant, tangent and
//!   effective-`neff` linearizations, and the Taylor limit
//! - Voce, MTS and dislocation-density hardening
//! - Lattice rotation, twin reorientation and shape evolution
//!
//! # Architecture
//!
//! - [`Polycrystal`]: the whole mutable state, passed explicitly and
//!   serializable for checkpoints
//! - [`SelfConsistentSolver`]: solves one increment without touching state
//! - [`HardeningModel`] trait: per-phase CRSS evolution, created once from
//!   a [`HardeningLaw`]
//! - [`Simulation`]: the per-increment pipeline over [`LoadingStep`]s
//!
//! Tensors use the orthonormal b-basis of [`basis`]; the first five
//! components span the deviatoric subspace in which the viscous problem
//! is solved.

pub mod types;
pub mod basis;
pub mod rotation;
pub mod crystal;
pub mod shape;
pub mod eshelby;
pub mod viscoplastic;
pub mod grain_solver;
pub mod boundary;
pub mod hardening;
pub mod polycrystal;
pub mod texture;
pub mod self_consistent;
pub mod orientation;
pub mod twinning;
pub mod report;
pub mod config;
pub mod process;
pub mod checkpoint;
pub mod error;

pub use boundary::{BoundaryCondition, Control};
pub use config::VpscConfig;
pub use crystal::{CrystalSystem, LatticeType, SystemFamily};
pub use error::{Error, Result};
pub use hardening::{HardeningLaw, HardeningModel};
pub use polycrystal::{Grain, Phase, Polycrystal};
pub use process::{LoadingStep, Simulation};
pub use report::StepReport;
pub use self_consistent::{Interaction, SelfConsistentConfig, SelfConsistentSolver};
pub use shape::Ellipsoid;
