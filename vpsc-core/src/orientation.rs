//! Lattice rotation of grains.
//!
//! The lattice spin of a grain in sample axes is
//!
//! ```text
//! ω = W̄ + W̃ − W^p,    W̃ = Π S⁻¹ (ε̇_g − Ē),    W^p = Σ_s γ̇_s gᵀ a_s
//! ```
//!
//! where `a_s` is the axial vector of `d_s ⊗ n_s` in crystal axes. The
//! crystal axes rotate by `R = exp(ω dt)`, so the sample-to-crystal matrix
//! becomes `g' = g Rᵀ`, re-orthonormalized.

use crate::crystal::CrystalSystem;
use crate::error::Result;
use crate::rotation::{exp_spin, orthonormalize};
use crate::types::{Axial, DevVector, SpinOperator, Tensor2};

/// Spin perturbation `W̃ = Π S⁻¹ (ε̇_g − Ē)` of a grain relative to the medium.
pub fn spin_perturbation(localization: &SpinOperator, grain_rate: &DevVector, macro_rate: &DevVector) -> Axial {
    localization * (grain_rate - macro_rate)
}

/// Plastic spin `Σ γ̇_s gᵀ a_s` in sample axes.
pub fn plastic_spin(crystal: &CrystalSystem, orientation: &Tensor2, shear_rates: &[f64]) -> Axial {
    let crystal_spin = crystal
        .systems
        .iter()
        .zip(shear_rates)
        .fold(Axial::zeros(), |acc, (system, &rate)| acc + system.spin * rate);
    orientation.transpose() * crystal_spin
}

/// Lattice spin of a grain in sample axes.
pub fn lattice_spin(macro_spin: &Axial, perturbation: &Axial, plastic: &Axial) -> Axial {
    macro_spin + perturbation - plastic
}

/// Rotate a sample-to-crystal orientation by the lattice spin over `dt`.
pub fn rotate(orientation: &Tensor2, spin: &Axial, dt: f64) -> Result<Tensor2> {
    let increment = exp_spin(&(spin * dt));
    orthonormalize(&(orientation * increment.transpose()))
}
