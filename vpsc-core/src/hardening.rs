//! Critical resolved shear stress evolution.
//!
//! Hardening laws implement [`HardeningModel`] and are created once per
//! phase from a serializable [`HardeningLaw`] description via
//! [`create_hardening`]. Every law maps
//! `(old CRSS, old internal state, shear increments) -> (new CRSS, new state)`;
//! [`harden`] then enforces the positive CRSS floor.
//!
//! # Submodules
//!
//! - [`voce`] - extended Voce law with latent hardening
//! - [`mts`] - mechanical threshold stress law
//! - [`dislocation`] - Kocks-Mecking dislocation density, with and without reversal

pub mod dislocation;
pub mod mts;
pub mod voce;

use crate::crystal::CrystalSystem;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub use dislocation::{DensityScope, DislocationDensity, DislocationLaw, DislocationParams, ReversibleDensity, ReversibleLaw};
pub use mts::{Mts, MtsLaw, MtsMaterial, MtsParams};
pub use voce::{Voce, VoceLaw, VoceParams};

/// Boltzmann constant (J/K).
pub const BOLTZMANN: f64 = 1.380_649e-23;

/// Internal hardening variables of one grain.
///
/// Each law uses the fields it needs and leaves the others empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardeningState {
    /// Accumulated total shear `Γ = Σ ∫|γ̇_s| dt`.
    pub total_shear: f64,
    /// Dislocation densities (scalar or per system) or MTS thresholds.
    pub internal: Vec<f64>,
    /// Reversible dislocation density per system.
    pub reversible: Vec<f64>,
    /// Sign of the last shear increment per system (0 before first slip).
    pub sense: Vec<f64>,
    /// Systems currently recovering reversible density after a reversal.
    pub recovering: Vec<bool>,
}

/// Loading conditions for rate and temperature dependent laws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    /// Absolute temperature (K).
    pub temperature: f64,
    /// Equivalent strain rate of the grain (1/s).
    pub strain_rate: f64,
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            temperature: 293.0,
            strain_rate: 1.0,
        }
    }
}

/// Data consumed by one hardening update.
#[derive(Debug, Clone, Copy)]
pub struct HardeningInput<'a> {
    pub crss: &'a [f64],
    pub state: &'a HardeningState,
    /// Signed shear increment of every system over the step.
    pub shear_increments: &'a [f64],
    pub conditions: Conditions,
}

/// Result of one hardening update.
#[derive(Debug, Clone, PartialEq)]
pub struct HardeningUpdate {
    pub crss: Vec<f64>,
    pub state: HardeningState,
    /// Number of systems clamped at the CRSS floor.
    pub floor_hits: usize,
}

/// A hardening law, bound to one crystal system.
pub trait HardeningModel: Send + Sync + Debug {
    /// Law name for diagnostics.
    fn name(&self) -> &'static str;

    /// Internal state of a virgin grain.
    fn initial_state(&self) -> HardeningState;

    /// CRSS of every system for a given internal state.
    fn initial_crss(&self, state: &HardeningState, conditions: &Conditions) -> Vec<f64>;

    /// Evolve CRSS and state over one step. The floor is applied by [`harden`].
    fn update(&self, input: &HardeningInput) -> HardeningUpdate;
}

/// Run `model` and clamp the resulting CRSS at `floor`.
pub fn harden(model: &dyn HardeningModel, input: &HardeningInput, floor: f64) -> HardeningUpdate {
    let mut update = model.update(input);
    update.floor_hits += clamp_floor(&mut update.crss, floor);
    update
}

/// Clamp values below `floor` (or non-finite) up to `floor`; returns the count.
pub fn clamp_floor(crss: &mut [f64], floor: f64) -> usize {
    let mut hits = 0;
    for tau in crss.iter_mut() {
        if !(*tau >= floor) {
            *tau = floor;
            hits += 1;
        }
    }
    hits
}

/// Serializable hardening-law selection for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "law", rename_all = "snake_case")]
pub enum HardeningLaw {
    Voce(VoceLaw),
    Mts(MtsLaw),
    DislocationDensity(DislocationLaw),
    ReversibleDislocation(ReversibleLaw),
}

/// Build the hardening model of a phase.
///
/// # Errors
///
/// Returns `InvalidConfig` if the per-family parameter lists do not match
/// the crystal's families or a parameter is out of range.
pub fn create_hardening(law: &HardeningLaw, crystal: &CrystalSystem) -> Result<Box<dyn HardeningModel>> {
    match law {
        HardeningLaw::Voce(l) => Ok(Box::new(Voce::new(l, crystal)?)),
        HardeningLaw::Mts(l) => Ok(Box::new(Mts::new(l, crystal)?)),
        HardeningLaw::DislocationDensity(l) => Ok(Box::new(DislocationDensity::new(l, crystal)?)),
        HardeningLaw::ReversibleDislocation(l) => Ok(Box::new(ReversibleDensity::new(l, crystal)?)),
    }
}

/// Check that one parameter set is given per family.
pub(crate) fn check_family_count(law: &str, given: usize, crystal: &CrystalSystem) -> Result<()> {
    if given != crystal.families.len() {
        return Err(Error::InvalidConfig(format!(
            "{} hardening for '{}' needs {} parameter sets, got {}",
            law,
            crystal.name,
            crystal.families.len(),
            given
        )));
    }
    Ok(())
}

/// System-by-system interaction matrix from family-level coefficients.
///
/// `self_coefficients[f]` is used on the diagonal, `latent[f][f']` between
/// distinct systems. Missing tables default to 1.
pub(crate) fn interaction_matrix(
    crystal: &CrystalSystem,
    self_coefficients: Option<&[f64]>,
    latent: Option<&[Vec<f64>]>,
) -> Result<Vec<Vec<f64>>> {
    let nf = crystal.families.len();
    if let Some(h) = self_coefficients {
        check_family_count("self-hardening", h.len(), crystal)?;
    }
    if let Some(rows) = latent {
        if rows.len() != nf || rows.iter().any(|r| r.len() != nf) {
            return Err(Error::InvalidConfig(format!(
                "latent hardening matrix must be {}×{}",
                nf, nf
            )));
        }
    }
    let n = crystal.n_systems();
    let mut h = vec![vec![1.0; n]; n];
    for (s, row) in h.iter_mut().enumerate() {
        let fs = crystal.systems[s].family;
        for (t, value) in row.iter_mut().enumerate() {
            let ft = crystal.systems[t].family;
            *value = if s == t {
                self_coefficients.map_or(1.0, |c| c[fs])
            } else {
                latent.map_or(1.0, |l| l[fs][ft])
            };
        }
    }
    Ok(h)
}
