//! Extended Voce hardening.
//!
//! The family hardening curve is
//! `τ(Γ) = τ0 + (τ1 + θ1 Γ)(1 − exp(−Γ θ0 / τ1))` in the accumulated
//! shear `Γ`. Over a step the secant slope of that curve is distributed
//! to the systems through the latent matrix:
//! `Δτ_s = [τ(Γ + ΔΓ) − τ(Γ)] / ΔΓ · Σ_s' h_ss' |Δγ_s'|`.

use super::{check_family_count, interaction_matrix, Conditions, HardeningInput, HardeningModel, HardeningState, HardeningUpdate};
use crate::crystal::CrystalSystem;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Voce parameters of one system family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoceParams {
    /// Initial CRSS τ0.
    pub tau0: f64,
    /// Back-extrapolated stress increment τ1.
    pub tau1: f64,
    /// Initial hardening rate θ0.
    pub theta0: f64,
    /// Asymptotic hardening rate θ1.
    pub theta1: f64,
}

impl Default for VoceParams {
    fn default() -> Self {
        Self {
            tau0: 1.0,
            tau1: 0.5,
            theta0: 10.0,
            theta1: 0.0,
        }
    }
}

impl VoceParams {
    /// Curve value at accumulated shear `gamma`.
    pub fn tau(&self, gamma: f64) -> f64 {
        if self.tau1.abs() < 1e-12 {
            return self.tau0 + self.theta0 * gamma;
        }
        self.tau0 + (self.tau1 + self.theta1 * gamma) * (1.0 - (-gamma * self.theta0 / self.tau1).exp())
    }

    fn validate(&self) -> Result<()> {
        if !(self.tau0 > 0.0) {
            return Err(Error::InvalidConfig("Voce tau0 must be positive".into()));
        }
        if self.theta0 < 0.0 || self.tau1 < 0.0 {
            return Err(Error::InvalidConfig("Voce tau1 and theta0 must be non-negative".into()));
        }
        Ok(())
    }
}

/// Voce law input for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoceLaw {
    /// One parameter set per crystal family.
    pub families: Vec<VoceParams>,
    /// Self-hardening coefficient per family (default 1).
    #[serde(default)]
    pub self_hardening: Option<Vec<f64>>,
    /// Latent coefficient per family pair (default 1).
    #[serde(default)]
    pub latent: Option<Vec<Vec<f64>>>,
}

impl VoceLaw {
    /// Same parameters for `n_families` families, isotropic latent hardening.
    pub fn uniform(n_families: usize, params: VoceParams) -> Self {
        Self {
            families: vec![params; n_families],
            self_hardening: None,
            latent: None,
        }
    }
}

/// Voce model bound to a crystal system.
#[derive(Debug, Clone)]
pub struct Voce {
    params: Vec<VoceParams>,
    interaction: Vec<Vec<f64>>,
}

impl Voce {
    pub fn new(law: &VoceLaw, crystal: &CrystalSystem) -> Result<Self> {
        check_family_count("Voce", law.families.len(), crystal)?;
        for p in &law.families {
            p.validate()?;
        }
        let params = crystal
            .systems
            .iter()
            .map(|s| law.families[s.family])
            .collect();
        let interaction = interaction_matrix(crystal, law.self_hardening.as_deref(), law.latent.as_deref())?;
        Ok(Self { params, interaction })
    }
}

impl HardeningModel for Voce {
    fn name(&self) -> &'static str {
        "voce"
    }

    fn initial_state(&self) -> HardeningState {
        HardeningState::default()
    }

    fn initial_crss(&self, state: &HardeningState, _conditions: &Conditions) -> Vec<f64> {
        self.params.iter().map(|p| p.tau(state.total_shear)).collect()
    }

    fn update(&self, input: &HardeningInput) -> HardeningUpdate {
        let gamma = input.state.total_shear;
        let abs_increments: Vec<f64> = input.shear_increments.iter().map(|d| d.abs()).collect();
        let delta_gamma: f64 = abs_increments.iter().sum();

        let mut state = input.state.clone();
        let mut crss = input.crss.to_vec();
        if delta_gamma > 0.0 {
            for (s, tau) in crss.iter_mut().enumerate() {
                let p = &self.params[s];
                let slope = (p.tau(gamma + delta_gamma) - p.tau(gamma)) / delta_gamma;
                let weighted: f64 = self.interaction[s]
                    .iter()
                    .zip(&abs_increments)
                    .map(|(h, d)| h * d)
                    .sum();
                *tau += slope * weighted;
            }
            state.total_shear = gamma + delta_gamma;
        }

        HardeningUpdate {
            crss,
            state,
            floor_hits: 0,
        }
    }
}
