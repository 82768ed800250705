//! Dislocation-density hardening (Kocks-Mecking), with an optional
//! reversible population for load reversals.
//!
//! Density evolves with shear as `dρ/dγ = k1 √ρ − k2 ρ`, with the dynamic
//! recovery coefficient
//! `k2 = k1 χ b / g · (1 − kT / (D b³) · ln(ε̇/ε̇0))`.
//! In `x = √ρ` the law is linear, `dx/dγ = (k1 − k2 x)/2`, and is
//! integrated exactly over each increment. The CRSS follows the Taylor
//! relation `τ_s = τ0 + χ b μ √(Σ_s' L_ss' ρ_s')`.

use super::{check_family_count, interaction_matrix, Conditions, HardeningInput, HardeningModel, HardeningState, HardeningUpdate, BOLTZMANN};
use crate::crystal::CrystalSystem;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Whether density is tracked per grain or per system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DensityScope {
    /// One density per grain driven by the total shear.
    Scalar,
    /// One density per system driven by its own shear.
    PerSystem,
}

/// Kocks-Mecking parameters of one family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DislocationParams {
    /// Friction stress τ0.
    pub friction: f64,
    /// Storage coefficient k1 (1/m).
    pub k1: f64,
    /// Normalized activation energy g.
    pub activation: f64,
    /// Drag stress D (Pa).
    pub drag_stress: f64,
    /// Reference rate ε̇0 of dynamic recovery.
    pub reference_rate: f64,
    /// Taylor interaction constant χ.
    pub chi: f64,
    /// Burgers vector length (m).
    pub burgers: f64,
    /// Shear modulus in the unit of the CRSS.
    pub shear_modulus: f64,
    /// Initial density (1/m²).
    pub initial_density: f64,
}

impl DislocationParams {
    fn validate(&self) -> Result<()> {
        let positive = [
            self.k1,
            self.activation,
            self.drag_stress,
            self.reference_rate,
            self.chi,
            self.burgers,
            self.shear_modulus,
            self.initial_density,
        ];
        if positive.iter().any(|&v| !(v > 0.0)) || self.friction < 0.0 {
            return Err(Error::InvalidConfig("dislocation-density parameters must be positive".into()));
        }
        Ok(())
    }

    /// Dynamic recovery coefficient, clamped at zero.
    pub fn k2(&self, conditions: &Conditions) -> f64 {
        let rate = conditions.strain_rate.max(f64::MIN_POSITIVE);
        let thermal = BOLTZMANN * conditions.temperature / (self.drag_stress * self.burgers.powi(3));
        let factor = 1.0 - thermal * (rate / self.reference_rate).ln();
        (self.k1 * self.chi * self.burgers / self.activation * factor).max(0.0)
    }

    /// Density after shearing by `|dgamma|` from `rho`.
    pub fn evolve(&self, rho: f64, dgamma: f64, conditions: &Conditions) -> f64 {
        let x = rho.max(0.0).sqrt();
        let k2 = self.k2(conditions);
        let x_new = if k2 * dgamma < 1e-12 {
            x + 0.5 * (self.k1 - k2 * x) * dgamma
        } else {
            let saturation = self.k1 / k2;
            saturation + (x - saturation) * (-0.5 * k2 * dgamma).exp()
        };
        x_new * x_new
    }

    fn taylor_stress(&self, density: f64) -> f64 {
        self.friction + self.chi * self.burgers * self.shear_modulus * density.max(0.0).sqrt()
    }
}

/// Kocks-Mecking law input for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DislocationLaw {
    pub scope: DensityScope,
    pub families: Vec<DislocationParams>,
    /// Latent interaction `L` per family pair for per-system densities.
    /// Defaults to self-interaction only.
    #[serde(default)]
    pub latent: Option<Vec<Vec<f64>>>,
}

/// Kocks-Mecking model bound to a crystal system.
#[derive(Debug, Clone)]
pub struct DislocationDensity {
    scope: DensityScope,
    params: Vec<DislocationParams>,
    interaction: Vec<Vec<f64>>,
}

impl DislocationDensity {
    pub fn new(law: &DislocationLaw, crystal: &CrystalSystem) -> Result<Self> {
        check_family_count("dislocation-density", law.families.len(), crystal)?;
        for p in &law.families {
            p.validate()?;
        }
        let interaction = match law.latent.as_deref() {
            Some(latent) => interaction_matrix(crystal, None, Some(latent))?,
            None => {
                let n = crystal.n_systems();
                (0..n)
                    .map(|s| (0..n).map(|t| if s == t { 1.0 } else { 0.0 }).collect())
                    .collect()
            }
        };
        Ok(Self {
            scope: law.scope,
            params: crystal.systems.iter().map(|s| law.families[s.family]).collect(),
            interaction,
        })
    }

    fn crss(&self, densities: &[f64]) -> Vec<f64> {
        match self.scope {
            DensityScope::Scalar => self.params.iter().map(|p| p.taylor_stress(densities[0])).collect(),
            DensityScope::PerSystem => self
                .params
                .iter()
                .enumerate()
                .map(|(s, p)| {
                    let effective: f64 = self.interaction[s].iter().zip(densities).map(|(l, r)| l * r).sum();
                    p.taylor_stress(effective)
                })
                .collect(),
        }
    }
}

impl HardeningModel for DislocationDensity {
    fn name(&self) -> &'static str {
        "dislocation-density"
    }

    fn initial_state(&self) -> HardeningState {
        let internal = match self.scope {
            DensityScope::Scalar => vec![self.params.first().map_or(0.0, |p| p.initial_density)],
            DensityScope::PerSystem => self.params.iter().map(|p| p.initial_density).collect(),
        };
        HardeningState {
            internal,
            ..HardeningState::default()
        }
    }

    fn initial_crss(&self, state: &HardeningState, _conditions: &Conditions) -> Vec<f64> {
        self.crss(&state.internal)
    }

    fn update(&self, input: &HardeningInput) -> HardeningUpdate {
        let mut state = input.state.clone();
        let delta_gamma: f64 = input.shear_increments.iter().map(|d| d.abs()).sum();
        match self.scope {
            DensityScope::Scalar => {
                if let (Some(rho), Some(p)) = (state.internal.first_mut(), self.params.first()) {
                    *rho = p.evolve(*rho, delta_gamma, &input.conditions);
                }
            }
            DensityScope::PerSystem => {
                for (s, rho) in state.internal.iter_mut().enumerate() {
                    let dgamma = input.shear_increments[s].abs();
                    if dgamma > 0.0 {
                        *rho = self.params[s].evolve(*rho, dgamma, &input.conditions);
                    }
                }
            }
        }
        state.total_shear += delta_gamma;
        HardeningUpdate {
            crss: self.crss(&state.internal),
            state,
            floor_hits: 0,
        }
    }
}

/// Reversible-density law input (per-system densities only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversibleLaw {
    pub families: Vec<DislocationParams>,
    /// Fraction of newly stored density that is reversible.
    pub reversible_fraction: f64,
    /// Recovery rate of the reversible density per unit reversed shear.
    pub recovery_rate: f64,
}

/// Kocks-Mecking density split into forward and reversible populations.
///
/// On a reversal of a system's shear sign, its reversible population is
/// annihilated exponentially with the reversed shear, which softens the
/// system (Bauschinger effect). New storage during recovery is forward only.
#[derive(Debug, Clone)]
pub struct ReversibleDensity {
    params: Vec<DislocationParams>,
    reversible_fraction: f64,
    recovery_rate: f64,
}

impl ReversibleDensity {
    pub fn new(law: &ReversibleLaw, crystal: &CrystalSystem) -> Result<Self> {
        check_family_count("reversible dislocation-density", law.families.len(), crystal)?;
        for p in &law.families {
            p.validate()?;
        }
        if !(0.0..=1.0).contains(&law.reversible_fraction) || law.recovery_rate < 0.0 {
            return Err(Error::InvalidConfig(
                "reversible fraction must be in [0, 1] and recovery rate non-negative".into(),
            ));
        }
        Ok(Self {
            params: crystal.systems.iter().map(|s| law.families[s.family]).collect(),
            reversible_fraction: law.reversible_fraction,
            recovery_rate: law.recovery_rate,
        })
    }

    fn crss(&self, state: &HardeningState) -> Vec<f64> {
        self.params
            .iter()
            .enumerate()
            .map(|(s, p)| p.taylor_stress(state.internal[s] + state.reversible[s]))
            .collect()
    }
}

impl HardeningModel for ReversibleDensity {
    fn name(&self) -> &'static str {
        "reversible-dislocation-density"
    }

    fn initial_state(&self) -> HardeningState {
        let n = self.params.len();
        HardeningState {
            total_shear: 0.0,
            internal: self.params.iter().map(|p| p.initial_density).collect(),
            reversible: vec![0.0; n],
            sense: vec![0.0; n],
            recovering: vec![false; n],
        }
    }

    fn initial_crss(&self, state: &HardeningState, _conditions: &Conditions) -> Vec<f64> {
        self.crss(state)
    }

    fn update(&self, input: &HardeningInput) -> HardeningUpdate {
        let mut state = input.state.clone();
        for (s, &increment) in input.shear_increments.iter().enumerate() {
            let dgamma = increment.abs();
            if dgamma == 0.0 {
                continue;
            }
            let sign = increment.signum();
            if state.sense[s] != 0.0 && state.sense[s] != sign {
                state.recovering[s] = true;
            }
            state.sense[s] = sign;

            let total = state.internal[s] + state.reversible[s];
            let stored = self.params[s].evolve(total, dgamma, &input.conditions) - total;

            if state.recovering[s] {
                state.reversible[s] *= (-self.recovery_rate * dgamma).exp();
                state.internal[s] += stored;
                if state.reversible[s] < 1e-6 * state.internal[s] {
                    state.reversible[s] = 0.0;
                    state.recovering[s] = false;
                }
            } else {
                state.internal[s] += (1.0 - self.reversible_fraction) * stored;
                state.reversible[s] += self.reversible_fraction * stored;
            }
            state.internal[s] = state.internal[s].max(0.0);
            state.reversible[s] = state.reversible[s].max(0.0);
            state.total_shear += dgamma;
        }
        HardeningUpdate {
            crss: self.crss(&state),
            state,
            floor_hits: 0,
        }
    }
}
