//! Mechanical threshold stress (MTS) hardening.
//!
//! ```text
//! τ_s = τa + μ(T)/μ0 · (S_i τ̂_i + S_e τ̂_e)
//! S   = [1 − (kT / (μ b³ g0) · ln(ε̇0/ε̇))^(1/q)]^(1/p)
//! μ(T) = μ0 − D0 / (exp(T0/T) − 1)
//! ```
//!
//! The evolutionary threshold `τ̂_e` of each family relaxes toward the
//! rate and temperature dependent saturation
//! `τ̂_es = τ̂_es0 (ε̇/ε̇_es0)^(kT / (μ b³ g0_es))` with initial rate θ0,
//! integrated exactly over the step's shear increment.

use super::{check_family_count, Conditions, HardeningInput, HardeningModel, HardeningState, HardeningUpdate, BOLTZMANN};
use crate::crystal::CrystalSystem;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Material constants shared by all families.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MtsMaterial {
    /// Shear modulus at 0 K (Pa).
    pub shear_modulus0: f64,
    /// Varshni coefficient D0 (Pa).
    pub d0: f64,
    /// Varshni temperature T0 (K).
    pub t0: f64,
    /// Burgers vector length (m).
    pub burgers: f64,
}

impl MtsMaterial {
    /// Temperature dependent shear modulus.
    pub fn shear_modulus(&self, temperature: f64) -> f64 {
        if temperature <= 0.0 {
            return self.shear_modulus0;
        }
        self.shear_modulus0 - self.d0 / ((self.t0 / temperature).exp() - 1.0)
    }

    /// `kT / (μ b³)` at the given temperature.
    fn normalized_energy(&self, temperature: f64) -> f64 {
        BOLTZMANN * temperature / (self.shear_modulus(temperature) * self.burgers.powi(3))
    }
}

/// MTS parameters of one family. Stresses share the unit of the CRSS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MtsParams {
    /// Athermal stress τa.
    pub athermal: f64,
    /// Intrinsic threshold τ̂_i.
    pub intrinsic: f64,
    pub g0_intrinsic: f64,
    pub p_intrinsic: f64,
    pub q_intrinsic: f64,
    /// Initial evolutionary threshold τ̂_e.
    pub evolutionary0: f64,
    pub g0_evolutionary: f64,
    pub p_evolutionary: f64,
    pub q_evolutionary: f64,
    /// Reference rate ε̇0 of the thermal factors.
    pub reference_rate: f64,
    /// Initial hardening rate θ0 of τ̂_e.
    pub hardening_rate: f64,
    /// Saturation threshold at the reference rate, τ̂_es0.
    pub saturation0: f64,
    pub g0_saturation: f64,
    /// Reference rate ε̇_es0 of the saturation threshold.
    pub saturation_rate: f64,
}

impl MtsParams {
    fn validate(&self) -> Result<()> {
        let positive = [
            self.g0_intrinsic,
            self.p_intrinsic,
            self.q_intrinsic,
            self.g0_evolutionary,
            self.p_evolutionary,
            self.q_evolutionary,
            self.reference_rate,
            self.saturation0,
            self.g0_saturation,
            self.saturation_rate,
        ];
        if positive.iter().any(|&v| !(v > 0.0)) {
            return Err(Error::InvalidConfig("MTS exponents, g0, rates and saturation must be positive".into()));
        }
        if self.athermal < 0.0 || self.intrinsic < 0.0 || self.evolutionary0 < 0.0 || self.hardening_rate < 0.0 {
            return Err(Error::InvalidConfig("MTS stresses and hardening rate must be non-negative".into()));
        }
        Ok(())
    }
}

/// MTS law input for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtsLaw {
    pub material: MtsMaterial,
    pub families: Vec<MtsParams>,
}

/// Thermal-activation factor `S` for one obstacle population.
fn thermal_factor(energy: f64, g0: f64, p: f64, q: f64, reference_rate: f64, rate: f64) -> f64 {
    let rate = rate.max(f64::MIN_POSITIVE);
    let x = (energy / g0 * (reference_rate / rate).ln()).max(0.0);
    (1.0 - x.powf(1.0 / q)).max(0.0).powf(1.0 / p)
}

/// MTS model bound to a crystal system.
#[derive(Debug, Clone)]
pub struct Mts {
    material: MtsMaterial,
    families: Vec<MtsParams>,
    system_family: Vec<usize>,
}

impl Mts {
    pub fn new(law: &MtsLaw, crystal: &CrystalSystem) -> Result<Self> {
        check_family_count("MTS", law.families.len(), crystal)?;
        for p in &law.families {
            p.validate()?;
        }
        if !(law.material.shear_modulus0 > 0.0 && law.material.burgers > 0.0) {
            return Err(Error::InvalidConfig("MTS shear modulus and Burgers vector must be positive".into()));
        }
        Ok(Self {
            material: law.material,
            families: law.families.clone(),
            system_family: crystal.systems.iter().map(|s| s.family).collect(),
        })
    }

    fn crss(&self, thresholds: &[f64], conditions: &Conditions) -> Vec<f64> {
        let energy = self.material.normalized_energy(conditions.temperature);
        let ratio = self.material.shear_modulus(conditions.temperature) / self.material.shear_modulus0;
        let family_crss: Vec<f64> = self
            .families
            .iter()
            .zip(thresholds)
            .map(|(p, &tau_e)| {
                let s_i = thermal_factor(energy, p.g0_intrinsic, p.p_intrinsic, p.q_intrinsic, p.reference_rate, conditions.strain_rate);
                let s_e = thermal_factor(
                    energy,
                    p.g0_evolutionary,
                    p.p_evolutionary,
                    p.q_evolutionary,
                    p.reference_rate,
                    conditions.strain_rate,
                );
                p.athermal + ratio * (s_i * p.intrinsic + s_e * tau_e)
            })
            .collect();
        self.system_family.iter().map(|&f| family_crss[f]).collect()
    }

    /// Saturation threshold of a family at the current conditions.
    pub fn saturation(&self, family: usize, conditions: &Conditions) -> f64 {
        let p = &self.families[family];
        let energy = self.material.normalized_energy(conditions.temperature);
        let rate = conditions.strain_rate.max(f64::MIN_POSITIVE);
        p.saturation0 * (rate / p.saturation_rate).powf(energy / p.g0_saturation)
    }
}

impl HardeningModel for Mts {
    fn name(&self) -> &'static str {
        "mts"
    }

    fn initial_state(&self) -> HardeningState {
        HardeningState {
            internal: self.families.iter().map(|p| p.evolutionary0).collect(),
            ..HardeningState::default()
        }
    }

    fn initial_crss(&self, state: &HardeningState, conditions: &Conditions) -> Vec<f64> {
        self.crss(&state.internal, conditions)
    }

    fn update(&self, input: &HardeningInput) -> HardeningUpdate {
        let delta_gamma: f64 = input.shear_increments.iter().map(|d| d.abs()).sum();
        let mut state = input.state.clone();
        for (f, tau_e) in state.internal.iter_mut().enumerate() {
            let saturation = self.saturation(f, &input.conditions);
            let theta0 = self.families[f].hardening_rate;
            // dτ̂_e/dΓ = θ0 (1 − τ̂_e/τ̂_es), exact over ΔΓ
            *tau_e = saturation - (saturation - *tau_e) * (-theta0 * delta_gamma / saturation).exp();
        }
        state.total_shear += delta_gamma;
        let crss = self.crss(&state.internal, &input.conditions);
        HardeningUpdate {
            crss,
            state,
            floor_hits: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn copper_law() -> MtsLaw {
        MtsLaw {
            material: MtsMaterial {
                shear_modulus0: 47.3e9,
                d0: 3.0e9,
                t0: 180.0,
                burgers: 2.56e-10,
            },
            families: vec![MtsParams {
                athermal: 5.0,
                intrinsic: 20.0,
                g0_intrinsic: 0.5,
                p_intrinsic: 0.5,
                q_intrinsic: 1.5,
                evolutionary0: 1.0,
                g0_evolutionary: 1.6,
                p_evolutionary: 2.0 / 3.0,
                q_evolutionary: 1.0,
                reference_rate: 1e7,
                hardening_rate: 800.0,
                saturation0: 300.0,
                g0_saturation: 0.3,
                saturation_rate: 1e7,
            }],
        }
    }

    fn model() -> (Mts, usize) {
        let fcc = CrystalSystem::fcc(1.0, 0.05).unwrap();
        (Mts::new(&copper_law(), &fcc).unwrap(), fcc.n_systems())
    }

    #[test]
    fn test_shear_modulus_decreases_with_temperature() {
        let m = copper_law().material;
        assert!(m.shear_modulus(600.0) < m.shear_modulus(300.0));
        assert_relative_eq!(m.shear_modulus(0.0), m.shear_modulus0);
    }

    #[test]
    fn test_thermal_factor_bounds() {
        assert_relative_eq!(thermal_factor(0.0, 1.0, 0.5, 1.5, 1e7, 1.0), 1.0);
        let s = thermal_factor(0.02, 1.0, 0.5, 1.5, 1e7, 1.0);
        assert!(s > 0.0 && s < 1.0);
        // Rates above the reference rate do not exceed full strength.
        assert_relative_eq!(thermal_factor(0.02, 1.0, 0.5, 1.5, 1e7, 1e9), 1.0);
    }

    #[test]
    fn test_higher_temperature_softens() {
        let (mts, _) = model();
        let state = mts.initial_state();
        let cold = mts.initial_crss(&state, &Conditions { temperature: 77.0, strain_rate: 1.0 });
        let hot = mts.initial_crss(&state, &Conditions { temperature: 600.0, strain_rate: 1.0 });
        assert!(hot[0] < cold[0]);
    }

    #[test]
    fn test_threshold_saturates_under_straining() {
        let (mts, n) = model();
        let conditions = Conditions::default();
        let mut state = mts.initial_state();
        let mut crss = mts.initial_crss(&state, &conditions);
        let increments = vec![0.01; n];
        for _ in 0..200 {
            let update = mts.update(&HardeningInput {
                crss: &crss,
                state: &state,
                shear_increments: &increments,
                conditions,
            });
            assert!(update.crss[0] >= crss[0]);
            crss = update.crss;
            state = update.state;
        }
        assert_relative_eq!(state.internal[0], mts.saturation(0, &conditions), max_relative = 1e-6);
    }
}
