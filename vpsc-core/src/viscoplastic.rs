//! Rate-dependent power-law kinetics of one grain.
//!
//! Each system `s` shears at
//! `γ̇_s = γ̇0_s |τ_s / τc_s|^n_s sign(τ_s)` with `τ_s = m_s : σ`.
//! Twin systems only shear when `τ_s > 0`. The grain strain rate is
//! `ε̇ = Σ γ̇_s m_s`, which gives closed-form secant and tangent compliances
//! `M_sec = Σ γ̇0/τc |r|^(n−1) m⊗m` and `M_tg = Σ n γ̇0/τc |r|^(n−1) m⊗m`.

use crate::basis::basis_rotation;
use crate::crystal::CrystalSystem;
use crate::types::{DevMatrix, DevVector, Tensor2};

/// Power-law kinetics of one grain with Schmid tensors in sample axes.
#[derive(Debug, Clone)]
pub struct GrainKinetics {
    /// Schmid tensors in sample axes (b-basis, deviatoric).
    pub schmid: Vec<DevVector>,
    pub reference_rate: Vec<f64>,
    pub exponent: Vec<f64>,
    pub crss: Vec<f64>,
    pub unidirectional: Vec<bool>,
}

/// Linearization of the power law at one stress state.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLawResponse {
    pub strain_rate: DevVector,
    pub shear_rates: Vec<f64>,
    /// Secant compliance: `ε̇ = M_sec σ`.
    pub secant: DevMatrix,
    /// Tangent compliance `∂ε̇/∂σ`.
    pub tangent: DevMatrix,
}

impl GrainKinetics {
    /// Prepare the kinetics of a grain with orientation `g` (sample to crystal).
    pub fn new(crystal: &CrystalSystem, orientation: &Tensor2, crss: &[f64]) -> Self {
        // T_sample = gᵀ T_crystal g
        let q = basis_rotation(&orientation.transpose());
        let q5 = q.fixed_view::<5, 5>(0, 0).into_owned();

        let n = crystal.n_systems();
        let mut kinetics = Self {
            schmid: Vec::with_capacity(n),
            reference_rate: Vec::with_capacity(n),
            exponent: Vec::with_capacity(n),
            crss: crss.to_vec(),
            unidirectional: Vec::with_capacity(n),
        };
        for system in &crystal.systems {
            let family = &crystal.families[system.family];
            kinetics.schmid.push(q5 * system.schmid);
            kinetics.reference_rate.push(family.reference_rate);
            kinetics.exponent.push(1.0 / family.rate_sensitivity);
            kinetics.unidirectional.push(system.is_twin());
        }
        kinetics
    }

    pub fn n_systems(&self) -> usize {
        self.schmid.len()
    }

    /// Resolved shear stresses `τ_s = m_s : σ`.
    pub fn resolved(&self, stress: &DevVector) -> Vec<f64> {
        self.schmid.iter().map(|m| m.dot(stress)).collect()
    }

    /// Normalized resolved stress `τ/τc`, zero for blocked twin directions.
    #[inline]
    fn ratio(&self, s: usize, tau: f64) -> f64 {
        let r = tau / self.crss[s];
        if self.unidirectional[s] && r <= 0.0 {
            0.0
        } else {
            r
        }
    }

    /// Shear rate of every system.
    pub fn shear_rates(&self, stress: &DevVector) -> Vec<f64> {
        (0..self.n_systems())
            .map(|s| {
                let r = self.ratio(s, self.schmid[s].dot(stress));
                if r == 0.0 {
                    0.0
                } else {
                    self.reference_rate[s] * r.abs().powf(self.exponent[s]) * r.signum()
                }
            })
            .collect()
    }

    /// Grain strain rate `Σ γ̇_s m_s`.
    pub fn strain_rate(&self, stress: &DevVector) -> DevVector {
        let mut d = DevVector::zeros();
        for s in 0..self.n_systems() {
            let r = self.ratio(s, self.schmid[s].dot(stress));
            if r != 0.0 {
                d += self.schmid[s] * (self.reference_rate[s] * r.abs().powf(self.exponent[s]) * r.signum());
            }
        }
        d
    }

    /// Strain rate, shear rates and secant/tangent compliances at `stress`.
    pub fn response(&self, stress: &DevVector) -> PowerLawResponse {
        let mut strain_rate = DevVector::zeros();
        let mut secant = DevMatrix::zeros();
        let mut tangent = DevMatrix::zeros();
        let mut shear_rates = vec![0.0; self.n_systems()];

        for s in 0..self.n_systems() {
            let m = &self.schmid[s];
            let r = self.ratio(s, m.dot(stress));
            if r == 0.0 {
                continue;
            }
            let n = self.exponent[s];
            let abs_pow = r.abs().powf(n - 1.0);
            let gamma_dot = self.reference_rate[s] * abs_pow * r;
            shear_rates[s] = gamma_dot;
            strain_rate += m * gamma_dot;

            let coefficient = self.reference_rate[s] / self.crss[s] * abs_pow;
            let mm = m * m.transpose();
            secant += mm * coefficient;
            tangent += mm * (n * coefficient);
        }

        PowerLawResponse {
            strain_rate,
            shear_rates,
            secant,
            tangent,
        }
    }

    /// Linear compliance with every system at unit activity:
    /// `M0 = Σ γ̇0/τc m⊗m`. Used to build the initial stress guess.
    pub fn equal_activity_compliance(&self) -> DevMatrix {
        let mut m0 = DevMatrix::zeros();
        for s in 0..self.n_systems() {
            let m = &self.schmid[s];
            m0 += m * m.transpose() * (self.reference_rate[s] / self.crss[s]);
        }
        m0
    }

    /// Volume-average stress exponent used to scale stress guesses.
    pub fn mean_exponent(&self) -> f64 {
        if self.exponent.is_empty() {
            return 1.0;
        }
        self.exponent.iter().sum::<f64>() / self.exponent.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::tensor_to_b;
    use crate::rotation::rotation_from_euler;
    use crate::types::deviatoric;
    use approx::assert_relative_eq;

    fn fcc_kinetics() -> GrainKinetics {
        let fcc = CrystalSystem::fcc(1.0, 0.05).unwrap();
        let g = rotation_from_euler(0.3, 0.8, 1.1);
        GrainKinetics::new(&fcc, &g, &vec![10.0; fcc.n_systems()])
    }

    fn sample_stress() -> DevVector {
        DevVector::new(3.0, 15.0, -2.0, 4.0, 1.0)
    }

    #[test]
    fn test_hydrostatic_stress_activates_nothing() {
        let kin = fcc_kinetics();
        let sigma = Tensor2::identity() * 250.0;
        let dev = deviatoric(&tensor_to_b(&sigma));
        assert!(kin.resolved(&dev).iter().all(|t| t.abs() < 1e-12));
        let response = kin.response(&dev);
        assert!(response.shear_rates.iter().all(|g| g.abs() < 1e-100));
        assert!(response.strain_rate.norm() < 1e-100);
    }

    #[test]
    fn test_secant_reproduces_strain_rate() {
        let kin = fcc_kinetics();
        let sigma = sample_stress();
        let response = kin.response(&sigma);
        assert_relative_eq!(response.secant * sigma, response.strain_rate, max_relative = 1e-12);
        assert_relative_eq!(kin.strain_rate(&sigma), response.strain_rate, max_relative = 1e-12);
        assert_relative_eq!(response.tangent, response.secant * 20.0, max_relative = 1e-12);
    }

    #[test]
    fn test_tangent_matches_finite_difference() {
        let kin = fcc_kinetics();
        let sigma = sample_stress();
        let tangent = kin.response(&sigma).tangent;
        let h = 1e-6;
        for j in 0..5 {
            let mut plus = sigma;
            let mut minus = sigma;
            plus[j] += h;
            minus[j] -= h;
            let column = (kin.strain_rate(&plus) - kin.strain_rate(&minus)) / (2.0 * h);
            for i in 0..5 {
                assert_relative_eq!(tangent[(i, j)], column[i], max_relative = 1e-5, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_schmid_rotation_is_consistent_with_tensor_rotation() {
        let fcc = CrystalSystem::fcc(1.0, 0.05).unwrap();
        let g = rotation_from_euler(0.3, 0.8, 1.1);
        let kin = GrainKinetics::new(&fcc, &g, &vec![1.0; 12]);
        let s0 = &fcc.systems[0];
        let m_sample = g.transpose() * (s0.direction * s0.normal.transpose()) * g;
        assert_relative_eq!(kin.schmid[0], deviatoric(&tensor_to_b(&m_sample)), epsilon = 1e-12);
    }

    #[test]
    fn test_twins_are_unidirectional() {
        let hcp = CrystalSystem::hcp(1.624, 1.0, 0.05).unwrap();
        let kin = GrainKinetics::new(&hcp, &Tensor2::identity(), &vec![1.0; hcp.n_systems()]);
        let sigma = sample_stress() * 0.1;
        let rates = kin.shear_rates(&sigma);
        let resolved = kin.resolved(&sigma);
        for s in hcp.twin_systems() {
            if resolved[s] <= 0.0 {
                assert_eq!(rates[s], 0.0);
            } else {
                assert!(rates[s] > 0.0);
            }
        }
        let reversed = kin.shear_rates(&(-sigma));
        for s in hcp.twin_systems() {
            assert!(rates[s] == 0.0 || reversed[s] == 0.0);
        }
    }

    #[test]
    fn test_rate_scales_with_stress_power() {
        let kin = fcc_kinetics();
        let sigma = sample_stress();
        let d1 = kin.strain_rate(&sigma);
        let d2 = kin.strain_rate(&(sigma * 1.1));
        assert_relative_eq!(d2, d1 * 1.1_f64.powf(20.0), max_relative = 1e-10);
    }
}
