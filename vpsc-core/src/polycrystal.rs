//! Aggregate state: grains, phases and the polycrystal.
//!
//! [`Polycrystal`] is the whole mutable state threaded through the
//! deformation steps and the unit of checkpoint/restart. Phases own their
//! grains exclusively and share an immutable [`CrystalSystem`].

use crate::error::{Error, Result};
use crate::hardening::{create_hardening, Conditions, HardeningLaw, HardeningState};
use crate::crystal::CrystalSystem;
use crate::rotation::orthogonality_error;
use crate::shape::Ellipsoid;
use crate::texture::TextureEntry;
use crate::types::{BVector, DevMatrix, DevVector, Tensor2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tolerance on weight and fraction sums.
const WEIGHT_TOL: f64 = 1e-8;
/// Tolerance on the orthogonality of stored orientations.
const ORTHOGONALITY_TOL: f64 = 1e-8;

/// One grain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grain {
    /// Identifier, unique within the phase.
    pub id: usize,
    /// Bunge orientation matrix (sample to crystal).
    pub orientation: Tensor2,
    /// Volume fraction in the aggregate.
    pub weight: f64,
    pub crss: Vec<f64>,
    /// Accumulated absolute shear per system.
    pub accumulated_shear: Vec<f64>,
    /// Last converged stress (b-basis, with the macroscopic pressure).
    pub stress: BVector,
    /// Last converged strain rate (deviatoric).
    pub strain_rate: DevVector,
    /// Last converged shear rate per system.
    pub shear_rates: Vec<f64>,
    /// Secant viscous compliance at the last converged state.
    pub compliance: DevMatrix,
    pub shape: Ellipsoid,
    pub hardening: HardeningState,
    /// Twinned volume fraction per system (zero for slip systems).
    pub twin_fraction: Vec<f64>,
    /// Parent grain id for twin pseudo-grains.
    pub parent: Option<usize>,
}

impl Grain {
    fn new(id: usize, orientation: Tensor2, weight: f64, crss: Vec<f64>, hardening: HardeningState, shape: Ellipsoid) -> Self {
        let n = crss.len();
        Self {
            id,
            orientation,
            weight,
            crss,
            accumulated_shear: vec![0.0; n],
            stress: BVector::zeros(),
            strain_rate: DevVector::zeros(),
            shear_rates: vec![0.0; n],
            compliance: DevMatrix::zeros(),
            shape,
            hardening,
            twin_fraction: vec![0.0; n],
            parent: None,
        }
    }

    /// True once the grain has been through at least one converged step.
    pub fn has_converged_state(&self) -> bool {
        self.strain_rate.norm() > 0.0 || self.stress.norm() > 0.0
    }
}

/// Grains sharing one crystal system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub crystal: Arc<CrystalSystem>,
    /// Volume fraction of the phase.
    pub fraction: f64,
    pub grains: Vec<Grain>,
    pub hardening: HardeningLaw,
    /// Phase-average morphology.
    pub shape: Ellipsoid,
    /// Set once the phase shape reached the critical aspect ratio.
    pub shape_frozen: bool,
    /// Phase-average stress.
    pub stress: BVector,
    /// Phase-average strain rate.
    pub strain_rate: DevVector,
}

impl Phase {
    /// Phase of equal-weight grains with the given orientations.
    ///
    /// Initial CRSS and hardening state come from the hardening law at the
    /// default [`Conditions`].
    pub fn from_orientations(
        name: &str,
        crystal: Arc<CrystalSystem>,
        fraction: f64,
        orientations: &[Tensor2],
        hardening: HardeningLaw,
    ) -> Result<Self> {
        let n = orientations.len();
        let weights = vec![1.0; n];
        Self::with_weights(name, crystal, fraction, orientations, &weights, hardening)
    }

    /// Phase with relative grain weights, rescaled to sum to `fraction`.
    pub fn with_weights(
        name: &str,
        crystal: Arc<CrystalSystem>,
        fraction: f64,
        orientations: &[Tensor2],
        weights: &[f64],
        hardening: HardeningLaw,
    ) -> Result<Self> {
        if orientations.is_empty() {
            return Err(Error::InvalidState(format!("phase '{}' has no grains", name)));
        }
        if orientations.len() != weights.len() {
            return Err(Error::InvalidState(format!(
                "phase '{}': {} orientations but {} weights",
                name,
                orientations.len(),
                weights.len()
            )));
        }
        if weights.iter().any(|&w| !(w > 0.0)) {
            return Err(Error::InvalidState(format!("phase '{}': grain weights must be positive", name)));
        }
        if !(fraction > 0.0 && fraction <= 1.0 + WEIGHT_TOL) {
            return Err(Error::InvalidState(format!("phase '{}': fraction must be in (0, 1]", name)));
        }

        let model = create_hardening(&hardening, &crystal)?;
        let state = model.initial_state();
        let crss = model.initial_crss(&state, &Conditions::default());
        if crss.iter().any(|&t| !(t > 0.0)) {
            return Err(Error::InvalidState(format!("phase '{}': initial CRSS must be positive", name)));
        }

        let total: f64 = weights.iter().sum();
        let shape = Ellipsoid::sphere();
        let grains = orientations
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(id, (g, &w))| Grain::new(id, *g, fraction * w / total, crss.clone(), state.clone(), shape))
            .collect();

        Ok(Self {
            name: name.to_string(),
            crystal,
            fraction,
            grains,
            hardening,
            shape,
            shape_frozen: false,
            stress: BVector::zeros(),
            strain_rate: DevVector::zeros(),
        })
    }

    /// Set the initial morphology of the phase and all its grains.
    pub fn with_shape(mut self, shape: Ellipsoid) -> Self {
        self.shape = shape;
        for grain in &mut self.grains {
            grain.shape = shape;
        }
        self
    }

    /// Re-derive initial CRSS from the hardening law at `conditions`.
    pub fn reset_hardening(&mut self, conditions: &Conditions) -> Result<()> {
        let model = create_hardening(&self.hardening, &self.crystal)?;
        let state = model.initial_state();
        let crss = model.initial_crss(&state, conditions);
        for grain in &mut self.grains {
            grain.hardening = state.clone();
            grain.crss = crss.clone();
        }
        Ok(())
    }

    pub fn total_weight(&self) -> f64 {
        self.grains.iter().map(|g| g.weight).sum()
    }

    /// Next unused grain id.
    pub fn next_grain_id(&self) -> usize {
        self.grains.iter().map(|g| g.id + 1).max().unwrap_or(0)
    }
}

/// Linearized effective medium `Ē = M̄ Σ' + Ē⁰`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Medium {
    pub compliance: DevMatrix,
    pub back_extrapolated: DevVector,
}

/// The aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polycrystal {
    pub phases: Vec<Phase>,
    /// Macroscopic stress (b-basis).
    pub stress: BVector,
    /// Macroscopic strain rate (b-basis, deviatoric).
    pub strain_rate: BVector,
    /// Macroscopic velocity gradient of the last increment.
    pub velocity_gradient: Tensor2,
    /// Effective medium of the last converged increment.
    pub medium: Option<Medium>,
    /// Interaction scaling `neff` of the last converged increment.
    pub neff: f64,
    /// Accumulated von Mises strain.
    pub accumulated_strain: f64,
    pub time: f64,
    /// Number of completed increments.
    pub step: usize,
}

impl Polycrystal {
    /// Build an aggregate; phase fractions must sum to one.
    pub fn new(phases: Vec<Phase>) -> Result<Self> {
        let poly = Self {
            phases,
            stress: BVector::zeros(),
            strain_rate: BVector::zeros(),
            velocity_gradient: Tensor2::zeros(),
            medium: None,
            neff: 1.0,
            accumulated_strain: 0.0,
            time: 0.0,
            step: 0,
        };
        poly.validate()?;
        Ok(poly)
    }

    /// Single-phase aggregate.
    pub fn single_phase(phase: Phase) -> Result<Self> {
        Self::new(vec![phase])
    }

    pub fn n_grains(&self) -> usize {
        self.phases.iter().map(|p| p.grains.len()).sum()
    }

    /// All grains as `(phase index, grain index, grain)` in storage order.
    pub fn grains(&self) -> impl Iterator<Item = (usize, usize, &Grain)> + '_ {
        self.phases
            .iter()
            .enumerate()
            .flat_map(|(p, phase)| phase.grains.iter().enumerate().map(move |(g, grain)| (p, g, grain)))
    }

    /// Check the aggregate invariants.
    ///
    /// # Errors
    ///
    /// `InvalidState` if fractions or weights do not add up, a CRSS is not
    /// positive, per-system arrays have the wrong length, or an orientation
    /// is not a proper rotation.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::InvalidState("polycrystal has no phases".into()));
        }
        let total: f64 = self.phases.iter().map(|p| p.fraction).sum();
        if (total - 1.0).abs() > WEIGHT_TOL {
            return Err(Error::InvalidState(format!("phase fractions sum to {}, not 1", total)));
        }
        for (p, phase) in self.phases.iter().enumerate() {
            let weight = phase.total_weight();
            if (weight - phase.fraction).abs() > WEIGHT_TOL * phase.grains.len().max(1) as f64 {
                return Err(Error::InvalidState(format!(
                    "phase {}: grain weights sum to {}, phase fraction is {}",
                    p, weight, phase.fraction
                )));
            }
            let n = phase.crystal.n_systems();
            for (g, grain) in phase.grains.iter().enumerate() {
                if !(grain.weight > 0.0) {
                    return Err(Error::InvalidState(format!("phase {} grain {}: non-positive weight", p, g)));
                }
                if grain.crss.len() != n || grain.accumulated_shear.len() != n || grain.twin_fraction.len() != n {
                    return Err(Error::InvalidState(format!(
                        "phase {} grain {}: per-system arrays do not match {} systems",
                        p, g, n
                    )));
                }
                if let Some(s) = grain.crss.iter().position(|&t| !(t > 0.0)) {
                    return Err(Error::InvalidState(format!(
                        "phase {} grain {}: CRSS of system {} is {}",
                        p, g, s, grain.crss[s]
                    )));
                }
                let error = orthogonality_error(&grain.orientation);
                if error > ORTHOGONALITY_TOL {
                    return Err(Error::InvalidState(format!(
                        "phase {} grain {}: orientation is not a rotation (error {:.3e})",
                        p, g, error
                    )));
                }
            }
        }
        Ok(())
    }

    /// Current texture: Euler angles, weights and grain axes.
    pub fn texture(&self) -> Vec<TextureEntry> {
        self.grains()
            .map(|(p, g, grain)| {
                let a = grain.shape.axes;
                TextureEntry::new(p, g, &grain.orientation, grain.weight, [a[0], a[1], a[2]])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardening::{VoceLaw, VoceParams};
    use crate::texture::random_orientations;
    use approx::assert_relative_eq;

    fn fcc_phase(n: usize, fraction: f64) -> Phase {
        let fcc = Arc::new(CrystalSystem::fcc(1.0, 0.05).unwrap());
        Phase::from_orientations(
            "fcc",
            fcc,
            fraction,
            &random_orientations(n, 1),
            HardeningLaw::Voce(VoceLaw::uniform(1, VoceParams::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_equal_weights_sum_to_fraction() {
        let phase = fcc_phase(10, 1.0);
        assert_relative_eq!(phase.total_weight(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(phase.grains[3].weight, 0.1, epsilon = 1e-12);
        assert_eq!(phase.grains[0].crss, vec![1.0; 12]);
        assert_eq!(phase.next_grain_id(), 10);
    }

    #[test]
    fn test_polycrystal_validates_fractions() {
        assert!(Polycrystal::new(vec![fcc_phase(4, 0.6), fcc_phase(4, 0.4)]).is_ok());
        assert!(matches!(
            Polycrystal::new(vec![fcc_phase(4, 0.6), fcc_phase(4, 0.6)]),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_validate_catches_broken_invariants() {
        let mut poly = Polycrystal::single_phase(fcc_phase(5, 1.0)).unwrap();
        poly.phases[0].grains[2].crss[4] = 0.0;
        assert!(poly.validate().is_err());

        let mut poly = Polycrystal::single_phase(fcc_phase(5, 1.0)).unwrap();
        poly.phases[0].grains[1].orientation *= 1.01;
        assert!(poly.validate().is_err());

        let mut poly = Polycrystal::single_phase(fcc_phase(5, 1.0)).unwrap();
        poly.phases[0].grains[0].weight *= 2.0;
        assert!(poly.validate().is_err());
    }

    #[test]
    fn test_texture_snapshot() {
        let poly = Polycrystal::single_phase(fcc_phase(3, 1.0).with_shape(
            Ellipsoid::new(nalgebra::Vector3::new(2.0, 1.0, 0.5), Tensor2::identity()).unwrap(),
        ))
        .unwrap();
        let texture = poly.texture();
        assert_eq!(texture.len(), 3);
        assert_eq!(texture[1].grain, 1);
        assert_eq!(texture[2].axes, [2.0, 1.0, 0.5]);
        assert_relative_eq!(texture.iter().map(|t| t.weight).sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_phase_rejected() {
        let fcc = Arc::new(CrystalSystem::fcc(1.0, 0.05).unwrap());
        let law = HardeningLaw::Voce(VoceLaw::uniform(1, VoceParams::default()));
        assert!(Phase::from_orientations("empty", fcc, 1.0, &[], law).is_err());
    }
}
