//! Predominant twin reorientation.
//!
//! Every twin system accumulates a twinned volume fraction
//! `Δf_s = max(Δγ_s, 0) / s_twin` per step. When the predominant twin
//! system of a grain crosses the threshold (deterministically, or compared
//! against a uniform draw), the twinned volume either takes over the whole
//! grain ([`TwinMode::Reorient`]) or is split off as a pseudo-grain
//! ([`TwinMode::SplitPseudoGrain`]). The twin lattice is the parent
//! rotated 180° about the twin plane normal.

use crate::crystal::CrystalSystem;
use crate::error::{Error, Result};
use crate::polycrystal::{Grain, Phase};
use crate::rotation::{half_turn, orthonormalize};
use crate::types::Tensor2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How a grain decides to reorient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinSelection {
    /// Reorient once the fraction reaches the threshold.
    Deterministic,
    /// Reorient once the fraction exceeds `threshold · u`, `u ~ U[0, 1)`.
    Stochastic { seed: u64 },
}

/// What happens to the twinned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinMode {
    /// The whole grain takes the twin orientation.
    Reorient,
    /// A child grain with the twin orientation receives the twinned weight.
    SplitPseudoGrain,
}

/// Twinning policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinningConfig {
    pub enabled: bool,
    /// Twinned fraction that triggers a reorientation.
    pub threshold: f64,
    pub selection: TwinSelection,
    pub mode: TwinMode,
}

impl Default for TwinningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            selection: TwinSelection::Deterministic,
            mode: TwinMode::Reorient,
        }
    }
}

impl TwinningConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::InvalidConfig("twin threshold must be in (0, 1]".into()));
        }
        Ok(())
    }
}

/// One reorientation or split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwinEvent {
    pub phase: usize,
    /// Index of the twinning grain in its phase.
    pub grain: usize,
    /// Predominant twin system.
    pub system: usize,
    /// Twinned fraction at the event.
    pub fraction: f64,
    /// Index of the new pseudo-grain when split.
    pub child: Option<usize>,
}

/// Add the twinned fraction of one step to a grain.
///
/// The total twinned fraction of a grain is capped at 1.
pub fn accumulate(grain: &mut Grain, crystal: &CrystalSystem, shear_increments: &[f64]) {
    for (s, system) in crystal.systems.iter().enumerate() {
        if let Some(shear) = system.twin_shear {
            grain.twin_fraction[s] += shear_increments[s].max(0.0) / shear;
        }
    }
    let total: f64 = grain.twin_fraction.iter().sum();
    if total > 1.0 {
        for f in &mut grain.twin_fraction {
            *f /= total;
        }
    }
}

/// Twin system with the largest accumulated fraction, if any twinned.
pub fn predominant(grain: &Grain, crystal: &CrystalSystem) -> Option<(usize, f64)> {
    crystal
        .twin_systems()
        .into_iter()
        .map(|s| (s, grain.twin_fraction[s]))
        .filter(|&(_, f)| f > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Orientation of the twin lattice of system `system`.
pub fn twin_orientation(orientation: &Tensor2, crystal: &CrystalSystem, system: usize) -> Result<Tensor2> {
    let normal = crystal.systems[system].normal;
    orthonormalize(&(half_turn(&normal) * orientation))
}

/// Apply the twinning policy to every grain of a phase.
///
/// Grains added by a split are appended after the existing grains and keep
/// their parent's hardening history. Pseudo-grains do not twin again.
pub fn apply_twinning(phase: &mut Phase, phase_index: usize, config: &TwinningConfig, step: usize) -> Result<Vec<TwinEvent>> {
    if !config.enabled || !phase.crystal.has_twins() {
        return Ok(Vec::new());
    }
    let mut rng = match config.selection {
        TwinSelection::Stochastic { seed } => Some(StdRng::seed_from_u64(
            seed ^ ((step as u64) << 16) ^ phase_index as u64,
        )),
        TwinSelection::Deterministic => None,
    };

    let crystal = phase.crystal.clone();
    let mut next_id = phase.next_grain_id();
    let first_child = phase.grains.len();
    let mut events = Vec::new();
    let mut children = Vec::new();

    for (g, grain) in phase.grains.iter_mut().enumerate() {
        if grain.parent.is_some() {
            continue;
        }
        let Some((system, fraction)) = predominant(grain, &crystal) else {
            continue;
        };
        let trigger = match rng.as_mut() {
            Some(rng) => config.threshold * rng.gen::<f64>(),
            None => config.threshold,
        };
        if fraction < trigger {
            continue;
        }

        let twinned = twin_orientation(&grain.orientation, &crystal, system)?;
        let child = match config.mode {
            TwinMode::SplitPseudoGrain if fraction < 1.0 => {
                let mut twin = grain.clone();
                twin.id = next_id;
                next_id += 1;
                twin.orientation = twinned;
                twin.weight = grain.weight * fraction;
                twin.parent = Some(grain.id);
                twin.twin_fraction.iter_mut().for_each(|f| *f = 0.0);
                grain.weight *= 1.0 - fraction;
                children.push(twin);
                Some(first_child + children.len() - 1)
            }
            // A fully twinned grain leaves no parent volume behind.
            TwinMode::Reorient | TwinMode::SplitPseudoGrain => {
                grain.orientation = twinned;
                None
            }
        };
        grain.twin_fraction.iter_mut().for_each(|f| *f = 0.0);
        events.push(TwinEvent {
            phase: phase_index,
            grain: g,
            system,
            fraction,
            child,
        });
    }

    phase.grains.extend(children);

    for event in &events {
        tracing::warn!(
            phase = event.phase,
            grain = event.grain,
            system = event.system,
            fraction = event.fraction,
            split = event.child.is_some(),
            "twin reorientation"
        );
    }
    Ok(events)
}
