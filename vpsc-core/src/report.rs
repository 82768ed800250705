//! Plain-data step reports for output collaborators.

use crate::basis::b_to_tensor;
use crate::polycrystal::{Phase, Polycrystal};
use crate::self_consistent::SolveDiagnostics;
use crate::twinning::TwinEvent;
use crate::types::{von_mises_strain_rate, von_mises_stress, with_hydrostatic, Tensor2};
use serde::{Deserialize, Serialize};

/// Fraction of a grain's largest shear rate above which a system counts
/// as active.
pub const ACTIVE_SYSTEM_THRESHOLD: f64 = 0.05;

/// Share of the phase's total shear rate carried by one family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyActivity {
    pub family: String,
    pub relative_activity: f64,
}

/// Phase averages of one increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub n_grains: usize,
    pub stress: Tensor2,
    pub strain_rate: Tensor2,
    pub von_mises_stress: f64,
    pub von_mises_strain_rate: f64,
    pub activity: Vec<FamilyActivity>,
    /// Weighted average number of active systems per grain.
    pub active_systems: f64,
    /// Weighted average CRSS over all systems.
    pub mean_crss: f64,
    /// Phase ellipsoid aspect ratio.
    pub aspect_ratio: f64,
}

impl PhaseReport {
    pub fn new(phase: &Phase) -> Self {
        let (activity, active_systems) = activity_statistics(phase);
        let total = phase.total_weight();
        let mean_crss = if total > 0.0 {
            phase
                .grains
                .iter()
                .map(|g| g.weight * g.crss.iter().sum::<f64>() / g.crss.len().max(1) as f64)
                .sum::<f64>()
                / total
        } else {
            0.0
        };
        let strain_rate = with_hydrostatic(&phase.strain_rate, 0.0);
        Self {
            name: phase.name.clone(),
            n_grains: phase.grains.len(),
            stress: b_to_tensor(&phase.stress),
            strain_rate: b_to_tensor(&strain_rate),
            von_mises_stress: von_mises_stress(&phase.stress),
            von_mises_strain_rate: von_mises_strain_rate(&strain_rate),
            activity,
            active_systems,
            mean_crss,
            aspect_ratio: phase.shape.aspect_ratio(),
        }
    }
}

/// Per-family relative activity and average active-system count.
pub fn activity_statistics(phase: &Phase) -> (Vec<FamilyActivity>, f64) {
    let crystal = &phase.crystal;
    let mut by_family = vec![0.0; crystal.families.len()];
    let mut active = 0.0;
    let mut weight = 0.0;
    for grain in &phase.grains {
        let largest = grain.shear_rates.iter().fold(0.0_f64, |m, r| m.max(r.abs()));
        for (s, rate) in grain.shear_rates.iter().enumerate() {
            by_family[crystal.systems[s].family] += grain.weight * rate.abs();
        }
        if largest > 0.0 {
            let count = grain
                .shear_rates
                .iter()
                .filter(|r| r.abs() >= ACTIVE_SYSTEM_THRESHOLD * largest)
                .count();
            active += grain.weight * count as f64;
        }
        weight += grain.weight;
    }
    let total: f64 = by_family.iter().sum();
    let activity = crystal
        .families
        .iter()
        .zip(&by_family)
        .map(|(family, &a)| FamilyActivity {
            family: family.name.clone(),
            relative_activity: if total > 0.0 { a / total } else { 0.0 },
        })
        .collect();
    let active_systems = if weight > 0.0 { active / weight } else { 0.0 };
    (activity, active_systems)
}

/// Everything that happened to the microstructure in one increment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    pub solve: SolveDiagnostics,
    /// Systems clamped at the CRSS floor.
    pub crss_floor_hits: usize,
    pub twin_events: Vec<TwinEvent>,
    pub fragmentations: usize,
    /// Phases whose ellipsoid froze this increment.
    pub frozen_shapes: usize,
}

impl StepDiagnostics {
    pub fn reorientations(&self) -> usize {
        self.twin_events.len()
    }
}

/// Macroscopic and per-phase state after one increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Zero-based increment index over the whole run.
    pub step: usize,
    pub strain: f64,
    pub time: f64,
    pub stress: Tensor2,
    pub strain_rate: Tensor2,
    pub velocity_gradient: Tensor2,
    pub von_mises_stress: f64,
    pub von_mises_strain_rate: f64,
    pub phases: Vec<PhaseReport>,
    pub diagnostics: StepDiagnostics,
}

impl StepReport {
    pub fn new(step: usize, poly: &Polycrystal, diagnostics: StepDiagnostics) -> Self {
        Self {
            step,
            strain: poly.accumulated_strain,
            time: poly.time,
            stress: b_to_tensor(&poly.stress),
            strain_rate: b_to_tensor(&poly.strain_rate),
            velocity_gradient: poly.velocity_gradient,
            von_mises_stress: von_mises_stress(&poly.stress),
            von_mises_strain_rate: von_mises_strain_rate(&poly.strain_rate),
            phases: poly.phases.iter().map(PhaseReport::new).collect(),
            diagnostics,
        }
    }
}
