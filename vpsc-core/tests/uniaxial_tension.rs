//! End-to-end tension runs of a random FCC aggregate.

use nalgebra::{Matrix3, Vector3};
use std::sync::Arc;
use vpsc_core::hardening::{VoceLaw, VoceParams};
use vpsc_core::texture::random_orientations;
use vpsc_core::{
    BoundaryCondition, CrystalSystem, HardeningLaw, Interaction, LoadingStep, Phase, Polycrystal, Simulation,
    VpscConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fcc_aggregate(n: usize, params: VoceParams) -> Polycrystal {
    let fcc = Arc::new(CrystalSystem::fcc(1.0, 0.05).unwrap());
    let phase = Phase::from_orientations(
        "fcc",
        fcc,
        1.0,
        &random_orientations(n, 2024),
        HardeningLaw::Voce(VoceLaw::uniform(1, params)),
    )
    .unwrap();
    Polycrystal::single_phase(phase).unwrap()
}

fn hardening() -> VoceParams {
    VoceParams {
        tau0: 1.0,
        tau1: 0.6,
        theta0: 8.0,
        theta1: 0.2,
    }
}

fn no_hardening() -> VoceParams {
    VoceParams {
        tau0: 1.0,
        tau1: 0.0,
        theta0: 0.0,
        theta1: 0.0,
    }
}

fn axial_tension() -> BoundaryCondition {
    BoundaryCondition::full_velocity_gradient(Matrix3::from_diagonal(&Vector3::new(-0.5, -0.5, 1.0)))
}

fn with_interaction(interaction: Interaction) -> VpscConfig {
    let mut config = VpscConfig::default();
    config.self_consistent.interaction = interaction;
    config
}

fn first_increment_stress(interaction: Interaction, n: usize) -> f64 {
    let mut sim = Simulation::new(fcc_aggregate(n, no_hardening()), with_interaction(interaction)).unwrap();
    let report = sim.increment(&axial_tension(), 0.01).unwrap();
    assert!(report.diagnostics.solve.converged);
    report.von_mises_stress
}

#[test]
fn test_affine_tension_converges_and_hardens() {
    init_tracing();
    let mut sim = Simulation::new(fcc_aggregate(40, hardening()), VpscConfig::default()).unwrap();
    let reports = sim.run(&[LoadingStep::new(axial_tension(), 5, 0.04)]).unwrap();

    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| r.diagnostics.solve.converged));
    for pair in reports.windows(2) {
        assert!(pair[1].von_mises_stress > pair[0].von_mises_stress);
    }
    let last = reports.last().unwrap();
    assert!((last.strain - 0.2).abs() < 1e-12);
    // Tension axis carries the load.
    assert!(last.stress[(2, 2)] > last.stress[(0, 0)]);
    assert!(last.stress[(2, 2)] > last.stress[(1, 1)]);
    sim.polycrystal().validate().unwrap();
}

#[test]
fn test_full_constraint_taylor_factor() {
    init_tracing();
    // Random FCC Taylor factor is about 3.06 in the rate-insensitive limit.
    let stress = first_increment_stress(Interaction::FullConstraint, 50);
    assert!(stress > 2.6 && stress < 3.5, "Taylor stress {stress}");
}

#[test]
fn test_self_consistent_below_taylor() {
    init_tracing();
    let taylor = first_increment_stress(Interaction::FullConstraint, 30);
    let affine = first_increment_stress(Interaction::Affine, 30);
    let tangent = first_increment_stress(Interaction::Tangent, 30);
    assert!(affine < taylor * 1.000_001);
    assert!(affine > 0.6 * taylor);
    // The tangent interaction is the most compliant.
    assert!(tangent < affine * 1.000_001);
}

#[test]
fn test_texture_output_matches_grains() {
    let mut sim = Simulation::new(fcc_aggregate(12, hardening()), VpscConfig::default()).unwrap();
    sim.run_step(&LoadingStep::new(axial_tension(), 2, 0.05)).unwrap();
    let texture = sim.polycrystal().texture();
    assert_eq!(texture.len(), 12);
    let total: f64 = texture.iter().map(|e| e.weight).sum();
    assert!((total - 1.0).abs() < 1e-10);
}

#[test]
#[ignore = "long run"]
fn test_large_aggregate_to_unit_strain() {
    init_tracing();
    let mut taylor = Simulation::new(
        fcc_aggregate(500, hardening()),
        with_interaction(Interaction::FullConstraint),
    )
    .unwrap();
    let taylor_stress = taylor.increment(&axial_tension(), 0.05).unwrap().von_mises_stress;
    // Random FCC Taylor factor at τ0 = 1.
    assert!(taylor_stress > 2.6 && taylor_stress < 3.5, "Taylor stress {taylor_stress}");

    let mut sim = Simulation::new(fcc_aggregate(500, hardening()), VpscConfig::default()).unwrap();
    let reports = sim.run(&[LoadingStep::new(axial_tension(), 20, 0.05)]).unwrap();
    assert!(reports.iter().all(|r| r.diagnostics.solve.converged));
    for pair in reports.windows(2) {
        assert!(pair[1].von_mises_stress > pair[0].von_mises_stress);
    }
    assert!((reports[19].strain - 1.0).abs() < 1e-10);

    // Affine initial flow stress sits between 60 % of Taylor and Taylor.
    let ratio = reports[0].von_mises_stress / taylor_stress;
    assert!(ratio > 0.6 && ratio < 1.000_001, "self-consistent / Taylor = {ratio}");
}
