//! Deformation step driver.
//!
//! One increment runs the pipeline
//!
//! 1. self-consistent solve for the boundary condition
//! 2. commit grain and macroscopic states
//! 3. hardening from the shear increments
//! 4. twin accumulation and reorientation
//! 5. lattice rotation
//! 6. shape evolution (and fragmentation)
//! 7. strain and time accumulation, invariant check
//!
//! and writes only the aggregate it owns. Each stage reads the converged
//! solution of stage 1 and the grain state left by the previous stage.

use crate::basis::b_to_tensor;
use crate::boundary::BoundaryCondition;
use crate::config::VpscConfig;
use crate::error::{Error, Result};
use crate::hardening::{create_hardening, harden, Conditions, HardeningInput, HardeningModel};
use crate::orientation::{lattice_spin, plastic_spin, rotate, spin_perturbation};
use crate::polycrystal::Polycrystal;
use crate::report::{StepDiagnostics, StepReport};
use crate::rotation::{axial, skew};
use crate::self_consistent::{IncrementSolution, SelfConsistentSolver};
use crate::shape::{evolve, ShapeMode, ShapeUpdate};
use crate::twinning::{accumulate, apply_twinning};
use crate::types::{deviatoric, von_mises_strain_rate, with_hydrostatic, BVector, DevVector, Tensor2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// A boundary condition held for a number of equal strain increments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingStep {
    pub boundary: BoundaryCondition,
    pub increments: usize,
    /// Von Mises strain per increment.
    pub strain_increment: f64,
}

impl LoadingStep {
    pub fn new(boundary: BoundaryCondition, increments: usize, strain_increment: f64) -> Self {
        Self {
            boundary,
            increments,
            strain_increment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.boundary.validate()?;
        if !(self.strain_increment > 0.0) {
            return Err(Error::InvalidConfig("strain increment must be positive".into()));
        }
        Ok(())
    }
}

/// A polycrystal advanced through loading steps.
#[derive(Debug)]
pub struct Simulation {
    poly: Polycrystal,
    config: VpscConfig,
    solver: SelfConsistentSolver,
    models: Vec<Box<dyn HardeningModel>>,
}

impl Simulation {
    /// Prepare a run.
    ///
    /// A fresh aggregate (no completed increment) gets its initial CRSS
    /// re-derived at the configured temperature.
    pub fn new(mut poly: Polycrystal, config: VpscConfig) -> Result<Self> {
        config.validate()?;
        poly.validate()?;
        if poly.step == 0 {
            let conditions = Conditions {
                temperature: config.temperature,
                ..Conditions::default()
            };
            for phase in &mut poly.phases {
                phase.reset_hardening(&conditions)?;
            }
        }
        let models = poly
            .phases
            .iter()
            .map(|p| create_hardening(&p.hardening, &p.crystal))
            .collect::<Result<Vec<_>>>()?;
        let solver = SelfConsistentSolver::new(config.self_consistent, config.grain, config.eshelby)
            .with_per_grain_shapes(config.shape.mode == ShapeMode::PerGrain);
        Ok(Self {
            poly,
            config,
            solver,
            models,
        })
    }

    pub fn polycrystal(&self) -> &Polycrystal {
        &self.poly
    }

    pub fn into_polycrystal(self) -> Polycrystal {
        self.poly
    }

    pub fn config(&self) -> &VpscConfig {
        &self.config
    }

    /// Apply every step in order.
    pub fn run(&mut self, steps: &[LoadingStep]) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        for step in steps {
            reports.extend(self.run_step(step)?);
        }
        Ok(reports)
    }

    /// Apply all increments of one loading step.
    pub fn run_step(&mut self, step: &LoadingStep) -> Result<Vec<StepReport>> {
        step.validate()?;
        (0..step.increments)
            .map(|_| self.increment(&step.boundary, step.strain_increment))
            .collect()
    }

    /// Advance the aggregate by one strain increment.
    ///
    /// Numerical failures carry the index of the increment. On error the
    /// aggregate is left as it was before the increment.
    pub fn increment(&mut self, bc: &BoundaryCondition, strain_increment: f64) -> Result<StepReport> {
        let index = self.poly.step;
        self.advance(bc, strain_increment).map_err(|e| e.at_step(index))
    }

    fn advance(&mut self, bc: &BoundaryCondition, strain_increment: f64) -> Result<StepReport> {
        let index = self.poly.step;
        let solution = self.solver.solve(&self.poly, bc)?;

        let rate = von_mises_strain_rate(&solution.macro_state.strain_rate);
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(Error::InvalidBoundaryCondition(format!(
                "equivalent strain rate is {:e}, cannot size the increment",
                rate
            )));
        }
        let dt = strain_increment / rate;
        let velocity_gradient = b_to_tensor(&solution.macro_state.strain_rate) + skew(&bc.spin());

        let mut next = self.poly.clone();
        let mut diagnostics = StepDiagnostics {
            solve: solution.diagnostics.clone(),
            ..StepDiagnostics::default()
        };

        commit(&mut next, &solution, velocity_gradient);
        diagnostics.crss_floor_hits = self.apply_hardening(&mut next, dt);
        if diagnostics.crss_floor_hits > 0 {
            warn!(step = index, hits = diagnostics.crss_floor_hits, "CRSS clamped at floor");
        }

        // Grains that take a twin orientation this increment skip the
        // lattice rotation; split pseudo-grains have no solved response.
        let mut reoriented = HashSet::new();
        for (p, phase) in next.phases.iter_mut().enumerate() {
            let crystal = phase.crystal.clone();
            if crystal.has_twins() {
                for grain in &mut phase.grains {
                    let increments: Vec<f64> = grain.shear_rates.iter().map(|r| r * dt).collect();
                    accumulate(grain, &crystal, &increments);
                }
            }
            let events = apply_twinning(phase, p, &self.config.twinning, index)?;
            reoriented.extend(events.iter().filter(|e| e.child.is_none()).map(|e| (p, e.grain)));
            diagnostics.twin_events.extend(events);
        }

        let macro_rate = deviatoric(&solution.macro_state.strain_rate);
        let macro_spin = bc.spin();
        for (p, phase) in next.phases.iter_mut().enumerate() {
            let responses = &solution.grains[p];
            for (g, grain) in phase.grains.iter_mut().enumerate().take(responses.len()) {
                if reoriented.contains(&(p, g)) {
                    continue;
                }
                let response = &responses[g];
                let perturbation =
                    spin_perturbation(&response.spin_localization, &response.solution.strain_rate, &macro_rate);
                let plastic = plastic_spin(&phase.crystal, &grain.orientation, &response.solution.shear_rates);
                let spin = lattice_spin(&macro_spin, &perturbation, &plastic);
                grain.orientation = rotate(&grain.orientation, &spin, dt)?;
            }
        }

        let (fragmentations, frozen) = self.update_shapes(&mut next, &solution, &velocity_gradient, dt)?;
        diagnostics.fragmentations = fragmentations;
        diagnostics.frozen_shapes = frozen;

        next.accumulated_strain += strain_increment;
        next.time += dt;
        next.step += 1;
        next.validate()?;

        self.poly = next;
        let report = StepReport::new(index, &self.poly, diagnostics);
        info!(
            step = index,
            strain = report.strain,
            stress = report.von_mises_stress,
            iterations = report.diagnostics.solve.iterations,
            degraded = report.diagnostics.solve.degraded,
            "increment complete"
        );
        Ok(report)
    }

    /// Update CRSS and hardening state of every grain; returns floor hits.
    fn apply_hardening(&self, poly: &mut Polycrystal, dt: f64) -> usize {
        let mut hits = 0;
        for (phase, model) in poly.phases.iter_mut().zip(&self.models) {
            for grain in &mut phase.grains {
                let increments: Vec<f64> = grain.shear_rates.iter().map(|r| r * dt).collect();
                let conditions = Conditions {
                    temperature: self.config.temperature,
                    strain_rate: von_mises_strain_rate(&with_hydrostatic(&grain.strain_rate, 0.0)),
                };
                let update = harden(
                    model.as_ref(),
                    &HardeningInput {
                        crss: &grain.crss,
                        state: &grain.hardening,
                        shear_increments: &increments,
                        conditions,
                    },
                    self.config.crss_floor,
                );
                for (total, inc) in grain.accumulated_shear.iter_mut().zip(&increments) {
                    *total += inc.abs();
                }
                grain.crss = update.crss;
                grain.hardening = update.state;
                hits += update.floor_hits;
            }
        }
        hits
    }

    /// Returns `(fragmentations, newly frozen phase shapes)`.
    fn update_shapes(
        &self,
        poly: &mut Polycrystal,
        solution: &IncrementSolution,
        velocity_gradient: &Tensor2,
        dt: f64,
    ) -> Result<(usize, usize)> {
        let config = &self.config.shape;
        let mut fragmentations = 0;
        let mut frozen = 0;
        match config.mode {
            ShapeMode::Fixed => {}
            ShapeMode::PhaseAverage => {
                for (p, phase) in poly.phases.iter_mut().enumerate() {
                    if phase.shape_frozen {
                        continue;
                    }
                    match evolve(&phase.shape, velocity_gradient, dt, config, false)? {
                        ShapeUpdate::Deformed(shape) => {
                            let shape = shape.normalized();
                            phase.shape = shape;
                            phase.grains.iter_mut().for_each(|g| g.shape = shape);
                        }
                        ShapeUpdate::Frozen | ShapeUpdate::Fragment(_) => {
                            phase.shape_frozen = true;
                            frozen += 1;
                            warn!(phase = p, aspect_ratio = phase.shape.aspect_ratio(), "phase shape frozen");
                        }
                        ShapeUpdate::Unchanged => {}
                    }
                }
            }
            ShapeMode::PerGrain => {
                let macro_rate = deviatoric(&solution.macro_state.strain_rate);
                let macro_spin = axial(velocity_gradient);
                for (p, phase) in poly.phases.iter_mut().enumerate() {
                    let responses = &solution.grains[p];
                    let mut next_id = phase.next_grain_id();
                    let mut pieces = Vec::new();
                    for (g, grain) in phase.grains.iter_mut().enumerate().take(responses.len()) {
                        let response = &responses[g];
                        let rate = &response.solution.strain_rate;
                        let spin = macro_spin + spin_perturbation(&response.spin_localization, rate, &macro_rate);
                        let l = b_to_tensor(&with_hydrostatic(rate, 0.0)) + skew(&spin);
                        match evolve(&grain.shape, &l, dt, config, true)? {
                            ShapeUpdate::Deformed(shape) => grain.shape = shape.normalized(),
                            ShapeUpdate::Fragment(shape) => {
                                let n = config.fragments;
                                grain.weight /= n as f64;
                                grain.shape = shape;
                                for _ in 1..n {
                                    let mut piece = grain.clone();
                                    piece.id = next_id;
                                    next_id += 1;
                                    pieces.push(piece);
                                }
                                fragmentations += 1;
                                warn!(phase = p, grain = g, fragments = n, "grain fragmented");
                            }
                            ShapeUpdate::Frozen | ShapeUpdate::Unchanged => {}
                        }
                    }
                    phase.grains.extend(pieces);
                }
            }
        }
        Ok((fragmentations, frozen))
    }
}

/// Write converged grain, phase and macroscopic states into `poly`.
fn commit(poly: &mut Polycrystal, solution: &IncrementSolution, velocity_gradient: Tensor2) {
    let hydrostatic = solution.macro_state.stress[5];
    for (phase, responses) in poly.phases.iter_mut().zip(&solution.grains) {
        let mut stress = BVector::zeros();
        let mut strain_rate = DevVector::zeros();
        for (grain, response) in phase.grains.iter_mut().zip(responses) {
            let s = &response.solution;
            grain.stress = with_hydrostatic(&s.stress, hydrostatic);
            grain.strain_rate = s.strain_rate;
            grain.shear_rates = s.shear_rates.clone();
            grain.compliance = s.secant;
            stress += grain.stress * grain.weight;
            strain_rate += grain.strain_rate * grain.weight;
        }
        let total = phase.total_weight();
        phase.stress = stress / total;
        phase.strain_rate = strain_rate / total;
    }
    poly.stress = solution.macro_state.stress;
    poly.strain_rate = solution.macro_state.strain_rate;
    poly.velocity_gradient = velocity_gradient;
    poly.medium = Some(solution.medium);
    poly.neff = solution.neff;
}
