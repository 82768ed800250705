//! Self-consistent homogenization.
//!
//! Each grain response is linearized as `ε̇_g = M_g σ_g + ε̇0_g` (tangent
//! moduli with back-extrapolated rate for the affine variant, secant
//! moduli otherwise). With the interaction equation
//! `ε̇_g − Ē = −M̃ (σ_g − Σ)` this gives the localization
//!
//! ```text
//! σ_g = B_g Σ + b_g
//! B_g = (M_g + M̃)⁻¹ (M̄ + M̃)        b_g = (M_g + M̃)⁻¹ (Ē⁰ − ε̇0_g)
//! ```
//!
//! and the self-consistent update of the effective medium
//!
//! ```text
//! M̄ = ⟨M_g B_g⟩ ⟨B_g⟩⁻¹             Ē⁰ = ⟨M_g b_g + ε̇0_g⟩ − M̄ ⟨b_g⟩
//! ```
//!
//! One outer iteration is a grain sweep at fixed `(M̄, Ē⁰, Σ, Ē)`, the
//! averaged update above (optionally relaxed), and a new solve of the
//! boundary condition. The loop stops when the medium, the average grain
//! stress and the average grain strain rate all agree with the macroscopic
//! values.
//!
//! Secant media are not linear in `Σ` (`M̄_sec` scales like `|Σ|^(n−1)`),
//! so for them the boundary condition is solved with the macroscopic
//! tangent `⟨M_tg B⟩⟨B⟩⁻¹` about the grain averages, which makes the
//! stress update a Newton step.
//!
//! When inclusions interact differently with the medium (several phase
//! shapes or per-grain shapes) `⟨B_g⟩ ≠ I`, and every grain is loaded by
//! the shifted far field `Σ̂ = ⟨B⟩⁻¹ (Σ − ⟨b⟩)` of the previous sweep, which
//! is equivalent to the normalized localization `B_g ⟨B⟩⁻¹`.

use crate::basis::relative_mismatch;
use crate::boundary::{BoundaryCondition, MacroState};
use crate::error::{Error, Result};
use crate::eshelby::{eshelby_from_compliance, EshelbyConfig};
use crate::grain_solver::{solve_grain, solve_grain_damped, GrainSolution, GrainSolverConfig, GrainTarget};
use crate::polycrystal::{Medium, Polycrystal};
use crate::shape::Ellipsoid;
use crate::types::{deviatoric, DevMatrix, DevVector, SpinOperator};
use crate::viscoplastic::GrainKinetics;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Linearization of the grain-medium interaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Interaction {
    /// Taylor: every grain deforms at the macroscopic strain rate.
    FullConstraint,
    /// Tangent moduli with back-extrapolated rates, `neff = 1`.
    Affine,
    /// Secant moduli, `neff = 1`.
    Secant,
    /// Secant moduli with `neff` equal to the largest stress exponent.
    Tangent,
    /// Secant moduli with a prescribed `neff`.
    Effective { neff: f64 },
}

impl Default for Interaction {
    fn default() -> Self {
        Self::Affine
    }
}

impl Interaction {
    pub fn is_full_constraint(&self) -> bool {
        matches!(self, Self::FullConstraint)
    }

    /// Tangent (affine) moduli rather than secant moduli.
    pub fn uses_tangent_moduli(&self) -> bool {
        matches!(self, Self::FullConstraint | Self::Affine)
    }

    /// Interaction scaling for an aggregate.
    pub fn neff(&self, poly: &Polycrystal) -> f64 {
        match self {
            Self::Tangent => poly
                .phases
                .iter()
                .map(|p| p.crystal.max_stress_exponent())
                .fold(1.0, f64::max),
            Self::Effective { neff } => *neff,
            _ => 1.0,
        }
    }
}

/// Under-relaxation of the medium update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Relaxation {
    /// Constant factor in (0, 1].
    Fixed(f64),
    /// `max(initial · decay^k, minimum)` at outer iteration `k`.
    Decreasing { initial: f64, decay: f64, minimum: f64 },
}

impl Default for Relaxation {
    fn default() -> Self {
        Self::Fixed(1.0)
    }
}

impl Relaxation {
    /// Relaxation factor at zero-based outer iteration `iteration`.
    pub fn factor(&self, iteration: usize) -> f64 {
        match *self {
            Self::Fixed(alpha) => alpha,
            Self::Decreasing { initial, decay, minimum } => (initial * decay.powi(iteration as i32)).max(minimum),
        }
    }

    fn validate(&self) -> Result<()> {
        let in_range = |a: f64| a > 0.0 && a <= 1.0;
        let ok = match *self {
            Self::Fixed(alpha) => in_range(alpha),
            Self::Decreasing { initial, decay, minimum } => in_range(initial) && in_range(decay) && in_range(minimum),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidConfig("relaxation factors must be in (0, 1]".into()))
        }
    }
}

/// Starting effective medium of an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulusSeed {
    /// Medium of the previous increment, Taylor estimate when there is none.
    PreviousStep,
    /// Always start from the Taylor (upper bound) estimate.
    Taylor,
}

/// Handling of a grain whose Newton iteration does not converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrainFailurePolicy {
    /// Fail the increment with `GrainConvergenceFailure`.
    Abort,
    /// Use the best iterate as is.
    AcceptBestEstimate,
    /// Retry with a damped Newton step, then accept the better iterate.
    RetryThenAccept,
}

/// Handling of an exhausted outer iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OuterFailurePolicy {
    /// Fail the increment with `OuterConvergenceFailure`.
    Abort,
    /// Continue from the last iterate, flagged as degraded.
    AcceptDegraded,
}

/// Outer iteration configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfConsistentConfig {
    pub interaction: Interaction,
    /// Relative change of `M̄` between iterations at convergence.
    pub modulus_tolerance: f64,
    /// Mismatch of `⟨σ_g⟩` against `Σ` (and `⟨ε̇_g⟩` against `Ē`) at convergence.
    pub stress_tolerance: f64,
    pub max_iterations: usize,
    pub relaxation: Relaxation,
    pub seed: ModulusSeed,
    pub grain_failure: GrainFailurePolicy,
    pub outer_failure: OuterFailurePolicy,
    /// Sweep grains on the rayon pool.
    pub parallel: bool,
}

impl Default for SelfConsistentConfig {
    fn default() -> Self {
        Self {
            interaction: Interaction::default(),
            modulus_tolerance: 1e-3,
            stress_tolerance: 1e-3,
            max_iterations: 100,
            relaxation: Relaxation::default(),
            seed: ModulusSeed::PreviousStep,
            grain_failure: GrainFailurePolicy::RetryThenAccept,
            outer_failure: OuterFailurePolicy::Abort,
            parallel: false,
        }
    }
}

impl SelfConsistentConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, tol) in [("modulus", self.modulus_tolerance), ("stress", self.stress_tolerance)] {
            if !(tol > 0.0 && tol < 1.0) {
                return Err(Error::InvalidConfig(format!("{} tolerance must be in (0, 1)", name)));
            }
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("outer max_iterations must be positive".into()));
        }
        if let Interaction::Effective { neff } = self.interaction {
            if !(neff > 0.0) {
                return Err(Error::InvalidConfig("neff must be positive".into()));
            }
        }
        self.relaxation.validate()
    }
}

/// A grain that did not converge in the final sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrainFailure {
    pub phase: usize,
    pub grain: usize,
    pub iterations: usize,
    pub residual: f64,
    /// A damped retry was attempted.
    pub retried: bool,
    /// The retry converged.
    pub recovered: bool,
}

/// Convergence record of one increment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveDiagnostics {
    pub iterations: usize,
    pub modulus_residual: f64,
    pub stress_residual: f64,
    pub strain_rate_residual: f64,
    pub converged: bool,
    /// An approximate result was accepted (outer or grain level).
    pub degraded: bool,
    pub grain_failures: Vec<GrainFailure>,
    /// Non-converged grain solves over all sweeps, including retried ones.
    pub failed_grain_solves: usize,
    pub newton_iterations: usize,
    pub max_newton_iterations: usize,
}

impl SolveDiagnostics {
    /// Largest of the three outer residuals.
    pub fn residual(&self) -> f64 {
        self.modulus_residual.max(self.stress_residual).max(self.strain_rate_residual)
    }
}

/// Converged response of one grain.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainResponse {
    pub solution: GrainSolution,
    /// `Π S⁻¹` of the grain's inclusion (zero under full constraint).
    pub spin_localization: SpinOperator,
}

/// Solution of one increment. Grain responses are indexed like the phases
/// and grains of the solved aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementSolution {
    /// Macroscopic stress and strain rate of the final sweep.
    pub macro_state: MacroState,
    pub medium: Medium,
    pub neff: f64,
    pub grains: Vec<Vec<GrainResponse>>,
    pub diagnostics: SolveDiagnostics,
}

/// Interaction of one inclusion with the current medium.
#[derive(Debug, Clone, Copy)]
struct Inclusion {
    interaction: DevMatrix,
    spin_localization: SpinOperator,
}

/// Per-grain output of a sweep.
struct GrainOutcome {
    response: GrainResponse,
    failure: Option<GrainFailure>,
    failed_solves: usize,
    localization: DevMatrix,
    offset: DevVector,
    compliance: DevMatrix,
    back_extrapolated: DevVector,
}

/// Weighted averages of one sweep.
struct Sweep {
    outcomes: Vec<GrainOutcome>,
    compliance: DevMatrix,
    back_extrapolated: DevVector,
    /// Macroscopic tangent `⟨M_tg B⟩⟨B⟩⁻¹`.
    tangent: DevMatrix,
    /// `⟨B⟩⁻¹`
    localization_inverse: DevMatrix,
    /// `⟨b⟩`
    mean_offset: DevVector,
    mean_stress: DevVector,
    mean_strain_rate: DevVector,
}

/// Deviatoric stress and strain rate applied at infinity to every inclusion.
#[derive(Debug, Clone, Copy)]
struct FarField {
    stress: DevVector,
    strain_rate: DevVector,
}

impl FarField {
    fn of(state: &MacroState) -> Self {
        Self {
            stress: deviatoric(&state.stress),
            strain_rate: deviatoric(&state.strain_rate),
        }
    }

    /// Far field whose inclusion averages reproduce `state`, moved along
    /// the medium line `Ê − Ē = M̄ (Σ̂ − Σ)`.
    fn shifted(state: &MacroState, sweep: &Sweep, compliance: &DevMatrix) -> Self {
        let macro_field = Self::of(state);
        let stress = sweep.localization_inverse * (macro_field.stress - sweep.mean_offset);
        Self {
            stress,
            strain_rate: macro_field.strain_rate + compliance * (stress - macro_field.stress),
        }
    }
}

fn all_equal(mut shapes: impl Iterator<Item = Ellipsoid>) -> bool {
    match shapes.next() {
        Some(first) => shapes.all(|s| s == first),
        None => true,
    }
}

fn invert(m: &DevMatrix, context: &str) -> Result<DevMatrix> {
    m.try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .ok_or_else(|| Error::singular(context.to_string()))
}

/// Self-consistent solver for one deformation increment.
#[derive(Debug, Clone)]
pub struct SelfConsistentSolver {
    pub config: SelfConsistentConfig,
    pub grain: GrainSolverConfig,
    pub eshelby: EshelbyConfig,
    /// Use each grain's own ellipsoid rather than the phase ellipsoid.
    pub per_grain_shapes: bool,
}

impl SelfConsistentSolver {
    pub fn new(config: SelfConsistentConfig, grain: GrainSolverConfig, eshelby: EshelbyConfig) -> Self {
        Self {
            config,
            grain,
            eshelby,
            per_grain_shapes: false,
        }
    }

    pub fn with_per_grain_shapes(mut self, per_grain: bool) -> Self {
        self.per_grain_shapes = per_grain;
        self
    }

    /// Solve the aggregate response to `bc` without modifying `poly`.
    ///
    /// # Errors
    ///
    /// - `NumericalSingularity` if a modulus, Eshelby tensor or the
    ///   boundary-condition system cannot be inverted
    /// - `GrainConvergenceFailure` under [`GrainFailurePolicy::Abort`]
    /// - `OuterConvergenceFailure` under [`OuterFailurePolicy::Abort`]
    pub fn solve(&self, poly: &Polycrystal, bc: &BoundaryCondition) -> Result<IncrementSolution> {
        let kinetics: Vec<Vec<GrainKinetics>> = poly
            .phases
            .iter()
            .map(|phase| {
                phase
                    .grains
                    .iter()
                    .map(|g| GrainKinetics::new(&phase.crystal, &g.orientation, &g.crss))
                    .collect()
            })
            .collect();
        let neff = self.config.interaction.neff(poly);

        let (mut compliance, mut back_extrapolated) = match (self.config.seed, &poly.medium) {
            (ModulusSeed::PreviousStep, Some(medium)) => (medium.compliance, medium.back_extrapolated),
            _ => self.taylor_seed(poly, &kinetics, bc)?,
        };
        let mut macro_state = bc.solve(&compliance, &back_extrapolated)?;

        let mut warm: Vec<Vec<Option<DevVector>>> = poly
            .phases
            .iter()
            .map(|phase| {
                phase
                    .grains
                    .iter()
                    .map(|g| g.has_converged_state().then(|| deviatoric(&g.stress)))
                    .collect()
            })
            .collect();

        let shift_far_field = !self.has_uniform_inclusions(poly);
        let mut previous: Option<Sweep> = None;
        let mut diagnostics = SolveDiagnostics::default();
        for iteration in 1..=self.config.max_iterations {
            let far_field = match &previous {
                Some(last) if shift_far_field => FarField::shifted(&macro_state, last, &compliance),
                _ => FarField::of(&macro_state),
            };
            let sweep = self.sweep(poly, &kinetics, &far_field, &compliance, &back_extrapolated, neff, &warm)?;

            let alpha = self.config.relaxation.factor(iteration - 1);
            let new_compliance = sweep.compliance * alpha + compliance * (1.0 - alpha);
            let new_back = sweep.back_extrapolated * alpha + back_extrapolated * (1.0 - alpha);

            diagnostics.iterations = iteration;
            diagnostics.modulus_residual = relative_mismatch(&sweep.compliance, &compliance);
            diagnostics.stress_residual = relative_mismatch(&sweep.mean_stress, &deviatoric(&macro_state.stress));
            diagnostics.strain_rate_residual =
                relative_mismatch(&sweep.mean_strain_rate, &deviatoric(&macro_state.strain_rate));
            for outcome in &sweep.outcomes {
                let n = outcome.response.solution.iterations;
                diagnostics.newton_iterations += n;
                diagnostics.max_newton_iterations = diagnostics.max_newton_iterations.max(n);
                diagnostics.failed_grain_solves += outcome.failed_solves;
            }
            debug!(
                iteration,
                modulus = diagnostics.modulus_residual,
                stress = diagnostics.stress_residual,
                strain_rate = diagnostics.strain_rate_residual,
                "self-consistent iteration"
            );

            let converged = diagnostics.modulus_residual < self.config.modulus_tolerance
                && diagnostics.stress_residual < self.config.stress_tolerance
                && diagnostics.strain_rate_residual < self.config.stress_tolerance;

            if converged || iteration == self.config.max_iterations {
                diagnostics.converged = converged;
                if !converged {
                    let residual = diagnostics.residual();
                    match self.config.outer_failure {
                        OuterFailurePolicy::Abort => {
                            return Err(Error::OuterConvergenceFailure {
                                step: None,
                                iterations: iteration,
                                residual,
                            })
                        }
                        OuterFailurePolicy::AcceptDegraded => {
                            warn!(iterations = iteration, residual, "accepting non-converged self-consistent state");
                            diagnostics.degraded = true;
                        }
                    }
                }
                let medium = Medium {
                    compliance: new_compliance,
                    back_extrapolated: new_back,
                };
                return Ok(self.finish(poly, sweep, macro_state, medium, neff, diagnostics));
            }

            let mut outcomes = sweep.outcomes.iter();
            for starts in warm.iter_mut() {
                for (start, outcome) in starts.iter_mut().zip(outcomes.by_ref()) {
                    *start = Some(outcome.response.solution.stress);
                }
            }
            compliance = new_compliance;
            back_extrapolated = new_back;
            macro_state = self.macro_update(bc, &sweep, &compliance, &back_extrapolated)?;
            previous = Some(sweep);
        }

        // max_iterations >= 1 always returns from inside the loop.
        Err(Error::InvalidConfig("outer max_iterations must be positive".into()))
    }

    /// Boundary-condition solve for the next sweep.
    fn macro_update(
        &self,
        bc: &BoundaryCondition,
        sweep: &Sweep,
        compliance: &DevMatrix,
        back_extrapolated: &DevVector,
    ) -> Result<MacroState> {
        if self.config.interaction.uses_tangent_moduli() {
            return bc.solve(compliance, back_extrapolated);
        }
        // Ē = M̄_tg (Σ − ⟨σ_g⟩) + ⟨ε̇_g⟩
        let offset = sweep.mean_strain_rate - sweep.tangent * sweep.mean_stress;
        bc.solve(&sweep.tangent, &offset)
    }

    /// Every grain sees the same interaction tensor.
    fn has_uniform_inclusions(&self, poly: &Polycrystal) -> bool {
        if self.config.interaction.is_full_constraint() {
            return true;
        }
        if self.per_grain_shapes {
            all_equal(poly.phases.iter().flat_map(|p| p.grains.iter().map(|g| g.shape)))
        } else {
            all_equal(poly.phases.iter().map(|p| p.shape))
        }
    }

    fn finish(
        &self,
        poly: &Polycrystal,
        sweep: Sweep,
        macro_state: MacroState,
        medium: Medium,
        neff: f64,
        mut diagnostics: SolveDiagnostics,
    ) -> IncrementSolution {
        let mut outcomes = sweep.outcomes.into_iter();
        let mut grains = Vec::with_capacity(poly.phases.len());
        for phase in &poly.phases {
            let mut responses = Vec::with_capacity(phase.grains.len());
            for outcome in outcomes.by_ref().take(phase.grains.len()) {
                if let Some(failure) = outcome.failure {
                    if !failure.recovered {
                        diagnostics.degraded = true;
                    }
                    diagnostics.grain_failures.push(failure);
                }
                responses.push(outcome.response);
            }
            grains.push(responses);
        }
        for failure in diagnostics.grain_failures.iter().filter(|f| !f.recovered) {
            warn!(
                phase = failure.phase,
                grain = failure.grain,
                iterations = failure.iterations,
                residual = failure.residual,
                "accepting non-converged grain"
            );
        }
        IncrementSolution {
            macro_state,
            medium,
            neff,
            grains,
            diagnostics,
        }
    }

    /// Linearized compliance and back-extrapolated rate of a solved grain.
    fn linearization(&self, solution: &GrainSolution) -> (DevMatrix, DevVector) {
        if self.config.interaction.uses_tangent_moduli() {
            (solution.tangent, solution.back_extrapolated())
        } else {
            (solution.secant, DevVector::zeros())
        }
    }

    /// Taylor estimate of the medium: `M̄ = ⟨L_g⟩⁻¹`, `Ē⁰ = M̄ ⟨L_g ε̇0_g⟩`
    /// of full-constraint grains at the strain rate of the equal-activity
    /// upper bound.
    fn taylor_seed(
        &self,
        poly: &Polycrystal,
        kinetics: &[Vec<GrainKinetics>],
        bc: &BoundaryCondition,
    ) -> Result<(DevMatrix, DevVector)> {
        let total: f64 = poly.phases.iter().map(|p| p.total_weight()).sum();

        let mut stiffness = DevMatrix::zeros();
        for (phase, kin) in poly.phases.iter().zip(kinetics) {
            for (grain, k) in phase.grains.iter().zip(kin) {
                stiffness += invert(&k.equal_activity_compliance(), "equal-activity grain compliance")? * grain.weight;
            }
        }
        let bound = invert(&(stiffness / total), "equal-activity upper bound")?;
        let start = bc.solve(&bound, &DevVector::zeros())?;
        let rate = deviatoric(&start.strain_rate);

        let mut stiffness = DevMatrix::zeros();
        let mut offset = DevVector::zeros();
        for (phase, kin) in poly.phases.iter().zip(kinetics) {
            for (grain, k) in phase.grains.iter().zip(kin) {
                let solution = solve_grain(k, &GrainTarget::taylor(rate), &[], &self.grain)?;
                let (m, e0) = self.linearization(&solution);
                let l = invert(&m, "Taylor grain compliance")?;
                stiffness += l * grain.weight;
                offset += l * e0 * grain.weight;
            }
        }
        let compliance = invert(&(stiffness / total), "Taylor medium stiffness")?;
        let back_extrapolated = compliance * offset / total;
        Ok((compliance, back_extrapolated))
    }

    fn inclusion(&self, shape: &Ellipsoid, compliance: &DevMatrix, neff: f64) -> Result<Inclusion> {
        if self.config.interaction.is_full_constraint() {
            return Ok(Inclusion {
                interaction: DevMatrix::zeros(),
                spin_localization: SpinOperator::zeros(),
            });
        }
        let tensors = eshelby_from_compliance(shape, compliance, &self.eshelby)?;
        Ok(Inclusion {
            interaction: tensors.interaction_compliance(compliance, neff)?,
            spin_localization: tensors.spin_localization()?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sweep(
        &self,
        poly: &Polycrystal,
        kinetics: &[Vec<GrainKinetics>],
        far_field: &FarField,
        compliance: &DevMatrix,
        back_extrapolated: &DevVector,
        neff: f64,
        warm: &[Vec<Option<DevVector>>],
    ) -> Result<Sweep> {
        let phase_inclusions: Vec<Option<Inclusion>> = if self.per_grain_shapes {
            vec![None; poly.phases.len()]
        } else {
            poly.phases
                .iter()
                .map(|phase| self.inclusion(&phase.shape, compliance, neff).map(Some))
                .collect::<Result<_>>()?
        };

        let macro_stress = far_field.stress;
        let macro_rate = far_field.strain_rate;
        let tasks: Vec<(usize, usize)> = poly
            .phases
            .iter()
            .enumerate()
            .flat_map(|(p, phase)| (0..phase.grains.len()).map(move |g| (p, g)))
            .collect();

        let solve = |&(p, g): &(usize, usize)| -> Result<GrainOutcome> {
            let inclusion = match phase_inclusions[p] {
                Some(inclusion) => inclusion,
                None => self.inclusion(&poly.phases[p].grains[g].shape, compliance, neff)?,
            };
            let target = GrainTarget {
                macro_stress,
                macro_strain_rate: macro_rate,
                interaction: inclusion.interaction,
            };
            let mut candidates = vec![macro_stress];
            candidates.extend(warm[p][g]);
            let (solution, failure, failed_solves) = self.solve_one(&kinetics[p][g], &target, &candidates, p, g)?;

            let (m, e0) = self.linearization(&solution);
            let a_inv = invert(&(m + inclusion.interaction), "grain localization operator")?;
            let localization = a_inv * (compliance + inclusion.interaction);
            let offset = a_inv * (back_extrapolated - e0);
            Ok(GrainOutcome {
                response: GrainResponse {
                    solution,
                    spin_localization: inclusion.spin_localization,
                },
                failure,
                failed_solves,
                localization,
                offset,
                compliance: m,
                back_extrapolated: e0,
            })
        };

        // Results are collected in grain order and reduced sequentially, so
        // the parallel sweep reproduces the sequential one exactly.
        let outcomes: Vec<GrainOutcome> = if self.config.parallel {
            tasks.par_iter().map(solve).collect::<Result<_>>()?
        } else {
            tasks.iter().map(solve).collect::<Result<_>>()?
        };

        let mut total = 0.0;
        let mut mean_b = DevMatrix::zeros();
        let mut mean_mb = DevMatrix::zeros();
        let mut mean_tb = DevMatrix::zeros();
        let mut mean_offset = DevVector::zeros();
        let mut mean_rate_offset = DevVector::zeros();
        let mut mean_stress = DevVector::zeros();
        let mut mean_strain_rate = DevVector::zeros();
        for (&(p, g), outcome) in tasks.iter().zip(&outcomes) {
            let w = poly.phases[p].grains[g].weight;
            total += w;
            mean_b += outcome.localization * w;
            mean_mb += outcome.compliance * outcome.localization * w;
            mean_tb += outcome.response.solution.tangent * outcome.localization * w;
            mean_offset += outcome.offset * w;
            mean_rate_offset += (outcome.compliance * outcome.offset + outcome.back_extrapolated) * w;
            mean_stress += outcome.response.solution.stress * w;
            mean_strain_rate += outcome.response.solution.strain_rate * w;
        }
        let scale = 1.0 / total;
        let localization_inverse = invert(&(mean_b * scale), "average localization tensor")?;
        let new_compliance = mean_mb * localization_inverse * scale;
        let new_back = mean_rate_offset * scale - new_compliance * mean_offset * scale;
        let tangent = mean_tb * localization_inverse * scale;

        Ok(Sweep {
            outcomes,
            compliance: 0.5 * (new_compliance + new_compliance.transpose()),
            back_extrapolated: new_back,
            tangent: 0.5 * (tangent + tangent.transpose()),
            localization_inverse,
            mean_offset: mean_offset * scale,
            mean_stress: mean_stress * scale,
            mean_strain_rate: mean_strain_rate * scale,
        })
    }

    /// Solve one grain and apply the failure policy.
    fn solve_one(
        &self,
        kinetics: &GrainKinetics,
        target: &GrainTarget,
        candidates: &[DevVector],
        phase: usize,
        grain: usize,
    ) -> Result<(GrainSolution, Option<GrainFailure>, usize)> {
        let solution = solve_grain(kinetics, target, candidates, &self.grain)?;
        if solution.converged {
            return Ok((solution, None, 0));
        }
        match self.config.grain_failure {
            GrainFailurePolicy::Abort => solution.into_result(phase, grain).map(|s| (s, None, 1)),
            GrainFailurePolicy::AcceptBestEstimate => {
                let failure = GrainFailure {
                    phase,
                    grain,
                    iterations: solution.iterations,
                    residual: solution.residual,
                    retried: false,
                    recovered: false,
                };
                Ok((solution, Some(failure), 1))
            }
            GrainFailurePolicy::RetryThenAccept => {
                let retry = solve_grain_damped(kinetics, target, solution.stress, &self.grain)?;
                let recovered = retry.converged;
                let best = if retry.residual <= solution.residual { retry } else { solution };
                let failure = GrainFailure {
                    phase,
                    grain,
                    iterations: best.iterations,
                    residual: best.residual,
                    retried: true,
                    recovered,
                };
                Ok((best, Some(failure), 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crystal::CrystalSystem;
    use crate::hardening::{HardeningLaw, VoceLaw, VoceParams};
    use crate::polycrystal::Phase;
    use crate::texture::random_orientations;
    use crate::types::{von_mises_stress, Tensor2};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn fcc_aggregate(n: usize, seed: u64) -> Polycrystal {
        let fcc = Arc::new(CrystalSystem::fcc(1.0, 0.05).unwrap());
        let phase = Phase::from_orientations(
            "fcc",
            fcc,
            1.0,
            &random_orientations(n, seed),
            HardeningLaw::Voce(VoceLaw::uniform(1, VoceParams::default())),
        )
        .unwrap();
        Polycrystal::single_phase(phase).unwrap()
    }

    fn tension() -> BoundaryCondition {
        BoundaryCondition::full_velocity_gradient(Tensor2::from_diagonal(&Vector3::new(-0.5, -0.5, 1.0)))
    }

    fn solver(config: SelfConsistentConfig) -> SelfConsistentSolver {
        SelfConsistentSolver::new(config, GrainSolverConfig::default(), EshelbyConfig::default())
    }

    #[test]
    fn test_single_grain_reduces_to_taylor() {
        let poly = fcc_aggregate(1, 3);
        let sc = solver(SelfConsistentConfig::default()).solve(&poly, &tension()).unwrap();
        let fc = solver(SelfConsistentConfig {
            interaction: Interaction::FullConstraint,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        assert!(sc.diagnostics.converged && fc.diagnostics.converged);
        assert_relative_eq!(
            von_mises_stress(&sc.macro_state.stress),
            von_mises_stress(&fc.macro_state.stress),
            max_relative = 5e-3
        );
        let grain = &sc.grains[0][0].solution;
        assert!(relative_mismatch(&grain.strain_rate, &deviatoric(&sc.macro_state.strain_rate)) < 1e-3);
    }

    #[test]
    fn test_full_constraint_grains_follow_macro_rate() {
        let poly = fcc_aggregate(6, 5);
        let solution = solver(SelfConsistentConfig {
            interaction: Interaction::FullConstraint,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        let rate = deviatoric(&solution.macro_state.strain_rate);
        for response in &solution.grains[0] {
            assert!(relative_mismatch(&response.solution.strain_rate, &rate) < 1e-3);
            assert_eq!(response.spin_localization, SpinOperator::zeros());
        }
    }

    fn tight_solver(config: SelfConsistentConfig) -> SelfConsistentSolver {
        let grain = GrainSolverConfig {
            tolerance: 1e-9,
            ..GrainSolverConfig::default()
        };
        SelfConsistentSolver::new(config, grain, EshelbyConfig::default())
    }

    #[test]
    fn test_converged_state_is_independent_of_seed() {
        let config = SelfConsistentConfig {
            interaction: Interaction::Tangent,
            modulus_tolerance: 1e-6,
            stress_tolerance: 1e-6,
            max_iterations: 300,
            ..SelfConsistentConfig::default()
        };
        let poly = fcc_aggregate(8, 21);
        let from_taylor = tight_solver(SelfConsistentConfig {
            seed: ModulusSeed::Taylor,
            ..config
        })
        .solve(&poly, &tension())
        .unwrap();

        let mut seeded = poly.clone();
        seeded.medium = Some(Medium {
            compliance: DevMatrix::identity() * 0.3,
            back_extrapolated: DevVector::zeros(),
        });
        let from_isotropic = tight_solver(config).solve(&seeded, &tension()).unwrap();
        assert!(from_taylor.diagnostics.converged && from_isotropic.diagnostics.converged);

        assert_relative_eq!(
            from_taylor.macro_state.stress,
            from_isotropic.macro_state.stress,
            max_relative = 1e-3,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_secant_interactions_converge() {
        let poly = fcc_aggregate(30, 2024);
        let taylor = solver(SelfConsistentConfig {
            interaction: Interaction::FullConstraint,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        let taylor_stress = von_mises_stress(&taylor.macro_state.stress);

        let mut stresses = Vec::new();
        for interaction in [Interaction::Secant, Interaction::Effective { neff: 5.0 }, Interaction::Tangent] {
            let solution = solver(SelfConsistentConfig {
                interaction,
                ..SelfConsistentConfig::default()
            })
            .solve(&poly, &tension())
            .unwrap();
            let d = &solution.diagnostics;
            assert!(d.converged && !d.degraded, "{interaction:?}: {d:?}");
            let stress = von_mises_stress(&solution.macro_state.stress);
            assert!(stress.is_finite() && stress > 0.3 * taylor_stress && stress < taylor_stress * 1.001);
            stresses.push(stress);
        }
        // A softer interaction (larger neff) gives a lower flow stress.
        assert!(stresses[0] > stresses[1] && stresses[1] > stresses[2], "{stresses:?}");
    }

    #[test]
    fn test_single_grain_secant_reduces_to_taylor() {
        let poly = fcc_aggregate(1, 3);
        let fc = solver(SelfConsistentConfig {
            interaction: Interaction::FullConstraint,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        for interaction in [Interaction::Secant, Interaction::Tangent] {
            let sc = solver(SelfConsistentConfig {
                interaction,
                seed: ModulusSeed::Taylor,
                ..SelfConsistentConfig::default()
            })
            .solve(&poly, &tension())
            .unwrap();
            assert!(sc.diagnostics.converged);
            assert_relative_eq!(
                von_mises_stress(&sc.macro_state.stress),
                von_mises_stress(&fc.macro_state.stress),
                max_relative = 5e-3
            );
        }
    }

    #[test]
    fn test_secant_recovers_from_poor_medium() {
        let mut poly = fcc_aggregate(10, 6);
        poly.medium = Some(Medium {
            compliance: DevMatrix::identity() * 5.0,
            back_extrapolated: DevVector::zeros(),
        });
        let solution = solver(SelfConsistentConfig {
            interaction: Interaction::Secant,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        assert!(solution.diagnostics.converged);
        assert!(solution.medium.compliance.trace() > 1e-3);
    }

    #[test]
    fn test_distinct_grain_shapes_match_macro_averages() {
        let mut poly = fcc_aggregate(12, 14);
        let shapes = [
            Ellipsoid::sphere(),
            Ellipsoid::new(Vector3::new(2.0, 1.0, 0.5), Tensor2::identity()).unwrap(),
            Ellipsoid::new(Vector3::new(1.0, 0.8, 1.25), Tensor2::identity()).unwrap(),
        ];
        for (k, grain) in poly.phases[0].grains.iter_mut().enumerate() {
            grain.shape = shapes[k % shapes.len()];
        }
        for interaction in [Interaction::Affine, Interaction::Secant] {
            let solution = solver(SelfConsistentConfig {
                interaction,
                ..SelfConsistentConfig::default()
            })
            .with_per_grain_shapes(true)
            .solve(&poly, &tension())
            .unwrap();
            assert!(solution.diagnostics.converged, "{interaction:?}: {:?}", solution.diagnostics);

            let grains = &poly.phases[0].grains;
            let mean: DevVector = solution.grains[0]
                .iter()
                .zip(grains)
                .map(|(r, g)| r.solution.stress * g.weight)
                .sum();
            let macro_stress = deviatoric(&solution.macro_state.stress);
            assert!(relative_mismatch(&mean, &macro_stress) < 1e-3);
        }
    }

    #[test]
    fn test_modulus_residual_ignores_relaxation() {
        let poly = fcc_aggregate(6, 4);
        let run = |relaxation| {
            solver(SelfConsistentConfig {
                max_iterations: 1,
                relaxation,
                seed: ModulusSeed::Taylor,
                outer_failure: OuterFailurePolicy::AcceptDegraded,
                modulus_tolerance: 1e-12,
                stress_tolerance: 1e-12,
                ..SelfConsistentConfig::default()
            })
            .solve(&poly, &tension())
            .unwrap()
            .diagnostics
            .modulus_residual
        };
        assert_relative_eq!(run(Relaxation::Fixed(1.0)), run(Relaxation::Fixed(0.25)), max_relative = 1e-12);
    }

    #[test]
    fn test_parallel_sweep_matches_sequential() {
        let poly = fcc_aggregate(12, 8);
        let sequential = solver(SelfConsistentConfig::default()).solve(&poly, &tension()).unwrap();
        let parallel = solver(SelfConsistentConfig {
            parallel: true,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &tension())
        .unwrap();
        assert_eq!(sequential.macro_state, parallel.macro_state);
        assert_eq!(sequential.diagnostics, parallel.diagnostics);
    }

    #[test]
    fn test_self_consistent_stress_below_taylor() {
        let poly = fcc_aggregate(16, 2);
        let bc = BoundaryCondition::uniaxial_tension(1.0);
        let taylor = solver(SelfConsistentConfig {
            interaction: Interaction::FullConstraint,
            ..SelfConsistentConfig::default()
        })
        .solve(&poly, &bc)
        .unwrap();
        let sc = solver(SelfConsistentConfig::default()).solve(&poly, &bc).unwrap();
        let ratio = von_mises_stress(&sc.macro_state.stress) / von_mises_stress(&taylor.macro_state.stress);
        assert!(ratio > 0.6 && ratio < 1.0 + 1e-3, "ratio {}", ratio);
    }

    #[test]
    fn test_exhausted_outer_budget() {
        let poly = fcc_aggregate(6, 4);
        let config = SelfConsistentConfig {
            modulus_tolerance: 1e-12,
            stress_tolerance: 1e-12,
            max_iterations: 1,
            seed: ModulusSeed::Taylor,
            ..SelfConsistentConfig::default()
        };
        match solver(config).solve(&poly, &tension()) {
            Err(Error::OuterConvergenceFailure { iterations, step, .. }) => {
                assert_eq!(iterations, 1);
                assert_eq!(step, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        let degraded = solver(SelfConsistentConfig {
            outer_failure: OuterFailurePolicy::AcceptDegraded,
            ..config
        })
        .solve(&poly, &tension())
        .unwrap();
        assert!(!degraded.diagnostics.converged);
        assert!(degraded.diagnostics.degraded);
    }

    #[test]
    fn test_grain_failure_policies() {
        let poly = fcc_aggregate(4, 9);
        let strict = GrainSolverConfig {
            tolerance: 1e-15,
            max_iterations: 1,
            ..GrainSolverConfig::default()
        };
        let config = SelfConsistentConfig {
            max_iterations: 3,
            outer_failure: OuterFailurePolicy::AcceptDegraded,
            ..SelfConsistentConfig::default()
        };

        let abort = SelfConsistentSolver::new(
            SelfConsistentConfig {
                grain_failure: GrainFailurePolicy::Abort,
                ..config
            },
            strict,
            EshelbyConfig::default(),
        );
        assert!(matches!(abort.solve(&poly, &tension()), Err(Error::GrainConvergenceFailure { .. })));

        let accept = SelfConsistentSolver::new(
            SelfConsistentConfig {
                grain_failure: GrainFailurePolicy::AcceptBestEstimate,
                ..config
            },
            strict,
            EshelbyConfig::default(),
        );
        let solution = accept.solve(&poly, &tension()).unwrap();
        assert!(solution.diagnostics.degraded);
        assert!(!solution.diagnostics.grain_failures.is_empty());
        assert!(solution.diagnostics.grain_failures.iter().all(|f| !f.retried));
    }

    #[test]
    fn test_relaxation_schedule() {
        assert_eq!(Relaxation::default().factor(7), 1.0);
        let decreasing = Relaxation::Decreasing {
            initial: 0.8,
            decay: 0.5,
            minimum: 0.3,
        };
        assert_relative_eq!(decreasing.factor(0), 0.8);
        assert_relative_eq!(decreasing.factor(1), 0.4);
        assert_relative_eq!(decreasing.factor(5), 0.3);
        assert!(SelfConsistentConfig {
            relaxation: Relaxation::Fixed(1.5),
            ..SelfConsistentConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_tangent_interaction_uses_stress_exponent() {
        let poly = fcc_aggregate(2, 1);
        assert_relative_eq!(Interaction::Tangent.neff(&poly), 20.0, epsilon = 1e-9);
        assert_relative_eq!(Interaction::Effective { neff: 10.0 }.neff(&poly), 10.0);
        assert_relative_eq!(Interaction::Secant.neff(&poly), 1.0);
    }
}
