//! Single-grain visco-plastic Newton-Raphson solver.
//!
//! Solves the grain stress `σ` in the deviatoric subspace such that the
//! power-law strain rate satisfies the interaction equation
//!
//! ```text
//! ε̇(σ) − Ē = −M̃ (σ − Σ)
//! ```
//!
//! written in compliance form as `R(σ) = ε̇(σ) + M̃(σ − Σ) − Ē = 0` with the
//! analytic Jacobian `J = M_tg(σ) + M̃`. With `M̃ = 0` this reduces to the
//! Taylor (full-constraint) problem `ε̇(σ) = Ē`.
//!
//! Every Newton step is followed by a backtracking line search on `|R|`,
//! which keeps the iteration stable for high stress exponents.

use crate::basis::relative_mismatch;
use crate::error::{Error, Result};
use crate::types::{DevMatrix, DevVector};
use crate::viscoplastic::{GrainKinetics, PowerLawResponse};
use serde::{Deserialize, Serialize};

/// Newton-Raphson configuration for the grain problem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrainSolverConfig {
    /// Relative mismatch between `ε̇ + M̃(σ − Σ)` and `Ē` at convergence.
    pub tolerance: f64,
    /// Maximum Newton iterations.
    pub max_iterations: usize,
    /// Maximum step halvings in the line search.
    pub max_halvings: usize,
    /// Largest relative stress change per iteration in damped retries.
    pub retry_step_limit: f64,
}

impl Default for GrainSolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 100,
            max_halvings: 12,
            retry_step_limit: 0.25,
        }
    }
}

impl GrainSolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0 && self.tolerance < 1.0) {
            return Err(Error::InvalidConfig("grain tolerance must be in (0, 1)".into()));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("grain max_iterations must be positive".into()));
        }
        if !(self.retry_step_limit > 0.0) {
            return Err(Error::InvalidConfig("retry_step_limit must be positive".into()));
        }
        Ok(())
    }
}

/// Macroscopic state and interaction seen by one grain.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainTarget {
    /// Deviatoric macroscopic stress `Σ`.
    pub macro_stress: DevVector,
    /// Deviatoric macroscopic strain rate `Ē`.
    pub macro_strain_rate: DevVector,
    /// Interaction compliance `M̃`.
    pub interaction: DevMatrix,
}

impl GrainTarget {
    /// Full-constraint target: the grain must deform at `Ē`.
    pub fn taylor(macro_strain_rate: DevVector) -> Self {
        Self {
            macro_stress: DevVector::zeros(),
            macro_strain_rate,
            interaction: DevMatrix::zeros(),
        }
    }
}

/// Solved grain state with the power-law linearization at that state.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainSolution {
    pub stress: DevVector,
    pub strain_rate: DevVector,
    pub shear_rates: Vec<f64>,
    pub secant: DevMatrix,
    pub tangent: DevMatrix,
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
}

impl GrainSolution {
    fn from_response(stress: DevVector, response: PowerLawResponse, iterations: usize, residual: f64, converged: bool) -> Self {
        Self {
            stress,
            strain_rate: response.strain_rate,
            shear_rates: response.shear_rates,
            secant: response.secant,
            tangent: response.tangent,
            iterations,
            residual,
            converged,
        }
    }

    /// Turn a non-converged solution into `GrainConvergenceFailure`.
    pub fn into_result(self, phase: usize, grain: usize) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(Error::GrainConvergenceFailure {
                step: None,
                phase,
                grain,
                iterations: self.iterations,
                residual: self.residual,
            })
        }
    }

    /// Back-extrapolated strain rate of the affine linearization,
    /// `ε̇0 = ε̇ − M_tg σ`.
    pub fn back_extrapolated(&self) -> DevVector {
        self.strain_rate - self.tangent * self.stress
    }
}

/// Pseudo-inverse fallback for rank-deficient operators (fewer than five
/// independent systems).
fn solve_linear(a: &DevMatrix, b: &DevVector) -> Result<DevVector> {
    if let Some(x) = a.lu().solve(b) {
        if x.iter().all(|v| v.is_finite()) {
            return Ok(x);
        }
    }
    let eps = 1e-12 * a.norm().max(f64::MIN_POSITIVE);
    let pinv = a
        .pseudo_inverse(eps)
        .map_err(|e| Error::singular(format!("grain Jacobian: {}", e)))?;
    Ok(pinv * b)
}

/// Stress guess from the equal-activity linear compliance, scaled so that
/// the power-law rate magnitude matches `|Ē|`.
pub fn initial_guess(kinetics: &GrainKinetics, macro_strain_rate: &DevVector) -> Result<DevVector> {
    let target_norm = macro_strain_rate.norm();
    if target_norm == 0.0 {
        return Ok(DevVector::zeros());
    }
    let m0 = kinetics.equal_activity_compliance();
    let sigma_hat = solve_linear(&m0, macro_strain_rate)?;
    let rate_norm = kinetics.strain_rate(&sigma_hat).norm();
    if !(rate_norm > 0.0) || !rate_norm.is_finite() {
        return Ok(sigma_hat);
    }
    let lambda = (target_norm / rate_norm).powf(1.0 / kinetics.mean_exponent());
    Ok(sigma_hat * lambda)
}

struct Evaluation {
    response: PowerLawResponse,
    residual: DevVector,
    mismatch: f64,
}

fn evaluate(kinetics: &GrainKinetics, target: &GrainTarget, stress: &DevVector) -> Evaluation {
    let response = kinetics.response(stress);
    let lhs = response.strain_rate + target.interaction * (stress - target.macro_stress);
    let residual = lhs - target.macro_strain_rate;
    let mismatch = relative_mismatch(&lhs, &target.macro_strain_rate);
    Evaluation {
        response,
        residual,
        mismatch,
    }
}

/// Solve the grain problem, starting from the best of `candidates` and the
/// scaled equal-activity guess.
///
/// A non-converged iteration is returned with `converged == false`; only a
/// singular Jacobian is an error.
pub fn solve_grain(
    kinetics: &GrainKinetics,
    target: &GrainTarget,
    candidates: &[DevVector],
    config: &GrainSolverConfig,
) -> Result<GrainSolution> {
    let mut start = initial_guess(kinetics, &target.macro_strain_rate)?;
    let mut best = evaluate(kinetics, target, &start).mismatch;
    for candidate in candidates {
        if !candidate.iter().all(|v| v.is_finite()) {
            continue;
        }
        let mismatch = evaluate(kinetics, target, candidate).mismatch;
        if mismatch < best {
            best = mismatch;
            start = *candidate;
        }
    }
    newton(kinetics, target, start, config, None, config.max_iterations)
}

/// Damped retry: the stress change per iteration is capped at
/// `retry_step_limit · |σ|` and the iteration budget doubled.
pub fn solve_grain_damped(
    kinetics: &GrainKinetics,
    target: &GrainTarget,
    start: DevVector,
    config: &GrainSolverConfig,
) -> Result<GrainSolution> {
    newton(
        kinetics,
        target,
        start,
        config,
        Some(config.retry_step_limit),
        2 * config.max_iterations,
    )
}

/// Full-constraint grain solve: `ε̇(σ) = Ē`.
pub fn solve_taylor(
    kinetics: &GrainKinetics,
    macro_strain_rate: &DevVector,
    candidates: &[DevVector],
    config: &GrainSolverConfig,
) -> Result<GrainSolution> {
    solve_grain(kinetics, &GrainTarget::taylor(*macro_strain_rate), candidates, config)
}

fn newton(
    kinetics: &GrainKinetics,
    target: &GrainTarget,
    start: DevVector,
    config: &GrainSolverConfig,
    step_limit: Option<f64>,
    max_iterations: usize,
) -> Result<GrainSolution> {
    let mut sigma = start;
    let mut current = evaluate(kinetics, target, &sigma);
    let mut iterations = 0;

    while current.mismatch >= config.tolerance && iterations < max_iterations {
        iterations += 1;
        let jacobian = current.response.tangent + target.interaction;
        let mut delta = solve_linear(&jacobian, &(-current.residual))?;

        if let Some(limit) = step_limit {
            let cap = limit * sigma.norm().max(f64::MIN_POSITIVE);
            let size = delta.norm();
            if size > cap {
                delta *= cap / size;
            }
        }

        let merit = current.residual.norm();
        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..=config.max_halvings {
            let trial = sigma + delta * alpha;
            let evaluation = evaluate(kinetics, target, &trial);
            if evaluation.residual.norm() < merit {
                accepted = Some((trial, evaluation));
                break;
            }
            alpha *= 0.5;
        }

        match accepted {
            Some((trial, evaluation)) => {
                sigma = trial;
                current = evaluation;
            }
            // No descent along the Newton direction: stalled.
            None => break,
        }
    }

    let converged = current.mismatch < config.tolerance;
    tracing::trace!(iterations, residual = current.mismatch, converged, "grain newton");
    Ok(GrainSolution::from_response(
        sigma,
        current.response,
        iterations,
        current.mismatch,
        converged,
    ))
}
