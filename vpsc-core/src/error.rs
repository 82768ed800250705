//! Error types for VPSC operations.

use thiserror::Error;

/// Result type alias using the VPSC Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or advancing a polycrystal.
#[derive(Error, Debug)]
pub enum Error {
    /// A modulus or Jacobian could not be inverted on its active subspace.
    ///
    /// Fatal to the current step: no physically meaningful medium exists.
    #[error("numerical singularity{}: {context}", fmt_step(.step))]
    NumericalSingularity {
        step: Option<usize>,
        context: String,
    },

    /// A single grain's Newton-Raphson iteration ran out of iterations.
    #[error(
        "grain {grain} of phase {phase} did not converge{} after {iterations} iterations (residual: {residual:.3e})",
        fmt_step(.step)
    )]
    GrainConvergenceFailure {
        step: Option<usize>,
        phase: usize,
        grain: usize,
        iterations: usize,
        residual: f64,
    },

    /// The self-consistent loop exhausted its iteration budget.
    #[error(
        "self-consistent iteration did not converge{} after {iterations} iterations (residual: {residual:.3e})",
        fmt_step(.step)
    )]
    OuterConvergenceFailure {
        step: Option<usize>,
        iterations: usize,
        residual: f64,
    },

    /// Crystal or deformation-system definition is physically invalid.
    #[error("invalid crystal definition: {0}")]
    InvalidCrystal(String),

    /// Aggregate state violates an invariant.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Boundary condition flags or values are inconsistent.
    #[error("invalid boundary condition: {0}")]
    InvalidBoundaryCondition(String),

    /// I/O errors (checkpoint files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn fmt_step(step: &Option<usize>) -> String {
    match step {
        Some(s) => format!(" at step {}", s),
        None => String::new(),
    }
}

impl Error {
    /// Shorthand for a singularity raised below the step level.
    pub fn singular(context: impl Into<String>) -> Self {
        Error::NumericalSingularity {
            step: None,
            context: context.into(),
        }
    }

    /// Attach the deformation step index to a numerical failure.
    ///
    /// Errors that already carry a step, and non-numerical errors, are
    /// returned unchanged.
    pub fn at_step(self, index: usize) -> Self {
        match self {
            Error::NumericalSingularity { step: None, context } => Error::NumericalSingularity {
                step: Some(index),
                context,
            },
            Error::GrainConvergenceFailure {
                step: None,
                phase,
                grain,
                iterations,
                residual,
            } => Error::GrainConvergenceFailure {
                step: Some(index),
                phase,
                grain,
                iterations,
                residual,
            },
            Error::OuterConvergenceFailure {
                step: None,
                iterations,
                residual,
            } => Error::OuterConvergenceFailure {
                step: Some(index),
                iterations,
                residual,
            },
            other => other,
        }
    }

    /// True for the recoverable per-grain failure.
    pub fn is_grain_failure(&self) -> bool {
        matches!(self, Error::GrainConvergenceFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_step_fills_missing_index() {
        let err = Error::singular("medium compliance").at_step(7);
        match err {
            Error::NumericalSingularity { step, .. } => assert_eq!(step, Some(7)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_at_step_keeps_existing_index() {
        let err = Error::OuterConvergenceFailure {
            step: Some(2),
            iterations: 100,
            residual: 0.1,
        }
        .at_step(9);
        match err {
            Error::OuterConvergenceFailure { step, .. } => assert_eq!(step, Some(2)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_display_mentions_grain_and_step() {
        let err = Error::GrainConvergenceFailure {
            step: Some(3),
            phase: 0,
            grain: 41,
            iterations: 100,
            residual: 2.5e-3,
        };
        let text = err.to_string();
        assert!(text.contains("grain 41"));
        assert!(text.contains("at step 3"));
        assert!(err.is_grain_failure());
    }
}
