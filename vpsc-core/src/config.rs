//! Run configuration.

use crate::error::{Error, Result};
use crate::eshelby::EshelbyConfig;
use crate::grain_solver::GrainSolverConfig;
use crate::hardening::Conditions;
use crate::self_consistent::SelfConsistentConfig;
use crate::shape::ShapeConfig;
use crate::twinning::TwinningConfig;
use serde::{Deserialize, Serialize};

/// Solver-level configuration of a simulation.
///
/// Every field has a default, so a JSON document only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpscConfig {
    pub grain: GrainSolverConfig,
    pub eshelby: EshelbyConfig,
    pub self_consistent: SelfConsistentConfig,
    pub shape: ShapeConfig,
    pub twinning: TwinningConfig,
    /// Smallest CRSS a hardening law may produce.
    pub crss_floor: f64,
    /// Absolute temperature (K) for temperature dependent laws.
    pub temperature: f64,
}

impl Default for VpscConfig {
    fn default() -> Self {
        Self {
            grain: GrainSolverConfig::default(),
            eshelby: EshelbyConfig::default(),
            self_consistent: SelfConsistentConfig::default(),
            shape: ShapeConfig::default(),
            twinning: TwinningConfig::default(),
            crss_floor: 1e-6,
            temperature: Conditions::default().temperature,
        }
    }
}

impl VpscConfig {
    pub fn validate(&self) -> Result<()> {
        self.grain.validate()?;
        self.eshelby.validate()?;
        self.self_consistent.validate()?;
        self.shape.validate()?;
        self.twinning.validate()?;
        if !(self.crss_floor > 0.0) {
            return Err(Error::InvalidConfig("CRSS floor must be positive".into()));
        }
        if !(self.temperature > 0.0) {
            return Err(Error::InvalidConfig("temperature must be positive".into()));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
