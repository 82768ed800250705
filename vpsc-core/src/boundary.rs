//! Mixed macroscopic boundary conditions.
//!
//! Each of the six symmetric components (Voigt order 11, 22, 33, 23, 13, 12)
//! is controlled either by its strain rate or by its stress. Given the
//! current linearized macroscopic response `Ē = M̄ Σ' + Ē⁰`, the unknown
//! components are found from one 6×6 linear solve in the unknowns
//! `(Σ'_b, p)`: five deviatoric b-basis stress components and the pressure.
//! The spin (antisymmetric part of the velocity gradient) is always imposed.

use crate::basis::{tensor_to_b, B, VOIGT_PAIRS};
use crate::error::{Error, Result};
use crate::rotation::axial;
use crate::types::{deviatoric, with_hydrostatic, Axial, BVector, DevMatrix, DevVector, Tensor2};
use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

/// Which quantity is prescribed for one symmetric component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    StrainRate,
    Stress,
}

/// Macroscopic boundary condition for one loading step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryCondition {
    /// Imposed velocity gradient. Its symmetric part is used for
    /// strain-rate-controlled components, its antisymmetric part is the
    /// imposed spin.
    pub velocity_gradient: Tensor2,
    /// Imposed Cauchy stress for stress-controlled components.
    pub stress: Tensor2,
    /// Control flags in Voigt order.
    pub control: [Control; 6],
}

/// Solved macroscopic stress and strain rate in the b-basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroState {
    pub stress: BVector,
    /// Deviatoric strain rate (zero hydrostatic component).
    pub strain_rate: BVector,
}

impl BoundaryCondition {
    pub fn new(velocity_gradient: Tensor2, stress: Tensor2, control: [Control; 6]) -> Result<Self> {
        let bc = Self {
            velocity_gradient,
            stress,
            control,
        };
        bc.validate()?;
        Ok(bc)
    }

    /// Every strain-rate component imposed.
    pub fn full_velocity_gradient(velocity_gradient: Tensor2) -> Self {
        Self {
            velocity_gradient,
            stress: Tensor2::zeros(),
            control: [Control::StrainRate; 6],
        }
    }

    /// Tension along 3 at `rate`, lateral stresses free (zero).
    pub fn uniaxial_tension(rate: f64) -> Self {
        Self {
            velocity_gradient: Tensor2::from_diagonal(&Axial::new(-0.5 * rate, -0.5 * rate, rate)),
            stress: Tensor2::zeros(),
            control: [
                Control::Stress,
                Control::Stress,
                Control::StrainRate,
                Control::StrainRate,
                Control::StrainRate,
                Control::StrainRate,
            ],
        }
    }

    /// Compression along 3 at `rate` (positive).
    pub fn uniaxial_compression(rate: f64) -> Self {
        Self::uniaxial_tension(-rate)
    }

    /// Compression along 3, constrained along 2, free along 1.
    pub fn plane_strain_compression(rate: f64) -> Self {
        Self {
            velocity_gradient: Tensor2::from_diagonal(&Axial::new(rate, 0.0, -rate)),
            stress: Tensor2::zeros(),
            control: [
                Control::Stress,
                Control::StrainRate,
                Control::StrainRate,
                Control::StrainRate,
                Control::StrainRate,
                Control::StrainRate,
            ],
        }
    }

    /// Simple shear `L_12 = rate`.
    pub fn simple_shear(rate: f64) -> Self {
        let mut l = Tensor2::zeros();
        l[(0, 1)] = rate;
        Self::full_velocity_gradient(l)
    }

    pub fn validate(&self) -> Result<()> {
        if self.velocity_gradient.iter().any(|v| !v.is_finite()) || self.stress.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidBoundaryCondition("non-finite component".into()));
        }
        let controlled_rate = self
            .control
            .iter()
            .filter(|&&c| c == Control::StrainRate)
            .count();
        if controlled_rate == 0 && self.stress.norm() == 0.0 {
            return Err(Error::InvalidBoundaryCondition(
                "all components stress-controlled with zero stress".into(),
            ));
        }
        Ok(())
    }

    /// Symmetric part of the imposed velocity gradient.
    pub fn imposed_strain_rate(&self) -> Tensor2 {
        0.5 * (self.velocity_gradient + self.velocity_gradient.transpose())
    }

    /// Imposed spin as an axial vector.
    pub fn spin(&self) -> Axial {
        axial(&self.velocity_gradient)
    }

    /// True if at least one diagonal stress component is prescribed, which
    /// fixes the pressure.
    fn pressure_is_prescribed(&self) -> bool {
        self.control[..3].iter().any(|&c| c == Control::Stress)
    }

    /// Solve the mixed problem for the linear response `Ē = M̄ Σ' + Ē⁰`.
    ///
    /// Without a prescribed diagonal stress the imposed rate is made
    /// traceless and the pressure is zero.
    pub fn solve(&self, compliance: &DevMatrix, back_extrapolated: &DevVector) -> Result<MacroState> {
        let mut rate = self.imposed_strain_rate();
        let pressure_known = self.pressure_is_prescribed();
        if !pressure_known {
            rate -= Tensor2::identity() * (rate.trace() / 3.0);
        }

        let mut a = Matrix6::zeros();
        let mut rhs = Vector6::zeros();
        let mut last_rate_diagonal = None;

        for (k, &(i, j)) in VOIGT_PAIRS.iter().enumerate() {
            match self.control[k] {
                Control::StrainRate => {
                    // Σ_n B_n[ij] (M̄ s + Ē⁰)_n = D_ij
                    let mut offset = 0.0;
                    for n in 0..5 {
                        let b = B[n][(i, j)];
                        if b == 0.0 {
                            continue;
                        }
                        for m in 0..5 {
                            a[(k, m)] += b * compliance[(n, m)];
                        }
                        offset += b * back_extrapolated[n];
                    }
                    rhs[k] = rate[(i, j)] - offset;
                    if i == j {
                        last_rate_diagonal = Some(k);
                    }
                }
                Control::Stress => {
                    // Σ_n B_n[ij] s_n + p δ_ij = σ_ij
                    for n in 0..5 {
                        a[(k, n)] = B[n][(i, j)];
                    }
                    if i == j {
                        a[(k, 5)] = 1.0;
                    }
                    rhs[k] = 0.5 * (self.stress[(i, j)] + self.stress[(j, i)]);
                }
            }
        }

        if !pressure_known {
            // The three diagonal rate equations are dependent (zero trace);
            // one of them is traded for p = 0.
            let k = last_rate_diagonal.ok_or_else(|| {
                Error::InvalidBoundaryCondition("no diagonal component is controlled".into())
            })?;
            a.row_mut(k).fill(0.0);
            a[(k, 5)] = 1.0;
            rhs[k] = 0.0;
        }

        let x = a
            .lu()
            .solve(&rhs)
            .filter(|x| x.iter().all(|v| v.is_finite()))
            .ok_or_else(|| Error::singular("mixed boundary-condition system"))?;

        let s = DevVector::new(x[0], x[1], x[2], x[3], x[4]);
        let pressure = x[5];
        let e = compliance * s + back_extrapolated;
        Ok(MacroState {
            stress: with_hydrostatic(&s, 3.0_f64.sqrt() * pressure),
            strain_rate: with_hydrostatic(&e, 0.0),
        })
    }

    /// Deviatoric imposed strain rate in the b-basis.
    pub fn imposed_deviatoric(&self) -> DevVector {
        deviatoric(&tensor_to_b(&self.imposed_strain_rate()))
    }
}
