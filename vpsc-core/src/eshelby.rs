//! Eshelby tensors of an ellipsoidal grain in an incompressible viscous medium.
//!
//! For an ellipsoid with semi-axes `a_i` embedded in a homogeneous medium
//! with deviatoric viscous stiffness `L`, the strain-rate perturbation in
//! the inclusion is `ε̃ = S : ε*` and its spin perturbation is `ω̃ = Π : ε*`
//! with
//!
//! ```text
//! S_ijmn = sym_ij( T_ijpq ) L_pqmn      Π_ijmn = asym_ij( T_ijpq ) L_pqmn
//! T_ijpq = 1/(4π) ∫_{|ζ|=1} G_ip(ξ) ξ_j ξ_q dS(ζ),   ξ_k = ζ_k / a_k
//! ```
//!
//! where `G` is the upper-left 3×3 block of the inverse of the augmented
//! acoustic matrix `[[K, ξ], [ξᵀ, 0]]`, `K_ik = L_ijkl ξ_j ξ_l`. The extra
//! row enforces incompressibility. The surface integral is evaluated with
//! composite Gauss-Legendre rules in `(ζ_polar, ω)`; panels are graded
//! toward the bands where `ξ` turns sharply for elongated or flattened
//! shapes, so extreme aspect ratios stay accurate without diverging.
//!
//! # Submodules
//!
//! - [`quadrature`] - Gauss-Legendre rules for the surface integral

pub mod quadrature;

use crate::basis::{b_to_tensor4, embed_deviatoric, B};
use crate::error::{Error, Result};
use crate::rotation::axial;
use crate::shape::Ellipsoid;
use crate::types::{DevMatrix, SpinOperator, Tensor2, Tensor4, tensor4_zeros};
use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

use quadrature::{breakpoints, composite};

/// Eshelby quadrature configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EshelbyConfig {
    /// Gauss points per panel in each integration direction.
    pub quadrature_points: usize,
    /// Largest axis ratio used in the integral; longer axes are clamped.
    pub max_aspect_ratio: f64,
    /// Axis ratio above which graded panels are inserted.
    pub refinement_ratio: f64,
}

impl Default for EshelbyConfig {
    fn default() -> Self {
        Self {
            quadrature_points: 16,
            max_aspect_ratio: 1.0e3,
            refinement_ratio: 5.0,
        }
    }
}

impl EshelbyConfig {
    /// Check that the quadrature parameters are usable.
    pub fn validate(&self) -> Result<()> {
        if self.quadrature_points < 2 {
            return Err(Error::InvalidConfig(
                "Eshelby quadrature needs at least 2 points per panel".into(),
            ));
        }
        if !(self.max_aspect_ratio >= 1.0) || !(self.refinement_ratio >= 1.0) {
            return Err(Error::InvalidConfig(
                "Eshelby aspect-ratio thresholds must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Eshelby operators of one inclusion, all deviatoric and in sample axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EshelbyTensors {
    /// Symmetric Eshelby tensor `S` (strain-rate perturbation per eigen strain rate).
    pub eshelby: DevMatrix,
    /// Rotation Eshelby tensor `Π` (spin perturbation per eigen strain rate).
    pub rotation: SpinOperator,
    /// Hill polarization tensor `P = S M`, symmetric.
    pub polarization: DevMatrix,
}

impl EshelbyTensors {
    /// `S⁻¹`.
    pub fn inverse(&self) -> Result<DevMatrix> {
        self.eshelby
            .try_inverse()
            .ok_or_else(|| Error::singular("Eshelby tensor is not invertible"))
    }

    /// Complementary inverse `(I − S)⁻¹`.
    pub fn complementary_inverse(&self) -> Result<DevMatrix> {
        (DevMatrix::identity() - self.eshelby)
            .try_inverse()
            .ok_or_else(|| Error::singular("I - S is not invertible"))
    }

    /// Interaction compliance `M̃ = neff (I − S)⁻¹ S M̄`.
    pub fn interaction_compliance(&self, medium_compliance: &DevMatrix, neff: f64) -> Result<DevMatrix> {
        Ok(neff * self.complementary_inverse()? * self.eshelby * medium_compliance)
    }

    /// Spin perturbation operator `Π S⁻¹` acting on `ε̇_g − Ē`.
    pub fn spin_localization(&self) -> Result<SpinOperator> {
        Ok(self.rotation * self.inverse()?)
    }
}

/// Eshelby tensors for a medium given by its deviatoric compliance `M̄`.
///
/// Fails with `NumericalSingularity` if `M̄` is not invertible on the
/// deviatoric subspace.
pub fn eshelby_from_compliance(
    ellipsoid: &Ellipsoid,
    medium_compliance: &DevMatrix,
    config: &EshelbyConfig,
) -> Result<EshelbyTensors> {
    let stiffness = medium_compliance
        .try_inverse()
        .ok_or_else(|| Error::singular("effective medium compliance is not invertible"))?;
    eshelby_tensors(ellipsoid, &stiffness, config)
}

/// Eshelby tensors for a medium given by its deviatoric stiffness `L̄`.
pub fn eshelby_tensors(
    ellipsoid: &Ellipsoid,
    medium_stiffness: &DevMatrix,
    config: &EshelbyConfig,
) -> Result<EshelbyTensors> {
    let scale = medium_stiffness.norm();
    if !(scale > 0.0) || !scale.is_finite() {
        return Err(Error::singular("effective medium stiffness is zero or not finite"));
    }
    let normalized = medium_stiffness / scale;
    let l4 = b_to_tensor4(&embed_deviatoric(&normalized));

    let axes = clamp_axes(&ellipsoid.axes, config.max_aspect_ratio)?;
    let frame = IntegrationFrame::new(&axes);
    let (t_rule, w_rule) = frame.rules(&axes, config);

    // Ellipsoid principal frame -> sample frame.
    let to_sample = ellipsoid.orientation.transpose();

    let mut t4 = tensor4_zeros();
    for &(t, wt) in &t_rule {
        let s = (1.0 - t * t).max(0.0).sqrt();
        for &(omega, ww) in &w_rule {
            let (sin_w, cos_w) = omega.sin_cos();
            let mut zeta = Vector3::zeros();
            zeta[frame.polar] = t;
            zeta[frame.first] = s * cos_w;
            zeta[frame.second] = s * sin_w;

            let xi_principal = zeta.component_div(&axes);
            let xi = (to_sample * xi_principal).normalize();
            let green = incompressible_green(&l4, &xi)?;

            // Upper hemisphere only: the integrand is even in ξ.
            let weight = 2.0 * wt * ww;
            accumulate(&mut t4, &green, &xi, weight);
        }
    }

    let inv_area = 1.0 / (4.0 * PI * scale);
    let mut polarization = DevMatrix::zeros();
    let mut rotation_pre = SpinOperator::zeros();
    for m in 0..5 {
        let x = contract_right(&t4, &B[m]) * inv_area;
        for n in 0..5 {
            polarization[(n, m)] = B[n].component_mul(&x).sum();
        }
        rotation_pre.set_column(m, &axial(&x));
    }

    let eshelby = polarization * medium_stiffness;
    let rotation = rotation_pre * medium_stiffness;
    Ok(EshelbyTensors {
        eshelby,
        rotation,
        polarization: 0.5 * (polarization + polarization.transpose()),
    })
}

/// Choice of polar and equatorial axes for the surface parametrization.
struct IntegrationFrame {
    polar: usize,
    /// Larger equatorial axis.
    first: usize,
    /// Smaller equatorial axis.
    second: usize,
}

impl IntegrationFrame {
    /// The polar axis is the most isolated one: the longest for prolate-like
    /// shapes, the shortest for oblate-like shapes.
    fn new(axes: &Vector3<f64>) -> Self {
        let mut order = [0usize, 1, 2];
        order.sort_by(|&i, &j| axes[j].total_cmp(&axes[i]));
        let (max, mid, min) = (order[0], order[1], order[2]);
        if axes[max] / axes[mid] >= axes[mid] / axes[min] {
            Self { polar: max, first: mid, second: min }
        } else {
            Self { polar: min, first: max, second: mid }
        }
    }

    fn rules(&self, axes: &Vector3<f64>, config: &EshelbyConfig) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let n = config.quadrature_points;
        let a_p = axes[self.polar];
        let a_eq = (axes[self.first] * axes[self.second]).sqrt();
        let polar_ratio = (a_p / a_eq).max(a_eq / a_p);

        let t_breaks = if polar_ratio > config.refinement_ratio {
            let t_star = a_p / (a_p * a_p + a_eq * a_eq).sqrt();
            let g = 1.0 - t_star;
            let mut candidates = graded(t_star, 1.0);
            candidates.extend(graded(g, 1.0).into_iter().map(|x| 1.0 - x));
            breakpoints(0.0, 1.0, &candidates)
        } else {
            vec![0.0, 1.0]
        };

        let equatorial_ratio = axes[self.first] / axes[self.second];
        let (w_breaks, w_points) = if equatorial_ratio > config.refinement_ratio {
            let offsets = graded(1.0 / equatorial_ratio, 0.5 * PI);
            let mut candidates = Vec::with_capacity(6 * offsets.len());
            for center in [0.0, PI, TAU] {
                for &offset in &offsets {
                    candidates.push(center - offset);
                    candidates.push(center + offset);
                }
            }
            (breakpoints(0.0, TAU, &candidates), n)
        } else {
            (vec![0.0, TAU], 2 * n)
        };

        (composite(&t_breaks, n), composite(&w_breaks, w_points))
    }
}

/// Geometric panel ladder `scale · 4^k`, `k ≥ −1`, up to `limit`.
fn graded(scale: f64, limit: f64) -> Vec<f64> {
    const RATIO: f64 = 4.0;
    let mut points = Vec::new();
    if !(scale > 0.0) || !scale.is_finite() {
        return points;
    }
    let mut x = scale / RATIO;
    while x < limit {
        points.push(x);
        x *= RATIO;
    }
    points
}

/// Clamp axis ratios to `max_ratio` relative to the shortest axis.
fn clamp_axes(axes: &Vector3<f64>, max_ratio: f64) -> Result<Vector3<f64>> {
    if axes.iter().any(|&a| !(a > 0.0) || !a.is_finite()) {
        return Err(Error::InvalidState(format!(
            "ellipsoid semi-axes must be positive and finite, got {:?}",
            axes.as_slice()
        )));
    }
    let min = axes.min();
    Ok(axes.map(|a| a.min(min * max_ratio)))
}

/// Projected Green's function `G(ξ)` of the incompressible medium.
fn incompressible_green(l4: &Tensor4, xi: &Vector3<f64>) -> Result<Tensor2> {
    let mut a = Matrix4::zeros();
    for i in 0..3 {
        for k in 0..3 {
            let mut sum = 0.0;
            for j in 0..3 {
                for l in 0..3 {
                    sum += l4[i][j][k][l] * xi[j] * xi[l];
                }
            }
            a[(i, k)] = sum;
        }
        a[(i, 3)] = xi[i];
        a[(3, i)] = xi[i];
    }
    let inv = a
        .try_inverse()
        .ok_or_else(|| Error::singular("acoustic matrix of the medium is singular"))?;
    Ok(inv.fixed_view::<3, 3>(0, 0).into_owned())
}

/// `T_ijpq += w G_ip ξ_j ξ_q`.
fn accumulate(t4: &mut Tensor4, green: &Tensor2, xi: &Vector3<f64>, weight: f64) {
    for i in 0..3 {
        for p in 0..3 {
            let gip = weight * green[(i, p)];
            for j in 0..3 {
                let gj = gip * xi[j];
                for q in 0..3 {
                    t4[i][j][p][q] += gj * xi[q];
                }
            }
        }
    }
}

/// `X_ij = T_ijpq Y_pq`.
fn contract_right(t4: &Tensor4, y: &Tensor2) -> Tensor2 {
    Tensor2::from_fn(|i, j| {
        let mut sum = 0.0;
        for p in 0..3 {
            for q in 0..3 {
                sum += t4[i][j][p][q] * y[(p, q)];
            }
        }
        sum
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::rotation_from_euler;
    use approx::assert_relative_eq;
    use nalgebra::Vector5;

    fn isotropic(mu: f64) -> DevMatrix {
        DevMatrix::identity() * (2.0 * mu)
    }

    fn anisotropic_stiffness() -> DevMatrix {
        let d = DevMatrix::from_diagonal(&Vector5::new(1.0, 2.5, 0.7, 1.6, 3.0));
        let q = rotation_from_euler(0.4, 0.9, 1.3);
        let rot = crate::basis::basis_rotation(&q);
        let r5 = rot.fixed_view::<5, 5>(0, 0).into_owned();
        r5 * d * r5.transpose()
    }

    #[test]
    fn test_sphere_in_isotropic_medium_matches_closed_form() {
        let sphere = Ellipsoid::sphere();
        let tensors = eshelby_tensors(&sphere, &isotropic(3.0), &EshelbyConfig::default()).unwrap();
        assert_relative_eq!(tensors.eshelby, DevMatrix::identity() * 0.4, epsilon = 1e-8);
        assert_relative_eq!(tensors.rotation, SpinOperator::zeros(), epsilon = 1e-8);
    }

    #[test]
    fn test_sphere_result_is_independent_of_orientation() {
        let mut sphere = Ellipsoid::sphere();
        sphere.orientation = rotation_from_euler(1.0, 2.0, 0.5);
        let tensors = eshelby_tensors(&sphere, &isotropic(1.0), &EshelbyConfig::default()).unwrap();
        assert_relative_eq!(tensors.eshelby, DevMatrix::identity() * 0.4, epsilon = 1e-8);
    }

    #[test]
    fn test_polarization_is_symmetric_for_anisotropic_medium() {
        let ell = Ellipsoid::new(Vector3::new(3.0, 1.5, 1.0), rotation_from_euler(0.2, 0.5, 0.1)).unwrap();
        let l = anisotropic_stiffness();
        let tensors = eshelby_tensors(&ell, &l, &EshelbyConfig::default()).unwrap();
        let p = tensors.eshelby * l.try_inverse().unwrap();
        assert_relative_eq!(p, p.transpose(), epsilon = 1e-8);
    }

    #[test]
    fn test_eshelby_invariant_under_stiffness_scaling() {
        let ell = Ellipsoid::new(Vector3::new(2.0, 1.0, 0.5), Tensor2::identity()).unwrap();
        let l = anisotropic_stiffness();
        let cfg = EshelbyConfig::default();
        let a = eshelby_tensors(&ell, &l, &cfg).unwrap();
        let b = eshelby_tensors(&ell, &(l * 1e4), &cfg).unwrap();
        assert_relative_eq!(a.eshelby, b.eshelby, epsilon = 1e-10);
        assert_relative_eq!(a.rotation, b.rotation, epsilon = 1e-10);
    }

    #[test]
    fn test_needle_limit() {
        // Long axis 3: cylinder limit of the incompressible isotropic case.
        let ell = Ellipsoid::new(Vector3::new(1.0, 1.0, 1000.0), Tensor2::identity()).unwrap();
        let s = eshelby_tensors(&ell, &isotropic(1.0), &EshelbyConfig::default())
            .unwrap()
            .eshelby;
        let expected = [0.5, 0.0, 0.5, 0.5, 0.5];
        for n in 0..5 {
            assert_relative_eq!(s[(n, n)], expected[n], epsilon = 1e-2);
        }
    }

    #[test]
    fn test_disc_limit() {
        // Short axis 3: penny limit, only transverse shears are free.
        let ell = Ellipsoid::new(Vector3::new(1.0, 1.0, 1e-3), Tensor2::identity()).unwrap();
        let s = eshelby_tensors(&ell, &isotropic(1.0), &EshelbyConfig::default())
            .unwrap()
            .eshelby;
        let expected = [0.0, 0.0, 1.0, 1.0, 0.0];
        for n in 0..5 {
            assert_relative_eq!(s[(n, n)], expected[n], epsilon = 1e-2);
        }
    }

    #[test]
    fn test_extreme_shapes_converged_in_quadrature_order() {
        let l = anisotropic_stiffness();
        for axes in [Vector3::new(1.0, 1.0, 1000.0), Vector3::new(1000.0, 1.0, 1.0), Vector3::new(1.0, 1e-3, 1.0)] {
            let ell = Ellipsoid::new(axes, rotation_from_euler(0.3, 0.2, 0.1)).unwrap();
            let coarse = eshelby_tensors(&ell, &l, &EshelbyConfig::default()).unwrap();
            let fine = eshelby_tensors(
                &ell,
                &l,
                &EshelbyConfig {
                    quadrature_points: 32,
                    ..EshelbyConfig::default()
                },
            )
            .unwrap();
            let err = crate::basis::relative_mismatch(&coarse.eshelby, &fine.eshelby);
            assert!(err < 1e-6, "axes {:?}: mismatch {}", axes.as_slice(), err);
        }
    }

    #[test]
    fn test_singular_medium_is_reported() {
        let sphere = Ellipsoid::sphere();
        let result = eshelby_from_compliance(&sphere, &DevMatrix::zeros(), &EshelbyConfig::default());
        assert!(matches!(result, Err(Error::NumericalSingularity { .. })));
    }

    #[test]
    fn test_interaction_compliance_for_sphere() {
        let sphere = Ellipsoid::sphere();
        let m = DevMatrix::identity() * 0.5;
        let tensors = eshelby_from_compliance(&sphere, &m, &EshelbyConfig::default()).unwrap();
        let m_tilde = tensors.interaction_compliance(&m, 1.0).unwrap();
        // (I - S)^-1 S = (0.4 / 0.6) I
        assert_relative_eq!(m_tilde, m * (2.0 / 3.0), epsilon = 1e-8);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = EshelbyConfig {
            quadrature_points: 1,
            ..EshelbyConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(EshelbyConfig::default().validate().is_ok());
    }
}
