//! Orientation matrices, Euler angles and spin integration.
//!
//! Grain orientations are stored as the Bunge matrix `g` that maps
//! sample-frame components to crystal-frame components: `v_c = g v_s`.
//! A crystal-frame tensor is brought to the sample frame with
//! `T_s = gᵀ T_c g`.

use crate::error::{Error, Result};
use crate::types::{Axial, Tensor2};
use std::f64::consts::TAU;

/// Bunge (Z-X-Z) orientation matrix from Euler angles in radians.
pub fn rotation_from_euler(phi1: f64, big_phi: f64, phi2: f64) -> Tensor2 {
    let (s1, c1) = phi1.sin_cos();
    let (s, c) = big_phi.sin_cos();
    let (s2, c2) = phi2.sin_cos();
    Tensor2::new(
        c1 * c2 - s1 * s2 * c,
        s1 * c2 + c1 * s2 * c,
        s2 * s,
        -c1 * s2 - s1 * c2 * c,
        -s1 * s2 + c1 * c2 * c,
        c2 * s,
        s1 * s,
        -c1 * s,
        c,
    )
}

/// Bunge Euler angles `(φ1, Φ, φ2)` in radians from an orientation matrix.
///
/// For `Φ ≈ 0` or `Φ ≈ π` only `φ1 ± φ2` is defined; `φ2` is set to zero.
/// Angles are wrapped into `[0, 2π)`.
pub fn euler_from_rotation(g: &Tensor2) -> (f64, f64, f64) {
    let cos_phi = g[(2, 2)].clamp(-1.0, 1.0);
    let big_phi = cos_phi.acos();
    let sin_phi = (1.0 - cos_phi * cos_phi).max(0.0).sqrt();

    let (phi1, phi2) = if sin_phi > 1e-10 {
        (
            g[(2, 0)].atan2(-g[(2, 1)]),
            g[(0, 2)].atan2(g[(1, 2)]),
        )
    } else {
        (g[(0, 1)].atan2(g[(0, 0)]), 0.0)
    };

    (phi1.rem_euclid(TAU), big_phi, phi2.rem_euclid(TAU))
}

/// Antisymmetric tensor `W` with `W v = w × v`.
#[rustfmt::skip]
pub fn skew(w: &Axial) -> Tensor2 {
    Tensor2::new(
        0.0, -w[2], w[1],
        w[2], 0.0, -w[0],
        -w[1], w[0], 0.0,
    )
}

/// Axial vector of the antisymmetric part of `t`.
pub fn axial(t: &Tensor2) -> Axial {
    Axial::new(
        0.5 * (t[(2, 1)] - t[(1, 2)]),
        0.5 * (t[(0, 2)] - t[(2, 0)]),
        0.5 * (t[(1, 0)] - t[(0, 1)]),
    )
}

/// Rotation `exp(W)` of an antisymmetric increment (Rodrigues formula).
pub fn exp_spin(w: &Axial) -> Tensor2 {
    let theta = w.norm();
    let k = skew(w);
    if theta < 1e-12 {
        return Tensor2::identity() + k + 0.5 * k * k;
    }
    Tensor2::identity() + k * (theta.sin() / theta) + k * k * ((1.0 - theta.cos()) / (theta * theta))
}

/// Nearest proper rotation (polar factor) of a near-orthogonal matrix.
///
/// Counters drift accumulated by repeated incremental rotations.
pub fn orthonormalize(m: &Tensor2) -> Result<Tensor2> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(Error::singular("orientation SVD failed")),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        let col = -u_fixed.column(2);
        u_fixed.set_column(2, &col);
        r = u_fixed * v_t;
    }
    Ok(r)
}

/// 180° rotation about a unit axis: `2 n⊗n − I`.
pub fn half_turn(axis: &Axial) -> Tensor2 {
    let n = axis.normalize();
    2.0 * n * n.transpose() - Tensor2::identity()
}

/// Deviation of `m` from a proper rotation: `max(||mᵀm − I||, |det m − 1|)`.
pub fn orthogonality_error(m: &Tensor2) -> f64 {
    let gram = m.transpose() * m - Tensor2::identity();
    gram.norm().max((m.determinant() - 1.0).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_identity_angles() {
        let g = rotation_from_euler(0.0, 0.0, 0.0);
        assert_relative_eq!(g, Tensor2::identity(), epsilon = 1e-15);
    }

    #[test]
    fn test_euler_matrix_is_proper_rotation() {
        let g = rotation_from_euler(0.4, 1.2, 2.9);
        assert!(orthogonality_error(&g) < 1e-14);
    }

    #[test]
    fn test_euler_round_trip_random() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..200 {
            let g = rotation_from_euler(
                rng.gen_range(0.0..TAU),
                rng.gen_range(0.0..std::f64::consts::PI),
                rng.gen_range(0.0..TAU),
            );
            let (a, b, c) = euler_from_rotation(&g);
            let back = rotation_from_euler(a, b, c);
            assert_relative_eq!(back, g, epsilon = 1e-10);
            assert_relative_eq!(back * g.transpose(), Tensor2::identity(), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_euler_round_trip_degenerate() {
        for phi in [0.0, std::f64::consts::PI] {
            let g = rotation_from_euler(0.6, phi, 0.9);
            let (a, b, c) = euler_from_rotation(&g);
            assert_relative_eq!(rotation_from_euler(a, b, c), g, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_skew_axial_round_trip() {
        let w = Axial::new(0.1, -0.4, 0.25);
        assert_relative_eq!(axial(&skew(&w)), w, epsilon = 1e-15);
        let v = Axial::new(1.0, 2.0, 3.0);
        assert_relative_eq!(skew(&w) * v, w.cross(&v), epsilon = 1e-15);
    }

    #[test]
    fn test_exp_spin_is_rotation_about_axis() {
        let w = Axial::new(0.0, 0.0, 0.5);
        let r = exp_spin(&w);
        assert_relative_eq!(r[(0, 0)], 0.5_f64.cos(), epsilon = 1e-14);
        assert_relative_eq!(r[(1, 0)], 0.5_f64.sin(), epsilon = 1e-14);
        assert!(orthogonality_error(&r) < 1e-14);
        assert_relative_eq!(exp_spin(&Axial::zeros()), Tensor2::identity());
    }

    #[test]
    fn test_orthonormalize_removes_drift() {
        let g = rotation_from_euler(1.0, 0.5, 0.2);
        let drifted = g + Tensor2::from_fn(|i, j| 1e-4 * ((i + 2 * j) as f64).sin());
        let fixed = orthonormalize(&drifted).unwrap();
        assert!(orthogonality_error(&fixed) < 1e-12);
        assert_relative_eq!(fixed, g, epsilon = 1e-3);
    }

    #[test]
    fn test_orthonormalize_keeps_rotation_unchanged() {
        let g = rotation_from_euler(2.0, 0.3, 4.0);
        assert_relative_eq!(orthonormalize(&g).unwrap(), g, epsilon = 1e-13);
    }

    #[test]
    fn test_half_turn_is_proper_and_involutive() {
        let r = half_turn(&Axial::new(1.0, 1.0, 0.0));
        assert!(orthogonality_error(&r) < 1e-14);
        assert_relative_eq!(r * r, Tensor2::identity(), epsilon = 1e-14);
    }
}
