//! Fixed-basis conversions between tensor representations.
//!
//! Two conventions coexist and must not be mixed:
//!
//! - The **b-basis**: six orthonormal symmetric tensors `B_n`, the first
//!   five traceless and the sixth `I/√3`. A symmetric tensor `T` maps to
//!   `x_n = T : B_n`. Because the basis is orthonormal, stress-like and
//!   strain-like tensors use the same map, double contractions become dot
//!   products, and Frobenius norms are Euclidean norms. Every solver
//!   module works in this basis.
//! - **Voigt** vectors ordered (11, 22, 33, 23, 13, 12), used only at the
//!   collaborator boundary (elastic constants, reports). Strain-like
//!   quantities carry the engineering factor 2 on shear components,
//!   stress-like quantities do not.

use crate::types::{BMatrix, BVector, DevMatrix, Tensor2, Tensor4, tensor4_zeros};
use nalgebra::{Matrix6, SMatrix, Vector6};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_1_SQRT_2;

const INV_SQRT6: f64 = 0.408_248_290_463_863_f64;
const TWO_INV_SQRT6: f64 = 0.816_496_580_927_726_f64;
const INV_SQRT3: f64 = 0.577_350_269_189_625_8_f64;

/// Below this combined magnitude two tensors are treated as both zero.
pub const MISMATCH_FLOOR: f64 = 1e-30;

/// The b-basis tensors.
#[rustfmt::skip]
pub const B: [Tensor2; 6] = [
    Tensor2::new(
        -FRAC_1_SQRT_2, 0.0, 0.0,
        0.0, FRAC_1_SQRT_2, 0.0,
        0.0, 0.0, 0.0,
    ),
    Tensor2::new(
        -INV_SQRT6, 0.0, 0.0,
        0.0, -INV_SQRT6, 0.0,
        0.0, 0.0, TWO_INV_SQRT6,
    ),
    Tensor2::new(
        0.0, 0.0, 0.0,
        0.0, 0.0, FRAC_1_SQRT_2,
        0.0, FRAC_1_SQRT_2, 0.0,
    ),
    Tensor2::new(
        0.0, 0.0, FRAC_1_SQRT_2,
        0.0, 0.0, 0.0,
        FRAC_1_SQRT_2, 0.0, 0.0,
    ),
    Tensor2::new(
        0.0, FRAC_1_SQRT_2, 0.0,
        FRAC_1_SQRT_2, 0.0, 0.0,
        0.0, 0.0, 0.0,
    ),
    Tensor2::new(
        INV_SQRT3, 0.0, 0.0,
        0.0, INV_SQRT3, 0.0,
        0.0, 0.0, INV_SQRT3,
    ),
];

/// Index pairs of the Voigt components (11, 22, 33, 23, 13, 12).
pub const VOIGT_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (1, 2), (0, 2), (0, 1)];

/// Which scaling a Voigt vector carries on its shear components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoigtKind {
    /// Tensor components as-is (stresses).
    Stress,
    /// Engineering shears `γ_ij = 2 ε_ij` (strains, strain rates).
    Strain,
}

impl VoigtKind {
    fn shear_factor(self) -> f64 {
        match self {
            VoigtKind::Stress => 1.0,
            VoigtKind::Strain => 2.0,
        }
    }
}

/// Project a second-order tensor onto the b-basis.
///
/// Only the symmetric part contributes.
pub fn tensor_to_b(t: &Tensor2) -> BVector {
    BVector::from_fn(|n, _| t.component_mul(&B[n]).sum())
}

/// Rebuild the symmetric tensor from its b-basis components.
pub fn b_to_tensor(x: &BVector) -> Tensor2 {
    let mut t = Tensor2::zeros();
    for n in 0..6 {
        t += B[n] * x[n];
    }
    t
}

/// Convert a b-basis 6×6 operator into a Cartesian fourth-order tensor.
pub fn b_to_tensor4(c: &BMatrix) -> Tensor4 {
    let mut t4 = tensor4_zeros();
    for n in 0..6 {
        for m in 0..6 {
            let cnm = c[(n, m)];
            if cnm == 0.0 {
                continue;
            }
            for i in 0..3 {
                for j in 0..3 {
                    let bij = B[n][(i, j)];
                    if bij == 0.0 {
                        continue;
                    }
                    for k in 0..3 {
                        for l in 0..3 {
                            t4[i][j][k][l] += cnm * bij * B[m][(k, l)];
                        }
                    }
                }
            }
        }
    }
    t4
}

/// Convert a Cartesian fourth-order tensor into its b-basis 6×6 form.
pub fn tensor4_to_b(t4: &Tensor4) -> BMatrix {
    BMatrix::from_fn(|n, m| {
        let mut sum = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                let bij = B[n][(i, j)];
                if bij == 0.0 {
                    continue;
                }
                for k in 0..3 {
                    for l in 0..3 {
                        sum += bij * t4[i][j][k][l] * B[m][(k, l)];
                    }
                }
            }
        }
        sum
    })
}

/// Embed a deviatoric 5×5 operator into the 6×6 b-basis form.
pub fn embed_deviatoric(m: &DevMatrix) -> BMatrix {
    let mut full = BMatrix::zeros();
    full.fixed_view_mut::<5, 5>(0, 0).copy_from(m);
    full
}

/// Deviatoric 5×5 block of a 6×6 b-basis operator.
pub fn deviatoric_block(m: &BMatrix) -> DevMatrix {
    m.fixed_view::<5, 5>(0, 0).into_owned()
}

/// Orthogonal 6×6 matrix `Q` with `tensor_to_b(R T Rᵀ) = Q tensor_to_b(T)`.
///
/// `Q` is block diagonal: the hydrostatic component is invariant.
pub fn basis_rotation(r: &Tensor2) -> BMatrix {
    let rotated: [Tensor2; 6] = std::array::from_fn(|m| r * B[m] * r.transpose());
    BMatrix::from_fn(|n, m| B[n].component_mul(&rotated[m]).sum())
}

/// Rotate a b-basis operator: `C' = Q C Qᵀ`.
pub fn rotate_operator(c: &BMatrix, r: &Tensor2) -> BMatrix {
    let q = basis_rotation(r);
    q * c * q.transpose()
}

/// Double contraction `A : X` of a Cartesian fourth-order tensor with a
/// second-order tensor.
pub fn contract4(a: &Tensor4, x: &Tensor2) -> Tensor2 {
    Tensor2::from_fn(|i, j| {
        let mut sum = 0.0;
        for k in 0..3 {
            for l in 0..3 {
                sum += a[i][j][k][l] * x[(k, l)];
            }
        }
        sum
    })
}

/// Symmetric tensor to Voigt 6-vector with the given shear scaling.
pub fn tensor_to_voigt(t: &Tensor2, kind: VoigtKind) -> Vector6<f64> {
    let f = kind.shear_factor();
    Vector6::from_fn(|k, _| {
        let (i, j) = VOIGT_PAIRS[k];
        if i == j {
            t[(i, j)]
        } else {
            0.5 * f * (t[(i, j)] + t[(j, i)])
        }
    })
}

/// Voigt 6-vector back to the symmetric tensor.
pub fn voigt_to_tensor(v: &Vector6<f64>, kind: VoigtKind) -> Tensor2 {
    let f = kind.shear_factor();
    let mut t = Tensor2::zeros();
    for (k, &(i, j)) in VOIGT_PAIRS.iter().enumerate() {
        if i == j {
            t[(i, i)] = v[k];
        } else {
            t[(i, j)] = v[k] / f;
            t[(j, i)] = v[k] / f;
        }
    }
    t
}

/// Matrix `P` with `tensor_to_b(T) = P · tensor_to_voigt(T, Strain)`.
///
/// Its inverse is `D Pᵀ` with `D = diag(1, 1, 1, 2, 2, 2)`.
fn strain_voigt_to_b() -> Matrix6<f64> {
    Matrix6::from_fn(|n, k| {
        let (i, j) = VOIGT_PAIRS[k];
        B[n][(i, j)]
    })
}

/// Convert a Voigt stiffness (`σ_v = C ε_v`, engineering shears) to the b-basis.
pub fn voigt_stiffness_to_b(c: &Matrix6<f64>) -> BMatrix {
    let p = strain_voigt_to_b();
    let d = Matrix6::from_diagonal(&Vector6::new(1.0, 1.0, 1.0, 2.0, 2.0, 2.0));
    p * d * c * d * p.transpose()
}

/// Convert a b-basis stiffness back to the Voigt convention.
pub fn b_stiffness_to_voigt(c: &BMatrix) -> Matrix6<f64> {
    let p = strain_voigt_to_b();
    p.transpose() * c * p
}

/// Frobenius norm of a second-order tensor.
pub fn frobenius_norm(t: &Tensor2) -> f64 {
    t.norm()
}

/// Relative mismatch `||a − b|| / (||a|| + ||b||)`.
///
/// Returns 0 when both operands are (near) zero. The value lies in [0, 1].
pub fn relative_mismatch<const R: usize, const C: usize>(
    a: &SMatrix<f64, R, C>,
    b: &SMatrix<f64, R, C>,
) -> f64 {
    let denom = a.norm() + b.norm();
    if denom < MISMATCH_FLOOR {
        return 0.0;
    }
    (a - b).norm() / denom
}
