//! Core data types for the VPSC solver.
//!
//! All solver-internal tensors live in the orthonormal b-basis defined in
//! [`crate::basis`]: symmetric second-order tensors are 6-vectors whose
//! first five components span the deviatoric subspace and whose sixth
//! component is the normalized trace. Viscous moduli act on the
//! deviatoric subspace only and are therefore 5×5.

use nalgebra::{Matrix3, Matrix5, Matrix6, SMatrix, Vector3, Vector5, Vector6};

/// Second-order tensor in Cartesian components.
pub type Tensor2 = Matrix3<f64>;

/// Axial vector of an antisymmetric tensor.
pub type Axial = Vector3<f64>;

/// Symmetric tensor in the b-basis (5 deviatoric + 1 hydrostatic).
pub type BVector = Vector6<f64>;

/// Deviatoric part of a symmetric tensor in the b-basis.
pub type DevVector = Vector5<f64>;

/// Fourth-order tensor with minor symmetries in the b-basis.
pub type BMatrix = Matrix6<f64>;

/// Deviatoric fourth-order operator (viscous compliance or stiffness).
pub type DevMatrix = Matrix5<f64>;

/// Operator from deviatoric 5-vectors to axial spin vectors.
pub type SpinOperator = SMatrix<f64, 3, 5>;

/// Fourth-order tensor in Cartesian components.
pub type Tensor4 = [[[[f64; 3]; 3]; 3]; 3];

/// Zero-initialized fourth-order tensor.
pub fn tensor4_zeros() -> Tensor4 {
    [[[[0.0; 3]; 3]; 3]; 3]
}

/// Extract the deviatoric 5-vector from a b-basis 6-vector.
#[inline]
pub fn deviatoric(v: &BVector) -> DevVector {
    v.fixed_rows::<5>(0).into_owned()
}

/// Assemble a b-basis 6-vector from deviatoric part and hydrostatic component.
#[inline]
pub fn with_hydrostatic(dev: &DevVector, hydrostatic: f64) -> BVector {
    BVector::new(dev[0], dev[1], dev[2], dev[3], dev[4], hydrostatic)
}

/// Von Mises equivalent stress `sqrt(3/2 s:s)` of a b-basis stress.
///
/// The b-basis is orthonormal, so `s:s` is the squared norm of the
/// deviatoric components.
pub fn von_mises_stress(stress: &BVector) -> f64 {
    (1.5 * deviatoric(stress).norm_squared()).sqrt()
}

/// Von Mises equivalent strain rate `sqrt(2/3 d:d)` of a b-basis strain rate.
pub fn von_mises_strain_rate(strain_rate: &BVector) -> f64 {
    (2.0 / 3.0 * deviatoric(strain_rate).norm_squared()).sqrt()
}

/// Mean (hydrostatic) value of a b-basis tensor: `tr(T)/3`.
pub fn hydrostatic(v: &BVector) -> f64 {
    v[5] / 3.0_f64.sqrt()
}
