//! Crystal systems: lattice, elastic constants and deformation systems.
//!
//! A [`CrystalSystem`] is built once from a list of [`SystemFamily`]
//! representatives. Each family is expanded with the proper rotation group
//! of the lattice into its crystallographically equivalent systems. The
//! result is immutable and shared by every grain of the phase.

use crate::basis::tensor_to_b;
use crate::error::{Error, Result};
use crate::rotation::{axial, half_turn};
use crate::types::{deviatoric, Axial, DevVector, Tensor2};
use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Tolerance for comparing unit vectors and Schmid tensors during expansion.
const EQUIVALENCE_TOL: f64 = 1e-8;

/// Lattice type tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LatticeType {
    /// Cubic lattice, Miller indices `(hkl)[uvw]`.
    Cubic,
    /// Hexagonal lattice, Miller-Bravais indices `(hkil)[uvtw]`.
    Hexagonal { c_over_a: f64 },
    /// No symmetry expansion; systems are given in Cartesian crystal axes.
    Other,
}

impl LatticeType {
    /// Proper rotations of the lattice point group in crystal axes.
    pub fn rotations(&self) -> Vec<Tensor2> {
        match self {
            LatticeType::Cubic => cubic_rotations(),
            LatticeType::Hexagonal { .. } => hexagonal_rotations(),
            LatticeType::Other => vec![Tensor2::identity()],
        }
    }

    /// Cartesian plane normal (unnormalized) from lattice indices.
    pub fn plane_normal(&self, indices: &[f64]) -> Result<Axial> {
        match (self, indices.len()) {
            (LatticeType::Hexagonal { c_over_a }, 4) => {
                let (h, k, l) = (indices[0], indices[1], indices[3]);
                check_bravais_index(indices)?;
                Ok(Axial::new(h, (h + 2.0 * k) / 3.0_f64.sqrt(), l / c_over_a))
            }
            (LatticeType::Hexagonal { .. }, n) => Err(Error::InvalidCrystal(format!(
                "hexagonal planes need 4 Miller-Bravais indices, got {}",
                n
            ))),
            (_, 3) => Ok(Axial::new(indices[0], indices[1], indices[2])),
            (_, n) => Err(Error::InvalidCrystal(format!(
                "expected 3 Miller indices, got {}",
                n
            ))),
        }
    }

    /// Cartesian direction (unnormalized) from lattice indices.
    pub fn direction(&self, indices: &[f64]) -> Result<Axial> {
        match (self, indices.len()) {
            (LatticeType::Hexagonal { c_over_a }, 4) => {
                let (u, v, w) = (indices[0], indices[1], indices[3]);
                check_bravais_index(indices)?;
                Ok(Axial::new(
                    1.5 * u,
                    0.5 * 3.0_f64.sqrt() * (u + 2.0 * v),
                    w * c_over_a,
                ))
            }
            (LatticeType::Hexagonal { .. }, n) => Err(Error::InvalidCrystal(format!(
                "hexagonal directions need 4 Miller-Bravais indices, got {}",
                n
            ))),
            (_, 3) => Ok(Axial::new(indices[0], indices[1], indices[2])),
            (_, n) => Err(Error::InvalidCrystal(format!(
                "expected 3 Miller indices, got {}",
                n
            ))),
        }
    }
}

fn check_bravais_index(indices: &[f64]) -> Result<()> {
    if (indices[0] + indices[1] + indices[2]).abs() > 1e-9 {
        return Err(Error::InvalidCrystal(format!(
            "Miller-Bravais indices {:?} violate i = -(h + k)",
            indices
        )));
    }
    Ok(())
}

/// The 24 proper rotations of the cube: signed permutation matrices with det +1.
fn cubic_rotations() -> Vec<Tensor2> {
    const PERMUTATIONS: [[usize; 3]; 6] = [[0, 1, 2], [1, 2, 0], [2, 0, 1], [0, 2, 1], [2, 1, 0], [1, 0, 2]];
    let mut out = Vec::with_capacity(24);
    for perm in PERMUTATIONS {
        for signs in 0..8u8 {
            let mut r = Tensor2::zeros();
            for (row, &col) in perm.iter().enumerate() {
                r[(row, col)] = if signs & (1 << row) != 0 { -1.0 } else { 1.0 };
            }
            if r.determinant() > 0.0 {
                out.push(r);
            }
        }
    }
    out
}

/// The 12 proper rotations of point group 622.
fn hexagonal_rotations() -> Vec<Tensor2> {
    let mut out = Vec::with_capacity(12);
    for k in 0..6 {
        let (s, c) = (k as f64 * PI / 3.0).sin_cos();
        out.push(Tensor2::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0));
    }
    for k in 0..6 {
        let (s, c) = (k as f64 * PI / 6.0).sin_cos();
        out.push(half_turn(&Axial::new(c, s, 0.0)));
    }
    out
}

/// Slip or twin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FamilyKind {
    /// Bidirectional slip.
    Slip,
    /// Unidirectional twinning with characteristic shear.
    Twin { shear: f64 },
}

/// One family of crystallographically equivalent deformation systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFamily {
    /// Label used in reports.
    pub name: String,
    /// Plane indices (3 Miller or 4 Miller-Bravais).
    pub plane: Vec<f64>,
    /// Shear direction indices (3 Miller or 4 Miller-Bravais).
    pub direction: Vec<f64>,
    pub kind: FamilyKind,
    /// Reference shear rate γ̇0.
    pub reference_rate: f64,
    /// Rate-sensitivity exponent m, with stress exponent n = 1/m.
    pub rate_sensitivity: f64,
}

impl SystemFamily {
    /// Slip family with the given indices.
    pub fn slip(name: &str, plane: &[f64], direction: &[f64], reference_rate: f64, rate_sensitivity: f64) -> Self {
        Self {
            name: name.to_string(),
            plane: plane.to_vec(),
            direction: direction.to_vec(),
            kind: FamilyKind::Slip,
            reference_rate,
            rate_sensitivity,
        }
    }

    /// Twin family with the given indices and characteristic shear.
    pub fn twin(
        name: &str,
        plane: &[f64],
        direction: &[f64],
        shear: f64,
        reference_rate: f64,
        rate_sensitivity: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            plane: plane.to_vec(),
            direction: direction.to_vec(),
            kind: FamilyKind::Twin { shear },
            reference_rate,
            rate_sensitivity,
        }
    }

    pub fn is_twin(&self) -> bool {
        matches!(self.kind, FamilyKind::Twin { .. })
    }

    fn validate(&self) -> Result<()> {
        if !(self.reference_rate > 0.0) {
            return Err(Error::InvalidCrystal(format!(
                "family '{}': reference shear rate must be positive",
                self.name
            )));
        }
        if !(self.rate_sensitivity > 0.0 && self.rate_sensitivity <= 1.0) {
            return Err(Error::InvalidCrystal(format!(
                "family '{}': rate sensitivity must be in (0, 1], got {}",
                self.name, self.rate_sensitivity
            )));
        }
        if let FamilyKind::Twin { shear } = self.kind {
            if !(shear > 0.0) {
                return Err(Error::InvalidCrystal(format!(
                    "family '{}': twin shear must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One slip or twin system in crystal axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeformationSystem {
    /// Unit plane normal.
    pub normal: Axial,
    /// Unit shear direction.
    pub direction: Axial,
    /// Schmid tensor `sym(d ⊗ n)` in the b-basis (deviatoric).
    pub schmid: DevVector,
    /// Axial vector of `asym(d ⊗ n)`, the plastic spin per unit shear.
    pub spin: Axial,
    /// Index into [`CrystalSystem::families`].
    pub family: usize,
    /// Twin shear, `None` for slip.
    pub twin_shear: Option<f64>,
}

impl DeformationSystem {
    fn new(normal: Axial, direction: Axial, family: usize, twin_shear: Option<f64>) -> Self {
        let dn = direction * normal.transpose();
        Self {
            schmid: deviatoric(&tensor_to_b(&dn)),
            spin: axial(&dn),
            normal,
            direction,
            family,
            twin_shear,
        }
    }

    pub fn is_twin(&self) -> bool {
        self.twin_shear.is_some()
    }
}

/// A crystal type: lattice, elastic stiffness and deformation systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrystalSystem {
    pub name: String,
    pub lattice: LatticeType,
    /// Single-crystal elastic stiffness in Voigt notation (crystal axes).
    pub stiffness: Matrix6<f64>,
    pub families: Vec<SystemFamily>,
    /// Expanded systems, grouped by family in input order.
    pub systems: Vec<DeformationSystem>,
}

impl CrystalSystem {
    /// Build a crystal system, expanding every family by lattice symmetry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCrystal` if a family has invalid kinetics, its plane
    /// normal is not orthogonal to its shear direction, or the indices do
    /// not match the lattice type.
    pub fn new(name: &str, lattice: LatticeType, stiffness: Matrix6<f64>, families: Vec<SystemFamily>) -> Result<Self> {
        if let LatticeType::Hexagonal { c_over_a } = lattice {
            if !(c_over_a > 0.0) {
                return Err(Error::InvalidCrystal("c/a must be positive".into()));
            }
        }
        if families.is_empty() {
            return Err(Error::InvalidCrystal(format!("crystal '{}' has no deformation systems", name)));
        }

        let rotations = lattice.rotations();
        let mut systems = Vec::new();
        for (index, family) in families.iter().enumerate() {
            family.validate()?;
            let n = lattice.plane_normal(&family.plane)?;
            let d = lattice.direction(&family.direction)?;
            if n.norm() < EQUIVALENCE_TOL || d.norm() < EQUIVALENCE_TOL {
                return Err(Error::InvalidCrystal(format!("family '{}': zero plane or direction", family.name)));
            }
            let (n, d) = (n.normalize(), d.normalize());
            if n.dot(&d).abs() > 1e-6 {
                return Err(Error::InvalidCrystal(format!(
                    "family '{}': shear direction is not in the slip plane (n·d = {:.3e})",
                    family.name,
                    n.dot(&d)
                )));
            }

            let twin_shear = match family.kind {
                FamilyKind::Twin { shear } => Some(shear),
                FamilyKind::Slip => None,
            };
            let start = systems.len();
            for r in &rotations {
                let candidate = DeformationSystem::new(r * n, r * d, index, twin_shear);
                let duplicate = systems[start..].iter().any(|s: &DeformationSystem| {
                    let same = (s.schmid - candidate.schmid).norm() < EQUIVALENCE_TOL;
                    let opposite = (s.schmid + candidate.schmid).norm() < EQUIVALENCE_TOL;
                    same || (twin_shear.is_none() && opposite)
                });
                if !duplicate {
                    systems.push(candidate);
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            lattice,
            stiffness,
            families,
            systems,
        })
    }

    pub fn n_systems(&self) -> usize {
        self.systems.len()
    }

    /// Indices of the systems belonging to `family`.
    pub fn family_systems(&self, family: usize) -> impl Iterator<Item = usize> + '_ {
        self.systems
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.family == family)
            .map(|(i, _)| i)
    }

    /// Indices of all twin systems.
    pub fn twin_systems(&self) -> Vec<usize> {
        self.systems
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_twin())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_twins(&self) -> bool {
        self.systems.iter().any(|s| s.is_twin())
    }

    /// Largest stress exponent `n = 1/m` over all families.
    pub fn max_stress_exponent(&self) -> f64 {
        self.families
            .iter()
            .map(|f| 1.0 / f.rate_sensitivity)
            .fold(1.0, f64::max)
    }
}

/// Common crystal presets.
impl CrystalSystem {
    /// FCC {111}<110> slip (12 systems), copper elastic constants (GPa).
    pub fn fcc(reference_rate: f64, rate_sensitivity: f64) -> Result<Self> {
        Self::new(
            "fcc",
            LatticeType::Cubic,
            cubic_stiffness(168.4, 121.4, 75.4),
            vec![SystemFamily::slip(
                "{111}<110>",
                &[1.0, 1.0, 1.0],
                &[0.0, 1.0, -1.0],
                reference_rate,
                rate_sensitivity,
            )],
        )
    }

    /// BCC {110}<111> slip (12 systems), alpha-iron elastic constants (GPa).
    pub fn bcc(reference_rate: f64, rate_sensitivity: f64) -> Result<Self> {
        Self::new(
            "bcc",
            LatticeType::Cubic,
            cubic_stiffness(231.4, 134.7, 116.4),
            vec![SystemFamily::slip(
                "{110}<111>",
                &[1.0, 1.0, 0.0],
                &[1.0, -1.0, 1.0],
                reference_rate,
                rate_sensitivity,
            )],
        )
    }

    /// HCP with basal, prismatic and pyramidal <c+a> slip plus {10-12}
    /// tensile twinning. Magnesium elastic constants (GPa).
    pub fn hcp(c_over_a: f64, reference_rate: f64, rate_sensitivity: f64) -> Result<Self> {
        Self::new(
            "hcp",
            LatticeType::Hexagonal { c_over_a },
            hexagonal_stiffness(59.7, 26.2, 21.7, 61.7, 16.4),
            vec![
                SystemFamily::slip("basal", &[0.0, 0.0, 0.0, 1.0], &[2.0, -1.0, -1.0, 0.0], reference_rate, rate_sensitivity),
                SystemFamily::slip("prismatic", &[1.0, 0.0, -1.0, 0.0], &[-1.0, 2.0, -1.0, 0.0], reference_rate, rate_sensitivity),
                SystemFamily::slip(
                    "pyramidal<c+a>",
                    &[1.0, 1.0, -2.0, 2.0],
                    &[1.0, 1.0, -2.0, -3.0],
                    reference_rate,
                    rate_sensitivity,
                ),
                SystemFamily::twin(
                    "tensile twin",
                    &[1.0, 0.0, -1.0, 2.0],
                    &[-1.0, 0.0, 1.0, 1.0],
                    tensile_twin_shear(c_over_a),
                    reference_rate,
                    rate_sensitivity,
                ),
            ],
        )
    }
}

/// Characteristic shear of {10-12} twinning: `|3 − γ²| / (√3 γ)`, γ = c/a.
pub fn tensile_twin_shear(c_over_a: f64) -> f64 {
    (3.0 - c_over_a * c_over_a).abs() / (3.0_f64.sqrt() * c_over_a)
}

/// Cubic elastic stiffness in Voigt notation.
pub fn cubic_stiffness(c11: f64, c12: f64, c44: f64) -> Matrix6<f64> {
    Matrix6::new(
        c11, c12, c12, 0.0, 0.0, 0.0,
        c12, c11, c12, 0.0, 0.0, 0.0,
        c12, c12, c11, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, c44, 0.0, 0.0,
        0.0, 0.0, 0.0, 0.0, c44, 0.0,
        0.0, 0.0, 0.0, 0.0, 0.0, c44,
    )
}

/// Transversely isotropic (hexagonal) stiffness in Voigt notation, c along 3.
pub fn hexagonal_stiffness(c11: f64, c12: f64, c13: f64, c33: f64, c44: f64) -> Matrix6<f64> {
    let c66 = 0.5 * (c11 - c12);
    Matrix6::new(
        c11, c12, c13, 0.0, 0.0, 0.0,
        c12, c11, c13, 0.0, 0.0, 0.0,
        c13, c13, c33, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, c44, 0.0, 0.0,
        0.0, 0.0, 0.0, 0.0, c44, 0.0,
        0.0, 0.0, 0.0, 0.0, 0.0, c66,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::orthogonality_error;
    use approx::assert_relative_eq;

    #[test]
    fn test_point_groups_are_proper_and_closed() {
        for rotations in [cubic_rotations(), hexagonal_rotations()] {
            for r in &rotations {
                assert!(orthogonality_error(r) < 1e-12);
            }
            for a in &rotations {
                for b in &rotations {
                    let ab = a * b;
                    assert!(rotations.iter().any(|r| (r - ab).norm() < 1e-9));
                }
            }
        }
        assert_eq!(cubic_rotations().len(), 24);
        assert_eq!(hexagonal_rotations().len(), 12);
    }

    #[test]
    fn test_fcc_has_twelve_systems() {
        let fcc = CrystalSystem::fcc(1.0, 0.05).unwrap();
        assert_eq!(fcc.n_systems(), 12);
        for s in &fcc.systems {
            assert_relative_eq!(s.normal.dot(&s.direction), 0.0, epsilon = 1e-12);
            // Schmid tensor of a unit system has norm 1/√2.
            assert_relative_eq!(s.schmid.norm(), std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_bcc_has_twelve_systems() {
        assert_eq!(CrystalSystem::bcc(1.0, 0.05).unwrap().n_systems(), 12);
    }

    #[test]
    fn test_hcp_family_counts() {
        let hcp = CrystalSystem::hcp(1.624, 1.0, 0.05).unwrap();
        let counts: Vec<usize> = (0..hcp.families.len()).map(|f| hcp.family_systems(f).count()).collect();
        assert_eq!(counts, vec![3, 3, 6, 6]);
        assert_eq!(hcp.twin_systems().len(), 6);
        assert!(hcp.has_twins());
    }

    #[test]
    fn test_basal_system_geometry() {
        let hcp = CrystalSystem::hcp(1.624, 1.0, 0.05).unwrap();
        let basal: Vec<_> = hcp.family_systems(0).map(|i| &hcp.systems[i]).collect();
        for s in basal {
            assert_relative_eq!(s.normal.z.abs(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(s.direction.z, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_tensile_twin_shear_for_magnesium() {
        assert_relative_eq!(tensile_twin_shear(1.624), 0.1289, epsilon = 1e-3);
        assert_relative_eq!(tensile_twin_shear(3.0_f64.sqrt()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_orthogonal_system_rejected() {
        let result = CrystalSystem::new(
            "bad",
            LatticeType::Cubic,
            cubic_stiffness(1.0, 0.5, 0.3),
            vec![SystemFamily::slip("bad", &[1.0, 1.0, 1.0], &[1.0, 0.0, 0.0], 1.0, 0.05)],
        );
        assert!(matches!(result, Err(Error::InvalidCrystal(_))));
    }

    #[test]
    fn test_invalid_rate_sensitivity_rejected() {
        assert!(CrystalSystem::fcc(1.0, 0.0).is_err());
        assert!(CrystalSystem::fcc(1.0, 1.5).is_err());
        assert!(CrystalSystem::fcc(-1.0, 0.05).is_err());
    }

    #[test]
    fn test_bravais_index_checked() {
        let lattice = LatticeType::Hexagonal { c_over_a: 1.6 };
        assert!(lattice.plane_normal(&[1.0, 0.0, 0.0, 0.0]).is_err());
        assert!(lattice.direction(&[1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_max_stress_exponent() {
        let fcc = CrystalSystem::fcc(1.0, 0.05).unwrap();
        assert_relative_eq!(fcc.max_stress_exponent(), 20.0, epsilon = 1e-12);
    }
}
