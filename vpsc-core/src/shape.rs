//! Ellipsoidal grain morphology and its evolution.
//!
//! A grain shape is stored as semi-axes `a_i` and a rotation `E` whose rows
//! are the principal directions in sample axes. The shape tensor
//! `Q = Eᵀ diag(a²) E` is convected by the incremental deformation gradient
//! `F = I + L dt` as `Q' = F Q Fᵀ`; the new axes and directions follow from
//! its eigen-decomposition.

use crate::error::{Error, Result};
use crate::rotation::orthogonality_error;
use crate::types::Tensor2;
use nalgebra::{SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

/// Ellipsoid semi-axes and principal directions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    pub axes: Vector3<f64>,
    /// Rows are the principal directions in sample axes.
    pub orientation: Tensor2,
}

impl Default for Ellipsoid {
    fn default() -> Self {
        Self::sphere()
    }
}

impl Ellipsoid {
    /// Unit sphere.
    pub fn sphere() -> Self {
        Self {
            axes: Vector3::new(1.0, 1.0, 1.0),
            orientation: Tensor2::identity(),
        }
    }

    pub fn new(axes: Vector3<f64>, orientation: Tensor2) -> Result<Self> {
        if axes.iter().any(|&a| !(a > 0.0) || !a.is_finite()) {
            return Err(Error::InvalidState(format!(
                "ellipsoid semi-axes must be positive, got {:?}",
                axes.as_slice()
            )));
        }
        if orthogonality_error(&orientation) > 1e-8 {
            return Err(Error::InvalidState("ellipsoid orientation is not a rotation".into()));
        }
        Ok(Self { axes, orientation })
    }

    /// Ratio of the longest to the shortest axis.
    pub fn aspect_ratio(&self) -> f64 {
        self.axes.max() / self.axes.min()
    }

    /// `Q = Eᵀ diag(a²) E`.
    pub fn shape_tensor(&self) -> Tensor2 {
        let a2 = Tensor2::from_diagonal(&self.axes.component_mul(&self.axes));
        self.orientation.transpose() * a2 * self.orientation
    }

    /// Recover axes (sorted descending) and directions from a shape tensor.
    pub fn from_shape_tensor(q: &Tensor2) -> Result<Self> {
        let symmetric = 0.5 * (q + q.transpose());
        let eigen = SymmetricEigen::new(symmetric);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&i, &j| eigen.eigenvalues[j].total_cmp(&eigen.eigenvalues[i]));

        let mut axes = Vector3::zeros();
        let mut orientation = Tensor2::zeros();
        for (row, &k) in order.iter().enumerate() {
            let lambda = eigen.eigenvalues[k];
            if !(lambda > 0.0) {
                return Err(Error::singular("shape tensor is not positive definite"));
            }
            axes[row] = lambda.sqrt();
            orientation.set_row(row, &eigen.eigenvectors.column(k).transpose());
        }
        if orientation.determinant() < 0.0 {
            let flipped = -orientation.row(2);
            orientation.set_row(2, &flipped);
        }
        Ok(Self { axes, orientation })
    }

    /// Convect the ellipsoid with velocity gradient `l` over `dt`.
    pub fn deform(&self, l: &Tensor2, dt: f64) -> Result<Self> {
        let f = Tensor2::identity() + l * dt;
        Self::from_shape_tensor(&(f * self.shape_tensor() * f.transpose()))
    }

    /// Index of the longest axis.
    pub fn longest_axis(&self) -> usize {
        self.axes.imax()
    }

    /// One of `pieces` equal-volume fragments cut across the longest axis.
    pub fn fragment(&self, pieces: usize) -> Self {
        let mut piece = *self;
        let k = self.longest_axis();
        piece.axes[k] /= pieces.max(1) as f64;
        piece
    }

    /// Axes normalized to unit product (equal-volume sphere has unit axes).
    pub fn normalized(&self) -> Self {
        let scale = self.axes.product().cbrt();
        Self {
            axes: self.axes / scale,
            orientation: self.orientation,
        }
    }
}

/// Grain-shape evolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeMode {
    /// Shapes never change.
    Fixed,
    /// One ellipsoid per phase, convected by the macroscopic velocity
    /// gradient until the critical aspect ratio is reached.
    PhaseAverage,
    /// Each grain convected by its own velocity gradient.
    PerGrain,
}

/// Shape-control configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeConfig {
    pub mode: ShapeMode,
    /// Aspect ratio at which a shape freezes (or fragments).
    pub critical_aspect_ratio: f64,
    /// Split grains exceeding the critical ratio (per-grain mode only).
    pub fragmentation: bool,
    /// Number of fragments per split.
    pub fragments: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            mode: ShapeMode::PhaseAverage,
            critical_aspect_ratio: 25.0,
            fragmentation: false,
            fragments: 2,
        }
    }
}

impl ShapeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.critical_aspect_ratio > 1.0) {
            return Err(Error::InvalidConfig("critical aspect ratio must exceed 1".into()));
        }
        if self.fragmentation && self.fragments < 2 {
            return Err(Error::InvalidConfig("fragmentation needs at least 2 fragments".into()));
        }
        Ok(())
    }
}

/// Outcome of one shape update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapeUpdate {
    Unchanged,
    Deformed(Ellipsoid),
    /// Shape reached the critical ratio and stays frozen.
    Frozen,
    /// Grain must be split into fragments with this shape.
    Fragment(Ellipsoid),
}

/// Advance one ellipsoid with velocity gradient `l` over `dt`.
pub fn evolve(shape: &Ellipsoid, l: &Tensor2, dt: f64, config: &ShapeConfig, allow_fragments: bool) -> Result<ShapeUpdate> {
    if config.mode == ShapeMode::Fixed {
        return Ok(ShapeUpdate::Unchanged);
    }
    if shape.aspect_ratio() >= config.critical_aspect_ratio {
        if allow_fragments && config.fragmentation {
            return Ok(ShapeUpdate::Fragment(shape.fragment(config.fragments)));
        }
        return Ok(ShapeUpdate::Frozen);
    }
    Ok(ShapeUpdate::Deformed(shape.deform(l, dt)?))
}
