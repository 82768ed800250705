//! Discrete textures: orientation sampling and snapshots.

use crate::rotation::{euler_from_rotation, rotation_from_euler};
use crate::types::Tensor2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// One grain of a texture snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureEntry {
    pub phase: usize,
    pub grain: usize,
    /// Bunge Euler angles (φ1, Φ, φ2) in degrees.
    pub euler: [f64; 3],
    /// Volume fraction in the aggregate.
    pub weight: f64,
    /// Ellipsoid semi-axes.
    pub axes: [f64; 3],
}

impl TextureEntry {
    pub fn new(phase: usize, grain: usize, orientation: &Tensor2, weight: f64, axes: [f64; 3]) -> Self {
        let (a, b, c) = euler_from_rotation(orientation);
        Self {
            phase,
            grain,
            euler: [a.to_degrees(), b.to_degrees(), c.to_degrees()],
            weight,
            axes,
        }
    }
}

/// `n` orientations uniformly distributed on SO(3).
///
/// `φ1, φ2` are uniform on `[0, 2π)` and `cos Φ` uniform on `[−1, 1]`,
/// which gives the invariant (Haar) measure.
pub fn random_orientations(n: usize, seed: u64) -> Vec<Tensor2> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let phi1 = rng.gen_range(0.0..TAU);
            let big_phi = rng.gen_range(-1.0_f64..1.0).acos();
            let phi2 = rng.gen_range(0.0..TAU);
            rotation_from_euler(phi1, big_phi, phi2)
        })
        .collect()
}

/// Orientations from Bunge Euler angles in degrees.
pub fn from_euler_degrees(angles: &[[f64; 3]]) -> Vec<Tensor2> {
    angles
        .iter()
        .map(|a| rotation_from_euler(a[0].to_radians(), a[1].to_radians(), a[2].to_radians()))
        .collect()
}
