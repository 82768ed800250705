//! Gauss-Legendre quadrature rules for the Green's function integral.
//!
//! Provides:
//! - n-point Gauss-Legendre rules on [-1, 1] for arbitrary n
//! - mapping onto an arbitrary interval
//! - composite rules over a list of panel breakpoints
//!
//! # Usage
//!
//! ```
//! use vpsc_core::eshelby::quadrature::{gauss_legendre, composite};
//!
//! // 4-point rule on [-1, 1]
//! let integral: f64 = gauss_legendre(4).iter().map(|&(x, w)| x * x * w).sum();
//! assert!((integral - 2.0 / 3.0).abs() < 1e-14);
//!
//! // Two panels on [0, 1], refined near 0.1
//! let rule = composite(&[0.0, 0.1, 1.0], 8);
//! assert_eq!(rule.len(), 16);
//! ```

use std::f64::consts::PI;

/// n-point Gauss-Legendre rule on [-1, 1] as (point, weight) pairs.
///
/// Nodes are the roots of the Legendre polynomial `P_n`, found by Newton
/// iteration from the Chebyshev-like initial guess; weights follow from
/// `w = 2 / ((1 − x²) P_n'(x)²)`. Points are returned in ascending order.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn gauss_legendre(n: usize) -> Vec<(f64, f64)> {
    assert!(n > 0, "gauss_legendre: n must be positive, got {}", n);
    let mut rule = vec![(0.0, 0.0); n];
    let half = (n + 1) / 2;

    for i in 0..half {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut derivative = 0.0;
        for _ in 0..100 {
            let (p, dp) = legendre_with_derivative(n, x);
            derivative = dp;
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let (_, dp) = legendre_with_derivative(n, x);
        if dp != 0.0 {
            derivative = dp;
        }
        let w = 2.0 / ((1.0 - x * x) * derivative * derivative);
        rule[i] = (-x, w);
        rule[n - 1 - i] = (x, w);
    }

    if n % 2 == 1 {
        rule[n / 2].0 = 0.0;
    }
    rule
}

/// Evaluate `P_n(x)` and `P_n'(x)` with the three-term recurrence.
fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let mut p0 = 1.0;
    let mut p1 = x;
    if n == 0 {
        return (1.0, 0.0);
    }
    for k in 2..=n {
        let kf = k as f64;
        let p2 = ((2.0 * kf - 1.0) * x * p1 - (kf - 1.0) * p0) / kf;
        p0 = p1;
        p1 = p2;
    }
    let dp = n as f64 * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

/// n-point rule mapped onto `[a, b]`.
pub fn gauss_legendre_on(n: usize, a: f64, b: f64) -> Vec<(f64, f64)> {
    let half = 0.5 * (b - a);
    let mid = 0.5 * (a + b);
    gauss_legendre(n)
        .into_iter()
        .map(|(x, w)| (mid + half * x, half * w))
        .collect()
}

/// Composite rule: `n` Gauss points on each panel between consecutive breakpoints.
///
/// Breakpoints must be ascending; zero-width panels are skipped.
pub fn composite(breakpoints: &[f64], n: usize) -> Vec<(f64, f64)> {
    let mut rule = Vec::with_capacity(n * breakpoints.len().saturating_sub(1));
    for pair in breakpoints.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a <= 0.0 {
            continue;
        }
        rule.extend(gauss_legendre_on(n, a, b));
    }
    rule
}

/// Sort, clip to `[lo, hi]` and deduplicate candidate breakpoints.
///
/// The interval ends are always included.
pub fn breakpoints(lo: f64, hi: f64, candidates: &[f64]) -> Vec<f64> {
    let mut points: Vec<f64> = candidates
        .iter()
        .copied()
        .filter(|&x| x > lo && x < hi && x.is_finite())
        .collect();
    points.push(lo);
    points.push(hi);
    points.sort_by(|a, b| a.total_cmp(b));
    let tol = 1e-12 * (hi - lo).abs().max(1.0);
    points.dedup_by(|a, b| (*a - *b).abs() < tol);
    points
}
