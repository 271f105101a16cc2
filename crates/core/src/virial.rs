//! Scaled constraint virial accumulator.
//!
//! Each constraint contributes `r0 * lambda * (r ⊗ r)`, where `r` is the
//! normalized reference bond direction and `lambda` the mass-scaled Lagrange
//! multiplier. The sum is symmetric by construction. Results from different
//! reduction orders agree only up to floating-point rounding.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Symmetric 3×3 scaled virial tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Virial(pub [[f64; 3]; 3]);

impl Virial {
    pub fn zero() -> Self {
        Self::default()
    }

    /// `self += s * (r ⊗ r)`
    #[inline]
    pub fn add_outer(&mut self, s: f64, r: &[f64; 3]) {
        for i in 0..3 {
            for j in 0..3 {
                self.0[i][j] += s * r[i] * r[j];
            }
        }
    }

    /// Expand the packed upper triangle `[XX, XY, XZ, YY, YZ, ZZ]`.
    pub fn from_packed(p: [f64; 6]) -> Self {
        Self([[p[0], p[1], p[2]], [p[1], p[3], p[4]], [p[2], p[4], p[5]]])
    }

    /// Packed upper triangle `[XX, XY, XZ, YY, YZ, ZZ]`.
    pub fn to_packed(&self) -> [f64; 6] {
        let m = &self.0;
        [m[0][0], m[0][1], m[0][2], m[1][1], m[1][2], m[2][2]]
    }

    pub fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.0
    }

    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        let m = &self.0;
        (m[0][1] - m[1][0]).abs() <= tolerance
            && (m[0][2] - m[2][0]).abs() <= tolerance
            && (m[1][2] - m[2][1]).abs() <= tolerance
    }

    /// Largest absolute difference between corresponding elements.
    pub fn max_abs_diff(&self, other: &Virial) -> f64 {
        let mut max: f64 = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                max = max.max((self.0[i][j] - other.0[i][j]).abs());
            }
        }
        max
    }

    /// Physical constraint virial `-0.5 * scaled / dt²`.
    pub fn to_constraint_virial(&self, dt: f64) -> [[f64; 3]; 3] {
        let factor = -0.5 / (dt * dt);
        let mut out = [[0.0; 3]; 3];
        for (row_out, row) in out.iter_mut().zip(&self.0) {
            for (o, v) in row_out.iter_mut().zip(row) {
                *o = factor * v;
            }
        }
        out
    }
}

impl AddAssign for Virial {
    fn add_assign(&mut self, rhs: Self) {
        for i in 0..3 {
            for j in 0..3 {
                self.0[i][j] += rhs.0[i][j];
            }
        }
    }
}

impl Add for Virial {
    type Output = Virial;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sum for Virial {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Virial::zero(), Add::add)
    }
}
